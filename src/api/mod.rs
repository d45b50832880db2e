pub mod routes;
mod websocket;
