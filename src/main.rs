mod api;
mod config;
mod error;
mod exam;
mod session;
mod signaling;
mod violation;

use config::Config;
use exam::ExamServer;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env();
    let server = ExamServer::new(config.signaling.clone());
    server.clone().start_maintenance();

    let routes = api::routes::proctor_routes(server);

    tracing::info!(address = %format!("{}:{}", config.server.host, config.server.port), "Proctoring server listening");

    warp::serve(routes)
        .run(config.bind_address())
        .await;
}
