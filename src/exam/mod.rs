mod server;

pub use server::{ExamEvent, ExamServer};
