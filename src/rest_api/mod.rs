//! HTTP endpoints for probes and Prometheus scraping

mod handlers;
mod server;

pub use handlers::HealthResponse;
pub use server::{router, run_server};
