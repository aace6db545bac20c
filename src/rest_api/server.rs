//! Axum HTTP server for probes and metrics

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{routing::get, Router};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::controller::ControllerState;
use crate::{Error, Result};

use super::handlers;

pub fn router(state: Arc<ControllerState>) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/metrics", get(handlers::metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve `/health` and `/metrics` on `addr` until the process exits
pub async fn run_server(state: Arc<ControllerState>, addr: SocketAddr) -> Result<()> {
    let app = router(state);

    info!("HTTP server listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::ConfigError(format!("Failed to bind to {}: {}", addr, e)))?;

    axum::serve(listener, app)
        .await
        .map_err(|e| Error::ConfigError(format!("Server error: {}", e)))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ControllerConfig;
    use crate::controller::fake::{test_state, FakeRegistry, FakeStore};
    use crate::rest_api::HealthResponse;

    #[tokio::test]
    async fn test_health_reports_leadership() {
        let ctx = Arc::new(test_state(
            Arc::new(FakeStore::new()),
            Arc::new(FakeRegistry::new()),
            ControllerConfig::default(),
        ));

        let axum::Json(body) = handlers::health(axum::extract::State(ctx)).await;
        assert_eq!(
            body,
            HealthResponse {
                status: "healthy".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                leader: true,
            }
        );
    }

    #[tokio::test]
    async fn test_metrics_are_exposed() {
        crate::controller::metrics::inc_state_transition("detaching");

        let body = handlers::metrics().await.unwrap();
        assert!(body.contains("node_detacher_state_transitions_total"));
    }
}
