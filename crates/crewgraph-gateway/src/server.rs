use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::routes;
use crate::state::AppState;

/// HTTP ingress built on axum. Every mutating call becomes a broker message.
pub struct GatewayServer {
    state: Arc<AppState>,
}

impl GatewayServer {
    /// Create a new gateway server.
    pub fn new(state: AppState) -> Self {
        Self {
            state: Arc::new(state),
        }
    }

    /// Build the axum router with all API routes.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/api/health", get(routes::health))
            .route("/api/runs", get(routes::list_runs).post(routes::submit_run))
            .route("/api/runs/{id}", get(routes::run_status))
            .route("/api/runs/{id}/stop", post(routes::stop_run))
            .route("/api/runs/{id}/timeout", post(routes::timeout_run))
            .layer(CorsLayer::permissive())
            .with_state(Arc::clone(&self.state))
    }

    /// Run the gateway server until the cancellation token is triggered.
    pub async fn run(&self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let app = self.router();
        let bind = &self.state.config.bind;
        let listener = TcpListener::bind(bind).await?;
        info!(bind = %bind, "Gateway listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;

        info!("Gateway shut down");
        Ok(())
    }
}
