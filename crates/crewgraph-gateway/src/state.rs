use std::sync::Arc;

use crewgraph_core::config::{GatewayConfig, TopicsConfig};
use crewgraph_core::traits::{MessageBroker, StatusStore};
use crewgraph_session::SessionManager;

/// Shared application state for axum handlers.
pub struct AppState {
    pub config: GatewayConfig,
    pub topics: TopicsConfig,
    pub broker: Arc<dyn MessageBroker>,
    pub status: Arc<dyn StatusStore>,
    pub sessions: Arc<SessionManager>,
}
