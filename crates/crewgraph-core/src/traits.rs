use std::collections::HashMap;

use futures::future::BoxFuture;
use futures::stream::BoxStream;

use crate::error::Result;
use crate::schema::CrewNodeSpec;
use crate::stop::StopEvent;
use crate::types::*;

/// Sandboxed script execution service.
pub trait ScriptExecutor: Send + Sync + 'static {
    /// Run one snippet. A non-zero `return_code` is reported, not raised.
    fn execute(&self, request: ScriptRequest) -> BoxFuture<'_, Result<ScriptResponse>>;
}

/// Remote coding-agent service, session oriented.
pub trait CodeAgentService: Send + Sync + 'static {
    /// Create a session with the given title.
    fn create_session(&self, title: &str) -> BoxFuture<'_, Result<AgentSession>>;

    /// List all sessions.
    fn list_sessions(&self) -> BoxFuture<'_, Result<Vec<AgentSession>>>;

    /// All messages of a session, oldest first.
    fn messages(&self, session_id: &str) -> BoxFuture<'_, Result<Vec<AgentMessage>>>;

    /// Post a prompt. Resolves once the service accepted (or answered) it.
    fn send_message(&self, session_id: &str, prompt: AgentPrompt) -> BoxFuture<'_, Result<()>>;

    /// Busy/idle state per session id. Sessions absent from the map are idle.
    fn session_status(&self) -> BoxFuture<'_, Result<HashMap<String, AgentSessionStatus>>>;

    /// Abort whatever the session is doing.
    fn abort(&self, session_id: &str) -> BoxFuture<'_, Result<()>>;
}

/// Multi-agent crew runtime.
pub trait CrewRunner: Send + Sync + 'static {
    fn run_crew(
        &self,
        spec: CrewNodeSpec,
        inputs: serde_json::Map<String, serde_json::Value>,
        stop: StopEvent,
    ) -> BoxFuture<'_, Result<serde_json::Value>>;
}

/// Pub/sub transport for the control, telemetry and status channels.
pub trait MessageBroker: Send + Sync + 'static {
    fn publish(&self, topic: &str, payload: serde_json::Value) -> BoxFuture<'_, Result<()>>;

    /// Messages published to `topic` after this call.
    fn subscribe(&self, topic: &str) -> BoxFuture<'_, Result<BoxStream<'static, BrokerMessage>>>;
}

/// Run status store: terminal statuses are written here.
pub trait StatusStore: Send + Sync + 'static {
    fn set_status(&self, update: StatusUpdate) -> BoxFuture<'_, Result<()>>;

    fn get_status(&self, run_id: &RunId) -> BoxFuture<'_, Result<Option<StatusUpdate>>>;
}
