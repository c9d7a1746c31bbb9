use thiserror::Error;

use crate::types::RunStatus;

#[derive(Debug, Error)]
pub enum CrewGraphError {
    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Graph structure errors (compile time or routing time)
    #[error("Graph error: {0}")]
    Graph(String),

    #[error("No route for code '{route_code}' in decision table '{table}'")]
    RouteNotFound { table: String, route_code: String },

    // Execution errors
    #[error("Script execution failed in node '{node}' (return code {return_code}): {stderr}")]
    ScriptExecution {
        node: String,
        return_code: i32,
        stderr: String,
    },

    #[error("Remote service error: {0}")]
    RemoteService(String),

    #[error("Expression error: {0}")]
    Expression(String),

    #[error("Crew execution failed: {0}")]
    Crew(String),

    // Cooperative cancellation, not a failure
    #[error("Run cancelled ({0})")]
    Cancelled(RunStatus),

    // Messaging errors
    #[error("Broker error: {0}")]
    Broker(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CrewGraphError {
    /// Whether this error is a stop/expire signal rather than a failure.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, CrewGraphError::Cancelled(_))
    }

    /// Whether this error is a structural problem in the workflow definition.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            CrewGraphError::Config(_)
                | CrewGraphError::ConfigNotFound(_)
                | CrewGraphError::Graph(_)
                | CrewGraphError::RouteNotFound { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, CrewGraphError>;
