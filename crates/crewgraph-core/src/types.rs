use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique run identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub String);

impl RunId {
    /// Generate a new random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Wrap an externally supplied id.
    pub fn from_string(s: &str) -> Self {
        Self(s.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Status values written to the run status store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Run,
    End,
    Error,
    Stop,
    Expired,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Run => "run",
            Self::End => "end",
            Self::Error => "error",
            Self::Stop => "stop",
            Self::Expired => "expired",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Run)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Discriminator carried by every telemetry message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Start,
    Finish,
    Error,
    CodeAgentStream,
    GraphEnd,
}

/// One telemetry message, published for every node start/finish/error,
/// every streamed code-agent update, and once at the end of each run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryEvent {
    pub id: String,
    pub run_id: RunId,
    pub node_name: String,
    pub message_type: MessageType,
    /// Name of the enclosing subgraph node, `None` for the root graph.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subgraph: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<usize>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl TelemetryEvent {
    /// Create an event stamped with a fresh id and the current time.
    pub fn new(
        run_id: &RunId,
        node_name: impl Into<String>,
        message_type: MessageType,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            run_id: run_id.clone(),
            node_name: node_name.into(),
            message_type,
            subgraph: None,
            step: None,
            timestamp: Utc::now(),
            payload,
        }
    }

    /// Attach the step counter of the emitting run.
    pub fn with_step(mut self, step: usize) -> Self {
        self.step = Some(step);
        self
    }

    /// Attach the subgraph path, if any.
    pub fn with_subgraph(mut self, subgraph: Option<String>) -> Self {
        self.subgraph = subgraph;
        self
    }
}

/// Terminal (or running) status update for one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub run_id: RunId,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// One message delivered by a broker subscription.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerMessage {
    pub topic: String,
    pub payload: serde_json::Value,
}

/// Payload of a `stop` control message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopRequest {
    pub run_id: RunId,
}

/// Payload of a `timeout` control message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutRequest {
    pub run_id: RunId,
    #[serde(default = "default_timeout_action")]
    pub action: String,
}

fn default_timeout_action() -> String {
    "timeout".to_string()
}

// ── Script Execution Service ────────────────────────────────────

/// Request sent to the script execution service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptRequest {
    pub code: String,
    #[serde(default)]
    pub libraries: Vec<String>,
    pub entrypoint: String,
    #[serde(default)]
    pub inputs: serde_json::Value,
    #[serde(default)]
    pub global_context: serde_json::Value,
}

/// Response from the script execution service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScriptResponse {
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    pub return_code: i32,
    /// JSON-encoded result of the entrypoint.
    #[serde(default)]
    pub result_data: String,
}

impl ScriptResponse {
    /// Successful response carrying `result` as JSON text.
    pub fn success(result: &serde_json::Value) -> Self {
        Self {
            return_code: 0,
            result_data: result.to_string(),
            ..Default::default()
        }
    }

    /// Failed response with a non-zero return code.
    pub fn failure(return_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            return_code,
            stderr: stderr.into(),
            ..Default::default()
        }
    }

    /// Parse `result_data`; an empty payload is `null`.
    pub fn parse_result(&self) -> serde_json::Result<serde_json::Value> {
        if self.result_data.trim().is_empty() {
            return Ok(serde_json::Value::Null);
        }
        serde_json::from_str(&self.result_data)
    }
}

// ── Remote Coding-Agent Service ─────────────────────────────────

/// A remote agent session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSession {
    pub id: String,
    #[serde(default)]
    pub title: String,
}

/// Busy/idle state of a remote session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentSessionStatus {
    Busy,
    Retry,
    #[default]
    Idle,
}

impl AgentSessionStatus {
    pub fn is_busy(&self) -> bool {
        matches!(self, Self::Busy | Self::Retry)
    }
}

/// One content part of a remote agent message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentPart {
    /// Visible text; `finished` once the model has finalized the part.
    Text {
        text: String,
        #[serde(default)]
        finished: bool,
    },
    Reasoning {
        text: String,
        #[serde(default)]
        finished: bool,
    },
    Tool {
        tool: String,
        #[serde(default)]
        status: String,
        #[serde(default)]
        title: Option<String>,
    },
    #[serde(other)]
    Other,
}

/// A prompt posted to a remote agent session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentPrompt {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// How long the caller is prepared to wait for the agent's turn, in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_wait_s: Option<f64>,
}

/// One message in a remote agent session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentMessage {
    pub id: String,
    pub role: String,
    #[serde(default)]
    pub parts: Vec<AgentPart>,
    /// Set once the remote model finished producing this message.
    #[serde(default)]
    pub completed: bool,
    /// Finish reason reported for a completed message (e.g. "stop", "tool-calls").
    #[serde(default)]
    pub finish: Option<String>,
}

impl AgentMessage {
    pub fn is_assistant(&self) -> bool {
        self.role == "assistant"
    }
}
