//! Mocks and fixtures shared by the crewgraph test suites.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::{json, Map, Value};

use crewgraph_core::error::{CrewGraphError, Result};
use crewgraph_core::schema::{CrewNodeSpec, WorkflowSchema};
use crewgraph_core::traits::{CodeAgentService, CrewRunner, ScriptExecutor};
use crewgraph_core::types::{
    AgentMessage, AgentPart, AgentPrompt, AgentSession, AgentSessionStatus, ScriptRequest,
    ScriptResponse,
};
use crewgraph_core::StopEvent;

// ── Script service ──────────────────────────────────────────────

type ScriptHandler = Arc<dyn Fn(&ScriptRequest) -> ScriptResponse + Send + Sync>;

/// Script executor that answers from a closure and records every request.
#[derive(Clone)]
pub struct MockScriptExecutor {
    handler: ScriptHandler,
    delay: Option<Duration>,
    requests: Arc<Mutex<Vec<ScriptRequest>>>,
}

impl Default for MockScriptExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl MockScriptExecutor {
    /// Every request succeeds with a `null` result.
    pub fn new() -> Self {
        Self::returning(Value::Null)
    }

    /// Every request succeeds with `result`.
    pub fn returning(result: Value) -> Self {
        Self::with_handler(move |_| ScriptResponse::success(&result))
    }

    /// Answer every request with `handler`.
    pub fn with_handler(
        handler: impl Fn(&ScriptRequest) -> ScriptResponse + Send + Sync + 'static,
    ) -> Self {
        Self {
            handler: Arc::new(handler),
            delay: None,
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Sleep before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Requests received so far, in order.
    pub fn requests(&self) -> Vec<ScriptRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Entrypoint-visible `inputs` of each request whose code equals `code`.
    pub fn inputs_for(&self, code: &str) -> Vec<Value> {
        self.requests()
            .into_iter()
            .filter(|r| r.code == code)
            .map(|r| r.inputs)
            .collect()
    }
}

impl ScriptExecutor for MockScriptExecutor {
    fn execute(&self, request: ScriptRequest) -> BoxFuture<'_, Result<ScriptResponse>> {
        Box::pin(async move {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let response = (self.handler)(&request);
            self.requests.lock().unwrap().push(request);
            Ok(response)
        })
    }
}

// ── Code-agent service ──────────────────────────────────────────

#[derive(Default)]
struct AgentInner {
    sessions: Vec<AgentSession>,
    messages: HashMap<String, Vec<AgentMessage>>,
    status: HashMap<String, AgentSessionStatus>,
    prompts: Vec<(String, AgentPrompt)>,
    aborted: Vec<String>,
    next_id: usize,
}

#[derive(Clone, Copy, PartialEq)]
enum SendMode {
    Reply,
    Busy,
    Fail,
}

/// In-memory coding-agent service.
///
/// On `send_message` it either answers at once (`replying_with`), marks the
/// session busy and never answers (`busy`), or fails (`failing_send`).
pub struct MockAgentService {
    inner: Mutex<AgentInner>,
    mode: SendMode,
    reply: String,
    read_failures: AtomicU32,
}

impl Default for MockAgentService {
    fn default() -> Self {
        Self::replying_with("done")
    }
}

impl MockAgentService {
    pub fn replying_with(reply: impl Into<String>) -> Self {
        Self {
            inner: Mutex::new(AgentInner::default()),
            mode: SendMode::Reply,
            reply: reply.into(),
            read_failures: AtomicU32::new(0),
        }
    }

    pub fn busy() -> Self {
        Self {
            mode: SendMode::Busy,
            ..Self::default()
        }
    }

    pub fn failing_send() -> Self {
        Self {
            mode: SendMode::Fail,
            ..Self::default()
        }
    }

    /// The next `n` status reads fail.
    pub fn failing_reads(self, n: u32) -> Self {
        self.read_failures.store(n, Ordering::SeqCst);
        self
    }

    pub fn with_session(self, id: &str, title: &str) -> Self {
        self.inner.lock().unwrap().sessions.push(AgentSession {
            id: id.into(),
            title: title.into(),
        });
        self
    }

    pub fn with_messages(self, session_id: &str, messages: Vec<AgentMessage>) -> Self {
        self.inner
            .lock()
            .unwrap()
            .messages
            .insert(session_id.into(), messages);
        self
    }

    /// Append a message to a session, as the remote agent would.
    pub fn push_message(&self, session_id: &str, message: AgentMessage) {
        self.inner
            .lock()
            .unwrap()
            .messages
            .entry(session_id.into())
            .or_default()
            .push(message);
    }

    pub fn set_status(&self, session_id: &str, status: AgentSessionStatus) {
        self.inner
            .lock()
            .unwrap()
            .status
            .insert(session_id.into(), status);
    }

    pub fn sessions(&self) -> Vec<AgentSession> {
        self.inner.lock().unwrap().sessions.clone()
    }

    /// `(session_id, prompt)` pairs in send order.
    pub fn prompts(&self) -> Vec<(String, AgentPrompt)> {
        self.inner.lock().unwrap().prompts.clone()
    }

    pub fn aborted(&self) -> Vec<String> {
        self.inner.lock().unwrap().aborted.clone()
    }
}

impl CodeAgentService for MockAgentService {
    fn create_session(&self, title: &str) -> BoxFuture<'_, Result<AgentSession>> {
        let title = title.to_string();
        Box::pin(async move {
            let mut inner = self.inner.lock().unwrap();
            inner.next_id += 1;
            let session = AgentSession {
                id: format!("ses_{}", inner.next_id),
                title,
            };
            inner.sessions.push(session.clone());
            Ok(session)
        })
    }

    fn list_sessions(&self) -> BoxFuture<'_, Result<Vec<AgentSession>>> {
        Box::pin(async move { Ok(self.sessions()) })
    }

    fn messages(&self, session_id: &str) -> BoxFuture<'_, Result<Vec<AgentMessage>>> {
        let session_id = session_id.to_string();
        Box::pin(async move {
            Ok(self
                .inner
                .lock()
                .unwrap()
                .messages
                .get(&session_id)
                .cloned()
                .unwrap_or_default())
        })
    }

    fn send_message(&self, session_id: &str, prompt: AgentPrompt) -> BoxFuture<'_, Result<()>> {
        let session_id = session_id.to_string();
        Box::pin(async move {
            if self.mode == SendMode::Fail {
                return Err(CrewGraphError::RemoteService("agent rejected the prompt".into()));
            }
            let mut inner = self.inner.lock().unwrap();
            let count = inner.messages.get(&session_id).map_or(0, Vec::len);
            inner.prompts.push((session_id.clone(), prompt.clone()));
            let thread = inner.messages.entry(session_id.clone()).or_default();
            thread.push(user_message(&format!("msg_{}", count + 1), &prompt.text));
            match self.mode {
                SendMode::Reply => {
                    thread.push(assistant_message(&format!("msg_{}", count + 2), &self.reply));
                    inner.status.insert(session_id, AgentSessionStatus::Idle);
                }
                _ => {
                    inner.status.insert(session_id, AgentSessionStatus::Busy);
                }
            }
            Ok(())
        })
    }

    fn session_status(&self) -> BoxFuture<'_, Result<HashMap<String, AgentSessionStatus>>> {
        Box::pin(async move {
            let remaining = self.read_failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.read_failures.store(remaining - 1, Ordering::SeqCst);
                return Err(CrewGraphError::RemoteService("status unavailable".into()));
            }
            Ok(self.inner.lock().unwrap().status.clone())
        })
    }

    fn abort(&self, session_id: &str) -> BoxFuture<'_, Result<()>> {
        let session_id = session_id.to_string();
        Box::pin(async move {
            let mut inner = self.inner.lock().unwrap();
            inner.status.insert(session_id.clone(), AgentSessionStatus::Idle);
            inner.aborted.push(session_id);
            Ok(())
        })
    }
}

/// A completed assistant message holding one finished text part.
pub fn assistant_message(id: &str, text: &str) -> AgentMessage {
    AgentMessage {
        id: id.into(),
        role: "assistant".into(),
        parts: vec![AgentPart::Text {
            text: text.into(),
            finished: true,
        }],
        completed: true,
        finish: Some("stop".into()),
    }
}

pub fn user_message(id: &str, text: &str) -> AgentMessage {
    AgentMessage {
        id: id.into(),
        role: "user".into(),
        parts: vec![AgentPart::Text {
            text: text.into(),
            finished: true,
        }],
        completed: true,
        finish: None,
    }
}

// ── Crew runtime ────────────────────────────────────────────────

/// Crew runtime that echoes its inputs and records each call.
#[derive(Default)]
pub struct MockCrewRunner {
    calls: Mutex<Vec<(String, Map<String, Value>)>>,
}

impl MockCrewRunner {
    /// `(crew name, inputs)` pairs in call order.
    pub fn calls(&self) -> Vec<(String, Map<String, Value>)> {
        self.calls.lock().unwrap().clone()
    }
}

impl CrewRunner for MockCrewRunner {
    fn run_crew(
        &self,
        spec: CrewNodeSpec,
        inputs: Map<String, Value>,
        stop: StopEvent,
    ) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move {
            stop.check()?;
            self.calls
                .lock()
                .unwrap()
                .push((spec.name.clone(), inputs.clone()));
            Ok(json!({
                "crew": spec.name,
                "process": spec.process,
                "agents": spec.agents.len(),
                "inputs": inputs,
            }))
        })
    }
}

// ── Fixtures ────────────────────────────────────────────────────

/// Parse a workflow from a `json!` literal.
pub fn schema(value: Value) -> WorkflowSchema {
    serde_json::from_value(value).expect("fixture schema must deserialize")
}

/// `first -> second -> __end__`, both script nodes writing to variables.
pub fn linear_schema() -> WorkflowSchema {
    schema(json!({
        "name": "linear",
        "script_nodes": [
            {
                "name": "first",
                "code": "first",
                "input_map": {"x": "x"},
                "output_variable_path": "first_out"
            },
            {
                "name": "second",
                "code": "second",
                "input_map": {"prev": "first_out"},
                "output_variable_path": "second_out"
            }
        ],
        "edges": [
            {"start_key": "first", "end_key": "second"},
            {"start_key": "second", "end_key": "end"},
            {"start_key": "end", "end_key": "__end__"}
        ],
        "entry_point": "first",
        "end_node": {"name": "end", "output_map": {"result": "second_out"}}
    }))
}

/// Write `contents` to a temporary `config.toml`.
/// Keep the returned directory alive for as long as the path is used.
pub fn write_config(contents: &str) -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("config.toml");
    std::fs::write(&path, contents).expect("write config");
    (dir, path)
}

