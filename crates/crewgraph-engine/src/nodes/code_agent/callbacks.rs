use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Map, Value};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crewgraph_core::schema::CallbackSpec;
use crewgraph_core::traits::ScriptExecutor;
use crewgraph_core::types::ScriptRequest;

/// Depth-1 chained callback slot.
///
/// Each submission awaits the previous pending invocation before running, so
/// callbacks observe program order without blocking the caller. Returned
/// mappings merge into the shared handler state.
pub struct CallbackChain {
    script: Arc<dyn ScriptExecutor>,
    node: String,
    state: Arc<Mutex<Map<String, Value>>>,
    pending: Option<JoinHandle<()>>,
}

impl CallbackChain {
    /// Handler state starts as `{"input": <node input>}`.
    pub fn new(script: Arc<dyn ScriptExecutor>, node: &str, input: &Map<String, Value>) -> Self {
        let mut state = Map::new();
        state.insert("input".into(), Value::Object(input.clone()));
        Self {
            script,
            node: node.to_string(),
            state: Arc::new(Mutex::new(state)),
            pending: None,
        }
    }

    /// Queue `spec` behind the pending invocation; returns immediately.
    pub fn submit(&mut self, spec: &CallbackSpec, event: &str, payload: Value) {
        let previous = self.pending.take();
        let script = self.script.clone();
        let state = self.state.clone();
        let spec = spec.clone();
        let event = event.to_string();
        let node = self.node.clone();
        self.pending = Some(tokio::spawn(async move {
            if let Some(previous) = previous {
                let _ = previous.await;
            }
            invoke(script.as_ref(), &node, &state, &spec, &event, payload).await;
        }));
    }

    /// Run `spec` now, after the pending invocation, and wait for it.
    pub async fn run_now(&mut self, spec: &CallbackSpec, event: &str, payload: Value, limit: Duration) {
        self.submit(spec, event, payload);
        self.drain(limit).await;
    }

    /// Wait for the pending invocation up to `limit`, aborting it after that.
    /// Returns `false` if it had to be aborted.
    pub async fn drain(&mut self, limit: Duration) -> bool {
        let Some(mut handle) = self.pending.take() else {
            return true;
        };
        match tokio::time::timeout(limit, &mut handle).await {
            Ok(_) => true,
            Err(_) => {
                warn!(node = %self.node, "Callback did not finish in time, aborting");
                handle.abort();
                false
            }
        }
    }

    pub fn has_pending(&self) -> bool {
        self.pending.as_ref().is_some_and(|h| !h.is_finished())
    }

    pub async fn state(&self) -> Map<String, Value> {
        self.state.lock().await.clone()
    }
}

async fn invoke(
    script: &dyn ScriptExecutor,
    node: &str,
    state: &Mutex<Map<String, Value>>,
    spec: &CallbackSpec,
    event: &str,
    payload: Value,
) {
    let handler_state = state.lock().await.clone();
    let request = ScriptRequest {
        code: spec.code.clone(),
        libraries: spec.libraries.clone(),
        entrypoint: spec.entrypoint.clone(),
        inputs: json!({"event": event, "payload": payload}),
        global_context: json!({"handler_state": handler_state}),
    };

    let response = match script.execute(request).await {
        Ok(r) => r,
        Err(e) => {
            warn!(node, event, error = %e, "Callback request failed");
            return;
        }
    };
    if response.return_code != 0 {
        warn!(
            node,
            event,
            return_code = response.return_code,
            stderr = %response.stderr,
            "Callback exited with an error"
        );
        return;
    }
    match response.parse_result() {
        Ok(Value::Object(update)) => {
            debug!(node, event, keys = update.len(), "Callback updated handler state");
            state.lock().await.extend(update);
        }
        Ok(_) => {}
        Err(e) => warn!(node, event, error = %e, "Callback returned invalid JSON"),
    }
}
