use serde_json::{Map, Value};
use tracing::debug;

use crewgraph_core::error::{CrewGraphError, Result};
use crewgraph_core::schema::{ScriptNodeSpec, WebhookTriggerNodeSpec};
use crewgraph_core::traits::ScriptExecutor;
use crewgraph_core::types::ScriptRequest;
use crewgraph_core::variables::ExecutionState;

use crate::context::RunContext;

/// Run a request through the script service and parse its result.
///
/// A non-zero return code is a `ScriptExecution` error attributed to `node`.
pub async fn run_script(
    executor: &dyn ScriptExecutor,
    node: &str,
    request: ScriptRequest,
) -> Result<Value> {
    let response = executor.execute(request).await?;
    if response.return_code != 0 {
        return Err(CrewGraphError::ScriptExecution {
            node: node.to_string(),
            return_code: response.return_code,
            stderr: response.stderr,
        });
    }
    if !response.stdout.is_empty() {
        debug!(node, stdout = %response.stdout, "Script stdout");
    }
    Ok(response.parse_result()?)
}

/// Global context every script sees: its own context merged with the run's
/// variables and history.
pub fn merged_global_context(
    own: &Map<String, Value>,
    state: &ExecutionState,
) -> Map<String, Value> {
    let mut context = own.clone();
    context.insert("variables".into(), state.variables.snapshot());
    context.insert("state_history".into(), state.history_json());
    context
}

pub struct ScriptNode {
    spec: ScriptNodeSpec,
}

impl ScriptNode {
    pub fn new(spec: ScriptNodeSpec) -> Self {
        Self { spec }
    }

    /// Run the script remotely and parse its JSON result.
    pub async fn execute(
        &self,
        name: &str,
        state: &ExecutionState,
        input: &Map<String, Value>,
        ctx: &RunContext,
    ) -> Result<Value> {
        let request = ScriptRequest {
            code: self.spec.code.clone(),
            libraries: self.spec.libraries.clone(),
            entrypoint: self.spec.entrypoint.clone(),
            inputs: Value::Object(input.clone()),
            global_context: Value::Object(merged_global_context(&self.spec.global_context, state)),
        };
        run_script(ctx.services.script.as_ref(), name, request).await
    }
}

/// Script node that also sees the webhook id and the incoming payload.
pub struct WebhookTriggerNode {
    spec: WebhookTriggerNodeSpec,
}

impl WebhookTriggerNode {
    pub fn new(spec: WebhookTriggerNodeSpec) -> Self {
        Self { spec }
    }

    /// Run the script remotely and parse its JSON result.
    pub async fn execute(
        &self,
        name: &str,
        state: &ExecutionState,
        input: &Map<String, Value>,
        ctx: &RunContext,
    ) -> Result<Value> {
        let mut global_context = merged_global_context(&self.spec.global_context, state);
        global_context.insert("webhook_id".into(), Value::String(self.spec.webhook_id.clone()));
        global_context.insert(
            "trigger_payload".into(),
            state
                .variables
                .get(&self.spec.payload_path)
                .cloned()
                .unwrap_or(Value::Null),
        );
        let request = ScriptRequest {
            code: self.spec.code.clone(),
            libraries: self.spec.libraries.clone(),
            entrypoint: self.spec.entrypoint.clone(),
            inputs: Value::Object(input.clone()),
            global_context: Value::Object(global_context),
        };
        run_script(ctx.services.script.as_ref(), name, request).await
    }
}
