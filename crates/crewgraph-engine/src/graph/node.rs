use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use crewgraph_core::error::{CrewGraphError, Result};
use crewgraph_core::schema::{NodeKind, NodeRuntimeConfig};
use crewgraph_core::types::MessageType;
use crewgraph_core::variables::{normalize_path, ExecutionState, HistoryEntry};

use crate::context::RunContext;
use crate::nodes::{
    CodeAgentNode, CrewNode, DecisionGraph, EndNode, ScriptNode, SubGraphNode, TriggerFieldNode,
    WebhookTriggerNode,
};

/// Kind-specific execution strategy.
pub enum NodeVariant {
    Script(ScriptNode),
    WebhookTrigger(WebhookTriggerNode),
    TriggerField(TriggerFieldNode),
    Crew(CrewNode),
    SubGraph(SubGraphNode),
    DecisionTable(DecisionGraph),
    CodeAgent(CodeAgentNode),
    End(EndNode),
}

impl NodeVariant {
    pub fn kind(&self) -> NodeKind {
        match self {
            Self::Script(_) => NodeKind::Script,
            Self::WebhookTrigger(_) => NodeKind::WebhookTrigger,
            Self::TriggerField(_) => NodeKind::TriggerField,
            Self::Crew(_) => NodeKind::Crew,
            Self::SubGraph(_) => NodeKind::SubGraph,
            Self::DecisionTable(_) => NodeKind::DecisionTable,
            Self::CodeAgent(_) => NodeKind::CodeAgent,
            Self::End(_) => NodeKind::End,
        }
    }

    async fn execute(
        &self,
        name: &str,
        state: &mut ExecutionState,
        input: &Map<String, Value>,
        ctx: &RunContext,
    ) -> Result<Value> {
        match self {
            Self::Script(node) => node.execute(name, state, input, ctx).await,
            Self::WebhookTrigger(node) => node.execute(name, state, input, ctx).await,
            Self::TriggerField(node) => node.execute(state),
            Self::Crew(node) => node.execute(name, input, ctx).await,
            Self::SubGraph(node) => node.execute(name, state, input, ctx).await,
            Self::DecisionTable(node) => node.execute(name, state),
            Self::CodeAgent(node) => node.execute(name, state, input, ctx).await,
            Self::End(node) => node.execute(state),
        }
    }
}

/// A node wrapped in the uniform lifecycle: resolve input, emit `start`,
/// execute, write output, record history, emit `finish` (or `error`).
pub struct CompiledNode {
    pub name: String,
    runtime: NodeRuntimeConfig,
    variant: NodeVariant,
}

impl CompiledNode {
    /// Wrap a node implementation with its runtime config.
    pub fn new(name: impl Into<String>, runtime: NodeRuntimeConfig, variant: NodeVariant) -> Self {
        Self {
            name: name.into(),
            runtime,
            variant,
        }
    }

    pub fn kind(&self) -> NodeKind {
        self.variant.kind()
    }

    pub fn variant(&self) -> &NodeVariant {
        &self.variant
    }

    /// Apply `input_map` to the current variables.
    pub fn get_input(&self, state: &ExecutionState) -> Map<String, Value> {
        self.runtime.input_map.resolve(&state.variables)
    }

    /// Write `output` back through `output_variable_path`.
    pub fn set_output(&self, state: &mut ExecutionState, output: &Value) -> Result<()> {
        let path = match self.runtime.output_variable_path.as_deref() {
            Some(p) if !p.trim().is_empty() => p,
            _ => return Ok(()),
        };
        if normalize_path(path).is_empty() {
            return match output {
                Value::Object(map) => {
                    state.variables.replace_all(map.clone());
                    Ok(())
                }
                other => Err(CrewGraphError::Graph(format!(
                    "node '{}' must return an object to replace variables, got {}",
                    self.name,
                    json_kind(other)
                ))),
            };
        }
        state.variables.set(path, output.clone())
    }

    /// Run the full node lifecycle: input, telemetry, execute, output and history.
    pub async fn invoke(&self, state: &mut ExecutionState, ctx: &RunContext) -> Result<Value> {
        let step = state.step();
        let kind = self.kind();
        let input = self.get_input(state);
        ctx.emit(
            &self.name,
            MessageType::Start,
            step,
            json!({"node_type": kind, "input": input}),
        );
        debug!(run_id = %ctx.run_id, node = %self.name, %kind, step, "Node started");

        let result = async {
            let output = self.variant.execute(&self.name, state, &input, ctx).await?;
            self.set_output(state, &output)?;
            Ok::<_, CrewGraphError>(output)
        }
        .await;

        match result {
            Ok(output) => {
                state.push_history(HistoryEntry {
                    node_type: kind,
                    name: self.name.clone(),
                    input: Value::Object(input),
                    output: output.clone(),
                    variables: state.variables.snapshot(),
                });
                ctx.emit(
                    &self.name,
                    MessageType::Finish,
                    step,
                    json!({"node_type": kind, "output": output}),
                );
                debug!(run_id = %ctx.run_id, node = %self.name, step, "Node finished");
                Ok(output)
            }
            Err(e) if e.is_cancellation() => Err(e),
            Err(e) => {
                warn!(run_id = %ctx.run_id, node = %self.name, error = %e, "Node failed");
                ctx.emit(
                    &self.name,
                    MessageType::Error,
                    step,
                    json!({"node_type": kind, "error": e.to_string()}),
                );
                Err(e)
            }
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
