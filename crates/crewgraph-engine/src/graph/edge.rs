use std::collections::BTreeMap;

use serde_json::Value;
use tracing::debug;

use crewgraph_core::error::{CrewGraphError, Result};
use crewgraph_core::schema::{ConditionalEdgeSpec, InputMap};
use crewgraph_core::types::ScriptRequest;
use crewgraph_core::variables::ExecutionState;

use crate::context::RunContext;
use crate::nodes::decision::RESULT_NODE;
use crate::nodes::script::{merged_global_context, run_script};

/// Conditional routing attached to a source node.
pub enum Route {
    /// Script predicate whose string result names the next node.
    Predicate(Predicate),
    /// Reads the target a decision table left in
    /// `system_variables.nodes.<table>.result_node`.
    TableSignal { table: String },
}

impl Route {
    /// Name of the next node, not yet checked against the graph.
    pub async fn next(&self, state: &ExecutionState, ctx: &RunContext) -> Result<String> {
        match self {
            Route::Predicate(p) => p.select(state, ctx).await,
            Route::TableSignal { table } => state
                .node_signal(table)
                .and_then(|signal| signal.get(RESULT_NODE))
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| {
                    CrewGraphError::Graph(format!(
                        "decision table '{table}' finished without a {RESULT_NODE}"
                    ))
                }),
        }
    }
}

pub struct Predicate {
    source: String,
    code: String,
    libraries: Vec<String>,
    entrypoint: String,
    input_map: InputMap,
    path_map: Option<BTreeMap<String, String>>,
}

impl Predicate {
    pub fn new(spec: &ConditionalEdgeSpec) -> Self {
        Self {
            source: spec.source.clone(),
            code: spec.predicate_code.clone(),
            libraries: spec.libraries.clone(),
            entrypoint: spec.entrypoint.clone(),
            input_map: spec.input_map.clone(),
            path_map: spec.path_map.clone(),
        }
    }

    /// Run the predicate and translate its result through `path_map`.
    pub async fn select(&self, state: &ExecutionState, ctx: &RunContext) -> Result<String> {
        let request = ScriptRequest {
            code: self.code.clone(),
            libraries: self.libraries.clone(),
            entrypoint: self.entrypoint.clone(),
            inputs: Value::Object(self.input_map.resolve(&state.variables)),
            global_context: Value::Object(merged_global_context(&Default::default(), state)),
        };
        let label = format!("{}:predicate", self.source);
        let result = run_script(ctx.services.script.as_ref(), &label, request).await?;
        let key = match result {
            Value::String(s) => s,
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => n.to_string(),
            other => {
                return Err(CrewGraphError::Graph(format!(
                    "predicate on '{}' must return a node name, got {other}",
                    self.source
                )))
            }
        };
        debug!(source = %self.source, result = %key, "Predicate evaluated");
        match &self.path_map {
            None => Ok(key),
            Some(map) => map.get(&key).cloned().ok_or_else(|| {
                CrewGraphError::Graph(format!(
                    "predicate on '{}' returned '{key}', which is not in its path_map",
                    self.source
                ))
            }),
        }
    }
}
