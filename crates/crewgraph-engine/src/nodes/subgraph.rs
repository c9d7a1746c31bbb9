use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::info;

use crewgraph_core::error::Result;
use crewgraph_core::variables::ExecutionState;

use crate::context::RunContext;
use crate::graph::ExecutableGraph;

/// Runs a nested workflow against a fresh child state.
///
/// The child gets the node input as its variables, a copy of the parent's
/// `system_variables` and an empty history. Its final variables are the
/// node's output; the parent records a single SUBGRAPH history entry.
pub struct SubGraphNode {
    subgraph_id: String,
    graph: Arc<ExecutableGraph>,
}

impl SubGraphNode {
    pub fn new(subgraph_id: impl Into<String>, graph: Arc<ExecutableGraph>) -> Self {
        Self {
            subgraph_id: subgraph_id.into(),
            graph,
        }
    }

    /// Run the nested graph on a child state seeded with `input` and return its final variables.
    pub async fn execute(
        &self,
        name: &str,
        state: &ExecutionState,
        input: &Map<String, Value>,
        ctx: &RunContext,
    ) -> Result<Value> {
        let mut child = state.child(input.clone());
        let child_ctx = ctx.nested(name);
        info!(
            run_id = %ctx.run_id,
            node = %name,
            subgraph_id = %self.subgraph_id,
            "Entering subgraph"
        );
        self.graph.run(&mut child, &child_ctx).await?;
        Ok(Value::Object(child.variables.into_map()))
    }
}
