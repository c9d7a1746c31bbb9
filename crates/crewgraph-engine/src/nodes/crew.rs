use serde_json::{Map, Value};

use crewgraph_core::error::{CrewGraphError, Result};
use crewgraph_core::schema::CrewNodeSpec;

use crate::context::RunContext;

/// Delegates to the crew runtime collaborator.
pub struct CrewNode {
    spec: CrewNodeSpec,
}

impl CrewNode {
    pub fn new(spec: CrewNodeSpec) -> Self {
        Self { spec }
    }

    /// Hand the node input and the run's stop event to the crew runtime.
    pub async fn execute(
        &self,
        name: &str,
        input: &Map<String, Value>,
        ctx: &RunContext,
    ) -> Result<Value> {
        let runner = ctx.services.crew.as_ref().ok_or_else(|| {
            CrewGraphError::Config(format!(
                "node '{name}' is a crew node but no crew runtime is configured"
            ))
        })?;
        runner
            .run_crew(self.spec.clone(), input.clone(), ctx.stop.clone())
            .await
    }
}
