use serde_json::{Map, Value};
use tracing::debug;

use crewgraph_core::error::Result;
use crewgraph_core::schema::TriggerFieldNodeSpec;
use crewgraph_core::variables::ExecutionState;

/// Copies declared payload fields into their variable paths. Unlike other
/// nodes it writes several paths itself; missing fields are skipped.
pub struct TriggerFieldNode {
    spec: TriggerFieldNodeSpec,
}

impl TriggerFieldNode {
    pub fn new(spec: TriggerFieldNodeSpec) -> Self {
        Self { spec }
    }

    /// Copy the configured fields out of the trigger payload.
    pub fn execute(&self, state: &mut ExecutionState) -> Result<Value> {
        let payload = state
            .variables
            .get(&self.spec.source_path)
            .cloned()
            .unwrap_or(Value::Null);

        let mut extracted = Map::new();
        for mapping in &self.spec.fields {
            let Some(value) = lookup(&payload, &mapping.field) else {
                debug!(field = %mapping.field, "Trigger field missing, skipped");
                continue;
            };
            state.variables.set(&mapping.variable_path, value.clone())?;
            extracted.insert(mapping.variable_path.clone(), value.clone());
        }
        Ok(Value::Object(extracted))
    }
}

fn lookup<'a>(payload: &'a Value, field: &str) -> Option<&'a Value> {
    field.split('.').try_fold(payload, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => items.get(segment.parse::<usize>().ok()?),
        _ => None,
    })
}
