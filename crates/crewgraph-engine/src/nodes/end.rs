use std::sync::{Arc, Mutex};

use serde_json::Value;

use crewgraph_core::error::Result;
use crewgraph_core::schema::InputMap;
use crewgraph_core::variables::ExecutionState;

/// Slot where the end node records the graph's declared output.
pub type EndOutputSlot = Arc<Mutex<Option<Value>>>;

/// Resolves `output_map` against the final variables.
pub struct EndNode {
    output_map: InputMap,
    slot: EndOutputSlot,
}

impl EndNode {
    pub fn new(output_map: InputMap, slot: EndOutputSlot) -> Self {
        Self { output_map, slot }
    }

    /// Evaluate the output map and store it as the graph output.
    pub fn execute(&self, state: &ExecutionState) -> Result<Value> {
        let output = Value::Object(self.output_map.resolve(&state.variables));
        if let Ok(mut slot) = self.slot.lock() {
            *slot = Some(output.clone());
        }
        Ok(output)
    }
}
