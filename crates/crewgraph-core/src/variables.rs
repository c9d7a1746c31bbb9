//! Shared run state: the variable store, the audit history and the
//! `system_variables` scratch area.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{CrewGraphError, Result};
use crate::schema::NodeKind;

/// Path meaning "the whole variables mapping".
pub const WHOLE_VARIABLES: &str = "variables";

/// Strip an optional `variables.` prefix. `"variables"` itself becomes `""`.
pub fn normalize_path(path: &str) -> &str {
    let path = path.trim();
    if path == WHOLE_VARIABLES {
        return "";
    }
    path.strip_prefix("variables.").unwrap_or(path)
}

/// Nested mapping addressed by dotted paths (`a.b.0.c`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VariableStore {
    values: Map<String, Value>,
}

impl VariableStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap an existing top-level map.
    pub fn from_map(values: Map<String, Value>) -> Self {
        Self { values }
    }

    /// Look up a dotted path. Missing segments give `None`.
    pub fn get(&self, path: &str) -> Option<&Value> {
        let path = normalize_path(path);
        let mut segments = path.split('.');
        let first = segments.next()?;
        let mut current = self.values.get(first)?;
        for segment in segments {
            current = match current {
                Value::Object(map) => map.get(segment)?,
                Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }

    /// Write `value` at `path`, creating intermediate objects. A non-container
    /// intermediate is replaced by an object.
    pub fn set(&mut self, path: &str, value: Value) -> Result<()> {
        let path = normalize_path(path);
        if path.is_empty() {
            return Err(CrewGraphError::Graph(
                "cannot set an empty variable path".into(),
            ));
        }
        let segments: Vec<&str> = path.split('.').collect();
        let (last, parents) = segments
            .split_last()
            .ok_or_else(|| CrewGraphError::Graph("empty variable path".into()))?;

        let mut current = self
            .values
            .entry(parents.first().copied().unwrap_or(*last).to_string())
            .or_insert(Value::Null);
        if parents.is_empty() {
            *current = value;
            return Ok(());
        }
        for segment in parents.iter().skip(1).chain(std::iter::once(last)) {
            current = child_slot(current, segment)?;
        }
        *current = value;
        Ok(())
    }

    /// Remove the value at a dotted path.
    pub fn remove(&mut self, path: &str) -> Option<Value> {
        let path = normalize_path(path);
        match path.rsplit_once('.') {
            None => self.values.remove(path),
            Some((parent, key)) => {
                let parent = self.get_mut(parent)?;
                match parent {
                    Value::Object(map) => map.remove(key),
                    Value::Array(items) => {
                        let idx = key.parse::<usize>().ok()?;
                        (idx < items.len()).then(|| items.remove(idx))
                    }
                    _ => None,
                }
            }
        }
    }

    fn get_mut(&mut self, path: &str) -> Option<&mut Value> {
        let mut segments = path.split('.');
        let mut current = self.values.get_mut(segments.next()?)?;
        for segment in segments {
            current = match current {
                Value::Object(map) => map.get_mut(segment)?,
                Value::Array(items) => items.get_mut(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }

    /// Replace every variable at once.
    pub fn replace_all(&mut self, values: Map<String, Value>) {
        self.values = values;
    }

    /// All variables as one JSON object.
    pub fn snapshot(&self) -> Value {
        Value::Object(self.values.clone())
    }

    /// Borrow the top-level map.
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.values
    }

    /// Take the top-level map.
    pub fn into_map(self) -> Map<String, Value> {
        self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Descend into `segment` of `current`, creating the slot when needed.
fn child_slot<'a>(current: &'a mut Value, segment: &str) -> Result<&'a mut Value> {
    let index = segment.parse::<usize>().ok();
    let needs_object = match &*current {
        Value::Object(_) => false,
        Value::Array(_) => index.is_none(),
        _ => true,
    };
    if needs_object {
        *current = Value::Object(Map::new());
    }
    match current {
        Value::Object(map) => Ok(map.entry(segment.to_string()).or_insert(Value::Null)),
        Value::Array(items) => {
            let idx = index.unwrap_or(usize::MAX);
            if idx == items.len() {
                items.push(Value::Null);
            }
            items
                .get_mut(idx)
                .ok_or_else(|| CrewGraphError::Graph(format!("array index {segment} out of range")))
        }
        _ => Err(CrewGraphError::Graph(format!("cannot descend into '{segment}'"))),
    }
}

/// One completed node in the audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    #[serde(rename = "type")]
    pub node_type: NodeKind,
    pub name: String,
    pub input: Value,
    pub output: Value,
    /// Snapshot of `variables` after the node wrote its output.
    pub variables: Value,
}

/// Mutable state of one run (or one subgraph invocation).
#[derive(Debug, Clone, Default)]
pub struct ExecutionState {
    pub variables: VariableStore,
    history: Vec<HistoryEntry>,
    pub system_variables: Value,
}

impl ExecutionState {
    /// Fresh state seeded with the run's initial variables.
    pub fn new(variables: Map<String, Value>) -> Self {
        Self {
            variables: VariableStore::from_map(variables),
            history: Vec::new(),
            system_variables: Value::Object(Map::new()),
        }
    }

    /// Fresh state for a nested graph: given variables, a deep copy of the
    /// parent's `system_variables`, empty history.
    pub fn child(&self, variables: Map<String, Value>) -> Self {
        Self {
            variables: VariableStore::from_map(variables),
            history: Vec::new(),
            system_variables: self.system_variables.clone(),
        }
    }

    /// Completed nodes, in execution order.
    pub fn history(&self) -> &[HistoryEntry] {
        &self.history
    }

    /// Append-only.
    pub fn push_history(&mut self, entry: HistoryEntry) {
        self.history.push(entry);
    }

    /// Index of the next node completion.
    pub fn step(&self) -> usize {
        self.history.len()
    }

    /// History in the shape exposed to scripts as `system_variables.history`.
    pub fn history_json(&self) -> Value {
        serde_json::to_value(&self.history).unwrap_or(Value::Array(Vec::new()))
    }

    /// `system_variables.nodes.<name>`, if the node left a signal.
    pub fn node_signal(&self, node: &str) -> Option<&Value> {
        self.system_variables.get("nodes")?.get(node)
    }

    /// Record a per-node routing signal such as a decision table's route code.
    pub fn set_node_signal(&mut self, node: &str, key: &str, value: Value) {
        if !self.system_variables.is_object() {
            self.system_variables = Value::Object(Map::new());
        }
        let Value::Object(system) = &mut self.system_variables else {
            return;
        };
        let nodes = system
            .entry("nodes".to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !nodes.is_object() {
            *nodes = Value::Object(Map::new());
        }
        if let Value::Object(nodes) = nodes {
            let slot = nodes
                .entry(node.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !slot.is_object() {
                *slot = Value::Object(Map::new());
            }
            if let Value::Object(slot) = slot {
                slot.insert(key.to_string(), value);
            }
        }
    }
}
