//! Declarative workflow definitions and the run request that carries them.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::error::{CrewGraphError, Result};
use crate::types::RunId;
use crate::variables::{normalize_path, VariableStore, WHOLE_VARIABLES};

/// Reserved sentinel node names.
pub const START: &str = "__start__";
pub const END: &str = "__end__";

/// Node kinds, used as the `type` of a history entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeKind {
    Script,
    Crew,
    WebhookTrigger,
    TriggerField,
    #[serde(rename = "SUBGRAPH")]
    SubGraph,
    DecisionTable,
    CodeAgent,
    End,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Script => "SCRIPT",
            Self::Crew => "CREW",
            Self::WebhookTrigger => "WEBHOOK_TRIGGER",
            Self::TriggerField => "TRIGGER_FIELD",
            Self::SubGraph => "SUBGRAPH",
            Self::DecisionTable => "DECISION_TABLE",
            Self::CodeAgent => "CODE_AGENT",
            Self::End => "END",
        }
    }
}

impl std::fmt::Display for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a node reads its input parameters from `variables`.
///
/// Either the literal string `"variables"` (input is the whole mapping) or
/// an object of `param -> path`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InputMap {
    Whole(String),
    Fields(BTreeMap<String, String>),
}

impl Default for InputMap {
    fn default() -> Self {
        InputMap::Fields(BTreeMap::new())
    }
}

impl InputMap {
    /// A whole-map input must be `"variables"`. Errors name `owner`.
    pub fn validate(&self, owner: &str) -> Result<()> {
        match self {
            InputMap::Whole(s) if s != WHOLE_VARIABLES => Err(CrewGraphError::Graph(format!(
                "input_map of '{owner}' must be \"{WHOLE_VARIABLES}\" or an object, got \"{s}\""
            ))),
            _ => Ok(()),
        }
    }

    /// Build the input mapping. Missing paths resolve to `null`.
    pub fn resolve(&self, store: &VariableStore) -> serde_json::Map<String, serde_json::Value> {
        match self {
            InputMap::Whole(_) => store.as_map().clone(),
            InputMap::Fields(fields) => fields
                .iter()
                .map(|(param, path)| {
                    let value = if normalize_path(path).is_empty() {
                        serde_json::Value::Object(store.as_map().clone())
                    } else {
                        store.get(path).cloned().unwrap_or(serde_json::Value::Null)
                    };
                    (param.clone(), value)
                })
                .collect(),
        }
    }
}

/// Per-node read/write contract with the variable store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeRuntimeConfig {
    #[serde(default)]
    pub input_map: InputMap,
    #[serde(default)]
    pub output_variable_path: Option<String>,
}

fn default_entrypoint() -> String { "main".to_string() }
fn default_callback_entrypoint() -> String { "handler".to_string() }
fn default_trigger_source() -> String { "trigger_payload".to_string() }
fn default_process() -> String { "sequential".to_string() }
fn default_end_name() -> String { "end".to_string() }
fn default_true() -> bool { true }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptNodeSpec {
    pub name: String,
    pub code: String,
    #[serde(default)]
    pub libraries: Vec<String>,
    #[serde(default = "default_entrypoint")]
    pub entrypoint: String,
    #[serde(default)]
    pub global_context: serde_json::Map<String, serde_json::Value>,
    #[serde(flatten)]
    pub runtime: NodeRuntimeConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrewNodeSpec {
    pub name: String,
    #[serde(default)]
    pub agents: Vec<serde_json::Value>,
    #[serde(default)]
    pub tasks: Vec<serde_json::Value>,
    #[serde(default = "default_process")]
    pub process: String,
    #[serde(flatten)]
    pub runtime: NodeRuntimeConfig,
}

/// Script node that also receives the incoming webhook payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookTriggerNodeSpec {
    pub name: String,
    pub webhook_id: String,
    pub code: String,
    #[serde(default)]
    pub libraries: Vec<String>,
    #[serde(default = "default_entrypoint")]
    pub entrypoint: String,
    #[serde(default)]
    pub global_context: serde_json::Map<String, serde_json::Value>,
    /// Where the payload lives in `variables`.
    #[serde(default = "default_trigger_source")]
    pub payload_path: String,
    #[serde(flatten)]
    pub runtime: NodeRuntimeConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldMapping {
    /// Dotted path inside the trigger payload.
    pub field: String,
    /// Destination path in `variables`.
    pub variable_path: String,
}

/// Copies payload sub-fields into several variable paths.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerFieldNodeSpec {
    pub name: String,
    #[serde(default = "default_trigger_source")]
    pub source_path: String,
    #[serde(default)]
    pub fields: Vec<FieldMapping>,
    #[serde(flatten)]
    pub runtime: NodeRuntimeConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubGraphNodeSpec {
    pub name: String,
    /// Key into `RunRequest::subgraphs`.
    pub subgraph_id: String,
    #[serde(flatten)]
    pub runtime: NodeRuntimeConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionGroup {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub expression: String,
    #[serde(default)]
    pub manipulation: Option<String>,
    pub route_code: String,
    #[serde(default)]
    pub continue_flag: bool,
    #[serde(default = "default_true")]
    pub dock_visible: bool,
}

/// One `(route_code -> target)` wiring entry of a decision table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteWiring {
    pub route_code: String,
    pub target: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionTableNodeSpec {
    pub name: String,
    #[serde(default)]
    pub condition_groups: Vec<ConditionGroup>,
    #[serde(default)]
    pub routes: Vec<RouteWiring>,
    #[serde(default)]
    pub default_next_node: Option<String>,
    #[serde(default)]
    pub next_error_node: Option<String>,
    #[serde(flatten)]
    pub runtime: NodeRuntimeConfig,
}

/// A user-authored callback snippet run through the script service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallbackSpec {
    pub code: String,
    #[serde(default)]
    pub libraries: Vec<String>,
    #[serde(default = "default_callback_entrypoint")]
    pub entrypoint: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CodeAgentCallbacks {
    #[serde(default)]
    pub on_stream_start: Option<CallbackSpec>,
    #[serde(default)]
    pub on_chunk: Option<CallbackSpec>,
    #[serde(default)]
    pub on_complete: Option<CallbackSpec>,
}

impl CodeAgentCallbacks {
    pub fn is_empty(&self) -> bool {
        self.on_stream_start.is_none() && self.on_chunk.is_none() && self.on_complete.is_none()
    }
}

/// Per-node timing overrides; unset values fall back to `[code_agent]` config.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CodeAgentTiming {
    #[serde(default)]
    pub polling_interval_ms: Option<u64>,
    #[serde(default)]
    pub chunk_timeout_s: Option<f64>,
    #[serde(default)]
    pub inactivity_timeout_s: Option<f64>,
    #[serde(default)]
    pub max_wait_s: Option<f64>,
    #[serde(default)]
    pub silence_indicator_s: Option<f64>,
    #[serde(default)]
    pub indicator_repeat_s: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeAgentNodeSpec {
    pub name: String,
    /// Static prompt; an input parameter named `prompt` takes precedence.
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub system_prompt: Option<String>,
    /// Session title used when no `conversation_id` input is given.
    #[serde(default)]
    pub session_title: Option<String>,
    #[serde(default)]
    pub agent: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub timing: CodeAgentTiming,
    #[serde(default)]
    pub callbacks: CodeAgentCallbacks,
    #[serde(flatten)]
    pub runtime: NodeRuntimeConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeSpec {
    pub start_key: String,
    pub end_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionalEdgeSpec {
    pub source: String,
    pub predicate_code: String,
    #[serde(default)]
    pub input_map: InputMap,
    #[serde(default)]
    pub libraries: Vec<String>,
    #[serde(default = "default_entrypoint")]
    pub entrypoint: String,
    /// Optional predicate-result -> node-name translation.
    #[serde(default)]
    pub path_map: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndNodeSpec {
    #[serde(default = "default_end_name")]
    pub name: String,
    #[serde(default)]
    pub output_map: InputMap,
}

/// A complete declarative workflow.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowSchema {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub script_nodes: Vec<ScriptNodeSpec>,
    #[serde(default)]
    pub crew_nodes: Vec<CrewNodeSpec>,
    #[serde(default)]
    pub webhook_trigger_nodes: Vec<WebhookTriggerNodeSpec>,
    #[serde(default)]
    pub trigger_field_nodes: Vec<TriggerFieldNodeSpec>,
    #[serde(default)]
    pub subgraph_nodes: Vec<SubGraphNodeSpec>,
    #[serde(default)]
    pub decision_table_nodes: Vec<DecisionTableNodeSpec>,
    #[serde(default)]
    pub code_agent_nodes: Vec<CodeAgentNodeSpec>,
    #[serde(default)]
    pub edges: Vec<EdgeSpec>,
    #[serde(default)]
    pub conditional_edges: Vec<ConditionalEdgeSpec>,
    pub entry_point: String,
    #[serde(default)]
    pub end_node: Option<EndNodeSpec>,
}

impl WorkflowSchema {
    /// Parse a workflow from its JSON document.
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// All declared node names with their kind, in declaration order.
    pub fn node_names(&self) -> Vec<(&str, NodeKind)> {
        let mut names = Vec::new();
        names.extend(self.script_nodes.iter().map(|n| (n.name.as_str(), NodeKind::Script)));
        names.extend(self.crew_nodes.iter().map(|n| (n.name.as_str(), NodeKind::Crew)));
        names.extend(
            self.webhook_trigger_nodes
                .iter()
                .map(|n| (n.name.as_str(), NodeKind::WebhookTrigger)),
        );
        names.extend(
            self.trigger_field_nodes
                .iter()
                .map(|n| (n.name.as_str(), NodeKind::TriggerField)),
        );
        names.extend(self.subgraph_nodes.iter().map(|n| (n.name.as_str(), NodeKind::SubGraph)));
        names.extend(
            self.decision_table_nodes
                .iter()
                .map(|n| (n.name.as_str(), NodeKind::DecisionTable)),
        );
        names.extend(
            self.code_agent_nodes
                .iter()
                .map(|n| (n.name.as_str(), NodeKind::CodeAgent)),
        );
        if let Some(end) = &self.end_node {
            names.push((end.name.as_str(), NodeKind::End));
        }
        names
    }
}

/// One workflow run request, as published on the `run` control topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRequest {
    #[serde(default)]
    pub run_id: RunId,
    pub schema: WorkflowSchema,
    /// Pre-resolved nested workflows, keyed by subgraph id.
    #[serde(default)]
    pub subgraphs: HashMap<String, WorkflowSchema>,
    #[serde(default)]
    pub variables: serde_json::Map<String, serde_json::Value>,
}

impl RunRequest {
    /// Request with a fresh run id, no variables and no subgraphs.
    pub fn new(schema: WorkflowSchema) -> Self {
        Self {
            run_id: RunId::new(),
            schema,
            subgraphs: HashMap::new(),
            variables: serde_json::Map::new(),
        }
    }
}
