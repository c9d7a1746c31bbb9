use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tracing::debug;

use crewgraph_core::error::{CrewGraphError, Result};
use crewgraph_core::schema::{NodeRuntimeConfig, RunRequest, WorkflowSchema, END, START};

use super::edge::{Predicate, Route};
use super::executor::ExecutableGraph;
use super::node::{CompiledNode, NodeVariant};
use crate::nodes::end::EndOutputSlot;
use crate::nodes::{
    CodeAgentNode, CrewNode, DecisionGraph, EndNode, ScriptNode, SubGraphNode, TriggerFieldNode,
    WebhookTriggerNode,
};

const DEFAULT_RECURSION_LIMIT: usize = 25;

/// Compiles a `WorkflowSchema` into an `ExecutableGraph`.
///
/// Nested workflows are resolved from the pre-fetched subgraph map and
/// compiled recursively. The root graph's end node records its output in
/// a slot readable through [`SessionGraphBuilder::end_output`].
pub struct SessionGraphBuilder {
    subgraphs: HashMap<String, WorkflowSchema>,
    recursion_limit: usize,
    end_output: EndOutputSlot,
}

impl SessionGraphBuilder {
    /// Builder resolving subgraph nodes against `subgraphs`.
    pub fn new(subgraphs: HashMap<String, WorkflowSchema>) -> Self {
        Self {
            subgraphs,
            recursion_limit: DEFAULT_RECURSION_LIMIT,
            end_output: Arc::new(Mutex::new(None)),
        }
    }

    /// Builder for the subgraphs shipped with a run request.
    pub fn for_request(request: &RunRequest) -> Self {
        Self::new(request.subgraphs.clone())
    }

    /// Cap node executions per graph.
    pub fn with_recursion_limit(mut self, limit: usize) -> Self {
        self.recursion_limit = limit.max(1);
        self
    }

    /// Output recorded by the root end node, once it has run.
    pub fn end_output(&self) -> Option<Value> {
        self.end_output.lock().ok().and_then(|slot| slot.clone())
    }

    /// Validate `schema` and build its executable graph.
    pub fn compile(&self, schema: &WorkflowSchema) -> Result<ExecutableGraph> {
        let mut stack = Vec::new();
        self.compile_graph(schema, self.end_output.clone(), &mut stack)
    }

    fn compile_graph(
        &self,
        schema: &WorkflowSchema,
        slot: EndOutputSlot,
        stack: &mut Vec<String>,
    ) -> Result<ExecutableGraph> {
        let label = schema.name.as_deref().unwrap_or("workflow");
        check_names(schema)?;

        let mut nodes: HashMap<String, CompiledNode> = HashMap::new();
        let mut routes: HashMap<String, Vec<Route>> = HashMap::new();
        let mut add = |name: &str, runtime: &NodeRuntimeConfig, variant: NodeVariant| -> Result<()> {
            runtime.input_map.validate(name)?;
            nodes.insert(
                name.to_string(),
                CompiledNode::new(name, runtime.clone(), variant),
            );
            Ok(())
        };

        for spec in &schema.script_nodes {
            add(&spec.name, &spec.runtime, NodeVariant::Script(ScriptNode::new(spec.clone())))?;
        }
        for spec in &schema.webhook_trigger_nodes {
            add(
                &spec.name,
                &spec.runtime,
                NodeVariant::WebhookTrigger(WebhookTriggerNode::new(spec.clone())),
            )?;
        }
        for spec in &schema.trigger_field_nodes {
            add(
                &spec.name,
                &spec.runtime,
                NodeVariant::TriggerField(TriggerFieldNode::new(spec.clone())),
            )?;
        }
        for spec in &schema.crew_nodes {
            add(&spec.name, &spec.runtime, NodeVariant::Crew(CrewNode::new(spec.clone())))?;
        }
        for spec in &schema.code_agent_nodes {
            add(
                &spec.name,
                &spec.runtime,
                NodeVariant::CodeAgent(CodeAgentNode::new(spec.clone())),
            )?;
        }
        for spec in &schema.subgraph_nodes {
            let child_schema = self.subgraphs.get(&spec.subgraph_id).ok_or_else(|| {
                CrewGraphError::Graph(format!(
                    "subgraph node '{}' references unknown subgraph '{}'",
                    spec.name, spec.subgraph_id
                ))
            })?;
            if stack.contains(&spec.subgraph_id) {
                return Err(CrewGraphError::Graph(format!(
                    "circular subgraph reference: {} -> {}",
                    stack.join(" -> "),
                    spec.subgraph_id
                )));
            }
            stack.push(spec.subgraph_id.clone());
            let child = self.compile_graph(child_schema, Arc::new(Mutex::new(None)), stack);
            stack.pop();
            let child = child?;
            add(
                &spec.name,
                &spec.runtime,
                NodeVariant::SubGraph(SubGraphNode::new(spec.subgraph_id.clone(), Arc::new(child))),
            )?;
        }
        for spec in &schema.decision_table_nodes {
            add(
                &spec.name,
                &spec.runtime,
                NodeVariant::DecisionTable(DecisionGraph::new(spec)),
            )?;
        }
        if let Some(end) = &schema.end_node {
            end.output_map.validate(&end.name)?;
            add(
                &end.name,
                &NodeRuntimeConfig::default(),
                NodeVariant::End(EndNode::new(end.output_map.clone(), slot)),
            )?;
        }

        let exists = |name: &str| name == END || nodes.contains_key(name);

        if !nodes.contains_key(&schema.entry_point) {
            return Err(CrewGraphError::Graph(format!(
                "entry point '{}' of {label} is not a node",
                schema.entry_point
            )));
        }

        let mut edges: HashMap<String, Vec<String>> = HashMap::new();
        for edge in &schema.edges {
            if edge.start_key == END || (edge.start_key != START && !nodes.contains_key(&edge.start_key)) {
                return Err(CrewGraphError::Graph(format!(
                    "edge start '{}' is not a node",
                    edge.start_key
                )));
            }
            if edge.end_key == START || !exists(&edge.end_key) {
                return Err(CrewGraphError::Graph(format!(
                    "edge '{}' -> '{}' points to an unknown node",
                    edge.start_key, edge.end_key
                )));
            }
            edges
                .entry(edge.start_key.clone())
                .or_default()
                .push(edge.end_key.clone());
        }

        for cond in &schema.conditional_edges {
            if !nodes.contains_key(&cond.source) {
                return Err(CrewGraphError::Graph(format!(
                    "conditional edge source '{}' is not a node",
                    cond.source
                )));
            }
            cond.input_map.validate(&cond.source)?;
            if let Some(path_map) = &cond.path_map {
                if let Some((key, target)) = path_map.iter().find(|(_, target)| !exists(target)) {
                    return Err(CrewGraphError::Graph(format!(
                        "path_map of '{}' maps '{key}' to unknown node '{target}'",
                        cond.source
                    )));
                }
            }
            routes
                .entry(cond.source.clone())
                .or_default()
                .push(Route::Predicate(Predicate::new(cond)));
        }

        for spec in &schema.decision_table_nodes {
            let unknown = match nodes.get(&spec.name).map(CompiledNode::variant) {
                Some(NodeVariant::DecisionTable(table)) => table.targets().find(|t| !exists(t)),
                _ => None,
            };
            if let Some(target) = unknown {
                return Err(CrewGraphError::Graph(format!(
                    "decision table '{}' routes to unknown node '{target}'",
                    spec.name
                )));
            }
            routes
                .entry(spec.name.clone())
                .or_default()
                .push(Route::TableSignal {
                    table: spec.name.clone(),
                });
        }

        debug!(
            workflow = %label,
            nodes = nodes.len(),
            edges = schema.edges.len(),
            conditional = schema.conditional_edges.len(),
            "Workflow compiled"
        );

        Ok(ExecutableGraph {
            nodes,
            edges,
            routes,
            entry: schema.entry_point.clone(),
            recursion_limit: self.recursion_limit,
        })
    }
}

/// Unique, non-reserved node names.
fn check_names(schema: &WorkflowSchema) -> Result<()> {
    let mut seen = HashSet::new();
    for (name, kind) in schema.node_names() {
        if name == START || name == END {
            return Err(CrewGraphError::Graph(format!(
                "'{name}' is reserved and cannot name a {kind} node"
            )));
        }
        if name.trim().is_empty() {
            return Err(CrewGraphError::Graph(format!("a {kind} node has an empty name")));
        }
        if !seen.insert(name) {
            return Err(CrewGraphError::Graph(format!("duplicate node name '{name}'")));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use crewgraph_test_utils::{linear_schema, schema};
    use serde_json::json;

    use super::*;

    fn compile_err(value: serde_json::Value) -> String {
        match SessionGraphBuilder::new(HashMap::new()).compile(&schema(value)) {
            Err(CrewGraphError::Graph(msg)) => msg,
            Err(other) => panic!("expected a graph error, got {other}"),
            Ok(_) => panic!("expected compilation to fail"),
        }
    }

    #[test]
    fn linear_schema_compiles() {
        let graph = SessionGraphBuilder::new(HashMap::new())
            .compile(&linear_schema())
            .unwrap();
        assert_eq!(graph.entry(), "first");
        let mut names: Vec<_> = graph.node_names().collect();
        names.sort();
        assert_eq!(names, vec!["end", "first", "second"]);
        assert_eq!(graph.node("end").unwrap().kind(), crewgraph_core::NodeKind::End);
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let msg = compile_err(json!({
            "script_nodes": [{"name": "a", "code": ""}],
            "crew_nodes": [{"name": "a"}],
            "entry_point": "a"
        }));
        assert!(msg.contains("duplicate"));
    }

    #[test]
    fn sentinel_names_are_reserved() {
        let msg = compile_err(json!({
            "script_nodes": [{"name": "__end__", "code": ""}],
            "entry_point": "__end__"
        }));
        assert!(msg.contains("reserved"));
    }

    #[test]
    fn entry_point_must_exist() {
        let msg = compile_err(json!({
            "script_nodes": [{"name": "a", "code": ""}],
            "entry_point": "b"
        }));
        assert!(msg.contains("entry point"));
    }

    #[test]
    fn edges_must_reference_nodes() {
        compile_err(json!({
            "script_nodes": [{"name": "a", "code": ""}],
            "edges": [{"start_key": "a", "end_key": "ghost"}],
            "entry_point": "a"
        }));
        compile_err(json!({
            "script_nodes": [{"name": "a", "code": ""}],
            "edges": [{"start_key": "__end__", "end_key": "a"}],
            "entry_point": "a"
        }));
    }

    #[test]
    fn input_map_string_must_be_variables() {
        let msg = compile_err(json!({
            "script_nodes": [{"name": "a", "code": "", "input_map": "vars"}],
            "entry_point": "a"
        }));
        assert!(msg.contains("input_map"));
    }

    #[test]
    fn path_map_targets_are_checked() {
        let msg = compile_err(json!({
            "script_nodes": [{"name": "a", "code": ""}],
            "conditional_edges": [{
                "source": "a",
                "predicate_code": "",
                "path_map": {"yes": "__end__", "no": "nowhere"}
            }],
            "entry_point": "a"
        }));
        assert!(msg.contains("nowhere"));
    }

    #[test]
    fn decision_table_targets_are_checked() {
        let msg = compile_err(json!({
            "decision_table_nodes": [{
                "name": "t",
                "routes": [{"route_code": "A", "target": "missing"}],
                "default_next_node": "__end__"
            }],
            "entry_point": "t"
        }));
        assert!(msg.contains("missing"));
    }

    #[test]
    fn unknown_subgraph_is_rejected() {
        let msg = compile_err(json!({
            "subgraph_nodes": [{"name": "s", "subgraph_id": "nope"}],
            "entry_point": "s"
        }));
        assert!(msg.contains("nope"));
    }

    #[test]
    fn circular_subgraphs_are_rejected() {
        let mut subgraphs = HashMap::new();
        subgraphs.insert(
            "one".to_string(),
            schema(json!({
                "subgraph_nodes": [{"name": "to_two", "subgraph_id": "two"}],
                "entry_point": "to_two"
            })),
        );
        subgraphs.insert(
            "two".to_string(),
            schema(json!({
                "subgraph_nodes": [{"name": "to_one", "subgraph_id": "one"}],
                "entry_point": "to_one"
            })),
        );
        let root = schema(json!({
            "subgraph_nodes": [{"name": "start", "subgraph_id": "one"}],
            "entry_point": "start"
        }));

        match SessionGraphBuilder::new(subgraphs).compile(&root) {
            Err(CrewGraphError::Graph(msg)) => assert!(msg.contains("circular")),
            _ => panic!("expected a circular reference error"),
        }
    }

    #[test]
    fn shared_subgraph_used_twice_is_not_circular() {
        let mut subgraphs = HashMap::new();
        subgraphs.insert(
            "leaf".to_string(),
            schema(json!({
                "script_nodes": [{"name": "work", "code": ""}],
                "entry_point": "work"
            })),
        );
        let root = schema(json!({
            "subgraph_nodes": [
                {"name": "first", "subgraph_id": "leaf"},
                {"name": "second", "subgraph_id": "leaf"}
            ],
            "edges": [{"start_key": "first", "end_key": "second"}],
            "entry_point": "first"
        }));
        assert!(SessionGraphBuilder::new(subgraphs).compile(&root).is_ok());
    }
}
