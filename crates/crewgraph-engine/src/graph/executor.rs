use std::collections::{HashMap, VecDeque};
use std::time::Instant;

use futures::future::BoxFuture;
use tracing::{debug, info};

use crewgraph_core::error::{CrewGraphError, Result};
use crewgraph_core::schema::{END, START};
use crewgraph_core::variables::ExecutionState;

use super::edge::Route;
use super::node::CompiledNode;
use crate::context::RunContext;

/// A compiled workflow, ready to run against an `ExecutionState`.
///
/// Runs from the entry node (plus any other `__start__` edge targets) with a
/// FIFO frontier. After a node completes,
/// its conditional routes are resolved first, then its plain edges are
/// queued in declaration order. `__end__` and dead ends terminate a branch.
pub struct ExecutableGraph {
    pub(crate) nodes: HashMap<String, CompiledNode>,
    pub(crate) edges: HashMap<String, Vec<String>>,
    pub(crate) routes: HashMap<String, Vec<Route>>,
    pub(crate) entry: String,
    pub(crate) recursion_limit: usize,
}

impl ExecutableGraph {
    /// Name of the entry node.
    pub fn entry(&self) -> &str {
        &self.entry
    }

    /// Look up a compiled node by name.
    pub fn node(&self, name: &str) -> Option<&CompiledNode> {
        self.nodes.get(name)
    }

    pub fn node_names(&self) -> impl Iterator<Item = &str> {
        self.nodes.keys().map(String::as_str)
    }

    /// Successor names of `name` in queue order.
    async fn successors(
        &self,
        name: &str,
        state: &ExecutionState,
        ctx: &RunContext,
    ) -> Result<Vec<String>> {
        let mut next = Vec::new();
        if let Some(routes) = self.routes.get(name) {
            for route in routes {
                let target = route.next(state, ctx).await?;
                if target != END && !self.nodes.contains_key(&target) {
                    return Err(CrewGraphError::Graph(format!(
                        "route from '{name}' selected unknown node '{target}'"
                    )));
                }
                next.push(target);
            }
        }
        if let Some(edges) = self.edges.get(name) {
            next.extend(edges.iter().cloned());
        }
        Ok(next)
    }

    /// Execute the graph to completion. The stop event is checked before
    /// every node.
    pub fn run<'a>(
        &'a self,
        state: &'a mut ExecutionState,
        ctx: &'a RunContext,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let start = Instant::now();
            let mut frontier = VecDeque::from([self.entry.clone()]);
            if let Some(starts) = self.edges.get(START) {
                frontier.extend(starts.iter().filter(|s| **s != self.entry).cloned());
            }
            let mut steps = 0usize;

            while let Some(name) = frontier.pop_front() {
                if name == END {
                    continue;
                }
                ctx.stop.check()?;

                steps += 1;
                if steps > self.recursion_limit {
                    return Err(CrewGraphError::Graph(format!(
                        "recursion limit of {} steps reached at node '{name}'",
                        self.recursion_limit
                    )));
                }

                let node = self.nodes.get(&name).ok_or_else(|| {
                    CrewGraphError::Graph(format!("node '{name}' not found in graph"))
                })?;
                node.invoke(state, ctx).await?;

                let next = self.successors(&name, state, ctx).await?;
                if next.is_empty() {
                    debug!(run_id = %ctx.run_id, node = %name, "No outgoing edges, branch complete");
                }
                frontier.extend(next);
            }

            info!(
                run_id = %ctx.run_id,
                subgraph = ctx.subgraph.as_deref().unwrap_or(""),
                steps,
                elapsed_ms = start.elapsed().as_millis() as u64,
                "Graph run complete"
            );
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;

    use crewgraph_core::types::{MessageType, RunId, RunStatus, ScriptResponse};
    use crewgraph_core::{EventBus, NodeKind, StopEvent};
    use crewgraph_test_utils::{linear_schema, schema, MockScriptExecutor};
    use serde_json::{json, Map, Value};

    use super::*;
    use crate::context::GraphServices;
    use crate::graph::SessionGraphBuilder;

    fn arithmetic() -> MockScriptExecutor {
        MockScriptExecutor::with_handler(|req| {
            let n = |key: &str| req.inputs[key].as_i64().unwrap_or(0);
            match req.code.as_str() {
                "first" => ScriptResponse::success(&json!(n("x") * 2)),
                "second" => ScriptResponse::success(&json!(n("prev") + 1)),
                "double" => ScriptResponse::success(&json!(n("n") * 2)),
                "boom" => ScriptResponse::failure(1, "Traceback: boom"),
                "pick" => ScriptResponse::success(&json!(if n("x") > 3 { "big" } else { "small" })),
                other => ScriptResponse::success(&json!(other)),
            }
        })
    }

    fn context(script: MockScriptExecutor, events: EventBus) -> RunContext {
        let services = GraphServices::new(Arc::new(script)).with_events(events);
        RunContext::new(RunId::new(), StopEvent::new(), Arc::new(services))
    }

    fn vars(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn linear_graph_runs_in_order_and_records_history() {
        let builder = SessionGraphBuilder::new(HashMap::new());
        let graph = builder.compile(&linear_schema()).unwrap();
        let events = EventBus::new(64);
        let mut rx = events.subscribe();
        let ctx = context(arithmetic(), events);
        let mut state = ExecutionState::new(vars(json!({"x": 5})));

        graph.run(&mut state, &ctx).await.unwrap();

        assert_eq!(state.variables.get("first_out"), Some(&json!(10)));
        assert_eq!(state.variables.get("second_out"), Some(&json!(11)));
        let kinds: Vec<_> = state.history().iter().map(|h| (h.name.as_str(), h.node_type)).collect();
        assert_eq!(
            kinds,
            vec![("first", NodeKind::Script), ("second", NodeKind::Script), ("end", NodeKind::End)]
        );
        assert_eq!(builder.end_output(), Some(json!({"result": 11})));

        let mut seen = Vec::new();
        while let Ok(event) = rx.try_recv() {
            seen.push((event.node_name.clone(), event.message_type, event.step));
        }
        assert_eq!(
            seen,
            vec![
                ("first".to_string(), MessageType::Start, Some(0)),
                ("first".to_string(), MessageType::Finish, Some(0)),
                ("second".to_string(), MessageType::Start, Some(1)),
                ("second".to_string(), MessageType::Finish, Some(1)),
                ("end".to_string(), MessageType::Start, Some(2)),
                ("end".to_string(), MessageType::Finish, Some(2)),
            ]
        );
    }

    #[tokio::test]
    async fn stopped_run_executes_nothing() {
        let script = arithmetic();
        let graph = SessionGraphBuilder::new(HashMap::new())
            .compile(&linear_schema())
            .unwrap();
        let ctx = context(script.clone(), EventBus::default());
        ctx.stop.set(RunStatus::Stop);
        let mut state = ExecutionState::new(Map::new());

        let err = graph.run(&mut state, &ctx).await.unwrap_err();
        assert!(matches!(err, CrewGraphError::Cancelled(RunStatus::Stop)));
        assert!(script.requests().is_empty());
        assert!(state.history().is_empty());
    }

    #[tokio::test]
    async fn cycles_hit_the_recursion_limit() {
        let script = arithmetic();
        let graph = SessionGraphBuilder::new(HashMap::new())
            .with_recursion_limit(3)
            .compile(&schema(json!({
                "script_nodes": [{"name": "spin", "code": "spin"}],
                "edges": [{"start_key": "spin", "end_key": "spin"}],
                "entry_point": "spin"
            })))
            .unwrap();
        let ctx = context(script.clone(), EventBus::default());
        let mut state = ExecutionState::new(Map::new());

        let err = graph.run(&mut state, &ctx).await.unwrap_err();
        assert!(matches!(err, CrewGraphError::Graph(msg) if msg.contains("recursion limit")));
        assert_eq!(script.requests().len(), 3);
    }

    #[tokio::test]
    async fn predicate_result_is_translated_through_path_map() {
        let graph = SessionGraphBuilder::new(HashMap::new())
            .compile(&schema(json!({
                "script_nodes": [
                    {"name": "check", "code": "check"},
                    {"name": "high", "code": "high", "output_variable_path": "branch"},
                    {"name": "low", "code": "low", "output_variable_path": "branch"}
                ],
                "conditional_edges": [{
                    "source": "check",
                    "predicate_code": "pick",
                    "input_map": {"x": "x"},
                    "path_map": {"big": "high", "small": "low"}
                }],
                "edges": [
                    {"start_key": "high", "end_key": "__end__"},
                    {"start_key": "low", "end_key": "__end__"}
                ],
                "entry_point": "check"
            })))
            .unwrap();
        let ctx = context(arithmetic(), EventBus::default());
        let mut state = ExecutionState::new(vars(json!({"x": 9})));

        graph.run(&mut state, &ctx).await.unwrap();
        assert_eq!(state.variables.get("branch"), Some(&json!("high")));
        assert_eq!(state.history().len(), 2);
    }

    #[tokio::test]
    async fn predicate_result_missing_from_path_map_fails() {
        let graph = SessionGraphBuilder::new(HashMap::new())
            .compile(&schema(json!({
                "script_nodes": [
                    {"name": "check", "code": "check"},
                    {"name": "high", "code": "high"}
                ],
                "conditional_edges": [{
                    "source": "check",
                    "predicate_code": "pick",
                    "input_map": {"x": "x"},
                    "path_map": {"big": "high"}
                }],
                "entry_point": "check"
            })))
            .unwrap();
        let ctx = context(arithmetic(), EventBus::default());
        let mut state = ExecutionState::new(vars(json!({"x": 1})));

        let err = graph.run(&mut state, &ctx).await.unwrap_err();
        assert!(matches!(err, CrewGraphError::Graph(_)));
    }

    fn triage(expression: &str) -> crewgraph_core::WorkflowSchema {
        schema(json!({
            "script_nodes": [
                {"name": "accept", "code": "accept", "output_variable_path": "verdict"},
                {"name": "reject", "code": "reject", "output_variable_path": "verdict"},
                {"name": "oops", "code": "oops", "output_variable_path": "verdict"}
            ],
            "decision_table_nodes": [{
                "name": "gate",
                "condition_groups": [
                    {"expression": expression, "route_code": "pass", "manipulation": "checked = true"}
                ],
                "routes": [{"route_code": "pass", "target": "accept"}],
                "default_next_node": "reject",
                "next_error_node": "oops",
                "output_variable_path": "gate_result"
            }],
            "entry_point": "gate"
        }))
    }

    #[tokio::test]
    async fn decision_table_routes_on_matching_group() {
        let graph = SessionGraphBuilder::new(HashMap::new())
            .compile(&triage("score >= 50"))
            .unwrap();
        let ctx = context(arithmetic(), EventBus::default());

        let mut state = ExecutionState::new(vars(json!({"score": 80})));
        graph.run(&mut state, &ctx).await.unwrap();
        assert_eq!(state.variables.get("verdict"), Some(&json!("accept")));
        assert_eq!(state.variables.get("checked"), Some(&json!(true)));
        assert_eq!(state.variables.get("gate_result.route_code"), Some(&json!("pass")));
        assert_eq!(
            state.node_signal("gate").and_then(|s| s.get("result_node")),
            Some(&json!("accept"))
        );

        let mut state = ExecutionState::new(vars(json!({"score": 10})));
        graph.run(&mut state, &ctx).await.unwrap();
        assert_eq!(state.variables.get("verdict"), Some(&json!("reject")));
        assert_eq!(state.variables.get("checked"), None);
    }

    #[tokio::test]
    async fn decision_table_errors_take_the_error_route() {
        let graph = SessionGraphBuilder::new(HashMap::new())
            .compile(&triage("score >"))
            .unwrap();
        let ctx = context(arithmetic(), EventBus::default());
        let mut state = ExecutionState::new(vars(json!({"score": 80})));

        graph.run(&mut state, &ctx).await.unwrap();
        assert_eq!(state.variables.get("verdict"), Some(&json!("oops")));
        assert!(state.variables.get("gate_result.error").is_some());
    }

    #[tokio::test]
    async fn subgraph_runs_against_child_state() {
        let mut subgraphs = HashMap::new();
        subgraphs.insert(
            "doubler".to_string(),
            schema(json!({
                "script_nodes": [{
                    "name": "double",
                    "code": "double",
                    "input_map": {"n": "n"},
                    "output_variable_path": "n"
                }],
                "entry_point": "double"
            })),
        );
        let graph = SessionGraphBuilder::new(subgraphs)
            .compile(&schema(json!({
                "subgraph_nodes": [{
                    "name": "sub",
                    "subgraph_id": "doubler",
                    "input_map": {"n": "value"},
                    "output_variable_path": "child"
                }],
                "entry_point": "sub"
            })))
            .unwrap();
        let events = EventBus::new(64);
        let mut rx = events.subscribe();
        let ctx = context(arithmetic(), events);
        let mut state = ExecutionState::new(vars(json!({"value": 21})));

        graph.run(&mut state, &ctx).await.unwrap();

        assert_eq!(state.variables.get("child"), Some(&json!({"n": 42})));
        assert_eq!(state.variables.get("n"), None);
        assert_eq!(state.history().len(), 1);
        assert_eq!(state.history()[0].node_type, NodeKind::SubGraph);

        let mut nested = 0;
        while let Ok(event) = rx.try_recv() {
            if event.node_name == "double" {
                assert_eq!(event.subgraph.as_deref(), Some("sub"));
                nested += 1;
            }
        }
        assert_eq!(nested, 2);
    }

    #[tokio::test]
    async fn failing_node_emits_error_and_stops_the_branch() {
        let script = arithmetic();
        let graph = SessionGraphBuilder::new(HashMap::new())
            .compile(&schema(json!({
                "script_nodes": [
                    {"name": "bad", "code": "boom"},
                    {"name": "after", "code": "after"}
                ],
                "edges": [{"start_key": "bad", "end_key": "after"}],
                "entry_point": "bad"
            })))
            .unwrap();
        let events = EventBus::new(16);
        let mut rx = events.subscribe();
        let ctx = context(script.clone(), events);
        let mut state = ExecutionState::new(Map::new());

        let err = graph.run(&mut state, &ctx).await.unwrap_err();
        assert!(matches!(err, CrewGraphError::ScriptExecution { return_code: 1, .. }));
        assert_eq!(script.requests().len(), 1);

        let types: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|e| e.message_type)
            .collect();
        assert_eq!(types, vec![MessageType::Start, MessageType::Error]);
    }

    #[tokio::test]
    async fn start_edges_fan_out_breadth_first() {
        let script = arithmetic();
        let graph = SessionGraphBuilder::new(HashMap::new())
            .compile(&schema(json!({
                "script_nodes": [
                    {"name": "a", "code": "a"},
                    {"name": "b", "code": "b"},
                    {"name": "c", "code": "c"}
                ],
                "edges": [
                    {"start_key": "__start__", "end_key": "a"},
                    {"start_key": "__start__", "end_key": "b"},
                    {"start_key": "a", "end_key": "c"}
                ],
                "entry_point": "a"
            })))
            .unwrap();
        let ctx = context(script.clone(), EventBus::default());
        let mut state = ExecutionState::new(Map::new());

        graph.run(&mut state, &ctx).await.unwrap();
        let order: Vec<_> = state.history().iter().map(|h| h.name.clone()).collect();
        assert_eq!(order, vec!["a", "b", "c"]);
    }
}
