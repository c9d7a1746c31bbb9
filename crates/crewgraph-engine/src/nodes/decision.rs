use std::collections::HashMap;

use serde_json::{json, Value};
use tracing::{debug, warn};

use crewgraph_core::error::{CrewGraphError, Result};
use crewgraph_core::schema::{ConditionGroup, DecisionTableNodeSpec};
use crewgraph_core::variables::{ExecutionState, VariableStore};

use crate::expr::{Expression, Manipulation};

/// Key under `system_variables.nodes.<table>` holding the chosen target.
pub const RESULT_NODE: &str = "result_node";

/// Outcome of walking the condition groups.
#[derive(Debug, Clone, PartialEq)]
pub struct Routing {
    pub route_code: Option<String>,
    pub result_node: String,
    pub error: Option<String>,
}

/// Compiled decision table: ordered condition groups plus the
/// `route_code -> target` wiring.
pub struct DecisionGraph {
    table: String,
    groups: Vec<ConditionGroup>,
    wiring: HashMap<String, String>,
    default_next_node: Option<String>,
    next_error_node: Option<String>,
}

impl DecisionGraph {
    /// Build the table from its node spec.
    pub fn new(spec: &DecisionTableNodeSpec) -> Self {
        Self {
            table: spec.name.clone(),
            groups: spec.condition_groups.clone(),
            wiring: spec
                .routes
                .iter()
                .map(|r| (r.route_code.clone(), r.target.clone()))
                .collect(),
            default_next_node: spec.default_next_node.clone(),
            next_error_node: spec.next_error_node.clone(),
        }
    }

    /// Every node name this table may route to.
    pub fn targets(&self) -> impl Iterator<Item = &str> {
        self.wiring
            .values()
            .map(String::as_str)
            .chain(self.default_next_node.as_deref())
            .chain(self.next_error_node.as_deref())
    }

    /// Walk the groups in order and return the last matched dock-visible
    /// route code. Matched manipulations are applied as they are found.
    fn evaluate(&self, vars: &mut VariableStore) -> Result<Option<String>> {
        let mut candidate = None;
        for group in &self.groups {
            if !Expression::parse(&group.expression)?.matches(vars)? {
                continue;
            }
            debug!(
                table = %self.table,
                route_code = %group.route_code,
                group = group.name.as_deref().unwrap_or(""),
                "Condition group matched"
            );
            if let Some(code) = group.manipulation.as_deref() {
                Manipulation::parse(code)?.apply(vars)?;
            }
            if group.dock_visible {
                candidate = Some(group.route_code.clone());
            }
            if !group.continue_flag {
                break;
            }
        }
        Ok(candidate)
    }

    /// Map a route code (or its absence) to a target node.
    pub fn resolve(&self, route_code: Option<&str>) -> Result<String> {
        match route_code {
            Some(code) => match (self.wiring.get(code), &self.default_next_node) {
                (Some(target), _) => Ok(target.clone()),
                (None, Some(default)) => Ok(default.clone()),
                (None, None) => Err(CrewGraphError::RouteNotFound {
                    table: self.table.clone(),
                    route_code: code.to_string(),
                }),
            },
            None => self.default_next_node.clone().ok_or_else(|| {
                CrewGraphError::Graph(format!(
                    "decision table '{}' matched no condition and has no default_next_node",
                    self.table
                ))
            }),
        }
    }

    /// Evaluate against `vars` and resolve the target. Evaluation errors go
    /// to `next_error_node` when one is configured.
    pub fn route(&self, vars: &mut VariableStore) -> Result<Routing> {
        match self.evaluate(vars) {
            Ok(route_code) => {
                let result_node = self.resolve(route_code.as_deref())?;
                Ok(Routing {
                    route_code,
                    result_node,
                    error: None,
                })
            }
            Err(e) if matches!(e, CrewGraphError::Expression(_)) || e.is_configuration() => {
                match &self.next_error_node {
                    Some(error_node) => {
                        warn!(table = %self.table, error = %e, "Decision table failed, taking error route");
                        Ok(Routing {
                            route_code: None,
                            result_node: error_node.clone(),
                            error: Some(e.to_string()),
                        })
                    }
                    None => Err(e),
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Evaluate the groups, apply manipulations and record the chosen route.
    pub fn execute(&self, name: &str, state: &mut ExecutionState) -> Result<Value> {
        let routing = self.route(&mut state.variables)?;
        state.set_node_signal(name, RESULT_NODE, json!(routing.result_node));
        state.set_node_signal(name, "route_code", json!(routing.route_code));
        let mut output = json!({
            "route_code": routing.route_code,
            "result_node": routing.result_node,
        });
        if let Some(error) = routing.error {
            output["error"] = json!(error);
        }
        Ok(output)
    }
}
