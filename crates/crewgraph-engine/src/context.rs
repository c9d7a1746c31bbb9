use std::sync::Arc;

use crewgraph_core::config::{CodeAgentConfig, EngineConfig};
use crewgraph_core::error::{CrewGraphError, Result};
use crewgraph_core::traits::{CodeAgentService, CrewRunner, ScriptExecutor};
use crewgraph_core::types::{MessageType, RunId, TelemetryEvent};
use crewgraph_core::{EventBus, StopEvent};

/// Collaborators shared by every node of every run.
pub struct GraphServices {
    pub script: Arc<dyn ScriptExecutor>,
    pub agent: Option<Arc<dyn CodeAgentService>>,
    pub crew: Option<Arc<dyn CrewRunner>>,
    pub events: EventBus,
    pub engine: EngineConfig,
    pub code_agent: CodeAgentConfig,
}

impl GraphServices {
    /// Services with only a script executor and default config.
    pub fn new(script: Arc<dyn ScriptExecutor>) -> Self {
        Self {
            script,
            agent: None,
            crew: None,
            events: EventBus::default(),
            engine: EngineConfig::default(),
            code_agent: CodeAgentConfig::default(),
        }
    }

    /// Set the coding-agent service.
    pub fn with_agent(mut self, agent: Arc<dyn CodeAgentService>) -> Self {
        self.agent = Some(agent);
        self
    }

    /// Set the crew runtime.
    pub fn with_crew(mut self, crew: Arc<dyn CrewRunner>) -> Self {
        self.crew = Some(crew);
        self
    }

    /// Publish telemetry on `events`.
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    /// Use `engine` for limits and callback timings.
    pub fn with_engine_config(mut self, engine: EngineConfig) -> Self {
        self.engine = engine;
        self
    }

    /// Use `code_agent` as the default node timings.
    pub fn with_code_agent_config(mut self, code_agent: CodeAgentConfig) -> Self {
        self.code_agent = code_agent;
        self
    }

    /// The coding-agent service, or a config error naming `node`.
    pub fn agent(&self, node: &str) -> Result<Arc<dyn CodeAgentService>> {
        self.agent.clone().ok_or_else(|| {
            CrewGraphError::Config(format!(
                "node '{node}' needs a code-agent service but none is configured"
            ))
        })
    }
}

/// Per-run context handed down every call chain.
#[derive(Clone)]
pub struct RunContext {
    pub run_id: RunId,
    pub stop: StopEvent,
    pub services: Arc<GraphServices>,
    /// Enclosing subgraph node path, `None` at the root.
    pub subgraph: Option<String>,
}

impl RunContext {
    /// Context for the top level of a run.
    pub fn new(run_id: RunId, stop: StopEvent, services: Arc<GraphServices>) -> Self {
        Self {
            run_id,
            stop,
            services,
            subgraph: None,
        }
    }

    /// Context for a nested graph run by the subgraph node `node`.
    pub fn nested(&self, node: &str) -> Self {
        let subgraph = match &self.subgraph {
            Some(parent) => format!("{parent}/{node}"),
            None => node.to_string(),
        };
        Self {
            subgraph: Some(subgraph),
            ..self.clone()
        }
    }

    /// Publish a telemetry event for `node`, tagged with this context's subgraph path.
    pub fn emit(
        &self,
        node: &str,
        message_type: MessageType,
        step: usize,
        payload: serde_json::Value,
    ) {
        self.services.events.publish(
            TelemetryEvent::new(&self.run_id, node, message_type, payload)
                .with_step(step)
                .with_subgraph(self.subgraph.clone()),
        );
    }
}
