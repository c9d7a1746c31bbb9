use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{CommandFactory, Parser, Subcommand};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crewgraph_clients::{HttpCodeAgentClient, HttpScriptExecutor};
use crewgraph_core::config::AppConfig;
use crewgraph_core::schema::WorkflowSchema;
use crewgraph_core::traits::{MessageBroker, StatusStore};
use crewgraph_core::types::RunId;
use crewgraph_core::{CrewGraphError, EventBus, ExecutionState, StopEvent};
use crewgraph_engine::{GraphServices, RunContext, SessionGraphBuilder};
use crewgraph_gateway::{AppState, GatewayServer};
use crewgraph_session::{
    BrokerStatusStore, LocalBroker, SessionManager, TelemetryBridge, TelemetryLogger,
};

#[derive(Parser)]
#[command(name = "crewgraph", version, about = "Workflow graph runtime for crews, scripts and coding agents")]
struct Cli {
    /// Path to config file
    #[arg(short, long, env = "CREWGRAPH_CONFIG", default_value = "crewgraph.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the session manager, telemetry bridge and HTTP gateway
    Serve {
        /// Skip the HTTP gateway and only consume broker topics
        #[arg(long)]
        no_gateway: bool,
    },
    /// Execute one workflow and print its end output
    Run {
        /// Workflow schema (JSON)
        schema: PathBuf,
        /// Initial variables (JSON object)
        #[arg(long)]
        vars: Option<PathBuf>,
        /// Nested workflow for subgraph nodes, as `id=path`
        #[arg(long = "subgraph", value_name = "ID=PATH")]
        subgraphs: Vec<String>,
        /// Run id (generated if omitted)
        #[arg(long)]
        run_id: Option<String>,
    },
    /// Compile a workflow without running it
    Validate {
        /// Workflow schema (JSON)
        schema: PathBuf,
        /// Nested workflow for subgraph nodes, as `id=path`
        #[arg(long = "subgraph", value_name = "ID=PATH")]
        subgraphs: Vec<String>,
    },
    /// Show the effective configuration
    Config,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("crewgraph=info,warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    // Completions never need a config file
    let config = match cli.command {
        Commands::Completions { .. } => AppConfig::default(),
        _ => load_config(&cli.config)?,
    };

    match cli.command {
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Commands::Validate { schema, subgraphs } => {
            let workflow = read_schema(&schema)?;
            let builder = SessionGraphBuilder::new(read_subgraphs(&subgraphs)?)
                .with_recursion_limit(config.engine.recursion_limit);
            let graph = builder.compile(&workflow)?;
            println!(
                "{}: ok ({} nodes, entry '{}')",
                workflow.name.as_deref().unwrap_or("workflow"),
                graph.node_names().count(),
                graph.entry()
            );
        }
        Commands::Run {
            schema,
            vars,
            subgraphs,
            run_id,
        } => {
            let workflow = read_schema(&schema)?;
            let variables = match vars {
                Some(path) => read_variables(&path)?,
                None => Map::new(),
            };
            let subgraphs = read_subgraphs(&subgraphs)?;
            let run_id = run_id
                .map(|id| RunId::from_string(&id))
                .unwrap_or_default();
            run_once(&config, workflow, subgraphs, variables, run_id).await?;
        }
        Commands::Serve { no_gateway } => serve(&config, no_gateway).await?,
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, "crewgraph", &mut std::io::stdout());
        }
    }

    Ok(())
}

fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    if path.exists() {
        info!(path = %path.display(), "Loading config");
        return Ok(AppConfig::load(path)?);
    }
    warn!(path = %path.display(), "No config file found, using defaults");
    Ok(AppConfig::default())
}

fn read_schema(path: &Path) -> anyhow::Result<WorkflowSchema> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading workflow {}", path.display()))?;
    WorkflowSchema::from_json(&text).with_context(|| format!("parsing workflow {}", path.display()))
}

fn read_variables(path: &Path) -> anyhow::Result<Map<String, Value>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading variables {}", path.display()))?;
    match serde_json::from_str(&text)? {
        Value::Object(map) => Ok(map),
        _ => bail!("variables file {} must hold a JSON object", path.display()),
    }
}

fn read_subgraphs(specs: &[String]) -> anyhow::Result<HashMap<String, WorkflowSchema>> {
    specs
        .iter()
        .map(|spec| {
            let (id, path) = spec
                .split_once('=')
                .with_context(|| format!("subgraph '{spec}' must look like id=path"))?;
            Ok((id.to_string(), read_schema(Path::new(path))?))
        })
        .collect()
}

fn build_services(config: &AppConfig, events: EventBus) -> anyhow::Result<GraphServices> {
    let script = HttpScriptExecutor::new(&config.script_service)?;
    let agent = HttpCodeAgentClient::new(&config.code_agent)?;
    info!(script = script.endpoint(), agent = %config.code_agent.base_url, "Remote services configured");
    Ok(GraphServices::new(Arc::new(script))
        .with_agent(Arc::new(agent))
        .with_events(events)
        .with_engine_config(config.engine.clone())
        .with_code_agent_config(config.code_agent.clone()))
}

fn spawn_logger(config: &AppConfig, events: &EventBus, cancel: &CancellationToken) {
    if let Some(log_config) = config.log.as_ref().filter(|l| l.enabled) {
        let logger = TelemetryLogger::from_config(log_config);
        tokio::spawn(logger.run(events.clone(), cancel.clone()));
        info!("Telemetry logger started (level {})", log_config.level);
    }
}

async fn run_once(
    config: &AppConfig,
    workflow: WorkflowSchema,
    subgraphs: HashMap<String, WorkflowSchema>,
    variables: Map<String, Value>,
    run_id: RunId,
) -> anyhow::Result<()> {
    let events = EventBus::new(config.engine.event_bus_capacity);
    let services = Arc::new(build_services(config, events.clone())?);
    let cancel = CancellationToken::new();
    spawn_logger(config, &events, &cancel);

    let builder =
        SessionGraphBuilder::new(subgraphs).with_recursion_limit(config.engine.recursion_limit);
    let graph = builder.compile(&workflow)?;

    let stop = StopEvent::new();
    let ctrl_c_stop = stop.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Stopping run...");
        ctrl_c_stop.set(crewgraph_core::RunStatus::Stop);
    });

    info!(run_id = %run_id, "Running workflow");
    let ctx = RunContext::new(run_id.clone(), stop, services);
    let mut state = ExecutionState::new(variables);
    let outcome = graph.run(&mut state, &ctx).await;
    cancel.cancel();

    match outcome {
        Ok(()) => {
            let output = builder.end_output().unwrap_or(Value::Null);
            println!("{}", serde_json::to_string_pretty(&output)?);
            Ok(())
        }
        Err(CrewGraphError::Cancelled(status)) => {
            warn!(run_id = %run_id, %status, "Run cancelled");
            Ok(())
        }
        Err(e) => {
            error!(run_id = %run_id, error = %e, "Run failed");
            Err(e.into())
        }
    }
}

async fn serve(config: &AppConfig, no_gateway: bool) -> anyhow::Result<()> {
    let events = EventBus::new(config.engine.event_bus_capacity);
    let services = Arc::new(build_services(config, events.clone())?);
    let broker: Arc<dyn MessageBroker> = Arc::new(LocalBroker::default());
    let status: Arc<dyn StatusStore> = Arc::new(BrokerStatusStore::new(
        broker.clone(),
        config.topics.status.clone(),
    ));

    let manager = SessionManager::new(services, status.clone(), config);
    let cancel = manager.shutdown_token();

    let ctrl_c_manager = manager.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Shutting down...");
        ctrl_c_manager.shutdown();
    });

    let dispatcher = manager.start();
    let bridge = TelemetryBridge::new(broker.clone(), config.topics.telemetry.clone());
    tokio::spawn(bridge.run(events.clone(), cancel.clone()));
    spawn_logger(config, &events, &cancel);

    let listener = tokio::spawn(manager.clone().listen(broker.clone(), config.topics.clone()));

    if no_gateway {
        cancel.cancelled().await;
    } else {
        let gateway = GatewayServer::new(AppState {
            config: config.gateway.clone().unwrap_or_default(),
            topics: config.topics.clone(),
            broker,
            status,
            sessions: manager.clone(),
        });
        if let Err(e) = gateway.run(cancel.clone()).await {
            manager.shutdown();
            return Err(e);
        }
    }

    match listener.await {
        Ok(Err(e)) => error!(error = %e, "Control listener failed"),
        Err(e) => error!(error = %e, "Control listener panicked"),
        Ok(Ok(())) => {}
    }
    dispatcher.await.ok();
    info!("crewgraph stopped");
    Ok(())
}
