use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{CrewGraphError, Result};

/// Top-level crewgraph configuration. Every section is optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub sessions: SessionsConfig,
    #[serde(default)]
    pub topics: TopicsConfig,
    #[serde(default)]
    pub script_service: ScriptServiceConfig,
    #[serde(default)]
    pub code_agent: CodeAgentConfig,
    #[serde(default)]
    pub gateway: Option<GatewayConfig>,
    /// JSONL telemetry logging.
    #[serde(default)]
    pub log: Option<LogConfig>,
}

/// Graph execution limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum number of node executions per graph before the run is aborted.
    #[serde(default = "default_recursion_limit")]
    pub recursion_limit: usize,
    /// Grace period granted to a pending callback when a code-agent node is stopped.
    #[serde(default = "default_callback_grace_ms")]
    pub callback_grace_ms: u64,
    /// How long a finishing code-agent node waits for its callback chain.
    #[serde(default = "default_callback_drain_ms")]
    pub callback_drain_ms: u64,
    #[serde(default = "default_event_bus_capacity")]
    pub event_bus_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            recursion_limit: default_recursion_limit(),
            callback_grace_ms: default_callback_grace_ms(),
            callback_drain_ms: default_callback_drain_ms(),
            event_bus_capacity: default_event_bus_capacity(),
        }
    }
}

fn default_recursion_limit() -> usize { 25 }
fn default_callback_grace_ms() -> u64 { 2_000 }
fn default_callback_drain_ms() -> u64 { 10_000 }
fn default_event_bus_capacity() -> usize { 1024 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionsConfig {
    #[serde(default = "default_max_concurrent_sessions")]
    pub max_concurrent_sessions: usize,
    /// Finished runs kept in the manager's snapshot before the oldest are evicted.
    #[serde(default = "default_retained_runs")]
    pub retained_runs: usize,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            max_concurrent_sessions: default_max_concurrent_sessions(),
            retained_runs: default_retained_runs(),
        }
    }
}

fn default_max_concurrent_sessions() -> usize { 20 }
fn default_retained_runs() -> usize { 1000 }

/// Broker topic names for the control, telemetry and status channels.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicsConfig {
    #[serde(default = "default_run_topic")]
    pub run: String,
    #[serde(default = "default_stop_topic")]
    pub stop: String,
    #[serde(default = "default_timeout_topic")]
    pub timeout: String,
    #[serde(default = "default_telemetry_topic")]
    pub telemetry: String,
    #[serde(default = "default_status_topic")]
    pub status: String,
}

impl Default for TopicsConfig {
    fn default() -> Self {
        Self {
            run: default_run_topic(),
            stop: default_stop_topic(),
            timeout: default_timeout_topic(),
            telemetry: default_telemetry_topic(),
            status: default_status_topic(),
        }
    }
}

fn default_run_topic() -> String { "run".to_string() }
fn default_stop_topic() -> String { "stop".to_string() }
fn default_timeout_topic() -> String { "timeout".to_string() }
fn default_telemetry_topic() -> String { "telemetry".to_string() }
fn default_status_topic() -> String { "status".to_string() }

/// Retry configuration for outbound HTTP requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

fn default_max_retries() -> u32 { 3 }
fn default_initial_backoff() -> u64 { 500 }
fn default_max_backoff() -> u64 { 10_000 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptServiceConfig {
    #[serde(default = "default_script_base_url")]
    pub base_url: String,
    #[serde(default = "default_script_timeout")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for ScriptServiceConfig {
    fn default() -> Self {
        Self {
            base_url: default_script_base_url(),
            timeout_secs: default_script_timeout(),
            retry: RetryConfig::default(),
        }
    }
}

fn default_script_base_url() -> String { "http://127.0.0.1:8060".to_string() }
fn default_script_timeout() -> u64 { 120 }

/// Remote coding-agent service plus default timings for code-agent nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeAgentConfig {
    #[serde(default = "default_agent_base_url")]
    pub base_url: String,
    #[serde(default = "default_agent_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default = "default_polling_interval_ms")]
    pub polling_interval_ms: u64,
    #[serde(default = "default_chunk_timeout_s")]
    pub chunk_timeout_s: f64,
    #[serde(default = "default_inactivity_timeout_s")]
    pub inactivity_timeout_s: f64,
    #[serde(default = "default_max_wait_s")]
    pub max_wait_s: f64,
    #[serde(default = "default_silence_indicator_s")]
    pub silence_indicator_s: f64,
    #[serde(default = "default_indicator_repeat_s")]
    pub indicator_repeat_s: f64,
    /// Consecutive failed status/message reads tolerated before the node fails.
    #[serde(default = "default_max_poll_failures")]
    pub max_poll_failures: u32,
}

impl Default for CodeAgentConfig {
    fn default() -> Self {
        Self {
            base_url: default_agent_base_url(),
            request_timeout_secs: default_agent_request_timeout(),
            retry: RetryConfig::default(),
            polling_interval_ms: default_polling_interval_ms(),
            chunk_timeout_s: default_chunk_timeout_s(),
            inactivity_timeout_s: default_inactivity_timeout_s(),
            max_wait_s: default_max_wait_s(),
            silence_indicator_s: default_silence_indicator_s(),
            indicator_repeat_s: default_indicator_repeat_s(),
            max_poll_failures: default_max_poll_failures(),
        }
    }
}

fn default_agent_base_url() -> String { "http://127.0.0.1:4096".to_string() }
fn default_agent_request_timeout() -> u64 { 30 }
fn default_polling_interval_ms() -> u64 { 1_000 }
fn default_chunk_timeout_s() -> f64 { 120.0 }
fn default_inactivity_timeout_s() -> f64 { 300.0 }
fn default_max_wait_s() -> f64 { 3_600.0 }
fn default_silence_indicator_s() -> f64 { 10.0 }
fn default_indicator_repeat_s() -> f64 { 5.0 }
fn default_max_poll_failures() -> u32 { 5 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String { "127.0.0.1:8787".to_string() }

/// JSONL telemetry logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Enable telemetry logging (default: true when section is present).
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// Directory for per-run log files.
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    /// 1 = run outcome and node errors, 2 = node lifecycle, 3 = agent streams.
    #[serde(default = "default_log_level")]
    pub level: u8,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
            level: default_log_level(),
        }
    }
}

fn default_log_enabled() -> bool { true }
fn default_log_dir() -> String { "~/.crewgraph/logs".to_string() }
fn default_log_level() -> u8 { 2 }

impl LogConfig {
    /// Resolve the log directory (expand ~).
    pub fn log_dir(&self) -> PathBuf {
        if let Some(rest) = self.log_dir.strip_prefix("~/") {
            if let Some(home) = dirs_home() {
                return home.join(rest);
            }
        }
        PathBuf::from(&self.log_dir)
    }
}

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| CrewGraphError::ConfigNotFound(path.display().to_string()))?;
        Self::from_toml(&content)
    }

    /// Parse config text, expanding `${ENV_VAR}` references first.
    pub fn from_toml(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content);
        let config: Self =
            toml::from_str(&expanded).map_err(|e| CrewGraphError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.sessions.max_concurrent_sessions == 0 {
            return Err(CrewGraphError::Config(
                "sessions.max_concurrent_sessions must be at least 1".into(),
            ));
        }
        if self.engine.recursion_limit == 0 {
            return Err(CrewGraphError::Config(
                "engine.recursion_limit must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Expand `${ENV_VAR}` patterns in a string. Unset variables are kept verbatim.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => result.push_str(&format!("${{{}}}", var_name)),
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}
