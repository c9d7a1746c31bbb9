use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crewgraph_core::config::LogConfig;
use crewgraph_core::traits::MessageBroker;
use crewgraph_core::types::{MessageType, RunId, TelemetryEvent};
use crewgraph_core::EventBus;

/// Forwards every telemetry event from the in-process bus to the broker's
/// telemetry topic.
pub struct TelemetryBridge {
    broker: Arc<dyn MessageBroker>,
    topic: String,
}

impl TelemetryBridge {
    /// Create a bridge publishing on `topic`.
    pub fn new(broker: Arc<dyn MessageBroker>, topic: impl Into<String>) -> Self {
        Self {
            broker,
            topic: topic.into(),
        }
    }

    /// Run until cancelled or the bus closes.
    pub async fn run(self, events: EventBus, cancel: CancellationToken) {
        let mut rx = events.subscribe();
        info!(topic = %self.topic, "Telemetry bridge started");
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                result = rx.recv() => match result {
                    Ok(event) => event,
                    Err(RecvError::Lagged(n)) => {
                        warn!(skipped = n, "Telemetry bridge lagged, events dropped");
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                },
            };
            let payload = match serde_json::to_value(&event) {
                Ok(payload) => payload,
                Err(e) => {
                    error!(error = %e, "Failed to serialize telemetry event");
                    continue;
                }
            };
            if let Err(e) = self.broker.publish(&self.topic, payload).await {
                warn!(run_id = %event.run_id, error = %e, "Failed to publish telemetry");
            }
        }
        debug!("Telemetry bridge stopped");
    }
}

/// One line of a run's JSONL log.
#[derive(Serialize)]
struct LogEntry<'a> {
    timestamp: String,
    node: &'a str,
    event_type: MessageType,
    #[serde(skip_serializing_if = "Option::is_none")]
    subgraph: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    step: Option<usize>,
    #[serde(skip_serializing_if = "is_null")]
    detail: &'a serde_json::Value,
}

fn is_null(value: &&serde_json::Value) -> bool {
    value.is_null()
}

/// JSONL telemetry logger.
///
/// Writes `{log_dir}/{run_id}/{timestamp}.jsonl`, one event per line, flushed
/// after every write so a crash keeps everything logged so far. A run's file
/// is closed when its top-level `graph_end` arrives.
pub struct TelemetryLogger {
    log_dir: PathBuf,
    level: u8,
    files: HashMap<RunId, BufWriter<File>>,
}

impl TelemetryLogger {
    /// `level`: 1 = run outcome and node errors, 2 = node lifecycle,
    /// 3 = code-agent streams.
    pub fn new(log_dir: PathBuf, level: u8) -> Self {
        Self {
            log_dir,
            level,
            files: HashMap::new(),
        }
    }

    /// Create a logger from the `[log]` section.
    pub fn from_config(config: &LogConfig) -> Self {
        Self::new(config.log_dir(), config.level)
    }

    fn wants(&self, message_type: MessageType) -> bool {
        let required = match message_type {
            MessageType::GraphEnd | MessageType::Error => 1,
            MessageType::Start | MessageType::Finish => 2,
            MessageType::CodeAgentStream => 3,
        };
        self.level >= required
    }

    /// Run the logger as a background task until cancelled.
    pub async fn run(mut self, events: EventBus, cancel: CancellationToken) {
        let mut rx = events.subscribe();
        info!(dir = %self.log_dir.display(), level = self.level, "Telemetry logger started");
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                result = rx.recv() => match result {
                    Ok(event) => event,
                    Err(RecvError::Lagged(n)) => {
                        debug!(skipped = n, "Telemetry logger lagged, skipped events");
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                },
            };
            self.record(&event).await;
        }
        for (_, mut writer) in self.files.drain() {
            writer.flush().await.ok();
        }
        debug!("Telemetry logger stopped");
    }

    async fn record(&mut self, event: &TelemetryEvent) {
        let run_finished =
            event.message_type == MessageType::GraphEnd && event.subgraph.is_none();
        if self.wants(event.message_type) {
            if let Err(e) = self.write(event).await {
                error!(run_id = %event.run_id, error = %e, "Failed to write telemetry log");
                self.files.remove(&event.run_id);
            }
        }
        if run_finished {
            if let Some(mut writer) = self.files.remove(&event.run_id) {
                writer.flush().await.ok();
            }
        }
    }

    async fn write(&mut self, event: &TelemetryEvent) -> std::io::Result<()> {
        if !self.files.contains_key(&event.run_id) {
            let writer = self.open(&event.run_id).await?;
            self.files.insert(event.run_id.clone(), writer);
        }
        let entry = LogEntry {
            timestamp: event.timestamp.to_rfc3339(),
            node: &event.node_name,
            event_type: event.message_type,
            subgraph: event.subgraph.as_deref(),
            step: event.step,
            detail: &event.payload,
        };
        let mut line = serde_json::to_string(&entry)?;
        line.push('\n');
        if let Some(writer) = self.files.get_mut(&event.run_id) {
            writer.write_all(line.as_bytes()).await?;
            writer.flush().await?;
        }
        Ok(())
    }

    async fn open(&self, run_id: &RunId) -> std::io::Result<BufWriter<File>> {
        let run_dir = self.log_dir.join(run_id.as_str());
        tokio::fs::create_dir_all(&run_dir).await?;
        let path = run_dir.join(format!("{}.jsonl", Utc::now().format("%Y%m%d_%H%M%S")));
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        debug!(path = %path.display(), "Opened run log");
        Ok(BufWriter::new(file))
    }
}
