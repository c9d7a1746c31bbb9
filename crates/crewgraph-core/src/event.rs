use crate::types::TelemetryEvent;

/// Telemetry bus using a tokio broadcast channel.
/// All subscribers receive all events; slow subscribers may lag.
#[derive(Clone)]
pub struct EventBus {
    tx: tokio::sync::broadcast::Sender<TelemetryEvent>,
}

impl EventBus {
    /// Create a bus buffering up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an event. Dropped silently when nobody listens.
    pub fn publish(&self, event: TelemetryEvent) {
        // No receivers is fine
        let _ = self.tx.send(event);
    }

    /// Subscribe to every event published from now on.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<TelemetryEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
