use std::collections::HashMap;
use std::sync::Mutex;

use futures::future::BoxFuture;
use futures::stream::{self, BoxStream, StreamExt};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crewgraph_core::error::{CrewGraphError, Result};
use crewgraph_core::traits::MessageBroker;
use crewgraph_core::types::BrokerMessage;

/// In-process pub/sub broker, one broadcast channel per topic.
///
/// Messages published before anyone subscribed to a topic are dropped.
pub struct LocalBroker {
    topics: Mutex<HashMap<String, broadcast::Sender<BrokerMessage>>>,
    capacity: usize,
}

impl LocalBroker {
    /// Create a broker whose topics buffer `capacity` messages.
    pub fn new(capacity: usize) -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    fn sender(&self, topic: &str) -> Result<broadcast::Sender<BrokerMessage>> {
        let mut topics = self
            .topics
            .lock()
            .map_err(|_| CrewGraphError::Broker("topic registry poisoned".into()))?;
        Ok(topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone())
    }
}

impl Default for LocalBroker {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl MessageBroker for LocalBroker {
    fn publish(&self, topic: &str, payload: serde_json::Value) -> BoxFuture<'_, Result<()>> {
        let topic = topic.to_string();
        Box::pin(async move {
            let sender = self.sender(&topic)?;
            let receivers = sender
                .send(BrokerMessage {
                    topic: topic.clone(),
                    payload,
                })
                .unwrap_or(0);
            debug!(topic = %topic, receivers, "Published");
            Ok(())
        })
    }

    fn subscribe(&self, topic: &str) -> BoxFuture<'_, Result<BoxStream<'static, BrokerMessage>>> {
        let topic = topic.to_string();
        Box::pin(async move {
            let rx = self.sender(&topic)?.subscribe();
            let stream = stream::unfold(rx, move |mut rx| async move {
                loop {
                    match rx.recv().await {
                        Ok(message) => return Some((message, rx)),
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!(skipped = n, "Broker subscriber lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            });
            Ok(stream.boxed())
        })
    }
}
