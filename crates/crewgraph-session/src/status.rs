use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::RwLock;
use tracing::debug;

use crewgraph_core::error::Result;
use crewgraph_core::traits::{MessageBroker, StatusStore};
use crewgraph_core::types::{RunId, StatusUpdate};

/// Status store kept in process memory.
#[derive(Default)]
pub struct InMemoryStatusStore {
    statuses: RwLock<HashMap<RunId, StatusUpdate>>,
}

impl InMemoryStatusStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every recorded status, in no particular order.
    pub async fn all(&self) -> Vec<StatusUpdate> {
        self.statuses.read().await.values().cloned().collect()
    }
}

impl StatusStore for InMemoryStatusStore {
    fn set_status(&self, update: StatusUpdate) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.statuses
                .write()
                .await
                .insert(update.run_id.clone(), update);
            Ok(())
        })
    }

    fn get_status(&self, run_id: &RunId) -> BoxFuture<'_, Result<Option<StatusUpdate>>> {
        let run_id = run_id.clone();
        Box::pin(async move { Ok(self.statuses.read().await.get(&run_id).cloned()) })
    }
}

/// Publishes every status write to the status topic and keeps the latest
/// value per run for reads.
pub struct BrokerStatusStore {
    broker: Arc<dyn MessageBroker>,
    topic: String,
    cache: InMemoryStatusStore,
}

impl BrokerStatusStore {
    /// Publish updates on `topic` and cache them locally.
    pub fn new(broker: Arc<dyn MessageBroker>, topic: impl Into<String>) -> Self {
        Self {
            broker,
            topic: topic.into(),
            cache: InMemoryStatusStore::new(),
        }
    }
}

impl StatusStore for BrokerStatusStore {
    fn set_status(&self, update: StatusUpdate) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let payload = serde_json::to_value(&update)?;
            debug!(run_id = %update.run_id, status = %update.status, "Publishing run status");
            self.cache.set_status(update).await?;
            self.broker.publish(&self.topic, payload).await
        })
    }

    fn get_status(&self, run_id: &RunId) -> BoxFuture<'_, Result<Option<StatusUpdate>>> {
        self.cache.get_status(run_id)
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use crewgraph_core::types::RunStatus;

    use super::*;
    use crate::broker::LocalBroker;

    #[tokio::test]
    async fn broker_store_publishes_and_remembers() {
        let broker = Arc::new(LocalBroker::default());
        let mut updates = broker.subscribe("status").await.unwrap();
        let store = BrokerStatusStore::new(broker.clone(), "status");
        let run_id = RunId::from_string("run-1");

        store
            .set_status(StatusUpdate {
                run_id: run_id.clone(),
                status: RunStatus::Error,
                error: Some("boom".into()),
            })
            .await
            .unwrap();

        let message = updates.next().await.unwrap();
        assert_eq!(message.payload["status"], "error");
        assert_eq!(message.payload["error"], "boom");
        let stored = store.get_status(&run_id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Error);
        assert!(store
            .get_status(&RunId::from_string("other"))
            .await
            .unwrap()
            .is_none());
    }
}
