use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::{mpsc, Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crewgraph_core::config::{AppConfig, TopicsConfig};
use crewgraph_core::error::{CrewGraphError, Result};
use crewgraph_core::schema::{RunRequest, END};
use crewgraph_core::traits::{MessageBroker, StatusStore};
use crewgraph_core::types::{
    BrokerMessage, MessageType, RunId, RunStatus, StatusUpdate, StopRequest, TelemetryEvent,
    TimeoutRequest,
};
use crewgraph_core::{ExecutionState, StopEvent};
use crewgraph_engine::{GraphServices, RunContext, SessionGraphBuilder};

/// Lifecycle of one run inside the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Enqueued,
    Running,
    Succeeded,
    Failed,
    Stopped,
    Expired,
}

impl RunState {
    /// Whether the run has finished and will not change state again.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Enqueued | Self::Running)
    }
}

impl From<RunStatus> for RunState {
    fn from(status: RunStatus) -> Self {
        match status {
            RunStatus::Run => RunState::Running,
            RunStatus::End => RunState::Succeeded,
            RunStatus::Error => RunState::Failed,
            RunStatus::Stop => RunState::Stopped,
            RunStatus::Expired => RunState::Expired,
        }
    }
}

/// Point-in-time view of one run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSnapshot {
    pub run_id: RunId,
    pub state: RunState,
    pub submitted_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

struct QueuedRun {
    run_id: RunId,
    stop: StopEvent,
    request: RunRequest,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Accepts run requests, queues them FIFO and executes them with bounded
/// concurrency.
///
/// A single dispatcher task takes runs off the queue and acquires a permit
/// before spawning each one, so runs start in arrival order. Stop and timeout
/// requests only set the run's `StopEvent`; the run notices at its next
/// checkpoint and is finalised like any other.
pub struct SessionManager {
    services: Arc<GraphServices>,
    status: Arc<dyn StatusStore>,
    recursion_limit: usize,
    retained_runs: usize,
    queue_tx: mpsc::UnboundedSender<QueuedRun>,
    queue_rx: Mutex<Option<mpsc::UnboundedReceiver<QueuedRun>>>,
    /// Stop tokens of runs that are queued or running and not yet stopped.
    pool: Mutex<HashMap<RunId, StopEvent>>,
    runs: Mutex<HashMap<RunId, RunSnapshot>>,
    permits: Arc<Semaphore>,
    finished: Notify,
    shutdown: CancellationToken,
}

impl SessionManager {
    /// Create a manager. Nothing runs until [`SessionManager::start`].
    pub fn new(
        services: Arc<GraphServices>,
        status: Arc<dyn StatusStore>,
        config: &AppConfig,
    ) -> Arc<Self> {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            services,
            status,
            recursion_limit: config.engine.recursion_limit,
            retained_runs: config.sessions.retained_runs,
            queue_tx,
            queue_rx: Mutex::new(Some(queue_rx)),
            pool: Mutex::new(HashMap::new()),
            runs: Mutex::new(HashMap::new()),
            permits: Arc::new(Semaphore::new(config.sessions.max_concurrent_sessions.max(1))),
            finished: Notify::new(),
            shutdown: CancellationToken::new(),
        })
    }

    /// Start the dispatcher. Only the first call has any effect.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let rx = lock(&self.queue_rx).take();
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            match rx {
                Some(rx) => manager.dispatch(rx).await,
                None => error!("Session dispatcher already started"),
            }
        })
    }

    /// Queue a run. Fails while an execution with the same id has not been
    /// finalised, including one that was stopped but is still winding down.
    pub fn submit(&self, request: RunRequest) -> Result<RunId> {
        let run_id = request.run_id.clone();
        let stop = StopEvent::new();
        {
            let mut pool = lock(&self.pool);
            let mut runs = lock(&self.runs);
            let unfinished = runs.get(&run_id).is_some_and(|r| !r.state.is_terminal());
            if pool.contains_key(&run_id) || unfinished {
                return Err(CrewGraphError::Config(format!("run {run_id} is already active")));
            }
            pool.insert(run_id.clone(), stop.clone());
            runs.insert(
                run_id.clone(),
                RunSnapshot {
                    run_id: run_id.clone(),
                    state: RunState::Enqueued,
                    submitted_at: Utc::now(),
                    finished_at: None,
                    error: None,
                },
            );
        }
        self.queue_tx
            .send(QueuedRun {
                run_id: run_id.clone(),
                stop,
                request,
            })
            .map_err(|_| CrewGraphError::Broker("session queue closed".into()))?;
        info!(run_id = %run_id, "Run enqueued");
        Ok(run_id)
    }

    /// Stop a queued or running run. Returns `false` for unknown ids.
    pub fn stop(&self, run_id: &RunId) -> bool {
        match lock(&self.pool).remove(run_id) {
            Some(stop) => {
                let first = stop.set(RunStatus::Stop);
                info!(run_id = %run_id, first, "Stop requested");
                true
            }
            None => {
                debug!(run_id = %run_id, "Stop for unknown run ignored");
                false
            }
        }
    }

    /// Expire a run. A run this manager has never seen is marked expired in
    /// the status store directly.
    pub async fn timeout(&self, run_id: &RunId) -> Result<()> {
        let active = lock(&self.pool).get(run_id).cloned();
        if let Some(stop) = active {
            let first = stop.set(RunStatus::Expired);
            info!(run_id = %run_id, first, "Timeout requested");
            return Ok(());
        }
        if lock(&self.runs).contains_key(run_id) {
            debug!(run_id = %run_id, "Timeout for a stopped or finished run ignored");
            return Ok(());
        }
        // Evicted runs are only known to the store.
        if let Some(previous) = self.status.get_status(run_id).await? {
            if previous.status != RunStatus::Run {
                debug!(run_id = %run_id, status = %previous.status, "Timeout for a finished run ignored");
                return Ok(());
            }
        }
        warn!(run_id = %run_id, "Timeout for unknown run, forcing expired status");
        self.status
            .set_status(StatusUpdate {
                run_id: run_id.clone(),
                status: RunStatus::Expired,
                error: None,
            })
            .await
    }

    /// Current state of a run, if it is still in the snapshot.
    pub fn state(&self, run_id: &RunId) -> Option<RunState> {
        lock(&self.runs).get(run_id).map(|r| r.state)
    }

    /// Active runs plus the most recent finished ones, oldest first.
    pub fn snapshot(&self) -> Vec<RunSnapshot> {
        let mut runs: Vec<_> = lock(&self.runs).values().cloned().collect();
        runs.sort_by_key(|r| r.submitted_at);
        runs
    }

    /// Wait until `run_id` reaches a terminal state. `None` for unknown runs.
    pub async fn wait_for(&self, run_id: &RunId) -> Option<RunState> {
        loop {
            let notified = self.finished.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            match self.state(run_id) {
                None => return None,
                Some(state) if state.is_terminal() => return Some(state),
                Some(_) => {}
            }
            notified.await;
        }
    }

    /// Stop dispatching and signal every active run to stop.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        for (run_id, stop) in lock(&self.pool).drain() {
            debug!(run_id = %run_id, "Stopping run for shutdown");
            stop.set(RunStatus::Stop);
        }
    }

    /// Token cancelled by [`SessionManager::shutdown`].
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Consume the control topics until shutdown.
    pub async fn listen(
        self: Arc<Self>,
        broker: Arc<dyn MessageBroker>,
        topics: TopicsConfig,
    ) -> Result<()> {
        let streams = vec![
            broker.subscribe(&topics.run).await?,
            broker.subscribe(&topics.stop).await?,
            broker.subscribe(&topics.timeout).await?,
        ];
        let mut messages = stream::select_all(streams);
        info!(run = %topics.run, stop = %topics.stop, timeout = %topics.timeout, "Listening for control messages");

        loop {
            let message = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                next = messages.next() => match next {
                    Some(message) => message,
                    None => break,
                },
            };
            self.handle_control(&topics, message).await;
        }
        debug!("Control listener stopped");
        Ok(())
    }

    async fn handle_control(&self, topics: &TopicsConfig, message: BrokerMessage) {
        if message.topic == topics.run {
            match serde_json::from_value::<RunRequest>(message.payload) {
                Ok(request) => {
                    if let Err(e) = self.submit(request) {
                        warn!(error = %e, "Run request rejected");
                    }
                }
                Err(e) => warn!(error = %e, "Malformed run request"),
            }
        } else if message.topic == topics.stop {
            match serde_json::from_value::<StopRequest>(message.payload) {
                Ok(request) => {
                    self.stop(&request.run_id);
                }
                Err(e) => warn!(error = %e, "Malformed stop request"),
            }
        } else if message.topic == topics.timeout {
            match serde_json::from_value::<TimeoutRequest>(message.payload) {
                Ok(request) => {
                    if let Err(e) = self.timeout(&request.run_id).await {
                        error!(run_id = %request.run_id, error = %e, "Failed to expire run");
                    }
                }
                Err(e) => warn!(error = %e, "Malformed timeout request"),
            }
        }
    }

    async fn dispatch(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<QueuedRun>) {
        info!(
            max_concurrent = self.permits.available_permits(),
            "Session dispatcher started"
        );
        loop {
            let queued = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                next = rx.recv() => match next {
                    Some(queued) => queued,
                    None => break,
                },
            };
            if let Some(status) = queued.stop.status() {
                self.finalize(&queued.run_id, &queued.stop, status, None, None).await;
                continue;
            }

            let permit = tokio::select! {
                _ = self.shutdown.cancelled() => {
                    self.finalize(&queued.run_id, &queued.stop, RunStatus::Stop, None, None).await;
                    break;
                }
                permit = Arc::clone(&self.permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            if let Some(status) = queued.stop.status() {
                drop(permit);
                self.finalize(&queued.run_id, &queued.stop, status, None, None).await;
                continue;
            }

            self.set_state(&queued.run_id, RunState::Running);
            let manager = Arc::clone(&self);
            tokio::spawn(async move { manager.execute(queued, permit).await });
        }

        while let Ok(queued) = rx.try_recv() {
            self.finalize(&queued.run_id, &queued.stop, RunStatus::Stop, None, None).await;
        }
        info!("Session dispatcher stopped");
    }

    async fn execute(self: Arc<Self>, queued: QueuedRun, _permit: OwnedSemaphorePermit) {
        let QueuedRun {
            run_id,
            stop,
            request,
        } = queued;
        info!(
            run_id = %run_id,
            workflow = request.schema.name.as_deref().unwrap_or("workflow"),
            "Run started"
        );

        let builder =
            SessionGraphBuilder::for_request(&request).with_recursion_limit(self.recursion_limit);
        let ctx = RunContext::new(run_id.clone(), stop.clone(), Arc::clone(&self.services));
        let outcome = match builder.compile(&request.schema) {
            Ok(graph) => {
                let mut state = ExecutionState::new(request.variables);
                graph.run(&mut state, &ctx).await
            }
            Err(e) => Err(e),
        };

        let (status, error) = match outcome {
            Ok(()) => (RunStatus::End, None),
            Err(CrewGraphError::Cancelled(status)) => (status, None),
            Err(e) => (RunStatus::Error, Some(e.to_string())),
        };
        self.finalize(&run_id, &stop, status, error, builder.end_output())
            .await;
    }

    async fn finalize(
        &self,
        run_id: &RunId,
        stop: &StopEvent,
        status: RunStatus,
        error: Option<String>,
        output: Option<Value>,
    ) {
        self.services.events.publish(TelemetryEvent::new(
            run_id,
            END,
            MessageType::GraphEnd,
            json!({"status": status, "output": output, "error": error}),
        ));

        if let Err(e) = self
            .status
            .set_status(StatusUpdate {
                run_id: run_id.clone(),
                status,
                error: error.clone(),
            })
            .await
        {
            error!(run_id = %run_id, error = %e, "Failed to record run status");
        }

        {
            let mut pool = lock(&self.pool);
            if pool.get(run_id).is_some_and(|current| current.same_as(stop)) {
                pool.remove(run_id);
            }
        }
        {
            let mut runs = lock(&self.runs);
            if let Some(run) = runs.get_mut(run_id) {
                run.state = RunState::from(status);
                run.finished_at = Some(Utc::now());
                run.error = error.clone();
            }
            evict_finished(&mut runs, self.retained_runs);
        }
        self.finished.notify_waiters();

        match &error {
            Some(e) => warn!(run_id = %run_id, %status, error = %e, "Run finished"),
            None => info!(run_id = %run_id, %status, "Run finished"),
        }
    }

    fn set_state(&self, run_id: &RunId, state: RunState) {
        if let Some(run) = lock(&self.runs).get_mut(run_id) {
            run.state = state;
        }
    }
}

/// Drop the oldest finished runs beyond `keep`.
fn evict_finished(runs: &mut HashMap<RunId, RunSnapshot>, keep: usize) {
    let mut finished: Vec<_> = runs
        .values()
        .filter_map(|r| r.finished_at.map(|at| (at, r.run_id.clone())))
        .collect();
    if finished.len() <= keep {
        return;
    }
    finished.sort_by_key(|(at, _)| *at);
    let excess = finished.len() - keep;
    for (_, run_id) in finished.into_iter().take(excess) {
        runs.remove(&run_id);
    }
    debug!(evicted = excess, "Evicted finished runs from snapshot");
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crewgraph_core::traits::StatusStore;
    use crewgraph_core::EventBus;
    use crewgraph_test_utils::{linear_schema, schema, MockScriptExecutor};

    use super::*;
    use crate::broker::LocalBroker;
    use crate::status::InMemoryStatusStore;

    struct Harness {
        manager: Arc<SessionManager>,
        store: Arc<InMemoryStatusStore>,
        script: MockScriptExecutor,
        events: EventBus,
    }

    fn harness(max: usize, delay: Option<Duration>) -> Harness {
        let mut config = AppConfig::default();
        config.sessions.max_concurrent_sessions = max;
        harness_with(config, delay)
    }

    fn harness_with(config: AppConfig, delay: Option<Duration>) -> Harness {
        let mut script = MockScriptExecutor::returning(json!(1));
        if let Some(delay) = delay {
            script = script.with_delay(delay);
        }
        let events = EventBus::new(256);
        let services = GraphServices::new(Arc::new(script.clone())).with_events(events.clone());
        let store = Arc::new(InMemoryStatusStore::new());
        let manager = SessionManager::new(Arc::new(services), store.clone(), &config);
        manager.start();
        Harness {
            manager,
            store,
            script,
            events,
        }
    }

    fn request(id: &str) -> RunRequest {
        let mut request = RunRequest::new(linear_schema());
        request.run_id = RunId::from_string(id);
        request
    }

    async fn stored(store: &InMemoryStatusStore, id: &str) -> Option<StatusUpdate> {
        store.get_status(&RunId::from_string(id)).await.unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn run_completes_and_reports_end() {
        let h = harness(2, None);
        let mut rx = h.events.subscribe();

        let id = h.manager.submit(request("r1")).unwrap();
        assert_eq!(h.manager.wait_for(&id).await, Some(RunState::Succeeded));

        let status = stored(&h.store, "r1").await.unwrap();
        assert_eq!(status.status, RunStatus::End);
        assert!(status.error.is_none());

        let mut graph_end = None;
        while let Ok(event) = rx.try_recv() {
            if event.message_type == MessageType::GraphEnd {
                graph_end = Some(event);
            }
        }
        let graph_end = graph_end.unwrap();
        assert_eq!(graph_end.payload["status"], "end");
        assert_eq!(graph_end.payload["output"], json!({"result": 1}));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrency_is_bounded_and_fifo() {
        let h = harness(2, Some(Duration::from_secs(10)));
        for id in ["a", "b", "c"] {
            h.manager.submit(request(id)).unwrap();
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        let states: Vec<_> = ["a", "b", "c"]
            .iter()
            .map(|id| h.manager.state(&RunId::from_string(id)).unwrap())
            .collect();
        assert_eq!(
            states,
            vec![RunState::Running, RunState::Running, RunState::Enqueued]
        );

        for id in ["a", "b", "c"] {
            let state = h.manager.wait_for(&RunId::from_string(id)).await;
            assert_eq!(state, Some(RunState::Succeeded));
        }
        assert_eq!(h.manager.snapshot().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_ends_running_run_at_next_checkpoint() {
        let h = harness(2, Some(Duration::from_secs(10)));
        let id = h.manager.submit(request("r1")).unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert!(h.manager.stop(&id));
        assert!(!h.manager.stop(&id));
        assert_eq!(h.manager.wait_for(&id).await, Some(RunState::Stopped));
        assert_eq!(stored(&h.store, "r1").await.unwrap().status, RunStatus::Stop);
        // Only the node in flight when the stop arrived ran.
        assert_eq!(h.script.requests().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stopped_queued_run_never_starts() {
        let h = harness(1, Some(Duration::from_secs(5)));
        let first = h.manager.submit(request("first")).unwrap();
        let second = h.manager.submit(request("second")).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(h.manager.state(&second), Some(RunState::Enqueued));

        h.manager.stop(&second);
        assert_eq!(h.manager.wait_for(&second).await, Some(RunState::Stopped));
        assert_eq!(h.manager.wait_for(&first).await, Some(RunState::Succeeded));
        assert_eq!(h.script.requests().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_after_stop_keeps_stop() {
        let h = harness(1, Some(Duration::from_secs(5)));
        let id = h.manager.submit(request("r1")).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        h.manager.stop(&id);
        h.manager.timeout(&id).await.unwrap();
        assert_eq!(h.manager.wait_for(&id).await, Some(RunState::Stopped));
        assert_eq!(stored(&h.store, "r1").await.unwrap().status, RunStatus::Stop);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_expires_running_run() {
        let h = harness(1, Some(Duration::from_secs(5)));
        let id = h.manager.submit(request("r1")).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        h.manager.timeout(&id).await.unwrap();
        assert_eq!(h.manager.wait_for(&id).await, Some(RunState::Expired));
        assert_eq!(stored(&h.store, "r1").await.unwrap().status, RunStatus::Expired);
    }

    #[tokio::test]
    async fn timeout_for_unknown_run_forces_expired() {
        let h = harness(1, None);
        h.manager.timeout(&RunId::from_string("ghost")).await.unwrap();
        assert_eq!(stored(&h.store, "ghost").await.unwrap().status, RunStatus::Expired);
        assert!(h.manager.state(&RunId::from_string("ghost")).is_none());
    }

    #[tokio::test]
    async fn invalid_schema_fails_the_run() {
        let h = harness(1, None);
        let mut bad = RunRequest::new(schema(json!({
            "script_nodes": [{"name": "a", "code": ""}],
            "entry_point": "missing"
        })));
        bad.run_id = RunId::from_string("bad");

        let id = h.manager.submit(bad).unwrap();
        assert_eq!(h.manager.wait_for(&id).await, Some(RunState::Failed));
        let status = stored(&h.store, "bad").await.unwrap();
        assert_eq!(status.status, RunStatus::Error);
        assert!(status.error.unwrap().contains("missing"));
    }

    #[tokio::test]
    async fn duplicate_active_run_is_rejected() {
        let h = harness(1, Some(Duration::from_secs(5)));
        h.manager.submit(request("dup")).unwrap();
        assert!(h.manager.submit(request("dup")).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn stopped_run_id_is_reusable_only_after_finalising() {
        let h = harness(2, Some(Duration::from_secs(10)));
        let id = h.manager.submit(request("dup")).unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert!(h.manager.stop(&id));
        assert!(h.manager.submit(request("dup")).is_err());
        assert_eq!(h.manager.wait_for(&id).await, Some(RunState::Stopped));

        h.manager.submit(request("dup")).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(h.manager.state(&id), Some(RunState::Running));
        assert!(h.manager.stop(&id));
        assert_eq!(h.manager.wait_for(&id).await, Some(RunState::Stopped));
        assert_eq!(h.script.requests().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn oldest_finished_runs_are_evicted() {
        let mut config = AppConfig::default();
        config.sessions.retained_runs = 2;
        let h = harness_with(config, None);
        for id in ["a", "b", "c"] {
            let id = h.manager.submit(request(id)).unwrap();
            assert_eq!(h.manager.wait_for(&id).await, Some(RunState::Succeeded));
        }

        let kept: Vec<_> = h
            .manager
            .snapshot()
            .into_iter()
            .map(|r| r.run_id.to_string())
            .collect();
        assert_eq!(kept, vec!["b", "c"]);
        assert!(h.manager.state(&RunId::from_string("a")).is_none());

        // The store still remembers the evicted run, so a late timeout is ignored.
        h.manager.timeout(&RunId::from_string("a")).await.unwrap();
        assert_eq!(stored(&h.store, "a").await.unwrap().status, RunStatus::End);
    }

    #[tokio::test(start_paused = true)]
    async fn control_messages_drive_runs() {
        let h = harness(2, None);
        let broker = Arc::new(LocalBroker::default());
        let topics = TopicsConfig::default();
        tokio::spawn(Arc::clone(&h.manager).listen(broker.clone(), topics.clone()));
        tokio::time::sleep(Duration::from_millis(10)).await;

        let payload = serde_json::to_value(request("via-broker")).unwrap();
        broker.publish(&topics.run, payload).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let id = RunId::from_string("via-broker");
        assert_eq!(h.manager.wait_for(&id).await, Some(RunState::Succeeded));
        broker
            .publish(&topics.timeout, json!({"run_id": "elsewhere", "action": "timeout"}))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(
            stored(&h.store, "elsewhere").await.unwrap().status,
            RunStatus::Expired
        );
        h.manager.shutdown();
    }
}
