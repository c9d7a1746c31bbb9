//! End-to-end: control messages in, status and telemetry out, all through the
//! in-process broker.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::BoxStream;
use futures::StreamExt;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crewgraph_core::config::AppConfig;
use crewgraph_core::traits::{MessageBroker, StatusStore};
use crewgraph_core::types::{BrokerMessage, RunId};
use crewgraph_core::{EventBus, RunRequest};
use crewgraph_engine::GraphServices;
use crewgraph_session::{BrokerStatusStore, LocalBroker, SessionManager, TelemetryBridge};
use crewgraph_test_utils::{linear_schema, MockScriptExecutor};

struct Stack {
    broker: Arc<dyn MessageBroker>,
    status: Arc<dyn StatusStore>,
    manager: Arc<SessionManager>,
    config: AppConfig,
    cancel: CancellationToken,
}

async fn stack(script: MockScriptExecutor) -> Stack {
    let config = AppConfig::default();
    let events = EventBus::new(256);
    let broker: Arc<dyn MessageBroker> = Arc::new(LocalBroker::default());
    let status: Arc<dyn StatusStore> = Arc::new(BrokerStatusStore::new(
        broker.clone(),
        config.topics.status.clone(),
    ));
    let services = GraphServices::new(Arc::new(script)).with_events(events.clone());
    let manager = SessionManager::new(Arc::new(services), status.clone(), &config);
    let cancel = manager.shutdown_token();

    manager.start();
    tokio::spawn(manager.clone().listen(broker.clone(), config.topics.clone()));
    let bridge = TelemetryBridge::new(broker.clone(), config.topics.telemetry.clone());
    tokio::spawn(bridge.run(events, cancel.clone()));
    tokio::time::sleep(Duration::from_millis(10)).await;

    Stack {
        broker,
        status,
        manager,
        config,
        cancel,
    }
}

async fn next_where(
    stream: &mut BoxStream<'static, BrokerMessage>,
    pred: impl Fn(&Value) -> bool,
) -> Value {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(60), stream.next())
            .await
            .expect("message before timeout")
            .expect("stream open");
        if pred(&message.payload) {
            return message.payload;
        }
    }
}

fn run_request(id: &str) -> Value {
    let mut request = RunRequest::new(linear_schema());
    request.run_id = RunId::from_string(id);
    serde_json::to_value(request).unwrap()
}

#[tokio::test(start_paused = true)]
async fn run_message_produces_status_and_graph_end() {
    let s = stack(MockScriptExecutor::returning(json!(7))).await;
    let mut statuses = s.broker.subscribe(&s.config.topics.status).await.unwrap();
    let mut telemetry = s.broker.subscribe(&s.config.topics.telemetry).await.unwrap();

    s.broker
        .publish(&s.config.topics.run, run_request("e2e-1"))
        .await
        .unwrap();

    let status = next_where(&mut statuses, |p| p["run_id"] == "e2e-1").await;
    assert_eq!(status["status"], "end");

    let end = next_where(&mut telemetry, |p| p["message_type"] == "graph_end").await;
    assert_eq!(end["run_id"], "e2e-1");
    assert_eq!(end["payload"]["output"], json!({"result": 7}));

    let stored = s
        .status
        .get_status(&RunId::from_string("e2e-1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.status.as_str(), "end");
    s.cancel.cancel();
}

#[tokio::test(start_paused = true)]
async fn stop_message_ends_run_with_stop_status() {
    let script = MockScriptExecutor::returning(json!(1)).with_delay(Duration::from_secs(10));
    let s = stack(script.clone()).await;
    let mut statuses = s.broker.subscribe(&s.config.topics.status).await.unwrap();

    s.broker
        .publish(&s.config.topics.run, run_request("e2e-2"))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    s.broker
        .publish(&s.config.topics.stop, json!({"run_id": "e2e-2"}))
        .await
        .unwrap();

    let status = next_where(&mut statuses, |p| p["run_id"] == "e2e-2").await;
    assert_eq!(status["status"], "stop");
    assert_eq!(script.requests().len(), 1);

    // A timeout after the stop changes nothing.
    s.broker
        .publish(&s.config.topics.timeout, json!({"run_id": "e2e-2"}))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    let stored = s
        .status
        .get_status(&RunId::from_string("e2e-2"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.status.as_str(), "stop");
    s.manager.shutdown();
}

#[tokio::test(start_paused = true)]
async fn malformed_control_messages_are_ignored() {
    let s = stack(MockScriptExecutor::new()).await;
    s.broker
        .publish(&s.config.topics.run, json!({"nonsense": true}))
        .await
        .unwrap();
    s.broker
        .publish(&s.config.topics.stop, json!("not an object"))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(s.manager.snapshot().is_empty());

    // The listener survives and still accepts valid runs.
    s.broker
        .publish(&s.config.topics.run, run_request("after-noise"))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    let state = s.manager.wait_for(&RunId::from_string("after-noise")).await;
    assert_eq!(state, Some(crewgraph_session::RunState::Succeeded));
    s.cancel.cancel();
}
