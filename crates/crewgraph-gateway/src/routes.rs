use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use crewgraph_core::schema::RunRequest;
use crewgraph_core::traits::{MessageBroker, StatusStore};
use crewgraph_core::types::{RunId, StopRequest, TimeoutRequest};
use crewgraph_engine::SessionGraphBuilder;

use crate::state::AppState;

pub type ApiError = (StatusCode, Json<Value>);
pub type ApiResult<T> = Result<T, ApiError>;

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (status, Json(json!({ "error": message.into() })))
}

async fn publish(state: &AppState, topic: &str, payload: impl Serialize) -> ApiResult<()> {
    let payload = serde_json::to_value(payload)
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    state.broker.publish(topic, payload).await.map_err(|e| {
        warn!(topic, error = %e, "Failed to publish control message");
        api_error(StatusCode::SERVICE_UNAVAILABLE, e.to_string())
    })
}

// GET /api/health
/// GET /api/health
pub async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

// POST /api/runs: compile-check the workflow, then publish it on the run topic
/// POST /api/runs
pub async fn submit_run(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RunRequest>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    if let Err(e) = SessionGraphBuilder::for_request(&request).compile(&request.schema) {
        return Err(api_error(StatusCode::BAD_REQUEST, e.to_string()));
    }
    let run_id = request.run_id.clone();
    publish(&state, &state.topics.run, &request).await?;
    info!(run_id = %run_id, "Run submitted over HTTP");
    Ok((StatusCode::ACCEPTED, Json(json!({ "run_id": run_id }))))
}

// POST /api/runs/{id}/stop
/// POST /api/runs/{id}/stop
pub async fn stop_run(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    let request = StopRequest {
        run_id: RunId::from_string(&id),
    };
    publish(&state, &state.topics.stop, &request).await?;
    Ok(StatusCode::ACCEPTED)
}

// POST /api/runs/{id}/timeout
/// POST /api/runs/{id}/timeout
pub async fn timeout_run(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    let request = TimeoutRequest {
        run_id: RunId::from_string(&id),
        action: "timeout".into(),
    };
    publish(&state, &state.topics.timeout, &request).await?;
    Ok(StatusCode::ACCEPTED)
}

// GET /api/runs/{id}
/// GET /api/runs/{id}
pub async fn run_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let run_id = RunId::from_string(&id);
    let stored = state
        .status
        .get_status(&run_id)
        .await
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    let local = state.sessions.state(&run_id);
    match (stored, local) {
        (None, None) => Err(api_error(StatusCode::NOT_FOUND, format!("unknown run {id}"))),
        (stored, local) => Ok(Json(json!({
            "run_id": run_id,
            "status": stored.as_ref().map(|s| s.status),
            "error": stored.and_then(|s| s.error),
            "state": local,
        }))),
    }
}

// GET /api/runs
/// GET /api/runs
pub async fn list_runs(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({ "runs": state.sessions.snapshot() }))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crewgraph_core::config::{AppConfig, GatewayConfig, TopicsConfig};
    use crewgraph_core::types::{BrokerMessage, RunStatus, StatusUpdate};
    use crewgraph_engine::GraphServices;
    use crewgraph_session::{InMemoryStatusStore, LocalBroker, SessionManager};
    use crewgraph_test_utils::{linear_schema, schema, MockScriptExecutor};
    use futures::StreamExt;
    use tokio::sync::mpsc;

    use super::*;

    struct Fixture {
        state: Arc<AppState>,
        store: Arc<InMemoryStatusStore>,
        messages: mpsc::UnboundedReceiver<BrokerMessage>,
    }

    /// Gateway state over a local broker, with every control topic drained
    /// into one channel.
    async fn fixture() -> Fixture {
        let broker = Arc::new(LocalBroker::default());
        let topics = TopicsConfig::default();
        let (tx, messages) = mpsc::unbounded_channel();
        for topic in [&topics.run, &topics.stop, &topics.timeout] {
            let mut stream = broker.subscribe(topic).await.unwrap();
            let tx = tx.clone();
            tokio::spawn(async move {
                while let Some(message) = stream.next().await {
                    let _ = tx.send(message);
                }
            });
        }
        let store = Arc::new(InMemoryStatusStore::new());
        let services = GraphServices::new(Arc::new(MockScriptExecutor::new()));
        let sessions =
            SessionManager::new(Arc::new(services), store.clone(), &AppConfig::default());
        let state = Arc::new(AppState {
            config: GatewayConfig::default(),
            topics,
            broker,
            status: store.clone(),
            sessions,
        });
        Fixture {
            state,
            store,
            messages,
        }
    }

    async fn next_message(rx: &mut mpsc::UnboundedReceiver<BrokerMessage>) -> BrokerMessage {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let Json(body) = health().await;
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn submit_publishes_valid_run() {
        let mut f = fixture().await;
        let mut request = RunRequest::new(linear_schema());
        request.run_id = RunId::from_string("r1");

        let (status, Json(body)) = submit_run(State(f.state.clone()), Json(request))
            .await
            .unwrap();
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["run_id"], "r1");

        let message = next_message(&mut f.messages).await;
        assert_eq!(message.topic, "run");
        assert_eq!(message.payload["run_id"], "r1");
        assert_eq!(message.payload["schema"]["entry_point"], "first");
    }

    #[tokio::test]
    async fn submit_rejects_invalid_workflow() {
        let f = fixture().await;
        let request = RunRequest::new(schema(json!({
            "script_nodes": [{"name": "a", "code": "x"}],
            "edges": [{"start_key": "a", "end_key": "nowhere"}],
            "entry_point": "a"
        })));
        let (status, Json(body)) = submit_run(State(f.state.clone()), Json(request))
            .await
            .unwrap_err();
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("nowhere"));
    }

    #[tokio::test]
    async fn stop_and_timeout_publish_control_messages() {
        let mut f = fixture().await;
        let status = stop_run(State(f.state.clone()), Path("r9".into()))
            .await
            .unwrap();
        assert_eq!(status, StatusCode::ACCEPTED);
        let message = next_message(&mut f.messages).await;
        assert_eq!(message.topic, "stop");
        assert_eq!(message.payload, json!({"run_id": "r9"}));

        timeout_run(State(f.state.clone()), Path("r9".into()))
            .await
            .unwrap();
        let message = next_message(&mut f.messages).await;
        assert_eq!(message.topic, "timeout");
        assert_eq!(message.payload, json!({"run_id": "r9", "action": "timeout"}));
    }

    #[tokio::test]
    async fn status_comes_from_the_store() {
        let f = fixture().await;
        let missing = run_status(State(f.state.clone()), Path("nope".into())).await;
        assert_eq!(missing.unwrap_err().0, StatusCode::NOT_FOUND);

        f.store
            .set_status(StatusUpdate {
                run_id: RunId::from_string("done"),
                status: RunStatus::Error,
                error: Some("boom".into()),
            })
            .await
            .unwrap();
        let Json(body) = run_status(State(f.state.clone()), Path("done".into()))
            .await
            .unwrap();
        assert_eq!(body["status"], "error");
        assert_eq!(body["error"], "boom");
        assert!(body["state"].is_null());
    }

    #[tokio::test(start_paused = true)]
    async fn list_shows_session_snapshot() {
        let f = fixture().await;
        f.state.sessions.start();
        let mut request = RunRequest::new(linear_schema());
        request.run_id = RunId::from_string("listed");
        f.state.sessions.submit(request).unwrap();
        f.state
            .sessions
            .wait_for(&RunId::from_string("listed"))
            .await;
        tokio::time::sleep(Duration::from_millis(1)).await;

        let Json(body) = list_runs(State(f.state.clone())).await;
        assert_eq!(body["runs"][0]["run_id"], "listed");
        assert_eq!(body["runs"][0]["state"], "succeeded");
    }
}
