use std::collections::HashMap;
use std::time::Duration;

use futures::future::BoxFuture;
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crewgraph_core::config::{CodeAgentConfig, RetryConfig};
use crewgraph_core::error::{CrewGraphError, Result};
use crewgraph_core::traits::CodeAgentService;
use crewgraph_core::types::{
    AgentMessage, AgentPart, AgentPrompt, AgentSession, AgentSessionStatus,
};

use crate::retry::{check_status, transport_error, with_retry};

const SERVICE: &str = "code agent";

/// Slack on top of the caller's max wait, so the caller's own deadline fires first.
const PROMPT_TIMEOUT_GRACE: Duration = Duration::from_secs(30);

// ── Wire types ──────────────────────────────────────────────────

#[derive(Serialize)]
struct CreateSession<'a> {
    title: &'a str,
}

#[derive(Deserialize)]
struct WireSession {
    id: String,
    #[serde(default)]
    title: String,
}

#[derive(Default, Deserialize)]
struct WireTime {
    #[serde(default)]
    end: Option<i64>,
    #[serde(default)]
    completed: Option<i64>,
}

#[derive(Deserialize)]
struct WireInfo {
    id: String,
    role: String,
    #[serde(default)]
    time: WireTime,
    #[serde(default)]
    finish: Option<String>,
}

#[derive(Default, Deserialize)]
struct WireToolState {
    #[serde(default)]
    status: String,
    #[serde(default)]
    title: Option<String>,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
enum WirePart {
    Text {
        #[serde(default)]
        text: String,
        #[serde(default)]
        time: WireTime,
    },
    Reasoning {
        #[serde(default)]
        text: String,
        #[serde(default)]
        time: WireTime,
    },
    Tool {
        tool: String,
        #[serde(default)]
        state: WireToolState,
    },
    #[serde(other)]
    Other,
}

#[derive(Deserialize)]
struct WireMessage {
    info: WireInfo,
    #[serde(default)]
    parts: Vec<WirePart>,
}

#[derive(Deserialize)]
struct WireStatus {
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Serialize)]
struct PromptPart<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    text: &'a str,
}

#[derive(Serialize)]
struct ModelRef<'a> {
    #[serde(rename = "providerID", skip_serializing_if = "Option::is_none")]
    provider_id: Option<&'a str>,
    #[serde(rename = "modelID")]
    model_id: &'a str,
}

#[derive(Serialize)]
struct PromptBody<'a> {
    parts: Vec<PromptPart<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    agent: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<ModelRef<'a>>,
}

impl From<WirePart> for AgentPart {
    fn from(part: WirePart) -> Self {
        match part {
            WirePart::Text { text, time } => AgentPart::Text {
                text,
                finished: time.end.is_some(),
            },
            WirePart::Reasoning { text, time } => AgentPart::Reasoning {
                text,
                finished: time.end.is_some(),
            },
            WirePart::Tool { tool, state } => AgentPart::Tool {
                tool,
                status: state.status,
                title: state.title,
            },
            WirePart::Other => AgentPart::Other,
        }
    }
}

impl From<WireMessage> for AgentMessage {
    fn from(message: WireMessage) -> Self {
        AgentMessage {
            id: message.info.id,
            role: message.info.role,
            completed: message.info.time.completed.is_some(),
            finish: message.info.finish,
            parts: message.parts.into_iter().map(AgentPart::from).collect(),
        }
    }
}

fn session_status(wire: WireStatus) -> AgentSessionStatus {
    match wire.kind.as_str() {
        "busy" => AgentSessionStatus::Busy,
        "retry" => AgentSessionStatus::Retry,
        _ => AgentSessionStatus::Idle,
    }
}

/// `provider/model` selects a provider; a bare name is a model id.
fn model_ref(model: &str) -> ModelRef<'_> {
    match model.split_once('/') {
        Some((provider, id)) => ModelRef {
            provider_id: Some(provider),
            model_id: id,
        },
        None => ModelRef {
            provider_id: None,
            model_id: model,
        },
    }
}

// ── Client ──────────────────────────────────────────────────────

/// Client for the session-oriented remote coding-agent service.
pub struct HttpCodeAgentClient {
    http: Client,
    base_url: String,
    retry: RetryConfig,
    /// Posting a prompt may block until the agent finishes its turn.
    default_max_wait: Duration,
}

impl HttpCodeAgentClient {
    /// Build a client from the `[code_agent]` section.
    pub fn new(config: &CodeAgentConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| CrewGraphError::Config(format!("code agent client: {e}")))?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            retry: config.retry.clone(),
            default_max_wait: Duration::try_from_secs_f64(config.max_wait_s.max(1.0))
                .unwrap_or(Duration::from_secs(3600)),
        })
    }

    /// HTTP timeout for a prompt post: the prompt's own max wait when given,
    /// never less than the configured default.
    fn prompt_timeout(&self, prompt: &AgentPrompt) -> Duration {
        let wait = prompt
            .max_wait_s
            .and_then(|s| Duration::try_from_secs_f64(s.max(0.0)).ok())
            .map_or(self.default_max_wait, |d| d.max(self.default_max_wait));
        wait.saturating_add(PROMPT_TIMEOUT_GRACE)
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn fetch<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T> {
        let response = request.send().await.map_err(|e| transport_error(SERVICE, e))?;
        let response = check_status(SERVICE, response).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| CrewGraphError::RemoteService(format!("{SERVICE}: invalid response: {e}")))
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        with_retry(&self.retry, path, true, || self.fetch(self.http.get(self.url(path)))).await
    }

    async fn post_empty(&self, request: RequestBuilder) -> Result<()> {
        let response = request.send().await.map_err(|e| transport_error(SERVICE, e))?;
        check_status(SERVICE, response).await?;
        Ok(())
    }
}

impl CodeAgentService for HttpCodeAgentClient {
    fn create_session(&self, title: &str) -> BoxFuture<'_, Result<AgentSession>> {
        let title = title.to_string();
        Box::pin(async move {
            let wire: WireSession = with_retry(&self.retry, "create_session", false, || {
                self.fetch(
                    self.http
                        .post(self.url("/session"))
                        .json(&CreateSession { title: &title }),
                )
            })
            .await?;
            debug!(session_id = %wire.id, title = %wire.title, "Agent session created");
            Ok(AgentSession {
                id: wire.id,
                title: wire.title,
            })
        })
    }

    fn list_sessions(&self) -> BoxFuture<'_, Result<Vec<AgentSession>>> {
        Box::pin(async move {
            let wire: Vec<WireSession> = self.get("/session").await?;
            Ok(wire
                .into_iter()
                .map(|s| AgentSession {
                    id: s.id,
                    title: s.title,
                })
                .collect())
        })
    }

    fn messages(&self, session_id: &str) -> BoxFuture<'_, Result<Vec<AgentMessage>>> {
        let path = format!("/session/{session_id}/message");
        Box::pin(async move {
            let wire: Vec<WireMessage> = self.get(&path).await?;
            Ok(wire.into_iter().map(AgentMessage::from).collect())
        })
    }

    fn send_message(&self, session_id: &str, prompt: AgentPrompt) -> BoxFuture<'_, Result<()>> {
        let path = format!("/session/{session_id}/message");
        Box::pin(async move {
            let timeout = self.prompt_timeout(&prompt);
            let body = PromptBody {
                parts: vec![PromptPart {
                    kind: "text",
                    text: &prompt.text,
                }],
                agent: prompt.agent.as_deref(),
                model: prompt.model.as_deref().map(model_ref),
            };
            with_retry(&self.retry, "send_message", false, || {
                self.post_empty(
                    self.http
                        .post(self.url(&path))
                        .timeout(timeout)
                        .json(&body),
                )
            })
            .await
        })
    }

    fn session_status(&self) -> BoxFuture<'_, Result<HashMap<String, AgentSessionStatus>>> {
        Box::pin(async move {
            let wire: HashMap<String, WireStatus> = self.get("/session/status").await?;
            Ok(wire
                .into_iter()
                .map(|(id, status)| (id, session_status(status)))
                .collect())
        })
    }

    fn abort(&self, session_id: &str) -> BoxFuture<'_, Result<()>> {
        let path = format!("/session/{session_id}/abort");
        Box::pin(async move {
            with_retry(&self.retry, "abort", true, || {
                self.post_empty(self.http.post(self.url(&path)))
            })
            .await
        })
    }
}
