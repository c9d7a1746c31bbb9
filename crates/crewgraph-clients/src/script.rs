use std::time::Duration;

use futures::future::BoxFuture;
use reqwest::Client;
use tracing::debug;

use crewgraph_core::config::{RetryConfig, ScriptServiceConfig};
use crewgraph_core::error::{CrewGraphError, Result};
use crewgraph_core::traits::ScriptExecutor;
use crewgraph_core::types::{ScriptRequest, ScriptResponse};

use crate::retry::{check_status, transport_error, with_retry};

const SERVICE: &str = "script service";

/// Client for the sandboxed script execution service (`POST /execute`).
pub struct HttpScriptExecutor {
    http: Client,
    endpoint: String,
    retry: RetryConfig,
}

impl HttpScriptExecutor {
    /// Build a client from the `[script_service]` section.
    pub fn new(config: &ScriptServiceConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| CrewGraphError::Config(format!("script service client: {e}")))?;
        Ok(Self {
            http,
            endpoint: format!("{}/execute", config.base_url.trim_end_matches('/')),
            retry: config.retry.clone(),
        })
    }

    /// Full URL of the execute endpoint.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn post(&self, request: &ScriptRequest) -> Result<ScriptResponse> {
        let response = self
            .http
            .post(&self.endpoint)
            .json(request)
            .send()
            .await
            .map_err(|e| transport_error(SERVICE, e))?;
        let response = check_status(SERVICE, response).await?;
        response
            .json::<ScriptResponse>()
            .await
            .map_err(|e| CrewGraphError::RemoteService(format!("{SERVICE}: invalid response: {e}")))
    }
}

impl ScriptExecutor for HttpScriptExecutor {
    fn execute(&self, request: ScriptRequest) -> BoxFuture<'_, Result<ScriptResponse>> {
        Box::pin(async move {
            debug!(
                entrypoint = %request.entrypoint,
                libraries = request.libraries.len(),
                "Dispatching script"
            );
            // Scripts may have side effects: only undelivered requests are retried.
            let response = with_retry(&self.retry, "execute", false, || self.post(&request)).await?;
            debug!(return_code = response.return_code, "Script finished");
            Ok(response)
        })
    }
}
