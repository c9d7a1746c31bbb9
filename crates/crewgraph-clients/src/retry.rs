use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crewgraph_core::config::RetryConfig;
use crewgraph_core::error::{CrewGraphError, Result};

/// Whether a failed call may be repeated.
///
/// Connection failures never reached the service and are always retried.
/// Timeouts, 429 and 5xx answers are retried only for idempotent calls.
pub fn is_retryable(e: &CrewGraphError, idempotent: bool) -> bool {
    match e {
        CrewGraphError::RemoteService(msg) => {
            msg.contains("connection")
                || (idempotent
                    && (msg.contains("HTTP 429")
                        || msg.contains("HTTP 500")
                        || msg.contains("HTTP 502")
                        || msg.contains("HTTP 503")
                        || msg.contains("HTTP 504")
                        || msg.contains("timeout")))
        }
        _ => false,
    }
}

/// Exponential backoff for `attempt`, capped and jittered by 0.8x to 1.2x.
pub fn calculate_backoff(attempt: u32, config: &RetryConfig) -> Duration {
    let ms = config
        .initial_backoff_ms
        .saturating_mul(2u64.saturating_pow(attempt))
        .min(config.max_backoff_ms);
    // Jitter: 0.8x to 1.2x
    let jitter = 0.8 + rand::random::<f64>() * 0.4;
    Duration::from_millis((ms as f64 * jitter) as u64)
}

/// Run `call` until it succeeds, fails with a non-retryable error, or
/// `max_retries` extra attempts are used up.
pub async fn with_retry<T, F, Fut>(
    config: &RetryConfig,
    operation: &str,
    idempotent: bool,
    mut call: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_retries = config.max_retries;
    let mut attempt = 0;
    loop {
        match call().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < max_retries && is_retryable(&e, idempotent) => {
                let backoff = calculate_backoff(attempt, config);
                warn!(
                    operation,
                    attempt = attempt + 1,
                    max_retries,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %e,
                    "Retrying remote call"
                );
                tokio::time::sleep(backoff).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Map a transport error to a `RemoteService` error the retry policy understands.
pub(crate) fn transport_error(service: &str, e: reqwest::Error) -> CrewGraphError {
    if e.is_connect() {
        CrewGraphError::RemoteService(format!("{service}: connection failed: {e}"))
    } else if e.is_timeout() {
        CrewGraphError::RemoteService(format!("{service}: timeout: {e}"))
    } else {
        CrewGraphError::RemoteService(format!("{service}: {e}"))
    }
}

/// Turn a non-success response into an error carrying status and body.
pub(crate) async fn check_status(service: &str, response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(CrewGraphError::RemoteService(format!(
        "{service}: HTTP {}: {}",
        status.as_u16(),
        body
    )))
}
