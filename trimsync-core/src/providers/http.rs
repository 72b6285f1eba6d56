//! Shared HTTP plumbing for provider adapters: retry with backoff on
//! transient failures and uniform status classification.

use reqwest::{RequestBuilder, Response};

use crate::backoff;
use crate::error::{EngineResult, SyncError};

/// Attempts per request before the error surfaces to the cycle.
const MAX_ATTEMPTS: u32 = 3;

/// Send a request, retrying transient failures (429, 5xx, transport errors)
/// with jittered exponential backoff. A provider-supplied `Retry-After` is
/// honored when present. Non-retryable statuses are classified through
/// [`SyncError::from_status`] and returned immediately.
pub(crate) async fn send_with_retry(request: RequestBuilder) -> EngineResult<Response> {
    let mut attempt = 0;
    loop {
        let cloned = request
            .try_clone()
            .ok_or_else(|| SyncError::Network("request body is not replayable".into()))?;

        let error = match cloned.send().await {
            Ok(response) if response.status().is_success() => return Ok(response),
            Ok(response) => {
                let status = response.status().as_u16();
                let retry_after = response
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<u64>().ok());
                let body = response.text().await.unwrap_or_default();
                SyncError::from_status(status, retry_after, &body)
            }
            Err(err) => SyncError::Network(err.to_string()),
        };

        attempt += 1;
        if !error.is_retryable() || attempt >= MAX_ATTEMPTS {
            return Err(error);
        }

        let delay = match &error {
            SyncError::RateLimit {
                retry_after: Some(secs),
            } => *secs,
            _ => backoff::backoff_seconds(1, attempt - 1, 30),
        };
        tracing::debug!(attempt, delay_secs = delay, error = %error, "retrying provider request");
        tokio::time::sleep(backoff::with_jitter(delay)).await;
    }
}

/// Parse an RFC 3339 timestamp from a provider payload.
pub(crate) fn parse_rfc3339(value: &str) -> EngineResult<chrono::DateTime<chrono::Utc>> {
    chrono::DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&chrono::Utc))
        .map_err(|e| SyncError::Validation(format!("invalid timestamp '{value}': {e}")))
}
