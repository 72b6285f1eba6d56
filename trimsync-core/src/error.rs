//! Error types for the trimsync engine.

use thiserror::Error;

/// Errors that can occur during sync, webhook processing, or export.
///
/// The taxonomy drives failure handling: `Auth` degrades the configuration
/// and pauses sync until re-auth, `RateLimit` and `Network` are retried with
/// backoff, `Validation` skips the single offending item.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Provider credentials rejected: {0}")]
    Auth(String),

    #[error("Provider rate limit hit (retry after {retry_after:?}s)")]
    RateLimit { retry_after: Option<u64> },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Invalid event data: {0}")]
    Validation(String),

    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Not found on provider: {0}")]
    NotFound(String),

    #[error("Configuration not found: {0}")]
    ConfigNotFound(uuid::Uuid),

    #[error("Export not found or expired: {0}")]
    ExportNotFound(String),

    #[error("Sync cycle timed out after {0}s")]
    Timeout(u64),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SyncError {
    /// Classify an HTTP status from a provider API into an engine error.
    ///
    /// `retry_after` carries the provider-supplied `Retry-After` seconds
    /// when present on a 429.
    pub fn from_status(status: u16, retry_after: Option<u64>, body: &str) -> Self {
        match status {
            401 | 403 => SyncError::Auth(format!("provider returned {status}: {body}")),
            404 | 410 => SyncError::NotFound(format!("provider returned {status}: {body}")),
            429 => SyncError::RateLimit { retry_after },
            500..=599 => SyncError::Network(format!("provider returned {status}: {body}")),
            _ => SyncError::Provider(format!("provider returned {status}: {body}")),
        }
    }

    /// Whether a retry within the same cycle could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::RateLimit { .. } | SyncError::Network(_))
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        SyncError::Network(err.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Serialization(err.to_string())
    }
}

/// Result type alias for engine operations.
pub type EngineResult<T> = Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_status_for_retry_policy() {
        assert!(matches!(
            SyncError::from_status(401, None, ""),
            SyncError::Auth(_)
        ));
        assert!(matches!(
            SyncError::from_status(429, Some(30), ""),
            SyncError::RateLimit {
                retry_after: Some(30)
            }
        ));
        assert!(matches!(
            SyncError::from_status(503, None, ""),
            SyncError::Network(_)
        ));
        assert!(matches!(
            SyncError::from_status(400, None, "bad request"),
            SyncError::Provider(_)
        ));
    }

    #[test]
    fn retryable_errors() {
        assert!(SyncError::Network("reset".into()).is_retryable());
        assert!(SyncError::RateLimit { retry_after: None }.is_retryable());
        assert!(!SyncError::Auth("expired".into()).is_retryable());
        assert!(!SyncError::Validation("no title".into()).is_retryable());
    }
}
