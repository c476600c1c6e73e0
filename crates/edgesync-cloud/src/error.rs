use std::time::Duration;

use thiserror::Error;

/// Cloud sync failure taxonomy. Classification drives retry/backoff:
/// transient network trouble and 5xx back off and retry, auth failures
/// trigger a credential refresh instead, and other 4xx drop the payload.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("request timed out")]
    Timeout,
    #[error("network error: {0}")]
    Network(String),
    #[error("HTTP status {status}")]
    Http { status: u16 },
    #[error("authentication rejected (HTTP {status})")]
    Auth { status: u16 },
    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },
    #[error("MQTT publish failed: {0}")]
    Mqtt(String),
    #[error("storage failure: {0}")]
    Storage(String),
    #[error("failed to decode payload: {0}")]
    Decode(String),
    #[error("failed to apply target state: {0}")]
    Apply(String),
    #[error("cloud sync misconfigured: {0}")]
    NotConfigured(String),
}

impl SyncError {
    /// Map an HTTP status outside the success range to an error.
    pub fn from_status(status: u16, retry_after: Option<Duration>) -> SyncError {
        match status {
            401 | 403 => SyncError::Auth { status },
            429 => SyncError::RateLimited { retry_after },
            _ => SyncError::Http { status },
        }
    }

    /// Timeouts, connection trouble, 5xx, 408 and 429 are worth retrying;
    /// other 4xx are fatal for the payload that produced them.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Timeout | SyncError::Network(_) | SyncError::Mqtt(_) => true,
            SyncError::RateLimited { .. } => true,
            SyncError::Http { status } => *status >= 500 || *status == 408,
            SyncError::Auth { .. } => false,
            SyncError::Storage(_)
            | SyncError::Decode(_)
            | SyncError::Apply(_)
            | SyncError::NotConfigured(_) => false,
        }
    }

    /// Auth failures signal the caller to refresh credentials; they do not
    /// trip the circuit breaker on their own.
    pub fn is_auth(&self) -> bool {
        matches!(self, SyncError::Auth { .. })
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            SyncError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            SyncError::Timeout
        } else {
            SyncError::Network(error.to_string())
        }
    }
}
