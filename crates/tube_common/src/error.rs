//! Error types for the tube player core.
//!
//! Every failure the core can surface maps onto one of the [`ErrorCategory`]
//! buckets; callers use the category to decide between retrying in the
//! background, repairing, or reporting.

use thiserror::Error;

/// Broad classification used to decide how a failure is handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Network trouble; retried through the background replay queue
    Transient,
    /// No identity could be established
    Identity,
    /// Damaged state data; repaired by normalization
    Structural,
    /// Content worker transport failure; caller falls back to direct fetch
    Worker,
    /// Local durable tier failure; logged and treated as best-effort
    Local,
    /// The caller asked for something invalid
    Caller,
}

#[derive(Error, Debug)]
pub enum TubeError {
    #[error("Invalid slot {slot}: expected 1..={max}")]
    InvalidSlot { slot: u8, max: u8 },

    #[error("Invalid completion event: {0}")]
    InvalidEvent(String),

    #[error("Stale completion event: {0}")]
    StaleEvent(String),

    #[error("Corrupt state: {0}")]
    Structural(String),

    #[error("No user identity available and anonymous creation is not permitted")]
    IdentityUnavailable,

    #[error("Network error: {0}")]
    Network(String),

    #[error("Remote store rejected the request: {0}")]
    RemoteRejected(String),

    #[error("Request timed out after {0} seconds")]
    Timeout(u64),

    #[error("Content worker error: {0}")]
    Worker(String),

    #[error("Content worker request {request_id} timed out after {secs} seconds")]
    WorkerTimeout { request_id: u64, secs: u64 },

    #[error("Content not found: {0}")]
    ContentNotFound(String),

    #[error("Local storage error: {0}")]
    LocalStorage(String),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl TubeError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            TubeError::Network(_) | TubeError::RemoteRejected(_) | TubeError::Timeout(_) => {
                ErrorCategory::Transient
            }
            TubeError::IdentityUnavailable => ErrorCategory::Identity,
            TubeError::Structural(_) => ErrorCategory::Structural,
            TubeError::Worker(_) | TubeError::WorkerTimeout { .. } => ErrorCategory::Worker,
            TubeError::LocalStorage(_)
            | TubeError::Sqlite(_)
            | TubeError::Io(_)
            | TubeError::Json(_) => ErrorCategory::Local,
            TubeError::InvalidSlot { .. }
            | TubeError::InvalidEvent(_)
            | TubeError::StaleEvent(_)
            | TubeError::ContentNotFound(_)
            | TubeError::Config(_) => ErrorCategory::Caller,
        }
    }

    /// True for failures that the background sync retries on its own
    pub fn is_transient(&self) -> bool {
        self.category() == ErrorCategory::Transient
    }

    /// Stable short code, used in logs and the CLI's JSON output
    pub fn code(&self) -> &'static str {
        match self {
            TubeError::InvalidSlot { .. } => "invalid_slot",
            TubeError::InvalidEvent(_) => "invalid_event",
            TubeError::StaleEvent(_) => "stale_event",
            TubeError::Structural(_) => "structural",
            TubeError::IdentityUnavailable => "identity_unavailable",
            TubeError::Network(_) => "network",
            TubeError::RemoteRejected(_) => "remote_rejected",
            TubeError::Timeout(_) => "timeout",
            TubeError::Worker(_) => "worker",
            TubeError::WorkerTimeout { .. } => "worker_timeout",
            TubeError::ContentNotFound(_) => "content_not_found",
            TubeError::LocalStorage(_) => "local_storage",
            TubeError::Sqlite(_) => "sqlite",
            TubeError::Io(_) => "io",
            TubeError::Json(_) => "json",
            TubeError::Config(_) => "config",
        }
    }
}

impl From<reqwest::Error> for TubeError {
    fn from(e: reqwest::Error) -> Self {
        TubeError::Network(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, TubeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_errors_are_transient() {
        assert!(TubeError::Network("connection refused".into()).is_transient());
        assert!(TubeError::Timeout(10).is_transient());
        assert!(!TubeError::IdentityUnavailable.is_transient());
    }

    #[test]
    fn test_categories() {
        assert_eq!(
            TubeError::InvalidSlot { slot: 4, max: 3 }.category(),
            ErrorCategory::Caller
        );
        assert_eq!(
            TubeError::WorkerTimeout { request_id: 1, secs: 30 }.category(),
            ErrorCategory::Worker
        );
        assert_eq!(
            TubeError::LocalStorage("disk full".into()).category(),
            ErrorCategory::Local
        );
    }

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(TubeError::IdentityUnavailable.code(), "identity_unavailable");
        assert_eq!(TubeError::StaleEvent("x".into()).code(), "stale_event");
    }
}
