//! Error types for the askdb domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error enum.

use thiserror::Error;

/// The top-level error type for all askdb operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Reasoning engine errors ---
    #[error("Reasoner error: {0}")]
    Reasoner(#[from] ReasonerError),

    // --- Domain store errors ---
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    // --- External context errors ---
    #[error("Fragment error: {0}")]
    Fragment(#[from] FragmentError),

    // --- Caller errors ---
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    // --- Configuration errors ---
    #[error("Configuration error: {message}")]
    Config { message: String },

    // --- Serialization ---
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // --- Generic ---
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

// --- Bounded context errors ---

#[derive(Debug, Clone, Error)]
pub enum ReasonerError {
    #[error("API request failed: {message} (status: {status_code})")]
    ApiError { status_code: u16, message: String },

    #[error("Rate limited by reasoning engine, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Session run ended with status '{status}'")]
    RunFailed { status: String },

    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    #[error("Reasoner not configured: {0}")]
    NotConfigured(String),

    #[error("Gave up after {attempts} attempts: {last}")]
    Exhausted {
        attempts: u32,
        last: Box<ReasonerError>,
    },
}

impl ReasonerError {
    /// Whether a failed call may succeed when simply repeated.
    ///
    /// Only rate limiting, timeouts and connection failures qualify.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ReasonerError::RateLimited { .. }
                | ReasonerError::Timeout(_)
                | ReasonerError::Network(_)
        )
    }
}

#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Query failed: {0}")]
    QueryFailed(String),

    #[error("Schema introspection failed: {0}")]
    Schema(String),

    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),
}

#[derive(Debug, Clone, Error)]
pub enum FragmentError {
    #[error("Failed to upload fragment '{name}': {reason}")]
    Upload { name: String, reason: String },

    #[error("Failed to attach fragment {id}: {reason}")]
    Attach { id: String, reason: String },

    #[error("Failed to delete fragment {id}: {reason}")]
    Delete { id: String, reason: String },

    #[error("Registry sync failed: {0}")]
    Registry(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reasoner_error_displays_correctly() {
        let err = Error::Reasoner(ReasonerError::ApiError {
            status_code: 500,
            message: "upstream exploded".into(),
        });
        assert!(err.to_string().contains("500"));
        assert!(err.to_string().contains("upstream exploded"));
    }

    #[test]
    fn transient_classification() {
        assert!(ReasonerError::RateLimited { retry_after_secs: 1 }.is_transient());
        assert!(ReasonerError::Timeout("30s".into()).is_transient());
        assert!(ReasonerError::Network("reset".into()).is_transient());

        assert!(!ReasonerError::AuthenticationFailed("bad key".into()).is_transient());
        assert!(
            !ReasonerError::ApiError {
                status_code: 400,
                message: "bad request".into()
            }
            .is_transient()
        );
        assert!(!ReasonerError::RunFailed { status: "failed".into() }.is_transient());
    }

    #[test]
    fn exhausted_wraps_last_error() {
        let err = ReasonerError::Exhausted {
            attempts: 3,
            last: Box::new(ReasonerError::Network("connection refused".into())),
        };
        let text = err.to_string();
        assert!(text.contains("3 attempts"));
        assert!(text.contains("connection refused"));
        assert!(!err.is_transient());
    }

    #[test]
    fn fragment_error_converts_into_top_level() {
        let err: Error = FragmentError::Delete {
            id: "file-1".into(),
            reason: "404".into(),
        }
        .into();
        assert!(matches!(err, Error::Fragment(_)));
        assert!(err.to_string().contains("file-1"));
    }
}
