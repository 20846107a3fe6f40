//! Error types for Reflector
//!
//! Centralized error handling using thiserror.

use thiserror::Error;

use crate::llm::LlmError;

/// All infrastructure errors that can occur in Reflector.
///
/// Failures of a generated artifact (runtime errors, timeouts, capability
/// violations) are not errors here: they are reported as an
/// `ExecutionResult` status and fed back to the critic.
#[derive(Debug, Error)]
pub enum ReflectorError {
    /// Store/persistence error
    #[error("Store error: {0}")]
    Store(String),

    /// SQLite error surfaced by the store
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Sandbox infrastructure failure (not an artifact failure)
    #[error("Sandbox error: {0}")]
    Sandbox(String),

    /// Invalid state transition or operation
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Configuration error
    #[error("Config error: {0}")]
    Config(String),

    /// LLM API error
    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ReflectorError {
    /// Map a poisoned lock into a store error.
    pub fn poisoned<T>(err: std::sync::PoisonError<T>) -> Self {
        ReflectorError::Store(format!("store lock poisoned: {}", err))
    }
}

/// Result type alias for Reflector operations
pub type Result<T> = std::result::Result<T, ReflectorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error() {
        let err = ReflectorError::Store("table locked".to_string());
        assert_eq!(err.to_string(), "Store error: table locked");
    }

    #[test]
    fn test_sandbox_error() {
        let err = ReflectorError::Sandbox("executor task panicked".to_string());
        assert_eq!(err.to_string(), "Sandbox error: executor task panicked");
    }

    #[test]
    fn test_invalid_state_error() {
        let err = ReflectorError::InvalidState("session already finished".to_string());
        assert_eq!(err.to_string(), "Invalid state: session already finished");
    }

    #[test]
    fn test_llm_error_conversion() {
        let err: ReflectorError = LlmError::InvalidResponse("empty body".to_string()).into();
        assert!(matches!(err, ReflectorError::Llm(_)));
        assert!(err.to_string().contains("empty body"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: ReflectorError = io_err.into();
        assert!(matches!(err, ReflectorError::Io(_)));
        assert!(err.to_string().contains("file not found"));
    }

    #[test]
    fn test_json_error_conversion() {
        let json_err = serde_json::from_str::<serde_json::Value>("invalid").unwrap_err();
        let err: ReflectorError = json_err.into();
        assert!(matches!(err, ReflectorError::Json(_)));
    }

    #[test]
    fn test_poisoned_lock_maps_to_store() {
        let lock = std::sync::Arc::new(std::sync::Mutex::new(0));
        let cloned = std::sync::Arc::clone(&lock);
        let _ = std::thread::spawn(move || {
            let _guard = cloned.lock().unwrap();
            panic!("poison");
        })
        .join();

        let err = lock.lock().map_err(ReflectorError::poisoned).unwrap_err();
        assert!(matches!(err, ReflectorError::Store(_)));
    }
}
