//! Artifact-level failures raised while preparing or running an artifact.

use std::fmt;

use thiserror::Error;

use crate::domain::{ArtifactKind, ExecutionStatus};
use crate::error::ReflectorError;
use crate::store::is_interrupted;

/// Source that is not a structurally valid artifact of its declared kind.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("malformed {kind} artifact: {reason}")]
pub struct MalformedArtifact {
    pub kind: ArtifactKind,
    pub reason: String,
}

impl MalformedArtifact {
    pub fn new(kind: ArtifactKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
        }
    }
}

/// Why an execution stopped short of success.
///
/// Faults are reported through `ExecutionResult`, never returned to the caller
/// as errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fault {
    pub status: ExecutionStatus,
    pub message: String,
    /// Path of the operation that failed, e.g. `ops[2].then[0]`
    pub location: Option<String>,
}

impl Fault {
    fn new(status: ExecutionStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            location: None,
        }
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::new(ExecutionStatus::RuntimeError, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ExecutionStatus::Timeout, message)
    }

    pub fn capability(message: impl Into<String>) -> Self {
        Self::new(ExecutionStatus::CapabilityViolation, message)
    }

    /// Map a store error raised mid-execution. An interrupted statement means
    /// the wall-clock budget ran out.
    pub fn from_store(err: ReflectorError) -> Self {
        if is_interrupted(&err) {
            Self::timeout("execution interrupted: wall-clock budget exhausted")
        } else {
            Self::runtime(err.to_string())
        }
    }

    /// Record where the fault happened, unless an inner operation already did.
    pub fn at(mut self, location: impl FnOnce() -> String) -> Self {
        if self.location.is_none() {
            self.location = Some(location());
        }
        self
    }

    /// Text stored in `ExecutionResult::trace`.
    pub fn trace(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.location {
            Some(location) => write!(f, "{} at {}: {}", self.status, location, self.message),
            None => write!(f, "{}: {}", self.status, self.message),
        }
    }
}

impl std::error::Error for Fault {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fault_location_is_innermost() {
        let fault = Fault::runtime("division by zero")
            .at(|| "ops[1].body[0]".to_string())
            .at(|| "ops[1]".to_string());
        assert_eq!(fault.location.as_deref(), Some("ops[1].body[0]"));
        assert_eq!(fault.trace(), "runtime_error at ops[1].body[0]: division by zero");
    }

    #[test]
    fn test_fault_statuses() {
        assert_eq!(Fault::timeout("x").status, ExecutionStatus::Timeout);
        assert_eq!(Fault::capability("x").status, ExecutionStatus::CapabilityViolation);
        assert_eq!(Fault::capability("fs.write").to_string(), "capability_violation: fs.write");
    }

    #[test]
    fn test_store_error_maps_to_runtime() {
        let fault = Fault::from_store(ReflectorError::Store("no such column: items.color".to_string()));
        assert_eq!(fault.status, ExecutionStatus::RuntimeError);
        assert!(fault.message.contains("items.color"));
    }

    #[test]
    fn test_malformed_display() {
        let err = MalformedArtifact::new(ArtifactKind::Query, "empty statement");
        assert_eq!(err.to_string(), "malformed query artifact: empty statement");
    }
}
