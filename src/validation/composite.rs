//! Chains multiple validators together.

use std::sync::Arc;

use async_trait::async_trait;

use crate::domain::{Artifact, ExecutionResult};
use crate::error::Result;
use crate::validation::traits::{DomainValidator, ValidationResult};

/// A composite validator that chains multiple validators together.
/// All validators must pass for the overall validation to pass.
pub struct CompositeValidator {
    /// The validators to run in sequence
    validators: Vec<Arc<dyn DomainValidator>>,
    name: String,
}

impl CompositeValidator {
    /// Create a new empty composite validator
    pub fn new() -> Self {
        Self::with_name("validators")
    }

    pub fn with_name(name: impl Into<String>) -> Self {
        Self {
            validators: Vec::new(),
            name: name.into(),
        }
    }

    /// Add a validator to the chain (builder pattern)
    pub fn with_validator(mut self, validator: impl DomainValidator + 'static) -> Self {
        self.validators.push(Arc::new(validator));
        self
    }

    /// Add a shared validator to the chain
    pub fn push(&mut self, validator: Arc<dyn DomainValidator>) {
        self.validators.push(validator);
    }

    /// Get the number of validators in the chain
    pub fn len(&self) -> usize {
        self.validators.len()
    }

    /// Check if the composite has no validators
    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }

    /// Names of all validators in the chain
    pub fn validator_names(&self) -> Vec<&str> {
        self.validators.iter().map(|v| v.name()).collect()
    }
}

impl Default for CompositeValidator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DomainValidator for CompositeValidator {
    fn name(&self) -> &str {
        &self.name
    }

    async fn validate(&self, artifact: &Artifact, execution: &ExecutionResult) -> Result<ValidationResult> {
        let mut combined = ValidationResult::pass();

        for validator in &self.validators {
            let result = validator.validate(artifact, execution).await?;
            tracing::debug!(validator = validator.name(), passed = result.passed, "Validator finished");
            combined.merge(result.named(validator.name()));
        }

        Ok(combined)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ArtifactKind, ExecutionStatus, Producer};

    struct MockValidator {
        should_pass: bool,
        error_msg: String,
        name: String,
    }

    impl MockValidator {
        fn passing(name: &str) -> Self {
            Self {
                should_pass: true,
                error_msg: String::new(),
                name: name.to_string(),
            }
        }

        fn failing(name: &str, error: &str) -> Self {
            Self {
                should_pass: false,
                error_msg: error.to_string(),
                name: name.to_string(),
            }
        }
    }

    #[async_trait]
    impl DomainValidator for MockValidator {
        fn name(&self) -> &str {
            &self.name
        }

        async fn validate(&self, _artifact: &Artifact, _execution: &ExecutionResult) -> Result<ValidationResult> {
            if self.should_pass {
                Ok(ValidationResult::pass_with_output(format!("{} passed", self.name)))
            } else {
                Ok(ValidationResult::fail(&self.error_msg))
            }
        }
    }

    fn fixture() -> (Artifact, ExecutionResult) {
        let artifact = Artifact::new("s-v1", ArtifactKind::Text, "report", 1, Producer::Generator);
        let execution = ExecutionResult::failed("s-v1", ExecutionStatus::Success, "", 0);
        (artifact, execution)
    }

    #[test]
    fn test_composite_new() {
        let composite = CompositeValidator::new();
        assert!(composite.is_empty());
        assert_eq!(composite.name(), "validators");
    }

    #[test]
    fn test_composite_names() {
        let composite = CompositeValidator::with_name("research")
            .with_validator(MockValidator::passing("status"))
            .with_validator(MockValidator::passing("trusted_sources"));

        assert_eq!(composite.len(), 2);
        assert_eq!(composite.name(), "research");
        assert_eq!(composite.validator_names(), vec!["status", "trusted_sources"]);
    }

    #[tokio::test]
    async fn test_composite_all_pass() {
        let composite = CompositeValidator::new()
            .with_validator(MockValidator::passing("v1"))
            .with_validator(MockValidator::passing("v2"));

        let (artifact, execution) = fixture();
        let result = composite.validate(&artifact, &execution).await.unwrap();

        assert!(result.passed);
        assert!(result.output.contains("v1 passed"));
        assert!(result.output.contains("v2 passed"));
        assert!(result.failed.is_empty());
    }

    #[tokio::test]
    async fn test_composite_one_fails() {
        let composite = CompositeValidator::new()
            .with_validator(MockValidator::passing("v1"))
            .with_validator(MockValidator::failing("v2", "validation error"))
            .with_validator(MockValidator::passing("v3"));

        let (artifact, execution) = fixture();
        let result = composite.validate(&artifact, &execution).await.unwrap();

        assert!(!result.passed);
        assert_eq!(result.errors, vec!["validation error"]);
        assert_eq!(result.failed, vec!["v2"]);
    }

    #[tokio::test]
    async fn test_composite_empty_passes() {
        let (artifact, execution) = fixture();
        let result = CompositeValidator::new().validate(&artifact, &execution).await.unwrap();
        assert!(result.passed);
    }
}
