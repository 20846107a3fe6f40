//! Core validation interfaces.

use async_trait::async_trait;

use crate::domain::{Artifact, ExecutionResult};
use crate::error::Result;

/// Result of a validation operation
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationResult {
    /// Whether validation passed
    pub passed: bool,
    /// Human-readable summary of what was checked
    pub output: String,
    /// List of specific errors found
    pub errors: Vec<String>,
    /// Names of the validators that failed
    pub failed: Vec<String>,
}

impl ValidationResult {
    /// Create a passing result
    pub fn pass() -> Self {
        Self {
            passed: true,
            output: String::new(),
            errors: Vec::new(),
            failed: Vec::new(),
        }
    }

    /// Create a passing result with output
    pub fn pass_with_output(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            ..Self::pass()
        }
    }

    /// Create a failing result with a single error
    pub fn fail(error: impl Into<String>) -> Self {
        Self::fail_with_errors(vec![error.into()])
    }

    /// Create a failing result with multiple errors
    pub fn fail_with_errors(errors: Vec<String>) -> Self {
        Self {
            passed: false,
            output: errors.join("\n"),
            errors,
            failed: Vec::new(),
        }
    }

    /// Attribute a failure to the named validator, unless already attributed.
    pub fn named(mut self, validator: &str) -> Self {
        if !self.passed && self.failed.is_empty() {
            self.failed.push(validator.to_string());
        }
        self
    }

    /// Add an error to this result
    pub fn add_error(&mut self, error: impl Into<String>) {
        let error = error.into();
        if !self.output.is_empty() {
            self.output.push('\n');
        }
        self.output.push_str(&error);
        self.errors.push(error);
        self.passed = false;
    }

    /// Merge another result into this one
    pub fn merge(&mut self, other: ValidationResult) {
        if !other.passed {
            self.passed = false;
        }
        if !other.output.is_empty() {
            if !self.output.is_empty() {
                self.output.push('\n');
            }
            self.output.push_str(&other.output);
        }
        self.errors.extend(other.errors);
        self.failed.extend(other.failed);
    }

    /// Check if there are any errors
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Get the number of errors
    pub fn error_count(&self) -> usize {
        self.errors.len()
    }
}

impl Default for ValidationResult {
    fn default() -> Self {
        Self::pass()
    }
}

/// A domain-specific check on an executed artifact.
///
/// Validators run after the critic accepts; a failure turns the acceptance
/// into a revision with the validator's errors as the issues.
#[async_trait]
pub trait DomainValidator: Send + Sync {
    /// Short name used in feedback, e.g. `trusted_sources`
    fn name(&self) -> &str;

    async fn validate(&self, artifact: &Artifact, execution: &ExecutionResult) -> Result<ValidationResult>;
}
