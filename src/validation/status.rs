//! Execution-status gate: an artifact that did not run cleanly is never
//! validated, whatever the critic thought of it.

use async_trait::async_trait;

use super::traits::{DomainValidator, ValidationResult};
use crate::domain::{Artifact, ExecutionResult};
use crate::error::Result;

#[derive(Debug, Default)]
pub struct ExecutionStatusValidator;

#[async_trait]
impl DomainValidator for ExecutionStatusValidator {
    fn name(&self) -> &str {
        "execution_status"
    }

    async fn validate(&self, artifact: &Artifact, execution: &ExecutionResult) -> Result<ValidationResult> {
        if execution.succeeded() {
            return Ok(ValidationResult::pass_with_output(format!("{} succeeded", artifact.id)));
        }

        let mut result = ValidationResult::fail(format!(
            "execution ended with {}; the artifact must run to completion",
            execution.status
        ));
        if let Some(first) = execution.trace.lines().find(|l| !l.trim().is_empty()) {
            result.add_error(first.trim().to_string());
        }
        Ok(result)
    }
}
