//! Execution results produced by the sandboxed executor.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::store::{Mutation, QueryRows};

/// Terminal status of one execution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Ran to completion; mutations committed (or staged)
    Success,
    /// The artifact raised during execution; store untouched
    RuntimeError,
    /// Wall-clock or step budget exceeded; store untouched
    Timeout,
    /// Attempted access outside the granted capability set; store untouched
    CapabilityViolation,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Success => "success",
            ExecutionStatus::RuntimeError => "runtime_error",
            ExecutionStatus::Timeout => "timeout",
            ExecutionStatus::CapabilityViolation => "capability_violation",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ExecutionStatus::Success)
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured output of an execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ExecutionOutput {
    /// Nothing was produced (failed executions)
    None,
    /// A structured value (policy programs, text reports)
    Value(Value),
    /// Tabular rows (queries)
    Table(QueryRows),
}

impl ExecutionOutput {
    pub fn is_none(&self) -> bool {
        matches!(self, ExecutionOutput::None)
    }

    /// Borrow the table if this output is tabular.
    pub fn as_table(&self) -> Option<&QueryRows> {
        match self {
            ExecutionOutput::Table(rows) => Some(rows),
            _ => None,
        }
    }

    /// Borrow the value if this output is structured.
    pub fn as_value(&self) -> Option<&Value> {
        match self {
            ExecutionOutput::Value(v) => Some(v),
            _ => None,
        }
    }
}

/// The captured outcome of executing one artifact. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub artifact_id: String,
    pub status: ExecutionStatus,
    pub output: ExecutionOutput,

    /// Row-level store mutations in order (empty unless the run succeeded)
    pub side_effects: Vec<Mutation>,

    /// Error trace, capability diagnostics, or progress log
    pub trace: String,

    pub duration_ms: u64,

    /// Store version the execution observed
    pub base_version: u64,

    /// Whether `side_effects` reached the store
    pub committed: bool,

    /// Interpreter steps consumed
    pub steps: u64,
}

impl ExecutionResult {
    /// A failed execution. Nothing was applied to the store.
    pub fn failed(
        artifact_id: impl Into<String>,
        status: ExecutionStatus,
        trace: impl Into<String>,
        base_version: u64,
    ) -> Self {
        Self {
            artifact_id: artifact_id.into(),
            status,
            output: ExecutionOutput::None,
            side_effects: Vec::new(),
            trace: trace.into(),
            duration_ms: 0,
            base_version,
            committed: false,
            steps: 0,
        }
    }

    /// Set the duration (builder style).
    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }

    /// Set the step count (builder style).
    pub fn with_steps(mut self, steps: u64) -> Self {
        self.steps = steps;
        self
    }

    pub fn succeeded(&self) -> bool {
        self.status.is_success()
    }

    /// Number of row mutations this execution produced.
    pub fn mutation_count(&self) -> usize {
        self.side_effects.len()
    }
}
