//! Structured feedback produced by reflecting on an execution.

use std::fmt;

use serde::{Deserialize, Serialize};

/// The critic's decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Accept,
    Revise,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Accept => f.write_str("accept"),
            Verdict::Revise => f.write_str("revise"),
        }
    }
}

/// Who produced a piece of feedback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FeedbackOrigin {
    /// The critic judged the execution against the task
    Critic,
    /// A domain validator rejected an execution the critic accepted
    Validator { name: String },
}

/// Feedback on one artifact, grounded in its execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Feedback {
    pub source_artifact_id: String,
    pub verdict: Verdict,
    pub rationale: String,
    /// Concrete, actionable issues (non-empty whenever the verdict is `Revise`)
    pub issues: Vec<String>,
    pub origin: FeedbackOrigin,
}

impl Feedback {
    /// Accepting feedback from the critic.
    pub fn accept(source_artifact_id: impl Into<String>, rationale: impl Into<String>) -> Self {
        Self {
            source_artifact_id: source_artifact_id.into(),
            verdict: Verdict::Accept,
            rationale: rationale.into(),
            issues: Vec::new(),
            origin: FeedbackOrigin::Critic,
        }
    }

    /// Revising feedback from the critic.
    pub fn revise(
        source_artifact_id: impl Into<String>,
        rationale: impl Into<String>,
        issues: Vec<String>,
    ) -> Self {
        Self {
            source_artifact_id: source_artifact_id.into(),
            verdict: Verdict::Revise,
            rationale: rationale.into(),
            issues,
            origin: FeedbackOrigin::Critic,
        }
    }

    /// Revising feedback raised by a domain validator.
    pub fn from_validator(
        source_artifact_id: impl Into<String>,
        validator: impl Into<String>,
        issues: Vec<String>,
    ) -> Self {
        let validator = validator.into();
        Self {
            source_artifact_id: source_artifact_id.into(),
            verdict: Verdict::Revise,
            rationale: format!("Domain validation '{}' failed", validator),
            issues,
            origin: FeedbackOrigin::Validator { name: validator },
        }
    }

    pub fn is_accept(&self) -> bool {
        self.verdict == Verdict::Accept
    }

    /// A `Revise` without a concrete issue breaks the critic contract.
    pub fn violates_contract(&self) -> bool {
        self.verdict == Verdict::Revise && self.issues.iter().all(|i| i.trim().is_empty())
    }
}
