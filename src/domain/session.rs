//! Sessions - the full ordered record of attempts for one task.
//!
//! A session moves through the loop states `Init → Generated → Executed →
//! Reflected → Refined → Executed → … → Done`, recording every artifact, its
//! execution and the feedback it received. The serialisable [`AuditTrail`] is
//! enough to reconstruct the before/after of every attempt without re-running
//! anything.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::artifact::{Artifact, ArtifactKind, Producer};
use super::execution::{ExecutionOutput, ExecutionResult, ExecutionStatus};
use super::feedback::{Feedback, FeedbackOrigin, Verdict};
use crate::llm::TokenUsage;
use crate::store::{CommitReceipt, Mutation};

/// A task handed to the loop controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    /// Natural-language description of what the artifact must do
    pub description: String,
    /// Kind of artifact to produce
    pub kind: ArtifactKind,
}

impl Task {
    pub fn new(description: impl Into<String>, kind: ArtifactKind) -> Self {
        Self {
            description: description.into(),
            kind,
        }
    }
}

/// One generate/refine → execute → reflect round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attempt {
    /// 1-based position in the session
    pub index: u32,
    pub artifact: Artifact,
    pub execution: ExecutionResult,
    /// Absent when the loop ended without reflecting on this attempt
    pub feedback: Option<Feedback>,
}

impl Attempt {
    pub fn new(index: u32, artifact: Artifact, execution: ExecutionResult) -> Self {
        Self {
            index,
            artifact,
            execution,
            feedback: None,
        }
    }

    pub fn with_feedback(mut self, feedback: Feedback) -> Self {
        self.feedback = Some(feedback);
        self
    }
}

/// States of the control loop, in the order they were entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "version", rename_all = "snake_case")]
pub enum LoopState {
    Init,
    Generated(u32),
    Executed(u32),
    Reflected(u32),
    Refined(u32),
    Done,
    DegradedFinal,
    GenerationFailed,
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoopState::Init => write!(f, "Init"),
            LoopState::Generated(v) => write!(f, "Generated(v{})", v),
            LoopState::Executed(v) => write!(f, "Executed(v{})", v),
            LoopState::Reflected(v) => write!(f, "Reflected(v{})", v),
            LoopState::Refined(v) => write!(f, "Refined(v{})", v),
            LoopState::Done => write!(f, "Done"),
            LoopState::DegradedFinal => write!(f, "DegradedFinal"),
            LoopState::GenerationFailed => write!(f, "GenerationFailed"),
        }
    }
}

/// How a session ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SessionOutcome {
    /// Still running
    Running,
    /// The final artifact was accepted by reflection
    Accepted,
    /// The single refinement pass finished; the refined artifact is final but was not re-judged
    Completed,
    /// The retry budget ran out; the last artifact is returned unvalidated
    DegradedFinal { reason: String },
    /// No usable artifact could be produced
    GenerationFailed { reason: String },
}

impl SessionOutcome {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SessionOutcome::Running)
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, SessionOutcome::GenerationFailed { .. })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionOutcome::Running => "running",
            SessionOutcome::Accepted => "accepted",
            SessionOutcome::Completed => "completed",
            SessionOutcome::DegradedFinal { .. } => "degraded_final",
            SessionOutcome::GenerationFailed { .. } => "generation_failed",
        }
    }
}

/// What happened to the final artifact's mutations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "commit", rename_all = "snake_case")]
pub enum CommitState {
    /// No commit was attempted
    Skipped { reason: String },
    /// The final execution made no mutations
    NothingToCommit,
    /// The final change set was applied
    Committed { receipt: CommitReceipt },
    /// Another writer committed first; the change set was rejected
    Conflict { expected_version: u64, actual_version: u64 },
}

/// The full record of one task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub task: Task,
    /// Schema or context block the generator saw
    pub context: String,
    pub attempts: Vec<Attempt>,
    pub max_attempts: u32,
    pub final_artifact_id: Option<String>,
    pub outcome: SessionOutcome,
    pub states: Vec<LoopState>,
    pub commit: CommitState,
    pub usage: TokenUsage,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Session {
    pub fn new(id: impl Into<String>, task: Task, context: impl Into<String>, max_attempts: u32) -> Self {
        Self {
            id: id.into(),
            task,
            context: context.into(),
            attempts: Vec::new(),
            max_attempts,
            final_artifact_id: None,
            outcome: SessionOutcome::Running,
            states: vec![LoopState::Init],
            commit: CommitState::Skipped {
                reason: "session still running".to_string(),
            },
            usage: TokenUsage::default(),
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Record entry into a new loop state.
    pub fn enter(&mut self, state: LoopState) {
        self.states.push(state);
    }

    /// Current loop state.
    pub fn state(&self) -> LoopState {
        self.states.last().copied().unwrap_or(LoopState::Init)
    }

    /// Append a completed attempt.
    pub fn record(&mut self, attempt: Attempt) {
        self.attempts.push(attempt);
    }

    /// Finish with a final artifact (the last attempt's).
    pub fn finish(&mut self, outcome: SessionOutcome) {
        self.final_artifact_id = self.attempts.last().map(|a| a.artifact.id.clone());
        self.enter(match outcome {
            SessionOutcome::DegradedFinal { .. } => LoopState::DegradedFinal,
            SessionOutcome::GenerationFailed { .. } => LoopState::GenerationFailed,
            _ => LoopState::Done,
        });
        if matches!(outcome, SessionOutcome::GenerationFailed { .. }) {
            self.final_artifact_id = None;
        }
        self.outcome = outcome;
        self.finished_at = Some(Utc::now());
    }

    pub fn final_attempt(&self) -> Option<&Attempt> {
        match &self.final_artifact_id {
            Some(id) => self.attempts.iter().rev().find(|a| &a.artifact.id == id),
            None => None,
        }
    }

    pub fn final_artifact(&self) -> Option<&Artifact> {
        self.final_attempt().map(|a| &a.artifact)
    }

    pub fn final_result(&self) -> Option<&ExecutionResult> {
        self.final_attempt().map(|a| &a.execution)
    }

    /// Only an accepted session may be presented as validated.
    pub fn is_validated(&self) -> bool {
        self.outcome == SessionOutcome::Accepted
    }

    pub fn attempt_count(&self) -> usize {
        self.attempts.len()
    }

    /// Build the serialisable audit trail.
    pub fn audit_trail(&self) -> AuditTrail {
        AuditTrail {
            session_id: self.id.clone(),
            task: self.task.description.clone(),
            kind: self.task.kind,
            outcome: self.outcome.clone(),
            validated: self.is_validated(),
            final_artifact_id: self.final_artifact_id.clone(),
            states: self.states.clone(),
            commit: self.commit.clone(),
            attempts: self.attempts.iter().map(AuditEntry::from_attempt).collect(),
            input_tokens: self.usage.input_tokens,
            output_tokens: self.usage.output_tokens,
            started_at: self.started_at,
            finished_at: self.finished_at,
        }
    }
}

/// One attempt as it appears in the audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub index: u32,
    pub artifact_id: String,
    pub version: u32,
    pub produced_by: Producer,
    pub source: String,
    pub digest: String,
    pub status: ExecutionStatus,
    pub output: ExecutionOutput,
    pub side_effects: Vec<Mutation>,
    pub trace: String,
    pub duration_ms: u64,
    pub verdict: Option<Verdict>,
    pub rationale: Option<String>,
    pub issues: Vec<String>,
    pub feedback_origin: Option<FeedbackOrigin>,
}

impl AuditEntry {
    fn from_attempt(attempt: &Attempt) -> Self {
        let feedback = attempt.feedback.as_ref();
        Self {
            index: attempt.index,
            artifact_id: attempt.artifact.id.clone(),
            version: attempt.artifact.version,
            produced_by: attempt.artifact.produced_by,
            source: attempt.artifact.source.clone(),
            digest: attempt.artifact.digest.clone(),
            status: attempt.execution.status,
            output: attempt.execution.output.clone(),
            side_effects: attempt.execution.side_effects.clone(),
            trace: attempt.execution.trace.clone(),
            duration_ms: attempt.execution.duration_ms,
            verdict: feedback.map(|f| f.verdict),
            rationale: feedback.map(|f| f.rationale.clone()),
            issues: feedback.map(|f| f.issues.clone()).unwrap_or_default(),
            feedback_origin: feedback.map(|f| f.origin.clone()),
        }
    }
}

/// Serialisable record of a whole session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditTrail {
    pub session_id: String,
    pub task: String,
    pub kind: ArtifactKind,
    pub outcome: SessionOutcome,
    pub validated: bool,
    pub final_artifact_id: Option<String>,
    pub states: Vec<LoopState>,
    pub commit: CommitState,
    pub attempts: Vec<AuditEntry>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl AuditTrail {
    pub fn to_json_pretty(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}
