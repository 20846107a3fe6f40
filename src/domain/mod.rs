//! Domain types for Reflector
//!
//! This module contains the core records of the control loop:
//! - Artifact: an immutable, versioned unit of generated work
//! - ExecutionResult: what happened when the sandbox ran an artifact
//! - Feedback: the verdict and issues from reflecting on an execution
//! - Session / Attempt: the ordered audit record of one task

pub mod artifact;
pub mod execution;
pub mod feedback;
pub mod session;

pub use artifact::{Artifact, ArtifactKind, Producer, digest_source};
pub use execution::{ExecutionOutput, ExecutionResult, ExecutionStatus};
pub use feedback::{Feedback, FeedbackOrigin, Verdict};
pub use session::{Attempt, AuditEntry, AuditTrail, CommitState, LoopState, Session, SessionOutcome, Task};
