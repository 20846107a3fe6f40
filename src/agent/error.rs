//! Errors from the model-backed roles.

use thiserror::Error;

use crate::llm::{LlmError, TokenUsage};
use crate::sandbox::MalformedArtifact;

/// Why a generator, refiner, critic or context lookup produced nothing usable.
///
/// Failures that happen after a model replied carry the tokens that reply
/// cost, so a session's usage counts every call.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("{error}")]
    Malformed { error: MalformedArtifact, usage: TokenUsage },

    /// The critic's reply could not be decoded into valid feedback
    #[error("Critic contract violation: {reason}")]
    CriticContractViolation { reason: String, usage: TokenUsage },

    #[error("Context lookup '{provider}' failed: {reason}")]
    Context { provider: String, reason: String },
}

impl AgentError {
    pub fn malformed(error: MalformedArtifact, usage: TokenUsage) -> Self {
        AgentError::Malformed { error, usage }
    }

    pub fn contract(reason: impl Into<String>, usage: TokenUsage) -> Self {
        AgentError::CriticContractViolation {
            reason: reason.into(),
            usage,
        }
    }

    /// Failures the controller retries once before giving up.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AgentError::Malformed { .. } | AgentError::CriticContractViolation { .. }
        )
    }

    /// Tokens spent on the failed call, if a reply was received.
    pub fn usage(&self) -> TokenUsage {
        match self {
            AgentError::Malformed { usage, .. } | AgentError::CriticContractViolation { usage, .. } => *usage,
            _ => TokenUsage::default(),
        }
    }
}

impl From<MalformedArtifact> for AgentError {
    fn from(error: MalformedArtifact) -> Self {
        AgentError::malformed(error, TokenUsage::default())
    }
}
