//! Model client layer
//!
//! This module provides:
//! - Message and request types for model calls
//! - LlmClient trait for API abstraction
//! - AnthropicClient implementation
//! - ScriptedLlmClient for deterministic runs

pub mod anthropic;
pub mod client;
pub mod scripted;
pub mod types;

pub use anthropic::{AnthropicClient, AnthropicConfig};
pub use client::{LlmClient, LlmError, estimate_tokens};
pub use scripted::ScriptedLlmClient;
pub use types::{CompletionRequest, CompletionResponse, Message, Role, StopReason, TokenUsage};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_exports() {
        let _role = Role::User;
        let _stop = StopReason::EndTurn;
        let _usage = TokenUsage::default();
    }
}
