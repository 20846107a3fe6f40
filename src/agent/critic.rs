//! The critic: judges an execution against the task.
//!
//! Feedback is grounded in what the artifact actually did. The critic sees
//! the execution status, output, mutations and trace, not just the source.
//! A `Revise` verdict must carry at least one concrete issue; anything else
//! is a contract violation the controller retries once in strict mode.

use std::sync::Arc;

use async_trait::async_trait;

use super::error::AgentError;
use super::evidence::EvidenceFormatter;
use super::generator::ModelOptions;
use super::parse::parse_critique;
use super::prompts;
use crate::domain::{Artifact, ExecutionResult, Feedback, Task};
use crate::llm::{CompletionRequest, LlmClient, TokenUsage};

/// What the critic is asked to judge.
#[derive(Debug, Clone, Copy)]
pub struct CritiqueInput<'a> {
    pub task: &'a Task,
    pub artifact: &'a Artifact,
    pub execution: &'a ExecutionResult,
    pub context: &'a str,
}

/// Feedback plus the tokens it cost.
#[derive(Debug, Clone, PartialEq)]
pub struct Critique {
    pub feedback: Feedback,
    pub usage: TokenUsage,
}

#[async_trait]
pub trait Critic: Send + Sync {
    /// `strict` is set on the retry after a contract violation.
    async fn critique(&self, input: &CritiqueInput<'_>, strict: bool) -> Result<Critique, AgentError>;
}

/// Critic backed by a model client.
pub struct LlmCritic {
    client: Arc<dyn LlmClient>,
    options: ModelOptions,
    formatter: EvidenceFormatter,
}

impl LlmCritic {
    pub fn new(client: Arc<dyn LlmClient>) -> Self {
        Self {
            client,
            options: ModelOptions {
                max_tokens: 1024,
                temperature: Some(0.0),
            },
            formatter: EvidenceFormatter::default(),
        }
    }

    pub fn with_options(mut self, options: ModelOptions) -> Self {
        self.options = options;
        self
    }

    /// Build the critique prompt.
    pub fn build_prompt(&self, input: &CritiqueInput<'_>, strict: bool) -> String {
        let mut prompt = String::new();

        prompt.push_str(&format!("## Request\n\n{}\n\n", input.task.description));
        prompt.push_str(&format!("## Context\n\n{}\n\n", input.context.trim()));
        prompt.push_str(&format!(
            "## Artifact (v{}, {})\n\n```\n{}\n```\n\n",
            input.artifact.version, input.artifact.kind, input.artifact.source
        ));
        prompt.push_str("## Execution Result\n\n");
        prompt.push_str(&self.formatter.format_execution(input.execution));
        prompt.push_str(&format!("\n## Evaluation\n\n{}\n\n", prompts::critic_rubric(input.task.kind)));
        prompt.push_str(prompts::CRITIC_CONTRACT);

        if strict {
            prompt.push_str("\n\n");
            prompt.push_str(prompts::CRITIC_STRICT);
        }

        prompt
    }
}

#[async_trait]
impl Critic for LlmCritic {
    async fn critique(&self, input: &CritiqueInput<'_>, strict: bool) -> Result<Critique, AgentError> {
        let mut request = CompletionRequest::new("You are a precise reviewer. You judge results, not intentions.")
            .with_user_message(self.build_prompt(input, strict))
            .with_max_tokens(self.options.max_tokens);
        request.temperature = self.options.temperature;

        let response = self.client.complete(request).await?;

        match parse_critique(&response.content, &input.artifact.id) {
            Ok(feedback) => Ok(Critique {
                feedback,
                usage: response.usage,
            }),
            Err(reason) => Err(AgentError::contract(reason, response.usage)),
        }
    }
}
