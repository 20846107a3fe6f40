//! Generator and Refiner: the two roles that produce artifact source.
//!
//! Both return source that has already passed the structural check for the
//! task's kind. A reply that does not is a `MalformedArtifact`, which is a
//! different thing from an artifact that fails when executed.

use std::sync::Arc;

use async_trait::async_trait;

use super::error::AgentError;
use super::evidence::EvidenceFormatter;
use super::parse::extract_artifact;
use super::prompts;
use crate::domain::{Artifact, Attempt, ExecutionResult, Feedback, Task};
use crate::llm::{CompletionRequest, LlmClient, TokenUsage};

/// Well-formed source produced by a generator or refiner.
#[derive(Debug, Clone, PartialEq)]
pub struct Draft {
    pub source: String,
    pub usage: TokenUsage,
}

/// Everything the refiner sees about the attempt being revised.
#[derive(Debug, Clone, Copy)]
pub struct RefineInput<'a> {
    pub task: &'a Task,
    pub artifact: &'a Artifact,
    pub execution: &'a ExecutionResult,
    pub feedback: &'a Feedback,
    pub context: &'a str,
    /// Earlier attempts, oldest first, not including `artifact`'s
    pub history: &'a [Attempt],
}

/// Produces the first artifact for a task.
#[async_trait]
pub trait Generator: Send + Sync {
    /// `correction` describes why the previous reply was rejected, on a retry.
    async fn generate(&self, task: &Task, context: &str, correction: Option<&str>) -> Result<Draft, AgentError>;
}

/// Produces a revised artifact from feedback on an executed one.
#[async_trait]
pub trait Refiner: Send + Sync {
    async fn refine(&self, input: &RefineInput<'_>, correction: Option<&str>) -> Result<Draft, AgentError>;
}

/// Per-role model settings.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelOptions {
    pub max_tokens: u32,
    pub temperature: Option<f32>,
}

impl Default for ModelOptions {
    fn default() -> Self {
        Self {
            max_tokens: 4096,
            temperature: None,
        }
    }
}

impl ModelOptions {
    fn apply(&self, request: CompletionRequest) -> CompletionRequest {
        let request = request.with_max_tokens(self.max_tokens);
        match self.temperature {
            Some(t) => request.with_temperature(t),
            None => request,
        }
    }
}

/// Send one prompt and extract a well-formed artifact from the reply.
async fn draft(
    client: &dyn LlmClient,
    options: &ModelOptions,
    task: &Task,
    system: &str,
    prompt: String,
) -> Result<Draft, AgentError> {
    let request = options.apply(CompletionRequest::new(system).with_user_message(prompt));
    let response = client.complete(request).await?;

    if response.stop_reason.is_truncated() {
        tracing::warn!(kind = %task.kind, "Model reply hit the token limit");
    }

    match extract_artifact(&response.content, task.kind) {
        Ok(source) => Ok(Draft {
            source,
            usage: response.usage,
        }),
        Err(error) => Err(AgentError::malformed(error, response.usage)),
    }
}

fn correction_block(correction: Option<&str>) -> String {
    match correction {
        Some(reason) => format!(
            "\n\nYour previous reply was rejected: {}\nFollow the output contract exactly.",
            reason
        ),
        None => String::new(),
    }
}

/// Generator backed by a model client.
pub struct LlmGenerator {
    client: Arc<dyn LlmClient>,
    options: ModelOptions,
}

impl LlmGenerator {
    pub fn new(client: Arc<dyn LlmClient>) -> Self {
        Self {
            client,
            options: ModelOptions::default(),
        }
    }

    pub fn with_options(mut self, options: ModelOptions) -> Self {
        self.options = options;
        self
    }

    /// Build the generation prompt.
    pub fn build_prompt(task: &Task, context: &str, correction: Option<&str>) -> String {
        format!(
            "## Context\n\n{}\n\n## Rules\n\n{}\n\n## Request\n\n{}\n\n## Output\n\n{}{}",
            context.trim(),
            prompts::kind_rules(task.kind),
            task.description,
            prompts::output_contract(task.kind),
            correction_block(correction),
        )
    }
}

#[async_trait]
impl Generator for LlmGenerator {
    async fn generate(&self, task: &Task, context: &str, correction: Option<&str>) -> Result<Draft, AgentError> {
        let prompt = Self::build_prompt(task, context, correction);
        draft(
            self.client.as_ref(),
            &self.options,
            task,
            prompts::generator_system(task.kind),
            prompt,
        )
        .await
    }
}

/// Refiner backed by a model client.
pub struct LlmRefiner {
    client: Arc<dyn LlmClient>,
    options: ModelOptions,
    formatter: EvidenceFormatter,
}

impl LlmRefiner {
    pub fn new(client: Arc<dyn LlmClient>) -> Self {
        Self {
            client,
            options: ModelOptions::default(),
            formatter: EvidenceFormatter::default(),
        }
    }

    pub fn with_options(mut self, options: ModelOptions) -> Self {
        self.options = options;
        self
    }

    /// Build the refinement prompt: the original request, the artifact, what
    /// it actually did when executed, and the feedback to address.
    pub fn build_prompt(&self, input: &RefineInput<'_>, correction: Option<&str>) -> String {
        let mut prompt = String::new();

        prompt.push_str(&format!("## Request\n\n{}\n\n", input.task.description));
        prompt.push_str(&format!("## Context\n\n{}\n\n", input.context.trim()));
        prompt.push_str(&format!(
            "## Current Artifact (v{})\n\n```\n{}\n```\n\n",
            input.artifact.version, input.artifact.source
        ));
        prompt.push_str("## Execution Result\n\n");
        prompt.push_str(&self.formatter.format_execution(input.execution));
        prompt.push_str("\n## Feedback\n\n");
        prompt.push_str(&self.formatter.format_feedback(input.feedback));
        prompt.push('\n');

        let history = self.formatter.format_history(input.history);
        if !history.is_empty() {
            prompt.push_str(&history);
            prompt.push('\n');
        }

        prompt.push_str(&format!("## Rules\n\n{}\n\n", prompts::kind_rules(input.task.kind)));
        prompt.push_str(
            "## Output\n\nWrite a revised artifact that fixes every issue above. \
             If the current artifact is already correct, return it unchanged. ",
        );
        prompt.push_str(prompts::output_contract(input.task.kind));
        prompt.push_str(&correction_block(correction));

        prompt
    }
}

#[async_trait]
impl Refiner for LlmRefiner {
    async fn refine(&self, input: &RefineInput<'_>, correction: Option<&str>) -> Result<Draft, AgentError> {
        let prompt = self.build_prompt(input, correction);
        draft(
            self.client.as_ref(),
            &self.options,
            input.task,
            "You are a reviewer and refiner. You improve artifacts using the evidence of what they actually did.",
            prompt,
        )
        .await
    }
}
