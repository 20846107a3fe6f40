//! Loop controller - drives one task through generate → execute → reflect → refine.
//!
//! Every transition is recorded on the [`Session`]. Attempts run staged; only
//! the final artifact's change set is applied to the store, and only when the
//! session ends accepted or completed.

use std::future::Future;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::agent::{
    AgentError, ContextProvider, Critic, CritiqueInput, Generator, LlmCritic, LlmGenerator, LlmRefiner, RefineInput,
    Refiner, gather_context,
};
use crate::domain::{
    Artifact, Attempt, CommitState, ExecutionResult, Feedback, LoopState, Producer, Session, SessionOutcome, Task,
};
use crate::error::{ReflectorError, Result};
use crate::id::{artifact_id, generate_session_id};
use crate::llm::{LlmClient, TokenUsage};
use crate::sandbox::{CapabilitySet, ResourceLimits, SandboxedExecutor};
use crate::store::{Attribution, WriteOutcome};
use crate::validation::{CompositeValidator, DomainValidator};

/// How many refinement rounds a session may take.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum RefinePolicy {
    /// Critique v1 once; a revision produces v2, which is final without a second critique
    #[default]
    OneShot,
    /// Critique every attempt and run the domain validators on acceptance,
    /// up to `max_attempts` artifacts
    Bounded { max_attempts: u32 },
}

impl RefinePolicy {
    /// Upper bound on attempts recorded in a session.
    pub fn max_attempts(&self) -> u32 {
        match self {
            RefinePolicy::OneShot => 2,
            RefinePolicy::Bounded { max_attempts } => *max_attempts,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopConfig {
    pub policy: RefinePolicy,
    /// Apply the final artifact's change set to the store
    pub commit_final: bool,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            policy: RefinePolicy::default(),
            commit_final: true,
        }
    }
}

/// Runs sessions against one executor.
pub struct LoopController {
    executor: SandboxedExecutor,
    generator: Arc<dyn Generator>,
    refiner: Arc<dyn Refiner>,
    critic: Arc<dyn Critic>,
    providers: Vec<Arc<dyn ContextProvider>>,
    validators: CompositeValidator,
    caps: CapabilitySet,
    limits: ResourceLimits,
    config: LoopConfig,
}

impl LoopController {
    pub fn new(
        executor: SandboxedExecutor,
        generator: Arc<dyn Generator>,
        refiner: Arc<dyn Refiner>,
        critic: Arc<dyn Critic>,
    ) -> Self {
        Self {
            executor,
            generator,
            refiner,
            critic,
            providers: Vec::new(),
            validators: CompositeValidator::new(),
            caps: CapabilitySet::read_only(),
            limits: ResourceLimits::default(),
            config: LoopConfig::default(),
        }
    }

    /// All three roles backed by the same model client.
    pub fn with_llm(executor: SandboxedExecutor, client: Arc<dyn LlmClient>) -> Self {
        Self::new(
            executor,
            Arc::new(LlmGenerator::new(client.clone())),
            Arc::new(LlmRefiner::new(client.clone())),
            Arc::new(LlmCritic::new(client)),
        )
    }

    pub fn with_context_provider(mut self, provider: Arc<dyn ContextProvider>) -> Self {
        self.providers.push(provider);
        self
    }

    /// Validators consulted after the critic accepts (bounded policy only).
    pub fn with_validator(mut self, validator: Arc<dyn DomainValidator>) -> Self {
        self.validators.push(validator);
        self
    }

    pub fn with_capabilities(mut self, caps: CapabilitySet) -> Self {
        self.caps = caps;
        self
    }

    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_config(mut self, config: LoopConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &LoopConfig {
        &self.config
    }

    pub fn executor(&self) -> &SandboxedExecutor {
        &self.executor
    }

    /// Run a task to a terminal state under a fresh session ID.
    pub async fn run(&self, task: Task) -> Result<Session> {
        self.run_with_id(generate_session_id(), task).await
    }

    /// Run a task to a terminal state.
    ///
    /// `Err` means the infrastructure failed (store, executor). Every failure
    /// of a generated artifact or of a model call ends in a terminal session.
    pub async fn run_with_id(&self, session_id: impl Into<String>, task: Task) -> Result<Session> {
        let policy = self.config.policy;
        if policy.max_attempts() == 0 {
            return Err(ReflectorError::Config("max_attempts must be at least 1".to_string()));
        }

        let mut session = Session::new(session_id, task, "", policy.max_attempts());
        tracing::info!(session_id = %session.id, kind = %session.task.kind, "Session started");

        match gather_context(&self.providers, &session.task).await {
            Ok(context) => session.context = context,
            Err(err) => return Ok(self.fail(session, "context", err)),
        }

        let generator = &self.generator;
        let task = &session.task;
        let context = &session.context;
        let generated = retry_once(&mut session.usage, "generator", move |correction| async move {
            generator.generate(task, context, correction.as_deref()).await
        })
        .await;
        let draft = match generated {
            Ok(draft) => draft,
            Err(err) => return Ok(self.fail(session, "generator", err)),
        };
        session.usage.add(&draft.usage);

        let mut version = 1;
        let mut artifact = Artifact::new(
            artifact_id(&session.id, version),
            session.task.kind,
            draft.source,
            version,
            Producer::Generator,
        );
        session.enter(LoopState::Generated(version));

        loop {
            let execution = self.executor.stage(&artifact, &self.caps, &self.limits).await?;
            tracing::info!(
                session_id = %session.id,
                attempt = version,
                status = %execution.status,
                mutations = execution.side_effects.len(),
                "Attempt executed"
            );
            session.enter(LoopState::Executed(version));

            if policy == RefinePolicy::OneShot && version >= 2 {
                session.record(Attempt::new(version, artifact, execution));
                session.finish(SessionOutcome::Completed);
                break;
            }

            let feedback = match self.reflect(&mut session, &artifact, &execution).await? {
                Ok(feedback) => feedback,
                Err(err) => {
                    session.record(Attempt::new(version, artifact, execution));
                    return Ok(self.fail(session, "critic", err));
                }
            };
            session.enter(LoopState::Reflected(version));
            tracing::info!(
                session_id = %session.id,
                attempt = version,
                verdict = %feedback.verdict,
                issues = feedback.issues.len(),
                "Attempt reflected"
            );

            let accepted = feedback.is_accept();
            session.record(Attempt::new(version, artifact, execution).with_feedback(feedback));

            if accepted {
                session.finish(SessionOutcome::Accepted);
                break;
            }
            if version >= policy.max_attempts() {
                session.finish(SessionOutcome::DegradedFinal {
                    reason: format!("{} attempts made without acceptance", version),
                });
                break;
            }

            let mut spent = TokenUsage::default();
            let refined = {
                let Some((current, history)) = session.attempts.split_last() else {
                    return Err(ReflectorError::InvalidState("refining without an attempt".to_string()));
                };
                let Some(feedback) = current.feedback.as_ref() else {
                    return Err(ReflectorError::InvalidState("refining without feedback".to_string()));
                };
                let input = RefineInput {
                    task: &session.task,
                    artifact: &current.artifact,
                    execution: &current.execution,
                    feedback,
                    context: &session.context,
                    history,
                };
                let refiner = &self.refiner;
                let input = &input;
                retry_once(&mut spent, "refiner", move |correction| async move {
                    refiner.refine(input, correction.as_deref()).await
                })
                .await
            };
            session.usage.add(&spent);
            let draft = match refined {
                Ok(draft) => draft,
                Err(err) => return Ok(self.fail(session, "refiner", err)),
            };
            session.usage.add(&draft.usage);

            version += 1;
            artifact = Artifact::new(
                artifact_id(&session.id, version),
                session.task.kind,
                draft.source,
                version,
                Producer::Refiner,
            );
            session.enter(LoopState::Refined(version));
        }

        session.commit = self.commit_final(&mut session).await?;
        tracing::info!(
            session_id = %session.id,
            outcome = session.outcome.as_str(),
            attempts = session.attempt_count(),
            tokens = session.usage.total(),
            "Session finished"
        );
        Ok(session)
    }

    /// Critique an executed attempt, then run the validators if it was accepted.
    ///
    /// The outer `Result` carries infrastructure failures from validators; the
    /// inner one a critic that never produced valid feedback.
    async fn reflect(
        &self,
        session: &mut Session,
        artifact: &Artifact,
        execution: &ExecutionResult,
    ) -> Result<std::result::Result<Feedback, AgentError>> {
        let mut spent = TokenUsage::default();
        let critiqued = {
            let input = CritiqueInput {
                task: &session.task,
                artifact,
                execution,
                context: &session.context,
            };
            let critic = &self.critic;
            let input = &input;
            retry_once(&mut spent, "critic", move |correction| async move {
                critic.critique(input, correction.is_some()).await
            })
            .await
        };
        session.usage.add(&spent);

        let critique = match critiqued {
            Ok(critique) => critique,
            Err(err) => return Ok(Err(err)),
        };
        session.usage.add(&critique.usage);

        let bounded = matches!(self.config.policy, RefinePolicy::Bounded { .. });
        if !critique.feedback.is_accept() || !bounded || self.validators.is_empty() {
            return Ok(Ok(critique.feedback));
        }

        let validation = self.validators.validate(artifact, execution).await?;
        if validation.passed {
            return Ok(Ok(critique.feedback));
        }

        tracing::info!(
            session_id = %session.id,
            attempt = artifact.version,
            validators = %validation.failed.join(","),
            "Accepted attempt failed domain validation"
        );
        Ok(Ok(Feedback::from_validator(
            &artifact.id,
            validation.failed.join(", "),
            validation.errors,
        )))
    }

    /// Apply the final attempt's staged change set.
    async fn commit_final(&self, session: &mut Session) -> Result<CommitState> {
        match session.outcome {
            SessionOutcome::Accepted | SessionOutcome::Completed => {}
            SessionOutcome::DegradedFinal { .. } => {
                return Ok(CommitState::Skipped {
                    reason: "degraded artifacts are never committed".to_string(),
                });
            }
            _ => {
                return Ok(CommitState::Skipped {
                    reason: "no final artifact".to_string(),
                });
            }
        }
        if !self.config.commit_final {
            return Ok(CommitState::Skipped {
                reason: "commit disabled".to_string(),
            });
        }

        let session_id = session.id.clone();
        let Some(attempt) = session.attempts.last_mut() else {
            return Ok(CommitState::Skipped {
                reason: "no final artifact".to_string(),
            });
        };
        if !attempt.execution.succeeded() {
            return Ok(CommitState::Skipped {
                reason: format!("final execution ended with {}", attempt.execution.status),
            });
        }
        if attempt.execution.side_effects.is_empty() {
            return Ok(CommitState::NothingToCommit);
        }

        let store = Arc::clone(self.executor.store());
        let mutations = attempt.execution.side_effects.clone();
        let expected_version = attempt.execution.base_version;
        let attribution = Attribution::attempt(&session_id, attempt.index, &attempt.artifact.id);
        let outcome = tokio::task::spawn_blocking(move || store.apply(&mutations, expected_version, attribution))
            .await
            .map_err(|e| ReflectorError::Store(format!("commit task failed: {}", e)))??;

        match outcome {
            WriteOutcome::Committed { receipt } => {
                attempt.execution.committed = true;
                tracing::info!(
                    session_id = %session_id,
                    attempt = attempt.index,
                    version = receipt.version,
                    mutations = receipt.mutations,
                    "Final change set committed"
                );
                Ok(CommitState::Committed { receipt })
            }
            WriteOutcome::Rejected { current_version, .. } => Ok(CommitState::Conflict {
                expected_version,
                actual_version: current_version,
            }),
        }
    }

    fn fail(&self, mut session: Session, role: &str, err: AgentError) -> Session {
        tracing::warn!(session_id = %session.id, role = role, error = %err, "Generation failed");
        session.finish(SessionOutcome::GenerationFailed {
            reason: format!("{}: {}", role, err),
        });
        session.commit = CommitState::Skipped {
            reason: "no final artifact".to_string(),
        };
        session
    }
}

/// Call a model-backed role, retrying once on a malformed reply.
///
/// The retry receives the first failure's message as a correction. Tokens
/// spent on failed replies are added to `usage`; a successful reply's tokens
/// are left to the caller.
async fn retry_once<T, F, Fut>(usage: &mut TokenUsage, role: &str, call: F) -> std::result::Result<T, AgentError>
where
    F: Fn(Option<String>) -> Fut,
    Fut: Future<Output = std::result::Result<T, AgentError>>,
{
    let err = match call(None).await {
        Ok(value) => return Ok(value),
        Err(err) => err,
    };
    usage.add(&err.usage());
    if !err.is_retryable() {
        return Err(err);
    }

    tracing::warn!(role = role, error = %err, "Retrying after unusable reply");
    call(Some(err.to_string())).await.inspect_err(|err| usage.add(&err.usage()))
}
