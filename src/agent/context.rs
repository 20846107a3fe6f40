//! Context lookups that feed the generator.
//!
//! Providers are independent, so they run concurrently and all must finish
//! before generation starts. This is the only fan-out point in a session.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::try_join_all;

use super::error::AgentError;
use crate::domain::Task;
use crate::store::Store;

/// A source of context for a task (schema, documents, search results).
#[async_trait]
pub trait ContextProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn gather(&self, task: &Task) -> Result<String, AgentError>;
}

/// Describes the store's tables with a few sample rows.
pub struct StoreSchemaProvider {
    store: Arc<Store>,
    sample_rows: usize,
}

impl StoreSchemaProvider {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store, sample_rows: 3 }
    }

    pub fn with_sample_rows(mut self, sample_rows: usize) -> Self {
        self.sample_rows = sample_rows;
        self
    }
}

#[async_trait]
impl ContextProvider for StoreSchemaProvider {
    fn name(&self) -> &str {
        "schema"
    }

    async fn gather(&self, _task: &Task) -> Result<String, AgentError> {
        let store = Arc::clone(&self.store);
        let sample_rows = self.sample_rows;
        let fail = |reason: String| AgentError::Context {
            provider: "schema".to_string(),
            reason,
        };

        // The store lock can be held by a running execution.
        tokio::task::spawn_blocking(move || store.describe(sample_rows))
            .await
            .map_err(|e| fail(e.to_string()))?
            .map_err(|e| fail(e.to_string()))
    }
}

/// Fixed text, e.g. notes supplied on the command line.
pub struct StaticContext {
    name: String,
    text: String,
}

impl StaticContext {
    pub fn new(name: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            text: text.into(),
        }
    }
}

#[async_trait]
impl ContextProvider for StaticContext {
    fn name(&self) -> &str {
        &self.name
    }

    async fn gather(&self, _task: &Task) -> Result<String, AgentError> {
        Ok(self.text.clone())
    }
}

/// Run every provider concurrently and join their sections in provider order.
pub async fn gather_context(providers: &[Arc<dyn ContextProvider>], task: &Task) -> Result<String, AgentError> {
    let sections = try_join_all(providers.iter().map(|p| async move {
        let text = p.gather(task).await?;
        tracing::debug!(provider = p.name(), bytes = text.len(), "Context gathered");
        Ok::<_, AgentError>(format!("### {}\n\n{}", p.name(), text.trim()))
    }))
    .await?;

    Ok(sections.join("\n\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ArtifactKind;
    use crate::store::{Demo, demo_store};
    use std::time::Duration;

    struct SlowProvider {
        name: &'static str,
        delay_ms: u64,
    }

    #[async_trait]
    impl ContextProvider for SlowProvider {
        fn name(&self) -> &str {
            self.name
        }

        async fn gather(&self, _task: &Task) -> Result<String, AgentError> {
            tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
            Ok(format!("{} results", self.name))
        }
    }

    struct FailingProvider;

    #[async_trait]
    impl ContextProvider for FailingProvider {
        fn name(&self) -> &str {
            "broken"
        }

        async fn gather(&self, _task: &Task) -> Result<String, AgentError> {
            Err(AgentError::Context {
                provider: "broken".to_string(),
                reason: "unreachable".to_string(),
            })
        }
    }

    fn task() -> Task {
        Task::new("t", ArtifactKind::Text)
    }

    #[tokio::test]
    async fn test_schema_provider() {
        let store = Arc::new(demo_store(Demo::Sales).unwrap());
        let text = StoreSchemaProvider::new(store).with_sample_rows(1).gather(&task()).await.unwrap();
        assert!(text.contains("Table sales"));
        assert!(text.contains("rows: 10"));
        assert_eq!(text.matches("sample:").count(), 1);
    }

    #[tokio::test]
    async fn test_gather_runs_concurrently_in_order() {
        let providers: Vec<Arc<dyn ContextProvider>> = vec![
            Arc::new(SlowProvider {
                name: "arxiv",
                delay_ms: 200,
            }),
            Arc::new(SlowProvider {
                name: "web",
                delay_ms: 200,
            }),
        ];

        let started = std::time::Instant::now();
        let context = gather_context(&providers, &task()).await.unwrap();

        assert!(started.elapsed() < Duration::from_millis(390));
        let arxiv = context.find("### arxiv").unwrap();
        let web = context.find("### web").unwrap();
        assert!(arxiv < web);
        assert!(context.contains("web results"));
    }

    #[tokio::test]
    async fn test_gather_fails_if_any_provider_fails() {
        let providers: Vec<Arc<dyn ContextProvider>> =
            vec![Arc::new(StaticContext::new("notes", "n")), Arc::new(FailingProvider)];
        let err = gather_context(&providers, &task()).await.unwrap_err();
        assert!(matches!(err, AgentError::Context { .. }));
    }

    #[tokio::test]
    async fn test_gather_empty() {
        assert_eq!(gather_context(&[], &task()).await.unwrap(), "");
    }
}
