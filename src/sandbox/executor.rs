//! The sandboxed executor: runs one artifact against the store under a
//! capability set and resource limits, all-or-nothing.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::oneshot;

use super::capability::{CapabilitySet, Meter, ResourceLimits};
use super::fault::Fault;
use super::interpreter::Interpreter;
use super::program::Program;
use super::query::{self, Statement};
use super::text;
use crate::domain::{Artifact, ArtifactKind, ExecutionOutput, ExecutionResult, ExecutionStatus};
use crate::error::{ReflectorError, Result};
use crate::store::{Attribution, Mutation, Row, Store, StoreTxn, diff_rows, is_interrupted};

/// A statically checked artifact, ready to run.
enum Plan {
    Query(Statement),
    Program(Program),
    Text,
}

impl Plan {
    /// Parse and check an artifact without touching the store.
    fn prepare(artifact: &Artifact, caps: &CapabilitySet) -> std::result::Result<Self, Fault> {
        match artifact.kind {
            ArtifactKind::Query => {
                let statement = query::lint(&artifact.source).map_err(query::LintError::into_fault)?;
                query::check(&statement, caps)?;
                Ok(Plan::Query(statement))
            }
            ArtifactKind::Code => {
                let program = Program::parse(&artifact.source).map_err(|e| Fault::runtime(e.to_string()))?;
                program.check(caps)?;
                Ok(Plan::Program(program))
            }
            ArtifactKind::Text => {
                text::check(&artifact.source).map_err(|e| Fault::runtime(e.to_string()))?;
                Ok(Plan::Text)
            }
        }
    }
}

#[derive(Debug, Clone)]
enum Mode {
    Commit(Attribution),
    Stage,
}

/// Executes artifacts against one shared store.
#[derive(Debug, Clone)]
pub struct SandboxedExecutor {
    store: Arc<Store>,
}

impl SandboxedExecutor {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Run an artifact and commit its mutations if it succeeds.
    ///
    /// `Err` is reserved for infrastructure failures; anything the artifact
    /// itself does wrong comes back as an `ExecutionResult` status, with the
    /// store left exactly as it was.
    pub async fn execute(
        &self,
        artifact: &Artifact,
        caps: &CapabilitySet,
        limits: &ResourceLimits,
    ) -> Result<ExecutionResult> {
        self.execute_as(artifact, caps, limits, Attribution::artifact(&artifact.id))
            .await
    }

    /// Like `execute`, with an explicit attribution for the commit receipt.
    pub async fn execute_as(
        &self,
        artifact: &Artifact,
        caps: &CapabilitySet,
        limits: &ResourceLimits,
        attribution: Attribution,
    ) -> Result<ExecutionResult> {
        self.run(artifact, caps, limits, Mode::Commit(attribution)).await
    }

    /// Run an artifact but always roll back.
    ///
    /// On success `side_effects` holds the change set the run would have
    /// committed and `base_version` the version it was computed against, ready
    /// for `Store::apply`.
    pub async fn stage(
        &self,
        artifact: &Artifact,
        caps: &CapabilitySet,
        limits: &ResourceLimits,
    ) -> Result<ExecutionResult> {
        self.run(artifact, caps, limits, Mode::Stage).await
    }

    async fn run(
        &self,
        artifact: &Artifact,
        caps: &CapabilitySet,
        limits: &ResourceLimits,
        mode: Mode,
    ) -> Result<ExecutionResult> {
        let started = Instant::now();
        let deadline = started + limits.timeout;
        let elapsed_ms = || started.elapsed().as_millis() as u64;

        let plan = match Plan::prepare(artifact, caps) {
            Ok(plan) => plan,
            Err(fault) => {
                tracing::info!(
                    artifact_id = %artifact.id,
                    status = %fault.status,
                    "Artifact rejected before execution"
                );
                return Ok(
                    ExecutionResult::failed(&artifact.id, fault.status, fault.trace(), self.store.version()?)
                        .with_duration_ms(elapsed_ms()),
                );
            }
        };

        if let Plan::Text = plan {
            let mut result = ExecutionResult::failed(&artifact.id, ExecutionStatus::Success, "", self.store.version()?);
            result.output = ExecutionOutput::Value(text::evaluate(&artifact.source));
            return Ok(result.with_duration_ms(elapsed_ms()));
        }

        let store = Arc::clone(&self.store);
        let caps_owned = caps.clone();
        let limits_owned = *limits;
        let artifact_id = artifact.id.clone();
        let (ready_tx, mut ready_rx) = oneshot::channel::<u64>();

        let mut handle = tokio::task::spawn_blocking(move || {
            run_blocking(&store, &artifact_id, &plan, &caps_owned, &limits_owned, deadline, mode, ready_tx)
        });

        let joined = match tokio::time::timeout_at(deadline.into(), &mut handle).await {
            Ok(joined) => joined,
            Err(_) => {
                // The blocking side gives up on the lock at the deadline by itself;
                // once it holds the store, interrupt its running statement.
                tokio::select! {
                    joined = &mut handle => joined,
                    ready = &mut ready_rx => {
                        if let Ok(ticket) = ready {
                            let interrupted = self.store.interrupt(ticket);
                            tracing::warn!(
                                artifact_id = %artifact.id,
                                timeout_ms = limits.timeout.as_millis() as u64,
                                interrupted,
                                "Execution exceeded wall-clock budget"
                            );
                        }
                        handle.await
                    }
                }
            }
        };

        let result = joined.map_err(|e| ReflectorError::Sandbox(format!("executor task failed: {}", e)))??;
        let result = result.with_duration_ms(elapsed_ms());

        tracing::info!(
            artifact_id = %artifact.id,
            status = %result.status,
            mutations = result.side_effects.len(),
            committed = result.committed,
            duration_ms = result.duration_ms,
            "Artifact executed"
        );
        Ok(result)
    }
}

/// Snapshot every declared table the capability set may write.
fn writable_rows(txn: &StoreTxn<'_>, caps: &CapabilitySet) -> Result<Vec<(String, Vec<Row>)>> {
    let names: Vec<String> = txn
        .tables()
        .filter(|schema| caps.can_write(&schema.name))
        .map(|schema| schema.name.clone())
        .collect();

    let mut tables = Vec::with_capacity(names.len());
    for name in names {
        let rows = txn.table_rows(&name)?;
        tables.push((name, rows));
    }
    Ok(tables)
}

/// Ordered row-level diff of the writable tables.
fn change_set(txn: &StoreTxn<'_>, before: &[(String, Vec<Row>)]) -> Result<Vec<Mutation>> {
    let mut mutations = Vec::new();
    for (table, rows) in before {
        let after = txn.table_rows(table)?;
        mutations.extend(diff_rows(table, rows, &after));
    }
    Ok(mutations)
}

#[allow(clippy::too_many_arguments)]
fn run_blocking(
    store: &Store,
    artifact_id: &str,
    plan: &Plan,
    caps: &CapabilitySet,
    limits: &ResourceLimits,
    deadline: Instant,
    mode: Mode,
    ready: oneshot::Sender<u64>,
) -> Result<ExecutionResult> {
    let Some(mut txn) = store.begin_until(deadline)? else {
        let fault = Fault::timeout(format!(
            "store stayed locked past the wall-clock budget of {}ms",
            limits.timeout.as_millis()
        ));
        return Ok(ExecutionResult::failed(artifact_id, fault.status, fault.trace(), store.version()?));
    };
    let base_version = txn.base_version();
    let _ = ready.send(txn.ticket());

    let mut meter = Meter::until(limits, deadline);
    let failed = |fault: Fault, steps: u64| {
        ExecutionResult::failed(artifact_id, fault.status, fault.trace(), base_version).with_steps(steps)
    };

    let before = match writable_rows(&txn, caps) {
        Ok(before) => before,
        Err(e) if is_interrupted(&e) => {
            txn.rollback()?;
            return Ok(failed(Fault::from_store(e), 0));
        }
        Err(e) => return Err(e),
    };

    let outcome = match plan {
        Plan::Query(statement) => query::run(&mut txn, statement, caps, &mut meter),
        Plan::Program(program) => Interpreter::new(&mut txn, caps, &mut meter)
            .run(program)
            .map(ExecutionOutput::Value),
        Plan::Text => Ok(ExecutionOutput::None),
    };

    let output = match outcome {
        Ok(output) => output,
        Err(fault) => {
            tracing::debug!(artifact_id, trace = %fault, "Execution faulted, rolling back");
            txn.rollback()?;
            return Ok(failed(fault, meter.steps()));
        }
    };

    let side_effects = match change_set(&txn, &before) {
        Ok(mutations) => mutations,
        Err(e) if is_interrupted(&e) => {
            txn.rollback()?;
            return Ok(failed(Fault::from_store(e), meter.steps()));
        }
        Err(e) => return Err(e),
    };

    if let Err(fault) = meter
        .check_deadline()
        .and_then(|()| meter.check_mutations(side_effects.len()))
    {
        txn.rollback()?;
        return Ok(failed(fault, meter.steps()));
    }

    let committed = match mode {
        Mode::Stage => {
            txn.rollback()?;
            false
        }
        Mode::Commit(attribution) => match txn.commit(attribution, side_effects.len()) {
            Ok(receipt) => receipt.is_some(),
            Err(e) if is_interrupted(&e) => {
                return Ok(failed(Fault::from_store(e), meter.steps()));
            }
            Err(e) => return Err(e),
        },
    };

    Ok(ExecutionResult {
        artifact_id: artifact_id.to_string(),
        status: ExecutionStatus::Success,
        output,
        side_effects,
        trace: String::new(),
        duration_ms: 0,
        base_version,
        committed,
        steps: meter.steps(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Producer;
    use crate::store::{Demo, demo_store};
    use serde_json::json;
    use std::time::Duration;

    fn executor(demo: Demo) -> SandboxedExecutor {
        SandboxedExecutor::new(Arc::new(demo_store(demo).unwrap()))
    }

    fn artifact(kind: ArtifactKind, source: &str) -> Artifact {
        Artifact::new("t-v1", kind, source, 1, Producer::Generator)
    }

    fn shop_caps() -> CapabilitySet {
        CapabilitySet::read_only()
            .with_write("inventory")
            .with_write("transactions")
    }

    #[tokio::test]
    async fn test_query_success() {
        let exec = executor(Demo::Sales);
        let a = artifact(
            ArtifactKind::Query,
            "SELECT color, SUM(quantity) AS total FROM sales GROUP BY color ORDER BY total DESC LIMIT 1",
        );
        let result = exec
            .execute(&a, &CapabilitySet::read_only(), &ResourceLimits::default())
            .await
            .unwrap();
        assert_eq!(result.status, ExecutionStatus::Success);
        let table = result.output.as_table().unwrap();
        assert_eq!(table.rows, vec![vec![json!("black"), json!(11)]]);
        assert!(!result.committed);
    }

    #[tokio::test]
    async fn test_commit_on_success() {
        let exec = executor(Demo::Shop);
        let a = artifact(
            ArtifactKind::Code,
            r#"[{"op": "update", "table": "inventory", "where": [{"column": "item_id", "value": "SG001"}],
                 "set": {"quantity_in_stock": 11}},
                {"op": "answer", "value": "ok"}]"#,
        );
        let before_version = exec.store().version().unwrap();
        let result = exec.execute(&a, &shop_caps(), &ResourceLimits::default()).await.unwrap();

        assert_eq!(result.status, ExecutionStatus::Success);
        assert!(result.committed);
        assert_eq!(result.side_effects.len(), 1);
        assert_eq!(result.base_version, before_version);
        assert_eq!(exec.store().version().unwrap(), before_version + 1);

        let log = exec.store().commit_log().unwrap();
        assert_eq!(log.last().unwrap().attribution.artifact_id, "t-v1");
    }

    #[tokio::test]
    async fn test_stage_never_commits() {
        let exec = executor(Demo::Shop);
        let before = exec.store().snapshot().unwrap();
        let a = artifact(
            ArtifactKind::Code,
            r#"[{"op": "delete", "table": "inventory", "where": [{"column": "quantity_in_stock", "value": 0}]}]"#,
        );
        let result = exec.stage(&a, &shop_caps(), &ResourceLimits::default()).await.unwrap();

        assert_eq!(result.status, ExecutionStatus::Success);
        assert_eq!(result.side_effects.len(), 2);
        assert!(!result.committed);
        assert_eq!(exec.store().snapshot().unwrap(), before);

        let outcome = exec
            .store()
            .apply(&result.side_effects, result.base_version, Attribution::artifact("t-v1"))
            .unwrap();
        assert!(outcome.is_committed());
        assert_eq!(exec.store().snapshot().unwrap().tables["inventory"].len(), 4);
    }

    #[tokio::test]
    async fn test_runtime_error_rolls_back_partial_updates() {
        let exec = executor(Demo::Shop);
        let before = exec.store().snapshot().unwrap();
        let a = artifact(
            ArtifactKind::Code,
            r#"[
                {"op": "update", "table": "inventory", "where": [{"column": "item_id", "value": "SG001"}], "set": {"price": 1}},
                {"op": "update", "table": "inventory", "where": [{"column": "item_id", "value": "SG002"}], "set": {"price": 1}},
                {"op": "fail", "message": "card declined"}
            ]"#,
        );
        let result = exec.execute(&a, &shop_caps(), &ResourceLimits::default()).await.unwrap();

        assert_eq!(result.status, ExecutionStatus::RuntimeError);
        assert!(result.trace.contains("card declined"));
        assert!(result.side_effects.is_empty());
        assert_eq!(exec.store().snapshot().unwrap(), before);
    }

    #[tokio::test]
    async fn test_capability_violation_before_store_access() {
        let exec = executor(Demo::Shop);
        let before = exec.store().snapshot().unwrap();
        let a = artifact(
            ArtifactKind::Code,
            r#"[{"op": "emit", "value": {"call": "fs.write", "args": ["/etc/passwd", "x"]}}]"#,
        );
        let result = exec.execute(&a, &shop_caps(), &ResourceLimits::default()).await.unwrap();
        assert_eq!(result.status, ExecutionStatus::CapabilityViolation);
        assert_eq!(result.steps, 0);
        assert_eq!(exec.store().snapshot().unwrap(), before);

        let q = artifact(ArtifactKind::Query, "DELETE FROM inventory");
        let result = exec.execute(&q, &CapabilitySet::read_only(), &ResourceLimits::default()).await.unwrap();
        assert_eq!(result.status, ExecutionStatus::CapabilityViolation);
    }

    #[tokio::test]
    async fn test_mutation_budget_rolls_back() {
        let exec = executor(Demo::Sales);
        let before = exec.store().snapshot().unwrap();
        let q = artifact(ArtifactKind::Query, "UPDATE sales SET quantity = 0");
        let limits = ResourceLimits::default().with_max_mutations(5);
        let result = exec
            .execute(&q, &CapabilitySet::none().with_write("sales"), &limits)
            .await
            .unwrap();
        assert_eq!(result.status, ExecutionStatus::CapabilityViolation);
        assert_eq!(exec.store().snapshot().unwrap(), before);
    }

    #[tokio::test]
    async fn test_slow_query_times_out() {
        let exec = executor(Demo::Sales);
        let before = exec.store().snapshot().unwrap();
        let q = artifact(
            ArtifactKind::Query,
            "WITH RECURSIVE n(i) AS (SELECT 1 UNION ALL SELECT i + 1 FROM n) SELECT count(*) FROM n",
        );
        let limits = ResourceLimits::default().with_timeout(Duration::from_millis(100));
        let result = exec.execute(&q, &CapabilitySet::read_only(), &limits).await.unwrap();
        assert_eq!(result.status, ExecutionStatus::Timeout);
        assert_eq!(exec.store().snapshot().unwrap(), before);

        // The store is usable again afterwards
        let ok = artifact(ArtifactKind::Query, "SELECT COUNT(*) FROM sales");
        let result = exec
            .execute(&ok, &CapabilitySet::read_only(), &ResourceLimits::default())
            .await
            .unwrap();
        assert_eq!(result.status, ExecutionStatus::Success);
    }

    #[tokio::test]
    async fn test_slow_write_times_out_and_rolls_back() {
        let exec = executor(Demo::Sales);
        let before = exec.store().snapshot().unwrap();
        let version = exec.store().version().unwrap();
        let q = artifact(
            ArtifactKind::Query,
            "UPDATE sales SET quantity = (WITH RECURSIVE n(i) AS (SELECT 1 UNION ALL SELECT i + 1 FROM n) SELECT count(*) FROM n)",
        );
        let limits = ResourceLimits::default().with_timeout(Duration::from_millis(100));
        let caps = CapabilitySet::read_only().with_write("sales");

        let result = exec.execute(&q, &caps, &limits).await.unwrap();
        assert_eq!(result.status, ExecutionStatus::Timeout);
        assert!(!result.committed);
        assert_eq!(exec.store().snapshot().unwrap(), before);
        assert_eq!(exec.store().version().unwrap(), version);

        let staged = exec.stage(&q, &caps, &limits).await.unwrap();
        assert_eq!(staged.status, ExecutionStatus::Timeout);
        assert!(staged.side_effects.is_empty());
    }

    #[tokio::test]
    async fn test_write_grant_matches_table_case_insensitively() {
        let exec = executor(Demo::Sales);
        let version = exec.store().version().unwrap();
        let commits = exec.store().commit_log().unwrap().len();
        let q = artifact(ArtifactKind::Query, "UPDATE sales SET quantity = 0");

        let staged = exec
            .stage(&q, &CapabilitySet::read_only().with_write("SALES"), &ResourceLimits::default())
            .await
            .unwrap();
        assert_eq!(staged.status, ExecutionStatus::Success);
        assert!(!staged.side_effects.is_empty());
        assert!(staged.side_effects.iter().all(|m| m.table() == "sales"));

        let result = exec
            .execute(&q, &CapabilitySet::read_only().with_write("SALES"), &ResourceLimits::default())
            .await
            .unwrap();
        assert_eq!(result.side_effects, staged.side_effects);
        assert!(result.committed);
        assert_eq!(exec.store().version().unwrap(), version + 1);
        assert_eq!(exec.store().commit_log().unwrap().len(), commits + 1);

        let limits = ResourceLimits::default().with_max_mutations(1);
        let fresh = executor(Demo::Sales);
        let capped = fresh
            .execute(&q, &CapabilitySet::read_only().with_write("Sales"), &limits)
            .await
            .unwrap();
        assert_eq!(capped.status, ExecutionStatus::CapabilityViolation);
    }

    #[tokio::test]
    async fn test_waiting_for_the_store_counts_against_the_budget() {
        let exec = executor(Demo::Sales);
        let store = Arc::clone(exec.store());
        let (locked_tx, locked_rx) = std::sync::mpsc::channel();
        let holder = std::thread::spawn(move || {
            let txn = store.begin().unwrap();
            locked_tx.send(()).unwrap();
            std::thread::sleep(Duration::from_millis(1500));
            txn.rollback().unwrap();
        });
        locked_rx.recv().unwrap();

        let q = artifact(ArtifactKind::Query, "SELECT COUNT(*) FROM sales");
        let limits = ResourceLimits::default().with_timeout(Duration::from_millis(100));
        let started = Instant::now();
        let result = exec.execute(&q, &CapabilitySet::read_only(), &limits).await.unwrap();

        assert_eq!(result.status, ExecutionStatus::Timeout);
        assert!(result.trace.contains("locked"));
        assert!(started.elapsed() < Duration::from_millis(1000));
        holder.join().unwrap();
    }

    #[tokio::test]
    async fn test_execution_is_deterministic() {
        let exec = executor(Demo::Shop);
        let a = artifact(
            ArtifactKind::Code,
            r#"[{"op": "read", "table": "inventory", "where": [{"column": "price", "cmp": "lte", "value": 80}], "into": "rows"},
                {"op": "answer", "value": {"call": "sum", "args": [{"var": "rows"}, "quantity_in_stock"]}}]"#,
        );
        let first = exec.execute(&a, &shop_caps(), &ResourceLimits::default()).await.unwrap();
        let second = exec.execute(&a, &shop_caps(), &ResourceLimits::default()).await.unwrap();
        assert_eq!(first.output, second.output);
        assert_eq!(first.output.as_value().unwrap()["answer"], json!(40));
    }

    #[tokio::test]
    async fn test_text_artifact() {
        let exec = executor(Demo::Sales);
        let a = artifact(ArtifactKind::Text, "Demand rose (https://example.org/a).");
        let result = exec.execute(&a, &CapabilitySet::none(), &ResourceLimits::default()).await.unwrap();
        assert_eq!(result.status, ExecutionStatus::Success);
        assert_eq!(result.output.as_value().unwrap()["sources"], json!(["https://example.org/a"]));
    }

    #[tokio::test]
    async fn test_malformed_artifact_is_runtime_error() {
        let exec = executor(Demo::Sales);
        let a = artifact(ArtifactKind::Code, "def policy(): pass");
        let result = exec.execute(&a, &CapabilitySet::read_only(), &ResourceLimits::default()).await.unwrap();
        assert_eq!(result.status, ExecutionStatus::RuntimeError);
        assert!(result.trace.contains("malformed code artifact"));
    }
}
