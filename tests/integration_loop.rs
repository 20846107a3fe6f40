//! End-to-end loop tests
//!
//! Drives whole sessions through the public API with a scripted model client
//! against the bundled demo stores.

use std::sync::Arc;

use reflector::agent::StoreSchemaProvider;
use reflector::domain::{
    ArtifactKind, CommitState, ExecutionStatus, FeedbackOrigin, LoopState, Producer, Session, SessionOutcome, Task,
};
use reflector::error::Result;
use reflector::llm::ScriptedLlmClient;
use reflector::runner::{LoopConfig, LoopController, RefinePolicy};
use reflector::sandbox::{CapabilitySet, SandboxedExecutor};
use reflector::store::{Demo, Store, demo_store};
use reflector::validation::{ExecutionStatusValidator, TrustedSourceValidator};
use serde_json::json;

const ALL_COLORS: &str = "SELECT color, SUM(quantity) AS total FROM sales GROUP BY color";
const TOP_COLOR: &str = "SELECT color, SUM(quantity) AS total FROM sales GROUP BY color ORDER BY total DESC LIMIT 1";

fn tagged(source: &str) -> String {
    format!("Here you go.\n<artifact>\n{}\n</artifact>", source)
}

fn accept() -> String {
    r#"{"verdict": "accept", "rationale": "meets the task"}"#.to_string()
}

fn revise(issue: &str) -> String {
    json!({"verdict": "revise", "rationale": "does not meet the task", "issues": [issue]}).to_string()
}

fn shop_caps() -> CapabilitySet {
    CapabilitySet::read_only()
        .with_write("inventory")
        .with_write("transactions")
}

fn controller(store: Arc<Store>, client: Arc<ScriptedLlmClient>) -> LoopController {
    LoopController::with_llm(SandboxedExecutor::new(Arc::clone(&store)), client)
        .with_context_provider(Arc::new(StoreSchemaProvider::new(store)))
}

fn bounded(max_attempts: u32) -> LoopConfig {
    LoopConfig {
        policy: RefinePolicy::Bounded { max_attempts },
        commit_final: true,
    }
}

/// Properties every terminal, non-fatal session must satisfy.
fn assert_well_formed(session: &Session) {
    assert!(session.outcome.is_terminal());
    assert!(!session.attempts.is_empty());
    let last = session.attempts.last().unwrap();
    assert_eq!(session.final_artifact_id.as_deref(), Some(last.artifact.id.as_str()));
    assert!(session.attempts.len() as u32 <= session.max_attempts);
    for (i, attempt) in session.attempts.iter().enumerate() {
        assert_eq!(attempt.index as usize, i + 1);
        assert_eq!(attempt.artifact.version as usize, i + 1);
    }
}

/// The first query returns every color; the critic asks for the maximum only
/// and the refined query is final.
#[tokio::test]
async fn test_sum_by_color_is_refined_to_the_maximum() -> Result<()> {
    let store = Arc::new(demo_store(Demo::Sales)?);
    let client = Arc::new(ScriptedLlmClient::new([
        tagged(ALL_COLORS),
        revise("must select only the maximum"),
        tagged(TOP_COLOR),
    ]));

    let session = controller(store, client.clone())
        .run(Task::new("Sum quantity by color and report the best-selling color", ArtifactKind::Query))
        .await?;

    assert_well_formed(&session);
    assert_eq!(session.outcome, SessionOutcome::Completed);
    assert_eq!(session.attempt_count(), 2);

    let v1 = &session.attempts[0];
    assert_eq!(v1.execution.output.as_table().unwrap().len(), 4);
    assert_eq!(v1.feedback.as_ref().unwrap().issues, vec!["must select only the maximum"]);

    let final_artifact = session.final_artifact().unwrap();
    assert_eq!(final_artifact.version, 2);
    assert_eq!(final_artifact.produced_by, Producer::Refiner);
    assert!(final_artifact.source.contains("ORDER BY total DESC LIMIT 1"));
    let table = session.final_result().unwrap().output.as_table().unwrap();
    assert_eq!(table.rows, vec![vec![json!("black"), json!(11)]]);

    // The generator saw the schema; the refiner saw v1's rows and the issue
    let requests = client.requests();
    assert!(requests[0].last_user_message().unwrap().contains("sales("));
    let refine_prompt = requests[2].last_user_message().unwrap();
    assert!(refine_prompt.contains("must select only the maximum"));
    assert!(refine_prompt.contains("black"));
    Ok(())
}

/// A filesystem write is refused, the store is untouched and the violation
/// reaches the critic as evidence.
#[tokio::test]
async fn test_filesystem_write_is_a_capability_violation() -> Result<()> {
    let store = Arc::new(demo_store(Demo::Sales)?);
    let before = store.snapshot()?;
    let client = Arc::new(ScriptedLlmClient::new([
        tagged("SELECT writefile('/tmp/colors.csv', color) FROM sales"),
        revise("query the store only; writing files is not allowed"),
        tagged(TOP_COLOR),
    ]));

    let session = controller(Arc::clone(&store), client.clone())
        .run(Task::new("Export the best-selling color", ArtifactKind::Query))
        .await?;

    assert_well_formed(&session);
    let v1 = &session.attempts[0];
    assert_eq!(v1.execution.status, ExecutionStatus::CapabilityViolation);
    assert!(v1.execution.side_effects.is_empty());
    assert_eq!(store.snapshot()?, before);

    let critic_prompt = client.requests()[1].last_user_message().unwrap().to_string();
    assert!(critic_prompt.contains("capability_violation"));
    assert_eq!(session.final_result().unwrap().status, ExecutionStatus::Success);
    Ok(())
}

/// A program that updates two rows and then fails leaves neither update
/// behind; only the refined program's change reaches the store.
#[tokio::test]
async fn test_partial_updates_roll_back_atomically() -> Result<()> {
    let store = Arc::new(demo_store(Demo::Shop)?);
    let failing = r#"[
        {"op": "update", "table": "inventory", "where": [{"column": "item_id", "value": "SG001"}], "set": {"price": 1}},
        {"op": "update", "table": "inventory", "where": [{"column": "item_id", "value": "SG002"}], "set": {"price": 1}},
        {"op": "fail", "message": "price feed unavailable"}
    ]"#;
    let fixed = r#"[
        {"op": "update", "table": "inventory", "where": [{"column": "item_id", "value": "SG001"}], "set": {"price": 72}},
        {"op": "answer", "value": "Aviator discounted"}
    ]"#;
    let client = Arc::new(ScriptedLlmClient::new([
        tagged(failing),
        revise("do not touch SG002 and do not fail"),
        tagged(fixed),
    ]));

    let session = controller(Arc::clone(&store), client)
        .with_capabilities(shop_caps())
        .run(Task::new("Discount the Aviator by 10%", ArtifactKind::Code))
        .await?;

    assert_well_formed(&session);
    let v1 = &session.attempts[0].execution;
    assert_eq!(v1.status, ExecutionStatus::RuntimeError);
    assert!(v1.trace.contains("price feed unavailable"));
    assert!(v1.side_effects.is_empty());

    assert!(matches!(session.commit, CommitState::Committed { .. }));
    let prices = store.read("SELECT item_id, price FROM inventory WHERE item_id IN ('SG001', 'SG002') ORDER BY item_id")?;
    assert_eq!(
        prices.rows,
        vec![vec![json!("SG001"), json!(72.0)], vec![json!("SG002"), json!(60.0)]]
    );
    Ok(())
}

/// Every report fails the trusted-source check; the session ends degraded
/// after exactly `max_attempts` attempts.
#[tokio::test]
async fn test_validator_failures_end_degraded() -> Result<()> {
    let store = Arc::new(Store::open_in_memory()?);
    let weak = "Recurrent novae repeat every decades (https://someblog.example.com/novae).";
    let client = Arc::new(ScriptedLlmClient::new([
        tagged(weak),
        accept(),
        tagged(weak),
        accept(),
        tagged(weak),
        accept(),
    ]));

    let session = LoopController::with_llm(SandboxedExecutor::new(store), client.clone())
        .with_config(bounded(3))
        .with_validator(Arc::new(TrustedSourceValidator::default()))
        .run(Task::new("Summarise research on recurrent novae", ArtifactKind::Text))
        .await?;

    assert_well_formed(&session);
    assert!(matches!(session.outcome, SessionOutcome::DegradedFinal { .. }));
    assert!(!session.is_validated());
    assert_eq!(session.attempt_count(), 3);
    assert_eq!(session.state(), LoopState::DegradedFinal);
    assert_eq!(client.remaining(), 0);

    for attempt in &session.attempts {
        let feedback = attempt.feedback.as_ref().unwrap();
        assert_eq!(
            feedback.origin,
            FeedbackOrigin::Validator {
                name: "trusted_sources".to_string()
            }
        );
        assert!(!feedback.issues.is_empty());
    }

    let refine_prompt = client.requests()[2].last_user_message().unwrap().to_string();
    assert!(refine_prompt.contains("someblog.example.com"));
    Ok(())
}

#[tokio::test]
async fn test_validator_pass_accepts_report() -> Result<()> {
    let store = Arc::new(Store::open_in_memory()?);
    let weak = "Novae recur (https://someblog.example.com/novae).";
    let strong = "Novae recur on decade timescales (https://arxiv.org/abs/2401.00001, https://www.nasa.gov/novae).";
    let client = Arc::new(ScriptedLlmClient::new([tagged(weak), accept(), tagged(strong), accept()]));

    let session = LoopController::with_llm(SandboxedExecutor::new(store), client)
        .with_config(bounded(3))
        .with_validator(Arc::new(ExecutionStatusValidator))
        .with_validator(Arc::new(TrustedSourceValidator::default()))
        .run(Task::new("Summarise research on recurrent novae", ArtifactKind::Text))
        .await?;

    assert_well_formed(&session);
    assert_eq!(session.outcome, SessionOutcome::Accepted);
    assert!(session.is_validated());
    assert_eq!(session.attempt_count(), 2);
    assert_eq!(session.commit, CommitState::NothingToCommit);
    Ok(())
}

#[tokio::test]
async fn test_first_accept_makes_no_refiner_call() -> Result<()> {
    let store = Arc::new(demo_store(Demo::Sales)?);
    let client = Arc::new(ScriptedLlmClient::new([tagged(TOP_COLOR), accept(), tagged(ALL_COLORS)]));

    let session = controller(store, client.clone())
        .with_config(bounded(3))
        .run(Task::new("Best-selling color", ArtifactKind::Query))
        .await?;

    assert_eq!(session.outcome, SessionOutcome::Accepted);
    assert_eq!(session.attempt_count(), 1);
    assert_eq!(client.call_count(), 2);
    assert_eq!(client.remaining(), 1);
    Ok(())
}

#[tokio::test]
async fn test_degraded_session_never_commits() -> Result<()> {
    let store = Arc::new(demo_store(Demo::Shop)?);
    let before = store.snapshot()?;
    let sell = r#"[{"op": "update", "table": "inventory", "where": [{"column": "item_id", "value": "SG001"}],
                    "set": {"quantity_in_stock": 11}}]"#;
    let client = Arc::new(ScriptedLlmClient::new([
        tagged(sell),
        revise("also record the transaction"),
        tagged(sell),
        revise("the transaction is still missing"),
    ]));

    let session = controller(Arc::clone(&store), client)
        .with_capabilities(shop_caps())
        .with_config(bounded(2))
        .run(Task::new("Sell one Aviator to Ada", ArtifactKind::Code))
        .await?;

    assert!(matches!(session.outcome, SessionOutcome::DegradedFinal { .. }));
    assert!(session.attempts.iter().all(|a| a.execution.succeeded()));
    assert!(session.attempts.iter().all(|a| !a.execution.committed));
    assert!(matches!(session.commit, CommitState::Skipped { .. }));
    assert_eq!(store.snapshot()?, before);
    Ok(())
}

#[tokio::test]
async fn test_critic_contract_violation_twice_fails_generation() -> Result<()> {
    let store = Arc::new(demo_store(Demo::Sales)?);
    let before = store.snapshot()?;
    let client = Arc::new(ScriptedLlmClient::new([
        tagged(TOP_COLOR),
        r#"{"verdict": "revise", "rationale": "not sure"}"#.to_string(),
        "Looks fine to me!".to_string(),
    ]));

    let session = controller(Arc::clone(&store), client.clone())
        .run(Task::new("Best-selling color", ArtifactKind::Query))
        .await?;

    assert!(session.outcome.is_fatal());
    assert!(session.final_artifact_id.is_none());
    assert_eq!(session.attempt_count(), 1);
    assert!(session.attempts[0].feedback.is_none());
    assert_eq!(client.call_count(), 3);
    assert_eq!(session.usage.total(), 60);
    assert_eq!(store.snapshot()?, before);
    Ok(())
}

#[tokio::test]
async fn test_malformed_refinement_retried_with_reason() -> Result<()> {
    let store = Arc::new(demo_store(Demo::Sales)?);
    let client = Arc::new(ScriptedLlmClient::new([
        tagged(ALL_COLORS),
        revise("must select only the maximum"),
        tagged("SELECT color FROM sales; DROP TABLE sales"),
        tagged(TOP_COLOR),
    ]));

    let session = controller(store, client.clone())
        .run(Task::new("Best-selling color", ArtifactKind::Query))
        .await?;

    assert_eq!(session.outcome, SessionOutcome::Completed);
    assert_eq!(session.attempt_count(), 2);
    let retry = client.requests()[3].last_user_message().unwrap().to_string();
    assert!(retry.contains("rejected"));
    assert_eq!(session.usage.total(), 80);
    Ok(())
}

#[tokio::test]
async fn test_audit_trail_reconstructs_each_attempt() -> Result<()> {
    let store = Arc::new(demo_store(Demo::Shop)?);
    let program = r#"[
        {"op": "let", "name": "txn", "value": {"call": "next_id", "args": ["transactions", "TXN"]}},
        {"op": "insert", "table": "transactions", "values": {
            "transaction_id": {"var": "txn"}, "customer_name": "Ada", "summary": "Sold 1 Aviator",
            "amount": 80, "balance_after": 580}},
        {"op": "update", "table": "inventory", "where": [{"column": "item_id", "value": "SG001"}],
         "set": {"quantity_in_stock": 11}},
        {"op": "answer", "value": {"var": "txn"}}
    ]"#;
    let client = Arc::new(ScriptedLlmClient::new([tagged(program), accept()]));

    let session = controller(Arc::clone(&store), client)
        .with_capabilities(shop_caps())
        .run(Task::new("Sell one Aviator to Ada", ArtifactKind::Code))
        .await?;

    assert_eq!(session.outcome, SessionOutcome::Accepted);
    let CommitState::Committed { receipt } = &session.commit else {
        panic!("expected a commit, got {:?}", session.commit);
    };
    assert_eq!(receipt.attribution.session_id.as_deref(), Some(session.id.as_str()));
    assert_eq!(receipt.attribution.attempt, Some(1));
    assert_eq!(receipt.mutations, 2);

    let trail = session.audit_trail();
    let json = trail.to_json_pretty()?;
    let restored: reflector::domain::AuditTrail = serde_json::from_str(&json)?;
    assert!(restored.validated);
    assert_eq!(restored.attempts.len(), 1);
    assert_eq!(restored.attempts[0].side_effects.len(), 2);
    assert_eq!(restored.attempts[0].source, session.attempts[0].artifact.source);
    assert_eq!(restored.states.first(), Some(&LoopState::Init));
    assert_eq!(restored.states.last(), Some(&LoopState::Done));

    let ledger = store.read("SELECT transaction_id FROM transactions ORDER BY transaction_id")?;
    assert_eq!(ledger.rows, vec![vec![json!("TXN-0001")], vec![json!("TXN-0002")]]);
    Ok(())
}
