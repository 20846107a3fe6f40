use clap::Parser;
use colored::*;
use eyre::{Context, Result};
use log::info;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

mod cli;

use cli::Cli;
use cli::commands::{Commands, KindArg, StoreArgs};
use reflector::agent::StoreSchemaProvider;
use reflector::config::Config;
use reflector::domain::{Artifact, ArtifactKind, CommitState, ExecutionResult, Producer, Session, SessionOutcome, Task};
use reflector::llm::AnthropicClient;
use reflector::runner::LoopController;
use reflector::sandbox::{CapabilitySet, SandboxedExecutor};
use reflector::store::{Store, demo_store};
use reflector::validation::ExecutionStatusValidator;

fn setup_logging() -> Result<()> {
    let log_dir = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("reflector")
        .join("logs");

    fs::create_dir_all(&log_dir).context("Failed to create log directory")?;

    let log_file = log_dir.join("reflector.log");

    let target = Box::new(
        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_file)
            .context("Failed to open log file")?,
    );

    env_logger::Builder::from_default_env()
        .target(env_logger::Target::Pipe(target))
        .init();

    info!("Logging initialized, writing to: {}", log_file.display());
    Ok(())
}

fn open_store(args: &StoreArgs, config: &Config) -> Result<Arc<Store>> {
    let store = if let Some(demo) = args.demo {
        demo_store(demo.into()).context("Failed to seed demo store")?
    } else if let Some(path) = args.db.as_ref().or(config.store.path.as_ref()) {
        Store::open(path).context(format!("Failed to open store at {}", path.display()))?
    } else {
        Store::open_in_memory().context("Failed to open in-memory store")?
    };
    Ok(Arc::new(store))
}

fn capabilities(write: &[String]) -> CapabilitySet {
    write
        .iter()
        .fold(CapabilitySet::read_only(), |caps, table| caps.with_write(table))
}

fn status_line(result: &ExecutionResult) -> ColoredString {
    let line = format!("{} ({} ms, {} mutations)", result.status, result.duration_ms, result.side_effects.len());
    if result.succeeded() { line.green() } else { line.red() }
}

fn print_session(session: &Session) -> Result<()> {
    let outcome = session.outcome.as_str();
    let outcome = match &session.outcome {
        SessionOutcome::Accepted => outcome.green(),
        SessionOutcome::Completed => outcome.cyan(),
        SessionOutcome::DegradedFinal { reason } | SessionOutcome::GenerationFailed { reason } => {
            format!("{}: {}", outcome, reason).yellow()
        }
        SessionOutcome::Running => outcome.normal(),
    };
    eprintln!("{} {} {}", "Session".bold(), session.id, outcome);

    for attempt in &session.attempts {
        let verdict = attempt
            .feedback
            .as_ref()
            .map(|f| f.verdict.to_string())
            .unwrap_or_else(|| "-".to_string());
        eprintln!("  v{}: {} → {}", attempt.index, status_line(&attempt.execution), verdict);
    }

    match &session.commit {
        CommitState::Committed { receipt } => {
            eprintln!("  {} store version {}", "committed".green(), receipt.version)
        }
        CommitState::Conflict {
            expected_version,
            actual_version,
        } => eprintln!(
            "  {} expected version {}, store at {}",
            "conflict".red(),
            expected_version,
            actual_version
        ),
        CommitState::NothingToCommit => {}
        CommitState::Skipped { reason } => eprintln!("  {} {}", "not committed:".dimmed(), reason),
    }
    eprintln!("  tokens: {} in / {} out", session.usage.input_tokens, session.usage.output_tokens);

    let trail = session.audit_trail().to_json_pretty().context("Failed to serialize audit trail")?;
    println!("{}", trail);
    Ok(())
}

async fn handle_run_command(
    kind: KindArg,
    store_args: &StoreArgs,
    write: &[String],
    task: &str,
    config: &Config,
) -> Result<()> {
    let store = open_store(store_args, config)?;
    let client = AnthropicClient::new(config.llm.anthropic()).context("Failed to create model client")?;
    let kind = ArtifactKind::from(kind);

    let mut controller = LoopController::with_llm(SandboxedExecutor::new(Arc::clone(&store)), Arc::new(client))
        .with_capabilities(capabilities(write))
        .with_limits(config.sandbox.limits())
        .with_config(config.refine.loop_config())
        .with_validator(Arc::new(ExecutionStatusValidator));
    if kind == ArtifactKind::Text {
        controller = controller.with_validator(Arc::new(config.validation.trusted_sources()));
    }
    if !store.tables().context("Failed to list tables")?.is_empty() {
        controller = controller.with_context_provider(Arc::new(StoreSchemaProvider::new(Arc::clone(&store))));
    }

    info!("Running {} task: {}", kind, task);
    let session = controller.run(Task::new(task, kind)).await.context("Session failed")?;
    print_session(&session)?;

    if session.outcome.is_fatal() {
        eyre::bail!("no usable artifact was produced");
    }
    Ok(())
}

async fn handle_exec_command(
    kind: KindArg,
    file: &Path,
    store_args: &StoreArgs,
    write: &[String],
    commit: bool,
    config: &Config,
) -> Result<()> {
    let source = fs::read_to_string(file).context(format!("Failed to read {}", file.display()))?;
    let store = open_store(store_args, config)?;
    let executor = SandboxedExecutor::new(store);

    let id = file
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "exec".to_string());
    let artifact = Artifact::new(format!("{}-v1", id), kind.into(), source, 1, Producer::Generator);
    let caps = capabilities(write);
    let limits = config.sandbox.limits();

    let result = if commit {
        executor.execute(&artifact, &caps, &limits).await
    } else {
        executor.stage(&artifact, &caps, &limits).await
    }
    .context("Executor failed")?;

    eprintln!("{} {}", artifact.id.bold(), status_line(&result));
    if !result.trace.is_empty() {
        eprintln!("{}", result.trace.dimmed());
    }
    println!(
        "{}",
        serde_json::to_string_pretty(&result).context("Failed to serialize result")?
    );
    Ok(())
}

fn handle_schema_command(store_args: &StoreArgs, config: &Config) -> Result<()> {
    let store = open_store(store_args, config)?;
    let schema = store.describe(3).context("Failed to describe store")?;
    if schema.is_empty() {
        println!("{}", "Store has no tables".yellow());
    } else {
        print!("{}", schema);
    }
    Ok(())
}

async fn run_application(cli: &Cli, config: &Config) -> Result<()> {
    info!("Starting application");

    if cli.is_verbose() {
        eprintln!("{}", "Verbose mode enabled".yellow());
    }

    match &cli.command {
        Commands::Run {
            kind,
            store,
            write,
            task,
        } => handle_run_command(*kind, store, write, task, config).await,
        Commands::Exec {
            kind,
            file,
            store,
            write,
            commit,
        } => handle_exec_command(*kind, file, store, write, *commit, config).await,
        Commands::Schema { store } => handle_schema_command(store, config),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Setup logging first
    setup_logging().context("Failed to setup logging")?;

    let cli = Cli::parse();

    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;

    info!("Starting with config from: {:?}", cli.config);

    run_application(&cli, &config).await.context("Application failed")?;

    Ok(())
}
