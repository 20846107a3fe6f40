//! CLI command definitions using clap.
//!
//! Defines the main CLI structure and subcommands:
//! - run: full generate/execute/reflect/refine session
//! - exec: run one artifact file through the sandbox
//! - schema: print the context block given to the generator

use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use reflector::domain::ArtifactKind;
use reflector::store::Demo;

/// Reflector - generate, execute, reflect and refine artifacts against a sandboxed store
#[derive(Parser, Debug)]
#[command(name = "reflector")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Optional config file path
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Check if verbose mode is enabled
    pub fn is_verbose(&self) -> bool {
        self.verbose
    }
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum KindArg {
    Query,
    Code,
    Text,
}

impl From<KindArg> for ArtifactKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Query => ArtifactKind::Query,
            KindArg::Code => ArtifactKind::Code,
            KindArg::Text => ArtifactKind::Text,
        }
    }
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DemoArg {
    Sales,
    Shop,
}

impl From<DemoArg> for Demo {
    fn from(demo: DemoArg) -> Self {
        match demo {
            DemoArg::Sales => Demo::Sales,
            DemoArg::Shop => Demo::Shop,
        }
    }
}

/// Which store to open.
#[derive(Args, Debug, Clone)]
pub struct StoreArgs {
    /// Load a bundled demo dataset into an in-memory store
    #[arg(long, value_enum, conflicts_with = "db")]
    pub demo: Option<DemoArg>,

    /// SQLite file to open (overrides store.path)
    #[arg(long)]
    pub db: Option<PathBuf>,
}

/// Main subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a full session for a task and print its audit trail
    Run {
        /// Kind of artifact to produce
        #[arg(short, long, value_enum)]
        kind: KindArg,

        #[command(flatten)]
        store: StoreArgs,

        /// Grant write access to a table (repeatable)
        #[arg(short, long = "write")]
        write: Vec<String>,

        /// Task description
        task: String,
    },

    /// Execute one artifact file in the sandbox, without any model
    Exec {
        /// Kind of artifact in the file
        #[arg(short, long, value_enum)]
        kind: KindArg,

        /// Artifact source file
        #[arg(short, long)]
        file: PathBuf,

        #[command(flatten)]
        store: StoreArgs,

        /// Grant write access to a table (repeatable)
        #[arg(short, long = "write")]
        write: Vec<String>,

        /// Commit mutations on success instead of only staging them
        #[arg(long)]
        commit: bool,
    },

    /// Print the schema block given to the generator
    Schema {
        #[command(flatten)]
        store: StoreArgs,
    },
}
