//! CLI module for reflector - command-line interface and subcommands.
//!
//! Provides the main entry point with subcommands for running sessions,
//! executing single artifacts and inspecting the store schema.

pub mod commands;

pub use commands::Cli;
