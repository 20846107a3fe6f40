//! The model-backed roles of the loop: generator, refiner and critic.
//!
//! Each role is a trait so the controller can be driven by any
//! implementation; the `Llm*` types are the model-backed ones. Model text is
//! always passed through the strict parsers in [`parse`] before it becomes
//! an artifact or feedback.

pub mod context;
pub mod critic;
pub mod error;
pub mod evidence;
pub mod generator;
pub mod parse;
pub mod prompts;

pub use context::{ContextProvider, StaticContext, StoreSchemaProvider, gather_context};
pub use critic::{Critic, Critique, CritiqueInput, LlmCritic};
pub use error::AgentError;
pub use evidence::EvidenceFormatter;
pub use generator::{Draft, Generator, LlmGenerator, LlmRefiner, ModelOptions, RefineInput, Refiner};
pub use parse::{extract_artifact, parse_critique};
