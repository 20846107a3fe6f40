//! Reflector - a generate → execute → reflect → refine loop
//!
//! A model writes an artifact (a query, a policy program or a report), a
//! capability-scoped sandbox runs it against a versioned store, a critic
//! judges the evidence and a refiner revises it. Every step is recorded in
//! an auditable session.

pub mod agent;
pub mod config;
pub mod domain;
pub mod error;
pub mod id;
pub mod llm;
pub mod runner;
pub mod sandbox;
pub mod store;
pub mod validation;

pub use error::{ReflectorError, Result};
