//! Loop controller module - the generate → execute → reflect → refine state machine.
//!
//! This module provides:
//! - LoopController for running one task to a terminal session
//! - RefinePolicy for choosing between the one-shot and bounded loops
//! - LoopConfig for policy and commit settings

mod controller;

pub use controller::{LoopConfig, LoopController, RefinePolicy};
