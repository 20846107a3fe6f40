//! Capability sets, resource limits, and the meter that enforces them.

use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use super::fault::Fault;

/// The complete set of things an artifact may touch.
///
/// Filesystem, network, process and environment access have no representation
/// here: they can never be granted.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CapabilitySet {
    /// May read any declared table
    pub read_store: bool,
    /// Tables the artifact may insert into, update, or delete from
    pub write_tables: BTreeSet<String>,
}

impl CapabilitySet {
    /// Nothing at all. Enough for text artifacts.
    pub fn none() -> Self {
        Self::default()
    }

    /// Read access to every table.
    pub fn read_only() -> Self {
        Self {
            read_store: true,
            write_tables: BTreeSet::new(),
        }
    }

    /// Grant writes to one table (builder style).
    pub fn with_write(mut self, table: impl Into<String>) -> Self {
        self.write_tables.insert(table.into());
        self
    }

    pub fn can_read(&self) -> bool {
        self.read_store
    }

    /// Table names compare case-insensitively, as in SQLite.
    pub fn can_write(&self, table: &str) -> bool {
        self.write_tables.iter().any(|t| t.eq_ignore_ascii_case(table))
    }

    pub fn check_read(&self, what: &str) -> Result<(), Fault> {
        if self.read_store {
            Ok(())
        } else {
            Err(Fault::capability(format!("{} requires store read access, which was not granted", what)))
        }
    }

    pub fn check_write(&self, table: &str) -> Result<(), Fault> {
        if self.can_write(table) {
            Ok(())
        } else {
            Err(Fault::capability(format!("write to table '{}' is not granted", table)))
        }
    }

    /// Human-readable summary for prompts and logs.
    pub fn describe(&self) -> String {
        let read = if self.read_store { "read store" } else { "no store reads" };
        if self.write_tables.is_empty() {
            format!("{}; no writes; no filesystem, network or environment", read)
        } else {
            let tables: Vec<&str> = self.write_tables.iter().map(String::as_str).collect();
            format!(
                "{}; write tables [{}]; no filesystem, network or environment",
                read,
                tables.join(", ")
            )
        }
    }
}

/// Budgets for one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceLimits {
    /// Wall-clock budget for the whole call, waiting for the store included
    pub timeout: Duration,
    /// Interpreter steps (operations plus function calls)
    pub max_steps: u64,
    /// Row mutations
    pub max_mutations: usize,
    /// Rows materialised by a single read or query
    pub max_rows: usize,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(5000),
            max_steps: 100_000,
            max_mutations: 1000,
            max_rows: 10_000,
        }
    }
}

impl ResourceLimits {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_steps(mut self, max_steps: u64) -> Self {
        self.max_steps = max_steps;
        self
    }

    pub fn with_max_mutations(mut self, max_mutations: usize) -> Self {
        self.max_mutations = max_mutations;
        self
    }

    pub fn with_max_rows(mut self, max_rows: usize) -> Self {
        self.max_rows = max_rows;
        self
    }
}

/// Tracks consumption against `ResourceLimits` during one execution.
#[derive(Debug)]
pub struct Meter {
    limits: ResourceLimits,
    deadline: Instant,
    steps: u64,
    mutations: usize,
}

impl Meter {
    pub fn start(limits: &ResourceLimits) -> Self {
        Self::until(limits, Instant::now() + limits.timeout)
    }

    /// Meter against a deadline fixed by the caller.
    pub fn until(limits: &ResourceLimits, deadline: Instant) -> Self {
        Self {
            limits: *limits,
            deadline,
            steps: 0,
            mutations: 0,
        }
    }

    /// Charge one step and check the clock.
    pub fn step(&mut self) -> Result<(), Fault> {
        self.steps += 1;
        if self.steps > self.limits.max_steps {
            return Err(Fault::timeout(format!(
                "step budget of {} exhausted",
                self.limits.max_steps
            )));
        }
        self.check_deadline()
    }

    pub fn check_deadline(&self) -> Result<(), Fault> {
        if Instant::now() >= self.deadline {
            Err(Fault::timeout(format!(
                "wall-clock budget of {}ms exhausted",
                self.limits.timeout.as_millis()
            )))
        } else {
            Ok(())
        }
    }

    pub fn record_mutations(&mut self, count: usize) -> Result<(), Fault> {
        self.mutations += count;
        self.check_mutations(self.mutations)
    }

    pub fn check_mutations(&self, count: usize) -> Result<(), Fault> {
        if count > self.limits.max_mutations {
            Err(Fault::capability(format!(
                "mutation budget of {} exceeded ({} mutations)",
                self.limits.max_mutations, count
            )))
        } else {
            Ok(())
        }
    }

    pub fn check_rows(&self, count: usize) -> Result<(), Fault> {
        if count > self.limits.max_rows {
            Err(Fault::capability(format!(
                "row budget of {} exceeded ({} rows)",
                self.limits.max_rows, count
            )))
        } else {
            Ok(())
        }
    }

    pub fn max_rows(&self) -> usize {
        self.limits.max_rows
    }

    pub fn steps(&self) -> u64 {
        self.steps
    }
}
