//! Sandboxed execution of generated artifacts.
//!
//! Artifacts run against an explicit `CapabilitySet`; there is no ambient
//! state to reach. Policy programs go through a closed interpreter, queries
//! through a lexical linter, and text is evaluated without touching the
//! store at all. Every run happens inside one store transaction that is
//! committed only on success.

mod capability;
mod executor;
mod fault;
mod interpreter;
mod program;
mod query;
mod text;

pub use capability::{CapabilitySet, Meter, ResourceLimits};
pub use executor::SandboxedExecutor;
pub use fault::{Fault, MalformedArtifact};
pub use interpreter::Interpreter;
pub use program::{Condition, Expr, Op, PURE_FUNCTIONS, Program, STORE_FUNCTIONS};
pub use query::{LintError, QueryClass, Statement, lint};
pub use text::{evaluate as evaluate_text, extract_sources};

use crate::domain::ArtifactKind;

/// Check that source is structurally valid for its kind.
///
/// Well-formed is not the same as allowed: a query that writes a file parses
/// fine here and is refused by the executor as a capability violation.
pub fn check_well_formed(kind: ArtifactKind, source: &str) -> Result<(), MalformedArtifact> {
    match kind {
        ArtifactKind::Query => match query::lint(source) {
            Ok(_) | Err(LintError::Forbidden(_)) => Ok(()),
            Err(LintError::Malformed(m)) => Err(m),
        },
        ArtifactKind::Code => Program::parse(source).map(|_| ()),
        ArtifactKind::Text => text::check(source),
    }
}
