//! Domain validators for the bounded refine policy.
//!
//! Validators inspect an executed artifact after the critic accepted it and
//! can send the loop back for another revision with targeted issues.

pub mod composite;
pub mod status;
pub mod traits;
pub mod trusted_sources;

pub use composite::CompositeValidator;
pub use status::ExecutionStatusValidator;
pub use traits::{DomainValidator, ValidationResult};
pub use trusted_sources::{DEFAULT_MIN_RATIO, DEFAULT_TRUSTED_DOMAINS, TrustedSourceValidator};
