//! ID generation utilities for Reflector
//!
//! Sessions get a random, time-ordered identifier. Artifacts are named after
//! their session and version so the audit trail reads naturally.

use rand::Rng;

/// Get current timestamp in milliseconds since Unix epoch
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Generate a unique session ID
///
/// Format: `ses-{timestamp_ms}-{random_hex}`
/// Example: `ses-1738300800123-a1b2`
pub fn generate_session_id() -> String {
    let timestamp = now_ms();
    let random: u16 = rand::rng().random();
    format!("ses-{}-{:04x}", timestamp, random)
}

/// Generate the ID of an artifact version within a session
///
/// Format: `{session_id}-v{version}`
/// Example: For session "ses-1-a1b2" and version 2: "ses-1-a1b2-v2"
pub fn artifact_id(session_id: &str, version: u32) -> String {
    format!("{}-v{}", session_id, version)
}

/// Generate a ticket identifying one store transaction
pub fn generate_ticket() -> u64 {
    rand::rng().random()
}
