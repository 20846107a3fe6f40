//! Artifacts - the versioned units of work produced by the generator and refiner.
//!
//! An artifact is immutable once created. Refinement produces a new artifact
//! with the next version number; nothing ever edits one in place.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// What kind of source an artifact carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    /// A policy program run by the sandbox interpreter
    Code,
    /// A single SQL statement run against the store
    Query,
    /// Free text (reports, summaries)
    Text,
}

impl ArtifactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::Code => "code",
            ArtifactKind::Query => "query",
            ArtifactKind::Text => "text",
        }
    }

    /// Parse from a CLI/config string.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "code" | "policy" => Some(ArtifactKind::Code),
            "query" | "sql" => Some(ArtifactKind::Query),
            "text" | "report" => Some(ArtifactKind::Text),
            _ => None,
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which component produced an artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Producer {
    Generator,
    Refiner,
}

/// A generated, versioned unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    /// Unique ID (`{session}-v{version}`)
    pub id: String,
    pub kind: ArtifactKind,
    /// Source text exactly as it will be executed
    pub source: String,
    /// 1 for the generated artifact, incremented by each refinement
    pub version: u32,
    pub produced_by: Producer,
    /// SHA-256 of the source, hex encoded
    pub digest: String,
}

impl Artifact {
    /// Create a new artifact. The digest is derived from the source.
    pub fn new(
        id: impl Into<String>,
        kind: ArtifactKind,
        source: impl Into<String>,
        version: u32,
        produced_by: Producer,
    ) -> Self {
        let source = source.into();
        let digest = digest_source(&source);
        Self {
            id: id.into(),
            kind,
            source,
            version,
            produced_by,
            digest,
        }
    }

    /// Whether another artifact carries byte-identical source.
    pub fn same_source(&self, other: &Artifact) -> bool {
        self.digest == other.digest
    }
}

/// Hex-encoded SHA-256 digest of artifact source.
pub fn digest_source(source: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source.as_bytes());
    hex::encode(hasher.finalize())
}
