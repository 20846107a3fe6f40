//! Trusted-source ratio check for report artifacts.
//!
//! A report passes when at least `min_ratio` of the distinct URLs it cites
//! belong to a trusted domain. A report citing nothing fails.

use async_trait::async_trait;

use super::traits::{DomainValidator, ValidationResult};
use crate::domain::{Artifact, ExecutionResult};
use crate::error::Result;
use crate::sandbox::extract_sources;

/// Domains trusted by default. An entry matches the host itself and any
/// subdomain, so `edu` matches every `.edu` host.
pub const DEFAULT_TRUSTED_DOMAINS: &[&str] = &[
    "arxiv.org",
    "nature.com",
    "science.org",
    "springer.com",
    "sciencedirect.com",
    "ieee.org",
    "acm.org",
    "aps.org",
    "iop.org",
    "nih.gov",
    "nasa.gov",
    "edu",
    "gov",
];

pub const DEFAULT_MIN_RATIO: f64 = 0.5;

pub struct TrustedSourceValidator {
    domains: Vec<String>,
    min_ratio: f64,
}

impl TrustedSourceValidator {
    pub fn new(domains: Vec<String>, min_ratio: f64) -> Self {
        Self {
            domains: domains.into_iter().map(|d| d.trim().trim_start_matches('.').to_lowercase()).collect(),
            min_ratio,
        }
    }

    pub fn is_trusted(&self, url: &str) -> bool {
        let Some(host) = host_of(url) else {
            return false;
        };
        self.domains
            .iter()
            .any(|d| host == *d || host.ends_with(&format!(".{}", d)))
    }

    /// Sources cited by an executed report: the evaluated output when present,
    /// otherwise the URLs in the source text.
    fn sources(artifact: &Artifact, execution: &ExecutionResult) -> Vec<String> {
        let evaluated = execution
            .output
            .as_value()
            .and_then(|v| v.get("sources"))
            .and_then(|v| v.as_array())
            .map(|urls| {
                urls.iter()
                    .filter_map(|u| u.as_str().map(str::to_string))
                    .collect::<Vec<_>>()
            });
        evaluated.unwrap_or_else(|| extract_sources(&artifact.source))
    }
}

impl Default for TrustedSourceValidator {
    fn default() -> Self {
        Self::new(
            DEFAULT_TRUSTED_DOMAINS.iter().map(|d| d.to_string()).collect(),
            DEFAULT_MIN_RATIO,
        )
    }
}

#[async_trait]
impl DomainValidator for TrustedSourceValidator {
    fn name(&self) -> &str {
        "trusted_sources"
    }

    async fn validate(&self, artifact: &Artifact, execution: &ExecutionResult) -> Result<ValidationResult> {
        let sources = Self::sources(artifact, execution);
        if sources.is_empty() {
            return Ok(ValidationResult::fail(
                "the report cites no sources; cite trusted sources with full URLs",
            ));
        }

        let (trusted, untrusted): (Vec<&String>, Vec<&String>) = sources.iter().partition(|u| self.is_trusted(u));
        let ratio = trusted.len() as f64 / sources.len() as f64;
        let summary = format!(
            "{}/{} sources trusted (ratio {:.2}, minimum {:.2})",
            trusted.len(),
            sources.len(),
            ratio,
            self.min_ratio
        );

        if ratio >= self.min_ratio {
            return Ok(ValidationResult::pass_with_output(summary));
        }

        let mut result = ValidationResult::fail(format!(
            "trusted-source ratio {:.2} is below {:.2}; replace weak sources with peer-reviewed or institutional ones",
            ratio, self.min_ratio
        ));
        for url in untrusted {
            result.add_error(format!("untrusted source: {}", url));
        }
        Ok(result)
    }
}

/// Lowercase host of an http(s) URL, without `www.` or a port.
fn host_of(url: &str) -> Option<String> {
    let rest = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))?;
    let host = rest.split(['/', '?', '#']).next()?;
    let host = host.rsplit('@').next()?;
    let host = host.split(':').next()?.to_lowercase();
    let host = host.strip_prefix("www.").map(str::to_string).unwrap_or(host);
    if host.is_empty() { None } else { Some(host) }
}
