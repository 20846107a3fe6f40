//! Configuration for the `reflector` binary.
//!
//! Loaded from, in order: an explicit path, `.reflector.yml` in the current
//! directory, `~/.config/reflector/reflector.yml`, then defaults.

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::llm::AnthropicConfig;
use crate::runner::{LoopConfig, RefinePolicy};
use crate::sandbox::ResourceLimits;
use crate::validation::{DEFAULT_MIN_RATIO, DEFAULT_TRUSTED_DOMAINS, TrustedSourceValidator};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub llm: LlmConfig,
    #[serde(rename = "loop")]
    pub refine: RefineConfig,
    pub sandbox: SandboxConfig,
    pub store: StoreConfig,
    pub validation: ValidationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub model: String,
    pub max_tokens: u32,
    pub timeout_ms: u64,
    pub temperature: Option<f32>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            model: crate::llm::anthropic::DEFAULT_MODEL.to_string(),
            max_tokens: crate::llm::anthropic::DEFAULT_MAX_TOKENS,
            timeout_ms: 120_000,
            temperature: None,
        }
    }
}

impl LlmConfig {
    pub fn anthropic(&self) -> AnthropicConfig {
        AnthropicConfig {
            model: self.model.clone(),
            max_tokens: self.max_tokens,
            timeout: Duration::from_millis(self.timeout_ms),
            temperature: self.temperature,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyKind {
    OneShot,
    Bounded,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RefineConfig {
    pub policy: PolicyKind,
    /// Only used by the bounded policy
    pub max_attempts: u32,
    pub commit_final: bool,
}

impl Default for RefineConfig {
    fn default() -> Self {
        Self {
            policy: PolicyKind::OneShot,
            max_attempts: 3,
            commit_final: true,
        }
    }
}

impl RefineConfig {
    pub fn loop_config(&self) -> LoopConfig {
        let policy = match self.policy {
            PolicyKind::OneShot => RefinePolicy::OneShot,
            PolicyKind::Bounded => RefinePolicy::Bounded {
                max_attempts: self.max_attempts,
            },
        };
        LoopConfig {
            policy,
            commit_final: self.commit_final,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    pub timeout_ms: u64,
    pub max_steps: u64,
    pub max_mutations: usize,
    pub max_rows: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        let limits = ResourceLimits::default();
        Self {
            timeout_ms: limits.timeout.as_millis() as u64,
            max_steps: limits.max_steps,
            max_mutations: limits.max_mutations,
            max_rows: limits.max_rows,
        }
    }
}

impl SandboxConfig {
    pub fn limits(&self) -> ResourceLimits {
        ResourceLimits::default()
            .with_timeout(Duration::from_millis(self.timeout_ms))
            .with_max_steps(self.max_steps)
            .with_max_mutations(self.max_mutations)
            .with_max_rows(self.max_rows)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// SQLite file; an in-memory store is used when absent
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    pub trusted_domains: Vec<String>,
    pub min_trusted_ratio: f64,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            trusted_domains: DEFAULT_TRUSTED_DOMAINS.iter().map(|d| d.to_string()).collect(),
            min_trusted_ratio: DEFAULT_MIN_RATIO,
        }
    }
}

impl ValidationConfig {
    pub fn trusted_sources(&self) -> TrustedSourceValidator {
        TrustedSourceValidator::new(self.trusted_domains.clone(), self.min_trusted_ratio)
    }
}

impl Config {
    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        let project_name = env!("CARGO_PKG_NAME");
        let project_config = PathBuf::from(format!(".{}.yml", project_name));
        if project_config.exists() {
            match Self::load_from_file(&project_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    log::warn!("Failed to load config from {}: {}", project_config.display(), e);
                }
            }
        }

        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join(project_name).join(format!("{}.yml", project_name));
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        log::warn!("Failed to load config from {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        log::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;
        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;
        config.validate()?;

        log::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.refine.max_attempts == 0 {
            eyre::bail!("loop.max_attempts must be > 0");
        }
        if self.sandbox.timeout_ms == 0 {
            eyre::bail!("sandbox.timeout_ms must be > 0");
        }
        if self.llm.max_tokens == 0 {
            eyre::bail!("llm.max_tokens must be > 0");
        }
        if !(0.0..=1.0).contains(&self.validation.min_trusted_ratio) {
            eyre::bail!("validation.min_trusted_ratio must be within [0, 1]");
        }
        Ok(())
    }
}
