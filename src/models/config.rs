//! Configuration models for pipeguard.
//!
//! Every tunable of the guard layer lives here. Values come from a TOML
//! file; anything omitted falls back to the documented defaults.

use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration for pipeguard.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Pipeline identity and checkpoint location
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Retry defaults for wrapped operations
    #[serde(default)]
    pub retry: RetryPolicy,

    /// Circuit breaker defaults
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    /// Staged commit settings
    #[serde(default)]
    pub transaction: TransactionConfig,

    /// Local object store settings
    #[serde(default)]
    pub storage: StorageConfig,
}

/// Pipeline identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Pipeline name, selects the checkpoint namespace
    #[serde(default = "default_pipeline_name")]
    pub name: String,

    /// Directory holding `<name>_checkpoint.db`
    #[serde(default = "default_checkpoint_dir")]
    pub checkpoint_dir: PathBuf,
}

fn default_pipeline_name() -> String {
    "ingest".to_string()
}

fn default_checkpoint_dir() -> PathBuf {
    PathBuf::from(".checkpoints")
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            name: default_pipeline_name(),
            checkpoint_dir: default_checkpoint_dir(),
        }
    }
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the circuit opens
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// How long the circuit stays open before a trial call
    #[serde(default = "default_circuit_timeout")]
    pub timeout_secs: u64,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_circuit_timeout() -> u64 {
    60
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            timeout_secs: default_circuit_timeout(),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Transaction manager configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionConfig {
    /// Namespace for staged objects: `<prefix>/<transaction_id>/<target_key>`
    #[serde(default = "default_staging_prefix")]
    pub staging_prefix: String,

    /// Delete newly created targets again when a commit fails part way
    #[serde(default = "default_true")]
    pub compensate_partial_commit: bool,

    /// Staged objects of transactions younger than this are never swept
    #[serde(default = "default_orphan_min_age_secs")]
    pub orphan_min_age_secs: u64,
}

fn default_staging_prefix() -> String {
    "staging".to_string()
}

fn default_true() -> bool {
    true
}

fn default_orphan_min_age_secs() -> u64 {
    24 * 60 * 60
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            staging_prefix: default_staging_prefix(),
            compensate_partial_commit: true,
            orphan_min_age_secs: default_orphan_min_age_secs(),
        }
    }
}

impl TransactionConfig {
    pub fn orphan_min_age(&self) -> Duration {
        Duration::from_secs(self.orphan_min_age_secs)
    }
}

/// Local object store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root directory of the directory-backed object store
    #[serde(default = "default_storage_root")]
    pub root: PathBuf,
}

fn default_storage_root() -> PathBuf {
    PathBuf::from("data/objects")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: default_storage_root(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file and validate it.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
            path: path.to_owned(),
            source: e,
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_owned(),
            source: e,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_pipeline_name(&self.pipeline.name)?;
        self.retry.validate()?;

        if self.circuit_breaker.failure_threshold == 0 {
            return Err(ConfigError::Invalid(
                "circuit_breaker.failure_threshold must be at least 1".to_string(),
            ));
        }
        if self.transaction.staging_prefix.trim_matches('/').is_empty() {
            return Err(ConfigError::MissingStagingPrefix);
        }
        Ok(())
    }

    /// Checkpoint directory with `${VAR}` placeholders expanded.
    pub fn checkpoint_dir(&self) -> PathBuf {
        expand_path(&self.pipeline.checkpoint_dir)
    }

    /// Object store root with `${VAR}` placeholders expanded.
    pub fn storage_root(&self) -> PathBuf {
        expand_path(&self.storage.root)
    }
}

/// Check that a pipeline name is usable as a checkpoint namespace.
///
/// The name becomes part of a file name, so only ASCII alphanumerics,
/// `-` and `_` are accepted.
pub fn validate_pipeline_name(name: &str) -> Result<(), ConfigError> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(ConfigError::InvalidPipelineName(name.to_string()))
    }
}

/// Expand environment variables in a string.
///
/// Supports ${VAR_NAME} syntax.
/// If the variable is not set, the placeholder is left unchanged.
pub fn expand_env_vars(s: &str) -> String {
    let mut result = s.to_string();
    let Ok(re) = regex::Regex::new(r"\$\{([^}]+)\}") else {
        return result;
    };

    for cap in re.captures_iter(s) {
        let var_name = &cap[1];
        if let Ok(value) = std::env::var(var_name) {
            result = result.replace(&cap[0], &value);
        }
    }

    result
}

fn expand_path(path: &Path) -> PathBuf {
    PathBuf::from(expand_env_vars(&path.to_string_lossy()))
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Invalid pipeline name '{0}': use ASCII letters, digits, '-' or '_'")]
    InvalidPipelineName(String),

    #[error("Missing staging prefix: transaction.staging_prefix must not be empty")]
    MissingStagingPrefix,

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
