//! Configuration for the concurrency core.
//!
//! # Configuration Precedence
//!
//! [`ConcurrencyBuilder`](crate::ConcurrencyBuilder) applies sources in the
//! order they are called, so the usual chain gives this precedence (highest
//! first):
//!
//! 1. **Programmatic**: builder methods called last (`max_concurrency(4)`)
//! 2. **Environment variables**: `PIPELINE_*`
//! 3. **Config file**: a TOML file (requires the `config-file` feature)
//! 4. **Defaults**: [`ConcurrencyConfig::default()`]
//!
//! # Supported Environment Variables
//!
//! | Variable | Type | Maps to |
//! |----------|------|---------|
//! | `PIPELINE_MAX_CONCURRENCY` | `usize` | `max_concurrency` |
//! | `PIPELINE_THREAD_NAME_PREFIX` | `String` | `thread_name_prefix` |
//! | `PIPELINE_DEFAULT_RESOURCE` | `String` | `default_resource` |
//! | `PIPELINE_STALL_THRESHOLD_MS` | `u64` | `stall_threshold` |
//! | `PIPELINE_PROGRESS_INTERVAL_MS` | `u64` | `progress_interval` |
//! | `PIPELINE_RESIZE_POLICY` | `migrate\|replace\|reject` | `resize_policy` |

use crate::resource::ResizePolicy;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::time::Duration;

/// Environment variable name for the maximum concurrency.
pub const ENV_MAX_CONCURRENCY: &str = "PIPELINE_MAX_CONCURRENCY";
/// Environment variable name for the worker thread name prefix.
pub const ENV_THREAD_NAME_PREFIX: &str = "PIPELINE_THREAD_NAME_PREFIX";
/// Environment variable name for the default resource kind.
pub const ENV_DEFAULT_RESOURCE: &str = "PIPELINE_DEFAULT_RESOURCE";
/// Environment variable name for the acquire stall threshold, in milliseconds.
pub const ENV_STALL_THRESHOLD_MS: &str = "PIPELINE_STALL_THRESHOLD_MS";
/// Environment variable name for the cohort progress interval, in milliseconds.
pub const ENV_PROGRESS_INTERVAL_MS: &str = "PIPELINE_PROGRESS_INTERVAL_MS";
/// Environment variable name for the resize policy.
pub const ENV_RESIZE_POLICY: &str = "PIPELINE_RESIZE_POLICY";

/// Name of the resource kind sized to the maximum concurrency.
pub const DEFAULT_RESOURCE: &str = "threads";
/// Acquire waits longer than this are logged as stalls.
pub const DEFAULT_STALL_THRESHOLD: Duration = Duration::from_secs(1);
/// How often a blocked `execute` logs progress.
pub const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_secs(5);

const FALLBACK_CONCURRENCY: usize = 4;

/// Errors raised while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// An environment variable is set to something unparseable.
    #[error("invalid value for {var}: expected {expected}, got {value:?}")]
    InvalidEnv {
        /// The variable name.
        var: &'static str,
        /// What was expected.
        expected: &'static str,
        /// The raw value found.
        value: String,
    },
    /// A config file could not be read.
    #[error("failed to read config file {}: {source}", .path.display())]
    Read {
        /// The file path.
        path: PathBuf,
        /// The I/O error.
        source: std::io::Error,
    },
    /// A config file is not valid TOML or has the wrong shape.
    #[error("failed to parse TOML config: {0}")]
    Parse(String),
    /// A value is out of range.
    #[error("{0}")]
    Invalid(String),
}

impl From<ConfigError> for crate::Error {
    fn from(err: ConfigError) -> Self {
        Self::invalid_config(err.to_string()).with_source(err)
    }
}

/// Settings for a [`Concurrency`](crate::Concurrency) instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConcurrencyConfig {
    /// Core worker thread count and capacity of the default resource kind.
    pub max_concurrency: usize,
    /// Prefix for worker thread names.
    pub thread_name_prefix: String,
    /// Resource kind registered with `max_concurrency` permits at startup.
    pub default_resource: String,
    /// Acquire waits longer than this are logged as stalls.
    pub stall_threshold: Duration,
    /// How often a blocked `execute` logs progress.
    pub progress_interval: Duration,
    /// What `set_limit` does to an existing resource kind.
    pub resize_policy: ResizePolicy,
    /// Extra resource kinds registered at startup, as `(name, capacity)`.
    pub initial_limits: Vec<(String, usize)>,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            max_concurrency: std::thread::available_parallelism()
                .map_or(FALLBACK_CONCURRENCY, NonZeroUsize::get),
            thread_name_prefix: "pipeline".to_string(),
            default_resource: DEFAULT_RESOURCE.to_string(),
            stall_threshold: DEFAULT_STALL_THRESHOLD,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
            resize_policy: ResizePolicy::default(),
            initial_limits: Vec::new(),
        }
    }
}

impl ConcurrencyConfig {
    /// Defaults with the given maximum concurrency.
    #[must_use]
    pub fn with_max_concurrency(max_concurrency: usize) -> Self {
        Self {
            max_concurrency,
            ..Self::default()
        }
    }

    /// Defaults with environment overrides applied.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        apply_env_overrides(&mut config)?;
        Ok(config)
    }

    /// Checks that every value is usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrency == 0 {
            return Err(ConfigError::Invalid(
                "max_concurrency must be at least 1".to_string(),
            ));
        }
        if self.progress_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "progress_interval must be non-zero".to_string(),
            ));
        }
        if self.stall_threshold.is_zero() {
            return Err(ConfigError::Invalid(
                "stall_threshold must be non-zero".to_string(),
            ));
        }
        if self.default_resource.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "default_resource must not be empty".to_string(),
            ));
        }
        if let Some((name, _)) = self
            .initial_limits
            .iter()
            .find(|(name, _)| name.trim().is_empty())
        {
            return Err(ConfigError::Invalid(format!(
                "resource name {name:?} must not be empty"
            )));
        }
        Ok(())
    }
}

/// Apply environment variable overrides to a [`ConcurrencyConfig`].
///
/// Only variables that are set are applied. A set but unparseable variable is
/// an error naming the variable and the value.
pub fn apply_env_overrides(config: &mut ConcurrencyConfig) -> Result<(), ConfigError> {
    if let Some(val) = read_env(ENV_MAX_CONCURRENCY) {
        config.max_concurrency = parse_usize(ENV_MAX_CONCURRENCY, &val)?;
    }
    if let Some(val) = read_env(ENV_THREAD_NAME_PREFIX) {
        config.thread_name_prefix = val;
    }
    if let Some(val) = read_env(ENV_DEFAULT_RESOURCE) {
        config.default_resource = val;
    }
    if let Some(val) = read_env(ENV_STALL_THRESHOLD_MS) {
        config.stall_threshold = parse_millis(ENV_STALL_THRESHOLD_MS, &val)?;
    }
    if let Some(val) = read_env(ENV_PROGRESS_INTERVAL_MS) {
        config.progress_interval = parse_millis(ENV_PROGRESS_INTERVAL_MS, &val)?;
    }
    if let Some(val) = read_env(ENV_RESIZE_POLICY) {
        config.resize_policy = val.parse().map_err(|()| ConfigError::InvalidEnv {
            var: ENV_RESIZE_POLICY,
            expected: "one of migrate, replace, reject",
            value: val.clone(),
        })?;
    }
    Ok(())
}

fn read_env(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

fn parse_usize(var: &'static str, val: &str) -> Result<usize, ConfigError> {
    val.trim()
        .parse::<usize>()
        .map_err(|_| ConfigError::InvalidEnv {
            var,
            expected: "unsigned integer",
            value: val.to_string(),
        })
}

fn parse_millis(var: &'static str, val: &str) -> Result<Duration, ConfigError> {
    val.trim()
        .parse::<u64>()
        .map(Duration::from_millis)
        .map_err(|_| ConfigError::InvalidEnv {
            var,
            expected: "milliseconds as unsigned integer",
            value: val.to_string(),
        })
}

// =========================================================================
// TOML config file support (feature-gated)
// =========================================================================

/// TOML-deserializable configuration.
///
/// ```toml
/// [concurrency]
/// max_concurrency = 8
/// thread_name_prefix = "etl"
/// default_resource = "threads"
/// stall_threshold_ms = 1000
/// progress_interval_ms = 5000
/// resize_policy = "migrate"
///
/// [resources]
/// memory = 64
/// gpu = 2
/// ```
#[cfg(feature = "config-file")]
#[derive(serde::Deserialize, Default, Debug)]
pub struct ConcurrencyTomlConfig {
    /// Core settings.
    #[serde(default)]
    pub concurrency: ConcurrencyToml,
    /// Resource kinds to register at startup.
    #[serde(default)]
    pub resources: std::collections::BTreeMap<String, usize>,
}

/// `[concurrency]` section of the TOML config.
#[cfg(feature = "config-file")]
#[derive(serde::Deserialize, Default, Debug)]
pub struct ConcurrencyToml {
    /// Maximum concurrency.
    pub max_concurrency: Option<usize>,
    /// Worker thread name prefix.
    pub thread_name_prefix: Option<String>,
    /// Default resource kind name.
    pub default_resource: Option<String>,
    /// Stall threshold in milliseconds.
    pub stall_threshold_ms: Option<u64>,
    /// Progress interval in milliseconds.
    pub progress_interval_ms: Option<u64>,
    /// Resize policy.
    pub resize_policy: Option<ResizePolicy>,
}

/// Apply a parsed TOML config. Only fields present in the file override.
#[cfg(feature = "config-file")]
pub fn apply_toml_config(config: &mut ConcurrencyConfig, toml: &ConcurrencyTomlConfig) {
    let section = &toml.concurrency;
    if let Some(v) = section.max_concurrency {
        config.max_concurrency = v;
    }
    if let Some(ref v) = section.thread_name_prefix {
        config.thread_name_prefix.clone_from(v);
    }
    if let Some(ref v) = section.default_resource {
        config.default_resource.clone_from(v);
    }
    if let Some(v) = section.stall_threshold_ms {
        config.stall_threshold = Duration::from_millis(v);
    }
    if let Some(v) = section.progress_interval_ms {
        config.progress_interval = Duration::from_millis(v);
    }
    if let Some(v) = section.resize_policy {
        config.resize_policy = v;
    }
    for (name, capacity) in &toml.resources {
        config.initial_limits.retain(|(n, _)| n != name);
        config.initial_limits.push((name.clone(), *capacity));
    }
}

/// Parse a TOML string.
#[cfg(feature = "config-file")]
pub fn parse_toml_str(toml_str: &str) -> Result<ConcurrencyTomlConfig, ConfigError> {
    toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))
}

/// Read and parse a TOML file.
#[cfg(feature = "config-file")]
pub fn parse_toml_file(path: &std::path::Path) -> Result<ConcurrencyTomlConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    parse_toml_str(&content)
}
