//! Builder for [`Concurrency`].

use crate::concurrency::Concurrency;
use crate::config::{self, ConcurrencyConfig};
use crate::error::Result;
use crate::resource::ResizePolicy;
use std::sync::Arc;
use std::time::Duration;

/// Builder for constructing a [`Concurrency`] with custom configuration.
///
/// Sources are applied in call order, so later calls win:
///
/// ```ignore
/// let core = Concurrency::builder()
///     .from_toml("pipeline.toml")?
///     .with_env_overrides()?
///     .max_concurrency(8)
///     .build()?;
/// ```
#[derive(Clone, Default)]
pub struct ConcurrencyBuilder {
    config: ConcurrencyConfig,
    on_thread_start: Option<Arc<dyn Fn() + Send + Sync>>,
    on_thread_stop: Option<Arc<dyn Fn() + Send + Sync>>,
}

impl std::fmt::Debug for ConcurrencyBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConcurrencyBuilder")
            .field("config", &self.config)
            .field("on_thread_start", &self.on_thread_start.is_some())
            .field("on_thread_stop", &self.on_thread_stop.is_some())
            .finish()
    }
}

impl ConcurrencyBuilder {
    /// Create a new builder with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing configuration.
    #[must_use]
    pub fn from_config(config: ConcurrencyConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    /// Set the core thread count and the capacity of the default resource kind.
    #[must_use]
    pub fn max_concurrency(mut self, n: usize) -> Self {
        self.config.max_concurrency = n;
        self
    }

    /// Set the worker thread name prefix.
    #[must_use]
    pub fn thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.thread_name_prefix = prefix.into();
        self
    }

    /// Set the name of the resource kind sized to `max_concurrency`.
    #[must_use]
    pub fn default_resource(mut self, name: impl Into<String>) -> Self {
        self.config.default_resource = name.into();
        self
    }

    /// Acquire waits longer than this are logged as stalls.
    #[must_use]
    pub fn stall_threshold(mut self, threshold: Duration) -> Self {
        self.config.stall_threshold = threshold;
        self
    }

    /// How often a blocked `execute` logs progress.
    #[must_use]
    pub fn progress_interval(mut self, interval: Duration) -> Self {
        self.config.progress_interval = interval;
        self
    }

    /// What `set_limit` does to an existing resource kind.
    #[must_use]
    pub fn resize_policy(mut self, policy: ResizePolicy) -> Self {
        self.config.resize_policy = policy;
        self
    }

    /// Register an extra resource kind at build time.
    ///
    /// Calling this again for the same name replaces the earlier capacity.
    #[must_use]
    pub fn resource(mut self, name: impl Into<String>, capacity: usize) -> Self {
        let name = name.into();
        self.config.initial_limits.retain(|(n, _)| *n != name);
        self.config.initial_limits.push((name, capacity));
        self
    }

    /// Register a callback to run when a worker thread starts.
    #[must_use]
    pub fn on_thread_start<F>(mut self, f: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_thread_start = Some(Arc::new(f));
        self
    }

    /// Register a callback to run when a worker thread stops.
    #[must_use]
    pub fn on_thread_stop<F>(mut self, f: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_thread_stop = Some(Arc::new(f));
        self
    }

    /// Apply `PIPELINE_*` environment variables on top of the current settings.
    pub fn with_env_overrides(mut self) -> Result<Self> {
        config::apply_env_overrides(&mut self.config)?;
        Ok(self)
    }

    /// Apply a TOML config file on top of the current settings.
    #[cfg(feature = "config-file")]
    pub fn from_toml(mut self, path: impl AsRef<std::path::Path>) -> Result<Self> {
        let parsed = config::parse_toml_file(path.as_ref())?;
        config::apply_toml_config(&mut self.config, &parsed);
        Ok(self)
    }

    /// Apply TOML text on top of the current settings.
    #[cfg(feature = "config-file")]
    pub fn from_toml_str(mut self, toml: &str) -> Result<Self> {
        let parsed = config::parse_toml_str(toml)?;
        config::apply_toml_config(&mut self.config, &parsed);
        Ok(self)
    }

    /// The configuration as currently assembled.
    #[must_use]
    pub fn config(&self) -> &ConcurrencyConfig {
        &self.config
    }

    /// Validate the configuration and start the concurrency core.
    pub fn build(self) -> Result<Concurrency> {
        self.config.validate()?;
        Concurrency::start(self.config, self.on_thread_start, self.on_thread_stop)
    }
}
