//! Error types for the concurrency core.
//!
//! Very little in this crate is an error. Unknown resource kinds pass through,
//! exhausted resources block, and failing work units are reported as a
//! [`TaskOutcome`](crate::runtime::TaskOutcome) to their completion hook
//! rather than surfacing here. What remains:
//!
//! - **Configuration**: invalid limits, durations or unparseable overrides
//! - **Threads**: the OS refused to spawn a worker thread
//! - **Lifecycle**: work submitted to a pool that has been shut down
//! - **Resources**: a resize refused while permits are outstanding
//!
//! # Recovery Classification
//!
//! [`Error::is_recoverable`] reports whether retrying the same call may succeed.
//! Thread spawn failures are transient; everything else is permanent.

use core::fmt;
use std::sync::Arc;

/// The kind of error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// A configuration value is out of range or could not be parsed.
    InvalidConfig,
    /// The operating system refused to create a worker thread.
    SpawnFailed,
    /// The worker pool no longer accepts work.
    PoolShutdown,
    /// A resource kind cannot be resized while permits are held against it.
    ResourceBusy,
}

impl ErrorKind {
    /// Short, stable name used in log lines.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InvalidConfig => "invalid config",
            Self::SpawnFailed => "thread spawn failed",
            Self::PoolShutdown => "pool shut down",
            Self::ResourceBusy => "resource busy",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The main error type.
#[derive(Debug, Clone)]
pub struct Error {
    kind: ErrorKind,
    message: Option<String>,
    source: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl Error {
    /// Creates a new error with the given kind.
    #[must_use]
    pub const fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            message: None,
            source: None,
        }
    }

    /// Returns the error kind.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns the attached message, if any.
    #[must_use]
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    /// Adds a message to the error.
    #[must_use]
    pub fn with_message(mut self, msg: impl Into<String>) -> Self {
        self.message = Some(msg.into());
        self
    }

    /// Attaches an underlying cause.
    #[must_use]
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Arc::new(source));
        self
    }

    /// Returns true if retrying the failed call may succeed.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(self.kind, ErrorKind::SpawnFailed)
    }

    /// Shorthand for an [`ErrorKind::InvalidConfig`] error.
    #[must_use]
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidConfig).with_message(msg)
    }

    /// Shorthand for an [`ErrorKind::SpawnFailed`] error wrapping the OS cause.
    #[must_use]
    pub fn spawn_failed(source: std::io::Error) -> Self {
        Self::new(ErrorKind::SpawnFailed)
            .with_message("could not start worker thread")
            .with_source(source)
    }

    /// Shorthand for an [`ErrorKind::ResourceBusy`] error.
    #[must_use]
    pub fn resource_busy(key: &str, outstanding: i64) -> Self {
        Self::new(ErrorKind::ResourceBusy).with_message(format!(
            "cannot resize {key:?}: {outstanding} permit(s) still held"
        ))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        if let Some(msg) = &self.message {
            write!(f, ": {msg}")?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Self::new(kind)
    }
}

/// A specialized Result type for this crate.
pub type Result<T> = core::result::Result<T, Error>;
