//! Pipeline concurrency core: parallel cohorts of work units over an elastic
//! thread pool, gated by named counting resource limits.
//!
//! # Overview
//!
//! A caller hands a batch of work units to [`Concurrency::execute`], which runs
//! them on OS threads and blocks until every unit has finished. Physical
//! parallelism is unbounded; what a unit may actually do at once is limited by
//! reserving [`ResourceUnit`]s against named budgets before heavy sub-work.
//!
//! # Core Guarantees
//!
//! - **Barrier completeness**: `execute` returns only after every unit's completion hook has fired
//! - **No fail-fast**: a failing or panicking unit never cancels its siblings
//! - **Unknown kinds are free**: acquiring a resource kind nobody registered never blocks
//! - **Explicit wiring**: one [`Concurrency`] handle is built at startup and passed around
//!
//! # Module Structure
//!
//! - [`runtime`]: Elastic worker pool and completion hooks
//! - [`sync`]: Blocking permit pool and cohort barrier
//! - [`resource`]: Named resource budgets and resize policies
//! - [`config`]: Configuration, environment overrides, TOML files
//! - [`error`]: Error types
//! - [`tracing_compat`]: Logging macros that vanish without the `tracing-integration` feature
//!
//! # Example
//!
//! ```ignore
//! use pipeline_concurrency::{Concurrency, ResourceUnit};
//!
//! let core = Concurrency::builder().max_concurrency(4).resource("memory", 64).build()?;
//! let tasks = (0..10).map(|i| {
//!     let core = core.clone();
//!     move || {
//!         let unit = ResourceUnit::new("memory", 8);
//!         core.acquire(&unit);
//!         crunch(i);
//!         core.release(&unit);
//!     }
//! });
//! core.execute(tasks);
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::doc_markdown)]
#![cfg_attr(test, allow(dead_code))]

mod builder;
mod concurrency;
pub mod config;
pub mod error;
pub mod resource;
pub mod runtime;
pub mod sync;
pub mod tracing_compat;

#[cfg(test)]
mod test_utils;

// Re-exports for convenient access to core types
pub use builder::ConcurrencyBuilder;
pub use concurrency::{CohortId, CohortProgress, CohortReport, Concurrency};
pub use config::{ConcurrencyConfig, ConfigError};
pub use error::{Error, ErrorKind, Result};
pub use resource::{ResizePolicy, ResourceLimiter, ResourceRegistry, ResourceSnapshot, ResourceUnit};
pub use runtime::{Completion, TaskError, TaskId, TaskOutcome, WorkUnit, WorkerPoolStats};
