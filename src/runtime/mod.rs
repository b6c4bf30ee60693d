//! Thread execution machinery.
//!
//! - [`worker_pool`]: elastic direct-handoff pool of OS threads with
//!   per-unit completion hooks

pub mod worker_pool;

pub use worker_pool::{
    Completion, CompletionHook, TaskError, TaskId, TaskOutcome, WorkUnit, WorkerPool,
    WorkerPoolOptions, WorkerPoolStats,
};
