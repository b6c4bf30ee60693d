//! Named logical resource budgets.
//!
//! Physical threads are unbounded (see [`WorkerPool`](crate::runtime::WorkerPool)).
//! What actually limits heavy work is a caller reserving a [`ResourceUnit`]
//! against the [`ResourceRegistry`] before starting it, and releasing the same
//! unit afterwards.
//!
//! Unknown resource kinds are unconstrained: acquiring or releasing them
//! never blocks and never fails.

mod registry;
mod unit;

pub use registry::{ResizePolicy, ResourceLimiter, ResourceRegistry, ResourceSnapshot};
pub use unit::ResourceUnit;
