//! Blocking synchronization primitives.
//!
//! Both primitives block the calling OS thread; there is no async variant.
//!
//! - [`PermitPool`]: counting semaphore with multi-permit acquire and in-place resize
//! - [`CohortBarrier`]: countdown latch for a group of concurrently dispatched units

mod cohort;
mod permit_pool;

pub use cohort::CohortBarrier;
pub use permit_pool::{PermitPool, PermitPoolStats};
