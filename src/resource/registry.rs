//! Registry mapping resource kind names to permit pools.

use super::ResourceUnit;
use crate::error::{Error, Result};
use crate::sync::{PermitPool, PermitPoolStats};
use crate::tracing_compat::{debug, info, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// What `set_limit` does when the resource kind already exists.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[cfg_attr(
    feature = "config-file",
    derive(serde::Deserialize),
    serde(rename_all = "lowercase")
)]
pub enum ResizePolicy {
    /// Resize the existing pool in place. Held permits stay accounted for, so
    /// `available` moves by the capacity delta and may go negative.
    #[default]
    Migrate,
    /// Swap in a fresh pool at full capacity. Permits held against the old
    /// pool are forgotten; threads already blocked keep waiting on the old
    /// pool, and later releases go to the new one.
    Replace,
    /// Refuse to resize while any permit is held.
    Reject,
}

impl FromStr for ResizePolicy {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "migrate" => Ok(Self::Migrate),
            "replace" => Ok(Self::Replace),
            "reject" => Ok(Self::Reject),
            _ => Err(()),
        }
    }
}

/// Narrow interface over the reserve/release side of the concurrency core.
///
/// Components that only gate their own heavy work take this instead of the
/// whole orchestrator.
pub trait ResourceLimiter: Send + Sync {
    /// Blocks until `unit` can be reserved. Unknown kinds return immediately.
    fn acquire(&self, unit: &ResourceUnit);

    /// Returns a reservation. Unknown kinds are a no-op.
    fn release(&self, unit: &ResourceUnit);

    /// Creates or resizes a resource kind.
    fn set_limit(&self, key: &str, capacity: usize) -> Result<()>;
}

/// Point-in-time view of one resource kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceSnapshot {
    /// Kind name.
    pub name: String,
    /// Permit counters.
    pub permits: PermitPoolStats,
    /// Acquisitions that waited longer than the stall threshold.
    pub stalls: u64,
}

struct ResourceKind {
    pool: PermitPool,
    stalls: AtomicU64,
}

impl ResourceKind {
    fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            pool: PermitPool::new(capacity),
            stalls: AtomicU64::new(0),
        })
    }
}

/// Mapping from resource kind name to a counting permit pool.
pub struct ResourceRegistry {
    kinds: Mutex<HashMap<String, Arc<ResourceKind>>>,
    policy: ResizePolicy,
    stall_threshold: Duration,
}

impl fmt::Debug for ResourceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceRegistry")
            .field("kinds", &self.names())
            .field("policy", &self.policy)
            .field("stall_threshold", &self.stall_threshold)
            .finish()
    }
}

impl ResourceRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new(policy: ResizePolicy, stall_threshold: Duration) -> Self {
        Self {
            kinds: Mutex::new(HashMap::new()),
            policy,
            stall_threshold,
        }
    }

    /// The policy applied when an existing kind is resized.
    #[must_use]
    pub fn policy(&self) -> ResizePolicy {
        self.policy
    }

    fn lookup(&self, key: &str) -> Option<Arc<ResourceKind>> {
        self.kinds.lock().get(key).cloned()
    }

    /// Creates `key` with `capacity` permits, or resizes it per the policy.
    ///
    /// Fails only under [`ResizePolicy::Reject`] when permits are held.
    pub fn set_limit(&self, key: &str, capacity: usize) -> Result<()> {
        let mut kinds = self.kinds.lock();
        let Some(existing) = kinds.get(key) else {
            kinds.insert(key.to_string(), ResourceKind::new(capacity));
            info!(key = %key, capacity, "resource limit created");
            return Ok(());
        };

        let outstanding = existing.pool.stats().outstanding;
        match self.policy {
            ResizePolicy::Migrate => {
                let previous = existing.pool.resize(capacity);
                info!(key = %key, previous, capacity, outstanding, "resource limit resized");
            }
            ResizePolicy::Replace => {
                if outstanding != 0 {
                    warn!(
                        key = %key,
                        outstanding,
                        "replacing resource pool while permits are held; they are not carried over"
                    );
                }
                let previous = existing.pool.capacity();
                kinds.insert(key.to_string(), ResourceKind::new(capacity));
                info!(key = %key, previous, capacity, "resource limit replaced");
            }
            ResizePolicy::Reject => {
                if outstanding > 0 {
                    return Err(Error::resource_busy(key, outstanding));
                }
                let previous = existing.pool.resize(capacity);
                info!(key = %key, previous, capacity, "resource limit resized");
            }
        }
        Ok(())
    }

    /// Blocks until `unit.amount()` permits of `unit.key()` are available and takes them.
    ///
    /// An unregistered key is unconstrained: this returns at once for any amount.
    /// Waits longer than the stall threshold are logged.
    pub fn acquire(&self, unit: &ResourceUnit) {
        let Some(kind) = self.lookup(unit.key()) else {
            debug!(
                key = %unit.key(),
                amount = unit.amount(),
                "unknown resource kind, not limiting"
            );
            return;
        };
        let waited = kind.pool.acquire(unit.amount());
        self.note_wait(&kind, unit, waited);
    }

    /// Like [`acquire`](Self::acquire) but gives up after `timeout`.
    ///
    /// Returns false if nothing was reserved.
    pub fn acquire_timeout(&self, unit: &ResourceUnit, timeout: Duration) -> bool {
        let Some(kind) = self.lookup(unit.key()) else {
            return true;
        };
        match kind.pool.acquire_timeout(unit.amount(), timeout) {
            Some(waited) => {
                self.note_wait(&kind, unit, waited);
                true
            }
            None => false,
        }
    }

    /// Reserves `unit` only if that is possible without waiting.
    pub fn try_acquire(&self, unit: &ResourceUnit) -> bool {
        self.lookup(unit.key())
            .map_or(true, |kind| kind.pool.try_acquire(unit.amount()))
    }

    /// Returns `unit.amount()` permits to `unit.key()`. Unknown keys are a no-op.
    ///
    /// Releasing more than was acquired is not detected.
    pub fn release(&self, unit: &ResourceUnit) {
        match self.lookup(unit.key()) {
            Some(kind) => kind.pool.release(unit.amount()),
            None => {
                debug!(
                    key = %unit.key(),
                    amount = unit.amount(),
                    "release of unknown resource kind ignored"
                );
            }
        }
    }

    fn note_wait(&self, kind: &ResourceKind, unit: &ResourceUnit, waited: Duration) {
        if waited > self.stall_threshold {
            kind.stalls.fetch_add(1, Ordering::Relaxed);
            info!(
                key = %unit.key(),
                amount = unit.amount(),
                waited_ms = u64::try_from(waited.as_millis()).unwrap_or(u64::MAX),
                available = kind.pool.available(),
                "resource acquire stalled"
            );
        }
    }

    /// Returns true if `key` is registered.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.kinds.lock().contains_key(key)
    }

    /// Registered kind names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.kinds.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Capacity of `key`, if registered.
    #[must_use]
    pub fn capacity(&self, key: &str) -> Option<usize> {
        self.lookup(key).map(|kind| kind.pool.capacity())
    }

    /// Available permits of `key`, if registered.
    #[must_use]
    pub fn available(&self, key: &str) -> Option<i64> {
        self.lookup(key).map(|kind| kind.pool.available())
    }

    /// Snapshot of `key`, if registered.
    #[must_use]
    pub fn snapshot_of(&self, key: &str) -> Option<ResourceSnapshot> {
        self.lookup(key).map(|kind| ResourceSnapshot {
            name: key.to_string(),
            permits: kind.pool.stats(),
            stalls: kind.stalls.load(Ordering::Relaxed),
        })
    }

    /// Snapshots of every kind, sorted by name.
    #[must_use]
    pub fn snapshot(&self) -> Vec<ResourceSnapshot> {
        let mut entries: Vec<(String, Arc<ResourceKind>)> = self
            .kinds
            .lock()
            .iter()
            .map(|(name, kind)| (name.clone(), Arc::clone(kind)))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
            .into_iter()
            .map(|(name, kind)| ResourceSnapshot {
                name,
                permits: kind.pool.stats(),
                stalls: kind.stalls.load(Ordering::Relaxed),
            })
            .collect()
    }
}

impl ResourceLimiter for ResourceRegistry {
    fn acquire(&self, unit: &ResourceUnit) {
        Self::acquire(self, unit);
    }

    fn release(&self, unit: &ResourceUnit) {
        Self::release(self, unit);
    }

    fn set_limit(&self, key: &str, capacity: usize) -> Result<()> {
        Self::set_limit(self, key, capacity)
    }
}
