//! Countdown latch for a cohort of concurrently dispatched work units.
//!
//! A [`CohortBarrier`] starts at the number of units submitted together and is
//! counted down once per unit, whether that unit succeeded, failed or panicked.
//! One caller blocks in [`wait_with_progress`](CohortBarrier::wait_with_progress)
//! until the count reaches zero, waking at a fixed interval to report progress.

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// Countdown latch tracking the unfinished members of one cohort.
#[derive(Debug)]
pub struct CohortBarrier {
    total: usize,
    remaining: AtomicUsize,
    mutex: Mutex<()>,
    cvar: Condvar,
}

impl CohortBarrier {
    /// Creates a barrier expecting `total` arrivals.
    ///
    /// A barrier for zero units is already open.
    #[must_use]
    pub fn new(total: usize) -> Self {
        Self {
            total,
            remaining: AtomicUsize::new(total),
            mutex: Mutex::new(()),
            cvar: Condvar::new(),
        }
    }

    /// Number of units the cohort was created with.
    #[must_use]
    pub fn total(&self) -> usize {
        self.total
    }

    /// Number of units that have not yet arrived.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.remaining.load(Ordering::Acquire)
    }

    /// Returns true once every unit has arrived.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.remaining() == 0
    }

    /// Records one unit's completion. Wakes the waiter on the last arrival.
    ///
    /// Extra arrivals beyond `total` are ignored.
    pub fn arrive(&self) {
        let previous = self
            .remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        if previous == Ok(1) {
            let _guard = self.mutex.lock();
            self.cvar.notify_all();
        }
    }

    /// Blocks for at most `timeout`. Returns true if the barrier is open.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        if self.is_open() {
            return true;
        }
        let deadline = Instant::now() + timeout;
        let mut guard = self.mutex.lock();
        while !self.is_open() {
            if self.cvar.wait_until(&mut guard, deadline).timed_out() {
                return self.is_open();
            }
        }
        true
    }

    /// Blocks until the barrier opens, calling `on_tick` with the remaining
    /// count each time `interval` passes without it opening.
    pub fn wait_with_progress<F>(&self, interval: Duration, mut on_tick: F)
    where
        F: FnMut(usize),
    {
        while !self.wait_timeout(interval) {
            on_tick(self.remaining());
        }
    }
}
