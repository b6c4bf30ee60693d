//! Blocking counting semaphore with multi-permit acquisition.
//!
//! A [`PermitPool`] tracks a capacity and a signed count of available permits.
//! `acquire(n)` blocks the calling OS thread until `n` permits are available and
//! then takes them atomically; `release(n)` returns them.
//!
//! # Ordering
//!
//! Waiters are served in arrival order. A request larger than the current
//! capacity can never be satisfied by releases alone, so it does not hold up
//! the queue: later, smaller requests are allowed to pass it. It still waits,
//! and proceeds if a later [`resize`](PermitPool::resize) makes room.
//!
//! # Accounting
//!
//! `available` is signed. Shrinking a pool below what is currently held drives
//! it negative until enough permits come back. Releasing more than was acquired
//! drives it above capacity; that is a caller bug and is not detected. The
//! count saturates at `i64::MAX` rather than overflowing.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

#[derive(Debug)]
struct Waiter {
    ticket: u64,
    amount: usize,
}

#[derive(Debug)]
struct PermitState {
    capacity: usize,
    available: i64,
    waiters: VecDeque<Waiter>,
    next_ticket: u64,
    acquisitions: u64,
    total_wait: Duration,
    max_wait: Duration,
}

impl PermitState {
    /// Ticket of the first waiter whose request fits within capacity.
    fn head_ticket(&self) -> Option<u64> {
        self.waiters
            .iter()
            .find(|w| w.amount <= self.capacity)
            .map(|w| w.ticket)
    }

    fn may_take(&self, ticket: u64, amount: usize) -> bool {
        if self.available < signed(amount) {
            return false;
        }
        // Over-capacity requests only run once nothing eligible is queued.
        match self.head_ticket() {
            Some(head) => head == ticket,
            None => true,
        }
    }

    fn take(&mut self, amount: usize, waited: Duration) {
        self.available -= signed(amount);
        self.acquisitions += 1;
        self.total_wait += waited;
        if waited > self.max_wait {
            self.max_wait = waited;
        }
    }

    fn dequeue(&mut self, ticket: u64) {
        self.waiters.retain(|w| w.ticket != ticket);
    }
}

/// Point-in-time view of a [`PermitPool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PermitPoolStats {
    /// Configured number of permits.
    pub capacity: usize,
    /// Permits currently available. Negative after a shrink below the held amount.
    pub available: i64,
    /// Permits currently held: `capacity - available`.
    pub outstanding: i64,
    /// Threads currently blocked in `acquire`.
    pub waiters: usize,
    /// Successful acquisitions so far.
    pub acquisitions: u64,
    /// Sum of time spent blocked across all acquisitions.
    pub total_wait: Duration,
    /// Longest single wait.
    pub max_wait: Duration,
}

/// A counting permit pool that blocks the calling thread.
pub struct PermitPool {
    state: Mutex<PermitState>,
    cvar: Condvar,
}

impl fmt::Debug for PermitPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stats = self.stats();
        f.debug_struct("PermitPool")
            .field("capacity", &stats.capacity)
            .field("available", &stats.available)
            .field("waiters", &stats.waiters)
            .finish()
    }
}

impl PermitPool {
    /// Creates a pool holding `capacity` permits, all available.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(PermitState {
                capacity,
                available: signed(capacity),
                waiters: VecDeque::new(),
                next_ticket: 0,
                acquisitions: 0,
                total_wait: Duration::ZERO,
                max_wait: Duration::ZERO,
            }),
            cvar: Condvar::new(),
        }
    }

    /// Returns the configured capacity.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.state.lock().capacity
    }

    /// Returns the signed number of available permits.
    #[must_use]
    pub fn available(&self) -> i64 {
        self.state.lock().available
    }

    /// Returns the number of threads blocked waiting for permits.
    #[must_use]
    pub fn waiters(&self) -> usize {
        self.state.lock().waiters.len()
    }

    /// Returns a snapshot of the pool's counters.
    #[must_use]
    pub fn stats(&self) -> PermitPoolStats {
        let state = self.state.lock();
        PermitPoolStats {
            capacity: state.capacity,
            available: state.available,
            outstanding: signed(state.capacity).saturating_sub(state.available),
            waiters: state.waiters.len(),
            acquisitions: state.acquisitions,
            total_wait: state.total_wait,
            max_wait: state.max_wait,
        }
    }

    /// Blocks until `amount` permits are available, then takes them.
    ///
    /// Returns how long the caller was blocked. A request for more permits
    /// than the pool will ever hold blocks forever.
    pub fn acquire(&self, amount: usize) -> Duration {
        self.acquire_inner(amount, None)
            .unwrap_or(Duration::MAX)
    }

    /// Like [`acquire`](Self::acquire) but gives up after `timeout`.
    ///
    /// Returns the wait time on success, `None` if the timeout elapsed. A
    /// timed-out caller leaves the queue and holds nothing.
    pub fn acquire_timeout(&self, amount: usize, timeout: Duration) -> Option<Duration> {
        self.acquire_inner(amount, Some(timeout))
    }

    /// Takes `amount` permits only if that is possible without waiting.
    pub fn try_acquire(&self, amount: usize) -> bool {
        if amount == 0 {
            return true;
        }
        let mut state = self.state.lock();
        if state.head_ticket().is_none() && state.available >= signed(amount) {
            state.take(amount, Duration::ZERO);
            true
        } else {
            false
        }
    }

    fn acquire_inner(&self, amount: usize, timeout: Option<Duration>) -> Option<Duration> {
        if amount == 0 {
            return Some(Duration::ZERO);
        }
        let start = Instant::now();
        let deadline = timeout.map(|t| start + t);
        let mut state = self.state.lock();

        if state.head_ticket().is_none() && state.available >= signed(amount) {
            state.take(amount, Duration::ZERO);
            return Some(Duration::ZERO);
        }

        let ticket = state.next_ticket;
        state.next_ticket = state.next_ticket.wrapping_add(1);
        state.waiters.push_back(Waiter { ticket, amount });

        loop {
            if state.may_take(ticket, amount) {
                state.dequeue(ticket);
                let waited = start.elapsed();
                state.take(amount, waited);
                // The next head may also fit.
                self.cvar.notify_all();
                return Some(waited);
            }
            match deadline {
                Some(deadline) => {
                    if self.cvar.wait_until(&mut state, deadline).timed_out()
                        && !state.may_take(ticket, amount)
                    {
                        state.dequeue(ticket);
                        // Leaving may unblock whoever queued behind us.
                        self.cvar.notify_all();
                        return None;
                    }
                }
                None => self.cvar.wait(&mut state),
            }
        }
    }

    /// Returns `amount` permits to the pool and wakes waiters.
    pub fn release(&self, amount: usize) {
        if amount == 0 {
            return;
        }
        let mut state = self.state.lock();
        state.available = state.available.saturating_add(signed(amount));
        drop(state);
        self.cvar.notify_all();
    }

    /// Changes capacity in place, carrying held permits over.
    ///
    /// `available` moves by the capacity delta, so `capacity - available`
    /// (the amount held) is unchanged. Returns the previous capacity.
    pub fn resize(&self, capacity: usize) -> usize {
        let mut state = self.state.lock();
        let previous = state.capacity;
        state.available = state
            .available
            .saturating_add(signed(capacity) - signed(previous));
        state.capacity = capacity;
        drop(state);
        self.cvar.notify_all();
        previous
    }
}

fn signed(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}
