//! Elastic worker pool with direct-handoff dispatch and completion hooks.
//!
//! # Design
//!
//! The pool runs work units on OS threads. There is no task queue: a submitted
//! unit is either handed straight to an idle thread or causes a new thread to
//! be spawned on the spot, so [`WorkerPool::submit`] never blocks and never
//! waits for capacity.
//!
//! ## Thread Lifecycle
//!
//! Threads are created lazily. While fewer than `core_threads` are alive,
//! every submission spawns a new thread, even if others are idle. Up to
//! `core_threads` threads then park when idle and are reused. Threads beyond
//! that count exit as soon as their unit finishes. There is no upper bound:
//! the pool does not cap physical concurrency. Capping logical concurrency is
//! the job of [`ResourceRegistry`](crate::resource::ResourceRegistry).
//!
//! Threads are never joined. Like daemon threads they do not keep the process
//! alive.
//!
//! ## Completion
//!
//! After a unit returns, returns an error, or panics, its completion hook is
//! called exactly once on the executing thread, before that thread looks for
//! more work. Failures are logged and reported to the hook as a
//! [`TaskOutcome`]; they are never propagated to the submitter.
//!
//! # Example
//!
//! ```ignore
//! use pipeline_concurrency::runtime::{Completion, TaskError, WorkerPool};
//! use std::sync::Arc;
//!
//! let pool = WorkerPool::new(4);
//! pool.submit(
//!     Box::new(|| -> Result<(), TaskError> { Ok(()) }),
//!     Some(Arc::new(|done: &Completion| println!("{} finished", done.task_id))),
//! )?;
//! ```

use crate::error::{Error, ErrorKind, Result};
use crate::tracing_compat::{debug, error, trace};
use parking_lot::{Condvar, Mutex};
use std::any::Any;
use std::collections::VecDeque;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const DEFAULT_LABEL: &str = "work-unit";

/// Error type a work unit may return.
pub type TaskError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Identifier assigned to every submitted work unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl TaskId {
    /// Returns the raw numeric id.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// An opaque unit of work.
///
/// Closures returning `Result<(), TaskError>` implement this directly.
pub trait WorkUnit: Send + 'static {
    /// Runs the unit to completion on the current thread.
    fn run(self: Box<Self>) -> std::result::Result<(), TaskError>;

    /// Name used in log lines.
    fn label(&self) -> &str {
        DEFAULT_LABEL
    }
}

impl<F> WorkUnit for F
where
    F: FnOnce() -> std::result::Result<(), TaskError> + Send + 'static,
{
    fn run(self: Box<Self>) -> std::result::Result<(), TaskError> {
        (*self)()
    }
}

/// How a work unit ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    /// The unit returned `Ok`.
    Completed,
    /// The unit returned an error.
    Failed(String),
    /// The unit panicked.
    Panicked(String),
    /// The unit never ran: the pool was shut down or no thread could be started.
    Rejected(String),
}

impl TaskOutcome {
    /// Returns true for [`TaskOutcome::Completed`].
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed)
    }
}

/// What a completion hook is told about a finished unit.
#[derive(Debug, Clone)]
pub struct Completion {
    /// The unit's id.
    pub task_id: TaskId,
    /// The unit's label.
    pub label: String,
    /// How it ended.
    pub outcome: TaskOutcome,
    /// Time spent running (zero for rejected units).
    pub elapsed: Duration,
}

/// Callback invoked once per finished unit.
pub type CompletionHook = Arc<dyn Fn(&Completion) + Send + Sync>;

/// Configuration options for the worker pool.
#[derive(Clone)]
pub struct WorkerPoolOptions {
    /// Number of threads kept alive while idle.
    pub core_threads: usize,
    /// Thread name prefix.
    pub thread_name_prefix: String,
    /// Callback when a thread starts.
    pub on_thread_start: Option<Arc<dyn Fn() + Send + Sync>>,
    /// Callback when a thread stops.
    pub on_thread_stop: Option<Arc<dyn Fn() + Send + Sync>>,
}

impl Default for WorkerPoolOptions {
    fn default() -> Self {
        Self {
            core_threads: 1,
            thread_name_prefix: "pipeline".to_string(),
            on_thread_start: None,
            on_thread_stop: None,
        }
    }
}

impl fmt::Debug for WorkerPoolOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPoolOptions")
            .field("core_threads", &self.core_threads)
            .field("thread_name_prefix", &self.thread_name_prefix)
            .field("on_thread_start", &self.on_thread_start.is_some())
            .field("on_thread_stop", &self.on_thread_stop.is_some())
            .finish()
    }
}

/// Point-in-time view of pool activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerPoolStats {
    /// Threads kept alive while idle.
    pub core_threads: usize,
    /// Threads currently alive.
    pub live_threads: usize,
    /// Threads parked waiting for a handoff.
    pub idle_threads: usize,
    /// Threads currently running a unit.
    pub busy_threads: usize,
    /// Most threads ever alive at once.
    pub largest_pool_size: usize,
    /// Units ever submitted.
    pub submitted: u64,
    /// Units whose completion hook has fired.
    pub completed: u64,
}

struct Dispatch {
    id: TaskId,
    unit: Box<dyn WorkUnit>,
    hook: Option<CompletionHook>,
}

#[derive(Default)]
struct PoolState {
    live: usize,
    idle: usize,
    handoff: VecDeque<Dispatch>,
    shutdown: bool,
}

struct PoolInner {
    core_threads: usize,
    thread_name_prefix: String,
    on_thread_start: Option<Arc<dyn Fn() + Send + Sync>>,
    on_thread_stop: Option<Arc<dyn Fn() + Send + Sync>>,
    state: Mutex<PoolState>,
    condvar: Condvar,
    next_task_id: AtomicU64,
    next_thread_id: AtomicU64,
    submitted: AtomicU64,
    completed: AtomicU64,
    busy: AtomicUsize,
    largest: AtomicUsize,
}

/// The elastic worker pool.
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stats = self.stats();
        f.debug_struct("WorkerPool")
            .field("core_threads", &stats.core_threads)
            .field("live_threads", &stats.live_threads)
            .field("busy_threads", &stats.busy_threads)
            .field("submitted", &stats.submitted)
            .finish()
    }
}

impl WorkerPool {
    /// Creates a pool keeping `core_threads` threads alive once started.
    #[must_use]
    pub fn new(core_threads: usize) -> Self {
        Self::with_options(WorkerPoolOptions {
            core_threads,
            ..WorkerPoolOptions::default()
        })
    }

    /// Creates a pool with custom options. No thread is started until work arrives.
    #[must_use]
    pub fn with_options(options: WorkerPoolOptions) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                core_threads: options.core_threads,
                thread_name_prefix: options.thread_name_prefix,
                on_thread_start: options.on_thread_start,
                on_thread_stop: options.on_thread_stop,
                state: Mutex::new(PoolState::default()),
                condvar: Condvar::new(),
                next_task_id: AtomicU64::new(1),
                next_thread_id: AtomicU64::new(0),
                submitted: AtomicU64::new(0),
                completed: AtomicU64::new(0),
                busy: AtomicUsize::new(0),
                largest: AtomicUsize::new(0),
            }),
        }
    }

    /// Hands `unit` to an idle thread or starts a new one for it.
    ///
    /// Never blocks. `hook` fires exactly once, including when this returns
    /// an error, in which case the outcome is [`TaskOutcome::Rejected`].
    pub fn submit(&self, unit: Box<dyn WorkUnit>, hook: Option<CompletionHook>) -> Result<TaskId> {
        let inner = &self.inner;
        let id = TaskId(inner.next_task_id.fetch_add(1, Ordering::Relaxed));
        inner.submitted.fetch_add(1, Ordering::Relaxed);
        let dispatch = Dispatch { id, unit, hook };

        let mut state = inner.state.lock();
        if state.shutdown {
            drop(state);
            let err = Error::new(ErrorKind::PoolShutdown);
            reject(inner, dispatch, &err);
            return Err(err);
        }

        // Reuse an idle thread only once the core set exists.
        if state.live >= inner.core_threads && state.idle > state.handoff.len() {
            state.handoff.push_back(dispatch);
            drop(state);
            inner.condvar.notify_one();
            trace!(task_id = %id, "handed off to idle worker");
            return Ok(id);
        }

        state.live += 1;
        inner.largest.fetch_max(state.live, Ordering::Relaxed);
        drop(state);

        match spawn_worker(inner, dispatch) {
            Ok(()) => Ok(id),
            Err((dispatch, io)) => {
                inner.state.lock().live -= 1;
                let err = Error::spawn_failed(io);
                error!(task_id = %id, error = %err, "could not start worker thread");
                reject(inner, dispatch, &err);
                Err(err)
            }
        }
    }

    /// Returns a snapshot of the pool's counters.
    #[must_use]
    pub fn stats(&self) -> WorkerPoolStats {
        let state = self.inner.state.lock();
        WorkerPoolStats {
            core_threads: self.inner.core_threads,
            live_threads: state.live,
            idle_threads: state.idle,
            busy_threads: self.inner.busy.load(Ordering::Relaxed),
            largest_pool_size: self.inner.largest.load(Ordering::Relaxed),
            submitted: self.inner.submitted.load(Ordering::Relaxed),
            completed: self.inner.completed.load(Ordering::Relaxed),
        }
    }

    /// Returns the number of threads currently running a unit.
    #[must_use]
    pub fn busy_threads(&self) -> usize {
        self.inner.busy.load(Ordering::Relaxed)
    }

    /// Returns the number of live threads.
    #[must_use]
    pub fn live_threads(&self) -> usize {
        self.inner.state.lock().live
    }

    /// Returns the number of units ever submitted.
    #[must_use]
    pub fn submitted_count(&self) -> u64 {
        self.inner.submitted.load(Ordering::Relaxed)
    }

    /// Returns the number of units whose completion hook has fired.
    #[must_use]
    pub fn completed_count(&self) -> u64 {
        self.inner.completed.load(Ordering::Relaxed)
    }

    /// Returns `true` if the pool is shut down.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.inner.state.lock().shutdown
    }

    /// Stops accepting work and lets idle threads exit.
    ///
    /// Units already handed off still run. Busy threads finish their current
    /// unit and then exit. Nothing is joined.
    pub fn shutdown(&self) {
        self.inner.state.lock().shutdown = true;
        self.inner.condvar.notify_all();
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn spawn_worker(
    inner: &Arc<PoolInner>,
    first: Dispatch,
) -> std::result::Result<(), (Dispatch, std::io::Error)> {
    let thread_id = inner.next_thread_id.fetch_add(1, Ordering::Relaxed);
    let name = format!("{}-worker-{}", inner.thread_name_prefix, thread_id);

    // Lets us take the unit back if the OS refuses the thread.
    let slot = Arc::new(Mutex::new(Some(first)));
    let worker_slot = Arc::clone(&slot);
    let worker_inner = Arc::clone(inner);

    let spawned = thread::Builder::new().name(name).spawn(move || {
        let first = worker_slot.lock().take();
        worker_main(&worker_inner, first);
    });

    match spawned {
        // Dropping the JoinHandle detaches the thread.
        Ok(_detached) => Ok(()),
        Err(io) => match slot.lock().take() {
            Some(dispatch) => Err((dispatch, io)),
            None => Ok(()),
        },
    }
}

fn worker_main(inner: &PoolInner, first: Option<Dispatch>) {
    if let Some(ref callback) = inner.on_thread_start {
        run_thread_callback(callback.as_ref(), "on_thread_start");
    }
    trace!("worker started");

    let mut next = first;
    while let Some(dispatch) = next.take() {
        run_dispatch(inner, dispatch);
        next = next_dispatch(inner);
    }

    trace!("worker exiting");
    if let Some(ref callback) = inner.on_thread_stop {
        run_thread_callback(callback.as_ref(), "on_thread_stop");
    }
}

fn run_thread_callback(callback: &(dyn Fn() + Send + Sync), which: &'static str) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(callback)) {
        let message = panic_message(payload.as_ref());
        error!(callback = which, panic = %message, "thread callback panicked");
    }
}

/// The unit's label, or the default if `label()` panics.
fn unit_label(unit: &dyn WorkUnit) -> String {
    panic::catch_unwind(AssertUnwindSafe(|| unit.label().to_string()))
        .unwrap_or_else(|_| DEFAULT_LABEL.to_string())
}

/// Picks up the next handoff, or decides this thread should exit.
fn next_dispatch(inner: &PoolInner) -> Option<Dispatch> {
    let mut state = inner.state.lock();
    if let Some(dispatch) = state.handoff.pop_front() {
        return Some(dispatch);
    }
    if state.shutdown || state.live > inner.core_threads {
        state.live -= 1;
        return None;
    }

    state.idle += 1;
    loop {
        if let Some(dispatch) = state.handoff.pop_front() {
            state.idle -= 1;
            return Some(dispatch);
        }
        if state.shutdown {
            state.idle -= 1;
            state.live -= 1;
            return None;
        }
        inner.condvar.wait(&mut state);
    }
}

fn run_dispatch(inner: &PoolInner, dispatch: Dispatch) {
    let Dispatch { id, unit, hook } = dispatch;
    let label = unit_label(unit.as_ref());
    debug!(task_id = %id, label = %label, "work unit starting");

    inner.busy.fetch_add(1, Ordering::Relaxed);
    let start = Instant::now();
    let outcome = match panic::catch_unwind(AssertUnwindSafe(|| unit.run())) {
        Ok(Ok(())) => TaskOutcome::Completed,
        Ok(Err(err)) => {
            error!(task_id = %id, label = %label, error = %err, "work unit failed");
            TaskOutcome::Failed(err.to_string())
        }
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            error!(task_id = %id, label = %label, panic = %message, "work unit panicked");
            TaskOutcome::Panicked(message)
        }
    };
    let elapsed = start.elapsed();
    inner.busy.fetch_sub(1, Ordering::Relaxed);

    complete(
        inner,
        hook,
        Completion {
            task_id: id,
            label,
            outcome,
            elapsed,
        },
    );
}

fn reject(inner: &PoolInner, dispatch: Dispatch, err: &Error) {
    let Dispatch { id, unit, hook } = dispatch;
    complete(
        inner,
        hook,
        Completion {
            task_id: id,
            label: unit_label(unit.as_ref()),
            outcome: TaskOutcome::Rejected(err.to_string()),
            elapsed: Duration::ZERO,
        },
    );
}

fn complete(inner: &PoolInner, hook: Option<CompletionHook>, completion: Completion) {
    inner.completed.fetch_add(1, Ordering::Relaxed);
    if let Some(hook) = hook {
        if panic::catch_unwind(AssertUnwindSafe(|| hook(&completion))).is_err() {
            error!(task_id = %completion.task_id, "completion hook panicked");
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
