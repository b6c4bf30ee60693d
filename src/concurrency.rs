//! The concurrency orchestrator.
//!
//! [`Concurrency`] owns one [`WorkerPool`] and one [`ResourceRegistry`]. It is
//! a cheap `Clone` handle: build one at process start and pass it (or a
//! `&dyn ResourceLimiter`) to every component that needs it.
//!
//! `execute` runs a cohort of work units in parallel and blocks until every
//! one of them has finished, successfully or not. Units inside a cohort can
//! gate their own heavy sub-work with `acquire`/`release`.

use crate::builder::ConcurrencyBuilder;
use crate::config::ConcurrencyConfig;
use crate::error::Result;
use crate::resource::{ResourceLimiter, ResourceRegistry, ResourceUnit};
use crate::runtime::{
    Completion, CompletionHook, TaskError, WorkUnit, WorkerPool, WorkerPoolOptions,
    WorkerPoolStats,
};
use crate::sync::CohortBarrier;
use crate::tracing_compat::{debug, error, info};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Identifier of one `execute` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CohortId(u64);

impl CohortId {
    /// Returns the raw numeric id.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for CohortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cohort-{}", self.0)
    }
}

/// Progress of a cohort whose `execute` call has not yet returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CohortProgress {
    /// The cohort.
    pub id: CohortId,
    /// Units submitted.
    pub total: usize,
    /// Units not yet finished.
    pub remaining: usize,
    /// Time since the cohort was submitted.
    pub elapsed: Duration,
}

/// Summary of a finished `execute` call.
///
/// Failures are counted, not surfaced: units that need to report errors
/// should record them somewhere the caller can inspect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CohortReport {
    /// The cohort.
    pub id: CohortId,
    /// Units submitted.
    pub total: usize,
    /// Units that returned an error, panicked or were rejected.
    pub failed: usize,
    /// Wall time from submission until the last unit finished.
    pub elapsed: Duration,
}

impl CohortReport {
    /// Units that completed successfully.
    #[must_use]
    pub fn succeeded(&self) -> usize {
        self.total - self.failed
    }
}

struct Cohort {
    barrier: CohortBarrier,
    failed: AtomicUsize,
    started: Instant,
}

struct Inner {
    config: ConcurrencyConfig,
    pool: WorkerPool,
    resources: ResourceRegistry,
    cohorts: Mutex<HashMap<CohortId, Arc<Cohort>>>,
    next_cohort: AtomicU64,
}

/// Handle to the process's concurrency core.
#[derive(Clone)]
pub struct Concurrency {
    inner: Arc<Inner>,
}

impl fmt::Debug for Concurrency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Concurrency")
            .field("config", &self.inner.config)
            .field("pool", &self.inner.pool)
            .field("resources", &self.inner.resources)
            .finish()
    }
}

impl Concurrency {
    /// Starts a core with defaults and the given maximum concurrency.
    pub fn new(max_concurrency: usize) -> Result<Self> {
        Self::builder().max_concurrency(max_concurrency).build()
    }

    /// Starts a core from a complete configuration.
    pub fn from_config(config: ConcurrencyConfig) -> Result<Self> {
        ConcurrencyBuilder::from_config(config).build()
    }

    /// Returns a builder with default configuration.
    #[must_use]
    pub fn builder() -> ConcurrencyBuilder {
        ConcurrencyBuilder::new()
    }

    pub(crate) fn start(
        config: ConcurrencyConfig,
        on_thread_start: Option<Arc<dyn Fn() + Send + Sync>>,
        on_thread_stop: Option<Arc<dyn Fn() + Send + Sync>>,
    ) -> Result<Self> {
        let pool = WorkerPool::with_options(WorkerPoolOptions {
            core_threads: config.max_concurrency,
            thread_name_prefix: config.thread_name_prefix.clone(),
            on_thread_start,
            on_thread_stop,
        });
        let resources = ResourceRegistry::new(config.resize_policy, config.stall_threshold);
        resources.set_limit(&config.default_resource, config.max_concurrency)?;
        for (name, capacity) in &config.initial_limits {
            resources.set_limit(name, *capacity)?;
        }
        info!(
            max_concurrency = config.max_concurrency,
            default_resource = %config.default_resource,
            resize_policy = ?config.resize_policy,
            "concurrency core started"
        );
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                pool,
                resources,
                cohorts: Mutex::new(HashMap::new()),
                next_cohort: AtomicU64::new(1),
            }),
        })
    }

    /// Runs every closure in parallel and blocks until all have finished.
    ///
    /// A panicking closure is counted as failed; its siblings are unaffected.
    pub fn execute<I, F>(&self, tasks: I) -> CohortReport
    where
        I: IntoIterator<Item = F>,
        F: FnOnce() + Send + 'static,
    {
        let units = tasks
            .into_iter()
            .map(|task| {
                Box::new(move || -> std::result::Result<(), TaskError> {
                    task();
                    Ok(())
                }) as Box<dyn WorkUnit>
            })
            .collect();
        self.execute_units(units)
    }

    /// Runs every unit in parallel and blocks until each one's completion
    /// hook has fired.
    ///
    /// There is no fail-fast: failed units are logged and counted in the
    /// report. An empty input returns at once without touching the pool.
    pub fn execute_units(&self, units: Vec<Box<dyn WorkUnit>>) -> CohortReport {
        let inner = &self.inner;
        let id = CohortId(inner.next_cohort.fetch_add(1, Ordering::Relaxed));
        let total = units.len();
        if total == 0 {
            return CohortReport {
                id,
                total,
                failed: 0,
                elapsed: Duration::ZERO,
            };
        }

        let cohort = Arc::new(Cohort {
            barrier: CohortBarrier::new(total),
            failed: AtomicUsize::new(0),
            started: Instant::now(),
        });
        inner.cohorts.lock().insert(id, Arc::clone(&cohort));
        debug!(cohort = %id, total, "submitting cohort");

        for unit in units {
            let cohort = Arc::clone(&cohort);
            let hook: CompletionHook = Arc::new(move |done: &Completion| {
                if !done.outcome.is_success() {
                    cohort.failed.fetch_add(1, Ordering::Relaxed);
                }
                cohort.barrier.arrive();
            });
            // The hook has already fired as rejected if this fails.
            if let Err(err) = inner.pool.submit(unit, Some(hook)) {
                error!(cohort = %id, error = %err, "work unit could not be dispatched");
            }
        }

        cohort
            .barrier
            .wait_with_progress(inner.config.progress_interval, |remaining| {
                info!(
                    cohort = %id,
                    remaining,
                    total,
                    busy_threads = inner.pool.busy_threads(),
                    submitted = inner.pool.submitted_count(),
                    elapsed_ms = millis(cohort.started.elapsed()),
                    "waiting for cohort"
                );
            });
        inner.cohorts.lock().remove(&id);

        let report = CohortReport {
            id,
            total,
            failed: cohort.failed.load(Ordering::Relaxed),
            elapsed: cohort.started.elapsed(),
        };
        debug!(
            cohort = %id,
            total,
            failed = report.failed,
            elapsed_ms = millis(report.elapsed),
            "cohort finished"
        );
        report
    }

    /// Blocks until `unit` can be reserved. Unknown kinds return immediately.
    pub fn acquire(&self, unit: &ResourceUnit) {
        self.inner.resources.acquire(unit);
    }

    /// Returns a reservation. Unknown kinds are a no-op.
    pub fn release(&self, unit: &ResourceUnit) {
        self.inner.resources.release(unit);
    }

    /// Creates or resizes a resource kind, following the configured policy.
    pub fn set_limit(&self, key: &str, capacity: usize) -> Result<()> {
        self.inner.resources.set_limit(key, capacity)
    }

    /// A unit of `amount` permits of the default resource kind.
    #[must_use]
    pub fn default_unit(&self, amount: usize) -> ResourceUnit {
        ResourceUnit::new(self.inner.config.default_resource.clone(), amount)
    }

    /// The resource registry.
    #[must_use]
    pub fn resources(&self) -> &ResourceRegistry {
        &self.inner.resources
    }

    /// Worker pool counters.
    #[must_use]
    pub fn pool_stats(&self) -> WorkerPoolStats {
        self.inner.pool.stats()
    }

    /// Cohorts whose `execute` call is still blocked, oldest first.
    #[must_use]
    pub fn in_flight_cohorts(&self) -> Vec<CohortProgress> {
        let mut cohorts: Vec<CohortProgress> = self
            .inner
            .cohorts
            .lock()
            .iter()
            .map(|(id, cohort)| CohortProgress {
                id: *id,
                total: cohort.barrier.total(),
                remaining: cohort.barrier.remaining(),
                elapsed: cohort.started.elapsed(),
            })
            .collect();
        cohorts.sort_by_key(|c| c.id);
        cohorts
    }

    /// The configuration this core was built with.
    #[must_use]
    pub fn config(&self) -> &ConcurrencyConfig {
        &self.inner.config
    }

    /// Stops the worker pool. Later units are rejected and counted as failed.
    pub fn shutdown(&self) {
        info!("concurrency core shutting down");
        self.inner.pool.shutdown();
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

impl ResourceLimiter for Concurrency {
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
