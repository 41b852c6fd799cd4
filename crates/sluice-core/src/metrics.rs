//! Performance counters and point-in-time summaries.
//!
//! Counters are lock-free atomics updated by workers on the hot path.
//! Summaries are plain records computed on demand by the controller; they
//! are never consulted for scheduling decisions.
//!
//! Rates intentionally use f64, accepting precision loss for very large
//! counts (>2^52). This is acceptable for monitoring purposes.

#![allow(clippy::cast_precision_loss)] // Metrics don't need full u64 precision
#![allow(clippy::cast_possible_truncation)] // Durations in ns fit u64 for ~584 years

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

use crate::stage::{ExecutionResult, StageId, StageKind, StageState};
use crate::topology::FailureReport;

/// Per-stage counters, accumulated over all workers.
#[derive(Debug)]
pub struct StageMetrics {
    invocations: AtomicU64,
    items_processed: AtomicU64,
    busy_ns: AtomicU64,
    successes: AtomicU64,
    come_back_laters: AtomicU64,
    finishes: AtomicU64,
    errors: AtomicU64,
    backoff_exhaustions: AtomicU64,
    /// `f64` bit pattern of the throughput measured on the last productive call.
    last_throughput_bits: AtomicU64,
}

impl Default for StageMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl StageMetrics {
    /// Creates zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self {
            invocations: AtomicU64::new(0),
            items_processed: AtomicU64::new(0),
            busy_ns: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            come_back_laters: AtomicU64::new(0),
            finishes: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            backoff_exhaustions: AtomicU64::new(0),
            last_throughput_bits: AtomicU64::new(0f64.to_bits()),
        }
    }

    /// Records one `execute` call.
    pub fn record_execution(&self, result: &ExecutionResult, items: usize, elapsed: Duration) {
        let elapsed_ns = elapsed.as_nanos() as u64;
        self.invocations.fetch_add(1, Ordering::Relaxed);
        self.items_processed
            .fetch_add(items as u64, Ordering::Relaxed);
        self.busy_ns.fetch_add(elapsed_ns, Ordering::Relaxed);

        let counter = match result {
            ExecutionResult::Success => &self.successes,
            ExecutionResult::ComeBackLater => &self.come_back_laters,
            ExecutionResult::Finished => &self.finishes,
            ExecutionResult::Error(_) => &self.errors,
        };
        counter.fetch_add(1, Ordering::Relaxed);

        if items > 0 && elapsed_ns > 0 {
            let hz = items as f64 * 1e9 / elapsed_ns as f64;
            self.last_throughput_bits
                .store(hz.to_bits(), Ordering::Relaxed);
        }
    }

    /// Records a worker giving up on this stage after exhausting its backoff.
    pub fn record_backoff_exhausted(&self) {
        self.backoff_exhaustions.fetch_add(1, Ordering::Relaxed);
    }

    /// Total items handled by this stage.
    #[must_use]
    pub fn items_processed(&self) -> u64 {
        self.items_processed.load(Ordering::Relaxed)
    }

    /// Returns a snapshot of all counters.
    #[must_use]
    pub fn snapshot(&self) -> StageMetricsSnapshot {
        StageMetricsSnapshot {
            invocations: self.invocations.load(Ordering::Relaxed),
            items_processed: self.items_processed.load(Ordering::Relaxed),
            busy_time: Duration::from_nanos(self.busy_ns.load(Ordering::Relaxed)),
            successes: self.successes.load(Ordering::Relaxed),
            come_back_laters: self.come_back_laters.load(Ordering::Relaxed),
            finishes: self.finishes.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            backoff_exhaustions: self.backoff_exhaustions.load(Ordering::Relaxed),
            last_throughput_hz: f64::from_bits(self.last_throughput_bits.load(Ordering::Relaxed)),
        }
    }
}

/// Snapshot of [`StageMetrics`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StageMetricsSnapshot {
    /// `execute` calls.
    pub invocations: u64,
    /// Items handled.
    pub items_processed: u64,
    /// Wall time spent inside `execute`.
    pub busy_time: Duration,
    /// Calls that returned `Success`.
    pub successes: u64,
    /// Calls that returned `ComeBackLater`.
    pub come_back_laters: u64,
    /// Calls that returned `Finished`.
    pub finishes: u64,
    /// Calls that returned `Error` or panicked.
    pub errors: u64,
    /// Times a worker yielded the stage after exhausting its backoff.
    pub backoff_exhaustions: u64,
    /// Items per second on the last productive call.
    pub last_throughput_hz: f64,
}

impl StageMetricsSnapshot {
    /// Mean time per item.
    #[must_use]
    pub fn avg_latency(&self) -> Duration {
        if self.items_processed == 0 {
            return Duration::ZERO;
        }
        Duration::from_nanos((self.busy_time.as_nanos() / u128::from(self.items_processed)) as u64)
    }
}

/// Per-worker counters.
#[derive(Debug, Default)]
pub struct WorkerMetrics {
    useful_ns: AtomicU64,
    idle_ns: AtomicU64,
    backoff_ns: AtomicU64,
    scheduler_ns: AtomicU64,
    iterations: AtomicU64,
}

impl WorkerMetrics {
    /// Time spent inside `execute`.
    pub fn record_useful(&self, elapsed: Duration) {
        self.useful_ns
            .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
        self.iterations.fetch_add(1, Ordering::Relaxed);
    }

    /// Time spent waiting with no stage assigned.
    pub fn record_idle(&self, elapsed: Duration) {
        self.idle_ns
            .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
    }

    /// Time spent sleeping in backoff.
    pub fn record_backoff(&self, elapsed: Duration) {
        self.backoff_ns
            .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
    }

    /// Time spent asking the scheduler for a stage.
    pub fn record_scheduler(&self, elapsed: Duration) {
        self.scheduler_ns
            .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
    }

    /// Returns a snapshot of all counters.
    #[must_use]
    pub fn snapshot(&self) -> WorkerMetricsSnapshot {
        WorkerMetricsSnapshot {
            useful_time: Duration::from_nanos(self.useful_ns.load(Ordering::Relaxed)),
            idle_time: Duration::from_nanos(self.idle_ns.load(Ordering::Relaxed)),
            backoff_time: Duration::from_nanos(self.backoff_ns.load(Ordering::Relaxed)),
            scheduler_time: Duration::from_nanos(self.scheduler_ns.load(Ordering::Relaxed)),
            iterations: self.iterations.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of [`WorkerMetrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WorkerMetricsSnapshot {
    /// Time spent inside `execute`.
    pub useful_time: Duration,
    /// Time spent with no stage assigned.
    pub idle_time: Duration,
    /// Time spent in backoff sleeps.
    pub backoff_time: Duration,
    /// Time spent in the scheduler.
    pub scheduler_time: Duration,
    /// `execute` calls made.
    pub iterations: u64,
}

/// Lifecycle phase of the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunStatus {
    /// `run` has not been called.
    BeforeRun,
    /// Workers are active.
    DuringRun,
    /// All workers have been joined.
    AfterRun,
}

/// Aggregate view of the whole engine.
#[derive(Debug, Clone, Serialize)]
pub struct TopologySummary {
    /// Lifecycle phase.
    pub status: RunStatus,
    /// Live worker threads.
    pub nthreads: usize,
    /// Items consumed by sinks.
    pub events_completed: u64,
    /// Time since `run`.
    pub uptime: Duration,
    /// Sink throughput averaged over the uptime.
    pub avg_throughput_hz: f64,
    /// Sink throughput since the previous measurement.
    pub latest_throughput_hz: f64,
    /// Stages currently Running.
    pub running_stages: usize,
    /// True when no stage is Running.
    pub is_drained: bool,
    /// First failure, if any.
    pub failure: Option<FailureReport>,
}

/// Per-stage view (one row per graph node).
#[derive(Debug, Clone, Serialize)]
pub struct StageSummary {
    /// Stage ID.
    pub id: StageId,
    /// Stage name.
    pub name: String,
    /// Node kind.
    pub kind: StageKind,
    /// Scheduling state.
    pub state: StageState,
    /// Whether multiple workers may run it at once.
    pub is_parallel: bool,
    /// Workers currently assigned.
    pub thread_count: usize,
    /// Immediately-upstream stages currently Running.
    pub running_upstreams: usize,
    /// Work waiting for the stage.
    pub pending: usize,
    /// Capacity threshold.
    pub threshold: usize,
    /// Chunk size knob.
    pub chunksize: usize,
    /// `execute` calls.
    pub invocations: u64,
    /// Items handled.
    pub items_processed: u64,
    /// Wall time inside `execute`.
    pub busy_time: Duration,
    /// Mean time per item.
    pub avg_latency: Duration,
    /// Items per second on the last productive call.
    pub last_throughput_hz: f64,
    /// Times a worker yielded the stage after exhausting backoff.
    pub backoff_exhaustions: u64,
}

/// Per-worker view.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerSummary {
    /// Worker ID.
    pub worker_id: usize,
    /// Locality domain.
    pub location_id: usize,
    /// Stage currently held, if any.
    pub current_stage: Option<StageId>,
    /// Time spent inside `execute`.
    pub useful_time: Duration,
    /// Time spent with no stage.
    pub idle_time: Duration,
    /// Time spent in backoff sleeps.
    pub backoff_time: Duration,
    /// Time spent in the scheduler.
    pub scheduler_time: Duration,
    /// `execute` calls made.
    pub iterations: u64,
    /// Time since the last heartbeat.
    pub heartbeat_age: Duration,
    /// Heartbeat older than the stall threshold.
    pub is_stalled: bool,
}

/// Everything the controller can report in one call.
#[derive(Debug, Clone, Serialize)]
pub struct PerfReport {
    /// Engine-wide summary.
    pub topology: TopologySummary,
    /// One row per stage.
    pub stages: Vec<StageSummary>,
    /// One row per live worker.
    pub workers: Vec<WorkerSummary>,
}

/// Items per second over `elapsed`.
#[must_use]
pub fn rate_hz(count: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 {
        0.0
    } else {
        count as f64 / secs
    }
}
