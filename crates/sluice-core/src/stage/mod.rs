//! # Stage
//!
//! A stage is one node of the dataflow graph. It wraps a unit of work (a
//! [`StageLogic`] body), carries its own tuning knobs and performance
//! counters, and is driven through a state machine by the topology.
//!
//! ## State Machine
//!
//! ```text
//!              activate()               pause()
//!  Unopened ──────────────▶ Running ─────────────▶ Paused
//!     │                      │   ▲                   │
//!     │                      │   └───activate()──────┘
//!     │        finish()      │ finish()              │ finish()
//!     └──────────────────────┴───────────────────────┴──────▶ Finished
//! ```
//!
//! Transitions are performed by [`Topology`](crate::topology::Topology) under
//! the topology lock because activation cascades across the graph. A stage's
//! knobs (chunk size, backoff policy) are guarded by a separate, stage-local
//! lock.
//!
//! ## Node Kinds
//!
//! | Kind | Input | Output |
//! |------|-------|--------|
//! | Source | none | one or more queues |
//! | Interior | one queue | one or more queues |
//! | Sink | one queue | none |
//! | Group | fused chain | fused chain |

mod backoff;

use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;

use crate::config::EngineConfig;
use crate::metrics::StageMetrics;

pub use backoff::{BackoffState, BackoffStrategy};

/// Unique identifier for a stage in the topology (its arena index).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct StageId(pub u32);

impl StageId {
    /// Returns the arena index of this stage.
    #[inline]
    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StageId({})", self.0)
    }
}

/// Classification of a stage within the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum StageKind {
    /// Produces items from an external producer. Has no input queue.
    Source,
    /// Consumes terminal items. Has no output queue.
    Sink,
    /// Consumes from one queue and produces into one or more.
    Interior,
    /// A fused chain of stage bodies scheduled as a single node.
    Group,
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageKind::Source => write!(f, "Source"),
            StageKind::Sink => write!(f, "Sink"),
            StageKind::Interior => write!(f, "Interior"),
            StageKind::Group => write!(f, "Group"),
        }
    }
}

/// Scheduling state of a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum StageState {
    /// Never activated.
    Unopened,
    /// Eligible for execution.
    Running,
    /// Temporarily ineligible; may be re-activated.
    Paused,
    /// Will never produce more output.
    Finished,
}

impl fmt::Display for StageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageState::Unopened => write!(f, "Unopened"),
            StageState::Running => write!(f, "Running"),
            StageState::Paused => write!(f, "Paused"),
            StageState::Finished => write!(f, "Finished"),
        }
    }
}

/// Failure cause reported by a stage.
///
/// Carried by [`ExecutionResult::Error`] and returned by the lifecycle
/// hooks. The cause is flattened into a message so that it can cross
/// thread boundaries and be reported more than once.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct StageError {
    message: String,
}

impl StageError {
    /// Creates an error from a message.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Creates an error from any error value, including its source chain.
    #[must_use]
    pub fn from_error(err: &(dyn std::error::Error + 'static)) -> Self {
        let mut message = err.to_string();
        let mut source = err.source();
        while let Some(cause) = source {
            message.push_str(": ");
            message.push_str(&cause.to_string());
            source = cause.source();
        }
        Self { message }
    }

    /// Creates an error from a caught panic payload.
    #[must_use]
    pub fn from_panic(payload: &(dyn Any + Send)) -> Self {
        let detail = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        Self {
            message: format!("panicked: {detail}"),
        }
    }

    /// Returns the failure message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<std::io::Error> for StageError {
    fn from(err: std::io::Error) -> Self {
        Self::from_error(&err)
    }
}

/// Outcome of a single [`StageLogic::execute`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use]
pub enum ExecutionResult {
    /// Useful work happened; the worker should retry immediately.
    Success,
    /// No input was available or downstream had no capacity; apply backoff.
    ComeBackLater,
    /// This stage will never produce more output.
    Finished,
    /// The stage failed. Must not be retried blindly.
    Error(StageError),
}

impl ExecutionResult {
    /// Returns true if the call made progress.
    #[inline]
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, ExecutionResult::Success)
    }

    /// Returns true if the stage asked to be retried later.
    #[inline]
    #[must_use]
    pub fn is_come_back_later(&self) -> bool {
        matches!(self, ExecutionResult::ComeBackLater)
    }

    /// Returns true if the call failed.
    #[inline]
    #[must_use]
    pub fn is_error(&self) -> bool {
        matches!(self, ExecutionResult::Error(_))
    }

    /// Short label for logs and metrics.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            ExecutionResult::Success => "Success",
            ExecutionResult::ComeBackLater => "ComeBackLater",
            ExecutionResult::Finished => "Finished",
            ExecutionResult::Error(_) => "Error",
        }
    }
}

/// Per-call context handed to [`StageLogic::execute`].
///
/// Identifies the calling worker and its locality domain and collects the
/// number of items the call handled.
#[derive(Debug)]
pub struct StageContext {
    worker_id: usize,
    location_id: usize,
    chunksize: usize,
    items: usize,
}

impl StageContext {
    /// Creates a context for one execution.
    #[must_use]
    pub fn new(worker_id: usize, location_id: usize, chunksize: usize) -> Self {
        Self {
            worker_id,
            location_id,
            chunksize: chunksize.max(1),
            items: 0,
        }
    }

    /// Worker executing the call.
    #[must_use]
    pub fn worker_id(&self) -> usize {
        self.worker_id
    }

    /// Locality domain of the calling worker.
    #[must_use]
    pub fn location_id(&self) -> usize {
        self.location_id
    }

    /// Maximum number of items this call should handle.
    #[must_use]
    pub fn chunksize(&self) -> usize {
        self.chunksize
    }

    /// Records `n` items handled by this call.
    pub fn record_items(&mut self, n: usize) {
        self.items += n;
    }

    /// Items recorded so far.
    #[must_use]
    pub fn items(&self) -> usize {
        self.items
    }
}

/// The single polymorphic capability every stage body implements.
///
/// Bodies are shared between workers (a parallel stage can be executed by
/// several workers at once), so every method takes `&self`; bodies use
/// interior mutability for their own state.
///
/// `initialize` and `finalize` run while the topology lock is held. No
/// worker can be assigned a stage until they return, so slow I/O belongs
/// in `execute`, and hooks must not call back into the topology or the
/// controller.
pub trait StageLogic: Send + Sync {
    /// Called exactly once, at first activation (or belatedly on finish).
    ///
    /// # Errors
    ///
    /// Returns an error if the body cannot start.
    fn initialize(&self) -> Result<(), StageError> {
        Ok(())
    }

    /// Performs up to `ctx.chunksize()` units of work.
    fn execute(&self, ctx: &mut StageContext) -> ExecutionResult;

    /// Called exactly once, on the transition into `Finished`.
    ///
    /// # Errors
    ///
    /// Returns an error if the body cannot shut down cleanly.
    fn finalize(&self) -> Result<(), StageError> {
        Ok(())
    }

    /// Amount of work waiting for this stage.
    fn pending(&self) -> usize {
        0
    }

    /// Capacity threshold used for admission decisions.
    fn threshold(&self) -> usize {
        0
    }

    /// Updates the capacity threshold.
    fn set_threshold(&self, _threshold: usize) {}
}

/// Tuning knobs of a stage, guarded by the stage-local lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageKnobs {
    /// Number of items handled per `execute` call.
    pub chunksize: usize,
    /// Backoff growth policy on `ComeBackLater`.
    pub backoff_strategy: BackoffStrategy,
    /// First backoff wait.
    pub initial_backoff: Duration,
    /// Upper bound on any single wait; the worker re-polls at least this often.
    pub checkin_time: Duration,
    /// Consecutive backoff escalations before the stage is yielded.
    pub backoff_tries: u32,
}

impl Default for StageKnobs {
    fn default() -> Self {
        Self {
            chunksize: 1,
            backoff_strategy: BackoffStrategy::Exponential,
            initial_backoff: Duration::from_micros(1),
            checkin_time: Duration::from_millis(500),
            backoff_tries: 4,
        }
    }
}

impl StageKnobs {
    /// Knobs taken from the engine-wide defaults.
    #[must_use]
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            chunksize: config.chunksize,
            backoff_strategy: config.backoff_strategy,
            initial_backoff: config.initial_backoff,
            checkin_time: config.checkin_time,
            backoff_tries: config.backoff_tries,
        }
    }
}

/// Lifecycle hook selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Hook {
    Initialize,
    Finalize,
}

impl fmt::Display for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Hook::Initialize => write!(f, "initialize"),
            Hook::Finalize => write!(f, "finalize"),
        }
    }
}

/// A graph node: identity, knobs, body and counters.
///
/// Scheduling status (state, thread count, running upstreams, listeners)
/// lives in the topology, not here.
pub struct StageNode {
    id: StageId,
    name: String,
    kind: StageKind,
    is_parallel: bool,
    knobs: Mutex<StageKnobs>,
    logic: Box<dyn StageLogic>,
    metrics: StageMetrics,
}

impl fmt::Debug for StageNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageNode")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("is_parallel", &self.is_parallel)
            .field("knobs", &self.knobs())
            .finish_non_exhaustive()
    }
}

impl StageNode {
    pub(crate) fn new(
        id: StageId,
        name: String,
        kind: StageKind,
        is_parallel: bool,
        logic: Box<dyn StageLogic>,
    ) -> Self {
        Self {
            id,
            name,
            kind,
            is_parallel,
            knobs: Mutex::new(StageKnobs::default()),
            logic,
            metrics: StageMetrics::new(),
        }
    }

    /// Returns the stage ID.
    #[must_use]
    pub fn id(&self) -> StageId {
        self.id
    }

    /// Returns the stage name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the node kind.
    #[must_use]
    pub fn kind(&self) -> StageKind {
        self.kind
    }

    /// Whether several workers may execute this stage at once.
    #[must_use]
    pub fn is_parallel(&self) -> bool {
        self.is_parallel
    }

    /// Returns a copy of the current knobs.
    #[must_use]
    pub fn knobs(&self) -> StageKnobs {
        *self.knobs.lock()
    }

    /// Replaces all knobs at once.
    pub fn set_knobs(&self, knobs: StageKnobs) {
        *self.knobs.lock() = knobs;
    }

    /// Returns the chunk size.
    #[must_use]
    pub fn chunksize(&self) -> usize {
        self.knobs.lock().chunksize
    }

    /// Sets the chunk size (clamped to at least 1).
    pub fn set_chunksize(&self, chunksize: usize) {
        self.knobs.lock().chunksize = chunksize.max(1);
    }

    /// Returns the backoff strategy.
    #[must_use]
    pub fn backoff_strategy(&self) -> BackoffStrategy {
        self.knobs.lock().backoff_strategy
    }

    /// Sets the backoff strategy.
    pub fn set_backoff_strategy(&self, strategy: BackoffStrategy) {
        self.knobs.lock().backoff_strategy = strategy;
    }

    /// Returns the initial backoff time.
    #[must_use]
    pub fn initial_backoff_time(&self) -> Duration {
        self.knobs.lock().initial_backoff
    }

    /// Sets the initial backoff time.
    pub fn set_initial_backoff_time(&self, initial: Duration) {
        self.knobs.lock().initial_backoff = initial;
    }

    /// Returns the check-in time.
    #[must_use]
    pub fn checkin_time(&self) -> Duration {
        self.knobs.lock().checkin_time
    }

    /// Sets the check-in time.
    pub fn set_checkin_time(&self, checkin: Duration) {
        self.knobs.lock().checkin_time = checkin;
    }

    /// Returns the maximum number of backoff escalations.
    #[must_use]
    pub fn backoff_tries(&self) -> u32 {
        self.knobs.lock().backoff_tries
    }

    /// Sets the maximum number of backoff escalations.
    pub fn set_backoff_tries(&self, tries: u32) {
        self.knobs.lock().backoff_tries = tries;
    }

    /// Returns the performance counters.
    #[must_use]
    pub fn metrics(&self) -> &StageMetrics {
        &self.metrics
    }

    /// Work waiting for this stage.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.logic.pending()
    }

    /// Capacity threshold of this stage.
    #[must_use]
    pub fn threshold(&self) -> usize {
        self.logic.threshold()
    }

    /// Updates the capacity threshold of this stage.
    pub fn set_threshold(&self, threshold: usize) {
        self.logic.set_threshold(threshold);
    }

    /// Executes one call of the body and records its metrics.
    ///
    /// A panic inside the body is caught and reported as
    /// [`ExecutionResult::Error`].
    pub fn execute(&self, ctx: &mut StageContext) -> ExecutionResult {
        let start = Instant::now();
        let result = catch_unwind(AssertUnwindSafe(|| self.logic.execute(ctx)))
            .unwrap_or_else(|payload| ExecutionResult::Error(StageError::from_panic(&*payload)));
        self.metrics.record_execution(&result, ctx.items(), start.elapsed());
        result
    }

    /// Runs a lifecycle hook, converting panics into errors.
    pub(crate) fn run_hook(&self, hook: Hook) -> Result<(), StageError> {
        tracing::debug!("Stage '{}': running {hook}", self.name);
        let outcome = catch_unwind(AssertUnwindSafe(|| match hook {
            Hook::Initialize => self.logic.initialize(),
            Hook::Finalize => self.logic.finalize(),
        }));
        match outcome {
            Ok(result) => result,
            Err(payload) => Err(StageError::from_panic(&*payload)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Counting {
        calls: Arc<AtomicUsize>,
    }

    impl StageLogic for Counting {
        fn execute(&self, ctx: &mut StageContext) -> ExecutionResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            ctx.record_items(ctx.chunksize());
            ExecutionResult::Success
        }
    }

    struct Panicking;

    impl StageLogic for Panicking {
        fn execute(&self, _ctx: &mut StageContext) -> ExecutionResult {
            panic!("boom");
        }

        fn finalize(&self) -> Result<(), StageError> {
            panic!("finalize boom");
        }
    }

    fn node(logic: Box<dyn StageLogic>) -> StageNode {
        StageNode::new(StageId(0), "test".to_string(), StageKind::Interior, true, logic)
    }

    #[test]
    fn test_default_knobs() {
        let knobs = StageKnobs::default();
        assert_eq!(knobs.chunksize, 1);
        assert_eq!(knobs.backoff_strategy, BackoffStrategy::Exponential);
        assert_eq!(knobs.initial_backoff, Duration::from_micros(1));
        assert_eq!(knobs.checkin_time, Duration::from_millis(500));
        assert_eq!(knobs.backoff_tries, 4);
    }

    #[test]
    fn test_knob_setters() {
        let stage = node(Box::new(Panicking));
        stage.set_chunksize(0);
        assert_eq!(stage.chunksize(), 1);
        stage.set_chunksize(16);
        stage.set_backoff_strategy(BackoffStrategy::Linear);
        stage.set_initial_backoff_time(Duration::from_millis(2));
        stage.set_checkin_time(Duration::from_millis(20));
        stage.set_backoff_tries(7);

        let knobs = stage.knobs();
        assert_eq!(knobs.chunksize, 16);
        assert_eq!(knobs.backoff_strategy, BackoffStrategy::Linear);
        assert_eq!(knobs.initial_backoff, Duration::from_millis(2));
        assert_eq!(knobs.checkin_time, Duration::from_millis(20));
        assert_eq!(knobs.backoff_tries, 7);
    }

    #[test]
    fn test_execute_records_metrics() {
        let calls = Arc::new(AtomicUsize::new(0));
        let stage = node(Box::new(Counting {
            calls: Arc::clone(&calls),
        }));

        let mut ctx = StageContext::new(0, 0, 4);
        assert!(stage.execute(&mut ctx).is_success());
        let mut ctx = StageContext::new(1, 0, 4);
        assert!(stage.execute(&mut ctx).is_success());

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        let snapshot = stage.metrics().snapshot();
        assert_eq!(snapshot.invocations, 2);
        assert_eq!(snapshot.items_processed, 8);
        assert_eq!(snapshot.successes, 2);
    }

    #[test]
    fn test_execute_catches_panic() {
        let stage = node(Box::new(Panicking));
        let mut ctx = StageContext::new(0, 0, 1);
        match stage.execute(&mut ctx) {
            ExecutionResult::Error(e) => assert_eq!(e.message(), "panicked: boom"),
            other => panic!("expected error, got {other:?}"),
        }
        assert_eq!(stage.metrics().snapshot().errors, 1);
    }

    #[test]
    fn test_hook_catches_panic() {
        let stage = node(Box::new(Panicking));
        assert!(stage.run_hook(Hook::Initialize).is_ok());
        let err = stage.run_hook(Hook::Finalize).unwrap_err();
        assert_eq!(err.message(), "panicked: finalize boom");
    }

    #[test]
    fn test_stage_error_chain() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk gone");
        let err = StageError::from(io);
        assert_eq!(err.to_string(), "disk gone");
    }

    #[test]
    fn test_display() {
        assert_eq!(StageKind::Group.to_string(), "Group");
        assert_eq!(StageState::Paused.to_string(), "Paused");
        assert_eq!(StageId(3).to_string(), "StageId(3)");
        assert_eq!(ExecutionResult::ComeBackLater.label(), "ComeBackLater");
    }
}
