//! # Topology
//!
//! The dataflow graph: an arena of stages and queues, the distinguished
//! source and sink lists, and the graph-wide scheduling status guarded by a
//! single topology lock.
//!
//! ## Ownership
//!
//! The topology owns every [`StageNode`] and every queue. Edges are stored
//! as [`StageId`] indices into the arena (listener and upstream lists), so
//! cascades are index walks with an explicit worklist and never recurse.
//!
//! ## Lifecycle Cascades
//!
//! ```text
//!   activate(source) ──▶ Running ──▶ listeners.running_upstreams += 1
//!                                    └─▶ activate(listener) ...
//!
//!   finish(source) ─────▶ Finished ─▶ listeners.running_upstreams -= 1
//!                                    └─▶ settle(listener) ...
//! ```
//!
//! A Running non-source stage is *settled* when no upstream is Running, no
//! worker holds it or any of its upstreams, and it has no pending work. A
//! settled stage is finished if all its upstreams are Finished, otherwise
//! paused. Settling is re-evaluated whenever a worker releases a stage and
//! whenever a stage leaves the Running state, and propagates downstream.
//!
//! ## Invariants
//!
//! - The running counter equals the number of stages in state Running
//! - `running_upstreams` of a stage equals the number of its upstreams in
//!   state Running
//! - `initialize` runs exactly once before `finalize`, which runs exactly
//!   once, and never while a worker is executing the stage
//! - Both hooks run under the topology lock, which stalls scheduling for
//!   their duration

mod error;

pub use error::TopologyError;

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use fxhash::{FxHashMap, FxHashSet};
use parking_lot::{Condvar, Mutex, MutexGuard};
use serde::Serialize;
use smallvec::SmallVec;

use crate::config::EngineConfig;
use crate::metrics::StageSummary;
use crate::queue::{QueueHandle, StageQueue};
use crate::stage::{
    ExecutionResult, Hook, StageId, StageKind, StageKnobs, StageLogic, StageNode, StageState,
};

/// A stage failure, attributed to the worker and locality that observed it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailureReport {
    /// Failing stage.
    pub stage: StageId,
    /// Name of the failing stage.
    pub stage_name: String,
    /// Worker that observed the failure (`None` for control-thread calls).
    pub worker_id: Option<usize>,
    /// Locality domain of that worker.
    pub location_id: Option<usize>,
    /// Failure message.
    pub message: String,
}

impl fmt::Display for FailureReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stage '{}' failed", self.stage_name)?;
        if let (Some(worker), Some(location)) = (self.worker_id, self.location_id) {
            write!(f, " on worker {worker} (location {location})")?;
        }
        write!(f, ": {}", self.message)
    }
}

/// Worker on whose behalf a scheduling operation runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Caller {
    pub(crate) worker_id: usize,
    pub(crate) location_id: usize,
}

/// Who released a stage last, and why.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct YieldRecord {
    pub(crate) worker_id: usize,
    pub(crate) backed_off: bool,
}

/// Graph-global scheduling status of one stage.
#[derive(Debug)]
pub(crate) struct StageStatus {
    pub(crate) state: StageState,
    pub(crate) thread_count: usize,
    pub(crate) running_upstreams: usize,
    pub(crate) listeners: SmallVec<[StageId; 4]>,
    pub(crate) upstreams: SmallVec<[StageId; 4]>,
    pub(crate) is_source: bool,
    initialized: bool,
    finalize_pending: bool,
    pub(crate) last_picked: u64,
    pub(crate) last_yield: Option<YieldRecord>,
}

impl StageStatus {
    fn new() -> Self {
        Self {
            state: StageState::Unopened,
            thread_count: 0,
            running_upstreams: 0,
            listeners: SmallVec::new(),
            upstreams: SmallVec::new(),
            is_source: false,
            initialized: false,
            finalize_pending: false,
            last_picked: 0,
            last_yield: None,
        }
    }
}

/// Everything guarded by the topology lock.
#[derive(Debug, Default)]
pub(crate) struct SchedState {
    pub(crate) stages: Vec<StageStatus>,
    /// Scheduling clock, advanced on every assignment.
    pub(crate) tick: u64,
    /// Consecutive sticky assignments per worker.
    pub(crate) streaks: FxHashMap<usize, u32>,
    pub(crate) failure: Option<FailureReport>,
}

/// The dataflow graph and its scheduling status.
///
/// Built with `&mut self` methods, then shared (usually behind an `Arc`)
/// with the scheduler and workers, which drive it through `&self`.
pub struct Topology {
    nodes: Vec<StageNode>,
    names: FxHashMap<String, StageId>,
    queues: Vec<Arc<dyn QueueHandle>>,
    queue_names: FxHashMap<String, usize>,
    sources: Vec<StageId>,
    sinks: Vec<StageId>,
    sched: Mutex<SchedState>,
    running: AtomicUsize,
    drained: Condvar,
}

impl fmt::Debug for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Topology")
            .field("stages", &self.nodes.len())
            .field("queues", &self.queues.len())
            .field("sources", &self.sources)
            .field("sinks", &self.sinks)
            .field("running", &self.running_count())
            .finish_non_exhaustive()
    }
}

impl Default for Topology {
    fn default() -> Self {
        Self::new()
    }
}

impl Topology {
    /// Creates an empty topology.
    #[must_use]
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            names: FxHashMap::default(),
            queues: Vec::new(),
            queue_names: FxHashMap::default(),
            sources: Vec::new(),
            sinks: Vec::new(),
            sched: Mutex::new(SchedState::default()),
            running: AtomicUsize::new(0),
            drained: Condvar::new(),
        }
    }

    // ---- construction ----------------------------------------------------

    /// Adds a stage and returns its ID.
    ///
    /// # Errors
    ///
    /// Returns [`TopologyError::DuplicateStage`] if the name is taken.
    pub fn add_stage<L>(
        &mut self,
        name: impl Into<String>,
        kind: StageKind,
        is_parallel: bool,
        logic: L,
    ) -> Result<StageId, TopologyError>
    where
        L: StageLogic + 'static,
    {
        self.add_boxed_stage(name, kind, is_parallel, Box::new(logic))
    }

    /// Adds a stage from an already boxed body.
    ///
    /// # Errors
    ///
    /// Returns [`TopologyError::DuplicateStage`] if the name is taken.
    #[allow(clippy::cast_possible_truncation)]
    pub fn add_boxed_stage(
        &mut self,
        name: impl Into<String>,
        kind: StageKind,
        is_parallel: bool,
        logic: Box<dyn StageLogic>,
    ) -> Result<StageId, TopologyError> {
        let name = name.into();
        if self.names.contains_key(&name) {
            return Err(TopologyError::DuplicateStage(name));
        }
        let id = StageId(self.nodes.len() as u32);
        self.names.insert(name.clone(), id);
        self.nodes
            .push(StageNode::new(id, name, kind, is_parallel, logic));
        self.sched.get_mut().stages.push(StageStatus::new());
        Ok(id)
    }

    /// Adds a bounded queue and returns a shared handle to it.
    ///
    /// # Errors
    ///
    /// Returns [`TopologyError::DuplicateQueue`] if the name is taken.
    pub fn add_queue<T: Send + 'static>(
        &mut self,
        name: impl Into<String>,
        threshold: usize,
    ) -> Result<Arc<StageQueue<T>>, TopologyError> {
        let name = name.into();
        let queue = Arc::new(StageQueue::bounded(name.clone(), threshold));
        let handle: Arc<dyn QueueHandle> = queue.clone();
        self.register_queue(name, handle)?;
        Ok(queue)
    }

    /// Adds a queue without a capacity limit.
    ///
    /// # Errors
    ///
    /// Returns [`TopologyError::DuplicateQueue`] if the name is taken.
    pub fn add_unbounded_queue<T: Send + 'static>(
        &mut self,
        name: impl Into<String>,
    ) -> Result<Arc<StageQueue<T>>, TopologyError> {
        let name = name.into();
        let queue = Arc::new(StageQueue::unbounded(name.clone()));
        let handle: Arc<dyn QueueHandle> = queue.clone();
        self.register_queue(name, handle)?;
        Ok(queue)
    }

    fn register_queue(
        &mut self,
        name: String,
        queue: Arc<dyn QueueHandle>,
    ) -> Result<(), TopologyError> {
        if self.queue_names.contains_key(&name) {
            return Err(TopologyError::DuplicateQueue(name));
        }
        self.queue_names.insert(name, self.queues.len());
        self.queues.push(queue);
        Ok(())
    }

    /// Registers `downstream` as a listener of `upstream`.
    ///
    /// Connecting the same pair twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if either stage does not exist or the two are the
    /// same stage.
    pub fn connect(&mut self, upstream: StageId, downstream: StageId) -> Result<(), TopologyError> {
        self.check(upstream)?;
        self.check(downstream)?;
        if upstream == downstream {
            return Err(TopologyError::SelfLoop(
                self.nodes[upstream.index()].name().to_string(),
            ));
        }
        let st = self.sched.get_mut();
        if st.stages[upstream.index()].listeners.contains(&downstream) {
            return Ok(());
        }
        st.stages[upstream.index()].listeners.push(downstream);
        st.stages[downstream.index()].upstreams.push(upstream);
        Ok(())
    }

    /// Marks a stage as a source.
    ///
    /// # Errors
    ///
    /// Returns [`TopologyError::StageNotFound`] if the stage does not exist.
    pub fn mark_source(&mut self, id: StageId) -> Result<(), TopologyError> {
        self.check(id)?;
        if !self.sources.contains(&id) {
            self.sources.push(id);
            self.sched.get_mut().stages[id.index()].is_source = true;
        }
        Ok(())
    }

    /// Marks a stage as a sink.
    ///
    /// # Errors
    ///
    /// Returns [`TopologyError::StageNotFound`] if the stage does not exist.
    pub fn mark_sink(&mut self, id: StageId) -> Result<(), TopologyError> {
        self.check(id)?;
        if !self.sinks.contains(&id) {
            self.sinks.push(id);
        }
        Ok(())
    }

    /// Checks that the topology can be run.
    ///
    /// # Errors
    ///
    /// Returns an error if there are no stages or no sources.
    pub fn validate(&self) -> Result<(), TopologyError> {
        if self.nodes.is_empty() {
            return Err(TopologyError::EmptyTopology);
        }
        if self.sources.is_empty() {
            return Err(TopologyError::NoSources);
        }
        Ok(())
    }

    /// Applies the engine-wide stage defaults to every stage.
    pub fn apply_defaults(&self, config: &EngineConfig) {
        let knobs = StageKnobs::from_config(config);
        for node in &self.nodes {
            node.set_knobs(knobs);
        }
    }

    // ---- inspection ------------------------------------------------------

    /// Number of stages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if there are no stages.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Returns a stage by ID.
    ///
    /// # Errors
    ///
    /// Returns [`TopologyError::StageNotFound`] if the stage does not exist.
    pub fn stage(&self, id: StageId) -> Result<&StageNode, TopologyError> {
        self.nodes
            .get(id.index())
            .ok_or(TopologyError::StageNotFound(id))
    }

    /// Looks a stage up by name.
    #[must_use]
    pub fn stage_id(&self, name: &str) -> Option<StageId> {
        self.names.get(name).copied()
    }

    /// Iterates over all stages in insertion order.
    pub fn stages(&self) -> impl Iterator<Item = &StageNode> {
        self.nodes.iter()
    }

    /// Source stages.
    #[must_use]
    pub fn sources(&self) -> &[StageId] {
        &self.sources
    }

    /// Sink stages.
    #[must_use]
    pub fn sinks(&self) -> &[StageId] {
        &self.sinks
    }

    /// Returns a queue by name.
    ///
    /// # Errors
    ///
    /// Returns [`TopologyError::QueueNotFound`] if no queue has that name.
    pub fn queue(&self, name: &str) -> Result<&Arc<dyn QueueHandle>, TopologyError> {
        self.queue_names
            .get(name)
            .map(|&i| &self.queues[i])
            .ok_or_else(|| TopologyError::QueueNotFound(name.to_string()))
    }

    /// Iterates over all queues in insertion order.
    pub fn queues(&self) -> impl Iterator<Item = &Arc<dyn QueueHandle>> {
        self.queues.iter()
    }

    /// Items resident in all queues.
    #[must_use]
    pub fn queued_items(&self) -> usize {
        self.queues.iter().map(|q| q.len()).sum()
    }

    /// Listeners of a stage.
    ///
    /// # Errors
    ///
    /// Returns [`TopologyError::StageNotFound`] if the stage does not exist.
    pub fn listeners(&self, id: StageId) -> Result<Vec<StageId>, TopologyError> {
        self.check(id)?;
        Ok(self.sched.lock().stages[id.index()].listeners.to_vec())
    }

    /// Current state of a stage.
    ///
    /// # Errors
    ///
    /// Returns [`TopologyError::StageNotFound`] if the stage does not exist.
    pub fn state(&self, id: StageId) -> Result<StageState, TopologyError> {
        self.check(id)?;
        Ok(self.sched.lock().stages[id.index()].state)
    }

    /// Number of workers currently holding a stage.
    ///
    /// # Errors
    ///
    /// Returns [`TopologyError::StageNotFound`] if the stage does not exist.
    pub fn thread_count(&self, id: StageId) -> Result<usize, TopologyError> {
        self.check(id)?;
        Ok(self.sched.lock().stages[id.index()].thread_count)
    }

    /// Number of immediate upstreams of a stage that are Running.
    ///
    /// # Errors
    ///
    /// Returns [`TopologyError::StageNotFound`] if the stage does not exist.
    pub fn running_upstreams(&self, id: StageId) -> Result<usize, TopologyError> {
        self.check(id)?;
        Ok(self.sched.lock().stages[id.index()].running_upstreams)
    }

    /// Number of stages in state Running.
    #[must_use]
    pub fn running_count(&self) -> usize {
        self.running.load(Ordering::Acquire)
    }

    /// True iff no stage is Running.
    #[must_use]
    pub fn is_drained(&self) -> bool {
        self.running_count() == 0
    }

    /// True iff every stage is Finished.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.sched
            .lock()
            .stages
            .iter()
            .all(|s| s.state == StageState::Finished)
    }

    /// Items consumed by all sinks so far.
    #[must_use]
    pub fn sink_items(&self) -> u64 {
        self.sinks
            .iter()
            .map(|id| self.nodes[id.index()].metrics().items_processed())
            .sum()
    }

    /// First failure recorded, if any.
    #[must_use]
    pub fn failure(&self) -> Option<FailureReport> {
        self.sched.lock().failure.clone()
    }

    /// Records a failure. Only the first one is kept.
    ///
    /// Returns true if this was the first failure.
    pub fn record_failure(&self, report: FailureReport) -> bool {
        let mut st = self.sched.lock();
        self.record_failure_locked(&mut st, report)
    }

    /// Blocks until the topology is drained or a failure is recorded.
    ///
    /// Returns false if `timeout` elapsed first.
    pub fn wait_drained(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut st = self.sched.lock();
        loop {
            if self.is_drained() || st.failure.is_some() {
                return true;
            }
            match deadline {
                None => self.drained.wait(&mut st),
                Some(deadline) => {
                    if self.drained.wait_until(&mut st, deadline).timed_out() {
                        return self.is_drained() || st.failure.is_some();
                    }
                }
            }
        }
    }

    /// One summary row per stage.
    #[must_use]
    pub fn stage_summaries(&self) -> Vec<StageSummary> {
        let st = self.sched.lock();
        self.nodes
            .iter()
            .zip(&st.stages)
            .map(|(node, status)| {
                let metrics = node.metrics().snapshot();
                StageSummary {
                    id: node.id(),
                    name: node.name().to_string(),
                    kind: node.kind(),
                    state: status.state,
                    is_parallel: node.is_parallel(),
                    thread_count: status.thread_count,
                    running_upstreams: status.running_upstreams,
                    pending: node.pending(),
                    threshold: node.threshold(),
                    chunksize: node.chunksize(),
                    invocations: metrics.invocations,
                    items_processed: metrics.items_processed,
                    busy_time: metrics.busy_time,
                    avg_latency: metrics.avg_latency(),
                    last_throughput_hz: metrics.last_throughput_hz,
                    backoff_exhaustions: metrics.backoff_exhaustions,
                }
            })
            .collect()
    }

    // ---- lifecycle -------------------------------------------------------

    /// Activates a stage and, transitively, everything downstream of it.
    ///
    /// # Errors
    ///
    /// Returns an error if the stage does not exist or an `initialize` hook
    /// failed. State transitions are applied even when a hook fails.
    pub fn activate(&self, id: StageId) -> Result<(), TopologyError> {
        self.check(id)?;
        let mut st = self.sched.lock();
        self.activate_locked(&mut st, id, None)
    }

    /// Activates every source, cascading through the graph.
    ///
    /// # Errors
    ///
    /// Returns the first `initialize` failure.
    pub fn activate_all(&self) -> Result<(), TopologyError> {
        let mut st = self.sched.lock();
        let mut first_err = None;
        for &id in &self.sources {
            if let Err(e) = self.activate_locked(&mut st, id, None) {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Pauses a Running stage. Listeners are settled, not paused directly.
    ///
    /// # Errors
    ///
    /// Returns an error if the stage does not exist or settling a listener
    /// ran a failing hook.
    pub fn pause(&self, id: StageId) -> Result<(), TopologyError> {
        self.check(id)?;
        let mut st = self.sched.lock();
        self.pause_locked(&mut st, id);
        self.settle_locked(&mut st, &[id], None)
    }

    /// Drives a stage to Finished and settles everything downstream.
    ///
    /// # Errors
    ///
    /// Returns an error if the stage does not exist or a hook failed.
    pub fn finish(&self, id: StageId) -> Result<(), TopologyError> {
        self.check(id)?;
        let mut st = self.sched.lock();
        let finished = self.finish_locked(&mut st, id, None);
        let settled = self.settle_locked(&mut st, &[id], None);
        finished.and(settled)
    }

    /// Finishes every source and settles everything downstream.
    ///
    /// # Errors
    ///
    /// Returns the first hook failure.
    pub fn finish_sources(&self) -> Result<(), TopologyError> {
        let mut st = self.sched.lock();
        let mut first_err = None;
        for &id in &self.sources {
            if let Err(e) = self.finish_locked(&mut st, id, None) {
                first_err.get_or_insert(e);
            }
        }
        if let Err(e) = self.settle_locked(&mut st, &self.sources, None) {
            first_err.get_or_insert(e);
        }
        first_err.map_or(Ok(()), Err)
    }

    // ---- crate-internal, lock held -----------------------------------------

    pub(crate) fn lock(&self) -> MutexGuard<'_, SchedState> {
        self.sched.lock()
    }

    pub(crate) fn node(&self, id: StageId) -> &StageNode {
        &self.nodes[id.index()]
    }

    fn check(&self, id: StageId) -> Result<(), TopologyError> {
        if id.index() < self.nodes.len() {
            Ok(())
        } else {
            Err(TopologyError::StageNotFound(id))
        }
    }

    fn record_failure_locked(&self, st: &mut SchedState, report: FailureReport) -> bool {
        if st.failure.is_some() {
            return false;
        }
        tracing::error!("{report}");
        st.failure = Some(report);
        self.drained.notify_all();
        true
    }

    fn run_hook_locked(
        &self,
        st: &mut SchedState,
        id: StageId,
        hook: Hook,
        caller: Option<Caller>,
    ) -> Result<(), TopologyError> {
        let node = &self.nodes[id.index()];
        node.run_hook(hook).map_err(|e| {
            self.record_failure_locked(
                st,
                FailureReport {
                    stage: id,
                    stage_name: node.name().to_string(),
                    worker_id: caller.map(|c| c.worker_id),
                    location_id: caller.map(|c| c.location_id),
                    message: format!("{hook} failed: {}", e.message()),
                },
            );
            TopologyError::HookFailed {
                stage: node.name().to_string(),
                hook: hook.to_string(),
                message: e.message().to_string(),
            }
        })
    }

    /// Bookkeeping for a stage leaving the Running state.
    fn leave_running(&self, st: &mut SchedState, id: StageId) {
        for i in 0..st.stages[id.index()].listeners.len() {
            let listener = st.stages[id.index()].listeners[i];
            let status = &mut st.stages[listener.index()];
            status.running_upstreams = status.running_upstreams.saturating_sub(1);
        }
        if self.running.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.drained.notify_all();
        }
    }

    pub(crate) fn activate_locked(
        &self,
        st: &mut SchedState,
        id: StageId,
        caller: Option<Caller>,
    ) -> Result<(), TopologyError> {
        let mut first_err = None;
        let mut work: SmallVec<[StageId; 8]> = SmallVec::new();
        work.push(id);

        while let Some(current) = work.pop() {
            let status = &mut st.stages[current.index()];
            if matches!(status.state, StageState::Running | StageState::Finished) {
                continue;
            }
            let first_activation = !status.initialized;
            status.initialized = true;
            status.state = StageState::Running;
            self.running.fetch_add(1, Ordering::AcqRel);

            for i in 0..st.stages[current.index()].listeners.len() {
                let listener = st.stages[current.index()].listeners[i];
                st.stages[listener.index()].running_upstreams += 1;
                work.push(listener);
            }
            tracing::info!("Stage '{}' is Running", self.nodes[current.index()].name());

            if first_activation {
                if let Err(e) = self.run_hook_locked(st, current, Hook::Initialize, caller) {
                    first_err.get_or_insert(e);
                }
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    pub(crate) fn pause_locked(&self, st: &mut SchedState, id: StageId) {
        if st.stages[id.index()].state != StageState::Running {
            return;
        }
        st.stages[id.index()].state = StageState::Paused;
        self.leave_running(st, id);
        tracing::info!("Stage '{}' is Paused", self.nodes[id.index()].name());
    }

    pub(crate) fn finish_locked(
        &self,
        st: &mut SchedState,
        id: StageId,
        caller: Option<Caller>,
    ) -> Result<(), TopologyError> {
        let previous = st.stages[id.index()].state;
        if previous == StageState::Finished {
            return Ok(());
        }
        let mut first_err = None;

        if !st.stages[id.index()].initialized {
            st.stages[id.index()].initialized = true;
            if let Err(e) = self.run_hook_locked(st, id, Hook::Initialize, caller) {
                first_err.get_or_insert(e);
            }
        }
        st.stages[id.index()].state = StageState::Finished;
        if previous == StageState::Running {
            self.leave_running(st, id);
        }
        tracing::info!("Stage '{}' is Finished", self.nodes[id.index()].name());

        if st.stages[id.index()].thread_count > 0 {
            // Finalized by the last worker to release it.
            st.stages[id.index()].finalize_pending = true;
        } else if let Err(e) = self.run_hook_locked(st, id, Hook::Finalize, caller) {
            first_err.get_or_insert(e);
        }
        first_err.map_or(Ok(()), Err)
    }

    /// A worker gives a stage back, reporting the result of its last call.
    pub(crate) fn release_locked(
        &self,
        st: &mut SchedState,
        id: StageId,
        caller: Caller,
        result: Option<&ExecutionResult>,
    ) -> Result<(), TopologyError> {
        let mut first_err = None;
        {
            let status = &mut st.stages[id.index()];
            status.thread_count = status.thread_count.saturating_sub(1);
            status.last_yield = Some(YieldRecord {
                worker_id: caller.worker_id,
                backed_off: matches!(result, Some(ExecutionResult::ComeBackLater)),
            });
        }

        if matches!(result, Some(ExecutionResult::Finished)) {
            if let Err(e) = self.finish_locked(st, id, Some(caller)) {
                first_err.get_or_insert(e);
            }
        }

        let status = &mut st.stages[id.index()];
        if status.thread_count == 0 && status.finalize_pending {
            status.finalize_pending = false;
            if let Err(e) = self.run_hook_locked(st, id, Hook::Finalize, Some(caller)) {
                first_err.get_or_insert(e);
            }
        }

        if let Err(e) = self.settle_locked(st, &[id], Some(caller)) {
            first_err.get_or_insert(e);
        }
        first_err.map_or(Ok(()), Err)
    }

    /// True if a Running non-source stage has no work and cannot be fed:
    /// no upstream is Running or held and nothing is pending.
    pub(crate) fn inputs_exhausted(&self, st: &SchedState, id: StageId) -> bool {
        let status = &st.stages[id.index()];
        status.state == StageState::Running
            && !status.is_source
            && status.running_upstreams == 0
            && status
                .upstreams
                .iter()
                .all(|u| st.stages[u.index()].thread_count == 0)
            && self.nodes[id.index()].pending() == 0
    }

    pub(crate) fn is_settled(&self, st: &SchedState, id: StageId) -> bool {
        st.stages[id.index()].thread_count == 0 && self.inputs_exhausted(st, id)
    }

    /// Pauses or finishes settled stages, starting at `start` and walking
    /// downstream through every stage that changed state.
    pub(crate) fn settle_locked(
        &self,
        st: &mut SchedState,
        start: &[StageId],
        caller: Option<Caller>,
    ) -> Result<(), TopologyError> {
        let mut first_err = None;
        let mut visited = FxHashSet::default();
        let mut work: SmallVec<[StageId; 8]> = start.iter().copied().collect();

        while let Some(id) = work.pop() {
            if !visited.insert(id) {
                continue;
            }
            let state = st.stages[id.index()].state;
            let propagate = match state {
                StageState::Running if self.is_settled(st, id) => {
                    let upstreams_finished = st.stages[id.index()]
                        .upstreams
                        .iter()
                        .all(|u| st.stages[u.index()].state == StageState::Finished);
                    if upstreams_finished {
                        if let Err(e) = self.finish_locked(st, id, caller) {
                            first_err.get_or_insert(e);
                        }
                    } else {
                        self.pause_locked(st, id);
                    }
                    true
                }
                StageState::Paused | StageState::Finished => true,
                StageState::Running | StageState::Unopened => false,
            };
            if propagate {
                work.extend(st.stages[id.index()].listeners.iter().copied());
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}
