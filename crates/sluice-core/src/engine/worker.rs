//! Worker threads.
//!
//! Each worker loops: ask the scheduler for a stage, execute it (backing off
//! while it reports `ComeBackLater`), hand the result back, repeat. A worker
//! exits when it is retired, when a failure is recorded, or when no stage is
//! eligible after a stop request or once every stage has finished.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::metrics::{WorkerMetrics, WorkerSummary};
use crate::stage::{BackoffState, ExecutionResult, StageContext, StageId, StageState};
use crate::topology::{FailureReport, Topology};

use super::{ControllerError, Scheduler};

const NO_STAGE: u64 = u64::MAX;

/// State shared by every worker of one controller.
pub(crate) struct RunContext {
    pub(crate) topology: Arc<Topology>,
    pub(crate) scheduler: Scheduler,
    stop_requested: AtomicBool,
    checkin: Duration,
    epoch: Instant,
}

impl RunContext {
    pub(crate) fn new(topology: Arc<Topology>, scheduler: Scheduler, checkin: Duration) -> Self {
        Self {
            topology,
            scheduler,
            stop_requested: AtomicBool::new(false),
            checkin,
            epoch: Instant::now(),
        }
    }

    pub(crate) fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::Acquire)
    }

    /// Finishes the sources and lets the rest of the graph drain.
    pub(crate) fn request_stop(&self) {
        if self.stop_requested.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!("Stop requested");
        if let Err(e) = self.topology.finish_sources() {
            tracing::warn!("Finishing sources during stop: {e}");
        }
        self.scheduler.wake_idle();
    }

    #[allow(clippy::cast_possible_truncation)]
    fn now_ns(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }
}

/// Per-worker state visible to the controller.
pub(crate) struct WorkerShared {
    worker_id: usize,
    location_id: usize,
    retire: AtomicBool,
    heartbeat_ns: AtomicU64,
    current_stage: AtomicU64,
    metrics: WorkerMetrics,
}

impl WorkerShared {
    fn new(worker_id: usize, location_id: usize, now_ns: u64) -> Self {
        Self {
            worker_id,
            location_id,
            retire: AtomicBool::new(false),
            heartbeat_ns: AtomicU64::new(now_ns),
            current_stage: AtomicU64::new(NO_STAGE),
            metrics: WorkerMetrics::default(),
        }
    }

    fn beat(&self, ctx: &RunContext) {
        self.heartbeat_ns.store(ctx.now_ns(), Ordering::Release);
    }

    fn set_current(&self, stage: Option<StageId>) {
        let raw = stage.map_or(NO_STAGE, |id| u64::from(id.0));
        self.current_stage.store(raw, Ordering::Release);
    }

    #[allow(clippy::cast_possible_truncation)]
    fn current(&self) -> Option<StageId> {
        match self.current_stage.load(Ordering::Acquire) {
            NO_STAGE => None,
            raw => Some(StageId(raw as u32)),
        }
    }

    fn retiring(&self) -> bool {
        self.retire.load(Ordering::Acquire)
    }
}

/// Handle to a running worker thread.
pub(crate) struct WorkerHandle {
    shared: Arc<WorkerShared>,
    thread: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    /// Spawns worker `worker_id` on a named thread.
    pub(crate) fn spawn(ctx: &Arc<RunContext>, worker_id: usize) -> Result<Self, ControllerError> {
        let location_id = ctx.scheduler.location_of(worker_id);
        let shared = Arc::new(WorkerShared::new(worker_id, location_id, ctx.now_ns()));

        let thread_ctx = Arc::clone(ctx);
        let thread_shared = Arc::clone(&shared);
        let thread = thread::Builder::new()
            .name(format!("sluice-worker-{worker_id}"))
            .spawn(move || worker_main(&thread_ctx, &thread_shared))
            .map_err(|e| ControllerError::SpawnFailed {
                worker_id,
                message: e.to_string(),
            })?;

        tracing::debug!("Spawned worker {worker_id} (location {location_id})");
        Ok(Self {
            shared,
            thread: Some(thread),
        })
    }

    pub(crate) fn worker_id(&self) -> usize {
        self.shared.worker_id
    }

    /// Asks the worker to exit after its current call.
    pub(crate) fn retire(&self) {
        self.shared.retire.store(true, Ordering::Release);
    }

    /// True once the thread has exited.
    pub(crate) fn is_finished(&self) -> bool {
        self.thread.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Waits for the thread to exit.
    pub(crate) fn join(&mut self) -> Result<(), ControllerError> {
        let Some(thread) = self.thread.take() else {
            return Ok(());
        };
        thread.join().map_err(|payload| ControllerError::WorkerPanicked {
            worker_id: self.shared.worker_id,
            message: crate::stage::StageError::from_panic(payload.as_ref())
                .message()
                .to_string(),
        })
    }

    pub(crate) fn summary(&self, ctx: &RunContext, stall_threshold: Duration) -> WorkerSummary {
        let snapshot = self.shared.metrics.snapshot();
        let heartbeat = self.shared.heartbeat_ns.load(Ordering::Acquire);
        let heartbeat_age = Duration::from_nanos(ctx.now_ns().saturating_sub(heartbeat));
        let current_stage = self.shared.current();
        WorkerSummary {
            worker_id: self.shared.worker_id,
            location_id: self.shared.location_id,
            current_stage,
            useful_time: snapshot.useful_time,
            idle_time: snapshot.idle_time,
            backoff_time: snapshot.backoff_time,
            scheduler_time: snapshot.scheduler_time,
            iterations: snapshot.iterations,
            heartbeat_age,
            is_stalled: current_stage.is_some()
                && !self.is_finished()
                && heartbeat_age > stall_threshold,
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.retire();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn worker_main(ctx: &RunContext, me: &WorkerShared) {
    let worker_id = me.worker_id;
    tracing::debug!("Worker {worker_id} started");

    let mut current: Option<StageId> = None;
    let mut last: Option<ExecutionResult> = None;

    loop {
        me.beat(ctx);
        if me.retiring() {
            break;
        }

        let start = Instant::now();
        let next = ctx
            .scheduler
            .next_stage_for(worker_id, current.take(), last.take().as_ref());
        me.metrics.record_scheduler(start.elapsed());

        let Some(stage) = next else {
            me.set_current(None);
            if ctx.stop_requested()
                || ctx.topology.failure().is_some()
                || ctx.topology.is_finished()
            {
                break;
            }
            let idle = Instant::now();
            ctx.scheduler.idle_wait(ctx.checkin);
            me.metrics.record_idle(idle.elapsed());
            continue;
        };

        me.set_current(Some(stage));
        let result = run_stage(ctx, me, stage);

        if let ExecutionResult::Error(err) = &result {
            let node = ctx.topology.node(stage);
            ctx.topology.record_failure(FailureReport {
                stage,
                stage_name: node.name().to_string(),
                worker_id: Some(worker_id),
                location_id: Some(me.location_id),
                message: err.message().to_string(),
            });
            ctx.scheduler.release(worker_id, stage, Some(&result));
            me.set_current(None);
            ctx.request_stop();
            break;
        }

        current = Some(stage);
        last = Some(result);
    }

    if let Some(stage) = current {
        ctx.scheduler.release(worker_id, stage, last.as_ref());
    }
    me.set_current(None);
    tracing::debug!("Worker {worker_id} exiting");
}

/// Executes one assignment, retrying with backoff while the stage has
/// nothing to do.
fn run_stage(ctx: &RunContext, me: &WorkerShared, stage: StageId) -> ExecutionResult {
    let node = ctx.topology.node(stage);
    let knobs = node.knobs();
    let mut backoff = BackoffState::new(stage, &knobs);

    loop {
        let mut stage_ctx = StageContext::new(me.worker_id, me.location_id, knobs.chunksize);
        let start = Instant::now();
        let result = node.execute(&mut stage_ctx);
        me.metrics.record_useful(start.elapsed());
        me.beat(ctx);

        if !result.is_come_back_later() || me.retiring() {
            return result;
        }
        let Some(delay) = backoff.next_delay() else {
            node.metrics().record_backoff_exhausted();
            tracing::trace!(
                "Worker {}: backoff exhausted on '{}' after {} tries",
                me.worker_id,
                node.name(),
                backoff.attempt()
            );
            return result;
        };
        thread::sleep(delay);
        me.metrics.record_backoff(delay);
        me.beat(ctx);
        if !matches!(ctx.topology.state(stage), Ok(StageState::Running)) {
            return result;
        }
    }
}
