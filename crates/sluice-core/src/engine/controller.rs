//! Worker pool lifecycle and performance queries.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::config::EngineConfig;
use crate::metrics::{
    rate_hz, PerfReport, RunStatus, StageSummary, TopologySummary, WorkerSummary,
};
use crate::stage::StageId;
use crate::topology::{FailureReport, Topology};

use super::worker::{RunContext, WorkerHandle};
use super::{ControllerError, Scheduler};

/// Owns the worker threads that execute a [`Topology`].
///
/// # Example
///
/// ```rust,ignore
/// let controller = Controller::new(topology, EngineConfig::default())?;
/// controller.run(4)?;
/// controller.wait_until_finished();
/// controller.wait_until_stopped()?;
/// println!("{} events", controller.nevents_processed());
/// ```
pub struct Controller {
    ctx: Arc<RunContext>,
    config: EngineConfig,
    workers: Mutex<Vec<WorkerHandle>>,
    status: Mutex<RunStatus>,
    started: Mutex<Option<Instant>>,
    /// Time and sink count at the previous `measure_perf`.
    perf_mark: Mutex<(Instant, u64)>,
}

impl Controller {
    /// Validates `config`, applies its defaults to every stage, and wraps
    /// the topology for execution.
    ///
    /// # Errors
    ///
    /// Returns [`ControllerError::InvalidConfig`] if the configuration is
    /// rejected, or [`ControllerError::Topology`] if the graph is incomplete.
    pub fn new(topology: Topology, config: EngineConfig) -> Result<Self, ControllerError> {
        Self::with_shared(Arc::new(topology), config)
    }

    /// Like [`Controller::new`] for a topology that is already shared.
    ///
    /// # Errors
    ///
    /// Same as [`Controller::new`].
    pub fn with_shared(topology: Arc<Topology>, config: EngineConfig) -> Result<Self, ControllerError> {
        config
            .validate()
            .map_err(|e| ControllerError::InvalidConfig(e.to_string()))?;
        topology.validate()?;
        topology.apply_defaults(&config);

        let scheduler =
            Scheduler::new(Arc::clone(&topology), config.fairness).with_locations(config.locations);
        let ctx = Arc::new(RunContext::new(topology, scheduler, config.checkin_time));

        Ok(Self {
            ctx,
            config,
            workers: Mutex::new(Vec::new()),
            status: Mutex::new(RunStatus::BeforeRun),
            started: Mutex::new(None),
            perf_mark: Mutex::new((Instant::now(), 0)),
        })
    }

    /// The topology being executed.
    #[must_use]
    pub fn topology(&self) -> &Arc<Topology> {
        &self.ctx.topology
    }

    /// The engine configuration.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Current lifecycle phase.
    #[must_use]
    pub fn status(&self) -> RunStatus {
        *self.status.lock()
    }

    /// Activates every stage and starts `nthreads` workers.
    ///
    /// # Errors
    ///
    /// Returns [`ControllerError::AlreadyRunning`] on a second call,
    /// [`ControllerError::InvalidConfig`] for zero threads, a topology error
    /// if an `initialize` hook fails, or [`ControllerError::SpawnFailed`].
    pub fn run(&self, nthreads: usize) -> Result<(), ControllerError> {
        let mut status = self.status.lock();
        if *status != RunStatus::BeforeRun {
            return Err(ControllerError::AlreadyRunning);
        }
        if nthreads == 0 {
            return Err(ControllerError::InvalidConfig(
                "nthreads must be > 0".to_string(),
            ));
        }

        if let Err(e) = self.ctx.topology.activate_all() {
            *status = RunStatus::AfterRun;
            return Err(e.into());
        }

        let now = Instant::now();
        *self.started.lock() = Some(now);
        *self.perf_mark.lock() = (now, 0);
        *status = RunStatus::DuringRun;
        drop(status);

        tracing::info!(
            "Starting {nthreads} workers over {} stages ({} locations, {} fairness)",
            self.ctx.topology.len(),
            self.config.locations,
            self.config.fairness
        );
        self.spawn_up_to(nthreads)
    }

    /// Starts workers with the configured thread count.
    ///
    /// # Errors
    ///
    /// Same as [`Controller::run`].
    pub fn start(&self) -> Result<(), ControllerError> {
        self.run(self.config.nthreads)
    }

    /// Grows or shrinks the worker pool to `nthreads`.
    ///
    /// Removed workers finish their current call and hand their stage back
    /// before exiting. Scaling to zero leaves the topology resident.
    ///
    /// # Errors
    ///
    /// Returns [`ControllerError::NotRunning`] outside a run, or a spawn or
    /// join failure.
    pub fn scale(&self, nthreads: usize) -> Result<(), ControllerError> {
        if self.status() != RunStatus::DuringRun {
            return Err(ControllerError::NotRunning);
        }
        let current = self.nthreads();
        match nthreads.cmp(&current) {
            std::cmp::Ordering::Greater => {
                tracing::info!("Scaling up from {current} to {nthreads} workers");
                self.spawn_up_to(nthreads)
            }
            std::cmp::Ordering::Less => {
                tracing::info!("Scaling down from {current} to {nthreads} workers");
                let mut retired: Vec<WorkerHandle> = {
                    let mut workers = self.workers.lock();
                    let keep = nthreads.min(workers.len());
                    workers.drain(keep..).collect()
                };
                for worker in &retired {
                    worker.retire();
                }
                self.ctx.scheduler.wake_idle();
                join_all(&mut retired)
            }
            std::cmp::Ordering::Equal => Ok(()),
        }
    }

    fn spawn_up_to(&self, nthreads: usize) -> Result<(), ControllerError> {
        let mut workers = self.workers.lock();
        while workers.len() < nthreads {
            let worker = WorkerHandle::spawn(&self.ctx, workers.len())?;
            workers.push(worker);
        }
        Ok(())
    }

    /// Finishes the sources; workers drain what is resident and exit.
    pub fn request_stop(&self) {
        self.ctx.request_stop();
    }

    /// Pauses a stage. Downstream stages pause once they run dry.
    ///
    /// # Errors
    ///
    /// Returns a topology error for an unknown stage.
    pub fn pause_stage(&self, id: StageId) -> Result<(), ControllerError> {
        self.ctx.topology.pause(id)?;
        Ok(())
    }

    /// Re-activates a paused stage and its paused listeners.
    ///
    /// # Errors
    ///
    /// Returns a topology error for an unknown stage or a failing hook.
    pub fn activate_stage(&self, id: StageId) -> Result<(), ControllerError> {
        self.ctx.topology.activate(id)?;
        self.ctx.scheduler.wake_idle();
        Ok(())
    }

    /// Blocks until no stage is Running or a failure is recorded.
    pub fn wait_until_finished(&self) {
        self.ctx.topology.wait_drained(None);
    }

    /// Like [`Controller::wait_until_finished`] with a deadline.
    ///
    /// Returns false if `timeout` elapsed first.
    pub fn wait_until_finished_timeout(&self, timeout: Duration) -> bool {
        self.ctx.topology.wait_drained(Some(timeout))
    }

    /// Joins every worker.
    ///
    /// Workers exit on their own once every stage has finished, after
    /// [`Controller::request_stop`], or after a stage failure.
    ///
    /// # Errors
    ///
    /// Returns [`ControllerError::WorkerPanicked`] if a worker thread died.
    pub fn wait_until_stopped(&self) -> Result<(), ControllerError> {
        if self.status() == RunStatus::BeforeRun {
            return Ok(());
        }
        let mut workers = std::mem::take(&mut *self.workers.lock());
        let result = join_all(&mut workers);
        *self.status.lock() = RunStatus::AfterRun;
        tracing::info!(
            "Stopped after {} events ({})",
            self.nevents_processed(),
            if self.ctx.topology.is_finished() {
                "finished"
            } else {
                "resident items remain"
            }
        );
        result
    }

    /// True when no worker thread is alive.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        match self.status() {
            RunStatus::BeforeRun | RunStatus::AfterRun => true,
            RunStatus::DuringRun => self.workers.lock().iter().all(WorkerHandle::is_finished),
        }
    }

    /// True when no stage is Running.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.ctx.topology.is_drained()
    }

    /// Live worker count.
    #[must_use]
    pub fn nthreads(&self) -> usize {
        self.workers.lock().len()
    }

    /// Items consumed by sinks.
    #[must_use]
    pub fn nevents_processed(&self) -> u64 {
        self.ctx.topology.sink_items()
    }

    /// First stage failure, if any.
    #[must_use]
    pub fn failure(&self) -> Option<FailureReport> {
        self.ctx.topology.failure()
    }

    /// Engine-wide summary. Latest throughput covers the interval since the
    /// previous call.
    #[must_use]
    pub fn measure_perf(&self) -> TopologySummary {
        let now = Instant::now();
        let events = self.nevents_processed();
        let uptime = self
            .started
            .lock()
            .map_or(Duration::ZERO, |s| now.duration_since(s));
        let (mark_time, mark_events) = {
            let mut mark = self.perf_mark.lock();
            std::mem::replace(&mut *mark, (now, events))
        };
        let topology = &self.ctx.topology;
        TopologySummary {
            status: self.status(),
            nthreads: self.nthreads(),
            events_completed: events,
            uptime,
            avg_throughput_hz: rate_hz(events, uptime),
            latest_throughput_hz: rate_hz(
                events.saturating_sub(mark_events),
                now.duration_since(mark_time),
            ),
            running_stages: topology.running_count(),
            is_drained: topology.is_drained(),
            failure: topology.failure(),
        }
    }

    /// One row per stage.
    #[must_use]
    pub fn measure_stage_perf(&self) -> Vec<StageSummary> {
        self.ctx.topology.stage_summaries()
    }

    /// One row per live worker.
    #[must_use]
    pub fn measure_worker_perf(&self) -> Vec<WorkerSummary> {
        let stall = self.config.stall_threshold();
        self.workers
            .lock()
            .iter()
            .map(|w| w.summary(&self.ctx, stall))
            .collect()
    }

    /// Engine, stage and worker summaries together.
    #[must_use]
    pub fn perf_report(&self) -> PerfReport {
        PerfReport {
            topology: self.measure_perf(),
            stages: self.measure_stage_perf(),
            workers: self.measure_worker_perf(),
        }
    }

    /// Workers whose heartbeat is older than the stall threshold while
    /// holding a stage.
    #[must_use]
    pub fn stalled_workers(&self) -> Vec<usize> {
        let stalled: Vec<WorkerSummary> = self
            .measure_worker_perf()
            .into_iter()
            .filter(|w| w.is_stalled)
            .collect();
        for w in &stalled {
            tracing::warn!(
                "Worker {} stalled for {:?} on {:?}",
                w.worker_id,
                w.heartbeat_age,
                w.current_stage
            );
        }
        stalled.iter().map(|w| w.worker_id).collect()
    }
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("status", &self.status())
            .field("nthreads", &self.nthreads())
            .finish_non_exhaustive()
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        let mut workers = std::mem::take(self.workers.get_mut());
        if workers.is_empty() {
            return;
        }
        self.ctx.request_stop();
        for worker in &workers {
            worker.retire();
        }
        self.ctx.scheduler.wake_idle();
        if let Err(e) = join_all(&mut workers) {
            tracing::error!("Joining workers on drop: {e}");
        }
    }
}

fn join_all(workers: &mut [WorkerHandle]) -> Result<(), ControllerError> {
    let mut first_err = None;
    for worker in workers.iter_mut() {
        if let Err(e) = worker.join() {
            tracing::error!("Worker {} died: {e}", worker.worker_id());
            first_err.get_or_insert(e);
        }
    }
    first_err.map_or(Ok(()), Err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::{ExecutionResult, StageKind};
    use crate::stages::FnStage;

    fn single_source(count: usize) -> Topology {
        let remaining = std::sync::atomic::AtomicUsize::new(count);
        let mut t = Topology::new();
        let id = t
            .add_stage(
                "countdown",
                StageKind::Source,
                false,
                FnStage::new(move |ctx| {
                    let left = remaining.load(std::sync::atomic::Ordering::SeqCst);
                    if left == 0 {
                        return ExecutionResult::Finished;
                    }
                    remaining.store(left - 1, std::sync::atomic::Ordering::SeqCst);
                    ctx.record_items(1);
                    ExecutionResult::Success
                }),
            )
            .unwrap();
        t.mark_source(id).unwrap();
        t.mark_sink(id).unwrap();
        t
    }

    #[test]
    fn test_rejects_invalid_config() {
        let config = EngineConfig {
            chunksize: 0,
            ..EngineConfig::default()
        };
        let err = Controller::new(single_source(1), config).unwrap_err();
        assert!(matches!(err, ControllerError::InvalidConfig(_)));
    }

    #[test]
    fn test_rejects_empty_topology() {
        let err = Controller::new(Topology::new(), EngineConfig::default()).unwrap_err();
        assert!(matches!(err, ControllerError::Topology(_)));
    }

    #[test]
    fn test_lifecycle() {
        let controller = Controller::new(single_source(10), EngineConfig::default()).unwrap();
        assert_eq!(controller.status(), RunStatus::BeforeRun);
        assert!(controller.is_stopped());
        assert_eq!(controller.scale(2), Err(ControllerError::NotRunning));
        assert!(matches!(
            controller.run(0),
            Err(ControllerError::InvalidConfig(_))
        ));

        controller.run(2).unwrap();
        assert_eq!(controller.run(2), Err(ControllerError::AlreadyRunning));
        assert!(controller.wait_until_finished_timeout(Duration::from_secs(30)));
        controller.wait_until_stopped().unwrap();

        assert_eq!(controller.status(), RunStatus::AfterRun);
        assert!(controller.is_stopped());
        assert!(controller.is_finished());
        assert_eq!(controller.nevents_processed(), 10);
        assert_eq!(controller.nthreads(), 0);
        assert!(controller.failure().is_none());
    }

    #[test]
    fn test_measure_perf() {
        let controller = Controller::new(single_source(50), EngineConfig::default()).unwrap();
        controller.run(1).unwrap();
        assert!(controller.wait_until_finished_timeout(Duration::from_secs(30)));

        let report = controller.perf_report();
        assert_eq!(report.topology.events_completed, 50);
        assert!(report.topology.is_drained);
        assert_eq!(report.stages.len(), 1);
        assert_eq!(report.stages[0].items_processed, 50);

        let again = controller.measure_perf();
        assert!(again.latest_throughput_hz.abs() < f64::EPSILON);
        controller.wait_until_stopped().unwrap();
    }

    #[test]
    fn test_drop_joins_idle_workers() {
        let mut t = Topology::new();
        let id = t
            .add_stage(
                "idle",
                StageKind::Source,
                true,
                FnStage::new(|_| ExecutionResult::ComeBackLater),
            )
            .unwrap();
        t.mark_source(id).unwrap();
        let controller = Controller::new(t, EngineConfig::default()).unwrap();
        controller.run(3).unwrap();
        assert_eq!(controller.nthreads(), 3);
        assert!(controller.stalled_workers().is_empty());
        drop(controller);
    }
}
