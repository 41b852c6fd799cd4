//! Stage assignment.
//!
//! Load-driven with an aging term: each eligible stage is scored by its
//! pending work plus the number of assignments since it was last picked, so
//! a stage with input is never starved by busier neighbours. Ties prefer a
//! stage this worker did not just back off from, then a stage last yielded
//! by a different worker. A stage whose inputs are exhausted is never
//! assigned, so the last worker to leave it can settle it.

use std::cmp::Reverse;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use smallvec::SmallVec;

use crate::stage::{ExecutionResult, StageId, StageState};
use crate::topology::{Caller, SchedState, Topology};

/// Whether a worker keeps its stage after a productive call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Fairness {
    /// Keep the stage after `Success`, for at most `max_streak` consecutive
    /// assignments, to amortize scheduling cost.
    Sticky {
        /// Longest run of consecutive assignments of one stage to one worker.
        max_streak: u32,
    },
    /// Re-select after every call.
    RoundRobin,
}

impl Default for Fairness {
    fn default() -> Self {
        Fairness::Sticky { max_streak: 8 }
    }
}

impl fmt::Display for Fairness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fairness::Sticky { .. } => write!(f, "sticky"),
            Fairness::RoundRobin => write!(f, "round_robin"),
        }
    }
}

impl FromStr for Fairness {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sticky" => Ok(Fairness::default()),
            "round_robin" | "round-robin" | "roundrobin" => Ok(Fairness::RoundRobin),
            other => Err(format!(
                "unknown fairness policy '{other}' (expected sticky or round_robin)"
            )),
        }
    }
}

/// Assigns stages to workers.
///
/// All decisions are taken under the topology lock, so a non-parallel
/// stage can never be handed to two workers at once.
pub struct Scheduler {
    topology: Arc<Topology>,
    fairness: Fairness,
    locations: usize,
    idle_lock: Mutex<()>,
    idle_cv: Condvar,
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("fairness", &self.fairness)
            .field("locations", &self.locations)
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    /// Creates a scheduler over `topology`.
    #[must_use]
    pub fn new(topology: Arc<Topology>, fairness: Fairness) -> Self {
        Self {
            topology,
            fairness,
            locations: 1,
            idle_lock: Mutex::new(()),
            idle_cv: Condvar::new(),
        }
    }

    /// Sets the number of locality domains (minimum 1).
    #[must_use]
    pub fn with_locations(mut self, locations: usize) -> Self {
        self.locations = locations.max(1);
        self
    }

    /// Returns the topology being scheduled.
    #[must_use]
    pub fn topology(&self) -> &Arc<Topology> {
        &self.topology
    }

    /// Returns the fairness policy.
    #[must_use]
    pub fn fairness(&self) -> Fairness {
        self.fairness
    }

    /// Locality domain of a worker.
    #[must_use]
    pub fn location_of(&self, worker_id: usize) -> usize {
        worker_id % self.locations
    }

    /// Releases `previous` (if any) with the result of its last call and
    /// returns the next stage for `worker_id`.
    ///
    /// Returns `None` when no stage is eligible or a failure was recorded.
    pub fn next_stage_for(
        &self,
        worker_id: usize,
        previous: Option<StageId>,
        result: Option<&ExecutionResult>,
    ) -> Option<StageId> {
        let caller = Caller {
            worker_id,
            location_id: self.location_of(worker_id),
        };
        let mut guard = self.topology.lock();
        let st = &mut *guard;

        if let (Some(prev), Some(ExecutionResult::Success), Fairness::Sticky { max_streak }) =
            (previous, result, self.fairness)
        {
            let keep = st.failure.is_none()
                && st.stages[prev.index()].state == StageState::Running
                && !self.topology.inputs_exhausted(st, prev);
            let streak = st.streaks.entry(worker_id).or_insert(0);
            if keep && *streak < max_streak {
                *streak += 1;
                st.tick += 1;
                st.stages[prev.index()].last_picked = st.tick;
                return Some(prev);
            }
        }

        let released = previous.is_some();
        if let Some(prev) = previous {
            if let Err(e) = self.topology.release_locked(st, prev, caller, result) {
                tracing::debug!("Worker {worker_id}: releasing {prev} failed: {e}");
            }
        }
        st.streaks.remove(&worker_id);

        let picked = if st.failure.is_some() {
            None
        } else {
            self.pick(st, worker_id)
        };
        if picked.is_none() && st.failure.is_none() {
            // Nothing to hand out: settle stages no release will revisit.
            let idle: SmallVec<[StageId; 8]> = (0..st.stages.len())
                .map(stage_id)
                .filter(|&id| self.topology.is_settled(st, id))
                .collect();
            if let Err(e) = self.topology.settle_locked(st, &idle, Some(caller)) {
                tracing::debug!("Worker {worker_id}: settling idle stages failed: {e}");
            }
        }
        if let Some(id) = picked {
            st.tick += 1;
            let status = &mut st.stages[id.index()];
            status.thread_count += 1;
            status.last_picked = st.tick;
            st.streaks.insert(worker_id, 1);
            tracing::trace!("Worker {worker_id}: assigned {id}");
        }
        drop(guard);

        if released {
            self.wake_idle();
        }
        picked
    }

    /// Gives a stage back without asking for another one.
    pub fn release(&self, worker_id: usize, stage: StageId, result: Option<&ExecutionResult>) {
        let caller = Caller {
            worker_id,
            location_id: self.location_of(worker_id),
        };
        let mut guard = self.topology.lock();
        let st = &mut *guard;
        if let Err(e) = self.topology.release_locked(st, stage, caller, result) {
            tracing::debug!("Worker {worker_id}: releasing {stage} failed: {e}");
        }
        st.streaks.remove(&worker_id);
        drop(guard);
        self.wake_idle();
    }

    fn pick(&self, st: &SchedState, worker_id: usize) -> Option<StageId> {
        st.stages
            .iter()
            .enumerate()
            .filter(|(i, status)| {
                status.state == StageState::Running
                    && (status.thread_count == 0 || self.topology.node(stage_id(*i)).is_parallel())
                    && !self.topology.inputs_exhausted(st, stage_id(*i))
            })
            .max_by_key(|(i, status)| {
                let pending = self.topology.node(stage_id(*i)).pending();
                let age = usize::try_from(st.tick.saturating_sub(status.last_picked))
                    .unwrap_or(usize::MAX);
                let own_backoff = status
                    .last_yield
                    .is_some_and(|y| y.worker_id == worker_id && y.backed_off);
                let by_other = status.last_yield.is_some_and(|y| y.worker_id != worker_id);
                (
                    pending > 0,
                    pending.saturating_add(age),
                    !own_backoff,
                    by_other,
                    Reverse(*i),
                )
            })
            .map(|(i, _)| stage_id(i))
    }

    /// Parks an idle worker until a stage is released or `timeout` passes.
    pub fn idle_wait(&self, timeout: Duration) {
        let mut guard = self.idle_lock.lock();
        let _ = self.idle_cv.wait_for(&mut guard, timeout);
    }

    /// Wakes every idle worker.
    pub fn wake_idle(&self) {
        self.idle_cv.notify_all();
    }
}

#[allow(clippy::cast_possible_truncation)]
fn stage_id(index: usize) -> StageId {
    StageId(index as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::{StageContext, StageKind, StageLogic};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    struct Pending(Arc<AtomicUsize>);

    impl StageLogic for Pending {
        fn execute(&self, _ctx: &mut StageContext) -> ExecutionResult {
            ExecutionResult::ComeBackLater
        }

        fn pending(&self) -> usize {
            self.0.load(Ordering::SeqCst)
        }
    }

    fn topology(parallel: &[bool]) -> (Arc<Topology>, Vec<Arc<AtomicUsize>>) {
        let mut t = Topology::new();
        let mut counters = Vec::new();
        for (i, &p) in parallel.iter().enumerate() {
            let counter = Arc::new(AtomicUsize::new(1));
            let kind = if i == 0 {
                StageKind::Source
            } else {
                StageKind::Interior
            };
            let id = t
                .add_stage(format!("s{i}"), kind, p, Pending(Arc::clone(&counter)))
                .unwrap();
            if i == 0 {
                t.mark_source(id).unwrap();
            } else {
                t.connect(StageId(0), id).unwrap();
            }
            counters.push(counter);
        }
        t.activate_all().unwrap();
        (Arc::new(t), counters)
    }

    #[test]
    fn test_fairness_parse() {
        assert_eq!("sticky".parse::<Fairness>(), Ok(Fairness::Sticky { max_streak: 8 }));
        assert_eq!("Round-Robin".parse::<Fairness>(), Ok(Fairness::RoundRobin));
        assert!("lottery".parse::<Fairness>().is_err());
        assert_eq!(Fairness::RoundRobin.to_string(), "round_robin");
    }

    #[test]
    fn test_prefers_most_pending() {
        let (t, counters) = topology(&[true, true, true]);
        counters[0].store(1, Ordering::SeqCst);
        counters[1].store(50, Ordering::SeqCst);
        counters[2].store(3, Ordering::SeqCst);
        let scheduler = Scheduler::new(t, Fairness::RoundRobin);
        assert_eq!(scheduler.next_stage_for(0, None, None), Some(StageId(1)));
    }

    #[test]
    fn test_non_parallel_stage_is_exclusive() {
        let (t, counters) = topology(&[false]);
        counters[0].store(10, Ordering::SeqCst);
        let scheduler = Scheduler::new(Arc::clone(&t), Fairness::RoundRobin);

        assert_eq!(scheduler.next_stage_for(0, None, None), Some(StageId(0)));
        assert_eq!(scheduler.next_stage_for(1, None, None), None);
        assert_eq!(t.thread_count(StageId(0)).unwrap(), 1);

        let again = scheduler.next_stage_for(0, Some(StageId(0)), Some(&ExecutionResult::Success));
        assert_eq!(again, Some(StageId(0)));
        assert_eq!(t.thread_count(StageId(0)).unwrap(), 1);
    }

    #[test]
    fn test_sticky_streak_is_capped() {
        let (t, counters) = topology(&[true, true]);
        counters[0].store(1, Ordering::SeqCst);
        counters[1].store(1, Ordering::SeqCst);
        let scheduler = Scheduler::new(Arc::clone(&t), Fairness::Sticky { max_streak: 3 });

        let first = scheduler.next_stage_for(0, None, None).unwrap();
        let mut stage = first;
        for _ in 0..2 {
            stage = scheduler
                .next_stage_for(0, Some(stage), Some(&ExecutionResult::Success))
                .unwrap();
            assert_eq!(stage, first);
        }
        let next = scheduler
            .next_stage_for(0, Some(stage), Some(&ExecutionResult::Success))
            .unwrap();
        assert_ne!(next, first);
    }

    #[test]
    fn test_come_back_later_is_not_sticky() {
        let (t, counters) = topology(&[true, true]);
        counters[0].store(1, Ordering::SeqCst);
        counters[1].store(1, Ordering::SeqCst);
        let scheduler = Scheduler::new(Arc::clone(&t), Fairness::default());

        let first = scheduler.next_stage_for(0, None, None).unwrap();
        let next = scheduler
            .next_stage_for(0, Some(first), Some(&ExecutionResult::ComeBackLater))
            .unwrap();
        assert_ne!(next, first);
        assert_eq!(t.thread_count(first).unwrap(), 0);
    }

    #[test]
    fn test_no_starvation() {
        let (t, counters) = topology(&[true, true, true]);
        counters[0].store(0, Ordering::SeqCst);
        counters[1].store(1_000, Ordering::SeqCst);
        counters[2].store(1, Ordering::SeqCst);
        let scheduler = Scheduler::new(t, Fairness::RoundRobin);

        let mut seen = [0usize; 3];
        let mut current = None;
        for _ in 0..5_000 {
            let result = current.map(|_| ExecutionResult::Success);
            current = scheduler.next_stage_for(0, current, result.as_ref());
            if let Some(id) = current {
                seen[id.index()] += 1;
            }
        }
        assert!(seen[1] > 0);
        assert!(seen[2] > 0, "low-pending stage was starved: {seen:?}");
    }

    #[test]
    fn test_drained_parallel_stage_settles_after_last_holder() {
        let (t, counters) = topology(&[true, true]);
        counters[1].store(5, Ordering::SeqCst);
        let scheduler = Scheduler::new(Arc::clone(&t), Fairness::default());
        let middle = StageId(1);

        assert_eq!(scheduler.next_stage_for(0, None, None), Some(middle));
        assert_eq!(scheduler.next_stage_for(1, None, None), Some(middle));
        t.finish(StageId(0)).unwrap();
        counters[1].store(0, Ordering::SeqCst);
        assert_eq!(t.state(middle).unwrap(), StageState::Running);

        // Neither worker may keep or re-take a stage that can no longer be fed.
        let success = ExecutionResult::Success;
        assert_eq!(scheduler.next_stage_for(0, Some(middle), Some(&success)), None);
        assert_eq!(t.thread_count(middle).unwrap(), 1);
        assert_eq!(scheduler.next_stage_for(1, Some(middle), Some(&success)), None);

        assert_eq!(t.state(middle).unwrap(), StageState::Finished);
        assert!(t.is_drained());
    }

    #[test]
    fn test_unbounded_source_does_not_starve_consumer() {
        use crate::stages::{SinkStage, SourcePoll, SourceStage};

        let mut t = Topology::new();
        let queue = t.add_unbounded_queue::<u64>("items").unwrap();
        let mut next = 0u64;
        let endless = move || {
            next += 1;
            SourcePoll::Item(next)
        };
        let source = t
            .add_stage(
                "source",
                StageKind::Source,
                false,
                SourceStage::new(endless, Arc::clone(&queue)),
            )
            .unwrap();
        let sink = t
            .add_stage("sink", StageKind::Sink, true, SinkStage::new(Arc::clone(&queue)))
            .unwrap();
        t.connect(source, sink).unwrap();
        t.mark_source(source).unwrap();
        t.mark_sink(sink).unwrap();
        t.activate_all().unwrap();
        let t = Arc::new(t);
        let scheduler = Scheduler::new(Arc::clone(&t), Fairness::default());

        let mut current = None;
        let mut last: Option<ExecutionResult> = None;
        for _ in 0..1_000 {
            current = scheduler.next_stage_for(0, current, last.as_ref());
            let id = current.expect("a running stage is always eligible");
            last = Some(t.node(id).execute(&mut StageContext::new(0, 0, 4)));
        }

        assert!(t.stage(sink).unwrap().metrics().items_processed() > 0);
        assert!(queue.len() < 256, "queue grew to {}", queue.len());
    }

    #[test]
    fn test_failure_stops_assignment() {
        let (t, _) = topology(&[true]);
        t.record_failure(crate::topology::FailureReport {
            stage: StageId(0),
            stage_name: "s0".to_string(),
            worker_id: Some(0),
            location_id: Some(0),
            message: "boom".to_string(),
        });
        let scheduler = Scheduler::new(t, Fairness::default());
        assert_eq!(scheduler.next_stage_for(0, None, None), None);
    }

    #[test]
    fn test_locations() {
        let (t, _) = topology(&[true]);
        let scheduler = Scheduler::new(t, Fairness::default()).with_locations(3);
        assert_eq!(scheduler.location_of(0), 0);
        assert_eq!(scheduler.location_of(4), 1);
    }

    #[test]
    fn test_exclusive_under_contention() {
        const WORKERS: usize = 6;
        let (t, counters) = topology(&[false, false, true]);
        for c in &counters {
            c.store(1, Ordering::SeqCst);
        }
        let scheduler = Arc::new(Scheduler::new(Arc::clone(&t), Fairness::default()));
        let holders: Arc<Vec<AtomicUsize>> =
            Arc::new((0..3).map(|_| AtomicUsize::new(0)).collect());
        let violations = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..WORKERS)
            .map(|w| {
                let scheduler = Arc::clone(&scheduler);
                let holders = Arc::clone(&holders);
                let violations = Arc::clone(&violations);
                let topology = Arc::clone(&t);
                thread::spawn(move || {
                    let mut current: Option<StageId> = None;
                    for round in 0..2_000 {
                        let result = if round % 3 == 0 {
                            ExecutionResult::ComeBackLater
                        } else {
                            ExecutionResult::Success
                        };
                        if let Some(id) = current {
                            holders[id.index()].fetch_sub(1, Ordering::SeqCst);
                        }
                        current = scheduler.next_stage_for(
                            w,
                            current,
                            current.map(|_| &result),
                        );
                        if let Some(id) = current {
                            let now = holders[id.index()].fetch_add(1, Ordering::SeqCst) + 1;
                            if !topology.node(id).is_parallel() && now > 1 {
                                violations.fetch_add(1, Ordering::SeqCst);
                            }
                        }
                    }
                    if let Some(id) = current {
                        holders[id.index()].fetch_sub(1, Ordering::SeqCst);
                        scheduler.release(w, id, None);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(violations.load(Ordering::SeqCst), 0);
        for i in 0..3 {
            assert_eq!(t.thread_count(StageId(i)).unwrap(), 0);
        }
    }
}
