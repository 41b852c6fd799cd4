//! Fused chain of stage bodies scheduled as one node.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::stage::{ExecutionResult, StageContext, StageError, StageLogic};

/// Runs several bodies back to back within a single `execute` call.
///
/// Fusing a short chain removes the scheduling round-trip between its
/// members at the cost of their individual parallelism. Members are run in
/// insertion order, so list them upstream first.
///
/// A member other than the first also counts as finished once every member
/// before it has finished and it has nothing pending, so a group led by a
/// source finishes when the source is exhausted and the chain has drained.
pub struct GroupStage {
    members: Vec<Box<dyn StageLogic>>,
    finished: Vec<AtomicBool>,
}

impl fmt::Debug for GroupStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GroupStage")
            .field("members", &self.members.len())
            .finish_non_exhaustive()
    }
}

impl Default for GroupStage {
    fn default() -> Self {
        Self::new()
    }
}

impl GroupStage {
    /// Creates an empty group.
    #[must_use]
    pub fn new() -> Self {
        Self {
            members: Vec::new(),
            finished: Vec::new(),
        }
    }

    /// Appends a member body.
    #[must_use]
    pub fn with_member<L: StageLogic + 'static>(mut self, member: L) -> Self {
        self.members.push(Box::new(member));
        self.finished.push(AtomicBool::new(false));
        self
    }

    /// Number of members.
    #[must_use]
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Returns true if the group has no members.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

impl StageLogic for GroupStage {
    fn initialize(&self) -> Result<(), StageError> {
        self.members.iter().try_for_each(|m| m.initialize())
    }

    fn execute(&self, ctx: &mut StageContext) -> ExecutionResult {
        let mut progressed = false;
        let mut upstream_finished = false;
        for (i, (member, finished)) in self.members.iter().zip(&self.finished).enumerate() {
            if !finished.load(Ordering::Acquire) {
                let mut member_ctx =
                    StageContext::new(ctx.worker_id(), ctx.location_id(), ctx.chunksize());
                let result = member.execute(&mut member_ctx);
                ctx.record_items(member_ctx.items());
                match result {
                    ExecutionResult::Success => progressed = true,
                    ExecutionResult::ComeBackLater => {}
                    ExecutionResult::Finished => {
                        finished.store(true, Ordering::Release);
                        progressed |= member_ctx.items() > 0;
                    }
                    ExecutionResult::Error(e) => return ExecutionResult::Error(e),
                }
                if upstream_finished && member.pending() == 0 {
                    finished.store(true, Ordering::Release);
                }
            }
            let done = finished.load(Ordering::Acquire);
            upstream_finished = if i == 0 { done } else { upstream_finished && done };
        }

        if self.finished.iter().all(|f| f.load(Ordering::Acquire)) {
            ExecutionResult::Finished
        } else if progressed {
            ExecutionResult::Success
        } else {
            ExecutionResult::ComeBackLater
        }
    }

    fn finalize(&self) -> Result<(), StageError> {
        self.members.iter().try_for_each(|m| m.finalize())
    }

    fn pending(&self) -> usize {
        self.members.iter().map(|m| m.pending()).sum()
    }

    fn threshold(&self) -> usize {
        self.members.first().map_or(0, |m| m.threshold())
    }

    fn set_threshold(&self, threshold: usize) {
        if let Some(first) = self.members.first() {
            first.set_threshold(threshold);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::StageQueue;
    use crate::stages::{CountingSource, MapStage, SourceStage};
    use std::sync::Arc;

    #[test]
    fn test_fused_source_and_map() {
        let raw = Arc::new(StageQueue::unbounded("raw"));
        let doubled = Arc::new(StageQueue::unbounded("doubled"));
        let group = GroupStage::new()
            .with_member(SourceStage::new(CountingSource::new(3), Arc::clone(&raw)))
            .with_member(MapStage::new(Arc::clone(&raw), Arc::clone(&doubled), |x: u64| {
                Ok(x * 2)
            }));
        assert_eq!(group.len(), 2);

        let mut ctx = StageContext::new(0, 0, 10);
        assert_eq!(group.execute(&mut ctx), ExecutionResult::Finished);
        assert_eq!(ctx.items(), 6);
        assert_eq!(doubled.try_pop(10), vec![0, 2, 4]);
        assert_eq!(group.pending(), 0);
    }

    #[test]
    fn test_source_led_group_finishes_after_chain_drains() {
        let raw = Arc::new(StageQueue::unbounded("raw"));
        let out = Arc::new(StageQueue::bounded("out", 2));
        let group = GroupStage::new()
            .with_member(SourceStage::new(CountingSource::new(4), Arc::clone(&raw)))
            .with_member(MapStage::new(Arc::clone(&raw), Arc::clone(&out), |x: u64| Ok(x)));

        // The source is exhausted at once; the map is held back by `out`.
        assert_eq!(group.execute(&mut StageContext::new(0, 0, 8)), ExecutionResult::Success);
        assert_eq!(out.try_pop(10), vec![0, 1]);
        assert_eq!(group.execute(&mut StageContext::new(0, 0, 8)), ExecutionResult::Finished);
        assert_eq!(out.try_pop(10), vec![2, 3]);
        assert_eq!(group.pending(), 0);
    }

    #[test]
    fn test_interior_group_never_finishes_on_its_own() {
        let raw = Arc::new(StageQueue::<u64>::unbounded("raw"));
        let out = Arc::new(StageQueue::unbounded("out"));
        let group = GroupStage::new()
            .with_member(MapStage::new(Arc::clone(&raw), Arc::clone(&out), |x: u64| Ok(x)));
        let mut ctx = StageContext::new(0, 0, 4);
        assert_eq!(group.execute(&mut ctx), ExecutionResult::ComeBackLater);
    }

    #[test]
    fn test_all_members_finished() {
        let group = GroupStage::new()
            .with_member(SourceStage::new(
                CountingSource::new(0),
                Arc::new(StageQueue::unbounded("a")),
            ))
            .with_member(SourceStage::new(
                CountingSource::new(1),
                Arc::new(StageQueue::unbounded("b")),
            ));
        let mut ctx = StageContext::new(0, 0, 10);
        assert_eq!(group.execute(&mut ctx), ExecutionResult::Finished);
        assert_eq!(ctx.items(), 1);
    }

    #[test]
    fn test_member_error_short_circuits() {
        let out = Arc::new(StageQueue::<u64>::unbounded("out"));
        let raw = Arc::new(StageQueue::unbounded("raw"));
        let _ = raw.try_push(1u64);
        let group = GroupStage::new()
            .with_member(MapStage::new(Arc::clone(&raw), Arc::clone(&out), |_x: u64| {
                Err(StageError::new("broken"))
            }))
            .with_member(MapStage::new(
                Arc::clone(&out),
                Arc::new(StageQueue::unbounded("x")),
                Ok,
            ));
        let mut ctx = StageContext::new(0, 0, 1);
        assert!(group.execute(&mut ctx).is_error());
    }

    #[test]
    fn test_empty_group_is_finished() {
        let group = GroupStage::default();
        assert!(group.is_empty());
        let mut ctx = StageContext::new(0, 0, 1);
        assert_eq!(group.execute(&mut ctx), ExecutionResult::Finished);
    }
}
