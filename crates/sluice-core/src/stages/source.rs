//! Source body: pulls items from an external producer into a queue.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::queue::{PushResult, StageQueue};
use crate::stage::{ExecutionResult, StageContext, StageError, StageLogic};

/// Outcome of one [`ItemSource::poll`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourcePoll<T> {
    /// An item was produced.
    Item(T),
    /// Nothing is available right now.
    Empty,
    /// The producer will never yield another item.
    Exhausted,
}

/// An external producer of items.
///
/// Closures `FnMut() -> SourcePoll<T>` implement this trait.
pub trait ItemSource<T>: Send {
    /// Opens the producer.
    ///
    /// # Errors
    ///
    /// Returns an error if the producer cannot be opened.
    fn open(&mut self) -> Result<(), StageError> {
        Ok(())
    }

    /// Produces the next item, if any.
    fn poll(&mut self) -> SourcePoll<T>;

    /// Closes the producer.
    ///
    /// # Errors
    ///
    /// Returns an error if the producer cannot be closed cleanly.
    fn close(&mut self) -> Result<(), StageError> {
        Ok(())
    }
}

impl<T, F> ItemSource<T> for F
where
    F: FnMut() -> SourcePoll<T> + Send,
{
    fn poll(&mut self) -> SourcePoll<T> {
        self()
    }
}

/// Emits the integers `0..count`, then reports exhaustion.
#[derive(Debug, Clone)]
pub struct CountingSource {
    next: u64,
    count: u64,
}

impl CountingSource {
    /// Creates a source of `count` items.
    #[must_use]
    pub fn new(count: u64) -> Self {
        Self { next: 0, count }
    }
}

impl ItemSource<u64> for CountingSource {
    fn poll(&mut self) -> SourcePoll<u64> {
        if self.next >= self.count {
            return SourcePoll::Exhausted;
        }
        let item = self.next;
        self.next += 1;
        SourcePoll::Item(item)
    }
}

struct SourceInner<S, T> {
    source: S,
    overflow: Option<T>,
}

/// Stage body that feeds an [`ItemSource`] into an output queue.
///
/// Reports `Finished` once the producer is exhausted and every produced
/// item has been pushed. A full output queue yields `ComeBackLater`.
///
/// Pending work is the free room in the output queue, capped at the last
/// chunk size seen, so an unbounded output cannot outbid its consumers.
pub struct SourceStage<S, T> {
    inner: Mutex<SourceInner<S, T>>,
    output: Arc<StageQueue<T>>,
    exhausted: AtomicBool,
    produced: AtomicU64,
    chunk_hint: AtomicUsize,
}

impl<S, T> SourceStage<S, T>
where
    S: ItemSource<T>,
{
    /// Creates a source body writing to `output`.
    pub fn new(source: S, output: Arc<StageQueue<T>>) -> Self {
        Self {
            inner: Mutex::new(SourceInner {
                source,
                overflow: None,
            }),
            output,
            exhausted: AtomicBool::new(false),
            produced: AtomicU64::new(0),
            chunk_hint: AtomicUsize::new(1),
        }
    }

    /// Items pushed to the output queue so far.
    #[must_use]
    pub fn produced(&self) -> u64 {
        self.produced.load(Ordering::Relaxed)
    }
}

impl<S, T> StageLogic for SourceStage<S, T>
where
    S: ItemSource<T> + Send,
    T: Send,
{
    fn initialize(&self) -> Result<(), StageError> {
        self.inner.lock().source.open()
    }

    fn execute(&self, ctx: &mut StageContext) -> ExecutionResult {
        self.chunk_hint.store(ctx.chunksize().max(1), Ordering::Relaxed);
        let mut inner = self.inner.lock();
        let mut emitted = 0;

        if let Some(item) = inner.overflow.take() {
            if let PushResult::Full(item) = self.output.try_push(item) {
                inner.overflow = Some(item);
                return ExecutionResult::ComeBackLater;
            }
            emitted += 1;
        }

        while emitted < ctx.chunksize() && !self.exhausted.load(Ordering::Relaxed) {
            match inner.source.poll() {
                SourcePoll::Item(item) => {
                    if let PushResult::Full(item) = self.output.try_push(item) {
                        inner.overflow = Some(item);
                        break;
                    }
                    emitted += 1;
                }
                SourcePoll::Empty => break,
                SourcePoll::Exhausted => {
                    tracing::debug!("Source exhausted after {} items", self.produced());
                    self.exhausted.store(true, Ordering::Relaxed);
                }
            }
        }

        ctx.record_items(emitted);
        self.produced.fetch_add(emitted as u64, Ordering::Relaxed);

        if self.exhausted.load(Ordering::Relaxed) && inner.overflow.is_none() {
            ExecutionResult::Finished
        } else if emitted > 0 {
            ExecutionResult::Success
        } else {
            ExecutionResult::ComeBackLater
        }
    }

    fn finalize(&self) -> Result<(), StageError> {
        self.inner.lock().source.close()
    }

    fn pending(&self) -> usize {
        if self.exhausted.load(Ordering::Relaxed) {
            0
        } else {
            self.output
                .free_capacity()
                .min(self.chunk_hint.load(Ordering::Relaxed))
        }
    }

    fn threshold(&self) -> usize {
        self.output.threshold()
    }

    fn set_threshold(&self, threshold: usize) {
        self.output.set_threshold(threshold);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(chunksize: usize) -> StageContext {
        StageContext::new(0, 0, chunksize)
    }

    #[test]
    fn test_counting_source_to_completion() {
        let queue = Arc::new(StageQueue::unbounded("out"));
        let stage = SourceStage::new(CountingSource::new(5), Arc::clone(&queue));

        assert_eq!(stage.execute(&mut ctx(3)), ExecutionResult::Success);
        assert_eq!(stage.execute(&mut ctx(3)), ExecutionResult::Finished);
        assert_eq!(queue.try_pop(10), vec![0, 1, 2, 3, 4]);
        assert_eq!(stage.produced(), 5);
        assert_eq!(stage.pending(), 0);
    }

    #[test]
    fn test_full_output_keeps_item() {
        let queue = Arc::new(StageQueue::bounded("out", 2));
        let stage = SourceStage::new(CountingSource::new(4), Arc::clone(&queue));

        let mut c = ctx(10);
        assert_eq!(stage.execute(&mut c), ExecutionResult::Success);
        assert_eq!(c.items(), 2);
        assert_eq!(stage.execute(&mut ctx(10)), ExecutionResult::ComeBackLater);

        assert_eq!(queue.try_pop(10), vec![0, 1]);
        assert_eq!(stage.execute(&mut ctx(10)), ExecutionResult::Finished);
        assert_eq!(queue.try_pop(10), vec![2, 3]);
        assert_eq!(stage.produced(), 4);
    }

    #[test]
    fn test_empty_poll_comes_back_later() {
        let queue = Arc::new(StageQueue::unbounded("out"));
        let mut ready = vec![SourcePoll::Exhausted, SourcePoll::Item(9), SourcePoll::Empty];
        let stage = SourceStage::new(
            move || ready.pop().unwrap_or(SourcePoll::Exhausted),
            Arc::clone(&queue),
        );

        assert_eq!(stage.execute(&mut ctx(4)), ExecutionResult::ComeBackLater);
        assert_eq!(stage.execute(&mut ctx(4)), ExecutionResult::Finished);
        assert_eq!(queue.try_pop(4), vec![9]);
    }

    #[test]
    fn test_pending_is_free_capacity_capped_by_chunk() {
        let queue = Arc::new(StageQueue::bounded("out", 4));
        let stage = SourceStage::new(CountingSource::new(100), Arc::clone(&queue));
        assert_eq!(stage.pending(), 1);
        let _ = stage.execute(&mut ctx(3));
        assert_eq!(stage.pending(), 1);
        stage.set_threshold(10);
        assert_eq!(stage.threshold(), 10);
        assert_eq!(stage.pending(), 3);
    }

    #[test]
    fn test_unbounded_output_pending_stays_small() {
        let queue = Arc::new(StageQueue::unbounded("out"));
        let stage = SourceStage::new(CountingSource::new(1_000), Arc::clone(&queue));
        let _ = stage.execute(&mut ctx(16));
        assert_eq!(stage.pending(), 16);
        assert_eq!(queue.len(), 16);
    }
}
