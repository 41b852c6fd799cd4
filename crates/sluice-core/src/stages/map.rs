//! One-to-one transform between two queues.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::queue::StageQueue;
use crate::stage::{ExecutionResult, StageContext, StageError, StageLogic};

type MapFn<I, O> = Box<dyn Fn(I) -> Result<O, StageError> + Send + Sync>;

/// Stage body applying a fallible function to each item.
///
/// Safe to run on several workers at once. Pops at most as many items as
/// the output queue can accept, so overflow only appears when another
/// producer races for the same output queue.
pub struct MapStage<I, O> {
    input: Arc<StageQueue<I>>,
    output: Arc<StageQueue<O>>,
    func: MapFn<I, O>,
    overflow: Mutex<VecDeque<O>>,
    overflow_len: AtomicUsize,
}

impl<I, O> MapStage<I, O> {
    /// Creates a body reading `input` and writing `output`.
    pub fn new<F>(input: Arc<StageQueue<I>>, output: Arc<StageQueue<O>>, func: F) -> Self
    where
        F: Fn(I) -> Result<O, StageError> + Send + Sync + 'static,
    {
        Self {
            input,
            output,
            func: Box::new(func),
            overflow: Mutex::new(VecDeque::new()),
            overflow_len: AtomicUsize::new(0),
        }
    }

    fn flush_overflow(&self) -> (usize, bool) {
        let mut overflow = self.overflow.lock();
        let moved = self.output.try_push_from(&mut overflow);
        self.overflow_len.store(overflow.len(), Ordering::Relaxed);
        (moved, overflow.is_empty())
    }
}

impl<I, O> StageLogic for MapStage<I, O>
where
    I: Send,
    O: Send,
{
    fn execute(&self, ctx: &mut StageContext) -> ExecutionResult {
        let (flushed, clear) = self.flush_overflow();
        if !clear {
            return if flushed > 0 {
                ExecutionResult::Success
            } else {
                ExecutionResult::ComeBackLater
            };
        }

        let budget = ctx.chunksize().min(self.output.free_capacity());
        let mut batch = Vec::with_capacity(budget);
        if budget == 0 || self.input.pop_into(&mut batch, budget) == 0 {
            return if flushed > 0 {
                ExecutionResult::Success
            } else {
                ExecutionResult::ComeBackLater
            };
        }

        let mut outputs = VecDeque::with_capacity(batch.len());
        let mut failure = None;
        let mut items = batch.into_iter();
        for item in items.by_ref() {
            match (self.func)(item) {
                Ok(out) => outputs.push_back(out),
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }
        ctx.record_items(outputs.len());
        self.output.try_push_from(&mut outputs);
        if !outputs.is_empty() {
            let mut overflow = self.overflow.lock();
            overflow.extend(outputs);
            self.overflow_len.store(overflow.len(), Ordering::Relaxed);
        }

        match failure {
            Some(e) => {
                // Items after the failing one go back for whoever resumes.
                self.input.requeue_front(items.collect());
                ExecutionResult::Error(e)
            }
            None => ExecutionResult::Success,
        }
    }

    fn pending(&self) -> usize {
        self.input.len() + self.overflow_len.load(Ordering::Relaxed)
    }

    fn threshold(&self) -> usize {
        self.input.threshold()
    }

    fn set_threshold(&self, threshold: usize) {
        self.input.set_threshold(threshold);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(chunksize: usize) -> StageContext {
        StageContext::new(0, 0, chunksize)
    }

    #[test]
    fn test_map_batch() {
        let input = Arc::new(StageQueue::unbounded("in"));
        let output = Arc::new(StageQueue::unbounded("out"));
        let stage = MapStage::new(Arc::clone(&input), Arc::clone(&output), |x: u32| Ok(x * 10));

        for i in 0..5 {
            let _ = input.try_push(i);
        }
        assert_eq!(stage.pending(), 5);

        let mut c = ctx(3);
        assert_eq!(stage.execute(&mut c), ExecutionResult::Success);
        assert_eq!(c.items(), 3);
        assert_eq!(stage.execute(&mut ctx(3)), ExecutionResult::Success);
        assert_eq!(stage.execute(&mut ctx(3)), ExecutionResult::ComeBackLater);
        assert_eq!(output.try_pop(10), vec![0, 10, 20, 30, 40]);
        assert_eq!(stage.pending(), 0);
    }

    #[test]
    fn test_full_output_backpressure() {
        let input = Arc::new(StageQueue::unbounded("in"));
        let output = Arc::new(StageQueue::bounded("out", 2));
        let stage = MapStage::new(Arc::clone(&input), Arc::clone(&output), |x: u32| Ok(x));

        for i in 0..4 {
            let _ = input.try_push(i);
        }
        assert_eq!(stage.execute(&mut ctx(8)), ExecutionResult::Success);
        assert_eq!(stage.execute(&mut ctx(8)), ExecutionResult::ComeBackLater);
        assert_eq!(input.len(), 2);

        assert_eq!(output.try_pop(1), vec![0]);
        assert_eq!(stage.execute(&mut ctx(8)), ExecutionResult::Success);
        assert_eq!(output.try_pop(10), vec![1, 2]);
        assert_eq!(stage.pending(), 1);
    }

    #[test]
    fn test_overflow_is_flushed_first() {
        let input = Arc::new(StageQueue::unbounded("in"));
        let output = Arc::new(StageQueue::bounded("out", 1));
        let stage = MapStage::new(Arc::clone(&input), Arc::clone(&output), |x: u32| Ok(x));

        stage.overflow.lock().extend([7, 8]);
        let _ = input.try_push(9);

        assert_eq!(stage.execute(&mut ctx(4)), ExecutionResult::Success);
        assert_eq!(output.try_pop(1), vec![7]);
        assert_eq!(stage.execute(&mut ctx(4)), ExecutionResult::Success);
        assert_eq!(output.try_pop(1), vec![8]);
        assert_eq!(stage.execute(&mut ctx(4)), ExecutionResult::Success);
        assert_eq!(output.try_pop(1), vec![9]);
    }

    #[test]
    fn test_error_propagates() {
        let input = Arc::new(StageQueue::unbounded("in"));
        let output: Arc<StageQueue<u32>> = Arc::new(StageQueue::unbounded("out"));
        let stage = MapStage::new(Arc::clone(&input), Arc::clone(&output), |x: u32| {
            if x == 2 {
                Err(StageError::new("bad item 2"))
            } else {
                Ok(x)
            }
        });
        for i in 0..5 {
            let _ = input.try_push(i);
        }
        let mut c = ctx(5);
        assert_eq!(
            stage.execute(&mut c),
            ExecutionResult::Error(StageError::new("bad item 2"))
        );
        assert_eq!(c.items(), 2);
        assert_eq!(output.try_pop(10), vec![0, 1]);
        assert_eq!(input.try_pop(10), vec![3, 4]);
    }
}
