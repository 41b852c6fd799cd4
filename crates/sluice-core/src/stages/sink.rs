//! Terminal stage: hands each item to an ordered list of processors.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::pool::ItemPool;
use crate::queue::StageQueue;
use crate::stage::{ExecutionResult, StageContext, StageError, StageLogic};

/// Consumer of terminal items.
///
/// Processors are shared by every worker running the sink, so they take
/// `&self`. Closures `Fn(&T) -> Result<(), StageError>` implement this
/// trait.
pub trait Processor<T>: Send + Sync {
    /// Consumes one item.
    ///
    /// # Errors
    ///
    /// Returns an error if the item cannot be processed.
    fn process(&self, item: &T) -> Result<(), StageError>;

    /// Called once when the sink finishes.
    ///
    /// # Errors
    ///
    /// Returns an error if the processor cannot flush its results.
    fn finish(&self) -> Result<(), StageError> {
        Ok(())
    }
}

impl<T, F> Processor<T> for F
where
    F: Fn(&T) -> Result<(), StageError> + Send + Sync,
{
    fn process(&self, item: &T) -> Result<(), StageError> {
        self(item)
    }
}

/// Sink body draining one queue through its processors.
///
/// Each item is passed to every processor in registration order, then
/// returned to the pool if one is attached.
pub struct SinkStage<T> {
    input: Arc<StageQueue<T>>,
    processors: Vec<Box<dyn Processor<T>>>,
    pool: Option<Arc<ItemPool<T>>>,
    consumed: AtomicU64,
}

impl<T> fmt::Debug for SinkStage<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SinkStage")
            .field("input", &self.input.name())
            .field("processors", &self.processors.len())
            .field("pooled", &self.pool.is_some())
            .field("consumed", &self.consumed())
            .finish()
    }
}

impl<T> SinkStage<T> {
    /// Creates a sink reading `input`, with no processors.
    #[must_use]
    pub fn new(input: Arc<StageQueue<T>>) -> Self {
        Self {
            input,
            processors: Vec::new(),
            pool: None,
            consumed: AtomicU64::new(0),
        }
    }

    /// Appends a processor.
    #[must_use]
    pub fn with_processor<P>(mut self, processor: P) -> Self
    where
        P: Processor<T> + 'static,
    {
        self.processors.push(Box::new(processor));
        self
    }

    /// Returns consumed items to `pool`.
    #[must_use]
    pub fn with_pool(mut self, pool: Arc<ItemPool<T>>) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Items fully processed so far.
    #[must_use]
    pub fn consumed(&self) -> u64 {
        self.consumed.load(Ordering::Relaxed)
    }

    fn retire(&self, item: T) {
        if let Some(pool) = &self.pool {
            pool.release(item);
        }
    }
}

impl<T: Send> StageLogic for SinkStage<T> {
    fn execute(&self, ctx: &mut StageContext) -> ExecutionResult {
        let mut batch = Vec::with_capacity(ctx.chunksize());
        if self.input.pop_into(&mut batch, ctx.chunksize()) == 0 {
            return ExecutionResult::ComeBackLater;
        }

        let mut items = batch.into_iter();
        while let Some(item) = items.next() {
            if let Err(e) = self.processors.iter().try_for_each(|p| p.process(&item)) {
                self.retire(item);
                self.input.requeue_front(items.collect());
                return ExecutionResult::Error(e);
            }
            self.retire(item);
            self.consumed.fetch_add(1, Ordering::Relaxed);
            ctx.record_items(1);
        }
        ExecutionResult::Success
    }

    fn finalize(&self) -> Result<(), StageError> {
        self.processors.iter().try_for_each(|p| p.finish())
    }

    fn pending(&self) -> usize {
        self.input.len()
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
    use parking_lot::Mutex;

    fn ctx(chunksize: usize) -> StageContext {
        StageContext::new(0, 0, chunksize)
    }

    #[test]
    fn test_processors_run_in_order() {
        let input = Arc::new(StageQueue::unbounded("in"));
        let log = Arc::new(Mutex::new(Vec::new()));
        let (first, second) = (Arc::clone(&log), Arc::clone(&log));
        let sink = SinkStage::new(Arc::clone(&input))
            .with_processor(move |x: &u32| {
                first.lock().push(format!("a{x}"));
                Ok(())
            })
            .with_processor(move |x: &u32| {
                second.lock().push(format!("b{x}"));
                Ok(())
            });

        let _ = input.try_push(1);
        let _ = input.try_push(2);
        assert_eq!(sink.pending(), 2);

        let mut c = ctx(10);
        assert_eq!(sink.execute(&mut c), ExecutionResult::Success);
        assert_eq!(c.items(), 2);
        assert_eq!(*log.lock(), vec!["a1", "b1", "a2", "b2"]);
        assert_eq!(sink.consumed(), 2);
        assert_eq!(sink.execute(&mut ctx(10)), ExecutionResult::ComeBackLater);
    }

    #[test]
    fn test_returns_items_to_pool() {
        let pool = Arc::new(ItemPool::new(2, true, || 0u32));
        let input = Arc::new(StageQueue::unbounded("in"));
        let sink = SinkStage::new(Arc::clone(&input)).with_pool(Arc::clone(&pool));

        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        let _ = input.try_push(a);
        let _ = input.try_push(b);
        assert_eq!(pool.available(), 0);

        let _ = sink.execute(&mut ctx(10));
        assert_eq!(pool.available(), 2);
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn test_processor_error() {
        let input = Arc::new(StageQueue::unbounded("in"));
        let sink = SinkStage::new(Arc::clone(&input)).with_processor(|x: &u32| {
            if *x == 1 {
                Err(StageError::new("cannot take 1"))
            } else {
                Ok(())
            }
        });
        let _ = input.try_push(0);
        let _ = input.try_push(1);
        let _ = input.try_push(2);

        let result = sink.execute(&mut ctx(10));
        assert_eq!(result, ExecutionResult::Error(StageError::new("cannot take 1")));
        assert_eq!(sink.consumed(), 1);
        assert_eq!(input.try_pop(10), vec![2]);
    }

    #[test]
    fn test_finalize_calls_finish() {
        struct Flush(Arc<Mutex<bool>>);
        impl Processor<u32> for Flush {
            fn process(&self, _item: &u32) -> Result<(), StageError> {
                Ok(())
            }
            fn finish(&self) -> Result<(), StageError> {
                *self.0.lock() = true;
                Ok(())
            }
        }

        let flushed = Arc::new(Mutex::new(false));
        let sink = SinkStage::new(Arc::new(StageQueue::unbounded("in")))
            .with_processor(Flush(Arc::clone(&flushed)));
        assert!(sink.finalize().is_ok());
        assert!(*flushed.lock());
    }
}
