//! Block disentangling: one input block becomes many output items.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::queue::StageQueue;
use crate::stage::{ExecutionResult, StageContext, StageError, StageLogic};

/// Progress of a [`Splitter`] on one block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplitProgress {
    /// The block is fully consumed.
    Done,
    /// The block has more items; call `split` again.
    Partial,
}

/// Breaks a block into items.
pub trait Splitter<B, T>: Send {
    /// Extracts items from `block` into `out`.
    ///
    /// A splitter may stop early and return [`SplitProgress::Partial`]; the
    /// block is then handed back on the next call.
    ///
    /// # Errors
    ///
    /// Returns an error if the block is malformed.
    fn split(&mut self, block: &mut B, out: &mut Vec<T>) -> Result<SplitProgress, StageError>;

    /// Receives a fully consumed block, for example to return it to a pool.
    fn recycle(&mut self, _block: B) {}
}

struct SplitInner<S, B, T> {
    splitter: S,
    current: Option<B>,
    overflow: VecDeque<T>,
    scratch: Vec<T>,
}

/// Stage body driving a [`Splitter`] between a block queue and an item queue.
///
/// Holds at most one block in progress. Items that do not fit the output
/// queue are kept and flushed before the next block is touched.
pub struct SplitStage<S, B, T> {
    input: Arc<StageQueue<B>>,
    output: Arc<StageQueue<T>>,
    inner: Mutex<SplitInner<S, B, T>>,
    held: AtomicUsize,
}

impl<S, B, T> SplitStage<S, B, T>
where
    S: Splitter<B, T>,
{
    /// Creates a body reading blocks from `input` and writing items to `output`.
    pub fn new(splitter: S, input: Arc<StageQueue<B>>, output: Arc<StageQueue<T>>) -> Self {
        Self {
            input,
            output,
            inner: Mutex::new(SplitInner {
                splitter,
                current: None,
                overflow: VecDeque::new(),
                scratch: Vec::new(),
            }),
            held: AtomicUsize::new(0),
        }
    }
}

impl<S, B, T> StageLogic for SplitStage<S, B, T>
where
    S: Splitter<B, T>,
    B: Send,
    T: Send,
{
    fn execute(&self, ctx: &mut StageContext) -> ExecutionResult {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let mut emitted = self.output.try_push_from(&mut inner.overflow);
        let mut outcome = Ok(());

        while inner.overflow.is_empty() && emitted < ctx.chunksize() {
            let Some(mut block) = inner.current.take().or_else(|| self.input.pop()) else {
                break;
            };
            inner.scratch.clear();
            match inner.splitter.split(&mut block, &mut inner.scratch) {
                Ok(SplitProgress::Done) => inner.splitter.recycle(block),
                Ok(SplitProgress::Partial) => inner.current = Some(block),
                Err(e) => {
                    outcome = Err(e);
                    break;
                }
            }
            inner.overflow.extend(inner.scratch.drain(..));
            emitted += self.output.try_push_from(&mut inner.overflow);
        }

        let held = inner.overflow.len() + usize::from(inner.current.is_some());
        self.held.store(held, Ordering::Relaxed);
        drop(guard);

        ctx.record_items(emitted);
        match outcome {
            Err(e) => ExecutionResult::Error(e),
            Ok(()) if emitted > 0 => ExecutionResult::Success,
            Ok(()) => ExecutionResult::ComeBackLater,
        }
    }

    fn pending(&self) -> usize {
        self.input.len() + self.held.load(Ordering::Relaxed)
    }

    fn threshold(&self) -> usize {
        self.input.threshold()
    }

    fn set_threshold(&self, threshold: usize) {
        self.input.set_threshold(threshold);
    }
}
