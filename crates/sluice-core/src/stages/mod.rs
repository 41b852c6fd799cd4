//! # Stage Bodies
//!
//! Ready-made [`StageLogic`] implementations for the common node shapes:
//!
//! - [`SourceStage`]: pulls items from an [`ItemSource`] into a queue
//! - [`MapStage`]: one-to-one transform between two queues
//! - [`SplitStage`]: breaks blocks into items with a [`Splitter`]
//! - [`SinkStage`]: hands terminal items to an ordered list of [`Processor`]s
//! - [`GroupStage`]: fuses several bodies into one schedulable node
//! - [`FnStage`]: wraps a closure
//!
//! Every body that writes to a queue keeps an overflow buffer for items it
//! could not push, so a full queue never loses an item. Overflow counts as
//! pending work.

mod group;
mod map;
mod sink;
mod source;
mod split;

use std::fmt;

use crate::stage::{ExecutionResult, StageContext, StageError, StageLogic};

pub use group::GroupStage;
pub use map::MapStage;
pub use sink::{Processor, SinkStage};
pub use source::{CountingSource, ItemSource, SourcePoll, SourceStage};
pub use split::{SplitProgress, SplitStage, Splitter};

type ExecFn = Box<dyn Fn(&mut StageContext) -> ExecutionResult + Send + Sync>;
type PendingFn = Box<dyn Fn() -> usize + Send + Sync>;
type HookFn = Box<dyn Fn() -> Result<(), StageError> + Send + Sync>;

/// A stage body built from closures.
///
/// # Example
///
/// ```
/// use sluice_core::stages::FnStage;
/// use sluice_core::{ExecutionResult, StageContext, StageLogic};
///
/// let stage = FnStage::new(|ctx: &mut StageContext| {
///     ctx.record_items(1);
///     ExecutionResult::Finished
/// });
/// let mut ctx = StageContext::new(0, 0, 1);
/// assert_eq!(stage.execute(&mut ctx), ExecutionResult::Finished);
/// ```
pub struct FnStage {
    exec: ExecFn,
    pending: Option<PendingFn>,
    on_initialize: Option<HookFn>,
    on_finalize: Option<HookFn>,
}

impl fmt::Debug for FnStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnStage").finish_non_exhaustive()
    }
}

impl FnStage {
    /// Creates a body whose `execute` calls `exec`.
    pub fn new<F>(exec: F) -> Self
    where
        F: Fn(&mut StageContext) -> ExecutionResult + Send + Sync + 'static,
    {
        Self {
            exec: Box::new(exec),
            pending: None,
            on_initialize: None,
            on_finalize: None,
        }
    }

    /// Reports pending work through `pending`.
    #[must_use]
    pub fn with_pending<P>(mut self, pending: P) -> Self
    where
        P: Fn() -> usize + Send + Sync + 'static,
    {
        self.pending = Some(Box::new(pending));
        self
    }

    /// Runs `hook` on initialization.
    #[must_use]
    pub fn on_initialize<H>(mut self, hook: H) -> Self
    where
        H: Fn() -> Result<(), StageError> + Send + Sync + 'static,
    {
        self.on_initialize = Some(Box::new(hook));
        self
    }

    /// Runs `hook` on finalization.
    #[must_use]
    pub fn on_finalize<H>(mut self, hook: H) -> Self
    where
        H: Fn() -> Result<(), StageError> + Send + Sync + 'static,
    {
        self.on_finalize = Some(Box::new(hook));
        self
    }
}

impl StageLogic for FnStage {
    fn initialize(&self) -> Result<(), StageError> {
        self.on_initialize.as_ref().map_or(Ok(()), |hook| hook())
    }

    fn execute(&self, ctx: &mut StageContext) -> ExecutionResult {
        (self.exec)(ctx)
    }

    fn finalize(&self) -> Result<(), StageError> {
        self.on_finalize.as_ref().map_or(Ok(()), |hook| hook())
    }

    fn pending(&self) -> usize {
        self.pending.as_ref().map_or(0, |pending| pending())
    }
}
