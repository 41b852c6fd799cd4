//! # Stage Queue
//!
//! Bounded (or unbounded) multi-producer multi-consumer holding area for
//! in-flight items between two stages.
//!
//! ## Design
//!
//! - A short critical section around a `VecDeque` keeps pushes and batched
//!   pops safe under any number of producers and consumers
//! - Depth is mirrored in an atomic so the scheduler can read it without
//!   taking the queue lock
//! - The capacity threshold can be retuned at runtime
//! - `Full` is a normal outcome that drives `ComeBackLater` upstream; the
//!   rejected item is handed back to the caller, never dropped
//!
//! Item order is preserved per queue. Across parallel consumers no ordering
//! is guaranteed.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;
use serde::Serialize;

/// Outcome of [`StageQueue::try_push`].
#[derive(Debug, PartialEq, Eq)]
#[must_use]
pub enum PushResult<T> {
    /// The item was enqueued.
    Accepted,
    /// The queue is at its threshold; the item is returned.
    Full(T),
}

impl<T> PushResult<T> {
    /// Returns true if the item was enqueued.
    #[must_use]
    pub fn is_accepted(&self) -> bool {
        matches!(self, PushResult::Accepted)
    }
}

/// A thread-safe queue connecting two stages.
///
/// # Example
///
/// ```rust
/// use sluice_core::queue::{PushResult, StageQueue};
///
/// let queue: StageQueue<u32> = StageQueue::bounded("events", 2);
/// assert!(queue.try_push(1).is_accepted());
/// assert!(queue.try_push(2).is_accepted());
/// assert_eq!(queue.try_push(3), PushResult::Full(3));
///
/// assert_eq!(queue.try_pop(8), vec![1, 2]);
/// assert!(queue.is_empty());
/// ```
pub struct StageQueue<T> {
    name: String,
    items: Mutex<VecDeque<T>>,
    depth: AtomicUsize,
    threshold: AtomicUsize,
    pushed: AtomicU64,
    popped: AtomicU64,
    rejected: AtomicU64,
}

impl<T> fmt::Debug for StageQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageQueue")
            .field("name", &self.name)
            .field("len", &self.len())
            .field("threshold", &self.threshold())
            .finish_non_exhaustive()
    }
}

impl<T> StageQueue<T> {
    /// Creates a queue that accepts at most `threshold` items (minimum 1).
    #[must_use]
    pub fn bounded(name: impl Into<String>, threshold: usize) -> Self {
        Self::with_threshold(name.into(), threshold.max(1))
    }

    /// Creates a queue without a capacity limit.
    #[must_use]
    pub fn unbounded(name: impl Into<String>) -> Self {
        Self::with_threshold(name.into(), usize::MAX)
    }

    fn with_threshold(name: String, threshold: usize) -> Self {
        Self {
            name,
            items: Mutex::new(VecDeque::new()),
            depth: AtomicUsize::new(0),
            threshold: AtomicUsize::new(threshold),
            pushed: AtomicU64::new(0),
            popped: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    /// Returns the queue name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Attempts to enqueue one item.
    pub fn try_push(&self, item: T) -> PushResult<T> {
        let mut items = self.items.lock();
        if items.len() >= self.threshold.load(Ordering::Relaxed) {
            drop(items);
            self.rejected.fetch_add(1, Ordering::Relaxed);
            return PushResult::Full(item);
        }
        items.push_back(item);
        self.depth.store(items.len(), Ordering::Release);
        drop(items);
        self.pushed.fetch_add(1, Ordering::Relaxed);
        PushResult::Accepted
    }

    /// Moves as many items as fit from the front of `items` into the queue.
    ///
    /// Items that do not fit stay in `items`, in order. Returns the number
    /// of items moved.
    pub fn try_push_from(&self, items: &mut VecDeque<T>) -> usize {
        if items.is_empty() {
            return 0;
        }
        let mut queue = self.items.lock();
        let room = self
            .threshold
            .load(Ordering::Relaxed)
            .saturating_sub(queue.len());
        let n = room.min(items.len());
        queue.extend(items.drain(..n));
        self.depth.store(queue.len(), Ordering::Release);
        drop(queue);
        self.pushed.fetch_add(n as u64, Ordering::Relaxed);
        if !items.is_empty() {
            self.rejected.fetch_add(1, Ordering::Relaxed);
        }
        n
    }

    /// Dequeues up to `max_count` items, oldest first.
    ///
    /// # Note
    ///
    /// This method allocates. Use [`pop_into`](Self::pop_into) to reuse a
    /// buffer.
    #[must_use]
    pub fn try_pop(&self, max_count: usize) -> Vec<T> {
        let mut out = Vec::new();
        self.pop_into(&mut out, max_count);
        out
    }

    /// Dequeues up to `max_count` items, appending them to `buffer`.
    ///
    /// Returns the number of items appended.
    pub fn pop_into(&self, buffer: &mut Vec<T>, max_count: usize) -> usize {
        if max_count == 0 || self.depth.load(Ordering::Acquire) == 0 {
            return 0;
        }
        let mut items = self.items.lock();
        let n = max_count.min(items.len());
        buffer.extend(items.drain(..n));
        self.depth.store(items.len(), Ordering::Release);
        drop(items);
        self.popped.fetch_add(n as u64, Ordering::Relaxed);
        n
    }

    /// Puts popped items back at the head of the queue, in their original
    /// order, for a consumer that could not process them.
    ///
    /// The threshold is ignored: the items held their places before.
    pub fn requeue_front(&self, returned: Vec<T>) {
        if returned.is_empty() {
            return;
        }
        let n = returned.len();
        let mut items = self.items.lock();
        for item in returned.into_iter().rev() {
            items.push_front(item);
        }
        self.depth.store(items.len(), Ordering::Release);
        drop(items);
        self.popped.fetch_sub(n as u64, Ordering::Relaxed);
    }

    /// Dequeues a single item.
    #[must_use]
    pub fn pop(&self) -> Option<T> {
        if self.depth.load(Ordering::Acquire) == 0 {
            return None;
        }
        let mut items = self.items.lock();
        let item = items.pop_front();
        self.depth.store(items.len(), Ordering::Release);
        drop(items);
        if item.is_some() {
            self.popped.fetch_add(1, Ordering::Relaxed);
        }
        item
    }

    /// Current number of queued items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.depth.load(Ordering::Acquire)
    }

    /// Returns true if no items are queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Capacity threshold (`usize::MAX` when unbounded).
    #[must_use]
    pub fn threshold(&self) -> usize {
        self.threshold.load(Ordering::Relaxed)
    }

    /// Retunes the capacity threshold (minimum 1).
    ///
    /// Lowering the threshold below the current depth never drops items;
    /// pushes are simply rejected until the depth falls.
    pub fn set_threshold(&self, threshold: usize) {
        self.threshold.store(threshold.max(1), Ordering::Relaxed);
    }

    /// Returns true if the queue has no capacity limit.
    #[must_use]
    pub fn is_unbounded(&self) -> bool {
        self.threshold() == usize::MAX
    }

    /// Number of items that can currently be pushed.
    #[must_use]
    pub fn free_capacity(&self) -> usize {
        self.threshold().saturating_sub(self.len())
    }

    /// Returns true if a push would be rejected.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.free_capacity() == 0
    }

    /// Returns a snapshot of the queue counters.
    #[must_use]
    pub fn metrics(&self) -> QueueMetricsSnapshot {
        QueueMetricsSnapshot {
            depth: self.len(),
            threshold: self.threshold(),
            pushed: self.pushed.load(Ordering::Relaxed),
            popped: self.popped.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }
}

/// Counters of a queue at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueueMetricsSnapshot {
    /// Items currently queued.
    pub depth: usize,
    /// Capacity threshold.
    pub threshold: usize,
    /// Items accepted since creation.
    pub pushed: u64,
    /// Items dequeued since creation.
    pub popped: u64,
    /// Push attempts rejected because the queue was full.
    pub rejected: u64,
}

/// Type-erased view of a queue, used by the topology for inspection.
pub trait QueueHandle: Send + Sync {
    /// Queue name.
    fn name(&self) -> &str;
    /// Current depth.
    fn len(&self) -> usize;
    /// Returns true if no items are queued.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
    /// Capacity threshold.
    fn threshold(&self) -> usize;
    /// Retunes the capacity threshold.
    fn set_threshold(&self, threshold: usize);
    /// Counter snapshot.
    fn metrics(&self) -> QueueMetricsSnapshot;
}

impl<T: Send> QueueHandle for StageQueue<T> {
    fn name(&self) -> &str {
        StageQueue::name(self)
    }

    fn len(&self) -> usize {
        StageQueue::len(self)
    }

    fn threshold(&self) -> usize {
        StageQueue::threshold(self)
    }

    fn set_threshold(&self, threshold: usize) {
        StageQueue::set_threshold(self, threshold);
    }

    fn metrics(&self) -> QueueMetricsSnapshot {
        StageQueue::metrics(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_push_until_full() {
        let queue = StageQueue::bounded("q", 3);
        for i in 0..3 {
            assert!(queue.try_push(i).is_accepted());
        }
        assert!(queue.is_full());
        assert_eq!(queue.try_push(99), PushResult::Full(99));
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.metrics().rejected, 1);
    }

    #[test]
    fn test_pop_order_and_limits() {
        let queue = StageQueue::unbounded("q");
        for i in 0..10 {
            let _ = queue.try_push(i);
        }
        assert_eq!(queue.try_pop(0), Vec::<i32>::new());
        assert_eq!(queue.try_pop(3), vec![0, 1, 2]);
        assert_eq!(queue.pop(), Some(3));
        assert_eq!(queue.try_pop(100), vec![4, 5, 6, 7, 8, 9]);
        assert!(queue.try_pop(1).is_empty());
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn test_pop_into_reuses_buffer() {
        let queue = StageQueue::bounded("q", 8);
        for i in 0..5 {
            let _ = queue.try_push(i);
        }
        let mut buffer = Vec::with_capacity(8);
        assert_eq!(queue.pop_into(&mut buffer, 2), 2);
        assert_eq!(queue.pop_into(&mut buffer, 10), 3);
        assert_eq!(buffer, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_try_push_from_partial() {
        let queue = StageQueue::bounded("q", 2);
        let mut pending: VecDeque<i32> = (0..5).collect();
        assert_eq!(queue.try_push_from(&mut pending), 2);
        assert_eq!(pending, VecDeque::from(vec![2, 3, 4]));
        assert_eq!(queue.try_pop(10), vec![0, 1]);
        assert_eq!(queue.try_push_from(&mut pending), 2);
        assert_eq!(pending, VecDeque::from(vec![4]));
    }

    #[test]
    fn test_requeue_front_restores_order() {
        let queue = StageQueue::bounded("q", 4);
        for i in 0..4 {
            let _ = queue.try_push(i);
        }
        let mut taken = queue.try_pop(3);
        assert_eq!(taken, vec![0, 1, 2]);
        let _ = queue.try_push(4);
        let _ = queue.try_push(5);

        taken.remove(0);
        queue.requeue_front(taken);
        assert_eq!(queue.len(), 5);
        assert_eq!(queue.metrics().popped, 1);
        assert_eq!(queue.try_pop(10), vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_set_threshold() {
        let queue = StageQueue::bounded("q", 1);
        assert!(queue.try_push(1).is_accepted());
        assert!(!queue.try_push(2).is_accepted());
        queue.set_threshold(4);
        assert_eq!(queue.free_capacity(), 3);
        assert!(queue.try_push(2).is_accepted());
        queue.set_threshold(0);
        assert_eq!(queue.threshold(), 1);
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.free_capacity(), 0);
    }

    #[test]
    fn test_unbounded() {
        let queue = StageQueue::unbounded("q");
        assert!(queue.is_unbounded());
        for i in 0..10_000 {
            assert!(queue.try_push(i).is_accepted());
        }
        assert!(!queue.is_full());
    }

    #[test]
    fn test_type_erased_handle() {
        let queue: Arc<dyn QueueHandle> = Arc::new(StageQueue::<String>::bounded("named", 4));
        assert_eq!(queue.name(), "named");
        assert!(queue.is_empty());
        queue.set_threshold(9);
        assert_eq!(queue.threshold(), 9);
    }

    #[test]
    fn test_concurrent_producers_consumers_lose_nothing() {
        const PRODUCERS: usize = 4;
        const PER_PRODUCER: usize = 5_000;

        let queue = Arc::new(StageQueue::bounded("q", 64));
        let producers: Vec<_> = (0..PRODUCERS)
            .map(|p| {
                let queue = Arc::clone(&queue);
                thread::spawn(move || {
                    for i in 0..PER_PRODUCER {
                        let mut item = p * PER_PRODUCER + i;
                        loop {
                            match queue.try_push(item) {
                                PushResult::Accepted => break,
                                PushResult::Full(back) => {
                                    item = back;
                                    thread::yield_now();
                                }
                            }
                        }
                    }
                })
            })
            .collect();

        let consumers: Vec<_> = (0..4)
            .map(|_| {
                let queue = Arc::clone(&queue);
                thread::spawn(move || {
                    let mut seen = Vec::new();
                    let mut idle = 0;
                    while idle < 10_000 {
                        let n = queue.pop_into(&mut seen, 7);
                        if n == 0 {
                            idle += 1;
                            thread::yield_now();
                        } else {
                            idle = 0;
                        }
                    }
                    seen
                })
            })
            .collect();

        for p in producers {
            p.join().unwrap();
        }
        let mut all: Vec<usize> = consumers
            .into_iter()
            .flat_map(|c| c.join().unwrap())
            .collect();
        all.extend(queue.try_pop(usize::MAX));
        all.sort_unstable();
        assert_eq!(all, (0..PRODUCERS * PER_PRODUCER).collect::<Vec<_>>());
    }
}
