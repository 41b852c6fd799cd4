//! Shared item pool for recycling in-flight items.
//!
//! Pre-allocates items at creation so that sources can acquire an item
//! without allocating, and sinks hand it back when it has been consumed.
//! When the in-flight limit is on, the pool capacity is also the maximum
//! number of items alive in the pipeline: an empty pool makes the source
//! report `ComeBackLater` instead of allocating.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::config::EngineConfig;

type Factory<T> = Box<dyn Fn() -> T + Send + Sync>;
type Reset<T> = Box<dyn Fn(&mut T) + Send + Sync>;

/// Thread-safe pool of reusable items.
///
/// # Example
///
/// ```
/// use sluice_core::pool::ItemPool;
///
/// let pool = ItemPool::new(2, true, || Vec::<u8>::with_capacity(64));
/// let a = pool.acquire().expect("pool not empty");
/// let b = pool.acquire().expect("pool not empty");
/// assert!(pool.acquire().is_none());
///
/// pool.release(a);
/// pool.release(b);
/// assert_eq!(pool.available(), 2);
/// ```
pub struct ItemPool<T> {
    free_list: Mutex<Vec<T>>,
    capacity: usize,
    limit_in_flight: bool,
    in_use: AtomicUsize,
    factory: Factory<T>,
    reset: Option<Reset<T>>,
}

impl<T> fmt::Debug for ItemPool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ItemPool")
            .field("capacity", &self.capacity)
            .field("limit_in_flight", &self.limit_in_flight)
            .field("available", &self.available())
            .field("in_use", &self.in_use())
            .finish_non_exhaustive()
    }
}

impl<T> ItemPool<T> {
    /// Creates a pool pre-populated with `capacity` items from `factory`.
    ///
    /// With `limit_in_flight` set, at most `capacity` items can be acquired
    /// at once. Otherwise an empty pool falls back to `factory`.
    pub fn new<F>(capacity: usize, limit_in_flight: bool, factory: F) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        let free_list = (0..capacity).map(|_| factory()).collect();
        Self {
            free_list: Mutex::new(free_list),
            capacity,
            limit_in_flight,
            in_use: AtomicUsize::new(0),
            factory: Box::new(factory),
            reset: None,
        }
    }

    /// Creates a pool sized by the engine configuration.
    pub fn from_config<F>(config: &EngineConfig, factory: F) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        Self::new(config.pool_size, config.limit_in_flight, factory)
    }

    /// Sets a function that clears an item before it is stored again.
    #[must_use]
    pub fn with_reset<R>(mut self, reset: R) -> Self
    where
        R: Fn(&mut T) + Send + Sync + 'static,
    {
        self.reset = Some(Box::new(reset));
        self
    }

    /// Takes an item from the pool.
    ///
    /// Returns `None` only when the in-flight limit is reached.
    pub fn acquire(&self) -> Option<T> {
        let item = self.free_list.lock().pop();
        let item = match item {
            Some(item) => item,
            None if self.limit_in_flight => return None,
            None => (self.factory)(),
        };
        self.in_use.fetch_add(1, Ordering::Relaxed);
        Some(item)
    }

    /// Returns an item to the pool.
    ///
    /// Returns `false` if the pool was already full and the item was dropped.
    pub fn release(&self, mut item: T) -> bool {
        // Saturating: items minted outside the pool may be released too.
        let _ = self
            .in_use
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
        if let Some(reset) = &self.reset {
            reset(&mut item);
        }
        let mut free_list = self.free_list.lock();
        if free_list.len() >= self.capacity {
            return false;
        }
        free_list.push(item);
        true
    }

    /// Items currently stored in the pool.
    #[must_use]
    pub fn available(&self) -> usize {
        self.free_list.lock().len()
    }

    /// Items acquired and not yet released.
    #[must_use]
    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Relaxed)
    }

    /// Maximum number of stored items.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Whether `acquire` refuses to allocate past the capacity.
    #[must_use]
    pub fn limits_in_flight(&self) -> bool {
        self.limit_in_flight
    }
}
