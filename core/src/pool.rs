//! Timeline-gated object pooling.
//!
//! This module provides [`RetirePool<T>`], a pool for objects that are retired
//! while the GPU may still be reading them. Each retired object carries the
//! timeline value that must be reached before the object can be handed out
//! again. Callers feed the pool the device's completed timeline value and only
//! ever receive objects whose retire value has been reached.
//!
//! # Motivation
//!
//! In frame-based rendering, GPU-resident objects (meshes, transient buffers)
//! are logically destroyed on the CPU while in-flight command buffers still
//! reference them. Dropping them immediately would free memory the GPU is
//! using. `RetirePool` keeps them alive and recycles their allocations once
//! the timeline proves the GPU is done.
//!
//! # Example
//!
//! ```
//! use orogen_core::pool::RetirePool;
//!
//! let mut pool = RetirePool::new();
//! pool.push(vec![1u8, 2, 3], 5); // safe to reuse once value 5 is reached
//!
//! assert!(pool.pop(4).is_none()); // still in flight
//! assert_eq!(pool.pop(5), Some(vec![1, 2, 3]));
//! ```

use std::collections::VecDeque;

/// A pool of retired objects gated by timeline values.
///
/// Objects are pushed together with the timeline value at which they become
/// safe to reuse. [`pop`](RetirePool::pop) returns an object only once the
/// caller-observed completed value has reached the object's retire value.
#[derive(Debug)]
pub struct RetirePool<T> {
    // Kept sorted by retire value, oldest at the front.
    items: VecDeque<(u64, T)>,
}

impl<T> RetirePool<T> {
    /// Create an empty pool.
    pub fn new() -> Self {
        Self {
            items: VecDeque::new(),
        }
    }

    /// Retire an object. It becomes available once `retire_value` is reached.
    ///
    /// Retire values normally arrive in non-decreasing order; out-of-order
    /// pushes are inserted at the right position to keep the queue sorted.
    pub fn push(&mut self, item: T, retire_value: u64) {
        let pos = self
            .items
            .partition_point(|(value, _)| *value <= retire_value);
        self.items.insert(pos, (retire_value, item));
    }

    /// Take the oldest object whose retire value has been reached.
    ///
    /// `completed` is the device's completed timeline value. Returns `None`
    /// if the pool is empty or every pooled object is still in flight.
    pub fn pop(&mut self, completed: u64) -> Option<T> {
        match self.items.front() {
            Some((retire_value, _)) if *retire_value <= completed => {
                self.items.pop_front().map(|(_, item)| item)
            }
            _ => None,
        }
    }

    /// Take a reusable object, or create a fresh one if none is ready.
    pub fn pop_or_create(&mut self, completed: u64, create: impl FnOnce() -> T) -> T {
        self.pop(completed).unwrap_or_else(create)
    }

    /// Number of pooled objects, including those still in flight.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the pool holds no objects at all.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Drop every pooled object regardless of retire value.
    ///
    /// Only valid once the caller knows the device is idle.
    pub fn clear(&mut self) {
        self.items.clear();
    }

    /// Drain every pooled object regardless of retire value.
    ///
    /// Only valid once the caller knows the device is idle.
    pub fn drain(&mut self) -> impl Iterator<Item = T> + '_ {
        self.items.drain(..).map(|(_, item)| item)
    }
}

impl<T> Default for RetirePool<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_pool() {
        let mut pool = RetirePool::<u32>::new();
        assert!(pool.is_empty());
        assert_eq!(pool.pop(u64::MAX), None);
    }

    #[test]
    fn test_pop_respects_retire_value() {
        let mut pool = RetirePool::new();
        pool.push("mesh", 10);

        assert_eq!(pool.pop(9), None);
        assert_eq!(pool.pop(10), Some("mesh"));
        assert_eq!(pool.pop(10), None);
    }

    #[test]
    fn test_pop_returns_oldest_first() {
        let mut pool = RetirePool::new();
        pool.push(1, 5);
        pool.push(2, 7);
        pool.push(3, 7);

        assert_eq!(pool.pop(7), Some(1));
        assert_eq!(pool.pop(7), Some(2));
        assert_eq!(pool.pop(7), Some(3));
    }

    #[test]
    fn test_out_of_order_push_stays_sorted() {
        let mut pool = RetirePool::new();
        pool.push(1, 9);
        pool.push(2, 3);

        // The later-retiring object must not block the earlier one.
        assert_eq!(pool.pop(3), Some(2));
        assert_eq!(pool.pop(3), None);
        assert_eq!(pool.pop(9), Some(1));
    }

    #[test]
    fn test_pop_or_create() {
        let mut pool = RetirePool::new();
        pool.push(vec![1u8, 2, 3], 4);

        // Not reached: factory runs.
        let fresh = pool.pop_or_create(3, Vec::new);
        assert!(fresh.is_empty());
        assert_eq!(pool.len(), 1);

        // Reached: pooled object returned, factory skipped.
        let reused = pool.pop_or_create(4, || panic!("factory must not run"));
        assert_eq!(reused, vec![1, 2, 3]);
        assert!(pool.is_empty());
    }

    #[test]
    fn test_never_reissued_early() {
        let mut pool = RetirePool::new();
        for value in 0..16u64 {
            pool.push(value, value);
        }
        for completed in 0..16u64 {
            // Exactly one object becomes available per step.
            assert_eq!(pool.pop(completed), Some(completed));
            assert_eq!(pool.pop(completed), None);
        }
    }

    #[test]
    fn test_drain_ignores_retire_values() {
        let mut pool = RetirePool::new();
        pool.push(1, 100);
        pool.push(2, 200);

        let all: Vec<_> = pool.drain().collect();
        assert_eq!(all, vec![1, 2]);
        assert!(pool.is_empty());
    }
}
