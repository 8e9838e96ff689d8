//! Bounded, time-ordered retention window for ingested frames.
//!
//! The latency buffer is the single store every other component works against:
//! the ingest loop appends to it, request handlers search it, and the retention
//! logic pops from it.
//!
//! # Strategies
//!
//! Two concrete ring-buffer strategies implement the same capability traits:
//!
//! - [`SearchableBuffer`]: enforces non-decreasing timestamps on write and
//!   answers range lookups with a binary search over the ring.
//! - [`FifoBuffer`]: plain overwrite-oldest FIFO, range lookups fall back to a
//!   linear scan.
//!
//! # Thread Safety
//!
//! One writer (the ingest thread) and any number of readers. Each strategy
//! keeps its ring behind a `parking_lot::RwLock` that is held only while
//! indices move or while reference-counted frame handles are cloned out, never
//! while payload bytes are copied. Readers never observe a partially written
//! element: an element becomes visible when the write lock is released.
//!
//! # Full-buffer policy
//!
//! When occupancy equals capacity, a write evicts the oldest element first
//! and reports [`WriteOutcome::Overwrote`]. The newest data is never dropped.

mod fifo;
mod searchable;

pub use fifo::FifoBuffer;
pub use searchable::SearchableBuffer;

use crate::error::BufferError;
use crate::frame::Timestamp;
use parking_lot::MappedRwLockReadGuard;
use std::collections::VecDeque;

/// Smallest capacity a latency buffer can be configured with.
pub const MIN_CAPACITY: usize = 2;

/// Result of a successful write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The element was appended without evicting anything.
    Appended,
    /// The buffer was full; the oldest element was evicted to make room.
    Overwrote,
}

/// Capability interface shared by all latency buffer strategies.
///
/// Buffers are neither `Clone` nor movable once shared: they are created once
/// per ingest stream and accessed through an `Arc`.
pub trait LatencyBuffer<T>: Send + Sync {
    /// Maximum number of elements retained.
    fn capacity(&self) -> usize;

    /// Number of live elements. Never exceeds [`capacity`](Self::capacity).
    fn occupancy(&self) -> usize;

    /// Move `element` into the back of the buffer.
    fn write(&self, element: T) -> Result<WriteOutcome, BufferError>;

    /// Copy `element` into the back of the buffer.
    fn put(&self, element: &T) -> Result<WriteOutcome, BufferError>
    where
        T: Clone,
    {
        self.write(element.clone())
    }

    /// Remove and return the oldest element.
    fn read(&self) -> Option<T>;

    /// Peek at the oldest element.
    ///
    /// The returned guard blocks the writer; drop it promptly.
    fn front(&self) -> Option<MappedRwLockReadGuard<'_, T>>;

    /// Peek at the newest element.
    ///
    /// The returned guard blocks the writer; drop it promptly.
    fn back(&self) -> Option<MappedRwLockReadGuard<'_, T>>;

    /// Discard up to `amount` of the oldest elements, returning how many were removed.
    fn pop(&self, amount: usize) -> usize;

    /// Discard every element.
    fn flush(&self) -> usize {
        self.pop(usize::MAX)
    }

    /// Change the capacity, keeping the newest elements that still fit.
    ///
    /// Requires exclusive access, which is only available while the ingest
    /// loop is quiesced.
    fn resize(&mut self, capacity: usize) -> Result<(), BufferError>;

    /// True when the buffer holds no elements.
    fn is_empty(&self) -> bool {
        self.occupancy() == 0
    }
}

/// Consistent view of a timestamp range taken under a single read lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeSnapshot<T> {
    /// Timestamp of the oldest stored element at lookup time.
    pub oldest: Option<Timestamp>,
    /// Timestamp of the newest stored element at lookup time.
    pub newest: Option<Timestamp>,
    /// Stored elements with `begin <= timestamp <= end`, in buffer order.
    pub frames: Vec<T>,
}

impl<T> RangeSnapshot<T> {
    /// Snapshot of an empty buffer.
    pub fn empty() -> Self {
        Self {
            oldest: None,
            newest: None,
            frames: Vec::new(),
        }
    }

    /// True when `[begin, end]` lies entirely within the retained range.
    pub fn covers(&self, begin: Timestamp, end: Timestamp) -> bool {
        match (self.oldest, self.newest) {
            (Some(oldest), Some(newest)) => oldest <= begin && end <= newest,
            _ => false,
        }
    }
}

/// Latency buffers that can be searched by timestamp range.
pub trait RangeLookup<T>: LatencyBuffer<T> {
    /// All stored elements whose timestamps fall in the inclusive range `[begin, end]`.
    fn lookup(&self, begin: Timestamp, end: Timestamp) -> RangeSnapshot<T>;

    /// Smallest timestamp currently stored, regardless of insertion order.
    fn oldest_timestamp(&self) -> Option<Timestamp>;
}

/// Fixed-capacity ring shared by the buffer strategies.
///
/// Not synchronized on its own; always wrapped in a lock by its owner.
#[derive(Debug)]
pub(crate) struct Ring<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T> Ring<T> {
    pub(crate) fn with_capacity(capacity: usize) -> Result<Self, BufferError> {
        if capacity == 0 {
            return Err(BufferError::ZeroCapacity);
        }
        Ok(Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
        })
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    pub(crate) fn len(&self) -> usize {
        self.items.len()
    }

    pub(crate) fn items(&self) -> &VecDeque<T> {
        &self.items
    }

    pub(crate) fn push(&mut self, element: T) -> WriteOutcome {
        let outcome = if self.items.len() >= self.capacity {
            self.items.pop_front();
            WriteOutcome::Overwrote
        } else {
            WriteOutcome::Appended
        };
        self.items.push_back(element);
        outcome
    }

    pub(crate) fn pop_front(&mut self) -> Option<T> {
        self.items.pop_front()
    }

    pub(crate) fn discard(&mut self, amount: usize) -> usize {
        let n = amount.min(self.items.len());
        self.items.drain(..n);
        n
    }

    pub(crate) fn resize(&mut self, capacity: usize) -> Result<(), BufferError> {
        if capacity == 0 {
            return Err(BufferError::ZeroCapacity);
        }
        let excess = self.items.len().saturating_sub(capacity);
        self.items.drain(..excess);
        self.items.shrink_to(capacity);
        self.items.reserve_exact(capacity - self.items.len());
        self.capacity = capacity;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_rejects_zero_capacity() {
        assert_eq!(
            Ring::<u32>::with_capacity(0).unwrap_err(),
            BufferError::ZeroCapacity
        );
    }

    #[test]
    fn test_ring_overwrites_oldest() {
        let mut ring = Ring::with_capacity(3).unwrap();
        assert_eq!(ring.push(1), WriteOutcome::Appended);
        assert_eq!(ring.push(2), WriteOutcome::Appended);
        assert_eq!(ring.push(3), WriteOutcome::Appended);
        assert_eq!(ring.push(4), WriteOutcome::Overwrote);
        assert_eq!(ring.items().iter().copied().collect::<Vec<_>>(), vec![2, 3, 4]);
    }

    #[test]
    fn test_ring_resize_keeps_newest() {
        let mut ring = Ring::with_capacity(5).unwrap();
        for i in 0..5 {
            ring.push(i);
        }
        ring.resize(2).unwrap();
        assert_eq!(ring.capacity(), 2);
        assert_eq!(ring.items().iter().copied().collect::<Vec<_>>(), vec![3, 4]);

        ring.resize(4).unwrap();
        assert_eq!(ring.push(5), WriteOutcome::Appended);
        assert_eq!(ring.len(), 3);
    }

    #[test]
    fn test_snapshot_covers() {
        let snap = RangeSnapshot::<u8> {
            oldest: Some(10),
            newest: Some(20),
            frames: Vec::new(),
        };
        assert!(snap.covers(10, 20));
        assert!(snap.covers(12, 15));
        assert!(!snap.covers(9, 15));
        assert!(!snap.covers(15, 21));
        assert!(!RangeSnapshot::<u8>::empty().covers(0, 0));
    }
}
