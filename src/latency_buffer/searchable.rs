//! Timestamp-ordered latency buffer with binary-search range lookup.

use super::{LatencyBuffer, RangeLookup, RangeSnapshot, Ring, WriteOutcome};
use crate::error::BufferError;
use crate::frame::{Timestamp, Timestamped};
use parking_lot::{MappedRwLockReadGuard, RwLock, RwLockReadGuard};

/// Latency buffer that keeps elements in non-decreasing timestamp order.
///
/// Writes older than the newest stored element are rejected with
/// [`BufferError::OutOfOrder`] and leave the buffer unchanged. Equal
/// timestamps are accepted. Because order is an invariant, lookups locate
/// both ends of the requested window in `O(log n)` and only clone the
/// matching elements.
///
/// # Example
///
/// ```
/// use daq_readout::frame::DataFrame;
/// use daq_readout::latency_buffer::{LatencyBuffer, RangeLookup, SearchableBuffer};
///
/// let buffer = SearchableBuffer::new(16).unwrap();
/// for ts in 10..=20 {
///     buffer.write(DataFrame::with_pattern(ts, 8)).unwrap();
/// }
/// let snap = buffer.lookup(13, 16);
/// assert_eq!(snap.frames.len(), 4);
/// ```
#[derive(Debug)]
pub struct SearchableBuffer<T> {
    ring: RwLock<Ring<T>>,
}

impl<T> SearchableBuffer<T> {
    /// Create a buffer retaining at most `capacity` elements.
    pub fn new(capacity: usize) -> Result<Self, BufferError> {
        Ok(Self {
            ring: RwLock::new(Ring::with_capacity(capacity)?),
        })
    }
}

impl<T: Timestamped + Send + Sync> LatencyBuffer<T> for SearchableBuffer<T> {
    fn capacity(&self) -> usize {
        self.ring.read().capacity()
    }

    fn occupancy(&self) -> usize {
        self.ring.read().len()
    }

    fn write(&self, element: T) -> Result<WriteOutcome, BufferError> {
        let mut ring = self.ring.write();
        if let Some(newest) = ring.items().back().map(Timestamped::timestamp) {
            let got = element.timestamp();
            if got < newest {
                return Err(BufferError::OutOfOrder { newest, got });
            }
        }
        Ok(ring.push(element))
    }

    fn read(&self) -> Option<T> {
        self.ring.write().pop_front()
    }

    fn front(&self) -> Option<MappedRwLockReadGuard<'_, T>> {
        RwLockReadGuard::try_map(self.ring.read(), |ring| ring.items().front()).ok()
    }

    fn back(&self) -> Option<MappedRwLockReadGuard<'_, T>> {
        RwLockReadGuard::try_map(self.ring.read(), |ring| ring.items().back()).ok()
    }

    fn pop(&self, amount: usize) -> usize {
        self.ring.write().discard(amount)
    }

    fn resize(&mut self, capacity: usize) -> Result<(), BufferError> {
        self.ring.get_mut().resize(capacity)
    }
}

impl<T: Timestamped + Clone + Send + Sync> RangeLookup<T> for SearchableBuffer<T> {
    fn lookup(&self, begin: Timestamp, end: Timestamp) -> RangeSnapshot<T> {
        let ring = self.ring.read();
        let items = ring.items();
        let (Some(first), Some(last)) = (items.front(), items.back()) else {
            return RangeSnapshot::empty();
        };
        let oldest = first.timestamp();
        let newest = last.timestamp();

        let frames = if begin > end {
            Vec::new()
        } else {
            let start = items.partition_point(|e| e.timestamp() < begin);
            let stop = items.partition_point(|e| e.timestamp() <= end);
            items.range(start..stop).cloned().collect()
        };

        RangeSnapshot {
            oldest: Some(oldest),
            newest: Some(newest),
            frames,
        }
    }

    fn oldest_timestamp(&self) -> Option<Timestamp> {
        self.ring.read().items().front().map(Timestamped::timestamp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::DataFrame;
    use std::sync::Arc;
    use std::thread;

    fn filled(range: std::ops::RangeInclusive<u64>, capacity: usize) -> SearchableBuffer<DataFrame> {
        let buf = SearchableBuffer::new(capacity).unwrap();
        for ts in range {
            buf.write(DataFrame::with_pattern(ts, 4)).unwrap();
        }
        buf
    }

    fn stamps(frames: &[DataFrame]) -> Vec<u64> {
        frames.iter().map(Timestamped::timestamp).collect()
    }

    #[test]
    fn test_lookup_inside_window() {
        let buf = filled(10..=20, 32);
        let snap = buf.lookup(13, 16);
        assert_eq!(stamps(&snap.frames), vec![13, 14, 15, 16]);
        assert_eq!(snap.oldest, Some(10));
        assert_eq!(snap.newest, Some(20));
        assert!(snap.covers(13, 16));
    }

    #[test]
    fn test_lookup_outside_window() {
        let buf = filled(10..=20, 32);
        assert!(buf.lookup(5, 8).frames.is_empty());
        assert!(buf.lookup(21, 40).frames.is_empty());
        assert_eq!(stamps(&buf.lookup(18, 40).frames), vec![18, 19, 20]);
    }

    #[test]
    fn test_lookup_inverted_window() {
        let buf = filled(10..=20, 32);
        let snap = buf.lookup(16, 13);
        assert!(snap.frames.is_empty());
        assert_eq!(snap.oldest, Some(10));
    }

    #[test]
    fn test_rejects_out_of_order_write() {
        let buf = filled(10..=12, 8);
        let err = buf.write(DataFrame::with_pattern(11, 4)).unwrap_err();
        assert_eq!(err, BufferError::OutOfOrder { newest: 12, got: 11 });
        assert_eq!(buf.occupancy(), 3);

        // Equal timestamps are still ordered.
        buf.write(DataFrame::with_pattern(12, 4)).unwrap();
        assert_eq!(buf.occupancy(), 4);
    }

    #[test]
    fn test_occupancy_never_exceeds_capacity() {
        let buf = SearchableBuffer::new(5).unwrap();
        let mut overwrites = 0;
        for ts in 0..100 {
            if buf.write(DataFrame::with_pattern(ts, 4)).unwrap() == WriteOutcome::Overwrote {
                overwrites += 1;
            }
            assert!(buf.occupancy() <= 5);
        }
        assert_eq!(overwrites, 95);
        assert_eq!(buf.front().unwrap().timestamp(), 95);
        assert_eq!(buf.back().unwrap().timestamp(), 99);
    }

    #[test]
    fn test_pop_more_than_occupancy() {
        let buf = filled(0..=3, 8);
        assert_eq!(buf.pop(10), 4);
        assert!(buf.is_empty());
        assert_eq!(buf.pop(1), 0);
    }

    #[test]
    fn test_resize_keeps_newest() {
        let mut buf = filled(0..=9, 10);
        buf.resize(3).unwrap();
        assert_eq!(buf.capacity(), 3);
        assert_eq!(stamps(&buf.lookup(0, 100).frames), vec![7, 8, 9]);
        assert_eq!(buf.resize(0).unwrap_err(), BufferError::ZeroCapacity);
    }

    #[test]
    fn test_concurrent_writer_and_reader() {
        let buf = Arc::new(SearchableBuffer::new(256).unwrap());
        let writer_buf = Arc::clone(&buf);

        let writer = thread::spawn(move || {
            for ts in 0..10_000u64 {
                writer_buf.write(DataFrame::with_pattern(ts, 16)).unwrap();
            }
        });

        let reader_buf = Arc::clone(&buf);
        let reader = thread::spawn(move || {
            for _ in 0..1_000 {
                let snap = reader_buf.lookup(0, u64::MAX);
                assert!(snap.frames.len() <= 256);
                assert!(snap
                    .frames
                    .windows(2)
                    .all(|w| w[0].timestamp() <= w[1].timestamp()));
            }
        });

        writer.join().unwrap();
        reader.join().unwrap();
        assert_eq!(buf.occupancy(), 256);
        assert_eq!(buf.back().unwrap().timestamp(), 9_999);
    }
}
