//! Plain overwrite-oldest FIFO latency buffer.

use super::{LatencyBuffer, RangeLookup, RangeSnapshot, Ring, WriteOutcome};
use crate::error::BufferError;
use crate::frame::{Timestamp, Timestamped};
use parking_lot::{MappedRwLockReadGuard, RwLock, RwLockReadGuard};

/// FIFO latency buffer with no ordering guarantees on write.
///
/// Range lookups scan every stored element, so this strategy suits streams
/// that are rarely searched or whose timestamps are not monotonic.
#[derive(Debug)]
pub struct FifoBuffer<T> {
    ring: RwLock<Ring<T>>,
}

impl<T> FifoBuffer<T> {
    /// Create a buffer retaining at most `capacity` elements.
    pub fn new(capacity: usize) -> Result<Self, BufferError> {
        Ok(Self {
            ring: RwLock::new(Ring::with_capacity(capacity)?),
        })
    }
}

impl<T: Send + Sync> LatencyBuffer<T> for FifoBuffer<T> {
    fn capacity(&self) -> usize {
        self.ring.read().capacity()
    }

    fn occupancy(&self) -> usize {
        self.ring.read().len()
    }

    fn write(&self, element: T) -> Result<WriteOutcome, BufferError> {
        Ok(self.ring.write().push(element))
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

impl<T: Timestamped + Clone + Send + Sync> RangeLookup<T> for FifoBuffer<T> {
    fn lookup(&self, begin: Timestamp, end: Timestamp) -> RangeSnapshot<T> {
        let ring = self.ring.read();
        let items = ring.items();
        if items.is_empty() {
            return RangeSnapshot::empty();
        }

        let mut oldest = Timestamp::MAX;
        let mut newest = Timestamp::MIN;
        let mut frames = Vec::new();
        for item in items {
            let ts = item.timestamp();
            oldest = oldest.min(ts);
            newest = newest.max(ts);
            if begin <= ts && ts <= end {
                frames.push(item.clone());
            }
        }

        RangeSnapshot {
            oldest: Some(oldest),
            newest: Some(newest),
            frames,
        }
    }

    fn oldest_timestamp(&self) -> Option<Timestamp> {
        self.ring.read().items().iter().map(Timestamped::timestamp).min()
    }
}
