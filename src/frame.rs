//! Frame types flowing from the front-end into the latency buffer.
//!
//! The readout core never interprets frame contents. It only needs a timestamp
//! to order and search frames, and the raw bytes to copy into fragments.

use bytes::{BufMut, Bytes, BytesMut};

/// Logical clock tick count carried by every frame.
pub type Timestamp = u64;

/// Anything that can be ordered and searched by timestamp.
pub trait Timestamped {
    /// Timestamp of the element.
    fn timestamp(&self) -> Timestamp;
}

/// A single fixed-size frame as produced by the hardware front-end (or emulator).
///
/// `error_bits` mirrors the per-frame error field set by the front-end. The
/// payload is reference counted so that cloning a frame out of the buffer
/// never copies frame memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataFrame {
    timestamp: Timestamp,
    error_bits: u16,
    payload: Bytes,
}

impl DataFrame {
    /// Create a frame with no hardware error bits set.
    pub fn new(timestamp: Timestamp, payload: Bytes) -> Self {
        Self {
            timestamp,
            error_bits: 0,
            payload,
        }
    }

    /// Create a frame whose payload is `size` bytes of a repeating pattern.
    ///
    /// Used by the emulator and tests in place of a recorded source file.
    pub fn with_pattern(timestamp: Timestamp, size: usize) -> Self {
        let mut buf = BytesMut::with_capacity(size);
        for i in 0..size {
            buf.put_u8((timestamp as usize).wrapping_add(i) as u8);
        }
        Self::new(timestamp, buf.freeze())
    }

    /// Set the hardware error field.
    #[must_use]
    pub fn with_error_bits(mut self, error_bits: u16) -> Self {
        self.error_bits = error_bits;
        self
    }

    /// Overwrite the timestamp (emulation of a continuous clock).
    pub fn set_timestamp(&mut self, timestamp: Timestamp) {
        self.timestamp = timestamp;
    }

    /// Hardware error field.
    pub fn error_bits(&self) -> u16 {
        self.error_bits
    }

    /// Raw frame bytes.
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Payload size in bytes.
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// True when the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Structural validation against the configured frame size.
    ///
    /// A frame is faulty when its size is wrong or the front-end flagged it.
    pub fn is_well_formed(&self, expected_size: usize) -> bool {
        self.payload.len() == expected_size && self.error_bits == 0
    }
}

impl Timestamped for DataFrame {
    fn timestamp(&self) -> Timestamp {
        self.timestamp
    }
}
