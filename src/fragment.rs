//! Fragments: the response artifact built for one data request.
//!
//! A fragment is a fixed header followed by the concatenated payloads of the
//! frames that satisfied the request. Payload pieces are `Bytes` handles
//! cloned from the buffered frames, so building a fragment never copies frame
//! memory; [`Fragment::serialize`] produces the single owned buffer handed to
//! transport.
//!
//! # Wire layout (little-endian)
//!
//! | Offset | Size | Field |
//! |---|---|---|
//! | 0 | 4 | marker `0x4652_4147` |
//! | 4 | 4 | error bits |
//! | 8 | 8 | trigger number |
//! | 16 | 8 | window begin |
//! | 24 | 8 | window end |
//! | 32 | 4 | component id |
//! | 36 | 4 | reserved (0) |
//! | 40 | 8 | payload size |
//! | 48 | n | payload |

use crate::error::FragmentDecodeError;
use crate::frame::{DataFrame, Timestamp};
use crate::request::{ComponentId, DataRequest};
use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Leading marker of a serialized fragment.
pub const FRAGMENT_MARKER: u32 = 0x4652_4147;

/// Serialized header size in bytes.
pub const HEADER_SIZE: usize = 48;

bitflags! {
    /// Data-availability conditions reported in a fragment header.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct FragmentErrorBits: u32 {
        /// No stored frame matched the window.
        const DATA_NOT_FOUND = 1 << 0;
        /// Part of the window lies outside the retained range.
        const INCOMPLETE = 1 << 1;
        /// The window begin lies after its end.
        const INVALID_WINDOW = 1 << 2;
        /// The window overlaps a range of missing frames.
        const MISSING_FRAMES = 1 << 3;
        /// The window overlaps frames that failed validation.
        const FAULTY_FRAMES = 1 << 4;
    }
}

/// Fragment header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentHeader {
    /// Trigger that caused the request.
    pub trigger_number: u64,
    /// Requested window begin.
    pub window_begin: Timestamp,
    /// Requested window end.
    pub window_end: Timestamp,
    /// Readout unit that built the fragment.
    pub component_id: ComponentId,
    /// Availability conditions.
    pub error_bits: FragmentErrorBits,
    /// Total payload bytes following the header.
    pub payload_size: u64,
}

impl FragmentHeader {
    /// Header echoing the request, with no error bits and no payload.
    pub fn for_request(request: &DataRequest) -> Self {
        Self {
            trigger_number: request.trigger_number,
            window_begin: request.request_information.window_begin_ts,
            window_end: request.request_information.window_end_ts,
            component_id: request.component_id,
            error_bits: FragmentErrorBits::empty(),
            payload_size: 0,
        }
    }
}

/// Header plus zero or more payload pieces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    header: FragmentHeader,
    pieces: Vec<Bytes>,
}

impl Fragment {
    /// An empty fragment for `request` carrying `error_bits`.
    pub fn empty(request: &DataRequest, error_bits: FragmentErrorBits) -> Self {
        let mut header = FragmentHeader::for_request(request);
        header.error_bits = error_bits;
        Self {
            header,
            pieces: Vec::new(),
        }
    }

    /// A fragment for `request` whose payload is the given frames, in order.
    pub fn from_frames(
        request: &DataRequest,
        frames: &[DataFrame],
        error_bits: FragmentErrorBits,
    ) -> Self {
        let pieces: Vec<Bytes> = frames.iter().map(|f| f.payload().clone()).collect();
        let mut header = FragmentHeader::for_request(request);
        header.error_bits = error_bits;
        header.payload_size = pieces.iter().map(|p| p.len() as u64).sum();
        Self { header, pieces }
    }

    /// Fragment header.
    pub fn header(&self) -> &FragmentHeader {
        &self.header
    }

    /// Header error bits.
    pub fn error_bits(&self) -> FragmentErrorBits {
        self.header.error_bits
    }

    /// Number of payload pieces (one per frame).
    pub fn piece_count(&self) -> usize {
        self.pieces.len()
    }

    /// Payload pieces in window order.
    pub fn pieces(&self) -> &[Bytes] {
        &self.pieces
    }

    /// Total payload bytes.
    pub fn payload_size(&self) -> usize {
        self.header.payload_size as usize
    }

    /// True when the fragment carries no payload.
    pub fn is_empty(&self) -> bool {
        self.pieces.is_empty()
    }

    /// Header plus payload size in bytes.
    pub fn serialized_size(&self) -> usize {
        HEADER_SIZE + self.payload_size()
    }

    /// Serialize into one contiguous, independently owned buffer.
    pub fn serialize(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.serialized_size());
        buf.put_u32_le(FRAGMENT_MARKER);
        buf.put_u32_le(self.header.error_bits.bits());
        buf.put_u64_le(self.header.trigger_number);
        buf.put_u64_le(self.header.window_begin);
        buf.put_u64_le(self.header.window_end);
        buf.put_u32_le(self.header.component_id);
        buf.put_u32_le(0);
        buf.put_u64_le(self.header.payload_size);
        for piece in &self.pieces {
            buf.put_slice(piece);
        }
        buf.freeze()
    }

    /// Parse a buffer produced by [`serialize`](Self::serialize).
    ///
    /// The payload comes back as a single piece sharing `bytes`' memory.
    /// Unknown error bits are preserved.
    pub fn from_bytes(mut bytes: Bytes) -> Result<Self, FragmentDecodeError> {
        if bytes.len() < HEADER_SIZE {
            return Err(FragmentDecodeError::TruncatedHeader {
                len: bytes.len(),
                need: HEADER_SIZE,
            });
        }
        let marker = bytes.get_u32_le();
        if marker != FRAGMENT_MARKER {
            return Err(FragmentDecodeError::BadMarker(marker));
        }
        let error_bits = FragmentErrorBits::from_bits_retain(bytes.get_u32_le());
        let trigger_number = bytes.get_u64_le();
        let window_begin = bytes.get_u64_le();
        let window_end = bytes.get_u64_le();
        let component_id = bytes.get_u32_le();
        let _reserved = bytes.get_u32_le();
        let payload_size = bytes.get_u64_le();

        if payload_size != bytes.len() as u64 {
            return Err(FragmentDecodeError::SizeMismatch {
                declared: payload_size,
                actual: bytes.len(),
            });
        }

        let pieces = if bytes.is_empty() { Vec::new() } else { vec![bytes] };
        Ok(Self {
            header: FragmentHeader {
                trigger_number,
                window_begin,
                window_end,
                component_id,
                error_bits,
                payload_size,
            },
            pieces,
        })
    }
}
