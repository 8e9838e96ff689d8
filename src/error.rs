//! Custom error types for the readout front-end.
//!
//! This module defines the error enums used across the crate. Using the
//! `thiserror` crate, it provides a centralized and consistent way to handle
//! the few failures that are allowed to surface as `Err` values.
//!
//! ## Error Hierarchy
//!
//! - **`ReadoutError`**: configuration and lifecycle failures. These are the only
//!   errors expected to stop a module from starting.
//! - **`BufferError`**: latency buffer contract violations (out-of-order writes,
//!   a zero capacity request).
//! - **`DeliveryError`**: transport failures while handing a serialized fragment
//!   to its destination. These are logged and counted, never propagated out of
//!   the request loop.
//! - **`FragmentDecodeError`**: malformed bytes handed to `Fragment::from_bytes`.
//!
//! Data-availability problems are not errors at all: they are encoded as
//! [`FragmentErrorBits`](crate::fragment::FragmentErrorBits) in the delivered
//! fragment, and ingest anomalies become
//! [`FrameError`](crate::error_registry::FrameError) records.

use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type ReadoutResult<T> = std::result::Result<T, ReadoutError>;

/// Primary error type for configuring and running the readout model.
#[derive(Error, Debug)]
pub enum ReadoutError {
    /// Semantic configuration problem detected by validation.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Configuration file or environment could not be parsed.
    #[error("Configuration error: {0}")]
    ConfigLoad(#[from] Box<figment::Error>),

    /// Latency buffer capacity outside the supported range.
    #[error("Invalid latency buffer capacity {capacity}: must be at least {min}")]
    InvalidCapacity {
        /// Requested capacity.
        capacity: usize,
        /// Smallest accepted capacity.
        min: usize,
    },

    /// Rate limiter frequency that is not a positive finite number.
    #[error("Invalid rate {0} kHz: must be positive and finite")]
    InvalidRate(f64),

    /// Error rate or dropout rate outside `[0, 1]`.
    #[error("Invalid {name} {value}: must be within [0, 1]")]
    InvalidFraction {
        /// Name of the offending parameter.
        name: &'static str,
        /// Rejected value.
        value: f64,
    },

    /// The readout model was started twice without a stop in between.
    #[error("Readout model is already running")]
    AlreadyRunning,

    /// A worker thread could not be spawned.
    #[error("Failed to spawn {name} thread: {source}")]
    ThreadSpawn {
        /// Logical thread name.
        name: &'static str,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// Buffer error surfaced during configuration (e.g. resize).
    #[error("Latency buffer error: {0}")]
    Buffer(#[from] BufferError),
}

impl From<figment::Error> for ReadoutError {
    fn from(err: figment::Error) -> Self {
        ReadoutError::ConfigLoad(Box::new(err))
    }
}

/// Latency buffer contract violations.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferError {
    /// A write carried a timestamp older than the newest stored element.
    #[error("Out-of-order write: timestamp {got} is older than newest stored {newest}")]
    OutOfOrder {
        /// Timestamp of the newest stored element.
        newest: u64,
        /// Timestamp of the rejected element.
        got: u64,
    },

    /// A capacity of zero was requested.
    #[error("Latency buffer capacity must be greater than zero")]
    ZeroCapacity,
}

/// Failures reported by a [`FragmentTransport`](crate::transport::FragmentTransport).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    /// The destination did not accept the fragment within the timeout.
    #[error("Delivery to '{destination}' timed out after {timeout_ms} ms")]
    Timeout {
        /// Destination identifier.
        destination: String,
        /// Timeout that expired.
        timeout_ms: u64,
    },

    /// No route is known for the destination.
    #[error("Destination '{0}' is unreachable")]
    Unreachable(String),

    /// The destination exists but its receiving side has gone away.
    #[error("Destination '{0}' disconnected")]
    Disconnected(String),
}

/// Failures while parsing a serialized fragment.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FragmentDecodeError {
    /// Fewer bytes than a header.
    #[error("Truncated fragment header: {len} bytes, need {need}")]
    TruncatedHeader {
        /// Bytes available.
        len: usize,
        /// Header size.
        need: usize,
    },

    /// The leading marker did not match.
    #[error("Bad fragment marker {0:#010x}")]
    BadMarker(u32),

    /// Payload length in the header disagrees with the bytes that follow.
    #[error("Fragment payload size mismatch: header says {declared}, found {actual}")]
    SizeMismatch {
        /// Size declared in the header.
        declared: u64,
        /// Bytes actually present.
        actual: usize,
    },
}
