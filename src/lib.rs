//! # DAQ Readout Front-End Library
//!
//! This crate implements the readout front-end of a data acquisition chain: it
//! ingests a continuous stream of timestamped frames, retains the recent past in
//! a bounded latency buffer, and answers trigger-driven data requests by
//! extracting the matching frames into fragments. A synthetic source emulator
//! drives the whole pipeline without hardware.
//!
//! ## Crate Structure
//!
//! - **`frame`**: The `DataFrame` unit and the `Timestamped` trait.
//! - **`latency_buffer`**: Bounded, overwrite-on-full retention with two lookup
//!   strategies (`SearchableBuffer` with binary search, `FifoBuffer` with a scan).
//! - **`error_registry`**: Time-ordered record of missing and faulty frame ranges.
//! - **`processor`**: Timestamp continuity and frame size checks run on ingest.
//! - **`request`** / **`fragment`**: Data request descriptors and the fragment
//!   container with its wire encoding.
//! - **`transport`**: The `FragmentTransport` seam and an in-process channel router.
//! - **`request_handler`**: Request fulfillment and latency buffer auto-cleanup.
//! - **`rate_limiter`**: Busy-wait pacing with a runtime-adjustable rate.
//! - **`error_bits`**: Bursty error-bit injection with a target duty cycle.
//! - **`emulator`**: Paced synthetic frame source with dropout injection.
//! - **`readout`**: The `ReadoutModel` that runs ingest, timesync and request loops.
//! - **`config`**: Layered configuration (defaults, TOML, environment) via `figment`.
//! - **`logging`**: `tracing-subscriber` setup.
//! - **`error`**: Crate error types.

pub mod config;
pub mod emulator;
pub mod error;
pub mod error_bits;
pub mod error_registry;
pub mod fragment;
pub mod frame;
pub mod latency_buffer;
pub mod logging;
pub mod processor;
pub mod rate_limiter;
pub mod readout;
pub mod request;
pub mod request_handler;
pub mod transport;

pub use config::ReadoutConfig;
pub use error::{ReadoutError, ReadoutResult};
pub use frame::{DataFrame, Timestamp, Timestamped};
pub use readout::{ReadoutInfo, ReadoutModel, TimeSync};
