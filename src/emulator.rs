//! Synthetic hardware source.
//!
//! Produces fixed-size frames with a continuous fake clock at a paced rate,
//! injecting hardware error bits from an [`ErrorBitGenerator`] and dropping
//! frames according to a precomputed dropout population. Dropped frames still
//! advance the clock, so they show up downstream as timestamp gaps.

use crate::config::{EmulatorConfig, FramesConfig};
use crate::error::{ReadoutError, ReadoutResult};
use crate::error_bits::ErrorBitGenerator;
use crate::frame::DataFrame;
use crate::rate_limiter::{RateController, RateLimiter};
use bytes::Bytes;
use crossbeam_channel::{SendTimeoutError, Sender};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

/// Entries in the precomputed dropout population.
const DROPOUT_POPULATION: usize = 10_000;

/// Distinct payload patterns cycled through by the producer.
const SOURCE_FRAMES: usize = 16;

/// Producer counters.
#[derive(Debug, Default)]
pub struct EmulatorStats {
    packets: AtomicU64,
    dropouts: AtomicU64,
    error_frames: AtomicU64,
    queue_timeouts: AtomicU64,
}

/// Point-in-time copy of [`EmulatorStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EmulatorCounts {
    /// Frames pushed into the sink.
    pub packets: u64,
    /// Frames skipped by dropout injection.
    pub dropouts: u64,
    /// Frames produced with non-zero error bits.
    pub error_frames: u64,
    /// Frames lost because the sink stayed full past the timeout.
    pub queue_timeouts: u64,
}

impl EmulatorStats {
    /// Current counter values.
    pub fn snapshot(&self) -> EmulatorCounts {
        EmulatorCounts {
            packets: self.packets.load(Ordering::Relaxed),
            dropouts: self.dropouts.load(Ordering::Relaxed),
            error_frames: self.error_frames.load(Ordering::Relaxed),
            queue_timeouts: self.queue_timeouts.load(Ordering::Relaxed),
        }
    }
}

/// Paced frame producer running on its own thread.
#[derive(Debug)]
pub struct SourceEmulator {
    config: EmulatorConfig,
    frames: FramesConfig,
    sink: Sender<DataFrame>,
    run_marker: Arc<AtomicBool>,
    stats: Arc<EmulatorStats>,
    controller: Option<RateController>,
    handle: Option<JoinHandle<()>>,
}

impl SourceEmulator {
    /// Create an emulator that pushes into `sink`. Nothing runs until [`start`](Self::start).
    pub fn new(config: EmulatorConfig, frames: FramesConfig, sink: Sender<DataFrame>) -> Self {
        Self {
            config,
            frames,
            sink,
            run_marker: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(EmulatorStats::default()),
            controller: None,
            handle: None,
        }
    }

    /// Validate settings, precompute the error and dropout tables, and spawn the producer.
    pub fn start(&mut self) -> ReadoutResult<()> {
        if self.handle.is_some() {
            return Err(ReadoutError::AlreadyRunning);
        }
        if !(0.0..=1.0).contains(&self.config.dropout_rate) {
            return Err(ReadoutError::InvalidFraction {
                name: "dropout_rate",
                value: self.config.dropout_rate,
            });
        }

        let limiter = RateLimiter::new(self.config.rate_khz)?;
        let mut error_bits = ErrorBitGenerator::new(self.config.error_rate)?.with_seed(self.config.seed);
        error_bits.generate();

        let producer = Producer {
            config: self.config.clone(),
            frames: self.frames.clone(),
            sink: self.sink.clone(),
            run_marker: Arc::clone(&self.run_marker),
            stats: Arc::clone(&self.stats),
            dropouts: dropout_population(self.config.dropout_rate, self.config.seed),
            error_bits,
        };

        self.controller = Some(limiter.controller());
        self.run_marker.store(true, Ordering::Release);
        let handle = thread::Builder::new()
            .name("emulator".to_string())
            .spawn(move || producer.run(limiter))
            .map_err(|source| {
                self.run_marker.store(false, Ordering::Release);
                ReadoutError::ThreadSpawn {
                    name: "emulator",
                    source,
                }
            })?;
        self.handle = Some(handle);

        info!(
            rate_khz = self.config.rate_khz,
            error_rate = self.config.error_rate,
            dropout_rate = self.config.dropout_rate,
            "Source emulator started"
        );
        Ok(())
    }

    /// Clear the run flag and wait for the producer to finish its current iteration.
    pub fn stop(&mut self) {
        self.run_marker.store(false, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("Emulator thread panicked");
            }
            let counts = self.stats.snapshot();
            info!(
                packets = counts.packets,
                dropouts = counts.dropouts,
                "Source emulator stopped"
            );
        }
        self.controller = None;
    }

    /// True while the producer thread is running.
    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    /// Handle for changing the production rate while running.
    pub fn rate_controller(&self) -> Option<RateController> {
        self.controller.clone()
    }

    /// Producer counters.
    pub fn stats(&self) -> EmulatorCounts {
        self.stats.snapshot()
    }
}

impl Drop for SourceEmulator {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Precomputed dropout decisions, `true` meaning "skip this frame".
fn dropout_population(rate: f64, seed: Option<u64>) -> Vec<bool> {
    if rate <= 0.0 {
        return vec![false];
    }
    let mut rng = match seed {
        Some(s) => ChaCha8Rng::seed_from_u64(s.wrapping_add(1)),
        None => ChaCha8Rng::from_entropy(),
    };
    (0..DROPOUT_POPULATION).map(|_| rng.gen_bool(rate.min(1.0))).collect()
}

/// State moved onto the producer thread.
struct Producer {
    config: EmulatorConfig,
    frames: FramesConfig,
    sink: Sender<DataFrame>,
    run_marker: Arc<AtomicBool>,
    stats: Arc<EmulatorStats>,
    dropouts: Vec<bool>,
    error_bits: ErrorBitGenerator,
}

impl Producer {
    fn run(mut self, mut limiter: RateLimiter) {
        debug!("Data generation thread started");

        let source: Vec<Bytes> = (0..SOURCE_FRAMES)
            .map(|i| DataFrame::with_pattern(i as u64, self.frames.frame_size_bytes).payload().clone())
            .collect();
        let timeout = self.config.queue_timeout();
        let tick = self.frames.tick_duration;

        let mut timestamp = self.config.first_timestamp;
        let mut offset = 0;
        let mut dropout_index = 0;

        limiter.init();
        while self.run_marker.load(Ordering::Acquire) {
            let skip = self.dropouts[dropout_index];
            dropout_index = (dropout_index + 1) % self.dropouts.len();

            if skip {
                self.stats.dropouts.fetch_add(1, Ordering::Relaxed);
            } else {
                let bits = self.error_bits.next();
                let frame = DataFrame::new(timestamp, source[offset].clone()).with_error_bits(bits);
                offset = (offset + 1) % source.len();

                match self.sink.send_timeout(frame, timeout) {
                    Ok(()) => {
                        self.stats.packets.fetch_add(1, Ordering::Relaxed);
                        if bits != 0 {
                            self.stats.error_frames.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                    Err(SendTimeoutError::Timeout(_)) => {
                        self.stats.queue_timeouts.fetch_add(1, Ordering::Relaxed);
                        warn!(timestamp, "Cannot write to raw data input queue: timed out");
                    }
                    Err(SendTimeoutError::Disconnected(_)) => {
                        info!("Raw data input queue disconnected, stopping producer");
                        break;
                    }
                }
            }

            timestamp = timestamp.wrapping_add(tick);
            limiter.limit();
        }

        debug!(last_timestamp = timestamp, "Data generation thread finished");
    }
}
