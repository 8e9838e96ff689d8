//! Bursty, rate-controlled error-bit injection for the source emulator.
//!
//! All randomness is drawn up front by [`ErrorBitGenerator::generate`] into
//! three fixed tables (error-bit values, error-phase run lengths, clean-phase
//! run lengths). [`ErrorBitGenerator::next`] then only walks the tables, so the
//! hot emulation path pays no per-call RNG cost.

use crate::error::{ReadoutError, ReadoutResult};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Entries per precomputed table.
pub const DEFAULT_TABLE_LEN: usize = 1000;

/// Upper bound of the uniform draw that run lengths are scaled from.
pub const DEFAULT_MAX_RUN: u64 = 1_000_000;

/// Synthetic per-frame error bitmask stream with a target duty cycle.
///
/// Over many calls, the fraction of non-zero values returned by
/// [`next`](Self::next) converges to the configured rate. Error runs are drawn
/// from `U(1, max_run) * rate` and clean runs from `U(1, max_run) * (1 - rate)`.
#[derive(Debug, Clone)]
pub struct ErrorBitGenerator {
    rate: f64,
    seed: Option<u64>,
    table_len: usize,
    max_run: u64,

    error_bits: Vec<u16>,
    error_runs: Vec<u64>,
    clean_runs: Vec<u64>,

    bits_index: usize,
    error_index: usize,
    clean_index: usize,
    current_run: u64,
    count: u64,
    in_error: bool,
}

impl ErrorBitGenerator {
    /// Create a generator for `rate` in `[0, 1]`. Call [`generate`](Self::generate) before use.
    pub fn new(rate: f64) -> ReadoutResult<Self> {
        if !(0.0..=1.0).contains(&rate) {
            return Err(ReadoutError::InvalidFraction {
                name: "error_rate",
                value: rate,
            });
        }
        Ok(Self {
            rate,
            seed: None,
            table_len: DEFAULT_TABLE_LEN,
            max_run: DEFAULT_MAX_RUN,
            error_bits: Vec::new(),
            error_runs: Vec::new(),
            clean_runs: Vec::new(),
            bits_index: 0,
            error_index: 0,
            clean_index: 0,
            current_run: 0,
            count: 0,
            in_error: true,
        })
    }

    /// Use a fixed seed for reproducible tables. `None` seeds from OS entropy.
    #[must_use]
    pub fn with_seed(mut self, seed: Option<u64>) -> Self {
        self.seed = seed;
        self
    }

    /// Override table length and the run-length draw bound.
    #[must_use]
    pub fn with_tables(mut self, table_len: usize, max_run: u64) -> Self {
        self.table_len = table_len.max(1);
        self.max_run = max_run.max(1);
        self
    }

    /// Configured error rate.
    pub fn rate(&self) -> f64 {
        self.rate
    }

    /// Draw the tables and reset the phase state.
    pub fn generate(&mut self) {
        let mut rng = match self.seed {
            Some(s) => ChaCha8Rng::seed_from_u64(s),
            None => ChaCha8Rng::from_entropy(),
        };

        // Zero would be indistinguishable from a clean frame.
        self.error_bits = (0..self.table_len)
            .map(|_| rng.gen_range(1..=u16::MAX))
            .collect();

        self.error_runs = Vec::with_capacity(self.table_len);
        self.clean_runs = Vec::with_capacity(self.table_len);
        for _ in 0..self.table_len {
            let draw = rng.gen_range(1..=self.max_run) as f64;
            self.error_runs.push((draw * self.rate) as u64);
            let draw = rng.gen_range(1..=self.max_run) as f64;
            self.clean_runs.push((draw * (1.0 - self.rate)) as u64);
        }

        self.bits_index = 0;
        self.error_index = 0;
        self.clean_index = 0;
        self.current_run = 0;
        self.count = 0;
        self.in_error = true;
    }

    /// Error bits for the next frame; zero during clean phases.
    ///
    /// Returns zero if [`generate`](Self::generate) has not been called.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> u16 {
        if self.error_bits.is_empty() || self.rate <= 0.0 {
            return 0;
        }
        if self.rate >= 1.0 {
            self.bits_index = (self.bits_index + 1) % self.table_len;
            return self.error_bits[self.bits_index];
        }

        // Skip zero-length runs; both tables being all zero is impossible
        // for 0 < rate < 1, but bound the walk anyway.
        let mut switches = 0;
        while self.count >= self.current_run {
            self.switch_phase();
            switches += 1;
            if switches > 2 * self.table_len {
                return 0;
            }
        }

        self.count += 1;
        if self.in_error {
            self.error_bits[self.bits_index]
        } else {
            0
        }
    }

    fn switch_phase(&mut self) {
        if self.in_error {
            self.clean_index = (self.clean_index + 1) % self.table_len;
            self.current_run = self.clean_runs[self.clean_index];
            self.in_error = false;
        } else {
            self.error_index = (self.error_index + 1) % self.table_len;
            self.bits_index = (self.bits_index + 1) % self.table_len;
            self.current_run = self.error_runs[self.error_index];
            self.in_error = true;
        }
        self.count = 0;
    }
}
