//! Busy-wait loop pacing with bounded drift.
//!
//! ```no_run
//! use daq_readout::rate_limiter::RateLimiter;
//!
//! let mut limiter = RateLimiter::new(1000.0)?; // 1 MHz
//! limiter.init();
//! loop {
//!     // produce one frame
//!     limiter.limit();
//! #   break;
//! }
//! # Ok::<(), daq_readout::error::ReadoutError>(())
//! ```
//!
//! The rate may be changed from another thread through a [`RateController`].
//! The new period takes effect at the next deadline computation.

use crate::error::{ReadoutError, ReadoutResult};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Lateness after which the limiter gives up catching up and resynchronizes.
pub const DEFAULT_MAX_OVERSHOOT: Duration = Duration::from_millis(10);

const NANOS_PER_KHZ_PERIOD: f64 = 1_000_000.0;

/// Rate and period shared between the pacing loop and its controllers.
#[derive(Debug)]
struct RateShared {
    khz_bits: AtomicU64,
    period_ns: AtomicU64,
}

impl RateShared {
    fn store(&self, kilohertz: f64) -> ReadoutResult<()> {
        if !kilohertz.is_finite() || kilohertz <= 0.0 {
            return Err(ReadoutError::InvalidRate(kilohertz));
        }
        let period_ns = (NANOS_PER_KHZ_PERIOD / kilohertz).round().max(1.0) as u64;
        self.khz_bits.store(kilohertz.to_bits(), Ordering::Relaxed);
        self.period_ns.store(period_ns, Ordering::Relaxed);
        Ok(())
    }

    fn kilohertz(&self) -> f64 {
        f64::from_bits(self.khz_bits.load(Ordering::Relaxed))
    }

    fn period(&self) -> Duration {
        Duration::from_nanos(self.period_ns.load(Ordering::Relaxed))
    }
}

/// Paces a loop to a target frequency given in kilohertz.
///
/// `limit()` spins on the monotonic clock until the current deadline, then
/// advances the deadline by one period. If the caller arrives later than
/// `deadline + max_overshoot`, the deadline is reset to `now + period`
/// instead of issuing a burst of zero-wait iterations.
#[derive(Debug)]
pub struct RateLimiter {
    shared: Arc<RateShared>,
    deadline: Instant,
    max_overshoot: Duration,
    resyncs: u64,
}

impl RateLimiter {
    /// Create a limiter for `kilohertz` and initialize its deadline.
    pub fn new(kilohertz: f64) -> ReadoutResult<Self> {
        let shared = Arc::new(RateShared {
            khz_bits: AtomicU64::new(0),
            period_ns: AtomicU64::new(0),
        });
        shared.store(kilohertz)?;
        let mut limiter = Self {
            shared,
            deadline: Instant::now(),
            max_overshoot: DEFAULT_MAX_OVERSHOOT,
            resyncs: 0,
        };
        limiter.init();
        Ok(limiter)
    }

    /// Override the overshoot tolerance.
    #[must_use]
    pub fn with_max_overshoot(mut self, max_overshoot: Duration) -> Self {
        self.max_overshoot = max_overshoot;
        self
    }

    /// Reset the deadline baseline to the current time.
    pub fn init(&mut self) {
        self.deadline = Instant::now() + self.shared.period();
    }

    /// Block (spinning) until the next period boundary.
    pub fn limit(&mut self) {
        let period = self.shared.period();
        let mut now = Instant::now();
        if now > self.deadline + self.max_overshoot {
            self.deadline = now + period;
            self.resyncs += 1;
            return;
        }
        while now < self.deadline {
            std::hint::spin_loop();
            now = Instant::now();
        }
        self.deadline += period;
    }

    /// Change the target rate.
    pub fn adjust(&self, kilohertz: f64) -> ReadoutResult<()> {
        self.shared.store(kilohertz)
    }

    /// Handle for adjusting the rate from another thread.
    pub fn controller(&self) -> RateController {
        RateController {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Current target rate in kilohertz.
    pub fn rate_khz(&self) -> f64 {
        self.shared.kilohertz()
    }

    /// Current period.
    pub fn period(&self) -> Duration {
        self.shared.period()
    }

    /// Number of times the deadline was resynchronized after a stall.
    pub fn resyncs(&self) -> u64 {
        self.resyncs
    }
}

/// Cloneable handle that adjusts a [`RateLimiter`]'s rate without locking.
#[derive(Debug, Clone)]
pub struct RateController {
    shared: Arc<RateShared>,
}

impl RateController {
    /// Change the target rate. Invalid rates leave the current rate in place.
    pub fn adjust(&self, kilohertz: f64) -> ReadoutResult<()> {
        self.shared.store(kilohertz)
    }

    /// Current target rate in kilohertz.
    pub fn rate_khz(&self) -> f64 {
        self.shared.kilohertz()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn iterations_in(limiter: &mut RateLimiter, window: Duration) -> u64 {
        let start = Instant::now();
        let mut count = 0;
        while start.elapsed() < window {
            limiter.limit();
            count += 1;
        }
        count
    }

    #[test]
    fn test_period_from_rate() {
        let limiter = RateLimiter::new(1.0).unwrap();
        assert_eq!(limiter.period(), Duration::from_millis(1));
        limiter.adjust(1000.0).unwrap();
        assert_eq!(limiter.period(), Duration::from_micros(1));
    }

    #[test]
    fn test_rejects_invalid_rate() {
        for rate in [0.0, -5.0, f64::NAN, f64::INFINITY] {
            assert!(matches!(
                RateLimiter::new(rate),
                Err(ReadoutError::InvalidRate(_))
            ));
        }
        let limiter = RateLimiter::new(2.0).unwrap();
        assert!(limiter.adjust(0.0).is_err());
        assert_eq!(limiter.rate_khz(), 2.0);
    }

    #[test]
    fn test_pacing_accuracy() {
        // 10 kHz for 200 ms = 2000 iterations.
        let mut limiter = RateLimiter::new(10.0).unwrap();
        limiter.init();
        let count = iterations_in(&mut limiter, Duration::from_millis(200));
        assert!(count <= 2_100, "too fast: {count}");
        assert!(count >= 1_400, "too slow: {count}");
    }

    #[test]
    fn test_resync_after_stall() {
        let mut limiter = RateLimiter::new(1.0).unwrap();
        limiter.init();
        for _ in 0..3 {
            limiter.limit();
        }

        thread::sleep(Duration::from_millis(60));

        // Without resync, ~60 catch-up iterations would run back to back.
        let count = iterations_in(&mut limiter, Duration::from_millis(10));
        assert!(count <= 15, "burst after stall: {count}");
        assert!(limiter.resyncs() >= 1);
    }

    #[test]
    fn test_adjust_from_other_thread() {
        let limiter = RateLimiter::new(1.0).unwrap();
        let controller = limiter.controller();
        thread::spawn(move || controller.adjust(2.0).unwrap())
            .join()
            .unwrap();
        assert_eq!(limiter.rate_khz(), 2.0);
        assert_eq!(limiter.period(), Duration::from_micros(500));
    }
}
