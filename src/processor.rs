//! Ingest-side frame checks that feed the [`FrameErrorRegistry`].
//!
//! Runs on the ingest thread around each latency buffer write: anomalies are
//! computed before the write and recorded only if the buffer accepts the frame.
//! Two checks are applied: timestamp continuity (gap detection) and structural
//! validation (payload size and hardware error field).

use crate::error_registry::{FrameError, FrameErrorKind, FrameErrorRegistry};
use crate::frame::{DataFrame, Timestamp, Timestamped};
use tracing::debug;

/// Detects timestamp gaps and faulty frames on the ingest stream.
#[derive(Debug, Clone)]
pub struct TimestampChecker {
    previous: Option<Timestamp>,
    tick_duration: u64,
    gap_tolerance: u64,
    frame_size: usize,
    gaps: u64,
    faulty: u64,
}

impl TimestampChecker {
    /// Create a checker for frames of `frame_size` bytes spaced `tick_duration` ticks apart.
    pub fn new(tick_duration: u64, gap_tolerance: u64, frame_size: usize) -> Self {
        Self {
            previous: None,
            tick_duration: tick_duration.max(1),
            gap_tolerance,
            frame_size,
            gaps: 0,
            faulty: 0,
        }
    }

    /// Inspect `frame` and append any detected anomalies to `registry`.
    ///
    /// The first frame after construction or [`reset`](Self::reset) only
    /// seeds the expected timestamp. Returns the number of records added.
    pub fn check(&mut self, frame: &DataFrame, registry: &FrameErrorRegistry) -> usize {
        let anomalies = self.inspect(frame);
        self.commit(frame.timestamp(), anomalies, registry)
    }

    /// Compute the anomalies `frame` would produce without touching checker state.
    pub fn inspect(&self, frame: &DataFrame) -> Vec<FrameError> {
        let ts = frame.timestamp();
        let mut anomalies = Vec::new();

        if let Some(previous) = self.previous {
            let expected = previous.saturating_add(self.tick_duration);
            if ts > expected.saturating_add(self.gap_tolerance) {
                debug!(expected, got = ts, "Timestamp gap detected");
                anomalies.push(FrameError::missing(expected, ts - 1));
            }
        }

        if !frame.is_well_formed(self.frame_size) {
            debug!(
                timestamp = ts,
                size = frame.len(),
                error_bits = frame.error_bits(),
                "Faulty frame"
            );
            anomalies.push(FrameError::faulty(
                ts,
                ts.saturating_add(self.tick_duration - 1),
            ));
        }

        anomalies
    }

    /// Accept the frame at `ts` into the stream: record `anomalies` and advance
    /// the expected timestamp. Call only once the frame has actually been stored.
    pub fn commit(
        &mut self,
        ts: Timestamp,
        anomalies: Vec<FrameError>,
        registry: &FrameErrorRegistry,
    ) -> usize {
        let added = anomalies.len();
        for error in anomalies {
            match error.kind {
                FrameErrorKind::MissingFrames => self.gaps += 1,
                FrameErrorKind::FaultyFrames => self.faulty += 1,
            }
            registry.add(error);
        }
        self.previous = Some(ts);
        added
    }

    /// Forget the previous timestamp.
    pub fn reset(&mut self) {
        self.previous = None;
    }

    /// Number of gaps detected so far.
    pub fn gaps(&self) -> u64 {
        self.gaps
    }

    /// Number of faulty frames detected so far.
    pub fn faulty(&self) -> u64 {
        self.faulty
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_continuous_stream_has_no_errors() {
        let reg = FrameErrorRegistry::new();
        let mut checker = TimestampChecker::new(32, 0, 16);
        for i in 0..100 {
            assert_eq!(checker.check(&DataFrame::with_pattern(i * 32, 16), &reg), 0);
        }
        assert!(reg.is_empty());
    }

    #[test]
    fn test_gap_records_missing_range() {
        let reg = FrameErrorRegistry::new();
        let mut checker = TimestampChecker::new(32, 0, 16);
        checker.check(&DataFrame::with_pattern(0, 16), &reg);
        checker.check(&DataFrame::with_pattern(32, 16), &reg);
        checker.check(&DataFrame::with_pattern(128, 16), &reg);

        let errors = reg.overlaps(0, u64::MAX);
        assert_eq!(errors, vec![FrameError::missing(64, 127)]);
        assert_eq!(checker.gaps(), 1);
    }

    #[test]
    fn test_gap_within_tolerance_is_ignored() {
        let reg = FrameErrorRegistry::new();
        let mut checker = TimestampChecker::new(32, 8, 16);
        checker.check(&DataFrame::with_pattern(0, 16), &reg);
        checker.check(&DataFrame::with_pattern(40, 16), &reg);
        assert!(reg.is_empty());
        checker.check(&DataFrame::with_pattern(81, 16), &reg);
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_faulty_frame_records_its_range() {
        let reg = FrameErrorRegistry::new();
        let mut checker = TimestampChecker::new(32, 0, 16);
        checker.check(&DataFrame::with_pattern(0, 16), &reg);
        checker.check(&DataFrame::with_pattern(32, 16).with_error_bits(0x10), &reg);
        checker.check(&DataFrame::with_pattern(64, 15), &reg);

        let errors = reg.overlaps(0, u64::MAX);
        assert_eq!(errors.len(), 2);
        assert!(errors.iter().all(|e| e.kind == FrameErrorKind::FaultyFrames));
        assert_eq!((errors[0].start_ts, errors[0].end_ts), (32, 63));
        assert_eq!(checker.faulty(), 2);
    }

    #[test]
    fn test_reset_reseeds() {
        let reg = FrameErrorRegistry::new();
        let mut checker = TimestampChecker::new(1, 0, 4);
        checker.check(&DataFrame::with_pattern(10, 4), &reg);
        checker.reset();
        checker.check(&DataFrame::with_pattern(1_000, 4), &reg);
        assert!(reg.is_empty());
    }

    #[test]
    fn test_inspect_leaves_state_untouched() {
        let reg = FrameErrorRegistry::new();
        let mut checker = TimestampChecker::new(1, 0, 16);
        checker.check(&DataFrame::with_pattern(10, 16), &reg);

        // A rejected frame is inspected but never committed.
        let rejected = checker.inspect(&DataFrame::with_pattern(9, 15));
        assert_eq!(rejected, vec![FrameError::faulty(9, 9)]);
        assert!(reg.is_empty());
        assert_eq!(checker.faulty(), 0);

        let next = DataFrame::with_pattern(11, 16);
        let anomalies = checker.inspect(&next);
        assert!(anomalies.is_empty());
        assert_eq!(checker.commit(next.timestamp(), anomalies, &reg), 0);
        assert!(reg.is_empty());
        assert_eq!(checker.gaps(), 0);
    }
}
