//! Request fulfillment against the latency buffer.
//!
//! Every [`DataRequest`] terminates in exactly one of three outcomes and
//! produces exactly one delivery attempt:
//!
//! - **Found**: the window lies inside the retained range and overlaps no
//!   registry entry. Header error bits are empty.
//! - **Partial**: some frames matched, but the window extends beyond retained
//!   data or overlaps missing/faulty ranges. The available payload is sent
//!   with bits describing each condition.
//! - **NotFound**: nothing matched (or the window is invalid, or the handler
//!   runs in empty-fragment mode). An empty fragment with
//!   `DATA_NOT_FOUND` is sent so the requester is never left waiting. A
//!   window that falls inside a recorded gap also carries the registry bits.
//!
//! Delivery failures are logged at warn level and counted. They never
//! propagate out of [`RequestHandler::issue_request`].

use crate::error_registry::{FrameError, FrameErrorKind, FrameErrorRegistry};
use crate::fragment::{Fragment, FragmentErrorBits};
use crate::frame::{DataFrame, Timestamp};
use crate::latency_buffer::{LatencyBuffer, RangeLookup};
use crate::request::DataRequest;
use crate::transport::FragmentTransport;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// How the handler treats incoming requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerMode {
    /// Search the latency buffer.
    #[default]
    Lookup,
    /// Never search; answer every request with an empty `DATA_NOT_FOUND` fragment.
    EmptyFragment,
}

/// Terminal state of one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestOutcome {
    /// Whole window present and error-free.
    Found,
    /// Some data present, with conditions flagged in the header.
    Partial,
    /// No data sent.
    NotFound,
}

/// What happened to a single request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestReport {
    /// Classification of the request.
    pub outcome: RequestOutcome,
    /// Header error bits of the fragment that was built.
    pub error_bits: FragmentErrorBits,
    /// Number of frames copied into the fragment.
    pub frame_count: usize,
    /// Payload bytes in the fragment.
    pub payload_size: usize,
    /// Whether transport accepted the fragment.
    pub delivered: bool,
}

/// Auto-cleanup thresholds, as fractions of capacity and occupancy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CleanupPolicy {
    /// Occupancy fraction above which cleanup triggers. `1.0` disables cleanup.
    pub pop_limit_pct: f64,
    /// Fraction of current occupancy removed per cleanup.
    pub pop_size_pct: f64,
}

impl Default for CleanupPolicy {
    fn default() -> Self {
        Self {
            pop_limit_pct: 0.5,
            pop_size_pct: 0.8,
        }
    }
}

impl CleanupPolicy {
    /// Policy that never pops.
    pub fn disabled() -> Self {
        Self {
            pop_limit_pct: 1.0,
            pop_size_pct: 0.0,
        }
    }

    fn is_enabled(&self) -> bool {
        self.pop_limit_pct < 1.0 && self.pop_size_pct > 0.0
    }
}

/// Per-outcome request counters.
#[derive(Debug, Default)]
pub struct RequestStats {
    found: AtomicU64,
    partial: AtomicU64,
    not_found: AtomicU64,
    delivery_failures: AtomicU64,
    bytes_sent: AtomicU64,
    cleanup_pops: AtomicU64,
}

/// Point-in-time copy of [`RequestStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RequestCounts {
    /// Requests answered with the full window.
    pub found: u64,
    /// Requests answered with partial data.
    pub partial: u64,
    /// Requests answered with an empty fragment.
    pub not_found: u64,
    /// Fragments transport refused or timed out on.
    pub delivery_failures: u64,
    /// Serialized bytes accepted by transport.
    pub bytes_sent: u64,
    /// Frames discarded by auto-cleanup.
    pub cleanup_pops: u64,
}

impl RequestStats {
    fn record(&self, outcome: RequestOutcome) {
        let counter = match outcome {
            RequestOutcome::Found => &self.found,
            RequestOutcome::Partial => &self.partial,
            RequestOutcome::NotFound => &self.not_found,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Current counter values.
    pub fn snapshot(&self) -> RequestCounts {
        RequestCounts {
            found: self.found.load(Ordering::Relaxed),
            partial: self.partial.load(Ordering::Relaxed),
            not_found: self.not_found.load(Ordering::Relaxed),
            delivery_failures: self.delivery_failures.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            cleanup_pops: self.cleanup_pops.load(Ordering::Relaxed),
        }
    }
}

/// Builds and delivers fragments for data requests.
///
/// Shared between the ingest thread (cleanup) and request threads, so every
/// method takes `&self`.
pub struct RequestHandler {
    buffer: Arc<dyn RangeLookup<DataFrame>>,
    registry: Arc<FrameErrorRegistry>,
    transport: Arc<dyn FragmentTransport>,
    mode: HandlerMode,
    delivery_timeout: Duration,
    cleanup: CleanupPolicy,
    stats: RequestStats,
}

impl std::fmt::Debug for RequestHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestHandler")
            .field("mode", &self.mode)
            .field("delivery_timeout", &self.delivery_timeout)
            .field("cleanup", &self.cleanup)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl RequestHandler {
    /// Create a handler in [`HandlerMode::Lookup`] with cleanup disabled.
    pub fn new(
        buffer: Arc<dyn RangeLookup<DataFrame>>,
        registry: Arc<FrameErrorRegistry>,
        transport: Arc<dyn FragmentTransport>,
        delivery_timeout: Duration,
    ) -> Self {
        Self {
            buffer,
            registry,
            transport,
            mode: HandlerMode::Lookup,
            delivery_timeout,
            cleanup: CleanupPolicy::disabled(),
            stats: RequestStats::default(),
        }
    }

    /// Set the handling mode.
    #[must_use]
    pub fn with_mode(mut self, mode: HandlerMode) -> Self {
        self.mode = mode;
        self
    }

    /// Set the auto-cleanup thresholds.
    #[must_use]
    pub fn with_cleanup(mut self, cleanup: CleanupPolicy) -> Self {
        self.cleanup = cleanup;
        self
    }

    /// Current handling mode.
    pub fn mode(&self) -> HandlerMode {
        self.mode
    }

    /// Request counters.
    pub fn stats(&self) -> &RequestStats {
        &self.stats
    }

    /// Build the fragment for `request` without delivering it.
    pub fn build_fragment(&self, request: &DataRequest) -> (Fragment, RequestOutcome) {
        if self.mode == HandlerMode::EmptyFragment {
            return (
                Fragment::empty(request, FragmentErrorBits::DATA_NOT_FOUND),
                RequestOutcome::NotFound,
            );
        }

        let window = request.request_information;
        if !window.is_valid() {
            return (
                Fragment::empty(
                    request,
                    FragmentErrorBits::INVALID_WINDOW | FragmentErrorBits::DATA_NOT_FOUND,
                ),
                RequestOutcome::NotFound,
            );
        }

        let (begin, end) = (window.window_begin_ts, window.window_end_ts);
        // Registry before buffer: a prune in between only removes entries
        // older than every frame the later lookup can return.
        let errors = self.registry.overlaps(begin, end);
        let snapshot = self.buffer.lookup(begin, end);
        let error_bits = registry_bits(&errors, snapshot.oldest);

        if snapshot.frames.is_empty() {
            return (
                Fragment::empty(request, FragmentErrorBits::DATA_NOT_FOUND | error_bits),
                RequestOutcome::NotFound,
            );
        }

        let mut bits = error_bits;
        if !snapshot.covers(begin, end) {
            bits |= FragmentErrorBits::INCOMPLETE;
        }

        let outcome = if bits.is_empty() {
            RequestOutcome::Found
        } else {
            RequestOutcome::Partial
        };
        (Fragment::from_frames(request, &snapshot.frames, bits), outcome)
    }

    /// Handle one request: build its fragment and make a single delivery attempt.
    pub fn issue_request(&self, request: DataRequest) -> RequestReport {
        let (fragment, outcome) = self.build_fragment(&request);
        self.stats.record(outcome);

        match outcome {
            RequestOutcome::NotFound => warn!(
                trigger_number = request.trigger_number,
                window_begin = request.request_information.window_begin_ts,
                window_end = request.request_information.window_end_ts,
                error_bits = fragment.error_bits().bits(),
                "Sending empty fragment"
            ),
            RequestOutcome::Partial => debug!(
                trigger_number = request.trigger_number,
                frames = fragment.piece_count(),
                error_bits = fragment.error_bits().bits(),
                "Sending partial fragment"
            ),
            RequestOutcome::Found => debug!(
                trigger_number = request.trigger_number,
                frames = fragment.piece_count(),
                "Sending fragment"
            ),
        }

        let bytes = fragment.serialize();
        let size = bytes.len() as u64;
        let delivered = match self
            .transport
            .send_to(&request.data_destination, bytes, self.delivery_timeout)
        {
            Ok(()) => {
                self.stats.bytes_sent.fetch_add(size, Ordering::Relaxed);
                true
            }
            Err(err) => {
                self.stats.delivery_failures.fetch_add(1, Ordering::Relaxed);
                warn!(
                    trigger_number = request.trigger_number,
                    destination = %request.data_destination,
                    error = %err,
                    "Failed to send fragment"
                );
                false
            }
        };

        RequestReport {
            outcome,
            error_bits: fragment.error_bits(),
            frame_count: fragment.piece_count(),
            payload_size: fragment.payload_size(),
            delivered,
        }
    }

    /// Pop old frames when occupancy crosses the cleanup threshold.
    ///
    /// Registry entries that no longer describe retained data are pruned in
    /// the same step. Returns the number of frames popped.
    pub fn cleanup_check(&self) -> usize {
        if !self.cleanup.is_enabled() {
            return 0;
        }
        let occupancy = self.buffer.occupancy();
        let limit = self.cleanup.pop_limit_pct * self.buffer.capacity() as f64;
        if (occupancy as f64) <= limit {
            return 0;
        }

        let to_pop = (self.cleanup.pop_size_pct * occupancy as f64) as usize;
        let popped = self.buffer.pop(to_pop);
        let pruned = self.retire_errors();
        self.stats
            .cleanup_pops
            .fetch_add(popped as u64, Ordering::Relaxed);
        debug!(popped, pruned, remaining = occupancy - popped, "Latency buffer cleanup");
        popped
    }

    /// Prune registry entries ending before the oldest retained frame.
    pub fn retire_errors(&self) -> usize {
        let oldest = self.buffer.oldest_timestamp();
        self.registry.prune(oldest.unwrap_or(Timestamp::MAX))
    }

    /// Drop all retained frames and registry entries.
    pub fn flush(&self) -> usize {
        let flushed = self.buffer.flush();
        self.registry.prune(Timestamp::MAX);
        info!(flushed, "Latency buffer flushed");
        flushed
    }
}

/// Header bits for registry entries that still describe retained data.
fn registry_bits(errors: &[FrameError], oldest: Option<Timestamp>) -> FragmentErrorBits {
    let Some(oldest) = oldest else {
        return FragmentErrorBits::empty();
    };
    errors
        .iter()
        .filter(|error| error.end_ts >= oldest)
        .fold(FragmentErrorBits::empty(), |bits, error| {
            bits | match error.kind {
                FrameErrorKind::MissingFrames => FragmentErrorBits::MISSING_FRAMES,
                FrameErrorKind::FaultyFrames => FragmentErrorBits::FAULTY_FRAMES,
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DeliveryError;
    use crate::frame::Timestamped;
    use crate::latency_buffer::{FifoBuffer, SearchableBuffer};
    use crate::request::DataDestination;
    use bytes::Bytes;
    use parking_lot::Mutex;
    use tracing_test::traced_test;

    #[derive(Default)]
    struct RecordingTransport {
        sent: Mutex<Vec<(DataDestination, Bytes)>>,
        fail: bool,
    }

    impl FragmentTransport for RecordingTransport {
        fn send_to(
            &self,
            destination: &DataDestination,
            bytes: Bytes,
            timeout: Duration,
        ) -> Result<(), DeliveryError> {
            if self.fail {
                return Err(DeliveryError::Timeout {
                    destination: destination.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
            self.sent.lock().push((destination.clone(), bytes));
            Ok(())
        }
    }

    struct Fixture {
        buffer: Arc<SearchableBuffer<DataFrame>>,
        registry: Arc<FrameErrorRegistry>,
        transport: Arc<RecordingTransport>,
        handler: RequestHandler,
    }

    fn fixture(capacity: usize, fail: bool) -> Fixture {
        let buffer = Arc::new(SearchableBuffer::new(capacity).unwrap());
        let registry = Arc::new(FrameErrorRegistry::new());
        let transport = Arc::new(RecordingTransport {
            fail,
            ..Default::default()
        });
        let handler = RequestHandler::new(
            buffer.clone(),
            registry.clone(),
            transport.clone(),
            Duration::from_millis(10),
        );
        Fixture {
            buffer,
            registry,
            transport,
            handler,
        }
    }

    fn fill(buffer: &SearchableBuffer<DataFrame>, range: std::ops::RangeInclusive<u64>) {
        for ts in range {
            buffer.write(DataFrame::with_pattern(ts, 8)).unwrap();
        }
    }

    fn request(begin: u64, end: u64) -> DataRequest {
        DataRequest::new(1, begin, end, 0, "dfo")
    }

    #[test]
    fn test_found_window() {
        let fx = fixture(64, false);
        fill(&fx.buffer, 10..=20);

        let report = fx.handler.issue_request(request(13, 16));
        assert_eq!(report.outcome, RequestOutcome::Found);
        assert!(report.error_bits.is_empty());
        assert_eq!(report.frame_count, 4);
        assert_eq!(report.payload_size, 32);
        assert!(report.delivered);

        let sent = fx.transport.sent.lock();
        assert_eq!(sent.len(), 1);
        let frag = Fragment::from_bytes(sent[0].1.clone()).unwrap();
        assert_eq!(frag.payload_size(), 32);
    }

    #[test]
    #[traced_test]
    fn test_window_outside_history() {
        let fx = fixture(64, false);
        fill(&fx.buffer, 10..=20);

        let report = fx.handler.issue_request(request(5, 8));
        assert_eq!(report.outcome, RequestOutcome::NotFound);
        assert_eq!(report.error_bits, FragmentErrorBits::DATA_NOT_FOUND);
        assert_eq!(report.payload_size, 0);
        assert!(report.delivered, "empty fragment is still delivered");
        assert!(logs_contain("Sending empty fragment"));
    }

    #[test]
    fn test_empty_buffer_is_not_found() {
        let fx = fixture(8, false);
        let report = fx.handler.issue_request(request(0, 100));
        assert_eq!(report.outcome, RequestOutcome::NotFound);
    }

    #[test]
    fn test_inverted_window() {
        let fx = fixture(64, false);
        fill(&fx.buffer, 10..=20);
        let report = fx.handler.issue_request(request(16, 13));
        assert_eq!(report.outcome, RequestOutcome::NotFound);
        assert!(report.error_bits.contains(FragmentErrorBits::INVALID_WINDOW));
        assert!(report.error_bits.contains(FragmentErrorBits::DATA_NOT_FOUND));
    }

    #[test]
    fn test_partial_beyond_newest() {
        let fx = fixture(64, false);
        fill(&fx.buffer, 10..=20);
        let report = fx.handler.issue_request(request(18, 30));
        assert_eq!(report.outcome, RequestOutcome::Partial);
        assert_eq!(report.error_bits, FragmentErrorBits::INCOMPLETE);
        assert_eq!(report.frame_count, 3);
    }

    #[test]
    fn test_faulty_overlap_sets_bit() {
        let fx = fixture(64, false);
        fill(&fx.buffer, 10..=20);
        fx.registry.add(FrameError::faulty(15, 15));

        let report = fx.handler.issue_request(request(13, 16));
        assert_eq!(report.outcome, RequestOutcome::Partial);
        assert_eq!(report.error_bits, FragmentErrorBits::FAULTY_FRAMES);
        assert_eq!(report.frame_count, 4);

        fx.registry.add(FrameError::missing(11, 12));
        let report = fx.handler.issue_request(request(10, 16));
        assert!(report.error_bits.contains(FragmentErrorBits::MISSING_FRAMES));
        assert!(report.error_bits.contains(FragmentErrorBits::FAULTY_FRAMES));
    }

    #[test]
    fn test_window_inside_gap_reports_missing_frames() {
        let fx = fixture(64, false);
        fill(&fx.buffer, 10..=12);
        fill(&fx.buffer, 20..=21);
        fx.registry.add(FrameError::missing(13, 19));

        let (fragment, outcome) = fx.handler.build_fragment(&request(14, 17));
        assert_eq!(outcome, RequestOutcome::NotFound);
        assert!(fragment.is_empty());
        assert_eq!(
            fragment.error_bits(),
            FragmentErrorBits::DATA_NOT_FOUND | FragmentErrorBits::MISSING_FRAMES
        );

        // Past the newest frame nothing is recorded yet.
        let (fragment, _) = fx.handler.build_fragment(&request(30, 40));
        assert_eq!(fragment.error_bits(), FragmentErrorBits::DATA_NOT_FOUND);
    }

    #[test]
    fn test_entries_before_oldest_frame_are_ignored() {
        let fx = fixture(64, false);
        fill(&fx.buffer, 10..=20);
        // Left over from evicted data, not yet pruned.
        fx.registry.add(FrameError::missing(5, 9));

        let report = fx.handler.issue_request(request(5, 15));
        assert_eq!(report.error_bits, FragmentErrorBits::INCOMPLETE);
        assert_eq!(report.frame_count, 6);

        fx.registry.add(FrameError::faulty(10, 10));
        let report = fx.handler.issue_request(request(5, 15));
        assert_eq!(
            report.error_bits,
            FragmentErrorBits::INCOMPLETE | FragmentErrorBits::FAULTY_FRAMES
        );
    }

    #[test]
    fn test_retire_keeps_entries_for_unordered_fifo_data() {
        let buffer = Arc::new(FifoBuffer::new(8).unwrap());
        let registry = Arc::new(FrameErrorRegistry::new());
        let handler = RequestHandler::new(
            buffer.clone(),
            registry.clone(),
            Arc::new(RecordingTransport::default()),
            Duration::from_millis(10),
        );

        for ts in [20, 10, 30] {
            buffer.write(DataFrame::with_pattern(ts, 8)).unwrap();
        }
        registry.add(FrameError::missing(11, 15));

        // Drops the frame at 20; the frame at 10 is still retained.
        assert_eq!(buffer.pop(1), 1);
        assert_eq!(handler.retire_errors(), 0);
        assert_eq!(registry.len(), 1);

        assert_eq!(buffer.pop(1), 1);
        assert_eq!(handler.retire_errors(), 1);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_empty_fragment_mode() {
        let fx = fixture(64, false);
        fill(&fx.buffer, 10..=20);
        let handler = RequestHandler::new(
            fx.buffer.clone(),
            fx.registry.clone(),
            fx.transport.clone(),
            Duration::from_millis(10),
        )
        .with_mode(HandlerMode::EmptyFragment);

        let report = handler.issue_request(request(13, 16));
        assert_eq!(report.outcome, RequestOutcome::NotFound);
        assert_eq!(report.error_bits, FragmentErrorBits::DATA_NOT_FOUND);
        assert_eq!(handler.stats().snapshot().not_found, 1);
    }

    #[test]
    #[traced_test]
    fn test_delivery_failure_is_counted() {
        let fx = fixture(64, true);
        fill(&fx.buffer, 10..=20);
        let report = fx.handler.issue_request(request(13, 16));
        assert_eq!(report.outcome, RequestOutcome::Found);
        assert!(!report.delivered);

        let counts = fx.handler.stats().snapshot();
        assert_eq!(counts.found, 1);
        assert_eq!(counts.delivery_failures, 1);
        assert_eq!(counts.bytes_sent, 0);
        assert!(logs_contain("Failed to send fragment"));
    }

    #[test]
    fn test_cleanup_pops_and_prunes_together() {
        let buffer = Arc::new(SearchableBuffer::new(10).unwrap());
        let registry = Arc::new(FrameErrorRegistry::new());
        let handler = RequestHandler::new(
            buffer.clone(),
            registry.clone(),
            Arc::new(RecordingTransport::default()),
            Duration::from_millis(10),
        )
        .with_cleanup(CleanupPolicy {
            pop_limit_pct: 0.5,
            pop_size_pct: 0.5,
        });

        fill(&buffer, 0..=4);
        assert_eq!(handler.cleanup_check(), 0, "at the limit, not above it");

        registry.add(FrameError::missing(1, 2));
        registry.add(FrameError::faulty(8, 8));
        fill(&buffer, 5..=7);
        assert_eq!(handler.cleanup_check(), 4);
        assert_eq!(buffer.front().unwrap().timestamp(), 4);
        assert_eq!(registry.len(), 1);
        assert_eq!(handler.stats().snapshot().cleanup_pops, 4);
    }

    #[test]
    fn test_cleanup_disabled_at_full_limit() {
        let fx = fixture(4, false);
        fill(&fx.buffer, 0..=9);
        assert_eq!(fx.handler.cleanup_check(), 0);
        assert_eq!(fx.buffer.occupancy(), 4);
    }

    #[test]
    fn test_flush_clears_registry() {
        let fx = fixture(16, false);
        fill(&fx.buffer, 0..=9);
        fx.registry.add(FrameError::faulty(3, 3));
        assert_eq!(fx.handler.flush(), 10);
        assert!(fx.buffer.is_empty());
        assert!(fx.registry.is_empty());
    }
}
