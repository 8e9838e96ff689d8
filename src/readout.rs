//! Readout model: the three concurrent loops around the latency buffer.
//!
//! - **ingest** drains the raw frame queue, runs the [`TimestampChecker`],
//!   writes into the latency buffer, and keeps the error registry consistent
//!   with eviction and auto-cleanup.
//! - **timesync** periodically publishes the last ingested timestamp and, when
//!   configured, issues fake trigger requests against it.
//! - **requests** drains the request queue into the [`RequestHandler`].
//!
//! Each loop runs on a named `std::thread` and checks a shared run flag every
//! iteration. Blocking waits are bounded by queue timeouts, so [`ReadoutModel::stop`]
//! returns once every in-flight item has been handled.

use crate::config::{LatencyBufferConfig, ReadoutConfig};
use crate::error::{BufferError, ReadoutError, ReadoutResult};
use crate::error_registry::{FrameError, FrameErrorRegistry};
use crate::frame::{DataFrame, Timestamp, Timestamped};
use crate::latency_buffer::{
    FifoBuffer, LatencyBuffer, RangeLookup, SearchableBuffer, WriteOutcome, MIN_CAPACITY,
};
use crate::processor::TimestampChecker;
use crate::request::{DataDestination, DataRequest, RequestWindow};
use crate::request_handler::{CleanupPolicy, HandlerMode, RequestCounts, RequestHandler};
use crate::transport::FragmentTransport;
use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

/// How long the ingest loop waits for a frame before re-checking the run flag.
const RAW_QUEUE_TIMEOUT: Duration = Duration::from_millis(100);

/// Capacity of the outbound timesync queue.
const TIMESYNC_QUEUE_CAPACITY: usize = 1_024;

/// Registry entries included in [`ReadoutInfo`].
const RECENT_ERRORS: usize = 8;

/// Heartbeat carrying the newest ingested timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TimeSync {
    /// Last ingested frame timestamp. Never zero.
    pub daq_time: Timestamp,
    /// Wall-clock time the heartbeat was produced.
    pub system_time: DateTime<Utc>,
}

/// Monitoring snapshot of a readout model.
#[derive(Debug, Clone, Serialize)]
pub struct ReadoutInfo {
    /// When the snapshot was taken.
    pub generated_at: DateTime<Utc>,
    /// Whether the loops are running.
    pub running: bool,
    /// Frames currently buffered.
    pub occupancy: usize,
    /// Latency buffer capacity.
    pub capacity: usize,
    /// Timestamp of the newest ingested frame (0 before the first frame).
    pub last_timestamp: Timestamp,
    /// Frames written into the buffer.
    pub packets: u64,
    /// Payload bytes written into the buffer.
    pub payload_bytes: u64,
    /// Frames evicted by full-buffer overwrites.
    pub overwritten: u64,
    /// Frames rejected for arriving out of order.
    pub out_of_order: u64,
    /// Ingest waits that expired with no frame.
    pub raw_queue_timeouts: u64,
    /// Live registry entries.
    pub registry_size: usize,
    /// Registry entries ever recorded.
    pub registry_total: u64,
    /// Newest registry entries.
    pub recent_errors: Vec<FrameError>,
    /// Per-outcome request counters.
    pub requests: RequestCounts,
    /// Timesync heartbeats published.
    pub timesyncs_sent: u64,
    /// Fake trigger requests issued.
    pub fake_triggers: u64,
}

#[derive(Debug, Default)]
struct ReadoutStats {
    packets: AtomicU64,
    payload_bytes: AtomicU64,
    overwritten: AtomicU64,
    out_of_order: AtomicU64,
    raw_queue_timeouts: AtomicU64,
    last_timestamp: AtomicU64,
    timesyncs_sent: AtomicU64,
    fake_triggers: AtomicU64,
}

/// Latency buffer, error registry and request handler plus the loops that drive them.
pub struct ReadoutModel {
    config: ReadoutConfig,
    buffer: Arc<dyn RangeLookup<DataFrame>>,
    registry: Arc<FrameErrorRegistry>,
    handler: Arc<RequestHandler>,
    stats: Arc<ReadoutStats>,
    run_marker: Arc<AtomicBool>,

    frame_tx: Sender<DataFrame>,
    frame_rx: Receiver<DataFrame>,
    request_tx: Sender<DataRequest>,
    request_rx: Receiver<DataRequest>,
    timesync_tx: Sender<TimeSync>,
    timesync_rx: Receiver<TimeSync>,

    shutdown_tx: Option<Sender<()>>,
    threads: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for ReadoutModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadoutModel")
            .field("running", &self.is_running())
            .field("handler", &self.handler)
            .finish_non_exhaustive()
    }
}

/// Build the latency buffer strategy selected by configuration.
pub fn build_latency_buffer(
    config: &LatencyBufferConfig,
) -> ReadoutResult<Arc<dyn RangeLookup<DataFrame>>> {
    if config.capacity < MIN_CAPACITY {
        return Err(ReadoutError::InvalidCapacity {
            capacity: config.capacity,
            min: MIN_CAPACITY,
        });
    }
    let buffer: Arc<dyn RangeLookup<DataFrame>> = if config.search_optimized {
        Arc::new(SearchableBuffer::<DataFrame>::new(config.capacity)?)
    } else {
        Arc::new(FifoBuffer::<DataFrame>::new(config.capacity)?)
    };
    Ok(buffer)
}

impl ReadoutModel {
    /// Validate `config` and build the model. Fragments are delivered through `transport`.
    pub fn new(config: ReadoutConfig, transport: Arc<dyn FragmentTransport>) -> ReadoutResult<Self> {
        config.validate()?;

        let buffer = build_latency_buffer(&config.latency_buffer)?;
        let registry = Arc::new(FrameErrorRegistry::new());

        let mode = if config.requests.empty_fragment_mode {
            HandlerMode::EmptyFragment
        } else {
            HandlerMode::Lookup
        };
        let handler = RequestHandler::new(
            Arc::clone(&buffer),
            Arc::clone(&registry),
            transport,
            config.requests.delivery_timeout(),
        )
        .with_mode(mode)
        .with_cleanup(CleanupPolicy {
            pop_limit_pct: config.latency_buffer.pop_limit_pct,
            pop_size_pct: config.latency_buffer.pop_size_pct,
        });

        let (frame_tx, frame_rx) = bounded(config.emulator.queue_capacity);
        let (request_tx, request_rx) = bounded(config.requests.queue_capacity);
        let (timesync_tx, timesync_rx) = bounded(TIMESYNC_QUEUE_CAPACITY);

        info!(
            capacity = config.latency_buffer.capacity,
            search_optimized = config.latency_buffer.search_optimized,
            mode = ?mode,
            "Readout model configured"
        );

        Ok(Self {
            config,
            buffer,
            registry,
            handler: Arc::new(handler),
            stats: Arc::new(ReadoutStats::default()),
            run_marker: Arc::new(AtomicBool::new(false)),
            frame_tx,
            frame_rx,
            request_tx,
            request_rx,
            timesync_tx,
            timesync_rx,
            shutdown_tx: None,
            threads: Vec::new(),
        })
    }

    /// Queue feeding the ingest loop.
    pub fn frame_sender(&self) -> Sender<DataFrame> {
        self.frame_tx.clone()
    }

    /// Queue feeding the request loop.
    pub fn request_sender(&self) -> Sender<DataRequest> {
        self.request_tx.clone()
    }

    /// Outbound timesync heartbeats.
    pub fn timesync_receiver(&self) -> Receiver<TimeSync> {
        self.timesync_rx.clone()
    }

    /// The latency buffer.
    pub fn buffer(&self) -> &Arc<dyn RangeLookup<DataFrame>> {
        &self.buffer
    }

    /// The error registry.
    pub fn registry(&self) -> &Arc<FrameErrorRegistry> {
        &self.registry
    }

    /// The request handler.
    pub fn handler(&self) -> &Arc<RequestHandler> {
        &self.handler
    }

    /// True between [`start`](Self::start) and [`stop`](Self::stop).
    pub fn is_running(&self) -> bool {
        !self.threads.is_empty()
    }

    /// Spawn the ingest, timesync and request loops.
    pub fn start(&mut self) -> ReadoutResult<()> {
        if self.is_running() {
            return Err(ReadoutError::AlreadyRunning);
        }
        info!("Starting readout threads");
        self.run_marker.store(true, Ordering::Release);

        let (shutdown_tx, shutdown_rx) = bounded::<()>(0);
        self.shutdown_tx = Some(shutdown_tx);

        let ingest = IngestLoop {
            buffer: Arc::clone(&self.buffer),
            registry: Arc::clone(&self.registry),
            handler: Arc::clone(&self.handler),
            stats: Arc::clone(&self.stats),
            run_marker: Arc::clone(&self.run_marker),
            frames: self.frame_rx.clone(),
            checker: TimestampChecker::new(
                self.config.frames.tick_duration,
                self.config.frames.gap_tolerance,
                self.config.frames.frame_size_bytes,
            ),
        };
        let timesync = TimesyncLoop {
            config: self.config.clone(),
            handler: Arc::clone(&self.handler),
            stats: Arc::clone(&self.stats),
            run_marker: Arc::clone(&self.run_marker),
            sink: self.timesync_tx.clone(),
            shutdown: shutdown_rx,
        };
        let requests = RequestLoop {
            handler: Arc::clone(&self.handler),
            run_marker: Arc::clone(&self.run_marker),
            requests: self.request_rx.clone(),
            timeout: Duration::from_millis(self.config.requests.request_queue_timeout_ms),
        };

        let spawned = self
            .spawn("ingest", move || ingest.run())
            .and_then(|()| self.spawn("timesync", move || timesync.run()))
            .and_then(|()| self.spawn("requests", move || requests.run()));
        if let Err(err) = spawned {
            self.run_marker.store(false, Ordering::Release);
            self.stop();
            return Err(err);
        }
        Ok(())
    }

    fn spawn<F>(&mut self, name: &'static str, work: F) -> ReadoutResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(work)
            .map_err(|source| ReadoutError::ThreadSpawn { name, source })?;
        self.threads.push(handle);
        Ok(())
    }

    /// Stop every loop, wait for them to finish, and flush the latency buffer.
    pub fn stop(&mut self) {
        if !self.is_running() {
            return;
        }
        self.run_marker.store(false, Ordering::Release);
        self.shutdown_tx = None;
        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                warn!("Readout thread panicked");
            }
        }
        let info = self.info();
        self.handler.flush();
        self.stats.last_timestamp.store(0, Ordering::Release);
        info!(
            packets = info.packets,
            overwritten = info.overwritten,
            found = info.requests.found,
            partial = info.requests.partial,
            not_found = info.requests.not_found,
            "Readout threads stopped"
        );
    }

    /// Monitoring snapshot.
    pub fn info(&self) -> ReadoutInfo {
        ReadoutInfo {
            generated_at: Utc::now(),
            running: self.is_running(),
            occupancy: self.buffer.occupancy(),
            capacity: self.buffer.capacity(),
            last_timestamp: self.stats.last_timestamp.load(Ordering::Acquire),
            packets: self.stats.packets.load(Ordering::Relaxed),
            payload_bytes: self.stats.payload_bytes.load(Ordering::Relaxed),
            overwritten: self.stats.overwritten.load(Ordering::Relaxed),
            out_of_order: self.stats.out_of_order.load(Ordering::Relaxed),
            raw_queue_timeouts: self.stats.raw_queue_timeouts.load(Ordering::Relaxed),
            registry_size: self.registry.len(),
            registry_total: self.registry.total_recorded(),
            recent_errors: self.registry.recent(RECENT_ERRORS),
            requests: self.handler.stats().snapshot(),
            timesyncs_sent: self.stats.timesyncs_sent.load(Ordering::Relaxed),
            fake_triggers: self.stats.fake_triggers.load(Ordering::Relaxed),
        }
    }
}

impl Drop for ReadoutModel {
    fn drop(&mut self) {
        self.stop();
    }
}

struct IngestLoop {
    buffer: Arc<dyn RangeLookup<DataFrame>>,
    registry: Arc<FrameErrorRegistry>,
    handler: Arc<RequestHandler>,
    stats: Arc<ReadoutStats>,
    run_marker: Arc<AtomicBool>,
    frames: Receiver<DataFrame>,
    checker: TimestampChecker,
}

impl IngestLoop {
    fn run(mut self) {
        debug!("Consumer thread started");
        while self.run_marker.load(Ordering::Acquire) {
            match self.frames.recv_timeout(RAW_QUEUE_TIMEOUT) {
                Ok(frame) => self.ingest(frame),
                Err(RecvTimeoutError::Timeout) => {
                    self.stats.raw_queue_timeouts.fetch_add(1, Ordering::Relaxed);
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        debug!("Consumer thread finished");
    }

    fn ingest(&mut self, frame: DataFrame) {
        let ts = frame.timestamp();
        let size = frame.len() as u64;
        let anomalies = self.checker.inspect(&frame);

        match self.buffer.write(frame) {
            Ok(outcome) => {
                self.checker.commit(ts, anomalies, &self.registry);
                self.stats.packets.fetch_add(1, Ordering::Relaxed);
                self.stats.payload_bytes.fetch_add(size, Ordering::Relaxed);
                self.stats.last_timestamp.store(ts, Ordering::Release);
                if outcome == WriteOutcome::Overwrote {
                    self.stats.overwritten.fetch_add(1, Ordering::Relaxed);
                    self.handler.retire_errors();
                }
            }
            Err(BufferError::OutOfOrder { newest, got }) => {
                self.stats.out_of_order.fetch_add(1, Ordering::Relaxed);
                warn!(newest, got, "Dropping out-of-order frame");
            }
            Err(err) => warn!(error = %err, "Latency buffer write failed"),
        }

        self.handler.cleanup_check();
    }
}

struct TimesyncLoop {
    config: ReadoutConfig,
    handler: Arc<RequestHandler>,
    stats: Arc<ReadoutStats>,
    run_marker: Arc<AtomicBool>,
    sink: Sender<TimeSync>,
    shutdown: Receiver<()>,
}

impl TimesyncLoop {
    fn run(self) {
        debug!("Timesync thread started");
        let interval = Duration::from_millis(self.config.timesync.interval_ms);
        let destination = DataDestination::new(self.config.timesync.fake_trigger_destination.clone());
        let mut trigger_number: u64 = 0;
        let mut once_per_run = true;

        while self.run_marker.load(Ordering::Acquire) {
            let daq_time = self.stats.last_timestamp.load(Ordering::Acquire);
            if daq_time != 0 {
                let msg = TimeSync {
                    daq_time,
                    system_time: Utc::now(),
                };
                match self.sink.try_send(msg) {
                    Ok(()) => {
                        self.stats.timesyncs_sent.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(TrySendError::Full(_)) => debug!("Timesync queue full, heartbeat dropped"),
                    Err(TrySendError::Disconnected(_)) => {}
                }

                if self.config.timesync.fake_trigger {
                    trigger_number += 1;
                    let request = self.fake_request(trigger_number, daq_time, &destination);
                    debug!(
                        trigger_number,
                        window_begin = request.request_information.window_begin_ts,
                        window_end = request.request_information.window_end_ts,
                        "Issuing fake trigger"
                    );
                    self.handler.issue_request(request);
                    self.stats.fake_triggers.fetch_add(1, Ordering::Relaxed);
                }
            } else if once_per_run {
                info!("Timesync with DAQ time 0 won't be sent out as it's an invalid sync");
                once_per_run = false;
            }

            // Wakes early when the model drops its shutdown sender.
            if let Err(RecvTimeoutError::Disconnected) = self.shutdown.recv_timeout(interval) {
                break;
            }
        }
        debug!("Timesync thread finished");
    }

    fn fake_request(
        &self,
        trigger_number: u64,
        daq_time: Timestamp,
        destination: &DataDestination,
    ) -> DataRequest {
        let ts = &self.config.timesync;
        let begin = daq_time.saturating_sub(ts.fake_trigger_offset);
        DataRequest {
            request_information: RequestWindow::new(
                begin,
                begin.saturating_add(ts.fake_trigger_width),
            ),
            trigger_number,
            component_id: self.config.requests.component_id,
            data_destination: destination.clone(),
        }
    }
}

struct RequestLoop {
    handler: Arc<RequestHandler>,
    run_marker: Arc<AtomicBool>,
    requests: Receiver<DataRequest>,
    timeout: Duration,
}

impl RequestLoop {
    fn run(self) {
        debug!("Requester thread started");
        while self.run_marker.load(Ordering::Acquire) {
            match self.requests.recv_timeout(self.timeout) {
                Ok(request) => {
                    self.handler.issue_request(request);
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        debug!("Requester thread finished");
    }
}
