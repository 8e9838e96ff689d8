//! Registry of time ranges known to be missing or faulty.
//!
//! Written by the ingest thread, read by request threads. Entries are kept
//! ordered by `end_ts` so that retiring stale records is a prefix removal.

use crate::frame::Timestamp;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Kind of anomaly a [`FrameError`] describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FrameErrorKind {
    /// Frames that were expected but never arrived.
    MissingFrames,
    /// Frames that arrived but failed structural validation.
    FaultyFrames,
}

impl fmt::Display for FrameErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameErrorKind::MissingFrames => write!(f, "MISSING_FRAMES"),
            FrameErrorKind::FaultyFrames => write!(f, "FAULTY_FRAMES"),
        }
    }
}

/// An immutable record of a bad time range, `[start_ts, end_ts]` inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FrameError {
    /// What went wrong.
    pub kind: FrameErrorKind,
    /// First affected tick.
    pub start_ts: Timestamp,
    /// Last affected tick.
    pub end_ts: Timestamp,
}

impl FrameError {
    /// Create a record, normalising the interval so that `start_ts <= end_ts`.
    pub fn new(kind: FrameErrorKind, start_ts: Timestamp, end_ts: Timestamp) -> Self {
        Self {
            kind,
            start_ts: start_ts.min(end_ts),
            end_ts: start_ts.max(end_ts),
        }
    }

    /// Shorthand for a [`FrameErrorKind::MissingFrames`] record.
    pub fn missing(start_ts: Timestamp, end_ts: Timestamp) -> Self {
        Self::new(FrameErrorKind::MissingFrames, start_ts, end_ts)
    }

    /// Shorthand for a [`FrameErrorKind::FaultyFrames`] record.
    pub fn faulty(start_ts: Timestamp, end_ts: Timestamp) -> Self {
        Self::new(FrameErrorKind::FaultyFrames, start_ts, end_ts)
    }

    /// True when `[begin, end]` intersects this record.
    pub fn intersects(&self, begin: Timestamp, end: Timestamp) -> bool {
        self.start_ts <= end && begin <= self.end_ts
    }
}

impl PartialOrd for FrameError {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FrameError {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.end_ts
            .cmp(&other.end_ts)
            .then(self.start_ts.cmp(&other.start_ts))
            .then(self.kind.cmp(&other.kind))
    }
}

/// Ordered, thread-safe collection of [`FrameError`] records.
///
/// Keys are `(end_ts, insertion sequence)` so duplicate intervals are kept
/// and `prune` is a single `split_off`.
#[derive(Debug, Default)]
pub struct FrameErrorRegistry {
    entries: RwLock<BTreeMap<(Timestamp, u64), FrameError>>,
    next_seq: AtomicU64,
    total_recorded: AtomicU64,
    total_pruned: AtomicU64,
}

impl FrameErrorRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new error.
    pub fn add(&self, error: FrameError) {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        self.entries.write().insert((error.end_ts, seq), error);
        self.total_recorded.fetch_add(1, Ordering::Relaxed);
    }

    /// Discard every entry with `end_ts < older_than`, returning how many were removed.
    pub fn prune(&self, older_than: Timestamp) -> usize {
        let mut entries = self.entries.write();
        let keep = entries.split_off(&(older_than, 0));
        let removed = entries.len();
        *entries = keep;
        drop(entries);

        if removed > 0 {
            self.total_pruned.fetch_add(removed as u64, Ordering::Relaxed);
        }
        removed
    }

    /// Every recorded error whose interval intersects `[begin, end]`, ordered by `end_ts`.
    pub fn overlaps(&self, begin: Timestamp, end: Timestamp) -> Vec<FrameError> {
        if begin > end {
            return Vec::new();
        }
        // Entries ending before `begin` cannot intersect.
        self.entries
            .read()
            .range((begin, 0)..)
            .map(|(_, e)| *e)
            .filter(|e| e.start_ts <= end)
            .collect()
    }

    /// True when any recorded error intersects `[begin, end]`.
    pub fn has_error(&self, begin: Timestamp, end: Timestamp) -> bool {
        begin <= end
            && self
                .entries
                .read()
                .range((begin, 0)..)
                .any(|(_, e)| e.start_ts <= end)
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// True when no entries are live.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// The `n` entries with the largest `end_ts`, newest first.
    pub fn recent(&self, n: usize) -> Vec<FrameError> {
        self.entries.read().values().rev().take(n).copied().collect()
    }

    /// Total entries ever recorded.
    pub fn total_recorded(&self) -> u64 {
        self.total_recorded.load(Ordering::Relaxed)
    }

    /// Total entries retired by [`prune`](Self::prune).
    pub fn total_pruned(&self) -> u64 {
        self.total_pruned.load(Ordering::Relaxed)
    }

    /// Drop every entry.
    pub fn clear(&self) {
        self.entries.write().clear();
    }
}
