//! Behavioral properties of both latency buffer strategies and the error registry,
//! checked over seeded random workloads.

use daq_readout::config::LatencyBufferConfig;
use daq_readout::error_registry::{FrameError, FrameErrorRegistry};
use daq_readout::frame::{DataFrame, Timestamp, Timestamped};
use daq_readout::latency_buffer::{LatencyBuffer, RangeLookup};
use daq_readout::readout::build_latency_buffer;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::sync::Arc;

fn strategies(capacity: usize) -> Vec<(&'static str, Arc<dyn RangeLookup<DataFrame>>)> {
    [("searchable", true), ("fifo", false)]
        .into_iter()
        .map(|(name, search_optimized)| {
            let config = LatencyBufferConfig {
                capacity,
                search_optimized,
                ..Default::default()
            };
            (name, build_latency_buffer(&config).unwrap())
        })
        .collect()
}

/// Non-decreasing timestamps with random steps, including repeats.
fn timestamps(rng: &mut ChaCha8Rng, count: usize) -> Vec<Timestamp> {
    let mut ts = rng.gen_range(0..1_000u64);
    (0..count)
        .map(|_| {
            ts += rng.gen_range(0..4u64);
            ts
        })
        .collect()
}

fn contents(buffer: &dyn RangeLookup<DataFrame>) -> Vec<Timestamp> {
    buffer
        .lookup(0, Timestamp::MAX)
        .frames
        .iter()
        .map(Timestamped::timestamp)
        .collect()
}

#[test]
fn test_retains_exactly_the_most_recent_writes() {
    let mut rng = ChaCha8Rng::seed_from_u64(1);
    for _ in 0..20 {
        let capacity = rng.gen_range(2..64);
        let count = rng.gen_range(0..256);
        let written = timestamps(&mut rng, count);
        for (name, buffer) in strategies(capacity) {
            for &ts in &written {
                buffer.write(DataFrame::with_pattern(ts, 4)).unwrap();
                assert!(buffer.occupancy() <= capacity, "{name}: occupancy over capacity");
            }
            let expected: Vec<Timestamp> = written
                .iter()
                .copied()
                .skip(written.len().saturating_sub(capacity))
                .collect();
            assert_eq!(contents(buffer.as_ref()), expected, "{name}");
        }
    }
}

#[test]
fn test_order_is_preserved() {
    let mut rng = ChaCha8Rng::seed_from_u64(2);
    for (name, buffer) in strategies(100) {
        for ts in timestamps(&mut rng, 500) {
            buffer.write(DataFrame::with_pattern(ts, 4)).unwrap();
        }
        let stored = contents(buffer.as_ref());
        assert!(stored.windows(2).all(|w| w[0] <= w[1]), "{name}");
    }
}

#[test]
fn test_strategies_agree_on_lookups() {
    let mut rng = ChaCha8Rng::seed_from_u64(3);
    let written = timestamps(&mut rng, 300);
    let buffers = strategies(128);
    for (_, buffer) in &buffers {
        for &ts in &written {
            buffer.write(DataFrame::with_pattern(ts, 4)).unwrap();
        }
    }

    let low = written[0];
    let high = written[written.len() - 1] + 10;
    for _ in 0..500 {
        let begin = rng.gen_range(low..high);
        let end = rng.gen_range(low..high);
        let searchable = buffers[0].1.lookup(begin, end);
        let fifo = buffers[1].1.lookup(begin, end);
        assert_eq!(searchable.frames, fifo.frames, "window [{begin}, {end}]");
        assert_eq!(searchable.oldest, fifo.oldest);
        assert_eq!(searchable.newest, fifo.newest);
        assert!(searchable
            .frames
            .iter()
            .all(|f| begin <= f.timestamp() && f.timestamp() <= end));
    }
}

#[test]
fn test_lookup_example_window() {
    for (name, buffer) in strategies(32) {
        for ts in 10..=20 {
            buffer.write(DataFrame::with_pattern(ts, 4)).unwrap();
        }
        let found: Vec<Timestamp> = buffer
            .lookup(13, 16)
            .frames
            .iter()
            .map(Timestamped::timestamp)
            .collect();
        assert_eq!(found, vec![13, 14, 15, 16], "{name}");
        assert!(buffer.lookup(5, 8).frames.is_empty(), "{name}");
    }
}

#[test]
fn test_pop_beyond_occupancy_empties() {
    for (name, buffer) in strategies(16) {
        for ts in 0..10 {
            buffer.write(DataFrame::with_pattern(ts, 4)).unwrap();
        }
        assert_eq!(buffer.pop(3), 3, "{name}");
        assert_eq!(buffer.pop(1_000), 7, "{name}");
        assert_eq!(buffer.pop(1), 0, "{name}");
        assert!(buffer.is_empty());
        assert!(buffer.front().is_none());
    }
}

#[test]
fn test_prune_leaves_no_stale_entry() {
    let mut rng = ChaCha8Rng::seed_from_u64(4);
    let registry = FrameErrorRegistry::new();
    for _ in 0..1_000 {
        let start = rng.gen_range(0..10_000u64);
        let len = rng.gen_range(0..50u64);
        let error = if rng.gen_bool(0.5) {
            FrameError::missing(start, start + len)
        } else {
            FrameError::faulty(start, start + len)
        };
        registry.add(error);
    }

    let mut cutoff = 0;
    while !registry.is_empty() {
        cutoff += rng.gen_range(0..1_500u64);
        let before = registry.len();
        let removed = registry.prune(cutoff);
        assert_eq!(registry.len(), before - removed);
        assert!(registry
            .recent(registry.len())
            .iter()
            .all(|e| e.end_ts >= cutoff));
    }
    assert_eq!(registry.total_pruned(), 1_000);
}
