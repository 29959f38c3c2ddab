//! Shared counters for the actor system.
//!
//! Plain atomics threaded through the actors as `Arc<SignalMetrics>`;
//! snapshots feed periodic status logs.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Live gauges and counters for the signaling core.
#[derive(Debug, Default)]
pub struct SignalMetrics {
    active_rooms: AtomicUsize,
    active_peers: AtomicUsize,
    active_producers: AtomicUsize,
    active_consumers: AtomicUsize,
    messages_processed: AtomicU64,
}

/// Point-in-time copy of the metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub rooms: usize,
    pub peers: usize,
    pub producers: usize,
    pub consumers: usize,
    pub messages_processed: u64,
}

impl SignalMetrics {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_rooms(&self, count: usize) {
        self.active_rooms.store(count, Ordering::Relaxed);
    }

    pub fn peer_joined(&self) {
        self.active_peers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn peer_left(&self) {
        decrement(&self.active_peers);
    }

    pub fn producer_added(&self) {
        self.active_producers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn producer_removed(&self) {
        decrement(&self.active_producers);
    }

    pub fn consumer_added(&self) {
        self.active_consumers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn consumer_removed(&self) {
        decrement(&self.active_consumers);
    }

    pub fn message_processed(&self) {
        self.messages_processed.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            rooms: self.active_rooms.load(Ordering::Relaxed),
            peers: self.active_peers.load(Ordering::Relaxed),
            producers: self.active_producers.load(Ordering::Relaxed),
            consumers: self.active_consumers.load(Ordering::Relaxed),
            messages_processed: self.messages_processed.load(Ordering::Relaxed),
        }
    }
}

// Gauges never go negative even if a remove races a crash-path double count.
fn decrement(gauge: &AtomicUsize) {
    let mut current = gauge.load(Ordering::Relaxed);
    while current > 0 {
        match gauge.compare_exchange_weak(
            current,
            current - 1,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => return,
            Err(observed) => current = observed,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_gauge_roundtrip() {
        let metrics = SignalMetrics::new();
        metrics.peer_joined();
        metrics.peer_joined();
        metrics.producer_added();
        metrics.consumer_added();
        metrics.set_rooms(1);
        metrics.message_processed();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.peers, 2);
        assert_eq!(snapshot.producers, 1);
        assert_eq!(snapshot.consumers, 1);
        assert_eq!(snapshot.rooms, 1);
        assert_eq!(snapshot.messages_processed, 1);

        metrics.peer_left();
        metrics.producer_removed();
        metrics.consumer_removed();
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.peers, 1);
        assert_eq!(snapshot.producers, 0);
        assert_eq!(snapshot.consumers, 0);
    }

    #[test]
    fn test_gauges_saturate_at_zero() {
        let metrics = SignalMetrics::new();
        metrics.peer_left();
        assert_eq!(metrics.snapshot().peers, 0);
    }
}
