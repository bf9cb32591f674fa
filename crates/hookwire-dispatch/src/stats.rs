//! Dispatch counters.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Counters updated by the engine while it runs.
#[derive(Debug, Default)]
pub(crate) struct DispatchStats {
    events_observed: AtomicU64,
    missing_webhook: AtomicU64,
    events_parked: AtomicU64,
    events_dropped: AtomicU64,
    requests_sent: AtomicU64,
    batches_flushed: AtomicU64,
    events_delivered: AtomicU64,
    events_failed: AtomicU64,
}

impl DispatchStats {
    pub fn record_observed(&self) {
        self.events_observed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_missing_webhook(&self) {
        self.missing_webhook.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_parked(&self) {
        self.events_parked.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.events_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_request(&self) {
        self.requests_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_batch(&self) {
        self.batches_flushed.fetch_add(1, Ordering::Relaxed);
    }

    /// Records the outcome applied to `count` events.
    pub fn record_outcome(&self, delivered: bool, count: usize) {
        let counter = if delivered {
            &self.events_delivered
        } else {
            &self.events_failed
        };
        counter.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DispatchStatsSnapshot {
        DispatchStatsSnapshot {
            events_observed: self.events_observed.load(Ordering::Relaxed),
            missing_webhook: self.missing_webhook.load(Ordering::Relaxed),
            events_parked: self.events_parked.load(Ordering::Relaxed),
            events_dropped: self.events_dropped.load(Ordering::Relaxed),
            requests_sent: self.requests_sent.load(Ordering::Relaxed),
            batches_flushed: self.batches_flushed.load(Ordering::Relaxed),
            events_delivered: self.events_delivered.load(Ordering::Relaxed),
            events_failed: self.events_failed.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of the engine's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchStatsSnapshot {
    /// Events received from the store subscription.
    pub events_observed: u64,
    /// `MissingWebhook` errors emitted.
    pub missing_webhook: u64,
    /// Times an event was parked, including re-parks after a release.
    pub events_parked: u64,
    /// Events not parked because the parked set was full.
    pub events_dropped: u64,
    /// HTTP requests handed to the client.
    pub requests_sent: u64,
    /// Batches flushed, whether or not a request could be built.
    pub batches_flushed: u64,
    pub events_delivered: u64,
    pub events_failed: u64,
}
