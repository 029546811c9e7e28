//! Self-diagnostics for the pipeline.
//!
//! Telemetry failures are never thrown at producers; they are counted here,
//! logged through `tracing`, and published as [`TransmissionEvent`]s for
//! anyone who subscribes.

pub mod events;
#[cfg(feature = "metrics")]
pub mod metrics;

pub use events::{DropReason, EventSource, TransmissionEvent};
#[cfg(feature = "metrics")]
pub use metrics::ChannelMetrics;

use crate::sender::TransmissionOutcome;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiagnosticsSnapshot {
    pub items_received: u64,
    pub items_dropped: u64,
    pub items_skipped: u64,
    pub flushes: u64,
    pub transmissions_succeeded: u64,
    pub transmissions_partial: u64,
    pub transmissions_transient: u64,
    pub transmissions_permanent: u64,
    pub transmissions_stored: u64,
    pub transmissions_dropped: u64,
    pub transmissions_resubmitted: u64,
    pub sender_rejections: u64,
    pub storage_corrupt: u64,
    pub storage_expired: u64,
    pub bytes_sent: u64,
}

#[derive(Debug, Default)]
struct Counters {
    items_received: AtomicU64,
    items_dropped: AtomicU64,
    items_skipped: AtomicU64,
    flushes: AtomicU64,
    transmissions_succeeded: AtomicU64,
    transmissions_partial: AtomicU64,
    transmissions_transient: AtomicU64,
    transmissions_permanent: AtomicU64,
    transmissions_stored: AtomicU64,
    transmissions_dropped: AtomicU64,
    transmissions_resubmitted: AtomicU64,
    sender_rejections: AtomicU64,
    storage_corrupt: AtomicU64,
    storage_expired: AtomicU64,
    bytes_sent: AtomicU64,
}

pub struct Diagnostics {
    counters: Counters,
    events: broadcast::Sender<TransmissionEvent>,
    #[cfg(feature = "metrics")]
    metrics: Option<ChannelMetrics>,
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Diagnostics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Diagnostics")
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

impl Diagnostics {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        #[cfg(feature = "metrics")]
        let metrics = match ChannelMetrics::new() {
            Ok(metrics) => Some(metrics),
            Err(e) => {
                tracing::warn!("Prometheus metrics disabled: {e}");
                None
            }
        };

        Self {
            counters: Counters::default(),
            events,
            #[cfg(feature = "metrics")]
            metrics,
        }
    }

    /// Stream of per-transmission notifications. Slow subscribers lose the
    /// oldest events rather than slowing the sender down.
    pub fn subscribe(&self) -> broadcast::Receiver<TransmissionEvent> {
        self.events.subscribe()
    }

    pub fn record_item_received(&self) {
        self.counters.items_received.fetch_add(1, Ordering::Relaxed);
        #[cfg(feature = "metrics")]
        if let Some(metrics) = &self.metrics {
            metrics.items_received.inc();
        }
    }

    pub fn record_items_dropped(&self, count: usize, reason: DropReason) {
        if count == 0 {
            return;
        }
        self.counters
            .items_dropped
            .fetch_add(count as u64, Ordering::Relaxed);
        #[cfg(feature = "metrics")]
        if let Some(metrics) = &self.metrics {
            metrics
                .items_dropped
                .with_label_values(&[reason.as_str()])
                .inc_by(count as u64);
        }
        tracing::debug!("Dropped {count} telemetry items ({})", reason.as_str());
    }

    pub fn record_items_skipped(&self, count: usize) {
        self.counters
            .items_skipped
            .fetch_add(count as u64, Ordering::Relaxed);
        self.record_items_dropped(count, DropReason::Serialization);
    }

    pub fn record_flush(&self) {
        self.counters.flushes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sender_rejection(&self) {
        self.counters
            .sender_rejections
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stored(&self) {
        self.counters
            .transmissions_stored
            .fetch_add(1, Ordering::Relaxed);
        #[cfg(feature = "metrics")]
        if let Some(metrics) = &self.metrics {
            metrics.transmissions_stored.inc();
        }
    }

    /// A whole transmission was given up on.
    pub fn record_transmission_dropped(&self, item_count: usize, reason: DropReason) {
        self.counters
            .transmissions_dropped
            .fetch_add(1, Ordering::Relaxed);
        self.record_items_dropped(item_count, reason);
    }

    pub fn record_resubmitted(&self) {
        self.counters
            .transmissions_resubmitted
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_storage_corrupt(&self) {
        self.counters.storage_corrupt.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_storage_expired(&self, item_count: usize) {
        self.counters.storage_expired.fetch_add(1, Ordering::Relaxed);
        self.record_items_dropped(item_count, DropReason::Expired);
    }

    /// Counts the outcome and publishes the event.
    pub fn record_transmission(&self, event: TransmissionEvent) {
        let counter = match &event.outcome {
            TransmissionOutcome::Success { .. } => &self.counters.transmissions_succeeded,
            TransmissionOutcome::PartialSuccess { .. } => &self.counters.transmissions_partial,
            TransmissionOutcome::TransientFailure { .. } => {
                &self.counters.transmissions_transient
            }
            TransmissionOutcome::PermanentFailure { .. } => {
                &self.counters.transmissions_permanent
            }
        };
        counter.fetch_add(1, Ordering::Relaxed);

        if matches!(
            event.outcome,
            TransmissionOutcome::Success { .. } | TransmissionOutcome::PartialSuccess { .. }
        ) {
            self.counters
                .bytes_sent
                .fetch_add(event.bytes as u64, Ordering::Relaxed);
        }

        #[cfg(feature = "metrics")]
        if let Some(metrics) = &self.metrics {
            metrics.observe_transmission(&event);
        }

        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        let c = &self.counters;
        DiagnosticsSnapshot {
            items_received: c.items_received.load(Ordering::Relaxed),
            items_dropped: c.items_dropped.load(Ordering::Relaxed),
            items_skipped: c.items_skipped.load(Ordering::Relaxed),
            flushes: c.flushes.load(Ordering::Relaxed),
            transmissions_succeeded: c.transmissions_succeeded.load(Ordering::Relaxed),
            transmissions_partial: c.transmissions_partial.load(Ordering::Relaxed),
            transmissions_transient: c.transmissions_transient.load(Ordering::Relaxed),
            transmissions_permanent: c.transmissions_permanent.load(Ordering::Relaxed),
            transmissions_stored: c.transmissions_stored.load(Ordering::Relaxed),
            transmissions_dropped: c.transmissions_dropped.load(Ordering::Relaxed),
            transmissions_resubmitted: c.transmissions_resubmitted.load(Ordering::Relaxed),
            sender_rejections: c.sender_rejections.load(Ordering::Relaxed),
            storage_corrupt: c.storage_corrupt.load(Ordering::Relaxed),
            storage_expired: c.storage_expired.load(Ordering::Relaxed),
            bytes_sent: c.bytes_sent.load(Ordering::Relaxed),
        }
    }

    /// The Prometheus registry, for embedding in an existing exporter.
    #[cfg(feature = "metrics")]
    pub fn metrics(&self) -> Option<&ChannelMetrics> {
        self.metrics.as_ref()
    }

    /// Prometheus text exposition of the registry, empty without the
    /// `metrics` feature.
    pub fn gather_text(&self) -> String {
        #[cfg(feature = "metrics")]
        if let Some(metrics) = &self.metrics {
            return metrics.gather_text();
        }
        String::new()
    }
}
