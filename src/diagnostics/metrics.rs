use super::events::TransmissionEvent;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};

/// Prometheus view of the pipeline, registered on a private registry.
#[derive(Clone)]
pub struct ChannelMetrics {
    registry: Registry,
    pub(crate) items_received: IntCounter,
    pub(crate) items_dropped: IntCounterVec,
    pub(crate) transmissions: IntCounterVec,
    pub(crate) transmissions_stored: IntCounter,
    pub(crate) transmission_latency: HistogramVec,
}

impl ChannelMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let items_received = IntCounter::new(
            "telemetry_items_received_total",
            "Total number of telemetry items handed to the channel",
        )?;
        registry.register(Box::new(items_received.clone()))?;

        let items_dropped = IntCounterVec::new(
            Opts::new(
                "telemetry_items_dropped_total",
                "Total number of telemetry items given up on",
            ),
            &["reason"],
        )?;
        registry.register(Box::new(items_dropped.clone()))?;

        let transmissions = IntCounterVec::new(
            Opts::new(
                "telemetry_transmissions_total",
                "Total number of send attempts by outcome",
            ),
            &["outcome"],
        )?;
        registry.register(Box::new(transmissions.clone()))?;

        let transmissions_stored = IntCounter::new(
            "telemetry_transmissions_stored_total",
            "Total number of transmissions written to storage",
        )?;
        registry.register(Box::new(transmissions_stored.clone()))?;

        let transmission_latency = HistogramVec::new(
            HistogramOpts::new(
                "telemetry_transmission_latency_seconds",
                "Send latency in seconds",
            ),
            &["outcome"],
        )?;
        registry.register(Box::new(transmission_latency.clone()))?;

        Ok(Self {
            registry,
            items_received,
            items_dropped,
            transmissions,
            transmissions_stored,
            transmission_latency,
        })
    }

    pub(crate) fn observe_transmission(&self, event: &TransmissionEvent) {
        let outcome = event.outcome.kind();
        self.transmissions.with_label_values(&[outcome]).inc();
        self.transmission_latency
            .with_label_values(&[outcome])
            .observe(event.latency.as_secs_f64());
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn gather_text(&self) -> String {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buffer) {
            tracing::warn!("Failed to encode metrics: {e}");
            return String::new();
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }
}
