//! Prometheus instrumentation for publish and delivery attempts

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder,
};

#[derive(Clone)]
pub struct BusMetrics {
    registry: Registry,

    // Counters
    pub publish_total: IntCounterVec,
    pub delivery_total: IntCounterVec,
    pub outbox_relayed_total: IntCounterVec,

    // Histograms
    pub publish_duration_seconds: HistogramVec,
    pub delivery_duration_seconds: HistogramVec,
}

impl BusMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let publish_total = IntCounterVec::new(
            Opts::new("event_bus_publish_total", "Integration event publish attempts"),
            &["event_type", "result"], // result: ok|error
        )?;

        let delivery_total = IntCounterVec::new(
            Opts::new("event_bus_delivery_total", "Integration event delivery attempts"),
            &["event_type", "outcome"], // handled|duplicate|ignored|retrying|dead_lettered
        )?;

        let outbox_relayed_total = IntCounterVec::new(
            Opts::new("event_bus_outbox_relayed_total", "Outbox rows relayed to the bus"),
            &["result"], // published|retry|failed
        )?;

        let publish_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "event_bus_publish_duration_seconds",
                "Time until the transport accepted a publish",
            ),
            &["event_type"],
        )?;

        let delivery_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "event_bus_delivery_duration_seconds",
                "Time spent dispatching one delivery to its handlers",
            ),
            &["event_type"],
        )?;

        registry.register(Box::new(publish_total.clone()))?;
        registry.register(Box::new(delivery_total.clone()))?;
        registry.register(Box::new(outbox_relayed_total.clone()))?;
        registry.register(Box::new(publish_duration_seconds.clone()))?;
        registry.register(Box::new(delivery_duration_seconds.clone()))?;

        Ok(Self {
            registry,
            publish_total,
            delivery_total,
            outbox_relayed_total,
            publish_duration_seconds,
            delivery_duration_seconds,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render all metrics in the Prometheus text exposition format
    pub fn gather_text(&self) -> String {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buf) {
            tracing::warn!(error = %e, "Failed to encode metrics");
        }
        String::from_utf8(buf).unwrap_or_default()
    }
}
