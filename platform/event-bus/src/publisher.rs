//! The Publish(event) operation producers call

use crate::{
    BusError, BusMessage, BusMetrics, BusResult, EventBus, EventEnvelope, EVENT_TYPE_HEADER,
    MSG_ID_HEADER,
};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::Instrument;
use uuid::Uuid;

/// Publishes integration events on `<subject_prefix>.<event_type>`
///
/// The envelope is serialized exactly once; those bytes are what every
/// transport carries. Failures are always returned to the caller, which may
/// need to roll back its own transaction.
#[derive(Clone)]
pub struct EventPublisher {
    bus: Arc<dyn EventBus>,
    subject_prefix: String,
    metrics: Option<BusMetrics>,
}

impl EventPublisher {
    pub fn new(bus: Arc<dyn EventBus>, subject_prefix: impl Into<String>) -> Self {
        Self {
            bus,
            subject_prefix: subject_prefix.into(),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: BusMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Subject an event type is published on
    pub fn subject_for(&self, event_type: &str) -> String {
        if self.subject_prefix.is_empty() {
            event_type.to_string()
        } else {
            format!("{}.{}", self.subject_prefix, event_type)
        }
    }

    /// Publish one integration event
    ///
    /// Resolves once the transport has accepted the event. Publishing with no
    /// subscribers succeeds.
    pub async fn publish<T: Serialize>(&self, envelope: &EventEnvelope<T>) -> BusResult<()> {
        let payload = serde_json::to_vec(envelope)
            .map_err(|e| BusError::SerializationError(e.to_string()))?;

        self.publish_serialized(
            envelope.event_id(),
            envelope.event_type(),
            envelope.correlation_id(),
            payload,
        )
        .await
    }

    /// Publish an envelope that was serialized earlier (outbox rows)
    pub async fn publish_serialized(
        &self,
        event_id: Uuid,
        event_type: &str,
        correlation_id: Option<&str>,
        payload: Vec<u8>,
    ) -> BusResult<()> {
        let subject = self.subject_for(event_type);
        let headers = HashMap::from([
            (MSG_ID_HEADER.to_string(), event_id.to_string()),
            (EVENT_TYPE_HEADER.to_string(), event_type.to_string()),
        ]);
        let msg = BusMessage::new(subject.clone(), payload).with_headers(headers);

        let span = tracing::info_span!(
            "publish_event",
            event_id = %event_id,
            event_type = %event_type,
            subject = %subject,
            correlation_id = %correlation_id.unwrap_or("none"),
        );

        async {
            let start = Instant::now();
            let result = self.bus.publish_message(msg).await;

            if let Some(metrics) = &self.metrics {
                let label = if result.is_ok() { "ok" } else { "error" };
                metrics
                    .publish_total
                    .with_label_values(&[event_type, label])
                    .inc();
                metrics
                    .publish_duration_seconds
                    .with_label_values(&[event_type])
                    .observe(start.elapsed().as_secs_f64());
            }

            match &result {
                Ok(()) => tracing::debug!("Published integration event"),
                Err(e) => tracing::error!(error = %e, "Failed to publish integration event"),
            }

            result
        }
        .instrument(span)
        .await
    }
}
