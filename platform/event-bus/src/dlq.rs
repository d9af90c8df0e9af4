//! Dead Letter Queue (DLQ) routing
//!
//! Events that cannot be processed (undecodable, rejected as permanently
//! invalid, or out of retry attempts) are parked here for manual inspection
//! instead of being dropped.

use crate::{BusError, BusMessage, BusResult, EventBus, MSG_ID_HEADER};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use uuid::Uuid;

/// Why an event left the live path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterReason {
    /// The envelope or payload could not be decoded
    Undecodable,
    /// A handler rejected the event as permanently invalid
    PermanentFailure,
    /// A handler kept failing until the attempt bound was reached
    RetriesExhausted,
}

impl DeadLetterReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeadLetterReason::Undecodable => "undecodable",
            DeadLetterReason::PermanentFailure => "permanent_failure",
            DeadLetterReason::RetriesExhausted => "retries_exhausted",
        }
    }
}

/// A failed delivery, with enough context to debug and replay it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    /// `None` when the envelope was too broken to read an id from
    pub event_id: Option<Uuid>,
    pub event_type: Option<String>,
    /// Subject the event was originally delivered on
    pub subject: String,
    /// Consumer group that gave up on the event
    pub consumer: String,
    pub reason: DeadLetterReason,
    pub error: String,
    pub attempts: u32,
    pub failed_at: DateTime<Utc>,
    /// The delivered bytes, unchanged; base64 in the JSON form
    #[serde(with = "payload_base64")]
    pub payload: Vec<u8>,
}

impl DeadLetter {
    pub fn from_message(
        msg: &BusMessage,
        consumer: &str,
        reason: DeadLetterReason,
        error: impl Into<String>,
        attempts: u32,
    ) -> Self {
        Self {
            event_id: None,
            event_type: None,
            subject: msg.subject.clone(),
            consumer: consumer.to_string(),
            reason,
            error: error.into(),
            attempts,
            failed_at: Utc::now(),
            payload: msg.payload.clone(),
        }
    }

    pub fn with_event(mut self, event_id: Uuid, event_type: impl Into<String>) -> Self {
        self.event_id = Some(event_id);
        self.event_type = Some(event_type.into());
        self
    }
}

mod payload_base64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

/// Destination for dead letters
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn dead_letter(&self, letter: &DeadLetter) -> BusResult<()>;
}

/// Publishes dead letters on `<prefix>.<original subject>`
#[derive(Clone)]
pub struct BusDeadLetterSink {
    bus: Arc<dyn EventBus>,
    prefix: String,
}

impl BusDeadLetterSink {
    pub fn new(bus: Arc<dyn EventBus>) -> Self {
        Self::with_prefix(bus, "dlq")
    }

    pub fn with_prefix(bus: Arc<dyn EventBus>, prefix: impl Into<String>) -> Self {
        Self {
            bus,
            prefix: prefix.into(),
        }
    }

    pub fn subject_for(&self, original_subject: &str) -> String {
        format!("{}.{}", self.prefix, original_subject)
    }
}

#[async_trait]
impl DeadLetterSink for BusDeadLetterSink {
    async fn dead_letter(&self, letter: &DeadLetter) -> BusResult<()> {
        let body =
            serde_json::to_vec(letter).map_err(|e| BusError::SerializationError(e.to_string()))?;

        let mut msg = BusMessage::new(self.subject_for(&letter.subject), body);
        if let Some(event_id) = letter.event_id {
            // One DLQ entry per (event, consumer), even if the write is retried
            msg = msg.with_headers(HashMap::from([(
                MSG_ID_HEADER.to_string(),
                format!("{event_id}:{}", letter.consumer),
            )]));
        }

        self.bus.publish_message(msg).await?;

        tracing::error!(
            event_id = ?letter.event_id,
            subject = %letter.subject,
            consumer = %letter.consumer,
            reason = letter.reason.as_str(),
            attempts = letter.attempts,
            error = %letter.error,
            "Event moved to DLQ"
        );

        Ok(())
    }
}

/// Keeps dead letters in memory for tests and local inspection
#[derive(Clone, Default)]
pub struct InMemoryDeadLetterQueue {
    letters: Arc<Mutex<Vec<DeadLetter>>>,
}

impl InMemoryDeadLetterQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn list(&self) -> Vec<DeadLetter> {
        self.letters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.letters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove and return everything parked so far
    pub fn drain(&self) -> Vec<DeadLetter> {
        std::mem::take(&mut *self.letters.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

#[async_trait]
impl DeadLetterSink for InMemoryDeadLetterQueue {
    async fn dead_letter(&self, letter: &DeadLetter) -> BusResult<()> {
        self.letters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(letter.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InMemoryBus;
    use futures::StreamExt;
    use std::time::Duration;

    fn sample_letter() -> DeadLetter {
        let msg = BusMessage::new("events.orders.order_placed".to_string(), b"{\"x\":1}".to_vec());
        DeadLetter::from_message(&msg, "inventory", DeadLetterReason::RetriesExhausted, "boom", 5)
            .with_event(Uuid::new_v4(), "orders.order_placed")
    }

    #[tokio::test]
    async fn test_bus_sink_publishes_under_dlq_prefix() {
        let bus = Arc::new(InMemoryBus::new());
        let mut stream = bus.subscribe("dlq.>").await.unwrap();
        let sink = BusDeadLetterSink::new(bus.clone());

        let letter = sample_letter();
        sink.dead_letter(&letter).await.unwrap();

        let msg = tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .expect("timeout")
            .expect("stream ended");
        assert_eq!(msg.subject, "dlq.events.orders.order_placed");

        let parsed: DeadLetter = serde_json::from_slice(&msg.payload).unwrap();
        assert_eq!(parsed, letter);
        assert_eq!(parsed.payload, b"{\"x\":1}");
    }

    #[test]
    fn test_binary_payload_survives_json_form() {
        let raw = vec![0xFF, 0xFE, b'{', 0x00];
        let msg = BusMessage::new("events.orders.order_placed".to_string(), raw.clone());
        let letter = DeadLetter::from_message(
            &msg,
            "inventory",
            DeadLetterReason::Undecodable,
            "invalid envelope",
            1,
        );

        let json = serde_json::to_value(&letter).unwrap();
        assert_eq!(json["payload"], "//57AA==");

        let parsed: DeadLetter = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.payload, raw);
    }

    #[tokio::test]
    async fn test_in_memory_queue_collects_and_drains() {
        let queue = InMemoryDeadLetterQueue::new();
        assert!(queue.is_empty());

        queue.dead_letter(&sample_letter()).await.unwrap();
        queue.dead_letter(&sample_letter()).await.unwrap();
        assert_eq!(queue.len(), 2);

        assert_eq!(queue.drain().len(), 2);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_reason_serializes_snake_case() {
        let json = serde_json::to_string(&DeadLetterReason::RetriesExhausted).unwrap();
        assert_eq!(json, "\"retries_exhausted\"");
        assert_eq!(DeadLetterReason::Undecodable.as_str(), "undecodable");
    }
}
