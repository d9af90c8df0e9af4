//! # EventBus Abstraction
//!
//! The publish-side contract for integration events: services announce facts
//! about committed local transactions without knowing who consumes them.
//!
//! ## Why This Lives in Tier 1
//!
//! The EventBus is a **shared runtime capability** that all modules depend on.
//! Placing it in `platform/` (Tier 1) allows:
//! - Modules to depend on platform crates without circular dependencies
//! - Producers that never learn about the existence or count of consumers
//! - Config-driven swap between NATS/JetStream (production) and InMemory (dev/test)
//!
//! ## Implementations
//!
//! - **JetStreamBus**: Production implementation; publish returns once the
//!   server has durably stored the message
//! - **NatsBus**: Core NATS, no persistence (dev clusters)
//! - **InMemoryBus**: Test/dev implementation using in-memory channels
//!
//! ## Usage
//!
//! ```rust,no_run
//! use event_bus::{EventBus, EventEnvelope, EventPublisher, InMemoryBus, IntegrationEvent};
//! use serde::{Deserialize, Serialize};
//! use std::sync::Arc;
//!
//! #[derive(Debug, Clone, Serialize, Deserialize)]
//! struct OrderPlaced {
//!     order_id: i64,
//! }
//!
//! impl IntegrationEvent for OrderPlaced {
//!     const EVENT_TYPE: &'static str = "orders.order_placed";
//! }
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let bus: Arc<dyn EventBus> = Arc::new(InMemoryBus::new());
//! let publisher = EventPublisher::new(bus.clone(), "events");
//!
//! let envelope = EventEnvelope::new("orders", OrderPlaced { order_id: 42 });
//! publisher.publish(&envelope).await?;
//! # Ok(())
//! # }
//! ```

mod envelope;
mod inmemory_bus;
mod jetstream_bus;
mod nats_bus;
mod publisher;

pub mod config;
pub mod consumer_retry;
pub mod db;
pub mod dlq;
pub mod metrics;
pub mod outbox;

pub use config::{connect_bus, BusConfig, BusType, ConfigError};
pub use dlq::{
    BusDeadLetterSink, DeadLetter, DeadLetterReason, DeadLetterSink, InMemoryDeadLetterQueue,
};
pub use envelope::{validate_envelope_fields, EnvelopeHeader, EventEnvelope, IntegrationEvent};
pub use inmemory_bus::{DeliveryStats, InMemoryBus};
pub use jetstream_bus::{ensure_streams, JetStreamBus, StreamSettings};
pub use metrics::BusMetrics;
pub use nats_bus::NatsBus;
pub use publisher::EventPublisher;

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

/// Header carrying the event id; JetStream uses it for duplicate suppression
pub const MSG_ID_HEADER: &str = "Nats-Msg-Id";

/// Header carrying the logical event type
pub const EVENT_TYPE_HEADER: &str = "X-Event-Type";

/// Header carrying the delivery attempt for transports without native redelivery
pub const ATTEMPT_HEADER: &str = "X-Delivery-Attempt";

/// A message received from the event bus
#[derive(Debug, Clone)]
pub struct BusMessage {
    /// The subject/topic this message was published to
    pub subject: String,
    /// The message payload (raw bytes)
    pub payload: Vec<u8>,
    /// Optional headers
    pub headers: Option<HashMap<String, String>>,
    /// Optional reply-to subject (for request-response patterns)
    pub reply_to: Option<String>,
}

impl BusMessage {
    /// Create a new bus message
    pub fn new(subject: String, payload: Vec<u8>) -> Self {
        Self {
            subject,
            payload,
            headers: None,
            reply_to: None,
        }
    }

    /// Add headers to the message
    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers = Some(headers);
        self
    }

    /// Add a reply-to subject
    pub fn with_reply_to(mut self, reply_to: String) -> Self {
        self.reply_to = Some(reply_to);
        self
    }

    /// Look up a header value
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .as_ref()
            .and_then(|h| h.get(name))
            .map(String::as_str)
    }
}

/// Errors that can occur when using the event bus
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("failed to publish message: {0}")]
    PublishError(String),

    #[error("failed to subscribe to subject: {0}")]
    SubscribeError(String),

    #[error("connection error: {0}")]
    ConnectionError(String),

    #[error("serialization error: {0}")]
    SerializationError(String),

    #[error("invalid subject pattern: {0}")]
    InvalidSubject(String),

    #[error("failed to settle delivery: {0}")]
    AckError(String),

    #[error("internal error: {0}")]
    InternalError(String),
}

/// Result type for event bus operations
pub type BusResult<T> = Result<T, BusError>;

/// Settles a single delivery with the transport that produced it
#[async_trait]
pub trait Acker: Send + Sync {
    /// Processing succeeded; the transport must not redeliver
    async fn ack(&self) -> BusResult<()>;

    /// Processing failed; redeliver after `delay`
    async fn nak(&self, delay: Duration) -> BusResult<()>;

    /// Stop redelivering without acknowledging success (dead-lettered)
    async fn term(&self) -> BusResult<()>;
}

/// A message handed out by [`EventBus::consume`] that must be settled
///
/// Settlement methods take `self`, so a delivery is settled at most once.
/// A delivery dropped without settlement is redelivered by transports that
/// track ack deadlines (JetStream); the in-memory bus treats it as lost.
pub struct Delivery {
    /// The delivered message
    pub message: BusMessage,
    /// 1 for the first delivery, incremented on each redelivery
    pub attempt: u32,
    acker: Box<dyn Acker>,
}

impl Delivery {
    pub fn new(message: BusMessage, attempt: u32, acker: impl Acker + 'static) -> Self {
        Self {
            message,
            attempt,
            acker: Box::new(acker),
        }
    }

    pub fn subject(&self) -> &str {
        &self.message.subject
    }

    pub fn payload(&self) -> &[u8] {
        &self.message.payload
    }

    pub async fn ack(self) -> BusResult<()> {
        self.acker.ack().await
    }

    pub async fn nak(self, delay: Duration) -> BusResult<()> {
        self.acker.nak(delay).await
    }

    pub async fn term(self) -> BusResult<()> {
        self.acker.term().await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("subject", &self.message.subject)
            .field("attempt", &self.attempt)
            .finish()
    }
}

/// Core event bus abstraction for publish-subscribe messaging
///
/// This trait defines the interface that all event bus implementations must satisfy.
/// Implementations must be safe to share across tasks; concurrent `publish`
/// calls never interleave payload bytes.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publish a message to a subject
    ///
    /// # Returns
    /// * `Ok(())` once the transport has accepted the message
    /// * `Err(BusError)` if the transport is unreachable or rejects it
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> BusResult<()>;

    /// Publish a message together with its headers
    ///
    /// Transports without header support fall back to [`EventBus::publish`].
    async fn publish_message(&self, msg: BusMessage) -> BusResult<()> {
        self.publish(&msg.subject, msg.payload).await
    }

    /// Subscribe to messages matching a subject pattern
    ///
    /// Fan-out, fire-and-forget: every subscriber sees every message and
    /// nothing is acknowledged.
    ///
    /// * `subject` - The subject pattern to subscribe to (supports wildcards: `*`, `>`)
    ///   - `*` matches a single token (e.g., `auth.*.created`)
    ///   - `>` matches one or more tokens (e.g., `auth.events.>`)
    async fn subscribe(&self, subject: &str) -> BusResult<BoxStream<'static, BusMessage>>;

    /// Consume messages matching a subject pattern as members of `group`
    ///
    /// Each message is handed to one member of the group and redelivered
    /// until it is acked or terminated. A group only receives messages
    /// published after it first consumed.
    async fn consume(&self, subject: &str, group: &str)
        -> BusResult<BoxStream<'static, Delivery>>;
}

impl fmt::Debug for dyn EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EventBus")
    }
}

/// Check if a subject matches a subscription pattern
///
/// Supports NATS-style wildcards:
/// - `*` matches exactly one token
/// - `>` matches one or more tokens
pub fn subject_matches(subject: &str, pattern: &str) -> bool {
    let subject_tokens: Vec<&str> = subject.split('.').collect();
    let pattern_tokens: Vec<&str> = pattern.split('.').collect();

    let mut s_idx = 0;
    let mut p_idx = 0;

    while s_idx < subject_tokens.len() && p_idx < pattern_tokens.len() {
        let pattern_token = pattern_tokens[p_idx];

        if pattern_token == ">" {
            return true;
        } else if pattern_token == "*" || subject_tokens[s_idx] == pattern_token {
            s_idx += 1;
            p_idx += 1;
        } else {
            return false;
        }
    }

    s_idx == subject_tokens.len() && p_idx == pattern_tokens.len()
}

/// Reject empty subjects, empty tokens (`a..b`), and wildcards in publish subjects
pub(crate) fn validate_subject(subject: &str, allow_wildcards: bool) -> BusResult<()> {
    let invalid = subject.is_empty()
        || subject.split('.').any(|token| {
            token.is_empty() || (!allow_wildcards && (token == "*" || token == ">"))
        });
    if invalid {
        return Err(BusError::InvalidSubject(subject.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pattern_matching() {
        assert!(subject_matches("orders.events.order_placed", "orders.events.order_placed"));

        assert!(subject_matches("orders.events.order_placed", "orders.*.order_placed"));
        assert!(!subject_matches("orders.events.order_placed", "orders.*"));

        assert!(subject_matches("orders.events.order_placed", "orders.>"));
        assert!(!subject_matches("orders.events.order_placed", "billing.>"));

        assert!(subject_matches("single", "*"));
        assert!(subject_matches("single", ">"));
        assert!(!subject_matches("one.two", "one"));
    }

    #[test]
    fn test_validate_subject() {
        assert!(validate_subject("events.orders.placed", false).is_ok());
        assert!(validate_subject("", false).is_err());
        assert!(validate_subject("events..placed", true).is_err());
        assert!(validate_subject("events.", true).is_err());
        assert!(validate_subject("events.>", false).is_err());
        assert!(validate_subject("events.>", true).is_ok());
    }

    #[test]
    fn test_header_lookup() {
        let msg = BusMessage::new("a.b".to_string(), vec![]).with_headers(HashMap::from([(
            MSG_ID_HEADER.to_string(),
            "abc".to_string(),
        )]));
        assert_eq!(msg.header(MSG_ID_HEADER), Some("abc"));
        assert_eq!(msg.header(EVENT_TYPE_HEADER), None);
    }
}
