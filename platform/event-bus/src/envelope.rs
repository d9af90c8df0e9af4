//! # Event Envelope
//!
//! One envelope format for every integration event crossing a module boundary.
//!
//! ## Design Principles
//!
//! 1. **Single Source of Truth**: One envelope struct for the entire platform
//! 2. **Immutability**: Fields are private; once an envelope is built nothing
//!    on the publish or dispatch path can change its id or payload
//! 3. **Stable routing**: `event_type` is a logical name that survives
//!    producer upgrades, independent of the Rust type name
//!
//! ## Envelope Fields
//!
//! - `event_id`: Unique identifier, consumers deduplicate on it
//! - `event_type`: Logical name handlers are registered under
//! - `occurred_at`: Creation timestamp (diagnostics and ordering hints only)
//! - `source_module`: Module that produced the event
//! - `source_version`: Semantic version of the source module
//! - `correlation_id`: Links related events in a business transaction
//! - `causation_id`: Links this event to the command/event that caused it
//! - `payload`: Event-specific data (generic type parameter)

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A payload type that can travel as an integration event
///
/// `EVENT_TYPE` must stay the same across versions of the producing service;
/// renaming it silently disconnects every subscriber.
pub trait IntegrationEvent: Serialize + DeserializeOwned + Send + Sync + 'static {
    const EVENT_TYPE: &'static str;
}

/// Immutable record of a fact that crossed a service boundary
///
/// # Examples
///
/// ```rust
/// use event_bus::{EventEnvelope, IntegrationEvent};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Debug, Serialize, Deserialize)]
/// struct PaymentSucceeded {
///     payment_id: String,
///     amount: i64,
/// }
///
/// impl IntegrationEvent for PaymentSucceeded {
///     const EVENT_TYPE: &'static str = "payments.payment_succeeded";
/// }
///
/// let envelope = EventEnvelope::new(
///     "payments",
///     PaymentSucceeded { payment_id: "pay_123".to_string(), amount: 1000 },
/// )
/// .with_correlation_id(Some("correlation-456".to_string()));
///
/// assert_eq!(envelope.event_type(), "payments.payment_succeeded");
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope<T> {
    event_id: Uuid,
    event_type: String,
    occurred_at: DateTime<Utc>,
    source_module: String,
    source_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    causation_id: Option<String>,
    payload: T,
}

impl<T: IntegrationEvent> EventEnvelope<T> {
    /// Create a new envelope with a fresh event_id and the current time
    pub fn new(source_module: impl Into<String>, payload: T) -> Self {
        Self::with_event_id(Uuid::new_v4(), source_module, payload)
    }

    /// Create an envelope with an explicit event_id
    ///
    /// Used when the id was allocated earlier (outbox rows, tests).
    pub fn with_event_id(event_id: Uuid, source_module: impl Into<String>, payload: T) -> Self {
        Self::from_parts(event_id, T::EVENT_TYPE, source_module, payload)
    }
}

impl<T> EventEnvelope<T> {
    /// Build an envelope whose event type is not tied to a Rust type
    pub fn from_parts(
        event_id: Uuid,
        event_type: impl Into<String>,
        source_module: impl Into<String>,
        payload: T,
    ) -> Self {
        Self {
            event_id,
            event_type: event_type.into(),
            occurred_at: Utc::now(),
            source_module: source_module.into(),
            source_version: "1.0.0".to_string(),
            correlation_id: None,
            causation_id: None,
            payload,
        }
    }

    /// Set the source version (callers pass `env!("CARGO_PKG_VERSION")`)
    pub fn with_source_version(mut self, version: impl Into<String>) -> Self {
        self.source_version = version.into();
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: Option<String>) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    pub fn with_causation_id(mut self, causation_id: Option<String>) -> Self {
        self.causation_id = causation_id;
        self
    }

    pub fn event_id(&self) -> Uuid {
        self.event_id
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }

    pub fn source_module(&self) -> &str {
        &self.source_module
    }

    pub fn source_version(&self) -> &str {
        &self.source_version
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    pub fn causation_id(&self) -> Option<&str> {
        self.causation_id.as_deref()
    }

    pub fn payload(&self) -> &T {
        &self.payload
    }

    pub fn into_payload(self) -> T {
        self.payload
    }
}

impl EventEnvelope<serde_json::Value> {
    /// Decode the payload into a concrete event type, keeping the metadata
    pub fn into_typed<T: DeserializeOwned>(self) -> Result<EventEnvelope<T>, serde_json::Error> {
        let payload = serde_json::from_value(self.payload)?;
        Ok(EventEnvelope {
            event_id: self.event_id,
            event_type: self.event_type,
            occurred_at: self.occurred_at,
            source_module: self.source_module,
            source_version: self.source_version,
            correlation_id: self.correlation_id,
            causation_id: self.causation_id,
            payload,
        })
    }
}

/// Routing metadata read from a serialized envelope without decoding the payload
#[derive(Debug, Clone, Deserialize)]
pub struct EnvelopeHeader {
    pub event_id: Uuid,
    pub event_type: String,
    #[serde(default)]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub source_module: Option<String>,
}

impl EnvelopeHeader {
    pub fn from_slice(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Validate a serialized envelope (generic payload)
///
/// # Validation Rules
///
/// - `event_id`: Must be a valid UUID
/// - `event_type`: Must be non-empty
/// - `occurred_at`: Must be present
/// - `source_module`: Must be non-empty
/// - `source_version`: Must be non-empty
/// - `payload`: Must be present (may be `null` only if explicitly sent)
pub fn validate_envelope_fields(envelope: &serde_json::Value) -> Result<(), String> {
    let event_id = envelope
        .get("event_id")
        .and_then(|v| v.as_str())
        .ok_or("Missing or invalid event_id")?;

    Uuid::parse_str(event_id).map_err(|e| format!("event_id is not a UUID: {e}"))?;

    envelope
        .get("occurred_at")
        .and_then(|v| v.as_str())
        .ok_or("Missing or invalid occurred_at")?;

    for field in ["event_type", "source_module", "source_version"] {
        let value = envelope
            .get(field)
            .and_then(|v| v.as_str())
            .ok_or_else(|| format!("Missing or invalid {field}"))?;

        if value.is_empty() {
            return Err(format!("{field} cannot be empty"));
        }
    }

    if envelope.get("payload").is_none() {
        return Err("Missing payload".to_string());
    }

    // correlation_id and causation_id are optional
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct OrderPlaced {
        order_id: i64,
    }

    impl IntegrationEvent for OrderPlaced {
        const EVENT_TYPE: &'static str = "orders.order_placed";
    }

    #[test]
    fn test_envelope_creation() {
        let envelope = EventEnvelope::new("orders", OrderPlaced { order_id: 42 });

        assert_eq!(envelope.event_type(), "orders.order_placed");
        assert_eq!(envelope.source_module(), "orders");
        assert_eq!(envelope.payload().order_id, 42);
        assert!(envelope.correlation_id().is_none());
        assert!(envelope.causation_id().is_none());
    }

    #[test]
    fn test_fresh_ids_are_distinct() {
        let a = EventEnvelope::new("orders", OrderPlaced { order_id: 1 });
        let b = EventEnvelope::new("orders", OrderPlaced { order_id: 1 });
        assert_ne!(a.event_id(), b.event_id());
    }

    #[test]
    fn test_envelope_with_builder() {
        let envelope = EventEnvelope::new("orders", OrderPlaced { order_id: 1 })
            .with_source_version("1.2.3")
            .with_correlation_id(Some("corr-456".to_string()))
            .with_causation_id(Some("cause-789".to_string()));

        assert_eq!(envelope.source_version(), "1.2.3");
        assert_eq!(envelope.correlation_id(), Some("corr-456"));
        assert_eq!(envelope.causation_id(), Some("cause-789"));
    }

    #[test]
    fn test_serialized_envelope_passes_validation() {
        let envelope = EventEnvelope::new("orders", OrderPlaced { order_id: 7 });
        let value = serde_json::to_value(&envelope).unwrap();

        assert!(validate_envelope_fields(&value).is_ok());
        assert!(value.get("correlation_id").is_none());
    }

    #[test]
    fn test_header_peek_ignores_payload() {
        let envelope = EventEnvelope::new("orders", OrderPlaced { order_id: 7 })
            .with_correlation_id(Some("corr-1".to_string()));
        let bytes = serde_json::to_vec(&envelope).unwrap();

        let header = EnvelopeHeader::from_slice(&bytes).unwrap();
        assert_eq!(header.event_id, envelope.event_id());
        assert_eq!(header.event_type, "orders.order_placed");
        assert_eq!(header.correlation_id.as_deref(), Some("corr-1"));
    }

    #[test]
    fn test_into_typed_keeps_metadata() {
        let envelope = EventEnvelope::new("orders", OrderPlaced { order_id: 9 });
        let bytes = serde_json::to_vec(&envelope).unwrap();

        let erased: EventEnvelope<serde_json::Value> = serde_json::from_slice(&bytes).unwrap();
        let typed: EventEnvelope<OrderPlaced> = erased.into_typed().unwrap();

        assert_eq!(typed, envelope);
    }

    #[test]
    fn test_validate_envelope_fields_missing_event_type() {
        let envelope = json!({
            "event_id": "550e8400-e29b-41d4-a716-446655440000",
            "occurred_at": "2024-01-01T00:00:00Z",
            "source_module": "payments",
            "source_version": "1.0.0",
            "payload": {}
        });

        assert!(validate_envelope_fields(&envelope).is_err());
    }

    #[test]
    fn test_validate_envelope_fields_bad_uuid() {
        let envelope = json!({
            "event_id": "not-a-uuid",
            "event_type": "payments.payment_succeeded",
            "occurred_at": "2024-01-01T00:00:00Z",
            "source_module": "payments",
            "source_version": "1.0.0",
            "payload": {}
        });

        assert!(validate_envelope_fields(&envelope).is_err());
    }

    #[test]
    fn test_validate_envelope_fields_empty_source_version() {
        let envelope = json!({
            "event_id": "550e8400-e29b-41d4-a716-446655440000",
            "event_type": "payments.payment_succeeded",
            "occurred_at": "2024-01-01T00:00:00Z",
            "source_module": "payments",
            "source_version": "",
            "payload": {}
        });

        assert!(validate_envelope_fields(&envelope).is_err());
    }
}
