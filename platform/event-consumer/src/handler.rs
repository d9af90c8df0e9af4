//! Handler traits
//!
//! The dispatcher only knows [`EventHandler`], which sees the envelope with a
//! raw JSON payload. Typed handlers implement [`IntegrationEventHandler`] and
//! are wrapped in [`Typed`], which decodes the payload before calling them.

use async_trait::async_trait;
use event_bus::{EventEnvelope, IntegrationEvent};
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;

/// An envelope as delivered, payload still undecoded
pub type ReceivedEvent = EventEnvelope<serde_json::Value>;

/// How a handler failed, which decides between redelivery and the DLQ
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandlerError {
    /// Worth another attempt (database timeout, downstream 503, ...)
    #[error("retriable: {0}")]
    Retriable(String),

    /// Will fail the same way on every attempt (invalid payload, broken invariant)
    #[error("permanent: {0}")]
    Permanent(String),
}

impl HandlerError {
    pub fn retriable(err: impl fmt::Display) -> Self {
        HandlerError::Retriable(err.to_string())
    }

    pub fn permanent(err: impl fmt::Display) -> Self {
        HandlerError::Permanent(err.to_string())
    }

    pub fn is_retriable(&self) -> bool {
        matches!(self, HandlerError::Retriable(_))
    }
}

/// Type-erased handler as stored in the registry
///
/// Handlers must be idempotent: the same event can reach them more than once
/// under redelivery.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Identity of the handler. Registering a second handler with the same
    /// name for the same event type is a no-op.
    fn name(&self) -> &str;

    async fn handle(&self, event: &ReceivedEvent) -> Result<(), HandlerError>;
}

/// Handler bound to one concrete event type
#[async_trait]
pub trait IntegrationEventHandler<T: IntegrationEvent>: Send + Sync {
    fn name(&self) -> &str;

    async fn handle(&self, event: EventEnvelope<T>) -> Result<(), HandlerError>;
}

/// Adapts an [`IntegrationEventHandler`] to [`EventHandler`]
///
/// A payload that does not decode as `T` is a permanent failure.
pub struct Typed<T, H> {
    handler: H,
    _event: PhantomData<fn() -> T>,
}

impl<T, H> Typed<T, H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            _event: PhantomData,
        }
    }
}

#[async_trait]
impl<T, H> EventHandler for Typed<T, H>
where
    T: IntegrationEvent,
    H: IntegrationEventHandler<T>,
{
    fn name(&self) -> &str {
        self.handler.name()
    }

    async fn handle(&self, event: &ReceivedEvent) -> Result<(), HandlerError> {
        let typed = event.clone().into_typed::<T>().map_err(|e| {
            HandlerError::Permanent(format!("payload is not a valid {}: {}", T::EVENT_TYPE, e))
        })?;

        self.handler.handle(typed).await
    }
}

/// Handler built from a name and an async closure
pub struct FnHandler<F> {
    name: String,
    func: F,
}

impl<F, Fut> FnHandler<F>
where
    F: Fn(ReceivedEvent) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self {
            name: name.into(),
            func,
        }
    }
}

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(ReceivedEvent) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, event: &ReceivedEvent) -> Result<(), HandlerError> {
        (self.func)(event.clone()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct OrderPlaced {
        order_id: i64,
    }

    impl IntegrationEvent for OrderPlaced {
        const EVENT_TYPE: &'static str = "orders.order_placed";
    }

    struct RecordOrders {
        seen: Arc<Mutex<Vec<i64>>>,
    }

    #[async_trait]
    impl IntegrationEventHandler<OrderPlaced> for RecordOrders {
        fn name(&self) -> &str {
            "record_orders"
        }

        async fn handle(&self, event: EventEnvelope<OrderPlaced>) -> Result<(), HandlerError> {
            self.seen.lock().unwrap().push(event.payload().order_id);
            Ok(())
        }
    }

    fn received(payload: serde_json::Value) -> ReceivedEvent {
        EventEnvelope::from_parts(
            uuid::Uuid::new_v4(),
            OrderPlaced::EVENT_TYPE.to_string(),
            "orders",
            payload,
        )
    }

    #[tokio::test]
    async fn test_typed_handler_receives_decoded_payload() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let handler = Typed::new(RecordOrders { seen: seen.clone() });

        handler
            .handle(&received(serde_json::json!({"order_id": 42})))
            .await
            .unwrap();

        assert_eq!(handler.name(), "record_orders");
        assert_eq!(*seen.lock().unwrap(), vec![42]);
    }

    #[tokio::test]
    async fn test_typed_handler_rejects_wrong_shape_permanently() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let handler = Typed::new(RecordOrders { seen: seen.clone() });

        let err = handler
            .handle(&received(serde_json::json!({"order_id": "not-a-number"})))
            .await
            .unwrap_err();

        assert!(!err.is_retriable());
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_fn_handler() {
        let handler = FnHandler::new("always_busy", |_event| async {
            Err(HandlerError::retriable("downstream busy"))
        });

        let err = handler
            .handle(&received(serde_json::json!({"order_id": 1})))
            .await
            .unwrap_err();

        assert_eq!(handler.name(), "always_busy");
        assert_eq!(err, HandlerError::Retriable("downstream busy".to_string()));
    }
}
