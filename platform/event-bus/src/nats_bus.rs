//! Core NATS implementation of the EventBus trait

use crate::{
    validate_subject, Acker, BusError, BusMessage, BusResult, Delivery, EventBus, ATTEMPT_HEADER,
};
use async_nats::Client;
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::HashMap;
use std::time::Duration;

/// Subject prefix for group-private redeliveries (`_retry.<group>.<subject>`)
const RETRY_PREFIX: &str = "_retry";

/// EventBus implementation using core NATS
///
/// Core NATS keeps nothing: `publish` flushes to the server, but a consumer
/// that is offline misses the message. `consume` maps groups onto queue
/// groups; `nak` republishes on a group-private retry subject so only the
/// failing group sees the redelivery. Use [`crate::JetStreamBus`] when the
/// at-least-once guarantee must survive restarts.
///
/// # Example
/// ```rust,no_run
/// use event_bus::{EventBus, NatsBus};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let nats_client = async_nats::connect("nats://localhost:4222").await?;
/// let bus = NatsBus::new(nats_client);
///
/// bus.publish("my.subject", b"hello".to_vec()).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct NatsBus {
    client: Client,
}

impl NatsBus {
    /// Create a new NatsBus from an existing NATS client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Get a reference to the underlying NATS client
    pub fn client(&self) -> &Client {
        &self.client
    }
}

pub(crate) fn to_nats_headers(headers: &HashMap<String, String>) -> async_nats::HeaderMap {
    let mut map = async_nats::HeaderMap::new();
    for (key, value) in headers {
        map.insert(key.as_str(), value.as_str());
    }
    map
}

pub(crate) fn from_nats_headers(headers: &async_nats::HeaderMap) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for (key, values) in headers.iter() {
        // Take the first value for each header
        if let Some(value) = values.first() {
            map.insert(key.to_string(), value.to_string());
        }
    }
    map
}

pub(crate) fn to_bus_message(nats_msg: async_nats::Message) -> BusMessage {
    let mut msg = BusMessage::new(nats_msg.subject.to_string(), nats_msg.payload.to_vec());

    if let Some(reply) = nats_msg.reply {
        msg = msg.with_reply_to(reply.to_string());
    }

    if let Some(nats_headers) = nats_msg.headers {
        let headers = from_nats_headers(&nats_headers);
        if !headers.is_empty() {
            msg = msg.with_headers(headers);
        }
    }

    msg
}

fn attempt_of(msg: &BusMessage) -> u32 {
    msg.header(ATTEMPT_HEADER)
        .and_then(|v| v.parse().ok())
        .unwrap_or(1)
}

#[async_trait]
impl EventBus for NatsBus {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> BusResult<()> {
        self.publish_message(BusMessage::new(subject.to_string(), payload))
            .await
    }

    async fn publish_message(&self, msg: BusMessage) -> BusResult<()> {
        validate_subject(&msg.subject, false)?;

        match &msg.headers {
            Some(headers) => self
                .client
                .publish_with_headers(
                    msg.subject.clone(),
                    to_nats_headers(headers),
                    msg.payload.into(),
                )
                .await
                .map_err(|e| BusError::PublishError(e.to_string()))?,
            None => self
                .client
                .publish(msg.subject.clone(), msg.payload.into())
                .await
                .map_err(|e| BusError::PublishError(e.to_string()))?,
        }

        // publish() only buffers locally
        self.client
            .flush()
            .await
            .map_err(|e| BusError::ConnectionError(e.to_string()))?;

        Ok(())
    }

    async fn subscribe(&self, subject: &str) -> BusResult<BoxStream<'static, BusMessage>> {
        validate_subject(subject, true)?;

        let subscriber = self
            .client
            .subscribe(subject.to_string())
            .await
            .map_err(|e| BusError::SubscribeError(e.to_string()))?;

        Ok(subscriber.map(to_bus_message).boxed())
    }

    async fn consume(
        &self,
        subject: &str,
        group: &str,
    ) -> BusResult<BoxStream<'static, Delivery>> {
        validate_subject(subject, true)?;
        if group.is_empty() || group.contains('.') {
            return Err(BusError::SubscribeError(format!(
                "group name must be a single subject token: {group}"
            )));
        }

        let live = self
            .client
            .queue_subscribe(subject.to_string(), group.to_string())
            .await
            .map_err(|e| BusError::SubscribeError(e.to_string()))?;

        let retry_prefix = format!("{RETRY_PREFIX}.{group}.");
        let retries = self
            .client
            .queue_subscribe(format!("{retry_prefix}>"), group.to_string())
            .await
            .map_err(|e| BusError::SubscribeError(e.to_string()))?;

        let live = live.map(to_bus_message);
        let strip = retry_prefix.clone();
        let retries = retries.map(move |nats_msg| {
            let mut msg = to_bus_message(nats_msg);
            if let Some(original) = msg.subject.strip_prefix(&strip) {
                msg.subject = original.to_string();
            }
            msg
        });

        let client = self.client.clone();
        let deliveries = stream::select(live, retries).map(move |msg| {
            let attempt = attempt_of(&msg);
            let acker = CoreNatsAcker {
                client: client.clone(),
                retry_subject: format!("{retry_prefix}{}", msg.subject),
                message: msg.clone(),
                attempt,
            };
            Delivery::new(msg, attempt, acker)
        });

        Ok(deliveries.boxed())
    }
}

struct CoreNatsAcker {
    client: Client,
    retry_subject: String,
    message: BusMessage,
    attempt: u32,
}

#[async_trait]
impl Acker for CoreNatsAcker {
    async fn ack(&self) -> BusResult<()> {
        Ok(())
    }

    async fn nak(&self, delay: Duration) -> BusResult<()> {
        let mut headers = self.message.headers.clone().unwrap_or_default();
        headers.insert(ATTEMPT_HEADER.to_string(), (self.attempt + 1).to_string());

        let client = self.client.clone();
        let subject = self.retry_subject.clone();
        let payload = self.message.payload.clone();

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = client
                .publish_with_headers(subject.clone(), to_nats_headers(&headers), payload.into())
                .await
            {
                tracing::error!(
                    subject = %subject,
                    error = %e,
                    "Failed to republish nacked message"
                );
            }
        });

        Ok(())
    }

    async fn term(&self) -> BusResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attempt_header_defaults_to_first_delivery() {
        let msg = BusMessage::new("orders.placed".to_string(), vec![]);
        assert_eq!(attempt_of(&msg), 1);

        let msg = msg.with_headers(HashMap::from([(ATTEMPT_HEADER.to_string(), "3".to_string())]));
        assert_eq!(attempt_of(&msg), 3);
    }

    #[test]
    fn test_header_conversion_round_trip() {
        let headers = HashMap::from([("X-Event-Type".to_string(), "orders.placed".to_string())]);
        let back = from_nats_headers(&to_nats_headers(&headers));
        assert_eq!(back, headers);
    }

    // Note: These tests require a running NATS server
    // For CI, use InMemoryBus tests instead
    // For manual testing: docker run -p 4222:4222 nats:2.10-alpine

    #[tokio::test]
    #[ignore] // Requires NATS server
    async fn test_nats_bus_publish_subscribe() {
        let client = async_nats::connect("nats://localhost:4222")
            .await
            .expect("NATS server must be running on localhost:4222");

        let bus = NatsBus::new(client);

        let mut stream = bus.subscribe("test.nats.>").await.unwrap();

        let payload = b"test message".to_vec();
        bus.publish("test.nats.hello", payload.clone())
            .await
            .unwrap();

        let msg = tokio::time::timeout(Duration::from_secs(2), stream.next())
            .await
            .expect("timeout waiting for message")
            .expect("stream ended");

        assert_eq!(msg.subject, "test.nats.hello");
        assert_eq!(msg.payload, payload);
    }

    #[tokio::test]
    #[ignore] // Requires NATS server
    async fn test_nats_bus_nak_redelivers_to_group() {
        let client = async_nats::connect("nats://localhost:4222")
            .await
            .expect("NATS server must be running on localhost:4222");

        let bus = NatsBus::new(client);
        let mut deliveries = bus.consume("test.nak.>", "nak_group").await.unwrap();

        bus.publish("test.nak.hello", b"again".to_vec()).await.unwrap();

        let first = tokio::time::timeout(Duration::from_secs(2), deliveries.next())
            .await
            .expect("timeout")
            .expect("stream ended");
        assert_eq!(first.attempt, 1);
        first.nak(Duration::from_millis(10)).await.unwrap();

        let second = tokio::time::timeout(Duration::from_secs(2), deliveries.next())
            .await
            .expect("timeout")
            .expect("stream ended");
        assert_eq!(second.attempt, 2);
        assert_eq!(second.subject(), "test.nak.hello");
    }
}
