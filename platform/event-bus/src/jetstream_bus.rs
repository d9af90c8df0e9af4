//! JetStream implementation of the EventBus trait
//!
//! The production transport. `publish` resolves only after the server has
//! stored the message and answered with a `PubAck`, which is where the
//! at-least-once guarantee starts. Deliveries come from durable pull
//! consumers with explicit acks, so redelivery survives consumer restarts.

use crate::nats_bus::{to_bus_message, to_nats_headers};
use crate::{validate_subject, Acker, BusError, BusMessage, BusResult, Delivery, EventBus};
use async_nats::jetstream::consumer::{pull, AckPolicy, DeliverPolicy};
use async_nats::jetstream::stream::Config as StreamConfig;
use async_nats::jetstream::{self, AckKind, Context};
use async_nats::Client;
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use std::time::Duration;

/// Stream layout for integration events and their dead letters
#[derive(Debug, Clone)]
pub struct StreamSettings {
    pub events_stream: String,
    pub events_subjects: Vec<String>,
    pub events_max_age: Duration,
    pub dlq_stream: String,
    pub dlq_subjects: Vec<String>,
    pub dlq_max_age: Duration,
    /// Window in which a repeated `Nats-Msg-Id` is dropped by the server
    pub duplicate_window: Duration,
    /// How long a delivery may stay unsettled before the server redelivers it
    pub ack_wait: Duration,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            events_stream: "EVENTS".to_string(),
            events_subjects: vec!["events.>".to_string()],
            events_max_age: Duration::from_secs(60 * 60 * 24 * 14), // 14 days
            dlq_stream: "EVENTS_DLQ".to_string(),
            dlq_subjects: vec!["dlq.>".to_string()],
            dlq_max_age: Duration::from_secs(60 * 60 * 24 * 30), // 30 days
            duplicate_window: Duration::from_secs(120),
            ack_wait: Duration::from_secs(30),
        }
    }
}

/// Create the events and DLQ streams if they do not exist yet
pub async fn ensure_streams(context: &Context, settings: &StreamSettings) -> BusResult<()> {
    let events_cfg = StreamConfig {
        name: settings.events_stream.clone(),
        subjects: settings.events_subjects.clone(),
        max_age: settings.events_max_age,
        duplicate_window: settings.duplicate_window,
        ..Default::default()
    };

    if context.get_stream(&settings.events_stream).await.is_err() {
        context
            .create_stream(events_cfg)
            .await
            .map_err(|e| BusError::ConnectionError(e.to_string()))?;
        tracing::info!(stream = %settings.events_stream, "Created JetStream events stream");
    }

    let dlq_cfg = StreamConfig {
        name: settings.dlq_stream.clone(),
        subjects: settings.dlq_subjects.clone(),
        max_age: settings.dlq_max_age,
        ..Default::default()
    };

    if context.get_stream(&settings.dlq_stream).await.is_err() {
        context
            .create_stream(dlq_cfg)
            .await
            .map_err(|e| BusError::ConnectionError(e.to_string()))?;
        tracing::info!(stream = %settings.dlq_stream, "Created JetStream DLQ stream");
    }

    Ok(())
}

/// EventBus implementation using NATS JetStream
///
/// # Example
/// ```rust,no_run
/// use event_bus::{EventBus, JetStreamBus, StreamSettings};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let nats_client = async_nats::connect("nats://localhost:4222").await?;
/// let bus = JetStreamBus::new(nats_client, StreamSettings::default());
/// bus.ensure_streams().await?;
///
/// bus.publish("events.orders.order_placed", b"{}".to_vec()).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct JetStreamBus {
    client: Client,
    context: Context,
    settings: StreamSettings,
}

impl JetStreamBus {
    pub fn new(client: Client, settings: StreamSettings) -> Self {
        let context = jetstream::new(client.clone());
        Self {
            client,
            context,
            settings,
        }
    }

    pub async fn ensure_streams(&self) -> BusResult<()> {
        ensure_streams(&self.context, &self.settings).await
    }

    pub fn context(&self) -> &Context {
        &self.context
    }
}

#[async_trait]
impl EventBus for JetStreamBus {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> BusResult<()> {
        self.publish_message(BusMessage::new(subject.to_string(), payload))
            .await
    }

    async fn publish_message(&self, msg: BusMessage) -> BusResult<()> {
        validate_subject(&msg.subject, false)?;

        let headers = msg.headers.as_ref().map(to_nats_headers).unwrap_or_default();

        // First await: the request is written. Second await: the server's PubAck.
        // Dropping either leaves the message either fully stored or absent.
        let ack = self
            .context
            .publish_with_headers(msg.subject.clone(), headers, msg.payload.into())
            .await
            .map_err(|e| BusError::PublishError(e.to_string()))?
            .await
            .map_err(|e| BusError::PublishError(e.to_string()))?;

        if ack.duplicate {
            tracing::debug!(
                subject = %msg.subject,
                stream = %ack.stream,
                sequence = ack.sequence,
                "JetStream suppressed duplicate publish"
            );
        }

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

        let stream = self
            .context
            .get_stream(&self.settings.events_stream)
            .await
            .map_err(|e| BusError::SubscribeError(e.to_string()))?;

        let consumer = stream
            .get_or_create_consumer(
                group,
                pull::Config {
                    durable_name: Some(group.to_string()),
                    filter_subject: subject.to_string(),
                    ack_policy: AckPolicy::Explicit,
                    deliver_policy: DeliverPolicy::New,
                    ack_wait: self.settings.ack_wait,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| BusError::SubscribeError(e.to_string()))?;

        let messages = consumer
            .messages()
            .await
            .map_err(|e| BusError::SubscribeError(e.to_string()))?;

        let deliveries = messages.filter_map(|result| async move {
            match result {
                Ok(message) => {
                    let attempt = message
                        .info()
                        .map(|info| info.delivered.max(1) as u32)
                        .unwrap_or(1);
                    let bus_msg = to_bus_message(message.message.clone());
                    Some(Delivery::new(bus_msg, attempt, JetStreamAcker { message }))
                }
                Err(e) => {
                    tracing::warn!(error = %e, "JetStream pull consumer error");
                    None
                }
            }
        });

        Ok(deliveries.boxed())
    }
}

struct JetStreamAcker {
    message: jetstream::Message,
}

#[async_trait]
impl Acker for JetStreamAcker {
    async fn ack(&self) -> BusResult<()> {
        self.message
            .ack()
            .await
            .map_err(|e| BusError::AckError(e.to_string()))
    }

    async fn nak(&self, delay: Duration) -> BusResult<()> {
        self.message
            .ack_with(AckKind::Nak(Some(delay)))
            .await
            .map_err(|e| BusError::AckError(e.to_string()))
    }

    async fn term(&self) -> BusResult<()> {
        self.message
            .ack_with(AckKind::Term)
            .await
            .map_err(|e| BusError::AckError(e.to_string()))
    }
}
