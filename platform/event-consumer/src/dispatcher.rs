//! Consumer-side delivery loop
//!
//! For every delivery the dispatcher:
//! 1. reads `event_id` / `event_type` from the envelope header
//! 2. acks without handling when this consumer already processed the id
//! 3. acks and ignores types nobody subscribed to
//! 4. runs the registered handlers in registration order
//! 5. on failure naks for redelivery with backoff, or dead-letters and
//!    terminates once the failure is permanent or attempts are exhausted
//! 6. on success records the id as processed and acks
//!
//! A failure never escapes one delivery: a panicking handler counts as a
//! retriable failure, and the loop keeps serving other events.

use crate::config::ConsumerConfig;
use crate::dedup::ProcessedStore;
use crate::handler::{HandlerError, ReceivedEvent};
use crate::registry::SubscriptionRegistry;
use event_bus::consumer_retry::{retry_with_backoff, RetryConfig};
use event_bus::{
    BusMetrics, BusResult, DeadLetter, DeadLetterReason, DeadLetterSink, Delivery,
    EnvelopeHeader, EventBus,
};
use futures::stream::BoxStream;
use futures::{FutureExt, StreamExt};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tracing::Instrument;

/// What happened to one delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// All handlers succeeded; the delivery was acked
    Handled,
    /// Already processed by this consumer; acked without handling
    Duplicate,
    /// No handler for the type; acked
    Ignored,
    /// Handed back to the transport for another attempt
    Retrying { attempt: u32 },
    /// Parked on the dead-letter path and terminated
    DeadLettered(DeadLetterReason),
}

impl DispatchOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            DispatchOutcome::Handled => "handled",
            DispatchOutcome::Duplicate => "duplicate",
            DispatchOutcome::Ignored => "ignored",
            DispatchOutcome::Retrying { .. } => "retrying",
            DispatchOutcome::DeadLettered(_) => "dead_lettered",
        }
    }
}

/// Retry policy for writing one dead letter
const DLQ_WRITE_RETRY: RetryConfig = RetryConfig {
    max_attempts: 3,
    initial_backoff: Duration::from_millis(50),
    max_backoff: Duration::from_millis(500),
};

#[derive(Clone)]
pub struct Dispatcher {
    consumer: String,
    registry: Arc<SubscriptionRegistry>,
    processed: Arc<dyn ProcessedStore>,
    dead_letters: Arc<dyn DeadLetterSink>,
    retry: RetryConfig,
    max_in_flight: usize,
    metrics: Option<BusMetrics>,
}

impl Dispatcher {
    /// The registry is frozen from here on; register every handler first
    pub fn new(
        consumer: impl Into<String>,
        registry: SubscriptionRegistry,
        processed: Arc<dyn ProcessedStore>,
        dead_letters: Arc<dyn DeadLetterSink>,
    ) -> Self {
        Self {
            consumer: consumer.into(),
            registry: Arc::new(registry),
            processed,
            dead_letters,
            retry: RetryConfig::default(),
            max_in_flight: 16,
            metrics: None,
        }
    }

    pub fn from_config(
        cfg: &ConsumerConfig,
        registry: SubscriptionRegistry,
        processed: Arc<dyn ProcessedStore>,
        dead_letters: Arc<dyn DeadLetterSink>,
    ) -> Self {
        Self::new(cfg.name.clone(), registry, processed, dead_letters)
            .with_retry(cfg.retry.clone())
            .with_max_in_flight(cfg.max_in_flight)
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_max_in_flight(mut self, max_in_flight: usize) -> Self {
        self.max_in_flight = max_in_flight.max(1);
        self
    }

    pub fn with_metrics(mut self, metrics: BusMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn consumer(&self) -> &str {
        &self.consumer
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    /// Open the consumer group on `bus` and run [`Self::run`] in a task
    pub async fn start(
        &self,
        bus: &dyn EventBus,
        subject: &str,
        shutdown: watch::Receiver<bool>,
    ) -> BusResult<JoinHandle<()>> {
        let deliveries = bus.consume(subject, &self.consumer).await?;
        tracing::info!(
            consumer = %self.consumer,
            subject,
            event_types = self.registry.event_types().count(),
            "Consumer started"
        );

        let dispatcher = self.clone();
        Ok(tokio::spawn(async move {
            dispatcher.run(deliveries, shutdown).await
        }))
    }

    /// Dispatch deliveries until the stream ends or `shutdown` flips to `true`
    ///
    /// At most `max_in_flight` deliveries are handled at once. On shutdown no
    /// new delivery is pulled and the ones in flight are awaited before
    /// returning.
    pub async fn run(
        &self,
        mut deliveries: BoxStream<'static, Delivery>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let permits = Arc::new(Semaphore::new(self.max_in_flight));
        let mut in_flight = JoinSet::new();

        loop {
            tokio::select! {
                biased;

                _ = shutdown_requested(&mut shutdown) => {
                    tracing::info!(
                        consumer = %self.consumer,
                        "Shutdown requested, no longer pulling deliveries"
                    );
                    break;
                }
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    log_join_error(joined);
                }
                next = next_delivery(&permits, &mut deliveries) => {
                    let Some((permit, delivery)) = next else {
                        tracing::info!(consumer = %self.consumer, "Delivery stream ended");
                        break;
                    };

                    let dispatcher = self.clone();
                    in_flight.spawn(async move {
                        let _permit = permit;
                        dispatcher.dispatch(delivery).await
                    });
                }
            }
        }

        if !in_flight.is_empty() {
            tracing::info!(
                consumer = %self.consumer,
                in_flight = in_flight.len(),
                "Draining in-flight deliveries"
            );
        }
        while let Some(joined) = in_flight.join_next().await {
            log_join_error(joined);
        }

        tracing::info!(consumer = %self.consumer, "Consumer stopped");
    }

    /// Handle one delivery and settle it
    pub async fn dispatch(&self, delivery: Delivery) -> DispatchOutcome {
        let started = Instant::now();

        let header = match EnvelopeHeader::from_slice(delivery.payload()) {
            Ok(header) => header,
            Err(e) => {
                let span = tracing::info_span!(
                    "dispatch_event",
                    consumer = %self.consumer,
                    subject = %delivery.subject(),
                    attempt = delivery.attempt,
                );
                let outcome = self
                    .dead_letter(
                        delivery,
                        None,
                        DeadLetterReason::Undecodable,
                        format!("invalid envelope: {e}"),
                    )
                    .instrument(span)
                    .await;
                self.record(None, outcome, started);
                return outcome;
            }
        };

        let span = tracing::info_span!(
            "dispatch_event",
            consumer = %self.consumer,
            event_id = %header.event_id,
            event_type = %header.event_type,
            subject = %delivery.subject(),
            attempt = delivery.attempt,
            correlation_id = header.correlation_id.as_deref().unwrap_or(""),
        );

        let outcome = self.process(delivery, &header).instrument(span).await;
        self.record(Some(&header.event_type), outcome, started);
        outcome
    }

    async fn process(&self, delivery: Delivery, header: &EnvelopeHeader) -> DispatchOutcome {
        let attempt = delivery.attempt;

        match self.processed.is_processed(header.event_id).await {
            Ok(true) => {
                tracing::info!("Duplicate event, acknowledging without handling");
                settle(delivery.ack().await, "ack");
                return DispatchOutcome::Duplicate;
            }
            Ok(false) => {}
            Err(e) => {
                // Without the dedup answer handling could repeat; let the transport retry
                tracing::warn!(error = %e, "Dedup lookup failed, requesting redelivery");
                settle(delivery.nak(self.retry.backoff_for_attempt(attempt)).await, "nak");
                return DispatchOutcome::Retrying { attempt };
            }
        }

        let handlers = self.registry.resolve(&header.event_type);
        if handlers.is_empty() {
            tracing::debug!("No handlers registered for event type, ignoring");
            settle(delivery.ack().await, "ack");
            return DispatchOutcome::Ignored;
        }

        let event: ReceivedEvent = match serde_json::from_slice(delivery.payload()) {
            Ok(event) => event,
            Err(e) => {
                return self
                    .dead_letter(
                        delivery,
                        Some(header),
                        DeadLetterReason::Undecodable,
                        format!("invalid envelope: {e}"),
                    )
                    .await;
            }
        };

        let mut failure = None;
        for handler in handlers {
            let result = AssertUnwindSafe(handler.handle(&event))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| Err(HandlerError::Retriable("handler panicked".to_string())));

            if let Err(e) = result {
                tracing::warn!(handler = handler.name(), error = %e, "Handler failed");
                failure = Some((handler.name().to_string(), e));
                break;
            }
        }

        match failure {
            None => {
                if let Err(e) = self
                    .processed
                    .mark_processed(header.event_id, &header.event_type)
                    .await
                {
                    // Handlers are idempotent; a missed record only costs a re-run on redelivery
                    tracing::warn!(error = %e, "Failed to record processed event");
                }
                settle(delivery.ack().await, "ack");
                tracing::debug!(handlers = handlers.len(), "Event handled");
                DispatchOutcome::Handled
            }
            Some((handler, HandlerError::Permanent(msg))) => {
                self.dead_letter(
                    delivery,
                    Some(header),
                    DeadLetterReason::PermanentFailure,
                    format!("{handler}: {msg}"),
                )
                .await
            }
            Some((handler, HandlerError::Retriable(msg))) if self.retry.is_exhausted(attempt) => {
                self.dead_letter(
                    delivery,
                    Some(header),
                    DeadLetterReason::RetriesExhausted,
                    format!("{handler}: {msg}"),
                )
                .await
            }
            Some((_, HandlerError::Retriable(_))) => {
                let delay = self.retry.backoff_for_attempt(attempt);
                tracing::info!(
                    max_attempts = self.retry.max_attempts,
                    backoff_ms = delay.as_millis() as u64,
                    "Requesting redelivery"
                );
                settle(delivery.nak(delay).await, "nak");
                DispatchOutcome::Retrying { attempt }
            }
        }
    }

    async fn dead_letter(
        &self,
        delivery: Delivery,
        header: Option<&EnvelopeHeader>,
        reason: DeadLetterReason,
        error: String,
    ) -> DispatchOutcome {
        let attempt = delivery.attempt;
        let mut letter =
            DeadLetter::from_message(&delivery.message, &self.consumer, reason, error, attempt);
        if let Some(header) = header {
            letter = letter.with_event(header.event_id, header.event_type.clone());
        }

        let written = retry_with_backoff(
            || self.dead_letters.dead_letter(&letter),
            &DLQ_WRITE_RETRY,
            "dead_letter_write",
        )
        .await;

        match written {
            Ok(()) => {
                settle(delivery.term().await, "term");
                DispatchOutcome::DeadLettered(reason)
            }
            Err(e) => {
                tracing::error!(
                    reason = reason.as_str(),
                    error = %e,
                    "Failed to write dead letter, leaving event on the live path"
                );
                settle(delivery.nak(self.retry.max_backoff).await, "nak");
                DispatchOutcome::Retrying { attempt }
            }
        }
    }

    fn record(&self, event_type: Option<&str>, outcome: DispatchOutcome, started: Instant) {
        if let Some(metrics) = &self.metrics {
            let event_type = event_type.unwrap_or("unknown");
            metrics
                .delivery_total
                .with_label_values(&[event_type, outcome.as_str()])
                .inc();
            metrics
                .delivery_duration_seconds
                .with_label_values(&[event_type])
                .observe(started.elapsed().as_secs_f64());
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("consumer", &self.consumer)
            .field("registry", &self.registry)
            .field("retry", &self.retry)
            .field("max_in_flight", &self.max_in_flight)
            .finish_non_exhaustive()
    }
}

/// A settle failure means the transport redelivers; dedup absorbs the repeat
fn settle(result: BusResult<()>, action: &str) {
    if let Err(e) = result {
        tracing::warn!(action, error = %e, "Failed to settle delivery");
    }
}

fn log_join_error(joined: Result<DispatchOutcome, JoinError>) {
    if let Err(e) = joined {
        tracing::error!(error = %e, "Dispatch task panicked");
    }
}

async fn next_delivery(
    permits: &Arc<Semaphore>,
    deliveries: &mut BoxStream<'static, Delivery>,
) -> Option<(tokio::sync::OwnedSemaphorePermit, Delivery)> {
    let permit = permits.clone().acquire_owned().await.ok()?;
    let delivery = deliveries.next().await?;
    Some((permit, delivery))
}

async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            // Sender gone without signalling: run until the stream ends
            std::future::pending::<()>().await;
        }
    }
}
