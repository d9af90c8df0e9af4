//! In-memory implementation of the EventBus trait for testing and development

use crate::{
    subject_matches, validate_subject, Acker, BusError, BusMessage, BusResult, Delivery, EventBus,
};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::stream::{BoxStream, StreamExt};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex};

/// Snapshot of settlement counters for every consumer group on the bus
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryStats {
    pub published: u64,
    pub delivered: u64,
    pub acked: u64,
    pub nacked: u64,
    pub terminated: u64,
}

#[derive(Default)]
struct StatsCounters {
    published: AtomicU64,
    delivered: AtomicU64,
    acked: AtomicU64,
    nacked: AtomicU64,
    terminated: AtomicU64,
}

struct QueuedDelivery {
    message: BusMessage,
    attempt: u32,
}

#[derive(Clone)]
struct ConsumerGroup {
    pattern: String,
    sender: mpsc::UnboundedSender<QueuedDelivery>,
    receiver: Arc<Mutex<mpsc::UnboundedReceiver<QueuedDelivery>>>,
}

impl ConsumerGroup {
    fn new(pattern: &str) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            pattern: pattern.to_string(),
            sender,
            receiver: Arc::new(Mutex::new(receiver)),
        }
    }
}

/// EventBus implementation using in-memory channels
///
/// This implementation is suitable for:
/// - Unit tests (no external dependencies)
/// - Local development without Docker
/// - Integration tests that need fast, isolated message buses
///
/// `subscribe` broadcasts to all subscribers via a Tokio broadcast channel.
/// `consume` gives each named group its own unbounded queue; group members
/// compete for messages, and `nak` puts a message back after its delay with
/// the attempt counter bumped. Nothing survives the process.
///
/// # Example
/// ```rust
/// use event_bus::{EventBus, InMemoryBus};
/// use futures::StreamExt;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let bus = InMemoryBus::new();
///
/// // Subscribe before publishing
/// let mut stream = bus.subscribe("test.events.>").await?;
///
/// bus.publish("test.events.created", b"hello".to_vec()).await?;
///
/// let msg = stream.next().await.unwrap();
/// assert_eq!(msg.subject, "test.events.created");
/// assert_eq!(msg.payload, b"hello");
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct InMemoryBus {
    sender: Arc<broadcast::Sender<BusMessage>>,
    groups: Arc<DashMap<String, ConsumerGroup>>,
    stats: Arc<StatsCounters>,
}

impl InMemoryBus {
    /// Create a new in-memory event bus
    ///
    /// The fan-out channel buffers 1000 messages; a subscriber that falls
    /// further behind skips the oldest ones. Consumer groups are unbounded.
    pub fn new() -> Self {
        Self::with_capacity(1000)
    }

    /// Create a new in-memory event bus with a custom fan-out buffer size
    pub fn with_capacity(buffer_size: usize) -> Self {
        let (sender, _) = broadcast::channel(buffer_size);
        Self {
            sender: Arc::new(sender),
            groups: Arc::new(DashMap::new()),
            stats: Arc::new(StatsCounters::default()),
        }
    }

    /// Settlement counters across all consumer groups
    pub fn stats(&self) -> DeliveryStats {
        DeliveryStats {
            published: self.stats.published.load(Ordering::SeqCst),
            delivered: self.stats.delivered.load(Ordering::SeqCst),
            acked: self.stats.acked.load(Ordering::SeqCst),
            nacked: self.stats.nacked.load(Ordering::SeqCst),
            terminated: self.stats.terminated.load(Ordering::SeqCst),
        }
    }
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventBus for InMemoryBus {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> BusResult<()> {
        self.publish_message(BusMessage::new(subject.to_string(), payload))
            .await
    }

    async fn publish_message(&self, msg: BusMessage) -> BusResult<()> {
        validate_subject(&msg.subject, false)?;
        self.stats.published.fetch_add(1, Ordering::SeqCst);

        let targets: Vec<mpsc::UnboundedSender<QueuedDelivery>> = self
            .groups
            .iter()
            .filter(|group| subject_matches(&msg.subject, &group.pattern))
            .map(|group| group.sender.clone())
            .collect();

        for target in targets {
            // The group keeps its own receiver alive, so this cannot fail
            // while the bus exists.
            let _ = target.send(QueuedDelivery {
                message: msg.clone(),
                attempt: 1,
            });
        }

        // No receivers is fine: publishing never depends on subscribers.
        let _ = self.sender.send(msg);

        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> BusResult<BoxStream<'static, BusMessage>> {
        validate_subject(pattern, true)?;
        let mut receiver = self.sender.subscribe();
        let pattern = pattern.to_string();

        let stream = async_stream::stream! {
            loop {
                match receiver.recv().await {
                    Ok(msg) => {
                        if subject_matches(&msg.subject, &pattern) {
                            yield msg;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(
                            skipped,
                            pattern = %pattern,
                            "InMemoryBus subscriber lagged"
                        );
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        break;
                    }
                }
            }
        };

        Ok(stream.boxed())
    }

    async fn consume(
        &self,
        pattern: &str,
        group: &str,
    ) -> BusResult<BoxStream<'static, Delivery>> {
        validate_subject(pattern, true)?;

        let consumer_group = self
            .groups
            .entry(group.to_string())
            .or_insert_with(|| ConsumerGroup::new(pattern))
            .clone();

        if consumer_group.pattern != pattern {
            return Err(BusError::SubscribeError(format!(
                "group {group} is already bound to {}",
                consumer_group.pattern
            )));
        }

        let stats = self.stats.clone();
        let stream = async_stream::stream! {
            loop {
                let next = {
                    let mut receiver = consumer_group.receiver.lock().await;
                    receiver.recv().await
                };
                let Some(queued) = next else { break };

                stats.delivered.fetch_add(1, Ordering::SeqCst);
                let acker = InMemoryAcker {
                    message: queued.message.clone(),
                    attempt: queued.attempt,
                    requeue: consumer_group.sender.clone(),
                    stats: stats.clone(),
                };
                yield Delivery::new(queued.message, queued.attempt, acker);
            }
        };

        Ok(stream.boxed())
    }
}

struct InMemoryAcker {
    message: BusMessage,
    attempt: u32,
    requeue: mpsc::UnboundedSender<QueuedDelivery>,
    stats: Arc<StatsCounters>,
}

#[async_trait]
impl Acker for InMemoryAcker {
    async fn ack(&self) -> BusResult<()> {
        self.stats.acked.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn nak(&self, delay: Duration) -> BusResult<()> {
        self.stats.nacked.fetch_add(1, Ordering::SeqCst);

        let redelivery = QueuedDelivery {
            message: self.message.clone(),
            attempt: self.attempt + 1,
        };
        let requeue = self.requeue.clone();

        if delay.is_zero() {
            requeue
                .send(redelivery)
                .map_err(|_| BusError::AckError("consumer group closed".to_string()))?;
        } else {
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = requeue.send(redelivery);
            });
        }

        Ok(())
    }

    async fn term(&self) -> BusResult<()> {
        self.stats.terminated.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    async fn next_within<T>(stream: &mut BoxStream<'static, T>, ms: u64) -> Option<T> {
        tokio::time::timeout(Duration::from_millis(ms), stream.next())
            .await
            .ok()
            .flatten()
    }

    #[tokio::test]
    async fn test_publish_and_subscribe() {
        let bus = InMemoryBus::new();

        let mut stream = bus.subscribe("test.events.>").await.unwrap();

        let payload = b"test message".to_vec();
        bus.publish("test.events.user.created", payload.clone())
            .await
            .unwrap();

        let msg = next_within(&mut stream, 1000).await.expect("message");

        assert_eq!(msg.subject, "test.events.user.created");
        assert_eq!(msg.payload, payload);
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_succeeds() {
        let bus = InMemoryBus::new();

        bus.publish("orders.order_placed", b"{}".to_vec())
            .await
            .expect("publish with zero subscribers");

        assert_eq!(bus.stats().published, 1);
        assert_eq!(bus.stats().delivered, 0);
    }

    #[tokio::test]
    async fn test_publish_rejects_wildcard_subject() {
        let bus = InMemoryBus::new();

        let err = bus.publish("orders.>", vec![]).await.unwrap_err();
        assert!(matches!(err, BusError::InvalidSubject(_)));
    }

    #[tokio::test]
    async fn test_wildcard_filtering() {
        let bus = InMemoryBus::new();

        let mut stream = bus.subscribe("auth.events.*").await.unwrap();

        bus.publish("auth.events.created", b"match".to_vec())
            .await
            .unwrap();
        bus.publish("auth.events.user.created", b"no match".to_vec())
            .await
            .unwrap();
        bus.publish("billing.events.created", b"no match".to_vec())
            .await
            .unwrap();

        let msg = next_within(&mut stream, 100).await.expect("message");
        assert_eq!(msg.subject, "auth.events.created");

        assert!(next_within(&mut stream, 100).await.is_none());
    }

    #[tokio::test]
    async fn test_multiple_subscribers() {
        let bus = InMemoryBus::new();

        let mut stream1 = bus.subscribe("test.>").await.unwrap();
        let mut stream2 = bus.subscribe("test.>").await.unwrap();

        bus.publish("test.msg", b"broadcast".to_vec()).await.unwrap();

        assert_eq!(next_within(&mut stream1, 1000).await.unwrap().payload, b"broadcast");
        assert_eq!(next_within(&mut stream2, 1000).await.unwrap().payload, b"broadcast");
    }

    #[tokio::test]
    async fn test_group_only_sees_messages_after_it_started() {
        let bus = InMemoryBus::new();

        bus.publish("orders.placed", b"before".to_vec()).await.unwrap();
        let mut deliveries = bus.consume("orders.>", "inventory").await.unwrap();
        bus.publish("orders.placed", b"after".to_vec()).await.unwrap();

        let delivery = next_within(&mut deliveries, 1000).await.expect("delivery");
        assert_eq!(delivery.payload(), b"after");
        assert_eq!(delivery.attempt, 1);
        delivery.ack().await.unwrap();

        assert!(next_within(&mut deliveries, 100).await.is_none());
    }

    #[tokio::test]
    async fn test_competing_consumers_share_one_copy() {
        let bus = InMemoryBus::new();

        let mut member_a = bus.consume("orders.>", "inventory").await.unwrap();
        let mut member_b = bus.consume("orders.>", "inventory").await.unwrap();
        let mut other_group = bus.consume("orders.>", "shipping").await.unwrap();

        bus.publish("orders.placed", b"once".to_vec()).await.unwrap();

        let first = next_within(&mut member_a, 200).await;
        let second = next_within(&mut member_b, 200).await;
        assert_eq!(
            first.is_some() as u8 + second.is_some() as u8,
            1,
            "exactly one group member receives the message"
        );

        assert!(next_within(&mut other_group, 1000).await.is_some());
    }

    #[tokio::test]
    async fn test_group_pattern_conflict() {
        let bus = InMemoryBus::new();

        let _stream = bus.consume("orders.>", "inventory").await.unwrap();
        let err = bus.consume("billing.>", "inventory").await.err().expect("expected consume to fail");
        assert!(matches!(err, BusError::SubscribeError(_)));
    }

    #[tokio::test]
    async fn test_nak_redelivers_with_incremented_attempt() {
        let bus = InMemoryBus::new();
        let mut deliveries = bus.consume("orders.>", "inventory").await.unwrap();

        bus.publish("orders.placed", b"retry me".to_vec()).await.unwrap();

        let first = next_within(&mut deliveries, 1000).await.unwrap();
        assert_eq!(first.attempt, 1);
        first.nak(Duration::from_millis(10)).await.unwrap();

        let second = next_within(&mut deliveries, 1000).await.unwrap();
        assert_eq!(second.attempt, 2);
        assert_eq!(second.payload(), b"retry me");
        second.ack().await.unwrap();

        let stats = bus.stats();
        assert_eq!(stats.delivered, 2);
        assert_eq!(stats.nacked, 1);
        assert_eq!(stats.acked, 1);
    }

    #[tokio::test]
    async fn test_term_stops_redelivery() {
        let bus = InMemoryBus::new();
        let mut deliveries = bus.consume("orders.>", "inventory").await.unwrap();

        bus.publish("orders.placed", b"poison".to_vec()).await.unwrap();

        let delivery = next_within(&mut deliveries, 1000).await.unwrap();
        delivery.term().await.unwrap();

        assert!(next_within(&mut deliveries, 100).await.is_none());
        assert_eq!(bus.stats().terminated, 1);
        assert_eq!(bus.stats().acked, 0);
    }
}
