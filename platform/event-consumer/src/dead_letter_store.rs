//! Postgres-backed dead-letter storage and manual replay

use crate::{ConsumerError, ConsumerResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use event_bus::{BusError, BusResult, DeadLetter, DeadLetterReason, DeadLetterSink, EventBus};
use sqlx::PgPool;
use uuid::Uuid;

/// Dead letter as stored, with its row id
#[derive(Debug, Clone, PartialEq)]
pub struct StoredDeadLetter {
    pub id: i64,
    pub letter: DeadLetter,
    pub replayed_at: Option<DateTime<Utc>>,
}

#[derive(sqlx::FromRow)]
struct FailedEventRow {
    id: i64,
    event_id: Option<Uuid>,
    event_type: Option<String>,
    subject: String,
    consumer: String,
    reason: String,
    error: String,
    attempts: i32,
    payload: Vec<u8>,
    failed_at: DateTime<Utc>,
    replayed_at: Option<DateTime<Utc>>,
}

impl FailedEventRow {
    fn into_stored(self) -> StoredDeadLetter {
        StoredDeadLetter {
            id: self.id,
            letter: DeadLetter {
                event_id: self.event_id,
                event_type: self.event_type,
                subject: self.subject,
                consumer: self.consumer,
                reason: parse_reason(&self.reason),
                error: self.error,
                attempts: u32::try_from(self.attempts).unwrap_or(0),
                failed_at: self.failed_at,
                payload: self.payload,
            },
            replayed_at: self.replayed_at,
        }
    }
}

fn parse_reason(reason: &str) -> DeadLetterReason {
    match reason {
        "undecodable" => DeadLetterReason::Undecodable,
        "permanent_failure" => DeadLetterReason::PermanentFailure,
        _ => DeadLetterReason::RetriesExhausted,
    }
}

/// Writes dead letters into `failed_events`
///
/// A letter whose event is already pending for the same consumer is absorbed,
/// so a redelivered dead-letter write never duplicates the row.
#[derive(Debug, Clone)]
pub struct PgDeadLetterStore {
    pool: PgPool,
}

impl PgDeadLetterStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Dead letters not yet replayed, oldest first
    pub async fn list_pending(&self, limit: i64) -> ConsumerResult<Vec<StoredDeadLetter>> {
        let rows = sqlx::query_as::<_, FailedEventRow>(
            r#"
            SELECT id, event_id, event_type, subject, consumer, reason, error,
                   attempts, payload, failed_at, replayed_at
            FROM failed_events
            WHERE replayed_at IS NULL
            ORDER BY failed_at ASC, id ASC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(FailedEventRow::into_stored).collect())
    }

    pub async fn get(&self, id: i64) -> ConsumerResult<StoredDeadLetter> {
        let row = sqlx::query_as::<_, FailedEventRow>(
            r#"
            SELECT id, event_id, event_type, subject, consumer, reason, error,
                   attempts, payload, failed_at, replayed_at
            FROM failed_events
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(ConsumerError::DeadLetterNotFound(id))?;

        Ok(row.into_stored())
    }

    /// Put a stored dead letter back on its original subject and mark it replayed
    ///
    /// Consumers that already processed the event drop the replay through
    /// their dedup record; the one that dead-lettered it handles it again.
    pub async fn replay(&self, id: i64, bus: &dyn EventBus) -> ConsumerResult<()> {
        let stored = self.get(id).await?;
        replay_dead_letter(&stored.letter, bus).await?;

        sqlx::query("UPDATE failed_events SET replayed_at = NOW() WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

#[async_trait]
impl DeadLetterSink for PgDeadLetterStore {
    async fn dead_letter(&self, letter: &DeadLetter) -> BusResult<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO failed_events
                (event_id, event_type, subject, consumer, reason, error,
                 attempts, payload, failed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (event_id, consumer)
                WHERE event_id IS NOT NULL AND replayed_at IS NULL
                DO NOTHING
            "#,
        )
        .bind(letter.event_id)
        .bind(letter.event_type.as_deref())
        .bind(&letter.subject)
        .bind(&letter.consumer)
        .bind(letter.reason.as_str())
        .bind(&letter.error)
        .bind(i32::try_from(letter.attempts).unwrap_or(i32::MAX))
        .bind(&letter.payload)
        .bind(letter.failed_at)
        .execute(&self.pool)
        .await
        .map_err(|e| BusError::InternalError(format!("failed to store dead letter: {e}")))?;

        if result.rows_affected() == 0 {
            tracing::debug!(
                event_id = ?letter.event_id,
                consumer = %letter.consumer,
                "Event already pending in failed_events, keeping first record"
            );
            return Ok(());
        }

        tracing::error!(
            event_id = ?letter.event_id,
            subject = %letter.subject,
            consumer = %letter.consumer,
            reason = letter.reason.as_str(),
            attempts = letter.attempts,
            error = %letter.error,
            "Event moved to failed_events"
        );

        Ok(())
    }
}

/// Publish a dead letter's original bytes on its original subject
pub async fn replay_dead_letter(letter: &DeadLetter, bus: &dyn EventBus) -> BusResult<()> {
    bus.publish(&letter.subject, letter.payload.clone()).await?;

    tracing::info!(
        event_id = ?letter.event_id,
        subject = %letter.subject,
        consumer = %letter.consumer,
        "Replayed dead letter"
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use event_bus::{BusMessage, InMemoryBus};
    use futures::StreamExt;
    use std::time::Duration;

    #[test]
    fn test_reason_round_trips_through_text() {
        for reason in [
            DeadLetterReason::Undecodable,
            DeadLetterReason::PermanentFailure,
            DeadLetterReason::RetriesExhausted,
        ] {
            assert_eq!(parse_reason(reason.as_str()), reason);
        }
    }

    #[tokio::test]
    async fn test_replay_republishes_original_bytes() {
        let bus = InMemoryBus::new();
        let mut stream = bus.subscribe("events.>").await.unwrap();

        let original = br#"{"event_id":"not even a uuid"}"#.to_vec();
        let letter = DeadLetter::from_message(
            &BusMessage::new("events.orders.order_placed".to_string(), original.clone()),
            "inventory",
            DeadLetterReason::Undecodable,
            "invalid event_id",
            1,
        );

        replay_dead_letter(&letter, &bus).await.unwrap();

        let msg = tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .expect("timeout")
            .expect("stream ended");
        assert_eq!(msg.subject, "events.orders.order_placed");
        assert_eq!(msg.payload, original);
    }
}
