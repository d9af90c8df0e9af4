//! Outbox relay for reliable event publishing
//!
//! Uses the transactional outbox pattern: the envelope is written in the same
//! database transaction as the domain change, and a relay publishes committed
//! rows afterwards. An event therefore exists on the bus if and only if the
//! transaction that produced it committed (possibly more than once; consumers
//! deduplicate on `event_id`).

use crate::{BusMetrics, EventEnvelope, EventPublisher};
use serde::Serialize;
use sqlx::{PgPool, Postgres, Transaction};
use std::time::Duration;
use tokio::sync::watch;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum OutboxError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Enqueue an event inside the caller's transaction
///
/// Nothing is published until the transaction commits and the relay picks
/// the row up.
pub async fn enqueue_event<T: Serialize>(
    tx: &mut Transaction<'_, Postgres>,
    envelope: &EventEnvelope<T>,
) -> Result<(), OutboxError> {
    let payload = serde_json::to_vec(envelope)?;

    sqlx::query(
        r#"
        INSERT INTO events_outbox (event_id, event_type, correlation_id, payload, status)
        VALUES ($1, $2, $3, $4, 'pending')
        "#,
    )
    .bind(envelope.event_id())
    .bind(envelope.event_type())
    .bind(envelope.correlation_id())
    .bind(payload)
    .execute(&mut **tx)
    .await?;

    Ok(())
}

#[derive(sqlx::FromRow)]
struct OutboxRow {
    id: i64,
    event_id: Uuid,
    event_type: String,
    correlation_id: Option<String>,
    payload: Vec<u8>,
    retry_count: i32,
}

/// Background publisher that drains `events_outbox`
#[derive(Clone)]
pub struct OutboxRelay {
    pool: PgPool,
    publisher: EventPublisher,
    batch_size: i64,
    poll_interval: Duration,
    max_publish_attempts: i32,
    metrics: Option<BusMetrics>,
}

impl OutboxRelay {
    pub fn new(pool: PgPool, publisher: EventPublisher) -> Self {
        Self {
            pool,
            publisher,
            batch_size: 100,
            poll_interval: Duration::from_millis(100),
            max_publish_attempts: 5,
            metrics: None,
        }
    }

    pub fn with_batch_size(mut self, batch_size: i64) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Rows are marked `failed` after this many publish failures
    pub fn with_max_publish_attempts(mut self, attempts: i32) -> Self {
        self.max_publish_attempts = attempts;
        self
    }

    pub fn with_metrics(mut self, metrics: BusMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Poll until `shutdown` flips to `true`
    ///
    /// A batch in progress is finished before returning.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!("Starting outbox relay");

        let mut interval = tokio::time::interval(self.poll_interval);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.publish_pending().await {
                        Ok(count) if count > 0 => {
                            tracing::info!(count, "Published events from outbox");
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "Error publishing events from outbox");
                        }
                        _ => {}
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Outbox relay stopped");
    }

    /// Publish one batch of pending rows, oldest first
    ///
    /// Rows are locked with `SKIP LOCKED`, so several relays can run side by
    /// side. The batch stops at the first publish failure to keep creation
    /// order for the rows behind it.
    pub async fn publish_pending(&self) -> Result<usize, OutboxError> {
        let mut tx = self.pool.begin().await?;

        let rows = sqlx::query_as::<_, OutboxRow>(
            r#"
            SELECT id, event_id, event_type, correlation_id, payload, retry_count
            FROM events_outbox
            WHERE status = 'pending'
            ORDER BY id ASC
            LIMIT $1
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(self.batch_size)
        .fetch_all(&mut *tx)
        .await?;

        let mut published_count = 0;

        for row in rows {
            let result = self
                .publisher
                .publish_serialized(
                    row.event_id,
                    &row.event_type,
                    row.correlation_id.as_deref(),
                    row.payload,
                )
                .await;

            match result {
                Ok(()) => {
                    sqlx::query(
                        r#"
                        UPDATE events_outbox
                        SET status = 'published', published_at = NOW()
                        WHERE id = $1
                        "#,
                    )
                    .bind(row.id)
                    .execute(&mut *tx)
                    .await?;

                    self.count("published");
                    published_count += 1;
                }
                Err(e) => {
                    let retry_count = row.retry_count + 1;
                    let status = next_status(retry_count, self.max_publish_attempts);

                    sqlx::query(
                        r#"
                        UPDATE events_outbox
                        SET retry_count = $1, status = $2, error_message = $3
                        WHERE id = $4
                        "#,
                    )
                    .bind(retry_count)
                    .bind(status)
                    .bind(e.to_string())
                    .bind(row.id)
                    .execute(&mut *tx)
                    .await?;

                    self.count(if status == "failed" { "failed" } else { "retry" });
                    tracing::warn!(
                        event_id = %row.event_id,
                        retry_count,
                        max_attempts = self.max_publish_attempts,
                        error = %e,
                        "Failed to publish outbox event"
                    );
                    break;
                }
            }
        }

        tx.commit().await?;

        Ok(published_count)
    }

    fn count(&self, result: &str) {
        if let Some(metrics) = &self.metrics {
            metrics
                .outbox_relayed_total
                .with_label_values(&[result])
                .inc();
        }
    }
}

fn next_status(retry_count: i32, max_attempts: i32) -> &'static str {
    if retry_count >= max_attempts {
        "failed"
    } else {
        "pending"
    }
}
