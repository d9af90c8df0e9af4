//! Processed-event records for idempotent consumption
//!
//! Each consumer keeps its own record of the event ids it has fully handled.
//! The dispatcher checks it before invoking handlers and writes it after all
//! handlers succeed. Dedup is best-effort (a crash between handling and
//! recording lets one duplicate through), which is why handlers must still be
//! idempotent.

use crate::ConsumerResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use std::collections::{HashSet, VecDeque};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use uuid::Uuid;

/// Default number of ids [`InMemoryProcessedStore`] remembers
pub const DEFAULT_DEDUP_CAPACITY: usize = 10_000;

#[async_trait]
pub trait ProcessedStore: Send + Sync {
    async fn is_processed(&self, event_id: Uuid) -> ConsumerResult<bool>;

    /// Record `event_id` as handled; recording it twice is not an error
    async fn mark_processed(&self, event_id: Uuid, event_type: &str) -> ConsumerResult<()>;
}

/// Bounded in-process record; the oldest ids are forgotten first
#[derive(Debug)]
pub struct InMemoryProcessedStore {
    capacity: usize,
    inner: Mutex<Window>,
}

#[derive(Debug, Default)]
struct Window {
    ids: HashSet<Uuid>,
    order: VecDeque<Uuid>,
}

impl InMemoryProcessedStore {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_DEDUP_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(Window::default()),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemoryProcessedStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProcessedStore for InMemoryProcessedStore {
    async fn is_processed(&self, event_id: Uuid) -> ConsumerResult<bool> {
        let window = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(window.ids.contains(&event_id))
    }

    async fn mark_processed(&self, event_id: Uuid, _event_type: &str) -> ConsumerResult<()> {
        let mut window = self.inner.lock().unwrap_or_else(PoisonError::into_inner);

        if !window.ids.insert(event_id) {
            return Ok(());
        }
        window.order.push_back(event_id);

        while window.order.len() > self.capacity {
            if let Some(evicted) = window.order.pop_front() {
                window.ids.remove(&evicted);
            }
        }

        Ok(())
    }
}

/// Record persisted in `processed_events`, keyed by `(event_id, processor)`
#[derive(Debug, Clone)]
pub struct PgProcessedStore {
    pool: PgPool,
    processor: String,
}

impl PgProcessedStore {
    /// `processor` is the consumer name; consumers sharing a database keep
    /// separate records.
    pub fn new(pool: PgPool, processor: impl Into<String>) -> Self {
        Self {
            pool,
            processor: processor.into(),
        }
    }

    /// Delete records older than `retention`, returning how many went
    ///
    /// Redeliveries older than the retention window are no longer caught, so
    /// keep it well above the transport's redelivery horizon.
    pub async fn prune_older_than(&self, retention: Duration) -> ConsumerResult<u64> {
        let cutoff = chrono::Duration::from_std(retention)
            .ok()
            .and_then(|retention| Utc::now().checked_sub_signed(retention))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let result = sqlx::query(
            r#"
            DELETE FROM processed_events
            WHERE processor = $1 AND processed_at < $2
            "#,
        )
        .bind(&self.processor)
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            tracing::info!(
                processor = %self.processor,
                pruned = result.rows_affected(),
                "Pruned processed event records"
            );
        }

        Ok(result.rows_affected())
    }
}

#[async_trait]
impl ProcessedStore for PgProcessedStore {
    async fn is_processed(&self, event_id: Uuid) -> ConsumerResult<bool> {
        let exists: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM processed_events
                WHERE event_id = $1 AND processor = $2
            )
            "#,
        )
        .bind(event_id)
        .bind(&self.processor)
        .fetch_one(&self.pool)
        .await?;

        Ok(exists)
    }

    async fn mark_processed(&self, event_id: Uuid, event_type: &str) -> ConsumerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO processed_events (event_id, processor, event_type)
            VALUES ($1, $2, $3)
            ON CONFLICT (event_id, processor) DO NOTHING
            "#,
        )
        .bind(event_id)
        .bind(&self.processor)
        .bind(event_type)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
