//! Consumer side of the integration event bus
//!
//! A consuming service wires its handlers at startup and hands the frozen
//! registry to a [`Dispatcher`], which then owns delivery:
//!
//! ```rust,no_run
//! use event_bus::{BusDeadLetterSink, EventBus, InMemoryBus};
//! use event_consumer::{
//!     Dispatcher, FnHandler, HandlerError, InMemoryProcessedStore, SubscriptionRegistry,
//! };
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let bus: Arc<dyn EventBus> = Arc::new(InMemoryBus::new());
//!
//! let mut registry = SubscriptionRegistry::new();
//! registry.subscribe(
//!     "orders.order_placed",
//!     Arc::new(FnHandler::new("reserve_stock", |_event| async { Ok::<(), HandlerError>(()) })),
//! );
//!
//! let dispatcher = Dispatcher::new(
//!     "inventory",
//!     registry,
//!     Arc::new(InMemoryProcessedStore::new()),
//!     Arc::new(BusDeadLetterSink::new(bus.clone())),
//! );
//!
//! let (_shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
//! let consumer = dispatcher.start(bus.as_ref(), "events.>", shutdown_rx).await?;
//! # consumer.await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod dead_letter_store;
pub mod dedup;
pub mod dispatcher;
pub mod handler;
pub mod registry;

pub use config::ConsumerConfig;
pub use dead_letter_store::{replay_dead_letter, PgDeadLetterStore, StoredDeadLetter};
pub use dedup::{InMemoryProcessedStore, PgProcessedStore, ProcessedStore};
pub use dispatcher::{DispatchOutcome, Dispatcher};
pub use handler::{
    EventHandler, FnHandler, HandlerError, IntegrationEventHandler, ReceivedEvent, Typed,
};
pub use registry::SubscriptionRegistry;

use event_bus::BusError;
use sqlx::PgPool;

#[derive(Debug, thiserror::Error)]
pub enum ConsumerError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("bus error: {0}")]
    Bus(#[from] BusError),

    #[error("dead letter {0} not found")]
    DeadLetterNotFound(i64),
}

pub type ConsumerResult<T> = Result<T, ConsumerError>;

/// Apply the `processed_events` and `failed_events` schema
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    let mut migrator = sqlx::migrate!("./migrations");
    migrator.set_ignore_missing(true);
    migrator.run(pool).await
}
