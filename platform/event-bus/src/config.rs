//! Transport selection from environment variables
//!
//! | Variable               | Default                  |
//! |------------------------|--------------------------|
//! | `BUS_TYPE`             | `inmemory`               |
//! | `NATS_URL`             | `nats://localhost:4222`  |
//! | `EVENT_SUBJECT_PREFIX` | `events`                 |
//! | `DLQ_SUBJECT_PREFIX`   | `dlq`                    |
//! | `EVENTS_STREAM`        | `EVENTS`                 |
//! | `DLQ_STREAM`           | `EVENTS_DLQ`             |
//! | `ACK_WAIT_SECS`        | `30`                     |

use crate::{BusError, BusResult, EventBus, InMemoryBus, JetStreamBus, NatsBus, StreamSettings};
use std::env;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("invalid value for {name}: {value}")]
    Invalid { name: &'static str, value: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusType {
    InMemory,
    Nats,
    JetStream,
}

impl FromStr for BusType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "inmemory" | "memory" => Ok(BusType::InMemory),
            "nats" => Ok(BusType::Nats),
            "jetstream" => Ok(BusType::JetStream),
            other => Err(ConfigError::Invalid {
                name: "BUS_TYPE",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BusConfig {
    pub bus_type: BusType,
    pub nats_url: String,
    pub subject_prefix: String,
    pub dlq_prefix: String,
    pub streams: StreamSettings,
}

impl BusConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from any key lookup; `from_env` passes the process environment
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let bus_type = lookup("BUS_TYPE")
            .unwrap_or_else(|| "inmemory".to_string())
            .parse()?;

        let nats_url = lookup("NATS_URL").unwrap_or_else(|| "nats://localhost:4222".to_string());
        let subject_prefix = lookup("EVENT_SUBJECT_PREFIX").unwrap_or_else(|| "events".to_string());
        let dlq_prefix = lookup("DLQ_SUBJECT_PREFIX").unwrap_or_else(|| "dlq".to_string());

        let ack_wait_raw = lookup("ACK_WAIT_SECS").unwrap_or_else(|| "30".to_string());
        let ack_wait_secs: u64 = ack_wait_raw.parse().map_err(|_| ConfigError::Invalid {
            name: "ACK_WAIT_SECS",
            value: ack_wait_raw.clone(),
        })?;

        let defaults = StreamSettings::default();
        let streams = StreamSettings {
            events_stream: lookup("EVENTS_STREAM").unwrap_or(defaults.events_stream),
            events_subjects: vec![format!("{subject_prefix}.>")],
            dlq_stream: lookup("DLQ_STREAM").unwrap_or(defaults.dlq_stream),
            dlq_subjects: vec![format!("{dlq_prefix}.>")],
            ack_wait: Duration::from_secs(ack_wait_secs),
            ..defaults
        };

        Ok(Self {
            bus_type,
            nats_url,
            subject_prefix,
            dlq_prefix,
            streams,
        })
    }
}

/// Connect the transport named by the config
pub async fn connect_bus(cfg: &BusConfig) -> BusResult<Arc<dyn EventBus>> {
    match cfg.bus_type {
        BusType::InMemory => {
            tracing::info!("Using in-memory event bus");
            Ok(Arc::new(InMemoryBus::new()))
        }
        BusType::Nats => {
            let client = async_nats::connect(&cfg.nats_url)
                .await
                .map_err(|e| BusError::ConnectionError(e.to_string()))?;
            tracing::info!(url = %cfg.nats_url, "Connected to NATS");
            Ok(Arc::new(NatsBus::new(client)))
        }
        BusType::JetStream => {
            let client = async_nats::connect(&cfg.nats_url)
                .await
                .map_err(|e| BusError::ConnectionError(e.to_string()))?;
            let bus = JetStreamBus::new(client, cfg.streams.clone());
            bus.ensure_streams().await?;
            tracing::info!(
                url = %cfg.nats_url,
                stream = %cfg.streams.events_stream,
                "Connected to JetStream"
            );
            Ok(Arc::new(bus))
        }
    }
}
