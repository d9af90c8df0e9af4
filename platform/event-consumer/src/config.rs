//! Consumer settings from environment variables
//!
//! | Variable                     | Default    |
//! |------------------------------|------------|
//! | `CONSUMER_NAME`              | (required) |
//! | `CONSUMER_SUBJECT`           | `events.>` |
//! | `CONSUMER_MAX_ATTEMPTS`      | `5`        |
//! | `CONSUMER_INITIAL_BACKOFF_MS`| `100`      |
//! | `CONSUMER_MAX_BACKOFF_MS`    | `30000`    |
//! | `CONSUMER_MAX_IN_FLIGHT`     | `16`       |
//! | `DEDUP_CAPACITY`             | `10000`    |
//! | `DEDUP_RETENTION_HOURS`      | `168`      |

use crate::dedup::DEFAULT_DEDUP_CAPACITY;
use event_bus::consumer_retry::RetryConfig;
use event_bus::ConfigError;
use std::env;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerConfig {
    /// Consumer group name; also keys this consumer's dedup records
    pub name: String,
    /// Subject pattern the consumer group listens on
    pub subject: String,
    pub retry: RetryConfig,
    pub max_in_flight: usize,
    pub dedup_capacity: usize,
    pub dedup_retention: Duration,
}

impl ConsumerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let name = lookup("CONSUMER_NAME")
            .filter(|name| !name.trim().is_empty())
            .ok_or(ConfigError::Missing("CONSUMER_NAME"))?;
        let subject = lookup("CONSUMER_SUBJECT").unwrap_or_else(|| "events.>".to_string());

        let max_attempts: u32 = parse_or(&lookup, "CONSUMER_MAX_ATTEMPTS", 5)?;
        if max_attempts == 0 {
            return Err(ConfigError::Invalid {
                name: "CONSUMER_MAX_ATTEMPTS",
                value: "0".to_string(),
            });
        }

        let retry = RetryConfig {
            max_attempts,
            initial_backoff: Duration::from_millis(parse_or(
                &lookup,
                "CONSUMER_INITIAL_BACKOFF_MS",
                100,
            )?),
            max_backoff: Duration::from_millis(parse_or(
                &lookup,
                "CONSUMER_MAX_BACKOFF_MS",
                30_000,
            )?),
        };

        Ok(Self {
            name,
            subject,
            retry,
            max_in_flight: parse_or(&lookup, "CONSUMER_MAX_IN_FLIGHT", 16usize)?.max(1),
            dedup_capacity: parse_or(&lookup, "DEDUP_CAPACITY", DEFAULT_DEDUP_CAPACITY)?,
            dedup_retention: Duration::from_secs(
                parse_or(&lookup, "DEDUP_RETENTION_HOURS", 168u64)?.saturating_mul(3600),
            ),
        })
    }
}

fn parse_or<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(name) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { name, value: raw }),
    }
}
