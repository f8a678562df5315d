//! Service configuration
//!
//! Broker and consumer settings come from `NATS_*` environment variables
//! (via `envy`); database settings come from `DATABASE_URL` / `DB_*` through
//! [`StoreConfig`]. Every setting except `DATABASE_URL` has a default.

use event_store::StoreConfig;
use serde::Deserialize;
use std::time::Duration;

use crate::error::{PipelineError, PipelineResult};

pub const SERVICE_NAME: &str = "events-service";

#[derive(Debug, Clone)]
pub struct Config {
    pub broker: BrokerConfig,
    pub consumer: ConsumerConfig,
    pub store: StoreConfig,
}

impl Config {
    /// Load the full configuration, reading `.env` first if present.
    pub fn from_env() -> PipelineResult<Self> {
        dotenvy::dotenv().ok();

        let broker = BrokerConfig::from_env()?;
        let consumer = ConsumerConfig::from_env()?;
        let store = StoreConfig::from_env(SERVICE_NAME).map_err(PipelineError::Config)?;

        Ok(Self {
            broker,
            consumer,
            store,
        })
    }
}

/// Stream topology and connection settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// NATS_URL
    pub url: String,
    /// NATS_STREAM
    pub stream: String,
    /// NATS_SUBJECT_PREFIX
    pub subject_prefix: String,
    /// NATS_DURABLE_NAME
    pub durable_name: String,
    /// NATS_DLQ_SUBJECT
    pub dlq_subject: String,
    /// NATS_DLQ_STREAM: stream that captures the dead-letter subject
    pub dlq_stream: String,
    /// NATS_STREAM_MAX_AGE_SECS
    pub stream_max_age_secs: u64,
    /// NATS_STREAM_MAX_BYTES
    pub stream_max_bytes: i64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            url: "nats://localhost:4222".to_string(),
            stream: "EVENTS".to_string(),
            subject_prefix: "events".to_string(),
            durable_name: "event-processor".to_string(),
            dlq_subject: "dlq.events".to_string(),
            dlq_stream: "EVENTS_DLQ".to_string(),
            stream_max_age_secs: 7 * 24 * 60 * 60,
            stream_max_bytes: 1_000_000_000,
        }
    }
}

impl BrokerConfig {
    pub fn from_env() -> PipelineResult<Self> {
        let config: Self = envy::prefixed("NATS_").from_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Subject filter covering every event subject (`{prefix}.>`)
    pub fn subject_filter(&self) -> String {
        format!("{}.>", self.subject_prefix)
    }

    pub fn stream_max_age(&self) -> Duration {
        Duration::from_secs(self.stream_max_age_secs)
    }

    pub fn validate(&self) -> PipelineResult<()> {
        if self.stream.trim().is_empty() {
            return Err(PipelineError::Config("NATS_STREAM cannot be empty".into()));
        }
        if self.subject_prefix.trim().is_empty() {
            return Err(PipelineError::Config(
                "NATS_SUBJECT_PREFIX cannot be empty".into(),
            ));
        }
        if self.durable_name.trim().is_empty() {
            return Err(PipelineError::Config(
                "NATS_DURABLE_NAME cannot be empty".into(),
            ));
        }
        // The DLQ subject must not be captured by the event stream's filter
        if self.dlq_subject.starts_with(&format!("{}.", self.subject_prefix)) {
            return Err(PipelineError::Config(format!(
                "NATS_DLQ_SUBJECT '{}' overlaps the event subjects '{}'",
                self.dlq_subject,
                self.subject_filter()
            )));
        }
        if self.dlq_stream.trim().is_empty() || self.dlq_stream == self.stream {
            return Err(PipelineError::Config(format!(
                "NATS_DLQ_STREAM '{}' must be set and differ from NATS_STREAM",
                self.dlq_stream
            )));
        }
        Ok(())
    }
}

/// Batch processor settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    /// NATS_BATCH_SIZE: max messages per fetch
    pub batch_size: usize,
    /// NATS_CONCURRENCY: max in-flight single inserts during fallback
    pub concurrency: usize,
    /// NATS_ACK_WAIT_SECS
    pub ack_wait_secs: u64,
    /// NATS_MAX_DELIVER: delivery count at which a failing message is quarantined
    pub max_deliver: u64,
    /// NATS_MAX_ACK_PENDING
    pub max_ack_pending: i64,
    /// NATS_FETCH_EXPIRES_MS
    pub fetch_expires_ms: u64,
    /// NATS_RETRY_BACKOFF_MS: sleep after a fetch error
    pub retry_backoff_ms: u64,
    /// NATS_METRICS_INTERVAL_MS: consumer gauge refresh period
    pub metrics_interval_ms: u64,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            batch_size: 500,
            concurrency: 50,
            ack_wait_secs: 30,
            max_deliver: 5,
            max_ack_pending: 10_000,
            fetch_expires_ms: 5_000,
            retry_backoff_ms: 1_000,
            metrics_interval_ms: 5_000,
        }
    }
}

impl ConsumerConfig {
    pub fn from_env() -> PipelineResult<Self> {
        let config: Self = envy::prefixed("NATS_").from_env()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> PipelineResult<()> {
        if self.batch_size == 0 {
            return Err(PipelineError::Config(
                "NATS_BATCH_SIZE must be greater than 0".into(),
            ));
        }
        if self.max_deliver == 0 {
            return Err(PipelineError::Config(
                "NATS_MAX_DELIVER must be greater than 0".into(),
            ));
        }
        if self.fetch_expires_ms == 0 {
            return Err(PipelineError::Config(
                "NATS_FETCH_EXPIRES_MS must be greater than 0".into(),
            ));
        }
        Ok(())
    }

    /// Fallback concurrency, never below 1
    pub fn effective_concurrency(&self) -> usize {
        self.concurrency.max(1)
    }

    pub fn ack_wait(&self) -> Duration {
        Duration::from_secs(self.ack_wait_secs)
    }

    pub fn fetch_expires(&self) -> Duration {
        Duration::from_millis(self.fetch_expires_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn metrics_interval(&self) -> Duration {
        Duration::from_millis(self.metrics_interval_ms.max(1))
    }
}
