//! Broker abstractions used by the pipeline.
//!
//! The traits here are the seams between pipeline logic and the JetStream
//! client: [`BrokerPublisher`] for outbound publishes, [`MessageSource`] for the
//! durable pull consumer, and [`InboundMessage`] for the delivery envelope of a
//! fetched message. [`jetstream`] holds the `async-nats` implementations.

use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;
use thiserror::Error;

pub mod jetstream;
pub mod topology;

pub use jetstream::{connect, JetStreamMessage, JetStreamPublisher, JetStreamSource};
pub use topology::{consumer_config, dead_letter_stream_config, ensure_topology, stream_config};

/// Result type alias for broker operations.
pub type BrokerResult<T> = Result<T, BrokerError>;

/// Errors raised by broker operations other than fetching.
#[derive(Error, Debug)]
pub enum BrokerError {
    /// Could not establish the broker connection
    #[error("Connection failed: {0}")]
    Connect(String),

    /// Stream or consumer could not be created or looked up
    #[error("Topology setup failed: {0}")]
    Topology(String),

    /// Publish was not acknowledged by the broker
    #[error("Publish failed: {0}")]
    Publish(String),

    /// Ack, nak or term could not be delivered
    #[error("Acknowledgement failed: {0}")]
    Ack(String),

    /// Consumer info request failed
    #[error("Consumer info unavailable: {0}")]
    Info(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Outcome of a failed fetch.
#[derive(Error, Debug)]
pub enum FetchError {
    /// Fetch expired or the consumer had nothing to deliver; normal idling
    #[error("No messages available")]
    Idle,

    /// Connectivity or protocol fault
    #[error("Fetch failed: {0}")]
    Broker(String),
}

impl FetchError {
    /// Classify a client error message into idle vs. fault.
    pub fn classify(message: impl std::fmt::Display) -> Self {
        let message = message.to_string();
        let lowered = message.to_lowercase();
        if lowered.contains("timeout")
            || lowered.contains("timed out")
            || lowered.contains("no messages")
        {
            FetchError::Idle
        } else {
            FetchError::Broker(message)
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self, FetchError::Idle)
    }
}

/// Snapshot of the durable consumer's backlog
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerStatus {
    /// Messages in the stream not yet delivered to this consumer
    pub pending: u64,
    /// Messages delivered but not yet acknowledged
    pub ack_pending: u64,
}

/// Publishes raw payloads to the broker.
///
/// Implementations resolve only after the broker has persisted the message.
#[async_trait]
pub trait BrokerPublisher: Send + Sync {
    async fn publish(&self, subject: String, payload: Bytes) -> BrokerResult<()>;
}

/// A fetched message together with its delivery envelope.
#[async_trait]
pub trait InboundMessage: Send + Sync {
    fn payload(&self) -> &[u8];

    /// How many times the broker has delivered this message (1 on first delivery)
    fn delivery_count(&self) -> u64;

    /// Positive acknowledgement: processing is done
    async fn ack(&self) -> BrokerResult<()>;

    /// Negative acknowledgement: redeliver
    async fn nak(&self) -> BrokerResult<()>;

    /// Terminal acknowledgement: never redeliver
    async fn term(&self) -> BrokerResult<()>;
}

/// Pull side of a durable consumer.
#[async_trait]
pub trait MessageSource: Send + Sync {
    type Message: InboundMessage + 'static;

    /// Fetch up to `max_messages`, waiting at most `expires` for them.
    async fn fetch(
        &self,
        max_messages: usize,
        expires: Duration,
    ) -> Result<Vec<Self::Message>, FetchError>;

    async fn status(&self) -> BrokerResult<ConsumerStatus>;
}
