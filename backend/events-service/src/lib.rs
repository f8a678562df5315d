//! Funnel event pipeline: JetStream publisher, durable pull consumer and
//! idempotent batch persistence with dead-letter quarantine.

pub mod broker;
pub mod config;
pub mod dlq;
pub mod error;
pub mod metrics;
pub mod processor;
pub mod publisher;

pub use broker::{
    BrokerError, BrokerPublisher, BrokerResult, ConsumerStatus, FetchError, InboundMessage,
    MessageSource,
};
pub use config::{BrokerConfig, Config, ConsumerConfig};
pub use dlq::{DeadLetterError, DeadLetterRecord, DeadLetterRouter};
pub use error::{PipelineError, PipelineResult};
pub use metrics::{FailureReason, PipelineMetrics};
pub use processor::{BatchProcessor, BatchReport, ConsumerRuntime, MessageOutcome};
pub use publisher::EventPublisher;
