//! Dead-letter routing for events that exhausted their deliveries

use bytes::Bytes;
use chrono::{DateTime, Utc};
use event_schema::Event;
use event_store::StoreError;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, warn};

use crate::broker::BrokerPublisher;

/// Payload published to the dead-letter subject
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterRecord {
    pub original_event: Event,
    pub error: DeadLetterError,
    pub quarantined_at: DateTime<Utc>,
    pub delivery_count: u64,
    /// Configured delivery ceiling
    pub retry_count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterError {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl From<&StoreError> for DeadLetterError {
    fn from(err: &StoreError) -> Self {
        Self {
            message: err.to_string(),
            code: err.code(),
        }
    }
}

/// Publishes quarantined events on a subject outside the event stream.
pub struct DeadLetterRouter<P> {
    publisher: Arc<P>,
    subject: String,
    max_deliver: u64,
}

impl<P: BrokerPublisher> DeadLetterRouter<P> {
    pub fn new(publisher: Arc<P>, subject: impl Into<String>, max_deliver: u64) -> Self {
        Self {
            publisher,
            subject: subject.into(),
            max_deliver,
        }
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn record(&self, event: &Event, error: &StoreError, delivery_count: u64) -> DeadLetterRecord {
        DeadLetterRecord {
            original_event: event.clone(),
            error: DeadLetterError::from(error),
            quarantined_at: Utc::now(),
            delivery_count,
            retry_count: self.max_deliver,
        }
    }

    /// Best-effort publish of a dead-letter record.
    ///
    /// Returns whether the broker accepted it. Failures are only logged.
    pub async fn quarantine(&self, event: &Event, error: &StoreError, delivery_count: u64) -> bool {
        let record = self.record(event, error, delivery_count);

        let payload = match serde_json::to_vec(&record) {
            Ok(payload) => Bytes::from(payload),
            Err(e) => {
                error!(
                    event_id = %event.event_id,
                    error = %e,
                    "Failed to serialize dead-letter record"
                );
                return false;
            }
        };

        match self.publisher.publish(self.subject.clone(), payload).await {
            Ok(()) => {
                warn!(
                    event_id = %event.event_id,
                    subject = %self.subject,
                    delivery_count,
                    error = %error,
                    "Event sent to DLQ"
                );
                true
            }
            Err(e) => {
                error!(
                    event_id = %event.event_id,
                    subject = %self.subject,
                    error = %e,
                    "Failed to send event to DLQ"
                );
                false
            }
        }
    }
}
