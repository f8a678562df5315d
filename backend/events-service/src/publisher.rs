use bytes::Bytes;
use event_schema::Event;
use std::sync::Arc;
use tracing::{debug, error};

use crate::broker::{BrokerPublisher, BrokerResult};
use crate::metrics::PipelineMetrics;

/// Routes validated events onto the event stream.
///
/// A failed publish is returned to the caller and not retried here.
pub struct EventPublisher<P> {
    publisher: Arc<P>,
    subject_prefix: String,
    metrics: PipelineMetrics,
}

impl<P: BrokerPublisher> EventPublisher<P> {
    pub fn new(publisher: Arc<P>, subject_prefix: impl Into<String>, metrics: PipelineMetrics) -> Self {
        Self {
            publisher,
            subject_prefix: subject_prefix.into(),
            metrics,
        }
    }

    pub fn subject_for(&self, event: &Event) -> String {
        event.subject(&self.subject_prefix)
    }

    /// Publish one event and wait for the broker's persistence ack.
    pub async fn publish(&self, event: &Event) -> BrokerResult<()> {
        let source = event.source.as_str();
        self.metrics.record_received(source);

        let subject = self.subject_for(event);
        let payload = Bytes::from(serde_json::to_vec(event)?);

        match self.publisher.publish(subject.clone(), payload).await {
            Ok(()) => {
                self.metrics
                    .record_published(source, event.funnel_stage.as_str());
                debug!(
                    event_id = %event.event_id,
                    subject = %subject,
                    "Published event"
                );
                Ok(())
            }
            Err(e) => {
                error!(
                    event_id = %event.event_id,
                    subject = %subject,
                    error = %e,
                    "Failed to publish event"
                );
                Err(e)
            }
        }
    }
}
