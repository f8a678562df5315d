use prometheus::{IntCounterVec, IntGauge, Opts, Registry};
use tracing::warn;

use crate::broker::ConsumerStatus;

/// Label value used when the event source could not be decoded
pub const UNKNOWN_SOURCE: &str = event_schema::UNKNOWN_SOURCE;

/// Why a message was counted in `events_failed_total`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureReason {
    DecodeError,
    MissingIdentity,
    DbError,
    MaxRetriesExceeded,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::DecodeError => "decode_error",
            FailureReason::MissingIdentity => "missing_identity",
            FailureReason::DbError => "db_error",
            FailureReason::MaxRetriesExceeded => "max_retries_exceeded",
        }
    }
}

impl From<&event_schema::DecodeError> for FailureReason {
    fn from(err: &event_schema::DecodeError) -> Self {
        match err {
            event_schema::DecodeError::Malformed(_) => FailureReason::DecodeError,
            event_schema::DecodeError::MissingIdentity { .. } => FailureReason::MissingIdentity,
        }
    }
}

/// Counters and gauges emitted by the pipeline
#[derive(Clone)]
pub struct PipelineMetrics {
    pub received: IntCounterVec,
    pub published: IntCounterVec,
    pub processed: IntCounterVec,
    pub duplicate: IntCounterVec,
    pub failed: IntCounterVec,
    pub consumer_pending: IntGauge,
    pub consumer_ack_pending: IntGauge,
}

impl PipelineMetrics {
    /// Build the metric set and register it on `registry`.
    ///
    /// A registration conflict is logged and the metrics still work locally.
    pub fn new(registry: &Registry) -> Self {
        let received = IntCounterVec::new(
            Opts::new("events_received_total", "Total number of events received"),
            &["source"],
        )
        .expect("valid metric opts for events_received_total");

        let published = IntCounterVec::new(
            Opts::new(
                "events_published_total",
                "Total number of events published to JetStream",
            ),
            &["source", "funnel_stage"],
        )
        .expect("valid metric opts for events_published_total");

        let processed = IntCounterVec::new(
            Opts::new(
                "events_processed_total",
                "Total number of events persisted by the consumer",
            ),
            &["source"],
        )
        .expect("valid metric opts for events_processed_total");

        let duplicate = IntCounterVec::new(
            Opts::new(
                "events_duplicate_total",
                "Total number of duplicate events skipped",
            ),
            &["source"],
        )
        .expect("valid metric opts for events_duplicate_total");

        let failed = IntCounterVec::new(
            Opts::new("events_failed_total", "Total number of failed events"),
            &["source", "reason"],
        )
        .expect("valid metric opts for events_failed_total");

        let consumer_pending = IntGauge::with_opts(Opts::new(
            "jetstream_consumer_pending",
            "Messages in the stream not yet delivered to the consumer",
        ))
        .expect("valid metric opts for jetstream_consumer_pending");

        let consumer_ack_pending = IntGauge::with_opts(Opts::new(
            "jetstream_consumer_ack_pending",
            "Messages delivered to the consumer but not yet acknowledged",
        ))
        .expect("valid metric opts for jetstream_consumer_ack_pending");

        for metric in [
            Box::new(received.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(published.clone()),
            Box::new(processed.clone()),
            Box::new(duplicate.clone()),
            Box::new(failed.clone()),
            Box::new(consumer_pending.clone()),
            Box::new(consumer_ack_pending.clone()),
        ] {
            if let Err(e) = registry.register(metric) {
                warn!("Failed to register pipeline metric: {}", e);
            }
        }

        Self {
            received,
            published,
            processed,
            duplicate,
            failed,
            consumer_pending,
            consumer_ack_pending,
        }
    }

    pub fn record_received(&self, source: &str) {
        self.received.with_label_values(&[source]).inc();
    }

    pub fn record_published(&self, source: &str, funnel_stage: &str) {
        self.published
            .with_label_values(&[source, funnel_stage])
            .inc();
    }

    pub fn record_processed(&self, source: &str) {
        self.processed.with_label_values(&[source]).inc();
    }

    pub fn record_duplicate(&self, source: &str) {
        self.duplicate.with_label_values(&[source]).inc();
    }

    pub fn record_failed(&self, source: &str, reason: FailureReason) {
        self.failed
            .with_label_values(&[source, reason.as_str()])
            .inc();
    }

    pub fn set_consumer_status(&self, status: &ConsumerStatus) {
        self.consumer_pending
            .set(i64::try_from(status.pending).unwrap_or(i64::MAX));
        self.consumer_ack_pending
            .set(i64::try_from(status.ack_pending).unwrap_or(i64::MAX));
    }
}
