//! Pull-based batch processor.
//!
//! Each iteration fetches a bounded batch from the durable consumer, decodes
//! it, and tries to persist the whole batch with one idempotent bulk insert.
//! If the bulk insert fails, every decoded message is retried on its own with
//! bounded concurrency, and each message is individually acked, naked for
//! redelivery, or quarantined to the dead-letter subject and terminated.
//!
//! Messages that cannot be decoded are terminated immediately; redelivering
//! them cannot help.

use event_schema::{decode_event, DecodeError, Event};
use event_store::{EventRepository, InsertOutcome};
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::broker::{BrokerPublisher, BrokerResult, FetchError, InboundMessage, MessageSource};
use crate::config::ConsumerConfig;
use crate::dlq::DeadLetterRouter;
use crate::metrics::{FailureReason, PipelineMetrics};

/// Terminal (or redelivery) decision for one fetched message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageOutcome {
    /// Could not be decoded; terminated
    Rejected(FailureReason),
    /// New row written; acked
    Persisted,
    /// Identity already stored; acked
    Duplicate,
    /// Transient store failure; naked for redelivery
    Retried,
    /// Deliveries exhausted; sent to the dead-letter subject and terminated
    Quarantined,
}

/// Per-batch tally of message outcomes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub fetched: usize,
    pub persisted: usize,
    pub duplicates: usize,
    pub rejected: usize,
    pub retried: usize,
    pub quarantined: usize,
    /// Whether the bulk insert failed and messages were handled one by one
    pub used_fallback: bool,
}

impl BatchReport {
    fn new(fetched: usize) -> Self {
        Self {
            fetched,
            ..Default::default()
        }
    }

    pub fn record(&mut self, outcome: MessageOutcome) {
        match outcome {
            MessageOutcome::Rejected(_) => self.rejected += 1,
            MessageOutcome::Persisted => self.persisted += 1,
            MessageOutcome::Duplicate => self.duplicates += 1,
            MessageOutcome::Retried => self.retried += 1,
            MessageOutcome::Quarantined => self.quarantined += 1,
        }
    }

    /// Messages that reached an outcome; equals `fetched` for every batch
    pub fn accounted(&self) -> usize {
        self.persisted + self.duplicates + self.rejected + self.retried + self.quarantined
    }
}

/// Drives fetch, persistence and acknowledgement for one durable consumer.
pub struct BatchProcessor<S, R, P> {
    source: Arc<S>,
    store: Arc<R>,
    dead_letters: DeadLetterRouter<P>,
    metrics: PipelineMetrics,
    config: ConsumerConfig,
}

impl<S, R, P> BatchProcessor<S, R, P>
where
    S: MessageSource + 'static,
    R: EventRepository + 'static,
    P: BrokerPublisher + 'static,
{
    pub fn new(
        source: Arc<S>,
        store: Arc<R>,
        dead_letters: DeadLetterRouter<P>,
        metrics: PipelineMetrics,
        config: ConsumerConfig,
    ) -> Self {
        Self {
            source,
            store,
            dead_letters,
            metrics,
            config,
        }
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    /// Spawn the poll loop and the consumer-status loop.
    ///
    /// Both loops stop when `shutdown` is cancelled.
    pub fn start(self: Arc<Self>, shutdown: CancellationToken) -> ConsumerRuntime {
        let poll = tokio::spawn({
            let processor = Arc::clone(&self);
            let shutdown = shutdown.clone();
            async move { processor.run(shutdown).await }
        });

        let monitor = tokio::spawn({
            let processor = Arc::clone(&self);
            let shutdown = shutdown.clone();
            async move { processor.monitor(shutdown).await }
        });

        ConsumerRuntime {
            shutdown,
            poll,
            monitor,
        }
    }

    /// Poll loop. Cancellation is observed between iterations only.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            batch_size = self.config.batch_size,
            concurrency = self.config.effective_concurrency(),
            max_deliver = self.config.max_deliver,
            "Batch processor started"
        );

        while !shutdown.is_cancelled() {
            match self
                .source
                .fetch(self.config.batch_size, self.config.fetch_expires())
                .await
            {
                Ok(messages) if messages.is_empty() => {
                    debug!("Fetch returned an empty batch");
                    self.backoff(&shutdown).await;
                }
                Ok(messages) => {
                    let report = self.process_batch(messages).await;
                    debug!(
                        fetched = report.fetched,
                        persisted = report.persisted,
                        duplicates = report.duplicates,
                        rejected = report.rejected,
                        retried = report.retried,
                        quarantined = report.quarantined,
                        fallback = report.used_fallback,
                        "Batch processed"
                    );
                }
                Err(FetchError::Idle) => {
                    debug!("No messages available");
                    self.backoff(&shutdown).await;
                }
                Err(e) => {
                    error!(error = %e, "Batch fetch error");
                    self.backoff(&shutdown).await;
                }
            }
        }

        info!("Batch processor stopped");
    }

    /// Refresh the consumer backlog gauges until cancelled.
    pub async fn monitor(&self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.metrics_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }

            match self.source.status().await {
                Ok(status) => self.metrics.set_consumer_status(&status),
                Err(e) => error!(error = %e, "Error updating consumer metrics"),
            }
        }
    }

    async fn backoff(&self, shutdown: &CancellationToken) {
        tokio::select! {
            _ = shutdown.cancelled() => {}
            _ = tokio::time::sleep(self.config.retry_backoff()) => {}
        }
    }

    /// Decode, persist and settle one fetched batch.
    pub async fn process_batch(&self, messages: Vec<S::Message>) -> BatchReport {
        let mut report = BatchReport::new(messages.len());
        let mut decoded: Vec<(S::Message, Event)> = Vec::with_capacity(messages.len());

        for message in messages {
            match decode_event(message.payload()) {
                Ok(event) => decoded.push((message, event)),
                Err(e) => {
                    let outcome = self.reject(&message, &e).await;
                    report.record(outcome);
                }
            }
        }

        if decoded.is_empty() {
            return report;
        }

        let (messages, events): (Vec<S::Message>, Vec<Event>) = decoded.into_iter().unzip();

        match self.store.insert_batch(&events).await {
            Ok(summary) => {
                let duplicates = summary.duplicate_count();
                let mut first_inserts = summary.inserted_ids;

                for (message, event) in messages.iter().zip(events.iter()) {
                    settle(message.ack().await, "ack", &event.event_id);

                    // Later repeats of an inserted identity count as duplicates
                    let source = event.source.as_str();
                    if first_inserts.remove(&event.event_id) {
                        self.metrics.record_processed(source);
                        report.record(MessageOutcome::Persisted);
                    } else {
                        self.metrics.record_duplicate(source);
                        report.record(MessageOutcome::Duplicate);
                    }
                }

                if duplicates > 0 {
                    info!(
                        batch_size = events.len(),
                        duplicates,
                        "Batch contained already-stored events"
                    );
                }
            }
            Err(e) => {
                warn!(
                    error = %e,
                    batch_size = events.len(),
                    "Batch insert failed, falling back to individual processing"
                );
                report.used_fallback = true;

                let outcomes: Vec<MessageOutcome> = stream::iter(messages.into_iter().zip(events))
                    .map(|(message, event)| self.process_message(message, event))
                    .buffer_unordered(self.config.effective_concurrency())
                    .collect()
                    .await;

                for outcome in outcomes {
                    report.record(outcome);
                }
            }
        }

        report
    }

    /// Single-message path used when the bulk insert fails.
    pub async fn process_message(&self, message: S::Message, event: Event) -> MessageOutcome {
        let source = event.source.as_str();

        match self.store.insert_one(&event).await {
            Ok(InsertOutcome::Inserted) => {
                settle(message.ack().await, "ack", &event.event_id);
                self.metrics.record_processed(source);
                MessageOutcome::Persisted
            }
            Ok(InsertOutcome::Duplicate) => {
                settle(message.ack().await, "ack", &event.event_id);
                self.metrics.record_duplicate(source);
                debug!(event_id = %event.event_id, "Duplicate event skipped");
                MessageOutcome::Duplicate
            }
            Err(e) => {
                let delivery_count = message.delivery_count();

                if delivery_count >= self.config.max_deliver {
                    error!(
                        event_id = %event.event_id,
                        delivery_count,
                        error = %e,
                        "Event exceeded max deliveries, quarantining"
                    );
                    // Terminated whether or not the DLQ publish succeeded
                    self.dead_letters
                        .quarantine(&event, &e, delivery_count)
                        .await;
                    settle(message.term().await, "term", &event.event_id);
                    self.metrics
                        .record_failed(source, FailureReason::MaxRetriesExceeded);
                    MessageOutcome::Quarantined
                } else {
                    error!(
                        event_id = %event.event_id,
                        delivery_count,
                        max_deliver = self.config.max_deliver,
                        transient = e.is_transient(),
                        error = %e,
                        "Error processing event, scheduling redelivery"
                    );
                    settle(message.nak().await, "nak", &event.event_id);
                    self.metrics.record_failed(source, FailureReason::DbError);
                    MessageOutcome::Retried
                }
            }
        }
    }

    async fn reject(&self, message: &S::Message, err: &DecodeError) -> MessageOutcome {
        let reason = FailureReason::from(err);

        match err {
            DecodeError::Malformed(e) => {
                error!(error = %e, "Failed to decode message, terminating");
            }
            DecodeError::MissingIdentity { .. } => {
                error!(source = err.source_label(), "Event missing eventId, terminating");
            }
        }

        settle(message.term().await, "term", "-");
        self.metrics.record_failed(err.source_label(), reason);
        MessageOutcome::Rejected(reason)
    }
}

/// Acknowledgement failures do not change the outcome; the broker
/// redelivers after ack_wait and the store absorbs the repeat.
fn settle(result: BrokerResult<()>, action: &'static str, event_id: &str) {
    if let Err(e) = result {
        warn!(
            action,
            event_id = %event_id,
            error = %e,
            "Failed to settle message"
        );
    }
}

/// Handle to the running poll and monitor loops
pub struct ConsumerRuntime {
    shutdown: CancellationToken,
    poll: JoinHandle<()>,
    monitor: JoinHandle<()>,
}

impl ConsumerRuntime {
    /// Signal both loops to stop; in-flight work is not aborted.
    pub fn stop(&self) {
        if !self.shutdown.is_cancelled() {
            info!("Stopping batch processor");
        }
        self.shutdown.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Wait for both loops to finish.
    pub async fn join(self) {
        if let Err(e) = self.poll.await {
            error!(error = %e, "Poll loop terminated abnormally");
        }
        if let Err(e) = self.monitor.await {
            error!(error = %e, "Consumer monitor terminated abnormally");
        }
    }
}
