//! In-memory broker, store and publisher fakes for pipeline tests.
//!
//! `FakeBroker` models the parts of a JetStream durable consumer the
//! processor relies on: a delivery counter per message, redelivery on nak,
//! and no further deliveries once a message was delivered `max_deliver` times.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use event_schema::{Event, FunnelStage, Source};
use event_store::{
    BatchInsertSummary, EventRepository, InsertOutcome, StoreError, StoreResult,
};
use events_service::{
    BatchProcessor, BrokerError, BrokerPublisher, BrokerResult, ConsumerConfig, ConsumerStatus,
    DeadLetterRouter, FetchError, InboundMessage, MessageSource, PipelineMetrics,
};
use prometheus::Registry;
use serde_json::json;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const DLQ_SUBJECT: &str = "dlq.events";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Ack,
    Nak,
    Term,
}

pub fn event(source: Source, stage: FunnelStage, event_type: &str) -> Event {
    Event::new(
        uuid::Uuid::new_v4().to_string(),
        source,
        stage,
        event_type,
        json!({"campaign": {"campaignId": "cmp-1"}}),
    )
}

pub fn facebook_purchase() -> Event {
    event(Source::Facebook, FunnelStage::Bottom, "purchase")
}

pub fn payload_of(event: &Event) -> Vec<u8> {
    serde_json::to_vec(event).unwrap()
}

struct Pending {
    tag: usize,
    payload: Vec<u8>,
    delivered: u64,
}

#[derive(Default)]
struct BrokerState {
    queue: VecDeque<Pending>,
    in_flight: usize,
    next_tag: usize,
    settlements: Vec<(usize, Settlement)>,
    deliveries: HashMap<usize, u64>,
}

/// Durable-consumer fake; naked messages go back to the end of the queue.
#[derive(Clone)]
pub struct FakeBroker {
    state: Arc<Mutex<BrokerState>>,
    max_deliver: u64,
    fail_fetches: Arc<AtomicUsize>,
    fail_ack: Arc<AtomicBool>,
    empty_batches: Arc<AtomicBool>,
    fetch_calls: Arc<AtomicUsize>,
}

impl FakeBroker {
    pub fn new(max_deliver: u64) -> Self {
        Self {
            state: Arc::new(Mutex::new(BrokerState::default())),
            max_deliver,
            fail_fetches: Arc::new(AtomicUsize::new(0)),
            fail_ack: Arc::new(AtomicBool::new(false)),
            empty_batches: Arc::new(AtomicBool::new(false)),
            fetch_calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Enqueue a payload; returns its tag
    pub fn push(&self, payload: Vec<u8>) -> usize {
        let mut state = self.state.lock().unwrap();
        let tag = state.next_tag;
        state.next_tag += 1;
        state.queue.push_back(Pending {
            tag,
            payload,
            delivered: 0,
        });
        tag
    }

    pub fn push_event(&self, event: &Event) -> usize {
        self.push(payload_of(event))
    }

    /// Make the next `n` fetches fail with a broker fault
    pub fn fail_next_fetches(&self, n: usize) {
        self.fail_fetches.store(n, Ordering::SeqCst);
    }

    /// Answer an empty queue with `Ok(vec![])` instead of `FetchError::Idle`
    pub fn idle_as_empty_batch(&self, empty: bool) {
        self.empty_batches.store(empty, Ordering::SeqCst);
    }

    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    pub fn fail_acks(&self, fail: bool) {
        self.fail_ack.store(fail, Ordering::SeqCst);
    }

    pub fn settlements(&self, tag: usize) -> Vec<Settlement> {
        self.state
            .lock()
            .unwrap()
            .settlements
            .iter()
            .filter(|(t, _)| *t == tag)
            .map(|(_, s)| *s)
            .collect()
    }

    pub fn deliveries(&self, tag: usize) -> u64 {
        self.state
            .lock()
            .unwrap()
            .deliveries
            .get(&tag)
            .copied()
            .unwrap_or(0)
    }

    pub fn queued(&self) -> usize {
        self.state.lock().unwrap().queue.len()
    }

    /// Fetch and hand out a batch directly, bypassing the trait
    pub fn take(&self, max: usize) -> Vec<FakeMessage> {
        let mut state = self.state.lock().unwrap();
        let mut batch = Vec::new();
        while batch.len() < max {
            let Some(mut pending) = state.queue.pop_front() else {
                break;
            };
            pending.delivered += 1;
            state.deliveries.insert(pending.tag, pending.delivered);
            state.in_flight += 1;
            batch.push(FakeMessage {
                tag: pending.tag,
                payload: pending.payload,
                delivered: pending.delivered,
                broker: self.clone(),
            });
        }
        batch
    }

    fn settle(&self, message: &FakeMessage, settlement: Settlement) -> BrokerResult<()> {
        if self.fail_ack.load(Ordering::SeqCst) {
            return Err(BrokerError::Ack("connection closed".into()));
        }

        let mut state = self.state.lock().unwrap();
        state.settlements.push((message.tag, settlement));
        state.in_flight = state.in_flight.saturating_sub(1);

        if settlement == Settlement::Nak && message.delivered < self.max_deliver {
            state.queue.push_back(Pending {
                tag: message.tag,
                payload: message.payload.clone(),
                delivered: message.delivered,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl MessageSource for FakeBroker {
    type Message = FakeMessage;

    async fn fetch(
        &self,
        max_messages: usize,
        _expires: Duration,
    ) -> Result<Vec<FakeMessage>, FetchError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);

        let remaining = self.fail_fetches.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_fetches.store(remaining - 1, Ordering::SeqCst);
            return Err(FetchError::Broker("connection refused".into()));
        }

        let batch = self.take(max_messages);
        if batch.is_empty() && !self.empty_batches.load(Ordering::SeqCst) {
            return Err(FetchError::Idle);
        }
        Ok(batch)
    }

    async fn status(&self) -> BrokerResult<ConsumerStatus> {
        let state = self.state.lock().unwrap();
        Ok(ConsumerStatus {
            pending: state.queue.len() as u64,
            ack_pending: state.in_flight as u64,
        })
    }
}

pub struct FakeMessage {
    pub tag: usize,
    payload: Vec<u8>,
    delivered: u64,
    broker: FakeBroker,
}

#[async_trait]
impl InboundMessage for FakeMessage {
    fn payload(&self) -> &[u8] {
        &self.payload
    }

    fn delivery_count(&self) -> u64 {
        self.delivered
    }

    async fn ack(&self) -> BrokerResult<()> {
        self.broker.settle(self, Settlement::Ack)
    }

    async fn nak(&self) -> BrokerResult<()> {
        self.broker.settle(self, Settlement::Nak)
    }

    async fn term(&self) -> BrokerResult<()> {
        self.broker.settle(self, Settlement::Term)
    }
}

/// Store fake with the same conflict-ignore semantics as the Postgres store
#[derive(Default)]
pub struct FakeStore {
    rows: Mutex<HashMap<String, Event>>,
    fail_batch: AtomicBool,
    failing_ids: Mutex<HashSet<String>>,
    single_delay: Mutex<Option<Duration>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    single_calls: AtomicUsize,
    batch_calls: AtomicUsize,
}

impl FakeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_batches(&self, fail: bool) {
        self.fail_batch.store(fail, Ordering::SeqCst);
    }

    /// Every insert of this identity fails with a transient error
    pub fn fail_event(&self, event_id: &str) {
        self.failing_ids
            .lock()
            .unwrap()
            .insert(event_id.to_string());
    }

    pub fn recover_event(&self, event_id: &str) {
        self.failing_ids.lock().unwrap().remove(event_id);
    }

    pub fn slow_single_inserts(&self, delay: Duration) {
        *self.single_delay.lock().unwrap() = Some(delay);
    }

    pub fn seed(&self, event: &Event) {
        self.rows
            .lock()
            .unwrap()
            .insert(event.event_id.clone(), event.clone());
    }

    pub fn row_count(&self) -> usize {
        self.rows.lock().unwrap().len()
    }

    pub fn contains(&self, event_id: &str) -> bool {
        self.rows.lock().unwrap().contains_key(event_id)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn single_calls(&self) -> usize {
        self.single_calls.load(Ordering::SeqCst)
    }

    pub fn batch_calls(&self) -> usize {
        self.batch_calls.load(Ordering::SeqCst)
    }

    fn is_failing(&self, event_id: &str) -> bool {
        self.failing_ids.lock().unwrap().contains(event_id)
    }

    fn transient_error() -> StoreError {
        StoreError::Database(sqlx::Error::PoolTimedOut)
    }
}

#[async_trait]
impl EventRepository for FakeStore {
    async fn insert_one(&self, event: &Event) -> StoreResult<InsertOutcome> {
        self.single_calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let delay = *self.single_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let result = if self.is_failing(&event.event_id) {
            Err(Self::transient_error())
        } else {
            let mut rows = self.rows.lock().unwrap();
            if rows.contains_key(&event.event_id) {
                Ok(InsertOutcome::Duplicate)
            } else {
                rows.insert(event.event_id.clone(), event.clone());
                Ok(InsertOutcome::Inserted)
            }
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn insert_batch(&self, events: &[Event]) -> StoreResult<BatchInsertSummary> {
        self.batch_calls.fetch_add(1, Ordering::SeqCst);
        if events.is_empty() {
            return Ok(BatchInsertSummary::default());
        }
        if self.fail_batch.load(Ordering::SeqCst)
            || events.iter().any(|e| self.is_failing(&e.event_id))
        {
            return Err(Self::transient_error());
        }

        let mut rows = self.rows.lock().unwrap();
        let mut inserted_ids = HashSet::new();
        for event in events {
            if !rows.contains_key(&event.event_id) {
                rows.insert(event.event_id.clone(), event.clone());
                inserted_ids.insert(event.event_id.clone());
            }
        }

        Ok(BatchInsertSummary {
            requested: events.len(),
            inserted_ids,
        })
    }
}

/// Records published payloads; can be switched to fail
#[derive(Default)]
pub struct FakePublisher {
    sent: Mutex<Vec<(String, Bytes)>>,
    fail: AtomicBool,
}

impl FakePublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<(String, Bytes)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_to(&self, subject: &str) -> Vec<serde_json::Value> {
        self.sent()
            .into_iter()
            .filter(|(s, _)| s == subject)
            .map(|(_, payload)| serde_json::from_slice(&payload).unwrap())
            .collect()
    }
}

#[async_trait]
impl BrokerPublisher for FakePublisher {
    async fn publish(&self, subject: String, payload: Bytes) -> BrokerResult<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(BrokerError::Publish("no responders available".into()));
        }
        self.sent.lock().unwrap().push((subject, payload));
        Ok(())
    }
}

pub type TestProcessor = BatchProcessor<FakeBroker, FakeStore, FakePublisher>;

pub struct Harness {
    pub broker: FakeBroker,
    pub store: Arc<FakeStore>,
    pub publisher: Arc<FakePublisher>,
    pub metrics: PipelineMetrics,
    pub processor: Arc<TestProcessor>,
}

impl Harness {
    pub fn new(config: ConsumerConfig) -> Self {
        let broker = FakeBroker::new(config.max_deliver);
        let store = Arc::new(FakeStore::new());
        let publisher = Arc::new(FakePublisher::new());
        let metrics = PipelineMetrics::new(&Registry::new());

        let processor = Arc::new(BatchProcessor::new(
            Arc::new(broker.clone()),
            Arc::clone(&store),
            DeadLetterRouter::new(Arc::clone(&publisher), DLQ_SUBJECT, config.max_deliver),
            metrics.clone(),
            config,
        ));

        Self {
            broker,
            store,
            publisher,
            metrics,
            processor,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(test_config())
    }

    /// Fetch and process one batch through the processor
    pub async fn cycle(&self) -> events_service::BatchReport {
        let batch = self.broker.take(self.processor.config().batch_size);
        self.processor.process_batch(batch).await
    }

    pub fn processed(&self, source: &str) -> u64 {
        self.metrics.processed.with_label_values(&[source]).get()
    }

    pub fn duplicates(&self, source: &str) -> u64 {
        self.metrics.duplicate.with_label_values(&[source]).get()
    }

    pub fn failed(&self, source: &str, reason: &str) -> u64 {
        self.metrics
            .failed
            .with_label_values(&[source, reason])
            .get()
    }
}

pub fn test_config() -> ConsumerConfig {
    ConsumerConfig {
        batch_size: 100,
        concurrency: 4,
        max_deliver: 5,
        fetch_expires_ms: 50,
        retry_backoff_ms: 10,
        metrics_interval_ms: 10,
        ..Default::default()
    }
}
