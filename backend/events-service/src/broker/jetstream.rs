//! `async-nats` JetStream implementations of the broker traits

use async_nats::jetstream::{self, consumer::PullConsumer, AckKind};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{
    BrokerError, BrokerPublisher, BrokerResult, ConsumerStatus, FetchError, InboundMessage,
    MessageSource,
};

const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Connect to NATS.
///
/// The initial connection must succeed (startup fails otherwise); after that
/// the client reconnects indefinitely, one second apart.
pub async fn connect(url: &str, client_name: &str) -> BrokerResult<async_nats::Client> {
    info!(url = %url, "Connecting to NATS");

    let client = async_nats::ConnectOptions::new()
        .name(client_name)
        .reconnect_delay_callback(|_attempts| RECONNECT_DELAY)
        .event_callback(|event| async move {
            match event {
                async_nats::Event::Disconnected => warn!("NATS connection lost, reconnecting"),
                async_nats::Event::Connected => info!("NATS connection (re)established"),
                other => debug!(event = %other, "NATS client event"),
            }
        })
        .connect(url)
        .await
        .map_err(|e| BrokerError::Connect(e.to_string()))?;

    info!("Connected to NATS");
    Ok(client)
}

/// Publishes through a JetStream context, waiting for the stream's ack.
#[derive(Clone)]
pub struct JetStreamPublisher {
    context: jetstream::Context,
}

impl JetStreamPublisher {
    pub fn new(context: jetstream::Context) -> Self {
        Self { context }
    }
}

#[async_trait]
impl BrokerPublisher for JetStreamPublisher {
    async fn publish(&self, subject: String, payload: Bytes) -> BrokerResult<()> {
        let ack = self
            .context
            .publish(subject, payload)
            .await
            .map_err(|e| BrokerError::Publish(e.to_string()))?;

        ack.await.map_err(|e| BrokerError::Publish(e.to_string()))?;
        Ok(())
    }
}

/// A message fetched from a pull consumer
pub struct JetStreamMessage(jetstream::Message);

#[async_trait]
impl InboundMessage for JetStreamMessage {
    fn payload(&self) -> &[u8] {
        &self.0.message.payload
    }

    fn delivery_count(&self) -> u64 {
        self.0
            .info()
            .map(|info| info.delivered.max(0) as u64)
            .unwrap_or(0)
    }

    async fn ack(&self) -> BrokerResult<()> {
        self.0
            .ack()
            .await
            .map_err(|e| BrokerError::Ack(e.to_string()))
    }

    async fn nak(&self) -> BrokerResult<()> {
        self.0
            .ack_with(AckKind::Nak(None))
            .await
            .map_err(|e| BrokerError::Ack(e.to_string()))
    }

    async fn term(&self) -> BrokerResult<()> {
        self.0
            .ack_with(AckKind::Term)
            .await
            .map_err(|e| BrokerError::Ack(e.to_string()))
    }
}

/// Durable pull consumer as a [`MessageSource`]
pub struct JetStreamSource {
    consumer: PullConsumer,
}

impl JetStreamSource {
    pub fn new(consumer: PullConsumer) -> Self {
        Self { consumer }
    }
}

#[async_trait]
impl MessageSource for JetStreamSource {
    type Message = JetStreamMessage;

    async fn fetch(
        &self,
        max_messages: usize,
        expires: Duration,
    ) -> Result<Vec<JetStreamMessage>, FetchError> {
        let mut batch = self
            .consumer
            .fetch()
            .max_messages(max_messages)
            .expires(expires)
            .messages()
            .await
            .map_err(FetchError::classify)?;

        let mut messages = Vec::with_capacity(max_messages);
        while let Some(next) = batch.next().await {
            match next {
                Ok(message) => messages.push(JetStreamMessage(message)),
                // Keep what already arrived; the rest is redelivered after ack_wait
                Err(e) if !messages.is_empty() => {
                    debug!(error = %e, received = messages.len(), "Fetch ended early");
                    break;
                }
                Err(e) => return Err(FetchError::classify(e)),
            }
        }

        Ok(messages)
    }

    async fn status(&self) -> BrokerResult<ConsumerStatus> {
        // info() refreshes the consumer's cached state, so it needs a mutable handle
        let mut consumer = self.consumer.clone();
        let info = consumer
            .info()
            .await
            .map_err(|e| BrokerError::Info(e.to_string()))?;

        Ok(ConsumerStatus {
            pending: info.num_pending,
            ack_pending: info.num_ack_pending as u64,
        })
    }
}
