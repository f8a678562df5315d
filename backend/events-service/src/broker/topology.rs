//! Stream and durable consumer provisioning.
//!
//! Several service instances may start at once, so a failed create is
//! followed by a lookup: if the resource exists by then, another instance won
//! the race and the lookup result is used. Existing resources are never
//! reconfigured here.

use async_nats::jetstream::{
    self,
    consumer::{pull, AckPolicy, DeliverPolicy, PullConsumer},
    stream,
};
use tracing::{info, warn};

use super::{BrokerError, BrokerResult};
use crate::config::{BrokerConfig, ConsumerConfig};

/// Stream holding all event subjects
pub fn stream_config(broker: &BrokerConfig) -> stream::Config {
    stream::Config {
        name: broker.stream.clone(),
        subjects: vec![broker.subject_filter()],
        retention: stream::RetentionPolicy::Limits,
        max_age: broker.stream_max_age(),
        max_bytes: broker.stream_max_bytes,
        storage: stream::StorageType::File,
        ..Default::default()
    }
}

/// Durable pull consumer over every event subject
pub fn consumer_config(broker: &BrokerConfig, consumer: &ConsumerConfig) -> pull::Config {
    pull::Config {
        durable_name: Some(broker.durable_name.clone()),
        ack_policy: AckPolicy::Explicit,
        ack_wait: consumer.ack_wait(),
        max_deliver: i64::try_from(consumer.max_deliver).unwrap_or(i64::MAX),
        max_ack_pending: consumer.max_ack_pending,
        deliver_policy: DeliverPolicy::All,
        filter_subject: broker.subject_filter(),
        ..Default::default()
    }
}

/// Stream capturing the dead-letter subject, kept apart from the event
/// stream so quarantined events are never consumed again
pub fn dead_letter_stream_config(broker: &BrokerConfig) -> stream::Config {
    stream::Config {
        name: broker.dlq_stream.clone(),
        subjects: vec![broker.dlq_subject.clone()],
        retention: stream::RetentionPolicy::Limits,
        max_age: broker.stream_max_age(),
        max_bytes: broker.stream_max_bytes,
        storage: stream::StorageType::File,
        ..Default::default()
    }
}

async fn ensure_stream(
    context: &jetstream::Context,
    config: stream::Config,
) -> BrokerResult<stream::Stream> {
    let name = config.name.clone();
    let subjects = config.subjects.join(",");

    let stream = match context.get_or_create_stream(config).await {
        Ok(stream) => stream,
        Err(create_err) => {
            warn!(
                stream = %name,
                error = %create_err,
                "Stream create failed, checking whether it already exists"
            );
            context.get_stream(&name).await.map_err(|e| {
                BrokerError::Topology(format!("stream {}: {} (lookup: {})", name, create_err, e))
            })?
        }
    };
    info!(stream = %name, subjects = %subjects, "JetStream stream ready");

    Ok(stream)
}

/// Create (or attach to) the event stream, the dead-letter stream and the
/// durable consumer.
pub async fn ensure_topology(
    context: &jetstream::Context,
    broker: &BrokerConfig,
    consumer: &ConsumerConfig,
) -> BrokerResult<PullConsumer> {
    let stream = ensure_stream(context, stream_config(broker)).await?;
    ensure_stream(context, dead_letter_stream_config(broker)).await?;

    let pull_consumer = match stream
        .get_or_create_consumer(&broker.durable_name, consumer_config(broker, consumer))
        .await
    {
        Ok(pull_consumer) => pull_consumer,
        Err(create_err) => {
            warn!(
                durable = %broker.durable_name,
                error = %create_err,
                "Consumer create failed, checking whether it already exists"
            );
            stream
                .get_consumer::<pull::Config>(&broker.durable_name)
                .await
                .map_err(|e| {
                    BrokerError::Topology(format!(
                        "consumer {}: {} (lookup: {})",
                        broker.durable_name, create_err, e
                    ))
                })?
        }
    };
    info!(
        durable = %broker.durable_name,
        max_deliver = consumer.max_deliver,
        ack_wait_secs = consumer.ack_wait_secs,
        "JetStream consumer ready"
    );

    Ok(pull_consumer)
}
