//! Kafka stream publisher.
//!
//! Uses one idempotent `FutureProducer` shared by all tasks. The event id is
//! the record key, so every retry of an event lands on the same partition
//! and the broker can drop duplicates.

use std::time::Duration;

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::types::{BrokerKind, OutboundMessage, PublishTarget, HEADER_CONTENT_TYPE};
use super::BrokerPublisher;
use crate::config::KafkaSettings;
use crate::error::DeliveryError;

/// Publishes to the stream broker.
pub struct StreamPublisher {
    producer: FutureProducer,
    publish_timeout: Duration,
}

impl StreamPublisher {
    /// Build the producer. librdkafka connects in the background, so this
    /// only fails on invalid client configuration.
    pub fn new(settings: &KafkaSettings, publish_timeout: Duration) -> Result<Self, KafkaError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &settings.brokers)
            .set("client.id", &settings.client_id)
            .set("enable.idempotence", "true")
            .set("acks", "all")
            .set("message.timeout.ms", publish_timeout.as_millis().to_string())
            .create()?;

        info!(brokers = %settings.brokers, "kafka_producer_created");

        Ok(Self {
            producer,
            publish_timeout,
        })
    }
}

#[async_trait]
impl BrokerPublisher for StreamPublisher {
    fn kind(&self) -> BrokerKind {
        BrokerKind::Stream
    }

    async fn publish(
        &self,
        target: &PublishTarget,
        message: &OutboundMessage,
    ) -> Result<(), DeliveryError> {
        let headers = record_headers(message);

        let record = FutureRecord::to(&target.destination)
            .key(message.event_id())
            .payload(&message.body[..])
            .headers(headers);

        let timeout_ms = self.publish_timeout.as_millis() as u64;

        let delivery = timeout(
            self.publish_timeout,
            self.producer.send(record, Timeout::After(self.publish_timeout)),
        )
        .await
        .map_err(|_| DeliveryError::timeout(timeout_ms))?
        .map_err(|(error, _)| classify_kafka_error(&error, &target.destination, timeout_ms))?;

        debug!(
            topic = %target.destination,
            event_id = %message.event_id(),
            delivery = ?delivery,
            body_length = message.body.len(),
            "kafka_published"
        );

        Ok(())
    }

    async fn ping(&self) -> Result<(), DeliveryError> {
        let producer = self.producer.clone();
        let wait = self.publish_timeout;

        let metadata = tokio::task::spawn_blocking(move || {
            producer.client().fetch_metadata(None, Timeout::After(wait))
        })
        .await
        .map_err(|e| DeliveryError::connection(e.to_string()))?
        .map_err(|e| classify_kafka_error(&e, "", wait.as_millis() as u64))?;

        if metadata.brokers().is_empty() {
            return Err(DeliveryError::connection("no kafka brokers in metadata"));
        }

        Ok(())
    }

    async fn close(&self) {
        let producer = self.producer.clone();
        let wait = self.publish_timeout;

        match tokio::task::spawn_blocking(move || producer.flush(Timeout::After(wait))).await {
            Ok(Ok(())) => info!("kafka_producer_flushed"),
            Ok(Err(e)) => warn!(error = %e, "kafka_flush_error"),
            Err(e) => warn!(error = %e, "kafka_flush_join_error"),
        }
    }
}

/// Sort a Kafka error into the delivery taxonomy.
fn classify_kafka_error(error: &KafkaError, destination: &str, timeout_ms: u64) -> DeliveryError {
    match error.rdkafka_error_code() {
        Some(RDKafkaErrorCode::MessageTimedOut) => DeliveryError::timeout(timeout_ms),
        Some(RDKafkaErrorCode::QueueFull) => DeliveryError::backpressure(error.to_string()),
        Some(RDKafkaErrorCode::UnknownTopicOrPartition) | Some(RDKafkaErrorCode::UnknownTopic) => {
            DeliveryError::unknown_destination(destination)
        }
        Some(RDKafkaErrorCode::TopicAuthorizationFailed)
        | Some(RDKafkaErrorCode::ClusterAuthorizationFailed) => {
            DeliveryError::unauthorized(error.to_string())
        }
        Some(RDKafkaErrorCode::MessageSizeTooLarge) | Some(RDKafkaErrorCode::InvalidMessage) => {
            DeliveryError::rejected(error.to_string())
        }
        _ => DeliveryError::connection(error.to_string()),
    }
}

/// Event headers plus the payload content type.
fn record_headers(message: &OutboundMessage) -> OwnedHeaders {
    message
        .headers
        .pairs()
        .into_iter()
        .chain([(HEADER_CONTENT_TYPE, message.content_type.as_str())])
        .fold(OwnedHeaders::new(), |headers, (key, value)| {
            headers.insert(Header {
                key,
                value: Some(value),
            })
        })
}
