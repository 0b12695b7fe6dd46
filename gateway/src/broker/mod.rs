//! Broker publishers.
//!
//! This module provides:
//! - The [`BrokerPublisher`] capability shared by every broker technology
//! - An AMQP queue publisher backed by a bounded channel pool
//! - A Kafka stream publisher using an idempotent producer
//!
//! ## Architecture
//!
//! ```text
//! DeliveryPipeline → PublisherFactory → BrokerPublisher → { QueuePublisher | StreamPublisher }
//! ```

pub mod amqp;
pub mod kafka;
pub mod types;

use async_trait::async_trait;

use crate::error::DeliveryError;

pub use amqp::{AmqpChannelPool, QueuePublisher};
pub use kafka::StreamPublisher;
pub use types::{
    BrokerKind, MessageHeaders, OutboundMessage, PublishTarget, HEADER_CONTENT_TYPE, HEADER_EVENT_ID,
    HEADER_EVENT_TYPE, HEADER_RECEIVED_AT, HEADER_TRACE_ID,
};

/// Publish one message to one broker.
///
/// Implementations suspend until the broker acknowledges or their own
/// publish timeout elapses. They never deduplicate; the stable event id in
/// the headers is what lets the broker do that.
#[async_trait]
pub trait BrokerPublisher: Send + Sync {
    /// Broker technology this publisher talks to.
    fn kind(&self) -> BrokerKind;

    /// Publish `message` to `target`, waiting for the broker acknowledgement.
    async fn publish(
        &self,
        target: &PublishTarget,
        message: &OutboundMessage,
    ) -> Result<(), DeliveryError>;

    /// Cheap connectivity check. Must not publish anything.
    async fn ping(&self) -> Result<(), DeliveryError>;

    /// Release broker connections.
    async fn close(&self) {}
}
