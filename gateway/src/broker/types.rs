//! Broker-facing types shared by every publisher.
//!
//! This module defines:
//! - [`BrokerKind`]: which broker technology a target lives on
//! - [`PublishTarget`]: one resolved destination for an event
//! - [`OutboundMessage`]: the payload plus headers actually sent

use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::event::WebhookEvent;

/// Header carrying the event identifier (idempotency key).
pub const HEADER_EVENT_ID: &str = "event-id";

/// Header carrying the event type.
pub const HEADER_EVENT_TYPE: &str = "event-type";

/// Header carrying the propagated trace identifier.
pub const HEADER_TRACE_ID: &str = "trace-id";

/// Header carrying the RFC 3339 receive timestamp.
pub const HEADER_RECEIVED_AT: &str = "received-at";

/// Stream record header carrying the payload media type. Queue messages use
/// the AMQP content-type property instead.
pub const HEADER_CONTENT_TYPE: &str = "content-type";

/// Broker technology behind a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerKind {
    /// AMQP queue broker (RabbitMQ)
    Queue,
    /// Log-structured stream broker (Kafka)
    Stream,
}

impl BrokerKind {
    pub const ALL: [BrokerKind; 2] = [BrokerKind::Queue, BrokerKind::Stream];

    pub fn as_str(&self) -> &'static str {
        match self {
            BrokerKind::Queue => "queue",
            BrokerKind::Stream => "stream",
        }
    }
}

impl fmt::Display for BrokerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BrokerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "queue" | "amqp" | "rabbitmq" => Ok(BrokerKind::Queue),
            "stream" | "kafka" => Ok(BrokerKind::Stream),
            other => Err(format!("unknown broker kind '{}'", other)),
        }
    }
}

/// One destination an event is published to.
///
/// For queue targets the destination is the AMQP routing key (the queue
/// name on the default exchange). For stream targets it is the topic.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PublishTarget {
    pub kind: BrokerKind,
    pub destination: String,
}

impl PublishTarget {
    pub fn new(kind: BrokerKind, destination: impl Into<String>) -> Self {
        Self {
            kind,
            destination: destination.into(),
        }
    }

    pub fn queue(destination: impl Into<String>) -> Self {
        Self::new(BrokerKind::Queue, destination)
    }

    pub fn stream(destination: impl Into<String>) -> Self {
        Self::new(BrokerKind::Stream, destination)
    }
}

impl fmt::Display for PublishTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.destination)
    }
}

impl FromStr for PublishTarget {
    type Err = String;

    /// Parse `kind:destination`, e.g. `stream:payments`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, destination) = s
            .split_once(':')
            .ok_or_else(|| format!("expected kind:destination, got '{}'", s))?;
        let destination = destination.trim();
        if destination.is_empty() {
            return Err(format!("empty destination in '{}'", s));
        }
        Ok(PublishTarget::new(kind.parse()?, destination))
    }
}

/// Headers attached to every published message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageHeaders {
    pub event_id: String,
    pub event_type: String,
    pub trace_id: String,
    pub received_at: String,
}

impl MessageHeaders {
    /// Header name/value pairs in a stable order.
    pub fn pairs(&self) -> [(&'static str, &str); 4] {
        [
            (HEADER_EVENT_ID, self.event_id.as_str()),
            (HEADER_EVENT_TYPE, self.event_type.as_str()),
            (HEADER_TRACE_ID, self.trace_id.as_str()),
            (HEADER_RECEIVED_AT, self.received_at.as_str()),
        ]
    }
}

/// Serialized form of an event, built once and shared by all targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub body: Bytes,
    pub headers: MessageHeaders,
    pub content_type: String,
}

impl OutboundMessage {
    /// Wrap an event's payload. The body is shared, not copied.
    pub fn from_event(event: &WebhookEvent) -> Self {
        Self {
            body: event.payload().clone(),
            headers: MessageHeaders {
                event_id: event.id().to_string(),
                event_type: event.event_type().to_string(),
                trace_id: event.trace_id().to_string(),
                received_at: event.received_at().to_rfc3339(),
            },
            content_type: event.content_type().to_string(),
        }
    }

    pub fn event_id(&self) -> &str {
        &self.headers.event_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_target() {
        let target: PublishTarget = "stream:payments".parse().unwrap();
        assert_eq!(target, PublishTarget::stream("payments"));

        let target: PublishTarget = "rabbitmq: payments.q".parse().unwrap();
        assert_eq!(target, PublishTarget::queue("payments.q"));
    }

    #[test]
    fn test_parse_target_invalid() {
        assert!("payments".parse::<PublishTarget>().is_err());
        assert!("queue:".parse::<PublishTarget>().is_err());
        assert!("sqs:payments".parse::<PublishTarget>().is_err());
    }

    #[test]
    fn test_target_display() {
        assert_eq!(PublishTarget::queue("orders").to_string(), "queue:orders");
    }

    #[test]
    fn test_message_carries_event_headers() {
        let event = WebhookEvent::builder("payment.completed", "{\"a\":1}")
            .id("evt-1")
            .trace_id("trace-1")
            .build();

        let message = OutboundMessage::from_event(&event);

        assert_eq!(message.event_id(), "evt-1");
        assert_eq!(message.body.as_ref(), b"{\"a\":1}");
        let pairs = message.headers.pairs();
        assert_eq!(pairs[0], (HEADER_EVENT_ID, "evt-1"));
        assert_eq!(pairs[1], (HEADER_EVENT_TYPE, "payment.completed"));
        assert_eq!(pairs[2], (HEADER_TRACE_ID, "trace-1"));
        assert_eq!(message.content_type, "application/octet-stream");
    }

    #[test]
    fn test_message_keeps_sender_content_type() {
        let event = WebhookEvent::builder("payment.completed", "<a/>")
            .content_type("application/xml")
            .build();

        assert_eq!(OutboundMessage::from_event(&event).content_type, "application/xml");
    }
}
