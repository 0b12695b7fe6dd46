//! Inbound webhook event, the unit of work relayed by the pipeline.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Content type assumed when the sender does not declare one.
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// An authenticated, deserialized webhook notification.
///
/// Immutable once built: the identifier in particular must stay the same
/// across every publish retry so brokers can deduplicate.
#[derive(Debug, Clone)]
pub struct WebhookEvent {
    id: String,
    event_type: String,
    payload: Bytes,
    received_at: DateTime<Utc>,
    trace_id: String,
    content_type: String,
}

impl WebhookEvent {
    /// Start building an event of the given type carrying `payload`.
    pub fn builder(event_type: impl Into<String>, payload: impl Into<Bytes>) -> WebhookEventBuilder {
        WebhookEventBuilder {
            id: None,
            event_type: event_type.into(),
            payload: payload.into(),
            received_at: None,
            trace_id: None,
            content_type: None,
        }
    }

    /// Idempotency key.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Routing key for the routing table.
    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    /// Raw payload bytes. Never reinterpreted by the gateway.
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn received_at(&self) -> DateTime<Utc> {
        self.received_at
    }

    /// Correlation identifier propagated from the inbound request.
    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    /// Media type declared by the sender, passed through to the brokers.
    pub fn content_type(&self) -> &str {
        &self.content_type
    }
}

/// Builder for [`WebhookEvent`]. Missing identifiers are synthesized.
#[derive(Debug)]
pub struct WebhookEventBuilder {
    id: Option<String>,
    event_type: String,
    payload: Bytes,
    received_at: Option<DateTime<Utc>>,
    trace_id: Option<String>,
    content_type: Option<String>,
}

impl WebhookEventBuilder {
    /// Use the sender-assigned identifier. Blank values are ignored.
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = non_blank(id.into());
        self
    }

    /// Propagate an existing trace identifier. Blank values are ignored.
    pub fn trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = non_blank(trace_id.into());
        self
    }

    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = non_blank(content_type.into());
        self
    }

    pub fn received_at(mut self, received_at: DateTime<Utc>) -> Self {
        self.received_at = Some(received_at);
        self
    }

    pub fn build(self) -> WebhookEvent {
        WebhookEvent {
            id: self.id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            event_type: self.event_type,
            payload: self.payload,
            received_at: self.received_at.unwrap_or_else(Utc::now),
            trace_id: self.trace_id.unwrap_or_else(|| Uuid::new_v4().simple().to_string()),
            content_type: self
                .content_type
                .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string()),
        }
    }
}

fn non_blank(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}
