//! HTTP handlers.
//!
//! The ingest handler only builds a [`WebhookEvent`] from the request and
//! hands it to the delivery pipeline. Payload bytes are passed through
//! untouched. The HTTP status tells the sender whether to retry.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header::CONTENT_TYPE, HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::Serialize;
use tracing::info;

use crate::event::WebhookEvent;
use crate::health::{HealthCheck, HealthReport, HealthStatus};
use crate::pipeline::{DeliveryOutcome, DeliveryPipeline, FailureCause};

/// Headers that may carry the sender's idempotency key, in priority order.
const EVENT_ID_HEADERS: [&str; 2] = ["idempotency-key", "x-event-id"];

/// Headers that may carry an upstream trace id, in priority order.
const TRACE_ID_HEADERS: [&str; 2] = ["x-trace-id", "x-request-id"];

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<DeliveryPipeline>,
    pub health: Arc<HealthCheck>,
}

impl AppState {
    pub fn new(pipeline: Arc<DeliveryPipeline>, health: Arc<HealthCheck>) -> Self {
        Self { pipeline, health }
    }
}

// =============================================================================
// Health Check
// =============================================================================

/// Health endpoint. Unhealthy brokers answer 503 so orchestrators stop routing.
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let report: HealthReport = state.health.probe();

    let code = match report.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (code, Json(report))
}

// =============================================================================
// Webhook Ingestion
// =============================================================================

/// Failed target in a [`WebhookResponse`].
#[derive(Debug, Serialize)]
pub struct FailedTarget {
    pub target: String,
    pub attempts: u32,
    pub error: String,
}

/// Webhook response.
#[derive(Debug, Serialize)]
pub struct WebhookResponse {
    pub status: &'static str,
    pub event_id: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub failed_targets: Vec<FailedTarget>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Webhook endpoint: relay the raw body as an event of type `event_type`.
pub async fn ingest_webhook(
    State(state): State<AppState>,
    Path(event_type): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let mut builder = WebhookEvent::builder(event_type, body);
    if let Some(id) = first_header(&headers, &EVENT_ID_HEADERS) {
        builder = builder.id(id);
    }
    if let Some(trace_id) = first_header(&headers, &TRACE_ID_HEADERS) {
        builder = builder.trace_id(trace_id);
    }
    if let Some(content_type) = first_header(&headers, &[CONTENT_TYPE.as_str()]) {
        builder = builder.content_type(content_type);
    }
    let event = builder.build();

    info!(
        event_id = %event.id(),
        event_type = %event.event_type(),
        trace_id = %event.trace_id(),
        body_length = event.payload().len(),
        "webhook_received"
    );

    let outcome = state.pipeline.deliver(&event).await;
    let (code, response) = respond(event.id(), &outcome);

    (code, Json(response))
}

/// Map an outcome to the HTTP answer given to the sender.
///
/// Partial delivery is accepted (202): the sender retrying would re-publish
/// to targets that already have the event.
pub fn respond(event_id: &str, outcome: &DeliveryOutcome) -> (StatusCode, WebhookResponse) {
    let failed_targets = outcome
        .failed()
        .into_iter()
        .map(|r| FailedTarget {
            target: r.target.to_string(),
            attempts: r.attempts,
            error: r.error.as_ref().map(|e| e.to_string()).unwrap_or_default(),
        })
        .collect();

    let (code, error) = match outcome {
        DeliveryOutcome::Delivered { .. } => (StatusCode::OK, None),
        DeliveryOutcome::PartiallyDelivered { .. } => (StatusCode::ACCEPTED, None),
        DeliveryOutcome::Failed(FailureCause::Unroutable(e)) => {
            (StatusCode::UNPROCESSABLE_ENTITY, Some(e.to_string()))
        }
        DeliveryOutcome::Failed(FailureCause::Exhausted(_)) => (StatusCode::SERVICE_UNAVAILABLE, None),
    };

    (
        code,
        WebhookResponse {
            status: outcome.status(),
            event_id: event_id.to_string(),
            failed_targets,
            error,
        },
    )
}

fn first_header(headers: &HeaderMap, names: &[&str]) -> Option<String> {
    names
        .iter()
        .filter_map(|name| headers.get(*name))
        .filter_map(|value| value.to_str().ok())
        .map(str::trim)
        .find(|value| !value.is_empty())
        .map(str::to_string)
}
