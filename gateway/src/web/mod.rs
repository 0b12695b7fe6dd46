//! Web server module: the ingestion adapter in front of the pipeline.
//!
//! - `GET /health`: broker health report
//! - `POST /webhooks/:event_type`: relay the raw body to the brokers

pub mod handlers;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

pub use handlers::{
    health, ingest_webhook, respond, AppState, FailedTarget, WebhookResponse,
};

/// Build the gateway router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/webhooks/:event_type", post(ingest_webhook))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
