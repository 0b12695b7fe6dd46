//! Webhook Gateway - relays inbound platform webhooks onto message brokers.
//!
//! Each inbound event is routed to one or more broker targets (RabbitMQ
//! queues, Kafka topics) and published with bounded, per-target retries.
//!
//! ## Architecture
//!
//! ```text
//! Webhook → web::ingest_webhook → DeliveryPipeline → PublisherFactory
//!                                        │
//!                       ┌────────────────┴────────────────┐
//!                       ▼                                 ▼
//!               QueuePublisher (AMQP)            StreamPublisher (Kafka)
//! ```

pub mod broker;
pub mod config;
pub mod error;
pub mod event;
pub mod health;
pub mod pipeline;
pub mod retry;
pub mod routing;
pub mod telemetry;
pub mod web;

// Re-export commonly used types
pub use broker::{BrokerKind, BrokerPublisher, OutboundMessage, PublishTarget};
pub use config::Config;
pub use error::{ConfigurationError, DeliveryError};
pub use event::WebhookEvent;
pub use health::{HealthCheck, HealthReport, HealthStatus};
pub use pipeline::{DeliveryOutcome, DeliveryPipeline, FailureCause, TargetReport};
pub use retry::RetryPolicy;
pub use routing::{FeatureFlags, FlagSet, PublisherFactory, RoutingTable};
pub use web::AppState;
