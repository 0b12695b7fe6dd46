//! Webhook Gateway - receives platform webhooks and relays them to the brokers.
//!
//! This binary:
//! - Builds the queue and stream publishers from configuration
//! - Serves the ingestion and health endpoints
//! - Pings brokers and reloads feature flags in the background

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::{net::TcpListener, signal};
use tracing::{info, warn};

use gateway::broker::{QueuePublisher, StreamPublisher};
use gateway::config::LogFormat;
use gateway::{
    web, AppState, Config, DeliveryPipeline, FeatureFlags, HealthCheck, PublisherFactory,
};

#[tokio::main]
async fn main() -> Result<()> {
    gateway::telemetry::init(LogFormat::from_env());

    info!("gateway_starting");

    // Load configuration
    let config = Config::from_env();
    info!(
        port = config.port,
        amqp_configured = config.amqp.is_some(),
        kafka_configured = config.kafka.is_some(),
        route_count = config.routes.len(),
        max_attempts = config.retry.max_attempts,
        event_deadline_ms = config.retry.event_deadline.as_millis() as u64,
        flags = ?config.initial_flags,
        "config_loaded"
    );

    if config.routes.is_empty() {
        warn!("no_routes_configured");
    }

    // Broker publishers, shared by every request
    let flags = Arc::new(FeatureFlags::new(config.initial_flags));
    let mut factory = PublisherFactory::new(config.routes.clone(), Arc::clone(&flags));

    if let Some(amqp) = &config.amqp {
        factory = factory.with_publisher(Arc::new(QueuePublisher::new(
            amqp,
            config.publish_timeout,
            config.pool_acquire_timeout,
        )));
        info!(exchange = %amqp.exchange, pool_size = amqp.pool_size, "queue_publisher_created");
    }

    if let Some(kafka) = &config.kafka {
        let publisher = StreamPublisher::new(kafka, config.publish_timeout)
            .context("Failed to create Kafka producer")?;
        factory = factory.with_publisher(Arc::new(publisher));
        info!("stream_publisher_created");
    }

    let factory = Arc::new(factory);

    let health = Arc::new(HealthCheck::new(config.health.clone(), factory.publishers()));
    let probe_task = Arc::clone(&health).spawn_probe_loop();

    let flags_task = config.feature_flags_file.clone().map(|path| {
        info!(path = %path.display(), "feature_flags_file_watched");
        Arc::clone(&flags).spawn_reload_loop(path, config.feature_flags_refresh)
    });

    let pipeline = Arc::new(
        DeliveryPipeline::new(Arc::clone(&factory), config.retry.clone())
            .with_health(Arc::clone(&health)),
    );

    let app = web::router(AppState::new(pipeline, health));

    // Bind to address
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;

    info!(address = %addr, "web_server_listening");

    // Run server with graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    probe_task.abort();
    if let Some(task) = flags_task {
        task.abort();
    }

    // Close broker connections
    factory.close().await;

    info!("gateway_shutdown_complete");

    Ok(())
}

/// Create a future that completes when a shutdown signal is received.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }

    info!("gateway_shutting_down");
}
