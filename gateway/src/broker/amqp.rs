//! AMQP queue publisher.
//!
//! A single connection is shared by a bounded pool of confirm-mode channels.
//! The pool can be used from many tasks at once; acquiring a channel waits
//! for at most the configured acquire timeout.

use std::collections::HashSet;
use std::ops::Deref;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use lapin::{
    options::{BasicPublishOptions, ConfirmSelectOptions, QueueDeclareOptions},
    protocol::{AMQPErrorKind, AMQPSoftError},
    publisher_confirm::Confirmation,
    types::{AMQPValue, FieldTable, LongString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use tokio::sync::{RwLock, RwLockReadGuard, Semaphore, SemaphorePermit};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::types::{BrokerKind, OutboundMessage, PublishTarget};
use super::BrokerPublisher;
use crate::config::AmqpSettings;
use crate::error::DeliveryError;

/// Bounded pool of publisher-confirm channels over one AMQP connection.
///
/// The connection is opened lazily and re-opened when the broker drops it.
pub struct AmqpChannelPool {
    url: String,
    acquire_timeout: Duration,
    permits: Semaphore,
    connection: RwLock<Option<Connection>>,
    idle: Mutex<Vec<Channel>>,
    declared: Mutex<HashSet<String>>,
}

/// A channel checked out of the pool. Returned to the pool on drop if it is
/// still open.
pub struct PooledChannel<'a> {
    pool: &'a AmqpChannelPool,
    channel: Channel,
    _permit: SemaphorePermit<'a>,
}

impl Deref for PooledChannel<'_> {
    type Target = Channel;

    fn deref(&self) -> &Channel {
        &self.channel
    }
}

impl Drop for PooledChannel<'_> {
    fn drop(&mut self) {
        if self.channel.status().connected() {
            lock(&self.pool.idle).push(self.channel.clone());
        }
    }
}

impl AmqpChannelPool {
    /// Create a pool allowing at most `size` channels in use at once.
    pub fn new(url: String, size: usize, acquire_timeout: Duration) -> Self {
        Self {
            url,
            acquire_timeout,
            permits: Semaphore::new(size),
            connection: RwLock::new(None),
            idle: Mutex::new(Vec::with_capacity(size)),
            declared: Mutex::new(HashSet::new()),
        }
    }

    /// Check out a channel, waiting at most the acquire timeout.
    pub async fn acquire(&self) -> Result<PooledChannel<'_>, DeliveryError> {
        let waited_ms = self.acquire_timeout.as_millis() as u64;

        let permit = match timeout(self.acquire_timeout, self.permits.acquire()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(DeliveryError::connection("channel pool closed")),
            Err(_) => {
                warn!(waited_ms, "amqp_pool_exhausted");
                return Err(DeliveryError::PoolExhausted { waited_ms });
            }
        };

        let reused = {
            let mut idle = lock(&self.idle);
            let mut found = None;
            while let Some(channel) = idle.pop() {
                if channel.status().connected() {
                    found = Some(channel);
                    break;
                }
            }
            found
        };

        let channel = match reused {
            Some(channel) => channel,
            None => timeout(self.acquire_timeout, self.open_channel())
                .await
                .map_err(|_| DeliveryError::timeout(waited_ms))??,
        };

        Ok(PooledChannel {
            pool: self,
            channel,
            _permit: permit,
        })
    }

    /// Return a read guard over a live connection, reconnecting if needed.
    async fn connection(&self) -> Result<RwLockReadGuard<'_, Option<Connection>>, DeliveryError> {
        {
            let guard = self.connection.read().await;
            if is_connected(&guard) {
                return Ok(guard);
            }
        }

        let mut guard = self.connection.write().await;

        // Double-check after acquiring write lock
        if !is_connected(&guard) {
            info!("amqp_connecting");

            let conn = Connection::connect(&self.url, ConnectionProperties::default())
                .await
                .map_err(|e| classify_lapin_error(e, None))?;

            info!("amqp_connected");

            // Fresh connection: stale channels and declarations no longer apply
            lock(&self.idle).clear();
            lock(&self.declared).clear();
            *guard = Some(conn);
        }

        Ok(guard.downgrade())
    }

    async fn open_channel(&self) -> Result<Channel, DeliveryError> {
        let guard = self.connection().await?;
        let conn = guard
            .as_ref()
            .ok_or_else(|| DeliveryError::connection("connection unavailable"))?;

        let channel = conn
            .create_channel()
            .await
            .map_err(|e| classify_lapin_error(e, None))?;

        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| classify_lapin_error(e, None))?;

        debug!(channel_id = channel.id(), "amqp_channel_opened");

        Ok(channel)
    }

    /// Declare a durable queue the first time it is used on this connection.
    async fn declare_once(&self, channel: &Channel, queue: &str) -> Result<(), DeliveryError> {
        if lock(&self.declared).contains(queue) {
            return Ok(());
        }

        channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| classify_lapin_error(e, Some(queue)))?;

        info!(queue = queue, "amqp_queue_declared");
        lock(&self.declared).insert(queue.to_string());

        Ok(())
    }

    /// Succeeds when a live connection exists or can be opened.
    pub async fn ping(&self) -> Result<(), DeliveryError> {
        let _connection = timeout(self.acquire_timeout, self.connection())
            .await
            .map_err(|_| DeliveryError::timeout(self.acquire_timeout.as_millis() as u64))??;
        Ok(())
    }

    /// Close idle channels and the connection gracefully.
    pub async fn close(&self) {
        self.permits.close();

        let channels: Vec<Channel> = lock(&self.idle).drain(..).collect();
        for channel in channels {
            if let Err(e) = channel.close(200, "Normal shutdown").await {
                warn!(error = %e, "amqp_channel_close_error");
            }
        }

        let mut connection = self.connection.write().await;
        if let Some(conn) = connection.take() {
            if let Err(e) = conn.close(200, "Normal shutdown").await {
                warn!(error = %e, "amqp_connection_close_error");
            }
        }

        info!("amqp_pool_closed");
    }
}

/// Publishes to the queue broker through an [`AmqpChannelPool`].
pub struct QueuePublisher {
    pool: AmqpChannelPool,
    exchange: String,
    publish_timeout: Duration,
    declare_queues: bool,
}

impl QueuePublisher {
    /// Create a publisher. No connection is made until the first publish or ping.
    pub fn new(settings: &AmqpSettings, publish_timeout: Duration, acquire_timeout: Duration) -> Self {
        Self {
            pool: AmqpChannelPool::new(settings.url.clone(), settings.pool_size, acquire_timeout),
            exchange: settings.exchange.clone(),
            publish_timeout,
            // Routing keys only name queues on the default exchange
            declare_queues: settings.declare_queues && settings.exchange.is_empty(),
        }
    }

    async fn publish_confirmed(
        &self,
        channel: &Channel,
        target: &PublishTarget,
        message: &OutboundMessage,
    ) -> Result<(), DeliveryError> {
        if self.declare_queues {
            self.pool.declare_once(channel, &target.destination).await?;
        }

        let confirmation = channel
            .basic_publish(
                &self.exchange,
                &target.destination,
                BasicPublishOptions {
                    mandatory: true,
                    ..Default::default()
                },
                &message.body,
                message_properties(message),
            )
            .await
            .map_err(|e| classify_lapin_error(e, Some(&target.destination)))?
            .await
            .map_err(|e| classify_lapin_error(e, Some(&target.destination)))?;

        classify_confirmation(confirmation, &target.destination)
    }
}

#[async_trait]
impl BrokerPublisher for QueuePublisher {
    fn kind(&self) -> BrokerKind {
        BrokerKind::Queue
    }

    async fn publish(
        &self,
        target: &PublishTarget,
        message: &OutboundMessage,
    ) -> Result<(), DeliveryError> {
        let channel = self.pool.acquire().await?;

        timeout(
            self.publish_timeout,
            self.publish_confirmed(&channel, target, message),
        )
        .await
        .map_err(|_| DeliveryError::timeout(self.publish_timeout.as_millis() as u64))??;

        debug!(
            exchange = %self.exchange,
            routing_key = %target.destination,
            event_id = %message.event_id(),
            body_length = message.body.len(),
            "amqp_published"
        );

        Ok(())
    }

    async fn ping(&self) -> Result<(), DeliveryError> {
        self.pool.ping().await
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

/// Persistent delivery plus the identifying headers.
fn message_properties(message: &OutboundMessage) -> BasicProperties {
    let mut headers = FieldTable::default();
    for (name, value) in message.headers.pairs() {
        headers.insert(name.into(), AMQPValue::LongString(LongString::from(value)));
    }

    BasicProperties::default()
        .with_delivery_mode(2) // Persistent
        .with_content_type(message.content_type.clone().into())
        .with_message_id(message.headers.event_id.clone().into())
        .with_correlation_id(message.headers.trace_id.clone().into())
        .with_timestamp(chrono::Utc::now().timestamp() as u64)
        .with_headers(headers)
}

/// Map a broker confirmation to the publish result.
///
/// With `mandatory` set, an unroutable message comes back attached to the
/// ack, which means the destination queue does not exist.
fn classify_confirmation(confirmation: Confirmation, destination: &str) -> Result<(), DeliveryError> {
    match confirmation {
        Confirmation::Ack(None) | Confirmation::NotRequested => Ok(()),
        Confirmation::Ack(Some(_)) => Err(DeliveryError::unknown_destination(destination)),
        Confirmation::Nack(_) => Err(DeliveryError::backpressure("broker nacked the message")),
    }
}

/// Sort a lapin error into the delivery taxonomy.
fn classify_lapin_error(error: lapin::Error, destination: Option<&str>) -> DeliveryError {
    match &error {
        lapin::Error::ProtocolError(amqp) => match amqp.kind() {
            AMQPErrorKind::Soft(AMQPSoftError::NOTFOUND) | AMQPErrorKind::Soft(AMQPSoftError::NOROUTE) => {
                DeliveryError::unknown_destination(destination.unwrap_or_default())
            }
            AMQPErrorKind::Soft(AMQPSoftError::ACCESSREFUSED) => {
                DeliveryError::unauthorized(error.to_string())
            }
            AMQPErrorKind::Soft(AMQPSoftError::CONTENTTOOLARGE)
            | AMQPErrorKind::Soft(AMQPSoftError::PRECONDITIONFAILED) => {
                DeliveryError::rejected(error.to_string())
            }
            _ => DeliveryError::connection(error.to_string()),
        },
        _ => DeliveryError::connection(error.to_string()),
    }
}

fn is_connected(connection: &Option<Connection>) -> bool {
    connection
        .as_ref()
        .map(|c| c.status().connected())
        .unwrap_or(false)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
