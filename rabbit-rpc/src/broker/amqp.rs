use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use futures_util::StreamExt;
use lapin::{
    options::*,
    protocol::{AMQPErrorKind, AMQPSoftError},
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{
    Acknowledger, Broker, BrokerEvent, Delivery, DeliveryStream, ExchangeKind, ExchangeSpec,
    QueueInfo, QueueSpec,
};
use crate::envelope::Envelope;
use crate::error::{RabbitRpcError, Result};

const MAX_POOLED_CHANNELS: usize = 10;

/// Configuration for AMQP connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// AMQP broker URL (e.g., "amqp://localhost:5672")
    pub url: String,
    /// Connection timeout in milliseconds
    pub connection_timeout_ms: u64,
    /// Heartbeat interval in seconds
    pub heartbeat_seconds: u16,
    /// Number of connection retry attempts
    pub max_retries: u32,
    /// Delay between retry attempts in milliseconds
    pub retry_delay_ms: u64,
    /// Unacknowledged deliveries a consumer channel may hold
    pub prefetch_count: u16,
    /// Buffer between a broker consumer and its delivery stream
    pub delivery_buffer: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            url: "amqp://localhost:5672".to_string(),
            connection_timeout_ms: 10_000,
            heartbeat_seconds: 60,
            max_retries: 5,
            retry_delay_ms: 1_000,
            prefetch_count: 10,
            delivery_buffer: 64,
        }
    }
}

impl ConnectionConfig {
    /// The URL with `heartbeat` applied, unless the URL already sets one
    pub fn connection_uri(&self) -> String {
        if self.url.contains("heartbeat=") {
            return self.url.clone();
        }
        let separator = if self.url.contains('?') { '&' } else { '?' };
        format!("{}{}heartbeat={}", self.url, separator, self.heartbeat_seconds)
    }
}

/// Manages the AMQP connection with reconnection and a channel pool
pub struct ConnectionManager {
    config: ConnectionConfig,
    connection: RwLock<Option<Arc<Connection>>>,
    channels: Mutex<Vec<Channel>>,
}

impl ConnectionManager {
    pub fn new(url: impl Into<String>) -> Self {
        Self::with_config(ConnectionConfig {
            url: url.into(),
            ..ConnectionConfig::default()
        })
    }

    pub fn with_config(config: ConnectionConfig) -> Self {
        Self {
            config,
            connection: RwLock::new(None),
            channels: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Establish connection to RabbitMQ with retry logic
    pub async fn connect(&self) -> Result<()> {
        let mut attempts = 0;

        loop {
            match self.try_connect().await {
                Ok(connection) => {
                    info!("Connected to RabbitMQ at {}", self.config.url);
                    *self.connection.write().await = Some(Arc::new(connection));
                    return Ok(());
                }
                Err(e) => {
                    attempts += 1;
                    if attempts >= self.config.max_retries {
                        error!("Failed to connect to RabbitMQ after {} attempts: {}", attempts, e);
                        return Err(e);
                    }

                    warn!(
                        "Connection attempt {} failed, retrying in {}ms: {}",
                        attempts, self.config.retry_delay_ms, e
                    );
                    tokio::time::sleep(Duration::from_millis(self.config.retry_delay_ms)).await;
                }
            }
        }
    }

    async fn try_connect(&self) -> Result<Connection> {
        debug!("Attempting to connect to {}", self.config.url);

        let properties = ConnectionProperties::default()
            .with_connection_name(format!("rabbit-rpc-{}", Uuid::new_v4()).into());
        let uri = self.config.connection_uri();
        let connecting = Connection::connect(&uri, properties);

        match tokio::time::timeout(Duration::from_millis(self.config.connection_timeout_ms), connecting).await {
            Ok(connection) => Ok(connection?),
            Err(_) => Err(RabbitRpcError::broker_error(format!(
                "connecting to {} timed out after {}ms",
                self.config.url, self.config.connection_timeout_ms
            ))),
        }
    }

    async fn ensure_connected(&self) -> Result<Arc<Connection>> {
        {
            let guard = self.connection.read().await;
            if let Some(connection) = guard.as_ref() {
                if connection.status().connected() {
                    return Ok(connection.clone());
                }
            }
        }

        warn!("Connection lost, attempting to reconnect");
        self.connect().await?;

        self.connection
            .read()
            .await
            .as_ref()
            .cloned()
            .ok_or_else(|| RabbitRpcError::internal_error("Connection should exist after connect"))
    }

    /// Get a pooled channel or open a new one
    pub async fn get_channel(&self) -> Result<Channel> {
        {
            let mut channels = self.channels.lock().await;
            while let Some(channel) = channels.pop() {
                if channel.status().connected() {
                    return Ok(channel);
                }
            }
        }
        self.open_channel().await
    }

    /// Open a channel that is never pooled. Passive probes and consumers
    /// use these since a failed probe closes its channel.
    pub async fn open_channel(&self) -> Result<Channel> {
        let connection = self.ensure_connected().await?;
        let channel = connection.create_channel().await?;
        channel
            .basic_qos(self.config.prefetch_count, BasicQosOptions::default())
            .await?;
        debug!("Created new channel");
        Ok(channel)
    }

    pub async fn return_channel(&self, channel: Channel) {
        if channel.status().connected() {
            let mut channels = self.channels.lock().await;
            if channels.len() < MAX_POOLED_CHANNELS {
                channels.push(channel);
            }
        }
    }

    pub async fn is_connected(&self) -> bool {
        self.connection
            .read()
            .await
            .as_ref()
            .is_some_and(|connection| connection.status().connected())
    }

    pub async fn close(&self) -> Result<()> {
        self.channels.lock().await.clear();
        if let Some(connection) = self.connection.write().await.take() {
            if connection.status().connected() {
                connection.close(200, "rabbit-rpc shutdown").await?;
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("config", &self.config)
            .finish()
    }
}

fn is_not_found(err: &lapin::Error) -> bool {
    matches!(
        err,
        lapin::Error::ProtocolError(e) if matches!(e.kind(), AMQPErrorKind::Soft(AMQPSoftError::NOTFOUND))
    )
}

fn exchange_kind(kind: ExchangeKind) -> lapin::ExchangeKind {
    match kind {
        ExchangeKind::Direct => lapin::ExchangeKind::Direct,
        ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
    }
}

fn to_properties(envelope: &Envelope) -> BasicProperties {
    let mut headers = FieldTable::default();
    for (key, value) in &envelope.headers {
        headers.insert(
            ShortString::from(key.clone()),
            AMQPValue::LongString(LongString::from(value.clone())),
        );
    }

    let mut properties = BasicProperties::default()
        .with_message_id(envelope.message_id.to_string().into())
        .with_timestamp(envelope.timestamp.timestamp().max(0) as u64)
        .with_headers(headers);
    if let Some(content_type) = &envelope.content_type {
        properties = properties.with_content_type(content_type.clone().into());
    }
    if let Some(content_encoding) = &envelope.content_encoding {
        properties = properties.with_content_encoding(content_encoding.clone().into());
    }
    if let Some(correlation_id) = &envelope.correlation_id {
        properties = properties.with_correlation_id(correlation_id.clone().into());
    }
    if let Some(reply_to) = &envelope.reply_to {
        properties = properties.with_reply_to(reply_to.clone().into());
    }
    if let Some(expiration_ms) = envelope.expiration_ms {
        properties = properties.with_expiration(expiration_ms.to_string().into());
    }
    properties
}

fn header_text(value: &AMQPValue) -> Option<String> {
    match value {
        AMQPValue::LongString(text) => Some(String::from_utf8_lossy(text.as_bytes()).into_owned()),
        AMQPValue::ShortString(text) => Some(text.as_str().to_string()),
        _ => None,
    }
}

fn from_delivery(data: Vec<u8>, properties: &BasicProperties) -> Envelope {
    let text = |value: &Option<ShortString>| value.as_ref().map(|s| s.as_str().to_string());

    let headers: BTreeMap<String, String> = properties
        .headers()
        .as_ref()
        .map(|table| {
            table
                .inner()
                .iter()
                .filter_map(|(key, value)| header_text(value).map(|v| (key.as_str().to_string(), v)))
                .collect()
        })
        .unwrap_or_default();

    Envelope {
        message_id: properties
            .message_id()
            .as_ref()
            .and_then(|id| Uuid::parse_str(id.as_str()).ok())
            .unwrap_or_else(Uuid::new_v4),
        body: data,
        content_type: text(properties.content_type()),
        content_encoding: text(properties.content_encoding()),
        headers,
        correlation_id: text(properties.correlation_id()),
        reply_to: text(properties.reply_to()),
        expiration_ms: properties
            .expiration()
            .as_ref()
            .and_then(|ms| ms.as_str().parse().ok()),
        timestamp: (*properties.timestamp())
            .and_then(|secs| Utc.timestamp_opt(secs as i64, 0).single())
            .unwrap_or_else(Utc::now),
    }
}

struct AmqpAcker(lapin::acker::Acker);

#[async_trait]
impl Acknowledger for AmqpAcker {
    async fn ack(&self) -> Result<()> {
        self.0.ack(BasicAckOptions::default()).await?;
        Ok(())
    }

    async fn reject(&self, requeue: bool) -> Result<()> {
        self.0.reject(BasicRejectOptions { requeue }).await?;
        Ok(())
    }
}

async fn probe_queue(manager: &ConnectionManager, name: &str) -> Result<Option<QueueInfo>> {
    let channel = manager.open_channel().await?;
    let probed = channel
        .queue_declare(
            name,
            QueueDeclareOptions {
                passive: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await;

    match probed {
        Ok(queue) => {
            let _ = channel.close(200, "probe done").await;
            Ok(Some(QueueInfo {
                name: queue.name().as_str().to_string(),
                message_count: queue.message_count(),
                consumer_count: queue.consumer_count(),
            }))
        }
        Err(e) if is_not_found(&e) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// [`Broker`] backed by a RabbitMQ connection
pub struct AmqpBroker {
    manager: Arc<ConnectionManager>,
    events: broadcast::Sender<BrokerEvent>,
}

impl AmqpBroker {
    /// Connect using `config`, retrying per its settings
    pub async fn connect(config: ConnectionConfig) -> Result<Self> {
        let manager = ConnectionManager::with_config(config);
        manager.connect().await?;
        Ok(Self::with_manager(Arc::new(manager)))
    }

    pub fn with_manager(manager: Arc<ConnectionManager>) -> Self {
        let (events, _) = broadcast::channel(64);
        Self { manager, events }
    }

    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }
}

impl std::fmt::Debug for AmqpBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AmqpBroker")
            .field("manager", &self.manager)
            .finish()
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn publish(&self, exchange: &str, routing_key: &str, envelope: Envelope) -> Result<()> {
        let channel = self.manager.get_channel().await?;
        let properties = to_properties(&envelope);

        channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &envelope.body,
                properties,
            )
            .await?
            .await?;

        self.manager.return_channel(channel).await;
        debug!("Published message to {}/{}", exchange, routing_key);
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream> {
        let channel = self.manager.open_channel().await?;
        let mut consumer = channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_ack: false,
                    exclusive: false,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        debug!("Created consumer {} for queue {}", consumer_tag, queue);

        let (tx, rx) = mpsc::channel(self.manager.config().delivery_buffer.max(1));
        let manager = self.manager.clone();
        let events = self.events.clone();
        let queue = queue.to_string();

        tokio::spawn(async move {
            while let Some(next) = consumer.next().await {
                match next {
                    Ok(delivery) => {
                        let envelope = from_delivery(delivery.data, &delivery.properties);
                        let delivery = Delivery::new(envelope, Box::new(AmqpAcker(delivery.acker)));
                        if tx.send(delivery).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!("Consumer on {} failed: {}", queue, e);
                        break;
                    }
                }
            }
            drop(channel);

            if matches!(probe_queue(&manager, &queue).await, Ok(None)) {
                warn!("Queue {} disappeared from the broker", queue);
                let _ = events.send(BrokerEvent::QueueMissing { queue });
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    async fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<()> {
        let channel = self.manager.get_channel().await?;
        channel
            .exchange_declare(
                &spec.name,
                exchange_kind(spec.kind),
                ExchangeDeclareOptions {
                    durable: spec.durable,
                    auto_delete: spec.auto_delete,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        self.manager.return_channel(channel).await;
        debug!("Declared exchange: {}", spec.name);
        Ok(())
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<QueueInfo> {
        let channel = self.manager.get_channel().await?;
        let queue = channel
            .queue_declare(
                &spec.name,
                QueueDeclareOptions {
                    durable: spec.durable,
                    exclusive: spec.exclusive,
                    auto_delete: spec.auto_delete,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        self.manager.return_channel(channel).await;
        debug!("Declared queue: {}", spec.name);

        Ok(QueueInfo {
            name: queue.name().as_str().to_string(),
            message_count: queue.message_count(),
            consumer_count: queue.consumer_count(),
        })
    }

    async fn declare_binding(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        let channel = self.manager.get_channel().await?;
        channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
        self.manager.return_channel(channel).await;
        debug!("Bound {} to {} with key {}", queue, exchange, routing_key);
        Ok(())
    }

    async fn exchange_exists(&self, name: &str) -> Result<bool> {
        if name.is_empty() {
            return Ok(true);
        }

        let channel = self.manager.open_channel().await?;
        let probed = channel
            .exchange_declare(
                name,
                lapin::ExchangeKind::Direct,
                ExchangeDeclareOptions {
                    passive: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await;

        match probed {
            Ok(()) => {
                let _ = channel.close(200, "probe done").await;
                Ok(true)
            }
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn queue_info(&self, name: &str) -> Result<Option<QueueInfo>> {
        probe_queue(&self.manager, name).await
    }

    async fn declare_reply_queue(&self) -> Result<String> {
        let channel = self.manager.get_channel().await?;
        let queue = channel
            .queue_declare(
                "",
                QueueDeclareOptions {
                    exclusive: true,
                    auto_delete: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        self.manager.return_channel(channel).await;
        Ok(queue.name().as_str().to_string())
    }

    fn events(&self) -> broadcast::Receiver<BrokerEvent> {
        self.events.subscribe()
    }

    async fn close(&self) -> Result<()> {
        self.manager.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serializer::Payload;
    use lapin::protocol::AMQPError;

    #[test]
    fn envelope_survives_amqp_properties() {
        let envelope = Envelope::request(
            "app::Users",
            "find",
            Payload {
                body: vec![1, 2, 3],
                content_type: "application/x-bincode".into(),
                content_encoding: "UTF-8".into(),
            },
        )
        .with_correlation_id("c-1")
        .with_reply_to("amq.gen-1")
        .with_expiration_ms(5_000);

        let properties = to_properties(&envelope);
        let back = from_delivery(envelope.body.clone(), &properties);

        assert_eq!(back.message_id, envelope.message_id);
        assert_eq!(back.headers, envelope.headers);
        assert_eq!(back.content_type, envelope.content_type);
        assert_eq!(back.correlation_id.as_deref(), Some("c-1"));
        assert_eq!(back.reply_to.as_deref(), Some("amq.gen-1"));
        assert_eq!(back.expiration_ms, Some(5_000));
        assert_eq!(back.timestamp.timestamp(), envelope.timestamp.timestamp());
    }

    #[test]
    fn connection_config_defaults() {
        let config = ConnectionConfig::default();
        assert_eq!(config.url, "amqp://localhost:5672");
        assert_eq!(config.prefetch_count, 10);
        assert_eq!(config.connection_uri(), "amqp://localhost:5672?heartbeat=60");
    }

    #[test]
    fn heartbeat_joins_existing_query_unless_already_set() {
        let config = ConnectionConfig {
            url: "amqp://localhost:5672/%2f?frame_max=8192".into(),
            heartbeat_seconds: 15,
            ..ConnectionConfig::default()
        };
        assert_eq!(config.connection_uri(), "amqp://localhost:5672/%2f?frame_max=8192&heartbeat=15");

        let explicit = ConnectionConfig {
            url: "amqp://localhost:5672?heartbeat=5".into(),
            ..ConnectionConfig::default()
        };
        assert_eq!(explicit.connection_uri(), "amqp://localhost:5672?heartbeat=5");
    }

    #[test]
    fn only_not_found_replies_count_as_missing() {
        let missing = lapin::Error::ProtocolError(AMQPError::new(
            AMQPErrorKind::Soft(AMQPSoftError::NOTFOUND),
            "NOT_FOUND - no queue 'orders'".into(),
        ));
        assert!(is_not_found(&missing));

        let refused = lapin::Error::ProtocolError(AMQPError::new(
            AMQPErrorKind::Soft(AMQPSoftError::ACCESSREFUSED),
            "ACCESS_REFUSED - queue 'orders-404' in use".into(),
        ));
        assert!(!is_not_found(&refused));
    }

    // Needs a running broker: RABBITMQ_URL=amqp://localhost:5672 cargo test
    #[tokio::test]
    async fn passive_probes_against_a_live_broker() {
        let Ok(url) = std::env::var("RABBITMQ_URL") else {
            return;
        };
        let broker = AmqpBroker::connect(ConnectionConfig {
            url,
            max_retries: 1,
            ..ConnectionConfig::default()
        })
        .await
        .unwrap();

        let name = format!("rabbit-rpc-test-{}", Uuid::new_v4());
        assert!(!broker.exchange_exists(&name).await.unwrap());
        assert!(broker.queue_info(&name).await.unwrap().is_none());

        broker.declare_queue(&QueueSpec::new(&name)).await.unwrap();
        assert!(broker.queue_info(&name).await.unwrap().is_some());
        broker.close().await.unwrap();
    }
}
