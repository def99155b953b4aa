//! Broker abstraction.
//!
//! Everything above this module talks to a [`Broker`]: publish, consume,
//! the declare/probe calls used by topology provisioning, and a stream of
//! [`BrokerEvent`]s. [`AmqpBroker`] is the RabbitMQ implementation,
//! [`MemoryBroker`] an in-process stand-in.

pub mod amqp;
pub mod memory;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use tokio::sync::broadcast;

use crate::envelope::Envelope;
use crate::error::Result;

pub use amqp::{AmqpBroker, ConnectionConfig, ConnectionManager};
pub use memory::MemoryBroker;

/// The default exchange; routes by queue name
pub const DEFAULT_EXCHANGE: &str = "";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExchangeKind {
    #[default]
    Direct,
    Topic,
    Fanout,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeSpec {
    pub name: String,
    pub kind: ExchangeKind,
    pub durable: bool,
    pub auto_delete: bool,
}

impl ExchangeSpec {
    pub fn direct(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ExchangeKind::Direct,
            durable: false,
            auto_delete: true,
        }
    }

    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    pub fn auto_delete(mut self, auto_delete: bool) -> Self {
        self.auto_delete = auto_delete;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: String,
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
}

impl QueueSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: false,
            exclusive: false,
            auto_delete: false,
        }
    }

    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }
}

/// Passive queue metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueInfo {
    pub name: String,
    pub message_count: u32,
    pub consumer_count: u32,
}

/// Out-of-band broker notifications
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerEvent {
    /// A queue someone consumed from no longer exists
    QueueMissing { queue: String },
}

/// Settles one delivery
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<()>;
    async fn reject(&self, requeue: bool) -> Result<()>;
}

/// A message handed to a consumer
pub struct Delivery {
    pub envelope: Envelope,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(envelope: Envelope, acker: Box<dyn Acknowledger>) -> Self {
        Self { envelope, acker }
    }

    pub async fn ack(&self) -> Result<()> {
        self.acker.ack().await
    }

    pub async fn reject(&self, requeue: bool) -> Result<()> {
        self.acker.reject(requeue).await
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("envelope", &self.envelope)
            .finish()
    }
}

/// Deliveries for one consumer; ends when the broker cancels it
pub type DeliveryStream = BoxStream<'static, Delivery>;

/// Transport used by the RPC runtime
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    async fn publish(&self, exchange: &str, routing_key: &str, envelope: Envelope) -> Result<()>;

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream>;

    async fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<()>;

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<QueueInfo>;

    async fn declare_binding(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()>;

    /// Passive probe; `Ok(false)` only when the broker reports not-found
    async fn exchange_exists(&self, name: &str) -> Result<bool>;

    /// Passive probe; `Ok(None)` when the queue does not exist
    async fn queue_info(&self, name: &str) -> Result<Option<QueueInfo>>;

    /// Exclusive, server-named queue for replies
    async fn declare_reply_queue(&self) -> Result<String>;

    fn events(&self) -> broadcast::Receiver<BrokerEvent>;

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
