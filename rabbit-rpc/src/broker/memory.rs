use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, Mutex as AsyncMutex};
use tracing::debug;
use uuid::Uuid;

use super::{
    Acknowledger, Broker, BrokerEvent, Delivery, DeliveryStream, ExchangeSpec, QueueInfo,
    QueueSpec, DEFAULT_EXCHANGE,
};
use crate::envelope::Envelope;
use crate::error::{RabbitRpcError, Result};

type SharedReceiver = Arc<AsyncMutex<mpsc::UnboundedReceiver<Envelope>>>;

struct MemoryQueue {
    spec: QueueSpec,
    sender: mpsc::UnboundedSender<Envelope>,
    receiver: SharedReceiver,
    consumers: Arc<AtomicUsize>,
}

impl MemoryQueue {
    fn new(spec: QueueSpec) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            spec,
            sender,
            receiver: Arc::new(AsyncMutex::new(receiver)),
            consumers: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn info(&self) -> QueueInfo {
        QueueInfo {
            name: self.spec.name.clone(),
            message_count: 0,
            consumer_count: self.consumers.load(Ordering::Relaxed) as u32,
        }
    }
}

#[derive(Default)]
struct State {
    exchanges: HashMap<String, ExchangeSpec>,
    queues: HashMap<String, MemoryQueue>,
    /// (exchange, routing key) -> queues
    bindings: HashMap<(String, String), Vec<String>>,
}

/// In-process broker with direct-exchange routing.
///
/// Consumers of one queue compete for its messages. Deleting a queue ends
/// its consumer streams and emits [`BrokerEvent::QueueMissing`], which is
/// how a broker restart looks to the runtime.
pub struct MemoryBroker {
    state: Mutex<State>,
    events: broadcast::Sender<BrokerEvent>,
    mutations: AtomicUsize,
    published: AtomicUsize,
    acked: Arc<AtomicUsize>,
    rejected: Arc<AtomicUsize>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            state: Mutex::new(State::default()),
            events,
            mutations: AtomicUsize::new(0),
            published: AtomicUsize::new(0),
            acked: Arc::new(AtomicUsize::new(0)),
            rejected: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Declare calls received so far
    pub fn mutation_count(&self) -> usize {
        self.mutations.load(Ordering::SeqCst)
    }

    pub fn published_count(&self) -> usize {
        self.published.load(Ordering::SeqCst)
    }

    pub fn acked_count(&self) -> usize {
        self.acked.load(Ordering::SeqCst)
    }

    pub fn rejected_count(&self) -> usize {
        self.rejected.load(Ordering::SeqCst)
    }

    pub fn has_exchange(&self, name: &str) -> bool {
        self.state.lock().exchanges.contains_key(name)
    }

    pub fn has_queue(&self, name: &str) -> bool {
        self.state.lock().queues.contains_key(name)
    }

    pub fn has_binding(&self, queue: &str, exchange: &str, routing_key: &str) -> bool {
        self.state
            .lock()
            .bindings
            .get(&(exchange.to_string(), routing_key.to_string()))
            .is_some_and(|queues| queues.iter().any(|q| q == queue))
    }

    /// Drop a queue and its bindings, ending its consumers
    pub fn delete_queue(&self, name: &str) -> bool {
        let removed = {
            let mut state = self.state.lock();
            let removed = state.queues.remove(name).is_some();
            for queues in state.bindings.values_mut() {
                queues.retain(|queue| queue != name);
            }
            state.bindings.retain(|_, queues| !queues.is_empty());
            removed
        };

        if removed {
            debug!("Memory broker deleted queue {}", name);
            let _ = self.events.send(BrokerEvent::QueueMissing {
                queue: name.to_string(),
            });
        }
        removed
    }

    pub fn delete_exchange(&self, name: &str) -> bool {
        let mut state = self.state.lock();
        state.bindings.retain(|(exchange, _), _| exchange != name);
        state.exchanges.remove(name).is_some()
    }

    fn mutated(&self) {
        self.mutations.fetch_add(1, Ordering::SeqCst);
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MemoryBroker")
            .field("exchanges", &state.exchanges.len())
            .field("queues", &state.queues.len())
            .field("mutations", &self.mutation_count())
            .finish()
    }
}

struct MemoryAcker {
    envelope: Envelope,
    requeue_to: mpsc::WeakUnboundedSender<Envelope>,
    settled: AtomicBool,
    acked: Arc<AtomicUsize>,
    rejected: Arc<AtomicUsize>,
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> Result<()> {
        if !self.settled.swap(true, Ordering::SeqCst) {
            self.acked.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn reject(&self, requeue: bool) -> Result<()> {
        if self.settled.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.rejected.fetch_add(1, Ordering::SeqCst);
        if requeue {
            // queue may be gone, the message is then dropped
            if let Some(sender) = self.requeue_to.upgrade() {
                let _ = sender.send(self.envelope.clone());
            }
        }
        Ok(())
    }
}

struct ConsumerGuard(Arc<AtomicUsize>);

impl Drop for ConsumerGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, exchange: &str, routing_key: &str, envelope: Envelope) -> Result<()> {
        let state = self.state.lock();
        let targets: Vec<&MemoryQueue> = if exchange == DEFAULT_EXCHANGE {
            state.queues.get(routing_key).into_iter().collect()
        } else {
            if !state.exchanges.contains_key(exchange) {
                return Err(RabbitRpcError::broker_error(format!(
                    "NOT_FOUND - no exchange '{}'",
                    exchange
                )));
            }
            state
                .bindings
                .get(&(exchange.to_string(), routing_key.to_string()))
                .into_iter()
                .flatten()
                .filter_map(|queue| state.queues.get(queue))
                .collect()
        };

        if targets.is_empty() {
            debug!("Unroutable message to {}/{} dropped", exchange, routing_key);
        }
        for queue in targets {
            let _ = queue.sender.send(envelope.clone());
        }
        self.published.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream> {
        let (receiver, requeue_to, consumers) = {
            let state = self.state.lock();
            let target = state.queues.get(queue).ok_or_else(|| {
                RabbitRpcError::broker_error(format!("NOT_FOUND - no queue '{}'", queue))
            })?;
            (target.receiver.clone(), target.sender.downgrade(), target.consumers.clone())
        };

        consumers.fetch_add(1, Ordering::Relaxed);
        debug!("Consumer {} attached to {}", consumer_tag, queue);

        let acked = self.acked.clone();
        let rejected = self.rejected.clone();
        let guard = ConsumerGuard(consumers);
        let deliveries = stream::unfold(
            (receiver, requeue_to, guard),
            move |(receiver, requeue_to, guard)| {
                let acked = acked.clone();
                let rejected = rejected.clone();
                async move {
                    let envelope = receiver.lock().await.recv().await?;
                    let acker = MemoryAcker {
                        envelope: envelope.clone(),
                        requeue_to: requeue_to.clone(),
                        settled: AtomicBool::new(false),
                        acked,
                        rejected,
                    };
                    Some((
                        Delivery::new(envelope, Box::new(acker)),
                        (receiver, requeue_to, guard),
                    ))
                }
            },
        );

        Ok(Box::pin(deliveries))
    }

    async fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<()> {
        self.mutated();
        self.state
            .lock()
            .exchanges
            .entry(spec.name.clone())
            .or_insert_with(|| spec.clone());
        Ok(())
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<QueueInfo> {
        self.mutated();
        let mut state = self.state.lock();
        let queue = state
            .queues
            .entry(spec.name.clone())
            .or_insert_with(|| MemoryQueue::new(spec.clone()));
        Ok(queue.info())
    }

    async fn declare_binding(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.mutated();
        let mut state = self.state.lock();
        if !state.exchanges.contains_key(exchange) {
            return Err(RabbitRpcError::broker_error(format!(
                "NOT_FOUND - no exchange '{}'",
                exchange
            )));
        }
        if !state.queues.contains_key(queue) {
            return Err(RabbitRpcError::broker_error(format!(
                "NOT_FOUND - no queue '{}'",
                queue
            )));
        }

        let bound = state
            .bindings
            .entry((exchange.to_string(), routing_key.to_string()))
            .or_default();
        if !bound.iter().any(|q| q == queue) {
            bound.push(queue.to_string());
        }
        Ok(())
    }

    async fn exchange_exists(&self, name: &str) -> Result<bool> {
        Ok(name == DEFAULT_EXCHANGE || self.has_exchange(name))
    }

    async fn queue_info(&self, name: &str) -> Result<Option<QueueInfo>> {
        Ok(self.state.lock().queues.get(name).map(MemoryQueue::info))
    }

    async fn declare_reply_queue(&self) -> Result<String> {
        let name = format!("amq.gen-{}", Uuid::new_v4());
        let spec = QueueSpec {
            name: name.clone(),
            durable: false,
            exclusive: true,
            auto_delete: true,
        };
        self.state
            .lock()
            .queues
            .insert(name.clone(), MemoryQueue::new(spec));
        Ok(name)
    }

    fn events(&self) -> broadcast::Receiver<BrokerEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serializer::Payload;
    use futures_util::StreamExt;
    use std::time::Duration;

    fn envelope(tag: &str) -> Envelope {
        Envelope::new(Payload {
            body: tag.as_bytes().to_vec(),
            content_type: "text/plain".into(),
            content_encoding: "UTF-8".into(),
        })
    }

    #[tokio::test]
    async fn direct_exchange_routes_by_binding() {
        let broker = MemoryBroker::new();
        broker.declare_exchange(&ExchangeSpec::direct("x")).await.unwrap();
        broker.declare_queue(&QueueSpec::new("q")).await.unwrap();
        broker.declare_binding("q", "x", "key").await.unwrap();

        let mut consumer = broker.consume("q", "c1").await.unwrap();
        broker.publish("x", "other", envelope("lost")).await.unwrap();
        broker.publish("x", "key", envelope("found")).await.unwrap();

        let delivery = consumer.next().await.unwrap();
        assert_eq!(delivery.envelope.body, b"found");
        delivery.ack().await.unwrap();
        assert_eq!(broker.acked_count(), 1);
        assert_eq!(broker.queue_info("q").await.unwrap().unwrap().consumer_count, 1);
    }

    #[tokio::test]
    async fn competing_consumers_each_get_a_message_once() {
        let broker = MemoryBroker::new();
        broker.declare_queue(&QueueSpec::new("work")).await.unwrap();
        let mut first = broker.consume("work", "a").await.unwrap();
        let mut second = broker.consume("work", "b").await.unwrap();

        broker.publish("", "work", envelope("1")).await.unwrap();
        broker.publish("", "work", envelope("2")).await.unwrap();

        let one = first.next().await.unwrap();
        let two = second.next().await.unwrap();
        assert_ne!(one.envelope.body, two.envelope.body);
    }

    #[tokio::test]
    async fn rejected_messages_are_requeued() {
        let broker = MemoryBroker::new();
        broker.declare_queue(&QueueSpec::new("q")).await.unwrap();
        let mut consumer = broker.consume("q", "c").await.unwrap();
        broker.publish("", "q", envelope("again")).await.unwrap();

        let first = consumer.next().await.unwrap();
        first.reject(true).await.unwrap();
        let second = consumer.next().await.unwrap();
        assert_eq!(second.envelope.body, b"again");
        assert_eq!(broker.rejected_count(), 1);
    }

    #[tokio::test]
    async fn deleting_a_queue_ends_consumers_and_signals() {
        let broker = MemoryBroker::new();
        let mut events = broker.events();
        broker.declare_queue(&QueueSpec::new("q")).await.unwrap();
        let mut consumer = broker.consume("q", "c").await.unwrap();

        assert!(broker.delete_queue("q"));
        let ended = tokio::time::timeout(Duration::from_secs(1), consumer.next())
            .await
            .unwrap();
        assert!(ended.is_none());
        assert_eq!(
            events.recv().await.unwrap(),
            BrokerEvent::QueueMissing { queue: "q".into() }
        );
        assert!(broker.queue_info("q").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn publishing_to_a_missing_exchange_fails() {
        let broker = MemoryBroker::new();
        assert!(broker.publish("nope", "k", envelope("x")).await.is_err());
        assert!(!broker.exchange_exists("nope").await.unwrap());
        assert!(broker.exchange_exists("").await.unwrap());
    }
}
