//! Server side: per-message dispatch and the per-queue consumer pools.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::broker::{Broker, Delivery, DEFAULT_EXCHANGE};
use crate::contract::Concurrency;
use crate::dispatch::{DispatchEntry, DispatchTable};
use crate::envelope::{Envelope, ReplyBody, TYPE_ID_HEADER};
use crate::error::{RabbitRpcError, Result};
use crate::error_handler::{fallback_error_payload, ErrorContext, ErrorHandler, ValidationException};
use crate::serializer::SharedSerializer;
use crate::topology::TopologyManager;
use crate::types::{Arguments, Returned};
use crate::validation::{implicit_not_null, Validator};

/// How a message left the dispatcher
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// A value, void or null reply was published
    Replied,
    /// Handled, nothing to publish
    Dropped,
    /// Failed; an error reply went out if the caller waits for one
    Errored,
}

struct Resolved<'a> {
    contract: &'a str,
    entry: &'a DispatchEntry,
    serializer: SharedSerializer,
    error_handler: Arc<dyn ErrorHandler>,
}

/// Turns request envelopes into handler invocations and replies
pub struct ServerDispatcher {
    table: Arc<DispatchTable>,
    broker: Arc<dyn Broker>,
    validator: Arc<dyn Validator>,
    service_name: String,
    default_serializer: SharedSerializer,
    default_error_handler: Arc<dyn ErrorHandler>,
    serializers: HashMap<String, SharedSerializer>,
    error_handlers: HashMap<String, Arc<dyn ErrorHandler>>,
}

impl ServerDispatcher {
    pub fn new(
        table: Arc<DispatchTable>,
        broker: Arc<dyn Broker>,
        validator: Arc<dyn Validator>,
        service_name: impl Into<String>,
        default_serializer: SharedSerializer,
        default_error_handler: Arc<dyn ErrorHandler>,
    ) -> Self {
        Self {
            table,
            broker,
            validator,
            service_name: service_name.into(),
            default_serializer,
            default_error_handler,
            serializers: HashMap::new(),
            error_handlers: HashMap::new(),
        }
    }

    /// Use `serializer` for `contract` instead of the default
    pub fn with_serializer(mut self, contract: impl Into<String>, serializer: SharedSerializer) -> Self {
        self.serializers.insert(contract.into(), serializer);
        self
    }

    pub fn with_error_handler(mut self, contract: impl Into<String>, handler: Arc<dyn ErrorHandler>) -> Self {
        self.error_handlers.insert(contract.into(), handler);
        self
    }

    pub fn table(&self) -> &Arc<DispatchTable> {
        &self.table
    }

    fn serializer_for(&self, contract: &str) -> SharedSerializer {
        self.serializers
            .get(contract)
            .cloned()
            .unwrap_or_else(|| self.default_serializer.clone())
    }

    fn error_handler_for(&self, contract: &str) -> Arc<dyn ErrorHandler> {
        self.error_handlers
            .get(contract)
            .cloned()
            .unwrap_or_else(|| self.default_error_handler.clone())
    }

    /// Process one request envelope to its terminal state.
    ///
    /// `Err` means the reply could not be published; the delivery should
    /// go back to the queue.
    pub async fn handle(&self, envelope: Envelope) -> Result<Disposition> {
        let contract = envelope.service_id().unwrap_or_default().to_string();
        let method = envelope.method_name().unwrap_or_default().to_string();
        debug!(
            "Received {}::{}() (correlation {:?})",
            contract, method, envelope.correlation_id
        );

        let (resolved, args) = match self.decode_and_resolve(&envelope, &contract, &method).await {
            Ok(found) => found,
            Err(e) => {
                // No signature: answer only when someone listens
                let err = anyhow::Error::new(e);
                let response = self
                    .error_handler_for(&contract)
                    .handle(&err, ErrorContext { contract: &contract, method: &method });
                if envelope.expects_reply() {
                    let serializer = self.serializer_for(&contract);
                    self.reply(&envelope, &serializer, ReplyBody::Error(response)).await?;
                }
                return Ok(Disposition::Errored);
            }
        };

        let signature = &resolved.entry.signature;
        let context = ErrorContext {
            contract: resolved.contract,
            method: &signature.name,
        };
        let fire_and_forget = signature.fire_and_forget;
        let outcome = self.validate_and_invoke(&resolved, args).await;

        if fire_and_forget {
            return Ok(match outcome {
                Ok(_) => {
                    debug!("Fire-and-forget {}::{}() done", context.contract, context.method);
                    Disposition::Dropped
                }
                Err(err) => {
                    let response = resolved.error_handler.handle(&err, context);
                    warn!(
                        "Fire-and-forget {}::{}() failed with status {}: {}",
                        context.contract, context.method, response.status_code, err
                    );
                    Disposition::Errored
                }
            });
        }

        let (body, disposition) = match outcome {
            Ok(Returned::Void) if signature.is_void() => (ReplyBody::Void, Disposition::Replied),
            Ok(Returned::Void) => (ReplyBody::Null, Disposition::Replied),
            Ok(Returned::Value(value)) => (ReplyBody::Value(value), Disposition::Replied),
            Err(err) => (
                ReplyBody::Error(resolved.error_handler.handle(&err, context)),
                Disposition::Errored,
            ),
        };

        if !envelope.expects_reply() {
            debug!("{}::{}() has no reply address", context.contract, context.method);
            return Ok(Disposition::Dropped);
        }

        let sent = self
            .reply_or_translate(&envelope, &resolved, body, context)
            .await?;
        Ok(if sent { disposition } else { Disposition::Errored })
    }

    async fn decode_and_resolve<'a>(
        &'a self,
        envelope: &Envelope,
        contract: &str,
        method: &str,
    ) -> Result<(Resolved<'a>, Arguments)> {
        if contract.is_empty() || method.is_empty() {
            return Err(RabbitRpcError::invalid_message("missing service or method header"));
        }

        if self.table.contract(contract).is_none() {
            return Err(RabbitRpcError::ServiceNotFound {
                service_name: contract.to_string(),
            });
        }
        let serializer = self.serializer_for(contract);
        let frame = serializer.decode_frame(envelope).await?;

        let hint = envelope.param_types();
        let (owner, entry) = self
            .table
            .resolve(contract, method, &frame.tags(), hint.as_deref())?;
        let args = serializer.materialize(&frame, &entry.signature).await?;

        Ok((
            Resolved {
                contract: &owner.contract.name,
                entry,
                serializer,
                error_handler: self.error_handler_for(contract),
            },
            args,
        ))
    }

    async fn validate_and_invoke(
        &self,
        resolved: &Resolved<'_>,
        args: Arguments,
    ) -> anyhow::Result<Returned> {
        let signature = &resolved.entry.signature;
        let mut violations = implicit_not_null(&args, signature);
        violations.extend(self.validator.validate(&args, signature));
        if !violations.is_empty() {
            return Err(ValidationException::from_violations(&self.service_name, &violations).into());
        }

        (resolved.entry.handler)(args).await
    }

    /// Publish `body`; a value that cannot be encoded becomes an error reply.
    /// Returns false when the value had to be replaced.
    async fn reply_or_translate(
        &self,
        request: &Envelope,
        resolved: &Resolved<'_>,
        body: ReplyBody,
        context: ErrorContext<'_>,
    ) -> Result<bool> {
        if let ReplyBody::Error(_) = body {
            self.reply(request, &resolved.serializer, body).await?;
            return Ok(true);
        }

        match resolved.serializer.encode_reply(&body).await {
            Ok((payload, type_id)) => {
                let reply = Envelope::reply_to_request(request, payload).with_header(TYPE_ID_HEADER, type_id);
                self.publish_reply(request, reply).await?;
                Ok(true)
            }
            Err(e) => {
                let response = resolved.error_handler.handle(&anyhow::Error::new(e), context);
                self.reply(request, &resolved.serializer, ReplyBody::Error(response))
                    .await?;
                Ok(false)
            }
        }
    }

    /// Encode and publish a reply, falling back to the JSON error envelope
    async fn reply(&self, request: &Envelope, serializer: &SharedSerializer, body: ReplyBody) -> Result<()> {
        let reply = match serializer.encode_reply(&body).await {
            Ok((payload, type_id)) => {
                Envelope::reply_to_request(request, payload).with_header(TYPE_ID_HEADER, type_id)
            }
            Err(e) => {
                error!("Encoding error reply failed, sending fallback: {}", e);
                Envelope::reply_to_request(request, fallback_error_payload(&self.service_name))
            }
        };
        self.publish_reply(request, reply).await
    }

    async fn publish_reply(&self, request: &Envelope, reply: Envelope) -> Result<()> {
        let Some(address) = request.reply_to.as_deref() else {
            return Ok(());
        };
        self.broker.publish(DEFAULT_EXCHANGE, address, reply).await
    }
}

impl std::fmt::Debug for ServerDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerDispatcher")
            .field("table", &self.table)
            .field("service_name", &self.service_name)
            .finish()
    }
}

/// Sizing and timing for one queue's consumers
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub queue: String,
    pub concurrency: Concurrency,
    pub idle_timeout: Duration,
    pub recovery_interval: Duration,
}

struct PoolShared {
    settings: PoolSettings,
    broker: Arc<dyn Broker>,
    dispatcher: Arc<ServerDispatcher>,
    topology: Arc<TopologyManager>,
    executor: Handle,
    shutdown: watch::Receiver<bool>,
    live: AtomicUsize,
    busy: AtomicUsize,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Consumers of one queue, shared by every contract bound to it.
///
/// `min` consumers run for the lifetime of the pool. When all of them are
/// busy another one is started, up to `max`; those extra consumers retire
/// after `idle_timeout` without a delivery.
pub struct ConsumerPool {
    shared: Arc<PoolShared>,
}

impl ConsumerPool {
    pub fn start(
        settings: PoolSettings,
        broker: Arc<dyn Broker>,
        dispatcher: Arc<ServerDispatcher>,
        topology: Arc<TopologyManager>,
        executor: Handle,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        info!(
            "Starting consumer pool for {} ({} consumers)",
            settings.queue, settings.concurrency
        );
        let core = settings.concurrency.min;
        let shared = Arc::new(PoolShared {
            settings,
            broker,
            dispatcher,
            topology,
            executor,
            shutdown,
            live: AtomicUsize::new(0),
            busy: AtomicUsize::new(0),
            tasks: Mutex::new(Vec::new()),
        });

        for _ in 0..core {
            shared.live.fetch_add(1, Ordering::SeqCst);
            spawn_consumer(&shared, true);
        }
        Self { shared }
    }

    pub fn queue(&self) -> &str {
        &self.shared.settings.queue
    }

    pub fn concurrency(&self) -> Concurrency {
        self.shared.settings.concurrency
    }

    pub fn live_consumers(&self) -> usize {
        self.shared.live.load(Ordering::SeqCst)
    }

    pub fn busy_consumers(&self) -> usize {
        self.shared.busy.load(Ordering::SeqCst)
    }

    /// Wait for every consumer to stop; signal shutdown first
    pub async fn join(&self) {
        loop {
            let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.shared.tasks.lock());
            if tasks.is_empty() {
                break;
            }
            for task in tasks {
                if let Err(e) = task.await {
                    warn!("Consumer task on {} ended abnormally: {}", self.queue(), e);
                }
            }
        }
    }
}

impl std::fmt::Debug for ConsumerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerPool")
            .field("queue", &self.shared.settings.queue)
            .field("live", &self.live_consumers())
            .field("busy", &self.busy_consumers())
            .finish()
    }
}

/// Caller has already counted the consumer in `live`
fn spawn_consumer(shared: &Arc<PoolShared>, core: bool) {
    let tag = format!("{}-{}", shared.settings.queue, Uuid::new_v4());
    let task = shared.executor.spawn(run_consumer(shared.clone(), tag, core));
    let mut tasks = shared.tasks.lock();
    // retired elastic consumers
    tasks.retain(|task| !task.is_finished());
    tasks.push(task);
}

async fn run_consumer(shared: Arc<PoolShared>, tag: String, core: bool) {
    let queue = shared.settings.queue.clone();
    let mut shutdown = shared.shutdown.clone();
    let mut restored = shared.topology.subscribe_restored();
    debug!("Consumer {} started", tag);

    'subscribe: while !*shutdown.borrow() {
        let mut deliveries = match shared.broker.consume(&queue, &tag).await {
            Ok(deliveries) => deliveries,
            Err(e) => {
                warn!("Consumer {} cannot subscribe to {}: {}", tag, queue, e);
                if !core || !wait_for_recovery(&shared, &mut restored, &mut shutdown).await {
                    break;
                }
                continue;
            }
        };

        loop {
            let next = if core {
                tokio::select! {
                    _ = shutdown.changed() => break 'subscribe,
                    next = deliveries.next() => next,
                }
            } else {
                tokio::select! {
                    _ = shutdown.changed() => break 'subscribe,
                    next = tokio::time::timeout(shared.settings.idle_timeout, deliveries.next()) => match next {
                        Ok(next) => next,
                        Err(_) => {
                            debug!("Consumer {} idle, retiring", tag);
                            break 'subscribe;
                        }
                    },
                }
            };

            match next {
                Some(delivery) => process(&shared, delivery).await,
                None => break,
            }
        }

        info!("Consumer {} lost its subscription to {}", tag, queue);
        if !core || !wait_for_recovery(&shared, &mut restored, &mut shutdown).await {
            break;
        }
    }

    shared.live.fetch_sub(1, Ordering::SeqCst);
    debug!("Consumer {} stopped", tag);
}

async fn process(shared: &Arc<PoolShared>, delivery: Delivery) {
    let busy = shared.busy.fetch_add(1, Ordering::SeqCst) + 1;
    let max = shared.settings.concurrency.max;
    if busy >= shared.live.load(Ordering::SeqCst)
        && shared
            .live
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |live| (live < max).then_some(live + 1))
            .is_ok()
    {
        debug!("All consumers of {} busy, adding one", shared.settings.queue);
        spawn_consumer(shared, false);
    }

    let settled = match shared.dispatcher.handle(delivery.envelope.clone()).await {
        Ok(disposition) => {
            debug!("Message {} {:?}", delivery.envelope.message_id, disposition);
            delivery.ack().await
        }
        Err(e) => {
            warn!("Reply for message {} not published, requeueing: {}", delivery.envelope.message_id, e);
            delivery.reject(true).await
        }
    };
    if let Err(e) = settled {
        warn!("Settling message {} failed: {}", delivery.envelope.message_id, e);
    }

    shared.busy.fetch_sub(1, Ordering::SeqCst);
}

/// Wait for the queue to be restored or one recovery interval; false on shutdown
async fn wait_for_recovery(
    shared: &PoolShared,
    restored: &mut broadcast::Receiver<String>,
    shutdown: &mut watch::Receiver<bool>,
) -> bool {
    let deadline = tokio::time::sleep(shared.settings.recovery_interval);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = shutdown.changed() => return false,
            _ = &mut deadline => return true,
            queue = restored.recv() => match queue {
                Ok(queue) if queue == shared.settings.queue => return true,
                Ok(_) => {}
                Err(_) => return true,
            },
        }
    }
}
