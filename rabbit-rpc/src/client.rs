use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::broker::Broker;
use crate::contract::{MethodSignature, ServiceContract};
use crate::envelope::{Envelope, ReplyOutcome, VoidResponse};
use crate::error::{RabbitRpcError, Result};
use crate::error_handler::into_client_error;
use crate::serializer::{SerializationError, SharedSerializer};
use crate::types::{CallArgs, RpcType};

/// A call waiting for its reply
struct PendingCall {
    reply_tx: oneshot::Sender<Envelope>,
    started_at: Instant,
}

/// Owns the exclusive reply queue and hands replies to waiting callers
pub struct ReplyRouter {
    address: String,
    pending: Arc<Mutex<HashMap<String, PendingCall>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ReplyRouter {
    /// Declare the reply queue and start consuming it
    pub async fn start(broker: Arc<dyn Broker>, mut shutdown: watch::Receiver<bool>) -> Result<Arc<Self>> {
        let address = broker.declare_reply_queue().await?;
        let mut replies = broker
            .consume(&address, &format!("replies-{}", Uuid::new_v4()))
            .await?;
        info!("Reply queue {} ready", address);

        let pending: Arc<Mutex<HashMap<String, PendingCall>>> = Arc::new(Mutex::new(HashMap::new()));
        let router_pending = pending.clone();
        let queue = address.clone();

        let task = tokio::spawn(async move {
            loop {
                let delivery = tokio::select! {
                    Ok(()) = shutdown.changed() => break,
                    delivery = replies.next() => match delivery {
                        Some(delivery) => delivery,
                        None => {
                            warn!("Reply queue {} stopped delivering", queue);
                            break;
                        }
                    },
                };

                if let Err(e) = delivery.ack().await {
                    warn!("Failed to acknowledge reply: {}", e);
                }

                let envelope = delivery.envelope;
                let waiting = envelope
                    .correlation_id
                    .as_deref()
                    .and_then(|id| router_pending.lock().remove(id));
                match waiting {
                    Some(call) => {
                        debug!(
                            "Reply for {:?} after {:?}",
                            envelope.correlation_id,
                            call.started_at.elapsed()
                        );
                        let _ = call.reply_tx.send(envelope);
                    }
                    None => warn!(
                        "Discarding reply with unknown correlation id {:?}",
                        envelope.correlation_id
                    ),
                }
            }
            debug!("Reply router for {} stopped", queue);
        });

        Ok(Arc::new(Self {
            address,
            pending,
            task: Mutex::new(Some(task)),
        }))
    }

    /// Where servers should send replies
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    fn register(&self, correlation_id: &str) -> oneshot::Receiver<Envelope> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending.lock().insert(
            correlation_id.to_string(),
            PendingCall {
                reply_tx,
                started_at: Instant::now(),
            },
        );
        reply_rx
    }

    fn forget(&self, correlation_id: &str) {
        self.pending.lock().remove(correlation_id);
    }

    /// Stop consuming; callers still waiting time out
    pub async fn stop(&self) {
        let task = self.task.lock().take();
        if let Some(task) = task {
            task.abort();
            let _ = task.await;
        }
    }
}

impl std::fmt::Debug for ReplyRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplyRouter")
            .field("address", &self.address)
            .field("pending", &self.pending_count())
            .finish()
    }
}

struct InvokerInner {
    contract: ServiceContract,
    broker: Arc<dyn Broker>,
    serializer: SharedSerializer,
    router: Arc<ReplyRouter>,
}

/// Call adapter for one contract; typed clients delegate every method here
#[derive(Clone)]
pub struct ClientInvoker {
    inner: Arc<InvokerInner>,
}

impl ClientInvoker {
    pub fn new(
        contract: ServiceContract,
        broker: Arc<dyn Broker>,
        serializer: SharedSerializer,
        router: Arc<ReplyRouter>,
    ) -> Self {
        Self {
            inner: Arc::new(InvokerInner {
                contract,
                broker,
                serializer,
                router,
            }),
        }
    }

    pub fn contract(&self) -> &ServiceContract {
        &self.inner.contract
    }

    pub fn reply_timeout(&self) -> Duration {
        self.inner.contract.options.reply_timeout
    }

    /// Pick the signature from the static argument types at the call site
    fn signature<'a>(&'a self, method: &'a str, args: &CallArgs) -> Result<&'a MethodSignature> {
        let contract = &self.inner.contract;
        let static_types = args.static_types();

        let matching: Vec<&MethodSignature> = contract
            .candidates(method, static_types.len())
            .filter(|signature| {
                signature
                    .params
                    .iter()
                    .zip(&static_types)
                    .all(|(param, ty)| param.ty.is_assignable_from(ty))
            })
            .collect();

        let exact: Vec<&MethodSignature> = matching
            .iter()
            .copied()
            .filter(|signature| signature.param_types() == static_types)
            .collect();

        match (exact.as_slice(), matching.as_slice()) {
            ([only], _) | ([], [only]) => Ok(*only),
            ([], []) => Err(RabbitRpcError::MethodNotFound {
                service_name: contract.name.clone(),
                method_name: method.to_string(),
            }),
            _ => Err(RabbitRpcError::AmbiguousMethod {
                service_name: contract.name.clone(),
                method_name: method.to_string(),
                candidates: matching.iter().map(|signature| signature.key()).collect(),
            }),
        }
    }

    async fn request(&self, signature: &MethodSignature, args: &CallArgs) -> Result<Envelope> {
        let payload = self.inner.serializer.encode_values(args.values()).await?;
        Ok(
            Envelope::request(&self.inner.contract.name, &signature.name, payload)
                .with_param_types(&signature.param_types()),
        )
    }

    async fn publish(&self, envelope: Envelope) -> Result<()> {
        let topology = &self.inner.contract.topology;
        self.inner
            .broker
            .publish(&topology.exchange, &topology.routing_key, envelope)
            .await
    }

    /// Publish and wait for the correlated reply
    async fn round_trip(&self, signature: &MethodSignature, args: &CallArgs) -> Result<Envelope> {
        let reply_timeout = self.reply_timeout();
        let correlation_id = Uuid::new_v4().to_string();
        let router = &self.inner.router;

        let envelope = self
            .request(signature, args)
            .await?
            .with_correlation_id(&correlation_id)
            .with_reply_to(router.address())
            .with_expiration_ms(reply_timeout.as_millis() as u64);

        let reply_rx = router.register(&correlation_id);
        if let Err(e) = self.publish(envelope).await {
            router.forget(&correlation_id);
            return Err(e);
        }
        debug!(
            "Calling {}::{} ({})",
            self.inner.contract.name,
            signature.key(),
            correlation_id
        );

        match timeout(reply_timeout, reply_rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(RabbitRpcError::internal_error("reply router stopped")),
            Err(_) => {
                router.forget(&correlation_id);
                warn!(
                    "{}::{}() timed out after {:?}",
                    self.inner.contract.name, signature.name, reply_timeout
                );
                Err(RabbitRpcError::Timeout {
                    timeout_ms: reply_timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Call a method that returns a value
    pub async fn call<R: RpcType>(&self, method: &str, args: CallArgs) -> Result<R> {
        let signature = self.signature(method, &args)?;
        if signature.fire_and_forget {
            return Err(RabbitRpcError::internal_error(format!(
                "{}::{} is fire-and-forget and returns nothing",
                self.inner.contract.name,
                signature.key()
            )));
        }

        let reply = self.round_trip(signature, &args).await?;
        match self.inner.serializer.decode_reply::<R>(&reply).await? {
            ReplyOutcome::Value(value) => Ok(value),
            ReplyOutcome::Null | ReplyOutcome::Void => R::null().ok_or_else(|| {
                RabbitRpcError::from(SerializationError::UnexpectedNull(R::type_name()))
            }),
            ReplyOutcome::Error(response) => Err(into_client_error(response)),
        }
    }

    /// Call a void method and wait for it to finish
    pub async fn call_void(&self, method: &str, args: CallArgs) -> Result<()> {
        let signature = self.signature(method, &args)?;
        if signature.fire_and_forget {
            self.notify(method, args).await;
            return Ok(());
        }

        let reply = self.round_trip(signature, &args).await?;
        match self.inner.serializer.decode_reply::<VoidResponse>(&reply).await? {
            ReplyOutcome::Error(response) => Err(into_client_error(response)),
            _ => Ok(()),
        }
    }

    /// Publish without waiting. Never fails; local problems are logged.
    pub async fn notify(&self, method: &str, args: CallArgs) {
        let sent: Result<()> = async {
            let signature = self.signature(method, &args)?;
            let envelope = self.request(signature, &args).await?;
            self.publish(envelope).await
        }
        .await;

        match sent {
            Ok(()) => debug!("Sent {}::{}()", self.inner.contract.name, method),
            Err(e) => error!(
                "Fire-and-forget {}::{}() not sent: {}",
                self.inner.contract.name, method, e
            ),
        }
    }
}

impl std::fmt::Debug for ClientInvoker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientInvoker")
            .field("contract", &self.inner.contract.name)
            .field("reply_to", &self.inner.router.address())
            .finish()
    }
}
