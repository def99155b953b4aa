//! Idempotent exchange/queue/binding provisioning and reconciliation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::broker::{Broker, BrokerEvent, ExchangeSpec, QueueInfo};
use crate::contract::Topology;
use crate::error::{RabbitRpcError, Result};

/// Provisions topology once and puts it back when the broker loses it
pub struct TopologyManager {
    broker: Arc<dyn Broker>,
    /// queue -> what was provisioned for it
    desired: Mutex<HashMap<String, Topology>>,
    restored: broadcast::Sender<String>,
    recovery_interval: Duration,
    reconcile_interval: Duration,
}

impl TopologyManager {
    pub fn new(broker: Arc<dyn Broker>, recovery_interval: Duration, reconcile_interval: Duration) -> Self {
        let (restored, _) = broadcast::channel(64);
        Self {
            broker,
            desired: Mutex::new(HashMap::new()),
            restored,
            recovery_interval,
            reconcile_interval,
        }
    }

    /// Declare `spec` unless a passive probe finds it
    pub async fn ensure_exchange(&self, spec: &ExchangeSpec) -> Result<()> {
        let exists = self.broker.exchange_exists(&spec.name).await.map_err(|e| {
            RabbitRpcError::topology_error(format!("probing exchange '{}' failed: {}", spec.name, e))
        })?;
        if exists {
            debug!("Exchange {} already exists", spec.name);
            return Ok(());
        }

        self.broker.declare_exchange(spec).await.map_err(|e| {
            RabbitRpcError::topology_error(format!("declaring exchange '{}' failed: {}", spec.name, e))
        })?;
        info!("Declared exchange {}", spec.name);
        Ok(())
    }

    /// Declare the queue and its binding unless the queue already exists.
    ///
    /// The first topology recorded for a queue wins. A later one naming a
    /// different exchange or routing key for the same queue is rejected.
    pub async fn ensure_queue(&self, topology: &Topology) -> Result<QueueInfo> {
        self.record(topology)?;

        let existing = self.broker.queue_info(&topology.queue).await.map_err(|e| {
            RabbitRpcError::topology_error(format!("probing queue '{}' failed: {}", topology.queue, e))
        })?;
        if let Some(info) = existing {
            debug!("Queue {} already exists, binding left as is", topology.queue);
            return Ok(info);
        }

        let info = self.declare_queue_and_binding(topology).await?;
        info!(
            "Declared queue {} bound to {} with key {}",
            topology.queue, topology.exchange, topology.routing_key
        );
        Ok(info)
    }

    /// Exchange, then queue and binding
    pub async fn provision(&self, topology: &Topology) -> Result<QueueInfo> {
        self.ensure_exchange(&topology.exchange_spec()).await?;
        self.ensure_queue(topology).await
    }

    pub fn desired(&self, queue: &str) -> Option<Topology> {
        self.desired.lock().get(queue).cloned()
    }

    pub fn provisioned_queues(&self) -> Vec<String> {
        self.desired.lock().keys().cloned().collect()
    }

    /// Queue names announced after they were redeclared
    pub fn subscribe_restored(&self) -> broadcast::Receiver<String> {
        self.restored.subscribe()
    }

    /// Redeclare exchange, queue and binding of a provisioned queue
    pub async fn reconcile(&self, queue: &str) -> Result<()> {
        let topology = self.desired(queue).ok_or_else(|| {
            RabbitRpcError::topology_error(format!("queue '{}' was never provisioned", queue))
        })?;

        self.broker
            .declare_exchange(&topology.exchange_spec())
            .await
            .map_err(|e| {
                RabbitRpcError::topology_error(format!(
                    "redeclaring exchange '{}' failed: {}",
                    topology.exchange, e
                ))
            })?;
        self.declare_queue_and_binding(&topology).await?;

        info!("Topology for queue {} restored", queue);
        let _ = self.restored.send(queue.to_string());
        Ok(())
    }

    /// Watch for missing queues until `shutdown` flips to true
    pub fn run_reconciler(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let mut events = self.broker.events();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.reconcile_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    event = events.recv() => match event {
                        Ok(BrokerEvent::QueueMissing { queue }) => {
                            if self.desired(&queue).is_some() {
                                warn!("Queue {} is missing, reconciling", queue);
                                if !self.recover(&queue, &mut shutdown).await {
                                    break;
                                }
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!("Reconciler skipped {} broker events, checking all queues", skipped);
                            if !self.check_all(&mut shutdown).await {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            events = self.broker.events();
                        }
                    },
                    _ = ticker.tick() => {
                        if !self.check_all(&mut shutdown).await {
                            break;
                        }
                    }
                }
            }
            debug!("Topology reconciler stopped");
        })
    }

    async fn check_all(&self, shutdown: &mut watch::Receiver<bool>) -> bool {
        for queue in self.provisioned_queues() {
            match self.broker.queue_info(&queue).await {
                Ok(Some(_)) => {}
                Ok(None) => {
                    warn!("Queue {} is missing, reconciling", queue);
                    if !self.recover(&queue, shutdown).await {
                        return false;
                    }
                }
                Err(e) => warn!("Checking queue {} failed: {}", queue, e),
            }
        }
        true
    }

    /// Retry until restored; false when shut down first
    async fn recover(&self, queue: &str, shutdown: &mut watch::Receiver<bool>) -> bool {
        loop {
            match self.reconcile(queue).await {
                Ok(()) => return true,
                Err(e) => {
                    warn!(
                        "Reconciling queue {} failed, retrying in {:?}: {}",
                        queue, self.recovery_interval, e
                    );
                    tokio::select! {
                        _ = shutdown.changed() => return false,
                        _ = tokio::time::sleep(self.recovery_interval) => {}
                    }
                }
            }
        }
    }

    fn record(&self, topology: &Topology) -> Result<()> {
        let mut desired = self.desired.lock();
        match desired.get(&topology.queue) {
            Some(first)
                if first.exchange != topology.exchange || first.routing_key != topology.routing_key =>
            {
                Err(RabbitRpcError::topology_error(format!(
                    "queue '{}' is bound to {}/{} and cannot also take {}/{}",
                    topology.queue,
                    first.exchange,
                    first.routing_key,
                    topology.exchange,
                    topology.routing_key
                )))
            }
            Some(_) => Ok(()),
            None => {
                desired.insert(topology.queue.clone(), topology.clone());
                Ok(())
            }
        }
    }

    async fn declare_queue_and_binding(&self, topology: &Topology) -> Result<QueueInfo> {
        let info = self
            .broker
            .declare_queue(&topology.queue_spec())
            .await
            .map_err(|e| {
                RabbitRpcError::topology_error(format!("declaring queue '{}' failed: {}", topology.queue, e))
            })?;
        self.broker
            .declare_binding(&topology.queue, &topology.exchange, &topology.routing_key)
            .await
            .map_err(|e| {
                RabbitRpcError::topology_error(format!(
                    "binding queue '{}' to '{}' failed: {}",
                    topology.queue, topology.exchange, e
                ))
            })?;
        Ok(info)
    }
}

impl std::fmt::Debug for TopologyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TopologyManager")
            .field("queues", &self.provisioned_queues())
            .field("recovery_interval", &self.recovery_interval)
            .finish()
    }
}
