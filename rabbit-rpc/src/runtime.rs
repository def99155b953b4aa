//! Startup: resolve contracts, provision topology, compile the dispatch
//! table, then start consumers, the reconciler and the reply router.

use std::any::TypeId;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::broker::Broker;
use crate::client::{ClientInvoker, ReplyRouter};
use crate::config::{ResourceRegistry, Settings, ValueResolver};
use crate::contract::{ContractDescriptor, RpcInterface, ServiceContract, Topology};
use crate::dispatch::{DispatchTable, ServiceBinding};
use crate::error::{RabbitRpcError, Result};
use crate::error_handler::{ErrorHandler, ErrorMapping, ErrorTranslator};
use crate::serializer::{AllowListStrategy, PoolConfig, SerializerBuilder, SharedSerializer};
use crate::server::{ConsumerPool, PoolSettings, ServerDispatcher};
use crate::topology::TopologyManager;
use crate::validation::{ConstraintValidator, Validator};

/// Collects services, clients and collaborators before [`RpcRuntimeBuilder::start`]
pub struct RpcRuntimeBuilder {
    broker: Arc<dyn Broker>,
    settings: Settings,
    resolver: ValueResolver,
    resources: ResourceRegistry,
    error_mapping: ErrorMapping,
    validator: Arc<dyn Validator>,
    services: Vec<ServiceBinding>,
    clients: Vec<(TypeId, ContractDescriptor)>,
}

impl RpcRuntimeBuilder {
    fn new(broker: Arc<dyn Broker>, settings: Settings) -> Self {
        Self {
            broker,
            resolver: ValueResolver::from_settings(&settings),
            settings,
            resources: ResourceRegistry::default(),
            error_mapping: ErrorMapping::new(),
            validator: Arc::new(ConstraintValidator),
            services: Vec::new(),
            clients: Vec::new(),
        }
    }

    pub fn resources(mut self, resources: ResourceRegistry) -> Self {
        self.resources = resources;
        self
    }

    pub fn error_mapping(mut self, error_mapping: ErrorMapping) -> Self {
        self.error_mapping = error_mapping;
        self
    }

    pub fn validator(mut self, validator: Arc<dyn Validator>) -> Self {
        self.validator = validator;
        self
    }

    /// Template property taking precedence over the settings' properties
    pub fn property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.resolver.set(key, value);
        self
    }

    /// Serve a contract with the given implementation
    pub fn serve(mut self, binding: ServiceBinding) -> Self {
        self.services.push(binding);
        self
    }

    /// Make a typed client for `I` available from the runtime
    pub fn client<I: RpcInterface>(mut self) -> Self {
        self.clients.push((TypeId::of::<I>(), I::descriptor()));
        self
    }

    /// Under the registration strategy every declared type of the
    /// contracts a serializer serves is registered up front
    fn registering<'a, I>(&self, builder: SerializerBuilder, contracts: I) -> SerializerBuilder
    where
        I: IntoIterator<Item = &'a ServiceContract>,
    {
        if self.settings.allow_list_strategy != AllowListStrategy::Registration {
            return builder;
        }
        contracts
            .into_iter()
            .fold(builder, |builder, contract| builder.register_signatures(&contract.methods))
    }

    /// Serializer shared by contracts naming neither a serializer nor extra patterns
    fn default_serializer<'a, I>(&self, contracts: I) -> Result<SharedSerializer>
    where
        I: IntoIterator<Item = &'a ServiceContract>,
    {
        let users = contracts
            .into_iter()
            .filter(|contract| contract.options.serializer.is_none() && contract.options.allowed_patterns.is_empty());
        let builder = self.registering(self.settings.serializer_builder("default"), users);
        Ok(Arc::new(builder.build()?))
    }

    fn serializer_for(&self, contract: &ServiceContract, default: &SharedSerializer) -> Result<SharedSerializer> {
        if let Some(name) = &contract.options.serializer {
            return self.resources.get_serializer(name);
        }
        if contract.options.allowed_patterns.is_empty() {
            return Ok(default.clone());
        }

        // Contract-specific allow-list on top of the configured one
        let concurrency = contract.topology.concurrency;
        let builder = self
            .settings
            .serializer_builder(contract.name.clone())
            .allow_all(contract.options.allowed_patterns.iter().cloned())
            .pool(
                PoolConfig::for_concurrency(concurrency.min, concurrency.max)
                    .with_acquire_timeout(default.pool().config().acquire_timeout),
            );
        let serializer = self.registering(builder, std::iter::once(contract)).build()?;
        Ok(Arc::new(serializer))
    }

    fn error_handler_for(
        &self,
        contract: &ServiceContract,
        default: &Arc<dyn ErrorHandler>,
    ) -> Result<Arc<dyn ErrorHandler>> {
        match &contract.options.error_handler {
            Some(name) => self.resources.get_error_handler(name),
            None => Ok(default.clone()),
        }
    }

    fn executor_for(&self, contract: &ServiceContract) -> Result<Handle> {
        match &contract.options.executor {
            Some(name) => self.resources.get_executor(name),
            None => Ok(Handle::current()),
        }
    }

    /// Exchanges first, then each queue under them
    async fn provision(&self, topology: &TopologyManager, contracts: &[ServiceContract]) -> Result<()> {
        let mut by_exchange: BTreeMap<&str, Vec<&Topology>> = BTreeMap::new();
        for contract in contracts {
            by_exchange
                .entry(contract.topology.exchange.as_str())
                .or_default()
                .push(&contract.topology);
        }

        for queues in by_exchange.values() {
            if let Some(first) = queues.first() {
                topology.ensure_exchange(&first.exchange_spec()).await?;
            }
            for queue in queues {
                topology.ensure_queue(queue).await?;
            }
        }
        Ok(())
    }

    /// Bring the runtime up; any failure aborts startup
    pub async fn start(mut self) -> Result<RpcRuntime> {
        let services = std::mem::take(&mut self.services);
        let error_mapping = std::mem::take(&mut self.error_mapping);
        let settings = &self.settings;
        info!(
            "Starting {} (server: {}, client: {})",
            settings.service_name, settings.enable_server, settings.enable_client
        );

        let (shutdown, shutdown_rx) = watch::channel(false);
        let topology = Arc::new(TopologyManager::new(
            self.broker.clone(),
            settings.recovery_interval(),
            settings.reconcile_interval(),
        ));

        let mut served = Vec::new();
        if settings.enable_server {
            for binding in &services {
                served.push(ServiceContract::resolve(binding.descriptor(), &self.resolver, settings)?);
            }
        } else if !services.is_empty() {
            info!("Server role disabled, {} services not started", services.len());
        }

        let mut called = Vec::new();
        if settings.enable_client {
            for (type_id, descriptor) in &self.clients {
                called.push((*type_id, ServiceContract::resolve(descriptor, &self.resolver, settings)?));
            }
        } else if !self.clients.is_empty() {
            info!("Client role disabled, {} clients not created", self.clients.len());
        }

        let default_serializer =
            self.default_serializer(served.iter().chain(called.iter().map(|(_, contract)| contract)))?;

        self.provision(&topology, &served).await?;
        for (_, contract) in &called {
            topology.ensure_exchange(&contract.topology.exchange_spec()).await?;
        }

        let mut runtime = RpcRuntime {
            topology: topology.clone(),
            dispatcher: None,
            pools: Vec::new(),
            router: None,
            invokers: HashMap::new(),
            client_types: HashMap::new(),
            shutdown,
            reconciler: Mutex::new(None),
        };

        if !served.is_empty() {
            let default_handler: Arc<dyn ErrorHandler> = Arc::new(ErrorTranslator::new(
                settings.service_name.clone(),
                error_mapping,
            ));

            let mut table = DispatchTable::builder();
            let mut serializers = Vec::new();
            let mut error_handlers = Vec::new();
            // queue -> (topology, executor) of the first contract bound to it
            let mut queues: Vec<(Topology, Handle)> = Vec::new();

            for (contract, binding) in served.iter().zip(services) {
                serializers.push((contract.name.clone(), self.serializer_for(contract, &default_serializer)?));
                error_handlers.push((contract.name.clone(), self.error_handler_for(contract, &default_handler)?));

                match queues.iter().find(|(topology, _)| topology.queue == contract.topology.queue) {
                    Some((first, _)) if first.concurrency != contract.topology.concurrency => warn!(
                        "Contract {} asks for {} consumers on {}, keeping {}",
                        contract.name, contract.topology.concurrency, first.queue, first.concurrency
                    ),
                    Some(_) => {}
                    None => queues.push((contract.topology.clone(), self.executor_for(contract)?)),
                }
                table.add(contract.clone(), binding)?;
            }

            let mut dispatcher = ServerDispatcher::new(
                Arc::new(table.build()),
                self.broker.clone(),
                self.validator.clone(),
                settings.service_name.clone(),
                default_serializer.clone(),
                default_handler,
            );
            for (contract, serializer) in serializers {
                dispatcher = dispatcher.with_serializer(contract, serializer);
            }
            for (contract, handler) in error_handlers {
                dispatcher = dispatcher.with_error_handler(contract, handler);
            }
            let dispatcher = Arc::new(dispatcher);

            for (queue, executor) in queues {
                let pool = ConsumerPool::start(
                    PoolSettings {
                        queue: queue.queue,
                        concurrency: queue.concurrency,
                        idle_timeout: settings.idle_timeout(),
                        recovery_interval: settings.recovery_interval(),
                    },
                    self.broker.clone(),
                    dispatcher.clone(),
                    topology.clone(),
                    executor,
                    shutdown_rx.clone(),
                );
                runtime.pools.push(pool);
            }
            runtime.dispatcher = Some(dispatcher);

            *runtime.reconciler.lock() = Some(topology.clone().run_reconciler(shutdown_rx.clone()));
        }

        if !called.is_empty() {
            let router = ReplyRouter::start(self.broker.clone(), shutdown_rx.clone()).await?;
            for (type_id, contract) in called {
                let serializer = self.serializer_for(&contract, &default_serializer)?;
                let name = contract.name.clone();
                let invoker = ClientInvoker::new(contract, self.broker.clone(), serializer, router.clone());
                runtime.client_types.insert(type_id, name.clone());
                runtime.invokers.insert(name, invoker);
            }
            runtime.router = Some(router);
        }

        info!(
            "{} started: {} queues served, {} clients",
            settings.service_name,
            runtime.pools.len(),
            runtime.invokers.len()
        );
        Ok(runtime)
    }
}

/// A started client and/or server
pub struct RpcRuntime {
    topology: Arc<TopologyManager>,
    dispatcher: Option<Arc<ServerDispatcher>>,
    pools: Vec<ConsumerPool>,
    router: Option<Arc<ReplyRouter>>,
    invokers: HashMap<String, ClientInvoker>,
    client_types: HashMap<TypeId, String>,
    shutdown: watch::Sender<bool>,
    reconciler: Mutex<Option<JoinHandle<()>>>,
}

impl RpcRuntime {
    pub fn builder(broker: Arc<dyn Broker>, settings: Settings) -> RpcRuntimeBuilder {
        RpcRuntimeBuilder::new(broker, settings)
    }

    /// Typed client for an interface registered with [`RpcRuntimeBuilder::client`]
    pub fn client<I: RpcInterface>(&self) -> Result<I::Client> {
        let name = self.client_types.get(&TypeId::of::<I>()).ok_or_else(|| {
            RabbitRpcError::ServiceNotFound {
                service_name: I::descriptor().name,
            }
        })?;
        let invoker = self.invoker(name).ok_or_else(|| RabbitRpcError::ServiceNotFound {
            service_name: name.clone(),
        })?;
        Ok(I::client(invoker))
    }

    pub fn invoker(&self, contract: &str) -> Option<ClientInvoker> {
        self.invokers.get(contract).cloned()
    }

    pub fn topology(&self) -> &Arc<TopologyManager> {
        &self.topology
    }

    pub fn dispatcher(&self) -> Option<&Arc<ServerDispatcher>> {
        self.dispatcher.as_ref()
    }

    pub fn pools(&self) -> &[ConsumerPool] {
        &self.pools
    }

    pub fn pool(&self, queue: &str) -> Option<&ConsumerPool> {
        self.pools.iter().find(|pool| pool.queue() == queue)
    }

    pub fn reply_router(&self) -> Option<&Arc<ReplyRouter>> {
        self.router.as_ref()
    }

    /// Stop consumers, the reconciler and the reply router. The broker
    /// itself stays open; it belongs to the caller.
    pub async fn shutdown(&self) {
        info!("Shutting down");
        let _ = self.shutdown.send(true);

        for pool in &self.pools {
            pool.join().await;
        }
        let reconciler = self.reconciler.lock().take();
        if let Some(reconciler) = reconciler {
            if let Err(e) = reconciler.await {
                warn!("Topology reconciler ended abnormally: {}", e);
            }
        }
        if let Some(router) = &self.router {
            router.stop().await;
        }
        info!("Shutdown complete");
    }
}

impl std::fmt::Debug for RpcRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcRuntime")
            .field("pools", &self.pools)
            .field("clients", &self.invokers.keys().collect::<Vec<_>>())
            .finish()
    }
}
