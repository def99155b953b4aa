//! Service contracts: method signatures, topology and per-contract options.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::broker::{ExchangeSpec, QueueSpec};
use crate::client::ClientInvoker;
use crate::config::{Settings, ValueResolver};
use crate::error::{RabbitRpcError, Result};
use crate::serializer::{CodecInstance, SerializationError};
use crate::types::{ErasedValue, RpcType, TypeDescriptor};
use crate::validation::Constraint;

/// Decodes one argument slot into the parameter's concrete type
pub type ParamDecoder =
    fn(Option<&[u8]>, &mut CodecInstance) -> std::result::Result<Box<dyn ErasedValue>, SerializationError>;

fn decode_param<T: RpcType>(
    body: Option<&[u8]>,
    codec: &mut CodecInstance,
) -> std::result::Result<Box<dyn ErasedValue>, SerializationError> {
    T::decode_body(body, codec).map(|value| Box::new(value) as Box<dyn ErasedValue>)
}

/// A declared parameter
#[derive(Clone)]
pub struct ParamSpec {
    pub name: String,
    pub ty: TypeDescriptor,
    pub constraints: Vec<Constraint>,
    pub decoder: ParamDecoder,
}

impl ParamSpec {
    pub fn of<T: RpcType>(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ty: TypeDescriptor::of::<T>(),
            constraints: Vec::new(),
            decoder: decode_param::<T>,
        }
    }

    pub fn nullable(&self) -> bool {
        self.ty.nullable
    }
}

impl fmt::Debug for ParamSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParamSpec")
            .field("name", &self.name)
            .field("ty", &self.ty.name)
            .field("nullable", &self.ty.nullable)
            .field("constraints", &self.constraints)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReturnType {
    Void,
    Value(TypeDescriptor),
}

/// One callable method of a contract; several may share a name
#[derive(Debug, Clone)]
pub struct MethodSignature {
    pub name: String,
    pub params: Vec<ParamSpec>,
    pub returns: ReturnType,
    pub fire_and_forget: bool,
}

impl MethodSignature {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: Vec::new(),
            returns: ReturnType::Void,
            fire_and_forget: false,
        }
    }

    pub fn param<T: RpcType>(mut self, name: impl Into<String>) -> Self {
        self.params.push(ParamSpec::of::<T>(name));
        self
    }

    /// Attach a constraint to the most recently added parameter
    pub fn constrained(mut self, constraint: Constraint) -> Self {
        if let Some(param) = self.params.last_mut() {
            param.constraints.push(constraint);
        }
        self
    }

    pub fn returns<T: RpcType>(mut self) -> Self {
        self.returns = ReturnType::Value(TypeDescriptor::of::<T>());
        self
    }

    pub fn fire_and_forget(mut self) -> Self {
        self.fire_and_forget = true;
        self
    }

    pub fn arity(&self) -> usize {
        self.params.len()
    }

    pub fn is_void(&self) -> bool {
        self.returns == ReturnType::Void
    }

    pub fn param_types(&self) -> Vec<String> {
        self.params.iter().map(|param| param.ty.name.clone()).collect()
    }

    /// `name(type,type)`, unique within a contract
    pub fn key(&self) -> String {
        format!("{}({})", self.name, self.param_types().join(","))
    }
}

/// Consumer count range for a queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Concurrency {
    pub min: usize,
    pub max: usize,
}

impl Concurrency {
    pub fn fixed(count: usize) -> Self {
        Self {
            min: count,
            max: count,
        }
    }

    pub fn range(min: usize, max: usize) -> Result<Self> {
        if min == 0 || max < min {
            return Err(RabbitRpcError::config_error(format!(
                "invalid concurrency range {}-{}",
                min, max
            )));
        }
        Ok(Self { min, max })
    }
}

impl Default for Concurrency {
    fn default() -> Self {
        Self::fixed(1)
    }
}

impl FromStr for Concurrency {
    type Err = RabbitRpcError;

    /// Parse `"min"` or `"min-max"`
    fn from_str(s: &str) -> Result<Self> {
        let parse = |part: &str| {
            part.trim().parse::<usize>().map_err(|_| {
                RabbitRpcError::config_error(format!("invalid concurrency '{}'", s))
            })
        };

        match s.split_once('-') {
            Some((min, max)) => Self::range(parse(min)?, parse(max)?),
            None => {
                let count = parse(s)?;
                Self::range(count, count)
            }
        }
    }
}

impl fmt::Display for Concurrency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.min == self.max {
            write!(f, "{}", self.min)
        } else {
            write!(f, "{}-{}", self.min, self.max)
        }
    }
}

/// Where a contract's traffic flows
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    pub exchange: String,
    pub queue: String,
    pub routing_key: String,
    pub exchange_durable: bool,
    pub exchange_auto_delete: bool,
    pub queue_durable: bool,
    pub concurrency: Concurrency,
}

impl Topology {
    pub fn new(
        exchange: impl Into<String>,
        queue: impl Into<String>,
        routing_key: impl Into<String>,
    ) -> Self {
        Self {
            exchange: exchange.into(),
            queue: queue.into(),
            routing_key: routing_key.into(),
            exchange_durable: false,
            exchange_auto_delete: true,
            queue_durable: false,
            concurrency: Concurrency::default(),
        }
    }

    pub fn with_concurrency(mut self, concurrency: Concurrency) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn exchange_spec(&self) -> ExchangeSpec {
        ExchangeSpec::direct(&self.exchange)
            .durable(self.exchange_durable)
            .auto_delete(self.exchange_auto_delete)
    }

    pub fn queue_spec(&self) -> QueueSpec {
        QueueSpec::new(&self.queue).durable(self.queue_durable)
    }
}

/// Contract settings as written by the application, possibly templated
/// with `${key}` / `${key:default}` and `@resource` references
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ContractDeclaration {
    pub exchange: String,
    pub queue: String,
    pub routing: String,
    pub durable: bool,
    pub concurrency: Option<String>,
    pub executor: Option<String>,
    pub serializer: Option<String>,
    pub error_handler: Option<String>,
    pub reply_timeout_ms: Option<String>,
    pub allowed_patterns: Vec<String>,
}

impl ContractDeclaration {
    pub fn new(exchange: impl Into<String>, queue: impl Into<String>, routing: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into(),
            queue: queue.into(),
            routing: routing.into(),
            ..Self::default()
        }
    }

    pub fn concurrency(mut self, concurrency: impl Into<String>) -> Self {
        self.concurrency = Some(concurrency.into());
        self
    }

    pub fn executor(mut self, executor: impl Into<String>) -> Self {
        self.executor = Some(executor.into());
        self
    }

    pub fn serializer(mut self, serializer: impl Into<String>) -> Self {
        self.serializer = Some(serializer.into());
        self
    }

    pub fn error_handler(mut self, error_handler: impl Into<String>) -> Self {
        self.error_handler = Some(error_handler.into());
        self
    }

    pub fn reply_timeout_ms(mut self, reply_timeout_ms: impl Into<String>) -> Self {
        self.reply_timeout_ms = Some(reply_timeout_ms.into());
        self
    }

    pub fn allow(mut self, pattern: impl Into<String>) -> Self {
        self.allowed_patterns.push(pattern.into());
        self
    }

    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    /// Resolve every template once, at startup
    pub fn resolve(&self, resolver: &ValueResolver, settings: &Settings) -> Result<(Topology, ContractOptions)> {
        let exchange = resolver.resolve(&self.exchange)?;
        let queue = resolver.resolve(&self.queue)?;
        let routing = resolver.resolve(&self.routing)?;
        if exchange.is_empty() || queue.is_empty() {
            return Err(RabbitRpcError::config_error(format!(
                "exchange and queue must be set (exchange '{}', queue '{}')",
                self.exchange, self.queue
            )));
        }

        let concurrency = match self.concurrency.as_deref().map(|c| resolver.resolve(c)).transpose()? {
            Some(value) if !value.trim().is_empty() => value.parse()?,
            _ => settings.default_concurrency.parse()?,
        };

        let reply_timeout = match self.reply_timeout_ms.as_deref().map(|t| resolver.resolve(t)).transpose()? {
            Some(value) if !value.trim().is_empty() => {
                let millis = value.trim().parse::<u64>().map_err(|_| {
                    RabbitRpcError::config_error(format!("invalid reply timeout '{}'", value))
                })?;
                Duration::from_millis(millis)
            }
            _ => Duration::from_millis(settings.reply_timeout_ms),
        };

        let mut topology = Topology::new(exchange, queue, routing).with_concurrency(concurrency);
        topology.queue_durable = self.durable;
        topology.exchange_durable = self.durable;
        topology.exchange_auto_delete = !self.durable;

        let options = ContractOptions {
            executor: resolver.resource_ref(self.executor.as_deref())?,
            serializer: resolver.resource_ref(self.serializer.as_deref())?,
            error_handler: resolver.resource_ref(self.error_handler.as_deref())?,
            reply_timeout,
            allowed_patterns: self
                .allowed_patterns
                .iter()
                .map(|pattern| resolver.resolve(pattern))
                .collect::<Result<Vec<_>>>()?,
        };

        Ok((topology, options))
    }
}

/// Resolved per-contract options; resource fields hold registry names
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContractOptions {
    pub executor: Option<String>,
    pub serializer: Option<String>,
    pub error_handler: Option<String>,
    pub reply_timeout: Duration,
    pub allowed_patterns: Vec<String>,
}

impl Default for ContractOptions {
    fn default() -> Self {
        Self {
            executor: None,
            serializer: None,
            error_handler: None,
            reply_timeout: Duration::from_millis(crate::config::DEFAULT_REPLY_TIMEOUT_MS),
            allowed_patterns: Vec::new(),
        }
    }
}

/// Static description of a contract, produced by `#[rpc_interface]` or by hand
#[derive(Debug, Clone)]
pub struct ContractDescriptor {
    /// Canonical contract name, unique per runtime
    pub name: String,
    pub declaration: ContractDeclaration,
    pub methods: Vec<MethodSignature>,
}

impl ContractDescriptor {
    pub fn new(name: impl Into<String>, declaration: ContractDeclaration) -> Self {
        Self {
            name: name.into(),
            declaration,
            methods: Vec::new(),
        }
    }

    pub fn method(mut self, signature: MethodSignature) -> Self {
        self.methods.push(signature);
        self
    }

    /// Reject contracts that cannot be served or called
    pub fn check(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(RabbitRpcError::config_error("contract name must not be empty"));
        }

        let mut keys = std::collections::BTreeSet::new();
        for method in &self.methods {
            if method.fire_and_forget && !method.is_void() {
                return Err(RabbitRpcError::config_error(format!(
                    "fire-and-forget method {}::{} must not return a value",
                    self.name,
                    method.key()
                )));
            }
            if !keys.insert(method.key()) {
                return Err(RabbitRpcError::config_error(format!(
                    "method {}::{} is declared twice",
                    self.name,
                    method.key()
                )));
            }
        }
        Ok(())
    }
}

/// A contract after startup resolution; immutable from then on
#[derive(Debug, Clone)]
pub struct ServiceContract {
    pub name: String,
    pub methods: Vec<MethodSignature>,
    pub topology: Topology,
    pub options: ContractOptions,
}

impl ServiceContract {
    pub fn resolve(descriptor: &ContractDescriptor, resolver: &ValueResolver, settings: &Settings) -> Result<Self> {
        descriptor.check()?;
        let (topology, options) = descriptor.declaration.resolve(resolver, settings)?;
        Ok(Self {
            name: descriptor.name.clone(),
            methods: descriptor.methods.clone(),
            topology,
            options,
        })
    }

    /// Signatures callable with `method` and `arity` arguments, in declaration order
    pub fn candidates<'a>(&'a self, method: &'a str, arity: usize) -> impl Iterator<Item = &'a MethodSignature> + 'a {
        self.methods
            .iter()
            .filter(move |signature| signature.name == method && signature.arity() == arity)
    }
}

/// A typed service interface with a generated or hand-written client adapter
pub trait RpcInterface: 'static {
    type Client: Send + Sync + 'static;

    fn descriptor() -> ContractDescriptor;

    fn client(invoker: ClientInvoker) -> Self::Client;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn concurrency_parses_fixed_and_ranges() {
        assert_eq!("4".parse::<Concurrency>().unwrap(), Concurrency::fixed(4));
        assert_eq!(
            " 2 - 8 ".parse::<Concurrency>().unwrap(),
            Concurrency { min: 2, max: 8 }
        );
        assert!("8-2".parse::<Concurrency>().is_err());
        assert!("0".parse::<Concurrency>().is_err());
        assert!("many".parse::<Concurrency>().is_err());
        assert_eq!(Concurrency { min: 2, max: 8 }.to_string(), "2-8");
    }

    #[test]
    fn signature_keys_include_parameter_types() {
        let signature = MethodSignature::new("process")
            .param::<String>("text")
            .param::<Option<i32>>("count")
            .returns::<String>();
        assert_eq!(signature.key(), "process(std.String,std.i32)");
        assert!(signature.params[1].nullable());
        assert!(!signature.is_void());
    }

    #[test]
    fn fire_and_forget_methods_must_be_void() {
        let descriptor = ContractDescriptor::new("svc", ContractDeclaration::new("x", "q", "r"))
            .method(MethodSignature::new("log").param::<String>("line").returns::<bool>().fire_and_forget());
        assert!(matches!(descriptor.check(), Err(RabbitRpcError::Config(_))));
    }

    #[test]
    fn duplicate_signatures_are_rejected() {
        let descriptor = ContractDescriptor::new("svc", ContractDeclaration::new("x", "q", "r"))
            .method(MethodSignature::new("get").param::<i64>("id"))
            .method(MethodSignature::new("get").param::<i64>("other"));
        assert!(descriptor.check().is_err());
    }

    #[test]
    fn declarations_resolve_templates_and_defaults() {
        let settings = Settings::default();
        let mut resolver = ValueResolver::new();
        resolver.set("rpc.queue", "users-q");

        let declaration = ContractDeclaration::new("users-x", "${rpc.queue}", "${rpc.routing:users}")
            .concurrency("2-4")
            .serializer("@compact");
        let (topology, options) = declaration.resolve(&resolver, &settings).unwrap();

        assert_eq!(topology.queue, "users-q");
        assert_eq!(topology.routing_key, "users");
        assert_eq!(topology.concurrency, Concurrency { min: 2, max: 4 });
        assert!(!topology.queue_durable);
        assert!(topology.exchange_auto_delete);
        assert_eq!(options.serializer.as_deref(), Some("compact"));
        assert_eq!(options.reply_timeout, Duration::from_millis(settings.reply_timeout_ms));
    }
}
