//! # rabbit-rpc - Typed RPC over AMQP
//!
//! Services are described once, as a trait, and then served or called over a
//! RabbitMQ broker. Each contract names an exchange, a queue and a routing
//! key; the runtime provisions them, keeps them in place, and moves calls as
//! tagged argument frames with correlated replies.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use rabbit_rpc::{async_trait, rpc_interface, AmqpBroker, RpcRuntime, Settings};
//!
//! #[rpc_interface(exchange = "greeter-x", queue = "greeter-q", routing = "greeter")]
//! pub trait Greeter {
//!     async fn greet(&self, #[not_blank] name: String) -> anyhow::Result<String>;
//! }
//!
//! struct Polite;
//!
//! #[async_trait]
//! impl Greeter for Polite {
//!     async fn greet(&self, name: String) -> anyhow::Result<String> {
//!         Ok(format!("Hello, {}", name))
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let settings = Settings::load()?;
//!     let broker = Arc::new(AmqpBroker::connect(settings.connection.clone()).await?);
//!
//!     let runtime = RpcRuntime::builder(broker, settings)
//!         .serve(GreeterContract::binding(Arc::new(Polite)))
//!         .client::<GreeterContract>()
//!         .start()
//!         .await?;
//!
//!     let greeter = runtime.client::<GreeterContract>()?;
//!     println!("{}", greeter.greet("world".to_string()).await?);
//!
//!     runtime.shutdown().await;
//!     Ok(())
//! }
//! ```

extern crate self as rabbit_rpc;

pub mod broker;
pub mod client;
pub mod config;
pub mod contract;
pub mod dispatch;
pub mod envelope;
pub mod error;
pub mod error_handler;
pub mod runtime;
pub mod serializer;
pub mod server;
pub mod topology;
pub mod types;
pub mod validation;

pub use broker::{AmqpBroker, Broker, BrokerEvent, ConnectionConfig, MemoryBroker};
pub use client::{ClientInvoker, ReplyRouter};
pub use config::{ResourceRegistry, Settings, ValueResolver};
pub use contract::{
    Concurrency, ContractDeclaration, ContractDescriptor, MethodSignature, RpcInterface, ServiceContract, Topology,
};
pub use dispatch::{DispatchTable, ServiceBinding};
pub use envelope::{Envelope, ErrorResponse};
pub use error::{RabbitRpcError, Result};
pub use error_handler::{ErrorHandler, ErrorMapping, ErrorTranslator, ServiceException, StatusCode};
pub use runtime::{RpcRuntime, RpcRuntimeBuilder};
pub use serializer::{AllowListStrategy, Format, Serializer};
pub use server::{ConsumerPool, ServerDispatcher};
pub use topology::TopologyManager;
pub use types::{Arguments, CallArgs, Returned, RpcType};
pub use validation::{Constraint, ConstraintValidator, Validator, Violation};

pub use async_trait::async_trait;
pub use rabbit_rpc_macros::rpc_interface;

/// Used by generated code; not part of the public API
#[doc(hidden)]
pub mod __private {
    pub use anyhow;
}
