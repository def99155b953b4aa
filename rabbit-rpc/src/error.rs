use std::collections::BTreeMap;

use thiserror::Error;

use crate::serializer::SerializationError;

/// Result type alias for rabbit-rpc operations
pub type Result<T> = std::result::Result<T, RabbitRpcError>;

/// Error types surfaced by the RPC runtime, both locally and from remote services
#[derive(Error, Debug)]
pub enum RabbitRpcError {
    /// AMQP connection errors
    #[error("AMQP connection error: {0}")]
    Connection(#[from] lapin::Error),

    /// Encoding/decoding failures, including allow-list rejections
    #[error("Serialization error: {0}")]
    Serialization(#[from] SerializationError),

    /// The remote service rejected the call arguments
    #[error("Validation failed in service '{service_name}': {message}")]
    Validation {
        timestamp: i64,
        service_name: String,
        status_code: i32,
        message: String,
        binding_result: BTreeMap<String, String>,
    },

    /// The remote service answered with a non-validation error
    #[error("Service '{service_name}' failed with status {status_code}: {message}")]
    RemoteService {
        timestamp: i64,
        service_name: String,
        status_code: i32,
        message: String,
    },

    /// RPC timeout errors
    #[error("RPC call timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// No signature matched the call
    #[error("Method '{method_name}' not found in service '{service_name}'")]
    MethodNotFound {
        service_name: String,
        method_name: String,
    },

    /// Several signatures matched the call equally well
    #[error("Call to '{method_name}' in service '{service_name}' is ambiguous between {candidates:?}")]
    AmbiguousMethod {
        service_name: String,
        method_name: String,
        candidates: Vec<String>,
    },

    /// Service contract not registered with this runtime
    #[error("Service '{service_name}' not found")]
    ServiceNotFound { service_name: String },

    /// Exchange/queue/binding provisioning failures
    #[error("Topology error: {0}")]
    Topology(String),

    /// Invalid message format
    #[error("Invalid message format: {reason}")]
    InvalidMessage { reason: String },

    /// Broker level failures that are not AMQP protocol errors
    #[error("Broker error: {0}")]
    Broker(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal framework errors
    #[error("Internal error: {0}")]
    Internal(String),

    /// Generic errors from anyhow
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl RabbitRpcError {
    /// Create a new topology error
    pub fn topology_error<T: ToString>(message: T) -> Self {
        Self::Topology(message.to_string())
    }

    /// Create a new broker error
    pub fn broker_error<T: ToString>(message: T) -> Self {
        Self::Broker(message.to_string())
    }

    /// Create a new config error
    pub fn config_error<T: ToString>(message: T) -> Self {
        Self::Config(message.to_string())
    }

    /// Create a new internal error
    pub fn internal_error<T: ToString>(message: T) -> Self {
        Self::Internal(message.to_string())
    }

    /// Create a new invalid message error
    pub fn invalid_message<T: ToString>(reason: T) -> Self {
        Self::InvalidMessage {
            reason: reason.to_string(),
        }
    }

    /// Status code carried by an error that came back from a remote service
    pub fn status_code(&self) -> Option<i32> {
        match self {
            Self::Validation { status_code, .. } | Self::RemoteService { status_code, .. } => {
                Some(*status_code)
            }
            _ => None,
        }
    }

    /// Field to message map of a remote validation failure
    pub fn binding_result(&self) -> Option<&BTreeMap<String, String>> {
        match self {
            Self::Validation { binding_result, .. } => Some(binding_result),
            _ => None,
        }
    }

    /// Check if error is recoverable (should be retried)
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Connection(_) | Self::Timeout { .. } | Self::Broker(_)
        )
    }
}
