use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::serializer::Payload;
use crate::types::{ErasedValue, RpcType};

/// Canonical name of the target service contract
pub const SERVICE_HEADER: &str = "__Service__";
/// Name of the invoked method
pub const METHOD_HEADER: &str = "__Method__";
/// Concrete runtime type of a reply value
pub const TYPE_ID_HEADER: &str = "__TypeId__";
/// Static parameter types at the call site, `;` separated
pub const PARAM_TYPES_HEADER: &str = "__ParamTypes__";

/// Content type of the error envelope published when the regular error
/// reply could not be encoded. The body is always a JSON [`ErrorResponse`].
pub const FALLBACK_ERROR_CONTENT_TYPE: &str = "application/vnd.rabbit-rpc.error+json";

const PARAM_TYPES_SEPARATOR: &str = ";";

/// Addressed unit moved between client and server
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub message_id: Uuid,
    pub body: Vec<u8>,
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub headers: BTreeMap<String, String>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub expiration_ms: Option<u64>,
    pub timestamp: DateTime<Utc>,
}

impl Envelope {
    /// Wrap an encoded payload
    pub fn new(payload: Payload) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            body: payload.body,
            content_type: Some(payload.content_type),
            content_encoding: Some(payload.content_encoding),
            headers: BTreeMap::new(),
            correlation_id: None,
            reply_to: None,
            expiration_ms: None,
            timestamp: Utc::now(),
        }
    }

    /// Create a request addressed to `service`.`method`
    pub fn request(service: impl Into<String>, method: impl Into<String>, payload: Payload) -> Self {
        Self::new(payload)
            .with_header(SERVICE_HEADER, service)
            .with_header(METHOD_HEADER, method)
    }

    /// Create the reply for `request`, carrying its correlation id
    pub fn reply_to_request(request: &Envelope, payload: Payload) -> Self {
        let mut reply = Self::new(payload);
        reply.correlation_id = request.correlation_id.clone();
        if let Some(service) = request.service_id() {
            reply = reply.with_header(SERVICE_HEADER, service);
        }
        reply
    }

    /// Add a header to the envelope
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    pub fn with_expiration_ms(mut self, expiration_ms: u64) -> Self {
        self.expiration_ms = Some(expiration_ms);
        self
    }

    pub fn with_param_types(self, types: &[String]) -> Self {
        self.with_header(PARAM_TYPES_HEADER, types.join(PARAM_TYPES_SEPARATOR))
    }

    /// Get header value
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    pub fn service_id(&self) -> Option<&str> {
        self.header(SERVICE_HEADER)
    }

    pub fn method_name(&self) -> Option<&str> {
        self.header(METHOD_HEADER)
    }

    pub fn type_id(&self) -> Option<&str> {
        self.header(TYPE_ID_HEADER)
    }

    /// Static parameter types sent by the caller, if it sent any
    pub fn param_types(&self) -> Option<Vec<String>> {
        self.header(PARAM_TYPES_HEADER).map(|joined| {
            if joined.is_empty() {
                Vec::new()
            } else {
                joined.split(PARAM_TYPES_SEPARATOR).map(str::to_string).collect()
            }
        })
    }

    /// Whether the sender waits for an answer
    pub fn expects_reply(&self) -> bool {
        self.reply_to.as_deref().is_some_and(|address| !address.is_empty())
    }
}

/// Error payload carried by a reply when the call failed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    /// Epoch millis at which the error was produced
    pub timestamp: i64,
    pub status_code: i32,
    pub service_name: String,
    pub message: String,
    pub binding_result: Option<BTreeMap<String, String>>,
}

impl ErrorResponse {
    pub fn new(status_code: i32, service_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now().timestamp_millis(),
            status_code,
            service_name: service_name.into(),
            message: message.into(),
            binding_result: None,
        }
    }

    pub fn with_binding_result(mut self, binding_result: BTreeMap<String, String>) -> Self {
        self.binding_result = Some(binding_result);
        self
    }
}

impl RpcType for ErrorResponse {
    fn type_name() -> String {
        String::from("rpc.ErrorResponse")
    }
}

/// Reply marker for a method declared without a return value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct VoidResponse;

impl RpcType for VoidResponse {
    fn type_name() -> String {
        String::from("rpc.Void")
    }
}

/// Reply marker for a method that returned an absent value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NullResponse;

impl RpcType for NullResponse {
    fn type_name() -> String {
        String::from("rpc.Null")
    }
}

/// What the server puts in a reply
#[derive(Debug)]
pub enum ReplyBody {
    Void,
    Null,
    Value(Box<dyn ErasedValue>),
    Error(ErrorResponse),
}

/// A decoded reply, as seen by the caller
#[derive(Debug, PartialEq)]
pub enum ReplyOutcome<R> {
    Void,
    Null,
    Value(R),
    Error(ErrorResponse),
}
