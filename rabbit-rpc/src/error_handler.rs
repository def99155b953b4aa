//! Translation between service-side failures and wire error responses.

use std::collections::BTreeMap;
use std::fmt;

use chrono::Utc;
use thiserror::Error;
use tracing::error;

use crate::envelope::{ErrorResponse, FALLBACK_ERROR_CONTENT_TYPE};
use crate::error::RabbitRpcError;
use crate::serializer::{Payload, DEFAULT_CHARSET};
use crate::validation::{binding_result, failure_message, Violation};

pub const INTERNAL_ERROR_MESSAGE: &str = "Internal server error";

/// Status codes carried by error responses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StatusCode(pub i32);

impl StatusCode {
    pub const BAD_REQUEST: StatusCode = StatusCode(400);
    pub const UNAUTHORIZED: StatusCode = StatusCode(401);
    pub const FORBIDDEN: StatusCode = StatusCode(403);
    pub const NOT_FOUND: StatusCode = StatusCode(404);
    pub const INTERNAL_SERVER_ERROR: StatusCode = StatusCode(500);

    pub fn code(self) -> i32 {
        self.0
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A failure that already knows how it should look on the wire
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ServiceException {
    pub timestamp: i64,
    pub service_name: String,
    pub status_code: i32,
    pub message: String,
}

impl ServiceException {
    pub fn new(service_name: impl Into<String>, status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now().timestamp_millis(),
            service_name: service_name.into(),
            status_code: status.code(),
            message: message.into(),
        }
    }
}

/// Argument or object constraint violations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ValidationException {
    pub timestamp: i64,
    pub service_name: String,
    pub status_code: i32,
    pub message: String,
    pub binding_result: BTreeMap<String, String>,
}

impl ValidationException {
    pub fn from_violations(service_name: impl Into<String>, violations: &[Violation]) -> Self {
        let binding = binding_result(violations);
        Self {
            timestamp: Utc::now().timestamp_millis(),
            service_name: service_name.into(),
            status_code: StatusCode::BAD_REQUEST.code(),
            message: failure_message(&binding),
            binding_result: binding,
        }
    }
}

fn is_error_type<E>(err: &anyhow::Error) -> bool
where
    E: std::error::Error + Send + Sync + 'static,
{
    err.downcast_ref::<E>().is_some() || err.chain().any(|cause| cause.is::<E>())
}

fn find<E>(err: &anyhow::Error) -> Option<&E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    err.downcast_ref::<E>()
        .or_else(|| err.chain().find_map(|cause| cause.downcast_ref::<E>()))
}

struct MappingEntry {
    type_name: &'static str,
    status: StatusCode,
    matches: fn(&anyhow::Error) -> bool,
}

/// Ordered error type to status table; first matching entry wins
#[derive(Default)]
pub struct ErrorMapping {
    entries: Vec<MappingEntry>,
}

impl ErrorMapping {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn map<E>(mut self, status: StatusCode) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.entries.push(MappingEntry {
            type_name: std::any::type_name::<E>(),
            status,
            matches: is_error_type::<E>,
        });
        self
    }

    pub fn status_for(&self, err: &anyhow::Error) -> Option<StatusCode> {
        self.entries
            .iter()
            .find(|entry| (entry.matches)(err))
            .map(|entry| entry.status)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for ErrorMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.entries.iter().map(|e| (e.type_name, e.status.code())))
            .finish()
    }
}

/// Where a failure happened
#[derive(Debug, Clone, Copy)]
pub struct ErrorContext<'a> {
    pub contract: &'a str,
    pub method: &'a str,
}

/// Turns a failed invocation into the response sent back to the caller
pub trait ErrorHandler: Send + Sync {
    fn handle(&self, err: &anyhow::Error, context: ErrorContext<'_>) -> ErrorResponse;
}

/// Default [`ErrorHandler`]: explicit mapping, then validation, then
/// service exceptions; everything else becomes a logged 500
#[derive(Debug)]
pub struct ErrorTranslator {
    service_name: String,
    mapping: ErrorMapping,
}

impl ErrorTranslator {
    pub fn new(service_name: impl Into<String>, mapping: ErrorMapping) -> Self {
        Self {
            service_name: service_name.into(),
            mapping,
        }
    }

    fn by_mapping(&self, err: &anyhow::Error, status: StatusCode) -> ErrorResponse {
        let timestamp = find::<ValidationException>(err)
            .map(|e| e.timestamp)
            .or_else(|| find::<ServiceException>(err).map(|e| e.timestamp))
            .unwrap_or_else(|| Utc::now().timestamp_millis());

        ErrorResponse {
            timestamp,
            status_code: status.code(),
            service_name: self.service_name.clone(),
            message: err.to_string(),
            binding_result: find::<ValidationException>(err).map(|e| e.binding_result.clone()),
        }
    }

    fn by_default(&self, err: &anyhow::Error) -> ErrorResponse {
        if let Some(validation) = find::<ValidationException>(err) {
            ErrorResponse {
                timestamp: validation.timestamp,
                status_code: validation.status_code,
                service_name: validation.service_name.clone(),
                message: validation.message.clone(),
                binding_result: Some(validation.binding_result.clone()),
            }
        } else if let Some(service) = find::<ServiceException>(err) {
            ErrorResponse {
                timestamp: service.timestamp,
                status_code: service.status_code,
                service_name: service.service_name.clone(),
                message: service.message.clone(),
                binding_result: None,
            }
        } else {
            ErrorResponse::new(
                StatusCode::INTERNAL_SERVER_ERROR.code(),
                &self.service_name,
                INTERNAL_ERROR_MESSAGE,
            )
        }
    }
}

impl ErrorHandler for ErrorTranslator {
    fn handle(&self, err: &anyhow::Error, context: ErrorContext<'_>) -> ErrorResponse {
        let response = match self.mapping.status_for(err) {
            Some(status) => self.by_mapping(err, status),
            None => self.by_default(err),
        };

        if response.status_code == StatusCode::INTERNAL_SERVER_ERROR.code() {
            error!(
                "RPC call {}::{}() failed: {:#}",
                context.contract, context.method, err
            );
        }
        response
    }
}

/// Raise a received error response as a typed client error
pub fn into_client_error(response: ErrorResponse) -> RabbitRpcError {
    if response.status_code == StatusCode::BAD_REQUEST.code() {
        RabbitRpcError::Validation {
            timestamp: response.timestamp,
            service_name: response.service_name,
            status_code: response.status_code,
            message: response.message,
            binding_result: response.binding_result.unwrap_or_default(),
        }
    } else {
        RabbitRpcError::RemoteService {
            timestamp: response.timestamp,
            service_name: response.service_name,
            status_code: response.status_code,
            message: response.message,
        }
    }
}

/// JSON error payload used when the regular error reply cannot be encoded
pub fn fallback_error_payload(service_name: &str) -> Payload {
    let response = ErrorResponse::new(
        StatusCode::INTERNAL_SERVER_ERROR.code(),
        service_name,
        INTERNAL_ERROR_MESSAGE,
    );
    let body = serde_json::to_vec(&response).unwrap_or_else(|_| {
        br#"{"timestamp":0,"statusCode":500,"serviceName":"","message":"Internal server error","bindingResult":null}"#
            .to_vec()
    });

    Payload {
        body,
        content_type: FALLBACK_ERROR_CONTENT_TYPE.to_string(),
        content_encoding: DEFAULT_CHARSET.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Error)]
    #[error("user {0} not found")]
    struct NotFound(u64);

    #[derive(Debug, Error)]
    #[error("boom")]
    struct Boom;

    fn context() -> ErrorContext<'static> {
        ErrorContext {
            contract: "app::Users",
            method: "find",
        }
    }

    fn translator() -> ErrorTranslator {
        ErrorTranslator::new(
            "users",
            ErrorMapping::new().map::<NotFound>(StatusCode::NOT_FOUND),
        )
    }

    #[test]
    fn mapped_errors_use_their_status() {
        let err = anyhow::Error::new(NotFound(7));
        let response = translator().handle(&err, context());
        assert_eq!(response.status_code, 404);
        assert_eq!(response.message, "user 7 not found");
        assert_eq!(response.service_name, "users");
    }

    #[test]
    fn mapping_sees_through_context() {
        let err = anyhow::Error::new(NotFound(1)).context("loading profile");
        assert_eq!(translator().handle(&err, context()).status_code, 404);
    }

    #[test]
    fn validation_becomes_bad_request_with_bindings() {
        let violations = vec![Violation::new("id", "must not be null")];
        let err = anyhow::Error::new(ValidationException::from_violations("users", &violations));
        let response = translator().handle(&err, context());
        assert_eq!(response.status_code, 400);
        assert_eq!(response.message, "Validation failed for fields: id");
        assert_eq!(
            response.binding_result.unwrap().get("id").map(String::as_str),
            Some("must not be null")
        );
    }

    #[test]
    fn service_exceptions_propagate_verbatim() {
        let exception = ServiceException {
            timestamp: 42,
            service_name: "billing".into(),
            status_code: 403,
            message: "forbidden".into(),
        };
        let response = translator().handle(&anyhow::Error::new(exception), context());
        assert_eq!(
            (response.timestamp, response.status_code, response.service_name.as_str()),
            (42, 403, "billing")
        );
    }

    #[test]
    fn anything_else_is_a_generic_internal_error() {
        let response = translator().handle(&anyhow::Error::new(Boom), context());
        assert_eq!(response.status_code, 500);
        assert_eq!(response.message, INTERNAL_ERROR_MESSAGE);
    }

    #[test]
    fn client_errors_follow_the_status() {
        let mut binding = BTreeMap::new();
        binding.insert("User.email".to_string(), "must be a well-formed email address".to_string());
        let validation =
            into_client_error(ErrorResponse::new(400, "users", "bad").with_binding_result(binding));
        assert!(validation.binding_result().unwrap().contains_key("User.email"));

        let remote = into_client_error(ErrorResponse::new(404, "users", "missing"));
        assert!(matches!(remote, RabbitRpcError::RemoteService { status_code: 404, .. }));
    }

    #[test]
    fn fallback_payload_is_plain_json() {
        let payload = fallback_error_payload("users");
        assert_eq!(payload.content_type, FALLBACK_ERROR_CONTENT_TYPE);
        let response: ErrorResponse = serde_json::from_slice(&payload.body).unwrap();
        assert_eq!(response.status_code, 500);
        assert_eq!(response.message, INTERNAL_ERROR_MESSAGE);
    }
}
