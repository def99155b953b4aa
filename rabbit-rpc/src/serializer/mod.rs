//! Pooled codecs behind a type allow-list.
//!
//! A payload is a [`Frame`]: one slot per argument (or a single slot for a
//! reply), each slot tagged with the runtime type name of its value. Tags are
//! checked against the [`AllowList`] before any slot body is decoded, and
//! again on the producing side before anything is written.

pub mod codec;
pub mod pool;

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::contract::{MethodSignature, ReturnType};
use crate::envelope::{
    Envelope, ErrorResponse, NullResponse, ReplyBody, ReplyOutcome, VoidResponse,
    FALLBACK_ERROR_CONTENT_TYPE,
};
use crate::error::{RabbitRpcError, Result};
use crate::types::{Arguments, ErasedValue, RpcType, TypeDescriptor};

pub use codec::{BincodeCodec, Codec, CodecInstance, Format, JsonCodec, DEFAULT_CHARSET};
pub use pool::{CodecPool, PoolConfig, PooledCodec};

/// Patterns every allow-list starts with
pub const DEFAULT_ALLOWED_PATTERNS: [&str; 4] = ["std.*", "chrono.*", "uuid.*", "rpc.*"];

/// Encode/decode failures, including allow-list rejections
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SerializationError {
    #[error("codec failure: {0}")]
    Codec(String),

    #[error("type '{type_name}' is not permitted by the serialization allow-list")]
    NotAllowed { type_name: String },

    #[error("type '{type_name}' is not registered with serializer '{serializer}'")]
    NotRegistered { type_name: String, serializer: String },

    #[error("content type mismatch: expected '{expected}', found '{found}'")]
    ContentTypeMismatch { expected: String, found: String },

    #[error("null value for non-nullable type '{0}'")]
    UnexpectedNull(String),

    #[error("expected {expected} values, found {found}")]
    Arity { expected: usize, found: usize },

    #[error("value of type '{found}' cannot be read as '{expected}'")]
    TypeMismatch { expected: String, found: String },

    #[error("timed out after {waited_ms}ms waiting for a codec instance")]
    PoolExhausted { waited_ms: u64 },

    #[error("codec pool is closed")]
    PoolClosed,
}

/// How the allow-list is enforced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllowListStrategy {
    /// Application types must be registered up front
    Registration,
    /// Every slot tag is matched against the patterns
    #[default]
    TagCheck,
}

/// Permitted type-name patterns: `exact.Name` or `prefix.*`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllowList {
    patterns: Vec<String>,
}

impl AllowList {
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut all: Vec<String> = DEFAULT_ALLOWED_PATTERNS.iter().map(|p| p.to_string()).collect();
        for pattern in patterns {
            let pattern: String = pattern.into();
            let pattern = pattern.trim();
            if !pattern.is_empty() && !all.iter().any(|p| p == pattern) {
                all.push(pattern.to_string());
            }
        }
        Self { patterns: all }
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    /// Whether every atom of `type_name` matches some pattern
    pub fn permits(&self, type_name: &str) -> bool {
        type_atoms(type_name).all(|atom| self.permits_atom(atom))
    }

    fn permits_atom(&self, atom: &str) -> bool {
        self.patterns.iter().any(|pattern| match pattern.strip_suffix('*') {
            Some(prefix) => atom.starts_with(prefix),
            None => pattern == atom,
        })
    }
}

impl Default for AllowList {
    fn default() -> Self {
        Self::new(Vec::<String>::new())
    }
}

/// Split `std.HashMap<std.String,app.User>` into its simple names
pub fn type_atoms(type_name: &str) -> impl Iterator<Item = &str> {
    type_name
        .split(|c: char| c == '<' || c == '>' || c == ',' || c.is_whitespace())
        .filter(|atom| !atom.is_empty())
}

fn is_builtin(atom: &str) -> bool {
    DEFAULT_ALLOWED_PATTERNS
        .iter()
        .filter_map(|pattern| pattern.strip_suffix('*'))
        .any(|prefix| atom.starts_with(prefix))
}

/// Wire payload: one optional slot per value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    pub slots: Vec<Option<Slot>>,
}

impl Frame {
    /// Runtime type tags, `None` for null slots
    pub fn tags(&self) -> Vec<Option<&str>> {
        self.slots
            .iter()
            .map(|slot| slot.as_ref().map(|slot| slot.type_name.as_str()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// One encoded value with its runtime type tag
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    pub type_name: String,
    pub body: Vec<u8>,
}

/// Encoded bytes stamped with the codec that produced them
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    pub body: Vec<u8>,
    pub content_type: String,
    pub content_encoding: String,
}

/// Builder for a [`Serializer`]
#[derive(Debug, Clone)]
pub struct SerializerBuilder {
    name: String,
    format: Format,
    pool: PoolConfig,
    patterns: Vec<String>,
    strategy: AllowListStrategy,
    registered: BTreeSet<String>,
}

impl SerializerBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            format: Format::default(),
            pool: PoolConfig::default(),
            patterns: Vec::new(),
            strategy: AllowListStrategy::default(),
            registered: BTreeSet::new(),
        }
    }

    pub fn format(mut self, format: Format) -> Self {
        self.format = format;
        self
    }

    pub fn pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }

    pub fn strategy(mut self, strategy: AllowListStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Permit a type-name pattern
    pub fn allow(mut self, pattern: impl Into<String>) -> Self {
        self.patterns.push(pattern.into());
        self
    }

    pub fn allow_all<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.patterns.extend(patterns.into_iter().map(Into::into));
        self
    }

    /// Pre-register `T` together with every variant it accepts
    pub fn register<T: RpcType>(self) -> Self {
        self.register_type(&TypeDescriptor::of::<T>())
    }

    /// Register a declared type, its accepted variants and the element
    /// types nested in its name (`std.Vec<app.User>` registers `app.User`)
    pub fn register_type(mut self, ty: &TypeDescriptor) -> Self {
        let names = std::iter::once(&ty.name).chain(&ty.accepts);
        for name in names {
            for atom in type_atoms(name) {
                if !is_builtin(atom) {
                    self.registered.insert(atom.to_string());
                }
            }
        }
        self
    }

    /// Register every parameter and return type of `signatures`
    pub fn register_signatures<'a, I>(self, signatures: I) -> Self
    where
        I: IntoIterator<Item = &'a MethodSignature>,
    {
        signatures.into_iter().fold(self, |builder, signature| {
            let builder = signature
                .params
                .iter()
                .fold(builder, |builder, param| builder.register_type(&param.ty));
            match &signature.returns {
                ReturnType::Value(ty) => builder.register_type(ty),
                ReturnType::Void => builder,
            }
        })
    }

    pub fn build(self) -> Result<Serializer> {
        let allow_list = AllowList::new(self.patterns);

        if let Some(rejected) = self.registered.iter().find(|name| !allow_list.permits(name)) {
            return Err(RabbitRpcError::config_error(format!(
                "serializer '{}' registers '{}' which no allowed pattern permits",
                self.name, rejected
            )));
        }

        debug!(
            "Serializer '{}' built ({}, {:?}, patterns {:?})",
            self.name,
            self.format.content_type(),
            self.strategy,
            allow_list.patterns()
        );

        Ok(Serializer {
            name: self.name,
            pool: CodecPool::new(self.format, self.pool),
            allow_list,
            strategy: self.strategy,
            registered: self.registered,
        })
    }
}

/// Thread-safe serializer shared by every consumer of a contract
pub type SharedSerializer = Arc<Serializer>;

/// Pool-backed codec front end enforcing the allow-list
#[derive(Debug)]
pub struct Serializer {
    name: String,
    pool: CodecPool,
    allow_list: AllowList,
    strategy: AllowListStrategy,
    registered: BTreeSet<String>,
}

impl Serializer {
    pub fn builder(name: impl Into<String>) -> SerializerBuilder {
        SerializerBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn content_type(&self) -> &'static str {
        self.pool.content_type()
    }

    pub fn strategy(&self) -> AllowListStrategy {
        self.strategy
    }

    pub fn allow_list(&self) -> &AllowList {
        &self.allow_list
    }

    pub fn pool(&self) -> &CodecPool {
        &self.pool
    }

    /// Reject a type tag the allow-list does not admit
    pub fn admit(&self, type_name: &str) -> std::result::Result<(), SerializationError> {
        for atom in type_atoms(type_name) {
            if !self.allow_list.permits_atom(atom) {
                return Err(SerializationError::NotAllowed {
                    type_name: type_name.to_string(),
                });
            }
            if self.strategy == AllowListStrategy::Registration
                && !is_builtin(atom)
                && !self.registered.contains(atom)
            {
                return Err(SerializationError::NotRegistered {
                    type_name: type_name.to_string(),
                    serializer: self.name.clone(),
                });
            }
        }
        Ok(())
    }

    /// Encode a single value
    pub async fn encode<T: RpcType>(&self, value: &T) -> Result<Payload> {
        self.encode_values(std::iter::once(value as &dyn ErasedValue)).await
    }

    /// Decode a single value produced by [`Serializer::encode`]
    pub async fn decode<T: RpcType>(&self, payload: &Payload) -> Result<T> {
        self.verify_stamp(Some(payload.content_type.as_str()), Some(payload.content_encoding.as_str()))?;
        let mut codec = self.pool.acquire().await?;
        let frame: Frame = codec.decode(&payload.body)?;
        if frame.len() != 1 {
            return Err(SerializationError::Arity {
                expected: 1,
                found: frame.len(),
            }
            .into());
        }

        match frame.slots.into_iter().next().flatten() {
            Some(slot) => {
                self.admit(&slot.type_name)?;
                ensure_assignable::<T>(&slot.type_name)?;
                Ok(T::decode_body(Some(slot.body.as_slice()), &mut codec)?)
            }
            None => Ok(T::decode_body(None, &mut codec)?),
        }
    }

    /// Encode an argument list; each value is tagged with its runtime type
    pub async fn encode_values<'a, I>(&self, values: I) -> Result<Payload>
    where
        I: IntoIterator<Item = &'a dyn ErasedValue>,
    {
        let mut codec = self.pool.acquire().await?;
        let mut slots = Vec::new();
        for value in values {
            slots.push(self.encode_slot(value, &mut codec)?);
        }
        self.finish(Frame { slots }, &mut codec)
    }

    /// Decode the frame of an incoming envelope, checking every tag
    pub async fn decode_frame(&self, envelope: &Envelope) -> Result<Frame> {
        self.verify_stamp(
            envelope.content_type.as_deref(),
            envelope.content_encoding.as_deref(),
        )?;
        let frame: Frame = {
            let mut codec = self.pool.acquire().await?;
            codec.decode(&envelope.body)?
        };
        for tag in frame.tags().into_iter().flatten() {
            self.admit(tag)?;
        }
        Ok(frame)
    }

    /// Turn a resolved frame into typed arguments using the signature's decoders
    pub async fn materialize(&self, frame: &Frame, signature: &MethodSignature) -> Result<Arguments> {
        if frame.len() != signature.params.len() {
            return Err(SerializationError::Arity {
                expected: signature.params.len(),
                found: frame.len(),
            }
            .into());
        }

        let mut codec = self.pool.acquire().await?;
        let mut values = Vec::with_capacity(frame.len());
        for (slot, param) in frame.slots.iter().zip(&signature.params) {
            let value = match slot {
                Some(slot) => Some((param.decoder)(Some(slot.body.as_slice()), &mut codec)?),
                None => None,
            };
            values.push(value);
        }
        Ok(Arguments::new(values))
    }

    /// Encode a reply; returns the payload and the `__TypeId__` to stamp
    pub async fn encode_reply(&self, reply: &ReplyBody) -> Result<(Payload, String)> {
        let mut codec = self.pool.acquire().await?;
        let slot = match reply {
            ReplyBody::Void => self.encode_slot(&VoidResponse, &mut codec)?,
            ReplyBody::Null => self.encode_slot(&NullResponse, &mut codec)?,
            ReplyBody::Error(response) => self.encode_slot(response, &mut codec)?,
            ReplyBody::Value(value) if value.is_absent() => {
                self.encode_slot(&NullResponse, &mut codec)?
            }
            ReplyBody::Value(value) => self.encode_slot(&**value, &mut codec)?,
        };

        let type_id = slot
            .as_ref()
            .map(|slot| slot.type_name.clone())
            .unwrap_or_else(NullResponse::type_name);
        let payload = self.finish(Frame { slots: vec![slot] }, &mut codec)?;
        Ok((payload, type_id))
    }

    /// Decode a reply into the caller's declared return type
    pub async fn decode_reply<R: RpcType>(&self, envelope: &Envelope) -> Result<ReplyOutcome<R>> {
        if envelope.content_type.as_deref() == Some(FALLBACK_ERROR_CONTENT_TYPE) {
            let response: ErrorResponse = serde_json::from_slice(&envelope.body)
                .map_err(|e| SerializationError::Codec(e.to_string()))?;
            return Ok(ReplyOutcome::Error(response));
        }

        let frame = self.decode_frame(envelope).await?;
        if frame.len() != 1 {
            return Err(SerializationError::Arity {
                expected: 1,
                found: frame.len(),
            }
            .into());
        }
        let slot = match frame.slots.into_iter().next().flatten() {
            Some(slot) => slot,
            None => return Ok(ReplyOutcome::Null),
        };

        if let Some(type_id) = envelope.type_id() {
            if type_id != slot.type_name {
                warn!(
                    "Reply type id '{}' differs from payload tag '{}'",
                    type_id, slot.type_name
                );
            }
        }

        let mut codec = self.pool.acquire().await?;
        let tag = slot.type_name.as_str();
        if tag == VoidResponse::type_name() {
            Ok(ReplyOutcome::Void)
        } else if tag == NullResponse::type_name() {
            Ok(ReplyOutcome::Null)
        } else if tag == ErrorResponse::type_name() {
            let response = ErrorResponse::decode_body(Some(slot.body.as_slice()), &mut codec)?;
            Ok(ReplyOutcome::Error(response))
        } else {
            ensure_assignable::<R>(tag)?;
            Ok(ReplyOutcome::Value(R::decode_body(Some(slot.body.as_slice()), &mut codec)?))
        }
    }

    fn encode_slot(
        &self,
        value: &dyn ErasedValue,
        codec: &mut CodecInstance,
    ) -> std::result::Result<Option<Slot>, SerializationError> {
        let type_name = value.type_tag();
        self.admit(&type_name)?;
        Ok(value
            .write_body(codec)?
            .map(|body| Slot { type_name, body }))
    }

    fn finish(
        &self,
        frame: Frame,
        codec: &mut CodecInstance,
    ) -> Result<Payload> {
        Ok(Payload {
            body: codec.encode(&frame)?,
            content_type: codec.content_type().to_string(),
            content_encoding: DEFAULT_CHARSET.to_string(),
        })
    }

    fn verify_stamp(
        &self,
        content_type: Option<&str>,
        content_encoding: Option<&str>,
    ) -> std::result::Result<(), SerializationError> {
        let expected = self.content_type();
        let found_type = content_type.unwrap_or_default();
        if found_type != expected {
            return Err(SerializationError::ContentTypeMismatch {
                expected: expected.to_string(),
                found: found_type.to_string(),
            });
        }

        let found_encoding = content_encoding.unwrap_or_default();
        if !found_encoding.eq_ignore_ascii_case(DEFAULT_CHARSET) {
            return Err(SerializationError::ContentTypeMismatch {
                expected: format!("{}; charset={}", expected, DEFAULT_CHARSET),
                found: format!("{}; charset={}", found_type, found_encoding),
            });
        }
        Ok(())
    }
}

fn ensure_assignable<T: RpcType>(tag: &str) -> std::result::Result<(), SerializationError> {
    if TypeDescriptor::of::<T>().is_assignable_from(tag) {
        Ok(())
    } else {
        Err(SerializationError::TypeMismatch {
            expected: T::type_name(),
            found: tag.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CallArgs;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct User {
        id: u64,
        name: String,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Secret(String);

    crate::rpc_type!(User => "app.User", Secret => "vault.Secret");

    fn tag_check() -> Serializer {
        Serializer::builder("test").allow("app.*").build().unwrap()
    }

    #[test]
    fn allow_list_checks_every_atom() {
        let list = AllowList::new(["app.User", "billing.*"]);
        assert!(list.permits("std.Vec<app.User>"));
        assert!(list.permits("std.HashMap<std.String,billing.Invoice>"));
        assert!(!list.permits("std.Vec<app.Order>"));
        assert!(!list.permits("vault.Secret"));
        assert_eq!(list.patterns().len(), DEFAULT_ALLOWED_PATTERNS.len() + 2);
    }

    #[tokio::test]
    async fn single_values_round_trip() {
        let serializer = tag_check();
        let user = User {
            id: 1,
            name: "ada".into(),
        };
        let payload = serializer.encode(&user).await.unwrap();
        assert_eq!(payload.content_type, "application/x-bincode");
        assert_eq!(payload.content_encoding, "UTF-8");
        assert_eq!(serializer.decode::<User>(&payload).await.unwrap(), user);

        let nothing = serializer.encode(&None::<User>).await.unwrap();
        assert_eq!(serializer.decode::<Option<User>>(&nothing).await.unwrap(), None);
    }

    #[tokio::test]
    async fn producing_a_disallowed_type_fails() {
        let serializer = tag_check();
        let err = serializer.encode(&Secret("x".into())).await.unwrap_err();
        assert!(matches!(
            err,
            RabbitRpcError::Serialization(SerializationError::NotAllowed { .. })
        ));
    }

    #[tokio::test]
    async fn disallowed_tags_are_rejected_before_materialization() {
        let permissive = Serializer::builder("sender").allow("vault.*").build().unwrap();
        let args = CallArgs::new().arg(Secret("x".into()));
        let payload = permissive.encode_values(args.values()).await.unwrap();
        let envelope = Envelope::request("svc", "store", payload);

        let err = tag_check().decode_frame(&envelope).await.unwrap_err();
        assert!(matches!(
            err,
            RabbitRpcError::Serialization(SerializationError::NotAllowed { .. })
        ));
    }

    #[tokio::test]
    async fn registration_requires_registered_types() {
        let unregistered = Serializer::builder("strict")
            .strategy(AllowListStrategy::Registration)
            .allow("app.*")
            .build()
            .unwrap();
        let user = User {
            id: 2,
            name: "bob".into(),
        };
        assert!(matches!(
            unregistered.encode(&user).await,
            Err(RabbitRpcError::Serialization(SerializationError::NotRegistered { .. }))
        ));
        assert!(unregistered.encode(&"built-ins are fine".to_string()).await.is_ok());

        let registered = Serializer::builder("strict")
            .strategy(AllowListStrategy::Registration)
            .allow("app.*")
            .register::<User>()
            .build()
            .unwrap();
        assert!(registered.encode(&vec![user]).await.is_ok());
    }

    #[tokio::test]
    async fn signatures_register_nested_parameter_and_return_types() {
        let signatures = [
            MethodSignature::new("save").param::<Vec<User>>("users"),
            MethodSignature::new("find").param::<String>("name").returns::<Option<User>>(),
        ];
        let serializer = Serializer::builder("strict")
            .strategy(AllowListStrategy::Registration)
            .allow("app.*")
            .register_signatures(&signatures)
            .build()
            .unwrap();

        let user = User {
            id: 3,
            name: "cy".into(),
        };
        let payload = serializer.encode(&Some(user.clone())).await.unwrap();
        assert_eq!(serializer.decode::<Option<User>>(&payload).await.unwrap(), Some(user));
        assert!(serializer.admit("std.Vec<app.User>").is_ok());
        assert!(matches!(
            serializer.admit("app.Order"),
            Err(SerializationError::NotRegistered { .. })
        ));
    }

    #[test]
    fn registering_a_type_outside_the_patterns_is_a_config_error() {
        let result = Serializer::builder("strict")
            .strategy(AllowListStrategy::Registration)
            .register::<Secret>()
            .build();
        assert!(matches!(result, Err(RabbitRpcError::Config(_))));
    }

    #[tokio::test]
    async fn content_type_stamp_is_verified() {
        let bincode = tag_check();
        let json = Serializer::builder("json").format(Format::Json).build().unwrap();

        let payload = json.encode(&"hello".to_string()).await.unwrap();
        assert_eq!(payload.content_type, "application/json");
        let err = bincode.decode::<String>(&payload).await.unwrap_err();
        assert!(matches!(
            err,
            RabbitRpcError::Serialization(SerializationError::ContentTypeMismatch { .. })
        ));

        let mut unstamped = Envelope::request("svc", "m", payload);
        unstamped.content_encoding = None;
        assert!(json.decode_frame(&unstamped).await.is_err());
    }

    #[tokio::test]
    async fn replies_carry_markers_and_type_ids() {
        let serializer = tag_check();
        let request = Envelope::request("svc", "m", serializer.encode(&1i32).await.unwrap());

        let (payload, type_id) = serializer.encode_reply(&ReplyBody::Void).await.unwrap();
        assert_eq!(type_id, "rpc.Void");
        let reply = Envelope::reply_to_request(&request, payload);
        assert_eq!(
            serializer.decode_reply::<String>(&reply).await.unwrap(),
            ReplyOutcome::Void
        );

        let absent = ReplyBody::Value(Box::new(None::<String>));
        let (payload, type_id) = serializer.encode_reply(&absent).await.unwrap();
        assert_eq!(type_id, "rpc.Null");
        let reply = Envelope::reply_to_request(&request, payload);
        assert_eq!(
            serializer.decode_reply::<Option<String>>(&reply).await.unwrap(),
            ReplyOutcome::Null
        );

        let value = ReplyBody::Value(Box::new(7i64));
        let (payload, type_id) = serializer.encode_reply(&value).await.unwrap();
        assert_eq!(type_id, "std.i64");
        let reply = Envelope::reply_to_request(&request, payload);
        assert_eq!(
            serializer.decode_reply::<i64>(&reply).await.unwrap(),
            ReplyOutcome::Value(7)
        );
        assert!(serializer.decode_reply::<String>(&reply).await.is_err());
    }

    #[tokio::test]
    async fn fallback_error_envelopes_decode_as_errors() {
        let serializer = tag_check();
        let mut envelope = Envelope::new(Payload {
            body: serde_json::to_vec(&ErrorResponse::new(500, "svc", "Internal server error"))
                .unwrap(),
            content_type: FALLBACK_ERROR_CONTENT_TYPE.into(),
            content_encoding: DEFAULT_CHARSET.into(),
        });
        envelope.correlation_id = Some("c".into());

        match serializer.decode_reply::<String>(&envelope).await.unwrap() {
            ReplyOutcome::Error(response) => assert_eq!(response.status_code, 500),
            other => panic!("unexpected outcome {:?}", other),
        }
    }
}
