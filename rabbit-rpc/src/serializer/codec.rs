use bincode::Options;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::SerializationError;

/// Content type stamped on payloads produced by [`BincodeCodec`]
pub const BINCODE_CONTENT_TYPE: &str = "application/x-bincode";
/// Content type stamped on payloads produced by [`JsonCodec`]
pub const JSON_CONTENT_TYPE: &str = "application/json";
/// Charset stamped next to the content type
pub const DEFAULT_CHARSET: &str = "UTF-8";

const DEFAULT_SCRATCH_CAPACITY: usize = 8 * 1024;
const DEFAULT_MAX_PAYLOAD_BYTES: u64 = 16 * 1024 * 1024;

/// A serde-driven codec instance.
///
/// Instances keep reusable scratch state and take `&mut self`, so a single
/// instance must never be shared between concurrent calls. The
/// [`CodecPool`](super::CodecPool) hands them out one caller at a time.
pub trait Codec: Send + 'static {
    /// MIME type identifying payloads written by this codec
    fn content_type(&self) -> &'static str;

    /// Encode a value to bytes
    fn encode<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<Vec<u8>, SerializationError>;

    /// Decode a value from bytes
    fn decode<T: DeserializeOwned>(&mut self, bytes: &[u8]) -> Result<T, SerializationError>;
}

/// Wire formats understood by the built-in codecs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    #[default]
    Bincode,
    Json,
}

impl Format {
    pub fn content_type(self) -> &'static str {
        match self {
            Format::Bincode => BINCODE_CONTENT_TYPE,
            Format::Json => JSON_CONTENT_TYPE,
        }
    }
}

/// Compact binary codec backed by bincode with a bounded decode size
#[derive(Debug)]
pub struct BincodeCodec {
    scratch: Vec<u8>,
    max_payload_bytes: u64,
}

impl BincodeCodec {
    pub fn new() -> Self {
        Self::with_limit(DEFAULT_MAX_PAYLOAD_BYTES)
    }

    pub fn with_limit(max_payload_bytes: u64) -> Self {
        Self {
            scratch: Vec::with_capacity(DEFAULT_SCRATCH_CAPACITY),
            max_payload_bytes,
        }
    }

    fn options(&self) -> impl Options {
        bincode::DefaultOptions::new()
            .with_fixint_encoding()
            .with_limit(self.max_payload_bytes)
    }
}

impl Default for BincodeCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Codec for BincodeCodec {
    fn content_type(&self) -> &'static str {
        BINCODE_CONTENT_TYPE
    }

    fn encode<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<Vec<u8>, SerializationError> {
        let options = self.options();
        self.scratch.clear();
        options
            .serialize_into(&mut self.scratch, value)
            .map_err(|e| SerializationError::Codec(e.to_string()))?;
        Ok(self.scratch.clone())
    }

    fn decode<T: DeserializeOwned>(&mut self, bytes: &[u8]) -> Result<T, SerializationError> {
        self.options()
            .deserialize(bytes)
            .map_err(|e| SerializationError::Codec(e.to_string()))
    }
}

/// Human readable codec, handy for debugging traffic in the broker UI
#[derive(Debug)]
pub struct JsonCodec {
    scratch: Vec<u8>,
}

impl JsonCodec {
    pub fn new() -> Self {
        Self {
            scratch: Vec::with_capacity(DEFAULT_SCRATCH_CAPACITY),
        }
    }
}

impl Default for JsonCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Codec for JsonCodec {
    fn content_type(&self) -> &'static str {
        JSON_CONTENT_TYPE
    }

    fn encode<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<Vec<u8>, SerializationError> {
        self.scratch.clear();
        serde_json::to_writer(&mut self.scratch, value)
            .map_err(|e| SerializationError::Codec(e.to_string()))?;
        Ok(self.scratch.clone())
    }

    fn decode<T: DeserializeOwned>(&mut self, bytes: &[u8]) -> Result<T, SerializationError> {
        serde_json::from_slice(bytes).map_err(|e| SerializationError::Codec(e.to_string()))
    }
}

/// The pooled codec: one of the built-in formats
#[derive(Debug)]
pub enum CodecInstance {
    Bincode(BincodeCodec),
    Json(JsonCodec),
}

impl CodecInstance {
    pub fn new(format: Format) -> Self {
        match format {
            Format::Bincode => CodecInstance::Bincode(BincodeCodec::new()),
            Format::Json => CodecInstance::Json(JsonCodec::new()),
        }
    }
}

impl Codec for CodecInstance {
    fn content_type(&self) -> &'static str {
        match self {
            CodecInstance::Bincode(codec) => codec.content_type(),
            CodecInstance::Json(codec) => codec.content_type(),
        }
    }

    fn encode<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<Vec<u8>, SerializationError> {
        match self {
            CodecInstance::Bincode(codec) => codec.encode(value),
            CodecInstance::Json(codec) => codec.encode(value),
        }
    }

    fn decode<T: DeserializeOwned>(&mut self, bytes: &[u8]) -> Result<T, SerializationError> {
        match self {
            CodecInstance::Bincode(codec) => codec.decode(bytes),
            CodecInstance::Json(codec) => codec.decode(bytes),
        }
    }
}
