//! Structured value codecs.
//!
//! The framing layer only ever sees bytes. A [`ValueCodec`] turns
//! application values (maps, arrays, scalars, strings, nested) into frame
//! payloads and back. [`JsonCodec`] is the default.

use tokio_util::bytes::Bytes;

pub use serde_json::Value;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("failed to encode value: {0}")]
    Encode(String),

    #[error("failed to decode value: {0}")]
    Decode(String),
}

/// Pluggable serialization for request and response values.
pub trait ValueCodec: Send + Sync + 'static {
    /// Short name for diagnostics.
    fn name(&self) -> &'static str;

    fn encode(&self, value: &Value) -> Result<Bytes, CodecError>;

    fn decode(&self, payload: &[u8]) -> Result<Value, CodecError>;
}

/// JSON payloads via serde_json. Floats round-trip exactly.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl ValueCodec for JsonCodec {
    fn name(&self) -> &'static str {
        "json"
    }

    fn encode(&self, value: &Value) -> Result<Bytes, CodecError> {
        serde_json::to_vec(value)
            .map(Bytes::from)
            .map_err(|e| CodecError::Encode(e.to_string()))
    }

    fn decode(&self, payload: &[u8]) -> Result<Value, CodecError> {
        serde_json::from_slice(payload).map_err(|e| CodecError::Decode(e.to_string()))
    }
}
