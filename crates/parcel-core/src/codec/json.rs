//! Strict codec: plain data only, via serde_json.

use super::{Codec, CodecError, JSON};
use crate::domain::Value;

/// Strict default codec.
///
/// Rejects closures, open resources and non-finite floats; everything else is
/// written as JSON.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn name(&self) -> &str {
        JSON
    }

    fn try_encode(&self, value: &Value) -> Result<Vec<u8>, CodecError> {
        if let Some(type_name) = value.find_unportable() {
            return Err(CodecError::Unsupported(type_name.to_string()));
        }
        serde_json::to_vec(value).map_err(|e| CodecError::Encode(e.to_string()))
    }

    fn try_decode(&self, bytes: &[u8]) -> Result<Value, CodecError> {
        serde_json::from_slice(bytes).map_err(|e| CodecError::Decode(e.to_string()))
    }
}
