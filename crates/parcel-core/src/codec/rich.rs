//! Permissive codec: the whole object model, via bincode.

use super::{Codec, CodecError, RICH};
use crate::domain::Value;

/// Permissive fallback codec.
///
/// Carries closures (function name + captured environment), resource handles and
/// non-finite floats. Registered below the strict codec so it only picks up what
/// the strict codec refuses.
#[derive(Debug, Clone, Copy, Default)]
pub struct RichCodec;

impl Codec for RichCodec {
    fn name(&self) -> &str {
        RICH
    }

    fn try_encode(&self, value: &Value) -> Result<Vec<u8>, CodecError> {
        bincode::serialize(value).map_err(|e| CodecError::Encode(e.to_string()))
    }

    fn try_decode(&self, bytes: &[u8]) -> Result<Value, CodecError> {
        bincode::deserialize(bytes).map_err(|e| CodecError::Decode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ResourceHandle;

    #[test]
    fn closure_over_resource_round_trips() {
        let value = Value::closure(
            "count_bytes",
            [
                ("handle", Value::Resource(ResourceHandle::file("/tmp/data.bin"))),
                ("scale", Value::Int(2)),
            ],
        );
        let bytes = RichCodec.try_encode(&value).unwrap();
        assert_eq!(RichCodec.try_decode(&bytes).unwrap(), value);
    }

    #[test]
    fn infinity_round_trips() {
        let bytes = RichCodec.try_encode(&Value::Float(f64::INFINITY)).unwrap();
        assert_eq!(
            RichCodec.try_decode(&bytes).unwrap(),
            Value::Float(f64::INFINITY)
        );
    }

    #[test]
    fn truncated_payload_fails_to_decode() {
        let bytes = RichCodec.try_encode(&Value::from("a longer string")).unwrap();
        assert!(matches!(
            RichCodec.try_decode(&bytes[..3]),
            Err(CodecError::Decode(_))
        ));
    }
}
