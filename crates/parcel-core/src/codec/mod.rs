//! Codec - オブジェクトと bytes の相互変換
//!
//! # 二層構造
//! - **Codec**: 1 つの形式（JSON, bincode など）で `Value` を変換する
//! - **CodecRegistry**: 優先度順に codec を試し、最初に成功したものを使う
//!
//! codec は失敗を `Result` で返します。panic や例外的な制御フローは使いません。
//! 使った codec の名前はヘッダーに埋め込まれるので、decode 側は推測しません。

mod json;
mod registry;
mod rich;

use std::sync::Arc;

use thiserror::Error;

use crate::domain::Value;

pub use self::json::JsonCodec;
pub use self::registry::{CodecRegistry, RegisteredCodec};
pub use self::rich::RichCodec;

/// Name of the strict default codec.
pub const JSON: &str = "json";

/// Name of the permissive fallback codec.
pub const RICH: &str = "rich";

pub const JSON_PRIORITY: i32 = 100;
pub const RICH_PRIORITY: i32 = 10;

/// A named encoder/decoder for [`Value`]s.
///
/// Round-trip law: for every value `try_encode` accepts, `try_decode` of the
/// output yields an equivalent value.
pub trait Codec: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn try_encode(&self, value: &Value) -> Result<Vec<u8>, CodecError>;

    fn try_decode(&self, bytes: &[u8]) -> Result<Value, CodecError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// The codec does not support this kind of object.
    #[error("unsupported object `{0}`")]
    Unsupported(String),

    #[error("encode failed: {0}")]
    Encode(String),

    #[error("decode failed: {0}")]
    Decode(String),
}

/// Resolve one of the built-in codecs by name.
///
/// Engines use this when asked to enable a codec they were not started with.
pub fn builtin(name: &str) -> Option<(Arc<dyn Codec>, i32)> {
    match name {
        JSON => Some((Arc::new(JsonCodec), JSON_PRIORITY)),
        RICH => Some((Arc::new(RichCodec), RICH_PRIORITY)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_codecs_resolve_by_name() {
        let (json, p) = builtin(JSON).unwrap();
        assert_eq!(json.name(), JSON);
        assert_eq!(p, JSON_PRIORITY);

        let (rich, p) = builtin(RICH).unwrap();
        assert_eq!(rich.name(), RICH);
        assert!(p < JSON_PRIORITY);

        assert!(builtin("pickle").is_none());
    }
}
