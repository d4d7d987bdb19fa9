//! CodecRegistry - 優先度付きの codec 一覧
//!
//! # 選択ルール
//! - 優先度の高い順に試す
//! - 同じ優先度なら登録順
//! - 最初に成功した codec を採用し、その名前を返す
//!
//! 一覧は `ArcSwap` で丸ごと差し替えます（copy-on-write）。
//! encode/decode は lock を取らずに現在のスナップショットを読むだけです。

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use arc_swap::ArcSwap;
use tracing::debug;

use super::{Codec, CodecError, JSON_PRIORITY, JsonCodec, RICH_PRIORITY, RichCodec};
use crate::domain::{SerializationError, Value};

/// A codec together with its rank in the registry.
#[derive(Clone)]
pub struct RegisteredCodec {
    pub codec: Arc<dyn Codec>,
    pub priority: i32,
    seq: u64,
}

impl RegisteredCodec {
    pub fn name(&self) -> &str {
        self.codec.name()
    }
}

impl std::fmt::Debug for RegisteredCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredCodec")
            .field("name", &self.codec.name())
            .field("priority", &self.priority)
            .field("seq", &self.seq)
            .finish()
    }
}

pub struct CodecRegistry {
    codecs: ArcSwap<Vec<RegisteredCodec>>,
    next_seq: AtomicU64,
}

impl CodecRegistry {
    /// A registry with no codecs. Every encode fails until something is registered.
    pub fn empty() -> Self {
        Self {
            codecs: ArcSwap::from_pointee(Vec::new()),
            next_seq: AtomicU64::new(0),
        }
    }

    /// The default registry: strict JSON only.
    pub fn strict() -> Self {
        let registry = Self::empty();
        registry.register(Arc::new(JsonCodec), JSON_PRIORITY);
        registry
    }

    /// Strict JSON plus the permissive fallback.
    pub fn permissive() -> Self {
        let registry = Self::strict();
        registry.register(Arc::new(RichCodec), RICH_PRIORITY);
        registry
    }

    /// Add a codec, or re-rank it if a codec with the same name is present.
    ///
    /// Returns `false` when the call changed nothing.
    pub fn register(&self, codec: Arc<dyn Codec>, priority: i32) -> bool {
        let name = codec.name().to_string();
        let mut changed = false;

        self.codecs.rcu(|current| {
            let mut next: Vec<RegisteredCodec> = (**current).clone();
            changed = match next.iter_mut().find(|c| c.name() == name) {
                Some(existing) if existing.priority == priority => false,
                Some(existing) => {
                    existing.priority = priority;
                    true
                }
                None => {
                    next.push(RegisteredCodec {
                        codec: codec.clone(),
                        priority,
                        seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
                    });
                    true
                }
            };
            // 優先度は降順、同順位は登録順
            next.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.seq.cmp(&b.seq)));
            next
        });

        if changed {
            debug!(codec = %name, priority, "codec registered");
        }
        changed
    }

    /// Encode with the highest ranked codec that accepts the value.
    pub fn encode_best_effort(&self, value: &Value) -> Result<(String, Vec<u8>), SerializationError> {
        let snapshot = self.codecs.load();
        let mut tried = Vec::with_capacity(snapshot.len());
        let mut reason = String::from("no codec registered");

        for entry in snapshot.iter() {
            tried.push(entry.name().to_string());
            match entry.codec.try_encode(value) {
                Ok(bytes) => return Ok((entry.name().to_string(), bytes)),
                Err(e) => reason = e.to_string(),
            }
        }

        Err(SerializationError {
            type_name: value.type_name().to_string(),
            tried,
            reason,
        })
    }

    /// Decode with the codec named in the message header.
    pub fn decode(&self, codec_name: &str, bytes: &[u8]) -> Result<Value, CodecError> {
        let snapshot = self.codecs.load();
        let entry = snapshot
            .iter()
            .find(|c| c.name() == codec_name)
            .ok_or_else(|| CodecError::Unsupported(format!("codec `{codec_name}` is not enabled")))?;
        entry.codec.try_decode(bytes)
    }

    /// Codec names in the order they are tried.
    pub fn names(&self) -> Vec<String> {
        self.codecs.load().iter().map(|c| c.name().to_string()).collect()
    }

    pub fn contains(&self, codec_name: &str) -> bool {
        self.codecs.load().iter().any(|c| c.name() == codec_name)
    }
}

impl Default for CodecRegistry {
    fn default() -> Self {
        Self::strict()
    }
}

impl std::fmt::Debug for CodecRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodecRegistry")
            .field("codecs", &self.names())
            .finish()
    }
}
