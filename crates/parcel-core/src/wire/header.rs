//! Message header.
//!
//! The header is always frame 0 and is JSON on its own, independent of the object
//! codecs, so a receiver can read it with no prior context.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::domain::DispatchError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    /// callable + arguments
    Apply,
    /// a return value
    Completed,
    /// a captured failure (`ename` / `evalue`)
    Errored,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub kind: MessageKind,
    /// Number of positional arguments.
    pub nargs: usize,
    /// Frames occupied by positional arguments, buffers included.
    pub narg_bufs: usize,
    /// Keyword names, in the order their frames appear.
    pub kw_keys: Vec<String>,
    /// Codec used for each encoded object: `[callable, arg_0.., kwarg_0..]`.
    /// Result messages have no callable entry.
    pub codecs: Vec<String>,
}

impl Header {
    pub fn encode(&self) -> Result<Bytes, DispatchError> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|e| DispatchError::Malformed(format!("header: {e}")))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DispatchError> {
        serde_json::from_slice(bytes).map_err(|e| DispatchError::Malformed(format!("header: {e}")))
    }
}
