//! Errors - エラー型と分類
//!
//! - 直列化エラーは `submit` / `pack` の時点で同期的に返す
//! - 実行時エラーは engine 側で捕捉し、`Errored` の結果として運ぶ
//! - 配送の失敗はリトライし、使い切った時だけ表に出す
//!
//! 1 つの終端結果を何度でも観測できるように、すべて `Clone` です。

use thiserror::Error;

use super::ids::{TaskId, WorkerId};

/// No registered codec could encode (or decode) an object.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("cannot serialize object of type `{type_name}` (tried: [{}]): {reason}", .tried.join(", "))]
pub struct SerializationError {
    /// Declared type of the offending object.
    pub type_name: String,
    /// Codec names attempted, in the order they were tried.
    pub tried: Vec<String>,
    /// Reason given by the last codec tried.
    pub reason: String,
}

/// A failure raised while executing a task on an engine.
///
/// Only the textual representation crosses the wire.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{ename}: {evalue}")]
pub struct RemoteError {
    pub ename: String,
    pub evalue: String,
}

impl RemoteError {
    pub fn new(ename: impl Into<String>, evalue: impl Into<String>) -> Self {
        Self {
            ename: ename.into(),
            evalue: evalue.into(),
        }
    }

    pub fn type_error(evalue: impl Into<String>) -> Self {
        Self::new("TypeError", evalue)
    }

    pub fn name_error(evalue: impl Into<String>) -> Self {
        Self::new("NameError", evalue)
    }
}

impl From<DispatchError> for RemoteError {
    fn from(err: DispatchError) -> Self {
        let ename = match &err {
            DispatchError::Serialization(_) | DispatchError::UncallableSerialization(_) => {
                "SerializationError"
            }
            DispatchError::Malformed(_) => "MalformedMessage",
            DispatchError::DependencyFailed { .. } => "DependencyFailed",
            _ => "DispatchError",
        };
        RemoteError::new(ename, err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Serialization(SerializationError),

    #[error("callable could not be serialized: {0}")]
    UncallableSerialization(SerializationError),

    #[error("object of type `{type_name}` is not callable")]
    NotCallable { type_name: String },

    #[error("{task_id} was not acknowledged after {attempts} delivery attempts")]
    DeliveryFailure { task_id: TaskId, attempts: u32 },

    #[error("timed out waiting for {task_id}")]
    Timeout { task_id: TaskId },

    #[error("remote execution failed: {0}")]
    Remote(RemoteError),

    #[error("{task_id} was cancelled")]
    Cancelled { task_id: TaskId },

    #[error("{task_id} cannot run: dependency {dependency} did not complete")]
    DependencyFailed { task_id: TaskId, dependency: TaskId },

    #[error("unknown dependency {0}")]
    UnknownDependency(TaskId),

    #[error("unknown worker {0}")]
    UnknownWorker(WorkerId),

    #[error("{worker} did not acknowledge control request")]
    ControlTimeout { worker: WorkerId },

    #[error("{worker} rejected control request: {reason}")]
    ControlRejected { worker: WorkerId, reason: String },

    #[error("unknown codec `{0}`")]
    UnknownCodec(String),

    #[error("{0} has not finished")]
    NotTerminal(TaskId),

    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("transport: {0}")]
    Transport(String),

    #[error("coordinator is shut down")]
    Shutdown,
}

impl From<SerializationError> for DispatchError {
    fn from(err: SerializationError) -> Self {
        DispatchError::Serialization(err)
    }
}

impl From<RemoteError> for DispatchError {
    fn from(err: RemoteError) -> Self {
        DispatchError::Remote(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialization_error_names_type_and_codecs() {
        let err = SerializationError {
            type_name: "resource<file>".to_string(),
            tried: vec!["json".to_string(), "rich".to_string()],
            reason: "nope".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("resource<file>"));
        assert!(msg.contains("json, rich"));
    }

    #[test]
    fn remote_error_keeps_text_only() {
        let err: DispatchError = RemoteError::new("ZeroDivisionError", "division by zero").into();
        assert_eq!(
            err.to_string(),
            "remote execution failed: ZeroDivisionError: division by zero"
        );
    }

    #[test]
    fn dispatch_error_maps_to_remote_name() {
        let err = DispatchError::Malformed("short".to_string());
        let remote = RemoteError::from(err);
        assert_eq!(remote.ename, "MalformedMessage");
    }
}
