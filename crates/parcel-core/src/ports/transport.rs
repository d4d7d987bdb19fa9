//! Transport port - engine との間でフレームを運ぶ
//!
//! 配送の保証はしません。フレームが落ちることもあります。
//! 落ちたかどうかは coordinator が ack の有無で判断し、再送します。

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::{ControlId, TaskId, WorkerId};
use crate::wire::PackedMessage;

/// Unit of transfer between the coordinator and an engine.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    // ---- coordinator -> engine ----
    /// Run a task. `inputs` carries the packed results of the task's dependencies.
    Execute {
        task_id: TaskId,
        payload: PackedMessage,
        inputs: Vec<(TaskId, PackedMessage)>,
    },
    /// Drop a task that has not started yet.
    Cancel { task_id: TaskId },
    /// Enable a codec by name.
    EnableCodec { request_id: ControlId, codec: String },

    // ---- engine -> coordinator ----
    Ack { task_id: TaskId },
    Started { task_id: TaskId },
    /// A packed `Completed` or `Errored` message.
    Result {
        task_id: TaskId,
        payload: PackedMessage,
    },
    Cancelled { task_id: TaskId },
    ControlAck {
        request_id: ControlId,
        error: Option<String>,
    },
}

impl Frame {
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Execute { .. } => "execute",
            Frame::Cancel { .. } => "cancel",
            Frame::EnableCodec { .. } => "enable_codec",
            Frame::Ack { .. } => "ack",
            Frame::Started { .. } => "started",
            Frame::Result { .. } => "result",
            Frame::Cancelled { .. } => "cancelled",
            Frame::ControlAck { .. } => "control_ack",
        }
    }
}

/// Handle for one accepted send. Acceptance does not imply delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeliveryToken(pub u64);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("no route to {0}")]
    UnknownDestination(WorkerId),

    #[error("transport closed")]
    Closed,
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, destination: &WorkerId, frame: Frame) -> Result<DeliveryToken, TransportError>;

    /// Next inbound frame. `None` once the transport is closed.
    async fn receive(&self) -> Option<(WorkerId, Frame)>;
}
