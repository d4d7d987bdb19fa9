//! IdGenerator port - ID 生成の抽象化
//!
//! task id はクライアント側で、調整なしに生成します。
//! Clock を差し替えると timestamp 部分が決定的になります。

use ulid::Ulid;

use crate::domain::{ControlId, TaskId};
use crate::ports::Clock;

pub trait IdGenerator: Send + Sync {
    fn generate_task_id(&self) -> TaskId;

    fn generate_control_id(&self) -> ControlId;
}

/// ULID ids stamped with the time from `C`.
pub struct UlidGenerator<C> {
    clock: C,
}

impl<C: Clock> UlidGenerator<C> {
    pub fn new(clock: C) -> Self {
        Self { clock }
    }

    fn next_ulid(&self) -> Ulid {
        let timestamp_ms = self.clock.now().timestamp_millis().max(0) as u64;
        Ulid::from_parts(timestamp_ms, rand::random())
    }
}

impl<C: Clock> IdGenerator for UlidGenerator<C> {
    fn generate_task_id(&self) -> TaskId {
        TaskId::from(self.next_ulid())
    }

    fn generate_control_id(&self) -> ControlId {
        ControlId::from(self.next_ulid())
    }
}
