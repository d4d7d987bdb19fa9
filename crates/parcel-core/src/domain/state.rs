//! Task state machine for dispatched tasks.

use serde::{Deserialize, Serialize};

/// Dispatch state of a task.
///
/// State transitions:
/// - Created -> Queued (all dependencies completed)
/// - Queued -> Sent -> Acknowledged -> Executing -> Completed | Errored
/// - Sent -> Queued (no acknowledgment in time, retry left)
/// - Sent -> Lost (no acknowledgment in time, retries exhausted)
/// - Created | Queued -> Cancelled (local cancel)
/// - Sent | Acknowledged -> Cancelled (engine dropped it before starting)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskState {
    /// Registered, waiting for dependencies.
    Created,

    /// Eligible to be sent to a worker.
    Queued,

    /// Handed to the transport, no acknowledgment yet.
    Sent,

    /// The engine confirmed receipt.
    Acknowledged,

    /// The engine started running it.
    Executing,

    Completed,

    /// Ran (or tried to) and failed, or a dependency failed.
    Errored,

    Cancelled,

    /// Never acknowledged after all delivery attempts.
    Lost,
}

impl TaskState {
    /// Is this a terminal state (no further transitions)?
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Errored | TaskState::Cancelled | TaskState::Lost
        )
    }

    /// Has the task left the client (possibly running remotely)?
    pub fn is_in_flight(self) -> bool {
        matches!(
            self,
            TaskState::Sent | TaskState::Acknowledged | TaskState::Executing
        )
    }

    /// Can it still be withdrawn without any remote effect?
    pub fn is_local(self) -> bool {
        matches!(self, TaskState::Created | TaskState::Queued)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(TaskState::Created, false, true)]
    #[case(TaskState::Queued, false, true)]
    #[case(TaskState::Sent, false, false)]
    #[case(TaskState::Executing, false, false)]
    #[case(TaskState::Completed, true, false)]
    #[case(TaskState::Lost, true, false)]
    fn state_classification(#[case] state: TaskState, #[case] terminal: bool, #[case] local: bool) {
        assert_eq!(state.is_terminal(), terminal);
        assert_eq!(state.is_local(), local);
    }

    #[test]
    fn in_flight_states() {
        assert!(TaskState::Acknowledged.is_in_flight());
        assert!(!TaskState::Queued.is_in_flight());
        assert!(!TaskState::Completed.is_in_flight());
    }
}
