//! Task record: what the coordinator knows about one task.
//!
//! Records outlive the task itself. They stay queryable after the task finishes
//! and are only dropped by an explicit purge.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{TaskId, TaskState, WorkerId};
use crate::wire::PackedMessage;

/// Metadata for a dispatched task.
///
/// All state transitions happen here.
#[derive(Debug, Clone)]
pub struct TaskRecord {
    pub task_id: TaskId,
    pub state: TaskState,

    /// Engine the last delivery attempt went to.
    pub engine: Option<WorkerId>,

    /// Number of delivery attempts made.
    pub attempts: u32,

    pub submitted: DateTime<Utc>,
    /// Time of the last send.
    pub sent: Option<DateTime<Utc>>,
    pub started: Option<DateTime<Utc>>,
    pub completed: Option<DateTime<Utc>>,

    /// Error text for failed tasks.
    pub error: Option<String>,

    /// The packed result, as received.
    pub result_buffers: Option<PackedMessage>,
}

impl TaskRecord {
    pub fn new(task_id: TaskId, state: TaskState, submitted: DateTime<Utc>) -> Self {
        Self {
            task_id,
            state,
            engine: None,
            attempts: 0,
            submitted,
            sent: None,
            started: None,
            completed: None,
            error: None,
            result_buffers: None,
        }
    }

    /// Dependencies met.
    pub fn mark_queued(&mut self) {
        self.state = TaskState::Queued;
    }

    /// One delivery attempt to `engine`.
    pub fn start_attempt(&mut self, engine: WorkerId, now: DateTime<Utc>) {
        self.state = TaskState::Sent;
        self.engine = Some(engine);
        self.attempts += 1;
        self.sent = Some(now);
    }

    pub fn mark_acknowledged(&mut self) {
        if self.state == TaskState::Sent {
            self.state = TaskState::Acknowledged;
        }
    }

    pub fn mark_executing(&mut self, now: DateTime<Utc>) {
        self.state = TaskState::Executing;
        self.started = Some(now);
    }

    pub fn mark_completed(&mut self, result: PackedMessage, now: DateTime<Utc>) {
        self.state = TaskState::Completed;
        self.result_buffers = Some(result);
        self.completed = Some(now);
    }

    pub fn mark_errored(&mut self, error: String, result: Option<PackedMessage>, now: DateTime<Utc>) {
        self.state = TaskState::Errored;
        self.error = Some(error);
        self.result_buffers = result;
        self.completed = Some(now);
    }

    pub fn mark_cancelled(&mut self, now: DateTime<Utc>) {
        self.state = TaskState::Cancelled;
        self.completed = Some(now);
    }

    pub fn mark_lost(&mut self, error: String, now: DateTime<Utc>) {
        self.state = TaskState::Lost;
        self.error = Some(error);
        self.completed = Some(now);
    }

    /// Back to the send queue after an unacknowledged attempt.
    pub fn requeue(&mut self) {
        self.state = TaskState::Queued;
    }
}

/// Selects records by state, engine and time window. Empty fields match anything.
///
/// Time bounds are half-open: `*_after` is inclusive, `*_before` exclusive. A record
/// that has not completed never matches a `completed_*` bound.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordFilter {
    pub state: Option<TaskState>,
    pub engine: Option<WorkerId>,
    pub submitted_after: Option<DateTime<Utc>>,
    pub submitted_before: Option<DateTime<Utc>>,
    pub completed_after: Option<DateTime<Utc>>,
    pub completed_before: Option<DateTime<Utc>>,
}

impl RecordFilter {
    pub fn state(state: TaskState) -> Self {
        Self {
            state: Some(state),
            ..Self::default()
        }
    }

    pub fn engine(engine: WorkerId) -> Self {
        Self {
            engine: Some(engine),
            ..Self::default()
        }
    }

    pub fn submitted_between(mut self, after: Option<DateTime<Utc>>, before: Option<DateTime<Utc>>) -> Self {
        self.submitted_after = after;
        self.submitted_before = before;
        self
    }

    pub fn completed_between(mut self, after: Option<DateTime<Utc>>, before: Option<DateTime<Utc>>) -> Self {
        self.completed_after = after;
        self.completed_before = before;
        self
    }

    pub fn matches(&self, record: &TaskRecord) -> bool {
        self.state.is_none_or(|s| s == record.state)
            && self
                .engine
                .as_ref()
                .is_none_or(|e| record.engine.as_ref() == Some(e))
            && in_window(Some(record.submitted), self.submitted_after, self.submitted_before)
            && in_window(record.completed, self.completed_after, self.completed_before)
    }
}

fn in_window(at: Option<DateTime<Utc>>, after: Option<DateTime<Utc>>, before: Option<DateTime<Utc>>) -> bool {
    if after.is_none() && before.is_none() {
        return true;
    }
    at.is_some_and(|t| after.is_none_or(|a| t >= a) && before.is_none_or(|b| t < b))
}

/// Number of records per state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskCounts {
    pub created: usize,
    pub queued: usize,
    pub sent: usize,
    pub acknowledged: usize,
    pub executing: usize,
    pub completed: usize,
    pub errored: usize,
    pub cancelled: usize,
    pub lost: usize,
}

impl TaskCounts {
    pub fn add(&mut self, state: TaskState) {
        match state {
            TaskState::Created => self.created += 1,
            TaskState::Queued => self.queued += 1,
            TaskState::Sent => self.sent += 1,
            TaskState::Acknowledged => self.acknowledged += 1,
            TaskState::Executing => self.executing += 1,
            TaskState::Completed => self.completed += 1,
            TaskState::Errored => self.errored += 1,
            TaskState::Cancelled => self.cancelled += 1,
            TaskState::Lost => self.lost += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.created
            + self.queued
            + self.sent
            + self.acknowledged
            + self.executing
            + self.completed
            + self.errored
            + self.cancelled
            + self.lost
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rstest::rstest;

    fn record() -> TaskRecord {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        TaskRecord::new(TaskId::from_u128(1), TaskState::Queued, t0)
    }

    #[test]
    fn attempts_count_every_send() {
        let mut rec = record();
        let now = rec.submitted;
        rec.start_attempt(WorkerId::new("engine-0"), now);
        rec.requeue();
        rec.start_attempt(WorkerId::new("engine-1"), now);

        assert_eq!(rec.attempts, 2);
        assert_eq!(rec.state, TaskState::Sent);
        assert_eq!(rec.engine, Some(WorkerId::new("engine-1")));
    }

    #[test]
    fn late_ack_does_not_rewind_state() {
        let mut rec = record();
        let now = rec.submitted;
        rec.start_attempt(WorkerId::new("engine-0"), now);
        rec.mark_executing(now);
        rec.mark_acknowledged();
        assert_eq!(rec.state, TaskState::Executing);
    }

    #[test]
    fn filter_matches_state_and_engine() {
        let mut rec = record();
        rec.start_attempt(WorkerId::new("engine-0"), rec.submitted);

        assert!(RecordFilter::default().matches(&rec));
        assert!(RecordFilter::state(TaskState::Sent).matches(&rec));
        assert!(!RecordFilter::state(TaskState::Queued).matches(&rec));
        assert!(RecordFilter::engine(WorkerId::new("engine-0")).matches(&rec));
        assert!(!RecordFilter::engine(WorkerId::new("engine-1")).matches(&rec));
    }

    #[rstest]
    #[case::no_bounds(None, None, true)]
    #[case::after_is_inclusive(Some(0), None, true)]
    #[case::after_later(Some(1), None, false)]
    #[case::before_is_exclusive(None, Some(0), false)]
    #[case::before_later(None, Some(1), true)]
    fn submitted_window(#[case] after: Option<i64>, #[case] before: Option<i64>, #[case] expected: bool) {
        let rec = record();
        let at = |secs: i64| rec.submitted + chrono::Duration::seconds(secs);
        let filter = RecordFilter::default().submitted_between(after.map(at), before.map(at));
        assert_eq!(filter.matches(&rec), expected);
    }

    #[test]
    fn completed_window_skips_unfinished_records() {
        let mut rec = record();
        let t0 = rec.submitted;
        let filter = RecordFilter::default().completed_between(Some(t0), None);
        assert!(!filter.matches(&rec));

        rec.mark_completed(Vec::new(), t0 + chrono::Duration::seconds(5));
        assert!(filter.matches(&rec));
        assert!(!filter
            .clone()
            .completed_between(None, Some(t0 + chrono::Duration::seconds(5)))
            .matches(&rec));
    }

    #[test]
    fn filter_deserializes_with_missing_keys() {
        let filter: RecordFilter = serde_json::from_str(r#"{ "state": "Completed" }"#).unwrap();
        assert_eq!(filter, RecordFilter::state(TaskState::Completed));
    }

    #[test]
    fn counts_add_up() {
        let mut counts = TaskCounts::default();
        counts.add(TaskState::Completed);
        counts.add(TaskState::Completed);
        counts.add(TaskState::Lost);
        assert_eq!(counts.completed, 2);
        assert_eq!(counts.total(), 3);
    }
}
