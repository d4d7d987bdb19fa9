//! Submission types and the result handle.

use std::collections::BTreeSet;
use std::time::Duration;

use tokio::sync::watch;

use crate::domain::{DispatchError, TaskId, Value, WorkerId};
use crate::wire::PackedMessage;

/// Terminal outcome of a task. `None` while pending.
pub(crate) type Outcome = Option<Result<Value, DispatchError>>;

/// Per-submission options.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubmitOptions {
    /// Run on this engine only. `None` lets the coordinator pick the least loaded.
    pub target: Option<WorkerId>,
    /// How long to wait for an acknowledgment before resending. `None` disables
    /// loss detection.
    pub timeout: Option<Duration>,
    /// Resends allowed after the first delivery attempt.
    pub retries: u32,
    /// Tasks that must complete first.
    pub dependencies: Vec<TaskId>,
}

impl SubmitOptions {
    pub fn on(mut self, worker: WorkerId) -> Self {
        self.target = Some(worker);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn after(mut self, dependencies: impl IntoIterator<Item = TaskId>) -> Self {
        self.dependencies.extend(dependencies);
        self
    }
}

/// Which engines a control request goes to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Targets {
    #[default]
    All,
    Only(Vec<WorkerId>),
}

/// A submitted task. Immutable once sent.
#[derive(Debug, Clone)]
pub struct DispatchTask {
    pub task_id: TaskId,
    pub target: Option<WorkerId>,
    pub payload: PackedMessage,
    pub retries: u32,
    pub timeout: Option<Duration>,
    pub dependencies: BTreeSet<TaskId>,
}

/// Handle to the eventual result of a task.
///
/// Cloneable; every clone observes the same single outcome.
#[derive(Debug, Clone)]
pub struct AsyncResult {
    task_id: TaskId,
    rx: watch::Receiver<Outcome>,
}

impl AsyncResult {
    pub(crate) fn new(task_id: TaskId, rx: watch::Receiver<Outcome>) -> Self {
        Self { task_id, rx }
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub fn is_ready(&self) -> bool {
        self.rx.borrow().is_some()
    }

    /// The outcome if the task has finished.
    pub fn try_get(&self) -> Option<Result<Value, DispatchError>> {
        self.rx.borrow().clone()
    }

    /// Wait for the outcome.
    ///
    /// On `Timeout` the task keeps running and the handle can be awaited again.
    pub async fn get(&self, timeout: Option<Duration>) -> Result<Value, DispatchError> {
        let mut rx = self.rx.clone();
        let task_id = self.task_id;

        let wait = async move {
            loop {
                let current = rx.borrow_and_update().clone();
                if let Some(outcome) = current {
                    return outcome;
                }
                if rx.changed().await.is_err() {
                    let last = rx.borrow().clone();
                    return last.unwrap_or(Err(DispatchError::Shutdown));
                }
            }
        };

        match timeout {
            Some(limit) => tokio::time::timeout(limit, wait)
                .await
                .map_err(|_| DispatchError::Timeout { task_id })?,
            None => wait.await,
        }
    }
}
