//! Coordinator - タスクの投入・配送・追跡
//!
//! # 状態
//! すべての bookkeeping は 1 つの `CoordinatorState` にまとめ、`tokio::sync::Mutex` で守ります。
//! transport の await 中は lock を持ちません。
//!
//! # ループ
//! - **dispatch loop**: Queued のタスクを engine に割り当てて送る。ack の期限切れと再送も扱う
//! - **receive loop**: engine からの Ack / Started / Result / Cancelled / ControlAck を反映する
//!
//! どちらも `watch` の shutdown シグナルで止まります。
//!
//! # 依存関係
//! 依存タスクがすべて Completed になるまで送りません。
//! 依存タスクが Errored / Cancelled / Lost で終わったら、待っていたタスクは `DependencyFailed` になります。

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::dependency::DependencyGraph;
use super::record::{RecordFilter, TaskCounts, TaskRecord};
use super::retry::RetryPolicy;
use super::task::{AsyncResult, DispatchTask, Outcome, SubmitOptions, Targets};
use crate::codec::{self, CodecRegistry};
use crate::config::{ConfigError, DispatchConfig};
use crate::domain::{ControlId, DispatchError, TaskId, TaskState, Value, WorkerId};
use crate::ports::{Clock, Frame, IdGenerator, SystemClock, Transport, UlidGenerator, WorkerPool};
use crate::wire::{PackedMessage, Packer};

// ========================================
// Deadlines
// ========================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeadlineKind {
    /// No ack for delivery attempt `attempt` by now means it was lost.
    Ack { attempt: u32 },
    /// Backoff over, put the task back in the send queue.
    Resend,
}

/// Reverse ordering so BinaryHeap acts as a min-heap (earliest first).
#[derive(Debug, Clone, PartialEq, Eq)]
struct Deadline {
    at: Instant,
    task_id: TaskId,
    kind: DeadlineKind,
}

impl PartialOrd for Deadline {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Deadline {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .at
            .cmp(&self.at)
            .then_with(|| other.task_id.cmp(&self.task_id))
    }
}

// ========================================
// State
// ========================================

#[derive(Default)]
struct CoordinatorState {
    /// Live (non-terminal) tasks.
    tasks: HashMap<TaskId, DispatchTask>,

    /// Every task's record, until purged.
    records: HashMap<TaskId, TaskRecord>,

    /// Single-assignment result cells.
    outcomes: HashMap<TaskId, watch::Sender<Outcome>>,

    /// Submission order.
    history: Vec<TaskId>,

    /// Tasks eligible to send (TaskIds only).
    ready: VecDeque<TaskId>,

    graph: DependencyGraph,

    deadlines: BinaryHeap<Deadline>,

    /// Control requests waiting for an engine's ack.
    controls: HashMap<ControlId, oneshot::Sender<Option<String>>>,

    closed: bool,
}

impl CoordinatorState {
    /// Record the single terminal outcome and drop the live task.
    fn finish(&mut self, task_id: TaskId, outcome: Result<Value, DispatchError>) {
        self.tasks.remove(&task_id);
        self.ready.retain(|id| *id != task_id);
        if let Some(tx) = self.outcomes.get(&task_id) {
            tx.send_replace(Some(outcome));
        }
    }

    /// Returns true when some dependent became ready.
    fn complete(&mut self, task_id: TaskId, payload: PackedMessage, value: Value, now: DateTime<Utc>) -> bool {
        if let Some(record) = self.records.get_mut(&task_id) {
            record.mark_completed(payload, now);
        }
        self.finish(task_id, Ok(value));

        let mut woke = false;
        for waiting in self.graph.resolve(task_id) {
            if let Some(record) = self.records.get_mut(&waiting)
                && record.state == TaskState::Created
            {
                record.mark_queued();
                self.ready.push_back(waiting);
                woke = true;
            }
        }
        woke
    }

    /// Terminal failure, cascading `DependencyFailed` to everything waiting on it.
    fn fail(
        &mut self,
        task_id: TaskId,
        error: DispatchError,
        payload: Option<PackedMessage>,
        now: DateTime<Utc>,
    ) {
        if let Some(record) = self.records.get_mut(&task_id) {
            match &error {
                DispatchError::Cancelled { .. } => record.mark_cancelled(now),
                DispatchError::DeliveryFailure { .. } => record.mark_lost(error.to_string(), now),
                _ => record.mark_errored(error.to_string(), payload, now),
            }
        }
        self.finish(task_id, Err(error));

        for waiting in self.graph.remove_task(task_id) {
            if self
                .records
                .get(&waiting)
                .is_some_and(|r| !r.state.is_terminal())
            {
                debug!(task = %waiting, dependency = %task_id, "dependency failed");
                let error = DispatchError::DependencyFailed {
                    task_id: waiting,
                    dependency: task_id,
                };
                self.fail(waiting, error, None, now);
            }
        }
    }

    /// Delivery attempt went unacknowledged: resend later, or give up.
    fn on_unacked(&mut self, task_id: TaskId, policy: &RetryPolicy, now: DateTime<Utc>) {
        let Some(retries) = self.tasks.get(&task_id).map(|t| t.retries) else {
            return;
        };
        let Some(record) = self.records.get_mut(&task_id) else {
            return;
        };
        let attempts = record.attempts;

        if attempts <= retries {
            record.requeue();
            let delay = policy.next_delay(attempts);
            warn!(task = %task_id, attempts, ?delay, "no ack, resending");
            self.deadlines.push(Deadline {
                at: Instant::now() + delay,
                task_id,
                kind: DeadlineKind::Resend,
            });
        } else {
            warn!(task = %task_id, attempts, "no ack, giving up");
            self.fail(task_id, DispatchError::DeliveryFailure { task_id, attempts }, None, now);
        }
    }

    /// An engine has the task: it is no longer a resend candidate.
    fn claim(&mut self, task_id: TaskId, worker: WorkerId) -> Option<&mut TaskRecord> {
        let record = self.records.get_mut(&task_id)?;
        if record.state.is_terminal() {
            return None;
        }
        self.ready.retain(|id| *id != task_id);
        record.engine = Some(worker);
        Some(record)
    }

    /// Ids of tasks a live task still needs results from.
    fn referenced(&self) -> BTreeSet<TaskId> {
        self.tasks
            .values()
            .flat_map(|t| t.dependencies.iter().copied())
            .collect()
    }

    /// All-or-nothing: refuses if any record is unfinished, skips records in use.
    fn purge_finished(&mut self, task_ids: &[TaskId]) -> Result<usize, DispatchError> {
        if let Some(unfinished) = task_ids
            .iter()
            .find(|id| self.records.get(*id).is_some_and(|r| !r.state.is_terminal()))
        {
            return Err(DispatchError::NotTerminal(*unfinished));
        }

        let in_use = self.referenced();
        Ok(task_ids
            .iter()
            .filter(|id| !in_use.contains(*id))
            .filter(|id| self.purge(**id))
            .count())
    }

    fn purge(&mut self, task_id: TaskId) -> bool {
        if self.records.remove(&task_id).is_none() {
            return false;
        }
        self.outcomes.remove(&task_id);
        self.history.retain(|id| *id != task_id);
        true
    }
}

// ========================================
// Inner (shared by the loops)
// ========================================

struct Inner {
    state: Mutex<CoordinatorState>,
    notify: Notify,
    transport: Arc<dyn Transport>,
    pool: Arc<dyn WorkerPool>,
    codecs: CodecRegistry,
    config: DispatchConfig,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
}

impl Inner {
    fn packer(&self) -> Packer<'_> {
        Packer::new(&self.codecs, self.config.buffer_threshold, self.config.item_threshold)
    }

    /// Assign queued tasks to workers and send them.
    async fn dispatch_ready(&self) {
        if self.state.lock().await.ready.is_empty() {
            return;
        }
        let workers = self.pool.list_available_workers().await;
        if workers.is_empty() {
            return;
        }
        let mut loads = BTreeMap::new();
        for worker in workers {
            let load = self.pool.worker_load(&worker).await;
            loads.insert(worker, load);
        }

        let now = self.clock.now();
        let mut sends = Vec::new();
        {
            let mut guard = self.state.lock().await;
            let st = &mut *guard;
            let mut deferred = VecDeque::new();

            while let Some(task_id) = st.ready.pop_front() {
                let Some(task) = st.tasks.get(&task_id) else {
                    continue;
                };
                if st.records.get(&task_id).map(|r| r.state) != Some(TaskState::Queued) {
                    continue;
                }

                let worker = match &task.target {
                    Some(target) if loads.contains_key(target) => target.clone(),
                    // 指定された engine が今いない
                    Some(_) => {
                        deferred.push_back(task_id);
                        continue;
                    }
                    None => match least_loaded(&loads) {
                        Some(w) => w,
                        None => {
                            deferred.push_back(task_id);
                            continue;
                        }
                    },
                };

                let mut inputs = Vec::with_capacity(task.dependencies.len());
                let mut missing = None;
                for dep in &task.dependencies {
                    match st.records.get(dep).and_then(|r| r.result_buffers.clone()) {
                        Some(result) => inputs.push((*dep, result)),
                        None => {
                            missing = Some(*dep);
                            break;
                        }
                    }
                }
                let payload = task.payload.clone();
                let timeout = task.timeout;

                if let Some(dependency) = missing {
                    st.fail(
                        task_id,
                        DispatchError::DependencyFailed {
                            task_id,
                            dependency,
                        },
                        None,
                        now,
                    );
                    continue;
                }

                let Some(record) = st.records.get_mut(&task_id) else {
                    continue;
                };
                record.start_attempt(worker.clone(), now);
                let attempt = record.attempts;
                if let Some(timeout) = timeout {
                    st.deadlines.push(Deadline {
                        at: Instant::now() + timeout,
                        task_id,
                        kind: DeadlineKind::Ack { attempt },
                    });
                }
                if let Some(load) = loads.get_mut(&worker) {
                    *load += 1;
                }

                debug!(task = %task_id, worker = %worker, attempt, "sending task");
                sends.push((
                    worker,
                    task_id,
                    attempt,
                    Frame::Execute {
                        task_id,
                        payload,
                        inputs,
                    },
                ));
            }
            st.ready = deferred;
        }

        for (worker, task_id, attempt, frame) in sends {
            if let Err(e) = self.transport.send(&worker, frame).await {
                warn!(task = %task_id, worker = %worker, error = %e, "send failed");
                let mut st = self.state.lock().await;
                if st
                    .records
                    .get(&task_id)
                    .is_some_and(|r| r.state == TaskState::Sent && r.attempts == attempt)
                {
                    st.on_unacked(task_id, &self.config.retry, self.clock.now());
                }
            }
        }
    }

    /// Handle due deadlines; returns the next pending one.
    async fn fire_deadlines(&self) -> Option<Instant> {
        let mut guard = self.state.lock().await;
        let st = &mut *guard;
        let now = Instant::now();
        let wall = self.clock.now();

        while st.deadlines.peek().is_some_and(|d| d.at <= now) {
            let Some(deadline) = st.deadlines.pop() else {
                break;
            };
            let task_id = deadline.task_id;
            let Some(record) = st.records.get(&task_id) else {
                continue;
            };

            match deadline.kind {
                DeadlineKind::Ack { attempt } => {
                    if record.state == TaskState::Sent && record.attempts == attempt {
                        st.on_unacked(task_id, &self.config.retry, wall);
                    }
                }
                DeadlineKind::Resend => {
                    if record.state == TaskState::Queued
                        && st.tasks.contains_key(&task_id)
                        && !st.ready.contains(&task_id)
                    {
                        st.ready.push_back(task_id);
                    }
                }
            }
        }
        st.deadlines.peek().map(|d| d.at)
    }

    async fn handle_frame(&self, worker: WorkerId, frame: Frame) {
        let now = self.clock.now();
        let mut woke = false;
        {
            let mut guard = self.state.lock().await;
            let st = &mut *guard;

            match frame {
                Frame::Ack { task_id } => {
                    if let Some(record) = st.claim(task_id, worker) {
                        // 再送待ちの間に届いた遅い ack も受け入れる
                        if record.state == TaskState::Queued {
                            record.state = TaskState::Sent;
                        }
                        record.mark_acknowledged();
                    }
                }
                Frame::Started { task_id } => {
                    if let Some(record) = st.claim(task_id, worker) {
                        record.mark_executing(now);
                    }
                }
                Frame::Result { task_id, payload } => match st.records.get(&task_id).map(|r| r.state) {
                    None => warn!(task = %task_id, "result for unknown task"),
                    Some(state) if state.is_terminal() => {
                        debug!(task = %task_id, ?state, "duplicate result ignored");
                    }
                    Some(_) => match self.packer().unpack_outcome(&payload) {
                        Ok(value) => {
                            debug!(task = %task_id, worker = %worker, "completed");
                            woke = st.complete(task_id, payload, value, now);
                        }
                        Err(error) => {
                            debug!(task = %task_id, worker = %worker, error = %error, "errored");
                            st.fail(task_id, error, Some(payload), now);
                        }
                    },
                },
                Frame::Cancelled { task_id } => {
                    if st
                        .records
                        .get(&task_id)
                        .is_some_and(|r| !r.state.is_terminal())
                    {
                        info!(task = %task_id, worker = %worker, "cancelled by engine");
                        st.fail(task_id, DispatchError::Cancelled { task_id }, None, now);
                    }
                }
                Frame::ControlAck { request_id, error } => {
                    if let Some(tx) = st.controls.remove(&request_id) {
                        let _ = tx.send(error);
                    }
                }
                other => warn!(worker = %worker, kind = other.kind(), "unexpected frame from engine"),
            }
        }
        if woke {
            self.notify.notify_one();
        }
    }
}

fn least_loaded(loads: &BTreeMap<WorkerId, usize>) -> Option<WorkerId> {
    loads
        .iter()
        .min_by_key(|(_, load)| **load)
        .map(|(w, _)| w.clone())
}

async fn dispatch_loop(inner: Arc<Inner>, mut shutdown: watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            break;
        }
        let next_deadline = inner.fire_deadlines().await;
        inner.dispatch_ready().await;

        let idle = Instant::now() + inner.config.idle_poll();
        let wake_at = next_deadline.map_or(idle, |at| at.min(idle));
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = inner.notify.notified() => {}
            _ = tokio::time::sleep_until(wake_at) => {}
        }
    }
    debug!("dispatch loop stopped");
}

async fn receive_loop(inner: Arc<Inner>, mut shutdown: watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            break;
        }
        let next = tokio::select! {
            _ = shutdown.changed() => break,
            next = inner.transport.receive() => next,
        };
        let Some((worker, frame)) = next else {
            debug!("transport closed");
            break;
        };
        inner.handle_frame(worker, frame).await;
    }
    debug!("receive loop stopped");
}

// ========================================
// Public API
// ========================================

/// Client-side dispatcher.
///
/// ```ignore
/// let coordinator = Coordinator::builder(cluster.clone(), cluster.clone()).build()?;
/// let handle = coordinator.apply(Value::function("double"), vec![Value::Int(21)]).await?;
/// assert_eq!(handle.get(None).await?, Value::Int(42));
/// ```
pub struct Coordinator {
    inner: Arc<Inner>,
    shutdown_tx: watch::Sender<bool>,
    joins: Mutex<Vec<JoinHandle<()>>>,
}

impl Coordinator {
    pub fn builder(transport: Arc<dyn Transport>, pool: Arc<dyn WorkerPool>) -> CoordinatorBuilder {
        CoordinatorBuilder::new(transport, pool)
    }

    /// Pack and enqueue a call.
    ///
    /// Serialization errors are returned here, synchronously. Every `TaskRef` found in
    /// the callable or arguments is added to the dependencies.
    pub async fn submit(
        &self,
        callable: Value,
        args: Vec<Value>,
        kwargs: BTreeMap<String, Value>,
        options: SubmitOptions,
    ) -> Result<AsyncResult, DispatchError> {
        let mut dependencies: BTreeSet<TaskId> = options.dependencies.iter().copied().collect();
        callable.collect_task_refs(&mut dependencies);
        for arg in &args {
            arg.collect_task_refs(&mut dependencies);
        }
        for value in kwargs.values() {
            value.collect_task_refs(&mut dependencies);
        }

        let payload = self.inner.packer().pack(&callable, &args, &kwargs)?;

        if let Some(target) = &options.target {
            let workers = self.inner.pool.list_available_workers().await;
            if !workers.contains(target) {
                return Err(DispatchError::UnknownWorker(target.clone()));
            }
        }

        let task_id = self.inner.ids.generate_task_id();
        let now = self.inner.clock.now();
        let (tx, rx) = watch::channel(None);

        let state = {
            let mut guard = self.inner.state.lock().await;
            let st = &mut *guard;
            if st.closed {
                return Err(DispatchError::Shutdown);
            }

            let mut pending = Vec::new();
            for &dep in &dependencies {
                let Some(record) = st.records.get(&dep) else {
                    return Err(DispatchError::UnknownDependency(dep));
                };
                match record.state {
                    TaskState::Completed => {}
                    s if s.is_terminal() => {
                        return Err(DispatchError::DependencyFailed {
                            task_id,
                            dependency: dep,
                        });
                    }
                    _ => pending.push(dep),
                }
            }

            let state = if pending.is_empty() {
                TaskState::Queued
            } else {
                TaskState::Created
            };
            for dep in pending {
                st.graph.add_dependency(task_id, dep);
            }

            st.records
                .insert(task_id, TaskRecord::new(task_id, state, now));
            st.outcomes.insert(task_id, tx);
            st.history.push(task_id);
            st.tasks.insert(
                task_id,
                DispatchTask {
                    task_id,
                    target: options.target,
                    payload,
                    retries: options.retries,
                    timeout: options.timeout,
                    dependencies,
                },
            );
            if state == TaskState::Queued {
                st.ready.push_back(task_id);
            }
            state
        };

        if state == TaskState::Queued {
            self.inner.notify.notify_one();
        }
        debug!(task = %task_id, callable = callable.type_name(), ?state, "submitted");
        Ok(AsyncResult::new(task_id, rx))
    }

    /// `submit` with no keyword arguments and default options.
    pub async fn apply(&self, callable: Value, args: Vec<Value>) -> Result<AsyncResult, DispatchError> {
        self.submit(callable, args, BTreeMap::new(), SubmitOptions::default())
            .await
    }

    /// Withdraw a task.
    ///
    /// Before it is sent the task is dropped locally. After that a cancel request goes to
    /// its engine, which drops it only if it has not started. Returns `false` for unknown
    /// or finished tasks.
    pub async fn cancel(&self, task_id: TaskId) -> bool {
        let now = self.inner.clock.now();
        let engine = {
            let mut guard = self.inner.state.lock().await;
            let st = &mut *guard;
            let Some(record) = st.records.get(&task_id) else {
                return false;
            };
            let (state, engine) = (record.state, record.engine.clone());
            if state.is_terminal() {
                return false;
            }
            if state.is_local() {
                st.fail(task_id, DispatchError::Cancelled { task_id }, None, now);
                info!(task = %task_id, "cancelled before send");
                return true;
            }
            engine
        };

        if let Some(worker) = engine
            && let Err(e) = self
                .inner
                .transport
                .send(&worker, Frame::Cancel { task_id })
                .await
        {
            warn!(task = %task_id, worker = %worker, error = %e, "cancel request not delivered");
        }
        true
    }

    /// Wait for a task's outcome, up to `timeout`.
    ///
    /// `Timeout` is local to this call; the task keeps running.
    pub async fn await_result(
        &self,
        handle: &AsyncResult,
        timeout: Option<Duration>,
    ) -> Result<Value, DispatchError> {
        handle.get(timeout).await
    }

    /// A fresh handle for a task that has not been purged.
    pub async fn handle(&self, task_id: TaskId) -> Option<AsyncResult> {
        let st = self.inner.state.lock().await;
        st.outcomes
            .get(&task_id)
            .map(|tx| AsyncResult::new(task_id, tx.subscribe()))
    }

    /// Enable the permissive codec here and on `targets`.
    pub async fn use_permissive_codec(&self, targets: Targets) -> Result<Vec<WorkerId>, DispatchError> {
        self.enable_codec(codec::RICH, targets).await
    }

    /// Register a built-in codec on each target engine, then locally.
    ///
    /// The local registry changes only once every engine has acknowledged, so a failed
    /// request leaves submissions under the previous codecs. Enabling an enabled codec
    /// is a no-op.
    pub async fn enable_codec(&self, name: &str, targets: Targets) -> Result<Vec<WorkerId>, DispatchError> {
        let (codec, priority) =
            codec::builtin(name).ok_or_else(|| DispatchError::UnknownCodec(name.to_string()))?;

        let available = self.inner.pool.list_available_workers().await;
        let workers = match targets {
            Targets::All => available,
            Targets::Only(workers) => {
                if let Some(unknown) = workers.iter().find(|w| !available.contains(w)) {
                    return Err(DispatchError::UnknownWorker(unknown.clone()));
                }
                workers
            }
        };

        let mut waiting = Vec::with_capacity(workers.len());
        for worker in &workers {
            let request_id = self.inner.ids.generate_control_id();
            let (tx, rx) = oneshot::channel();
            self.inner.state.lock().await.controls.insert(request_id, tx);

            let frame = Frame::EnableCodec {
                request_id,
                codec: name.to_string(),
            };
            if let Err(e) = self.inner.transport.send(worker, frame).await {
                self.inner.state.lock().await.controls.remove(&request_id);
                return Err(DispatchError::Transport(e.to_string()));
            }
            waiting.push((worker.clone(), request_id, rx));
        }

        let limit = self.inner.config.control_timeout();
        for (worker, request_id, rx) in waiting {
            match tokio::time::timeout(limit, rx).await {
                Ok(Ok(None)) => debug!(codec = name, worker = %worker, "codec enabled on engine"),
                Ok(Ok(Some(reason))) => return Err(DispatchError::ControlRejected { worker, reason }),
                Ok(Err(_)) => return Err(DispatchError::Shutdown),
                Err(_) => {
                    self.inner.state.lock().await.controls.remove(&request_id);
                    return Err(DispatchError::ControlTimeout { worker });
                }
            }
        }

        // ローカル登録は全 engine の ack の後。途中で失敗したら strict のまま
        self.inner.codecs.register(codec, priority);
        info!(codec = name, engines = workers.len(), "codec enabled");
        Ok(workers)
    }

    /// Codec names tried by this coordinator, in order.
    pub fn codec_names(&self) -> Vec<String> {
        self.inner.codecs.names()
    }

    // ---- task records ----

    pub async fn record(&self, task_id: TaskId) -> Option<TaskRecord> {
        self.inner.state.lock().await.records.get(&task_id).cloned()
    }

    /// Records matching `filter`, in submission order.
    pub async fn find_records(&self, filter: &RecordFilter) -> Vec<TaskRecord> {
        let st = self.inner.state.lock().await;
        st.history
            .iter()
            .filter_map(|id| st.records.get(id))
            .filter(|r| filter.matches(r))
            .cloned()
            .collect()
    }

    /// Task ids in submission order.
    pub async fn history(&self) -> Vec<TaskId> {
        self.inner.state.lock().await.history.clone()
    }

    pub async fn counts(&self) -> TaskCounts {
        let st = self.inner.state.lock().await;
        let mut counts = TaskCounts::default();
        for record in st.records.values() {
            counts.add(record.state);
        }
        counts
    }

    /// Drop the records of finished tasks.
    ///
    /// Fails without dropping anything if one of `task_ids` has not finished. Records a
    /// live task still needs results from are kept. Returns how many were dropped.
    pub async fn purge_results(&self, task_ids: &[TaskId]) -> Result<usize, DispatchError> {
        let mut st = self.inner.state.lock().await;
        let purged = st.purge_finished(task_ids)?;
        debug!(purged, "records purged");
        Ok(purged)
    }

    /// Drop the records matching `filter`, under the same rules as
    /// [`Coordinator::purge_results`].
    pub async fn purge_matching(&self, filter: &RecordFilter) -> Result<usize, DispatchError> {
        let mut st = self.inner.state.lock().await;
        let matching: Vec<TaskId> = st
            .history
            .iter()
            .filter(|id| st.records.get(*id).is_some_and(|r| filter.matches(r)))
            .copied()
            .collect();
        let purged = st.purge_finished(&matching)?;
        debug!(purged, ?filter, "records purged");
        Ok(purged)
    }

    /// Drop the records of every finished task.
    pub async fn purge_all_completed(&self) -> usize {
        let mut guard = self.inner.state.lock().await;
        let st = &mut *guard;
        let in_use = st.referenced();
        let finished: Vec<TaskId> = st
            .records
            .values()
            .filter(|r| r.state.is_terminal() && !in_use.contains(&r.task_id))
            .map(|r| r.task_id)
            .collect();
        let purged = finished.into_iter().filter(|id| st.purge(*id)).count();
        debug!(purged, "records purged");
        purged
    }

    /// Stop the loops. Pending tasks fail with `Shutdown`.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        {
            let mut st = self.inner.state.lock().await;
            st.closed = true;
            for tx in st.outcomes.values() {
                tx.send_if_modified(|outcome| {
                    if outcome.is_none() {
                        *outcome = Some(Err(DispatchError::Shutdown));
                        true
                    } else {
                        false
                    }
                });
            }
            st.controls.clear();
        }

        let joins = std::mem::take(&mut *self.joins.lock().await);
        for join in joins {
            let _ = join.await;
        }
        info!("coordinator stopped");
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

pub struct CoordinatorBuilder {
    transport: Arc<dyn Transport>,
    pool: Arc<dyn WorkerPool>,
    config: DispatchConfig,
    codecs: CodecRegistry,
    clock: Arc<dyn Clock>,
    ids: Option<Arc<dyn IdGenerator>>,
}

impl CoordinatorBuilder {
    pub fn new(transport: Arc<dyn Transport>, pool: Arc<dyn WorkerPool>) -> Self {
        Self {
            transport,
            pool,
            config: DispatchConfig::default(),
            codecs: CodecRegistry::strict(),
            clock: Arc::new(SystemClock),
            ids: None,
        }
    }

    pub fn config(mut self, config: DispatchConfig) -> Self {
        self.config = config;
        self
    }

    pub fn codecs(mut self, codecs: CodecRegistry) -> Self {
        self.codecs = codecs;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    /// Start the dispatch and receive loops. Must be called inside a tokio runtime.
    pub fn build(self) -> Result<Coordinator, ConfigError> {
        self.config.validate()?;

        let ids: Arc<dyn IdGenerator> = match self.ids {
            Some(ids) => ids,
            None => Arc::new(UlidGenerator::new(Arc::clone(&self.clock))),
        };
        let inner = Arc::new(Inner {
            state: Mutex::new(CoordinatorState::default()),
            notify: Notify::new(),
            transport: self.transport,
            pool: self.pool,
            codecs: self.codecs,
            config: self.config,
            clock: self.clock,
            ids,
        });

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let joins = vec![
            tokio::spawn(dispatch_loop(Arc::clone(&inner), shutdown_rx.clone())),
            tokio::spawn(receive_loop(Arc::clone(&inner), shutdown_rx)),
        ];
        info!(codecs = ?inner.codecs.names(), "coordinator started");

        Ok(Coordinator {
            inner,
            shutdown_tx,
            joins: Mutex::new(joins),
        })
    }
}
