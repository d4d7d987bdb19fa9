//! Engine - タスクを受け取って実行するリモート実行コンテキスト
//!
//! # ループ構成
//! - **intake loop**: フレームを受け取る。Execute は即座に ack してキューに積む
//! - **run loop**: キューから 1 件ずつ取り出して実行する（同時実行は 1 件）
//!
//! 実行は `spawn_blocking` の中で行います。関数がエラーを返しても panic しても
//! ループは止まらず、`Errored` の結果として coordinator に返します。
//!
//! codec registry は engine ごとに持ちます。最初は strict のみで、
//! `EnableCodec` フレームで追加されます。

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::{Mutex, Notify, mpsc, watch};
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error, warn};

use crate::codec::{self, CodecRegistry};
use crate::config::DispatchConfig;
use crate::domain::{RemoteError, TaskId, Value, WorkerId};
use crate::functions::FunctionRegistry;
use crate::ports::Frame;
use crate::wire::{PackedMessage, Packer};

/// A task accepted by the engine and not started yet.
#[derive(Debug)]
struct Pending {
    task_id: TaskId,
    payload: PackedMessage,
    inputs: Vec<(TaskId, PackedMessage)>,
}

pub struct Engine {
    id: WorkerId,
    codecs: CodecRegistry,
    functions: Arc<FunctionRegistry>,
    buffer_threshold: usize,
    item_threshold: usize,
    load: Arc<AtomicUsize>,
}

impl Engine {
    pub fn new(id: WorkerId, functions: Arc<FunctionRegistry>, config: &DispatchConfig) -> Self {
        Self {
            id,
            codecs: CodecRegistry::strict(),
            functions,
            buffer_threshold: config.buffer_threshold,
            item_threshold: config.item_threshold,
            load: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_codecs(mut self, codecs: CodecRegistry) -> Self {
        self.codecs = codecs;
        self
    }

    pub fn id(&self) -> &WorkerId {
        &self.id
    }

    /// Counter of tasks accepted and not yet finished.
    pub fn load_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.load)
    }

    /// Start the intake and run loops.
    ///
    /// Replies go to `outbox` tagged with this engine's id.
    pub fn spawn(
        self,
        inbox: mpsc::Receiver<Frame>,
        outbox: mpsc::Sender<(WorkerId, Frame)>,
        shutdown: watch::Receiver<bool>,
    ) -> Vec<JoinHandle<()>> {
        let shared = Arc::new(Shared {
            id: self.id,
            codecs: self.codecs,
            functions: self.functions,
            buffer_threshold: self.buffer_threshold,
            item_threshold: self.item_threshold,
            load: self.load,
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            outbox,
        });

        let intake = tokio::spawn(intake_loop(Arc::clone(&shared), inbox, shutdown.clone()));
        let run = tokio::spawn(run_loop(shared, shutdown));
        vec![intake, run]
    }
}

struct Shared {
    id: WorkerId,
    codecs: CodecRegistry,
    functions: Arc<FunctionRegistry>,
    buffer_threshold: usize,
    item_threshold: usize,
    load: Arc<AtomicUsize>,
    queue: Mutex<VecDeque<Pending>>,
    notify: Notify,
    outbox: mpsc::Sender<(WorkerId, Frame)>,
}

impl Shared {
    fn packer(&self) -> Packer<'_> {
        Packer::new(&self.codecs, self.buffer_threshold, self.item_threshold)
    }

    async fn reply(&self, frame: Frame) {
        if self.outbox.send((self.id.clone(), frame)).await.is_err() {
            debug!(engine = %self.id, "coordinator side closed, reply dropped");
        }
    }

    /// Unpack, resolve dependency results, call.
    fn run_task(&self, payload: &[bytes::Bytes], inputs: &[(TaskId, PackedMessage)]) -> Result<Value, RemoteError> {
        let packer = self.packer();
        let mut call = packer.unpack(payload).map_err(RemoteError::from)?;

        let mut results = HashMap::with_capacity(inputs.len());
        for (dep, message) in inputs {
            let value = packer.unpack_outcome(message).map_err(|e| {
                RemoteError::new("DependencyFailed", format!("{dep}: {e}"))
            })?;
            results.insert(*dep, value);
        }

        let unresolved =
            |missing: TaskId| RemoteError::new("DependencyFailed", format!("no result for {missing}"));
        call.callable.resolve_task_refs(&results).map_err(unresolved)?;
        for arg in &mut call.args {
            arg.resolve_task_refs(&results).map_err(unresolved)?;
        }
        for value in call.kwargs.values_mut() {
            value.resolve_task_refs(&results).map_err(unresolved)?;
        }

        self.functions
            .call(&call.callable, call.args, call.kwargs, Some(self.id.clone()))
    }

    fn pack_outcome(&self, outcome: Result<Value, RemoteError>) -> PackedMessage {
        let packer = self.packer();
        let packed = match outcome {
            Ok(value) => packer
                .pack_result(&value)
                .or_else(|e| packer.pack_error(&RemoteError::from(e))),
            Err(e) => packer.pack_error(&e),
        };
        packed.unwrap_or_else(|e| {
            error!(engine = %self.id, error = %e, "cannot pack result");
            Vec::new()
        })
    }
}

async fn intake_loop(
    shared: Arc<Shared>,
    mut inbox: mpsc::Receiver<Frame>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }
        let frame = tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
            frame = inbox.recv() => frame,
        };
        let Some(frame) = frame else {
            break;
        };

        match frame {
            Frame::Execute {
                task_id,
                payload,
                inputs,
            } => {
                shared.load.fetch_add(1, Ordering::SeqCst);
                // Ack は Started より先に届く必要がある
                shared.reply(Frame::Ack { task_id }).await;
                shared.queue.lock().await.push_back(Pending {
                    task_id,
                    payload,
                    inputs,
                });
                shared.notify.notify_one();
            }
            Frame::Cancel { task_id } => {
                let removed = {
                    let mut queue = shared.queue.lock().await;
                    queue
                        .iter()
                        .position(|p| p.task_id == task_id)
                        .and_then(|i| queue.remove(i))
                };
                if removed.is_some() {
                    shared.load.fetch_sub(1, Ordering::SeqCst);
                    debug!(engine = %shared.id, task = %task_id, "dropped before start");
                    shared.reply(Frame::Cancelled { task_id }).await;
                } else {
                    debug!(engine = %shared.id, task = %task_id, "cancel ignored, already started or unknown");
                }
            }
            Frame::EnableCodec { request_id, codec } => {
                let error = match codec::builtin(&codec) {
                    Some((c, priority)) => {
                        shared.codecs.register(c, priority);
                        None
                    }
                    None => Some(format!("unknown codec `{codec}`")),
                };
                shared.reply(Frame::ControlAck { request_id, error }).await;
            }
            other => warn!(engine = %shared.id, kind = other.kind(), "unexpected frame"),
        }
    }
    debug!(engine = %shared.id, "intake loop stopped");
}

async fn run_loop(shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            break;
        }
        let next = shared.queue.lock().await.pop_front();
        let Some(task) = next else {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = shared.notify.notified() => {}
            }
            continue;
        };

        let task_id = task.task_id;
        shared.reply(Frame::Started { task_id }).await;

        let worker = Arc::clone(&shared);
        let job = tokio::task::spawn_blocking(move || worker.run_task(&task.payload, &task.inputs));
        let outcome = match job.await {
            Ok(outcome) => outcome,
            Err(e) => Err(RemoteError::new("Panic", panic_message(e))),
        };
        if let Err(e) = &outcome {
            debug!(engine = %shared.id, task = %task_id, error = %e, "task failed");
        }

        let payload = shared.pack_outcome(outcome);
        shared.load.fetch_sub(1, Ordering::SeqCst);
        shared.reply(Frame::Result { task_id, payload }).await;
    }
    debug!(engine = %shared.id, "run loop stopped");
}

fn panic_message(err: JoinError) -> String {
    if !err.is_panic() {
        return err.to_string();
    }
    let payload = err.into_panic();
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "task panicked".to_string())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::time::Duration;

    use super::*;
    use crate::codec::RICH;
    use crate::domain::ControlId;
    use crate::impls::fixtures::test_functions;

    struct Harness {
        inbox: mpsc::Sender<Frame>,
        replies: mpsc::Receiver<(WorkerId, Frame)>,
        _shutdown: watch::Sender<bool>,
        codecs: CodecRegistry,
    }

    impl Harness {
        fn start() -> Self {
            let config = DispatchConfig::default();
            let engine = Engine::new(WorkerId::new("engine-0"), Arc::new(test_functions()), &config);
            let (inbox, inbox_rx) = mpsc::channel(16);
            let (reply_tx, replies) = mpsc::channel(16);
            let (shutdown, shutdown_rx) = watch::channel(false);
            engine.spawn(inbox_rx, reply_tx, shutdown_rx);
            Self {
                inbox,
                replies,
                _shutdown: shutdown,
                codecs: CodecRegistry::permissive(),
            }
        }

        async fn execute(&self, task_id: TaskId, callable: Value, args: Vec<Value>) {
            let payload = Packer::new(&self.codecs, 1024, 64)
                .pack(&callable, &args, &BTreeMap::new())
                .unwrap();
            self.inbox
                .send(Frame::Execute {
                    task_id,
                    payload,
                    inputs: Vec::new(),
                })
                .await
                .unwrap();
        }

        async fn next(&mut self) -> Frame {
            tokio::time::timeout(Duration::from_secs(5), self.replies.recv())
                .await
                .unwrap()
                .unwrap()
                .1
        }

        async fn result_of(&mut self, task_id: TaskId) -> Result<Value, crate::domain::DispatchError> {
            loop {
                if let Frame::Result { task_id: id, payload } = self.next().await
                    && id == task_id
                {
                    return Packer::new(&self.codecs, 1024, 64).unpack_outcome(&payload);
                }
            }
        }
    }

    #[tokio::test]
    async fn executes_and_reports_in_order() {
        let mut h = Harness::start();
        let id = TaskId::from_u128(1);
        h.execute(id, Value::function("double"), vec![Value::Int(21)]).await;

        assert_eq!(h.next().await, Frame::Ack { task_id: id });
        assert_eq!(h.next().await, Frame::Started { task_id: id });
        assert_eq!(h.result_of(id).await.unwrap(), Value::Int(42));
    }

    #[tokio::test]
    async fn failures_and_panics_are_reported_not_fatal() {
        let mut h = Harness::start();
        let bad = TaskId::from_u128(1);
        let boom = TaskId::from_u128(2);
        let ok = TaskId::from_u128(3);

        h.execute(bad, Value::function("double"), vec![Value::from("x")]).await;
        h.execute(boom, Value::function("panic"), vec![]).await;
        h.execute(ok, Value::function("double"), vec![Value::Int(2)]).await;

        let err = h.result_of(bad).await.unwrap_err();
        assert!(err.to_string().contains("TypeError"));
        let err = h.result_of(boom).await.unwrap_err();
        assert!(err.to_string().contains("Panic"));
        assert_eq!(h.result_of(ok).await.unwrap(), Value::Int(4));
    }

    #[tokio::test]
    async fn cancel_drops_a_task_that_has_not_started() {
        let mut h = Harness::start();
        let slow = TaskId::from_u128(1);
        let queued = TaskId::from_u128(2);

        h.execute(slow, Value::function("sleep_ms"), vec![Value::Int(200)]).await;
        h.execute(queued, Value::function("double"), vec![Value::Int(1)]).await;
        h.inbox.send(Frame::Cancel { task_id: queued }).await.unwrap();

        loop {
            match h.next().await {
                Frame::Cancelled { task_id } => {
                    assert_eq!(task_id, queued);
                    break;
                }
                Frame::Result { task_id, .. } => assert_ne!(task_id, queued),
                _ => {}
            }
        }
        assert_eq!(h.result_of(slow).await.unwrap(), Value::None);
    }

    #[tokio::test]
    async fn closures_need_the_rich_codec_enabled() {
        let mut h = Harness::start();
        let closure = Value::closure("add_captured", [("offset", Value::Int(10))]);

        let first = TaskId::from_u128(1);
        h.execute(first, closure.clone(), vec![Value::Int(1)]).await;
        let err = h.result_of(first).await.unwrap_err();
        assert!(err.to_string().contains("MalformedMessage"));

        let request_id = ControlId::from_u128(9);
        h.inbox
            .send(Frame::EnableCodec {
                request_id,
                codec: RICH.to_string(),
            })
            .await
            .unwrap();
        assert_eq!(
            h.next().await,
            Frame::ControlAck {
                request_id,
                error: None
            }
        );

        let second = TaskId::from_u128(2);
        h.execute(second, closure, vec![Value::Int(1)]).await;
        assert_eq!(h.result_of(second).await.unwrap(), Value::Int(11));
    }

    #[tokio::test]
    async fn unknown_codec_is_rejected() {
        let mut h = Harness::start();
        let request_id = ControlId::from_u128(1);
        h.inbox
            .send(Frame::EnableCodec {
                request_id,
                codec: "pickle".to_string(),
            })
            .await
            .unwrap();

        match h.next().await {
            Frame::ControlAck { error: Some(e), .. } => assert!(e.contains("pickle")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn task_refs_resolve_from_inputs() {
        let mut h = Harness::start();
        let dep = TaskId::from_u128(1);
        let id = TaskId::from_u128(2);
        let packer = Packer::new(&h.codecs, 1024, 64);

        let payload = packer
            .pack(&Value::function("add_one"), &[Value::TaskRef(dep)], &BTreeMap::new())
            .unwrap();
        let input = packer.pack_result(&Value::Int(1)).unwrap();
        h.inbox
            .send(Frame::Execute {
                task_id: id,
                payload,
                inputs: vec![(dep, input)],
            })
            .await
            .unwrap();

        assert_eq!(h.result_of(id).await.unwrap(), Value::Int(2));
    }
}
