//! LocalCluster - in-process の engine 群
//!
//! Transport と WorkerPool の両方を実装します。engine ごとに inbox (mpsc) を持ち、
//! 返信はすべて 1 本の共有チャネルに集まります。
//!
//! # Fail-fast 設計
//! `ClusterBuilder::expect_functions()` で期待する関数名を渡すと、
//! `build()` 時に登録漏れを `BuildError` として返します。

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::codec::CodecRegistry;
use crate::config::DispatchConfig;
use crate::domain::{RemoteError, Value, WorkerId};
use crate::engine::Engine;
use crate::functions::{FunctionError, FunctionRegistry, Invocation};
use crate::ports::{DeliveryToken, Frame, Transport, TransportError, WorkerPool};

const CHANNEL_CAPACITY: usize = 1024;

struct EngineLink {
    inbox: mpsc::Sender<Frame>,
    load: Arc<AtomicUsize>,
}

pub struct LocalCluster {
    engines: BTreeMap<WorkerId, EngineLink>,
    replies: Mutex<mpsc::Receiver<(WorkerId, Frame)>>,
    next_token: AtomicU64,
    functions: Arc<FunctionRegistry>,
    shutdown_tx: watch::Sender<bool>,
    joins: Mutex<Vec<JoinHandle<()>>>,
}

impl LocalCluster {
    pub fn builder() -> ClusterBuilder {
        ClusterBuilder::new()
    }

    pub fn engine_ids(&self) -> Vec<WorkerId> {
        self.engines.keys().cloned().collect()
    }

    /// The registry every engine resolves functions from.
    pub fn functions(&self) -> &Arc<FunctionRegistry> {
        &self.functions
    }

    /// Stop every engine and wait for their loops to exit.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let joins = std::mem::take(&mut *self.joins.lock().await);
        for join in joins {
            let _ = join.await;
        }
        info!(engines = self.engines.len(), "local cluster stopped");
    }
}

impl Drop for LocalCluster {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

#[async_trait]
impl Transport for LocalCluster {
    async fn send(&self, destination: &WorkerId, frame: Frame) -> Result<DeliveryToken, TransportError> {
        let link = self
            .engines
            .get(destination)
            .ok_or_else(|| TransportError::UnknownDestination(destination.clone()))?;
        let kind = frame.kind();
        link.inbox
            .send(frame)
            .await
            .map_err(|_| TransportError::Closed)?;

        let token = DeliveryToken(self.next_token.fetch_add(1, Ordering::Relaxed));
        debug!(engine = %destination, kind, token = token.0, "frame sent");
        Ok(token)
    }

    async fn receive(&self) -> Option<(WorkerId, Frame)> {
        self.replies.lock().await.recv().await
    }
}

#[async_trait]
impl WorkerPool for LocalCluster {
    async fn list_available_workers(&self) -> Vec<WorkerId> {
        self.engines
            .iter()
            .filter(|(_, link)| !link.inbox.is_closed())
            .map(|(id, _)| id.clone())
            .collect()
    }

    async fn worker_load(&self, worker: &WorkerId) -> usize {
        self.engines
            .get(worker)
            .map(|link| link.load.load(Ordering::SeqCst))
            .unwrap_or(0)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("Missing functions: {0:?}. These functions were expected but not registered.")]
    MissingFunctions(Vec<String>),

    #[error("a cluster needs at least one engine")]
    NoEngines,
}

/// Builds a [`LocalCluster`].
///
/// ```ignore
/// let cluster = LocalCluster::builder()
///     .engines(4)
///     .function("double", |inv| Ok(Value::Int(inv.int_arg(0)? * 2)))?
///     .expect_functions(&["double"])
///     .build()?;
/// ```
pub struct ClusterBuilder {
    engines: usize,
    functions: FunctionRegistry,
    expected_functions: Option<Vec<String>>,
    config: DispatchConfig,
    permissive: bool,
}

impl ClusterBuilder {
    pub fn new() -> Self {
        Self {
            engines: 2,
            functions: FunctionRegistry::new(),
            expected_functions: None,
            config: DispatchConfig::default(),
            permissive: false,
        }
    }

    pub fn engines(mut self, n: usize) -> Self {
        self.engines = n;
        self
    }

    pub fn config(mut self, config: DispatchConfig) -> Self {
        self.config = config;
        self
    }

    /// Start engines with the rich codec already enabled.
    pub fn permissive(mut self) -> Self {
        self.permissive = true;
        self
    }

    pub fn function<F>(mut self, name: &str, f: F) -> Result<Self, FunctionError>
    where
        F: Fn(&Invocation) -> Result<Value, RemoteError> + Send + Sync + 'static,
    {
        self.functions.register(name, f)?;
        Ok(self)
    }

    pub fn functions(mut self, functions: FunctionRegistry) -> Self {
        self.functions = functions;
        self
    }

    pub fn expect_functions(mut self, names: &[&str]) -> Self {
        self.expected_functions = Some(names.iter().map(|n| n.to_string()).collect());
        self
    }

    /// Spawn the engines. Must be called inside a tokio runtime.
    pub fn build(self) -> Result<Arc<LocalCluster>, BuildError> {
        if let Some(expected) = &self.expected_functions {
            let missing: Vec<String> = expected
                .iter()
                .filter(|name| !self.functions.contains(name))
                .cloned()
                .collect();
            if !missing.is_empty() {
                return Err(BuildError::MissingFunctions(missing));
            }
        }
        if self.engines == 0 {
            return Err(BuildError::NoEngines);
        }

        let functions = Arc::new(self.functions);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (reply_tx, reply_rx) = mpsc::channel(CHANNEL_CAPACITY);

        let mut engines = BTreeMap::new();
        let mut joins = Vec::new();
        for i in 0..self.engines {
            let id = WorkerId::new(format!("engine-{i}"));
            let codecs = if self.permissive {
                CodecRegistry::permissive()
            } else {
                CodecRegistry::strict()
            };
            let engine = Engine::new(id.clone(), Arc::clone(&functions), &self.config).with_codecs(codecs);
            let load = engine.load_counter();
            let (inbox_tx, inbox_rx) = mpsc::channel(CHANNEL_CAPACITY);

            joins.extend(engine.spawn(inbox_rx, reply_tx.clone(), shutdown_rx.clone()));
            engines.insert(
                id,
                EngineLink {
                    inbox: inbox_tx,
                    load,
                },
            );
        }
        info!(engines = engines.len(), functions = ?functions.registered_names(), "local cluster started");

        Ok(Arc::new(LocalCluster {
            engines,
            replies: Mutex::new(reply_rx),
            next_token: AtomicU64::new(0),
            functions,
            shutdown_tx,
            joins: Mutex::new(joins),
        }))
    }
}

impl Default for ClusterBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::impls::fixtures::test_functions;

    #[tokio::test]
    async fn build_fails_on_missing_functions() {
        let result = LocalCluster::builder()
            .functions(test_functions())
            .expect_functions(&["double", "triple"])
            .build();
        assert!(matches!(
            result,
            Err(BuildError::MissingFunctions(missing)) if missing == vec!["triple".to_string()]
        ));
    }

    #[tokio::test]
    async fn zero_engines_is_rejected() {
        assert!(matches!(
            LocalCluster::builder().engines(0).build(),
            Err(BuildError::NoEngines)
        ));
    }

    #[tokio::test]
    async fn duplicate_function_is_rejected() {
        let result = LocalCluster::builder()
            .function("f", |_| Ok(Value::None))
            .and_then(|b| b.function("f", |_| Ok(Value::None)));
        assert!(matches!(result, Err(FunctionError::AlreadyRegistered(_))));
    }

    #[tokio::test]
    async fn engines_are_listed_and_idle() {
        let cluster = LocalCluster::builder().engines(3).build().unwrap();

        let workers = cluster.list_available_workers().await;
        assert_eq!(workers.len(), 3);
        assert_eq!(workers[0], WorkerId::new("engine-0"));
        for w in &workers {
            assert_eq!(cluster.worker_load(w).await, 0);
        }
        cluster.shutdown().await;
    }

    #[tokio::test]
    async fn send_to_unknown_engine_fails() {
        let cluster = LocalCluster::builder().engines(1).build().unwrap();
        let err = cluster
            .send(
                &WorkerId::new("engine-9"),
                Frame::Cancel {
                    task_id: crate::domain::TaskId::from_u128(1),
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err, TransportError::UnknownDestination(WorkerId::new("engine-9")));
        cluster.shutdown().await;
    }
}
