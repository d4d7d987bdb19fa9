//! WorkerPool port - 利用可能な engine と負荷

use async_trait::async_trait;

use crate::domain::WorkerId;

#[async_trait]
pub trait WorkerPool: Send + Sync {
    async fn list_available_workers(&self) -> Vec<WorkerId>;

    /// Tasks accepted by `worker` and not yet finished.
    async fn worker_load(&self, worker: &WorkerId) -> usize;
}
