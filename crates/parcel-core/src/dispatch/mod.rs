//! Dispatch - クライアント側のタスク管理
//!
//! # 構成
//! - **coordinator**: submit / cancel / await、配送とリトライ
//! - **dependency**: タスク間の依存グラフ
//! - **record**: タスクごとの履歴レコード
//! - **retry**: 再送間隔のバックオフ
//! - **task**: 投入オプションと結果ハンドル

mod coordinator;
mod dependency;
mod record;
mod retry;
mod task;

pub use self::coordinator::{Coordinator, CoordinatorBuilder};
pub use self::dependency::DependencyGraph;
pub use self::record::{RecordFilter, TaskCounts, TaskRecord};
pub use self::retry::RetryPolicy;
pub use self::task::{AsyncResult, DispatchTask, SubmitOptions, Targets};
