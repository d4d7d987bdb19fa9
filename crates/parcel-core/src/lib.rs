//! parcel-core
//!
//! Pluggable object serialization for remote task dispatch.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, value, state, errors）
//! - **codec**: codec trait と優先度付きの CodecRegistry（json / rich）
//! - **wire**: バッファ抽出とメッセージの pack / unpack
//! - **ports**: 抽象化レイヤー（Transport, WorkerPool, Clock, IdGenerator）
//! - **dispatch**: Coordinator（submit, 依存関係, リトライ, 結果ハンドル）
//! - **engine**: リモート側の unpack と実行
//! - **functions**: engine が名前で解決する関数の登録
//! - **impls**: 実装（in-process の LocalCluster）
//! - **config**: DispatchConfig

pub mod codec;
pub mod config;
pub mod dispatch;
pub mod domain;
pub mod engine;
pub mod functions;
pub mod impls;
pub mod ports;
pub mod wire;

pub use crate::codec::CodecRegistry;
pub use crate::config::DispatchConfig;
pub use crate::dispatch::{AsyncResult, Coordinator, SubmitOptions, Targets};
pub use crate::domain::{DispatchError, RemoteError, ResourceHandle, SerializationError, TaskId, Value, WorkerId};
pub use crate::engine::Engine;
pub use crate::functions::{FunctionRegistry, Invocation};
pub use crate::impls::LocalCluster;
