//! Ports - 抽象化レイヤー
//!
//! coordinator が外の世界に依存する部分を trait として切り出します。
//! - **Transport**: engine とのフレームのやり取り
//! - **WorkerPool**: 利用可能な engine とその負荷
//! - **Clock** / **IdGenerator**: 時刻と ID（テストで差し替え可能）
//!
//! in-process 実装は `impls::LocalCluster` にあります。

pub mod clock;
pub mod id_generator;
pub mod pool;
pub mod transport;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::pool::WorkerPool;
pub use self::transport::{DeliveryToken, Frame, Transport, TransportError};
