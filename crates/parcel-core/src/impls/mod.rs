//! Impls - ports の in-process 実装
//!
//! # 含まれる実装
//! - **LocalCluster**: Transport + WorkerPool。engine をすべて同じプロセスの tokio task として動かす
//!
//! ネットワーク越しの transport はこの crate の外で実装します。

pub mod local_cluster;

pub use self::local_cluster::{BuildError, ClusterBuilder, LocalCluster};

#[cfg(test)]
pub(crate) mod fixtures {
    //! Functions and transport wrappers shared by the tests.

    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;

    use crate::domain::{RemoteError, Value, WorkerId};
    use crate::functions::FunctionRegistry;
    use crate::ports::{DeliveryToken, Frame, Transport, TransportError};

    pub fn test_functions() -> FunctionRegistry {
        let mut f = FunctionRegistry::new();
        f.register("double", |inv| Ok(Value::Int(inv.int_arg(0)? * 2)))
            .unwrap();
        f.register("add_one", |inv| Ok(Value::Int(inv.int_arg(0)? + 1)))
            .unwrap();
        f.register("sleep_ms", |inv| {
            std::thread::sleep(Duration::from_millis(inv.int_arg(0)?.max(0) as u64));
            Ok(Value::None)
        })
        .unwrap();
        // (ms, value) -> value
        f.register("sleep_then", |inv| {
            std::thread::sleep(Duration::from_millis(inv.int_arg(0)?.max(0) as u64));
            Ok(inv.arg(1)?.clone())
        })
        .unwrap();
        f.register("fail", |inv| {
            let msg = inv.arg(0).ok().and_then(Value::as_str).unwrap_or("failed");
            Err(RemoteError::new("RuntimeError", msg))
        })
        .unwrap();
        f.register("panic", |_| panic!("boom")).unwrap();
        f.register("add_captured", |inv| {
            let offset = inv
                .captured("offset")?
                .as_int()
                .ok_or_else(|| RemoteError::type_error("offset must be int"))?;
            Ok(Value::Int(inv.int_arg(0)? + offset))
        })
        .unwrap();
        // closure over an open file: length of the file times `scale`
        f.register("file_len", |inv| {
            let handle = inv
                .captured("handle")?
                .as_resource()
                .ok_or_else(|| RemoteError::type_error("handle must be a resource"))?;
            let file = handle
                .open()
                .map_err(|e| RemoteError::new("IOError", e.to_string()))?;
            let len = file
                .metadata()
                .map_err(|e| RemoteError::new("IOError", e.to_string()))?
                .len() as i64;
            Ok(Value::Int(len * inv.int_arg(0)?))
        })
        .unwrap();
        f.register("len", |inv| match inv.arg(0)? {
            Value::Bytes(b) => Ok(Value::Int(b.len() as i64)),
            Value::List(items) => Ok(Value::Int(items.len() as i64)),
            other => Err(RemoteError::type_error(format!(
                "object of type `{}` has no len()",
                other.type_name()
            ))),
        })
        .unwrap();
        f
    }

    /// Forwards frames, but silently drops the first `n` frames of one kind
    /// (execute frames unless built with [`DroppingTransport::of_kind`]).
    pub struct DroppingTransport<T> {
        inner: Arc<T>,
        kind: &'static str,
        drops_left: AtomicU32,
        pub dropped: AtomicU32,
    }

    impl<T> DroppingTransport<T> {
        pub fn new(inner: Arc<T>, n: u32) -> Self {
            Self::of_kind(inner, "execute", n)
        }

        pub fn of_kind(inner: Arc<T>, kind: &'static str, n: u32) -> Self {
            Self {
                inner,
                kind,
                drops_left: AtomicU32::new(n),
                dropped: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl<T: Transport + 'static> Transport for DroppingTransport<T> {
        async fn send(&self, destination: &WorkerId, frame: Frame) -> Result<DeliveryToken, TransportError> {
            if frame.kind() == self.kind
                && self
                    .drops_left
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok()
            {
                self.dropped.fetch_add(1, Ordering::SeqCst);
                return Ok(DeliveryToken(u64::MAX));
            }
            self.inner.send(destination, frame).await
        }

        async fn receive(&self) -> Option<(WorkerId, Frame)> {
            self.inner.receive().await
        }
    }
}
