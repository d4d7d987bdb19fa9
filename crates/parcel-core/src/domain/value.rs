//! Value - ディスパッチされるオブジェクトのモデル
//!
//! 任意のオブジェクトの代わりに、閉じた enum で表現します。
//! codec は `Value` を bytes に変換するだけで、型ごとの分岐は持ちません。
//!
//! # 「素直でない」値
//! - [`Closure`]: 名前で参照できる関数 + キャプチャした環境（名前付きの値）
//! - [`ResourceHandle`]: 開いているファイルなどのリソース
//!
//! どちらも strict codec では拒否され、rich codec を有効にすると運べるようになります。
//! コード本体はネットワークを渡りません。engine 側に同じ名前で登録されている必要があります。

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs::File;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::ids::TaskId;

/// A dispatchable object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Bytes),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
    Function(FunctionRef),
    Closure(Closure),
    Resource(ResourceHandle),
    /// The result of another task, resolved on the engine before execution.
    TaskRef(TaskId),
    /// Placeholder left by the buffer extractor: the n-th out-of-band buffer.
    #[doc(hidden)]
    Buffer(usize),
}

/// Reference to code registered on the engines under `name`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionRef {
    pub name: String,
}

/// A function plus its captured environment.
///
/// The environment is an ordered set of named values; the engine hands it to the
/// function through [`crate::functions::Invocation::captured`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Closure {
    pub function: String,
    pub captured: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourceKind {
    File,
}

/// An open resource, carried by locator and reopened where it is used.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceHandle {
    pub kind: ResourceKind,
    pub path: PathBuf,
}

impl ResourceHandle {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self {
            kind: ResourceKind::File,
            path: path.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn open(&self) -> std::io::Result<File> {
        match self.kind {
            ResourceKind::File => File::open(&self.path),
        }
    }
}

impl Value {
    pub fn function(name: impl Into<String>) -> Self {
        Value::Function(FunctionRef { name: name.into() })
    }

    /// `captured` の順序は名前順で固定されます。
    pub fn closure<K, I>(function: impl Into<String>, captured: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Value)>,
    {
        Value::Closure(Closure {
            function: function.into(),
            captured: captured.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        })
    }

    pub fn bytes(data: impl Into<Bytes>) -> Self {
        Value::Bytes(data.into())
    }

    /// The declared type, used in serialization error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::None => "none",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::Bytes(_) => "bytes",
            Value::List(_) => "list",
            Value::Map(_) => "map",
            Value::Function(_) => "function",
            Value::Closure(_) => "closure",
            Value::Resource(r) => match r.kind {
                ResourceKind::File => "resource<file>",
            },
            Value::TaskRef(_) => "task_ref",
            Value::Buffer(_) => "buffer",
        }
    }

    pub fn is_callable(&self) -> bool {
        matches!(self, Value::Function(_) | Value::Closure(_))
    }

    /// Name of the first nested value a plain data format cannot carry, if any.
    ///
    /// Closures, resources and non-finite floats qualify.
    pub fn find_unportable(&self) -> Option<&'static str> {
        match self {
            Value::Closure(_) | Value::Resource(_) => Some(self.type_name()),
            Value::Float(f) if !f.is_finite() => Some("float<non-finite>"),
            Value::List(items) => items.iter().find_map(Value::find_unportable),
            Value::Map(map) => map.values().find_map(Value::find_unportable),
            _ => None,
        }
    }

    /// Collect every `TaskRef` reachable from this value.
    pub fn collect_task_refs(&self, out: &mut BTreeSet<TaskId>) {
        match self {
            Value::TaskRef(id) => {
                out.insert(*id);
            }
            Value::List(items) => items.iter().for_each(|v| v.collect_task_refs(out)),
            Value::Map(map) => map.values().for_each(|v| v.collect_task_refs(out)),
            Value::Closure(c) => c.captured.values().for_each(|v| v.collect_task_refs(out)),
            _ => {}
        }
    }

    /// Replace every `TaskRef` with the matching resolved result.
    ///
    /// Returns the first reference that has no result.
    pub fn resolve_task_refs(&mut self, results: &HashMap<TaskId, Value>) -> Result<(), TaskId> {
        match self {
            Value::TaskRef(id) => {
                let resolved = results.get(id).ok_or(*id)?;
                *self = resolved.clone();
                Ok(())
            }
            Value::List(items) => items
                .iter_mut()
                .try_for_each(|v| v.resolve_task_refs(results)),
            Value::Map(map) => map
                .values_mut()
                .try_for_each(|v| v.resolve_task_refs(results)),
            Value::Closure(c) => c
                .captured
                .values_mut()
                .try_for_each(|v| v.resolve_task_refs(results)),
            _ => Ok(()),
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_resource(&self) -> Option<&ResourceHandle> {
        match self {
            Value::Resource(r) => Some(r),
            _ => None,
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::List(v)
    }
}

impl From<ResourceHandle> for Value {
    fn from(v: ResourceHandle) -> Self {
        Value::Resource(v)
    }
}

impl From<TaskId> for Value {
    fn from(v: TaskId) -> Self {
        Value::TaskRef(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_data_is_portable() {
        let v = Value::List(vec![
            Value::Int(1),
            Value::from("two"),
            Value::Map(BTreeMap::from([("k".to_string(), Value::Float(0.5))])),
        ]);
        assert_eq!(v.find_unportable(), None);
    }

    #[test]
    fn nested_resource_is_unportable() {
        let v = Value::List(vec![
            Value::Int(1),
            Value::Resource(ResourceHandle::file("/tmp/x")),
        ]);
        assert_eq!(v.find_unportable(), Some("resource<file>"));
    }

    #[test]
    fn nan_is_unportable() {
        assert_eq!(
            Value::Float(f64::NAN).find_unportable(),
            Some("float<non-finite>")
        );
    }

    #[test]
    fn task_refs_are_collected_from_closures() {
        let a = TaskId::from_u128(1);
        let b = TaskId::from_u128(2);
        let v = Value::closure(
            "f",
            [("x", Value::TaskRef(a)), ("y", Value::List(vec![Value::TaskRef(b)]))],
        );

        let mut refs = BTreeSet::new();
        v.collect_task_refs(&mut refs);
        assert_eq!(refs, BTreeSet::from([a, b]));
    }

    #[test]
    fn resolve_task_refs_substitutes_results() {
        let a = TaskId::from_u128(1);
        let mut v = Value::List(vec![Value::TaskRef(a), Value::Int(2)]);
        let results = HashMap::from([(a, Value::Int(1))]);

        v.resolve_task_refs(&results).unwrap();
        assert_eq!(v, Value::List(vec![Value::Int(1), Value::Int(2)]));
    }

    #[test]
    fn resolve_task_refs_reports_missing() {
        let a = TaskId::from_u128(7);
        let mut v = Value::TaskRef(a);
        assert_eq!(v.resolve_task_refs(&HashMap::new()), Err(a));
    }
}
