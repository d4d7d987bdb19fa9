//! Buffer extraction: pull large binary payloads out of a value.
//!
//! The walk is pre-order and deterministic (list order, map key order, closure
//! captures in key order). A `Bytes` node longer than the size threshold is
//! replaced by `Value::Buffer(n)` and becomes buffer `n`. Extraction stops after
//! `item_threshold` buffers; anything further stays inline.

use bytes::Bytes;

use crate::domain::{DispatchError, Value};

/// A value with its large payloads split out.
#[derive(Debug, Clone, PartialEq)]
pub struct Extracted {
    pub remainder: Value,
    pub buffers: Vec<Bytes>,
}

pub fn extract(value: &Value, size_threshold: usize, item_threshold: usize) -> Extracted {
    let mut buffers = Vec::new();
    let remainder = walk(value, size_threshold, item_threshold, &mut buffers);
    Extracted { remainder, buffers }
}

fn walk(value: &Value, size_threshold: usize, item_threshold: usize, out: &mut Vec<Bytes>) -> Value {
    match value {
        Value::Bytes(b) if b.len() > size_threshold && out.len() < item_threshold => {
            // Bytes の clone は参照カウントのみ
            out.push(b.clone());
            Value::Buffer(out.len() - 1)
        }
        Value::List(items) => Value::List(
            items
                .iter()
                .map(|v| walk(v, size_threshold, item_threshold, out))
                .collect(),
        ),
        Value::Map(map) => Value::Map(
            map.iter()
                .map(|(k, v)| (k.clone(), walk(v, size_threshold, item_threshold, out)))
                .collect(),
        ),
        Value::Closure(c) => {
            let mut c = c.clone();
            for v in c.captured.values_mut() {
                *v = walk(v, size_threshold, item_threshold, out);
            }
            Value::Closure(c)
        }
        other => other.clone(),
    }
}

/// Number of buffer placeholders in `value`.
pub fn placeholder_count(value: &Value) -> usize {
    match value {
        Value::Buffer(_) => 1,
        Value::List(items) => items.iter().map(placeholder_count).sum(),
        Value::Map(map) => map.values().map(placeholder_count).sum(),
        Value::Closure(c) => c.captured.values().map(placeholder_count).sum(),
        _ => 0,
    }
}

/// Put buffers back where their placeholders are.
///
/// Every placeholder must refer to an existing buffer.
pub fn restore(remainder: Value, buffers: &[Bytes]) -> Result<Value, DispatchError> {
    match remainder {
        Value::Buffer(n) => buffers
            .get(n)
            .cloned()
            .map(Value::Bytes)
            .ok_or_else(|| {
                DispatchError::Malformed(format!(
                    "placeholder {n} has no buffer ({} attached)",
                    buffers.len()
                ))
            }),
        Value::List(items) => items
            .into_iter()
            .map(|v| restore(v, buffers))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::List),
        Value::Map(map) => map
            .into_iter()
            .map(|(k, v)| restore(v, buffers).map(|v| (k, v)))
            .collect::<Result<_, _>>()
            .map(Value::Map),
        Value::Closure(mut c) => {
            for v in c.captured.values_mut() {
                let taken = std::mem::replace(v, Value::None);
                *v = restore(taken, buffers)?;
            }
            Ok(Value::Closure(c))
        }
        other => Ok(other),
    }
}
