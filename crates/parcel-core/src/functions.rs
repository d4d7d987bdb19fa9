//! FunctionRegistry - engine 側で呼び出せる関数の登録
//!
//! コードはネットワークを渡りません。`Value::Function` / `Value::Closure` は
//! 名前だけを運び、engine はその名前でここから関数を引きます。
//!
//! 同じ registry を使えばローカルでも同じ呼び出しができます（[`FunctionRegistry::call`]）。

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::domain::{RemoteError, Value, WorkerId};

/// A function callable by name on an engine.
pub type RemoteFn = dyn Fn(&Invocation) -> Result<Value, RemoteError> + Send + Sync;

/// Everything a function sees when it is called.
#[derive(Debug, Clone, Default)]
pub struct Invocation {
    pub args: Vec<Value>,
    pub kwargs: BTreeMap<String, Value>,
    /// Environment captured by a closure; empty for plain functions.
    pub captured: BTreeMap<String, Value>,
    /// The engine running the call, `None` when called locally.
    pub worker: Option<WorkerId>,
}

impl Invocation {
    pub fn arg(&self, index: usize) -> Result<&Value, RemoteError> {
        self.args
            .get(index)
            .ok_or_else(|| RemoteError::type_error(format!("missing positional argument {index}")))
    }

    pub fn int_arg(&self, index: usize) -> Result<i64, RemoteError> {
        let value = self.arg(index)?;
        value.as_int().ok_or_else(|| {
            RemoteError::type_error(format!(
                "argument {index} must be int, got {}",
                value.type_name()
            ))
        })
    }

    pub fn kwarg(&self, name: &str) -> Option<&Value> {
        self.kwargs.get(name)
    }

    pub fn captured(&self, name: &str) -> Result<&Value, RemoteError> {
        self.captured
            .get(name)
            .ok_or_else(|| RemoteError::name_error(format!("`{name}` is not captured")))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FunctionError {
    #[error("function '{0}' is already registered")]
    AlreadyRegistered(String),
}

#[derive(Default, Clone)]
pub struct FunctionRegistry {
    functions: HashMap<String, Arc<RemoteFn>>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, name: impl Into<String>, f: F) -> Result<(), FunctionError>
    where
        F: Fn(&Invocation) -> Result<Value, RemoteError> + Send + Sync + 'static,
    {
        let name = name.into();
        if self.functions.contains_key(&name) {
            return Err(FunctionError::AlreadyRegistered(name));
        }
        self.functions.insert(name, Arc::new(f));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<RemoteFn>> {
        self.functions.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    pub fn registered_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.functions.keys().cloned().collect();
        names.sort();
        names
    }

    /// Resolve `callable` and run it with the given arguments.
    pub fn call(
        &self,
        callable: &Value,
        args: Vec<Value>,
        kwargs: BTreeMap<String, Value>,
        worker: Option<WorkerId>,
    ) -> Result<Value, RemoteError> {
        let (name, captured) = match callable {
            Value::Function(f) => (f.name.as_str(), BTreeMap::new()),
            Value::Closure(c) => (c.function.as_str(), c.captured.clone()),
            other => {
                return Err(RemoteError::type_error(format!(
                    "object of type `{}` is not callable",
                    other.type_name()
                )));
            }
        };

        let f = self
            .get(name)
            .ok_or_else(|| RemoteError::name_error(format!("function `{name}` is not registered")))?;

        f(&Invocation {
            args,
            kwargs,
            captured,
            worker,
        })
    }
}

impl fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionRegistry")
            .field("functions", &self.registered_names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> FunctionRegistry {
        let mut functions = FunctionRegistry::new();
        functions
            .register("double", |inv| Ok(Value::Int(inv.int_arg(0)? * 2)))
            .unwrap();
        functions
            .register("add_offset", |inv| {
                let offset = inv.captured("offset")?.as_int().unwrap_or(0);
                Ok(Value::Int(inv.int_arg(0)? + offset))
            })
            .unwrap();
        functions
    }

    #[test]
    fn calls_registered_function() {
        let out = registry()
            .call(&Value::function("double"), vec![Value::Int(21)], BTreeMap::new(), None)
            .unwrap();
        assert_eq!(out, Value::Int(42));
    }

    #[test]
    fn closure_sees_captured_environment() {
        let closure = Value::closure("add_offset", [("offset", Value::Int(10))]);
        let out = registry()
            .call(&closure, vec![Value::Int(5)], BTreeMap::new(), None)
            .unwrap();
        assert_eq!(out, Value::Int(15));
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut functions = registry();
        let err = functions
            .register("double", |_| Ok(Value::None))
            .unwrap_err();
        assert_eq!(err, FunctionError::AlreadyRegistered("double".to_string()));
    }

    #[test]
    fn unknown_function_is_a_name_error() {
        let err = registry()
            .call(&Value::function("nope"), vec![], BTreeMap::new(), None)
            .unwrap_err();
        assert_eq!(err.ename, "NameError");
    }

    #[test]
    fn wrong_argument_type_is_a_type_error() {
        let err = registry()
            .call(&Value::function("double"), vec![Value::from("x")], BTreeMap::new(), None)
            .unwrap_err();
        assert_eq!(err.ename, "TypeError");
    }

    #[test]
    fn registered_names_are_sorted() {
        assert_eq!(registry().registered_names(), vec!["add_offset", "double"]);
    }
}
