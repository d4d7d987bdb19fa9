//! Domain model (ids, values, task state, errors).

pub mod errors;
pub mod ids;
pub mod state;
pub mod value;

pub use self::errors::{DispatchError, RemoteError, SerializationError};
pub use self::ids::{ControlId, TaskId, WorkerId};
pub use self::state::TaskState;
pub use self::value::{Closure, FunctionRef, ResourceHandle, ResourceKind, Value};
