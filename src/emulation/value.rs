//! Runtime values of the emulator.

use std::{fmt, sync::Arc};

use crate::{
    emulation::{
        capability::{Awaitable, AwaiterCapability},
        exception::ExceptionObject,
        task::TaskObject,
    },
    syntax::TypeRef,
    Error, Result,
};

/// Shared reference to an exception object.
pub type ExceptionRef = Arc<ExceptionObject>;

/// Shared reference to a task.
pub type TaskRef = Arc<TaskObject>;

/// A value on the evaluation stack, in a local or in a machine field.
///
/// Booleans are integers, as on the CIL evaluation stack. Reference values compare by
/// identity except strings, which compare by content.
#[derive(Clone)]
pub enum Value {
    /// The null reference; also the default of reference-typed slots.
    Null,
    /// A 32-bit integer or boolean.
    Int(i32),
    /// An immutable string.
    Str(Arc<str>),
    /// An exception object.
    Exception(ExceptionRef),
    /// A task.
    Task(TaskRef),
    /// A custom awaitable, e.g. the result of `Task.Yield()`.
    Awaitable(Arc<dyn Awaitable>),
    /// An awaiter obtained from `GetAwaiter`.
    Awaiter(Arc<dyn AwaiterCapability>),
}

impl Value {
    /// Creates a string value.
    #[must_use]
    pub fn string(value: impl AsRef<str>) -> Self {
        Value::Str(Arc::from(value.as_ref()))
    }

    /// Creates a boolean value.
    #[must_use]
    pub fn bool(value: bool) -> Self {
        Value::Int(i32::from(value))
    }

    /// Default value of a slot of type `ty`.
    #[must_use]
    pub fn default_for(ty: &TypeRef) -> Self {
        if ty.is_integral() {
            Value::Int(0)
        } else {
            Value::Null
        }
    }

    /// Returns true for [`Value::Null`].
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// The integer held by this value.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TypeMismatch`] for non-integer values.
    pub fn as_int(&self) -> Result<i32> {
        match self {
            Value::Int(value) => Ok(*value),
            other => Err(Error::TypeMismatch(format!(
                "expected int32, found {}",
                other.kind()
            ))),
        }
    }

    /// CIL truthiness: non-zero integers and non-null references are true.
    #[must_use]
    pub fn is_true(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Int(value) => *value != 0,
            _ => true,
        }
    }

    /// The exception held by this value, if any.
    #[must_use]
    pub fn as_exception(&self) -> Option<&ExceptionRef> {
        match self {
            Value::Exception(ex) => Some(ex),
            _ => None,
        }
    }

    /// `ceq` semantics.
    #[must_use]
    pub fn equals(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Exception(a), Value::Exception(b)) => Arc::ptr_eq(a, b),
            (Value::Task(a), Value::Task(b)) => Arc::ptr_eq(a, b),
            (Value::Awaitable(a), Value::Awaitable(b)) => Arc::ptr_eq(a, b),
            (Value::Awaiter(a), Value::Awaiter(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Short name of the value's kind, for diagnostics.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Int(_) => "int32",
            Value::Str(_) => "string",
            Value::Exception(_) => "exception",
            Value::Task(_) => "task",
            Value::Awaitable(_) => "awaitable",
            Value::Awaiter(_) => "awaiter",
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Int(value) => write!(f, "{value}"),
            Value::Str(value) => write!(f, "{value:?}"),
            Value::Exception(ex) => write!(f, "{}({:?})", ex.class, ex.message),
            Value::Task(task) => write!(f, "Task#{}", task.id()),
            Value::Awaitable(awaitable) => write!(f, "{awaitable:?}"),
            Value::Awaiter(awaiter) => write!(f, "{awaiter:?}"),
        }
    }
}

/// `Object.ToString()` rendering, used by the console host functions.
impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => Ok(()),
            Value::Int(value) => write!(f, "{value}"),
            Value::Str(value) => f.write_str(value),
            Value::Exception(ex) => write!(f, "{}: {}", ex.class, ex.message),
            Value::Task(_) => f.write_str("System.Threading.Tasks.Task"),
            Value::Awaitable(_) | Value::Awaiter(_) => f.write_str(self.kind()),
        }
    }
}

/// How a call or an awaited operation finished.
#[derive(Debug, Clone)]
pub enum Outcome {
    /// Completed with a value ([`Value::Null`] for void).
    Return(Value),
    /// Threw a value, normally an exception.
    Throw(Value),
}

impl Outcome {
    /// The returned value, or `None` if the operation threw.
    #[must_use]
    pub fn value(&self) -> Option<&Value> {
        match self {
            Outcome::Return(value) => Some(value),
            Outcome::Throw(_) => None,
        }
    }

    /// The thrown exception, if the operation threw one.
    #[must_use]
    pub fn exception(&self) -> Option<&ExceptionRef> {
        match self {
            Outcome::Throw(value) => value.as_exception(),
            Outcome::Return(_) => None,
        }
    }
}
