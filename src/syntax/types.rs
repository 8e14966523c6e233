//! Type references used by the source model and the emitted IL.

use std::fmt;

/// A reference to a type as far as lowering is concerned.
///
/// The lowering never needs full type information; it only needs to know whether a slot
/// holds a reference (and must be cleared with null), which awaiter pattern applies to an
/// awaited expression, and how to name things in listings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TypeRef {
    /// No value.
    Void,
    /// `int`
    Int32,
    /// `bool`
    Bool,
    /// `string`
    String,
    /// `object`
    Object,
    /// A reference class, e.g. `System.InvalidOperationException`.
    Class(String),
    /// `System.Threading.Tasks.Task`
    Task,
    /// `System.Threading.Tasks.Task<T>`
    TaskOf(Box<TypeRef>),
    /// A custom awaitable or task-like type resolved through the capability registry.
    Named(String),
    /// An awaiter value type, e.g. `TaskAwaiter<int>`.
    Awaiter(String),
}

impl TypeRef {
    /// `System.Exception`
    #[must_use]
    pub fn exception() -> Self {
        TypeRef::Class("System.Exception".to_string())
    }

    /// Creates a class reference.
    #[must_use]
    pub fn class(name: impl Into<String>) -> Self {
        TypeRef::Class(name.into())
    }

    /// Creates a named (registry resolved) type reference.
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        TypeRef::Named(name.into())
    }

    /// Creates `Task<T>`.
    #[must_use]
    pub fn task_of(inner: TypeRef) -> Self {
        TypeRef::TaskOf(Box::new(inner))
    }

    /// The awaitable returned by `Task.Yield()`.
    #[must_use]
    pub fn yield_awaitable() -> Self {
        TypeRef::Named(crate::capabilities::YIELD_AWAITABLE.to_string())
    }

    /// Returns true for types whose slots hold object references.
    ///
    /// Awaiters are value types; clearing them resets the struct to its default.
    #[must_use]
    pub fn is_reference(&self) -> bool {
        matches!(
            self,
            TypeRef::String
                | TypeRef::Object
                | TypeRef::Class(_)
                | TypeRef::Task
                | TypeRef::TaskOf(_)
                | TypeRef::Named(_)
        )
    }

    /// Returns true for `void`.
    #[must_use]
    pub fn is_void(&self) -> bool {
        matches!(self, TypeRef::Void)
    }

    /// Returns true for the integral primitives that default to zero.
    #[must_use]
    pub fn is_integral(&self) -> bool {
        matches!(self, TypeRef::Int32 | TypeRef::Bool)
    }
}

impl fmt::Display for TypeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeRef::Void => f.write_str("void"),
            TypeRef::Int32 => f.write_str("int32"),
            TypeRef::Bool => f.write_str("bool"),
            TypeRef::String => f.write_str("string"),
            TypeRef::Object => f.write_str("object"),
            TypeRef::Class(name) | TypeRef::Named(name) | TypeRef::Awaiter(name) => {
                f.write_str(name)
            }
            TypeRef::Task => f.write_str("System.Threading.Tasks.Task"),
            TypeRef::TaskOf(inner) => write!(f, "System.Threading.Tasks.Task<{inner}>"),
        }
    }
}

/// What an async method returns, which selects its builder.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ReturnShape {
    /// `async void`: fire and forget.
    Void,
    /// `async Task`
    Task,
    /// `async Task<T>`
    TaskOf(TypeRef),
    /// A task-like return type with an explicitly chosen builder.
    TaskLike {
        /// The declared return type.
        task: TypeRef,
        /// Name of the builder registered in the capability registry.
        builder: String,
        /// Type of the value passed to `SetResult`, or `Void`.
        result: TypeRef,
    },
}

impl ReturnShape {
    /// Type of the value produced by `return expr;`, `Void` when there is none.
    #[must_use]
    pub fn result_type(&self) -> TypeRef {
        match self {
            ReturnShape::Void | ReturnShape::Task => TypeRef::Void,
            ReturnShape::TaskOf(ty) => ty.clone(),
            ReturnShape::TaskLike { result, .. } => result.clone(),
        }
    }

    /// The declared return type of the kickoff method.
    #[must_use]
    pub fn declared_type(&self) -> TypeRef {
        match self {
            ReturnShape::Void => TypeRef::Void,
            ReturnShape::Task => TypeRef::Task,
            ReturnShape::TaskOf(ty) => TypeRef::task_of(ty.clone()),
            ReturnShape::TaskLike { task, .. } => task.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_classification() {
        assert!(TypeRef::String.is_reference());
        assert!(TypeRef::exception().is_reference());
        assert!(TypeRef::task_of(TypeRef::Int32).is_reference());
        assert!(!TypeRef::Int32.is_reference());
        assert!(!TypeRef::Awaiter("TaskAwaiter".into()).is_reference());
    }

    #[test]
    fn test_display() {
        assert_eq!(
            TypeRef::task_of(TypeRef::Int32).to_string(),
            "System.Threading.Tasks.Task<int32>"
        );
        assert_eq!(TypeRef::exception().to_string(), "System.Exception");
    }

    #[test]
    fn test_result_type() {
        assert_eq!(ReturnShape::Task.result_type(), TypeRef::Void);
        assert_eq!(
            ReturnShape::TaskOf(TypeRef::String).result_type(),
            TypeRef::String
        );
        assert_eq!(
            ReturnShape::TaskOf(TypeRef::Int32).declared_type(),
            TypeRef::task_of(TypeRef::Int32)
        );
    }
}
