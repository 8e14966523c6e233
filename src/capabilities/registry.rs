//! Resolution of builders and awaitables.
//!
//! The framework builders and awaitables are described once per process in a lazily
//! initialized table; user supplied ones are registered on a [`CapabilityRegistry`]
//! instance. Every descriptor handed out has been validated, so the lowering never works
//! with a partial capability set.

use std::sync::OnceLock;

use dashmap::DashMap;

use crate::{
    capabilities::{AwaitableDescriptor, BuilderDescriptor},
    syntax::{ReturnShape, TypeRef},
    Error, Result,
};

/// Builder of `async void` methods.
pub const VOID_BUILDER: &str = "System.Runtime.CompilerServices.AsyncVoidMethodBuilder";
/// Builder of `async Task` and, with a type argument, `async Task<T>` methods.
pub const TASK_BUILDER: &str = "System.Runtime.CompilerServices.AsyncTaskMethodBuilder";
/// Awaitable returned by `Task.Yield()`.
pub const YIELD_AWAITABLE: &str = "System.Runtime.CompilerServices.YieldAwaitable";
/// Awaiter of [`YIELD_AWAITABLE`].
pub const YIELD_AWAITER: &str = "System.Runtime.CompilerServices.YieldAwaitable+YieldAwaiter";
/// Awaiter of `Task`.
pub const TASK_AWAITER: &str = "System.Runtime.CompilerServices.TaskAwaiter";

/// Framework capabilities, shared by every registry.
struct WellKnown {
    void_builder: BuilderDescriptor,
    task_builder: BuilderDescriptor,
    task_awaitable: AwaitableDescriptor,
    yield_awaitable: AwaitableDescriptor,
}

fn well_known() -> &'static WellKnown {
    static WELL_KNOWN: OnceLock<WellKnown> = OnceLock::new();
    WELL_KNOWN.get_or_init(|| WellKnown {
        void_builder: BuilderDescriptor::complete(VOID_BUILDER, TypeRef::Void, TypeRef::Void),
        task_builder: BuilderDescriptor::complete(TASK_BUILDER, TypeRef::Task, TypeRef::Void),
        task_awaitable: AwaitableDescriptor::complete(
            TypeRef::Task,
            TypeRef::Awaiter(TASK_AWAITER.to_string()),
            TypeRef::Void,
        ),
        yield_awaitable: AwaitableDescriptor::complete(
            TypeRef::Named(YIELD_AWAITABLE.to_string()),
            TypeRef::Awaiter(YIELD_AWAITER.to_string()),
            TypeRef::Void,
        ),
    })
}

/// Name of the generic task builder instantiated for `result`.
#[must_use]
pub fn task_builder_name(result: &TypeRef) -> String {
    format!("{TASK_BUILDER}<{result}>")
}

/// Resolves the builder and awaiter capabilities used by lowering.
///
/// # Example
///
/// ```rust
/// use asyncscope::prelude::*;
///
/// let registry = CapabilityRegistry::new();
/// let builder = registry.resolve_builder(&ReturnShape::TaskOf(TypeRef::Int32))?;
/// assert!(builder.name.ends_with("AsyncTaskMethodBuilder<int32>"));
///
/// let awaitable = registry.resolve_awaitable(&TypeRef::task_of(TypeRef::Int32))?;
/// assert_eq!(awaitable.result, TypeRef::Int32);
/// # Ok::<(), asyncscope::Error>(())
/// ```
#[derive(Debug, Default)]
pub struct CapabilityRegistry {
    /// Custom builders by name
    builders: DashMap<String, BuilderDescriptor>,
    /// Custom awaitables by awaited type
    awaitables: DashMap<TypeRef, AwaitableDescriptor>,
}

impl CapabilityRegistry {
    /// Creates a registry knowing only the framework capabilities.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a custom builder, replacing one with the same name.
    pub fn register_builder(&self, descriptor: BuilderDescriptor) {
        self.builders.insert(descriptor.name.clone(), descriptor);
    }

    /// Registers a custom awaitable, replacing one for the same type.
    pub fn register_awaitable(&self, descriptor: AwaitableDescriptor) {
        self.awaitables
            .insert(descriptor.awaitable.clone(), descriptor);
    }

    /// Resolves and validates the builder for a return shape.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownBuilder`] for an unregistered custom builder and
    /// [`Error::MissingBuilderMember`] when the builder lacks a required member.
    pub fn resolve_builder(&self, shape: &ReturnShape) -> Result<BuilderDescriptor> {
        let descriptor = match shape {
            ReturnShape::Void => well_known().void_builder.clone(),
            ReturnShape::Task => well_known().task_builder.clone(),
            ReturnShape::TaskOf(result) => BuilderDescriptor {
                name: task_builder_name(result),
                task: TypeRef::task_of(result.clone()),
                result: result.clone(),
                members: well_known().task_builder.members.clone(),
            },
            ReturnShape::TaskLike { builder, .. } => self
                .builders
                .get(builder)
                .map(|entry| entry.value().clone())
                .ok_or_else(|| Error::UnknownBuilder(builder.clone()))?,
        };
        descriptor.validate()?;
        Ok(descriptor)
    }

    /// Resolves and validates the awaiter pattern of an awaited type.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownAwaitable`] for types that are not awaitable and
    /// [`Error::MissingAwaiterMember`] for an incomplete pattern.
    pub fn resolve_awaitable(&self, ty: &TypeRef) -> Result<AwaitableDescriptor> {
        let descriptor = match ty {
            TypeRef::Task => well_known().task_awaitable.clone(),
            TypeRef::TaskOf(result) => AwaitableDescriptor {
                awaitable: ty.clone(),
                awaiter: TypeRef::Awaiter(format!("{TASK_AWAITER}<{result}>")),
                result: (**result).clone(),
                members: well_known().task_awaitable.members.clone(),
            },
            TypeRef::Named(name) if name == YIELD_AWAITABLE => {
                well_known().yield_awaitable.clone()
            }
            _ => self
                .awaitables
                .get(ty)
                .map(|entry| entry.value().clone())
                .ok_or_else(|| Error::UnknownAwaitable(ty.to_string()))?,
        };
        descriptor.validate()?;
        Ok(descriptor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::{AwaiterMember, BuilderMember};

    #[test]
    fn test_well_known_builders() {
        let registry = CapabilityRegistry::new();
        assert_eq!(
            registry.resolve_builder(&ReturnShape::Void).unwrap().name,
            VOID_BUILDER
        );
        let task = registry.resolve_builder(&ReturnShape::Task).unwrap();
        assert_eq!(task.name, TASK_BUILDER);
        assert!(task.has(BuilderMember::AwaitUnsafeOnCompleted));
    }

    #[test]
    fn test_well_known_is_shared() {
        assert!(std::ptr::eq(well_known(), well_known()));
    }

    #[test]
    fn test_custom_builder() {
        let registry = CapabilityRegistry::new();
        let shape = ReturnShape::TaskLike {
            task: TypeRef::named("MyTask"),
            builder: "MyBuilder".to_string(),
            result: TypeRef::Int32,
        };
        assert!(matches!(
            registry.resolve_builder(&shape),
            Err(Error::UnknownBuilder(_))
        ));

        registry.register_builder(
            BuilderDescriptor::complete("MyBuilder", TypeRef::named("MyTask"), TypeRef::Int32)
                .without(BuilderMember::Start),
        );
        assert!(matches!(
            registry.resolve_builder(&shape),
            Err(Error::MissingBuilderMember { .. })
        ));

        registry.register_builder(BuilderDescriptor::complete(
            "MyBuilder",
            TypeRef::named("MyTask"),
            TypeRef::Int32,
        ));
        assert!(registry.resolve_builder(&shape).is_ok());
    }

    #[test]
    fn test_awaitables() {
        let registry = CapabilityRegistry::new();
        let yielded = registry
            .resolve_awaitable(&TypeRef::Named(YIELD_AWAITABLE.into()))
            .unwrap();
        assert_eq!(yielded.result, TypeRef::Void);

        assert!(matches!(
            registry.resolve_awaitable(&TypeRef::Int32),
            Err(Error::UnknownAwaitable(_))
        ));

        registry.register_awaitable(
            AwaitableDescriptor::complete(
                TypeRef::named("Custom"),
                TypeRef::Awaiter("Custom+Awaiter".into()),
                TypeRef::String,
            )
            .without(AwaiterMember::IsCompleted),
        );
        assert!(matches!(
            registry.resolve_awaitable(&TypeRef::named("Custom")),
            Err(Error::MissingAwaiterMember { .. })
        ));
    }
}
