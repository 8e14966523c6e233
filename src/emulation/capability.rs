//! Runtime side of the builder / awaiter protocol.
//!
//! The lowered `MoveNext` only ever talks to these traits; the framework builders and
//! awaiters below are one implementation, and [`crate::emulation::Runtime::register_builder`]
//! installs others.

use std::{fmt, sync::Arc};

use crate::{
    emulation::{
        runtime::{MachineRef, Runtime},
        task::Continuation,
        value::{ExceptionRef, Outcome, TaskRef, Value},
    },
    Error, Result,
};

/// The awaiter pattern: `IsCompleted`, `OnCompleted` and `GetResult`.
pub trait AwaiterCapability: Send + Sync + fmt::Debug {
    /// Returns true if `GetResult` may be called without suspending.
    ///
    /// # Errors
    ///
    /// Returns an error if the awaiter's state cannot be read.
    fn is_completed(&self) -> Result<bool>;

    /// Arranges for `continuation` to be scheduled once the awaited operation completes.
    ///
    /// # Errors
    ///
    /// Returns an error if the continuation cannot be registered.
    fn on_completed(&self, runtime: &Runtime, continuation: Continuation) -> Result<()>;

    /// The result of the completed operation, or the exception it completed with.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidProgram`] when called before completion.
    fn get_result(&self) -> Result<Outcome>;
}

/// A type with a `GetAwaiter` method.
pub trait Awaitable: Send + Sync + fmt::Debug {
    /// Creates the awaiter.
    fn get_awaiter(&self) -> Arc<dyn AwaiterCapability>;
}

/// An async method builder instance, one per invocation.
pub trait BuilderCapability: Send + Sync + fmt::Debug {
    /// Runs the machine up to its first suspension.
    ///
    /// # Errors
    ///
    /// Propagates emulator errors raised by `MoveNext`.
    fn start(&self, runtime: &Runtime, machine: &MachineRef) -> Result<()> {
        runtime.move_next(machine)
    }

    /// Completes the method with `value`.
    ///
    /// # Errors
    ///
    /// Returns an error if the result cannot be published.
    fn set_result(&self, runtime: &Runtime, value: Value) -> Result<()>;

    /// Completes the method with `exception`.
    ///
    /// # Errors
    ///
    /// Returns an error if the exception cannot be published.
    fn set_exception(&self, runtime: &Runtime, exception: ExceptionRef) -> Result<()>;

    /// Schedules `machine` to resume when `awaiter` completes.
    ///
    /// # Errors
    ///
    /// Returns an error if the awaiter rejects the continuation.
    fn await_on_completed(
        &self,
        runtime: &Runtime,
        awaiter: Arc<dyn AwaiterCapability>,
        machine: &MachineRef,
    ) -> Result<()> {
        awaiter.on_completed(runtime, Continuation::Resume(Arc::clone(machine)))
    }

    /// The value handed to the caller of the async method.
    fn task(&self) -> Value;
}

/// Creates builder instances (`Create`).
pub trait BuilderFactory: Send + Sync {
    /// Creates a fresh builder.
    fn create(&self, runtime: &Runtime) -> Arc<dyn BuilderCapability>;
}

impl<F> BuilderFactory for F
where
    F: Fn(&Runtime) -> Arc<dyn BuilderCapability> + Send + Sync,
{
    fn create(&self, runtime: &Runtime) -> Arc<dyn BuilderCapability> {
        self(runtime)
    }
}

// ── Framework builders ───────────────────────────────────────────────

/// `AsyncTaskMethodBuilder` and `AsyncTaskMethodBuilder<T>`.
#[derive(Debug)]
pub struct TaskMethodBuilder {
    task: TaskRef,
}

impl TaskMethodBuilder {
    /// Creates a builder owning a fresh pending task.
    #[must_use]
    pub fn new(runtime: &Runtime) -> Self {
        Self {
            task: runtime.pending_task(),
        }
    }
}

impl BuilderCapability for TaskMethodBuilder {
    fn set_result(&self, runtime: &Runtime, value: Value) -> Result<()> {
        if !self.task.complete(runtime, value)? {
            return Err(Error::InvalidProgram("SetResult on a completed task".into()));
        }
        Ok(())
    }

    fn set_exception(&self, runtime: &Runtime, exception: ExceptionRef) -> Result<()> {
        if !self.task.fault(runtime, exception)? {
            return Err(Error::InvalidProgram("SetException on a completed task".into()));
        }
        Ok(())
    }

    fn task(&self) -> Value {
        Value::Task(Arc::clone(&self.task))
    }
}

/// `AsyncVoidMethodBuilder`: there is no task, so exceptions are reported as unhandled.
#[derive(Debug, Default)]
pub struct VoidMethodBuilder;

impl BuilderCapability for VoidMethodBuilder {
    fn set_result(&self, _runtime: &Runtime, _value: Value) -> Result<()> {
        Ok(())
    }

    fn set_exception(&self, runtime: &Runtime, exception: ExceptionRef) -> Result<()> {
        runtime.report_unhandled(exception)
    }

    fn task(&self) -> Value {
        Value::Null
    }
}

// ── Framework awaiters ───────────────────────────────────────────────

/// `TaskAwaiter` / `TaskAwaiter<T>`.
#[derive(Debug)]
pub struct TaskAwaiter {
    task: TaskRef,
}

impl TaskAwaiter {
    /// Creates an awaiter for `task`.
    #[must_use]
    pub fn new(task: TaskRef) -> Self {
        Self { task }
    }
}

impl AwaiterCapability for TaskAwaiter {
    fn is_completed(&self) -> Result<bool> {
        self.task.is_completed()
    }

    fn on_completed(&self, runtime: &Runtime, continuation: Continuation) -> Result<()> {
        self.task.on_completed(runtime, continuation)
    }

    fn get_result(&self) -> Result<Outcome> {
        self.task
            .outcome()?
            .ok_or_else(|| Error::InvalidProgram("GetResult on a pending task".into()))
    }
}

/// `Task.Yield()`: never completed, resumes on the next scheduler turn.
#[derive(Debug, Default)]
pub struct YieldAwaitable;

impl Awaitable for YieldAwaitable {
    fn get_awaiter(&self) -> Arc<dyn AwaiterCapability> {
        Arc::new(YieldAwaiter)
    }
}

/// Awaiter of [`YieldAwaitable`].
#[derive(Debug, Default)]
pub struct YieldAwaiter;

impl AwaiterCapability for YieldAwaiter {
    fn is_completed(&self) -> Result<bool> {
        Ok(false)
    }

    fn on_completed(&self, runtime: &Runtime, continuation: Continuation) -> Result<()> {
        runtime.schedule(continuation)
    }

    fn get_result(&self) -> Result<Outcome> {
        Ok(Outcome::Return(Value::Null))
    }
}
