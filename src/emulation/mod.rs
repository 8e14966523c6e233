//! Emulator for lowered state machines.
//!
//! This module executes the `MoveNext` bodies produced by [`crate::compiler::Lowerer`]
//! on a single-threaded, deterministic runtime. It exists to observe lowered code the way
//! the CLR would run it: which states are visited, which finallys run, which exceptions
//! reach the builder.
//!
//! # Architecture
//!
//! - Runtime values, exceptions and tasks
//! - Builder and awaiter capabilities the lowered code talks to
//! - The interpreter running one `MoveNext` invocation
//! - The runtime owning the work queue, the virtual clock and the host functions
//!
//! # Key Components
//!
//! - [`crate::emulation::Runtime`] - Registers machines, invokes them and drains the queue
//! - [`crate::emulation::MachineInstance`] - Field storage and state trace of one invocation
//! - [`crate::emulation::Value`] - Runtime value representation
//! - [`crate::emulation::BuilderCapability`] / [`crate::emulation::AwaiterCapability`] -
//!   Protocol seams for custom builders and awaiters
//! - [`crate::emulation::TaskObject`] - Completion cell with continuations
//!
//! # Scheduling
//!
//! Continuations never run inline. Completing a task queues its continuations and
//! [`crate::emulation::Runtime::run_until_idle`] drains the queue in FIFO order. Timers
//! created by `Task.Delay` fire on a virtual clock once the queue is empty, earliest due
//! time first.
//!
//! # Usage Examples
//!
//! ```rust
//! use asyncscope::prelude::*;
//!
//! let mut method = MethodBuilder::new("Answer", ReturnShape::TaskOf(TypeRef::Int32));
//! method.push(Stmt::Return(Some(Expr::int(42))));
//! let machine = Lowerer::new(LoweringConfig::release()).lower(&method.build())?;
//!
//! let runtime = Runtime::new(EmulationConfig::default());
//! runtime.register_machine(machine);
//! let task = runtime.invoke("Answer", &[])?;
//! assert!(matches!(runtime.wait(&task)?, Outcome::Return(Value::Int(42))));
//! # Ok::<(), asyncscope::Error>(())
//! ```

mod capability;
mod exception;
mod interpreter;
mod runtime;
mod task;
mod value;

pub use capability::{
    Awaitable, AwaiterCapability, BuilderCapability, BuilderFactory, TaskAwaiter,
    TaskMethodBuilder, VoidMethodBuilder, YieldAwaitable, YieldAwaiter,
};
pub use exception::{ExceptionObject, TypeHierarchy, SYSTEM_EXCEPTION};
pub use runtime::{HostFunction, MachineInstance, MachineRef, Runtime, RuntimeStats};
pub use task::{Continuation, TaskObject, TaskStatus};
pub use value::{ExceptionRef, Outcome, TaskRef, Value};
