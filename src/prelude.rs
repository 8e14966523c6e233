//! # asyncscope Prelude
//!
//! This module re-exports the types needed to describe an async method, lower it and run
//! the result. Import it with `use asyncscope::prelude::*;`.

// ================================================================================================
// Core Types and Error Handling
// ================================================================================================

/// The main error type for all asyncscope operations
pub use crate::Error;

/// The result type used throughout asyncscope
pub use crate::Result;

// ================================================================================================
// Source Model
// ================================================================================================

/// Async method descriptors and their builder
pub use crate::syntax::{AsyncMethodDescriptor, MethodBuilder, Parameter, Receiver};

/// Statements, expressions and types
pub use crate::syntax::{
    BinaryOp, Block, CatchClause, Expr, LocalId, LocalKind, Place, ReturnShape, Stmt, TryStmt,
    TypeRef, UnaryOp,
};

// ================================================================================================
// Lowering
// ================================================================================================

/// Lowering entry point and its result
pub use crate::compiler::{Lowerer, MachineShape, StateMachine, SuspensionPoint};

/// State-machine layout
pub use crate::compiler::{FieldKind, Representation, StateMachineLayout};

/// Lowering diagnostics
pub use crate::compiler::{EventKind, EventLog};

/// Builder and awaiter capabilities
pub use crate::capabilities::{
    AwaitableDescriptor, AwaiterMember, BuilderDescriptor, BuilderMember, CapabilityRegistry,
};

/// Emitted code
pub use crate::assembly::{ExceptionClause, Instruction, MethodBody};

// ================================================================================================
// Configuration
// ================================================================================================

/// Lowering and emulation options
pub use crate::config::{EmulationConfig, LoweringConfig, OptimizationLevel};

// ================================================================================================
// Emulation
// ================================================================================================

/// Runtime and values
pub use crate::emulation::{
    ExceptionRef, MachineInstance, MachineRef, Outcome, Runtime, RuntimeStats, TaskRef, Value,
};

/// Capability traits for custom builders and awaiters
pub use crate::emulation::{
    Awaitable, AwaiterCapability, BuilderCapability, BuilderFactory, Continuation,
    ExceptionObject, TaskMethodBuilder,
};
