//! Emitted IL: instructions, the exception-clause table and the assembler.
//!
//! This module is the back end of the lowering pipeline. Code generation drives an
//! [`InstructionAssembler`], which produces a [`MethodBody`] whose clause table follows the
//! ECMA-335 rules (II.19): protected blocks and handlers are disjoint or nested, clauses are
//! ordered innermost-first, and a `try/catch/finally` is two nested clauses.
//!
//! # Key Components
//!
//! - [`Instruction`] - Stack-machine instruction set with symbolic field and label operands
//! - [`InstructionAssembler`] - Label fixups, stack tracking and region bracketing
//! - [`ExceptionClause`] / [`ExceptionHandlerFlags`] - The clause table
//! - [`MethodBody`] - Finished body with an ILDasm-like listing

mod body;
mod encoder;
mod exceptions;
mod instruction;

pub use body::MethodBody;
pub use encoder::{InstructionAssembler, LocalSlot};
pub use exceptions::{ExceptionClause, ExceptionHandlerFlags};
pub use instruction::{FieldId, FlowType, Instruction, Label, ListingContext};
