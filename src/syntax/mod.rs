//! Source model of async methods.
//!
//! An async method is described by an [`AsyncMethodDescriptor`]: a return shape selecting
//! the builder, parameters, an optional receiver, a locals table and a structured body.
//! Descriptors are created with [`MethodBuilder`]; there is no textual front end.
//!
//! # Key Components
//!
//! - [`TypeRef`] / [`ReturnShape`] - The little type information lowering needs
//! - [`Stmt`] / [`Expr`] - Statement and expression trees
//! - [`MethodBuilder`] - Fluent construction of descriptors

mod ast;
mod method;
mod types;

pub use ast::{
    BinaryOp, Block, CatchClause, Expr, LocalDecl, LocalId, LocalKind, Place, Stmt, TryStmt,
    UnaryOp,
};
pub use method::{AsyncMethodDescriptor, MethodBuilder, Parameter, Receiver};
pub use types::{ReturnShape, TypeRef};
