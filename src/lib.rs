// Copyright 2025 Johann Kempter
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

#![doc(html_no_source)]
#![deny(missing_docs)]
#![allow(dead_code)]
#![allow(clippy::too_many_arguments)]

//! # asyncscope
//!
//! Lowering of `async` methods into resumable state machines, and an emulator to run them.
//!
//! An async method is described as a small statement tree ([`syntax`]). The [`compiler`]
//! rewrites it into a state machine: a type holding the state field, the method builder,
//! hoisted locals and awaiter slots, plus a single `MoveNext` body in a CIL-like stack
//! language ([`assembly`]) that dispatches on the state, suspends at every incomplete await
//! and resumes where it left off. Awaits inside `try`, `catch` and `finally` are supported:
//! protected regions are re-entered through nested dispatch, and catch and finally blocks
//! containing awaits are rewritten into plain code driven by stashed exceptions.
//!
//! The [`emulation`] module executes emitted bodies with the CLR's two-pass exception
//! semantics on a deterministic single-threaded scheduler, which is how the lowered code
//! is checked against the behaviour of the source method.
//!
//! ## Quick Start
//!
//! ```rust
//! use asyncscope::prelude::*;
//!
//! let mut m = MethodBuilder::new("Sum", ReturnShape::TaskOf(TypeRef::Int32));
//! let a = m.local("a", TypeRef::Int32);
//! m.push(Stmt::declare(a, Expr::await_(Expr::call(
//!     "Task.FromResult",
//!     vec![Expr::int(20)],
//!     TypeRef::task_of(TypeRef::Int32),
//! ))));
//! m.push(Stmt::Return(Some(Expr::add(Expr::local(a), Expr::int(22)))));
//!
//! let machine = Lowerer::new(LoweringConfig::release()).lower(&m.build())?;
//! println!("{}", machine.il_listing());
//!
//! let runtime = Runtime::new(EmulationConfig::default());
//! runtime.register_machine(machine);
//! let task = runtime.invoke("Sum", &[])?;
//! assert!(matches!(runtime.wait(&task)?, Outcome::Return(Value::Int(42))));
//! # Ok::<(), asyncscope::Error>(())
//! ```
//!
//! ## Architecture
//!
//! - [`syntax`] - Async method descriptors, statements and expressions
//! - [`capabilities`] - Builder and awaiter member sets, resolved per type
//! - [`compiler`] - The lowering passes and the resulting [`compiler::StateMachine`]
//! - [`assembly`] - Instructions, exception clauses and the assembler
//! - [`emulation`] - Runtime executing lowered machines
//! - [`config`] - Lowering and emulation options
//! - [`prelude`] - Convenient re-exports
//!
//! ## Error Handling
//!
//! All fallible operations return [`Result`]. Lowering rejects invalid methods with
//! [`Error::AwaitInFilter`], [`Error::MalformedRegion`] and friends; the emulator reports
//! limits and invalid programs, never user exceptions, which travel through tasks.
//!
//! ```rust
//! use asyncscope::{prelude::*, Error};
//!
//! let mut m = MethodBuilder::new("F", ReturnShape::Task);
//! m.push(Stmt::try_catch(
//!     vec![],
//!     vec![CatchClause::new(TypeRef::exception(), None, vec![])
//!         .when(Expr::await_(Expr::call("Check", vec![], TypeRef::task_of(TypeRef::Bool))))],
//! ));
//! let err = Lowerer::new(LoweringConfig::release()).lower(&m.build()).unwrap_err();
//! assert!(matches!(err, Error::AwaitInFilter));
//! ```

#[macro_use]
pub(crate) mod error;

pub mod assembly;
pub mod capabilities;
pub mod compiler;
pub mod config;
pub mod emulation;
pub mod prelude;
pub mod syntax;

/// `asyncscope` Result type
///
/// A type alias for [`std::result::Result<T, Error>`] where the error type is always [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// `asyncscope` Error type
///
/// The main error type for lowering and emulation.
pub use error::Error;
