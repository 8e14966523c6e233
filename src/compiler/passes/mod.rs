//! Built-in lowering passes.
//!
//! Every pass runs exactly once, in this order, on a [`LoweringContext`](crate::compiler::LoweringContext):
//!
//! | Pass | Description |
//! |------|-------------|
//! | [`SynthesizePass`] | Resolves the builder, normalizes awaits, numbers states and hoists live locals |
//! | [`RegionPass`] | Moves catch and finally handlers containing awaits out of their protected region |
//! | [`SuspensionPass`] | Emits `MoveNext` with the state dispatch and the suspend and resume sequences |
//! | [`FieldReusePass`] | Shares awaiter slots and folds fields with disjoint lifetimes |
//!
//! Each pass records what it changed in the context's
//! [`EventLog`](crate::compiler::EventLog).

mod codegen;
mod hoisting;
mod reuse;
mod spill;
mod synthesize;
mod wrap;

pub use codegen::SuspensionPass;
pub use reuse::FieldReusePass;
pub use synthesize::SynthesizePass;
pub use wrap::RegionPass;
