//! Pass trait of the lowering pipeline.
//!
//! Every stage of lowering implements [`LoweringPass`]. Passes do not choose their own
//! order; the [`crate::compiler::PassScheduler`] runs them in the fixed sequence the
//! transformation depends on.

use crate::{compiler::context::LoweringContext, Result};

/// A stage of the async lowering pipeline.
///
/// All passes must be thread-safe (Send + Sync): a single pipeline is shared by every
/// method lowered in parallel. A pass keeps no per-method state of its own; everything it
/// produces goes into the [`LoweringContext`].
///
/// # Pipeline Integration
///
/// The scheduler runs the passes in this order:
///
/// 1. **Synthesize**: builder validation, await normalization, state numbering, hoisting
/// 2. **Regions**: exception-region tree and rewrite of handlers containing awaits
/// 3. **Suspension**: emission of `MoveNext` with dispatch and await sequences
/// 4. **Reuse**: folding of fields with disjoint lifetimes
pub trait LoweringPass: Send + Sync {
    /// Unique name for logging and debugging.
    fn name(&self) -> &'static str;

    /// Should this pass run on the method held by `ctx`?
    ///
    /// Called before [`LoweringPass::run`]. Override to skip work that cannot apply,
    /// e.g. region rewriting for a method without `try` statements.
    fn should_run(&self, _ctx: &LoweringContext<'_>) -> bool {
        true
    }

    /// Runs the pass.
    ///
    /// Events should be recorded directly to `ctx.events`.
    ///
    /// # Arguments
    ///
    /// * `ctx` - The lowering context of the method.
    ///
    /// # Errors
    ///
    /// Returns an error if the method cannot be lowered; lowering stops at the first one.
    fn run(&self, ctx: &mut LoweringContext<'_>) -> Result<()>;

    /// Get a description of what this pass does.
    fn description(&self) -> &'static str {
        "No description available"
    }
}
