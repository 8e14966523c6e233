//! Pass scheduler for the lowering pipeline.
//!
//! Unlike an optimizing pipeline, lowering runs every pass exactly once: each stage
//! consumes the output of the previous one, so there is no fixpoint to reach.

use std::time::Instant;

use crate::{
    compiler::{
        context::LoweringContext,
        events::EventKind,
        pass::LoweringPass,
        passes::{FieldReusePass, RegionPass, SuspensionPass, SynthesizePass},
    },
    Result,
};

/// Runs lowering passes in order.
pub struct PassScheduler {
    /// Passes in execution order.
    passes: Vec<Box<dyn LoweringPass>>,
}

impl Default for PassScheduler {
    fn default() -> Self {
        Self::new(vec![
            Box::new(SynthesizePass),
            Box::new(RegionPass),
            Box::new(SuspensionPass),
            Box::new(FieldReusePass),
        ])
    }
}

impl PassScheduler {
    /// Creates a scheduler running `passes` in the given order.
    ///
    /// # Arguments
    ///
    /// * `passes` - The passes, first to last.
    ///
    /// # Returns
    ///
    /// A new `PassScheduler`.
    #[must_use]
    pub fn new(passes: Vec<Box<dyn LoweringPass>>) -> Self {
        Self { passes }
    }

    /// Names of the scheduled passes, in order.
    #[must_use]
    pub fn pass_names(&self) -> Vec<&'static str> {
        self.passes.iter().map(|p| p.name()).collect()
    }

    /// Runs every pass on the method held by `ctx`.
    ///
    /// # Arguments
    ///
    /// * `ctx` - The lowering context.
    ///
    /// # Errors
    ///
    /// Returns the error of the first failing pass; later passes do not run.
    pub fn run(&self, ctx: &mut LoweringContext<'_>) -> Result<()> {
        for pass in &self.passes {
            if !pass.should_run(ctx) {
                continue;
            }

            ctx.record(EventKind::PassStarted)
                .pass(pass.name())
                .message(format!("starting pass: {}", pass.name()));
            let started = Instant::now();

            if let Err(error) = pass.run(ctx) {
                ctx.record(EventKind::Error)
                    .pass(pass.name())
                    .message(format!("{} failed: {error}", pass.name()));
                return Err(error);
            }

            ctx.record(EventKind::PassCompleted)
                .pass(pass.name())
                .message(format!(
                    "{} completed in {:?}",
                    pass.name(),
                    started.elapsed()
                ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        capabilities::CapabilityRegistry,
        config::LoweringConfig,
        syntax::{MethodBuilder, ReturnShape},
    };

    struct Failing;

    impl LoweringPass for Failing {
        fn name(&self) -> &'static str {
            "failing"
        }

        fn run(&self, _ctx: &mut LoweringContext<'_>) -> Result<()> {
            Err(malformed_error!("always fails"))
        }
    }

    struct Marker;

    impl LoweringPass for Marker {
        fn name(&self) -> &'static str {
            "marker"
        }

        fn run(&self, ctx: &mut LoweringContext<'_>) -> Result<()> {
            ctx.events.info("marker ran");
            Ok(())
        }
    }

    #[test]
    fn test_default_order() {
        let scheduler = PassScheduler::default();
        assert_eq!(
            scheduler.pass_names(),
            vec!["synthesize", "regions", "suspension", "field-reuse"]
        );
    }

    #[test]
    fn test_aborts_on_first_error() {
        let method = MethodBuilder::new("F", ReturnShape::Task).build();
        let config = LoweringConfig::release();
        let registry = CapabilityRegistry::new();
        let mut ctx = LoweringContext::new(&method, &config, &registry);

        let scheduler = PassScheduler::new(vec![Box::new(Failing), Box::new(Marker)]);
        assert!(scheduler.run(&mut ctx).is_err());
        assert_eq!(ctx.events.count_kind(EventKind::PassStarted), 1);
        assert_eq!(ctx.events.count_kind(EventKind::Error), 1);
        assert_eq!(ctx.events.count_kind(EventKind::Info), 0);
    }
}
