//! Configuration for the lowering pipeline and the state-machine emulator.
//!
//! [`LoweringConfig`] controls code generation decisions that depend on the build flavour
//! (state-machine representation, hoisting policy, field reuse). [`EmulationConfig`] bounds
//! the work the emulator is allowed to do when executing emitted `MoveNext` bodies.

use strum::{Display, EnumString};

/// Optimization level of the compilation that requested the lowering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Display, EnumString)]
pub enum OptimizationLevel {
    /// Debuggable code: every user local is hoisted and the machine is a class.
    Debug,
    /// Optimized code: only live-across locals are hoisted and the machine is a struct.
    #[default]
    Release,
}

/// Configuration for the lowering pipeline.
#[derive(Debug, Clone)]
pub struct LoweringConfig {
    /// Optimization level (default: Release).
    pub optimization: OptimizationLevel,

    /// Edit-and-continue support. Forces the class representation and disables slot reuse
    /// for hoisted user locals so that fields keep a stable identity across edits.
    pub edit_and_continue: bool,

    /// Let hoisted locals, spill temps and wrap slots with disjoint lifetimes share a field.
    /// Awaiter slots of the same type are always shared regardless of this flag.
    pub enable_field_reuse: bool,

    /// Null out reference-typed fields at the end of their lifetime so the machine does not
    /// keep objects reachable.
    pub clear_reference_slots: bool,

    /// Hoist every user local, live across a suspension point or not.
    pub hoist_all_user_locals: bool,

    /// Upper bound on suspension points per method (default: 4096).
    pub max_states: u32,
}

impl Default for LoweringConfig {
    fn default() -> Self {
        Self::release()
    }
}

impl LoweringConfig {
    /// Creates the Release configuration.
    #[must_use]
    pub fn release() -> Self {
        Self {
            optimization: OptimizationLevel::Release,
            edit_and_continue: false,
            enable_field_reuse: true,
            clear_reference_slots: true,
            hoist_all_user_locals: false,
            max_states: 4096,
        }
    }

    /// Creates the Debug configuration.
    #[must_use]
    pub fn debug() -> Self {
        Self {
            optimization: OptimizationLevel::Debug,
            edit_and_continue: false,
            enable_field_reuse: false,
            clear_reference_slots: true,
            hoist_all_user_locals: true,
            max_states: 4096,
        }
    }

    /// Enables or disables edit-and-continue.
    #[must_use]
    pub fn with_edit_and_continue(mut self, enabled: bool) -> Self {
        self.edit_and_continue = enabled;
        if enabled {
            self.enable_field_reuse = false;
        }
        self
    }

    /// Enables or disables field reuse.
    #[must_use]
    pub fn with_field_reuse(mut self, enabled: bool) -> Self {
        self.enable_field_reuse = enabled;
        self
    }

    /// Enables or disables clearing of reference-typed slots.
    #[must_use]
    pub fn with_slot_clearing(mut self, enabled: bool) -> Self {
        self.clear_reference_slots = enabled;
        self
    }

    /// Sets the suspension point limit.
    #[must_use]
    pub fn with_max_states(mut self, max_states: u32) -> Self {
        self.max_states = max_states;
        self
    }

    /// Returns true if the state machine must be emitted as a class.
    #[must_use]
    pub fn requires_class(&self) -> bool {
        self.optimization == OptimizationLevel::Debug || self.edit_and_continue
    }
}

/// Configuration for the emulator.
#[derive(Debug, Clone)]
pub struct EmulationConfig {
    /// Maximum instructions executed by a single `MoveNext` invocation.
    pub max_instructions: u64,

    /// Maximum work items processed by one `run_until_idle` call.
    pub max_scheduler_steps: u64,
}

impl Default for EmulationConfig {
    fn default() -> Self {
        Self {
            max_instructions: 1_000_000,
            max_scheduler_steps: 100_000,
        }
    }
}

impl EmulationConfig {
    /// Sets the per-invocation instruction budget.
    #[must_use]
    pub fn with_max_instructions(mut self, max: u64) -> Self {
        self.max_instructions = max;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets() {
        let release = LoweringConfig::release();
        assert_eq!(release.optimization, OptimizationLevel::Release);
        assert!(release.enable_field_reuse);
        assert!(!release.hoist_all_user_locals);
        assert!(!release.requires_class());

        let debug = LoweringConfig::debug();
        assert!(debug.hoist_all_user_locals);
        assert!(debug.requires_class());
    }

    #[test]
    fn test_edit_and_continue_forces_class() {
        let config = LoweringConfig::release().with_edit_and_continue(true);
        assert!(config.requires_class());
        assert!(!config.enable_field_reuse);
    }

    #[test]
    fn test_optimization_level_parse() {
        assert_eq!(
            "Debug".parse::<OptimizationLevel>().ok(),
            Some(OptimizationLevel::Debug)
        );
        assert_eq!(OptimizationLevel::Release.to_string(), "Release");
    }
}
