//! Lowering of async methods into resumable state machines.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                       Lowering Pipeline                          │
//! ├──────────────────────────────────────────────────────────────────┤
//! │                                                                  │
//! │  Lowerer                     Entry point, per-type cache,        │
//! │    └─ lower_all()             parallel lowering of methods       │
//! │                                                                  │
//! │  LoweringContext             Per-method working state            │
//! │    ├─ normalized body         (awaits as statements)             │
//! │    ├─ StateMachineLayout      (fields of the machine)            │
//! │    ├─ SuspensionPoints        (one per state)                    │
//! │    ├─ RegionTree              (source exception regions)         │
//! │    └─ EventLog                                                   │
//! │                                                                  │
//! │  PassScheduler               Runs each pass once, in order       │
//! │    ├─ synthesize              builder, spilling, hoisting        │
//! │    ├─ regions                 handlers with awaits moved out     │
//! │    ├─ suspension              MoveNext emission                  │
//! │    └─ field-reuse             slot sharing, compaction           │
//! │                                                                  │
//! │  StateMachine                The lowered result                  │
//! │                                                                  │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! State numbers follow evaluation order: the first await reached when executing the
//! method from the top is state 0. `-1` means running and `-2` finished.

mod context;
mod events;
mod layout;
mod machine;
mod pass;
mod passes;
mod regions;
mod scheduler;

pub use context::LoweringContext;
pub use events::{DerivedStats, Event, EventBuilder, EventCategory, EventKind, EventLog};
pub use layout::{
    Field, FieldKind, Lifetime, Representation, StateMachineLayout, BUILDER_FIELD, STATE_FIELD,
    THIS_FIELD,
};
pub use machine::{Lowerer, MachineShape, StateMachine, SuspensionPoint};
pub use pass::LoweringPass;
pub use passes::{FieldReusePass, RegionPass, SuspensionPass, SynthesizePass};
pub use regions::{ExceptionRegion, HandlerKind, RegionId, RegionPhase, RegionTree};
pub use scheduler::PassScheduler;
