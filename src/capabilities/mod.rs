//! The builder / awaiter capability protocol.
//!
//! Lowering talks to two external parties through fixed member sets: the *method builder*
//! chosen by the return shape (`Create`, `Start`, `SetResult`, `SetException`,
//! `AwaitUnsafeOnCompleted`, ...) and the *awaiter pattern* of each awaited expression
//! (`GetAwaiter`, `IsCompleted`, `OnCompleted`, `GetResult`). This module describes those
//! member sets and resolves them for concrete types. The runtime side of the same protocol
//! lives in [`crate::emulation`].

mod members;
mod registry;

pub use members::{AwaitableDescriptor, AwaiterMember, BuilderDescriptor, BuilderMember};
pub use registry::{
    task_builder_name, CapabilityRegistry, TASK_AWAITER, TASK_BUILDER, VOID_BUILDER,
    YIELD_AWAITABLE, YIELD_AWAITER,
};
