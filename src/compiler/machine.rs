//! Lowered state machines and the public lowering entry point.

use std::{fmt, sync::Arc};

use dashmap::DashMap;
use rayon::prelude::*;

use crate::{
    assembly::{FieldId, ListingContext, MethodBody},
    capabilities::{BuilderDescriptor, BuilderMember, CapabilityRegistry},
    compiler::{
        context::LoweringContext,
        events::{EventKind, EventLog},
        layout::{Representation, StateMachineLayout},
        regions::RegionTree,
        scheduler::PassScheduler,
    },
    config::LoweringConfig,
    syntax::{AsyncMethodDescriptor, Parameter, Receiver, TypeRef},
    Result,
};

/// A point where `MoveNext` may suspend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuspensionPoint {
    /// State number stored while suspended here.
    pub state: u32,
    /// Awaited type.
    pub awaitable: TypeRef,
    /// Awaiter type.
    pub awaiter: TypeRef,
    /// Result type of `GetResult`.
    pub result: TypeRef,
    /// Builder member scheduling the continuation: `AwaitUnsafeOnCompleted`, or
    /// `AwaitOnCompleted` for awaiters without `UnsafeOnCompleted`.
    pub completion: BuilderMember,
    /// Field holding the awaiter while suspended.
    pub awaiter_slot: FieldId,
    /// Data fields holding live values while suspended.
    pub live: Vec<FieldId>,
}

/// Name-independent summary of a machine, used to compare lowerings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineShape {
    /// Struct or class.
    pub representation: Representation,
    /// Number of suspension states.
    pub states: usize,
    /// Field kinds and types in layout order.
    pub fields: Vec<(&'static str, TypeRef)>,
    /// Number of `MoveNext` instructions.
    pub instructions: usize,
    /// Number of exception clauses.
    pub clauses: usize,
}

/// The result of lowering one async method.
#[derive(Debug, Clone)]
pub struct StateMachine {
    /// Name of the source method.
    pub name: String,
    /// Name of the machine type, e.g. `<F>d__0`.
    pub type_name: String,
    /// Struct or class.
    pub representation: Representation,
    /// Field layout.
    pub layout: StateMachineLayout,
    /// Suspension points by state number.
    pub suspension_points: Vec<SuspensionPoint>,
    /// Source exception regions.
    pub regions: RegionTree,
    /// Emitted `MoveNext`.
    pub move_next: MethodBody,
    /// Builder driving the machine.
    pub builder: BuilderDescriptor,
    /// Type passed to `SetResult`, `Void` for none.
    pub result_type: TypeRef,
    /// Parameters of the kickoff method.
    pub parameters: Vec<Parameter>,
    /// Receiver of the kickoff method.
    pub receiver: Receiver,
}

impl StateMachine {
    fn from_context(ctx: LoweringContext<'_>) -> Result<Self> {
        let name = ctx.method.name.clone();
        let move_next = ctx
            .move_next
            .ok_or_else(|| malformed_error!("MoveNext of {} was not emitted", name))?;
        let builder = ctx
            .builder
            .ok_or_else(|| malformed_error!("Builder of {} not resolved", name))?;
        Ok(Self {
            type_name: ctx.layout.type_name.clone(),
            representation: ctx.representation,
            layout: ctx.layout,
            suspension_points: ctx.points,
            regions: ctx.regions,
            move_next,
            result_type: builder.result.clone(),
            builder,
            parameters: ctx.method.parameters.clone(),
            receiver: ctx.method.receiver.clone(),
            name,
        })
    }

    /// Number of suspension states.
    #[must_use]
    pub fn state_count(&self) -> usize {
        self.suspension_points.len()
    }

    /// Textual dump of the machine type and its `MoveNext`.
    #[must_use]
    pub fn il_listing(&self) -> String {
        self.to_string()
    }

    /// Name-independent summary for determinism comparisons.
    #[must_use]
    pub fn shape(&self) -> MachineShape {
        MachineShape {
            representation: self.representation,
            states: self.state_count(),
            fields: self
                .layout
                .fields
                .iter()
                .map(|f| (f.kind.tag(), f.ty.clone()))
                .collect(),
            instructions: self.move_next.len(),
            clauses: self.move_next.clauses.len(),
        }
    }
}

impl ListingContext for StateMachine {
    fn field(&self, id: FieldId) -> String {
        match self.layout.get(id) {
            Some(field) => format!("{} {}::{}", field.ty, self.type_name, field.name),
            None => format!("<field {}>", id.0),
        }
    }

    fn builder(&self) -> String {
        self.builder.name.clone()
    }
}

impl fmt::Display for StateMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, ".class nested private sealed {} {}", self.representation, self.type_name)?;
        writeln!(f, "{{")?;
        for line in self.layout.to_string().lines() {
            writeln!(f, "  {line}")?;
        }
        writeln!(f, "}}")?;
        f.write_str(&self.move_next.listing(self)?)
    }
}

/// Lowers async methods into state machines.
///
/// Independent methods share nothing but the capability registry and the event log, so
/// [`Lowerer::lower_all`] lowers them in parallel. Results are cached by machine type name.
///
/// # Example
///
/// ```rust
/// use asyncscope::prelude::*;
///
/// let mut m = MethodBuilder::new("F", ReturnShape::TaskOf(TypeRef::Int32));
/// m.push(Stmt::Return(Some(Expr::await_(Expr::call(
///     "Task.FromResult",
///     vec![Expr::int(1)],
///     TypeRef::task_of(TypeRef::Int32),
/// )))));
///
/// let lowerer = Lowerer::new(LoweringConfig::release());
/// let machine = lowerer.lower(&m.build())?;
/// assert_eq!(machine.state_count(), 1);
/// assert!(machine.il_listing().contains("<>1__state"));
/// # Ok::<(), asyncscope::Error>(())
/// ```
pub struct Lowerer {
    config: LoweringConfig,
    registry: Arc<CapabilityRegistry>,
    scheduler: PassScheduler,
    cache: DashMap<String, Arc<StateMachine>>,
    events: EventLog,
}

impl Lowerer {
    /// Creates a lowerer with a registry knowing only the framework capabilities.
    #[must_use]
    pub fn new(config: LoweringConfig) -> Self {
        Self::with_registry(config, Arc::new(CapabilityRegistry::new()))
    }

    /// Creates a lowerer resolving capabilities through `registry`.
    #[must_use]
    pub fn with_registry(config: LoweringConfig, registry: Arc<CapabilityRegistry>) -> Self {
        Self {
            config,
            registry,
            scheduler: PassScheduler::default(),
            cache: DashMap::new(),
            events: EventLog::new(),
        }
    }

    /// The lowering options.
    #[must_use]
    pub fn config(&self) -> &LoweringConfig {
        &self.config
    }

    /// The capability registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.registry
    }

    /// Events of every lowering performed so far.
    #[must_use]
    pub fn events(&self) -> &EventLog {
        &self.events
    }

    /// A previously lowered machine, by type name.
    #[must_use]
    pub fn cached(&self, type_name: &str) -> Option<Arc<StateMachine>> {
        self.cache.get(type_name).map(|entry| Arc::clone(entry.value()))
    }

    /// Lowers one method.
    ///
    /// # Errors
    ///
    /// Returns the first error raised by the pipeline. Nothing is cached for a method that
    /// fails to lower.
    pub fn lower(&self, method: &AsyncMethodDescriptor) -> Result<Arc<StateMachine>> {
        let key = StateMachineLayout::type_name_for(&method.name, method.ordinal);
        if let Some(machine) = self.cached(&key) {
            return Ok(machine);
        }

        let mut ctx = LoweringContext::new(method, &self.config, &self.registry);
        let outcome = self.scheduler.run(&mut ctx);
        self.events.merge_ref(&ctx.events);
        outcome?;

        let machine = Arc::new(StateMachine::from_context(ctx)?);
        self.events
            .record(EventKind::MethodLowered)
            .method(method.name.clone())
            .message(format!(
                "{} lowered: {} states, {} fields, {} instructions",
                machine.type_name,
                machine.state_count(),
                machine.layout.len(),
                machine.move_next.len()
            ));
        self.cache.insert(key, Arc::clone(&machine));
        Ok(machine)
    }

    /// Lowers independent methods in parallel.
    ///
    /// # Errors
    ///
    /// Returns an error if any method fails to lower.
    pub fn lower_all(&self, methods: &[AsyncMethodDescriptor]) -> Result<Vec<Arc<StateMachine>>> {
        methods.par_iter().map(|m| self.lower(m)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::syntax::{Expr, MethodBuilder, ReturnShape, Stmt};

    fn yielding(name: &str) -> AsyncMethodDescriptor {
        let mut m = MethodBuilder::new(name, ReturnShape::Task);
        m.push(Stmt::await_(Expr::call("Task.Yield", vec![], TypeRef::yield_awaitable())));
        m.build()
    }

    #[test]
    fn test_lower_caches_by_type_name() {
        let lowerer = Lowerer::new(LoweringConfig::release());
        let first = lowerer.lower(&yielding("F")).unwrap();
        let second = lowerer.lower(&yielding("F")).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(lowerer.cached("<F>d__0").is_some());
        assert_eq!(lowerer.events().count_kind(EventKind::MethodLowered), 1);
    }

    #[test]
    fn test_lower_all_parallel() {
        let lowerer = Lowerer::new(LoweringConfig::release());
        let methods: Vec<_> = (0..8).map(|i| yielding(&format!("M{i}"))).collect();
        let machines = lowerer.lower_all(&methods).unwrap();
        assert_eq!(machines.len(), 8);
        assert!(machines.iter().all(|m| m.state_count() == 1));
        assert_eq!(lowerer.events().methods().len(), 8);
    }

    #[test]
    fn test_listing_mentions_fields() {
        let lowerer = Lowerer::new(LoweringConfig::release());
        let machine = lowerer.lower(&yielding("F")).unwrap();
        let listing = machine.il_listing();
        assert!(listing.contains(".class nested private sealed valuetype <F>d__0"));
        assert!(listing.contains("<>t__builder"));
        assert!(listing.contains("AwaitUnsafeOnCompleted"));
    }
}
