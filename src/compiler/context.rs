//! Per-method state shared by the lowering passes.
//!
//! A [`LoweringContext`] is created for each method and threaded through the pipeline.
//! Earlier passes fill in the parts later ones consume: the synthesizer produces the
//! normalized body, the suspension points and the hoisting decisions; the region pass
//! rewrites the body and adds wrap slots; code generation produces `MoveNext`.

use std::collections::HashMap;

use crate::{
    assembly::{FieldId, MethodBody},
    capabilities::{BuilderDescriptor, CapabilityRegistry},
    compiler::{
        events::{EventBuilder, EventKind, EventLog},
        layout::{Representation, StateMachineLayout},
        machine::SuspensionPoint,
        regions::RegionTree,
    },
    config::LoweringConfig,
    syntax::{
        AsyncMethodDescriptor, BinaryOp, Block, Expr, LocalDecl, LocalId, LocalKind, TypeRef,
        UnaryOp,
    },
    Result,
};

/// State of one method moving through the lowering pipeline.
pub struct LoweringContext<'a> {
    // ── Inputs ──────────────────────────────────────────────────────────
    /// The method being lowered.
    pub method: &'a AsyncMethodDescriptor,
    /// Lowering options.
    pub config: &'a LoweringConfig,
    /// Builder and awaitable resolution.
    pub registry: &'a CapabilityRegistry,
    /// Events recorded by the passes.
    pub events: EventLog,

    // ── Working source ──────────────────────────────────────────────────
    /// Locals table, extended with spill temporaries and wrap slots.
    pub locals: Vec<LocalDecl>,
    /// Body, normalized by the synthesizer and rewritten by the region pass.
    pub body: Block,

    // ── Machine ─────────────────────────────────────────────────────────
    /// Resolved builder.
    pub builder: Option<BuilderDescriptor>,
    /// Struct or class.
    pub representation: Representation,
    /// Field layout.
    pub layout: StateMachineLayout,
    /// Suspension points, indexed by state number.
    pub points: Vec<SuspensionPoint>,
    /// Pre-order position of each suspension point.
    pub point_positions: Vec<u32>,
    /// Pre-order span of each source `try` statement.
    pub try_spans: Vec<(u32, u32)>,
    /// Source exception regions.
    pub regions: RegionTree,
    /// Field of every hoisted local.
    pub storage: HashMap<LocalId, FieldId>,
    /// Field of every referenced parameter.
    pub parameters: HashMap<u16, FieldId>,
    /// Field of the hoisted receiver.
    pub this_field: Option<FieldId>,

    // ── Output ──────────────────────────────────────────────────────────
    /// Emitted `MoveNext`.
    pub move_next: Option<MethodBody>,
}

impl<'a> LoweringContext<'a> {
    /// Creates the context for `method`.
    #[must_use]
    pub fn new(
        method: &'a AsyncMethodDescriptor,
        config: &'a LoweringConfig,
        registry: &'a CapabilityRegistry,
    ) -> Self {
        let type_name = StateMachineLayout::type_name_for(&method.name, method.ordinal);
        Self {
            method,
            config,
            registry,
            events: EventLog::new(),
            locals: method.locals.clone(),
            body: method.body.clone(),
            builder: None,
            representation: if config.requires_class() {
                Representation::Class
            } else {
                Representation::Struct
            },
            layout: StateMachineLayout::new(type_name, TypeRef::Void),
            points: Vec::new(),
            point_positions: Vec::new(),
            try_spans: Vec::new(),
            regions: RegionTree::new(),
            storage: HashMap::new(),
            parameters: HashMap::new(),
            this_field: None,
            move_next: None,
        }
    }

    /// Starts an event attributed to this method.
    pub fn record(&self, kind: EventKind) -> EventBuilder<'_> {
        self.events.record(kind).method(self.method.name.clone())
    }

    /// The resolved builder.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Malformed`] if the synthesizer has not run.
    pub fn builder(&self) -> Result<&BuilderDescriptor> {
        self.builder
            .as_ref()
            .ok_or_else(|| malformed_error!("Builder of {} not resolved", self.method.name))
    }

    /// Declares a synthesized local.
    pub fn new_local(&mut self, name: impl Into<String>, ty: TypeRef, kind: LocalKind) -> LocalId {
        let id = LocalId(self.locals.len() as u32);
        self.locals.push(LocalDecl {
            name: name.into(),
            ty,
            kind,
        });
        id
    }

    /// Looks up a local.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Malformed`] for an undeclared local.
    pub fn local(&self, id: LocalId) -> Result<&LocalDecl> {
        self.locals
            .get(id.index())
            .ok_or_else(|| malformed_error!("Undeclared local {} in {}", id.0, self.method.name))
    }

    /// Type of a parameter.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Malformed`] for an unknown parameter index.
    pub fn param_type(&self, index: u16) -> Result<TypeRef> {
        self.method
            .parameters
            .get(usize::from(index))
            .map(|p| p.ty.clone())
            .ok_or_else(|| malformed_error!("Unknown parameter {} in {}", index, self.method.name))
    }

    /// Static type of an expression.
    ///
    /// # Errors
    ///
    /// Returns an error for references to unknown locals, parameters or receivers, and for
    /// awaits of types that are not awaitable.
    pub fn type_of(&self, expr: &Expr) -> Result<TypeRef> {
        Ok(match expr {
            Expr::Int(_) => TypeRef::Int32,
            Expr::Bool(_) => TypeRef::Bool,
            Expr::Str(_) => TypeRef::String,
            Expr::Null => TypeRef::Object,
            Expr::Local(id) => self.local(*id)?.ty.clone(),
            Expr::Param(index) => self.param_type(*index)?,
            Expr::This => self.method.receiver.ty().cloned().ok_or_else(|| {
                malformed_error!("'this' used in static method {}", self.method.name)
            })?,
            Expr::Binary(op, left, right) => {
                if op.is_comparison() {
                    TypeRef::Bool
                } else {
                    let left = self.type_of(left)?;
                    if *op == BinaryOp::Add
                        && (left == TypeRef::String || self.type_of(right)? == TypeRef::String)
                    {
                        TypeRef::String
                    } else {
                        left
                    }
                }
            }
            Expr::Unary(UnaryOp::Not, _) | Expr::AndAlso(..) | Expr::OrElse(..) => TypeRef::Bool,
            Expr::Unary(UnaryOp::Neg, _) => TypeRef::Int32,
            Expr::Conditional(_, then, otherwise) => match self.type_of(then)? {
                TypeRef::Object if **then == Expr::Null => self.type_of(otherwise)?,
                ty => ty,
            },
            Expr::Call { ty, .. } => ty.clone(),
            Expr::Await(operand) => {
                let awaited = self.type_of(operand)?;
                self.registry.resolve_awaitable(&awaited)?.result
            }
            Expr::IsInst(_, ty) | Expr::Cast(_, ty) => ty.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::syntax::{MethodBuilder, ReturnShape};

    #[test]
    fn test_type_of() {
        let mut m = MethodBuilder::new("F", ReturnShape::Task);
        let p = m.param("s", TypeRef::String);
        let x = m.local("x", TypeRef::Int32);
        let method = m.build();
        let config = LoweringConfig::release();
        let registry = CapabilityRegistry::new();
        let ctx = LoweringContext::new(&method, &config, &registry);

        assert_eq!(ctx.type_of(&Expr::local(x)).ok(), Some(TypeRef::Int32));
        assert_eq!(
            ctx.type_of(&Expr::add(Expr::Param(p), Expr::int(1))).ok(),
            Some(TypeRef::String)
        );
        assert_eq!(
            ctx.type_of(&Expr::eq(Expr::local(x), Expr::int(1))).ok(),
            Some(TypeRef::Bool)
        );
        let awaited = Expr::await_(Expr::call(
            "G",
            vec![],
            TypeRef::task_of(TypeRef::String),
        ));
        assert_eq!(ctx.type_of(&awaited).ok(), Some(TypeRef::String));
        assert!(ctx.type_of(&Expr::This).is_err());
    }

    #[test]
    fn test_new_local_extends_table() {
        let method = MethodBuilder::new("F", ReturnShape::Task).build();
        let config = LoweringConfig::debug();
        let registry = CapabilityRegistry::new();
        let mut ctx = LoweringContext::new(&method, &config, &registry);

        assert_eq!(ctx.representation, Representation::Class);
        let id = ctx.new_local("<>s__1", TypeRef::Int32, LocalKind::Spill);
        assert_eq!(id, LocalId(0));
        assert_eq!(ctx.local(id).map(|l| l.kind).ok(), Some(LocalKind::Spill));
        assert!(ctx.builder().is_err());
    }
}
