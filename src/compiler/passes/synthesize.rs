//! Pass 1: state-machine synthesis.
//!
//! Resolves the builder, picks the machine representation, normalizes awaits (handing out
//! state numbers in evaluation order) and decides which locals, parameters and receiver
//! become fields of the machine.

use crate::{
    compiler::{
        context::LoweringContext,
        events::EventKind,
        layout::{Field, FieldKind, Lifetime, Representation, THIS_FIELD},
        pass::LoweringPass,
        passes::{hoisting::Liveness, spill},
    },
    syntax::{LocalId, LocalKind, TypeRef},
    Result,
};

/// Builder validation, await normalization, state numbering and hoisting.
pub struct SynthesizePass;

impl LoweringPass for SynthesizePass {
    fn name(&self) -> &'static str {
        "synthesize"
    }

    fn run(&self, ctx: &mut LoweringContext<'_>) -> Result<()> {
        let builder = ctx.registry.resolve_builder(&ctx.method.return_shape)?;
        let builder_index = ctx.layout.builder().index();
        ctx.layout.fields[builder_index].ty = TypeRef::Named(builder.name.clone());
        ctx.builder = Some(builder);

        let reason = if ctx.config.edit_and_continue {
            "edit and continue"
        } else {
            match ctx.representation {
                Representation::Class => "debug build",
                Representation::Struct => "release build",
            }
        };
        ctx.record(EventKind::RepresentationSelected).message(format!(
            "{} is a {} ({reason})",
            ctx.layout.type_name, ctx.representation
        ));

        spill::normalize(ctx)?;

        let liveness = Liveness::analyze(&ctx.body, ctx.points.len());
        hoist_receiver_and_parameters(ctx, &liveness)?;
        hoist_locals(ctx, &liveness);
        allocate_awaiter_slots(ctx);
        collect_live_fields(ctx, &liveness);

        ctx.point_positions = liveness.points;
        ctx.try_spans = liveness.trys;
        Ok(())
    }

    fn description(&self) -> &'static str {
        "Validates the builder, normalizes awaits, numbers states and hoists live locals"
    }
}

fn hoist_receiver_and_parameters(ctx: &mut LoweringContext<'_>, liveness: &Liveness) -> Result<()> {
    if liveness.uses_this {
        let ty = ctx.method.receiver.ty().cloned().ok_or_else(|| {
            malformed_error!("'this' used in static method {}", ctx.method.name)
        })?;
        let field = ctx.layout.push(Field {
            name: THIS_FIELD.to_string(),
            ty,
            kind: FieldKind::This,
            lifetime: Lifetime::Pinned,
        });
        ctx.this_field = Some(field);
        ctx.record(EventKind::VariableHoisted)
            .message(format!("receiver -> {THIS_FIELD}"));
    }

    for &index in &liveness.parameters {
        let parameter = ctx.method.parameters.get(usize::from(index)).ok_or_else(|| {
            malformed_error!("Unknown parameter {} in {}", index, ctx.method.name)
        })?;
        let field = ctx.layout.push(Field {
            name: parameter.name.clone(),
            ty: parameter.ty.clone(),
            kind: FieldKind::Parameter(index),
            lifetime: Lifetime::Pinned,
        });
        ctx.parameters.insert(index, field);
        ctx.record(EventKind::VariableHoisted)
            .message(format!("parameter {} -> field", parameter.name));
    }
    Ok(())
}

fn hoist_locals(ctx: &mut LoweringContext<'_>, liveness: &Liveness) {
    let mut ordinal = 0;
    for index in 0..ctx.locals.len() {
        let id = LocalId(index as u32);
        let decl = &ctx.locals[index];
        let hoist = match decl.kind {
            LocalKind::User => {
                ctx.config.hoist_all_user_locals || liveness.is_live_across_suspension(id)
            }
            LocalKind::Spill => liveness.is_live_across_suspension(id),
            LocalKind::Wrap => false,
        };
        if !hoist {
            continue;
        }

        ordinal += 1;
        let name = match decl.kind {
            LocalKind::User => format!("<{}>5__{ordinal}", decl.name),
            _ => format!("<>s__{ordinal}"),
        };
        let lifetime = match liveness.extent(id) {
            Some((start, end)) => Lifetime::Interval { start, end },
            None => Lifetime::Pinned,
        };
        let message = format!("{} -> {name}", decl.name);
        let field = ctx.layout.push(Field {
            name,
            ty: decl.ty.clone(),
            kind: FieldKind::Hoisted(id),
            lifetime,
        });
        ctx.storage.insert(id, field);
        ctx.record(EventKind::VariableHoisted)
            .location(index)
            .message(message);
    }
}

fn allocate_awaiter_slots(ctx: &mut LoweringContext<'_>) {
    for index in 0..ctx.points.len() {
        let field = ctx.layout.push(Field {
            name: format!("<>u__{}", index + 1),
            ty: ctx.points[index].awaiter.clone(),
            kind: FieldKind::Awaiter,
            lifetime: Lifetime::Momentary,
        });
        ctx.points[index].awaiter_slot = field;
    }
}

fn collect_live_fields(ctx: &mut LoweringContext<'_>, liveness: &Liveness) {
    let pinned: Vec<_> = ctx
        .this_field
        .into_iter()
        .chain(ctx.parameters.values().copied())
        .collect();

    for (state, point) in ctx.points.iter_mut().enumerate() {
        let position = liveness.points.get(state).copied().unwrap_or(0);
        let mut live: Vec<_> = pinned.clone();
        live.extend(
            ctx.storage
                .iter()
                .filter(|(local, _)| liveness.is_live_at(**local, position))
                .map(|(_, field)| *field),
        );
        live.sort();
        point.live = live;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        capabilities::CapabilityRegistry,
        config::LoweringConfig,
        syntax::{Expr, MethodBuilder, Receiver, ReturnShape, Stmt},
    };

    #[test]
    fn test_hoists_only_live_locals_in_release() {
        let mut m = MethodBuilder::new("F", ReturnShape::Task)
            .receiver(Receiver::Reference(TypeRef::class("C")));
        let p = m.param("count", TypeRef::Int32);
        let live = m.local("live", TypeRef::String);
        let dead = m.local("dead", TypeRef::Int32);
        m.push(Stmt::declare(live, Expr::string("a")));
        m.push(Stmt::declare(dead, Expr::Param(p)));
        m.push(Stmt::await_(Expr::call("Task.Yield", vec![], TypeRef::yield_awaitable())));
        m.push(Stmt::Expr(Expr::call(
            "Console.WriteLine",
            vec![Expr::local(live)],
            TypeRef::Void,
        )));
        let method = m.build();
        let config = LoweringConfig::release();
        let registry = CapabilityRegistry::new();
        let mut ctx = LoweringContext::new(&method, &config, &registry);

        SynthesizePass.run(&mut ctx).unwrap();

        assert!(ctx.storage.contains_key(&live));
        assert!(!ctx.storage.contains_key(&dead));
        assert!(ctx.parameters.contains_key(&p));
        assert!(ctx.this_field.is_none());
        assert_eq!(ctx.points.len(), 1);
        let names: Vec<_> = ctx.layout.fields.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["<>1__state", "<>t__builder", "count", "<live>5__1", "<>u__1"]
        );
        assert!(ctx.points[0].live.contains(&ctx.storage[&live]));
        assert_eq!(ctx.events.count_kind(EventKind::RepresentationSelected), 1);
    }

    #[test]
    fn test_debug_hoists_all_user_locals() {
        let mut m = MethodBuilder::new("F", ReturnShape::Task);
        let x = m.local("x", TypeRef::Int32);
        m.push(Stmt::declare(x, Expr::int(1)));
        let method = m.build();
        let config = LoweringConfig::debug();
        let registry = CapabilityRegistry::new();
        let mut ctx = LoweringContext::new(&method, &config, &registry);

        SynthesizePass.run(&mut ctx).unwrap();

        assert!(ctx.storage.contains_key(&x));
        assert_eq!(ctx.representation, Representation::Class);
        assert!(ctx.points.is_empty());
    }

    #[test]
    fn test_builder_field_takes_resolved_builder_type() {
        let mut m = MethodBuilder::new("F", ReturnShape::TaskOf(TypeRef::Int32));
        m.push(Stmt::Return(Some(Expr::int(1))));
        let method = m.build();
        let config = LoweringConfig::release();
        let registry = CapabilityRegistry::new();
        let mut ctx = LoweringContext::new(&method, &config, &registry);

        SynthesizePass.run(&mut ctx).unwrap();

        let field = &ctx.layout.fields[ctx.layout.builder().index()];
        let builder = ctx.builder.as_ref().unwrap();
        assert_eq!(field.ty, TypeRef::Named(builder.name.clone()));
        assert!(builder.name.ends_with("AsyncTaskMethodBuilder<int32>"));
    }
}
