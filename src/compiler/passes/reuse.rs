//! Pass 4: field reuse.
//!
//! Awaiter slots are only meaningful between a suspension and its resumption, so every
//! suspension point awaiting the same awaiter type shares one slot. With reuse enabled,
//! hoisted locals and wrap slots of the same type whose lifetimes are disjoint are also
//! folded together, first fit in order of first use. Each slot is then renumbered and the
//! emitted `MoveNext` rewritten to the compacted layout.

use std::collections::HashMap;

use crate::{
    assembly::FieldId,
    compiler::{
        context::LoweringContext,
        events::EventKind,
        layout::{FieldKind, Lifetime},
        pass::LoweringPass,
    },
    syntax::TypeRef,
    Result,
};

/// Folds fields with disjoint lifetimes and compacts the layout.
pub struct FieldReusePass;

impl LoweringPass for FieldReusePass {
    fn name(&self) -> &'static str {
        "field-reuse"
    }

    fn run(&self, ctx: &mut LoweringContext<'_>) -> Result<()> {
        let fields = &ctx.layout.fields;
        let mut representative: Vec<usize> = (0..fields.len()).collect();

        let mut awaiters: HashMap<&TypeRef, usize> = HashMap::new();
        for (index, field) in fields.iter().enumerate() {
            if field.kind == FieldKind::Awaiter {
                representative[index] = *awaiters.entry(&field.ty).or_insert(index);
            }
        }

        let mut lifetimes: HashMap<usize, Lifetime> = HashMap::new();
        if ctx.config.enable_field_reuse {
            let mut candidates: Vec<(u32, usize)> = fields
                .iter()
                .enumerate()
                .filter(|(_, f)| matches!(f.kind, FieldKind::Hoisted(_) | FieldKind::Wrap(_)))
                .filter_map(|(index, f)| match f.lifetime {
                    Lifetime::Interval { start, .. } => Some((start, index)),
                    _ => None,
                })
                .collect();
            candidates.sort_unstable();

            let mut slots: Vec<(usize, Lifetime)> = Vec::new();
            for (_, index) in candidates {
                let field = &fields[index];
                let fit = slots.iter_mut().find(|(slot, lifetime)| {
                    fields[*slot].ty == field.ty && !lifetime.overlaps(&field.lifetime)
                });
                match fit {
                    Some((slot, lifetime)) => {
                        representative[index] = *slot;
                        *lifetime = lifetime.union(&field.lifetime);
                    }
                    None => slots.push((index, field.lifetime)),
                }
            }
            lifetimes.extend(slots);
        }

        let merged: Vec<(String, String)> = representative
            .iter()
            .enumerate()
            .filter(|(index, rep)| *index != **rep)
            .map(|(index, rep)| (fields[index].name.clone(), fields[*rep].name.clone()))
            .collect();
        if merged.is_empty() {
            return Ok(());
        }

        // Compact: keep representatives in declaration order.
        let mut new_index = vec![0u32; fields.len()];
        let mut kept = Vec::new();
        for (index, field) in fields.iter().enumerate() {
            if representative[index] == index {
                new_index[index] = kept.len() as u32;
                let mut field = field.clone();
                if let Some(lifetime) = lifetimes.get(&index) {
                    field.lifetime = *lifetime;
                }
                kept.push(field);
            }
        }
        let remap: Vec<FieldId> = representative
            .iter()
            .map(|&rep| FieldId(new_index[rep]))
            .collect();
        let map = |id: FieldId| remap.get(id.index()).copied().unwrap_or(id);

        let mut awaiter_ordinal = 0;
        for field in &mut kept {
            if field.kind == FieldKind::Awaiter {
                awaiter_ordinal += 1;
                field.name = format!("<>u__{awaiter_ordinal}");
            }
        }
        ctx.layout.fields = kept;

        if let Some(body) = ctx.move_next.as_mut() {
            for instruction in &mut body.instructions {
                instruction.remap_field(map);
            }
        }
        for point in &mut ctx.points {
            point.awaiter_slot = map(point.awaiter_slot);
            for field in &mut point.live {
                *field = map(*field);
            }
            point.live.sort();
            point.live.dedup();
        }
        for field in ctx.storage.values_mut() {
            *field = map(*field);
        }
        for field in ctx.parameters.values_mut() {
            *field = map(*field);
        }
        ctx.this_field = ctx.this_field.map(map);

        for (field, shared) in merged {
            ctx.record(EventKind::FieldReused)
                .message(format!("{field} shares {shared}"));
        }
        Ok(())
    }

    fn description(&self) -> &'static str {
        "Shares awaiter slots by type and folds fields with disjoint lifetimes"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        assembly::Instruction,
        capabilities::CapabilityRegistry,
        compiler::passes::{SuspensionPass, SynthesizePass},
        config::LoweringConfig,
        syntax::{Expr, MethodBuilder, ReturnShape, Stmt},
    };

    fn yield_stmt() -> Stmt {
        Stmt::await_(Expr::call("Task.Yield", vec![], TypeRef::yield_awaitable()))
    }

    fn print(local: crate::syntax::LocalId) -> Stmt {
        Stmt::Expr(Expr::call(
            "Console.WriteLine",
            vec![Expr::local(local)],
            TypeRef::Void,
        ))
    }

    /// Two string locals live across different awaits, one after the other.
    fn sequential() -> crate::syntax::AsyncMethodDescriptor {
        let mut m = MethodBuilder::new("F", ReturnShape::Task);
        let a = m.local("a", TypeRef::String);
        let b = m.local("b", TypeRef::String);
        m.push(Stmt::Block(
            vec![Stmt::declare(a, Expr::string("a")), yield_stmt(), print(a)].into(),
        ));
        m.push(Stmt::Block(
            vec![Stmt::declare(b, Expr::string("b")), yield_stmt(), print(b)].into(),
        ));
        m.build()
    }

    fn lower(config: &LoweringConfig) -> Vec<String> {
        let method = sequential();
        let registry = CapabilityRegistry::new();
        let mut ctx = LoweringContext::new(&method, config, &registry);
        SynthesizePass.run(&mut ctx).unwrap();
        SuspensionPass.run(&mut ctx).unwrap();
        FieldReusePass.run(&mut ctx).unwrap();

        let fields = ctx.layout.len() as u32;
        let body = ctx.move_next.as_ref().unwrap();
        assert!(body
            .instructions
            .iter()
            .filter_map(Instruction::field)
            .all(|f| f.0 < fields));
        ctx.layout.fields.iter().map(|f| f.name.clone()).collect()
    }

    #[test]
    fn test_disjoint_locals_share_a_field() {
        let names = lower(&LoweringConfig::release());
        assert_eq!(names, vec!["<>1__state", "<>t__builder", "<a>5__1", "<>u__1"]);
    }

    #[test]
    fn test_reuse_disabled_keeps_locals_apart() {
        let names = lower(&LoweringConfig::release().with_field_reuse(false));
        assert_eq!(
            names,
            vec!["<>1__state", "<>t__builder", "<a>5__1", "<b>5__2", "<>u__1"]
        );
    }
}
