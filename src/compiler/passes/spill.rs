//! Await normalization.
//!
//! After this step every suspension point is a [`Stmt::Await`] at statement level and no
//! expression contains an `await`. Operands that are evaluated before an await in the same
//! expression are spilled to synthesized temporaries, and short-circuit operators whose
//! later operands await are turned into `if` statements, so evaluation order is unchanged.
//! State numbers are handed out in the order the awaits are reached by a depth-first,
//! left-to-right walk, which is evaluation order.

use crate::{
    assembly::FieldId,
    capabilities::{AwaiterMember, BuilderMember},
    compiler::{context::LoweringContext, events::EventKind, machine::SuspensionPoint},
    syntax::{Block, CatchClause, Expr, LocalId, LocalKind, Place, Stmt, TryStmt, TypeRef},
    Error, Result,
};

/// Normalizes the awaits of `ctx.body` and records one suspension point per await.
///
/// # Errors
///
/// Returns [`Error::AwaitInFilter`] for awaits in catch filters, [`Error::StateLimit`] when
/// the method has too many awaits, and awaitable resolution errors.
pub(crate) fn normalize(ctx: &mut LoweringContext<'_>) -> Result<()> {
    let body = std::mem::take(&mut ctx.body);
    let normalized = Spiller { ctx: &mut *ctx }.block(body)?;
    ctx.body = normalized;
    Ok(())
}

struct Spiller<'c, 'a> {
    ctx: &'c mut LoweringContext<'a>,
}

impl Spiller<'_, '_> {
    fn block(&mut self, block: Block) -> Result<Block> {
        let mut out = Vec::with_capacity(block.stmts.len());
        for stmt in block.stmts {
            self.stmt(stmt, &mut out)?;
        }
        Ok(Block::new(out))
    }

    fn stmt(&mut self, stmt: Stmt, out: &mut Vec<Stmt>) -> Result<()> {
        match stmt {
            Stmt::Block(block) => out.push(Stmt::Block(self.block(block)?)),
            Stmt::Local {
                local,
                init: Some(Expr::Await(operand)),
            } => {
                let operand = self.expr(*operand, out)?;
                out.push(Stmt::Local { local, init: None });
                self.suspend(operand, Some(Place::Local(local)), out)?;
            }
            Stmt::Local { local, init } => {
                let init = match init {
                    Some(e) => Some(self.expr(e, out)?),
                    None => None,
                };
                out.push(Stmt::Local { local, init });
            }
            Stmt::Assign {
                target,
                value: Expr::Await(operand),
            } => {
                let operand = self.expr(*operand, out)?;
                self.suspend(operand, Some(target), out)?;
            }
            Stmt::Assign { target, value } => {
                let value = self.expr(value, out)?;
                out.push(Stmt::Assign { target, value });
            }
            Stmt::Expr(Expr::Await(operand)) => {
                let operand = self.expr(*operand, out)?;
                self.suspend(operand, None, out)?;
            }
            Stmt::Expr(expr) => {
                let value = self.expr(expr, out)?;
                // A spilled short-circuit leaves only its temporary behind.
                if !value.is_stable() {
                    out.push(Stmt::Expr(value));
                }
            }
            Stmt::If {
                cond,
                then,
                otherwise,
            } => {
                let cond = self.expr(cond, out)?;
                let then = self.block(then)?;
                let otherwise = match otherwise {
                    Some(block) => Some(self.block(block)?),
                    None => None,
                };
                out.push(Stmt::If {
                    cond,
                    then,
                    otherwise,
                });
            }
            Stmt::While { cond, body } if cond.contains_await() => {
                // while (c) body  =>  while (true) { pre; if (!c) break; body }
                let mut stmts = Vec::new();
                let cond = self.expr(cond, &mut stmts)?;
                stmts.push(Stmt::if_then(Expr::not(cond), vec![Stmt::Break]));
                stmts.extend(self.block(body)?.stmts);
                out.push(Stmt::While {
                    cond: Expr::Bool(true),
                    body: Block::new(stmts),
                });
            }
            Stmt::While { cond, body } => {
                let body = self.block(body)?;
                out.push(Stmt::While { cond, body });
            }
            Stmt::Return(Some(value)) => {
                let value = self.expr(value, out)?;
                out.push(Stmt::Return(Some(value)));
            }
            Stmt::Throw(Some(value)) => {
                let value = self.expr(value, out)?;
                let ty = self.ctx.type_of(&value)?;
                if !matches!(ty, TypeRef::Class(_)) {
                    return Err(malformed_error!(
                        "{} throws a {ty}, which is not an exception",
                        self.ctx.method.name
                    ));
                }
                out.push(Stmt::Throw(Some(value)));
            }
            Stmt::Try(t) => out.push(Stmt::Try(self.try_stmt(t)?)),
            Stmt::Await { .. } | Stmt::RethrowCaptured(_) => {
                return Err(malformed_error!(
                    "Lowering-internal statement in the source body of {}",
                    self.ctx.method.name
                ));
            }
            stmt @ (Stmt::Break
            | Stmt::Continue
            | Stmt::Label(_)
            | Stmt::Goto(_)
            | Stmt::Return(None)
            | Stmt::Throw(None)) => out.push(stmt),
        }
        Ok(())
    }

    fn try_stmt(&mut self, t: TryStmt) -> Result<TryStmt> {
        let body = self.block(t.body)?;
        let mut catches = Vec::with_capacity(t.catches.len());
        for catch in t.catches {
            if catch.filter.as_ref().is_some_and(Expr::contains_await) {
                return Err(Error::AwaitInFilter);
            }
            catches.push(CatchClause {
                ty: catch.ty,
                variable: catch.variable,
                filter: catch.filter,
                body: self.block(catch.body)?,
            });
        }
        let finally = match t.finally {
            Some(block) => Some(self.block(block)?),
            None => None,
        };
        Ok(TryStmt {
            body,
            catches,
            finally,
        })
    }

    /// Rewrites `expr` so that it contains no await, appending the statements that must
    /// run before it to `out`.
    fn expr(&mut self, expr: Expr, out: &mut Vec<Stmt>) -> Result<Expr> {
        Ok(match expr {
            Expr::Int(_)
            | Expr::Bool(_)
            | Expr::Str(_)
            | Expr::Null
            | Expr::Local(_)
            | Expr::Param(_)
            | Expr::This => expr,
            Expr::Binary(op, left, right) => {
                let mut operands = self.operands(vec![*left, *right], out)?.into_iter();
                match (operands.next(), operands.next()) {
                    (Some(left), Some(right)) => Expr::binary(op, left, right),
                    _ => return Err(malformed_error!("Binary operator lost an operand")),
                }
            }
            Expr::Unary(op, operand) => Expr::Unary(op, Box::new(self.expr(*operand, out)?)),
            Expr::AndAlso(left, right) if right.contains_await() => {
                self.short_circuit(*left, *right, true, out)?
            }
            Expr::OrElse(left, right) if right.contains_await() => {
                self.short_circuit(*left, *right, false, out)?
            }
            Expr::AndAlso(left, right) => Expr::AndAlso(Box::new(self.expr(*left, out)?), right),
            Expr::OrElse(left, right) => Expr::OrElse(Box::new(self.expr(*left, out)?), right),
            Expr::Conditional(cond, then, otherwise)
                if then.contains_await() || otherwise.contains_await() =>
            {
                let ty = self.ctx.type_of(&Expr::Conditional(
                    cond.clone(),
                    then.clone(),
                    otherwise.clone(),
                ))?;
                let cond = self.expr(*cond, out)?;
                let temp = self.temp(ty);
                out.push(Stmt::Local {
                    local: temp,
                    init: None,
                });

                let mut then_stmts = Vec::new();
                let value = self.expr(*then, &mut then_stmts)?;
                then_stmts.push(Stmt::assign(temp, value));

                let mut else_stmts = Vec::new();
                let value = self.expr(*otherwise, &mut else_stmts)?;
                else_stmts.push(Stmt::assign(temp, value));

                out.push(Stmt::If {
                    cond,
                    then: Block::new(then_stmts),
                    otherwise: Some(Block::new(else_stmts)),
                });
                Expr::Local(temp)
            }
            Expr::Conditional(cond, then, otherwise) => {
                Expr::Conditional(Box::new(self.expr(*cond, out)?), then, otherwise)
            }
            Expr::Call { name, args, ty } => Expr::Call {
                name,
                args: self.operands(args, out)?,
                ty,
            },
            Expr::Await(operand) => {
                let operand = self.expr(*operand, out)?;
                let ty = self.ctx.type_of(&Expr::await_(operand.clone()))?;
                if ty.is_void() {
                    return Err(malformed_error!(
                        "Result of awaiting {} is void and cannot be used as a value",
                        self.ctx.type_of(&operand)?
                    ));
                }
                let temp = self.temp(ty);
                out.push(Stmt::Local {
                    local: temp,
                    init: None,
                });
                self.suspend(operand, Some(Place::Local(temp)), out)?;
                Expr::Local(temp)
            }
            Expr::IsInst(operand, ty) => Expr::IsInst(Box::new(self.expr(*operand, out)?), ty),
            Expr::Cast(operand, ty) => Expr::Cast(Box::new(self.expr(*operand, out)?), ty),
        })
    }

    /// Rewrites operands evaluated left to right, spilling every unstable operand that is
    /// followed by an operand containing an await.
    fn operands(&mut self, operands: Vec<Expr>, out: &mut Vec<Stmt>) -> Result<Vec<Expr>> {
        let last_await = operands.iter().rposition(Expr::contains_await);
        let mut result = Vec::with_capacity(operands.len());
        for (index, operand) in operands.into_iter().enumerate() {
            let mut value = self.expr(operand, out)?;
            if last_await.is_some_and(|last| index < last) && !value.is_stable() {
                value = self.spill(value, out)?;
            }
            result.push(value);
        }
        Ok(result)
    }

    /// `a && b` / `a || b` where `b` awaits.
    fn short_circuit(
        &mut self,
        left: Expr,
        right: Expr,
        and_also: bool,
        out: &mut Vec<Stmt>,
    ) -> Result<Expr> {
        let left = self.expr(left, out)?;
        let temp = self.temp(TypeRef::Bool);
        out.push(Stmt::declare(temp, left));

        let mut rest = Vec::new();
        let right = self.expr(right, &mut rest)?;
        rest.push(Stmt::assign(temp, right));

        let cond = if and_also {
            Expr::Local(temp)
        } else {
            Expr::not(Expr::Local(temp))
        };
        out.push(Stmt::if_then(cond, rest));
        Ok(Expr::Local(temp))
    }

    fn spill(&mut self, value: Expr, out: &mut Vec<Stmt>) -> Result<Expr> {
        let ty = self.ctx.type_of(&value)?;
        let temp = self.temp(ty);
        self.ctx
            .record(EventKind::AwaitSpilled)
            .location(temp.index())
            .message(format!("operand spilled to {}", self.ctx.locals[temp.index()].name));
        out.push(Stmt::declare(temp, value));
        Ok(Expr::Local(temp))
    }

    fn temp(&mut self, ty: TypeRef) -> LocalId {
        let ordinal = self
            .ctx
            .locals
            .iter()
            .filter(|l| l.kind == LocalKind::Spill)
            .count()
            + 1;
        self.ctx
            .new_local(format!("<>s__{ordinal}"), ty, LocalKind::Spill)
    }

    /// Allocates the next state number for an await of `operand`.
    fn suspend(&mut self, operand: Expr, target: Option<Place>, out: &mut Vec<Stmt>) -> Result<()> {
        let state = self.ctx.points.len() as u32;
        if state >= self.ctx.config.max_states {
            return Err(Error::StateLimit(self.ctx.config.max_states));
        }

        let awaitable = self.ctx.registry.resolve_awaitable(&self.ctx.type_of(&operand)?)?;
        if target.is_some() && awaitable.result.is_void() {
            return Err(malformed_error!(
                "Result of awaiting {} is void and cannot be assigned",
                awaitable.awaitable
            ));
        }

        let completion = if awaitable.has(AwaiterMember::UnsafeOnCompleted) {
            BuilderMember::AwaitUnsafeOnCompleted
        } else {
            BuilderMember::AwaitOnCompleted
        };
        let builder = self.ctx.builder()?;
        if !builder.has(completion) {
            return Err(Error::MissingBuilderMember {
                builder: builder.name.clone(),
                member: completion.to_string(),
            });
        }

        self.ctx
            .record(EventKind::StateAllocated)
            .location(state as usize)
            .message(format!("state {state} awaits {}", awaitable.awaitable));

        self.ctx.points.push(SuspensionPoint {
            state,
            awaitable: awaitable.awaitable,
            awaiter: awaitable.awaiter,
            result: awaitable.result,
            completion,
            // Assigned once the layout knows its data fields.
            awaiter_slot: FieldId(0),
            live: Vec::new(),
        });
        out.push(Stmt::Await {
            operand,
            target,
            point: state,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        capabilities::CapabilityRegistry,
        config::LoweringConfig,
        syntax::{AsyncMethodDescriptor, MethodBuilder, ReturnShape},
    };

    fn task_int(name: &str) -> Expr {
        Expr::call(name, vec![], TypeRef::task_of(TypeRef::Int32))
    }

    fn normalized(
        method: &AsyncMethodDescriptor,
        config: &LoweringConfig,
    ) -> Result<(Block, usize)> {
        let registry = CapabilityRegistry::new();
        let mut ctx = LoweringContext::new(method, config, &registry);
        ctx.builder = Some(registry.resolve_builder(&method.return_shape)?);
        normalize(&mut ctx)?;
        Ok((ctx.body, ctx.points.len()))
    }

    #[test]
    fn test_statement_level_await_needs_no_temp() {
        let mut m = MethodBuilder::new("F", ReturnShape::Task);
        let x = m.local("x", TypeRef::Int32);
        m.push(Stmt::declare(x, Expr::await_(task_int("A"))));
        let method = m.build();

        let (body, points) = normalized(&method, &LoweringConfig::release()).unwrap();
        assert_eq!(points, 1);
        assert_eq!(
            body.stmts,
            vec![
                Stmt::Local { local: x, init: None },
                Stmt::Await {
                    operand: task_int("A"),
                    target: Some(Place::Local(x)),
                    point: 0
                },
            ]
        );
    }

    #[test]
    fn test_earlier_operand_is_spilled() {
        // F(G(), await A())
        let mut m = MethodBuilder::new("F", ReturnShape::Task);
        m.push(Stmt::Expr(Expr::call(
            "F",
            vec![
                Expr::call("G", vec![], TypeRef::Int32),
                Expr::await_(task_int("A")),
            ],
            TypeRef::Void,
        )));
        let method = m.build();

        let (body, points) = normalized(&method, &LoweringConfig::release()).unwrap();
        assert_eq!(points, 1);
        // spill of G(), declaration of the await temp, the await, the call
        assert_eq!(body.stmts.len(), 4);
        assert!(matches!(
            &body.stmts[0],
            Stmt::Local { init: Some(Expr::Call { name, .. }), .. } if name == "G"
        ));
        assert!(matches!(body.stmts[2], Stmt::Await { point: 0, .. }));
        assert!(matches!(&body.stmts[3], Stmt::Expr(e) if !e.contains_await()));
    }

    #[test]
    fn test_and_also_becomes_if() {
        let mut m = MethodBuilder::new("F", ReturnShape::Task);
        let b = m.local("b", TypeRef::Bool);
        let bool_task = |n: &str| Expr::call(n, vec![], TypeRef::task_of(TypeRef::Bool));
        m.push(Stmt::declare(
            b,
            Expr::and_also(Expr::await_(bool_task("A")), Expr::await_(bool_task("B"))),
        ));
        let method = m.build();

        let (body, points) = normalized(&method, &LoweringConfig::release()).unwrap();
        assert_eq!(points, 2);
        let has_if = body.stmts.iter().any(|s| {
            matches!(s, Stmt::If { then, .. }
                if then.stmts.iter().any(|t| matches!(t, Stmt::Await { point: 1, .. })))
        });
        assert!(has_if, "second await must be guarded by the first operand");
    }

    #[test]
    fn test_await_in_filter_rejected() {
        let mut m = MethodBuilder::new("F", ReturnShape::Task);
        m.push(Stmt::try_catch(
            vec![],
            vec![CatchClause::new(TypeRef::exception(), None, vec![]).when(Expr::await_(
                Expr::call("P", vec![], TypeRef::task_of(TypeRef::Bool)),
            ))],
        ));
        let method = m.build();
        assert!(matches!(
            normalized(&method, &LoweringConfig::release()),
            Err(Error::AwaitInFilter)
        ));
    }

    #[test]
    fn test_state_limit() {
        let mut m = MethodBuilder::new("F", ReturnShape::Task);
        for _ in 0..3 {
            m.push(Stmt::await_(Expr::call("T", vec![], TypeRef::Task)));
        }
        let method = m.build();
        assert!(matches!(
            normalized(&method, &LoweringConfig::release().with_max_states(2)),
            Err(Error::StateLimit(2))
        ));
    }

    #[test]
    fn test_void_await_as_value_rejected() {
        let mut m = MethodBuilder::new("F", ReturnShape::Task);
        let x = m.local("x", TypeRef::Int32);
        m.push(Stmt::assign(
            x,
            Expr::add(Expr::int(1), Expr::await_(Expr::call("T", vec![], TypeRef::Task))),
        ));
        let method = m.build();
        assert!(matches!(
            normalized(&method, &LoweringConfig::release()),
            Err(Error::Malformed { .. })
        ));
    }

    #[test]
    fn test_throwing_a_non_exception_rejected() {
        let mut m = MethodBuilder::new("F", ReturnShape::Task);
        m.push(Stmt::await_(Expr::call("T", vec![], TypeRef::Task)));
        m.push(Stmt::Throw(Some(Expr::string("raw"))));
        let method = m.build();
        assert!(matches!(
            normalized(&method, &LoweringConfig::release()),
            Err(Error::Malformed { .. })
        ));
    }
}
