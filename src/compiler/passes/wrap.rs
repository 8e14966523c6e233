//! Pass 2: exception regions.
//!
//! Builds the region tree of the normalized body and rewrites every `try` statement whose
//! handlers contain suspension points. A handler cannot be resumed into, so its code is
//! moved behind the protected block:
//!
//! ```text
//! try { B } catch (T e) { H }      caught = 0;
//!                                   try { B } catch (T stash) { caught = 1 }
//!                                   if (caught == 1) { e = (T) stash; H }
//!
//! try { B } finally { F }           pending = null; branch = 0;
//!                                   try { B' } catch (object pending) { }
//!                                   fin: F
//!                                   rethrow-captured pending
//!                                   if (branch == 1) { exit 1 } ...
//! ```
//!
//! `B'` replaces every jump leaving the region by `branch = k; goto fin`, with the return
//! value, if any, parked in a slot of its own. A `try/catch/finally` becomes the finally
//! rewrite around the (possibly rewritten) `try/catch`. Slots are wrap locals: always
//! hoisted, one set per region.

use std::collections::HashSet;

use crate::{
    compiler::{
        context::LoweringContext,
        events::EventKind,
        layout::{Field, FieldKind, Lifetime},
        pass::LoweringPass,
        regions::{HandlerKind, RegionId, RegionTree},
    },
    syntax::{Block, CatchClause, Expr, LocalId, LocalKind, Stmt, TryStmt, TypeRef},
    Result,
};

/// Region tree construction and rewrite of handlers containing awaits.
pub struct RegionPass;

impl LoweringPass for RegionPass {
    fn name(&self) -> &'static str {
        "regions"
    }

    fn should_run(&self, ctx: &LoweringContext<'_>) -> bool {
        let mut found = false;
        visit(&ctx.body, &mut |stmt| found |= matches!(stmt, Stmt::Try(_)));
        found
    }

    fn run(&self, ctx: &mut LoweringContext<'_>) -> Result<()> {
        let mut tree = RegionTree::new();
        build_tree(&ctx.body, None, &mut tree);
        tree.validate()?;
        ctx.regions = tree;

        let body = std::mem::take(&mut ctx.body);
        let mut rewriter = Rewriter { ctx: &mut *ctx, next: 0 };
        let body = rewriter.block(body)?;
        ctx.body = body;
        Ok(())
    }

    fn description(&self) -> &'static str {
        "Builds the exception-region tree and moves awaiting handlers out of their regions"
    }
}

/// Calls `f` on every statement of `block`, nested ones included.
pub(crate) fn visit(block: &Block, f: &mut impl FnMut(&Stmt)) {
    for stmt in &block.stmts {
        f(stmt);
        match stmt {
            Stmt::Block(inner) => visit(inner, f),
            Stmt::If {
                then, otherwise, ..
            } => {
                visit(then, f);
                if let Some(otherwise) = otherwise {
                    visit(otherwise, f);
                }
            }
            Stmt::While { body, .. } => visit(body, f),
            Stmt::Try(t) => {
                visit(&t.body, f);
                for catch in &t.catches {
                    visit(&catch.body, f);
                }
                if let Some(finally) = &t.finally {
                    visit(finally, f);
                }
            }
            _ => {}
        }
    }
}

/// Adds the regions of `block` in pre-order: protected block, catches, finally.
fn build_tree(block: &Block, parent: Option<RegionId>, tree: &mut RegionTree) {
    for stmt in &block.stmts {
        match stmt {
            Stmt::Block(inner) => build_tree(inner, parent, tree),
            Stmt::If {
                then, otherwise, ..
            } => {
                build_tree(then, parent, tree);
                if let Some(otherwise) = otherwise {
                    build_tree(otherwise, parent, tree);
                }
            }
            Stmt::While { body, .. } => build_tree(body, parent, tree),
            Stmt::Try(t) => {
                let mut handlers: Vec<HandlerKind> = t
                    .catches
                    .iter()
                    .map(|c| match c.filter {
                        Some(_) => HandlerKind::Filter(c.ty.clone()),
                        None => HandlerKind::Catch(c.ty.clone()),
                    })
                    .collect();
                if t.finally.is_some() {
                    handlers.push(HandlerKind::Finally);
                }
                let id = tree.add(parent, handlers);
                if let Some(region) = tree.get_mut(id) {
                    region.try_has_await = t.body.contains_await();
                    region.handler_has_await = t.catches.iter().any(|c| c.body.contains_await())
                        || t.finally.as_ref().is_some_and(Block::contains_await);
                }

                build_tree(&t.body, Some(id), tree);
                for catch in &t.catches {
                    build_tree(&catch.body, Some(id), tree);
                }
                if let Some(finally) = &t.finally {
                    build_tree(finally, Some(id), tree);
                }
            }
            _ => {}
        }
    }
}

struct Rewriter<'c, 'a> {
    ctx: &'c mut LoweringContext<'a>,
    /// Next region id in pre-order.
    next: u32,
}

impl Rewriter<'_, '_> {
    fn block(&mut self, block: Block) -> Result<Block> {
        let mut out = Vec::with_capacity(block.stmts.len());
        for stmt in block.stmts {
            out.push(self.stmt(stmt)?);
        }
        Ok(Block::new(out))
    }

    fn stmt(&mut self, stmt: Stmt) -> Result<Stmt> {
        Ok(match stmt {
            Stmt::Block(block) => Stmt::Block(self.block(block)?),
            Stmt::If {
                cond,
                then,
                otherwise,
            } => Stmt::If {
                cond,
                then: self.block(then)?,
                otherwise: match otherwise {
                    Some(block) => Some(self.block(block)?),
                    None => None,
                },
            },
            Stmt::While { cond, body } => Stmt::While {
                cond,
                body: self.block(body)?,
            },
            Stmt::Try(t) => self.try_stmt(t)?,
            other => other,
        })
    }

    fn try_stmt(&mut self, t: TryStmt) -> Result<Stmt> {
        let region = RegionId(self.next);
        self.next += 1;

        // Nested regions first, keeping the pre-order numbering.
        let body = self.block(t.body)?;
        let mut catches = Vec::with_capacity(t.catches.len());
        for catch in t.catches {
            catches.push(CatchClause {
                body: self.block(catch.body)?,
                ..catch
            });
        }
        let finally = match t.finally {
            Some(block) => Some(self.block(block)?),
            None => None,
        };

        let catches_await = catches.iter().any(|c| c.body.contains_await());
        let finally_awaits = finally.as_ref().is_some_and(Block::contains_await);
        if !catches_await && !finally_awaits {
            return Ok(Stmt::Try(TryStmt {
                body,
                catches,
                finally,
            }));
        }

        let mut stmts = if catches.is_empty() {
            body.stmts
        } else if catches_await {
            self.wrap_catches(region, body, catches)?
        } else {
            vec![Stmt::Try(TryStmt {
                body,
                catches,
                finally: None,
            })]
        };

        if let Some(finally) = finally {
            stmts = if finally_awaits {
                self.wrap_finally(region, stmts, finally)?
            } else {
                vec![Stmt::Try(TryStmt {
                    body: Block::new(stmts),
                    catches: Vec::new(),
                    finally: Some(finally),
                })]
            };
        }

        if let Some(r) = self.ctx.regions.get_mut(region) {
            r.wrapped = true;
        }
        self.ctx
            .record(EventKind::RegionWrapped)
            .location(region.index())
            .message(format!(
                "region {} rewritten ({})",
                region.0,
                match (catches_await, finally_awaits) {
                    (true, true) => "catch and finally await",
                    (true, false) => "catch awaits",
                    _ => "finally awaits",
                }
            ));
        Ok(Stmt::Block(Block::new(stmts)))
    }

    fn wrap_catches(
        &mut self,
        region: RegionId,
        body: Block,
        catches: Vec<CatchClause>,
    ) -> Result<Vec<Stmt>> {
        let caught = self.wrap_slot(region, TypeRef::Int32, "caught index")?;
        let stash = self.wrap_slot(region, TypeRef::Object, "caught exception")?;

        let mut stubs = Vec::with_capacity(catches.len());
        let mut handlers = Vec::with_capacity(catches.len());
        for (index, catch) in catches.into_iter().enumerate() {
            let k = index as i32 + 1;
            let mut stub = vec![Stmt::assign(caught, Expr::int(k))];
            let variable = if catch.filter.is_some() {
                // The filter reads the variable, so it is bound on catch entry.
                if let Some(variable) = catch.variable {
                    stub.insert(0, Stmt::assign(stash, Expr::local(variable)));
                }
                catch.variable.or(Some(stash))
            } else {
                Some(stash)
            };
            stubs.push(CatchClause {
                ty: catch.ty.clone(),
                variable,
                filter: catch.filter,
                body: Block::new(stub),
            });

            let mut handler = Vec::new();
            if let Some(variable) = catch.variable {
                handler.push(Stmt::assign(
                    variable,
                    Expr::cast(Expr::local(stash), catch.ty),
                ));
            }
            handler.extend(rethrow_captured(catch.body, stash).stmts);
            handlers.push(Stmt::if_then(
                Expr::eq(Expr::local(caught), Expr::int(k)),
                handler,
            ));
        }

        let mut out = vec![
            Stmt::assign(caught, Expr::int(0)),
            Stmt::Try(TryStmt {
                body,
                catches: stubs,
                finally: None,
            }),
        ];
        out.extend(handlers);
        if self.ctx.config.clear_reference_slots {
            out.push(Stmt::assign(stash, Expr::Null));
        }
        Ok(out)
    }

    fn wrap_finally(
        &mut self,
        region: RegionId,
        body: Vec<Stmt>,
        finally: Block,
    ) -> Result<Vec<Stmt>> {
        let pending = self.wrap_slot(region, TypeRef::Object, "pending exception")?;
        let branch = self.wrap_slot(region, TypeRef::Int32, "pending branch")?;
        let body = Block::new(body);

        let mut labels = HashSet::new();
        let mut returns = false;
        visit(&body, &mut |stmt| match stmt {
            Stmt::Label(name) => {
                labels.insert(name.clone());
            }
            Stmt::Return(_) => returns = true,
            _ => {}
        });
        let result = self.ctx.builder()?.result.clone();
        let ret_slot = if returns && !result.is_void() {
            Some(self.wrap_slot(region, result, "pending return value")?)
        } else {
            None
        };

        let mut exits = Exits {
            fin: format!("<>fin{}", region.0),
            branch,
            labels,
            ret_slot,
            exits: Vec::new(),
        };
        let body = exits.block(body, 0)?;

        let mut out = vec![
            Stmt::assign(pending, Expr::Null),
            Stmt::assign(branch, Expr::int(0)),
            Stmt::Try(TryStmt {
                body,
                catches: vec![CatchClause::new(TypeRef::Object, Some(pending), Vec::new())],
                finally: None,
            }),
            Stmt::Label(exits.fin.clone()),
        ];
        out.extend(finally.stmts);
        out.push(Stmt::RethrowCaptured(Expr::local(pending)));
        for (index, (_, exit)) in exits.exits.into_iter().enumerate() {
            out.push(Stmt::if_then(
                Expr::eq(Expr::local(branch), Expr::int(index as i32 + 1)),
                vec![exit],
            ));
        }
        Ok(out)
    }

    /// Declares a wrap local for `region` and gives it a field covering the region.
    fn wrap_slot(&mut self, region: RegionId, ty: TypeRef, role: &str) -> Result<LocalId> {
        let ordinal = self
            .ctx
            .locals
            .iter()
            .filter(|l| l.kind == LocalKind::Wrap)
            .count()
            + 1;
        let name = format!("<>7__wrap{ordinal}");
        let local = self.ctx.new_local(name.clone(), ty.clone(), LocalKind::Wrap);

        let (start, end) = self
            .ctx
            .try_spans
            .get(region.index())
            .copied()
            .ok_or_else(|| region_error!("No source span for region {}", region.0))?;
        let field = self.ctx.layout.push(Field {
            name: name.clone(),
            ty,
            kind: FieldKind::Wrap(local),
            lifetime: Lifetime::Interval { start, end },
        });
        self.ctx.storage.insert(local, field);

        for (state, &position) in self.ctx.point_positions.iter().enumerate() {
            if start < position && position < end {
                if let Some(point) = self.ctx.points.get_mut(state) {
                    point.live.push(field);
                    point.live.sort();
                }
            }
        }
        if let Some(r) = self.ctx.regions.get_mut(region) {
            r.wrap_slots.push(local);
        }
        self.ctx
            .record(EventKind::WrapSlotAllocated)
            .location(region.index())
            .message(format!("{name} holds the {role} of region {}", region.0));
        Ok(local)
    }
}

/// Replaces `throw;` of a moved handler by a rethrow of the stashed exception. Nested
/// catch handlers keep their own `throw;`.
fn rethrow_captured(block: Block, stash: LocalId) -> Block {
    let stmts = block
        .stmts
        .into_iter()
        .map(|stmt| match stmt {
            Stmt::Throw(None) => Stmt::RethrowCaptured(Expr::local(stash)),
            Stmt::Block(inner) => Stmt::Block(rethrow_captured(inner, stash)),
            Stmt::If {
                cond,
                then,
                otherwise,
            } => Stmt::If {
                cond,
                then: rethrow_captured(then, stash),
                otherwise: otherwise.map(|b| rethrow_captured(b, stash)),
            },
            Stmt::While { cond, body } => Stmt::While {
                cond,
                body: rethrow_captured(body, stash),
            },
            Stmt::Try(t) => Stmt::Try(TryStmt {
                body: rethrow_captured(t.body, stash),
                catches: t.catches,
                finally: t.finally.map(|b| rethrow_captured(b, stash)),
            }),
            other => other,
        })
        .collect();
    Block::new(stmts)
}

#[derive(PartialEq, Eq)]
enum Exit {
    Return,
    Break,
    Continue,
    Goto(String),
}

/// Turns jumps leaving a finally-protected block into pending branches.
struct Exits {
    fin: String,
    branch: LocalId,
    /// Labels defined inside the block; jumps to them stay local.
    labels: HashSet<String>,
    ret_slot: Option<LocalId>,
    exits: Vec<(Exit, Stmt)>,
}

impl Exits {
    fn block(&mut self, block: Block, loops: usize) -> Result<Block> {
        let mut out = Vec::with_capacity(block.stmts.len());
        for stmt in block.stmts {
            out.push(self.stmt(stmt, loops)?);
        }
        Ok(Block::new(out))
    }

    fn stmt(&mut self, stmt: Stmt, loops: usize) -> Result<Stmt> {
        Ok(match stmt {
            Stmt::Block(block) => Stmt::Block(self.block(block, loops)?),
            Stmt::If {
                cond,
                then,
                otherwise,
            } => Stmt::If {
                cond,
                then: self.block(then, loops)?,
                otherwise: match otherwise {
                    Some(block) => Some(self.block(block, loops)?),
                    None => None,
                },
            },
            Stmt::While { cond, body } => Stmt::While {
                cond,
                body: self.block(body, loops + 1)?,
            },
            Stmt::Try(t) => {
                let mut catches = Vec::with_capacity(t.catches.len());
                for catch in t.catches {
                    catches.push(CatchClause {
                        body: self.block(catch.body, loops)?,
                        ..catch
                    });
                }
                Stmt::Try(TryStmt {
                    body: self.block(t.body, loops)?,
                    catches,
                    finally: match t.finally {
                        Some(block) => Some(self.block(block, loops)?),
                        None => None,
                    },
                })
            }
            Stmt::Break if loops == 0 => self.jump(Exit::Break, Stmt::Break, None),
            Stmt::Continue if loops == 0 => self.jump(Exit::Continue, Stmt::Continue, None),
            Stmt::Goto(label) if !self.labels.contains(&label) => {
                self.jump(Exit::Goto(label.clone()), Stmt::Goto(label), None)
            }
            Stmt::Return(value) => {
                let store = match (value, self.ret_slot) {
                    (Some(value), Some(slot)) => Some(Stmt::assign(slot, value)),
                    (Some(_), None) => {
                        return Err(malformed_error!(
                            "Return with a value from a method without result"
                        ));
                    }
                    (None, _) => None,
                };
                let exit = Stmt::Return(self.ret_slot.map(Expr::local));
                self.jump(Exit::Return, exit, store)
            }
            other => other,
        })
    }

    fn jump(&mut self, key: Exit, exit: Stmt, store: Option<Stmt>) -> Stmt {
        let index = match self.exits.iter().position(|(k, _)| *k == key) {
            Some(index) => index,
            None => {
                self.exits.push((key, exit));
                self.exits.len() - 1
            }
        };
        let mut stmts: Vec<Stmt> = store.into_iter().collect();
        stmts.push(Stmt::assign(self.branch, Expr::int(index as i32 + 1)));
        stmts.push(Stmt::Goto(self.fin.clone()));
        Stmt::Block(Block::new(stmts))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        capabilities::CapabilityRegistry,
        compiler::passes::SynthesizePass,
        config::LoweringConfig,
        syntax::{AsyncMethodDescriptor, BinaryOp, MethodBuilder, ReturnShape},
    };

    fn yield_stmt() -> Stmt {
        Stmt::await_(Expr::call("Task.Yield", vec![], TypeRef::yield_awaitable()))
    }

    fn print(text: &str) -> Stmt {
        Stmt::Expr(Expr::call(
            "Console.WriteLine",
            vec![Expr::string(text)],
            TypeRef::Void,
        ))
    }

    fn run(method: &AsyncMethodDescriptor) -> (Block, RegionTree, usize, usize) {
        let config = LoweringConfig::release();
        let registry = CapabilityRegistry::new();
        let mut ctx = LoweringContext::new(method, &config, &registry);
        SynthesizePass.run(&mut ctx).unwrap();
        assert!(RegionPass.should_run(&ctx));
        RegionPass.run(&mut ctx).unwrap();
        let wraps = ctx.layout.count_tag("wrap");
        let wrapped = ctx.events.count_kind(EventKind::RegionWrapped);
        (ctx.body, ctx.regions, wraps, wrapped)
    }

    #[test]
    fn test_finally_with_await_is_moved() {
        let mut m = MethodBuilder::new("F", ReturnShape::TaskOf(TypeRef::Int32));
        m.push(Stmt::try_finally(
            vec![yield_stmt(), Stmt::Return(Some(Expr::int(3)))],
            vec![yield_stmt(), print("finally")],
        ));
        let (body, regions, wraps, wrapped) = run(&m.build());

        assert_eq!(regions.len(), 1);
        assert!(regions.get(RegionId(0)).is_some_and(|r| r.wrapped));
        // pending exception, pending branch, return value
        assert_eq!(wraps, 3);
        assert_eq!(wrapped, 1);

        let mut finally_awaits = false;
        let mut fin_label = false;
        visit(&body, &mut |s| match s {
            Stmt::Try(t) => {
                finally_awaits |= t.finally.as_ref().is_some_and(Block::contains_await);
            }
            Stmt::Label(name) => fin_label |= name == "<>fin0",
            _ => {}
        });
        assert!(!finally_awaits);
        assert!(fin_label);
    }

    #[test]
    fn test_catch_with_await_is_moved() {
        let mut m = MethodBuilder::new("F", ReturnShape::Task);
        let ex = m.local("ex", TypeRef::exception());
        m.push(Stmt::try_catch(
            vec![Stmt::Throw(Some(Expr::call(
                "Exception.New",
                vec![Expr::string("System.Exception"), Expr::string("boom")],
                TypeRef::exception(),
            )))],
            vec![CatchClause::new(
                TypeRef::exception(),
                Some(ex),
                vec![yield_stmt(), Stmt::Throw(None)],
            )],
        ));
        let (body, _, wraps, _) = run(&m.build());
        assert_eq!(wraps, 2);

        let mut handler_awaits = false;
        let mut rethrows = 0;
        let mut guards = 0;
        visit(&body, &mut |s| match s {
            Stmt::Try(t) => handler_awaits |= t.catches.iter().any(|c| c.body.contains_await()),
            Stmt::RethrowCaptured(_) => rethrows += 1,
            Stmt::If { cond, .. } if matches!(cond, Expr::Binary(BinaryOp::Eq, ..)) => guards += 1,
            _ => {}
        });
        assert!(!handler_awaits);
        assert_eq!(rethrows, 1);
        assert_eq!(guards, 1);
    }

    #[test]
    fn test_try_without_awaiting_handlers_is_kept() {
        let mut m = MethodBuilder::new("F", ReturnShape::Task);
        let source = Stmt::try_finally(vec![yield_stmt()], vec![print("done")]);
        m.push(source);
        let (body, regions, wraps, wrapped) = run(&m.build());
        assert_eq!(wraps, 0);
        assert_eq!(wrapped, 0);
        assert!(regions.get(RegionId(0)).is_some_and(|r| r.try_has_await));
        assert!(matches!(body.stmts[0], Stmt::Try(_)));
    }

    #[test]
    fn test_exits_become_pending_branches() {
        let branch = LocalId(7);
        let mut exits = Exits {
            fin: "<>fin0".into(),
            branch,
            labels: HashSet::from(["inner".to_string()]),
            ret_slot: None,
            exits: Vec::new(),
        };
        let body = Block::new(vec![
            Stmt::Goto("outer".into()),
            Stmt::Goto("inner".into()),
            Stmt::while_loop(Expr::Bool(true), vec![Stmt::Break]),
            Stmt::Break,
            Stmt::Goto("outer".into()),
            Stmt::Label("inner".into()),
        ]);
        let body = exits.block(body, 0).unwrap();

        assert_eq!(exits.exits.len(), 2);
        assert!(matches!(&body.stmts[1], Stmt::Goto(l) if l == "inner"));
        assert!(matches!(
            &body.stmts[2],
            Stmt::While { body, .. } if body.stmts == vec![Stmt::Break]
        ));
        let Stmt::Block(second) = &body.stmts[4] else {
            panic!("exit not rewritten");
        };
        assert_eq!(second.stmts[0], Stmt::assign(branch, Expr::int(1)));
        assert_eq!(second.stmts[1], Stmt::Goto("<>fin0".into()));
    }
}
