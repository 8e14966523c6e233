//! Liveness of locals across suspension points.
//!
//! Every statement, local reference and suspension point of the normalized body receives a
//! position in a single pre-order walk. A local's live interval runs from its first to its
//! last reference; when it is referenced inside a loop (or a region closed by a backward
//! `goto`) but declared before it, the interval is widened to the end of that loop, since
//! the next iteration may read what this one wrote. A local must be hoisted into a field
//! when a suspension point lies strictly inside its interval.

use std::collections::{BTreeSet, HashMap};

use crate::syntax::{Block, Expr, LocalId, Place, Stmt};

/// An inclusive range of positions.
pub(crate) type Span = (u32, u32);

/// Result of the liveness walk.
#[derive(Debug, Default)]
pub(crate) struct Liveness {
    /// First and last reference of each local, widened over loops.
    pub intervals: HashMap<LocalId, Span>,
    /// End of the scope declaring each local.
    pub scope_ends: HashMap<LocalId, u32>,
    /// Position of each suspension point, by state.
    pub points: Vec<u32>,
    /// Span of each `try` statement, in pre-order.
    pub trys: Vec<Span>,
    /// Parameters read or written.
    pub parameters: BTreeSet<u16>,
    /// Whether the receiver is referenced.
    pub uses_this: bool,
}

impl Liveness {
    /// Walks `body`, which must be normalized and contain `point_count` suspension points.
    pub(crate) fn analyze(body: &Block, point_count: usize) -> Self {
        let mut walker = Walker {
            position: 0,
            live: Liveness {
                points: vec![0; point_count],
                ..Liveness::default()
            },
            loops: Vec::new(),
            labels: HashMap::new(),
            gotos: Vec::new(),
        };
        walker.block(body);
        walker.finish()
    }

    /// Returns true if a suspension point lies strictly inside the interval of `local`.
    pub(crate) fn is_live_across_suspension(&self, local: LocalId) -> bool {
        self.intervals
            .get(&local)
            .is_some_and(|&(start, end)| self.points.iter().any(|&p| start < p && p < end))
    }

    /// Returns true if `position` lies strictly inside the interval of `local`.
    pub(crate) fn is_live_at(&self, local: LocalId, position: u32) -> bool {
        self.intervals
            .get(&local)
            .is_some_and(|&(start, end)| start < position && position < end)
    }

    /// Interval of `local` extended to the end of its declaring scope.
    pub(crate) fn extent(&self, local: LocalId) -> Option<Span> {
        let (start, end) = *self.intervals.get(&local)?;
        let scope_end = self.scope_ends.get(&local).copied().unwrap_or(end);
        Some((start, end.max(scope_end)))
    }
}

struct Walker {
    position: u32,
    live: Liveness,
    loops: Vec<Span>,
    labels: HashMap<String, u32>,
    gotos: Vec<(String, u32)>,
}

impl Walker {
    fn tick(&mut self) -> u32 {
        self.position += 1;
        self.position
    }

    fn touch(&mut self, local: LocalId) {
        let position = self.tick();
        self.live
            .intervals
            .entry(local)
            .and_modify(|(_, end)| *end = position)
            .or_insert((position, position));
    }

    fn place(&mut self, place: &Place) {
        match place {
            Place::Local(local) => self.touch(*local),
            Place::Param(index) => {
                self.live.parameters.insert(*index);
            }
        }
    }

    fn block(&mut self, block: &Block) {
        let mut declared = Vec::new();
        for stmt in &block.stmts {
            if let Stmt::Local { local, .. } = stmt {
                declared.push(*local);
            }
            self.stmt(stmt);
        }
        let end = self.tick();
        for local in declared {
            self.live.scope_ends.insert(local, end);
        }
    }

    fn stmt(&mut self, stmt: &Stmt) {
        self.tick();
        match stmt {
            Stmt::Block(block) => self.block(block),
            Stmt::Local { local, init } => {
                if let Some(init) = init {
                    self.expr(init);
                    self.touch(*local);
                }
            }
            Stmt::Assign { target, value } => {
                self.expr(value);
                self.place(target);
            }
            Stmt::Expr(expr) | Stmt::RethrowCaptured(expr) => self.expr(expr),
            Stmt::If {
                cond,
                then,
                otherwise,
            } => {
                self.expr(cond);
                self.block(then);
                if let Some(otherwise) = otherwise {
                    self.block(otherwise);
                }
            }
            Stmt::While { cond, body } => {
                let start = self.position;
                self.expr(cond);
                self.block(body);
                let end = self.tick();
                self.loops.push((start, end));
            }
            Stmt::Label(name) => {
                self.labels.insert(name.clone(), self.position);
            }
            Stmt::Goto(name) => self.gotos.push((name.clone(), self.position)),
            Stmt::Return(value) | Stmt::Throw(value) => {
                if let Some(value) = value {
                    self.expr(value);
                }
            }
            Stmt::Try(t) => {
                let index = self.live.trys.len();
                self.live.trys.push((0, 0));
                let start = self.position;
                self.block(&t.body);
                for catch in &t.catches {
                    self.tick();
                    // The exception is stored into the variable on handler entry.
                    if let Some(variable) = catch.variable {
                        self.touch(variable);
                    }
                    if let Some(filter) = &catch.filter {
                        self.expr(filter);
                    }
                    self.block(&catch.body);
                }
                if let Some(finally) = &t.finally {
                    self.block(finally);
                }
                let end = self.tick();
                self.live.trys[index] = (start, end);
            }
            Stmt::Await {
                operand,
                target,
                point,
            } => {
                self.expr(operand);
                let position = self.tick();
                if let Some(slot) = self.live.points.get_mut(*point as usize) {
                    *slot = position;
                }
                if let Some(target) = target {
                    self.place(target);
                }
            }
            Stmt::Break | Stmt::Continue => {}
        }
    }

    fn expr(&mut self, expr: &Expr) {
        match expr {
            Expr::Local(local) => self.touch(*local),
            Expr::Param(index) => {
                self.live.parameters.insert(*index);
            }
            Expr::This => self.live.uses_this = true,
            Expr::Int(_) | Expr::Bool(_) | Expr::Str(_) | Expr::Null => {}
            Expr::Binary(_, left, right) | Expr::AndAlso(left, right) | Expr::OrElse(left, right) => {
                self.expr(left);
                self.expr(right);
            }
            Expr::Conditional(cond, then, otherwise) => {
                self.expr(cond);
                self.expr(then);
                self.expr(otherwise);
            }
            Expr::Unary(_, operand)
            | Expr::Await(operand)
            | Expr::IsInst(operand, _)
            | Expr::Cast(operand, _) => self.expr(operand),
            Expr::Call { args, .. } => args.iter().for_each(|a| self.expr(a)),
        }
    }

    fn finish(mut self) -> Liveness {
        for (name, at) in &self.gotos {
            if let Some(&label) = self.labels.get(name) {
                if label < *at {
                    self.loops.push((label, *at));
                }
            }
        }

        // Widen to a fixpoint: widening over one loop can make an interval reach into
        // an enclosing or following one.
        let mut changed = true;
        while changed {
            changed = false;
            for (start, end) in self.live.intervals.values_mut() {
                for &(loop_start, loop_end) in &self.loops {
                    if *start < loop_start && *end >= loop_start && *end < loop_end {
                        *end = loop_end;
                        changed = true;
                    }
                }
            }
        }
        self.live
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::syntax::TypeRef;

    fn await_stmt(point: u32) -> Stmt {
        Stmt::Await {
            operand: Expr::call("T", vec![], TypeRef::Task),
            target: None,
            point,
        }
    }

    #[test]
    fn test_local_used_across_await_is_live() {
        let x = LocalId(0);
        let y = LocalId(1);
        let body = Block::new(vec![
            Stmt::declare(x, Expr::int(1)),
            Stmt::declare(y, Expr::int(2)),
            Stmt::Expr(Expr::call("Use", vec![Expr::local(y)], TypeRef::Void)),
            await_stmt(0),
            Stmt::Expr(Expr::call("Use", vec![Expr::local(x)], TypeRef::Void)),
        ]);
        let live = Liveness::analyze(&body, 1);
        assert!(live.is_live_across_suspension(x));
        assert!(!live.is_live_across_suspension(y));
    }

    #[test]
    fn test_loop_widening() {
        // x = 0; while (c) { Use(x); await; x = 1; }
        let x = LocalId(0);
        let body = Block::new(vec![
            Stmt::declare(x, Expr::int(0)),
            Stmt::while_loop(
                Expr::Bool(true),
                vec![
                    Stmt::Expr(Expr::call("Use", vec![Expr::local(x)], TypeRef::Void)),
                    Stmt::assign(x, Expr::int(1)),
                    await_stmt(0),
                ],
            ),
        ]);
        let live = Liveness::analyze(&body, 1);
        assert!(live.is_live_across_suspension(x));
    }

    #[test]
    fn test_backward_goto_widening() {
        let x = LocalId(0);
        let body = Block::new(vec![
            Stmt::declare(x, Expr::int(0)),
            Stmt::Label("top".into()),
            Stmt::Expr(Expr::call("Use", vec![Expr::local(x)], TypeRef::Void)),
            await_stmt(0),
            Stmt::if_then(Expr::Bool(true), vec![Stmt::Goto("top".into())]),
        ]);
        let live = Liveness::analyze(&body, 1);
        assert!(live.is_live_across_suspension(x));
    }

    #[test]
    fn test_catch_variable_written_on_entry() {
        let e = LocalId(0);
        let body = Block::new(vec![Stmt::try_catch(
            vec![],
            vec![crate::syntax::CatchClause::new(
                TypeRef::exception(),
                Some(e),
                vec![
                    await_stmt(0),
                    Stmt::Expr(Expr::call("Use", vec![Expr::local(e)], TypeRef::Void)),
                ],
            )],
        )]);
        let live = Liveness::analyze(&body, 1);
        assert!(live.is_live_across_suspension(e));
        assert_eq!(live.trys.len(), 1);
        assert!(live.trys[0].0 < live.points[0] && live.points[0] < live.trys[0].1);
    }

    #[test]
    fn test_parameters_and_this() {
        let body = Block::new(vec![Stmt::Expr(Expr::call(
            "Use",
            vec![Expr::Param(1), Expr::This],
            TypeRef::Void,
        ))]);
        let live = Liveness::analyze(&body, 0);
        assert!(live.uses_this);
        assert_eq!(live.parameters.iter().copied().collect::<Vec<_>>(), vec![1]);
    }

    #[test]
    fn test_extent_reaches_scope_end() {
        let x = LocalId(0);
        let body = Block::new(vec![Stmt::Block(Block::new(vec![
            Stmt::declare(x, Expr::int(0)),
            Stmt::Expr(Expr::call("Use", vec![Expr::local(x)], TypeRef::Void)),
            Stmt::Expr(Expr::call("Other", vec![], TypeRef::Void)),
        ]))]);
        let live = Liveness::analyze(&body, 0);
        let (_, last_use) = live.intervals[&x];
        let (_, extent_end) = live.extent(x).unwrap_or_default();
        assert!(extent_end > last_use);
    }
}
