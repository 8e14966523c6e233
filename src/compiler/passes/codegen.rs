//! Pass 3: suspension-point rewriting and `MoveNext` emission.
//!
//! The emitted body has a fixed frame:
//!
//! ```text
//!     ldfld  <>1__state ; stloc.0
//!     .try {
//!         ldloc.0 ; switch (resume labels / outermost try entries)
//!         <body>
//!         leave SETRESULT
//!     } catch System.Exception {
//!         state = -2 ; builder.SetException(ex) ; leave RET
//!     }
//! SETRESULT:  state = -2 ; builder.SetResult(result)
//! RET:        ret
//! ```
//!
//! Resumption jumps to the entry of the outermost `try` enclosing the suspension point,
//! where a nested dispatch continues one level deeper; control only ever enters a
//! protected block at its first instruction.

use std::collections::HashMap;

use crate::{
    assembly::{FieldId, Instruction, InstructionAssembler, Label, MethodBody},
    capabilities::BuilderMember,
    compiler::{context::LoweringContext, events::EventKind, pass::LoweringPass},
    syntax::{
        BinaryOp, Block, CatchClause, Expr, LocalId, LocalKind, Place, Stmt, TryStmt, TypeRef,
        UnaryOp,
    },
    Result,
};

/// Emits `MoveNext` with the state dispatch and the await sequences.
pub struct SuspensionPass;

impl LoweringPass for SuspensionPass {
    fn name(&self) -> &'static str {
        "suspension"
    }

    fn run(&self, ctx: &mut LoweringContext<'_>) -> Result<()> {
        let body = Emitter::new(ctx)?.emit()?;
        ctx.move_next = Some(body);
        Ok(())
    }

    fn description(&self) -> &'static str {
        "Emits MoveNext: state dispatch, suspend and resume sequences, guarded finallys"
    }
}

/// Part of a `try` statement the emitter is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Part {
    Body,
    Catch,
    Finally,
}

/// One level of protected-region nesting: the `try` (by emission order) and the part.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Segment {
    try_index: usize,
    part: Part,
}

struct Loop {
    top: Label,
    end: Label,
    depth: usize,
    scopes: usize,
}

/// A block being emitted and the locals it has declared so far.
struct Scope {
    block: *const Block,
    locals: Vec<LocalId>,
}

struct Emitter<'c, 'a> {
    ctx: &'c LoweringContext<'a>,
    asm: InstructionAssembler,
    result_local: Option<u16>,
    result_type: TypeRef,
    il_locals: HashMap<LocalId, u16>,
    awaiter_locals: HashMap<TypeRef, u16>,
    labels: HashMap<String, Label>,
    label_paths: HashMap<String, Vec<Segment>>,
    label_scopes: HashMap<String, Vec<*const Block>>,
    try_entries: Vec<Label>,
    try_awaits: Vec<bool>,
    point_paths: Vec<Vec<Segment>>,
    resume: Vec<Label>,
    path: Vec<Segment>,
    loops: Vec<Loop>,
    scopes: Vec<Scope>,
    next_try: usize,
    ret: Label,
    set_result: Label,
}

const STATE_LOCAL: u16 = 0;

impl<'c, 'a> Emitter<'c, 'a> {
    fn new(ctx: &'c LoweringContext<'a>) -> Result<Self> {
        let result_type = ctx.builder()?.result.clone();
        let mut asm = InstructionAssembler::new();
        asm.declare_local(TypeRef::Int32, None);
        let result_local =
            (!result_type.is_void()).then(|| asm.declare_local(result_type.clone(), None));
        let resume = (0..ctx.points.len()).map(|_| asm.new_label()).collect();
        let ret = asm.new_label();
        let set_result = asm.new_label();
        Ok(Self {
            ctx,
            asm,
            result_local,
            result_type,
            il_locals: HashMap::new(),
            awaiter_locals: HashMap::new(),
            labels: HashMap::new(),
            label_paths: HashMap::new(),
            label_scopes: HashMap::new(),
            try_entries: Vec::new(),
            try_awaits: Vec::new(),
            point_paths: vec![Vec::new(); ctx.points.len()],
            resume,
            path: Vec::new(),
            loops: Vec::new(),
            scopes: Vec::new(),
            next_try: 0,
            ret,
            set_result,
        })
    }

    fn emit(mut self) -> Result<MethodBody> {
        let ctx = self.ctx;
        let mut path = Vec::new();
        let mut blocks = Vec::new();
        self.scan(&ctx.body, &mut path, &mut blocks)?;

        let state = ctx.layout.state();
        self.asm.emit(Instruction::Ldfld(state))?;
        self.asm.emit(Instruction::Stloc(STATE_LOCAL))?;

        self.asm.begin_try()?;
        if !self.resume.is_empty() {
            let targets = (0..self.resume.len())
                .map(|s| match self.point_paths[s].first() {
                    Some(segment) => self.try_entries[segment.try_index],
                    None => self.resume[s],
                })
                .collect();
            self.asm.emit(Instruction::Ldloc(STATE_LOCAL))?;
            self.asm.emit(Instruction::Switch(targets))?;
            ctx.record(EventKind::DispatchEmitted)
                .message(format!("method entry dispatch over {} states", self.resume.len()));
        }
        self.block(&ctx.body)?;
        if !self.asm.is_unreachable() {
            self.asm.emit(Instruction::Leave(self.set_result))?;
        }

        self.asm.begin_catch(TypeRef::exception())?;
        let ex = self.asm.declare_local(TypeRef::exception(), None);
        self.asm.emit(Instruction::Stloc(ex))?;
        self.asm.emit(Instruction::LdcI4(-2))?;
        self.asm.emit(Instruction::Stfld(state))?;
        self.asm.emit(Instruction::Ldloc(ex))?;
        self.asm.emit(Instruction::Builder {
            member: BuilderMember::SetException,
            args: 1,
        })?;
        self.asm.emit(Instruction::Leave(self.ret))?;
        self.asm.end_try()?;

        self.asm.mark(self.set_result)?;
        self.asm.emit(Instruction::LdcI4(-2))?;
        self.asm.emit(Instruction::Stfld(state))?;
        let args = match self.result_local {
            Some(local) => {
                self.asm.emit(Instruction::Ldloc(local))?;
                1
            }
            None => 0,
        };
        self.asm.emit(Instruction::Builder {
            member: BuilderMember::SetResult,
            args,
        })?;
        self.asm.mark(self.ret)?;
        self.asm.emit(Instruction::Ret)?;

        self.asm
            .finish(format!("{}::MoveNext", ctx.layout.type_name))
    }

    // ── Pre-scan ────────────────────────────────────────────────────────

    /// Allocates labels and try entries and records the region path of every label and
    /// suspension point, walking in emission order. `blocks` holds the enclosing blocks.
    fn scan(
        &mut self,
        block: &Block,
        path: &mut Vec<Segment>,
        blocks: &mut Vec<*const Block>,
    ) -> Result<()> {
        blocks.push(std::ptr::from_ref(block));
        for stmt in &block.stmts {
            match stmt {
                Stmt::Block(inner) => self.scan(inner, path, blocks)?,
                Stmt::If {
                    then, otherwise, ..
                } => {
                    self.scan(then, path, blocks)?;
                    if let Some(otherwise) = otherwise {
                        self.scan(otherwise, path, blocks)?;
                    }
                }
                Stmt::While { body, .. } => self.scan(body, path, blocks)?,
                Stmt::Label(name) => {
                    if self.labels.contains_key(name) {
                        return Err(malformed_error!("Label {} defined twice", name));
                    }
                    let label = self.asm.new_label();
                    self.labels.insert(name.clone(), label);
                    self.label_paths.insert(name.clone(), path.clone());
                    self.label_scopes.insert(name.clone(), blocks.clone());
                }
                Stmt::Await { point, .. } => {
                    if let Some(segment) = path.iter().find(|s| s.part != Part::Body) {
                        return Err(region_error!(
                            "Suspension point {} inside a handler of try {}",
                            point,
                            segment.try_index
                        ));
                    }
                    for segment in path.iter() {
                        self.try_awaits[segment.try_index] = true;
                    }
                    let slot = self
                        .point_paths
                        .get_mut(*point as usize)
                        .ok_or_else(|| malformed_error!("Unknown suspension point {}", point))?;
                    *slot = path.clone();
                }
                Stmt::Try(t) => {
                    let index = self.try_entries.len();
                    let entry = self.asm.new_label();
                    self.try_entries.push(entry);
                    self.try_awaits.push(false);

                    path.push(Segment {
                        try_index: index,
                        part: Part::Body,
                    });
                    self.scan(&t.body, path, blocks)?;
                    path.pop();
                    for catch in &t.catches {
                        path.push(Segment {
                            try_index: index,
                            part: Part::Catch,
                        });
                        self.scan(&catch.body, path, blocks)?;
                        path.pop();
                    }
                    if let Some(finally) = &t.finally {
                        path.push(Segment {
                            try_index: index,
                            part: Part::Finally,
                        });
                        self.scan(finally, path, blocks)?;
                        path.pop();
                    }
                }
                _ => {}
            }
        }
        blocks.pop();
        Ok(())
    }

    // ── Statements ──────────────────────────────────────────────────────

    fn block(&mut self, block: &Block) -> Result<()> {
        self.scopes.push(Scope {
            block: std::ptr::from_ref(block),
            locals: Vec::new(),
        });
        for stmt in &block.stmts {
            if let (Stmt::Local { local, .. }, Some(scope)) = (stmt, self.scopes.last_mut()) {
                scope.locals.push(*local);
            }
            self.stmt(stmt)?;
        }

        let declared = self.scopes.pop().map(|s| s.locals).unwrap_or_default();
        if !self.asm.is_unreachable() {
            self.clear_locals(&declared)?;
        }
        Ok(())
    }

    fn stmt(&mut self, stmt: &Stmt) -> Result<()> {
        match stmt {
            Stmt::Block(block) => self.block(block)?,
            Stmt::Local { local, init } => {
                if let Some(init) = init {
                    self.expr(init)?;
                    self.store(Place::Local(*local))?;
                    self.clear_spills(init)?;
                }
            }
            Stmt::Assign { target, value } => {
                self.expr(value)?;
                self.store(*target)?;
                self.clear_spills(value)?;
            }
            Stmt::Expr(expr) => {
                self.expr(expr)?;
                if !self.ctx.type_of(expr)?.is_void() {
                    self.asm.emit(Instruction::Pop)?;
                }
                self.clear_spills(expr)?;
            }
            Stmt::If {
                cond,
                then,
                otherwise,
            } => {
                let otherwise_label = self.asm.new_label();
                self.expr(cond)?;
                self.asm.emit(Instruction::Brfalse(otherwise_label))?;
                self.block(then)?;
                match otherwise {
                    Some(otherwise) => {
                        let end = self.asm.new_label();
                        if !self.asm.is_unreachable() {
                            self.asm.emit(Instruction::Br(end))?;
                        }
                        self.asm.mark(otherwise_label)?;
                        self.block(otherwise)?;
                        self.asm.mark(end)?;
                    }
                    None => self.asm.mark(otherwise_label)?,
                }
            }
            Stmt::While { cond, body } => {
                let top = self.asm.new_label();
                let end = self.asm.new_label();
                self.asm.mark(top)?;
                if *cond != Expr::Bool(true) {
                    self.expr(cond)?;
                    self.asm.emit(Instruction::Brfalse(end))?;
                }
                self.loops.push(Loop {
                    top,
                    end,
                    depth: self.path.len(),
                    scopes: self.scopes.len(),
                });
                self.block(body)?;
                self.loops.pop();
                if !self.asm.is_unreachable() {
                    self.asm.emit(Instruction::Br(top))?;
                }
                self.asm.mark(end)?;
            }
            Stmt::Break | Stmt::Continue => {
                let (target, depth, floor) = match self.loops.last() {
                    Some(l) if matches!(stmt, Stmt::Break) => (l.end, l.depth, l.scopes),
                    Some(l) => (l.top, l.depth, l.scopes),
                    None => return Err(malformed_error!("break or continue outside of a loop")),
                };
                self.clear_exited(floor, depth)?;
                self.jump(target, depth)?;
            }
            Stmt::Label(name) => {
                let label = self.user_label(name)?;
                self.asm.mark(label)?;
            }
            Stmt::Goto(name) => {
                let label = self.user_label(name)?;
                let target_path = self.label_paths.get(name).cloned().unwrap_or_default();
                if !self.path.starts_with(&target_path) {
                    return Err(malformed_error!("goto {} enters a protected region", name));
                }
                let floor = match self.label_scopes.get(name) {
                    Some(blocks) => self
                        .scopes
                        .iter()
                        .zip(blocks)
                        .take_while(|(scope, block)| std::ptr::eq(scope.block, **block))
                        .count(),
                    None => self.scopes.len(),
                };
                self.clear_exited(floor, target_path.len())?;
                self.jump(label, target_path.len())?;
            }
            Stmt::Return(value) => {
                match (value, self.result_local) {
                    (Some(value), Some(local)) => {
                        self.expr(value)?;
                        self.asm.emit(Instruction::Stloc(local))?;
                    }
                    (None, None) => {}
                    (Some(_), None) => {
                        return Err(malformed_error!(
                            "{} returns a value but has no result",
                            self.ctx.method.name
                        ));
                    }
                    (None, Some(_)) => {
                        return Err(malformed_error!(
                            "{} must return a {}",
                            self.ctx.method.name,
                            self.result_type
                        ));
                    }
                }
                self.clear_exited(0, 0)?;
                self.jump(self.set_result, 0)?;
            }
            Stmt::Throw(Some(value)) => {
                self.expr(value)?;
                self.asm.emit(Instruction::Throw)?;
            }
            Stmt::Throw(None) => {
                let handler = self.path.iter().rev().find(|s| s.part != Part::Body);
                if handler.map(|s| s.part) != Some(Part::Catch) {
                    return Err(malformed_error!("throw; outside of a catch handler"));
                }
                self.asm.emit(Instruction::Rethrow)?;
            }
            Stmt::Try(t) => self.try_stmt(t)?,
            Stmt::Await {
                operand,
                target,
                point,
            } => {
                self.await_point(operand, *target, *point)?;
                self.clear_spills(operand)?;
            }
            Stmt::RethrowCaptured(value) => self.rethrow_captured(value)?,
        }
        Ok(())
    }

    fn try_stmt(&mut self, t: &TryStmt) -> Result<()> {
        let index = self.next_try;
        self.next_try += 1;
        let entry = self.try_entries[index];
        let end = self.asm.new_label();
        let has_catches = !t.catches.is_empty();

        self.asm.mark(entry)?;
        if t.finally.is_some() {
            self.asm.begin_try()?;
        }
        if has_catches {
            self.asm.begin_try()?;
        }

        self.path.push(Segment {
            try_index: index,
            part: Part::Body,
        });
        if self.try_awaits[index] {
            self.nested_dispatch(index)?;
        }
        self.block(&t.body)?;
        if !self.asm.is_unreachable() {
            self.asm.emit(Instruction::Leave(end))?;
        }
        self.path.pop();

        for catch in &t.catches {
            self.path.push(Segment {
                try_index: index,
                part: Part::Catch,
            });
            self.catch_clause(catch)?;
            if !self.asm.is_unreachable() {
                self.asm.emit(Instruction::Leave(end))?;
            }
            self.path.pop();
        }
        if has_catches {
            self.asm.end_try()?;
        }

        if let Some(finally) = &t.finally {
            self.path.push(Segment {
                try_index: index,
                part: Part::Finally,
            });
            self.asm.begin_finally()?;
            // Suspending leaves through this handler; only run it for real exits.
            let skip = self.try_awaits[index].then(|| self.asm.new_label());
            if let Some(skip) = skip {
                self.asm.emit(Instruction::Ldloc(STATE_LOCAL))?;
                self.asm.emit(Instruction::LdcI4(0))?;
                self.asm.emit(Instruction::Bge(skip))?;
            }
            self.block(finally)?;
            if let Some(skip) = skip {
                self.asm.mark(skip)?;
            }
            self.asm.emit(Instruction::Endfinally)?;
            self.asm.end_try()?;
            self.path.pop();
        }

        self.asm.mark(end)
    }

    fn catch_clause(&mut self, catch: &CatchClause) -> Result<()> {
        match &catch.filter {
            Some(filter) => {
                let take = self.asm.new_label();
                let decide = self.asm.new_label();
                self.asm.begin_filter()?;
                self.asm.emit(Instruction::IsInst(catch.ty.clone()))?;
                self.asm.emit(Instruction::Dup)?;
                self.asm.emit(Instruction::Brtrue(take))?;
                self.asm.emit(Instruction::Pop)?;
                self.asm.emit(Instruction::LdcI4(0))?;
                self.asm.emit(Instruction::Br(decide))?;
                self.asm.mark(take)?;
                self.bind_exception(catch.variable)?;
                self.expr(filter)?;
                self.asm.mark(decide)?;
                self.asm.emit(Instruction::Endfilter)?;

                self.asm.begin_filter_handler()?;
                self.asm.emit(Instruction::Pop)?;
            }
            None => {
                self.asm.begin_catch(catch.ty.clone())?;
                self.bind_exception(catch.variable)?;
            }
        }
        self.block(&catch.body)
    }

    fn bind_exception(&mut self, variable: Option<LocalId>) -> Result<()> {
        match variable {
            Some(local) => self.store(Place::Local(local)),
            None => self.asm.emit(Instruction::Pop),
        }
    }

    fn dispatch_instr(&mut self, state: usize, target: Label) -> Result<()> {
        self.asm.emit(Instruction::Ldloc(STATE_LOCAL))?;
        self.asm.emit(Instruction::LdcI4(state as i32))?;
        self.asm.emit(Instruction::Beq(target))
    }

    /// Dispatch at the entry of try `index` for the states suspended inside it.
    fn nested_dispatch(&mut self, index: usize) -> Result<()> {
        let depth = self.path.len();
        let mut count = 0;
        for state in 0..self.point_paths.len() {
            let path = &self.point_paths[state];
            if path.len() < depth || path[..depth] != self.path[..] {
                continue;
            }
            let target = match path.get(depth) {
                Some(segment) => self.try_entries[segment.try_index],
                None => self.resume[state],
            };
            self.dispatch_instr(state, target)?;
            count += 1;
        }
        self.ctx
            .record(EventKind::DispatchEmitted)
            .location(index)
            .message(format!("dispatch over {count} states at entry of try {index}"));
        Ok(())
    }

    fn await_point(&mut self, operand: &Expr, target: Option<Place>, point: u32) -> Result<()> {
        let ctx = self.ctx;
        let state = point as usize;
        let p = ctx
            .points
            .get(state)
            .ok_or_else(|| malformed_error!("Unknown suspension point {}", point))?;
        let awaiter = self.awaiter_local(&p.awaiter);
        let done = self.asm.new_label();
        let state_field = ctx.layout.state();

        self.expr(operand)?;
        self.asm.emit(Instruction::GetAwaiter {
            awaitable: p.awaitable.clone(),
            awaiter: p.awaiter.clone(),
        })?;
        self.asm.emit(Instruction::Stloc(awaiter))?;
        self.asm.emit(Instruction::Ldloc(awaiter))?;
        self.asm.emit(Instruction::IsCompleted(p.awaiter.clone()))?;
        self.asm.emit(Instruction::Brtrue(done))?;

        // Suspend.
        self.asm.emit(Instruction::LdcI4(point as i32))?;
        self.asm.emit(Instruction::Dup)?;
        self.asm.emit(Instruction::Stloc(STATE_LOCAL))?;
        self.asm.emit(Instruction::Stfld(state_field))?;
        self.asm.emit(Instruction::Ldloc(awaiter))?;
        self.asm.emit(Instruction::Stfld(p.awaiter_slot))?;
        self.asm.emit(Instruction::Ldloc(awaiter))?;
        self.asm.emit(Instruction::Builder {
            member: p.completion,
            args: 1,
        })?;
        self.asm.emit(Instruction::Leave(self.ret))?;

        // Resume.
        self.asm.mark(self.resume[state])?;
        self.asm.emit(Instruction::Ldfld(p.awaiter_slot))?;
        self.asm.emit(Instruction::Stloc(awaiter))?;
        self.asm.emit(Instruction::ClearField(p.awaiter_slot))?;
        self.asm.emit(Instruction::LdcI4(-1))?;
        self.asm.emit(Instruction::Dup)?;
        self.asm.emit(Instruction::Stloc(STATE_LOCAL))?;
        self.asm.emit(Instruction::Stfld(state_field))?;

        self.asm.mark(done)?;
        self.asm.emit(Instruction::Ldloc(awaiter))?;
        self.asm.emit(Instruction::GetResult {
            awaiter: p.awaiter.clone(),
            result: p.result.clone(),
        })?;
        match target {
            Some(place) => self.store(place)?,
            None if !p.result.is_void() => self.asm.emit(Instruction::Pop)?,
            None => {}
        }

        ctx.record(EventKind::AwaitRewritten)
            .location(state)
            .message(format!("state {point}: await of {}", p.awaitable));
        Ok(())
    }

    /// Null: nothing. Exception: rethrow keeping its trace. Anything else: raw throw.
    fn rethrow_captured(&mut self, value: &Expr) -> Result<()> {
        let none = self.asm.new_label();
        let raw = self.asm.new_label();
        let done = self.asm.new_label();
        self.expr(value)?;
        self.asm.emit(Instruction::Dup)?;
        self.asm.emit(Instruction::Brfalse(none))?;
        self.asm.emit(Instruction::Dup)?;
        self.asm.emit(Instruction::IsInst(TypeRef::exception()))?;
        self.asm.emit(Instruction::Brfalse(raw))?;
        self.asm.emit(Instruction::Castclass(TypeRef::exception()))?;
        self.asm.emit(Instruction::CaptureThrow)?;
        self.asm.mark(raw)?;
        self.asm.emit(Instruction::Throw)?;
        self.asm.mark(none)?;
        self.asm.emit(Instruction::Pop)?;
        self.asm.mark(done)
    }

    /// Branches to `target`, which lies `depth` protected levels deep.
    fn jump(&mut self, target: Label, depth: usize) -> Result<()> {
        let crossed = self.path.get(depth..).unwrap_or_default();
        if crossed.iter().any(|s| s.part == Part::Finally) {
            return Err(malformed_error!("Control cannot leave the body of a finally clause"));
        }
        // SETRESULT lies outside the protected method body.
        if crossed.is_empty() && target != self.set_result {
            self.asm.emit(Instruction::Br(target))
        } else {
            self.asm.emit(Instruction::Leave(target))
        }
    }

    // ── Expressions ─────────────────────────────────────────────────────

    fn expr(&mut self, expr: &Expr) -> Result<()> {
        match expr {
            Expr::Int(value) => self.asm.emit(Instruction::LdcI4(*value)),
            Expr::Bool(value) => self.asm.emit(Instruction::LdcI4(i32::from(*value))),
            Expr::Str(value) => self.asm.emit(Instruction::Ldstr(value.clone())),
            Expr::Null => self.asm.emit(Instruction::Ldnull),
            Expr::Local(local) => match self.ctx.storage.get(local) {
                Some(&field) => self.asm.emit(Instruction::Ldfld(field)),
                None => {
                    let slot = self.il_local(*local)?;
                    self.asm.emit(Instruction::Ldloc(slot))
                }
            },
            Expr::Param(index) => {
                let field = self.parameter(*index)?;
                self.asm.emit(Instruction::Ldfld(field))
            }
            Expr::This => {
                let field = self.ctx.this_field.ok_or_else(|| {
                    malformed_error!("Receiver of {} is not hoisted", self.ctx.method.name)
                })?;
                self.asm.emit(Instruction::Ldfld(field))
            }
            Expr::Binary(op, left, right) => {
                self.expr(left)?;
                self.expr(right)?;
                self.binary(*op, expr)
            }
            Expr::Unary(UnaryOp::Neg, operand) => {
                self.expr(operand)?;
                self.asm.emit(Instruction::Neg)
            }
            Expr::Unary(UnaryOp::Not, operand) => {
                self.expr(operand)?;
                self.asm.emit(Instruction::LdcI4(0))?;
                self.asm.emit(Instruction::Ceq)
            }
            Expr::AndAlso(left, right) => {
                let short = self.asm.new_label();
                let end = self.asm.new_label();
                self.expr(left)?;
                self.asm.emit(Instruction::Brfalse(short))?;
                self.expr(right)?;
                self.asm.emit(Instruction::Br(end))?;
                self.asm.mark(short)?;
                self.asm.emit(Instruction::LdcI4(0))?;
                self.asm.mark(end)
            }
            Expr::OrElse(left, right) => {
                let short = self.asm.new_label();
                let end = self.asm.new_label();
                self.expr(left)?;
                self.asm.emit(Instruction::Brtrue(short))?;
                self.expr(right)?;
                self.asm.emit(Instruction::Br(end))?;
                self.asm.mark(short)?;
                self.asm.emit(Instruction::LdcI4(1))?;
                self.asm.mark(end)
            }
            Expr::Conditional(cond, then, otherwise) => {
                let other = self.asm.new_label();
                let end = self.asm.new_label();
                self.expr(cond)?;
                self.asm.emit(Instruction::Brfalse(other))?;
                self.expr(then)?;
                self.asm.emit(Instruction::Br(end))?;
                self.asm.mark(other)?;
                self.expr(otherwise)?;
                self.asm.mark(end)
            }
            Expr::Call { name, args, ty } => {
                for arg in args {
                    self.expr(arg)?;
                }
                self.asm.emit(Instruction::Call {
                    name: name.clone(),
                    argc: args.len() as u16,
                    ty: ty.clone(),
                })
            }
            Expr::Await(_) => Err(malformed_error!(
                "Await left in an expression of {}",
                self.ctx.method.name
            )),
            Expr::IsInst(operand, ty) => {
                self.expr(operand)?;
                self.asm.emit(Instruction::IsInst(ty.clone()))
            }
            Expr::Cast(operand, ty) => {
                self.expr(operand)?;
                self.asm.emit(Instruction::Castclass(ty.clone()))
            }
        }
    }

    fn binary(&mut self, op: BinaryOp, expr: &Expr) -> Result<()> {
        let negate = |asm: &mut InstructionAssembler, compare: Instruction| -> Result<()> {
            asm.emit(compare)?;
            asm.emit(Instruction::LdcI4(0))?;
            asm.emit(Instruction::Ceq)
        };
        match op {
            BinaryOp::Add if self.ctx.type_of(expr)? == TypeRef::String => {
                self.asm.emit(Instruction::Call {
                    name: "string.Concat".to_string(),
                    argc: 2,
                    ty: TypeRef::String,
                })
            }
            BinaryOp::Add => self.asm.emit(Instruction::Add),
            BinaryOp::Sub => self.asm.emit(Instruction::Sub),
            BinaryOp::Mul => self.asm.emit(Instruction::Mul),
            BinaryOp::Div => self.asm.emit(Instruction::Div),
            BinaryOp::Rem => self.asm.emit(Instruction::Rem),
            BinaryOp::And => self.asm.emit(Instruction::And),
            BinaryOp::Or => self.asm.emit(Instruction::Or),
            BinaryOp::Xor => self.asm.emit(Instruction::Xor),
            BinaryOp::Eq => self.asm.emit(Instruction::Ceq),
            BinaryOp::Lt => self.asm.emit(Instruction::Clt),
            BinaryOp::Gt => self.asm.emit(Instruction::Cgt),
            BinaryOp::Ne => negate(&mut self.asm, Instruction::Ceq),
            BinaryOp::Le => negate(&mut self.asm, Instruction::Cgt),
            BinaryOp::Ge => negate(&mut self.asm, Instruction::Clt),
        }
    }

    // ── Storage ─────────────────────────────────────────────────────────

    fn store(&mut self, place: Place) -> Result<()> {
        match place {
            Place::Local(local) => match self.ctx.storage.get(&local) {
                Some(&field) => self.asm.emit(Instruction::Stfld(field)),
                None => {
                    let slot = self.il_local(local)?;
                    self.asm.emit(Instruction::Stloc(slot))
                }
            },
            Place::Param(index) => {
                let field = self.parameter(index)?;
                self.asm.emit(Instruction::Stfld(field))
            }
        }
    }

    fn il_local(&mut self, local: LocalId) -> Result<u16> {
        if let Some(&slot) = self.il_locals.get(&local) {
            return Ok(slot);
        }
        let decl = self.ctx.local(local)?;
        let slot = self.asm.declare_local(decl.ty.clone(), Some(&decl.name));
        self.il_locals.insert(local, slot);
        Ok(slot)
    }

    fn awaiter_local(&mut self, ty: &TypeRef) -> u16 {
        let asm = &mut self.asm;
        *self
            .awaiter_locals
            .entry(ty.clone())
            .or_insert_with(|| asm.declare_local(ty.clone(), None))
    }

    fn parameter(&self, index: u16) -> Result<FieldId> {
        self.ctx
            .parameters
            .get(&index)
            .copied()
            .ok_or_else(|| malformed_error!("Parameter {} is not hoisted", index))
    }

    fn user_label(&self, name: &str) -> Result<Label> {
        self.labels
            .get(name)
            .copied()
            .ok_or_else(|| malformed_error!("Undefined label {}", name))
    }

    fn clear(&mut self, field: FieldId, name: &str) -> Result<()> {
        self.asm.emit(Instruction::Ldnull)?;
        self.asm.emit(Instruction::Stfld(field))?;
        self.ctx
            .record(EventKind::SlotCleared)
            .location(field.index())
            .message(format!("{name} cleared"));
        Ok(())
    }

    /// Clears the hoisted reference-typed user locals among `locals`.
    fn clear_locals(&mut self, locals: &[LocalId]) -> Result<()> {
        if !self.ctx.config.clear_reference_slots {
            return Ok(());
        }
        for &local in locals {
            let decl = self.ctx.local(local)?;
            if decl.kind != LocalKind::User || !decl.ty.is_reference() {
                continue;
            }
            if let Some(&field) = self.ctx.storage.get(&local) {
                self.clear(field, &decl.name)?;
            }
        }
        Ok(())
    }

    /// Clears the locals of every scope above `floor` ahead of a branch that leaves
    /// them for a target `depth` protected levels deep.
    fn clear_exited(&mut self, floor: usize, depth: usize) -> Result<()> {
        // A crossed finally or handler may still read them.
        if self.path.len() > depth || self.asm.is_unreachable() {
            return Ok(());
        }
        let exited: Vec<LocalId> = self
            .scopes
            .get(floor..)
            .unwrap_or_default()
            .iter()
            .flat_map(|scope| scope.locals.iter().copied())
            .collect();
        self.clear_locals(&exited)
    }

    /// Clears hoisted reference-typed spill temporaries read by `expr`; each is read once.
    fn clear_spills(&mut self, expr: &Expr) -> Result<()> {
        if !self.ctx.config.clear_reference_slots || self.asm.is_unreachable() {
            return Ok(());
        }
        let mut reads = Vec::new();
        collect_locals(expr, &mut reads);
        for local in reads {
            let decl = self.ctx.local(local)?;
            if decl.kind != LocalKind::Spill || !decl.ty.is_reference() {
                continue;
            }
            if let Some(&field) = self.ctx.storage.get(&local) {
                self.clear(field, &decl.name)?;
            }
        }
        Ok(())
    }
}

fn collect_locals(expr: &Expr, out: &mut Vec<LocalId>) {
    match expr {
        Expr::Local(local) => {
            if !out.contains(local) {
                out.push(*local);
            }
        }
        Expr::Int(_) | Expr::Bool(_) | Expr::Str(_) | Expr::Null | Expr::Param(_) | Expr::This => {}
        Expr::Binary(_, left, right) | Expr::AndAlso(left, right) | Expr::OrElse(left, right) => {
            collect_locals(left, out);
            collect_locals(right, out);
        }
        Expr::Conditional(cond, then, otherwise) => {
            collect_locals(cond, out);
            collect_locals(then, out);
            collect_locals(otherwise, out);
        }
        Expr::Unary(_, operand)
        | Expr::Await(operand)
        | Expr::IsInst(operand, _)
        | Expr::Cast(operand, _) => collect_locals(operand, out),
        Expr::Call { args, .. } => args.iter().for_each(|a| collect_locals(a, out)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        capabilities::CapabilityRegistry,
        compiler::passes::{RegionPass, SynthesizePass},
        config::LoweringConfig,
        syntax::{AsyncMethodDescriptor, MethodBuilder, ReturnShape},
        Error,
    };

    fn emit(method: &AsyncMethodDescriptor) -> Result<MethodBody> {
        let config = LoweringConfig::release();
        let registry = CapabilityRegistry::new();
        let mut ctx = LoweringContext::new(method, &config, &registry);
        SynthesizePass.run(&mut ctx)?;
        if RegionPass.should_run(&ctx) {
            RegionPass.run(&mut ctx)?;
        }
        SuspensionPass.run(&mut ctx)?;
        ctx.move_next
            .ok_or_else(|| malformed_error!("no body"))
    }

    fn slots_cleared(method: &AsyncMethodDescriptor) -> Result<usize> {
        let config = LoweringConfig::release();
        let registry = CapabilityRegistry::new();
        let mut ctx = LoweringContext::new(method, &config, &registry);
        SynthesizePass.run(&mut ctx)?;
        if RegionPass.should_run(&ctx) {
            RegionPass.run(&mut ctx)?;
        }
        SuspensionPass.run(&mut ctx)?;
        Ok(ctx.events.count_kind(EventKind::SlotCleared))
    }

    fn write(value: Expr) -> Stmt {
        Stmt::Expr(Expr::call("Console.Write", vec![value], TypeRef::Void))
    }

    fn yield_stmt() -> Stmt {
        Stmt::await_(Expr::call("Task.Yield", vec![], TypeRef::yield_awaitable()))
    }

    #[test]
    fn test_zero_await_has_no_dispatch() {
        let mut m = MethodBuilder::new("F", ReturnShape::TaskOf(TypeRef::Int32));
        m.push(Stmt::Return(Some(Expr::int(42))));
        let body = emit(&m.build()).unwrap();

        assert_eq!(body.count(|i| matches!(i, Instruction::Switch(_))), 0);
        assert_eq!(body.clauses.len(), 1);
        assert_eq!(
            body.count(|i| matches!(
                i,
                Instruction::Builder {
                    member: BuilderMember::SetResult,
                    args: 1
                }
            )),
            1
        );
        assert_eq!(body.name, "<F>d__0::MoveNext");
    }

    #[test]
    fn test_switch_lists_every_state() {
        let mut m = MethodBuilder::new("F", ReturnShape::Task);
        m.extend([yield_stmt(), yield_stmt(), yield_stmt()]);
        let body = emit(&m.build()).unwrap();

        let switch = body.instructions.iter().find_map(|i| match i {
            Instruction::Switch(targets) => Some(targets.len()),
            _ => None,
        });
        assert_eq!(switch, Some(3));
        assert_eq!(
            body.count(|i| matches!(
                i,
                Instruction::Builder {
                    member: BuilderMember::AwaitUnsafeOnCompleted,
                    ..
                }
            )),
            3
        );
        assert_eq!(body.count(|i| matches!(i, Instruction::ClearField(_))), 3);
    }

    #[test]
    fn test_await_in_try_gets_nested_dispatch_and_guard() {
        let mut m = MethodBuilder::new("F", ReturnShape::Task);
        m.push(Stmt::try_finally(
            vec![yield_stmt()],
            vec![Stmt::Expr(Expr::call(
                "Console.WriteLine",
                vec![Expr::string("finally")],
                TypeRef::Void,
            ))],
        ));
        let body = emit(&m.build()).unwrap();

        assert_eq!(body.count(|i| matches!(i, Instruction::Beq(_))), 1);
        assert_eq!(body.count(|i| matches!(i, Instruction::Bge(_))), 1);
        assert_eq!(body.clauses.iter().filter(|c| c.is_finally()).count(), 1);
    }

    #[test]
    fn test_goto_into_try_rejected() {
        let mut m = MethodBuilder::new("F", ReturnShape::Task);
        m.push(Stmt::Goto("inside".into()));
        m.push(Stmt::try_finally(
            vec![Stmt::Label("inside".into())],
            vec![],
        ));
        assert!(matches!(emit(&m.build()), Err(Error::Malformed { .. })));
    }

    #[test]
    fn test_rethrow_outside_catch_rejected() {
        let mut m = MethodBuilder::new("F", ReturnShape::Task);
        m.push(Stmt::Throw(None));
        assert!(matches!(emit(&m.build()), Err(Error::Malformed { .. })));
    }

    #[test]
    fn test_filter_clause_emitted() {
        let mut m = MethodBuilder::new("F", ReturnShape::Task);
        let ex = m.local("ex", TypeRef::exception());
        m.push(Stmt::try_catch(
            vec![],
            vec![CatchClause::new(TypeRef::exception(), Some(ex), vec![]).when(Expr::Bool(true))],
        ));
        let body = emit(&m.build()).unwrap();
        assert!(body.clauses.iter().any(|c| c.is_filter()));
        assert_eq!(body.count(|i| matches!(i, Instruction::Endfilter)), 1);
    }

    #[test]
    fn test_hoisted_reference_cleared_when_break_leaves_its_scope() {
        let mut m = MethodBuilder::new("F", ReturnShape::Task);
        let s = m.local("s", TypeRef::String);
        m.push(Stmt::while_loop(
            Expr::Bool(true),
            vec![
                Stmt::declare(s, Expr::string("x")),
                yield_stmt(),
                write(Expr::local(s)),
                Stmt::Break,
            ],
        ));
        assert_eq!(slots_cleared(&m.build()).unwrap(), 1);
    }

    #[test]
    fn test_hoisted_reference_cleared_on_return() {
        let mut m = MethodBuilder::new("F", ReturnShape::Task);
        let s = m.local("s", TypeRef::String);
        m.push(Stmt::declare(s, Expr::string("x")));
        m.push(yield_stmt());
        m.push(write(Expr::local(s)));
        m.push(Stmt::Return(None));
        assert_eq!(slots_cleared(&m.build()).unwrap(), 1);
    }

    #[test]
    fn test_goto_clears_only_the_scopes_it_leaves() {
        let mut m = MethodBuilder::new("F", ReturnShape::Task);
        let s = m.local("s", TypeRef::String);
        let t = m.local("t", TypeRef::String);
        m.push(Stmt::Block(Block::new(vec![
            Stmt::declare(s, Expr::string("x")),
            yield_stmt(),
            write(Expr::local(s)),
            Stmt::Goto("done".into()),
        ])));
        m.push(Stmt::Label("done".into()));
        m.push(Stmt::declare(t, Expr::string("y")));
        m.push(yield_stmt());
        m.push(write(Expr::local(t)));
        m.push(Stmt::if_then(Expr::Bool(false), vec![Stmt::Goto("done".into())]));

        // `s` once at the goto, `t` once at the end of the body.
        assert_eq!(slots_cleared(&m.build()).unwrap(), 2);
    }
}
