//! Executes one `MoveNext` invocation.
//!
//! Exception dispatch follows ECMA-335 partition I §12.4.2:
//!
//! 1. The first pass walks the clause table innermost-first and picks the first catch
//!    whose type matches or filter whose block returns true. A filter that throws counts
//!    as returning false.
//! 2. The second pass runs every finally between the throw point and that handler,
//!    innermost first, then enters the handler.
//!
//! `leave` runs the finallys it exits in the same order. An exception thrown by a finally
//! abandons the dispatch that was running it.

use std::sync::Arc;

use crate::{
    assembly::{ExceptionClause, Instruction, MethodBody},
    capabilities::BuilderMember,
    emulation::{
        capability::TaskAwaiter,
        runtime::{MachineRef, Runtime},
        value::{Outcome, Value},
    },
    Error, Result,
};

/// Outcome of one instruction.
enum Step {
    Next,
    Jump(usize),
    Leave(usize),
    Throw(Value),
    EndFinally,
    EndFilter(bool),
    Return,
}

/// Where control goes once the pending finallys have run.
enum Exit {
    Leave {
        target: usize,
    },
    Unwind {
        exception: Value,
        handler: Option<usize>,
    },
}

struct FinallyFrame {
    clause: usize,
    exit: Exit,
    remaining: Vec<usize>,
}

struct CatchFrame {
    clause: usize,
    exception: Value,
}

pub(crate) struct Interpreter<'r> {
    runtime: &'r Runtime,
    machine: &'r MachineRef,
    body: &'r MethodBody,
    ip: usize,
    stack: Vec<Value>,
    locals: Vec<Value>,
    executed: u64,
    finallys: Vec<FinallyFrame>,
    catches: Vec<CatchFrame>,
}

impl<'r> Interpreter<'r> {
    pub(crate) fn new(runtime: &'r Runtime, machine: &'r MachineRef) -> Self {
        let body = &machine.definition().move_next;
        Self {
            runtime,
            machine,
            body,
            ip: 0,
            stack: Vec::with_capacity(usize::from(body.max_stack)),
            locals: body.locals.iter().map(|l| Value::default_for(&l.ty)).collect(),
            executed: 0,
            finallys: Vec::new(),
            catches: Vec::new(),
        }
    }

    pub(crate) fn run(mut self) -> Result<()> {
        let result = self.execute();
        self.runtime.note_instructions(self.executed);
        result
    }

    fn execute(&mut self) -> Result<()> {
        loop {
            match self.step()? {
                Step::Next => self.ip += 1,
                Step::Jump(target) => self.ip = target,
                Step::Leave(target) => self.leave(target)?,
                Step::Throw(exception) => self.throw(exception)?,
                Step::EndFinally => self.end_finally()?,
                Step::EndFilter(_) => {
                    return Err(Error::InvalidProgram(format!(
                        "endfilter outside of a filter at IL_{:04X}",
                        self.ip
                    )));
                }
                Step::Return => return Ok(()),
            }
        }
    }

    fn frame(&self) -> String {
        format!("{}+IL_{:04X}", self.body.name, self.ip)
    }

    fn pop(&mut self) -> Result<Value> {
        self.stack.pop().ok_or(Error::StackUnderflow)
    }

    fn pop_int(&mut self) -> Result<i32> {
        self.pop()?.as_int()
    }

    fn push(&mut self, value: Value) -> Step {
        self.stack.push(value);
        Step::Next
    }

    fn raise(&self, class: &str, message: &str) -> Result<Step> {
        let exception = self.runtime.exception(class, message);
        if let Value::Exception(ex) = &exception {
            ex.reset_trace(self.frame())?;
        }
        Ok(Step::Throw(exception))
    }

    // ── Instructions ────────────────────────────────────────────────────

    fn step(&mut self) -> Result<Step> {
        let limit = self.runtime.config().max_instructions;
        self.executed += 1;
        if self.executed > limit {
            return Err(Error::ExecutionLimit(limit));
        }

        let body = self.body;
        let instruction = body.instructions.get(self.ip).ok_or_else(|| {
            Error::InvalidProgram(format!("{} runs past its last instruction", body.name))
        })?;

        Ok(match instruction {
            Instruction::Nop => Step::Next,
            Instruction::LdcI4(value) => self.push(Value::Int(*value)),
            Instruction::Ldstr(value) => self.push(Value::string(value)),
            Instruction::Ldnull => self.push(Value::Null),
            Instruction::Ldloc(slot) => {
                let value = self.local(*slot)?.clone();
                self.push(value)
            }
            Instruction::Stloc(slot) => {
                let value = self.pop()?;
                *self.local(*slot)? = value;
                Step::Next
            }
            Instruction::Ldfld(field) => {
                let value = self.machine.field(*field)?;
                self.push(value)
            }
            Instruction::Stfld(field) => {
                let value = self.pop()?;
                self.machine.set_field(*field, value)?;
                Step::Next
            }
            Instruction::ClearField(field) => {
                self.machine.clear_field(*field)?;
                Step::Next
            }
            Instruction::Add
            | Instruction::Sub
            | Instruction::Mul
            | Instruction::Div
            | Instruction::Rem
            | Instruction::And
            | Instruction::Or
            | Instruction::Xor => {
                let right = self.pop_int()?;
                let left = self.pop_int()?;
                match arithmetic(instruction, left, right) {
                    Ok(value) => self.push(Value::Int(value)),
                    Err(class) => return self.raise(class, "Arithmetic operation failed."),
                }
            }
            Instruction::Neg => {
                let value = self.pop_int()?;
                self.push(Value::Int(value.wrapping_neg()))
            }
            Instruction::Ceq => {
                let right = self.pop()?;
                let left = self.pop()?;
                self.push(Value::bool(left.equals(&right)))
            }
            Instruction::Cgt => {
                let right = self.pop_int()?;
                let left = self.pop_int()?;
                self.push(Value::bool(left > right))
            }
            Instruction::Clt => {
                let right = self.pop_int()?;
                let left = self.pop_int()?;
                self.push(Value::bool(left < right))
            }
            Instruction::Dup => {
                let value = self.stack.last().cloned().ok_or(Error::StackUnderflow)?;
                self.push(value)
            }
            Instruction::Pop => {
                self.pop()?;
                Step::Next
            }
            Instruction::Br(label) => Step::Jump(body.target(*label)),
            Instruction::Brtrue(label) => {
                if self.pop()?.is_true() {
                    Step::Jump(body.target(*label))
                } else {
                    Step::Next
                }
            }
            Instruction::Brfalse(label) => {
                if self.pop()?.is_true() {
                    Step::Next
                } else {
                    Step::Jump(body.target(*label))
                }
            }
            Instruction::Beq(label) => {
                let right = self.pop()?;
                let left = self.pop()?;
                if left.equals(&right) {
                    Step::Jump(body.target(*label))
                } else {
                    Step::Next
                }
            }
            Instruction::Bge(label) => {
                let right = self.pop_int()?;
                let left = self.pop_int()?;
                if left >= right {
                    Step::Jump(body.target(*label))
                } else {
                    Step::Next
                }
            }
            Instruction::Switch(targets) => {
                let index = self.pop_int()?;
                match usize::try_from(index).ok().and_then(|i| targets.get(i)) {
                    Some(label) => Step::Jump(body.target(*label)),
                    None => Step::Next,
                }
            }
            Instruction::Leave(label) => Step::Leave(body.target(*label)),
            Instruction::Endfinally => Step::EndFinally,
            Instruction::Endfilter => Step::EndFilter(self.pop()?.is_true()),
            Instruction::Throw => {
                let value = self.pop()?;
                match &value {
                    Value::Null => {
                        return self.raise(
                            "System.NullReferenceException",
                            "Object reference not set to an instance of an object.",
                        )
                    }
                    Value::Exception(ex) => ex.reset_trace(self.frame())?,
                    _ => {}
                }
                Step::Throw(value)
            }
            Instruction::Rethrow => {
                let ip = self.ip;
                let exception = self
                    .catches
                    .iter()
                    .rev()
                    .find(|frame| body.clauses[frame.clause].is_in_handler(ip))
                    .map(|frame| frame.exception.clone())
                    .ok_or_else(|| {
                        Error::InvalidProgram(format!("rethrow outside of a catch at IL_{ip:04X}"))
                    })?;
                self.append_trace(&exception)?;
                Step::Throw(exception)
            }
            Instruction::CaptureThrow => {
                let exception = self.pop()?;
                self.append_trace(&exception)?;
                Step::Throw(exception)
            }
            Instruction::Call { name, argc, ty } => {
                let at = self
                    .stack
                    .len()
                    .checked_sub(usize::from(*argc))
                    .ok_or(Error::StackUnderflow)?;
                let args = self.stack.split_off(at);
                match self.runtime.call(name, &args)? {
                    Outcome::Return(value) if !ty.is_void() => self.push(value),
                    Outcome::Return(_) => Step::Next,
                    Outcome::Throw(exception) => {
                        self.append_trace(&exception)?;
                        Step::Throw(exception)
                    }
                }
            }
            Instruction::GetAwaiter { .. } => match self.pop()? {
                Value::Task(task) => self.push(Value::Awaiter(Arc::new(TaskAwaiter::new(task)))),
                Value::Awaitable(awaitable) => self.push(Value::Awaiter(awaitable.get_awaiter())),
                Value::Null => {
                    return self.raise(
                        "System.NullReferenceException",
                        "Object reference not set to an instance of an object.",
                    )
                }
                other => {
                    return Err(Error::TypeMismatch(format!(
                        "GetAwaiter on {}",
                        other.kind()
                    )))
                }
            },
            Instruction::IsCompleted(_) => {
                let Value::Awaiter(awaiter) = self.pop()? else {
                    return Err(Error::TypeMismatch("IsCompleted expects an awaiter".into()));
                };
                self.push(Value::bool(awaiter.is_completed()?))
            }
            Instruction::GetResult { result, .. } => {
                let Value::Awaiter(awaiter) = self.pop()? else {
                    return Err(Error::TypeMismatch("GetResult expects an awaiter".into()));
                };
                match awaiter.get_result()? {
                    Outcome::Return(value) if !result.is_void() => self.push(value),
                    Outcome::Return(_) => Step::Next,
                    Outcome::Throw(exception) => {
                        self.append_trace(&exception)?;
                        Step::Throw(exception)
                    }
                }
            }
            Instruction::Builder { member, args } => self.builder(*member, *args)?,
            Instruction::IsInst(ty) => {
                let value = self.pop()?;
                if self.runtime.is_instance(&value, ty)? {
                    self.push(value)
                } else {
                    self.push(Value::Null)
                }
            }
            Instruction::Castclass(ty) => {
                let value = self.pop()?;
                if value.is_null() || self.runtime.is_instance(&value, ty)? {
                    self.push(value)
                } else {
                    return self.raise(
                        "System.InvalidCastException",
                        &format!("Unable to cast {} to {ty}.", value.kind()),
                    );
                }
            }
            Instruction::Ret => Step::Return,
        })
    }

    fn local(&mut self, slot: u16) -> Result<&mut Value> {
        self.locals
            .get_mut(usize::from(slot))
            .ok_or_else(|| Error::InvalidProgram(format!("no local {slot}")))
    }

    fn append_trace(&self, exception: &Value) -> Result<()> {
        if let Value::Exception(ex) = exception {
            ex.append_trace(self.frame())?;
        }
        Ok(())
    }

    fn builder(&mut self, member: BuilderMember, args: u16) -> Result<Step> {
        let builder = Arc::clone(self.machine.builder());
        match member {
            BuilderMember::SetResult => {
                let value = if args == 0 { Value::Null } else { self.pop()? };
                builder.set_result(self.runtime, value)?;
            }
            BuilderMember::SetException => match self.pop()? {
                Value::Exception(ex) => builder.set_exception(self.runtime, ex)?,
                other => {
                    return Err(Error::TypeMismatch(format!(
                        "SetException expects an exception, found {}",
                        other.kind()
                    )))
                }
            },
            BuilderMember::AwaitOnCompleted | BuilderMember::AwaitUnsafeOnCompleted => {
                let Value::Awaiter(awaiter) = self.pop()? else {
                    return Err(Error::TypeMismatch(format!("{member} expects an awaiter")));
                };
                self.runtime.note_suspension(self.machine);
                builder.await_on_completed(self.runtime, awaiter, self.machine)?;
            }
            BuilderMember::Create | BuilderMember::Start | BuilderMember::Task => {
                return Err(Error::InvalidProgram(format!(
                    "{member} is not callable from MoveNext"
                )));
            }
        }
        Ok(Step::Next)
    }

    // ── Protected regions ───────────────────────────────────────────────

    fn clause(&self, index: usize) -> &'r ExceptionClause {
        &self.body.clauses[index]
    }

    fn leave(&mut self, target: usize) -> Result<()> {
        let ip = self.ip;
        let body = self.body;
        self.stack.clear();
        self.catches.retain(|frame| {
            let clause = &body.clauses[frame.clause];
            !(clause.is_in_handler(ip) && !clause.is_in_handler(target))
        });
        let pending = body
            .clauses
            .iter()
            .enumerate()
            .filter(|(_, c)| c.is_finally() && c.is_in_try(ip) && !c.is_in_try(target))
            .map(|(index, _)| index)
            .collect();
        self.run_finallys(pending, Exit::Leave { target })
    }

    fn throw(&mut self, exception: Value) -> Result<()> {
        let ip = self.ip;
        let body = self.body;

        let mut handler = None;
        for (index, clause) in body.clauses.iter().enumerate() {
            if !clause.is_in_try(ip) || clause.is_finally() || clause.is_fault() {
                continue;
            }
            let takes = if clause.is_filter() {
                self.run_filter(index, &exception)?
            } else {
                match &clause.catch_type {
                    Some(ty) => self.runtime.is_instance(&exception, ty)?,
                    None => false,
                }
            };
            if takes {
                handler = Some(index);
                break;
            }
        }

        // Handlers being exited by this throw are abandoned, including a finally that
        // was running for an earlier exception.
        let resume = handler.map(|h| body.clauses[h].handler_start);
        let exited = |clause: &ExceptionClause| {
            clause.is_in_handler_area(ip) && resume.map_or(true, |at| !clause.is_in_handler_area(at))
        };
        self.finallys.retain(|frame| !exited(&body.clauses[frame.clause]));
        self.catches.retain(|frame| !exited(&body.clauses[frame.clause]));

        let limit = handler.unwrap_or(body.clauses.len());
        let pending = (0..limit)
            .filter(|&i| {
                let clause = &body.clauses[i];
                (clause.is_finally() || clause.is_fault()) && clause.is_in_try(ip)
            })
            .collect();
        self.run_finallys(pending, Exit::Unwind { exception, handler })
    }

    fn run_filter(&mut self, index: usize, exception: &Value) -> Result<bool> {
        let start = self.clause(index).filter_start.ok_or_else(|| {
            Error::InvalidProgram(format!("filter clause {index} has no filter block"))
        })?;
        let saved_ip = self.ip;
        let saved_stack = std::mem::take(&mut self.stack);
        self.stack.push(exception.clone());
        self.ip = start;

        let result = loop {
            match self.step() {
                Ok(Step::Next) => self.ip += 1,
                Ok(Step::Jump(target)) => self.ip = target,
                Ok(Step::EndFilter(accepted)) => break Ok(accepted),
                Ok(Step::Throw(_)) => break Ok(false),
                Ok(_) => {
                    break Err(Error::InvalidProgram(format!(
                        "unsupported control flow in filter at IL_{:04X}",
                        self.ip
                    )))
                }
                Err(error) => break Err(error),
            }
        };

        self.ip = saved_ip;
        self.stack = saved_stack;
        result
    }

    fn run_finallys(&mut self, mut pending: Vec<usize>, exit: Exit) -> Result<()> {
        if pending.is_empty() {
            return self.complete(exit);
        }
        let clause = pending.remove(0);
        self.stack.clear();
        self.ip = self.clause(clause).handler_start;
        self.finallys.push(FinallyFrame {
            clause,
            exit,
            remaining: pending,
        });
        Ok(())
    }

    fn end_finally(&mut self) -> Result<()> {
        let frame = self.finallys.pop().ok_or_else(|| {
            Error::InvalidProgram(format!("endfinally outside of a finally at IL_{:04X}", self.ip))
        })?;
        self.run_finallys(frame.remaining, frame.exit)
    }

    fn complete(&mut self, exit: Exit) -> Result<()> {
        match exit {
            Exit::Leave { target } => {
                self.ip = target;
                Ok(())
            }
            Exit::Unwind {
                exception,
                handler: Some(index),
            } => {
                self.stack.clear();
                self.stack.push(exception.clone());
                self.catches.push(CatchFrame {
                    clause: index,
                    exception,
                });
                self.ip = self.clause(index).handler_start;
                Ok(())
            }
            Exit::Unwind {
                exception,
                handler: None,
            } => Err(Error::InvalidProgram(format!(
                "{exception:?} escaped {}",
                self.body.name
            ))),
        }
    }
}

/// Integer arithmetic; `Err` names the exception class to raise.
fn arithmetic(
    instruction: &Instruction,
    left: i32,
    right: i32,
) -> std::result::Result<i32, &'static str> {
    match instruction {
        Instruction::Add => Ok(left.wrapping_add(right)),
        Instruction::Sub => Ok(left.wrapping_sub(right)),
        Instruction::Mul => Ok(left.wrapping_mul(right)),
        Instruction::Div | Instruction::Rem if right == 0 => Err("System.DivideByZeroException"),
        Instruction::Div => left.checked_div(right).ok_or("System.OverflowException"),
        Instruction::Rem => left.checked_rem(right).ok_or("System.OverflowException"),
        Instruction::And => Ok(left & right),
        Instruction::Or => Ok(left | right),
        Instruction::Xor => Ok(left ^ right),
        _ => Ok(0),
    }
}
