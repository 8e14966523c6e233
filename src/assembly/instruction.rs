//! The instruction set of emitted `MoveNext` bodies.
//!
//! Instructions follow the CIL evaluation-stack model. Operands that refer to the state
//! machine (fields, the builder) are symbolic: [`FieldId`] indexes the machine layout and
//! builder calls name a [`BuilderMember`]. Branch operands are [`Label`]s resolved by the
//! [`crate::assembly::InstructionAssembler`].

use std::fmt::{self, Write};

use crate::{capabilities::BuilderMember, syntax::TypeRef};

/// A branch target allocated by the assembler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Label(pub u32);

/// Index of a field in the state-machine layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FieldId(pub u32);

impl FieldId {
    /// Index into the layout.
    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Resolves symbolic operands when rendering a listing.
pub trait ListingContext {
    /// Renders a field reference, e.g. `int32 <F>d__0::<>1__state`.
    fn field(&self, id: FieldId) -> String;
    /// Name of the builder type.
    fn builder(&self) -> String;
}

/// Flow behaviour of an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowType {
    /// Falls through to the next instruction.
    Sequential,
    /// May branch or fall through.
    ConditionalBranch,
    /// Always branches.
    UnconditionalBranch,
    /// Leaves a protected region.
    Leave,
    /// Ends a finally/fault handler.
    EndFinally,
    /// Ends a filter block.
    EndFilter,
    /// Raises an exception.
    Throw,
    /// Returns from the method.
    Return,
}

/// A single instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction {
    /// Does nothing.
    Nop,
    /// Pushes a 32-bit integer.
    LdcI4(i32),
    /// Pushes a string.
    Ldstr(String),
    /// Pushes null.
    Ldnull,
    /// Pushes an IL local.
    Ldloc(u16),
    /// Pops into an IL local.
    Stloc(u16),
    /// Pushes a state-machine field.
    Ldfld(FieldId),
    /// Pops into a state-machine field.
    Stfld(FieldId),
    /// Resets a value-type field to its default (`initobj`).
    ClearField(FieldId),
    /// Addition.
    Add,
    /// Subtraction.
    Sub,
    /// Multiplication.
    Mul,
    /// Division; throws `DivideByZeroException`.
    Div,
    /// Remainder; throws `DivideByZeroException`.
    Rem,
    /// Bitwise and.
    And,
    /// Bitwise or.
    Or,
    /// Bitwise xor.
    Xor,
    /// Arithmetic negation.
    Neg,
    /// Pushes 1 if the two values are equal.
    Ceq,
    /// Pushes 1 if the first value is greater.
    Cgt,
    /// Pushes 1 if the first value is smaller.
    Clt,
    /// Duplicates the top of the stack.
    Dup,
    /// Discards the top of the stack.
    Pop,
    /// Unconditional branch.
    Br(Label),
    /// Branch if non-zero/non-null.
    Brtrue(Label),
    /// Branch if zero/null.
    Brfalse(Label),
    /// Branch if equal.
    Beq(Label),
    /// Branch if greater or equal.
    Bge(Label),
    /// Jump table indexed by the popped value; falls through when out of range.
    Switch(Vec<Label>),
    /// Exits protected regions, running intervening finally handlers.
    Leave(Label),
    /// Ends a finally handler.
    Endfinally,
    /// Ends a filter; pops the decision.
    Endfilter,
    /// Throws the popped value, resetting its trace.
    Throw,
    /// Rethrows the exception of the innermost catch handler.
    Rethrow,
    /// Throws the popped exception keeping its original trace
    /// (`ExceptionDispatchInfo.Capture(e).Throw()`).
    CaptureThrow,
    /// Calls a host function or async method.
    Call {
        /// Qualified name.
        name: String,
        /// Number of arguments popped.
        argc: u16,
        /// Return type; non-void results are pushed.
        ty: TypeRef,
    },
    /// Pops an awaitable and pushes its awaiter.
    GetAwaiter {
        /// Awaited type.
        awaitable: TypeRef,
        /// Awaiter type.
        awaiter: TypeRef,
    },
    /// Pops an awaiter and pushes its completion flag.
    IsCompleted(TypeRef),
    /// Pops an awaiter and pushes its result, raising a stored exception.
    GetResult {
        /// Awaiter type.
        awaiter: TypeRef,
        /// Result type; nothing is pushed for void.
        result: TypeRef,
    },
    /// Calls a member of the method builder field.
    Builder {
        /// Member invoked.
        member: BuilderMember,
        /// Number of stack arguments.
        args: u16,
    },
    /// Pops a value and pushes it if it is an instance of the type, null otherwise.
    IsInst(TypeRef),
    /// Pops a value and pushes it if it is an instance of the type, throws otherwise.
    Castclass(TypeRef),
    /// Returns from `MoveNext`.
    Ret,
}

impl Instruction {
    /// The ILDasm mnemonic.
    #[must_use]
    pub fn mnemonic(&self) -> &'static str {
        match self {
            Instruction::Nop => "nop",
            Instruction::LdcI4(_) => "ldc.i4",
            Instruction::Ldstr(_) => "ldstr",
            Instruction::Ldnull => "ldnull",
            Instruction::Ldloc(_) => "ldloc",
            Instruction::Stloc(_) => "stloc",
            Instruction::Ldfld(_) => "ldfld",
            Instruction::Stfld(_) => "stfld",
            Instruction::ClearField(_) => "initobj",
            Instruction::Add => "add",
            Instruction::Sub => "sub",
            Instruction::Mul => "mul",
            Instruction::Div => "div",
            Instruction::Rem => "rem",
            Instruction::And => "and",
            Instruction::Or => "or",
            Instruction::Xor => "xor",
            Instruction::Neg => "neg",
            Instruction::Ceq => "ceq",
            Instruction::Cgt => "cgt",
            Instruction::Clt => "clt",
            Instruction::Dup => "dup",
            Instruction::Pop => "pop",
            Instruction::Br(_) => "br",
            Instruction::Brtrue(_) => "brtrue",
            Instruction::Brfalse(_) => "brfalse",
            Instruction::Beq(_) => "beq",
            Instruction::Bge(_) => "bge",
            Instruction::Switch(_) => "switch",
            Instruction::Leave(_) => "leave",
            Instruction::Endfinally => "endfinally",
            Instruction::Endfilter => "endfilter",
            Instruction::Throw => "throw",
            Instruction::Rethrow => "rethrow",
            Instruction::CaptureThrow
            | Instruction::Call { .. }
            | Instruction::GetAwaiter { .. }
            | Instruction::IsCompleted(_)
            | Instruction::GetResult { .. }
            | Instruction::Builder { .. } => "call",
            Instruction::IsInst(_) => "isinst",
            Instruction::Castclass(_) => "castclass",
            Instruction::Ret => "ret",
        }
    }

    /// Control flow behaviour.
    #[must_use]
    pub fn flow(&self) -> FlowType {
        match self {
            Instruction::Br(_) => FlowType::UnconditionalBranch,
            Instruction::Brtrue(_)
            | Instruction::Brfalse(_)
            | Instruction::Beq(_)
            | Instruction::Bge(_)
            | Instruction::Switch(_) => FlowType::ConditionalBranch,
            Instruction::Leave(_) => FlowType::Leave,
            Instruction::Endfinally => FlowType::EndFinally,
            Instruction::Endfilter => FlowType::EndFilter,
            Instruction::Throw | Instruction::Rethrow | Instruction::CaptureThrow => {
                FlowType::Throw
            }
            Instruction::Ret => FlowType::Return,
            _ => FlowType::Sequential,
        }
    }

    /// Returns `(pops, pushes)` on the evaluation stack.
    ///
    /// `leave` empties the stack; that is handled by the assembler, not expressed here.
    #[must_use]
    pub fn stack_effect(&self) -> (u16, u16) {
        match self {
            Instruction::Nop
            | Instruction::ClearField(_)
            | Instruction::Br(_)
            | Instruction::Leave(_)
            | Instruction::Endfinally
            | Instruction::Rethrow
            | Instruction::Ret => (0, 0),
            Instruction::LdcI4(_)
            | Instruction::Ldstr(_)
            | Instruction::Ldnull
            | Instruction::Ldloc(_)
            | Instruction::Ldfld(_) => (0, 1),
            Instruction::Stloc(_)
            | Instruction::Stfld(_)
            | Instruction::Pop
            | Instruction::Brtrue(_)
            | Instruction::Brfalse(_)
            | Instruction::Switch(_)
            | Instruction::Endfilter
            | Instruction::Throw
            | Instruction::CaptureThrow => (1, 0),
            Instruction::Add
            | Instruction::Sub
            | Instruction::Mul
            | Instruction::Div
            | Instruction::Rem
            | Instruction::And
            | Instruction::Or
            | Instruction::Xor
            | Instruction::Ceq
            | Instruction::Cgt
            | Instruction::Clt => (2, 1),
            Instruction::Beq(_) | Instruction::Bge(_) => (2, 0),
            Instruction::Neg
            | Instruction::GetAwaiter { .. }
            | Instruction::IsCompleted(_)
            | Instruction::IsInst(_)
            | Instruction::Castclass(_) => (1, 1),
            Instruction::Dup => (1, 2),
            Instruction::Call { argc, ty, .. } => (*argc, u16::from(!ty.is_void())),
            Instruction::GetResult { result, .. } => (1, u16::from(!result.is_void())),
            Instruction::Builder { args, .. } => (*args, 0),
        }
    }

    /// Branch targets referenced by this instruction.
    #[must_use]
    pub fn targets(&self) -> Vec<Label> {
        match self {
            Instruction::Br(l)
            | Instruction::Brtrue(l)
            | Instruction::Brfalse(l)
            | Instruction::Beq(l)
            | Instruction::Bge(l)
            | Instruction::Leave(l) => vec![*l],
            Instruction::Switch(labels) => labels.clone(),
            _ => Vec::new(),
        }
    }

    /// The field referenced by this instruction, if any.
    #[must_use]
    pub fn field(&self) -> Option<FieldId> {
        match self {
            Instruction::Ldfld(f) | Instruction::Stfld(f) | Instruction::ClearField(f) => Some(*f),
            _ => None,
        }
    }

    /// Rewrites the field operand through `map`.
    pub fn remap_field(&mut self, map: impl Fn(FieldId) -> FieldId) {
        match self {
            Instruction::Ldfld(f) | Instruction::Stfld(f) | Instruction::ClearField(f) => {
                *f = map(*f);
            }
            _ => {}
        }
    }

    /// Renders the instruction with symbolic operands resolved through `ctx` and labels
    /// through `target`.
    pub fn render(
        &self,
        ctx: &dyn ListingContext,
        target: &dyn Fn(Label) -> usize,
    ) -> Result<String, fmt::Error> {
        let mut out = String::new();
        let m = self.mnemonic();
        match self {
            Instruction::LdcI4(value) => match value {
                -1 => out.push_str("ldc.i4.m1"),
                0..=8 => write!(out, "ldc.i4.{value}")?,
                -128..=127 => write!(out, "ldc.i4.s   {value}")?,
                _ => write!(out, "ldc.i4     {value}")?,
            },
            Instruction::Ldstr(s) => write!(out, "{m:<10} \"{s}\"")?,
            Instruction::Ldloc(i) | Instruction::Stloc(i) => {
                if *i <= 3 {
                    write!(out, "{m}.{i}")?;
                } else {
                    write!(out, "{m}.s    V_{i}")?;
                }
            }
            Instruction::Ldfld(f) | Instruction::Stfld(f) | Instruction::ClearField(f) => {
                write!(out, "{m:<10} {}", ctx.field(*f))?;
            }
            Instruction::Br(l)
            | Instruction::Brtrue(l)
            | Instruction::Brfalse(l)
            | Instruction::Beq(l)
            | Instruction::Bge(l)
            | Instruction::Leave(l) => write!(out, "{m:<10} IL_{:04x}", target(*l))?,
            Instruction::Switch(labels) => {
                write!(out, "{m:<10} (")?;
                for (i, l) in labels.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    write!(out, "IL_{:04x}", target(*l))?;
                }
                out.push(')');
            }
            Instruction::CaptureThrow => write!(
                out,
                "{m:<10} void System.Runtime.ExceptionServices.ExceptionDispatchInfo::Throw(Capture)"
            )?,
            Instruction::Call { name, ty, .. } => write!(out, "{m:<10} {ty} {name}")?,
            Instruction::GetAwaiter { awaitable, awaiter } => {
                write!(out, "{m:<10} instance {awaiter} {awaitable}::GetAwaiter()")?;
            }
            Instruction::IsCompleted(awaiter) => {
                write!(out, "{m:<10} instance bool {awaiter}::get_IsCompleted()")?;
            }
            Instruction::GetResult { awaiter, result } => {
                write!(out, "{m:<10} instance {result} {awaiter}::GetResult()")?;
            }
            Instruction::Builder { member, .. } => {
                write!(out, "{m:<10} instance void {}::{member}", ctx.builder())?;
            }
            Instruction::IsInst(ty) | Instruction::Castclass(ty) => write!(out, "{m:<10} {ty}")?,
            _ => out.push_str(m),
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Names;

    impl ListingContext for Names {
        fn field(&self, id: FieldId) -> String {
            format!("int32 M::f{}", id.0)
        }

        fn builder(&self) -> String {
            "AsyncTaskMethodBuilder".to_string()
        }
    }

    #[test]
    fn test_stack_effects() {
        assert_eq!(Instruction::Dup.stack_effect(), (1, 2));
        assert_eq!(
            Instruction::Call {
                name: "F".into(),
                argc: 2,
                ty: TypeRef::Void
            }
            .stack_effect(),
            (2, 0)
        );
        assert_eq!(
            Instruction::GetResult {
                awaiter: TypeRef::Awaiter("TaskAwaiter<int32>".into()),
                result: TypeRef::Int32
            }
            .stack_effect(),
            (1, 1)
        );
    }

    #[test]
    fn test_render_short_forms() {
        let target = |l: Label| l.0 as usize * 2;
        assert_eq!(
            Instruction::LdcI4(-1).render(&Names, &target).unwrap(),
            "ldc.i4.m1"
        );
        assert_eq!(
            Instruction::LdcI4(42).render(&Names, &target).unwrap(),
            "ldc.i4.s   42"
        );
        assert_eq!(Instruction::Stloc(0).render(&Names, &target).unwrap(), "stloc.0");
        assert_eq!(
            Instruction::Leave(Label(3)).render(&Names, &target).unwrap(),
            "leave      IL_0006"
        );
        assert_eq!(
            Instruction::Ldfld(FieldId(1)).render(&Names, &target).unwrap(),
            "ldfld      int32 M::f1"
        );
    }

    #[test]
    fn test_remap_field() {
        let mut instr = Instruction::Stfld(FieldId(4));
        instr.remap_field(|f| FieldId(f.0 - 2));
        assert_eq!(instr.field(), Some(FieldId(2)));
        assert_eq!(instr.flow(), FlowType::Sequential);
        assert_eq!(Instruction::Rethrow.flow(), FlowType::Throw);
    }
}
