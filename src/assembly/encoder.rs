//! Assembly of method bodies with labels and structured exception regions.
//!
//! [`InstructionAssembler`] is the emitter used by code generation. It keeps instructions
//! symbolic (labels instead of offsets), records the evaluation-stack depth so that
//! branch targets and handler entries can be checked, and builds the exception-clause
//! table from properly bracketed `begin_*`/`end_try` calls.
//!
//! # Example
//!
//! ```rust
//! use asyncscope::assembly::{Instruction, InstructionAssembler};
//! use asyncscope::syntax::TypeRef;
//!
//! let mut asm = InstructionAssembler::new();
//! let done = asm.new_label();
//! asm.begin_try()?;
//! asm.emit(Instruction::Leave(done))?;
//! asm.begin_catch(TypeRef::exception())?;
//! asm.emit(Instruction::Pop)?;
//! asm.emit(Instruction::Leave(done))?;
//! asm.end_try()?;
//! asm.mark(done)?;
//! asm.emit(Instruction::Ret)?;
//!
//! let body = asm.finish("Example")?;
//! assert_eq!(body.clauses.len(), 1);
//! # Ok::<(), asyncscope::Error>(())
//! ```

use crate::{
    assembly::{
        exceptions::ranges_nest, ExceptionClause, ExceptionHandlerFlags, FlowType, Instruction,
        Label, MethodBody,
    },
    syntax::TypeRef,
    Result,
};

/// An IL local slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalSlot {
    /// Slot type.
    pub ty: TypeRef,
    /// Source name, if the slot holds a user local.
    pub name: Option<String>,
}

/// Handler block being emitted.
struct OpenHandler {
    flags: ExceptionHandlerFlags,
    filter_start: Option<usize>,
    handler_start: Option<usize>,
    catch_type: Option<TypeRef>,
}

/// Protected region being emitted.
struct OpenTry {
    try_start: usize,
    try_end: Option<usize>,
    handler: Option<OpenHandler>,
    has_catch: bool,
    has_finally: bool,
}

/// Emitter for [`MethodBody`]s.
pub struct InstructionAssembler {
    /// Emitted instructions
    instructions: Vec<Instruction>,
    /// Label positions, `None` until marked
    labels: Vec<Option<usize>>,
    /// Expected stack depth at each label, recorded from the first branch to it
    label_depths: Vec<Option<u16>>,
    /// Declared IL locals
    locals: Vec<LocalSlot>,
    /// Completed clauses, in completion order
    clauses: Vec<ExceptionClause>,
    /// Regions currently open, innermost last
    open: Vec<OpenTry>,
    /// Current stack depth
    current_stack_depth: u16,
    /// Maximum stack depth reached
    max_stack_depth: u16,
    /// Whether the current position is only reachable through a label
    unreachable: bool,
}

impl Default for InstructionAssembler {
    fn default() -> Self {
        Self::new()
    }
}

impl InstructionAssembler {
    /// Creates an empty assembler.
    #[must_use]
    pub fn new() -> Self {
        Self {
            instructions: Vec::new(),
            labels: Vec::new(),
            label_depths: Vec::new(),
            locals: Vec::new(),
            clauses: Vec::new(),
            open: Vec::new(),
            current_stack_depth: 0,
            max_stack_depth: 0,
            unreachable: false,
        }
    }

    /// Allocates a new, unmarked label.
    pub fn new_label(&mut self) -> Label {
        let label = Label(self.labels.len() as u32);
        self.labels.push(None);
        self.label_depths.push(None);
        label
    }

    /// Binds `label` to the next emitted instruction.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Malformed`] if the label is unknown or already marked.
    pub fn mark(&mut self, label: Label) -> Result<()> {
        let position = self.instructions.len();
        let slot = self
            .labels
            .get_mut(label.0 as usize)
            .ok_or_else(|| malformed_error!("Unknown label {}", label.0))?;
        if slot.is_some() {
            return Err(malformed_error!("Label {} marked twice", label.0));
        }
        *slot = Some(position);

        let expected = self.label_depths[label.0 as usize];
        if let Some(depth) = expected {
            if !self.unreachable && depth != self.current_stack_depth {
                return Err(malformed_error!(
                    "Stack depth mismatch at label {}: {} != {}",
                    label.0,
                    depth,
                    self.current_stack_depth
                ));
            }
            self.current_stack_depth = depth;
        } else if self.unreachable {
            self.current_stack_depth = 0;
        }
        self.unreachable = false;
        Ok(())
    }

    /// Position of the next emitted instruction.
    #[must_use]
    pub fn position(&self) -> usize {
        self.instructions.len()
    }

    /// Declares an IL local and returns its index.
    pub fn declare_local(&mut self, ty: TypeRef, name: Option<&str>) -> u16 {
        let index = self.locals.len() as u16;
        self.locals.push(LocalSlot {
            ty,
            name: name.map(str::to_string),
        });
        index
    }

    /// Returns true if the next instruction can only be reached through a label.
    #[must_use]
    pub fn is_unreachable(&self) -> bool {
        self.unreachable
    }

    /// Emits an instruction.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Malformed`] if the instruction pops more values than the
    /// evaluation stack holds.
    pub fn emit(&mut self, instruction: Instruction) -> Result<()> {
        let (pops, pushes) = instruction.stack_effect();
        if pops > self.current_stack_depth {
            if !self.unreachable {
                return Err(malformed_error!(
                    "Stack underflow at IL_{:04x} ({})",
                    self.instructions.len(),
                    instruction.mnemonic()
                ));
            }
            self.current_stack_depth = pops;
        }
        self.current_stack_depth = self.current_stack_depth - pops + pushes;
        self.max_stack_depth = self.max_stack_depth.max(self.current_stack_depth);

        let flow = instruction.flow();
        if flow == FlowType::Leave {
            self.current_stack_depth = 0;
        }
        for target in instruction.targets() {
            let slot = self
                .label_depths
                .get_mut(target.0 as usize)
                .ok_or_else(|| malformed_error!("Unknown label {}", target.0))?;
            if slot.is_none() {
                *slot = Some(self.current_stack_depth);
            }
        }

        self.instructions.push(instruction);

        if matches!(
            flow,
            FlowType::UnconditionalBranch
                | FlowType::Leave
                | FlowType::Throw
                | FlowType::Return
                | FlowType::EndFinally
                | FlowType::EndFilter
        ) {
            self.unreachable = true;
            self.current_stack_depth = 0;
        }
        Ok(())
    }

    /// Opens a protected block at the current position.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::MalformedRegion`] if values are left on the stack.
    pub fn begin_try(&mut self) -> Result<()> {
        if !self.unreachable && self.current_stack_depth != 0 {
            return Err(region_error!(
                "Protected block entered with {} values on the stack",
                self.current_stack_depth
            ));
        }
        self.open.push(OpenTry {
            try_start: self.instructions.len(),
            try_end: None,
            handler: None,
            has_catch: false,
            has_finally: false,
        });
        Ok(())
    }

    /// Starts a typed catch handler for the innermost open protected block.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::MalformedRegion`] if no block is open or the block already
    /// has a finally handler.
    pub fn begin_catch(&mut self, ty: TypeRef) -> Result<()> {
        self.begin_handler(OpenHandler {
            flags: ExceptionHandlerFlags::EXCEPTION,
            filter_start: None,
            handler_start: None,
            catch_type: Some(ty),
        })?;
        self.enter_handler_block(1);
        Ok(())
    }

    /// Starts the filter block of a filter clause.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::MalformedRegion`] if no block is open or the block already
    /// has a finally handler.
    pub fn begin_filter(&mut self) -> Result<()> {
        let position = self.instructions.len();
        self.begin_handler(OpenHandler {
            flags: ExceptionHandlerFlags::FILTER,
            filter_start: Some(position),
            handler_start: None,
            catch_type: None,
        })?;
        self.unreachable = false;
        self.current_stack_depth = 1;
        self.max_stack_depth = self.max_stack_depth.max(1);
        Ok(())
    }

    /// Starts the handler block following a filter block.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::MalformedRegion`] if no filter block is open.
    pub fn begin_filter_handler(&mut self) -> Result<()> {
        let position = self.instructions.len();
        let handler = self
            .open
            .last_mut()
            .and_then(|t| t.handler.as_mut())
            .filter(|h| h.flags == ExceptionHandlerFlags::FILTER && h.handler_start.is_none())
            .ok_or_else(|| region_error!("Filter handler without an open filter block"))?;
        handler.handler_start = Some(position);
        self.enter_handler_block(1);
        Ok(())
    }

    /// Starts the finally handler of the innermost open protected block.
    ///
    /// A protected block takes either catch handlers or a single finally handler; a
    /// `try/catch/finally` is emitted as a finally around a nested `try/catch`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::MalformedRegion`] if the block already has handlers.
    pub fn begin_finally(&mut self) -> Result<()> {
        if self.open.last().is_some_and(|t| t.has_catch) {
            return Err(region_error!(
                "Finally handler sharing a protected block with catch handlers"
            ));
        }
        self.begin_handler(OpenHandler {
            flags: ExceptionHandlerFlags::FINALLY,
            filter_start: None,
            handler_start: None,
            catch_type: None,
        })?;
        self.enter_handler_block(0);
        Ok(())
    }

    /// Closes the innermost protected block and its last handler.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::MalformedRegion`] if no block is open or it has no handler.
    pub fn end_try(&mut self) -> Result<()> {
        let open = self
            .open
            .pop()
            .ok_or_else(|| region_error!("end_try without an open protected block"))?;
        if open.handler.is_none() {
            return Err(region_error!(
                "Protected block at IL_{:04x} has no handler",
                open.try_start
            ));
        }
        let position = self.instructions.len();
        self.close_handler(open, position)?;
        self.unreachable = true;
        self.current_stack_depth = 0;
        Ok(())
    }

    /// Resolves labels, orders the clause table innermost-first and validates nesting.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::MalformedRegion`] for unclosed or improperly nested regions
    /// and [`crate::Error::Malformed`] for labels that were never marked.
    pub fn finish(self, name: impl Into<String>) -> Result<MethodBody> {
        if let Some(open) = self.open.last() {
            return Err(region_error!(
                "Protected block at IL_{:04x} was never closed",
                open.try_start
            ));
        }

        let mut labels = Vec::with_capacity(self.labels.len());
        for (index, position) in self.labels.iter().enumerate() {
            match position {
                Some(position) => labels.push(*position),
                None => {
                    let referenced = self
                        .instructions
                        .iter()
                        .any(|i| i.targets().contains(&Label(index as u32)));
                    if referenced {
                        return Err(malformed_error!("Label {} referenced but never marked", index));
                    }
                    labels.push(usize::MAX);
                }
            }
        }

        let mut clauses = self.clauses;
        // Stable: clauses sharing a protected block keep their source order.
        clauses.sort_by_key(ExceptionClause::try_len);
        validate_clauses(&clauses)?;

        Ok(MethodBody {
            name: name.into(),
            instructions: self.instructions,
            labels,
            locals: self.locals,
            clauses,
            max_stack: self.max_stack_depth,
        })
    }

    fn begin_handler(&mut self, handler: OpenHandler) -> Result<()> {
        let position = self.instructions.len();
        let mut open = self
            .open
            .pop()
            .ok_or_else(|| region_error!("Handler without an open protected block"))?;
        if open.has_finally {
            return Err(region_error!(
                "Protected block at IL_{:04x} already has a finally handler",
                open.try_start
            ));
        }
        if open.handler.is_some() {
            open = self.close_handler(open, position)?;
        } else {
            open.try_end = Some(position);
        }
        if handler.flags.contains(ExceptionHandlerFlags::FINALLY) {
            open.has_finally = true;
        } else {
            open.has_catch = true;
        }
        open.handler = Some(handler);
        self.open.push(open);
        Ok(())
    }

    fn close_handler(&mut self, mut open: OpenTry, position: usize) -> Result<OpenTry> {
        let handler = open
            .handler
            .take()
            .ok_or_else(|| region_error!("No handler to close"))?;
        let try_end = open
            .try_end
            .ok_or_else(|| region_error!("Handler closed before its protected block"))?;
        let handler_start = handler
            .handler_start
            .ok_or_else(|| region_error!("Filter block without a handler block"))?;

        self.clauses.push(ExceptionClause {
            flags: handler.flags,
            try_start: open.try_start,
            try_end,
            handler_start,
            handler_end: position,
            filter_start: handler.filter_start,
            catch_type: handler.catch_type,
        });
        Ok(open)
    }

    fn enter_handler_block(&mut self, depth: u16) {
        let position = self.instructions.len();
        if let Some(handler) = self.open.last_mut().and_then(|t| t.handler.as_mut()) {
            if handler.handler_start.is_none() {
                handler.handler_start = Some(position);
            }
        }
        self.unreachable = false;
        self.current_stack_depth = depth;
        self.max_stack_depth = self.max_stack_depth.max(depth);
    }
}

/// Checks ECMA-335 nesting: protected blocks and handler blocks of different clauses are
/// either disjoint or nested, and a handler never overlaps its own protected block.
fn validate_clauses(clauses: &[ExceptionClause]) -> Result<()> {
    for (i, a) in clauses.iter().enumerate() {
        let a_try = (a.try_start, a.try_end);
        let a_handler = (a.handler_area_start(), a.handler_end);
        if a_handler.0 < a_try.1 && a_try.0 < a_handler.1 {
            return Err(region_error!(
                "Handler of clause {} overlaps its protected block",
                i
            ));
        }
        if a.filter_start.is_some_and(|start| start > a.handler_start) {
            return Err(region_error!("Filter of clause {} follows its handler", i));
        }
        for b in &clauses[i + 1..] {
            let b_try = (b.try_start, b.try_end);
            let b_handler = (b.handler_area_start(), b.handler_end);
            if !ranges_nest(a_try, b_try)
                || !ranges_nest(a_handler, b_handler)
                || !ranges_nest(a_try, b_handler)
                || !ranges_nest(a_handler, b_try)
            {
                return Err(region_error!(
                    "Clauses at IL_{:04x} and IL_{:04x} overlap without nesting",
                    a.try_start,
                    b.try_start
                ));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    #[test]
    fn test_labels_resolve() {
        let mut asm = InstructionAssembler::new();
        let target = asm.new_label();
        asm.emit(Instruction::Br(target)).unwrap();
        asm.emit(Instruction::Nop).unwrap();
        asm.mark(target).unwrap();
        asm.emit(Instruction::Ret).unwrap();

        let body = asm.finish("M").unwrap();
        assert_eq!(body.target(target), 2);
    }

    #[test]
    fn test_unmarked_label_is_error() {
        let mut asm = InstructionAssembler::new();
        let target = asm.new_label();
        asm.emit(Instruction::Br(target)).unwrap();
        assert!(matches!(asm.finish("M"), Err(Error::Malformed { .. })));
    }

    #[test]
    fn test_stack_underflow() {
        let mut asm = InstructionAssembler::new();
        assert!(asm.emit(Instruction::Pop).is_err());
    }

    #[test]
    fn test_nested_clauses_innermost_first() {
        let mut asm = InstructionAssembler::new();
        let end = asm.new_label();
        asm.begin_try().unwrap();
        asm.begin_try().unwrap();
        asm.emit(Instruction::Leave(end)).unwrap();
        asm.begin_catch(TypeRef::exception()).unwrap();
        asm.emit(Instruction::Pop).unwrap();
        asm.emit(Instruction::Leave(end)).unwrap();
        asm.end_try().unwrap();
        asm.emit(Instruction::Leave(end)).unwrap();
        asm.begin_finally().unwrap();
        asm.emit(Instruction::Endfinally).unwrap();
        asm.end_try().unwrap();
        asm.mark(end).unwrap();
        asm.emit(Instruction::Ret).unwrap();

        let body = asm.finish("M").unwrap();
        assert_eq!(body.clauses.len(), 2);
        assert!(body.clauses[0].is_catch());
        assert!(body.clauses[1].is_finally());
        assert!(body.clauses[1].try_start <= body.clauses[0].try_start);
    }

    #[test]
    fn test_finally_after_catch_rejected() {
        let mut asm = InstructionAssembler::new();
        asm.begin_try().unwrap();
        asm.emit(Instruction::Nop).unwrap();
        asm.begin_catch(TypeRef::Object).unwrap();
        asm.emit(Instruction::Pop).unwrap();
        assert!(matches!(
            asm.begin_finally(),
            Err(Error::MalformedRegion { .. })
        ));
    }

    #[test]
    fn test_unclosed_region() {
        let mut asm = InstructionAssembler::new();
        asm.begin_try().unwrap();
        asm.emit(Instruction::Nop).unwrap();
        assert!(matches!(
            asm.finish("M"),
            Err(Error::MalformedRegion { .. })
        ));
    }

    #[test]
    fn test_filter_clause() {
        let mut asm = InstructionAssembler::new();
        let end = asm.new_label();
        asm.begin_try().unwrap();
        asm.emit(Instruction::Leave(end)).unwrap();
        asm.begin_filter().unwrap();
        asm.emit(Instruction::Pop).unwrap();
        asm.emit(Instruction::LdcI4(1)).unwrap();
        asm.emit(Instruction::Endfilter).unwrap();
        asm.begin_filter_handler().unwrap();
        asm.emit(Instruction::Pop).unwrap();
        asm.emit(Instruction::Leave(end)).unwrap();
        asm.end_try().unwrap();
        asm.mark(end).unwrap();
        asm.emit(Instruction::Ret).unwrap();

        let body = asm.finish("M").unwrap();
        let clause = &body.clauses[0];
        assert!(clause.is_filter());
        assert_eq!(clause.filter_start, Some(1));
        assert_eq!(clause.handler_start, 4);
        assert_eq!(body.max_stack, 1);
    }
}
