//! Finished method bodies and their ILDasm-style listing.

use std::fmt::{self, Write};

use crate::assembly::{ExceptionClause, FieldId, Instruction, Label, ListingContext, LocalSlot};

/// An assembled method body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodBody {
    /// Method name, e.g. `<F>d__0.MoveNext`.
    pub name: String,
    /// Instructions; offsets are indices.
    pub instructions: Vec<Instruction>,
    /// Resolved label positions, indexed by [`Label`].
    pub labels: Vec<usize>,
    /// IL locals.
    pub locals: Vec<LocalSlot>,
    /// Exception clauses, innermost first.
    pub clauses: Vec<ExceptionClause>,
    /// Maximum evaluation stack depth.
    pub max_stack: u16,
}

impl MethodBody {
    /// Instruction index a label resolves to.
    #[must_use]
    pub fn target(&self, label: Label) -> usize {
        self.labels
            .get(label.0 as usize)
            .copied()
            .unwrap_or(usize::MAX)
    }

    /// Number of instructions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    /// Returns true for an empty body.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    /// Counts instructions matching `predicate`.
    pub fn count(&self, predicate: impl Fn(&Instruction) -> bool) -> usize {
        self.instructions.iter().filter(|i| predicate(i)).count()
    }

    /// Renders the body with symbolic operands resolved through `ctx`.
    ///
    /// # Errors
    ///
    /// Returns an error only if writing to the string buffer fails.
    pub fn listing(&self, ctx: &dyn ListingContext) -> Result<String, fmt::Error> {
        let mut out = String::new();
        writeln!(out, "// {}", self.name)?;
        writeln!(out, "// Code size {} (0x{:x})", self.len(), self.len())?;
        writeln!(out, ".maxstack {}", self.max_stack)?;
        if !self.locals.is_empty() {
            out.push_str(".locals init (");
            for (i, local) in self.locals.iter().enumerate() {
                if i > 0 {
                    out.push_str(",\n              ");
                }
                write!(out, "{} V_{}", local.ty, i)?;
                if let Some(name) = &local.name {
                    write!(out, " // {name}")?;
                }
            }
            out.push_str(")\n");
        }

        let blocks = self.blocks();
        let target = |label: Label| self.target(label);
        let mut stack: Vec<&ListingBlock> = Vec::new();
        let mut next = 0;

        for ip in 0..=self.instructions.len() {
            while stack.last().is_some_and(|b| b.end == ip) {
                stack.pop();
                writeln!(out, "{}}}", indent(stack.len()))?;
            }
            while next < blocks.len() && blocks[next].start == ip {
                let block = &blocks[next];
                next += 1;
                if !block.header.is_empty() {
                    writeln!(out, "{}{}", indent(stack.len()), block.header)?;
                }
                writeln!(out, "{}{{", indent(stack.len()))?;
                if block.end == ip {
                    writeln!(out, "{}}}", indent(stack.len()))?;
                } else {
                    stack.push(block);
                }
            }
            if let Some(instruction) = self.instructions.get(ip) {
                writeln!(
                    out,
                    "{}IL_{:04x}:  {}",
                    indent(stack.len()),
                    ip,
                    instruction.render(ctx, &target)?
                )?;
            }
        }
        Ok(out)
    }

    /// Structural blocks of the clause table, outermost first at equal start.
    fn blocks(&self) -> Vec<ListingBlock> {
        let mut blocks: Vec<ListingBlock> = Vec::new();
        for clause in &self.clauses {
            let is_new_try = !blocks
                .iter()
                .any(|b| b.is_try && b.start == clause.try_start && b.end == clause.try_end);
            if is_new_try {
                blocks.push(ListingBlock {
                    start: clause.try_start,
                    end: clause.try_end,
                    header: ".try".to_string(),
                    is_try: true,
                });
            }
            if let Some(filter_start) = clause.filter_start {
                blocks.push(ListingBlock {
                    start: filter_start,
                    end: clause.handler_start,
                    header: "filter".to_string(),
                    is_try: false,
                });
                blocks.push(ListingBlock {
                    start: clause.handler_start,
                    end: clause.handler_end,
                    header: String::new(),
                    is_try: false,
                });
            } else {
                let header = match &clause.catch_type {
                    Some(ty) if clause.is_catch() => format!("catch {ty}"),
                    _ => clause.kind_name().to_string(),
                };
                blocks.push(ListingBlock {
                    start: clause.handler_start,
                    end: clause.handler_end,
                    header,
                    is_try: false,
                });
            }
        }
        blocks.sort_by(|a, b| a.start.cmp(&b.start).then(b.end.cmp(&a.end)));
        blocks
    }
}

struct ListingBlock {
    start: usize,
    end: usize,
    header: String,
    is_try: bool,
}

fn indent(depth: usize) -> String {
    "  ".repeat(depth + 1)
}

/// Names fields by index; used when no layout is at hand.
struct IndexNames;

impl ListingContext for IndexNames {
    fn field(&self, id: FieldId) -> String {
        format!("field#{}", id.0)
    }

    fn builder(&self) -> String {
        "builder".to_string()
    }
}

impl fmt::Display for MethodBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.listing(&IndexNames)?)
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        assembly::{Instruction, InstructionAssembler},
        syntax::TypeRef,
    };

    #[test]
    fn test_listing_structure() {
        let mut asm = InstructionAssembler::new();
        let end = asm.new_label();
        asm.declare_local(TypeRef::Int32, None);
        asm.begin_try().unwrap();
        asm.emit(Instruction::LdcI4(5)).unwrap();
        asm.emit(Instruction::Stloc(0)).unwrap();
        asm.emit(Instruction::Leave(end)).unwrap();
        asm.begin_catch(TypeRef::exception()).unwrap();
        asm.emit(Instruction::Pop).unwrap();
        asm.emit(Instruction::Leave(end)).unwrap();
        asm.end_try().unwrap();
        asm.mark(end).unwrap();
        asm.emit(Instruction::Ret).unwrap();
        let body = asm.finish("M").unwrap();

        let listing = body.to_string();
        assert!(listing.contains(".locals init (int32 V_0)"));
        assert!(listing.contains(".try"));
        assert!(listing.contains("catch System.Exception"));
        assert!(listing.contains("IL_0002:  leave      IL_0005"));
        assert!(listing.contains("IL_0005:  ret"));

        let try_pos = listing.find(".try").unwrap();
        let catch_pos = listing.find("catch").unwrap();
        assert!(try_pos < catch_pos);
    }
}
