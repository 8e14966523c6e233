//! Exception-clause table of emitted method bodies.
//!
//! Offsets are instruction indices into [`crate::assembly::MethodBody::instructions`].
//! Ranges are half open. The table is ordered innermost-first, so a linear scan finds the
//! nearest enclosing clause first, which is what both the ECMA-335 first-pass search and
//! `leave` processing rely on.

use bitflags::bitflags;

use crate::syntax::TypeRef;

bitflags! {
    /// Exception handler flags defining the type of exception handling clause.
    ///
    /// These flags determine how the exception handler processes exceptions and
    /// control flow within try/catch/finally blocks.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ExceptionHandlerFlags: u16 {
        /// A typed exception clause.
        ///
        /// The `catch_type` field names the exception type this handler catches.
        const EXCEPTION = 0x0000;

        /// An exception filter and handler clause.
        ///
        /// The filter block runs during the first pass and decides whether the
        /// handler block takes the exception.
        const FILTER = 0x0001;

        /// A finally clause.
        ///
        /// Runs on every exit from the protected block: fall through, `leave`, and
        /// the second pass of exception dispatch.
        const FINALLY = 0x0002;

        /// A fault clause (finally that executes only on exception).
        const FAULT = 0x0004;
    }
}

/// One clause of the exception table.
///
/// # Layout
///
/// ```text
/// .try {
///     // try_start -> try_end
/// }
/// filter {
///     // filter_start -> handler_start (filter clauses only)
/// }
/// catch / finally {
///     // handler_start -> handler_end
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExceptionClause {
    /// Kind of clause.
    pub flags: ExceptionHandlerFlags,
    /// First instruction of the protected block.
    pub try_start: usize,
    /// One past the last instruction of the protected block.
    pub try_end: usize,
    /// First instruction of the handler block.
    pub handler_start: usize,
    /// One past the last instruction of the handler block.
    pub handler_end: usize,
    /// First instruction of the filter block, for filter clauses.
    pub filter_start: Option<usize>,
    /// Caught type, for typed clauses.
    pub catch_type: Option<TypeRef>,
}

impl ExceptionClause {
    /// Returns true if `ip` lies in the protected block.
    #[must_use]
    pub fn is_in_try(&self, ip: usize) -> bool {
        ip >= self.try_start && ip < self.try_end
    }

    /// Returns true if `ip` lies in the handler block.
    #[must_use]
    pub fn is_in_handler(&self, ip: usize) -> bool {
        ip >= self.handler_start && ip < self.handler_end
    }

    /// Returns true if `ip` lies in the filter block.
    #[must_use]
    pub fn is_in_filter(&self, ip: usize) -> bool {
        self.filter_start
            .is_some_and(|start| ip >= start && ip < self.handler_start)
    }

    /// First instruction of the whole handler area (filter included).
    #[must_use]
    pub fn handler_area_start(&self) -> usize {
        self.filter_start.unwrap_or(self.handler_start)
    }

    /// Returns true if `ip` lies in the filter or handler block.
    #[must_use]
    pub fn is_in_handler_area(&self, ip: usize) -> bool {
        ip >= self.handler_area_start() && ip < self.handler_end
    }

    /// Returns true for finally clauses.
    #[must_use]
    pub fn is_finally(&self) -> bool {
        self.flags.contains(ExceptionHandlerFlags::FINALLY)
    }

    /// Returns true for fault clauses.
    #[must_use]
    pub fn is_fault(&self) -> bool {
        self.flags.contains(ExceptionHandlerFlags::FAULT)
    }

    /// Returns true for filter clauses.
    #[must_use]
    pub fn is_filter(&self) -> bool {
        self.flags.contains(ExceptionHandlerFlags::FILTER)
    }

    /// Returns true for typed catch clauses.
    #[must_use]
    pub fn is_catch(&self) -> bool {
        self.flags == ExceptionHandlerFlags::EXCEPTION
    }

    /// Length of the protected block.
    #[must_use]
    pub fn try_len(&self) -> usize {
        self.try_end - self.try_start
    }

    /// Short name used in listings and diagnostics.
    #[must_use]
    pub fn kind_name(&self) -> &'static str {
        if self.is_finally() {
            "finally"
        } else if self.is_fault() {
            "fault"
        } else if self.is_filter() {
            "filter"
        } else {
            "catch"
        }
    }
}

/// Checks that two half-open ranges are disjoint or nested.
pub(crate) fn ranges_nest(a: (usize, usize), b: (usize, usize)) -> bool {
    let disjoint = a.1 <= b.0 || b.1 <= a.0;
    let a_in_b = a.0 >= b.0 && a.1 <= b.1;
    let b_in_a = b.0 >= a.0 && b.1 <= a.1;
    disjoint || a_in_b || b_in_a
}
