//! Exception objects and the exception class hierarchy.
//!
//! An exception carries a trace of the frames it was thrown through. `throw` starts a new
//! trace; `rethrow`, capture-and-throw and observing a faulted await append to the
//! existing one, so an exception that travels through a suspension keeps the frames
//! recorded before it.

use std::{collections::HashMap, sync::Mutex};

use crate::{syntax::TypeRef, Result};

/// Root of the exception hierarchy.
pub const SYSTEM_EXCEPTION: &str = "System.Exception";

/// An exception instance.
#[derive(Debug)]
pub struct ExceptionObject {
    /// Exception class, e.g. `System.InvalidOperationException`.
    pub class: String,
    /// The `Message` property.
    pub message: String,
    trace: Mutex<Vec<String>>,
}

impl ExceptionObject {
    /// Creates an exception with an empty trace.
    #[must_use]
    pub fn new(class: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            message: message.into(),
            trace: Mutex::new(Vec::new()),
        }
    }

    /// Frames the exception was thrown through, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::LockError`] if the trace lock is poisoned.
    pub fn trace(&self) -> Result<Vec<String>> {
        Ok(self.trace.lock()?.clone())
    }

    /// Starts a new trace at `frame`.
    pub(crate) fn reset_trace(&self, frame: String) -> Result<()> {
        let mut trace = self.trace.lock()?;
        trace.clear();
        trace.push(frame);
        Ok(())
    }

    /// Appends `frame` to the existing trace.
    pub(crate) fn append_trace(&self, frame: String) -> Result<()> {
        self.trace.lock()?.push(frame);
        Ok(())
    }
}

/// Parent links of the known exception classes.
///
/// Classes that were never registered are treated as direct subclasses of
/// `System.Exception`, so user-defined exceptions need no registration unless they
/// derive from something more specific.
#[derive(Debug, Clone)]
pub struct TypeHierarchy {
    parents: HashMap<String, String>,
}

impl Default for TypeHierarchy {
    fn default() -> Self {
        let mut hierarchy = Self {
            parents: HashMap::new(),
        };
        for (class, parent) in [
            ("System.SystemException", SYSTEM_EXCEPTION),
            ("System.ApplicationException", SYSTEM_EXCEPTION),
            ("System.InvalidOperationException", "System.SystemException"),
            ("System.ObjectDisposedException", "System.InvalidOperationException"),
            ("System.ArgumentException", "System.SystemException"),
            ("System.ArgumentNullException", "System.ArgumentException"),
            ("System.ArgumentOutOfRangeException", "System.ArgumentException"),
            ("System.ArithmeticException", "System.SystemException"),
            ("System.DivideByZeroException", "System.ArithmeticException"),
            ("System.OverflowException", "System.ArithmeticException"),
            ("System.NullReferenceException", "System.SystemException"),
            ("System.InvalidCastException", "System.SystemException"),
            ("System.IndexOutOfRangeException", "System.SystemException"),
            ("System.NotSupportedException", "System.SystemException"),
            ("System.NotImplementedException", "System.SystemException"),
            ("System.FormatException", "System.SystemException"),
            ("System.OperationCanceledException", "System.SystemException"),
            (
                "System.Threading.Tasks.TaskCanceledException",
                "System.OperationCanceledException",
            ),
        ] {
            hierarchy.register(class, parent);
        }
        hierarchy
    }
}

impl TypeHierarchy {
    /// Creates the hierarchy of the well-known `System` exceptions.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares `class` as a direct subclass of `parent`.
    pub fn register(&mut self, class: impl Into<String>, parent: impl Into<String>) {
        self.parents.insert(class.into(), parent.into());
    }

    /// Returns true if `class` is `ancestor` or derives from it.
    #[must_use]
    pub fn is_subclass(&self, class: &str, ancestor: &str) -> bool {
        let mut current = class;
        // Bounded: registration cycles are possible.
        for _ in 0..=self.parents.len() + 1 {
            if current == ancestor {
                return true;
            }
            if current == SYSTEM_EXCEPTION {
                return false;
            }
            current = self
                .parents
                .get(current)
                .map_or(SYSTEM_EXCEPTION, String::as_str);
        }
        false
    }

    /// Returns true if an exception of `class` is caught by a handler for `ty`.
    #[must_use]
    pub fn catches(&self, ty: &TypeRef, class: &str) -> bool {
        match ty {
            TypeRef::Object => true,
            TypeRef::Class(name) => self.is_subclass(class, name),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_well_known_chain() {
        let h = TypeHierarchy::new();
        assert!(h.is_subclass("System.DivideByZeroException", "System.ArithmeticException"));
        assert!(h.is_subclass("System.DivideByZeroException", SYSTEM_EXCEPTION));
        assert!(!h.is_subclass("System.ArgumentException", "System.InvalidOperationException"));
    }

    #[test]
    fn test_unknown_class_derives_from_exception() {
        let mut h = TypeHierarchy::new();
        assert!(h.is_subclass("MyError", SYSTEM_EXCEPTION));
        assert!(!h.is_subclass("MyError", "System.SystemException"));
        h.register("MyError", "System.InvalidOperationException");
        assert!(h.catches(&TypeRef::class("System.SystemException"), "MyError"));
        assert!(h.catches(&TypeRef::Object, "MyError"));
    }

    #[test]
    fn test_trace_reset_and_append() {
        let ex = ExceptionObject::new(SYSTEM_EXCEPTION, "boom");
        ex.append_trace("a".into()).unwrap();
        ex.append_trace("b".into()).unwrap();
        ex.reset_trace("c".into()).unwrap();
        ex.append_trace("d".into()).unwrap();
        assert_eq!(ex.trace().unwrap(), vec!["c", "d"]);
    }
}
