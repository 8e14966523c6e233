//! Async method descriptors and the fluent builder used to create them.

use crate::syntax::{Block, LocalDecl, LocalId, LocalKind, ReturnShape, Stmt, TypeRef};

/// A formal parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Parameter {
    /// Parameter name, used as the field name once hoisted.
    pub name: String,
    /// Parameter type.
    pub ty: TypeRef,
}

/// The receiver of an instance method.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Receiver {
    /// Static method.
    #[default]
    None,
    /// Instance method of a class.
    Reference(TypeRef),
    /// Instance method of a struct; the receiver is copied into the machine.
    Value(TypeRef),
}

impl Receiver {
    /// Type of the receiver, if any.
    #[must_use]
    pub fn ty(&self) -> Option<&TypeRef> {
        match self {
            Receiver::None => None,
            Receiver::Reference(ty) | Receiver::Value(ty) => Some(ty),
        }
    }
}

/// An async method ready to be lowered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AsyncMethodDescriptor {
    /// Method name.
    pub name: String,
    /// Ordinal of the method in its declaring type, used in the machine type name.
    pub ordinal: u32,
    /// Return shape selecting the builder.
    pub return_shape: ReturnShape,
    /// Formal parameters.
    pub parameters: Vec<Parameter>,
    /// Receiver.
    pub receiver: Receiver,
    /// Local declarations referenced by [`LocalId`].
    pub locals: Vec<LocalDecl>,
    /// Method body.
    pub body: Block,
}

impl AsyncMethodDescriptor {
    /// Looks up a local declaration.
    #[must_use]
    pub fn local(&self, id: LocalId) -> Option<&LocalDecl> {
        self.locals.get(id.index())
    }
}

/// Fluent builder for [`AsyncMethodDescriptor`].
///
/// # Example
///
/// ```rust
/// use asyncscope::prelude::*;
///
/// let mut m = MethodBuilder::new("G", ReturnShape::TaskOf(TypeRef::Int32));
/// let x = m.local("x", TypeRef::Int32);
/// m.push(Stmt::declare(x, Expr::int(1)));
/// m.push(Stmt::Return(Some(Expr::local(x))));
/// let method = m.build();
/// assert_eq!(method.locals.len(), 1);
/// ```
#[derive(Debug, Clone)]
pub struct MethodBuilder {
    method: AsyncMethodDescriptor,
}

impl MethodBuilder {
    /// Starts a static method with an empty body.
    #[must_use]
    pub fn new(name: impl Into<String>, return_shape: ReturnShape) -> Self {
        Self {
            method: AsyncMethodDescriptor {
                name: name.into(),
                ordinal: 0,
                return_shape,
                parameters: Vec::new(),
                receiver: Receiver::None,
                locals: Vec::new(),
                body: Block::default(),
            },
        }
    }

    /// Sets the method ordinal.
    #[must_use]
    pub fn ordinal(mut self, ordinal: u32) -> Self {
        self.method.ordinal = ordinal;
        self
    }

    /// Makes this an instance method.
    #[must_use]
    pub fn receiver(mut self, receiver: Receiver) -> Self {
        self.method.receiver = receiver;
        self
    }

    /// Declares a parameter and returns its index.
    pub fn param(&mut self, name: impl Into<String>, ty: TypeRef) -> u16 {
        let index = self.method.parameters.len() as u16;
        self.method.parameters.push(Parameter {
            name: name.into(),
            ty,
        });
        index
    }

    /// Declares a user local and returns its id.
    pub fn local(&mut self, name: impl Into<String>, ty: TypeRef) -> LocalId {
        let id = LocalId(self.method.locals.len() as u32);
        self.method.locals.push(LocalDecl {
            name: name.into(),
            ty,
            kind: LocalKind::User,
        });
        id
    }

    /// Appends a statement to the body.
    pub fn push(&mut self, stmt: Stmt) -> &mut Self {
        self.method.body.stmts.push(stmt);
        self
    }

    /// Appends several statements to the body.
    pub fn extend(&mut self, stmts: impl IntoIterator<Item = Stmt>) -> &mut Self {
        self.method.body.stmts.extend(stmts);
        self
    }

    /// Finishes the descriptor.
    #[must_use]
    pub fn build(self) -> AsyncMethodDescriptor {
        self.method
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::syntax::Expr;

    #[test]
    fn test_builder_assigns_ids() {
        let mut m = MethodBuilder::new("F", ReturnShape::Task).ordinal(3);
        let p = m.param("a", TypeRef::Int32);
        let x = m.local("x", TypeRef::String);
        let y = m.local("y", TypeRef::Int32);
        m.push(Stmt::declare(y, Expr::Param(p)));
        let method = m.build();

        assert_eq!(p, 0);
        assert_eq!(x, LocalId(0));
        assert_eq!(y, LocalId(1));
        assert_eq!(method.ordinal, 3);
        assert_eq!(method.local(y).map(|l| &l.ty), Some(&TypeRef::Int32));
        assert_eq!(method.body.stmts.len(), 1);
    }

    #[test]
    fn test_receiver_type() {
        let method = MethodBuilder::new("F", ReturnShape::Void)
            .receiver(Receiver::Value(TypeRef::named("S")))
            .build();
        assert_eq!(method.receiver.ty(), Some(&TypeRef::named("S")));
    }
}
