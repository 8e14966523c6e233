//! Statements and expressions of the source model.
//!
//! The model is deliberately small: it covers the constructs whose lowering interacts with
//! suspension points (structured control flow, `goto`, exception regions, short-circuit
//! operators and calls). Everything that does not affect the state machine is represented
//! as an opaque [`Expr::Call`].

use crate::syntax::TypeRef;

/// Index of a local in [`crate::syntax::AsyncMethodDescriptor::locals`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LocalId(pub u32);

impl LocalId {
    /// Index into the locals table.
    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Origin of a local.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LocalKind {
    /// Declared by the user.
    User,
    /// Temporary introduced to preserve evaluation order around an await.
    Spill,
    /// Pending exception, pending branch or stashed value of a rewritten exception region.
    Wrap,
}

/// A local variable declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalDecl {
    /// Source name, or a synthesized one.
    pub name: String,
    /// Declared type.
    pub ty: TypeRef,
    /// Where the local comes from.
    pub kind: LocalKind,
}

/// An assignable location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Place {
    /// A local variable.
    Local(LocalId),
    /// A method parameter.
    Param(u16),
}

/// Binary operators. `And`/`Or` are the non short-circuiting forms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    /// `+` (concatenation for strings)
    Add,
    /// `-`
    Sub,
    /// `*`
    Mul,
    /// `/`
    Div,
    /// `%`
    Rem,
    /// `&`
    And,
    /// `|`
    Or,
    /// `^`
    Xor,
    /// `==`
    Eq,
    /// `!=`
    Ne,
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `>=`
    Ge,
}

impl BinaryOp {
    /// Returns true for operators producing a boolean.
    #[must_use]
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinaryOp::Eq | BinaryOp::Ne | BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge
        )
    }
}

/// Unary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    /// Arithmetic negation.
    Neg,
    /// Logical not.
    Not,
}

/// An expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    /// Integer literal.
    Int(i32),
    /// Boolean literal.
    Bool(bool),
    /// String literal.
    Str(String),
    /// `null`
    Null,
    /// Read of a local.
    Local(LocalId),
    /// Read of a parameter.
    Param(u16),
    /// The receiver.
    This,
    /// Binary operation; both operands are always evaluated, left first.
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    /// Unary operation.
    Unary(UnaryOp, Box<Expr>),
    /// `a && b`
    AndAlso(Box<Expr>, Box<Expr>),
    /// `a || b`
    OrElse(Box<Expr>, Box<Expr>),
    /// `c ? a : b`
    Conditional(Box<Expr>, Box<Expr>, Box<Expr>),
    /// Call of a host function or of another async method.
    Call {
        /// Qualified name, e.g. `Console.WriteLine`.
        name: String,
        /// Arguments, evaluated left to right.
        args: Vec<Expr>,
        /// Return type.
        ty: TypeRef,
    },
    /// `await e`
    Await(Box<Expr>),
    /// `e as T` (null when the instance is not a `T`).
    IsInst(Box<Expr>, TypeRef),
    /// `(T) e`
    Cast(Box<Expr>, TypeRef),
}

impl Expr {
    /// Integer literal.
    #[must_use]
    pub fn int(value: i32) -> Self {
        Expr::Int(value)
    }

    /// String literal.
    #[must_use]
    pub fn string(value: impl Into<String>) -> Self {
        Expr::Str(value.into())
    }

    /// Read of a local.
    #[must_use]
    pub fn local(id: LocalId) -> Self {
        Expr::Local(id)
    }

    /// Binary operation.
    #[must_use]
    pub fn binary(op: BinaryOp, left: Expr, right: Expr) -> Self {
        Expr::Binary(op, Box::new(left), Box::new(right))
    }

    /// `left + right`
    #[must_use]
    pub fn add(left: Expr, right: Expr) -> Self {
        Expr::binary(BinaryOp::Add, left, right)
    }

    /// `left == right`
    #[must_use]
    pub fn eq(left: Expr, right: Expr) -> Self {
        Expr::binary(BinaryOp::Eq, left, right)
    }

    /// `!operand`
    #[must_use]
    pub fn not(operand: Expr) -> Self {
        Expr::Unary(UnaryOp::Not, Box::new(operand))
    }

    /// `left && right`
    #[must_use]
    pub fn and_also(left: Expr, right: Expr) -> Self {
        Expr::AndAlso(Box::new(left), Box::new(right))
    }

    /// `left || right`
    #[must_use]
    pub fn or_else(left: Expr, right: Expr) -> Self {
        Expr::OrElse(Box::new(left), Box::new(right))
    }

    /// `cond ? then : otherwise`
    #[must_use]
    pub fn conditional(cond: Expr, then: Expr, otherwise: Expr) -> Self {
        Expr::Conditional(Box::new(cond), Box::new(then), Box::new(otherwise))
    }

    /// Call returning `ty`.
    #[must_use]
    pub fn call(name: impl Into<String>, args: Vec<Expr>, ty: TypeRef) -> Self {
        Expr::Call {
            name: name.into(),
            args,
            ty,
        }
    }

    /// `await operand`
    #[must_use]
    pub fn await_(operand: Expr) -> Self {
        Expr::Await(Box::new(operand))
    }

    /// `(ty) operand`
    #[must_use]
    pub fn cast(operand: Expr, ty: TypeRef) -> Self {
        Expr::Cast(Box::new(operand), ty)
    }

    /// Returns true if an `await` occurs anywhere in this expression.
    #[must_use]
    pub fn contains_await(&self) -> bool {
        match self {
            Expr::Await(_) => true,
            Expr::Int(_)
            | Expr::Bool(_)
            | Expr::Str(_)
            | Expr::Null
            | Expr::Local(_)
            | Expr::Param(_)
            | Expr::This => false,
            Expr::Binary(_, a, b) | Expr::AndAlso(a, b) | Expr::OrElse(a, b) => {
                a.contains_await() || b.contains_await()
            }
            Expr::Conditional(c, a, b) => {
                c.contains_await() || a.contains_await() || b.contains_await()
            }
            Expr::Unary(_, e) | Expr::IsInst(e, _) | Expr::Cast(e, _) => e.contains_await(),
            Expr::Call { args, .. } => args.iter().any(Expr::contains_await),
        }
    }

    /// Returns true if evaluating this expression twice, or later, yields the same value
    /// with no side effects.
    ///
    /// Locals and parameters qualify because nothing but the method itself can write them.
    #[must_use]
    pub fn is_stable(&self) -> bool {
        matches!(
            self,
            Expr::Int(_)
                | Expr::Bool(_)
                | Expr::Str(_)
                | Expr::Null
                | Expr::Local(_)
                | Expr::Param(_)
                | Expr::This
        )
    }
}

/// A sequence of statements forming a scope.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Block {
    /// Statements in order.
    pub stmts: Vec<Stmt>,
}

impl Block {
    /// Creates a block.
    #[must_use]
    pub fn new(stmts: Vec<Stmt>) -> Self {
        Self { stmts }
    }

    /// Returns true if a suspension point occurs anywhere in the block.
    #[must_use]
    pub fn contains_await(&self) -> bool {
        self.stmts.iter().any(Stmt::contains_await)
    }
}

impl From<Vec<Stmt>> for Block {
    fn from(stmts: Vec<Stmt>) -> Self {
        Self { stmts }
    }
}

/// A `catch` clause.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatchClause {
    /// Caught type; `Object` catches everything.
    pub ty: TypeRef,
    /// Variable bound to the exception, if any.
    pub variable: Option<LocalId>,
    /// `when (...)` filter. May read `variable`.
    pub filter: Option<Expr>,
    /// Handler body.
    pub body: Block,
}

impl CatchClause {
    /// `catch (ty variable) { body }`
    #[must_use]
    pub fn new(ty: TypeRef, variable: Option<LocalId>, body: Vec<Stmt>) -> Self {
        Self {
            ty,
            variable,
            filter: None,
            body: Block::new(body),
        }
    }

    /// Adds a `when (...)` filter.
    #[must_use]
    pub fn when(mut self, filter: Expr) -> Self {
        self.filter = Some(filter);
        self
    }
}

/// A `try` statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TryStmt {
    /// Protected body.
    pub body: Block,
    /// Catch clauses, tried in order.
    pub catches: Vec<CatchClause>,
    /// Finally block.
    pub finally: Option<Block>,
}

/// A statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Stmt {
    /// Nested scope.
    Block(Block),
    /// Local declaration with optional initializer.
    Local {
        /// Declared local.
        local: LocalId,
        /// Initializer.
        init: Option<Expr>,
    },
    /// Assignment.
    Assign {
        /// Target.
        target: Place,
        /// Assigned value.
        value: Expr,
    },
    /// Expression evaluated for its side effects.
    Expr(Expr),
    /// `if (cond) then else otherwise`
    If {
        /// Condition.
        cond: Expr,
        /// Taken branch.
        then: Block,
        /// Else branch.
        otherwise: Option<Block>,
    },
    /// `while (cond) body`
    While {
        /// Loop condition.
        cond: Expr,
        /// Loop body.
        body: Block,
    },
    /// `break;`
    Break,
    /// `continue;`
    Continue,
    /// `name:`
    Label(String),
    /// `goto name;`
    Goto(String),
    /// `return;` / `return expr;`
    Return(Option<Expr>),
    /// `throw expr;`, or `throw;` when `None`.
    Throw(Option<Expr>),
    /// `try` statement.
    Try(TryStmt),
    /// A suspension point, produced by lowering. `point` is the state number.
    Await {
        /// Awaited expression; contains no nested await.
        operand: Expr,
        /// Receives the result, if used.
        target: Option<Place>,
        /// State number assigned in evaluation order.
        point: u32,
    },
    /// Rethrow of a stashed exception, produced by lowering. Null is a no-op, an exception
    /// is thrown with its original trace preserved, anything else is thrown as is.
    RethrowCaptured(Expr),
}

impl Stmt {
    /// `local = value;` where `local` is already declared.
    #[must_use]
    pub fn assign(local: LocalId, value: Expr) -> Self {
        Stmt::Assign {
            target: Place::Local(local),
            value,
        }
    }

    /// `T local = init;`
    #[must_use]
    pub fn declare(local: LocalId, init: Expr) -> Self {
        Stmt::Local {
            local,
            init: Some(init),
        }
    }

    /// `if (cond) { then }`
    #[must_use]
    pub fn if_then(cond: Expr, then: Vec<Stmt>) -> Self {
        Stmt::If {
            cond,
            then: Block::new(then),
            otherwise: None,
        }
    }

    /// `while (cond) { body }`
    #[must_use]
    pub fn while_loop(cond: Expr, body: Vec<Stmt>) -> Self {
        Stmt::While {
            cond,
            body: Block::new(body),
        }
    }

    /// `await operand;`
    #[must_use]
    pub fn await_(operand: Expr) -> Self {
        Stmt::Expr(Expr::await_(operand))
    }

    /// `try { body } finally { finally }`
    #[must_use]
    pub fn try_finally(body: Vec<Stmt>, finally: Vec<Stmt>) -> Self {
        Stmt::Try(TryStmt {
            body: Block::new(body),
            catches: Vec::new(),
            finally: Some(Block::new(finally)),
        })
    }

    /// `try { body } catch ...`
    #[must_use]
    pub fn try_catch(body: Vec<Stmt>, catches: Vec<CatchClause>) -> Self {
        Stmt::Try(TryStmt {
            body: Block::new(body),
            catches,
            finally: None,
        })
    }

    /// `try { body } catch ... finally { finally }`
    #[must_use]
    pub fn try_catch_finally(
        body: Vec<Stmt>,
        catches: Vec<CatchClause>,
        finally: Vec<Stmt>,
    ) -> Self {
        Stmt::Try(TryStmt {
            body: Block::new(body),
            catches,
            finally: Some(Block::new(finally)),
        })
    }

    /// Returns true if a suspension point occurs anywhere in the statement.
    #[must_use]
    pub fn contains_await(&self) -> bool {
        match self {
            Stmt::Block(block) => block.contains_await(),
            Stmt::Local { init, .. } => init.as_ref().is_some_and(Expr::contains_await),
            Stmt::Assign { value, .. } => value.contains_await(),
            Stmt::Expr(expr) | Stmt::RethrowCaptured(expr) => expr.contains_await(),
            Stmt::If {
                cond,
                then,
                otherwise,
            } => {
                cond.contains_await()
                    || then.contains_await()
                    || otherwise.as_ref().is_some_and(Block::contains_await)
            }
            Stmt::While { cond, body } => cond.contains_await() || body.contains_await(),
            Stmt::Break | Stmt::Continue | Stmt::Label(_) | Stmt::Goto(_) => false,
            Stmt::Return(expr) | Stmt::Throw(expr) => {
                expr.as_ref().is_some_and(Expr::contains_await)
            }
            Stmt::Try(t) => {
                t.body.contains_await()
                    || t.catches.iter().any(|c| {
                        c.body.contains_await()
                            || c.filter.as_ref().is_some_and(Expr::contains_await)
                    })
                    || t.finally.as_ref().is_some_and(Block::contains_await)
            }
            Stmt::Await { .. } => true,
        }
    }

    /// Returns true if control never falls through to the next statement.
    #[must_use]
    pub fn is_jump(&self) -> bool {
        matches!(
            self,
            Stmt::Break | Stmt::Continue | Stmt::Goto(_) | Stmt::Return(_) | Stmt::Throw(_)
        )
    }
}
