use crate::Span;
use crate::Ty;
use crate::symbols::{LabelId, LocalSymbol};

use super::Expr;

/// A `catch` clause of a try statement.
#[derive(Debug, Clone, PartialEq)]
pub struct CatchClause {
    /// Local receiving the caught exception, if the clause names one.
    pub local: Option<LocalSymbol>,
    pub exception_type: Ty,
    pub body: Stmt,
}

/// Statement node kinds.
///
/// `LocalDeclaration`, `If`, `While`, `Break`, `Continue`, `Yield` and
/// `YieldBreak` exist only before lowering. `Suspend` exists only after it.
#[derive(Debug, Clone, PartialEq)]
pub enum StmtKind {
    Block {
        locals: Vec<LocalSymbol>,
        statements: Vec<Stmt>,
    },
    /// Statements with no scope of their own.
    List(Vec<Stmt>),
    Expression(Expr),
    LocalDeclaration {
        local: LocalSymbol,
        initializer: Option<Expr>,
    },
    If {
        condition: Expr,
        then_branch: Box<Stmt>,
        else_branch: Option<Box<Stmt>>,
    },
    While {
        condition: Expr,
        body: Box<Stmt>,
    },
    Break,
    Continue,
    Return(Option<Expr>),
    /// `None` rethrows the exception being handled.
    Throw(Option<Expr>),
    Try {
        body: Box<Stmt>,
        catches: Vec<CatchClause>,
        finally: Option<Box<Stmt>>,
    },
    Yield(Expr),
    YieldBreak,
    Label(LabelId),
    Goto(LabelId),
    ConditionalGoto {
        condition: Expr,
        jump_if: bool,
        label: LabelId,
    },
    /// Jump table on an integer; out-of-range values go to `default`.
    Switch {
        value: Expr,
        targets: Vec<LabelId>,
        default: LabelId,
    },
    /// State-machine suspension: leave with `value`, resume at `resume`.
    Suspend {
        state: i32,
        value: Option<Expr>,
        resume: LabelId,
    },
    NoOp,
}

/// A statement with its sticky error marker and location.
#[derive(Debug, Clone, PartialEq)]
pub struct Stmt {
    pub kind: StmtKind,
    pub has_errors: bool,
    pub span: Span,
}

impl Stmt {
    pub fn new(kind: StmtKind) -> Self {
        let mut expr_errors = false;
        let mut stmt_errors = false;
        super::visit::for_each_child(
            &kind,
            &mut |expr| expr_errors |= expr.has_errors,
            &mut |stmt| stmt_errors |= stmt.has_errors,
        );
        Self {
            kind,
            has_errors: expr_errors || stmt_errors,
            span: Span::default(),
        }
    }

    pub fn at(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn with_errors(mut self) -> Self {
        self.has_errors = true;
        self
    }

    pub fn inherit_errors(mut self, original: &Stmt) -> Self {
        self.has_errors |= original.has_errors;
        if self.span.is_synthesized() {
            self.span = original.span;
        }
        self
    }

    pub fn block(locals: Vec<LocalSymbol>, statements: Vec<Stmt>) -> Self {
        Self::new(StmtKind::Block { locals, statements })
    }

    pub fn list(statements: Vec<Stmt>) -> Self {
        Self::new(StmtKind::List(statements))
    }

    pub fn expr(expr: Expr) -> Self {
        let span = expr.span;
        Self::new(StmtKind::Expression(expr)).at(span)
    }

    pub fn local_declaration(local: LocalSymbol, initializer: Option<Expr>) -> Self {
        Self::new(StmtKind::LocalDeclaration { local, initializer })
    }

    pub fn if_(condition: Expr, then_branch: Stmt, else_branch: Option<Stmt>) -> Self {
        Self::new(StmtKind::If {
            condition,
            then_branch: Box::new(then_branch),
            else_branch: else_branch.map(Box::new),
        })
    }

    pub fn while_(condition: Expr, body: Stmt) -> Self {
        Self::new(StmtKind::While {
            condition,
            body: Box::new(body),
        })
    }

    pub fn ret(value: Option<Expr>) -> Self {
        Self::new(StmtKind::Return(value))
    }

    pub fn throw(value: Option<Expr>) -> Self {
        Self::new(StmtKind::Throw(value))
    }

    pub fn try_(body: Stmt, catches: Vec<CatchClause>, finally: Option<Stmt>) -> Self {
        Self::new(StmtKind::Try {
            body: Box::new(body),
            catches,
            finally: finally.map(Box::new),
        })
    }

    pub fn yield_(value: Expr) -> Self {
        Self::new(StmtKind::Yield(value))
    }

    pub fn label(label: LabelId) -> Self {
        Self::new(StmtKind::Label(label))
    }

    pub fn goto(label: LabelId) -> Self {
        Self::new(StmtKind::Goto(label))
    }

    pub fn conditional_goto(condition: Expr, jump_if: bool, label: LabelId) -> Self {
        Self::new(StmtKind::ConditionalGoto {
            condition,
            jump_if,
            label,
        })
    }

    pub fn switch(value: Expr, targets: Vec<LabelId>, default: LabelId) -> Self {
        Self::new(StmtKind::Switch {
            value,
            targets,
            default,
        })
    }

    pub fn suspend(state: i32, value: Option<Expr>, resume: LabelId) -> Self {
        Self::new(StmtKind::Suspend {
            state,
            value,
            resume,
        })
    }

    pub fn no_op() -> Self {
        Self::new(StmtKind::NoOp)
    }

    /// Control never falls through to the next statement.
    pub fn is_terminator(&self) -> bool {
        matches!(
            self.kind,
            StmtKind::Return(_)
                | StmtKind::Throw(_)
                | StmtKind::Goto(_)
                | StmtKind::Break
                | StmtKind::Continue
                | StmtKind::YieldBreak
                | StmtKind::Switch { .. }
        )
    }
}
