//! Read-only and rebuilding traversals over the bound tree.

use super::{CatchClause, Expr, ExprKind, Stmt, StmtKind};

/// Call `f` on each direct child expression of `kind`.
///
/// Lambda bodies are statements and are not visited here.
pub(crate) fn for_each_child_expr<'a>(kind: &'a ExprKind, f: &mut dyn FnMut(&'a Expr)) {
    match kind {
        ExprKind::Literal(_)
        | ExprKind::Local(_)
        | ExprKind::Parameter { .. }
        | ExprKind::This
        | ExprKind::Base
        | ExprKind::Dup(_)
        | ExprKind::ConditionalReceiver
        | ExprKind::DefaultValue
        | ExprKind::Lambda { .. }
        | ExprKind::Error => {}
        ExprKind::Field { receiver, .. } | ExprKind::Delegate { receiver, .. } => {
            if let Some(receiver) = receiver {
                f(receiver);
            }
        }
        ExprKind::Element { array, indices } => {
            f(array);
            indices.iter().for_each(|index| f(index));
        }
        ExprKind::Deref(operand)
        | ExprKind::RefValue(operand)
        | ExprKind::AddressOf(operand)
        | ExprKind::Await(operand)
        | ExprKind::Unary { operand, .. }
        | ExprKind::Convert { operand, .. } => f(operand),
        ExprKind::Sequence {
            side_effects,
            value,
            ..
        } => {
            side_effects.iter().for_each(|effect| f(effect));
            f(value);
        }
        ExprKind::Assign { target, value } | ExprKind::CompoundAssign { target, value, .. } => {
            f(target);
            f(value);
        }
        ExprKind::Binary { left, right, .. } => {
            f(left);
            f(right);
        }
        ExprKind::Conditional {
            condition,
            when_true,
            when_false,
        } => {
            f(condition);
            f(when_true);
            f(when_false);
        }
        ExprKind::Call { receiver, args, .. } => {
            if let Some(receiver) = receiver {
                f(receiver);
            }
            args.iter().for_each(|arg| f(arg));
        }
        ExprKind::New { args, .. } => args.iter().for_each(|arg| f(arg)),
        ExprKind::NewArray { size, .. } => f(size),
        ExprKind::Dynamic { receiver, args, .. } => {
            f(receiver);
            args.iter().for_each(|arg| f(arg));
        }
    }
}

/// Call `on_expr`/`on_stmt` on each direct child of a statement.
pub(crate) fn for_each_child<'a>(
    kind: &'a StmtKind,
    on_expr: &mut dyn FnMut(&'a Expr),
    on_stmt: &mut dyn FnMut(&'a Stmt),
) {
    match kind {
        StmtKind::Block { statements, .. } | StmtKind::List(statements) => {
            statements.iter().for_each(|stmt| on_stmt(stmt));
        }
        StmtKind::Expression(expr) | StmtKind::Yield(expr) => on_expr(expr),
        StmtKind::LocalDeclaration { initializer, .. } => {
            if let Some(init) = initializer {
                on_expr(init);
            }
        }
        StmtKind::If {
            condition,
            then_branch,
            else_branch,
        } => {
            on_expr(condition);
            on_stmt(then_branch);
            if let Some(else_branch) = else_branch {
                on_stmt(else_branch);
            }
        }
        StmtKind::While { condition, body } => {
            on_expr(condition);
            on_stmt(body);
        }
        StmtKind::Return(value) | StmtKind::Throw(value) | StmtKind::Suspend { value, .. } => {
            if let Some(value) = value {
                on_expr(value);
            }
        }
        StmtKind::Try {
            body,
            catches,
            finally,
        } => {
            on_stmt(body);
            catches.iter().for_each(|clause| on_stmt(&clause.body));
            if let Some(finally) = finally {
                on_stmt(finally);
            }
        }
        StmtKind::ConditionalGoto { condition, .. } => on_expr(condition),
        StmtKind::Switch { value, .. } => on_expr(value),
        StmtKind::Break
        | StmtKind::Continue
        | StmtKind::YieldBreak
        | StmtKind::Label(_)
        | StmtKind::Goto(_)
        | StmtKind::NoOp => {}
    }
}

/// Read-only traversal. Override a method and call the matching `walk_*`
/// function to keep descending.
pub trait Visitor {
    fn visit_expr(&mut self, expr: &Expr) {
        walk_expr(self, expr);
    }

    fn visit_stmt(&mut self, stmt: &Stmt) {
        walk_stmt(self, stmt);
    }
}

pub fn walk_expr<V: Visitor + ?Sized>(visitor: &mut V, expr: &Expr) {
    for_each_child_expr(&expr.kind, &mut |child| visitor.visit_expr(child));
    if let ExprKind::Lambda { body, .. } = &expr.kind {
        visitor.visit_stmt(body);
    }
}

pub fn walk_stmt<V: Visitor + ?Sized>(visitor: &mut V, stmt: &Stmt) {
    // Two closures cannot both borrow the visitor, so split by kind first.
    let mut exprs: Vec<&Expr> = Vec::new();
    let mut stmts: Vec<&Stmt> = Vec::new();
    match &stmt.kind {
        StmtKind::If {
            condition,
            then_branch,
            else_branch,
        } => {
            visitor.visit_expr(condition);
            visitor.visit_stmt(then_branch);
            if let Some(else_branch) = else_branch {
                visitor.visit_stmt(else_branch);
            }
            return;
        }
        StmtKind::While { condition, body } => {
            visitor.visit_expr(condition);
            visitor.visit_stmt(body);
            return;
        }
        other => for_each_child(other, &mut |e| exprs.push(e), &mut |s| stmts.push(s)),
    }
    for expr in exprs {
        visitor.visit_expr(expr);
    }
    for child in stmts {
        visitor.visit_stmt(child);
    }
}

/// Rebuilding traversal. The default methods rebuild every node from its
/// rewritten children and carry the original error marker over.
pub trait Rewriter {
    fn rewrite_expr(&mut self, expr: Expr) -> Expr {
        rewrite_expr_children(self, expr)
    }

    fn rewrite_stmt(&mut self, stmt: Stmt) -> Stmt {
        rewrite_stmt_children(self, stmt)
    }
}

fn boxed<R: Rewriter + ?Sized>(rewriter: &mut R, expr: Box<Expr>) -> Box<Expr> {
    Box::new(rewriter.rewrite_expr(*expr))
}

fn all<R: Rewriter + ?Sized>(rewriter: &mut R, exprs: Vec<Expr>) -> Vec<Expr> {
    exprs
        .into_iter()
        .map(|expr| rewriter.rewrite_expr(expr))
        .collect()
}

pub fn rewrite_expr_children<R: Rewriter + ?Sized>(rewriter: &mut R, expr: Expr) -> Expr {
    let Expr {
        kind,
        ty,
        has_errors,
        span,
    } = expr;
    let kind = match kind {
        leaf @ (ExprKind::Literal(_)
        | ExprKind::Local(_)
        | ExprKind::Parameter { .. }
        | ExprKind::This
        | ExprKind::Base
        | ExprKind::Dup(_)
        | ExprKind::ConditionalReceiver
        | ExprKind::DefaultValue
        | ExprKind::Error) => leaf,
        ExprKind::Field {
            receiver,
            field,
            by_value,
        } => ExprKind::Field {
            receiver: receiver.map(|r| boxed(rewriter, r)),
            field,
            by_value,
        },
        ExprKind::Element { array, indices } => ExprKind::Element {
            array: boxed(rewriter, array),
            indices: all(rewriter, indices),
        },
        ExprKind::Deref(operand) => ExprKind::Deref(boxed(rewriter, operand)),
        ExprKind::RefValue(operand) => ExprKind::RefValue(boxed(rewriter, operand)),
        ExprKind::AddressOf(operand) => ExprKind::AddressOf(boxed(rewriter, operand)),
        ExprKind::Await(operand) => ExprKind::Await(boxed(rewriter, operand)),
        ExprKind::Sequence {
            locals,
            side_effects,
            value,
        } => ExprKind::Sequence {
            locals,
            side_effects: all(rewriter, side_effects),
            value: boxed(rewriter, value),
        },
        ExprKind::Assign { target, value } => ExprKind::Assign {
            target: boxed(rewriter, target),
            value: boxed(rewriter, value),
        },
        ExprKind::CompoundAssign { op, target, value } => ExprKind::CompoundAssign {
            op,
            target: boxed(rewriter, target),
            value: boxed(rewriter, value),
        },
        ExprKind::Binary { op, left, right } => ExprKind::Binary {
            op,
            left: boxed(rewriter, left),
            right: boxed(rewriter, right),
        },
        ExprKind::Unary { op, operand } => ExprKind::Unary {
            op,
            operand: boxed(rewriter, operand),
        },
        ExprKind::Conditional {
            condition,
            when_true,
            when_false,
        } => ExprKind::Conditional {
            condition: boxed(rewriter, condition),
            when_true: boxed(rewriter, when_true),
            when_false: boxed(rewriter, when_false),
        },
        ExprKind::Call {
            receiver,
            routine,
            args,
        } => ExprKind::Call {
            receiver: receiver.map(|r| boxed(rewriter, r)),
            routine,
            args: all(rewriter, args),
        },
        ExprKind::New { constructor, args } => ExprKind::New {
            constructor,
            args: all(rewriter, args),
        },
        ExprKind::NewArray { element, size } => ExprKind::NewArray {
            element,
            size: boxed(rewriter, size),
        },
        ExprKind::Convert {
            operand,
            conversion,
        } => ExprKind::Convert {
            operand: boxed(rewriter, operand),
            conversion,
        },
        ExprKind::Lambda { routine, body } => ExprKind::Lambda {
            routine,
            body: Box::new(rewriter.rewrite_stmt(*body)),
        },
        ExprKind::Delegate { routine, receiver } => ExprKind::Delegate {
            routine,
            receiver: receiver.map(|r| boxed(rewriter, r)),
        },
        ExprKind::Dynamic {
            member,
            receiver,
            args,
        } => ExprKind::Dynamic {
            member,
            receiver: boxed(rewriter, receiver),
            args: all(rewriter, args),
        },
    };
    let mut rebuilt = Expr::new(kind, ty).at(span);
    rebuilt.has_errors |= has_errors;
    rebuilt
}

fn stmts<R: Rewriter + ?Sized>(rewriter: &mut R, statements: Vec<Stmt>) -> Vec<Stmt> {
    statements
        .into_iter()
        .map(|stmt| rewriter.rewrite_stmt(stmt))
        .collect()
}

fn boxed_stmt<R: Rewriter + ?Sized>(rewriter: &mut R, stmt: Box<Stmt>) -> Box<Stmt> {
    Box::new(rewriter.rewrite_stmt(*stmt))
}

pub fn rewrite_stmt_children<R: Rewriter + ?Sized>(rewriter: &mut R, stmt: Stmt) -> Stmt {
    let Stmt {
        kind,
        has_errors,
        span,
    } = stmt;
    let kind = match kind {
        StmtKind::Block { locals, statements } => StmtKind::Block {
            locals,
            statements: stmts(rewriter, statements),
        },
        StmtKind::List(statements) => StmtKind::List(stmts(rewriter, statements)),
        StmtKind::Expression(expr) => StmtKind::Expression(rewriter.rewrite_expr(expr)),
        StmtKind::LocalDeclaration { local, initializer } => StmtKind::LocalDeclaration {
            local,
            initializer: initializer.map(|init| rewriter.rewrite_expr(init)),
        },
        StmtKind::If {
            condition,
            then_branch,
            else_branch,
        } => StmtKind::If {
            condition: rewriter.rewrite_expr(condition),
            then_branch: boxed_stmt(rewriter, then_branch),
            else_branch: else_branch.map(|e| boxed_stmt(rewriter, e)),
        },
        StmtKind::While { condition, body } => StmtKind::While {
            condition: rewriter.rewrite_expr(condition),
            body: boxed_stmt(rewriter, body),
        },
        StmtKind::Return(value) => StmtKind::Return(value.map(|v| rewriter.rewrite_expr(v))),
        StmtKind::Throw(value) => StmtKind::Throw(value.map(|v| rewriter.rewrite_expr(v))),
        StmtKind::Try {
            body,
            catches,
            finally,
        } => StmtKind::Try {
            body: boxed_stmt(rewriter, body),
            catches: catches
                .into_iter()
                .map(|clause| CatchClause {
                    local: clause.local,
                    exception_type: clause.exception_type,
                    body: rewriter.rewrite_stmt(clause.body),
                })
                .collect(),
            finally: finally.map(|f| boxed_stmt(rewriter, f)),
        },
        StmtKind::Yield(value) => StmtKind::Yield(rewriter.rewrite_expr(value)),
        StmtKind::ConditionalGoto {
            condition,
            jump_if,
            label,
        } => StmtKind::ConditionalGoto {
            condition: rewriter.rewrite_expr(condition),
            jump_if,
            label,
        },
        StmtKind::Switch {
            value,
            targets,
            default,
        } => StmtKind::Switch {
            value: rewriter.rewrite_expr(value),
            targets,
            default,
        },
        StmtKind::Suspend {
            state,
            value,
            resume,
        } => StmtKind::Suspend {
            state,
            value: value.map(|v| rewriter.rewrite_expr(v)),
            resume,
        },
        leaf @ (StmtKind::Break
        | StmtKind::Continue
        | StmtKind::YieldBreak
        | StmtKind::Label(_)
        | StmtKind::Goto(_)
        | StmtKind::NoOp) => leaf,
    };
    let mut rebuilt = Stmt::new(kind).at(span);
    rebuilt.has_errors |= has_errors;
    rebuilt
}

struct Finder<'a> {
    expr_pred: Option<&'a dyn Fn(&Expr) -> bool>,
    stmt_pred: Option<&'a dyn Fn(&Stmt) -> bool>,
    found: bool,
}

impl Visitor for Finder<'_> {
    fn visit_expr(&mut self, expr: &Expr) {
        if self.found {
            return;
        }
        if self.expr_pred.is_some_and(|pred| pred(expr)) {
            self.found = true;
            return;
        }
        walk_expr(self, expr);
    }

    fn visit_stmt(&mut self, stmt: &Stmt) {
        if self.found {
            return;
        }
        if self.stmt_pred.is_some_and(|pred| pred(stmt)) {
            self.found = true;
            return;
        }
        walk_stmt(self, stmt);
    }
}

/// Whether any expression under `stmt` (lambda bodies included) satisfies `pred`.
pub fn contains_expr(stmt: &Stmt, pred: &dyn Fn(&Expr) -> bool) -> bool {
    let mut finder = Finder {
        expr_pred: Some(pred),
        stmt_pred: None,
        found: false,
    };
    finder.visit_stmt(stmt);
    finder.found
}

/// Whether `stmt` or any statement under it satisfies `pred`.
pub fn contains_stmt(stmt: &Stmt, pred: &dyn Fn(&Stmt) -> bool) -> bool {
    let mut finder = Finder {
        expr_pred: None,
        stmt_pred: Some(pred),
        found: false,
    };
    finder.visit_stmt(stmt);
    finder.found
}
