//! Suspension-in-handler rewrite.
//!
//! A state machine suspends by leaving the protected region it is in. A
//! `finally` would run on every suspension, and a catch handler cannot be
//! re-entered, so every `try` that contains a suspension point is rewritten
//! so that no handler spans one:
//!
//! ```text
//! try { B } finally { F }
//!
//! pendingException = null; pendingBranch = 0;
//! try { B' } catch (object e) { pendingException = e; }
//! finally_label:
//!     F
//!     if (pendingException != null) throw pendingException;
//!     switch (pendingBranch) { 1: return v; 2: goto L; ... }
//! ```
//!
//! `B'` is `B` with every exit (return, yield break, goto out of the
//! region) replaced by "record which exit, goto finally_label". Catch
//! clauses that contain suspension points store the exception and a clause
//! number, and the handler code runs after the region ends.

use kiln_core::bound::{
    CatchClause, Expr, ExprKind, Rewriter, Stmt, StmtKind, Visitor, rewrite_stmt_children,
    walk_expr, walk_stmt,
};
use kiln_core::symbols::{LabelId, LocalSymbol};
use kiln_core::{Span, Ty};
use rustc_hash::FxHashSet;

use crate::factory::{assign_local, equals, from_object, goto_if};

/// Rewrite every `try` of `body` that contains a suspension point.
#[cfg_attr(feature = "profiling", profiling::function)]
pub fn rewrite(body: Stmt) -> Stmt {
    HandlerRewriter.rewrite_stmt(body)
}

/// Whether `stmt` contains a `yield` or `await` of its own routine.
pub fn contains_suspension(stmt: &Stmt) -> bool {
    let mut finder = SuspensionFinder { found: false };
    finder.visit_stmt(stmt);
    finder.found
}

struct SuspensionFinder {
    found: bool,
}

impl Visitor for SuspensionFinder {
    fn visit_expr(&mut self, expr: &Expr) {
        match expr.kind {
            ExprKind::Await(_) => self.found = true,
            ExprKind::Lambda { .. } => {}
            _ if !self.found => walk_expr(self, expr),
            _ => {}
        }
    }

    fn visit_stmt(&mut self, stmt: &Stmt) {
        if matches!(stmt.kind, StmtKind::Yield(_) | StmtKind::Suspend { .. }) {
            self.found = true;
        }
        if !self.found {
            walk_stmt(self, stmt);
        }
    }
}

struct HandlerRewriter;

fn finish(mut stmt: Stmt, has_errors: bool, span: Span) -> Stmt {
    stmt.has_errors |= has_errors;
    if stmt.span.is_synthesized() {
        stmt.span = span;
    }
    stmt
}

impl Rewriter for HandlerRewriter {
    fn rewrite_expr(&mut self, expr: Expr) -> Expr {
        // Lambda bodies belong to other routines.
        if matches!(expr.kind, ExprKind::Lambda { .. }) {
            return expr;
        }
        kiln_core::bound::rewrite_expr_children(self, expr)
    }

    fn rewrite_stmt(&mut self, stmt: Stmt) -> Stmt {
        match stmt.kind {
            StmtKind::Try { .. } if contains_suspension(&stmt) => {}
            _ => return rewrite_stmt_children(self, stmt),
        }
        let Stmt {
            kind,
            has_errors,
            span,
        } = stmt;
        let StmtKind::Try {
            body,
            catches,
            finally,
        } = kind
        else {
            return rewrite_stmt_children(self, Stmt::new(kind));
        };

        let body = self.rewrite_stmt(*body);
        let catches: Vec<CatchClause> = catches
            .into_iter()
            .map(|clause| CatchClause {
                body: self.rewrite_stmt(clause.body),
                ..clause
            })
            .collect();
        let finally = finally.map(|f| self.rewrite_stmt(*f));

        let protected = if catches.is_empty() {
            body
        } else if catches.iter().any(|c| contains_suspension(&c.body)) {
            hoist_catches(body, catches)
        } else {
            Stmt::try_(body, catches, None)
        };

        let rewritten = match finally {
            Some(finally) => pending_finally(protected, finally),
            None => protected,
        };
        finish(rewritten, has_errors, span)
    }
}

// ============================================================================
// Catch clauses
// ============================================================================

fn hoist_catches(body: Stmt, catches: Vec<CatchClause>) -> Stmt {
    let caught = LocalSymbol::synthesized("<>caught", Ty::Object);
    let clause_number = LocalSymbol::synthesized("<>catchKind", Ty::Int);
    let end = LabelId::fresh();

    let mut recorded = Vec::with_capacity(catches.len());
    let mut targets = vec![end];
    let mut handlers = Vec::new();

    for (index, clause) in catches.into_iter().enumerate() {
        let number = index as i64 + 1;
        recorded.push(CatchClause {
            local: Some(caught.clone()),
            exception_type: clause.exception_type.clone(),
            body: assign_local(&clause_number, Expr::int(number)),
        });

        let label = LabelId::fresh();
        targets.push(label);
        handlers.push(Stmt::label(label));
        if let Some(local) = &clause.local {
            handlers.push(assign_local(
                local,
                from_object(Expr::local(&caught), &clause.exception_type),
            ));
        }
        let mut rethrow = RethrowRewriter { caught: &caught };
        handlers.push(rethrow.rewrite_stmt(clause.body));
        handlers.push(Stmt::goto(end));
    }

    let mut statements = vec![
        assign_local(&caught, Expr::null(Ty::Object)),
        assign_local(&clause_number, Expr::int(0)),
        Stmt::try_(body, recorded, None),
        Stmt::switch(Expr::local(&clause_number), targets, end),
    ];
    statements.extend(handlers);
    statements.push(Stmt::label(end));
    Stmt::block(vec![caught, clause_number], statements)
}

/// Turns `throw;` of a moved handler into a throw of the stored exception.
struct RethrowRewriter<'a> {
    caught: &'a LocalSymbol,
}

impl Rewriter for RethrowRewriter<'_> {
    fn rewrite_expr(&mut self, expr: Expr) -> Expr {
        expr
    }

    fn rewrite_stmt(&mut self, stmt: Stmt) -> Stmt {
        match stmt.kind {
            StmtKind::Throw(None) => {
                Stmt::throw(Some(Expr::local(self.caught))).inherit_errors(&stmt)
            }
            // A nested handler's `throw;` refers to its own exception.
            StmtKind::Try {
                body,
                catches,
                finally,
            } => {
                let rewritten = Stmt::try_(
                    self.rewrite_stmt(*body),
                    catches,
                    finally.map(|f| self.rewrite_stmt(*f)),
                );
                finish(rewritten, stmt.has_errors, stmt.span)
            }
            _ => rewrite_stmt_children(self, stmt),
        }
    }
}

// ============================================================================
// Finally blocks
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
enum Exit {
    Return,
    YieldBreak,
    Goto(LabelId),
}

struct ExitRewriter {
    finally_label: LabelId,
    pending_branch: LocalSymbol,
    return_value: Option<LocalSymbol>,
    inner_labels: FxHashSet<LabelId>,
    exits: Vec<Exit>,
}

impl ExitRewriter {
    /// Branch code of `exit`; zero means "fall through".
    fn code_for(&mut self, exit: Exit) -> i64 {
        let index = match self.exits.iter().position(|e| *e == exit) {
            Some(index) => index,
            None => {
                self.exits.push(exit);
                self.exits.len() - 1
            }
        };
        index as i64 + 1
    }

    fn leave_through_finally(&mut self, exit: Exit) -> Vec<Stmt> {
        let code = self.code_for(exit);
        vec![
            assign_local(&self.pending_branch, Expr::int(code)),
            Stmt::goto(self.finally_label),
        ]
    }

    fn leaves(&self, label: LabelId) -> bool {
        !self.inner_labels.contains(&label)
    }
}

impl Rewriter for ExitRewriter {
    fn rewrite_expr(&mut self, expr: Expr) -> Expr {
        expr
    }

    fn rewrite_stmt(&mut self, stmt: Stmt) -> Stmt {
        let Stmt {
            kind,
            has_errors,
            span,
        } = stmt;
        let rewritten = match kind {
            StmtKind::Return(value) => {
                let mut statements = Vec::new();
                if let Some(value) = value {
                    let local = self
                        .return_value
                        .get_or_insert_with(|| LocalSymbol::synthesized("<>returnValue", value.ty.clone()))
                        .clone();
                    statements.push(assign_local(&local, value));
                }
                statements.extend(self.leave_through_finally(Exit::Return));
                Stmt::list(statements)
            }
            StmtKind::YieldBreak => Stmt::list(self.leave_through_finally(Exit::YieldBreak)),
            StmtKind::Goto(label) if self.leaves(label) => {
                Stmt::list(self.leave_through_finally(Exit::Goto(label)))
            }
            StmtKind::ConditionalGoto {
                condition,
                jump_if,
                label,
            } if self.leaves(label) => {
                let skip = LabelId::fresh();
                let mut statements = vec![goto_if(condition, !jump_if, skip)];
                statements.extend(self.leave_through_finally(Exit::Goto(label)));
                statements.push(Stmt::label(skip));
                Stmt::list(statements)
            }
            StmtKind::Switch {
                value,
                targets,
                default,
            } => {
                let mut trampolines = Vec::new();
                let mut redirect = |label: LabelId, this: &mut Self| {
                    if !this.leaves(label) {
                        return label;
                    }
                    let trampoline = LabelId::fresh();
                    trampolines.push(Stmt::label(trampoline));
                    trampolines.extend(this.leave_through_finally(Exit::Goto(label)));
                    trampoline
                };
                let targets: Vec<LabelId> = targets.into_iter().map(|t| redirect(t, self)).collect();
                let default = redirect(default, self);
                let mut statements = vec![Stmt::switch(value, targets, default)];
                statements.extend(trampolines);
                Stmt::list(statements)
            }
            other => rewrite_stmt_children(self, Stmt::new(other)),
        };
        finish(rewritten, has_errors, span)
    }
}

fn pending_finally(protected: Stmt, finally: Stmt) -> Stmt {
    let pending_exception = LocalSymbol::synthesized("<>pendingException", Ty::Object);
    let pending_branch = LocalSymbol::synthesized("<>pendingBranch", Ty::Int);
    let finally_label = LabelId::fresh();

    let mut exits = ExitRewriter {
        finally_label,
        pending_branch: pending_branch.clone(),
        return_value: None,
        inner_labels: defined_labels(&protected),
        exits: Vec::new(),
    };
    let protected = exits.rewrite_stmt(protected);

    let no_exception = LabelId::fresh();
    let mut statements = vec![
        assign_local(&pending_exception, Expr::null(Ty::Object)),
        assign_local(&pending_branch, Expr::int(0)),
        Stmt::try_(
            protected,
            vec![CatchClause {
                local: Some(pending_exception.clone()),
                exception_type: Ty::Object,
                body: Stmt::list(Vec::new()),
            }],
            None,
        ),
        Stmt::label(finally_label),
        finally,
        goto_if(
            equals(Expr::local(&pending_exception), Expr::null(Ty::Object)),
            true,
            no_exception,
        ),
        Stmt::throw(Some(Expr::local(&pending_exception))),
        Stmt::label(no_exception),
    ];

    let mut locals = vec![pending_exception, pending_branch.clone()];
    if !exits.exits.is_empty() {
        let after = LabelId::fresh();
        let mut targets = vec![after];
        let mut dispatch = Vec::new();
        for exit in &exits.exits {
            let label = LabelId::fresh();
            targets.push(label);
            dispatch.push(Stmt::label(label));
            dispatch.push(match exit {
                Exit::Return => Stmt::ret(exits.return_value.as_ref().map(Expr::local)),
                Exit::YieldBreak => Stmt::new(StmtKind::YieldBreak),
                Exit::Goto(target) => Stmt::goto(*target),
            });
        }
        statements.push(Stmt::switch(Expr::local(&pending_branch), targets, after));
        statements.extend(dispatch);
        statements.push(Stmt::label(after));
    }
    if let Some(value) = exits.return_value {
        locals.push(value);
    }
    Stmt::block(locals, statements)
}

/// Labels that can be jumped to inside `stmt`.
fn defined_labels(stmt: &Stmt) -> FxHashSet<LabelId> {
    struct Labels(FxHashSet<LabelId>);
    impl Visitor for Labels {
        fn visit_expr(&mut self, _: &Expr) {}

        fn visit_stmt(&mut self, stmt: &Stmt) {
            match stmt.kind {
                StmtKind::Label(label) | StmtKind::Suspend { resume: label, .. } => {
                    self.0.insert(label);
                }
                _ => {}
            }
            walk_stmt(self, stmt);
        }
    }
    let mut labels = Labels(FxHashSet::default());
    labels.visit_stmt(stmt);
    labels.0
}
