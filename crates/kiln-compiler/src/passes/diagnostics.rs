//! Context checks the binder cannot make on its own.

use kiln_core::bound::{Expr, ExprKind, Stmt, StmtKind, Visitor, walk_expr, walk_stmt};
use kiln_core::symbols::RoutineDescriptor;
use kiln_core::{DiagnosticBag, DiagnosticKind};

/// What the code being checked is allowed to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CheckContext {
    pub is_static: bool,
    pub is_generator: bool,
    pub is_async: bool,
}

impl CheckContext {
    pub fn of(routine: &RoutineDescriptor) -> Self {
        Self {
            is_static: routine.is_static(),
            is_generator: routine.is_generator(),
            is_async: routine.is_async(),
        }
    }

    /// Field initializers run inside a constructor of the matching staticness.
    pub fn initializer(is_static: bool) -> Self {
        Self {
            is_static,
            ..Self::default()
        }
    }
}

struct StructuralChecker<'a> {
    contexts: Vec<CheckContext>,
    diagnostics: &'a mut DiagnosticBag,
}

impl StructuralChecker<'_> {
    fn current(&self) -> CheckContext {
        self.contexts.last().copied().unwrap_or_default()
    }
}

/// Name of the storage both sides denote, when they denote the same one.
fn self_assigned_name(target: &Expr, value: &Expr) -> Option<String> {
    match (&target.kind, &value.kind) {
        (ExprKind::Local(a), ExprKind::Local(b)) if a.id == b.id => Some(a.name.to_string()),
        (ExprKind::Parameter { index: a, param }, ExprKind::Parameter { index: b, .. })
            if a == b =>
        {
            Some(param.name.to_string())
        }
        (
            ExprKind::Field {
                receiver: ra,
                field: fa,
                ..
            },
            ExprKind::Field {
                receiver: rb,
                field: fb,
                ..
            },
        ) if fa.id == fb.id => {
            let same_receiver = match (ra.as_deref(), rb.as_deref()) {
                (None, None) => true,
                (Some(a), Some(b)) => {
                    matches!(a.kind, ExprKind::This) && matches!(b.kind, ExprKind::This)
                }
                _ => false,
            };
            same_receiver.then(|| fa.name.to_string())
        }
        _ => None,
    }
}

impl Visitor for StructuralChecker<'_> {
    fn visit_expr(&mut self, expr: &Expr) {
        let cx = self.current();
        match &expr.kind {
            ExprKind::This | ExprKind::Base if cx.is_static => {
                self.diagnostics
                    .add(DiagnosticKind::ThisInStaticRoutine, expr.span);
            }
            ExprKind::Assign { target, value } => {
                if let Some(name) = self_assigned_name(target, value) {
                    self.diagnostics
                        .add(DiagnosticKind::AssignmentToSelf { name }, expr.span);
                }
            }
            ExprKind::Await(_) if !cx.is_async => {
                self.diagnostics
                    .add(DiagnosticKind::AwaitOutsideAsync, expr.span);
            }
            ExprKind::Lambda { routine, body } => {
                // `this` follows the enclosing routine; suspension follows the lambda.
                self.contexts.push(CheckContext {
                    is_static: cx.is_static,
                    is_generator: routine.is_generator(),
                    is_async: routine.is_async(),
                });
                self.visit_stmt(body);
                self.contexts.pop();
                return;
            }
            _ => {}
        }
        walk_expr(self, expr);
    }

    fn visit_stmt(&mut self, stmt: &Stmt) {
        if matches!(stmt.kind, StmtKind::Yield(_) | StmtKind::YieldBreak) && !self.current().is_generator
        {
            self.diagnostics
                .add(DiagnosticKind::YieldOutsideGenerator, stmt.span);
        }
        walk_stmt(self, stmt);
    }
}

/// Run the structural checks over `body`.
pub fn check(body: &Stmt, cx: CheckContext, diagnostics: &mut DiagnosticBag) {
    let mut checker = StructuralChecker {
        contexts: vec![cx],
        diagnostics,
    };
    checker.visit_stmt(body);
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_core::symbols::{LocalSymbol, RoutineFlags, RoutineKind};
    use kiln_core::{NamedType, Span, Ty, TypeKind};

    fn kinds(bag: &DiagnosticBag) -> Vec<DiagnosticKind> {
        bag.iter().map(|d| d.kind.clone()).collect()
    }

    #[test]
    fn this_in_static_context() {
        let body = Stmt::expr(Expr::this(Ty::Object).at(Span::point(3, 9)));
        let mut bag = DiagnosticBag::new();
        check(&body, CheckContext::initializer(true), &mut bag);
        assert_eq!(kinds(&bag), vec![DiagnosticKind::ThisInStaticRoutine]);
        assert_eq!(bag.iter().next().map(|d| d.span), Some(Span::point(3, 9)));

        let mut bag = DiagnosticBag::new();
        check(&body, CheckContext::initializer(false), &mut bag);
        assert!(bag.is_empty());
    }

    #[test]
    fn self_assignment_is_a_warning() {
        let x = LocalSymbol::user(1, "x", Ty::Int);
        let body = Stmt::expr(Expr::assign(Expr::local(&x), Expr::local(&x)));
        let mut bag = DiagnosticBag::new();
        check(&body, CheckContext::default(), &mut bag);
        assert_eq!(
            kinds(&bag),
            vec![DiagnosticKind::AssignmentToSelf { name: "x".into() }]
        );
        assert!(!bag.has_errors());
    }

    #[test]
    fn yield_and_await_need_the_right_routine() {
        let body = Stmt::list(vec![
            Stmt::yield_(Expr::int(1)),
            Stmt::expr(Expr::await_(Expr::null(Ty::Object), Ty::Void)),
        ]);
        let mut bag = DiagnosticBag::new();
        check(&body, CheckContext::default(), &mut bag);
        assert_eq!(
            kinds(&bag),
            vec![
                DiagnosticKind::YieldOutsideGenerator,
                DiagnosticKind::AwaitOutsideAsync
            ]
        );

        let mut bag = DiagnosticBag::new();
        let cx = CheckContext {
            is_generator: true,
            is_async: true,
            ..CheckContext::default()
        };
        check(&body, cx, &mut bag);
        assert!(bag.is_empty());
    }

    #[test]
    fn async_lambda_may_await_inside_a_sync_routine() {
        let owner = NamedType::new("Host", TypeKind::Class);
        let lambda = RoutineDescriptor::builder(&owner, "lambda", RoutineKind::Ordinary)
            .flags(RoutineFlags::ASYNC)
            .build();
        let body = Stmt::expr(Expr::lambda(
            &lambda,
            Stmt::expr(Expr::await_(Expr::null(Ty::Object), Ty::Void)),
            Ty::Object,
        ));
        let mut bag = DiagnosticBag::new();
        check(&body, CheckContext::default(), &mut bag);
        assert!(bag.is_empty());
    }
}
