//! Suspend-style routines become a state machine driven by
//! `AsyncMethodBuilder`.
//!
//! An `await` may only suspend at statement level, where the evaluation
//! stack is empty. So the first pass spills every operand evaluated before
//! an `await` into a temporary and leaves each `await` either as a whole
//! statement or as the value of an assignment statement. Temporaries are
//! ordinary block locals and are hoisted with the rest.
//!
//! `MoveNext` runs the body inside a handler that reports a fault to the
//! builder. Returns jump to a shared exit that reports the result.

use std::sync::Arc;

use kiln_core::bound::{
    CatchClause, Expr, ExprKind, Rewriter, Stmt, StmtKind, Visitor, rewrite_stmt_children,
    walk_expr, walk_stmt,
};
use kiln_core::symbols::{FieldDescriptor, LabelId, LocalSymbol, RoutineDescriptor};
use kiln_core::{DiagnosticBag, DiagnosticKind, ResumableKind, ResumableTypeDescriptor, Span, Ty};
use tracing::debug;

use crate::LoweringContext;
use crate::factory::{assign, assign_local, goto_if, local_field, to_object};
use crate::state_machine::{STATE_FINISHED, STATE_RUNNING, StateMachineBuilder};
use crate::well_known::{
    async_builder_type, awaiter_get_result, awaiter_is_completed, builder_await_on_completed,
    builder_create, builder_set_exception, builder_set_result, builder_start, builder_task,
    exception_type,
};

pub fn convert(
    routine: &Arc<RoutineDescriptor>,
    body: Stmt,
    cx: &mut LoweringContext<'_>,
) -> (Stmt, Option<Arc<ResumableTypeDescriptor>>) {
    let (body, temps) = spill_awaits(body, cx.diagnostics);
    if body.has_errors {
        return (body, None);
    }
    let body = if temps.is_empty() {
        body
    } else {
        Stmt::block(temps, vec![body])
    };
    let result_ty = result_type(&body);

    let mut builder = StateMachineBuilder::new(ResumableKind::Async, routine, cx);
    let method_builder = builder.add_field("<>t__builder", Ty::Named(async_builder_type()));
    let awaiter = builder.add_field("<>u__1", Ty::Object);
    let body = builder.hoist(body);

    let result = (result_ty != Ty::Void).then(|| LocalSymbol::synthesized("<>result", result_ty));
    let exit = LabelId::fresh();
    let body = AwaitRewriter {
        builder: &mut builder,
        method_builder: method_builder.clone(),
        awaiter,
        result: result.clone(),
        exit,
    }
    .rewrite_stmt(body);

    let move_next_body = wrap(&builder, body, &method_builder, result, exit);

    let return_type = routine.return_type.clone();
    let (kickoff, descriptor) = builder.finish(Ty::Void, move_next_body, cx, |machine, _| {
        let task_builder = local_field(machine, &method_builder);
        let mut statements = vec![
            assign(
                task_builder.clone(),
                Expr::call(None, &builder_create(), Vec::new()),
            ),
            Stmt::expr(Expr::call(
                Some(task_builder.clone()),
                &builder_start(),
                vec![Expr::local(machine)],
            )),
        ];
        if return_type == Ty::Void {
            statements.push(Stmt::ret(None));
        } else {
            let task = Expr::call(Some(task_builder), &builder_task(&return_type), Vec::new());
            statements.push(Stmt::ret(Some(task)));
        }
        statements
    });
    debug!(
        routine = %routine.qualified_name(),
        machine = descriptor.name(),
        hoisted = descriptor.hoisted.len(),
        "async state machine"
    );
    (kickoff, Some(descriptor))
}

/// `try { body } catch (e) { fault } exit: report result`
fn wrap(
    builder: &StateMachineBuilder,
    body: Stmt,
    method_builder: &Arc<FieldDescriptor>,
    result: Option<LocalSymbol>,
    exit: LabelId,
) -> Stmt {
    let exception = LocalSymbol::synthesized("<>ex", exception_type());
    let handler = Stmt::list(vec![
        builder.set_state(STATE_FINISHED),
        Stmt::expr(Expr::call(
            Some(builder.field(method_builder)),
            &builder_set_exception(),
            vec![Expr::local(&exception)],
        )),
        Stmt::ret(None),
    ]);
    let protected = Stmt::try_(
        builder.dispatch(body, vec![Stmt::ret(None)]),
        vec![CatchClause {
            local: Some(exception),
            exception_type: exception_type(),
            body: handler,
        }],
        None,
    );

    let result_args = result
        .iter()
        .map(|local| to_object(Expr::local(local)))
        .collect();
    let statements = vec![
        protected,
        Stmt::label(exit),
        builder.set_state(STATE_FINISHED),
        Stmt::expr(Expr::call(
            Some(builder.field(method_builder)),
            &builder_set_result(result.is_some()),
            result_args,
        )),
        Stmt::ret(None),
    ];
    Stmt::block(result.into_iter().collect(), statements)
}

/// Type of the first returned value, or void.
fn result_type(body: &Stmt) -> Ty {
    struct FirstReturn(Option<Ty>);

    impl Visitor for FirstReturn {
        fn visit_expr(&mut self, _: &Expr) {}

        fn visit_stmt(&mut self, stmt: &Stmt) {
            if self.0.is_some() {
                return;
            }
            if let StmtKind::Return(Some(value)) = &stmt.kind {
                self.0 = Some(value.ty.clone());
                return;
            }
            walk_stmt(self, stmt);
        }
    }

    let mut finder = FirstReturn(None);
    finder.visit_stmt(body);
    finder.0.unwrap_or(Ty::Void)
}

fn has_await(expr: &Expr) -> bool {
    struct Finder(bool);

    impl Visitor for Finder {
        fn visit_expr(&mut self, expr: &Expr) {
            if self.0 {
                return;
            }
            match expr.kind {
                ExprKind::Await(_) => self.0 = true,
                ExprKind::Lambda { .. } => {}
                _ => walk_expr(self, expr),
            }
        }
    }

    let mut finder = Finder(false);
    finder.visit_expr(expr);
    finder.0
}

/// Move every `await` to statement level. Returns the rewritten body and
/// the temporaries it needs.
pub fn spill_awaits(body: Stmt, diagnostics: &mut DiagnosticBag) -> (Stmt, Vec<LocalSymbol>) {
    let mut spiller = Spiller {
        temps: Vec::new(),
        diagnostics,
    };
    let body = spiller.rewrite_stmt(body);
    (body, spiller.temps)
}

struct Spiller<'a> {
    temps: Vec<LocalSymbol>,
    diagnostics: &'a mut DiagnosticBag,
}

impl Spiller<'_> {
    fn temp(&mut self, name: &str, value: Expr, out: &mut Vec<Stmt>) -> Expr {
        let temp = LocalSymbol::synthesized(name, value.ty.clone());
        let span = value.span;
        out.push(assign_local(&temp, value));
        self.temps.push(temp.clone());
        Expr::local(&temp).at(span)
    }

    /// Rewrite `expr` so it holds no `await`, pushing what must run first
    /// onto `out`.
    fn spill(&mut self, expr: Expr, out: &mut Vec<Stmt>) -> Expr {
        if !has_await(&expr) {
            return expr;
        }
        let Expr {
            kind,
            ty,
            has_errors,
            span,
        } = expr;
        match kind {
            ExprKind::Await(operand) => {
                let operand = self.spill(*operand, out);
                let awaited = Expr::await_(operand, ty.clone()).at(span);
                if ty == Ty::Void {
                    out.push(Stmt::expr(awaited));
                    Expr::default_value(Ty::Void).at(span)
                } else {
                    self.temp("<>await", awaited, out)
                }
            }
            ExprKind::Sequence {
                locals,
                side_effects,
                value,
            } => {
                self.temps.extend(locals);
                for effect in side_effects {
                    let residual = self.spill(effect, out);
                    if !residual.is_side_effect_free() {
                        out.push(Stmt::expr(residual));
                    }
                }
                self.spill(*value, out)
            }
            kind => {
                let mut expr = Expr {
                    kind,
                    ty,
                    has_errors,
                    span,
                };
                let Some(mut slots) = operands(&mut expr.kind) else {
                    self.diagnostics
                        .add(DiagnosticKind::UnsupportedAwaitPosition, span);
                    return expr.with_errors();
                };
                let last = slots.iter().rposition(|slot| has_await(slot)).unwrap_or(0);
                let mut errors = false;
                for (index, slot) in slots.iter_mut().enumerate().take(last + 1) {
                    let operand = std::mem::replace(&mut **slot, Expr::default_value(Ty::Void));
                    let mut residual = self.spill(operand, out);
                    if index < last && !residual.is_side_effect_free() {
                        residual = self.temp("<>spill", residual, out);
                    }
                    errors |= residual.has_errors;
                    **slot = residual;
                }
                expr.has_errors |= errors;
                expr
            }
        }
    }
}

/// Operands of `kind` in evaluation order, for the kinds an `await` can be
/// moved out of.
fn operands(kind: &mut ExprKind) -> Option<Vec<&mut Expr>> {
    let slots = match kind {
        ExprKind::Call { receiver, args, .. } => receiver
            .as_deref_mut()
            .into_iter()
            .chain(args.iter_mut())
            .collect(),
        ExprKind::New { args, .. } => args.iter_mut().collect(),
        ExprKind::Binary { op, left, right } if !op.is_logical() => vec![&mut **left, &mut **right],
        ExprKind::Unary { operand, .. }
        | ExprKind::Convert { operand, .. }
        | ExprKind::Deref(operand) => vec![&mut **operand],
        ExprKind::NewArray { size, .. } => vec![&mut **size],
        ExprKind::Field {
            receiver: Some(receiver),
            ..
        }
        | ExprKind::Delegate {
            receiver: Some(receiver),
            ..
        } => vec![&mut **receiver],
        ExprKind::Element { array, indices } => std::iter::once(&mut **array)
            .chain(indices.iter_mut())
            .collect(),
        ExprKind::Assign { target, value } => {
            let mut slots: Vec<&mut Expr> = match &mut target.kind {
                ExprKind::Field {
                    receiver: Some(receiver),
                    ..
                } => vec![&mut **receiver],
                ExprKind::Element { array, indices } => std::iter::once(&mut **array)
                    .chain(indices.iter_mut())
                    .collect(),
                ExprKind::Deref(pointer) => vec![&mut **pointer],
                _ => Vec::new(),
            };
            slots.push(&mut **value);
            slots
        }
        _ => return None,
    };
    Some(slots)
}

impl Rewriter for Spiller<'_> {
    fn rewrite_stmt(&mut self, stmt: Stmt) -> Stmt {
        let Stmt {
            kind,
            has_errors,
            span,
        } = stmt;
        let mut out = Vec::new();
        let kind = match kind {
            StmtKind::Expression(expr) if has_await(&expr) => match expr.kind {
                ExprKind::Await(operand) => {
                    let operand = self.spill(*operand, &mut out);
                    StmtKind::Expression(Expr::await_(operand, expr.ty).at(expr.span))
                }
                kind => {
                    let expr = Expr {
                        kind,
                        ty: expr.ty,
                        has_errors: expr.has_errors,
                        span: expr.span,
                    };
                    let residual = self.spill(expr, &mut out);
                    if residual.is_side_effect_free() && !residual.has_errors {
                        StmtKind::NoOp
                    } else {
                        StmtKind::Expression(residual)
                    }
                }
            },
            StmtKind::Return(Some(value)) if has_await(&value) => {
                StmtKind::Return(Some(self.spill(value, &mut out)))
            }
            StmtKind::Throw(Some(value)) if has_await(&value) => {
                StmtKind::Throw(Some(self.spill(value, &mut out)))
            }
            StmtKind::ConditionalGoto {
                condition,
                jump_if,
                label,
            } if has_await(&condition) => StmtKind::ConditionalGoto {
                condition: self.spill(condition, &mut out),
                jump_if,
                label,
            },
            StmtKind::Switch {
                value,
                targets,
                default,
            } if has_await(&value) => StmtKind::Switch {
                value: self.spill(value, &mut out),
                targets,
                default,
            },
            other => {
                let mut rewritten = rewrite_stmt_children(self, Stmt::new(other).at(span));
                rewritten.has_errors |= has_errors;
                return rewritten;
            }
        };
        out.push(Stmt::new(kind).at(span));
        let mut spilled = Stmt::list(out).at(span);
        spilled.has_errors |= has_errors;
        spilled
    }
}

/// Split `await x` or `target = await x` into its parts.
fn split_await(expr: Expr) -> Result<(Option<Expr>, Expr, Ty), Expr> {
    match expr.kind {
        ExprKind::Await(operand) => Ok((None, *operand, expr.ty)),
        ExprKind::Assign { target, value } => {
            let value = *value;
            match value.kind {
                ExprKind::Await(operand) => Ok((Some(*target), *operand, value.ty)),
                kind => Err(Expr {
                    kind: ExprKind::Assign {
                        target,
                        value: Box::new(Expr { kind, ..value }),
                    },
                    ..expr
                }),
            }
        }
        kind => Err(Expr { kind, ..expr }),
    }
}

struct AwaitRewriter<'a> {
    builder: &'a mut StateMachineBuilder,
    method_builder: Arc<FieldDescriptor>,
    awaiter: Arc<FieldDescriptor>,
    result: Option<LocalSymbol>,
    exit: LabelId,
}

impl AwaitRewriter<'_> {
    /// ```text
    /// awaiter = operand
    /// if (IsCompleted(awaiter)) goto ready
    /// state = n
    /// builder.AwaitOnCompleted(awaiter, this)
    /// suspend n
    /// state = running
    /// ready:
    /// [target =] GetResult(awaiter)
    /// ```
    fn suspend(&mut self, target: Option<Expr>, operand: Expr, ty: Ty, span: Span) -> Stmt {
        let state = self.builder.next_state();
        let resume = LabelId::fresh();
        let ready = LabelId::fresh();
        let awaiter = self.builder.field(&self.awaiter);

        let result = Expr::call(None, &awaiter_get_result(&ty), vec![awaiter.clone()]);
        let complete = match target {
            Some(target) => assign(target, result),
            None => Stmt::expr(result),
        };
        Stmt::list(vec![
            assign(awaiter.clone(), to_object(operand)),
            goto_if(
                Expr::call(None, &awaiter_is_completed(), vec![awaiter.clone()]),
                true,
                ready,
            ),
            self.builder.set_state(i64::from(state)),
            Stmt::expr(Expr::call(
                Some(self.builder.field(&self.method_builder)),
                &builder_await_on_completed(),
                vec![awaiter, self.builder.this()],
            )),
            Stmt::suspend(state, None, resume),
            self.builder.set_state(STATE_RUNNING),
            Stmt::label(ready),
            complete,
        ])
        .at(span)
    }
}

impl Rewriter for AwaitRewriter<'_> {
    fn rewrite_stmt(&mut self, stmt: Stmt) -> Stmt {
        let span = stmt.span;
        match stmt.kind {
            StmtKind::Expression(expr) => match split_await(expr) {
                Ok((target, operand, ty)) => self.suspend(target, operand, ty, span),
                Err(expr) => Stmt::expr(expr).at(span),
            },
            StmtKind::Return(value) => {
                let mut statements = Vec::new();
                if let (Some(value), Some(result)) = (value, &self.result) {
                    statements.push(assign_local(result, value));
                }
                statements.push(Stmt::goto(self.exit));
                Stmt::list(statements).at(span)
            }
            kind => rewrite_stmt_children(self, Stmt::new(kind).at(span)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::*;
    use crate::well_known::AWAITER_TYPE;
    use kiln_core::bound::{contains_expr, contains_stmt};
    use kiln_core::symbols::{RoutineFlags, RoutineKind};
    use kiln_core::{NamedType, TypeKind};

    fn create_test_routine(returns: Ty) -> Arc<RoutineDescriptor> {
        let owner = NamedType::new("Client", TypeKind::Class);
        RoutineDescriptor::builder(&owner, "Fetch", RoutineKind::Ordinary)
            .flags(RoutineFlags::ASYNC)
            .returns(returns)
            .build()
    }

    fn side_effect(name: &str) -> Expr {
        let owner = NamedType::new("Client", TypeKind::Class);
        let routine = RoutineDescriptor::builder(&owner, name, RoutineKind::Ordinary)
            .flags(RoutineFlags::STATIC)
            .returns(Ty::Int)
            .build();
        Expr::call(None, &routine, vec![])
    }

    fn sum_routine() -> Arc<RoutineDescriptor> {
        let owner = NamedType::new("Client", TypeKind::Class);
        RoutineDescriptor::builder(&owner, "Sum", RoutineKind::Ordinary)
            .flags(RoutineFlags::STATIC)
            .parameter(kiln_core::symbols::Parameter::new("a", Ty::Int))
            .parameter(kiln_core::symbols::Parameter::new("b", Ty::Int))
            .returns(Ty::Int)
            .build()
    }

    #[test]
    fn operands_before_an_await_are_spilled_in_order() {
        let call = Expr::call(
            None,
            &sum_routine(),
            vec![side_effect("First"), Expr::await_(Expr::null(Ty::Object), Ty::Int)],
        );
        let mut diagnostics = DiagnosticBag::new();
        let (body, temps) = spill_awaits(Stmt::expr(call), &mut diagnostics);

        assert!(diagnostics.is_empty());
        assert_eq!(temps.len(), 2);
        let StmtKind::List(statements) = &body.kind else {
            panic!("expected list");
        };
        // spill = First(); await = await x; Sum(spill, await)
        assert_eq!(statements.len(), 3);
        assert!(matches!(
            &statements[0].kind,
            StmtKind::Expression(Expr { kind: ExprKind::Assign { value, .. }, .. })
                if matches!(value.kind, ExprKind::Call { .. })
        ));
        assert!(matches!(
            &statements[1].kind,
            StmtKind::Expression(Expr { kind: ExprKind::Assign { value, .. }, .. })
                if matches!(value.kind, ExprKind::Await(_))
        ));
        let StmtKind::Expression(residual) = &statements[2].kind else {
            panic!("expected call");
        };
        assert!(!has_await(residual));
    }

    #[test]
    fn await_in_conditional_branch_is_reported() {
        let routine = create_test_routine(Ty::Void);
        let awaited = Expr::conditional(
            Expr::boolean(true),
            Expr::await_(Expr::null(Ty::Object), Ty::Int),
            Expr::int(0),
        );
        let mut host = RecordingHost::default();
        let mut diagnostics = DiagnosticBag::new();
        let mut cx = create_test_context(&routine, &mut host, &mut diagnostics);

        let (body, descriptor) = convert(&routine, Stmt::ret(Some(awaited)), &mut cx);
        assert!(body.has_errors);
        assert!(descriptor.is_none());
        assert!(
            diagnostics
                .iter()
                .any(|d| d.kind == DiagnosticKind::UnsupportedAwaitPosition)
        );
    }

    #[test]
    fn await_becomes_guarded_suspension() {
        let task = Ty::named("kiln.Task", TypeKind::Class);
        let routine = create_test_routine(task.clone());
        let local = LocalSymbol::user(1, "value", Ty::Int);
        let body = Stmt::block(
            vec![local.clone()],
            vec![
                assign_local(&local, Expr::await_(Expr::null(Ty::Object), Ty::Int)),
                Stmt::ret(Some(Expr::local(&local))),
            ],
        );
        let mut host = RecordingHost::default();
        let mut diagnostics = DiagnosticBag::new();
        let mut cx = create_test_context(&routine, &mut host, &mut diagnostics);

        let (kickoff, descriptor) = convert(&routine, body, &mut cx);
        let descriptor = descriptor.expect("descriptor");
        assert_eq!(descriptor.kind, ResumableKind::Async);
        assert_eq!(descriptor.move_next.return_type, Ty::Void);
        assert_eq!(descriptor.hoisted.len(), 1);

        let move_next = &host.methods[1].body;
        assert!(!contains_expr(move_next, &|e| matches!(e.kind, ExprKind::Await(_))));
        assert!(contains_stmt(move_next, &|s| matches!(
            s.kind,
            StmtKind::Suspend { state: 0, value: None, .. }
        )));
        assert!(contains_expr(move_next, &|e| matches!(
            &e.kind,
            ExprKind::Call { routine, .. }
                if &*routine.containing_type.name == AWAITER_TYPE && &*routine.name == "IsCompleted"
        )));
        // The result is reported through SetResult(object).
        assert!(contains_expr(move_next, &|e| matches!(
            &e.kind,
            ExprKind::Call { routine, args, .. } if &*routine.name == "SetResult" && args.len() == 1
        )));
        assert!(contains_stmt(&kickoff, &|s| matches!(
            &s.kind,
            StmtKind::Return(Some(value)) if value.ty == task
        )));
    }
}
