//! Generator routines become a class whose `MoveNext` produces one element
//! per call.
//!
//! `yield v` stores `v` in the current-value field, records the state and
//! suspends with `true`. Falling off the end or `yield break` marks the
//! machine finished and returns `false`. The original routine keeps only a
//! kickoff body that creates the machine and hands it out.

use std::sync::Arc;

use kiln_core::bound::{ConversionKind, Expr, Rewriter, Stmt, StmtKind, rewrite_stmt_children};
use kiln_core::symbols::{FieldDescriptor, LabelId, RoutineDescriptor};
use kiln_core::{DiagnosticKind, ResumableKind, ResumableTypeDescriptor, Ty};
use tracing::debug;

use crate::LoweringContext;
use crate::factory::{assign, to_object};
use crate::state_machine::{STATE_FINISHED, STATE_RUNNING, StateMachineBuilder};

pub fn convert(
    routine: &Arc<RoutineDescriptor>,
    body: Stmt,
    cx: &mut LoweringContext<'_>,
) -> (Stmt, Option<Arc<ResumableTypeDescriptor>>) {
    let mut rejected = false;
    for param in routine.parameters.iter().filter(|p| p.ref_kind.is_by_ref()) {
        cx.diagnostics.add(
            DiagnosticKind::BadIteratorArgType {
                routine: routine.qualified_name(),
                parameter: param.name.to_string(),
            },
            routine.span,
        );
        rejected = true;
    }
    if rejected {
        return (body.with_errors(), None);
    }

    let mut builder = StateMachineBuilder::new(ResumableKind::Generator, routine, cx);
    let current = builder.add_field("<>2__current", Ty::Object);
    let body = builder.hoist(body);

    let body = YieldRewriter {
        builder: &mut builder,
        current,
    }
    .rewrite_stmt(body);

    let finished = vec![Stmt::ret(Some(Expr::boolean(false)))];
    let mut statements = vec![builder.dispatch(body, finished)];
    statements.extend(finish(&builder));
    let move_next_body = Stmt::list(statements);

    let return_type = routine.return_type.clone();
    let (kickoff, descriptor) =
        builder.finish(Ty::Bool, move_next_body, cx, |machine, _| {
            let value = Expr::local(machine);
            let value = if value.ty == return_type {
                value
            } else {
                Expr::convert(value, ConversionKind::Reference, return_type)
            };
            vec![Stmt::ret(Some(value))]
        });
    debug!(
        routine = %routine.qualified_name(),
        machine = descriptor.name(),
        fields = descriptor.ty.fields.len(),
        "generator state machine"
    );
    (kickoff, Some(descriptor))
}

/// `state = finished; return false`
fn finish(builder: &StateMachineBuilder) -> Vec<Stmt> {
    vec![
        builder.set_state(STATE_FINISHED),
        Stmt::ret(Some(Expr::boolean(false))),
    ]
}

struct YieldRewriter<'a> {
    builder: &'a mut StateMachineBuilder,
    current: Arc<FieldDescriptor>,
}

impl Rewriter for YieldRewriter<'_> {
    fn rewrite_stmt(&mut self, stmt: Stmt) -> Stmt {
        match stmt.kind {
            StmtKind::Yield(value) => {
                let state = self.builder.next_state();
                let resume = LabelId::fresh();
                let value = to_object(self.rewrite_expr(value));
                Stmt::list(vec![
                    assign(self.builder.field(&self.current), value),
                    self.builder.set_state(i64::from(state)),
                    Stmt::suspend(state, Some(Expr::boolean(true)), resume),
                    self.builder.set_state(STATE_RUNNING),
                ])
                .at(stmt.span)
            }
            StmtKind::YieldBreak | StmtKind::Return(_) => {
                Stmt::list(finish(self.builder)).at(stmt.span)
            }
            kind => rewrite_stmt_children(self, Stmt::new(kind).at(stmt.span)),
        }
    }
}
