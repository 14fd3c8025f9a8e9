//! Shared machinery of the generator and async state machines.
//!
//! Both conversions produce the same shape: a synthesized class holding a
//! state field, the routine's receiver and parameters, and every local the
//! body declares; a `MoveNext` routine that dispatches on the state; and a
//! kickoff body that replaces the original one.
//!
//! States: `-1` running or not started, `n >= 0` suspended at point `n`,
//! `-2` finished.

use std::sync::Arc;

use kiln_core::bound::{
    Expr, ExprKind, Rewriter, Stmt, StmtKind, rewrite_expr_children, rewrite_stmt_children,
};
use kiln_core::symbols::{
    FieldDescriptor, LabelId, LocalId, LocalSymbol, RoutineDescriptor, RoutineKind,
    SynthesizedKind, TypeDescriptor,
};
use kiln_core::{HoistedVariable, NamedType, ResumableKind, ResumableTypeDescriptor, Ty, TypeKind};
use rustc_hash::FxHashMap;

use crate::factory::{assign, assign_local, equals, goto_if, local_field};
use crate::{LoweringContext, SynthesizedMethod};

pub(crate) const STATE_RUNNING: i64 = -1;
pub(crate) const STATE_FINISHED: i64 = -2;

pub(crate) struct StateMachineBuilder {
    kind: ResumableKind,
    routine: Arc<RoutineDescriptor>,
    ty: TypeDescriptor,
    named: NamedType,
    ordinal: u32,
    state_field: Arc<FieldDescriptor>,
    this_field: Option<Arc<FieldDescriptor>>,
    parameter_fields: Vec<Arc<FieldDescriptor>>,
    hoisted: Vec<HoistedVariable>,
    next_state: i32,
}

impl StateMachineBuilder {
    pub(crate) fn new(
        kind: ResumableKind,
        routine: &Arc<RoutineDescriptor>,
        cx: &mut LoweringContext<'_>,
    ) -> Self {
        let ordinal = cx.host.next_ordinal();
        let name = format!(
            "{}.<{}>d__{}",
            routine.containing_type.name, routine.name, ordinal
        );
        let ty = TypeDescriptor::new(&name, TypeKind::Class);
        let named = ty.named();
        let state_field = Arc::new(FieldDescriptor::new(&named, "<>1__state", Ty::Int));

        let mut builder = Self {
            kind,
            routine: routine.clone(),
            ty,
            named,
            ordinal,
            state_field: state_field.clone(),
            this_field: None,
            parameter_fields: Vec::new(),
            hoisted: Vec::new(),
            next_state: 0,
        };
        builder.ty.fields.push(state_field);
        if !routine.is_static() {
            let this_ty = routine.this_type();
            builder.this_field = Some(builder.add_field("<>4__this", this_ty));
        }
        for param in &routine.parameters {
            let field = builder.add_field(&param.name, param.ty.clone());
            builder.parameter_fields.push(field);
        }
        builder
    }

    pub(crate) fn add_field(&mut self, name: &str, ty: Ty) -> Arc<FieldDescriptor> {
        let field = Arc::new(FieldDescriptor::new(&self.named, name, ty));
        self.ty.fields.push(field.clone());
        field
    }

    pub(crate) fn machine_ty(&self) -> Ty {
        Ty::Named(self.named.clone())
    }

    /// `this` inside `MoveNext`.
    pub(crate) fn this(&self) -> Expr {
        Expr::this(self.machine_ty())
    }

    pub(crate) fn field(&self, field: &Arc<FieldDescriptor>) -> Expr {
        Expr::field(Some(self.this()), field)
    }

    pub(crate) fn state(&self) -> Expr {
        self.field(&self.state_field)
    }

    pub(crate) fn set_state(&self, state: i64) -> Stmt {
        assign(self.state(), Expr::int(state))
    }

    pub(crate) fn next_state(&mut self) -> i32 {
        let state = self.next_state;
        self.next_state += 1;
        state
    }

    /// Move the receiver, parameters and block locals of `body` into fields.
    pub(crate) fn hoist(&mut self, body: Stmt) -> Stmt {
        let mut hoister = Hoister {
            builder: self,
            locals: FxHashMap::default(),
        };
        hoister.rewrite_stmt(body)
    }

    /// Make every suspension point reachable from the top of `MoveNext`.
    ///
    /// A `try` cannot be entered by a branch from outside, so resume points
    /// inside one are reached in two hops: the outer switch jumps to a label
    /// just before the `try`, and a second switch at the top of its body
    /// continues to the resume label.
    pub(crate) fn dispatch(&self, body: Stmt, finished: Vec<Stmt>) -> Stmt {
        let (body, entries) = self.route(body);
        let check = LabelId::fresh();
        let start = LabelId::fresh();

        let mut statements = Vec::new();
        if !entries.is_empty() {
            statements.push(self.switch(&entries, check));
        }
        statements.push(Stmt::label(check));
        statements.push(goto_if(
            equals(self.state(), Expr::int(STATE_RUNNING)),
            true,
            start,
        ));
        statements.extend(finished);
        statements.push(Stmt::label(start));
        statements.push(body);
        Stmt::list(statements)
    }

    fn switch(&self, entries: &[(i32, LabelId)], default: LabelId) -> Stmt {
        let count = entries.iter().map(|(state, _)| *state + 1).max().unwrap_or(0);
        let mut targets = vec![default; count.max(0) as usize];
        for (state, label) in entries {
            targets[*state as usize] = *label;
        }
        Stmt::switch(self.state(), targets, default)
    }

    fn route(&self, stmt: Stmt) -> (Stmt, Vec<(i32, LabelId)>) {
        let Stmt {
            kind,
            has_errors,
            span,
        } = stmt;
        let (kind, entries) = match kind {
            StmtKind::Suspend {
                state,
                value,
                resume,
            } => (
                StmtKind::Suspend {
                    state,
                    value,
                    resume,
                },
                vec![(state, resume)],
            ),
            StmtKind::Block { locals, statements } => {
                let (statements, entries) = self.route_all(statements);
                (StmtKind::Block { locals, statements }, entries)
            }
            StmtKind::List(statements) => {
                let (statements, entries) = self.route_all(statements);
                (StmtKind::List(statements), entries)
            }
            StmtKind::Try {
                body,
                catches,
                finally,
            } => {
                let (body, inner) = self.route(*body);
                if inner.is_empty() {
                    (
                        StmtKind::Try {
                            body: Box::new(body),
                            catches,
                            finally,
                        },
                        inner,
                    )
                } else {
                    let entry = LabelId::fresh();
                    let body_start = LabelId::fresh();
                    let body = Stmt::list(vec![
                        self.switch(&inner, body_start),
                        Stmt::label(body_start),
                        body,
                    ]);
                    let region = Stmt::new(StmtKind::Try {
                        body: Box::new(body),
                        catches,
                        finally,
                    });
                    let outer = inner.iter().map(|(state, _)| (*state, entry)).collect();
                    (StmtKind::List(vec![Stmt::label(entry), region]), outer)
                }
            }
            other => (other, Vec::new()),
        };
        let mut routed = Stmt::new(kind).at(span);
        routed.has_errors |= has_errors;
        (routed, entries)
    }

    fn route_all(&self, statements: Vec<Stmt>) -> (Vec<Stmt>, Vec<(i32, LabelId)>) {
        let mut entries = Vec::new();
        let statements = statements
            .into_iter()
            .map(|stmt| {
                let (stmt, inner) = self.route(stmt);
                entries.extend(inner);
                stmt
            })
            .collect();
        (statements, entries)
    }

    /// Register the machine's members and build the kickoff body.
    ///
    /// `tail` receives the local holding the new machine and produces the
    /// statements that start it and return from the kickoff routine.
    pub(crate) fn finish(
        mut self,
        move_next_returns: Ty,
        move_next_body: Stmt,
        cx: &mut LoweringContext<'_>,
        tail: impl FnOnce(&LocalSymbol, &Self) -> Vec<Stmt>,
    ) -> (Stmt, Arc<ResumableTypeDescriptor>) {
        let constructor = RoutineDescriptor::builder(
            &self.named,
            ".ctor",
            RoutineKind::Synthesized(SynthesizedKind::StateMachineConstructor),
        )
        .ordinal(self.ordinal)
        .synthesized_body(Stmt::list(Vec::new()))
        .build();
        let move_next = RoutineDescriptor::builder(
            &self.named,
            "MoveNext",
            RoutineKind::Synthesized(SynthesizedKind::StateMachineMoveNext),
        )
        .returns(move_next_returns)
        .ordinal(self.ordinal)
        .build();
        self.ty.routines.push(constructor.clone());
        self.ty.routines.push(move_next.clone());

        let descriptor = Arc::new(ResumableTypeDescriptor {
            kind: self.kind,
            ty: Arc::new(self.ty.clone()),
            kickoff: self.routine.id,
            move_next: move_next.clone(),
            state_field: self.state_field.clone(),
            hoisted: self.hoisted.clone(),
        });

        cx.host.record_synthesized(SynthesizedMethod {
            routine: constructor.clone(),
            body: Stmt::list(Vec::new()),
            resumable: None,
        });
        cx.host.record_synthesized(SynthesizedMethod {
            routine: move_next,
            body: move_next_body,
            resumable: Some(descriptor.clone()),
        });

        let machine = LocalSymbol::synthesized("<>sm", self.machine_ty());
        let mut statements = vec![
            assign_local(&machine, Expr::new_object(&constructor, Vec::new())),
            assign(
                local_field(&machine, &self.state_field),
                Expr::int(STATE_RUNNING),
            ),
        ];
        if let Some(this_field) = &self.this_field {
            statements.push(assign(
                local_field(&machine, this_field),
                Expr::this(self.routine.this_type()),
            ));
        }
        for (index, (param, field)) in self
            .routine
            .parameters
            .iter()
            .zip(&self.parameter_fields)
            .enumerate()
        {
            statements.push(assign(
                local_field(&machine, field),
                Expr::parameter(index as u16, param),
            ));
        }
        statements.extend(tail(&machine, &self));
        (Stmt::block(vec![machine], statements), descriptor)
    }
}

/// Replaces locals, parameters and the receiver with machine fields.
struct Hoister<'a> {
    builder: &'a mut StateMachineBuilder,
    locals: FxHashMap<LocalId, Arc<FieldDescriptor>>,
}

impl Hoister<'_> {
    fn hoistable(local: &LocalSymbol) -> bool {
        !local.stack_only && !local.ref_kind.is_by_ref()
    }

    fn field_for(&mut self, local: &LocalSymbol) -> Arc<FieldDescriptor> {
        if let Some(field) = self.locals.get(&local.id) {
            return field.clone();
        }
        let name = format!("<{}>5__{}", local.name, self.locals.len() + 1);
        let field = self.builder.add_field(&name, local.ty.clone());
        if !local.is_synthesized() {
            self.builder.hoisted.push(HoistedVariable {
                name: local.name.clone(),
                field: field.clone(),
            });
        }
        self.locals.insert(local.id, field.clone());
        field
    }
}

impl Rewriter for Hoister<'_> {
    fn rewrite_stmt(&mut self, stmt: Stmt) -> Stmt {
        let Stmt {
            kind,
            has_errors,
            span,
        } = stmt;
        let kind = match kind {
            StmtKind::Block { locals, statements } => {
                let mut kept = Vec::new();
                for local in locals {
                    if Self::hoistable(&local) {
                        self.field_for(&local);
                    } else {
                        kept.push(local);
                    }
                }
                StmtKind::Block {
                    locals: kept,
                    statements,
                }
            }
            other => other,
        };
        let mut rewritten = rewrite_stmt_children(self, Stmt::new(kind).at(span));
        rewritten.has_errors |= has_errors;
        rewritten
    }

    fn rewrite_expr(&mut self, expr: Expr) -> Expr {
        let replacement = match &expr.kind {
            ExprKind::Local(local) => self
                .locals
                .get(&local.id)
                .cloned()
                .map(|field| self.builder.field(&field)),
            ExprKind::Parameter { index, .. } => self
                .builder
                .parameter_fields
                .get(usize::from(*index))
                .cloned()
                .map(|field| self.builder.field(&field)),
            ExprKind::This | ExprKind::Base => self
                .builder
                .this_field
                .clone()
                .map(|field| self.builder.field(&field)),
            _ => None,
        };
        match replacement {
            Some(field) => field.at(expr.span).inherit_errors(&expr),
            None => rewrite_expr_children(self, expr),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::*;
    use kiln_core::DiagnosticBag;
    use kiln_core::bound::contains_stmt;
    use kiln_core::symbols::{Parameter, RoutineFlags};

    fn create_test_routine() -> Arc<RoutineDescriptor> {
        let owner = NamedType::new("Feed", TypeKind::Class);
        RoutineDescriptor::builder(&owner, "Items", RoutineKind::Ordinary)
            .flags(RoutineFlags::GENERATOR)
            .parameter(Parameter::new("count", Ty::Int))
            .returns(Ty::Object)
            .build()
    }

    #[test]
    fn hoisting_moves_block_locals_into_fields() {
        let routine = create_test_routine();
        let mut host = RecordingHost::default();
        let mut diagnostics = DiagnosticBag::new();
        let mut cx = create_test_context(&routine, &mut host, &mut diagnostics);
        let mut builder = StateMachineBuilder::new(ResumableKind::Generator, &routine, &mut cx);

        let local = LocalSymbol::user(1, "i", Ty::Int);
        let body = Stmt::block(
            vec![local.clone()],
            vec![assign_local(&local, Expr::parameter(0, &routine.parameters[0]))],
        );
        let hoisted = builder.hoist(body);

        let StmtKind::Block { locals, .. } = &hoisted.kind else {
            panic!("expected block");
        };
        assert!(locals.is_empty());
        assert_eq!(builder.hoisted.len(), 1);
        assert_eq!(&*builder.hoisted[0].name, "i");
        // state, this, count, i
        assert_eq!(builder.ty.fields.len(), 4);
        assert!(!kiln_core::bound::contains_expr(&hoisted, &|e| matches!(
            e.kind,
            ExprKind::Local(_) | ExprKind::Parameter { .. }
        )));
    }

    #[test]
    fn resume_point_inside_try_is_dispatched_in_two_hops() {
        let routine = create_test_routine();
        let mut host = RecordingHost::default();
        let mut diagnostics = DiagnosticBag::new();
        let mut cx = create_test_context(&routine, &mut host, &mut diagnostics);
        let mut builder = StateMachineBuilder::new(ResumableKind::Generator, &routine, &mut cx);

        let state = builder.next_state();
        let resume = LabelId::fresh();
        let body = Stmt::try_(
            Stmt::suspend(state, Some(Expr::boolean(true)), resume),
            vec![],
            None,
        );
        let dispatched = builder.dispatch(body, vec![Stmt::ret(Some(Expr::boolean(false)))]);

        // One switch outside the region, one at the top of its body.
        let StmtKind::List(top) = &dispatched.kind else {
            panic!("expected list");
        };
        let StmtKind::Switch { targets, .. } = &top[0].kind else {
            panic!("expected outer switch");
        };
        assert_ne!(targets[0], resume);
        assert!(contains_stmt(&dispatched, &|s| match &s.kind {
            StmtKind::Try { body, .. } => contains_stmt(body, &|inner| matches!(
                &inner.kind,
                StmtKind::Switch { targets, .. } if targets[0] == resume
            )),
            _ => false,
        }));
    }
}
