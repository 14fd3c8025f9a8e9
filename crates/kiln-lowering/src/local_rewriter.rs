//! Local-construct rewrite: the first step of the chain.
//!
//! Desugars everything the code generator does not accept except
//! suspension points and lambdas, which later steps own:
//!
//! | Before | After |
//! |--------|-------|
//! | `LocalDeclaration` | assignment, or nothing |
//! | `If` / `While` / `Break` / `Continue` | labels and gotos |
//! | `CompoundAssign` | assignment of a binary op, receivers spilled once |
//! | `Dynamic` | `Runtime.InvokeMember` with a boxed argument array |
//!
//! While walking it records the [`LocalFacts`] the rest of the chain
//! needs to decide which steps apply.

use std::mem;

use kiln_core::bound::{
    Expr, ExprKind, Rewriter, Stmt, StmtKind, rewrite_expr_children, rewrite_stmt_children,
};
use kiln_core::symbols::{LabelId, LocalSymbol};
use kiln_core::{ConstantValue, Span, Ty};

use crate::factory::{assign_local, goto_if, to_object};
use crate::well_known;

/// What the local rewrite observed in a routine body.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LocalFacts {
    /// At least one lambda appears.
    pub has_closures: bool,
    /// At least one late-bound operation appears.
    pub has_dynamic: bool,
    /// A `yield` or `await` of the routine itself sits inside a `try`.
    pub suspends_in_handler: bool,
    /// The routine itself contains an `await`.
    pub has_suspensions: bool,
}

struct LoopLabels {
    break_label: LabelId,
    continue_label: LabelId,
}

#[derive(Default)]
struct LocalRewriter {
    facts: LocalFacts,
    loops: Vec<LoopLabels>,
    try_depth: u32,
    lambda_depth: u32,
}

/// Desugar `body` and report what was found.
#[cfg_attr(feature = "profiling", profiling::function)]
pub fn rewrite(body: Stmt) -> (Stmt, LocalFacts) {
    let mut rewriter = LocalRewriter::default();
    let body = rewriter.rewrite_stmt(body);
    (body, rewriter.facts)
}

/// Carry the replaced node's marker and location over.
fn finish(mut stmt: Stmt, has_errors: bool, span: Span) -> Stmt {
    stmt.has_errors |= has_errors;
    if stmt.span.is_synthesized() {
        stmt.span = span;
    }
    stmt
}

impl LocalRewriter {
    fn in_own_try(&self) -> bool {
        self.try_depth > 0 && self.lambda_depth == 0
    }

    fn lower_if(&mut self, condition: Expr, then_branch: Stmt, else_branch: Option<Stmt>) -> Stmt {
        let condition = self.rewrite_expr(condition);
        let then_branch = self.rewrite_stmt(then_branch);
        let end = LabelId::fresh();
        match else_branch {
            None => Stmt::list(vec![
                goto_if(condition, false, end),
                then_branch,
                Stmt::label(end),
            ]),
            Some(else_branch) => {
                let else_branch = self.rewrite_stmt(else_branch);
                let otherwise = LabelId::fresh();
                Stmt::list(vec![
                    goto_if(condition, false, otherwise),
                    then_branch,
                    Stmt::goto(end),
                    Stmt::label(otherwise),
                    else_branch,
                    Stmt::label(end),
                ])
            }
        }
    }

    /// ```text
    ///     goto check
    /// top:
    ///     body
    /// check:                  <- continue
    ///     if (condition) goto top
    /// end:                    <- break
    /// ```
    fn lower_while(&mut self, condition: Expr, body: Stmt) -> Stmt {
        let top = LabelId::fresh();
        let check = LabelId::fresh();
        let end = LabelId::fresh();
        let condition = self.rewrite_expr(condition);

        self.loops.push(LoopLabels {
            break_label: end,
            continue_label: check,
        });
        let body = self.rewrite_stmt(body);
        self.loops.pop();

        Stmt::list(vec![
            Stmt::goto(check),
            Stmt::label(top),
            body,
            Stmt::label(check),
            goto_if(condition, true, top),
            Stmt::label(end),
        ])
    }

    fn lower_compound(&mut self, op: kiln_core::bound::BinaryOp, target: Expr, value: Expr) -> Expr {
        let mut locals = Vec::new();
        let mut effects = Vec::new();
        let target = stabilize(target, &mut locals, &mut effects);
        let combined = Expr::binary(op, target.clone(), value);
        let assignment = Expr::assign(target, combined);
        if locals.is_empty() {
            assignment
        } else {
            Expr::sequence(locals, effects, assignment)
        }
    }

    fn lower_dynamic(&mut self, member: &str, receiver: Expr, args: Vec<Expr>) -> Expr {
        let array_ty = Ty::array_of(Ty::Object);
        let packed = LocalSymbol::synthesized("<>args", array_ty);
        let mut effects = vec![Expr::assign(
            Expr::local(&packed),
            Expr::new_array(Ty::Object, Expr::int(args.len() as i64)),
        )];
        for (index, arg) in args.into_iter().enumerate() {
            let slot = Expr::element(Expr::local(&packed), vec![Expr::int(index as i64)]);
            effects.push(Expr::assign(slot, to_object(arg)));
        }
        let call = Expr::call(
            None,
            &well_known::invoke_member(),
            vec![
                to_object(receiver),
                Expr::literal(ConstantValue::string(member)),
                Expr::local(&packed),
            ],
        );
        Expr::sequence(vec![packed], effects, call)
    }
}

impl Rewriter for LocalRewriter {
    fn rewrite_stmt(&mut self, stmt: Stmt) -> Stmt {
        let Stmt {
            kind,
            has_errors,
            span,
        } = stmt;
        let lowered = match kind {
            StmtKind::LocalDeclaration { local, initializer } => match initializer {
                Some(value) => {
                    let value = self.rewrite_expr(value);
                    assign_local(&local, value)
                }
                None => Stmt::list(Vec::new()),
            },

            StmtKind::If {
                condition,
                then_branch,
                else_branch,
            } => self.lower_if(condition, *then_branch, else_branch.map(|e| *e)),

            StmtKind::While { condition, body } => self.lower_while(condition, *body),

            StmtKind::Break => match self.loops.last() {
                Some(labels) => Stmt::goto(labels.break_label),
                None => Stmt::new(StmtKind::Break),
            },
            StmtKind::Continue => match self.loops.last() {
                Some(labels) => Stmt::goto(labels.continue_label),
                None => Stmt::new(StmtKind::Continue),
            },

            kind @ StmtKind::Try { .. } => {
                self.try_depth += 1;
                let rewritten = rewrite_stmt_children(self, Stmt::new(kind));
                self.try_depth -= 1;
                rewritten
            }

            StmtKind::Yield(value) => {
                if self.in_own_try() {
                    self.facts.suspends_in_handler = true;
                }
                Stmt::yield_(self.rewrite_expr(value))
            }

            other => rewrite_stmt_children(self, Stmt::new(other)),
        };
        finish(lowered, has_errors, span)
    }

    fn rewrite_expr(&mut self, expr: Expr) -> Expr {
        match expr.kind {
            ExprKind::Lambda { .. } => {
                self.facts.has_closures = true;
                self.lambda_depth += 1;
                let loops = mem::take(&mut self.loops);
                let try_depth = mem::replace(&mut self.try_depth, 0);
                let rewritten = rewrite_expr_children(self, expr);
                self.try_depth = try_depth;
                self.loops = loops;
                self.lambda_depth -= 1;
                rewritten
            }

            ExprKind::Await(_) => {
                if self.lambda_depth == 0 {
                    self.facts.has_suspensions = true;
                    if self.try_depth > 0 {
                        self.facts.suspends_in_handler = true;
                    }
                }
                rewrite_expr_children(self, expr)
            }

            ExprKind::Dynamic { .. } => {
                self.facts.has_dynamic = true;
                let original_errors = expr.has_errors;
                let span = expr.span;
                let Expr {
                    kind: ExprKind::Dynamic {
                        member,
                        receiver,
                        args,
                    },
                    ..
                } = rewrite_expr_children(self, expr)
                else {
                    return Expr::error(Ty::Dynamic).at(span);
                };
                let mut lowered = self.lower_dynamic(&member, *receiver, args).at(span);
                lowered.has_errors |= original_errors;
                lowered
            }

            ExprKind::CompoundAssign { .. } => {
                let original_errors = expr.has_errors;
                let span = expr.span;
                let Expr {
                    kind: ExprKind::CompoundAssign { op, target, value },
                    ..
                } = rewrite_expr_children(self, expr)
                else {
                    return Expr::error(Ty::Error).at(span);
                };
                let mut lowered = self.lower_compound(op, *target, *value).at(span);
                lowered.has_errors |= original_errors;
                lowered
            }

            _ => rewrite_expr_children(self, expr),
        }
    }
}

/// Reading `expr` twice denotes the same storage without re-running side
/// effects.
fn is_stable(expr: &Expr) -> bool {
    match &expr.kind {
        ExprKind::Field { receiver, .. } => receiver.as_deref().is_none_or(is_stable),
        _ => expr.is_side_effect_free(),
    }
}

fn spill(value: Expr, locals: &mut Vec<LocalSymbol>, effects: &mut Vec<Expr>) -> Expr {
    let temp = LocalSymbol::synthesized("<>spill", value.ty.clone());
    effects.push(Expr::assign(Expr::local(&temp), value));
    let load = Expr::local(&temp);
    locals.push(temp);
    load
}

/// Make a compound-assignment target safe to evaluate twice.
fn stabilize(target: Expr, locals: &mut Vec<LocalSymbol>, effects: &mut Vec<Expr>) -> Expr {
    let Expr {
        kind,
        ty,
        has_errors,
        span,
    } = target;
    let kind = match kind {
        ExprKind::Field {
            receiver: Some(receiver),
            field,
            by_value,
        } if !is_stable(&receiver) => ExprKind::Field {
            receiver: Some(Box::new(spill(*receiver, locals, effects))),
            field,
            by_value,
        },
        ExprKind::Element { array, indices } => {
            let array = if is_stable(&array) {
                *array
            } else {
                spill(*array, locals, effects)
            };
            let indices = indices
                .into_iter()
                .map(|index| {
                    if index.is_side_effect_free() {
                        index
                    } else {
                        spill(index, locals, effects)
                    }
                })
                .collect();
            ExprKind::Element {
                array: Box::new(array),
                indices,
            }
        }
        other => other,
    };
    let mut stable = Expr::new(kind, ty).at(span);
    stable.has_errors |= has_errors;
    stable
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use kiln_core::bound::{BinaryOp, contains_expr, contains_stmt};
    use kiln_core::symbols::{FieldDescriptor, RoutineDescriptor, RoutineKind};
    use kiln_core::{NamedType, TypeKind};

    fn kinds(stmt: &Stmt) -> Vec<&'static str> {
        let StmtKind::List(statements) = &stmt.kind else {
            panic!("expected a statement list, got {:?}", stmt.kind);
        };
        statements
            .iter()
            .map(|s| match s.kind {
                StmtKind::ConditionalGoto { .. } => "cond-goto",
                StmtKind::Goto(_) => "goto",
                StmtKind::Label(_) => "label",
                StmtKind::NoOp => "noop",
                _ => "other",
            })
            .collect()
    }

    #[test]
    fn if_else_becomes_labels() {
        let stmt = Stmt::if_(Expr::boolean(true), Stmt::no_op(), Some(Stmt::no_op()));
        let (lowered, facts) = rewrite(stmt);
        assert_eq!(
            kinds(&lowered),
            vec!["cond-goto", "noop", "goto", "label", "noop", "label"]
        );
        assert_eq!(facts, LocalFacts::default());
    }

    #[test]
    fn break_and_continue_target_the_loop() {
        let body = Stmt::list(vec![Stmt::new(StmtKind::Break), Stmt::new(StmtKind::Continue)]);
        let (lowered, _) = rewrite(Stmt::while_(Expr::boolean(true), body));
        let StmtKind::List(statements) = &lowered.kind else {
            panic!("expected list");
        };
        let (StmtKind::Label(check), StmtKind::Label(end)) = (&statements[3].kind, &statements[5].kind)
        else {
            panic!("unexpected loop shape");
        };
        let StmtKind::List(inner) = &statements[2].kind else {
            panic!("expected body list");
        };
        assert_eq!(inner[0].kind, StmtKind::Goto(*end));
        assert_eq!(inner[1].kind, StmtKind::Goto(*check));
        assert!(!contains_stmt(&lowered, &|s| matches!(
            s.kind,
            StmtKind::While { .. } | StmtKind::Break | StmtKind::Continue
        )));
    }

    #[test]
    fn declaration_becomes_assignment() {
        let local = LocalSymbol::user(1, "x", Ty::Int);
        let stmt = Stmt::block(
            vec![local.clone()],
            vec![Stmt::local_declaration(local.clone(), Some(Expr::int(3)))],
        );
        let (lowered, _) = rewrite(stmt);
        assert!(contains_expr(&lowered, &|e| matches!(
            &e.kind,
            ExprKind::Assign { target, .. } if matches!(&target.kind, ExprKind::Local(l) if l.id == local.id)
        )));
    }

    #[test]
    fn compound_assignment_spills_computed_receiver_once() {
        let owner = NamedType::new("Box", TypeKind::Class);
        let field = Arc::new(FieldDescriptor::new(&owner, "count", Ty::Int));
        let make = RoutineDescriptor::builder(&owner, "Make", RoutineKind::Ordinary)
            .flags(kiln_core::symbols::RoutineFlags::STATIC)
            .returns(Ty::Named(owner.clone()))
            .build();
        let target = Expr::field(Some(Expr::call(None, &make, vec![])), &field);
        let stmt = Stmt::expr(Expr::compound_assign(BinaryOp::Add, target, Expr::int(1)));

        let (lowered, _) = rewrite(stmt);
        let StmtKind::Expression(expr) = &lowered.kind else {
            panic!("expected expression statement");
        };
        let ExprKind::Sequence {
            locals,
            side_effects,
            ..
        } = &expr.kind
        else {
            panic!("expected a spilled sequence, got {:?}", expr.kind);
        };
        assert_eq!(locals.len(), 1);
        assert_eq!(side_effects.len(), 1);
        let calls = {
            let mut count = 0;
            struct Count<'a>(&'a mut usize);
            impl kiln_core::bound::Visitor for Count<'_> {
                fn visit_expr(&mut self, expr: &Expr) {
                    if matches!(expr.kind, ExprKind::Call { .. }) {
                        *self.0 += 1;
                    }
                    kiln_core::bound::walk_expr(self, expr);
                }
            }
            kiln_core::bound::Visitor::visit_stmt(&mut Count(&mut count), &lowered);
            count
        };
        assert_eq!(calls, 1);
    }

    #[test]
    fn dynamic_call_packs_arguments() {
        let stmt = Stmt::expr(Expr::dynamic("Run", Expr::null(Ty::Dynamic), vec![Expr::int(7)]));
        let (lowered, facts) = rewrite(stmt);
        assert!(facts.has_dynamic);
        assert!(!contains_expr(&lowered, &|e| matches!(e.kind, ExprKind::Dynamic { .. })));
        assert!(contains_expr(&lowered, &|e| matches!(
            &e.kind,
            ExprKind::Convert { conversion: kiln_core::bound::ConversionKind::Box, .. }
        )));
    }

    #[test]
    fn await_in_try_is_reported_but_not_inside_lambdas() {
        let owner = NamedType::new("C", TypeKind::Class);
        let lambda = RoutineDescriptor::builder(&owner, "<lambda>", RoutineKind::Ordinary).build();
        let inner = Stmt::try_(
            Stmt::expr(Expr::await_(Expr::null(Ty::Object), Ty::Void)),
            vec![],
            Some(Stmt::no_op()),
        );
        let closure = Expr::lambda(&lambda, inner, Ty::named("Action", TypeKind::Delegate));
        let (_, facts) = rewrite(Stmt::expr(closure));
        assert!(facts.has_closures);
        assert!(!facts.suspends_in_handler);
        assert!(!facts.has_suspensions);

        let own = Stmt::try_(
            Stmt::expr(Expr::await_(Expr::null(Ty::Object), Ty::Void)),
            vec![],
            Some(Stmt::no_op()),
        );
        let (_, facts) = rewrite(own);
        assert!(facts.suspends_in_handler);
        assert!(facts.has_suspensions);
    }

    #[test]
    fn error_marker_survives_desugaring() {
        let stmt = Stmt::if_(Expr::error(Ty::Bool), Stmt::no_op(), None);
        assert!(stmt.has_errors);
        let (lowered, _) = rewrite(stmt);
        assert!(lowered.has_errors);
    }
}
