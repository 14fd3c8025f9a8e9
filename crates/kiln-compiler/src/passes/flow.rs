//! Definite assignment and reachability.
//!
//! Runs over the unlowered tree, so it understands `if`, `while`, `break`
//! and `continue` directly. The state at each point is either unreachable
//! or the set of tracked locals definitely assigned there; joins intersect.

use kiln_core::bound::{BinaryOp, Expr, ExprKind, Stmt, StmtKind, Visitor, walk_expr, walk_stmt};
use kiln_core::symbols::{LabelId, LocalId, LocalKind, LocalSymbol, RoutineDescriptor};
use kiln_core::{ConstantValue, DiagnosticBag, DiagnosticKind, Span};
use rustc_hash::{FxHashMap, FxHashSet};

/// What the analysed body belongs to.
#[derive(Debug, Clone)]
pub struct FlowTarget {
    pub name: String,
    pub span: Span,
    /// Falling off the end is an error.
    pub requires_value: bool,
}

impl FlowTarget {
    pub fn of(routine: &RoutineDescriptor) -> Self {
        Self {
            name: routine.qualified_name(),
            span: routine.span,
            requires_value: !routine.returns_void()
                && !routine.is_generator()
                && !routine.is_async(),
        }
    }

    /// Initializers never return.
    pub fn initializers(type_name: &str) -> Self {
        Self {
            name: type_name.to_string(),
            span: Span::default(),
            requires_value: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowAnalysis {
    pub end_reachable: bool,
}

#[derive(Debug, Clone, PartialEq)]
enum State {
    Unreachable,
    Reachable(FxHashSet<LocalId>),
}

impl State {
    fn is_reachable(&self) -> bool {
        matches!(self, State::Reachable(_))
    }

    fn join(self, other: State) -> State {
        match (self, other) {
            (State::Unreachable, other) | (other, State::Unreachable) => other,
            (State::Reachable(mut a), State::Reachable(b)) => {
                a.retain(|id| b.contains(id));
                State::Reachable(a)
            }
        }
    }

    fn assign(&mut self, id: LocalId) {
        if let State::Reachable(assigned) = self {
            assigned.insert(id);
        }
    }
}

#[derive(Default)]
struct Loop {
    breaks: Vec<State>,
}

struct FlowAnalyzer<'a> {
    diagnostics: &'a mut DiagnosticBag,
    declared: FxHashSet<LocalId>,
    reported_locals: FxHashSet<LocalId>,
    targeted_labels: FxHashSet<LabelId>,
    pending_gotos: FxHashMap<LabelId, State>,
    loops: Vec<Loop>,
    /// An unreachable region was already reported since flow was last reachable.
    region_reported: bool,
}

/// Every label some jump refers to.
struct LabelCollector(FxHashSet<LabelId>);

impl Visitor for LabelCollector {
    fn visit_stmt(&mut self, stmt: &Stmt) {
        match &stmt.kind {
            StmtKind::Goto(label) | StmtKind::ConditionalGoto { label, .. } => {
                self.0.insert(*label);
            }
            StmtKind::Switch {
                targets, default, ..
            } => {
                self.0.extend(targets.iter().copied());
                self.0.insert(*default);
            }
            _ => {}
        }
        walk_stmt(self, stmt);
    }
}

fn literal_bool(expr: &Expr) -> Option<bool> {
    match expr.kind {
        ExprKind::Literal(ConstantValue::Bool(value)) => Some(value),
        _ => None,
    }
}

fn tracked(local: &LocalSymbol) -> bool {
    local.kind == LocalKind::User
}

impl FlowAnalyzer<'_> {
    fn declare(&mut self, local: &LocalSymbol, state: &mut State) {
        if !tracked(local) {
            return;
        }
        self.declared.insert(local.id);
        if let State::Reachable(assigned) = state {
            assigned.remove(&local.id);
        }
    }

    fn read(&mut self, local: &LocalSymbol, span: Span, state: &State) {
        let State::Reachable(assigned) = state else {
            return;
        };
        if self.declared.contains(&local.id)
            && !assigned.contains(&local.id)
            && self.reported_locals.insert(local.id)
        {
            self.diagnostics.add(
                DiagnosticKind::UseOfUnassignedLocal {
                    name: local.name.to_string(),
                },
                span,
            );
        }
    }

    fn expr(&mut self, expr: &Expr, state: &mut State) {
        ExprFlow { flow: self, state }.visit_expr(expr);
    }

    fn report_unreachable(&mut self, stmt: &Stmt, state: &State) {
        if state.is_reachable() || self.region_reported {
            return;
        }
        let reportable = match &stmt.kind {
            StmtKind::Block { .. }
            | StmtKind::List(_)
            | StmtKind::Label(_)
            | StmtKind::NoOp => false,
            StmtKind::LocalDeclaration { initializer, .. } => initializer.is_some(),
            _ => true,
        };
        if reportable {
            self.region_reported = true;
            self.diagnostics
                .add(DiagnosticKind::UnreachableCode, stmt.span);
        }
    }

    fn record_goto(&mut self, label: LabelId, state: &State) {
        let joined = match self.pending_gotos.remove(&label) {
            Some(previous) => previous.join(state.clone()),
            None => state.clone(),
        };
        self.pending_gotos.insert(label, joined);
    }

    fn stmts(&mut self, statements: &[Stmt], mut state: State) -> State {
        for stmt in statements {
            state = self.stmt(stmt, state);
        }
        state
    }

    fn stmt(&mut self, stmt: &Stmt, mut state: State) -> State {
        if state.is_reachable() {
            self.region_reported = false;
        }
        self.report_unreachable(stmt, &state);
        match &stmt.kind {
            StmtKind::Block { locals, statements } => {
                for local in locals {
                    self.declare(local, &mut state);
                }
                self.stmts(statements, state)
            }
            StmtKind::List(statements) => self.stmts(statements, state),
            StmtKind::Expression(expr) => {
                self.expr(expr, &mut state);
                state
            }
            StmtKind::LocalDeclaration { local, initializer } => {
                self.declare(local, &mut state);
                if let Some(initializer) = initializer {
                    self.expr(initializer, &mut state);
                    state.assign(local.id);
                }
                state
            }
            StmtKind::If {
                condition,
                then_branch,
                else_branch,
            } => {
                self.expr(condition, &mut state);
                let constant = literal_bool(condition);
                let then_in = if constant == Some(false) {
                    State::Unreachable
                } else {
                    state.clone()
                };
                let else_in = if constant == Some(true) {
                    State::Unreachable
                } else {
                    state
                };
                let then_out = self.stmt(then_branch, then_in);
                let else_out = match else_branch {
                    Some(else_branch) => self.stmt(else_branch, else_in),
                    None => else_in,
                };
                then_out.join(else_out)
            }
            StmtKind::While { condition, body } => {
                self.expr(condition, &mut state);
                let constant = literal_bool(condition);
                let body_in = if constant == Some(false) {
                    State::Unreachable
                } else {
                    state.clone()
                };
                let exit = if constant == Some(true) {
                    State::Unreachable
                } else {
                    state
                };
                self.loops.push(Loop::default());
                self.stmt(body, body_in);
                let breaks = self.loops.pop().map(|l| l.breaks).unwrap_or_default();
                breaks.into_iter().fold(exit, State::join)
            }
            StmtKind::Break => {
                if let Some(current) = self.loops.last_mut() {
                    current.breaks.push(state);
                }
                State::Unreachable
            }
            StmtKind::Continue | StmtKind::YieldBreak => State::Unreachable,
            StmtKind::Return(value) | StmtKind::Throw(value) => {
                if let Some(value) = value {
                    self.expr(value, &mut state);
                }
                State::Unreachable
            }
            StmtKind::Try {
                body,
                catches,
                finally,
            } => {
                let entry = state;
                let mut out = self.stmt(body, entry.clone());
                for clause in catches {
                    let mut clause_in = entry.clone();
                    if let Some(local) = &clause.local {
                        self.declare(local, &mut clause_in);
                        clause_in.assign(local.id);
                    }
                    let clause_out = self.stmt(&clause.body, clause_in);
                    out = out.join(clause_out);
                }
                if let Some(finally) = finally {
                    match self.stmt(finally, entry) {
                        State::Unreachable => out = State::Unreachable,
                        State::Reachable(assigned_in_finally) => {
                            if let State::Reachable(assigned) = &mut out {
                                assigned.extend(assigned_in_finally);
                            }
                        }
                    }
                }
                out
            }
            StmtKind::Yield(value) => {
                self.expr(value, &mut state);
                state
            }
            StmtKind::Suspend { value, .. } => {
                if let Some(value) = value {
                    self.expr(value, &mut state);
                }
                state
            }
            StmtKind::Label(label) => {
                let incoming = self.pending_gotos.remove(label);
                let out = match incoming {
                    Some(jumped) => state.join(jumped),
                    // Only backward jumps reach it; assume everything assigned.
                    None if !state.is_reachable() && self.targeted_labels.contains(label) => {
                        State::Reachable(self.declared.clone())
                    }
                    None => state,
                };
                if out.is_reachable() {
                    self.region_reported = false;
                }
                out
            }
            StmtKind::Goto(label) => {
                self.record_goto(*label, &state);
                State::Unreachable
            }
            StmtKind::ConditionalGoto {
                condition, label, ..
            } => {
                self.expr(condition, &mut state);
                self.record_goto(*label, &state);
                state
            }
            StmtKind::Switch {
                value,
                targets,
                default,
            } => {
                self.expr(value, &mut state);
                for label in targets.iter().chain(std::iter::once(default)) {
                    self.record_goto(*label, &state);
                }
                State::Unreachable
            }
            StmtKind::NoOp => state,
        }
    }
}

/// Expression-level flow: evaluation order, assignments and reads.
struct ExprFlow<'f, 'a> {
    flow: &'f mut FlowAnalyzer<'a>,
    state: &'f mut State,
}

impl ExprFlow<'_, '_> {
    fn branch(&mut self, expr: &Expr) -> State {
        let mut state = self.state.clone();
        ExprFlow {
            flow: &mut *self.flow,
            state: &mut state,
        }
        .visit_expr(expr);
        state
    }
}

impl Visitor for ExprFlow<'_, '_> {
    fn visit_expr(&mut self, expr: &Expr) {
        match &expr.kind {
            ExprKind::Local(local) => self.flow.read(local, expr.span, self.state),
            ExprKind::Assign { target, value } => match &target.kind {
                ExprKind::Local(local) => {
                    self.visit_expr(value);
                    self.state.assign(local.id);
                }
                _ => walk_expr(self, expr),
            },
            // An out-style address counts as an assignment.
            ExprKind::AddressOf(operand) => match &operand.kind {
                ExprKind::Local(local) => self.state.assign(local.id),
                _ => walk_expr(self, expr),
            },
            ExprKind::Binary {
                op: BinaryOp::LogicalAnd | BinaryOp::LogicalOr,
                left,
                right,
            } => {
                self.visit_expr(left);
                let right_out = self.branch(right);
                let joined = std::mem::replace(self.state, State::Unreachable).join(right_out);
                *self.state = joined;
            }
            ExprKind::Conditional {
                condition,
                when_true,
                when_false,
            } => {
                self.visit_expr(condition);
                let true_out = self.branch(when_true);
                let false_out = self.branch(when_false);
                *self.state = true_out.join(false_out);
            }
            ExprKind::Lambda { body, .. } => {
                // Captured locals must be assigned where the lambda is created.
                let loops = std::mem::take(&mut self.flow.loops);
                let region_reported = self.flow.region_reported;
                self.flow.stmt(body, self.state.clone());
                self.flow.loops = loops;
                self.flow.region_reported = region_reported;
            }
            _ => walk_expr(self, expr),
        }
    }

    fn visit_stmt(&mut self, _stmt: &Stmt) {}
}

/// Analyse `body`, reporting into `diagnostics`.
pub fn analyze(body: &Stmt, target: &FlowTarget, diagnostics: &mut DiagnosticBag) -> FlowAnalysis {
    let mut labels = LabelCollector(FxHashSet::default());
    labels.visit_stmt(body);

    let mut analyzer = FlowAnalyzer {
        diagnostics,
        declared: FxHashSet::default(),
        reported_locals: FxHashSet::default(),
        targeted_labels: labels.0,
        pending_gotos: FxHashMap::default(),
        loops: Vec::new(),
        region_reported: false,
    };
    let end = analyzer.stmt(body, State::Reachable(FxHashSet::default()));
    let end_reachable = end.is_reachable();

    if end_reachable && target.requires_value {
        analyzer.diagnostics.add(
            DiagnosticKind::NotAllPathsReturn {
                routine: target.name.clone(),
            },
            target.span,
        );
    }
    FlowAnalysis { end_reachable }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_core::Ty;

    fn create_test_target(requires_value: bool) -> FlowTarget {
        FlowTarget {
            name: "Flow.Run".into(),
            span: Span::point(1, 1),
            requires_value,
        }
    }

    fn run(body: &Stmt, requires_value: bool) -> (FlowAnalysis, Vec<DiagnosticKind>) {
        let mut bag = DiagnosticBag::new();
        let analysis = analyze(body, &create_test_target(requires_value), &mut bag);
        (analysis, bag.iter().map(|d| d.kind.clone()).collect())
    }

    #[test]
    fn read_before_assignment_is_reported_once() {
        let x = LocalSymbol::user(1, "x", Ty::Int);
        let body = Stmt::block(
            vec![x.clone()],
            vec![
                Stmt::expr(Expr::local(&x)),
                Stmt::expr(Expr::local(&x)),
                Stmt::expr(Expr::assign(Expr::local(&x), Expr::int(1))),
            ],
        );
        let (analysis, kinds) = run(&body, false);
        assert!(analysis.end_reachable);
        assert_eq!(
            kinds,
            vec![DiagnosticKind::UseOfUnassignedLocal { name: "x".into() }]
        );
    }

    #[test]
    fn assignment_on_one_branch_is_not_definite() {
        let x = LocalSymbol::user(1, "x", Ty::Int);
        let flag = LocalSymbol::user(2, "flag", Ty::Bool);
        let body = Stmt::block(
            vec![x.clone()],
            vec![
                Stmt::local_declaration(flag.clone(), Some(Expr::boolean(false))),
                Stmt::if_(
                    Expr::local(&flag),
                    Stmt::expr(Expr::assign(Expr::local(&x), Expr::int(1))),
                    None,
                ),
                Stmt::ret(Some(Expr::local(&x))),
            ],
        );
        let (analysis, kinds) = run(&body, true);
        assert!(!analysis.end_reachable);
        assert_eq!(
            kinds,
            vec![DiagnosticKind::UseOfUnassignedLocal { name: "x".into() }]
        );
    }

    #[test]
    fn both_branches_assign() {
        let x = LocalSymbol::user(1, "x", Ty::Int);
        let body = Stmt::block(
            vec![x.clone()],
            vec![
                Stmt::if_(
                    Expr::boolean(true).at(Span::point(2, 1)),
                    Stmt::expr(Expr::assign(Expr::local(&x), Expr::int(1))),
                    Some(Stmt::expr(Expr::assign(Expr::local(&x), Expr::int(2)))),
                ),
                Stmt::ret(Some(Expr::local(&x))),
            ],
        );
        let (_, kinds) = run(&body, true);
        // The constant-true condition leaves the else branch unreachable.
        assert_eq!(kinds, vec![DiagnosticKind::UnreachableCode]);
    }

    #[test]
    fn unreachable_region_reported_once() {
        let body = Stmt::list(vec![
            Stmt::ret(None),
            Stmt::expr(Expr::int(1)).at(Span::point(4, 1)),
            Stmt::expr(Expr::int(2)).at(Span::point(5, 1)),
        ]);
        let mut bag = DiagnosticBag::new();
        let analysis = analyze(&body, &create_test_target(false), &mut bag);
        assert!(!analysis.end_reachable);
        let diagnostics: Vec<_> = bag.iter().collect();
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].kind, DiagnosticKind::UnreachableCode);
        assert_eq!(diagnostics[0].span, Span::point(4, 1));
    }

    #[test]
    fn missing_return_in_value_routine() {
        let body = Stmt::block(vec![], vec![Stmt::expr(Expr::int(1))]);
        let (analysis, kinds) = run(&body, true);
        assert!(analysis.end_reachable);
        assert_eq!(
            kinds,
            vec![DiagnosticKind::NotAllPathsReturn {
                routine: "Flow.Run".into()
            }]
        );
    }

    #[test]
    fn infinite_loop_exits_only_through_break() {
        let x = LocalSymbol::user(1, "x", Ty::Int);
        let body = Stmt::block(
            vec![x.clone()],
            vec![
                Stmt::while_(
                    Expr::boolean(true),
                    Stmt::list(vec![
                        Stmt::expr(Expr::assign(Expr::local(&x), Expr::int(3))),
                        Stmt::new(StmtKind::Break),
                    ]),
                ),
                Stmt::ret(Some(Expr::local(&x))),
            ],
        );
        let (analysis, kinds) = run(&body, true);
        assert!(!analysis.end_reachable);
        assert!(kinds.is_empty(), "{kinds:?}");

        let spin = Stmt::while_(Expr::boolean(true), Stmt::no_op());
        let (analysis, kinds) = run(&spin, true);
        assert!(!analysis.end_reachable);
        assert!(kinds.is_empty());
    }

    #[test]
    fn forward_goto_makes_label_reachable() {
        let label = LabelId(7);
        let body = Stmt::list(vec![
            Stmt::goto(label),
            Stmt::label(label),
            Stmt::ret(None),
        ]);
        let (analysis, kinds) = run(&body, false);
        assert!(!analysis.end_reachable);
        assert!(kinds.is_empty());
    }
}
