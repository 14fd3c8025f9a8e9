//! Closure conversion.
//!
//! Locals, parameters and the receiver that a lambda uses from its
//! enclosing routine move into a frame object created at the top of that
//! routine. Every capturing lambda becomes an instance routine on the
//! frame; a lambda that captures nothing becomes a static routine on the
//! containing type. Lambda expressions are replaced by delegates over the
//! new routines.
//!
//! Nested lambdas are handled by converting each new routine's body the
//! same way, so a lambda two levels deep reaches the outer frame through
//! the receiver field of its own frame.

use std::sync::Arc;

use kiln_core::bound::{
    Expr, ExprKind, Rewriter, Stmt, StmtKind, Visitor, rewrite_expr_children,
    rewrite_stmt_children, walk_expr, walk_stmt,
};
use kiln_core::symbols::{
    FieldDescriptor, LocalId, LocalSymbol, Parameter, RoutineDescriptor, RoutineFlags,
    RoutineKind, SynthesizedKind, TypeDescriptor,
};
use kiln_core::{Span, Ty, TypeKind};
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::debug;

use crate::factory::{assign, assign_local, local_field};
use crate::{LoweringContext, SynthesizedMethod, handler_rewriter};

const THIS_FIELD: &str = "<>4__this";

pub fn convert(routine: &Arc<RoutineDescriptor>, body: Stmt, cx: &mut LoweringContext<'_>) -> Stmt {
    let mut union = Captures::default();
    LambdaScan {
        found: &mut |captures: Captures| union.merge(captures),
    }
    .visit_stmt(&body);

    let frame = (!union.is_empty()).then(|| Frame::create(routine, &union, cx));
    let mut rewriter = OuterRewriter {
        routine,
        frame: frame.as_ref(),
        cx,
    };
    let body = rewriter.rewrite_stmt(body);

    match frame {
        Some(frame) => {
            debug!(
                routine = %routine.qualified_name(),
                frame = %frame.ty.name,
                captured = frame.ty.fields.len(),
                "closure frame"
            );
            let mut statements = frame.initialize(routine);
            statements.push(body);
            Stmt::block(vec![frame.local], statements)
        }
        None => body,
    }
}

/// What a lambda uses from the routine around it.
#[derive(Debug, Default)]
struct Captures {
    locals: Vec<LocalSymbol>,
    parameters: Vec<(u16, Parameter)>,
    this: bool,
}

impl Captures {
    fn is_empty(&self) -> bool {
        self.locals.is_empty() && self.parameters.is_empty() && !self.this
    }

    fn merge(&mut self, other: Captures) {
        for local in other.locals {
            if !self.locals.iter().any(|l| l.id == local.id) {
                self.locals.push(local);
            }
        }
        for (index, param) in other.parameters {
            if !self.parameters.iter().any(|(i, _)| *i == index) {
                self.parameters.push((index, param));
            }
        }
        self.this |= other.this;
    }

    /// Captures of the lambda over `routine` with `body`.
    fn of(routine: &Arc<RoutineDescriptor>, body: &Stmt) -> Self {
        let mut finder = CaptureFinder::default();
        finder.scopes.push(routine.clone());
        finder.visit_stmt(body);
        let declared = finder.declared;
        Self {
            locals: finder
                .referenced
                .into_iter()
                .filter(|local| !declared.contains(&local.id))
                .collect(),
            parameters: finder.parameters,
            this: finder.this,
        }
    }
}

/// Calls `found` with the captures of each outermost lambda.
struct LambdaScan<'a> {
    found: &'a mut dyn FnMut(Captures),
}

impl Visitor for LambdaScan<'_> {
    fn visit_expr(&mut self, expr: &Expr) {
        if let ExprKind::Lambda { routine, body } = &expr.kind {
            (self.found)(Captures::of(routine, body));
        } else {
            walk_expr(self, expr);
        }
    }
}

/// Whether the parameter at `index` belongs to one of the lambdas in
/// `scopes` rather than to the enclosing routine.
fn owned_by_lambda(scopes: &[Arc<RoutineDescriptor>], index: u16, param: &Parameter) -> bool {
    scopes
        .iter()
        .any(|lambda| lambda.parameters.get(usize::from(index)) == Some(param))
}

#[derive(Default)]
struct CaptureFinder {
    scopes: Vec<Arc<RoutineDescriptor>>,
    declared: FxHashSet<LocalId>,
    referenced: Vec<LocalSymbol>,
    parameters: Vec<(u16, Parameter)>,
    this: bool,
}

impl Visitor for CaptureFinder {
    fn visit_stmt(&mut self, stmt: &Stmt) {
        match &stmt.kind {
            StmtKind::Block { locals, .. } => {
                self.declared.extend(locals.iter().map(|l| l.id));
            }
            StmtKind::LocalDeclaration { local, .. } => {
                self.declared.insert(local.id);
            }
            StmtKind::Try { catches, .. } => {
                self.declared
                    .extend(catches.iter().filter_map(|c| c.local.as_ref()).map(|l| l.id));
            }
            _ => {}
        }
        walk_stmt(self, stmt);
    }

    fn visit_expr(&mut self, expr: &Expr) {
        match &expr.kind {
            ExprKind::Local(local) => {
                if !self.referenced.iter().any(|l| l.id == local.id) {
                    self.referenced.push(local.clone());
                }
            }
            ExprKind::Parameter { index, param } => {
                if !owned_by_lambda(&self.scopes, *index, param)
                    && !self.parameters.iter().any(|(i, _)| i == index)
                {
                    self.parameters.push((*index, param.clone()));
                }
            }
            ExprKind::This | ExprKind::Base => self.this = true,
            ExprKind::Sequence { locals, .. } => {
                self.declared.extend(locals.iter().map(|l| l.id));
            }
            ExprKind::Lambda { routine, .. } => {
                self.scopes.push(routine.clone());
                walk_expr(self, expr);
                self.scopes.pop();
                return;
            }
            _ => {}
        }
        walk_expr(self, expr);
    }
}

/// The object holding captured state for one routine activation.
struct Frame {
    ty: TypeDescriptor,
    local: LocalSymbol,
    constructor: Arc<RoutineDescriptor>,
    locals: FxHashMap<LocalId, Arc<FieldDescriptor>>,
    parameters: FxHashMap<u16, Arc<FieldDescriptor>>,
    this: Option<Arc<FieldDescriptor>>,
}

impl Frame {
    fn create(
        routine: &Arc<RoutineDescriptor>,
        captures: &Captures,
        cx: &mut LoweringContext<'_>,
    ) -> Self {
        let ordinal = cx.host.next_ordinal();
        let name = format!(
            "{}.<>c__DisplayClass{}",
            routine.containing_type.name, ordinal
        );
        let mut ty = TypeDescriptor::new(&name, TypeKind::Class);
        let named = ty.named();
        let mut used = FxHashSet::default();
        let mut field = |name: &str, field_ty: Ty| {
            let mut unique = name.to_string();
            let mut suffix = 1;
            while !used.insert(unique.clone()) {
                suffix += 1;
                unique = format!("{name}__{suffix}");
            }
            let field = Arc::new(FieldDescriptor::new(&named, &unique, field_ty));
            ty.fields.push(field.clone());
            field
        };

        let this = captures
            .this
            .then(|| field(THIS_FIELD, routine.this_type()));
        let parameters = captures
            .parameters
            .iter()
            .map(|(index, param)| (*index, field(&param.name, param.ty.clone())))
            .collect();
        let locals = captures
            .locals
            .iter()
            .map(|local| (local.id, field(&local.name, local.ty.clone())))
            .collect();

        let constructor = RoutineDescriptor::builder(
            &named,
            ".ctor",
            RoutineKind::Synthesized(SynthesizedKind::FrameConstructor),
        )
        .ordinal(ordinal)
        .synthesized_body(Stmt::list(Vec::new()))
        .build();
        ty.routines.push(constructor.clone());
        cx.host.record_synthesized(SynthesizedMethod {
            routine: constructor.clone(),
            body: Stmt::list(Vec::new()),
            resumable: None,
        });

        let local = LocalSymbol::synthesized("<>8__locals", ty.ty());
        Self {
            ty,
            local,
            constructor,
            locals,
            parameters,
            this,
        }
    }

    fn ty(&self) -> Ty {
        self.ty.ty()
    }

    /// `frame = new Frame(); frame.p = p; frame.<>4__this = this`
    fn initialize(&self, routine: &RoutineDescriptor) -> Vec<Stmt> {
        let mut statements = vec![assign_local(
            &self.local,
            Expr::new_object(&self.constructor, Vec::new()),
        )];
        let mut parameters: Vec<_> = self.parameters.iter().collect();
        parameters.sort_by_key(|(index, _)| **index);
        for (index, field) in parameters {
            if let Some(param) = routine.parameters.get(usize::from(*index)) {
                statements.push(assign(
                    local_field(&self.local, field),
                    Expr::parameter(*index, param),
                ));
            }
        }
        if let Some(this) = &self.this {
            statements.push(assign(
                local_field(&self.local, this),
                Expr::this(routine.this_type()),
            ));
        }
        statements
    }
}

/// Rewrites the enclosing routine's body.
struct OuterRewriter<'a, 'b, 'c> {
    routine: &'a Arc<RoutineDescriptor>,
    frame: Option<&'a Frame>,
    cx: &'b mut LoweringContext<'c>,
}

impl OuterRewriter<'_, '_, '_> {
    fn lambda(&mut self, source: Arc<RoutineDescriptor>, body: Stmt, ty: Ty, span: Span) -> Expr {
        let captures = Captures::of(&source, &body);
        let ordinal = self.cx.host.next_ordinal();
        let name = format!("<{}>b__{}", self.routine.name, ordinal);
        let flags = source.flags & (RoutineFlags::ASYNC | RoutineFlags::GENERATOR);
        let kind = RoutineKind::Synthesized(SynthesizedKind::Lambda);

        let (routine, body, receiver) = match self.frame.filter(|_| !captures.is_empty()) {
            Some(frame) => {
                let owner = frame.ty.named();
                let routine = RoutineDescriptor::builder(&owner, &name, kind)
                    .flags(flags)
                    .parameters(source.parameters.iter().cloned())
                    .returns(source.return_type.clone())
                    .ordinal(ordinal)
                    .span(source.span)
                    .build();
                let body = InnerRewriter {
                    frame,
                    scopes: vec![source.clone()],
                }
                .rewrite_stmt(body);
                (routine, body, Some(Expr::local(&frame.local)))
            }
            None => {
                let routine =
                    RoutineDescriptor::builder(&self.routine.containing_type, &name, kind)
                        .flags(flags | RoutineFlags::STATIC)
                        .parameters(source.parameters.iter().cloned())
                        .returns(source.return_type.clone())
                        .ordinal(ordinal)
                        .span(source.span)
                        .build();
                (routine, body, None)
            }
        };

        let body = if kiln_core::bound::contains_expr(&body, &|e| {
            matches!(e.kind, ExprKind::Lambda { .. })
        }) {
            convert(&routine, body, self.cx)
        } else {
            body
        };
        let body = if routine.is_async() || routine.is_generator() {
            handler_rewriter::rewrite(body)
        } else {
            body
        };
        debug!(lambda = %routine.qualified_name(), captures = receiver.is_some(), "lambda");
        self.cx.host.record_synthesized(SynthesizedMethod {
            routine: routine.clone(),
            body,
            resumable: None,
        });
        Expr::delegate(&routine, receiver, ty).at(span)
    }
}

impl Rewriter for OuterRewriter<'_, '_, '_> {
    fn rewrite_stmt(&mut self, stmt: Stmt) -> Stmt {
        let Some(frame) = self.frame else {
            return rewrite_stmt_children(self, stmt);
        };
        let stmt = match stmt.kind {
            StmtKind::Block { locals, statements } => Stmt {
                kind: StmtKind::Block {
                    locals: locals
                        .into_iter()
                        .filter(|l| !frame.locals.contains_key(&l.id))
                        .collect(),
                    statements,
                },
                ..stmt
            },
            kind => Stmt { kind, ..stmt },
        };
        let mut rewritten = rewrite_stmt_children(self, stmt);
        if let StmtKind::Try { catches, .. } = &mut rewritten.kind {
            // A captured exception local is copied into the frame on entry.
            for clause in catches {
                let Some(local) = &clause.local else { continue };
                if let Some(field) = frame.locals.get(&local.id) {
                    let copy = assign(local_field(&frame.local, field), Expr::local(local));
                    let body = std::mem::replace(&mut clause.body, Stmt::no_op());
                    clause.body = Stmt::list(vec![copy, body]);
                }
            }
        }
        rewritten
    }

    fn rewrite_expr(&mut self, expr: Expr) -> Expr {
        let expr = match expr.kind {
            ExprKind::Lambda { routine, body } => {
                return self.lambda(routine, *body, expr.ty, expr.span);
            }
            kind => Expr { kind, ..expr },
        };
        let Some(frame) = self.frame else {
            return rewrite_expr_children(self, expr);
        };
        let field = match &expr.kind {
            ExprKind::Local(local) => frame.locals.get(&local.id),
            ExprKind::Parameter { index, .. } => frame.parameters.get(index),
            _ => None,
        };
        match field {
            Some(field) => local_field(&frame.local, field).at(expr.span),
            None => rewrite_expr_children(self, expr),
        }
    }
}

/// Rewrites a capturing lambda's body to reach captured state through the
/// frame it now belongs to.
struct InnerRewriter<'a> {
    frame: &'a Frame,
    scopes: Vec<Arc<RoutineDescriptor>>,
}

impl InnerRewriter<'_> {
    fn frame_field(&self, field: &Arc<FieldDescriptor>) -> Expr {
        Expr::field(Some(Expr::this(self.frame.ty())), field)
    }
}

impl Rewriter for InnerRewriter<'_> {
    fn rewrite_expr(&mut self, expr: Expr) -> Expr {
        let replacement = match &expr.kind {
            ExprKind::Local(local) => self.frame.locals.get(&local.id).map(|f| self.frame_field(f)),
            ExprKind::Parameter { index, param } if !owned_by_lambda(&self.scopes, *index, param) => {
                self.frame.parameters.get(index).map(|f| self.frame_field(f))
            }
            ExprKind::This | ExprKind::Base => self.frame.this.as_ref().map(|f| self.frame_field(f)),
            ExprKind::Lambda { routine, .. } => {
                self.scopes.push(routine.clone());
                let rewritten = rewrite_expr_children(self, expr);
                self.scopes.pop();
                return rewritten;
            }
            _ => None,
        };
        match replacement {
            Some(field) => field.at(expr.span),
            None => rewrite_expr_children(self, expr),
        }
    }
}
