use std::sync::Arc;

use crate::symbols::{FieldDescriptor, LocalSymbol, Parameter, RefKind, RoutineDescriptor};
use crate::{ConstantValue, Span, Ty};

use super::Stmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    BitAnd,
    BitOr,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    LogicalAnd,
    LogicalOr,
}

impl BinaryOp {
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinaryOp::Eq | BinaryOp::Ne | BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge
        )
    }

    pub fn is_logical(self) -> bool {
        matches!(self, BinaryOp::LogicalAnd | BinaryOp::LogicalOr)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConversionKind {
    Box,
    Unbox,
    Numeric,
    Reference,
}

/// Expression node kinds.
#[derive(Debug, Clone, PartialEq)]
pub enum ExprKind {
    Literal(ConstantValue),
    Local(LocalSymbol),
    /// `index` counts declared parameters only, from zero.
    Parameter {
        index: u16,
        param: Parameter,
    },
    This,
    Base,
    Field {
        receiver: Option<Box<Expr>>,
        field: Arc<FieldDescriptor>,
        /// The access reads a copy, so it never denotes storage.
        by_value: bool,
    },
    Element {
        array: Box<Expr>,
        indices: Vec<Expr>,
    },
    /// Pointer indirection.
    Deref(Box<Expr>),
    /// Unwraps a typed reference to the storage it refers to.
    RefValue(Box<Expr>),
    /// Marker for a duplicate of the value on top of the evaluation stack.
    Dup(RefKind),
    /// Placeholder receiver of a conditional access; already boxed.
    ConditionalReceiver,
    /// Scoped sub-evaluation: locals, side effects, then a trailing value.
    Sequence {
        locals: Vec<LocalSymbol>,
        side_effects: Vec<Expr>,
        value: Box<Expr>,
    },
    /// Takes a writable reference to the operand's storage.
    AddressOf(Box<Expr>),
    Assign {
        target: Box<Expr>,
        value: Box<Expr>,
    },
    CompoundAssign {
        op: BinaryOp,
        target: Box<Expr>,
        value: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Conditional {
        condition: Box<Expr>,
        when_true: Box<Expr>,
        when_false: Box<Expr>,
    },
    Call {
        receiver: Option<Box<Expr>>,
        routine: Arc<RoutineDescriptor>,
        args: Vec<Expr>,
    },
    New {
        constructor: Arc<RoutineDescriptor>,
        args: Vec<Expr>,
    },
    NewArray {
        element: Ty,
        size: Box<Expr>,
    },
    Convert {
        operand: Box<Expr>,
        conversion: ConversionKind,
    },
    DefaultValue,
    /// A closure; removed by closure conversion.
    Lambda {
        routine: Arc<RoutineDescriptor>,
        body: Box<Stmt>,
    },
    /// Delegate over a routine, bound to `receiver` when it is an instance routine.
    Delegate {
        routine: Arc<RoutineDescriptor>,
        receiver: Option<Box<Expr>>,
    },
    /// Suspension point; removed by the suspend state machine.
    Await(Box<Expr>),
    /// Late-bound member invocation.
    Dynamic {
        member: Arc<str>,
        receiver: Box<Expr>,
        args: Vec<Expr>,
    },
    /// A node the binder could not bind.
    Error,
}

/// An expression with its type, sticky error marker and location.
#[derive(Debug, Clone, PartialEq)]
pub struct Expr {
    pub kind: ExprKind,
    pub ty: Ty,
    pub has_errors: bool,
    pub span: Span,
}

impl Expr {
    /// Build a node; the error marker is set if any child carries it.
    pub fn new(kind: ExprKind, ty: Ty) -> Self {
        let mut has_errors = matches!(kind, ExprKind::Error);
        super::visit::for_each_child_expr(&kind, &mut |child| has_errors |= child.has_errors);
        if let ExprKind::Lambda { body, .. } = &kind {
            has_errors |= body.has_errors;
        }
        Self {
            kind,
            ty,
            has_errors,
            span: Span::default(),
        }
    }

    pub fn at(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Mark this node as erroneous.
    pub fn with_errors(mut self) -> Self {
        self.has_errors = true;
        self
    }

    /// Carry `original`'s error marker over to a node that replaces it.
    pub fn inherit_errors(mut self, original: &Expr) -> Self {
        self.has_errors |= original.has_errors;
        if self.span.is_synthesized() {
            self.span = original.span;
        }
        self
    }

    pub fn literal(value: ConstantValue) -> Self {
        let ty = value.ty();
        Self::new(ExprKind::Literal(value), ty)
    }

    pub fn int(value: i64) -> Self {
        Self::literal(ConstantValue::Int(value))
    }

    pub fn boolean(value: bool) -> Self {
        Self::literal(ConstantValue::Bool(value))
    }

    pub fn null(ty: Ty) -> Self {
        Self::new(ExprKind::Literal(ConstantValue::Null), ty)
    }

    pub fn local(local: &LocalSymbol) -> Self {
        Self::new(ExprKind::Local(local.clone()), local.ty.clone())
    }

    pub fn parameter(index: u16, param: &Parameter) -> Self {
        Self::new(
            ExprKind::Parameter {
                index,
                param: param.clone(),
            },
            param.ty.clone(),
        )
    }

    pub fn this(ty: Ty) -> Self {
        Self::new(ExprKind::This, ty)
    }

    pub fn base(ty: Ty) -> Self {
        Self::new(ExprKind::Base, ty)
    }

    pub fn field(receiver: Option<Expr>, field: &Arc<FieldDescriptor>) -> Self {
        let ty = field.ty.clone();
        Self::new(
            ExprKind::Field {
                receiver: receiver.map(Box::new),
                field: field.clone(),
                by_value: false,
            },
            ty,
        )
    }

    /// A field read through a receiver that is itself a copy.
    pub fn field_value(receiver: Expr, field: &Arc<FieldDescriptor>) -> Self {
        let ty = field.ty.clone();
        Self::new(
            ExprKind::Field {
                receiver: Some(Box::new(receiver)),
                field: field.clone(),
                by_value: true,
            },
            ty,
        )
    }

    pub fn element(array: Expr, indices: Vec<Expr>) -> Self {
        let ty = array.ty.element().cloned().unwrap_or(Ty::Error);
        Self::new(
            ExprKind::Element {
                array: Box::new(array),
                indices,
            },
            ty,
        )
    }

    pub fn deref(pointer: Expr) -> Self {
        let ty = pointer.ty.element().cloned().unwrap_or(Ty::Error);
        Self::new(ExprKind::Deref(Box::new(pointer)), ty)
    }

    pub fn ref_value(operand: Expr, ty: Ty) -> Self {
        Self::new(ExprKind::RefValue(Box::new(operand)), ty)
    }

    pub fn dup(ref_kind: RefKind, ty: Ty) -> Self {
        Self::new(ExprKind::Dup(ref_kind), ty)
    }

    pub fn conditional_receiver(ty: Ty) -> Self {
        Self::new(ExprKind::ConditionalReceiver, ty)
    }

    pub fn sequence(locals: Vec<LocalSymbol>, side_effects: Vec<Expr>, value: Expr) -> Self {
        let ty = value.ty.clone();
        Self::new(
            ExprKind::Sequence {
                locals,
                side_effects,
                value: Box::new(value),
            },
            ty,
        )
    }

    pub fn address_of(operand: Expr) -> Self {
        let ty = Ty::pointer_to(operand.ty.clone());
        Self::new(ExprKind::AddressOf(Box::new(operand)), ty)
    }

    pub fn assign(target: Expr, value: Expr) -> Self {
        let ty = target.ty.clone();
        Self::new(
            ExprKind::Assign {
                target: Box::new(target),
                value: Box::new(value),
            },
            ty,
        )
    }

    pub fn compound_assign(op: BinaryOp, target: Expr, value: Expr) -> Self {
        let ty = target.ty.clone();
        Self::new(
            ExprKind::CompoundAssign {
                op,
                target: Box::new(target),
                value: Box::new(value),
            },
            ty,
        )
    }

    pub fn binary(op: BinaryOp, left: Expr, right: Expr) -> Self {
        let ty = if op.is_comparison() || op.is_logical() {
            Ty::Bool
        } else {
            left.ty.clone()
        };
        Self::new(
            ExprKind::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            },
            ty,
        )
    }

    pub fn unary(op: UnaryOp, operand: Expr) -> Self {
        let ty = operand.ty.clone();
        Self::new(
            ExprKind::Unary {
                op,
                operand: Box::new(operand),
            },
            ty,
        )
    }

    pub fn not(operand: Expr) -> Self {
        Self::unary(UnaryOp::Not, operand)
    }

    pub fn conditional(condition: Expr, when_true: Expr, when_false: Expr) -> Self {
        let ty = when_true.ty.clone();
        Self::new(
            ExprKind::Conditional {
                condition: Box::new(condition),
                when_true: Box::new(when_true),
                when_false: Box::new(when_false),
            },
            ty,
        )
    }

    pub fn call(receiver: Option<Expr>, routine: &Arc<RoutineDescriptor>, args: Vec<Expr>) -> Self {
        let ty = routine.return_type.clone();
        Self::new(
            ExprKind::Call {
                receiver: receiver.map(Box::new),
                routine: routine.clone(),
                args,
            },
            ty,
        )
    }

    pub fn new_object(constructor: &Arc<RoutineDescriptor>, args: Vec<Expr>) -> Self {
        let ty = Ty::Named(constructor.containing_type.clone());
        Self::new(
            ExprKind::New {
                constructor: constructor.clone(),
                args,
            },
            ty,
        )
    }

    pub fn new_array(element: Ty, size: Expr) -> Self {
        let ty = Ty::array_of(element.clone());
        Self::new(
            ExprKind::NewArray {
                element,
                size: Box::new(size),
            },
            ty,
        )
    }

    pub fn convert(operand: Expr, conversion: ConversionKind, ty: Ty) -> Self {
        Self::new(
            ExprKind::Convert {
                operand: Box::new(operand),
                conversion,
            },
            ty,
        )
    }

    pub fn default_value(ty: Ty) -> Self {
        Self::new(ExprKind::DefaultValue, ty)
    }

    pub fn lambda(routine: &Arc<RoutineDescriptor>, body: Stmt, delegate_ty: Ty) -> Self {
        Self::new(
            ExprKind::Lambda {
                routine: routine.clone(),
                body: Box::new(body),
            },
            delegate_ty,
        )
    }

    pub fn delegate(routine: &Arc<RoutineDescriptor>, receiver: Option<Expr>, ty: Ty) -> Self {
        Self::new(
            ExprKind::Delegate {
                routine: routine.clone(),
                receiver: receiver.map(Box::new),
            },
            ty,
        )
    }

    pub fn await_(operand: Expr, result: Ty) -> Self {
        Self::new(ExprKind::Await(Box::new(operand)), result)
    }

    pub fn dynamic(member: &str, receiver: Expr, args: Vec<Expr>) -> Self {
        Self::new(
            ExprKind::Dynamic {
                member: Arc::from(member),
                receiver: Box::new(receiver),
                args,
            },
            Ty::Dynamic,
        )
    }

    pub fn error(ty: Ty) -> Self {
        Self::new(ExprKind::Error, ty)
    }

    /// Reading this node twice is indistinguishable from reading it once.
    pub fn is_side_effect_free(&self) -> bool {
        matches!(
            self.kind,
            ExprKind::Literal(_)
                | ExprKind::Local(_)
                | ExprKind::Parameter { .. }
                | ExprKind::This
                | ExprKind::Base
                | ExprKind::DefaultValue
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_marker_is_sticky_upwards() {
        let bad = Expr::error(Ty::Int);
        let sum = Expr::binary(BinaryOp::Add, Expr::int(1), bad);
        assert!(sum.has_errors);
        let call_free = Expr::binary(BinaryOp::Add, Expr::int(1), Expr::int(2));
        assert!(!call_free.has_errors);
    }

    #[test]
    fn inherit_errors_keeps_marker() {
        let original = Expr::int(1).with_errors();
        let replacement = Expr::int(2).inherit_errors(&original);
        assert!(replacement.has_errors);
    }

    #[test]
    fn comparison_is_boolean() {
        let cmp = Expr::binary(BinaryOp::Lt, Expr::int(1), Expr::int(2));
        assert_eq!(cmp.ty, Ty::Bool);
    }
}
