//! Small constructors for the nodes lowering synthesizes.

use std::sync::Arc;

use kiln_core::bound::{BinaryOp, ConversionKind, Expr, Stmt};
use kiln_core::symbols::{FieldDescriptor, LabelId, LocalSymbol};
use kiln_core::Ty;

pub(crate) fn assign(target: Expr, value: Expr) -> Stmt {
    Stmt::expr(Expr::assign(target, value))
}

pub(crate) fn assign_local(local: &LocalSymbol, value: Expr) -> Stmt {
    assign(Expr::local(local), value)
}

/// `this.field` inside a routine of `owner`.
pub(crate) fn this_field(owner: &Ty, field: &Arc<FieldDescriptor>) -> Expr {
    Expr::field(Some(Expr::this(owner.clone())), field)
}

pub(crate) fn local_field(local: &LocalSymbol, field: &Arc<FieldDescriptor>) -> Expr {
    Expr::field(Some(Expr::local(local)), field)
}

pub(crate) fn equals(left: Expr, right: Expr) -> Expr {
    Expr::binary(BinaryOp::Eq, left, right)
}

/// `if (condition == jump_if) goto label`
pub(crate) fn goto_if(condition: Expr, jump_if: bool, label: LabelId) -> Stmt {
    Stmt::conditional_goto(condition, jump_if, label)
}

/// Convert an `object` to `ty`, unboxing value types.
pub(crate) fn from_object(value: Expr, ty: &Ty) -> Expr {
    if value.ty == *ty {
        return value;
    }
    let conversion = if ty.is_value_type() {
        ConversionKind::Unbox
    } else {
        ConversionKind::Reference
    };
    Expr::convert(value, conversion, ty.clone())
}

/// Convert a value to `object`, boxing value types.
pub(crate) fn to_object(value: Expr) -> Expr {
    if value.ty.is_value_type() || value.ty.is_type_parameter() {
        Expr::convert(value, ConversionKind::Box, Ty::Object)
    } else {
        value
    }
}

/// Wrap statements in a block that owns `locals`, or a plain list when
/// there are none.
pub(crate) fn scoped(locals: Vec<LocalSymbol>, statements: Vec<Stmt>) -> Stmt {
    if locals.is_empty() {
        Stmt::list(statements)
    } else {
        Stmt::block(locals, statements)
    }
}
