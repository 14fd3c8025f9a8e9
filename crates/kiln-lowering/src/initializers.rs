//! Field initializers as constructor statements.

use std::sync::Arc;

use kiln_core::Ty;
use kiln_core::bound::{Expr, Stmt};
use kiln_core::symbols::FieldDescriptor;

/// `field = value` as bound from a field declaration.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldInitializer {
    pub field: Arc<FieldDescriptor>,
    pub value: Expr,
}

impl FieldInitializer {
    pub fn new(field: Arc<FieldDescriptor>, value: Expr) -> Self {
        Self { field, value }
    }
}

/// One assignment statement per initializer, in declaration order.
///
/// Constants are skipped: their value lives in the field metadata. Instance
/// fields are assigned through `this`, typed as `this_ty`.
pub fn lower_field_initializers(initializers: &[FieldInitializer], this_ty: &Ty) -> Stmt {
    let statements = initializers
        .iter()
        .filter(|init| !init.field.is_const())
        .map(|init| {
            let receiver = (!init.field.is_static()).then(|| Expr::this(this_ty.clone()));
            let target = Expr::field(receiver, &init.field).at(init.field.span);
            let span = init.value.span;
            Stmt::expr(Expr::assign(target, init.value.clone()).at(span)).at(span)
        })
        .collect();
    Stmt::list(statements)
}
