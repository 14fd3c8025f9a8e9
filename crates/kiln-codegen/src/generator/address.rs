//! Address (home) resolution.
//!
//! Given an expression and what the caller intends to do with the
//! reference, decide how to push a reference to the value's storage. When
//! the value has no storage ("no home"), evaluate it once into a fresh
//! temporary and push the temporary's address instead.
//!
//! ```text
//! parameter / element / this / deref / refvalue   -> direct
//! local                                           -> direct, unless stack-only
//! dup marker                                      -> direct if it is a reference
//! conditional-access placeholder                  -> already on the stack
//! field                                           -> static addr, or receiver + field addr,
//!                                                    or temp clone when it has no home
//! value sequence                                  -> address of the trailing value,
//!                                                    keeping an aliased scope local alive
//! anything else                                   -> temp clone
//! ```
//!
//! Every `emit_*address*` function returns the temporary it allocated, if
//! any. The caller owns that temporary and must release it once the
//! reference is no longer needed.

use std::sync::Arc;

use kiln_core::bound::{Expr, ExprKind};
use kiln_core::symbols::{FieldDescriptor, LocalSymbol, Parameter, RefKind};
use kiln_core::{InternalFault, ParamConstraint, Ty};

use super::{CodeGenerator, Result};
use crate::locals::TempHandle;
use crate::OpCode;

/// What the caller will do with the pushed reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressKind {
    /// May write through the reference.
    Writable,
    /// Receiver of a constrained virtual call; never written through.
    Constrained,
    /// Only reads through the reference.
    ReadOnly,
}

impl CodeGenerator<'_> {
    /// Push a reference to `expr`'s storage.
    #[cfg_attr(feature = "profiling", profiling::function)]
    pub(crate) fn emit_address(&mut self, expr: &Expr, kind: AddressKind) -> Result<Option<TempHandle>> {
        match &expr.kind {
            ExprKind::RefValue(operand) => {
                self.emit_expr(operand, true)?;
                self.builder.emit_type_op(OpCode::RefAnyVal, &expr.ty);
                Ok(None)
            }

            ExprKind::Local(local) => {
                self.emit_local_address(local, expr)?;
                Ok(None)
            }

            ExprKind::Dup(ref_kind) => {
                if !ref_kind.is_by_ref() {
                    return Err(InternalFault::NotAReference { span: expr.span });
                }
                self.builder.emit(OpCode::Dup);
                Ok(None)
            }

            ExprKind::Parameter { index, param } => {
                self.emit_parameter_address(*index, param);
                Ok(None)
            }

            ExprKind::Element { array, indices } => {
                self.emit_element_address(expr, array, indices, kind)?;
                Ok(None)
            }

            ExprKind::This | ExprKind::Base => {
                self.builder.emit_u16(OpCode::LoadArg, 0);
                Ok(None)
            }

            // Pushed by the conditional access, already boxed.
            ExprKind::ConditionalReceiver => Ok(None),

            ExprKind::Field {
                receiver, field, ..
            } => {
                if !self.has_home(expr, kind) {
                    return self.emit_address_of_temp_clone(expr);
                }
                self.emit_field_address(receiver.as_deref(), field, kind)
            }

            ExprKind::Sequence {
                locals,
                side_effects,
                value,
            } => self.emit_sequence_address(locals, side_effects, value, kind),

            ExprKind::Deref(pointer) => {
                self.emit_expr(pointer, true)?;
                Ok(None)
            }

            _ => self.emit_address_of_temp_clone(expr),
        }
    }

    /// Whether `expr` denotes storage that may be referenced for `kind`.
    pub(crate) fn has_home(&self, expr: &Expr, kind: AddressKind) -> bool {
        match &expr.kind {
            ExprKind::This
            | ExprKind::Base
            | ExprKind::Parameter { .. }
            | ExprKind::Element { .. }
            | ExprKind::Deref(_)
            | ExprKind::RefValue(_)
            | ExprKind::ConditionalReceiver => true,
            ExprKind::Local(local) => !local.stack_only || local.ref_kind.is_by_ref(),
            ExprKind::Dup(ref_kind) => ref_kind.is_by_ref(),
            ExprKind::Field {
                receiver,
                field,
                by_value,
            } => !by_value && self.field_has_home(receiver.as_deref(), field, kind),
            ExprKind::Sequence { value, .. } => self.has_home(value, kind),
            _ => false,
        }
    }

    fn field_has_home(
        &self,
        receiver: Option<&Expr>,
        field: &FieldDescriptor,
        kind: AddressKind,
    ) -> bool {
        if field.is_const() {
            return false;
        }

        if field.is_readonly() {
            // Addressable only while the declaring type is being
            // constructed, and an instance field only through `this`.
            let in_own_constructor = field.containing_type.id == self.routine.containing_type.id
                && if field.is_static() {
                    self.routine.is_static_constructor()
                } else {
                    self.routine.is_constructor()
                };
            if !in_own_constructor {
                return false;
            }
            if !field.is_static() && !matches!(receiver.map(|r| &r.kind), None | Some(ExprKind::This)) {
                return false;
            }
        }

        if field.is_static() {
            return true;
        }

        match receiver {
            None => true,
            Some(receiver) if receiver.ty.is_value_type() => self.has_home(receiver, kind),
            Some(_) => true,
        }
    }

    fn emit_local_address(&mut self, local: &LocalSymbol, expr: &Expr) -> Result<()> {
        if local.stack_only {
            if !local.ref_kind.is_by_ref() {
                return Err(InternalFault::NoHome {
                    name: local.name.to_string(),
                    span: expr.span,
                });
            }
            // The reference itself is already on the stack.
            return Ok(());
        }
        let slot = self.locals.declare(local);
        if local.ref_kind.is_by_ref() {
            self.builder.emit_u16(OpCode::LoadLocal, slot);
        } else {
            self.builder.emit_u16(OpCode::LoadLocalAddr, slot);
        }
        Ok(())
    }

    fn emit_parameter_address(&mut self, index: u16, param: &Parameter) {
        let slot = self.argument_slot(index);
        if param.ref_kind.is_by_ref() {
            self.builder.emit_u16(OpCode::LoadArg, slot);
        } else {
            self.builder.emit_u16(OpCode::LoadArgAddr, slot);
        }
    }

    fn emit_element_address(
        &mut self,
        expr: &Expr,
        array: &Expr,
        indices: &[Expr],
        kind: AddressKind,
    ) -> Result<()> {
        self.emit_expr(array, true)?;
        for index in indices {
            self.emit_expr(index, true)?;
        }
        // Elements of covariant reference arrays would need a type check
        // before handing out a writable reference; read-only skips it.
        if kind == AddressKind::ReadOnly && !expr.ty.is_value_type() {
            self.builder.emit(OpCode::ReadOnly);
        }
        self.builder
            .emit_element(OpCode::LoadElemAddr, indices.len() as u8);
        Ok(())
    }

    fn emit_field_address(
        &mut self,
        receiver: Option<&Expr>,
        field: &Arc<FieldDescriptor>,
        kind: AddressKind,
    ) -> Result<Option<TempHandle>> {
        if field.is_static() {
            self.builder.emit_field_op(OpCode::LoadStaticAddr, field.id);
            return Ok(None);
        }

        let temp = match receiver {
            Some(receiver) => self.emit_receiver_ref(receiver, kind)?,
            None => {
                self.builder.emit_u16(OpCode::LoadArg, 0);
                None
            }
        };
        self.builder.emit_field_op(OpCode::LoadFieldAddr, field.id);
        if let Some(element) = &field.fixed_element {
            self.builder.emit_field_op(OpCode::LoadFieldAddr, element.id);
        }
        Ok(temp)
    }

    /// Push the receiver of a member access.
    ///
    /// Reference-typed receivers are pushed by value. Unconstrained type
    /// parameters either get a read-only address (constrained dispatch) or
    /// are boxed. Everything else is addressed.
    pub(crate) fn emit_receiver_ref(
        &mut self,
        receiver: &Expr,
        kind: AddressKind,
    ) -> Result<Option<TempHandle>> {
        let ty = &receiver.ty;
        if ty.is_verifier_reference() {
            self.emit_expr(receiver, true)?;
            return Ok(None);
        }

        if is_unconstrained_type_parameter(ty) {
            if kind == AddressKind::Constrained {
                return self.emit_address(receiver, kind);
            }
            self.emit_expr(receiver, true)?;
            // The conditional-access placeholder is always boxed already.
            if !matches!(receiver.kind, ExprKind::ConditionalReceiver) {
                self.builder.emit_type_op(OpCode::Box, ty);
            }
            return Ok(None);
        }

        self.emit_address(receiver, kind)
    }

    fn emit_sequence_address(
        &mut self,
        locals: &[LocalSymbol],
        side_effects: &[Expr],
        value: &Expr,
        kind: AddressKind,
    ) -> Result<Option<TempHandle>> {
        let scoped = !locals.is_empty();
        if scoped {
            self.builder.open_scope();
        }
        for local in locals {
            self.locals.declare(local);
        }
        for effect in side_effects {
            self.emit_expr(effect, false)?;
        }

        let temp = self.emit_address(value, kind)?;

        let kept = match &temp {
            None => dig_for_local(value, locals),
            Some(_) => None,
        };
        if scoped {
            let variables = self.scope_variables(locals);
            self.builder.close_scope(variables);
        }

        let mut result = temp;
        for local in locals {
            if kept.is_some_and(|k| k.id == local.id) {
                result = self.locals.detach(local.id);
            } else {
                self.locals.free_local(local.id);
            }
        }
        Ok(result)
    }

    /// Evaluate `expr` once into a new temporary and push its address.
    fn emit_address_of_temp_clone(&mut self, expr: &Expr) -> Result<Option<TempHandle>> {
        self.emit_expr(expr, true)?;
        let temp = self.locals.allocate_temp(&expr.ty);
        self.builder.emit_u16(OpCode::StoreLocal, temp.slot);
        self.builder.emit_u16(OpCode::LoadLocalAddr, temp.slot);
        Ok(Some(temp))
    }
}

fn is_unconstrained_type_parameter(ty: &Ty) -> bool {
    matches!(ty, Ty::Param(p) if p.constraint != ParamConstraint::ReferenceType)
}

/// Find the scope local whose storage an address of `value` refers to.
fn dig_for_local<'l>(value: &Expr, locals: &'l [LocalSymbol]) -> Option<&'l LocalSymbol> {
    match &value.kind {
        ExprKind::Local(local) if local.ref_kind == RefKind::None => {
            locals.iter().find(|l| l.id == local.id)
        }
        ExprKind::Sequence { value, .. } => dig_for_local(value, locals),
        ExprKind::Field {
            receiver: Some(receiver),
            field,
            ..
        } if !field.is_static() && receiver.ty.is_value_type() => dig_for_local(receiver, locals),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generator::CodeGenOptions;
    use crate::stream::assert_opcodes;
    use kiln_core::symbols::{FieldFlags, RoutineDescriptor, RoutineFlags, RoutineKind};
    use kiln_core::{ConstantValue, NamedType, Span, TypeKind};

    fn create_test_routine(kind: RoutineKind) -> Arc<RoutineDescriptor> {
        let owner = NamedType::new("Widget", TypeKind::Class);
        RoutineDescriptor::builder(&owner, "Run", kind).build()
    }

    fn create_test_field(flags: FieldFlags) -> Arc<FieldDescriptor> {
        let owner = NamedType::new("Widget", TypeKind::Class);
        Arc::new(FieldDescriptor::new(&owner, "size", Ty::Int).with_flags(flags))
    }

    fn widget_this() -> Expr {
        Expr::this(Ty::named("Widget", TypeKind::Class))
    }

    fn type_param() -> Ty {
        Ty::param("T", ParamConstraint::None)
    }

    fn emitted(generator: CodeGenerator<'_>) -> Vec<u8> {
        generator.builder.finish().unwrap().code
    }

    #[test]
    fn constant_field_has_no_home() {
        let routine = create_test_routine(RoutineKind::Ordinary);
        let owner = NamedType::new("Widget", TypeKind::Class);
        let field = Arc::new(
            FieldDescriptor::new(&owner, "Max", Ty::Int).with_constant(ConstantValue::Int(9)),
        );
        let generator = CodeGenerator::new(&routine, None, CodeGenOptions::default());
        let access = Expr::field(None, &field);
        assert!(!generator.has_home(&access, AddressKind::Writable));
        assert!(!generator.has_home(&access, AddressKind::ReadOnly));
    }

    #[test]
    fn readonly_field_is_addressable_only_in_own_constructor() {
        let field = create_test_field(FieldFlags::READONLY);
        let access = Expr::field(Some(widget_this()), &field);

        let method = create_test_routine(RoutineKind::Ordinary);
        let generator = CodeGenerator::new(&method, None, CodeGenOptions::default());
        for kind in [AddressKind::Writable, AddressKind::Constrained, AddressKind::ReadOnly] {
            assert!(!generator.has_home(&access, kind), "{kind:?}");
        }

        let ctor = create_test_routine(RoutineKind::Constructor);
        let generator = CodeGenerator::new(&ctor, None, CodeGenOptions::default());
        for kind in [AddressKind::Writable, AddressKind::Constrained, AddressKind::ReadOnly] {
            assert!(generator.has_home(&access, kind), "{kind:?}");
        }
    }

    #[test]
    fn readonly_field_of_another_instance_has_no_home_in_constructor() {
        let field = create_test_field(FieldFlags::READONLY);
        let other = LocalSymbol::user(1, "other", Ty::named("Widget", TypeKind::Class));
        let access = Expr::field(Some(Expr::local(&other)), &field);

        let ctor = create_test_routine(RoutineKind::Constructor);
        let generator = CodeGenerator::new(&ctor, None, CodeGenOptions::default());
        assert!(!generator.has_home(&access, AddressKind::ReadOnly));
    }

    fn constrained_call_on_readonly_item(kind: RoutineKind) -> Vec<u8> {
        let owner = NamedType::new("Widget", TypeKind::Class);
        let item = Arc::new(
            FieldDescriptor::new(&owner, "item", type_param()).with_flags(FieldFlags::READONLY),
        );
        let base = NamedType::new("Object", TypeKind::Class);
        let describe = RoutineDescriptor::builder(&base, "Describe", RoutineKind::Ordinary)
            .flags(RoutineFlags::VIRTUAL)
            .returns(Ty::String)
            .build();
        let call = Expr::call(Some(Expr::field(Some(widget_this()), &item)), &describe, vec![]);

        let routine = create_test_routine(kind);
        let mut generator = CodeGenerator::new(&routine, None, CodeGenOptions::default());
        generator.emit_expr(&call, false).unwrap();
        emitted(generator)
    }

    #[test]
    fn constrained_call_on_readonly_field_goes_through_a_copy() {
        assert_opcodes(
            &constrained_call_on_readonly_item(RoutineKind::Ordinary),
            &[
                OpCode::LoadArg,
                OpCode::LoadField,
                OpCode::StoreLocal,
                OpCode::LoadLocalAddr,
                OpCode::Constrained,
                OpCode::CallVirt,
                OpCode::Pop,
            ],
        );
    }

    #[test]
    fn constrained_call_on_readonly_field_in_constructor_is_direct() {
        assert_opcodes(
            &constrained_call_on_readonly_item(RoutineKind::Constructor),
            &[
                OpCode::LoadArg,
                OpCode::LoadFieldAddr,
                OpCode::Constrained,
                OpCode::CallVirt,
                OpCode::Pop,
            ],
        );
    }

    #[test]
    fn conditional_receiver_is_already_on_the_stack() {
        let routine = create_test_routine(RoutineKind::Ordinary);
        let mut generator = CodeGenerator::new(&routine, None, CodeGenOptions::default());
        let placeholder = Expr::conditional_receiver(type_param());
        assert!(generator.has_home(&placeholder, AddressKind::ReadOnly));

        let temp = generator
            .emit_address(&placeholder, AddressKind::ReadOnly)
            .unwrap();
        assert!(temp.is_none());
        assert_eq!(generator.locals.count(), 0);
        assert!(emitted(generator).is_empty());
    }

    #[test]
    fn unconstrained_receiver_is_boxed_for_ordinary_access() {
        let routine = create_test_routine(RoutineKind::Ordinary);
        let mut generator = CodeGenerator::new(&routine, None, CodeGenOptions::default());
        let value = LocalSymbol::user(1, "value", type_param());
        let temp = generator
            .emit_receiver_ref(&Expr::local(&value), AddressKind::Writable)
            .unwrap();
        assert!(temp.is_none());
        assert_opcodes(&emitted(generator), &[OpCode::LoadLocal, OpCode::Box]);
    }

    #[test]
    fn unconstrained_receiver_is_addressed_for_constrained_dispatch() {
        let routine = create_test_routine(RoutineKind::Ordinary);
        let mut generator = CodeGenerator::new(&routine, None, CodeGenOptions::default());
        let value = LocalSymbol::user(1, "value", type_param());
        let temp = generator
            .emit_receiver_ref(&Expr::local(&value), AddressKind::Constrained)
            .unwrap();
        assert!(temp.is_none());
        assert_opcodes(&emitted(generator), &[OpCode::LoadLocalAddr]);
    }

    #[test]
    fn conditional_receiver_is_not_boxed_twice() {
        let routine = create_test_routine(RoutineKind::Ordinary);
        let mut generator = CodeGenerator::new(&routine, None, CodeGenOptions::default());
        let temp = generator
            .emit_receiver_ref(&Expr::conditional_receiver(type_param()), AddressKind::Writable)
            .unwrap();
        assert!(temp.is_none());
        assert!(emitted(generator).is_empty());
    }

    #[test]
    fn fixed_buffer_field_redirects_to_its_element() {
        let owner = NamedType::new("Widget", TypeKind::Class);
        let buffer_ty = NamedType::new("Widget.DataBuffer", TypeKind::Struct);
        let element = Arc::new(FieldDescriptor::new(&buffer_ty, "FixedElementField", Ty::Int));
        let buffer = Arc::new(
            FieldDescriptor::new(&owner, "data", Ty::named("Widget.DataBuffer", TypeKind::Struct))
                .with_fixed_element(element),
        );

        let routine = create_test_routine(RoutineKind::Ordinary);
        let mut generator = CodeGenerator::new(&routine, None, CodeGenOptions::default());
        let access = Expr::field(Some(widget_this()), &buffer);
        assert!(generator.emit_address(&access, AddressKind::Writable).unwrap().is_none());
        assert_opcodes(
            &emitted(generator),
            &[OpCode::LoadArg, OpCode::LoadFieldAddr, OpCode::LoadFieldAddr],
        );
    }

    #[test]
    fn typed_reference_value_is_addressed_in_place() {
        let routine = create_test_routine(RoutineKind::Ordinary);
        let mut generator = CodeGenerator::new(&routine, None, CodeGenOptions::default());
        let reference = LocalSymbol::user(1, "reference", Ty::TypedReference);
        let value = Expr::ref_value(Expr::local(&reference), Ty::Int);
        assert!(generator.emit_address(&value, AddressKind::Writable).unwrap().is_none());
        assert_opcodes(&emitted(generator), &[OpCode::LoadLocal, OpCode::RefAnyVal]);
    }

    #[test]
    fn deref_address_is_the_pointer_itself() {
        let routine = create_test_routine(RoutineKind::Ordinary);
        let mut generator = CodeGenerator::new(&routine, None, CodeGenOptions::default());
        let pointer = LocalSymbol::user(1, "pointer", Ty::pointer_to(Ty::Int));
        let target = Expr::deref(Expr::local(&pointer));
        assert!(generator.emit_address(&target, AddressKind::Writable).unwrap().is_none());
        assert_opcodes(&emitted(generator), &[OpCode::LoadLocal]);
    }

    fn element_address(kind: AddressKind) -> Vec<u8> {
        let routine = create_test_routine(RoutineKind::Ordinary);
        let mut generator = CodeGenerator::new(&routine, None, CodeGenOptions::default());
        let items = LocalSymbol::user(1, "items", Ty::array_of(type_param()));
        let element = Expr::element(Expr::local(&items), vec![Expr::int(0)]);
        assert!(generator.emit_address(&element, kind).unwrap().is_none());
        emitted(generator)
    }

    #[test]
    fn read_only_element_of_reference_array_skips_type_check() {
        assert_opcodes(
            &element_address(AddressKind::ReadOnly),
            &[OpCode::LoadLocal, OpCode::PushZero, OpCode::ReadOnly, OpCode::LoadElemAddr],
        );
    }

    #[test]
    fn constrained_element_address_is_not_read_only() {
        assert_opcodes(
            &element_address(AddressKind::Constrained),
            &[OpCode::LoadLocal, OpCode::PushZero, OpCode::LoadElemAddr],
        );
    }

    fn sequence_scopes(locals: Vec<LocalSymbol>) -> usize {
        let routine = create_test_routine(RoutineKind::Ordinary);
        let options = CodeGenOptions {
            debug_info: true,
            ..CodeGenOptions::default()
        };
        let mut generator = CodeGenerator::new(&routine, None, options);
        let target = LocalSymbol::user(7, "target", Ty::Int);
        let sequence = Expr::sequence(
            locals,
            vec![Expr::assign(Expr::local(&target), Expr::int(1))],
            Expr::local(&target),
        );
        assert!(generator.emit_address(&sequence, AddressKind::Writable).unwrap().is_none());
        generator.builder.finish().unwrap().debug_scopes.len()
    }

    #[test]
    fn sequence_without_locals_opens_no_debug_scope() {
        assert_eq!(sequence_scopes(vec![]), 0);
        assert_eq!(sequence_scopes(vec![LocalSymbol::synthesized("unused", Ty::Int)]), 1);
    }

    #[test]
    fn stack_only_local_without_reference_is_a_fault() {
        let routine = create_test_routine(RoutineKind::Ordinary);
        let mut generator = CodeGenerator::new(&routine, None, CodeGenOptions::default());
        let local = LocalSymbol::user(1, "spill", Ty::Int).on_stack();
        let err = generator
            .emit_address(&Expr::local(&local).at(Span::new(4, 2, 5)), AddressKind::Writable)
            .unwrap_err();
        assert_eq!(
            err,
            InternalFault::NoHome {
                name: "spill".into(),
                span: Span::new(4, 2, 5)
            }
        );
    }

    #[test]
    fn value_duplicate_is_not_a_reference() {
        let routine = create_test_routine(RoutineKind::Ordinary);
        let mut generator = CodeGenerator::new(&routine, None, CodeGenOptions::default());
        let dup = Expr::dup(RefKind::None, Ty::Int);
        assert!(matches!(
            generator.emit_address(&dup, AddressKind::ReadOnly),
            Err(InternalFault::NotAReference { .. })
        ));
    }

    #[test]
    fn computed_value_is_cloned_into_a_temp() {
        let routine = create_test_routine(RoutineKind::Ordinary);
        let mut generator = CodeGenerator::new(&routine, None, CodeGenOptions::default());
        let sum = Expr::binary(kiln_core::bound::BinaryOp::Add, Expr::int(2), Expr::int(3));
        let temp = generator
            .emit_address(&sum, AddressKind::Writable)
            .unwrap()
            .expect("temp");
        assert_eq!(temp.ty, Ty::Int);
        assert!(!generator.locals.is_free(temp.slot));
    }

    #[test]
    fn sequence_keeps_aliased_local_alive() {
        let routine = create_test_routine(RoutineKind::Ordinary);
        let mut generator = CodeGenerator::new(&routine, None, CodeGenOptions::default());
        let kept = LocalSymbol::synthesized("kept", Ty::Int);
        let scratch = LocalSymbol::synthesized("scratch", Ty::Int);
        let sequence = Expr::sequence(
            vec![kept.clone(), scratch.clone()],
            vec![
                Expr::assign(Expr::local(&scratch), Expr::int(1)),
                Expr::assign(Expr::local(&kept), Expr::int(2)),
            ],
            Expr::local(&kept),
        );
        let temp = generator
            .emit_address(&sequence, AddressKind::Writable)
            .unwrap()
            .expect("aliased local is handed back");
        let scratch_slot = 1;
        assert_eq!(temp.slot, 0);
        assert!(generator.locals.is_free(scratch_slot));
        assert!(!generator.locals.is_free(temp.slot));
        assert_eq!(generator.locals.slot_of(kept.id), None);
    }
}
