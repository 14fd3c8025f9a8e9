//! Expression emission.

use std::sync::Arc;

use kiln_core::bound::{BinaryOp, ConversionKind, Expr, ExprKind, UnaryOp};
use kiln_core::symbols::{FieldDescriptor, RefKind, RoutineDescriptor};
use kiln_core::{InternalFault, SymbolId, Ty};

use super::address::AddressKind;
use super::{CodeGenerator, Result};
use crate::locals::TempHandle;
use crate::OpCode;

/// Where an assignment stores its value once the prefix has been pushed.
enum StoreTarget {
    Local(u16),
    Argument(u16),
    Static(SymbolId),
    /// Stack-only local: the value simply stays on the stack.
    Stack,
    Field(SymbolId),
    Element(u8),
    Indirect,
}

impl StoreTarget {
    /// Targets with nothing pushed ahead of the value.
    fn has_no_prefix(&self) -> bool {
        matches!(
            self,
            StoreTarget::Local(_) | StoreTarget::Argument(_) | StoreTarget::Static(_) | StoreTarget::Stack
        )
    }
}

impl CodeGenerator<'_> {
    /// Emit `expr`. When `used` is false nothing is left on the stack.
    pub(crate) fn emit_expr(&mut self, expr: &Expr, used: bool) -> Result<()> {
        match &expr.kind {
            ExprKind::Assign { target, value } => self.emit_assignment(target, value, used),
            ExprKind::Call {
                receiver,
                routine,
                args,
            } => self.emit_call(receiver.as_deref(), routine, args, used),
            ExprKind::Sequence {
                locals,
                side_effects,
                value,
            } => {
                for local in locals {
                    self.locals.declare(local);
                }
                for effect in side_effects {
                    self.emit_expr(effect, false)?;
                }
                self.emit_expr(value, used)?;
                for local in locals {
                    self.locals.free_local(local.id);
                }
                Ok(())
            }
            _ if !used && expr.is_side_effect_free() => Ok(()),
            _ => {
                self.emit_value(expr)?;
                if !used {
                    self.builder.emit(OpCode::Pop);
                }
                Ok(())
            }
        }
    }

    /// Push the value of `expr`.
    fn emit_value(&mut self, expr: &Expr) -> Result<()> {
        match &expr.kind {
            ExprKind::Literal(value) => {
                self.builder.emit_constant(value);
            }

            ExprKind::Local(local) => {
                if !local.stack_only {
                    let slot = self.locals.declare(local);
                    self.builder.emit_u16(OpCode::LoadLocal, slot);
                    if local.ref_kind.is_by_ref() {
                        self.builder.emit(OpCode::LoadIndirect);
                    }
                }
            }

            ExprKind::Parameter { index, param } => {
                let slot = self.argument_slot(*index);
                self.builder.emit_u16(OpCode::LoadArg, slot);
                if param.ref_kind.is_by_ref() {
                    self.builder.emit(OpCode::LoadIndirect);
                }
            }

            ExprKind::This | ExprKind::Base => {
                self.builder.emit_u16(OpCode::LoadArg, 0);
                if self.routine.containing_type.is_value_type() {
                    self.builder.emit(OpCode::LoadIndirect);
                }
            }

            ExprKind::Field {
                receiver, field, ..
            } => self.emit_field_load(receiver.as_deref(), field)?,

            ExprKind::Element { array, indices } => {
                self.emit_expr(array, true)?;
                for index in indices {
                    self.emit_expr(index, true)?;
                }
                self.builder
                    .emit_element(OpCode::LoadElem, indices.len() as u8);
            }

            ExprKind::Deref(pointer) => {
                self.emit_expr(pointer, true)?;
                self.builder.emit(OpCode::LoadIndirect);
            }

            ExprKind::RefValue(operand) => {
                self.emit_expr(operand, true)?;
                self.builder.emit_type_op(OpCode::RefAnyVal, &expr.ty);
                self.builder.emit(OpCode::LoadIndirect);
            }

            ExprKind::Dup(_) => self.builder.emit(OpCode::Dup),

            // Already on the stack, placed there by the conditional access.
            ExprKind::ConditionalReceiver => {}

            ExprKind::AddressOf(operand) => {
                if let Some(temp) = self.emit_address(operand, AddressKind::Writable)? {
                    self.statement_temps.push(temp);
                }
            }

            ExprKind::Binary { op, left, right } => self.emit_binary(*op, left, right)?,

            ExprKind::Unary { op, operand } => {
                self.emit_expr(operand, true)?;
                self.builder.emit(match op {
                    UnaryOp::Neg => OpCode::Neg,
                    UnaryOp::Not => OpCode::Not,
                });
            }

            ExprKind::Conditional {
                condition,
                when_true,
                when_false,
            } => {
                let otherwise = self.builder.define_label();
                let done = self.builder.define_label();
                self.emit_expr(condition, true)?;
                self.builder.emit_branch(OpCode::BrFalse, otherwise);
                self.emit_expr(when_true, true)?;
                self.builder.emit_branch(OpCode::Br, done);
                self.builder.mark_label(otherwise);
                self.emit_expr(when_false, true)?;
                self.builder.mark_label(done);
            }

            ExprKind::New { constructor, args } => {
                let temps = self.emit_arguments(constructor, args)?;
                self.builder
                    .emit_routine_call(OpCode::NewObj, constructor.id, args.len() as u8, true);
                self.release(temps);
            }

            ExprKind::NewArray { element, size } => {
                self.emit_expr(size, true)?;
                self.builder.emit_type_op(OpCode::NewArray, element);
            }

            ExprKind::Convert {
                operand,
                conversion,
            } => {
                self.emit_expr(operand, true)?;
                match conversion {
                    ConversionKind::Box => self.builder.emit_type_op(OpCode::Box, &operand.ty),
                    ConversionKind::Unbox => {
                        self.builder.emit_type_op(OpCode::Unbox, &expr.ty);
                        self.builder.emit(OpCode::LoadIndirect);
                    }
                    ConversionKind::Numeric => self.builder.emit_type_op(OpCode::Convert, &expr.ty),
                    ConversionKind::Reference => {
                        self.builder.emit_type_op(OpCode::CastClass, &expr.ty)
                    }
                }
            }

            ExprKind::DefaultValue => self.emit_default(&expr.ty),

            ExprKind::Delegate { routine, receiver } => {
                match receiver {
                    Some(receiver) if !routine.is_static() => self.emit_expr(receiver, true)?,
                    _ => self.builder.emit(OpCode::PushNull),
                }
                self.builder.emit_make_delegate(routine.id);
            }

            ExprKind::Assign { .. } | ExprKind::Call { .. } | ExprKind::Sequence { .. } => {
                self.emit_expr(expr, true)?;
            }

            ExprKind::CompoundAssign { .. } => return Err(unlowered("compound assignment", expr)),
            ExprKind::Lambda { .. } => return Err(unlowered("lambda", expr)),
            ExprKind::Await(_) => return Err(unlowered("await", expr)),
            ExprKind::Dynamic { .. } => return Err(unlowered("dynamic operation", expr)),
            ExprKind::Error => return Err(unlowered("error node", expr)),
        }
        Ok(())
    }

    pub(crate) fn emit_default(&mut self, ty: &Ty) {
        if ty.is_verifier_reference() {
            self.builder.emit(OpCode::PushNull);
        } else {
            self.builder.emit_type_op(OpCode::LoadDefault, ty);
        }
    }

    fn emit_field_load(&mut self, receiver: Option<&Expr>, field: &Arc<FieldDescriptor>) -> Result<()> {
        if let Some(value) = field.constant.as_ref().filter(|_| field.is_const()) {
            self.builder.emit_constant(value);
            return Ok(());
        }
        if field.is_static() {
            self.builder.emit_field_op(OpCode::LoadStatic, field.id);
            return Ok(());
        }

        let temp = match receiver {
            None => {
                self.builder.emit_u16(OpCode::LoadArg, 0);
                None
            }
            // Read a value-type receiver in place rather than copying it.
            Some(receiver)
                if receiver.ty.is_value_type() && self.has_home(receiver, AddressKind::ReadOnly) =>
            {
                self.emit_address(receiver, AddressKind::ReadOnly)?
            }
            Some(receiver) => {
                self.emit_expr(receiver, true)?;
                None
            }
        };
        self.builder.emit_field_op(OpCode::LoadField, field.id);
        self.free_optional_temp(temp);
        Ok(())
    }

    fn emit_binary(&mut self, op: BinaryOp, left: &Expr, right: &Expr) -> Result<()> {
        let (opcode, negate) = match op {
            BinaryOp::Add => (OpCode::Add, false),
            BinaryOp::Sub => (OpCode::Sub, false),
            BinaryOp::Mul => (OpCode::Mul, false),
            BinaryOp::Div => (OpCode::Div, false),
            BinaryOp::Rem => (OpCode::Rem, false),
            BinaryOp::BitAnd => (OpCode::And, false),
            BinaryOp::BitOr => (OpCode::Or, false),
            BinaryOp::Eq => (OpCode::Ceq, false),
            BinaryOp::Ne => (OpCode::Ceq, true),
            BinaryOp::Lt => (OpCode::Clt, false),
            BinaryOp::Ge => (OpCode::Clt, true),
            BinaryOp::Gt => (OpCode::Cgt, false),
            BinaryOp::Le => (OpCode::Cgt, true),
            BinaryOp::LogicalAnd => return self.emit_short_circuit(left, right, true),
            BinaryOp::LogicalOr => return self.emit_short_circuit(left, right, false),
        };
        self.emit_expr(left, true)?;
        self.emit_expr(right, true)?;
        self.builder.emit(opcode);
        if negate {
            self.builder.emit(OpCode::Not);
        }
        Ok(())
    }

    /// `a && b` is `a ? b : false`; `a || b` is `a ? true : b`.
    fn emit_short_circuit(&mut self, left: &Expr, right: &Expr, is_and: bool) -> Result<()> {
        let short = self.builder.define_label();
        let done = self.builder.define_label();
        self.emit_expr(left, true)?;
        let (branch, short_value) = if is_and {
            (OpCode::BrFalse, OpCode::PushFalse)
        } else {
            (OpCode::BrTrue, OpCode::PushTrue)
        };
        self.builder.emit_branch(branch, short);
        self.emit_expr(right, true)?;
        self.builder.emit_branch(OpCode::Br, done);
        self.builder.mark_label(short);
        self.builder.emit(short_value);
        self.builder.mark_label(done);
        Ok(())
    }

    // =========================================================================
    // Assignment
    // =========================================================================

    fn emit_assignment(&mut self, target: &Expr, value: &Expr, used: bool) -> Result<()> {
        let (store, temp) = self.emit_store_prefix(target)?;
        self.emit_expr(value, true)?;

        let result = if used {
            self.builder.emit(OpCode::Dup);
            if store.has_no_prefix() {
                None
            } else {
                // The copy has to sit below the prefix, so park it.
                let result = self.locals.allocate_temp(&value.ty);
                self.builder.emit_u16(OpCode::StoreLocal, result.slot);
                Some(result)
            }
        } else {
            None
        };

        match store {
            StoreTarget::Local(slot) => self.builder.emit_u16(OpCode::StoreLocal, slot),
            StoreTarget::Argument(slot) => self.builder.emit_u16(OpCode::StoreArg, slot),
            StoreTarget::Static(id) => self.builder.emit_field_op(OpCode::StoreStatic, id),
            StoreTarget::Stack => {}
            StoreTarget::Field(id) => self.builder.emit_field_op(OpCode::StoreField, id),
            StoreTarget::Element(rank) => self.builder.emit_element(OpCode::StoreElem, rank),
            StoreTarget::Indirect => self.builder.emit(OpCode::StoreIndirect),
        }

        if let Some(result) = result {
            self.builder.emit_u16(OpCode::LoadLocal, result.slot);
            self.locals.free_temp(result);
        }
        self.free_optional_temp(temp);
        Ok(())
    }

    /// Push whatever has to precede the value in a store to `target`.
    fn emit_store_prefix(&mut self, target: &Expr) -> Result<(StoreTarget, Option<TempHandle>)> {
        let store = match &target.kind {
            ExprKind::Local(local) if local.stack_only => StoreTarget::Stack,
            ExprKind::Local(local) if local.ref_kind.is_by_ref() => {
                let slot = self.locals.declare(local);
                self.builder.emit_u16(OpCode::LoadLocal, slot);
                StoreTarget::Indirect
            }
            ExprKind::Local(local) => StoreTarget::Local(self.locals.declare(local)),

            ExprKind::Parameter { index, param } if param.ref_kind.is_by_ref() => {
                let slot = self.argument_slot(*index);
                self.builder.emit_u16(OpCode::LoadArg, slot);
                StoreTarget::Indirect
            }
            ExprKind::Parameter { index, .. } => StoreTarget::Argument(self.argument_slot(*index)),

            ExprKind::Field {
                receiver, field, ..
            } => {
                if field.is_static() {
                    StoreTarget::Static(field.id)
                } else {
                    let temp = match receiver.as_deref() {
                        Some(receiver) => self.emit_receiver_ref(receiver, AddressKind::Writable)?,
                        None => {
                            self.builder.emit_u16(OpCode::LoadArg, 0);
                            None
                        }
                    };
                    return Ok((StoreTarget::Field(field.id), temp));
                }
            }

            ExprKind::Element { array, indices } => {
                self.emit_expr(array, true)?;
                for index in indices {
                    self.emit_expr(index, true)?;
                }
                StoreTarget::Element(indices.len() as u8)
            }

            ExprKind::This
            | ExprKind::Deref(_)
            | ExprKind::RefValue(_)
            | ExprKind::Dup(RefKind::Ref | RefKind::Out) => {
                let temp = self.emit_address(target, AddressKind::Writable)?;
                return Ok((StoreTarget::Indirect, temp));
            }

            _ => return Err(unlowered("assignment target", target)),
        };
        Ok((store, None))
    }

    // =========================================================================
    // Calls
    // =========================================================================

    fn emit_call(
        &mut self,
        receiver: Option<&Expr>,
        routine: &Arc<RoutineDescriptor>,
        args: &[Expr],
        used: bool,
    ) -> Result<()> {
        let mut temps = Vec::new();
        let mut op = OpCode::Call;
        let mut constrained: Option<Ty> = None;

        if !routine.is_static() {
            match receiver {
                Some(receiver) => {
                    let ty = &receiver.ty;
                    let constrain = routine.is_virtual()
                        && ty.is_type_parameter()
                        && !ty.is_verifier_reference();
                    let kind = if constrain {
                        AddressKind::Constrained
                    } else {
                        AddressKind::Writable
                    };
                    temps.extend(self.emit_receiver_ref(receiver, kind)?);
                    if constrain {
                        constrained = Some(ty.clone());
                        op = OpCode::CallVirt;
                    } else if routine.is_virtual() && !ty.is_value_type() {
                        op = OpCode::CallVirt;
                    }
                }
                None => {
                    self.builder.emit_u16(OpCode::LoadArg, 0);
                    if routine.is_virtual() {
                        op = OpCode::CallVirt;
                    }
                }
            }
        }

        temps.extend(self.emit_arguments(routine, args)?);

        if let Some(ty) = &constrained {
            self.builder.emit_type_op(OpCode::Constrained, ty);
        }
        let argc = args.len() + usize::from(!routine.is_static());
        let returns = !routine.returns_void();
        self.builder
            .emit_routine_call(op, routine.id, argc as u8, returns);

        self.release(temps);
        if returns && !used {
            self.builder.emit(OpCode::Pop);
        }
        Ok(())
    }

    /// Push call arguments; by-reference parameters receive addresses.
    fn emit_arguments(&mut self, routine: &RoutineDescriptor, args: &[Expr]) -> Result<Vec<TempHandle>> {
        let mut temps = Vec::new();
        for (index, arg) in args.iter().enumerate() {
            let ref_kind = routine
                .parameters
                .get(index)
                .map_or(RefKind::None, |p| p.ref_kind);
            match ref_kind {
                RefKind::None => self.emit_expr(arg, true)?,
                RefKind::In => temps.extend(self.emit_address(arg, AddressKind::ReadOnly)?),
                RefKind::Ref | RefKind::Out => {
                    temps.extend(self.emit_address(arg, AddressKind::Writable)?)
                }
            }
        }
        Ok(temps)
    }

    fn release(&mut self, temps: Vec<TempHandle>) {
        for temp in temps {
            self.locals.free_temp(temp);
        }
    }
}

fn unlowered(node: &'static str, expr: &Expr) -> InternalFault {
    InternalFault::UnloweredNode {
        node,
        span: expr.span,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generator::CodeGenOptions;
    use kiln_core::bound::Stmt;
    use kiln_core::symbols::{LocalSymbol, Parameter, RoutineFlags, RoutineKind};
    use kiln_core::{NamedType, TypeKind};

    fn create_test_routine() -> Arc<RoutineDescriptor> {
        let owner = NamedType::new("Calc", TypeKind::Class);
        RoutineDescriptor::builder(&owner, "Run", RoutineKind::Ordinary)
            .flags(RoutineFlags::STATIC)
            .build()
    }

    fn generate(body: Stmt) -> crate::stream::InstructionStream {
        let routine = create_test_routine();
        let generated = CodeGenerator::new(&routine, None, CodeGenOptions::default())
            .generate(&body)
            .unwrap();
        let mut stream = crate::stream::InstructionStream::new();
        for byte in generated.code.code {
            stream.write_u8(byte);
        }
        stream
    }

    #[test]
    fn unused_assignment_does_not_duplicate() {
        let x = LocalSymbol::user(1, "x", Ty::Int);
        let body = Stmt::expr(Expr::assign(Expr::local(&x), Expr::int(5)));
        generate(body).assert_opcodes(&[OpCode::LoadConst, OpCode::StoreLocal, OpCode::Ret]);
    }

    #[test]
    fn used_element_assignment_parks_value() {
        let arr = LocalSymbol::user(1, "arr", Ty::array_of(Ty::Int));
        let x = LocalSymbol::user(2, "x", Ty::Int);
        let store = Expr::assign(
            Expr::element(Expr::local(&arr), vec![Expr::int(0)]),
            Expr::int(7),
        );
        let body = Stmt::expr(Expr::assign(Expr::local(&x), store));
        generate(body).assert_opcodes(&[
            OpCode::LoadLocal,
            OpCode::PushZero,
            OpCode::LoadConst,
            OpCode::Dup,
            OpCode::StoreLocal,
            OpCode::StoreElem,
            OpCode::LoadLocal,
            OpCode::StoreLocal,
            OpCode::Ret,
        ]);
    }

    #[test]
    fn by_ref_argument_of_computed_value_uses_temp() {
        let owner = NamedType::new("Calc", TypeKind::Class);
        let callee = RoutineDescriptor::builder(&owner, "Bump", RoutineKind::Ordinary)
            .flags(RoutineFlags::STATIC)
            .parameter(Parameter::by_ref("v", Ty::Int, RefKind::Ref))
            .build();
        let arg = Expr::binary(BinaryOp::Add, Expr::int(2), Expr::int(3));
        let body = Stmt::expr(Expr::call(None, &callee, vec![arg]));
        generate(body).assert_opcodes(&[
            OpCode::LoadConst,
            OpCode::LoadConst,
            OpCode::Add,
            OpCode::StoreLocal,
            OpCode::LoadLocalAddr,
            OpCode::Call,
            OpCode::Ret,
        ]);
    }

    #[test]
    fn unlowered_nodes_are_faults() {
        let body = Stmt::expr(Expr::await_(Expr::int(1), Ty::Int));
        let routine = create_test_routine();
        let err = CodeGenerator::new(&routine, None, CodeGenOptions::default())
            .generate(&body)
            .err();
        assert!(matches!(
            err,
            Some(InternalFault::UnloweredNode { node: "await", .. })
        ));
    }

    #[test]
    fn logical_and_short_circuits() {
        let flag = LocalSymbol::user(1, "flag", Ty::Bool);
        let both = Expr::binary(
            BinaryOp::LogicalAnd,
            Expr::local(&flag),
            Expr::boolean(true),
        );
        let body = Stmt::expr(Expr::assign(Expr::local(&flag), both));
        generate(body).assert_opcodes(&[
            OpCode::LoadLocal,
            OpCode::BrFalse,
            OpCode::PushTrue,
            OpCode::Br,
            OpCode::PushFalse,
            OpCode::StoreLocal,
            OpCode::Ret,
        ]);
    }
}
