//! Reference-passing tests.
//!
//! Each test compiles a small program that hands a reference to some
//! storage to `Bump(ref int v)` or `Peek(ref int v)` and runs the result
//! on the test machine, checking both the code shape and what the callee
//! actually wrote.


use std::sync::Arc;

use kiln::codegen::OpCode;
use kiln::core::bound::{BinaryOp, Expr, Stmt};
use kiln::core::symbols::{
    FieldDescriptor, FieldFlags, LocalSymbol, Parameter, RefKind, RoutineDescriptor, RoutineFlags,
    RoutineKind, TypeDescriptor,
};
use kiln::core::{ConstantValue, Ty, TypeKind};
use test_harness::{Machine, ProgramBuilder, ScriptedBinder, Value, compile_clean};

struct Cells {
    ty: TypeDescriptor,
    bump: Arc<RoutineDescriptor>,
    peek: Arc<RoutineDescriptor>,
    binder: ScriptedBinder,
}

impl Cells {
    /// A type holding `Bump(ref int v) { v = v + 1; }` and
    /// `Peek(ref int v) { return v; }`.
    fn new() -> Self {
        let ty = TypeDescriptor::new("Cells", TypeKind::Class);
        let bump = RoutineDescriptor::builder(&ty.named(), "Bump", RoutineKind::Ordinary)
            .flags(RoutineFlags::STATIC)
            .parameter(Parameter::by_ref("v", Ty::Int, RefKind::Ref))
            .build();
        let peek = RoutineDescriptor::builder(&ty.named(), "Peek", RoutineKind::Ordinary)
            .flags(RoutineFlags::STATIC)
            .parameter(Parameter::by_ref("v", Ty::Int, RefKind::Ref))
            .returns(Ty::Int)
            .build();

        let v = Expr::parameter(0, &bump.parameters[0]);
        let binder = ScriptedBinder::new()
            .stmt(
                &bump,
                Stmt::expr(Expr::assign(
                    v.clone(),
                    Expr::binary(BinaryOp::Add, v, Expr::int(1)),
                )),
            )
            .stmt(
                &peek,
                Stmt::ret(Some(Expr::parameter(0, &peek.parameters[0]))),
            );
        let ty = ty.with_routine(bump.clone()).with_routine(peek.clone());
        Self {
            ty,
            bump,
            peek,
            binder,
        }
    }

    fn routine(&self, name: &str, parameters: Vec<Parameter>, returns: Ty) -> Arc<RoutineDescriptor> {
        RoutineDescriptor::builder(&self.ty.named(), name, RoutineKind::Ordinary)
            .flags(RoutineFlags::STATIC)
            .parameters(parameters)
            .returns(returns)
            .build()
    }

    fn bump(&self, target: Expr) -> Stmt {
        Stmt::expr(Expr::call(None, &self.bump, vec![target]))
    }

    fn peek(&self, target: Expr) -> Expr {
        Expr::call(None, &self.peek, vec![target])
    }

    fn with(mut self, routine: &Arc<RoutineDescriptor>, body: Stmt) -> Self {
        self.ty = self.ty.with_routine(routine.clone());
        self.binder = self.binder.stmt(routine, body);
        self
    }

    fn with_field(mut self, field: &Arc<FieldDescriptor>) -> Self {
        self.ty = self.ty.with_field(field.clone());
        self
    }

    fn compile(self) -> (Machine, Arc<kiln::compiler::InMemoryModule>) {
        let program = ProgramBuilder::new().ty(Arc::new(self.ty)).build("cells");
        let module = compile_clean(&program, self.binder);
        (Machine::new().with_module(&module), module)
    }
}

fn opcodes_of(module: &kiln::compiler::InMemoryModule, routine: &RoutineDescriptor) -> Vec<OpCode> {
    module.body(routine.id).expect("body").opcodes()
}

#[test]
fn test_parameter_is_passed_by_its_own_address() {
    let cells = Cells::new();
    let run = cells.routine("Run", vec![Parameter::new("p", Ty::Int)], Ty::Int);
    let p = Expr::parameter(0, &run.parameters[0]);
    let body = Stmt::list(vec![cells.bump(p.clone()), Stmt::ret(Some(p))]);
    let (mut machine, module) = cells.with(&run, body).compile();

    assert!(opcodes_of(&module, &run).contains(&OpCode::LoadArgAddr));
    assert_eq!(machine.call(run.id, vec![Value::Int(4)]), Some(Value::Int(5)));
}

#[test]
fn test_local_is_updated_through_reference() {
    let cells = Cells::new();
    let run = cells.routine("Run", vec![], Ty::Int);
    let total = LocalSymbol::user(1, "total", Ty::Int);
    let body = Stmt::block(
        vec![total.clone()],
        vec![
            Stmt::local_declaration(total.clone(), Some(Expr::int(10))),
            cells.bump(Expr::local(&total)),
            cells.bump(Expr::local(&total)),
            Stmt::ret(Some(Expr::local(&total))),
        ],
    );
    let (mut machine, module) = cells.with(&run, body).compile();

    assert!(opcodes_of(&module, &run).contains(&OpCode::LoadLocalAddr));
    assert_eq!(machine.call(run.id, vec![]), Some(Value::Int(12)));
}

#[test]
fn test_array_element_is_addressed_in_place() {
    let cells = Cells::new();
    let run = cells.routine("Run", vec![], Ty::Int);
    let items = LocalSymbol::user(1, "items", Ty::array_of(Ty::Int));
    let element = || Expr::element(Expr::local(&items), vec![Expr::int(1)]);
    let body = Stmt::block(
        vec![items.clone()],
        vec![
            Stmt::local_declaration(
                items.clone(),
                Some(Expr::new_array(Ty::Int, Expr::int(3))),
            ),
            cells.bump(element()),
            cells.bump(element()),
            Stmt::ret(Some(element())),
        ],
    );
    let (mut machine, module) = cells.with(&run, body).compile();

    assert!(opcodes_of(&module, &run).contains(&OpCode::LoadElemAddr));
    assert_eq!(machine.call(run.id, vec![]), Some(Value::Int(2)));
}

#[test]
fn test_dereferenced_address_reaches_the_original_local() {
    let cells = Cells::new();
    let run = cells.routine("Run", vec![], Ty::Int);
    let value = LocalSymbol::user(1, "value", Ty::Int);
    let body = Stmt::block(
        vec![value.clone()],
        vec![
            Stmt::local_declaration(value.clone(), Some(Expr::int(7))),
            cells.bump(Expr::deref(Expr::address_of(Expr::local(&value)))),
            Stmt::ret(Some(Expr::local(&value))),
        ],
    );
    let (mut machine, _) = cells.with(&run, body).compile();

    assert_eq!(machine.call(run.id, vec![]), Some(Value::Int(8)));
}

#[test]
fn test_field_through_this_is_addressed_directly() {
    let cells = Cells::new();
    let count = Arc::new(FieldDescriptor::new(&cells.ty.named(), "count", Ty::Int));
    let touch = RoutineDescriptor::builder(&cells.ty.named(), "Touch", RoutineKind::Ordinary).build();
    let this_count = || Expr::field(Some(Expr::this(cells.ty.ty())), &count);
    let body = Stmt::list(vec![
        Stmt::expr(Expr::assign(this_count(), Expr::int(41))),
        cells.bump(this_count()),
    ]);
    let (mut machine, module) = cells.with_field(&count).with(&touch, body).compile();

    let opcodes = opcodes_of(&module, &touch);
    assert!(opcodes.contains(&OpCode::LoadFieldAddr));
    assert!(!opcodes.contains(&OpCode::StoreLocal));

    let node = machine.new_object();
    machine.call(touch.id, vec![node.clone()]);
    assert_eq!(machine.field(&node, count.id), Value::Int(42));
}

#[test]
fn test_computed_value_is_cloned_into_a_temp() {
    let cells = Cells::new();
    let run = cells.routine("Run", vec![Parameter::new("p", Ty::Int)], Ty::Int);
    let p = Expr::parameter(0, &run.parameters[0]);
    let body = Stmt::list(vec![
        cells.bump(Expr::binary(BinaryOp::Add, p.clone(), Expr::int(1))),
        Stmt::ret(Some(p)),
    ]);
    let (mut machine, module) = cells.with(&run, body).compile();

    let opcodes = opcodes_of(&module, &run);
    assert!(opcodes.contains(&OpCode::StoreLocal));
    assert!(opcodes.contains(&OpCode::LoadLocalAddr));
    // The callee wrote to the temporary, never to `p`.
    assert_eq!(machine.call(run.id, vec![Value::Int(3)]), Some(Value::Int(3)));
}

#[test]
fn test_side_effect_of_cloned_value_runs_exactly_once() {
    let cells = Cells::new();
    let counter = Arc::new(
        FieldDescriptor::new(&cells.ty.named(), "counter", Ty::Int).with_flags(FieldFlags::STATIC),
    );
    let run = cells.routine("Run", vec![], Ty::Int);
    let counter_expr = || Expr::field(None, &counter);
    let increment = Expr::assign(
        counter_expr(),
        Expr::binary(BinaryOp::Add, counter_expr(), Expr::int(1)),
    );
    let body = Stmt::list(vec![
        cells.bump(Expr::deref(Expr::address_of(increment))),
        Stmt::ret(Some(counter_expr())),
    ]);
    let (mut machine, _) = cells.with_field(&counter).with(&run, body).compile();

    machine.set_static(counter.id, Value::Int(0));
    assert_eq!(machine.call(run.id, vec![]), Some(Value::Int(1)));
    assert_eq!(machine.static_value(counter.id), Value::Int(1));
}

#[test]
fn test_constant_field_reference_gets_a_temporary() {
    let cells = Cells::new();
    let limit = Arc::new(
        FieldDescriptor::new(&cells.ty.named(), "Limit", Ty::Int)
            .with_flags(FieldFlags::STATIC | FieldFlags::CONST)
            .with_constant(ConstantValue::Int(5)),
    );
    let run = cells.routine("Run", vec![], Ty::Int);
    let body = Stmt::list(vec![
        cells.bump(Expr::field(None, &limit)),
        Stmt::ret(Some(Expr::field(None, &limit))),
    ]);
    let (mut machine, module) = cells.with_field(&limit).with(&run, body).compile();

    let opcodes = opcodes_of(&module, &run);
    assert!(opcodes.contains(&OpCode::LoadLocalAddr));
    assert!(!opcodes.contains(&OpCode::LoadStaticAddr));
    assert!(!opcodes.contains(&OpCode::LoadFieldAddr));
    assert_eq!(machine.call(run.id, vec![]), Some(Value::Int(5)));
}

#[test]
fn test_static_field_is_addressed_directly() {
    let cells = Cells::new();
    let total = Arc::new(
        FieldDescriptor::new(&cells.ty.named(), "total", Ty::Int).with_flags(FieldFlags::STATIC),
    );
    let run = cells.routine("Run", vec![], Ty::Void);
    let body = cells.bump(Expr::field(None, &total));
    let (mut machine, module) = cells.with_field(&total).with(&run, body).compile();

    let opcodes = opcodes_of(&module, &run);
    assert!(opcodes.contains(&OpCode::LoadStaticAddr));
    assert!(!opcodes.contains(&OpCode::LoadLocalAddr));

    machine.set_static(total.id, Value::Int(3));
    machine.call(run.id, vec![]);
    assert_eq!(machine.static_value(total.id), Value::Int(4));
}

#[test]
fn test_sequence_value_stays_alive_while_referenced() {
    let cells = Cells::new();
    let run = cells.routine("Run", vec![], Ty::Int);
    let outer = LocalSymbol::synthesized("outer", Ty::Int);
    let inner = LocalSymbol::synthesized("inner", Ty::Int);
    let nested = Expr::sequence(
        vec![inner.clone()],
        vec![Expr::assign(
            Expr::local(&inner),
            Expr::binary(BinaryOp::Add, Expr::local(&outer), Expr::int(1)),
        )],
        Expr::local(&inner),
    );
    let sequence = Expr::sequence(
        vec![outer.clone()],
        vec![Expr::assign(Expr::local(&outer), Expr::int(7))],
        nested,
    );
    let body = Stmt::ret(Some(cells.peek(sequence)));
    let (mut machine, _) = cells.with(&run, body).compile();

    assert_eq!(machine.call(run.id, vec![]), Some(Value::Int(8)));
}
