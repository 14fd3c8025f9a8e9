//! Runtime members that lowered code calls into.
//!
//! The backend does not resolve these through the binder: their shapes
//! are fixed and every lowering that needs one builds the same descriptor,
//! so ids agree across threads.

use std::sync::Arc;

use kiln_core::symbols::{Parameter, RoutineDescriptor, RoutineFlags, RoutineKind};
use kiln_core::{NamedType, Ty, TypeKind};

pub const RUNTIME_TYPE: &str = "kiln.Runtime";
pub const ASYNC_BUILDER_TYPE: &str = "kiln.AsyncMethodBuilder";
pub const AWAITER_TYPE: &str = "kiln.Awaiter";
pub const EXCEPTION_TYPE: &str = "kiln.Exception";

fn runtime_type() -> NamedType {
    NamedType::new(RUNTIME_TYPE, TypeKind::Class)
}

fn awaiter_type() -> NamedType {
    NamedType::new(AWAITER_TYPE, TypeKind::Class)
}

pub fn async_builder_type() -> NamedType {
    NamedType::new(ASYNC_BUILDER_TYPE, TypeKind::Class)
}

pub fn exception_type() -> Ty {
    Ty::named(EXCEPTION_TYPE, TypeKind::Class)
}

/// `Runtime.InvokeMember(object receiver, string member, object[] args) -> dynamic`
pub fn invoke_member() -> Arc<RoutineDescriptor> {
    RoutineDescriptor::builder(&runtime_type(), "InvokeMember", RoutineKind::Ordinary)
        .flags(RoutineFlags::STATIC)
        .parameter(Parameter::new("receiver", Ty::Object))
        .parameter(Parameter::new("member", Ty::String))
        .parameter(Parameter::new("args", Ty::array_of(Ty::Object)))
        .returns(Ty::Dynamic)
        .build()
}

/// `AsyncMethodBuilder.Create() -> AsyncMethodBuilder`
pub fn builder_create() -> Arc<RoutineDescriptor> {
    let owner = async_builder_type();
    RoutineDescriptor::builder(&owner, "Create", RoutineKind::Ordinary)
        .flags(RoutineFlags::STATIC)
        .returns(Ty::Named(owner.clone()))
        .build()
}

/// `builder.Start(object stateMachine)`
pub fn builder_start() -> Arc<RoutineDescriptor> {
    RoutineDescriptor::builder(&async_builder_type(), "Start", RoutineKind::Ordinary)
        .parameter(Parameter::new("stateMachine", Ty::Object))
        .build()
}

/// `builder.Task` as seen by the kickoff routine, typed as its return type.
pub fn builder_task(task: &Ty) -> Arc<RoutineDescriptor> {
    RoutineDescriptor::builder(&async_builder_type(), "get_Task", RoutineKind::Ordinary)
        .returns(task.clone())
        .build()
}

/// `builder.SetResult([object result])`
pub fn builder_set_result(has_value: bool) -> Arc<RoutineDescriptor> {
    let builder = RoutineDescriptor::builder(&async_builder_type(), "SetResult", RoutineKind::Ordinary);
    if has_value {
        builder.parameter(Parameter::new("result", Ty::Object)).build()
    } else {
        builder.build()
    }
}

/// `builder.SetException(Exception exception)`
pub fn builder_set_exception() -> Arc<RoutineDescriptor> {
    RoutineDescriptor::builder(&async_builder_type(), "SetException", RoutineKind::Ordinary)
        .parameter(Parameter::new("exception", exception_type()))
        .build()
}

/// `builder.AwaitOnCompleted(object awaitable, object stateMachine)`
pub fn builder_await_on_completed() -> Arc<RoutineDescriptor> {
    RoutineDescriptor::builder(&async_builder_type(), "AwaitOnCompleted", RoutineKind::Ordinary)
        .parameter(Parameter::new("awaitable", Ty::Object))
        .parameter(Parameter::new("stateMachine", Ty::Object))
        .build()
}

/// `Awaiter.IsCompleted(object awaitable) -> bool`
pub fn awaiter_is_completed() -> Arc<RoutineDescriptor> {
    RoutineDescriptor::builder(&awaiter_type(), "IsCompleted", RoutineKind::Ordinary)
        .flags(RoutineFlags::STATIC)
        .parameter(Parameter::new("awaitable", Ty::Object))
        .returns(Ty::Bool)
        .build()
}

/// `Awaiter.GetResult(object awaitable) -> result`
pub fn awaiter_get_result(result: &Ty) -> Arc<RoutineDescriptor> {
    RoutineDescriptor::builder(&awaiter_type(), "GetResult", RoutineKind::Ordinary)
        .flags(RoutineFlags::STATIC)
        .parameter(Parameter::new("awaitable", Ty::Object))
        .returns(result.clone())
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn helpers_are_stable_across_calls() {
        assert_eq!(invoke_member().id, invoke_member().id);
        assert_eq!(
            awaiter_get_result(&Ty::Int).id,
            awaiter_get_result(&Ty::String).id
        );
        assert_ne!(builder_set_result(true).id, builder_set_result(false).id);
    }

    #[test]
    fn static_helpers_take_no_receiver() {
        assert!(invoke_member().is_static());
        assert!(!builder_start().is_static());
        assert_eq!(invoke_member().parameters.len(), 3);
    }
}
