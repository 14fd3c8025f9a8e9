//! Shared fixtures for unit tests in this crate.

use std::sync::Arc;

use kiln_core::bound::{Expr, Stmt};
use kiln_core::symbols::{RoutineDescriptor, TypeDescriptor};
use kiln_core::SymbolId;
use rustc_hash::FxHashMap;

use crate::collaborators::{Binder, BoundBody, BoundInitializers, InMemoryModule};
use crate::env::CompilationEnv;
use crate::options::CompileOptions;

/// Binder answering from a fixed table.
///
/// Routines without an entry bind to an empty block.
#[derive(Default)]
pub struct ScriptedBinder {
    bodies: FxHashMap<SymbolId, BoundBody>,
    statics: FxHashMap<SymbolId, BoundInitializers>,
    instances: FxHashMap<SymbolId, BoundInitializers>,
}

impl ScriptedBinder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn body(mut self, routine: &RoutineDescriptor, body: BoundBody) -> Self {
        self.bodies.insert(routine.id, body);
        self
    }

    pub fn initializers(mut self, ty: &TypeDescriptor, is_static: bool, bound: BoundInitializers) -> Self {
        let table = if is_static {
            &mut self.statics
        } else {
            &mut self.instances
        };
        table.insert(ty.id, bound);
        self
    }
}

impl Binder for ScriptedBinder {
    fn bind(&self, routine: &Arc<RoutineDescriptor>) -> BoundBody {
        self.bodies
            .get(&routine.id)
            .cloned()
            .unwrap_or_else(|| BoundBody::new(Stmt::block(vec![], vec![])))
    }

    fn bind_field_initializers(&self, ty: &TypeDescriptor, is_static: bool) -> BoundInitializers {
        let table = if is_static {
            &self.statics
        } else {
            &self.instances
        };
        table.get(&ty.id).cloned().unwrap_or_default()
    }
}

pub fn create_test_env(binder: ScriptedBinder, module: Option<Arc<InMemoryModule>>) -> CompilationEnv {
    let env = CompilationEnv::new(Arc::new(binder), CompileOptions::sequential());
    match module {
        Some(module) => env.with_module(module),
        None => env,
    }
}

/// `return <int>` body for an `int` routine.
pub fn return_int(value: i64) -> BoundBody {
    BoundBody::new(Stmt::ret(Some(Expr::int(value))))
}
