//! Interfaces to the parts of the compiler outside the backend.
//!
//! The backend never binds source or serializes a module itself. It asks a
//! [`Binder`] for bound trees, hands finished bodies to a [`ModuleBuilder`],
//! and, with debug info on, asks a [`DebugInfoProvider`] to turn import
//! chains into namespace scopes.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use kiln_codegen::MethodBody;
use kiln_core::bound::{Expr, Stmt};
use kiln_core::symbols::{RoutineDescriptor, TypeDescriptor};
use kiln_core::{
    DiagnosticBag, ImportChain, ImportScope, NamedType, Span, SymbolId, VariableSlotAllocator,
};
use kiln_lowering::FieldInitializer;
use rustc_hash::FxHashMap;

/// The constructor initializer written (or implied) before a body.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum ConstructorInitializer {
    /// No initializer syntax.
    #[default]
    Implicit,
    /// `: base(args)`
    Base { args: Vec<Expr>, span: Span },
    /// `: this(args)`
    This { args: Vec<Expr>, span: Span },
}

/// A bound routine body.
#[derive(Debug, Clone)]
pub struct BoundBody {
    pub body: Stmt,
    pub diagnostics: DiagnosticBag,
    /// Debug imports in effect for the body.
    pub imports: ImportChain,
    /// Only meaningful for constructors.
    pub initializer: ConstructorInitializer,
}

impl BoundBody {
    pub fn new(body: Stmt) -> Self {
        Self {
            body,
            diagnostics: DiagnosticBag::new(),
            imports: ImportChain::empty(),
            initializer: ConstructorInitializer::Implicit,
        }
    }

    pub fn with_imports(mut self, imports: ImportChain) -> Self {
        self.imports = imports;
        self
    }

    pub fn with_initializer(mut self, initializer: ConstructorInitializer) -> Self {
        self.initializer = initializer;
        self
    }

    pub fn with_diagnostics(mut self, diagnostics: DiagnosticBag) -> Self {
        self.diagnostics = diagnostics;
        self
    }
}

/// The bound field initializers of one type, static or instance.
#[derive(Debug, Clone, Default)]
pub struct BoundInitializers {
    pub initializers: Vec<FieldInitializer>,
    pub diagnostics: DiagnosticBag,
    pub imports: ImportChain,
}

impl BoundInitializers {
    pub fn is_empty(&self) -> bool {
        self.initializers.is_empty()
    }
}

/// Produces bound trees. Called once per source routine.
pub trait Binder: Send + Sync {
    fn bind(&self, routine: &Arc<RoutineDescriptor>) -> BoundBody;

    /// Field initializers of `ty` with the given staticness, in declaration order.
    fn bind_field_initializers(&self, ty: &TypeDescriptor, is_static: bool) -> BoundInitializers;
}

/// Receives finished bodies. Shared by every unit, so it must accept
/// concurrent insertion and key everything by routine identity.
pub trait ModuleBuilder: Send + Sync {
    fn set_body(&self, routine: &RoutineDescriptor, body: MethodBody);

    /// Declare a routine the backend created on `containing_type`.
    fn add_synthesized_definition(
        &self,
        containing_type: &NamedType,
        routine: &Arc<RoutineDescriptor>,
    );

    fn get_method_body(&self, routine: &RoutineDescriptor) -> Option<Arc<MethodBody>>;

    /// An incremental build against a previous generation.
    fn is_patch_build(&self) -> bool {
        false
    }

    /// Slots of `routine` in the previous generation.
    fn slot_allocator(&self, _routine: &RoutineDescriptor) -> Option<Arc<VariableSlotAllocator>> {
        None
    }
}

/// Turns a debug-import chain into the scopes recorded with a body.
pub trait DebugInfoProvider: Send + Sync {
    fn namespace_scopes(&self, imports: &ImportChain) -> Vec<ImportScope>;
}

/// Records every scope of the chain, innermost first.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChainScopes;

impl DebugInfoProvider for ChainScopes {
    fn namespace_scopes(&self, imports: &ImportChain) -> Vec<ImportScope> {
        imports.iter().cloned().collect()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A [`ModuleBuilder`] that keeps everything in memory.
#[derive(Debug, Default)]
pub struct InMemoryModule {
    bodies: Mutex<FxHashMap<SymbolId, Arc<MethodBody>>>,
    synthesized: Mutex<Vec<(NamedType, Arc<RoutineDescriptor>)>>,
    /// Set bodies that replaced an earlier body for the same routine.
    replaced: Mutex<Vec<SymbolId>>,
    previous_generation: Option<FxHashMap<SymbolId, Arc<VariableSlotAllocator>>>,
}

impl InMemoryModule {
    pub fn new() -> Self {
        Self::default()
    }

    /// A patch build whose previous generation had these slot maps.
    pub fn patch(allocators: impl IntoIterator<Item = (SymbolId, VariableSlotAllocator)>) -> Self {
        Self {
            previous_generation: Some(
                allocators
                    .into_iter()
                    .map(|(id, allocator)| (id, Arc::new(allocator)))
                    .collect(),
            ),
            ..Self::default()
        }
    }

    pub fn body(&self, id: SymbolId) -> Option<Arc<MethodBody>> {
        lock(&self.bodies).get(&id).cloned()
    }

    pub fn body_count(&self) -> usize {
        lock(&self.bodies).len()
    }

    /// Ids of every routine with a body, sorted.
    pub fn routine_ids(&self) -> Vec<SymbolId> {
        let mut ids: Vec<_> = lock(&self.bodies).keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn synthesized_definitions(&self) -> Vec<(NamedType, Arc<RoutineDescriptor>)> {
        lock(&self.synthesized).clone()
    }

    /// Routines that were given a body more than once.
    pub fn replaced_bodies(&self) -> Vec<SymbolId> {
        lock(&self.replaced).clone()
    }
}

impl ModuleBuilder for InMemoryModule {
    fn set_body(&self, routine: &RoutineDescriptor, body: MethodBody) {
        if lock(&self.bodies)
            .insert(routine.id, Arc::new(body))
            .is_some()
        {
            lock(&self.replaced).push(routine.id);
        }
    }

    fn add_synthesized_definition(
        &self,
        containing_type: &NamedType,
        routine: &Arc<RoutineDescriptor>,
    ) {
        lock(&self.synthesized).push((containing_type.clone(), routine.clone()));
    }

    fn get_method_body(&self, routine: &RoutineDescriptor) -> Option<Arc<MethodBody>> {
        self.body(routine.id)
    }

    fn is_patch_build(&self) -> bool {
        self.previous_generation.is_some()
    }

    fn slot_allocator(&self, routine: &RoutineDescriptor) -> Option<Arc<VariableSlotAllocator>> {
        self.previous_generation
            .as_ref()
            .and_then(|allocators| allocators.get(&routine.id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_core::symbols::RoutineKind;
    use kiln_core::{Ty, TypeKind};

    fn create_test_body(routine: &RoutineDescriptor) -> MethodBody {
        let mut diagnostics = DiagnosticBag::new();
        kiln_codegen::generate_method_body(
            routine,
            &Stmt::ret(None),
            kiln_codegen::GenerationInput::default(),
            &mut diagnostics,
        )
        .ok()
        .flatten()
        .expect("body")
    }

    #[test]
    fn bodies_are_keyed_by_identity() {
        let owner = NamedType::new("Store", TypeKind::Class);
        let routine = RoutineDescriptor::builder(&owner, "Run", RoutineKind::Ordinary).build();
        let module = InMemoryModule::new();
        assert!(module.get_method_body(&routine).is_none());

        module.set_body(&routine, create_test_body(&routine));
        assert_eq!(module.body_count(), 1);
        assert!(module.get_method_body(&routine).is_some());
        assert!(module.replaced_bodies().is_empty());

        module.set_body(&routine, create_test_body(&routine));
        assert_eq!(module.replaced_bodies(), vec![routine.id]);
    }

    #[test]
    fn patch_module_hands_out_previous_slots() {
        let owner = NamedType::new("Store", TypeKind::Class);
        let routine = RoutineDescriptor::builder(&owner, "Run", RoutineKind::Ordinary).build();
        let allocator = VariableSlotAllocator::new([("count", 0, Ty::Int)]);
        let module = InMemoryModule::patch([(routine.id, allocator)]);

        assert!(module.is_patch_build());
        let slots = module.slot_allocator(&routine).expect("allocator");
        assert_eq!(slots.slot_for("count", &Ty::Int), Some(0));
        assert!(!InMemoryModule::new().is_patch_build());
    }

    #[test]
    fn chain_scopes_lists_innermost_first() {
        let chain = ImportChain::empty()
            .push(ImportScope::usings(["System"]))
            .push(ImportScope::usings(["System.IO"]));
        let scopes = ChainScopes.namespace_scopes(&chain);
        assert_eq!(scopes.len(), 2);
        assert_eq!(scopes[0].usings[0].as_ref(), "System.IO");
    }
}
