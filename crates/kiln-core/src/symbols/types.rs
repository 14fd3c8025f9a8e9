//! Type, namespace and program descriptors.

use std::sync::Arc;

use bitflags::bitflags;

use super::{FieldDescriptor, RoutineDescriptor, RoutineKind};
use crate::{NamedType, Span, SymbolId, Ty, TypeKind};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct TypeFlags: u32 {
        /// Cannot be instantiated; has no instance constructors.
        const STATIC = 1 << 0;
        /// The universal root every class derives from.
        const ROOT = 1 << 1;
        /// A type that failed to resolve.
        const ERROR = 1 << 2;
    }
}

/// A declared (or synthesized) type and its members.
#[derive(Debug, Clone, PartialEq)]
pub struct TypeDescriptor {
    pub id: SymbolId,
    pub name: Arc<str>,
    pub kind: TypeKind,
    pub flags: TypeFlags,
    pub base: Option<Arc<TypeDescriptor>>,
    pub fields: Vec<Arc<FieldDescriptor>>,
    pub routines: Vec<Arc<RoutineDescriptor>>,
    pub nested: Vec<Arc<TypeDescriptor>>,
    pub span: Span,
}

impl TypeDescriptor {
    pub fn new(name: &str, kind: TypeKind) -> Self {
        Self {
            id: SymbolId::for_type(name),
            name: Arc::from(name),
            kind,
            flags: TypeFlags::empty(),
            base: None,
            fields: Vec::new(),
            routines: Vec::new(),
            nested: Vec::new(),
            span: Span::default(),
        }
    }

    /// The universal root type with its public parameterless constructor.
    pub fn root() -> Self {
        let mut root = Self::new("object", TypeKind::Class);
        root.flags |= TypeFlags::ROOT;
        let ctor =
            RoutineDescriptor::builder(&root.named(), ".ctor", RoutineKind::Constructor).build();
        root.routines.push(ctor);
        root
    }

    pub fn with_base(mut self, base: Arc<TypeDescriptor>) -> Self {
        self.base = Some(base);
        self
    }

    pub fn with_flags(mut self, flags: TypeFlags) -> Self {
        self.flags |= flags;
        self
    }

    pub fn with_field(mut self, field: Arc<FieldDescriptor>) -> Self {
        self.fields.push(field);
        self
    }

    pub fn with_routine(mut self, routine: Arc<RoutineDescriptor>) -> Self {
        self.routines.push(routine);
        self
    }

    pub fn with_nested(mut self, nested: Arc<TypeDescriptor>) -> Self {
        self.nested.push(nested);
        self
    }

    pub fn named(&self) -> NamedType {
        NamedType {
            id: self.id,
            name: self.name.clone(),
            kind: self.kind,
        }
    }

    pub fn ty(&self) -> Ty {
        if self.is_root() {
            Ty::Object
        } else {
            Ty::Named(self.named())
        }
    }

    pub fn is_root(&self) -> bool {
        self.flags.contains(TypeFlags::ROOT)
    }

    pub fn is_static(&self) -> bool {
        self.flags.contains(TypeFlags::STATIC)
    }

    pub fn is_error(&self) -> bool {
        self.flags.contains(TypeFlags::ERROR)
    }

    pub fn is_value_type(&self) -> bool {
        matches!(self.kind, TypeKind::Struct | TypeKind::Enum)
    }

    /// Instance constructors declared on this type.
    pub fn constructors(&self) -> impl Iterator<Item = &Arc<RoutineDescriptor>> {
        self.routines
            .iter()
            .filter(|routine| routine.kind == RoutineKind::Constructor)
    }

    pub fn static_constructor(&self) -> Option<&Arc<RoutineDescriptor>> {
        self.routines
            .iter()
            .find(|routine| routine.is_static_constructor())
    }

    /// Whether `ancestor` appears anywhere in this type's base chain.
    pub fn derives_from(&self, ancestor: SymbolId) -> bool {
        let mut current = self.base.as_deref();
        while let Some(base) = current {
            if base.id == ancestor {
                return true;
            }
            current = base.base.as_deref();
        }
        false
    }
}

/// A namespace: a unit the scheduler may compile independently.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct NamespaceDescriptor {
    pub name: Arc<str>,
    pub namespaces: Vec<Arc<NamespaceDescriptor>>,
    pub types: Vec<Arc<TypeDescriptor>>,
}

impl NamespaceDescriptor {
    pub fn new(name: &str) -> Self {
        Self {
            name: Arc::from(name),
            ..Self::default()
        }
    }

    pub fn with_namespace(mut self, namespace: Arc<NamespaceDescriptor>) -> Self {
        self.namespaces.push(namespace);
        self
    }

    pub fn with_type(mut self, ty: Arc<TypeDescriptor>) -> Self {
        self.types.push(ty);
        self
    }
}

/// The whole program handed to the backend.
#[derive(Debug, Clone)]
pub struct Program {
    pub name: Arc<str>,
    pub global: Arc<NamespaceDescriptor>,
    pub root_type: Arc<TypeDescriptor>,
}

impl Program {
    pub fn new(name: &str, global: NamespaceDescriptor, root_type: Arc<TypeDescriptor>) -> Self {
        Self {
            name: Arc::from(name),
            global: Arc::new(global),
            root_type,
        }
    }

    /// Every type in the program, nested types included, in declaration order.
    pub fn all_types(&self) -> Vec<Arc<TypeDescriptor>> {
        fn visit_type(ty: &Arc<TypeDescriptor>, out: &mut Vec<Arc<TypeDescriptor>>) {
            out.push(ty.clone());
            for nested in &ty.nested {
                visit_type(nested, out);
            }
        }
        fn visit_namespace(ns: &NamespaceDescriptor, out: &mut Vec<Arc<TypeDescriptor>>) {
            for ty in &ns.types {
                visit_type(ty, out);
            }
            for child in &ns.namespaces {
                visit_namespace(child, out);
            }
        }

        let mut out = Vec::new();
        visit_namespace(&self.global, &mut out);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbols::Accessibility;

    fn create_test_hierarchy() -> (Arc<TypeDescriptor>, Arc<TypeDescriptor>, TypeDescriptor) {
        let root = Arc::new(TypeDescriptor::root());
        let base = Arc::new(TypeDescriptor::new("Base", TypeKind::Class).with_base(root.clone()));
        let derived = TypeDescriptor::new("Derived", TypeKind::Class).with_base(base.clone());
        (root, base, derived)
    }

    #[test]
    fn base_chain_walk() {
        let (root, base, derived) = create_test_hierarchy();
        assert!(derived.derives_from(base.id));
        assert!(derived.derives_from(root.id));
        assert!(!base.derives_from(derived.id));
    }

    #[test]
    fn root_has_parameterless_constructor() {
        let root = TypeDescriptor::root();
        assert!(root.is_root());
        assert_eq!(root.ty(), Ty::Object);
        let ctor = root.constructors().next().map(|c| c.parameters.len());
        assert_eq!(ctor, Some(0));
    }

    #[test]
    fn protected_members_visible_to_derived_types() {
        let (_, base, derived) = create_test_hierarchy();
        let ctor = RoutineDescriptor::builder(&base.named(), ".ctor", RoutineKind::Constructor)
            .accessibility(Accessibility::Protected)
            .build();
        assert!(ctor.is_accessible_from(&derived));

        let stranger = TypeDescriptor::new("Stranger", TypeKind::Class);
        assert!(!ctor.is_accessible_from(&stranger));
    }

    #[test]
    fn all_types_includes_nested() {
        let inner = Arc::new(TypeDescriptor::new("Outer.Inner", TypeKind::Class));
        let outer = Arc::new(TypeDescriptor::new("Outer", TypeKind::Class).with_nested(inner));
        let ns = NamespaceDescriptor::new("App").with_type(outer);
        let global = NamespaceDescriptor::new("").with_namespace(Arc::new(ns));
        let program = Program::new("test", global, Arc::new(TypeDescriptor::root()));
        let names: Vec<_> = program.all_types().iter().map(|t| t.name.to_string()).collect();
        assert_eq!(names, vec!["Outer", "Outer.Inner"]);
    }
}
