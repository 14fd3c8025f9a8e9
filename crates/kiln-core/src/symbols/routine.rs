//! Routine descriptors.

use std::sync::Arc;

use bitflags::bitflags;

use super::{Accessibility, FieldDescriptor, RefKind, TypeDescriptor};
use crate::bound::Stmt;
use crate::{NamedType, Span, SymbolId, Ty};

bitflags! {
    /// Declaration modifiers of a routine.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct RoutineFlags: u32 {
        const STATIC = 1 << 0;
        const ABSTRACT = 1 << 1;
        const EXTERN = 1 << 2;
        const VIRTUAL = 1 << 3;
        /// Body produces a sequence through `yield`.
        const GENERATOR = 1 << 4;
        /// Body contains suspension points (`await`).
        const ASYNC = 1 << 5;
        /// Declared by the compiler, with no source syntax.
        const IMPLICIT = 1 << 6;
        /// Extern routine whose implementation is bound by annotation.
        const IMPLEMENTATION_ANNOTATED = 1 << 7;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessorKind {
    Get,
    Set,
}

/// What produced a synthesized routine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SynthesizedKind {
    /// Static constructor created to run static field initializers.
    StaticConstructor,
    /// Body of a converted closure.
    Lambda,
    /// Constructor of a closure capture frame.
    FrameConstructor,
    /// Constructor of a generator or async state machine.
    StateMachineConstructor,
    /// Resumption entry point of a state machine.
    StateMachineMoveNext,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RoutineKind {
    Ordinary,
    Constructor,
    StaticConstructor,
    Accessor(AccessorKind),
    Synthesized(SynthesizedKind),
}

/// A routine parameter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Parameter {
    pub name: Arc<str>,
    pub ty: Ty,
    pub ref_kind: RefKind,
}

impl Parameter {
    pub fn new(name: &str, ty: Ty) -> Self {
        Self {
            name: Arc::from(name),
            ty,
            ref_kind: RefKind::None,
        }
    }

    pub fn by_ref(name: &str, ty: Ty, ref_kind: RefKind) -> Self {
        Self {
            name: Arc::from(name),
            ty,
            ref_kind,
        }
    }
}

/// Immutable identity of a compilable routine.
#[derive(Debug, Clone, PartialEq)]
pub struct RoutineDescriptor {
    pub id: SymbolId,
    pub name: Arc<str>,
    pub kind: RoutineKind,
    pub containing_type: NamedType,
    pub accessibility: Accessibility,
    pub flags: RoutineFlags,
    pub parameters: Vec<Parameter>,
    pub return_type: Ty,
    /// Backing storage of an auto-property accessor.
    pub backing_field: Option<Arc<FieldDescriptor>>,
    /// Body created by the compiler rather than the binder.
    pub synthesized_body: Option<Arc<Stmt>>,
    pub span: Span,
}

impl RoutineDescriptor {
    pub fn builder(owner: &NamedType, name: &str, kind: RoutineKind) -> RoutineBuilder {
        RoutineBuilder::new(owner, name, kind)
    }

    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.containing_type.name, self.name)
    }

    pub fn is_static(&self) -> bool {
        self.flags.contains(RoutineFlags::STATIC) || self.is_static_constructor()
    }

    pub fn is_abstract(&self) -> bool {
        self.flags.contains(RoutineFlags::ABSTRACT)
    }

    pub fn is_extern(&self) -> bool {
        self.flags.contains(RoutineFlags::EXTERN)
    }

    pub fn is_virtual(&self) -> bool {
        self.flags.intersects(RoutineFlags::VIRTUAL | RoutineFlags::ABSTRACT)
    }

    pub fn is_generator(&self) -> bool {
        self.flags.contains(RoutineFlags::GENERATOR)
    }

    pub fn is_async(&self) -> bool {
        self.flags.contains(RoutineFlags::ASYNC)
    }

    pub fn is_implicit(&self) -> bool {
        self.flags.contains(RoutineFlags::IMPLICIT)
    }

    pub fn is_synthesized(&self) -> bool {
        matches!(self.kind, RoutineKind::Synthesized(_))
    }

    /// Instance constructor, declared or synthesized.
    pub fn is_constructor(&self) -> bool {
        matches!(
            self.kind,
            RoutineKind::Constructor
                | RoutineKind::Synthesized(
                    SynthesizedKind::FrameConstructor | SynthesizedKind::StateMachineConstructor
                )
        )
    }

    pub fn is_static_constructor(&self) -> bool {
        matches!(
            self.kind,
            RoutineKind::StaticConstructor
                | RoutineKind::Synthesized(SynthesizedKind::StaticConstructor)
        )
    }

    pub fn is_auto_property_accessor(&self) -> bool {
        matches!(self.kind, RoutineKind::Accessor(_)) && self.backing_field.is_some()
    }

    /// The compiler-provided parameterless constructor of a value type.
    pub fn is_default_value_type_constructor(&self) -> bool {
        self.kind == RoutineKind::Constructor
            && self.is_implicit()
            && self.parameters.is_empty()
            && self.containing_type.is_value_type()
    }

    pub fn returns_void(&self) -> bool {
        self.return_type.is_void()
    }

    /// Number of argument slots taken before the declared parameters.
    pub fn implicit_argument_count(&self) -> u16 {
        if self.is_static() { 0 } else { 1 }
    }

    /// Type of `this` inside the routine.
    pub fn this_type(&self) -> Ty {
        Ty::Named(self.containing_type.clone())
    }

    /// Whether `from` may call this routine.
    pub fn is_accessible_from(&self, from: &TypeDescriptor) -> bool {
        match self.accessibility {
            Accessibility::Public | Accessibility::Internal => true,
            Accessibility::Private => from.id == self.containing_type.id,
            Accessibility::Protected => {
                from.id == self.containing_type.id || from.derives_from(self.containing_type.id)
            }
        }
    }
}

/// Builder for [`RoutineDescriptor`]; the id is fixed when built.
#[derive(Debug, Clone)]
pub struct RoutineBuilder {
    owner: NamedType,
    name: Arc<str>,
    kind: RoutineKind,
    accessibility: Accessibility,
    flags: RoutineFlags,
    parameters: Vec<Parameter>,
    return_type: Ty,
    backing_field: Option<Arc<FieldDescriptor>>,
    synthesized_body: Option<Arc<Stmt>>,
    ordinal: Option<u32>,
    span: Span,
}

impl RoutineBuilder {
    fn new(owner: &NamedType, name: &str, kind: RoutineKind) -> Self {
        Self {
            owner: owner.clone(),
            name: Arc::from(name),
            kind,
            accessibility: Accessibility::Public,
            flags: RoutineFlags::empty(),
            parameters: Vec::new(),
            return_type: Ty::Void,
            backing_field: None,
            synthesized_body: None,
            ordinal: None,
            span: Span::default(),
        }
    }

    pub fn accessibility(mut self, accessibility: Accessibility) -> Self {
        self.accessibility = accessibility;
        self
    }

    pub fn flags(mut self, flags: RoutineFlags) -> Self {
        self.flags |= flags;
        self
    }

    pub fn parameter(mut self, parameter: Parameter) -> Self {
        self.parameters.push(parameter);
        self
    }

    pub fn parameters(mut self, parameters: impl IntoIterator<Item = Parameter>) -> Self {
        self.parameters.extend(parameters);
        self
    }

    pub fn returns(mut self, ty: Ty) -> Self {
        self.return_type = ty;
        self
    }

    pub fn backing_field(mut self, field: Arc<FieldDescriptor>) -> Self {
        self.backing_field = Some(field);
        self
    }

    pub fn synthesized_body(mut self, body: Stmt) -> Self {
        self.synthesized_body = Some(Arc::new(body));
        self
    }

    /// Distinguishes synthesized routines that share a name.
    pub fn ordinal(mut self, ordinal: u32) -> Self {
        self.ordinal = Some(ordinal);
        self
    }

    pub fn span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn build(self) -> Arc<RoutineDescriptor> {
        let id = match self.ordinal {
            Some(ordinal) => SymbolId::for_synthesized(self.owner.id, &self.name, ordinal),
            None => {
                let signature: Vec<SymbolId> =
                    self.parameters.iter().map(|param| param.ty.id()).collect();
                SymbolId::for_routine(self.owner.id, &self.name, &signature)
            }
        };
        Arc::new(RoutineDescriptor {
            id,
            name: self.name,
            kind: self.kind,
            containing_type: self.owner,
            accessibility: self.accessibility,
            flags: self.flags,
            parameters: self.parameters,
            return_type: self.return_type,
            backing_field: self.backing_field,
            synthesized_body: self.synthesized_body,
            span: self.span,
        })
    }
}
