//! Symbol descriptors supplied by the front end.
//!
//! Descriptors are immutable once built and shared behind `Arc`; the
//! backend reads them from many threads and never mutates them.

mod field;
mod local;
mod routine;
mod types;

pub use field::{FieldDescriptor, FieldFlags};
pub use local::{LabelId, LocalId, LocalKind, LocalSymbol};
pub use routine::{
    AccessorKind, Parameter, RoutineBuilder, RoutineDescriptor, RoutineFlags, RoutineKind,
    SynthesizedKind,
};
pub use types::{NamespaceDescriptor, Program, TypeDescriptor, TypeFlags};

/// Declared accessibility of a member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Accessibility {
    #[default]
    Public,
    Internal,
    Protected,
    Private,
}

/// How a parameter or local refers to its value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum RefKind {
    /// Holds the value itself.
    #[default]
    None,
    /// Holds a writable reference.
    Ref,
    /// Holds a read-only reference.
    In,
    /// Holds a reference that must be assigned before return.
    Out,
}

impl RefKind {
    #[inline]
    pub fn is_by_ref(self) -> bool {
        self != RefKind::None
    }
}
