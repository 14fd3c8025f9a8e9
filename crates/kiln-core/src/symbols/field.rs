use std::sync::Arc;

use bitflags::bitflags;

use crate::{ConstantValue, NamedType, Span, SymbolId, Ty};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct FieldFlags: u32 {
        const STATIC = 1 << 0;
        /// Assignable only inside the declaring type's constructors.
        const READONLY = 1 << 1;
        /// Compile-time constant; has no storage.
        const CONST = 1 << 2;
        /// Fixed-size inline buffer backed by a single element field.
        const FIXED_BUFFER = 1 << 3;
    }
}

/// A field of a declared or synthesized type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FieldDescriptor {
    pub id: SymbolId,
    pub name: Arc<str>,
    pub containing_type: NamedType,
    pub ty: Ty,
    pub flags: FieldFlags,
    pub constant: Option<ConstantValue>,
    /// The element field a fixed buffer's address resolves to.
    pub fixed_element: Option<Arc<FieldDescriptor>>,
    pub span: Span,
}

impl FieldDescriptor {
    pub fn new(owner: &NamedType, name: &str, ty: Ty) -> Self {
        Self {
            id: SymbolId::for_field(owner.id, name),
            name: Arc::from(name),
            containing_type: owner.clone(),
            ty,
            flags: FieldFlags::empty(),
            constant: None,
            fixed_element: None,
            span: Span::default(),
        }
    }

    pub fn with_flags(mut self, flags: FieldFlags) -> Self {
        self.flags |= flags;
        self
    }

    pub fn with_constant(mut self, value: ConstantValue) -> Self {
        self.flags |= FieldFlags::CONST | FieldFlags::STATIC;
        self.constant = Some(value);
        self
    }

    pub fn with_fixed_element(mut self, element: Arc<FieldDescriptor>) -> Self {
        self.flags |= FieldFlags::FIXED_BUFFER;
        self.fixed_element = Some(element);
        self
    }

    pub fn at(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn is_static(&self) -> bool {
        self.flags.contains(FieldFlags::STATIC)
    }

    pub fn is_readonly(&self) -> bool {
        self.flags.contains(FieldFlags::READONLY)
    }

    pub fn is_const(&self) -> bool {
        self.flags.contains(FieldFlags::CONST)
    }

    pub fn is_fixed_buffer(&self) -> bool {
        self.flags.contains(FieldFlags::FIXED_BUFFER)
    }
}
