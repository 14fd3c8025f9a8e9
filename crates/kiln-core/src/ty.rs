//! Type shapes as seen by lowering and code generation.
//!
//! The backend does not own a type system; it only needs to know enough
//! about a type to pick an instruction: whether values of it live by
//! reference or by value, whether it is a generic parameter, and what its
//! element type is. [`Ty`] is exactly that projection.

use std::fmt;
use std::sync::Arc;

use crate::SymbolId;

/// Declaration kind of a named type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeKind {
    Class,
    Struct,
    Interface,
    Delegate,
    Enum,
}

/// A reference to a declared type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NamedType {
    pub id: SymbolId,
    pub name: Arc<str>,
    pub kind: TypeKind,
}

impl NamedType {
    /// Create a named type; the id is derived from the qualified name.
    pub fn new(name: &str, kind: TypeKind) -> Self {
        Self {
            id: SymbolId::for_type(name),
            name: Arc::from(name),
            kind,
        }
    }

    pub fn is_value_type(&self) -> bool {
        matches!(self.kind, TypeKind::Struct | TypeKind::Enum)
    }
}

/// Constraint carried by a generic type parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ParamConstraint {
    /// Unconstrained: the argument may be a value or a reference type.
    #[default]
    None,
    /// Known to be instantiated with reference types.
    ReferenceType,
    /// Known to be instantiated with value types.
    ValueType,
}

/// A generic type parameter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TypeParam {
    pub id: SymbolId,
    pub name: Arc<str>,
    pub constraint: ParamConstraint,
}

/// The shape of a value's type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum Ty {
    #[default]
    Void,
    Bool,
    Int,
    Float,
    String,
    /// The universal root type.
    Object,
    Dynamic,
    TypedReference,
    Named(NamedType),
    Param(TypeParam),
    Array(Arc<Ty>),
    Pointer(Arc<Ty>),
    /// Type of a node that failed to bind.
    Error,
}

impl Ty {
    pub fn named(name: &str, kind: TypeKind) -> Self {
        Ty::Named(NamedType::new(name, kind))
    }

    pub fn param(name: &str, constraint: ParamConstraint) -> Self {
        Ty::Param(TypeParam {
            id: SymbolId::for_type(name),
            name: Arc::from(name),
            constraint,
        })
    }

    pub fn array_of(element: Ty) -> Self {
        Ty::Array(Arc::new(element))
    }

    pub fn pointer_to(pointee: Ty) -> Self {
        Ty::Pointer(Arc::new(pointee))
    }

    pub fn is_void(&self) -> bool {
        matches!(self, Ty::Void)
    }

    /// Values of this type are object references the verifier can track:
    /// they are pushed as-is when used as a receiver.
    pub fn is_verifier_reference(&self) -> bool {
        match self {
            Ty::String | Ty::Object | Ty::Dynamic | Ty::Array(_) => true,
            Ty::Named(named) => !named.is_value_type(),
            Ty::Param(param) => param.constraint == ParamConstraint::ReferenceType,
            _ => false,
        }
    }

    pub fn is_value_type(&self) -> bool {
        match self {
            Ty::Bool | Ty::Int | Ty::Float | Ty::TypedReference | Ty::Pointer(_) => true,
            Ty::Named(named) => named.is_value_type(),
            Ty::Param(param) => param.constraint == ParamConstraint::ValueType,
            _ => false,
        }
    }

    pub fn is_type_parameter(&self) -> bool {
        matches!(self, Ty::Param(_))
    }

    /// Element type of an array or pointee of a pointer.
    pub fn element(&self) -> Option<&Ty> {
        match self {
            Ty::Array(element) | Ty::Pointer(element) => Some(element),
            _ => None,
        }
    }

    /// Stable identity of this type, used when hashing routine signatures.
    pub fn id(&self) -> SymbolId {
        match self {
            Ty::Named(named) => named.id,
            Ty::Param(param) => param.id,
            other => SymbolId::for_type(&other.to_string()),
        }
    }
}

impl fmt::Display for Ty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Ty::Void => f.write_str("void"),
            Ty::Bool => f.write_str("bool"),
            Ty::Int => f.write_str("int"),
            Ty::Float => f.write_str("float"),
            Ty::String => f.write_str("string"),
            Ty::Object => f.write_str("object"),
            Ty::Dynamic => f.write_str("dynamic"),
            Ty::TypedReference => f.write_str("typedref"),
            Ty::Named(named) => f.write_str(&named.name),
            Ty::Param(param) => f.write_str(&param.name),
            Ty::Array(element) => write!(f, "{element}[]"),
            Ty::Pointer(pointee) => write!(f, "{pointee}*"),
            Ty::Error => f.write_str("?"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reference_and_value_classification() {
        assert!(Ty::String.is_verifier_reference());
        assert!(Ty::named("Shape", TypeKind::Class).is_verifier_reference());
        assert!(Ty::named("Point", TypeKind::Struct).is_value_type());
        assert!(!Ty::named("Point", TypeKind::Struct).is_verifier_reference());
        assert!(Ty::array_of(Ty::Int).is_verifier_reference());
    }

    #[test]
    fn unconstrained_parameter_is_neither() {
        let t = Ty::param("T", ParamConstraint::None);
        assert!(t.is_type_parameter());
        assert!(!t.is_verifier_reference());
        assert!(!t.is_value_type());

        let r = Ty::param("R", ParamConstraint::ReferenceType);
        assert!(r.is_verifier_reference());
    }

    #[test]
    fn display_nests() {
        assert_eq!(Ty::array_of(Ty::pointer_to(Ty::Int)).to_string(), "int*[]");
    }
}
