//! Compile-time constant values.

use std::fmt;
use std::sync::Arc;

use ordered_float::OrderedFloat;

use crate::Ty;

/// A constant carried by a literal node or a `const` field.
///
/// Floats are wrapped in [`OrderedFloat`] so constants can key the
/// per-body token table.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ConstantValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(OrderedFloat<f64>),
    Str(Arc<str>),
    /// A constant whose evaluation failed; reported by the front end.
    Bad,
}

impl ConstantValue {
    pub fn float(value: f64) -> Self {
        ConstantValue::Float(OrderedFloat(value))
    }

    pub fn string(value: &str) -> Self {
        ConstantValue::Str(Arc::from(value))
    }

    pub fn is_bad(&self) -> bool {
        matches!(self, ConstantValue::Bad)
    }

    /// The natural type of this constant.
    pub fn ty(&self) -> Ty {
        match self {
            ConstantValue::Null => Ty::Object,
            ConstantValue::Bool(_) => Ty::Bool,
            ConstantValue::Int(_) => Ty::Int,
            ConstantValue::Float(_) => Ty::Float,
            ConstantValue::Str(_) => Ty::String,
            ConstantValue::Bad => Ty::Error,
        }
    }
}

impl fmt::Display for ConstantValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConstantValue::Null => f.write_str("null"),
            ConstantValue::Bool(value) => write!(f, "{value}"),
            ConstantValue::Int(value) => write!(f, "{value}"),
            ConstantValue::Float(value) => write!(f, "{}", value.0),
            ConstantValue::Str(value) => write!(f, "{value:?}"),
            ConstantValue::Bad => f.write_str("<bad>"),
        }
    }
}
