//! Internal-consistency faults.
//!
//! These are defects in the compiler, not in the program being compiled.
//! They abort generation of one routine and travel on their own channel so
//! tests can assert they never occur on well-formed input.

use thiserror::Error;

use crate::{Span, SymbolId};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InternalFault {
    /// An address was requested for a value with no storage.
    #[error("address of stack-only local '{name}' at {span}")]
    NoHome { name: String, span: Span },

    /// A duplicate marker used as an address does not denote a reference.
    #[error("duplicated value at {span} is not a reference")]
    NotAReference { span: Span },

    /// A construct that lowering removes reached code generation.
    #[error("unlowered {node} reached code generation at {span}")]
    UnloweredNode { node: &'static str, span: Span },

    #[error("label {label} is referenced but never defined")]
    UnboundLabel { label: u32 },

    /// A branch enters a protected region, or leaves one conditionally.
    #[error("branch to label {label} crosses a protected region boundary")]
    InvalidBranch { label: u32 },

    #[error("evaluation stack underflow at offset {offset}")]
    StackUnderflow { offset: usize },

    #[error("scope or region closed without being opened")]
    UnbalancedScope,

    #[error("token table for {routine} exceeded {limit} entries")]
    SlotOverflow { routine: SymbolId, limit: usize },
}

impl InternalFault {
    pub fn span(&self) -> Option<Span> {
        match self {
            InternalFault::NoHome { span, .. }
            | InternalFault::NotAReference { span }
            | InternalFault::UnloweredNode { span, .. } => Some(*span),
            _ => None,
        }
    }
}
