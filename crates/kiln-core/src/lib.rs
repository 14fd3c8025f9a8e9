//! Core data model shared by every kiln crate.
//!
//! This crate holds what flows between the stages of the backend:
//!
//! - [`symbols`]: immutable routine, type and field descriptors
//! - [`bound`]: the bound tree with sticky error markers
//! - [`diagnostics`]: located diagnostics and the scoped bag
//! - [`ImportChain`]: the persistent debug-import list
//! - [`InternalFault`]: the channel for compiler defects
//! - [`ResumableTypeDescriptor`]: the output of state-machine lowering
//!
//! Nothing here performs work; lowering lives in `kiln-lowering`,
//! instruction emission in `kiln-codegen`, orchestration in `kiln-compiler`.

pub mod bound;
mod constant;
pub mod diagnostics;
mod error;
mod imports;
mod resumable;
mod span;
mod symbol_id;
pub mod symbols;
mod ty;

pub use constant::ConstantValue;
pub use diagnostics::{Diagnostic, DiagnosticBag, DiagnosticKind, Severity};
pub use error::InternalFault;
pub use imports::{ImportChain, ImportScope};
pub use resumable::{
    HoistedVariable, ResumableKind, ResumableTypeDescriptor, VariableSlotAllocator,
};
pub use span::Span;
pub use symbol_id::{SymbolId, hash_constants};
pub use ty::{NamedType, ParamConstraint, Ty, TypeKind, TypeParam};
