//! Analysis passes run over a bound body before lowering.
//!
//! Both passes only append to the scoped bag. Neither changes the tree.

pub mod diagnostics;
pub mod flow;

pub use diagnostics::{CheckContext, check};
pub use flow::{FlowAnalysis, FlowTarget, analyze};
