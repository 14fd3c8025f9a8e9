//! The packaged, immutable result of generating one routine.

use std::sync::Arc;

use kiln_core::{ImportScope, ResumableKind, Span, SymbolId};

use crate::builder::{DebugScope, ExceptionRegion};
use crate::locals::LocalInfo;
use crate::stream::{self, Instruction};
use crate::tokens::Token;
use crate::OpCode;

/// Debug metadata of a routine lowered into a state machine.
#[derive(Debug, Clone, PartialEq)]
pub struct ResumableInfo {
    pub type_name: Arc<str>,
    pub kind: ResumableKind,
    pub move_next: SymbolId,
    /// Offset of each suspension point, in emission order.
    pub yield_offsets: Vec<usize>,
    /// Offset where each suspension point continues.
    pub resume_offsets: Vec<usize>,
    /// Handler of the catch-all wrapped around an async `MoveNext`.
    pub catch_handler_offset: Option<usize>,
    /// Source local name to the state-machine field that holds it.
    pub hoisted: Vec<(Arc<str>, SymbolId)>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MethodBody {
    pub routine: SymbolId,
    pub code: Vec<u8>,
    pub tokens: Vec<Token>,
    pub max_stack: u32,
    pub locals: Vec<LocalInfo>,
    pub exception_regions: Vec<ExceptionRegion>,
    pub sequence_points: Vec<(usize, Span)>,
    pub debug_scopes: Vec<DebugScope>,
    pub namespace_scopes: Vec<ImportScope>,
    pub resumable: Option<ResumableInfo>,
}

impl MethodBody {
    pub fn instructions(&self) -> Vec<Instruction> {
        stream::decode(&self.code)
    }

    pub fn opcodes(&self) -> Vec<OpCode> {
        self.instructions().into_iter().map(|i| i.op).collect()
    }

    #[track_caller]
    pub fn assert_opcodes(&self, expected: &[OpCode]) {
        stream::assert_opcodes(&self.code, expected);
    }

    /// Opcodes of the body, leading with `prefix`.
    pub fn starts_with(&self, prefix: &[OpCode]) -> bool {
        self.opcodes().starts_with(prefix)
    }

    pub fn token(&self, index: u16) -> Option<&Token> {
        self.tokens.get(index as usize)
    }
}
