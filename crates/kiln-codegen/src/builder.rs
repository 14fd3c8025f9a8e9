//! Instruction builder for one routine body.
//!
//! [`InstructionBuilder`] sits on top of an [`InstructionStream`] and
//! tracks everything the raw stream cannot: evaluation stack depth, labels
//! and their pending fixups, exception regions, and debug scopes.
//!
//! # Branches and regions
//!
//! Every try body and every handler is a *block* with its own id. The
//! builder keeps the path of open blocks and stamps it on each branch
//! source and each label. When a branch is resolved:
//!
//! ```text
//! target path == source path          -> plain branch
//! target path is a prefix of source   -> rewritten to LEAVE
//! anything else                       -> InvalidBranch fault
//! ```
//!
//! Conditional branches and switch targets cannot be rewritten, so they
//! fault whenever their target lies outside the current block.
//!
//! # Example
//!
//! ```ignore
//! let mut b = InstructionBuilder::new(routine_id, true);
//! let done = b.define_label();
//! b.emit(OpCode::PushTrue);
//! b.emit_branch(OpCode::BrFalse, done);
//! b.emit(OpCode::Nop);
//! b.mark_label(done);
//! b.emit_ret(false);
//! let built = b.finish()?;
//! ```

use std::sync::Arc;

use kiln_core::{ConstantValue, InternalFault, Span, SymbolId, Ty};

use crate::stream::InstructionStream;
use crate::tokens::TokenTable;
use crate::OpCode;

/// A branch target inside one body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label(u32);

impl Label {
    pub fn index(self) -> u32 {
        self.0
    }
}

/// Handler attached to a protected range.
#[derive(Debug, Clone, PartialEq)]
pub enum HandlerKind {
    Catch(Ty),
    Finally,
}

/// One protected range and its handler, as offsets into the code.
#[derive(Debug, Clone, PartialEq)]
pub struct ExceptionRegion {
    pub try_start: usize,
    pub try_end: usize,
    pub handler_start: usize,
    pub handler_end: usize,
    pub kind: HandlerKind,
}

/// A named slot visible to a debugger over `start..end`.
#[derive(Debug, Clone, PartialEq)]
pub struct ScopeVariable {
    pub name: Arc<str>,
    pub slot: u16,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DebugScope {
    pub start: usize,
    pub end: usize,
    pub variables: Vec<ScopeVariable>,
}

/// Everything produced by a finished builder.
#[derive(Debug, Clone)]
pub struct BuiltCode {
    pub code: Vec<u8>,
    pub sequence_points: Vec<(usize, Span)>,
    pub max_stack: u32,
    pub tokens: TokenTable,
    pub exception_regions: Vec<ExceptionRegion>,
    pub debug_scopes: Vec<DebugScope>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FixupKind {
    Unconditional,
    Conditional,
    SwitchTarget,
}

#[derive(Debug, Clone)]
struct Fixup {
    op_at: usize,
    operand_at: usize,
    source: Vec<u32>,
    kind: FixupKind,
}

#[derive(Debug, Clone, Default)]
struct LabelState {
    offset: Option<usize>,
    depth: Option<u32>,
    path: Vec<u32>,
    fixups: Vec<Fixup>,
}

#[derive(Debug)]
struct TryFrame {
    try_start: usize,
    try_end: Option<usize>,
    end: Label,
    handler: Option<(HandlerKind, usize)>,
    handlers: usize,
}

pub struct InstructionBuilder {
    owner: SymbolId,
    stream: InstructionStream,
    tokens: TokenTable,
    debug_info: bool,

    depth: u32,
    max_stack: u32,
    reachable: bool,
    underflow: Option<usize>,
    fault: Option<InternalFault>,

    labels: Vec<LabelState>,

    path: Vec<u32>,
    next_block: u32,
    tries: Vec<TryFrame>,
    regions: Vec<ExceptionRegion>,

    open_scopes: Vec<usize>,
    scopes: Vec<DebugScope>,
}

impl InstructionBuilder {
    pub fn new(owner: SymbolId, debug_info: bool) -> Self {
        Self {
            owner,
            stream: InstructionStream::new(),
            tokens: TokenTable::new(owner),
            debug_info,
            depth: 0,
            max_stack: 0,
            reachable: true,
            underflow: None,
            fault: None,
            labels: Vec::new(),
            path: Vec::new(),
            next_block: 0,
            tries: Vec::new(),
            regions: Vec::new(),
            open_scopes: Vec::new(),
            scopes: Vec::new(),
        }
    }

    pub fn owner(&self) -> SymbolId {
        self.owner
    }

    pub fn current_offset(&self) -> usize {
        self.stream.current_offset()
    }

    pub fn stack_depth(&self) -> u32 {
        self.depth
    }

    pub fn is_reachable(&self) -> bool {
        self.reachable
    }

    pub fn tokens(&mut self) -> &mut TokenTable {
        &mut self.tokens
    }

    /// Inside a try body or a handler.
    pub fn in_protected_region(&self) -> bool {
        !self.path.is_empty()
    }

    /// Start the code for `span`. Synthesized spans produce no point.
    pub fn set_span(&mut self, span: Span) {
        if self.debug_info && !span.is_synthesized() {
            self.stream.mark_sequence_point(span);
        }
    }

    /// Record a fault; the first one wins and is reported by [`finish`].
    ///
    /// [`finish`]: InstructionBuilder::finish
    pub fn fault(&mut self, fault: InternalFault) {
        self.fault.get_or_insert(fault);
    }

    // =========================================================================
    // Stack accounting
    // =========================================================================

    fn adjust(&mut self, pops: u32, pushes: u32) {
        if self.reachable {
            if self.depth < pops {
                self.underflow.get_or_insert(self.stream.current_offset());
                self.depth = 0;
            } else {
                self.depth -= pops;
            }
        }
        self.depth += pushes;
        self.max_stack = self.max_stack.max(self.depth);
    }

    // =========================================================================
    // Emission
    // =========================================================================

    /// Emit an operand-less opcode with a fixed stack effect.
    pub fn emit(&mut self, op: OpCode) {
        let (pops, pushes) = op.stack_effect().unwrap_or((0, 0));
        self.adjust(pops, pushes);
        self.stream.write_op(op);
        if op.is_unconditional_transfer() {
            self.reachable = false;
        }
    }

    pub fn emit_u8(&mut self, op: OpCode, operand: u8) {
        let (pops, pushes) = op.stack_effect().unwrap_or((0, 0));
        self.adjust(pops, pushes);
        self.stream.write_op(op);
        self.stream.write_u8(operand);
    }

    pub fn emit_u16(&mut self, op: OpCode, operand: u16) {
        let (pops, pushes) = op.stack_effect().unwrap_or((0, 0));
        self.adjust(pops, pushes);
        self.stream.write_op(op);
        self.stream.write_u16(operand);
    }

    /// Element access of the given rank; pops array and indices.
    pub fn emit_element(&mut self, op: OpCode, rank: u8) {
        let base = rank as u32 + 1;
        match op {
            OpCode::StoreElem => self.adjust(base + 1, 0),
            _ => self.adjust(base, 1),
        }
        self.stream.write_op(op);
        self.stream.write_u8(rank);
    }

    /// `Call`, `CallVirt` or `NewObj` over `argc` stack arguments.
    pub fn emit_call(&mut self, op: OpCode, token: u16, argc: u8, returns_value: bool) {
        let pushes = u32::from(returns_value || op == OpCode::NewObj);
        self.adjust(argc as u32, pushes);
        self.stream.write_op(op);
        self.stream.write_u16(token);
        self.stream.write_u8(argc);
    }

    pub fn emit_ret(&mut self, has_value: bool) {
        self.adjust(u32::from(has_value), 0);
        self.stream.write_op(OpCode::Ret);
        self.reachable = false;
    }

    pub fn emit_constant(&mut self, value: &ConstantValue) {
        match value {
            ConstantValue::Null => self.emit(OpCode::PushNull),
            ConstantValue::Bool(true) => self.emit(OpCode::PushTrue),
            ConstantValue::Bool(false) => self.emit(OpCode::PushFalse),
            ConstantValue::Int(0) => self.emit(OpCode::PushZero),
            ConstantValue::Int(1) => self.emit(OpCode::PushOne),
            _ => match self.tokens.constant(value) {
                Ok(token) => self.emit_u16(OpCode::LoadConst, token),
                Err(fault) => self.fault(fault),
            },
        }
    }

    /// Emit `op` with a type token operand.
    pub fn emit_type_op(&mut self, op: OpCode, ty: &Ty) {
        match self.tokens.ty(ty) {
            Ok(token) => self.emit_u16(op, token),
            Err(fault) => self.fault(fault),
        }
    }

    /// Emit `op` with a field token operand.
    pub fn emit_field_op(&mut self, op: OpCode, field: SymbolId) {
        match self.tokens.field(field) {
            Ok(token) => self.emit_u16(op, token),
            Err(fault) => self.fault(fault),
        }
    }

    pub fn emit_routine_call(
        &mut self,
        op: OpCode,
        routine: SymbolId,
        argc: u8,
        returns_value: bool,
    ) {
        match self.tokens.routine(routine) {
            Ok(token) => self.emit_call(op, token, argc, returns_value),
            Err(fault) => self.fault(fault),
        }
    }

    pub fn emit_make_delegate(&mut self, routine: SymbolId) {
        match self.tokens.routine(routine) {
            Ok(token) => self.emit_u16(OpCode::MakeDelegate, token),
            Err(fault) => self.fault(fault),
        }
    }

    // =========================================================================
    // Labels and branches
    // =========================================================================

    pub fn define_label(&mut self) -> Label {
        self.labels.push(LabelState::default());
        Label(self.labels.len() as u32 - 1)
    }

    pub fn is_marked(&self, label: Label) -> bool {
        self.labels
            .get(label.0 as usize)
            .is_some_and(|state| state.offset.is_some())
    }

    /// Bind `label` to the current offset and resolve its pending branches.
    pub fn mark_label(&mut self, label: Label) {
        let offset = self.stream.current_offset();
        let path = self.path.clone();
        let (fixups, depth) = {
            let state = &mut self.labels[label.0 as usize];
            if state.offset.is_some() {
                self.fault.get_or_insert(InternalFault::InvalidBranch { label: label.0 });
                return;
            }
            state.offset = Some(offset);
            state.path = path.clone();
            if self.reachable {
                state.depth.get_or_insert(self.depth);
            }
            (std::mem::take(&mut state.fixups), state.depth)
        };
        // A label nothing has branched to yet is reachable only by falling
        // into it; later backward branches do not make it reachable here.
        if !self.reachable {
            self.depth = depth.unwrap_or(0);
            self.reachable = depth.is_some();
        }
        for fixup in fixups {
            self.resolve(label, &fixup, offset, &path);
        }
    }

    fn resolve(&mut self, label: Label, fixup: &Fixup, target: usize, target_path: &[u32]) {
        self.stream.patch_u32(fixup.operand_at, target as u32);
        if fixup.source.as_slice() == target_path {
            return;
        }
        let leaves = fixup.source.starts_with(target_path);
        if leaves && fixup.kind == FixupKind::Unconditional {
            self.stream.patch_op(fixup.op_at, OpCode::Leave);
        } else {
            self.fault(InternalFault::InvalidBranch { label: label.0 });
        }
    }

    fn attach(&mut self, label: Label, fixup: Fixup) {
        let reachable = self.reachable;
        let depth = self.depth;
        let state = &mut self.labels[label.0 as usize];
        if reachable {
            state.depth.get_or_insert(depth);
        }
        match state.offset {
            Some(target) => {
                let path = state.path.clone();
                self.resolve(label, &fixup, target, &path);
            }
            None => state.fixups.push(fixup),
        }
    }

    /// Emit `Br`, `BrTrue` or `BrFalse` to `label`.
    ///
    /// `Br` and `Leave` are interchangeable here; the builder picks the
    /// right one once both ends of the branch are known.
    pub fn emit_branch(&mut self, op: OpCode, label: Label) {
        let conditional = matches!(op, OpCode::BrTrue | OpCode::BrFalse);
        if conditional {
            self.adjust(1, 0);
        }
        let op_at = self.stream.current_offset();
        let write = if conditional { op } else { OpCode::Br };
        let operand_at = self.stream.write_branch(write);
        let fixup = Fixup {
            op_at,
            operand_at,
            source: self.path.clone(),
            kind: if conditional {
                FixupKind::Conditional
            } else {
                FixupKind::Unconditional
            },
        };
        self.attach(label, fixup);
        if !conditional {
            self.reachable = false;
        }
    }

    /// Emit a jump table over `targets`; falls through when out of range.
    pub fn emit_switch(&mut self, targets: &[Label]) {
        self.adjust(1, 0);
        let op_at = self.stream.current_offset();
        self.stream.write_op(OpCode::Switch);
        self.stream.write_u16(targets.len() as u16);
        for &label in targets {
            let operand_at = self.stream.current_offset();
            self.stream.write_u32(crate::stream::UNPATCHED_TARGET);
            let fixup = Fixup {
                op_at,
                operand_at,
                source: self.path.clone(),
                kind: FixupKind::SwitchTarget,
            };
            self.attach(label, fixup);
        }
    }

    // =========================================================================
    // Exception regions
    // =========================================================================

    fn enter_block(&mut self) {
        self.path.push(self.next_block);
        self.next_block += 1;
    }

    /// Open a protected range. Returns the label following the whole try.
    pub fn begin_try(&mut self) -> Label {
        let end = self.define_label();
        self.tries.push(TryFrame {
            try_start: self.stream.current_offset(),
            try_end: None,
            end,
            handler: None,
            handlers: 0,
        });
        self.enter_block();
        end
    }

    /// Close the try body (or follow the previous handler) and open a handler.
    pub fn begin_handler(&mut self, kind: HandlerKind) {
        let Some((end, in_body, in_handler)) = self
            .tries
            .last()
            .map(|t| (t.end, t.try_end.is_none(), t.handler.is_some()))
        else {
            self.fault(InternalFault::UnbalancedScope);
            return;
        };
        if in_handler {
            self.fault(InternalFault::UnbalancedScope);
            return;
        }
        if in_body {
            if self.reachable {
                self.emit_branch(OpCode::Leave, end);
            }
            self.path.pop();
        }
        let offset = self.stream.current_offset();
        let depth = match kind {
            HandlerKind::Catch(_) => 1,
            HandlerKind::Finally => 0,
        };
        if let Some(frame) = self.tries.last_mut() {
            frame.try_end.get_or_insert(offset);
            frame.handler = Some((kind, offset));
        }
        self.enter_block();
        self.reachable = true;
        self.depth = depth;
        self.max_stack = self.max_stack.max(depth);
    }

    /// Close the current handler.
    pub fn end_handler(&mut self) {
        let Some((kind, end)) = self
            .tries
            .last()
            .and_then(|t| t.handler.as_ref().map(|(k, _)| (k.clone(), t.end)))
        else {
            self.fault(InternalFault::UnbalancedScope);
            return;
        };
        if self.reachable {
            match kind {
                HandlerKind::Finally => self.emit(OpCode::EndFinally),
                HandlerKind::Catch(_) => self.emit_branch(OpCode::Leave, end),
            }
        }
        self.path.pop();
        let offset = self.stream.current_offset();
        let Some(frame) = self.tries.last_mut() else {
            return;
        };
        if let Some((kind, handler_start)) = frame.handler.take() {
            frame.handlers += 1;
            self.regions.push(ExceptionRegion {
                try_start: frame.try_start,
                try_end: frame.try_end.unwrap_or(handler_start),
                handler_start,
                handler_end: offset,
                kind,
            });
        }
    }

    /// Close the protected range and mark its end label.
    pub fn end_try(&mut self) {
        let Some(frame) = self.tries.pop() else {
            self.fault(InternalFault::UnbalancedScope);
            return;
        };
        if frame.handler.is_some() || frame.handlers == 0 {
            self.fault(InternalFault::UnbalancedScope);
            return;
        }
        self.mark_label(frame.end);
    }

    // =========================================================================
    // Debug scopes
    // =========================================================================

    pub fn open_scope(&mut self) {
        self.open_scopes.push(self.stream.current_offset());
    }

    pub fn close_scope(&mut self, variables: Vec<ScopeVariable>) {
        match self.open_scopes.pop() {
            Some(start) => {
                if self.debug_info {
                    self.scopes.push(DebugScope {
                        start,
                        end: self.stream.current_offset(),
                        variables,
                    });
                }
            }
            None => self.fault(InternalFault::UnbalancedScope),
        }
    }

    // =========================================================================
    // Completion
    // =========================================================================

    pub fn finish(self) -> Result<BuiltCode, InternalFault> {
        if let Some(fault) = self.fault {
            return Err(fault);
        }
        if let Some(offset) = self.underflow {
            return Err(InternalFault::StackUnderflow { offset });
        }
        if let Some(index) = self
            .labels
            .iter()
            .position(|l| l.offset.is_none() && !l.fixups.is_empty())
        {
            return Err(InternalFault::UnboundLabel {
                label: index as u32,
            });
        }
        if !self.tries.is_empty() || !self.open_scopes.is_empty() {
            return Err(InternalFault::UnbalancedScope);
        }
        let (code, sequence_points) = self.stream.into_parts();
        Ok(BuiltCode {
            code,
            sequence_points,
            max_stack: self.max_stack,
            tokens: self.tokens,
            exception_regions: self.regions,
            debug_scopes: self.scopes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{assert_opcodes, decode, Operand};

    fn create_test_builder() -> InstructionBuilder {
        InstructionBuilder::new(SymbolId(1), true)
    }

    #[test]
    fn tracks_max_stack() {
        let mut b = create_test_builder();
        b.emit(OpCode::PushOne);
        b.emit(OpCode::PushOne);
        b.emit(OpCode::Add);
        b.emit(OpCode::Pop);
        b.emit_ret(false);
        let built = b.finish().unwrap();
        assert_eq!(built.max_stack, 2);
    }

    #[test]
    fn underflow_is_a_fault() {
        let mut b = create_test_builder();
        b.emit(OpCode::Pop);
        assert_eq!(
            b.finish().unwrap_err(),
            InternalFault::StackUnderflow { offset: 0 }
        );
    }

    #[test]
    fn unreachable_code_is_not_stack_checked() {
        let mut b = create_test_builder();
        b.emit_ret(false);
        b.emit(OpCode::Pop);
        assert!(b.finish().is_ok());
    }

    #[test]
    fn forward_branch_is_patched() {
        let mut b = create_test_builder();
        let done = b.define_label();
        b.emit(OpCode::PushTrue);
        b.emit_branch(OpCode::BrFalse, done);
        b.emit(OpCode::Nop);
        b.mark_label(done);
        b.emit_ret(false);
        let built = b.finish().unwrap();
        let decoded = decode(&built.code);
        assert_eq!(decoded[1].operand, Operand::Target(7));
    }

    #[test]
    fn unmarked_label_is_a_fault() {
        let mut b = create_test_builder();
        let nowhere = b.define_label();
        b.emit_branch(OpCode::Br, nowhere);
        assert_eq!(
            b.finish().unwrap_err(),
            InternalFault::UnboundLabel { label: 0 }
        );
    }

    #[test]
    fn branch_out_of_try_becomes_leave() {
        let mut b = create_test_builder();
        let out = b.define_label();
        b.begin_try();
        b.emit_branch(OpCode::Br, out);
        b.begin_handler(HandlerKind::Finally);
        b.end_handler();
        b.end_try();
        b.mark_label(out);
        b.emit_ret(false);
        let built = b.finish().unwrap();
        assert_opcodes(
            &built.code,
            &[OpCode::Leave, OpCode::EndFinally, OpCode::Ret],
        );
        assert_eq!(built.exception_regions.len(), 1);
        let region = &built.exception_regions[0];
        assert_eq!(region.kind, HandlerKind::Finally);
        assert_eq!((region.try_start, region.try_end), (0, 5));
    }

    #[test]
    fn branch_into_try_is_a_fault() {
        let mut b = create_test_builder();
        let inside = b.define_label();
        b.emit_branch(OpCode::Br, inside);
        b.begin_try();
        b.mark_label(inside);
        b.emit(OpCode::Nop);
        b.begin_handler(HandlerKind::Catch(Ty::Object));
        b.emit(OpCode::Pop);
        b.end_handler();
        b.end_try();
        b.emit_ret(false);
        assert_eq!(
            b.finish().unwrap_err(),
            InternalFault::InvalidBranch { label: 0 }
        );
    }

    #[test]
    fn conditional_branch_out_of_try_is_a_fault() {
        let mut b = create_test_builder();
        let out = b.define_label();
        b.begin_try();
        b.emit(OpCode::PushTrue);
        b.emit_branch(OpCode::BrTrue, out);
        b.begin_handler(HandlerKind::Finally);
        b.end_handler();
        b.end_try();
        b.mark_label(out);
        b.emit_ret(false);
        assert!(matches!(
            b.finish(),
            Err(InternalFault::InvalidBranch { .. })
        ));
    }

    #[test]
    fn catch_handler_starts_with_exception_on_stack() {
        let mut b = create_test_builder();
        b.begin_try();
        b.emit(OpCode::Nop);
        b.begin_handler(HandlerKind::Catch(Ty::Object));
        assert_eq!(b.stack_depth(), 1);
        b.emit(OpCode::Pop);
        b.end_handler();
        b.end_try();
        b.emit_ret(false);
        let built = b.finish().unwrap();
        assert_opcodes(
            &built.code,
            &[OpCode::Nop, OpCode::Leave, OpCode::Pop, OpCode::Leave, OpCode::Ret],
        );
    }

    #[test]
    fn handler_without_try_is_unbalanced() {
        let mut b = create_test_builder();
        b.begin_handler(HandlerKind::Finally);
        assert_eq!(b.finish().unwrap_err(), InternalFault::UnbalancedScope);
    }

    #[test]
    fn scopes_and_sequence_points() {
        let mut b = create_test_builder();
        b.open_scope();
        b.set_span(Span::new(3, 1, 4));
        b.emit(OpCode::Nop);
        b.set_span(Span::default());
        b.emit(OpCode::Nop);
        b.close_scope(vec![ScopeVariable {
            name: Arc::from("x"),
            slot: 0,
        }]);
        b.emit_ret(false);
        let built = b.finish().unwrap();
        assert_eq!(built.sequence_points, vec![(0, Span::new(3, 1, 4))]);
        assert_eq!(built.debug_scopes[0].start, 0);
        assert_eq!(built.debug_scopes[0].end, 2);
    }
}
