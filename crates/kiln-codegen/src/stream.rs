//! Raw instruction stream of a single routine body.
//!
//! Operands are written big-endian directly after their opcode. Branches
//! carry absolute u32 targets so a forward branch can be written with a
//! placeholder and patched once its label is marked.

use kiln_core::Span;

use crate::OpCode;

/// Placeholder written for unresolved branch targets.
pub const UNPATCHED_TARGET: u32 = u32::MAX;

/// A decoded instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    pub offset: usize,
    pub op: OpCode,
    pub operand: Operand,
}

/// Decoded operand payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operand {
    None,
    U8(u8),
    U16(u16),
    Call { token: u16, argc: u8 },
    Target(u32),
    Switch(Vec<u32>),
}

/// Bytes of one routine plus the sequence points recorded while writing them.
#[derive(Debug, Clone, Default)]
pub struct InstructionStream {
    code: Vec<u8>,
    sequence_points: Vec<(usize, Span)>,
}

impl InstructionStream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_op(&mut self, op: OpCode) {
        self.code.push(op.into());
    }

    pub fn write_u8(&mut self, value: u8) {
        self.code.push(value);
    }

    pub fn write_u16(&mut self, value: u16) {
        self.code.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_u32(&mut self, value: u32) {
        self.code.extend_from_slice(&value.to_be_bytes());
    }

    /// Write a branch with a placeholder target, returning the operand offset.
    pub fn write_branch(&mut self, op: OpCode) -> usize {
        self.write_op(op);
        let at = self.code.len();
        self.write_u32(UNPATCHED_TARGET);
        at
    }

    /// Overwrite the opcode byte at `offset`.
    pub fn patch_op(&mut self, offset: usize, op: OpCode) {
        self.code[offset] = op.into();
    }

    /// Overwrite the u32 operand at `offset`.
    pub fn patch_u32(&mut self, offset: usize, value: u32) {
        self.code[offset..offset + 4].copy_from_slice(&value.to_be_bytes());
    }

    /// Record that the next instruction starts the code for `span`.
    ///
    /// Consecutive points at the same offset collapse to the latest one.
    pub fn mark_sequence_point(&mut self, span: Span) {
        let offset = self.code.len();
        match self.sequence_points.last_mut() {
            Some((last, existing)) if *last == offset => *existing = span,
            _ => self.sequence_points.push((offset, span)),
        }
    }

    pub fn current_offset(&self) -> usize {
        self.code.len()
    }

    pub fn code(&self) -> &[u8] {
        &self.code
    }

    pub fn sequence_points(&self) -> &[(usize, Span)] {
        &self.sequence_points
    }

    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    pub fn into_parts(self) -> (Vec<u8>, Vec<(usize, Span)>) {
        (self.code, self.sequence_points)
    }

    pub fn read_op(&self, offset: usize) -> Option<OpCode> {
        read_op(&self.code, offset)
    }

    pub fn read_u16(&self, offset: usize) -> Option<u16> {
        read_u16(&self.code, offset)
    }

    pub fn read_u32(&self, offset: usize) -> Option<u32> {
        read_u32(&self.code, offset)
    }

    /// Decode the whole stream.
    pub fn instructions(&self) -> Vec<Instruction> {
        decode(&self.code)
    }

    /// Opcodes only, for tests that don't care about operands.
    pub fn opcodes(&self) -> Vec<OpCode> {
        self.instructions().into_iter().map(|i| i.op).collect()
    }

    #[track_caller]
    pub fn assert_opcodes(&self, expected: &[OpCode]) {
        assert_opcodes(&self.code, expected);
    }
}

pub(crate) fn read_op(code: &[u8], offset: usize) -> Option<OpCode> {
    code.get(offset).and_then(|&b| OpCode::from_u8(b))
}

pub(crate) fn read_u16(code: &[u8], offset: usize) -> Option<u16> {
    let bytes = code.get(offset..offset + 2)?;
    Some(u16::from_be_bytes([bytes[0], bytes[1]]))
}

pub(crate) fn read_u32(code: &[u8], offset: usize) -> Option<u32> {
    let bytes = code.get(offset..offset + 4)?;
    Some(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// Decode `code` into instructions. Undecodable bytes end the walk.
pub fn decode(code: &[u8]) -> Vec<Instruction> {
    let mut out = Vec::new();
    let mut offset = 0;
    while let Some(op) = read_op(code, offset) {
        let at = offset + 1;
        let (operand, width) = match (op, op.operand_size()) {
            (OpCode::Switch, _) => {
                let Some(count) = read_u16(code, at) else { break };
                let targets: Option<Vec<u32>> = (0..count as usize)
                    .map(|i| read_u32(code, at + 2 + i * 4))
                    .collect();
                let Some(targets) = targets else { break };
                (Operand::Switch(targets), 2 + count as usize * 4)
            }
            (OpCode::Call | OpCode::CallVirt | OpCode::NewObj, _) => {
                let (Some(token), Some(&argc)) = (read_u16(code, at), code.get(at + 2)) else {
                    break;
                };
                (Operand::Call { token, argc }, 3)
            }
            (_, 0) => (Operand::None, 0),
            (_, 1) => match code.get(at) {
                Some(&b) => (Operand::U8(b), 1),
                None => break,
            },
            (_, 2) => match read_u16(code, at) {
                Some(v) => (Operand::U16(v), 2),
                None => break,
            },
            (_, _) => match read_u32(code, at) {
                Some(v) => (Operand::Target(v), 4),
                None => break,
            },
        };
        out.push(Instruction {
            offset,
            op,
            operand,
        });
        offset = at + width;
    }
    out
}

#[track_caller]
pub fn assert_opcodes(code: &[u8], expected: &[OpCode]) {
    let actual: Vec<OpCode> = decode(code).into_iter().map(|i| i.op).collect();
    assert_eq!(
        actual,
        expected,
        "Instruction mismatch.\nExpected: {:?}\nActual:   {:?}",
        expected.iter().map(|op| op.name()).collect::<Vec<_>>(),
        actual.iter().map(|op| op.name()).collect::<Vec<_>>(),
    );
}
