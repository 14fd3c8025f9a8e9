//! Instruction set of emitted routine bodies.
//!
//! Each opcode is a single byte with operands following inline, big-endian.
//! Branch targets are absolute offsets into the routine's instruction stream.

use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Operation codes.
///
/// The target machine is stack-based: most operations pop their operands
/// from the evaluation stack and push their result back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum OpCode {
    // =========================================================================
    // Constants and stack
    // =========================================================================
    Nop = 0,
    PushNull,
    PushTrue,
    PushFalse,
    PushZero,
    PushOne,
    /// Operand: u16 token index of a constant.
    LoadConst,
    Pop,
    Dup,

    // =========================================================================
    // Arguments and locals
    // =========================================================================
    /// Operand: u16 argument slot.
    LoadArg,
    /// Operand: u16 argument slot.
    LoadArgAddr,
    /// Operand: u16 argument slot.
    StoreArg,
    /// Operand: u16 local slot.
    LoadLocal,
    /// Operand: u16 local slot.
    LoadLocalAddr,
    /// Operand: u16 local slot.
    StoreLocal,

    // =========================================================================
    // Fields and elements
    // =========================================================================
    /// Operand: u16 field token.
    LoadField,
    /// Operand: u16 field token.
    LoadFieldAddr,
    /// Operand: u16 field token.
    StoreField,
    /// Operand: u16 field token.
    LoadStatic,
    /// Operand: u16 field token.
    LoadStaticAddr,
    /// Operand: u16 field token.
    StoreStatic,
    /// Operand: u8 rank.
    LoadElem,
    /// Operand: u8 rank.
    LoadElemAddr,
    /// Operand: u8 rank.
    StoreElem,
    /// Prefix: the following element address is only read through.
    ReadOnly,

    // =========================================================================
    // Indirection and conversions
    // =========================================================================
    LoadIndirect,
    StoreIndirect,
    /// Operand: u16 type token.
    LoadDefault,
    /// Operand: u16 type token.
    RefAnyVal,
    /// Operand: u16 type token.
    Box,
    /// Operand: u16 type token.
    Unbox,
    /// Operand: u16 type token.
    Convert,
    /// Operand: u16 type token.
    CastClass,
    /// Operand: u16 element type token.
    NewArray,

    // =========================================================================
    // Arithmetic and comparison
    // =========================================================================
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    And,
    Or,
    Neg,
    Not,
    Ceq,
    Clt,
    Cgt,

    // =========================================================================
    // Calls
    // =========================================================================
    /// Prefix. Operand: u16 type token of the constrained receiver.
    Constrained,
    /// Operands: u16 routine token, u8 argument count (receiver included).
    Call,
    /// Operands: u16 routine token, u8 argument count (receiver included).
    CallVirt,
    /// Operands: u16 constructor token, u8 argument count.
    NewObj,
    /// Operand: u16 routine token. Pops the target, pushes a delegate.
    MakeDelegate,

    // =========================================================================
    // Control flow
    // =========================================================================
    /// Operand: u32 target.
    Br,
    /// Operand: u32 target.
    BrTrue,
    /// Operand: u32 target.
    BrFalse,
    /// Branch out of a protected region. Operand: u32 target.
    Leave,
    /// Operands: u16 count, then `count` u32 targets.
    Switch,
    Ret,
    Throw,
    Rethrow,
    EndFinally,
}

impl OpCode {
    /// Decode an opcode byte.
    #[inline]
    pub fn from_u8(value: u8) -> Option<Self> {
        Self::try_from(value).ok()
    }

    /// Size in bytes of the fixed operands following the opcode.
    ///
    /// `Switch` reports only its count; its targets follow.
    pub fn operand_size(self) -> usize {
        match self {
            OpCode::LoadElem | OpCode::LoadElemAddr | OpCode::StoreElem => 1,
            OpCode::LoadConst
            | OpCode::LoadArg
            | OpCode::LoadArgAddr
            | OpCode::StoreArg
            | OpCode::LoadLocal
            | OpCode::LoadLocalAddr
            | OpCode::StoreLocal
            | OpCode::LoadField
            | OpCode::LoadFieldAddr
            | OpCode::StoreField
            | OpCode::LoadStatic
            | OpCode::LoadStaticAddr
            | OpCode::StoreStatic
            | OpCode::LoadDefault
            | OpCode::RefAnyVal
            | OpCode::Box
            | OpCode::Unbox
            | OpCode::Convert
            | OpCode::CastClass
            | OpCode::NewArray
            | OpCode::Constrained
            | OpCode::MakeDelegate
            | OpCode::Switch => 2,
            OpCode::Call | OpCode::CallVirt | OpCode::NewObj => 3,
            OpCode::Br | OpCode::BrTrue | OpCode::BrFalse | OpCode::Leave => 4,
            _ => 0,
        }
    }

    /// `(pops, pushes)` for opcodes with a fixed stack effect.
    ///
    /// Calls, element access and `Ret` depend on their operands and return
    /// `None`; the builder accounts for them explicitly.
    pub fn stack_effect(self) -> Option<(u32, u32)> {
        let effect = match self {
            OpCode::Nop
            | OpCode::ReadOnly
            | OpCode::Constrained
            | OpCode::Br
            | OpCode::Leave
            | OpCode::Rethrow
            | OpCode::EndFinally => (0, 0),
            OpCode::PushNull
            | OpCode::PushTrue
            | OpCode::PushFalse
            | OpCode::PushZero
            | OpCode::PushOne
            | OpCode::LoadConst
            | OpCode::LoadArg
            | OpCode::LoadArgAddr
            | OpCode::LoadLocal
            | OpCode::LoadLocalAddr
            | OpCode::LoadStatic
            | OpCode::LoadStaticAddr
            | OpCode::LoadDefault => (0, 1),
            OpCode::Pop
            | OpCode::StoreArg
            | OpCode::StoreLocal
            | OpCode::StoreStatic
            | OpCode::BrTrue
            | OpCode::BrFalse
            | OpCode::Switch
            | OpCode::Throw => (1, 0),
            OpCode::Dup => (1, 2),
            OpCode::LoadField
            | OpCode::LoadFieldAddr
            | OpCode::LoadIndirect
            | OpCode::RefAnyVal
            | OpCode::Box
            | OpCode::Unbox
            | OpCode::Convert
            | OpCode::CastClass
            | OpCode::NewArray
            | OpCode::MakeDelegate
            | OpCode::Neg
            | OpCode::Not => (1, 1),
            OpCode::StoreField | OpCode::StoreIndirect => (2, 0),
            OpCode::Add
            | OpCode::Sub
            | OpCode::Mul
            | OpCode::Div
            | OpCode::Rem
            | OpCode::And
            | OpCode::Or
            | OpCode::Ceq
            | OpCode::Clt
            | OpCode::Cgt => (2, 1),
            OpCode::LoadElem
            | OpCode::LoadElemAddr
            | OpCode::StoreElem
            | OpCode::Call
            | OpCode::CallVirt
            | OpCode::NewObj
            | OpCode::Ret => return None,
        };
        Some(effect)
    }

    /// Control never continues to the next instruction.
    pub fn is_unconditional_transfer(self) -> bool {
        matches!(
            self,
            OpCode::Br
                | OpCode::Leave
                | OpCode::Ret
                | OpCode::Throw
                | OpCode::Rethrow
                | OpCode::EndFinally
        )
    }

    pub fn is_branch(self) -> bool {
        matches!(
            self,
            OpCode::Br | OpCode::BrTrue | OpCode::BrFalse | OpCode::Leave
        )
    }

    /// Mnemonic used in disassembly.
    pub fn name(self) -> &'static str {
        match self {
            OpCode::Nop => "NOP",
            OpCode::PushNull => "PUSH_NULL",
            OpCode::PushTrue => "PUSH_TRUE",
            OpCode::PushFalse => "PUSH_FALSE",
            OpCode::PushZero => "PUSH_ZERO",
            OpCode::PushOne => "PUSH_ONE",
            OpCode::LoadConst => "LOAD_CONST",
            OpCode::Pop => "POP",
            OpCode::Dup => "DUP",
            OpCode::LoadArg => "LOAD_ARG",
            OpCode::LoadArgAddr => "LOAD_ARG_ADDR",
            OpCode::StoreArg => "STORE_ARG",
            OpCode::LoadLocal => "LOAD_LOCAL",
            OpCode::LoadLocalAddr => "LOAD_LOCAL_ADDR",
            OpCode::StoreLocal => "STORE_LOCAL",
            OpCode::LoadField => "LOAD_FIELD",
            OpCode::LoadFieldAddr => "LOAD_FIELD_ADDR",
            OpCode::StoreField => "STORE_FIELD",
            OpCode::LoadStatic => "LOAD_STATIC",
            OpCode::LoadStaticAddr => "LOAD_STATIC_ADDR",
            OpCode::StoreStatic => "STORE_STATIC",
            OpCode::LoadElem => "LOAD_ELEM",
            OpCode::LoadElemAddr => "LOAD_ELEM_ADDR",
            OpCode::StoreElem => "STORE_ELEM",
            OpCode::ReadOnly => "READONLY",
            OpCode::LoadIndirect => "LOAD_INDIRECT",
            OpCode::StoreIndirect => "STORE_INDIRECT",
            OpCode::LoadDefault => "LOAD_DEFAULT",
            OpCode::RefAnyVal => "REFANYVAL",
            OpCode::Box => "BOX",
            OpCode::Unbox => "UNBOX",
            OpCode::Convert => "CONVERT",
            OpCode::CastClass => "CAST_CLASS",
            OpCode::NewArray => "NEW_ARRAY",
            OpCode::Add => "ADD",
            OpCode::Sub => "SUB",
            OpCode::Mul => "MUL",
            OpCode::Div => "DIV",
            OpCode::Rem => "REM",
            OpCode::And => "AND",
            OpCode::Or => "OR",
            OpCode::Neg => "NEG",
            OpCode::Not => "NOT",
            OpCode::Ceq => "CEQ",
            OpCode::Clt => "CLT",
            OpCode::Cgt => "CGT",
            OpCode::Constrained => "CONSTRAINED",
            OpCode::Call => "CALL",
            OpCode::CallVirt => "CALL_VIRT",
            OpCode::NewObj => "NEW_OBJ",
            OpCode::MakeDelegate => "MAKE_DELEGATE",
            OpCode::Br => "BR",
            OpCode::BrTrue => "BR_TRUE",
            OpCode::BrFalse => "BR_FALSE",
            OpCode::Leave => "LEAVE",
            OpCode::Switch => "SWITCH",
            OpCode::Ret => "RET",
            OpCode::Throw => "THROW",
            OpCode::Rethrow => "RETHROW",
            OpCode::EndFinally => "END_FINALLY",
        }
    }
}
