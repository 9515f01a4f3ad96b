use core::fmt;

use crate::instruction::{
    CallFlags, Condition, Instruction, LoadTarget, NewType, Section, StoreTarget, Synthetic,
    TrapFlags, unpack_new_flags,
};
use crate::op::Op;

/// Why a byte sequence could not be decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    UnknownOpcode { offset: usize, byte: u8 },
    Truncated { offset: usize, op: Op },
    InvalidOperand { offset: usize, op: Op, value: u32 },
    InvalidProc { offset: usize },
}

impl DecodeError {
    pub fn offset(&self) -> usize {
        match *self {
            Self::UnknownOpcode { offset, .. }
            | Self::Truncated { offset, .. }
            | Self::InvalidOperand { offset, .. }
            | Self::InvalidProc { offset } => offset,
        }
    }
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownOpcode { offset, byte } => {
                write!(f, "unknown opcode 0x{byte:02x} at offset {offset}")
            }
            Self::Truncated { offset, op } => {
                write!(f, "truncated operands for {op:?} at offset {offset}")
            }
            Self::InvalidOperand { offset, op, value } => {
                write!(f, "invalid operand {value:#x} for {op:?} at offset {offset}")
            }
            Self::InvalidProc { offset } => write!(f, "invalid proc header at offset {offset}"),
        }
    }
}

impl std::error::Error for DecodeError {}

/// Decodes a bytecode byte slice into [`Instruction`]s.
///
/// Unlike a trusted decoder this one validates every opcode and operand:
/// the bytes come from an external producer and a malformed stream must
/// surface as a [`DecodeError`].
pub struct BytecodeDecoder<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> BytecodeDecoder<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    /// Start decoding at `pos`.
    pub fn at(bytes: &'a [u8], pos: usize) -> Self {
        Self { bytes, pos }
    }

    /// Current byte offset in the stream.
    #[inline(always)]
    pub fn offset(&self) -> usize {
        self.pos
    }

    #[inline(always)]
    pub fn is_at_end(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    /// Decode the next instruction, or `None` at end-of-stream.
    pub fn decode_next(&mut self) -> Result<Option<Instruction>, DecodeError> {
        if self.is_at_end() {
            return Ok(None);
        }
        let start = self.pos;
        let byte = self.bytes[start];
        let op = Op::try_from(byte)
            .map_err(|byte| DecodeError::UnknownOpcode { offset: start, byte })?;
        self.pos += 1;
        let decoded = self.decode_op(start, op);
        if decoded.is_err() {
            self.pos = start;
        }
        decoded.map(Some)
    }

    fn decode_op(&mut self, start: usize, op: Op) -> Result<Instruction, DecodeError> {
        let invalid = |value: u32| DecodeError::InvalidOperand { offset: start, op, value };

        let instruction = match op {
            Op::Noop => Instruction::Noop,
            Op::Nil => Instruction::Nil,
            Op::Undef => Instruction::Undef,
            Op::True => Instruction::True,
            Op::False => Instruction::False,
            Op::I64 => Instruction::I64 { value: self.read_u64(start, op)? as i64 },
            Op::Dbl => Instruction::Dbl { value: f64::from_bits(self.read_u64(start, op)?) },
            Op::Chr => {
                let raw = self.read_u32(start, op)?;
                let value = char::from_u32(raw).ok_or(invalid(raw))?;
                Instruction::Chr { value }
            }
            Op::Literal => Instruction::Literal { address: self.read_u32(start, op)? },
            Op::String => Instruction::String { address: self.read_u32(start, op)? },
            Op::Url => Instruction::Url { address: self.read_u32(start, op)? },
            Op::Synthetic => {
                let raw = self.read_u8(start, op)?;
                let kind = Synthetic::try_from(raw).map_err(|b| invalid(b as u32))?;
                Instruction::Synthetic { kind }
            }
            Op::Descriptor => {
                let raw = self.read_u8(start, op)?;
                let address = self.read_u32(start, op)?;
                let section = Section::try_from(raw).map_err(|b| invalid(b as u32))?;
                Instruction::Descriptor { section, address }
            }
            Op::Load => {
                let raw = self.read_u8(start, op)?;
                let address = self.read_u32(start, op)?;
                let target = LoadTarget::try_from(raw).map_err(|b| invalid(b as u32))?;
                Instruction::Load { target, address }
            }
            Op::Store => {
                let raw = self.read_u8(start, op)?;
                let address = self.read_u32(start, op)?;
                let target = StoreTarget::try_from(raw).map_err(|b| invalid(b as u32))?;
                Instruction::Store { target, address }
            }

            Op::VaLoad => Instruction::VaLoad,
            Op::VaSize => Instruction::VaSize,

            Op::Pop => Instruction::Pop,
            Op::Dup => Instruction::Dup,
            Op::Pick => Instruction::Pick { offset: self.read_u16(start, op)? },
            Op::Drop => Instruction::Drop { offset: self.read_u16(start, op)? },
            Op::RPick => Instruction::RPick { offset: self.read_u16(start, op)? },
            Op::RDrop => Instruction::RDrop { offset: self.read_u16(start, op)? },

            Op::I64Add => Instruction::I64Add,
            Op::I64Sub => Instruction::I64Sub,
            Op::I64Mul => Instruction::I64Mul,
            Op::I64Div => Instruction::I64Div,
            Op::I64Neg => Instruction::I64Neg,
            Op::DblAdd => Instruction::DblAdd,
            Op::DblSub => Instruction::DblSub,
            Op::DblMul => Instruction::DblMul,
            Op::DblDiv => Instruction::DblDiv,
            Op::DblNeg => Instruction::DblNeg,

            Op::BoolCmp => Instruction::BoolCmp,
            Op::I64Cmp => Instruction::I64Cmp,
            Op::DblCmp => Instruction::DblCmp,
            Op::ChrCmp => Instruction::ChrCmp,
            Op::TypeCmp => Instruction::TypeCmp,

            Op::LogicalAnd => Instruction::LogicalAnd,
            Op::LogicalOr => Instruction::LogicalOr,
            Op::LogicalNot => Instruction::LogicalNot,

            Op::Jump => Instruction::Jump { delta: self.read_u16(start, op)? as i16 },
            Op::IfNil
            | Op::IfNotNil
            | Op::IfTrue
            | Op::IfFalse
            | Op::IfZero
            | Op::IfNotZero
            | Op::IfGt
            | Op::IfGe
            | Op::IfLt
            | Op::IfLe => {
                let delta = self.read_u16(start, op)? as i16;
                let condition = Condition::from_op(op).ok_or(invalid(op as u32))?;
                Instruction::Branch { condition, delta }
            }

            Op::CallStatic | Op::CallVirtual | Op::CallConcept | Op::CallExistential => {
                let raw = self.read_u8(start, op)?;
                let address = self.read_u32(start, op)?;
                let placement = self.read_u16(start, op)?;
                let flags = CallFlags::from_bits(raw).ok_or(invalid(raw as u32))?;
                match op {
                    Op::CallStatic => Instruction::CallStatic { flags, address, placement },
                    Op::CallVirtual => Instruction::CallVirtual { flags, address, placement },
                    Op::CallConcept => Instruction::CallConcept { flags, address, placement },
                    _ => Instruction::CallExistential { flags, address, placement },
                }
            }
            Op::Trap => {
                let raw = self.read_u8(start, op)?;
                let index = self.read_u32(start, op)?;
                let flags = TrapFlags::from_bits(raw).ok_or(invalid(raw as u32))?;
                Instruction::Trap { flags, index }
            }
            Op::Return => Instruction::Return,

            Op::New => {
                let raw = self.read_u8(start, op)?;
                let address = self.read_u32(start, op)?;
                let placement = self.read_u16(start, op)?;
                let (type_bits, flags) = unpack_new_flags(raw);
                let new_type = NewType::try_from(type_bits).map_err(|_| invalid(raw as u32))?;
                Instruction::New { new_type, flags, address, placement }
            }

            Op::TypeOf => Instruction::TypeOf,
            Op::Interrupt => Instruction::Interrupt,
            Op::Halt => Instruction::Halt,
            Op::Abort => Instruction::Abort,
        };
        Ok(instruction)
    }

    fn take<const N: usize>(&mut self, start: usize, op: Op) -> Result<[u8; N], DecodeError> {
        let end = self.pos + N;
        let slice = self
            .bytes
            .get(self.pos..end)
            .ok_or(DecodeError::Truncated { offset: start, op })?;
        let mut out = [0u8; N];
        out.copy_from_slice(slice);
        self.pos = end;
        Ok(out)
    }

    #[inline(always)]
    fn read_u8(&mut self, start: usize, op: Op) -> Result<u8, DecodeError> {
        Ok(self.take::<1>(start, op)?[0])
    }

    #[inline(always)]
    fn read_u16(&mut self, start: usize, op: Op) -> Result<u16, DecodeError> {
        Ok(u16::from_le_bytes(self.take(start, op)?))
    }

    #[inline(always)]
    fn read_u32(&mut self, start: usize, op: Op) -> Result<u32, DecodeError> {
        Ok(u32::from_le_bytes(self.take(start, op)?))
    }

    #[inline(always)]
    fn read_u64(&mut self, start: usize, op: Op) -> Result<u64, DecodeError> {
        Ok(u64::from_le_bytes(self.take(start, op)?))
    }
}

impl<'a> Iterator for BytecodeDecoder<'a> {
    type Item = Result<Instruction, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.decode_next() {
            Ok(Some(instruction)) => Some(Ok(instruction)),
            Ok(None) => None,
            Err(err) => {
                // stop after the first error
                self.pos = self.bytes.len();
                Some(Err(err))
            }
        }
    }
}
