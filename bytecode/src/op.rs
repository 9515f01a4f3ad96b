/// Bytecode opcodes.
///
/// Every opcode is a single byte followed by fixed-width little-endian
/// operands. Addresses are 32-bit, jump deltas are signed 16-bit and
/// placement/pick/drop counts are 16-bit. Byte `0x00` is never a valid
/// opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Op {
    /// Does nothing.
    Noop = 0x01,

    /// Push `nil`.
    Nil,
    /// Push `undef`.
    Undef,
    /// Push boolean `true`.
    True,
    /// Push boolean `false`.
    False,
    /// Push an integer immediate.
    /// Operands: `value:i64`
    I64,
    /// Push a float immediate.
    /// Operands: `value:f64`
    Dbl,
    /// Push a character immediate.
    /// Operands: `value:u32` (unicode scalar)
    Chr,
    /// Push a literal from the literal table.
    /// Operands: `address:u32`
    Literal,
    /// Allocate a string from a UTF-8 literal and push it.
    /// Operands: `address:u32`
    String,
    /// Allocate a url from a UTF-8 literal and push it.
    /// Operands: `address:u32`
    Url,
    /// Push a synthetic value of the current frame.
    /// Operands: `kind:u8`
    Synthetic,
    /// Push a descriptor reference.
    /// Operands: `section:u8`, `address:u32`
    Descriptor,
    /// Load from an addressed slot and push the value.
    /// Operands: `target:u8`, `address:u32`
    Load,
    /// Pop a value and store it into an addressed slot.
    /// Operands: `target:u8`, `address:u32`
    Store,

    /// Push the rest argument at the index popped from the stack.
    VaLoad,
    /// Push the number of rest arguments.
    VaSize,

    /// Discard the top of the stack.
    Pop,
    /// Duplicate the top of the stack.
    Dup,
    /// Push a copy of the value at a forward offset from the stack bottom.
    /// Operands: `offset:u16`
    Pick,
    /// Remove the value at a forward offset from the bottom.
    /// Operands: `offset:u16`
    Drop,
    /// Push a copy of the value at a reverse offset from the top.
    /// Operands: `offset:u16`
    RPick,
    /// Remove the value at a reverse offset from the top.
    /// Operands: `offset:u16`
    RDrop,

    I64Add,
    I64Sub,
    I64Mul,
    I64Div,
    I64Neg,

    DblAdd,
    DblSub,
    DblMul,
    DblDiv,
    DblNeg,

    /// Compare two values of the same scalar kind, pushing -1, 0 or 1.
    BoolCmp,
    I64Cmp,
    DblCmp,
    ChrCmp,
    /// Compare two type descriptors, pushing -1 (extends), 0 (equal) or 1.
    TypeCmp,

    LogicalAnd,
    LogicalOr,
    LogicalNot,

    /// Conditional relative jumps.
    /// Operands: `delta:i16` (relative to end of instruction)
    IfNil,
    IfNotNil,
    IfTrue,
    IfFalse,
    IfZero,
    IfNotZero,
    IfGt,
    IfGe,
    IfLt,
    IfLe,
    /// Unconditional relative jump.
    /// Operands: `delta:i16`
    Jump,

    /// Call a proc directly.
    /// Operands: `flags:u8`, `address:u32`, `placement:u16`
    CallStatic,
    /// Call a method through the receiver's virtual table.
    /// Operands: `flags:u8`, `address:u32`, `placement:u16`
    CallVirtual,
    /// Call a concept action through a concept descriptor popped first.
    /// Operands: `flags:u8`, `address:u32`, `placement:u16`
    CallConcept,
    /// Call an existential method through an existential descriptor popped first.
    /// Operands: `flags:u8`, `address:u32`, `placement:u16`
    CallExistential,
    /// Invoke a native trap.
    /// Operands: `flags:u8`, `index:u32`
    Trap,
    /// Return from the current frame.
    Return,

    /// Allocate and construct a new instance.
    /// Operands: `flags:u8`, `address:u32`, `placement:u16`
    New,

    /// Replace the top of the stack with its type descriptor.
    TypeOf,
    /// Hand the top of the stack to the inspector and stop.
    Interrupt,
    /// Stop the interpreter, returning the top of the stack.
    Halt,
    /// Stop the interpreter with a fatal condition.
    Abort,
}

impl Op {
    pub const FIRST: u8 = Op::Noop as u8;
    pub const LAST: u8 = Op::Abort as u8;
    pub const COUNT: usize = (Self::LAST - Self::FIRST) as usize + 1;

    /// Whether this opcode is one of the relative jumps.
    pub const fn is_jump(self) -> bool {
        matches!(
            self,
            Op::IfNil
                | Op::IfNotNil
                | Op::IfTrue
                | Op::IfFalse
                | Op::IfZero
                | Op::IfNotZero
                | Op::IfGt
                | Op::IfGe
                | Op::IfLt
                | Op::IfLe
                | Op::Jump
        )
    }

    /// Whether this opcode carries `flags, address, placement` operands.
    pub const fn is_call(self) -> bool {
        matches!(
            self,
            Op::CallStatic
                | Op::CallVirtual
                | Op::CallConcept
                | Op::CallExistential
                | Op::New
        )
    }
}

impl TryFrom<u8> for Op {
    type Error = u8;

    fn try_from(byte: u8) -> Result<Self, u8> {
        if (Self::FIRST..=Self::LAST).contains(&byte) {
            // SAFETY: Op is repr(u8) with contiguous variants from FIRST to LAST.
            Ok(unsafe { core::mem::transmute::<u8, Op>(byte) })
        } else {
            Err(byte)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_is_not_an_opcode() {
        assert_eq!(Op::try_from(0), Err(0));
    }

    #[test]
    fn every_opcode_byte_round_trips() {
        for byte in Op::FIRST..=Op::LAST {
            let op = Op::try_from(byte).expect("valid opcode");
            assert_eq!(op as u8, byte);
        }
        assert_eq!(Op::try_from(Op::LAST + 1), Err(Op::LAST + 1));
    }

    #[test]
    fn jump_and_call_families() {
        assert!(Op::IfLe.is_jump());
        assert!(!Op::Return.is_jump());
        assert!(Op::New.is_call());
        assert!(!Op::Trap.is_call());
    }
}
