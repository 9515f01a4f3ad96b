use core::fmt;

use bitflags::bitflags;

use crate::op::Op;

macro_rules! operand_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident = $value:expr),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u8)]
        pub enum $name {
            $($variant = $value),+
        }

        impl TryFrom<u8> for $name {
            type Error = u8;

            fn try_from(byte: u8) -> Result<Self, u8> {
                match byte {
                    $($value => Ok(Self::$variant),)+
                    other => Err(other),
                }
            }
        }
    };
}

operand_enum!(
    /// Slot addressed by a `Load`.
    LoadTarget {
        Argument = 0x01,
        Local = 0x02,
        Lexical = 0x03,
        Field = 0x04,
        Static = 0x05,
        Instance = 0x06,
        Enum = 0x07,
    }
);

operand_enum!(
    /// Slot addressed by a `Store`.
    StoreTarget {
        Argument = 0x01,
        Local = 0x02,
        Lexical = 0x03,
        Field = 0x04,
        Static = 0x05,
    }
);

operand_enum!(
    Synthetic {
        This = 0x01,
        Rest = 0x02,
    }
);

operand_enum!(
    /// Kind of descriptor a `New` allocates from.
    NewType {
        Class = 0x01,
        Enum = 0x02,
        Instance = 0x03,
        Struct = 0x04,
    }
);

operand_enum!(
    /// Frame slot a captured lexical is copied from.
    LexicalTarget {
        Argument = 0x01,
        Local = 0x02,
    }
);

operand_enum!(
    /// Descriptor table a descriptor address points into.
    Section {
        Type = 0x01,
        Existential = 0x02,
        Literal = 0x03,
        Call = 0x04,
        Field = 0x05,
        Static = 0x06,
        Action = 0x07,
        Class = 0x08,
        Struct = 0x09,
        Instance = 0x0a,
        Concept = 0x0b,
        Enum = 0x0c,
        Namespace = 0x0d,
    }
);

operand_enum!(
    /// Condition tested by a conditional jump.
    Condition {
        Nil = 0x01,
        NotNil = 0x02,
        True = 0x03,
        False = 0x04,
        Zero = 0x05,
        NotZero = 0x06,
        Gt = 0x07,
        Ge = 0x08,
        Lt = 0x09,
        Le = 0x0a,
    }
);

bitflags! {
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct CallFlags: u8 {
        /// The receiver is pushed after the arguments.
        const RECEIVER_FOLLOWS = 0x01;
        /// Append the caller's rest arguments to the placement.
        const FORWARD_REST = 0x02;
    }
}

bitflags! {
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TrapFlags: u8 {
        /// The trap index is popped from the data stack; the operand must be 0.
        const INDEX_FOLLOWS = 0x01;
    }
}

const NEW_TYPE_MASK: u8 = 0x70;
const CALL_FLAGS_MASK: u8 = 0x0f;

/// Pack a `New` flags byte: bits 4..6 carry the type, low bits the call flags.
pub const fn pack_new_flags(new_type: NewType, flags: CallFlags) -> u8 {
    ((new_type as u8) << 4) | (flags.bits() & CALL_FLAGS_MASK)
}

/// Split a `New` flags byte into its raw type bits and call flags.
pub const fn unpack_new_flags(byte: u8) -> (u8, CallFlags) {
    (
        (byte & NEW_TYPE_MASK) >> 4,
        CallFlags::from_bits_truncate(byte & CALL_FLAGS_MASK),
    )
}

impl Condition {
    pub const fn op(self) -> Op {
        match self {
            Condition::Nil => Op::IfNil,
            Condition::NotNil => Op::IfNotNil,
            Condition::True => Op::IfTrue,
            Condition::False => Op::IfFalse,
            Condition::Zero => Op::IfZero,
            Condition::NotZero => Op::IfNotZero,
            Condition::Gt => Op::IfGt,
            Condition::Ge => Op::IfGe,
            Condition::Lt => Op::IfLt,
            Condition::Le => Op::IfLe,
        }
    }

    pub const fn from_op(op: Op) -> Option<Condition> {
        Some(match op {
            Op::IfNil => Condition::Nil,
            Op::IfNotNil => Condition::NotNil,
            Op::IfTrue => Condition::True,
            Op::IfFalse => Condition::False,
            Op::IfZero => Condition::Zero,
            Op::IfNotZero => Condition::NotZero,
            Op::IfGt => Condition::Gt,
            Op::IfGe => Condition::Ge,
            Op::IfLt => Condition::Lt,
            Op::IfLe => Condition::Le,
            _ => return None,
        })
    }
}

/// A decoded instruction with its operands.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Instruction {
    Noop,
    Nil,
    Undef,
    True,
    False,
    I64 { value: i64 },
    Dbl { value: f64 },
    Chr { value: char },
    Literal { address: u32 },
    String { address: u32 },
    Url { address: u32 },
    Synthetic { kind: Synthetic },
    Descriptor { section: Section, address: u32 },
    Load { target: LoadTarget, address: u32 },
    Store { target: StoreTarget, address: u32 },

    VaLoad,
    VaSize,

    Pop,
    Dup,
    Pick { offset: u16 },
    Drop { offset: u16 },
    RPick { offset: u16 },
    RDrop { offset: u16 },

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

    BoolCmp,
    I64Cmp,
    DblCmp,
    ChrCmp,
    TypeCmp,

    LogicalAnd,
    LogicalOr,
    LogicalNot,

    Branch { condition: Condition, delta: i16 },
    Jump { delta: i16 },

    CallStatic { flags: CallFlags, address: u32, placement: u16 },
    CallVirtual { flags: CallFlags, address: u32, placement: u16 },
    CallConcept { flags: CallFlags, address: u32, placement: u16 },
    CallExistential { flags: CallFlags, address: u32, placement: u16 },
    Trap { flags: TrapFlags, index: u32 },
    Return,

    New { new_type: NewType, flags: CallFlags, address: u32, placement: u16 },

    TypeOf,
    Interrupt,
    Halt,
    Abort,
}

impl Instruction {
    pub const fn op(&self) -> Op {
        match self {
            Self::Noop => Op::Noop,
            Self::Nil => Op::Nil,
            Self::Undef => Op::Undef,
            Self::True => Op::True,
            Self::False => Op::False,
            Self::I64 { .. } => Op::I64,
            Self::Dbl { .. } => Op::Dbl,
            Self::Chr { .. } => Op::Chr,
            Self::Literal { .. } => Op::Literal,
            Self::String { .. } => Op::String,
            Self::Url { .. } => Op::Url,
            Self::Synthetic { .. } => Op::Synthetic,
            Self::Descriptor { .. } => Op::Descriptor,
            Self::Load { .. } => Op::Load,
            Self::Store { .. } => Op::Store,
            Self::VaLoad => Op::VaLoad,
            Self::VaSize => Op::VaSize,
            Self::Pop => Op::Pop,
            Self::Dup => Op::Dup,
            Self::Pick { .. } => Op::Pick,
            Self::Drop { .. } => Op::Drop,
            Self::RPick { .. } => Op::RPick,
            Self::RDrop { .. } => Op::RDrop,
            Self::I64Add => Op::I64Add,
            Self::I64Sub => Op::I64Sub,
            Self::I64Mul => Op::I64Mul,
            Self::I64Div => Op::I64Div,
            Self::I64Neg => Op::I64Neg,
            Self::DblAdd => Op::DblAdd,
            Self::DblSub => Op::DblSub,
            Self::DblMul => Op::DblMul,
            Self::DblDiv => Op::DblDiv,
            Self::DblNeg => Op::DblNeg,
            Self::BoolCmp => Op::BoolCmp,
            Self::I64Cmp => Op::I64Cmp,
            Self::DblCmp => Op::DblCmp,
            Self::ChrCmp => Op::ChrCmp,
            Self::TypeCmp => Op::TypeCmp,
            Self::LogicalAnd => Op::LogicalAnd,
            Self::LogicalOr => Op::LogicalOr,
            Self::LogicalNot => Op::LogicalNot,
            Self::Branch { condition, .. } => condition.op(),
            Self::Jump { .. } => Op::Jump,
            Self::CallStatic { .. } => Op::CallStatic,
            Self::CallVirtual { .. } => Op::CallVirtual,
            Self::CallConcept { .. } => Op::CallConcept,
            Self::CallExistential { .. } => Op::CallExistential,
            Self::Trap { .. } => Op::Trap,
            Self::Return => Op::Return,
            Self::New { .. } => Op::New,
            Self::TypeOf => Op::TypeOf,
            Self::Interrupt => Op::Interrupt,
            Self::Halt => Op::Halt,
            Self::Abort => Op::Abort,
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::I64 { value } => write!(f, "I64 {value}"),
            Self::Dbl { value } => write!(f, "Dbl {value:?}"),
            Self::Chr { value } => write!(f, "Chr {value:?}"),
            Self::Literal { address } => write!(f, "Literal #{address}"),
            Self::String { address } => write!(f, "String #{address}"),
            Self::Url { address } => write!(f, "Url #{address}"),
            Self::Synthetic { kind } => write!(f, "Synthetic {kind:?}"),
            Self::Descriptor { section, address } => {
                write!(f, "Descriptor {section:?} #{address}")
            }
            Self::Load { target, address } => write!(f, "Load {target:?} #{address}"),
            Self::Store { target, address } => {
                write!(f, "Store {target:?} #{address}")
            }
            Self::Pick { offset } => write!(f, "Pick {offset}"),
            Self::Drop { offset } => write!(f, "Drop {offset}"),
            Self::RPick { offset } => write!(f, "RPick {offset}"),
            Self::RDrop { offset } => write!(f, "RDrop {offset}"),
            Self::Branch { condition, delta } => {
                write!(f, "{:?} {delta:+}", condition.op())
            }
            Self::Jump { delta } => write!(f, "Jump {delta:+}"),
            Self::CallStatic { flags, address, placement }
            | Self::CallVirtual { flags, address, placement }
            | Self::CallConcept { flags, address, placement }
            | Self::CallExistential { flags, address, placement } => {
                write!(f, "{:?} #{address} ({placement})", self.op())?;
                if !flags.is_empty() {
                    write!(f, " {flags:?}")?;
                }
                Ok(())
            }
            Self::Trap { flags, index } => {
                if flags.contains(TrapFlags::INDEX_FOLLOWS) {
                    write!(f, "Trap <stack>")
                } else {
                    write!(f, "Trap #{index}")
                }
            }
            Self::New { new_type, flags, address, placement } => {
                write!(f, "New {new_type:?} #{address} ({placement})")?;
                if !flags.is_empty() {
                    write!(f, " {flags:?}")?;
                }
                Ok(())
            }
            other => write!(f, "{:?}", other.op()),
        }
    }
}
