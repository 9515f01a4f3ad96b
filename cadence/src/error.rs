use std::fmt;

use cadence_bytecode::DecodeError;

/// Failure classes reported by the interpreter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InterpreterCondition {
    RuntimeInvariant,
    /// First (left-hand or only) stack operand has the wrong shape.
    InvalidDataStackV1,
    /// Second (right-hand) stack operand has the wrong shape.
    InvalidDataStackV2,
    InvalidReceiver,
    InvalidOperandJumpV1,
    InvalidOperandFlagsAddressV1,
    InvalidOperandFlagsAddressV2,
    InvalidOperandTypeV1,
    ExceededMaximumRecursion,
    MissingDescriptor,
    DecodeFailed,
    Interrupted,
    Aborted,
}

impl InterpreterCondition {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RuntimeInvariant => "runtime invariant",
            Self::InvalidDataStackV1 => "invalid data stack (v1)",
            Self::InvalidDataStackV2 => "invalid data stack (v2)",
            Self::InvalidReceiver => "invalid receiver",
            Self::InvalidOperandJumpV1 => "invalid jump operand",
            Self::InvalidOperandFlagsAddressV1 => "invalid flags/address operand (v1)",
            Self::InvalidOperandFlagsAddressV2 => "invalid flags/address operand (v2)",
            Self::InvalidOperandTypeV1 => "invalid type operand",
            Self::ExceededMaximumRecursion => "exceeded maximum recursion",
            Self::MissingDescriptor => "missing descriptor",
            Self::DecodeFailed => "decode failed",
            Self::Interrupted => "interrupted",
            Self::Aborted => "aborted",
        }
    }

    /// Whether the condition is a controlled host-visible exit rather than a
    /// fault.
    pub fn is_controlled_exit(self) -> bool {
        matches!(self, Self::Interrupted | Self::Aborted)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterpreterError {
    pub condition: InterpreterCondition,
    pub message: String,
}

impl InterpreterError {
    pub fn new(condition: InterpreterCondition, message: impl Into<String>) -> Self {
        Self {
            condition,
            message: message.into(),
        }
    }

    pub fn invariant(message: impl Into<String>) -> Self {
        Self::new(InterpreterCondition::RuntimeInvariant, message)
    }

    pub fn lhs(message: impl Into<String>) -> Self {
        Self::new(InterpreterCondition::InvalidDataStackV1, message)
    }

    pub fn rhs(message: impl Into<String>) -> Self {
        Self::new(InterpreterCondition::InvalidDataStackV2, message)
    }

    pub fn receiver(message: impl Into<String>) -> Self {
        Self::new(InterpreterCondition::InvalidReceiver, message)
    }

    pub fn missing(message: impl Into<String>) -> Self {
        Self::new(InterpreterCondition::MissingDescriptor, message)
    }
}

impl fmt::Display for InterpreterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.condition.as_str())
        } else {
            write!(f, "{}: {}", self.condition.as_str(), self.message)
        }
    }
}

impl std::error::Error for InterpreterError {}

impl From<DecodeError> for InterpreterError {
    fn from(err: DecodeError) -> Self {
        let condition = match err {
            DecodeError::InvalidOperand { .. } => {
                InterpreterCondition::InvalidOperandFlagsAddressV1
            }
            _ => InterpreterCondition::DecodeFailed,
        };
        Self::new(condition, err.to_string())
    }
}

pub type InterpreterResult<T> = Result<T, InterpreterError>;
