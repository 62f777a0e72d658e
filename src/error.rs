use thiserror::Error;

/// Everything that can stop an emulated run.
///
/// Emulated CPU conditions (divide faults) are ordinary values here, not
/// panics: the driver decides whether to resume. Decode faults are terminal
/// for a run because instruction alignment past the bad byte cannot be
/// trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum EmulatorError {
    #[error("invalid opcode {byte:#04x} at {addr:#x}")]
    InvalidOpcode { addr: u64, byte: u8 },
    #[error("invalid two-byte opcode 0f {byte:#04x} at {addr:#x}")]
    InvalidOpcode2 { addr: u64, byte: u8 },
    #[error("unsupported prefix {byte:#04x} at {addr:#x}")]
    InvalidPrefix { addr: u64, byte: u8 },
    #[error("malformed operand encoding at {addr:#x}")]
    InvalidOperand { addr: u64 },
    #[error("divide by zero at {addr:#x}")]
    DivideByZero { addr: u64 },
    #[error("division overflow at {addr:#x}")]
    DivisionOverflow { addr: u64 },
}

impl EmulatorError {
    /// Address of the instruction that raised the condition.
    pub fn address(&self) -> u64 {
        match *self {
            EmulatorError::InvalidOpcode { addr, .. }
            | EmulatorError::InvalidOpcode2 { addr, .. }
            | EmulatorError::InvalidPrefix { addr, .. }
            | EmulatorError::InvalidOperand { addr }
            | EmulatorError::DivideByZero { addr }
            | EmulatorError::DivisionOverflow { addr } => addr,
        }
    }

    /// Divide faults mirror a CPU exception vector: the driver may
    /// acknowledge and resume. Decode faults may not be resumed.
    pub fn is_resumable(&self) -> bool {
        matches!(
            self,
            EmulatorError::DivideByZero { .. } | EmulatorError::DivisionOverflow { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, EmulatorError>;
