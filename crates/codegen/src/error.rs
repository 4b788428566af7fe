use core::fmt;
use stackasm_compiler_core::{Opcode, OpcodeError};
use thiserror::Error;

/// A structural error raised while assembling one compiled unit.
#[derive(Error, Debug)]
pub struct CodegenError {
    /// Name of the unit that failed, e.g. `<module>` or a function name.
    pub unit: String,
    #[source]
    pub error: InternalError,
    pub source_path: String,
}

impl fmt::Display for CodegenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.unit, self.source_path, self.error)
    }
}

/// Broken invariants of a flow graph. These point at a bug in whoever built
/// the graph, never at the program being compiled.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum InternalError {
    #[error("stack overflow")]
    StackOverflow,
    #[error("stack underflow")]
    StackUnderflow,
    #[error("block {block} is reached with stack depth {found}, expected {expected}")]
    UnbalancedStack {
        block: u32,
        expected: u32,
        found: u32,
    },
    #[error("{opcode} jumps to a block that is not part of the emitted code")]
    DanglingJump { opcode: Opcode },
    #[error("{opcode} is a forward-only jump but its target precedes it")]
    BackwardRelativeJump { opcode: Opcode },
    #[error("{opcode} does not take this kind of operand")]
    OperandMismatch { opcode: Opcode },
    #[error(transparent)]
    UnsupportedOpcode(#[from] OpcodeError),
    #[error(
        "The symbol '{0}' must be present in the symbol table, even when it is undefined in python."
    )]
    MissingSymbol(String),
}

/// Why a constant expression was left unevaluated.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FoldError {
    /// The result would exceed a [`FoldLimits`](crate::fold::FoldLimits) cap.
    #[error("result exceeds the folding size limit")]
    Overflow,
    #[error("division by zero")]
    ZeroDivision,
    #[error("negative shift count")]
    NegativeShift,
    #[error("index out of range")]
    IndexOutOfRange,
    /// The operation would raise or is not evaluated at compile time.
    #[error("cannot fold {0}")]
    Unsupported(&'static str),
}
