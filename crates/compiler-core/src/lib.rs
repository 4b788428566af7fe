//! Shared bytecode model: opcode tables, operands, constants, code objects
//! and line number tables.

extern crate alloc;

pub mod bytecode;
pub mod lnotab;
pub mod opcode;

pub use bytecode::{CodeFlags, CodeObject, CodeUnit, ComparisonOperator, ConstantData, OpArg};
pub use opcode::{BytecodeVersion, JumpKind, JumpUnit, Opcode, OpcodeError, OpcodeSpec, OpcodeTable};
