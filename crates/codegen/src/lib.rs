//! Assemble flow graphs of symbolic instructions into stackasm code objects,
//! folding constants and running peephole optimizations on the way.

type IndexSet<T> = indexmap::IndexSet<T, ahash::RandomState>;

pub mod ast;
pub mod ast_opt;
pub mod byte_opt;
pub mod compile;
pub mod consts;
pub mod error;
pub mod fold;
pub mod ir;
pub mod peephole;

pub use compile::{CompileOpts, compile_graph, optimize_ast};
pub use error::{CodegenError, FoldError, InternalError};
pub use fold::FoldLimits;
pub use ir::{BlockIdx, CodeUnitMetadata, FlowGraph, Operand};

pub type InternalResult<T> = Result<T, InternalError>;
