//! This is the `stackasm` facade. It re-exports the bytecode model from
//! [`stackasm-compiler-core`](compiler_core) and the assembler pipeline from
//! [`stackasm-codegen`](codegen).
//!
//! A code generator builds one [`FlowGraph`] per function, module or lambda
//! and hands it to [`compile_unit`]:
//!
//! ```
//! use stackasm::{CodeUnitMetadata, CompileOpts, Operand, compile_unit};
//! use stackasm::compiler_core::{ConstantData, Opcode};
//!
//! let opts = CompileOpts::default();
//! let code = compile_unit(CodeUnitMetadata::new("<module>"), &opts, |graph| {
//!     graph.set_lineno(1);
//!     graph.emit(Opcode::LoadConst, Operand::Const(ConstantData::int(6)))?;
//!     graph.emit(Opcode::LoadConst, Operand::Const(ConstantData::int(7)))?;
//!     graph.emit(Opcode::BinaryMultiply, Operand::None)?;
//!     graph.emit(Opcode::ReturnValue, Operand::None)
//! })
//! .unwrap();
//! assert_eq!(code.ops().len(), 2);
//! ```

#[macro_use]
extern crate log;

pub mod settings;

pub use stackasm_codegen as codegen;
pub use stackasm_compiler_core as compiler_core;

pub use stackasm_codegen::{
    CodeUnitMetadata, CodegenError, CompileOpts, FlowGraph, FoldLimits, InternalError,
    InternalResult, Operand, compile_graph, optimize_ast,
};
pub use stackasm_compiler_core::{BytecodeVersion, CodeObject};

/// Builds a unit with `build` against the opcode table `opts` selects and
/// assembles it.
pub fn compile_unit<F>(
    metadata: CodeUnitMetadata,
    opts: &CompileOpts,
    build: F,
) -> Result<CodeObject, CodegenError>
where
    F: FnOnce(&mut FlowGraph<'_>) -> InternalResult<()>,
{
    let mut graph = FlowGraph::new(metadata, opts.spec());
    if let Err(error) = build(&mut graph) {
        return Err(CodegenError {
            unit: graph.metadata.name,
            error,
            source_path: graph.source_path,
        });
    }
    trace!("{}:\n{graph}", graph.metadata.name);
    compile_graph(graph, opts)
}
