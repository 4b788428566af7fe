//! Compilation entry points for one unit: AST folding before the graph is
//! built, and the graph-to-code-object pipeline after.

use crate::{ast::Stmt, ast_opt, error::CodegenError, fold::FoldLimits, ir::FlowGraph};
use stackasm_compiler_core::{BytecodeVersion, CodeObject, OpcodeTable};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompileOpts {
    /// How optimized the bytecode output should be; any optimize > 0 makes
    /// `__debug__` false
    pub optimize: u8,
    /// Run the optimizer on the flow graph before it is flattened.
    pub peephole: bool,
    /// Run the optimizer on the encoded code units.
    pub byte_peephole: bool,
    /// Upper bound on byte-level passes; they stop early once nothing changes.
    pub peephole_max_passes: usize,
    /// Reject graphs that reach a block with two different stack depths.
    pub verify_stack_balance: bool,
    pub version: BytecodeVersion,
    pub ast_limits: FoldLimits,
    pub bytecode_limits: FoldLimits,
}

impl Default for CompileOpts {
    fn default() -> Self {
        Self {
            optimize: 0,
            peephole: true,
            byte_peephole: true,
            peephole_max_passes: 4,
            verify_stack_balance: false,
            version: BytecodeVersion::default(),
            ast_limits: FoldLimits::ast(),
            bytecode_limits: FoldLimits::default(),
        }
    }
}

impl CompileOpts {
    /// Opcode table graphs should be built against.
    pub fn spec(&self) -> &'static OpcodeTable {
        OpcodeTable::for_version(self.version)
    }
}

/// Folds constants in a module body.
pub fn optimize_ast(body: Vec<Stmt>, opts: &CompileOpts) -> Vec<Stmt> {
    ast_opt::fold_module(body, opts.optimize, &opts.ast_limits)
}

/// Turns a finished flow graph into a code object.
pub fn compile_graph(graph: FlowGraph<'_>, opts: &CompileOpts) -> Result<CodeObject, CodegenError> {
    let unit = graph.metadata.name.clone();
    let source_path = graph.source_path.clone();
    graph
        .finalize_code(opts)
        .map_err(|error| CodegenError {
            unit,
            error,
            source_path,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::InternalError,
        ir::{CodeUnitMetadata, Operand},
    };
    use stackasm_compiler_core::{ConstantData, Opcode};

    fn add_two_constants(opts: &CompileOpts) -> CodeObject {
        let mut graph = FlowGraph::new(CodeUnitMetadata::new("<module>"), opts.spec());
        graph.set_lineno(1);
        graph
            .emit(Opcode::LoadConst, Operand::Const(ConstantData::int(2)))
            .unwrap();
        graph
            .emit(Opcode::LoadConst, Operand::Const(ConstantData::int(3)))
            .unwrap();
        graph.emit(Opcode::BinaryAdd, Operand::None).unwrap();
        graph.emit(Opcode::ReturnValue, Operand::None).unwrap();
        compile_graph(graph, opts).unwrap()
    }

    #[test]
    fn test_folds_with_either_optimizer() {
        let graph_only = CompileOpts {
            byte_peephole: false,
            ..Default::default()
        };
        let bytes_only = CompileOpts {
            peephole: false,
            ..Default::default()
        };
        for opts in [CompileOpts::default(), graph_only, bytes_only] {
            let code = add_two_constants(&opts);
            let ops = code.ops();
            assert_eq!(ops.len(), 2, "{opts:?}");
            assert_eq!(ops[1], (Some(Opcode::ReturnValue), 0));
            assert_eq!(
                code.constants[ops[0].1 as usize],
                ConstantData::int(5),
                "{opts:?}"
            );
        }
    }

    #[test]
    fn test_unoptimized_keeps_the_stream() {
        let opts = CompileOpts {
            peephole: false,
            byte_peephole: false,
            ..Default::default()
        };
        let code = add_two_constants(&opts);
        assert_eq!(code.ops().len(), 4);
        assert_eq!(code.max_stackdepth, 2);
        assert_eq!(code.first_line_number, 1);
    }

    #[test]
    fn test_errors_name_the_unit() {
        let opts = CompileOpts {
            peephole: false,
            ..Default::default()
        };
        let mut graph = FlowGraph::new(CodeUnitMetadata::new("f"), opts.spec());
        graph.source_path = "mod.py".to_owned();
        let nowhere = graph.new_block();
        graph.emit_jump(Opcode::JumpAbsolute, nowhere).unwrap();
        let err = compile_graph(graph, &opts).unwrap_err();
        assert_eq!(err.unit, "f");
        assert_eq!(err.source_path, "mod.py");
        assert_eq!(
            err.error,
            InternalError::DanglingJump {
                opcode: Opcode::JumpAbsolute
            }
        );
    }
}
