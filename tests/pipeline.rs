mod common;

use stackasm::{
    CodeObject, CodeUnitMetadata, CompileOpts, FlowGraph, InternalResult, Operand,
    codegen::byte_opt,
    compile_unit,
    compiler_core::{BytecodeVersion, ConstantData, Opcode, lnotab},
};

use common::{Outcome, run};

fn compile(
    opts: &CompileOpts,
    build: impl FnOnce(&mut FlowGraph<'_>) -> InternalResult<()>,
) -> CodeObject {
    let _ = env_logger::builder().is_test(true).try_init();
    compile_unit(CodeUnitMetadata::new("<module>"), opts, build).unwrap()
}

fn unoptimized() -> CompileOpts {
    CompileOpts {
        peephole: false,
        byte_peephole: false,
        ..Default::default()
    }
}

fn bytes_only() -> CompileOpts {
    CompileOpts {
        peephole: false,
        ..Default::default()
    }
}

fn all_configs() -> Vec<CompileOpts> {
    let mut configs = Vec::new();
    for version in [BytecodeVersion::Standard, BytecodeVersion::Legacy] {
        for opts in [
            unoptimized(),
            CompileOpts::default(),
            bytes_only(),
            CompileOpts {
                byte_peephole: false,
                ..Default::default()
            },
        ] {
            configs.push(CompileOpts { version, ..opts });
        }
    }
    configs
}

fn int(value: i64) -> Operand {
    Operand::Const(ConstantData::int(value))
}

fn name(id: &str) -> Operand {
    Operand::Name(id.to_owned())
}

fn has_op(code: &CodeObject, op: Opcode) -> bool {
    code.ops().iter().any(|&(o, _)| o == Some(op))
}

/// Compiles `build` under every configuration and checks they all agree with
/// the unoptimized code.
fn differential<F>(build: F, env: &[(&str, ConstantData)]) -> Outcome
where
    F: Fn(&mut FlowGraph<'_>) -> InternalResult<()>,
{
    let reference = run(&compile(&unoptimized(), &build), env).unwrap();
    for opts in all_configs() {
        let code = compile(&opts, &build);
        let outcome = run(&code, env).unwrap_or_else(|e| panic!("{opts:?}: {e}"));
        assert_eq!(outcome.value, reference.value, "{opts:?}");
        assert_eq!(outcome.names, reference.names, "{opts:?}");
    }
    reference
}

#[test]
fn test_constant_addition_folds() {
    let build = |g: &mut FlowGraph<'_>| {
        g.set_lineno(1);
        g.emit(Opcode::LoadConst, int(2))?;
        g.emit(Opcode::LoadConst, int(3))?;
        g.emit(Opcode::BinaryAdd, Operand::None)?;
        g.emit(Opcode::ReturnValue, Operand::None)
    };
    for opts in [CompileOpts::default(), bytes_only()] {
        let code = compile(&opts, build);
        let ops = code.ops();
        assert_eq!(ops.len(), 2);
        assert_eq!(ops[0].0, Some(Opcode::LoadConst));
        assert_eq!(code.constants[ops[0].1 as usize], ConstantData::int(5));
    }
    assert_eq!(differential(build, &[]).value, ConstantData::int(5));
}

fn constant_branch(cond: bool) -> impl Fn(&mut FlowGraph<'_>) -> InternalResult<()> {
    move |g| {
        let orelse = g.new_block();
        g.set_lineno(1);
        g.emit(Opcode::LoadConst, Operand::Const(ConstantData::Boolean { value: cond }))?;
        g.emit_jump(Opcode::PopJumpIfFalse, orelse)?;
        g.next_block();
        g.set_lineno(2);
        g.emit(Opcode::LoadName, name("a"))?;
        g.emit(Opcode::ReturnValue, Operand::None)?;
        g.switch_to_block(orelse);
        g.set_lineno(4);
        g.emit(Opcode::LoadName, name("b"))?;
        g.emit(Opcode::ReturnValue, Operand::None)
    }
}

#[test]
fn test_constant_conditions() {
    let env = [("a", ConstantData::str("a")), ("b", ConstantData::str("b"))];
    for (cond, expected) in [(true, "a"), (false, "b")] {
        let build = constant_branch(cond);
        assert_eq!(differential(&build, &env).value, ConstantData::str(expected));
        for opts in [CompileOpts::default(), bytes_only()] {
            let code = compile(&opts, &build);
            assert!(!has_op(&code, Opcode::PopJumpIfFalse), "{cond} {opts:?}");
            assert!(!has_op(&code, Opcode::LoadConst), "{cond} {opts:?}");
        }
    }
    // the untaken branch disappears from the graph
    let code = compile(&CompileOpts::default(), constant_branch(true));
    assert_eq!(
        code.ops(),
        vec![(Some(Opcode::LoadName), 0), (Some(Opcode::ReturnValue), 0)]
    );
}

#[test]
fn test_swap_uses_rotation() {
    // a, b = b, a
    let build = |g: &mut FlowGraph<'_>| {
        g.set_lineno(1);
        g.emit(Opcode::LoadName, name("b"))?;
        g.emit(Opcode::LoadName, name("a"))?;
        g.emit(Opcode::BuildTuple, Operand::Raw(2))?;
        g.emit(Opcode::UnpackSequence, Operand::Raw(2))?;
        g.emit(Opcode::StoreName, name("a"))?;
        g.emit(Opcode::StoreName, name("b"))?;
        g.emit(Opcode::LoadName, name("a"))?;
        g.emit(Opcode::LoadName, name("b"))?;
        g.emit(Opcode::BuildTuple, Operand::Raw(2))?;
        g.emit(Opcode::ReturnValue, Operand::None)
    };
    for opts in [CompileOpts::default(), bytes_only()] {
        let code = compile(&opts, build);
        assert!(has_op(&code, Opcode::RotTwo));
        assert!(!has_op(&code, Opcode::UnpackSequence));
    }
    let outcome = differential(
        build,
        &[("a", ConstantData::int(1)), ("b", ConstantData::int(2))],
    );
    assert_eq!(
        outcome.value,
        ConstantData::Tuple {
            elements: vec![ConstantData::int(2), ConstantData::int(1)]
        }
    );
}

fn and_chain(n: usize) -> impl Fn(&mut FlowGraph<'_>) -> InternalResult<()> {
    move |g| {
        let end = g.new_block();
        g.set_lineno(1);
        for i in 0..n {
            g.emit(Opcode::LoadName, name(&format!("x{i}")))?;
            if i + 1 < n {
                g.emit_jump(Opcode::JumpIfFalseOrPop, end)?;
                g.next_block();
            }
        }
        g.switch_to_block(end);
        g.emit(Opcode::ReturnValue, Operand::None)
    }
}

#[test]
fn test_and_chain_has_constant_depth() {
    for n in [2, 20, 40] {
        for opts in all_configs() {
            let code = compile(&opts, and_chain(n));
            assert_eq!(code.max_stackdepth, 1, "{n} {opts:?}");
        }
    }
    let names: Vec<String> = (0..20).map(|i| format!("x{i}")).collect();
    let env: Vec<(&str, ConstantData)> = names
        .iter()
        .enumerate()
        .map(|(i, n)| (n.as_str(), ConstantData::int(if i == 7 { 0 } else { i as i64 + 1 })))
        .collect();
    assert_eq!(differential(and_chain(20), &env).value, ConstantData::int(0));
}

#[test]
fn test_power_overflow_stays_at_runtime() {
    // 2**100 * 2**100
    let build = |g: &mut FlowGraph<'_>| {
        g.set_lineno(1);
        for _ in 0..2 {
            g.emit(Opcode::LoadConst, int(2))?;
            g.emit(Opcode::LoadConst, int(100))?;
            g.emit(Opcode::BinaryPower, Operand::None)?;
        }
        g.emit(Opcode::BinaryMultiply, Operand::None)?;
        g.emit(Opcode::ReturnValue, Operand::None)
    };
    for opts in all_configs() {
        let code = compile(&opts, build);
        assert!(has_op(&code, Opcode::BinaryMultiply), "{opts:?}");
        let too_big = code
            .constants
            .iter()
            .any(|c| matches!(c, ConstantData::Integer { value } if value.bits() > 128));
        assert!(!too_big, "{opts:?}");
    }
    let outcome = differential(build, &[]);
    assert!(matches!(outcome.value, ConstantData::Integer { value } if value.bits() == 201));
}

/// A conditional jump over enough code that both the jump and the constant
/// loads need `EXTENDED_ARG` prefixes.
fn long_jump(g: &mut FlowGraph<'_>) -> InternalResult<()> {
    let skip = g.new_block();
    g.set_lineno(1);
    g.emit(Opcode::LoadName, name("x"))?;
    g.emit_jump(Opcode::PopJumpIfFalse, skip)?;
    g.next_block();
    for i in 0..300 {
        g.set_lineno(2 + i);
        g.emit(Opcode::LoadConst, int(i64::from(i)))?;
        g.emit(Opcode::StoreName, name(&format!("v{}", i % 3)))?;
    }
    g.switch_to_block(skip);
    g.set_lineno(400);
    g.emit(Opcode::LoadConst, Operand::Const(ConstantData::str("done")))?;
    g.emit(Opcode::ReturnValue, Operand::None)
}

#[test]
fn test_jumps_land_on_instruction_starts() {
    for opts in all_configs() {
        let code = compile(&opts, long_jump);
        let decoded: Vec<_> = code.decoded().collect();
        assert!(
            decoded.iter().any(|d| d.index != d.start),
            "expected EXTENDED_ARG prefixes"
        );
        for d in &decoded {
            if let Some(target) = d.jump_target(code.spec()) {
                assert!(
                    decoded.iter().any(|t| t.start == target),
                    "{opts:?}: jump at {} to {target}",
                    d.index
                );
            }
        }
    }
    for x in [true, false] {
        let outcome = differential(
            long_jump,
            &[("x", ConstantData::Boolean { value: x })],
        );
        assert_eq!(outcome.value, ConstantData::str("done"));
        assert_eq!(outcome.names.contains_key("v0"), x);
    }
}

#[test]
fn test_line_table_round_trip() {
    let lines = [1u32, 2, 300, 3, 3, 40];
    let build = |g: &mut FlowGraph<'_>| {
        for (i, &line) in lines.iter().enumerate() {
            g.set_lineno(line);
            g.emit(Opcode::LoadName, name(&format!("n{i}")))?;
            g.emit(Opcode::StoreName, name("out"))?;
        }
        g.emit(Opcode::LoadConst, Operand::Const(ConstantData::None))?;
        g.emit(Opcode::ReturnValue, Operand::None)
    };
    for opts in all_configs() {
        let code = compile(&opts, build);
        assert_eq!(code.first_line_number, 1);
        for (addr, line) in lnotab::entries(&code.linetable) {
            assert!(addr != 0 || line != 0, "{opts:?}: empty entry");
        }
        let unit = 2;
        let found: Vec<Option<u32>> = code
            .decoded()
            .map(|d| {
                lnotab::line_for_offset(&code.linetable, code.first_line_number, d.index as u32 * unit)
            })
            .collect();
        let mut expected: Vec<Option<u32>> = lines
            .iter()
            .flat_map(|&l| [Some(l), Some(l)])
            .collect();
        expected.extend([Some(40), Some(40)]);
        assert_eq!(found, expected, "{opts:?}");
    }
}

#[test]
fn test_reoptimizing_changes_nothing() {
    let builds: [&dyn Fn(&mut FlowGraph<'_>) -> InternalResult<()>; 3] =
        [&long_jump, &and_chain(20), &constant_branch(false)];
    for build in builds {
        for version in [BytecodeVersion::Standard, BytecodeVersion::Legacy] {
            let opts = CompileOpts {
                version,
                ..Default::default()
            };
            let code = compile(&opts, build);
            let again = byte_opt::optimize_code(
                &code.instructions,
                &code.constants,
                &code.linetable,
                code.first_line_number,
                code.spec(),
                &opts.bytecode_limits,
            );
            if let Some(again) = again {
                assert_eq!(again.code, code.instructions.to_vec(), "{version}");
                assert_eq!(again.constants, code.constants, "{version}");
            }
        }
    }
}

#[test]
fn test_straight_line_arithmetic() {
    // x = (2 + 3) * 4 - -1; return (x // 3, "ab" * 3, (1, 2)[1], not x == None, x)
    let build = |g: &mut FlowGraph<'_>| {
        g.set_lineno(1);
        g.emit(Opcode::LoadConst, int(2))?;
        g.emit(Opcode::LoadConst, int(3))?;
        g.emit(Opcode::BinaryAdd, Operand::None)?;
        g.emit(Opcode::LoadConst, int(4))?;
        g.emit(Opcode::BinaryMultiply, Operand::None)?;
        g.emit(Opcode::LoadConst, int(1))?;
        g.emit(Opcode::UnaryNegative, Operand::None)?;
        g.emit(Opcode::BinarySubtract, Operand::None)?;
        g.emit(Opcode::StoreName, name("x"))?;
        g.set_lineno(2);
        g.emit(Opcode::LoadName, name("x"))?;
        g.emit(Opcode::LoadConst, int(3))?;
        g.emit(Opcode::BinaryFloorDivide, Operand::None)?;
        g.emit(Opcode::LoadConst, Operand::Const(ConstantData::str("ab")))?;
        g.emit(Opcode::LoadConst, int(3))?;
        g.emit(Opcode::BinaryMultiply, Operand::None)?;
        g.emit(Opcode::LoadConst, int(1))?;
        g.emit(Opcode::LoadConst, int(2))?;
        g.emit(Opcode::BuildTuple, Operand::Raw(2))?;
        g.emit(Opcode::LoadConst, int(1))?;
        g.emit(Opcode::BinarySubscr, Operand::None)?;
        g.emit(Opcode::LoadName, name("x"))?;
        g.emit(Opcode::LoadConst, Operand::Const(ConstantData::None))?;
        g.emit(
            Opcode::CompareOp,
            Operand::Compare(stackasm::compiler_core::ComparisonOperator::Equal),
        )?;
        g.emit(Opcode::UnaryNot, Operand::None)?;
        g.emit(Opcode::LoadName, name("x"))?;
        g.emit(Opcode::BuildTuple, Operand::Raw(5))?;
        g.emit(Opcode::ReturnValue, Operand::None)
    };
    let outcome = differential(build, &[]);
    assert_eq!(
        outcome.value,
        ConstantData::Tuple {
            elements: vec![
                ConstantData::int(7),
                ConstantData::str("ababab"),
                ConstantData::int(2),
                ConstantData::Boolean { value: true },
                ConstantData::int(21),
            ]
        }
    );
    let code = compile(&CompileOpts::default(), build);
    assert!(!has_op(&code, Opcode::BinaryAdd));
    assert!(!has_op(&code, Opcode::BinarySubscr));
}

#[test]
fn test_unbalanced_loop_is_rejected_in_strict_mode() {
    // a loop body that leaves one value behind on every iteration
    let build = |g: &mut FlowGraph<'_>| {
        let head = g.next_block();
        g.set_lineno(1);
        g.emit(Opcode::LoadName, name("x"))?;
        g.emit_jump(Opcode::JumpAbsolute, head)
    };
    let opts = CompileOpts {
        verify_stack_balance: true,
        ..unoptimized()
    };
    let err = compile_unit(CodeUnitMetadata::new("<module>"), &opts, build).unwrap_err();
    assert_eq!(err.unit, "<module>");
    assert!(err.to_string().contains("is reached with stack depth"), "{err}");
}
