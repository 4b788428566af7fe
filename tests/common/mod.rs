//! A reference evaluator for straight-line and branching code objects.
//!
//! It understands the handful of opcodes the pipeline tests emit and checks
//! two things while running: every jump lands on the first code unit of an
//! instruction, and the value stack never grows past `max_stackdepth`.

#![allow(dead_code)]

use std::collections::HashMap;

use stackasm::{
    CodeObject,
    codegen::fold::{self, BinaryOperator, FoldLimits, UnaryOperator},
    compiler_core::{ComparisonOperator, ConstantData, Opcode},
};

const MAX_STEPS: usize = 100_000;

const UNLIMITED: FoldLimits = FoldLimits {
    max_int_size: u64::MAX,
    max_collection_size: u64::MAX,
    max_str_size: u64::MAX,
    max_total_items: u64::MAX,
};

#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    pub value: ConstantData,
    pub names: HashMap<String, ConstantData>,
    pub max_depth: usize,
}

pub fn run(code: &CodeObject, env: &[(&str, ConstantData)]) -> Result<Outcome, String> {
    let spec = code.spec();
    let instructions: Vec<_> = code.decoded().collect();
    let by_start: HashMap<usize, usize> = instructions
        .iter()
        .enumerate()
        .map(|(pos, d)| (d.start, pos))
        .collect();
    let mut names: HashMap<String, ConstantData> = env
        .iter()
        .map(|(k, v)| ((*k).to_owned(), v.clone()))
        .collect();
    let mut stack: Vec<ConstantData> = Vec::new();
    let mut max_depth = 0;
    let mut pc = 0;

    for _ in 0..MAX_STEPS {
        let d = instructions
            .get(pc)
            .ok_or_else(|| format!("fell off the end at instruction {pc}"))?;
        let op = d.op.ok_or_else(|| format!("unknown byte {}", d.byte))?;
        let arg = d.arg.get();
        let jump_to = match d.jump_target(spec) {
            Some(target) => Some(
                *by_start
                    .get(&target)
                    .ok_or_else(|| format!("{op} at unit {} lands inside an instruction", d.index))?,
            ),
            None => None,
        };
        let mut next = pc + 1;
        macro_rules! pop {
            () => {
                stack.pop().ok_or_else(|| format!("{op}: stack underflow"))?
            };
        }

        match op {
            Opcode::Nop => {}
            Opcode::LoadConst => stack.push(
                code.constants
                    .get(arg as usize)
                    .cloned()
                    .ok_or("constant out of range")?,
            ),
            Opcode::LoadName => {
                let name = &code.names[arg as usize];
                let value = names
                    .get(name)
                    .cloned()
                    .ok_or_else(|| format!("name {name} is not defined"))?;
                stack.push(value);
            }
            Opcode::StoreName => {
                let value = pop!();
                names.insert(code.names[arg as usize].clone(), value);
            }
            Opcode::PopTop => {
                pop!();
            }
            Opcode::DupTop => {
                let top = stack.last().cloned().ok_or("DUP_TOP on empty stack")?;
                stack.push(top);
            }
            Opcode::RotTwo => {
                let top = pop!();
                let second = pop!();
                stack.push(top);
                stack.push(second);
            }
            Opcode::RotThree => {
                let top = pop!();
                let second = pop!();
                let third = pop!();
                stack.push(top);
                stack.push(third);
                stack.push(second);
            }
            Opcode::UnaryPositive
            | Opcode::UnaryNegative
            | Opcode::UnaryNot
            | Opcode::UnaryInvert => {
                let operand = pop!();
                let unary = UnaryOperator::from_opcode(op).ok_or("not a unary opcode")?;
                stack.push(fold::unary_op(unary, &operand).map_err(|e| e.to_string())?);
            }
            Opcode::CompareOp => {
                let right = pop!();
                let left = pop!();
                let cmp = ComparisonOperator::from_index(arg).ok_or("bad comparison")?;
                let value = match cmp {
                    ComparisonOperator::Is => ConstantData::Boolean { value: left == right },
                    ComparisonOperator::IsNot => ConstantData::Boolean { value: left != right },
                    _ => fold::compare_op(cmp, &left, &right).map_err(|e| e.to_string())?,
                };
                stack.push(value);
            }
            Opcode::IsOp => {
                let right = pop!();
                let left = pop!();
                stack.push(ConstantData::Boolean {
                    value: (left == right) != (arg == 1),
                });
            }
            Opcode::ContainsOp => {
                let container = pop!();
                let item = pop!();
                let found = fold::compare_op(ComparisonOperator::In, &item, &container)
                    .map_err(|e| e.to_string())?;
                stack.push(ConstantData::Boolean {
                    value: found.is_truthy() != (arg == 1),
                });
            }
            Opcode::BuildTuple | Opcode::BuildList | Opcode::BuildSet => {
                let at = stack
                    .len()
                    .checked_sub(arg as usize)
                    .ok_or("build past the stack bottom")?;
                let elements = stack.split_off(at);
                stack.push(if op == Opcode::BuildSet {
                    ConstantData::frozenset(elements)
                } else {
                    ConstantData::Tuple { elements }
                });
            }
            Opcode::UnpackSequence => match pop!() {
                ConstantData::Tuple { elements } if elements.len() == arg as usize => {
                    stack.extend(elements.into_iter().rev());
                }
                other => return Err(format!("cannot unpack {other} into {arg}")),
            },
            Opcode::JumpAbsolute | Opcode::JumpForward => next = jump_to.ok_or("no target")?,
            Opcode::PopJumpIfFalse | Opcode::PopJumpIfTrue => {
                if pop!().is_truthy() == op.jumps_on_true() {
                    next = jump_to.ok_or("no target")?;
                }
            }
            Opcode::JumpIfFalseOrPop | Opcode::JumpIfTrueOrPop => {
                let top = stack.last().ok_or("conditional on empty stack")?;
                if top.is_truthy() == op.jumps_on_true() {
                    next = jump_to.ok_or("no target")?;
                } else {
                    stack.pop();
                }
            }
            Opcode::ReturnValue => {
                let value = pop!();
                return Ok(Outcome {
                    value,
                    names,
                    max_depth,
                });
            }
            _ => match BinaryOperator::from_opcode(op) {
                Some(binary) => {
                    let right = pop!();
                    let left = pop!();
                    stack.push(
                        fold::binary_op(binary, &left, &right, &UNLIMITED)
                            .map_err(|e| e.to_string())?,
                    );
                }
                None => return Err(format!("{op} is not supported by the evaluator")),
            },
        }
        max_depth = max_depth.max(stack.len());
        if max_depth > code.max_stackdepth as usize {
            return Err(format!(
                "stack reached {max_depth}, max_stackdepth is {}",
                code.max_stackdepth
            ));
        }
        pc = next;
    }
    Err("step limit exceeded".to_owned())
}
