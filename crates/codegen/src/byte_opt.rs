//! Peephole optimizer over encoded code units.
//!
//! Rewrites never move code: an instruction that shrinks is right-aligned in
//! its old span and the freed units become `NOP`s. A single compaction pass at
//! the end drops the `NOP`s and re-resolves every jump.

use crate::{
    consts::ConstantPool,
    fold::{self, BinaryOperator, FoldLimits, UnaryOperator},
};
use log::{debug, trace, warn};
use stackasm_compiler_core::{
    CodeUnit, ComparisonOperator, ConstantData, JumpKind, OpArg, Opcode, OpcodeSpec,
    bytecode::OpArgByte, lnotab,
};

/// Output of a pass that changed something worth keeping.
#[derive(Clone, Debug)]
pub struct Optimized {
    pub code: Vec<CodeUnit>,
    pub constants: Box<[ConstantData]>,
    pub linetable: Box<[u8]>,
}

/// Runs one pass over `code`. Returns `None` when the pass has to give up:
/// the line table has an address delta of 255, the constant table has
/// repeated keys, or a jump no longer fits its encoding after compaction.
pub fn optimize_code(
    code: &[CodeUnit],
    constants: &[ConstantData],
    linetable: &[u8],
    first_line: u32,
    spec: &dyn OpcodeSpec,
    limits: &FoldLimits,
) -> Option<Optimized> {
    if lnotab::entries(linetable).any(|(addr, _)| addr == 0xff) {
        warn!("line table has a 255 byte address delta, skipping bytecode optimization");
        return None;
    }
    let consts: ConstantPool = constants.iter().cloned().collect();
    if consts.len() != constants.len() {
        warn!("constant table has repeated entries, skipping bytecode optimization");
        return None;
    }
    let mut optimizer = ByteOptimizer::new(code.to_vec(), consts, spec, limits)?;
    optimizer.run();
    let new_index = optimizer.compacted_indices();
    let linetable = optimizer.fix_linetable(linetable, first_line, &new_index);
    let Some(code) = optimizer.fix_jumps(&new_index) else {
        warn!("a jump no longer fits after compaction, skipping bytecode optimization");
        return None;
    };
    debug!(
        "bytecode pass: {} -> {} code units",
        optimizer.code.len(),
        code.len()
    );
    Some(Optimized {
        code,
        constants: optimizer.consts.into_boxed_slice(),
        linetable,
    })
}

/// Position of the instruction being looked at.
#[derive(Copy, Clone, Debug)]
struct Cursor {
    /// Unit holding the real opcode.
    index: usize,
    /// First `EXTENDED_ARG` prefix of the instruction, or `index`.
    start: usize,
    /// Unit holding the next real opcode.
    next: usize,
    next_op: Option<Opcode>,
}

type Handler<'a> = fn(&mut ByteOptimizer<'a>, Cursor) -> Option<usize>;

fn handler<'a>(op: Opcode) -> Option<Handler<'a>> {
    use Opcode::*;
    let handler: Handler<'a> = match op {
        UnaryNot => ByteOptimizer::opt_unary_not,
        CompareOp | IsOp | ContainsOp => ByteOptimizer::opt_negated_test,
        LoadConst => ByteOptimizer::opt_load_const,
        ReturnValue => ByteOptimizer::opt_return_value,
        UnaryInvert | UnaryNegative | UnaryPositive => ByteOptimizer::fold_unary,
        BinaryPower | BinaryMultiply | BinaryTrueDivide | BinaryFloorDivide | BinaryModulo
        | BinaryAdd | BinarySubtract | BinarySubscr | BinaryLshift | BinaryRshift
        | BinaryAnd | BinaryXor | BinaryOr => ByteOptimizer::fold_binary,
        BuildTuple | BuildList | BuildSet => ByteOptimizer::fold_build,
        JumpIfFalseOrPop | JumpIfTrueOrPop => ByteOptimizer::fold_cond_jump,
        PopJumpIfFalse | PopJumpIfTrue | ForIter | JumpForward | JumpAbsolute | SetupLoop
        | SetupExcept | SetupFinally | SetupWith => ByteOptimizer::fold_jump_to_jump,
        _ => return None,
    };
    Some(handler)
}

struct ByteOptimizer<'a> {
    code: Vec<CodeUnit>,
    consts: ConstantPool,
    /// Basic block id of every code unit, non-decreasing.
    blocks: Vec<u32>,
    /// Values of the run of `LOAD_CONST`s ending at the current instruction.
    const_stack: Vec<ConstantData>,
    in_consts: bool,
    spec: &'a dyn OpcodeSpec,
    limits: &'a FoldLimits,
    nop: u8,
    extended_arg: u8,
}

impl<'a> ByteOptimizer<'a> {
    fn new(
        code: Vec<CodeUnit>,
        consts: ConstantPool,
        spec: &'a dyn OpcodeSpec,
        limits: &'a FoldLimits,
    ) -> Option<Self> {
        let mut optimizer = Self {
            blocks: Vec::new(),
            code,
            consts,
            const_stack: Vec::new(),
            in_consts: false,
            spec,
            limits,
            nop: spec.to_byte(Opcode::Nop)?,
            extended_arg: spec.extended_arg(),
        };
        optimizer.blocks = optimizer.mark_blocks();
        Some(optimizer)
    }

    fn len(&self) -> usize {
        self.code.len()
    }

    fn op_at(&self, i: usize) -> Option<Opcode> {
        self.spec.from_byte(self.code.get(i)?.op)
    }

    fn byte_of(&self, op: Opcode) -> Option<u8> {
        self.spec.to_byte(op)
    }

    /// Operand of the instruction whose real opcode is at `i`.
    fn arg_at(&self, i: usize) -> u32 {
        let mut arg = u32::from(u8::from(self.code[i].arg));
        let mut shift = 8;
        let mut j = i;
        while j > 0 && shift < 32 && self.code[j - 1].op == self.extended_arg {
            j -= 1;
            arg |= u32::from(u8::from(self.code[j].arg)) << shift;
            shift += 8;
        }
        arg
    }

    /// First unit at or after `i` that is not an `EXTENDED_ARG`.
    fn find_op(&self, mut i: usize) -> usize {
        while i < self.len() && self.code[i].op == self.extended_arg {
            i += 1;
        }
        i
    }

    fn prefix_start(&self, mut i: usize) -> usize {
        while i > 0 && self.code[i - 1].op == self.extended_arg {
            i -= 1;
        }
        i
    }

    /// Unit index a jump at `i` lands on.
    fn jump_target(&self, i: usize) -> Option<usize> {
        let kind = self.spec.jump_kind(self.op_at(i)?)?;
        let units = self.spec.jump_arg_to_units(self.arg_at(i)) as usize;
        Some(match kind {
            JumpKind::Absolute => units,
            JumpKind::Relative => i + 1 + units,
        })
    }

    fn mark_blocks(&self) -> Vec<u32> {
        let mut starts = vec![0u32; self.len()];
        for i in 0..self.len() {
            if let Some(target) = self.jump_target(i) {
                if let Some(start) = starts.get_mut(target) {
                    *start = 1;
                }
            }
        }
        let mut count = 0;
        for block in &mut starts {
            count += *block;
            *block = count;
        }
        starts
    }

    /// Makes `i` the start of a basic block.
    fn split_block_at(&mut self, i: usize) {
        if i == 0 || i >= self.len() || self.blocks[i] != self.blocks[i - 1] {
            return;
        }
        for block in &mut self.blocks[i..] {
            *block += 1;
        }
    }

    fn is_basic_block(&self, start: usize, end: usize) -> bool {
        match (self.blocks.get(start), self.blocks.get(end)) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }

    fn fill_nops(&mut self, start: usize, end: usize) {
        let nop = self.nop;
        let end = end.min(self.len());
        for unit in &mut self.code[start..end] {
            unit.op = nop;
        }
    }

    /// Writes `op arg` right-aligned into `start..end`, filling the rest with
    /// `NOP`s. Returns the index of the real opcode, or `None` when the
    /// encoding does not fit.
    fn write_instr(&mut self, start: usize, end: usize, op: u8, arg: u32) -> Option<usize> {
        let arg = OpArg::new(arg);
        let size = arg.instr_size();
        if start + size > end {
            return None;
        }
        let (prefixes, lo) = arg.split();
        let at = end - size;
        for (k, byte) in prefixes.enumerate() {
            self.code[at + k] = CodeUnit::new(self.extended_arg, byte);
        }
        self.code[end - 1] = CodeUnit::new(op, lo);
        self.fill_nops(start, at);
        Some(end - 1)
    }

    /// Start of the run of `n` constant loads that ends right before `i`.
    fn lastn_const_start(&self, mut i: usize, mut n: usize) -> Option<usize> {
        let load_const = self.byte_of(Opcode::LoadConst)?;
        while n > 0 {
            i = i.checked_sub(1)?;
            let op = self.code[i].op;
            if op == load_const {
                n -= 1;
            } else if op != self.nop && op != self.extended_arg {
                return None;
            }
        }
        Some(self.prefix_start(i))
    }

    fn push_const(&mut self, value: ConstantData) {
        self.const_stack.push(value);
        self.in_consts = true;
    }

    fn run(&mut self) {
        let mut i = self.find_op(0);
        while i < self.len() {
            let next = self.find_op(i + 1);
            let cursor = Cursor {
                index: i,
                start: self.prefix_start(i),
                next,
                next_op: self.op_at(next),
            };
            if !self.in_consts {
                self.const_stack.clear();
            }
            self.in_consts = false;
            i = match self.op_at(i).and_then(handler) {
                Some(handler) => handler(self, cursor).unwrap_or(next),
                None => next,
            };
        }
    }

    /// `UNARY_NOT` feeding a pop-jump is the opposite pop-jump.
    fn opt_unary_not(&mut self, c: Cursor) -> Option<usize> {
        let flipped = match c.next_op? {
            Opcode::PopJumpIfFalse => Opcode::PopJumpIfTrue,
            Opcode::PopJumpIfTrue => Opcode::PopJumpIfFalse,
            _ => return None,
        };
        if !self.is_basic_block(c.start, c.index + 1) {
            return None;
        }
        self.fill_nops(c.start, c.index + 1);
        self.code[c.next].op = self.byte_of(flipped)?;
        None
    }

    /// `not a is b` is `a is not b`, `not a in b` is `a not in b`.
    fn opt_negated_test(&mut self, c: Cursor) -> Option<usize> {
        if c.next_op? != Opcode::UnaryNot || !self.is_basic_block(c.start, c.index + 1) {
            return None;
        }
        let arg = self.arg_at(c.index);
        let inverted = match self.op_at(c.index)? {
            Opcode::CompareOp => ComparisonOperator::from_index(arg)?.inverse()?.index(),
            _ if arg <= 1 => arg ^ 1,
            _ => return None,
        };
        self.code[c.index].arg = OpArgByte::new(inverted as u8);
        self.fill_nops(c.index + 1, c.next + 1);
        None
    }

    fn opt_load_const(&mut self, c: Cursor) -> Option<usize> {
        let value = self.consts.get(self.arg_at(c.index))?.clone();
        let truthy = value.is_truthy();
        self.push_const(value);
        let next_op = c.next_op?;
        if !matches!(next_op, Opcode::PopJumpIfFalse | Opcode::PopJumpIfTrue)
            || !self.is_basic_block(c.start, c.index + 1)
        {
            return None;
        }
        if truthy == next_op.jumps_on_true() {
            self.fill_nops(c.start, c.index + 1);
            self.code[c.next].op = self.byte_of(Opcode::JumpAbsolute)?;
        } else {
            self.fill_nops(c.start, c.next + 1);
        }
        trace!("constant condition at unit {} resolved", c.index);
        None
    }

    /// Code after a return up to the end of its basic block is dead.
    fn opt_return_value(&mut self, c: Cursor) -> Option<usize> {
        let block = self.blocks[c.index];
        let mut end = c.index + 1;
        while end < self.len() && self.blocks[end] == block {
            end += 1;
        }
        if end > c.index + 1 {
            self.fill_nops(c.index + 1, end);
        }
        None
    }

    /// Replaces `start..=c.index` with a load of `value`.
    fn load_folded(&mut self, start: usize, c: Cursor, value: ConstantData) -> bool {
        let index = self.consts.intern(value);
        let Some(load_const) = self.byte_of(Opcode::LoadConst) else {
            return false;
        };
        self.write_instr(start, c.index + 1, load_const, index).is_some()
    }

    fn fold_unary(&mut self, c: Cursor) -> Option<usize> {
        let operand = self.const_stack.last()?.clone();
        let start = self.lastn_const_start(c.start, 1)?;
        if !self.is_basic_block(start, c.start) {
            return None;
        }
        let op = UnaryOperator::from_opcode(self.op_at(c.index)?)?;
        let value = match fold::unary_op(op, &operand) {
            Ok(value) => value,
            Err(err) => {
                debug!("not folding {op:?} {operand}: {err}");
                return None;
            }
        };
        if self.load_folded(start, c, value.clone()) {
            if let Some(top) = self.const_stack.last_mut() {
                *top = value;
            }
            self.in_consts = true;
        }
        None
    }

    fn fold_binary(&mut self, c: Cursor) -> Option<usize> {
        let [.., left, right] = self.const_stack.as_slice() else {
            return None;
        };
        let (left, right) = (left.clone(), right.clone());
        let start = self.lastn_const_start(c.start, 2)?;
        if !self.is_basic_block(start, c.start) {
            return None;
        }
        let op = BinaryOperator::from_opcode(self.op_at(c.index)?)?;
        let value = match fold::binary_op(op, &left, &right, self.limits) {
            Ok(value) => value,
            Err(err) => {
                debug!("not folding {left} {} {right}: {err}", op.symbol());
                return None;
            }
        };
        if self.load_folded(start, c, value.clone()) {
            self.const_stack.pop();
            if let Some(top) = self.const_stack.last_mut() {
                *top = value;
            }
            self.in_consts = true;
        }
        None
    }

    fn fold_build(&mut self, c: Cursor) -> Option<usize> {
        let op = self.op_at(c.index)?;
        let n = self.arg_at(c.index) as usize;
        if n > 0 && self.const_stack.len() >= n {
            if let Some(start) = self.lastn_const_start(c.start, n) {
                let consumed_as_iterable = match c.next_op {
                    Some(Opcode::GetIter | Opcode::ContainsOp) => true,
                    Some(Opcode::CompareOp) => matches!(
                        ComparisonOperator::from_index(self.arg_at(c.next)),
                        Some(ComparisonOperator::In | ComparisonOperator::NotIn)
                    ),
                    _ => false,
                };
                let foldable = if op == Opcode::BuildTuple {
                    self.is_basic_block(start, c.start)
                } else {
                    consumed_as_iterable && self.is_basic_block(start, c.index + 1)
                };
                if foldable {
                    let elements = self.const_stack.split_off(self.const_stack.len() - n);
                    let value = if op == Opcode::BuildSet {
                        ConstantData::frozenset(elements.iter().cloned())
                    } else {
                        ConstantData::Tuple {
                            elements: elements.clone(),
                        }
                    };
                    if self.load_folded(start, c, value.clone()) {
                        trace!("folded {op} {n} at unit {}", c.index);
                        self.push_const(value);
                    } else {
                        self.const_stack.extend(elements);
                    }
                    return None;
                }
            }
        }

        if c.next_op? != Opcode::UnpackSequence
            || op == Opcode::BuildSet
            || self.arg_at(c.next) as usize != n
            || !self.is_basic_block(c.start, c.index + 1)
        {
            return None;
        }
        let rot_two = self.byte_of(Opcode::RotTwo)?;
        let rot_three = self.byte_of(Opcode::RotThree)?;
        match n {
            0 | 1 => self.fill_nops(c.start, c.next + 1),
            2 => {
                self.code[c.start] = CodeUnit::new(rot_two, OpArgByte::NULL);
                self.fill_nops(c.start + 1, c.next + 1);
            }
            3 => {
                self.code[c.start] = CodeUnit::new(rot_three, OpArgByte::NULL);
                self.code[c.start + 1] = CodeUnit::new(rot_two, OpArgByte::NULL);
                self.fill_nops(c.start + 2, c.next + 1);
            }
            _ => return None,
        }
        self.const_stack.clear();
        None
    }

    /// `JUMP_IF_X_OR_POP` into another conditional jump: the second test is
    /// decided by the first.
    fn fold_cond_jump(&mut self, c: Cursor) -> Option<usize> {
        let op = self.op_at(c.index)?;
        let target = self.jump_target(c.index)?;
        let tgt = self.find_op(target);
        if let Some(tgt_op) = self.op_at(tgt).filter(|o| o.is_conditional_jump()) {
            let (new_op, new_target) = if tgt_op.jumps_on_true() == op.jumps_on_true() {
                (tgt_op, self.jump_target(tgt)?)
            } else if op.jumps_on_true() {
                (Opcode::PopJumpIfTrue, tgt + 1)
            } else {
                (Opcode::PopJumpIfFalse, tgt + 1)
            };
            let new_arg = self.spec.units_to_jump_arg(new_target as u32);
            if (new_op, new_arg) != (op, self.arg_at(c.index)) {
                let byte = self.byte_of(new_op)?;
                if self.write_instr(c.start, c.index + 1, byte, new_arg).is_some() {
                    trace!("threaded {op} at unit {} to {new_op} {new_target}", c.index);
                    self.split_block_at(new_target);
                    return Some(c.index);
                }
            }
        }
        self.fold_jump_to_jump(c)
    }

    /// An unconditional jump to a return returns directly, any jump to an
    /// unconditional jump goes straight to its target.
    fn fold_jump_to_jump(&mut self, c: Cursor) -> Option<usize> {
        let mut op = self.op_at(c.index)?;
        let tgt = self.find_op(self.jump_target(c.index)?);
        let tgt_op = self.op_at(tgt)?;
        if op.is_unconditional_jump() && tgt_op == Opcode::ReturnValue {
            let return_value = self.byte_of(Opcode::ReturnValue)?;
            self.write_instr(c.start, c.index + 1, return_value, 0);
            return None;
        }
        if !tgt_op.is_unconditional_jump() {
            return None;
        }
        let final_target = self.jump_target(tgt)?;
        let units = if op == Opcode::JumpForward {
            op = Opcode::JumpAbsolute;
            final_target
        } else if self.spec.jump_kind(op)? == JumpKind::Relative {
            // relative jumps only go forward
            final_target.checked_sub(c.index + 1)?
        } else {
            final_target
        };
        let arg = self.spec.units_to_jump_arg(units as u32);
        let byte = self.byte_of(op)?;
        self.write_instr(c.start, c.index + 1, byte, arg);
        None
    }

    /// New index of every unit once the `NOP`s are gone, plus the new length
    /// at the end.
    fn compacted_indices(&self) -> Vec<usize> {
        let mut nops = 0;
        let mut indices = Vec::with_capacity(self.len() + 1);
        for unit in &self.code {
            indices.push(indices.len() - nops);
            if unit.op == self.nop {
                nops += 1;
            }
        }
        indices.push(self.len() - nops);
        indices
    }

    fn fix_linetable(&self, linetable: &[u8], first_line: u32, new_index: &[usize]) -> Box<[u8]> {
        let unit = self.spec.code_unit_size() as u32;
        let last = new_index.len() - 1;
        lnotab::remap(linetable, first_line, |offset| {
            let old = (offset / unit) as usize;
            new_index[old.min(last)] as u32 * unit
        })
    }

    /// Drops `NOP`s and re-resolves jumps against the compacted layout.
    fn fix_jumps(&self, new_index: &[usize]) -> Option<Vec<CodeUnit>> {
        let map = |old: usize| new_index[old.min(new_index.len() - 1)];
        let mut out = Vec::with_capacity(self.len());
        let mut start = 0;
        let mut i = 0;
        while i < self.len() {
            i = self.find_op(i);
            if i >= self.len() {
                break;
            }
            let unit = self.code[i];
            if unit.op == self.nop {
                i += 1;
                start = i;
                continue;
            }
            let mut arg = self.arg_at(i);
            if let Some(target) = self.jump_target(i) {
                let units = match self.spec.jump_kind(self.op_at(i)?)? {
                    JumpKind::Absolute => map(target),
                    JumpKind::Relative => map(target).checked_sub(map(i) + 1)?,
                };
                arg = self.spec.units_to_jump_arg(units as u32);
            }
            let span = i - start + 1;
            let arg = OpArg::new(arg);
            if arg.instr_size() > span {
                return None;
            }
            // pad with `EXTENDED_ARG 0` so the instruction keeps its width
            for k in (1..span).rev() {
                let byte = if k < 4 { (arg.get() >> (8 * k)) as u8 } else { 0 };
                out.push(CodeUnit::new(self.extended_arg, OpArgByte::new(byte)));
            }
            out.push(CodeUnit::new(unit.op, OpArgByte::new(arg.get() as u8)));
            i += 1;
            start = i;
        }
        Some(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stackasm_compiler_core::{
        OpcodeTable,
        bytecode::decode_instructions,
        lnotab::{LineTableBuilder, decode},
    };

    /// Encodes `(opcode, operand)` pairs, one line per instruction.
    fn assemble(spec: &dyn OpcodeSpec, ops: &[(Opcode, u32)]) -> (Vec<CodeUnit>, Box<[u8]>) {
        let mut code = Vec::new();
        let mut lines = LineTableBuilder::new(1);
        for (n, &(op, arg)) in ops.iter().enumerate() {
            lines.next_line(Some(n as u32 + 1));
            let arg = OpArg::new(arg);
            let (prefixes, lo) = arg.split();
            code.extend(prefixes.map(|b| CodeUnit::new(spec.extended_arg(), b)));
            code.push(CodeUnit::new(spec.to_byte(op).unwrap(), lo));
            lines.add_code(arg.instr_size() as u32 * 2);
        }
        (code, lines.finish())
    }

    fn decoded(spec: &dyn OpcodeSpec, code: &[CodeUnit]) -> Vec<(Opcode, u32)> {
        decode_instructions(code, spec)
            .map(|d| (d.op.unwrap(), d.arg.get()))
            .collect()
    }

    fn run(
        spec: &dyn OpcodeSpec,
        consts: &[ConstantData],
        ops: &[(Opcode, u32)],
    ) -> Option<Optimized> {
        let (code, table) = assemble(spec, ops);
        optimize_code(&code, consts, &table, 1, spec, &FoldLimits::default())
    }

    #[test]
    fn test_fold_binary_constants() {
        use Opcode::*;
        let spec = OpcodeTable::standard();
        let consts = [ConstantData::int(2), ConstantData::int(3)];
        let out = run(
            &spec,
            &consts,
            &[(LoadConst, 0), (LoadConst, 1), (BinaryAdd, 0), (ReturnValue, 0)],
        )
        .unwrap();
        assert_eq!(decoded(&spec, &out.code), vec![(LoadConst, 2), (ReturnValue, 0)]);
        assert_eq!(out.constants[2], ConstantData::int(5));
    }

    #[test]
    fn test_fold_chain_of_constants() {
        use Opcode::*;
        let spec = OpcodeTable::standard();
        let consts = [ConstantData::int(2), ConstantData::int(3), ConstantData::int(4)];
        let out = run(
            &spec,
            &consts,
            &[
                (LoadConst, 0),
                (LoadConst, 1),
                (BinaryMultiply, 0),
                (LoadConst, 2),
                (BinaryAdd, 0),
                (UnaryNegative, 0),
                (ReturnValue, 0),
            ],
        )
        .unwrap();
        let code = decoded(&spec, &out.code);
        assert_eq!(code.len(), 2);
        assert_eq!(out.constants[code[0].1 as usize], ConstantData::int(-10));
    }

    #[test]
    fn test_overflow_guard() {
        use Opcode::*;
        let spec = OpcodeTable::standard();
        // 4 ** 32 has 65 bits
        let consts = [ConstantData::int(4), ConstantData::int(32)];
        let out = run(
            &spec,
            &consts,
            &[
                (LoadConst, 0),
                (LoadConst, 1),
                (BinaryPower, 0),
                (LoadConst, 0),
                (LoadConst, 1),
                (BinaryPower, 0),
                (BinaryMultiply, 0),
                (ReturnValue, 0),
            ],
        )
        .unwrap();
        let code = decoded(&spec, &out.code);
        // each power folds, their product is too wide
        assert_eq!(code.len(), 4);
        assert_eq!(code[2], (BinaryMultiply, 0));
        assert_eq!(code[0], code[1]);
    }

    #[test]
    fn test_fold_tuple_and_unpack() {
        use Opcode::*;
        let spec = OpcodeTable::legacy();
        let consts = [ConstantData::int(1), ConstantData::str("a")];
        let out = run(
            &spec,
            &consts,
            &[
                (LoadConst, 0),
                (LoadConst, 1),
                (BuildTuple, 2),
                (StoreName, 0),
                (LoadName, 1),
                (LoadName, 2),
                (BuildTuple, 2),
                (UnpackSequence, 2),
                (LoadConst, 0),
                (ReturnValue, 0),
            ],
        )
        .unwrap();
        assert_eq!(
            decoded(&spec, &out.code),
            vec![
                (LoadConst, 2),
                (StoreName, 0),
                (LoadName, 1),
                (LoadName, 2),
                (RotTwo, 0),
                (LoadConst, 0),
                (ReturnValue, 0)
            ]
        );
        assert_eq!(
            out.constants[2],
            ConstantData::Tuple {
                elements: consts.to_vec()
            }
        );
    }

    #[test]
    fn test_not_is_becomes_is_not() {
        use Opcode::*;
        let spec = OpcodeTable::standard();
        let out = run(
            &spec,
            &[ConstantData::None],
            &[
                (LoadName, 0),
                (LoadConst, 0),
                (IsOp, 0),
                (UnaryNot, 0),
                (ReturnValue, 0),
            ],
        )
        .unwrap();
        assert_eq!(
            decoded(&spec, &out.code),
            vec![(LoadName, 0), (LoadConst, 0), (IsOp, 1), (ReturnValue, 0)]
        );
    }

    #[test]
    fn test_jump_chain_is_collapsed() {
        use Opcode::*;
        let spec = OpcodeTable::standard();
        // 0: LOAD_NAME; 1: POP_JUMP_IF_FALSE 4; 2: LOAD_NAME; 3: POP_TOP;
        // 4: JUMP_ABSOLUTE 6; 5: NOP; 6: LOAD_NAME; 7: RETURN_VALUE
        let out = run(
            &spec,
            &[],
            &[
                (LoadName, 0),
                (PopJumpIfFalse, 4),
                (LoadName, 1),
                (PopTop, 0),
                (JumpAbsolute, 6),
                (Nop, 0),
                (LoadName, 2),
                (ReturnValue, 0),
            ],
        )
        .unwrap();
        assert_eq!(
            decoded(&spec, &out.code),
            vec![
                (LoadName, 0),
                (PopJumpIfFalse, 5),
                (LoadName, 1),
                (PopTop, 0),
                (JumpAbsolute, 5),
                (LoadName, 2),
                (ReturnValue, 0)
            ]
        );
    }

    #[test]
    fn test_jump_to_return_returns() {
        use Opcode::*;
        let spec = OpcodeTable::standard();
        let out = run(
            &spec,
            &[ConstantData::None],
            &[
                (LoadConst, 0),
                (JumpForward, 1),
                (LoadName, 0),
                (ReturnValue, 0),
            ],
        )
        .unwrap();
        assert_eq!(
            decoded(&spec, &out.code),
            vec![(LoadConst, 0), (ReturnValue, 0), (LoadName, 0), (ReturnValue, 0)]
        );
    }

    #[test]
    fn test_opposite_conditions() {
        use Opcode::*;
        let spec = OpcodeTable::standard();
        // 0: LOAD_NAME a; 1: JUMP_IF_FALSE_OR_POP 3; 2: LOAD_NAME b;
        // 3: JUMP_IF_TRUE_OR_POP 5; 4: LOAD_NAME c; 5: RETURN_VALUE
        let out = run(
            &spec,
            &[],
            &[
                (LoadName, 0),
                (JumpIfFalseOrPop, 3),
                (LoadName, 1),
                (JumpIfTrueOrPop, 5),
                (LoadName, 2),
                (ReturnValue, 0),
            ],
        )
        .unwrap();
        assert_eq!(decoded(&spec, &out.code)[1], (PopJumpIfFalse, 4));
    }

    #[test]
    fn test_line_table_follows_compaction() {
        use Opcode::*;
        let spec = OpcodeTable::standard();
        let consts = [ConstantData::int(6), ConstantData::int(7)];
        let out = run(
            &spec,
            &consts,
            &[
                (LoadConst, 0),
                (LoadConst, 1),
                (BinaryMultiply, 0),
                (ReturnValue, 0),
            ],
        )
        .unwrap();
        let ranges: Vec<_> = decode(&out.linetable, 1)
            .into_iter()
            .map(|r| (r.start, r.end, r.line))
            .collect();
        assert_eq!(ranges, vec![(0, 2, Some(3)), (2, 4, Some(4))]);
    }

    #[test]
    fn test_gives_up_on_wide_address_delta() {
        use Opcode::*;
        let spec = OpcodeTable::standard();
        let (code, _) = assemble(&spec, &[(Nop, 0), (ReturnValue, 0)]);
        let table = [0xff, 1];
        assert!(
            optimize_code(&code, &[], &table, 1, &spec, &FoldLimits::default()).is_none()
        );
    }
}
