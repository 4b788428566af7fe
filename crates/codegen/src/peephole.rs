//! Structured peephole optimizer and CFG cleanup.
//!
//! Rules run block by block over [`InstructionInfo`]s. Every jump lands on the
//! first instruction of a block, so a rule that only looks at instructions of
//! the block it is working on never crosses a basic block boundary.

use core::mem;

use crate::{
    fold::{self, BinaryOperator, FoldLimits, UnaryOperator},
    ir::{BlockIdx, FlowGraph, InstructionInfo},
};
use log::{debug, trace};
use stackasm_compiler_core::{ComparisonOperator, ConstantData, JumpKind, OpArg, Opcode};

/// Largest exit block that is copied into the blocks jumping to it.
const MAX_COPY_SIZE: usize = 4;

impl FlowGraph<'_> {
    /// Optimizes the graph in place and leaves it ready for
    /// [`max_stackdepth`](Self::max_stackdepth) and [`flatten`](Self::flatten).
    ///
    /// Blocks are never reordered or merged. Unreachable blocks end up empty
    /// and every jump points at a non-empty block.
    pub fn optimize(&mut self, limits: &FoldLimits) {
        let order = self.emission_order();
        let mut by_allocation = order.clone();
        by_allocation.sort_unstable_by_key(|b| core::cmp::Reverse(b.idx()));
        let mut positions = vec![usize::MAX; self.blocks.len()];
        for (pos, block) in order.iter().enumerate() {
            positions[block.idx()] = pos;
        }

        for &block in &order {
            self.normalize_basic_block(block);
        }
        for &block in &by_allocation {
            self.extend_block(block);
        }
        for &block in &order {
            self.optimize_basic_block(block, limits, &positions);
            self.clean_basic_block(block, None);
        }
        for &block in &by_allocation {
            self.extend_block(block);
        }
        let mut prev_block: Option<BlockIdx> = None;
        for &block in &order {
            let prev_lineno = prev_block
                .and_then(|prev| self.blocks[prev].instructions.last())
                .and_then(|info| info.lineno);
            self.clean_basic_block(block, prev_lineno);
            prev_block = (!self.blocks[block].no_fallthrough).then_some(block);
        }

        self.eliminate_empty_basic_blocks();
        self.remove_unreachable_basic_blocks();
        self.eliminate_empty_basic_blocks();
        if self.remove_redundant_jumps() {
            self.eliminate_empty_basic_blocks();
        }

        self.propagate_line_numbers();
        self.guarantee_lineno_for_exits();
        self.normalize_jumps();
        self.refresh_out_edges();
        debug!(
            "optimized {}: {} instructions left",
            self.metadata.name,
            self.blocks.iter().map(|b| b.instructions.len()).sum::<usize>()
        );
    }

    /// Sets the fallthrough and exit flags of a block and points its jumps at
    /// non-empty blocks.
    fn normalize_basic_block(&mut self, block: BlockIdx) {
        for i in 0..self.blocks[block].instructions.len() {
            let info = self.blocks[block].instructions[i];
            if info.op.is_scope_exit() {
                let b = &mut self.blocks[block];
                b.is_exit = true;
                b.no_fallthrough = true;
                b.returns |= info.op == Opcode::ReturnValue;
                continue;
            }
            if info.op.is_unconditional_jump() {
                self.blocks[block].no_fallthrough = true;
            }
            if info.has_target() {
                let target = self.skip_empty(info.target);
                self.blocks[block].instructions[i].target = target;
            }
        }
    }

    /// If the block ends with an unconditional jump to a small exit block, the
    /// jump becomes a `NOP` and the exit block's code is copied in its place.
    fn extend_block(&mut self, block: BlockIdx) {
        let Some(last) = self.blocks[block].instructions.last() else {
            return;
        };
        if !last.op.is_unconditional_jump() {
            return;
        }
        let target = last.target;
        if target == block || target == BlockIdx::NULL {
            return;
        }
        let target_block = &self.blocks[target];
        if !target_block.is_exit || target_block.instructions.len() > MAX_COPY_SIZE {
            return;
        }
        let copied = target_block.instructions.clone();
        let returns = target_block.returns;
        trace!("copying exit block {target} into block {block}");
        let b = &mut self.blocks[block];
        if let Some(last) = b.instructions.last_mut() {
            last.set_nop();
        }
        b.instructions.extend(copied);
        b.is_exit = true;
        b.no_fallthrough = true;
        b.returns |= returns;
    }

    fn optimize_basic_block(&mut self, block: BlockIdx, limits: &FoldLimits, positions: &[usize]) {
        let instructions = mem::take(&mut self.blocks[block].instructions);
        let mut rewriter = BlockRewriter {
            graph: self,
            block,
            instructions,
            limits,
            positions,
        };
        let mut i = 0;
        while i < rewriter.instructions.len() {
            if rewriter.instructions[i].has_target() {
                let target = rewriter.skip_empty(rewriter.instructions[i].target);
                rewriter.instructions[i].target = target;
            }
            i = match handler(rewriter.instructions[i].op) {
                Some(rule) => rule(&mut rewriter, i).unwrap_or(i + 1),
                None => i + 1,
            };
        }
        let instructions = rewriter.instructions;
        self.blocks[block].instructions = instructions;
    }

    /// Removes `NOP`s that do not carry a line event of their own.
    fn clean_basic_block(&mut self, block: BlockIdx, mut prev_lineno: Option<u32>) {
        let next_lineno = {
            let next = self.skip_empty(self.blocks[block].next);
            (next != BlockIdx::NULL)
                .then(|| self.blocks[next].instructions.first())
                .flatten()
                .map(|info| info.lineno)
        };
        let instructions = mem::take(&mut self.blocks[block].instructions);
        let count = instructions.len();
        let mut kept = Vec::with_capacity(count);
        let mut iter = instructions.into_iter().enumerate().peekable();
        while let Some((idx, info)) = iter.next() {
            let lineno = info.lineno;
            let keep = if info.op != Opcode::Nop {
                true
            } else if lineno.is_none() || prev_lineno == lineno {
                false
            } else if idx + 1 < count {
                match iter.peek_mut() {
                    Some((_, next)) if next.lineno.is_none() || next.lineno == lineno => {
                        next.lineno = lineno;
                        false
                    }
                    _ => true,
                }
            } else {
                next_lineno != Some(lineno)
            };
            prev_lineno = lineno;
            if keep {
                kept.push(info);
            }
        }
        self.blocks[block].instructions = kept;
    }

    /// Points `next` links and jump targets past empty blocks.
    fn eliminate_empty_basic_blocks(&mut self) {
        for idx in self.emission_order() {
            let next = self.blocks[idx].next;
            let skipped = self.skip_empty(next);
            self.blocks[idx].next = skipped;
        }
        for idx in self.emission_order() {
            for i in 0..self.blocks[idx].instructions.len() {
                let info = self.blocks[idx].instructions[i];
                if info.has_target() {
                    let target = self.skip_empty(info.target);
                    self.blocks[idx].instructions[i].target = target;
                }
            }
        }
    }

    /// Counts predecessors from the entry and empties every block that cannot
    /// be reached.
    fn remove_unreachable_basic_blocks(&mut self) {
        for block in &mut self.blocks {
            block.num_predecessors = 0;
        }
        let mut reachable = vec![false; self.blocks.len()];
        let mut worklist = vec![BlockIdx::ENTRY];
        self.blocks[BlockIdx::ENTRY].num_predecessors = 1;
        while let Some(idx) = worklist.pop() {
            if mem::replace(&mut reachable[idx.idx()], true) {
                continue;
            }
            let mut successors: Vec<BlockIdx> = self.blocks[idx]
                .instructions
                .iter()
                .filter(|info| info.has_target())
                .map(|info| info.target)
                .collect();
            let block = &self.blocks[idx];
            if !block.no_fallthrough && block.next != BlockIdx::NULL {
                successors.push(block.next);
            }
            for succ in successors {
                self.blocks[succ].num_predecessors += 1;
                worklist.push(succ);
            }
        }
        for (idx, block) in self.blocks.iter_mut().enumerate() {
            if !reachable[idx] && !block.instructions.is_empty() {
                trace!("block {idx} is unreachable");
                block.instructions.clear();
                block.num_predecessors = 0;
            }
        }
    }

    /// Turns a trailing jump to the next emitted block into a `NOP`.
    fn remove_redundant_jumps(&mut self) -> bool {
        let mut changed = false;
        for idx in self.emission_order() {
            let next = self.blocks[idx].next;
            let Some(last) = self.blocks[idx].instructions.last_mut() else {
                continue;
            };
            if !last.op.is_unconditional_jump() || last.target != next {
                continue;
            }
            last.set_nop();
            self.blocks[idx].no_fallthrough = false;
            self.clean_basic_block(idx, None);
            changed = true;
        }
        changed
    }

    /// Gives instructions without a line the line of what runs before them.
    fn propagate_line_numbers(&mut self) {
        for idx in self.emission_order() {
            let block = &mut self.blocks[idx];
            if block.instructions.is_empty() {
                continue;
            }
            let mut prev_lineno = None;
            for info in &mut block.instructions {
                if info.lineno.is_none() {
                    info.lineno = prev_lineno;
                } else {
                    prev_lineno = info.lineno;
                }
            }
            let no_fallthrough = block.no_fallthrough;
            let next = block.next;
            let jump_target = block
                .instructions
                .last()
                .filter(|last| last.has_target() && !last.op.is_block_setup())
                .map(|last| last.target);
            if !no_fallthrough && next != BlockIdx::NULL {
                self.inherit_line(next, prev_lineno);
            }
            if let Some(target) = jump_target {
                self.inherit_line(target, prev_lineno);
            }
        }
    }

    fn inherit_line(&mut self, block: BlockIdx, lineno: Option<u32>) {
        let block = &mut self.blocks[block];
        if block.num_predecessors != 1 {
            return;
        }
        if let Some(first) = block.instructions.first_mut() {
            if first.lineno.is_none() {
                first.lineno = lineno;
            }
        }
    }

    /// A block ending in a line-less return takes the last line seen before it.
    fn guarantee_lineno_for_exits(&mut self) {
        let mut lineno = self.first_line();
        for idx in self.emission_order() {
            let block = &mut self.blocks[idx];
            let Some(last) = block.instructions.last().copied() else {
                continue;
            };
            match last.lineno {
                Some(line) => lineno = line,
                None if last.op == Opcode::ReturnValue => {
                    for info in &mut block.instructions {
                        info.lineno.get_or_insert(lineno);
                    }
                }
                None => {}
            }
        }
    }

    /// Forward unconditional jumps become `JUMP_FORWARD`, backward ones
    /// `JUMP_ABSOLUTE`.
    fn normalize_jumps(&mut self) {
        let mut seen = vec![false; self.blocks.len()];
        for idx in self.emission_order() {
            seen[idx.idx()] = true;
            let Some(last) = self.blocks[idx].instructions.last_mut() else {
                continue;
            };
            if last.target == BlockIdx::NULL {
                continue;
            }
            let backward = seen[last.target.idx()];
            match last.op {
                Opcode::JumpAbsolute if !backward => last.op = Opcode::JumpForward,
                Opcode::JumpForward if backward => last.op = Opcode::JumpAbsolute,
                _ => {}
            }
        }
    }

    /// [`skip_empty`](Self::skip_empty) for a graph whose block `current`
    /// has had its instructions taken out.
    fn skip_empty_except(
        &self,
        mut block: BlockIdx,
        current: BlockIdx,
        current_len: usize,
    ) -> BlockIdx {
        loop {
            if block == BlockIdx::NULL {
                return block;
            }
            let b = &self.blocks[block];
            let len = if block == current {
                current_len
            } else {
                b.instructions.len()
            };
            if len != 0 || b.next == BlockIdx::NULL {
                return block;
            }
            block = b.next;
        }
    }
}

type Rule = fn(&mut BlockRewriter<'_, '_>, usize) -> Option<usize>;

/// Rule for an opcode. A rule returns the index to continue at, or `None`
/// to move on to the next instruction.
fn handler(op: Opcode) -> Option<Rule> {
    use Opcode::*;
    let rule: Rule = match op {
        LoadConst => opt_load_const,
        ReturnValue | RaiseVarargs | Reraise => opt_scope_exit,
        JumpAbsolute | JumpForward | PopJumpIfFalse | PopJumpIfTrue | JumpIfFalseOrPop
        | JumpIfTrueOrPop | ForIter | JumpIfNotExcMatch => opt_jump,
        BuildTuple | BuildList | BuildSet => opt_build,
        UnaryPositive | UnaryNegative | UnaryInvert | UnaryNot => opt_unary,
        CompareOp | IsOp | ContainsOp => opt_negated_test,
        BinaryMatrixMultiply | BinaryPower | BinaryMultiply | BinaryModulo | BinaryAdd
        | BinarySubtract | BinarySubscr | BinaryFloorDivide | BinaryTrueDivide
        | BinaryLshift | BinaryRshift | BinaryAnd | BinaryXor | BinaryOr => opt_binary,
        RotTwo | RotThree | RotFour | RotN => opt_rotations,
        _ => return None,
    };
    Some(rule)
}

/// Working state for the rules of one block. The block's instructions are
/// taken out of the graph while it is being rewritten.
struct BlockRewriter<'g, 'a> {
    graph: &'g mut FlowGraph<'a>,
    block: BlockIdx,
    instructions: Vec<InstructionInfo>,
    limits: &'g FoldLimits,
    /// Emission position of every block, `usize::MAX` when not emitted.
    positions: &'g [usize],
}

impl BlockRewriter<'_, '_> {
    fn block_instructions(&self, block: BlockIdx) -> &[InstructionInfo] {
        if block == self.block {
            &self.instructions
        } else {
            &self.graph.blocks[block].instructions
        }
    }

    fn skip_empty(&self, block: BlockIdx) -> BlockIdx {
        self.graph
            .skip_empty_except(block, self.block, self.instructions.len())
    }

    fn constant(&self, info: &InstructionInfo) -> Option<ConstantData> {
        if info.op != Opcode::LoadConst {
            return None;
        }
        self.graph.consts.get(info.arg.get()).cloned()
    }

    /// Indices of the `n` constant loads that feed instruction `i`, skipping
    /// `NOP`s between them.
    fn const_run(&self, i: usize, n: usize) -> Option<Vec<usize>> {
        let mut run = Vec::with_capacity(n);
        let mut j = i;
        while run.len() < n {
            j = j.checked_sub(1)?;
            match self.instructions[j].op {
                Opcode::Nop => {}
                Opcode::LoadConst => run.push(j),
                _ => return None,
            }
        }
        run.reverse();
        Some(run)
    }

    /// Replaces the loads at `run` and the instruction at `i` with a single
    /// load of `value`.
    fn replace_with_const(&mut self, run: &[usize], i: usize, value: ConstantData) {
        for &j in run {
            self.instructions[j].set_nop();
        }
        let index = self.graph.consts.intern(value);
        let info = &mut self.instructions[i];
        info.op = Opcode::LoadConst;
        info.arg = OpArg::new(index);
        info.target = BlockIdx::NULL;
    }

    fn truncate_after(&mut self, i: usize) {
        if self.instructions.len() > i + 1 {
            trace!(
                "dropping {} dead instructions in block {}",
                self.instructions.len() - i - 1,
                self.block
            );
            self.instructions.truncate(i + 1);
        }
    }

    fn is_later(&self, block: BlockIdx) -> bool {
        let pos = |b: BlockIdx| self.positions.get(b.idx()).copied().unwrap_or(usize::MAX);
        let target = pos(block);
        target != usize::MAX && target > pos(self.block)
    }
}

/// `LOAD_CONST` feeding a conditional jump decides the jump now.
fn opt_load_const(rw: &mut BlockRewriter<'_, '_>, i: usize) -> Option<usize> {
    let next_op = rw.instructions.get(i + 1)?.op;
    if !next_op.is_conditional_jump() {
        return None;
    }
    let value = rw.constant(&rw.instructions[i])?;
    let taken = value.is_truthy() == next_op.jumps_on_true();
    trace!("constant {value} decides {next_op} (taken: {taken})");
    match next_op {
        Opcode::PopJumpIfFalse | Opcode::PopJumpIfTrue => {
            rw.instructions[i].set_nop();
            if taken {
                rw.instructions[i + 1].op = Opcode::JumpAbsolute;
            } else {
                rw.instructions[i + 1].set_nop();
            }
        }
        _ => {
            if taken {
                rw.instructions[i + 1].op = Opcode::JumpAbsolute;
            } else {
                rw.instructions[i].set_nop();
                rw.instructions[i + 1].set_nop();
            }
        }
    }
    None
}

fn opt_scope_exit(rw: &mut BlockRewriter<'_, '_>, i: usize) -> Option<usize> {
    rw.truncate_after(i);
    let block = &mut rw.graph.blocks[rw.block];
    block.is_exit = true;
    block.no_fallthrough = true;
    None
}

const fn pop_jump_for(op: Opcode) -> Opcode {
    if op.jumps_on_true() {
        Opcode::PopJumpIfTrue
    } else {
        Opcode::PopJumpIfFalse
    }
}

fn is_jump_or_pop(op: Opcode) -> bool {
    matches!(op, Opcode::JumpIfFalseOrPop | Opcode::JumpIfTrueOrPop)
}

/// Threads jumps through unconditional jumps and through conditional jumps
/// reached by a `JUMP_IF_X_OR_POP`, then drops code after an unconditional
/// jump.
fn opt_jump(rw: &mut BlockRewriter<'_, '_>, i: usize) -> Option<usize> {
    let mut visited = Vec::new();
    loop {
        let info = rw.instructions[i];
        let target = rw.skip_empty(info.target);
        if target == BlockIdx::NULL || visited.contains(&target) {
            break;
        }
        visited.push(target);
        let target_insts = rw.block_instructions(target);
        let Some(&first) = target_insts.first() else {
            break;
        };
        let (op, dest) = if first.op.is_unconditional_jump() {
            (info.op, rw.skip_empty(first.target))
        } else if is_jump_or_pop(info.op) && first.op.is_conditional_jump() {
            if info.op.jumps_on_true() == first.op.jumps_on_true() {
                // the second test repeats the first, take over its jump
                (first.op, rw.skip_empty(first.target))
            } else if target_insts.len() == 1 {
                // the second test fails for the value the first one jumped with
                let after = rw.skip_empty(rw.graph.blocks[target].next);
                (pop_jump_for(info.op), after)
            } else {
                break;
            }
        } else {
            break;
        };
        if dest == BlockIdx::NULL || (op, dest) == (info.op, info.target) {
            break;
        }
        let relative = rw.graph.spec.jump_kind(op) == Some(JumpKind::Relative);
        if relative && op != Opcode::JumpForward && !rw.is_later(dest) {
            break;
        }
        trace!(
            "threading {} in block {}: {} -> {op} to {dest}",
            info.op, rw.block, info.target
        );
        let info = &mut rw.instructions[i];
        info.op = op;
        info.target = dest;
    }
    if rw.instructions[i].op.is_unconditional_jump() {
        rw.truncate_after(i);
        rw.graph.blocks[rw.block].no_fallthrough = true;
    }
    None
}

/// Folds builds of constants and cancels a build followed by its own unpack.
fn opt_build(rw: &mut BlockRewriter<'_, '_>, i: usize) -> Option<usize> {
    let info = rw.instructions[i];
    let n = info.arg.get() as usize;
    let next = rw.instructions.get(i + 1).copied();

    let consumed_as_iterable = next.is_some_and(|next| match next.op {
        Opcode::GetIter | Opcode::ContainsOp => true,
        Opcode::CompareOp => matches!(
            ComparisonOperator::from_index(next.arg.get()),
            Some(ComparisonOperator::In | ComparisonOperator::NotIn)
        ),
        _ => false,
    });
    if info.op == Opcode::BuildTuple || consumed_as_iterable {
        if let Some(run) = rw.const_run(i, n) {
            let elements: Option<Vec<_>> = run
                .iter()
                .map(|&j| rw.constant(&rw.instructions[j]))
                .collect();
            if let Some(elements) = elements {
                let value = if info.op == Opcode::BuildSet {
                    ConstantData::frozenset(elements)
                } else {
                    ConstantData::Tuple { elements }
                };
                trace!("folding {} {n} into {value}", info.op);
                rw.replace_with_const(&run, i, value);
                return Some(i);
            }
        }
    }

    let next = next?;
    if info.op == Opcode::BuildSet
        || next.op != Opcode::UnpackSequence
        || next.arg.get() as usize != n
    {
        return None;
    }
    match n {
        0 | 1 => {
            rw.instructions[i].set_nop();
            rw.instructions[i + 1].set_nop();
        }
        2 => {
            rw.instructions[i].op = Opcode::RotTwo;
            rw.instructions[i].arg = OpArg::NULL;
            rw.instructions[i + 1].set_nop();
        }
        3 => {
            rw.instructions[i].op = Opcode::RotThree;
            rw.instructions[i].arg = OpArg::NULL;
            rw.instructions[i + 1].op = Opcode::RotTwo;
            rw.instructions[i + 1].arg = OpArg::NULL;
        }
        _ => return None,
    }
    trace!("build/unpack of {n} reduced to stack shuffles");
    None
}

fn opt_unary(rw: &mut BlockRewriter<'_, '_>, i: usize) -> Option<usize> {
    let op = rw.instructions[i].op;
    if let Some(run) = rw.const_run(i, 1) {
        let operand = rw.constant(&rw.instructions[run[0]])?;
        let unary = UnaryOperator::from_opcode(op)?;
        match fold::unary_op(unary, &operand) {
            Ok(value) => {
                rw.replace_with_const(&run, i, value);
                return Some(i);
            }
            Err(err) => debug!("not folding {op} {operand}: {err}"),
        }
        return None;
    }
    // `not x` feeding a pop-jump is the opposite pop-jump
    let next = rw.instructions.get(i + 1)?.op;
    let flipped = match (op, next) {
        (Opcode::UnaryNot, Opcode::PopJumpIfFalse) => Opcode::PopJumpIfTrue,
        (Opcode::UnaryNot, Opcode::PopJumpIfTrue) => Opcode::PopJumpIfFalse,
        _ => return None,
    };
    rw.instructions[i].set_nop();
    rw.instructions[i + 1].op = flipped;
    None
}

/// A membership or identity test followed by `UNARY_NOT` becomes the
/// inverted test.
fn opt_negated_test(rw: &mut BlockRewriter<'_, '_>, i: usize) -> Option<usize> {
    if rw.instructions.get(i + 1)?.op != Opcode::UnaryNot {
        return None;
    }
    let info = rw.instructions[i];
    let arg = match info.op {
        Opcode::CompareOp => ComparisonOperator::from_index(info.arg.get())?
            .inverse()?
            .index(),
        Opcode::IsOp | Opcode::ContainsOp if info.arg.get() <= 1 => info.arg.get() ^ 1,
        _ => return None,
    };
    rw.instructions[i].arg = OpArg::new(arg);
    rw.instructions[i + 1].set_nop();
    None
}

fn opt_binary(rw: &mut BlockRewriter<'_, '_>, i: usize) -> Option<usize> {
    let op = rw.instructions[i].op;
    let binary = BinaryOperator::from_opcode(op)?;
    let run = rw.const_run(i, 2)?;
    let left = rw.constant(&rw.instructions[run[0]])?;
    let right = rw.constant(&rw.instructions[run[1]])?;
    match fold::binary_op(binary, &left, &right, rw.limits) {
        Ok(value) => {
            trace!("folded {left} {} {right} into {value}", binary.symbol());
            rw.replace_with_const(&run, i, value);
            Some(i)
        }
        Err(err) => {
            debug!("not folding {left} {} {right}: {err}", binary.symbol());
            None
        }
    }
}

/// `w` identical rotations of width `w` leave the stack unchanged.
fn opt_rotations(rw: &mut BlockRewriter<'_, '_>, i: usize) -> Option<usize> {
    let info = rw.instructions[i];
    let width = info.op.rotation_width(info.arg.get())? as usize;
    if width < 2 || i + width > rw.instructions.len() {
        return None;
    }
    let group = &rw.instructions[i..i + width];
    if !group.iter().all(|r| r.op == info.op && r.arg == info.arg) {
        return None;
    }
    trace!("cancelling {width} x {}", info.op);
    for r in &mut rw.instructions[i..i + width] {
        r.set_nop();
    }
    Some(i + width)
}
