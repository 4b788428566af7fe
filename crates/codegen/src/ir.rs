use core::{fmt, ops};

use crate::{
    IndexSet, InternalResult, byte_opt, compile::CompileOpts, consts::ConstantPool,
    error::InternalError,
};
use log::{debug, trace};
use stackasm_compiler_core::{
    CodeFlags, CodeObject, CodeUnit, ComparisonOperator, ConstantData, JumpKind, OpArg, Opcode,
    OpcodeSpec, bytecode::ArgKind, lnotab::LineTableBuilder,
};

/// Metadata for a code unit
#[derive(Clone, Debug)]
pub struct CodeUnitMetadata {
    pub name: String,
    pub docstring: Option<String>,
    pub is_class: bool,
    pub names: IndexSet<String>,
    pub varnames: IndexSet<String>,
    pub cellvars: IndexSet<String>,
    pub freevars: IndexSet<String>,
    pub argcount: u32,
    pub posonlyargcount: u32,
    pub kwonlyargcount: u32,
    /// 0 when the first line should come from the first instruction that has one.
    pub firstlineno: u32,
}

impl CodeUnitMetadata {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            docstring: None,
            is_class: false,
            names: IndexSet::default(),
            varnames: IndexSet::default(),
            cellvars: IndexSet::default(),
            freevars: IndexSet::default(),
            argcount: 0,
            posonlyargcount: 0,
            kwonlyargcount: 0,
            firstlineno: 0,
        }
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct BlockIdx(u32);

impl BlockIdx {
    pub const NULL: Self = Self::new(u32::MAX);
    pub const ENTRY: Self = Self::new(0);

    /// Creates a new instance of [`BlockIdx`] from a [`u32`].
    #[must_use]
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    /// Returns the inner value as a [`usize`].
    #[must_use]
    pub const fn idx(self) -> usize {
        self.0 as usize
    }
}

impl From<BlockIdx> for u32 {
    fn from(block_idx: BlockIdx) -> Self {
        block_idx.0
    }
}

impl fmt::Display for BlockIdx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::NULL {
            f.write_str("-")
        } else {
            self.0.fmt(f)
        }
    }
}

impl ops::Index<BlockIdx> for [Block] {
    type Output = Block;

    fn index(&self, idx: BlockIdx) -> &Block {
        &self[idx.idx()]
    }
}

impl ops::IndexMut<BlockIdx> for [Block] {
    fn index_mut(&mut self, idx: BlockIdx) -> &mut Block {
        &mut self[idx.idx()]
    }
}

impl ops::Index<BlockIdx> for Vec<Block> {
    type Output = Block;

    fn index(&self, idx: BlockIdx) -> &Block {
        &self[idx.idx()]
    }
}

impl ops::IndexMut<BlockIdx> for Vec<Block> {
    fn index_mut(&mut self, idx: BlockIdx) -> &mut Block {
        &mut self[idx.idx()]
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InstructionInfo {
    pub op: Opcode,
    /// Resolved operand. For jumps it is filled in by [`FlowGraph::flatten`].
    pub arg: OpArg,
    pub target: BlockIdx,
    pub lineno: Option<u32>,
}

impl InstructionInfo {
    #[must_use]
    pub const fn new(op: Opcode, arg: OpArg, lineno: Option<u32>) -> Self {
        Self {
            op,
            arg,
            target: BlockIdx::NULL,
            lineno,
        }
    }

    #[must_use]
    pub fn has_target(&self) -> bool {
        self.target != BlockIdx::NULL
    }

    /// Turns the instruction into a `NOP`, keeping its line.
    pub const fn set_nop(&mut self) {
        self.op = Opcode::Nop;
        self.arg = OpArg::NULL;
        self.target = BlockIdx::NULL;
    }
}

/// Logical operand given when an instruction is emitted.
#[derive(Clone, Debug, PartialEq)]
pub enum Operand {
    None,
    Raw(u32),
    Const(ConstantData),
    /// Global, attribute or other `co_names` entry.
    Name(String),
    Local(String),
    /// Cell or free variable.
    Closure(String),
    Compare(ComparisonOperator),
}

#[derive(Debug, Clone)]
pub struct Block {
    pub instructions: Vec<InstructionInfo>,
    pub next: BlockIdx,
    pub out_edges: IndexSet<BlockIdx>,
    pub no_fallthrough: bool,
    pub returns: bool,
    pub is_exit: bool,
    pub label: Option<String>,
    pub num_predecessors: u32,
}

impl Default for Block {
    fn default() -> Self {
        Self {
            instructions: Vec::new(),
            next: BlockIdx::NULL,
            out_edges: IndexSet::default(),
            no_fallthrough: false,
            returns: false,
            is_exit: false,
            label: None,
            num_predecessors: 0,
        }
    }
}

/// Bytes and line table of a flattened graph.
#[derive(Clone, Debug)]
pub struct Assembled {
    pub instructions: Vec<CodeUnit>,
    pub linetable: Box<[u8]>,
    pub first_line: u32,
}

/// Control flow graph of one compiled unit.
pub struct FlowGraph<'a> {
    pub spec: &'a dyn OpcodeSpec,
    pub flags: CodeFlags,
    pub source_path: String,

    pub blocks: Vec<Block>,
    pub current_block: BlockIdx,

    pub metadata: CodeUnitMetadata,
    pub consts: ConstantPool,

    lineno: Option<u32>,
    first_inst_lineno: Option<u32>,
}

impl<'a> FlowGraph<'a> {
    pub fn new(metadata: CodeUnitMetadata, spec: &'a dyn OpcodeSpec) -> Self {
        let consts = ConstantPool::for_unit(
            &metadata.name,
            metadata.is_class,
            metadata.docstring.as_deref(),
        );
        Self {
            spec,
            flags: CodeFlags::empty(),
            source_path: String::new(),
            blocks: vec![Block::default()],
            current_block: BlockIdx::ENTRY,
            metadata,
            consts,
            lineno: None,
            first_inst_lineno: None,
        }
    }

    pub fn new_block(&mut self) -> BlockIdx {
        let idx = BlockIdx::new(self.blocks.len() as u32);
        self.blocks.push(Block::default());
        idx
    }

    pub fn new_labeled_block(&mut self, label: impl Into<String>) -> BlockIdx {
        let idx = self.new_block();
        self.blocks[idx].label = Some(label.into());
        idx
    }

    /// Appends `block` to the emission order and makes it current.
    pub fn switch_to_block(&mut self, block: BlockIdx) {
        let prev = self.current_block;
        assert_ne!(prev, block, "recursive switching {prev:?} -> {block:?}");
        assert_eq!(
            self.blocks[block].next,
            BlockIdx::NULL,
            "switching {prev:?} -> {block:?} to completed block"
        );
        let prev_block = &mut self.blocks[prev];
        assert_eq!(
            prev_block.next,
            BlockIdx::NULL,
            "switching {prev:?} -> {block:?} from block that's already got a next"
        );
        prev_block.next = block;
        self.current_block = block;
    }

    /// Starts a fresh block that the current one falls through to.
    pub fn next_block(&mut self) -> BlockIdx {
        let block = self.new_block();
        self.switch_to_block(block);
        block
    }

    pub const fn set_lineno(&mut self, lineno: u32) {
        self.lineno = Some(lineno);
    }

    pub const fn lineno(&self) -> Option<u32> {
        self.lineno
    }

    pub fn emit(&mut self, op: Opcode, operand: Operand) -> InternalResult<()> {
        self.check_supported(op)?;
        if self.spec.has_jump(op) {
            return Err(InternalError::OperandMismatch { opcode: op });
        }
        let arg = self.resolve_operand(op, operand)?;
        self.push_instruction(InstructionInfo::new(op, OpArg::new(arg), self.lineno));
        Ok(())
    }

    pub fn emit_jump(&mut self, op: Opcode, target: BlockIdx) -> InternalResult<()> {
        self.check_supported(op)?;
        if !self.spec.has_jump(op) {
            return Err(InternalError::OperandMismatch { opcode: op });
        }
        let mut info = InstructionInfo::new(op, OpArg::NULL, self.lineno);
        info.target = target;
        self.blocks[self.current_block].out_edges.insert(target);
        self.push_instruction(info);
        Ok(())
    }

    /// Emits a zero-width `SET_LINENO` marker; instructions without a line of
    /// their own that follow it are attributed to `lineno`.
    pub fn mark_line(&mut self, lineno: u32) {
        self.lineno = Some(lineno);
        let info = InstructionInfo::new(Opcode::SetLineno, OpArg::new(lineno), Some(lineno));
        self.push_instruction(info);
    }

    fn check_supported(&self, op: Opcode) -> InternalResult<()> {
        if !op.is_pseudo() {
            self.spec.to_byte_checked(op)?;
        }
        Ok(())
    }

    fn push_instruction(&mut self, info: InstructionInfo) {
        if self.first_inst_lineno.is_none() {
            self.first_inst_lineno = info.lineno;
        }
        self.blocks[self.current_block].instructions.push(info);
    }

    fn resolve_operand(&mut self, op: Opcode, operand: Operand) -> InternalResult<u32> {
        let kind = ArgKind::of(op, self.spec);
        let arg = match (kind, operand) {
            (ArgKind::None, Operand::None) => 0,
            (ArgKind::Raw, Operand::Raw(raw)) => raw,
            (ArgKind::Const, Operand::Const(value)) => self.consts.intern(value),
            (ArgKind::Name, Operand::Name(name)) => {
                self.metadata.names.insert_full(name).0 as u32
            }
            (ArgKind::Local, Operand::Local(name)) => {
                self.metadata.varnames.insert_full(name).0 as u32
            }
            (ArgKind::Closure, Operand::Closure(name)) => self.closure_index(&name)?,
            (ArgKind::Compare, Operand::Compare(cmp)) => cmp.index(),
            _ => return Err(InternalError::OperandMismatch { opcode: op }),
        };
        Ok(arg)
    }

    /// Closure slots number cell variables first, then free variables. A name
    /// that is both a cell and a free variable refers to the free slot.
    fn closure_index(&self, name: &str) -> InternalResult<u32> {
        let meta = &self.metadata;
        if let Some(free) = meta.freevars.get_index_of(name) {
            return Ok((meta.cellvars.len() + free) as u32);
        }
        meta.cellvars
            .get_index_of(name)
            .map(|cell| cell as u32)
            .ok_or_else(|| InternalError::MissingSymbol(name.to_owned()))
    }

    pub fn iter_blocks(&self) -> impl Iterator<Item = (BlockIdx, &Block)> + '_ {
        iter_blocks(&self.blocks)
    }

    /// Blocks in emission order.
    pub fn emission_order(&self) -> Vec<BlockIdx> {
        self.iter_blocks().map(|(idx, _)| idx).collect()
    }

    /// Follows `next` from an empty block to the block whose code actually
    /// starts at the same offset.
    pub fn skip_empty(&self, mut block: BlockIdx) -> BlockIdx {
        while block != BlockIdx::NULL
            && self.blocks[block].instructions.is_empty()
            && self.blocks[block].next != BlockIdx::NULL
        {
            block = self.blocks[block].next;
        }
        block
    }

    /// First line of the unit: the declared one, else the first instruction's.
    pub fn first_line(&self) -> u32 {
        match self.metadata.firstlineno {
            0 => self.first_inst_lineno.filter(|&l| l != 0).unwrap_or(1),
            line => line,
        }
    }

    pub fn max_stackdepth(&self, verify_balance: bool) -> InternalResult<u32> {
        let mut maxdepth = 0u32;
        let mut stack = Vec::with_capacity(self.blocks.len());
        let mut start_depths: Vec<Option<u32>> = vec![None; self.blocks.len()];
        let initial = u32::from(self.flags.is_generator_like());
        start_depths[0] = Some(initial);
        stack.push(BlockIdx::ENTRY);
        // depths only grow, so every block is re-queued a bounded number of times
        let max_iterations = self.blocks.len() * 100;
        let mut iterations = 0usize;
        'process_blocks: while let Some(block_idx) = stack.pop() {
            iterations += 1;
            if iterations > max_iterations {
                return Err(InternalError::StackOverflow);
            }
            let Some(mut depth) = start_depths[block_idx.idx()] else {
                continue;
            };
            trace!("stack depth: block {block_idx} starts at {depth}");
            let block = &self.blocks[block_idx];
            for ins in &block.instructions {
                let effect = self.spec.stack_effect(ins.op, ins.arg.get(), false)?;
                let new_depth = apply_effect(depth, effect)?;
                trace!("  {} {}: {depth} {effect:+} => {new_depth}", ins.op, ins.arg);
                maxdepth = maxdepth.max(new_depth);
                if ins.has_target() {
                    let jump_effect = self.spec.stack_effect(ins.op, ins.arg.get(), true)?;
                    let target_depth = apply_effect(depth, jump_effect)?;
                    maxdepth = maxdepth.max(target_depth);
                    stackdepth_push(
                        &mut stack,
                        &mut start_depths,
                        ins.target,
                        target_depth,
                        verify_balance,
                    )?;
                }
                depth = new_depth;
                if ins.op.is_scope_exit() || ins.op.is_unconditional_jump() {
                    continue 'process_blocks;
                }
            }
            if block.next != BlockIdx::NULL {
                stackdepth_push(
                    &mut stack,
                    &mut start_depths,
                    block.next,
                    depth,
                    verify_balance,
                )?;
            }
        }
        debug!(
            "max stack depth of {} is {maxdepth} ({iterations} block visits)",
            self.metadata.name
        );
        Ok(maxdepth)
    }

    /// Resolves every jump operand, growing `EXTENDED_ARG` prefixes until the
    /// layout is stable. Returns the code-unit offset of each emitted block.
    pub fn flatten(&mut self) -> InternalResult<Vec<Option<u32>>> {
        let retarget: Vec<BlockIdx> = (0..self.blocks.len())
            .map(|i| self.skip_empty(BlockIdx::new(i as u32)))
            .collect();
        for block in &mut self.blocks {
            for info in &mut block.instructions {
                if info.has_target() {
                    info.target = retarget[info.target.idx()];
                }
            }
        }

        let order = self.emission_order();
        let spec = self.spec;
        let mut block_to_offset: Vec<Option<u32>> = vec![None; self.blocks.len()];
        let mut passes = 0usize;
        loop {
            passes += 1;
            let mut num_units = 0u32;
            for &idx in &order {
                block_to_offset[idx.idx()] = Some(num_units);
                for info in &self.blocks[idx].instructions {
                    num_units += instr_units(info);
                }
            }

            let mut recompile_extended_arg = false;
            for &idx in &order {
                let mut pc = block_to_offset[idx.idx()].unwrap_or_default();
                for info in &mut self.blocks[idx].instructions {
                    let pc_after = pc + instr_units(info);
                    if let Some(kind) = spec.jump_kind(info.op) {
                        let target_offset = (info.target != BlockIdx::NULL)
                            .then(|| block_to_offset[info.target.idx()])
                            .flatten()
                            .ok_or(InternalError::DanglingJump { opcode: info.op })?;
                        let units = match kind {
                            JumpKind::Absolute => target_offset,
                            JumpKind::Relative => target_offset.checked_sub(pc_after).ok_or(
                                InternalError::BackwardRelativeJump { opcode: info.op },
                            )?,
                        };
                        let new_arg = OpArg::new(spec.units_to_jump_arg(units));
                        recompile_extended_arg |= new_arg.instr_size() != info.arg.instr_size();
                        info.arg = new_arg;
                    }
                    pc = pc_after;
                }
            }

            if !recompile_extended_arg {
                break;
            }
        }
        debug!(
            "flattened {} in {passes} pass{}",
            self.metadata.name,
            if passes == 1 { "" } else { "es" }
        );
        Ok(block_to_offset)
    }

    /// Encodes the flattened graph into code units and a line table.
    pub fn assemble(&self) -> InternalResult<Assembled> {
        let first_line = self.first_line();
        let extended_arg = self.spec.extended_arg();
        let unit_bytes = self.spec.code_unit_size() as u32;
        let mut instructions = Vec::new();
        let mut lines = LineTableBuilder::new(first_line);
        let mut marker_line = None;
        for (_, block) in self.iter_blocks() {
            for info in &block.instructions {
                if info.op.is_pseudo() {
                    marker_line = info.lineno;
                    continue;
                }
                lines.next_line(info.lineno.or(marker_line));
                let op = self.spec.to_byte_checked(info.op)?;
                let (extras, lo_arg) = info.arg.split();
                instructions.extend(
                    extras
                        .map(|byte| CodeUnit::new(extended_arg, byte))
                        .chain([CodeUnit::new(op, lo_arg)]),
                );
                lines.add_code(info.arg.instr_size() as u32 * unit_bytes);
            }
        }
        Ok(Assembled {
            instructions,
            linetable: lines.finish(),
            first_line,
        })
    }

    /// Recomputes each block's `out_edges` from its jump targets.
    pub fn refresh_out_edges(&mut self) {
        for block in &mut self.blocks {
            block.out_edges = block
                .instructions
                .iter()
                .filter(|info| info.has_target())
                .map(|info| info.target)
                .collect();
        }
    }

    /// Optimizes, measures and encodes the graph into a code object.
    pub fn finalize_code(mut self, opts: &CompileOpts) -> InternalResult<CodeObject> {
        if opts.peephole {
            self.optimize(&opts.bytecode_limits);
        }
        let max_stackdepth = self.max_stackdepth(opts.verify_stack_balance)?;
        self.flatten()?;
        let Assembled {
            mut instructions,
            mut linetable,
            first_line,
        } = self.assemble()?;

        let Self {
            spec,
            flags,
            source_path,
            blocks: _,
            current_block: _,
            metadata,
            consts,
            lineno: _,
            first_inst_lineno: _,
        } = self;
        let mut constants = consts.into_boxed_slice();

        if opts.byte_peephole {
            for pass in 1..=opts.peephole_max_passes {
                let Some(out) = byte_opt::optimize_code(
                    &instructions,
                    &constants,
                    &linetable,
                    first_line,
                    spec,
                    &opts.bytecode_limits,
                ) else {
                    break;
                };
                if out.code == instructions && out.constants.len() == constants.len() {
                    debug!("{}: bytecode stable after {pass} pass(es)", metadata.name);
                    break;
                }
                instructions = out.code;
                constants = out.constants;
                linetable = out.linetable;
            }
        }

        let CodeUnitMetadata {
            name: obj_name,
            names,
            varnames,
            cellvars,
            freevars,
            argcount: arg_count,
            posonlyargcount: posonlyarg_count,
            kwonlyargcount: kwonlyarg_count,
            ..
        } = metadata;

        Ok(CodeObject {
            instructions: instructions.into_boxed_slice(),
            version: spec.version(),
            flags,
            posonlyarg_count,
            arg_count,
            kwonlyarg_count,
            source_path,
            first_line_number: first_line,
            max_stackdepth,
            obj_name,
            constants,
            names: names.into_iter().collect(),
            varnames: varnames.into_iter().collect(),
            cellvars: cellvars.into_iter().collect(),
            freevars: freevars.into_iter().collect(),
            linetable,
        })
    }
}

fn apply_effect(depth: u32, effect: i32) -> InternalResult<u32> {
    depth.checked_add_signed(effect).ok_or({
        if effect < 0 {
            InternalError::StackUnderflow
        } else {
            InternalError::StackOverflow
        }
    })
}

const fn instr_units(info: &InstructionInfo) -> u32 {
    if info.op.is_pseudo() {
        0
    } else {
        info.arg.instr_size() as u32
    }
}

fn stackdepth_push(
    stack: &mut Vec<BlockIdx>,
    start_depths: &mut [Option<u32>],
    target: BlockIdx,
    depth: u32,
    verify_balance: bool,
) -> InternalResult<()> {
    let block_depth = &mut start_depths[target.idx()];
    match *block_depth {
        Some(expected) if verify_balance && expected != depth => {
            Err(InternalError::UnbalancedStack {
                block: target.into(),
                expected,
                found: depth,
            })
        }
        Some(known) if depth <= known => Ok(()),
        _ => {
            *block_depth = Some(depth);
            stack.push(target);
            Ok(())
        }
    }
}

fn iter_blocks(blocks: &[Block]) -> impl Iterator<Item = (BlockIdx, &Block)> + '_ {
    let mut next = BlockIdx::ENTRY;
    core::iter::from_fn(move || {
        if next == BlockIdx::NULL {
            return None;
        }
        let (idx, b) = (next, &blocks[next]);
        next = b.next;
        Some((idx, b))
    })
}

impl fmt::Display for FlowGraph<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (idx, block) in self.iter_blocks() {
            write!(f, "block {idx}")?;
            if let Some(label) = &block.label {
                write!(f, " ({label})")?;
            }
            writeln!(f, " -> {}", block.next)?;
            for info in &block.instructions {
                let line = info.lineno.map_or_else(|| "-".to_owned(), |l| l.to_string());
                write!(f, "  {line:>4} {}", info.op)?;
                if info.has_target() {
                    writeln!(f, " to block {}", info.target)?;
                } else {
                    writeln!(f, " {}", info.arg)?;
                }
            }
        }
        Ok(())
    }
}
