//! Symbolic opcodes and the versioned tables that give them numbers.
//!
//! The assembler and both optimizers only ever talk about [`Opcode`]s; the
//! numeric identity of an opcode, whether it jumps, and how it moves the value
//! stack all come from an [`OpcodeSpec`] chosen once per compilation.

use core::{fmt, str::FromStr};
use std::sync::LazyLock;

use thiserror::Error;

macro_rules! define_opcodes {
    ($($variant:ident => $name:literal,)*) => {
        /// A version-independent opcode identifier.
        #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum Opcode {
            $($variant,)*
        }

        impl Opcode {
            pub const ALL: &'static [Self] = &[$(Self::$variant,)*];
            pub const COUNT: usize = Self::ALL.len();

            #[must_use]
            pub const fn name(self) -> &'static str {
                match self {
                    $(Self::$variant => $name,)*
                }
            }

            #[must_use]
            pub fn from_name(name: &str) -> Option<Self> {
                match name {
                    $($name => Some(Self::$variant),)*
                    _ => None,
                }
            }
        }
    };
}

define_opcodes! {
    PopTop => "POP_TOP",
    RotTwo => "ROT_TWO",
    RotThree => "ROT_THREE",
    DupTop => "DUP_TOP",
    DupTopTwo => "DUP_TOP_TWO",
    RotFour => "ROT_FOUR",
    Nop => "NOP",
    UnaryPositive => "UNARY_POSITIVE",
    UnaryNegative => "UNARY_NEGATIVE",
    UnaryNot => "UNARY_NOT",
    UnaryInvert => "UNARY_INVERT",
    BinaryMatrixMultiply => "BINARY_MATRIX_MULTIPLY",
    BinaryPower => "BINARY_POWER",
    BinaryMultiply => "BINARY_MULTIPLY",
    BinaryModulo => "BINARY_MODULO",
    BinaryAdd => "BINARY_ADD",
    BinarySubtract => "BINARY_SUBTRACT",
    BinarySubscr => "BINARY_SUBSCR",
    BinaryFloorDivide => "BINARY_FLOOR_DIVIDE",
    BinaryTrueDivide => "BINARY_TRUE_DIVIDE",
    InplaceFloorDivide => "INPLACE_FLOOR_DIVIDE",
    InplaceTrueDivide => "INPLACE_TRUE_DIVIDE",
    InplaceAdd => "INPLACE_ADD",
    InplaceSubtract => "INPLACE_SUBTRACT",
    InplaceMultiply => "INPLACE_MULTIPLY",
    InplaceModulo => "INPLACE_MODULO",
    StoreSubscr => "STORE_SUBSCR",
    DeleteSubscr => "DELETE_SUBSCR",
    BinaryLshift => "BINARY_LSHIFT",
    BinaryRshift => "BINARY_RSHIFT",
    BinaryAnd => "BINARY_AND",
    BinaryXor => "BINARY_XOR",
    BinaryOr => "BINARY_OR",
    InplacePower => "INPLACE_POWER",
    GetIter => "GET_ITER",
    GetYieldFromIter => "GET_YIELD_FROM_ITER",
    PrintExpr => "PRINT_EXPR",
    LoadBuildClass => "LOAD_BUILD_CLASS",
    YieldFrom => "YIELD_FROM",
    GetAwaitable => "GET_AWAITABLE",
    LoadAssertionError => "LOAD_ASSERTION_ERROR",
    InplaceLshift => "INPLACE_LSHIFT",
    InplaceRshift => "INPLACE_RSHIFT",
    InplaceAnd => "INPLACE_AND",
    InplaceXor => "INPLACE_XOR",
    InplaceOr => "INPLACE_OR",
    ListToTuple => "LIST_TO_TUPLE",
    ReturnValue => "RETURN_VALUE",
    ImportStar => "IMPORT_STAR",
    SetupAnnotations => "SETUP_ANNOTATIONS",
    YieldValue => "YIELD_VALUE",
    PopBlock => "POP_BLOCK",
    PopExcept => "POP_EXCEPT",
    StoreName => "STORE_NAME",
    DeleteName => "DELETE_NAME",
    UnpackSequence => "UNPACK_SEQUENCE",
    ForIter => "FOR_ITER",
    UnpackEx => "UNPACK_EX",
    StoreAttr => "STORE_ATTR",
    DeleteAttr => "DELETE_ATTR",
    StoreGlobal => "STORE_GLOBAL",
    DeleteGlobal => "DELETE_GLOBAL",
    RotN => "ROT_N",
    LoadConst => "LOAD_CONST",
    LoadName => "LOAD_NAME",
    BuildTuple => "BUILD_TUPLE",
    BuildList => "BUILD_LIST",
    BuildSet => "BUILD_SET",
    BuildMap => "BUILD_MAP",
    LoadAttr => "LOAD_ATTR",
    CompareOp => "COMPARE_OP",
    ImportName => "IMPORT_NAME",
    ImportFrom => "IMPORT_FROM",
    JumpForward => "JUMP_FORWARD",
    JumpIfFalseOrPop => "JUMP_IF_FALSE_OR_POP",
    JumpIfTrueOrPop => "JUMP_IF_TRUE_OR_POP",
    JumpAbsolute => "JUMP_ABSOLUTE",
    PopJumpIfFalse => "POP_JUMP_IF_FALSE",
    PopJumpIfTrue => "POP_JUMP_IF_TRUE",
    LoadGlobal => "LOAD_GLOBAL",
    IsOp => "IS_OP",
    ContainsOp => "CONTAINS_OP",
    Reraise => "RERAISE",
    JumpIfNotExcMatch => "JUMP_IF_NOT_EXC_MATCH",
    SetupLoop => "SETUP_LOOP",
    SetupExcept => "SETUP_EXCEPT",
    SetupFinally => "SETUP_FINALLY",
    LoadFast => "LOAD_FAST",
    StoreFast => "STORE_FAST",
    DeleteFast => "DELETE_FAST",
    GenStart => "GEN_START",
    RaiseVarargs => "RAISE_VARARGS",
    CallFunction => "CALL_FUNCTION",
    MakeFunction => "MAKE_FUNCTION",
    BuildSlice => "BUILD_SLICE",
    LoadClosure => "LOAD_CLOSURE",
    LoadDeref => "LOAD_DEREF",
    StoreDeref => "STORE_DEREF",
    DeleteDeref => "DELETE_DEREF",
    CallFunctionKw => "CALL_FUNCTION_KW",
    CallFunctionEx => "CALL_FUNCTION_EX",
    SetupWith => "SETUP_WITH",
    ExtendedArg => "EXTENDED_ARG",
    ListAppend => "LIST_APPEND",
    SetAdd => "SET_ADD",
    MapAdd => "MAP_ADD",
    LoadClassderef => "LOAD_CLASSDEREF",
    FormatValue => "FORMAT_VALUE",
    BuildConstKeyMap => "BUILD_CONST_KEY_MAP",
    BuildString => "BUILD_STRING",
    LoadMethod => "LOAD_METHOD",
    CallMethod => "CALL_METHOD",
    ListExtend => "LIST_EXTEND",
    SetUpdate => "SET_UPDATE",
    DictMerge => "DICT_MERGE",
    DictUpdate => "DICT_UPDATE",
    SetLineno => "SET_LINENO",
}

impl Opcode {
    /// Transfers control without a fallthrough edge.
    #[must_use]
    pub const fn is_unconditional_jump(self) -> bool {
        matches!(self, Self::JumpAbsolute | Self::JumpForward)
    }

    /// Leaves the code object, nothing after it in the block can run.
    #[must_use]
    pub const fn is_scope_exit(self) -> bool {
        matches!(self, Self::ReturnValue | Self::RaiseVarargs | Self::Reraise)
    }

    #[must_use]
    pub const fn is_conditional_jump(self) -> bool {
        matches!(
            self,
            Self::PopJumpIfFalse
                | Self::PopJumpIfTrue
                | Self::JumpIfFalseOrPop
                | Self::JumpIfTrueOrPop
        )
    }

    /// Conditional jumps that are taken when the tested value is true.
    #[must_use]
    pub const fn jumps_on_true(self) -> bool {
        matches!(self, Self::PopJumpIfTrue | Self::JumpIfTrueOrPop)
    }

    /// Block-setup jumps: their target is a handler, not a regular successor.
    #[must_use]
    pub const fn is_block_setup(self) -> bool {
        matches!(
            self,
            Self::SetupLoop | Self::SetupExcept | Self::SetupFinally | Self::SetupWith
        )
    }

    /// Zero-width line markers: never encoded, only move the line cursor.
    #[must_use]
    pub const fn is_pseudo(self) -> bool {
        matches!(self, Self::SetLineno)
    }

    /// For rotations, the number of stack items rotated.
    #[must_use]
    pub const fn rotation_width(self, oparg: u32) -> Option<u32> {
        match self {
            Self::RotTwo => Some(2),
            Self::RotThree => Some(3),
            Self::RotFour => Some(4),
            Self::RotN => Some(oparg),
            _ => None,
        }
    }

    const fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum JumpKind {
    /// Operand is an offset from the start of the code.
    Absolute,
    /// Operand is a forward distance from the end of the jump instruction.
    Relative,
}

/// What one step of a jump operand measures.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum JumpUnit {
    Bytes,
    CodeUnits,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum BytecodeVersion {
    /// Block-stack exception handling, identity and membership tests through `COMPARE_OP`.
    Legacy,
    #[default]
    Standard,
}

impl BytecodeVersion {
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Legacy => "legacy",
            Self::Standard => "standard",
        }
    }
}

impl fmt::Display for BytecodeVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for BytecodeVersion {
    type Err = OpcodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "legacy" => Ok(Self::Legacy),
            "standard" => Ok(Self::Standard),
            _ => Err(OpcodeError::UnknownVersion(s.to_owned())),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum OpcodeError {
    #[error("opcode {opcode} is not part of the {version} bytecode")]
    Unsupported {
        opcode: Opcode,
        version: BytecodeVersion,
    },
    #[error("byte {byte} is not an opcode of the {version} bytecode")]
    UnknownByte { byte: u8, version: BytecodeVersion },
    #[error("unknown bytecode version '{0}'")]
    UnknownVersion(String),
    #[error("stack effect of {opcode} with operand {oparg} does not fit in an i32")]
    EffectOutOfRange { opcode: Opcode, oparg: u32 },
}

/// Everything the assembler needs to know about one target VM.
pub trait OpcodeSpec: Send + Sync {
    fn version(&self) -> BytecodeVersion;

    fn to_byte(&self, op: Opcode) -> Option<u8>;

    fn from_byte(&self, byte: u8) -> Option<Opcode>;

    fn jump_kind(&self, op: Opcode) -> Option<JumpKind>;

    fn jump_unit(&self) -> JumpUnit;

    /// Net stack effect of `op`. With `jump` set, the effect along the taken
    /// branch; otherwise the fallthrough effect.
    fn stack_effect(&self, op: Opcode, oparg: u32, jump: bool) -> Result<i32, OpcodeError>;

    /// Byte value of `EXTENDED_ARG`.
    fn extended_arg(&self) -> u8;

    fn code_unit_size(&self) -> usize {
        2
    }

    fn has_jump(&self, op: Opcode) -> bool {
        self.jump_kind(op).is_some()
    }

    fn supports(&self, op: Opcode) -> bool {
        self.to_byte(op).is_some()
    }

    /// Converts a distance in code units to a jump operand.
    fn units_to_jump_arg(&self, units: u32) -> u32 {
        match self.jump_unit() {
            JumpUnit::Bytes => units * self.code_unit_size() as u32,
            JumpUnit::CodeUnits => units,
        }
    }

    /// Converts a jump operand to a distance in code units.
    fn jump_arg_to_units(&self, arg: u32) -> u32 {
        match self.jump_unit() {
            JumpUnit::Bytes => arg / self.code_unit_size() as u32,
            JumpUnit::CodeUnits => arg,
        }
    }

    fn to_byte_checked(&self, op: Opcode) -> Result<u8, OpcodeError> {
        self.to_byte(op).ok_or(OpcodeError::Unsupported {
            opcode: op,
            version: self.version(),
        })
    }
}

/// Table-driven [`OpcodeSpec`].
#[derive(Clone, Debug)]
pub struct OpcodeTable {
    version: BytecodeVersion,
    jump_unit: JumpUnit,
    /// Values pushed on entry to an exception handler.
    handler_words: i32,
    bytes: [Option<u8>; Opcode::COUNT],
    opcodes: [Option<Opcode>; 256],
    jumps: [Option<JumpKind>; Opcode::COUNT],
}

static LEGACY: LazyLock<OpcodeTable> = LazyLock::new(OpcodeTable::legacy);
static STANDARD: LazyLock<OpcodeTable> = LazyLock::new(OpcodeTable::standard);

impl OpcodeTable {
    fn new(version: BytecodeVersion, jump_unit: JumpUnit, handler_words: i32) -> Self {
        Self {
            version,
            jump_unit,
            handler_words,
            bytes: [None; Opcode::COUNT],
            opcodes: [None; 256],
            jumps: [None; Opcode::COUNT],
        }
    }

    fn def_op(&mut self, op: Opcode, byte: u8) {
        debug_assert!(
            self.opcodes[byte as usize].is_none(),
            "byte {byte} assigned twice"
        );
        self.bytes[op.index()] = Some(byte);
        self.opcodes[byte as usize] = Some(op);
    }

    fn jrel_op(&mut self, op: Opcode, byte: u8) {
        self.def_op(op, byte);
        self.jumps[op.index()] = Some(JumpKind::Relative);
    }

    fn jabs_op(&mut self, op: Opcode, byte: u8) {
        self.def_op(op, byte);
        self.jumps[op.index()] = Some(JumpKind::Absolute);
    }

    /// Opcodes shared by every version, with identical numbering.
    fn def_common(&mut self) {
        use Opcode::*;
        for (op, byte) in [
            (PopTop, 1),
            (RotTwo, 2),
            (RotThree, 3),
            (DupTop, 4),
            (DupTopTwo, 5),
            (Nop, 9),
            (UnaryPositive, 10),
            (UnaryNegative, 11),
            (UnaryNot, 12),
            (UnaryInvert, 15),
            (BinaryMatrixMultiply, 16),
            (BinaryPower, 19),
            (BinaryMultiply, 20),
            (BinaryModulo, 22),
            (BinaryAdd, 23),
            (BinarySubtract, 24),
            (BinarySubscr, 25),
            (BinaryFloorDivide, 26),
            (BinaryTrueDivide, 27),
            (InplaceFloorDivide, 28),
            (InplaceTrueDivide, 29),
            (InplaceAdd, 55),
            (InplaceSubtract, 56),
            (InplaceMultiply, 57),
            (InplaceModulo, 59),
            (StoreSubscr, 60),
            (DeleteSubscr, 61),
            (BinaryLshift, 62),
            (BinaryRshift, 63),
            (BinaryAnd, 64),
            (BinaryXor, 65),
            (BinaryOr, 66),
            (InplacePower, 67),
            (GetIter, 68),
            (GetYieldFromIter, 69),
            (PrintExpr, 70),
            (LoadBuildClass, 71),
            (YieldFrom, 72),
            (GetAwaitable, 73),
            (InplaceLshift, 75),
            (InplaceRshift, 76),
            (InplaceAnd, 77),
            (InplaceXor, 78),
            (InplaceOr, 79),
            (ReturnValue, 83),
            (ImportStar, 84),
            (SetupAnnotations, 85),
            (YieldValue, 86),
            (PopBlock, 87),
            (PopExcept, 89),
            (StoreName, 90),
            (DeleteName, 91),
            (UnpackSequence, 92),
            (UnpackEx, 94),
            (StoreAttr, 95),
            (DeleteAttr, 96),
            (StoreGlobal, 97),
            (DeleteGlobal, 98),
            (LoadConst, 100),
            (LoadName, 101),
            (BuildTuple, 102),
            (BuildList, 103),
            (BuildSet, 104),
            (BuildMap, 105),
            (LoadAttr, 106),
            (CompareOp, 107),
            (ImportName, 108),
            (ImportFrom, 109),
            (LoadGlobal, 116),
            (LoadFast, 124),
            (StoreFast, 125),
            (DeleteFast, 126),
            (RaiseVarargs, 130),
            (CallFunction, 131),
            (MakeFunction, 132),
            (BuildSlice, 133),
            (LoadClosure, 135),
            (LoadDeref, 136),
            (StoreDeref, 137),
            (DeleteDeref, 138),
            (CallFunctionKw, 141),
            (CallFunctionEx, 142),
            (ExtendedArg, 144),
            (ListAppend, 145),
            (SetAdd, 146),
            (MapAdd, 147),
            (LoadClassderef, 148),
            (FormatValue, 155),
            (BuildConstKeyMap, 156),
            (BuildString, 157),
            (LoadMethod, 160),
            (CallMethod, 161),
        ] {
            self.def_op(op, byte);
        }
        self.jrel_op(ForIter, 93);
        self.jrel_op(JumpForward, 110);
        self.jabs_op(JumpIfFalseOrPop, 111);
        self.jabs_op(JumpIfTrueOrPop, 112);
        self.jabs_op(JumpAbsolute, 113);
        self.jabs_op(PopJumpIfFalse, 114);
        self.jabs_op(PopJumpIfTrue, 115);
    }

    /// Block-stack VM: byte-valued jumps, three exception words on handler entry.
    #[must_use]
    pub fn legacy() -> Self {
        use Opcode::*;
        let mut table = Self::new(BytecodeVersion::Legacy, JumpUnit::Bytes, 3);
        table.def_common();
        table.jrel_op(SetupLoop, 120);
        table.jrel_op(SetupExcept, 121);
        table.jrel_op(SetupFinally, 122);
        table
    }

    /// Code-unit-valued jumps, dedicated identity/membership opcodes, six
    /// exception words on handler entry.
    #[must_use]
    pub fn standard() -> Self {
        use Opcode::*;
        let mut table = Self::new(BytecodeVersion::Standard, JumpUnit::CodeUnits, 6);
        table.def_common();
        for (op, byte) in [
            (RotFour, 6),
            (LoadAssertionError, 74),
            (ListToTuple, 82),
            (RotN, 99),
            (IsOp, 117),
            (ContainsOp, 118),
            (Reraise, 119),
            (GenStart, 129),
            (ListExtend, 162),
            (SetUpdate, 163),
            (DictMerge, 164),
            (DictUpdate, 165),
        ] {
            table.def_op(op, byte);
        }
        table.jabs_op(JumpIfNotExcMatch, 121);
        table.jrel_op(SetupFinally, 122);
        table.jrel_op(SetupWith, 143);
        table
    }

    #[must_use]
    pub fn for_version(version: BytecodeVersion) -> &'static Self {
        match version {
            BytecodeVersion::Legacy => &LEGACY,
            BytecodeVersion::Standard => &STANDARD,
        }
    }

    /// All opcodes of this table with their byte values.
    pub fn opcodes(&self) -> impl Iterator<Item = (Opcode, u8)> + '_ {
        Opcode::ALL
            .iter()
            .filter_map(|&op| self.bytes[op.index()].map(|b| (op, b)))
    }

    fn raw_effect(&self, op: Opcode, oparg: i64, jump: bool) -> i64 {
        use Opcode::*;
        match op {
            Nop | RotTwo | RotThree | RotFour | RotN | ExtendedArg | SetLineno => 0,
            UnaryPositive | UnaryNegative | UnaryNot | UnaryInvert => 0,
            GetIter | GetYieldFromIter | GetAwaitable | ListToTuple => 0,
            SetupAnnotations | YieldValue | PopBlock | LoadAttr => 0,
            DeleteName | DeleteGlobal | DeleteFast | DeleteDeref => 0,
            JumpForward | JumpAbsolute | SetupLoop => 0,
            PopTop | ReturnValue | PrintExpr | ImportStar | YieldFrom | GenStart => -1,
            BinaryMatrixMultiply | BinaryPower | BinaryMultiply | BinaryModulo | BinaryAdd
            | BinarySubtract | BinarySubscr | BinaryFloorDivide | BinaryTrueDivide
            | BinaryLshift | BinaryRshift | BinaryAnd | BinaryXor | BinaryOr => -1,
            InplaceFloorDivide | InplaceTrueDivide | InplaceAdd | InplaceSubtract
            | InplaceMultiply | InplaceModulo | InplacePower | InplaceLshift | InplaceRshift
            | InplaceAnd | InplaceXor | InplaceOr => -1,
            StoreName | StoreGlobal | StoreFast | StoreDeref | DeleteAttr => -1,
            CompareOp | IsOp | ContainsOp | ImportName => -1,
            PopJumpIfFalse | PopJumpIfTrue => -1,
            ListAppend | SetAdd | ListExtend | SetUpdate | DictMerge | DictUpdate => -1,
            StoreAttr | DeleteSubscr | MapAdd | JumpIfNotExcMatch => -2,
            StoreSubscr => -3,
            DupTop | LoadConst | LoadName | LoadGlobal | LoadFast | LoadClosure | LoadDeref
            | LoadClassderef | LoadBuildClass | LoadAssertionError | LoadMethod | ImportFrom => 1,
            DupTopTwo => 2,
            // legacy handlers pop the exception words themselves
            PopExcept => match self.version {
                BytecodeVersion::Legacy => 0,
                BytecodeVersion::Standard => -3,
            },
            Reraise => -3,
            UnpackSequence => oparg - 1,
            UnpackEx => (oparg & 0xff) + (oparg >> 8),
            ForIter => {
                if jump {
                    -1
                } else {
                    1
                }
            }
            BuildTuple | BuildList | BuildSet | BuildString => 1 - oparg,
            BuildMap => 1 - 2 * oparg,
            BuildConstKeyMap => -oparg,
            JumpIfFalseOrPop | JumpIfTrueOrPop => {
                if jump {
                    0
                } else {
                    -1
                }
            }
            SetupExcept | SetupFinally => {
                if jump {
                    i64::from(self.handler_words)
                } else {
                    0
                }
            }
            SetupWith => {
                if jump {
                    i64::from(self.handler_words)
                } else {
                    1
                }
            }
            RaiseVarargs | CallFunction => -oparg,
            CallFunctionKw | CallMethod => -oparg - 1,
            CallFunctionEx => -1 - (oparg & 0x01),
            MakeFunction => -1 - i64::from((oparg & 0x0f).count_ones()),
            BuildSlice => {
                if oparg == 3 {
                    -2
                } else {
                    -1
                }
            }
            FormatValue => {
                if oparg & 0x04 == 0x04 {
                    -1
                } else {
                    0
                }
            }
        }
    }
}

impl OpcodeSpec for OpcodeTable {
    fn version(&self) -> BytecodeVersion {
        self.version
    }

    fn to_byte(&self, op: Opcode) -> Option<u8> {
        self.bytes[op.index()]
    }

    fn from_byte(&self, byte: u8) -> Option<Opcode> {
        self.opcodes[byte as usize]
    }

    fn jump_kind(&self, op: Opcode) -> Option<JumpKind> {
        self.jumps[op.index()]
    }

    fn jump_unit(&self) -> JumpUnit {
        self.jump_unit
    }

    fn stack_effect(&self, op: Opcode, oparg: u32, jump: bool) -> Result<i32, OpcodeError> {
        if op.is_pseudo() {
            return Ok(0);
        }
        self.to_byte_checked(op)?;
        let effect = self.raw_effect(op, i64::from(oparg), jump);
        i32::try_from(effect).map_err(|_| OpcodeError::EffectOutOfRange { opcode: op, oparg })
    }

    fn extended_arg(&self) -> u8 {
        // every table registers EXTENDED_ARG in `def_common`
        self.bytes[Opcode::ExtendedArg.index()].unwrap_or(144)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_round_trip() {
        for &op in Opcode::ALL {
            assert_eq!(Opcode::from_name(op.name()), Some(op));
        }
        assert_eq!(Opcode::from_name("NOT_AN_OPCODE"), None);
    }

    #[test]
    fn test_tables_are_bijective() {
        for table in [OpcodeTable::legacy(), OpcodeTable::standard()] {
            for (op, byte) in table.opcodes() {
                assert_eq!(table.from_byte(byte), Some(op), "{op} in {}", table.version());
            }
        }
    }

    #[test]
    fn test_versions_disagree_on_handlers() {
        let legacy = OpcodeTable::for_version(BytecodeVersion::Legacy);
        let standard = OpcodeTable::for_version(BytecodeVersion::Standard);
        assert_eq!(legacy.stack_effect(Opcode::SetupExcept, 0, true), Ok(3));
        assert_eq!(standard.stack_effect(Opcode::SetupFinally, 0, true), Ok(6));
        assert!(standard.stack_effect(Opcode::SetupExcept, 0, true).is_err());
        assert!(!legacy.supports(Opcode::IsOp));
        assert!(!legacy.supports(Opcode::RotN));
        assert!(!standard.supports(Opcode::SetLineno));
        assert_eq!(standard.stack_effect(Opcode::SetLineno, 12, false), Ok(0));
        assert_eq!(legacy.jump_unit(), JumpUnit::Bytes);
        assert_eq!(standard.jump_unit(), JumpUnit::CodeUnits);
    }

    #[test]
    fn test_branch_dependent_effects() {
        let table = OpcodeTable::standard();
        assert_eq!(table.stack_effect(Opcode::ForIter, 0, false), Ok(1));
        assert_eq!(table.stack_effect(Opcode::ForIter, 0, true), Ok(-1));
        assert_eq!(table.stack_effect(Opcode::JumpIfTrueOrPop, 0, false), Ok(-1));
        assert_eq!(table.stack_effect(Opcode::JumpIfTrueOrPop, 0, true), Ok(0));
        assert_eq!(table.stack_effect(Opcode::BuildTuple, 3, false), Ok(-2));
        assert_eq!(table.stack_effect(Opcode::UnpackSequence, 3, false), Ok(2));
        assert_eq!(table.stack_effect(Opcode::MakeFunction, 0x09, false), Ok(-3));
    }

    #[test]
    fn test_jump_conversions() {
        let legacy = OpcodeTable::legacy();
        let standard = OpcodeTable::standard();
        assert_eq!(legacy.units_to_jump_arg(5), 10);
        assert_eq!(legacy.jump_arg_to_units(10), 5);
        assert_eq!(standard.units_to_jump_arg(5), 5);
        assert_eq!(legacy.extended_arg(), 144);
    }

    #[test]
    fn test_version_from_str() {
        assert_eq!("Legacy".parse(), Ok(BytecodeVersion::Legacy));
        assert_eq!(" standard ".parse(), Ok(BytecodeVersion::Standard));
        assert!("v3".parse::<BytecodeVersion>().is_err());
    }
}
