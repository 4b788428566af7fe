//! Encoded bytecode: code units, constants and the finished code object.

mod oparg;

pub use oparg::{OpArg, OpArgByte, OpArgState};

use crate::{
    lnotab,
    opcode::{BytecodeVersion, JumpKind, Opcode, OpcodeSpec, OpcodeTable},
};
use alloc::{boxed::Box, collections::BTreeSet, string::String, vec::Vec};
use bitflags::bitflags;
use core::{fmt, hash, mem};
use itertools::Itertools;
use malachite_bigint::BigInt;
use num_complex::Complex64;
use num_traits::ToPrimitive;

/// One fixed-width slot of encoded bytecode: an opcode byte and an operand byte.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
#[repr(C)]
pub struct CodeUnit {
    pub op: u8,
    pub arg: OpArgByte,
}

const _: () = assert!(mem::size_of::<CodeUnit>() == 2);

impl CodeUnit {
    #[must_use]
    pub const fn new(op: u8, arg: OpArgByte) -> Self {
        Self { op, arg }
    }
}

impl fmt::Debug for CodeUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.op, u8::from(self.arg))
    }
}

/// Flattens code units into the raw byte string.
#[must_use]
pub fn code_bytes(units: &[CodeUnit]) -> Vec<u8> {
    units.iter().flat_map(|u| [u.op, u8::from(u.arg)]).collect()
}

/// Splits a raw byte string into code units; a trailing odd byte is dropped.
#[must_use]
pub fn code_units(bytes: &[u8]) -> Vec<CodeUnit> {
    bytes
        .chunks_exact(2)
        .map(|pair| CodeUnit::new(pair[0], OpArgByte::new(pair[1])))
        .collect()
}

/// A fully decoded instruction of encoded bytecode.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DecodedInstruction {
    /// Index of the first code unit, including `EXTENDED_ARG` prefixes.
    pub start: usize,
    /// Index of the code unit carrying the real opcode.
    pub index: usize,
    pub byte: u8,
    pub op: Option<Opcode>,
    pub arg: OpArg,
}

impl DecodedInstruction {
    /// Index of the code unit following this instruction.
    #[must_use]
    pub const fn end(&self) -> usize {
        self.index + 1
    }

    /// Code-unit index the instruction jumps to, if it is a jump.
    pub fn jump_target(&self, spec: &dyn OpcodeSpec) -> Option<usize> {
        let units = spec.jump_arg_to_units(self.arg.get()) as usize;
        match spec.jump_kind(self.op?)? {
            JumpKind::Absolute => Some(units),
            JumpKind::Relative => Some(self.end() + units),
        }
    }
}

/// Decodes code units, folding `EXTENDED_ARG` prefixes into their instruction.
pub fn decode_instructions<'a>(
    units: &'a [CodeUnit],
    spec: &'a dyn OpcodeSpec,
) -> impl Iterator<Item = DecodedInstruction> + 'a {
    let extended_arg = spec.extended_arg();
    let mut state = OpArgState::default();
    let mut start = 0;
    units.iter().enumerate().filter_map(move |(index, unit)| {
        let is_prefix = unit.op == extended_arg;
        let arg = state.step(unit.arg, is_prefix)?;
        let decoded = DecodedInstruction {
            start,
            index,
            byte: unit.op,
            op: spec.from_byte(unit.op),
            arg,
        };
        start = index + 1;
        Some(decoded)
    })
}

bitflags! {
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
    pub struct CodeFlags: u32 {
        const OPTIMIZED = 0x0001;
        const NEWLOCALS = 0x0002;
        const VARARGS = 0x0004;
        const VARKEYWORDS = 0x0008;
        const NESTED = 0x0010;
        const GENERATOR = 0x0020;
        const NOFREE = 0x0040;
        const COROUTINE = 0x0080;
        const ITERABLE_COROUTINE = 0x0100;
        const ASYNC_GENERATOR = 0x0200;
    }
}

impl CodeFlags {
    /// Units whose frames start with the sent value on the stack.
    #[must_use]
    pub const fn is_generator_like(self) -> bool {
        self.intersects(
            Self::GENERATOR
                .union(Self::COROUTINE)
                .union(Self::ASYNC_GENERATOR),
        )
    }
}

/// Operand of `COMPARE_OP`, numbered in operand order.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ComparisonOperator {
    Less = 0,
    LessOrEqual = 1,
    Equal = 2,
    NotEqual = 3,
    Greater = 4,
    GreaterOrEqual = 5,
    In = 6,
    NotIn = 7,
    Is = 8,
    IsNot = 9,
    ExceptionMatch = 10,
}

impl ComparisonOperator {
    const ALL: [Self; 11] = [
        Self::Less,
        Self::LessOrEqual,
        Self::Equal,
        Self::NotEqual,
        Self::Greater,
        Self::GreaterOrEqual,
        Self::In,
        Self::NotIn,
        Self::Is,
        Self::IsNot,
        Self::ExceptionMatch,
    ];

    #[must_use]
    pub const fn index(self) -> u32 {
        self as u32
    }

    #[must_use]
    pub fn from_index(index: u32) -> Option<Self> {
        Self::ALL.get(index as usize).copied()
    }

    #[must_use]
    pub const fn symbol(self) -> &'static str {
        match self {
            Self::Less => "<",
            Self::LessOrEqual => "<=",
            Self::Equal => "==",
            Self::NotEqual => "!=",
            Self::Greater => ">",
            Self::GreaterOrEqual => ">=",
            Self::In => "in",
            Self::NotIn => "not in",
            Self::Is => "is",
            Self::IsNot => "is not",
            Self::ExceptionMatch => "exception match",
        }
    }

    /// The syntactic inverse for identity and membership tests.
    #[must_use]
    pub const fn inverse(self) -> Option<Self> {
        match self {
            Self::In => Some(Self::NotIn),
            Self::NotIn => Some(Self::In),
            Self::Is => Some(Self::IsNot),
            Self::IsNot => Some(Self::Is),
            _ => None,
        }
    }
}

impl fmt::Display for ComparisonOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

/// A constant of the code object.
///
/// Equality and hashing are bitwise for floats and discriminate on the
/// variant, so `0.0`, `-0.0`, `0` and `False` are four different pool keys.
#[derive(Debug, Clone)]
pub enum ConstantData {
    Tuple { elements: Vec<ConstantData> },
    FrozenSet { elements: Vec<ConstantData> },
    Integer { value: BigInt },
    Float { value: f64 },
    Complex { value: Complex64 },
    Boolean { value: bool },
    Str { value: String },
    Bytes { value: Vec<u8> },
    Code { code: Box<CodeObject> },
    None,
    Ellipsis,
}

impl PartialEq for ConstantData {
    fn eq(&self, other: &Self) -> bool {
        use ConstantData::*;

        match (self, other) {
            (Integer { value: a }, Integer { value: b }) => a == b,
            (Float { value: a }, Float { value: b }) => a.to_bits() == b.to_bits(),
            (Complex { value: a }, Complex { value: b }) => {
                a.re.to_bits() == b.re.to_bits() && a.im.to_bits() == b.im.to_bits()
            }
            (Boolean { value: a }, Boolean { value: b }) => a == b,
            (Str { value: a }, Str { value: b }) => a == b,
            (Bytes { value: a }, Bytes { value: b }) => a == b,
            (Code { code: a }, Code { code: b }) => core::ptr::eq(a.as_ref(), b.as_ref()),
            (Tuple { elements: a }, Tuple { elements: b }) => a == b,
            (FrozenSet { elements: a }, FrozenSet { elements: b }) => a == b,
            (None, None) => true,
            (Ellipsis, Ellipsis) => true,
            _ => false,
        }
    }
}

impl Eq for ConstantData {}

impl hash::Hash for ConstantData {
    fn hash<H: hash::Hasher>(&self, state: &mut H) {
        use ConstantData::*;

        mem::discriminant(self).hash(state);
        match self {
            Integer { value } => value.hash(state),
            Float { value } => value.to_bits().hash(state),
            Complex { value } => {
                value.re.to_bits().hash(state);
                value.im.to_bits().hash(state);
            }
            Boolean { value } => value.hash(state),
            Str { value } => value.hash(state),
            Bytes { value } => value.hash(state),
            Code { code } => core::ptr::hash(code.as_ref(), state),
            Tuple { elements } | FrozenSet { elements } => elements.hash(state),
            None => {}
            Ellipsis => {}
        }
    }
}

impl ConstantData {
    /// Builds a frozenset, dropping repeated elements.
    #[must_use]
    pub fn frozenset(elements: impl IntoIterator<Item = Self>) -> Self {
        let mut unique: Vec<Self> = Vec::new();
        for element in elements {
            if !unique.iter().any(|e| e.same_value(&element)) {
                unique.push(element);
            }
        }
        Self::FrozenSet { elements: unique }
    }

    #[must_use]
    pub fn int(value: impl Into<BigInt>) -> Self {
        Self::Integer {
            value: value.into(),
        }
    }

    #[must_use]
    pub fn str(value: impl Into<String>) -> Self {
        Self::Str {
            value: value.into(),
        }
    }

    /// Runtime truth value.
    #[must_use]
    pub fn is_truthy(&self) -> bool {
        match self {
            Self::Integer { value } => *value != BigInt::from(0u8),
            Self::Float { value } => *value != 0.0,
            Self::Complex { value } => value.re != 0.0 || value.im != 0.0,
            Self::Boolean { value } => *value,
            Self::Str { value } => !value.is_empty(),
            Self::Bytes { value } => !value.is_empty(),
            Self::Tuple { elements } | Self::FrozenSet { elements } => !elements.is_empty(),
            Self::Code { .. } | Self::Ellipsis => true,
            Self::None => false,
        }
    }

    /// Runtime equality, under which `1 == 1.0 == True` but elements of
    /// containers still compare element-wise.
    #[must_use]
    pub fn same_value(&self, other: &Self) -> bool {
        use ConstantData::*;

        match (self.as_number(), other.as_number()) {
            (Some(a), Some(b)) => return a.eq_value(&b),
            (Some(_), _) | (_, Some(_)) => return false,
            _ => {}
        }
        match (self, other) {
            (Str { value: a }, Str { value: b }) => a == b,
            (Bytes { value: a }, Bytes { value: b }) => a == b,
            (Tuple { elements: a }, Tuple { elements: b }) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.same_value(y))
            }
            (FrozenSet { elements: a }, FrozenSet { elements: b }) => {
                a.len() == b.len() && a.iter().all(|x| b.iter().any(|y| x.same_value(y)))
            }
            (Code { code: a }, Code { code: b }) => core::ptr::eq(a.as_ref(), b.as_ref()),
            (None, None) | (Ellipsis, Ellipsis) => true,
            _ => false,
        }
    }

    fn as_number(&self) -> Option<Number<'_>> {
        match self {
            Self::Boolean { value } => Some(Number::Bool(*value)),
            Self::Integer { value } => Some(Number::Int(value)),
            Self::Float { value } => Some(Number::Float(*value)),
            Self::Complex { value } => Some(Number::Complex(*value)),
            _ => Option::None,
        }
    }

    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::Tuple { .. } => "tuple",
            Self::FrozenSet { .. } => "frozenset",
            Self::Integer { .. } => "int",
            Self::Float { .. } => "float",
            Self::Complex { .. } => "complex",
            Self::Boolean { .. } => "bool",
            Self::Str { .. } => "str",
            Self::Bytes { .. } => "bytes",
            Self::Code { .. } => "code",
            Self::None => "NoneType",
            Self::Ellipsis => "ellipsis",
        }
    }
}

enum Number<'a> {
    Bool(bool),
    Int(&'a BigInt),
    Float(f64),
    Complex(Complex64),
}

impl Number<'_> {
    fn eq_value(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Bool(a), Self::Int(b)) | (Self::Int(b), Self::Bool(a)) => {
                **b == BigInt::from(u8::from(*a))
            }
            (Self::Int(i), Self::Float(f)) | (Self::Float(f), Self::Int(i)) => {
                float_to_bigint(*f).is_some_and(|exact| exact == **i)
            }
            (Self::Int(i), Self::Complex(c)) | (Self::Complex(c), Self::Int(i)) => {
                c.im == 0.0 && float_to_bigint(c.re).is_some_and(|exact| exact == **i)
            }
            _ => {
                let (ar, ai) = self.parts();
                let (br, bi) = other.parts();
                ar == br && ai == bi
            }
        }
    }

    fn parts(&self) -> (f64, f64) {
        match self {
            Self::Bool(b) => (f64::from(u8::from(*b)), 0.0),
            Self::Int(i) => (i.to_f64().unwrap_or(f64::NAN), 0.0),
            Self::Float(f) => (*f, 0.0),
            Self::Complex(c) => (c.re, c.im),
        }
    }
}

/// The exact integer value of an integral float.
#[must_use]
pub fn float_to_bigint(value: f64) -> Option<BigInt> {
    if !value.is_finite() || value.fract() != 0.0 {
        return None;
    }
    alloc::format!("{value:.0}").parse().ok()
}

fn fmt_float(value: f64, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    if value.is_nan() {
        f.write_str("nan")
    } else if value.is_infinite() {
        f.write_str(if value > 0.0 { "inf" } else { "-inf" })
    } else {
        write!(f, "{value:?}")
    }
}

fn fmt_imag(value: f64, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    if value.is_finite() && value.fract() == 0.0 && value.abs() < 1e16 {
        write!(f, "{value}")
    } else {
        fmt_float(value, f)
    }
}

impl fmt::Display for ConstantData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Integer { value } => write!(f, "{value}"),
            Self::Float { value } => fmt_float(*value, f),
            Self::Complex { value } => {
                if value.re == 0.0 && value.re.is_sign_positive() {
                    fmt_imag(value.im, f)?;
                    f.write_str("j")
                } else {
                    f.write_str("(")?;
                    fmt_imag(value.re, f)?;
                    if value.im >= 0.0 || value.im.is_nan() {
                        f.write_str("+")?;
                    }
                    fmt_imag(value.im, f)?;
                    f.write_str("j)")
                }
            }
            Self::Boolean { value } => f.write_str(if *value { "True" } else { "False" }),
            Self::Str { value } => write!(f, "{value:?}"),
            Self::Bytes { value } => write!(f, "b\"{}\"", value.escape_ascii()),
            Self::Code { code } => write!(f, "<code object {}>", code.obj_name),
            Self::Tuple { elements } if elements.len() == 1 => write!(f, "({},)", elements[0]),
            Self::Tuple { elements } => write!(f, "({})", elements.iter().join(", ")),
            Self::FrozenSet { elements } if elements.is_empty() => f.write_str("frozenset()"),
            Self::FrozenSet { elements } => {
                write!(f, "frozenset({{{}}})", elements.iter().join(", "))
            }
            Self::None => f.write_str("None"),
            Self::Ellipsis => f.write_str("Ellipsis"),
        }
    }
}

/// Which table of the code object an instruction's operand indexes.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ArgKind {
    None,
    Raw,
    Const,
    Name,
    Local,
    Closure,
    Compare,
    Jump,
}

impl ArgKind {
    #[must_use]
    pub fn of(op: Opcode, spec: &dyn OpcodeSpec) -> Self {
        use Opcode::*;
        if spec.has_jump(op) {
            return Self::Jump;
        }
        match op {
            LoadConst => Self::Const,
            StoreName | DeleteName | StoreAttr | DeleteAttr | StoreGlobal | DeleteGlobal
            | LoadName | LoadAttr | ImportName | ImportFrom | LoadGlobal | LoadMethod => Self::Name,
            LoadFast | StoreFast | DeleteFast => Self::Local,
            LoadClosure | LoadDeref | StoreDeref | DeleteDeref | LoadClassderef => Self::Closure,
            CompareOp => Self::Compare,
            UnpackSequence | UnpackEx | RotN | BuildTuple | BuildList | BuildSet | BuildMap
            | IsOp | ContainsOp | Reraise | GenStart | RaiseVarargs | CallFunction
            | MakeFunction | BuildSlice | CallFunctionKw | CallFunctionEx | ExtendedArg
            | ListAppend | SetAdd | MapAdd | FormatValue | BuildConstKeyMap | BuildString
            | CallMethod | ListExtend | SetUpdate | DictMerge | DictUpdate | SetLineno => Self::Raw,
            _ => Self::None,
        }
    }
}

/// A finished unit of bytecode: one function, lambda, class body or module.
#[derive(Clone)]
pub struct CodeObject {
    pub instructions: Box<[CodeUnit]>,
    pub version: BytecodeVersion,
    pub flags: CodeFlags,
    pub posonlyarg_count: u32,
    pub arg_count: u32,
    pub kwonlyarg_count: u32,
    pub source_path: String,
    pub first_line_number: u32,
    pub max_stackdepth: u32,
    /// Name of the object that created this code object
    pub obj_name: String,
    pub constants: Box<[ConstantData]>,
    pub names: Box<[String]>,
    pub varnames: Box<[String]>,
    pub cellvars: Box<[String]>,
    pub freevars: Box<[String]>,
    /// Line number table, see [`lnotab`]
    pub linetable: Box<[u8]>,
}

impl CodeObject {
    #[must_use]
    pub fn spec(&self) -> &'static OpcodeTable {
        OpcodeTable::for_version(self.version)
    }

    /// Raw instruction bytes.
    #[must_use]
    pub fn code_bytes(&self) -> Vec<u8> {
        code_bytes(&self.instructions)
    }

    pub fn decoded(&self) -> impl Iterator<Item = DecodedInstruction> + '_ {
        decode_instructions(&self.instructions, self.spec())
    }

    /// Decoded instructions as `(opcode, operand)`, without `EXTENDED_ARG`s.
    #[must_use]
    pub fn ops(&self) -> Vec<(Option<Opcode>, u32)> {
        self.decoded().map(|d| (d.op, d.arg.get())).collect()
    }

    #[must_use]
    pub fn line_ranges(&self) -> Vec<lnotab::LineRange> {
        lnotab::decode(&self.linetable, self.first_line_number)
    }

    fn arg_detail(&self, decoded: &DecodedInstruction) -> Option<String> {
        let op = decoded.op?;
        let arg = decoded.arg.get() as usize;
        let spec = self.spec();
        match ArgKind::of(op, spec) {
            ArgKind::Const => Some(self.constants.get(arg)?.to_string()),
            ArgKind::Name => self.names.get(arg).cloned(),
            ArgKind::Local => self.varnames.get(arg).cloned(),
            ArgKind::Closure => self
                .cellvars
                .iter()
                .chain(self.freevars.iter())
                .nth(arg)
                .cloned(),
            ArgKind::Compare => ComparisonOperator::from_index(decoded.arg.get())
                .map(|cmp| cmp.symbol().to_owned()),
            ArgKind::Jump => {
                let target = decoded.jump_target(spec)?;
                Some(alloc::format!("to {}", target * spec.code_unit_size()))
            }
            ArgKind::Raw | ArgKind::None => Option::None,
        }
    }
}

impl fmt::Debug for CodeObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<code object {} at ??? file {:?}, line {}>",
            self.obj_name, self.source_path, self.first_line_number
        )
    }
}

impl fmt::Display for CodeObject {
    /// Disassembly listing: line, jump-target marker, byte offset, opcode, operand.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let spec = self.spec();
        let unit_size = spec.code_unit_size();
        let decoded: Vec<_> = self.decoded().collect();
        let targets: BTreeSet<usize> = decoded.iter().filter_map(|d| d.jump_target(spec)).collect();
        let ranges = self.line_ranges();
        let mut last_line = Option::None;
        for d in &decoded {
            let offset = d.start * unit_size;
            let line = ranges
                .iter()
                .find(|r| r.start as usize <= offset && offset < r.end as usize)
                .and_then(|r| r.line);
            if line != last_line && line.is_some() {
                if last_line.is_some() {
                    writeln!(f)?;
                }
                write!(f, "{:>4}", line.unwrap_or_default())?;
                last_line = line;
            } else {
                write!(f, "    ")?;
            }
            let arrow = if targets.contains(&d.start) { ">>" } else { "  " };
            let name = d.op.map_or("<unknown>", Opcode::name);
            write!(f, " {arrow} {offset:>4} {name:<24}")?;
            let has_arg = d.op.is_some_and(|op| ArgKind::of(op, spec) != ArgKind::None);
            if has_arg {
                write!(f, " {}", d.arg)?;
                if let Some(detail) = self.arg_detail(d) {
                    write!(f, " ({detail})")?;
                }
            }
            writeln!(f)?;
        }
        for constant in &*self.constants {
            if let ConstantData::Code { code } = constant {
                writeln!(f, "\nDisassembly of {code:?}:")?;
                code.fmt(f)?;
            }
        }
        Ok(())
    }
}
