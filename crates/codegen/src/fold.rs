//! Compile-time evaluation of operators on constants.
//!
//! Both the AST folder and the byte-level optimizer evaluate through this
//! table. Every function either produces exactly the value the VM would
//! compute at run time or refuses with a [`FoldError`]; refusing is always
//! safe because the caller keeps the unfolded code. Multiplication, power and
//! left shift are guarded by [`FoldLimits`] so that tiny sources cannot blow
//! up into huge constants.

use crate::error::FoldError;
use core::{cmp::Ordering, ops::Not};
use malachite_bigint::BigInt;
use num_complex::Complex64;
use num_integer::Integer;
use num_traits::{Pow, Signed, ToPrimitive, Zero};
use stackasm_compiler_core::{
    ComparisonOperator, ConstantData, Opcode, bytecode::float_to_bigint,
};

pub type FoldResult = Result<ConstantData, FoldError>;

/// Size caps for folded results.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FoldLimits {
    /// Bits of an integer produced by `*`, `**` or `<<`.
    pub max_int_size: u64,
    /// Elements of a tuple produced by repetition.
    pub max_collection_size: u64,
    /// Length of a string or bytes produced by repetition.
    pub max_str_size: u64,
    /// Elements, counted through nested tuples, of a repeated tuple.
    pub max_total_items: u64,
}

impl FoldLimits {
    /// The roomier profile used on the syntax tree.
    #[must_use]
    pub const fn ast() -> Self {
        Self {
            max_int_size: 128,
            max_collection_size: 256,
            max_str_size: 4096,
            max_total_items: 1024,
        }
    }
}

impl Default for FoldLimits {
    fn default() -> Self {
        Self {
            max_int_size: 128,
            max_collection_size: 20,
            max_str_size: 20,
            max_total_items: 1024,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum UnaryOperator {
    Invert,
    Not,
    UAdd,
    USub,
}

impl UnaryOperator {
    #[must_use]
    pub const fn from_opcode(op: Opcode) -> Option<Self> {
        match op {
            Opcode::UnaryInvert => Some(Self::Invert),
            Opcode::UnaryNot => Some(Self::Not),
            Opcode::UnaryPositive => Some(Self::UAdd),
            Opcode::UnaryNegative => Some(Self::USub),
            _ => None,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BinaryOperator {
    Add,
    Sub,
    Mult,
    MatMult,
    Div,
    Mod,
    Pow,
    LShift,
    RShift,
    BitOr,
    BitXor,
    BitAnd,
    FloorDiv,
    /// Indexing, `a[b]`.
    Subscr,
}

impl BinaryOperator {
    /// The operator of a `BINARY_*` opcode. In-place forms are not folded.
    #[must_use]
    pub const fn from_opcode(op: Opcode) -> Option<Self> {
        Some(match op {
            Opcode::BinaryAdd => Self::Add,
            Opcode::BinarySubtract => Self::Sub,
            Opcode::BinaryMultiply => Self::Mult,
            Opcode::BinaryMatrixMultiply => Self::MatMult,
            Opcode::BinaryTrueDivide => Self::Div,
            Opcode::BinaryModulo => Self::Mod,
            Opcode::BinaryPower => Self::Pow,
            Opcode::BinaryLshift => Self::LShift,
            Opcode::BinaryRshift => Self::RShift,
            Opcode::BinaryOr => Self::BitOr,
            Opcode::BinaryXor => Self::BitXor,
            Opcode::BinaryAnd => Self::BitAnd,
            Opcode::BinaryFloorDivide => Self::FloorDiv,
            Opcode::BinarySubscr => Self::Subscr,
            _ => return None,
        })
    }

    #[must_use]
    pub const fn symbol(self) -> &'static str {
        match self {
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mult => "*",
            Self::MatMult => "@",
            Self::Div => "/",
            Self::Mod => "%",
            Self::Pow => "**",
            Self::LShift => "<<",
            Self::RShift => ">>",
            Self::BitOr => "|",
            Self::BitXor => "^",
            Self::BitAnd => "&",
            Self::FloorDiv => "//",
            Self::Subscr => "[]",
        }
    }
}

/// Numeric view of a constant; `bool` participates as an integer.
#[derive(Clone, Debug)]
enum Num {
    Int(BigInt),
    Float(f64),
    Complex(Complex64),
}

fn as_num(value: &ConstantData) -> Option<Num> {
    match value {
        ConstantData::Boolean { value } => Some(Num::Int(BigInt::from(u8::from(*value)))),
        ConstantData::Integer { value } => Some(Num::Int(value.clone())),
        ConstantData::Float { value } => Some(Num::Float(*value)),
        ConstantData::Complex { value } => Some(Num::Complex(*value)),
        _ => None,
    }
}

fn as_int(value: &ConstantData) -> Option<BigInt> {
    match as_num(value)? {
        Num::Int(i) => Some(i),
        _ => None,
    }
}

fn int_to_float(value: &BigInt) -> Result<f64, FoldError> {
    value
        .to_f64()
        .filter(|f| f.is_finite())
        .ok_or(FoldError::Overflow)
}

fn int_result(value: BigInt) -> FoldResult {
    Ok(ConstantData::Integer { value })
}

fn float_result(value: f64) -> FoldResult {
    Ok(ConstantData::Float { value })
}

pub fn unary_op(op: UnaryOperator, operand: &ConstantData) -> FoldResult {
    if op == UnaryOperator::Not {
        return Ok(ConstantData::Boolean {
            value: !operand.is_truthy(),
        });
    }
    match (op, as_num(operand)) {
        (UnaryOperator::Invert, Some(Num::Int(i))) => int_result((&i).not()),
        (UnaryOperator::UAdd, Some(Num::Int(i))) => int_result(i),
        (UnaryOperator::USub, Some(Num::Int(i))) => int_result(-i),
        (UnaryOperator::UAdd, Some(Num::Float(f))) => float_result(f),
        (UnaryOperator::USub, Some(Num::Float(f))) => float_result(-f),
        (UnaryOperator::UAdd, Some(Num::Complex(c))) => Ok(ConstantData::Complex { value: c }),
        (UnaryOperator::USub, Some(Num::Complex(c))) => {
            Ok(ConstantData::Complex { value: -c })
        }
        _ => Err(FoldError::Unsupported("unary operator on this type")),
    }
}

pub fn binary_op(
    op: BinaryOperator,
    left: &ConstantData,
    right: &ConstantData,
    limits: &FoldLimits,
) -> FoldResult {
    match op {
        BinaryOperator::Subscr => return subscript(left, right),
        BinaryOperator::Add => {
            if let Some(joined) = concat(left, right) {
                return Ok(joined);
            }
        }
        BinaryOperator::Mult => {
            check_multiply(left, right, limits)?;
            if let Some(repeated) = repeat(left, right) {
                return repeated;
            }
        }
        BinaryOperator::Mod => {
            // str and bytes `%` is formatting, evaluated by the VM
            if matches!(left, ConstantData::Str { .. } | ConstantData::Bytes { .. }) {
                return Err(FoldError::Unsupported("string formatting"));
            }
        }
        BinaryOperator::Pow => check_power(left, right, limits)?,
        BinaryOperator::LShift => check_lshift(left, right, limits)?,
        _ => {}
    }

    if let (
        BinaryOperator::BitAnd | BinaryOperator::BitOr | BinaryOperator::BitXor,
        ConstantData::Boolean { value: a },
        ConstantData::Boolean { value: b },
    ) = (op, left, right)
    {
        let value = match op {
            BinaryOperator::BitAnd => a & b,
            BinaryOperator::BitOr => a | b,
            _ => a ^ b,
        };
        return Ok(ConstantData::Boolean { value });
    }

    let (Some(a), Some(b)) = (as_num(left), as_num(right)) else {
        return Err(FoldError::Unsupported("operands of this type"));
    };
    match (a, b) {
        (Num::Int(a), Num::Int(b)) => int_op(op, &a, &b),
        (Num::Complex(a), b) => complex_op(op, a, to_complex(b)?),
        (a, Num::Complex(b)) => complex_op(op, to_complex(a)?, b),
        (a, b) => float_op(op, to_float(a)?, to_float(b)?),
    }
}

fn to_float(value: Num) -> Result<f64, FoldError> {
    match value {
        Num::Int(i) => int_to_float(&i),
        Num::Float(f) => Ok(f),
        Num::Complex(_) => Err(FoldError::Unsupported("complex to float")),
    }
}

fn to_complex(value: Num) -> Result<Complex64, FoldError> {
    match value {
        Num::Complex(c) => Ok(c),
        other => Ok(Complex64::new(to_float(other)?, 0.0)),
    }
}

fn int_op(op: BinaryOperator, a: &BigInt, b: &BigInt) -> FoldResult {
    match op {
        BinaryOperator::Add => int_result(a + b),
        BinaryOperator::Sub => int_result(a - b),
        BinaryOperator::Mult => int_result(a * b),
        BinaryOperator::Div => {
            if b.is_zero() {
                return Err(FoldError::ZeroDivision);
            }
            // below 2**53 both operands convert exactly, so one IEEE division
            // is correctly rounded
            let exact = BigInt::from(1u64 << 53);
            if a.abs() > exact || b.abs() > exact {
                return Err(FoldError::Unsupported("inexact integer division"));
            }
            float_result(int_to_float(a)? / int_to_float(b)?)
        }
        BinaryOperator::FloorDiv => {
            if b.is_zero() {
                return Err(FoldError::ZeroDivision);
            }
            int_result(a.div_floor(b))
        }
        BinaryOperator::Mod => {
            if b.is_zero() {
                return Err(FoldError::ZeroDivision);
            }
            int_result(a.mod_floor(b))
        }
        BinaryOperator::Pow => {
            if b.is_negative() {
                if a.is_zero() {
                    return Err(FoldError::ZeroDivision);
                }
                return float_op(op, int_to_float(a)?, int_to_float(b)?);
            }
            let exponent = b.to_u64().ok_or(FoldError::Overflow)?;
            int_result(Pow::pow(a, exponent))
        }
        BinaryOperator::LShift => {
            if b.is_negative() {
                return Err(FoldError::NegativeShift);
            }
            if a.is_zero() {
                return int_result(BigInt::zero());
            }
            let bits = b.to_usize().ok_or(FoldError::Overflow)?;
            int_result(a << bits)
        }
        BinaryOperator::RShift => {
            if b.is_negative() {
                return Err(FoldError::NegativeShift);
            }
            let bits = b.to_usize().unwrap_or(usize::MAX);
            int_result(a >> bits)
        }
        BinaryOperator::BitAnd => int_result(a & b),
        BinaryOperator::BitOr => int_result(a | b),
        BinaryOperator::BitXor => int_result(a ^ b),
        BinaryOperator::MatMult | BinaryOperator::Subscr => {
            Err(FoldError::Unsupported("operator on integers"))
        }
    }
}

/// Floor division and modulo of floats with the VM's sign conventions.
fn float_divmod(a: f64, b: f64) -> Result<(f64, f64), FoldError> {
    if b == 0.0 {
        return Err(FoldError::ZeroDivision);
    }
    let mut m = a % b;
    let mut d = (a - m) / b;
    if m != 0.0 {
        if (b < 0.0) != (m < 0.0) {
            m += b;
            d -= 1.0;
        }
    } else {
        m = 0.0f64.copysign(b);
    }
    let floor = if d != 0.0 {
        let mut floor = d.floor();
        if d - floor > 0.5 {
            floor += 1.0;
        }
        floor
    } else {
        0.0f64.copysign(a / b)
    };
    Ok((floor, m))
}

fn float_op(op: BinaryOperator, a: f64, b: f64) -> FoldResult {
    match op {
        BinaryOperator::Add => float_result(a + b),
        BinaryOperator::Sub => float_result(a - b),
        BinaryOperator::Mult => float_result(a * b),
        BinaryOperator::Div => {
            if b == 0.0 {
                return Err(FoldError::ZeroDivision);
            }
            float_result(a / b)
        }
        BinaryOperator::FloorDiv => float_result(float_divmod(a, b)?.0),
        BinaryOperator::Mod => float_result(float_divmod(a, b)?.1),
        BinaryOperator::Pow => {
            if a == 0.0 && b < 0.0 {
                return Err(FoldError::ZeroDivision);
            }
            if a < 0.0 && b.is_finite() && b.fract() != 0.0 {
                return Err(FoldError::Unsupported("fractional power of a negative float"));
            }
            let value = a.powf(b);
            if value.is_infinite() && a.is_finite() && b.is_finite() {
                return Err(FoldError::Overflow);
            }
            float_result(value)
        }
        _ => Err(FoldError::Unsupported("operator on floats")),
    }
}

fn complex_op(op: BinaryOperator, a: Complex64, b: Complex64) -> FoldResult {
    let value = match op {
        BinaryOperator::Add => a + b,
        BinaryOperator::Sub => a - b,
        BinaryOperator::Mult => a * b,
        _ => return Err(FoldError::Unsupported("operator on complex numbers")),
    };
    Ok(ConstantData::Complex { value })
}

fn concat(left: &ConstantData, right: &ConstantData) -> Option<ConstantData> {
    match (left, right) {
        (ConstantData::Str { value: a }, ConstantData::Str { value: b }) => {
            Some(ConstantData::str(format!("{a}{b}")))
        }
        (ConstantData::Bytes { value: a }, ConstantData::Bytes { value: b }) => {
            Some(ConstantData::Bytes {
                value: [a.as_slice(), b.as_slice()].concat(),
            })
        }
        (ConstantData::Tuple { elements: a }, ConstantData::Tuple { elements: b }) => {
            Some(ConstantData::Tuple {
                elements: a.iter().chain(b).cloned().collect(),
            })
        }
        _ => None,
    }
}

/// Sequence repetition, `None` unless one side is an int and the other a
/// str, bytes or tuple, so numeric products fall through to arithmetic.
fn repeat(left: &ConstantData, right: &ConstantData) -> Option<FoldResult> {
    let (count, seq) = match (as_int(left), as_int(right)) {
        (Some(n), None) => (n, right),
        (None, Some(n)) => (n, left),
        _ => return None,
    };
    // non-positive counts give an empty sequence
    let count = count.to_usize().unwrap_or(0);
    Some(match seq {
        ConstantData::Str { value } => Ok(ConstantData::str(value.repeat(count))),
        ConstantData::Bytes { value } => Ok(ConstantData::Bytes {
            value: value.repeat(count),
        }),
        ConstantData::Tuple { elements } => Ok(ConstantData::Tuple {
            elements: elements
                .iter()
                .cycle()
                .take(elements.len() * count)
                .cloned()
                .collect(),
        }),
        _ => return None,
    })
}

fn subscript(container: &ConstantData, index: &ConstantData) -> FoldResult {
    let index = as_int(index).ok_or(FoldError::Unsupported("non-integer subscript"))?;
    let resolve = |len: usize| -> Result<usize, FoldError> {
        let len = BigInt::from(len);
        let i = if index.is_negative() {
            &index + &len
        } else {
            index.clone()
        };
        if i.is_negative() || i >= len {
            return Err(FoldError::IndexOutOfRange);
        }
        i.to_usize().ok_or(FoldError::IndexOutOfRange)
    };
    match container {
        ConstantData::Str { value } => {
            let i = resolve(value.chars().count())?;
            value
                .chars()
                .nth(i)
                .map(|c| ConstantData::str(c.to_string()))
                .ok_or(FoldError::IndexOutOfRange)
        }
        ConstantData::Bytes { value } => {
            let i = resolve(value.len())?;
            Ok(ConstantData::int(value[i]))
        }
        ConstantData::Tuple { elements } => {
            let i = resolve(elements.len())?;
            Ok(elements[i].clone())
        }
        _ => Err(FoldError::Unsupported("subscript of this type")),
    }
}

/// Number of elements in `value`, counted through nested tuples and frozensets.
#[must_use]
pub fn total_items(value: &ConstantData) -> u64 {
    match value {
        ConstantData::Tuple { elements } | ConstantData::FrozenSet { elements } => elements
            .iter()
            .fold(elements.len() as u64, |acc, e| acc.saturating_add(total_items(e))),
        _ => 0,
    }
}

fn check_multiply(
    left: &ConstantData,
    right: &ConstantData,
    limits: &FoldLimits,
) -> Result<(), FoldError> {
    match (as_int(left), as_int(right)) {
        (Some(a), Some(b)) => {
            if !a.is_zero() && !b.is_zero() && a.bits() + b.bits() > limits.max_int_size {
                return Err(FoldError::Overflow);
            }
            Ok(())
        }
        (Some(count), None) => check_repeat(&count, right, limits),
        (None, Some(count)) => check_repeat(&count, left, limits),
        (None, None) => Ok(()),
    }
}

fn check_repeat(count: &BigInt, seq: &ConstantData, limits: &FoldLimits) -> Result<(), FoldError> {
    let (len, max) = match seq {
        ConstantData::Tuple { elements } | ConstantData::FrozenSet { elements } => {
            (elements.len() as u64, limits.max_collection_size)
        }
        ConstantData::Str { value } => (value.chars().count() as u64, limits.max_str_size),
        ConstantData::Bytes { value } => (value.len() as u64, limits.max_str_size),
        _ => return Ok(()),
    };
    if len == 0 {
        return Ok(());
    }
    if count.is_negative() {
        return Err(FoldError::Overflow);
    }
    let count = count.to_u64().ok_or(FoldError::Overflow)?;
    if count.saturating_mul(len) > max {
        return Err(FoldError::Overflow);
    }
    if matches!(seq, ConstantData::Tuple { .. } | ConstantData::FrozenSet { .. })
        && count != 0
        && total_items(seq).saturating_mul(count) > limits.max_total_items
    {
        return Err(FoldError::Overflow);
    }
    Ok(())
}

fn check_power(
    left: &ConstantData,
    right: &ConstantData,
    limits: &FoldLimits,
) -> Result<(), FoldError> {
    if let (Some(base), Some(exponent)) = (as_int(left), as_int(right))
        && !base.is_zero()
        && exponent.is_positive()
    {
        let exponent = exponent.to_u64().ok_or(FoldError::Overflow)?;
        if base.bits().saturating_mul(exponent) > limits.max_int_size {
            return Err(FoldError::Overflow);
        }
    }
    Ok(())
}

fn check_lshift(
    left: &ConstantData,
    right: &ConstantData,
    limits: &FoldLimits,
) -> Result<(), FoldError> {
    if let (Some(base), Some(shift)) = (as_int(left), as_int(right))
        && !base.is_zero()
        && !shift.is_zero()
    {
        let max = limits.max_int_size;
        let shift = shift.to_u64().filter(|&s| s <= max).ok_or(FoldError::Overflow)?;
        if base.bits() > max - shift {
            return Err(FoldError::Overflow);
        }
    }
    Ok(())
}

/// Evaluates a comparison. Identity tests and exception matching depend on
/// object identity and are never folded.
pub fn compare_op(op: ComparisonOperator, left: &ConstantData, right: &ConstantData) -> FoldResult {
    let value = match op {
        ComparisonOperator::Equal => left.same_value(right),
        ComparisonOperator::NotEqual => !left.same_value(right),
        ComparisonOperator::In => contains(right, left)?,
        ComparisonOperator::NotIn => !contains(right, left)?,
        ComparisonOperator::Less
        | ComparisonOperator::LessOrEqual
        | ComparisonOperator::Greater
        | ComparisonOperator::GreaterOrEqual => return ordering_op(op, left, right),
        ComparisonOperator::Is | ComparisonOperator::IsNot | ComparisonOperator::ExceptionMatch => {
            return Err(FoldError::Unsupported("identity comparison"));
        }
    };
    Ok(ConstantData::Boolean { value })
}

fn ordering_op(op: ComparisonOperator, left: &ConstantData, right: &ConstantData) -> FoldResult {
    if let (ConstantData::Tuple { elements: a }, ConstantData::Tuple { elements: b }) = (left, right)
    {
        // the first differing pair decides, otherwise the lengths do
        if let Some((x, y)) = a.iter().zip(b).find(|(x, y)| !x.same_value(y)) {
            return compare_op(op, x, y);
        }
        return Ok(ConstantData::Boolean {
            value: ordering_holds(op, Some(a.len().cmp(&b.len()))),
        });
    }
    let ordering = match (left, right) {
        (ConstantData::Str { value: a }, ConstantData::Str { value: b }) => Some(a.cmp(b)),
        (ConstantData::Bytes { value: a }, ConstantData::Bytes { value: b }) => Some(a.cmp(b)),
        _ => match (as_num(left), as_num(right)) {
            (Some(Num::Int(a)), Some(Num::Int(b))) => Some(a.cmp(&b)),
            (Some(Num::Float(a)), Some(Num::Float(b))) => a.partial_cmp(&b),
            (Some(Num::Int(a)), Some(Num::Float(b))) => cmp_int_float(&a, b),
            (Some(Num::Float(a)), Some(Num::Int(b))) => cmp_int_float(&b, a).map(Ordering::reverse),
            _ => return Err(FoldError::Unsupported("ordering of these types")),
        },
    };
    Ok(ConstantData::Boolean {
        value: ordering_holds(op, ordering),
    })
}

fn ordering_holds(op: ComparisonOperator, ordering: Option<Ordering>) -> bool {
    let Some(ordering) = ordering else {
        return false;
    };
    match op {
        ComparisonOperator::Less => ordering.is_lt(),
        ComparisonOperator::LessOrEqual => ordering.is_le(),
        ComparisonOperator::Greater => ordering.is_gt(),
        ComparisonOperator::GreaterOrEqual => ordering.is_ge(),
        _ => false,
    }
}

/// Exact comparison of an integer with a float.
fn cmp_int_float(i: &BigInt, f: f64) -> Option<Ordering> {
    if f.is_nan() {
        return None;
    }
    if f.is_infinite() {
        return Some(if f > 0.0 {
            Ordering::Less
        } else {
            Ordering::Greater
        });
    }
    let floor = f.floor();
    let whole = float_to_bigint(floor)?;
    Some(match i.cmp(&whole) {
        Ordering::Equal if f > floor => Ordering::Less,
        other => other,
    })
}

fn contains(container: &ConstantData, item: &ConstantData) -> Result<bool, FoldError> {
    match (container, item) {
        (ConstantData::Tuple { elements } | ConstantData::FrozenSet { elements }, _) => {
            Ok(elements.iter().any(|e| e.same_value(item)))
        }
        (ConstantData::Str { value: haystack }, ConstantData::Str { value: needle }) => {
            Ok(haystack.contains(needle.as_str()))
        }
        (ConstantData::Bytes { value: haystack }, ConstantData::Bytes { value: needle }) => {
            Ok(needle.is_empty() || haystack.windows(needle.len()).any(|w| w == needle.as_slice()))
        }
        (ConstantData::Bytes { value: haystack }, _) => {
            let byte = as_int(item)
                .and_then(|i| i.to_u8())
                .ok_or(FoldError::Unsupported("membership of a non-byte in bytes"))?;
            Ok(haystack.contains(&byte))
        }
        _ => Err(FoldError::Unsupported("membership test on this type")),
    }
}
