//! The syntax tree handed over by the parser, limited to the nodes the
//! constant folder looks into. Other expressions reach the code generator
//! through [`Expr::Other`] untouched.

use crate::fold::{BinaryOperator, UnaryOperator};
use ruff_text_size::{Ranged, TextRange};
use stackasm_compiler_core::{ComparisonOperator, ConstantData};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ExprContext {
    Load,
    Store,
    Del,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BoolOp {
    And,
    Or,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ExprConstant {
    pub range: TextRange,
    pub value: ConstantData,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ExprName {
    pub range: TextRange,
    pub id: String,
    pub ctx: ExprContext,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ExprUnaryOp {
    pub range: TextRange,
    pub op: UnaryOperator,
    pub operand: Box<Expr>,
}

/// `left op right`. [`BinaryOperator::Subscr`] is spelled with
/// [`ExprSubscript`] instead.
#[derive(Clone, Debug, PartialEq)]
pub struct ExprBinOp {
    pub range: TextRange,
    pub left: Box<Expr>,
    pub op: BinaryOperator,
    pub right: Box<Expr>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ExprBoolOp {
    pub range: TextRange,
    pub op: BoolOp,
    pub values: Vec<Expr>,
}

/// A comparison chain, `left ops[0] comparators[0] ops[1] ...`.
#[derive(Clone, Debug, PartialEq)]
pub struct ExprCompare {
    pub range: TextRange,
    pub left: Box<Expr>,
    pub ops: Vec<ComparisonOperator>,
    pub comparators: Vec<Expr>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ExprSubscript {
    pub range: TextRange,
    pub value: Box<Expr>,
    pub slice: Box<Expr>,
    pub ctx: ExprContext,
}

/// Shared shape of tuple, list and set displays.
#[derive(Clone, Debug, PartialEq)]
pub struct ExprSequence {
    pub range: TextRange,
    pub elts: Vec<Expr>,
    pub ctx: ExprContext,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ExprStarred {
    pub range: TextRange,
    pub value: Box<Expr>,
    pub ctx: ExprContext,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ExprCall {
    pub range: TextRange,
    pub func: Box<Expr>,
    pub args: Vec<Expr>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ExprNamed {
    pub range: TextRange,
    pub target: Box<Expr>,
    pub value: Box<Expr>,
}

/// One `for target in iter if cond ...` clause.
#[derive(Clone, Debug, PartialEq)]
pub struct Comprehension {
    pub range: TextRange,
    pub target: Expr,
    pub iter: Expr,
    pub ifs: Vec<Expr>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ExprComprehension {
    pub range: TextRange,
    pub elt: Box<Expr>,
    pub generators: Vec<Comprehension>,
}

/// A node the folder does not look into.
#[derive(Clone, Debug, PartialEq)]
pub struct ExprOther {
    pub range: TextRange,
    pub kind: String,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Expr {
    Constant(ExprConstant),
    Name(ExprName),
    UnaryOp(ExprUnaryOp),
    BinOp(ExprBinOp),
    BoolOp(ExprBoolOp),
    Compare(ExprCompare),
    Subscript(ExprSubscript),
    Tuple(ExprSequence),
    List(ExprSequence),
    Set(ExprSequence),
    Starred(ExprStarred),
    Call(ExprCall),
    Named(ExprNamed),
    ListComp(ExprComprehension),
    SetComp(ExprComprehension),
    Generator(ExprComprehension),
    Other(ExprOther),
}

impl Expr {
    pub fn constant(value: ConstantData, range: TextRange) -> Self {
        Self::Constant(ExprConstant { range, value })
    }

    /// The literal value, if this is a constant.
    pub fn as_constant(&self) -> Option<&ConstantData> {
        match self {
            Self::Constant(c) => Some(&c.value),
            _ => None,
        }
    }
}

impl Ranged for Expr {
    fn range(&self) -> TextRange {
        match self {
            Self::Constant(node) => node.range,
            Self::Name(node) => node.range,
            Self::UnaryOp(node) => node.range,
            Self::BinOp(node) => node.range,
            Self::BoolOp(node) => node.range,
            Self::Compare(node) => node.range,
            Self::Subscript(node) => node.range,
            Self::Tuple(node) | Self::List(node) | Self::Set(node) => node.range,
            Self::Starred(node) => node.range,
            Self::Call(node) => node.range,
            Self::Named(node) => node.range,
            Self::ListComp(node) | Self::SetComp(node) | Self::Generator(node) => node.range,
            Self::Other(node) => node.range,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct StmtExpr {
    pub range: TextRange,
    pub value: Expr,
}

#[derive(Clone, Debug, PartialEq)]
pub struct StmtAssign {
    pub range: TextRange,
    pub targets: Vec<Expr>,
    pub value: Expr,
}

#[derive(Clone, Debug, PartialEq)]
pub struct StmtReturn {
    pub range: TextRange,
    pub value: Option<Expr>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct StmtIf {
    pub range: TextRange,
    pub test: Expr,
    pub body: Vec<Stmt>,
    pub orelse: Vec<Stmt>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct StmtWhile {
    pub range: TextRange,
    pub test: Expr,
    pub body: Vec<Stmt>,
    pub orelse: Vec<Stmt>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct StmtFor {
    pub range: TextRange,
    pub target: Expr,
    pub iter: Expr,
    pub body: Vec<Stmt>,
    pub orelse: Vec<Stmt>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct StmtFunctionDef {
    pub range: TextRange,
    pub name: String,
    pub body: Vec<Stmt>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Stmt {
    Expr(StmtExpr),
    Assign(StmtAssign),
    Return(StmtReturn),
    If(StmtIf),
    While(StmtWhile),
    For(StmtFor),
    FunctionDef(StmtFunctionDef),
    Pass(TextRange),
}

impl Ranged for Stmt {
    fn range(&self) -> TextRange {
        match self {
            Self::Expr(node) => node.range,
            Self::Assign(node) => node.range,
            Self::Return(node) => node.range,
            Self::If(node) => node.range,
            Self::While(node) => node.range,
            Self::For(node) => node.range,
            Self::FunctionDef(node) => node.range,
            Self::Pass(range) => *range,
        }
    }
}
