//! Constant folding on the syntax tree, before any flow graph exists.
//!
//! Folding evaluates through [`crate::fold`], so a refused fold (division by
//! zero, an operand too large for [`FoldLimits`], an unsupported type) just
//! leaves the node in place with its children folded.

use crate::{
    ast::{
        Comprehension, Expr, ExprBinOp, ExprBoolOp, ExprCall, ExprCompare, ExprComprehension,
        ExprContext, ExprName, ExprNamed, ExprSequence, ExprStarred, ExprSubscript, ExprUnaryOp,
        Stmt, StmtAssign, StmtExpr, StmtFor, StmtFunctionDef, StmtIf, StmtReturn, StmtWhile,
    },
    fold::{self, BinaryOperator, FoldLimits, UnaryOperator},
};
use log::debug;
use stackasm_compiler_core::{ComparisonOperator, ConstantData};

/// Folds a whole module body.
pub fn fold_module(body: Vec<Stmt>, optimize: u8, limits: &FoldLimits) -> Vec<Stmt> {
    AstOptimizer::new(optimize, *limits).fold_body(body)
}

#[derive(Clone, Debug)]
pub struct AstOptimizer {
    /// `-O` level; `__debug__` is true only at level 0.
    optimize: u8,
    limits: FoldLimits,
}

impl AstOptimizer {
    pub const fn new(optimize: u8, limits: FoldLimits) -> Self {
        Self { optimize, limits }
    }

    pub fn fold_body(&self, body: Vec<Stmt>) -> Vec<Stmt> {
        body.into_iter().map(|stmt| self.fold_stmt(stmt)).collect()
    }

    fn fold_exprs(&self, exprs: Vec<Expr>) -> Vec<Expr> {
        exprs.into_iter().map(|expr| self.fold_expr(expr)).collect()
    }

    pub fn fold_stmt(&self, stmt: Stmt) -> Stmt {
        match stmt {
            Stmt::Expr(StmtExpr { range, value }) => Stmt::Expr(StmtExpr {
                range,
                value: self.fold_expr(value),
            }),
            Stmt::Assign(StmtAssign {
                range,
                targets,
                value,
            }) => Stmt::Assign(StmtAssign {
                range,
                targets: self.fold_exprs(targets),
                value: self.fold_expr(value),
            }),
            Stmt::Return(StmtReturn { range, value }) => Stmt::Return(StmtReturn {
                range,
                value: value.map(|value| self.fold_expr(value)),
            }),
            Stmt::If(StmtIf {
                range,
                test,
                body,
                orelse,
            }) => Stmt::If(StmtIf {
                range,
                test: self.fold_expr(test),
                body: self.fold_body(body),
                orelse: self.fold_body(orelse),
            }),
            Stmt::While(StmtWhile {
                range,
                test,
                body,
                orelse,
            }) => Stmt::While(StmtWhile {
                range,
                test: self.fold_expr(test),
                body: self.fold_body(body),
                orelse: self.fold_body(orelse),
            }),
            Stmt::For(StmtFor {
                range,
                target,
                iter,
                body,
                orelse,
            }) => {
                let target = self.fold_expr(target);
                let iter = self.fold_expr(iter);
                Stmt::For(StmtFor {
                    range,
                    target,
                    iter: self.fold_iter(iter),
                    body: self.fold_body(body),
                    orelse: self.fold_body(orelse),
                })
            }
            Stmt::FunctionDef(StmtFunctionDef { range, name, body }) => {
                Stmt::FunctionDef(StmtFunctionDef {
                    range,
                    name,
                    body: self.fold_body(body),
                })
            }
            Stmt::Pass(range) => Stmt::Pass(range),
        }
    }

    pub fn fold_expr(&self, expr: Expr) -> Expr {
        match expr {
            Expr::UnaryOp(node) => self.fold_unary(node),
            Expr::BinOp(node) => self.fold_binary(node),
            Expr::Compare(node) => self.fold_compare(node),
            Expr::Subscript(node) => self.fold_subscript(node),
            Expr::Tuple(ExprSequence { range, elts, ctx }) => {
                let elts = self.fold_exprs(elts);
                if ctx == ExprContext::Load {
                    if let Some(value) = const_tuple(&elts) {
                        return Expr::constant(value, range);
                    }
                }
                Expr::Tuple(ExprSequence { range, elts, ctx })
            }
            Expr::List(ExprSequence { range, elts, ctx }) => Expr::List(ExprSequence {
                range,
                elts: self.fold_exprs(elts),
                ctx,
            }),
            Expr::Set(ExprSequence { range, elts, ctx }) => Expr::Set(ExprSequence {
                range,
                elts: self.fold_exprs(elts),
                ctx,
            }),
            Expr::Name(ExprName { range, id, ctx })
                if id == "__debug__" && ctx == ExprContext::Load =>
            {
                Expr::constant(
                    ConstantData::Boolean {
                        value: self.optimize == 0,
                    },
                    range,
                )
            }
            Expr::BoolOp(ExprBoolOp { range, op, values }) => Expr::BoolOp(ExprBoolOp {
                range,
                op,
                values: self.fold_exprs(values),
            }),
            Expr::Starred(ExprStarred { range, value, ctx }) => Expr::Starred(ExprStarred {
                range,
                value: Box::new(self.fold_expr(*value)),
                ctx,
            }),
            Expr::Call(ExprCall { range, func, args }) => Expr::Call(ExprCall {
                range,
                func: Box::new(self.fold_expr(*func)),
                args: self.fold_exprs(args),
            }),
            Expr::Named(ExprNamed {
                range,
                target,
                value,
            }) => Expr::Named(ExprNamed {
                range,
                target,
                value: Box::new(self.fold_expr(*value)),
            }),
            Expr::ListComp(node) => Expr::ListComp(self.fold_comprehension(node)),
            Expr::SetComp(node) => Expr::SetComp(self.fold_comprehension(node)),
            Expr::Generator(node) => Expr::Generator(self.fold_comprehension(node)),
            expr @ (Expr::Constant(_) | Expr::Name(_) | Expr::Other(_)) => expr,
        }
    }

    fn fold_unary(&self, node: ExprUnaryOp) -> Expr {
        let ExprUnaryOp { range, op, operand } = node;
        let operand = self.fold_expr(*operand);
        if let Some(value) = operand.as_constant() {
            match fold::unary_op(op, value) {
                Ok(folded) => return Expr::constant(folded, range),
                Err(err) => debug!("not folding {op:?} {value}: {err}"),
            }
        }
        // `not a is b` is `a is not b`, `not a in b` is `a not in b`
        let operand = match (op, operand) {
            (UnaryOperator::Not, Expr::Compare(mut compare)) if compare.ops.len() == 1 => {
                match compare.ops[0].inverse() {
                    Some(inverse) => {
                        compare.ops[0] = inverse;
                        compare.range = range;
                        return Expr::Compare(compare);
                    }
                    None => Expr::Compare(compare),
                }
            }
            (_, operand) => operand,
        };
        Expr::UnaryOp(ExprUnaryOp {
            range,
            op,
            operand: Box::new(operand),
        })
    }

    fn fold_binary(&self, node: ExprBinOp) -> Expr {
        let ExprBinOp {
            range,
            left,
            op,
            right,
        } = node;
        let left = self.fold_expr(*left);
        let right = self.fold_expr(*right);
        if let (Some(l), Some(r)) = (left.as_constant(), right.as_constant()) {
            match fold::binary_op(op, l, r, &self.limits) {
                Ok(folded) => return Expr::constant(folded, range),
                Err(err) => debug!("not folding {l} {} {r}: {err}", op.symbol()),
            }
        }
        Expr::BinOp(ExprBinOp {
            range,
            left: Box::new(left),
            op,
            right: Box::new(right),
        })
    }

    fn fold_subscript(&self, node: ExprSubscript) -> Expr {
        let ExprSubscript {
            range,
            value,
            slice,
            ctx,
        } = node;
        let value = self.fold_expr(*value);
        let slice = self.fold_expr(*slice);
        if ctx == ExprContext::Load {
            if let (Some(v), Some(s)) = (value.as_constant(), slice.as_constant()) {
                if let Ok(folded) = fold::binary_op(BinaryOperator::Subscr, v, s, &self.limits) {
                    return Expr::constant(folded, range);
                }
            }
        }
        Expr::Subscript(ExprSubscript {
            range,
            value: Box::new(value),
            slice: Box::new(slice),
            ctx,
        })
    }

    fn fold_compare(&self, node: ExprCompare) -> Expr {
        let ExprCompare {
            range,
            left,
            ops,
            comparators,
        } = node;
        let left = self.fold_expr(*left);
        let mut comparators = self.fold_exprs(comparators);
        if matches!(
            ops.last(),
            Some(ComparisonOperator::In | ComparisonOperator::NotIn)
        ) {
            if let Some(last) = comparators.pop() {
                comparators.push(self.fold_iter(last));
            }
        }
        if let ([op], [right]) = (ops.as_slice(), comparators.as_slice()) {
            if let (Some(l), Some(r)) = (left.as_constant(), right.as_constant()) {
                if let Ok(folded) = fold::compare_op(*op, l, r) {
                    return Expr::constant(folded, range);
                }
            }
        }
        Expr::Compare(ExprCompare {
            range,
            left: Box::new(left),
            ops,
            comparators,
        })
    }

    fn fold_comprehension(&self, node: ExprComprehension) -> ExprComprehension {
        let ExprComprehension {
            range,
            elt,
            generators,
        } = node;
        let generators = generators
            .into_iter()
            .map(|generator| {
                let target = self.fold_expr(generator.target);
                let iter = self.fold_expr(generator.iter);
                let ifs = self.fold_exprs(generator.ifs);
                Comprehension {
                    range: generator.range,
                    target,
                    iter: self.fold_iter(iter),
                    ifs,
                }
            })
            .collect();
        ExprComprehension {
            range,
            elt: Box::new(self.fold_expr(*elt)),
            generators,
        }
    }

    /// A display that is only iterated over or membership-tested can be
    /// immutable: lists become tuples, constant sets become frozensets.
    /// `expr` is already folded.
    fn fold_iter(&self, expr: Expr) -> Expr {
        match expr {
            Expr::List(ExprSequence { range, elts, ctx }) => {
                if let Some(value) = const_tuple(&elts) {
                    return Expr::constant(value, range);
                }
                if elts.iter().any(|e| matches!(e, Expr::Starred(_))) {
                    Expr::List(ExprSequence { range, elts, ctx })
                } else {
                    Expr::Tuple(ExprSequence { range, elts, ctx })
                }
            }
            Expr::Set(ExprSequence { range, elts, ctx }) => {
                if let Some(ConstantData::Tuple { elements }) = const_tuple(&elts) {
                    return Expr::constant(ConstantData::frozenset(elements), range);
                }
                Expr::Set(ExprSequence { range, elts, ctx })
            }
            expr => expr,
        }
    }
}

fn const_tuple(elts: &[Expr]) -> Option<ConstantData> {
    let elements = elts
        .iter()
        .map(|e| e.as_constant().cloned())
        .collect::<Option<Vec<_>>>()?;
    Some(ConstantData::Tuple { elements })
}
