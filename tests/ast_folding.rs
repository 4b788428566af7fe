use ruff_text_size::TextRange;
use stackasm::{
    CompileOpts,
    codegen::{
        ast::{Expr, ExprBinOp, ExprContext, ExprName, Stmt, StmtAssign, StmtExpr},
        fold::BinaryOperator,
    },
    compiler_core::ConstantData,
    optimize_ast,
};

fn int(value: i64) -> Expr {
    Expr::constant(ConstantData::int(value), TextRange::default())
}

fn binop(left: Expr, op: BinaryOperator, right: Expr) -> Expr {
    Expr::BinOp(ExprBinOp {
        range: TextRange::default(),
        left: Box::new(left),
        op,
        right: Box::new(right),
    })
}

fn assign(target: &str, value: Expr) -> Stmt {
    Stmt::Assign(StmtAssign {
        range: TextRange::default(),
        targets: vec![Expr::Name(ExprName {
            range: TextRange::default(),
            id: target.to_owned(),
            ctx: ExprContext::Store,
        })],
        value,
    })
}

#[test]
fn test_module_folding() {
    let pow = || binop(int(2), BinaryOperator::Pow, int(100));
    let body = vec![
        assign("big", binop(pow(), BinaryOperator::Mult, pow())),
        assign("small", binop(int(6), BinaryOperator::Mult, int(7))),
        Stmt::Expr(StmtExpr {
            range: TextRange::default(),
            value: Expr::Name(ExprName {
                range: TextRange::default(),
                id: "__debug__".to_owned(),
                ctx: ExprContext::Load,
            }),
        }),
    ];
    let opts = CompileOpts {
        optimize: 1,
        ..Default::default()
    };
    let folded = optimize_ast(body, &opts);

    let [Stmt::Assign(big), Stmt::Assign(small), Stmt::Expr(debug)] = folded.as_slice() else {
        panic!("statements were added or removed: {folded:?}");
    };
    // the guard trips, so the product stays a runtime multiplication
    assert!(matches!(&big.value, Expr::BinOp(node) if node.op == BinaryOperator::Mult));
    assert_eq!(small.value.as_constant(), Some(&ConstantData::int(42)));
    assert_eq!(
        debug.value.as_constant(),
        Some(&ConstantData::Boolean { value: false })
    );
}

#[test]
fn test_refolding_is_stable() {
    let body = vec![assign(
        "x",
        binop(
            binop(int(1), BinaryOperator::LShift, int(10)),
            BinaryOperator::Sub,
            int(1),
        ),
    )];
    let opts = CompileOpts::default();
    let once = optimize_ast(body, &opts);
    let twice = optimize_ast(once.clone(), &opts);
    assert_eq!(once, twice);
}
