//! Randomized checks that optimized code agrees with unoptimized code, that
//! inferred ranges hold at run time, and that folding matches execution.

mod common;

use common::{profile, Tiered};

use prism_opt::hierarchy::ClassTable;
use prism_opt::ir::{
    BinaryOp, ClassId, CmpOp, FlowGraph, FlowGraphBuilder, InstrId, IntWidth, Interpreter, Literal,
    Op, Outcome, Repr, Selector, Value,
};
use prism_opt::opt::sccp::evaluation::{fold_compare, fold_generic_binary};
use prism_opt::opt::sccp::{EdgeExecutability, LatticeValue, SccpSolver};
use prism_opt::opt::{CompileContext, ConstantPropagator, OptimizationPass};
use prism_opt::OptConfig;

use proptest::prelude::*;

const TYPED_OPS: &[BinaryOp] = &[
    BinaryOp::Add,
    BinaryOp::Sub,
    BinaryOp::Mul,
    BinaryOp::BitAnd,
    BinaryOp::BitOr,
    BinaryOp::BitXor,
    BinaryOp::Shl,
    BinaryOp::Shr,
    BinaryOp::Mod,
    BinaryOp::TruncDiv,
];

const CMP_OPS: &[CmpOp] = &[CmpOp::Eq, CmpOp::Ne, CmpOp::Lt, CmpOp::Le, CmpOp::Gt, CmpOp::Ge];

fn int64(op: BinaryOp) -> Op {
    Op::IntBinary {
        op,
        width: IntWidth::Int64,
    }
}

fn interesting_int() -> impl Strategy<Value = i64> {
    prop_oneof![
        -70i64..=70,
        Just(0xFF),
        Just(0xFFFF),
        Just(u32::MAX as i64),
        Just(u32::MAX as i64 + 1),
        Just(i64::MAX),
        Just(i64::MIN),
        any::<i64>(),
    ]
}

/// Straight-line 64-bit arithmetic over two parameters and `consts`,
/// ending in a branch on `last < pivot`.
fn int64_program(consts: &[i64], steps: &[(usize, usize, usize)], pivot: i64) -> FlowGraph {
    let mut b = FlowGraphBuilder::new("arith", 2);
    let mut vals: Vec<InstrId> = Vec::new();
    for p in 0..2 {
        b.declare_param(p, ClassId::INT);
        let v = b.param(p);
        vals.push(b.emit(Op::Unbox { to: Repr::Int64 }, &[v]));
    }
    for &c in consts {
        let k = b.int(c);
        vals.push(b.emit(Op::Unbox { to: Repr::Int64 }, &[k]));
    }
    for &(op, l, r) in steps {
        let (l, r) = (vals[l % vals.len()], vals[r % vals.len()]);
        vals.push(b.emit(int64(TYPED_OPS[op % TYPED_OPS.len()]), &[l, r]));
    }
    let last = vals[vals.len() - 1];
    let k = b.int(pivot);
    let uk = b.emit(Op::Unbox { to: Repr::Int64 }, &[k]);
    let (below, above) = (b.new_block(), b.new_block());
    let cond = b.emit(Op::IntCompare { op: CmpOp::Lt }, &[last, uk]);
    b.branch(cond, below, above);
    b.switch_to(below);
    let boxed = b.emit(Op::Box { from: Repr::Int64 }, &[last]);
    b.ret(boxed);
    b.switch_to(above);
    let diff = b.emit(int64(BinaryOp::Sub), &[last, uk]);
    let boxed = b.emit(Op::Box { from: Repr::Int64 }, &[diff]);
    b.ret(boxed);
    b.finish().expect("valid graph")
}

/// `(x & m1) * (y & m2) ^ ((x & m1) << 3)`, boxed.
fn masked_product(m1: i64, m2: i64) -> FlowGraph {
    let mut b = FlowGraphBuilder::new("masked", 2);
    b.declare_param(0, ClassId::INT);
    b.declare_param(1, ClassId::INT);
    let (x, y) = (b.param(0), b.param(1));
    let (k1, k2, three) = (b.int(m1), b.int(m2), b.int(3));
    let [ux, uy, u1, u2, u3] =
        [x, y, k1, k2, three].map(|v| b.emit(Op::Unbox { to: Repr::Int64 }, &[v]));
    let a = b.emit(int64(BinaryOp::BitAnd), &[ux, u1]);
    let c = b.emit(int64(BinaryOp::BitAnd), &[uy, u2]);
    let prod = b.emit(int64(BinaryOp::Mul), &[a, c]);
    let shifted = b.emit(int64(BinaryOp::Shl), &[a, u3]);
    let mixed = b.emit(int64(BinaryOp::BitXor), &[prod, shifted]);
    let boxed = b.emit(Op::Box { from: Repr::Int64 }, &[mixed]);
    b.ret(boxed);
    b.finish().expect("valid graph")
}

/// `for (i = start; i < a.length; i += step) sum += a[i + offset]`
fn strided_sum(offset: i64, step: i64) -> FlowGraph {
    let mut b = FlowGraphBuilder::new("strided", 2);
    let (a, start) = (b.param(0), b.param(1));
    let (zero, off, inc) = (b.int(0), b.int(offset), b.int(step));
    let entry = b.current_block();
    let (header, body, exit) = (b.new_block(), b.new_block(), b.new_block());
    b.goto(header);

    b.switch_to(header);
    let i = b.phi();
    let sum = b.phi();
    b.set_frame(&[a, i, sum]);
    let n = b.call(Selector::Length, &[a]);
    let more = b.call(Selector::Compare(CmpOp::Lt), &[i, n]);
    b.branch(more, body, exit);

    b.switch_to(body);
    let index = if offset == 0 {
        i
    } else {
        b.call(Selector::Binary(BinaryOp::Add), &[i, off])
    };
    let x = b.call(Selector::Index, &[a, index]);
    let next_sum = b.call(Selector::Binary(BinaryOp::Add), &[sum, x]);
    let next_i = b.call(Selector::Binary(BinaryOp::Add), &[i, inc]);
    b.goto(header);

    b.switch_to(exit);
    b.ret(sum);

    b.phi_input(i, entry, start);
    b.phi_input(i, body, next_i);
    b.phi_input(sum, entry, zero);
    b.phi_input(sum, body, next_sum);
    b.finish().expect("valid graph")
}

fn dynamic_binary(selector: Selector) -> FlowGraph {
    let mut b = FlowGraphBuilder::new("op", 2);
    let (x, y) = (b.param(0), b.param(1));
    let v = b.call(selector, &[x, y]);
    b.ret(v);
    b.finish().expect("valid graph")
}

/// Diamonds and counting loops chained one after another. Each region
/// branches on the parameter or on the running value against a constant,
/// so some conditions only become known while solving.
fn branchy_program(regions: &[(bool, bool, usize, i64)]) -> FlowGraph {
    let mut b = FlowGraphBuilder::new("branchy", 1);
    b.declare_param(0, ClassId::INT);
    let p = b.param(0);
    let x = b.emit(Op::Unbox { to: Repr::Int64 }, &[p]);
    let one = b.int(1);
    let mut v = b.int(0);
    for &(is_loop, on_param, cmp, c) in regions {
        let k = b.int(c);
        let op = CMP_OPS[cmp % CMP_OPS.len()];
        if is_loop {
            let before = b.current_block();
            let (header, body, exit) = (b.new_block(), b.new_block(), b.new_block());
            b.goto(header);
            b.switch_to(header);
            let i = b.phi();
            let lhs = if on_param { x } else { i };
            let cond = b.emit(Op::IntCompare { op }, &[lhs, k]);
            b.branch(cond, body, exit);
            b.switch_to(body);
            let next = b.emit(int64(BinaryOp::Add), &[i, one]);
            b.goto(header);
            b.phi_input(i, before, v);
            b.phi_input(i, body, next);
            b.switch_to(exit);
            v = i;
        } else {
            let lhs = if on_param { x } else { v };
            let cond = b.emit(Op::IntCompare { op }, &[lhs, k]);
            let (yes, no, join) = (b.new_block(), b.new_block(), b.new_block());
            b.branch(cond, yes, no);
            b.switch_to(yes);
            let bumped = b.emit(int64(BinaryOp::Add), &[v, one]);
            b.goto(join);
            b.switch_to(no);
            b.goto(join);
            b.switch_to(join);
            let phi = b.phi();
            b.phi_input(phi, yes, bumped);
            b.phi_input(phi, no, v);
            v = phi;
        }
    }
    let boxed = b.emit(Op::Box { from: Repr::Int64 }, &[v]);
    b.ret(boxed);
    b.finish().expect("valid graph")
}

/// A folded constant must be what executing the operation returns.
fn check_fold(
    folded: LatticeValue,
    selector: Selector,
    a: i64,
    b: i64,
) -> Result<(), TestCaseError> {
    let table = ClassTable::new();
    let g = dynamic_binary(selector);
    let outcome = Interpreter::new(&table)
        .run(&g, &[Value::Int(a), Value::Int(b)])
        .expect("run");
    match (folded, outcome) {
        (LatticeValue::Constant(lit), Outcome::Return(v)) => {
            prop_assert!(v.same_as(&Value::from_literal(&lit)), "folded {lit:?}, ran {v:?}");
        }
        (LatticeValue::Constant(lit), other) => {
            prop_assert!(false, "folded {lit:?} but execution gave {other:?}");
        }
        (LatticeValue::Unknown, _) => prop_assert!(false, "constant operands folded to unknown"),
        (LatticeValue::NonConstant, _) => {}
    }
    Ok(())
}

#[test]
fn test_fold_table() {
    let int = LatticeValue::int;
    let s = |v: &str| LatticeValue::Constant(Literal::Str(v.into()));
    assert_eq!(fold_generic_binary(BinaryOp::Add, &int(3), &int(4)), int(7));
    assert_eq!(fold_compare(CmpOp::Eq, &int(5), &int(5)), LatticeValue::bool(true));
    assert_eq!(fold_compare(CmpOp::Eq, &s("x"), &s("y")), LatticeValue::bool(false));
    assert_eq!(fold_generic_binary(BinaryOp::Mod, &int(-7), &int(4)), int(1));
    assert_eq!(fold_generic_binary(BinaryOp::TruncDiv, &int(-7), &int(2)), int(-3));
    assert_eq!(fold_generic_binary(BinaryOp::Shl, &int(1), &int(64)), int(0));
    assert_eq!(fold_generic_binary(BinaryOp::Shr, &int(-8), &int(100)), int(-1));
    // Throwing operations are never folded.
    assert_eq!(fold_generic_binary(BinaryOp::Mod, &int(1), &int(0)), LatticeValue::NonConstant);
    assert_eq!(fold_generic_binary(BinaryOp::Shl, &int(1), &int(-1)), LatticeValue::NonConstant);
    assert_eq!(
        fold_generic_binary(BinaryOp::Add, &LatticeValue::Unknown, &int(1)),
        LatticeValue::Unknown
    );
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_binary_fold_matches_execution(
        op in 0..TYPED_OPS.len(),
        a in interesting_int(),
        b in interesting_int(),
    ) {
        let op = TYPED_OPS[op];
        let folded = fold_generic_binary(op, &LatticeValue::int(a), &LatticeValue::int(b));
        check_fold(folded, Selector::Binary(op), a, b)?;
    }

    #[test]
    fn prop_compare_fold_matches_execution(
        op in 0..CMP_OPS.len(),
        a in interesting_int(),
        b in interesting_int(),
    ) {
        let op = CMP_OPS[op];
        let folded = fold_compare(op, &LatticeValue::int(a), &LatticeValue::int(b));
        check_fold(folded, Selector::Compare(op), a, b)?;
    }

    /// Ranges are checked on every produced value by the interpreter.
    #[test]
    fn prop_optimized_arithmetic_is_sound(
        consts in prop::collection::vec(interesting_int(), 1..4),
        steps in prop::collection::vec((any::<usize>(), any::<usize>(), any::<usize>()), 1..8),
        pivot in interesting_int(),
        x in interesting_int(),
        y in interesting_int(),
    ) {
        let table = ClassTable::new();
        let g = int64_program(&consts, &steps, pivot);
        let mut tiered = Tiered::compile(g, &table, OptConfig::default());
        tiered.call(&[Value::Int(x), Value::Int(y)]);
        tiered.call(&[Value::Int(y), Value::Int(x)]);
        prop_assert_eq!(tiered.deopts, 0);
    }

    #[test]
    fn prop_constant_propagation_is_idempotent(
        consts in prop::collection::vec(interesting_int(), 1..4),
        steps in prop::collection::vec((any::<usize>(), any::<usize>(), any::<usize>()), 1..8),
        pivot in interesting_int(),
    ) {
        let table = ClassTable::new();
        let config = OptConfig::default();
        let mut g = int64_program(&consts, &steps, pivot);
        let mut cx = CompileContext::new(&config, &table);
        let mut pass = ConstantPropagator::new();
        pass.run(&mut g, &mut cx).expect("first run");
        let before = g.to_string();
        let changed = pass.run(&mut g, &mut cx).expect("second run");
        prop_assert!(!changed);
        prop_assert_eq!(g.to_string(), before);
    }

    /// No block or edge is ever taken back while solving.
    #[test]
    fn prop_reachability_only_grows(
        regions in prop::collection::vec(
            (any::<bool>(), any::<bool>(), 0..CMP_OPS.len(), -3i64..=3),
            1..6,
        ),
    ) {
        let table = ClassTable::new();
        let g = branchy_program(&regions);
        let mut snapshots: Vec<EdgeExecutability> = Vec::new();
        let result = SccpSolver::new(&g, &table).solve_observed(|e| snapshots.push(e.clone()));
        for pair in snapshots.windows(2) {
            prop_assert!(pair[0].is_subset_of(&pair[1]));
        }
        let last = snapshots.last().expect("at least the entry");
        prop_assert!(last.is_subset_of(&result.edges) && result.edges.is_subset_of(last));
        prop_assert!(result.is_reachable(g.entry()));
    }

    /// Narrowed code agrees with 64-bit code, mask boundaries included.
    #[test]
    fn prop_narrowing_matches_wide_result(
        m1 in 1i64..=0xFFFF,
        m2 in 1i64..=0xFFFF,
        x in interesting_int(),
        y in interesting_int(),
    ) {
        let table = ClassTable::new();
        let mut tiered = Tiered::compile(masked_product(m1, m2), &table, OptConfig::default());
        let narrowed = tiered.reports[0].narrowing_stats().expect("narrowing ran").narrowed;
        prop_assert!(narrowed >= 4, "only {narrowed} narrowed\n{}", tiered.code);
        for (a, b) in [(x, y), (m1, m2), (-1, -1), (0, 0), (u32::MAX as i64, m2)] {
            tiered.call(&[Value::Int(a), Value::Int(b)]);
        }
    }

    /// Every eliminated check stays behind as an assertion that must hold.
    #[test]
    fn prop_eliminated_checks_never_fail(
        offset in -2i64..=2,
        step in 1i64..=3,
        len in 0usize..12,
        start in -2i64..4,
    ) {
        let table = ClassTable::new();
        let items: Vec<i64> = (0..len as i64).map(|v| v * 3 - 5).collect();
        let args = vec![Value::int_array(&items), Value::Int(start)];
        let mut g = strided_sum(offset, step);
        let warmup = vec![Value::int_array(&[1, 2, 3, 4]), Value::Int(0)];
        profile(&mut g, &table, &[args.clone(), warmup]);
        let config = OptConfig {
            assert_eliminated_bounds: true,
            ..OptConfig::default()
        };
        let mut tiered = Tiered::compile(g, &table, config);
        if offset > 0 {
            let stats = tiered.reports[0].range_stats().expect("range ran");
            let eliminated = stats.bounds_checks_eliminated;
            prop_assert_eq!(eliminated, 0);
        }
        tiered.call(&args);
        tiered.call(&[Value::int_array(&[]), Value::Int(start)]);
    }
}
