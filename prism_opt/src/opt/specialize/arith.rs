//! Numeric operators and comparisons.
//!
//! Widening ladder for a binary operator, first match wins:
//!
//! | feedback          | rewrite                                          |
//! |-------------------|--------------------------------------------------|
//! | Smi, Smi          | `CheckSmi` x2, `IntBinary<Smi>`                  |
//! | int, int          | `CheckClass` x2, unbox, `IntBinary<Int64>`, box  |
//! | number, number    | `CheckClass` x2, `CheckEitherDouble`, `DoubleBinary` |
//! | vector, vector    | `CheckClass` x2, `SimdBinary`                    |
//!
//! A Smi operation that overflowed before (`BINARY_SMI_OP`) or a Smi check
//! that failed before (`CHECK_SMI`) drops to the int rung.

use super::{CallInfo, OperandClasses, Rewriter, DOUBLE_ONLY, INTS, NUMBERS, SMI_ONLY};
use crate::feedback::DeoptReasons;
use crate::hierarchy::FunctionKind;
use crate::ir::eval::char_code;
use crate::ir::instr::{InstrId, Op};
use crate::ir::types::{
    BinaryOp, ClassId, CmpOp, IntWidth, Literal, Repr, Selector, SimdKind, UnaryOp, SMI_MAX,
};

use smallvec::SmallVec;

impl Rewriter<'_, '_> {
    // =========================================================================
    // Binary Operators
    // =========================================================================

    pub(super) fn try_binary_op(&mut self, info: &CallInfo, op: BinaryOp) -> bool {
        let rewritten = self.try_mod_pow2(info, op)
            || self.try_fuse_shift_mask(info, op)
            || self.try_smi_binary(info, op)
            || self.try_int64_binary(info, op)
            || self.try_double_binary(info, op)
            || self.try_simd_binary(info, op);
        if rewritten {
            self.stats.arithmetic += 1;
        }
        rewritten
    }

    fn smi_operands(&self, info: &CallInfo) -> bool {
        self.classes(info, 0).within(SMI_ONLY) && self.classes(info, 1).within(SMI_ONLY)
    }

    fn int_operands(&self, info: &CallInfo) -> bool {
        self.classes(info, 0).within(INTS) && self.classes(info, 1).within(INTS)
    }

    fn try_smi_binary(&mut self, info: &CallInfo, op: BinaryOp) -> bool {
        if op == BinaryOp::Div || !self.smi_operands(info) {
            return false;
        }
        if !self.cx.config.speculative {
            let (a, b) = (info.args[0], info.args[1]);
            let v = self.emit(info, Op::CheckedSmiOp { op }, &[a, b]);
            self.replace_call(info, v);
            return true;
        }
        let result_op = Op::IntBinary {
            op,
            width: IntWidth::Smi,
        };
        if result_op.can_deoptimize() && !self.may_speculate(info, DeoptReasons::BINARY_SMI_OP) {
            return false;
        }
        if !self.try_guard(info, &[(0, SMI_ONLY), (1, SMI_ONLY)]) {
            return false;
        }
        let v = self.emit(info, result_op, &[info.args[0], info.args[1]]);
        self.replace_call(info, v);
        true
    }

    fn try_int64_binary(&mut self, info: &CallInfo, op: BinaryOp) -> bool {
        if !self.int_operands(info) {
            return false;
        }
        if op == BinaryOp::Div {
            // int / int is a double division.
            if !self.try_guard(info, &[(0, INTS), (1, INTS)]) {
                return false;
            }
            let v = self.emit(info, Op::DoubleBinary { op }, &[info.args[0], info.args[1]]);
            self.replace_call(info, v);
            return true;
        }
        if !self.try_guard(info, &[(0, INTS), (1, INTS)]) {
            return false;
        }
        let v = self.emit_int64_binary(info.call, op, info.args[0], info.args[1]);
        self.replace_call(info, v);
        true
    }

    /// Unbox, operate at 64 bits, box.
    fn emit_int64_binary(&mut self, at: InstrId, op: BinaryOp, a: InstrId, b: InstrId) -> InstrId {
        let ua = self.emit_before(at, Op::Unbox { to: Repr::Int64 }, &[a]);
        let ub = self.emit_before(at, Op::Unbox { to: Repr::Int64 }, &[b]);
        let r = self.emit_before(
            at,
            Op::IntBinary {
                op,
                width: IntWidth::Int64,
            },
            &[ua, ub],
        );
        self.emit_before(at, Op::Box { from: Repr::Int64 }, &[r])
    }

    fn try_double_binary(&mut self, info: &CallInfo, op: BinaryOp) -> bool {
        if !matches!(
            op,
            BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Mod
        ) {
            return false;
        }
        let (a, b) = (self.classes(info, 0), self.classes(info, 1));
        if !mixes_doubles(&a, &b) {
            return false;
        }
        // Two ints would produce an int, except for `/`. An operand guarded
        // to doubles settles it.
        let needs_either_check =
            op != BinaryOp::Div && !(a.within(DOUBLE_ONLY) || b.within(DOUBLE_ONLY));
        if needs_either_check && !self.may_speculate(info, DeoptReasons::BINARY_DOUBLE_OP) {
            return false;
        }
        if !self.try_guard(info, &[(0, number_guard(&a)), (1, number_guard(&b))]) {
            return false;
        }
        let (x, y) = (info.args[0], info.args[1]);
        if needs_either_check {
            self.emit(info, Op::CheckEitherDouble, &[x, y]);
            self.stats.guards_inserted += 1;
        }
        let v = self.emit(info, Op::DoubleBinary { op }, &[x, y]);
        self.replace_call(info, v);
        true
    }

    fn try_simd_binary(&mut self, info: &CallInfo, op: BinaryOp) -> bool {
        let (a, b) = (self.classes(info, 0), self.classes(info, 1));
        let [cid] = a.cids.as_slice() else {
            return false;
        };
        let Some(kind) = SimdKind::from_class(*cid) else {
            return false;
        };
        if b.cids.as_slice() != [*cid] || !self.is_builtin(*cid, &Selector::Binary(op)) {
            return false;
        }
        let allowed = [*cid];
        if !self.try_guard(info, &[(0, &allowed), (1, &allowed)]) {
            return false;
        }
        let v = self.emit(info, Op::SimdBinary { kind, op }, &[info.args[0], info.args[1]]);
        self.replace_call(info, v);
        true
    }

    /// Whether `selector` on `cid` resolves to the built-in primitive.
    pub(super) fn is_builtin(&self, cid: ClassId, selector: &Selector) -> bool {
        let hierarchy = self.cx.hierarchy();
        hierarchy
            .lookup(cid, selector)
            .and_then(|f| hierarchy.function(f))
            .is_some_and(|f| matches!(&f.kind, FunctionKind::Intrinsic(s) if s == selector))
    }

    /// `x % 2^k` on a Smi is `x & (2^k - 1)`, negative `x` included, since
    /// the modulo is Euclidean.
    fn try_mod_pow2(&mut self, info: &CallInfo, op: BinaryOp) -> bool {
        if op != BinaryOp::Mod || !self.classes(info, 0).within(SMI_ONLY) {
            return false;
        }
        let Some(c) = self.graph.int_constant_value(info.args[1]) else {
            return false;
        };
        if c <= 0 || c & (c - 1) != 0 {
            return false;
        }
        if !self.try_guard(info, &[(0, SMI_ONLY)]) {
            return false;
        }
        let mask = self.graph.int_constant(c - 1);
        let v = self.emit(
            info,
            Op::IntBinary {
                op: BinaryOp::BitAnd,
                width: IntWidth::Smi,
            },
            &[info.args[0], mask],
        );
        self.replace_call(info, v);
        true
    }

    /// `(a << b) & c` with a Smi-range mask `c` becomes one truncating shift
    /// that cannot overflow.
    fn try_fuse_shift_mask(&mut self, info: &CallInfo, op: BinaryOp) -> bool {
        if op != BinaryOp::BitAnd || !self.cx.config.fuse_shift_mask {
            return false;
        }
        for (mask_arg, shift_arg) in [(1usize, 0usize), (0, 1)] {
            let Some(mask) = self.graph.int_constant_value(info.args[mask_arg]) else {
                continue;
            };
            if !(0..=SMI_MAX).contains(&mask) {
                continue;
            }
            let Some(chain) = self.shift_chain(info, info.args[shift_arg]) else {
                continue;
            };
            let v = self.emit(info, Op::ShiftMask { mask }, &[chain.value, chain.count]);
            self.replace_call(info, v);
            for dead in chain.removable {
                if !self.graph.instr(dead).is_removed() && !self.graph.has_uses(dead) {
                    self.graph.remove_instr(dead);
                }
            }
            return true;
        }
        false
    }

    /// Recognize a specialized left shift whose only consumer is this call.
    fn shift_chain(&self, info: &CallInfo, v: InstrId) -> Option<ShiftChain> {
        let only_used_here = |def: InstrId| {
            self.graph.uses(def).all(|(_, u)| {
                u.user == info.call
                    || info.pushes.contains(&u.user)
                    || (!self.graph.op(u.user).has_value()
                        && self.graph.instr(u.user).deopt_id == info.deopt_id)
            })
        };
        let chain = match self.graph.op(v) {
            Op::IntBinary {
                op: BinaryOp::Shl,
                width: IntWidth::Smi,
            } => ShiftChain {
                value: self.graph.input(v, 0),
                count: self.graph.input(v, 1),
                removable: SmallVec::from_slice(&[v]),
            },
            Op::Box { from: Repr::Int64 } => {
                let shl = self.graph.input(v, 0);
                if !matches!(
                    self.graph.op(shl),
                    Op::IntBinary {
                        op: BinaryOp::Shl,
                        width: IntWidth::Int64
                    }
                ) || self.graph.use_count(shl) != 1
                {
                    return None;
                }
                let (ua, ub) = (self.graph.input(shl, 0), self.graph.input(shl, 1));
                let (Op::Unbox { .. }, Op::Unbox { .. }) = (self.graph.op(ua), self.graph.op(ub))
                else {
                    return None;
                };
                ShiftChain {
                    value: self.graph.input(ua, 0),
                    count: self.graph.input(ub, 0),
                    removable: SmallVec::from_slice(&[v, shl, ua, ub]),
                }
            }
            _ => return None,
        };
        only_used_here(v).then_some(chain)
    }

    // =========================================================================
    // Comparisons
    // =========================================================================

    pub(super) fn try_compare(&mut self, info: &CallInfo, op: CmpOp) -> bool {
        let rewritten = self.try_int_compare(info, op) || self.try_double_compare(info, op);
        if rewritten {
            self.stats.comparisons += 1;
        }
        rewritten
    }

    fn try_int_compare(&mut self, info: &CallInfo, op: CmpOp) -> bool {
        let (x, y) = (info.args[0], info.args[1]);
        if self.smi_operands(info) {
            if !self.cx.config.speculative {
                let v = self.emit(info, Op::CheckedSmiCompare { op }, &[x, y]);
                self.replace_call(info, v);
                return true;
            }
            if self.try_guard(info, &[(0, SMI_ONLY), (1, SMI_ONLY)]) {
                let v = self.emit(info, Op::IntCompare { op }, &[x, y]);
                self.replace_call(info, v);
                return true;
            }
        }
        if self.int_operands(info) && self.try_guard(info, &[(0, INTS), (1, INTS)]) {
            let v = self.emit(info, Op::IntCompare { op }, &[x, y]);
            self.replace_call(info, v);
            return true;
        }
        false
    }

    fn try_double_compare(&mut self, info: &CallInfo, op: CmpOp) -> bool {
        let (a, b) = (self.classes(info, 0), self.classes(info, 1));
        if !mixes_doubles(&a, &b) {
            return false;
        }
        // Comparing two ints through doubles loses precision.
        let needs_either_check = !(a.within(DOUBLE_ONLY) || b.within(DOUBLE_ONLY));
        if needs_either_check && !self.may_speculate(info, DeoptReasons::BINARY_DOUBLE_OP) {
            return false;
        }
        if !self.try_guard(info, &[(0, number_guard(&a)), (1, number_guard(&b))]) {
            return false;
        }
        let (x, y) = (info.args[0], info.args[1]);
        if needs_either_check {
            self.emit(info, Op::CheckEitherDouble, &[x, y]);
            self.stats.guards_inserted += 1;
        }
        let v = self.emit(info, Op::DoubleCompare { op }, &[x, y]);
        self.replace_call(info, v);
        true
    }

    /// `==` and `!=` forms that reduce to identity or character tests.
    pub(super) fn try_equality(&mut self, info: &CallInfo, op: CmpOp) -> bool {
        if !matches!(op, CmpOp::Eq | CmpOp::Ne) {
            return false;
        }
        let rewritten = self.try_string_char_equality(info, op)
            || self.try_null_equality(info, op)
            || self.try_bool_equality(info, op);
        if rewritten {
            self.stats.comparisons += 1;
        }
        rewritten
    }

    fn emit_identity(&mut self, info: &CallInfo, op: CmpOp) {
        let v = self.emit(
            info,
            Op::StrictCompare {
                negate: op == CmpOp::Ne,
            },
            &[info.args[0], info.args[1]],
        );
        self.replace_call(info, v);
    }

    /// Either operand is the `null` constant and the receiver's `==` is the
    /// built-in one.
    fn try_null_equality(&mut self, info: &CallInfo, op: CmpOp) -> bool {
        let is_null = |v: InstrId| matches!(self.graph.literal(v), Some(Literal::Null));
        if is_null(info.args[0]) {
            self.emit_identity(info, op);
            return true;
        }
        if !is_null(info.args[1]) {
            return false;
        }
        let receiver = self.classes(info, 0);
        let selector = Selector::Compare(CmpOp::Eq);
        if receiver.cids.is_empty()
            || !receiver.cids.iter().all(|&c| self.is_builtin(c, &selector))
        {
            return false;
        }
        let allowed: SmallVec<[ClassId; 4]> = receiver.cids.clone();
        if !self.try_guard(info, &[(0, &allowed)]) {
            return false;
        }
        self.emit_identity(info, op);
        true
    }

    /// Booleans are canonical, so equality is identity.
    fn try_bool_equality(&mut self, info: &CallInfo, op: CmpOp) -> bool {
        const BOOL_ONLY: &[ClassId] = &[ClassId::BOOL];
        if !self.classes(info, 0).within(BOOL_ONLY) || !self.try_guard(info, &[(0, BOOL_ONLY)]) {
            return false;
        }
        self.emit_identity(info, op);
        true
    }

    /// `s == "c"` against a one-character constant compares character
    /// codes.
    fn try_string_char_equality(&mut self, info: &CallInfo, op: CmpOp) -> bool {
        const STRING_ONLY: &[ClassId] = &[ClassId::STRING];
        for (const_arg, other) in [(1usize, 0usize), (0, 1)] {
            let Some(Literal::Str(s)) = self.graph.literal(info.args[const_arg]) else {
                continue;
            };
            if s.chars().count() != 1 {
                continue;
            }
            let code = char_code(s);
            if !self.classes(info, other).within(STRING_ONLY)
                || !self.try_guard(info, &[(other, STRING_ONLY)])
            {
                continue;
            }
            let actual = self.emit(info, Op::StringToCharCode, &[info.args[other]]);
            let expected = self.graph.int_constant(code);
            let v = self.emit(info, Op::IntCompare { op }, &[actual, expected]);
            self.replace_call(info, v);
            return true;
        }
        false
    }

    // =========================================================================
    // Unary Operators
    // =========================================================================

    pub(super) fn try_unary_op(&mut self, info: &CallInfo, op: UnaryOp) -> bool {
        let classes = self.classes(info, 0);
        let x = info.args[0];
        let smi_op = Op::IntUnary {
            op,
            width: IntWidth::Smi,
        };
        let smi_allowed =
            !smi_op.can_deoptimize() || self.may_speculate(info, DeoptReasons::UNARY_SMI_OP);
        let v = if classes.within(SMI_ONLY) && smi_allowed && self.try_guard(info, &[(0, SMI_ONLY)])
        {
            self.emit(info, smi_op, &[x])
        } else if classes.within(INTS) && self.try_guard(info, &[(0, INTS)]) {
            let unboxed = self.emit(info, Op::Unbox { to: Repr::Int64 }, &[x]);
            let r = self.emit(
                info,
                Op::IntUnary {
                    op,
                    width: IntWidth::Int64,
                },
                &[unboxed],
            );
            self.emit(info, Op::Box { from: Repr::Int64 }, &[r])
        } else if op == UnaryOp::Negate
            && classes.within(DOUBLE_ONLY)
            && self.try_guard(info, &[(0, DOUBLE_ONLY)])
        {
            self.emit(info, Op::DoubleNegate, &[x])
        } else {
            return false;
        };
        self.replace_call(info, v);
        self.stats.arithmetic += 1;
        true
    }
}

/// Two numeric operands, at least one seen as a double.
fn mixes_doubles(a: &OperandClasses, b: &OperandClasses) -> bool {
    a.within(NUMBERS)
        && b.within(NUMBERS)
        && (a.includes(ClassId::DOUBLE) || b.includes(ClassId::DOUBLE))
}

/// Guard for one operand of a double operation.
fn number_guard(c: &OperandClasses) -> &'static [ClassId] {
    if c.within(DOUBLE_ONLY) {
        DOUBLE_ONLY
    } else {
        NUMBERS
    }
}

/// Operands of a left shift feeding a mask.
struct ShiftChain {
    /// Tagged value being shifted.
    value: InstrId,
    /// Tagged shift count.
    count: InstrId,
    /// Instructions made dead by the fusion.
    removable: SmallVec<[InstrId; 4]>,
}

#[cfg(test)]
mod tests {
    use super::super::tests::{ops, specialize};
    use super::*;
    use crate::config::OptConfig;
    use crate::feedback::FeedbackRecord;
    use crate::hierarchy::ClassTable;
    use crate::ir::builder::FlowGraphBuilder;
    use crate::ir::graph::FlowGraph;

    const SMI: ClassId = ClassId::SMI;
    const MINT: ClassId = ClassId::MINT;
    const DOUBLE: ClassId = ClassId::DOUBLE;

    fn binary(selector: Selector, feedback: FeedbackRecord) -> (FlowGraph, InstrId) {
        let mut b = FlowGraphBuilder::new("f", 2);
        let (x, y) = (b.param(0), b.param(1));
        let v = b.call_with_feedback(selector, &[x, y], feedback);
        b.ret(v);
        (b.finish().expect("valid graph"), v)
    }

    fn seen(cids: &[&[ClassId]]) -> FeedbackRecord {
        cids.iter().fold(FeedbackRecord::new(), |r, c| r.with(c, None, 10))
    }

    #[test]
    fn test_smi_add() {
        let table = ClassTable::new();
        let (mut g, _) = binary(Selector::Binary(BinaryOp::Add), seen(&[&[SMI, SMI]]));
        specialize(&mut g, &table, &OptConfig::default());
        assert_eq!(ops(&g), ["CheckSmi", "CheckSmi", "IntBinary", "Return"]);
    }

    #[test]
    fn test_smi_overflow_history_widens_to_int64() {
        let table = ClassTable::new();
        let fb = seen(&[&[SMI, SMI]]).with_deopt_reason(DeoptReasons::BINARY_SMI_OP);
        let (mut g, _) = binary(Selector::Binary(BinaryOp::Mul), fb);
        specialize(&mut g, &table, &OptConfig::default());
        assert_eq!(
            ops(&g),
            ["CheckClass", "CheckClass", "Unbox", "Unbox", "IntBinary", "Box", "Return"]
        );
    }

    #[test]
    fn test_conservative_smi_uses_slow_path() {
        let table = ClassTable::new();
        let (mut g, _) = binary(Selector::Binary(BinaryOp::Sub), seen(&[&[SMI, SMI]]));
        specialize(&mut g, &table, &OptConfig::conservative());
        assert_eq!(ops(&g), ["CheckedSmiOp", "Return"]);
    }

    #[test]
    fn test_mixed_numbers_need_a_double() {
        let table = ClassTable::new();
        let (mut g, _) = binary(
            Selector::Binary(BinaryOp::Add),
            seen(&[&[SMI, DOUBLE], &[DOUBLE, MINT]]),
        );
        specialize(&mut g, &table, &OptConfig::default());
        assert_eq!(
            ops(&g),
            ["CheckClass", "CheckClass", "CheckEitherDouble", "DoubleBinary", "Return"]
        );
    }

    #[test]
    fn test_int_division_is_double_division() {
        let table = ClassTable::new();
        let (mut g, _) = binary(Selector::Binary(BinaryOp::Div), seen(&[&[SMI, SMI]]));
        specialize(&mut g, &table, &OptConfig::default());
        assert_eq!(ops(&g), ["CheckClass", "CheckClass", "DoubleBinary", "Return"]);
    }

    #[test]
    fn test_mod_by_power_of_two() {
        let table = ClassTable::new();
        let mut b = FlowGraphBuilder::new("f", 1);
        let x = b.param(0);
        let eight = b.int(8);
        let v = b.call_with_feedback(
            Selector::Binary(BinaryOp::Mod),
            &[x, eight],
            seen(&[&[SMI, SMI]]),
        );
        b.ret(v);
        let mut g = b.finish().expect("valid graph");
        specialize(&mut g, &table, &OptConfig::default());
        assert_eq!(ops(&g), ["CheckSmi", "IntBinary", "Return"]);
        let and = g
            .instrs_in_order()
            .into_iter()
            .find(|&i| matches!(g.op(i), Op::IntBinary { .. }))
            .expect("mask");
        assert_eq!(g.int_constant_value(g.input(and, 1)), Some(7));
    }

    #[test]
    fn test_shift_then_mask_fuses() {
        let table = ClassTable::new();
        let mut b = FlowGraphBuilder::new("f", 2);
        let (x, n) = (b.param(0), b.param(1));
        let mask = b.int(0xFF);
        let shl = b.call_with_feedback(
            Selector::Binary(BinaryOp::Shl),
            &[x, n],
            seen(&[&[SMI, SMI]]),
        );
        let and = b.call_with_feedback(
            Selector::Binary(BinaryOp::BitAnd),
            &[shl, mask],
            seen(&[&[SMI, SMI]]),
        );
        b.ret(and);
        let mut g = b.finish().expect("valid graph");
        specialize(&mut g, &table, &OptConfig::default());
        assert!(ops(&g).contains(&"ShiftMask"));
        assert!(!g
            .instrs_in_order()
            .iter()
            .any(|&i| matches!(g.op(i), Op::IntBinary { op: BinaryOp::Shl, .. })));
    }

    #[test]
    fn test_double_compare_of_proven_double() {
        let table = ClassTable::new();
        let mut b = FlowGraphBuilder::new("f", 1);
        let x = b.param(0);
        let half = b.double(0.5);
        let v = b.call_with_feedback(
            Selector::Compare(CmpOp::Lt),
            &[x, half],
            seen(&[&[SMI, DOUBLE]]),
        );
        b.ret(v);
        let mut g = b.finish().expect("valid graph");
        specialize(&mut g, &table, &OptConfig::default());
        assert_eq!(ops(&g), ["CheckClass", "DoubleCompare", "Return"]);
    }

    #[test]
    fn test_null_equality_becomes_identity() {
        let table = ClassTable::new();
        let mut b = FlowGraphBuilder::new("f", 1);
        let x = b.param(0);
        let null = b.null();
        let v = b.call_with_feedback(
            Selector::Compare(CmpOp::Ne),
            &[x, null],
            seen(&[&[SMI, ClassId::NULL]]),
        );
        b.ret(v);
        let mut g = b.finish().expect("valid graph");
        specialize(&mut g, &table, &OptConfig::default());
        assert_eq!(ops(&g), ["CheckSmi", "StrictCompare", "Return"]);
    }

    #[test]
    fn test_overridden_equality_is_not_identity() {
        let mut table = ClassTable::new();
        let point = table.define_class("Point", ClassId::OBJECT, 2);
        let eq = table.define_method(
            point,
            Selector::Compare(CmpOp::Eq),
            FunctionKind::Constant(Literal::Bool(true)),
        );
        let mut b = FlowGraphBuilder::new("f", 1);
        let x = b.param(0);
        let null = b.null();
        let fb = FeedbackRecord::new().with(&[point, ClassId::NULL], Some(eq), 3);
        let v = b.call_with_feedback(Selector::Compare(CmpOp::Eq), &[x, null], fb);
        b.ret(v);
        let mut g = b.finish().expect("valid graph");
        specialize(&mut g, &table, &OptConfig::default());
        assert!(!ops(&g).contains(&"StrictCompare"));
    }

    #[test]
    fn test_single_char_equality() {
        let table = ClassTable::new();
        let mut b = FlowGraphBuilder::new("f", 1);
        let s = b.param(0);
        let a = b.string("a");
        let v = b.call_with_feedback(
            Selector::Compare(CmpOp::Eq),
            &[s, a],
            seen(&[&[ClassId::STRING, ClassId::STRING]]),
        );
        b.ret(v);
        let mut g = b.finish().expect("valid graph");
        specialize(&mut g, &table, &OptConfig::default());
        assert_eq!(ops(&g), ["CheckClass", "StringToCharCode", "IntCompare", "Return"]);
    }

    #[test]
    fn test_negate_double() {
        let table = ClassTable::new();
        let mut b = FlowGraphBuilder::new("f", 1);
        let x = b.param(0);
        let v = b.call_with_feedback(Selector::Unary(UnaryOp::Negate), &[x], seen(&[&[DOUBLE]]));
        b.ret(v);
        let mut g = b.finish().expect("valid graph");
        specialize(&mut g, &table, &OptConfig::default());
        assert_eq!(ops(&g), ["CheckClass", "DoubleNegate", "Return"]);
    }

    #[test]
    fn test_untested_add_guesses_from_constant() {
        let table = ClassTable::new();
        let mut b = FlowGraphBuilder::new("f", 1);
        let x = b.param(0);
        let one = b.int(1);
        let v = b.call(Selector::Binary(BinaryOp::Add), &[x, one]);
        b.ret(v);
        let mut g = b.finish().expect("valid graph");
        specialize(&mut g, &table, &OptConfig::default());
        assert_eq!(ops(&g), ["CheckSmi", "IntBinary", "Return"]);
    }
}
