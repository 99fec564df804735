//! Bounds-check elimination.
//!
//! `CheckBounds(length, index)` is redundant when the index range proves
//! `0 <= index` and `index < length`. The second fact is usually symbolic:
//! the index is bounded by `n - 1` where `n` is a length load equal to the
//! checked one.

use super::{decision, RangeAnalyzer};
use crate::ir::instr::{InstrId, Op};
use crate::ir::range::{is_less_than, RangeBoundary};

impl RangeAnalyzer<'_> {
    pub(super) fn eliminate_redundant_bounds_checks(&mut self) -> usize {
        let mut eliminated = 0;
        for check in std::mem::take(&mut self.checks) {
            if !self.is_redundant_check(check) {
                continue;
            }
            decision!(
                self,
                check = %check,
                index = ?self.graph.instr(self.graph.input(check, 1)).range.map(|r| r.to_string()),
                "bounds check eliminated"
            );
            if self.config.assert_eliminated_bounds {
                self.graph.set_op(check, Op::AssertBounds);
            } else {
                for operand in self.graph.inputs(check) {
                    let operand = self.graph.unwrap_constraint(operand);
                    self.orphans.push(operand);
                }
                self.graph.remove_instr(check);
            }
            eliminated += 1;
        }
        self.stats.bounds_checks_eliminated += eliminated;
        eliminated
    }

    /// Delete operands of eliminated checks that nothing reads once the
    /// constraints are gone. A value still named by a range stays.
    pub(super) fn remove_orphaned_operands(&mut self) {
        let orphans = std::mem::take(&mut self.orphans);
        if orphans.is_empty() {
            return;
        }
        let live = self.graph.instrs_in_order();
        for operand in orphans {
            let op = self.graph.op(operand);
            if self.graph.instr(operand).is_removed()
                || self.graph.has_uses(operand)
                || !op.is_removable()
                || matches!(op, Op::Constant(_))
            {
                continue;
            }
            let named = live.iter().any(|&id| {
                self.graph
                    .instr(id)
                    .range
                    .is_some_and(|r| r.mentions(operand))
            });
            if !named {
                self.graph.remove_instr(operand);
            }
        }
    }

    fn is_redundant_check(&self, check: InstrId) -> bool {
        let (length, index) = (self.graph.input(check, 0), self.graph.input(check, 1));
        let (Some(index_range), Some(length_range)) =
            (self.range_of(index), self.range_of(length))
        else {
            return false;
        };
        if !index_range.is_non_negative(self.graph) {
            return false;
        }
        let max = index_range.max;
        is_less_than(self.graph, max, length_range.min)
            || is_less_than(
                self.graph,
                max,
                RangeBoundary::symbol(self.graph.unwrap_constraint(length)),
            )
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{analyze, array_loop, ops, smi};
    use crate::config::OptConfig;
    use crate::ir::builder::FlowGraphBuilder;
    use crate::ir::instr::Op;
    use crate::ir::range::RangeBoundary;
    use crate::ir::types::{BinaryOp, ClassId, CmpOp};

    #[test]
    fn test_loop_over_length_needs_no_check() {
        let (mut g, _, check) = array_loop();
        let pass = analyze(&mut g, &OptConfig::default());
        assert_eq!(pass.stats().bounds_checks, 1);
        assert_eq!(pass.stats().bounds_checks_eliminated, 1);
        assert!(g.instr(check).is_removed());
        assert!(!ops(&g).contains(&"CheckBounds"));
    }

    /// `for (i = a.length - 1; i >= 0; i--) a[i]`
    #[test]
    fn test_countdown_from_length_needs_no_check() {
        let mut b = FlowGraphBuilder::new("sum_back", 1);
        b.declare_param(0, ClassId::ARRAY);
        let a = b.param(0);
        let (zero, one) = (b.int(0), b.int(1));
        let n = b.emit(Op::LoadLength, &[a]);
        let start = b.emit(smi(BinaryOp::Sub), &[n, one]);
        let entry = b.current_block();
        let (header, body, exit) = (b.new_block(), b.new_block(), b.new_block());
        b.goto(header);
        b.switch_to(header);
        let i = b.phi();
        let cond = b.emit(Op::IntCompare { op: CmpOp::Ge }, &[i, zero]);
        b.branch(cond, body, exit);
        b.switch_to(body);
        let n2 = b.emit(Op::LoadLength, &[a]);
        let check = b.emit(Op::CheckBounds, &[n2, i]);
        b.emit(Op::LoadIndexed, &[a, i]);
        let next = b.emit(smi(BinaryOp::Sub), &[i, one]);
        b.goto(header);
        b.switch_to(exit);
        b.ret(i);
        b.phi_input(i, entry, start);
        b.phi_input(i, body, next);
        let mut g = b.finish().expect("valid graph");

        let pass = analyze(&mut g, &OptConfig::default());
        assert_eq!(pass.stats().induction_variables, 1);
        assert_eq!(pass.stats().bounds_checks_eliminated, 1);
        assert!(g.instr(check).is_removed());
        assert_eq!(
            g.instr(i).range.expect("range").max.canonicalize(&g),
            RangeBoundary::Symbol { def: n, offset: -1 }
        );
    }

    #[test]
    fn test_unused_length_of_eliminated_check_is_removed() {
        let (mut g, _, check) = array_loop();
        let length = g.input(check, 0);
        analyze(&mut g, &OptConfig::default());
        assert!(g.instr(length).is_removed());
        let loads = ops(&g).iter().filter(|&&m| m == "LoadLength").count();
        assert_eq!(loads, 1);
    }

    #[test]
    fn test_eliminated_check_can_stay_as_assertion() {
        let (mut g, _, check) = array_loop();
        let config = OptConfig {
            assert_eliminated_bounds: true,
            ..OptConfig::default()
        };
        analyze(&mut g, &config);
        assert!(matches!(g.op(check), Op::AssertBounds));
        assert_eq!(g.inputs(check).len(), 2);
    }

    /// `a[i + 1]` inside `for i in 0..a.length` can run past the end.
    #[test]
    fn test_off_by_one_keeps_check() {
        let mut b = FlowGraphBuilder::new("next", 1);
        b.declare_param(0, ClassId::ARRAY);
        let a = b.param(0);
        let (zero, one) = (b.int(0), b.int(1));
        let entry = b.current_block();
        let (header, body, exit) = (b.new_block(), b.new_block(), b.new_block());
        b.goto(header);
        b.switch_to(header);
        let i = b.phi();
        let n = b.emit(Op::LoadLength, &[a]);
        let cond = b.emit(Op::IntCompare { op: CmpOp::Lt }, &[i, n]);
        b.branch(cond, body, exit);
        b.switch_to(body);
        let next = b.emit(smi(BinaryOp::Add), &[i, one]);
        let n2 = b.emit(Op::LoadLength, &[a]);
        let check = b.emit(Op::CheckBounds, &[n2, next]);
        b.emit(Op::LoadIndexed, &[a, next]);
        b.goto(header);
        b.switch_to(exit);
        b.ret(i);
        b.phi_input(i, entry, zero);
        b.phi_input(i, body, next);
        let mut g = b.finish().expect("valid graph");

        let pass = analyze(&mut g, &OptConfig::default());
        assert_eq!(pass.stats().bounds_checks_eliminated, 0);
        assert!(matches!(g.op(check), Op::CheckBounds));
    }

    #[test]
    fn test_second_identical_check_is_redundant() {
        let mut b = FlowGraphBuilder::new("twice", 2);
        b.declare_param(0, ClassId::ARRAY);
        b.declare_param(1, ClassId::SMI);
        let (a, i) = (b.param(0), b.param(1));
        let n = b.emit(Op::LoadLength, &[a]);
        let first = b.emit(Op::CheckBounds, &[n, i]);
        let x = b.emit(Op::LoadIndexed, &[a, i]);
        let n2 = b.emit(Op::LoadLength, &[a]);
        let second = b.emit(Op::CheckBounds, &[n2, i]);
        let y = b.emit(Op::LoadIndexed, &[a, i]);
        let same = b.emit(Op::StrictCompare { negate: false }, &[x, y]);
        b.ret(same);
        let mut g = b.finish().expect("valid graph");

        let pass = analyze(&mut g, &OptConfig::default());
        assert_eq!(pass.stats().bounds_checks_eliminated, 1);
        assert!(matches!(g.op(first), Op::CheckBounds));
        assert!(g.instr(second).is_removed());
    }

    #[test]
    fn test_constant_index_below_constant_length() {
        let mut b = FlowGraphBuilder::new("lit", 1);
        b.declare_param(0, ClassId::ARRAY);
        let a = b.param(0);
        let (zero, neg) = (b.int(0), b.int(-1));
        let n = b.emit(Op::LoadLength, &[a]);
        let at_zero = b.emit(Op::CheckBounds, &[n, zero]);
        let at_neg = b.emit(Op::CheckBounds, &[n, neg]);
        b.ret(n);
        let mut g = b.finish().expect("valid graph");

        analyze(&mut g, &OptConfig::default());
        // A zero index is only in bounds for a non-empty array.
        assert!(matches!(g.op(at_zero), Op::CheckBounds));
        assert!(matches!(g.op(at_neg), Op::CheckBounds));
    }
}
