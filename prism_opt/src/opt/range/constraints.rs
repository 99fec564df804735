//! Live-range splitting with constraint instructions.
//!
//! A constraint `c = Constraint(v, [min, max])` placed where a fact about
//! `v` is known takes over every use of `v` dominated by that place. Range
//! inference then sees the refined value without any path sensitivity of
//! its own.

use super::{decision, RangeAnalyzer};
use crate::ir::instr::{BlockId, InstrId, Op, UseSlot};
use crate::ir::range::RangeBoundary;
use crate::ir::types::CmpOp;

impl RangeAnalyzer<'_> {
    pub(super) fn insert_constraints(&mut self) {
        for block in self.graph.rpo().to_vec() {
            let Some(term) = self.graph.terminator(block) else {
                continue;
            };
            let Op::Branch { if_true, if_false } = *self.graph.op(term) else {
                continue;
            };
            if if_true == if_false {
                continue;
            }
            let cond = self.graph.input(term, 0);
            let Op::IntCompare { op } = *self.graph.op(cond) else {
                continue;
            };
            let (left, right) = (self.graph.input(cond, 0), self.graph.input(cond, 1));
            for (succ, cmp) in [(if_true, op), (if_false, op.negate())] {
                if self.graph.block(succ).preds() != [block] {
                    continue;
                }
                self.constrain_on_edge(left, cmp, right, succ);
                self.constrain_on_edge(right, cmp.swap(), left, succ);
            }
        }

        for check in self.checks.clone() {
            let (length, index) = (self.graph.input(check, 0), self.graph.input(check, 1));
            // 0 <= index <= length - 1
            if self.is_constrainable(index) {
                let max = self.bound_for(length).shifted(-1, RangeBoundary::NegativeInfinity);
                self.insert_constraint_after(check, index, RangeBoundary::Constant(0), max);
            }
            // length >= index + 1
            if self.is_constrainable(length) {
                let min = self.bound_for(index).shifted(1, RangeBoundary::PositiveInfinity);
                self.insert_constraint_after(check, length, min, RangeBoundary::PositiveInfinity);
            }
        }
    }

    fn is_constrainable(&self, v: InstrId) -> bool {
        self.is_candidate(v) && self.graph.int_constant_value(v).is_none()
    }

    /// Boundary standing for the value of `v`.
    fn bound_for(&self, v: InstrId) -> RangeBoundary {
        match self.graph.int_constant_value(v) {
            Some(c) => RangeBoundary::Constant(c),
            None => RangeBoundary::symbol(self.graph.unwrap_constraint(v)),
        }
    }

    /// Refine `value` in `succ` given that `value cmp other` holds there.
    fn constrain_on_edge(&mut self, value: InstrId, cmp: CmpOp, other: InstrId, succ: BlockId) {
        if !self.is_constrainable(value) {
            return;
        }
        let bound = self.bound_for(other);
        let (min, max) = match cmp {
            CmpOp::Lt => (
                RangeBoundary::NegativeInfinity,
                bound.shifted(-1, RangeBoundary::NegativeInfinity),
            ),
            CmpOp::Le => (RangeBoundary::NegativeInfinity, bound),
            CmpOp::Gt => (
                bound.shifted(1, RangeBoundary::PositiveInfinity),
                RangeBoundary::PositiveInfinity,
            ),
            CmpOp::Ge => (bound, RangeBoundary::PositiveInfinity),
            CmpOp::Eq => (bound, bound),
            CmpOp::Ne => return,
        };
        let c = self.graph.insert_at_start(
            succ,
            Op::Constraint {
                min,
                max,
                target: Some(succ),
            },
            &[value],
        );
        self.redirect_dominated_uses(value, c);
    }

    fn insert_constraint_after(
        &mut self,
        anchor: InstrId,
        value: InstrId,
        min: RangeBoundary,
        max: RangeBoundary,
    ) {
        let c = self.graph.insert_after(
            anchor,
            Op::Constraint {
                min,
                max,
                target: None,
            },
            &[value],
        );
        self.redirect_dominated_uses(value, c);
    }

    /// Resolve every branch whose edge constraint can never hold so the
    /// edge is never taken. Returns the number of such edges.
    pub(super) fn mark_unreachable_blocks(&mut self) -> usize {
        let mut found = 0;
        for c in self.constraints.clone() {
            let Op::Constraint {
                target: Some(succ), ..
            } = *self.graph.op(c)
            else {
                continue;
            };
            let satisfiable = self
                .graph
                .instr(c)
                .range
                .map_or(true, |r| !r.is_unsatisfiable(self.graph));
            if satisfiable {
                continue;
            }
            let &[pred] = self.graph.block(succ).preds() else {
                continue;
            };
            let Some(term) = self.graph.terminator(pred) else {
                continue;
            };
            let Op::Branch { if_false, .. } = *self.graph.op(term) else {
                continue;
            };
            let cond = self.graph.input(term, 0);
            if self.graph.literal(cond).is_some() {
                continue;
            }
            decision!(self, edge = %succ, constraint = %self.graph.op(c), "edge never taken");
            let taken = self.graph.bool_constant(succ == if_false);
            self.graph.replace_input(term, 0, taken);
            found += 1;
        }
        self.stats.unreachable_edges += found;
        found
    }

    /// Point the uses of `value` that `c` dominates at `c`. A constraint
    /// with nothing to refine is dropped again.
    fn redirect_dominated_uses(&mut self, value: InstrId, c: InstrId) {
        let dom = &self.dom;
        let home = self.graph.instr(c).block;
        let redirected = self.graph.replace_uses_where(value, c, |g, u| {
            if u.user == c {
                return false;
            }
            match (g.op(u.user), u.slot) {
                (Op::Phi, UseSlot::Input(j)) => {
                    let pred = g.block(g.instr(u.user).block).preds()[j as usize];
                    dom.dominates(home, pred)
                }
                _ => dom.instr_dominates(g, c, u.user),
            }
        });
        if redirected == 0 {
            self.graph.remove_instr(c);
            return;
        }
        self.candidates.insert(c.as_usize());
        self.constraints.push(c);
        self.stats.constraints_inserted += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{analyze, smi};
    use crate::config::OptConfig;
    use crate::ir::builder::FlowGraphBuilder;
    use crate::ir::instr::Op;
    use crate::ir::range::Range;
    use crate::ir::types::{BinaryOp, ClassId, CmpOp, IntWidth, Literal, UnaryOp, SMI_MAX, SMI_MIN};

    /// `if x < 10 { x + 1 } else { x - 10 }` with `x` a declared Smi.
    #[test]
    fn test_branch_refines_both_arms() {
        let mut b = FlowGraphBuilder::new("f", 1);
        b.declare_param(0, ClassId::SMI);
        let x = b.param(0);
        let ten = b.int(10);
        let one = b.int(1);
        let (yes, no) = (b.new_block(), b.new_block());
        let cond = b.emit(Op::IntCompare { op: CmpOp::Lt }, &[x, ten]);
        b.branch(cond, yes, no);
        b.switch_to(yes);
        let inc = b.emit(smi(BinaryOp::Add), &[x, one]);
        b.ret(inc);
        b.switch_to(no);
        let dec = b.emit(smi(BinaryOp::Sub), &[x, ten]);
        b.ret(dec);
        let mut g = b.finish().expect("valid graph");

        analyze(&mut g, &OptConfig::default());
        assert_eq!(g.instr(inc).range, Some(Range::of(SMI_MIN + 1, 10)));
        let (lo, _) = g.instr(dec).range.expect("range").constant_bounds(&g);
        assert_eq!(lo, 0);
        assert_eq!(g.input(inc, 0), x);
    }

    #[test]
    fn test_equality_pins_value() {
        let mut b = FlowGraphBuilder::new("f", 1);
        b.declare_param(0, ClassId::INT);
        let x = b.param(0);
        let seven = b.int(7);
        let (yes, no) = (b.new_block(), b.new_block());
        let cond = b.emit(Op::IntCompare { op: CmpOp::Eq }, &[seven, x]);
        b.branch(cond, yes, no);
        b.switch_to(yes);
        let sq = b.emit(
            Op::IntBinary {
                op: BinaryOp::Mul,
                width: IntWidth::Int64,
            },
            &[x, x],
        );
        b.ret(sq);
        b.switch_to(no);
        b.ret(x);
        let mut g = b.finish().expect("valid graph");
        analyze(&mut g, &OptConfig::default());
        assert_eq!(g.instr(sq).range, Some(Range::constant(49)));
    }

    /// `if x < 0 { if x > 5 { return x } }`: the inner true edge is dead.
    #[test]
    fn test_contradicting_edge_is_never_taken() {
        let mut b = FlowGraphBuilder::new("f", 1);
        b.declare_param(0, ClassId::SMI);
        let x = b.param(0);
        let (zero, five) = (b.int(0), b.int(5));
        let (neg, dead, live, done) = (b.new_block(), b.new_block(), b.new_block(), b.new_block());
        let lt = b.emit(Op::IntCompare { op: CmpOp::Lt }, &[x, zero]);
        b.branch(lt, neg, done);
        b.switch_to(neg);
        let gt = b.emit(Op::IntCompare { op: CmpOp::Gt }, &[x, five]);
        b.branch(gt, dead, live);
        b.switch_to(dead);
        b.ret(x);
        b.switch_to(live);
        b.ret(five);
        b.switch_to(done);
        b.ret(zero);
        let mut g = b.finish().expect("valid graph");

        let pass = analyze(&mut g, &OptConfig::default());
        assert!(pass.found_unreachable());
        assert_eq!(pass.stats().unreachable_edges, 1);
        let term = g.terminator(neg).expect("branch");
        assert_eq!(g.literal(g.input(term, 0)), Some(&Literal::Bool(false)));
        // The outer branch is left alone.
        let outer = g.terminator(g.entry()).expect("branch");
        assert_eq!(g.input(outer, 0), lt);
    }

    #[test]
    fn test_merge_edges_are_not_refined() {
        // The true edge enters a merge and the false arm never reads `x`.
        let mut b = FlowGraphBuilder::new("f", 1);
        b.declare_param(0, ClassId::SMI);
        let x = b.param(0);
        let zero = b.int(0);
        let join = b.new_block();
        let cond = b.emit(Op::IntCompare { op: CmpOp::Gt }, &[x, zero]);
        let other = b.new_block();
        b.branch(cond, join, other);
        b.switch_to(other);
        b.goto(join);
        b.switch_to(join);
        let neg = b.emit(
            Op::IntUnary {
                op: UnaryOp::Negate,
                width: IntWidth::Smi,
            },
            &[x],
        );
        b.ret(neg);
        let mut g = b.finish().expect("valid graph");
        let pass = analyze(&mut g, &OptConfig::default());
        assert_eq!(pass.stats().constraints_inserted, 0);
        assert_eq!(g.instr(neg).range, Some(Range::of(-SMI_MAX, SMI_MAX)));
    }
}
