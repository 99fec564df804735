//! Induction variable detection.
//!
//! A loop-header phi whose every back-edge value is the phi itself plus a
//! step of known sign moves in one direction only. Its range is then
//! half-bounded by its initial value without iterating the loop to a fixed
//! point:
//!
//! ```text
//! i = phi(0, i + 1)     // increasing: [0, +inf)
//! j = phi(n, j - 2)     // decreasing: (-inf, n]
//! ```
//!
//! A start value defined before the loop stays symbolic, so
//! `i = phi(a.length - 1, i - 1)` is bounded by `a.length - 1`.
//!
//! Only Smi arithmetic qualifies: it deoptimizes instead of wrapping, so
//! the value never jumps back across the initial bound.

use super::RangeAnalyzer;
use crate::ir::instr::{BlockId, InstrId, Op};
use crate::ir::range::{Range, RangeBoundary};
use crate::ir::types::{BinaryOp, IntWidth};

use smallvec::SmallVec;

/// Direction of an induction variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InductionDirection {
    /// Never decreases.
    Increasing,
    /// Never increases.
    Decreasing,
}

/// A detected induction variable.
#[derive(Debug, Clone)]
pub struct InductionVariable {
    /// The loop-header phi.
    pub phi: InstrId,
    /// Values entering the loop. A single definition from before the loop
    /// is kept by name: `[v, v]`.
    pub init: Range,
    pub direction: InductionDirection,
    /// Back-edge values.
    pub updates: SmallVec<[InstrId; 2]>,
}

impl InductionVariable {
    /// Range implied by the initial value and the direction.
    pub fn range(&self) -> Range {
        match self.direction {
            InductionDirection::Increasing => {
                Range::new(self.init.min, RangeBoundary::PositiveInfinity)
            }
            InductionDirection::Decreasing => {
                Range::new(RangeBoundary::NegativeInfinity, self.init.max)
            }
        }
    }
}

impl RangeAnalyzer<'_> {
    /// Try to treat `phi` as an induction variable of the loop it heads.
    pub(super) fn detect_induction_variable(&mut self, phi: InstrId) -> Option<Range> {
        let header = self.graph.instr(phi).block;
        let lp = self.loops.loop_for_header(header)?;
        let preds = self.graph.block(header).preds().to_vec();

        let mut init: Option<Range> = None;
        let mut entries: SmallVec<[InstrId; 2]> = SmallVec::new();
        let mut direction = None;
        let mut updates = SmallVec::new();
        for (j, &pred) in preds.iter().enumerate() {
            let value = self.graph.input(phi, j);
            if lp.back_edges.contains(&pred) {
                let dir = self.update_direction(phi, value)?;
                if direction.is_some_and(|d| d != dir) {
                    return None;
                }
                direction = Some(dir);
                updates.push(value);
            } else if self.graph.rpo_number(pred).is_some() {
                let r = self.range_of(value)?;
                if !entries.contains(&value) {
                    entries.push(value);
                }
                init = Some(match init {
                    Some(i) => i.join(&r, self.graph),
                    None => r,
                });
            }
        }

        let mut init = init?;
        if let [start] = entries[..] {
            if self.is_symbolic_start(start, header) {
                init = Range::new(RangeBoundary::symbol(start), RangeBoundary::symbol(start));
            }
        }

        let iv = InductionVariable {
            phi,
            init,
            direction: direction?,
            updates,
        };
        let range = iv.range();
        if self.induction.insert(phi, iv).is_none() {
            self.stats.induction_variables += 1;
        }
        Some(range)
    }

    /// Whether the single value entering the loop at `header` can bound the
    /// phi by name. It must be a tracked integer defined before the loop.
    fn is_symbolic_start(&self, start: InstrId, header: BlockId) -> bool {
        !matches!(self.graph.op(start), Op::Constant(_))
            && self.is_candidate(start)
            && self
                .dom
                .strictly_dominates(self.graph.instr(start).block, header)
    }

    /// Direction of `phi` along a back edge carrying `value`.
    fn update_direction(&self, phi: InstrId, value: InstrId) -> Option<InductionDirection> {
        let value = self.graph.unwrap_constraint(value);
        let Op::IntBinary {
            op,
            width: IntWidth::Smi,
        } = *self.graph.op(value)
        else {
            return None;
        };
        let (a, b) = (self.graph.input(value, 0), self.graph.input(value, 1));
        let is_phi = |v: InstrId| self.graph.unwrap_constraint(v) == phi;
        let (step, subtract) = match op {
            BinaryOp::Add if is_phi(a) => (b, false),
            BinaryOp::Add if is_phi(b) => (a, false),
            BinaryOp::Sub if is_phi(a) => (b, true),
            _ => return None,
        };
        let step = self.range_of(step)?;
        let up = if step.is_non_negative(self.graph) {
            true
        } else if step.is_non_positive(self.graph) {
            false
        } else {
            return None;
        };
        Some(if up != subtract {
            InductionDirection::Increasing
        } else {
            InductionDirection::Decreasing
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{analyze, array_loop, smi};
    use crate::config::OptConfig;
    use crate::ir::builder::FlowGraphBuilder;
    use crate::ir::instr::Op;
    use crate::ir::range::{Range, RangeBoundary};
    use crate::ir::types::{BinaryOp, ClassId, CmpOp};

    #[test]
    fn test_counting_loop_is_increasing() {
        let (mut g, i, _) = array_loop();
        let pass = analyze(&mut g, &OptConfig::default());
        assert_eq!(pass.stats().induction_variables, 1);
        assert_eq!(
            g.instr(i).range,
            Some(Range::new(RangeBoundary::Constant(0), RangeBoundary::PositiveInfinity))
        );
    }

    /// `j = n; while j > 0: j -= 2`
    #[test]
    fn test_countdown_is_decreasing() {
        let mut b = FlowGraphBuilder::new("down", 1);
        b.declare_param(0, ClassId::SMI);
        let n = b.param(0);
        let (zero, two) = (b.int(0), b.int(2));
        let entry = b.current_block();
        let (header, body, exit) = (b.new_block(), b.new_block(), b.new_block());
        b.goto(header);
        b.switch_to(header);
        let j = b.phi();
        let cond = b.emit(Op::IntCompare { op: CmpOp::Gt }, &[j, zero]);
        b.branch(cond, body, exit);
        b.switch_to(body);
        let next = b.emit(smi(BinaryOp::Sub), &[j, two]);
        b.goto(header);
        b.switch_to(exit);
        b.ret(j);
        b.phi_input(j, entry, n);
        b.phi_input(j, body, next);
        let mut g = b.finish().expect("valid graph");

        analyze(&mut g, &OptConfig::default());
        let r = g.instr(j).range.expect("range");
        assert_eq!(r.min, RangeBoundary::NegativeInfinity);
        assert_eq!(r.max.upper_const(&g), crate::ir::types::SMI_MAX);
        // Each step leaves from a positive value.
        assert_eq!(g.instr(next).range.expect("range").min.lower_const(&g), -1);
    }

    #[test]
    fn test_mixed_sign_step_is_not_induction() {
        let mut b = FlowGraphBuilder::new("walk", 1);
        b.declare_param(0, ClassId::SMI);
        let s = b.param(0);
        let zero = b.int(0);
        let entry = b.current_block();
        let (header, body, exit) = (b.new_block(), b.new_block(), b.new_block());
        b.goto(header);
        b.switch_to(header);
        let i = b.phi();
        let cond = b.emit(Op::IntCompare { op: CmpOp::Ne }, &[i, zero]);
        b.branch(cond, body, exit);
        b.switch_to(body);
        let next = b.emit(smi(BinaryOp::Add), &[i, s]);
        b.goto(header);
        b.switch_to(exit);
        b.ret(i);
        b.phi_input(i, entry, zero);
        b.phi_input(i, body, next);
        let mut g = b.finish().expect("valid graph");

        let pass = analyze(&mut g, &OptConfig::default());
        assert_eq!(pass.stats().induction_variables, 0);
        let (lo, hi) = g.instr(i).range.expect("range").constant_bounds(&g);
        assert!(lo < 0 && hi > 0);
    }
}
