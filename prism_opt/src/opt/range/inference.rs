//! Range transfer functions and the fixed-point driver.

use super::RangeAnalyzer;
use crate::ir::graph::FlowGraph;
use crate::ir::instr::{InstrId, Op};
use crate::ir::range::{Range, RangeBoundary};
use crate::ir::types::{BinaryOp, ClassId, IntWidth, Repr, UnaryOp, MAX_LENGTH, UINT32_MAX};

use rustc_hash::FxHashMap;

/// Phi updates tolerated before a changing bound is widened to infinity.
const WIDENING_THRESHOLD: u32 = 2;

/// Largest Unicode scalar value.
const MAX_CHAR_CODE: i64 = 0x10FFFF;

impl RangeAnalyzer<'_> {
    /// Iterate the transfer functions over all tracked values in block order
    /// until nothing changes.
    pub(super) fn infer_ranges(&mut self) {
        let order: Vec<InstrId> = self
            .graph
            .instrs_in_order()
            .into_iter()
            .filter(|&id| self.is_candidate(id))
            .collect();
        let mut phi_updates: FxHashMap<InstrId, u32> = FxHashMap::default();
        let mut converged = false;

        for _ in 0..self.config.max_range_iterations {
            self.stats.iterations += 1;
            let mut changed = false;
            for &id in &order {
                let Some(range) = self.infer(id) else {
                    continue;
                };
                let mut range = self.sanitize(id, range);
                let old = self.graph.instr(id).range;
                if old == Some(range) {
                    continue;
                }
                let is_phi = matches!(self.graph.op(id), Op::Phi);
                if let (Some(old), true) = (old, is_phi) {
                    let updates = phi_updates.entry(id).or_insert(0);
                    *updates += 1;
                    if *updates > WIDENING_THRESHOLD {
                        range = self.widen(old, range);
                        if old == range {
                            continue;
                        }
                    }
                }
                self.graph.instr_mut(id).range = Some(range);
                changed = true;
            }
            if !changed {
                converged = true;
                break;
            }
        }

        for &id in &order {
            if !converged || self.graph.instr(id).range.is_none() {
                let fallback = self.fallback_range(id);
                self.graph.instr_mut(id).range = Some(fallback);
            }
        }
    }

    /// Move every bound that changed to its infinity.
    fn widen(&mut self, old: Range, new: Range) -> Range {
        let mut widened = new;
        if new.min != old.min {
            widened.min = RangeBoundary::NegativeInfinity;
        }
        if new.max != old.max {
            widened.max = RangeBoundary::PositiveInfinity;
        }
        if widened != new {
            self.stats.widened += 1;
        }
        widened
    }

    /// Range of `id` from the current ranges of its inputs. `None` while an
    /// input it depends on is unresolved.
    fn infer(&mut self, id: InstrId) -> Option<Range> {
        if matches!(self.graph.op(id), Op::Phi) {
            return self.infer_phi(id);
        }
        let graph = &*self.graph;
        let range = match graph.op(id) {
            Op::Constant(lit) => Range::constant(lit.as_int()?),
            Op::Parameter(i) => match graph.param_type(*i as usize) {
                Some(ClassId::SMI) => Range::of_width(IntWidth::Smi),
                _ => Range::full(),
            },
            Op::Constraint { min, max, .. } => {
                let (min, max) = (*min, *max);
                self.range_of(graph.input(id, 0))?
                    .intersect(&Range::new(min, max), graph)
            }
            Op::ShiftMask { mask } if *mask >= 0 => Range::of(0, *mask),
            Op::ShiftMask { .. } => Range::full(),
            Op::LoadLength => Range::of(0, MAX_LENGTH),
            Op::LoadClassId => Range::of(0, UINT32_MAX),
            Op::StringToCharCode => Range::of(-1, MAX_CHAR_CODE),
            Op::Box { .. }
            | Op::Unbox {
                to: Repr::Int64 | Repr::Tagged,
            }
            | Op::IntConverter {
                to: Repr::Int64 | Repr::Tagged,
                ..
            } => self.range_of(graph.input(id, 0))?,
            Op::Unbox { to: Repr::Uint32 } | Op::IntConverter { to: Repr::Uint32, .. } => {
                let input = self.range_of(graph.input(id, 0))?;
                if input.is_within(0, UINT32_MAX, graph) {
                    input
                } else {
                    Range::of_width(IntWidth::Uint32)
                }
            }
            Op::IntBinary { op, width } => {
                let (op, width) = (*op, *width);
                let a = self.range_of(graph.input(id, 0))?;
                let b = self.range_of(graph.input(id, 1))?;
                self.binary_range(id, op, width, a, b)
            }
            Op::IntUnary { op, width } => {
                let (op, width) = (*op, *width);
                let a = self.range_of(graph.input(id, 0))?;
                let exact = unary_range(op, &a, graph);
                fit_to_width(exact, width, graph)
            }
            _ => return None,
        };
        Some(range)
    }

    fn binary_range(
        &self,
        id: InstrId,
        op: BinaryOp,
        width: IntWidth,
        a: Range,
        b: Range,
    ) -> Range {
        let graph = &*self.graph;
        // Smi arithmetic with a constant keeps symbolic bounds: it cannot
        // wrap.
        if width == IntWidth::Smi && matches!(op, BinaryOp::Add | BinaryOp::Sub) {
            let (left, right) = (graph.input(id, 0), graph.input(id, 1));
            let delta = match (graph.int_constant_value(left), graph.int_constant_value(right)) {
                (_, Some(c)) if op == BinaryOp::Add => Some((a, c)),
                (_, Some(c)) => c.checked_neg().map(|c| (a, c)),
                (Some(c), None) if op == BinaryOp::Add => Some((b, c)),
                _ => None,
            };
            if let Some((base, c)) = delta {
                let overflow = if c > 0 {
                    RangeBoundary::PositiveInfinity
                } else {
                    RangeBoundary::NegativeInfinity
                };
                let shifted = Range::new(
                    base.min.shifted(c, overflow),
                    base.max.shifted(c, overflow),
                );
                return shifted.clamp_to(IntWidth::Smi, graph);
            }
        }
        fit_to_width(exact_binary_range(op, &a, &b, graph), width, graph)
    }

    fn infer_phi(&mut self, phi: InstrId) -> Option<Range> {
        let block = self.graph.instr(phi).block;
        let is_header = self.loops.loop_for_header(block).is_some();
        if is_header {
            if let Some(range) = self.detect_induction_variable(phi) {
                return Some(range);
            }
        }
        let graph = &*self.graph;
        let preds = graph.block(block).preds();
        let mut result: Option<Range> = None;
        for (j, &pred) in preds.iter().enumerate() {
            if graph.rpo_number(pred).is_none() {
                continue;
            }
            let input = graph.input(phi, j);
            if input == phi {
                continue;
            }
            let Some(r) = self.range_of(input) else {
                if is_header {
                    continue;
                }
                return None;
            };
            result = Some(match result {
                Some(acc) => acc.join(&r, graph),
                None => r,
            });
        }
        result
    }
}

/// Apply the wrap-around behavior of `width` to the exact result range.
fn fit_to_width(exact: Option<Range>, width: IntWidth, graph: &FlowGraph) -> Range {
    match width {
        IntWidth::Smi => exact
            .unwrap_or_else(|| Range::of_width(IntWidth::Smi))
            .clamp_to(IntWidth::Smi, graph),
        IntWidth::Int64 => exact.unwrap_or_else(Range::full),
        IntWidth::Uint32 => exact
            .filter(|r| r.is_within(0, UINT32_MAX, graph))
            .unwrap_or_else(|| Range::of_width(IntWidth::Uint32)),
    }
}

/// Finite constant bounds of a range.
fn finite_bounds(r: &Range, graph: &FlowGraph) -> Option<(i64, i64)> {
    match (r.min.lower_bound(graph), r.max.upper_bound(graph)) {
        (RangeBoundary::Constant(lo), RangeBoundary::Constant(hi)) => Some((lo, hi)),
        _ => None,
    }
}

/// Smallest range holding every `f(x, y)`, given `f` is monotone in each
/// argument so the extremes lie at the corners. `None` if any corner
/// overflows.
fn corners(a: (i64, i64), b: (i64, i64), f: impl Fn(i64, i64) -> Option<i64>) -> Option<Range> {
    let values = [f(a.0, b.0)?, f(a.0, b.1)?, f(a.1, b.0)?, f(a.1, b.1)?];
    let lo = values.iter().copied().min()?;
    let hi = values.iter().copied().max()?;
    Some(Range::of(lo, hi))
}

/// Range of the exact mathematical result, `None` if it is not bounded
/// within `i64`.
fn exact_binary_range(op: BinaryOp, a: &Range, b: &Range, graph: &FlowGraph) -> Option<Range> {
    match op {
        BinaryOp::Add => {
            let ((alo, ahi), (blo, bhi)) = (finite_bounds(a, graph)?, finite_bounds(b, graph)?);
            Some(Range::of(alo.checked_add(blo)?, ahi.checked_add(bhi)?))
        }
        BinaryOp::Sub => {
            let ((alo, ahi), (blo, bhi)) = (finite_bounds(a, graph)?, finite_bounds(b, graph)?);
            Some(Range::of(alo.checked_sub(bhi)?, ahi.checked_sub(blo)?))
        }
        BinaryOp::Mul => corners(
            finite_bounds(a, graph)?,
            finite_bounds(b, graph)?,
            i64::checked_mul,
        ),
        BinaryOp::Shl => {
            let a = finite_bounds(a, graph)?;
            let (blo, bhi) = b.constant_bounds(graph);
            if !(0..=62).contains(&bhi) {
                return None;
            }
            corners(a, (blo.max(0), bhi), |x, s| x.checked_mul(1i64 << s))
        }
        BinaryOp::Shr => {
            let (blo, bhi) = b.constant_bounds(graph);
            if bhi < 0 {
                return None;
            }
            corners(a.constant_bounds(graph), (blo.clamp(0, 63), bhi.min(63)), |x, s| Some(x >> s))
        }
        BinaryOp::BitAnd => {
            let (a_max, b_max) = (a.max.upper_const(graph), b.max.upper_const(graph));
            match (a.is_non_negative(graph), b.is_non_negative(graph)) {
                (true, true) => Some(Range::of(0, a_max.min(b_max))),
                (true, false) => Some(Range::of(0, a_max)),
                (false, true) => Some(Range::of(0, b_max)),
                (false, false) => None,
            }
        }
        BinaryOp::BitOr | BinaryOp::BitXor => {
            if !(a.is_non_negative(graph) && b.is_non_negative(graph)) {
                return None;
            }
            let m = a.max.upper_const(graph).max(b.max.upper_const(graph));
            Some(Range::of(0, all_ones_up_to(m)))
        }
        BinaryOp::Mod => match finite_bounds(b, graph) {
            Some((blo, bhi)) => {
                let m = blo.unsigned_abs().max(bhi.unsigned_abs());
                if m == 0 {
                    return None;
                }
                Some(Range::of(0, i64::try_from(m - 1).unwrap_or(i64::MAX)))
            }
            None => Some(Range::new(RangeBoundary::Constant(0), RangeBoundary::PositiveInfinity)),
        },
        BinaryOp::TruncDiv => {
            let (alo, ahi) = finite_bounds(a, graph)?;
            let m = alo.checked_abs()?.max(ahi.checked_abs()?);
            Some(Range::of(-m, m))
        }
        BinaryOp::Div => None,
    }
}

fn unary_range(op: UnaryOp, a: &Range, graph: &FlowGraph) -> Option<Range> {
    match op {
        UnaryOp::Negate => {
            let (lo, hi) = finite_bounds(a, graph)?;
            Some(Range::of(hi.checked_neg()?, lo.checked_neg()?))
        }
        UnaryOp::BitNot => {
            let (lo, hi) = a.constant_bounds(graph);
            Some(Range::of(!hi, !lo))
        }
    }
}

/// `2^k - 1` for the smallest `k` with `v < 2^k`. `v` must be non-negative.
fn all_ones_up_to(v: i64) -> i64 {
    if v <= 0 {
        0
    } else {
        (u64::MAX >> v.leading_zeros()) as i64
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{analyze, smi};
    use super::*;
    use crate::config::OptConfig;
    use crate::ir::builder::FlowGraphBuilder;
    use crate::ir::types::{CmpOp, SMI_MAX};

    fn int64(op: BinaryOp) -> Op {
        Op::IntBinary {
            op,
            width: IntWidth::Int64,
        }
    }

    #[test]
    fn test_all_ones() {
        assert_eq!(all_ones_up_to(0), 0);
        assert_eq!(all_ones_up_to(1), 1);
        assert_eq!(all_ones_up_to(255), 255);
        assert_eq!(all_ones_up_to(256), 511);
        assert_eq!(all_ones_up_to(i64::MAX), i64::MAX);
    }

    #[test]
    fn test_leaf_ranges() {
        let mut b = FlowGraphBuilder::new("f", 2);
        b.declare_param(0, ClassId::STRING);
        b.declare_param(1, ClassId::SMI);
        let (s, x) = (b.param(0), b.param(1));
        let len = b.emit(Op::LoadLength, &[s]);
        let code = b.emit(Op::StringToCharCode, &[s]);
        let mask = b.emit(Op::ShiftMask { mask: 0xFF }, &[x, len]);
        let sum = b.emit(smi(BinaryOp::Add), &[len, code]);
        let total = b.emit(smi(BinaryOp::Add), &[sum, mask]);
        b.ret(total);
        let mut g = b.finish().expect("valid graph");
        analyze(&mut g, &OptConfig::default());
        assert_eq!(g.instr(x).range, Some(Range::of_width(IntWidth::Smi)));
        assert_eq!(g.instr(len).range, Some(Range::of(0, MAX_LENGTH)));
        assert_eq!(g.instr(mask).range, Some(Range::of(0, 0xFF)));
        assert_eq!(g.instr(sum).range, Some(Range::of(-1, MAX_LENGTH + MAX_CHAR_CODE)));
        assert_eq!(
            g.instr(total).range,
            Some(Range::of(-1, MAX_LENGTH + MAX_CHAR_CODE + 0xFF))
        );
    }

    #[test]
    fn test_bitwise_and_shift_ranges() {
        let mut b = FlowGraphBuilder::new("f", 1);
        b.declare_param(0, ClassId::INT);
        let x = b.param(0);
        let (mask, four, sixty_four) = (b.int(0xF0), b.int(4), b.int(64));
        let ux = b.emit(Op::Unbox { to: Repr::Int64 }, &[x]);
        let um = b.emit(Op::Unbox { to: Repr::Int64 }, &[mask]);
        let u4 = b.emit(Op::Unbox { to: Repr::Int64 }, &[four]);
        let u64_ = b.emit(Op::Unbox { to: Repr::Int64 }, &[sixty_four]);
        let and = b.emit(int64(BinaryOp::BitAnd), &[ux, um]);
        let shr = b.emit(int64(BinaryOp::Shr), &[and, u4]);
        let or = b.emit(int64(BinaryOp::BitOr), &[shr, and]);
        let shl = b.emit(int64(BinaryOp::Shl), &[ux, u64_]);
        let m = b.emit(int64(BinaryOp::Mod), &[ux, u4]);
        let sum = b.emit(int64(BinaryOp::Add), &[or, m]);
        let boxed = b.emit(Op::Box { from: Repr::Int64 }, &[sum]);
        let all = b.emit(int64(BinaryOp::Add), &[shl, sum]);
        let boxed_all = b.emit(Op::Box { from: Repr::Int64 }, &[all]);
        let pair = b.emit(Op::StrictCompare { negate: false }, &[boxed, boxed_all]);
        b.ret(pair);
        let mut g = b.finish().expect("valid graph");
        analyze(&mut g, &OptConfig::default());
        assert_eq!(g.instr(and).range, Some(Range::of(0, 0xF0)));
        assert_eq!(g.instr(shr).range, Some(Range::of(0, 0xF)));
        assert_eq!(g.instr(or).range, Some(Range::of(0, 0xFF)));
        assert_eq!(g.instr(m).range, Some(Range::of(0, 3)));
        assert_eq!(g.instr(boxed).range, Some(Range::of(0, 0xFF + 3)));
        assert_eq!(g.instr(shl).range, Some(Range::full()));
        assert_eq!(g.instr(all).range, Some(Range::full()));
    }

    #[test]
    fn test_smi_overflow_is_clamped() {
        let mut b = FlowGraphBuilder::new("f", 1);
        b.declare_param(0, ClassId::SMI);
        let x = b.param(0);
        let sq = b.emit(smi(BinaryOp::Mul), &[x, x]);
        let neg = b.emit(
            Op::IntUnary {
                op: UnaryOp::Negate,
                width: IntWidth::Smi,
            },
            &[sq],
        );
        b.ret(neg);
        let mut g = b.finish().expect("valid graph");
        analyze(&mut g, &OptConfig::default());
        assert_eq!(g.instr(sq).range, Some(Range::of_width(IntWidth::Smi)));
        assert_eq!(g.instr(neg).range, Some(Range::of(-SMI_MAX, SMI_MAX)));
    }

    /// `x = 0; while x != n: x = x + 3` never settles without widening.
    #[test]
    fn test_unbounded_growth_is_widened() {
        let mut b = FlowGraphBuilder::new("f", 1);
        b.declare_param(0, ClassId::SMI);
        let n = b.param(0);
        let (zero, three) = (b.int(0), b.int(3));
        let entry = b.current_block();
        let (header, body, exit) = (b.new_block(), b.new_block(), b.new_block());
        b.goto(header);
        b.switch_to(header);
        let x = b.phi();
        let cond = b.emit(Op::IntCompare { op: CmpOp::Ne }, &[x, n]);
        b.branch(cond, body, exit);
        b.switch_to(body);
        // Int64 steps are not induction variables.
        let ux = b.emit(Op::Unbox { to: Repr::Int64 }, &[x]);
        let u3 = b.emit(Op::Unbox { to: Repr::Int64 }, &[three]);
        let wide = b.emit(int64(BinaryOp::Add), &[ux, u3]);
        let next = b.emit(Op::Box { from: Repr::Int64 }, &[wide]);
        b.goto(header);
        b.switch_to(exit);
        b.ret(x);
        b.phi_input(x, entry, zero);
        b.phi_input(x, body, next);
        let mut g = b.finish().expect("valid graph");

        let pass = analyze(&mut g, &OptConfig::default());
        assert!(pass.stats().widened > 0);
        assert!(pass.stats().iterations < OptConfig::default().max_range_iterations);
        // Int64 addition from an unbounded value may wrap.
        assert_eq!(g.instr(x).range, Some(Range::full()));
    }

    #[test]
    fn test_iteration_limit_falls_back() {
        let (mut g, i, _) = super::super::tests::array_loop();
        let config = OptConfig {
            max_range_iterations: 1,
            ..OptConfig::default()
        };
        let pass = analyze(&mut g, &config);
        assert_eq!(pass.stats().bounds_checks_eliminated, 0);
        assert_eq!(g.instr(i).range, Some(Range::full()));
    }
}
