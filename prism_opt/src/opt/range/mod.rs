//! Integer range analysis and bounds-check elimination.
//!
//! Computes a [`Range`] for every integer definition and uses it to delete
//! bounds checks that can never fail.
//!
//! # Algorithm
//!
//! 1. **Collect**: find integer definitions and bounds checks.
//! 2. **Constrain**: split live ranges at branch edges and after bounds
//!    checks with [`Op::Constraint`] instructions carrying the refinement
//!    (`i < n` on the true edge gives `i <= n - 1`).
//! 3. **Infer**: iterate transfer functions to a fixed point. Loop-header
//!    phis that step monotonically are recognized as induction variables;
//!    other phis are widened once they keep changing.
//! 4. **Prune**: an edge whose constraint is unsatisfiable is never taken;
//!    its branch condition is replaced with a constant.
//! 5. **Eliminate**: a check with `0 <= index` and `index < length` proven
//!    is removed.
//! 6. **Clean up**: constraints are removed again, then the operands of
//!    removed checks if nothing reads them. The inferred ranges stay on the
//!    instructions for later passes.
//!
//! # Example
//!
//! ```text
//! // Before:
//! for i in 0..a.length:
//!     check_bounds(a.length, i)
//!     sum += a[i]
//!
//! // Constraint on the loop body edge:
//! i' = constraint(i, [0, a.length - 1])
//!
//! // After: check_bounds removed.
//! ```

mod bce;
mod constraints;
mod induction;
mod inference;
pub mod narrowing;

pub use induction::{InductionDirection, InductionVariable};
pub use narrowing::{IntegerNarrowingSelector, NarrowingStats};

use super::{decision, CompileContext, OptimizationPass};
use crate::config::OptConfig;
use crate::error::OptResult;
use crate::ir::arena::BitSet;
use crate::ir::cfg::{DominatorTree, LoopAnalysis};
use crate::ir::graph::FlowGraph;
use crate::ir::instr::{InstrId, Op};
use crate::ir::range::{Range, RangeBoundary};
use crate::ir::types::{ClassId, IntWidth, Repr};

use rustc_hash::FxHashMap;

// =============================================================================
// Statistics
// =============================================================================

/// Statistics from the last run.
#[derive(Debug, Clone, Default)]
pub struct RangeStats {
    /// Integer definitions analyzed.
    pub values: usize,
    /// Constraints inserted on edges and after checks.
    pub constraints_inserted: usize,
    /// Loop-header phis recognized as induction variables.
    pub induction_variables: usize,
    /// Inference sweeps.
    pub iterations: usize,
    /// Phi bounds widened to infinity.
    pub widened: usize,
    /// Bounds checks seen.
    pub bounds_checks: usize,
    /// Bounds checks proven redundant.
    pub bounds_checks_eliminated: usize,
    /// Branch edges proven never taken.
    pub unreachable_edges: usize,
}

// =============================================================================
// Pass
// =============================================================================

/// The range analysis pass.
#[derive(Debug, Default)]
pub struct RangeAnalysis {
    stats: RangeStats,
    found_unreachable: bool,
}

impl RangeAnalysis {
    pub fn new() -> Self {
        Self::default()
    }

    /// Statistics from the last run.
    pub fn stats(&self) -> &RangeStats {
        &self.stats
    }

    /// Whether the last run proved a branch edge dead. Constant propagation
    /// should run again to delete the code behind it.
    pub fn found_unreachable(&self) -> bool {
        self.found_unreachable
    }
}

impl OptimizationPass for RangeAnalysis {
    fn name(&self) -> &'static str {
        "RangeAnalysis"
    }

    fn run(&mut self, graph: &mut FlowGraph, cx: &mut CompileContext<'_>) -> OptResult<bool> {
        graph.compute_rpo();
        for id in graph.instrs_in_order() {
            graph.instr_mut(id).range = None;
        }

        let mut analyzer = RangeAnalyzer::new(graph, cx.config);
        analyzer.collect_values();
        analyzer.insert_constraints();
        analyzer.infer_ranges();
        let unreachable = analyzer.mark_unreachable_blocks();
        let eliminated = analyzer.eliminate_redundant_bounds_checks();
        analyzer.remove_constraints();
        analyzer.remove_orphaned_operands();

        self.stats = analyzer.stats;
        self.found_unreachable = unreachable > 0;
        decision!(
            cx,
            values = self.stats.values,
            induction = self.stats.induction_variables,
            eliminated = self.stats.bounds_checks_eliminated,
            unreachable_edges = self.stats.unreachable_edges,
            "range analysis done"
        );
        Ok(unreachable > 0 || eliminated > 0)
    }
}

// =============================================================================
// Analyzer
// =============================================================================

/// State of one range analysis run.
struct RangeAnalyzer<'a> {
    graph: &'a mut FlowGraph,
    config: &'a OptConfig,
    stats: RangeStats,
    dom: DominatorTree,
    loops: LoopAnalysis,
    /// Integer definitions whose range is tracked.
    candidates: BitSet,
    checks: Vec<InstrId>,
    constraints: Vec<InstrId>,
    /// Operands of removed checks.
    orphans: Vec<InstrId>,
    induction: FxHashMap<InstrId, InductionVariable>,
}

impl<'a> RangeAnalyzer<'a> {
    fn new(graph: &'a mut FlowGraph, config: &'a OptConfig) -> Self {
        let dom = DominatorTree::compute(graph);
        let loops = LoopAnalysis::compute(graph, &dom);
        let candidates = BitSet::with_capacity(graph.instr_capacity());
        Self {
            graph,
            config,
            stats: RangeStats::default(),
            dom,
            loops,
            candidates,
            checks: Vec::new(),
            constraints: Vec::new(),
            orphans: Vec::new(),
            induction: FxHashMap::default(),
        }
    }

    #[inline]
    fn is_candidate(&self, id: InstrId) -> bool {
        self.candidates.contains(id.as_usize())
    }

    /// Find integer definitions and bounds checks. Phis are integers when
    /// all their inputs are.
    fn collect_values(&mut self) {
        let mut phis = Vec::new();
        for id in self.graph.instrs_in_order() {
            match self.graph.op(id) {
                Op::CheckBounds => self.checks.push(id),
                Op::Phi => phis.push(id),
                _ if self.is_integer_definition(id) => {
                    self.candidates.insert(id.as_usize());
                }
                _ => {}
            }
        }
        for &phi in &phis {
            self.candidates.insert(phi.as_usize());
        }
        loop {
            let mut changed = false;
            for &phi in &phis {
                if !self.is_candidate(phi) {
                    continue;
                }
                let mixed = self
                    .graph
                    .inputs(phi)
                    .iter()
                    .any(|&v| v != phi && !self.is_candidate(v));
                if mixed {
                    self.candidates.remove(phi.as_usize());
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }
        self.stats.values = self.candidates.count();
        self.stats.bounds_checks = self.checks.len();
    }

    fn is_integer_definition(&self, id: InstrId) -> bool {
        match self.graph.op(id) {
            Op::Constant(lit) => lit.as_int().is_some(),
            Op::Parameter(i) => matches!(
                self.graph.param_type(*i as usize),
                Some(ClassId::SMI | ClassId::INT | ClassId::MINT)
            ),
            Op::IntBinary { .. }
            | Op::IntUnary { .. }
            | Op::ShiftMask { .. }
            | Op::LoadLength
            | Op::LoadClassId
            | Op::StringToCharCode
            | Op::IntConverter { .. } => true,
            Op::Box { from } => matches!(from, Repr::Int64 | Repr::Uint32),
            Op::Unbox { to } => matches!(to, Repr::Int64 | Repr::Uint32),
            _ => false,
        }
    }

    /// Current range of `v`: `None` while a tracked value is unresolved,
    /// the full range for anything untracked.
    fn range_of(&self, v: InstrId) -> Option<Range> {
        if self.is_candidate(v) {
            self.graph.instr(v).range
        } else {
            Some(Range::full())
        }
    }

    /// Range assumed for `v` when inference gives up on it.
    fn fallback_range(&self, v: InstrId) -> Range {
        match self.graph.op(v) {
            Op::Constant(lit) => lit.as_int().map_or_else(Range::full, Range::constant),
            Op::IntBinary { width, .. } | Op::IntUnary { width, .. } => Range::of_width(*width),
            Op::Unbox { to: Repr::Uint32 } | Op::IntConverter { to: Repr::Uint32, .. } => {
                Range::of_width(IntWidth::Uint32)
            }
            _ => Range::full(),
        }
    }

    /// Drop symbolic boundaries that may not refer to the current value of
    /// their definition at `v`, keeping their constant bound instead.
    ///
    /// A phi merges values from earlier iterations, so its boundaries may
    /// only name definitions from blocks strictly dominating it.
    fn sanitize(&self, v: InstrId, range: Range) -> Range {
        let is_phi = matches!(self.graph.op(v), Op::Phi);
        let valid = |b: RangeBoundary| match b {
            RangeBoundary::Symbol { def, .. } => {
                def != v
                    && if is_phi {
                        let (from, to) = (self.graph.instr(def).block, self.graph.instr(v).block);
                        self.dom.strictly_dominates(from, to)
                    } else {
                        self.dom.instr_dominates(self.graph, def, v)
                    }
            }
            _ => true,
        };
        let min = if valid(range.min) {
            range.min
        } else {
            range.min.lower_bound(self.graph)
        };
        let max = if valid(range.max) {
            range.max
        } else {
            range.max.upper_bound(self.graph)
        };
        Range::new(min, max)
    }

    /// Remove every constraint, handing its uses back to its input.
    fn remove_constraints(&mut self) {
        for c in std::mem::take(&mut self.constraints) {
            let input = self.graph.input(c, 0);
            self.graph.replace_all_uses(c, input);
            self.graph.remove_instr(c);
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hierarchy::ClassTable;
    use crate::ir::builder::FlowGraphBuilder;
    use crate::ir::types::{BinaryOp, CmpOp};
    use crate::ir::verify::verify;

    /// Run the pass and return it with its statistics.
    pub(super) fn analyze(graph: &mut FlowGraph, config: &OptConfig) -> RangeAnalysis {
        let table = ClassTable::new();
        let mut cx = CompileContext::new(config, &table);
        let mut pass = RangeAnalysis::new();
        pass.run(graph, &mut cx).expect("pass succeeds");
        verify(graph).expect("consistent after range analysis");
        pass
    }

    pub(super) fn smi(op: BinaryOp) -> Op {
        Op::IntBinary {
            op,
            width: IntWidth::Smi,
        }
    }

    pub(super) fn ops(graph: &FlowGraph) -> Vec<&'static str> {
        graph
            .instrs_in_order()
            .into_iter()
            .map(|i| graph.op(i).mnemonic())
            .filter(|m| !matches!(*m, "Constant" | "Parameter" | "Goto"))
            .collect()
    }

    /// `for i in 0..a.length: check(a.length, i); a[i]`, returning the
    /// graph, the header phi and the check.
    pub(super) fn array_loop() -> (FlowGraph, InstrId, InstrId) {
        let mut b = FlowGraphBuilder::new("sum", 1);
        b.declare_param(0, ClassId::ARRAY);
        let a = b.param(0);
        let zero = b.int(0);
        let one = b.int(1);
        let entry = b.current_block();
        let (header, body, exit) = (b.new_block(), b.new_block(), b.new_block());
        b.goto(header);

        b.switch_to(header);
        let i = b.phi();
        let n = b.emit(Op::LoadLength, &[a]);
        let cond = b.emit(Op::IntCompare { op: CmpOp::Lt }, &[i, n]);
        b.branch(cond, body, exit);

        b.switch_to(body);
        let n2 = b.emit(Op::LoadLength, &[a]);
        let check = b.emit(Op::CheckBounds, &[n2, i]);
        b.emit(Op::LoadIndexed, &[a, i]);
        let next = b.emit(smi(BinaryOp::Add), &[i, one]);
        b.goto(header);

        b.switch_to(exit);
        b.ret(i);

        b.phi_input(i, entry, zero);
        b.phi_input(i, body, next);
        (b.finish().expect("valid graph"), i, check)
    }

    #[test]
    fn test_constraints_are_removed() {
        let (mut g, _, _) = array_loop();
        let pass = analyze(&mut g, &OptConfig::default());
        assert!(pass.stats().constraints_inserted > 0);
        assert!(!ops(&g).contains(&"Constraint"));
    }

    #[test]
    fn test_non_integer_phi_is_not_tracked() {
        let mut b = FlowGraphBuilder::new("f", 1);
        let x = b.param(0);
        let one = b.int(1);
        let (l, r, join) = (b.new_block(), b.new_block(), b.new_block());
        b.branch(x, l, r);
        b.switch_to(l);
        b.goto(join);
        b.switch_to(r);
        b.goto(join);
        b.switch_to(join);
        let phi = b.phi();
        b.ret(phi);
        b.phi_input(phi, l, one);
        b.phi_input(phi, r, x);
        let mut g = b.finish().expect("valid graph");
        analyze(&mut g, &OptConfig::default());
        assert_eq!(g.instr(phi).range, None);
        assert_eq!(g.instr(one).range, Some(Range::constant(1)));
    }

    #[test]
    fn test_rerun_is_stable() {
        let (mut g, _, _) = array_loop();
        let config = OptConfig::default();
        assert!(analyze(&mut g, &config).stats().bounds_checks_eliminated == 1);
        let before = g.to_string();
        let again = analyze(&mut g, &config);
        assert_eq!(again.stats().bounds_checks, 0);
        assert_eq!(g.to_string(), before);
    }
}
