//! Sparse conditional solver.
//!
//! Two worklists drive the analysis to a fixed point:
//!
//! - the **CFG worklist** holds control edges that just became executable.
//!   Taking an edge into a block for the first time evaluates the whole
//!   block; taking a further edge into an already reachable block only
//!   re-evaluates its phis.
//! - the **SSA worklist** holds definitions whose lattice value moved.
//!   Their consumers in reachable blocks are re-evaluated.
//!
//! A branch whose condition is still `Unknown` makes no edge executable, a
//! constant condition makes exactly one, anything else makes both. Lattice
//! values only rise, so the solver terminates after at most two changes per
//! definition.

use super::evaluation::ConstEvaluator;
use super::lattice::LatticeValue;
use crate::hierarchy::ClassHierarchy;
use crate::ir::arena::{BitSet, SecondaryMap};
use crate::ir::graph::FlowGraph;
use crate::ir::instr::{BlockId, Instr, InstrId, Op, UseSlot};
use crate::ir::types::Literal;

use rustc_hash::FxHashSet;
use std::collections::VecDeque;

// =============================================================================
// Edge Executability
// =============================================================================

/// Executable control edges and reachable blocks.
#[derive(Debug, Default, Clone)]
pub struct EdgeExecutability {
    executable: FxHashSet<(BlockId, BlockId)>,
    reachable: BitSet,
}

impl EdgeExecutability {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `from -> to` executable. Returns true if it was not.
    pub fn mark_executable(&mut self, from: BlockId, to: BlockId) -> bool {
        self.executable.insert((from, to))
    }

    /// Mark a block reachable. Returns true if it was not.
    pub fn mark_reachable(&mut self, block: BlockId) -> bool {
        self.reachable.insert(block.as_usize())
    }

    #[inline]
    pub fn is_edge_executable(&self, from: BlockId, to: BlockId) -> bool {
        self.executable.contains(&(from, to))
    }

    #[inline]
    pub fn is_reachable(&self, block: BlockId) -> bool {
        self.reachable.contains(block.as_usize())
    }

    /// Number of reachable blocks.
    pub fn reachable_count(&self) -> usize {
        self.reachable.count()
    }

    /// Number of executable edges.
    pub fn edge_count(&self) -> usize {
        self.executable.len()
    }

    /// Whether every edge and block marked here is also marked in `other`.
    pub fn is_subset_of(&self, other: &EdgeExecutability) -> bool {
        self.executable.iter().all(|e| other.executable.contains(e))
            && self.reachable.iter().all(|b| other.reachable.contains(b))
    }
}

// =============================================================================
// Solver
// =============================================================================

/// Solver statistics.
#[derive(Debug, Clone, Default)]
pub struct SolverStats {
    /// Instruction evaluations.
    pub instrs_visited: usize,
    /// Lattice moves.
    pub value_changes: usize,
    /// Control edges taken.
    pub edges_taken: usize,
}

/// Outcome of the analysis.
#[derive(Debug, Clone)]
pub struct SolverResult {
    pub values: SecondaryMap<Instr, LatticeValue>,
    pub edges: EdgeExecutability,
    pub stats: SolverStats,
}

impl SolverResult {
    /// Lattice value of a definition.
    #[inline]
    pub fn value(&self, id: InstrId) -> &LatticeValue {
        &self.values[id]
    }

    /// Whether the analysis found a path to `block`.
    #[inline]
    pub fn is_reachable(&self, block: BlockId) -> bool {
        self.edges.is_reachable(block)
    }
}

/// The sparse conditional constant propagation solver.
pub struct SccpSolver<'g> {
    graph: &'g FlowGraph,
    evaluator: ConstEvaluator<'g>,
    values: SecondaryMap<Instr, LatticeValue>,
    edges: EdgeExecutability,
    ssa_worklist: VecDeque<InstrId>,
    cfg_worklist: VecDeque<(BlockId, BlockId)>,
    stats: SolverStats,
}

impl std::fmt::Debug for SccpSolver<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SccpSolver")
            .field("ssa_worklist", &self.ssa_worklist.len())
            .field("cfg_worklist", &self.cfg_worklist.len())
            .field("stats", &self.stats)
            .finish()
    }
}

impl<'g> SccpSolver<'g> {
    pub fn new(graph: &'g FlowGraph, hierarchy: &'g dyn ClassHierarchy) -> Self {
        Self {
            graph,
            evaluator: ConstEvaluator::new(hierarchy),
            values: SecondaryMap::with_capacity(graph.instr_capacity()),
            edges: EdgeExecutability::new(),
            ssa_worklist: VecDeque::new(),
            cfg_worklist: VecDeque::new(),
            stats: SolverStats::default(),
        }
    }

    /// Run to a fixed point.
    pub fn solve(self) -> SolverResult {
        self.solve_observed(|_| {})
    }

    /// Run to a fixed point, handing the executable edges to `observe`
    /// after every worklist step.
    pub fn solve_observed(mut self, mut observe: impl FnMut(&EdgeExecutability)) -> SolverResult {
        let entry = self.graph.entry();
        self.edges.mark_reachable(entry);
        self.visit_block(entry);
        observe(&self.edges);

        loop {
            if let Some((from, to)) = self.cfg_worklist.pop_front() {
                self.take_edge(from, to);
            } else if let Some(def) = self.ssa_worklist.pop_front() {
                self.visit_users(def);
            } else {
                break;
            }
            observe(&self.edges);
        }

        SolverResult {
            values: self.values,
            edges: self.edges,
            stats: self.stats,
        }
    }

    fn take_edge(&mut self, from: BlockId, to: BlockId) {
        if !self.edges.mark_executable(from, to) {
            return;
        }
        self.stats.edges_taken += 1;
        if self.edges.mark_reachable(to) {
            self.visit_block(to);
        } else {
            for phi in self.graph.phis(to) {
                self.visit(phi);
            }
        }
    }

    fn visit_block(&mut self, block: BlockId) {
        for &id in self.graph.block(block).instrs() {
            self.visit(id);
        }
    }

    fn visit_users(&mut self, def: InstrId) {
        let users: Vec<InstrId> = self
            .graph
            .uses(def)
            .filter(|(_, u)| matches!(u.slot, UseSlot::Input(_)))
            .map(|(_, u)| u.user)
            .collect();
        for user in users {
            if self.edges.is_reachable(self.graph.instr(user).block) {
                self.visit(user);
            }
        }
    }

    fn visit(&mut self, id: InstrId) {
        self.stats.instrs_visited += 1;
        let graph = self.graph;
        let block = graph.instr(id).block;
        match graph.op(id) {
            Op::Goto(target) => self.cfg_worklist.push_back((block, *target)),
            Op::Branch { if_true, if_false } => {
                let (if_true, if_false) = (*if_true, *if_false);
                match &self.values[graph.input(id, 0)] {
                    LatticeValue::Unknown => {}
                    LatticeValue::Constant(Literal::Bool(true)) => {
                        self.cfg_worklist.push_back((block, if_true));
                    }
                    LatticeValue::Constant(Literal::Bool(false)) => {
                        self.cfg_worklist.push_back((block, if_false));
                    }
                    _ => {
                        self.cfg_worklist.push_back((block, if_true));
                        self.cfg_worklist.push_back((block, if_false));
                    }
                }
            }
            Op::Return => {}
            Op::Phi => {
                let value = self.evaluate_phi(id);
                self.update(id, value);
            }
            op if op.has_value() => {
                let value = self.evaluator.evaluate(graph, id, &self.values);
                self.update(id, value);
            }
            _ => {}
        }
    }

    /// Join of the inputs flowing in along executable edges.
    fn evaluate_phi(&self, phi: InstrId) -> LatticeValue {
        let block = self.graph.instr(phi).block;
        let preds = self.graph.block(block).preds();
        let mut result = LatticeValue::Unknown;
        for (i, &pred) in preds.iter().enumerate() {
            if !self.edges.is_edge_executable(pred, block) {
                continue;
            }
            result = result.join(&self.values[self.graph.input(phi, i)]);
            if result.is_non_constant() {
                break;
            }
        }
        result
    }

    fn update(&mut self, id: InstrId, value: LatticeValue) {
        if self.values.entry(id).merge(&value) {
            self.stats.value_changes += 1;
            self.ssa_worklist.push_back(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hierarchy::ClassTable;
    use crate::ir::builder::FlowGraphBuilder;
    use crate::ir::types::{BinaryOp, CmpOp, IntWidth};

    #[test]
    fn test_constant_branch_takes_one_edge() {
        let table = ClassTable::new();
        let mut b = FlowGraphBuilder::new("f", 0);
        let t = b.bool(true);
        let (yes, no) = (b.new_block(), b.new_block());
        b.branch(t, yes, no);
        b.switch_to(yes);
        let one = b.int(1);
        b.ret(one);
        b.switch_to(no);
        let two = b.int(2);
        b.ret(two);
        let g = b.finish().expect("valid graph");

        let result = SccpSolver::new(&g, &table).solve();
        assert!(result.is_reachable(yes));
        assert!(!result.is_reachable(no));
    }

    #[test]
    fn test_loop_counter_is_not_constant() {
        let table = ClassTable::new();
        let mut b = FlowGraphBuilder::new("f", 1);
        let n = b.param(0);
        let zero = b.int(0);
        let one = b.int(1);
        let entry = b.current_block();
        let (header, body, exit) = (b.new_block(), b.new_block(), b.new_block());
        b.goto(header);
        b.switch_to(header);
        let i = b.phi();
        let cond = b.emit(Op::IntCompare { op: CmpOp::Lt }, &[i, n]);
        b.branch(cond, body, exit);
        b.switch_to(body);
        let next = b.emit(
            Op::IntBinary {
                op: BinaryOp::Add,
                width: IntWidth::Int64,
            },
            &[i, one],
        );
        b.goto(header);
        b.switch_to(exit);
        b.ret(i);
        b.phi_input(i, entry, zero);
        b.phi_input(i, body, next);
        let g = b.finish().expect("valid graph");

        let result = SccpSolver::new(&g, &table).solve();
        assert_eq!(result.value(i), &LatticeValue::NonConstant);
        assert!(result.is_reachable(body));
        assert!(result.is_reachable(exit));
    }

    #[test]
    fn test_reachability_only_grows() {
        let table = ClassTable::new();
        let mut b = FlowGraphBuilder::new("f", 1);
        let x = b.param(0);
        let (zero, one) = (b.int(0), b.int(1));
        let (yes, no, join) = (b.new_block(), b.new_block(), b.new_block());
        let cond = b.emit(Op::IntCompare { op: CmpOp::Lt }, &[x, zero]);
        b.branch(cond, yes, no);
        b.switch_to(yes);
        b.goto(join);
        b.switch_to(no);
        b.goto(join);
        b.switch_to(join);
        let phi = b.phi();
        b.ret(phi);
        b.phi_input(phi, yes, zero);
        b.phi_input(phi, no, one);
        let g = b.finish().expect("valid graph");

        let mut snapshots = Vec::new();
        let result = SccpSolver::new(&g, &table).solve_observed(|e| snapshots.push(e.clone()));
        assert!(snapshots.len() > 1);
        for pair in snapshots.windows(2) {
            assert!(pair[0].is_subset_of(&pair[1]));
        }
        assert_eq!(result.edges.reachable_count(), 4);
        assert!(snapshots[0].reachable_count() < result.edges.reachable_count());
    }

    #[test]
    fn test_phi_ignores_dead_edges() {
        let table = ClassTable::new();
        let mut b = FlowGraphBuilder::new("f", 0);
        let f = b.bool(false);
        let (yes, no, join) = (b.new_block(), b.new_block(), b.new_block());
        b.branch(f, yes, no);
        b.switch_to(yes);
        b.goto(join);
        b.switch_to(no);
        b.goto(join);
        b.switch_to(join);
        let phi = b.phi();
        b.ret(phi);
        let (ten, twenty) = (b.int(10), b.int(20));
        b.phi_input(phi, yes, ten);
        b.phi_input(phi, no, twenty);
        let g = b.finish().expect("valid graph");

        let result = SccpSolver::new(&g, &table).solve();
        assert_eq!(result.value(phi), &LatticeValue::int(20));
        assert_eq!(result.edges.reachable_count(), 3);
    }
}
