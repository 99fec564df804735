//! Rewrite phase of constant propagation.
//!
//! Applies a [`SolverResult`] to the graph:
//!
//! 1. branches with a single executable edge become jumps;
//! 2. blocks the analysis never reached are deleted;
//! 3. phis left with one distinct input collapse to it;
//! 4. definitions resolved to a cheap constant are replaced by the
//!    canonical constant node;
//! 5. guards whose operands are now constants and pass are dropped;
//! 6. side-effect-free definitions no live instruction reaches are swept.
//!
//! Every step only removes or redirects, so applying the same result twice
//! changes nothing the second time.

use super::lattice::LatticeValue;
use super::solver::SolverResult;
use super::SccpStats;
use crate::ir::arena::BitSet;
use crate::ir::graph::FlowGraph;
use crate::ir::instr::{BlockId, InstrId, Op};
use crate::ir::types::{is_smi, Literal};

pub(super) struct Transformer<'g, 'r> {
    graph: &'g mut FlowGraph,
    result: &'r SolverResult,
    stats: &'g mut SccpStats,
    trace: bool,
    cfg_changed: bool,
}

impl<'g, 'r> Transformer<'g, 'r> {
    pub(super) fn new(
        graph: &'g mut FlowGraph,
        result: &'r SolverResult,
        stats: &'g mut SccpStats,
        trace: bool,
    ) -> Self {
        Self {
            graph,
            result,
            stats,
            trace,
            cfg_changed: false,
        }
    }

    /// Apply every step. Returns whether the graph changed.
    pub(super) fn apply(mut self) -> bool {
        let mut changed = self.simplify_branches();
        changed |= self.remove_unreachable_blocks();
        changed |= self.collapse_phis();
        changed |= self.replace_constants();
        changed |= self.remove_satisfied_guards();
        if self.cfg_changed {
            self.graph.compute_rpo();
        }
        changed |= self.sweep_dead_code();
        changed
    }

    fn live_blocks(&self) -> Vec<BlockId> {
        self.graph
            .blocks()
            .filter(|(_, b)| !b.is_removed())
            .map(|(id, _)| id)
            .collect()
    }

    // =========================================================================
    // Control Flow
    // =========================================================================

    fn simplify_branches(&mut self) -> bool {
        let mut changed = false;
        for block in self.live_blocks() {
            if !self.result.is_reachable(block) {
                continue;
            }
            let Some(term) = self.graph.terminator(block) else {
                continue;
            };
            let Op::Branch { if_true, if_false } = *self.graph.op(term) else {
                continue;
            };
            let edges = &self.result.edges;
            let keep = match (
                edges.is_edge_executable(block, if_true),
                edges.is_edge_executable(block, if_false),
            ) {
                (true, false) => if_true,
                (false, true) => if_false,
                _ => continue,
            };
            if self.trace {
                tracing::debug!(block = %block, target = %keep, "branch resolved");
            }
            self.graph.replace_terminator_with_goto(block, keep);
            self.stats.branches_simplified += 1;
            self.cfg_changed = true;
            changed = true;
        }
        changed
    }

    fn remove_unreachable_blocks(&mut self) -> bool {
        let dead: Vec<BlockId> = self
            .live_blocks()
            .into_iter()
            .filter(|&b| !self.result.is_reachable(b))
            .collect();
        for &block in &dead {
            self.stats.dead_instrs_removed += self.graph.block(block).instrs().len();
            self.graph.remove_block(block);
            self.stats.blocks_removed += 1;
        }
        if !dead.is_empty() {
            self.cfg_changed = true;
        }
        !dead.is_empty()
    }

    // =========================================================================
    // Phis
    // =========================================================================

    fn collapse_phis(&mut self) -> bool {
        let mut changed = false;
        for block in self.live_blocks() {
            for phi in self.graph.phis(block) {
                let Some(value) = single_phi_input(self.graph, phi) else {
                    continue;
                };
                self.graph.replace_all_uses(phi, value);
                self.graph.remove_instr(phi);
                self.stats.phis_removed += 1;
                changed = true;
            }
        }
        changed
    }

    // =========================================================================
    // Constants
    // =========================================================================

    fn replace_constants(&mut self) -> bool {
        let mut changed = false;
        for id in self.graph.instrs_in_order() {
            if self.graph.instr(id).is_removed() {
                continue;
            }
            if matches!(
                self.graph.op(id),
                Op::Constant(_) | Op::PushArgument | Op::Parameter(_)
            ) || !self.graph.op(id).has_value()
            {
                continue;
            }
            let LatticeValue::Constant(lit) = self.result.value(id) else {
                continue;
            };
            if !lit.is_cheap() {
                continue;
            }
            let constant = self.graph.constant(lit.clone());
            if self.trace {
                tracing::debug!(instr = %id, op = %self.graph.op(id), value = %lit, "folded");
            }
            self.graph.replace_all_uses(id, constant);
            self.graph.remove_instr(id);
            self.stats.constants_folded += 1;
            changed = true;
        }
        changed
    }

    /// Constant value of an operand, whether it was folded or always was.
    fn literal(&self, id: InstrId) -> Option<Literal> {
        self.graph
            .literal(id)
            .cloned()
            .or_else(|| self.result.values.get(id).and_then(|v| v.as_constant().cloned()))
    }

    fn remove_satisfied_guards(&mut self) -> bool {
        let mut changed = false;
        for id in self.graph.instrs_in_order() {
            if self.graph.instr(id).is_removed() || !self.guard_holds(id) {
                continue;
            }
            if self.trace {
                tracing::debug!(instr = %id, op = %self.graph.op(id), "guard statically satisfied");
            }
            self.graph.remove_instr(id);
            self.stats.guards_removed += 1;
            changed = true;
        }
        changed
    }

    fn guard_holds(&self, id: InstrId) -> bool {
        let operand = |i: usize| self.literal(self.graph.input(id, i));
        match self.graph.op(id) {
            Op::CheckSmi => matches!(operand(0), Some(Literal::Int(v)) if is_smi(v)),
            Op::CheckClass { cids } => operand(0).is_some_and(|lit| cids.contains(&lit.class_id())),
            Op::CheckEitherDouble => {
                matches!(operand(0), Some(Literal::Double(_)))
                    || matches!(operand(1), Some(Literal::Double(_)))
            }
            Op::CheckBounds | Op::AssertBounds => {
                match (operand(0).and_then(|l| l.as_int()), operand(1).and_then(|l| l.as_int())) {
                    (Some(len), Some(index)) => 0 <= index && index < len,
                    _ => false,
                }
            }
            _ => false,
        }
    }

    // =========================================================================
    // Dead Code
    // =========================================================================

    /// Delete every side-effect-free definition no live instruction reaches.
    /// Liveness flows from the instructions that must stay through operands
    /// and environments, so phis feeding only each other are swept too.
    fn sweep_dead_code(&mut self) -> bool {
        let order = self.graph.instrs_in_order();
        let mut live = BitSet::with_capacity(self.graph.instr_capacity());
        let mut worklist: Vec<InstrId> = Vec::new();
        for &id in &order {
            if !is_sweepable(self.graph.op(id)) {
                live.insert(id.as_usize());
                worklist.push(id);
            }
        }
        while let Some(id) = worklist.pop() {
            let operands = self.graph.inputs(id);
            let env = self.graph.env_values(id);
            for value in operands.into_iter().chain(env) {
                if live.insert(value.as_usize()) {
                    worklist.push(value);
                }
            }
        }

        let dead: Vec<InstrId> = order
            .into_iter()
            .filter(|id| !live.contains(id.as_usize()))
            .collect();
        for &id in &dead {
            self.graph.remove_instr(id);
        }
        self.stats.dead_instrs_removed += dead.len();
        !dead.is_empty()
    }
}

fn is_sweepable(op: &Op) -> bool {
    op.is_removable() || matches!(op, Op::Phi)
}

/// The one value a phi can produce: its only input, or the common input
/// once self references are ignored.
pub(super) fn single_phi_input(graph: &FlowGraph, phi: InstrId) -> Option<InstrId> {
    let mut single = None;
    for input in graph.inputs(phi) {
        if input == phi {
            continue;
        }
        match single {
            None => single = Some(input),
            Some(s) if s == input => {}
            Some(_) => return None,
        }
    }
    single
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hierarchy::ClassTable;
    use crate::ir::builder::FlowGraphBuilder;
    use crate::ir::verify::verify;
    use crate::opt::sccp::solver::SccpSolver;

    fn run(graph: &mut FlowGraph) -> (bool, SccpStats) {
        let table = ClassTable::new();
        let result = SccpSolver::new(graph, &table).solve();
        let mut stats = SccpStats::default();
        let changed = Transformer::new(graph, &result, &mut stats, false).apply();
        (changed, stats)
    }

    #[test]
    fn test_dead_arm_is_removed() {
        let mut b = FlowGraphBuilder::new("f", 1);
        let x = b.param(0);
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
        let one = b.int(1);
        b.phi_input(phi, yes, one);
        b.phi_input(phi, no, x);
        let mut g = b.finish().expect("valid graph");

        let (changed, stats) = run(&mut g);
        assert!(changed);
        assert_eq!(stats.branches_simplified, 1);
        assert_eq!(stats.blocks_removed, 1);
        assert_eq!(stats.phis_removed, 1);
        assert!(g.block(yes).is_removed());
        let ret = g.terminator(join).expect("return");
        assert_eq!(g.input(ret, 0), x);
        verify(&g).expect("consistent");
    }

    /// A loop counter nothing outside the loop reads.
    #[test]
    fn test_unread_loop_cycle_is_swept() {
        let mut b = FlowGraphBuilder::new("spin", 1);
        let x = b.param(0);
        let (zero, one) = (b.int(0), b.int(1));
        let entry = b.current_block();
        let (header, body, exit) = (b.new_block(), b.new_block(), b.new_block());
        b.goto(header);
        b.switch_to(header);
        let counter = b.phi();
        b.branch(x, body, exit);
        b.switch_to(body);
        let next = b.emit(
            Op::IntBinary {
                op: crate::ir::types::BinaryOp::Add,
                width: crate::ir::types::IntWidth::Int64,
            },
            &[counter, one],
        );
        b.goto(header);
        b.switch_to(exit);
        b.ret(x);
        b.phi_input(counter, entry, zero);
        b.phi_input(counter, body, next);
        let mut g = b.finish().expect("valid graph");

        let (changed, stats) = run(&mut g);
        assert!(changed);
        assert!(g.instr(counter).is_removed());
        assert!(g.instr(next).is_removed());
        assert!(stats.dead_instrs_removed >= 2);
        verify(&g).expect("consistent");
    }

    #[test]
    fn test_guard_on_constant_is_dropped() {
        let mut b = FlowGraphBuilder::new("f", 0);
        let seven = b.int(7);
        b.emit(Op::CheckSmi, &[seven]);
        b.ret(seven);
        let mut g = b.finish().expect("valid graph");
        let (changed, stats) = run(&mut g);
        assert!(changed);
        assert_eq!(stats.guards_removed, 1);
        assert!(!g.instrs_in_order().iter().any(|&i| matches!(g.op(i), Op::CheckSmi)));
    }

    #[test]
    fn test_second_application_is_a_no_op() {
        let mut b = FlowGraphBuilder::new("f", 0);
        let (three, four) = (b.int(3), b.int(4));
        let sum = b.emit(
            Op::IntBinary {
                op: crate::ir::types::BinaryOp::Add,
                width: crate::ir::types::IntWidth::Int64,
            },
            &[three, four],
        );
        b.ret(sum);
        let mut g = b.finish().expect("valid graph");
        assert!(run(&mut g).0);
        let ret = g.terminator(g.entry()).expect("return");
        assert_eq!(g.literal(g.input(ret, 0)), Some(&Literal::Int(7)));
        assert!(!run(&mut g).0);
    }
}
