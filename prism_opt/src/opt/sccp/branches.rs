//! Redundant branch removal.
//!
//! A branch whose two arms, after skipping blocks that contain nothing but a
//! jump, arrive at the same merge block without phis computes nothing: both
//! paths do the same work. The branch becomes a jump straight to the merge
//! and the forwarding blocks are deleted.
//!
//! ```text
//!        B                      B
//!       / \                     |
//!      T   F      ==>           |
//!       \ /                     |
//!        J (no phis)            J
//! ```

use crate::ir::graph::FlowGraph;
use crate::ir::instr::{BlockId, Op};

use smallvec::SmallVec;

/// Follow a chain of jump-only, single-predecessor blocks starting at
/// `block`. Returns the first block that does real work, and the chain of
/// forwarding blocks walked through.
fn skip_empty(
    graph: &FlowGraph,
    from: BlockId,
    block: BlockId,
) -> (BlockId, SmallVec<[BlockId; 4]>) {
    let mut chain = SmallVec::new();
    let mut current = block;
    loop {
        let b = graph.block(current);
        let forwards = b.preds().len() == 1 && b.instrs().len() == 1 && current != from;
        let target = match graph.terminator(current).map(|t| graph.op(t)) {
            Some(Op::Goto(target)) if forwards => *target,
            _ => return (current, chain),
        };
        if chain.contains(&current) || target == from {
            return (current, chain);
        }
        chain.push(current);
        current = target;
    }
}

/// Remove every redundant branch. Returns the number removed.
pub(super) fn eliminate_redundant_branches(graph: &mut FlowGraph, trace: bool) -> usize {
    let mut removed = 0;
    let blocks: Vec<BlockId> = graph.rpo().to_vec();
    for block in blocks {
        if graph.block(block).is_removed() {
            continue;
        }
        let Some(term) = graph.terminator(block) else {
            continue;
        };
        let Op::Branch { if_true, if_false } = *graph.op(term) else {
            continue;
        };
        let (join_true, chain_true) = skip_empty(graph, block, if_true);
        let (join_false, chain_false) = skip_empty(graph, block, if_false);
        if join_true != join_false || join_true == block || !graph.phis(join_true).is_empty() {
            continue;
        }
        let join = join_true;
        let cond = graph.input(term, 0);
        if trace {
            tracing::debug!(block = %block, join = %join, "redundant branch");
        }

        graph.replace_terminator_with_goto(block, join);
        for dead in chain_true.into_iter().chain(chain_false) {
            if !graph.block(dead).is_removed() {
                graph.remove_block(dead);
            }
        }
        if !graph.has_uses(cond) && graph.op(cond).is_removable() {
            graph.remove_instr(cond);
        }
        removed += 1;
    }
    if removed > 0 {
        graph.compute_rpo();
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::builder::FlowGraphBuilder;
    use crate::ir::types::CmpOp;
    use crate::ir::verify::verify;

    #[test]
    fn test_empty_diamond_collapses() {
        let mut b = FlowGraphBuilder::new("f", 2);
        let (x, y) = (b.param(0), b.param(1));
        let cond = b.emit(Op::IntCompare { op: CmpOp::Lt }, &[x, y]);
        let (yes, no, join) = (b.new_block(), b.new_block(), b.new_block());
        b.branch(cond, yes, no);
        b.switch_to(yes);
        b.goto(join);
        b.switch_to(no);
        b.goto(join);
        b.switch_to(join);
        b.ret(x);
        let mut g = b.finish().expect("valid graph");

        assert_eq!(eliminate_redundant_branches(&mut g, false), 1);
        assert!(g.instr(cond).is_removed());
        assert!(g.block(yes).is_removed() && g.block(no).is_removed());
        assert_eq!(g.successors(g.entry()).as_slice(), &[join]);
        assert_eq!(g.block(join).preds(), &[g.entry()]);
        verify(&g).expect("consistent");
    }

    #[test]
    fn test_merge_with_phi_is_kept() {
        let mut b = FlowGraphBuilder::new("f", 2);
        let (x, y) = (b.param(0), b.param(1));
        let cond = b.emit(Op::IntCompare { op: CmpOp::Lt }, &[x, y]);
        let (yes, no, join) = (b.new_block(), b.new_block(), b.new_block());
        b.branch(cond, yes, no);
        b.switch_to(yes);
        b.goto(join);
        b.switch_to(no);
        b.goto(join);
        b.switch_to(join);
        let phi = b.phi();
        b.ret(phi);
        b.phi_input(phi, yes, x);
        b.phi_input(phi, no, y);
        let mut g = b.finish().expect("valid graph");
        assert_eq!(eliminate_redundant_branches(&mut g, false), 0);
    }

    #[test]
    fn test_arm_with_work_is_kept() {
        let mut b = FlowGraphBuilder::new("f", 2);
        let (x, y) = (b.param(0), b.param(1));
        let cond = b.emit(Op::IntCompare { op: CmpOp::Lt }, &[x, y]);
        let (yes, no, join) = (b.new_block(), b.new_block(), b.new_block());
        b.branch(cond, yes, no);
        b.switch_to(yes);
        b.emit(Op::StoreField { offset: 0 }, &[x, y]);
        b.goto(join);
        b.switch_to(no);
        b.goto(join);
        b.switch_to(join);
        b.ret(x);
        let mut g = b.finish().expect("valid graph");
        assert_eq!(eliminate_redundant_branches(&mut g, false), 0);
    }
}
