//! Dominance and loop structure.
//!
//! Both analyses read the block order cached on the [`FlowGraph`]; callers
//! recompute it with [`FlowGraph::compute_rpo`] after editing control flow.

use super::arena::{BitSet, SecondaryMap};
use super::graph::{Block, FlowGraph};
use super::instr::{BlockId, InstrId};

use rustc_hash::FxHashMap;
use std::collections::VecDeque;

// =============================================================================
// Dominator Tree
// =============================================================================

/// Dominator tree over the reachable blocks.
#[derive(Debug, Clone)]
pub struct DominatorTree {
    /// Immediate dominator; the entry maps to itself.
    idom: SecondaryMap<Block, Option<BlockId>>,
    /// Dominator tree children.
    children: SecondaryMap<Block, Vec<BlockId>>,
    /// Preorder entry/exit numbers for constant-time dominance queries.
    pre: SecondaryMap<Block, u32>,
    post: SecondaryMap<Block, u32>,
    /// Dominator tree depth.
    depth: SecondaryMap<Block, u32>,
    entry: BlockId,
}

impl DominatorTree {
    /// Build the tree with the Cooper-Harvey-Kennedy iteration.
    pub fn compute(graph: &FlowGraph) -> Self {
        let n = graph.block_capacity();
        let entry = graph.entry();
        let mut dom = DominatorTree {
            idom: SecondaryMap::with_capacity(n),
            children: SecondaryMap::with_capacity(n),
            pre: SecondaryMap::with_capacity(n),
            post: SecondaryMap::with_capacity(n),
            depth: SecondaryMap::with_capacity(n),
            entry,
        };
        dom.idom.set(entry, Some(entry));

        let mut changed = true;
        while changed {
            changed = false;
            for &block in graph.rpo() {
                if block == entry {
                    continue;
                }
                let mut new_idom: Option<BlockId> = None;
                for &pred in graph.block(block).preds() {
                    if dom.idom[pred].is_none() {
                        continue;
                    }
                    new_idom = Some(match new_idom {
                        None => pred,
                        Some(current) => dom.intersect(graph, pred, current),
                    });
                }
                if new_idom.is_some() && dom.idom[block] != new_idom {
                    dom.idom.set(block, new_idom);
                    changed = true;
                }
            }
        }

        for &block in graph.rpo() {
            if block == entry {
                continue;
            }
            if let Some(parent) = dom.idom[block] {
                dom.children.entry(parent).push(block);
            }
        }
        dom.number_tree();
        dom
    }

    fn intersect(&self, graph: &FlowGraph, mut a: BlockId, mut b: BlockId) -> BlockId {
        let order = |x: BlockId| graph.rpo_number(x).unwrap_or(u32::MAX);
        while a != b {
            while order(a) > order(b) {
                match self.idom[a] {
                    Some(up) => a = up,
                    None => return b,
                }
            }
            while order(b) > order(a) {
                match self.idom[b] {
                    Some(up) => b = up,
                    None => return a,
                }
            }
        }
        a
    }

    fn number_tree(&mut self) {
        let mut counter = 0u32;
        let mut stack: Vec<(BlockId, usize)> = vec![(self.entry, 0)];
        self.pre.set(self.entry, counter);
        self.depth.set(self.entry, 0);
        counter += 1;
        while let Some(&(block, next)) = stack.last() {
            let child = self.children[block].get(next).copied();
            match child {
                Some(child) => {
                    if let Some(top) = stack.last_mut() {
                        top.1 += 1;
                    }
                    self.pre.set(child, counter);
                    self.depth.set(child, stack.len() as u32);
                    counter += 1;
                    stack.push((child, 0));
                }
                None => {
                    self.post.set(block, counter);
                    stack.pop();
                }
            }
        }
    }

    /// Immediate dominator, `None` for the entry and unreachable blocks.
    pub fn idom(&self, block: BlockId) -> Option<BlockId> {
        self.idom[block].filter(|&d| d != block)
    }

    /// Dominator tree children.
    pub fn children(&self, block: BlockId) -> &[BlockId] {
        self.children.get(block).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Dominator tree depth.
    pub fn depth(&self, block: BlockId) -> u32 {
        self.depth[block]
    }

    /// Whether the block was reachable when the tree was built.
    pub fn is_reachable(&self, block: BlockId) -> bool {
        self.idom[block].is_some()
    }

    /// Whether `a` dominates `b`. Every block dominates itself.
    pub fn dominates(&self, a: BlockId, b: BlockId) -> bool {
        if a == b {
            return true;
        }
        if !self.is_reachable(a) || !self.is_reachable(b) {
            return false;
        }
        self.pre[a] <= self.pre[b] && self.post[b] <= self.post[a]
    }

    /// Whether `a` dominates `b` and differs from it.
    pub fn strictly_dominates(&self, a: BlockId, b: BlockId) -> bool {
        a != b && self.dominates(a, b)
    }

    /// Whether instruction `a` executes before `b` on every path reaching
    /// `b`.
    pub fn instr_dominates(&self, graph: &FlowGraph, a: InstrId, b: InstrId) -> bool {
        let (ba, bb) = (graph.instr(a).block, graph.instr(b).block);
        if ba == bb {
            graph.position_in_block(a) <= graph.position_in_block(b)
        } else {
            self.dominates(ba, bb)
        }
    }

    /// Blocks in dominator tree preorder.
    pub fn preorder(&self) -> Vec<BlockId> {
        let mut out = Vec::new();
        let mut stack = vec![self.entry];
        while let Some(block) = stack.pop() {
            out.push(block);
            stack.extend(self.children(block).iter().rev().copied());
        }
        out
    }
}

// =============================================================================
// Loop Analysis
// =============================================================================

/// A natural loop.
#[derive(Debug, Clone)]
pub struct Loop {
    /// The loop header block.
    pub header: BlockId,
    /// Back edge sources.
    pub back_edges: Vec<BlockId>,
    /// Blocks of the loop, header included.
    pub body: BitSet,
    /// Enclosing loop.
    pub parent: Option<usize>,
    /// Nesting depth, 1 for outermost loops.
    pub depth: u32,
}

impl Loop {
    /// Whether `block` belongs to the loop.
    #[inline]
    pub fn contains(&self, block: BlockId) -> bool {
        self.body.contains(block.as_usize())
    }
}

/// Natural loops of a graph.
#[derive(Debug, Clone, Default)]
pub struct LoopAnalysis {
    /// All detected loops.
    pub loops: Vec<Loop>,
    /// Map from header block to loop index.
    pub header_to_loop: FxHashMap<BlockId, usize>,
    /// Map from block to innermost containing loop.
    pub block_to_loop: FxHashMap<BlockId, usize>,
}

impl LoopAnalysis {
    /// Find loops from back edges (edges whose target dominates the source).
    pub fn compute(graph: &FlowGraph, dom: &DominatorTree) -> Self {
        let mut analysis = LoopAnalysis::default();
        for &block in graph.rpo() {
            for succ in graph.successors(block) {
                if dom.dominates(succ, block) {
                    analysis.add_back_edge(graph, succ, block);
                }
            }
        }
        analysis.compute_nesting();
        analysis
    }

    fn add_back_edge(&mut self, graph: &FlowGraph, header: BlockId, source: BlockId) {
        let idx = match self.header_to_loop.get(&header) {
            Some(&idx) => {
                self.loops[idx].back_edges.push(source);
                idx
            }
            None => {
                let mut body = BitSet::with_capacity(graph.block_capacity());
                body.insert(header.as_usize());
                self.loops.push(Loop {
                    header,
                    back_edges: vec![source],
                    body,
                    parent: None,
                    depth: 1,
                });
                self.header_to_loop.insert(header, self.loops.len() - 1);
                self.loops.len() - 1
            }
        };

        let mut worklist = VecDeque::from([source]);
        while let Some(block) = worklist.pop_front() {
            if self.loops[idx].body.insert(block.as_usize()) {
                worklist.extend(graph.block(block).preds().iter().copied());
            }
        }
    }

    fn compute_nesting(&mut self) {
        let n = self.loops.len();
        for i in 0..n {
            let header = self.loops[i].header;
            self.loops[i].parent = (0..n)
                .filter(|&j| j != i && self.loops[j].contains(header))
                .min_by_key(|&j| self.loops[j].body.count());
        }
        for i in 0..n {
            let mut depth = 1;
            let mut current = self.loops[i].parent;
            while let Some(p) = current {
                depth += 1;
                current = self.loops[p].parent;
            }
            self.loops[i].depth = depth;
        }
        // Innermost loop wins: visit deeper loops last.
        let mut order: Vec<usize> = (0..n).collect();
        order.sort_by_key(|&i| self.loops[i].depth);
        for i in order {
            for b in self.loops[i].body.iter() {
                self.block_to_loop.insert(BlockId::new(b as u32), i);
            }
        }
    }

    /// Loop headed by `block`.
    pub fn loop_for_header(&self, block: BlockId) -> Option<&Loop> {
        self.header_to_loop.get(&block).map(|&i| &self.loops[i])
    }

    /// Innermost loop containing `block`.
    pub fn loop_for_block(&self, block: BlockId) -> Option<&Loop> {
        self.block_to_loop.get(&block).map(|&i| &self.loops[i])
    }

    /// Loop depth of `block`, 0 outside loops.
    pub fn loop_depth(&self, block: BlockId) -> u32 {
        self.loop_for_block(block).map_or(0, |l| l.depth)
    }
}

// =============================================================================
// Tests
// =============================================================================
