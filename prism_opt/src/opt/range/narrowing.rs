//! Integer narrowing.
//!
//! Selects `uint32` arithmetic for wide integer operations whose inferred
//! range fits in 32 unsigned bits. Narrowing is all-or-nothing per value:
//! every consumer must itself be narrowed or be a representation adapter
//! that can take a `uint32` input.
//!
//! # Example
//!
//! ```text
//! // Before (Int64):
//! m = x & 0xFF            [0, 255]
//! r = m + 1               [1, 256]
//! box(r)
//!
//! // After (Uint32):
//! x32 = convert<Int64->Uint32>(x)
//! m = x32 & 0xFF
//! r = m + 1
//! box<Uint32>(r)
//! ```

use super::super::{decision, CompileContext, OptimizationPass};
use crate::error::OptResult;
use crate::ir::arena::BitSet;
use crate::ir::graph::FlowGraph;
use crate::ir::instr::{InstrId, Op, UseSlot};
use crate::ir::types::{BinaryOp, IntWidth, Repr, UINT32_MAX};

use rustc_hash::FxHashMap;

/// Statistics from the last run.
#[derive(Debug, Clone, Default)]
pub struct NarrowingStats {
    /// Wide operations whose range fits.
    pub candidates: usize,
    /// Operations turned into `uint32` operations.
    pub narrowed: usize,
    /// Conversions inserted for operands that stayed wide.
    pub converters_inserted: usize,
}

/// The integer narrowing pass.
#[derive(Debug, Default)]
pub struct IntegerNarrowingSelector {
    stats: NarrowingStats,
}

impl IntegerNarrowingSelector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Statistics from the last run.
    pub fn stats(&self) -> &NarrowingStats {
        &self.stats
    }

    /// Wide operations whose result provably fits in `uint32`.
    fn collect_candidates(&mut self, graph: &FlowGraph) -> BitSet {
        let mut selected = BitSet::with_capacity(graph.instr_capacity());
        for id in graph.instrs_in_order() {
            if is_narrowable(graph, id) {
                selected.insert(id.as_usize());
            }
        }
        self.stats.candidates = selected.count();
        selected
    }

    /// Drop candidates with a consumer that cannot take `uint32`, until
    /// every remaining candidate is only used by candidates or adapters.
    fn prune(&self, graph: &FlowGraph, selected: &mut BitSet) {
        loop {
            let mut changed = false;
            for index in selected.iter().collect::<Vec<_>>() {
                let id = InstrId::new(index as u32);
                let keeps = graph
                    .uses(id)
                    .all(|(_, u)| accepts_uint32(graph, selected, u.user, u.slot));
                if !keeps {
                    selected.remove(index);
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }
    }

    fn rewrite(&mut self, graph: &mut FlowGraph, selected: &BitSet, trace: bool) {
        let ids: Vec<InstrId> = selected.iter().map(|i| InstrId::new(i as u32)).collect();
        let mut converted: FxHashMap<InstrId, InstrId> = FxHashMap::default();

        for &id in &ids {
            let new_op = match *graph.op(id) {
                Op::IntBinary { op, .. } => Op::IntBinary {
                    op,
                    width: IntWidth::Uint32,
                },
                Op::IntUnary { op, .. } => Op::IntUnary {
                    op,
                    width: IntWidth::Uint32,
                },
                _ => continue,
            };
            if trace {
                tracing::debug!(instr = %id, op = %new_op, "narrowed to uint32");
            }
            graph.set_op(id, new_op);
            self.stats.narrowed += 1;

            let operands = graph.inputs(id);
            for (index, &operand) in operands.iter().enumerate() {
                if is_shift_count(graph, id, index) || selected.contains(operand.as_usize()) {
                    continue;
                }
                if graph
                    .int_constant_value(operand)
                    .is_some_and(|c| (0..=UINT32_MAX).contains(&c))
                {
                    continue;
                }
                let narrow = match converted.get(&operand) {
                    Some(&c) => c,
                    None => {
                        let c = insert_converter(graph, operand);
                        converted.insert(operand, c);
                        self.stats.converters_inserted += 1;
                        c
                    }
                };
                graph.replace_input(id, index, narrow);
            }
        }

        for &id in &ids {
            for u in graph.uses(id).map(|(_, u)| u.user).collect::<Vec<_>>() {
                match *graph.op(u) {
                    Op::Box { from: Repr::Int64 } => {
                        graph.set_op(u, Op::Box { from: Repr::Uint32 })
                    }
                    Op::IntConverter { from: Repr::Int64, to } if to == Repr::Uint32 => {
                        graph.replace_all_uses(u, id);
                        graph.remove_instr(u);
                    }
                    Op::IntConverter { from: Repr::Int64, to } => {
                        graph.set_op(u, Op::IntConverter { from: Repr::Uint32, to })
                    }
                    _ => {}
                }
            }
        }
    }
}

impl OptimizationPass for IntegerNarrowingSelector {
    fn name(&self) -> &'static str {
        "IntegerNarrowingSelector"
    }

    fn run(&mut self, graph: &mut FlowGraph, cx: &mut CompileContext<'_>) -> OptResult<bool> {
        self.stats = NarrowingStats::default();
        graph.compute_rpo();
        let mut selected = self.collect_candidates(graph);
        self.prune(graph, &mut selected);
        if selected.is_empty() {
            return Ok(false);
        }
        self.rewrite(graph, &selected, cx.config.trace_decisions);
        decision!(
            cx,
            candidates = self.stats.candidates,
            narrowed = self.stats.narrowed,
            converters = self.stats.converters_inserted,
            "integer narrowing done"
        );
        Ok(true)
    }
}

/// Whether `id` is a wide operation that computes the same value at 32
/// bits.
fn is_narrowable(graph: &FlowGraph, id: InstrId) -> bool {
    let instr = graph.instr(id);
    let Some(range) = instr.range else {
        return false;
    };
    let op_fits = match instr.op {
        Op::IntBinary {
            op,
            width: IntWidth::Int64,
        } => match op {
            BinaryOp::Add
            | BinaryOp::Sub
            | BinaryOp::Mul
            | BinaryOp::BitAnd
            | BinaryOp::BitOr
            | BinaryOp::BitXor
            | BinaryOp::Shl => true,
            // Right shifts pull in high bits.
            BinaryOp::Shr => graph
                .instr(graph.input(id, 0))
                .range
                .is_some_and(|r| r.is_within(0, UINT32_MAX, graph)),
            BinaryOp::Div | BinaryOp::TruncDiv | BinaryOp::Mod => false,
        },
        Op::IntUnary {
            width: IntWidth::Int64,
            ..
        } => true,
        _ => false,
    };
    op_fits && range.is_within(0, UINT32_MAX, graph)
}

/// Truncating conversion of `def`, placed right after it so it dominates
/// every use of `def`.
fn insert_converter(graph: &mut FlowGraph, def: InstrId) -> InstrId {
    let op = Op::IntConverter {
        from: Repr::Int64,
        to: Repr::Uint32,
    };
    match graph.op(def) {
        Op::Phi => {
            let block = graph.instr(def).block;
            graph.insert_at_start(block, op, &[def])
        }
        _ => graph.insert_after(def, op, &[def]),
    }
}

fn is_shift_count(graph: &FlowGraph, id: InstrId, index: usize) -> bool {
    index == 1 && matches!(graph.op(id), Op::IntBinary { op, .. } if op.is_shift())
}

/// Whether `user` can consume a `uint32` value in `slot`.
fn accepts_uint32(graph: &FlowGraph, selected: &BitSet, user: InstrId, slot: UseSlot) -> bool {
    let UseSlot::Input(index) = slot else {
        return false;
    };
    if selected.contains(user.as_usize()) {
        return !is_shift_count(graph, user, index as usize);
    }
    matches!(
        graph.op(user),
        Op::Box { from: Repr::Int64 } | Op::IntConverter { from: Repr::Int64, .. }
    )
}
