//! Structural consistency checks.
//!
//! Run by the pipeline around every pass in debug builds, and by tests
//! after hand-built rewrites.

use super::graph::FlowGraph;
use super::instr::{InstrId, Op, UseSlot};
use crate::error::{OptError, OptResult};

use rustc_hash::FxHashMap;

fn malformed(msg: String) -> OptError {
    OptError::MalformedGraph(msg)
}

/// Check the graph for broken use lists, dangling uses, misplaced phis or
/// terminators, and phi/predecessor arity mismatches.
pub fn verify(graph: &FlowGraph) -> OptResult<()> {
    let mut counted: FxHashMap<InstrId, u32> = FxHashMap::default();

    for &block in graph.rpo() {
        let b = graph.block(block);
        if b.is_removed() {
            return Err(malformed(format!("removed block B{block} is reachable")));
        }
        let instrs = b.instrs();
        let Some(&last) = instrs.last() else {
            return Err(malformed(format!("block B{block} is empty")));
        };
        if !graph.op(last).is_terminator() {
            return Err(malformed(format!("block B{block} does not end in a terminator")));
        }

        let mut seen_non_phi = false;
        for (pos, &id) in instrs.iter().enumerate() {
            let instr = graph.instr(id);
            if instr.is_removed() {
                return Err(malformed(format!("removed v{id} still listed in B{block}")));
            }
            if instr.block != block {
                return Err(malformed(format!("v{id} is in B{block} but claims B{}", instr.block)));
            }
            match instr.op {
                Op::Phi => {
                    if seen_non_phi {
                        return Err(malformed(format!("phi v{id} after a non-phi in B{block}")));
                    }
                    if instr.input_count() != b.preds().len() {
                        return Err(malformed(format!(
                            "phi v{id} has {} inputs for {} predecessors",
                            instr.input_count(),
                            b.preds().len()
                        )));
                    }
                }
                ref op => {
                    seen_non_phi = true;
                    if op.is_terminator() && pos + 1 != instrs.len() {
                        return Err(malformed(format!("terminator v{id} is not last in B{block}")));
                    }
                }
            }

            for (i, &u) in instr.inputs.iter().enumerate() {
                let record = graph.use_record(u);
                if !record.live || record.user != id || record.slot != UseSlot::Input(i as u16) {
                    return Err(malformed(format!("operand {i} of v{id} has a stale use record")));
                }
                if graph.instr(record.def).is_removed() {
                    return Err(OptError::DanglingUse {
                        def: record.def,
                        user: id,
                    });
                }
                *counted.entry(record.def).or_default() += 1;
            }
            for (i, u) in graph.env_use_ids(id).into_iter().enumerate() {
                let record = graph.use_record(u);
                if !record.live || record.user != id || record.slot != UseSlot::Env(i as u16) {
                    return Err(malformed(format!("environment slot {i} of v{id} is stale")));
                }
                if graph.instr(record.def).is_removed() {
                    return Err(OptError::DanglingUse {
                        def: record.def,
                        user: id,
                    });
                }
                *counted.entry(record.def).or_default() += 1;
            }
        }

        for succ in graph.successors(block) {
            let expected = graph.successors(block).iter().filter(|&&s| s == succ).count();
            let recorded = graph.block(succ).preds().iter().filter(|&&p| p == block).count();
            if expected != recorded {
                return Err(malformed(format!(
                    "edge B{block} -> B{succ} missing from predecessors"
                )));
            }
        }
        for &pred in b.preds() {
            if graph.rpo_number(pred).is_some() && !graph.successors(pred).contains(&block) {
                return Err(malformed(format!("B{pred} listed as predecessor of B{block}")));
            }
        }
    }

    for (&def, &n) in &counted {
        if graph.use_count(def) < n || graph.uses(def).count() as u32 != graph.use_count(def) {
            return Err(malformed(format!("use list of v{def} is out of sync")));
        }
    }
    Ok(())
}
