//! Sparse conditional constant propagation.
//!
//! Combines two analyses in one fixed point:
//! - **Constant propagation**: track which definitions always produce the
//!   same value and fold them.
//! - **Reachability**: follow only control edges whose branch condition can
//!   actually select them, so code behind a constant condition is never
//!   evaluated and is deleted afterwards.
//!
//! # Algorithm
//!
//! 1. [`SccpSolver`] runs the two-worklist analysis to a fixed point.
//! 2. The transform applies the result: resolved branches become jumps,
//!    unreached blocks go, single-input phis collapse, cheap constants are
//!    shared, satisfied guards and dead definitions are dropped.
//! 3. Optionally, branches whose arms converge on the same phi-less merge
//!    through empty blocks are removed.
//!
//! # Example
//!
//! ```text
//! // Before:
//! x = 10
//! y = 20
//! z = x + y
//! if z == 30: return z
//! else:       return 0
//!
//! // After:
//! return 30
//! ```

mod branches;
pub mod evaluation;
pub mod lattice;
pub mod solver;
mod transform;

pub use evaluation::ConstEvaluator;
pub use lattice::LatticeValue;
pub use solver::{EdgeExecutability, SccpSolver, SolverResult, SolverStats};

use super::{decision, CompileContext, OptimizationPass};
use crate::error::OptResult;
use crate::hierarchy::ClassHierarchy;
use crate::ir::graph::FlowGraph;

// =============================================================================
// Statistics
// =============================================================================

/// Statistics from the last run.
#[derive(Debug, Clone, Default)]
pub struct SccpStats {
    /// Definitions replaced by a canonical constant.
    pub constants_folded: usize,
    /// Instructions deleted, unreachable or unused.
    pub dead_instrs_removed: usize,
    /// Branches turned into jumps.
    pub branches_simplified: usize,
    /// Unreached blocks deleted.
    pub blocks_removed: usize,
    /// Phis collapsed to their single input.
    pub phis_removed: usize,
    /// Guards proven to pass.
    pub guards_removed: usize,
    /// Branches removed because both arms converge.
    pub redundant_branches: usize,
    /// Solver statistics of the last analysis.
    pub solver: SolverStats,
}

// =============================================================================
// Pass
// =============================================================================

/// The constant propagation pass.
#[derive(Debug, Default)]
pub struct ConstantPropagator {
    stats: SccpStats,
}

impl ConstantPropagator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Statistics from the last run.
    pub fn stats(&self) -> &SccpStats {
        &self.stats
    }

    /// Run the analysis without touching the graph.
    pub fn analyze(&mut self, graph: &FlowGraph, hierarchy: &dyn ClassHierarchy) -> SolverResult {
        let result = SccpSolver::new(graph, hierarchy).solve();
        self.stats.solver = result.stats.clone();
        result
    }

    /// Apply an analysis result. Returns whether the graph changed.
    pub fn transform(&mut self, graph: &mut FlowGraph, result: &SolverResult, trace: bool) -> bool {
        transform::Transformer::new(graph, result, &mut self.stats, trace).apply()
    }

    /// Remove branches whose arms converge on the same phi-less block.
    pub fn eliminate_redundant_branches(&mut self, graph: &mut FlowGraph, trace: bool) -> bool {
        let removed = branches::eliminate_redundant_branches(graph, trace);
        self.stats.redundant_branches += removed;
        removed > 0
    }
}

impl OptimizationPass for ConstantPropagator {
    fn name(&self) -> &'static str {
        "ConstantPropagator"
    }

    fn run(&mut self, graph: &mut FlowGraph, cx: &mut CompileContext<'_>) -> OptResult<bool> {
        self.stats = SccpStats::default();
        let trace = cx.config.trace_decisions;

        let result = self.analyze(graph, cx.hierarchy());
        let mut changed = self.transform(graph, &result, trace);
        if cx.config.eliminate_redundant_branches {
            changed |= self.eliminate_redundant_branches(graph, trace);
        }

        decision!(
            cx,
            folded = self.stats.constants_folded,
            blocks_removed = self.stats.blocks_removed,
            branches = self.stats.branches_simplified,
            "constant propagation done"
        );
        Ok(changed)
    }
}
