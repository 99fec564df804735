//! Optimization pipeline.
//!
//! Runs the passes in their fixed order over one graph:
//!
//! ```text
//! CallSpecializer → ConstantPropagator → RangeAnalysis
//!                                          │ (an edge proved dead)
//!                                          ▼
//!                                   ConstantPropagator → IntegerNarrowingSelector
//! ```
//!
//! Later passes rely on earlier ones: constant propagation cleans up after
//! specialization, range analysis reads the typed integer operations the
//! specializer produced, and narrowing reads the ranges left behind by range
//! analysis.

use std::time::{Duration, Instant};

use super::range::{IntegerNarrowingSelector, NarrowingStats, RangeAnalysis, RangeStats};
use super::sccp::{ConstantPropagator, SccpStats};
use super::specialize::{CallSpecializer, SpecializeStats};
use super::{CompileContext, OptimizationPass};
use crate::config::OptConfig;
use crate::error::OptResult;
use crate::hierarchy::{ClassHierarchy, HierarchyDependency};
use crate::ir::graph::FlowGraph;

use tracing::{debug, debug_span};

// =============================================================================
// Pass Records
// =============================================================================

/// Statistics of one pass run, by pass.
#[derive(Debug, Clone)]
pub enum PassStats {
    Specialize(SpecializeStats),
    ConstProp(SccpStats),
    Range(RangeStats),
    Narrowing(NarrowingStats),
}

/// One pass run.
#[derive(Debug, Clone)]
pub struct PassRecord {
    /// Pass name.
    pub name: &'static str,
    /// Whether the pass changed the graph.
    pub changed: bool,
    /// Time spent in the pass, verification excluded.
    pub time: Duration,
    pub stats: PassStats,
}

// =============================================================================
// Report
// =============================================================================

/// Result of a pipeline run.
#[derive(Debug, Clone, Default)]
pub struct PipelineReport {
    /// Pass runs in execution order.
    pub passes: Vec<PassRecord>,
    /// Hierarchy facts the optimized graph relies on.
    pub dependencies: Vec<HierarchyDependency>,
    /// Live instructions before the first pass.
    pub initial_size: usize,
    /// Live instructions after the last pass.
    pub final_size: usize,
    /// Total time spent.
    pub total_time: Duration,
}

impl PipelineReport {
    /// Whether any pass changed the graph.
    pub fn changed(&self) -> bool {
        self.passes.iter().any(|p| p.changed)
    }

    /// Runs of the named pass.
    pub fn runs_of<'r>(&'r self, name: &'r str) -> impl Iterator<Item = &'r PassRecord> + 'r {
        self.passes.iter().filter(move |p| p.name == name)
    }

    /// Statistics of the last specializer run.
    pub fn specialize_stats(&self) -> Option<&SpecializeStats> {
        self.passes.iter().rev().find_map(|p| match &p.stats {
            PassStats::Specialize(s) => Some(s),
            _ => None,
        })
    }

    /// Statistics of every constant propagator run.
    pub fn const_prop_stats(&self) -> impl Iterator<Item = &SccpStats> {
        self.passes.iter().filter_map(|p| match &p.stats {
            PassStats::ConstProp(s) => Some(s),
            _ => None,
        })
    }

    /// Statistics of the last range analysis run.
    pub fn range_stats(&self) -> Option<&RangeStats> {
        self.passes.iter().rev().find_map(|p| match &p.stats {
            PassStats::Range(s) => Some(s),
            _ => None,
        })
    }

    /// Statistics of the last narrowing run.
    pub fn narrowing_stats(&self) -> Option<&NarrowingStats> {
        self.passes.iter().rev().find_map(|p| match &p.stats {
            PassStats::Narrowing(s) => Some(s),
            _ => None,
        })
    }

    /// Live-size ratio after / before.
    pub fn size_ratio(&self) -> f64 {
        if self.initial_size == 0 {
            1.0
        } else {
            self.final_size as f64 / self.initial_size as f64
        }
    }
}

// =============================================================================
// Pipeline
// =============================================================================

/// Optimize `graph` in place.
///
/// `hierarchy` must stay unchanged for the duration of the call. On error
/// the graph may be partially rewritten; callers that need to fall back keep
/// a clone of the input.
pub fn optimize(
    graph: &mut FlowGraph,
    hierarchy: &dyn ClassHierarchy,
    config: &OptConfig,
) -> OptResult<PipelineReport> {
    let span = debug_span!("optimize", function = graph.name());
    let _enter = span.enter();
    let start = Instant::now();

    graph.compute_rpo();
    let mut report = PipelineReport {
        initial_size: live_size(graph),
        ..PipelineReport::default()
    };
    let mut cx = CompileContext::new(config, hierarchy);

    let mut specializer = CallSpecializer::new();
    run_pass(graph, &mut cx, &mut specializer, &mut report, |p| {
        PassStats::Specialize(p.stats().clone())
    })?;

    let mut const_prop = ConstantPropagator::new();
    run_pass(graph, &mut cx, &mut const_prop, &mut report, |p| {
        PassStats::ConstProp(p.stats().clone())
    })?;

    let mut range = RangeAnalysis::new();
    run_pass(graph, &mut cx, &mut range, &mut report, |p| PassStats::Range(p.stats().clone()))?;
    if range.found_unreachable() {
        debug!("range analysis pruned an edge; re-running constant propagation");
        run_pass(graph, &mut cx, &mut const_prop, &mut report, |p| {
            PassStats::ConstProp(p.stats().clone())
        })?;
    }

    let mut narrowing = IntegerNarrowingSelector::new();
    run_pass(graph, &mut cx, &mut narrowing, &mut report, |p| {
        PassStats::Narrowing(p.stats().clone())
    })?;

    report.final_size = live_size(graph);
    report.dependencies = cx.take_dependencies();
    report.total_time = start.elapsed();
    debug!(
        initial = report.initial_size,
        final_size = report.final_size,
        dependencies = report.dependencies.len(),
        "optimization done"
    );
    Ok(report)
}

fn run_pass<P: OptimizationPass>(
    graph: &mut FlowGraph,
    cx: &mut CompileContext<'_>,
    pass: &mut P,
    report: &mut PipelineReport,
    stats: impl FnOnce(&P) -> PassStats,
) -> OptResult<()> {
    let name = pass.name();
    let span = debug_span!("pass", name);
    let _enter = span.enter();

    graph.compute_rpo();
    check(graph)?;
    let start = Instant::now();
    let changed = pass.run(graph, cx)?;
    let time = start.elapsed();
    graph.compute_rpo();
    check(graph)?;

    debug!(changed, ?time, "pass done");
    report.passes.push(PassRecord {
        name,
        changed,
        time,
        stats: stats(pass),
    });
    Ok(())
}

/// Structural verification, debug builds only.
fn check(graph: &FlowGraph) -> OptResult<()> {
    if cfg!(debug_assertions) {
        crate::ir::verify::verify(graph)?;
    }
    Ok(())
}

fn live_size(graph: &FlowGraph) -> usize {
    graph.instrs_in_order().len()
}
