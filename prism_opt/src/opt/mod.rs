//! Optimization passes.
//!
//! Every pass implements [`OptimizationPass`] and runs against one
//! [`FlowGraph`] with a [`CompileContext`] carrying the configuration and
//! the frozen class-hierarchy snapshot of the current compile. The fixed
//! pass order lives in [`pipeline`].

/// Emit a rewrite decision when `trace_decisions` is on.
macro_rules! decision {
    ($cx:expr, $($arg:tt)+) => {
        if $cx.config.trace_decisions {
            tracing::debug!($($arg)+);
        }
    };
}

pub(crate) use decision;

pub mod pipeline;
pub mod range;
pub mod sccp;
pub mod specialize;

pub use range::{IntegerNarrowingSelector, RangeAnalysis};
pub use sccp::ConstantPropagator;
pub use specialize::CallSpecializer;

use crate::config::OptConfig;
use crate::error::OptResult;
use crate::hierarchy::{ClassHierarchy, HierarchyDependency};
use crate::ir::graph::FlowGraph;

// =============================================================================
// Pass Trait
// =============================================================================

/// A graph-to-graph rewrite.
pub trait OptimizationPass {
    /// Pass name, used for spans and reports.
    fn name(&self) -> &'static str;

    /// Run the pass. Returns whether the graph changed.
    fn run(&mut self, graph: &mut FlowGraph, cx: &mut CompileContext<'_>) -> OptResult<bool>;
}

// =============================================================================
// Compile Context
// =============================================================================

/// Read-only inputs of one compile plus the facts it came to rely on.
pub struct CompileContext<'a> {
    /// Options for this compile.
    pub config: &'a OptConfig,
    hierarchy: &'a dyn ClassHierarchy,
    dependencies: Vec<HierarchyDependency>,
}

impl std::fmt::Debug for CompileContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompileContext")
            .field("config", self.config)
            .field("dependencies", &self.dependencies)
            .finish()
    }
}

impl<'a> CompileContext<'a> {
    /// Context over a hierarchy snapshot.
    pub fn new(config: &'a OptConfig, hierarchy: &'a dyn ClassHierarchy) -> Self {
        Self {
            config,
            hierarchy,
            dependencies: Vec::new(),
        }
    }

    /// The class hierarchy, frozen for this compile.
    #[inline]
    pub fn hierarchy(&self) -> &'a dyn ClassHierarchy {
        self.hierarchy
    }

    /// Record that the compiled code relies on `dep`.
    pub fn add_dependency(&mut self, dep: HierarchyDependency) {
        if !self.dependencies.contains(&dep) {
            self.dependencies.push(dep);
        }
    }

    /// Facts recorded so far.
    #[inline]
    pub fn dependencies(&self) -> &[HierarchyDependency] {
        &self.dependencies
    }

    /// Take the recorded facts.
    pub fn take_dependencies(&mut self) -> Vec<HierarchyDependency> {
        std::mem::take(&mut self.dependencies)
    }
}
