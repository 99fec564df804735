//! Shared harness: profile a graph in the reference interpreter, optimize
//! it, and run optimized code with recovery into the unoptimized graph.

#![allow(dead_code)]

use prism_opt::hierarchy::ClassTable;
use prism_opt::ir::{FlowGraph, Interpreter, Op, Outcome, Value};
use prism_opt::{optimize, OptConfig, PipelineReport};

use tracing_subscriber::EnvFilter;

/// Route trace output through the test writer. `RUST_LOG=prism_opt=debug`
/// shows pass decisions.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Run `graph` on every argument list with profiling on and fold the
/// collected feedback into its call sites.
pub fn profile(graph: &mut FlowGraph, table: &ClassTable, inputs: &[Vec<Value>]) {
    let mut interp = Interpreter::new(table).with_profiling();
    for args in inputs {
        interp.run(graph, args).expect("profiling run");
    }
    graph.merge_feedback(interp.take_profile());
}

/// Optimize a copy of `graph`.
pub fn optimized(
    graph: &FlowGraph,
    table: &ClassTable,
    config: &OptConfig,
) -> (FlowGraph, PipelineReport) {
    let mut g = graph.clone();
    let report = optimize(&mut g, table, config).expect("optimize");
    (g, report)
}

/// Mnemonics of the live instructions, in block order.
pub fn ops(graph: &FlowGraph) -> Vec<&'static str> {
    graph
        .instrs_in_order()
        .into_iter()
        .map(|i| graph.op(i).mnemonic())
        .collect()
}

pub fn count_op(graph: &FlowGraph, pred: impl Fn(&Op) -> bool) -> usize {
    graph
        .instrs_in_order()
        .into_iter()
        .filter(|&i| pred(graph.op(i)))
        .count()
}

/// A function with an unoptimized and an optimized tier.
///
/// A deoptimizing run is recovered by re-running the unoptimized graph
/// with profiling on; the failure and the new feedback are recorded on the
/// unoptimized graph and the function is recompiled.
pub struct Tiered<'t> {
    pub table: &'t ClassTable,
    pub config: OptConfig,
    pub base: FlowGraph,
    pub code: FlowGraph,
    pub reports: Vec<PipelineReport>,
    pub deopts: usize,
}

impl<'t> Tiered<'t> {
    pub fn compile(base: FlowGraph, table: &'t ClassTable, config: OptConfig) -> Self {
        let (code, report) = optimized(&base, table, &config);
        Self {
            table,
            config,
            base,
            code,
            reports: vec![report],
            deopts: 0,
        }
    }

    /// Run the optimized code, recovering on deoptimization. Panics if the
    /// optimized tier disagrees with the unoptimized one.
    pub fn call(&mut self, args: &[Value]) -> Outcome {
        let expected = Interpreter::new(self.table)
            .run(&self.base, args)
            .expect("unoptimized run");
        let outcome = Interpreter::new(self.table)
            .with_range_checks()
            .run(&self.code, args)
            .unwrap_or_else(|e| panic!("optimized run failed: {e}\n{}", self.code));
        let outcome = match outcome {
            Outcome::Deopt { deopt_id, reason } => {
                self.deopts += 1;
                self.base.record_deopt(deopt_id, reason);
                let mut interp = Interpreter::new(self.table).with_profiling();
                let recovered = interp.run(&self.base, args).expect("recovery run");
                self.base.merge_feedback(interp.take_profile());
                self.recompile();
                recovered
            }
            other => other,
        };
        assert!(
            outcome.same_as(&expected),
            "optimized {outcome:?} differs from unoptimized {expected:?}\n{}",
            self.code
        );
        outcome
    }

    pub fn recompile(&mut self) {
        let (code, report) = optimized(&self.base, self.table, &self.config);
        self.code = code;
        self.reports.push(report);
    }
}

pub fn returned(outcome: Outcome) -> Value {
    match outcome {
        Outcome::Return(v) => v,
        other => panic!("expected a return, got {other:?}"),
    }
}
