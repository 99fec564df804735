//! Call-site specialization.
//!
//! Rewrites generic dynamic calls, type tests and casts into typed,
//! guarded operations using the call site's recorded feedback and whatever
//! the graph proves statically about the operands.
//!
//! # Strategy
//!
//! For every call, in program order:
//!
//! 1. operator selectors try the typed numeric, comparison, equality and
//!    container rewrites ([`arith`], [`access`]);
//! 2. any selector tries devirtualization: a single resolved target becomes
//!    a direct call or an inlined accessor ([`dispatch`]);
//! 3. what is left becomes an ordered multi-target dispatch, if the site has
//!    feedback at all.
//!
//! Type tests and casts go through [`types`].
//!
//! # Guards
//!
//! ```text
//!   v = DynamicCall<+>(push a, push b)       CheckSmi(a)
//!                                      ==>   CheckSmi(b)
//!                                            v = IntBinary<+, Smi>(a, b)
//! ```
//!
//! Guards are inserted immediately before the call, share its deopt id and
//! copy its environment, so a failing guard recovers at the call itself.
//! Operands whose class is proven statically get no guard. A kind of guard
//! that already failed at the site (its reason is recorded in the feedback)
//! is not inserted again; the rewrite widens instead, or falls back.
//!
//! Without speculation (`OptConfig::speculative == false`) nothing that can
//! deoptimize is inserted. Rewrites then use slow-path forms
//! (`CheckedSmiOp`, `CheckedSmiCompare`, `PolymorphicCall` with a dynamic
//! fallback) or rely on statically proven classes.

mod access;
mod arith;
mod dispatch;
mod types;

use super::{decision, CompileContext, OptimizationPass};
use crate::error::OptResult;
use crate::feedback::{DeoptReasons, FeedbackRecord};
use crate::hierarchy::ClassHierarchy;
use crate::ir::graph::FlowGraph;
use crate::ir::instr::{DeoptId, InstrFlags, InstrId, Op};
use crate::ir::types::{BinaryOp, ClassId, IntWidth, Literal, Selector, SMI_MAX};

use smallvec::{smallvec, SmallVec};
use std::sync::Arc;

/// Classes an operand may have.
pub(crate) type Cids = SmallVec<[ClassId; 4]>;

/// Depth limit when deriving classes through phis.
const MAX_PHI_DEPTH: u32 = 4;

pub(crate) const SMI_ONLY: &[ClassId] = &[ClassId::SMI];
pub(crate) const INTS: &[ClassId] = &[ClassId::SMI, ClassId::MINT];
pub(crate) const NUMBERS: &[ClassId] = &[ClassId::SMI, ClassId::MINT, ClassId::DOUBLE];
pub(crate) const DOUBLE_ONLY: &[ClassId] = &[ClassId::DOUBLE];

// =============================================================================
// Statistics
// =============================================================================

/// Statistics from the last run.
#[derive(Debug, Clone, Default)]
pub struct SpecializeStats {
    /// Dynamic calls examined.
    pub calls_seen: usize,
    /// Calls rewritten to typed arithmetic.
    pub arithmetic: usize,
    /// Calls rewritten to typed comparisons or identity tests.
    pub comparisons: usize,
    /// Calls rewritten to container accesses.
    pub accesses: usize,
    /// Calls rewritten to a direct call.
    pub devirtualized: usize,
    /// Calls replaced by an inlined accessor or constant.
    pub accessors_inlined: usize,
    /// Calls rewritten to an ordered multi-target dispatch.
    pub polymorphic: usize,
    /// Type tests and casts simplified.
    pub type_tests: usize,
    /// Guards inserted.
    pub guards_inserted: usize,
    /// Argument marshaling instructions deleted.
    pub pushes_pruned: usize,
    /// Calls left generic.
    pub left_generic: usize,
}

// =============================================================================
// Call Description
// =============================================================================

/// A dynamic call being specialized.
#[derive(Debug, Clone)]
pub(crate) struct CallInfo {
    pub call: InstrId,
    pub selector: Selector,
    /// Operands with argument marshaling skipped, receiver first.
    pub args: SmallVec<[InstrId; 3]>,
    /// Marshaling instructions feeding the call.
    pub pushes: SmallVec<[InstrId; 3]>,
    pub feedback: FeedbackRecord,
    pub deopt_id: DeoptId,
}

impl CallInfo {
    fn new(graph: &FlowGraph, call: InstrId) -> Option<Self> {
        let Op::DynamicCall { selector, site } = graph.op(call) else {
            return None;
        };
        let pushes = graph.inputs(call);
        Some(Self {
            call,
            selector: selector.clone(),
            args: pushes.iter().map(|&p| graph.unwrap_argument(p)).collect(),
            pushes: pushes.into_iter().collect(),
            feedback: graph.site(*site).feedback.clone(),
            deopt_id: graph.instr(call).deopt_id,
        })
    }
}

/// What is known about the class of one operand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct OperandClasses {
    pub cids: Cids,
    /// Known from the graph; no guard needed.
    pub proven: bool,
}

impl OperandClasses {
    /// Whether every class is in `allowed`. False when nothing is known.
    pub fn within(&self, allowed: &[ClassId]) -> bool {
        !self.cids.is_empty() && self.cids.iter().all(|c| allowed.contains(c))
    }

    pub fn includes(&self, cid: ClassId) -> bool {
        self.cids.contains(&cid)
    }

    /// Whether a guard for `allowed` would be redundant.
    pub fn satisfies(&self, allowed: &[ClassId]) -> bool {
        self.proven && self.within(allowed)
    }
}

/// Guard kind used to restrict a value to `allowed`.
fn guard_op(allowed: &[ClassId]) -> Op {
    if allowed == SMI_ONLY {
        Op::CheckSmi
    } else {
        Op::CheckClass {
            cids: Arc::from(allowed),
        }
    }
}

/// Classes `v` can have, as far as the graph proves.
pub(crate) fn static_cids(
    graph: &FlowGraph,
    hierarchy: &dyn ClassHierarchy,
    v: InstrId,
) -> Option<Cids> {
    static_cids_at(graph, hierarchy, v, 0)
}

fn static_cids_at(
    graph: &FlowGraph,
    hierarchy: &dyn ClassHierarchy,
    v: InstrId,
    depth: u32,
) -> Option<Cids> {
    let ints = || -> Cids { INTS.iter().copied().collect() };
    Some(match graph.op(v) {
        Op::Constant(lit) => smallvec![lit.class_id()],
        Op::Parameter(i) => {
            let declared = graph.param_type(*i as usize)?;
            let cids: Cids = hierarchy.concrete_subtypes(declared).into_iter().collect();
            if cids.is_empty() {
                return None;
            }
            cids
        }
        Op::PushArgument | Op::Constraint { .. } => {
            static_cids_at(graph, hierarchy, graph.input(v, 0), depth)?
        }
        Op::AssertAssignable { ty, .. } => {
            let declared: Cids = hierarchy.concrete_subtypes(*ty).into_iter().collect();
            let narrowed: Cids = match static_cids_at(graph, hierarchy, graph.input(v, 0), depth) {
                Some(inner) => inner.into_iter().filter(|c| declared.contains(c)).collect(),
                None => declared,
            };
            if narrowed.is_empty() {
                return None;
            }
            narrowed
        }
        Op::IntBinary {
            width: IntWidth::Smi,
            ..
        }
        | Op::IntUnary {
            width: IntWidth::Smi,
            ..
        } => smallvec![ClassId::SMI],
        Op::IntBinary { .. }
        | Op::IntUnary { .. }
        | Op::Box { .. }
        | Op::Unbox { .. }
        | Op::IntConverter { .. } => ints(),
        Op::ShiftMask { mask } if (0..=SMI_MAX).contains(mask) => smallvec![ClassId::SMI],
        Op::ShiftMask { .. } => ints(),
        Op::DoubleBinary { op } if *op != BinaryOp::TruncDiv => smallvec![ClassId::DOUBLE],
        Op::DoubleNegate => smallvec![ClassId::DOUBLE],
        Op::SimdBinary { kind, .. } => smallvec![kind.class_id()],
        Op::IntCompare { .. }
        | Op::DoubleCompare { .. }
        | Op::StrictCompare { .. }
        | Op::InstanceOf { .. }
        | Op::TestCids { .. } => smallvec![ClassId::BOOL],
        Op::LoadLength | Op::LoadClassId | Op::StringToCharCode => smallvec![ClassId::SMI],
        Op::AllocateObject { class } => smallvec![*class],
        Op::Phi if depth < MAX_PHI_DEPTH => {
            let mut out = Cids::new();
            for input in graph.inputs(v) {
                if input == v {
                    continue;
                }
                for cid in static_cids_at(graph, hierarchy, input, depth + 1)? {
                    if !out.contains(&cid) {
                        out.push(cid);
                    }
                }
            }
            if out.is_empty() {
                return None;
            }
            out
        }
        _ => return None,
    })
}

// =============================================================================
// Pass
// =============================================================================

/// The call-site specialization pass.
#[derive(Debug, Default)]
pub struct CallSpecializer {
    stats: SpecializeStats,
}

impl CallSpecializer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Statistics from the last run.
    pub fn stats(&self) -> &SpecializeStats {
        &self.stats
    }
}

impl OptimizationPass for CallSpecializer {
    fn name(&self) -> &'static str {
        "CallSpecializer"
    }

    fn run(&mut self, graph: &mut FlowGraph, cx: &mut CompileContext<'_>) -> OptResult<bool> {
        self.stats = SpecializeStats::default();
        let mut rewriter = Rewriter {
            graph,
            cx,
            stats: &mut self.stats,
        };
        let mut changed = false;
        for id in rewriter.graph.instrs_in_order() {
            if rewriter.graph.instr(id).is_removed() {
                continue;
            }
            changed |= match rewriter.graph.op(id) {
                Op::DynamicCall { .. } => rewriter.specialize_call(id),
                Op::InstanceOf { .. } => rewriter.try_instance_of(id),
                Op::AssertAssignable { .. } => rewriter.try_cast(id),
                _ => false,
            };
        }
        decision!(
            cx,
            calls = self.stats.calls_seen,
            generic = self.stats.left_generic,
            guards = self.stats.guards_inserted,
            "call specialization done"
        );
        Ok(changed)
    }
}

// =============================================================================
// Rewriter
// =============================================================================

/// Graph editing state shared by the rewrite rules.
pub(crate) struct Rewriter<'r, 'a> {
    pub graph: &'r mut FlowGraph,
    pub cx: &'r mut CompileContext<'a>,
    pub stats: &'r mut SpecializeStats,
}

impl Rewriter<'_, '_> {
    fn specialize_call(&mut self, call: InstrId) -> bool {
        let Some(mut info) = CallInfo::new(self.graph, call) else {
            return false;
        };
        self.stats.calls_seen += 1;
        if info.selector.arity().is_some_and(|n| n != info.args.len()) {
            self.stats.left_generic += 1;
            return false;
        }
        self.guess_untested_types(&mut info);

        let rewritten = match info.selector {
            Selector::Binary(op) => self.try_binary_op(&info, op),
            Selector::Compare(op) => self.try_equality(&info, op) || self.try_compare(&info, op),
            Selector::Unary(op) => self.try_unary_op(&info, op),
            Selector::Length => self.try_length(&info),
            Selector::Index => self.try_index(&info),
            Selector::IndexSet => self.try_index_set(&info),
            Selector::Named(_) => false,
        };
        if rewritten || self.try_devirtualize(&info) || self.polymorphic_fallback(&info) {
            return true;
        }
        self.stats.left_generic += 1;
        false
    }

    /// Whether a speculation that fails with `reason` may be installed at
    /// this site.
    pub fn may_speculate(&self, info: &CallInfo, reason: DeoptReasons) -> bool {
        self.cx.config.speculative && !info.feedback.has_deopt_reason(reason)
    }

    /// Classes of operand `arg`: from the graph when proven, from feedback
    /// otherwise.
    pub fn classes(&self, info: &CallInfo, arg: usize) -> OperandClasses {
        match info.args.get(arg).and_then(|&v| static_cids(self.graph, self.cx.hierarchy(), v)) {
            Some(cids) => OperandClasses { cids, proven: true },
            None => OperandClasses {
                cids: info.feedback.cids_at(arg),
                proven: false,
            },
        }
    }

    /// An untested operator call with one operand statically a Smi or a
    /// double is assumed to see that class on both sides.
    fn guess_untested_types(&mut self, info: &mut CallInfo) {
        if !self.cx.config.guess_untested_types
            || !info.feedback.is_empty()
            || !matches!(info.selector, Selector::Binary(_) | Selector::Compare(_))
        {
            return;
        }
        let hierarchy = self.cx.hierarchy();
        let guess = info
            .args
            .iter()
            .filter_map(|&a| static_cids(self.graph, hierarchy, a))
            .find_map(|cids| match cids.as_slice() {
                [c @ (ClassId::SMI | ClassId::DOUBLE)] => Some(*c),
                _ => None,
            });
        if let Some(cid) = guess {
            decision!(self.cx, call = %info.call, guess = %cid, "guessed untested operand classes");
            let target = hierarchy.lookup(cid, &info.selector);
            info.feedback.record(&[cid, cid], target);
        }
    }

    // -------------------------------------------------------------------------
    // Emission
    // -------------------------------------------------------------------------

    /// Insert `op` before `anchor` at the anchor's program point. Only
    /// instructions that can deoptimize receive an environment.
    pub fn emit_before(&mut self, anchor: InstrId, op: Op, inputs: &[InstrId]) -> InstrId {
        let id = self.graph.insert_before(anchor, op, inputs);
        let (deopt_id, position) = {
            let a = self.graph.instr(anchor);
            (a.deopt_id, a.position)
        };
        let instr = self.graph.instr_mut(id);
        instr.deopt_id = deopt_id;
        instr.position = position;
        instr.flags.insert(InstrFlags::SYNTHETIC);
        if self.graph.op(id).can_deoptimize() {
            self.graph.copy_env(anchor, id);
        }
        id
    }

    /// Emit at the call.
    pub fn emit(&mut self, info: &CallInfo, op: Op, inputs: &[InstrId]) -> InstrId {
        self.emit_before(info.call, op, inputs)
    }

    /// Restrict each listed operand to its class set, inserting guards only
    /// where the class is not proven. Nothing is inserted, and false is
    /// returned, if a needed guard already failed at this site or
    /// speculation is off.
    pub fn try_guard(&mut self, info: &CallInfo, checks: &[(usize, &[ClassId])]) -> bool {
        let mut needed: SmallVec<[(InstrId, &[ClassId]); 3]> = SmallVec::new();
        for &(arg, allowed) in checks {
            if self.classes(info, arg).satisfies(allowed) {
                continue;
            }
            if !self.may_speculate(info, guard_op(allowed).deopt_reason()) {
                return false;
            }
            needed.push((info.args[arg], allowed));
        }
        for (value, allowed) in needed {
            self.guard_value(info.call, value, allowed);
        }
        true
    }

    /// Unconditionally guard `value` against `allowed` at `anchor`.
    pub fn guard_value(&mut self, anchor: InstrId, value: InstrId, allowed: &[ClassId]) {
        self.emit_before(anchor, guard_op(allowed), &[value]);
        self.stats.guards_inserted += 1;
    }

    /// Redirect every use of the call to `value` and delete the call with
    /// its marshaling.
    pub fn replace_call(&mut self, info: &CallInfo, value: InstrId) {
        decision!(
            self.cx,
            call = %info.call,
            selector = %info.selector,
            replacement = %self.graph.op(value),
            "specialized call"
        );
        self.graph.replace_all_uses(info.call, value);
        self.graph.remove_instr(info.call);
        self.prune_push_arguments(info);
    }

    /// Replace a call whose result is `null`.
    pub fn replace_call_with_null(&mut self, info: &CallInfo) {
        let null = self.graph.constant(Literal::Null);
        self.replace_call(info, null);
    }

    /// Delete marshaling instructions of a rewritten call that nothing else
    /// reads.
    pub fn prune_push_arguments(&mut self, info: &CallInfo) {
        for &push in &info.pushes {
            if !self.graph.instr(push).is_removed() && !self.graph.has_uses(push) {
                self.graph.remove_instr(push);
                self.stats.pushes_pruned += 1;
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::OptConfig;
    use crate::hierarchy::ClassTable;
    use crate::ir::builder::FlowGraphBuilder;
    use crate::ir::verify::verify;

    /// Run the specializer over `graph` and check the result is consistent.
    pub(crate) fn specialize(
        graph: &mut FlowGraph,
        table: &dyn ClassHierarchy,
        config: &OptConfig,
    ) -> SpecializeStats {
        let mut cx = CompileContext::new(config, table);
        let mut pass = CallSpecializer::new();
        pass.run(graph, &mut cx).expect("pass succeeds");
        verify(graph).expect("consistent graph");
        pass.stats().clone()
    }

    /// Mnemonics of the live non-constant instructions, in order.
    pub(crate) fn ops(graph: &FlowGraph) -> Vec<&'static str> {
        graph
            .instrs_in_order()
            .into_iter()
            .map(|i| graph.op(i).mnemonic())
            .filter(|m| !matches!(*m, "Constant" | "Parameter"))
            .collect()
    }

    #[test]
    fn test_static_classes() {
        let table = ClassTable::new();
        let mut b = FlowGraphBuilder::new("f", 2);
        b.declare_param(0, ClassId::INT);
        let (x, y) = (b.param(0), b.param(1));
        let c = b.double(1.5);
        b.ret(x);
        let g = b.finish().expect("valid graph");
        assert_eq!(static_cids(&g, &table, x).as_deref(), Some(INTS));
        assert_eq!(static_cids(&g, &table, y), None);
        assert_eq!(static_cids(&g, &table, c).as_deref(), Some(DOUBLE_ONLY));
    }

    #[test]
    fn test_phi_classes_are_the_union() {
        let table = ClassTable::new();
        let mut b = FlowGraphBuilder::new("f", 1);
        let x = b.param(0);
        let cond = b.emit(Op::InstanceOf { ty: ClassId::INT, site: None }, &[x]);
        let (yes, no, join) = (b.new_block(), b.new_block(), b.new_block());
        b.branch(cond, yes, no);
        b.switch_to(yes);
        b.goto(join);
        b.switch_to(no);
        b.goto(join);
        b.switch_to(join);
        let phi = b.phi();
        b.ret(phi);
        let (one, half) = (b.int(1), b.double(0.5));
        b.phi_input(phi, yes, one);
        b.phi_input(phi, no, half);
        let g = b.finish().expect("valid graph");
        assert_eq!(
            static_cids(&g, &table, phi).as_deref(),
            Some(&[ClassId::SMI, ClassId::DOUBLE][..])
        );
        assert_eq!(static_cids(&g, &table, cond).as_deref(), Some(&[ClassId::BOOL][..]));
    }

    #[test]
    fn test_calls_without_feedback_stay_generic() {
        let table = ClassTable::new();
        let mut b = FlowGraphBuilder::new("f", 2);
        let (x, y) = (b.param(0), b.param(1));
        let call = b.call(Selector::named("frob"), &[x, y]);
        b.ret(call);
        let mut g = b.finish().expect("valid graph");
        let stats = specialize(&mut g, &table, &OptConfig::default());
        assert_eq!(stats.left_generic, 1);
        assert!(!g.instr(call).is_removed());
    }

    #[test]
    fn test_pushes_are_pruned_with_the_call() {
        let table = ClassTable::new();
        let mut b = FlowGraphBuilder::new("f", 2);
        let (x, y) = (b.param(0), b.param(1));
        let fb = FeedbackRecord::new().with(&[ClassId::SMI, ClassId::SMI], None, 10);
        let sum = b.call_with_feedback(Selector::Binary(BinaryOp::Add), &[x, y], fb);
        b.ret(sum);
        let mut g = b.finish().expect("valid graph");
        let stats = specialize(&mut g, &table, &OptConfig::default());
        assert_eq!(stats.pushes_pruned, 2);
        assert!(!ops(&g).contains(&"PushArgument"));
    }
}
