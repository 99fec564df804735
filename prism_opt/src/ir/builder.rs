//! Programmatic graph construction.
//!
//! Mirrors what the upstream front end produces: generic dynamic calls with
//! marshaled arguments, one call site and program point per call, and an
//! environment on every call capturing the current frame.
//!
//! # Example
//!
//! ```ignore
//! let mut b = FlowGraphBuilder::new("add", 2);
//! let (x, y) = (b.param(0), b.param(1));
//! let sum = b.call(Selector::Binary(BinaryOp::Add), &[x, y]);
//! b.ret(sum);
//! let graph = b.finish()?;
//! ```

use super::graph::FlowGraph;
use super::instr::{BlockId, DeoptId, InstrId, Op};
use super::types::{ClassId, Literal, Selector};
use super::verify::verify;
use crate::error::{OptError, OptResult};
use crate::feedback::FeedbackRecord;

use rustc_hash::FxHashMap;
use std::sync::Arc;

/// Incremental builder for a [`FlowGraph`].
#[derive(Debug)]
pub struct FlowGraphBuilder {
    graph: FlowGraph,
    current: BlockId,
    /// Values captured by call environments besides the call's operands.
    frame: Vec<InstrId>,
    /// Phi inputs keyed by predecessor, resolved by `finish`.
    pending_phis: FxHashMap<InstrId, Vec<(BlockId, InstrId)>>,
    position: u32,
}

impl FlowGraphBuilder {
    /// Start a graph; the cursor is at the end of the entry block.
    pub fn new(name: &str, num_params: u32) -> Self {
        let graph = FlowGraph::new(name, num_params);
        let current = graph.entry();
        Self {
            graph,
            current,
            frame: Vec::new(),
            pending_phis: FxHashMap::default(),
            position: 0,
        }
    }

    /// Graph under construction.
    #[inline]
    pub fn graph(&self) -> &FlowGraph {
        &self.graph
    }

    /// Graph under construction, mutably.
    #[inline]
    pub fn graph_mut(&mut self) -> &mut FlowGraph {
        &mut self.graph
    }

    /// Parameter `index`.
    pub fn param(&self, index: usize) -> InstrId {
        self.graph.params()[index]
    }

    /// Declare the class of parameter `index`.
    pub fn declare_param(&mut self, index: usize, cid: ClassId) {
        self.graph.set_param_type(index, cid);
    }

    // -------------------------------------------------------------------------
    // Constants
    // -------------------------------------------------------------------------

    /// Canonical constant.
    pub fn constant(&mut self, lit: Literal) -> InstrId {
        self.graph.constant(lit)
    }

    pub fn int(&mut self, v: i64) -> InstrId {
        self.constant(Literal::Int(v))
    }

    pub fn double(&mut self, v: f64) -> InstrId {
        self.constant(Literal::Double(v))
    }

    pub fn bool(&mut self, v: bool) -> InstrId {
        self.constant(Literal::Bool(v))
    }

    pub fn null(&mut self) -> InstrId {
        self.constant(Literal::Null)
    }

    pub fn string(&mut self, s: &str) -> InstrId {
        self.constant(Literal::Str(Arc::from(s)))
    }

    // -------------------------------------------------------------------------
    // Blocks
    // -------------------------------------------------------------------------

    /// Create a block without moving the cursor.
    pub fn new_block(&mut self) -> BlockId {
        self.graph.add_block()
    }

    /// Move the cursor to the end of `block`.
    pub fn switch_to(&mut self, block: BlockId) {
        self.current = block;
    }

    /// Block the cursor is in.
    #[inline]
    pub fn current_block(&self) -> BlockId {
        self.current
    }

    /// Replace the values captured by subsequent call environments.
    pub fn set_frame(&mut self, values: &[InstrId]) {
        self.frame = values.to_vec();
    }

    // -------------------------------------------------------------------------
    // Instructions
    // -------------------------------------------------------------------------

    /// Append any instruction at the cursor.
    pub fn emit(&mut self, op: Op, inputs: &[InstrId]) -> InstrId {
        let id = self.graph.append(self.current, op, inputs);
        self.position += 1;
        self.graph.instr_mut(id).position = self.position;
        id
    }

    /// Phi at the head of the current block. Inputs are attached with
    /// [`FlowGraphBuilder::phi_input`].
    pub fn phi(&mut self) -> InstrId {
        let id = self.graph.insert_at_start(self.current, Op::Phi, &[]);
        self.pending_phis.insert(id, Vec::new());
        id
    }

    /// Value `value` flows into `phi` along the edge from `pred`.
    pub fn phi_input(&mut self, phi: InstrId, pred: BlockId, value: InstrId) {
        self.pending_phis.entry(phi).or_default().push((pred, value));
    }

    /// Generic dynamic call with fresh, empty feedback.
    pub fn call(&mut self, selector: Selector, args: &[InstrId]) -> InstrId {
        self.call_with_feedback(selector, args, FeedbackRecord::new())
    }

    /// Generic dynamic call with pre-recorded feedback.
    pub fn call_with_feedback(
        &mut self,
        selector: Selector,
        args: &[InstrId],
        feedback: FeedbackRecord,
    ) -> InstrId {
        let deopt_id = self.graph.new_deopt_id();
        let site = self.graph.add_site(deopt_id, feedback);
        let pushed: Vec<InstrId> = args
            .iter()
            .map(|&a| self.emit(Op::PushArgument, &[a]))
            .collect();
        let call = self.emit(Op::DynamicCall { selector, site }, &pushed);
        self.graph.instr_mut(call).deopt_id = deopt_id;
        let mut env = self.frame.clone();
        env.extend_from_slice(args);
        self.graph.set_env(call, &env);
        call
    }

    /// `value is ty`, profiled.
    pub fn instance_of(&mut self, value: InstrId, ty: ClassId) -> InstrId {
        let deopt_id = self.graph.new_deopt_id();
        let site = self.graph.add_site(deopt_id, FeedbackRecord::new());
        let id = self.emit(Op::InstanceOf { ty, site: Some(site) }, &[value]);
        self.attach_point(id, deopt_id, &[value]);
        id
    }

    /// `value as ty`, profiled.
    pub fn cast(&mut self, value: InstrId, ty: ClassId) -> InstrId {
        let deopt_id = self.graph.new_deopt_id();
        let site = self.graph.add_site(deopt_id, FeedbackRecord::new());
        let id = self.emit(Op::AssertAssignable { ty, site: Some(site) }, &[value]);
        self.attach_point(id, deopt_id, &[value]);
        id
    }

    fn attach_point(&mut self, id: InstrId, deopt_id: DeoptId, operands: &[InstrId]) {
        self.graph.instr_mut(id).deopt_id = deopt_id;
        let mut env = self.frame.clone();
        env.extend_from_slice(operands);
        self.graph.set_env(id, &env);
    }

    // -------------------------------------------------------------------------
    // Terminators
    // -------------------------------------------------------------------------

    /// Jump to `target`.
    pub fn goto(&mut self, target: BlockId) {
        self.graph.set_goto(self.current, target);
    }

    /// Branch on `cond`.
    pub fn branch(&mut self, cond: InstrId, if_true: BlockId, if_false: BlockId) {
        self.graph.set_branch(self.current, cond, if_true, if_false);
    }

    /// Return `value`.
    pub fn ret(&mut self, value: InstrId) {
        self.graph.set_return(self.current, value);
    }

    /// Resolve phi inputs, order blocks and verify the result.
    pub fn finish(mut self) -> OptResult<FlowGraph> {
        let mut pending: Vec<(InstrId, Vec<(BlockId, InstrId)>)> =
            self.pending_phis.drain().collect();
        pending.sort_by_key(|(phi, _)| *phi);
        for (phi, incoming) in pending {
            let block = self.graph.instr(phi).block;
            let preds: Vec<BlockId> = self.graph.block(block).preds().to_vec();
            for pred in preds {
                let value = incoming
                    .iter()
                    .find(|(p, _)| *p == pred)
                    .map(|&(_, v)| v)
                    .ok_or_else(|| {
                        OptError::MalformedGraph(format!(
                            "phi v{phi} has no input for predecessor B{pred}"
                        ))
                    })?;
                self.graph.add_input(phi, value);
            }
        }
        self.graph.compute_rpo();
        verify(&self.graph)?;
        Ok(self.graph)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::types::{BinaryOp, CmpOp};

    #[test]
    fn test_call_marshals_arguments() {
        let mut b = FlowGraphBuilder::new("f", 2);
        let (x, y) = (b.param(0), b.param(1));
        let call = b.call(Selector::Binary(BinaryOp::Add), &[x, y]);
        b.ret(call);
        let g = b.finish().expect("valid graph");
        let inputs = g.inputs(call);
        assert_eq!(inputs.len(), 2);
        assert!(inputs.iter().all(|&i| matches!(g.op(i), Op::PushArgument)));
        assert_eq!(g.env_values(call).as_slice(), &[x, y]);
        assert!(g.instr(call).deopt_id.is_some());
        assert!(g.site_for_deopt(g.instr(call).deopt_id).is_some());
    }

    #[test]
    fn test_loop_phis_follow_predecessor_order() {
        let mut b = FlowGraphBuilder::new("count", 1);
        let n = b.param(0);
        let zero = b.int(0);
        let one = b.int(1);
        let entry = b.current_block();
        let header = b.new_block();
        let body = b.new_block();
        let exit = b.new_block();
        b.goto(header);

        b.switch_to(header);
        let i = b.phi();
        let cond = b.call(Selector::Compare(CmpOp::Lt), &[i, n]);
        b.branch(cond, body, exit);

        b.switch_to(body);
        let next = b.call(Selector::Binary(BinaryOp::Add), &[i, one]);
        b.goto(header);

        b.switch_to(exit);
        b.ret(i);

        b.phi_input(i, body, next);
        b.phi_input(i, entry, zero);
        let g = b.finish().expect("valid graph");
        assert_eq!(g.block(header).preds(), &[entry, body]);
        assert_eq!(g.inputs(i).as_slice(), &[zero, next]);
    }

    #[test]
    fn test_missing_phi_input_is_rejected() {
        let mut b = FlowGraphBuilder::new("bad", 0);
        let next = b.new_block();
        b.goto(next);
        b.switch_to(next);
        let phi = b.phi();
        b.ret(phi);
        assert!(b.finish().is_err());
    }
}
