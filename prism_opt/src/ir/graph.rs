//! The flow graph of one function.
//!
//! Blocks hold ordered instruction lists: phis first, the terminator last.
//! Every operand and every environment entry is a [`Use`] linked into the
//! use list of the definition it reads, so replacing a definition or
//! enumerating its consumers never scans the graph.
//!
//! Structural edits invalidate the block order; passes that depend on
//! dominance call [`FlowGraph::compute_rpo`] after editing control flow.

use super::arena::{Arena, BitSet, SecondaryMap};
use super::instr::{
    BlockId, DeoptId, Env, EnvId, Instr, InstrFlags, InstrId, Op, SiteId, Use, UseId, UseSlot,
};
use super::types::{ClassId, Literal};
use crate::feedback::{CallSite, DeoptReasons, FeedbackRecord};

use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use std::fmt;
use std::sync::Arc;

// =============================================================================
// Blocks
// =============================================================================

bitflags::bitflags! {
    /// Block state bits.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct BlockFlags: u8 {
        /// Detached from the graph.
        const REMOVED = 0b0000_0001;
    }
}

/// A basic block.
#[derive(Debug, Clone, Default)]
pub struct Block {
    pub(crate) instrs: Vec<InstrId>,
    pub(crate) preds: SmallVec<[BlockId; 2]>,
    pub flags: BlockFlags,
}

impl Block {
    /// Instructions in execution order.
    #[inline]
    pub fn instrs(&self) -> &[InstrId] {
        &self.instrs
    }

    /// Predecessors. Phi input `i` flows in from `preds()[i]`.
    #[inline]
    pub fn preds(&self) -> &[BlockId] {
        &self.preds
    }

    /// Whether the block was removed.
    #[inline]
    pub fn is_removed(&self) -> bool {
        self.flags.contains(BlockFlags::REMOVED)
    }
}

// =============================================================================
// Use Iteration
// =============================================================================

/// Iterator over the use list of one definition.
#[derive(Debug)]
pub struct UseIter<'g> {
    graph: &'g FlowGraph,
    next: Option<UseId>,
}

impl<'g> Iterator for UseIter<'g> {
    type Item = (UseId, &'g Use);

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.next?;
        let u = &self.graph.uses[id];
        self.next = u.next;
        Some((id, u))
    }
}

// =============================================================================
// Flow Graph
// =============================================================================

/// SSA control-flow graph for one function.
#[derive(Debug, Clone)]
pub struct FlowGraph {
    name: Arc<str>,
    blocks: Arena<Block>,
    instrs: Arena<Instr>,
    uses: Arena<Use>,
    envs: Arena<Env>,
    use_heads: SecondaryMap<Instr, Option<UseId>>,
    use_counts: SecondaryMap<Instr, u32>,
    free_uses: Vec<UseId>,
    entry: BlockId,
    rpo: Vec<BlockId>,
    rpo_index: SecondaryMap<Block, Option<u32>>,
    constants: FxHashMap<Literal, InstrId>,
    params: Vec<InstrId>,
    param_types: Vec<Option<ClassId>>,
    sites: Arena<CallSite>,
    site_by_deopt: FxHashMap<DeoptId, SiteId>,
    next_deopt_id: u32,
}

impl FlowGraph {
    /// Create a graph with an entry block holding `num_params` parameters.
    pub fn new(name: &str, num_params: u32) -> Self {
        let mut blocks = Arena::new();
        let entry = blocks.alloc(Block::default());
        let mut graph = Self {
            name: Arc::from(name),
            blocks,
            instrs: Arena::new(),
            uses: Arena::new(),
            envs: Arena::new(),
            use_heads: SecondaryMap::new(),
            use_counts: SecondaryMap::new(),
            free_uses: Vec::new(),
            entry,
            rpo: Vec::new(),
            rpo_index: SecondaryMap::new(),
            constants: FxHashMap::default(),
            params: Vec::with_capacity(num_params as usize),
            param_types: vec![None; num_params as usize],
            sites: Arena::new(),
            site_by_deopt: FxHashMap::default(),
            next_deopt_id: 0,
        };
        for i in 0..num_params {
            let p = graph.append(entry, Op::Parameter(i), &[]);
            graph.params.push(p);
        }
        graph.compute_rpo();
        graph
    }

    /// Function name.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Entry block.
    #[inline]
    pub fn entry(&self) -> BlockId {
        self.entry
    }

    // -------------------------------------------------------------------------
    // Accessors
    // -------------------------------------------------------------------------

    /// Get a block.
    #[inline]
    pub fn block(&self, id: BlockId) -> &Block {
        &self.blocks[id]
    }

    /// Number of blocks ever created.
    #[inline]
    pub fn block_capacity(&self) -> usize {
        self.blocks.len()
    }

    /// Live blocks in creation order.
    pub fn blocks(&self) -> impl Iterator<Item = (BlockId, &Block)> {
        self.blocks.iter().filter(|(_, b)| !b.is_removed())
    }

    /// Get an instruction.
    #[inline]
    pub fn instr(&self, id: InstrId) -> &Instr {
        &self.instrs[id]
    }

    /// Get an instruction mutably.
    #[inline]
    pub fn instr_mut(&mut self, id: InstrId) -> &mut Instr {
        &mut self.instrs[id]
    }

    /// Operator of an instruction.
    #[inline]
    pub fn op(&self, id: InstrId) -> &Op {
        &self.instrs[id].op
    }

    /// Number of instructions ever created.
    #[inline]
    pub fn instr_capacity(&self) -> usize {
        self.instrs.len()
    }

    /// Definition read by operand `index` of `id`.
    #[inline]
    pub fn input(&self, id: InstrId, index: usize) -> InstrId {
        self.uses[self.instrs[id].inputs[index]].def
    }

    /// All operand definitions of `id`.
    pub fn inputs(&self, id: InstrId) -> SmallVec<[InstrId; 4]> {
        self.instrs[id]
            .inputs
            .iter()
            .map(|&u| self.uses[u].def)
            .collect()
    }

    /// Parameter instructions in order.
    #[inline]
    pub fn params(&self) -> &[InstrId] {
        &self.params
    }

    /// Declared class of parameter `index`.
    pub fn param_type(&self, index: usize) -> Option<ClassId> {
        self.param_types.get(index).copied().flatten()
    }

    /// Declare the class of parameter `index`. Callers must only pass
    /// instances of `cid` (or its subtypes).
    pub fn set_param_type(&mut self, index: usize, cid: ClassId) {
        if let Some(slot) = self.param_types.get_mut(index) {
            *slot = Some(cid);
        }
    }

    /// Literal of a constant instruction.
    pub fn literal(&self, id: InstrId) -> Option<&Literal> {
        match &self.instrs[id].op {
            Op::Constant(lit) => Some(lit),
            _ => None,
        }
    }

    /// Value of an integer constant instruction.
    pub fn int_constant_value(&self, id: InstrId) -> Option<i64> {
        self.literal(id).and_then(Literal::as_int)
    }

    /// Skip through range constraints to the constrained value.
    pub fn unwrap_constraint(&self, mut id: InstrId) -> InstrId {
        while let Op::Constraint { .. } = self.instrs[id].op {
            id = self.input(id, 0);
        }
        id
    }

    /// Skip through argument marshaling to the marshaled value.
    pub fn unwrap_argument(&self, id: InstrId) -> InstrId {
        match self.instrs[id].op {
            Op::PushArgument => self.input(id, 0),
            _ => id,
        }
    }

    // -------------------------------------------------------------------------
    // Uses
    // -------------------------------------------------------------------------

    /// Iterate over the uses of a definition.
    pub fn uses(&self, def: InstrId) -> UseIter<'_> {
        UseIter {
            graph: self,
            next: self.use_heads[def],
        }
    }

    /// Snapshot of the use ids of a definition, for editing while iterating.
    pub fn use_ids(&self, def: InstrId) -> SmallVec<[UseId; 8]> {
        self.uses(def).map(|(id, _)| id).collect()
    }

    /// Get a use record.
    #[inline]
    pub fn use_record(&self, id: UseId) -> &Use {
        &self.uses[id]
    }

    /// Number of uses, operands and environment entries together.
    #[inline]
    pub fn use_count(&self, def: InstrId) -> u32 {
        self.use_counts[def]
    }

    /// Whether anything reads `def`.
    #[inline]
    pub fn has_uses(&self, def: InstrId) -> bool {
        self.use_heads[def].is_some()
    }

    /// Whether any operand (not environment entry) reads `def`.
    pub fn has_input_uses(&self, def: InstrId) -> bool {
        self.uses(def)
            .any(|(_, u)| matches!(u.slot, UseSlot::Input(_)))
    }

    fn link_use(&mut self, def: InstrId, user: InstrId, slot: UseSlot) -> UseId {
        let head = self.use_heads[def];
        let record = Use {
            def,
            user,
            slot,
            prev: None,
            next: head,
            live: true,
        };
        let id = match self.free_uses.pop() {
            Some(id) => {
                self.uses[id] = record;
                id
            }
            None => self.uses.alloc(record),
        };
        if let Some(h) = head {
            self.uses[h].prev = Some(id);
        }
        self.use_heads.set(def, Some(id));
        *self.use_counts.entry(def) += 1;
        id
    }

    fn detach_use(&mut self, id: UseId) {
        let (def, prev, next) = {
            let u = &self.uses[id];
            (u.def, u.prev, u.next)
        };
        match prev {
            Some(p) => self.uses[p].next = next,
            None => self.use_heads.set(def, next),
        }
        if let Some(n) = next {
            self.uses[n].prev = prev;
        }
        let u = &mut self.uses[id];
        u.prev = None;
        u.next = None;
        *self.use_counts.entry(def) -= 1;
    }

    fn free_use(&mut self, id: UseId) {
        self.detach_use(id);
        self.uses[id].live = false;
        self.free_uses.push(id);
    }

    fn retarget_use(&mut self, id: UseId, new_def: InstrId) {
        self.detach_use(id);
        let head = self.use_heads[new_def];
        {
            let u = &mut self.uses[id];
            u.def = new_def;
            u.next = head;
            u.prev = None;
        }
        if let Some(h) = head {
            self.uses[h].prev = Some(id);
        }
        self.use_heads.set(new_def, Some(id));
        *self.use_counts.entry(new_def) += 1;
    }

    // -------------------------------------------------------------------------
    // Environments
    // -------------------------------------------------------------------------

    /// Values captured by the environment of `instr`.
    pub fn env_values(&self, instr: InstrId) -> SmallVec<[InstrId; 8]> {
        match self.instrs[instr].env {
            Some(env) => self.envs[env]
                .values
                .iter()
                .map(|&u| self.uses[u].def)
                .collect(),
            None => SmallVec::new(),
        }
    }

    pub(crate) fn env_use_ids(&self, instr: InstrId) -> SmallVec<[UseId; 8]> {
        match self.instrs[instr].env {
            Some(env) => self.envs[env].values.clone(),
            None => SmallVec::new(),
        }
    }

    /// Attach an environment capturing `values` to `instr`, replacing any
    /// previous one.
    pub fn set_env(&mut self, instr: InstrId, values: &[InstrId]) {
        self.clear_env(instr);
        let mut env = Env::default();
        for (i, &v) in values.iter().enumerate() {
            env.values.push(self.link_use(v, instr, UseSlot::Env(i as u16)));
        }
        let id: EnvId = self.envs.alloc(env);
        self.instrs[instr].env = Some(id);
    }

    /// Drop the environment of `instr`.
    pub fn clear_env(&mut self, instr: InstrId) {
        if let Some(env) = self.instrs[instr].env.take() {
            let values = std::mem::take(&mut self.envs[env].values);
            for u in values {
                self.free_use(u);
            }
        }
    }

    /// Give `to` a copy of the environment of `from`.
    pub fn copy_env(&mut self, from: InstrId, to: InstrId) {
        if self.instrs[from].env.is_some() {
            let values = self.env_values(from);
            self.set_env(to, &values);
        } else {
            self.clear_env(to);
        }
    }

    // -------------------------------------------------------------------------
    // Instruction Creation
    // -------------------------------------------------------------------------

    fn create(&mut self, op: Op, block: BlockId, inputs: &[InstrId]) -> InstrId {
        let id = self.instrs.alloc(Instr::new(op, block));
        for (i, &def) in inputs.iter().enumerate() {
            let u = self.link_use(def, id, UseSlot::Input(i as u16));
            self.instrs[id].inputs.push(u);
        }
        id
    }

    /// Append an instruction at the end of `block`.
    pub fn append(&mut self, block: BlockId, op: Op, inputs: &[InstrId]) -> InstrId {
        let id = self.create(op, block, inputs);
        self.blocks[block].instrs.push(id);
        id
    }

    /// Insert an instruction immediately before `anchor`.
    pub fn insert_before(&mut self, anchor: InstrId, op: Op, inputs: &[InstrId]) -> InstrId {
        let block = self.instrs[anchor].block;
        let id = self.create(op, block, inputs);
        let pos = self.position_in_block(anchor);
        self.blocks[block].instrs.insert(pos, id);
        id
    }

    /// Insert an instruction immediately after `anchor`.
    pub fn insert_after(&mut self, anchor: InstrId, op: Op, inputs: &[InstrId]) -> InstrId {
        let block = self.instrs[anchor].block;
        let id = self.create(op, block, inputs);
        let pos = self.position_in_block(anchor);
        self.blocks[block].instrs.insert(pos + 1, id);
        id
    }

    /// Insert an instruction after the phis of `block`.
    pub fn insert_at_start(&mut self, block: BlockId, op: Op, inputs: &[InstrId]) -> InstrId {
        let id = self.create(op, block, inputs);
        let pos = self.blocks[block]
            .instrs
            .iter()
            .position(|&i| !matches!(self.instrs[i].op, Op::Phi))
            .unwrap_or(self.blocks[block].instrs.len());
        self.blocks[block].instrs.insert(pos, id);
        id
    }

    /// Index of an instruction inside its block.
    pub fn position_in_block(&self, id: InstrId) -> usize {
        let block = self.instrs[id].block;
        self.blocks[block]
            .instrs
            .iter()
            .position(|&i| i == id)
            .unwrap_or(self.blocks[block].instrs.len())
    }

    /// Canonical constant node for `lit`, created in the entry block on
    /// first request.
    pub fn constant(&mut self, lit: Literal) -> InstrId {
        if let Some(&id) = self.constants.get(&lit) {
            if !self.instrs[id].is_removed() {
                return id;
            }
        }
        let entry = self.entry;
        let pos = self.blocks[entry]
            .instrs
            .iter()
            .position(|&i| !matches!(self.instrs[i].op, Op::Parameter(_) | Op::Constant(_)))
            .unwrap_or(self.blocks[entry].instrs.len());
        let id = self.create(Op::Constant(lit.clone()), entry, &[]);
        self.blocks[entry].instrs.insert(pos, id);
        self.constants.insert(lit, id);
        id
    }

    /// Canonical integer constant.
    #[inline]
    pub fn int_constant(&mut self, v: i64) -> InstrId {
        self.constant(Literal::Int(v))
    }

    /// Canonical boolean constant.
    #[inline]
    pub fn bool_constant(&mut self, b: bool) -> InstrId {
        self.constant(Literal::Bool(b))
    }

    // -------------------------------------------------------------------------
    // Instruction Editing
    // -------------------------------------------------------------------------

    /// Change the operator of an instruction, keeping its operands.
    pub fn set_op(&mut self, id: InstrId, op: Op) {
        self.instrs[id].op = op;
    }

    /// Point operand `index` of `user` at `new_def`.
    pub fn replace_input(&mut self, user: InstrId, index: usize, new_def: InstrId) {
        let u = self.instrs[user].inputs[index];
        if self.uses[u].def != new_def {
            self.retarget_use(u, new_def);
        }
    }

    /// Redirect every use of `old` (operands and environments) to `new`.
    /// Returns the number of redirected uses.
    pub fn replace_all_uses(&mut self, old: InstrId, new: InstrId) -> usize {
        self.replace_uses_where(old, new, |_, _| true)
    }

    /// Redirect the uses of `old` accepted by `filter` to `new`.
    pub fn replace_uses_where(
        &mut self,
        old: InstrId,
        new: InstrId,
        mut filter: impl FnMut(&FlowGraph, &Use) -> bool,
    ) -> usize {
        if old == new {
            return 0;
        }
        let mut count = 0;
        for u in self.use_ids(old) {
            if filter(self, &self.uses[u]) {
                self.retarget_use(u, new);
                count += 1;
            }
        }
        count
    }

    /// Remove operand `index` of `user`, renumbering later operands.
    pub fn remove_input(&mut self, user: InstrId, index: usize) {
        let u = self.instrs[user].inputs.remove(index);
        self.free_use(u);
        let later: SmallVec<[UseId; 4]> =
            self.instrs[user].inputs[index..].iter().copied().collect();
        for (offset, u) in later.into_iter().enumerate() {
            self.uses[u].slot = UseSlot::Input((index + offset) as u16);
        }
    }

    /// Append an operand to `user`.
    pub fn add_input(&mut self, user: InstrId, def: InstrId) {
        let index = self.instrs[user].inputs.len();
        let u = self.link_use(def, user, UseSlot::Input(index as u16));
        self.instrs[user].inputs.push(u);
    }

    /// Detach an instruction: drop its operands and environment and take it
    /// out of its block. Uses of its value must already be gone.
    pub fn remove_instr(&mut self, id: InstrId) {
        if self.instrs[id].is_removed() {
            return;
        }
        let inputs = std::mem::take(&mut self.instrs[id].inputs);
        for u in inputs {
            self.free_use(u);
        }
        self.clear_env(id);
        let block = self.instrs[id].block;
        self.blocks[block].instrs.retain(|&i| i != id);
        self.instrs[id].flags.insert(InstrFlags::REMOVED);
        if let Op::Constant(lit) = &self.instrs[id].op {
            if self.constants.get(lit) == Some(&id) {
                let lit = lit.clone();
                self.constants.remove(&lit);
            }
        }
    }

    // -------------------------------------------------------------------------
    // Blocks and Edges
    // -------------------------------------------------------------------------

    /// Create an empty block.
    pub fn add_block(&mut self) -> BlockId {
        self.blocks.alloc(Block::default())
    }

    /// Last instruction of a block, if it is a terminator.
    pub fn terminator(&self, block: BlockId) -> Option<InstrId> {
        self.blocks[block]
            .instrs
            .last()
            .copied()
            .filter(|&i| self.instrs[i].op.is_terminator())
    }

    /// Control successors of a block.
    pub fn successors(&self, block: BlockId) -> SmallVec<[BlockId; 2]> {
        match self.terminator(block).map(|t| &self.instrs[t].op) {
            Some(Op::Goto(target)) => smallvec::smallvec![*target],
            Some(Op::Branch { if_true, if_false }) => smallvec::smallvec![*if_true, *if_false],
            _ => SmallVec::new(),
        }
    }

    /// Phis of a block.
    pub fn phis(&self, block: BlockId) -> SmallVec<[InstrId; 4]> {
        self.blocks[block]
            .instrs
            .iter()
            .copied()
            .take_while(|&i| matches!(self.instrs[i].op, Op::Phi))
            .collect()
    }

    pub(crate) fn add_pred(&mut self, block: BlockId, pred: BlockId) {
        self.blocks[block].preds.push(pred);
    }

    /// Remove one `pred -> block` edge record together with the matching
    /// phi operands.
    pub fn remove_pred_edge(&mut self, block: BlockId, pred: BlockId) {
        let Some(index) = self.blocks[block].preds.iter().position(|&p| p == pred) else {
            return;
        };
        self.blocks[block].preds.remove(index);
        for phi in self.phis(block) {
            if index < self.instrs[phi].inputs.len() {
                self.remove_input(phi, index);
            }
        }
    }

    /// Terminate `block` with a jump to `target`.
    pub fn set_goto(&mut self, block: BlockId, target: BlockId) -> InstrId {
        self.add_pred(target, block);
        self.append(block, Op::Goto(target), &[])
    }

    /// Terminate `block` with a conditional branch.
    pub fn set_branch(
        &mut self,
        block: BlockId,
        cond: InstrId,
        if_true: BlockId,
        if_false: BlockId,
    ) -> InstrId {
        self.add_pred(if_true, block);
        self.add_pred(if_false, block);
        self.append(block, Op::Branch { if_true, if_false }, &[cond])
    }

    /// Terminate `block` with a return of `value`.
    pub fn set_return(&mut self, block: BlockId, value: InstrId) -> InstrId {
        self.append(block, Op::Return, &[value])
    }

    /// Replace the terminator of `block` with a jump to `keep`, dropping the
    /// edges to every other successor.
    pub fn replace_terminator_with_goto(&mut self, block: BlockId, keep: BlockId) {
        let succs = self.successors(block);
        if let Some(term) = self.terminator(block) {
            self.remove_instr(term);
        }
        let mut kept = false;
        for succ in succs {
            if succ == keep && !kept {
                kept = true;
            } else {
                self.remove_pred_edge(succ, block);
            }
        }
        if !kept {
            self.add_pred(keep, block);
        }
        self.append(block, Op::Goto(keep), &[]);
    }

    /// Delete a block: its outgoing edges and all its instructions.
    pub fn remove_block(&mut self, block: BlockId) {
        for succ in self.successors(block) {
            self.remove_pred_edge(succ, block);
        }
        let instrs: Vec<InstrId> = self.blocks[block].instrs.iter().rev().copied().collect();
        for id in instrs {
            self.remove_instr(id);
        }
        let b = &mut self.blocks[block];
        b.preds.clear();
        b.flags.insert(BlockFlags::REMOVED);
    }

    // -------------------------------------------------------------------------
    // Ordering
    // -------------------------------------------------------------------------

    /// Recompute the reverse postorder of blocks reachable from the entry.
    pub fn compute_rpo(&mut self) {
        let mut visited = BitSet::with_capacity(self.blocks.len());
        let mut postorder = Vec::with_capacity(self.blocks.len());
        let mut stack: Vec<(BlockId, usize)> = vec![(self.entry, 0)];
        visited.insert(self.entry.as_usize());
        while let Some(&(block, next)) = stack.last() {
            let succs = self.successors(block);
            if let Some(&succ) = succs.get(next) {
                if let Some(top) = stack.last_mut() {
                    top.1 += 1;
                }
                if visited.insert(succ.as_usize()) {
                    stack.push((succ, 0));
                }
            } else {
                postorder.push(block);
                stack.pop();
            }
        }
        postorder.reverse();
        self.rpo_index = SecondaryMap::with_capacity(self.blocks.len());
        for (i, &b) in postorder.iter().enumerate() {
            self.rpo_index.set(b, Some(i as u32));
        }
        self.rpo = postorder;
    }

    /// Blocks in reverse postorder, as of the last [`FlowGraph::compute_rpo`].
    #[inline]
    pub fn rpo(&self) -> &[BlockId] {
        &self.rpo
    }

    /// Position of a block in reverse postorder.
    #[inline]
    pub fn rpo_number(&self, block: BlockId) -> Option<u32> {
        self.rpo_index[block]
    }

    /// Live instructions of reachable blocks, in block order.
    pub fn instrs_in_order(&self) -> Vec<InstrId> {
        self.rpo
            .iter()
            .flat_map(|&b| self.blocks[b].instrs.iter().copied())
            .collect()
    }

    // -------------------------------------------------------------------------
    // Call Sites and Feedback
    // -------------------------------------------------------------------------

    /// Allocate a fresh deopt id.
    pub fn new_deopt_id(&mut self) -> DeoptId {
        let id = DeoptId(self.next_deopt_id);
        self.next_deopt_id += 1;
        id
    }

    /// Register a call site with its feedback.
    pub fn add_site(&mut self, deopt_id: DeoptId, feedback: FeedbackRecord) -> SiteId {
        let site = self.sites.alloc(CallSite { deopt_id, feedback });
        self.site_by_deopt.insert(deopt_id, site);
        site
    }

    /// Get a call site.
    #[inline]
    pub fn site(&self, id: SiteId) -> &CallSite {
        &self.sites[id]
    }

    /// Get a call site mutably.
    #[inline]
    pub fn site_mut(&mut self, id: SiteId) -> &mut CallSite {
        &mut self.sites[id]
    }

    /// All call sites.
    pub fn sites(&self) -> impl Iterator<Item = (SiteId, &CallSite)> {
        self.sites.iter()
    }

    /// Site owning a deopt id.
    pub fn site_for_deopt(&self, deopt_id: DeoptId) -> Option<SiteId> {
        self.site_by_deopt.get(&deopt_id).copied()
    }

    /// Remember that speculation failed at `deopt_id`. Returns false if the
    /// id belongs to no call site.
    pub fn record_deopt(&mut self, deopt_id: DeoptId, reason: DeoptReasons) -> bool {
        match self.site_for_deopt(deopt_id) {
            Some(site) => {
                self.sites[site].feedback.deopt_reasons.insert(reason);
                true
            }
            None => false,
        }
    }

    /// Merge feedback collected by a profiling run.
    pub fn merge_feedback(&mut self, collected: FxHashMap<SiteId, FeedbackRecord>) {
        for (site, record) in collected {
            if let Some(s) = self.sites.get_mut(site) {
                s.feedback.merge(&record);
            }
        }
    }
}

// =============================================================================
// Printing
// =============================================================================

impl fmt::Display for FlowGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "graph {} {{", self.name)?;
        for &block in &self.rpo {
            let preds: Vec<String> = self.blocks[block]
                .preds
                .iter()
                .map(|p| format!("B{p}"))
                .collect();
            writeln!(f, "B{block}: preds [{}]", preds.join(", "))?;
            for &id in &self.blocks[block].instrs {
                let instr = &self.instrs[id];
                write!(f, "  ")?;
                if instr.op.has_value() {
                    write!(f, "v{id} = ")?;
                }
                write!(f, "{}", instr.op)?;
                let inputs: Vec<String> = self.inputs(id).iter().map(|d| format!("v{d}")).collect();
                if !inputs.is_empty() {
                    write!(f, "({})", inputs.join(", "))?;
                }
                if instr.env.is_some() {
                    let env: Vec<String> =
                        self.env_values(id).iter().map(|d| format!("v{d}")).collect();
                    write!(f, " env[{}]", env.join(", "))?;
                }
                if let Some(range) = instr.range {
                    write!(f, " {range}")?;
                }
                writeln!(f)?;
            }
        }
        writeln!(f, "}}")
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::types::{BinaryOp, IntWidth};

    fn add() -> Op {
        Op::IntBinary {
            op: BinaryOp::Add,
            width: IntWidth::Int64,
        }
    }

    #[test]
    fn test_use_lists_track_operands() {
        let mut g = FlowGraph::new("t", 2);
        let (a, b) = (g.params()[0], g.params()[1]);
        let entry = g.entry();
        let x = g.append(entry, add(), &[a, b]);
        let y = g.append(entry, add(), &[x, x]);
        assert_eq!(g.use_count(a), 1);
        assert_eq!(g.use_count(x), 2);
        assert!(g.uses(x).all(|(_, u)| u.user == y));

        g.replace_input(y, 1, b);
        assert_eq!(g.use_count(x), 1);
        assert_eq!(g.use_count(b), 2);
        assert_eq!(g.inputs(y).as_slice(), &[x, b]);
    }

    #[test]
    fn test_replace_all_uses_moves_environment_entries() {
        let mut g = FlowGraph::new("t", 2);
        let (a, b) = (g.params()[0], g.params()[1]);
        let entry = g.entry();
        let x = g.append(entry, add(), &[a, a]);
        let check = g.append(entry, Op::CheckSmi, &[a]);
        g.set_env(check, &[a, x]);
        assert_eq!(g.use_count(a), 4);

        assert_eq!(g.replace_all_uses(a, b), 4);
        assert!(!g.has_uses(a));
        assert_eq!(g.env_values(check).as_slice(), &[b, x]);
        assert_eq!(g.inputs(x).as_slice(), &[b, b]);
    }

    #[test]
    fn test_remove_instr_frees_uses() {
        let mut g = FlowGraph::new("t", 1);
        let a = g.params()[0];
        let entry = g.entry();
        let x = g.append(entry, add(), &[a, a]);
        g.set_env(x, &[a]);
        g.remove_instr(x);
        assert!(g.instr(x).is_removed());
        assert!(!g.has_uses(a));
        assert!(!g.block(entry).instrs().contains(&x));
    }

    #[test]
    fn test_constants_are_canonical() {
        let mut g = FlowGraph::new("t", 1);
        let c1 = g.int_constant(7);
        let c2 = g.int_constant(7);
        let c3 = g.int_constant(8);
        assert_eq!(c1, c2);
        assert_ne!(c1, c3);
        // Parameters stay first.
        assert_eq!(g.block(g.entry()).instrs()[0], g.params()[0]);
    }

    #[test]
    fn test_remove_pred_edge_compacts_phis() {
        let mut g = FlowGraph::new("t", 2);
        let (a, b) = (g.params()[0], g.params()[1]);
        let entry = g.entry();
        let left = g.add_block();
        let right = g.add_block();
        let join = g.add_block();
        g.set_branch(entry, a, left, right);
        g.set_goto(left, join);
        g.set_goto(right, join);
        let phi = g.append(join, Op::Phi, &[a, b]);
        g.set_return(join, phi);

        g.remove_pred_edge(join, left);
        assert_eq!(g.block(join).preds(), &[right]);
        assert_eq!(g.inputs(phi).as_slice(), &[b]);
        assert_eq!(g.use_record(g.instr(phi).inputs[0]).slot, UseSlot::Input(0));
    }

    #[test]
    fn test_rpo_and_goto_rewrite() {
        let mut g = FlowGraph::new("t", 1);
        let a = g.params()[0];
        let entry = g.entry();
        let left = g.add_block();
        let right = g.add_block();
        g.set_branch(entry, a, left, right);
        g.set_return(left, a);
        g.set_return(right, a);
        g.compute_rpo();
        assert_eq!(g.rpo().len(), 3);
        assert_eq!(g.rpo()[0], entry);

        g.replace_terminator_with_goto(entry, left);
        g.compute_rpo();
        assert_eq!(g.rpo(), &[entry, left]);
        assert!(g.block(right).preds().is_empty());
        assert!(g.rpo_number(right).is_none());
    }
}
