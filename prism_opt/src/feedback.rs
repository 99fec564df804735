//! Call-site type feedback.
//!
//! The unoptimized tier records, per call site, which tuples of operand
//! classes it saw, which target each tuple resolved to, and how often. It
//! also remembers which kinds of speculation already failed at the site so
//! the optimizer does not re-install a specialization known to fail.

use crate::hierarchy::FunctionId;
use crate::ir::instr::DeoptId;
use crate::ir::types::ClassId;

use smallvec::SmallVec;

/// Distinct operand tuples recorded before a site is considered megamorphic.
pub const MAX_FEEDBACK_ENTRIES: usize = 8;

bitflags::bitflags! {
    /// Kinds of speculation failure observed at a call site.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct DeoptReasons: u16 {
        const CHECK_SMI = 1 << 0;
        const CHECK_CLASS = 1 << 1;
        /// A Smi operation left the Smi range.
        const BINARY_SMI_OP = 1 << 2;
        const BINARY_DOUBLE_OP = 1 << 3;
        const UNARY_SMI_OP = 1 << 4;
        const POLYMORPHIC_MISS = 1 << 5;
        const TEST_CIDS = 1 << 6;
    }
}

/// One observed operand tuple.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedbackEntry {
    /// Class of each operand, receiver first.
    pub cids: SmallVec<[ClassId; 2]>,
    /// Target the tuple dispatched to.
    pub target: Option<FunctionId>,
    /// Number of hits.
    pub count: u32,
}

/// Everything observed at one call site.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeedbackRecord {
    entries: SmallVec<[FeedbackEntry; 4]>,
    /// More distinct tuples were seen than could be recorded.
    pub megamorphic: bool,
    /// Speculation failures attributed to this site.
    pub deopt_reasons: DeoptReasons,
}

impl FeedbackRecord {
    /// Empty record.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style [`FeedbackRecord::record_n`].
    pub fn with(mut self, cids: &[ClassId], target: Option<FunctionId>, count: u32) -> Self {
        self.record_n(cids, target, count);
        self
    }

    /// Builder-style reason.
    pub fn with_deopt_reason(mut self, reason: DeoptReasons) -> Self {
        self.deopt_reasons.insert(reason);
        self
    }

    /// Record one hit.
    pub fn record(&mut self, cids: &[ClassId], target: Option<FunctionId>) {
        self.record_n(cids, target, 1);
    }

    /// Record `count` hits.
    pub fn record_n(&mut self, cids: &[ClassId], target: Option<FunctionId>, count: u32) {
        if let Some(entry) = self
            .entries
            .iter_mut()
            .find(|e| e.cids.as_slice() == cids)
        {
            entry.count = entry.count.saturating_add(count);
            return;
        }
        if self.entries.len() >= MAX_FEEDBACK_ENTRIES {
            self.megamorphic = true;
            return;
        }
        self.entries.push(FeedbackEntry {
            cids: cids.iter().copied().collect(),
            target,
            count,
        });
    }

    /// Fold another record into this one.
    pub fn merge(&mut self, other: &FeedbackRecord) {
        for e in &other.entries {
            self.record_n(&e.cids, e.target, e.count);
        }
        self.megamorphic |= other.megamorphic;
        self.deopt_reasons |= other.deopt_reasons;
    }

    /// Recorded tuples.
    #[inline]
    pub fn entries(&self) -> &[FeedbackEntry] {
        &self.entries
    }

    /// Whether the site was never executed.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of distinct tuples.
    #[inline]
    pub fn num_checks(&self) -> usize {
        self.entries.len()
    }

    /// Total hits.
    pub fn total_count(&self) -> u64 {
        self.entries.iter().map(|e| e.count as u64).sum()
    }

    /// Distinct classes seen for operand `arg`, in first-seen order.
    pub fn cids_at(&self, arg: usize) -> SmallVec<[ClassId; 4]> {
        let mut out = SmallVec::new();
        for e in &self.entries {
            if let Some(&cid) = e.cids.get(arg) {
                if !out.contains(&cid) {
                    out.push(cid);
                }
            }
        }
        out
    }

    /// Distinct receiver classes.
    #[inline]
    pub fn receiver_cids(&self) -> SmallVec<[ClassId; 4]> {
        self.cids_at(0)
    }

    /// Exactly one receiver class was seen and nothing overflowed.
    pub fn is_monomorphic(&self) -> bool {
        !self.megamorphic && self.receiver_cids().len() == 1
    }

    /// The single target every tuple dispatched to.
    pub fn unique_target(&self) -> Option<FunctionId> {
        let first = self.entries.first()?.target?;
        self.entries
            .iter()
            .all(|e| e.target == Some(first))
            .then_some(first)
    }

    /// Whether every operand of every tuple is in `allowed`.
    pub fn has_only_cids(&self, allowed: &[ClassId]) -> bool {
        !self.is_empty()
            && !self.megamorphic
            && self
                .entries
                .iter()
                .all(|e| e.cids.iter().all(|c| allowed.contains(c)))
    }

    /// Whether operand `arg` was ever `cid`.
    pub fn includes_cid(&self, arg: usize, cid: ClassId) -> bool {
        self.entries.iter().any(|e| e.cids.get(arg) == Some(&cid))
    }

    /// Whether `reason` was recorded.
    #[inline]
    pub fn has_deopt_reason(&self, reason: DeoptReasons) -> bool {
        self.deopt_reasons.intersects(reason)
    }

    /// Receiver classes with their target and hit count, most frequent
    /// first.
    pub fn receivers_by_count(&self) -> Vec<(ClassId, Option<FunctionId>, u64)> {
        let mut out: Vec<(ClassId, Option<FunctionId>, u64)> = Vec::new();
        for e in &self.entries {
            let Some(&cid) = e.cids.first() else { continue };
            match out.iter_mut().find(|(c, _, _)| *c == cid) {
                Some(slot) => slot.2 += e.count as u64,
                None => out.push((cid, e.target, e.count as u64)),
            }
        }
        out.sort_by(|a, b| b.2.cmp(&a.2).then(a.0.cmp(&b.0)));
        out
    }

    /// Receiver class accounting for at least `ratio` of all hits.
    pub fn dominant_receiver(&self, ratio: f64) -> Option<ClassId> {
        let total = self.total_count();
        if total == 0 {
            return None;
        }
        self.receivers_by_count()
            .first()
            .filter(|(_, _, n)| *n as f64 / total as f64 >= ratio)
            .map(|(cid, _, _)| *cid)
    }
}

/// A dynamic call site and its feedback.
#[derive(Debug, Clone)]
pub struct CallSite {
    /// Program point of the call.
    pub deopt_id: DeoptId,
    /// Observed behavior.
    pub feedback: FeedbackRecord,
}
