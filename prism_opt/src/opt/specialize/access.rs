//! Container access: `.length`, `a[i]`, `a[i] = v`.
//!
//! Indexed accesses get an explicit length load and bounds check so range
//! analysis can later prove the check redundant:
//!
//! ```text
//!   CheckClass(a, [List])
//!   CheckSmi(i)
//!   n = LoadLength(a)
//!   CheckBounds(n, i)
//!   v = LoadIndexed(a, i)
//! ```

use super::{CallInfo, Rewriter, SMI_ONLY};
use crate::ir::instr::{InstrId, Op};
use crate::ir::types::{ClassId, Selector};

use smallvec::SmallVec;

/// Classes with built-in length and indexing.
const INDEXABLE: &[ClassId] = &[ClassId::ARRAY, ClassId::STRING];
const ARRAY_ONLY: &[ClassId] = &[ClassId::ARRAY];

impl Rewriter<'_, '_> {
    /// Receiver classes of `info` if they are all within `allowed`.
    fn container_classes(
        &self,
        info: &CallInfo,
        allowed: &[ClassId],
    ) -> Option<SmallVec<[ClassId; 4]>> {
        let receiver = self.classes(info, 0);
        let builtin = receiver
            .cids
            .iter()
            .all(|&c| self.is_builtin(c, &info.selector));
        (receiver.within(allowed) && builtin).then_some(receiver.cids)
    }

    pub(super) fn try_length(&mut self, info: &CallInfo) -> bool {
        let Some(cids) = self.container_classes(info, INDEXABLE) else {
            return false;
        };
        if !self.try_guard(info, &[(0, &cids)]) {
            return false;
        }
        let v = self.emit(info, Op::LoadLength, &[info.args[0]]);
        self.replace_call(info, v);
        self.stats.accesses += 1;
        true
    }

    pub(super) fn try_index(&mut self, info: &CallInfo) -> bool {
        let Some(cids) = self.container_classes(info, INDEXABLE) else {
            return false;
        };
        if !self.classes(info, 1).within(SMI_ONLY)
            || !self.try_guard(info, &[(0, &cids), (1, SMI_ONLY)])
        {
            return false;
        }
        let (array, index) = (info.args[0], info.args[1]);
        self.emit_checked_index(info, array, index);
        let v = self.emit(info, Op::LoadIndexed, &[array, index]);
        self.replace_call(info, v);
        self.stats.accesses += 1;
        true
    }

    pub(super) fn try_index_set(&mut self, info: &CallInfo) -> bool {
        debug_assert_eq!(info.selector, Selector::IndexSet);
        if self.container_classes(info, ARRAY_ONLY).is_none()
            || !self.classes(info, 1).within(SMI_ONLY)
            || !self.try_guard(info, &[(0, ARRAY_ONLY), (1, SMI_ONLY)])
        {
            return false;
        }
        let (array, index, value) = (info.args[0], info.args[1], info.args[2]);
        self.emit_checked_index(info, array, index);
        self.emit(info, Op::StoreIndexed, &[array, index, value]);
        self.replace_call_with_null(info);
        self.stats.accesses += 1;
        true
    }

    fn emit_checked_index(&mut self, info: &CallInfo, array: InstrId, index: InstrId) {
        let length = self.emit(info, Op::LoadLength, &[array]);
        self.emit(info, Op::CheckBounds, &[length, index]);
    }
}
