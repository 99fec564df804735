//! Devirtualization and multi-target dispatch.

use super::{CallInfo, Rewriter};
use crate::feedback::DeoptReasons;
use crate::hierarchy::{FunctionId, FunctionKind, HierarchyDependency};
use crate::ir::instr::{DispatchTarget, MissAction, Op};

use std::sync::Arc;

impl Rewriter<'_, '_> {
    /// Replace a call with a single known target by a direct call, or by
    /// the target's body when it is a field accessor or a constant.
    pub(super) fn try_devirtualize(&mut self, info: &CallInfo) -> bool {
        if let Some(target) = self.static_target(info) {
            self.inline_or_call(info, target);
            self.stats.devirtualized += 1;
            return true;
        }

        let feedback = &info.feedback;
        let (Some(target), true) = (feedback.unique_target(), feedback.is_monomorphic()) else {
            return false;
        };
        let receiver = feedback.receiver_cids();
        if !self.try_guard(info, &[(0, &receiver)]) {
            return false;
        }
        self.inline_or_call(info, target);
        self.stats.devirtualized += 1;
        true
    }

    /// Target every statically possible receiver class resolves to.
    fn static_target(&mut self, info: &CallInfo) -> Option<FunctionId> {
        let receiver = self.classes(info, 0);
        if !receiver.proven {
            return None;
        }
        let hierarchy = self.cx.hierarchy();
        let mut targets = receiver.cids.iter().map(|&c| hierarchy.lookup(c, &info.selector));
        let first = targets.next()??;
        if !targets.all(|t| t == Some(first)) {
            return None;
        }
        // A declared parameter type stands for every present and future
        // subtype.
        let declared = self.graph.unwrap_constraint(info.args[0]);
        if let Op::Parameter(i) = self.graph.op(declared) {
            if let Some(class) = self.graph.param_type(*i as usize) {
                self.cx.add_dependency(HierarchyDependency {
                    class,
                    selector: info.selector.clone(),
                });
            }
        }
        Some(first)
    }

    fn inline_or_call(&mut self, info: &CallInfo, target: FunctionId) {
        if self.try_inline_getter(info, target) {
            return;
        }
        let v = self.emit(info, Op::StaticCall { target }, &info.args);
        self.replace_call(info, v);
    }

    /// Replace a call to an accessor or constant function with its body.
    fn try_inline_getter(&mut self, info: &CallInfo, target: FunctionId) -> bool {
        let Some(kind) = self.cx.hierarchy().function(target).map(|f| f.kind.clone()) else {
            return false;
        };
        let receiver = info.args[0];
        match kind {
            FunctionKind::Getter { offset } if info.args.len() == 1 => {
                let v = self.emit(info, Op::LoadField { offset }, &[receiver]);
                self.replace_call(info, v);
            }
            FunctionKind::Setter { offset } if info.args.len() == 2 => {
                self.emit(info, Op::StoreField { offset }, &[receiver, info.args[1]]);
                self.replace_call_with_null(info);
            }
            FunctionKind::Constant(lit) => {
                let v = self.graph.constant(lit);
                self.replace_call(info, v);
            }
            _ => return false,
        }
        self.stats.accessors_inlined += 1;
        true
    }

    /// Turn the remaining feedback into an ordered dispatch over the most
    /// frequent receiver classes.
    pub(super) fn polymorphic_fallback(&mut self, info: &CallInfo) -> bool {
        let feedback = &info.feedback;
        let max = self.cx.config.max_polymorphic_checks;
        let receivers = feedback.receivers_by_count();
        let targets: Vec<DispatchTarget> = receivers
            .iter()
            .filter_map(|&(cid, target, _)| target.map(|target| DispatchTarget { cid, target }))
            .take(max)
            .collect();
        if targets.is_empty() {
            return false;
        }
        let complete = !feedback.megamorphic
            && receivers.len() <= max
            && targets.len() == receivers.len();
        let on_miss = if complete && self.may_speculate(info, DeoptReasons::POLYMORPHIC_MISS) {
            MissAction::Deopt
        } else {
            MissAction::Dispatch
        };
        let fast_path = feedback
            .dominant_receiver(self.cx.config.dominant_type_ratio)
            .filter(|cid| targets.iter().any(|t| t.cid == *cid));
        let op = Op::PolymorphicCall {
            selector: info.selector.clone(),
            targets: Arc::from(targets),
            on_miss,
            fast_path,
        };
        let v = self.emit(info, op, &info.args);
        self.replace_call(info, v);
        self.stats.polymorphic += 1;
        true
    }
}
