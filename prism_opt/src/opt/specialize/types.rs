//! Type tests (`v is T`) and casts (`v as T`).

use super::{decision, guard_op, static_cids, Cids, Rewriter};
use crate::feedback::{DeoptReasons, FeedbackRecord};
use crate::hierarchy::ClassHierarchy;
use crate::ir::instr::{InstrId, MissAction, Op, SiteId};
use crate::ir::types::ClassId;

use std::sync::Arc;

impl Rewriter<'_, '_> {
    fn site_feedback(&self, site: Option<SiteId>) -> Option<FeedbackRecord> {
        site.map(|s| self.graph.site(s).feedback.clone())
    }

    /// Whether a guard failing with `reason` may be installed at `anchor`.
    fn may_speculate_at(
        &self,
        anchor: InstrId,
        feedback: &FeedbackRecord,
        reason: DeoptReasons,
    ) -> bool {
        self.cx.config.speculative
            && self.graph.instr(anchor).env.is_some()
            && !feedback.has_deopt_reason(reason)
    }

    fn replace_test(&mut self, test: InstrId, value: InstrId) {
        decision!(
            self.cx,
            test = %test,
            replacement = %self.graph.op(value),
            "specialized type test"
        );
        self.graph.replace_all_uses(test, value);
        self.graph.remove_instr(test);
        self.stats.type_tests += 1;
    }

    pub(super) fn try_instance_of(&mut self, id: InstrId) -> bool {
        let Op::InstanceOf { ty, site } = self.graph.op(id) else {
            return false;
        };
        let (ty, site) = (*ty, *site);
        let value = self.graph.input(id, 0);
        let hierarchy = self.cx.hierarchy();

        if ty == ClassId::OBJECT {
            let t = self.graph.bool_constant(true);
            self.replace_test(id, t);
            return true;
        }
        let proven = static_cids(self.graph, hierarchy, value)
            .and_then(|c| uniform_result(hierarchy, &c, ty));
        if let Some(result) = proven {
            let c = self.graph.bool_constant(result);
            self.replace_test(id, c);
            return true;
        }

        let feedback = self.site_feedback(site).unwrap_or_default();
        let seen = feedback.receiver_cids();
        if let Some(result) = uniform_result(hierarchy, &seen, ty) {
            if self.may_speculate_at(id, &feedback, guard_op(&seen).deopt_reason()) {
                self.guard_value(id, value, &seen);
                let c = self.graph.bool_constant(result);
                self.replace_test(id, c);
                return true;
            }
        }

        if is_leaf_class(hierarchy, ty) {
            let cid = self.emit_before(id, Op::LoadClassId, &[value]);
            let expected = self.graph.int_constant(i64::from(ty.0));
            let eq = self.emit_before(id, Op::StrictCompare { negate: false }, &[cid, expected]);
            self.replace_test(id, eq);
            return true;
        }

        let subtypes = hierarchy.concrete_subtypes(ty);
        let (cids, on_miss) = if subtypes.len() <= self.cx.config.max_polymorphic_checks {
            let mut cids = seen.clone();
            for cid in subtypes {
                if !cids.contains(&cid) {
                    cids.push(cid);
                }
            }
            (cids, MissAction::Result(false))
        } else if !seen.is_empty() {
            let on_miss = if self.may_speculate_at(id, &feedback, DeoptReasons::TEST_CIDS) {
                MissAction::Deopt
            } else {
                MissAction::Dispatch
            };
            (seen, on_miss)
        } else {
            return false;
        };
        let table: Vec<(ClassId, bool)> = cids
            .iter()
            .map(|&c| (c, hierarchy.is_subtype(c, ty)))
            .collect();
        let test = self.emit_before(
            id,
            Op::TestCids {
                ty,
                table: Arc::from(table),
                on_miss,
            },
            &[value],
        );
        self.replace_test(id, test);
        true
    }

    pub(super) fn try_cast(&mut self, id: InstrId) -> bool {
        let Op::AssertAssignable { ty, site } = self.graph.op(id) else {
            return false;
        };
        let (ty, site) = (*ty, *site);
        let value = self.graph.input(id, 0);
        let hierarchy = self.cx.hierarchy();

        let proven = static_cids(self.graph, hierarchy, value)
            .and_then(|c| uniform_result(hierarchy, &c, ty));
        if ty == ClassId::OBJECT || proven == Some(true) {
            self.replace_test(id, value);
            return true;
        }

        let feedback = self.site_feedback(site).unwrap_or_default();
        let seen = feedback.receiver_cids();
        if uniform_result(hierarchy, &seen, ty) == Some(true)
            && self.may_speculate_at(id, &feedback, guard_op(&seen).deopt_reason())
        {
            self.guard_value(id, value, &seen);
            self.replace_test(id, value);
            return true;
        }
        false
    }
}

/// Outcome of `cid is ty` if it is the same for every class in `cids`.
fn uniform_result(hierarchy: &dyn ClassHierarchy, cids: &Cids, ty: ClassId) -> Option<bool> {
    let (&first, rest) = cids.split_first()?;
    let result = hierarchy.is_subtype(first, ty);
    rest.iter().all(|&c| hierarchy.is_subtype(c, ty) == result).then_some(result)
}

/// A concrete class nothing extends or implements: membership is a class
/// id comparison.
fn is_leaf_class(hierarchy: &dyn ClassHierarchy, ty: ClassId) -> bool {
    hierarchy.class(ty).is_some_and(|c| !c.is_abstract)
        && !hierarchy.has_subclasses(ty)
        && !hierarchy.is_implemented(ty)
}

#[cfg(test)]
mod tests {
    use super::super::tests::{ops, specialize};
    use super::*;
    use crate::config::OptConfig;
    use crate::hierarchy::ClassTable;
    use crate::ir::builder::FlowGraphBuilder;
    use crate::ir::types::Literal;

    fn profile(b: &mut FlowGraphBuilder, test: InstrId, fb: FeedbackRecord) {
        let site = match b.graph().op(test) {
            Op::InstanceOf { site, .. } | Op::AssertAssignable { site, .. } => {
                site.expect("profiled")
            }
            _ => unreachable!(),
        };
        b.graph_mut().site_mut(site).feedback = fb;
    }

    /// Animal <- Dog, Cat; Cat <- Lion.
    fn zoo() -> (ClassTable, ClassId, ClassId, ClassId) {
        let mut table = ClassTable::new();
        let animal = table.define_class("Animal", ClassId::OBJECT, 0);
        let dog = table.define_class("Dog", animal, 0);
        let cat = table.define_class("Cat", animal, 0);
        table.define_class("Lion", cat, 0);
        (table, animal, dog, cat)
    }

    #[test]
    fn test_constant_operand_folds() {
        let table = ClassTable::new();
        let mut b = FlowGraphBuilder::new("f", 0);
        let three = b.int(3);
        let t = b.instance_of(three, ClassId::NUM);
        b.ret(t);
        let mut g = b.finish().expect("valid graph");
        let stats = specialize(&mut g, &table, &OptConfig::conservative());
        assert_eq!(stats.type_tests, 1);
        assert_eq!(ops(&g), ["Return"]);
        let ret = g.terminator(g.entry()).expect("return");
        assert_eq!(g.literal(g.input(ret, 0)), Some(&Literal::Bool(true)));
    }

    #[test]
    fn test_uniform_feedback_becomes_guard() {
        let (table, animal, dog, _) = zoo();
        let mut b = FlowGraphBuilder::new("f", 1);
        let x = b.param(0);
        let t = b.instance_of(x, animal);
        profile(&mut b, t, FeedbackRecord::new().with(&[dog], None, 12));
        b.ret(t);
        let mut g = b.finish().expect("valid graph");
        specialize(&mut g, &table, &OptConfig::default());
        assert_eq!(ops(&g), ["CheckClass", "Return"]);
    }

    #[test]
    fn test_leaf_class_compares_class_id() {
        let (table, _, dog, _) = zoo();
        let mut b = FlowGraphBuilder::new("f", 1);
        let x = b.param(0);
        let t = b.instance_of(x, dog);
        b.ret(t);
        let mut g = b.finish().expect("valid graph");
        specialize(&mut g, &table, &OptConfig::conservative());
        assert_eq!(ops(&g), ["LoadClassId", "StrictCompare", "Return"]);
    }

    #[test]
    fn test_small_hierarchy_becomes_closed_table() {
        let (table, _, dog, cat) = zoo();
        let mut b = FlowGraphBuilder::new("f", 1);
        let x = b.param(0);
        let t = b.instance_of(x, cat);
        profile(&mut b, t, FeedbackRecord::new().with(&[dog], None, 3).with(&[cat], None, 3));
        b.ret(t);
        let mut g = b.finish().expect("valid graph");
        specialize(&mut g, &table, &OptConfig::default());
        let test = g
            .instrs_in_order()
            .into_iter()
            .find(|&i| matches!(g.op(i), Op::TestCids { .. }))
            .expect("class table test");
        let Op::TestCids { table: cids, on_miss, .. } = g.op(test) else {
            unreachable!()
        };
        assert_eq!(*on_miss, MissAction::Result(false));
        assert!(cids.contains(&(dog, false)));
        assert!(cids.contains(&(cat, true)));
        assert_eq!(cids.len(), 3);
    }

    #[test]
    fn test_cast_with_proven_class_disappears() {
        let (table, animal, dog, _) = zoo();
        let mut b = FlowGraphBuilder::new("f", 1);
        b.declare_param(0, dog);
        let x = b.param(0);
        let c = b.cast(x, animal);
        b.ret(c);
        let mut g = b.finish().expect("valid graph");
        specialize(&mut g, &table, &OptConfig::conservative());
        assert_eq!(ops(&g), ["Return"]);
        let ret = g.terminator(g.entry()).expect("return");
        assert_eq!(g.input(ret, 0), x);
    }

    #[test]
    fn test_cast_after_failed_guard_stays() {
        let (table, animal, dog, _) = zoo();
        let mut b = FlowGraphBuilder::new("f", 1);
        let x = b.param(0);
        let c = b.cast(x, animal);
        profile(
            &mut b,
            c,
            FeedbackRecord::new()
                .with(&[dog], None, 8)
                .with_deopt_reason(DeoptReasons::CHECK_CLASS),
        );
        b.ret(c);
        let mut g = b.finish().expect("valid graph");
        specialize(&mut g, &table, &OptConfig::default());
        assert_eq!(ops(&g), ["AssertAssignable", "Return"]);
    }
}
