//! Transfer functions of constant propagation.
//!
//! Each `fold_*` function maps the lattice values of an instruction's
//! operands to the lattice value of its result. They are pure: no graph
//! edits, no worklist access. Folding goes through [`crate::ir::eval`], the
//! same code the interpreter runs, so compile-time and run-time results
//! cannot disagree.
//!
//! Two rules hold throughout:
//! - an unresolved operand keeps the result unresolved;
//! - an operation that would throw, deoptimize, or produce a value with
//!   allocation identity is `NonConstant`.

use super::lattice::LatticeValue;
use crate::hierarchy::{ClassHierarchy, FunctionKind};
use crate::ir::arena::SecondaryMap;
use crate::ir::eval::{self, IntOutcome};
use crate::ir::graph::FlowGraph;
use crate::ir::instr::{Instr, InstrId, MissAction, Op};
use crate::ir::types::{BinaryOp, ClassId, CmpOp, IntWidth, Literal, Repr, Selector, UnaryOp};

use smallvec::SmallVec;

/// Evaluates instructions over lattice values.
pub struct ConstEvaluator<'a> {
    hierarchy: &'a dyn ClassHierarchy,
}

impl std::fmt::Debug for ConstEvaluator<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConstEvaluator").finish_non_exhaustive()
    }
}

impl<'a> ConstEvaluator<'a> {
    pub fn new(hierarchy: &'a dyn ClassHierarchy) -> Self {
        Self { hierarchy }
    }

    /// Lattice value of a non-phi definition.
    pub fn evaluate(
        &self,
        graph: &FlowGraph,
        id: InstrId,
        values: &SecondaryMap<Instr, LatticeValue>,
    ) -> LatticeValue {
        let operand = |i: usize| values[graph.input(id, i)].clone();
        let all_operands = || -> SmallVec<[LatticeValue; 4]> {
            (0..graph.instr(id).input_count()).map(operand).collect()
        };
        match graph.op(id) {
            Op::Constant(lit) => LatticeValue::Constant(lit.clone()),
            Op::Parameter(_) | Op::Phi => LatticeValue::NonConstant,
            Op::PushArgument | Op::Constraint { .. } | Op::Box { .. } => operand(0),
            Op::Unbox { to } | Op::IntConverter { to, .. } => fold_conversion(*to, &operand(0)),

            Op::DynamicCall { selector, .. } => self.fold_dynamic_call(selector, &all_operands()),
            Op::CheckedSmiOp { op } => fold_generic_binary(*op, &operand(0), &operand(1)),
            Op::CheckedSmiCompare { op } => fold_compare(*op, &operand(0), &operand(1)),
            Op::StaticCall { .. } | Op::PolymorphicCall { .. } => LatticeValue::NonConstant,

            Op::IntBinary { op, width } => fold_int_binary(*op, *width, &operand(0), &operand(1)),
            Op::IntUnary { op, width } => fold_int_unary(*op, *width, &operand(0)),
            Op::ShiftMask { mask } => fold_shift_mask(*mask, &operand(0), &operand(1)),
            Op::DoubleBinary { op } => fold_double_binary(*op, &operand(0), &operand(1)),
            Op::DoubleNegate => fold_double_negate(&operand(0)),
            Op::SimdBinary { .. } => LatticeValue::NonConstant,
            Op::IntCompare { op } | Op::DoubleCompare { op } => {
                fold_compare(*op, &operand(0), &operand(1))
            }
            Op::StrictCompare { negate } => fold_strict_compare(graph, id, *negate, values),

            Op::LoadLength => fold_length(&operand(0)),
            Op::LoadClassId => match operand(0) {
                LatticeValue::Constant(lit) => LatticeValue::int(i64::from(lit.class_id().0)),
                other => unresolved_or_varying(&other),
            },
            Op::StringToCharCode => match operand(0) {
                LatticeValue::Constant(Literal::Str(s)) => LatticeValue::int(eval::char_code(&s)),
                LatticeValue::Unknown => LatticeValue::Unknown,
                _ => LatticeValue::NonConstant,
            },
            Op::LoadField { .. } | Op::LoadIndexed | Op::AllocateObject { .. } => {
                LatticeValue::NonConstant
            }

            Op::InstanceOf { ty, .. } => match operand(0) {
                LatticeValue::Constant(lit) => {
                    LatticeValue::bool(self.hierarchy.is_subtype(lit.class_id(), *ty))
                }
                other => unresolved_or_varying(&other),
            },
            Op::AssertAssignable { ty, .. } => match operand(0) {
                LatticeValue::Constant(lit) if self.hierarchy.is_subtype(lit.class_id(), *ty) => {
                    LatticeValue::Constant(lit)
                }
                LatticeValue::Unknown => LatticeValue::Unknown,
                _ => LatticeValue::NonConstant,
            },
            Op::TestCids { ty, table, on_miss } => match operand(0) {
                LatticeValue::Constant(lit) => {
                    let cid = lit.class_id();
                    match table.iter().find(|(c, _)| *c == cid) {
                        Some(&(_, result)) => LatticeValue::bool(result),
                        None => match on_miss {
                            MissAction::Result(b) => LatticeValue::bool(*b),
                            MissAction::Dispatch => {
                                LatticeValue::bool(self.hierarchy.is_subtype(cid, *ty))
                            }
                            MissAction::Deopt => LatticeValue::NonConstant,
                        },
                    }
                }
                other => unresolved_or_varying(&other),
            },

            // Effect-only instructions carry no value.
            _ => LatticeValue::NonConstant,
        }
    }

    /// A dynamic call folds only when every operand is a primitive constant
    /// and the receiver's class dispatches to the built-in operator.
    fn fold_dynamic_call(&self, selector: &Selector, operands: &[LatticeValue]) -> LatticeValue {
        if operands.iter().any(LatticeValue::is_unknown) {
            return LatticeValue::Unknown;
        }
        let Some(receiver) = operands.first().and_then(LatticeValue::as_constant) else {
            return LatticeValue::NonConstant;
        };
        if !self.dispatches_to_builtin(receiver.class_id(), selector) {
            return LatticeValue::NonConstant;
        }
        match (selector, operands) {
            (Selector::Binary(op), [a, b]) => fold_generic_binary(*op, a, b),
            (Selector::Compare(op), [a, b]) => fold_compare(*op, a, b),
            (Selector::Unary(op), [a]) => fold_generic_unary(*op, a),
            (Selector::Length, [a]) => fold_length(a),
            _ => LatticeValue::NonConstant,
        }
    }

    fn dispatches_to_builtin(&self, cid: ClassId, selector: &Selector) -> bool {
        self.hierarchy
            .lookup(cid, selector)
            .and_then(|f| self.hierarchy.function(f))
            .is_some_and(|f| matches!(&f.kind, FunctionKind::Intrinsic(s) if s == selector))
    }
}

// =============================================================================
// Folding Rules
// =============================================================================

fn unresolved_or_varying(v: &LatticeValue) -> LatticeValue {
    if v.is_unknown() {
        LatticeValue::Unknown
    } else {
        LatticeValue::NonConstant
    }
}

/// Both operands resolved to constants, or the combined unresolved/varying
/// state when they did not.
fn constant_pair<'v>(
    a: &'v LatticeValue,
    b: &'v LatticeValue,
) -> Result<(&'v Literal, &'v Literal), LatticeValue> {
    match (a, b) {
        (LatticeValue::Constant(x), LatticeValue::Constant(y)) => Ok((x, y)),
        (LatticeValue::Unknown, _) | (_, LatticeValue::Unknown) => Err(LatticeValue::Unknown),
        _ => Err(LatticeValue::NonConstant),
    }
}

/// `a op b` with generic dispatch semantics. Results with identity (string
/// concatenation) are not folded.
pub fn fold_generic_binary(op: BinaryOp, a: &LatticeValue, b: &LatticeValue) -> LatticeValue {
    let (x, y) = match constant_pair(a, b) {
        Ok(pair) => pair,
        Err(v) => return v,
    };
    match eval::binary(op, x, y) {
        Some(Ok(lit)) if lit.is_cheap() => LatticeValue::Constant(lit),
        _ => LatticeValue::NonConstant,
    }
}

/// Generic unary operator.
pub fn fold_generic_unary(op: UnaryOp, a: &LatticeValue) -> LatticeValue {
    match a {
        LatticeValue::Constant(x) => {
            eval::unary(op, x).map_or(LatticeValue::NonConstant, LatticeValue::Constant)
        }
        other => unresolved_or_varying(other),
    }
}

/// Equality or ordering of two constants. Arrays compare by identity at
/// run time and are left alone.
pub fn fold_compare(op: CmpOp, a: &LatticeValue, b: &LatticeValue) -> LatticeValue {
    let (x, y) = match constant_pair(a, b) {
        Ok(pair) => pair,
        Err(v) => return v,
    };
    if matches!(x, Literal::Array(_)) || matches!(y, Literal::Array(_)) {
        return LatticeValue::NonConstant;
    }
    eval::compare(op, x, y).map_or(LatticeValue::NonConstant, LatticeValue::bool)
}

/// Typed integer operation at its width. Overflow of a Smi operation
/// deoptimizes at run time, so it stays `NonConstant`.
pub fn fold_int_binary(
    op: BinaryOp,
    width: IntWidth,
    a: &LatticeValue,
    b: &LatticeValue,
) -> LatticeValue {
    let (x, y) = match constant_pair(a, b) {
        Ok(pair) => pair,
        Err(v) => return v,
    };
    let (Some(x), Some(y)) = (x.as_int(), y.as_int()) else {
        return LatticeValue::NonConstant;
    };
    match eval::int_binary_at(op, width, x, y) {
        IntOutcome::Value(v) => LatticeValue::int(v),
        IntOutcome::Overflow | IntOutcome::Throw(_) => LatticeValue::NonConstant,
    }
}

pub fn fold_int_unary(op: UnaryOp, width: IntWidth, a: &LatticeValue) -> LatticeValue {
    match a.as_int() {
        Some(x) => match eval::int_unary_at(op, width, x) {
            IntOutcome::Value(v) => LatticeValue::int(v),
            _ => LatticeValue::NonConstant,
        },
        None => unresolved_or_varying(a),
    }
}

pub fn fold_shift_mask(mask: i64, a: &LatticeValue, b: &LatticeValue) -> LatticeValue {
    match (a.as_int(), b.as_int()) {
        (Some(x), Some(y)) => match eval::shl64(x, y) {
            Ok(v) => LatticeValue::int(v & mask),
            Err(_) => LatticeValue::NonConstant,
        },
        _ => constant_pair(a, b).err().unwrap_or(LatticeValue::NonConstant),
    }
}

pub fn fold_double_binary(op: BinaryOp, a: &LatticeValue, b: &LatticeValue) -> LatticeValue {
    let (x, y) = match constant_pair(a, b) {
        Ok(pair) => pair,
        Err(v) => return v,
    };
    let (Some(x), Some(y)) = (as_double(x), as_double(y)) else {
        return LatticeValue::NonConstant;
    };
    match eval::double_binary(op, x, y) {
        Some(Ok(lit)) => LatticeValue::Constant(lit),
        _ => LatticeValue::NonConstant,
    }
}

pub fn fold_double_negate(a: &LatticeValue) -> LatticeValue {
    match a.as_constant().and_then(as_double) {
        Some(d) => LatticeValue::Constant(Literal::Double(-d)),
        None => unresolved_or_varying(a),
    }
}

fn as_double(lit: &Literal) -> Option<f64> {
    match lit {
        Literal::Int(v) => Some(*v as f64),
        Literal::Double(d) => Some(*d),
        _ => None,
    }
}

/// Representation change. Truncation to `uint32` is the only conversion
/// that changes the value.
pub fn fold_conversion(to: Repr, a: &LatticeValue) -> LatticeValue {
    match (to, a) {
        (Repr::Uint32, LatticeValue::Constant(Literal::Int(v))) => {
            LatticeValue::int(i64::from(*v as u32))
        }
        (Repr::Uint32, LatticeValue::Constant(_)) => LatticeValue::NonConstant,
        _ => a.clone(),
    }
}

/// `.length` of a constant string or array.
pub fn fold_length(a: &LatticeValue) -> LatticeValue {
    match a {
        LatticeValue::Constant(lit) => {
            lit.length().map_or(LatticeValue::NonConstant, LatticeValue::int)
        }
        other => unresolved_or_varying(other),
    }
}

/// `identical(a, b)`.
///
/// Operands that are the same definition (after skipping argument
/// marshaling and single-input phis) are identical whatever their value.
/// Two constants compare by identity; canonical constant nodes make equal
/// non-cheap literals the same object.
pub fn fold_strict_compare(
    graph: &FlowGraph,
    id: InstrId,
    negate: bool,
    values: &SecondaryMap<Instr, LatticeValue>,
) -> LatticeValue {
    let (a, b) = (graph.input(id, 0), graph.input(id, 1));
    if unwrap_copies(graph, a) == unwrap_copies(graph, b) {
        return LatticeValue::bool(!negate);
    }
    match constant_pair(&values[a], &values[b]) {
        Ok((x, y)) => LatticeValue::bool(x.identical(y) != negate),
        Err(v) => v,
    }
}

/// Skip instructions that forward their single operand unchanged.
pub fn unwrap_copies(graph: &FlowGraph, mut id: InstrId) -> InstrId {
    loop {
        match graph.op(id) {
            Op::PushArgument | Op::Constraint { .. } => id = graph.input(id, 0),
            Op::Phi if graph.instr(id).input_count() == 1 => id = graph.input(id, 0),
            _ => return id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn c(lit: Literal) -> LatticeValue {
        LatticeValue::Constant(lit)
    }

    #[test]
    fn test_generic_arithmetic() {
        assert_eq!(
            fold_generic_binary(BinaryOp::Add, &LatticeValue::int(3), &LatticeValue::int(4)),
            LatticeValue::int(7)
        );
        assert_eq!(
            fold_generic_binary(BinaryOp::Div, &LatticeValue::int(1), &LatticeValue::int(2)),
            c(Literal::Double(0.5))
        );
        assert_eq!(
            fold_generic_binary(BinaryOp::TruncDiv, &LatticeValue::int(1), &LatticeValue::int(0)),
            LatticeValue::NonConstant
        );
        assert_eq!(
            fold_generic_binary(BinaryOp::Add, &LatticeValue::Unknown, &LatticeValue::NonConstant),
            LatticeValue::Unknown
        );
    }

    #[test]
    fn test_string_concatenation_is_not_folded() {
        let a = c(Literal::Str(Arc::from("a")));
        let b = c(Literal::Str(Arc::from("b")));
        assert_eq!(fold_generic_binary(BinaryOp::Add, &a, &b), LatticeValue::NonConstant);
    }

    #[test]
    fn test_comparisons() {
        assert_eq!(
            fold_compare(CmpOp::Eq, &LatticeValue::int(5), &LatticeValue::int(5)),
            LatticeValue::bool(true)
        );
        let x = c(Literal::Str(Arc::from("x")));
        let y = c(Literal::Str(Arc::from("y")));
        assert_eq!(fold_compare(CmpOp::Eq, &x, &y), LatticeValue::bool(false));
        assert_eq!(fold_compare(CmpOp::Lt, &x, &y), LatticeValue::NonConstant);
        assert_eq!(
            fold_compare(CmpOp::Lt, &LatticeValue::int(1), &c(Literal::Double(1.5))),
            LatticeValue::bool(true)
        );
    }

    #[test]
    fn test_smi_overflow_is_not_folded() {
        let max = LatticeValue::int(crate::ir::types::SMI_MAX);
        assert_eq!(
            fold_int_binary(BinaryOp::Add, IntWidth::Smi, &max, &LatticeValue::int(1)),
            LatticeValue::NonConstant
        );
        assert_eq!(
            fold_int_binary(BinaryOp::Add, IntWidth::Int64, &max, &LatticeValue::int(1)),
            LatticeValue::int(crate::ir::types::SMI_MAX + 1)
        );
        assert_eq!(
            fold_int_binary(
                BinaryOp::Add,
                IntWidth::Uint32,
                &LatticeValue::int(0xFFFF_FFFF),
                &LatticeValue::int(1)
            ),
            LatticeValue::int(0)
        );
    }

    #[test]
    fn test_length_and_conversion() {
        let s = c(Literal::Str(Arc::from("abc")));
        assert_eq!(fold_length(&s), LatticeValue::int(3));
        assert_eq!(fold_length(&LatticeValue::int(3)), LatticeValue::NonConstant);
        assert_eq!(
            fold_conversion(Repr::Uint32, &LatticeValue::int(-1)),
            LatticeValue::int(0xFFFF_FFFF)
        );
        assert_eq!(fold_conversion(Repr::Int64, &LatticeValue::int(-1)), LatticeValue::int(-1));
    }

    #[test]
    fn test_shift_mask() {
        assert_eq!(
            fold_shift_mask(0xFF, &LatticeValue::int(0x1234), &LatticeValue::int(4)),
            LatticeValue::int(0x40)
        );
        assert_eq!(
            fold_shift_mask(0xFF, &LatticeValue::int(1), &LatticeValue::int(-1)),
            LatticeValue::NonConstant
        );
    }
}
