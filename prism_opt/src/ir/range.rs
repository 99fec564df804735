//! Integer ranges.
//!
//! A [`Range`] is a pair of [`RangeBoundary`] values bounding every value an
//! integer definition can take at runtime. Boundaries are either constants,
//! infinities, or *symbolic*: `def + offset`, where `def` is another integer
//! definition. Symbolic boundaries let bounds-check elimination prove
//! `i < a.length` without knowing the length.
//!
//! Boundary arithmetic never wraps. An operation whose exact result leaves
//! the `i64` domain reports overflow and the caller decides between
//! saturating to infinity and giving up.

use super::graph::FlowGraph;
use super::instr::{InstrId, Op};
use super::types::{BinaryOp, IntWidth, Repr};

use std::cmp::Ordering;
use std::fmt;

/// Depth limit when resolving symbolic boundaries through other ranges.
const MAX_RESOLVE_DEPTH: u32 = 16;

// =============================================================================
// Range Boundary
// =============================================================================

/// One end of a range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RangeBoundary {
    /// Not computed.
    Unknown,
    NegativeInfinity,
    PositiveInfinity,
    Constant(i64),
    /// `def + offset`.
    Symbol { def: InstrId, offset: i64 },
}

impl RangeBoundary {
    /// Symbolic boundary with zero offset.
    #[inline]
    pub fn symbol(def: InstrId) -> Self {
        Self::Symbol { def, offset: 0 }
    }

    /// Whether this is a constant.
    #[inline]
    pub fn is_constant(self) -> bool {
        matches!(self, Self::Constant(_))
    }

    /// Constant payload.
    #[inline]
    pub fn constant_value(self) -> Option<i64> {
        match self {
            Self::Constant(v) => Some(v),
            _ => None,
        }
    }

    /// Whether this is symbolic.
    #[inline]
    pub fn is_symbol(self) -> bool {
        matches!(self, Self::Symbol { .. })
    }

    /// Whether this is either infinity.
    #[inline]
    pub fn is_infinity(self) -> bool {
        matches!(self, Self::NegativeInfinity | Self::PositiveInfinity)
    }

    /// Shift by a constant. `on_overflow` is returned when the exact result
    /// is not representable.
    pub fn shifted(self, by: i64, on_overflow: Self) -> Self {
        match self {
            Self::Constant(v) => v.checked_add(by).map_or(on_overflow, Self::Constant),
            Self::Symbol { def, offset } => offset
                .checked_add(by)
                .map_or(on_overflow, |offset| Self::Symbol { def, offset }),
            other => other,
        }
    }

    /// Smallest value this boundary can stand for: a constant or `-∞`.
    pub fn lower_bound(self, graph: &FlowGraph) -> Self {
        self.resolve(graph, true, 0)
    }

    /// Largest value this boundary can stand for: a constant or `+∞`.
    pub fn upper_bound(self, graph: &FlowGraph) -> Self {
        self.resolve(graph, false, 0)
    }

    /// [`RangeBoundary::lower_bound`] as an integer, `i64::MIN` for `-∞`.
    pub fn lower_const(self, graph: &FlowGraph) -> i64 {
        match self.lower_bound(graph) {
            Self::Constant(v) => v,
            Self::PositiveInfinity => i64::MAX,
            _ => i64::MIN,
        }
    }

    /// [`RangeBoundary::upper_bound`] as an integer, `i64::MAX` for `+∞`.
    pub fn upper_const(self, graph: &FlowGraph) -> i64 {
        match self.upper_bound(graph) {
            Self::Constant(v) => v,
            Self::NegativeInfinity => i64::MIN,
            _ => i64::MAX,
        }
    }

    fn resolve(self, graph: &FlowGraph, lower: bool, depth: u32) -> Self {
        let unbounded = if lower {
            Self::NegativeInfinity
        } else {
            Self::PositiveInfinity
        };
        match self {
            Self::Constant(_) | Self::NegativeInfinity | Self::PositiveInfinity => self,
            Self::Unknown => unbounded,
            Self::Symbol { def, offset } => {
                if depth >= MAX_RESOLVE_DEPTH {
                    return unbounded;
                }
                if let Op::Constant(lit) = graph.op(def) {
                    if let Some(v) = lit.as_int() {
                        return Self::Constant(v).shifted(offset, unbounded);
                    }
                }
                let Some(range) = graph.instr(def).range else {
                    return unbounded;
                };
                let side = if lower { range.min } else { range.max };
                match side.resolve(graph, lower, depth + 1) {
                    Self::Constant(v) => Self::Constant(v).shifted(offset, unbounded),
                    _ => unbounded,
                }
            }
        }
    }

    /// Normalize a symbolic boundary by walking through constraints, value
    /// adapters and Smi additions or subtractions of constants, so that
    /// equivalent boundaries compare equal.
    pub fn canonicalize(self, graph: &FlowGraph) -> Self {
        let Self::Symbol {
            mut def,
            mut offset,
        } = self
        else {
            return self;
        };
        loop {
            match graph.op(def) {
                Op::Constant(lit) => {
                    if let Some(v) = lit.as_int() {
                        return Self::Constant(v).shifted(offset, Self::Symbol { def, offset });
                    }
                    break;
                }
                Op::Constraint { .. }
                | Op::Box {
                    from: Repr::Int64 | Repr::Uint32,
                }
                | Op::Unbox { to: Repr::Int64 } => def = graph.input(def, 0),
                Op::IntBinary {
                    op: op @ (BinaryOp::Add | BinaryOp::Sub),
                    width: IntWidth::Smi,
                } => {
                    let op = *op;
                    let (left, right) = (graph.input(def, 0), graph.input(def, 1));
                    let constants = (
                        graph.int_constant_value(left),
                        graph.int_constant_value(right),
                    );
                    let folded = match constants {
                        (_, Some(c)) => {
                            let delta = if op == BinaryOp::Add {
                                Some(c)
                            } else {
                                c.checked_neg()
                            };
                            delta.and_then(|d| offset.checked_add(d)).map(|o| (left, o))
                        }
                        (Some(c), None) if op == BinaryOp::Add => {
                            offset.checked_add(c).map(|o| (right, o))
                        }
                        _ => None,
                    };
                    match folded {
                        Some((next, next_offset)) => {
                            def = next;
                            offset = next_offset;
                        }
                        None => break,
                    }
                }
                _ => break,
            }
        }
        Self::Symbol { def, offset }
    }
}

impl fmt::Display for RangeBoundary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown => f.write_str("?"),
            Self::NegativeInfinity => f.write_str("-inf"),
            Self::PositiveInfinity => f.write_str("+inf"),
            Self::Constant(v) => write!(f, "{v}"),
            Self::Symbol { def, offset: 0 } => write!(f, "v{def}"),
            Self::Symbol { def, offset } => write!(f, "v{def}{offset:+}"),
        }
    }
}

/// Whether two definitions provably hold the same value.
///
/// Constraints and value adapters are transparent. Beyond identity, two
/// side-effect-free instructions reading immutable state are equal when
/// their operators and operands are.
pub fn are_equal_definitions(graph: &FlowGraph, a: InstrId, b: InstrId) -> bool {
    let (a, b) = (graph.unwrap_constraint(a), graph.unwrap_constraint(b));
    if a == b {
        return true;
    }
    let (ia, ib) = (graph.instr(a), graph.instr(b));
    if !ia.op.allows_cse() || ia.op != ib.op || ia.input_count() != ib.input_count() {
        return false;
    }
    (0..ia.input_count()).all(|i| {
        graph.unwrap_constraint(graph.input(a, i)) == graph.unwrap_constraint(graph.input(b, i))
    })
}

/// Canonicalize both boundaries and, when they are offsets from the same
/// value, return the offsets.
fn common_symbol(graph: &FlowGraph, a: RangeBoundary, b: RangeBoundary) -> Option<(i64, i64)> {
    match (a.canonicalize(graph), b.canonicalize(graph)) {
        (
            RangeBoundary::Symbol { def: da, offset: oa },
            RangeBoundary::Symbol { def: db, offset: ob },
        ) if are_equal_definitions(graph, da, db) => Some((oa, ob)),
        (RangeBoundary::Constant(x), RangeBoundary::Constant(y)) => Some((x, y)),
        _ => None,
    }
}

/// Whether `a < b` holds for every runtime value of the boundaries.
pub fn is_less_than(graph: &FlowGraph, a: RangeBoundary, b: RangeBoundary) -> bool {
    if let Some((oa, ob)) = common_symbol(graph, a, b) {
        return oa < ob;
    }
    match (a.upper_bound(graph), b.lower_bound(graph)) {
        (RangeBoundary::Constant(x), RangeBoundary::Constant(y)) => x < y,
        _ => false,
    }
}

// =============================================================================
// Range
// =============================================================================

/// Closed interval `[min, max]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Range {
    pub min: RangeBoundary,
    pub max: RangeBoundary,
}

impl Range {
    /// Range from two boundaries.
    #[inline]
    pub const fn new(min: RangeBoundary, max: RangeBoundary) -> Self {
        Self { min, max }
    }

    /// `[lo, hi]`.
    #[inline]
    pub const fn of(lo: i64, hi: i64) -> Self {
        Self::new(RangeBoundary::Constant(lo), RangeBoundary::Constant(hi))
    }

    /// `[v, v]`.
    #[inline]
    pub const fn constant(v: i64) -> Self {
        Self::of(v, v)
    }

    /// `(-∞, +∞)`.
    #[inline]
    pub const fn full() -> Self {
        Self::new(RangeBoundary::NegativeInfinity, RangeBoundary::PositiveInfinity)
    }

    /// Full range of a representation.
    pub fn of_width(width: IntWidth) -> Self {
        match width {
            IntWidth::Smi => Self::of(super::types::SMI_MIN, super::types::SMI_MAX),
            IntWidth::Int64 => Self::full(),
            IntWidth::Uint32 => Self::of(0, super::types::UINT32_MAX),
        }
    }

    /// Constant bounds `[lo, hi]`, with infinities mapped to the `i64` limits.
    pub fn constant_bounds(&self, graph: &FlowGraph) -> (i64, i64) {
        (self.min.lower_const(graph), self.max.upper_const(graph))
    }

    /// Whether every value lies in `[lo, hi]`.
    pub fn is_within(&self, lo: i64, hi: i64, graph: &FlowGraph) -> bool {
        let (min, max) = (self.min.lower_bound(graph), self.max.upper_bound(graph));
        matches!(
            (min, max),
            (RangeBoundary::Constant(a), RangeBoundary::Constant(b)) if a >= lo && b <= hi
        )
    }

    /// Whether the range provably holds no value.
    pub fn is_unsatisfiable(&self, graph: &FlowGraph) -> bool {
        if let Some((lo, hi)) = common_symbol(graph, self.min, self.max) {
            return lo > hi;
        }
        matches!(
            (self.min.lower_bound(graph), self.max.upper_bound(graph)),
            (RangeBoundary::Constant(a), RangeBoundary::Constant(b)) if a > b
        ) || matches!(self.min.lower_bound(graph), RangeBoundary::PositiveInfinity)
            || matches!(self.max.upper_bound(graph), RangeBoundary::NegativeInfinity)
    }

    /// Whether the minimum is provably non-negative.
    pub fn is_non_negative(&self, graph: &FlowGraph) -> bool {
        self.min.lower_const(graph) >= 0
    }

    /// Whether the maximum is provably non-positive.
    pub fn is_non_positive(&self, graph: &FlowGraph) -> bool {
        self.max.upper_const(graph) <= 0
    }

    /// Smallest range containing both.
    pub fn join(&self, other: &Range, graph: &FlowGraph) -> Range {
        Range::new(
            join_min(graph, self.min, other.min),
            join_max(graph, self.max, other.max),
        )
    }

    /// Intersection. May be unsatisfiable.
    pub fn intersect(&self, other: &Range, graph: &FlowGraph) -> Range {
        Range::new(
            intersection_min(graph, self.min, other.min),
            intersection_max(graph, self.max, other.max),
        )
    }

    /// Whether either boundary names `def`.
    pub fn mentions(&self, def: InstrId) -> bool {
        [self.min, self.max]
            .into_iter()
            .any(|b| matches!(b, RangeBoundary::Symbol { def: d, .. } if d == def))
    }

    /// Clamp to the representable range of `width`.
    pub fn clamp_to(&self, width: IntWidth, graph: &FlowGraph) -> Range {
        self.intersect(&Range::of_width(width), graph)
    }
}

impl fmt::Display for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.min, self.max)
    }
}

// =============================================================================
// Boundary Lattice Operations
// =============================================================================

/// `a` when `order` is `Less`, `b` when `Greater`. Equivalent boundaries
/// resolve to a constant, then to the lower definition id, so repeated runs
/// pick the same symbol.
fn pick(order: Ordering, a: RangeBoundary, b: RangeBoundary) -> RangeBoundary {
    match order {
        Ordering::Less => a,
        Ordering::Greater => b,
        Ordering::Equal => match (a, b) {
            (RangeBoundary::Symbol { def: da, .. }, RangeBoundary::Symbol { def: db, .. }) => {
                if db < da {
                    b
                } else {
                    a
                }
            }
            (_, RangeBoundary::Constant(_)) => b,
            _ => a,
        },
    }
}

fn join_min(graph: &FlowGraph, a: RangeBoundary, b: RangeBoundary) -> RangeBoundary {
    if a == b {
        return a;
    }
    if let (RangeBoundary::Symbol { .. }, RangeBoundary::Symbol { .. }) = (a, b) {
        if let Some((oa, ob)) = common_symbol(graph, a, b) {
            return pick(oa.cmp(&ob), a, b);
        }
    }
    let (x, y) = (a.lower_bound(graph), b.lower_bound(graph));
    match (x, y) {
        (RangeBoundary::Constant(x), RangeBoundary::Constant(y)) => {
            RangeBoundary::Constant(x.min(y))
        }
        _ => RangeBoundary::NegativeInfinity,
    }
}

fn join_max(graph: &FlowGraph, a: RangeBoundary, b: RangeBoundary) -> RangeBoundary {
    if a == b {
        return a;
    }
    if let (RangeBoundary::Symbol { .. }, RangeBoundary::Symbol { .. }) = (a, b) {
        if let Some((oa, ob)) = common_symbol(graph, a, b) {
            return pick(ob.cmp(&oa), a, b);
        }
    }
    let (x, y) = (a.upper_bound(graph), b.upper_bound(graph));
    match (x, y) {
        (RangeBoundary::Constant(x), RangeBoundary::Constant(y)) => {
            RangeBoundary::Constant(x.max(y))
        }
        _ => RangeBoundary::PositiveInfinity,
    }
}

/// Larger of two lower boundaries. Keeps a symbolic boundary when the other
/// side carries no information or is provably weaker.
fn intersection_min(graph: &FlowGraph, a: RangeBoundary, b: RangeBoundary) -> RangeBoundary {
    if a == b {
        return a;
    }
    if matches!(a, RangeBoundary::NegativeInfinity | RangeBoundary::Unknown) {
        return b;
    }
    if matches!(b, RangeBoundary::NegativeInfinity | RangeBoundary::Unknown) {
        return a;
    }
    if let Some((oa, ob)) = common_symbol(graph, a, b) {
        return pick(ob.cmp(&oa), a, b);
    }
    let (inf_a, inf_b) = (a.lower_const(graph), b.lower_const(graph));
    let (sup_a, sup_b) = (a.upper_const(graph), b.upper_const(graph));
    if sup_a <= inf_b {
        b
    } else if sup_b <= inf_a {
        a
    } else {
        RangeBoundary::Constant(inf_a.max(inf_b))
    }
}

/// Smaller of two upper boundaries.
fn intersection_max(graph: &FlowGraph, a: RangeBoundary, b: RangeBoundary) -> RangeBoundary {
    if a == b {
        return a;
    }
    if matches!(a, RangeBoundary::PositiveInfinity | RangeBoundary::Unknown) {
        return b;
    }
    if matches!(b, RangeBoundary::PositiveInfinity | RangeBoundary::Unknown) {
        return a;
    }
    if let Some((oa, ob)) = common_symbol(graph, a, b) {
        return pick(oa.cmp(&ob), a, b);
    }
    let (inf_a, inf_b) = (a.lower_const(graph), b.lower_const(graph));
    let (sup_a, sup_b) = (a.upper_const(graph), b.upper_const(graph));
    if sup_a <= inf_b {
        a
    } else if sup_b <= inf_a {
        b
    } else {
        RangeBoundary::Constant(sup_a.min(sup_b))
    }
}

// =============================================================================
// Tests
// =============================================================================
