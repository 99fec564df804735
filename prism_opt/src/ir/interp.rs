//! Reference interpreter.
//!
//! Executes a [`FlowGraph`] against a [`ClassHierarchy`] with the exact
//! language semantics of the built-in operators. Unoptimized graphs run
//! through generic dispatch; optimized graphs run their typed operations,
//! guards and adapters directly. A failing guard ends the run with
//! [`Outcome::Deopt`], leaving recovery to the caller.
//!
//! The interpreter doubles as the profiling tier: with profiling enabled it
//! records call-site feedback for the root graph, which callers fold back
//! with [`FlowGraph::merge_feedback`].

use super::eval::{self, IntOutcome, Thrown};
use super::graph::FlowGraph;
use super::instr::{BlockId, DeoptId, InstrId, MissAction, Op, SiteId};
use super::types::{is_smi, ClassId, CmpOp, IntWidth, Literal, Repr, Selector, SimdKind, UnaryOp};
use crate::feedback::{DeoptReasons, FeedbackRecord};
use crate::hierarchy::{ClassHierarchy, FunctionId, FunctionKind};

use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;
use thiserror::Error;

/// Default instruction budget for one run.
pub const DEFAULT_FUEL: u64 = 1_000_000;

/// Maximum nesting of calls into function bodies.
const MAX_CALL_DEPTH: u32 = 64;

// =============================================================================
// Values
// =============================================================================

/// Packed vector payload.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SimdValue {
    Float32x4([f32; 4]),
    Int32x4([i32; 4]),
    Float64x2([f64; 2]),
}

impl SimdValue {
    fn kind(&self) -> SimdKind {
        match self {
            Self::Float32x4(_) => SimdKind::Float32x4,
            Self::Int32x4(_) => SimdKind::Int32x4,
            Self::Float64x2(_) => SimdKind::Float64x2,
        }
    }

    fn lanewise(self, op: super::types::BinaryOp, other: Self) -> Option<Self> {
        use super::types::BinaryOp::*;
        fn zip<T: Copy, const N: usize>(a: [T; N], b: [T; N], f: impl Fn(T, T) -> T) -> [T; N] {
            std::array::from_fn(|i| f(a[i], b[i]))
        }
        Some(match (self, other) {
            (Self::Float32x4(a), Self::Float32x4(b)) => Self::Float32x4(match op {
                Add => zip(a, b, |x, y| x + y),
                Sub => zip(a, b, |x, y| x - y),
                Mul => zip(a, b, |x, y| x * y),
                Div => zip(a, b, |x, y| x / y),
                _ => return None,
            }),
            (Self::Float64x2(a), Self::Float64x2(b)) => Self::Float64x2(match op {
                Add => zip(a, b, |x, y| x + y),
                Sub => zip(a, b, |x, y| x - y),
                Mul => zip(a, b, |x, y| x * y),
                Div => zip(a, b, |x, y| x / y),
                _ => return None,
            }),
            (Self::Int32x4(a), Self::Int32x4(b)) => Self::Int32x4(match op {
                Add => zip(a, b, i32::wrapping_add),
                Sub => zip(a, b, i32::wrapping_sub),
                Mul => zip(a, b, i32::wrapping_mul),
                BitAnd => zip(a, b, |x, y| x & y),
                BitOr => zip(a, b, |x, y| x | y),
                BitXor => zip(a, b, |x, y| x ^ y),
                _ => return None,
            }),
            _ => return None,
        })
    }
}

/// Heap object.
#[derive(Debug, Clone)]
pub struct Object {
    pub class: ClassId,
    pub fields: Vec<Value>,
}

/// Shared mutable array.
pub type ArrayRef = Rc<RefCell<Vec<Value>>>;

/// Shared mutable object.
pub type ObjectRef = Rc<RefCell<Object>>;

/// A runtime value.
#[derive(Debug, Clone)]
pub enum Value {
    Int(i64),
    Double(f64),
    Bool(bool),
    Null,
    Str(Arc<str>),
    Array(ArrayRef),
    Object(ObjectRef),
    Simd(SimdValue),
}

impl Value {
    /// New string value.
    pub fn str(s: &str) -> Self {
        Self::Str(Arc::from(s))
    }

    /// New array holding `items`.
    pub fn array(items: Vec<Value>) -> Self {
        Self::Array(Rc::new(RefCell::new(items)))
    }

    /// New array of integers.
    pub fn int_array(items: &[i64]) -> Self {
        Self::array(items.iter().map(|&v| Self::Int(v)).collect())
    }

    /// New object of class `class`.
    pub fn object(class: ClassId, fields: Vec<Value>) -> Self {
        Self::Object(Rc::new(RefCell::new(Object { class, fields })))
    }

    /// Concrete class of the value.
    pub fn class_id(&self) -> ClassId {
        match self {
            Self::Int(v) => ClassId::of_int(*v),
            Self::Double(_) => ClassId::DOUBLE,
            Self::Bool(_) => ClassId::BOOL,
            Self::Null => ClassId::NULL,
            Self::Str(_) => ClassId::STRING,
            Self::Array(_) => ClassId::ARRAY,
            Self::Object(o) => o.borrow().class,
            Self::Simd(s) => s.kind().class_id(),
        }
    }

    /// Materialize a constant. Constant arrays become fresh arrays.
    pub fn from_literal(lit: &Literal) -> Self {
        match lit {
            Literal::Int(v) => Self::Int(*v),
            Literal::Double(d) => Self::Double(*d),
            Literal::Bool(b) => Self::Bool(*b),
            Literal::Null => Self::Null,
            Literal::Str(s) => Self::Str(Arc::clone(s)),
            Literal::Array(items) => Self::array(items.iter().map(Self::from_literal).collect()),
        }
    }

    /// Primitive values as literals.
    pub fn to_literal(&self) -> Option<Literal> {
        Some(match self {
            Self::Int(v) => Literal::Int(*v),
            Self::Double(d) => Literal::Double(*d),
            Self::Bool(b) => Literal::Bool(*b),
            Self::Null => Literal::Null,
            Self::Str(s) => Literal::Str(Arc::clone(s)),
            _ => return None,
        })
    }

    /// Integer payload.
    #[inline]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    fn as_number(&self) -> Option<f64> {
        match self {
            Self::Int(v) => Some(*v as f64),
            Self::Double(d) => Some(*d),
            _ => None,
        }
    }

    /// `identical(a, b)`.
    pub fn identical(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Double(a), Self::Double(b)) => a.to_bits() == b.to_bits(),
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Null, Self::Null) => true,
            (Self::Str(a), Self::Str(b)) => Arc::ptr_eq(a, b),
            (Self::Array(a), Self::Array(b)) => Rc::ptr_eq(a, b),
            (Self::Object(a), Self::Object(b)) => Rc::ptr_eq(a, b),
            (Self::Simd(a), Self::Simd(b)) => a == b,
            _ => false,
        }
    }

    /// Deep structural equality, for comparing results of two runs.
    pub fn same_as(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Str(a), Self::Str(b)) => a == b,
            (Self::Array(a), Self::Array(b)) => {
                let (a, b) = (a.borrow(), b.borrow());
                a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x.same_as(y))
            }
            (Self::Object(a), Self::Object(b)) => {
                let (a, b) = (a.borrow(), b.borrow());
                a.class == b.class
                    && a.fields.len() == b.fields.len()
                    && a.fields.iter().zip(b.fields.iter()).all(|(x, y)| x.same_as(y))
            }
            _ => self.identical(other),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Array(items) => {
                f.write_str("[")?;
                for (i, item) in items.borrow().iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
            Self::Object(o) => write!(f, "<{} object>", o.borrow().class),
            Self::Simd(s) => write!(f, "{s:?}"),
            other => match other.to_literal() {
                Some(lit) => write!(f, "{lit}"),
                None => Ok(()),
            },
        }
    }
}

// =============================================================================
// Outcomes and Errors
// =============================================================================

/// How a run ended.
#[derive(Debug, Clone)]
pub enum Outcome {
    Return(Value),
    Throw(Thrown),
    /// A guard failed at program point `deopt_id`.
    Deopt {
        deopt_id: DeoptId,
        reason: DeoptReasons,
    },
}

impl Outcome {
    /// Whether two outcomes are observably the same.
    pub fn same_as(&self, other: &Outcome) -> bool {
        match (self, other) {
            (Self::Return(a), Self::Return(b)) => a.same_as(b),
            (Self::Throw(a), Self::Throw(b)) => a == b,
            _ => false,
        }
    }
}

/// Failures of the interpreter itself, never of the program.
#[derive(Debug, Clone, Error)]
pub enum InterpError {
    #[error("instruction budget exhausted")]
    OutOfFuel,
    #[error("call depth limit exceeded")]
    StackOverflow,
    #[error("v{instr}: {message}")]
    Malformed { instr: InstrId, message: String },
    #[error("eliminated bounds check at v{instr} would have failed")]
    AssertionFailed { instr: InstrId },
    #[error("v{instr} produced {value} outside its range {range}")]
    RangeViolation {
        instr: InstrId,
        value: i64,
        range: String,
    },
}

fn malformed(instr: InstrId, message: impl Into<String>) -> InterpError {
    InterpError::Malformed {
        instr,
        message: message.into(),
    }
}

/// Result of invoking a function: a value or a language exception.
type CallResult = Result<Result<Value, Thrown>, InterpError>;

/// What executing one instruction did.
enum Step {
    Next(Option<Value>),
    Jump(BlockId),
    Return(Value),
    Throw(Thrown),
    Deopt(DeoptReasons),
}

// =============================================================================
// Interpreter
// =============================================================================

/// Graph interpreter.
pub struct Interpreter<'h> {
    hierarchy: &'h dyn ClassHierarchy,
    fuel: u64,
    check_ranges: bool,
    profile: Option<FxHashMap<SiteId, FeedbackRecord>>,
    depth: u32,
}

impl fmt::Debug for Interpreter<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Interpreter")
            .field("fuel", &self.fuel)
            .field("check_ranges", &self.check_ranges)
            .field("profiling", &self.profile.is_some())
            .finish()
    }
}

impl<'h> Interpreter<'h> {
    /// Interpreter with the default budget.
    pub fn new(hierarchy: &'h dyn ClassHierarchy) -> Self {
        Self {
            hierarchy,
            fuel: DEFAULT_FUEL,
            check_ranges: false,
            profile: None,
            depth: 0,
        }
    }

    /// Set the instruction budget.
    pub fn with_fuel(mut self, fuel: u64) -> Self {
        self.fuel = fuel;
        self
    }

    /// Record call-site feedback while running.
    pub fn with_profiling(mut self) -> Self {
        self.profile = Some(FxHashMap::default());
        self
    }

    /// Fail the run when an integer value leaves its inferred range.
    pub fn with_range_checks(mut self) -> Self {
        self.check_ranges = true;
        self
    }

    /// Feedback collected so far.
    pub fn take_profile(&mut self) -> FxHashMap<SiteId, FeedbackRecord> {
        self.profile.as_mut().map(std::mem::take).unwrap_or_default()
    }

    /// Run `graph` on `args`.
    pub fn run(&mut self, graph: &FlowGraph, args: &[Value]) -> Result<Outcome, InterpError> {
        let mut values: Vec<Option<Value>> = vec![None; graph.instr_capacity()];
        let mut block = graph.entry();
        let mut prev: Option<BlockId> = None;

        loop {
            let instrs = graph.block(block).instrs();
            let phis = graph.phis(block);
            if !phis.is_empty() {
                let from = prev.ok_or_else(|| malformed(phis[0], "phi in entry block"))?;
                let index = graph
                    .block(block)
                    .preds()
                    .iter()
                    .position(|&p| p == from)
                    .ok_or_else(|| malformed(phis[0], "entered from a non-predecessor"))?;
                let incoming: Vec<Value> = phis
                    .iter()
                    .map(|&phi| self.read(&values, graph, phi, index))
                    .collect::<Result<_, _>>()?;
                for (&phi, v) in phis.iter().zip(incoming) {
                    self.produce(graph, &mut values, phi, v)?;
                }
            }

            let mut next = None;
            for &id in &instrs[phis.len()..] {
                self.burn()?;
                match self.step(graph, &values, id, args)? {
                    Step::Next(Some(v)) => self.produce(graph, &mut values, id, v)?,
                    Step::Next(None) => {}
                    Step::Jump(target) => {
                        next = Some(target);
                        break;
                    }
                    Step::Return(v) => return Ok(Outcome::Return(v)),
                    Step::Throw(t) => return Ok(Outcome::Throw(t)),
                    Step::Deopt(reason) => {
                        return Ok(Outcome::Deopt {
                            deopt_id: graph.instr(id).deopt_id,
                            reason,
                        })
                    }
                }
            }
            let target = next
                .ok_or_else(|| malformed(InstrId::INVALID, format!("B{block} fell through")))?;
            prev = Some(block);
            block = target;
        }
    }

    fn burn(&mut self) -> Result<(), InterpError> {
        if self.fuel == 0 {
            return Err(InterpError::OutOfFuel);
        }
        self.fuel -= 1;
        Ok(())
    }

    fn read(
        &self,
        values: &[Option<Value>],
        graph: &FlowGraph,
        id: InstrId,
        index: usize,
    ) -> Result<Value, InterpError> {
        let def = graph.input(id, index);
        values
            .get(def.as_usize())
            .cloned()
            .flatten()
            .ok_or_else(|| {
                malformed(id, format!("operand {index} (v{def}) read before definition"))
            })
    }

    fn produce(
        &self,
        graph: &FlowGraph,
        values: &mut [Option<Value>],
        id: InstrId,
        value: Value,
    ) -> Result<(), InterpError> {
        if self.check_ranges {
            if let (Some(range), Value::Int(v)) = (graph.instr(id).range, &value) {
                let (lo, hi) = range.constant_bounds(graph);
                if *v < lo || *v > hi {
                    return Err(InterpError::RangeViolation {
                        instr: id,
                        value: *v,
                        range: range.to_string(),
                    });
                }
            }
        }
        values[id.as_usize()] = Some(value);
        Ok(())
    }

    fn record(&mut self, site: SiteId, cids: &[ClassId], target: Option<FunctionId>) {
        if self.depth == 0 {
            if let Some(profile) = self.profile.as_mut() {
                profile.entry(site).or_default().record(cids, target);
            }
        }
    }

    fn step(
        &mut self,
        graph: &FlowGraph,
        values: &[Option<Value>],
        id: InstrId,
        args: &[Value],
    ) -> Result<Step, InterpError> {
        let instr = graph.instr(id);
        let n = instr.input_count();
        let input = |i: usize| self.read(values, graph, id, i);
        let int_input = |i: usize| -> Result<i64, InterpError> {
            input(i)?
                .as_int()
                .ok_or_else(|| malformed(id, format!("operand {i} is not an int")))
        };
        let operands = || -> Result<SmallVec<[Value; 4]>, InterpError> {
            (0..n).map(|i| self.read(values, graph, id, i)).collect()
        };
        let value = |v: Value| Ok(Step::Next(Some(v)));
        let from_call = |r: Result<Value, Thrown>| {
            Ok(match r {
                Ok(v) => Step::Next(Some(v)),
                Err(t) => Step::Throw(t),
            })
        };

        match &instr.op {
            Op::Constant(lit) => value(Value::from_literal(lit)),
            Op::Parameter(i) => args
                .get(*i as usize)
                .cloned()
                .map(|v| Step::Next(Some(v)))
                .ok_or_else(|| malformed(id, format!("missing argument {i}"))),
            Op::Phi => Err(malformed(id, "phi after the block header")),
            Op::PushArgument | Op::Constraint { .. } => value(input(0)?),

            // -----------------------------------------------------------------
            // Calls
            // -----------------------------------------------------------------
            Op::DynamicCall { selector, site } => {
                let operands = operands()?;
                if self.profile.is_some() {
                    let tested = match selector {
                        Selector::Binary(_)
                        | Selector::Compare(_)
                        | Selector::Index
                        | Selector::IndexSet => 2,
                        _ => 1,
                    };
                    let cids: SmallVec<[ClassId; 2]> =
                        operands.iter().take(tested).map(Value::class_id).collect();
                    let target = operands
                        .first()
                        .and_then(|r| self.hierarchy.lookup(r.class_id(), selector));
                    self.record(*site, &cids, target);
                }
                let r = self.invoke(id, selector, &operands)?;
                from_call(r)
            }
            Op::StaticCall { target } => {
                let operands = operands()?;
                let r = self.call_function(id, *target, &operands)?;
                from_call(r)
            }
            Op::PolymorphicCall {
                selector,
                targets,
                on_miss,
                ..
            } => {
                let operands = operands()?;
                let cid = operands
                    .first()
                    .map(Value::class_id)
                    .ok_or_else(|| malformed(id, "call without receiver"))?;
                match targets.iter().find(|t| t.cid == cid) {
                    Some(t) => {
                        let r = self.call_function(id, t.target, &operands)?;
                        from_call(r)
                    }
                    None => match on_miss {
                        MissAction::Deopt => Ok(Step::Deopt(DeoptReasons::POLYMORPHIC_MISS)),
                        MissAction::Dispatch => {
                            let r = self.invoke(id, selector, &operands)?;
                            from_call(r)
                        }
                        MissAction::Result(_) => Err(malformed(id, "boolean miss on a call")),
                    },
                }
            }
            Op::CheckedSmiOp { op } => {
                let (a, b) = (input(0)?, input(1)?);
                if let (Value::Int(x), Value::Int(y)) = (&a, &b) {
                    if is_smi(*x) && is_smi(*y) {
                        match eval::int_binary_at(*op, IntWidth::Smi, *x, *y) {
                            IntOutcome::Value(v) => return value(Value::Int(v)),
                            IntOutcome::Throw(t) => return Ok(Step::Throw(t.into())),
                            IntOutcome::Overflow => {}
                        }
                    }
                }
                let r = self.invoke(id, &Selector::Binary(*op), &[a, b])?;
                from_call(r)
            }
            Op::CheckedSmiCompare { op } => {
                let (a, b) = (input(0)?, input(1)?);
                if let (Value::Int(x), Value::Int(y)) = (&a, &b) {
                    return value(Value::Bool(op.eval(x, y)));
                }
                let r = self.invoke(id, &Selector::Compare(*op), &[a, b])?;
                from_call(r)
            }

            // -----------------------------------------------------------------
            // Typed arithmetic
            // -----------------------------------------------------------------
            Op::IntBinary { op, width } => {
                let (a, b) = (int_input(0)?, int_input(1)?);
                if *width == IntWidth::Smi && !(is_smi(a) && is_smi(b)) {
                    return Err(malformed(id, "Smi operation on a non-Smi operand"));
                }
                match eval::int_binary_at(*op, *width, a, b) {
                    IntOutcome::Value(v) => value(Value::Int(v)),
                    IntOutcome::Throw(t) => Ok(Step::Throw(t.into())),
                    IntOutcome::Overflow if *width == IntWidth::Smi => {
                        Ok(Step::Deopt(DeoptReasons::BINARY_SMI_OP))
                    }
                    IntOutcome::Overflow => {
                        Err(malformed(id, "operator is not an integer operation"))
                    }
                }
            }
            Op::IntUnary { op, width } => {
                let a = int_input(0)?;
                match eval::int_unary_at(*op, *width, a) {
                    IntOutcome::Value(v) => value(Value::Int(v)),
                    IntOutcome::Throw(t) => Ok(Step::Throw(t.into())),
                    IntOutcome::Overflow => Ok(Step::Deopt(DeoptReasons::UNARY_SMI_OP)),
                }
            }
            Op::ShiftMask { mask } => {
                let (a, b) = (int_input(0)?, int_input(1)?);
                match eval::shl64(a, b) {
                    Ok(v) => value(Value::Int(v & mask)),
                    Err(t) => Ok(Step::Throw(t.into())),
                }
            }
            Op::DoubleBinary { op } => {
                let (a, b) = (input(0)?, input(1)?);
                let (Some(x), Some(y)) = (a.as_number(), b.as_number()) else {
                    return Err(malformed(id, "double operation on a non-number"));
                };
                match eval::double_binary(*op, x, y) {
                    Some(Ok(lit)) => value(Value::from_literal(&lit)),
                    Some(Err(t)) => Ok(Step::Throw(t)),
                    None => Err(malformed(id, "operator is not a double operation")),
                }
            }
            Op::DoubleNegate => match input(0)?.as_number() {
                Some(d) => value(Value::Double(-d)),
                None => Err(malformed(id, "double negate of a non-number")),
            },
            Op::SimdBinary { kind, op } => match (input(0)?, input(1)?) {
                (Value::Simd(a), Value::Simd(b)) if a.kind() == *kind => match a.lanewise(*op, b) {
                    Some(v) => value(Value::Simd(v)),
                    None => Err(malformed(id, "unsupported lane operation")),
                },
                _ => Err(malformed(id, "vector operation on a non-vector")),
            },
            Op::IntCompare { op } => value(Value::Bool(op.eval(int_input(0)?, int_input(1)?))),
            Op::DoubleCompare { op } => {
                let (a, b) = (input(0)?, input(1)?);
                match (a.as_number(), b.as_number()) {
                    (Some(x), Some(y)) => value(Value::Bool(op.eval(x, y))),
                    _ => Err(malformed(id, "double comparison of a non-number")),
                }
            }
            Op::StrictCompare { negate } => {
                let same = input(0)?.identical(&input(1)?);
                value(Value::Bool(same != *negate))
            }

            // -----------------------------------------------------------------
            // Representation adapters
            // -----------------------------------------------------------------
            Op::Box { .. } => value(input(0)?),
            Op::Unbox { to: Repr::Uint32 } | Op::IntConverter { to: Repr::Uint32, .. } => {
                value(Value::Int(i64::from(int_input(0)? as u32)))
            }
            Op::Unbox { .. } => value(input(0)?),
            Op::IntConverter { .. } => value(Value::Int(int_input(0)?)),

            // -----------------------------------------------------------------
            // Memory
            // -----------------------------------------------------------------
            Op::LoadField { offset } => match input(0)? {
                Value::Object(o) => o
                    .borrow()
                    .fields
                    .get(*offset as usize)
                    .cloned()
                    .map(|v| Step::Next(Some(v)))
                    .ok_or_else(|| malformed(id, "field offset out of range")),
                _ => Err(malformed(id, "field load from a non-object")),
            },
            Op::StoreField { offset } => match input(0)? {
                Value::Object(o) => {
                    let v = input(1)?;
                    let mut o = o.borrow_mut();
                    let slot = o
                        .fields
                        .get_mut(*offset as usize)
                        .ok_or_else(|| malformed(id, "field offset out of range"))?;
                    *slot = v;
                    Ok(Step::Next(None))
                }
                _ => Err(malformed(id, "field store to a non-object")),
            },
            Op::LoadIndexed => {
                let (target, index) = (input(0)?, int_input(1)?);
                match index_value(&target, index) {
                    Some(Ok(v)) => value(v),
                    _ => Err(malformed(id, "unchecked indexed load out of bounds")),
                }
            }
            Op::StoreIndexed => {
                let (target, index, v) = (input(0)?, int_input(1)?, input(2)?);
                match target {
                    Value::Array(items) => {
                        let mut items = items.borrow_mut();
                        let slot = usize::try_from(index)
                            .ok()
                            .and_then(|i| items.get_mut(i))
                            .ok_or_else(|| malformed(id, "unchecked indexed store out of bounds"))?;
                        *slot = v;
                        Ok(Step::Next(None))
                    }
                    _ => Err(malformed(id, "indexed store to a non-array")),
                }
            }
            Op::LoadLength => match length_of(&input(0)?) {
                Some(len) => value(Value::Int(len)),
                None => Err(malformed(id, "length of a non-indexable value")),
            },
            Op::LoadClassId => value(Value::Int(i64::from(input(0)?.class_id().0))),
            Op::StringToCharCode => match input(0)? {
                Value::Str(s) => value(Value::Int(eval::char_code(&s))),
                _ => Err(malformed(id, "char code of a non-string")),
            },
            Op::AllocateObject { class } => {
                let fields = self.hierarchy.class(*class).map_or(0, |c| c.num_fields);
                value(Value::object(*class, vec![Value::Null; fields as usize]))
            }

            // -----------------------------------------------------------------
            // Type tests
            // -----------------------------------------------------------------
            Op::InstanceOf { ty, site } => {
                let cid = input(0)?.class_id();
                if let Some(site) = site {
                    self.record(*site, &[cid], None);
                }
                value(Value::Bool(self.hierarchy.is_subtype(cid, *ty)))
            }
            Op::AssertAssignable { ty, site } => {
                let v = input(0)?;
                let cid = v.class_id();
                if let Some(site) = site {
                    self.record(*site, &[cid], None);
                }
                if self.hierarchy.is_subtype(cid, *ty) {
                    value(v)
                } else {
                    Ok(Step::Throw(Thrown::TypeError {
                        actual: cid,
                        expected: *ty,
                    }))
                }
            }
            Op::TestCids { ty, table, on_miss } => {
                let cid = input(0)?.class_id();
                match table.iter().find(|(c, _)| *c == cid) {
                    Some(&(_, result)) => value(Value::Bool(result)),
                    None => match on_miss {
                        MissAction::Deopt => Ok(Step::Deopt(DeoptReasons::TEST_CIDS)),
                        MissAction::Dispatch => {
                            value(Value::Bool(self.hierarchy.is_subtype(cid, *ty)))
                        }
                        MissAction::Result(b) => value(Value::Bool(*b)),
                    },
                }
            }

            // -----------------------------------------------------------------
            // Guards
            // -----------------------------------------------------------------
            Op::CheckSmi => match input(0)? {
                Value::Int(v) if is_smi(v) => Ok(Step::Next(None)),
                _ => Ok(Step::Deopt(DeoptReasons::CHECK_SMI)),
            },
            Op::CheckClass { cids } => {
                if cids.contains(&input(0)?.class_id()) {
                    Ok(Step::Next(None))
                } else {
                    Ok(Step::Deopt(DeoptReasons::CHECK_CLASS))
                }
            }
            Op::CheckEitherDouble => {
                let either = matches!(input(0)?, Value::Double(_))
                    || matches!(input(1)?, Value::Double(_));
                Ok(if either {
                    Step::Next(None)
                } else {
                    Step::Deopt(DeoptReasons::BINARY_DOUBLE_OP)
                })
            }
            Op::CheckBounds => {
                let (length, index) = (int_input(0)?, int_input(1)?);
                if index < 0 || index >= length {
                    Ok(Step::Throw(Thrown::RangeError { index, length }))
                } else {
                    Ok(Step::Next(None))
                }
            }
            Op::AssertBounds => {
                let (length, index) = (int_input(0)?, int_input(1)?);
                if index < 0 || index >= length {
                    Err(InterpError::AssertionFailed { instr: id })
                } else {
                    Ok(Step::Next(None))
                }
            }

            // -----------------------------------------------------------------
            // Control
            // -----------------------------------------------------------------
            Op::Goto(target) => Ok(Step::Jump(*target)),
            Op::Branch { if_true, if_false } => match input(0)? {
                Value::Bool(true) => Ok(Step::Jump(*if_true)),
                Value::Bool(false) => Ok(Step::Jump(*if_false)),
                other => Err(malformed(id, format!("branch on non-boolean {other}"))),
            },
            Op::Return => Ok(Step::Return(input(0)?)),
        }
    }

    /// Full dynamic dispatch.
    fn invoke(&mut self, at: InstrId, selector: &Selector, operands: &[Value]) -> CallResult {
        let receiver = operands.first().ok_or_else(|| malformed(at, "call without receiver"))?;
        let cid = receiver.class_id();
        match self.hierarchy.lookup(cid, selector) {
            Some(target) => self.call_function(at, target, operands),
            None => Ok(Err(Thrown::NoSuchMethod {
                selector: selector.clone(),
                cid,
            })),
        }
    }

    fn call_function(&mut self, at: InstrId, target: FunctionId, operands: &[Value]) -> CallResult {
        let function = self
            .hierarchy
            .function(target)
            .ok_or_else(|| malformed(at, format!("unknown function fn{}", target.0)))?;
        match &function.kind {
            FunctionKind::Intrinsic(selector) => Ok(intrinsic(selector, operands)),
            FunctionKind::Constant(lit) => Ok(Ok(Value::from_literal(lit))),
            FunctionKind::Getter { offset } => match operands.first() {
                Some(Value::Object(o)) => o
                    .borrow()
                    .fields
                    .get(*offset as usize)
                    .cloned()
                    .map(Ok)
                    .ok_or_else(|| malformed(at, "getter offset out of range")),
                _ => Err(malformed(at, "getter on a non-object")),
            },
            FunctionKind::Setter { offset } => match operands {
                [Value::Object(o), v] => {
                    let mut o = o.borrow_mut();
                    let slot = o
                        .fields
                        .get_mut(*offset as usize)
                        .ok_or_else(|| malformed(at, "setter offset out of range"))?;
                    *slot = v.clone();
                    Ok(Ok(Value::Null))
                }
                _ => Err(malformed(at, "setter on a non-object")),
            },
            FunctionKind::Body(body) => {
                if self.depth >= MAX_CALL_DEPTH {
                    return Err(InterpError::StackOverflow);
                }
                let body = Arc::clone(body);
                self.depth += 1;
                let outcome = self.run(&body, operands);
                self.depth -= 1;
                match outcome? {
                    Outcome::Return(v) => Ok(Ok(v)),
                    Outcome::Throw(t) => Ok(Err(t)),
                    Outcome::Deopt { .. } => Err(malformed(at, "callee body deoptimized")),
                }
            }
        }
    }
}

// =============================================================================
// Built-in Operators
// =============================================================================

fn length_of(v: &Value) -> Option<i64> {
    match v {
        Value::Array(items) => Some(items.borrow().len() as i64),
        Value::Str(s) => Some(s.chars().count() as i64),
        _ => None,
    }
}

fn index_value(target: &Value, index: i64) -> Option<Result<Value, Thrown>> {
    let length = length_of(target)?;
    let Ok(i) = usize::try_from(index) else {
        return Some(Err(Thrown::RangeError { index, length }));
    };
    let found = match target {
        Value::Array(items) => items.borrow().get(i).cloned(),
        Value::Str(s) => s.chars().nth(i).map(|c| Value::Str(Arc::from(c.to_string().as_str()))),
        _ => None,
    };
    Some(found.ok_or(Thrown::RangeError { index, length }))
}

/// Generic semantics of a built-in selector.
fn intrinsic(selector: &Selector, operands: &[Value]) -> Result<Value, Thrown> {
    let receiver_cid = operands.first().map_or(ClassId::NULL, Value::class_id);
    let no_method = || Thrown::NoSuchMethod {
        selector: selector.clone(),
        cid: receiver_cid,
    };
    match (selector, operands) {
        (Selector::Binary(op), [Value::Simd(a), Value::Simd(b)]) => {
            a.lanewise(*op, *b).map(Value::Simd).ok_or_else(no_method)
        }
        (Selector::Binary(op), [a, b]) => match (a.to_literal(), b.to_literal()) {
            (Some(x), Some(y)) => match eval::binary(*op, &x, &y) {
                Some(r) => r.map(|lit| Value::from_literal(&lit)),
                None => Err(no_method()),
            },
            _ => Err(no_method()),
        },
        (Selector::Compare(op), [a, b]) => {
            if let (Some(x), Some(y)) = (a.to_literal(), b.to_literal()) {
                return eval::compare(*op, &x, &y).map(Value::Bool).ok_or_else(no_method);
            }
            match op {
                CmpOp::Eq => Ok(Value::Bool(a.identical(b))),
                CmpOp::Ne => Ok(Value::Bool(!a.identical(b))),
                _ => Err(no_method()),
            }
        }
        (Selector::Unary(UnaryOp::Negate), [Value::Double(d)]) => Ok(Value::Double(-d)),
        (Selector::Unary(op), [a]) => a
            .to_literal()
            .and_then(|x| eval::unary(*op, &x))
            .map(|lit| Value::from_literal(&lit))
            .ok_or_else(no_method),
        (Selector::Index, [target, index]) => match index {
            Value::Int(i) => index_value(target, *i).unwrap_or_else(|| Err(no_method())),
            other => Err(Thrown::TypeError {
                actual: other.class_id(),
                expected: ClassId::INT,
            }),
        },
        (Selector::IndexSet, [Value::Array(items), index, v]) => {
            let length = items.borrow().len() as i64;
            let Value::Int(i) = index else {
                return Err(Thrown::TypeError {
                    actual: index.class_id(),
                    expected: ClassId::INT,
                });
            };
            match usize::try_from(*i).ok().filter(|&i| (i as i64) < length) {
                Some(i) => {
                    items.borrow_mut()[i] = v.clone();
                    Ok(Value::Null)
                }
                None => Err(Thrown::RangeError { index: *i, length }),
            }
        }
        (Selector::Length, [target]) => length_of(target).map(Value::Int).ok_or_else(no_method),
        _ => Err(no_method()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hierarchy::ClassTable;
    use crate::ir::builder::FlowGraphBuilder;
    use crate::ir::types::{BinaryOp, IntWidth};

    fn returned(outcome: Outcome) -> Value {
        match outcome {
            Outcome::Return(v) => v,
            other => panic!("expected a return, got {other:?}"),
        }
    }

    #[test]
    fn test_generic_dispatch() {
        let table = ClassTable::new();
        let mut b = FlowGraphBuilder::new("add", 2);
        let (x, y) = (b.param(0), b.param(1));
        let sum = b.call(Selector::Binary(BinaryOp::Add), &[x, y]);
        b.ret(sum);
        let g = b.finish().expect("valid graph");

        let mut interp = Interpreter::new(&table);
        let v = returned(interp.run(&g, &[Value::Int(3), Value::Int(4)]).expect("run"));
        assert!(v.same_as(&Value::Int(7)));
        let v = returned(interp.run(&g, &[Value::Int(1), Value::Double(0.5)]).expect("run"));
        assert!(v.same_as(&Value::Double(1.5)));
        let v = returned(interp.run(&g, &[Value::str("a"), Value::str("b")]).expect("run"));
        assert!(v.same_as(&Value::str("ab")));
        let thrown = interp.run(&g, &[Value::Null, Value::Int(1)]).expect("run");
        assert!(matches!(thrown, Outcome::Throw(Thrown::NoSuchMethod { .. })));
    }

    #[test]
    fn test_profiling_records_operand_classes() {
        let table = ClassTable::new();
        let mut b = FlowGraphBuilder::new("add", 2);
        let (x, y) = (b.param(0), b.param(1));
        let sum = b.call(Selector::Binary(BinaryOp::Add), &[x, y]);
        b.ret(sum);
        let mut g = b.finish().expect("valid graph");

        let mut interp = Interpreter::new(&table).with_profiling();
        interp.run(&g, &[Value::Int(1), Value::Int(2)]).expect("run");
        interp.run(&g, &[Value::Int(1), Value::Double(2.0)]).expect("run");
        g.merge_feedback(interp.take_profile());
        let (_, site) = g.sites().next().expect("one site");
        assert_eq!(site.feedback.num_checks(), 2);
        assert!(site.feedback.includes_cid(1, ClassId::DOUBLE));
    }

    #[test]
    fn test_smi_overflow_deoptimizes() {
        let table = ClassTable::new();
        let mut b = FlowGraphBuilder::new("inc", 1);
        let x = b.param(0);
        let one = b.int(1);
        let sum = b.emit(
            Op::IntBinary {
                op: BinaryOp::Add,
                width: IntWidth::Smi,
            },
            &[x, one],
        );
        b.ret(sum);
        let g = b.finish().expect("valid graph");
        let mut interp = Interpreter::new(&table);
        let max = crate::ir::types::SMI_MAX;
        assert!(matches!(
            interp.run(&g, &[Value::Int(max)]),
            Ok(Outcome::Deopt { reason, .. }) if reason == DeoptReasons::BINARY_SMI_OP
        ));
        assert!(returned(interp.run(&g, &[Value::Int(1)]).expect("run")).same_as(&Value::Int(2)));
    }

    #[test]
    fn test_fuel_is_enforced() {
        let table = ClassTable::new();
        let mut b = FlowGraphBuilder::new("spin", 0);
        let header = b.new_block();
        b.goto(header);
        b.switch_to(header);
        b.goto(header);
        let g = b.finish().expect("valid graph");
        let mut interp = Interpreter::new(&table).with_fuel(100);
        assert!(matches!(interp.run(&g, &[]), Err(InterpError::OutOfFuel)));
    }

    #[test]
    fn test_index_out_of_range_throws() {
        let table = ClassTable::new();
        let mut b = FlowGraphBuilder::new("at", 2);
        let (a, i) = (b.param(0), b.param(1));
        let v = b.call(Selector::Index, &[a, i]);
        b.ret(v);
        let g = b.finish().expect("valid graph");
        let mut interp = Interpreter::new(&table);
        let out = interp.run(&g, &[Value::int_array(&[1, 2]), Value::Int(2)]).expect("run");
        assert!(matches!(out, Outcome::Throw(Thrown::RangeError { index: 2, length: 2 })));
        let out = interp.run(&g, &[Value::int_array(&[1, 2]), Value::Int(-1)]).expect("run");
        assert!(matches!(out, Outcome::Throw(Thrown::RangeError { .. })));
    }
}
