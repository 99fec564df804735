//! Instructions and the closed operator set.
//!
//! Every instruction is an [`Instr`] whose behavior is selected by its
//! [`Op`]. Operands are [`Use`] records linked into the defining
//! instruction's use list, so a definition can enumerate its consumers
//! without scanning the graph.

use super::arena::Id;
use super::graph::Block;
use super::range::{Range, RangeBoundary};
use super::types::{BinaryOp, ClassId, CmpOp, IntWidth, Literal, Repr, Selector, SimdKind, UnaryOp};
use crate::feedback::{CallSite, DeoptReasons};
use crate::hierarchy::FunctionId;

use smallvec::SmallVec;
use std::fmt;
use std::sync::Arc;

/// Instruction identifier.
pub type InstrId = Id<Instr>;

/// Use identifier.
pub type UseId = Id<Use>;

/// Environment identifier.
pub type EnvId = Id<Env>;

/// Block identifier.
pub type BlockId = Id<Block>;

/// Call-site identifier.
pub type SiteId = Id<CallSite>;

// =============================================================================
// Deopt Ids
// =============================================================================

/// Bailout id: names the logical program point an instruction belongs to.
///
/// Guards inserted for a call share the call's id, so a speculation failure
/// can be attributed to the call site that produced the feedback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeoptId(pub u32);

impl DeoptId {
    /// No program point.
    pub const NONE: Self = Self(u32::MAX);

    /// Whether this names a program point.
    #[inline]
    pub fn is_some(self) -> bool {
        self != Self::NONE
    }
}

impl Default for DeoptId {
    fn default() -> Self {
        Self::NONE
    }
}

// =============================================================================
// Operator Payloads
// =============================================================================

/// What a multi-way test or dispatch does for a class it has no entry for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MissAction {
    /// Speculation failure.
    Deopt,
    /// Fall back to the generic operation.
    Dispatch,
    /// Produce a fixed boolean.
    Result(bool),
}

/// One arm of a multi-target dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DispatchTarget {
    pub cid: ClassId,
    pub target: FunctionId,
}

// =============================================================================
// Operators
// =============================================================================

/// The closed set of instruction kinds.
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    // -------------------------------------------------------------------------
    // Values
    // -------------------------------------------------------------------------
    /// Canonical constant; lives in the entry block.
    Constant(Literal),
    /// Incoming argument.
    Parameter(u32),
    /// SSA merge. Input `i` flows in from predecessor `i` of the block.
    Phi,
    /// Argument marshaling for a generic call. Produces its input.
    PushArgument,

    // -------------------------------------------------------------------------
    // Calls
    // -------------------------------------------------------------------------
    /// Fully dynamic dispatch on the receiver (input 0).
    DynamicCall { selector: Selector, site: SiteId },
    /// Direct invocation of a known target.
    StaticCall { target: FunctionId },
    /// Ordered dispatch over known receiver classes.
    PolymorphicCall {
        selector: Selector,
        targets: Arc<[DispatchTarget]>,
        on_miss: MissAction,
        /// Class checked inline before the table.
        fast_path: Option<ClassId>,
    },
    /// Smi arithmetic with a generic-call slow path.
    CheckedSmiOp { op: BinaryOp },
    /// Smi comparison with a generic-call slow path.
    CheckedSmiCompare { op: CmpOp },

    // -------------------------------------------------------------------------
    // Typed arithmetic
    // -------------------------------------------------------------------------
    IntBinary { op: BinaryOp, width: IntWidth },
    IntUnary { op: UnaryOp, width: IntWidth },
    /// `(a << b) & mask` without overflow checks.
    ShiftMask { mask: i64 },
    /// Double arithmetic. Integer inputs are converted.
    DoubleBinary { op: BinaryOp },
    DoubleNegate,
    SimdBinary { kind: SimdKind, op: BinaryOp },
    IntCompare { op: CmpOp },
    DoubleCompare { op: CmpOp },
    /// `identical(a, b)`, or its negation.
    StrictCompare { negate: bool },

    // -------------------------------------------------------------------------
    // Representation adapters
    // -------------------------------------------------------------------------
    Box { from: Repr },
    Unbox { to: Repr },
    IntConverter { from: Repr, to: Repr },

    // -------------------------------------------------------------------------
    // Memory
    // -------------------------------------------------------------------------
    LoadField { offset: u32 },
    /// Inputs: object, value.
    StoreField { offset: u32 },
    /// Inputs: array, index.
    LoadIndexed,
    /// Inputs: array, index, value.
    StoreIndexed,
    /// Length of an array or string.
    LoadLength,
    LoadClassId,
    /// Code of a one-character string, -1 for any other string.
    StringToCharCode,
    AllocateObject { class: ClassId },

    // -------------------------------------------------------------------------
    // Type tests
    // -------------------------------------------------------------------------
    InstanceOf { ty: ClassId, site: Option<SiteId> },
    /// Produces its input if it is a `ty`, throws otherwise.
    AssertAssignable { ty: ClassId, site: Option<SiteId> },
    /// Table-driven instance test for `ty`.
    TestCids {
        ty: ClassId,
        table: Arc<[(ClassId, bool)]>,
        on_miss: MissAction,
    },

    // -------------------------------------------------------------------------
    // Guards
    // -------------------------------------------------------------------------
    CheckSmi,
    CheckClass { cids: Arc<[ClassId]> },
    /// Fails unless at least one of two inputs is a double.
    CheckEitherDouble,
    /// Inputs: length, index. Throws a range error when out of bounds.
    CheckBounds,
    /// Like `CheckBounds` but a failure is an internal error.
    AssertBounds,
    /// Range-analysis-only refinement of its input along one edge.
    Constraint {
        min: RangeBoundary,
        max: RangeBoundary,
        target: Option<BlockId>,
    },

    // -------------------------------------------------------------------------
    // Control
    // -------------------------------------------------------------------------
    Goto(BlockId),
    Branch { if_true: BlockId, if_false: BlockId },
    Return,
}

impl Op {
    /// Whether the instruction ends a block.
    #[inline]
    pub fn is_terminator(&self) -> bool {
        matches!(self, Op::Goto(_) | Op::Branch { .. } | Op::Return)
    }

    /// Whether the instruction produces a value.
    pub fn has_value(&self) -> bool {
        !matches!(
            self,
            Op::StoreField { .. }
                | Op::StoreIndexed
                | Op::CheckSmi
                | Op::CheckClass { .. }
                | Op::CheckEitherDouble
                | Op::CheckBounds
                | Op::AssertBounds
                | Op::Goto(_)
                | Op::Branch { .. }
                | Op::Return
        )
    }

    /// Whether the instruction is a generic or direct call.
    #[inline]
    pub fn is_call(&self) -> bool {
        matches!(
            self,
            Op::DynamicCall { .. }
                | Op::StaticCall { .. }
                | Op::PolymorphicCall { .. }
                | Op::CheckedSmiOp { .. }
                | Op::CheckedSmiCompare { .. }
        )
    }

    /// Whether the instruction can fail speculation and needs an environment.
    pub fn can_deoptimize(&self) -> bool {
        match self {
            Op::CheckSmi | Op::CheckClass { .. } | Op::CheckEitherDouble => true,
            Op::IntBinary {
                op,
                width: IntWidth::Smi,
            } => matches!(
                op,
                BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Shl | BinaryOp::TruncDiv
            ),
            Op::IntUnary {
                op: UnaryOp::Negate,
                width: IntWidth::Smi,
            } => true,
            Op::PolymorphicCall { on_miss, .. } | Op::TestCids { on_miss, .. } => {
                *on_miss == MissAction::Deopt
            }
            _ => false,
        }
    }

    /// Whether the instruction can throw a language-level error.
    pub fn can_throw(&self) -> bool {
        match self {
            op if op.is_call() => true,
            Op::IntBinary { op, .. } => matches!(
                op,
                BinaryOp::TruncDiv | BinaryOp::Mod | BinaryOp::Shl | BinaryOp::Shr
            ),
            Op::ShiftMask { .. } | Op::CheckBounds | Op::AssertAssignable { .. } => true,
            Op::InstanceOf { .. } => false,
            Op::TestCids { on_miss, .. } => *on_miss == MissAction::Dispatch,
            _ => false,
        }
    }

    /// Whether the instruction writes memory or runs arbitrary code.
    pub fn has_side_effects(&self) -> bool {
        self.is_call() || matches!(self, Op::StoreField { .. } | Op::StoreIndexed)
    }

    /// Whether two instances with equal operands always produce equal values.
    pub fn allows_cse(&self) -> bool {
        self.is_removable()
            && !matches!(
                self,
                Op::LoadField { .. }
                    | Op::LoadIndexed
                    | Op::AllocateObject { .. }
                    | Op::Constraint { .. }
            )
    }

    /// Whether the instruction may be deleted once its value is unused.
    pub fn is_removable(&self) -> bool {
        self.has_value()
            && !self.has_side_effects()
            && !self.can_throw()
            && !self.can_deoptimize()
            && !matches!(self, Op::Parameter(_) | Op::Phi)
    }

    /// Representation of the produced value.
    pub fn repr(&self) -> Repr {
        match self {
            Op::IntBinary { width, .. } | Op::IntUnary { width, .. } => width.repr(),
            Op::Unbox { to } | Op::IntConverter { to, .. } => *to,
            _ => Repr::Tagged,
        }
    }

    /// Representation expected for input `index`.
    pub fn input_repr(&self, index: usize) -> Repr {
        match self {
            Op::IntBinary { op, width } => {
                if op.is_shift() && index == 1 && *width != IntWidth::Smi {
                    Repr::Int64
                } else {
                    width.repr()
                }
            }
            Op::IntUnary { width, .. } => width.repr(),
            Op::Box { from } | Op::IntConverter { from, .. } => *from,
            _ => Repr::Tagged,
        }
    }

    /// Reason recorded against the originating call site when this
    /// instruction fails speculation.
    pub fn deopt_reason(&self) -> DeoptReasons {
        match self {
            Op::CheckSmi => DeoptReasons::CHECK_SMI,
            Op::CheckClass { .. } => DeoptReasons::CHECK_CLASS,
            Op::CheckEitherDouble => DeoptReasons::BINARY_DOUBLE_OP,
            Op::IntBinary { .. } => DeoptReasons::BINARY_SMI_OP,
            Op::IntUnary { .. } => DeoptReasons::UNARY_SMI_OP,
            Op::PolymorphicCall { .. } => DeoptReasons::POLYMORPHIC_MISS,
            Op::TestCids { .. } => DeoptReasons::TEST_CIDS,
            _ => DeoptReasons::empty(),
        }
    }

    /// Short name used by the printer.
    pub fn mnemonic(&self) -> &'static str {
        match self {
            Op::Constant(_) => "Constant",
            Op::Parameter(_) => "Parameter",
            Op::Phi => "Phi",
            Op::PushArgument => "PushArgument",
            Op::DynamicCall { .. } => "DynamicCall",
            Op::StaticCall { .. } => "StaticCall",
            Op::PolymorphicCall { .. } => "PolymorphicCall",
            Op::CheckedSmiOp { .. } => "CheckedSmiOp",
            Op::CheckedSmiCompare { .. } => "CheckedSmiCompare",
            Op::IntBinary { .. } => "IntBinary",
            Op::IntUnary { .. } => "IntUnary",
            Op::ShiftMask { .. } => "ShiftMask",
            Op::DoubleBinary { .. } => "DoubleBinary",
            Op::DoubleNegate => "DoubleNegate",
            Op::SimdBinary { .. } => "SimdBinary",
            Op::IntCompare { .. } => "IntCompare",
            Op::DoubleCompare { .. } => "DoubleCompare",
            Op::StrictCompare { .. } => "StrictCompare",
            Op::Box { .. } => "Box",
            Op::Unbox { .. } => "Unbox",
            Op::IntConverter { .. } => "IntConverter",
            Op::LoadField { .. } => "LoadField",
            Op::StoreField { .. } => "StoreField",
            Op::LoadIndexed => "LoadIndexed",
            Op::StoreIndexed => "StoreIndexed",
            Op::LoadLength => "LoadLength",
            Op::LoadClassId => "LoadClassId",
            Op::StringToCharCode => "StringToCharCode",
            Op::AllocateObject { .. } => "AllocateObject",
            Op::InstanceOf { .. } => "InstanceOf",
            Op::AssertAssignable { .. } => "AssertAssignable",
            Op::TestCids { .. } => "TestCids",
            Op::CheckSmi => "CheckSmi",
            Op::CheckClass { .. } => "CheckClass",
            Op::CheckEitherDouble => "CheckEitherDouble",
            Op::CheckBounds => "CheckBounds",
            Op::AssertBounds => "AssertBounds",
            Op::Constraint { .. } => "Constraint",
            Op::Goto(_) => "Goto",
            Op::Branch { .. } => "Branch",
            Op::Return => "Return",
        }
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mnemonic())?;
        match self {
            Op::Constant(lit) => write!(f, "({lit})"),
            Op::Parameter(i) => write!(f, "({i})"),
            Op::DynamicCall { selector, .. } => write!(f, "<{selector}>"),
            Op::StaticCall { target } => write!(f, "<fn{}>", target.0),
            Op::PolymorphicCall {
                selector, targets, ..
            } => write!(f, "<{selector}, {} targets>", targets.len()),
            Op::CheckedSmiOp { op } | Op::DoubleBinary { op } => write!(f, "<{}>", op.symbol()),
            Op::CheckedSmiCompare { op } | Op::IntCompare { op } | Op::DoubleCompare { op } => {
                write!(f, "<{}>", op.symbol())
            }
            Op::IntBinary { op, width } => write!(f, "<{}, {width:?}>", op.symbol()),
            Op::IntUnary { op, width } => write!(f, "<{op:?}, {width:?}>"),
            Op::ShiftMask { mask } => write!(f, "<{mask:#x}>"),
            Op::SimdBinary { kind, op } => write!(f, "<{kind:?}, {}>", op.symbol()),
            Op::StrictCompare { negate } => f.write_str(if *negate { "<!==>" } else { "<===>" }),
            Op::Box { from } => write!(f, "<{from:?}>"),
            Op::Unbox { to } => write!(f, "<{to:?}>"),
            Op::IntConverter { from, to } => write!(f, "<{from:?}->{to:?}>"),
            Op::LoadField { offset } | Op::StoreField { offset } => write!(f, "<+{offset}>"),
            Op::AllocateObject { class } => write!(f, "<{class}>"),
            Op::InstanceOf { ty, .. } | Op::AssertAssignable { ty, .. } => write!(f, "<{ty}>"),
            Op::TestCids { ty, table, .. } => write!(f, "<{ty}, {} cids>", table.len()),
            Op::CheckClass { cids } => write!(f, "<{cids:?}>"),
            Op::Constraint { min, max, .. } => write!(f, "<{min}..{max}>"),
            Op::Goto(target) => write!(f, " B{target}"),
            Op::Branch { if_true, if_false } => write!(f, " B{if_true} B{if_false}"),
            _ => Ok(()),
        }
    }
}

// =============================================================================
// Instructions
// =============================================================================

bitflags::bitflags! {
    /// Instruction state bits.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct InstrFlags: u8 {
        /// Detached from the graph.
        const REMOVED = 0b0000_0001;
        /// Created by an optimization pass.
        const SYNTHETIC = 0b0000_0010;
    }
}

/// A node of the flow graph.
#[derive(Debug, Clone)]
pub struct Instr {
    /// Operator.
    pub op: Op,
    /// Operand uses, in operand order.
    pub(crate) inputs: SmallVec<[UseId; 3]>,
    /// Owning block.
    pub block: BlockId,
    /// Snapshot of live values for recovery, if the instruction can fail.
    pub env: Option<EnvId>,
    /// Logical program point.
    pub deopt_id: DeoptId,
    /// Source position.
    pub position: u32,
    /// Inferred integer range.
    pub range: Option<Range>,
    /// State bits.
    pub flags: InstrFlags,
}

impl Instr {
    pub(crate) fn new(op: Op, block: BlockId) -> Self {
        Self {
            op,
            inputs: SmallVec::new(),
            block,
            env: None,
            deopt_id: DeoptId::NONE,
            position: 0,
            range: None,
            flags: InstrFlags::empty(),
        }
    }

    /// Whether the instruction has been detached.
    #[inline]
    pub fn is_removed(&self) -> bool {
        self.flags.contains(InstrFlags::REMOVED)
    }

    /// Number of operands.
    #[inline]
    pub fn input_count(&self) -> usize {
        self.inputs.len()
    }
}

// =============================================================================
// Uses and Environments
// =============================================================================

/// Where a use sits in its user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UseSlot {
    /// Operand `n`.
    Input(u16),
    /// Environment entry `n`.
    Env(u16),
}

/// A reference from a consumer to a definition.
///
/// Uses of one definition form a doubly linked list threaded through the
/// use arena.
#[derive(Debug, Clone)]
pub struct Use {
    /// Definition being read.
    pub def: InstrId,
    /// Consuming instruction.
    pub user: InstrId,
    /// Position inside the consumer.
    pub slot: UseSlot,
    pub(crate) prev: Option<UseId>,
    pub(crate) next: Option<UseId>,
    pub(crate) live: bool,
}

/// Values that must be materialized if the owning instruction fails.
#[derive(Debug, Clone, Default)]
pub struct Env {
    pub(crate) values: SmallVec<[UseId; 8]>,
}

impl Env {
    /// Number of captured values.
    #[inline]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether nothing is captured.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}
