//! Value-level vocabulary of the IR: class ids, representations, literals
//! and operator kinds.
//!
//! Integers follow 64-bit two's complement semantics. A *Smi* is the narrow
//! tagged form of an integer (63 significant bits); any other integer is a
//! *Mint*. Both are the same language-level type, `int`.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

// =============================================================================
// Integer Limits
// =============================================================================

/// Smallest Smi value.
pub const SMI_MIN: i64 = -(1 << 62);

/// Largest Smi value.
pub const SMI_MAX: i64 = (1 << 62) - 1;

/// Largest length of any array or string.
pub const MAX_LENGTH: i64 = (1 << 30) - 1;

/// Largest value representable by the unboxed `uint32` representation.
pub const UINT32_MAX: i64 = u32::MAX as i64;

/// Whether `v` fits the Smi representation.
#[inline]
pub const fn is_smi(v: i64) -> bool {
    v >= SMI_MIN && v <= SMI_MAX
}

// =============================================================================
// Class Ids
// =============================================================================

/// Identifier of a concrete or abstract class in the class table.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClassId(pub u32);

impl ClassId {
    /// Root of the hierarchy.
    pub const OBJECT: Self = Self(0);
    /// Class of `null`.
    pub const NULL: Self = Self(1);
    /// Class of `true`/`false`.
    pub const BOOL: Self = Self(2);
    /// Narrow tagged integer.
    pub const SMI: Self = Self(3);
    /// Boxed 64-bit integer outside the Smi range.
    pub const MINT: Self = Self(4);
    /// IEEE-754 double.
    pub const DOUBLE: Self = Self(5);
    /// Immutable string.
    pub const STRING: Self = Self(6);
    /// Fixed-length array.
    pub const ARRAY: Self = Self(7);
    /// Four packed `f32` lanes.
    pub const FLOAT32X4: Self = Self(8);
    /// Four packed `i32` lanes.
    pub const INT32X4: Self = Self(9);
    /// Two packed `f64` lanes.
    pub const FLOAT64X2: Self = Self(10);
    /// Abstract `int`, implemented by Smi and Mint.
    pub const INT: Self = Self(11);
    /// Abstract `num`, implemented by `int` and double.
    pub const NUM: Self = Self(12);

    /// First id handed out to user classes.
    pub const FIRST_USER: u32 = 16;

    /// Class of an integer value.
    #[inline]
    pub const fn of_int(v: i64) -> Self {
        if is_smi(v) {
            Self::SMI
        } else {
            Self::MINT
        }
    }

    /// Whether this is one of the integer classes.
    #[inline]
    pub fn is_integer(self) -> bool {
        self == Self::SMI || self == Self::MINT
    }

    /// Whether this is an integer or double class.
    #[inline]
    pub fn is_number(self) -> bool {
        self.is_integer() || self == Self::DOUBLE
    }

    /// Whether this is one of the packed vector classes.
    #[inline]
    pub fn is_simd(self) -> bool {
        self == Self::FLOAT32X4 || self == Self::INT32X4 || self == Self::FLOAT64X2
    }
}

impl fmt::Debug for ClassId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match *self {
            Self::OBJECT => "Object",
            Self::NULL => "Null",
            Self::BOOL => "Bool",
            Self::SMI => "Smi",
            Self::MINT => "Mint",
            Self::DOUBLE => "Double",
            Self::STRING => "String",
            Self::ARRAY => "Array",
            Self::FLOAT32X4 => "Float32x4",
            Self::INT32X4 => "Int32x4",
            Self::FLOAT64X2 => "Float64x2",
            Self::INT => "int",
            Self::NUM => "num",
            Self(n) => return write!(f, "cid{n}"),
        };
        f.write_str(name)
    }
}

impl fmt::Display for ClassId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

// =============================================================================
// Representations
// =============================================================================

/// Machine representation of a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Repr {
    /// Tagged pointer or Smi.
    Tagged,
    /// Unboxed 64-bit integer.
    Int64,
    /// Unboxed 32-bit unsigned integer.
    Uint32,
}

/// Width an integer operation is performed at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IntWidth {
    /// Tagged Smi arithmetic. Leaving the Smi range is a speculation failure.
    Smi,
    /// Unboxed 64-bit wrapping arithmetic.
    Int64,
    /// Unboxed 32-bit unsigned wrapping arithmetic.
    Uint32,
}

impl IntWidth {
    /// Representation of the operation's result.
    #[inline]
    pub fn repr(self) -> Repr {
        match self {
            Self::Smi => Repr::Tagged,
            Self::Int64 => Repr::Int64,
            Self::Uint32 => Repr::Uint32,
        }
    }
}

/// Lane layout of a packed vector value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SimdKind {
    Float32x4,
    Int32x4,
    Float64x2,
}

impl SimdKind {
    /// Class of values of this layout.
    pub fn class_id(self) -> ClassId {
        match self {
            Self::Float32x4 => ClassId::FLOAT32X4,
            Self::Int32x4 => ClassId::INT32X4,
            Self::Float64x2 => ClassId::FLOAT64X2,
        }
    }

    /// Layout for a class, if it is a vector class.
    pub fn from_class(cid: ClassId) -> Option<Self> {
        match cid {
            ClassId::FLOAT32X4 => Some(Self::Float32x4),
            ClassId::INT32X4 => Some(Self::Int32x4),
            ClassId::FLOAT64X2 => Some(Self::Float64x2),
            _ => None,
        }
    }
}

// =============================================================================
// Operator Kinds
// =============================================================================

/// Binary arithmetic and bitwise operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    /// `/`, always produces a double.
    Div,
    /// `~/`, truncating integer division.
    TruncDiv,
    /// `%`, Euclidean modulo: never negative for a non-zero divisor.
    Mod,
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    Shr,
}

impl BinaryOp {
    /// Whether the operator is a shift.
    #[inline]
    pub fn is_shift(self) -> bool {
        matches!(self, Self::Shl | Self::Shr)
    }

    /// Whether `a op b == b op a`.
    #[inline]
    pub fn is_commutative(self) -> bool {
        matches!(
            self,
            Self::Add | Self::Mul | Self::BitAnd | Self::BitOr | Self::BitXor
        )
    }

    /// Source-level spelling.
    pub fn symbol(self) -> &'static str {
        match self {
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::Div => "/",
            Self::TruncDiv => "~/",
            Self::Mod => "%",
            Self::BitAnd => "&",
            Self::BitOr => "|",
            Self::BitXor => "^",
            Self::Shl => "<<",
            Self::Shr => ">>",
        }
    }
}

/// Comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CmpOp {
    /// Operator testing the opposite condition.
    pub fn negate(self) -> Self {
        match self {
            Self::Eq => Self::Ne,
            Self::Ne => Self::Eq,
            Self::Lt => Self::Ge,
            Self::Le => Self::Gt,
            Self::Gt => Self::Le,
            Self::Ge => Self::Lt,
        }
    }

    /// Operator with operands swapped (`a < b` ⇔ `b > a`).
    pub fn swap(self) -> Self {
        match self {
            Self::Eq => Self::Eq,
            Self::Ne => Self::Ne,
            Self::Lt => Self::Gt,
            Self::Le => Self::Ge,
            Self::Gt => Self::Lt,
            Self::Ge => Self::Le,
        }
    }

    /// Whether this is `<`, `<=`, `>` or `>=`.
    #[inline]
    pub fn is_relational(self) -> bool {
        !matches!(self, Self::Eq | Self::Ne)
    }

    /// Apply to two ordered values.
    pub fn eval<T: PartialOrd>(self, a: T, b: T) -> bool {
        match self {
            Self::Eq => a == b,
            Self::Ne => a != b,
            Self::Lt => a < b,
            Self::Le => a <= b,
            Self::Gt => a > b,
            Self::Ge => a >= b,
        }
    }

    /// Source-level spelling.
    pub fn symbol(self) -> &'static str {
        match self {
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
        }
    }
}

/// Unary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Negate,
    BitNot,
}

// =============================================================================
// Selectors
// =============================================================================

/// Name of a dynamically dispatched member.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Selector {
    Binary(BinaryOp),
    Compare(CmpOp),
    Unary(UnaryOp),
    /// `a[i]`
    Index,
    /// `a[i] = v`
    IndexSet,
    /// `.length`
    Length,
    /// Any other method, getter or setter.
    Named(Arc<str>),
}

impl Selector {
    /// Convenience constructor for named members.
    pub fn named(name: &str) -> Self {
        Self::Named(Arc::from(name))
    }

    /// Number of operands including the receiver, when fixed by the selector.
    pub fn arity(&self) -> Option<usize> {
        match self {
            Self::Binary(_) | Self::Compare(_) | Self::Index => Some(2),
            Self::Unary(_) | Self::Length => Some(1),
            Self::IndexSet => Some(3),
            Self::Named(_) => None,
        }
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Binary(op) => f.write_str(op.symbol()),
            Self::Compare(op) => f.write_str(op.symbol()),
            Self::Unary(UnaryOp::Negate) => f.write_str("unary-"),
            Self::Unary(UnaryOp::BitNot) => f.write_str("~"),
            Self::Index => f.write_str("[]"),
            Self::IndexSet => f.write_str("[]="),
            Self::Length => f.write_str("length"),
            Self::Named(name) => f.write_str(name),
        }
    }
}

// =============================================================================
// Literals
// =============================================================================

/// A compile-time constant value.
///
/// Doubles compare and hash by bit pattern, so `NaN` equals itself and
/// `0.0` differs from `-0.0`. This matches identity semantics and keeps the
/// canonical constant table well formed.
#[derive(Debug, Clone)]
pub enum Literal {
    Int(i64),
    Double(f64),
    Bool(bool),
    Null,
    Str(Arc<str>),
    /// Constant array. Its length never changes.
    Array(Arc<[Literal]>),
}

impl Literal {
    /// Concrete class of the value.
    pub fn class_id(&self) -> ClassId {
        match self {
            Self::Int(v) => ClassId::of_int(*v),
            Self::Double(_) => ClassId::DOUBLE,
            Self::Bool(_) => ClassId::BOOL,
            Self::Null => ClassId::NULL,
            Self::Str(_) => ClassId::STRING,
            Self::Array(_) => ClassId::ARRAY,
        }
    }

    /// Whether uses may be redirected to a fresh copy of this constant.
    #[inline]
    pub fn is_cheap(&self) -> bool {
        matches!(
            self,
            Self::Int(_) | Self::Double(_) | Self::Bool(_) | Self::Null
        )
    }

    /// Integer payload.
    #[inline]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Boolean payload.
    #[inline]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// String payload.
    #[inline]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Length of a string or array constant.
    pub fn length(&self) -> Option<i64> {
        match self {
            Self::Str(s) => Some(s.chars().count() as i64),
            Self::Array(items) => Some(items.len() as i64),
            _ => None,
        }
    }

    /// `identical(a, b)`.
    pub fn identical(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Array(a), Self::Array(b)) => Arc::ptr_eq(a, b),
            _ => self == other,
        }
    }
}

impl PartialEq for Literal {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Double(a), Self::Double(b)) => a.to_bits() == b.to_bits(),
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Null, Self::Null) => true,
            (Self::Str(a), Self::Str(b)) => a == b,
            (Self::Array(a), Self::Array(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Literal {}

impl Hash for Literal {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Self::Int(v) => v.hash(state),
            Self::Double(d) => d.to_bits().hash(state),
            Self::Bool(b) => b.hash(state),
            Self::Null => {}
            Self::Str(s) => s.hash(state),
            Self::Array(items) => items.hash(state),
        }
    }
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::Double(d) => write!(f, "{d:?}"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Null => f.write_str("null"),
            Self::Str(s) => write!(f, "{s:?}"),
            Self::Array(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
