//! Exact semantics of the built-in operators on primitive values.
//!
//! Shared by the reference interpreter and the constant propagator so that
//! folding at compile time and executing at run time can never disagree.

use super::types::{is_smi, BinaryOp, ClassId, CmpOp, IntWidth, Literal, Selector, UnaryOp};

use thiserror::Error;

/// A language-level exception.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Thrown {
    #[error("integer division by zero")]
    DivisionByZero,
    #[error("negative shift count {0}")]
    NegativeShift(i64),
    #[error("index {index} out of range for length {length}")]
    RangeError { index: i64, length: i64 },
    #[error("no method '{selector}' for receiver of class {cid}")]
    NoSuchMethod { selector: Selector, cid: ClassId },
    #[error("{actual} is not a subtype of {expected}")]
    TypeError { actual: ClassId, expected: ClassId },
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),
}

/// Result of a fixed-width integer operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntOutcome {
    Value(i64),
    /// The exact result does not fit the operation's width.
    Overflow,
    Throw(ThrownKind),
}

/// Exceptions an integer operation can raise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrownKind {
    DivisionByZero,
    NegativeShift(i64),
}

impl From<ThrownKind> for Thrown {
    fn from(kind: ThrownKind) -> Self {
        match kind {
            ThrownKind::DivisionByZero => Thrown::DivisionByZero,
            ThrownKind::NegativeShift(n) => Thrown::NegativeShift(n),
        }
    }
}

// =============================================================================
// Integers
// =============================================================================

/// `a << b` with 64-bit wrap-around. A count of 64 or more shifts out every
/// bit.
pub fn shl64(a: i64, b: i64) -> Result<i64, ThrownKind> {
    match b {
        b if b < 0 => Err(ThrownKind::NegativeShift(b)),
        b if b >= 64 => Ok(0),
        b => Ok(a.wrapping_shl(b as u32)),
    }
}

/// Arithmetic `a >> b`. A count of 64 or more saturates.
pub fn shr64(a: i64, b: i64) -> Result<i64, ThrownKind> {
    match b {
        b if b < 0 => Err(ThrownKind::NegativeShift(b)),
        b if b >= 64 => Ok(if a < 0 { -1 } else { 0 }),
        b => Ok(a >> b),
    }
}

/// Generic integer operation, 64-bit wrap-around. `Div` is not an integer
/// operation and yields `None`.
pub fn int_binary(op: BinaryOp, a: i64, b: i64) -> Option<Result<i64, ThrownKind>> {
    Some(match op {
        BinaryOp::Add => Ok(a.wrapping_add(b)),
        BinaryOp::Sub => Ok(a.wrapping_sub(b)),
        BinaryOp::Mul => Ok(a.wrapping_mul(b)),
        BinaryOp::TruncDiv if b == 0 => Err(ThrownKind::DivisionByZero),
        BinaryOp::TruncDiv => Ok(a.wrapping_div(b)),
        BinaryOp::Mod if b == 0 => Err(ThrownKind::DivisionByZero),
        BinaryOp::Mod => Ok(a.wrapping_rem_euclid(b)),
        BinaryOp::BitAnd => Ok(a & b),
        BinaryOp::BitOr => Ok(a | b),
        BinaryOp::BitXor => Ok(a ^ b),
        BinaryOp::Shl => shl64(a, b),
        BinaryOp::Shr => shr64(a, b),
        BinaryOp::Div => return None,
    })
}

/// Integer operation at a fixed width.
///
/// Smi operations report [`IntOutcome::Overflow`] when the exact result
/// leaves the Smi range. Uint32 operations compute modulo 2^32; their shift
/// count is a full 64-bit value.
pub fn int_binary_at(op: BinaryOp, width: IntWidth, a: i64, b: i64) -> IntOutcome {
    let wide = match int_binary(op, a, b) {
        Some(Ok(v)) => v,
        Some(Err(e)) => return IntOutcome::Throw(e),
        None => return IntOutcome::Overflow,
    };
    match width {
        IntWidth::Int64 => IntOutcome::Value(wide),
        IntWidth::Smi => {
            let exact = match op {
                BinaryOp::Add => a.checked_add(b),
                BinaryOp::Sub => a.checked_sub(b),
                BinaryOp::Mul => a.checked_mul(b),
                BinaryOp::TruncDiv => a.checked_div(b),
                BinaryOp::Shl => shl_exact(a, b),
                _ => Some(wide),
            };
            match exact {
                Some(v) if is_smi(v) => IntOutcome::Value(v),
                _ => IntOutcome::Overflow,
            }
        }
        IntWidth::Uint32 => IntOutcome::Value(i64::from(wide as u32)),
    }
}

/// `a << b` when no bit is lost.
fn shl_exact(a: i64, b: i64) -> Option<i64> {
    if a == 0 {
        return Some(0);
    }
    if !(0..64).contains(&b) {
        return None;
    }
    let v = a.checked_shl(b as u32)?;
    (v >> b == a).then_some(v)
}

/// Integer unary operation at a fixed width.
pub fn int_unary_at(op: UnaryOp, width: IntWidth, a: i64) -> IntOutcome {
    let v = match op {
        UnaryOp::Negate => match width {
            IntWidth::Smi => match a.checked_neg() {
                Some(v) if is_smi(v) => v,
                _ => return IntOutcome::Overflow,
            },
            _ => a.wrapping_neg(),
        },
        UnaryOp::BitNot => !a,
    };
    match width {
        IntWidth::Uint32 => IntOutcome::Value(i64::from(v as u32)),
        _ => IntOutcome::Value(v),
    }
}

// =============================================================================
// Doubles
// =============================================================================

/// Euclidean double modulo: the result has the sign of neither operand.
fn double_mod(a: f64, b: f64) -> f64 {
    let r = a % b;
    if r < 0.0 {
        r + b.abs()
    } else {
        r
    }
}

/// Double operation. Bitwise operators are not defined on doubles.
pub fn double_binary(op: BinaryOp, a: f64, b: f64) -> Option<Result<Literal, Thrown>> {
    Some(Ok(match op {
        BinaryOp::Add => Literal::Double(a + b),
        BinaryOp::Sub => Literal::Double(a - b),
        BinaryOp::Mul => Literal::Double(a * b),
        BinaryOp::Div => Literal::Double(a / b),
        BinaryOp::Mod => Literal::Double(double_mod(a, b)),
        BinaryOp::TruncDiv => {
            let q = (a / b).trunc();
            if !q.is_finite() {
                return Some(Err(Thrown::Unsupported("infinity or NaN toInt")));
            }
            Literal::Int(q as i64)
        }
        _ => return None,
    }))
}

// =============================================================================
// Generic Operators
// =============================================================================

fn as_number(lit: &Literal) -> Option<f64> {
    match lit {
        Literal::Int(v) => Some(*v as f64),
        Literal::Double(d) => Some(*d),
        _ => None,
    }
}

/// Generic `a op b` on primitive values, as dynamic dispatch would compute
/// it. `None` when the receiver or argument class has no such operator.
pub fn binary(op: BinaryOp, a: &Literal, b: &Literal) -> Option<Result<Literal, Thrown>> {
    match (a, b) {
        (Literal::Int(x), Literal::Int(y)) => match op {
            BinaryOp::Div => Some(Ok(Literal::Double(*x as f64 / *y as f64))),
            _ => int_binary(op, *x, *y).map(|r| r.map(Literal::Int).map_err(Thrown::from)),
        },
        (Literal::Int(_) | Literal::Double(_), Literal::Int(_) | Literal::Double(_)) => {
            double_binary(op, as_number(a)?, as_number(b)?)
        }
        (Literal::Str(x), Literal::Str(y)) if op == BinaryOp::Add => {
            let mut s = String::with_capacity(x.len() + y.len());
            s.push_str(x);
            s.push_str(y);
            Some(Ok(Literal::Str(s.into())))
        }
        _ => None,
    }
}

/// Generic comparison on primitive values. Equality is defined for every
/// pair; ordering only for numbers.
pub fn compare(op: CmpOp, a: &Literal, b: &Literal) -> Option<bool> {
    if let (Literal::Int(x), Literal::Int(y)) = (a, b) {
        return Some(op.eval(x, y));
    }
    if let (Some(x), Some(y)) = (as_number(a), as_number(b)) {
        return Some(op.eval(x, y));
    }
    let equal = match (a, b) {
        (Literal::Str(x), Literal::Str(y)) => x == y,
        (Literal::Bool(x), Literal::Bool(y)) => x == y,
        (Literal::Null, Literal::Null) => true,
        (Literal::Array(x), Literal::Array(y)) => x == y,
        _ => false,
    };
    match op {
        CmpOp::Eq => Some(equal),
        CmpOp::Ne => Some(!equal),
        _ => None,
    }
}

/// Generic unary operator on primitive values.
pub fn unary(op: UnaryOp, a: &Literal) -> Option<Literal> {
    match (op, a) {
        (UnaryOp::Negate, Literal::Int(v)) => Some(Literal::Int(v.wrapping_neg())),
        (UnaryOp::Negate, Literal::Double(d)) => Some(Literal::Double(-d)),
        (UnaryOp::BitNot, Literal::Int(v)) => Some(Literal::Int(!v)),
        _ => None,
    }
}

/// Character code of a one-character string, -1 otherwise.
pub fn char_code(s: &str) -> i64 {
    let mut chars = s.chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) => i64::from(u32::from(c)),
        _ => -1,
    }
}
