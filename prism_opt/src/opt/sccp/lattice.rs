//! Value lattice for constant propagation.
//!
//! ```text
//!      NonConstant (⊤)
//!           |
//!     Constant(v1, v2, ...)
//!           |
//!       Unknown (⊥)
//! ```
//!
//! Values only move up. The lattice has height three, so every definition
//! changes at most twice during one analysis.

use crate::ir::types::Literal;

/// What constant propagation knows about a definition.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum LatticeValue {
    /// Not yet reached by the analysis.
    #[default]
    Unknown,
    /// Always produces this value.
    Constant(Literal),
    /// Varies at runtime, or cannot be evaluated.
    NonConstant,
}

impl LatticeValue {
    #[inline]
    pub fn int(v: i64) -> Self {
        Self::Constant(Literal::Int(v))
    }

    #[inline]
    pub fn bool(b: bool) -> Self {
        Self::Constant(Literal::Bool(b))
    }

    #[inline]
    pub fn is_unknown(&self) -> bool {
        matches!(self, Self::Unknown)
    }

    #[inline]
    pub fn is_constant(&self) -> bool {
        matches!(self, Self::Constant(_))
    }

    #[inline]
    pub fn is_non_constant(&self) -> bool {
        matches!(self, Self::NonConstant)
    }

    /// Constant payload.
    #[inline]
    pub fn as_constant(&self) -> Option<&Literal> {
        match self {
            Self::Constant(lit) => Some(lit),
            _ => None,
        }
    }

    /// Integer payload.
    #[inline]
    pub fn as_int(&self) -> Option<i64> {
        self.as_constant().and_then(Literal::as_int)
    }

    /// Least upper bound.
    ///
    /// ```text
    /// join(Unknown, x)              = x
    /// join(NonConstant, x)          = NonConstant
    /// join(Constant(a), Constant(a)) = Constant(a)
    /// join(Constant(a), Constant(b)) = NonConstant   (a != b)
    /// ```
    pub fn join(&self, other: &Self) -> Self {
        match (self, other) {
            (Self::Unknown, x) | (x, Self::Unknown) => x.clone(),
            (Self::NonConstant, _) | (_, Self::NonConstant) => Self::NonConstant,
            (Self::Constant(a), Self::Constant(b)) => {
                if a == b {
                    Self::Constant(a.clone())
                } else {
                    Self::NonConstant
                }
            }
        }
    }

    /// Join `other` into `self`. Returns true if `self` moved.
    pub fn merge(&mut self, other: &Self) -> bool {
        let joined = self.join(other);
        if joined != *self {
            *self = joined;
            true
        } else {
            false
        }
    }

    /// Position in the lattice: 0 for ⊥, 2 for ⊤.
    #[inline]
    pub fn height(&self) -> u8 {
        match self {
            Self::Unknown => 0,
            Self::Constant(_) => 1,
            Self::NonConstant => 2,
        }
    }
}
