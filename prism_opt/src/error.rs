//! Optimizer errors.
//!
//! Speculation failures and infeasible ranges are handled by rewriting the
//! graph and never surface here. An `OptError` means the compile attempt for
//! the function must be abandoned; the caller keeps running unoptimized code.

use crate::ir::instr::InstrId;

use thiserror::Error;

/// Errors that abort an optimizing compile.
#[derive(Debug, Error)]
pub enum OptError {
    /// A pass met an instruction shape it cannot handle.
    #[error("invariant violation in {pass} at {instr}: {message}")]
    InvariantViolation {
        /// Pass that detected the violation.
        pass: &'static str,
        /// Offending instruction.
        instr: InstrId,
        /// Description.
        message: String,
    },

    /// A live instruction still reads a removed definition.
    #[error("dangling use of removed {def} by {user}")]
    DanglingUse {
        /// Removed definition.
        def: InstrId,
        /// Instruction still using it.
        user: InstrId,
    },

    /// The graph failed structural verification.
    #[error("malformed graph: {0}")]
    MalformedGraph(String),
}

impl OptError {
    /// Shorthand for [`OptError::InvariantViolation`].
    pub fn invariant(pass: &'static str, instr: InstrId, message: impl Into<String>) -> Self {
        Self::InvariantViolation {
            pass,
            instr,
            message: message.into(),
        }
    }
}

/// Result alias used throughout the optimizer.
pub type OptResult<T> = Result<T, OptError>;
