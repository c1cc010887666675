// This module defines the error taxonomy of the code generation core using the thiserror
// crate. Well-formed operation sequences never fail, so every variant describes either a
// broken internal invariant, an allocator that exhausted every fallback, a fixed point that
// did not settle inside its bound, or an emitter that could not encode what it was asked.
// Each variant carries a reason string with enough context (operation, value, register) to
// reproduce the failure. CompileResult<T> is the alias used on every fallible path.

//! Error types for the code generation core.

use thiserror::Error;

/// Main error type for a method compilation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CompileError {
    #[error("Invalid operand: {reason}")]
    InvalidOperand { reason: String },

    #[error("No feasible target: {reason}")]
    ImpossibleTarget { reason: String },

    #[error("Internal invariant violated: {reason}")]
    Invariant { reason: String },

    #[error("Fixed point did not converge within {bound} passes: {reason}")]
    FixedPointExceeded { bound: usize, reason: String },

    #[error("No scratch register available: {reason}")]
    ScratchUnavailable { reason: String },

    #[error("Emission failed: {reason}")]
    Emission { reason: String },

    #[error("Unresolved promise: {reason}")]
    Unresolved { reason: String },
}

impl CompileError {
    pub(crate) fn invariant(reason: impl Into<String>) -> Self {
        CompileError::Invariant {
            reason: reason.into(),
        }
    }

    pub(crate) fn emission(reason: impl Into<String>) -> Self {
        CompileError::Emission {
            reason: reason.into(),
        }
    }
}

/// Result type alias for compile operations.
pub type CompileResult<T> = Result<T, CompileError>;
