//! Engine-wide error types.
//!
//! Every fallible operation in the engine core returns [`EngineResult`].
//! Broken invariants (a missing event-table entry, a transaction absent
//! from its own connection's chain) are programmer errors and panic via
//! assertions instead of surfacing here.

use thiserror::Error;

/// Result type alias for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors that can occur in the engine core.
#[derive(Debug, Error)]
pub enum EngineError {
    /// An allocation-level failure, e.g. creating a subpool of a pool
    /// that has already been released.
    #[error("allocation failure: {0}")]
    Alloc(String),

    /// A caller supplied an argument the operation cannot accept.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The target is in the wrong state for the requested transition.
    #[error("invalid state: current={current}, expected={expected}")]
    InvalidState {
        /// State the target is currently in.
        current: String,
        /// State the operation requires.
        expected: String,
    },

    /// A module, context, or other registered entity was not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// A server binding or module was built against a newer engine ABI.
    #[error("incompatible ABI: {what} was built against ABI {got}, engine is ABI {engine_abi}")]
    IncompatibleAbi {
        /// What presented the incompatible ABI (server binding, module name).
        what: String,
        /// The engine's own ABI number.
        engine_abi: u32,
        /// The ABI number presented.
        got: u32,
    },

    /// The operation is recognized but not implemented.
    #[error("not implemented: {0}")]
    NotImplemented(String),

    /// The handler examined the request and declined to act on it.
    #[error("declined: {0}")]
    Declined(String),
}

impl EngineError {
    /// Returns `true` if the error indicates an ABI mismatch, which is
    /// always fatal to the creation call that produced it.
    #[must_use]
    pub fn is_abi_incompatibility(&self) -> bool {
        matches!(self, Self::IncompatibleAbi { .. })
    }

    /// Returns `true` if the error is a recoverable caller mistake
    /// rather than a failure of the engine itself.
    #[must_use]
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidArgument(_) | Self::InvalidState { .. } | Self::NotFound(_)
        )
    }
}
