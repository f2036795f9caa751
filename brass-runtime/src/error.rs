//! Infrastructure errors.
//!
//! Domain outcomes of effects travel as [`Exit`](crate::cause::Exit) and
//! [`Cause`](crate::cause::Cause). The types here report misuse of the
//! runtime itself.

use thiserror::Error;

use crate::fiber::FiberId;
use crate::scope::ScopeId;

/// A scope refused an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ScopeError {
    /// The scope is closing or closed; new children and finalizers are
    /// rejected.
    #[error("{scope} is closed")]
    Closed {
        /// The scope that rejected the request.
        scope: ScopeId,
    },
}

/// Errors from driving a runtime to completion.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuntimeError {
    /// `block_on` was called from inside a running step.
    #[error("block_on called from inside a scheduler flush")]
    Reentrant,

    /// Nothing is runnable, no timer is armed and no blocking task is in
    /// flight, yet the fiber has not finished.
    #[error("{fiber} can never complete: no runnable work, timers or blocking tasks remain")]
    Stalled {
        /// The fiber being awaited.
        fiber: FiberId,
    },

    /// A scope operation failed.
    #[error(transparent)]
    Scope(#[from] ScopeError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ScopeError::Closed {
            scope: ScopeId::new(4),
        };
        assert_eq!(err.to_string(), "Scope(4) is closed");

        let err: RuntimeError = err.into();
        assert_eq!(err.to_string(), "Scope(4) is closed");

        let err = RuntimeError::Stalled {
            fiber: FiberId::new(9),
        };
        assert!(err.to_string().starts_with("Fiber(9) can never complete"));
    }
}
