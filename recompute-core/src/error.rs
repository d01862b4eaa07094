//! Error Types
//!
//! Every failure the engine can report is a variant of [`Error`]. The enum is
//! `Clone` because a failed computation is memoized like a successful one:
//! every caller that reuses the node observes the same error value.
//!
//! Three families live here:
//!
//! - Computation failures (`Cancelled`, `Failed`), recorded as node output.
//! - Structural defects (`LockReentry`, `InvalidCallOptions`, `WrongState`),
//!   which indicate a programming error and are never retried.
//! - Environment failures (`InputDisposed`, `HubDropped`).

use std::fmt;
use std::sync::Arc;

use crate::reactive::{CallOptions, ConsistencyState};

/// Result alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Boxed error source shared between every observer of a failed node.
pub type SharedError = Arc<dyn std::error::Error + Send + Sync + 'static>;

/// Errors produced by the memoization engine and by computation bodies.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// The computation was cancelled.
    ///
    /// When a body returns this while the caller's own token is still live,
    /// the cancellation is treated as internal and the computation is retried.
    #[error("computation was cancelled")]
    Cancelled,

    /// The computation body failed.
    #[error("computation failed: {source}")]
    Failed {
        /// The underlying error.
        source: SharedError,
        /// Transient failures are invalidated sooner than terminal ones.
        transient: bool,
    },

    /// The per-input lock was re-entered from the call chain already holding it.
    #[error("reentrant computation of {input}: the call chain already holds its lock")]
    LockReentry {
        /// Display form of the input.
        input: String,
    },

    /// The ambient call options do not allow this operation.
    #[error("invalid call options for this operation: {0}")]
    InvalidCallOptions(CallOptions),

    /// The node was not in the state required by the operation.
    #[error("wrong consistency state: {0:?}")]
    WrongState(ConsistencyState),

    /// The instance owning the input has been disposed.
    #[error("{input} belongs to a disposed instance")]
    InputDisposed {
        /// Display form of the input.
        input: String,
    },

    /// The hub owning the node has been dropped.
    #[error("the hub has been dropped")]
    HubDropped,
}

impl Error {
    /// Wrap an error as a terminal computation failure.
    pub fn failed<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Failed {
            source: Arc::new(error),
            transient: false,
        }
    }

    /// Wrap an error as a transient computation failure.
    pub fn transient<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Failed {
            source: Arc::new(error),
            transient: true,
        }
    }

    /// Build a terminal failure from a plain message.
    pub fn msg(message: impl Into<String>) -> Self {
        Self::failed(Message(message.into()))
    }

    /// Whether this is a cancellation.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Whether the error should get the short (transient) invalidation delay.
    ///
    /// Cancellations are always transient.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Cancelled => true,
            Self::Failed { transient, .. } => *transient,
            _ => false,
        }
    }

    /// Whether the error indicates a programming error rather than a
    /// recoverable condition.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            Self::LockReentry { .. } | Self::InvalidCallOptions(_) | Self::WrongState(_)
        )
    }
}

/// Plain-text error used by [`Error::msg`].
#[derive(Debug)]
struct Message(String);

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for Message {}
