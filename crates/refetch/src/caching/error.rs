use std::fmt;

use thiserror::Error;

use super::resolution::ResolutionHandle;

/// An error produced while resolving (or mutating).
///
/// These are stored in rejected resolutions and fanned out through shared
/// resolution handles, so the type is cheap to clone.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    /// The resolver rejected; the attached string carries its message.
    #[error("resolution failed: {0}")]
    Failed(String),
    /// An unexpected defect inside the engine itself, such as a panicking
    /// resolver. Never produced by well-formed resolvers.
    #[error("internal error")]
    Internal,
}

impl ResolveError {
    /// Wraps an arbitrary error as a resolver failure.
    pub fn failed<E: fmt::Display>(error: E) -> Self {
        Self::Failed(error.to_string())
    }

    #[track_caller]
    pub(crate) fn internal() -> Self {
        tracing::error!("a resolution escaped through an unexpected path");
        Self::Internal
    }
}

/// The outcome of a failed [`read`](crate::Query::read).
#[derive(Clone, Error)]
pub enum ReadError {
    /// The newest resolution is still in flight.
    ///
    /// Not a failure and never logged as one: callers integrating with a
    /// suspend-and-retry pattern await the carried handle and read again.
    #[error("resolution in flight")]
    Suspended(ResolutionHandle),
    /// The newest settled resolution was a rejection.
    #[error(transparent)]
    Failed(ResolveError),
}

impl fmt::Debug for ReadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReadError::Suspended(_) => f.write_str("Suspended(..)"),
            ReadError::Failed(error) => f.debug_tuple("Failed").field(error).finish(),
        }
    }
}
