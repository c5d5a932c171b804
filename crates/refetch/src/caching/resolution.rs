use std::fmt;

use futures::future::{BoxFuture, Shared};
use tokio::time::Instant;

use super::error::ResolveError;
use crate::value::Value;

/// A cloneable awaitable settling to the outcome of one resolver invocation.
///
/// Handles are handed out by [`resolve`](crate::Query::resolve) and inside
/// [`Status`]; every clone observes the same settlement, and the settlement
/// is recorded in the cache even when all handles are dropped.
pub type ResolutionHandle = Shared<BoxFuture<'static, Result<Value, ResolveError>>>;

/// One resolver invocation's lifecycle record.
///
/// Created `Pending` and transitioning exactly once to `Resolved` or
/// `Rejected`.
#[derive(Clone)]
pub(crate) enum Resolution {
    Pending {
        id: u64,
        handle: ResolutionHandle,
        started_at: Instant,
    },
    Resolved {
        id: u64,
        data: Value,
        started_at: Instant,
        settled_at: Instant,
    },
    Rejected {
        id: u64,
        error: ResolveError,
        started_at: Instant,
        settled_at: Instant,
    },
}

impl Resolution {
    pub(crate) fn id(&self) -> u64 {
        match self {
            Resolution::Pending { id, .. }
            | Resolution::Resolved { id, .. }
            | Resolution::Rejected { id, .. } => *id,
        }
    }

    pub(crate) fn is_pending(&self) -> bool {
        matches!(self, Resolution::Pending { .. })
    }

    pub(crate) fn is_settled(&self) -> bool {
        !self.is_pending()
    }

    pub(crate) fn settled_at(&self) -> Option<Instant> {
        match self {
            Resolution::Pending { .. } => None,
            Resolution::Resolved { settled_at, .. } | Resolution::Rejected { settled_at, .. } => {
                Some(*settled_at)
            }
        }
    }
}

impl fmt::Debug for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resolution::Pending { id, started_at, .. } => f
                .debug_struct("Pending")
                .field("id", id)
                .field("started_at", started_at)
                .finish(),
            Resolution::Resolved {
                id,
                data,
                started_at,
                settled_at,
            } => f
                .debug_struct("Resolved")
                .field("id", id)
                .field("data", data)
                .field("started_at", started_at)
                .field("settled_at", settled_at)
                .finish(),
            Resolution::Rejected {
                id,
                error,
                started_at,
                settled_at,
            } => f
                .debug_struct("Rejected")
                .field("id", id)
                .field("error", error)
                .field("started_at", started_at)
                .field("settled_at", settled_at)
                .finish(),
        }
    }
}

/// A read-only snapshot of an entry's state, as computed by
/// [`get_state`](crate::Query::get_state).
#[derive(Clone)]
pub struct Status {
    /// False once the entry has been invalidated (or never resolved): the
    /// newest resolution predates what the entry expects.
    pub is_valid: bool,
    /// The in-flight handle, when the newest resolution is still pending.
    pub resolving: Option<ResolutionHandle>,
    /// Payload of the newest settled resolution, after structural sharing
    /// against the entry's cached payload.
    ///
    /// `None` while an error masks it, unless the query keeps data on error.
    pub data: Option<Value>,
    /// Error of the newest settled resolution, when it was a rejection.
    pub error: Option<ResolveError>,
}

impl Status {
    pub fn is_resolving(&self) -> bool {
        self.resolving.is_some()
    }

    pub fn has_data(&self) -> bool {
        self.data.is_some()
    }

    pub fn has_error(&self) -> bool {
        self.error.is_some()
    }
}

impl fmt::Debug for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Status")
            .field("is_valid", &self.is_valid)
            .field("is_resolving", &self.is_resolving())
            .field("data", &self.data)
            .field("error", &self.error)
            .finish()
    }
}
