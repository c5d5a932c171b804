//! # The resolution cache
//!
//! The cache engine behind [`Query`]: per-key entries, resolution history,
//! retry scheduling, time-based revalidation, and garbage collection.
//!
//! ## Entries and resolutions
//!
//! A [`Query`] owns one [`Entry`](entry::Entry) per distinct variables value,
//! where "distinct" means structural: entries are keyed by [`CacheKey`], the
//! hash of the canonical encoding of the variables, so two structurally equal
//! values always address the same entry no matter how they were built.
//!
//! Every resolver invocation is recorded as a *resolution*: created pending,
//! settling exactly once to resolved or rejected. Resolution ids within an
//! entry are strictly increasing in creation order, and the id (never the
//! settlement order) decides which resolution is authoritative: a late
//! out-of-order settlement cannot override fresher data. A new `resolve` call
//! supersedes, but does not cancel, a still-pending older one; the superseded
//! call's eventual settlement is still recorded.
//!
//! ## Staleness and invalidation
//!
//! Each entry tracks the resolution id it *expects*: invalidation bumps the
//! expectation past every existing resolution, which flips the entry's
//! reported state to invalid. Entries with active subscribers are eagerly
//! re-resolved on invalidation; unsubscribed entries stay stale until the
//! next access. Time-based revalidation re-resolves an entry some time after
//! each settlement, but only while someone subscribes to it.
//!
//! ## Retries
//!
//! A rejected settlement consults the configured
//! [`should_retry_in`](QueryConfig::should_retry_in) policy with the number
//! of consecutive rejections and schedules at most one deferred re-resolve.
//! A success, or a newer settlement, cancels the outstanding retry timer.
//!
//! ## Garbage collection
//!
//! Within an entry, every resolution strictly older (by id) than the newest
//! settled one is dropped after each settlement and each new resolve; pending
//! resolutions and the newest settled resolution always survive. At the cache
//! level, entries without subscribers whose resolutions have all been settled
//! for longer than the revalidation window are dropped; this runs deferred
//! after a subscription is released so that a resubscribe within the same
//! tick keeps the entry alive.
//!
//! ## Reading
//!
//! [`Query::read`] integrates with a suspend-and-retry consumption pattern:
//! it either returns data, fails with the stored rejection, or fails with a
//! [`ReadError::Suspended`] carrying the pending handle; awaiting the handle
//! and retrying the call always makes progress. [`Query::load`] packages that
//! loop as an async convenience.

mod cache_key;
mod config;
mod entry;
mod error;
mod query;
mod resolution;
#[cfg(test)]
mod tests;

pub use cache_key::CacheKey;
pub use config::{QueryConfig, RetryPolicy, default_retry_policy};
pub use error::{ReadError, ResolveError};
pub use query::{Query, Resolver, Subscription};
pub use resolution::{ResolutionHandle, Status};
