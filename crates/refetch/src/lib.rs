//! A client-side data-fetching cache.
//!
//! Given an asynchronous resolver keyed by a *variables* value, a [`Query`]
//! deduplicates in-flight calls, caches settled results, tracks staleness,
//! retries failed resolutions with backoff, and notifies subscribers on every
//! state transition. See the [`caching`] module for a description of the
//! entry/resolution lifecycle.
//!
//! All of the engine's asynchrony runs on Tokio; queries and mutations must
//! be created and used from within a Tokio runtime.

pub mod caching;
pub mod client;
pub mod environment;
pub mod mutation;
pub mod structural;
pub mod value;

pub use caching::{
    CacheKey, Query, QueryConfig, ReadError, ResolutionHandle, ResolveError, Resolver,
    RetryPolicy, Status, Subscription,
};
pub use client::Client;
pub use mutation::{Mutation, MutationCallbacks, MutationHandle};
pub use structural::{deep_equal, partial_deep_equal, reuse_instances};
pub use value::Value;
