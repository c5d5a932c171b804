//! Construction helpers bundling default query options.

use std::future::Future;

use crate::caching::{Query, QueryConfig, ResolveError};
use crate::mutation::{Mutation, MutationCallbacks};
use crate::value::Value;

/// Shared defaults for the queries and mutations of one application.
///
/// Per-query overrides start from [`query_defaults`](Self::query_defaults)
/// with struct update syntax:
///
/// ```ignore
/// let query = client.query_with(resolver, QueryConfig {
///     revalidate_after: Duration::from_secs(30),
///     ..client.query_defaults().clone()
/// });
/// ```
#[derive(Debug, Clone, Default)]
pub struct Client {
    query_defaults: QueryConfig,
}

impl Client {
    pub fn new(query_defaults: QueryConfig) -> Self {
        Self { query_defaults }
    }

    pub fn query_defaults(&self) -> &QueryConfig {
        &self.query_defaults
    }

    /// Creates a query using the client's default configuration.
    pub fn query<F, Fut>(&self, resolver: F) -> Query
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ResolveError>> + Send + 'static,
    {
        Query::with_config(resolver, self.query_defaults.clone())
    }

    /// Creates a query with an explicit configuration.
    pub fn query_with<F, Fut>(&self, resolver: F, config: QueryConfig) -> Query
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ResolveError>> + Send + 'static,
    {
        Query::with_config(resolver, config)
    }

    /// Creates a mutation without settlement callbacks.
    pub fn mutation<F, Fut>(&self, performer: F) -> Mutation
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ResolveError>> + Send + 'static,
    {
        Mutation::new(performer)
    }

    /// Creates a mutation with mutation-scoped settlement callbacks.
    pub fn mutation_with<F, Fut>(&self, performer: F, callbacks: MutationCallbacks) -> Mutation
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ResolveError>> + Send + 'static,
    {
        Mutation::with_callbacks(performer, callbacks)
    }
}
