//! Fire-and-forget write operations, composed with cache invalidation
//! through settlement callbacks.

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};

use crate::caching::ResolveError;
use crate::value::Value;

/// A cloneable awaitable settling to the outcome of one performer
/// invocation. Re-raises the performer's error.
pub type MutationHandle = Shared<BoxFuture<'static, Result<Value, ResolveError>>>;

type Performer =
    Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value, ResolveError>> + Send + Sync>;
type Callback<T> = Arc<dyn Fn(&Value, &T) + Send + Sync>;

/// Hooks invoked when a mutation settles, with the variables it was called
/// with and its data or error.
///
/// Cache invalidation is composed here: a success callback typically calls
/// one of the query's `invalidate*` methods.
#[derive(Clone, Default)]
pub struct MutationCallbacks {
    on_success: Option<Callback<Value>>,
    on_error: Option<Callback<ResolveError>>,
}

impl MutationCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_success(mut self, callback: impl Fn(&Value, &Value) + Send + Sync + 'static) -> Self {
        self.on_success = Some(Arc::new(callback));
        self
    }

    pub fn on_error(
        mut self,
        callback: impl Fn(&Value, &ResolveError) + Send + Sync + 'static,
    ) -> Self {
        self.on_error = Some(Arc::new(callback));
        self
    }
}

impl fmt::Debug for MutationCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutationCallbacks")
            .field("on_success", &self.on_success.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

/// Invokes a write operation and reports its settlement.
///
/// The runner does not touch any cache itself; it only guarantees that the
/// performer runs exactly once per [`mutate`](Self::mutate) call and that
/// the mutation-scoped callbacks run before the call-scoped ones.
pub struct Mutation {
    performer: Performer,
    callbacks: MutationCallbacks,
}

impl Mutation {
    pub fn new<F, Fut>(performer: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ResolveError>> + Send + 'static,
    {
        Self::with_callbacks(performer, MutationCallbacks::default())
    }

    pub fn with_callbacks<F, Fut>(performer: F, callbacks: MutationCallbacks) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ResolveError>> + Send + 'static,
    {
        Mutation {
            performer: Arc::new(move |variables| performer(variables).boxed()),
            callbacks,
        }
    }

    /// Performs the mutation once, invoking the mutation-scoped callbacks on
    /// settlement.
    ///
    /// The performer runs to settlement and the callbacks fire even when the
    /// returned handle is dropped.
    pub fn mutate(&self, variables: &Value) -> MutationHandle {
        self.mutate_with(variables, MutationCallbacks::default())
    }

    /// Like [`mutate`](Self::mutate), with call-scoped callbacks invoked
    /// after the mutation-scoped ones.
    pub fn mutate_with(&self, variables: &Value, callbacks: MutationCallbacks) -> MutationHandle {
        let future = (self.performer)(variables.clone());
        let handle: MutationHandle = AssertUnwindSafe(future)
            .catch_unwind()
            .map(|settled| settled.unwrap_or_else(|_| Err(ResolveError::internal())))
            .boxed()
            .shared();

        let driver = {
            let handle = handle.clone();
            let variables = variables.clone();
            let scoped = self.callbacks.clone();
            async move {
                match handle.await {
                    Ok(data) => {
                        if let Some(callback) = &scoped.on_success {
                            callback(&variables, &data);
                        }
                        if let Some(callback) = &callbacks.on_success {
                            callback(&variables, &data);
                        }
                    }
                    Err(error) => {
                        tracing::debug!(error = %error, "mutation rejected");
                        if let Some(callback) = &scoped.on_error {
                            callback(&variables, &error);
                        }
                        if let Some(callback) = &callbacks.on_error {
                            callback(&variables, &error);
                        }
                    }
                }
            }
        };
        tokio::spawn(driver);
        handle
    }
}

impl fmt::Debug for Mutation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mutation")
            .field("callbacks", &self.callbacks)
            .finish()
    }
}
