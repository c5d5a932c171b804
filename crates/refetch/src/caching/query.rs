use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, Weak};

use futures::FutureExt;
use futures::future::BoxFuture;
use rustc_hash::FxHashMap;
use tokio::sync::broadcast;
use tokio::time::Instant;

use super::cache_key::CacheKey;
use super::config::QueryConfig;
use super::entry::{Entry, Listener, ScheduledTask};
use super::error::{ReadError, ResolveError};
use super::resolution::{Resolution, ResolutionHandle, Status};
use crate::environment::{self, Event};
use crate::structural::{deep_equal, partial_deep_equal, reuse_instances};
use crate::value::Value;

/// An asynchronous resolver, keyed by a variables value.
pub type Resolver =
    Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value, ResolveError>> + Send + Sync>;

/// The resolution cache for one resolver/configuration pair.
///
/// Concurrent resolutions for structurally equal variables share one cache
/// entry; settled results are cached, tracked for staleness, retried on
/// failure, and garbage collected once nothing references them. Cloning the
/// query is cheap and clones share the same cache.
///
/// Queries must be created and used within a Tokio runtime: settlements and
/// timers are driven by spawned tasks.
#[derive(Clone)]
pub struct Query {
    inner: Arc<QueryInner>,
    /// Disposes the environment-event registration when the last clone goes.
    _environment_listener: Option<Arc<ScheduledTask>>,
}

struct QueryInner {
    resolver: Resolver,
    config: QueryConfig,
    state: Mutex<CacheState>,
}

#[derive(Default)]
struct CacheState {
    entries: FxHashMap<CacheKey, Entry>,
    next_subscription_id: u64,
}

impl CacheState {
    fn entry_mut(&mut self, key: &CacheKey, variables: &Value) -> &mut Entry {
        self.entries
            .entry(key.clone())
            .or_insert_with(|| Entry::new(variables.clone()))
    }
}

impl Query {
    /// Creates a query with the default [`QueryConfig`].
    pub fn new<F, Fut>(resolver: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ResolveError>> + Send + 'static,
    {
        Self::with_config(resolver, QueryConfig::default())
    }

    pub fn with_config<F, Fut>(resolver: F, config: QueryConfig) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ResolveError>> + Send + 'static,
    {
        let resolver: Resolver = Arc::new(move |variables| resolver(variables).boxed());
        let inner = Arc::new(QueryInner {
            resolver,
            config,
            state: Mutex::default(),
        });
        let environment_listener = QueryInner::listen_for_environment_events(&inner);
        Query {
            inner,
            _environment_listener: environment_listener.map(Arc::new),
        }
    }

    pub fn config(&self) -> &QueryConfig {
        &self.inner.config
    }

    /// Starts a new resolution for `variables` and returns its handle.
    ///
    /// The resolution is recorded pending on the entry addressed by the
    /// structural identity of `variables`; its settlement is recorded by a
    /// driver task even when every handle is dropped. Subscribers are
    /// notified of the start synchronously.
    pub fn resolve(&self, variables: &Value) -> ResolutionHandle {
        QueryInner::resolve(&self.inner, variables)
    }

    /// Computes the current [`Status`] of the entry for `variables`.
    ///
    /// Resolved payloads pass through structural sharing against the entry's
    /// cached payload, so repeated reads of unchanged data return the same
    /// instance.
    pub fn get_state(&self, variables: &Value) -> Status {
        self.inner.get_state(variables)
    }

    /// Synchronous read integrating with a suspend-and-retry pattern.
    ///
    /// Exactly one of three outcomes holds per call: the newest resolution is
    /// still pending and its handle is returned as
    /// [`ReadError::Suspended`]; the newest settled resolution was a
    /// rejection and its error is propagated; or data is returned. On an
    /// entry with no usable state a new resolution is started and its handle
    /// returned as a suspension. Awaiting the suspended handle and calling
    /// `read` again always makes progress.
    pub fn read(&self, variables: &Value) -> Result<Value, ReadError> {
        let status = self.get_state(variables);
        if let Some(handle) = status.resolving {
            return Err(ReadError::Suspended(handle));
        }
        if let Some(error) = status.error {
            return Err(ReadError::Failed(error));
        }
        if let Some(data) = status.data {
            return Ok(data);
        }
        Err(ReadError::Suspended(QueryInner::resolve(
            &self.inner,
            variables,
        )))
    }

    /// Awaits until [`read`](Self::read) makes progress: suspensions are
    /// awaited and the read retried; data and errors are returned as-is.
    pub async fn load(&self, variables: &Value) -> Result<Value, ResolveError> {
        loop {
            match self.read(variables) {
                Ok(data) => return Ok(data),
                Err(ReadError::Failed(error)) => return Err(error),
                Err(ReadError::Suspended(handle)) => {
                    // The driver task records the settlement; the next read
                    // consults the recorded state, not this result. Yield so
                    // the driver gets to run first.
                    let _ = handle.await;
                    tokio::task::yield_now().await;
                }
            }
        }
    }

    /// Marks every entry whose variables satisfy `criteria` as stale.
    ///
    /// Entries with active subscribers are eagerly re-resolved and notified;
    /// the rest are re-resolved lazily on their next access.
    pub fn invalidate(&self, criteria: impl Fn(&Value) -> bool) {
        QueryInner::invalidate(&self.inner, &criteria);
    }

    pub fn invalidate_all(&self) {
        self.invalidate(|_| true);
    }

    /// Invalidates the entry structurally equal to `variables`.
    pub fn invalidate_exact(&self, variables: &Value) {
        self.invalidate(|other| deep_equal(variables, other));
    }

    /// Invalidates every entry whose variables match `pattern` under
    /// [`partial_deep_equal`].
    pub fn invalidate_partial(&self, pattern: &Value) {
        self.invalidate(|other| partial_deep_equal(pattern, other));
    }

    /// Registers `listener` on the entry for `variables`, resolving it first
    /// when its current state is invalid.
    ///
    /// The listener fires on every state transition of the entry (resolution
    /// start and settlement) and on invalidation. Releasing the returned
    /// [`Subscription`] removes it again.
    pub fn subscribe(
        &self,
        variables: &Value,
        listener: impl Fn() + Send + Sync + 'static,
    ) -> Subscription {
        QueryInner::subscribe(&self.inner, variables, Arc::new(listener))
    }
}

impl fmt::Debug for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries = self
            .inner
            .state
            .try_lock()
            .map(|state| state.entries.len())
            .unwrap_or_default();
        f.debug_struct("Query")
            .field("config", &self.inner.config)
            .field("entries", &entries)
            .finish()
    }
}

impl QueryInner {
    fn resolve(inner: &Arc<Self>, variables: &Value) -> ResolutionHandle {
        // Panicking resolvers must not poison the engine or its waiters;
        // a panic settles as an internal error like any other rejection.
        let future = (inner.resolver)(variables.clone());
        let handle: ResolutionHandle = AssertUnwindSafe(future)
            .catch_unwind()
            .map(|settled| settled.unwrap_or_else(|_| Err(ResolveError::internal())))
            .boxed()
            .shared();
        let started_at = Instant::now();

        let key = CacheKey::from_variables(variables);
        let (id, listeners) = {
            let mut state = inner.state.lock().unwrap();
            let entry = state.entry_mut(&key, variables);
            let id = entry.next_resolution_id;
            entry.next_resolution_id += 1;
            entry.resolutions.insert(
                id,
                Resolution::Pending {
                    id,
                    handle: handle.clone(),
                    started_at,
                },
            );
            entry.collect_resolutions();
            (id, entry.listeners())
        };
        tracing::debug!(variables = %key, id, "starting resolution");

        let driver = {
            let weak = Arc::downgrade(inner);
            let handle = handle.clone();
            let variables = variables.clone();
            async move {
                let settled = handle.await;
                if let Some(inner) = weak.upgrade() {
                    inner.record_settlement(&variables, id, started_at, settled);
                }
            }
        };
        tokio::spawn(driver);

        notify(&listeners);
        handle
    }

    fn record_settlement(
        self: &Arc<Self>,
        variables: &Value,
        id: u64,
        started_at: Instant,
        settled: Result<Value, ResolveError>,
    ) {
        let key = CacheKey::from_variables(variables);
        let settled_at = Instant::now();
        let listeners = {
            let mut state = self.state.lock().unwrap();
            let entry = state.entry_mut(&key, variables);
            // A settlement arriving after its entry was collected recreates
            // the entry; keep the id counter ahead of the recorded id.
            entry.next_resolution_id = entry.next_resolution_id.max(id + 1);
            if entry
                .resolutions
                .get(&id)
                .is_some_and(|existing| !existing.is_pending())
            {
                tracing::error!(variables = %key, id, "resolution settled twice");
            }
            let is_newest_settled = entry
                .newest_settled()
                .map(Resolution::id)
                .is_none_or(|newest| id > newest);

            match settled {
                Ok(data) => {
                    tracing::debug!(
                        variables = %key,
                        id,
                        elapsed = ?started_at.elapsed(),
                        "resolution settled",
                    );
                    if is_newest_settled {
                        entry.rejected_streak = 0;
                        entry.cached_data = Some(share_against(&entry.cached_data, &data));
                    }
                    entry.resolutions.insert(
                        id,
                        Resolution::Resolved {
                            id,
                            data,
                            started_at,
                            settled_at,
                        },
                    );
                    entry.retry_timer = None;
                }
                Err(error) => {
                    tracing::debug!(
                        variables = %key,
                        id,
                        error = %error,
                        "resolution rejected",
                    );
                    entry.resolutions.insert(
                        id,
                        Resolution::Rejected {
                            id,
                            error: error.clone(),
                            started_at,
                            settled_at,
                        },
                    );
                    if is_newest_settled {
                        entry.rejected_streak += 1;
                    }
                    // Retry only when no newer attempt is already recorded.
                    if entry.newest_id() == Some(id) {
                        self.schedule_retry(entry, variables, &error);
                    }
                }
            }
            entry.collect_resolutions();
            self.schedule_revalidation(entry, variables);
            entry.listeners()
        };
        notify(&listeners);
    }

    fn schedule_retry(self: &Arc<Self>, entry: &mut Entry, variables: &Value, error: &ResolveError) {
        entry.retry_timer = None;
        let retries = entry.rejected_streak;
        let Some(delay) = (self.config.should_retry_in)(retries, error) else {
            tracing::debug!(retries, "giving up on retries");
            return;
        };
        tracing::debug!(retries, ?delay, "scheduling retry");
        let weak = Arc::downgrade(self);
        let variables = variables.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                QueryInner::resolve(&inner, &variables);
            }
        });
        entry.retry_timer = Some(ScheduledTask::new(task.abort_handle()));
    }

    fn schedule_revalidation(self: &Arc<Self>, entry: &mut Entry, variables: &Value) {
        let delay = self.config.revalidate_after;
        if delay.is_zero() {
            return;
        }
        let weak = Arc::downgrade(self);
        let variables = variables.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            inner.revalidate_if_subscribed(&variables);
        });
        entry.revalidate_timer = Some(ScheduledTask::new(task.abort_handle()));
    }

    fn revalidate_if_subscribed(self: &Arc<Self>, variables: &Value) {
        let key = CacheKey::from_variables(variables);
        let subscribed = {
            let state = self.state.lock().unwrap();
            state
                .entries
                .get(&key)
                .is_some_and(|entry| !entry.subscriptions.is_empty())
        };
        if subscribed {
            tracing::debug!(variables = %key, "revalidating expired entry");
            QueryInner::resolve(self, variables);
        }
    }

    fn get_state(&self, variables: &Value) -> Status {
        let key = CacheKey::from_variables(variables);
        let mut state = self.state.lock().unwrap();
        let entry = state.entry_mut(&key, variables);

        let is_valid = entry.is_valid();
        let resolving = match entry.newest() {
            Some(Resolution::Pending { handle, .. }) => Some(handle.clone()),
            _ => None,
        };

        let (data, error) = match entry.newest_settled() {
            Some(Resolution::Resolved { data, .. }) => {
                (Some(share_against(&entry.cached_data, data)), None)
            }
            Some(Resolution::Rejected { error, .. }) => {
                let error = Some(error.clone());
                // The rejected record masks the payload unless configured
                // otherwise; the last successfully resolved payload lives on
                // in `cached_data` even after its record was collected.
                let data = self
                    .config
                    .keep_data_on_error
                    .then(|| entry.cached_data.clone())
                    .flatten();
                (data, error)
            }
            Some(Resolution::Pending { .. }) => {
                unreachable!("a settled lookup cannot yield a pending resolution")
            }
            None => (None, None),
        };
        if let Some(data) = &data {
            entry.cached_data = Some(data.clone());
        }

        Status {
            is_valid,
            resolving,
            data,
            error,
        }
    }

    fn invalidate(self: &Arc<Self>, criteria: &dyn Fn(&Value) -> bool) {
        let mut subscribed = Vec::new();
        let mut invalidated = 0_usize;
        {
            let mut state = self.state.lock().unwrap();
            for entry in state.entries.values_mut() {
                if !criteria(&entry.variables) {
                    continue;
                }
                entry.expected_resolution_id = entry.next_resolution_id;
                invalidated += 1;
                if !entry.subscriptions.is_empty() {
                    subscribed.push((entry.variables.clone(), entry.listeners()));
                }
            }
        }
        tracing::debug!(invalidated, eager = subscribed.len(), "invalidated entries");
        for (variables, listeners) in subscribed {
            QueryInner::resolve(self, &variables);
            notify(&listeners);
        }
    }

    fn subscribe(inner: &Arc<Self>, variables: &Value, listener: Listener) -> Subscription {
        let key = CacheKey::from_variables(variables);
        let (id, is_valid) = {
            let mut state = inner.state.lock().unwrap();
            let id = state.next_subscription_id;
            state.next_subscription_id += 1;
            let entry = state.entry_mut(&key, variables);
            entry.subscriptions.insert(id, listener);
            (id, entry.is_valid())
        };
        if !is_valid {
            QueryInner::resolve(inner, variables);
        }
        Subscription {
            inner: Arc::downgrade(inner),
            key,
            variables: variables.clone(),
            id,
        }
    }

    fn collect_entries(&self) {
        let revalidate_after = self.config.revalidate_after;
        let mut state = self.state.lock().unwrap();
        state.entries.retain(|key, entry| {
            entry.collect_resolutions();
            let collectable = entry.is_collectable(revalidate_after);
            if collectable {
                tracing::trace!(variables = %key, "dropping idle entry");
            }
            !collectable
        });
    }

    fn listen_for_environment_events(inner: &Arc<Self>) -> Option<ScheduledTask> {
        let config = &inner.config;
        if !config.revalidate_on_focus && !config.revalidate_on_connect {
            return None;
        }
        let on_focus = config.revalidate_on_focus;
        let on_connect = config.revalidate_on_connect;
        let weak = Arc::downgrade(inner);
        let mut events = environment::listen();
        let task = tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                match event {
                    Event::Focus if on_focus => QueryInner::invalidate(&inner, &|_| true),
                    Event::Online if on_connect => QueryInner::invalidate(&inner, &|_| true),
                    _ => {}
                }
            }
        });
        Some(ScheduledTask::new(task.abort_handle()))
    }
}

fn share_against(cached: &Option<Value>, incoming: &Value) -> Value {
    match cached {
        Some(previous) => reuse_instances(previous, incoming),
        None => incoming.clone(),
    }
}

fn notify(listeners: &[Listener]) {
    for listener in listeners {
        listener();
    }
}

/// An active listener registration on a query entry.
///
/// Releasing it, either by dropping the value or by calling
/// [`unsubscribe`](Self::unsubscribe), removes the listener and schedules a
/// deferred collection of idle entries.
pub struct Subscription {
    inner: Weak<QueryInner>,
    key: CacheKey,
    variables: Value,
    id: u64,
}

impl Subscription {
    /// The variables value this subscription was registered with.
    pub fn variables(&self) -> &Value {
        &self.variables
    }

    /// Releases the registration.
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        {
            let mut state = inner.state.lock().unwrap();
            if let Some(entry) = state.entries.get_mut(&self.key) {
                entry.subscriptions.remove(&self.id);
            }
        }
        // Deferred so that a resubscribe within the same tick keeps the
        // entry alive. Without a runtime the collection runs inline.
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                tokio::task::yield_now().await;
                inner.collect_entries();
            });
        } else {
            inner.collect_entries();
        }
    }
}

#[cfg(test)]
impl Query {
    pub(crate) fn inspect_entry<R>(
        &self,
        variables: &Value,
        inspect: impl FnOnce(&Entry) -> R,
    ) -> Option<R> {
        let key = CacheKey::from_variables(variables);
        let state = self.inner.state.lock().unwrap();
        state.entries.get(&key).map(inspect)
    }

    pub(crate) fn entry_count(&self) -> usize {
        self.inner.state.lock().unwrap().entries.len()
    }
}
