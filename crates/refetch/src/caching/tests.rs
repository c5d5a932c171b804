use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use refetch_test::{Counter, Gate, settle, setup};
use serde_json::json;
use tokio::time::advance;

use crate::client::Client;
use crate::environment;
use crate::mutation::{Mutation, MutationCallbacks};
use crate::value::Value;

use super::entry::Entry;
use super::resolution::Resolution;
use super::*;

fn value(raw: serde_json::Value) -> Value {
    Value::from(raw)
}

/// Engine tests must not be invalidated by environment events emitted from
/// other tests running in the same process.
fn quiet() -> QueryConfig {
    QueryConfig {
        revalidate_on_focus: false,
        revalidate_on_connect: false,
        ..QueryConfig::default()
    }
}

fn no_retry() -> RetryPolicy {
    Arc::new(|_, _| None)
}

#[tokio::test]
async fn test_structurally_equal_variables_share_an_entry() {
    setup();
    let attempts = Counter::new();
    let query = Query::with_config(
        {
            let attempts = attempts.clone();
            move |variables: Value| {
                attempts.bump();
                async move { Ok(variables.get("id").cloned().unwrap_or(Value::Null)) }
            }
        },
        quiet(),
    );

    let a = value(json!({"id": 7, "flags": {"x": 1}}));
    let b = value(json!({"flags": {"x": 1}, "id": 7}));

    assert_eq!(query.load(&a).await, Ok(value(json!(7))));
    let status = query.get_state(&b);
    assert!(status.is_valid);
    assert_eq!(status.data, Some(value(json!(7))));
    assert_eq!(query.load(&b).await, Ok(value(json!(7))));
    assert_eq!(attempts.get(), 1);
    assert_eq!(query.entry_count(), 1);
}

#[tokio::test]
async fn test_newest_resolution_wins_over_settlement_order() {
    setup();
    let calls = Counter::new();
    let gates = [Gate::new(), Gate::new()];
    let query = Query::with_config(
        {
            let calls = calls.clone();
            let gates = gates.clone();
            move |_| {
                let call = calls.bump();
                let gate = gates[call as usize - 1].clone();
                async move {
                    gate.pass().await;
                    Ok(Value::from(call))
                }
            }
        },
        quiet(),
    );

    let variables = value(json!({"q": 1}));
    let first = query.resolve(&variables);
    let second = query.resolve(&variables);
    settle().await;

    let snapshot = query
        .inspect_entry(&variables, |entry| {
            (entry.resolutions.len(), entry.newest_id())
        })
        .unwrap();
    assert_eq!(snapshot, (2, Some(1)));
    assert!(query.get_state(&variables).is_resolving());

    // The newer resolution settles first and is authoritative.
    gates[1].open(1);
    settle().await;
    let status = query.get_state(&variables);
    assert!(!status.is_resolving());
    assert_eq!(status.data, Some(Value::from(2_u64)));

    // The superseded call still settles and is recorded, but its id cannot
    // override the newer result.
    gates[0].open(1);
    settle().await;
    assert_eq!(second.await, Ok(Value::from(2_u64)));
    assert_eq!(first.await, Ok(Value::from(1_u64)));
    assert_eq!(
        query.get_state(&variables).data,
        Some(Value::from(2_u64))
    );
    let retained = query
        .inspect_entry(&variables, |entry| entry.resolutions.len())
        .unwrap();
    assert_eq!(retained, 1);
}

#[tokio::test]
async fn test_read_suspends_until_data_is_available() {
    setup();
    let gate = Gate::new();
    let query = Query::with_config(
        {
            let gate = gate.clone();
            move |_| {
                let gate = gate.clone();
                async move {
                    gate.pass().await;
                    Ok(value(json!({"answer": 42})))
                }
            }
        },
        quiet(),
    );

    let variables = value(json!("question"));
    // The first read starts a resolution and suspends on it.
    let handle = match query.read(&variables) {
        Err(ReadError::Suspended(handle)) => handle,
        other => panic!("expected a suspension, got {other:?}"),
    };
    assert!(query.get_state(&variables).is_resolving());

    gate.open(1);
    assert_eq!(handle.await, Ok(value(json!({"answer": 42}))));
    settle().await;

    assert_eq!(query.read(&variables).unwrap(), value(json!({"answer": 42})));
    assert_eq!(
        query.load(&variables).await,
        Ok(value(json!({"answer": 42})))
    );
}

#[tokio::test]
async fn test_rejections_surface_as_errors() {
    setup();
    let query = Query::with_config(
        |_| async { Err(ResolveError::failed("backend down")) },
        QueryConfig {
            should_retry_in: no_retry(),
            ..quiet()
        },
    );

    let variables = value(json!({"id": 1}));
    let error = query.load(&variables).await.unwrap_err();
    assert_eq!(error, ResolveError::Failed("backend down".into()));
    assert!(matches!(query.read(&variables), Err(ReadError::Failed(_))));

    let status = query.get_state(&variables);
    assert!(status.has_error());
    assert!(!status.has_data());
    assert!(status.is_valid);
}

#[tokio::test]
async fn test_panicking_resolver_settles_as_internal_error() {
    setup();
    let query = Query::with_config(
        |_| async { panic!("bug in resolver") },
        QueryConfig {
            should_retry_in: no_retry(),
            ..quiet()
        },
    );

    let error = query.load(&value(json!(1))).await.unwrap_err();
    assert_eq!(error, ResolveError::Internal);
}

/// A query whose resolver succeeds once and rejects from then on.
fn once_then_flaky(config: QueryConfig) -> Query {
    let calls = Counter::new();
    Query::with_config(
        move |_| {
            let call = calls.bump();
            async move {
                if call == 1 {
                    Ok(value(json!({"version": 1})))
                } else {
                    Err(ResolveError::failed("flaky"))
                }
            }
        },
        config,
    )
}

#[tokio::test]
async fn test_keep_data_on_error_policy() {
    setup();
    let query = once_then_flaky(QueryConfig {
        keep_data_on_error: true,
        should_retry_in: no_retry(),
        ..quiet()
    });
    let variables = value(json!(1));
    assert_eq!(
        query.load(&variables).await,
        Ok(value(json!({"version": 1})))
    );
    query.resolve(&variables);
    settle().await;
    let status = query.get_state(&variables);
    assert!(status.has_error());
    assert_eq!(status.data, Some(value(json!({"version": 1}))));

    // The default policy masks data once a newer attempt rejects.
    let masking = once_then_flaky(QueryConfig {
        should_retry_in: no_retry(),
        ..quiet()
    });
    masking.load(&variables).await.unwrap();
    masking.resolve(&variables);
    settle().await;
    let status = masking.get_state(&variables);
    assert!(status.has_error());
    assert!(!status.has_data());
}

#[tokio::test]
async fn test_mutation_invalidation_refetches() {
    setup();
    let store = Counter::new();
    let attempts = Counter::new();
    let query = Query::with_config(
        {
            let store = store.clone();
            let attempts = attempts.clone();
            move |_| {
                attempts.bump();
                let current = store.get();
                async move { Ok(Value::from(current)) }
            }
        },
        quiet(),
    );

    let mutation = Mutation::with_callbacks(
        {
            let store = store.clone();
            move |variables: Value| {
                store.set(variables.as_f64().unwrap_or_default() as u64);
                async { Ok(Value::Null) }
            }
        },
        MutationCallbacks::new().on_success({
            let query = query.clone();
            move |_, _| query.invalidate_all()
        }),
    );

    let variables = value(json!({"entity": 1}));
    let _subscription = query.subscribe(&variables, || {});
    settle().await;
    assert_eq!(query.load(&variables).await, Ok(Value::from(0_u64)));

    mutation.mutate(&Value::from(1_u64)).await.unwrap();
    settle().await;
    assert_eq!(query.load(&variables).await, Ok(Value::from(1_u64)));

    mutation.mutate(&Value::from(2_u64)).await.unwrap();
    settle().await;
    assert_eq!(query.load(&variables).await, Ok(Value::from(2_u64)));
    assert_eq!(attempts.get(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_retry_stops_after_three_consecutive_failures() {
    setup();
    let attempts = Counter::new();
    let query = Query::with_config(
        {
            let attempts = attempts.clone();
            move |_| {
                attempts.bump();
                async { Err(ResolveError::failed("always")) }
            }
        },
        quiet(),
    );

    let variables = value(json!({"id": 1}));
    let _ = query.resolve(&variables);
    settle().await;
    assert_eq!(attempts.get(), 1);

    // The default backoff schedule is quadratic in the failure streak.
    advance(Duration::from_secs(1)).await;
    settle().await;
    assert_eq!(attempts.get(), 2);

    advance(Duration::from_secs(4)).await;
    settle().await;
    assert_eq!(attempts.get(), 3);

    advance(Duration::from_secs(9)).await;
    settle().await;
    assert_eq!(attempts.get(), 4);

    // The fourth rejection schedules nothing further.
    let has_retry_timer = query
        .inspect_entry(&variables, |entry| entry.retry_timer.is_some())
        .unwrap();
    assert!(!has_retry_timer);
    advance(Duration::from_secs(3600)).await;
    settle().await;
    assert_eq!(attempts.get(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_success_resets_the_retry_schedule() {
    setup();
    let calls = Counter::new();
    let query = Query::with_config(
        {
            let calls = calls.clone();
            move |_| {
                let call = calls.bump();
                async move {
                    if call == 1 {
                        Err(ResolveError::failed("transient"))
                    } else {
                        Ok(Value::from(call))
                    }
                }
            }
        },
        quiet(),
    );

    let variables = value(json!(1));
    query.resolve(&variables);
    settle().await;
    assert_eq!(calls.get(), 1);

    // A manual resolve succeeds before the retry fires; the retry timer is
    // cancelled and the streak reset.
    query.resolve(&variables);
    settle().await;
    assert_eq!(calls.get(), 2);
    let (streak, has_timer) = query
        .inspect_entry(&variables, |entry| {
            (entry.rejected_streak, entry.retry_timer.is_some())
        })
        .unwrap();
    assert_eq!(streak, 0);
    assert!(!has_timer);

    advance(Duration::from_secs(3600)).await;
    settle().await;
    assert_eq!(calls.get(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_revalidation_fires_only_while_subscribed() {
    setup();
    let attempts = Counter::new();
    let query = Query::with_config(
        {
            let attempts = attempts.clone();
            move |_| {
                attempts.bump();
                async { Ok(Value::Null) }
            }
        },
        QueryConfig {
            revalidate_after: Duration::from_secs(10),
            ..quiet()
        },
    );

    let variables = value(json!({"feed": "news"}));
    let subscription = query.subscribe(&variables, || {});
    settle().await;
    assert_eq!(attempts.get(), 1);

    advance(Duration::from_secs(10)).await;
    settle().await;
    assert_eq!(attempts.get(), 2);

    drop(subscription);
    settle().await;
    advance(Duration::from_secs(10)).await;
    settle().await;
    assert_eq!(attempts.get(), 2);
}

#[tokio::test]
async fn test_subscribers_are_notified_on_every_transition() {
    setup();
    let notifications = Counter::new();
    let gate = Gate::new();
    let query = Query::with_config(
        {
            let gate = gate.clone();
            move |_| {
                let gate = gate.clone();
                async move {
                    gate.pass().await;
                    Ok(Value::Null)
                }
            }
        },
        quiet(),
    );

    let variables = value(json!(1));
    let _subscription = query.subscribe(&variables, {
        let notifications = notifications.clone();
        move || {
            notifications.bump();
        }
    });
    // Subscribing to an invalid entry starts a resolution.
    settle().await;
    assert_eq!(notifications.get(), 1);

    gate.open(1);
    settle().await;
    assert_eq!(notifications.get(), 2);

    // Invalidation notifies once itself and once for the eager resolve
    // start, then once more when that resolution settles.
    query.invalidate_all();
    settle().await;
    gate.open(1);
    settle().await;
    assert_eq!(notifications.get(), 5);
}

#[tokio::test]
async fn test_subscribers_are_notified_of_rejections() {
    setup();
    let notifications = Counter::new();
    let query = Query::with_config(
        |_| async { Err(ResolveError::failed("nope")) },
        QueryConfig {
            should_retry_in: no_retry(),
            ..quiet()
        },
    );

    let variables = value(json!(1));
    let _subscription = query.subscribe(&variables, {
        let notifications = notifications.clone();
        move || {
            notifications.bump();
        }
    });
    settle().await;
    assert_eq!(notifications.get(), 2);
}

#[tokio::test]
async fn test_partial_invalidation_matches_subsets() {
    setup();
    let query = Query::with_config(|_| async { Ok(Value::Null) }, quiet());

    let active = value(json!({"status": "active", "page": 1}));
    let paused = value(json!({"status": "paused", "page": 1}));
    let untagged = value(json!({"page": 1}));

    query.load(&active).await.unwrap();
    query.load(&paused).await.unwrap();
    query.load(&untagged).await.unwrap();

    query.invalidate_partial(&value(json!({"status": "active"})));

    assert!(!query.get_state(&active).is_valid);
    assert!(query.get_state(&paused).is_valid);
    assert!(query.get_state(&untagged).is_valid);
}

#[tokio::test]
async fn test_exact_invalidation_is_structural() {
    setup();
    let query = Query::with_config(|_| async { Ok(Value::Null) }, quiet());

    let variables = value(json!({"a": 1, "b": 2}));
    query.load(&variables).await.unwrap();
    query.load(&value(json!({"a": 1}))).await.unwrap();

    query.invalidate_exact(&value(json!({"b": 2, "a": 1})));

    assert!(!query.get_state(&variables).is_valid);
    assert!(query.get_state(&value(json!({"a": 1}))).is_valid);
}

#[tokio::test]
async fn test_idle_entries_are_collected_after_unsubscribe() {
    setup();
    let attempts = Counter::new();
    let query = Query::with_config(
        {
            let attempts = attempts.clone();
            move |_| {
                attempts.bump();
                async { Ok(Value::Null) }
            }
        },
        QueryConfig {
            revalidate_after: Duration::ZERO,
            ..quiet()
        },
    );

    let variables = value(json!({"session": 9}));
    let first = query.subscribe(&variables, || {});
    settle().await;
    assert_eq!(attempts.get(), 1);

    // Resubscribing in the same tick keeps the entry (and its data) alive.
    drop(first);
    let second = query.subscribe(&variables, || {});
    settle().await;
    assert_eq!(query.entry_count(), 1);
    assert_eq!(attempts.get(), 1);

    // Releasing the last subscription lets the deferred collection drop it.
    drop(second);
    settle().await;
    assert_eq!(query.entry_count(), 0);
}

#[tokio::test]
async fn test_refetched_payloads_keep_instance_identity() {
    setup();
    let query = Query::with_config(
        |variables: Value| async move {
            if variables == Value::from(1_i64) {
                Ok(value(
                    json!({"ok": true, "items": [{"a": 1, "b": 2}, {"c": 3}]}),
                ))
            } else {
                Ok(value(
                    json!({"ok": false, "items": [{"a": 1, "b": 2}, {"g": 30}]}),
                ))
            }
        },
        quiet(),
    );

    let first = query.load(&value(json!(1))).await.unwrap();
    let _subscription = query.subscribe(&value(json!(1)), || {});

    // The eager re-resolve produces a fresh, deeply equal payload; reads
    // collapse it back to the cached instance.
    query.invalidate_all();
    settle().await;
    let second = query.load(&value(json!(1))).await.unwrap();
    assert!(Value::same_instance(&first, &second));

    let third = query.load(&value(json!(2))).await.unwrap();
    assert_ne!(third, first);
    assert!(!Value::same_instance(&third, &first));
}

#[tokio::test]
async fn test_environment_events_invalidate_listening_queries() {
    setup();
    let attempts = Counter::new();
    let query = Query::with_config(
        {
            let attempts = attempts.clone();
            move |_| {
                attempts.bump();
                async { Ok(Value::Null) }
            }
        },
        QueryConfig {
            revalidate_on_focus: true,
            revalidate_on_connect: false,
            ..QueryConfig::default()
        },
    );

    let variables = value(json!(1));
    let _subscription = query.subscribe(&variables, || {});
    settle().await;
    assert_eq!(attempts.get(), 1);

    environment::emit(environment::Event::Focus);
    settle().await;
    assert_eq!(attempts.get(), 2);

    // This query did not register for connectivity events.
    environment::emit(environment::Event::Online);
    settle().await;
    assert_eq!(attempts.get(), 2);
}

#[tokio::test]
async fn test_client_defaults_apply_to_queries() {
    setup();
    let client = Client::new(QueryConfig {
        revalidate_after: Duration::from_secs(7),
        ..quiet()
    });
    let query = client.query(|_| async { Ok(Value::Null) });
    assert_eq!(query.config().revalidate_after, Duration::from_secs(7));
    assert!(!query.config().revalidate_on_focus);
}

fn resolved(id: u64) -> Resolution {
    let now = tokio::time::Instant::now();
    Resolution::Resolved {
        id,
        data: Value::Null,
        started_at: now,
        settled_at: now,
    }
}

fn rejected(id: u64) -> Resolution {
    let now = tokio::time::Instant::now();
    Resolution::Rejected {
        id,
        error: ResolveError::failed("x"),
        started_at: now,
        settled_at: now,
    }
}

fn pending(id: u64) -> Resolution {
    Resolution::Pending {
        id,
        handle: futures::future::ready(Ok::<_, ResolveError>(Value::Null))
            .boxed()
            .shared(),
        started_at: tokio::time::Instant::now(),
    }
}

#[test]
fn test_resolution_collection_boundary() {
    let mut entry = Entry::new(Value::Null);
    entry.resolutions.insert(1, resolved(1));
    entry.resolutions.insert(2, rejected(2));
    entry.resolutions.insert(3, resolved(3));
    entry.resolutions.insert(4, pending(4));
    entry.resolutions.insert(5, pending(5));
    entry.next_resolution_id = 6;

    entry.collect_resolutions();

    let mut retained: Vec<u64> = entry.resolutions.keys().copied().collect();
    retained.sort_unstable();
    assert_eq!(retained, [3, 4, 5]);
}

#[test]
fn test_resolution_collection_never_drops_pending() {
    let mut entry = Entry::new(Value::Null);
    entry.resolutions.insert(0, pending(0));
    entry.resolutions.insert(1, pending(1));
    entry.next_resolution_id = 2;

    entry.collect_resolutions();
    assert_eq!(entry.resolutions.len(), 2);

    entry.resolutions.insert(2, resolved(2));
    entry.next_resolution_id = 3;
    entry.collect_resolutions();

    let mut retained: Vec<u64> = entry.resolutions.keys().copied().collect();
    retained.sort_unstable();
    assert_eq!(retained, [0, 1, 2]);
}

#[test]
fn test_default_config() {
    let config = QueryConfig::default();
    assert_eq!(config.revalidate_after, Duration::from_secs(300));
    assert!(config.revalidate_on_focus);
    assert!(config.revalidate_on_connect);
    assert!(!config.keep_data_on_error);
    assert_eq!(
        (config.should_retry_in)(1, &ResolveError::failed("x")),
        Some(Duration::from_secs(1))
    );
    assert_eq!(
        (config.should_retry_in)(3, &ResolveError::failed("x")),
        Some(Duration::from_secs(9))
    );
    assert_eq!((config.should_retry_in)(4, &ResolveError::failed("x")), None);
}

#[test]
fn test_config_deserializes_from_yaml() -> anyhow::Result<()> {
    let yaml = r#"
        revalidate_after: 2m 30s
        revalidate_on_focus: false
    "#;
    let config: QueryConfig = serde_yaml::from_str(yaml)?;
    assert_eq!(config.revalidate_after, Duration::from_secs(150));
    assert!(!config.revalidate_on_focus);
    assert!(config.revalidate_on_connect);
    assert!(!config.keep_data_on_error);
    // The retry policy falls back to the default schedule.
    assert_eq!(
        (config.should_retry_in)(2, &ResolveError::failed("x")),
        Some(Duration::from_secs(4))
    );
    Ok(())
}
