//! Helpers for testing the cache engine.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all
//!    console output is captured by the test runner.
//!
//!  - Settlements and timers are recorded by spawned driver tasks. After an
//!    event that settles a resolution (opening a [`Gate`], advancing the
//!    paused clock), await [`settle`] so those tasks get to run before
//!    asserting on cache state.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::Semaphore;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `refetch`
///    crate and mutes all other logs.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("refetch=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Yields a handful of times so spawned driver tasks get to run.
pub async fn settle() {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}

/// A manually opened gate: [`pass`](Self::pass) waits until a permit is
/// released with [`open`](Self::open).
///
/// Useful for resolvers whose settlement order the test controls.
#[derive(Clone)]
pub struct Gate {
    semaphore: Arc<Semaphore>,
}

impl Gate {
    pub fn new() -> Self {
        Gate {
            semaphore: Arc::new(Semaphore::new(0)),
        }
    }

    /// Releases `count` waiters.
    pub fn open(&self, count: usize) {
        self.semaphore.add_permits(count);
    }

    /// Waits for a permit and consumes it.
    pub async fn pass(&self) {
        self.semaphore
            .acquire()
            .await
            .expect("gate semaphore closed")
            .forget();
    }
}

impl Default for Gate {
    fn default() -> Self {
        Self::new()
    }
}

/// A shared counter, doubling as a fake external data store.
#[derive(Clone, Default)]
pub struct Counter(Arc<AtomicU64>);

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increments and returns the new value.
    pub fn bump(&self) -> u64 {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }

    pub fn set(&self, value: u64) {
        self.0.store(value, Ordering::SeqCst);
    }
}
