use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use super::error::ResolveError;

/// Decides whether, and after which delay, a rejected resolution is retried.
///
/// Called with the number of consecutive rejections so far (`1` on the first
/// failure) and the rejection's error. `None` stops retrying.
pub type RetryPolicy = Arc<dyn Fn(u64, &ResolveError) -> Option<Duration> + Send + Sync>;

/// The default backoff: give up after 3 consecutive failures, otherwise wait
/// `retries² * 1000` milliseconds.
pub fn default_retry_policy() -> RetryPolicy {
    Arc::new(|retries, _error| {
        if retries > 3 {
            return None;
        }
        Some(Duration::from_millis(1000 * retries * retries))
    })
}

/// Configuration for a [`Query`](crate::Query).
///
/// Durations deserialize in humantime notation (e.g. `5m`, `90s`).
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    /// How long a settled resolution stays fresh before an actively
    /// subscribed entry is re-resolved. Zero disables time-based
    /// revalidation.
    #[serde(with = "humantime_serde")]
    pub revalidate_after: Duration,

    /// Invalidate all entries when the environment regains focus
    /// (see [`environment`](crate::environment)).
    pub revalidate_on_focus: bool,

    /// Invalidate all entries when the environment regains connectivity.
    pub revalidate_on_connect: bool,

    /// Keep surfacing the newest resolved payload when a newer resolution
    /// has rejected, instead of masking it with the error.
    pub keep_data_on_error: bool,

    /// Backoff schedule for rejected resolutions.
    #[serde(skip, default = "default_retry_policy")]
    pub should_retry_in: RetryPolicy,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            revalidate_after: Duration::from_secs(300),
            revalidate_on_focus: true,
            revalidate_on_connect: true,
            keep_data_on_error: false,
            should_retry_in: default_retry_policy(),
        }
    }
}

impl fmt::Debug for QueryConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryConfig")
            .field("revalidate_after", &self.revalidate_after)
            .field("revalidate_on_focus", &self.revalidate_on_focus)
            .field("revalidate_on_connect", &self.revalidate_on_connect)
            .field("keep_data_on_error", &self.keep_data_on_error)
            .finish()
    }
}
