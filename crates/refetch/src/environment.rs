//! Process-wide environment signals.
//!
//! The host application reports focus and connectivity regains through
//! [`emit`]; every query configured with
//! [`revalidate_on_focus`](crate::QueryConfig::revalidate_on_focus) or
//! [`revalidate_on_connect`](crate::QueryConfig::revalidate_on_connect)
//! invalidates all of its entries when the matching event arrives.
//!
//! Registrations are owned by the query that made them and disposed when the
//! query is dropped, so emitting into a torn-down cache is a no-op.

use std::sync::OnceLock;

use tokio::sync::broadcast;

/// An environment-level signal relevant to cache freshness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// The environment regained user focus.
    Focus,
    /// The environment regained network connectivity.
    Online,
}

fn channel() -> &'static broadcast::Sender<Event> {
    static CHANNEL: OnceLock<broadcast::Sender<Event>> = OnceLock::new();
    CHANNEL.get_or_init(|| broadcast::channel(16).0)
}

/// Broadcasts an environment event to every listening query.
pub fn emit(event: Event) {
    tracing::debug!(?event, "environment event");
    // Sending fails when no query is listening; nothing to do then.
    let _ = channel().send(event);
}

pub(crate) fn listen() -> broadcast::Receiver<Event> {
    channel().subscribe()
}
