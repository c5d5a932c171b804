//! Structural equality and structural sharing over [`Value`](crate::Value)
//! trees.
//!
//! Equality defines cache identity: two variables values address the same
//! cache entry iff [`deep_equal`] holds. Sharing preserves instance identity
//! across payloads: [`reuse_instances`] rebuilds a freshly resolved tree out
//! of the previously cached subtrees wherever they are deeply equal.

mod eq;
mod sharing;

pub use eq::{deep_equal, partial_deep_equal};
pub use sharing::reuse_instances;
