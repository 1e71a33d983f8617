//! Affinity identity and the task-local marking which queue is running.

use core::fmt;
use std::sync::Arc;

tokio::task_local! {
    static CURRENT_AFFINITY: AffinityKey;
}

/// Identifies a strictly serial logical thread.
///
/// Internally uses `Arc<str>` for cheap cloning.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AffinityKey(Arc<str>);

impl AffinityKey {
    /// Creates a key from any stable identifier.
    #[must_use]
    pub fn new(id: impl Into<Arc<str>>) -> Self {
        Self(id.into())
    }

    /// Returns the key as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AffinityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Returns the affinity of the task currently running on an affinity queue,
/// or `None` outside of one.
#[must_use]
pub fn current_affinity() -> Option<AffinityKey> {
    CURRENT_AFFINITY.try_with(Clone::clone).ok()
}

/// Runs `future` with `key` as the current affinity.
pub(crate) async fn with_affinity<F: Future>(key: AffinityKey, future: F) -> F::Output {
    CURRENT_AFFINITY.scope(key, future).await
}
