//! Error types for scheduling and continuations.

use core::time::Duration;

use crate::affinity::AffinityKey;
use crate::continuation::PendingId;

/// Errors surfaced by the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScheduleError {
    /// The task was dropped before producing a result (it panicked, or the
    /// runtime shut down).
    #[error("task was dropped before completing")]
    TaskDropped,

    /// No pool with this name was configured.
    #[error("unknown pool '{0}'")]
    UnknownPool(String),
}

/// Failures delivered to a suspended task instead of a value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContinuationError {
    /// `suspend` was called outside of an affinity task.
    #[error("suspension requested outside of a running affinity task")]
    NotInTask,

    /// The environment owning the key died while it was outstanding.
    #[error("owner '{0}' died while the continuation was pending")]
    ParentDied(AffinityKey),

    /// The key was force-resumed after its deadline.
    #[error("continuation {key} timed out after {after:?}")]
    TimedOut {
        /// The expired key.
        key: PendingId,
        /// The deadline that passed.
        after: Duration,
    },

    /// The key was cancelled.
    #[error("continuation was cancelled")]
    Cancelled,

    /// The registry was dropped without resolving the key.
    #[error("continuation was abandoned")]
    Abandoned,
}

/// Internal-consistency errors raised by an invalid resume.
///
/// These indicate a bug in the caller, never a runtime condition, and are
/// logged at error level when they occur.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResumeError {
    /// The key was already resumed once.
    #[error("pending key {0} was already resolved")]
    AlreadyResolved(PendingId),

    /// No outstanding key has this id.
    #[error("no pending key {0}")]
    Unknown(PendingId),

    /// The key was cancelled before this resume.
    #[error("pending key {0} was cancelled")]
    Cancelled(PendingId),
}
