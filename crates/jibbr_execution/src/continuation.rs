//! Pending keys and the registry that resolves them.
//!
//! A [`PendingKey`] is minted by [`ContinuationRegistry::suspend`] from inside
//! an affinity task. The task awaits the paired [`Suspension`]; whoever
//! finishes the awaited work calls [`resume`](ContinuationRegistry::resume)
//! from any thread, and the task continues exactly where it left off, still
//! holding its affinity.
//!
//! Every key resolves at most once. A second resume is rejected with
//! [`ResumeError::AlreadyResolved`] and logged at error level; the value
//! delivered by the first resume is unaffected.

use core::fmt;
use core::pin::Pin;
use core::sync::atomic::{AtomicU8, Ordering};
use core::task::{Context, Poll};
use core::time::Duration;
use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::affinity::{AffinityKey, current_affinity};
use crate::error::{ContinuationError, ResumeError};

const WAITING: u8 = 0;
const RESOLVED: u8 = 1;
const CANCELLED: u8 = 2;

// ─────────────────────────────────────────────────────────────────────────────
// PendingId / PendingKey
// ─────────────────────────────────────────────────────────────────────────────

/// Unique identifier of a pending key.
///
/// Generated with nanoid, so ids never collide across registries.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PendingId(Arc<str>);

impl PendingId {
    /// Creates a fresh unique id.
    #[must_use]
    pub fn new() -> Self {
        Self(nanoid::nanoid!().into())
    }

    /// Creates an id from a specific string, e.g. one echoed back by a client.
    #[must_use]
    pub fn from_string(id: impl Into<Arc<str>>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for PendingId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PendingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pending_{}", self.0)
    }
}

/// Token for one suspended execution.
#[derive(Clone)]
pub struct PendingKey {
    id: PendingId,
    owner: AffinityKey,
    state: Arc<AtomicU8>,
}

impl PendingKey {
    /// Returns the key's id.
    #[must_use]
    pub fn id(&self) -> &PendingId {
        &self.id
    }

    /// Returns the affinity of the task that suspended.
    #[must_use]
    pub fn owner(&self) -> &AffinityKey {
        &self.owner
    }

    /// Returns `true` once the key has been resumed or cancelled.
    #[must_use]
    pub fn is_settled(&self) -> bool {
        self.state.load(Ordering::Acquire) != WAITING
    }
}

impl PartialEq for PendingKey {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for PendingKey {}

impl fmt::Debug for PendingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingKey")
            .field("id", &self.id)
            .field("owner", &self.owner)
            .field("settled", &self.is_settled())
            .finish()
    }
}

impl fmt::Display for PendingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.id, f)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Suspension
// ─────────────────────────────────────────────────────────────────────────────

/// Completes with the value or error the paired key is resumed with.
pub struct Suspension<T, E> {
    rx: oneshot::Receiver<Result<T, E>>,
}

impl<T, E> fmt::Debug for Suspension<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Suspension").finish_non_exhaustive()
    }
}

impl<T, E: From<ContinuationError>> Future for Suspension<T, E> {
    type Output = Result<T, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.get_mut().rx).poll(cx).map(|received| {
            received.unwrap_or_else(|_| Err(E::from(ContinuationError::Abandoned)))
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// ContinuationRegistry
// ─────────────────────────────────────────────────────────────────────────────

struct Entry<T, E> {
    owner: AffinityKey,
    state: Arc<AtomicU8>,
    sender: oneshot::Sender<Result<T, E>>,
}

/// Tracks outstanding pending keys and delivers their results.
///
/// `T` is the resumed value; `E` the error raised at the suspension point.
pub struct ContinuationRegistry<T, E> {
    pending: Mutex<HashMap<PendingId, Entry<T, E>>>,
}

impl<T, E> Default for ContinuationRegistry<T, E> {
    fn default() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
        }
    }
}

impl<T, E> fmt::Debug for ContinuationRegistry<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContinuationRegistry")
            .field("pending", &self.pending.lock().len())
            .finish()
    }
}

impl<T, E> ContinuationRegistry<T, E>
where
    T: Send + 'static,
    E: From<ContinuationError> + Send + 'static,
{
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mints a key owned by the running affinity task.
    ///
    /// Fails with [`ContinuationError::NotInTask`] outside of one.
    pub fn suspend(&self) -> Result<(PendingKey, Suspension<T, E>), ContinuationError> {
        let owner = current_affinity().ok_or(ContinuationError::NotInTask)?;
        let (sender, rx) = oneshot::channel();
        let key = PendingKey {
            id: PendingId::new(),
            owner: owner.clone(),
            state: Arc::new(AtomicU8::new(WAITING)),
        };

        self.pending.lock().insert(
            key.id.clone(),
            Entry {
                owner,
                state: Arc::clone(&key.state),
                sender,
            },
        );
        tracing::trace!(key = %key, owner = %key.owner, "suspended");
        Ok((key, Suspension { rx }))
    }

    /// Resumes `key` with `result`.
    ///
    /// Keys minted by another registry are rejected with
    /// [`ResumeError::Unknown`] and left untouched.
    pub fn resume(&self, key: &PendingKey, result: Result<T, E>) -> Result<(), ResumeError> {
        let Some(entry) = self.claim(key, RESOLVED) else {
            let error = match key.state.load(Ordering::Acquire) {
                RESOLVED => ResumeError::AlreadyResolved(key.id.clone()),
                CANCELLED => ResumeError::Cancelled(key.id.clone()),
                _ => ResumeError::Unknown(key.id.clone()),
            };
            tracing::error!(key = %key, %error, "invalid resume");
            return Err(error);
        };
        deliver(key, entry.sender, result);
        Ok(())
    }

    /// Resumes the outstanding key with the given id.
    ///
    /// Ids that are not outstanding (never minted here, already resolved, or
    /// cancelled) fail with [`ResumeError::Unknown`].
    pub fn resume_by_id(&self, id: &PendingId, result: Result<T, E>) -> Result<(), ResumeError> {
        let key = self.pending.lock().get(id).map(|entry| PendingKey {
            id: id.clone(),
            owner: entry.owner.clone(),
            state: Arc::clone(&entry.state),
        });
        match key {
            Some(key) => self.resume(&key, result),
            None => {
                let error = ResumeError::Unknown(id.clone());
                tracing::error!(key = %id, %error, "invalid resume");
                Err(error)
            }
        }
    }

    /// Cancels `key`. The suspended task receives [`ContinuationError::Cancelled`]
    /// and later resumes are rejected. Returns `false` if already settled.
    pub fn cancel(&self, key: &PendingKey) -> bool {
        self.settle(key, CANCELLED, || E::from(ContinuationError::Cancelled))
    }

    /// Resumes every key owned by `owner` with [`ContinuationError::ParentDied`].
    /// Returns how many keys were failed.
    pub fn fail_owner(&self, owner: &AffinityKey) -> usize {
        let keys: Vec<PendingKey> = self
            .pending
            .lock()
            .iter()
            .filter(|(_, entry)| &entry.owner == owner)
            .map(|(id, entry)| PendingKey {
                id: id.clone(),
                owner: entry.owner.clone(),
                state: Arc::clone(&entry.state),
            })
            .collect();

        let failed = keys
            .iter()
            .filter(|key| {
                self.settle(key, RESOLVED, || {
                    E::from(ContinuationError::ParentDied(owner.clone()))
                })
            })
            .count();
        if failed > 0 {
            tracing::debug!(owner = %owner, failed, "failed pending keys of dead owner");
        }
        failed
    }

    /// Force-resumes `key` with [`ContinuationError::TimedOut`] after `after`,
    /// unless it has been settled by then.
    ///
    /// Must be called within a Tokio runtime.
    pub fn expire_after(self: &Arc<Self>, key: &PendingKey, after: Duration) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        let key = key.clone();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let expired = registry.settle(&key, RESOLVED, || {
                E::from(ContinuationError::TimedOut {
                    key: key.id.clone(),
                    after,
                })
            });
            if expired {
                tracing::warn!(key = %key, after = ?after, "pending key timed out");
            }
        })
    }

    /// Returns the number of outstanding keys owned by `owner`.
    #[must_use]
    pub fn outstanding(&self, owner: &AffinityKey) -> usize {
        self.pending
            .lock()
            .values()
            .filter(|entry| &entry.owner == owner)
            .count()
    }

    /// Returns the number of outstanding keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Returns `true` if no key is outstanding.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }

    /// Settles `key` into `state` with an error, without logging lost races.
    fn settle(&self, key: &PendingKey, state: u8, error: impl FnOnce() -> E) -> bool {
        match self.claim(key, state) {
            Some(entry) => {
                deliver(key, entry.sender, Err(error()));
                true
            }
            None => false,
        }
    }

    /// Moves `key` from waiting to `state` and takes its entry, provided the
    /// key is outstanding in this registry.
    fn claim(&self, key: &PendingKey, state: u8) -> Option<Entry<T, E>> {
        let mut pending = self.pending.lock();
        let ours = pending
            .get(&key.id)
            .is_some_and(|entry| Arc::ptr_eq(&entry.state, &key.state));
        if !ours {
            return None;
        }
        key.state
            .compare_exchange(WAITING, state, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        pending.remove(&key.id)
    }
}

fn deliver<T, E>(key: &PendingKey, sender: oneshot::Sender<Result<T, E>>, result: Result<T, E>) {
    if sender.send(result).is_err() {
        tracing::debug!(key = %key, "suspended task is gone, result dropped");
    } else {
        tracing::trace!(key = %key, "resumed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::{AffinityScheduler, SchedulerConfig};

    type Registry = ContinuationRegistry<i64, ContinuationError>;

    #[test]
    fn suspend_outside_task_is_rejected() {
        let registry = Registry::new();
        assert_eq!(
            registry.suspend().map(|_| ()).expect_err("no task"),
            ContinuationError::NotInTask
        );
    }

    #[test]
    fn pending_ids_are_unique() {
        let a = PendingId::new();
        let b = PendingId::new();
        assert_ne!(a, b);
        assert!(a.to_string().starts_with("pending_"));
    }

    #[tokio::test]
    async fn resume_delivers_value_and_rejects_second_resume() {
        let scheduler = AffinityScheduler::new(tokio::runtime::Handle::current(), SchedulerConfig::default());
        let registry = Arc::new(Registry::new());

        let (keys_tx, keys_rx) = oneshot::channel();
        let task = {
            let registry = Arc::clone(&registry);
            scheduler.run_on(AffinityKey::new("env"), async move {
                let (key, suspension) = registry.suspend().expect("inside task");
                keys_tx.send(key).expect("receiver alive");
                suspension.await
            })
        };

        let key = keys_rx.await.expect("key minted");
        assert_eq!(key.owner().as_str(), "env");
        assert_eq!(registry.outstanding(key.owner()), 1);

        registry.resume(&key, Ok(5)).expect("first resume");
        assert_eq!(
            registry.resume(&key, Ok(6)),
            Err(ResumeError::AlreadyResolved(key.id().clone()))
        );
        assert_eq!(task.await.expect("task ran"), Ok(5));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn foreign_registry_cannot_settle_a_key() {
        let scheduler = AffinityScheduler::new(tokio::runtime::Handle::current(), SchedulerConfig::default());
        let owner = Arc::new(Registry::new());
        let stranger = Registry::new();

        let (keys_tx, keys_rx) = oneshot::channel();
        let task = {
            let owner = Arc::clone(&owner);
            scheduler.run_on(AffinityKey::new("env"), async move {
                let (key, suspension) = owner.suspend().expect("inside task");
                keys_tx.send(key).expect("receiver alive");
                suspension.await
            })
        };
        let key = keys_rx.await.expect("key minted");

        assert_eq!(
            stranger.resume(&key, Ok(1)),
            Err(ResumeError::Unknown(key.id().clone()))
        );
        assert!(!stranger.cancel(&key));
        assert!(!key.is_settled());
        assert_eq!(owner.outstanding(key.owner()), 1);

        owner.resume(&key, Ok(2)).expect("owner resumes");
        assert_eq!(task.await.expect("task ran"), Ok(2));
        assert!(owner.is_empty());
    }

    #[tokio::test]
    async fn unknown_id_is_rejected() {
        let registry = Registry::new();
        let id = PendingId::from_string("nope");
        assert_eq!(
            registry.resume_by_id(&id, Ok(1)),
            Err(ResumeError::Unknown(id.clone()))
        );
    }
}
