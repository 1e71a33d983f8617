//! The affinity scheduler.
//!
//! Each [`AffinityKey`] owns a FIFO queue drained by at most one Tokio task at
//! a time. The drainer awaits every job to completion before starting the
//! next, so two jobs for the same key never overlap, even when one of them is
//! parked on a suspension. Different keys drain concurrently across the
//! worker pool.
//!
//! Jobs that sit in a queue longer than
//! [`max_queued_time`](SchedulerConfig::with_max_queued_time) are reported
//! with a warning; every job's run time is traced.

use core::fmt;
use core::panic::AssertUnwindSafe;
use core::pin::Pin;
use core::task::{Context, Poll};
use core::time::Duration;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use hashbrown::HashMap;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::{Semaphore, oneshot};

use crate::affinity::{AffinityKey, with_affinity};
use crate::error::ScheduleError;

/// A boxed, pinned, `Send` future.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Name of an unordered worker pool.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolName(Arc<str>);

impl PoolName {
    /// Creates a pool name.
    #[must_use]
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self(name.into())
    }

    /// The pool used for protocol control work (REPL input, shutdown hooks).
    #[must_use]
    pub fn control() -> Self {
        Self::new("control")
    }

    /// Returns the name as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PoolName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Scheduler limits.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    io_threads: usize,
    max_queued_time: Duration,
    pools: Vec<(PoolName, usize)>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            io_threads: 8,
            max_queued_time: Duration::from_secs(20),
            pools: vec![(PoolName::control(), 1)],
        }
    }
}

impl SchedulerConfig {
    /// Sets how many blocking I/O tasks may run at once.
    #[must_use]
    pub fn with_io_threads(mut self, threads: usize) -> Self {
        self.io_threads = threads.max(1);
        self
    }

    /// Sets the queue wait after which a warning is logged.
    #[must_use]
    pub fn with_max_queued_time(mut self, max: Duration) -> Self {
        self.max_queued_time = max;
        self
    }

    /// Adds (or resizes) a named pool.
    #[must_use]
    pub fn with_pool(mut self, name: PoolName, concurrency: usize) -> Self {
        self.pools.retain(|(existing, _)| existing != &name);
        self.pools.push((name, concurrency.max(1)));
        self
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// TaskHandle
// ─────────────────────────────────────────────────────────────────────────────

/// Resolves to a scheduled task's output.
///
/// Dropping the handle does not cancel the task.
#[derive(Debug)]
pub struct TaskHandle<T> {
    rx: oneshot::Receiver<T>,
}

impl<T> Future for TaskHandle<T> {
    type Output = Result<T, ScheduleError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.get_mut().rx)
            .poll(cx)
            .map(|result| result.map_err(|_| ScheduleError::TaskDropped))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Queues
// ─────────────────────────────────────────────────────────────────────────────

struct Job {
    enqueued_at: Instant,
    future: BoxFuture<'static, ()>,
}

#[derive(Default)]
struct QueueState {
    jobs: VecDeque<Job>,
    running: bool,
    retired: bool,
}

#[derive(Default)]
struct AffinityQueue {
    state: Mutex<QueueState>,
}

type QueueMap = Arc<Mutex<HashMap<AffinityKey, Arc<AffinityQueue>>>>;

// ─────────────────────────────────────────────────────────────────────────────
// AffinityScheduler
// ─────────────────────────────────────────────────────────────────────────────

/// Routes work to affinity queues, the I/O pool, or named pools.
pub struct AffinityScheduler {
    handle: Handle,
    // Lock order: `queues` before any queue's `state`.
    queues: QueueMap,
    io_permits: Arc<Semaphore>,
    pools: HashMap<PoolName, Arc<Semaphore>>,
    max_queued_time: Duration,
}

impl fmt::Debug for AffinityScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AffinityScheduler")
            .field("queues", &self.queues.lock().len())
            .field("io_available", &self.io_permits.available_permits())
            .field("pools", &self.pools.keys().collect::<Vec<_>>())
            .field("max_queued_time", &self.max_queued_time)
            .finish()
    }
}

impl AffinityScheduler {
    /// Creates a scheduler spawning onto `handle`.
    #[must_use]
    pub fn new(handle: Handle, config: SchedulerConfig) -> Self {
        let pools = config
            .pools
            .into_iter()
            .map(|(name, concurrency)| (name, Arc::new(Semaphore::new(concurrency))))
            .collect();
        Self {
            handle,
            queues: Arc::new(Mutex::new(HashMap::new())),
            io_permits: Arc::new(Semaphore::new(config.io_threads)),
            pools,
            max_queued_time: config.max_queued_time,
        }
    }

    /// Returns the runtime handle tasks are spawned on.
    #[must_use]
    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Enqueues `future` on the serial queue for `key`.
    ///
    /// Futures with the same key run one at a time, in submission order.
    pub fn run_on<F, T>(&self, key: AffinityKey, future: F) -> TaskHandle<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job = Job {
            enqueued_at: Instant::now(),
            future: Box::pin(async move {
                let _ = tx.send(future.await);
            }),
        };

        let start = {
            let mut queues = self.queues.lock();
            let queue = Arc::clone(queues.entry(key.clone()).or_default());
            let mut state = queue.state.lock();
            state.retired = false;
            state.jobs.push_back(job);
            if state.running {
                None
            } else {
                state.running = true;
                drop(state);
                Some(queue)
            }
        };

        if let Some(queue) = start {
            self.handle.spawn(drain(
                key,
                queue,
                Arc::clone(&self.queues),
                self.max_queued_time,
            ));
        }
        TaskHandle { rx }
    }

    /// Runs blocking `work` on the I/O pool.
    pub fn run_on_io<F, T>(&self, work: F) -> TaskHandle<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let permits = Arc::clone(&self.io_permits);
        let enqueued_at = Instant::now();
        let max_queued_time = self.max_queued_time;

        self.handle.spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            report_wait("io", enqueued_at, max_queued_time);
            match tokio::task::spawn_blocking(work).await {
                Ok(output) => {
                    let _ = tx.send(output);
                }
                Err(error) => tracing::error!(%error, "i/o task panicked"),
            }
        });
        TaskHandle { rx }
    }

    /// Runs `future` on the named pool, bounded by the pool's concurrency.
    pub fn run_on_pool<F, T>(&self, pool: &PoolName, future: F) -> Result<TaskHandle<T>, ScheduleError>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let permits = self
            .pools
            .get(pool)
            .cloned()
            .ok_or_else(|| ScheduleError::UnknownPool(pool.to_string()))?;
        let (tx, rx) = oneshot::channel();
        let enqueued_at = Instant::now();
        let max_queued_time = self.max_queued_time;
        let name = pool.clone();

        self.handle.spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            report_wait(name.as_str(), enqueued_at, max_queued_time);
            let _ = tx.send(future.await);
        });
        Ok(TaskHandle { rx })
    }

    /// Drops the queue for `key` once it is idle.
    ///
    /// A queue that is still draining is removed when its last job finishes,
    /// unless new work arrives first.
    pub fn retire(&self, key: &AffinityKey) {
        let mut queues = self.queues.lock();
        let Some(queue) = queues.get(key).cloned() else {
            return;
        };
        let mut state = queue.state.lock();
        if state.running || !state.jobs.is_empty() {
            state.retired = true;
        } else {
            drop(state);
            queues.remove(key);
        }
    }

    /// Returns the number of affinity queues currently tracked.
    #[must_use]
    pub fn queue_count(&self) -> usize {
        self.queues.lock().len()
    }
}

async fn drain(
    key: AffinityKey,
    queue: Arc<AffinityQueue>,
    queues: QueueMap,
    max_queued_time: Duration,
) {
    while let Some(job) = next_job(&key, &queue, &queues) {
        report_wait(key.as_str(), job.enqueued_at, max_queued_time);

        let started = Instant::now();
        let outcome = AssertUnwindSafe(with_affinity(key.clone(), job.future))
            .catch_unwind()
            .await;
        if outcome.is_err() {
            tracing::error!(affinity = %key, "affinity task panicked");
        }
        tracing::trace!(affinity = %key, elapsed = ?started.elapsed(), "affinity task finished");
    }
}

fn next_job(key: &AffinityKey, queue: &Arc<AffinityQueue>, queues: &QueueMap) -> Option<Job> {
    if let Some(job) = queue.state.lock().jobs.pop_front() {
        return Some(job);
    }

    let mut queues = queues.lock();
    let mut state = queue.state.lock();
    if let Some(job) = state.jobs.pop_front() {
        return Some(job);
    }
    state.running = false;
    if state.retired && queues.get(key).is_some_and(|current| Arc::ptr_eq(current, queue)) {
        drop(state);
        queues.remove(key);
        tracing::debug!(affinity = %key, "retired affinity queue");
    }
    None
}

fn report_wait(queue: &str, enqueued_at: Instant, max_queued_time: Duration) {
    let waited = enqueued_at.elapsed();
    if waited > max_queued_time {
        tracing::warn!(queue, waited = ?waited, "task waited too long before running");
    }
}
