//! Cooperative execution with per-environment affinity.
//!
//! Work is routed to one of three places:
//!
//! - an **affinity queue**: strictly serial, in submission order, one per
//!   [`AffinityKey`] (typically one per script environment);
//! - the **I/O pool**: unordered blocking work such as file reads and
//!   compilation;
//! - a **named pool**: unordered async work with its own concurrency limit.
//!
//! A task on an affinity queue may *suspend*: it mints a [`PendingKey`]
//! through the [`ContinuationRegistry`] and awaits the returned
//! [`Suspension`]. The physical worker thread is released while it waits,
//! but the queue stays with the suspended task, so nothing else touches the
//! environment until the key is resumed and the task runs to completion.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use jibbr_execution::{AffinityKey, AffinityScheduler, ContinuationError, ContinuationRegistry, SchedulerConfig};
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let scheduler = AffinityScheduler::new(tokio::runtime::Handle::current(), SchedulerConfig::default());
//! let registry = Arc::new(ContinuationRegistry::<u32, ContinuationError>::new());
//!
//! let (key_tx, key_rx) = tokio::sync::oneshot::channel();
//! let task = {
//!     let registry = Arc::clone(&registry);
//!     scheduler.run_on(AffinityKey::new("env"), async move {
//!         let (key, suspension) = registry.suspend().expect("inside a task");
//!         key_tx.send(key).ok();
//!         suspension.await
//!     })
//! };
//!
//! let key = key_rx.await.unwrap();
//! registry.resume(&key, Ok(7)).unwrap();
//! assert_eq!(task.await.unwrap().unwrap(), 7);
//! # });
//! ```

mod affinity;
mod continuation;
mod error;
mod scheduler;

pub use affinity::{AffinityKey, current_affinity};
pub use continuation::{ContinuationRegistry, PendingId, PendingKey, Suspension};
pub use error::{ContinuationError, ResumeError, ScheduleError};
pub use scheduler::{AffinityScheduler, BoxFuture, PoolName, SchedulerConfig, TaskHandle};
