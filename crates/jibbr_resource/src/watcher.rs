//! Change detection and reload propagation.
//!
//! The watcher asks resources whether they [need replacing](Resource::needs_replacing)
//! and, when they do, performs the cascading kill and schedules a background
//! reload of every root that died so its slot is refilled in place.
//!
//! [`ResourceWatcher::watch`] subscribes to the platform's file notification
//! service through `notify` and feeds every change into
//! [`ResourceWatcher::path_changed`]. Where no native backend can be started
//! it falls back to sweeping all live resources on an interval
//! ([`ResourceWatcher::spawn_polling`]).

use core::fmt;
use core::time::Duration;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::cache::ResourceCache;
use crate::key::ResourceKey;
use crate::resource::Resource;

/// Invalidates stale resources and reloads the roots they took down.
#[derive(Debug, Clone)]
pub struct ResourceWatcher {
    cache: Arc<ResourceCache>,
    handle: Handle,
}

impl ResourceWatcher {
    /// Creates a watcher that runs reloads on `handle`'s blocking pool.
    #[must_use]
    pub fn new(cache: Arc<ResourceCache>, handle: Handle) -> Self {
        Self { cache, handle }
    }

    /// Returns `true` if `resource` is alive but out of date.
    #[must_use]
    pub fn check_stale(&self, resource: &Arc<dyn Resource>) -> bool {
        resource.is_alive() && resource.needs_replacing()
    }

    /// Kills `resource` with its dependents and reloads the dead roots in the
    /// background. Returns the keys being reloaded.
    pub fn invalidate(&self, resource: &Arc<dyn Resource>) -> Vec<ResourceKey> {
        let roots = self.cache.kill(resource);
        for key in &roots {
            self.spawn_reload(key.clone());
        }
        tracing::debug!(
            key = %resource.key(),
            roots = roots.len(),
            "resource invalidated"
        );
        roots
    }

    /// Reacts to a change of the file at `path`.
    ///
    /// Deleted files kill their resources outright. Resources of a modified
    /// file are invalidated, and their roots reloaded, only if their contents
    /// really changed. Returns the number of resources affected.
    pub fn path_changed(&self, path: &Path, deleted: bool) -> usize {
        let mut affected = 0;
        for resource in self.cache.find_by_path(path) {
            if deleted {
                let _ = self.cache.kill(&resource);
            } else if self.check_stale(&resource) {
                let _ = self.invalidate(&resource);
            } else {
                continue;
            }
            affected += 1;
        }
        affected
    }

    /// Checks every live resource once and invalidates the stale ones.
    /// Returns how many were invalidated.
    pub fn sweep(&self) -> usize {
        let mut invalidated = 0;
        for resource in self.cache.live_resources() {
            if self.check_stale(&resource) {
                tracing::info!(key = %resource.key(), "stale resource detected");
                let _ = self.invalidate(&resource);
                invalidated += 1;
            }
        }
        invalidated
    }

    fn spawn_reload(&self, key: ResourceKey) {
        let cache = Arc::clone(&self.cache);
        self.handle.spawn_blocking(move || match cache.reload(&key) {
            Ok(_) => tracing::debug!(%key, "root reloaded"),
            Err(error) => tracing::warn!(%key, %error, "root reload failed"),
        });
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Drivers
    // ─────────────────────────────────────────────────────────────────────────

    /// Watches `roots` recursively with the native backend, polling every
    /// `fallback` instead if it cannot be started.
    ///
    /// Roots should be spelled the way resource paths are, e.g. the
    /// directories of a [`ResourceSettings`](crate::ResourceSettings), so
    /// event paths match [`Resource::path`].
    #[must_use]
    pub fn watch(&self, roots: &[PathBuf], fallback: Duration) -> WatchHandle {
        match self.spawn_native(roots) {
            Ok(handle) => handle,
            Err(error) => {
                tracing::warn!(%error, "native file watching unavailable, polling instead");
                self.spawn_polling(fallback)
            }
        }
    }

    /// Subscribes to file notifications under `roots` and invalidates the
    /// resources of every changed path until the handle is stopped or
    /// dropped.
    pub fn spawn_native(&self, roots: &[PathBuf]) -> notify::Result<WatchHandle> {
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let mut native = notify::recommended_watcher(move |event: notify::Result<Event>| {
            let _ = events_tx.send(event);
        })?;
        for root in roots {
            native.watch(root, RecursiveMode::Recursive)?;
        }

        let (stop, mut stopped) = oneshot::channel::<()>();
        let watcher = self.clone();
        let task = self.handle.spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut stopped => break,
                    event = events.recv() => match event {
                        Some(Ok(event)) => watcher.dispatch(event).await,
                        Some(Err(error)) => tracing::warn!(%error, "file watch error"),
                        None => break,
                    },
                }
            }
            tracing::debug!("native resource watcher stopped");
        });

        tracing::debug!(roots = roots.len(), "native resource watcher started");
        Ok(WatchHandle {
            stop: Some(stop),
            task: Some(task),
            native: Some(native),
        })
    }

    async fn dispatch(&self, event: Event) {
        let removal = matches!(event.kind, EventKind::Remove(_));
        if !removal && !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
            return;
        }

        let watcher = self.clone();
        let handled = tokio::task::spawn_blocking(move || {
            event
                .paths
                .iter()
                .map(|path| watcher.path_changed(path, removal || !path.exists()))
                .sum::<usize>()
        })
        .await;

        match handled {
            Ok(0) => {}
            Ok(count) => tracing::debug!(count, "file change invalidated resources"),
            Err(error) => tracing::error!(%error, "file change handling panicked"),
        }
    }

    /// Sweeps every `interval` on the blocking pool until the returned handle
    /// is stopped or dropped.
    #[must_use]
    pub fn spawn_polling(&self, interval: Duration) -> WatchHandle {
        let (stop, mut stopped) = oneshot::channel::<()>();
        let watcher = self.clone();

        let task = self.handle.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = &mut stopped => break,
                    _ = ticker.tick() => {
                        let sweeper = watcher.clone();
                        match tokio::task::spawn_blocking(move || sweeper.sweep()).await {
                            Ok(0) => {}
                            Ok(count) => tracing::debug!(count, "watch sweep invalidated resources"),
                            Err(error) => tracing::error!(%error, "watch sweep panicked"),
                        }
                    }
                }
            }
            tracing::debug!("resource watcher stopped");
        });

        WatchHandle {
            stop: Some(stop),
            task: Some(task),
            native: None,
        }
    }
}

/// Stops a watcher when stopped or dropped.
pub struct WatchHandle {
    stop: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
    native: Option<RecommendedWatcher>,
}

impl WatchHandle {
    /// Signals the watcher to stop and waits for it to exit.
    pub async fn stop(mut self) {
        self.native = None;
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }

    /// Returns `true` if changes arrive from the native backend rather than
    /// from polling.
    #[must_use]
    pub fn is_native(&self) -> bool {
        self.native.is_some()
    }

    /// Returns `true` once the watcher task has exited.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.as_ref().is_none_or(JoinHandle::is_finished)
    }
}

impl fmt::Debug for WatchHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchHandle")
            .field("native", &self.native.is_some())
            .field("finished", &self.is_finished())
            .finish()
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}
