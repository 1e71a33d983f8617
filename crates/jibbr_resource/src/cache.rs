//! The resource cache.
//!
//! [`ResourceCache`] maps each [`ResourceKey`] to a single canonical live
//! resource. A key's slot is either *ready* (holding a resource, possibly a
//! dead root awaiting refill) or *loading* (holding an in-flight creation
//! that other callers wait on).
//!
//! # Creation
//!
//! [`load_or_create`](ResourceCache::load_or_create) runs the creator at most
//! once per key at a time. Concurrent callers for the same key block until the
//! creator finishes and then observe the same instance, or the same error. A
//! failed creation publishes nothing; the key is freed for the next attempt.
//!
//! Creators may load other resources through the cache (that is how
//! dependencies are established while a resource is being built). A request
//! that would wait on its own creation fails with
//! [`ResourceError::CreationCycle`] rather than deadlocking. That covers a
//! creator asking for its own key and creators on different threads waiting on
//! each other's keys; the cache tracks which in-flight creation every blocked
//! thread is waiting on and follows that chain before blocking.
//!
//! # Cascading kill
//!
//! [`kill`](ResourceCache::kill) is depth-first: the resource is marked dead,
//! every dependent is killed (recursively, and removed from the map), then the
//! resource itself is removed from the map unless it is a root
//! ([`Resource::remove_on_reload`] returns `false`), whose dead slot stays for
//! the next load to replace. Resources already visited during one kill are
//! skipped, so a cycle created by a reload race terminates.

use core::fmt;
use std::path::Path;
use std::sync::Arc;
use std::thread::{self, ThreadId};

use hashbrown::{HashMap, HashSet};
use jibbr_events::HookRegistry;
use parking_lot::{Condvar, Mutex, RwLock};

use crate::error::ResourceError;
use crate::events::ResourceEvent;
use crate::key::{Location, ResourceKey, ResourceKind};
use crate::resource::Resource;

// ─────────────────────────────────────────────────────────────────────────────
// ResourceCreator
// ─────────────────────────────────────────────────────────────────────────────

/// Builds resources of one kind from their key alone.
///
/// Registered creators back [`ResourceCache::load`] and background reloads.
pub trait ResourceCreator: Send + Sync + 'static {
    /// The kind this creator builds.
    fn kind(&self) -> ResourceKind;

    /// Builds a fresh resource for `key`.
    ///
    /// The cache is passed so the creator can load (and depend on) other
    /// resources.
    fn create(
        &self,
        cache: &ResourceCache,
        key: &ResourceKey,
    ) -> Result<Arc<dyn Resource>, ResourceError>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Slots
// ─────────────────────────────────────────────────────────────────────────────

type Outcome = Result<Arc<dyn Resource>, ResourceError>;

/// A creation in progress.
struct InFlight {
    creator: ThreadId,
    outcome: Mutex<Option<Outcome>>,
    done: Condvar,
}

impl InFlight {
    fn new() -> Self {
        Self {
            creator: thread::current().id(),
            outcome: Mutex::new(None),
            done: Condvar::new(),
        }
    }

    fn wait(&self) -> Outcome {
        let mut outcome = self.outcome.lock();
        loop {
            if let Some(outcome) = outcome.as_ref() {
                return outcome.clone();
            }
            self.done.wait(&mut outcome);
        }
    }

    fn is_published(&self) -> bool {
        self.outcome.lock().is_some()
    }

    fn publish(&self, result: Outcome) {
        *self.outcome.lock() = Some(result);
        self.done.notify_all();
    }
}

enum Slot {
    Ready(Arc<dyn Resource>),
    Loading(Arc<InFlight>),
}

enum Claim {
    Wait(Arc<InFlight>),
    Create { replacing: bool },
}

/// Finishes a creation, failing waiters if the creator unwinds.
struct CreationGuard<'a> {
    cache: &'a ResourceCache,
    key: &'a ResourceKey,
    flight: Arc<InFlight>,
    replacing: bool,
    finished: bool,
}

impl CreationGuard<'_> {
    fn finish(mut self, result: Outcome) -> Outcome {
        self.finished = true;
        self.cache
            .complete(self.key, &self.flight, self.replacing, result)
    }
}

impl Drop for CreationGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            tracing::error!(key = %self.key, "resource creator panicked");
            let _ = self.cache.complete(
                self.key,
                &self.flight,
                self.replacing,
                Err(ResourceError::CreationAborted(self.key.clone())),
            );
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// ResourceCache
// ─────────────────────────────────────────────────────────────────────────────

/// Concurrent map from key to the single canonical live resource.
///
/// The cache is an ordinary value: share it with `Arc` and hand it to every
/// component that resolves resources.
pub struct ResourceCache {
    slots: Mutex<HashMap<ResourceKey, Slot>>,
    /// In-flight creation each blocked thread waits on. Locked after `slots`.
    waiting: Mutex<HashMap<ThreadId, Arc<InFlight>>>,
    creators: RwLock<HashMap<ResourceKind, Arc<dyn ResourceCreator>>>,
    events: HookRegistry<ResourceEvent>,
}

impl Default for ResourceCache {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ResourceCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceCache")
            .field("slots", &self.slots.lock().len())
            .field("creators", &self.creators.read().len())
            .finish()
    }
}

impl ResourceCache {
    /// Creates an empty cache with no creators.
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            waiting: Mutex::new(HashMap::new()),
            creators: RwLock::new(HashMap::new()),
            events: HookRegistry::new(),
        }
    }

    /// Returns the registry resource events are published to.
    #[must_use]
    pub fn events(&self) -> &HookRegistry<ResourceEvent> {
        &self.events
    }

    /// Registers the creator for its kind, replacing any previous one.
    pub fn register_creator(&self, creator: Arc<dyn ResourceCreator>) {
        let kind = creator.kind();
        if self.creators.write().insert(kind, creator).is_some() {
            tracing::debug!(%kind, "replaced resource creator");
        }
    }

    /// Returns `true` if a creator is registered for `kind`.
    #[must_use]
    pub fn has_creator(&self, kind: ResourceKind) -> bool {
        self.creators.read().contains_key(&kind)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Loading
    // ─────────────────────────────────────────────────────────────────────────

    /// Returns the live resource for `key`, creating it with `create` if needed.
    ///
    /// Blocks while another thread is creating the same key, unless that
    /// creation is itself (transitively) waiting on the caller, in which case
    /// [`ResourceError::CreationCycle`] is returned.
    pub fn load_or_create<F>(&self, key: &ResourceKey, create: F) -> Outcome
    where
        F: FnOnce(&ResourceKey) -> Outcome,
    {
        let me = thread::current().id();
        let claim = {
            let mut slots = self.slots.lock();
            let claim = match slots.get(key) {
                Some(Slot::Ready(resource)) if resource.is_alive() => {
                    return Ok(Arc::clone(resource));
                }
                Some(Slot::Loading(flight)) => {
                    if self.waits_on(me, flight) {
                        tracing::warn!(%key, "creation cycle detected");
                        return Err(ResourceError::CreationCycle(key.clone()));
                    }
                    Claim::Wait(Arc::clone(flight))
                }
                Some(Slot::Ready(_)) => Claim::Create { replacing: true },
                None => Claim::Create { replacing: false },
            };
            match claim {
                Claim::Wait(flight) => {
                    self.waiting.lock().insert(me, Arc::clone(&flight));
                    Err(flight)
                }
                Claim::Create { replacing } => {
                    let flight = Arc::new(InFlight::new());
                    slots.insert(key.clone(), Slot::Loading(Arc::clone(&flight)));
                    Ok((flight, replacing))
                }
            }
        };

        let (flight, replacing) = match claim {
            Ok(created) => created,
            Err(in_flight) => {
                let outcome = in_flight.wait();
                self.waiting.lock().remove(&me);
                return outcome;
            }
        };

        let guard = CreationGuard {
            cache: self,
            key,
            flight,
            replacing,
            finished: false,
        };
        let result = create(key);
        guard.finish(result)
    }

    /// Whether `flight` is run by `me`, or by a thread blocked (through any
    /// chain of waits) on a creation run by `me`. Called with `slots` held.
    fn waits_on(&self, me: ThreadId, flight: &InFlight) -> bool {
        let waiting = self.waiting.lock();
        let mut creator = flight.creator;
        for _ in 0..=waiting.len() {
            if creator == me {
                return true;
            }
            match waiting.get(&creator) {
                Some(next) if !next.is_published() => creator = next.creator,
                _ => return false,
            }
        }
        false
    }

    fn complete(
        &self,
        key: &ResourceKey,
        flight: &Arc<InFlight>,
        replacing: bool,
        result: Outcome,
    ) -> Outcome {
        {
            let mut slots = self.slots.lock();
            let ours = matches!(slots.get(key), Some(Slot::Loading(f)) if Arc::ptr_eq(f, flight));
            if ours {
                match &result {
                    Ok(resource) if resource.is_alive() => {
                        slots.insert(key.clone(), Slot::Ready(Arc::clone(resource)));
                    }
                    _ => {
                        slots.remove(key);
                    }
                }
            }
        }
        flight.publish(result.clone());

        match &result {
            Ok(_) if replacing => {
                tracing::debug!(%key, "resource reloaded");
                self.events.invoke(&ResourceEvent::Reloaded { key: key.clone() });
            }
            Ok(_) => {
                tracing::debug!(%key, "resource loaded");
                self.events.invoke(&ResourceEvent::Loaded { key: key.clone() });
            }
            Err(ResourceError::NotFound(_)) => {
                tracing::debug!(%key, "resource not found");
                self.events.invoke(&ResourceEvent::NotFound { key: key.clone() });
            }
            Err(error) => {
                tracing::warn!(%key, %error, "resource creation failed");
                self.events.invoke(&ResourceEvent::Failed {
                    key: key.clone(),
                    error: error.to_string(),
                });
            }
        }
        result
    }

    /// Loads a resource through the creator registered for `kind`.
    pub fn load(
        &self,
        kind: ResourceKind,
        location: Location,
        name: &str,
        args: &[&str],
    ) -> Outcome {
        let key = ResourceKey::new(kind, location, name).with_args(args.iter().copied());
        self.load_key(&key)
    }

    /// Loads a resource by key through the creator registered for its kind.
    pub fn load_key(&self, key: &ResourceKey) -> Outcome {
        let creator = self
            .creators
            .read()
            .get(&key.kind())
            .cloned()
            .ok_or(ResourceError::NoCreator(key.kind()))?;
        self.load_or_create(key, |key| creator.create(self, key))
    }

    /// Like [`load`](Self::load), downcast to the concrete type.
    pub fn load_typed<T: Resource>(
        &self,
        kind: ResourceKind,
        location: Location,
        name: &str,
        args: &[&str],
    ) -> Result<Arc<T>, ResourceError> {
        let resource = self.load(kind, location, name, args)?;
        downcast(resource)
    }

    /// Reloads `key`: returns the live instance, creating a fresh one if the
    /// previous instance died.
    pub fn reload(&self, key: &ResourceKey) -> Outcome {
        self.load_key(key)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Lookup
    // ─────────────────────────────────────────────────────────────────────────

    /// Returns the live resource for `key` without creating or waiting.
    #[must_use]
    pub fn find(&self, key: &ResourceKey) -> Option<Arc<dyn Resource>> {
        match self.slots.lock().get(key) {
            Some(Slot::Ready(resource)) if resource.is_alive() => Some(Arc::clone(resource)),
            _ => None,
        }
    }

    /// Like [`find`](Self::find), downcast to the concrete type.
    #[must_use]
    pub fn find_typed<T: Resource>(&self, key: &ResourceKey) -> Option<Arc<T>> {
        self.find(key).and_then(|resource| downcast(resource).ok())
    }

    /// Returns every live resource backed by `path`.
    #[must_use]
    pub fn find_by_path(&self, path: &Path) -> Vec<Arc<dyn Resource>> {
        self.live_resources()
            .into_iter()
            .filter(|resource| resource.path() == Some(path))
            .collect()
    }

    /// Returns a snapshot of every live resource.
    #[must_use]
    pub fn live_resources(&self) -> Vec<Arc<dyn Resource>> {
        self.slots
            .lock()
            .values()
            .filter_map(|slot| match slot {
                Slot::Ready(resource) if resource.is_alive() => Some(Arc::clone(resource)),
                _ => None,
            })
            .collect()
    }

    /// Returns the kinds with a registered creator, sorted by name.
    #[must_use]
    pub fn kinds(&self) -> Vec<ResourceKind> {
        let mut kinds: Vec<_> = self.creators.read().keys().copied().collect();
        kinds.sort_unstable();
        kinds
    }

    /// Returns the number of occupied slots, including loading and dead roots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    /// Returns `true` if no slot is occupied.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Dependencies
    // ─────────────────────────────────────────────────────────────────────────

    /// Records that `dependent` must die when `resource` dies.
    ///
    /// If `resource` is already dead, `dependent` is killed (it would otherwise
    /// outlive something it relies on) and [`ResourceError::Dead`] is returned.
    pub fn add_dependent(
        &self,
        resource: &Arc<dyn Resource>,
        dependent: &Arc<dyn Resource>,
    ) -> Result<(), ResourceError> {
        match resource.base().add_dependent(dependent) {
            Ok(()) => {
                self.events.invoke(&ResourceEvent::DependentAdded {
                    key: resource.key().clone(),
                    dependent: dependent.key().clone(),
                });
                Ok(())
            }
            Err(ResourceError::Dead(key)) if &key == resource.key() => {
                tracing::debug!(
                    resource = %key,
                    dependent = %dependent.key(),
                    "dependency already dead, killing dependent"
                );
                self.kill(dependent);
                Err(ResourceError::Dead(key))
            }
            Err(error) => Err(error),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Killing
    // ─────────────────────────────────────────────────────────────────────────

    /// Kills `resource` and, transitively, all of its dependents.
    ///
    /// Returns the keys of the roots that died, in kill order; their slots are
    /// kept so a reload can replace them in place.
    pub fn kill(&self, resource: &Arc<dyn Resource>) -> Vec<ResourceKey> {
        let mut visited = HashSet::new();
        let mut roots = Vec::new();
        self.kill_inner(resource, &mut visited, &mut roots);
        roots
    }

    fn kill_inner(
        &self,
        resource: &Arc<dyn Resource>,
        visited: &mut HashSet<usize>,
        roots: &mut Vec<ResourceKey>,
    ) {
        let identity = Arc::as_ptr(resource).cast::<()>().addr();
        if !visited.insert(identity) {
            tracing::debug!(key = %resource.key(), "cascade revisited resource, skipping");
            return;
        }

        let transitioned = resource.base().mark_dead();

        for dependent in resource.base().take_dependents() {
            self.kill_inner(&dependent, visited, roots);
        }

        if resource.remove_on_reload() {
            let mut slots = self.slots.lock();
            let ours = matches!(
                slots.get(resource.key()),
                Some(Slot::Ready(current)) if Arc::ptr_eq(current, resource)
            );
            if ours {
                slots.remove(resource.key());
            }
        } else if transitioned {
            roots.push(resource.key().clone());
        }

        if transitioned {
            tracing::debug!(key = %resource.key(), "resource killed");
            resource.died();
            self.events.invoke(&ResourceEvent::Killed {
                key: resource.key().clone(),
            });
        }
    }

    /// Kills every live resource. Used on shutdown.
    pub fn kill_all(&self) {
        for resource in self.live_resources() {
            let _ = self.kill(&resource);
        }
    }
}

fn downcast<T: Resource>(resource: Arc<dyn Resource>) -> Result<Arc<T>, ResourceError> {
    let key = resource.key().clone();
    resource
        .downcast_arc::<T>()
        .map_err(|_| ResourceError::WrongType(key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::ResourceBase;
    use core::sync::atomic::{AtomicUsize, Ordering};

    const NODE: ResourceKind = ResourceKind::new("node");

    struct Node {
        base: ResourceBase,
        root: bool,
        deaths: Arc<AtomicUsize>,
    }

    impl Resource for Node {
        fn base(&self) -> &ResourceBase {
            &self.base
        }

        fn remove_on_reload(&self) -> bool {
            !self.root
        }

        fn died(&self) {
            self.deaths.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn key(name: &str) -> ResourceKey {
        ResourceKey::new(NODE, Location::Virtual, name)
    }

    fn node(cache: &ResourceCache, name: &str, root: bool) -> Arc<dyn Resource> {
        cache
            .load_or_create(&key(name), |key| {
                Ok(Arc::new(Node {
                    base: ResourceBase::new(key.clone()),
                    root,
                    deaths: Arc::new(AtomicUsize::new(0)),
                }))
            })
            .expect("creation succeeds")
    }

    #[test]
    fn load_or_create_returns_cached_instance() {
        let cache = ResourceCache::new();
        let first = node(&cache, "a", false);
        let second = cache
            .load_or_create(&key("a"), |_| panic!("must not create twice"))
            .expect("cached");
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn failed_creation_publishes_nothing() {
        let cache = ResourceCache::new();
        let err = cache
            .load_or_create(&key("a"), |key| Err(ResourceError::NotFound(key.clone())))
            .expect_err("creation fails");
        assert!(err.is_not_found());
        assert!(cache.find(&key("a")).is_none());
        assert!(cache.is_empty());

        let created = node(&cache, "a", false);
        assert!(created.is_alive());
    }

    #[test]
    fn same_thread_reentry_is_a_cycle() {
        let cache = ResourceCache::new();
        let err = cache
            .load_or_create(&key("a"), |key| {
                let inner = cache.load_or_create(key, |_| panic!("must not recurse"));
                assert!(matches!(inner, Err(ResourceError::CreationCycle(_))));
                inner
            })
            .expect_err("cycle propagates");
        assert!(matches!(err, ResourceError::CreationCycle(_)));
        assert!(cache.is_empty());
    }

    #[test]
    fn panicking_creator_frees_the_key() {
        let cache = ResourceCache::new();
        let outcome = std::panic::catch_unwind(core::panic::AssertUnwindSafe(|| {
            let _ = cache.load_or_create(&key("a"), |_| panic!("creator blew up"));
        }));
        assert!(outcome.is_err());
        assert!(cache.is_empty());
        assert!(node(&cache, "a", false).is_alive());
    }

    #[test]
    fn kill_is_depth_first_and_removes_dependents() {
        let cache = ResourceCache::new();
        let a = node(&cache, "a", false);
        let b = node(&cache, "b", false);
        let c = node(&cache, "c", false);
        cache.add_dependent(&a, &b).expect("link a->b");
        cache.add_dependent(&b, &c).expect("link b->c");

        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let order_clone = Arc::clone(&order);
        cache
            .events()
            .register_observer(
                "order",
                &[crate::events::ResourceEventKind::Killed],
                move |event: &ResourceEvent| {
                    if let ResourceEvent::Killed { key } = event {
                        order_clone.lock().push(key.name().to_owned());
                    }
                },
            )
            .expect("hook");

        let roots = cache.kill(&a);

        assert!(roots.is_empty());
        assert!(!a.is_alive() && !b.is_alive() && !c.is_alive());
        assert_eq!(*order.lock(), vec!["c", "b", "a"]);
        assert!(cache.is_empty());
    }

    #[test]
    fn kill_terminates_on_cycles() {
        let cache = ResourceCache::new();
        let a = node(&cache, "a", false);
        let b = node(&cache, "b", false);
        a.base().add_dependent(&b).expect("a->b");
        b.base().add_dependent(&a).expect("b->a");

        let _ = cache.kill(&a);
        assert!(!a.is_alive());
        assert!(!b.is_alive());
    }

    #[test]
    fn root_slot_survives_kill_and_is_refilled() {
        let cache = ResourceCache::new();
        let root = node(&cache, "root", true);
        let child = node(&cache, "child", false);
        cache.add_dependent(&root, &child).expect("link");

        let roots = cache.kill(&root);
        assert_eq!(roots, vec![key("root")]);
        assert!(cache.find(&key("root")).is_none());
        assert!(cache.find(&key("child")).is_none());
        assert_eq!(cache.len(), 1, "dead root keeps its slot");

        let replaced = node(&cache, "root", true);
        assert!(replaced.is_alive());
        assert!(!Arc::ptr_eq(&root, &replaced));
    }

    #[test]
    fn died_runs_once_per_resource() {
        let cache = ResourceCache::new();
        let deaths = Arc::new(AtomicUsize::new(0));
        let a: Arc<dyn Resource> = Arc::new(Node {
            base: ResourceBase::new(key("a")),
            root: false,
            deaths: Arc::clone(&deaths),
        });
        let _ = cache.kill(&a);
        let _ = cache.kill(&a);
        assert_eq!(deaths.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn add_dependent_to_dead_resource_kills_dependent() {
        let cache = ResourceCache::new();
        let a = node(&cache, "a", false);
        let b = node(&cache, "b", false);
        let _ = cache.kill(&a);

        let err = cache.add_dependent(&a, &b).expect_err("a is dead");
        assert!(matches!(err, ResourceError::Dead(ref k) if k.name() == "a"));
        assert!(!b.is_alive());
        assert!(cache.find(&key("b")).is_none());
    }

    #[test]
    fn load_without_creator_fails() {
        let cache = ResourceCache::new();
        let err = cache
            .load(NODE, Location::Virtual, "x", &[])
            .expect_err("no creator");
        assert!(matches!(err, ResourceError::NoCreator(kind) if kind == NODE));
    }

    #[test]
    fn find_typed_checks_type() {
        struct Other {
            base: ResourceBase,
        }
        impl Resource for Other {
            fn base(&self) -> &ResourceBase {
                &self.base
            }
        }

        let cache = ResourceCache::new();
        let _ = node(&cache, "a", false);
        assert!(cache.find_typed::<Node>(&key("a")).is_some());
        assert!(cache.find_typed::<Other>(&key("a")).is_none());
    }
}
