//! The [`Resource`] trait and the liveness state every resource embeds.
//!
//! Implementors store a [`ResourceBase`] and return it from
//! [`Resource::base`]; the cache drives everything else through it.
//!
//! # Liveness
//!
//! A resource starts alive and dies exactly once. Dead resources are never
//! returned by a lookup and never gain dependents. [`ResourceBase::add_dependent`]
//! checks the alive flag while holding the dependents lock, and a kill takes
//! that same lock to drain the dependents after clearing the flag, so a
//! dependent is either rejected or drained by the kill, never lost.

use core::fmt;
use core::sync::atomic::{AtomicBool, Ordering};
use std::path::Path;
use std::sync::{Arc, Weak};
use std::time::Instant;

use downcast_rs::{DowncastSync, impl_downcast};
use hashbrown::HashMap;
use parking_lot::Mutex;

use crate::error::ResourceError;
use crate::key::ResourceKey;

// ─────────────────────────────────────────────────────────────────────────────
// Resource
// ─────────────────────────────────────────────────────────────────────────────

/// A cached artifact with identity, liveness and dependents.
///
/// Use [`downcast_arc`](trait.Resource.html#method.downcast_arc) (or
/// [`ResourceCache::find_typed`](crate::ResourceCache::find_typed)) to recover
/// the concrete type.
pub trait Resource: DowncastSync {
    /// Returns the embedded liveness and dependents state.
    fn base(&self) -> &ResourceBase;

    /// Returns the resource's key.
    fn key(&self) -> &ResourceKey {
        self.base().key()
    }

    /// Returns `true` until the resource has been killed.
    fn is_alive(&self) -> bool {
        self.base().is_alive()
    }

    /// Reports whether the backing data changed since creation.
    fn needs_replacing(&self) -> bool {
        false
    }

    /// Whether a kill removes the resource from the cache map.
    ///
    /// Root resources return `false`: their slot survives the kill and the
    /// next load refills it in place.
    fn remove_on_reload(&self) -> bool {
        true
    }

    /// The file backing this resource, if any.
    fn path(&self) -> Option<&Path> {
        None
    }

    /// Called once, after the resource and all of its dependents are dead.
    fn died(&self) {}
}

impl_downcast!(sync Resource);

impl fmt::Debug for dyn Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resource")
            .field("key", self.key())
            .field("alive", &self.is_alive())
            .finish_non_exhaustive()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// ResourceBase
// ─────────────────────────────────────────────────────────────────────────────

/// Identity, alive flag and dependents shared by all resources.
pub struct ResourceBase {
    key: ResourceKey,
    created_at: Instant,
    alive: AtomicBool,
    dependents: Mutex<HashMap<ResourceKey, Weak<dyn Resource>>>,
}

impl fmt::Debug for ResourceBase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceBase")
            .field("key", &self.key)
            .field("alive", &self.is_alive())
            .field("dependents", &self.dependents.lock().len())
            .finish()
    }
}

impl ResourceBase {
    /// Creates a live base for the given key.
    #[must_use]
    pub fn new(key: ResourceKey) -> Self {
        Self {
            key,
            created_at: Instant::now(),
            alive: AtomicBool::new(true),
            dependents: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the resource's key.
    #[must_use]
    pub fn key(&self) -> &ResourceKey {
        &self.key
    }

    /// Returns when the resource was created.
    #[must_use]
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Returns `true` until the resource has been killed.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Records that `dependent` must die when this resource dies.
    ///
    /// Fails with [`ResourceError::Dead`] if either side is already dead and
    /// with [`ResourceError::SelfDependency`] if `dependent` has this key.
    /// Adding the same dependent twice is a no-op.
    pub fn add_dependent(&self, dependent: &Arc<dyn Resource>) -> Result<(), ResourceError> {
        if dependent.key() == &self.key {
            return Err(ResourceError::SelfDependency(self.key.clone()));
        }

        let mut dependents = self.dependents.lock();
        if !self.is_alive() {
            return Err(ResourceError::Dead(self.key.clone()));
        }
        if !dependent.is_alive() {
            return Err(ResourceError::Dead(dependent.key().clone()));
        }
        dependents.insert(dependent.key().clone(), Arc::downgrade(dependent));
        Ok(())
    }

    /// Returns the live dependents currently recorded.
    #[must_use]
    pub fn dependents(&self) -> Vec<Arc<dyn Resource>> {
        self.dependents
            .lock()
            .values()
            .filter_map(Weak::upgrade)
            .filter(|dependent| dependent.is_alive())
            .collect()
    }

    /// Clears the alive flag. Returns `true` if this call did the transition.
    pub(crate) fn mark_dead(&self) -> bool {
        self.alive.swap(false, Ordering::AcqRel)
    }

    /// Removes and returns every recorded dependent still in memory.
    pub(crate) fn take_dependents(&self) -> Vec<Arc<dyn Resource>> {
        self.dependents
            .lock()
            .drain()
            .filter_map(|(_, dependent)| dependent.upgrade())
            .collect()
    }
}
