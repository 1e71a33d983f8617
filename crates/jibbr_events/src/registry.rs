//! Registration and dispatch of event hooks.
//!
//! - **Observers** ([`register_observer`](HookRegistry::register_observer)) react
//!   to one or more event kinds. A single closure registered on several kinds is
//!   shared between them.
//! - **Boxed hooks** ([`register_boxed`](HookRegistry::register_boxed)) are the
//!   lower-level entry point used by observers.
//!
//! Hooks run in registration order, on the thread that publishes the event.
//! The registry lock is released before any hook runs, so a hook may register
//! further hooks or publish nested events.

use core::fmt;
use core::hash::Hash;
use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::RwLock;

// ─────────────────────────────────────────────────────────────────────────────
// HookEvent
// ─────────────────────────────────────────────────────────────────────────────

/// An event that can be dispatched through a [`HookRegistry`].
pub trait HookEvent: Send + Sync + 'static {
    /// Discriminant used to route the event to its hooks.
    type Kind: Copy + Eq + Hash + fmt::Debug + Send + Sync + 'static;

    /// Returns the kind of this event.
    fn kind(&self) -> Self::Kind;
}

// ─────────────────────────────────────────────────────────────────────────────
// BoxedHook
// ─────────────────────────────────────────────────────────────────────────────

/// Type-erased hook receiving `&E`.
pub struct BoxedHook<E> {
    handler: Arc<dyn Fn(&E) + Send + Sync>,
}

impl<E> BoxedHook<E> {
    /// Wraps a handler closure.
    #[must_use]
    pub fn new(handler: impl Fn(&E) + Send + Sync + 'static) -> Self {
        Self {
            handler: Arc::new(handler),
        }
    }

    /// Invokes the hook with the given event.
    pub fn invoke(&self, event: &E) {
        (self.handler)(event);
    }
}

impl<E> Clone for BoxedHook<E> {
    fn clone(&self) -> Self {
        Self {
            handler: Arc::clone(&self.handler),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// HookRegistrationError
// ─────────────────────────────────────────────────────────────────────────────

/// Errors that can occur during hook registration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HookRegistrationError {
    /// A hook with this name already exists for the event kind.
    #[error("hook '{name}' already registered for event kind '{kind}'")]
    DuplicateName {
        /// Debug rendering of the event kind.
        kind: String,
        /// The duplicate hook name.
        name: String,
    },
}

// ─────────────────────────────────────────────────────────────────────────────
// HookRegistry
// ─────────────────────────────────────────────────────────────────────────────

struct HookEntry<E> {
    name: String,
    hook: BoxedHook<E>,
}

/// Registry mapping event kinds to the hooks observing them.
///
/// # Thread Safety
///
/// Uses a [`RwLock`] so that registration and invocation can happen from any
/// thread, concurrently.
pub struct HookRegistry<E: HookEvent> {
    hooks: RwLock<HashMap<E::Kind, Vec<HookEntry<E>>>>,
}

impl<E: HookEvent> Default for HookRegistry<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: HookEvent> fmt::Debug for HookRegistry<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hooks = self.hooks.read();
        f.debug_map()
            .entries(
                hooks
                    .iter()
                    .map(|(kind, entries)| (kind, entries.iter().map(|e| &e.name).collect::<Vec<_>>())),
            )
            .finish()
    }
}

impl<E: HookEvent> HookRegistry<E> {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            hooks: RwLock::new(HashMap::new()),
        }
    }

    /// Registers an observer for one or more event kinds.
    ///
    /// When registered on several kinds, the hook is stored as
    /// `name@Kind` under each of them.
    pub fn register_observer<F>(
        &self,
        name: impl Into<String>,
        kinds: &[E::Kind],
        hook: F,
    ) -> Result<&Self, HookRegistrationError>
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let name = name.into();
        let hook = BoxedHook::new(hook);

        for kind in kinds {
            let hook_name = if kinds.len() > 1 {
                format!("{}@{:?}", name, kind)
            } else {
                name.clone()
            };
            self.register_boxed(*kind, hook_name, hook.clone())?;
        }
        Ok(self)
    }

    /// Registers a pre-built [`BoxedHook`] for the given kind.
    pub fn register_boxed(
        &self,
        kind: E::Kind,
        name: impl Into<String>,
        hook: BoxedHook<E>,
    ) -> Result<(), HookRegistrationError> {
        let name = name.into();

        let mut hooks = self.hooks.write();
        let entries = hooks.entry(kind).or_default();

        if entries.iter().any(|entry| entry.name == name) {
            return Err(HookRegistrationError::DuplicateName {
                kind: format!("{kind:?}"),
                name,
            });
        }

        entries.push(HookEntry { name, hook });
        Ok(())
    }

    /// Removes the named hook from the given kind. Returns whether it existed.
    pub fn unregister(&self, kind: E::Kind, name: &str) -> bool {
        let mut hooks = self.hooks.write();
        let Some(entries) = hooks.get_mut(&kind) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|entry| entry.name != name);
        before != entries.len()
    }

    /// Invokes every hook registered for the event's kind, in registration order.
    pub fn invoke(&self, event: &E) {
        let hooks: Vec<BoxedHook<E>> = {
            let hooks = self.hooks.read();
            match hooks.get(&event.kind()) {
                Some(entries) => entries.iter().map(|entry| entry.hook.clone()).collect(),
                None => return,
            }
        };

        for hook in &hooks {
            hook.invoke(event);
        }
    }

    /// Returns the number of hooks registered for the given kind.
    #[must_use]
    pub fn hook_count(&self, kind: E::Kind) -> usize {
        let hooks = self.hooks.read();
        hooks.get(&kind).map_or(0, Vec::len)
    }

    /// Checks if a hook with the given name exists for the kind.
    #[must_use]
    pub fn contains_hook(&self, kind: E::Kind, name: &str) -> bool {
        let hooks = self.hooks.read();
        hooks
            .get(&kind)
            .is_some_and(|entries| entries.iter().any(|entry| entry.name == name))
    }
}
