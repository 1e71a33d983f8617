//! Lifecycle events published by the cache.
//!
//! Register observers through [`ResourceCache::events`](crate::ResourceCache::events):
//!
//! ```
//! use jibbr_resource::{ResourceCache, ResourceEvent, ResourceEventKind};
//!
//! let cache = ResourceCache::new();
//! cache
//!     .events()
//!     .register_observer("log-kills", &[ResourceEventKind::Killed], |event: &ResourceEvent| {
//!         if let ResourceEvent::Killed { key } = event {
//!             tracing::info!(%key, "resource killed");
//!         }
//!     })
//!     .expect("unique hook name");
//! ```

use jibbr_events::HookEvent;

use crate::key::ResourceKey;

/// Discriminant of a [`ResourceEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceEventKind {
    /// See [`ResourceEvent::Loaded`].
    Loaded,
    /// See [`ResourceEvent::Reloaded`].
    Reloaded,
    /// See [`ResourceEvent::NotFound`].
    NotFound,
    /// See [`ResourceEvent::Failed`].
    Failed,
    /// See [`ResourceEvent::Killed`].
    Killed,
    /// See [`ResourceEvent::DependentAdded`].
    DependentAdded,
}

/// Something that happened to a cached resource.
#[derive(Debug, Clone)]
pub enum ResourceEvent {
    /// A resource was created for a key with no previous instance.
    Loaded {
        /// The new resource's key.
        key: ResourceKey,
    },
    /// A resource was created in place of a dead instance.
    Reloaded {
        /// The replaced resource's key.
        key: ResourceKey,
    },
    /// A creator reported that the resource does not exist.
    NotFound {
        /// The requested key.
        key: ResourceKey,
    },
    /// A creator failed for a reason other than absence.
    Failed {
        /// The requested key.
        key: ResourceKey,
        /// Rendered error.
        error: String,
    },
    /// A resource died.
    Killed {
        /// The dead resource's key.
        key: ResourceKey,
    },
    /// A dependency edge was recorded.
    DependentAdded {
        /// The resource depended upon.
        key: ResourceKey,
        /// The resource that now dies with it.
        dependent: ResourceKey,
    },
}

impl HookEvent for ResourceEvent {
    type Kind = ResourceEventKind;

    fn kind(&self) -> ResourceEventKind {
        match self {
            ResourceEvent::Loaded { .. } => ResourceEventKind::Loaded,
            ResourceEvent::Reloaded { .. } => ResourceEventKind::Reloaded,
            ResourceEvent::NotFound { .. } => ResourceEventKind::NotFound,
            ResourceEvent::Failed { .. } => ResourceEventKind::Failed,
            ResourceEvent::Killed { .. } => ResourceEventKind::Killed,
            ResourceEvent::DependentAdded { .. } => ResourceEventKind::DependentAdded,
        }
    }
}
