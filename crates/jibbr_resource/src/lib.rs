//! Concurrent resource cache with a live dependency graph.
//!
//! Every cached artifact implements [`Resource`]: it has a stable
//! [`ResourceKey`], an alive flag, and a set of *dependents* that must die
//! with it. The [`ResourceCache`] guarantees a single canonical live instance
//! per key, creating it at most once even under concurrent first requests,
//! and performs the cascading kill when something is invalidated.
//!
//! # Architecture
//!
//! - [`key`]: resource identity
//! - [`resource`]: the [`Resource`] trait and its liveness/dependents state
//! - [`cache`]: load-or-create, lookup, dependency registration, cascading kill
//! - [`file`]: file-backed resources and the location-to-directory mapping
//! - [`watcher`]: native file watching, staleness checks and background reload
//!   of invalidated roots
//! - [`inspect`]: serializable snapshot of the live dependency graph
//! - [`events`]: lifecycle events published through a hook registry
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use jibbr_resource::{Location, Resource, ResourceBase, ResourceCache, ResourceKey, ResourceKind};
//!
//! struct Greeting {
//!     base: ResourceBase,
//!     text: String,
//! }
//!
//! impl Resource for Greeting {
//!     fn base(&self) -> &ResourceBase {
//!         &self.base
//!     }
//! }
//!
//! const GREETING: ResourceKind = ResourceKind::new("greeting");
//!
//! let cache = ResourceCache::new();
//! let key = ResourceKey::new(GREETING, Location::Virtual, "hello");
//! let loaded = cache
//!     .load_or_create(&key, |key| {
//!         Ok(Arc::new(Greeting {
//!             base: ResourceBase::new(key.clone()),
//!             text: "hello".to_owned(),
//!         }))
//!     })
//!     .expect("created");
//!
//! let found = cache.find(&key).expect("cached");
//! assert!(Arc::ptr_eq(&loaded, &found));
//!
//! cache.kill(&found);
//! assert!(cache.find(&key).is_none());
//! ```

pub mod cache;
pub mod error;
pub mod events;
pub mod file;
pub mod inspect;
pub mod key;
pub mod resource;
pub mod watcher;

pub use cache::{ResourceCache, ResourceCreator};
pub use error::ResourceError;
pub use events::{ResourceEvent, ResourceEventKind};
pub use file::{
    FILE, FileResource, FileResourceCreator, FileSnapshot, JSON, JsonResource,
    JsonResourceCreator, ResourceSettings,
};
pub use inspect::{ResourceGraph, ResourceLink, ResourceNode};
pub use key::{Location, ResourceKey, ResourceKind};
pub use resource::{Resource, ResourceBase};
pub use watcher::{ResourceWatcher, WatchHandle};
