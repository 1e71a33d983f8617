//! Hook registry keyed by event kind.
//!
//! Components publish typed events (resource loaded, environment killed, ...)
//! and interested parties register closures against the kinds they care
//! about. The registry is a plain map from kind to handlers; there is no
//! code generation and no reflection involved.
//!
//! # Example
//!
//! ```
//! use jibbr_events::{HookEvent, HookRegistry};
//!
//! #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
//! enum DoorKind {
//!     Opened,
//!     Closed,
//! }
//!
//! enum DoorEvent {
//!     Opened { by: &'static str },
//!     Closed,
//! }
//!
//! impl HookEvent for DoorEvent {
//!     type Kind = DoorKind;
//!
//!     fn kind(&self) -> DoorKind {
//!         match self {
//!             DoorEvent::Opened { .. } => DoorKind::Opened,
//!             DoorEvent::Closed => DoorKind::Closed,
//!         }
//!     }
//! }
//!
//! let hooks = HookRegistry::<DoorEvent>::new();
//! hooks
//!     .register_observer("audit", &[DoorKind::Opened], |event: &DoorEvent| {
//!         if let DoorEvent::Opened { by } = event {
//!             assert_eq!(*by, "alice");
//!         }
//!     })
//!     .expect("unique name");
//!
//! hooks.invoke(&DoorEvent::Opened { by: "alice" });
//! assert_eq!(hooks.hook_count(DoorKind::Closed), 0);
//! ```

mod registry;

pub use registry::{BoxedHook, HookEvent, HookRegistrationError, HookRegistry};
