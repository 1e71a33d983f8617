//! An embedded application runtime built around a live resource graph.
//!
//! Scripts, modules and file-backed assets are cached resources whose
//! dependents die with them; scripts run on per-environment affinity queues
//! and may suspend on a `require` until the module they need has loaded.

pub use jibbr_internal::*;

/// Re-export all common types for easy access.
pub mod prelude {
    pub use jibbr_internal::prelude::*;
}
