//! # jibbr Internal Library
//!
//! Re-exports the core jibbr crates for convenience.

/// Lifecycle hooks.
pub use jibbr_events;

/// Layer 1: the resource cache and dependency graph.
pub use jibbr_resource;

/// Layer 1: affinity scheduling and continuations.
pub use jibbr_execution;

/// Layer 2: script environments and module resolution.
pub use jibbr_script;

/// Layer 3: configuration and runtime assembly.
pub use jibbr_core;

/// Re-export all common types for easy access.
pub mod prelude {
    pub use jibbr_core::{Runtime, RuntimeBuilder, RuntimeConfig, TracingConfig, TracingFormat};
    pub use jibbr_execution::{AffinityKey, AffinityScheduler, PendingKey, ResumeError};
    pub use jibbr_resource::{
        Location, Resource, ResourceCache, ResourceCreator, ResourceError, ResourceKey,
        ResourceKind, ResourceSettings, ResourceWatcher,
    };
    pub use jibbr_script::{
        Execution, ModuleResolver, ScriptCompiler, ScriptContext, ScriptEnvironment, ScriptError,
        ScriptExecutor, ScriptRegistry, native_fn,
    };
}
