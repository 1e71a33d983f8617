//! Lifecycle events of script environments.

use jibbr_events::HookEvent;
use jibbr_resource::ResourceKey;

/// Discriminant of a [`ScriptEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScriptEventKind {
    /// See [`ScriptEvent::Initialized`].
    Initialized,
    /// See [`ScriptEvent::InitializationFailed`].
    InitializationFailed,
    /// See [`ScriptEvent::Killed`].
    Killed,
    /// See [`ScriptEvent::ModuleRequired`].
    ModuleRequired,
}

/// Something that happened to a script environment.
#[derive(Debug, Clone)]
pub enum ScriptEvent {
    /// The environment's top-level script ran to completion.
    Initialized {
        /// The environment's key.
        key: ResourceKey,
    },
    /// The top-level script failed; the environment is discarded.
    InitializationFailed {
        /// The environment's key.
        key: ResourceKey,
        /// Rendered error.
        error: String,
    },
    /// The environment died.
    Killed {
        /// The environment's key.
        key: ResourceKey,
    },
    /// A module environment was resolved for a requester.
    ModuleRequired {
        /// The requiring environment.
        requester: ResourceKey,
        /// The module environment handed back.
        module: ResourceKey,
    },
}

impl HookEvent for ScriptEvent {
    type Kind = ScriptEventKind;

    fn kind(&self) -> ScriptEventKind {
        match self {
            ScriptEvent::Initialized { .. } => ScriptEventKind::Initialized,
            ScriptEvent::InitializationFailed { .. } => ScriptEventKind::InitializationFailed,
            ScriptEvent::Killed { .. } => ScriptEventKind::Killed,
            ScriptEvent::ModuleRequired { .. } => ScriptEventKind::ModuleRequired,
        }
    }
}
