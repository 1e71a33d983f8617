//! Errors raised to script code and to callers of the executor.

use jibbr_execution::{ContinuationError, ScheduleError};
use jibbr_resource::ResourceError;
use serde_json::Value;

/// Errors visible at a script call site.
///
/// Everything a suspended call can fail with arrives as a `ScriptError` at the
/// point of suspension, so script code can match on it like a thrown
/// exception.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ScriptError {
    /// A value thrown by script code or by a collaborator resuming with an error.
    #[error("uncaught exception: {0}")]
    Thrown(Value),

    /// The module could not be located.
    #[error("module '{0}' not found")]
    NotFound(String),

    /// The module was located but could not be compiled or parsed.
    #[error("module '{identifier}' is not viable: {reason}")]
    NotViable {
        /// The module's resource name.
        identifier: String,
        /// Why it failed.
        reason: String,
    },

    /// The identifier is malformed or resolves outside the module namespace.
    #[error("invalid module identifier '{0}'")]
    InvalidIdentifier(String),

    /// The environment owning the operation died before it completed.
    #[error("parent environment {0} died")]
    ParentDied(String),

    /// The environment does not define the requested function.
    #[error("no function '{0}' is defined")]
    NoSuchFunction(String),

    /// The environment is dead and cannot run code.
    #[error("environment {0} is dead")]
    EnvironmentDead(String),

    /// Any other resource failure.
    #[error(transparent)]
    Resource(ResourceError),

    /// A continuation failure other than parent death.
    #[error(transparent)]
    Continuation(ContinuationError),

    /// The scheduler dropped the task.
    #[error(transparent)]
    Schedule(#[from] ScheduleError),
}

impl ScriptError {
    /// Shorthand for [`ScriptError::Thrown`].
    #[must_use]
    pub fn thrown(value: impl Into<Value>) -> Self {
        ScriptError::Thrown(value.into())
    }

    /// Returns `true` for failures that mean "nothing to load here".
    ///
    /// A module whose parent died is reported the same way as a missing one.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, ScriptError::NotFound(_) | ScriptError::ParentDied(_))
    }
}

impl From<ResourceError> for ScriptError {
    fn from(error: ResourceError) -> Self {
        match error {
            ResourceError::NotFound(key) => ScriptError::NotFound(key.name().to_owned()),
            ResourceError::NotViable { key, reason } => ScriptError::NotViable {
                identifier: key.name().to_owned(),
                reason,
            },
            other => ScriptError::Resource(other),
        }
    }
}

impl From<ContinuationError> for ScriptError {
    fn from(error: ContinuationError) -> Self {
        match error {
            ContinuationError::ParentDied(owner) => ScriptError::ParentDied(owner.to_string()),
            other => ScriptError::Continuation(other),
        }
    }
}
