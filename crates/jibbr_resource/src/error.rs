//! Errors raised by the resource layer.

use std::io;
use std::sync::Arc;

use crate::key::{ResourceKey, ResourceKind};

/// Errors that can occur while loading or linking resources.
///
/// The error is `Clone` because every caller waiting on the same in-flight
/// creation receives the same failure.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ResourceError {
    /// The resource could not be located.
    #[error("resource {0} not found")]
    NotFound(ResourceKey),

    /// The resource was located but could not be constructed.
    #[error("resource {key} is not viable: {reason}")]
    NotViable {
        /// The failed resource.
        key: ResourceKey,
        /// Why construction failed.
        reason: String,
    },

    /// Reading the resource's backing data failed.
    #[error("i/o error loading {key}: {source}")]
    Io {
        /// The failed resource.
        key: ResourceKey,
        /// The underlying error.
        #[source]
        source: Arc<io::Error>,
    },

    /// The resource is dead and can no longer take part in the graph.
    #[error("resource {0} is dead")]
    Dead(ResourceKey),

    /// A resource was asked to depend on itself.
    #[error("resource {0} cannot depend on itself")]
    SelfDependency(ResourceKey),

    /// Waiting for the key would wait on the caller's own creation.
    #[error("resource {0} was requested by a creation it is waiting on")]
    CreationCycle(ResourceKey),

    /// The creator panicked before producing a result.
    #[error("creation of {0} was aborted")]
    CreationAborted(ResourceKey),

    /// No creator is registered for the kind.
    #[error("no creator registered for resource kind '{0}'")]
    NoCreator(ResourceKind),

    /// The cached resource is not of the requested type.
    #[error("resource {0} has an unexpected type")]
    WrongType(ResourceKey),
}

impl ResourceError {
    /// Wraps an I/O error, mapping `NotFound` to [`ResourceError::NotFound`].
    #[must_use]
    pub fn from_io(key: &ResourceKey, error: io::Error) -> Self {
        if error.kind() == io::ErrorKind::NotFound {
            ResourceError::NotFound(key.clone())
        } else {
            ResourceError::Io {
                key: key.clone(),
                source: Arc::new(error),
            }
        }
    }

    /// Returns `true` for [`ResourceError::NotFound`].
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, ResourceError::NotFound(_))
    }
}
