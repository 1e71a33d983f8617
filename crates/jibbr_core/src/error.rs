//! Runtime assembly errors.

use jibbr_script::ScriptError;

/// Errors raised while configuring or starting a [`Runtime`](crate::Runtime).
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// The configuration document could not be parsed.
    #[error("invalid configuration: {0}")]
    Config(#[from] serde_json::Error),

    /// The configuration parsed but holds unusable values.
    #[error("invalid configuration: {0}")]
    Invalid(String),

    /// Reading configuration or starting worker threads failed.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// A script operation failed.
    #[error(transparent)]
    Script(#[from] ScriptError),
}
