//! Errors a plugin reports back to the host

use std::fmt;

/// Error returned by plugin lifecycle hooks
///
/// The host wraps it with the plugin name before logging or returning it,
/// so messages here need not repeat which plugin failed.
#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    /// `initialize` could not complete
    #[error("initialization failed: {0}")]
    Init(String),

    /// Host configuration the plugin reads was missing or malformed
    #[error("bad configuration: {0}")]
    Config(String),

    /// A handler or helper failed while serving
    #[error("{0}")]
    Handler(String),

    /// A host dependency the plugin needs was not provided
    #[error("host did not provide {0}")]
    MissingDependency(String),

    /// Hook called in the wrong lifecycle state
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// `shutdown` did not release everything
    #[error("shutdown failed: {0}")]
    Shutdown(String),

    /// I/O error
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for plugin hooks
pub type Result<T> = std::result::Result<T, PluginError>;

impl PluginError {
    /// Initialization failure
    pub fn init(msg: impl fmt::Display) -> Self {
        Self::Init(msg.to_string())
    }

    /// Configuration failure
    pub fn config(msg: impl fmt::Display) -> Self {
        Self::Config(msg.to_string())
    }

    /// Failure while serving a request
    pub fn runtime(msg: impl fmt::Display) -> Self {
        Self::Handler(msg.to_string())
    }

    /// Missing host dependency
    pub fn dependency(name: impl fmt::Display) -> Self {
        Self::MissingDependency(name.to_string())
    }

    /// Hook called out of order
    pub fn invalid_state(msg: impl fmt::Display) -> Self {
        Self::InvalidState(msg.to_string())
    }

    /// Shutdown failure
    pub fn shutdown(msg: impl fmt::Display) -> Self {
        Self::Shutdown(msg.to_string())
    }
}
