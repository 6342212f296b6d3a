//! Plugin runtime error types

use kiln_plugin_api::PluginError;
use std::fmt;
use std::path::Path;

/// Plugin runtime error type
#[derive(Debug, thiserror::Error)]
pub enum PluginRuntimeError {
    /// Plugin name does not satisfy the naming rule
    #[error("Invalid plugin name '{name}': {reason}")]
    InvalidName {
        /// Rejected name
        name: String,
        /// Why it was rejected
        reason: String,
    },

    /// Archive failed pre-flight validation
    #[error("Invalid archive {path}: {}", .errors.join("; "))]
    InvalidArchive {
        /// Archive path
        path: String,
        /// Validation errors
        errors: Vec<String>,
    },

    /// `plugin.json` could not be read or parsed
    #[error("Invalid manifest {path}: {message}")]
    InvalidManifest {
        /// Manifest path
        path: String,
        /// Parser message
        message: String,
    },

    /// Archive entry would be written outside the plugin directory
    #[error("Archive entry escapes the plugin directory: {0}")]
    PathTraversal(String),

    /// Extracted tree is missing required files
    #[error("Invalid plugin structure: {0}")]
    InvalidStructure(String),

    /// The toolchain failed or produced no artifact
    ///
    /// The toolchain output is part of the message so it survives bulk
    /// reports and CLI output.
    #[error("Compilation of {plugin} failed: {message}{}", output_block(.output))]
    Compilation {
        /// Plugin being compiled
        plugin: String,
        /// Summary
        message: String,
        /// Verbatim toolchain output
        output: String,
    },

    /// Artifact does not export the entry symbol
    #[error("Artifact {path} is not a plugin: {message}")]
    ArtifactValidation {
        /// Artifact path
        path: String,
        /// Reason
        message: String,
    },

    /// Native module could not be opened or bound
    #[error("Failed to load {path}: {message}")]
    Load {
        /// Module path
        path: String,
        /// Reason
        message: String,
    },

    /// Host platform cannot load native modules
    #[error("Plugins are not supported on {os}/{arch}")]
    PlatformUnsupported {
        /// Host operating system
        os: String,
        /// Host architecture
        arch: String,
    },

    /// Plugin is already installed
    #[error("Plugin {0} is already installed")]
    AlreadyInstalled(String),

    /// Plugin not found
    #[error("Plugin not found: {0}")]
    NotFound(String),

    /// `initialize` returned an error
    #[error("Plugin {plugin} failed to initialize: {source}")]
    Initialization {
        /// Plugin name
        plugin: String,
        /// Error reported by the plugin
        #[source]
        source: PluginError,
    },

    /// Routes could not be mounted
    #[error("Route registration for {plugin} failed: {message}")]
    RouteRegistration {
        /// Plugin name
        plugin: String,
        /// Reason
        message: String,
    },

    /// Some items of a bulk load failed
    #[error("{} plugin(s) failed to load: {}", .failures.len(), format_failures(.failures))]
    PartialLoad {
        /// Number of plugins that did load
        loaded: usize,
        /// `(item, error)` for every failure
        failures: Vec<(String, String)>,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Archive error
    #[error("Archive error: {0}")]
    Zip(#[from] zip::result::ZipError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] kiln_config::ConfigError),

    /// Other error
    #[error("{0}")]
    Other(String),
}

/// Result type for plugin runtime operations
pub type Result<T> = std::result::Result<T, PluginRuntimeError>;

fn format_failures(failures: &[(String, String)]) -> String {
    failures
        .iter()
        .map(|(item, error)| format!("{item}: {error}"))
        .collect::<Vec<_>>()
        .join("; ")
}

impl PluginRuntimeError {
    /// Create a new invalid name error
    pub fn invalid_name(name: impl fmt::Display, reason: impl fmt::Display) -> Self {
        Self::InvalidName {
            name: name.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Create a new invalid manifest error
    pub fn invalid_manifest(path: &Path, message: impl fmt::Display) -> Self {
        Self::InvalidManifest {
            path: path.display().to_string(),
            message: message.to_string(),
        }
    }

    /// Create a new invalid structure error
    pub fn invalid_structure(msg: impl fmt::Display) -> Self {
        Self::InvalidStructure(msg.to_string())
    }

    /// Create a new compilation error
    pub fn compilation(
        plugin: impl fmt::Display,
        message: impl fmt::Display,
        output: impl Into<String>,
    ) -> Self {
        Self::Compilation {
            plugin: plugin.to_string(),
            message: message.to_string(),
            output: output.into(),
        }
    }

    /// Create a new artifact validation error
    pub fn artifact_validation(path: &Path, message: impl fmt::Display) -> Self {
        Self::ArtifactValidation {
            path: path.display().to_string(),
            message: message.to_string(),
        }
    }

    /// Create a new load error
    pub fn load(path: &Path, message: impl fmt::Display) -> Self {
        Self::Load {
            path: path.display().to_string(),
            message: message.to_string(),
        }
    }

    /// Create a new already installed error
    pub fn already_installed(name: impl fmt::Display) -> Self {
        Self::AlreadyInstalled(name.to_string())
    }

    /// Create a new plugin not found error
    pub fn not_found(name: impl fmt::Display) -> Self {
        Self::NotFound(name.to_string())
    }

    /// Create a new route registration error
    pub fn route_registration(plugin: impl fmt::Display, message: impl fmt::Display) -> Self {
        Self::RouteRegistration {
            plugin: plugin.to_string(),
            message: message.to_string(),
        }
    }

    /// Create a new other error
    pub fn other(msg: impl fmt::Display) -> Self {
        Self::Other(msg.to_string())
    }

    /// Toolchain output attached to a compilation error
    pub fn compiler_output(&self) -> Option<&str> {
        match self {
            Self::Compilation { output, .. } => Some(output),
            _ => None,
        }
    }
}

fn output_block(output: &str) -> String {
    let output = output.trim_end();
    if output.is_empty() {
        String::new()
    } else {
        format!("\n{output}")
    }
}
