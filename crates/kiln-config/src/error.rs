//! Configuration errors

/// Error raised while loading or validating configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file could not be read
    #[error("Failed to read config file {path}: {source}")]
    Read {
        /// Path that failed
        path: String,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// The format could not be determined or is not supported
    #[error("Unsupported config format: {0}")]
    Format(String),

    /// The content could not be parsed
    #[error("Failed to parse {format}: {message}")]
    Parse {
        /// Format being parsed
        format: &'static str,
        /// Parser message
        message: String,
    },

    /// A `${VAR}` reference has no value and no default
    #[error("Environment variable '{0}' not set and no default provided")]
    MissingEnv(String),

    /// An environment override holds an unusable value
    #[error("Invalid value for {var}: {message}")]
    InvalidOverride {
        /// Variable name
        var: &'static str,
        /// Reason
        message: String,
    },

    /// The configuration parsed but is not usable
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Result type for configuration operations
pub type Result<T> = std::result::Result<T, ConfigError>;

impl ConfigError {
    /// Create a new validation error
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::Invalid(msg.into())
    }
}
