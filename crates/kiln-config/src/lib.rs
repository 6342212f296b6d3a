//! # Kiln Configuration
//!
//! Host configuration: the listen address, where plugins live and how they
//! are built, and logging. Files may be YAML, TOML or JSON; values can
//! reference `${VAR}` / `${VAR:-default}` and a few `KILN_*` variables
//! override the file.

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]

pub mod error;
pub mod loader;
pub mod types;
pub mod validator;

pub use error::{ConfigError, Result};
pub use loader::{apply_env_overrides, load_config, load_from_file, load_from_str};
pub use types::{
    ApiDependency, Config, LogFormat, LoggingConfig, PluginsConfig, ServerConfig, WatchConfig,
};
pub use validator::validate_config;

use std::path::Path;

/// Configuration file format, chosen by file extension
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    /// `.yaml` / `.yml`
    Yaml,
    /// `.toml`
    Toml,
    /// `.json`
    Json,
}

impl ConfigFormat {
    /// Format for a path's extension (case-insensitive)
    pub fn from_path(path: &Path) -> Result<Self> {
        let ext = path
            .extension()
            .and_then(|s| s.to_str())
            .map(str::to_ascii_lowercase)
            .ok_or_else(|| ConfigError::Format(path.display().to_string()))?;

        match ext.as_str() {
            "yaml" | "yml" => Ok(Self::Yaml),
            "toml" => Ok(Self::Toml),
            "json" => Ok(Self::Json),
            _ => Err(ConfigError::Format(ext)),
        }
    }

    /// Name used in parse errors
    pub fn name(self) -> &'static str {
        match self {
            Self::Yaml => "YAML",
            Self::Toml => "TOML",
            Self::Json => "JSON",
        }
    }
}
