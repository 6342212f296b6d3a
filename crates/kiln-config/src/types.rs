//! Configuration types

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Config {
    /// HTTP server
    #[serde(default)]
    pub server: ServerConfig,

    /// Plugin subsystem
    #[serde(default)]
    pub plugins: PluginsConfig,

    /// Logging
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    /// Listen address
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

/// Plugin subsystem configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PluginsConfig {
    /// Directory holding one subdirectory per installed plugin
    #[serde(default = "default_root_dir")]
    pub root_dir: PathBuf,

    /// Directory for compiled artifacts (default: `<root_dir>/.build`)
    #[serde(default)]
    pub build_dir: Option<PathBuf>,

    /// Cargo executable
    #[serde(default = "default_cargo")]
    pub cargo: String,

    /// Symbol listing tool (default: `nm`)
    #[serde(default)]
    pub nm: Option<String>,

    /// Maximum accepted archive size in bytes
    #[serde(default = "default_max_archive_size")]
    pub max_archive_size: u64,

    /// Age after which cached artifacts are removed
    #[serde(default = "default_cache_max_age", with = "humantime_serde")]
    pub cache_max_age: Duration,

    /// How plugin crates depend on the plugin API crate
    #[serde(default)]
    pub api_dependency: ApiDependency,

    /// Load every plugin under `root_dir` at startup
    #[serde(default = "default_true")]
    pub load_on_startup: bool,

    /// File watching
    #[serde(default)]
    pub watch: WatchConfig,
}

impl PluginsConfig {
    /// Resolved build directory
    pub fn build_dir(&self) -> PathBuf {
        self.build_dir
            .clone()
            .unwrap_or_else(|| self.root_dir.join(".build"))
    }

    /// Resolved symbol listing tool
    pub fn nm_command(&self) -> &str {
        self.nm.as_deref().unwrap_or("nm")
    }
}

impl Default for PluginsConfig {
    fn default() -> Self {
        Self {
            root_dir: default_root_dir(),
            build_dir: None,
            cargo: default_cargo(),
            nm: None,
            max_archive_size: default_max_archive_size(),
            cache_max_age: default_cache_max_age(),
            api_dependency: ApiDependency::default(),
            load_on_startup: true,
            watch: WatchConfig::default(),
        }
    }
}

/// Dependency entry written into synthesized plugin manifests
///
/// A `path` wins over `version` when both are set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApiDependency {
    /// Local path to the plugin API crate
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// Registry version requirement
    #[serde(default)]
    pub version: Option<String>,
}

impl Default for ApiDependency {
    fn default() -> Self {
        Self {
            path: None,
            version: Some(env!("CARGO_PKG_VERSION").to_string()),
        }
    }
}

/// File watching configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WatchConfig {
    /// Enable watching the plugin root
    #[serde(default)]
    pub enabled: bool,

    /// Quiet period before a change triggers a reload
    #[serde(default = "default_debounce", with = "humantime_serde")]
    pub debounce: Duration,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            debounce: default_debounce(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// Filter directive (e.g. `info`, `kiln_plugin_runtime=debug`)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human readable
    #[default]
    Text,
    /// One JSON object per line
    Json,
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

fn default_root_dir() -> PathBuf {
    PathBuf::from("./plugins")
}

fn default_cargo() -> String {
    "cargo".to_string()
}

fn default_max_archive_size() -> u64 {
    100 * 1024 * 1024
}

fn default_cache_max_age() -> Duration {
    Duration::from_secs(7 * 24 * 60 * 60)
}

fn default_debounce() -> Duration {
    Duration::from_millis(500)
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}
