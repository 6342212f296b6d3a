//! Core plugin trait and types

use crate::admin::{AdminMenuItem, PluginSetting};
use crate::error::{PluginError, Result};
use crate::routes::RouterGroup;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Core plugin trait that every loadable module must implement
///
/// The host calls [`Plugin::initialize`] exactly once, before any route is
/// served, and [`Plugin::shutdown`] once when the plugin is unloaded.
pub trait Plugin: Send + Sync + fmt::Debug {
    /// Basic plugin information
    ///
    /// The returned name is the key the host registers the plugin under.
    fn info(&self) -> PluginInfo;

    /// Set up the plugin with the host's dependencies
    fn initialize(&mut self, deps: &PluginDependencies) -> Result<()>;

    /// Register HTTP endpoints under the namespace the host assigned
    fn register_routes(&self, router: &mut RouterGroup);

    /// Menu items contributed to the admin dashboard
    fn admin_menu_items(&self) -> Vec<AdminMenuItem> {
        vec![]
    }

    /// Configurable settings exposed by the plugin
    fn settings(&self) -> Vec<PluginSetting> {
        vec![]
    }

    /// Release resources before the plugin is dropped
    fn shutdown(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Plugin information reported by the instance itself
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginInfo {
    /// Plugin name
    pub name: String,

    /// Plugin version
    pub version: String,

    /// Plugin description
    pub description: String,

    /// Plugin author
    pub author: String,

    /// Plugin homepage
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub website: Option<String>,
}

impl PluginInfo {
    /// Create plugin info with a name and version
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            description: String::new(),
            author: "Unknown".to_string(),
            website: None,
        }
    }

    /// Set the description
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Set the author
    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.author = author.into();
        self
    }

    /// Set the website
    pub fn with_website(mut self, website: impl Into<String>) -> Self {
        self.website = Some(website.into());
        self
    }
}

/// Opaque host handle shared with every plugin
pub type HostHandle = Arc<dyn Any + Send + Sync>;

/// Host dependencies handed to [`Plugin::initialize`]
///
/// Every plugin receives the same handles; plugins are trusted not to misuse
/// them.
#[derive(Clone, Default)]
pub struct PluginDependencies {
    /// Database handle, if the host has one
    pub database: Option<HostHandle>,

    /// Snapshot of the host configuration
    pub config: serde_json::Value,
}

impl PluginDependencies {
    /// Create dependencies from a configuration snapshot
    pub fn new(config: serde_json::Value) -> Self {
        Self {
            database: None,
            config,
        }
    }

    /// Attach a database handle
    pub fn with_database(mut self, database: HostHandle) -> Self {
        self.database = Some(database);
        self
    }

    /// Downcast the database handle to a concrete type
    ///
    /// Only succeeds when the plugin and host agree on the type, which in
    /// practice means both were built against the same crate graph.
    pub fn database<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.database.clone()?.downcast::<T>().ok()
    }

    /// Like [`database`](Self::database), failing when the handle is absent
    /// or of another type
    pub fn require_database<T: Any + Send + Sync>(&self) -> Result<Arc<T>> {
        self.database::<T>()
            .ok_or_else(|| PluginError::dependency(std::any::type_name::<T>()))
    }

    /// Look up a configuration value by JSON pointer (e.g. `/server/listen`)
    pub fn config_value(&self, pointer: &str) -> Option<&serde_json::Value> {
        self.config.pointer(pointer)
    }
}

impl fmt::Debug for PluginDependencies {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginDependencies")
            .field("database", &self.database.as_ref().map(|_| "<opaque>"))
            .field("config", &self.config)
            .finish()
    }
}
