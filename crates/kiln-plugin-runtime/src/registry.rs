//! Registry of active plugins

use crate::error::{PluginRuntimeError, Result};
use crate::loader::PluginSource;
use chrono::{DateTime, Utc};
use kiln_plugin_api::{Plugin, PluginInfo};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

/// An initialized plugin and what the host knows about it
#[derive(Clone)]
pub struct PluginEntry {
    /// Plugin instance
    pub plugin: Arc<RwLock<Box<dyn Plugin>>>,

    /// Info snapshot taken at load time
    pub info: PluginInfo,

    /// Where the plugin was loaded from
    pub source: PluginSource,

    /// Module file the instance was constructed from
    pub artifact: PathBuf,

    /// When the plugin became active
    pub loaded_at: DateTime<Utc>,
}

impl std::fmt::Debug for PluginEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginEntry")
            .field("info", &self.info)
            .field("source", &self.source)
            .field("artifact", &self.artifact)
            .field("loaded_at", &self.loaded_at)
            .finish()
    }
}

impl PluginEntry {
    /// Create an entry for a freshly initialized instance
    pub fn new(plugin: Box<dyn Plugin>, source: PluginSource, artifact: PathBuf) -> Self {
        let info = plugin.info();
        Self {
            plugin: Arc::new(RwLock::new(plugin)),
            info,
            source,
            artifact,
            loaded_at: Utc::now(),
        }
    }

    /// Source directory, if the plugin was compiled from one
    pub fn source_dir(&self) -> Option<&Path> {
        match &self.source {
            PluginSource::Directory(dir) => Some(dir),
            PluginSource::Artifact(_) => None,
        }
    }

    /// Serializable summary
    pub fn summary(&self) -> PluginSummary {
        PluginSummary {
            info: self.info.clone(),
            source: self.source.clone(),
            artifact: self.artifact.clone(),
            loaded_at: self.loaded_at,
        }
    }
}

/// Listing row for an active plugin
#[derive(Debug, Clone, Serialize)]
pub struct PluginSummary {
    /// Plugin information
    #[serde(flatten)]
    pub info: PluginInfo,

    /// Where the plugin was loaded from
    pub source: PluginSource,

    /// Module file
    pub artifact: PathBuf,

    /// When the plugin became active
    pub loaded_at: DateTime<Utc>,
}

/// Active plugins keyed by the name they report
///
/// A name appears at most once. Callers serialize access; the registry
/// itself is not synchronized.
#[derive(Debug, Default)]
pub struct PluginRegistry {
    plugins: BTreeMap<String, PluginEntry>,
}

impl PluginRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an entry under its reported name
    pub fn insert(&mut self, entry: PluginEntry) -> Result<()> {
        let name = entry.info.name.clone();
        if self.plugins.contains_key(&name) {
            return Err(PluginRuntimeError::already_installed(&name));
        }

        info!(plugin = %name, version = %entry.info.version, "Plugin registered");
        self.plugins.insert(name, entry);
        Ok(())
    }

    /// Remove an entry
    pub fn remove(&mut self, name: &str) -> Option<PluginEntry> {
        self.plugins.remove(name)
    }

    /// Get plugin by name
    pub fn get(&self, name: &str) -> Option<&PluginEntry> {
        self.plugins.get(name)
    }

    /// Whether a plugin is registered under `name`
    pub fn contains(&self, name: &str) -> bool {
        self.plugins.contains_key(name)
    }

    /// Registered names in order
    pub fn names(&self) -> Vec<String> {
        self.plugins.keys().cloned().collect()
    }

    /// Iterate over entries in name order
    pub fn iter(&self) -> impl Iterator<Item = &PluginEntry> {
        self.plugins.values()
    }

    /// Number of registered plugins
    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    /// Whether nothing is registered
    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// Entry whose source is the directory `dir`
    pub fn find_by_source_dir(&self, dir: &Path) -> Option<&PluginEntry> {
        self.plugins
            .values()
            .find(|entry| entry.source_dir() == Some(dir))
    }

    /// Whether an entry was loaded from `source`
    pub fn contains_source(&self, source: &Path) -> bool {
        self.plugins
            .values()
            .any(|entry| entry.source.path() == source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_plugin_api::testing::MockPlugin;

    fn entry(name: &str, dir: &str) -> PluginEntry {
        PluginEntry::new(
            Box::new(MockPlugin::new(name)),
            PluginSource::Directory(PathBuf::from(dir)),
            PathBuf::from(format!("/build/{name}.so")),
        )
    }

    #[test]
    fn test_plugin_registration() {
        let mut registry = PluginRegistry::new();
        registry.insert(entry("test", "/plugins/test")).unwrap();

        assert!(registry.contains("test"));
        assert_eq!(registry.get("test").unwrap().info.version, "1.0.0");
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_duplicate_name_is_rejected() {
        let mut registry = PluginRegistry::new();
        registry.insert(entry("test", "/plugins/a")).unwrap();

        let err = registry.insert(entry("test", "/plugins/b")).unwrap_err();
        assert!(err.to_string().contains("already installed"));
        assert_eq!(
            registry.get("test").unwrap().source_dir(),
            Some(Path::new("/plugins/a"))
        );
    }

    #[test]
    fn test_lookup_by_source() {
        let mut registry = PluginRegistry::new();
        registry.insert(entry("alpha", "/plugins/alpha-dir")).unwrap();
        registry
            .insert(PluginEntry::new(
                Box::new(MockPlugin::new("beta")),
                PluginSource::Artifact(PathBuf::from("/plugins/beta.so")),
                PathBuf::from("/plugins/beta.so"),
            ))
            .unwrap();

        assert_eq!(
            registry
                .find_by_source_dir(Path::new("/plugins/alpha-dir"))
                .map(|e| e.info.name.as_str()),
            Some("alpha")
        );
        assert!(registry.contains_source(Path::new("/plugins/beta.so")));
        assert!(registry.find_by_source_dir(Path::new("/plugins/beta.so")).is_none());
        assert_eq!(registry.names(), vec!["alpha", "beta"]);
    }

    #[test]
    fn test_summary_serializes_flat() {
        let json = serde_json::to_value(entry("test", "/plugins/test").summary()).unwrap();
        assert_eq!(json["name"], "test");
        assert_eq!(json["source"]["kind"], "directory");
    }
}
