//! Plugin manifest (`plugin.json`) and naming rules

use crate::error::{PluginRuntimeError, Result};
use crate::extractor::is_safe_entry;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Manifest file name inside a plugin directory
pub const MANIFEST_FILE: &str = "plugin.json";

/// Entry file used when the manifest does not name one
pub const DEFAULT_ENTRY: &str = "src/lib.rs";

/// Longest accepted plugin name
pub const MAX_NAME_LEN: usize = 50;

static NAME_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z][a-z0-9-]*$").expect("valid plugin name pattern"));

/// Check a plugin name against the naming rule
///
/// Names start with a lowercase letter, continue with lowercase letters,
/// digits or hyphens, and are at most [`MAX_NAME_LEN`] characters.
pub fn validate_plugin_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(PluginRuntimeError::invalid_name(name, "name is empty"));
    }

    if name.len() > MAX_NAME_LEN {
        return Err(PluginRuntimeError::invalid_name(
            name,
            format!("longer than {MAX_NAME_LEN} characters"),
        ));
    }

    if !NAME_PATTERN.is_match(name) {
        return Err(PluginRuntimeError::invalid_name(
            name,
            "must start with a lowercase letter and contain only lowercase letters, digits and hyphens",
        ));
    }

    Ok(())
}

/// Package description shipped as `plugin.json`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginManifest {
    /// Plugin name
    pub name: String,

    /// Plugin version
    pub version: String,

    /// Short description
    #[serde(default)]
    pub description: String,

    /// Author
    #[serde(default = "default_author")]
    pub author: String,

    /// Homepage
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub website: Option<String>,

    /// Entry source file, relative to the plugin directory
    #[serde(default = "default_main")]
    pub main: String,

    /// Crate name to version requirement
    #[serde(default)]
    pub dependencies: BTreeMap<String, String>,

    /// Informational scripts
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub scripts: BTreeMap<String, String>,
}

fn default_author() -> String {
    "Unknown".to_string()
}

fn default_main() -> String {
    DEFAULT_ENTRY.to_string()
}

impl PluginManifest {
    /// Manifest written for packages that ship without one
    pub fn synthesized(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: "1.0.0".to_string(),
            description: "Auto-generated plugin".to_string(),
            author: default_author(),
            website: None,
            main: default_main(),
            dependencies: BTreeMap::new(),
            scripts: BTreeMap::new(),
        }
    }

    /// Read `plugin.json` from a plugin directory
    pub fn read(dir: &Path) -> Result<Self> {
        let path = dir.join(MANIFEST_FILE);
        let content = fs::read_to_string(&path)
            .map_err(|e| PluginRuntimeError::invalid_manifest(&path, e))?;

        let manifest: Self = serde_json::from_str(&content)
            .map_err(|e| PluginRuntimeError::invalid_manifest(&path, e))?;

        if !is_safe_entry(&manifest.main) {
            return Err(PluginRuntimeError::invalid_manifest(
                &path,
                format!("main must be a path inside the plugin directory, got {}", manifest.main),
            ));
        }

        Ok(manifest)
    }

    /// Read `plugin.json` if present
    pub fn read_optional(dir: &Path) -> Result<Option<Self>> {
        if dir.join(MANIFEST_FILE).is_file() {
            Self::read(dir).map(Some)
        } else {
            Ok(None)
        }
    }

    /// Write `plugin.json` into a plugin directory
    pub fn write(&self, dir: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(dir.join(MANIFEST_FILE), content)?;
        Ok(())
    }

    /// Absolute path of the entry file
    pub fn entry_path(&self, dir: &Path) -> PathBuf {
        dir.join(&self.main)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_names() {
        for name in ["demo-plugin-2", "a", "hello-world", "x1"] {
            assert!(validate_plugin_name(name).is_ok(), "{name} should be valid");
        }
        assert!(validate_plugin_name(&"a".repeat(50)).is_ok());
    }

    #[test]
    fn test_invalid_names() {
        for name in ["My-Plugin", "-abc", "ab_c", "1abc", "", "a b"] {
            let err = validate_plugin_name(name).unwrap_err();
            assert!(
                matches!(err, PluginRuntimeError::InvalidName { .. }),
                "{name} should be rejected"
            );
        }
        assert!(validate_plugin_name(&"a".repeat(51)).is_err());
    }

    #[test]
    fn test_manifest_defaults() {
        let manifest: PluginManifest =
            serde_json::from_str(r#"{"name": "demo", "version": "0.2.0"}"#).unwrap();

        assert_eq!(manifest.main, "src/lib.rs");
        assert_eq!(manifest.author, "Unknown");
        assert!(manifest.dependencies.is_empty());
    }

    #[test]
    fn test_read_write_manifest() {
        let dir = tempfile::tempdir().unwrap();
        assert!(PluginManifest::read_optional(dir.path()).unwrap().is_none());

        let mut manifest = PluginManifest::synthesized("demo");
        manifest
            .dependencies
            .insert("serde".to_string(), "1.0".to_string());
        manifest.write(dir.path()).unwrap();

        let read = PluginManifest::read(dir.path()).unwrap();
        assert_eq!(read, manifest);
        assert_eq!(read.description, "Auto-generated plugin");
    }

    #[test]
    fn test_malformed_manifest_names_file() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(MANIFEST_FILE), "{ not json").unwrap();

        let err = PluginManifest::read(dir.path()).unwrap_err();
        assert!(matches!(err, PluginRuntimeError::InvalidManifest { .. }));
        assert!(err.to_string().contains("plugin.json"));
    }

    #[test]
    fn test_main_must_stay_inside_plugin_dir() {
        let dir = tempfile::tempdir().unwrap();

        for main in ["/etc/hostname", "../../x.rs", "src/../../x.rs"] {
            let content = format!(r#"{{"name": "demo", "version": "1.0.0", "main": "{main}"}}"#);
            fs::write(dir.path().join(MANIFEST_FILE), content).unwrap();

            let err = PluginManifest::read(dir.path()).unwrap_err();
            assert!(
                matches!(err, PluginRuntimeError::InvalidManifest { .. }),
                "{main} should be rejected"
            );
        }

        fs::write(
            dir.path().join(MANIFEST_FILE),
            r#"{"name": "demo", "version": "1.0.0", "main": "./src/plugin.rs"}"#,
        )
        .unwrap();
        assert_eq!(PluginManifest::read(dir.path()).unwrap().main, "./src/plugin.rs");
    }
}
