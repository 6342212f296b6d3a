//! Archive intake: validation, extraction and structure checks

use crate::error::{PluginRuntimeError, Result};
use crate::manifest::{validate_plugin_name, PluginManifest, DEFAULT_ENTRY, MANIFEST_FILE};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info, warn};

/// Outcome of pre-flight archive validation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    /// Whether the archive may be installed
    pub is_valid: bool,

    /// Blocking problems
    pub errors: Vec<String>,

    /// Non-blocking problems
    pub warnings: Vec<String>,
}

impl ValidationResult {
    fn valid() -> Self {
        Self {
            is_valid: true,
            ..Default::default()
        }
    }

    fn error(&mut self, msg: impl Into<String>) {
        self.is_valid = false;
        self.errors.push(msg.into());
    }

    fn warning(&mut self, msg: impl Into<String>) {
        self.warnings.push(msg.into());
    }

    /// Convert into an error if validation failed
    pub fn into_result(self, path: &Path) -> Result<Self> {
        if self.is_valid {
            Ok(self)
        } else {
            Err(PluginRuntimeError::InvalidArchive {
                path: path.display().to_string(),
                errors: self.errors,
            })
        }
    }
}

/// Check an archive before anything is written to disk
///
/// Reads only the file metadata and the zip central directory.
pub fn validate_archive(path: &Path, name: &str, max_size: u64) -> ValidationResult {
    let mut result = ValidationResult::valid();

    let is_zip = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map_or(false, |ext| ext.eq_ignore_ascii_case("zip"));
    if !is_zip {
        result.error("File must be a .zip archive");
        return result;
    }

    let size = match fs::metadata(path) {
        Ok(meta) => meta.len(),
        Err(e) => {
            result.error(format!("Cannot access file: {e}"));
            return result;
        }
    };

    if size > max_size {
        result.error(format!(
            "Plugin file too large (max {}MB)",
            max_size / (1024 * 1024)
        ));
        return result;
    }

    if size == 0 {
        result.error("Plugin file is empty");
        return result;
    }

    if let Err(e) = validate_plugin_name(name) {
        result.error(e.to_string());
    }

    let archive = File::open(path)
        .map_err(zip::result::ZipError::Io)
        .and_then(zip::ZipArchive::new);
    match archive {
        Ok(archive) => {
            if let Some(unsafe_entry) = archive.file_names().find(|n| !is_safe_entry(n)) {
                result.error(format!("Archive entry escapes the plugin directory: {unsafe_entry}"));
            }
            if !archive.file_names().any(|n| n == MANIFEST_FILE) {
                result.warning("No plugin.json found; one will be generated");
            }
        }
        Err(e) => result.error(format!("Not a readable zip archive: {e}")),
    }

    result
}

#[cfg(unix)]
fn apply_mode(path: &Path, mode: Option<u32>) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    match mode {
        Some(mode) => fs::set_permissions(path, fs::Permissions::from_mode(mode & 0o777)),
        None => Ok(()),
    }
}

#[cfg(not(unix))]
fn apply_mode(_path: &Path, _mode: Option<u32>) -> io::Result<()> {
    Ok(())
}

/// Whether a relative path stays inside the directory it is joined to
pub(crate) fn is_safe_entry(name: &str) -> bool {
    Path::new(name)
        .components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

/// Unpacks plugin archives under the plugin root
#[derive(Debug, Clone)]
pub struct Extractor {
    root: PathBuf,
}

impl Extractor {
    /// Create an extractor rooted at the plugin directory
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Plugin root
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory a plugin is extracted to
    pub fn plugin_dir(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// Extract an archive into `<root>/<name>`, replacing any previous content
    ///
    /// Every entry is checked before the first byte is written; an entry with
    /// a `..` component or an absolute path fails the whole extraction. The
    /// caller removes the directory on failure.
    pub fn extract_archive(&self, archive_path: &Path, name: &str) -> Result<PathBuf> {
        let dir = self.plugin_dir(name);

        match fs::remove_dir_all(&dir) {
            Ok(()) => debug!(plugin = %name, "Removed previous plugin directory"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        fs::create_dir_all(&dir)?;

        let mut archive = zip::ZipArchive::new(File::open(archive_path)?)?;

        if let Some(entry) = archive.file_names().find(|n| !is_safe_entry(n)) {
            warn!(plugin = %name, entry = %entry, "Rejected archive entry outside plugin directory");
            return Err(PluginRuntimeError::PathTraversal(entry.to_string()));
        }

        for i in 0..archive.len() {
            let mut entry = archive.by_index(i)?;
            let target = dir.join(entry.name());

            if entry.is_dir() {
                fs::create_dir_all(&target)?;
                continue;
            }

            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }

            let mut out = File::create(&target)?;
            io::copy(&mut entry, &mut out)?;
            apply_mode(&target, entry.unix_mode())?;
        }

        info!(
            plugin = %name,
            entries = archive.len(),
            dir = %dir.display(),
            "Plugin archive extracted"
        );

        Ok(dir)
    }

    /// Ensure the entry file exists, writing a default manifest if missing
    pub fn validate_structure(&self, dir: &Path) -> Result<()> {
        let manifest = PluginManifest::read_optional(dir)?;

        let entry = manifest
            .as_ref()
            .map(|m| m.entry_path(dir))
            .unwrap_or_else(|| dir.join(DEFAULT_ENTRY));

        if !entry.is_file() {
            return Err(PluginRuntimeError::invalid_structure(format!(
                "plugin must contain {}",
                entry.strip_prefix(dir).unwrap_or(&entry).display()
            )));
        }

        if manifest.is_none() {
            let name = dir
                .file_name()
                .and_then(|n| n.to_str())
                .ok_or_else(|| PluginRuntimeError::invalid_structure("unnamed plugin directory"))?;

            PluginManifest::synthesized(name).write(dir)?;
            info!(plugin = %name, "Generated default plugin.json");
        }

        Ok(())
    }

    /// Read a plugin's manifest
    pub fn read_manifest(&self, dir: &Path) -> Result<PluginManifest> {
        PluginManifest::read(dir)
    }

    /// Remove a plugin's source directory if present
    pub fn remove_plugin_dir(&self, name: &str) -> Result<()> {
        match fs::remove_dir_all(self.plugin_dir(name)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
