//! Build orchestration with an mtime-based artifact cache

use crate::error::{PluginRuntimeError, Result};
use crate::manifest::{PluginManifest, MANIFEST_FILE};
use crate::toolchain::{BuildRequest, Toolchain};
use kiln_config::ApiDependency;
use kiln_plugin_api::ENTRY_SYMBOL;
use serde::Serialize;
use std::env::consts::{ARCH, DLL_EXTENSION, OS};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Compiled module on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledArtifact {
    /// Artifact path
    pub path: PathBuf,

    /// Modification time of the newest relevant source file
    pub source_modified: Option<SystemTime>,
}

/// Result of [`Compiler::compile_with_cache`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileOutcome {
    /// The artifact to load
    pub artifact: CompiledArtifact,

    /// Whether the toolchain ran
    pub recompiled: bool,
}

/// Toolchain and host details
#[derive(Debug, Clone, Serialize)]
pub struct CompilerInfo {
    /// Toolchain version
    pub version: String,

    /// Host operating system
    pub os: String,

    /// Host architecture
    pub arch: String,

    /// Artifact directory
    pub build_dir: PathBuf,
}

/// Turns plugin directories into loadable modules
#[derive(Debug, Clone)]
pub struct Compiler {
    build_dir: PathBuf,
    toolchain: Arc<dyn Toolchain>,
    api_dependency: ApiDependency,
}

impl Compiler {
    /// Create a compiler writing artifacts to `build_dir`
    pub fn new(
        build_dir: impl Into<PathBuf>,
        toolchain: Arc<dyn Toolchain>,
        api_dependency: ApiDependency,
    ) -> Self {
        Self {
            build_dir: build_dir.into(),
            toolchain,
            api_dependency,
        }
    }

    /// Artifact directory
    pub fn build_dir(&self) -> &Path {
        &self.build_dir
    }

    /// Where the artifact for `name` lives
    pub fn artifact_path(&self, name: &str) -> PathBuf {
        self.build_dir.join(format!("{name}.{DLL_EXTENSION}"))
    }

    /// Compile only if the artifact is missing or older than any source file
    pub async fn compile_with_cache(&self, dir: &Path, name: &str) -> Result<CompileOutcome> {
        let path = self.artifact_path(name);

        let artifact_modified = match fs::metadata(&path) {
            Ok(meta) => Some(meta.modified()?),
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };

        let Some(artifact_modified) = artifact_modified else {
            debug!(plugin = %name, "No cached artifact");
            let artifact = self.compile_plugin(dir, name).await?;
            return Ok(CompileOutcome {
                artifact,
                recompiled: true,
            });
        };

        if self.needs_recompilation(dir, artifact_modified)? {
            debug!(plugin = %name, "Sources changed since last build");
            let artifact = self.compile_plugin(dir, name).await?;
            return Ok(CompileOutcome {
                artifact,
                recompiled: true,
            });
        }

        debug!(plugin = %name, artifact = %path.display(), "Using cached artifact");
        Ok(CompileOutcome {
            artifact: CompiledArtifact {
                path,
                source_modified: newest_source(dir)?,
            },
            recompiled: false,
        })
    }

    /// Compile a plugin directory unconditionally
    pub async fn compile_plugin(&self, dir: &Path, name: &str) -> Result<CompiledArtifact> {
        fs::create_dir_all(&self.build_dir)?;

        let output = self.artifact_path(name);
        match fs::remove_file(&output) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        self.ensure_cargo_manifest(dir, name)?;

        let request = BuildRequest {
            source_dir: dir.to_path_buf(),
            plugin_name: name.to_string(),
            output: output.clone(),
            target_dir: self.build_dir.join("target"),
        };

        info!(plugin = %name, dir = %dir.display(), "Compiling plugin");
        let started = std::time::Instant::now();

        let built = self.toolchain.build(&request).await.map_err(|e| {
            PluginRuntimeError::compilation(name, &e, e.output())
        })?;

        if !output.is_file() {
            return Err(PluginRuntimeError::compilation(
                name,
                format!(
                    "compilation succeeded but output file not found: {}",
                    output.display()
                ),
                built.log,
            ));
        }

        info!(
            plugin = %name,
            artifact = %output.display(),
            elapsed = ?started.elapsed(),
            "Plugin compiled"
        );

        Ok(CompiledArtifact {
            path: output,
            source_modified: newest_source(dir)?,
        })
    }

    /// Whether any relevant source file is strictly newer than `artifact_modified`
    pub fn needs_recompilation(&self, dir: &Path, artifact_modified: SystemTime) -> Result<bool> {
        Ok(newest_source(dir)?.map_or(false, |newest| newest > artifact_modified))
    }

    /// Check that an artifact exports the entry symbol
    pub async fn validate_compilation(&self, path: &Path) -> Result<()> {
        let symbols = self
            .toolchain
            .exported_symbols(path)
            .await
            .map_err(|e| PluginRuntimeError::artifact_validation(path, e))?;

        if !exports_symbol(&symbols, ENTRY_SYMBOL) {
            return Err(PluginRuntimeError::artifact_validation(
                path,
                format!("plugin does not export required {ENTRY_SYMBOL} symbol"),
            ));
        }

        Ok(())
    }

    /// Remove artifacts older than `max_age`, returning how many were removed
    pub fn cleanup_old_builds(&self, max_age: Duration) -> Result<usize> {
        let entries = match fs::read_dir(&self.build_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let cutoff = SystemTime::now()
            .checked_sub(max_age)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let mut removed = 0;

        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().map_or(true, |ext| ext != DLL_EXTENSION) {
                continue;
            }

            let Ok(modified) = entry.metadata().and_then(|m| m.modified()) else {
                continue;
            };

            if modified < cutoff {
                match fs::remove_file(&path) {
                    Ok(()) => {
                        debug!(artifact = %path.display(), "Removed stale artifact");
                        removed += 1;
                    }
                    Err(e) => warn!(artifact = %path.display(), error = %e, "Failed to remove stale artifact"),
                }
            }
        }

        info!(removed, "Build cache cleaned");
        Ok(removed)
    }

    /// Delete the artifact for `name` if present
    pub fn remove_artifact(&self, name: &str) -> Result<()> {
        remove_file_if_exists(&self.artifact_path(name))
    }

    /// Toolchain version and host platform
    pub async fn compiler_info(&self) -> Result<CompilerInfo> {
        let version = self
            .toolchain
            .version()
            .await
            .map_err(|e| PluginRuntimeError::other(format!("failed to query toolchain: {e}")))?;

        Ok(CompilerInfo {
            version,
            os: OS.to_string(),
            arch: ARCH.to_string(),
            build_dir: self.build_dir.clone(),
        })
    }

    /// Write a `Cargo.toml` for plugins that ship only sources
    fn ensure_cargo_manifest(&self, dir: &Path, name: &str) -> Result<()> {
        let cargo_toml = dir.join("Cargo.toml");
        if cargo_toml.is_file() {
            return Ok(());
        }

        let manifest = match PluginManifest::read_optional(dir)? {
            Some(manifest) => manifest,
            None => {
                debug!(plugin = %name, "No {MANIFEST_FILE}; using defaults");
                PluginManifest::synthesized(name)
            }
        };

        let content = cargo_manifest(name, &manifest, &self.api_dependency)?;
        fs::write(&cargo_toml, content)?;
        info!(plugin = %name, "Generated Cargo.toml");

        Ok(())
    }
}

/// Render the `Cargo.toml` of a plugin crate
pub(crate) fn cargo_manifest(name: &str, manifest: &PluginManifest, api: &ApiDependency) -> Result<String> {
    use toml::{Table, Value};

    let version = match semver::Version::parse(&manifest.version) {
        Ok(_) => manifest.version.clone(),
        Err(e) => {
            warn!(
                plugin = %name,
                version = %manifest.version,
                error = %e,
                "Manifest version is not semver; using 0.1.0 for the crate"
            );
            "0.1.0".to_string()
        }
    };

    let mut package = Table::new();
    package.insert("name".into(), Value::String(name.to_string()));
    package.insert("version".into(), Value::String(version));
    package.insert("edition".into(), Value::String("2021".into()));
    package.insert("publish".into(), Value::Boolean(false));

    let mut lib = Table::new();
    lib.insert("path".into(), Value::String(manifest.main.clone()));
    lib.insert(
        "crate-type".into(),
        Value::Array(vec![Value::String("cdylib".into())]),
    );

    let mut dependencies = Table::new();
    dependencies.insert("kiln-plugin-api".into(), api_dependency_value(api)?);
    for (krate, requirement) in &manifest.dependencies {
        // toolchain requirement, not a crate
        if krate == "rust" || krate == "kiln-plugin-api" {
            continue;
        }
        dependencies.insert(krate.clone(), Value::String(requirement.clone()));
    }

    let mut root = Table::new();
    root.insert("package".into(), Value::Table(package));
    root.insert("lib".into(), Value::Table(lib));
    root.insert("dependencies".into(), Value::Table(dependencies));
    // Keep the plugin out of any enclosing workspace
    root.insert("workspace".into(), Value::Table(Table::new()));

    toml::to_string(&root).map_err(|e| PluginRuntimeError::other(format!("Cargo.toml: {e}")))
}

fn api_dependency_value(api: &ApiDependency) -> Result<toml::Value> {
    let mut table = toml::Table::new();

    if let Some(path) = &api.path {
        let path = if path.is_absolute() {
            path.clone()
        } else {
            std::env::current_dir()?.join(path)
        };
        table.insert(
            "path".into(),
            toml::Value::String(path.to_string_lossy().into_owned()),
        );
    } else if let Some(version) = &api.version {
        table.insert("version".into(), toml::Value::String(version.clone()));
    } else {
        return Err(PluginRuntimeError::other(
            "no path or version configured for kiln-plugin-api",
        ));
    }

    Ok(toml::Value::Table(table))
}

/// Newest modification time among `*.rs`, `Cargo.toml` and `Cargo.lock`
///
/// `target/` and hidden directories are skipped.
fn newest_source(dir: &Path) -> Result<Option<SystemTime>> {
    let mut newest: Option<SystemTime> = None;

    let walker = WalkDir::new(dir).into_iter().filter_entry(|entry| {
        if entry.depth() == 0 || !entry.file_type().is_dir() {
            return true;
        }
        let name = entry.file_name().to_string_lossy();
        name != "target" && !name.starts_with('.')
    });

    for entry in walker {
        let entry = entry.map_err(|e| PluginRuntimeError::other(format!("walking {}: {e}", dir.display())))?;
        if !entry.file_type().is_file() || !is_relevant_source(entry.path()) {
            continue;
        }

        let modified = entry
            .metadata()
            .map_err(|e| PluginRuntimeError::other(e.to_string()))?
            .modified()?;
        newest = Some(newest.map_or(modified, |n| n.max(modified)));
    }

    Ok(newest)
}

/// Files whose change invalidates a build
pub(crate) fn is_relevant_source(path: &Path) -> bool {
    match path.file_name().and_then(|n| n.to_str()) {
        Some("Cargo.toml" | "Cargo.lock") => true,
        _ => path.extension().map_or(false, |ext| ext == "rs"),
    }
}

pub(crate) fn remove_file_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Whether an `nm` listing names `symbol` exactly
///
/// Mach-O prefixes C symbols with an underscore.
fn exports_symbol(listing: &str, symbol: &str) -> bool {
    listing
        .split_whitespace()
        .any(|token| token == symbol || token.strip_prefix('_') == Some(symbol))
}
