//! Plugin manager for high-level plugin operations
//!
//! The manager owns the registry, the loader and the host dependencies
//! behind one async lock. Structural operations (install, load, unload,
//! reload, uninstall) hold the write guard for their whole duration,
//! including extraction and compilation. Queries take the read guard. Route
//! dispatch goes through the [`RouteTable`] and never waits on this lock.

use crate::compiler::{Compiler, CompilerInfo};
use crate::error::{PluginRuntimeError, Result};
use crate::extractor::{self, Extractor, ValidationResult};
use crate::loader::{
    LibloadingOpener, LoadedPlugin, Loader, ModuleInfo, ModuleOpener, Platform, PluginSource,
};
use crate::registry::{PluginEntry, PluginRegistry, PluginSummary};
use crate::routes::{self, RouteTable};
use crate::toolchain::{CargoToolchain, Toolchain};
use kiln_config::PluginsConfig;
use kiln_plugin_api::{
    AdminMenuItem, Plugin, PluginDependencies, PluginError, PluginInfo, PluginSetting,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::env::consts::DLL_EXTENSION;
use std::fs;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

#[derive(Debug)]
struct ManagerState {
    // Instances are dropped before the loader that produced them
    registry: PluginRegistry,
    loader: Loader,
    deps: PluginDependencies,
}

/// Result of a successful install
#[derive(Debug, Clone, Serialize)]
pub struct InstallReport {
    /// Name the plugin registered under
    pub name: String,

    /// Version from the manifest
    pub version: String,

    /// Description from the manifest
    pub description: String,

    /// Installed module
    pub artifact: PathBuf,

    /// Non-blocking validation findings
    pub warnings: Vec<String>,
}

/// Outcome of a bulk load
#[derive(Debug, Clone, Default, Serialize)]
pub struct BulkLoad {
    /// Plugins that became active
    pub loaded: Vec<String>,

    /// `(item, error)` for every item that failed
    pub failures: Vec<(String, String)>,
}

impl BulkLoad {
    /// Whether every item loaded
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    /// Aggregate error when anything failed
    pub fn error(&self) -> Option<PluginRuntimeError> {
        if self.is_complete() {
            return None;
        }
        Some(PluginRuntimeError::PartialLoad {
            loaded: self.loaded.len(),
            failures: self.failures.clone(),
        })
    }
}

/// Host and toolchain details for diagnostics
#[derive(Debug, Clone, Serialize)]
pub struct SystemInfo {
    /// Host platform
    pub platform: Platform,

    /// Whether the platform can load plugins
    pub supported: bool,

    /// Toolchain details, if the toolchain answered
    pub compiler: Option<CompilerInfo>,

    /// Plugin root directory
    pub plugin_root: PathBuf,

    /// Artifact directory
    pub build_dir: PathBuf,

    /// Active plugins
    pub loaded: Vec<String>,

    /// Modules the loader has open
    pub open_modules: Vec<ModuleInfo>,
}

/// Builder for [`PluginManager`] with replaceable toolchain and loader seams
#[derive(Debug)]
pub struct PluginManagerBuilder {
    config: PluginsConfig,
    toolchain: Option<Arc<dyn Toolchain>>,
    opener: Option<Arc<dyn ModuleOpener>>,
    platform: Option<Platform>,
}

impl PluginManagerBuilder {
    /// Use a different toolchain
    pub fn toolchain(mut self, toolchain: Arc<dyn Toolchain>) -> Self {
        self.toolchain = Some(toolchain);
        self
    }

    /// Use a different module opener
    pub fn opener(mut self, opener: Arc<dyn ModuleOpener>) -> Self {
        self.opener = Some(opener);
        self
    }

    /// Pretend to run on another platform
    pub fn platform(mut self, platform: Platform) -> Self {
        self.platform = Some(platform);
        self
    }

    /// Build the manager
    pub fn build(self) -> PluginManager {
        let config = self.config;
        let toolchain = self
            .toolchain
            .unwrap_or_else(|| Arc::new(CargoToolchain::from_config(&config)) as Arc<dyn Toolchain>);
        let opener = self
            .opener
            .unwrap_or_else(|| Arc::new(LibloadingOpener) as Arc<dyn ModuleOpener>);
        let platform = self.platform.unwrap_or_else(Platform::current);

        let compiler = Compiler::new(config.build_dir(), toolchain, config.api_dependency.clone());
        let extractor = Extractor::new(config.root_dir.clone());

        PluginManager {
            state: RwLock::new(ManagerState {
                registry: PluginRegistry::new(),
                loader: Loader::new(opener, platform),
                deps: PluginDependencies::default(),
            }),
            compiler,
            extractor,
            routes: RouteTable::new(),
            config,
        }
    }
}

/// Plugin manager for high-level plugin operations
///
/// Shared as `Arc<PluginManager>`; every method takes `&self`.
#[derive(Debug)]
pub struct PluginManager {
    state: RwLock<ManagerState>,
    compiler: Compiler,
    extractor: Extractor,
    routes: RouteTable,
    config: PluginsConfig,
}

impl PluginManager {
    /// Create a manager using cargo and the platform dynamic loader
    pub fn new(config: PluginsConfig) -> Self {
        Self::builder(config).build()
    }

    /// Start building a manager
    pub fn builder(config: PluginsConfig) -> PluginManagerBuilder {
        PluginManagerBuilder {
            config,
            toolchain: None,
            opener: None,
            platform: None,
        }
    }

    /// Plugin configuration
    pub fn config(&self) -> &PluginsConfig {
        &self.config
    }

    /// Compiler used for plugin sources
    pub fn compiler(&self) -> &Compiler {
        &self.compiler
    }

    /// Plugin root directory
    pub fn plugin_root(&self) -> &Path {
        self.extractor.root()
    }

    /// Replace the dependencies handed to plugins on initialization
    ///
    /// Already active plugins keep what they were initialized with.
    pub async fn set_dependencies(&self, deps: PluginDependencies) {
        self.state.write().await.deps = deps;
        debug!("Plugin dependencies updated");
    }

    /// Pre-flight check of an archive, without side effects
    pub fn validate_archive(&self, archive: &Path, name: &str) -> ValidationResult {
        extractor::validate_archive(archive, name, self.config.max_archive_size)
    }

    /// Install a plugin from a zip archive
    ///
    /// Extracts to `<root>/<name>`, compiles, loads, initializes and mounts
    /// the plugin, then deletes the archive. Any failure after validation
    /// removes the extracted directory and the artifact again.
    pub async fn install_plugin_from_zip(&self, archive: &Path, name: &str) -> Result<InstallReport> {
        let validation = self.validate_archive(archive, name).into_result(archive)?;
        for warning in &validation.warnings {
            warn!(plugin = %name, warning = %warning, "Archive validation warning");
        }

        let mut state = self.state.write().await;
        state.loader.check_platform()?;

        let dir = self.extractor.plugin_dir(name);
        if state.registry.contains(name) || state.registry.find_by_source_dir(&dir).is_some() {
            return Err(PluginRuntimeError::already_installed(name));
        }

        info!(plugin = %name, archive = %archive.display(), "Installing plugin");

        let report = match self.install_locked(&mut state, archive, name).await {
            Ok(report) => report,
            Err(e) => {
                error!(plugin = %name, error = %e, "Plugin installation failed");
                self.rollback_install(&mut state, name);
                return Err(e);
            }
        };

        if let Err(e) = fs::remove_file(archive) {
            warn!(archive = %archive.display(), error = %e, "Failed to delete installed archive");
        }

        if report.name != name {
            warn!(
                plugin = %report.name,
                directory = %name,
                "Plugin registered under a different name than its directory"
            );
        }

        info!(plugin = %report.name, version = %report.version, "Plugin installed");
        Ok(InstallReport {
            warnings: validation.warnings,
            ..report
        })
    }

    async fn install_locked(
        &self,
        state: &mut ManagerState,
        archive: &Path,
        name: &str,
    ) -> Result<InstallReport> {
        let extractor = self.extractor.clone();
        let archive_path = archive.to_path_buf();
        let dir_name = name.to_string();
        let dir = tokio::task::spawn_blocking(move || {
            extractor.extract_archive(&archive_path, &dir_name)
        })
        .await
        .map_err(|e| PluginRuntimeError::other(format!("extraction task failed: {e}")))??;

        self.extractor.validate_structure(&dir)?;
        let manifest = self.extractor.read_manifest(&dir)?;

        let artifact = self.compiler.compile_plugin(&dir, name).await?;
        self.compiler.validate_compilation(&artifact.path).await?;

        let plugin = state.loader.load_from_file(&artifact.path)?;
        let info = self.activate(
            state,
            LoadedPlugin {
                plugin,
                source: PluginSource::Directory(dir),
                artifact: artifact.path.clone(),
                recompiled: true,
            },
        )?;

        Ok(InstallReport {
            name: info.name,
            version: manifest.version,
            description: manifest.description,
            artifact: artifact.path,
            warnings: Vec::new(),
        })
    }

    fn rollback_install(&self, state: &mut ManagerState, name: &str) {
        state.loader.release(name);

        if let Err(e) = self.extractor.remove_plugin_dir(name) {
            warn!(plugin = %name, error = %e, "Failed to remove plugin directory during rollback");
        }
        if let Err(e) = self.compiler.remove_artifact(name) {
            warn!(plugin = %name, error = %e, "Failed to remove artifact during rollback");
        }
    }

    /// Initialize a fresh instance, mount its routes and register it
    ///
    /// Nothing is registered unless every step succeeds.
    fn activate(&self, state: &mut ManagerState, loaded: LoadedPlugin) -> Result<PluginInfo> {
        let LoadedPlugin {
            mut plugin,
            source,
            artifact,
            ..
        } = loaded;

        let info = plugin.info();
        // Route namespaces are case-insensitive, so names differing only in case collide
        if state.registry.contains(&info.name) || self.routes.contains(&info.name) {
            return Err(PluginRuntimeError::already_installed(&info.name));
        }

        let deps = state.deps.clone();
        match panic::catch_unwind(AssertUnwindSafe(|| plugin.initialize(&deps))) {
            Ok(Ok(())) => debug!(plugin = %info.name, "Plugin initialized"),
            Ok(Err(source)) => {
                return Err(PluginRuntimeError::Initialization {
                    plugin: info.name,
                    source,
                })
            }
            Err(_) => {
                return Err(PluginRuntimeError::Initialization {
                    plugin: info.name,
                    source: PluginError::init("initialize panicked"),
                })
            }
        }

        let router = match routes::build_router(&*plugin, &info.name) {
            Ok(router) => router,
            Err(e) => {
                shutdown_instance(&mut *plugin, &info.name);
                return Err(e);
            }
        };

        self.routes.mount(&info.name, router);
        state
            .registry
            .insert(PluginEntry::new(plugin, source, artifact))?;

        info!(plugin = %info.name, version = %info.version, "Plugin activated");
        Ok(info)
    }

    /// Compile (if needed) and load the plugin in `<root>/<name>`
    pub async fn load_plugin(&self, name: &str) -> Result<PluginInfo> {
        let mut state = self.state.write().await;
        self.load_dir_locked(&mut state, name).await
    }

    async fn load_dir_locked(&self, state: &mut ManagerState, name: &str) -> Result<PluginInfo> {
        let dir = self.extractor.plugin_dir(name);
        if state.registry.contains(name) || state.registry.find_by_source_dir(&dir).is_some() {
            return Err(PluginRuntimeError::already_installed(name));
        }
        if !dir.is_dir() {
            return Err(PluginRuntimeError::not_found(name));
        }

        let loaded = state
            .loader
            .load_from_directory(&dir, name, &self.compiler)
            .await?;
        let artifact = loaded.artifact.clone();

        self.activate(state, loaded).map_err(|e| {
            release_module(state, &artifact);
            e
        })
    }

    /// Load a standalone compiled module
    pub async fn load_plugin_from_file(&self, path: &Path) -> Result<PluginInfo> {
        let mut state = self.state.write().await;

        if state.registry.contains_source(path) {
            return Err(PluginRuntimeError::already_installed(path.display()));
        }

        let plugin = state.loader.load_from_file(path)?;
        let loaded = LoadedPlugin {
            plugin,
            source: PluginSource::Artifact(path.to_path_buf()),
            artifact: path.to_path_buf(),
            recompiled: false,
        };

        self.activate(&mut state, loaded).map_err(|e| {
            release_module(&mut state, path);
            e
        })
    }

    /// Load every plugin under the root that is not active yet
    ///
    /// Failures are logged and collected; the rest still load.
    pub async fn load_plugins(&self) -> Result<BulkLoad> {
        let mut state = self.state.write().await;
        self.load_plugins_locked(&mut state).await
    }

    async fn load_plugins_locked(&self, state: &mut ManagerState) -> Result<BulkLoad> {
        state.loader.check_platform()?;

        let items: Vec<_> = state
            .loader
            .discover(self.extractor.root())?
            .into_iter()
            .filter(|item| !state.registry.contains_source(item.path()))
            .collect();

        info!(count = items.len(), root = %self.extractor.root().display(), "Loading plugins");

        let (loaded, failures) = state.loader.load_each(items, &self.compiler).await;

        let mut report = BulkLoad::default();
        for (item, e) in failures {
            report.failures.push((item, e.to_string()));
        }

        for plugin in loaded {
            let label = plugin.source.label();
            let artifact = plugin.artifact.clone();
            match self.activate(state, plugin) {
                Ok(info) => report.loaded.push(info.name),
                Err(e) => {
                    error!(item = %label, error = %e, "Failed to activate plugin");
                    release_module(state, &artifact);
                    report.failures.push((label, e.to_string()));
                }
            }
        }

        if report.is_complete() {
            info!(loaded = report.loaded.len(), "Plugins loaded");
        } else {
            warn!(
                loaded = report.loaded.len(),
                failed = report.failures.len(),
                "Some plugins failed to load"
            );
        }

        Ok(report)
    }

    /// Shut a plugin down and remove it; its files stay on disk
    pub async fn unload_plugin(&self, name: &str) -> Result<()> {
        let mut state = self.state.write().await;
        self.unload_locked(&mut state, name).map(|_| ())
    }

    fn unload_locked(&self, state: &mut ManagerState, name: &str) -> Result<PluginEntry> {
        let entry = state
            .registry
            .remove(name)
            .ok_or_else(|| PluginRuntimeError::not_found(name))?;

        self.routes.unmount(name);
        shutdown_instance(&mut **entry.plugin.write(), name);
        release_module(state, &entry.artifact);

        info!(plugin = %name, "Plugin unloaded");
        Ok(entry)
    }

    /// Unload, rebuild from source bypassing the cache, and load again
    ///
    /// Plugins loaded from a standalone module are reopened from the same
    /// file. The result is always a new instance.
    pub async fn reload_plugin(&self, name: &str) -> Result<PluginInfo> {
        let mut state = self.state.write().await;
        self.reload_locked(&mut state, name).await
    }

    async fn reload_locked(&self, state: &mut ManagerState, name: &str) -> Result<PluginInfo> {
        info!(plugin = %name, "Reloading plugin");

        let PluginEntry {
            source, artifact, ..
        } = self.unload_locked(state, name)?;

        let loaded = match source {
            PluginSource::Directory(dir) => {
                let dir_name = dir
                    .file_name()
                    .and_then(|n| n.to_str())
                    .map(str::to_string)
                    .ok_or_else(|| {
                        PluginRuntimeError::other(format!("invalid plugin directory {}", dir.display()))
                    })?;

                self.compiler.remove_artifact(&dir_name)?;
                if artifact != self.compiler.artifact_path(&dir_name) {
                    remove_if_exists(&artifact)?;
                }

                state
                    .loader
                    .load_from_directory(&dir, &dir_name, &self.compiler)
                    .await?
            }
            PluginSource::Artifact(path) => {
                let plugin = state.loader.load_from_file(&path)?;
                LoadedPlugin {
                    plugin,
                    source: PluginSource::Artifact(path.clone()),
                    artifact: path,
                    recompiled: false,
                }
            }
        };

        let artifact = loaded.artifact.clone();
        let info = self.activate(state, loaded).map_err(|e| {
            release_module(state, &artifact);
            e
        })?;

        info!(plugin = %info.name, version = %info.version, "Plugin reloaded");
        Ok(info)
    }

    /// Unload every plugin, then load everything under the root again
    pub async fn hot_reload(&self) -> Result<BulkLoad> {
        let mut state = self.state.write().await;

        let names = state.registry.names();
        info!(count = names.len(), "Hot reload started");

        for name in names {
            info!(plugin = %name, "Unloading plugin for hot reload");
            if let Err(e) = self.unload_locked(&mut state, &name) {
                warn!(plugin = %name, error = %e, "Failed to unload plugin");
            }
        }

        self.load_plugins_locked(&mut state).await
    }

    /// Remove a plugin's source directory and artifact, unloading it first
    ///
    /// Works for plugins that are installed but not loaded.
    pub async fn uninstall_plugin(&self, name: &str) -> Result<()> {
        let mut state = self.state.write().await;

        let dir = self.extractor.plugin_dir(name);
        let active = if state.registry.contains(name) {
            Some(name.to_string())
        } else {
            state
                .registry
                .find_by_source_dir(&dir)
                .map(|entry| entry.info.name.clone())
        };

        let mut paths = vec![
            dir.clone(),
            self.compiler.artifact_path(name),
            self.extractor.root().join(format!("{name}.{DLL_EXTENSION}")),
        ];

        if let Some(active) = active {
            let entry = self.unload_locked(&mut state, &active)?;
            paths.push(entry.source.path().to_path_buf());
            paths.push(entry.artifact);
        }

        paths.sort();
        paths.dedup();

        let mut removed = false;
        for path in &paths {
            removed |= remove_if_exists(path)?;
        }

        if !removed {
            return Err(PluginRuntimeError::not_found(name));
        }

        info!(plugin = %name, "Plugin uninstalled");
        Ok(())
    }

    /// Reload the plugin built from `<root>/<dir_name>`, or load it if inactive
    pub async fn refresh_directory(&self, dir_name: &str) -> Result<PluginInfo> {
        let mut state = self.state.write().await;

        let dir = self.extractor.plugin_dir(dir_name);
        if !dir.is_dir() {
            return Err(PluginRuntimeError::not_found(dir_name));
        }

        let active = state
            .registry
            .find_by_source_dir(&dir)
            .map(|entry| entry.info.name.clone());

        match active {
            Some(name) => self.reload_locked(&mut state, &name).await,
            None => self.load_dir_locked(&mut state, dir_name).await,
        }
    }

    /// Get plugin by name
    pub async fn get_plugin(&self, name: &str) -> Option<PluginEntry> {
        self.state.read().await.registry.get(name).cloned()
    }

    /// All active plugins in name order
    pub async fn get_all_plugins(&self) -> Vec<PluginEntry> {
        self.state.read().await.registry.iter().cloned().collect()
    }

    /// Summaries of all active plugins
    pub async fn list(&self) -> Vec<PluginSummary> {
        self.state
            .read()
            .await
            .registry
            .iter()
            .map(PluginEntry::summary)
            .collect()
    }

    /// Whether a plugin is active
    pub async fn is_loaded(&self, name: &str) -> bool {
        self.state.read().await.registry.contains(name)
    }

    /// Admin menu items of every plugin, sorted by `order`
    ///
    /// Items with equal order keep plugin name order.
    pub async fn get_admin_menu_items(&self) -> Vec<AdminMenuItem> {
        let state = self.state.read().await;

        let mut items: Vec<_> = state
            .registry
            .iter()
            .flat_map(|entry| query_plugin(entry, "admin_menu_items", |p| p.admin_menu_items()))
            .collect();
        items.sort_by_key(|item| item.order);
        items
    }

    /// Settings exposed by one plugin
    pub async fn get_plugin_settings(&self, name: &str) -> Result<Vec<PluginSetting>> {
        let state = self.state.read().await;
        let entry = state
            .registry
            .get(name)
            .ok_or_else(|| PluginRuntimeError::not_found(name))?;

        Ok(query_plugin(entry, "settings", |p| p.settings()))
    }

    /// Settings of every plugin keyed by plugin name
    pub async fn get_all_settings(&self) -> BTreeMap<String, Vec<PluginSetting>> {
        let state = self.state.read().await;
        state
            .registry
            .iter()
            .map(|entry| {
                (
                    entry.info.name.clone(),
                    query_plugin(entry, "settings", |p| p.settings()),
                )
            })
            .collect()
    }

    /// Router serving every active plugin under `/plugins/<name>`
    pub fn routes(&self) -> axum::Router {
        self.routes.router()
    }

    /// Live route table
    pub fn route_table(&self) -> &RouteTable {
        &self.routes
    }

    /// Delete cached artifacts older than `max_age`
    pub async fn cleanup_cache(&self, max_age: Duration) -> Result<usize> {
        let _state = self.state.write().await;
        self.compiler.cleanup_old_builds(max_age)
    }

    /// Host, toolchain and loader details
    pub async fn system_info(&self) -> SystemInfo {
        let compiler = match self.compiler.compiler_info().await {
            Ok(info) => Some(info),
            Err(e) => {
                warn!(error = %e, "Toolchain unavailable");
                None
            }
        };

        let state = self.state.read().await;
        let platform = state.loader.platform().clone();

        SystemInfo {
            supported: platform.is_supported(),
            platform,
            compiler,
            plugin_root: self.extractor.root().to_path_buf(),
            build_dir: self.compiler.build_dir().to_path_buf(),
            loaded: state.registry.names(),
            open_modules: state.loader.open_modules(),
        }
    }

    /// Unload every plugin
    pub async fn shutdown_all(&self) {
        let mut state = self.state.write().await;

        let names = state.registry.names();
        info!(count = names.len(), "Shutting down all plugins");

        for name in names {
            if let Err(e) = self.unload_locked(&mut state, &name) {
                warn!(plugin = %name, error = %e, "Failed to unload plugin");
            }
        }
    }
}

/// Call `shutdown`, logging failures and panics
fn shutdown_instance(plugin: &mut dyn Plugin, name: &str) {
    match panic::catch_unwind(AssertUnwindSafe(|| plugin.shutdown())) {
        Ok(Ok(())) => debug!(plugin = %name, "Plugin shut down"),
        Ok(Err(e)) => warn!(plugin = %name, error = %e, "Plugin shutdown failed"),
        Err(_) => error!(plugin = %name, "Plugin shutdown panicked"),
    }
}

/// Read from a plugin, treating a panic as an empty answer
fn query_plugin<T>(entry: &PluginEntry, what: &str, f: impl FnOnce(&dyn Plugin) -> Vec<T>) -> Vec<T> {
    let plugin = entry.plugin.read();
    panic::catch_unwind(AssertUnwindSafe(|| f(&**plugin))).unwrap_or_else(|_| {
        error!(plugin = %entry.info.name, query = what, "Plugin panicked while answering");
        Vec::new()
    })
}

fn release_module(state: &mut ManagerState, artifact: &Path) {
    if let Some(stem) = artifact.file_stem().and_then(|s| s.to_str()) {
        state.loader.release(stem);
    }
}

/// Remove a file or directory; `Ok(false)` if it did not exist
fn remove_if_exists(path: &Path) -> Result<bool> {
    let result = if path.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };

    match result {
        Ok(()) => {
            debug!(path = %path.display(), "Removed");
            Ok(true)
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}
