//! Dynamic loading of compiled plugin modules
//!
//! A module is opened once and bound through its exported
//! [`PluginDeclaration`]. Native code cannot be unloaded safely while any
//! object or function pointer from it may still be alive, so libraries are
//! never closed: a replaced handle is retired and leaked.

#![allow(unsafe_code)]

use crate::compiler::Compiler;
use crate::error::{PluginRuntimeError, Result};
use crate::manifest::MANIFEST_FILE;
use chrono::{DateTime, Utc};
use kiln_plugin_api::{Plugin, PluginDeclaration, ENTRY_SYMBOL, PLUGIN_API_VERSION, RUSTC_VERSION};
use libloading::Library;
use serde::Serialize;
use std::collections::HashMap;
use std::env::consts::DLL_EXTENSION;
use std::fmt;
use std::fs;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Operating systems that can load plugin modules
pub const SUPPORTED_OS: &[&str] = &["linux", "macos", "freebsd"];

/// Host platform
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Platform {
    /// Operating system (`std::env::consts::OS` naming)
    pub os: String,

    /// CPU architecture
    pub arch: String,
}

impl Platform {
    /// Create a platform description
    pub fn new(os: impl Into<String>, arch: impl Into<String>) -> Self {
        Self {
            os: os.into(),
            arch: arch.into(),
        }
    }

    /// The platform this process runs on
    pub fn current() -> Self {
        Self::new(std::env::consts::OS, std::env::consts::ARCH)
    }

    /// Whether plugin modules can be loaded here
    pub fn is_supported(&self) -> bool {
        SUPPORTED_OS.contains(&self.os.as_str())
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.os, self.arch)
    }
}

/// Instance constructor bound from a module
pub type BoundConstructor = Box<dyn Fn() -> Option<Box<dyn Plugin>> + Send + Sync>;

/// A module that has been opened but not yet type-checked
pub struct OpenedModule {
    /// Library handle, absent for in-process modules
    pub library: Option<Library>,

    /// Contract version the module declares
    pub api_version: u32,

    /// Compiler the module declares
    pub rustc_version: String,

    /// Instance constructor
    pub constructor: BoundConstructor,
}

impl fmt::Debug for OpenedModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenedModule")
            .field("library", &self.library.is_some())
            .field("api_version", &self.api_version)
            .field("rustc_version", &self.rustc_version)
            .finish_non_exhaustive()
    }
}

/// Opens module files and reads their declaration
pub trait ModuleOpener: Send + Sync + fmt::Debug {
    /// Open the module at `path`
    fn open(&self, path: &Path) -> Result<OpenedModule>;
}

/// [`ModuleOpener`] backed by the platform dynamic loader
#[derive(Debug, Default, Clone, Copy)]
pub struct LibloadingOpener;

impl ModuleOpener for LibloadingOpener {
    fn open(&self, path: &Path) -> Result<OpenedModule> {
        // SAFETY: opening a library runs its initializers. Plugins are trusted
        // code built by this host's toolchain.
        let library = unsafe { Library::new(path) }
            .map_err(|e| PluginRuntimeError::load(path, e))?;

        // SAFETY: the symbol is the static emitted by `export_plugin!`, whose
        // layout is `#[repr(C)]` with the version fields first. Only those are
        // trusted until the caller has compared them.
        let declaration: PluginDeclaration = unsafe {
            let symbol = library
                .get::<*const PluginDeclaration>(ENTRY_SYMBOL.as_bytes())
                .map_err(|e| {
                    PluginRuntimeError::load(path, format!("missing {ENTRY_SYMBOL}: {e}"))
                })?;
            **symbol
        };

        let constructor = declaration.constructor;
        Ok(OpenedModule {
            library: Some(library),
            api_version: declaration.api_version,
            rustc_version: declaration.rustc_version.to_string(),
            constructor: Box::new(move || constructor()),
        })
    }
}

/// A bookkept open module
#[derive(Debug, Clone, Serialize)]
pub struct ModuleInfo {
    /// Module name (file stem)
    pub name: String,

    /// Module path
    pub path: PathBuf,

    /// When it was opened
    pub loaded_at: DateTime<Utc>,
}

#[derive(Debug)]
struct LoadedModule {
    info: ModuleInfo,
    library: Option<Library>,
}

/// Something [`Loader::discover`] found under the plugin root
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Discovered {
    /// A plugin source directory
    Directory {
        /// Directory name
        name: String,
        /// Directory path
        path: PathBuf,
    },

    /// A standalone compiled module
    Artifact {
        /// File stem
        name: String,
        /// File path
        path: PathBuf,
    },
}

impl Discovered {
    /// Name used in logs and failure reports
    pub fn name(&self) -> &str {
        match self {
            Self::Directory { name, .. } | Self::Artifact { name, .. } => name,
        }
    }

    /// Directory or file path
    pub fn path(&self) -> &Path {
        match self {
            Self::Directory { path, .. } | Self::Artifact { path, .. } => path,
        }
    }
}

/// Where a loaded plugin came from
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "path", rename_all = "lowercase")]
pub enum PluginSource {
    /// Compiled from a source directory
    Directory(PathBuf),

    /// Loaded from a standalone module file
    Artifact(PathBuf),
}

impl PluginSource {
    /// Directory or module path
    pub fn path(&self) -> &Path {
        match self {
            Self::Directory(path) | Self::Artifact(path) => path,
        }
    }

    /// Name used in logs and failure reports
    pub fn label(&self) -> String {
        let name = match self {
            Self::Directory(path) => path.file_name(),
            Self::Artifact(path) => path.file_stem(),
        };
        name.map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path().display().to_string())
    }
}

/// An instance fresh out of its module, not yet initialized
#[derive(Debug)]
pub struct LoadedPlugin {
    /// The instance
    pub plugin: Box<dyn Plugin>,

    /// Where it came from
    pub source: PluginSource,

    /// Module file it was constructed from
    pub artifact: PathBuf,

    /// Whether the toolchain ran to produce the module
    pub recompiled: bool,
}

/// Opens compiled modules and constructs plugin instances
pub struct Loader {
    platform: Platform,
    opener: Arc<dyn ModuleOpener>,
    modules: HashMap<String, LoadedModule>,
    retired: usize,
}

impl fmt::Debug for Loader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Loader")
            .field("platform", &self.platform)
            .field("opener", &self.opener)
            .field("modules", &self.modules.keys().collect::<Vec<_>>())
            .field("retired", &self.retired)
            .finish()
    }
}

impl Loader {
    /// Create a loader
    pub fn new(opener: Arc<dyn ModuleOpener>, platform: Platform) -> Self {
        Self {
            platform,
            opener,
            modules: HashMap::new(),
            retired: 0,
        }
    }

    /// Host platform as seen by the loader
    pub fn platform(&self) -> &Platform {
        &self.platform
    }

    /// Fail unless the platform can load modules
    pub fn check_platform(&self) -> Result<()> {
        if self.platform.is_supported() {
            Ok(())
        } else {
            Err(PluginRuntimeError::PlatformUnsupported {
                os: self.platform.os.clone(),
                arch: self.platform.arch.clone(),
            })
        }
    }

    /// Open a module file and construct its plugin
    pub fn load_from_file(&mut self, path: &Path) -> Result<Box<dyn Plugin>> {
        self.check_platform()?;

        if !path.is_file() {
            return Err(PluginRuntimeError::load(path, "plugin file not found"));
        }

        let module = self.opener.open(path)?;
        let OpenedModule {
            library,
            api_version,
            rustc_version,
            constructor,
        } = module;

        // Track before checking so a rejected library is never closed either
        self.track(path, library);

        if api_version != PLUGIN_API_VERSION {
            return Err(PluginRuntimeError::load(
                path,
                format!(
                    "built against plugin API v{api_version}, host provides v{PLUGIN_API_VERSION}"
                ),
            ));
        }

        if rustc_version != RUSTC_VERSION {
            return Err(PluginRuntimeError::load(
                path,
                format!("built with {rustc_version}, host was built with {RUSTC_VERSION}"),
            ));
        }

        let plugin = panic::catch_unwind(AssertUnwindSafe(|| constructor()))
            .map_err(|_| PluginRuntimeError::load(path, "plugin constructor panicked"))?
            .ok_or_else(|| PluginRuntimeError::load(path, "plugin constructor returned nothing"))?;

        debug!(path = %path.display(), plugin = %plugin.info().name, "Plugin constructed");
        Ok(plugin)
    }

    /// Compile a source directory (with caching) and load the result
    pub async fn load_from_directory(
        &mut self,
        dir: &Path,
        name: &str,
        compiler: &Compiler,
    ) -> Result<LoadedPlugin> {
        self.check_platform()?;

        if !dir.is_dir() {
            return Err(PluginRuntimeError::not_found(format!(
                "plugin directory {}",
                dir.display()
            )));
        }

        let outcome = compiler.compile_with_cache(dir, name).await?;
        if outcome.recompiled {
            compiler.validate_compilation(&outcome.artifact.path).await?;
        }

        let plugin = self.load_from_file(&outcome.artifact.path)?;

        Ok(LoadedPlugin {
            plugin,
            source: PluginSource::Directory(dir.to_path_buf()),
            artifact: outcome.artifact.path,
            recompiled: outcome.recompiled,
        })
    }

    /// Find plugin directories and standalone modules under `root`
    ///
    /// Directories qualify when they are not hidden and contain a manifest,
    /// a `Cargo.toml` or `src/lib.rs`. A standalone module is skipped when a
    /// directory of the same name exists. The root is created if missing.
    pub fn discover(&self, root: &Path) -> Result<Vec<Discovered>> {
        fs::create_dir_all(root)?;

        let mut dirs = Vec::new();
        let mut artifacts = Vec::new();

        for entry in fs::read_dir(root)? {
            let entry = entry?;
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()).map(str::to_string) else {
                continue;
            };
            if name.starts_with('.') {
                continue;
            }

            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                if looks_like_plugin(&path) {
                    dirs.push(Discovered::Directory { name, path });
                } else {
                    debug!(dir = %path.display(), "Skipping directory without plugin sources");
                }
            } else if path.extension().map_or(false, |ext| ext == DLL_EXTENSION) {
                let Some(stem) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string)
                else {
                    continue;
                };
                artifacts.push(Discovered::Artifact { name: stem, path });
            }
        }

        dirs.sort_by(|a, b| a.name().cmp(b.name()));
        artifacts.sort_by(|a, b| a.name().cmp(b.name()));

        artifacts.retain(|artifact| {
            let shadowed = dirs.iter().any(|dir| dir.name() == artifact.name());
            if shadowed {
                debug!(artifact = %artifact.path().display(), "Skipping module shadowed by a directory");
            }
            !shadowed
        });

        dirs.extend(artifacts);
        Ok(dirs)
    }

    /// Load each discovered item, collecting failures instead of stopping
    pub async fn load_each(
        &mut self,
        items: Vec<Discovered>,
        compiler: &Compiler,
    ) -> (Vec<LoadedPlugin>, Vec<(String, PluginRuntimeError)>) {
        let mut loaded = Vec::new();
        let mut failures = Vec::new();

        for item in items {
            let result = match &item {
                Discovered::Directory { name, path } => {
                    self.load_from_directory(path, name, compiler).await
                }
                Discovered::Artifact { path, .. } => {
                    self.load_from_file(path).map(|plugin| LoadedPlugin {
                        plugin,
                        source: PluginSource::Artifact(path.clone()),
                        artifact: path.clone(),
                        recompiled: false,
                    })
                }
            };

            match result {
                Ok(plugin) => loaded.push(plugin),
                Err(e) => {
                    warn!(item = %item.name(), error = %e, "Failed to load plugin");
                    failures.push((item.name().to_string(), e));
                }
            }
        }

        (loaded, failures)
    }

    /// Discover and load everything under `root`
    pub async fn load_all(
        &mut self,
        root: &Path,
        compiler: &Compiler,
    ) -> Result<(Vec<LoadedPlugin>, Vec<(String, PluginRuntimeError)>)> {
        self.check_platform()?;
        let items = self.discover(root)?;
        Ok(self.load_each(items, compiler).await)
    }

    /// Modules opened so far
    pub fn open_modules(&self) -> Vec<ModuleInfo> {
        let mut modules: Vec<_> = self.modules.values().map(|m| m.info.clone()).collect();
        modules.sort_by(|a, b| a.name.cmp(&b.name));
        modules
    }

    /// Number of handles replaced by newer opens of the same module
    pub fn retired_count(&self) -> usize {
        self.retired
    }

    /// Stop tracking a module; its library stays mapped
    pub fn release(&mut self, name: &str) {
        if let Some(module) = self.modules.remove(name) {
            self.retire(module);
        }
    }

    fn track(&mut self, path: &Path, library: Option<Library>) {
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();

        let module = LoadedModule {
            info: ModuleInfo {
                name: name.clone(),
                path: path.to_path_buf(),
                loaded_at: Utc::now(),
            },
            library,
        };

        if let Some(previous) = self.modules.insert(name, module) {
            self.retire(previous);
        }
        info!(module = %path.display(), "Module opened");
    }

    fn retire(&mut self, module: LoadedModule) {
        if let Some(library) = module.library {
            std::mem::forget(library);
        }
        self.retired += 1;
        debug!(module = %module.info.name, "Module handle retired");
    }
}

impl Drop for Loader {
    fn drop(&mut self) {
        for (_, module) in self.modules.drain() {
            if let Some(library) = module.library {
                std::mem::forget(library);
            }
        }
    }
}

fn looks_like_plugin(dir: &Path) -> bool {
    dir.join(MANIFEST_FILE).is_file()
        || dir.join("Cargo.toml").is_file()
        || dir.join("src/lib.rs").is_file()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeOpener, FakeToolchain};
    use kiln_config::ApiDependency;
    use kiln_plugin_api::testing::MockPlugin;

    fn loader(opener: Arc<FakeOpener>) -> Loader {
        Loader::new(opener, Platform::new("linux", "x86_64"))
    }

    fn artifact(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(format!("{name}.{DLL_EXTENSION}"));
        fs::write(&path, "fake").unwrap();
        path
    }

    #[test]
    fn test_supported_platforms() {
        assert!(Platform::new("linux", "x86_64").is_supported());
        assert!(Platform::new("macos", "aarch64").is_supported());
        assert!(Platform::new("freebsd", "x86_64").is_supported());
        assert!(!Platform::new("windows", "x86_64").is_supported());
        assert_eq!(Platform::new("linux", "x86_64").to_string(), "linux/x86_64");
    }

    #[test]
    fn test_unsupported_platform_skips_opener() {
        let opener = Arc::new(FakeOpener::new());
        let mut loader = Loader::new(opener.clone(), Platform::new("windows", "x86_64"));

        let err = loader
            .load_from_file(Path::new("/definitely/missing/demo.dll"))
            .unwrap_err();

        assert!(matches!(err, PluginRuntimeError::PlatformUnsupported { .. }));
        assert_eq!(opener.open_count(), 0);
    }

    #[test]
    fn test_load_from_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = artifact(tmp.path(), "demo");
        let opener = Arc::new(FakeOpener::new());
        opener.register_mock("demo", || MockPlugin::new("demo"));

        let mut loader = loader(opener.clone());
        let plugin = loader.load_from_file(&path).unwrap();

        assert_eq!(plugin.info().name, "demo");
        assert_eq!(opener.open_count(), 1);
        assert_eq!(loader.open_modules()[0].name, "demo");
    }

    #[test]
    fn test_missing_file() {
        let opener = Arc::new(FakeOpener::new());
        let mut loader = loader(opener.clone());

        let err = loader.load_from_file(Path::new("/missing/demo.so")).unwrap_err();
        assert!(matches!(err, PluginRuntimeError::Load { .. }));
        assert_eq!(opener.open_count(), 0);
    }

    #[test]
    fn test_version_mismatch_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let path = artifact(tmp.path(), "old");
        let opener = Arc::new(FakeOpener::new());
        opener.register_mock("old", || MockPlugin::new("old"));
        opener.set_api_version("old", PLUGIN_API_VERSION + 1);

        let err = loader(opener).load_from_file(&path).unwrap_err();
        assert!(err.to_string().contains("plugin API"));
    }

    #[test]
    fn test_constructor_failures() {
        let tmp = tempfile::tempdir().unwrap();
        let empty = artifact(tmp.path(), "empty");
        let panics = artifact(tmp.path(), "panics");
        let opener = Arc::new(FakeOpener::new());
        opener.register("empty", || None);
        opener.register("panics", || panic!("boom"));

        let mut loader = loader(opener);
        assert!(loader
            .load_from_file(&empty)
            .unwrap_err()
            .to_string()
            .contains("returned nothing"));
        assert!(loader
            .load_from_file(&panics)
            .unwrap_err()
            .to_string()
            .contains("panicked"));
    }

    #[test]
    fn test_reopen_retires_previous_handle() {
        let tmp = tempfile::tempdir().unwrap();
        let path = artifact(tmp.path(), "demo");
        let opener = Arc::new(FakeOpener::new());
        opener.register_mock("demo", || MockPlugin::new("demo"));

        let mut loader = loader(opener);
        loader.load_from_file(&path).unwrap();
        loader.load_from_file(&path).unwrap();

        assert_eq!(loader.open_modules().len(), 1);
        assert_eq!(loader.retired_count(), 1);

        loader.release("demo");
        assert!(loader.open_modules().is_empty());
        assert_eq!(loader.retired_count(), 2);
    }

    #[test]
    fn test_discover() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();

        for (dir, file) in [
            ("alpha", "plugin.json"),
            ("beta", "Cargo.toml"),
            ("gamma/src", "lib.rs"),
            (".build", "Cargo.toml"),
            ("docs", "README.md"),
        ] {
            fs::create_dir_all(root.join(dir)).unwrap();
            fs::write(root.join(dir).join(file), "").unwrap();
        }
        artifact(root, "alpha");
        artifact(root, "standalone");

        let found = Loader::new(Arc::new(FakeOpener::new()), Platform::current())
            .discover(root)
            .unwrap();
        let names: Vec<_> = found.iter().map(Discovered::name).collect();

        assert_eq!(names, vec!["alpha", "beta", "gamma", "standalone"]);
        assert!(matches!(found[3], Discovered::Artifact { .. }));
    }

    #[tokio::test]
    async fn test_load_all_collects_failures() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("plugins");
        for name in ["good", "broken"] {
            fs::create_dir_all(root.join(name).join("src")).unwrap();
            fs::write(root.join(name).join("src/lib.rs"), "").unwrap();
        }

        let opener = Arc::new(FakeOpener::new());
        opener.register_mock("good", || MockPlugin::new("good"));
        let compiler = Compiler::new(
            root.join(".build"),
            Arc::new(FakeToolchain::new()),
            ApiDependency::default(),
        );

        let mut loader = loader(opener);
        let (loaded, failures) = loader.load_all(&root, &compiler).await.unwrap();

        assert_eq!(loaded.len(), 1);
        assert!(loaded[0].recompiled);
        assert_eq!(
            loaded[0].source,
            PluginSource::Directory(root.join("good"))
        );
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, "broken");
    }
}
