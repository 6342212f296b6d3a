//! In-process stand-ins for the toolchain and the dynamic loader
//!
//! Enabled with the `testing` feature.

use crate::error::{PluginRuntimeError, Result};
use crate::loader::{ModuleOpener, OpenedModule};
use crate::toolchain::{BuildRequest, Toolchain, ToolchainError, ToolchainOutput};
use async_trait::async_trait;
use kiln_plugin_api::testing::MockPlugin;
use kiln_plugin_api::{Plugin, ENTRY_SYMBOL, PLUGIN_API_VERSION, RUSTC_VERSION};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Toolchain that writes placeholder artifacts instead of compiling
#[derive(Debug)]
pub struct FakeToolchain {
    builds: AtomicUsize,
    built: Mutex<Vec<String>>,
    failure: Mutex<Option<String>>,
    skip_output: AtomicBool,
    symbols: Mutex<String>,
    delay: Mutex<Option<Duration>>,
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl Default for FakeToolchain {
    fn default() -> Self {
        Self {
            builds: AtomicUsize::new(0),
            built: Mutex::new(Vec::new()),
            failure: Mutex::new(None),
            skip_output: AtomicBool::new(false),
            symbols: Mutex::new(format!("0000000000001000 D {ENTRY_SYMBOL}")),
            delay: Mutex::new(None),
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }
}

impl FakeToolchain {
    /// Create a toolchain whose builds succeed
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of builds attempted
    pub fn build_count(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }

    /// Plugin names in build order
    pub fn built_plugins(&self) -> Vec<String> {
        self.built.lock().clone()
    }

    /// Fail every following build with `output` as the compiler output
    pub fn fail_with(&self, output: &str) {
        *self.failure.lock() = Some(output.to_string());
    }

    /// Let builds succeed again
    pub fn clear_failure(&self) {
        *self.failure.lock() = None;
    }

    /// Report success without writing the artifact
    pub fn skip_output(&self, skip: bool) {
        self.skip_output.store(skip, Ordering::SeqCst);
    }

    /// Make every build take at least `delay`
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    /// Builds currently running
    pub fn active_builds(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Most builds ever running at the same time
    pub fn peak_concurrent_builds(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Symbol listing returned for every artifact
    pub fn set_symbols(&self, symbols: &str) {
        *self.symbols.lock() = symbols.to_string();
    }
}

#[async_trait]
impl Toolchain for FakeToolchain {
    async fn build(&self, request: &BuildRequest) -> std::result::Result<ToolchainOutput, ToolchainError> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        self.built.lock().push(request.plugin_name.clone());

        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(active, Ordering::SeqCst);
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let result = self.finish_build(request).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn exported_symbols(&self, _artifact: &Path) -> std::result::Result<String, ToolchainError> {
        Ok(self.symbols.lock().clone())
    }

    async fn version(&self) -> std::result::Result<String, ToolchainError> {
        Ok("cargo 0.0.0 (fake)".to_string())
    }
}

impl FakeToolchain {
    async fn finish_build(
        &self,
        request: &BuildRequest,
    ) -> std::result::Result<ToolchainOutput, ToolchainError> {
        let failure = self.failure.lock().clone();
        if let Some(output) = failure {
            return Err(ToolchainError::Failed {
                command: "cargo rustc".to_string(),
                status: "exit status: 101".to_string(),
                output,
            });
        }

        if !self.skip_output.load(Ordering::SeqCst) {
            let install_err = |source| ToolchainError::Install {
                path: request.output.display().to_string(),
                source,
            };
            if let Some(parent) = request.output.parent() {
                tokio::fs::create_dir_all(parent).await.map_err(install_err)?;
            }
            tokio::fs::write(&request.output, request.plugin_name.as_bytes())
                .await
                .map_err(install_err)?;
        }

        Ok(ToolchainOutput {
            artifact: request.output.clone(),
            log: format!("Compiling {} (fake)", request.plugin_name),
        })
    }
}

type Factory = Arc<dyn Fn() -> Option<Box<dyn Plugin>> + Send + Sync>;

/// Module opener that constructs registered plugins by file stem
///
/// The artifact file only has to exist; its contents are ignored.
#[derive(Default)]
pub struct FakeOpener {
    factories: Mutex<HashMap<String, Factory>>,
    api_versions: Mutex<HashMap<String, u32>>,
    opens: AtomicUsize,
}

impl fmt::Debug for FakeOpener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.factories.lock().keys().cloned().collect();
        names.sort();
        f.debug_struct("FakeOpener")
            .field("modules", &names)
            .field("opens", &self.open_count())
            .finish()
    }
}

impl FakeOpener {
    /// Create an opener with no modules
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the constructor for modules named `stem`
    pub fn register<F>(&self, stem: &str, constructor: F)
    where
        F: Fn() -> Option<Box<dyn Plugin>> + Send + Sync + 'static,
    {
        self.factories
            .lock()
            .insert(stem.to_string(), Arc::new(constructor));
    }

    /// Register a [`MockPlugin`] factory for modules named `stem`
    pub fn register_mock<F>(&self, stem: &str, factory: F)
    where
        F: Fn() -> MockPlugin + Send + Sync + 'static,
    {
        self.register(stem, move || Some(Box::new(factory()) as Box<dyn Plugin>));
    }

    /// Make modules named `stem` declare a different contract version
    pub fn set_api_version(&self, stem: &str, version: u32) {
        self.api_versions.lock().insert(stem.to_string(), version);
    }

    /// Number of `open` calls
    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

impl ModuleOpener for FakeOpener {
    fn open(&self, path: &Path) -> Result<OpenedModule> {
        self.opens.fetch_add(1, Ordering::SeqCst);

        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();

        let factory = self
            .factories
            .lock()
            .get(&stem)
            .cloned()
            .ok_or_else(|| PluginRuntimeError::load(path, "no module registered under this name"))?;

        let api_version = self
            .api_versions
            .lock()
            .get(&stem)
            .copied()
            .unwrap_or(PLUGIN_API_VERSION);

        Ok(OpenedModule {
            library: None,
            api_version,
            rustc_version: RUSTC_VERSION.to_string(),
            constructor: Box::new(move || factory()),
        })
    }
}
