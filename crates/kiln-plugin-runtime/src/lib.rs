//! # Kiln Plugin Runtime
//!
//! Installs, compiles, loads and manages Kiln plugins at runtime.
//!
//! ## Features
//!
//! - **Extractor**: validates and unpacks plugin archives
//! - **Compiler**: builds plugin sources into native modules, with caching
//! - **Loader**: opens native modules and checks their declared contract
//! - **Manager**: install, load, unload, reload and uninstall with rollback
//! - **Hot Reload**: rebuild plugins when their sources change
//! - **Authoring**: scaffold new plugin crates and pack them for install
//!
//! ## Example
//!
//! ```rust,no_run
//! use kiln_plugin_runtime::prelude::*;
//! use std::path::Path;
//!
//! # async fn example() -> Result<()> {
//! let manager = PluginManager::new(kiln_config::PluginsConfig::default());
//!
//! // Load everything already under the plugin root
//! let report = manager.load_plugins().await?;
//! if let Some(err) = report.error() {
//!     eprintln!("{err}");
//! }
//!
//! // Install a packaged plugin
//! manager
//!     .install_plugin_from_zip(Path::new("hello-world.zip"), "hello-world")
//!     .await?;
//!
//! // Serve plugin routes under /plugins/<name>
//! let _app = manager.routes();
//!
//! manager.shutdown_all().await;
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]

pub mod authoring;
pub mod compiler;
pub mod error;
pub mod extractor;
pub mod hot_reload;
pub mod loader;
pub mod manager;
pub mod manifest;
pub mod registry;
pub mod routes;
pub mod toolchain;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use authoring::{package_plugin, scaffold_plugin, Scaffold};
pub use compiler::{CompileOutcome, CompiledArtifact, Compiler, CompilerInfo};
pub use error::{PluginRuntimeError, Result};
pub use extractor::{validate_archive, Extractor, ValidationResult};
pub use hot_reload::HotReloadWatcher;
pub use loader::{
    Discovered, LibloadingOpener, LoadedPlugin, Loader, ModuleInfo, ModuleOpener, OpenedModule,
    Platform, PluginSource,
};
pub use manager::{BulkLoad, InstallReport, PluginManager, PluginManagerBuilder, SystemInfo};
pub use manifest::{validate_plugin_name, PluginManifest};
pub use registry::{PluginEntry, PluginRegistry, PluginSummary};
pub use routes::{build_router, RouteTable};
pub use toolchain::{BuildRequest, CargoToolchain, Toolchain, ToolchainError, ToolchainOutput};

// Re-export plugin API types for convenience
pub use kiln_plugin_api::{
    AdminMenuItem, Plugin, PluginDependencies, PluginError, PluginInfo, PluginSetting,
};

/// Prelude module with commonly used types
pub mod prelude {
    pub use crate::error::{PluginRuntimeError, Result};
    pub use crate::manager::{BulkLoad, PluginManager};
    pub use crate::registry::PluginEntry;
    pub use kiln_plugin_api::prelude::*;
}
