//! # Kiln Plugin API
//!
//! The contract between the Kiln host and the plugins it compiles and loads
//! at runtime.
//!
//! A plugin is a `cdylib` crate that implements [`Plugin`] and exports a
//! constructor with [`export_plugin!`]. The host reads the exported
//! [`PluginDeclaration`], checks that it was built against the same contract
//! version and compiler, then calls the constructor.
//!
//! ## Example
//!
//! ```rust,ignore
//! use kiln_plugin_api::prelude::*;
//!
//! #[derive(Debug, Default)]
//! struct HelloWorld;
//!
//! impl Plugin for HelloWorld {
//!     fn info(&self) -> PluginInfo {
//!         PluginInfo::new("hello-world", "1.0.0")
//!     }
//!
//!     fn initialize(&mut self, _deps: &PluginDependencies) -> Result<(), PluginError> {
//!         Ok(())
//!     }
//!
//!     fn register_routes(&self, router: &mut RouterGroup) {
//!         router.get("/", |_| PluginResponse::text("Hello, world!"));
//!     }
//! }
//!
//! export_plugin!(HelloWorld::default);
//! ```

#![deny(unsafe_code)]
#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]

pub mod admin;
pub mod declaration;
pub mod error;
pub mod plugin;
pub mod routes;

#[cfg(feature = "testing")]
pub mod testing;

// Re-export commonly used types
pub use admin::{AdminMenuItem, PluginSetting, SettingValue};
pub use declaration::{
    PluginConstructor, PluginDeclaration, ENTRY_SYMBOL, PLUGIN_API_VERSION, RUSTC_VERSION,
};
pub use error::PluginError;
pub use plugin::{HostHandle, Plugin, PluginDependencies, PluginInfo};
pub use routes::{Handler, PluginRequest, PluginResponse, Route, RouterGroup};

// Handlers name these types directly
pub use bytes::Bytes;
pub use http::{HeaderMap, Method, StatusCode};

/// Prelude module with commonly used types
pub mod prelude {
    pub use crate::admin::{AdminMenuItem, PluginSetting, SettingValue};
    pub use crate::error::PluginError;
    pub use crate::export_plugin;
    pub use crate::plugin::{Plugin, PluginDependencies, PluginInfo};
    pub use crate::routes::{PluginRequest, PluginResponse, RouterGroup};
    pub use http::{Method, StatusCode};
}
