//! Mock implementations for testing

use crate::admin::{AdminMenuItem, PluginSetting};
use crate::error::{PluginError, Result};
use crate::plugin::{Plugin, PluginDependencies, PluginInfo};
use crate::routes::{PluginResponse, RouterGroup};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Debug, Default)]
struct Calls {
    initialize: AtomicUsize,
    shutdown: AtomicUsize,
    last_config: Mutex<Option<serde_json::Value>>,
}

/// Observes the lifecycle calls made on a [`MockPlugin`]
///
/// Probes stay valid after the plugin itself has been handed to a host and
/// dropped.
#[derive(Debug, Clone)]
pub struct MockProbe {
    calls: Arc<Calls>,
}

impl MockProbe {
    /// Number of `initialize` calls
    pub fn initialize_count(&self) -> usize {
        self.calls.initialize.load(Ordering::SeqCst)
    }

    /// Number of `shutdown` calls
    pub fn shutdown_count(&self) -> usize {
        self.calls.shutdown.load(Ordering::SeqCst)
    }

    /// Configuration passed to the most recent `initialize`
    pub fn last_config(&self) -> Option<serde_json::Value> {
        self.calls.last_config.lock().clone()
    }
}

/// Mock plugin for testing
///
/// Registers a single `GET /ping` route answering `pong`.
#[derive(Debug, Clone)]
pub struct MockPlugin {
    info: PluginInfo,
    fail_initialize: bool,
    fail_shutdown: bool,
    menu_items: Vec<AdminMenuItem>,
    settings: Vec<PluginSetting>,
    calls: Arc<Calls>,
}

impl MockPlugin {
    /// Create a new mock plugin at version `1.0.0`
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            info: PluginInfo::new(name, "1.0.0").with_description("Mock plugin"),
            fail_initialize: false,
            fail_shutdown: false,
            menu_items: Vec::new(),
            settings: Vec::new(),
            calls: Arc::new(Calls::default()),
        }
    }

    /// Set the reported version
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.info.version = version.into();
        self
    }

    /// Make `initialize` fail
    pub fn failing_initialize(mut self) -> Self {
        self.fail_initialize = true;
        self
    }

    /// Make `shutdown` fail
    pub fn failing_shutdown(mut self) -> Self {
        self.fail_shutdown = true;
        self
    }

    /// Contribute an admin menu item
    pub fn with_menu_item(mut self, item: AdminMenuItem) -> Self {
        self.menu_items.push(item);
        self
    }

    /// Expose a setting
    pub fn with_setting(mut self, setting: PluginSetting) -> Self {
        self.settings.push(setting);
        self
    }

    /// Probe sharing this mock's call counters
    pub fn probe(&self) -> MockProbe {
        MockProbe {
            calls: self.calls.clone(),
        }
    }
}

impl Plugin for MockPlugin {
    fn info(&self) -> PluginInfo {
        self.info.clone()
    }

    fn initialize(&mut self, deps: &PluginDependencies) -> Result<()> {
        self.calls.initialize.fetch_add(1, Ordering::SeqCst);
        *self.calls.last_config.lock() = Some(deps.config.clone());

        if self.fail_initialize {
            return Err(PluginError::init(format!("{} refused to start", self.info.name)));
        }
        Ok(())
    }

    fn register_routes(&self, router: &mut RouterGroup) {
        router.get("/ping", |_| PluginResponse::text("pong"));
    }

    fn admin_menu_items(&self) -> Vec<AdminMenuItem> {
        self.menu_items.clone()
    }

    fn settings(&self) -> Vec<PluginSetting> {
        self.settings.clone()
    }

    fn shutdown(&mut self) -> Result<()> {
        self.calls.shutdown.fetch_add(1, Ordering::SeqCst);

        if self.fail_shutdown {
            return Err(PluginError::shutdown("mock shutdown failure"));
        }
        Ok(())
    }
}
