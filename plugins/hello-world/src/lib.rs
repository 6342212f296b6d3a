//! Hello World plugin
//!
//! Reference plugin for the Kiln host. Serves a greeting under
//! `/plugins/hello-world`, contributes an admin menu entry and exposes a
//! few settings.

use kiln_plugin_api::prelude::*;
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

const NAME: &str = "hello-world";
const DEFAULT_GREETING: &str = "Hello";

/// Greeting plugin
#[derive(Debug)]
pub struct HelloWorld {
    greeting: String,
    visits: Arc<AtomicU64>,
    initialized: bool,
}

impl Default for HelloWorld {
    fn default() -> Self {
        Self {
            greeting: DEFAULT_GREETING.to_string(),
            visits: Arc::new(AtomicU64::new(0)),
            initialized: false,
        }
    }
}

impl Plugin for HelloWorld {
    fn info(&self) -> PluginInfo {
        PluginInfo::new(NAME, env!("CARGO_PKG_VERSION"))
            .with_description("Greets visitors")
            .with_author("Kiln Contributors")
    }

    fn initialize(&mut self, deps: &PluginDependencies) -> Result<(), PluginError> {
        if self.initialized {
            return Err(PluginError::invalid_state("already initialized"));
        }

        // Hosts may carry a per-plugin section in their configuration
        if let Some(greeting) = deps.config_value("/hello_world/greeting") {
            self.greeting = greeting
                .as_str()
                .filter(|g| !g.trim().is_empty())
                .ok_or_else(|| PluginError::config("greeting must be a non-empty string"))?
                .to_string();
        }

        self.initialized = true;
        Ok(())
    }

    fn register_routes(&self, router: &mut RouterGroup) {
        let greeting = self.greeting.clone();
        let visits = Arc::clone(&self.visits);
        router.get("/", move |_req| {
            visits.fetch_add(1, Ordering::Relaxed);
            PluginResponse::text(format!("{greeting}, world!"))
        });

        let greeting = self.greeting.clone();
        let visits = Arc::clone(&self.visits);
        router.get("/greet/:name", move |req| {
            visits.fetch_add(1, Ordering::Relaxed);
            let name = req.param("name").unwrap_or("stranger");
            let message = match req.query_param("shout") {
                Some("true") => format!("{greeting}, {name}!").to_uppercase(),
                _ => format!("{greeting}, {name}!"),
            };
            PluginResponse::json(&json!({ "message": message }))
        });

        router.post("/echo", |req| match req.json::<serde_json::Value>() {
            Ok(body) => PluginResponse::json(&json!({ "echo": body })),
            Err(e) => PluginResponse::error(StatusCode::BAD_REQUEST, e.to_string()),
        });

        let visits = Arc::clone(&self.visits);
        router.get("/stats", move |_req| {
            PluginResponse::json(&json!({ "visits": visits.load(Ordering::Relaxed) }))
        });
    }

    fn admin_menu_items(&self) -> Vec<AdminMenuItem> {
        vec![AdminMenuItem::new("hello-world", "Hello World", "/plugins/hello-world")
            .icon("hand-wave")
            .order(50)]
    }

    fn settings(&self) -> Vec<PluginSetting> {
        vec![
            PluginSetting::text("greeting", "Greeting", self.greeting.clone())
                .describe("Word used to greet visitors")
                .required(),
            PluginSetting::boolean("count_visits", "Count visits", true),
            PluginSetting::select("style", "Style", "plain", ["plain", "fancy"]),
        ]
    }

    fn shutdown(&mut self) -> Result<(), PluginError> {
        if !self.initialized {
            return Err(PluginError::invalid_state("not initialized"));
        }
        self.initialized = false;
        Ok(())
    }
}

export_plugin!(HelloWorld::default);
