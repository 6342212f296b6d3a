//! Hot reload support for plugins
//!
//! Watches the plugin root and refreshes a plugin when a source file in its
//! directory is created or modified. Changes are debounced: a directory is
//! refreshed once the tree has been quiet for the debounce interval.

use crate::error::{PluginRuntimeError, Result};
use crate::manager::PluginManager;
use crate::manifest::MANIFEST_FILE;
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Hot reload watcher for plugin source directories
#[derive(Debug)]
pub struct HotReloadWatcher {
    /// Plugin manager
    manager: Arc<PluginManager>,

    /// Debounce duration (to avoid a rebuild per saved file)
    debounce: Duration,

    /// File watcher
    watcher: Option<RecommendedWatcher>,

    /// Event loop
    task: Option<JoinHandle<()>>,
}

impl HotReloadWatcher {
    /// Create a watcher using the manager's configured debounce
    pub fn new(manager: Arc<PluginManager>) -> Self {
        let debounce = manager.config().watch.debounce;
        Self {
            manager,
            debounce,
            watcher: None,
            task: None,
        }
    }

    /// Set debounce duration
    pub fn with_debounce(mut self, duration: Duration) -> Self {
        self.debounce = duration;
        self
    }

    /// Whether the watcher is running
    pub fn is_running(&self) -> bool {
        self.watcher.is_some()
    }

    /// Start watching the plugin root
    pub fn start(&mut self) -> Result<()> {
        if self.is_running() {
            return Ok(());
        }

        let root = canonical_dir(self.manager.plugin_root())?;
        let build_dir = canonical_dir(self.manager.compiler().build_dir())?;

        let (tx, rx) = mpsc::unbounded_channel();
        let mut watcher = RecommendedWatcher::new(
            move |res| {
                let _ = tx.send(res);
            },
            Config::default(),
        )
        .map_err(|e| PluginRuntimeError::other(format!("Failed to create file watcher: {e}")))?;

        watcher
            .watch(&root, RecursiveMode::Recursive)
            .map_err(|e| PluginRuntimeError::other(format!("Failed to watch directory: {e}")))?;

        info!(root = %root.display(), debounce = ?self.debounce, "Hot reload watcher started");

        let task = tokio::spawn(watch_loop(
            Arc::clone(&self.manager),
            root,
            build_dir,
            self.debounce,
            rx,
        ));

        self.watcher = Some(watcher);
        self.task = Some(task);
        Ok(())
    }

    /// Stop watching
    pub fn stop(&mut self) {
        self.watcher = None;
        if let Some(task) = self.task.take() {
            task.abort();
        }
        info!("Hot reload watcher stopped");
    }
}

impl Drop for HotReloadWatcher {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

fn canonical_dir(path: &Path) -> Result<PathBuf> {
    fs::create_dir_all(path)?;
    Ok(path.canonicalize()?)
}

async fn watch_loop(
    manager: Arc<PluginManager>,
    root: PathBuf,
    build_dir: PathBuf,
    debounce: Duration,
    mut rx: mpsc::UnboundedReceiver<notify::Result<Event>>,
) {
    let mut carried = BTreeSet::new();

    loop {
        let mut pending = std::mem::take(&mut carried);
        if pending.is_empty() {
            match rx.recv().await {
                Some(res) => collect(&mut pending, res, &root, &build_dir),
                None => break,
            }
        }

        let mut closed = false;
        loop {
            match tokio::time::timeout(debounce, rx.recv()).await {
                Ok(Some(res)) => collect(&mut pending, res, &root, &build_dir),
                Ok(None) => {
                    closed = true;
                    break;
                }
                Err(_) => break,
            }
        }

        for dir in &pending {
            match manager.refresh_directory(dir).await {
                Ok(info) => info!(plugin = %info.name, directory = %dir, "Plugin refreshed"),
                Err(e) => error!(directory = %dir, error = %e, "Failed to refresh plugin"),
            }
        }

        // Compiling writes into the plugin directory; those events are not edits
        while let Ok(res) = rx.try_recv() {
            collect(&mut carried, res, &root, &build_dir);
        }
        carried.retain(|dir| !pending.contains(dir));

        if closed {
            break;
        }
    }

    debug!("Hot reload event loop finished");
}

fn collect(pending: &mut BTreeSet<String>, res: notify::Result<Event>, root: &Path, build_dir: &Path) {
    let event = match res {
        Ok(event) => event,
        Err(e) => {
            warn!(error = %e, "File watcher error");
            return;
        }
    };

    if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
        return;
    }

    for path in &event.paths {
        if let Some(dir) = plugin_dir_for(root, build_dir, path) {
            debug!(path = %path.display(), directory = %dir, "Plugin source changed");
            pending.insert(dir);
        }
    }
}

/// Plugin directory name a changed path belongs to, if the change matters
///
/// Only `*.rs`, `Cargo.toml` and `plugin.json` count. Paths in the build
/// directory, in hidden directories or under a `target/` directory are
/// ignored.
fn plugin_dir_for(root: &Path, build_dir: &Path, path: &Path) -> Option<String> {
    if path.starts_with(build_dir) {
        return None;
    }

    let relative = path.strip_prefix(root).ok()?;
    let mut components = relative.components();
    let dir = match components.next()? {
        Component::Normal(dir) => dir.to_str()?,
        _ => return None,
    };
    if dir.starts_with('.') {
        return None;
    }

    let inner = components.as_path();
    if inner.as_os_str().is_empty() {
        return None;
    }

    let skipped = inner.parent().map_or(false, |parent| {
        parent.components().any(|c| {
            let name = c.as_os_str().to_string_lossy();
            name == "target" || name.starts_with('.')
        })
    });
    if skipped {
        return None;
    }

    let file = path.file_name()?.to_str()?;
    let watched = file == MANIFEST_FILE
        || file == "Cargo.toml"
        || path.extension().map_or(false, |ext| ext == "rs");

    watched.then(|| dir.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::Platform;
    use crate::testing::{FakeOpener, FakeToolchain};
    use kiln_config::PluginsConfig;
    use kiln_plugin_api::testing::MockPlugin;
    use notify::event::{CreateKind, DataChange, ModifyKind, RemoveKind};

    const ROOT: &str = "/srv/plugins";
    const BUILD: &str = "/srv/plugins/.build";

    fn dir_for(path: &str) -> Option<String> {
        plugin_dir_for(Path::new(ROOT), Path::new(BUILD), Path::new(path))
    }

    #[test]
    fn test_plugin_dir_for() {
        assert_eq!(dir_for("/srv/plugins/hello/src/lib.rs"), Some("hello".into()));
        assert_eq!(dir_for("/srv/plugins/hello/src/a/b.rs"), Some("hello".into()));
        assert_eq!(dir_for("/srv/plugins/hello/Cargo.toml"), Some("hello".into()));
        assert_eq!(dir_for("/srv/plugins/hello/plugin.json"), Some("hello".into()));

        assert_eq!(dir_for("/srv/plugins/hello/Cargo.lock"), None);
        assert_eq!(dir_for("/srv/plugins/hello/README.md"), None);
        assert_eq!(dir_for("/srv/plugins/hello/target/debug/build.rs"), None);
        assert_eq!(dir_for("/srv/plugins/hello/.git/hooks/x.rs"), None);
        assert_eq!(dir_for("/srv/plugins/.build/target/lib.rs"), None);
        assert_eq!(dir_for("/srv/plugins/hello.so"), None);
        assert_eq!(dir_for("/srv/plugins/hello"), None);
        assert_eq!(dir_for("/elsewhere/hello/src/lib.rs"), None);
    }

    #[test]
    fn test_collect_filters_event_kinds() {
        let mut pending = BTreeSet::new();
        let root = Path::new(ROOT);
        let build = Path::new(BUILD);

        let modify = Event::new(EventKind::Modify(ModifyKind::Data(DataChange::Content)))
            .add_path(PathBuf::from("/srv/plugins/alpha/src/lib.rs"));
        let create = Event::new(EventKind::Create(CreateKind::File))
            .add_path(PathBuf::from("/srv/plugins/beta/src/lib.rs"));
        let remove = Event::new(EventKind::Remove(RemoveKind::File))
            .add_path(PathBuf::from("/srv/plugins/gamma/src/lib.rs"));

        collect(&mut pending, Ok(modify), root, build);
        collect(&mut pending, Ok(create), root, build);
        collect(&mut pending, Ok(remove), root, build);
        collect(&mut pending, Err(notify::Error::generic("boom")), root, build);

        assert_eq!(
            pending.into_iter().collect::<Vec<_>>(),
            vec!["alpha".to_string(), "beta".to_string()]
        );
    }

    #[tokio::test]
    async fn test_new_source_directory_is_loaded() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("plugins");
        let opener = Arc::new(FakeOpener::new());
        opener.register_mock("watched", || MockPlugin::new("watched"));

        let manager = Arc::new(
            PluginManager::builder(PluginsConfig {
                root_dir: root.clone(),
                ..Default::default()
            })
            .toolchain(Arc::new(FakeToolchain::new()))
            .opener(opener)
            .platform(Platform::new("linux", "x86_64"))
            .build(),
        );

        fs::create_dir_all(root.join("watched/src")).unwrap();

        let mut watcher =
            HotReloadWatcher::new(manager.clone()).with_debounce(Duration::from_millis(50));
        watcher.start().unwrap();
        assert!(watcher.is_running());
        assert!(!manager.is_loaded("watched").await);

        tokio::time::sleep(Duration::from_millis(100)).await;
        fs::write(root.join("watched/src/lib.rs"), "// plugin").unwrap();

        let mut loaded = false;
        for _ in 0..100 {
            if manager.is_loaded("watched").await {
                loaded = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        watcher.stop();
        assert!(loaded, "watcher should load the new plugin directory");
    }
}
