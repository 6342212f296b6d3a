//! End-to-end plugin lifecycle against the fake toolchain and loader

use axum::body::{to_bytes, Body};
use http::{Request, StatusCode};
use kiln_config::{ApiDependency, PluginsConfig};
use kiln_plugin_api::testing::MockPlugin;
use kiln_plugin_api::{AdminMenuItem, PluginSetting};
use kiln_plugin_runtime::testing::{FakeOpener, FakeToolchain};
use kiln_plugin_runtime::{
    package_plugin, scaffold_plugin, Platform, PluginManager, PluginRuntimeError,
};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tower::ServiceExt;
use zip::write::FileOptions;

struct Host {
    tmp: tempfile::TempDir,
    root: PathBuf,
    opener: Arc<FakeOpener>,
    toolchain: Arc<FakeToolchain>,
    manager: PluginManager,
}

fn host() -> Host {
    host_on(Platform::new("linux", "x86_64"))
}

fn host_on(platform: Platform) -> Host {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path().join("plugins");
    let opener = Arc::new(FakeOpener::new());
    let toolchain = Arc::new(FakeToolchain::new());

    let manager = PluginManager::builder(PluginsConfig {
        root_dir: root.clone(),
        ..Default::default()
    })
    .toolchain(toolchain.clone())
    .opener(opener.clone())
    .platform(platform)
    .build();

    Host {
        tmp,
        root,
        opener,
        toolchain,
        manager,
    }
}

fn write_zip(path: &Path, entries: &[(&str, &str)]) {
    let mut zip = zip::ZipWriter::new(File::create(path).unwrap());
    for (name, content) in entries {
        zip.start_file(*name, FileOptions::default()).unwrap();
        zip.write_all(content.as_bytes()).unwrap();
    }
    zip.finish().unwrap();
}

fn plugin_archive(host: &Host, name: &str, version: &str) -> PathBuf {
    let path = host.tmp.path().join(format!("{name}.zip"));
    let manifest = format!(r#"{{"name": "{name}", "version": "{version}"}}"#);
    write_zip(
        &path,
        &[("plugin.json", manifest.as_str()), ("src/lib.rs", "// plugin")],
    );
    path
}

fn source_dir(root: &Path, name: &str) {
    fs::create_dir_all(root.join(name).join("src")).unwrap();
    fs::write(root.join(name).join("src/lib.rs"), "// plugin").unwrap();
}

async fn get(manager: &PluginManager, uri: &str) -> (StatusCode, String) {
    let response = manager
        .routes()
        .oneshot(Request::get(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, String::from_utf8(body.to_vec()).unwrap())
}

#[tokio::test]
async fn test_install_from_archive() {
    let h = host();
    h.opener
        .register_mock("blog", || MockPlugin::new("blog").with_version("2.3.0"));
    let archive = plugin_archive(&h, "blog", "2.3.0");

    let report = h.manager.install_plugin_from_zip(&archive, "blog").await.unwrap();
    assert_eq!(report.name, "blog");
    assert_eq!(report.version, "2.3.0");
    assert!(report.warnings.is_empty());

    let entry = h.manager.get_plugin("blog").await.unwrap();
    assert_eq!(entry.info.version, "2.3.0");
    assert!(h.root.join("blog/src/lib.rs").is_file());
    assert!(!archive.exists(), "installed archive is deleted");

    let (status, body) = get(&h.manager, "/plugins/blog/ping").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "pong");
}

#[tokio::test]
async fn test_scaffolded_plugin_packages_and_installs() {
    let h = host();
    let workspace = h.tmp.path().join("authoring");
    let scaffold = scaffold_plugin(&workspace, "guest-book", &ApiDependency::default()).unwrap();

    let archive = h.tmp.path().join("guest-book.zip");
    package_plugin(&scaffold.dir, Some(&archive)).unwrap();

    h.opener.register_mock("guest-book", || MockPlugin::new("guest-book"));
    let report = h
        .manager
        .install_plugin_from_zip(&archive, "guest-book")
        .await
        .unwrap();
    assert_eq!(report.version, "1.0.0");
    assert!(report.warnings.is_empty());

    // The host writes its own crate manifest for the installed sources
    let cargo = fs::read_to_string(h.root.join("guest-book/Cargo.toml")).unwrap();
    assert!(cargo.contains("cdylib"));
    assert!(scaffold.dir.join("src/lib.rs").is_file(), "sources stay with the author");
}

#[tokio::test]
async fn test_install_without_manifest_warns_and_generates_one() {
    let h = host();
    h.opener.register_mock("bare", || MockPlugin::new("bare"));
    let archive = h.tmp.path().join("bare.zip");
    write_zip(&archive, &[("src/lib.rs", "// plugin")]);

    let report = h.manager.install_plugin_from_zip(&archive, "bare").await.unwrap();
    assert_eq!(report.version, "1.0.0");
    assert_eq!(report.warnings.len(), 1);
    assert!(h.root.join("bare/plugin.json").is_file());
}

#[tokio::test]
async fn test_duplicate_install_keeps_first() {
    let h = host();
    let plugin = MockPlugin::new("blog");
    let probe = plugin.probe();
    h.opener.register_mock("blog", move || plugin.clone());

    let first = plugin_archive(&h, "blog", "1.0.0");
    h.manager.install_plugin_from_zip(&first, "blog").await.unwrap();

    let second = plugin_archive(&h, "blog", "9.9.9");
    let err = h.manager.install_plugin_from_zip(&second, "blog").await.unwrap_err();
    assert!(err.to_string().contains("already installed"));

    assert!(h.manager.is_loaded("blog").await);
    assert!(h.root.join("blog/src/lib.rs").is_file());
    assert!(second.exists(), "rejected archive is left alone");
    assert_eq!(probe.initialize_count(), 1);
    assert_eq!(probe.shutdown_count(), 0);
}

#[tokio::test]
async fn test_failed_compilation_rolls_back() {
    let h = host();
    h.opener.register_mock("broken", || MockPlugin::new("broken"));
    h.toolchain.fail_with("error[E0425]: cannot find value `x` in this scope");
    let archive = plugin_archive(&h, "broken", "1.0.0");

    let err = h.manager.install_plugin_from_zip(&archive, "broken").await.unwrap_err();
    assert!(matches!(err, PluginRuntimeError::Compilation { .. }));
    assert!(err.compiler_output().unwrap().contains("E0425"));

    assert!(!h.root.join("broken").exists());
    assert!(!h.manager.compiler().artifact_path("broken").exists());
    assert!(!h.manager.is_loaded("broken").await);
    assert!(archive.exists(), "archive survives a failed install");
    assert_eq!(h.opener.open_count(), 0);
}

#[tokio::test]
async fn test_missing_entry_symbol_rolls_back() {
    let h = host();
    h.opener.register_mock("nosym", || MockPlugin::new("nosym"));
    h.toolchain.set_symbols("0000000000001000 T some_other_function");
    let archive = plugin_archive(&h, "nosym", "1.0.0");

    let err = h.manager.install_plugin_from_zip(&archive, "nosym").await.unwrap_err();
    assert!(matches!(err, PluginRuntimeError::ArtifactValidation { .. }));
    assert!(!h.root.join("nosym").exists());
    assert_eq!(h.opener.open_count(), 0);
}

#[tokio::test]
async fn test_archive_entries_cannot_escape_root() {
    let h = host();
    let archive = h.tmp.path().join("evil.zip");
    write_zip(
        &archive,
        &[("src/lib.rs", "// plugin"), ("../../evil.rs", "// escaped")],
    );

    let err = h.manager.install_plugin_from_zip(&archive, "evil").await.unwrap_err();
    assert!(matches!(err, PluginRuntimeError::InvalidArchive { .. }));
    assert!(err.to_string().contains("escapes"));

    assert!(!h.tmp.path().join("evil.rs").exists());
    assert!(!h.root.join("evil").exists());
    assert_eq!(h.toolchain.build_count(), 0);
}

#[tokio::test]
async fn test_plugin_name_rules() {
    let h = host();
    let archive = plugin_archive(&h, "fine", "1.0.0");

    let long = "a".repeat(51);
    for bad in ["", "My-Plugin", "9lives", "ab_c", "-abc", long.as_str()] {
        let result = h.manager.validate_archive(&archive, bad);
        assert!(!result.is_valid, "{bad:?} should be rejected");
        assert!(result.errors[0].contains("Invalid plugin name"));
    }

    let longest = "a".repeat(50);
    for good in ["a", "blog", "demo-plugin-2", longest.as_str()] {
        assert!(h.manager.validate_archive(&archive, good).is_valid, "{good:?}");
    }
}

#[tokio::test]
async fn test_archive_size_limit() {
    let h = host();

    let too_big = h.tmp.path().join("big.zip");
    File::create(&too_big).unwrap().set_len(101 * 1024 * 1024).unwrap();
    let result = h.manager.validate_archive(&too_big, "big");
    assert!(!result.is_valid);
    assert_eq!(result.errors, vec!["Plugin file too large (max 100MB)".to_string()]);

    // Under the limit the size passes; the zeros are not a zip though
    let under = h.tmp.path().join("under.zip");
    File::create(&under).unwrap().set_len(99 * 1024 * 1024).unwrap();
    let result = h.manager.validate_archive(&under, "under");
    assert!(!result.is_valid);
    assert!(result.errors.iter().all(|e| !e.contains("too large")));

    let empty = h.tmp.path().join("empty.zip");
    File::create(&empty).unwrap();
    let result = h.manager.validate_archive(&empty, "empty");
    assert_eq!(result.errors, vec!["Plugin file is empty".to_string()]);

    let not_zip = h.tmp.path().join("plugin.tar");
    fs::write(&not_zip, "data").unwrap();
    assert!(!h.manager.validate_archive(&not_zip, "plugin").is_valid);
}

#[tokio::test]
async fn test_compile_cache() {
    let h = host();
    source_dir(&h.root, "cached");
    h.opener.register_mock("cached", || MockPlugin::new("cached"));

    h.manager.load_plugin("cached").await.unwrap();
    h.manager.unload_plugin("cached").await.unwrap();
    h.manager.load_plugin("cached").await.unwrap();
    assert_eq!(h.toolchain.build_count(), 1, "unchanged sources reuse the artifact");

    let later = SystemTime::now() + Duration::from_secs(60);
    filetime::set_file_mtime(
        h.root.join("cached/src/lib.rs"),
        filetime::FileTime::from_system_time(later),
    )
    .unwrap();

    h.manager.unload_plugin("cached").await.unwrap();
    h.manager.load_plugin("cached").await.unwrap();
    assert_eq!(h.toolchain.build_count(), 2, "edited sources are rebuilt");
}

#[tokio::test]
async fn test_unsupported_platform_never_opens_modules() {
    let h = host_on(Platform::new("windows", "x86_64"));
    source_dir(&h.root, "demo");
    h.opener.register_mock("demo", || MockPlugin::new("demo"));

    let err = h.manager.load_plugin("demo").await.unwrap_err();
    assert!(matches!(err, PluginRuntimeError::PlatformUnsupported { .. }));
    assert!(err.to_string().contains("windows/x86_64"));

    let archive = plugin_archive(&h, "other", "1.0.0");
    h.opener.register_mock("other", || MockPlugin::new("other"));
    let err = h.manager.install_plugin_from_zip(&archive, "other").await.unwrap_err();
    assert!(matches!(err, PluginRuntimeError::PlatformUnsupported { .. }));
    assert!(!h.root.join("other").exists());
    assert!(archive.exists());

    assert_eq!(h.toolchain.build_count(), 0);
    assert_eq!(h.opener.open_count(), 0);
    assert!(h.manager.list().await.is_empty());
}

#[tokio::test]
async fn test_reload_creates_fresh_instance() {
    let h = host();
    source_dir(&h.root, "demo");
    let plugin = MockPlugin::new("demo");
    let probe = plugin.probe();
    h.opener.register_mock("demo", move || plugin.clone());

    h.manager.load_plugin("demo").await.unwrap();
    let before = h.manager.get_plugin("demo").await.unwrap();

    h.manager.reload_plugin("demo").await.unwrap();
    let after = h.manager.get_plugin("demo").await.unwrap();

    assert!(!Arc::ptr_eq(&before.plugin, &after.plugin));
    assert_eq!(probe.shutdown_count(), 1);
    assert_eq!(probe.initialize_count(), 2);
    assert_eq!(h.toolchain.build_count(), 2, "reload bypasses the cache");

    let err = h.manager.reload_plugin("ghost").await.unwrap_err();
    assert!(matches!(err, PluginRuntimeError::NotFound(_)));
}

#[tokio::test]
async fn test_hot_reload_drops_removed_plugins() {
    let h = host();
    let probes: Vec<_> = ["alpha", "beta", "gamma"]
        .into_iter()
        .map(|name| {
            source_dir(&h.root, name);
            let plugin = MockPlugin::new(name);
            let probe = plugin.probe();
            h.opener.register_mock(name, move || plugin.clone());
            probe
        })
        .collect();

    let report = h.manager.load_plugins().await.unwrap();
    assert_eq!(report.loaded, vec!["alpha", "beta", "gamma"]);

    fs::remove_dir_all(h.root.join("beta")).unwrap();

    let report = h.manager.hot_reload().await.unwrap();
    assert!(report.is_complete());
    assert_eq!(report.loaded, vec!["alpha", "gamma"]);

    let shutdowns: usize = probes.iter().map(|p| p.shutdown_count()).sum();
    assert_eq!(shutdowns, 3);
    assert!(!h.manager.is_loaded("beta").await);
    assert_eq!(h.manager.list().await.len(), 2);
}

#[tokio::test]
async fn test_bulk_load_continues_past_failures() {
    let h = host();
    source_dir(&h.root, "good");
    source_dir(&h.root, "grumpy");
    source_dir(&h.root, "unknown");
    h.opener.register_mock("good", || MockPlugin::new("good"));
    h.opener
        .register_mock("grumpy", || MockPlugin::new("grumpy").failing_initialize());

    let report = h.manager.load_plugins().await.unwrap();
    assert_eq!(report.loaded, vec!["good"]);
    assert_eq!(report.failures.len(), 2);
    assert!(matches!(
        report.error(),
        Some(PluginRuntimeError::PartialLoad { loaded: 1, .. })
    ));

    // Already active plugins are skipped on the next pass
    let report = h.manager.load_plugins().await.unwrap();
    assert!(report.loaded.is_empty());
    assert!(h.manager.is_loaded("good").await);
}

#[tokio::test]
async fn test_bulk_load_reports_compiler_output() {
    let h = host();
    source_dir(&h.root, "broken");
    h.opener.register_mock("broken", || MockPlugin::new("broken"));
    h.toolchain.fail_with("error[E0425]: cannot find value `x` in this scope");

    let report = h.manager.load_plugins().await.unwrap();
    assert!(report.loaded.is_empty());
    assert_eq!(report.failures.len(), 1);
    assert!(report.failures[0].1.contains("error[E0425]"));
    assert!(report.error().unwrap().to_string().contains("error[E0425]"));
}

#[tokio::test]
async fn test_names_differing_in_case_collide() {
    let h = host();
    let first = h.tmp.path().join("demo.so");
    let second = h.tmp.path().join("shadow.so");
    fs::write(&first, "module").unwrap();
    fs::write(&second, "module").unwrap();
    h.opener.register_mock("demo", || MockPlugin::new("demo"));
    h.opener.register_mock("shadow", || MockPlugin::new("Demo"));

    h.manager.load_plugin_from_file(&first).await.unwrap();
    let err = h.manager.load_plugin_from_file(&second).await.unwrap_err();
    assert!(matches!(err, PluginRuntimeError::AlreadyInstalled(_)));

    let names: Vec<_> = h.manager.list().await.into_iter().map(|p| p.info.name).collect();
    assert_eq!(names, vec!["demo"]);
    assert!(matches!(
        h.manager.unload_plugin("Demo").await,
        Err(PluginRuntimeError::NotFound(_))
    ));

    let (status, body) = get(&h.manager, "/plugins/demo/ping").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "pong");
}

#[tokio::test]
async fn test_installs_are_serialized() {
    let h = host();
    h.toolchain.set_delay(Duration::from_millis(200));
    h.opener.register_mock("alpha", || MockPlugin::new("alpha"));
    h.opener.register_mock("beta", || MockPlugin::new("beta"));
    let alpha = plugin_archive(&h, "alpha", "1.0.0");
    let beta = plugin_archive(&h, "beta", "1.0.0");

    let observer = async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let seen = h.manager.list().await;
        (seen, h.toolchain.active_builds())
    };

    let (first, second, (seen, building)) = tokio::join!(
        h.manager.install_plugin_from_zip(&alpha, "alpha"),
        h.manager.install_plugin_from_zip(&beta, "beta"),
        observer,
    );
    first.unwrap();
    second.unwrap();

    assert_eq!(h.toolchain.build_count(), 2);
    assert_eq!(h.toolchain.peak_concurrent_builds(), 1);

    // The reader waited for the writers; nothing was half-installed
    assert_eq!(building, 0);
    for summary in &seen {
        let (status, _) = get(&h.manager, &format!("/plugins/{}/ping", summary.info.name)).await;
        assert_eq!(status, StatusCode::OK);
    }
}

#[tokio::test]
async fn test_uninstall_unloaded_plugin() {
    let h = host();
    source_dir(&h.root, "demo");
    h.opener.register_mock("demo", || MockPlugin::new("demo"));

    h.manager.load_plugin("demo").await.unwrap();
    h.manager.unload_plugin("demo").await.unwrap();
    let artifact = h.manager.compiler().artifact_path("demo");
    assert!(artifact.exists());

    h.manager.uninstall_plugin("demo").await.unwrap();
    assert!(!h.root.join("demo").exists());
    assert!(!artifact.exists());

    let err = h.manager.uninstall_plugin("demo").await.unwrap_err();
    assert!(matches!(err, PluginRuntimeError::NotFound(_)));
}

#[tokio::test]
async fn test_uninstall_active_plugin() {
    let h = host();
    let plugin = MockPlugin::new("blog");
    let probe = plugin.probe();
    h.opener.register_mock("blog", move || plugin.clone());
    let archive = plugin_archive(&h, "blog", "1.0.0");
    h.manager.install_plugin_from_zip(&archive, "blog").await.unwrap();

    h.manager.uninstall_plugin("blog").await.unwrap();
    assert!(!h.manager.is_loaded("blog").await);
    assert!(!h.root.join("blog").exists());
    assert_eq!(probe.shutdown_count(), 1);
}

#[tokio::test]
async fn test_routes_follow_plugin_lifecycle() {
    let h = host();
    source_dir(&h.root, "demo");
    h.opener.register_mock("demo", || MockPlugin::new("demo"));

    let (status, _) = get(&h.manager, "/plugins/demo/ping").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    h.manager.load_plugin("demo").await.unwrap();
    let (status, body) = get(&h.manager, "/plugins/DEMO/ping").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "pong");

    let (status, _) = get(&h.manager, "/plugins/demo/missing").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    h.manager.unload_plugin("demo").await.unwrap();
    let (status, body) = get(&h.manager, "/plugins/demo/ping").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body.contains("not loaded"));
}

#[tokio::test]
async fn test_admin_menu_and_settings() {
    let h = host();
    source_dir(&h.root, "alpha");
    source_dir(&h.root, "beta");
    h.opener.register_mock("alpha", || {
        MockPlugin::new("alpha")
            .with_menu_item(AdminMenuItem::new("alpha-late", "Late", "/a").order(20))
            .with_setting(PluginSetting::boolean("enabled", "Enabled", true))
    });
    h.opener.register_mock("beta", || {
        MockPlugin::new("beta")
            .with_menu_item(AdminMenuItem::new("beta-early", "Early", "/b").order(-5))
            .with_menu_item(AdminMenuItem::new("beta-mid", "Mid", "/b/mid").order(20))
    });

    h.manager.load_plugins().await.unwrap();

    let ids: Vec<_> = h
        .manager
        .get_admin_menu_items()
        .await
        .into_iter()
        .map(|item| item.id)
        .collect();
    assert_eq!(ids, vec!["beta-early", "alpha-late", "beta-mid"]);

    let settings = h.manager.get_plugin_settings("alpha").await.unwrap();
    assert_eq!(settings[0].key, "enabled");
    assert!(h.manager.get_plugin_settings("beta").await.unwrap().is_empty());

    let all = h.manager.get_all_settings().await;
    assert_eq!(all.keys().collect::<Vec<_>>(), vec!["alpha", "beta"]);

    let err = h.manager.get_plugin_settings("ghost").await.unwrap_err();
    assert!(matches!(err, PluginRuntimeError::NotFound(_)));
}

#[tokio::test]
async fn test_shutdown_all() {
    let h = host();
    source_dir(&h.root, "alpha");
    let plugin = MockPlugin::new("alpha").failing_shutdown();
    let probe = plugin.probe();
    h.opener.register_mock("alpha", move || plugin.clone());

    h.manager.load_plugins().await.unwrap();
    h.manager.shutdown_all().await;

    assert_eq!(probe.shutdown_count(), 1);
    assert!(h.manager.list().await.is_empty());
    assert!(h.root.join("alpha").is_dir());
}
