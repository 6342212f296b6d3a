//! Plugin authoring: new plugin skeletons and install archives

use crate::compiler::cargo_manifest;
use crate::error::{PluginRuntimeError, Result};
use crate::manifest::{validate_plugin_name, PluginManifest, MANIFEST_FILE};
use kiln_config::ApiDependency;
use serde::Serialize;
use std::fs::{self, File};
use std::io;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info};
use walkdir::WalkDir;
use zip::write::FileOptions;
use zip::CompressionMethod;

const LIB_TEMPLATE: &str = r#"//! {{title}} plugin

use kiln_plugin_api::prelude::*;
use serde_json::json;

/// {{title}} plugin
#[derive(Debug, Default)]
pub struct {{struct}} {
    initialized: bool,
}

impl Plugin for {{struct}} {
    fn info(&self) -> PluginInfo {
        PluginInfo::new("{{name}}", env!("CARGO_PKG_VERSION"))
            .with_description("{{description}}")
    }

    fn initialize(&mut self, _deps: &PluginDependencies) -> Result<(), PluginError> {
        if self.initialized {
            return Err(PluginError::invalid_state("already initialized"));
        }
        self.initialized = true;
        Ok(())
    }

    fn register_routes(&self, router: &mut RouterGroup) {
        router.get("/", |_req| {
            PluginResponse::json(&json!({
                "plugin": "{{name}}",
                "message": "Welcome to {{title}}!"
            }))
        });

        router.get("/status", |_req| PluginResponse::json(&json!({ "status": "healthy" })));
    }

    fn admin_menu_items(&self) -> Vec<AdminMenuItem> {
        vec![AdminMenuItem::new("{{name}}", "{{title}}", "/plugins/{{name}}")
            .icon("puzzle-piece")
            .order(50)]
    }

    fn settings(&self) -> Vec<PluginSetting> {
        vec![PluginSetting::boolean("enabled", "Enable {{title}}", true)]
    }

    fn shutdown(&mut self) -> Result<(), PluginError> {
        self.initialized = false;
        Ok(())
    }
}

export_plugin!({{struct}}::default);
"#;

/// Files written for a new plugin
#[derive(Debug, Clone, Serialize)]
pub struct Scaffold {
    /// Plugin directory
    pub dir: PathBuf,
    /// Created files, relative to `dir`
    pub files: Vec<PathBuf>,
}

/// Create a plugin crate skeleton at `<parent>/<name>`
///
/// Writes `plugin.json`, a `Cargo.toml` for local builds and `src/lib.rs`.
/// Refuses to touch an existing directory.
pub fn scaffold_plugin(parent: &Path, name: &str, api: &ApiDependency) -> Result<Scaffold> {
    validate_plugin_name(name)?;

    let dir = parent.join(name);
    if dir.exists() {
        return Err(PluginRuntimeError::invalid_structure(format!(
            "{} already exists",
            dir.display()
        )));
    }

    let title = title_case(name);
    let mut manifest = PluginManifest::synthesized(name);
    manifest.description = format!("A {title} plugin");
    manifest
        .dependencies
        .insert("serde_json".to_string(), "1.0".to_string());
    manifest
        .scripts
        .insert("build".to_string(), "kiln build .".to_string());
    manifest
        .scripts
        .insert("package".to_string(), format!("kiln package . --output {name}.zip"));

    let source = LIB_TEMPLATE
        .replace("{{struct}}", &pascal_case(name))
        .replace("{{title}}", &title)
        .replace("{{description}}", &manifest.description)
        .replace("{{name}}", name);

    fs::create_dir_all(dir.join("src"))?;
    manifest.write(&dir)?;
    fs::write(dir.join("Cargo.toml"), cargo_manifest(name, &manifest, api)?)?;
    fs::write(dir.join(&manifest.main), source)?;
    fs::write(dir.join(".gitignore"), "/target\n*.zip\n")?;

    info!(plugin = %name, dir = %dir.display(), "Plugin scaffolded");

    Ok(Scaffold {
        dir,
        files: [MANIFEST_FILE, "Cargo.toml", manifest.main.as_str(), ".gitignore"]
            .into_iter()
            .map(PathBuf::from)
            .collect(),
    })
}

/// Pack a plugin directory into an installable archive
///
/// The archive holds `plugin.json`, everything under `src/` and the entry
/// file. `Cargo.toml` stays out; the host writes its own against its API
/// crate. Defaults to `<dir>/<name>.zip`.
pub fn package_plugin(dir: &Path, output: Option<&Path>) -> Result<PathBuf> {
    let manifest = PluginManifest::read(dir)?;
    validate_plugin_name(&manifest.name)?;

    if !manifest.entry_path(dir).is_file() {
        return Err(PluginRuntimeError::invalid_structure(format!(
            "plugin must contain {}",
            manifest.main
        )));
    }

    let mut files = vec![PathBuf::from(MANIFEST_FILE)];
    let src = dir.join("src");
    if src.is_dir() {
        let walker = WalkDir::new(&src)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| {
                entry.depth() == 0 || !entry.file_name().to_string_lossy().starts_with('.')
            });

        for entry in walker {
            let entry = entry
                .map_err(|e| PluginRuntimeError::other(format!("walking {}: {e}", src.display())))?;
            if !entry.file_type().is_file() {
                continue;
            }
            if let Ok(relative) = entry.path().strip_prefix(dir) {
                files.push(relative.to_path_buf());
            }
        }
    }

    let main: PathBuf = Path::new(&manifest.main)
        .components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect();
    if !files.contains(&main) {
        files.push(main);
    }

    let output = output
        .map(Path::to_path_buf)
        .unwrap_or_else(|| dir.join(format!("{}.zip", manifest.name)));

    let mut zip = zip::ZipWriter::new(File::create(&output)?);
    let options = FileOptions::default().compression_method(CompressionMethod::Deflated);
    for relative in &files {
        zip.start_file(archive_name(relative), options)?;
        io::copy(&mut File::open(dir.join(relative))?, &mut zip)?;
        debug!(file = %relative.display(), "Packed");
    }
    zip.finish()?;

    info!(
        plugin = %manifest.name,
        files = files.len(),
        archive = %output.display(),
        "Plugin packaged"
    );
    Ok(output)
}

/// Zip entry names always use `/`
fn archive_name(relative: &Path) -> String {
    relative
        .iter()
        .map(|part| part.to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn capitalized(words: &str) -> impl Iterator<Item = String> + '_ {
    words.split('-').filter(|w| !w.is_empty()).map(|word| {
        let mut chars = word.chars();
        match chars.next() {
            Some(first) => first.to_uppercase().chain(chars).collect(),
            None => String::new(),
        }
    })
}

fn pascal_case(name: &str) -> String {
    capitalized(name).collect()
}

fn title_case(name: &str) -> String {
    capitalized(name).collect::<Vec<_>>().join(" ")
}
