//! Build toolchain abstraction and the cargo implementation

use async_trait::async_trait;
use kiln_config::PluginsConfig;
use serde::Deserialize;
use std::env::consts::DLL_EXTENSION;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Output;
use tokio::process::Command;
use tracing::debug;

/// What to build and where to put it
#[derive(Debug, Clone)]
pub struct BuildRequest {
    /// Plugin crate directory
    pub source_dir: PathBuf,

    /// Plugin name, used for the artifact file name
    pub plugin_name: String,

    /// Final artifact path
    pub output: PathBuf,

    /// Shared cargo target directory
    pub target_dir: PathBuf,
}

/// Successful build
#[derive(Debug, Clone)]
pub struct ToolchainOutput {
    /// Artifact written to [`BuildRequest::output`]
    pub artifact: PathBuf,

    /// Diagnostics printed during the build
    pub log: String,
}

/// Toolchain invocation failure
#[derive(Debug, thiserror::Error)]
pub enum ToolchainError {
    /// The command could not be started
    #[error("failed to run {command}: {source}")]
    Spawn {
        /// Command line
        command: String,
        /// Underlying error
        #[source]
        source: io::Error,
    },

    /// The command exited unsuccessfully
    #[error("{command} failed with {status}")]
    Failed {
        /// Command line
        command: String,
        /// Exit status
        status: String,
        /// Combined output
        output: String,
    },

    /// The build succeeded but produced no usable library
    #[error("no dynamic library produced for {0}")]
    MissingArtifact(String),

    /// Moving the artifact into place failed
    #[error("failed to install artifact {path}: {source}")]
    Install {
        /// Destination
        path: String,
        /// Underlying error
        #[source]
        source: io::Error,
    },
}

impl ToolchainError {
    /// Verbatim output of the failed command, if any
    pub fn output(&self) -> &str {
        match self {
            Self::Failed { output, .. } => output,
            _ => "",
        }
    }
}

/// Compiles plugin sources and inspects the result
#[async_trait]
pub trait Toolchain: Send + Sync + fmt::Debug {
    /// Build the plugin crate into a dynamic library at `request.output`
    async fn build(&self, request: &BuildRequest) -> Result<ToolchainOutput, ToolchainError>;

    /// Listing of the symbols a library exports
    async fn exported_symbols(&self, artifact: &Path) -> Result<String, ToolchainError>;

    /// Toolchain version string
    async fn version(&self) -> Result<String, ToolchainError>;
}

/// [`Toolchain`] backed by `cargo` and `nm`
#[derive(Debug, Clone)]
pub struct CargoToolchain {
    cargo: String,
    nm: String,
}

impl CargoToolchain {
    /// Create a toolchain from executable names
    pub fn new(cargo: impl Into<String>, nm: impl Into<String>) -> Self {
        Self {
            cargo: cargo.into(),
            nm: nm.into(),
        }
    }

    /// Create a toolchain from plugin configuration
    pub fn from_config(config: &PluginsConfig) -> Self {
        Self::new(config.cargo.clone(), config.nm_command())
    }

    async fn run(
        &self,
        program: &str,
        args: &[&str],
        dir: Option<&Path>,
    ) -> Result<Output, ToolchainError> {
        let command = format!("{} {}", program, args.join(" "));
        debug!(command = %command, "Running toolchain command");

        let mut cmd = Command::new(program);
        cmd.args(args).env("CARGO_TERM_COLOR", "never");
        if let Some(dir) = dir {
            cmd.current_dir(dir);
        }

        let output = cmd
            .output()
            .await
            .map_err(|source| ToolchainError::Spawn {
                command: command.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(ToolchainError::Failed {
                command,
                status: output.status.to_string(),
                output: combined_output(&output),
            });
        }

        Ok(output)
    }
}

#[async_trait]
impl Toolchain for CargoToolchain {
    async fn build(&self, request: &BuildRequest) -> Result<ToolchainOutput, ToolchainError> {
        let dir = request.source_dir.as_path();
        let target_dir = request.target_dir.to_string_lossy().into_owned();

        let fetch = self.run(&self.cargo, &["fetch"], Some(dir)).await?;

        let build = self
            .run(
                &self.cargo,
                &[
                    "rustc",
                    "--lib",
                    "--release",
                    "--crate-type",
                    "cdylib",
                    "--target-dir",
                    target_dir.as_str(),
                    "--message-format",
                    "json-render-diagnostics",
                ],
                Some(dir),
            )
            .await?;

        let stdout = String::from_utf8_lossy(&build.stdout);
        let built = find_cdylib(&stdout, &dir.join("Cargo.toml"))
            .ok_or_else(|| ToolchainError::MissingArtifact(request.plugin_name.clone()))?;

        install_artifact(&built, &request.output).await?;

        let mut log = String::from_utf8_lossy(&fetch.stderr).into_owned();
        log.push_str(&String::from_utf8_lossy(&build.stderr));

        Ok(ToolchainOutput {
            artifact: request.output.clone(),
            log,
        })
    }

    async fn exported_symbols(&self, artifact: &Path) -> Result<String, ToolchainError> {
        let path = artifact.to_string_lossy().into_owned();
        let args = if cfg!(target_os = "macos") {
            ["-g", "-U", path.as_str()]
        } else {
            ["-D", "--defined-only", path.as_str()]
        };

        let output = self.run(&self.nm, &args, None).await?;
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn version(&self) -> Result<String, ToolchainError> {
        let output = self.run(&self.cargo, &["--version"], None).await?;
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

fn combined_output(output: &Output) -> String {
    let mut text = String::from_utf8_lossy(&output.stderr).into_owned();
    let stdout = String::from_utf8_lossy(&output.stdout);

    // JSON messages on stdout are noise next to the rendered diagnostics
    for line in stdout.lines().filter(|l| !l.starts_with('{')) {
        text.push('\n');
        text.push_str(line);
    }
    text
}

#[derive(Debug, Deserialize)]
struct CargoMessage {
    reason: String,
    #[serde(default)]
    manifest_path: Option<PathBuf>,
    #[serde(default)]
    target: Option<CargoTarget>,
    #[serde(default)]
    filenames: Vec<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct CargoTarget {
    #[serde(default)]
    kind: Vec<String>,
}

/// Locate the plugin's dynamic library in cargo's JSON messages
///
/// Proc-macro dependencies also produce dynamic libraries, so the artifact
/// belonging to `manifest` wins; otherwise the last non-proc-macro one does.
fn find_cdylib(messages: &str, manifest: &Path) -> Option<PathBuf> {
    let manifest = manifest
        .canonicalize()
        .unwrap_or_else(|_| manifest.to_path_buf());

    let mut fallback = None;

    for message in messages
        .lines()
        .filter_map(|line| serde_json::from_str::<CargoMessage>(line).ok())
        .filter(|m| m.reason == "compiler-artifact")
    {
        let is_proc_macro = message
            .target
            .as_ref()
            .map_or(false, |t| t.kind.iter().any(|k| k == "proc-macro"));
        if is_proc_macro {
            continue;
        }

        let Some(library) = message
            .filenames
            .iter()
            .find(|f| f.extension().map_or(false, |e| e == DLL_EXTENSION))
        else {
            continue;
        };

        let own = message
            .manifest_path
            .as_ref()
            .and_then(|p| p.canonicalize().ok())
            .map_or(false, |p| p == manifest);
        if own {
            return Some(library.clone());
        }
        fallback = Some(library.clone());
    }

    fallback
}

/// Copy a built library to its final path through a temporary file
///
/// The rename gives the artifact a fresh inode, so a module that is still
/// mapped keeps its old contents.
pub(crate) async fn install_artifact(built: &Path, output: &Path) -> Result<(), ToolchainError> {
    let install_err = |source| ToolchainError::Install {
        path: output.display().to_string(),
        source,
    };

    if let Some(parent) = output.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(install_err)?;
    }

    let tmp = output.with_extension(format!("{DLL_EXTENSION}.tmp"));
    tokio::fs::copy(built, &tmp).await.map_err(install_err)?;
    tokio::fs::rename(&tmp, output).await.map_err(install_err)?;

    Ok(())
}
