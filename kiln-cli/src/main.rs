//! Kiln CLI

use anyhow::{Context, Result};
use axum::routing::get;
use clap::{Parser, Subcommand};
use kiln_config::{load_config, Config, LogFormat, LoggingConfig};
use kiln_plugin_api::PluginDependencies;
use kiln_plugin_runtime::{HotReloadWatcher, PluginManager};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

#[derive(Parser)]
#[command(name = "kiln")]
#[command(about = "Kiln runtime plugin host", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to configuration file (defaults plus KILN_* overrides if omitted)
    #[arg(short, long, global = true, env = "KILN_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load plugins and serve their routes
    Serve {
        /// Watch plugin sources and rebuild on change
        #[arg(long)]
        watch: bool,
    },

    /// Validate configuration file
    Validate,

    /// Install a plugin archive into the plugin root
    Install {
        /// Zip archive
        archive: PathBuf,

        /// Plugin name (default: archive file name without extension)
        #[arg(short, long)]
        name: Option<String>,
    },

    /// Compile a plugin directory and check its entry symbol
    Build {
        /// Plugin source directory
        dir: PathBuf,

        /// Plugin name (default: directory name)
        #[arg(short, long)]
        name: Option<String>,
    },

    /// Create a new plugin crate
    New {
        /// Plugin name (lowercase letters, digits and hyphens)
        name: String,

        /// Directory to create the plugin in
        #[arg(short, long, default_value = ".")]
        dir: PathBuf,
    },

    /// Pack a plugin directory into an installable archive
    Package {
        /// Plugin source directory
        #[arg(default_value = ".")]
        dir: PathBuf,

        /// Archive path (default: <dir>/<name>.zip)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show platform, toolchain and cache details
    Info,

    /// Remove cached artifacts older than the configured age
    CleanCache {
        /// Maximum age in seconds (default: plugins.cache_max_age)
        #[arg(long)]
        max_age_secs: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref(), true).with_context(|| match &cli.config {
        Some(path) => format!("failed to load {}", path.display()),
        None => "failed to load default configuration".to_string(),
    })?;

    init_tracing(&config.logging)?;

    match cli.command {
        Commands::Serve { watch } => serve(config, watch).await,

        Commands::Validate => {
            tracing::info!("✓ Configuration is valid");
            tracing::info!("  Listen: {}", config.server.listen);
            tracing::info!("  Plugin root: {}", config.plugins.root_dir.display());
            tracing::info!("  Build dir: {}", config.plugins.build_dir().display());
            tracing::info!("  Watch: {}", config.plugins.watch.enabled);
            Ok(())
        }

        Commands::Install { archive, name } => {
            let name = match name {
                Some(name) => name,
                None => file_stem(&archive)?,
            };

            let manager = PluginManager::new(config.plugins.clone());
            manager
                .set_dependencies(PluginDependencies::new(serde_json::to_value(&config)?))
                .await;

            let report = manager.install_plugin_from_zip(&archive, &name).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);

            manager.shutdown_all().await;
            Ok(())
        }

        Commands::Build { dir, name } => {
            let name = match name {
                Some(name) => name,
                None => file_stem(&dir)?,
            };
            kiln_plugin_runtime::validate_plugin_name(&name)?;

            let manager = PluginManager::new(config.plugins);
            let artifact = manager.compiler().compile_plugin(&dir, &name).await?;
            manager
                .compiler()
                .validate_compilation(&artifact.path)
                .await?;

            tracing::info!(plugin = %name, artifact = %artifact.path.display(), "✓ Plugin built");
            Ok(())
        }

        Commands::New { name, dir } => {
            let scaffold =
                kiln_plugin_runtime::scaffold_plugin(&dir, &name, &config.plugins.api_dependency)?;

            tracing::info!(plugin = %name, dir = %scaffold.dir.display(), "✓ Plugin created");
            for file in &scaffold.files {
                tracing::info!("  {}", file.display());
            }
            Ok(())
        }

        Commands::Package { dir, output } => {
            let archive = kiln_plugin_runtime::package_plugin(&dir, output.as_deref())?;

            let name = file_stem(&archive)?;
            let validation = kiln_plugin_runtime::validate_archive(
                &archive,
                &name,
                config.plugins.max_archive_size,
            );
            for warning in &validation.warnings {
                tracing::warn!(warning = %warning, "Archive validation warning");
            }
            validation.into_result(&archive)?;

            tracing::info!(archive = %archive.display(), "✓ Plugin packaged");
            Ok(())
        }

        Commands::Info => {
            let manager = PluginManager::new(config.plugins);
            let info = manager.system_info().await;
            println!("{}", serde_json::to_string_pretty(&info)?);
            Ok(())
        }

        Commands::CleanCache { max_age_secs } => {
            let max_age = max_age_secs
                .map(Duration::from_secs)
                .unwrap_or(config.plugins.cache_max_age);

            let manager = PluginManager::new(config.plugins);
            let removed = manager.cleanup_cache(max_age).await?;
            tracing::info!(removed, "✓ Build cache cleaned");
            Ok(())
        }
    }
}

async fn serve(config: Config, watch: bool) -> Result<()> {
    tracing::info!("Starting Kiln");

    let manager = Arc::new(PluginManager::new(config.plugins.clone()));
    manager
        .set_dependencies(PluginDependencies::new(serde_json::to_value(&config)?))
        .await;

    if config.plugins.load_on_startup {
        let report = manager.load_plugins().await?;
        if let Some(err) = report.error() {
            tracing::warn!(error = %err, "Started with plugin failures");
        }
        tracing::info!(loaded = ?report.loaded, "Plugins loaded");
    }

    let mut watcher = None;
    if watch || config.plugins.watch.enabled {
        let mut w = HotReloadWatcher::new(Arc::clone(&manager));
        w.start()?;
        watcher = Some(w);
    }

    let app = manager.routes().route("/health", get(|| async { "ok" }));

    let listener = tokio::net::TcpListener::bind(config.server.listen)
        .await
        .with_context(|| format!("failed to bind {}", config.server.listen))?;
    tracing::info!(listen = %config.server.listen, "Server starting...");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(mut watcher) = watcher {
        watcher.stop();
    }
    manager.shutdown_all().await;

    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}

fn file_stem(path: &Path) -> Result<String> {
    path.file_stem()
        .and_then(|s| s.to_str())
        .map(str::to_string)
        .with_context(|| format!("cannot derive a plugin name from {}", path.display()))
}

fn init_tracing(logging: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&logging.level))
        .context("invalid log filter")?;

    let fmt = match logging.format {
        LogFormat::Text => tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_level(true)
            .boxed(),
        LogFormat::Json => tracing_subscriber::fmt::layer().json().boxed(),
    };

    tracing_subscriber::registry().with(fmt).with(filter).init();

    Ok(())
}
