//! Configuration validation

use crate::error::{ConfigError, Result};
use crate::Config;

/// Validate configuration
pub fn validate_config(config: &Config) -> Result<()> {
    validate_plugins(config)?;
    validate_logging(config)?;

    Ok(())
}

fn validate_plugins(config: &Config) -> Result<()> {
    let plugins = &config.plugins;

    if plugins.root_dir.as_os_str().is_empty() {
        return Err(ConfigError::invalid("plugins.root_dir cannot be empty"));
    }

    if plugins.cargo.trim().is_empty() {
        return Err(ConfigError::invalid("plugins.cargo cannot be empty"));
    }

    if plugins.max_archive_size == 0 {
        return Err(ConfigError::invalid("plugins.max_archive_size must be > 0"));
    }

    if plugins.cache_max_age.is_zero() {
        return Err(ConfigError::invalid("plugins.cache_max_age must be > 0"));
    }

    let api = &plugins.api_dependency;
    if api.path.is_none() && api.version.as_deref().map_or(true, str::is_empty) {
        return Err(ConfigError::invalid(
            "plugins.api_dependency needs a path or a version",
        ));
    }

    if plugins.build_dir() == plugins.root_dir {
        return Err(ConfigError::invalid(
            "plugins.build_dir must differ from plugins.root_dir",
        ));
    }

    if plugins.watch.enabled && plugins.watch.debounce.as_secs() > 60 {
        tracing::warn!(
            debounce = ?plugins.watch.debounce,
            "Watch debounce is very high (>1 minute)"
        );
    }

    Ok(())
}

fn validate_logging(config: &Config) -> Result<()> {
    if config.logging.level.trim().is_empty() {
        return Err(ConfigError::invalid("logging.level cannot be empty"));
    }

    Ok(())
}
