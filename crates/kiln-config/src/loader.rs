//! Configuration loading

use crate::error::{ConfigError, Result};
use crate::{Config, ConfigFormat};
use once_cell::sync::Lazy;
use regex::Regex;
use std::env;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Overrides `plugins.root_dir`
pub const ENV_PLUGINS_DIR: &str = "KILN_PLUGINS_DIR";

/// Overrides `server.listen`
pub const ENV_LISTEN: &str = "KILN_LISTEN";

/// Overrides `logging.level`
pub const ENV_LOG_LEVEL: &str = "KILN_LOG_LEVEL";

static ENV_VAR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(:-([^}]*))?\}").expect("valid env var pattern")
});

/// Load configuration from a file
pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();

    let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;

    let format = ConfigFormat::from_path(path)?;

    load_from_str(&content, format)
}

/// Expand environment variables in configuration string
/// Supports syntax: ${VAR} and ${VAR:-default}
fn expand_env_vars(content: &str) -> Result<String> {
    let mut result = String::with_capacity(content.len());
    let mut last_match = 0;

    for cap in ENV_VAR.captures_iter(content) {
        let (Some(full_match), Some(var_name)) = (cap.get(0), cap.get(1)) else {
            continue;
        };
        let default_value = cap.get(3).map(|m| m.as_str());

        let value = match env::var(var_name.as_str()) {
            Ok(val) => val,
            Err(_) => match default_value {
                Some(default) => default.to_string(),
                None => return Err(ConfigError::MissingEnv(var_name.as_str().to_string())),
            },
        };

        result.push_str(&content[last_match..full_match.start()]);
        result.push_str(&value);
        last_match = full_match.end();
    }

    result.push_str(&content[last_match..]);

    Ok(result)
}

/// Load configuration from a string
pub fn load_from_str(content: &str, format: ConfigFormat) -> Result<Config> {
    let expanded = expand_env_vars(content)?;

    let parse_error = |message: String| ConfigError::Parse {
        format: format.name(),
        message,
    };

    let config = match format {
        ConfigFormat::Yaml => {
            serde_yaml::from_str(&expanded).map_err(|e| parse_error(e.to_string()))?
        }
        ConfigFormat::Toml => toml::from_str(&expanded).map_err(|e| parse_error(e.to_string()))?,
        ConfigFormat::Json => {
            serde_json::from_str(&expanded).map_err(|e| parse_error(e.to_string()))?
        }
    };

    Ok(config)
}

/// Apply `KILN_*` environment overrides
pub fn apply_env_overrides(config: &mut Config) -> Result<()> {
    if let Ok(dir) = env::var(ENV_PLUGINS_DIR) {
        tracing::debug!(root_dir = %dir, "Plugin directory overridden from environment");
        config.plugins.root_dir = PathBuf::from(dir);
    }

    if let Ok(listen) = env::var(ENV_LISTEN) {
        config.server.listen =
            listen
                .parse::<SocketAddr>()
                .map_err(|e| ConfigError::InvalidOverride {
                    var: ENV_LISTEN,
                    message: e.to_string(),
                })?;
    }

    if let Ok(level) = env::var(ENV_LOG_LEVEL) {
        config.logging.level = level;
    }

    Ok(())
}

/// Load, optionally override from the environment, and validate
///
/// Without a path the built-in defaults are used.
pub fn load_config<P: AsRef<Path>>(path: Option<P>, env_overrides: bool) -> Result<Config> {
    let mut config = match path {
        Some(path) => load_from_file(path)?,
        None => Config::default(),
    };

    if env_overrides {
        apply_env_overrides(&mut config)?;
    }

    crate::validator::validate_config(&config)?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const YAML_CONFIG: &str = r#"
server:
  listen: "0.0.0.0:3000"

plugins:
  root_dir: "/srv/kiln/plugins"
  max_archive_size: 1048576
  cache_max_age: "12h"
  api_dependency:
    path: "/src/kiln/crates/kiln-plugin-api"
  watch:
    enabled: true
    debounce: "250ms"

logging:
  level: "debug"
  format: "json"
"#;

    #[test]
    fn test_load_yaml() {
        let config = load_from_str(YAML_CONFIG, ConfigFormat::Yaml).unwrap();

        assert_eq!(config.server.listen.port(), 3000);
        assert_eq!(config.plugins.max_archive_size, 1_048_576);
        assert_eq!(config.plugins.build_dir(), PathBuf::from("/srv/kiln/plugins/.build"));
        assert!(config.plugins.watch.enabled);
        assert_eq!(config.logging.format, crate::LogFormat::Json);
    }

    #[test]
    fn test_load_toml() {
        let config = load_from_str(
            r#"
[plugins]
root_dir = "plugins"
cargo = "/usr/local/bin/cargo"
"#,
            ConfigFormat::Toml,
        )
        .unwrap();

        assert_eq!(config.plugins.cargo, "/usr/local/bin/cargo");
        assert_eq!(config.server.listen.port(), 8080);
    }

    #[test]
    fn test_invalid_yaml() {
        let result = load_from_str("invalid: [yaml", ConfigFormat::Yaml);
        assert!(matches!(result, Err(ConfigError::Parse { format: "YAML", .. })));
    }

    #[test]
    fn test_env_var_substitution() {
        env::set_var("KILN_TEST_PORT", "9090");

        let config = load_from_str(
            "server:\n  listen: \"127.0.0.1:${KILN_TEST_PORT}\"\n",
            ConfigFormat::Yaml,
        )
        .unwrap();
        assert_eq!(config.server.listen.port(), 9090);

        env::remove_var("KILN_TEST_PORT");
    }

    #[test]
    fn test_env_var_with_default() {
        env::remove_var("KILN_TEST_UNDEFINED");

        let expanded = expand_env_vars("root: ${KILN_TEST_UNDEFINED:-./plugins}").unwrap();
        assert_eq!(expanded, "root: ./plugins");
    }

    #[test]
    fn test_missing_env_var_no_default() {
        env::remove_var("KILN_TEST_MISSING");

        let result = load_from_str("server:\n  listen: \"${KILN_TEST_MISSING}\"\n", ConfigFormat::Yaml);
        let err = result.unwrap_err();
        assert!(err.to_string().contains("KILN_TEST_MISSING"));
    }

    #[test]
    fn test_load_config_from_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        file.write_all(YAML_CONFIG.as_bytes()).unwrap();

        let config = load_config(Some(file.path()), false).unwrap();
        assert_eq!(config.plugins.root_dir, PathBuf::from("/srv/kiln/plugins"));
    }

    #[test]
    fn test_load_config_without_file_uses_defaults() {
        let config = load_config(None::<&Path>, false).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_missing_file() {
        let result = load_from_file("/nonexistent/kiln.yaml");
        assert!(matches!(result, Err(ConfigError::Read { .. })));
    }
}
