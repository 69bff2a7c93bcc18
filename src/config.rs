//! User configuration.
//!
//! Loaded from `$WIZ_CONFIG` when set, otherwise from
//! `~/.config/wiz/config.toml`. A missing file yields the defaults.
//! `WIZ_REGISTRY_PATHS` (colon-separated) overrides the configured
//! registry chain, and command-line flags override everything.

use serde::Deserialize;
use std::env;
use std::fs;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct Config {
    /// Ordered registry chain; later registries take precedence.
    pub registry_paths: Vec<PathBuf>,
    pub max_attempts: Option<usize>,
    pub max_combinations: Option<usize>,
    pub include_implicit: Option<bool>,
}

impl Config {
    /// Load the effective configuration, applying environment overrides.
    pub fn load() -> Result<Config> {
        let mut config = match config_path() {
            Some(path) if path.is_file() => Config::from_path(&path)?,
            _ => Config::default(),
        };
        if let Ok(paths) = env::var("WIZ_REGISTRY_PATHS") {
            config.registry_paths = env::split_paths(&paths).collect();
        }
        Ok(config)
    }

    pub fn from_path(path: &PathBuf) -> Result<Config> {
        let data = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.clone(),
            source,
        })?;
        toml::from_str(&data).map_err(|source| ConfigError::Parse {
            path: path.clone(),
            source,
        })
    }
}

fn config_path() -> Option<PathBuf> {
    if let Ok(path) = env::var("WIZ_CONFIG") {
        return Some(PathBuf::from(path));
    }
    dirs::config_dir().map(|dir| dir.join("wiz").join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn parses_a_full_config() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.toml");
        fs::write(
            &path,
            r#"
registry-paths = ["/studio/registry", "/project/registry"]
max-attempts = 5
max-combinations = 100
include-implicit = false
"#,
        )
        .unwrap();

        let config = Config::from_path(&path).unwrap();
        assert_eq!(config.registry_paths.len(), 2);
        assert_eq!(config.max_attempts, Some(5));
        assert_eq!(config.max_combinations, Some(100));
        assert_eq!(config.include_implicit, Some(false));
    }

    #[test]
    fn empty_file_yields_defaults() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.toml");
        fs::write(&path, "").unwrap();

        let config = Config::from_path(&path).unwrap();
        assert!(config.registry_paths.is_empty());
        assert_eq!(config.max_attempts, None);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.toml");
        fs::write(&path, "unexpected = 1\n").unwrap();
        assert!(matches!(
            Config::from_path(&path),
            Err(ConfigError::Parse { .. })
        ));
    }
}
