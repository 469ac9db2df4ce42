//! Application configuration.
//!
//! Aggregates store and dispatcher configuration into a single Config
//! struct that can be loaded from YAML files or environment variables.

use serde::Deserialize;

use crate::dispatch::DispatcherConfig;
use crate::storage::StoreConfig;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "COUCHLINE_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "COUCHLINE";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "COUCHLINE_LOG";

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Document store configuration.
    pub store: StoreConfig,
    /// Change dispatcher configuration.
    pub dispatcher: DispatcherConfig,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `config.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix, e.g.
    ///    `COUCHLINE__DISPATCHER__TIMEOUT_MS=250`
    pub fn load(path: Option<&str>) -> Result<Self, Box<dyn std::error::Error>> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = config.try_deserialize()?;
        Ok(config)
    }

    /// Create config for testing: short timeouts, default separator.
    pub fn for_test() -> Self {
        Self {
            store: StoreConfig::default(),
            dispatcher: DispatcherConfig::default().with_timeout_ms(10),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use serial_test::serial;

    use super::*;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.store.separator, "__");
        assert_eq!(config.dispatcher.timeout_ms, 5000);
        assert_eq!(config.dispatcher.max_subscribe_retries, 3);
        assert!(!config.dispatcher.include_docs);
    }

    #[test]
    fn test_config_for_test() {
        let config = Config::for_test();
        assert_eq!(config.dispatcher.timeout_ms, 10);
    }

    #[test]
    #[serial]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            "store:\n  separator: \"::\"\ndispatcher:\n  timeout_ms: 250\n  include_docs: true"
        )
        .unwrap();

        let config = Config::load(file.path().to_str()).unwrap();
        assert_eq!(config.store.separator, "::");
        assert_eq!(config.dispatcher.timeout_ms, 250);
        assert!(config.dispatcher.include_docs);
        // Unset fields keep their defaults.
        assert_eq!(config.dispatcher.max_subscribe_retries, 3);
    }

    #[test]
    #[serial]
    fn test_load_missing_explicit_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("absent.yaml");
        assert!(Config::load(missing.to_str()).is_err());
    }

    #[test]
    #[serial]
    fn test_env_overrides_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "dispatcher:\n  timeout_ms: 250").unwrap();

        std::env::set_var("COUCHLINE__DISPATCHER__TIMEOUT_MS", "75");
        let config = Config::load(file.path().to_str());
        std::env::remove_var("COUCHLINE__DISPATCHER__TIMEOUT_MS");

        assert_eq!(config.unwrap().dispatcher.timeout_ms, 75);
    }
}
