//! Layered configuration for the worker binary.

use config::{Config, ConfigError, Environment, File};
use ferry_core::{FerryError, FerryResult};
use ferry_jobs::JobsConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use tracing::{debug, info};

/// Top-level worker configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Logging output.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Prometheus scrape endpoint.
    #[serde(default)]
    pub exporter: ExporterConfig,

    /// Job engine settings.
    #[serde(default)]
    pub jobs: JobsConfig,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter directives used when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output.
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info,ferry=debug".to_string()
}

/// Prometheus exporter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExporterConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
}

impl Default for ExporterConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
        }
    }
}

impl ExporterConfig {
    pub fn socket_addr(&self) -> FerryResult<SocketAddr> {
        self.listen_addr.parse().map_err(|e| {
            FerryError::configuration(format!("Invalid exporter listen address {}: {}", self.listen_addr, e))
        })
    }
}

fn default_listen_addr() -> String {
    "0.0.0.0:9464".to_string()
}

/// Loads [`AppConfig`] from, in increasing precedence:
/// 1. `{dir}/default.toml`
/// 2. `{dir}/{environment}.toml`
/// 3. `{dir}/local.toml`
/// 4. Environment variables prefixed `FERRY__`, nested with `__`
pub struct ConfigLoader {
    config_dir: String,
    environment: String,
    env_overrides: Option<HashMap<String, String>>,
}

impl ConfigLoader {
    pub fn new(config_dir: impl Into<String>, environment: impl Into<String>) -> Self {
        Self {
            config_dir: config_dir.into(),
            environment: environment.into(),
            env_overrides: None,
        }
    }

    /// Loader for `./config`, with the environment taken from
    /// `FERRY_ENVIRONMENT` after reading `.env`.
    pub fn from_default_location() -> Self {
        if let Err(e) = dotenvy::dotenv() {
            debug!("No .env file found or error loading it: {}", e);
        }

        let environment =
            std::env::var("FERRY_ENVIRONMENT").unwrap_or_else(|_| "development".to_string());
        Self::new("./config", environment)
    }

    /// Replace the process environment with a fixed variable set.
    #[cfg(test)]
    fn with_env(mut self, vars: HashMap<String, String>) -> Self {
        self.env_overrides = Some(vars);
        self
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    pub fn load(&self) -> FerryResult<AppConfig> {
        info!(environment = %self.environment, "Loading configuration");

        let mut builder = Config::builder();

        for name in ["default", self.environment.as_str(), "local"] {
            let path = format!("{}/{}.toml", self.config_dir, name);
            if Path::new(&path).exists() {
                debug!("Loading config from: {}", path);
                builder = builder.add_source(File::with_name(&path).required(false));
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("FERRY")
                .separator("__")
                .try_parsing(true)
                .source(self.env_overrides.clone()),
        );

        let app_config: AppConfig = builder
            .build()
            .and_then(Config::try_deserialize)
            .map_err(config_error)?;

        app_config.jobs.validate()?;
        app_config.exporter.socket_addr()?;

        Ok(app_config)
    }
}

fn config_error(err: ConfigError) -> FerryError {
    FerryError::Configuration(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferry_jobs::JobKind;
    use std::fs;
    use tempfile::TempDir;

    fn write(dir: &TempDir, name: &str, contents: &str) {
        fs::write(dir.path().join(name), contents).unwrap();
    }

    fn loader(dir: &TempDir, environment: &str) -> ConfigLoader {
        ConfigLoader::new(dir.path().to_string_lossy(), environment).with_env(HashMap::new())
    }

    #[test]
    fn test_defaults_without_files() {
        let dir = TempDir::new().unwrap();
        let config = loader(&dir, "development").load().unwrap();

        assert_eq!(config.logging.level, "info,ferry=debug");
        assert!(!config.logging.json);
        assert_eq!(config.jobs.worker.concurrency, JobsConfig::default().worker.concurrency);
    }

    #[test]
    fn test_layers_apply_in_order() {
        let dir = TempDir::new().unwrap();
        write(
            &dir,
            "default.toml",
            r#"
            [jobs.worker]
            concurrency = 4
            poll_interval_ms = 500

            [jobs.retry]
            base_delay_ms = 1000
            "#,
        );
        write(&dir, "production.toml", "[jobs.worker]\nconcurrency = 16\n");
        write(&dir, "local.toml", "[logging]\njson = true\n");

        let config = loader(&dir, "production").load().unwrap();

        assert_eq!(config.jobs.worker.concurrency, 16);
        assert_eq!(config.jobs.worker.poll_interval_ms, 500);
        assert_eq!(config.jobs.retry.base_delay_ms, 1000);
        assert!(config.logging.json);
    }

    #[test]
    fn test_other_environment_file_ignored() {
        let dir = TempDir::new().unwrap();
        write(&dir, "production.toml", "[jobs.worker]\nconcurrency = 977\n");

        let config = loader(&dir, "staging").load().unwrap();
        assert_ne!(config.jobs.worker.concurrency, 977);
    }

    #[test]
    fn test_env_vars_override_files() {
        let dir = TempDir::new().unwrap();
        write(&dir, "default.toml", "[jobs.metrics]\nenabled = true\n");

        let vars = HashMap::from([
            ("FERRY__JOBS__METRICS__ENABLED".to_string(), "false".to_string()),
            ("FERRY__JOBS__WORKER__CONCURRENCY".to_string(), "3".to_string()),
        ]);
        let config = ConfigLoader::new(dir.path().to_string_lossy(), "development")
            .with_env(vars)
            .load()
            .unwrap();

        assert!(!config.jobs.metrics.enabled);
        assert_eq!(config.jobs.worker.concurrency, 3);
    }

    #[test]
    fn test_per_kind_attempts_from_file() {
        let dir = TempDir::new().unwrap();
        write(
            &dir,
            "default.toml",
            r#"
            [jobs.retry.max_attempts]
            default = 4
            webhook-processing = 6
            "#,
        );

        let config = loader(&dir, "development").load().unwrap();
        assert_eq!(config.jobs.retry.max_attempts_for(JobKind::WebhookProcessing), 6);
        assert_eq!(config.jobs.retry.max_attempts_for(JobKind::ReminderProcessing), 4);
    }

    #[test]
    fn test_invalid_settings_rejected() {
        let dir = TempDir::new().unwrap();
        write(&dir, "default.toml", "[jobs.worker]\nconcurrency = 0\n");

        let err = loader(&dir, "development").load().unwrap_err();
        assert_eq!(err.error_code(), "CONFIGURATION_ERROR");
    }

    #[test]
    fn test_bad_exporter_address_rejected() {
        let dir = TempDir::new().unwrap();
        write(&dir, "default.toml", "[exporter]\nlisten_addr = \"not-an-addr\"\n");

        assert!(loader(&dir, "development").load().is_err());
    }
}
