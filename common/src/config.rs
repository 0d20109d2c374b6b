// Configuration management with layered configuration (file, env)

use crate::models::LicenseCredentials;
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use uuid::Uuid;

/// Main settings structure containing all configuration options
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Settings {
    pub runner: RunnerConfig,
    pub licensing: LicensingConfig,
    pub lock: LockConfig,
    pub storage: StorageConfig,
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Identity written into the runner lock
    pub runner_id: String,
    pub tick_interval_seconds: u64,
    /// Refreshed every `lock_ttl_seconds / 3` while a job executes, so a job
    /// may run up to `job_execution_timeout_seconds` even when that exceeds the TTL
    pub lock_ttl_seconds: u64,
    pub lock_acquire_timeout_seconds: u64,
    pub job_execution_timeout_seconds: u64,
    pub retry_backoff_base_seconds: u64,
    pub retry_backoff_cap_seconds: u64,
    pub max_jobs_per_cycle: usize,
}

fn default_runner_id() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            runner_id: default_runner_id(),
            tick_interval_seconds: 60,
            // Three ticks, so one missed heartbeat does not hand the lock over
            lock_ttl_seconds: 180,
            lock_acquire_timeout_seconds: 5,
            job_execution_timeout_seconds: 300,
            retry_backoff_base_seconds: 30,
            retry_backoff_cap_seconds: 1800,
            max_jobs_per_cycle: 100,
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LicensingConfig {
    pub endpoint: String,
    pub install_id: String,
    pub install_secret: String,
    pub request_timeout_seconds: u64,
    pub lease_renewal_margin_seconds: u64,
    pub lease_grace_period_seconds: u64,
    pub renewal_retry_base_seconds: u64,
    pub renewal_retry_cap_seconds: u64,
    pub grace_retry_seconds: u64,
}

impl LicensingConfig {
    pub fn credentials(&self) -> LicenseCredentials {
        LicenseCredentials {
            install_id: self.install_id.clone(),
            install_secret: self.install_secret.clone(),
        }
    }
}

impl std::fmt::Debug for LicensingConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LicensingConfig")
            .field("endpoint", &self.endpoint)
            .field("install_id", &self.install_id)
            .field("install_secret", &"<redacted>")
            .field("request_timeout_seconds", &self.request_timeout_seconds)
            .field("lease_renewal_margin_seconds", &self.lease_renewal_margin_seconds)
            .field("lease_grace_period_seconds", &self.lease_grace_period_seconds)
            .field("renewal_retry_base_seconds", &self.renewal_retry_base_seconds)
            .field("renewal_retry_cap_seconds", &self.renewal_retry_cap_seconds)
            .field("grace_retry_seconds", &self.grace_retry_seconds)
            .finish()
    }
}

impl Default for LicensingConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://licenses.example.com".to_string(),
            install_id: String::new(),
            install_secret: String::new(),
            request_timeout_seconds: 5,
            lease_renewal_margin_seconds: 300,
            lease_grace_period_seconds: 6 * 3600,
            renewal_retry_base_seconds: 30,
            renewal_retry_cap_seconds: 300,
            grace_retry_seconds: 15,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LockBackend {
    #[default]
    Memory,
    Redis,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct LockConfig {
    pub backend: LockBackend,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Memory,
    Postgres,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_seconds: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgresql://localhost/stream_scheduler".to_string(),
            max_connections: 10,
            min_connections: 2,
            connect_timeout_seconds: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub url: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
        }
    }
}

/// Log line encoding
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    /// Single-line human readable output for local runs
    Compact,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    pub log_level: String,
    pub log_format: LogFormat,
    pub metrics_port: u16,
    /// OTLP collector endpoint; traces are exported only when set
    pub tracing_endpoint: Option<String>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Json,
            metrics_port: 9090,
            tracing_endpoint: None,
        }
    }
}

impl Settings {
    /// Load configuration with layered precedence: defaults → file → env
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_path("config")
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Local overrides, not committed
            .add_source(File::from(config_dir.join("local.toml")).required(false))
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Validate configuration settings
    pub fn validate(&self) -> Result<(), String> {
        let runner = &self.runner;
        if runner.runner_id.is_empty() {
            return Err("Runner runner_id cannot be empty".to_string());
        }
        if runner.tick_interval_seconds == 0 {
            return Err("Runner tick_interval_seconds must be greater than 0".to_string());
        }
        if runner.lock_ttl_seconds < 3 {
            return Err(
                "Runner lock_ttl_seconds must be at least 3 so the lock is refreshed during execution"
                    .to_string(),
            );
        }
        if runner.lock_acquire_timeout_seconds == 0 {
            return Err("Runner lock_acquire_timeout_seconds must be greater than 0".to_string());
        }
        if runner.job_execution_timeout_seconds == 0 {
            return Err("Runner job_execution_timeout_seconds must be greater than 0".to_string());
        }
        if runner.retry_backoff_base_seconds == 0 {
            return Err("Runner retry_backoff_base_seconds must be greater than 0".to_string());
        }
        if runner.retry_backoff_cap_seconds < runner.retry_backoff_base_seconds {
            return Err(
                "Runner retry_backoff_cap_seconds must not be below retry_backoff_base_seconds"
                    .to_string(),
            );
        }
        if runner.max_jobs_per_cycle == 0 {
            return Err("Runner max_jobs_per_cycle must be greater than 0".to_string());
        }

        let licensing = &self.licensing;
        if licensing.endpoint.is_empty() {
            return Err("Licensing endpoint cannot be empty".to_string());
        }
        if licensing.install_id.is_empty() || licensing.install_secret.is_empty() {
            return Err("Licensing install_id and install_secret are required".to_string());
        }
        if licensing.request_timeout_seconds == 0 {
            return Err("Licensing request_timeout_seconds must be greater than 0".to_string());
        }
        if licensing.renewal_retry_base_seconds == 0 || licensing.grace_retry_seconds == 0 {
            return Err("Licensing retry intervals must be greater than 0".to_string());
        }
        if licensing.renewal_retry_cap_seconds < licensing.renewal_retry_base_seconds {
            return Err(
                "Licensing renewal_retry_cap_seconds must not be below renewal_retry_base_seconds"
                    .to_string(),
            );
        }

        if matches!(self.storage.backend, StorageBackend::Postgres) && self.database.url.is_empty()
        {
            return Err("Database URL cannot be empty for the postgres backend".to_string());
        }
        if matches!(self.lock.backend, LockBackend::Redis) && self.redis.url.is_empty() {
            return Err("Redis URL cannot be empty for the redis lock backend".to_string());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn valid_settings() -> Settings {
        let mut settings = Settings::default();
        settings.licensing.install_id = "install-1".to_string();
        settings.licensing.install_secret = "secret".to_string();
        settings
    }

    #[test]
    fn test_defaults_follow_documented_values() {
        let settings = Settings::default();
        assert_eq!(settings.runner.tick_interval_seconds, 60);
        assert_eq!(settings.runner.lock_ttl_seconds, 180);
        assert_eq!(settings.licensing.lease_grace_period_seconds, 21600);
        assert!(!settings.runner.runner_id.is_empty());
    }

    #[test]
    fn test_default_settings_with_credentials_are_valid() {
        assert!(valid_settings().validate().is_ok());
    }

    #[test]
    fn test_validation_requires_credentials() {
        assert!(Settings::default().validate().is_err());
    }

    #[test]
    fn test_validation_catches_zero_tick_interval() {
        let mut settings = valid_settings();
        settings.runner.tick_interval_seconds = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_validation_catches_ttl_too_short_to_refresh() {
        let mut settings = valid_settings();
        settings.runner.lock_ttl_seconds = 2;
        assert!(settings.validate().is_err());
        settings.runner.lock_ttl_seconds = 3;
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_execution_timeout_may_exceed_lock_ttl() {
        let mut settings = valid_settings();
        settings.runner.lock_ttl_seconds = 180;
        settings.runner.job_execution_timeout_seconds = 900;
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_validation_catches_cap_below_base() {
        let mut settings = valid_settings();
        settings.runner.retry_backoff_base_seconds = 60;
        settings.runner.retry_backoff_cap_seconds = 30;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_validation_catches_empty_database_url_for_postgres() {
        let mut settings = valid_settings();
        settings.storage.backend = StorageBackend::Postgres;
        settings.database.url = String::new();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_load_from_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = std::fs::File::create(dir.path().join("default.toml")).unwrap();
        writeln!(
            file,
            r#"
[runner]
runner_id = "runner-test"
retry_backoff_base_seconds = 10

[licensing]
install_id = "install-9"
install_secret = "s3cret"

[lock]
backend = "redis"

[observability]
log_format = "compact"
"#
        )
        .unwrap();

        let settings = Settings::load_from_path(dir.path()).unwrap();
        assert_eq!(settings.runner.runner_id, "runner-test");
        assert_eq!(settings.runner.retry_backoff_base_seconds, 10);
        assert_eq!(settings.runner.tick_interval_seconds, 60);
        assert_eq!(settings.lock.backend, LockBackend::Redis);
        assert_eq!(settings.storage.backend, StorageBackend::Memory);
        assert_eq!(settings.observability.log_format, LogFormat::Compact);
        assert_eq!(settings.observability.log_level, "info");
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_licensing_debug_redacts_secret() {
        let settings = valid_settings();
        let rendered = format!("{:?}", settings.licensing);
        assert!(!rendered.contains("\"secret\""));
        assert!(rendered.contains("<redacted>"));
    }
}
