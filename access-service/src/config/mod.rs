use service_core::config::{self as core_config, get_env, parse_env, Environment};
use service_core::error::AppError;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::services::oracle::{RemoteOracleConfig, RetryPolicy};

#[derive(Debug, Clone)]
pub struct AccessConfig {
    pub common: core_config::Config,
    pub environment: Environment,
    pub service_name: String,
    pub service_version: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub storage: StorageBackend,
    pub database: DatabaseConfig,
    pub oracle: OracleConfig,
    pub biometric: BiometricConfig,
    pub notification: NotificationConfig,
    /// Seconds between in-process maintenance passes; 0 disables the loop.
    pub maintenance_interval_seconds: u64,
    pub allowed_origins: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    Postgres,
    Memory,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OracleMode {
    /// In-process RBAC engine.
    Local,
    Remote,
}

#[derive(Debug, Clone)]
pub struct OracleConfig {
    pub mode: OracleMode,
    pub url: String,
    pub api_key: String,
    pub timeout_ms: u64,
    /// Upper bound on retrying transient failures; 0 disables retries.
    pub retry_max_elapsed_ms: u64,
}

#[derive(Debug, Clone)]
pub struct BiometricConfig {
    pub secret: String,
    pub token_ttl_seconds: i64,
}

#[derive(Debug, Clone)]
pub struct NotificationConfig {
    pub webhook_url: Option<String>,
    pub timeout_ms: u64,
}

impl OracleConfig {
    pub fn remote(&self) -> RemoteOracleConfig {
        RemoteOracleConfig {
            base_url: self.url.clone(),
            api_key: self.api_key.clone(),
            timeout: Duration::from_millis(self.timeout_ms),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        if self.retry_max_elapsed_ms == 0 {
            RetryPolicy::none()
        } else {
            RetryPolicy {
                max_elapsed: Some(Duration::from_millis(self.retry_max_elapsed_ms)),
                ..Default::default()
            }
        }
    }
}

impl AccessConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common = core_config::Config::load()?;
        let environment = Environment::current()?;
        let is_prod = environment.is_prod();

        let storage: StorageBackend = parse_env("STORAGE_BACKEND", Some("memory"), is_prod)?;
        let oracle_mode: OracleMode = parse_env("ORACLE_MODE", Some("local"), is_prod)?;

        let config = AccessConfig {
            common,
            environment,
            service_name: get_env("SERVICE_NAME", Some("access-service"), is_prod)?,
            service_version: get_env("SERVICE_VERSION", Some(env!("CARGO_PKG_VERSION")), is_prod)?,
            log_level: get_env("LOG_LEVEL", Some("info"), is_prod)?,
            otlp_endpoint: optional_env("OTEL_EXPORTER_OTLP_ENDPOINT"),
            storage,
            database: DatabaseConfig {
                url: match storage {
                    StorageBackend::Postgres => get_env("DATABASE_URL", None, is_prod)?,
                    StorageBackend::Memory => optional_env("DATABASE_URL").unwrap_or_default(),
                },
                max_connections: parse_env("DATABASE_MAX_CONNECTIONS", Some("10"), false)?,
                min_connections: parse_env("DATABASE_MIN_CONNECTIONS", Some("1"), false)?,
            },
            oracle: OracleConfig {
                mode: oracle_mode,
                url: match oracle_mode {
                    OracleMode::Remote => get_env("ORACLE_URL", None, is_prod)?,
                    OracleMode::Local => String::new(),
                },
                api_key: match oracle_mode {
                    OracleMode::Remote => get_env("ORACLE_API_KEY", None, is_prod)?,
                    OracleMode::Local => String::new(),
                },
                timeout_ms: parse_env("ORACLE_TIMEOUT_MS", Some("5000"), false)?,
                retry_max_elapsed_ms: parse_env("ORACLE_RETRY_MAX_ELAPSED_MS", Some("10000"), false)?,
            },
            biometric: BiometricConfig {
                secret: get_env("BIOMETRIC_SECRET", Some("dev-biometric-secret"), is_prod)?,
                token_ttl_seconds: parse_env("BIOMETRIC_TOKEN_TTL_SECONDS", Some("300"), false)?,
            },
            notification: NotificationConfig {
                webhook_url: optional_env("NOTIFICATION_WEBHOOK_URL"),
                timeout_ms: parse_env("NOTIFICATION_TIMEOUT_MS", Some("3000"), false)?,
            },
            maintenance_interval_seconds: parse_env(
                "MAINTENANCE_INTERVAL_SECONDS",
                Some("60"),
                false,
            )?,
            allowed_origins: get_env("ALLOWED_ORIGINS", Some("http://localhost:3000"), is_prod)?
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), AppError> {
        if self.common.port == 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "PORT must be greater than 0"
            )));
        }

        if self.biometric.token_ttl_seconds <= 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "BIOMETRIC_TOKEN_TTL_SECONDS must be positive"
            )));
        }

        if self.database.min_connections > self.database.max_connections {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "DATABASE_MIN_CONNECTIONS must not exceed DATABASE_MAX_CONNECTIONS"
            )));
        }

        if self.environment.is_prod() {
            if self.storage == StorageBackend::Memory {
                return Err(AppError::ConfigError(anyhow::anyhow!(
                    "STORAGE_BACKEND=memory is not allowed in production"
                )));
            }

            if self.biometric.secret.len() < 32 {
                return Err(AppError::ConfigError(anyhow::anyhow!(
                    "BIOMETRIC_SECRET must be at least 32 bytes in production"
                )));
            }

            if self.allowed_origins.iter().any(|o| o == "*") {
                return Err(AppError::ConfigError(anyhow::anyhow!(
                    "Wildcard CORS origin not allowed in production"
                )));
            }

            if self.oracle.mode == OracleMode::Local {
                tracing::warn!("Using the in-process authorization oracle in production");
            }
        }

        Ok(())
    }
}

fn optional_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

impl FromStr for StorageBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(StorageBackend::Postgres),
            "memory" => Ok(StorageBackend::Memory),
            _ => Err(format!("Invalid storage backend: {}", s)),
        }
    }
}

impl FromStr for OracleMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "local" => Ok(OracleMode::Local),
            "remote" => Ok(OracleMode::Remote),
            _ => Err(format!("Invalid oracle mode: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const KEYS: &[&str] = &[
        "ENVIRONMENT",
        "STORAGE_BACKEND",
        "DATABASE_URL",
        "ORACLE_MODE",
        "ORACLE_URL",
        "ORACLE_API_KEY",
        "BIOMETRIC_TOKEN_TTL_SECONDS",
        "NOTIFICATION_WEBHOOK_URL",
    ];

    fn clear() {
        for key in KEYS {
            env::remove_var(key);
        }
    }

    #[test]
    #[serial]
    fn dev_defaults_use_memory_and_local_oracle() {
        clear();
        let config = AccessConfig::from_env().unwrap();
        assert_eq!(config.storage, StorageBackend::Memory);
        assert_eq!(config.oracle.mode, OracleMode::Local);
        assert_eq!(config.biometric.token_ttl_seconds, 300);
        assert!(config.notification.webhook_url.is_none());
    }

    #[test]
    #[serial]
    fn postgres_backend_requires_database_url() {
        clear();
        env::set_var("STORAGE_BACKEND", "postgres");
        assert!(AccessConfig::from_env().is_err());
        env::set_var("DATABASE_URL", "postgres://localhost/access");
        assert_eq!(
            AccessConfig::from_env().unwrap().database.url,
            "postgres://localhost/access"
        );
        clear();
    }

    #[test]
    #[serial]
    fn remote_oracle_requires_url_and_key() {
        clear();
        env::set_var("ORACLE_MODE", "remote");
        assert!(AccessConfig::from_env().is_err());
        env::set_var("ORACLE_URL", "http://oracle.local");
        env::set_var("ORACLE_API_KEY", "k");
        let config = AccessConfig::from_env().unwrap();
        assert_eq!(config.oracle.remote().base_url, "http://oracle.local");
        clear();
    }

    #[test]
    #[serial]
    fn non_positive_token_ttl_is_rejected() {
        clear();
        env::set_var("BIOMETRIC_TOKEN_TTL_SECONDS", "0");
        assert!(AccessConfig::from_env().is_err());
        clear();
    }

    #[test]
    fn zero_retry_budget_disables_retries() {
        let oracle = OracleConfig {
            mode: OracleMode::Local,
            url: String::new(),
            api_key: String::new(),
            timeout_ms: 100,
            retry_max_elapsed_ms: 0,
        };
        assert!(oracle.retry_policy().max_elapsed.is_none());
    }
}
