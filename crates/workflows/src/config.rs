use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::store::{DatabaseConfig, DatabaseType};
use crate::workflow::StepDefaults;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Fallback step settings for steps that do not configure their own.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EngineConfig {
    pub default_max_retries: u32,
    pub default_retry_interval_ms: u64,
    pub default_step_timeout_secs: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_max_retries: 0,
            default_retry_interval_ms: 0,
            default_step_timeout_secs: None,
        }
    }
}

impl EngineConfig {
    pub fn step_defaults(&self) -> StepDefaults {
        StepDefaults {
            max_retries: self.default_max_retries,
            retry_interval: Duration::from_millis(self.default_retry_interval_ms),
            timeout: self.default_step_timeout_secs.map(Duration::from_secs),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn env_parse<T: std::str::FromStr>(key: &str) -> crate::Result<Option<T>> {
    match std::env::var(key) {
        Ok(value) => value
            .parse()
            .map(Some)
            .map_err(|_| crate::Error::Config(format!("{} has an invalid value: {}", key, value))),
        Err(_) => Ok(None),
    }
}

impl Config {
    pub fn load() -> crate::Result<Self> {
        // Load environment variables from .env file if it exists
        let _ = dotenvy::dotenv();

        let db_type = match std::env::var("DATABASE_TYPE") {
            Ok(value) => value.parse::<DatabaseType>().map_err(crate::Error::Config)?,
            Err(_) => DatabaseType::Sqlite,
        };

        let config = Config {
            database: DatabaseConfig {
                db_type,
                sqlite_path: std::env::var("SQLITE_PATH")
                    .map(PathBuf::from)
                    .ok()
                    .or_else(|| Some(PathBuf::from("data/medusa-workflows.db"))),
                connection_string: std::env::var("DATABASE_URL").ok(),
                max_connections: env_parse("DATABASE_MAX_CONNECTIONS")?.unwrap_or(5),
            },
            engine: EngineConfig {
                default_max_retries: env_parse("WORKFLOW_DEFAULT_MAX_RETRIES")?.unwrap_or(0),
                default_retry_interval_ms: env_parse("WORKFLOW_DEFAULT_RETRY_INTERVAL_MS")?.unwrap_or(0),
                default_step_timeout_secs: env_parse("WORKFLOW_DEFAULT_STEP_TIMEOUT_SECS")?,
            },
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| default_log_level()),
        };

        config.database.validate().map_err(crate::Error::Config)?;
        if config.database.db_type == DatabaseType::Memory {
            tracing::warn!("DATABASE_TYPE=memory: runs will not survive a restart.");
        }

        Ok(config)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            engine: EngineConfig::default(),
            log_level: default_log_level(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_defaults_become_step_defaults() {
        let engine = EngineConfig {
            default_max_retries: 3,
            default_retry_interval_ms: 250,
            default_step_timeout_secs: Some(30),
        };
        let defaults = engine.step_defaults();
        assert_eq!(defaults.max_retries, 3);
        assert_eq!(defaults.retry_interval, Duration::from_millis(250));
        assert_eq!(defaults.timeout, Some(Duration::from_secs(30)));
        assert_eq!(EngineConfig::default().step_defaults(), StepDefaults::default());
    }

    #[test]
    fn default_config_uses_sqlite() {
        let config = Config::default();
        assert_eq!(config.database.db_type, DatabaseType::Sqlite);
        assert_eq!(config.log_level, "info");
    }
}
