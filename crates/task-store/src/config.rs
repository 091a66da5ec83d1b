//! Store configuration loaded from environment variables.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Deployment environment the process runs in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Environment {
    #[default]
    Local,
    Test,
    Dev,
    Stg,
    Prd,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Local => "local",
            Environment::Test => "test",
            Environment::Dev => "dev",
            Environment::Stg => "stg",
            Environment::Prd => "prd",
        }
    }

    /// Local and test runs log for humans; deployed ones log JSON.
    pub fn is_interactive(&self) -> bool {
        matches!(self, Environment::Local | Environment::Test)
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Environment {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(Environment::Local),
            "test" => Ok(Environment::Test),
            "dev" => Ok(Environment::Dev),
            "stg" => Ok(Environment::Stg),
            "prd" => Ok(Environment::Prd),
            other => Err(ConfigError::Invalid {
                key: "ENVIRONMENT",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value {value:?} for {key}")]
    Invalid { key: &'static str, value: String },
}

/// Store configuration.
///
/// Reads from environment variables:
/// - `ENVIRONMENT`: one of `local|test|dev|stg|prd` (default: `local`)
/// - `DATABASE_URL`: PostgreSQL URL; unset selects the in-memory store
/// - `DB_MAX_CONNECTIONS`: pool size (default: `5`)
/// - `RUST_LOG`: tracing filter directive (default: `"info"`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    pub environment: Environment,
    pub database_url: Option<String>,
    pub max_connections: u32,
    pub log_level: String,
}

impl StoreConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from any key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let environment = match lookup("ENVIRONMENT") {
            Some(value) => value.parse()?,
            None => defaults.environment,
        };
        let max_connections = match lookup("DB_MAX_CONNECTIONS") {
            Some(value) => value.parse().map_err(|_| ConfigError::Invalid {
                key: "DB_MAX_CONNECTIONS",
                value,
            })?,
            None => defaults.max_connections,
        };

        Ok(Self {
            environment,
            database_url: lookup("DATABASE_URL").filter(|url| !url.is_empty()),
            max_connections,
            log_level: lookup("RUST_LOG").unwrap_or(defaults.log_level),
        })
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            environment: Environment::Local,
            database_url: None,
            max_connections: 5,
            log_level: "info".to_string(),
        }
    }
}
