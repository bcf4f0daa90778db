//! Configuration loading and representation.
//!
//! All settings come from environment variables. `DATABASE_URL` wins over the
//! individual `DB_*` parts when both are present.

use std::time::Duration;

use thiserror::Error;

use brewline_observability::LogFormat;

pub const DEFAULT_DB_USER: &str = "postgres";
pub const DEFAULT_DB_PASSWORD: &str = "latte";
pub const DEFAULT_DB_ADDRESS: &str = "localhost";
pub const DEFAULT_DB_PORT: u16 = 5432;
pub const DEFAULT_DB_NAME: &str = "frappuccino";
pub const DEFAULT_MAX_CONNECTIONS: u32 = 10;
pub const DEFAULT_REQUEST_DEADLINE: Duration = Duration::from_millis(5000);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl ConfigError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct Config {
    pub database_url: String,
    pub max_connections: u32,
    pub request_deadline: Duration,
    pub log_format: LogFormat,
}

impl core::fmt::Debug for Config {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Config")
            .field("database_url", &redact(&self.database_url))
            .field("max_connections", &self.max_connections)
            .field("request_deadline", &self.request_deadline)
            .field("log_format", &self.log_format)
            .finish()
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let database_url = match var("DATABASE_URL") {
            Some(url) => url,
            None => {
                let port = match var("DB_PORT") {
                    Some(raw) => raw
                        .trim()
                        .parse::<u16>()
                        .map_err(|e| ConfigError::invalid("DB_PORT", e.to_string()))?,
                    None => DEFAULT_DB_PORT,
                };
                format!(
                    "postgres://{}:{}@{}:{}/{}",
                    var("DB_USER").unwrap_or_else(|| DEFAULT_DB_USER.to_string()),
                    var("DB_PASSWORD").unwrap_or_else(|| DEFAULT_DB_PASSWORD.to_string()),
                    var("DB_ADDRESS").unwrap_or_else(|| DEFAULT_DB_ADDRESS.to_string()),
                    port,
                    var("DB_NAME").unwrap_or_else(|| DEFAULT_DB_NAME.to_string()),
                )
            }
        };

        let max_connections = match var("DB_MAX_CONNECTIONS") {
            Some(raw) => {
                let n = raw
                    .trim()
                    .parse::<u32>()
                    .map_err(|e| ConfigError::invalid("DB_MAX_CONNECTIONS", e.to_string()))?;
                if n == 0 {
                    return Err(ConfigError::invalid("DB_MAX_CONNECTIONS", "must be at least 1"));
                }
                n
            }
            None => DEFAULT_MAX_CONNECTIONS,
        };

        let request_deadline = match var("REQUEST_DEADLINE_MS") {
            Some(raw) => {
                let ms = raw
                    .trim()
                    .parse::<u64>()
                    .map_err(|e| ConfigError::invalid("REQUEST_DEADLINE_MS", e.to_string()))?;
                if ms == 0 {
                    return Err(ConfigError::invalid("REQUEST_DEADLINE_MS", "must be at least 1"));
                }
                Duration::from_millis(ms)
            }
            None => DEFAULT_REQUEST_DEADLINE,
        };

        let log_format = match var("LOG_FORMAT") {
            Some(raw) => raw
                .parse::<LogFormat>()
                .map_err(|e| ConfigError::invalid("LOG_FORMAT", e.to_string()))?,
            None => LogFormat::default(),
        };

        Ok(Self {
            database_url,
            max_connections,
            request_deadline,
            log_format,
        })
    }
}

/// Hide the password part of a connection URL.
fn redact(url: &str) -> String {
    let Some((scheme, rest)) = url.split_once("://") else {
        return url.to_string();
    };
    let Some((credentials, host)) = rest.rsplit_once('@') else {
        return url.to_string();
    };
    match credentials.split_once(':') {
        Some((user, _)) => format!("{scheme}://{user}:***@{host}"),
        None => url.to_string(),
    }
}
