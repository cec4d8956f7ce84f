//! Process configuration read from the environment.

use std::time::Duration;

use thiserror::Error;

use crate::sync::DEFAULT_CAPACITY;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {name}: {value:?}")]
    Invalid { name: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub host: String,
    pub port: u16,
    /// PostgreSQL connection string. The in-memory store is used when unset.
    pub database_url: Option<String>,
    pub database_max_connections: u32,
    pub jwt_secret: String,
    pub sync_channel_capacity: usize,
    pub worker_poll_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            database_url: None,
            database_max_connections: 10,
            jwt_secret: "secret".to_string(),
            sync_channel_capacity: DEFAULT_CAPACITY,
            worker_poll_interval: Duration::from_secs(300),
        }
    }
}

impl Config {
    /// Reads the process environment. Call `dotenv()` first to pick up a
    /// `.env` file.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds the configuration from an arbitrary variable source. Unset or
    /// empty variables fall back to their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());
        let defaults = Config::default();

        Ok(Self {
            host: get("SERVER_HOST").unwrap_or(defaults.host),
            port: parse::<u16, _>(&get, "SERVER_PORT")?.unwrap_or(defaults.port),
            database_url: get("DATABASE_URL"),
            database_max_connections: parse::<u32, _>(&get, "DATABASE_MAX_CONNECTIONS")?
                .unwrap_or(defaults.database_max_connections),
            jwt_secret: get("JWT_SECRET").unwrap_or(defaults.jwt_secret),
            sync_channel_capacity: parse::<usize, _>(&get, "SYNC_CHANNEL_CAPACITY")?
                .filter(|capacity| *capacity > 0)
                .unwrap_or(defaults.sync_channel_capacity),
            worker_poll_interval: parse::<u64, _>(&get, "WORKER_POLL_INTERVAL_SECONDS")?
                .filter(|seconds| *seconds > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.worker_poll_interval),
        })
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse<T, G>(get: &G, name: &'static str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    G: Fn(&str) -> Option<String>,
{
    match get(name) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { name, value }),
    }
}
