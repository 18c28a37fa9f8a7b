//! Environment-backed configuration for `liveness-smoke`.

use std::{env, error::Error, fmt, path::PathBuf};

use liveness_core::{ConfigError as MonitorConfigError, MonitorConfig};

const DEFAULT_ACCOUNTS_TABLE: &str = "profiles";
const DEFAULT_CACHE_PATH: &str = "./.liveness-smoke/session.json";

#[derive(Debug, Clone, PartialEq)]
pub struct SmokeConfig {
    pub backend_url: String,
    pub api_key: String,
    pub accounts_table: String,
    /// Table read by the liveness probe; defaults to the accounts table.
    pub health_table: String,
    /// JSON file holding the cached session between runs.
    pub cache_path: PathBuf,
    pub monitor: MonitorConfig,
}

impl SmokeConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(mut lookup: F) -> Result<Self, ConfigError>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let backend_url = required_trimmed_env("LIVENESS_BACKEND_URL", &mut lookup)?;
        let api_key = required_trimmed_env("LIVENESS_BACKEND_API_KEY", &mut lookup)?;
        let accounts_table = optional_trimmed_env("LIVENESS_ACCOUNTS_TABLE", &mut lookup)
            .unwrap_or_else(|| DEFAULT_ACCOUNTS_TABLE.to_owned());
        let health_table = optional_trimmed_env("LIVENESS_HEALTH_TABLE", &mut lookup)
            .unwrap_or_else(|| accounts_table.clone());
        let cache_path = optional_trimmed_env("LIVENESS_CACHE_PATH", &mut lookup)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CACHE_PATH));
        let monitor = MonitorConfig::from_lookup(&mut lookup).map_err(ConfigError::Monitor)?;

        Ok(Self {
            backend_url,
            api_key,
            accounts_table,
            health_table,
            cache_path,
            monitor,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    Missing { key: &'static str },
    Monitor(MonitorConfigError),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Missing { key } => write!(f, "{key} must be set"),
            Self::Monitor(err) => write!(f, "{err}"),
        }
    }
}

impl Error for ConfigError {}

fn optional_trimmed_env<F>(key: &'static str, lookup: &mut F) -> Option<String>
where
    F: FnMut(&str) -> Option<String>,
{
    lookup(key)
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

fn required_trimmed_env<F>(key: &'static str, lookup: &mut F) -> Result<String, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    optional_trimmed_env(key, lookup).ok_or(ConfigError::Missing { key })
}
