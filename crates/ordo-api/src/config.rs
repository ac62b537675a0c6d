use std::collections::HashMap;
use std::env;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: String,
    /// SQLite database path; `:memory:` is accepted for throwaway runs.
    pub database_path: String,
    /// Hard cap on the `limit` query parameter of `/sync/pull`.
    pub pull_page_cap: i64,
    /// Interval between SSE keepalive pings.
    pub sse_keepalive: Duration,
    /// Insert demo reference data on first start.
    pub seed_demo_data: bool,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let values: HashMap<String, String> = env::vars().collect();
        Self::from_lookup(|name| values.get(name).cloned())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let bind_addr = value_or_default(&lookup, "ORDO_API_BIND_ADDR", "127.0.0.1:8080");
        let database_path = value_or_default(&lookup, "ORDO_DATABASE_PATH", "ordo.db");

        let pull_page_cap = value_or_default(&lookup, "ORDO_PULL_PAGE_CAP", "500")
            .parse::<i64>()
            .map_err(|_| {
                ConfigError::Invalid("ORDO_PULL_PAGE_CAP must be an integer in [1, 5000]".to_string())
            })?;
        if !(1..=5_000).contains(&pull_page_cap) {
            return Err(ConfigError::Invalid(
                "ORDO_PULL_PAGE_CAP must be in [1, 5000]".to_string(),
            ));
        }

        let sse_keepalive_secs = value_or_default(&lookup, "ORDO_SSE_KEEPALIVE_SECS", "30")
            .parse::<u64>()
            .map_err(|_| {
                ConfigError::Invalid(
                    "ORDO_SSE_KEEPALIVE_SECS must be an integer in [1, 300]".to_string(),
                )
            })?;
        if !(1..=300).contains(&sse_keepalive_secs) {
            return Err(ConfigError::Invalid(
                "ORDO_SSE_KEEPALIVE_SECS must be in [1, 300]".to_string(),
            ));
        }

        let seed_demo_data = matches!(
            value_or_default(&lookup, "ORDO_SEED_DEMO", "0").as_str(),
            "1" | "true" | "yes"
        );

        Ok(Self {
            bind_addr,
            database_path,
            pull_page_cap,
            sse_keepalive: Duration::from_secs(sse_keepalive_secs),
            seed_demo_data,
        })
    }
}

fn value_or_default(lookup: impl Fn(&str) -> Option<String>, name: &str, default: &str) -> String {
    lookup(name)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| default.to_string())
}
