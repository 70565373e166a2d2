use std::{env, fmt::Display, str::FromStr, time::Duration};

use tracing::{info, warn};

pub struct Config {
    pub port: u16,
    pub client_url: String,
    /// Shared counter store. When unset the server runs with in-process
    /// counters, which only coordinate within a single worker.
    pub redis_url: Option<String>,
    pub database_url: String,
    pub rate_limit_max_requests: u32,
    pub rate_limit_window_ms: u64,
    pub sync_interval_secs: u64,
    pub sync_initial_delay_secs: u64,
    pub voter_ttl_secs: u64,
}

impl Config {
    pub fn load() -> Self {
        Self {
            port: try_load("PORT", "3000"),
            client_url: try_load("CLIENT_URL", "http://localhost:5173"),
            redis_url: var("REDIS_URL").ok(),
            database_url: try_load("DATABASE_URL", "sqlite:livepoll.db"),
            rate_limit_max_requests: try_load("RATE_LIMIT_MAX_REQUESTS", "10"),
            rate_limit_window_ms: try_load("RATE_LIMIT_WINDOW_MS", "60000"),
            sync_interval_secs: try_load("SYNC_INTERVAL_SECS", "30"),
            sync_initial_delay_secs: try_load("SYNC_INITIAL_DELAY_SECS", "5"),
            voter_ttl_secs: try_load("VOTER_TTL_SECS", "604800"),
        }
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }

    pub fn sync_initial_delay(&self) -> Duration {
        Duration::from_secs(self.sync_initial_delay_secs)
    }

    pub fn voter_ttl(&self) -> Duration {
        Duration::from_secs(self.voter_ttl_secs)
    }
}

fn var(key: &str) -> Result<String, ()> {
    env::var(key).map_err(|_| {
        warn!("Environment variable {key} not found, using default");
    })
}

fn try_load<T: FromStr>(key: &str, default: &str) -> T
where
    T::Err: Display,
{
    var(key)
        .unwrap_or_else(|_| {
            info!("{key} not set, using default: {default}");
            default.to_string()
        })
        .parse()
        .map_err(|e| {
            warn!("Invalid {key} value: {e}");
        })
        .expect("Environment misconfigured!")
}
