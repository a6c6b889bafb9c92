use anyhow::{ensure, Context, Result};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use std::{env, str::FromStr};

const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8080";
const DEFAULT_POLL_INTERVAL_SECS: u64 = 5;
const MIN_POLL_INTERVAL_SECS: u64 = 2;
const DEFAULT_AUTOLEARN_MIN_SESSIONS: u32 = 10;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub database_url: String,
    pub poll_interval: Duration,
    /// Completed sessions from one location before it becomes a
    /// trusted household; 0 disables auto-learning.
    pub household_autolearn_min_sessions: u32,
    pub geoip_db: Option<PathBuf>,
}

fn parse_seconds(value: &str) -> Option<u64> {
    value.trim().trim_end_matches('s').parse::<u64>().ok()
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let bind = env::var("STREAMMON_ADDR").unwrap_or_else(|_| DEFAULT_BIND_ADDR.to_string());
        let bind_addr = SocketAddr::from_str(&bind).context("invalid STREAMMON_ADDR")?;

        let database_url = env::var("DATABASE_URL").context("DATABASE_URL must be set")?;

        let poll_interval_secs = env::var("POLL_INTERVAL")
            .ok()
            .and_then(|v| parse_seconds(&v))
            .unwrap_or(DEFAULT_POLL_INTERVAL_SECS);
        ensure!(
            poll_interval_secs >= MIN_POLL_INTERVAL_SECS,
            "POLL_INTERVAL must be at least {} seconds",
            MIN_POLL_INTERVAL_SECS
        );

        let household_autolearn_min_sessions = env::var("HOUSEHOLD_AUTOLEARN_MIN_SESSIONS")
            .ok()
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(DEFAULT_AUTOLEARN_MIN_SESSIONS);

        let geoip_db = env::var("GEOIP_DB").ok().map(PathBuf::from);

        Ok(Self {
            bind_addr,
            database_url,
            poll_interval: Duration::from_secs(poll_interval_secs),
            household_autolearn_min_sessions,
            geoip_db,
        })
    }
}
