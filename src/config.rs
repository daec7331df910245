use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono::FixedOffset;
use tracing::warn;

use crate::engine::RetryPolicy;

/// Process configuration, read once at start-up from `CHAIRLINE_*` variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub utc_offset_minutes: i32,
    pub retry_max_attempts: u32,
    pub retry_base_ms: u64,
    pub retry_max_ms: u64,
    pub attempt_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 7433,
            data_dir: PathBuf::from("./data"),
            max_connections: 256,
            compact_threshold: 1000,
            metrics_port: None,
            utc_offset_minutes: 0,
            retry_max_attempts: 3,
            retry_base_ms: 25,
            retry_max_ms: 250,
            attempt_timeout_ms: 2000,
        }
    }
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    match lookup(key) {
        None => default,
        Some(raw) => match raw.trim().parse() {
            Ok(v) => v,
            Err(_) => {
                warn!("ignoring {key}={raw:?}: not a valid value");
                default
            }
        },
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let d = Self::default();
        let mut cfg = Self {
            bind: lookup("CHAIRLINE_BIND").unwrap_or(d.bind),
            port: parsed(&lookup, "CHAIRLINE_PORT", d.port),
            data_dir: lookup("CHAIRLINE_DATA_DIR").map_or(d.data_dir, PathBuf::from),
            max_connections: parsed(&lookup, "CHAIRLINE_MAX_CONNECTIONS", d.max_connections),
            compact_threshold: parsed(&lookup, "CHAIRLINE_COMPACT_THRESHOLD", d.compact_threshold),
            metrics_port: lookup("CHAIRLINE_METRICS_PORT").and_then(|raw| match raw.parse() {
                Ok(p) => Some(p),
                Err(_) => {
                    warn!("ignoring CHAIRLINE_METRICS_PORT={raw:?}: not a port");
                    None
                }
            }),
            utc_offset_minutes: parsed(&lookup, "CHAIRLINE_UTC_OFFSET_MINUTES", 0),
            retry_max_attempts: parsed(&lookup, "CHAIRLINE_RETRY_MAX_ATTEMPTS", d.retry_max_attempts),
            retry_base_ms: parsed(&lookup, "CHAIRLINE_RETRY_BASE_MS", d.retry_base_ms),
            retry_max_ms: parsed(&lookup, "CHAIRLINE_RETRY_MAX_MS", d.retry_max_ms),
            attempt_timeout_ms: parsed(&lookup, "CHAIRLINE_ATTEMPT_TIMEOUT_MS", d.attempt_timeout_ms),
        };
        if cfg.max_connections == 0 {
            warn!("CHAIRLINE_MAX_CONNECTIONS must be positive, using {}", d.max_connections);
            cfg.max_connections = d.max_connections;
        }
        if cfg.utc_offset().is_none() {
            warn!(
                "CHAIRLINE_UTC_OFFSET_MINUTES={} is out of range, using UTC",
                cfg.utc_offset_minutes
            );
            cfg.utc_offset_minutes = 0;
        }
        cfg
    }

    pub fn utc_offset(&self) -> Option<FixedOffset> {
        FixedOffset::east_opt(self.utc_offset_minutes.checked_mul(60)?)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry_max_attempts,
            Duration::from_millis(self.retry_base_ms),
            Duration::from_millis(self.retry_max_ms),
            Duration::from_millis(self.attempt_timeout_ms),
        )
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("chairline.wal")
    }
}
