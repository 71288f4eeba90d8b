use std::collections::HashSet;
use std::path::PathBuf;
use std::str::FromStr;

use tracing::warn;

use crate::engine::EngineSettings;
use crate::model::{HOUR_MS, Ms};

/// Server settings, read once at startup from `SLOTGUARD_*` variables.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub password: String,
    pub admin_users: HashSet<String>,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub lesson_notice_hours: u32,
    pub session_notice_hours: u32,
    pub txn_max_retries: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 5433,
            data_dir: PathBuf::from("./data"),
            password: "slotguard".into(),
            admin_users: ["admin".to_string()].into(),
            max_connections: 256,
            compact_threshold: 1000,
            metrics_port: None,
            lesson_notice_hours: 12,
            session_notice_hours: 3,
            txn_max_retries: 8,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Malformed values are logged and ignored.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let d = Self::default();
        let admin_users = match lookup("SLOTGUARD_ADMIN_USERS") {
            Some(list) => list
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect(),
            None => d.admin_users,
        };
        Self {
            bind: lookup("SLOTGUARD_BIND").unwrap_or(d.bind),
            port: parsed(&lookup, "SLOTGUARD_PORT", d.port),
            data_dir: lookup("SLOTGUARD_DATA_DIR").map_or(d.data_dir, PathBuf::from),
            password: lookup("SLOTGUARD_PASSWORD").unwrap_or(d.password),
            admin_users,
            max_connections: parsed(&lookup, "SLOTGUARD_MAX_CONNECTIONS", d.max_connections),
            compact_threshold: parsed(&lookup, "SLOTGUARD_COMPACT_THRESHOLD", d.compact_threshold),
            metrics_port: lookup("SLOTGUARD_METRICS_PORT")
                .and_then(|raw| parse_or_warn("SLOTGUARD_METRICS_PORT", &raw)),
            lesson_notice_hours: parsed(&lookup, "SLOTGUARD_LESSON_NOTICE_HOURS", d.lesson_notice_hours),
            session_notice_hours: parsed(
                &lookup,
                "SLOTGUARD_SESSION_NOTICE_HOURS",
                d.session_notice_hours,
            ),
            txn_max_retries: parsed(&lookup, "SLOTGUARD_TXN_MAX_RETRIES", d.txn_max_retries),
        }
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            lesson_notice_ms: Ms::from(self.lesson_notice_hours) * HOUR_MS,
            session_notice_ms: Ms::from(self.session_notice_hours) * HOUR_MS,
            max_txn_retries: self.txn_max_retries,
        }
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("slotguard.wal")
    }
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    lookup(key)
        .and_then(|raw| parse_or_warn(key, &raw))
        .unwrap_or(default)
}

fn parse_or_warn<T: FromStr>(key: &str, raw: &str) -> Option<T> {
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!("ignoring malformed {key}={raw:?}, using default");
            None
        }
    }
}
