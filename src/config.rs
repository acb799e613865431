use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::engine::EngineOptions;
use crate::limits::*;
use crate::numbers::RandomBookingNumbers;

const WAL_FILE: &str = "stockbook.wal";

/// Process configuration, read from `STOCKBOOK_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub data_dir: PathBuf,
    pub lock_timeout: Duration,
    pub booking_number_attempts: u32,
    pub booking_prefix: String,
    pub metrics_port: Option<u16>,
    /// Rewrite the WAL after replay.
    pub compact: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            lock_timeout: Duration::from_millis(DEFAULT_LOCK_TIMEOUT_MS),
            booking_number_attempts: DEFAULT_BOOKING_NUMBER_ATTEMPTS,
            booking_prefix: DEFAULT_BOOKING_PREFIX.to_string(),
            metrics_port: None,
            compact: false,
        }
    }
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    lookup(key).and_then(|s| s.trim().parse().ok())
}

impl EngineConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Unset or unparsable values fall back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            data_dir: lookup("STOCKBOOK_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            lock_timeout: parsed::<u64>(&lookup, "STOCKBOOK_LOCK_TIMEOUT_MS")
                .filter(|ms| *ms > 0)
                .map(Duration::from_millis)
                .unwrap_or(defaults.lock_timeout),
            booking_number_attempts: parsed::<u32>(&lookup, "STOCKBOOK_BOOKING_NUMBER_ATTEMPTS")
                .filter(|n| *n > 0)
                .unwrap_or(defaults.booking_number_attempts),
            booking_prefix: lookup("STOCKBOOK_BOOKING_PREFIX")
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .unwrap_or(defaults.booking_prefix),
            metrics_port: parsed(&lookup, "STOCKBOOK_METRICS_PORT"),
            compact: lookup("STOCKBOOK_COMPACT")
                .map(|s| matches!(s.trim(), "1" | "true" | "yes"))
                .unwrap_or(defaults.compact),
        }
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join(WAL_FILE)
    }

    pub fn options(&self) -> EngineOptions {
        EngineOptions {
            lock_timeout: self.lock_timeout,
            booking_number_attempts: self.booking_number_attempts,
            booking_prefix: self.booking_prefix.clone(),
            numbers: Arc::new(RandomBookingNumbers),
        }
    }
}
