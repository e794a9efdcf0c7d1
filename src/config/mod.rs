use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{EngineError, Result};

/// Recognized `config.json` options (spec §6.1). Every field is optional in the file;
/// absent fields fall back to the documented defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// 1-based index into the `accounts` table, or `None` if no account is active.
    pub active_account: Option<u32>,
    pub cache: CacheConfig,
    pub reconnect: ReconnectConfig,
    pub shutdown_timeout_ms: u64,
    pub inter_job_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub staleness_peers: DurationMs,
    pub staleness_dialogs: DurationMs,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_attempts: u32,
    pub backoff_multiplier: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            active_account: None,
            cache: CacheConfig::default(),
            reconnect: ReconnectConfig::default(),
            shutdown_timeout_ms: 30_000,
            inter_job_delay_ms: 100,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            staleness_peers: DurationMs(7 * 24 * 60 * 60 * 1000),
            staleness_dialogs: DurationMs(7 * 24 * 60 * 60 * 1000),
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1_000,
            max_delay_ms: 60_000,
            max_attempts: 10,
            backoff_multiplier: 2.0,
        }
    }
}

/// A duration in milliseconds, (de)serialized from the spec's `<n>(s|m|h|d|w)` grammar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DurationMs(pub u64);

impl Serialize for DurationMs {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&format!("{}ms", self.0))
    }
}

impl<'de> Deserialize<'de> for DurationMs {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        parse_duration_ms(&raw)
            .map(DurationMs)
            .map_err(serde::de::Error::custom)
    }
}

/// Parses `<n>(s|m|h|d|w)` into milliseconds, per spec §6.1.
pub fn parse_duration_ms(raw: &str) -> std::result::Result<u64, String> {
    if raw.is_empty() {
        return Err("empty duration string".to_string());
    }
    // Also accept a bare "<n>ms" for round-tripping our own serialization.
    if let Some(digits) = raw.strip_suffix("ms") {
        return digits
            .parse::<u64>()
            .map_err(|e| format!("invalid duration '{raw}': {e}"));
    }
    let (digits, unit) = raw.split_at(raw.len() - 1);
    let n: u64 = digits
        .parse()
        .map_err(|e| format!("invalid duration '{raw}': {e}"))?;
    let multiplier_secs: u64 = match unit {
        "s" => 1,
        "m" => 60,
        "h" => 60 * 60,
        "d" => 24 * 60 * 60,
        "w" => 7 * 24 * 60 * 60,
        other => return Err(format!("unknown duration unit '{other}' in '{raw}'")),
    };
    Ok(n * multiplier_secs * 1000)
}

impl Config {
    /// Loads `config.json` from `data_dir`, creating a default file if none exists,
    /// following the teacher's `Config::load` shape (read-or-seed, then validate).
    pub fn load(data_dir: &Path) -> Result<Self> {
        fs::create_dir_all(data_dir)?;
        let config_path = data_dir.join("config.json");

        let config = if config_path.exists() {
            info!(path = %config_path.display(), "loading configuration");
            let content = fs::read_to_string(&config_path)?;
            serde_json::from_str(&content).map_err(|e| {
                EngineError::Config(format!("failed to parse {}: {e}", config_path.display()))
            })?
        } else {
            warn!(path = %config_path.display(), "config file not found, writing defaults");
            let default_config = Self::default();
            default_config.save(&config_path)?;
            default_config
        };

        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// `${TELEGRAM_SYNC_CLI_DATA_DIR}`, defaulting to the platform user data dir,
    /// per spec §6.1. Read once at startup; the engine treats this as process-wide
    /// global state, per spec §9.
    pub fn data_dir() -> PathBuf {
        if let Ok(dir) = std::env::var("TELEGRAM_SYNC_CLI_DATA_DIR") {
            return PathBuf::from(dir);
        }
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("telegram-sync-cli")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_duration_units() {
        assert_eq!(parse_duration_ms("30s").unwrap(), 30_000);
        assert_eq!(parse_duration_ms("5m").unwrap(), 5 * 60 * 1000);
        assert_eq!(parse_duration_ms("2h").unwrap(), 2 * 60 * 60 * 1000);
        assert_eq!(parse_duration_ms("1d").unwrap(), 24 * 60 * 60 * 1000);
        assert_eq!(parse_duration_ms("1w").unwrap(), 7 * 24 * 60 * 60 * 1000);
    }

    #[test]
    fn rejects_malformed_duration() {
        assert!(parse_duration_ms("").is_err());
        assert!(parse_duration_ms("abc").is_err());
        assert!(parse_duration_ms("10x").is_err());
    }

    #[test]
    fn load_creates_default_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(dir.path()).unwrap();
        assert_eq!(config.reconnect.max_attempts, 10);
        assert!(dir.path().join("config.json").exists());
    }

    #[test]
    fn load_round_trips_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.reconnect.max_attempts = 3;
        config.save(&dir.path().join("config.json")).unwrap();

        let reloaded = Config::load(dir.path()).unwrap();
        assert_eq!(reloaded.reconnect.max_attempts, 3);
    }
}
