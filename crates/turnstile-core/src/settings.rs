//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`Settings::default()`]
//! 2. If the settings file exists, deep-merge its values over the defaults
//! 3. Apply `TURNSTILE_*` environment overrides (highest priority)
//!
//! The result is validated before it is handed out.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::config::DriveConfig;

/// Errors that can occur when loading or parsing settings.
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("failed to read settings file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse settings JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid settings value: {0}")]
    InvalidValue(String),
}

/// Scheduler loop tuning.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SchedulerSettings {
    /// Delay between queue probes while idle.
    pub probe_interval_ms: u64,
    /// Upper bound on any single store or GPS call.
    pub collaborator_timeout_ms: u64,
    /// Reject new queue entries beyond this depth. Unbounded when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_queue_depth: Option<usize>,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            probe_interval_ms: 1_000,
            collaborator_timeout_ms: 5_000,
            max_queue_depth: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default level, overridden by RUST_LOG.
    pub level: String,
    /// JSON lines on stdout instead of human-readable output.
    pub json: bool,
    /// Persist warn+ events to SQLite.
    pub persist_warnings: bool,
    /// Path to the log database.
    pub log_db_path: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: true,
            persist_warnings: true,
            log_db_path: base_dir().join("logs.db").to_string_lossy().into_owned(),
        }
    }
}

/// Top-level settings for the turnstile service.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub drive: DriveConfig,
    pub scheduler: SchedulerSettings,
    pub database_path: String,
    pub logging: LoggingSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            drive: DriveConfig::default(),
            scheduler: SchedulerSettings::default(),
            database_path: base_dir().join("turnstile.db").to_string_lossy().into_owned(),
            logging: LoggingSettings::default(),
        }
    }
}

impl Settings {
    pub fn validate(&self) -> Result<(), SettingsError> {
        self.drive.validate()?;
        if self.scheduler.probe_interval_ms == 0 {
            return Err(SettingsError::InvalidValue("probeIntervalMs must be positive".into()));
        }
        if self.scheduler.collaborator_timeout_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "collaboratorTimeoutMs must be positive".into(),
            ));
        }
        if self.scheduler.max_queue_depth == Some(0) {
            return Err(SettingsError::InvalidValue("maxQueueDepth must be positive".into()));
        }
        Ok(())
    }
}

/// `~/.turnstile`, falling back to `/tmp` when HOME is unset.
pub fn base_dir() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".turnstile")
}

pub fn settings_path() -> PathBuf {
    base_dir().join("settings.json")
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults. Invalid JSON is an error.
pub fn load_settings_from_path(path: &Path) -> Result<Settings, SettingsError> {
    let defaults = serde_json::to_value(Settings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: Settings = serde_json::from_value(merged)?;
    apply_overrides(&mut settings, |key| std::env::var(key).ok());
    settings.validate()?;
    Ok(settings)
}

/// Objects merge per key, everything else is replaced, nulls are skipped.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = match target_map.remove(&key) {
                    Some(target_val) => deep_merge(target_val, source_val),
                    None => source_val,
                };
                target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `TURNSTILE_*` overrides read through `lookup`.
///
/// Out-of-range or unparsable values are ignored.
pub fn apply_overrides(settings: &mut Settings, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(v) = lookup("TURNSTILE_TURN_MINUTES").and_then(|v| parse_in_range(&v, 1, 24 * 60)) {
        settings.drive.turn_duration_minutes = v as u32;
    }
    if let Some(v) = lookup("TURNSTILE_TELEMETRY_SECONDS").and_then(|v| parse_in_range(&v, 1, 3_600)) {
        settings.drive.telemetry_interval_seconds = v as u32;
    }
    if let Some(v) = lookup("TURNSTILE_PROBE_MS").and_then(|v| parse_in_range(&v, 10, 60_000)) {
        settings.scheduler.probe_interval_ms = v;
    }
    if let Some(v) = lookup("TURNSTILE_MAX_QUEUE").and_then(|v| parse_in_range(&v, 1, 100_000)) {
        settings.scheduler.max_queue_depth = Some(v as usize);
    }
    if let Some(v) = lookup("TURNSTILE_DB_PATH").filter(|v| !v.trim().is_empty()) {
        settings.database_path = v;
    }
    if let Some(v) = lookup("TURNSTILE_LOG_LEVEL").filter(|v| !v.trim().is_empty()) {
        settings.logging.level = v;
    }
}

fn parse_in_range(raw: &str, min: u64, max: u64) -> Option<u64> {
    raw.trim().parse::<u64>().ok().filter(|v| (min..=max).contains(v))
}
