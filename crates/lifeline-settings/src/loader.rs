//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`LifelineSettings::default()`]
//! 2. If the settings file exists, deep-merge its values over the defaults
//! 3. Apply `LIFELINE_*` environment variable overrides
//! 4. Validate the result
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::{Result, SettingsError};
use crate::types::LifelineSettings;

/// Resolve the settings file path.
///
/// `$LIFELINE_SETTINGS` wins; otherwise `~/.lifeline/settings.json`.
pub fn settings_path() -> PathBuf {
    if let Some(explicit) = std::env::var("LIFELINE_SETTINGS").ok().filter(|v| !v.is_empty()) {
        return PathBuf::from(explicit);
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".lifeline").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<LifelineSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults. Invalid JSON or a value that fails
/// [`LifelineSettings::validate`] is an error.
pub fn load_settings_from_path(path: &Path) -> Result<LifelineSettings> {
    let defaults = serde_json::to_value(LifelineSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path).map_err(|source| SettingsError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let user: Value = serde_json::from_str(&content).map_err(|source| SettingsError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: LifelineSettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings);
    settings.validate()?;
    Ok(settings)
}

/// Recursive deep merge of two JSON values.
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
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply overrides from the process environment.
pub fn apply_env_overrides(settings: &mut LifelineSettings) {
    apply_overrides(settings, |name| std::env::var(name).ok());
}

/// Apply overrides read through `lookup`.
///
/// Values that fail to parse or fall outside their range are logged and
/// ignored, leaving the file or default value in place.
pub fn apply_overrides<F>(settings: &mut LifelineSettings, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let env = Env { lookup };

    if let Some(v) = env.string("LIFELINE_ENDPOINT") {
        settings.endpoint = v;
    }

    // ── Reconnect ───────────────────────────────────────────────────
    if let Some(v) = env.bool("LIFELINE_RECONNECT_ENABLED") {
        settings.reconnect.enabled = v;
    }
    if let Some(v) = env.u64("LIFELINE_RECONNECT_MAX_ATTEMPTS", 0, u64::from(u32::MAX)) {
        settings.reconnect.max_attempts = u32::try_from(v).unwrap_or(u32::MAX);
    }
    if let Some(v) = env.u64("LIFELINE_RECONNECT_INITIAL_DELAY_MS", 0, 3_600_000) {
        settings.reconnect.initial_delay_ms = v;
    }
    if let Some(v) = env.u64("LIFELINE_RECONNECT_MAX_DELAY_MS", 0, 3_600_000) {
        settings.reconnect.max_delay_ms = v;
    }
    if let Some(v) = env.f64("LIFELINE_RECONNECT_MULTIPLIER", 1.0, 100.0) {
        settings.reconnect.backoff_multiplier = v;
    }
    if let Some(v) = env.f64("LIFELINE_RECONNECT_JITTER", 0.0, 1.0) {
        settings.reconnect.jitter_ratio = v;
    }

    // ── Heartbeat ───────────────────────────────────────────────────
    if let Some(v) = env.bool("LIFELINE_HEARTBEAT_AUTO_RESPOND") {
        settings.heartbeat.auto_respond = v;
    }
    if let Some(v) = env.u64("LIFELINE_HEARTBEAT_INTERVAL_MS", 1, 3_600_000) {
        settings.heartbeat.interval_ms = v;
    }
    if let Some(v) = env.u64("LIFELINE_HEARTBEAT_TIMEOUT_MS", 1, 3_600_000) {
        settings.heartbeat.timeout_ms = v;
    }

    if let Some(v) = env.u64("LIFELINE_RESTORE_PACING_MS", 0, 60_000) {
        settings.subscriptions.restore_pacing_ms = v;
    }
    if let Some(v) = env.u64("LIFELINE_CLOSE_TIMEOUT_MS", 1, 600_000) {
        settings.connection.close_timeout_ms = v;
    }

    // ── Server ──────────────────────────────────────────────────────
    if let Some(v) = env.string("LIFELINE_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = env.u16("LIFELINE_PORT", 0, 65535) {
        settings.server.port = v;
    }
    if let Some(v) = env.usize("LIFELINE_MAX_CONNECTIONS", 1, 1_000_000) {
        settings.server.max_connections = v;
    }

    // ── Logging ─────────────────────────────────────────────────────
    if let Some(v) = env.string("LIFELINE_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = env.bool("LIFELINE_LOG_JSON") {
        settings.logging.json = v;
    }
}

// ── Pure parsing functions ──────────────────────────────────────────────────

/// Parse a string as a boolean.
///
/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a string as a `u16` within a range.
pub fn parse_u16_range(val: &str, min: u16, max: u16) -> Option<u16> {
    let n: u16 = val.trim().parse().ok()?;
    (min..=max).contains(&n).then_some(n)
}

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.trim().parse().ok()?;
    (min..=max).contains(&n).then_some(n)
}

/// Parse a string as a `usize` within a range.
pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.trim().parse().ok()?;
    (min..=max).contains(&n).then_some(n)
}

/// Parse a string as a finite `f64` within a range.
pub fn parse_f64_range(val: &str, min: f64, max: f64) -> Option<f64> {
    let n: f64 = val.trim().parse().ok()?;
    (n.is_finite() && n >= min && n <= max).then_some(n)
}

// ── Lookup wrappers ─────────────────────────────────────────────────────────

struct Env<F> {
    lookup: F,
}

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.is_empty())
    }

    fn parsed<T>(&self, name: &str, kind: &str, parse: impl FnOnce(&str) -> Option<T>) -> Option<T> {
        let val = (self.lookup)(name)?;
        let result = parse(&val);
        if result.is_none() {
            warn!(key = name, value = %val, kind, "invalid env override, ignoring");
        }
        result
    }

    fn bool(&self, name: &str) -> Option<bool> {
        self.parsed(name, "bool", parse_bool)
    }

    fn u16(&self, name: &str, min: u16, max: u16) -> Option<u16> {
        self.parsed(name, "u16", |v| parse_u16_range(v, min, max))
    }

    fn u64(&self, name: &str, min: u64, max: u64) -> Option<u64> {
        self.parsed(name, "u64", |v| parse_u64_range(v, min, max))
    }

    fn usize(&self, name: &str, min: usize, max: usize) -> Option<usize> {
        self.parsed(name, "usize", |v| parse_usize_range(v, min, max))
    }

    fn f64(&self, name: &str, min: f64, max: f64) -> Option<f64> {
        self.parsed(name, "f64", |v| parse_f64_range(v, min, max))
    }
}
