//! Settings loading with deep merge and environment variable overrides.
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::Result;
use crate::types::{EnvbusSettings, MAX_OBS_SIZE};

/// Resolve the path to the settings file (`~/.envbus/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".envbus").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<EnvbusSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults; invalid JSON or invalid values are errors.
pub fn load_settings_from_path(path: &Path) -> Result<EnvbusSettings> {
    let mut settings = load_file_layer(path)?;
    apply_overrides(&mut settings, |name| std::env::var(name).ok());
    settings.validate()?;
    Ok(settings)
}

/// Defaults merged with the file at `path`, without env overrides.
pub fn load_file_layer(path: &Path) -> Result<EnvbusSettings> {
    let defaults = serde_json::to_value(EnvbusSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    Ok(serde_json::from_value(merged)?)
}

/// Recursive deep merge of two JSON values.
pub fn deep_merge(mut target: Value, source: Value) -> Value {
    merge_into(&mut target, source);
    target
}

fn merge_into(target: &mut Value, source: Value) {
    match (target, source) {
        (Value::Object(target_map), Value::Object(source_map)) => {
            for (key, value) in source_map.into_iter().filter(|(_, v)| !v.is_null()) {
                match target_map.get_mut(&key) {
                    Some(existing) => merge_into(existing, value),
                    None => {
                        let _ = target_map.insert(key, value);
                    }
                }
            }
        }
        (slot, source) => *slot = source,
    }
}

/// Apply `ENVBUS_*` overrides read through `lookup`.
///
/// Invalid values are ignored with a warning (falling back to file/default).
pub fn apply_overrides(settings: &mut EnvbusSettings, lookup: impl Fn(&str) -> Option<String>) {
    let string = |name: &str| lookup(name).filter(|v| !v.is_empty());
    let ranged = |name: &str, min: u64, max: u64| {
        let val = lookup(name)?;
        let parsed = parse_u64_range(&val, min, max);
        if parsed.is_none() {
            tracing::warn!(key = name, value = %val, "invalid integer env var, ignoring");
        }
        parsed
    };

    if let Some(v) = string("ENVBUS_ADDRESS") {
        settings.bus.address = v;
    }
    if let Some(v) = string("ENVBUS_CHANNEL") {
        settings.bus.channel_prefix = v;
    }
    if let Some(v) = ranged("ENVBUS_SUBSCRIBE_TIMEOUT_MS", 1, 3_600_000) {
        settings.session.subscribe_timeout_ms = v;
    }
    if let Some(v) = ranged("ENVBUS_ACTION_TIMEOUT_MS", 1, 86_400_000) {
        settings.session.action_timeout_ms = v;
    }
    if let Some(v) = ranged("ENVBUS_OBS_SIZE", 1, MAX_OBS_SIZE as u64) {
        settings.master.obs_size = v as usize;
    }
    if let Some(v) = string("ENVBUS_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(val) = lookup("ENVBUS_LOG_JSON") {
        match parse_bool(&val) {
            Some(v) => settings.logging.json = v,
            None => {
                tracing::warn!(
                    key = "ENVBUS_LOG_JSON",
                    value = %val,
                    "invalid boolean env var, ignoring"
                );
            }
        }
    }
}

/// Parse a string as a boolean.
///
/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}
