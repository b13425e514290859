//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`BizpulseSettings::default()`]
//! 2. If the settings file exists, deep-merge its values over the defaults
//! 3. Apply `BIZPULSE_*` environment overrides (highest priority)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::Result;
use crate::types::{AuthMode, BizpulseSettings, LogFormat};

/// Resolve the default settings path (`~/.bizpulse/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".bizpulse").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<BizpulseSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults; invalid JSON is an error.
pub fn load_settings_from_path(path: &Path) -> Result<BizpulseSettings> {
    let mut settings = load_file_layers(path)?;
    apply_env_overrides(&mut settings);
    settings.validate()?;
    Ok(settings)
}

/// Defaults merged with the file at `path`, without env overrides.
pub fn load_file_layers(path: &Path) -> Result<BizpulseSettings> {
    let defaults = serde_json::to_value(BizpulseSettings::default())?;

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
///
/// Objects merge per key, arrays and primitives are replaced, and `null` in
/// `source` keeps the target value.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply process environment overrides.
pub fn apply_env_overrides(settings: &mut BizpulseSettings) {
    apply_overrides_from(settings, |key| std::env::var(key).ok());
}

/// Apply overrides using `lookup` as the variable source.
///
/// Values that fail to parse or fall outside their range are ignored with a
/// warning.
pub fn apply_overrides_from(settings: &mut BizpulseSettings, lookup: impl Fn(&str) -> Option<String>) {
    let env = EnvReader { lookup: &lookup };

    if let Some(v) = env.string("BIZPULSE_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = env.u64_in("BIZPULSE_PORT", 0, 65_535) {
        settings.server.port = v as u16;
    }
    if let Some(v) = env.u64_in("BIZPULSE_MAX_CONNECTIONS", 1, 1_000_000) {
        settings.server.max_connections = v as usize;
    }
    if let Some(v) = env.u64_in("BIZPULSE_SEND_QUEUE", 1, 1_000_000) {
        settings.server.send_queue_capacity = v as usize;
    }
    if let Some(v) = env.u64_in("BIZPULSE_HEARTBEAT_INTERVAL_SECS", 1, 3600) {
        settings.server.heartbeat_interval_secs = v;
    }
    if let Some(v) = env.u64_in("BIZPULSE_HEARTBEAT_TIMEOUT_SECS", 1, 3600) {
        settings.server.heartbeat_timeout_secs = v;
    }

    if let Some(v) = env.string("BIZPULSE_AUTH_MODE") {
        match v.to_lowercase().as_str() {
            "jwt" => settings.auth.mode = AuthMode::Jwt,
            "static" => settings.auth.mode = AuthMode::Static,
            _ => warn!(key = "BIZPULSE_AUTH_MODE", value = %v, "unknown auth mode, ignoring"),
        }
    }
    if let Some(v) = env.string("BIZPULSE_JWT_SECRET") {
        settings.auth.jwt_secret = v;
    }
    if let Some(v) = env.string("BIZPULSE_JWT_ISSUER") {
        settings.auth.jwt_issuer = Some(v);
    }

    if let Some(v) = env.u64_in("BIZPULSE_RECONNECT_BASE_MS", 1, 600_000) {
        settings.client.base_delay_ms = v;
    }
    if let Some(v) = env.u64_in("BIZPULSE_RECONNECT_MAX_MS", 1, 3_600_000) {
        settings.client.max_delay_ms = v;
    }
    if let Some(v) = env.u64_in("BIZPULSE_RECONNECT_ATTEMPTS", 0, 1000) {
        settings.client.max_attempts = v as u32;
    }

    if let Some(v) = env.string("BIZPULSE_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = env.string("BIZPULSE_LOG_FORMAT") {
        match v.to_lowercase().as_str() {
            "json" => settings.logging.format = LogFormat::Json,
            "pretty" => settings.logging.format = LogFormat::Pretty,
            _ => warn!(key = "BIZPULSE_LOG_FORMAT", value = %v, "unknown log format, ignoring"),
        }
    }
}

/// Parse a string as a `u64` within an inclusive range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

struct EnvReader<'a, F: Fn(&str) -> Option<String>> {
    lookup: &'a F,
}

impl<F: Fn(&str) -> Option<String>> EnvReader<'_, F> {
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.trim().is_empty())
    }

    fn u64_in(&self, name: &str, min: u64, max: u64) -> Option<u64> {
        let val = self.string(name)?;
        let result = parse_u64_range(&val, min, max);
        if result.is_none() {
            warn!(key = name, value = %val, "invalid numeric env var, ignoring");
        }
        result
    }
}
