//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`ParleySettings::default()`]
//! 2. If the settings file exists, deep-merge its values over the defaults
//! 3. Apply `PARLEY_*` environment overrides
//! 4. Validate

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::{Result, SettingsError};
use crate::types::ParleySettings;

/// `~/.parley/settings.json`
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".parley").join("settings.json")
}

pub fn load_settings() -> Result<ParleySettings> {
    load_settings_from_path(&settings_path())
}

/// Load from `path` (defaults if it does not exist) and apply env overrides.
pub fn load_settings_from_path(path: &Path) -> Result<ParleySettings> {
    let defaults = serde_json::to_value(ParleySettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path).map_err(|source| SettingsError::Io {
            path: path.to_owned(),
            source,
        })?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: ParleySettings = serde_json::from_value(merged)?;
    apply_overrides(&mut settings, |key| std::env::var(key).ok());
    validate(&settings)?;
    Ok(settings)
}

/// Objects merge per key; arrays and primitives are replaced; nulls in
/// `source` are skipped.
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

/// Apply overrides read through `lookup` (the process environment in
/// production). Unparseable values are logged and ignored.
pub fn apply_overrides(settings: &mut ParleySettings, lookup: impl Fn(&str) -> Option<String>) {
    let get = |name: &str| lookup(name).filter(|v| !v.is_empty());

    if let Some(v) = get("PARLEY_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = get("PARLEY_PORT").and_then(|v| parse_or_warn("PARLEY_PORT", &v)) {
        settings.server.port = v;
    }
    if let Some(v) = get("PARLEY_MAX_MESSAGE_SIZE").and_then(|v| parse_or_warn("PARLEY_MAX_MESSAGE_SIZE", &v)) {
        settings.server.max_message_size = v;
    }
    if let Some(v) = get("PARLEY_PONG_WAIT_MS").and_then(|v| parse_or_warn("PARLEY_PONG_WAIT_MS", &v)) {
        settings.server.pong_wait_ms = v;
    }
    if let Some(v) = get("PARLEY_IDLE_TIMEOUT_MS").and_then(|v| parse_or_warn("PARLEY_IDLE_TIMEOUT_MS", &v)) {
        settings.sessions.idle_timeout_ms = v;
    }
    if let Some(v) = get("PARLEY_PAIRING").and_then(|v| parse_bool_or_warn("PARLEY_PAIRING", &v)) {
        settings.sessions.pairing = v;
    }
    if let Some(v) = get("PARLEY_TOPIC_TIMEOUT_MS").and_then(|v| parse_or_warn("PARLEY_TOPIC_TIMEOUT_MS", &v)) {
        settings.topics.idle_timeout_ms = v;
    }
    if let Some(v) = get("PARLEY_STORE_PATH") {
        settings.store.path = Some(v);
    }
    if let Some(v) = get("PARLEY_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = get("PARLEY_LOG_JSON").and_then(|v| parse_bool_or_warn("PARLEY_LOG_JSON", &v)) {
        settings.logging.json = v;
    }
}

/// Reject values that would deadlock or spin the server.
pub fn validate(settings: &ParleySettings) -> Result<()> {
    let capacities = [
        ("sessions.outboundCapacity", settings.sessions.outbound_capacity),
        ("sessions.detachCapacity", settings.sessions.detach_capacity),
        ("topics.broadcastCapacity", settings.topics.broadcast_capacity),
        ("topics.metaCapacity", settings.topics.meta_capacity),
        ("topics.regCapacity", settings.topics.reg_capacity),
        ("topics.unregCapacity", settings.topics.unreg_capacity),
        ("topics.uaCapacity", settings.topics.ua_capacity),
        ("topics.maxHistory", settings.topics.max_history),
    ];
    for (field, value) in capacities {
        if value == 0 {
            return Err(SettingsError::invalid(field, "must be at least 1"));
        }
    }
    if settings.server.pong_wait_ms < 10 {
        return Err(SettingsError::invalid("server.pongWaitMs", "must be at least 10ms"));
    }
    if settings.server.write_wait_ms == 0 {
        return Err(SettingsError::invalid("server.writeWaitMs", "must be positive"));
    }
    if settings.server.max_message_size < 64 {
        return Err(SettingsError::invalid("server.maxMessageSize", "must be at least 64 bytes"));
    }
    Ok(())
}

/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn parse_or_warn<T: std::str::FromStr>(key: &str, val: &str) -> Option<T> {
    let parsed = val.parse().ok();
    if parsed.is_none() {
        warn!(key, value = %val, "invalid numeric env var, ignoring");
    }
    parsed
}

fn parse_bool_or_warn(key: &str, val: &str) -> Option<bool> {
    let parsed = parse_bool(val);
    if parsed.is_none() {
        warn!(key, value = %val, "invalid boolean env var, ignoring");
    }
    parsed
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    // ── deep_merge ──────────────────────────────────────────────────

    #[test]
    fn merge_nested_override() {
        let target = serde_json::json!({"server": {"port": 6060, "host": "0.0.0.0"}});
        let source = serde_json::json!({"server": {"port": 9090}});
        let merged = deep_merge(target, source);
        assert_eq!(merged["server"]["port"], 9090);
        assert_eq!(merged["server"]["host"], "0.0.0.0");
    }

    #[test]
    fn merge_null_preserves_target() {
        let target = serde_json::json!({"a": 1, "b": 2});
        let merged = deep_merge(target, serde_json::json!({"a": null}));
        assert_eq!(merged["a"], 1);
    }

    #[test]
    fn merge_array_and_primitive_replace() {
        let target = serde_json::json!({"items": [1, 2, 3], "a": {"nested": true}});
        let source = serde_json::json!({"items": [4], "a": 42});
        let merged = deep_merge(target, source);
        assert_eq!(merged["items"], serde_json::json!([4]));
        assert_eq!(merged["a"], 42);
    }

    // ── load_settings_from_path ─────────────────────────────────────

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = load_settings_from_path(&dir.path().join("nope.json")).unwrap();
        assert_eq!(settings.server.port, ParleySettings::default().server.port);
    }

    #[test]
    fn file_values_merge_over_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let mut f = std::fs::File::create(&path).unwrap();
        write!(f, r#"{{"sessions": {{"pairing": false}}, "topics": {{"idleTimeoutMs": 100}}}}"#).unwrap();

        let settings = load_settings_from_path(&path).unwrap();
        assert!(!settings.sessions.pairing);
        assert_eq!(settings.topics.idle_timeout_ms, 100);
        assert_eq!(settings.topics.broadcast_capacity, 256);
    }

    #[test]
    fn invalid_json_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(load_settings_from_path(&path), Err(SettingsError::Json(_))));
    }

    #[test]
    fn zero_capacity_fails_validation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"topics": {"regCapacity": 0}}"#).unwrap();
        let err = load_settings_from_path(&path).unwrap_err();
        assert!(err.to_string().contains("topics.regCapacity"), "got: {err}");
    }

    // ── overrides ───────────────────────────────────────────────────

    #[test]
    fn overrides_apply_typed_values() {
        let mut settings = ParleySettings::default();
        apply_overrides(
            &mut settings,
            env(&[
                ("PARLEY_PORT", "7777"),
                ("PARLEY_PAIRING", "off"),
                ("PARLEY_STORE_PATH", "/tmp/p.db"),
                ("PARLEY_LOG_JSON", "yes"),
            ]),
        );
        assert_eq!(settings.server.port, 7777);
        assert!(!settings.sessions.pairing);
        assert_eq!(settings.store.path.as_deref(), Some("/tmp/p.db"));
        assert!(settings.logging.json);
    }

    #[test]
    fn bad_override_values_are_ignored() {
        let mut settings = ParleySettings::default();
        apply_overrides(&mut settings, env(&[("PARLEY_PORT", "99999"), ("PARLEY_PAIRING", "maybe")]));
        assert_eq!(settings.server.port, 6060);
        assert!(settings.sessions.pairing);
    }

    #[test]
    fn empty_override_is_ignored() {
        let mut settings = ParleySettings::default();
        apply_overrides(&mut settings, env(&[("PARLEY_HOST", "")]));
        assert_eq!(settings.server.host, "0.0.0.0");
    }

    #[test]
    fn parse_bool_variants() {
        assert_eq!(parse_bool("TRUE"), Some(true));
        assert_eq!(parse_bool("0"), Some(false));
        assert_eq!(parse_bool("nah"), None);
    }
}
