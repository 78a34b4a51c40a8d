//! Shared helpers for the string-map provider configs.
//!
//! Provider instance configuration arrives as `HashMap<String, String>`
//! (the shape the control plane ships); each provider parses it into a
//! typed config struct, validating required keys up front.

use std::collections::HashMap;
use std::time::Duration;

use url::Url;

use crate::error::{DncError, DncResult};

pub fn require<'a>(config: &'a HashMap<String, String>, key: &str) -> DncResult<&'a str> {
    match config.get(key).map(String::as_str) {
        Some(value) if !value.is_empty() => Ok(value),
        _ => Err(DncError::Configuration(format!(
            "missing required config key {key:?}"
        ))),
    }
}

pub fn optional<'a>(config: &'a HashMap<String, String>, key: &str) -> Option<&'a str> {
    config.get(key).map(String::as_str).filter(|v| !v.is_empty())
}

/// Validate and normalize a base URL (scheme + host, no trailing slash).
pub fn base_url(config: &HashMap<String, String>, key: &str) -> DncResult<String> {
    let raw = require(config, key)?;
    let parsed = Url::parse(raw)
        .map_err(|e| DncError::Configuration(format!("config key {key:?} is not a URL: {e}")))?;
    if parsed.host_str().is_none() {
        return Err(DncError::Configuration(format!(
            "config key {key:?} has no host"
        )));
    }
    Ok(raw.trim_end_matches('/').to_string())
}

pub fn parse_u32(config: &HashMap<String, String>, key: &str, default: u32) -> DncResult<u32> {
    match optional(config, key) {
        None => Ok(default),
        Some(raw) => raw.parse().map_err(|_| {
            DncError::Configuration(format!("config key {key:?} is not an integer: {raw:?}"))
        }),
    }
}

pub fn parse_secs(
    config: &HashMap<String, String>,
    key: &str,
    default: Duration,
) -> DncResult<Duration> {
    Ok(Duration::from_secs(u64::from(parse_u32(
        config,
        key,
        default.as_secs() as u32,
    )?)))
}

/// Validate an enumerated config value.
pub fn one_of<'a>(
    config: &'a HashMap<String, String>,
    key: &str,
    allowed: &[&str],
    default: &'a str,
) -> DncResult<&'a str> {
    match optional(config, key) {
        None => Ok(default),
        Some(value) if allowed.contains(&value) => Ok(value),
        Some(value) => Err(DncError::Configuration(format!(
            "config key {key:?} must be one of {allowed:?}, got {value:?}"
        ))),
    }
}
