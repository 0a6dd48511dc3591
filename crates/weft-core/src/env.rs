//! Environment variable helpers.
//!
//! Typed `env_get` with a default, used by the runtime config
//! (`WEFT_*` variables).

use std::str::FromStr;

/// Parse an env var as `T`, falling back to `default` when unset or
/// unparseable.
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Boolean env var: "1", "true", "yes", "on" (case-insensitive) are true,
/// anything else set is false, unset returns the default.
#[inline]
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => matches!(val.to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

/// Parse an env var as `Some(T)`, `None` when unset or unparseable.
#[inline]
pub fn env_get_opt<T>(key: &str) -> Option<T>
where
    T: FromStr,
{
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}
