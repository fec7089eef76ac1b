// src/config.rs
// Operational settings for the traffic engine, read from environment variables.
// Domain and rule configuration never lives here; it only arrives via the
// sync snapshot (see sync.rs).

use std::env;

const DEFAULT_SYNC_TTL_SECONDS: u64 = 300;

/// Kill switch: when engaged every request passes through untouched,
/// bypassing matching and stats.
pub fn kill_switch_engaged() -> bool {
    env_bool("SWITCHYARD_DISABLED", false)
}

/// API key guarding the operational endpoints. Endpoints reject everything
/// when no key is configured.
pub fn api_key() -> Option<String> {
    env_nonempty("SWITCHYARD_API_KEY")
}

/// Base URL of the central rule source. Sync is disabled when unset.
pub fn sync_url() -> Option<String> {
    env_nonempty("SWITCHYARD_SYNC_URL")
}

/// Bearer token sent with sync fetches.
pub fn sync_token() -> Option<String> {
    env_nonempty("SWITCHYARD_SYNC_TOKEN")
}

/// Minimum seconds between inline sync checks.
pub fn sync_ttl_seconds() -> u64 {
    env::var("SWITCHYARD_SYNC_TTL_SECONDS")
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(DEFAULT_SYNC_TTL_SECONDS)
}

fn env_nonempty(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_bool(name: &str, default: bool) -> bool {
    env::var(name)
        .ok()
        .and_then(|v| parse_bool_like(v.as_str()))
        .unwrap_or(default)
}

pub(crate) fn parse_bool_like(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bool_like_values() {
        assert_eq!(parse_bool_like("1"), Some(true));
        assert_eq!(parse_bool_like(" ON "), Some(true));
        assert_eq!(parse_bool_like("no"), Some(false));
        assert_eq!(parse_bool_like("maybe"), None);
    }

    #[test]
    fn sync_ttl_defaults_when_unset() {
        std::env::remove_var("SWITCHYARD_SYNC_TTL_SECONDS");
        assert_eq!(sync_ttl_seconds(), DEFAULT_SYNC_TTL_SECONDS);
    }
}
