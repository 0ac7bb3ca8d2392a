//! Sync configuration parsed from environment variables.
//!
//! Every timeout here is finite and non-zero: a zero or unparsable value
//! falls back to its default rather than producing an unbounded wait.

use std::time::Duration;

pub const DEFAULT_READY_TIMEOUT_MS: u64 = 5000;
pub const DEFAULT_AUTHORITY_TIMEOUT_MS: u64 = 8000;
pub const DEFAULT_SIGN_IN_PATH: &str = "/login";
pub const DEFAULT_RETURN_PARAM: &str = "next";
pub const DEFAULT_RECORD_KEY: &str = "authsync.state";
pub const DEFAULT_ADMIN_ROLE: &str = "admin";
pub const DEFAULT_EVENT_BUFFER: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// Bound on a stalled readiness check before the watchdog forces `is_ready`.
    pub ready_timeout: Duration,
    /// Bound on any single call into the session authority.
    pub authority_timeout: Duration,
    /// Route that denied visitors are redirected to.
    pub sign_in_path: String,
    /// Query parameter that carries the originally requested path.
    pub return_param: String,
    /// Key of the persistent auth record.
    pub record_key: String,
    /// User role that grants admin access.
    pub admin_role: String,
    /// Capacity of the event and broadcast channels.
    pub event_buffer: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            ready_timeout: Duration::from_millis(DEFAULT_READY_TIMEOUT_MS),
            authority_timeout: Duration::from_millis(DEFAULT_AUTHORITY_TIMEOUT_MS),
            sign_in_path: DEFAULT_SIGN_IN_PATH.to_owned(),
            return_param: DEFAULT_RETURN_PARAM.to_owned(),
            record_key: DEFAULT_RECORD_KEY.to_owned(),
            admin_role: DEFAULT_ADMIN_ROLE.to_owned(),
            event_buffer: DEFAULT_EVENT_BUFFER,
        }
    }
}

impl SyncConfig {
    /// Build sync config from environment variables.
    ///
    /// Optional:
    /// - `AUTH_READY_TIMEOUT_MS`: default 5000
    /// - `AUTH_AUTHORITY_TIMEOUT_MS`: default 8000
    /// - `AUTH_SIGN_IN_PATH`: default `/login`
    /// - `AUTH_RETURN_PARAM`: default `next`
    /// - `AUTH_RECORD_KEY`: default `authsync.state`
    /// - `AUTH_ADMIN_ROLE`: default `admin`
    /// - `AUTH_EVENT_BUFFER`: default 64
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            ready_timeout: env_duration_ms("AUTH_READY_TIMEOUT_MS", DEFAULT_READY_TIMEOUT_MS),
            authority_timeout: env_duration_ms("AUTH_AUTHORITY_TIMEOUT_MS", DEFAULT_AUTHORITY_TIMEOUT_MS),
            sign_in_path: env_string("AUTH_SIGN_IN_PATH", DEFAULT_SIGN_IN_PATH),
            return_param: env_string("AUTH_RETURN_PARAM", DEFAULT_RETURN_PARAM),
            record_key: env_string("AUTH_RECORD_KEY", DEFAULT_RECORD_KEY),
            admin_role: env_string("AUTH_ADMIN_ROLE", DEFAULT_ADMIN_ROLE),
            event_buffer: env_parse("AUTH_EVENT_BUFFER", DEFAULT_EVENT_BUFFER).max(1),
        }
    }
}

pub(crate) fn env_parse<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

pub(crate) fn env_duration_ms(key: &str, default_ms: u64) -> Duration {
    match env_parse(key, default_ms) {
        0 => Duration::from_millis(default_ms),
        ms => Duration::from_millis(ms),
    }
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_owned())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_owned())
}

#[cfg(test)]
#[path = "config_test.rs"]
mod config_test;
