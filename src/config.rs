// Settings stored in the app_config table

use std::str::FromStr;
use std::time::Duration;

use rusqlite::Connection;
use tracing::warn;

use crate::db;
use crate::ollama_api::DEFAULT_BASE_URL;
use crate::session::DEFAULT_STATUS_CLEAR_DELAY;

pub const KEY_BASE_URL: &str = "ollama_base_url";
pub const KEY_SELECTED_MODEL: &str = "selected_model_name";
pub const KEY_STATUS_CLEAR_DELAY_MS: &str = "status_clear_delay_ms";
pub const KEY_LOG_LEVEL: &str = "log_level";

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub ollama_base_url: String,
    pub status_clear_delay: Duration,
    pub log_level: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            ollama_base_url: DEFAULT_BASE_URL.into(),
            status_clear_delay: DEFAULT_STATUS_CLEAR_DELAY,
            log_level: "info".into(),
        }
    }
}

fn parse_or<T: FromStr>(key: &str, raw: Option<String>, fallback: T) -> T {
    match raw {
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!(key, value = %raw, "ignoring unparsable setting");
            fallback
        }),
        None => fallback,
    }
}

impl Settings {
    /// Reads settings from the database, falling back to defaults for missing
    /// or unparsable values. `OLLAMA_HOST` overrides the stored base URL.
    pub fn load(conn: &Connection) -> rusqlite::Result<Self> {
        let defaults = Settings::default();

        let stored_url = db::get_config_value(conn, KEY_BASE_URL)?.filter(|url| !url.trim().is_empty());
        let ollama_base_url = std::env::var("OLLAMA_HOST")
            .ok()
            .filter(|host| !host.trim().is_empty())
            .map(|host| normalize_host(&host))
            .or(stored_url)
            .unwrap_or(defaults.ollama_base_url);

        let delay_ms = parse_or(
            KEY_STATUS_CLEAR_DELAY_MS,
            db::get_config_value(conn, KEY_STATUS_CLEAR_DELAY_MS)?,
            defaults.status_clear_delay.as_millis() as u64,
        );

        Ok(Settings {
            ollama_base_url,
            status_clear_delay: Duration::from_millis(delay_ms),
            log_level: db::get_config_value(conn, KEY_LOG_LEVEL)?.unwrap_or(defaults.log_level),
        })
    }
}

/// `OLLAMA_HOST` may be a bare `host:port`.
fn normalize_host(host: &str) -> String {
    let host = host.trim();
    if host.starts_with("http://") || host.starts_with("https://") {
        host.to_string()
    } else {
        format!("http://{host}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_nothing_is_stored() {
        let conn = db::open_in_memory().unwrap();
        let settings = Settings::load(&conn).unwrap();
        assert_eq!(settings.status_clear_delay, Duration::from_millis(1500));
        assert_eq!(settings.log_level, "info");
    }

    #[test]
    fn stored_values_override_defaults() {
        let conn = db::open_in_memory().unwrap();
        db::update_config_value(&conn, KEY_STATUS_CLEAR_DELAY_MS, "250").unwrap();
        db::update_config_value(&conn, KEY_LOG_LEVEL, "debug").unwrap();

        let settings = Settings::load(&conn).unwrap();
        assert_eq!(settings.status_clear_delay, Duration::from_millis(250));
        assert_eq!(settings.log_level, "debug");
    }

    #[test]
    fn bad_delay_falls_back() {
        let conn = db::open_in_memory().unwrap();
        db::update_config_value(&conn, KEY_STATUS_CLEAR_DELAY_MS, "soon").unwrap();
        let settings = Settings::load(&conn).unwrap();
        assert_eq!(settings.status_clear_delay, DEFAULT_STATUS_CLEAR_DELAY);
    }

    #[test]
    fn bare_host_gets_a_scheme() {
        assert_eq!(normalize_host("127.0.0.1:11434"), "http://127.0.0.1:11434");
        assert_eq!(normalize_host("https://ollama.local"), "https://ollama.local");
    }
}
