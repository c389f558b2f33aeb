// Realtime server configuration.
//
// Centralizes environment variable parsing with defaults for local
// development. The DB pool reads its own sizing variables (see db/pool.rs).

use std::net::SocketAddr;

use chrono::{Duration, FixedOffset};

const DEV_JWT_SECRET: &str = "atelier_local_development_jwt_secret_32_chars";
const DEFAULT_PORT: u16 = 8090;
const DEFAULT_STALE_SESSION_MINUTES: i64 = 60;

/// Core realtime server configuration.
///
/// Constructed via [`RealtimeConfig::from_env`] which reads environment
/// variables and falls back to development defaults.
#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    /// Listen address (host:port).
    pub listen_addr: SocketAddr,
    /// HS256 secret used to verify handshake tokens.
    pub jwt_secret: String,
    /// PostgreSQL connection string. `None` runs on the in-memory store.
    pub database_url: Option<String>,
    /// Log filter directive (e.g. `info`, `atelier_realtime=debug`).
    pub log_filter: String,
    /// Emit logs as JSON lines instead of the human-readable format.
    pub log_json: bool,
    /// Offline gap after which a user's in-flight generation tasks are
    /// considered abandoned.
    pub stale_session_threshold: Duration,
    /// Skips the abandoned-task reset. For tests and local development.
    pub relaxed_mode: bool,
    /// Where "today" starts. `None` means the server's local time zone.
    pub day_offset: Option<FixedOffset>,
}

impl RealtimeConfig {
    /// Parse configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `ATELIER_REALTIME_HOST` | `0.0.0.0` |
    /// | `ATELIER_REALTIME_PORT` | `8090` |
    /// | `ATELIER_REALTIME_JWT_SECRET` | dev-only placeholder |
    /// | `ATELIER_REALTIME_DATABASE_URL` | *(none, in-memory store)* |
    /// | `ATELIER_REALTIME_LOG_FILTER` | `info` |
    /// | `ATELIER_REALTIME_LOG_JSON` | `false` |
    /// | `ATELIER_REALTIME_STALE_SESSION_MINUTES` | `60` |
    /// | `ATELIER_REALTIME_RELAXED_MODE` | `false` |
    /// | `ATELIER_REALTIME_DAY_OFFSET_MINUTES` | *(none, server local time)* |
    pub fn from_env() -> Self {
        Self::from_env_fn(|key| std::env::var(key))
    }

    /// Testable constructor that accepts an environment lookup function.
    fn from_env_fn<F>(env: F) -> Self
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        let host = env("ATELIER_REALTIME_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let port: u16 = env("ATELIER_REALTIME_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_PORT);
        let listen_addr = format!("{host}:{port}")
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], port)));

        let jwt_secret =
            env("ATELIER_REALTIME_JWT_SECRET").unwrap_or_else(|_| DEV_JWT_SECRET.into());

        let database_url = env("ATELIER_REALTIME_DATABASE_URL").ok().filter(|v| !v.is_empty());

        let log_filter = env("ATELIER_REALTIME_LOG_FILTER").unwrap_or_else(|_| "info".into());
        let log_json = env("ATELIER_REALTIME_LOG_JSON").map(|v| parse_flag(&v)).unwrap_or(false);

        let stale_session_threshold = env("ATELIER_REALTIME_STALE_SESSION_MINUTES")
            .ok()
            .and_then(|v| v.parse::<i64>().ok())
            .filter(|minutes| *minutes > 0)
            .and_then(Duration::try_minutes)
            .unwrap_or_else(|| Duration::minutes(DEFAULT_STALE_SESSION_MINUTES));

        let relaxed_mode =
            env("ATELIER_REALTIME_RELAXED_MODE").map(|v| parse_flag(&v)).unwrap_or(false);

        let day_offset = env("ATELIER_REALTIME_DAY_OFFSET_MINUTES")
            .ok()
            .and_then(|v| v.parse::<i32>().ok())
            .and_then(|minutes| minutes.checked_mul(60))
            .and_then(FixedOffset::east_opt);

        Self {
            listen_addr,
            jwt_secret,
            database_url,
            log_filter,
            log_json,
            stale_session_threshold,
            relaxed_mode,
            day_offset,
        }
    }

    /// Returns true when using the development-only JWT secret.
    pub fn is_dev_jwt_secret(&self) -> bool {
        self.jwt_secret == DEV_JWT_SECRET
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_from_map(
        map: HashMap<&'static str, &'static str>,
    ) -> impl Fn(&str) -> Result<String, std::env::VarError> {
        move |key: &str| map.get(key).map(|v| v.to_string()).ok_or(std::env::VarError::NotPresent)
    }

    #[test]
    fn defaults_when_no_env_vars() {
        let cfg = RealtimeConfig::from_env_fn(env_from_map(HashMap::new()));
        assert_eq!(cfg.listen_addr.port(), 8090);
        assert_eq!(cfg.listen_addr.ip().to_string(), "0.0.0.0");
        assert!(cfg.is_dev_jwt_secret());
        assert!(cfg.database_url.is_none());
        assert_eq!(cfg.log_filter, "info");
        assert!(!cfg.log_json);
        assert_eq!(cfg.stale_session_threshold, Duration::hours(1));
        assert!(!cfg.relaxed_mode);
        assert!(cfg.day_offset.is_none());
    }

    #[test]
    fn dev_secret_is_long_enough_for_the_gate() {
        assert!(DEV_JWT_SECRET.len() >= 32);
    }

    #[test]
    fn custom_host_and_port() {
        let mut m = HashMap::new();
        m.insert("ATELIER_REALTIME_HOST", "127.0.0.1");
        m.insert("ATELIER_REALTIME_PORT", "3000");
        let cfg = RealtimeConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.listen_addr.to_string(), "127.0.0.1:3000");
    }

    #[test]
    fn invalid_port_uses_default() {
        let mut m = HashMap::new();
        m.insert("ATELIER_REALTIME_PORT", "not_a_number");
        let cfg = RealtimeConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.listen_addr.port(), 8090);
    }

    #[test]
    fn custom_jwt_secret_is_not_dev() {
        let mut m = HashMap::new();
        m.insert("ATELIER_REALTIME_JWT_SECRET", "production_secret_at_least_32_chars!!");
        let cfg = RealtimeConfig::from_env_fn(env_from_map(m));
        assert!(!cfg.is_dev_jwt_secret());
    }

    #[test]
    fn empty_database_url_means_in_memory() {
        let mut m = HashMap::new();
        m.insert("ATELIER_REALTIME_DATABASE_URL", "");
        let cfg = RealtimeConfig::from_env_fn(env_from_map(m));
        assert!(cfg.database_url.is_none());

        let mut m = HashMap::new();
        m.insert("ATELIER_REALTIME_DATABASE_URL", "postgres://u:p@host/db?sslmode=require");
        let cfg = RealtimeConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.database_url.as_deref(), Some("postgres://u:p@host/db?sslmode=require"));
    }

    #[test]
    fn stale_threshold_override_and_fallback() {
        let mut m = HashMap::new();
        m.insert("ATELIER_REALTIME_STALE_SESSION_MINUTES", "15");
        let cfg = RealtimeConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.stale_session_threshold, Duration::minutes(15));

        let mut m = HashMap::new();
        m.insert("ATELIER_REALTIME_STALE_SESSION_MINUTES", "-5");
        let cfg = RealtimeConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.stale_session_threshold, Duration::minutes(60));
    }

    #[test]
    fn relaxed_mode_flag_variants() {
        for raw in ["1", "true", "YES", " on "] {
            let mut m = HashMap::new();
            m.insert("ATELIER_REALTIME_RELAXED_MODE", raw);
            assert!(RealtimeConfig::from_env_fn(env_from_map(m)).relaxed_mode, "{raw}");
        }
        let mut m = HashMap::new();
        m.insert("ATELIER_REALTIME_RELAXED_MODE", "0");
        assert!(!RealtimeConfig::from_env_fn(env_from_map(m)).relaxed_mode);
    }

    #[test]
    fn day_offset_from_minutes() {
        let mut m = HashMap::new();
        m.insert("ATELIER_REALTIME_DAY_OFFSET_MINUTES", "-300");
        let cfg = RealtimeConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.day_offset, FixedOffset::west_opt(5 * 3600));

        let mut m = HashMap::new();
        m.insert("ATELIER_REALTIME_DAY_OFFSET_MINUTES", "99999");
        let cfg = RealtimeConfig::from_env_fn(env_from_map(m));
        assert!(cfg.day_offset.is_none());
    }

    #[test]
    fn oversized_numeric_values_fall_back_to_defaults() {
        let mut m = HashMap::new();
        m.insert("ATELIER_REALTIME_DAY_OFFSET_MINUTES", "40000000");
        m.insert("ATELIER_REALTIME_STALE_SESSION_MINUTES", "9223372036854775807");
        let cfg = RealtimeConfig::from_env_fn(env_from_map(m));
        assert!(cfg.day_offset.is_none());
        assert_eq!(cfg.stale_session_threshold, Duration::minutes(60));

        let mut m = HashMap::new();
        m.insert("ATELIER_REALTIME_DAY_OFFSET_MINUTES", "-40000000");
        assert!(RealtimeConfig::from_env_fn(env_from_map(m)).day_offset.is_none());
    }

    #[test]
    fn log_filter_override() {
        let mut m = HashMap::new();
        m.insert("ATELIER_REALTIME_LOG_FILTER", "debug,tower_http=trace");
        let cfg = RealtimeConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.log_filter, "debug,tower_http=trace");
    }
}
