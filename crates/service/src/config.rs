//! Application configuration loaded from environment variables.

use std::str::FromStr;
use std::time::Duration;

/// Output format of the log subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl LogFormat {
    fn parse(value: &str) -> Self {
        if value.eq_ignore_ascii_case("json") {
            LogFormat::Json
        } else {
            LogFormat::Text
        }
    }
}

/// Server configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `HOST`: bind address (default: `"0.0.0.0"`)
/// - `PORT`: listen port (default: `50051`)
/// - `RUST_LOG`: tracing filter directive (default: `"info"`)
/// - `LOG_FORMAT`: `text` or `json` (default: `text`)
/// - `WRITE_DATABASE_URL` / `READ_DATABASE_URL`: PostgreSQL URLs; when
///   unset the corresponding store is kept in memory
/// - `CONSUMER_GROUP`: group label for durable channels (default: `"entity-service"`)
/// - `DISPATCHER_MAX_WORKERS`: concurrent async handler calls (default: `20`)
/// - `REQUEST_TIMEOUT_SECS`: unary request deadline (default: `5`)
/// - `STREAM_TIMEOUT_SECS`: streaming request deadline (default: `10`)
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub log_format: LogFormat,
    pub write_database_url: Option<String>,
    pub read_database_url: Option<String>,
    pub consumer_group: String,
    pub dispatcher_max_workers: usize,
    pub request_timeout: Duration,
    pub stream_timeout: Duration,
}

impl Config {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads configuration from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        Self {
            host: lookup("HOST").unwrap_or(defaults.host),
            port: parsed(&lookup, "PORT").unwrap_or(defaults.port),
            log_level: lookup("RUST_LOG").unwrap_or(defaults.log_level),
            log_format: lookup("LOG_FORMAT")
                .map(|v| LogFormat::parse(&v))
                .unwrap_or(defaults.log_format),
            write_database_url: non_empty("WRITE_DATABASE_URL"),
            read_database_url: non_empty("READ_DATABASE_URL"),
            consumer_group: lookup("CONSUMER_GROUP").unwrap_or(defaults.consumer_group),
            dispatcher_max_workers: parsed(&lookup, "DISPATCHER_MAX_WORKERS")
                .unwrap_or(defaults.dispatcher_max_workers),
            request_timeout: parsed(&lookup, "REQUEST_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.request_timeout),
            stream_timeout: parsed(&lookup, "STREAM_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.stream_timeout),
        }
    }

    /// Returns the `"host:port"` bind address string.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    lookup(key).and_then(|value| value.trim().parse().ok())
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 50051,
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
            write_database_url: None,
            read_database_url: None,
            consumer_group: "entity-service".to_string(),
            dispatcher_max_workers: event_bus::DEFAULT_MAX_WORKERS,
            request_timeout: Duration::from_secs(5),
            stream_timeout: Duration::from_secs(10),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_default_values() {
        let config = Config::default();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 50051);
        assert_eq!(config.log_level, "info");
        assert_eq!(config.log_format, LogFormat::Text);
        assert_eq!(config.consumer_group, "entity-service");
        assert_eq!(config.dispatcher_max_workers, 20);
        assert_eq!(config.request_timeout, Duration::from_secs(5));
        assert_eq!(config.stream_timeout, Duration::from_secs(10));
        assert!(config.write_database_url.is_none());
    }

    #[test]
    fn test_addr_formatting() {
        let config = Config {
            host: "127.0.0.1".to_string(),
            port: 8080,
            ..Config::default()
        };
        assert_eq!(config.addr(), "127.0.0.1:8080");
    }

    #[test]
    fn test_lookup_overrides() {
        let config = Config::from_lookup(lookup(&[
            ("PORT", "9000"),
            ("LOG_FORMAT", "JSON"),
            ("WRITE_DATABASE_URL", "postgres://w"),
            ("READ_DATABASE_URL", " "),
            ("DISPATCHER_MAX_WORKERS", "4"),
            ("REQUEST_TIMEOUT_SECS", "2"),
        ]));

        assert_eq!(config.port, 9000);
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.write_database_url.as_deref(), Some("postgres://w"));
        assert!(config.read_database_url.is_none());
        assert_eq!(config.dispatcher_max_workers, 4);
        assert_eq!(config.request_timeout, Duration::from_secs(2));
        assert_eq!(config.stream_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_unparsable_values_fall_back() {
        let config = Config::from_lookup(lookup(&[("PORT", "http"), ("STREAM_TIMEOUT_SECS", "-1")]));
        assert_eq!(config.port, 50051);
        assert_eq!(config.stream_timeout, Duration::from_secs(10));
    }
}
