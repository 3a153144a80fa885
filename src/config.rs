use std::env;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {key}: {reason}")]
    Invalid { key: &'static str, reason: String },

    #[error("missing required variable {0}")]
    Missing(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Memory,
    External,
}

impl std::str::FromStr for Backend {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.to_ascii_lowercase().as_str() {
            "memory" => Ok(Backend::Memory),
            "external" => Ok(Backend::External),
            other => Err(format!("unknown backend {other}, expected memory/external")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Compact,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.to_ascii_lowercase().as_str() {
            "compact" => Ok(LogFormat::Compact),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format {other}, expected compact/json")),
        }
    }
}

/// Knobs the dispatch server reads at runtime. Split from [`Config`] so tests
/// can build a server without touching the process environment.
#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub match_radius_km: f64,
    pub geo_cell_degrees: f64,
    pub vehicle_class_ttl: Duration,
    pub pending_ttl: Duration,
    pub fan_out_concurrency: usize,
    pub outbound_buffer: usize,
    pub auth_frame_timeout: Duration,
    pub consumer_fetch_timeout: Duration,
    pub consumer_idle_backoff: Duration,
    pub notification_group: String,
    pub location_group: String,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            match_radius_km: 100.0,
            geo_cell_degrees: 0.25,
            vehicle_class_ttl: Duration::from_secs(3600),
            pending_ttl: Duration::from_secs(600),
            fan_out_concurrency: 32,
            outbound_buffer: 64,
            auth_frame_timeout: Duration::from_secs(10),
            consumer_fetch_timeout: Duration::from_millis(5000),
            consumer_idle_backoff: Duration::from_millis(1000),
            notification_group: "notification-service".to_string(),
            location_group: "driver-location-service".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub http_port: u16,
    pub log_level: String,
    pub log_format: LogFormat,
    pub backend: Backend,
    pub jwt_secret: String,
    pub database_url: Option<String>,
    pub redis_url: Option<String>,
    pub kafka_brokers: String,
    pub shutdown_timeout: Duration,
    pub resource_close_timeout: Duration,
    pub operator_classes: Vec<(String, String)>,
    pub dispatch: DispatchSettings,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();

        let defaults = DispatchSettings::default();
        let dispatch = DispatchSettings {
            match_radius_km: parse_or_default("MATCH_RADIUS_KM", defaults.match_radius_km)?,
            geo_cell_degrees: parse_or_default("GEO_CELL_DEGREES", defaults.geo_cell_degrees)?,
            vehicle_class_ttl: secs_or_default("VEHICLE_CLASS_TTL_SECS", 3600)?,
            pending_ttl: secs_or_default("PENDING_TTL_SECS", 600)?,
            fan_out_concurrency: parse_or_default(
                "FAN_OUT_CONCURRENCY",
                defaults.fan_out_concurrency,
            )?,
            outbound_buffer: parse_or_default("OUTBOUND_BUFFER", defaults.outbound_buffer)?,
            auth_frame_timeout: secs_or_default("AUTH_FRAME_TIMEOUT_SECS", 10)?,
            consumer_fetch_timeout: millis_or_default("CONSUMER_FETCH_TIMEOUT_MS", 5000)?,
            consumer_idle_backoff: millis_or_default("CONSUMER_IDLE_BACKOFF_MS", 1000)?,
            notification_group: env::var("NOTIFICATION_GROUP")
                .unwrap_or(defaults.notification_group),
            location_group: env::var("LOCATION_GROUP").unwrap_or(defaults.location_group),
        };

        if !(dispatch.match_radius_km > 0.0) {
            return Err(ConfigError::Invalid {
                key: "MATCH_RADIUS_KM",
                reason: "must be > 0".to_string(),
            });
        }
        if !(dispatch.geo_cell_degrees > 0.0 && dispatch.geo_cell_degrees <= 90.0) {
            return Err(ConfigError::Invalid {
                key: "GEO_CELL_DEGREES",
                reason: "must be in (0, 90]".to_string(),
            });
        }
        if dispatch.fan_out_concurrency == 0 || dispatch.outbound_buffer == 0 {
            return Err(ConfigError::Invalid {
                key: "FAN_OUT_CONCURRENCY/OUTBOUND_BUFFER",
                reason: "must be > 0".to_string(),
            });
        }

        let operator_classes = match env::var("OPERATOR_CLASSES") {
            Ok(raw) => parse_operator_classes(&raw)?,
            Err(_) => Vec::new(),
        };

        Ok(Self {
            http_port: parse_or_default("HTTP_PORT", 8080)?,
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            log_format: parse_or_default("LOG_FORMAT", LogFormat::Compact)?,
            backend: parse_or_default("BACKEND", Backend::Memory)?,
            jwt_secret: env::var("JWT_SECRET").map_err(|_| ConfigError::Missing("JWT_SECRET"))?,
            database_url: env::var("DATABASE_URL").ok(),
            redis_url: env::var("REDIS_URL").ok(),
            kafka_brokers: env::var("KAFKA_BROKERS")
                .unwrap_or_else(|_| "localhost:9092".to_string()),
            shutdown_timeout: secs_or_default("SHUTDOWN_TIMEOUT_SECS", 15)?,
            resource_close_timeout: secs_or_default("RESOURCE_CLOSE_TIMEOUT_SECS", 5)?,
            operator_classes,
            dispatch,
        })
    }
}

fn parse_or_default<T>(key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw.parse::<T>().map_err(|err| ConfigError::Invalid {
            key,
            reason: err.to_string(),
        }),
        Err(_) => Ok(default),
    }
}

fn secs_or_default(key: &'static str, default: u64) -> Result<Duration, ConfigError> {
    parse_or_default(key, default).map(Duration::from_secs)
}

fn millis_or_default(key: &'static str, default: u64) -> Result<Duration, ConfigError> {
    parse_or_default(key, default).map(Duration::from_millis)
}

/// Parses `42=van,43=truck` into operator id / vehicle class pairs.
pub fn parse_operator_classes(raw: &str) -> Result<Vec<(String, String)>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (id, class) = pair.split_once('=').ok_or_else(|| ConfigError::Invalid {
                key: "OPERATOR_CLASSES",
                reason: format!("expected id=class, got {pair}"),
            })?;
            let (id, class) = (id.trim(), class.trim());
            if id.is_empty() || class.is_empty() {
                return Err(ConfigError::Invalid {
                    key: "OPERATOR_CLASSES",
                    reason: format!("empty id or class in {pair}"),
                });
            }
            Ok((id.to_string(), class.to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::{parse_operator_classes, Backend};

    #[test]
    fn operator_classes_parse_pairs() {
        let parsed = parse_operator_classes("42=van, 43 = truck,").unwrap();
        assert_eq!(
            parsed,
            vec![
                ("42".to_string(), "van".to_string()),
                ("43".to_string(), "truck".to_string())
            ]
        );
    }

    #[test]
    fn operator_classes_reject_missing_separator() {
        assert!(parse_operator_classes("42van").is_err());
        assert!(parse_operator_classes("=van").is_err());
    }

    #[test]
    fn backend_parses_case_insensitively() {
        assert_eq!("Memory".parse::<Backend>().unwrap(), Backend::Memory);
        assert_eq!("EXTERNAL".parse::<Backend>().unwrap(), Backend::External);
        assert!("kafka".parse::<Backend>().is_err());
    }
}
