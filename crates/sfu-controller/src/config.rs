//! SFU controller configuration.
//!
//! Configuration is loaded from environment variables. `from_vars` takes an
//! explicit map so tests do not have to mutate the process environment.

use crate::geo::Coordinate;
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Default HTTP bind address (internal API, health, metrics).
pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:8090";

/// Default number of concurrent workers per reconciliation queue.
pub const DEFAULT_QUEUE_CONCURRENCY: usize = 50;

/// Default base delay for queue retry backoff in milliseconds.
pub const DEFAULT_RETRY_BASE_MS: u64 = 200;

/// Default cap for queue retry backoff in milliseconds.
pub const DEFAULT_RETRY_MAX_MS: u64 = 10_000;

/// Default worker staleness threshold in seconds.
pub const DEFAULT_WORKER_STALENESS_SECONDS: u64 = 15;

/// Default worker health check interval in seconds.
pub const DEFAULT_HEALTH_CHECK_INTERVAL_SECONDS: u64 = 5;

/// Default interval between store compaction runs in seconds.
pub const DEFAULT_PURGE_INTERVAL_SECONDS: u64 = 30;

/// Default time a deleted row is kept before compaction drops it, in seconds.
pub const DEFAULT_PURGE_RETENTION_SECONDS: u64 = 60;

/// Default placement fallback coordinate (Frankfurt).
pub const DEFAULT_FALLBACK_COORDINATE: Coordinate = Coordinate {
    lat: 50.1109,
    long: 8.6821,
};

/// Default placement tolerance in kilometres.
pub const DEFAULT_PLACEMENT_TOLERANCE_KM: f64 = 200.0;

/// Default graceful shutdown drain in seconds.
pub const DEFAULT_DRAIN_SECONDS: u64 = 5;

/// SFU controller configuration.
#[derive(Clone)]
pub struct Config {
    /// HTTP bind address (default: "0.0.0.0:8090").
    pub bind_address: String,

    /// Concurrent workers per reconciliation queue (default: 50).
    pub queue_concurrency: usize,

    /// Base retry backoff in milliseconds (default: 200).
    pub retry_base_ms: u64,

    /// Maximum retry backoff in milliseconds (default: 10000).
    pub retry_max_ms: u64,

    /// Seconds after which a worker's last health report is stale (default: 15).
    pub worker_staleness_seconds: u64,

    /// Worker health check interval in seconds (default: 5).
    pub health_check_interval_seconds: u64,

    /// Store compaction interval in seconds (default: 30).
    pub purge_interval_seconds: u64,

    /// Seconds a deleted row is kept before compaction (default: 60).
    pub purge_retention_seconds: u64,

    /// Coordinate used when a request IP cannot be geolocated.
    pub fallback_coordinate: Coordinate,

    /// Workers within this distance of the closest one are equivalent.
    pub placement_tolerance_km: f64,

    /// Static geo-IP table (`ip -> coordinate`).
    pub geoip_table: HashMap<String, Coordinate>,

    /// IP announced in ICE candidates, if the worker's own IP is not routable.
    pub announced_ip: Option<String>,

    /// Graceful shutdown drain in seconds (default: 5).
    pub drain_seconds: u64,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("bind_address", &self.bind_address)
            .field("queue_concurrency", &self.queue_concurrency)
            .field("retry_base_ms", &self.retry_base_ms)
            .field("retry_max_ms", &self.retry_max_ms)
            .field("worker_staleness_seconds", &self.worker_staleness_seconds)
            .field(
                "health_check_interval_seconds",
                &self.health_check_interval_seconds,
            )
            .field("purge_interval_seconds", &self.purge_interval_seconds)
            .field("purge_retention_seconds", &self.purge_retention_seconds)
            .field("fallback_coordinate", &self.fallback_coordinate)
            .field("placement_tolerance_km", &self.placement_tolerance_km)
            .field("geoip_entries", &self.geoip_table.len())
            .field("announced_ip", &self.announced_ip)
            .field("drain_seconds", &self.drain_seconds)
            .finish()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: DEFAULT_BIND_ADDRESS.to_string(),
            queue_concurrency: DEFAULT_QUEUE_CONCURRENCY,
            retry_base_ms: DEFAULT_RETRY_BASE_MS,
            retry_max_ms: DEFAULT_RETRY_MAX_MS,
            worker_staleness_seconds: DEFAULT_WORKER_STALENESS_SECONDS,
            health_check_interval_seconds: DEFAULT_HEALTH_CHECK_INTERVAL_SECONDS,
            purge_interval_seconds: DEFAULT_PURGE_INTERVAL_SECONDS,
            purge_retention_seconds: DEFAULT_PURGE_RETENTION_SECONDS,
            fallback_coordinate: DEFAULT_FALLBACK_COORDINATE,
            placement_tolerance_km: DEFAULT_PLACEMENT_TOLERANCE_KM,
            geoip_table: HashMap::new(),
            announced_ip: None,
            drain_seconds: DEFAULT_DRAIN_SECONDS,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {name}: {reason}")]
    InvalidValue { name: String, reason: String },

    #[error("Invalid geo-IP table entry: {0}")]
    InvalidGeoIpEntry(String),
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a HashMap (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let defaults = Config::default();

        let bind_address = vars
            .get("BIND_ADDRESS")
            .cloned()
            .unwrap_or(defaults.bind_address);

        let queue_concurrency =
            parse_positive(vars, "SFU_QUEUE_CONCURRENCY", defaults.queue_concurrency)?;
        let retry_base_ms = parse_positive(vars, "SFU_RETRY_BASE_MS", defaults.retry_base_ms)?;
        let retry_max_ms = parse_positive(vars, "SFU_RETRY_MAX_MS", defaults.retry_max_ms)?;
        if retry_max_ms < retry_base_ms {
            return Err(ConfigError::InvalidValue {
                name: "SFU_RETRY_MAX_MS".to_string(),
                reason: format!("must be >= SFU_RETRY_BASE_MS ({retry_base_ms})"),
            });
        }

        let worker_staleness_seconds = parse_positive(
            vars,
            "SFU_WORKER_STALENESS_SECONDS",
            defaults.worker_staleness_seconds,
        )?;
        let health_check_interval_seconds = parse_positive(
            vars,
            "SFU_HEALTH_CHECK_INTERVAL_SECONDS",
            defaults.health_check_interval_seconds,
        )?;

        let purge_interval_seconds = parse_positive(
            vars,
            "SFU_PURGE_INTERVAL_SECONDS",
            defaults.purge_interval_seconds,
        )?;
        let purge_retention_seconds = parse_or(
            vars,
            "SFU_PURGE_RETENTION_SECONDS",
            defaults.purge_retention_seconds,
        )?;

        let lat = parse_or(vars, "SFU_FALLBACK_LAT", defaults.fallback_coordinate.lat)?;
        let long = parse_or(vars, "SFU_FALLBACK_LONG", defaults.fallback_coordinate.long)?;
        let fallback_coordinate = Coordinate::new(lat, long).ok_or_else(|| {
            ConfigError::InvalidValue {
                name: "SFU_FALLBACK_LAT/SFU_FALLBACK_LONG".to_string(),
                reason: format!("({lat}, {long}) is not a valid coordinate"),
            }
        })?;

        let placement_tolerance_km = parse_or(
            vars,
            "SFU_PLACEMENT_TOLERANCE_KM",
            defaults.placement_tolerance_km,
        )?;
        if !placement_tolerance_km.is_finite() || placement_tolerance_km < 0.0 {
            return Err(ConfigError::InvalidValue {
                name: "SFU_PLACEMENT_TOLERANCE_KM".to_string(),
                reason: "must be a non-negative number".to_string(),
            });
        }

        let geoip_table = match vars.get("SFU_GEOIP_TABLE") {
            Some(raw) => parse_geoip_table(raw)?,
            None => HashMap::new(),
        };

        let announced_ip = vars
            .get("SFU_ANNOUNCED_IP")
            .filter(|s| !s.is_empty())
            .cloned();

        let drain_seconds = parse_or(vars, "SFU_DRAIN_SECONDS", defaults.drain_seconds)?;

        Ok(Config {
            bind_address,
            queue_concurrency,
            retry_base_ms,
            retry_max_ms,
            worker_staleness_seconds,
            health_check_interval_seconds,
            purge_interval_seconds,
            purge_retention_seconds,
            fallback_coordinate,
            placement_tolerance_km,
            geoip_table,
            announced_ip,
            drain_seconds,
        })
    }
}

fn parse_or<T>(vars: &HashMap<String, String>, name: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match vars.get(name) {
        Some(value_str) => value_str
            .trim()
            .parse()
            .map_err(|e: T::Err| ConfigError::InvalidValue {
                name: name.to_string(),
                reason: format!("got '{value_str}': {e}"),
            }),
        None => Ok(default),
    }
}

fn parse_positive<T>(
    vars: &HashMap<String, String>,
    name: &str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr + PartialEq + Default,
    T::Err: fmt::Display,
{
    let value = parse_or(vars, name, default)?;
    if value == T::default() {
        return Err(ConfigError::InvalidValue {
            name: name.to_string(),
            reason: "must be greater than 0".to_string(),
        });
    }
    Ok(value)
}

/// Parse `ip=lat,long;ip=lat,long`.
fn parse_geoip_table(raw: &str) -> Result<HashMap<String, Coordinate>, ConfigError> {
    let mut table = HashMap::new();
    for entry in raw.split(';').map(str::trim).filter(|e| !e.is_empty()) {
        let (ip, coords) = entry
            .split_once('=')
            .ok_or_else(|| ConfigError::InvalidGeoIpEntry(entry.to_string()))?;
        let (lat, long) = coords
            .split_once(',')
            .ok_or_else(|| ConfigError::InvalidGeoIpEntry(entry.to_string()))?;
        let lat: f64 = lat
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidGeoIpEntry(entry.to_string()))?;
        let long: f64 = long
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidGeoIpEntry(entry.to_string()))?;
        let coordinate = Coordinate::new(lat, long)
            .ok_or_else(|| ConfigError::InvalidGeoIpEntry(entry.to_string()))?;
        table.insert(ip.trim().to_string(), coordinate);
    }
    Ok(table)
}
