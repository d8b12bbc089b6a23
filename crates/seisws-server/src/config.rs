//! Server configuration loading from file and environment variables.

use seisws_availability::CacheMode;
use serde::Deserialize;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use thiserror::Error;

/// Top-level server configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub availability: AvailabilityConfig,

    #[serde(default)]
    pub dataselect: DataselectConfig,

    #[serde(default)]
    pub access: AccessConfig,

    #[serde(default)]
    pub tracking: TrackingConfig,
}

/// Network configuration for the HTTP server.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: IpAddr,

    #[serde(default = "default_port")]
    pub port: u16,
}

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the SQLite database holding extents, segments and access rules.
    #[serde(default = "default_db_path")]
    pub path: String,

    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    #[serde(default = "default_pool_max_size")]
    pub pool_max_size: u32,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "seisws_server=debug,info").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to output logs in JSON format.
    #[serde(default)]
    pub json: bool,
}

/// Availability service settings.
#[derive(Debug, Clone, Deserialize)]
pub struct AvailabilityConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Seconds an extent index snapshot stays valid.
    #[serde(default = "default_cache_duration")]
    pub cache_duration_secs: u64,

    /// `stale` serves the old snapshot while one request rebuilds,
    /// `strict` makes every request wait for the rebuild.
    #[serde(default)]
    pub cache_mode: CacheMode,

    /// Keep restricted streams in the index so authorized callers see them.
    #[serde(default = "default_true")]
    pub allow_restricted: bool,

    /// Dotted `NET.STA.LOC.CHA` codes served without authentication.
    /// Unset marks every stream restricted.
    #[serde(default)]
    pub open_streams: Option<Vec<String>>,
}

/// Dataselect service settings.
#[derive(Debug, Clone, Deserialize)]
pub struct DataselectConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Root of the SDS archive.
    #[serde(default = "default_archive_path")]
    pub archive_path: String,

    /// Bytes a fetch gathers before flushing.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Blocking fetch workers shared by all deliveries.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Chunks buffered towards the client before delivery pauses.
    #[serde(default = "default_buffer_chunks")]
    pub buffer_chunks: usize,

    /// Per-request sample budget in millions.
    #[serde(default)]
    pub samples_m: Option<f64>,

    /// Seconds of the most recent data withheld from delivery.
    #[serde(default)]
    pub realtime_gap_secs: Option<i64>,

    /// Public network code to the code the archive stores it under.
    #[serde(default)]
    pub archive_networks: HashMap<String, String>,

    /// Attachment name prefix; `%time` is replaced by the request time.
    #[serde(default = "default_file_name_prefix")]
    pub file_name_prefix: String,
}

/// Authentication settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AccessConfig {
    /// TOML users file for HTTP Basic authentication.
    #[serde(default)]
    pub users_file: Option<String>,
}

/// Request tracking settings.
#[derive(Debug, Clone, Deserialize)]
pub struct TrackingConfig {
    /// Log one JSON line per dataselect request.
    #[serde(default = "default_true")]
    pub request_log: bool,

    /// Record requests in the `request_log` tables.
    #[serde(default)]
    pub database: bool,

    /// User name recorded for anonymous requests.
    #[serde(default)]
    pub default_user: Option<String>,

    /// Salt for hashed user ids in the request log.
    #[serde(default)]
    pub user_salt: String,
}

fn default_true() -> bool {
    true
}

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))
}

fn default_port() -> u16 {
    8080
}

fn default_db_path() -> String {
    "seisws.db".to_string()
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

fn default_pool_max_size() -> u32 {
    8
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_cache_duration() -> u64 {
    600
}

fn default_archive_path() -> String {
    "sds".to_string()
}

fn default_chunk_size() -> usize {
    seisws_delivery::DEFAULT_CHUNK_SIZE
}

fn default_workers() -> usize {
    4
}

fn default_buffer_chunks() -> usize {
    4
}

fn default_file_name_prefix() -> String {
    "fdsnws".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
            pool_max_size: default_pool_max_size(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl Default for AvailabilityConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cache_duration_secs: default_cache_duration(),
            cache_mode: CacheMode::default(),
            allow_restricted: true,
            open_streams: None,
        }
    }
}

impl Default for DataselectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            archive_path: default_archive_path(),
            chunk_size: default_chunk_size(),
            workers: default_workers(),
            buffer_chunks: default_buffer_chunks(),
            samples_m: None,
            realtime_gap_secs: None,
            archive_networks: HashMap::new(),
            file_name_prefix: default_file_name_prefix(),
        }
    }
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            request_log: true,
            database: false,
            default_user: None,
            user_salt: String::new(),
        }
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Loads configuration from a TOML file, falling back to defaults.
///
/// Environment variable overrides:
/// - `SEISWS_HOST` overrides `server.host`
/// - `SEISWS_PORT` overrides `server.port`
/// - `SEISWS_DB_PATH` overrides `database.path`
/// - `SEISWS_LOG_LEVEL` overrides `logging.level`
/// - `SEISWS_LOG_JSON` overrides `logging.json` (set to "true" to enable)
/// - `SEISWS_ARCHIVE_PATH` overrides `dataselect.archive_path`
///
/// # Errors
///
/// Returns `ConfigError` if the file exists but cannot be read or parsed.
pub fn load_config(path: Option<&str>) -> Result<Config, ConfigError> {
    let mut config = match path {
        Some(p) => match std::fs::read_to_string(p) {
            Ok(contents) => toml::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = p, "config file not found, using defaults");
                Config::default()
            }
            Err(e) => return Err(ConfigError::FileRead(e)),
        },
        None => Config::default(),
    };

    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    Ok(config)
}

fn apply_env_overrides(config: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(host) = var("SEISWS_HOST") {
        match host.parse() {
            Ok(parsed) => config.server.host = parsed,
            Err(_) => tracing::warn!(value = %host, "ignoring invalid SEISWS_HOST"),
        }
    }
    if let Some(port) = var("SEISWS_PORT") {
        match port.parse() {
            Ok(parsed) => config.server.port = parsed,
            Err(_) => tracing::warn!(value = %port, "ignoring invalid SEISWS_PORT"),
        }
    }
    if let Some(db_path) = var("SEISWS_DB_PATH") {
        config.database.path = db_path;
    }
    if let Some(level) = var("SEISWS_LOG_LEVEL") {
        config.logging.level = level;
    }
    if let Some(json) = var("SEISWS_LOG_JSON") {
        config.logging.json = json == "true" || json == "1";
    }
    if let Some(archive) = var("SEISWS_ARCHIVE_PATH") {
        config.dataselect.archive_path = archive;
    }
}
