// Configuration module for the race service

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

// =============================================================================
// CONFIGURATION STRUCTURES
// =============================================================================

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LoggingSettings {
    /// Write logs to stderr
    #[serde(default)]
    pub console: bool,
    /// Log file path. Empty = no file logging.
    #[serde(default)]
    pub log_file: String,
}

/// Path probe settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeSettings {
    #[serde(default = "default_max_hops")]
    pub max_hops: u32,
    /// Per-hop timeout handed to the traceroute tool
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Override of the platform traceroute program
    #[serde(default)]
    pub program: Option<String>,
    /// Capacity of each probe's event channel
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

fn default_max_hops() -> u32 {
    30
}
fn default_timeout_ms() -> u64 {
    700
}
fn default_event_capacity() -> usize {
    32
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            max_hops: default_max_hops(),
            timeout_ms: default_timeout_ms(),
            program: None,
            event_capacity: default_event_capacity(),
        }
    }
}

/// Geolocation service settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeoSettings {
    /// Lookup base URL; the address is appended as a path segment
    #[serde(default = "default_geo_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_geo_timeout")]
    pub timeout_secs: u64,
    /// Returns `{"ip": "..."}` for the caller
    #[serde(default = "default_public_ip_endpoint")]
    pub public_ip_endpoint: String,
}

fn default_geo_endpoint() -> String {
    "http://ip-api.com/json".to_string()
}
fn default_geo_timeout() -> u64 {
    5
}
fn default_public_ip_endpoint() -> String {
    "https://api.ipify.org?format=json".to_string()
}

impl Default for GeoSettings {
    fn default() -> Self {
        Self {
            endpoint: default_geo_endpoint(),
            timeout_secs: default_geo_timeout(),
            public_ip_endpoint: default_public_ip_endpoint(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSettings {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("traceroute_race.db")
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Observer feed (WebSocket) settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObserverSettings {
    #[serde(default = "default_observer_bind")]
    pub bind: String,
    /// Events buffered per observer before it starts missing them
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

fn default_observer_bind() -> String {
    "0.0.0.0:5001".to_string()
}
fn default_channel_capacity() -> usize {
    64
}

impl Default for ObserverSettings {
    fn default() -> Self {
        Self {
            bind: default_observer_bind(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

/// Challenge created at startup when none is active
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChallengeSettings {
    #[serde(default = "default_seed")]
    pub seed_default: bool,
    #[serde(default = "default_city_name")]
    pub city_name: String,
    #[serde(default = "default_city_lat")]
    pub city_lat: f64,
    #[serde(default = "default_city_lon")]
    pub city_lon: f64,
    #[serde(default = "default_radius_km")]
    pub radius_km: f64,
    #[serde(default = "default_target_host")]
    pub target_host: String,
    #[serde(default = "default_duration_hours")]
    pub duration_hours: i64,
}

fn default_seed() -> bool {
    true
}
fn default_city_name() -> String {
    "Tokyo, Japan".to_string()
}
fn default_city_lat() -> f64 {
    35.6762
}
fn default_city_lon() -> f64 {
    139.6503
}
fn default_radius_km() -> f64 {
    100.0
}
fn default_target_host() -> String {
    "8.8.8.8".to_string()
}
fn default_duration_hours() -> i64 {
    24
}

impl Default for ChallengeSettings {
    fn default() -> Self {
        Self {
            seed_default: default_seed(),
            city_name: default_city_name(),
            city_lat: default_city_lat(),
            city_lon: default_city_lon(),
            radius_km: default_radius_km(),
            target_host: default_target_host(),
            duration_hours: default_duration_hours(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub logging: LoggingSettings,
    #[serde(default)]
    pub probe: ProbeSettings,
    #[serde(default)]
    pub geo: GeoSettings,
    #[serde(default)]
    pub database: DatabaseSettings,
    #[serde(default)]
    pub observer: ObserverSettings,
    #[serde(default)]
    pub challenge: ChallengeSettings,
}

// =============================================================================
// CONFIG LOADING
// =============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("Failed to parse config file: {0}")]
    ParseError(#[from] toml::de::Error),
}

impl Config {
    pub const CONFIG_FILENAME: &'static str = "traceroute_race.toml";
    pub const ENV_DB_PATH: &'static str = "TRACEROUTE_RACE_DB";
    pub const ENV_OBSERVER_BIND: &'static str = "TRACEROUTE_RACE_OBSERVER_BIND";

    /// Directory of the running executable
    pub fn exe_directory() -> Option<PathBuf> {
        env::current_exe().ok()?.parent().map(Path::to_path_buf)
    }

    /// Config file to use when none is given: the working directory first,
    /// then next to the executable
    fn default_path() -> Option<PathBuf> {
        let local = PathBuf::from(Self::CONFIG_FILENAME);
        if local.exists() {
            return Some(local);
        }
        Self::exe_directory()
            .map(|dir| dir.join(Self::CONFIG_FILENAME))
            .filter(|p| p.exists())
    }

    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(contents)?)
    }

    /// Load configuration from `path` (or the default location), then apply
    /// environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config_path = path.map(Path::to_path_buf).or_else(Self::default_path);

        let mut config = match config_path {
            Some(config_path) => {
                debug!(path = %config_path.display(), "[config] Reading config");
                let contents = fs::read_to_string(&config_path)?;
                let config = Self::from_toml(&contents)?;
                info!(path = %config_path.display(), "[config] Loaded config");
                config
            }
            None => {
                debug!("[config] No config file found, using defaults");
                Config::default()
            }
        };

        config.apply_overrides(|key| env::var(key).ok());
        Ok(config)
    }

    /// Merge overrides looked up by `lookup`; empty values are ignored
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(db) = lookup(Self::ENV_DB_PATH).filter(|v| !v.is_empty()) {
            self.database.path = PathBuf::from(db);
            debug!("[config] Database path overridden from environment");
        }
        if let Some(bind) = lookup(Self::ENV_OBSERVER_BIND).filter(|v| !v.is_empty()) {
            self.observer.bind = bind;
            debug!("[config] Observer bind overridden from environment");
        }
    }

    pub fn log_file(&self) -> Option<PathBuf> {
        if self.logging.log_file.is_empty() {
            None
        } else {
            Some(PathBuf::from(&self.logging.log_file))
        }
    }
}
