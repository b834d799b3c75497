//! Configuration for both telemetry roles
//!
//! Handles:
//! - Point session endpoint and station addressing
//! - Producer cadence, run length and value range
//! - Resource monitor cadence and overload threshold
//! - Store, sentinel and resource log locations
//!
//! Lookup order: `$TELEMETRY_CONFIG`, `./telemetry.toml`, then the OS config
//! directory. A missing file means defaults.

use crate::error::ConfigError;
use crate::protocol::{Cause, PointType};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Which side of the pair this process plays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Producer,
    Consumer,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Producer => "producer",
            Role::Consumer => "consumer",
        }
    }

    /// The consumer starts first and owns the t0 sentinel
    pub fn publishes_start_time(&self) -> bool {
        matches!(self, Role::Consumer)
    }

    /// Root span every log line of the role is emitted under
    pub fn span(&self) -> tracing::Span {
        match self {
            Role::Producer => tracing::info_span!("producer"),
            Role::Consumer => tracing::info_span!("consumer"),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub endpoint: EndpointConfig,
    pub points: PointsConfig,
    pub producer: ProducerConfig,
    pub consumer: ConsumerConfig,
    pub monitor: MonitorConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    pub host: String,
    pub port: u16,
    pub common_address: u16,
    pub keep_alive_secs: u64,
    /// How long startup waits for running + connected
    pub connect_wait_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PointsConfig {
    pub first_address: u32,
    pub count: u32,
    pub point_type: PointType,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProducerConfig {
    pub cadence_secs: f64,
    /// Number of passes; ignored when `run_duration_secs` is set
    pub passes: u64,
    pub run_duration_secs: Option<u64>,
    pub value_min: f64,
    pub value_max: f64,
    pub batch_size: Option<usize>,
    pub cause: Cause,
    pub log_every_nth: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    pub run_duration_secs: u64,
    pub log_every_nth: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub sampling_interval_secs: u64,
    pub sampling_window_ms: u64,
    pub overload_threshold: f64,
    pub join_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
    pub producer_store: String,
    pub consumer_store: String,
    pub handshake_file: String,
    pub log_dir: PathBuf,
    pub handshake_max_wait_secs: u64,
    pub retry_attempts: u32,
    pub retry_backoff_ms: u64,
    pub clear_handshake_on_exit: bool,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 2404,
            common_address: 1,
            keep_alive_secs: 30,
            connect_wait_secs: 10,
        }
    }
}

impl Default for PointsConfig {
    fn default() -> Self {
        Self {
            first_address: 1000,
            count: 1000,
            point_type: PointType::MeasuredShortFloat,
        }
    }
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            cadence_secs: 1.0,
            passes: 60,
            run_duration_secs: None,
            value_min: 0.0,
            value_max: 100.0,
            batch_size: None,
            cause: Cause::Spontaneous,
            log_every_nth: 1,
        }
    }
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            run_duration_secs: 80,
            log_every_nth: 1,
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            sampling_interval_secs: 5,
            sampling_window_ms: 1000,
            overload_threshold: 80.0,
            join_timeout_secs: 10,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("."),
            producer_store: "client_resources.json".to_string(),
            consumer_store: "server_resources.json".to_string(),
            handshake_file: "start_time.json".to_string(),
            log_dir: PathBuf::from("logs"),
            handshake_max_wait_secs: 10,
            retry_attempts: 3,
            retry_backoff_ms: 1000,
            clear_handshake_on_exit: true,
        }
    }
}

/// Where a loaded config came from, reported once logging is up
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    Defaults,
    File(PathBuf),
    /// Blank file, defaults used
    EmptyFile(PathBuf),
}

impl ConfigSource {
    pub fn log(&self) {
        match self {
            Self::Defaults => info!("no telemetry config found, using defaults"),
            Self::File(path) => info!("loaded telemetry config from {:?}", path),
            Self::EmptyFile(path) => warn!("config {:?} is empty, using defaults", path),
        }
    }
}

impl TelemetryConfig {
    /// Load config from the first location that exists, defaults otherwise
    pub fn load() -> Result<(Self, ConfigSource), ConfigError> {
        dotenvy::dotenv().ok();

        match Self::locate() {
            Some(path) => Self::load_from(&path),
            None => Ok((Self::default(), ConfigSource::Defaults)),
        }
    }

    /// Load and validate a specific TOML file
    pub fn load_from(path: &Path) -> Result<(Self, ConfigSource), ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let (config, source) = if content.trim().is_empty() {
            (Self::default(), ConfigSource::EmptyFile(path.to_path_buf()))
        } else {
            let config = toml::from_str(&content).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
            (config, ConfigSource::File(path.to_path_buf()))
        };

        config.validate()?;
        Ok((config, source))
    }

    fn locate() -> Option<PathBuf> {
        if let Ok(explicit) = std::env::var("TELEMETRY_CONFIG") {
            return Some(PathBuf::from(explicit));
        }

        let local = PathBuf::from("telemetry.toml");
        if local.exists() {
            return Some(local);
        }

        dirs::config_dir()
            .map(|dir| dir.join("point-telemetry").join("config.toml"))
            .filter(|path| path.exists())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
            ConfigError::Invalid { field, reason: reason.into() }
        }

        if self.points.count == 0 {
            return Err(invalid("points.count", "at least one point is required"));
        }
        if self.points.first_address.checked_add(self.points.count - 1).is_none() {
            return Err(invalid("points.count", "address range overflows"));
        }
        if !(self.producer.cadence_secs.is_finite() && self.producer.cadence_secs > 0.0) {
            return Err(invalid("producer.cadence_secs", "must be a positive number of seconds"));
        }
        for (field, bound) in [
            ("producer.value_min", self.producer.value_min),
            ("producer.value_max", self.producer.value_max),
        ] {
            if !bound.is_finite() {
                return Err(invalid(field, "must be a finite number"));
            }
        }
        if self.producer.value_min > self.producer.value_max {
            return Err(invalid(
                "producer.value_min",
                format!("{} exceeds value_max {}", self.producer.value_min, self.producer.value_max),
            ));
        }
        if self.producer.batch_size == Some(0) {
            return Err(invalid("producer.batch_size", "must be greater than zero"));
        }
        if !(0.0..=100.0).contains(&self.monitor.overload_threshold) {
            return Err(invalid("monitor.overload_threshold", "must be between 0 and 100"));
        }
        if self.monitor.sampling_interval_secs == 0 {
            return Err(invalid("monitor.sampling_interval_secs", "must be greater than zero"));
        }
        if self.storage.retry_attempts == 0 {
            return Err(invalid("storage.retry_attempts", "must be greater than zero"));
        }
        Ok(())
    }

    /// Ordered addresses of the configured point set
    pub fn point_addresses(&self) -> impl Iterator<Item = u32> {
        let first = self.points.first_address;
        (0..self.points.count).map(move |offset| first + offset)
    }

    pub fn store_path(&self, role: Role) -> PathBuf {
        let file = match role {
            Role::Producer => &self.storage.producer_store,
            Role::Consumer => &self.storage.consumer_store,
        };
        self.storage.data_dir.join(file)
    }

    pub fn handshake_path(&self) -> PathBuf {
        self.storage.data_dir.join(&self.storage.handshake_file)
    }

    pub fn resource_log_path(&self, role: Role) -> PathBuf {
        self.storage.log_dir.join(format!("{}_resource_usage.log", role))
    }

    pub fn cadence(&self) -> Duration {
        Duration::from_secs_f64(self.producer.cadence_secs)
    }

    pub fn connect_wait(&self) -> Duration {
        Duration::from_secs(self.endpoint.connect_wait_secs)
    }

    pub fn handshake_max_wait(&self) -> Duration {
        Duration::from_secs(self.storage.handshake_max_wait_secs)
    }
}
