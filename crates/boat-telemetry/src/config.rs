//! Engine configuration.
//!
//! Loaded from YAML, every field optional, then overridden from the
//! environment (`MQTT_HOST`, `MQTT_PORT`, `MQTT_USERNAME`, `MQTT_PASSWORD`,
//! `MQTT_USE_TLS`, `DATABASE_PATH`, `HTTP_BIND`).

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Config error: {0}")]
    Read(String),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub broker: BrokerConfig,
    pub store: StoreConfig,
    pub fanout: FanoutConfig,
    pub ingest: IngestConfig,
    pub http: HttpConfig,
}

/// MQTT broker connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub use_tls: bool,
    pub keep_alive_secs: u64,
    /// Connection attempts at startup before giving up.
    pub connect_retries: u32,
    pub retry_delay_ms: u64,
    /// Keep polling after a mid-session drop instead of ending ingestion.
    pub resume_after_disconnect: bool,
    /// Capacity of the rumqttc request channel.
    pub request_capacity: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            client_id: format!("boat-telemetry-{}", std::process::id()),
            username: None,
            password: None,
            use_tls: false,
            keep_alive_secs: 60,
            connect_retries: 30,
            retry_delay_ms: 2000,
            resume_after_disconnect: false,
            request_capacity: 64,
        }
    }
}

impl BrokerConfig {
    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

/// Time-series store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub path: PathBuf,
    pub pool_min: usize,
    pub pool_max: usize,
    /// Deadline for waiting on a free pooled connection.
    pub acquire_timeout_ms: u64,
    /// SQLite busy handler timeout per connection.
    pub busy_timeout_ms: u64,
    /// Width of one time partition.
    pub chunk_interval_secs: u64,
    /// Drop chunks that end more than this many days ago.
    pub retention_days: Option<u32>,
    pub retention_check_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
            pool_min: 1,
            pool_max: 10,
            acquire_timeout_ms: 5000,
            busy_timeout_ms: 5000,
            chunk_interval_secs: 86_400,
            retention_days: None,
            retention_check_secs: 3600,
        }
    }
}

impl StoreConfig {
    /// Config for a database at `path` with every other field defaulted.
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    pub fn retention(&self) -> Option<Duration> {
        self.retention_days
            .map(|days| Duration::from_secs(u64::from(days) * 86_400))
    }

    pub fn retention_check(&self) -> Duration {
        Duration::from_secs(self.retention_check_secs.max(1))
    }
}

fn home_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join(".boat-telemetry")
}

/// `~/.boat-telemetry/telemetry.db`
fn default_store_path() -> PathBuf {
    home_dir().join("telemetry.db")
}

/// `~/.boat-telemetry/config.yaml`
pub fn default_config_path() -> PathBuf {
    home_dir().join("config.yaml")
}

/// Live fan-out settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FanoutConfig {
    /// A subscriber that does not accept a frame within this window is dropped.
    pub send_timeout_ms: u64,
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            send_timeout_ms: 2000,
        }
    }
}

impl FanoutConfig {
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
}

/// Per-channel ingestion lane settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    pub lane_depth: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self { lane_depth: 1024 }
    }
}

/// HTTP listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub bind: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8000".to_string(),
        }
    }
}

impl Config {
    /// Load `path` (defaults if missing), apply environment overrides, validate.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let mut config: Config = load_config_or_default(path)?;
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary variable lookup.
    pub fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(host) = lookup("MQTT_HOST") {
            self.broker.host = host;
        }
        if let Some(port) = lookup("MQTT_PORT") {
            self.broker.port = port
                .parse()
                .map_err(|_| ConfigError::Invalid(format!("MQTT_PORT: {:?}", port)))?;
        }
        if let Some(user) = lookup("MQTT_USERNAME").filter(|u| !u.is_empty()) {
            self.broker.username = Some(user);
        }
        if let Some(pass) = lookup("MQTT_PASSWORD").filter(|p| !p.is_empty()) {
            self.broker.password = Some(pass);
        }
        if let Some(tls) = lookup("MQTT_USE_TLS") {
            self.broker.use_tls = tls.eq_ignore_ascii_case("true");
        }
        if let Some(path) = lookup("DATABASE_PATH") {
            self.store.path = PathBuf::from(path);
        }
        if let Some(bind) = lookup("HTTP_BIND") {
            self.http.bind = bind;
        }
        Ok(())
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.broker.connect_retries == 0 {
            return Err(ConfigError::Invalid(
                "broker.connect_retries must be at least 1".into(),
            ));
        }
        if self.store.pool_max == 0 {
            return Err(ConfigError::Invalid(
                "store.pool_max must be at least 1".into(),
            ));
        }
        if self.store.pool_min > self.store.pool_max {
            return Err(ConfigError::Invalid(format!(
                "store.pool_min ({}) exceeds store.pool_max ({})",
                self.store.pool_min, self.store.pool_max
            )));
        }
        if self.store.chunk_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "store.chunk_interval_secs must be positive".into(),
            ));
        }
        if self.ingest.lane_depth == 0 {
            return Err(ConfigError::Invalid(
                "ingest.lane_depth must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Load configuration from a YAML file.
pub fn load_config<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Read(format!("Failed to read {}: {}", path.display(), e)))?;

    serde_yaml::from_str(&contents)
        .map_err(|e| ConfigError::Parse(format!("Failed to parse {}: {}", path.display(), e)))
}

/// Load configuration from a file, or use default if file doesn't exist.
pub fn load_config_or_default<T: DeserializeOwned + Default>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();

    if !path.exists() {
        log::info!("Config file not found, using defaults: {}", path.display());
        return Ok(T::default());
    }

    load_config(path)
}

/// Parse configuration from a YAML string.
pub fn parse_config<T: DeserializeOwned>(yaml: &str) -> Result<T> {
    serde_yaml::from_str(yaml).map_err(|e| ConfigError::Parse(e.to_string()))
}
