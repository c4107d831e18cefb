//! Configuration for the gateway and ingestion services
//!
//! Loads a YAML file, then applies environment overrides for the deploy-time
//! knobs (broker URL, database credentials, ports). Missing required values
//! are fatal at startup; nothing here fails mid-run.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;
use std::time::Duration;

/// Minimum accepted device poll interval
pub const MIN_POLL_INTERVAL_MS: u64 = 100;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub modbus: ProtocolPoolConfig,
    pub opcua: OpcuaConfig,
    pub s7: ProtocolPoolConfig,
    pub polling: PollingConfig,
    pub commands: CommandConfig,
    pub mqtt: MqttConfig,
    pub ingestion: IngestionConfig,
    pub tsdb: TsdbConfig,
    pub registry: RegistryConfig,
    pub http: HttpConfig,
    pub logging: LoggingConfig,
}

/// Connection pool knobs shared by every protocol
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolPoolConfig {
    pub max_connections: usize,
    /// Seconds an unused connection survives before the reaper closes it
    #[serde(rename = "idle_timeout")]
    pub idle_timeout_secs: u64,
    /// Seconds between health-check pings of idle connections
    #[serde(rename = "health_check_period")]
    pub health_check_period_secs: u64,
    /// Seconds to wait for connect and for a lease when the pool is full
    #[serde(rename = "connection_timeout")]
    pub connection_timeout_secs: u64,
    pub retry_attempts: u32,
    /// Milliseconds of initial retry backoff
    #[serde(rename = "retry_delay")]
    pub retry_delay_ms: u64,
}

impl Default for ProtocolPoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 100,
            idle_timeout_secs: 300,
            health_check_period_secs: 30,
            connection_timeout_secs: 10,
            retry_attempts: 3,
            retry_delay_ms: 1000,
        }
    }
}

impl ProtocolPoolConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
    pub fn health_check_period(&self) -> Duration {
        Duration::from_secs(self.health_check_period_secs)
    }
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OpcuaConfig {
    #[serde(flatten)]
    pub pool: ProtocolPoolConfig,
    /// Subscription publishing interval requested from the server
    #[serde(rename = "publish_interval")]
    pub publish_interval_ms: u64,
    #[serde(rename = "sampling_interval")]
    pub sampling_interval_ms: u64,
    /// Global switch; the per-device flag additionally opts a device in
    pub enable_subscriptions: bool,
}

impl Default for OpcuaConfig {
    fn default() -> Self {
        Self {
            pool: ProtocolPoolConfig {
                connection_timeout_secs: 15,
                ..ProtocolPoolConfig::default()
            },
            publish_interval_ms: 500,
            sampling_interval_ms: 250,
            enable_subscriptions: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    pub worker_count: usize,
    /// Maximum tags grouped into one adapter read
    pub batch_size: usize,
    /// Poll interval for devices that do not set one, milliseconds
    #[serde(rename = "default_interval")]
    pub default_interval_ms: u64,
    #[serde(rename = "shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            worker_count: 10,
            batch_size: 100,
            default_interval_ms: 1000,
            shutdown_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandConfig {
    pub max_concurrent_writes: usize,
    #[serde(rename = "write_timeout")]
    pub write_timeout_secs: u64,
    pub enable_acknowledgement: bool,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            max_concurrent_writes: 50,
            write_timeout_secs: 10,
            enable_acknowledgement: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub broker_url: String,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub default_qos: u8,
    pub command_qos: u8,
    pub clean_session: bool,
    #[serde(rename = "keepalive")]
    pub keepalive_secs: u64,
    /// Cap for the exponential reconnect backoff, seconds
    #[serde(rename = "reconnect_delay")]
    pub reconnect_delay_secs: u64,
    pub buffer: BufferConfig,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            broker_url: "mqtt://localhost:1883".to_string(),
            client_id: "nexus-gateway".to_string(),
            username: None,
            password: None,
            default_qos: 1,
            command_qos: 2,
            clean_session: false,
            keepalive_secs: 30,
            reconnect_delay_secs: 30,
            buffer: BufferConfig::default(),
        }
    }
}

/// Local store-and-forward buffer used while the broker is unreachable
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Maximum points held in the in-memory ring
    pub memory_limit: usize,
    pub disk_enabled: bool,
    pub disk_path: String,
    /// Maximum points spilled to disk
    pub disk_limit: usize,
    /// Seconds after which a buffered point is considered stale and dropped
    #[serde(rename = "message_ttl")]
    pub message_ttl_secs: u64,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            memory_limit: 10_000,
            disk_enabled: false,
            disk_path: "/var/lib/nexus/buffer".to_string(),
            disk_limit: 100_000,
            message_ttl_secs: 3600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestionConfig {
    pub batch_size: usize,
    #[serde(rename = "flush_interval")]
    pub flush_interval_ms: u64,
    pub writer_count: usize,
    pub channel_capacity: usize,
    /// Telemetry topic filter consumed via the shared subscription
    pub topic_pattern: String,
    pub shared_group: String,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            batch_size: 5000,
            flush_interval_ms: 100,
            writer_count: 4,
            channel_capacity: 50_000,
            topic_pattern: "#".to_string(),
            shared_group: "ingestion".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TsdbConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: String,
    pub pool_size: u32,
    #[serde(rename = "max_idle_time")]
    pub max_idle_time_secs: u64,
    pub use_copy_protocol: bool,
    pub max_retries: u32,
    #[serde(rename = "retry_delay")]
    pub retry_delay_ms: u64,
}

impl Default for TsdbConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            database: "nexus".to_string(),
            user: "nexus".to_string(),
            password: String::new(),
            pool_size: 10,
            max_idle_time_secs: 300,
            use_copy_protocol: true,
            max_retries: 3,
            retry_delay_ms: 100,
        }
    }
}

impl TsdbConfig {
    pub fn url(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}",
            self.user, self.password, self.host, self.port, self.database
        )
    }
}

/// Where devices and tags come from
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// `file` (YAML bootstrap) or `database` (devices/tags tables)
    pub source: RegistrySource,
    pub file: Option<String>,
    /// Connection string for the config tables; falls back to the tsdb
    /// settings when unset
    pub database_url: Option<String>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            source: RegistrySource::File,
            file: None,
            database_url: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistrySource {
    File,
    Database,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub app_port: u16,
    pub metrics_port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            app_port: 8080,
            metrics_port: 8081,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// trace / debug / info / warn / error
    pub level: String,
    /// json / console
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "json".to_string(),
        }
    }
}

impl Config {
    /// Load from a YAML file, then apply environment overrides
    pub fn load(path: &Path) -> Result<Self> {
        dotenv::dotenv().ok();

        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let mut config: Config =
            serde_yaml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Environment-only configuration for containerized deploys without a
    /// mounted file
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let mut config = Config::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = env::var("NEXUS_MQTT_BROKER_URL") {
            self.mqtt.broker_url = v;
        }
        if let Ok(v) = env::var("NEXUS_MQTT_CLIENT_ID") {
            self.mqtt.client_id = v;
        }
        if let Ok(v) = env::var("NEXUS_MQTT_USERNAME") {
            self.mqtt.username = Some(v);
        }
        if let Ok(v) = env::var("NEXUS_MQTT_PASSWORD") {
            self.mqtt.password = Some(v);
        }
        if let Ok(v) = env::var("NEXUS_TSDB_HOST") {
            self.tsdb.host = v;
        }
        if let Ok(v) = env::var("NEXUS_TSDB_PORT").map(|v| v.parse()) {
            if let Ok(port) = v {
                self.tsdb.port = port;
            }
        }
        if let Ok(v) = env::var("NEXUS_TSDB_DATABASE") {
            self.tsdb.database = v;
        }
        if let Ok(v) = env::var("NEXUS_TSDB_USER") {
            self.tsdb.user = v;
        }
        if let Ok(v) = env::var("NEXUS_TSDB_PASSWORD") {
            self.tsdb.password = v;
        }
        if let Ok(v) = env::var("NEXUS_REGISTRY_FILE") {
            self.registry.source = RegistrySource::File;
            self.registry.file = Some(v);
        }
        if let Ok(v) = env::var("NEXUS_REGISTRY_DATABASE_URL") {
            self.registry.source = RegistrySource::Database;
            self.registry.database_url = Some(v);
        }
        if let Ok(v) = env::var("NEXUS_APP_PORT").map(|v| v.parse()) {
            if let Ok(port) = v {
                self.http.app_port = port;
            }
        }
        if let Ok(v) = env::var("NEXUS_METRICS_PORT").map(|v| v.parse()) {
            if let Ok(port) = v {
                self.http.metrics_port = port;
            }
        }
        if let Ok(v) = env::var("NEXUS_LOG_LEVEL") {
            self.logging.level = v;
        }
        if let Ok(v) = env::var("NEXUS_LOG_FORMAT") {
            self.logging.format = v;
        }
    }

    fn validate(&self) -> Result<()> {
        if self.polling.default_interval_ms < MIN_POLL_INTERVAL_MS {
            bail!(
                "polling.default_interval {} ms is below the {} ms minimum",
                self.polling.default_interval_ms,
                MIN_POLL_INTERVAL_MS
            );
        }
        if self.polling.worker_count == 0 {
            bail!("polling.worker_count must be at least 1");
        }
        if self.commands.max_concurrent_writes == 0 {
            bail!("commands.max_concurrent_writes must be at least 1");
        }
        if self.ingestion.batch_size == 0 {
            bail!("ingestion.batch_size must be at least 1");
        }
        if self.ingestion.writer_count == 0 {
            bail!("ingestion.writer_count must be at least 1");
        }
        if !matches!(self.mqtt.default_qos, 0..=2) || !matches!(self.mqtt.command_qos, 0..=2) {
            bail!("mqtt qos values must be 0, 1 or 2");
        }
        match self.logging.level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            other => bail!("unknown logging.level {:?}", other),
        }
        match self.logging.format.as_str() {
            "json" | "console" => {}
            other => bail!("unknown logging.format {:?}", other),
        }
        Ok(())
    }

    /// Connection string for the config tables
    pub fn registry_database_url(&self) -> String {
        self.registry
            .database_url
            .clone()
            .unwrap_or_else(|| self.tsdb.url())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_built_in_defaults() {
        let c = Config::default();
        assert_eq!(c.modbus.max_connections, 100);
        assert_eq!(c.modbus.idle_timeout_secs, 300);
        assert_eq!(c.modbus.health_check_period_secs, 30);
        assert_eq!(c.polling.worker_count, 10);
        assert_eq!(c.polling.shutdown_timeout_secs, 30);
        assert_eq!(c.commands.max_concurrent_writes, 50);
        assert_eq!(c.commands.write_timeout_secs, 10);
        assert_eq!(c.ingestion.batch_size, 5000);
        assert_eq!(c.ingestion.flush_interval_ms, 100);
        assert_eq!(c.ingestion.writer_count, 4);
        assert_eq!(c.ingestion.channel_capacity, 50_000);
        assert_eq!(c.tsdb.pool_size, 10);
        assert_eq!(c.tsdb.max_retries, 3);
        assert!(c.tsdb.use_copy_protocol);
        assert_eq!(c.mqtt.default_qos, 1);
        assert_eq!(c.mqtt.command_qos, 2);
        assert!(!c.mqtt.clean_session);
    }

    #[test]
    fn test_yaml_round_trip() {
        let yaml = r#"
polling:
  worker_count: 4
  default_interval: 500
mqtt:
  broker_url: "mqtt://broker:1883"
  client_id: "gw-test"
ingestion:
  batch_size: 1000
  flush_interval: 250
registry:
  source: file
  file: "devices.yaml"
"#;
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(yaml.as_bytes()).unwrap();
        let config = Config::load(f.path()).unwrap();
        assert_eq!(config.polling.worker_count, 4);
        assert_eq!(config.polling.default_interval_ms, 500);
        assert_eq!(config.mqtt.broker_url, "mqtt://broker:1883");
        assert_eq!(config.ingestion.batch_size, 1000);
        assert_eq!(config.ingestion.flush_interval_ms, 250);
        // untouched sections keep defaults
        assert_eq!(config.commands.max_concurrent_writes, 50);
    }

    #[test]
    fn test_sub_100ms_interval_rejected() {
        let yaml = r#"
polling:
  default_interval: 50
registry:
  source: file
  file: "devices.yaml"
"#;
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(yaml.as_bytes()).unwrap();
        assert!(Config::load(f.path()).is_err());
    }

    #[test]
    fn test_tsdb_url() {
        let mut c = TsdbConfig::default();
        c.host = "db".to_string();
        c.password = "s3cret".to_string();
        assert_eq!(c.url(), "postgres://nexus:s3cret@db:5432/nexus");
    }
}
