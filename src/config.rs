use bridge::{BrokerEndpoint, ConnectionTuning};
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::server::ServerOptions;

pub const DEFAULT_PUBLISH_HOST: &str = "tcp://127.0.0.1:1883";
pub const DEFAULT_PUBLISH_CLIENT_ID: &str = "sensorthings-connector";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub logging: LoggingConfig,
    pub server: ServerConfig,
    pub publish: PublishConfig,
    pub bridge: BridgeConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub output: LoggingOutput,
    pub level: LogLevel,
    pub include_source: bool,
    pub file: FileLoggingConfig,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            output: LoggingOutput::Stdout,
            level: LogLevel::Info,
            include_source: true,
            file: FileLoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoggingOutput {
    Stdout,
    File,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FileLoggingConfig {
    pub dir: String,
    pub file_name: String,
    /// Daily files kept before the oldest is removed.
    pub max_files: usize,
}

impl Default for FileLoggingConfig {
    fn default() -> Self {
        Self {
            dir: "./logs".to_string(),
            file_name: "bridge.log".to_string(),
            max_files: 7,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub manager_addr: Option<String>,
    pub data_dir: Option<String>,
}

/// Outbound SensorThings broker.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct PublishConfig {
    pub host: String,
    pub username: String,
    pub password: String,
    pub client_id: String,
    pub qos: u8,
    pub keep_alive_secs: u64,
    pub ping_timeout_secs: u64,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_PUBLISH_HOST.to_string(),
            username: String::new(),
            password: String::new(),
            client_id: DEFAULT_PUBLISH_CLIENT_ID.to_string(),
            qos: 0,
            keep_alive_secs: bridge::mqtt::endpoint::DEFAULT_KEEP_ALIVE_SECS,
            ping_timeout_secs: bridge::mqtt::endpoint::DEFAULT_PING_TIMEOUT_SECS,
        }
    }
}

impl std::fmt::Debug for PublishConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("PublishConfig").field(&self.to_endpoint()).finish()
    }
}

impl PublishConfig {
    pub fn to_endpoint(&self) -> BrokerEndpoint {
        let mut endpoint = BrokerEndpoint::new(self.host.clone())
            .with_client_id(self.client_id.clone())
            .with_credentials(self.username.clone(), self.password.clone())
            .with_qos(self.qos);
        endpoint.keep_alive = self.keep_alive_secs;
        endpoint.ping_timeout = self.ping_timeout_secs;
        endpoint
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub retry_interval_secs: u64,
    pub disconnect_grace_ms: u64,
    pub delivery_capacity: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            retry_interval_secs: 10,
            disconnect_grace_ms: 500,
            delivery_capacity: bridge::DEFAULT_DELIVERY_CAPACITY,
        }
    }
}

impl BridgeConfig {
    pub fn tuning(&self) -> ConnectionTuning {
        ConnectionTuning {
            retry_interval: Duration::from_secs(self.retry_interval_secs.max(1)),
            disconnect_grace: Duration::from_millis(self.disconnect_grace_ms),
        }
    }
}

impl AppConfig {
    pub fn load_required(
        path: impl AsRef<Path>,
    ) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .map_err(|err| format!("failed to read config file {}: {}", path.display(), err))?;
        let cfg: AppConfig = serde_yaml::from_str(&raw)
            .map_err(|err| format!("failed to parse yaml config {}: {}", path.display(), err))?;
        Ok(cfg)
    }

    pub fn load_optional(
        path: impl AsRef<Path>,
    ) -> Result<Option<Self>, Box<dyn std::error::Error + Send + Sync>> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(Self::load_required(path)?))
    }

    pub fn to_server_options(&self) -> ServerOptions {
        ServerOptions {
            manager_addr: self.server.manager_addr.clone(),
            data_dir: self.server.data_dir.clone(),
            publish: self.publish.to_endpoint(),
            tuning: self.bridge.tuning(),
            delivery_capacity: self.bridge.delivery_capacity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn loads_optional_missing_file() {
        let dir = tempdir().unwrap();
        let loaded = AppConfig::load_optional(dir.path().join("missing.yaml")).unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn defaults_cover_every_section() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.logging.output, LoggingOutput::Stdout);
        assert_eq!(cfg.logging.level, LogLevel::Info);
        assert!(cfg.logging.include_source);
        assert!(cfg.server.manager_addr.is_none());

        let opts = cfg.to_server_options();
        assert_eq!(opts.publish.host, DEFAULT_PUBLISH_HOST);
        assert_eq!(opts.publish.client_id, DEFAULT_PUBLISH_CLIENT_ID);
        assert_eq!(opts.publish.keep_alive, 300);
        assert_eq!(opts.tuning, ConnectionTuning::default());
        assert_eq!(opts.delivery_capacity, 1);
    }

    #[test]
    fn applies_only_present_fields() {
        let yaml = r#"
server:
  manager_addr: "127.0.0.1:9999"
publish:
  host: "ssl://st.example.org"
  username: "bridge"
  password: "secret"
  qos: 1
bridge:
  retry_interval_secs: 3
"#;
        let dir = tempdir().unwrap();
        let path = dir.path().join("apply.yaml");
        std::fs::write(&path, yaml).unwrap();

        let opts = AppConfig::load_required(&path).unwrap().to_server_options();
        assert_eq!(opts.manager_addr.as_deref(), Some("127.0.0.1:9999"));
        assert!(opts.data_dir.is_none());
        assert_eq!(opts.publish.host, "ssl://st.example.org");
        assert_eq!(opts.publish.credentials(), Some(("bridge", "secret")));
        assert_eq!(opts.publish.qos, 1);
        assert_eq!(opts.publish.ping_timeout, 20);
        assert_eq!(opts.tuning.retry_interval, Duration::from_secs(3));
        assert_eq!(opts.tuning.disconnect_grace, Duration::from_millis(500));
    }

    #[test]
    fn loads_logging_config() {
        let yaml = r#"
logging:
  output: file
  level: warn
  include_source: false
  file:
    dir: "./tmp/logs"
    file_name: "connector.log"
    max_files: 3
"#;
        let dir = tempdir().unwrap();
        let path = dir.path().join("logging.yaml");
        std::fs::write(&path, yaml).unwrap();

        let cfg = AppConfig::load_required(&path).unwrap();
        assert_eq!(cfg.logging.output, LoggingOutput::File);
        assert_eq!(cfg.logging.level, LogLevel::Warn);
        assert!(!cfg.logging.include_source);
        assert_eq!(cfg.logging.file.dir, "./tmp/logs");
        assert_eq!(cfg.logging.file.file_name, "connector.log");
        assert_eq!(cfg.logging.file.max_files, 3);
    }

    #[test]
    fn malformed_yaml_names_the_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("broken.yaml");
        std::fs::write(&path, "publish: [").unwrap();
        let err = AppConfig::load_required(&path).unwrap_err();
        assert!(err.to_string().contains("broken.yaml"));
    }

    #[test]
    fn publish_debug_hides_password() {
        let cfg = PublishConfig {
            password: "hunter2".to_string(),
            ..Default::default()
        };
        assert!(!format!("{cfg:?}").contains("hunter2"));
    }
}
