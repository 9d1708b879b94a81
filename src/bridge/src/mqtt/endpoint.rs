use rand::distributions::Alphanumeric;
use rand::Rng;
use rumqttc::QoS;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use url::Url;

use super::ConnectorError;

pub const DEFAULT_KEEP_ALIVE_SECS: u64 = 300;
pub const DEFAULT_PING_TIMEOUT_SECS: u64 = 20;

/// Address and identity used to reach one broker.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerEndpoint {
    /// Host with scheme, e.g. `tcp://broker:1883` or `ssl://broker`.
    pub host: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub qos: u8,
    #[serde(default = "default_keep_alive")]
    pub keep_alive: u64,
    #[serde(default = "default_ping_timeout")]
    pub ping_timeout: u64,
}

fn default_keep_alive() -> u64 {
    DEFAULT_KEEP_ALIVE_SECS
}

fn default_ping_timeout() -> u64 {
    DEFAULT_PING_TIMEOUT_SECS
}

// Passwords stay out of logs.
impl fmt::Debug for BrokerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerEndpoint")
            .field("host", &self.host)
            .field("username", &self.username)
            .field("password", &if self.password.is_empty() { "" } else { "***" })
            .field("client_id", &self.client_id)
            .field("qos", &self.qos)
            .field("keep_alive", &self.keep_alive)
            .field("ping_timeout", &self.ping_timeout)
            .finish()
    }
}

/// Resolved socket target for an endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerTarget {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

impl BrokerEndpoint {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            username: String::new(),
            password: String::new(),
            client_id: String::new(),
            qos: 0,
            keep_alive: DEFAULT_KEEP_ALIVE_SECS,
            ping_timeout: DEFAULT_PING_TIMEOUT_SECS,
        }
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = client_id.into();
        self
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = username.into();
        self.password = password.into();
        self
    }

    pub fn with_qos(mut self, qos: u8) -> Self {
        self.qos = qos;
        self
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_secs(self.ping_timeout.max(1))
    }

    /// Credentials are only sent when both parts are present.
    pub fn credentials(&self) -> Option<(&str, &str)> {
        if self.username.is_empty() || self.password.is_empty() {
            None
        } else {
            Some((self.username.as_str(), self.password.as_str()))
        }
    }

    /// Client identity; brokers reject empty ids for persistent sessions so
    /// a random one is generated when none is configured.
    pub fn effective_client_id(&self) -> String {
        if self.client_id.is_empty() {
            let suffix: String = rand::thread_rng()
                .sample_iter(&Alphanumeric)
                .take(8)
                .map(char::from)
                .collect();
            format!("sensorthings-bridge-{suffix}")
        } else {
            self.client_id.clone()
        }
    }

    pub fn validate(&self) -> Result<(), ConnectorError> {
        self.target()?;
        map_qos(self.qos)?;
        Ok(())
    }

    pub fn target(&self) -> Result<BrokerTarget, ConnectorError> {
        let invalid = |reason: String| ConnectorError::InvalidEndpoint {
            endpoint: self.host.clone(),
            reason,
        };
        let url = Url::parse(&normalize_broker_url(&self.host)).map_err(|err| invalid(err.to_string()))?;
        let scheme = url.scheme();
        let host = url
            .host_str()
            .filter(|host| !host.is_empty())
            .ok_or_else(|| invalid("missing host".to_string()))?;
        let port = url
            .port()
            .or_else(|| default_port_for_scheme(scheme))
            .ok_or_else(|| invalid(format!("unsupported scheme `{scheme}`")))?;
        Ok(BrokerTarget {
            host: host.to_string(),
            port,
            tls: is_tls_scheme(scheme),
        })
    }
}

pub fn map_qos(qos: u8) -> Result<QoS, ConnectorError> {
    match qos {
        0 => Ok(QoS::AtMostOnce),
        1 => Ok(QoS::AtLeastOnce),
        2 => Ok(QoS::ExactlyOnce),
        other => Err(ConnectorError::Other(format!(
            "unsupported MQTT QoS level: {other}"
        ))),
    }
}

fn normalize_broker_url(url: &str) -> String {
    if url.contains("://") {
        url.to_owned()
    } else {
        format!("tcp://{url}")
    }
}

fn default_port_for_scheme(scheme: &str) -> Option<u16> {
    match scheme {
        "mqtt" | "tcp" => Some(1883),
        "mqtts" | "ssl" | "tcps" => Some(8883),
        _ => None,
    }
}

fn is_tls_scheme(scheme: &str) -> bool {
    matches!(scheme, "mqtts" | "ssl" | "tcps")
}
