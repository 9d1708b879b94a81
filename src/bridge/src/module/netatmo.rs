use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::poll::{fetch_interval, spawn_poll, unix_to_rfc3339};
use super::{Module, ModuleBase, ModuleError};
use crate::delivery::DeliveryHandle;
use crate::observation::{Message, Observation};

const NAME: &str = "Netatmo";
const DEFAULT_FETCH_INTERVAL_SECS: u64 = 10;
const TOKEN_URL: &str = "https://api.netatmo.com/oauth2/token";
const STATIONS_URL: &str = "https://api.netatmo.com/api/getstationsdata";
const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetatmoMapping {
    pub module_id: String,
    /// Dashboard field, e.g. `Temperature` or `Humidity`.
    pub data_type: String,
    pub publish_topic: String,
}

#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NetatmoSettings {
    pub client_id: String,
    pub client_secret: String,
    pub username: String,
    pub password: String,
    pub fetch_interval_seconds: u64,
    pub mappings: Vec<NetatmoMapping>,
}

impl std::fmt::Debug for NetatmoSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetatmoSettings")
            .field("client_id", &self.client_id)
            .field("username", &self.username)
            .field("fetch_interval_seconds", &self.fetch_interval_seconds)
            .field("mappings", &self.mappings)
            .finish_non_exhaustive()
    }
}

impl NetatmoSettings {
    pub fn is_complete(&self) -> bool {
        ![&self.client_id, &self.client_secret, &self.username, &self.password]
            .iter()
            .any(|value| value.is_empty())
    }
}

/// Publishes Netatmo weather station readings.
pub struct NetatmoModule {
    base: ModuleBase,
    settings: NetatmoSettings,
    poller: Option<JoinHandle<()>>,
}

impl Default for NetatmoModule {
    fn default() -> Self {
        Self::new()
    }
}

impl NetatmoModule {
    pub fn new() -> Self {
        Self {
            base: ModuleBase::default(),
            settings: NetatmoSettings::default(),
            poller: None,
        }
    }

    pub fn settings(&self) -> &NetatmoSettings {
        &self.settings
    }

    pub fn interval(&self) -> Duration {
        fetch_interval(self.settings.fetch_interval_seconds, DEFAULT_FETCH_INTERVAL_SECS)
    }

    pub fn is_polling(&self) -> bool {
        self.poller.as_ref().is_some_and(|task| !task.is_finished())
    }
}

#[async_trait]
impl Module for NetatmoModule {
    fn base(&self) -> &ModuleBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut ModuleBase {
        &mut self.base
    }

    fn setup(&mut self) {
        self.base
            .describe(NAME, "Publish Netatmo readings to a SensorThings server");
    }

    fn settings_changed(&mut self, settings: &Value) -> Result<(), ModuleError> {
        self.settings = serde_json::from_value(settings.clone())
            .map_err(|err| ModuleError::invalid_settings(NAME, err))?;
        Ok(())
    }

    async fn start(&mut self) -> Result<(), ModuleError> {
        if self.is_polling() {
            return Ok(());
        }
        if !self.settings.is_complete() {
            tracing::warn!("incomplete settings for Netatmo module, not starting");
            return Ok(());
        }
        let delivery = self.base.delivery()?;
        let client = Arc::new(NetatmoClient::new(self.settings.clone()));
        let mappings = Arc::new(self.settings.mappings.clone());
        tracing::info!(interval_secs = self.interval().as_secs(), "starting Netatmo polling");
        self.poller = Some(spawn_poll(self.interval(), true, move || {
            fetch_and_deliver(Arc::clone(&client), Arc::clone(&mappings), delivery.clone())
        }));
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), ModuleError> {
        if let Some(task) = self.poller.take() {
            task.abort();
        }
        Ok(())
    }
}

async fn fetch_and_deliver(
    client: Arc<NetatmoClient>,
    mappings: Arc<Vec<NetatmoMapping>>,
    delivery: DeliveryHandle,
) {
    let stations = match client.station_data().await {
        Ok(stations) => stations,
        Err(err) => {
            tracing::warn!(error = %err, "Netatmo fetch failed");
            return;
        }
    };
    for message in readings_to_messages(&mappings, &stations) {
        if let Err(err) = delivery.deliver(message).await {
            tracing::warn!(error = %err, "failed to hand Netatmo reading to publisher");
            return;
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: u64,
}

struct CachedToken {
    access_token: String,
    expires_at: Instant,
}

/// Weather station API client with a cached password-grant token.
struct NetatmoClient {
    http: reqwest::Client,
    settings: NetatmoSettings,
    token: tokio::sync::Mutex<Option<CachedToken>>,
}

impl NetatmoClient {
    fn new(settings: NetatmoSettings) -> Self {
        Self {
            http: reqwest::Client::new(),
            settings,
            token: tokio::sync::Mutex::new(None),
        }
    }

    async fn access_token(&self) -> Result<String, reqwest::Error> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if Instant::now() < token.expires_at {
                return Ok(token.access_token.clone());
            }
        }
        let response: TokenResponse = self
            .http
            .post(TOKEN_URL)
            .form(&[
                ("grant_type", "password"),
                ("client_id", self.settings.client_id.as_str()),
                ("client_secret", self.settings.client_secret.as_str()),
                ("username", self.settings.username.as_str()),
                ("password", self.settings.password.as_str()),
                ("scope", "read_station"),
            ])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let lifetime = Duration::from_secs(response.expires_in).saturating_sub(TOKEN_EXPIRY_MARGIN);
        *cached = Some(CachedToken {
            access_token: response.access_token.clone(),
            expires_at: Instant::now() + lifetime,
        });
        Ok(response.access_token)
    }

    async fn station_data(&self) -> Result<StationData, reqwest::Error> {
        let token = self.access_token().await?;
        let response = self
            .http
            .get(STATIONS_URL)
            .bearer_auth(&token)
            .send()
            .await?
            .error_for_status();
        if let Err(err) = &response {
            if err.status() == Some(reqwest::StatusCode::FORBIDDEN) {
                // Token revoked server side; fetch a new one next tick.
                self.token.lock().await.take();
            }
        }
        response?.json().await
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StationData {
    #[serde(default)]
    pub body: StationBody,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StationBody {
    #[serde(default)]
    pub devices: Vec<StationDevice>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StationDevice {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(default)]
    pub dashboard_data: Option<Map<String, Value>>,
    #[serde(default)]
    pub modules: Vec<StationModule>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StationModule {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(default)]
    pub dashboard_data: Option<Map<String, Value>>,
}

/// One observation per mapping matching a station or module reading.
pub fn readings_to_messages(mappings: &[NetatmoMapping], stations: &StationData) -> Vec<Message> {
    let sources = stations.body.devices.iter().flat_map(|device| {
        std::iter::once((&device.id, &device.dashboard_data)).chain(
            device
                .modules
                .iter()
                .map(|module| (&module.id, &module.dashboard_data)),
        )
    });

    let mut messages = Vec::new();
    for (id, dashboard) in sources {
        let Some(dashboard) = dashboard else {
            continue;
        };
        let phenomenon_time = dashboard
            .get("time_utc")
            .and_then(Value::as_i64)
            .and_then(unix_to_rfc3339);
        for mapping in mappings.iter().filter(|mapping| &mapping.module_id == id) {
            if mapping.data_type == "time_utc" {
                continue;
            }
            if let Some(value) = dashboard.get(&mapping.data_type) {
                messages.push(Message::new(
                    mapping.publish_topic.clone(),
                    Observation {
                        result: Some(value.clone()),
                        phenomenon_time: phenomenon_time.clone(),
                        ..Observation::default()
                    },
                ));
            }
        }
    }
    messages
}
