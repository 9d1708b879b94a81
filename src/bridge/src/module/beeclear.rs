use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::task::JoinHandle;

use super::poll::{fetch_interval, spawn_poll, unix_to_rfc3339};
use super::{Module, ModuleBase, ModuleError};
use crate::delivery::DeliveryHandle;
use crate::observation::{Message, Observation};

const NAME: &str = "BeeClear";
const DEFAULT_FETCH_INTERVAL_SECS: u64 = 600;
const USAGE_WINDOW_HOURS: i64 = 168;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BeeClearMapping {
    /// Reading key, e.g. `u` for current usage.
    pub data_type: String,
    pub publish_topic: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BeeClearSettings {
    pub bc_host: String,
    #[serde(default)]
    pub fetch_interval_seconds: u64,
    #[serde(default)]
    pub mappings: Vec<BeeClearMapping>,
}

/// Publishes BeeClear energy meter readings.
pub struct BeeClearModule {
    base: ModuleBase,
    settings: BeeClearSettings,
    client: reqwest::Client,
    poller: Option<JoinHandle<()>>,
}

impl Default for BeeClearModule {
    fn default() -> Self {
        Self::new()
    }
}

impl BeeClearModule {
    pub fn new() -> Self {
        Self {
            base: ModuleBase::default(),
            settings: BeeClearSettings::default(),
            client: reqwest::Client::new(),
            poller: None,
        }
    }

    pub fn settings(&self) -> &BeeClearSettings {
        &self.settings
    }

    pub fn interval(&self) -> Duration {
        fetch_interval(self.settings.fetch_interval_seconds, DEFAULT_FETCH_INTERVAL_SECS)
    }
}

#[async_trait]
impl Module for BeeClearModule {
    fn base(&self) -> &ModuleBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut ModuleBase {
        &mut self.base
    }

    fn setup(&mut self) {
        self.base
            .describe(NAME, "Publish BeeClear readings to a SensorThings server");
    }

    fn settings_changed(&mut self, settings: &Value) -> Result<(), ModuleError> {
        let mut parsed: BeeClearSettings = serde_json::from_value(settings.clone())
            .map_err(|err| ModuleError::invalid_settings(NAME, err))?;
        parsed.bc_host = parsed.bc_host.trim_end_matches('/').to_string();
        self.settings = parsed;
        Ok(())
    }

    async fn start(&mut self) -> Result<(), ModuleError> {
        if self.poller.as_ref().is_some_and(|task| !task.is_finished()) {
            return Ok(());
        }
        let delivery = self.base.delivery()?;
        let settings = self.settings.clone();
        let client = self.client.clone();
        tracing::info!(host = %settings.bc_host, interval_secs = self.interval().as_secs(), "starting BeeClear polling");
        self.poller = Some(spawn_poll(self.interval(), false, move || {
            fetch_and_deliver(client.clone(), settings.clone(), delivery.clone())
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

async fn fetch_and_deliver(client: reqwest::Client, settings: BeeClearSettings, delivery: DeliveryHandle) {
    let readings = match fetch_usage(&client, &settings.bc_host).await {
        Ok(readings) => readings,
        Err(err) => {
            tracing::warn!(host = %settings.bc_host, error = %err, "BeeClear fetch failed");
            return;
        }
    };
    for message in readings_to_messages(&settings.mappings, &readings) {
        if let Err(err) = delivery.deliver(message).await {
            tracing::warn!(error = %err, "failed to hand BeeClear reading to publisher");
            return;
        }
    }
}

pub fn usage_url(host: &str, now_unix: i64) -> String {
    let since = now_unix - USAGE_WINDOW_HOURS * 3600;
    format!("{host}/bc_usage?date={since}&duration={USAGE_WINDOW_HOURS}&period=24")
}

async fn fetch_usage(client: &reqwest::Client, host: &str) -> Result<BTreeMap<String, Value>, reqwest::Error> {
    let now = time::OffsetDateTime::now_utc().unix_timestamp();
    client
        .get(usage_url(host, now))
        .send()
        .await?
        .error_for_status()?
        .json()
        .await
}

/// One observation per mapping whose data type appears in the readings.
pub fn readings_to_messages(mappings: &[BeeClearMapping], readings: &BTreeMap<String, Value>) -> Vec<Message> {
    let phenomenon_time = readings
        .get("d")
        .and_then(Value::as_i64)
        .and_then(unix_to_rfc3339);
    mappings
        .iter()
        .filter_map(|mapping| {
            let value = readings.get(&mapping.data_type)?;
            let observation = Observation {
                result: Some(value.clone()),
                phenomenon_time: phenomenon_time.clone(),
                ..Observation::default()
            };
            Some(Message::new(mapping.publish_topic.clone(), observation))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn settings_trim_host_and_default_interval() {
        let mut module = BeeClearModule::new();
        module
            .settings_changed(&json!({"bcHost": "http://beeclear.local/", "mappings": []}))
            .unwrap();
        assert_eq!(module.settings().bc_host, "http://beeclear.local");
        assert_eq!(module.interval(), Duration::from_secs(600));
    }

    #[test]
    fn missing_host_is_invalid() {
        let mut module = BeeClearModule::new();
        assert!(matches!(
            module.settings_changed(&json!({"mappings": []})),
            Err(ModuleError::InvalidSettings { .. })
        ));
    }

    #[test]
    fn usage_url_covers_last_week() {
        assert_eq!(
            usage_url("http://bc", 1_000_000),
            "http://bc/bc_usage?date=395200&duration=168&period=24"
        );
    }

    #[test]
    fn readings_map_to_observations() {
        let mappings = vec![
            BeeClearMapping { data_type: "u".into(), publish_topic: "out/usage".into() },
            BeeClearMapping { data_type: "g".into(), publish_topic: "out/gas".into() },
        ];
        let readings: BTreeMap<String, Value> =
            serde_json::from_value(json!({"d": 1_700_000_000, "u": 412})).unwrap();
        let messages = readings_to_messages(&mappings, &readings);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].topic, "out/usage");
        assert_eq!(messages[0].observation.result, Some(json!(412)));
        assert_eq!(
            messages[0].observation.phenomenon_time.as_deref(),
            Some("2023-11-14T22:13:20Z")
        );
    }

    #[tokio::test]
    async fn start_requires_delivery_handle() {
        let mut module = BeeClearModule::new();
        module.settings_changed(&json!({"bcHost": "http://bc"})).unwrap();
        assert!(matches!(module.start().await, Err(ModuleError::MissingDelivery(_))));
        module.stop().await.unwrap();
    }
}
