use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{BridgeContext, Module, ModuleBase, ModuleError};
use crate::mqtt::endpoint::BrokerEndpoint;
use crate::subscribe::{StreamMapping, SubscribeBridge};

const NAME: &str = "MQTT";

/// One upstream broker and the streams read from it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubBroker {
    #[serde(flatten)]
    pub endpoint: BrokerEndpoint,
    #[serde(default)]
    pub streams: Vec<StreamMapping>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MqttModuleSettings {
    #[serde(default)]
    pub sub_brokers: Vec<SubBroker>,
}

/// Bridges structured MQTT streams into SensorThings observations, one
/// [`SubscribeBridge`] per configured upstream broker.
pub struct MqttModule {
    base: ModuleBase,
    context: BridgeContext,
    settings: MqttModuleSettings,
    bridges: Vec<SubscribeBridge>,
    running: bool,
}

impl MqttModule {
    pub fn new(context: BridgeContext) -> Self {
        Self {
            base: ModuleBase::default(),
            context,
            settings: MqttModuleSettings::default(),
            bridges: Vec::new(),
            running: false,
        }
    }

    pub fn settings(&self) -> &MqttModuleSettings {
        &self.settings
    }

    pub fn is_running(&self) -> bool {
        self.running
    }
}

#[async_trait]
impl Module for MqttModule {
    fn base(&self) -> &ModuleBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut ModuleBase {
        &mut self.base
    }

    fn setup(&mut self) {
        self.base.describe(
            NAME,
            "Map a structured non MQTT stream to a SensorThings observation stream",
        );
    }

    fn settings_changed(&mut self, settings: &Value) -> Result<(), ModuleError> {
        let parsed: MqttModuleSettings = serde_json::from_value(settings.clone())
            .map_err(|err| ModuleError::invalid_settings(NAME, err))?;
        for broker in &parsed.sub_brokers {
            broker
                .endpoint
                .validate()
                .map_err(|err| ModuleError::invalid_settings(NAME, err))?;
        }
        self.settings = parsed;
        Ok(())
    }

    async fn start(&mut self) -> Result<(), ModuleError> {
        if self.is_running() {
            return Ok(());
        }
        let delivery = self.base.delivery()?;
        for broker in &self.settings.sub_brokers {
            let bridge = SubscribeBridge::new(
                broker.endpoint.clone(),
                broker.streams.clone(),
                self.context.transport.clone(),
                self.context.tuning,
                delivery.clone(),
            );
            bridge.start();
            self.bridges.push(bridge);
        }
        self.running = true;
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), ModuleError> {
        for bridge in self.bridges.drain(..) {
            bridge.stop().await;
        }
        self.running = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::DeliveryBus;
    use crate::mqtt::connection::ConnectionTuning;
    use crate::mqtt::mock::MockNetwork;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    fn settings() -> Value {
        json!({"subBrokers": [
            {"host": "tcp://a", "clientId": "a", "qos": 0, "streams": [
                {"topicIn": "a/in", "topicOut": "a/out", "mapping": {"v": {"name": "result"}}}
            ]},
            {"host": "tcp://b", "username": "u", "password": "p", "streams": []}
        ]})
    }

    #[test]
    fn settings_parse_with_endpoint_defaults() {
        let network = MockNetwork::new();
        let mut module = MqttModule::new(BridgeContext::new(Arc::new(network), ConnectionTuning::default()));
        module.settings_changed(&settings()).unwrap();
        let brokers = &module.settings().sub_brokers;
        assert_eq!(brokers.len(), 2);
        assert_eq!(brokers[0].endpoint.keep_alive, 300);
        assert_eq!(brokers[0].endpoint.ping_timeout, 20);
        assert_eq!(brokers[1].endpoint.credentials(), Some(("u", "p")));
    }

    #[test]
    fn invalid_settings_are_rejected() {
        let network = MockNetwork::new();
        let mut module = MqttModule::new(BridgeContext::new(Arc::new(network), ConnectionTuning::default()));
        let err = module.settings_changed(&json!({"subBrokers": "nope"})).unwrap_err();
        assert!(matches!(err, ModuleError::InvalidSettings { .. }));
        let err = module
            .settings_changed(&json!({"subBrokers": [{"host": "http://x", "qos": 0}]}))
            .unwrap_err();
        assert!(matches!(err, ModuleError::InvalidSettings { .. }));
    }

    #[tokio::test]
    async fn start_and_stop_are_idempotent() {
        let network = MockNetwork::new();
        let bus = DeliveryBus::default();
        let mut module = MqttModule::new(BridgeContext::new(
            Arc::new(network.clone()),
            ConnectionTuning::default(),
        ));
        module.setup();
        module.set_delivery_handle(bus.handle());
        module.settings_changed(&settings()).unwrap();

        module.start().await.unwrap();
        module.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(network.broker("tcp://a").connect_attempts(), 1);
        assert_eq!(network.broker("tcp://b").connected_sessions(), 1);

        module.stop().await.unwrap();
        module.stop().await.unwrap();
        assert_eq!(network.broker("tcp://a").connected_sessions(), 0);
        assert!(!module.is_running());
    }

    #[tokio::test]
    async fn start_without_delivery_handle_fails() {
        let network = MockNetwork::new();
        let mut module = MqttModule::new(BridgeContext::new(Arc::new(network), ConnectionTuning::default()));
        module.settings_changed(&settings()).unwrap();
        assert!(matches!(
            module.start().await,
            Err(ModuleError::MissingDelivery(_))
        ));
    }
}
