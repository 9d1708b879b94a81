//! Publish/subscribe bridge between upstream MQTT brokers and a single
//! SensorThings broker.
//!
//! - Inbound readings arrive through [`SubscribeBridge`]s owned by modules.
//! - Every producer hands [`Message`]s to the shared [`DeliveryBus`].
//! - The single [`PublishBridge`] drains the bus and republishes downstream.

pub mod delivery;
pub mod metrics;
pub mod module;
pub mod mqtt;
pub mod observation;
pub mod publish;
pub mod subscribe;
pub mod transform;

pub use delivery::{DeliveryBus, DeliveryHandle, DeliveryReceiver, DEFAULT_DELIVERY_CAPACITY};
pub use module::registry::{ModuleFactory, ModuleRegistry};
pub use module::{BridgeContext, Module, ModuleBase, ModuleDescriptor, ModuleError};
pub use mqtt::connection::{BrokerConnection, ConnectionTuning};
pub use mqtt::endpoint::BrokerEndpoint;
pub use mqtt::mock::{MockBroker, MockNetwork, MockPublished};
pub use mqtt::rumqtt::RumqttTransport;
pub use mqtt::{
    topic_matches, ConnectorError, Dispatcher, InboundPublish, MqttSession, MqttTransport,
    PublishHandler,
};
pub use observation::{FeatureOfInterest, Message, Observation};
pub use publish::PublishBridge;
pub use subscribe::{FieldTarget, StreamMapping, SubscribeBridge};
