use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;

use crate::delivery::DeliveryHandle;
use crate::metrics::{MESSAGES_DROPPED, MESSAGES_RECEIVED};
use crate::mqtt::connection::{BrokerConnection, ConnectionTuning};
use crate::mqtt::endpoint::BrokerEndpoint;
use crate::mqtt::{InboundPublish, MqttTransport, PublishHandler};
use crate::transform::to_message;

/// Observation field an inbound field is written to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldTarget {
    pub name: String,
    #[serde(default)]
    pub to_float: bool,
}

/// One inbound topic and how its payloads become observations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamMapping {
    #[serde(rename = "topicIn")]
    pub topic_in: String,
    #[serde(rename = "topicOut")]
    pub topic_out: String,
    #[serde(default)]
    pub mapping: HashMap<String, FieldTarget>,
}

/// Subscribes to the streams of one inbound broker and forwards the
/// transformed readings onto the delivery bus.
pub struct SubscribeBridge {
    connection: BrokerConnection,
    streams: Arc<Vec<StreamMapping>>,
    delivery: DeliveryHandle,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SubscribeBridge {
    pub fn new(
        endpoint: BrokerEndpoint,
        streams: Vec<StreamMapping>,
        transport: Arc<dyn MqttTransport>,
        tuning: ConnectionTuning,
        delivery: DeliveryHandle,
    ) -> Self {
        Self {
            connection: BrokerConnection::new(endpoint, transport, tuning),
            streams: Arc::new(streams),
            delivery,
            task: Mutex::new(None),
        }
    }

    pub fn connection(&self) -> &BrokerConnection {
        &self.connection
    }

    pub fn streams(&self) -> &[StreamMapping] {
        &self.streams
    }

    /// Connect, then subscribe every stream. Streams subscribed while the
    /// broker is unreachable become active once the connection comes up.
    pub fn start(&self) {
        let mut task = self.task.lock();
        if task.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }
        tracing::info!(host = %self.connection.endpoint().host, streams = self.streams.len(), "starting MQTT subscription client");

        let connection = self.connection.clone();
        let streams = Arc::clone(&self.streams);
        let delivery = self.delivery.clone();
        *task = Some(tokio::spawn(async move {
            connection.connect().await;
            for (index, stream) in streams.iter().enumerate() {
                let filter = stream.topic_in.clone();
                let handler = stream_handler(
                    Arc::clone(&streams),
                    index,
                    delivery.clone(),
                    connection.endpoint().host.clone(),
                );
                if let Err(err) = connection.subscribe(filter.clone(), handler).await {
                    tracing::error!(host = %connection.endpoint().host, topic = %filter, error = %err, "subscribe failed");
                }
            }
        }));
    }

    pub async fn stop(&self) {
        let task = self.task.lock().take();
        if let Some(task) = task {
            task.abort();
        }
        self.connection.stop().await;
    }
}

// Each inbound publish is handled on its own task so a blocked bus never
// stalls the broker receive loop.
fn stream_handler(
    streams: Arc<Vec<StreamMapping>>,
    index: usize,
    delivery: DeliveryHandle,
    host: String,
) -> PublishHandler {
    Arc::new(move |publish: InboundPublish| {
        let streams = Arc::clone(&streams);
        let delivery = delivery.clone();
        let host = host.clone();
        tokio::spawn(async move {
            let Some(message) = to_message(&streams[index], &publish.payload) else {
                return;
            };
            MESSAGES_RECEIVED.with_label_values(&[host.as_str()]).inc();
            if let Err(err) = delivery.deliver(message).await {
                MESSAGES_DROPPED
                    .with_label_values(&[host.as_str(), "bus_closed"])
                    .inc();
                tracing::warn!(host = %host, topic = %publish.topic, error = %err, "failed to hand message to publisher");
            }
        });
    })
}
