use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::JoinHandle;

use crate::delivery::DeliveryReceiver;
use crate::metrics::{MESSAGES_DROPPED, MESSAGES_PUBLISHED};
use crate::mqtt::connection::{BrokerConnection, ConnectionTuning};
use crate::mqtt::endpoint::BrokerEndpoint;
use crate::mqtt::MqttTransport;
use crate::observation::Message;

/// Single consumer of the delivery bus, republishing to the outbound broker.
///
/// Each message is published and acknowledged before the next one is taken
/// off the bus. Messages taken while the connection is reconnecting are
/// dropped, not queued.
pub struct PublishBridge {
    connection: BrokerConnection,
    receiver: Arc<tokio::sync::Mutex<DeliveryReceiver>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl PublishBridge {
    pub fn new(
        endpoint: BrokerEndpoint,
        transport: Arc<dyn MqttTransport>,
        tuning: ConnectionTuning,
        receiver: DeliveryReceiver,
    ) -> Self {
        Self {
            connection: BrokerConnection::new(endpoint, transport, tuning),
            receiver: Arc::new(tokio::sync::Mutex::new(receiver)),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn connection(&self) -> &BrokerConnection {
        &self.connection
    }

    /// Connect in the background and start draining the bus.
    pub fn start(&self) {
        let mut tasks = self.tasks.lock();
        if tasks.iter().any(|task| !task.is_finished()) {
            return;
        }
        tasks.clear();
        tracing::info!(host = %self.connection.endpoint().host, "starting MQTT publish client");

        let connection = self.connection.clone();
        tasks.push(tokio::spawn(async move {
            connection.connect().await;
        }));
        tasks.push(tokio::spawn(drain(
            self.connection.clone(),
            Arc::clone(&self.receiver),
        )));
    }

    pub async fn stop(&self) {
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            task.abort();
        }
        self.connection.stop().await;
    }
}

async fn drain(connection: BrokerConnection, receiver: Arc<tokio::sync::Mutex<DeliveryReceiver>>) {
    let mut receiver = receiver.lock().await;
    let host = connection.endpoint().host.clone();
    while let Some(message) = receiver.next().await {
        if connection.is_connecting() {
            MESSAGES_DROPPED
                .with_label_values(&[host.as_str(), "reconnecting"])
                .inc();
            tracing::debug!(host = %host, topic = %message.topic, "dropping message while reconnecting");
            continue;
        }
        publish_one(&connection, &host, message).await;
    }
    tracing::info!(host = %host, "delivery bus closed, publish loop finished");
}

async fn publish_one(connection: &BrokerConnection, host: &str, message: Message) {
    let payload = match serde_json::to_vec(&message.observation) {
        Ok(payload) => payload,
        Err(err) => {
            tracing::error!(topic = %message.topic, error = %err, "failed to serialize observation");
            MESSAGES_DROPPED
                .with_label_values(&[host, "encode"])
                .inc();
            return;
        }
    };
    match connection.publish(&message.topic, payload).await {
        Ok(()) => {
            MESSAGES_PUBLISHED.with_label_values(&[host]).inc();
        }
        Err(err) => {
            MESSAGES_DROPPED
                .with_label_values(&[host, "publish"])
                .inc();
            tracing::warn!(host = %host, topic = %message.topic, error = %err, "publish failed");
        }
    }
}
