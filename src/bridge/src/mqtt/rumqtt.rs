//! Production transport backed by `rumqttc`.

use async_trait::async_trait;
use parking_lot::Mutex;
use rumqttc::{
    AsyncClient, ConnectionError, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS, Transport,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::endpoint::{map_qos, BrokerEndpoint};
use super::{ConnectorError, Dispatcher, InboundPublish, MqttSession, MqttTransport};

const MIN_KEEP_ALIVE: Duration = Duration::from_secs(5);
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct RumqttTransport {
    request_capacity: usize,
}

impl Default for RumqttTransport {
    fn default() -> Self {
        Self {
            request_capacity: 64,
        }
    }
}

impl RumqttTransport {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MqttTransport for RumqttTransport {
    async fn connect(
        &self,
        endpoint: &BrokerEndpoint,
        dispatcher: Dispatcher,
    ) -> Result<Arc<dyn MqttSession>, ConnectorError> {
        let options = build_mqtt_options(endpoint)?;
        let qos = map_qos(endpoint.qos)?;
        let (client, mut event_loop) = AsyncClient::new(options, self.request_capacity);

        match tokio::time::timeout(endpoint.ping_timeout(), wait_for_connack(&mut event_loop)).await
        {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(err),
            Err(_) => {
                return Err(ConnectorError::Connection(format!(
                    "timed out waiting for CONNACK from {}",
                    endpoint.host
                )))
            }
        }

        let shared = Arc::new(SessionShared {
            host: endpoint.host.clone(),
            connected: AtomicBool::new(true),
            closing: AtomicBool::new(false),
            pending: Mutex::new(VecDeque::new()),
        });
        let driver = tokio::spawn(drive(
            event_loop,
            client.clone(),
            Arc::clone(&shared),
            dispatcher,
            qos,
        ));

        Ok(Arc::new(RumqttSession {
            client,
            shared,
            publish_order: tokio::sync::Mutex::new(()),
            driver: Mutex::new(Some(driver)),
        }))
    }
}

async fn wait_for_connack(event_loop: &mut EventLoop) -> Result<(), ConnectorError> {
    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => return Ok(()),
            Ok(_) => {}
            Err(err) => return Err(ConnectorError::Connection(err.to_string())),
        }
    }
}

struct PendingPublish {
    qos: QoS,
    pkid: Option<u16>,
    done: oneshot::Sender<Result<(), ConnectorError>>,
}

struct SessionShared {
    host: String,
    connected: AtomicBool,
    closing: AtomicBool,
    pending: Mutex<VecDeque<PendingPublish>>,
}

impl SessionShared {
    /// The publish request reached the socket.
    fn written(&self, pkid: u16) {
        let mut pending = self.pending.lock();
        let Some(index) = pending.iter().position(|entry| entry.pkid.is_none()) else {
            return;
        };
        if pending[index].qos == QoS::AtMostOnce {
            if let Some(entry) = pending.remove(index) {
                let _ = entry.done.send(Ok(()));
            }
        } else {
            pending[index].pkid = Some(pkid);
        }
    }

    fn acknowledged(&self, pkid: u16, qos: QoS) {
        let mut pending = self.pending.lock();
        if let Some(index) = pending
            .iter()
            .position(|entry| entry.pkid == Some(pkid) && entry.qos == qos)
        {
            if let Some(entry) = pending.remove(index) {
                let _ = entry.done.send(Ok(()));
            }
        }
    }

    fn fail_pending(&self, reason: &str) {
        for entry in self.pending.lock().drain(..) {
            let _ = entry
                .done
                .send(Err(ConnectorError::Publish(reason.to_string())));
        }
    }
}

async fn drive(
    mut event_loop: EventLoop,
    client: AsyncClient,
    shared: Arc<SessionShared>,
    dispatcher: Dispatcher,
    qos: QoS,
) {
    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                dispatcher.dispatch(InboundPublish {
                    topic: publish.topic.clone(),
                    payload: publish.payload.to_vec(),
                });
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                if !shared.connected.swap(true, Ordering::AcqRel) {
                    tracing::info!(host = %shared.host, "broker connection restored");
                    for filter in dispatcher.filters() {
                        if let Err(err) = client.try_subscribe(filter.clone(), qos) {
                            tracing::error!(host = %shared.host, topic = %filter, error = %err, "resubscribe failed");
                        }
                    }
                }
            }
            Ok(Event::Incoming(Packet::PubAck(ack))) => {
                shared.acknowledged(ack.pkid, QoS::AtLeastOnce)
            }
            Ok(Event::Incoming(Packet::PubComp(comp))) => {
                shared.acknowledged(comp.pkid, QoS::ExactlyOnce)
            }
            Ok(Event::Outgoing(Outgoing::Publish(pkid))) => shared.written(pkid),
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                shared.connected.store(false, Ordering::Release);
                shared.fail_pending("session closed");
                break;
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                shared.connected.store(false, Ordering::Release);
                shared.fail_pending("broker closed the session");
            }
            Ok(_) => {}
            Err(ConnectionError::RequestsDone) => {
                shared.connected.store(false, Ordering::Release);
                shared.fail_pending("session closed");
                break;
            }
            Err(err) => {
                shared.fail_pending(&err.to_string());
                if shared.closing.load(Ordering::Acquire) {
                    shared.connected.store(false, Ordering::Release);
                    break;
                }
                if shared.connected.swap(false, Ordering::AcqRel) {
                    tracing::warn!(host = %shared.host, error = %err, "broker connection lost");
                }
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
    }
}

struct RumqttSession {
    client: AsyncClient,
    shared: Arc<SessionShared>,
    // One publish in flight at a time keeps acknowledgements in order.
    publish_order: tokio::sync::Mutex<()>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl MqttSession for RumqttSession {
    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    async fn subscribe(&self, filter: &str, qos: u8) -> Result<(), ConnectorError> {
        let qos = map_qos(qos)?;
        self.client
            .subscribe(filter, qos)
            .await
            .map_err(|err| ConnectorError::Subscribe(err.to_string()))
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: u8) -> Result<(), ConnectorError> {
        let qos = map_qos(qos)?;
        let _order = self.publish_order.lock().await;
        if !self.is_connected() {
            return Err(ConnectorError::NotConnected(self.shared.host.clone()));
        }

        let (done, ack) = oneshot::channel();
        self.shared.pending.lock().push_back(PendingPublish {
            qos,
            pkid: None,
            done,
        });
        if let Err(err) = self.client.publish(topic, qos, false, payload).await {
            self.shared.pending.lock().pop_back();
            return Err(ConnectorError::Publish(err.to_string()));
        }

        ack.await.unwrap_or_else(|_| {
            Err(ConnectorError::Publish(
                "session dropped before acknowledgement".to_string(),
            ))
        })
    }

    async fn disconnect(&self, grace: Duration) {
        self.shared.closing.store(true, Ordering::Release);
        let _ = tokio::time::timeout(grace, self.client.disconnect()).await;

        let driver = self.driver.lock().take();
        if let Some(mut driver) = driver {
            if tokio::time::timeout(grace, &mut driver).await.is_err() {
                driver.abort();
            }
        }
        self.shared.connected.store(false, Ordering::Release);
        self.shared.fail_pending("session closed");
    }
}

impl Drop for RumqttSession {
    fn drop(&mut self) {
        if let Some(driver) = self.driver.lock().take() {
            driver.abort();
        }
    }
}

fn build_mqtt_options(endpoint: &BrokerEndpoint) -> Result<MqttOptions, ConnectorError> {
    let target = endpoint.target()?;
    let mut options = MqttOptions::new(endpoint.effective_client_id(), target.host, target.port);
    options.set_keep_alive(endpoint.keep_alive().max(MIN_KEEP_ALIVE));
    if let Some((username, password)) = endpoint.credentials() {
        options.set_credentials(username, password);
    }
    if target.tls {
        options.set_transport(Transport::tls_with_default_config());
    }
    Ok(options)
}
