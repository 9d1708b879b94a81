//! In-memory brokers for tests and local demos.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::endpoint::BrokerEndpoint;
use super::{topic_matches, ConnectorError, Dispatcher, InboundPublish, MqttSession, MqttTransport};

/// A set of named in-memory brokers, keyed by endpoint host.
#[derive(Clone, Default)]
pub struct MockNetwork {
    brokers: Arc<Mutex<HashMap<String, MockBroker>>>,
}

impl MockNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Broker for `host`, created reachable on first use.
    pub fn broker(&self, host: &str) -> MockBroker {
        self.brokers
            .lock()
            .entry(host.to_string())
            .or_insert_with(|| MockBroker::new(host))
            .clone()
    }
}

#[async_trait]
impl MqttTransport for MockNetwork {
    async fn connect(
        &self,
        endpoint: &BrokerEndpoint,
        dispatcher: Dispatcher,
    ) -> Result<Arc<dyn MqttSession>, ConnectorError> {
        let broker = self.broker(&endpoint.host);
        broker.inner.connect_attempts.fetch_add(1, Ordering::SeqCst);
        if !broker.inner.reachable.load(Ordering::SeqCst) {
            return Err(ConnectorError::Connection(format!(
                "broker {} unreachable",
                endpoint.host
            )));
        }
        let session = Arc::new(MockSession {
            broker: broker.clone(),
            connected: AtomicBool::new(true),
            subscriptions: Mutex::new(Vec::new()),
            dispatcher,
        });
        broker.inner.sessions.lock().push(Arc::clone(&session));
        Ok(session)
    }
}

/// A publish recorded by a [`MockBroker`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockPublished {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: u8,
}

impl MockPublished {
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.payload).unwrap_or(serde_json::Value::Null)
    }
}

#[derive(Clone)]
pub struct MockBroker {
    inner: Arc<MockBrokerInner>,
}

struct MockBrokerInner {
    host: String,
    reachable: AtomicBool,
    connect_attempts: AtomicUsize,
    publish_attempts: AtomicUsize,
    ack_delay: Mutex<Duration>,
    published: Mutex<Vec<MockPublished>>,
    sessions: Mutex<Vec<Arc<MockSession>>>,
}

impl MockBroker {
    fn new(host: &str) -> Self {
        Self {
            inner: Arc::new(MockBrokerInner {
                host: host.to_string(),
                reachable: AtomicBool::new(true),
                connect_attempts: AtomicUsize::new(0),
                publish_attempts: AtomicUsize::new(0),
                ack_delay: Mutex::new(Duration::ZERO),
                published: Mutex::new(Vec::new()),
                sessions: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn host(&self) -> &str {
        &self.inner.host
    }

    /// Unreachable brokers refuse new connections and publishes.
    pub fn set_reachable(&self, reachable: bool) {
        self.inner.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Delay applied before each publish is acknowledged.
    pub fn set_ack_delay(&self, delay: Duration) {
        *self.inner.ack_delay.lock() = delay;
    }

    pub fn connect_attempts(&self) -> usize {
        self.inner.connect_attempts.load(Ordering::SeqCst)
    }

    pub fn publish_attempts(&self) -> usize {
        self.inner.publish_attempts.load(Ordering::SeqCst)
    }

    pub fn connected_sessions(&self) -> usize {
        self.inner
            .sessions
            .lock()
            .iter()
            .filter(|session| session.connected.load(Ordering::SeqCst))
            .count()
    }

    pub fn published(&self) -> Vec<MockPublished> {
        self.inner.published.lock().clone()
    }

    /// Filters subscribed by the currently connected sessions.
    pub fn subscriptions(&self) -> Vec<String> {
        self.live_sessions()
            .iter()
            .flat_map(|session| session.subscriptions.lock().clone())
            .collect()
    }

    /// Deliver a publish to every connected session subscribed to a matching
    /// filter. Returns the number of handlers invoked.
    pub fn inject(&self, topic: &str, payload: Vec<u8>) -> usize {
        let mut handled = 0;
        for session in self.live_sessions() {
            let subscribed = session
                .subscriptions
                .lock()
                .iter()
                .any(|filter| topic_matches(filter, topic));
            if subscribed {
                handled += session.dispatcher.dispatch(InboundPublish {
                    topic: topic.to_string(),
                    payload: payload.clone(),
                });
            }
        }
        handled
    }

    /// Wait until at least `count` publishes were recorded or `timeout` passes.
    pub async fn wait_for_published(&self, count: usize, timeout: Duration) -> Vec<MockPublished> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let published = self.published();
            if published.len() >= count || tokio::time::Instant::now() >= deadline {
                return published;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn live_sessions(&self) -> Vec<Arc<MockSession>> {
        self.inner
            .sessions
            .lock()
            .iter()
            .filter(|session| session.connected.load(Ordering::SeqCst))
            .cloned()
            .collect()
    }
}

struct MockSession {
    broker: MockBroker,
    connected: AtomicBool,
    subscriptions: Mutex<Vec<String>>,
    dispatcher: Dispatcher,
}

impl MockSession {
    fn ensure_connected(&self) -> Result<(), ConnectorError> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ConnectorError::NotConnected(self.broker.inner.host.clone()))
        }
    }
}

#[async_trait]
impl MqttSession for MockSession {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn subscribe(&self, filter: &str, _qos: u8) -> Result<(), ConnectorError> {
        self.ensure_connected()?;
        let mut subscriptions = self.subscriptions.lock();
        if !subscriptions.iter().any(|existing| existing == filter) {
            subscriptions.push(filter.to_string());
        }
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: u8) -> Result<(), ConnectorError> {
        self.ensure_connected()?;
        let broker = &self.broker.inner;
        broker.publish_attempts.fetch_add(1, Ordering::SeqCst);
        if !broker.reachable.load(Ordering::SeqCst) {
            return Err(ConnectorError::Publish(format!("broker {} unreachable", broker.host)));
        }
        let delay = *broker.ack_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        broker.published.lock().push(MockPublished {
            topic: topic.to_string(),
            payload,
            qos,
        });
        Ok(())
    }

    async fn disconnect(&self, _grace: Duration) {
        self.connected.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unreachable_broker_refuses_connections() {
        let network = MockNetwork::new();
        let broker = network.broker("tcp://mock");
        broker.set_reachable(false);
        let result = network
            .connect(&BrokerEndpoint::new("tcp://mock"), Dispatcher::new())
            .await;
        assert!(result.is_err());
        assert_eq!(broker.connect_attempts(), 1);
        assert_eq!(broker.connected_sessions(), 0);
    }

    #[tokio::test]
    async fn publishes_are_recorded_until_disconnect() {
        let network = MockNetwork::new();
        let broker = network.broker("tcp://mock");
        let session = network
            .connect(&BrokerEndpoint::new("tcp://mock"), Dispatcher::new())
            .await
            .unwrap();

        session.publish("out", b"{\"result\":1}".to_vec(), 1).await.unwrap();
        session.disconnect(Duration::from_millis(1)).await;
        assert!(session.publish("out", Vec::new(), 1).await.is_err());

        let published = broker.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].json()["result"], 1);
        assert_eq!(broker.publish_attempts(), 1);
    }
}
