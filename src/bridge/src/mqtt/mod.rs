//! MQTT plumbing shared by the publish and subscribe bridges.
//!
//! - [`MqttTransport`] performs one connection attempt against a broker.
//! - [`MqttSession`] is the live handle returned by a successful attempt.
//! - [`Dispatcher`] routes inbound publishes to the handlers registered per topic filter.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;

pub mod connection;
pub mod endpoint;
pub mod mock;
pub mod rumqtt;

use endpoint::BrokerEndpoint;

/// Error type shared by broker connections and the delivery bus.
#[derive(thiserror::Error, Debug, Clone)]
pub enum ConnectorError {
    /// Broker host could not be turned into a socket address.
    #[error("invalid broker endpoint `{endpoint}`: {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },
    /// Connection-level failure.
    #[error("connection error: {0}")]
    Connection(String),
    /// No live session to the broker.
    #[error("not connected to broker {0}")]
    NotConnected(String),
    #[error("publish error: {0}")]
    Publish(String),
    #[error("subscribe error: {0}")]
    Subscribe(String),
    /// The publisher side of the delivery bus has gone away.
    #[error("delivery bus closed")]
    BusClosed,
    /// Miscellaneous error.
    #[error("{0}")]
    Other(String),
}

/// Raw publish received from a broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundPublish {
    pub topic: String,
    pub payload: Vec<u8>,
}

pub type PublishHandler = Arc<dyn Fn(InboundPublish) + Send + Sync>;

/// Topic filter to handler routes for one broker connection.
///
/// Cloning shares the route table, so routes added after a session was
/// established are still visible to that session's receive loop.
#[derive(Clone, Default)]
pub struct Dispatcher {
    routes: Arc<RwLock<Vec<(String, PublishHandler)>>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler; a filter registered twice keeps only the latest handler.
    pub fn add(&self, filter: impl Into<String>, handler: PublishHandler) {
        let filter = filter.into();
        let mut routes = self.routes.write();
        if let Some(slot) = routes.iter_mut().find(|(existing, _)| *existing == filter) {
            slot.1 = handler;
        } else {
            routes.push((filter, handler));
        }
    }

    pub fn filters(&self) -> Vec<String> {
        self.routes
            .read()
            .iter()
            .map(|(filter, _)| filter.clone())
            .collect()
    }

    /// Hand the publish to every matching handler. Returns how many matched.
    pub fn dispatch(&self, publish: InboundPublish) -> usize {
        let handlers: Vec<PublishHandler> = self
            .routes
            .read()
            .iter()
            .filter(|(filter, _)| topic_matches(filter, &publish.topic))
            .map(|(_, handler)| Arc::clone(handler))
            .collect();
        for handler in &handlers {
            handler(publish.clone());
        }
        handlers.len()
    }
}

/// MQTT topic filter matching with `+` (one level) and `#` (remaining levels).
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');
    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(expected), Some(actual)) if expected == actual => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Factory for broker sessions.
#[async_trait]
pub trait MqttTransport: Send + Sync + 'static {
    /// Perform exactly one connection attempt. Inbound publishes on the
    /// returned session are routed through `dispatcher`.
    async fn connect(
        &self,
        endpoint: &BrokerEndpoint,
        dispatcher: Dispatcher,
    ) -> Result<Arc<dyn MqttSession>, ConnectorError>;
}

/// A live broker session.
#[async_trait]
pub trait MqttSession: Send + Sync + 'static {
    fn is_connected(&self) -> bool;

    async fn subscribe(&self, filter: &str, qos: u8) -> Result<(), ConnectorError>;

    /// Publish and wait for the broker acknowledgement matching `qos`.
    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: u8) -> Result<(), ConnectorError>;

    /// Close the session, giving in-flight work at most `grace` to finish.
    async fn disconnect(&self, grace: Duration);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn wildcard_filters() {
        assert!(topic_matches("sensors/kitchen", "sensors/kitchen"));
        assert!(!topic_matches("sensors/kitchen", "sensors/garage"));
        assert!(topic_matches("sensors/+/temp", "sensors/kitchen/temp"));
        assert!(!topic_matches("sensors/+/temp", "sensors/kitchen/humidity"));
        assert!(!topic_matches("sensors/+", "sensors/kitchen/temp"));
        assert!(topic_matches("sensors/#", "sensors/kitchen/temp"));
        assert!(topic_matches("sensors/#", "sensors"));
        assert!(topic_matches("#", "anything/at/all"));
        assert!(!topic_matches("sensors/kitchen/temp", "sensors/kitchen"));
    }

    #[test]
    fn dispatcher_routes_to_matching_handlers() {
        let dispatcher = Dispatcher::new();
        let exact = Arc::new(AtomicUsize::new(0));
        let wildcard = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&exact);
        dispatcher.add(
            "home/power",
            Arc::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        let counter = Arc::clone(&wildcard);
        dispatcher.add(
            "home/#",
            Arc::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        let matched = dispatcher.dispatch(InboundPublish {
            topic: "home/power".to_string(),
            payload: b"{}".to_vec(),
        });
        assert_eq!(matched, 2);
        dispatcher.dispatch(InboundPublish {
            topic: "home/water".to_string(),
            payload: b"{}".to_vec(),
        });

        assert_eq!(exact.load(Ordering::SeqCst), 1);
        assert_eq!(wildcard.load(Ordering::SeqCst), 2);
        assert_eq!(dispatcher.filters(), vec!["home/power", "home/#"]);
    }

    #[test]
    fn re_adding_a_filter_replaces_the_handler() {
        let dispatcher = Dispatcher::new();
        let hits = Arc::new(AtomicUsize::new(0));
        dispatcher.add("a", Arc::new(|_| {}));
        let counter = Arc::clone(&hits);
        dispatcher.add(
            "a",
            Arc::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        dispatcher.dispatch(InboundPublish {
            topic: "a".to_string(),
            payload: Vec::new(),
        });
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(dispatcher.filters().len(), 1);
    }
}
