use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use super::endpoint::BrokerEndpoint;
use super::{ConnectorError, Dispatcher, MqttSession, MqttTransport, PublishHandler};
use crate::metrics::CONNECT_FAILURES;

pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_DISCONNECT_GRACE: Duration = Duration::from_millis(500);

/// Timing knobs shared by every broker connection in the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionTuning {
    pub retry_interval: Duration,
    pub disconnect_grace: Duration,
}

impl Default for ConnectionTuning {
    fn default() -> Self {
        Self {
            retry_interval: DEFAULT_RETRY_INTERVAL,
            disconnect_grace: DEFAULT_DISCONNECT_GRACE,
        }
    }
}

/// Supervised connection to one broker endpoint.
///
/// A failed [`connect`](Self::connect) starts a background retry supervisor
/// that keeps trying on a fixed interval. While it runs the connection reports
/// [`is_connecting`](Self::is_connecting). Subscriptions are remembered and
/// applied again on every successful connect.
#[derive(Clone)]
pub struct BrokerConnection {
    inner: Arc<ConnectionInner>,
}

struct ConnectionInner {
    endpoint: BrokerEndpoint,
    transport: Arc<dyn MqttTransport>,
    tuning: ConnectionTuning,
    dispatcher: Dispatcher,
    connecting: AtomicBool,
    stopped: AtomicBool,
    session: RwLock<Option<Arc<dyn MqttSession>>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    // Serialises connection attempts and subscription changes.
    attempt: tokio::sync::Mutex<()>,
}

impl BrokerConnection {
    pub fn new(
        endpoint: BrokerEndpoint,
        transport: Arc<dyn MqttTransport>,
        tuning: ConnectionTuning,
    ) -> Self {
        Self {
            inner: Arc::new(ConnectionInner {
                endpoint,
                transport,
                tuning,
                dispatcher: Dispatcher::new(),
                connecting: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                session: RwLock::new(None),
                supervisor: Mutex::new(None),
                attempt: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn endpoint(&self) -> &BrokerEndpoint {
        &self.inner.endpoint
    }

    /// True while the retry supervisor is active.
    pub fn is_connecting(&self) -> bool {
        self.inner.connecting.load(Ordering::Acquire)
    }

    pub fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    /// Try to connect once. On failure a retry supervisor is started unless
    /// one is already running. Returns whether the connection is up.
    pub async fn connect(&self) -> bool {
        self.inner.stopped.store(false, Ordering::Release);
        match self.inner.attempt().await {
            Ok(()) => true,
            Err(err) => {
                if !self.is_connecting() {
                    tracing::warn!(host = %self.inner.endpoint.host, error = %err, "broker connection failed");
                }
                self.ensure_supervisor();
                false
            }
        }
    }

    /// Register `handler` for `filter` and subscribe if a session is live.
    /// Without a session the subscription is applied on the next connect.
    pub async fn subscribe(
        &self,
        filter: impl Into<String>,
        handler: PublishHandler,
    ) -> Result<(), ConnectorError> {
        let filter = filter.into();
        self.inner.dispatcher.add(filter.clone(), handler);

        let _attempt = self.inner.attempt.lock().await;
        match self.inner.current_session() {
            Some(session) if session.is_connected() => {
                session.subscribe(&filter, self.inner.endpoint.qos).await
            }
            _ => {
                tracing::debug!(host = %self.inner.endpoint.host, topic = %filter, "subscription deferred until connected");
                Ok(())
            }
        }
    }

    /// Publish at the endpoint's QoS and wait for the broker acknowledgement.
    pub async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), ConnectorError> {
        let session = self
            .inner
            .current_session()
            .ok_or_else(|| ConnectorError::NotConnected(self.inner.endpoint.host.clone()))?;
        session.publish(topic, payload, self.inner.endpoint.qos).await
    }

    /// Stop retrying and disconnect within the grace period. Safe to call
    /// whether or not a connection was ever established.
    pub async fn stop(&self) {
        self.inner.stopped.store(true, Ordering::Release);
        if let Some(handle) = self.inner.supervisor.lock().take() {
            handle.abort();
        }
        self.inner.connecting.store(false, Ordering::Release);

        let session = self.inner.session.write().take();
        if let Some(session) = session {
            session.disconnect(self.inner.tuning.disconnect_grace).await;
            tracing::info!(host = %self.inner.endpoint.host, "broker connection closed");
        }
    }

    fn ensure_supervisor(&self) {
        let mut slot = self.inner.supervisor.lock();
        if slot.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }
        if self.inner.stopped.load(Ordering::Acquire) {
            return;
        }
        self.inner.connecting.store(true, Ordering::Release);
        tracing::info!(
            host = %self.inner.endpoint.host,
            retry_secs = self.inner.tuning.retry_interval.as_secs_f64(),
            "starting broker reconnect procedure in background"
        );
        *slot = Some(tokio::spawn(supervise(
            Arc::downgrade(&self.inner),
            self.inner.tuning.retry_interval,
        )));
    }
}

async fn supervise(inner: Weak<ConnectionInner>, period: Duration) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(inner) = inner.upgrade() else {
            break;
        };
        if inner.stopped.load(Ordering::Acquire) {
            break;
        }
        if let Err(err) = inner.attempt().await {
            tracing::debug!(host = %inner.endpoint.host, error = %err, "broker reconnect attempt failed");
        }
        if inner.is_connected() {
            inner.connecting.store(false, Ordering::Release);
            tracing::info!(host = %inner.endpoint.host, "broker reconnect procedure finished");
            break;
        }
    }
}

impl ConnectionInner {
    fn current_session(&self) -> Option<Arc<dyn MqttSession>> {
        self.session.read().clone()
    }

    fn is_connected(&self) -> bool {
        self.session
            .read()
            .as_ref()
            .is_some_and(|session| session.is_connected())
    }

    async fn attempt(&self) -> Result<(), ConnectorError> {
        let _attempt = self.attempt.lock().await;
        if self.stopped.load(Ordering::Acquire) {
            return Err(ConnectorError::Other(format!(
                "connection to {} stopped",
                self.endpoint.host
            )));
        }
        if self.is_connected() {
            return Ok(());
        }

        let session = match self.transport.connect(&self.endpoint, self.dispatcher.clone()).await {
            Ok(session) => session,
            Err(err) => {
                CONNECT_FAILURES
                    .with_label_values(&[self.endpoint.host.as_str()])
                    .inc();
                return Err(err);
            }
        };

        for filter in self.dispatcher.filters() {
            if let Err(err) = session.subscribe(&filter, self.endpoint.qos).await {
                tracing::error!(host = %self.endpoint.host, topic = %filter, error = %err, "subscribe failed");
            }
        }

        let stored = {
            let mut slot = self.session.write();
            if self.stopped.load(Ordering::Acquire) {
                false
            } else {
                *slot = Some(Arc::clone(&session));
                true
            }
        };
        if !stored {
            session.disconnect(self.tuning.disconnect_grace).await;
            return Err(ConnectorError::Other(format!(
                "connection to {} stopped",
                self.endpoint.host
            )));
        }

        tracing::info!(host = %self.endpoint.host, "connected to broker");
        Ok(())
    }
}
