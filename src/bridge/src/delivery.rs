//! System-wide handoff channel between message producers and the publisher.
//!
//! Producers hold cloned [`DeliveryHandle`]s and only ever send; the single
//! [`DeliveryReceiver`] is taken once by the publish bridge. The channel is
//! bounded (one slot by default) so a slow outbound broker throttles every
//! producer instead of letting memory grow.

use crate::mqtt::ConnectorError;
use crate::observation::Message;
use parking_lot::Mutex;
use tokio::sync::mpsc;

pub const DEFAULT_DELIVERY_CAPACITY: usize = 1;

pub struct DeliveryBus {
    sender: mpsc::Sender<Message>,
    receiver: Mutex<Option<mpsc::Receiver<Message>>>,
}

impl Default for DeliveryBus {
    fn default() -> Self {
        Self::new(DEFAULT_DELIVERY_CAPACITY)
    }
}

impl DeliveryBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        Self {
            sender,
            receiver: Mutex::new(Some(receiver)),
        }
    }

    /// Producer side; cheap to clone and hand to every module.
    pub fn handle(&self) -> DeliveryHandle {
        DeliveryHandle {
            sender: self.sender.clone(),
        }
    }

    /// Consumer side. Returns `None` once the receiver has been taken.
    pub fn take_receiver(&self) -> Option<DeliveryReceiver> {
        self.receiver
            .lock()
            .take()
            .map(|receiver| DeliveryReceiver { receiver })
    }
}

#[derive(Debug, Clone)]
pub struct DeliveryHandle {
    sender: mpsc::Sender<Message>,
}

impl DeliveryHandle {
    /// Hand a message to the publisher, waiting while the bus is full.
    pub async fn deliver(&self, message: Message) -> Result<(), ConnectorError> {
        self.sender
            .send(message)
            .await
            .map_err(|_| ConnectorError::BusClosed)
    }

    /// True when no message is waiting to be taken by the consumer.
    pub fn is_drained(&self) -> bool {
        self.sender.capacity() == self.sender.max_capacity()
    }
}

#[derive(Debug)]
pub struct DeliveryReceiver {
    receiver: mpsc::Receiver<Message>,
}

impl DeliveryReceiver {
    /// Wait for the next message. `None` once every producer is gone.
    pub async fn next(&mut self) -> Option<Message> {
        self.receiver.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observation::Observation;
    use std::time::Duration;

    #[tokio::test]
    async fn receiver_is_taken_once() {
        let bus = DeliveryBus::default();
        assert!(bus.take_receiver().is_some());
        assert!(bus.take_receiver().is_none());
    }

    #[tokio::test]
    async fn producers_block_while_bus_is_full() {
        let bus = DeliveryBus::new(1);
        let handle = bus.handle();
        let mut receiver = bus.take_receiver().unwrap();

        handle
            .deliver(Message::new("a", Observation::default()))
            .await
            .unwrap();
        assert!(!handle.is_drained());

        let blocked = tokio::time::timeout(
            Duration::from_millis(50),
            handle.deliver(Message::new("b", Observation::default())),
        )
        .await;
        assert!(blocked.is_err(), "second delivery should wait for the consumer");

        assert_eq!(receiver.next().await.unwrap().topic, "a");
        assert!(handle.is_drained());
    }

    #[tokio::test]
    async fn messages_arrive_in_bus_order() {
        let bus = DeliveryBus::new(4);
        let handle = bus.handle();
        let mut receiver = bus.take_receiver().unwrap();
        for topic in ["one", "two", "three"] {
            handle
                .deliver(Message::new(topic, Observation::default()))
                .await
                .unwrap();
        }
        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(receiver.next().await.unwrap().topic);
        }
        assert_eq!(seen, vec!["one", "two", "three"]);
    }
}
