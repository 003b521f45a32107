//! # Broker Client
//!
//! The transport side of the bridge. A [`BrokerClient`] subscribes with manual
//! acknowledgment and publishes without waiting for broker confirmation. The bridge only
//! depends on this trait; [`MemoryBroker`] is an in-process implementation with MQTT topic
//! filter semantics, used by the demo and the tests.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use doku::Document;
use serde::{Deserialize, Serialize};
use snafu::Snafu;
use tokio::sync::mpsc;

use crate::message::{BridgedMessage, Headers};

/// MQTT delivery guarantee level.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, Document)]
#[serde(rename_all = "snake_case")]
pub enum QoS {
    /// Level 0, fire and forget
    #[default]
    AtMostOnce,
    /// Level 1, redelivered until acknowledged
    AtLeastOnce,
    /// Level 2, four-way handshake
    ExactlyOnce,
}

impl QoS {
    /// The numeric MQTT level.
    pub fn level(self) -> u8 {
        match self {
            QoS::AtMostOnce => 0,
            QoS::AtLeastOnce => 1,
            QoS::ExactlyOnce => 2,
        }
    }
}

impl TryFrom<u8> for QoS {
    type Error = BrokerError;

    fn try_from(level: u8) -> Result<Self, Self::Error> {
        match level {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            _ => InvalidQosSnafu { level }.fail(),
        }
    }
}

/// Broker client failures.
#[derive(Debug, Snafu, Clone, PartialEq, Eq)]
#[snafu(visibility(pub))]
pub enum BrokerError {
    /// The client lost or never had a connection
    #[snafu(display("broker client is disconnected"))]
    Disconnected,

    /// The broker refused or failed a publish
    #[snafu(display("failed to publish to {topic}: {message}"))]
    Publish {
        /// topic the publish targeted
        topic: String,
        /// transport supplied reason
        message: String,
    },

    /// The acknowledgment could not be sent
    #[snafu(display("failed to acknowledge delivery: {message}"))]
    Ack {
        /// transport supplied reason
        message: String,
    },

    /// A numeric QoS level outside 0..=2
    #[snafu(display("invalid QoS level {level}"))]
    InvalidQos {
        /// the rejected level
        level: u8,
    },
}

/// Settles one delivery with the broker.
pub trait Acknowledge: Send {
    /// Tells the broker the delivery has been processed.
    fn ack(self: Box<Self>) -> Result<(), BrokerError>;
}

/// One message handed over by the transport, awaiting manual acknowledgment.
pub struct Delivery {
    /// The received message.
    pub message: BridgedMessage,
    /// Topic the message arrived on.
    pub topic: String,
    acker: Box<dyn Acknowledge>,
}

impl Delivery {
    /// Pairs a received message with the handle that acknowledges it.
    pub fn new(
        topic: impl Into<String>,
        message: BridgedMessage,
        acker: Box<dyn Acknowledge>,
    ) -> Self {
        Self {
            message,
            topic: topic.into(),
            acker,
        }
    }

    /// Acknowledges the delivery, consuming it.
    pub fn ack(self) -> Result<(), BrokerError> {
        self.acker.ack()
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("topic", &self.topic)
            .field("message", &self.message)
            .finish_non_exhaustive()
    }
}

/// Stream of deliveries for one subscription. Ends when the client disconnects.
pub type Subscription = mpsc::UnboundedReceiver<Delivery>;

/// What the bridge needs from a broker client.
#[async_trait]
pub trait BrokerClient: Send + Sync + 'static {
    /// Subscribes to `topic_filter` with manual acknowledgment.
    async fn subscribe(&self, topic_filter: &str, qos: QoS) -> Result<Subscription, BrokerError>;

    /// Hands a message to the client for asynchronous publish.
    ///
    /// Returns once the client has accepted the message, not once the broker confirms it.
    async fn publish(
        &self,
        topic: &str,
        payload: bytes::Bytes,
        headers: Headers,
        qos: QoS,
    ) -> Result<(), BrokerError>;
}

/// Whether `topic` matches an MQTT `topic_filter`.
///
/// `+` matches exactly one level, a trailing `#` matches the parent level and everything
/// below it.
pub fn topic_matches(topic_filter: &str, topic: &str) -> bool {
    let mut filter_levels = topic_filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return filter_levels.next().is_none(),
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// A message the [`MemoryBroker`] accepted for publish.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Published {
    /// Destination topic
    pub topic: String,
    /// Payload and forwarded metadata
    pub message: BridgedMessage,
    /// QoS the publisher requested
    pub qos: QoS,
}

#[derive(Default)]
struct MemoryState {
    subscribers: Vec<(String, mpsc::UnboundedSender<Delivery>)>,
    published: Vec<Published>,
    acked: Vec<u64>,
    next_delivery: u64,
    fail_publishes: bool,
}

/// In-process broker client.
///
/// Publishes fan out to every subscription whose filter matches; each delivery records
/// its id when acknowledged. Cloning shares the same broker.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<MemoryState>>,
}

struct MemoryAck {
    id: u64,
    state: Arc<Mutex<MemoryState>>,
}

impl Acknowledge for MemoryAck {
    fn ack(self: Box<Self>) -> Result<(), BrokerError> {
        lock(&self.state).acked.push(self.id);
        Ok(())
    }
}

fn lock(state: &Mutex<MemoryState>) -> MutexGuard<'_, MemoryState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MemoryBroker {
    /// A broker with no subscribers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every following publish fail with [`BrokerError::Publish`].
    pub fn fail_publishes(&self, fail: bool) {
        lock(&self.state).fail_publishes = fail;
    }

    /// Everything published so far, in publish order.
    pub fn published(&self) -> Vec<Published> {
        lock(&self.state).published.clone()
    }

    /// Ids of acknowledged deliveries, in acknowledgment order.
    pub fn acked(&self) -> Vec<u64> {
        lock(&self.state).acked.clone()
    }

    /// Number of deliveries handed to subscribers.
    pub fn delivered(&self) -> u64 {
        lock(&self.state).next_delivery
    }

    /// Drops all subscriptions, ending their streams.
    pub fn disconnect(&self) {
        lock(&self.state).subscribers.clear();
    }
}

#[async_trait]
impl BrokerClient for MemoryBroker {
    async fn subscribe(&self, topic_filter: &str, _qos: QoS) -> Result<Subscription, BrokerError> {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.state)
            .subscribers
            .push((topic_filter.to_string(), tx));
        Ok(rx)
    }

    async fn publish(
        &self,
        topic: &str,
        payload: bytes::Bytes,
        headers: Headers,
        qos: QoS,
    ) -> Result<(), BrokerError> {
        let mut state = lock(&self.state);
        if state.fail_publishes {
            return PublishSnafu {
                topic,
                message: "publishing disabled",
            }
            .fail();
        }

        let message = BridgedMessage { payload, headers };
        state.published.push(Published {
            topic: topic.to_string(),
            message: message.clone(),
            qos,
        });

        let MemoryState {
            subscribers,
            next_delivery,
            ..
        } = &mut *state;
        subscribers.retain(|(_, tx)| !tx.is_closed());
        for (filter, tx) in subscribers.iter() {
            if !topic_matches(filter, topic) {
                continue;
            }
            let id = *next_delivery;
            *next_delivery += 1;
            let acker = Box::new(MemoryAck {
                id,
                state: Arc::clone(&self.state),
            });
            // A subscriber dropping between retain and send only loses this copy.
            let _ = tx.send(Delivery::new(topic, message.clone(), acker));
        }

        Ok(())
    }
}
