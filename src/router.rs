//! # Channel Router
//!
//! Ordered hand-off points that decouple whoever produces a message (a transport task, an
//! application caller) from whoever processes it. Each channel has exactly one consumer,
//! the [`ChannelHandler`] given to [`ChannelReceiver::run`], and delivers items to it one at
//! a time in arrival order. Nothing is retained after delivery.

use async_trait::async_trait;
use snafu::Snafu;
use tokio::sync::mpsc;

/// Why an item could not be handed to a channel.
#[derive(Debug, Snafu, Clone, Copy, PartialEq, Eq)]
pub enum ChannelError {
    /// The consumer has stopped
    #[snafu(display("channel {name} is closed"))]
    Closed {
        /// channel name
        name: &'static str,
    },

    /// A bounded channel is at capacity
    #[snafu(display("channel {name} is full"))]
    Full {
        /// channel name
        name: &'static str,
    },
}

/// The single consumer of a channel.
#[async_trait]
pub trait ChannelHandler<T: Send + 'static>: Send + Sync {
    /// Processes one item. The next item is not delivered until this returns.
    async fn handle(&self, item: T);
}

#[derive(Debug)]
enum Tx<T> {
    Bounded(mpsc::Sender<T>),
    Unbounded(mpsc::UnboundedSender<T>),
}

impl<T> Clone for Tx<T> {
    fn clone(&self) -> Self {
        match self {
            Tx::Bounded(tx) => Tx::Bounded(tx.clone()),
            Tx::Unbounded(tx) => Tx::Unbounded(tx.clone()),
        }
    }
}

#[derive(Debug)]
enum Rx<T> {
    Bounded(mpsc::Receiver<T>),
    Unbounded(mpsc::UnboundedReceiver<T>),
}

impl<T> Rx<T> {
    async fn recv(&mut self) -> Option<T> {
        match self {
            Rx::Bounded(rx) => rx.recv().await,
            Rx::Unbounded(rx) => rx.recv().await,
        }
    }
}

/// Producer side of a channel. Clones feed the same consumer.
#[derive(Debug)]
pub struct ChannelSender<T> {
    name: &'static str,
    tx: Tx<T>,
}

impl<T> Clone for ChannelSender<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            tx: self.tx.clone(),
        }
    }
}

impl<T> ChannelSender<T> {
    /// Queues `item` without waiting.
    ///
    /// # Errors
    /// - `Closed` if the consumer is gone.
    /// - `Full` if the channel is bounded and at capacity.
    pub fn send(&self, item: T) -> Result<(), ChannelError> {
        match &self.tx {
            Tx::Bounded(tx) => tx.try_send(item).map_err(|err| match err {
                mpsc::error::TrySendError::Full(_) => ChannelError::Full { name: self.name },
                mpsc::error::TrySendError::Closed(_) => ChannelError::Closed { name: self.name },
            }),
            Tx::Unbounded(tx) => tx
                .send(item)
                .map_err(|_| ChannelError::Closed { name: self.name }),
        }
    }

    /// Queues `item`, waiting for capacity on a bounded channel.
    ///
    /// # Errors
    /// - `Closed` if the consumer is gone.
    pub async fn send_wait(&self, item: T) -> Result<(), ChannelError> {
        match &self.tx {
            Tx::Bounded(tx) => tx
                .send(item)
                .await
                .map_err(|_| ChannelError::Closed { name: self.name }),
            Tx::Unbounded(tx) => tx
                .send(item)
                .map_err(|_| ChannelError::Closed { name: self.name }),
        }
    }

    /// Channel name, for logs.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// True once the consumer has stopped.
    pub fn is_closed(&self) -> bool {
        match &self.tx {
            Tx::Bounded(tx) => tx.is_closed(),
            Tx::Unbounded(tx) => tx.is_closed(),
        }
    }
}

/// Consumer side of a channel. Consumed by [`ChannelReceiver::run`], so a channel can only
/// ever have one handler.
#[derive(Debug)]
pub struct ChannelReceiver<T> {
    name: &'static str,
    rx: Rx<T>,
}

impl<T: Send + 'static> ChannelReceiver<T> {
    /// Feeds every item to `handler` in arrival order until all senders are dropped.
    pub async fn run<H>(mut self, handler: H)
    where
        H: ChannelHandler<T>,
    {
        tracing::debug!(channel = self.name, "channel consumer started");
        while let Some(item) = self.rx.recv().await {
            handler.handle(item).await;
        }
        tracing::debug!(channel = self.name, "channel consumer stopped");
    }

    /// Receives the next item directly, bypassing a handler.
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Takes the next item if one is already queued.
    pub fn try_recv(&mut self) -> Option<T> {
        match &mut self.rx {
            Rx::Bounded(rx) => rx.try_recv().ok(),
            Rx::Unbounded(rx) => rx.try_recv().ok(),
        }
    }
}

/// Creates a named channel. `capacity` of `None` means unbounded.
///
/// A zero capacity is treated as one, the smallest tokio bounded channel.
pub fn channel<T>(
    name: &'static str,
    capacity: Option<usize>,
) -> (ChannelSender<T>, ChannelReceiver<T>) {
    let (tx, rx) = match capacity {
        Some(capacity) => {
            let (tx, rx) = mpsc::channel(capacity.max(1));
            (Tx::Bounded(tx), Rx::Bounded(rx))
        }
        None => {
            let (tx, rx) = mpsc::unbounded_channel();
            (Tx::Unbounded(tx), Rx::Unbounded(rx))
        }
    };
    (ChannelSender { name, tx }, ChannelReceiver { name, rx })
}

/// Name of the channel carrying deliveries from the broker to the inbound bridge.
pub const INBOUND_CHANNEL: &str = "mqtt-inbound";

/// Name of the channel carrying outbound messages to the broker client.
pub const OUTBOUND_CHANNEL: &str = "mqtt-outbound";

/// The two hand-off points of a bridge, one per direction.
#[derive(Debug)]
pub struct Router<I, O> {
    /// Transport side of the inbound channel
    pub inbound_tx: ChannelSender<I>,
    /// Inbound bridge side of the inbound channel
    pub inbound_rx: ChannelReceiver<I>,
    /// Outbound bridge side of the outbound channel
    pub outbound_tx: ChannelSender<O>,
    /// Broker client side of the outbound channel
    pub outbound_rx: ChannelReceiver<O>,
}

impl<I, O> Router<I, O> {
    /// Builds both channels with the same capacity policy.
    pub fn new(capacity: Option<usize>) -> Self {
        let (inbound_tx, inbound_rx) = channel(INBOUND_CHANNEL, capacity);
        let (outbound_tx, outbound_rx) = channel(OUTBOUND_CHANNEL, capacity);
        Self {
            inbound_tx,
            inbound_rx,
            outbound_tx,
            outbound_rx,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    struct Collect(Arc<Mutex<Vec<u32>>>);

    #[async_trait]
    impl ChannelHandler<u32> for Collect {
        async fn handle(&self, item: u32) {
            tokio::task::yield_now().await;
            self.0.lock().unwrap().push(item);
        }
    }

    #[tokio::test]
    async fn delivers_in_arrival_order() {
        for capacity in [None, Some(128)] {
            let (tx, rx) = channel("test", capacity);
            for i in 0..100 {
                tx.send(i).unwrap();
            }
            drop(tx);

            let seen = Arc::new(Mutex::new(Vec::new()));
            rx.run(Collect(Arc::clone(&seen))).await;

            assert_eq!(*seen.lock().unwrap(), (0..100).collect::<Vec<_>>());
        }
    }

    #[tokio::test]
    async fn bounded_channel_reports_full() {
        let (tx, _rx) = channel("small", Some(1));
        tx.send(1).unwrap();
        assert_eq!(tx.send(2), Err(ChannelError::Full { name: "small" }));
    }

    #[tokio::test]
    async fn send_after_consumer_dropped_is_closed() {
        let (tx, rx) = channel::<u32>("gone", None);
        drop(rx);
        assert!(tx.is_closed());
        assert_eq!(tx.send(1), Err(ChannelError::Closed { name: "gone" }));
        assert_eq!(
            tx.send_wait(1).await,
            Err(ChannelError::Closed { name: "gone" })
        );
    }

    #[tokio::test]
    async fn send_wait_waits_for_capacity() {
        let (tx, mut rx) = channel("wait", Some(1));
        tx.send(1).unwrap();

        let sender = tokio::spawn({
            let tx = tx.clone();
            async move { tx.send_wait(2).await }
        });

        assert_eq!(rx.recv().await, Some(1));
        assert_eq!(sender.await.unwrap(), Ok(()));
        assert_eq!(rx.recv().await, Some(2));
    }

    #[test]
    fn router_names_channels() {
        let router: Router<u8, u8> = Router::new(None);
        assert_eq!(router.inbound_tx.name(), INBOUND_CHANNEL);
        assert_eq!(router.outbound_tx.name(), OUTBOUND_CHANNEL);
    }
}
