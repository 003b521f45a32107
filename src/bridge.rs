//! # Bridge wiring
//!
//! [`Bridge::start`] subscribes to the inbound topic and spawns three tasks:
//!
//! 1. a forwarder moving transport deliveries into the inbound channel,
//! 2. the inbound channel consumer running an [`InboundBridge`],
//! 3. the outbound channel consumer running an [`OutboundDispatcher`].
//!
//! The returned [`RunningBridge`] hands out [`OutboundBridge`] publishers and stops the
//! tasks in dependency order on [`RunningBridge::shutdown`].

use std::sync::Arc;

use opentelemetry::global::BoxedTracer;
use opentelemetry::trace::Tracer;
use snafu::{ResultExt as _, Snafu};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broker::{BrokerClient, BrokerError, Delivery, Subscription};
use crate::config::BridgeSettings;
use crate::inbound::{InboundBridge, MessageHandler};
use crate::message::BridgedMessage;
use crate::metrics::BridgeMetrics;
use crate::outbound::{OutboundBridge, OutboundDispatcher};
use crate::router::{ChannelSender, Router};
use crate::tracer;

/// Failures while starting a bridge.
#[derive(Debug, Snafu)]
pub enum Error {
    /// The inbound subscription was refused
    #[snafu(display("could not subscribe to {topic}: {source}"))]
    Subscribe {
        /// the configured topic filter
        topic: String,
        /// broker client error
        source: BrokerError,
    },
}

/// A configured, not yet started bridge.
pub struct Bridge<B> {
    broker: Arc<B>,
    settings: BridgeSettings,
    metrics: BridgeMetrics,
}

impl<B: BrokerClient> Bridge<B> {
    /// Bridges between the application and `broker` as described by `settings`.
    pub fn new(broker: Arc<B>, settings: BridgeSettings) -> Self {
        Self {
            broker,
            settings,
            metrics: BridgeMetrics::global(),
        }
    }

    /// Replaces the metrics sink of both directions.
    pub fn with_metrics(mut self, metrics: BridgeMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    /// Starts the bridge with the globally installed tracer.
    ///
    /// # Errors
    /// - `Subscribe` if the broker client refuses the inbound subscription.
    pub async fn start<H>(self, handler: H) -> Result<RunningBridge<BoxedTracer>, Error>
    where
        H: MessageHandler + 'static,
    {
        self.start_with_tracer(tracer::global_tracer, handler).await
    }

    /// Starts the bridge with tracers built by `make_tracer`, one per direction.
    ///
    /// # Errors
    /// - `Subscribe` if the broker client refuses the inbound subscription.
    pub async fn start_with_tracer<T, F, H>(
        self,
        make_tracer: F,
        handler: H,
    ) -> Result<RunningBridge<T>, Error>
    where
        T: Tracer + Send + Sync + 'static,
        T::Span: Send + Sync + 'static,
        F: Fn() -> T,
        H: MessageHandler + 'static,
    {
        let Self {
            broker,
            settings,
            metrics,
        } = self;

        let subscription = broker
            .subscribe(&settings.inbound_topic, settings.inbound_qos)
            .await
            .context(SubscribeSnafu {
                topic: settings.inbound_topic.clone(),
            })?;

        let router: Router<Delivery, BridgedMessage> = Router::new(settings.channel_capacity);
        let Router {
            inbound_tx,
            inbound_rx,
            outbound_tx,
            outbound_rx,
        } = router;

        let shutdown = CancellationToken::new();
        let forwarder = tokio::spawn(forward(subscription, inbound_tx, shutdown.clone()));

        let inbound = InboundBridge::new(make_tracer(), handler).with_metrics(metrics.clone());
        let inbound_task = tokio::spawn(inbound_rx.run(inbound));

        let dispatcher = OutboundDispatcher::new(
            Arc::clone(&broker),
            settings.default_topic.clone(),
            settings.outbound_qos,
        )
        .with_metrics(metrics.clone());
        let outbound_task = tokio::spawn(outbound_rx.run(dispatcher));

        let publisher = OutboundBridge::new(make_tracer(), outbound_tx).with_metrics(metrics);

        info!(
            inbound_topic = %settings.inbound_topic,
            inbound_qos = settings.inbound_qos.level(),
            default_topic = %settings.default_topic,
            outbound_qos = settings.outbound_qos.level(),
            "bridge started"
        );

        Ok(RunningBridge {
            publisher,
            shutdown,
            forwarder,
            inbound_task,
            outbound_task,
        })
    }
}

/// Moves deliveries into the inbound channel until the subscription ends or `shutdown` is
/// cancelled. After cancellation the subscription is closed and whatever the transport had
/// already buffered is still forwarded.
async fn forward(
    mut subscription: Subscription,
    inbound_tx: ChannelSender<Delivery>,
    shutdown: CancellationToken,
) {
    loop {
        let delivery = tokio::select! {
            () = shutdown.cancelled() => break,
            delivery = subscription.recv() => delivery,
        };
        let Some(delivery) = delivery else {
            debug!("inbound subscription ended");
            return;
        };
        if let Err(err) = inbound_tx.send_wait(delivery).await {
            warn!(error = %err, "inbound consumer stopped, dropping subscription");
            return;
        }
    }

    subscription.close();
    let mut drained = 0_usize;
    while let Some(delivery) = subscription.recv().await {
        if let Err(err) = inbound_tx.send_wait(delivery).await {
            warn!(error = %err, "inbound consumer stopped while draining subscription");
            return;
        }
        drained += 1;
    }
    debug!(drained, "inbound subscription closed");
}

/// Handle to the tasks of a started bridge.
pub struct RunningBridge<T> {
    publisher: OutboundBridge<T>,
    shutdown: CancellationToken,
    forwarder: JoinHandle<()>,
    inbound_task: JoinHandle<()>,
    outbound_task: JoinHandle<()>,
}

impl<T> RunningBridge<T>
where
    T: Tracer + Send + Sync,
    T::Span: Send + Sync + 'static,
{
    /// A publisher feeding the outbound channel. Clone it freely.
    pub fn publisher(&self) -> OutboundBridge<T> {
        self.publisher.clone()
    }

    /// Stops the bridge.
    ///
    /// The subscription is closed first. Deliveries it had already buffered, the one being
    /// handed to the inbound channel and those queued in it are all still handled and
    /// acknowledged. Then every queued outbound message is handed to the broker client.
    /// Returns once all publisher clones have been dropped and the outbound channel is drained.
    pub async fn shutdown(self) {
        let Self {
            publisher,
            shutdown,
            forwarder,
            inbound_task,
            outbound_task,
        } = self;

        shutdown.cancel();
        if let Err(err) = forwarder.await {
            warn!(error = %err, "inbound forwarder ended abnormally");
        }
        if let Err(err) = inbound_task.await {
            warn!(error = %err, "inbound consumer ended abnormally");
        }

        drop(publisher);
        if let Err(err) = outbound_task.await {
            warn!(error = %err, "outbound consumer ended abnormally");
        }
        info!("bridge stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use bytes::Bytes;
    use opentelemetry::trace::noop::NoopTracer;
    use opentelemetry::Context;
    use tokio::sync::Semaphore;

    use super::*;
    use crate::broker::{MemoryBroker, QoS};
    use crate::inbound::HandlerError;
    use crate::message::Headers;

    #[derive(Default)]
    struct Collect(Mutex<Vec<String>>);

    #[async_trait]
    impl MessageHandler for Collect {
        async fn handle(
            &self,
            _cx: &Context,
            message: &BridgedMessage,
        ) -> Result<(), HandlerError> {
            let text = message.payload_text().into_owned();
            self.0.lock().unwrap().push(text);
            Ok(())
        }
    }

    /// Waits for a permit before collecting each message.
    struct Gated {
        gate: Semaphore,
        collected: Collect,
    }

    #[async_trait]
    impl MessageHandler for Gated {
        async fn handle(&self, cx: &Context, message: &BridgedMessage) -> Result<(), HandlerError> {
            self.gate.acquire().await?.forget();
            self.collected.handle(cx, message).await
        }
    }

    struct Refusing;

    #[async_trait]
    impl BrokerClient for Refusing {
        async fn subscribe(
            &self,
            _topic_filter: &str,
            _qos: QoS,
        ) -> Result<Subscription, BrokerError> {
            Err(BrokerError::Disconnected)
        }

        async fn publish(
            &self,
            _topic: &str,
            _payload: Bytes,
            _headers: Headers,
            _qos: QoS,
        ) -> Result<(), BrokerError> {
            Err(BrokerError::Disconnected)
        }
    }

    #[tokio::test]
    async fn subscription_failure_is_reported() {
        let bridge = Bridge::new(Arc::new(Refusing), BridgeSettings::default());

        let err = bridge
            .start_with_tracer(NoopTracer::new, Collect::default())
            .await
            .err()
            .unwrap();

        assert_eq!(
            err.to_string(),
            "could not subscribe to topic1: broker client is disconnected"
        );
    }

    #[tokio::test]
    async fn published_messages_loop_back_and_are_acknowledged() {
        let broker = Arc::new(MemoryBroker::new());
        let handler = Arc::new(Collect::default());
        let running = Bridge::new(Arc::clone(&broker), BridgeSettings::default())
            .start_with_tracer(NoopTracer::new, Arc::clone(&handler))
            .await
            .unwrap();

        let publisher = running.publisher();
        for payload in ["one", "two", "three"] {
            publisher.publish("topic1", payload).unwrap();
        }
        drop(publisher);

        while broker.acked().len() < 3 {
            tokio::task::yield_now().await;
        }
        running.shutdown().await;

        assert_eq!(*handler.0.lock().unwrap(), vec!["one", "two", "three"]);
        assert_eq!(broker.published().len(), 3);
        assert!(broker.published().iter().all(|p| p.qos == QoS::AtMostOnce));
    }

    #[tokio::test]
    async fn shutdown_handles_deliveries_still_buffered_by_the_transport() {
        let broker = Arc::new(MemoryBroker::new());
        let handler = Arc::new(Gated {
            gate: Semaphore::new(0),
            collected: Collect::default(),
        });
        let settings = BridgeSettings {
            channel_capacity: Some(1),
            ..BridgeSettings::default()
        };
        let running = Bridge::new(Arc::clone(&broker), settings)
            .start_with_tracer(NoopTracer::new, Arc::clone(&handler))
            .await
            .unwrap();

        let payloads = ["a", "b", "c", "d", "e", "f"];
        for payload in payloads {
            broker
                .publish("topic1", payload.into(), Headers::new(), QoS::ExactlyOnce)
                .await
                .unwrap();
        }
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        // The handler holds the first delivery and the channel is full, so the rest are
        // still with the forwarder or buffered in the subscription.
        assert!(broker.acked().is_empty());

        handler.gate.add_permits(payloads.len());
        running.shutdown().await;

        assert_eq!(broker.acked().len(), payloads.len());
        assert_eq!(*handler.collected.0.lock().unwrap(), payloads);
    }

    #[tokio::test]
    async fn shutdown_without_traffic_returns() {
        let broker = Arc::new(MemoryBroker::new());
        let running = Bridge::new(broker, BridgeSettings::default())
            .start_with_tracer(NoopTracer::new, Collect::default())
            .await
            .unwrap();

        running.shutdown().await;
    }
}
