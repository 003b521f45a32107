//! # Outbound Bridge
//!
//! [`OutboundBridge::publish`] opens a `send-mqtt` span, writes that span's own identifiers
//! into the `traceparent` header, queues the message on the outbound channel and ends the
//! span. Broker confirmation is never awaited: the span covers the hand-off, not delivery.
//!
//! [`OutboundDispatcher`] is the outbound channel's consumer. It strips the destination
//! topic header and hands each message to the [`BrokerClient`] with the configured QoS.
//! Broker failures surface here, as log lines and metrics, since the caller has already
//! moved on.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use opentelemetry::trace::{SpanKind, TraceContextExt as _, Tracer};
use opentelemetry::{Context, KeyValue};
use snafu::{ResultExt as _, Snafu};
use tracing::{debug, error, warn};

use crate::broker::{BrokerClient, BrokerError, QoS};
use crate::codec::{self, TraceContext};
use crate::message::{BridgedMessage, HeaderValue, Headers, DESTINATION_TOPIC, TRACEPARENT};
use crate::metrics::BridgeMetrics;
use crate::router::{ChannelError, ChannelHandler, ChannelSender};
use crate::tracer::{
    SpanGuard, MESSAGING_DESTINATION, MESSAGING_SYSTEM, MESSAGING_SYSTEM_MQTT, SEND_SPAN_NAME,
};

/// Failures of [`OutboundBridge::publish`].
#[derive(Debug, Snafu, Clone, PartialEq, Eq)]
pub enum PublishError {
    /// The outbound channel did not accept the message
    #[snafu(display("could not hand message for {topic} to the broker client: {source}"))]
    Enqueue {
        /// destination topic of the rejected message
        topic: String,
        /// why the channel refused it
        source: ChannelError,
    },
}

/// A publish triggered by some upstream request whose metadata should travel along.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PublishRequest {
    /// Destination topic
    pub topic: String,
    /// Message body
    pub payload: Bytes,
    /// Metadata copied onto the outgoing message before the bridge's own keys
    pub headers: Headers,
}

impl PublishRequest {
    /// A request with no extra metadata.
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            headers: Headers::new(),
        }
    }
}

/// Traced publish entry point. Clones share the tracer and the outbound channel, so any
/// number of tasks can publish concurrently.
pub struct OutboundBridge<T> {
    tracer: Arc<T>,
    sender: ChannelSender<BridgedMessage>,
    metrics: BridgeMetrics,
}

impl<T> Clone for OutboundBridge<T> {
    fn clone(&self) -> Self {
        Self {
            tracer: Arc::clone(&self.tracer),
            sender: self.sender.clone(),
            metrics: self.metrics.clone(),
        }
    }
}

impl<T> OutboundBridge<T>
where
    T: Tracer + Send + Sync,
    T::Span: Send + Sync + 'static,
{
    /// A bridge that queues onto `sender`.
    pub fn new(tracer: T, sender: ChannelSender<BridgedMessage>) -> Self {
        Self {
            tracer: Arc::new(tracer),
            sender,
            metrics: BridgeMetrics::global(),
        }
    }

    /// Replaces the metrics sink.
    pub fn with_metrics(mut self, metrics: BridgeMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    /// Publishes `payload` to `topic`, parented on the caller's current context.
    ///
    /// Returns the identifiers written into the `traceparent` header.
    ///
    /// # Errors
    /// - `Enqueue` if the outbound channel is closed or full. The span is still ended.
    pub fn publish(
        &self,
        topic: impl Into<String>,
        payload: impl Into<Bytes>,
    ) -> Result<TraceContext, PublishError> {
        self.publish_request(&Context::current(), PublishRequest::new(topic, payload))
    }

    /// Like [`OutboundBridge::publish`] with an explicit parent context, e.g. the one an
    /// inbound handler receives.
    ///
    /// # Errors
    /// - `Enqueue` if the outbound channel is closed or full.
    pub fn publish_in(
        &self,
        parent: &Context,
        topic: impl Into<String>,
        payload: impl Into<Bytes>,
    ) -> Result<TraceContext, PublishError> {
        self.publish_request(parent, PublishRequest::new(topic, payload))
    }

    /// Publishes `request`, keeping its metadata.
    ///
    /// # Errors
    /// - `Enqueue` if the outbound channel is closed or full.
    pub fn publish_request(
        &self,
        parent: &Context,
        request: PublishRequest,
    ) -> Result<TraceContext, PublishError> {
        let PublishRequest {
            topic,
            payload,
            mut headers,
        } = request;

        let span = self
            .tracer
            .span_builder(SEND_SPAN_NAME)
            .with_kind(SpanKind::Producer)
            .with_attributes([
                KeyValue::new(MESSAGING_SYSTEM, MESSAGING_SYSTEM_MQTT),
                KeyValue::new(MESSAGING_DESTINATION, topic.clone()),
            ])
            .start_with_context(&*self.tracer, parent);
        let guard = SpanGuard::new(parent.with_span(span));

        let context = guard.trace_context();
        headers.insert(DESTINATION_TOPIC, topic.clone());
        headers.insert(TRACEPARENT, codec::encode(&context));
        let message = BridgedMessage { payload, headers };

        if let Err(err) = self.sender.send(message) {
            guard.set_error(err.to_string());
            return Err(err).context(EnqueueSnafu { topic });
        }

        debug!(%topic, traceparent = %context, "message handed to broker client");
        Ok(context)
    }
}

/// Consumer of the outbound channel: forwards each message to the broker client.
pub struct OutboundDispatcher<B> {
    broker: Arc<B>,
    default_topic: String,
    qos: QoS,
    metrics: BridgeMetrics,
}

impl<B: BrokerClient> OutboundDispatcher<B> {
    /// Publishes with `qos`; messages without a destination topic go to `default_topic`.
    pub fn new(broker: Arc<B>, default_topic: impl Into<String>, qos: QoS) -> Self {
        Self {
            broker,
            default_topic: default_topic.into(),
            qos,
            metrics: BridgeMetrics::global(),
        }
    }

    /// Replaces the metrics sink.
    pub fn with_metrics(mut self, metrics: BridgeMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    /// Sends one message to the broker client.
    ///
    /// The destination topic header is consumed here and not forwarded.
    ///
    /// # Errors
    /// Whatever the broker client reports.
    pub async fn dispatch(&self, mut message: BridgedMessage) -> Result<String, BrokerError> {
        let topic = match message.headers.remove(DESTINATION_TOPIC) {
            Some(HeaderValue::Text(topic)) => topic,
            Some(other) => {
                warn!(
                    topic = %other,
                    default_topic = %self.default_topic,
                    "destination topic is not a string, using the default topic"
                );
                self.default_topic.clone()
            }
            None => self.default_topic.clone(),
        };

        self.broker
            .publish(&topic, message.payload, message.headers, self.qos)
            .await?;
        Ok(topic)
    }
}

#[async_trait]
impl<B: BrokerClient> ChannelHandler<BridgedMessage> for OutboundDispatcher<B> {
    async fn handle(&self, message: BridgedMessage) {
        let topic = message
            .topic()
            .unwrap_or(self.default_topic.as_str())
            .to_string();
        match self.dispatch(message).await {
            Ok(topic) => {
                self.metrics.message_published(&topic);
                debug!(%topic, qos = self.qos.level(), "message published");
            }
            Err(err) => {
                self.metrics.publish_failed(&topic);
                error!(%topic, error = %err, "failed to publish message");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use opentelemetry::trace::noop::NoopTracer;

    use super::*;
    use crate::broker::MemoryBroker;
    use crate::router::{channel, OUTBOUND_CHANNEL};

    #[test]
    fn publish_sets_topic_and_traceparent() {
        let (tx, mut rx) = channel(OUTBOUND_CHANNEL, None);
        let bridge = OutboundBridge::new(NoopTracer::new(), tx);

        let context = bridge.publish("topic1", "hello").unwrap();

        let message = rx.try_recv().unwrap();
        assert_eq!(message.topic(), Some("topic1"));
        assert_eq!(message.payload_text(), "hello");
        let expected = HeaderValue::from(codec::encode(&context));
        assert_eq!(message.headers.get(TRACEPARENT), Some(&expected));
    }

    #[test]
    fn request_headers_are_copied_and_traceparent_replaced() {
        let (tx, mut rx) = channel(OUTBOUND_CHANNEL, None);
        let bridge = OutboundBridge::new(NoopTracer::new(), tx);
        let mut request = PublishRequest::new("t", "x");
        request.headers.insert("content-type", "text/plain");
        request.headers.insert(TRACEPARENT, "stale");

        bridge.publish_request(&Context::new(), request).unwrap();

        let message = rx.try_recv().unwrap();
        let content_type = HeaderValue::from("text/plain");
        let stale = HeaderValue::from("stale");
        assert_eq!(message.headers.get("content-type"), Some(&content_type));
        assert_ne!(message.headers.get(TRACEPARENT), Some(&stale));
    }

    #[test]
    fn closed_channel_is_reported() {
        let (tx, rx) = channel(OUTBOUND_CHANNEL, None);
        drop(rx);
        let bridge = OutboundBridge::new(NoopTracer::new(), tx);

        let err = bridge.publish("t", "x").unwrap_err();

        assert_eq!(
            err,
            PublishError::Enqueue {
                topic: "t".to_string(),
                source: ChannelError::Closed {
                    name: OUTBOUND_CHANNEL
                },
            }
        );
    }

    #[tokio::test]
    async fn dispatcher_strips_topic_header() {
        let broker = Arc::new(MemoryBroker::new());
        let dispatcher = OutboundDispatcher::new(Arc::clone(&broker), "fallback", QoS::AtLeastOnce);
        let message = BridgedMessage::new("x")
            .with_header(DESTINATION_TOPIC, "sensors/1")
            .with_header(TRACEPARENT, "00-abc-def-01");

        dispatcher.handle(message).await;

        let published = broker.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].topic, "sensors/1");
        assert_eq!(published[0].qos, QoS::AtLeastOnce);
        let headers = &published[0].message.headers;
        assert!(headers.get(DESTINATION_TOPIC).is_none());
        assert!(headers.get(TRACEPARENT).is_some());
    }

    #[tokio::test]
    async fn dispatcher_falls_back_to_default_topic() {
        let broker = Arc::new(MemoryBroker::new());
        let dispatcher = OutboundDispatcher::new(Arc::clone(&broker), "fallback", QoS::AtMostOnce);

        let topic = dispatcher.dispatch(BridgedMessage::new("x")).await.unwrap();

        assert_eq!(topic, "fallback");
        assert_eq!(broker.published()[0].topic, "fallback");
    }

    #[tokio::test]
    async fn dispatcher_reports_broker_failure() {
        let broker = Arc::new(MemoryBroker::new());
        broker.fail_publishes(true);
        let dispatcher = OutboundDispatcher::new(Arc::clone(&broker), "fallback", QoS::AtMostOnce);

        let message = BridgedMessage::new("x");
        let err = dispatcher.dispatch(message).await.unwrap_err();
        assert!(matches!(err, BrokerError::Publish { .. }));

        // The channel consumer swallows the failure after logging it.
        dispatcher.handle(BridgedMessage::new("y")).await;
        assert!(broker.published().is_empty());
    }
}
