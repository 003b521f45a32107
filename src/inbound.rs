//! # Inbound Bridge
//!
//! Receives deliveries from the broker, recovers the producer's trace context from the
//! `traceparent` header, runs the application handler inside a `receive-mqtt` child span of
//! that context, ends the span, and only then acknowledges the delivery.
//!
//! Trace context is best effort. A missing, mistyped or undecodable header is logged and
//! the handler runs untraced; it never blocks delivery.

use std::sync::Arc;

use async_trait::async_trait;
use opentelemetry::trace::{FutureExt as _, SpanKind, TraceContextExt as _, Tracer};
use opentelemetry::{Context, KeyValue};
use snafu::Snafu;
use tracing::{debug, info, warn};

use crate::broker::{BrokerError, Delivery};
use crate::codec;
use crate::message::{BridgedMessage, HeaderValue, TRACEPARENT};
use crate::metrics::BridgeMetrics;
use crate::router::ChannelHandler;
use crate::tracer::{
    self, SpanGuard, MESSAGING_DESTINATION, MESSAGING_SYSTEM, MESSAGING_SYSTEM_MQTT,
    RECEIVE_SPAN_NAME,
};

/// Error type returned by application handlers.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Failures of one inbound delivery.
#[derive(Debug, Snafu)]
pub enum InboundError {
    /// The application handler failed; the delivery was still acknowledged
    #[snafu(display("inbound handler failed: {source}"))]
    Handler {
        /// the handler's error
        source: HandlerError,
    },

    /// The handler succeeded but the acknowledgment did not reach the broker
    #[snafu(display("could not acknowledge delivery: {source}"))]
    Acknowledge {
        /// the broker client's error
        source: BrokerError,
    },
}

/// Application logic run for every inbound message.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Processes `message`.
    ///
    /// `cx` carries the `receive-mqtt` span when the message was traced. The same context is
    /// also current while the handler is polled, so [`crate::outbound::OutboundBridge::publish`]
    /// continues the trace on a reply without passing `cx` along.
    async fn handle(&self, cx: &Context, message: &BridgedMessage) -> Result<(), HandlerError>;
}

#[async_trait]
impl<H: MessageHandler + ?Sized> MessageHandler for Arc<H> {
    async fn handle(&self, cx: &Context, message: &BridgedMessage) -> Result<(), HandlerError> {
        (**self).handle(cx, message).await
    }
}

/// Handler that only logs what it receives.
#[derive(Clone, Copy, Debug, Default)]
pub struct LoggingHandler;

#[async_trait]
impl MessageHandler for LoggingHandler {
    async fn handle(&self, _cx: &Context, message: &BridgedMessage) -> Result<(), HandlerError> {
        info!(
            payload = %message.payload_text(),
            headers = message.headers.len(),
            "inbound handler received message"
        );
        Ok(())
    }
}

/// Runs a [`MessageHandler`] under the trace context carried by each message.
pub struct InboundBridge<T, H> {
    tracer: T,
    handler: H,
    metrics: BridgeMetrics,
}

impl<T, H> InboundBridge<T, H>
where
    T: Tracer + Send + Sync,
    T::Span: Send + Sync + 'static,
    H: MessageHandler,
{
    /// A bridge recording to the global meter.
    pub fn new(tracer: T, handler: H) -> Self {
        Self {
            tracer,
            handler,
            metrics: BridgeMetrics::global(),
        }
    }

    /// Replaces the metrics sink.
    pub fn with_metrics(mut self, metrics: BridgeMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    /// Handles one message, traced when it carries a usable `traceparent`.
    ///
    /// The `receive-mqtt` span is ended before this returns, on success and on failure.
    ///
    /// # Errors
    /// Whatever the handler returns, unchanged.
    pub async fn on_message(&self, message: &BridgedMessage) -> Result<(), HandlerError> {
        self.process(None, message).await
    }

    /// Handles one delivery and acknowledges it afterwards, whatever the handler returned.
    ///
    /// # Errors
    /// - `Handler` if the handler failed. The delivery has been acknowledged regardless.
    /// - `Acknowledge` if the handler succeeded but the ack failed.
    pub async fn on_delivery(&self, delivery: Delivery) -> Result<(), InboundError> {
        self.metrics.message_received(&delivery.topic);
        let handled = self
            .process(Some(delivery.topic.as_str()), &delivery.message)
            .await;
        let topic = delivery.topic.clone();
        let acked = delivery.ack();

        match (handled, acked) {
            (Err(source), acked) => {
                self.metrics.handler_failed(&topic);
                if let Err(err) = acked {
                    warn!(%topic, error = %err, "could not acknowledge failed delivery");
                }
                Err(InboundError::Handler { source })
            }
            (Ok(()), Err(source)) => Err(InboundError::Acknowledge { source }),
            (Ok(()), Ok(())) => Ok(()),
        }
    }

    async fn process(
        &self,
        topic: Option<&str>,
        message: &BridgedMessage,
    ) -> Result<(), HandlerError> {
        let Some(parent) = self.remote_parent(message) else {
            return self.handler.handle(&Context::current(), message).await;
        };

        let mut attributes = vec![KeyValue::new(MESSAGING_SYSTEM, MESSAGING_SYSTEM_MQTT)];
        if let Some(topic) = topic {
            attributes.push(KeyValue::new(MESSAGING_DESTINATION, topic.to_string()));
        }
        let span = self
            .tracer
            .span_builder(RECEIVE_SPAN_NAME)
            .with_kind(SpanKind::Consumer)
            .with_attributes(attributes)
            .start_with_context(&self.tracer, &parent);
        let guard = SpanGuard::new(parent.with_span(span));

        let result = self
            .handler
            .handle(guard.context(), message)
            .with_context(guard.context().clone())
            .await;
        if let Err(err) = &result {
            guard.set_error(err.to_string());
        }
        drop(guard);
        drop(parent);

        result
    }

    fn remote_parent(&self, message: &BridgedMessage) -> Option<Context> {
        let token = match message.headers.get(TRACEPARENT)? {
            HeaderValue::Text(token) => token,
            other => {
                warn!(traceparent = %other, "failed to read traceparent as a string");
                self.metrics.trace_context_invalid();
                return None;
            }
        };

        let context = match codec::decode(token) {
            Ok(context) => context,
            Err(err) => {
                warn!(traceparent = %token, "{err}");
                self.metrics.trace_context_invalid();
                return None;
            }
        };

        let parent = tracer::remote_parent(&context);
        if parent.is_none() {
            warn!(traceparent = %token, "traceparent ids are not usable as a span context");
            self.metrics.trace_context_invalid();
        }
        parent
    }
}

#[async_trait]
impl<T, H> ChannelHandler<Delivery> for InboundBridge<T, H>
where
    T: Tracer + Send + Sync + 'static,
    T::Span: Send + Sync + 'static,
    H: MessageHandler + 'static,
{
    async fn handle(&self, delivery: Delivery) {
        let topic = delivery.topic.clone();
        match self.on_delivery(delivery).await {
            Ok(()) => debug!(%topic, "delivery processed and acknowledged"),
            Err(err) => warn!(%topic, error = %err, "delivery failed"),
        }
    }
}
