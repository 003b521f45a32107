//! Bridge counters, recorded through the OpenTelemetry meter API.

use opentelemetry::global;
use opentelemetry::metrics::{Counter, Meter};
use opentelemetry::KeyValue;

use crate::tracer::TRACER_NAME;

const TOPIC: &str = "messaging.destination.name";

/// Counters shared by both bridge directions. Cheap to clone.
#[derive(Clone, Debug)]
pub struct BridgeMetrics {
    received: Counter<u64>,
    published: Counter<u64>,
    publish_failures: Counter<u64>,
    invalid_trace_context: Counter<u64>,
    handler_failures: Counter<u64>,
}

impl BridgeMetrics {
    /// Creates the counters on `meter`.
    pub fn new(meter: &Meter) -> Self {
        Self {
            received: meter
                .u64_counter("bridge.messages.received")
                .with_description("Messages delivered to the inbound handler")
                .build(),
            published: meter
                .u64_counter("bridge.messages.published")
                .with_description("Messages accepted by the broker client")
                .build(),
            publish_failures: meter
                .u64_counter("bridge.messages.publish_failures")
                .with_description("Messages the broker client refused")
                .build(),
            invalid_trace_context: meter
                .u64_counter("bridge.trace_context.invalid")
                .with_description("Inbound traceparent values that could not be used")
                .build(),
            handler_failures: meter
                .u64_counter("bridge.handler.failures")
                .with_description("Inbound handler invocations that returned an error")
                .build(),
        }
    }

    /// Counters on the globally installed meter provider.
    pub fn global() -> Self {
        Self::new(&global::meter(TRACER_NAME))
    }

    pub(crate) fn message_received(&self, topic: &str) {
        self.received
            .add(1, &[KeyValue::new(TOPIC, topic.to_string())]);
    }

    pub(crate) fn message_published(&self, topic: &str) {
        self.published
            .add(1, &[KeyValue::new(TOPIC, topic.to_string())]);
    }

    pub(crate) fn publish_failed(&self, topic: &str) {
        self.publish_failures
            .add(1, &[KeyValue::new(TOPIC, topic.to_string())]);
    }

    pub(crate) fn trace_context_invalid(&self) {
        self.invalid_trace_context.add(1, &[]);
    }

    pub(crate) fn handler_failed(&self, topic: &str) {
        self.handler_failures
            .add(1, &[KeyValue::new(TOPIC, topic.to_string())]);
    }
}

impl Default for BridgeMetrics {
    fn default() -> Self {
        Self::global()
    }
}

#[cfg(test)]
mod tests {
    use opentelemetry::metrics::MeterProvider as _;
    use opentelemetry_sdk::metrics::{InMemoryMetricExporter, PeriodicReader, SdkMeterProvider};

    use super::*;

    #[test]
    fn every_counter_is_exported() {
        let exporter = InMemoryMetricExporter::default();
        let provider = SdkMeterProvider::builder()
            .with_reader(PeriodicReader::builder(exporter.clone()).build())
            .build();
        let metrics = BridgeMetrics::new(&provider.meter("bridge-test"));

        metrics.message_received("topic1");
        metrics.message_published("topic1");
        metrics.publish_failed("topic1");
        metrics.trace_context_invalid();
        metrics.handler_failed("topic1");
        provider.force_flush().unwrap();

        let mut names: Vec<String> = exporter
            .get_finished_metrics()
            .unwrap()
            .iter()
            .flat_map(|resource| resource.scope_metrics())
            .flat_map(|scope| scope.metrics())
            .map(|metric| metric.name().to_string())
            .collect();
        names.sort();
        names.dedup();

        assert_eq!(
            names,
            [
                "bridge.handler.failures",
                "bridge.messages.publish_failures",
                "bridge.messages.published",
                "bridge.messages.received",
                "bridge.trace_context.invalid",
            ]
        );
    }
}
