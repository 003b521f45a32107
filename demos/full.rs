//! Runs a bridge against the in-memory broker. Messages are published to the configured
//! default topic. When that topic matches the inbound topic filter, as it does with the
//! sample config, every message loops back through the subscription and is handled inside a
//! child span of its send span.
//!
//! ```sh
//! cargo run --example full -- --generate bridge.toml
//! cargo run --example full -- --config bridge.toml --count 3
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use clap::Parser;
use opentelemetry::Context;

use mqtt_trace_bridge::bridge::Bridge;
use mqtt_trace_bridge::broker::{topic_matches, MemoryBroker};
use mqtt_trace_bridge::inbound::{HandlerError, LoggingHandler, MessageHandler};
use mqtt_trace_bridge::message::BridgedMessage;

#[derive(Parser, Debug)]
/// Publishes a few traced messages through an in-memory MQTT broker
pub struct Arguments {
    /// how many messages to publish
    #[arg(short = 'n', long, default_value_t = 5)]
    pub count: usize,
}

/// Logs each message, then hands off to the default logging handler.
struct Echo;

#[async_trait]
impl MessageHandler for Echo {
    async fn handle(&self, cx: &Context, message: &BridgedMessage) -> Result<(), HandlerError> {
        tracing::info!(topic = ?message.topic(), "echo handler invoked");
        LoggingHandler.handle(cx, message).await
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let service_info = mqtt_trace_bridge::service_info!();
    let cli = mqtt_trace_bridge::cli::Cli::<Arguments>::new(&service_info, "BRIDGE_");

    let _telemetry = mqtt_trace_bridge::telemetry::init(&service_info, &cli.settings.telemetry)?;

    let broker = Arc::new(MemoryBroker::new());
    let topic = cli.settings.bridge.default_topic.clone();
    let loops_back = topic_matches(&cli.settings.bridge.inbound_topic, &topic);
    let running = Bridge::new(Arc::clone(&broker), cli.settings.bridge)
        .start(Echo)
        .await?;

    let publisher = running.publisher();
    for i in 0..cli.args.count {
        let written = publisher.publish(topic.as_str(), format!("message {i}"))?;
        tracing::info!(traceparent = %written, "published");
    }
    drop(publisher);

    if !loops_back {
        tracing::info!(%topic, "default topic is outside the inbound filter, nothing comes back");
        running.shutdown().await;
        return Ok(());
    }

    let settled = tokio::time::timeout(std::time::Duration::from_secs(5), async {
        while broker.acked().len() < cli.args.count {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    })
    .await;
    if settled.is_err() {
        tracing::warn!(acked = broker.acked().len(), "not every message came back");
    }
    running.shutdown().await;

    Ok(())
}
