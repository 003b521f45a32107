/*!
A bridge that moves messages between an application and an MQTT topic while keeping the
distributed trace intact across the hop.

MQTT has no native notion of tracing, so the bridge carries a W3C-style `traceparent` token
in the message metadata:

 * **outbound**: [`outbound::OutboundBridge::publish`] opens a `send-mqtt` span, writes its
   identifiers into the `traceparent` header, and hands the message to the broker client
   without waiting for broker confirmation.
 * **inbound**: [`inbound::InboundBridge`] decodes the header, runs the application
   [`inbound::MessageHandler`] inside a `receive-mqtt` child span of the producer's span, and
   acknowledges the delivery only after the handler returned and the span ended.

Tracing is best effort. A missing or malformed `traceparent` is logged and the message is
processed untraced; it never causes a delivery failure.

The ambient pieces come from the same stack as any other service:
 * command line parsing (via clap)
 * config file generation and loading (via doku & figment)
 * environment variable overrides for configs
 * logging & tracing & metrics (via tracing & opentelemetry)

### Running a bridge

```rust,no_run
use std::sync::Arc;

use mqtt_trace_bridge::bridge::Bridge;
use mqtt_trace_bridge::broker::MemoryBroker;
use mqtt_trace_bridge::inbound::LoggingHandler;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let service_info = mqtt_trace_bridge::service_info!();
    let cli = mqtt_trace_bridge::cli::Cli::<mqtt_trace_bridge::cli::NoArguments>::new(
        &service_info,
        "BRIDGE_",
    );
    let _telemetry = mqtt_trace_bridge::telemetry::init(&service_info, &cli.settings.telemetry)?;

    let broker = Arc::new(MemoryBroker::new());
    let running = Bridge::new(broker, cli.settings.bridge)
        .start(LoggingHandler)
        .await?;

    running.publisher().publish("topic1", "hello")?;
    running.shutdown().await;
    Ok(())
}
```

### Override config value via environment values

Nested settings are overridden by replacing the dot (`.`) with double underscores (`__`):
```sh
BRIDGE_BRIDGE__INBOUND_TOPIC='sensors/#' ./bridge --config ./bridge.toml
```

`./bridge --generate ./bridge.toml` writes a commented sample config.
*/
#![deny(
    future_incompatible,
    deprecated_safe,
    rust_2018_compatibility,
    rust_2018_idioms,
    rust_2021_compatibility
)]
#![deny(missing_docs)]

pub mod bridge;
pub mod broker;
pub mod cli;
pub mod codec;
pub mod config;
pub mod inbound;
pub mod message;
pub mod metrics;
pub mod outbound;
pub mod router;
pub mod telemetry;
pub mod tracer;

/// Configuration loading errors
#[derive(Debug, snafu::Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    /// Figment could not extract a config from the file with env overrides
    #[snafu(display("Could not load application configuration: {source}"))]
    ConfigLoad {
        /// The source figment error
        source: Box<figment::Error>,
    },

    /// A config file was requested but does not exist
    #[snafu(display("Config file {path:?} does not exist"))]
    ConfigFileMissing {
        /// the requested path
        path: std::path::PathBuf,
    },

    /// Writing to the config file was not possible
    #[snafu(display("Could not write to the config file at {path:?}: {source}"))]
    ConfigFileWrite {
        /// path where the config file was trying to be written to
        path: std::path::PathBuf,
        /// the IO error that occurred
        source: std::io::Error,
    },
}

/// Global memory allocator backed by [jemalloc].
///
/// Only present with the **jemalloc** feature, in which case every allocation of the
/// bridge process goes through it.
///
/// [jemalloc]: https://github.com/jemalloc/jemalloc
#[cfg(feature = "jemalloc")]
#[global_allocator]
pub static JEMALLOC_MEMORY_ALLOCATOR: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

/// Service information collected from the build.
#[derive(Clone, Debug, Default)]
pub struct ServiceInfo {
    /// The name of the service.
    pub name: &'static str,

    /// The service identifier as used in telemetry.
    ///
    /// Usually the same as [`ServiceInfo::name`], with hyphens (`-`) replaced by underscores `_`.
    pub name_in_metrics: String,

    /// The version of the service.
    pub version: &'static str,

    /// Service author.
    pub author: &'static str,

    /// The description of the service.
    pub description: &'static str,
}

/**
Creates [`ServiceInfo`] from the `Cargo.toml` manifest of the crate invoking it.

The name becomes the telemetry `service.name` and the CLI program name.
```rust
let info = mqtt_trace_bridge::service_info!();
assert_eq!(info.name, "mqtt-trace-bridge");
assert_eq!(info.name_in_metrics, "mqtt_trace_bridge");
```
*/
#[macro_export]
macro_rules! service_info {
    () => {
        $crate::ServiceInfo {
            name: env!("CARGO_PKG_NAME"),
            name_in_metrics: env!("CARGO_PKG_NAME").replace("-", "_"),
            version: env!("CARGO_PKG_VERSION"),
            author: env!("CARGO_PKG_AUTHORS"),
            description: env!("CARGO_PKG_DESCRIPTION"),
        }
    };
}
