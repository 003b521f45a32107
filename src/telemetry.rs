//! Logging, trace and metric export for the bridge process.
//!
//! [`init`] installs a `tracing` subscriber that always logs to the console and, for every
//! configured OTLP endpoint, exports logs, spans or metrics over gRPC. The SDK tracer and
//! meter providers are also installed globally, which is where
//! [`crate::tracer::global_tracer`] and [`crate::metrics::BridgeMetrics::global`] find them.

use doku::Document;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{global, KeyValue};
use opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge;
use opentelemetry_otlp::{
    ExporterBuildError, LogExporter, MetricExporter, SpanExporter, WithExportConfig as _,
};
use opentelemetry_sdk::logs::SdkLoggerProvider;
use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};
use opentelemetry_sdk::trace::SdkTracerProvider;
use opentelemetry_sdk::Resource;
use opentelemetry_semantic_conventions::resource::SERVICE_VERSION;
use serde::{Deserialize, Serialize};
use snafu::{ResultExt as _, Snafu};
use tracing_subscriber::filter::Directive;
use tracing_subscriber::prelude::*;
use tracing_subscriber::util::TryInitError;
use tracing_subscriber::EnvFilter;

use crate::tracer::TRACER_NAME;
use crate::ServiceInfo;

/// Telemetry initialization failures.
#[derive(Debug, Snafu)]
pub enum Error {
    /// The OTLP log exporter could not be built
    #[snafu(display("could not build the OTLP log exporter: {source}"))]
    InitLog {
        /// exporter error
        source: ExporterBuildError,
    },

    /// The OTLP metric exporter could not be built
    #[snafu(display("could not build the OTLP metric exporter: {source}"))]
    InitMetric {
        /// exporter error
        source: ExporterBuildError,
    },

    /// The OTLP span exporter could not be built
    #[snafu(display("could not build the OTLP span exporter: {source}"))]
    InitTrace {
        /// exporter error
        source: ExporterBuildError,
    },

    /// A global `tracing` subscriber was already installed
    #[snafu(display("a global tracing subscriber is already installed: {source}"))]
    InitSubscriber {
        /// subscriber error
        source: TryInitError,
    },
}

/// Metric export.
#[derive(Clone, Debug, Default, Serialize, Deserialize, Document)]
pub struct MetricSettings {
    /// OTLP gRPC endpoint; metrics are not exported when absent
    #[doku(example = "http://localhost:4317")]
    pub endpoint: Option<String>,
}

/// Log output.
#[derive(Clone, Debug, Serialize, Deserialize, Document)]
pub struct LogSettings {
    /// `EnvFilter` directives for the console
    #[doku(example = "info,mqtt_trace_bridge=debug")]
    pub console_level: String,

    /// `EnvFilter` directives for logs exported over OTLP
    #[doku(example = "warn,mqtt_trace_bridge=info")]
    pub otel_level: String,

    /// OTLP gRPC endpoint; logs are only printed when absent
    #[doku(example = "http://localhost:4317")]
    pub endpoint: Option<String>,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            console_level: "info".to_string(),
            otel_level: "info".to_string(),
            endpoint: None,
        }
    }
}

/// Span export.
#[derive(Clone, Debug, Default, Serialize, Deserialize, Document)]
pub struct TraceSettings {
    /// OTLP gRPC endpoint; spans are not exported when absent
    #[doku(example = "http://localhost:4317")]
    pub endpoint: Option<String>,
}

/// All telemetry settings.
#[derive(Clone, Debug, Default, Serialize, Deserialize, Document)]
pub struct TelemetrySettings {
    /// Span export
    pub trace: TraceSettings,
    /// Log output
    pub log: LogSettings,
    /// Metric export
    pub metric: MetricSettings,
}

/// Keeps the exporters alive; flushes and shuts them down on drop.
#[must_use = "telemetry stops exporting when this is dropped"]
pub struct Telemetry {
    tracer_provider: Option<SdkTracerProvider>,
    meter_provider: Option<SdkMeterProvider>,
    logger_provider: Option<SdkLoggerProvider>,
}

impl Drop for Telemetry {
    fn drop(&mut self) {
        let shutdowns = [
            ("tracer", self.tracer_provider.take().map(|p| p.shutdown())),
            ("meter", self.meter_provider.take().map(|p| p.shutdown())),
            ("logger", self.logger_provider.take().map(|p| p.shutdown())),
        ];
        for (provider, result) in shutdowns {
            if let Some(Err(err)) = result {
                eprintln!("could not shut down the {provider} provider: {err}");
            }
        }
    }
}

fn resource(service_info: &ServiceInfo) -> Resource {
    Resource::builder()
        .with_service_name(service_info.name_in_metrics.clone())
        .with_attribute(KeyValue::new(SERVICE_VERSION, service_info.version))
        .build()
}

fn init_traces(
    service_info: &ServiceInfo,
    settings: &TraceSettings,
) -> Result<Option<SdkTracerProvider>, ExporterBuildError> {
    let Some(endpoint) = &settings.endpoint else {
        return Ok(None);
    };

    let exporter = SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()?;

    Ok(Some(
        SdkTracerProvider::builder()
            .with_resource(resource(service_info))
            .with_batch_exporter(exporter)
            .build(),
    ))
}

fn init_metrics(
    service_info: &ServiceInfo,
    settings: &MetricSettings,
) -> Result<Option<SdkMeterProvider>, ExporterBuildError> {
    let Some(endpoint) = &settings.endpoint else {
        return Ok(None);
    };

    let exporter = MetricExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()?;
    let reader = PeriodicReader::builder(exporter).build();

    Ok(Some(
        SdkMeterProvider::builder()
            .with_reader(reader)
            .with_resource(resource(service_info))
            .build(),
    ))
}

fn init_logs(
    service_info: &ServiceInfo,
    settings: &LogSettings,
) -> Result<Option<SdkLoggerProvider>, ExporterBuildError> {
    let Some(endpoint) = &settings.endpoint else {
        return Ok(None);
    };

    let exporter = LogExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()?;

    Ok(Some(
        SdkLoggerProvider::builder()
            .with_resource(resource(service_info))
            .with_batch_exporter(exporter)
            .build(),
    ))
}

/// Filter for the OTLP log bridge.
///
/// The exporter's own crates are switched off so exporting a log line never produces
/// another one.
fn otel_log_filter(directives: &str) -> EnvFilter {
    ["hyper", "opentelemetry", "tonic", "h2", "reqwest"]
        .into_iter()
        .filter_map(|target| format!("{target}=off").parse::<Directive>().ok())
        .fold(EnvFilter::new(directives), EnvFilter::add_directive)
}

/// Installs the global subscriber and providers described by `settings`.
///
/// # Errors
/// - `InitLog`, `InitTrace`, `InitMetric` if an exporter cannot be built.
/// - `InitSubscriber` if a global subscriber is already set.
pub fn init(service_info: &ServiceInfo, settings: &TelemetrySettings) -> Result<Telemetry, Error> {
    let logger_provider = init_logs(service_info, &settings.log).context(InitLogSnafu)?;
    let tracer_provider = init_traces(service_info, &settings.trace).context(InitTraceSnafu)?;
    let meter_provider = init_metrics(service_info, &settings.metric).context(InitMetricSnafu)?;

    let log_layer = logger_provider.as_ref().map(|provider| {
        OpenTelemetryTracingBridge::new(provider)
            .with_filter(otel_log_filter(&settings.log.otel_level))
    });
    let trace_layer = tracer_provider
        .as_ref()
        .map(|provider| tracing_opentelemetry::layer().with_tracer(provider.tracer(TRACER_NAME)));
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_thread_names(true)
        .with_filter(EnvFilter::new(&settings.log.console_level));

    tracing_subscriber::registry()
        .with(log_layer)
        .with(trace_layer)
        .with(fmt_layer)
        .try_init()
        .context(InitSubscriberSnafu)?;

    if let Some(tracer_provider) = &tracer_provider {
        global::set_tracer_provider(tracer_provider.clone());
    }
    if let Some(meter_provider) = &meter_provider {
        global::set_meter_provider(meter_provider.clone());
    }

    tracing::info!(
        service.name = service_info.name,
        traces = tracer_provider.is_some(),
        metrics = meter_provider.is_some(),
        otel_logs = logger_provider.is_some(),
        "telemetry initialized"
    );

    Ok(Telemetry {
        tracer_provider,
        meter_provider,
        logger_provider,
    })
}
