//! Configures a tracing subscriber for Trainyard.

use serde::{Deserialize, Serialize};
use std::io::{IsTerminal, stdout};
use tracing_log::LogTracer;
use tracing_subscriber::{EnvFilter, Layer, Registry, layer::SubscriberExt};

#[cfg(feature = "otlp")]
use {
    opentelemetry::{KeyValue, trace::TracerProvider as _},
    opentelemetry_otlp::WithExportConfig,
    opentelemetry_sdk::{Resource, runtime::Tokio, trace::TracerProvider},
    tracing_subscriber::filter::{LevelFilter, Targets},
};

/// Errors from initializing trace subscriber.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("tracing error: {0}")]
    SetGlobalTracingSubscriber(#[from] tracing::subscriber::SetGlobalDefaultError),
    #[error("logging error: {0}")]
    SetGlobalLogger(#[from] tracing_log::log_tracer::SetLoggerError),
    #[cfg(feature = "otlp")]
    #[error(transparent)]
    OpenTelemetry(#[from] opentelemetry::trace::TraceError),
    #[error("{0}")]
    Other(&'static str),
}

/// Configuration for the tracing subscriber.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceConfiguration {
    /// If true, uses a [`tracing_subscriber::fmt::TestWriter`] to capture trace events when
    /// running tests.
    #[serde(default)]
    pub use_test_writer: bool,

    /// If true OR if stdout is not a tty, trace events are output in JSON format by
    /// [`tracing_subscriber::fmt::format::Json`]. Otherwise, trace events are output in pretty
    /// format by [`tracing_subscriber::fmt::format::Pretty`].
    #[serde(default)]
    pub force_json_output: bool,

    /// Configuration for OpenTelemetry traces, with a choice of exporters. (optional)
    #[serde(default, with = "serde_yaml::with::singleton_map")]
    pub open_telemetry_config: Option<OpenTelemetryTraceConfiguration>,
}

/// Selection of an exporter for OpenTelemetry spans.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpenTelemetryTraceConfiguration {
    Otlp(OtlpTraceConfiguration),
}

/// Configuration options specific to the OpenTelemetry OTLP exporter.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OtlpTraceConfiguration {
    /// gRPC endpoint for the OTLP exporter.
    pub endpoint: String,
}

/// Create a base tracing layer with configuration used in all subscribers.
fn base_layer<S>() -> tracing_subscriber::fmt::Layer<S> {
    tracing_subscriber::fmt::layer()
        .with_thread_ids(true)
        .with_level(true)
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
}

/// Configures and installs a tracing subscriber, to capture events logged with
/// [`tracing::info`] and the like. Captured events are written to stdout, with formatting
/// affected by the provided [`TraceConfiguration`].
pub fn install_trace_subscriber(config: &TraceConfiguration) -> Result<TraceGuards, Error> {
    // If stdout is not a tty or if forced by config, output logs as JSON structures.
    let output_json = !stdout().is_terminal() || config.force_json_output;

    // Configure filters with the RUST_LOG environment variable.
    let stdout_filter = EnvFilter::from_default_env();

    let mut layers = Vec::new();
    match (output_json, config.use_test_writer) {
        (true, false) => layers.push(
            base_layer()
                .json()
                .with_current_span(false)
                .with_filter(stdout_filter)
                .boxed(),
        ),
        (false, false) => layers.push(base_layer().pretty().with_filter(stdout_filter).boxed()),
        (_, true) => layers.push(
            base_layer()
                .pretty()
                .with_test_writer()
                .with_filter(stdout_filter)
                .boxed(),
        ),
    }

    #[cfg(feature = "otlp")]
    let mut tracer_provider = None;
    #[cfg(feature = "otlp")]
    if let Some(OpenTelemetryTraceConfiguration::Otlp(otlp_config)) = &config.open_telemetry_config
    {
        let exporter = opentelemetry_otlp::SpanExporter::builder()
            .with_tonic()
            .with_endpoint(otlp_config.endpoint.clone())
            .build()?;
        let provider = TracerProvider::builder()
            .with_batch_exporter(exporter, Tokio)
            .with_resource(Resource::new(Vec::from([KeyValue::new(
                "service.name",
                "trainyard_orchestrator",
            )])))
            .build();
        opentelemetry::global::set_tracer_provider(provider.clone());

        // Filter out spans from h2, internal to the OTLP exporter (via tonic). These spans
        // would otherwise drown out root spans from the application.
        let filter = Targets::new()
            .with_default(LevelFilter::TRACE)
            .with_target("h2", LevelFilter::OFF);

        layers.push(
            tracing_opentelemetry::layer()
                .with_threads(true)
                .with_tracer(provider.tracer("trainyard_orchestrator"))
                .with_filter(filter)
                .boxed(),
        );
        tracer_provider = Some(provider);
    }

    #[cfg(not(feature = "otlp"))]
    if config.open_telemetry_config.is_some() {
        return Err(Error::Other(
            "The OpenTelemetry OTLP subscriber was enabled in the configuration file, but support \
             was not enabled at compile time. Rebuild with `--features otlp`.",
        ));
    }

    let subscriber = Registry::default().with(layers);
    tracing::subscriber::set_global_default(subscriber)?;

    // Install a logger that converts logs into tracing events.
    LogTracer::init()?;

    Ok(TraceGuards {
        #[cfg(feature = "otlp")]
        tracer_provider,
    })
}

/// Guards for installed tracing infrastructure. Dropping flushes buffered spans.
pub struct TraceGuards {
    #[cfg(feature = "otlp")]
    tracer_provider: Option<TracerProvider>,
}

impl Drop for TraceGuards {
    fn drop(&mut self) {
        #[cfg(feature = "otlp")]
        if let Some(tracer_provider) = &self.tracer_provider {
            // Flush buffered spans in the OpenTelemetry pipeline.
            let _ = tracer_provider.shutdown();
        }
    }
}
