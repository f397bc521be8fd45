//! Collection and exporting of application-level metrics for Trainyard.

use serde::{Deserialize, Serialize};
use std::net::AddrParseError;

#[cfg(feature = "prometheus")]
use {
    anyhow::{Context, anyhow},
    prometheus::Registry,
    std::{
        net::{IpAddr, Ipv4Addr},
        str::FromStr,
    },
    tokio::{sync::oneshot, task::JoinHandle},
    trillium::{Info, Init},
};

#[cfg(feature = "otlp")]
use {
    opentelemetry_otlp::WithExportConfig,
    opentelemetry_sdk::{metrics::PeriodicReader, runtime::Tokio},
};

#[cfg(any(feature = "otlp", feature = "prometheus"))]
use {
    opentelemetry::{KeyValue, global::set_meter_provider},
    opentelemetry_sdk::{
        Resource,
        metrics::{MetricError, SdkMeterProvider},
    },
};

#[cfg(not(feature = "prometheus"))]
use anyhow::anyhow;

/// Errors from initializing metrics provider, registry, and exporter.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("bad IP address: {0}")]
    IpAddress(#[from] AddrParseError),
    #[cfg(any(feature = "otlp", feature = "prometheus"))]
    #[error(transparent)]
    OpenTelemetry(#[from] MetricError),
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Configuration for collection/exporting of application-level metrics.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MetricsConfiguration {
    /// Configuration for OpenTelemetry metrics, with a choice of exporters.
    #[serde(default, with = "serde_yaml::with::singleton_map")]
    pub exporter: Option<MetricsExporterConfiguration>,
}

/// Selection of an exporter for OpenTelemetry metrics.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "lowercase")]
pub enum MetricsExporterConfiguration {
    Prometheus {
        host: Option<String>,
        port: Option<u16>,
    },
    Otlp(OtlpExporterConfiguration),
}

/// Configuration options specific to the OpenTelemetry OTLP metrics exporter.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OtlpExporterConfiguration {
    /// gRPC endpoint for OTLP exporter.
    pub endpoint: String,
}

/// Choice of OpenTelemetry metrics exporter implementation.
pub enum MetricsExporterHandle {
    #[cfg(feature = "prometheus")]
    Prometheus {
        handle: JoinHandle<()>,
        port: u16,
    },
    #[cfg(feature = "otlp")]
    Otlp(SdkMeterProvider),
    Noop,
}

#[cfg(feature = "prometheus")]
fn build_opentelemetry_prometheus_meter_provider(
    registry: Registry,
) -> Result<SdkMeterProvider, MetricError> {
    let reader = opentelemetry_prometheus::exporter()
        .with_registry(registry)
        .build()?;
    let meter_provider = SdkMeterProvider::builder()
        .with_reader(reader)
        .with_resource(resource())
        .build();
    Ok(meter_provider)
}

#[cfg(feature = "prometheus")]
async fn prometheus_metrics_server(
    registry: Registry,
    host: IpAddr,
    port: u16,
) -> Result<(JoinHandle<()>, u16), Error> {
    let router = trillium_prometheus::text_format_handler(registry.clone());

    let (sender, receiver) = oneshot::channel();
    let init = Init::new(|info: Info| async move {
        // Ignore error if the receiver is dropped.
        let _ = sender.send(info.tcp_socket_addr().map(|socket_addr| socket_addr.port()));
    });

    let handle = tokio::task::spawn(
        trillium_tokio::config()
            .with_port(port)
            .with_host(&host.to_string())
            .without_signals()
            .run_async((init, router)),
    );

    let port = receiver
        .await
        .context("Init handler was dropped before sending port")?
        .context("server does not have a TCP port")?;

    Ok((handle, port))
}

/// Install a metrics provider and exporter, per the given configuration.
///
/// The OpenTelemetry global API can be used to create and update meters, and they will be sent
/// through this exporter. The returned handle should not be dropped until the application shuts
/// down.
pub async fn install_metrics_exporter(
    config: &MetricsConfiguration,
) -> Result<MetricsExporterHandle, Error> {
    match &config.exporter {
        #[cfg(feature = "prometheus")]
        Some(MetricsExporterConfiguration::Prometheus {
            host: config_exporter_host,
            port: config_exporter_port,
        }) => {
            let registry = Registry::new();
            let meter_provider = build_opentelemetry_prometheus_meter_provider(registry.clone())?;
            set_meter_provider(meter_provider.clone());

            let host = config_exporter_host
                .as_ref()
                .map(|host| IpAddr::from_str(host))
                .unwrap_or_else(|| Ok(Ipv4Addr::UNSPECIFIED.into()))?;
            let config_port = config_exporter_port.unwrap_or(9464);

            let (handle, actual_port) =
                prometheus_metrics_server(registry, host, config_port).await?;

            Ok(MetricsExporterHandle::Prometheus {
                handle,
                port: actual_port,
            })
        }
        #[cfg(not(feature = "prometheus"))]
        Some(MetricsExporterConfiguration::Prometheus { .. }) => Err(Error::Other(anyhow!(
            "The OpenTelemetry Prometheus metrics exporter was enabled in the configuration file, \
             but support was not enabled at compile time. Rebuild with `--features prometheus`.",
        ))),

        #[cfg(feature = "otlp")]
        Some(MetricsExporterConfiguration::Otlp(otlp_config)) => {
            let exporter = opentelemetry_otlp::MetricExporter::builder()
                .with_tonic()
                .with_endpoint(otlp_config.endpoint.clone())
                .build()?;
            let reader = PeriodicReader::builder(exporter, Tokio).build();
            let meter_provider = SdkMeterProvider::builder()
                .with_reader(reader)
                .with_resource(resource())
                .build();
            set_meter_provider(meter_provider.clone());
            // We can't drop the meter provider, as that would stop pushes, so return it to the
            // caller.
            Ok(MetricsExporterHandle::Otlp(meter_provider))
        }
        #[cfg(not(feature = "otlp"))]
        Some(MetricsExporterConfiguration::Otlp(_)) => Err(Error::Other(anyhow!(
            "The OpenTelemetry OTLP metrics exporter was enabled in the configuration file, but \
             support was not enabled at compile time. Rebuild with `--features otlp`.",
        ))),

        // If neither exporter is configured, leave the default NoopMeterProvider in place.
        None => Ok(MetricsExporterHandle::Noop),
    }
}

/// Produces a [`Resource`] representing this process.
#[cfg(any(feature = "otlp", feature = "prometheus"))]
fn resource() -> Resource {
    // Note that the implementation of `Default` pulls in attributes set via environment variables.
    let default_resource = Resource::default();

    let version_info_resource = Resource::new([
        KeyValue::new(
            "service.version",
            format!("{}-{}", env!("CARGO_PKG_VERSION"), crate::git_revision()),
        ),
        KeyValue::new("process.runtime.name", "Rust"),
        KeyValue::new("process.runtime.version", env!("RUSTC_SEMVER")),
    ]);

    version_info_resource.merge(&default_resource)
}
