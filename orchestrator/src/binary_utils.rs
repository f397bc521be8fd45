//! Utilities for Trainyard binaries.

use crate::{
    config::{BinaryConfig, DbConfig},
    metrics::install_metrics_exporter,
    trace::install_trace_subscriber,
};
use anyhow::{Context as _, Result};
use backon::{ExponentialBuilder, Retryable};
use clap::Parser;
use futures::StreamExt;
use opentelemetry::{KeyValue, metrics::Meter};
use signal_hook::consts::{SIGINT, SIGTERM};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::{
    fmt::{self, Debug, Formatter},
    fs,
    future::Future,
    net::SocketAddr,
    path::PathBuf,
    str::FromStr,
};
use stopper::Stopper;
use tracing::{debug, info};
use trainyard_core::{initialize_rustls, time::Clock};
use trainyard_orchestrator_core::datastore::Datastore;

/// Reads, parses, and returns the config referenced by the given options.
pub fn read_config<Config: BinaryConfig>(options: &CommonBinaryOptions) -> Result<Config> {
    let config_content = fs::read_to_string(&options.config_file)
        .with_context(|| format!("couldn't read config file {:?}", options.config_file))?;
    let config: Config = serde_yaml::from_str(&config_content)
        .with_context(|| format!("couldn't parse config file {:?}", options.config_file))?;
    Ok(config)
}

/// Opens a connection pool to the database named by the given config. The connection is probed
/// before the pool is returned, with retries, so that a binary started before its database is
/// ready waits for it rather than crash-looping.
pub async fn database_pool(db_config: &DbConfig) -> Result<SqlitePool> {
    let connect_options = SqliteConnectOptions::from_str(db_config.url.as_str())
        .with_context(|| format!("couldn't parse database connect string: {:?}", db_config.url))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(db_config.connection_pool_timeout())
        .foreign_keys(true);

    let pool = (|| async {
        SqlitePoolOptions::new()
            .acquire_timeout(db_config.connection_pool_timeout())
            .connect_with(connect_options.clone())
            .await
    })
    .retry(
        ExponentialBuilder::default()
            .with_max_delay(db_config.connection_pool_timeout())
            .with_total_delay(Some(db_config.connection_pool_timeout())),
    )
    .notify(|error, _| debug!(%error, "transient error connecting to database"))
    .await
    .context("couldn't make connection to database")?;

    Ok(pool)
}

/// Connects to a datastore, given a connection pool to the underlying database.
pub async fn datastore<C: Clock>(
    pool: SqlitePool,
    clock: C,
    meter: &Meter,
    max_transaction_retries: u64,
    check_schema_version: bool,
) -> Result<Datastore<C>> {
    if check_schema_version {
        Datastore::new(pool, clock, meter, max_transaction_retries)
            .await
            .context("couldn't create datastore")
    } else {
        Ok(Datastore::new_without_supported_versions(pool, clock, meter, max_transaction_retries)
            .await)
    }
}

/// Options for Trainyard binaries.
pub trait BinaryOptions: Parser + Debug {
    /// Returns the common options.
    fn common_options(&self) -> &CommonBinaryOptions;
}

/// Common options that are used by all Trainyard binaries.
#[derive(Default, Parser)]
pub struct CommonBinaryOptions {
    /// Path to configuration YAML.
    #[clap(
        long,
        env = "CONFIG_FILE",
        num_args = 1,
        required(true),
        help = "path to configuration file"
    )]
    config_file: PathBuf,

    /// Bearer token for the object store. If specified, overrides the token in the configuration
    /// file.
    #[clap(
        long,
        env = "BLOBSTORE_AUTH_TOKEN",
        hide_env_values = true,
        help = "object store bearer token"
    )]
    pub blobstore_auth_token: Option<String>,
}

impl Debug for CommonBinaryOptions {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Options")
            .field("config_file", &self.config_file)
            .finish()
    }
}

/// BinaryContext provides contextual objects related to a Trainyard binary.
pub struct BinaryContext<C: Clock, Options: BinaryOptions, Config: BinaryConfig> {
    pub clock: C,
    pub options: Options,
    pub config: Config,
    pub datastore: Datastore<C>,
    pub meter: Meter,
    pub stopper: Stopper,
}

pub async fn trainyard_main<C, Options, Config, F, Fut>(
    options: Options,
    clock: C,
    f: F,
) -> anyhow::Result<()>
where
    C: Clock,
    Options: BinaryOptions,
    Config: BinaryConfig,
    F: FnOnce(BinaryContext<C, Options, Config>) -> Fut,
    Fut: Future<Output = anyhow::Result<()>>,
{
    initialize_rustls();

    // Read & parse config.
    let config: Config = read_config(options.common_options())?;

    // Install tracing/metrics handlers.
    let _trace_guards = install_trace_subscriber(&config.common_config().logging_config)
        .context("couldn't install tracing subscriber")?;
    let _metrics_exporter = install_metrics_exporter(&config.common_config().metrics_config)
        .await
        .context("failed to install metrics exporter")?;

    // Create build info metrics gauge.
    let meter = opentelemetry::global::meter("trainyard_orchestrator");
    let gauge = meter
        .u64_gauge("trainyard_build_info")
        .with_description(
            "A metric with a constant '1' value labeled with build-time version information.",
        )
        .build();
    gauge.record(
        1,
        &[
            KeyValue::new("version", env!("CARGO_PKG_VERSION")),
            KeyValue::new("revision", crate::git_revision()),
            KeyValue::new("rust_version", env!("RUSTC_SEMVER")),
        ],
    );

    info!(common_options = ?options.common_options(), ?config, "Starting up");

    let stopper = Stopper::new();
    setup_signal_handler(stopper.clone())
        .context("failed to register SIGTERM/SIGINT signal handler")?;

    // Connect to database.
    let pool = database_pool(&config.common_config().database)
        .await
        .context("couldn't create database connection pool")?;
    let datastore = datastore(
        pool,
        clock.clone(),
        &meter,
        config.common_config().max_transaction_retries,
        config.common_config().database.check_schema_version,
    )
    .await?;

    let health_check_listen_address = config.common_config().health_check_listen_address;
    let healthz_task_handle =
        tokio::task::spawn(
            async move { health_endpoint_server(health_check_listen_address).await },
        );

    let result = f(BinaryContext {
        clock,
        options,
        config,
        datastore,
        meter,
        stopper,
    })
    .await;

    healthz_task_handle.abort();

    result
}

/// Listen for HTTP requests on a given port, and respond to requests for "/healthz" with an
/// empty body and status code 200. Each Trainyard component exposes this HTTP server to enable
/// health checks, and to indicate when it has successfully started up.
async fn health_endpoint_server(address: SocketAddr) {
    let router = trillium_router::router().get("/healthz", trillium::Status::Ok);
    trillium_tokio::config()
        .with_port(address.port())
        .with_host(&address.ip().to_string())
        .without_signals()
        .run_async(router)
        .await;
}

/// Registers a signal handler for SIGTERM and SIGINT which fires the given [`Stopper`], so that
/// long-running binaries stop claiming new work and drain what is already running.
pub fn setup_signal_handler(stopper: Stopper) -> Result<(), std::io::Error> {
    let mut signal_stream = signal_hook_tokio::Signals::new([SIGTERM, SIGINT])?;
    let handle = signal_stream.handle();
    tokio::spawn(async move {
        while let Some(signal) = signal_stream.next().await {
            if signal == SIGTERM || signal == SIGINT {
                info!(signal, "shutdown signal received");
                stopper.stop();
                handle.close();
                break;
            }
        }
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::CommonBinaryOptions;
    use clap::CommandFactory;

    #[test]
    fn verify_app() {
        CommonBinaryOptions::command().debug_assert()
    }
}
