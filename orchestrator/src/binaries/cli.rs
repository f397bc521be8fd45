//! Administrative command-line interface for Trainyard.

use crate::{
    binaries::orchestrator::build_runner,
    binary_utils::{CommonBinaryOptions, database_pool, datastore, read_config},
    config::{BinaryConfig, BlobStoreConfig, CommonConfig, RunnerConfig},
    metrics::install_metrics_exporter,
    orchestrator::{
        status::{JobStatusService, Requester},
        submitter::enqueue_job,
    },
    trace::install_trace_subscriber,
};
use anyhow::{Context, Result};
use clap::Parser;
use opentelemetry::global::meter;
use serde::{Deserialize, Serialize};
use std::{path::PathBuf, str::FromStr, sync::Arc};
use tokio::{fs, runtime};
use tracing::info;
use trainyard_core::{initialize_rustls, time::RealClock};
use trainyard_orchestrator_core::datastore::{MIGRATOR, models::JobId};

pub fn run(command_line_options: CommandLineOptions) -> Result<()> {
    initialize_rustls();

    // Read and parse config.
    let config_file: ConfigFile = read_config(&command_line_options.common_options)?;

    let runtime = runtime::Builder::new_multi_thread().enable_all().build()?;

    runtime.block_on(async {
        let _trace_guards =
            install_trace_subscriber(&config_file.common_config().logging_config)
                .context("couldn't install tracing subscriber")?;
        let _metrics_exporter =
            install_metrics_exporter(&config_file.common_config().metrics_config)
                .await
                .context("failed to install metrics exporter")?;

        info!(
            common_options = ?&command_line_options.common_options,
            config = ?config_file,
            version = env!("CARGO_PKG_VERSION"),
            git_revision = crate::git_revision(),
            rust_version = env!("RUSTC_SEMVER"),
            "Starting trainyard-cli"
        );

        command_line_options.cmd.execute(&config_file).await
    })
}

#[derive(Debug, Parser)]
enum Command {
    /// Applies outstanding database migrations.
    Migrate,

    /// Enqueues a job from a request file. The job is picked up and run by a resident
    /// orchestrator process.
    SubmitJob {
        /// Username the job is submitted under.
        #[arg(long)]
        owner: String,

        /// Path to a YAML or JSON job request file.
        #[arg(long)]
        request_file: PathBuf,
    },

    /// Prints the current status of a job.
    JobStatus {
        #[clap(flatten)]
        requester_options: RequesterOptions,

        /// Identifier of the job.
        #[arg(long)]
        job_id: String,
    },

    /// Requests that a job stop. The running orchestration observes the request at its next
    /// checkpoint; an in-flight workload is torn down immediately.
    StopJob {
        #[clap(flatten)]
        requester_options: RequesterOptions,

        /// Identifier of the job.
        #[arg(long)]
        job_id: String,
    },
}

impl Command {
    async fn execute(&self, config_file: &ConfigFile) -> Result<()> {
        let pool = database_pool(&config_file.common_config().database)
            .await
            .context("couldn't create database connection pool")?;

        match self {
            Command::Migrate => {
                MIGRATOR
                    .run(&pool)
                    .await
                    .context("couldn't apply database migrations")?;
                println!("database migrated");
                Ok(())
            }

            Command::SubmitJob {
                owner,
                request_file,
            } => {
                let datastore = datastore(
                    pool,
                    RealClock::default(),
                    &meter("trainyard_cli"),
                    config_file.common_config().max_transaction_retries,
                    config_file.common_config().database.check_schema_version,
                )
                .await?;

                let request_content = fs::read_to_string(request_file)
                    .await
                    .with_context(|| format!("couldn't read request file {request_file:?}"))?;
                let request = serde_yaml::from_str(&request_content)
                    .with_context(|| format!("couldn't parse request file {request_file:?}"))?;

                let job_id =
                    enqueue_job(&datastore, &RealClock::default(), owner, &request).await?;
                println!("{job_id}");
                Ok(())
            }

            Command::JobStatus {
                requester_options,
                job_id,
            } => {
                let service = job_status_service(config_file, pool).await?;
                let status = service
                    .status(&requester_options.requester(), &parse_job_id(job_id)?)
                    .await?;
                println!("{status:#?}");
                Ok(())
            }

            Command::StopJob {
                requester_options,
                job_id,
            } => {
                let service = job_status_service(config_file, pool).await?;
                let job_id = parse_job_id(job_id)?;
                service
                    .request_stop(&requester_options.requester(), &job_id)
                    .await?;
                println!("stop requested for job {job_id}");
                Ok(())
            }
        }
    }
}

fn parse_job_id(job_id: &str) -> Result<JobId> {
    JobId::from_str(job_id).with_context(|| format!("couldn't parse job ID {job_id:?}"))
}

async fn job_status_service(
    config_file: &ConfigFile,
    pool: sqlx::SqlitePool,
) -> Result<JobStatusService<RealClock>> {
    let datastore = Arc::new(
        datastore(
            pool,
            RealClock::default(),
            &meter("trainyard_cli"),
            config_file.common_config().max_transaction_retries,
            config_file.common_config().database.check_schema_version,
        )
        .await?,
    );
    let runner = build_runner(&config_file.runner).await?;
    Ok(JobStatusService::new(datastore, runner))
}

#[derive(Debug, Parser)]
#[clap(
    name = "trainyard-cli",
    about = "Trainyard administrative CLI",
    rename_all = "kebab-case",
    version = env!("CARGO_PKG_VERSION"),
)]
pub struct CommandLineOptions {
    #[clap(subcommand)]
    cmd: Command,

    #[clap(flatten)]
    common_options: CommonBinaryOptions,
}

#[derive(Debug, Parser)]
struct RequesterOptions {
    /// Username the request is made under.
    #[clap(long)]
    user: String,

    /// Make the request with administrative access, able to see and stop any user's jobs.
    #[clap(long, default_value = "false")]
    admin: bool,
}

impl RequesterOptions {
    fn requester(&self) -> Requester {
        Requester::new(self.user.clone(), self.admin)
    }
}

/// Configuration file for the Trainyard CLI.
///
/// # Examples
///
/// ```
/// # use trainyard_orchestrator::binaries::cli::ConfigFile;
/// let yaml_config = r#"
/// ---
/// database:
///   url: "sqlite:///var/lib/trainyard/trainyard.sqlite"
/// blobstore:
///   url: "http://minio.example.com/storage/"
/// "#;
///
/// let _decoded: ConfigFile = serde_yaml::from_str(yaml_config).unwrap();
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(flatten)]
    common_config: CommonConfig,

    /// Object store holding datasets, algorithm archives, and job artifacts.
    blobstore: BlobStoreConfig,

    /// Container backend, used to tear down in-flight workloads on stop requests.
    #[serde(default)]
    runner: RunnerConfig,
}

impl BinaryConfig for ConfigFile {
    fn common_config(&self) -> &CommonConfig {
        &self.common_config
    }

    fn common_config_mut(&mut self) -> &mut CommonConfig {
        &mut self.common_config
    }
}

#[cfg(test)]
mod tests {
    use super::{CommandLineOptions, ConfigFile};
    use crate::config::{
        CommonConfig, RunnerConfig,
        test_util::{
            generate_blobstore_config, generate_db_config, generate_metrics_config,
            generate_trace_config,
        },
    };
    use clap::CommandFactory;
    use std::net::{Ipv4Addr, SocketAddr};
    use trainyard_core::test_util::roundtrip_encoding;

    #[test]
    fn verify_app() {
        CommandLineOptions::command().debug_assert()
    }

    #[test]
    fn roundtrip_config_file() {
        roundtrip_encoding(ConfigFile {
            common_config: CommonConfig {
                database: generate_db_config(),
                logging_config: generate_trace_config(),
                metrics_config: generate_metrics_config(),
                health_check_listen_address: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 8080)),
                max_transaction_retries: 1000,
            },
            blobstore: generate_blobstore_config(),
            runner: RunnerConfig::default(),
        })
    }
}
