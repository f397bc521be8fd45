use crate::{
    binary_utils::{BinaryContext, BinaryOptions, CommonBinaryOptions},
    config::{
        BinaryConfig, BlobStoreConfig, CommonConfig, OrchestratorConfig, RunnerBackend,
        RunnerConfig,
    },
    orchestrator::{
        Components, DelayStrategy, FixedDelay, NoDelay, driver::PendingJobDriver,
    },
    runner::{ContainerRunner, docker::DockerRunner, kubernetes::KubernetesRunner},
    workdir::WorkdirFactory,
};
use anyhow::{Context, Result, anyhow};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::{env, path::PathBuf, sync::Arc, time::Duration};
use trainyard_core::{TokioRuntime, time::RealClock};
use trainyard_orchestrator_core::blobstore::HttpBlobStore;

pub async fn main_callback(ctx: BinaryContext<RealClock, Options, Config>) -> Result<()> {
    const CLIENT_USER_AGENT: &str = concat!(
        env!("CARGO_PKG_NAME"),
        "/",
        env!("CARGO_PKG_VERSION"),
        "/orchestrator",
    );

    let datastore = Arc::new(ctx.datastore);

    let auth_token = ctx
        .options
        .common
        .blobstore_auth_token
        .clone()
        .or_else(|| ctx.config.blobstore.auth_token.clone());
    let blobstore = Arc::new(HttpBlobStore::new(
        reqwest::Client::builder()
            .user_agent(CLIENT_USER_AGENT)
            .build()
            .context("couldn't create HTTP client")?,
        ctx.config.blobstore.url.clone(),
        auth_token,
    ));

    let runner = build_runner(&ctx.config.runner).await?;
    let workdirs = build_workdir_factory(&ctx.config)?;

    let delay: Arc<dyn DelayStrategy> = match ctx.config.orchestrator.startup_delay_secs {
        0 => Arc::new(NoDelay),
        secs => Arc::new(FixedDelay(Duration::from_secs(secs))),
    };

    let components = Arc::new(Components::new(
        datastore,
        runner,
        blobstore,
        ctx.config.blobstore.buckets.clone(),
        workdirs,
        delay,
        ctx.config.orchestrator.run_timeout(),
        ctx.config.orchestrator.builtin_runner_image.clone(),
        ctx.clock,
        &ctx.meter,
    ));

    // Start running.
    let driver = PendingJobDriver::new(
        components,
        TokioRuntime,
        ctx.config.orchestrator.job_discovery_interval(),
        ctx.config.orchestrator.max_concurrent_jobs,
        ctx.stopper,
    );
    driver.run().await;

    Ok(())
}

pub(crate) async fn build_runner(config: &RunnerConfig) -> Result<Arc<dyn ContainerRunner>> {
    Ok(match config.backend {
        RunnerBackend::Docker => Arc::new(
            DockerRunner::new(&config.docker).context("couldn't connect to Docker daemon")?,
        ),
        RunnerBackend::Kubernetes => Arc::new(
            KubernetesRunner::new(config.kubernetes.clone())
                .await
                .context("couldn't connect to Kubernetes cluster")?,
        ),
    })
}

fn build_workdir_factory(config: &Config) -> Result<WorkdirFactory> {
    let root = config
        .orchestrator
        .workdir_root
        .clone()
        .or_else(|| env::var_os("SHARED_VOLUME").map(PathBuf::from));

    // Workloads running in pods can only see exchange directories on the shared volume.
    if config.runner.backend == RunnerBackend::Kubernetes {
        let shared_root = &config.runner.kubernetes.shared_volume_root;
        let root = root
            .as_ref()
            .ok_or_else(|| anyhow!("the Kubernetes backend requires a workdir root"))?;
        if !root.starts_with(shared_root) {
            return Err(anyhow!(
                "workdir root {} is not under the shared volume root {}",
                root.display(),
                shared_root.display(),
            ));
        }
    }

    let preserve = config.orchestrator.preserve_workdirs
        || env::var_os("TRAINYARD_PRESERVE_WORKDIRS")
            .is_some_and(|value| value == "1" || value.eq_ignore_ascii_case("true"));

    Ok(WorkdirFactory::new(root, preserve))
}

#[derive(Debug, Parser)]
#[clap(
    name = "trainyard-orchestrator",
    about = "Trainyard job orchestrator",
    rename_all = "kebab-case",
    version = env!("CARGO_PKG_VERSION"),
)]
pub struct Options {
    #[clap(flatten)]
    pub common: CommonBinaryOptions,
}

impl BinaryOptions for Options {
    fn common_options(&self) -> &CommonBinaryOptions {
        &self.common
    }
}

/// Non-secret configuration options for the Trainyard orchestrator.
///
/// # Examples
///
/// ```
/// # use trainyard_orchestrator::binaries::orchestrator::Config;
/// let yaml_config = r#"
/// ---
/// database:
///   url: "sqlite:///var/lib/trainyard/trainyard.sqlite"
/// logging_config: # logging_config is optional
///   force_json_output: true
/// blobstore:
///   url: "http://minio.example.com/storage/"
/// runner:
///   backend: docker
/// orchestrator:
///   max_concurrent_jobs: 4
///   run_timeout_secs: 600
/// "#;
///
/// let _decoded: Config = serde_yaml::from_str(yaml_config).unwrap();
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    #[serde(flatten)]
    pub common_config: CommonConfig,

    /// Object store holding datasets, algorithm archives, and job artifacts.
    pub blobstore: BlobStoreConfig,

    /// Container backend workloads run on.
    #[serde(default)]
    pub runner: RunnerConfig,

    /// Orchestration pipeline settings.
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
}

impl BinaryConfig for Config {
    fn common_config(&self) -> &CommonConfig {
        &self.common_config
    }

    fn common_config_mut(&mut self) -> &mut CommonConfig {
        &mut self.common_config
    }
}

#[cfg(test)]
mod tests {
    use super::{Config, Options};
    use crate::config::{
        CommonConfig, OrchestratorConfig, RunnerConfig,
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
        Options::command().debug_assert()
    }

    #[test]
    fn roundtrip_config() {
        roundtrip_encoding(Config {
            common_config: CommonConfig {
                database: generate_db_config(),
                logging_config: generate_trace_config(),
                metrics_config: generate_metrics_config(),
                health_check_listen_address: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 8080)),
                max_transaction_retries: 1000,
            },
            blobstore: generate_blobstore_config(),
            runner: RunnerConfig::default(),
            orchestrator: OrchestratorConfig::default(),
        })
    }

    #[test]
    fn documentation_config_examples() {
        serde_yaml::from_str::<Config>(include_str!(
            "../../../docs/samples/basic_config/orchestrator.yaml"
        ))
        .unwrap();
        serde_yaml::from_str::<Config>(include_str!(
            "../../../docs/samples/advanced_config/orchestrator.yaml"
        ))
        .unwrap();
    }
}
