//! Workload execution on a local Docker daemon.

use crate::{
    config::DockerConfig,
    runner::{ContainerRunner, Entrypoint, Error, ImageSpec, RunHandle, RunRequest, workload_name},
};
use async_trait::async_trait;
use bollard::{
    API_DEFAULT_VERSION, Docker,
    container::{
        Config, CreateContainerOptions, DownloadFromContainerOptions, LogOutput, LogsOptions,
        RemoveContainerOptions, StartContainerOptions, WaitContainerOptions,
    },
    image::{CreateImageOptions, ImportImageOptions, TagImageOptions},
};
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt};
use std::{path::Path, time::Duration};
use tracing::{debug, info, trace, warn};

/// Container-side mount point of the input directory.
const DATA_MOUNT: &str = "/data";
/// Container-side mount point of the output directory.
const MODEL_MOUNT: &str = "/model";

const CONNECT_TIMEOUT_SECS: u64 = 120;

/// A [`ContainerRunner`] backed by a Docker daemon. Input and output directories are bind-mounted
/// into each workload container, so they must be on a filesystem the daemon can reach.
#[derive(Clone, Debug)]
pub struct DockerRunner {
    docker: Docker,
}

impl DockerRunner {
    /// Connects to the Docker daemon named by the configuration, or the platform's default
    /// daemon socket if no endpoint is configured.
    pub fn new(config: &DockerConfig) -> Result<Self, Error> {
        let docker = match &config.endpoint {
            Some(endpoint) if endpoint.starts_with("unix://") => {
                Docker::connect_with_socket(endpoint, CONNECT_TIMEOUT_SECS, API_DEFAULT_VERSION)?
            }
            Some(endpoint) => {
                Docker::connect_with_http(endpoint, CONNECT_TIMEOUT_SECS, API_DEFAULT_VERSION)?
            }
            None => Docker::connect_with_local_defaults()?,
        };
        Ok(Self { docker })
    }

    async fn ensure_image(&self, image: &str) -> Result<(), Error> {
        if self.docker.inspect_image(image).await.is_ok() {
            debug!(%image, "image already present, skipping pull");
            return Ok(());
        }

        info!(%image, "pulling image");
        let mut pull = self.docker.create_image(
            Some(CreateImageOptions {
                from_image: image,
                ..Default::default()
            }),
            None,
            None,
        );
        while let Some(progress) = pull.try_next().await? {
            if let Some(status) = progress.status {
                trace!(%image, %status, "pull progress");
            }
        }
        Ok(())
    }

    async fn load_archive(&self, tar_path: &Path, tag: &str) -> Result<(), Error> {
        if self.docker.inspect_image(tag).await.is_ok() {
            debug!(image = %tag, "image already present, skipping archive load");
            return Ok(());
        }

        info!(image = %tag, path = %tar_path.display(), "loading image archive");
        let archive = tokio::fs::read(tar_path).await?;
        let mut load = self.docker.import_image(
            ImportImageOptions::default(),
            Bytes::from(archive),
            None,
        );

        // The daemon reports the name or ID the archive loaded under; it need not match the tag
        // we want, so re-tag afterwards.
        let mut loaded = None;
        while let Some(progress) = load.try_next().await? {
            if let Some(line) = progress.stream {
                let line = line.trim();
                if let Some(reference) = line.strip_prefix("Loaded image: ") {
                    loaded = Some(reference.to_string());
                } else if let Some(id) = line.strip_prefix("Loaded image ID: ") {
                    loaded = Some(id.to_string());
                }
            }
        }
        let loaded = loaded.ok_or_else(|| Error::ImageUnavailable {
            image: tag.to_string(),
            reason: "archive load did not report a loaded image".to_string(),
        })?;

        if loaded != tag {
            let (repo, tag_part) = split_reference(tag);
            self.docker
                .tag_image(
                    &loaded,
                    Some(TagImageOptions {
                        repo,
                        tag: tag_part,
                    }),
                )
                .await?;
        }

        // The expected reference must resolve before workloads are submitted against it.
        self.docker
            .inspect_image(tag)
            .await
            .map_err(|err| Error::ImageUnavailable {
                image: tag.to_string(),
                reason: err.to_string(),
            })?;
        Ok(())
    }

    async fn wait_inner(&self, name: &str, timeout: Duration) -> Result<(), Error> {
        // Follow logs in a background task while waiting for the container to finish.
        let log_task = tokio::task::spawn(follow_logs(self.docker.clone(), name.to_string()));

        let mut wait_stream = self
            .docker
            .wait_container(name, None::<WaitContainerOptions<String>>);
        let rslt = tokio::select! {
            rslt = wait_stream.next() => rslt,
            _ = tokio::time::sleep(timeout) => {
                log_task.abort();
                let _ = self.docker.kill_container::<String>(name, None).await;
                return Err(Error::Timeout { timeout });
            }
        };
        log_task.abort();

        let exit_code = match rslt {
            Some(Ok(response)) => response.status_code,
            Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => code,
            Some(Err(err)) => return Err(err.into()),
            // The wait stream ended without a status; fall back to inspecting the container.
            None => self
                .docker
                .inspect_container(name, None)
                .await?
                .state
                .and_then(|state| state.exit_code)
                .unwrap_or(-1),
        };

        if exit_code != 0 {
            return Err(Error::WorkloadFailed { exit_code });
        }
        Ok(())
    }

    async fn remove_container(&self, name: &str) {
        if let Err(err) = self
            .docker
            .remove_container(
                name,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            debug!(container = %name, %err, "couldn't remove container");
        }
    }

    async fn download_file(
        &self,
        container_name: &str,
        image: &str,
        source: &Path,
        dest: &Path,
    ) -> Result<(), Error> {
        let mut chunks = self.docker.download_from_container(
            container_name,
            Some(DownloadFromContainerOptions {
                path: source.display().to_string(),
            }),
        );
        let mut archive = Vec::new();
        while let Some(chunk) = chunks.next().await {
            match chunk {
                Ok(chunk) => archive.extend_from_slice(&chunk),
                Err(bollard::errors::Error::DockerResponseServerError {
                    status_code: 404, ..
                }) => {
                    return Err(Error::FileNotFound {
                        image: image.to_string(),
                        path: source.display().to_string(),
                    });
                }
                Err(err) => return Err(err.into()),
            }
        }

        // The response is a tar archive holding the requested path.
        let mut tar = tar::Archive::new(archive.as_slice());
        for entry in tar.entries()? {
            let mut entry = entry?;
            if entry.header().entry_type().is_file() {
                let mut out = std::fs::File::create(dest)?;
                std::io::copy(&mut entry, &mut out)?;
                return Ok(());
            }
        }
        Err(Error::FileNotFound {
            image: image.to_string(),
            path: source.display().to_string(),
        })
    }
}

#[async_trait]
impl ContainerRunner for DockerRunner {
    async fn prepare_image(&self, image: &ImageSpec) -> Result<(), Error> {
        match image {
            ImageSpec::Registry { image } => self.ensure_image(image).await,
            ImageSpec::Archive { tar_path, tag } => self.load_archive(tar_path, tag).await,
        }
    }

    async fn submit(&self, request: &RunRequest) -> Result<RunHandle, Error> {
        let name = workload_name(request.kind, &request.job_id);

        // Clear out any leftover container from an earlier attempt at this job.
        self.remove_container(&name).await;

        let cmd = match &request.entrypoint {
            Entrypoint::Image => None,
            Entrypoint::Script { file_name } => Some(Vec::from([
                "python".to_string(),
                format!("{DATA_MOUNT}/{file_name}"),
            ])),
        };
        let config = Config {
            image: Some(request.image.clone()),
            cmd,
            env: Some(Vec::from([
                format!("DATA_DIR={DATA_MOUNT}"),
                format!("MODEL_DIR={MODEL_MOUNT}"),
            ])),
            host_config: Some(bollard::models::HostConfig {
                binds: Some(Vec::from([
                    format!("{}:{DATA_MOUNT}", request.input_dir.display()),
                    format!("{}:{MODEL_MOUNT}", request.output_dir.display()),
                ])),
                ..Default::default()
            }),
            ..Default::default()
        };

        self.docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.as_str(),
                    platform: None,
                }),
                config,
            )
            .await?;
        self.docker
            .start_container(&name, None::<StartContainerOptions<String>>)
            .await?;
        info!(container = %name, image = %request.image, "started container");

        Ok(RunHandle::new(name))
    }

    async fn wait(&self, handle: &RunHandle, timeout: Duration) -> Result<(), Error> {
        let rslt = self.wait_inner(handle.as_str(), timeout).await;
        // Teardown happens regardless of how the wait came out.
        self.remove_container(handle.as_str()).await;
        rslt
    }

    async fn cancel(&self, handle: &RunHandle) {
        if let Err(err) = self
            .docker
            .kill_container::<String>(handle.as_str(), None)
            .await
        {
            debug!(container = %handle, %err, "couldn't kill container");
        }
        self.remove_container(handle.as_str()).await;
    }

    async fn copy_file_from_image(
        &self,
        image: &str,
        source: &Path,
        dest: &Path,
    ) -> Result<(), Error> {
        // Archives can only be downloaded from containers, so create one without starting it.
        // The command is never run.
        let name = format!("trainyard-extract-{:08x}", rand::random::<u32>());
        self.docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.as_str(),
                    platform: None,
                }),
                Config {
                    image: Some(image.to_string()),
                    cmd: Some(Vec::from(["sleep".to_string(), "1".to_string()])),
                    ..Default::default()
                },
            )
            .await?;

        let rslt = self.download_file(&name, image, source, dest).await;
        self.remove_container(&name).await;
        rslt
    }
}

async fn follow_logs(docker: Docker, name: String) {
    let mut logs = docker.logs(
        &name,
        Some(LogsOptions::<String> {
            stdout: true,
            stderr: true,
            follow: true,
            tail: "all".to_string(),
            ..Default::default()
        }),
    );
    while let Some(entry) = logs.next().await {
        match entry {
            Ok(LogOutput::StdOut { message } | LogOutput::Console { message }) => {
                info!(container = %name, "{}", String::from_utf8_lossy(&message).trim_end());
            }
            Ok(LogOutput::StdErr { message }) => {
                warn!(container = %name, "{}", String::from_utf8_lossy(&message).trim_end());
            }
            Ok(_) => {}
            Err(err) => {
                debug!(container = %name, %err, "log stream ended");
                break;
            }
        }
    }
}

/// Splits an image reference into repository and tag, defaulting the tag to `latest`. The split is
/// on the last colon so registry ports are not mistaken for tags.
fn split_reference(reference: &str) -> (&str, &str) {
    match reference.rsplit_once(':') {
        Some((repo, tag)) if !tag.contains('/') => (repo, tag),
        _ => (reference, "latest"),
    }
}

#[cfg(test)]
mod tests {
    use super::split_reference;

    #[test]
    fn reference_splitting() {
        assert_eq!(
            split_reference("ada/gradient-boost:3"),
            ("ada/gradient-boost", "3")
        );
        assert_eq!(split_reference("python"), ("python", "latest"));
        assert_eq!(
            split_reference("registry.example.com:5000/team/model"),
            ("registry.example.com:5000/team/model", "latest")
        );
        assert_eq!(
            split_reference("registry.example.com:5000/team/model:v2"),
            ("registry.example.com:5000/team/model", "v2")
        );
    }
}
