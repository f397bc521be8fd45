//! Workload execution on a Kubernetes cluster.
//!
//! Workloads run as Kubernetes Jobs. Input and output directories are exchanged through a shared
//! `ReadWriteMany` volume which must be mounted both into this process and into every workload
//! pod, so the directories handed to [`KubernetesRunner`] must live under the configured shared
//! volume root.

use crate::{
    config::KubernetesConfig,
    runner::{ContainerRunner, Entrypoint, Error, ImageSpec, RunHandle, RunRequest, workload_name},
};
use anyhow::anyhow;
use async_trait::async_trait;
use educe::Educe;
use futures::{AsyncBufReadExt, TryStreamExt};
use k8s_openapi::{
    api::{
        batch::v1::{Job, JobSpec},
        core::v1::{
            Container, EnvVar, HostPathVolumeSource, PersistentVolumeClaimVolumeSource, Pod,
            PodSpec, PodTemplateSpec, ResourceRequirements, SecurityContext, Volume, VolumeMount,
        },
    },
    apimachinery::pkg::{api::resource::Quantity, apis::meta::v1::ObjectMeta},
};
use kube::{
    Api, ResourceExt,
    api::{DeleteParams, ListParams, LogParams, PostParams},
};
use std::{collections::BTreeMap, path::Path, time::Duration};
use tokio::time::Instant;
use tracing::{debug, info, trace};

/// Pod-side mount point of the shared volume.
const SHARED_MOUNT: &str = "/shared";
const SHARED_VOLUME_NAME: &str = "shared-storage";
const DOCKER_SOCKET_VOLUME_NAME: &str = "docker-socket";
/// Image used for helper pods that talk to the node's container runtime.
const DOCKER_CLI_IMAGE: &str = "docker:24-cli";

const POD_POLL_INTERVAL: Duration = Duration::from_secs(1);
const STATUS_POLL_INTERVAL: Duration = Duration::from_secs(2);
/// Finished jobs are garbage-collected by the cluster after this long, in case this process dies
/// before its own teardown runs.
const FINISHED_JOB_TTL_SECS: i32 = 300;

/// A [`ContainerRunner`] backed by a Kubernetes cluster.
#[derive(Clone, Educe)]
#[educe(Debug)]
pub struct KubernetesRunner {
    #[educe(Debug(ignore))]
    client: kube::Client,
    config: KubernetesConfig,
}

/// A short-lived pod that runs one shell script to completion.
struct HelperPod<'a> {
    purpose: &'a str,
    image: &'a str,
    script: String,
    /// Mount the node's Docker socket and run privileged.
    docker_socket: bool,
    mount_shared: bool,
}

impl KubernetesRunner {
    /// Connects to the cluster using the ambient Kubernetes configuration (in-cluster service
    /// account or local kubeconfig).
    pub async fn new(config: KubernetesConfig) -> Result<Self, Error> {
        let client = kube::Client::try_default().await?;
        Ok(Self { client, config })
    }

    fn jobs(&self) -> Api<Job> {
        Api::namespaced(self.client.clone(), &self.config.namespace)
    }

    fn pods(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.config.namespace)
    }

    fn shared_path(&self, path: &Path) -> Result<String, Error> {
        shared_path(&self.config.shared_volume_root, path)
    }

    fn shared_volume(&self) -> Volume {
        Volume {
            name: SHARED_VOLUME_NAME.to_string(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: self.config.shared_pvc.clone(),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn build_job(&self, request: &RunRequest, name: &str) -> Result<Job, Error> {
        let data_dir = self.shared_path(&request.input_dir)?;
        let model_dir = self.shared_path(&request.output_dir)?;
        let command = match &request.entrypoint {
            Entrypoint::Image => None,
            Entrypoint::Script { file_name } => Some(Vec::from([
                "sh".to_string(),
                "-c".to_string(),
                format!("python {data_dir}/{file_name}"),
            ])),
        };

        Ok(Job {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: Some(BTreeMap::from([(
                    "app".to_string(),
                    format!("trainyard-{}", request.kind),
                )])),
                ..Default::default()
            },
            spec: Some(JobSpec {
                // The workload is not restarted on failure; failure handling belongs to the
                // orchestration pipeline.
                backoff_limit: Some(0),
                ttl_seconds_after_finished: Some(FINISHED_JOB_TTL_SECS),
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(BTreeMap::from([(
                            "job-name".to_string(),
                            name.to_string(),
                        )])),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        containers: Vec::from([Container {
                            name: "workload".to_string(),
                            image: Some(request.image.clone()),
                            image_pull_policy: Some("IfNotPresent".to_string()),
                            command,
                            env: Some(Vec::from([
                                EnvVar {
                                    name: "DATA_DIR".to_string(),
                                    value: Some(data_dir),
                                    ..Default::default()
                                },
                                EnvVar {
                                    name: "MODEL_DIR".to_string(),
                                    value: Some(model_dir),
                                    ..Default::default()
                                },
                            ])),
                            volume_mounts: Some(Vec::from([shared_volume_mount()])),
                            resources: Some(ResourceRequirements {
                                requests: Some(BTreeMap::from([(
                                    "memory".to_string(),
                                    Quantity(self.config.memory_request.clone()),
                                )])),
                                limits: Some(BTreeMap::from([(
                                    "memory".to_string(),
                                    Quantity(self.config.memory_limit.clone()),
                                )])),
                                ..Default::default()
                            }),
                            ..Default::default()
                        }]),
                        restart_policy: Some("Never".to_string()),
                        volumes: Some(Vec::from([self.shared_volume()])),
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            ..Default::default()
        })
    }

    /// Waits for the job controller to create the workload pod, returning its name.
    async fn await_pod(&self, pods: &Api<Pod>, job_name: &str) -> Result<String, Error> {
        let timeout = self.config.pod_scheduling_timeout();
        let deadline = Instant::now() + timeout;
        let params = ListParams::default().labels(&format!("job-name={job_name}"));
        loop {
            if let Some(pod) = pods.list(&params).await?.items.into_iter().next() {
                return Ok(pod.name_unchecked());
            }
            if Instant::now() >= deadline {
                return Err(Error::NotScheduled { timeout });
            }
            tokio::time::sleep(POD_POLL_INTERVAL).await;
        }
    }

    async fn wait_inner(&self, name: &str, timeout: Duration) -> Result<(), Error> {
        let jobs = self.jobs();
        let pods = self.pods();

        let pod_name = self.await_pod(&pods, name).await?;
        let log_task = tokio::task::spawn(follow_pod_logs(pods.clone(), pod_name.clone()));

        let deadline = Instant::now() + timeout;
        let rslt = loop {
            match jobs.get_status(name).await {
                Ok(job) => {
                    let status = job.status.unwrap_or_default();
                    if status.succeeded.unwrap_or(0) > 0 {
                        break Ok(());
                    }
                    if status.failed.unwrap_or(0) > 0 {
                        break Err(Error::WorkloadFailed {
                            exit_code: pod_exit_code(&pods, &pod_name).await,
                        });
                    }
                }
                Err(err) => break Err(err.into()),
            }
            if Instant::now() >= deadline {
                break Err(Error::Timeout { timeout });
            }
            tokio::time::sleep(STATUS_POLL_INTERVAL).await;
        };
        log_task.abort();
        rslt
    }

    async fn delete_job(&self, name: &str) {
        if let Err(err) = self.jobs().delete(name, &DeleteParams::background()).await {
            debug!(job = %name, %err, "couldn't delete job");
        }
    }

    /// Runs a helper pod to completion and returns its exit code. The pod is deleted afterwards
    /// in every case.
    async fn run_helper_pod(&self, helper: HelperPod<'_>) -> Result<i64, Error> {
        let name = format!("trainyard-{}-{:08x}", helper.purpose, rand::random::<u32>());
        let pods = self.pods();

        let mut volume_mounts = Vec::new();
        let mut volumes = Vec::new();
        if helper.docker_socket {
            volume_mounts.push(VolumeMount {
                name: DOCKER_SOCKET_VOLUME_NAME.to_string(),
                mount_path: "/var/run/docker.sock".to_string(),
                ..Default::default()
            });
            volumes.push(Volume {
                name: DOCKER_SOCKET_VOLUME_NAME.to_string(),
                host_path: Some(HostPathVolumeSource {
                    path: "/var/run/docker.sock".to_string(),
                    type_: Some("Socket".to_string()),
                }),
                ..Default::default()
            });
        }
        if helper.mount_shared {
            volume_mounts.push(shared_volume_mount());
            volumes.push(self.shared_volume());
        }

        let pod = Pod {
            metadata: ObjectMeta {
                name: Some(name.clone()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                containers: Vec::from([Container {
                    name: "helper".to_string(),
                    image: Some(helper.image.to_string()),
                    command: Some(Vec::from([
                        "sh".to_string(),
                        "-c".to_string(),
                        helper.script,
                    ])),
                    security_context: helper.docker_socket.then(|| SecurityContext {
                        privileged: Some(true),
                        ..Default::default()
                    }),
                    volume_mounts: Some(volume_mounts),
                    ..Default::default()
                }]),
                restart_policy: Some("Never".to_string()),
                volumes: Some(volumes),
                ..Default::default()
            }),
            ..Default::default()
        };

        pods.create(&PostParams::default(), &pod).await?;
        let rslt = self.await_pod_exit(&pods, &name).await;
        if let Err(err) = pods.delete(&name, &DeleteParams::default()).await {
            debug!(pod = %name, %err, "couldn't delete helper pod");
        }
        rslt
    }

    async fn await_pod_exit(&self, pods: &Api<Pod>, name: &str) -> Result<i64, Error> {
        let timeout = self.config.helper_timeout();
        let deadline = Instant::now() + timeout;
        loop {
            let pod = pods.get(name).await?;
            let terminated = pod
                .status
                .and_then(|status| status.container_statuses)
                .and_then(|statuses| statuses.into_iter().next())
                .and_then(|status| status.state)
                .and_then(|state| state.terminated);
            if let Some(terminated) = terminated {
                return Ok(i64::from(terminated.exit_code));
            }
            if Instant::now() >= deadline {
                return Err(Error::Timeout { timeout });
            }
            tokio::time::sleep(POD_POLL_INTERVAL).await;
        }
    }

    /// Returns whether the node's container runtime already has the image. The decision is made
    /// from the inspect command's exit code, never by parsing listing output.
    async fn image_present(&self, tag: &str) -> Result<bool, Error> {
        let exit_code = self
            .run_helper_pod(HelperPod {
                purpose: "check",
                image: DOCKER_CLI_IMAGE,
                script: format!("docker image inspect \"{tag}\" > /dev/null 2>&1"),
                docker_socket: true,
                mount_shared: false,
            })
            .await?;
        Ok(exit_code == 0)
    }

    async fn load_archive(&self, tar_path: &Path, tag: &str) -> Result<(), Error> {
        if self.image_present(tag).await? {
            debug!(image = %tag, "image already present on node, skipping archive load");
            return Ok(());
        }

        let shared_tar = self.shared_path(tar_path)?;
        info!(image = %tag, archive = %shared_tar, "loading image archive on node");
        let script = format!(
            "OUTPUT=$(docker load -i \"{shared_tar}\") && \
             LOADED=$(echo \"$OUTPUT\" | sed -n 's/^Loaded image: //p') && \
             if [ -n \"$LOADED\" ] && [ \"$LOADED\" != \"{tag}\" ]; then docker tag \"$LOADED\" \"{tag}\"; fi && \
             docker image inspect \"{tag}\" > /dev/null"
        );
        let exit_code = self
            .run_helper_pod(HelperPod {
                purpose: "load",
                image: DOCKER_CLI_IMAGE,
                script,
                docker_socket: true,
                mount_shared: true,
            })
            .await?;
        if exit_code != 0 {
            return Err(Error::ImageUnavailable {
                image: tag.to_string(),
                reason: format!("image load pod exited with code {exit_code}"),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ContainerRunner for KubernetesRunner {
    async fn prepare_image(&self, image: &ImageSpec) -> Result<(), Error> {
        match image {
            // Nodes pull registry images themselves when the workload pod starts.
            ImageSpec::Registry { .. } => Ok(()),
            ImageSpec::Archive { tar_path, tag } => self.load_archive(tar_path, tag).await,
        }
    }

    async fn submit(&self, request: &RunRequest) -> Result<RunHandle, Error> {
        let name = workload_name(request.kind, &request.job_id);
        let job = self.build_job(request, &name)?;
        self.jobs().create(&PostParams::default(), &job).await?;
        info!(job = %name, image = %request.image, "created Kubernetes job");
        Ok(RunHandle::new(name))
    }

    async fn wait(&self, handle: &RunHandle, timeout: Duration) -> Result<(), Error> {
        let rslt = self.wait_inner(handle.as_str(), timeout).await;
        // Teardown happens regardless of how the wait came out.
        self.delete_job(handle.as_str()).await;
        rslt
    }

    async fn cancel(&self, handle: &RunHandle) {
        self.delete_job(handle.as_str()).await;
    }

    async fn copy_file_from_image(
        &self,
        image: &str,
        source: &Path,
        dest: &Path,
    ) -> Result<(), Error> {
        // A helper pod running the image itself copies the file onto the shared volume, which
        // makes it visible at `dest` locally.
        let dest_shared = self.shared_path(dest)?;
        let exit_code = self
            .run_helper_pod(HelperPod {
                purpose: "copy",
                image,
                script: format!("cp \"{}\" \"{dest_shared}\"", source.display()),
                docker_socket: false,
                mount_shared: true,
            })
            .await?;
        if exit_code != 0 {
            return Err(Error::FileNotFound {
                image: image.to_string(),
                path: source.display().to_string(),
            });
        }
        Ok(())
    }
}

fn shared_volume_mount() -> VolumeMount {
    VolumeMount {
        name: SHARED_VOLUME_NAME.to_string(),
        mount_path: SHARED_MOUNT.to_string(),
        ..Default::default()
    }
}

/// Translates a local path under the shared volume root into the path workload pods see.
fn shared_path(shared_volume_root: &Path, path: &Path) -> Result<String, Error> {
    let relative = path.strip_prefix(shared_volume_root).map_err(|_| {
        Error::Other(anyhow!(
            "path {} is not under the shared volume root {}",
            path.display(),
            shared_volume_root.display()
        ))
    })?;
    Ok(format!("{SHARED_MOUNT}/{}", relative.display()))
}

async fn pod_exit_code(pods: &Api<Pod>, pod_name: &str) -> i64 {
    match pods.get(pod_name).await {
        Ok(pod) => pod
            .status
            .and_then(|status| status.container_statuses)
            .and_then(|statuses| statuses.into_iter().next())
            .and_then(|status| status.state)
            .and_then(|state| state.terminated)
            .map(|terminated| i64::from(terminated.exit_code))
            .unwrap_or(-1),
        Err(_) => -1,
    }
}

async fn follow_pod_logs(pods: Api<Pod>, pod_name: String) {
    // The container may not have started when logs are first requested; retry until the stream
    // opens. This task is aborted once the workload finishes.
    let params = LogParams {
        follow: true,
        ..Default::default()
    };
    let stream = loop {
        match pods.log_stream(&pod_name, &params).await {
            Ok(stream) => break stream,
            Err(err) => {
                trace!(pod = %pod_name, %err, "log stream not ready");
                tokio::time::sleep(POD_POLL_INTERVAL).await;
            }
        }
    };
    let mut lines = stream.lines();
    while let Ok(Some(line)) = lines.try_next().await {
        info!(pod = %pod_name, "{line}");
    }
}

#[cfg(test)]
mod tests {
    use super::{SHARED_MOUNT, shared_path};
    use std::path::Path;

    #[test]
    fn shared_path_translation() {
        let translated = shared_path(
            Path::new("/srv/shared"),
            Path::new("/srv/shared/training-ds-abc/dataset.csv"),
        )
        .unwrap();
        assert_eq!(
            translated,
            format!("{SHARED_MOUNT}/training-ds-abc/dataset.csv")
        );
    }

    #[test]
    fn shared_path_outside_root_is_refused() {
        shared_path(Path::new("/srv/shared"), Path::new("/tmp/training-ds-abc")).unwrap_err();
    }
}
