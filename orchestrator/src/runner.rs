//! Container execution backends.
//!
//! A [`ContainerRunner`] takes a prepared image and a pair of exchange directories, runs the
//! workload to completion on some container backend, and tears it down again. Two backends are
//! provided: a local Docker daemon ([`docker`]) and a Kubernetes cluster ([`kubernetes`]). The
//! backend is chosen by configuration at startup.

use async_trait::async_trait;
use std::{
    fmt::{self, Debug, Display, Formatter},
    path::{Path, PathBuf},
    time::Duration,
};
use trainyard_orchestrator_core::datastore::models::JobId;

pub mod docker;
pub mod kubernetes;
#[cfg(feature = "test-util")]
#[cfg_attr(docsrs, doc(cfg(feature = "test-util")))]
pub mod test_util;

/// Errors returned by container backends.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Docker API error: {0}")]
    Docker(#[from] bollard::errors::Error),
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),
    /// The workload ran to completion with a non-zero exit code.
    #[error("workload exited with code {exit_code}")]
    WorkloadFailed { exit_code: i64 },
    /// The workload did not finish within the configured run timeout.
    #[error("workload did not finish within {timeout:?}")]
    Timeout { timeout: Duration },
    /// The backend accepted the workload but never started running it.
    #[error("workload was not scheduled within {timeout:?}")]
    NotScheduled { timeout: Duration },
    /// An image could not be made available on the backend.
    #[error("image {image} is not available: {reason}")]
    ImageUnavailable { image: String, reason: String },
    /// A file expected inside an image was not found.
    #[error("file {path} not found in image {image}")]
    FileNotFound { image: String, path: String },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Where a workload's image comes from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ImageSpec {
    /// An image pulled from a registry by reference.
    Registry { image: String },
    /// An image loaded from a local tar archive, then tagged with the given reference.
    Archive { tar_path: PathBuf, tag: String },
}

impl ImageSpec {
    /// The image reference workloads are started from, once the image has been prepared.
    pub fn reference(&self) -> &str {
        match self {
            Self::Registry { image } => image,
            Self::Archive { tag, .. } => tag,
        }
    }
}

/// The flavor of workload being run. This determines the workload's name on the backend and
/// shows up in its labels.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkloadKind {
    Training,
    Prediction,
}

impl WorkloadKind {
    fn as_label(&self) -> &'static str {
        match self {
            Self::Training => "train",
            Self::Prediction => "predict",
        }
    }
}

impl Display for WorkloadKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_label())
    }
}

/// How the workload's process is started.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Entrypoint {
    /// Run the image's own entrypoint unchanged.
    Image,
    /// Run a Python script that has been staged into the input directory.
    Script { file_name: String },
}

/// A single workload to run. The input and output directories are made visible inside the
/// container, and their container-side paths are passed to the workload via the `DATA_DIR` and
/// `MODEL_DIR` environment variables.
#[derive(Clone, Debug)]
pub struct RunRequest {
    /// The job this workload belongs to. Workload names are derived from it, so retries of the
    /// same job land on the same backend object.
    pub job_id: JobId,
    pub kind: WorkloadKind,
    /// Image reference to run. The image must already have been prepared via
    /// [`ContainerRunner::prepare_image`].
    pub image: String,
    pub entrypoint: Entrypoint,
    /// Directory holding the workload's inputs.
    pub input_dir: PathBuf,
    /// Directory the workload writes its outputs into.
    pub output_dir: PathBuf,
}

/// Identity of a submitted workload on its backend: a Docker container name or a Kubernetes Job
/// name. Handles are recorded in the job record at submission time, so a workload can still be
/// torn down by a different process than the one that submitted it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunHandle(String);

impl RunHandle {
    pub fn new(name: String) -> Self {
        Self(name)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for RunHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Returns the backend name for a job's workload. The name is a pure function of the job ID.
pub(crate) fn workload_name(kind: WorkloadKind, job_id: &JobId) -> String {
    format!("trainyard-{}-{}", kind.as_label(), job_id)
}

/// A backend that can run containerized workloads.
#[async_trait]
pub trait ContainerRunner: Debug + Send + Sync {
    /// Makes an image runnable on this backend: pulls it from a registry, or loads it from a tar
    /// archive and tags it. Already-present images are left alone.
    async fn prepare_image(&self, image: &ImageSpec) -> Result<(), Error>;

    /// Creates and starts the workload, returning its handle as soon as the backend has accepted
    /// it.
    async fn submit(&self, request: &RunRequest) -> Result<RunHandle, Error>;

    /// Waits for a submitted workload to finish, streaming its logs into this process's logs.
    /// Returns Ok only on a zero exit; tears the workload down in every case, including when the
    /// wall-clock timeout elapses first.
    async fn wait(&self, handle: &RunHandle, timeout: Duration) -> Result<(), Error>;

    /// Best-effort teardown of a workload that may still be running. Errors are logged and
    /// swallowed; the workload may already be gone.
    async fn cancel(&self, handle: &RunHandle);

    /// Copies a single file out of an image onto the local filesystem, without running the
    /// image's entrypoint.
    async fn copy_file_from_image(
        &self,
        image: &str,
        source: &Path,
        dest: &Path,
    ) -> Result<(), Error>;
}

#[cfg(test)]
mod tests {
    use super::{ImageSpec, WorkloadKind, workload_name};
    use rand::random;
    use std::path::PathBuf;
    use trainyard_orchestrator_core::datastore::models::JobId;

    #[test]
    fn image_spec_reference() {
        assert_eq!(
            ImageSpec::Registry {
                image: "docker.io/library/python:3.12".to_string()
            }
            .reference(),
            "docker.io/library/python:3.12"
        );
        assert_eq!(
            ImageSpec::Archive {
                tar_path: PathBuf::from("/tmp/algo.tar"),
                tag: "ada/gradient-boost:3".to_string()
            }
            .reference(),
            "ada/gradient-boost:3"
        );
    }

    #[test]
    fn workload_names_are_deterministic() {
        let job_id: JobId = random();
        assert_eq!(
            workload_name(WorkloadKind::Training, &job_id),
            workload_name(WorkloadKind::Training, &job_id),
        );
        assert_eq!(
            workload_name(WorkloadKind::Training, &job_id),
            format!("trainyard-train-{job_id}"),
        );
        assert_eq!(
            workload_name(WorkloadKind::Prediction, &job_id),
            format!("trainyard-predict-{job_id}"),
        );
    }
}
