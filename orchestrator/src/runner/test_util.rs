//! Testing functionality for container backends.

use crate::runner::{ContainerRunner, Error, ImageSpec, RunHandle, RunRequest, workload_name};
use async_trait::async_trait;
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Mutex,
    time::Duration,
};
use tokio::sync::Notify;

/// How a [`StubRunner`] workload behaves once waited on.
#[derive(Clone, Debug, Default)]
pub enum WaitOutcome {
    /// Write the scripted output files, then finish successfully.
    #[default]
    Success,
    /// Finish with a non-zero exit code, writing nothing.
    Failure { exit_code: i64 },
    /// Exceed the caller's wait timeout without finishing.
    Timeout,
    /// Never finish. Once cancelled, fail the way a killed workload would.
    BlockUntilCancelled,
}

#[derive(Debug, Default)]
struct State {
    wait_outcome: WaitOutcome,
    outputs: Vec<(String, Vec<u8>)>,
    image_files: HashMap<PathBuf, Vec<u8>>,
    prepare_error: Option<String>,
    prepared: Vec<ImageSpec>,
    submitted: Vec<RunRequest>,
    waited: Vec<String>,
    cancelled: Vec<String>,
    requests_by_handle: HashMap<String, RunRequest>,
}

/// A scriptable in-process [`ContainerRunner`]. Instead of running anything, it records the
/// calls made against it, and "finishes" workloads by writing configured files into the
/// request's output directory.
#[derive(Debug, Default)]
pub struct StubRunner {
    state: Mutex<State>,
    cancel_notify: Notify,
}

impl StubRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scripts the outcome of [`ContainerRunner::wait`] calls.
    pub fn with_wait_outcome(self, wait_outcome: WaitOutcome) -> Self {
        self.state.lock().unwrap().wait_outcome = wait_outcome;
        self
    }

    /// Scripts a file the "workload" writes into its output directory on success.
    pub fn with_output(self, file_name: &str, content: &[u8]) -> Self {
        self.state
            .lock()
            .unwrap()
            .outputs
            .push((file_name.to_string(), content.to_vec()));
        self
    }

    /// Scripts a file that can be copied out of any image.
    pub fn with_image_file(self, path: &str, content: &[u8]) -> Self {
        self.state
            .lock()
            .unwrap()
            .image_files
            .insert(PathBuf::from(path), content.to_vec());
        self
    }

    /// Makes [`ContainerRunner::prepare_image`] fail with the given reason.
    pub fn with_prepare_error(self, reason: &str) -> Self {
        self.state.lock().unwrap().prepare_error = Some(reason.to_string());
        self
    }

    pub fn prepared_images(&self) -> Vec<ImageSpec> {
        self.state.lock().unwrap().prepared.clone()
    }

    pub fn submitted_requests(&self) -> Vec<RunRequest> {
        self.state.lock().unwrap().submitted.clone()
    }

    pub fn waited_handles(&self) -> Vec<String> {
        self.state.lock().unwrap().waited.clone()
    }

    pub fn cancelled_handles(&self) -> Vec<String> {
        self.state.lock().unwrap().cancelled.clone()
    }
}

#[async_trait]
impl ContainerRunner for StubRunner {
    async fn prepare_image(&self, image: &ImageSpec) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        state.prepared.push(image.clone());
        if let Some(reason) = &state.prepare_error {
            return Err(Error::ImageUnavailable {
                image: image.reference().to_string(),
                reason: reason.clone(),
            });
        }
        Ok(())
    }

    async fn submit(&self, request: &RunRequest) -> Result<RunHandle, Error> {
        let name = workload_name(request.kind, &request.job_id);
        let mut state = self.state.lock().unwrap();
        state.submitted.push(request.clone());
        state
            .requests_by_handle
            .insert(name.clone(), request.clone());
        Ok(RunHandle::new(name))
    }

    async fn wait(&self, handle: &RunHandle, timeout: Duration) -> Result<(), Error> {
        let (outcome, outputs, output_dir) = {
            let mut state = self.state.lock().unwrap();
            state.waited.push(handle.to_string());
            let output_dir = state
                .requests_by_handle
                .get(handle.as_str())
                .map(|request| request.output_dir.clone());
            (state.wait_outcome.clone(), state.outputs.clone(), output_dir)
        };

        match outcome {
            WaitOutcome::Success => {
                if let Some(output_dir) = output_dir {
                    for (file_name, content) in outputs {
                        tokio::fs::write(output_dir.join(file_name), content).await?;
                    }
                }
                Ok(())
            }
            WaitOutcome::Failure { exit_code } => Err(Error::WorkloadFailed { exit_code }),
            WaitOutcome::Timeout => Err(Error::Timeout { timeout }),
            WaitOutcome::BlockUntilCancelled => {
                self.cancel_notify.notified().await;
                Err(Error::WorkloadFailed { exit_code: 137 })
            }
        }
    }

    async fn cancel(&self, handle: &RunHandle) {
        self.state
            .lock()
            .unwrap()
            .cancelled
            .push(handle.to_string());
        self.cancel_notify.notify_one();
    }

    async fn copy_file_from_image(
        &self,
        image: &str,
        source: &Path,
        dest: &Path,
    ) -> Result<(), Error> {
        let content = self.state.lock().unwrap().image_files.get(source).cloned();
        match content {
            Some(content) => {
                tokio::fs::write(dest, content).await?;
                Ok(())
            }
            None => Err(Error::FileNotFound {
                image: image.to_string(),
                path: source.display().to_string(),
            }),
        }
    }
}
