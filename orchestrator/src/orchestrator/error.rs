use trainyard_orchestrator_core::{blobstore, datastore, datastore::models::JobId};

/// Errors raised by job orchestrations and the submission and status services.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A submission was rejected before any state was created.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// The caller is neither the job's owner nor an administrator.
    #[error("not authorized")]
    NotAuthorized,
    #[error("unknown job {0}")]
    UnknownJob(JobId),
    #[error("unknown model {0}")]
    UnknownModel(i64),
    #[error("unknown training run {0}")]
    UnknownTraining(i64),
    /// A dataset is in a format workloads cannot consume.
    #[error("unsupported dataset format: {0}")]
    DatasetFormat(String),
    /// The workload finished successfully but did not leave the expected output behind.
    #[error("workload produced no usable output: {0}")]
    MissingOutput(String),
    /// A stop request was observed at an orchestration checkpoint. Not a failure; the
    /// orchestration unwinds and marks the job STOPPED.
    #[error("stop requested")]
    StopRequested,
    #[error("container runner error: {0}")]
    Runner(#[from] crate::runner::Error),
    #[error("datastore error: {0}")]
    Datastore(#[from] datastore::Error),
    #[error("object store error: {0}")]
    BlobStore(#[from] blobstore::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// The message recorded on the job row when this error ends an orchestration.
    pub fn message_for_job(&self) -> String {
        self.to_string()
    }
}
