//! Job status reads and stop requests.

use crate::{
    orchestrator::Error,
    runner::{ContainerRunner, RunHandle},
};
use chrono::NaiveDateTime;
use std::sync::Arc;
use tracing::info;
use trainyard_core::time::Clock;
use trainyard_orchestrator_core::datastore::{
    Datastore,
    models::{Job, JobId, JobKind, JobState},
};

/// The identity a status or stop request is made under. Non-administrators can only see and
/// stop their own jobs.
#[derive(Clone, Debug)]
pub struct Requester {
    username: String,
    is_admin: bool,
}

impl Requester {
    pub fn new(username: String, is_admin: bool) -> Self {
        Self { username, is_admin }
    }

    fn can_access(&self, owner: &str) -> bool {
        self.is_admin || self.username == owner
    }
}

/// A point-in-time snapshot of a job, as reported to callers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JobStatus {
    pub job_id: JobId,
    pub kind: JobKind,
    pub state: JobState,
    pub owner: String,
    pub stop_requested: bool,
    pub error_message: Option<String>,
    pub training_id: Option<i64>,
    pub model_id: Option<i64>,
    pub execution_id: Option<i64>,
    pub created_at: NaiveDateTime,
    pub started_at: Option<NaiveDateTime>,
    pub finished_at: Option<NaiveDateTime>,
}

impl From<&Job> for JobStatus {
    fn from(job: &Job) -> Self {
        Self {
            job_id: *job.id(),
            kind: *job.kind(),
            state: *job.state(),
            owner: job.owner().to_string(),
            stop_requested: job.stop_requested(),
            error_message: job.error_message().map(str::to_string),
            training_id: job.training_id(),
            model_id: job.model_id(),
            execution_id: job.execution_id(),
            created_at: *job.created_at(),
            started_at: job.started_at().copied(),
            finished_at: job.finished_at().copied(),
        }
    }
}

/// Read-side service for jobs: status snapshots and stop requests.
pub struct JobStatusService<C: Clock> {
    datastore: Arc<Datastore<C>>,
    runner: Arc<dyn ContainerRunner>,
}

impl<C: Clock> JobStatusService<C> {
    pub fn new(datastore: Arc<Datastore<C>>, runner: Arc<dyn ContainerRunner>) -> Self {
        Self { datastore, runner }
    }

    /// Returns a snapshot of the job, if the requester may see it.
    pub async fn status(&self, requester: &Requester, job_id: &JobId) -> Result<JobStatus, Error> {
        let job = self.authorized_job(requester, job_id).await?;
        Ok(JobStatus::from(&job))
    }

    /// Raises the job's stop flag. The running orchestration observes the flag at its next
    /// checkpoint; if a workload has already been submitted, it is additionally torn down here
    /// so a long-running workload does not delay the stop. The flag can be raised in any job
    /// state; raising it on a finished job has no effect beyond the flag itself.
    pub async fn request_stop(&self, requester: &Requester, job_id: &JobId) -> Result<(), Error> {
        let job = self.authorized_job(requester, job_id).await?;
        {
            let job_id = *job_id;
            self.datastore
                .run_tx("request job stop", move |tx| {
                    Box::pin(async move { tx.request_job_stop(&job_id).await })
                })
                .await?;
        }
        info!(%job_id, "stop requested");

        if !job.state().is_terminal() {
            if let Some(handle) = job.external_handle() {
                self.runner
                    .cancel(&RunHandle::new(handle.to_string()))
                    .await;
            }
        }
        Ok(())
    }

    async fn authorized_job(&self, requester: &Requester, job_id: &JobId) -> Result<Job, Error> {
        let job = {
            let job_id = *job_id;
            self.datastore
                .run_tx("get job for status", move |tx| {
                    Box::pin(async move { tx.get_job(&job_id).await })
                })
                .await?
                .ok_or(Error::UnknownJob(job_id))?
        };
        if !requester.can_access(job.owner()) {
            return Err(Error::NotAuthorized);
        }
        Ok(job)
    }
}
