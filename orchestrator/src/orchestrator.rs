//! Job orchestration.
//!
//! An orchestration drives one submitted job from PENDING to a terminal state: it stages the
//! workload's inputs into an exchange directory, runs the workload on a container backend,
//! publishes the outputs, and records the outcome. Each flavor of job (custom or builtin,
//! training or prediction) provides a [`JobPipeline`] implementation with the flavor-specific
//! staging and publication steps; [`run_job`] supplies the shared lifecycle around them.
//!
//! Every datastore access is its own short transaction. Nothing holds a database transaction
//! open across a workload run, so concurrent orchestrations and status reads never contend on
//! more than single-row updates.
//!
//! Cancellation is cooperative: callers raise the job's stop flag, and the orchestration polls
//! it at checkpoints between phases. A stop observed at a checkpoint unwinds any artifacts
//! uploaded so far and marks the job STOPPED rather than FAILED.

use crate::{
    runner::{ContainerRunner, Entrypoint, RunHandle, RunRequest, WorkloadKind},
    workdir::WorkdirFactory,
};
use async_trait::async_trait;
use chrono::NaiveDateTime;
use opentelemetry::{
    KeyValue,
    metrics::{Counter, Histogram, Meter},
};
use std::{
    fmt::Debug,
    path::Path,
    sync::Arc,
    time::{Duration, Instant},
};
use tracing::{error, info, warn};
use trainyard_core::time::Clock;
use trainyard_orchestrator_core::{
    blobstore::{BlobStore, BucketConfig, BucketKind},
    datastore::{Datastore, models::JobId},
};

pub mod algorithm;
pub mod driver;
mod error;
pub mod params;
pub mod prediction;
pub mod status;
pub mod submitter;
pub mod training;
#[cfg(test)]
mod tests;

pub use error::Error;

pub const JOB_OUTCOME_METER_NAME: &str = "trainyard_job_outcomes";
pub const WORKLOAD_DURATION_METER_NAME: &str = "trainyard_workload_duration";

/// Shared handles every orchestration runs against.
pub struct Components<C: Clock> {
    datastore: Arc<Datastore<C>>,
    runner: Arc<dyn ContainerRunner>,
    blobstore: Arc<dyn BlobStore>,
    buckets: BucketConfig,
    workdirs: WorkdirFactory,
    delay: Arc<dyn DelayStrategy>,
    run_timeout: Duration,
    builtin_runner_image: String,
    clock: C,
    job_outcome_counter: Counter<u64>,
    workload_duration_histogram: Histogram<f64>,
}

impl<C: Clock> Components<C> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        datastore: Arc<Datastore<C>>,
        runner: Arc<dyn ContainerRunner>,
        blobstore: Arc<dyn BlobStore>,
        buckets: BucketConfig,
        workdirs: WorkdirFactory,
        delay: Arc<dyn DelayStrategy>,
        run_timeout: Duration,
        builtin_runner_image: String,
        clock: C,
        meter: &Meter,
    ) -> Self {
        let job_outcome_counter = meter
            .u64_counter(JOB_OUTCOME_METER_NAME)
            .with_description("Count of finished job orchestrations, by job kind and outcome.")
            .with_unit("{job}")
            .build();
        let workload_duration_histogram = meter
            .f64_histogram(WORKLOAD_DURATION_METER_NAME)
            .with_description("Wall-clock duration of container workloads.")
            .with_unit("s")
            .build();
        Self {
            datastore,
            runner,
            blobstore,
            buckets,
            workdirs,
            delay,
            run_timeout,
            builtin_runner_image,
            clock,
            job_outcome_counter,
            workload_duration_histogram,
        }
    }

    pub fn datastore(&self) -> &Datastore<C> {
        &self.datastore
    }

    pub fn runner(&self) -> &dyn ContainerRunner {
        self.runner.as_ref()
    }

    pub fn blobstore(&self) -> &dyn BlobStore {
        self.blobstore.as_ref()
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    /// The image used to run builtin training and prediction workloads.
    pub fn builtin_runner_image(&self) -> &str {
        &self.builtin_runner_image
    }

    /// Resolves a storage area to its bucket name.
    pub fn bucket(&self, kind: BucketKind) -> &str {
        self.buckets.resolve(kind)
    }

    /// Returns the key a newly published artifact is stored under. Keys embed the owner and a
    /// timestamp, so re-runs never overwrite earlier artifacts.
    pub fn artifact_key(&self, owner: &str, file_name: &str) -> String {
        artifact_key_at(owner, self.clock.now(), file_name)
    }

    /// Raises [`Error::StopRequested`] if a stop has been requested for the job. Each check is a
    /// fresh read, so a stop raised by another process is observed at the next checkpoint.
    pub async fn stop_checkpoint(&self, job_id: &JobId) -> Result<(), Error> {
        if self.stop_flag(job_id).await? {
            return Err(Error::StopRequested);
        }
        Ok(())
    }

    async fn stop_flag(&self, job_id: &JobId) -> Result<bool, Error> {
        let job_id = *job_id;
        self.datastore
            .run_tx("get job stop flag", move |tx| {
                Box::pin(async move { tx.get_job_stop_requested(&job_id).await })
            })
            .await?
            .ok_or(Error::UnknownJob(job_id))
    }

    async fn mark_job_running(&self, job_id: &JobId) -> Result<(), Error> {
        let job_id = *job_id;
        Ok(self
            .datastore
            .run_tx("mark job running", move |tx| {
                Box::pin(async move { tx.mark_job_running(&job_id).await })
            })
            .await?)
    }

    async fn mark_job_completed(&self, job_id: &JobId) -> Result<(), Error> {
        let job_id = *job_id;
        Ok(self
            .datastore
            .run_tx("mark job completed", move |tx| {
                Box::pin(async move { tx.mark_job_completed(&job_id).await })
            })
            .await?)
    }

    async fn mark_job_failed(&self, job_id: &JobId, message: &str) -> Result<(), Error> {
        let job_id = *job_id;
        let message = message.to_string();
        Ok(self
            .datastore
            .run_tx("mark job failed", move |tx| {
                let message = message.clone();
                Box::pin(async move { tx.mark_job_failed(&job_id, &message).await })
            })
            .await?)
    }

    async fn mark_job_stopped(&self, job_id: &JobId, message: &str) -> Result<(), Error> {
        let job_id = *job_id;
        let message = message.to_string();
        Ok(self
            .datastore
            .run_tx("mark job stopped", move |tx| {
                let message = message.clone();
                Box::pin(async move { tx.mark_job_stopped(&job_id, Some(&message)).await })
            })
            .await?)
    }

    async fn record_external_handle(
        &self,
        job_id: &JobId,
        handle: &RunHandle,
    ) -> Result<(), Error> {
        let job_id = *job_id;
        let handle = handle.to_string();
        Ok(self
            .datastore
            .run_tx("record job external handle", move |tx| {
                let handle = handle.clone();
                Box::pin(async move { tx.update_job_external_handle(&job_id, &handle).await })
            })
            .await?)
    }
}

/// Returns the artifact key for the given owner, timestamp, and file name.
fn artifact_key_at(owner: &str, now: NaiveDateTime, file_name: &str) -> String {
    format!("{owner}_{}_{file_name}", now.format("%Y%m%d%H%M%S"))
}

/// An artificial pause between a job entering RUNNING and its workload being prepared. The
/// orchestration checks the stop flag on both sides of the pause, so it doubles as a window in
/// which a submitted job can be stopped before its workload exists.
#[async_trait]
pub trait DelayStrategy: Debug + Send + Sync {
    async fn pause(&self);
}

/// The production strategy: no pause at all.
#[derive(Debug)]
pub struct NoDelay;

#[async_trait]
impl DelayStrategy for NoDelay {
    async fn pause(&self) {}
}

/// Pauses for a fixed duration. Used for demonstrations.
#[derive(Debug)]
pub struct FixedDelay(pub Duration);

#[async_trait]
impl DelayStrategy for FixedDelay {
    async fn pause(&self) {
        tokio::time::sleep(self.0).await;
    }
}

/// Everything [`JobPipeline::stage`] leaves behind: the image to run and how to start it. The
/// staged input directory itself is owned by the orchestration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StagedWorkload {
    pub image: String,
    pub entrypoint: Entrypoint,
}

/// Object-storage uploads made during publication, tracked so they can be deleted again if the
/// orchestration does not finish. Once the publication's datastore writes have committed, the
/// set is marked complete and the artifacts are kept on every subsequent path.
#[derive(Debug, Default)]
pub struct PublishedArtifacts {
    uploads: Vec<(String, String)>,
    complete: bool,
}

impl PublishedArtifacts {
    /// Records an upload for potential compensating deletion.
    pub fn track(&mut self, bucket: &str, key: &str) {
        self.uploads.push((bucket.to_string(), key.to_string()));
    }

    /// Marks the publication finished. Artifacts are no longer deleted on stop or failure.
    pub fn mark_complete(&mut self) {
        self.complete = true;
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Deletes every tracked upload. Best-effort: deletion failures are logged and skipped, an
    /// artifact left behind is preferable to an orchestration that never finishes.
    pub async fn unwind(&self, blobstore: &dyn BlobStore) {
        for (bucket, key) in &self.uploads {
            if let Err(err) = blobstore.delete(bucket, key).await {
                warn!(bucket, key, %err, "couldn't delete artifact while unwinding");
            }
        }
    }
}

/// The flavor-specific steps of one job orchestration. Implementations are constructed per job
/// at submission (or pickup) time and carry the job's request along with the identifiers of the
/// domain rows created when the job was enqueued.
#[async_trait]
pub trait JobPipeline<C: Clock>: Send + Sync {
    fn job_id(&self) -> &JobId;

    /// The kind label used in metrics and log lines.
    fn kind_label(&self) -> &'static str;

    fn workload_kind(&self) -> WorkloadKind;

    /// Marks the flavor's domain row RUNNING. Runs before anything is staged.
    async fn begin(&self, components: &Components<C>) -> Result<(), Error>;

    /// Prepares the workload: downloads inputs into `input_dir`, makes the image available on
    /// the backend, and returns what to run.
    async fn stage(
        &self,
        components: &Components<C>,
        input_dir: &Path,
    ) -> Result<StagedWorkload, Error>;

    /// Publishes the workload's outputs from `output_dir`: uploads artifacts (tracking each one
    /// in `artifacts`), commits the flavor's domain rows, and marks `artifacts` complete once
    /// those commits have happened.
    async fn publish(
        &self,
        components: &Components<C>,
        output_dir: &Path,
        artifacts: &mut PublishedArtifacts,
    ) -> Result<(), Error>;

    /// Marks the flavor's domain row FAILED. Runs on the failure path and on stops that
    /// interrupted an unfinished publication.
    async fn record_failure(&self, components: &Components<C>) -> Result<(), Error>;
}

/// Runs one job orchestration to its terminal state. Every exit path of the workload run ends
/// with a terminal job state written to the datastore; errors encountered while recording the
/// outcome itself are logged, since at that point there is nobody left to report them to.
#[tracing::instrument(skip_all, fields(job_id = %pipeline.job_id(), kind = pipeline.kind_label()))]
pub async fn run_job<C: Clock>(components: &Components<C>, pipeline: &dyn JobPipeline<C>) {
    let job_id = *pipeline.job_id();
    let mut artifacts = PublishedArtifacts::default();
    let outcome = match execute(components, pipeline, &mut artifacts).await {
        Ok(()) => {
            if let Err(err) = components.mark_job_completed(&job_id).await {
                error!(%job_id, %err, "couldn't mark job completed");
            }
            info!(%job_id, kind = pipeline.kind_label(), "job completed");
            "completed"
        }
        Err(Error::StopRequested) => {
            finish_stopped(components, pipeline, &artifacts).await;
            "stopped"
        }
        Err(err) => {
            // A workload killed by a stop request surfaces as an ordinary failure; re-read the
            // stop flag to tell the two apart.
            if components.stop_flag(&job_id).await.unwrap_or(false) {
                finish_stopped(components, pipeline, &artifacts).await;
                "stopped"
            } else {
                finish_failed(components, pipeline, &artifacts, &err).await;
                "failed"
            }
        }
    };
    components.job_outcome_counter.add(
        1,
        &[
            KeyValue::new("kind", pipeline.kind_label()),
            KeyValue::new("outcome", outcome),
        ],
    );
}

async fn execute<C: Clock>(
    components: &Components<C>,
    pipeline: &dyn JobPipeline<C>,
    artifacts: &mut PublishedArtifacts,
) -> Result<(), Error> {
    let job_id = *pipeline.job_id();
    components.mark_job_running(&job_id).await?;
    pipeline.begin(components).await?;

    components.stop_checkpoint(&job_id).await?;
    components.delay.pause().await;
    components.stop_checkpoint(&job_id).await?;

    let workdirs = components.workdirs.create(&job_id.to_string())?;
    let rslt = run_workload(components, pipeline, &workdirs, artifacts).await;
    workdirs.cleanup().await;
    rslt
}

async fn run_workload<C: Clock>(
    components: &Components<C>,
    pipeline: &dyn JobPipeline<C>,
    workdirs: &crate::workdir::WorkdirPair,
    artifacts: &mut PublishedArtifacts,
) -> Result<(), Error> {
    let job_id = *pipeline.job_id();
    let staged = pipeline.stage(components, workdirs.input()).await?;
    components.stop_checkpoint(&job_id).await?;

    let request = RunRequest {
        job_id,
        kind: pipeline.workload_kind(),
        image: staged.image,
        entrypoint: staged.entrypoint,
        input_dir: workdirs.input().to_path_buf(),
        output_dir: workdirs.output().to_path_buf(),
    };
    let handle = components.runner.submit(&request).await?;
    components.record_external_handle(&job_id, &handle).await?;
    info!(%job_id, %handle, "workload submitted");

    let before = Instant::now();
    let wait_rslt = components.runner.wait(&handle, components.run_timeout).await;
    components.workload_duration_histogram.record(
        before.elapsed().as_secs_f64(),
        &[
            KeyValue::new("kind", pipeline.kind_label()),
            KeyValue::new(
                "status",
                if wait_rslt.is_ok() { "success" } else { "error" },
            ),
        ],
    );
    wait_rslt?;

    components.stop_checkpoint(&job_id).await?;
    pipeline.publish(components, workdirs.output(), artifacts).await?;
    components.stop_checkpoint(&job_id).await?;
    Ok(())
}

async fn finish_stopped<C: Clock>(
    components: &Components<C>,
    pipeline: &dyn JobPipeline<C>,
    artifacts: &PublishedArtifacts,
) {
    let job_id = *pipeline.job_id();
    // A stop observed after publication finished keeps the published artifacts and domain rows;
    // one observed earlier unwinds whatever this run already uploaded.
    if !artifacts.is_complete() {
        artifacts.unwind(components.blobstore()).await;
        if let Err(err) = pipeline.record_failure(components).await {
            error!(%job_id, %err, "couldn't record domain failure for stopped job");
        }
    }
    if let Err(err) = components
        .mark_job_stopped(&job_id, "stopped at user request")
        .await
    {
        error!(%job_id, %err, "couldn't mark job stopped");
    }
    info!(%job_id, kind = pipeline.kind_label(), "job stopped");
}

async fn finish_failed<C: Clock>(
    components: &Components<C>,
    pipeline: &dyn JobPipeline<C>,
    artifacts: &PublishedArtifacts,
    cause: &Error,
) {
    let job_id = *pipeline.job_id();
    if !artifacts.is_complete() {
        artifacts.unwind(components.blobstore()).await;
        if let Err(err) = pipeline.record_failure(components).await {
            error!(%job_id, %err, "couldn't record domain failure for failed job");
        }
    }
    if let Err(err) = components
        .mark_job_failed(&job_id, &cause.message_for_job())
        .await
    {
        error!(%job_id, %err, "couldn't mark job failed");
    }
    warn!(%job_id, kind = pipeline.kind_label(), %cause, "job failed");
}
