//! Job submission.
//!
//! [`JobSubmitter::enqueue`] validates a submission, writes the job record and its domain rows
//! in one transaction, and returns the new job's ID; the job is then PENDING and can be picked
//! up by any process running a discovery loop ([`crate::orchestrator::driver`]).
//! [`JobSubmitter::submit`] additionally spawns the orchestration in-process, for embedders that
//! run submission and orchestration in the same binary.

use crate::orchestrator::{
    Components, Error, JobPipeline,
    prediction::{
        BuiltinPredictionPipeline, BuiltinPredictionRequest, CustomPredictionPipeline,
        CustomPredictionRequest,
    },
    run_job,
    training::{
        BuiltinTrainingPipeline, BuiltinTrainingRequest, CustomTrainingPipeline,
        CustomTrainingRequest, TrainingDataset,
    },
};
use rand::random;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use stopper::Stopper;
use tokio::sync::Semaphore;
use tracing::info;
use trainyard_core::{Runtime, time::Clock};
use trainyard_orchestrator_core::datastore::{
    Datastore,
    models::{Job, JobId, JobKind, ModelExecution, TrainingRun},
};

/// A job submission. The serialized form is recorded on the job row, so a PENDING job can be
/// rebuilt into a pipeline by whichever process picks it up.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "flavor", rename_all = "snake_case")]
pub enum JobRequest {
    CustomTraining(CustomTrainingRequest),
    BuiltinTraining(BuiltinTrainingRequest),
    CustomPrediction(CustomPredictionRequest),
    BuiltinPrediction(BuiltinPredictionRequest),
}

impl JobRequest {
    pub fn kind(&self) -> JobKind {
        match self {
            Self::CustomTraining(_) => JobKind::CustomTraining,
            Self::BuiltinTraining(_) => JobKind::BuiltinTraining,
            Self::CustomPrediction(_) => JobKind::CustomPrediction,
            Self::BuiltinPrediction(_) => JobKind::BuiltinPrediction,
        }
    }
}

/// Accepts job submissions and optionally runs their orchestrations in-process.
pub struct JobSubmitter<C: Clock, R: Runtime> {
    components: Arc<Components<C>>,
    runtime: R,
    semaphore: Arc<Semaphore>,
    stopper: Stopper,
}

impl<C: Clock + 'static, R: Runtime> JobSubmitter<C, R> {
    pub fn new(
        components: Arc<Components<C>>,
        runtime: R,
        max_concurrent_jobs: usize,
        stopper: Stopper,
    ) -> Self {
        Self {
            components,
            runtime,
            semaphore: Arc::new(Semaphore::new(max_concurrent_jobs)),
            stopper,
        }
    }

    /// Validates the submission and writes the PENDING job record, its domain row, and the
    /// linkage between them in one transaction. Returns the new job's ID.
    pub async fn enqueue(&self, owner: &str, request: &JobRequest) -> Result<JobId, Error> {
        enqueue_job(
            self.components.datastore(),
            self.components.clock(),
            owner,
            request,
        )
        .await
    }

    /// Enqueues the submission and spawns its orchestration on this process's runtime, gated by
    /// the concurrency semaphore. A process shutdown before the orchestration acquires a permit
    /// leaves the job PENDING for the next discovery loop.
    pub async fn submit(&self, owner: &str, request: &JobRequest) -> Result<JobId, Error> {
        let job_id = self.enqueue(owner, request).await?;
        let job = self
            .components
            .datastore()
            .run_tx("get enqueued job", move |tx| {
                Box::pin(async move { tx.get_job(&job_id).await })
            })
            .await?
            .ok_or(Error::UnknownJob(job_id))?;
        let pipeline = build_pipeline(&job)?;

        let components = Arc::clone(&self.components);
        let semaphore = Arc::clone(&self.semaphore);
        let stopper = self.stopper.clone();
        self.runtime.spawn(async move {
            let Some(Ok(_permit)) = stopper.stop_future(semaphore.acquire_owned()).await else {
                return;
            };
            run_job(components.as_ref(), pipeline.as_ref()).await;
        });
        Ok(job_id)
    }

}

/// Validates a submission and writes the PENDING job record, its domain row, and the linkage
/// between them in one transaction. Returns the new job's ID. Standalone so processes without a
/// container backend (e.g. the CLI) can enqueue work for a resident orchestrator.
pub async fn enqueue_job<C: Clock>(
    datastore: &Datastore<C>,
    clock: &C,
    owner: &str,
    request: &JobRequest,
) -> Result<JobId, Error> {
    let job_id: JobId = random();
    match request {
        JobRequest::CustomTraining(training) => {
            let dataset_key = resolve_training_dataset(datastore, &training.dataset).await?;
            enqueue_training(
                datastore,
                clock,
                job_id,
                owner,
                request,
                &training.algorithm,
                &dataset_key,
                training.params_key.as_deref(),
            )
            .await?;
        }
        JobRequest::BuiltinTraining(training) => {
            if training.engine.is_empty() {
                return Err(Error::InvalidRequest("no engine named".to_string()));
            }
            let dataset_key = resolve_training_dataset(datastore, &training.dataset).await?;
            enqueue_training(
                datastore,
                clock,
                job_id,
                owner,
                request,
                &training.algorithm,
                &dataset_key,
                training.params_key.as_deref(),
            )
            .await?;
        }
        JobRequest::CustomPrediction(prediction) => {
            enqueue_prediction(
                datastore,
                clock,
                job_id,
                owner,
                request,
                prediction.model_id,
                &prediction.dataset_key,
            )
            .await?;
        }
        JobRequest::BuiltinPrediction(prediction) => {
            enqueue_prediction(
                datastore,
                clock,
                job_id,
                owner,
                request,
                prediction.model_id,
                &prediction.dataset_key,
            )
            .await?;
        }
    }
    info!(%job_id, owner, kind = %request.kind(), "job enqueued");
    Ok(job_id)
}

/// Resolves a training's dataset selection to the object-storage key of a dataset. Exactly one
/// selection must be made; retraining selections are resolved through the referenced training
/// run's recorded dataset.
async fn resolve_training_dataset<C: Clock>(
    datastore: &Datastore<C>,
    dataset: &TrainingDataset,
) -> Result<String, Error> {
    let selections = [
        dataset.dataset_key.is_some(),
        dataset.retrain_from_training.is_some(),
        dataset.retrain_from_model.is_some(),
    ]
    .iter()
    .filter(|selected| **selected)
    .count();
    if selections != 1 {
        return Err(Error::InvalidRequest(
            "exactly one of dataset_key, retrain_from_training, and retrain_from_model must be \
             set"
                .to_string(),
        ));
    }

    if let Some(dataset_key) = &dataset.dataset_key {
        if !dataset_key.ends_with(".csv") {
            return Err(Error::DatasetFormat(format!(
                "dataset {dataset_key} is not a CSV file"
            )));
        }
        return Ok(dataset_key.clone());
    }
    if let Some(training_id) = dataset.retrain_from_training {
        let run = datastore
            .run_tx("resolve retraining dataset", move |tx| {
                Box::pin(async move { tx.get_training_run(training_id).await })
            })
            .await?
            .ok_or(Error::UnknownTraining(training_id))?;
        return Ok(run.dataset_key().to_string());
    }
    let model_id = dataset
        .retrain_from_model
        .ok_or_else(|| Error::Internal("dataset selection lost".to_string()))?;
    let run = datastore
        .run_tx("resolve retraining dataset by model", move |tx| {
            Box::pin(async move { tx.get_training_run_by_model(model_id).await })
        })
        .await?
        .ok_or(Error::UnknownModel(model_id))?;
    Ok(run.dataset_key().to_string())
}

#[allow(clippy::too_many_arguments)]
async fn enqueue_training<C: Clock>(
    datastore: &Datastore<C>,
    clock: &C,
    job_id: JobId,
    owner: &str,
    request: &JobRequest,
    algorithm: &str,
    dataset_key: &str,
    params_key: Option<&str>,
) -> Result<(), Error> {
    let job = Job::new(job_id, request.kind(), owner.to_string(), clock.now())
        .with_request(Some(serde_json::to_string(request)?));
    let training_run = TrainingRun::new(
        job_id,
        algorithm.to_string(),
        dataset_key.to_string(),
        params_key.map(str::to_string),
    );
    datastore
        .run_tx("enqueue training job", move |tx| {
            let job = job.clone();
            let training_run = training_run.clone();
            Box::pin(async move {
                tx.put_job(&job).await?;
                let training_id = tx.put_training_run(&training_run).await?;
                tx.update_job_training_id(job.id(), training_id).await?;
                Ok(())
            })
        })
        .await?;
    Ok(())
}

async fn enqueue_prediction<C: Clock>(
    datastore: &Datastore<C>,
    clock: &C,
    job_id: JobId,
    owner: &str,
    request: &JobRequest,
    model_id: i64,
    dataset_key: &str,
) -> Result<(), Error> {
    if !dataset_key.ends_with(".csv") {
        return Err(Error::DatasetFormat(format!(
            "dataset {dataset_key} is not a CSV file"
        )));
    }
    datastore
        .run_tx("check prediction model", move |tx| {
            Box::pin(async move { tx.get_model(model_id).await })
        })
        .await?
        .ok_or(Error::UnknownModel(model_id))?;

    let job = Job::new(job_id, request.kind(), owner.to_string(), clock.now())
        .with_request(Some(serde_json::to_string(request)?));
    let execution = ModelExecution::new(job_id, model_id, dataset_key.to_string())
        .with_started_at(Some(clock.now()));
    datastore
        .run_tx("enqueue prediction job", move |tx| {
            let job = job.clone();
            let execution = execution.clone();
            Box::pin(async move {
                tx.put_job(&job).await?;
                let execution_id = tx.put_model_execution(&execution).await?;
                tx.update_job_execution_id(job.id(), execution_id).await?;
                Ok(())
            })
        })
        .await?;
    Ok(())
}

/// Rebuilds the pipeline for a job from its recorded request and linkage. Used both when a job
/// is run in the submitting process and when a discovery loop picks it up later.
pub(crate) fn build_pipeline<C: Clock>(job: &Job) -> Result<Box<dyn JobPipeline<C>>, Error> {
    let request_json = job
        .request()
        .ok_or_else(|| Error::Internal(format!("job {} has no recorded request", job.id())))?;
    let request: JobRequest = serde_json::from_str(request_json)?;
    let job_id = *job.id();
    let owner = job.owner().to_string();
    Ok(match request {
        JobRequest::CustomTraining(training) => Box::new(CustomTrainingPipeline::new(
            job_id,
            owner,
            linked_training_id(job)?,
            training,
        )),
        JobRequest::BuiltinTraining(training) => Box::new(BuiltinTrainingPipeline::new(
            job_id,
            owner,
            linked_training_id(job)?,
            training,
        )),
        JobRequest::CustomPrediction(prediction) => Box::new(CustomPredictionPipeline::new(
            job_id,
            owner,
            linked_execution_id(job)?,
            prediction,
        )),
        JobRequest::BuiltinPrediction(prediction) => Box::new(BuiltinPredictionPipeline::new(
            job_id,
            owner,
            linked_execution_id(job)?,
            prediction,
        )),
    })
}

fn linked_training_id(job: &Job) -> Result<i64, Error> {
    job.training_id()
        .ok_or_else(|| Error::Internal(format!("job {} has no linked training run", job.id())))
}

fn linked_execution_id(job: &Job) -> Result<i64, Error> {
    job.execution_id()
        .ok_or_else(|| Error::Internal(format!("job {} has no linked model execution", job.id())))
}
