//! Prediction orchestrations.
//!
//! A prediction job stages a dataset and a previously published model artifact into the
//! workload's input directory, runs the prediction workload, and publishes the single result
//! file it leaves behind. Custom predictions run the caller's algorithm image; builtin
//! predictions run the configured builtin runner image.

use crate::{
    orchestrator::{
        Components, Error, JobPipeline, PublishedArtifacts, StagedWorkload,
        algorithm::{
            AlgorithmImage, ExecutionMode, IMAGE_ALGORITHM_PATH, prepare_algorithm_image,
        },
        params::empty_params,
        training::stage_params,
    },
    runner::{Entrypoint, ImageSpec, WorkloadKind},
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::Path;
use tracing::info;
use trainyard_core::time::Clock;
use trainyard_orchestrator_core::{
    blobstore::BucketKind,
    datastore::models::{JobId, Model, ModelExecution},
};

/// File name the prediction dataset is staged under.
pub const TEST_DATASET_FILE: &str = "test_data.csv";
/// File name the model artifact is staged under, regardless of its published name.
pub const STAGED_MODEL_FILE: &str = "model.bin";
/// File name the prediction entrypoint template is staged under.
pub const PREDICT_SCRIPT: &str = "predict.py";

static PREDICT_TEMPLATE: &str = include_str!("templates/predict.py");

/// A submission to run predictions with a caller-supplied algorithm.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomPredictionRequest {
    /// The published model to predict with.
    pub model_id: i64,
    /// Key of the prediction dataset in the prediction dataset bucket.
    pub dataset_key: String,
    pub image: AlgorithmImage,
    pub mode: ExecutionMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params_key: Option<String>,
}

/// A submission to run predictions with a model trained by a builtin engine.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuiltinPredictionRequest {
    pub model_id: i64,
    pub dataset_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params_key: Option<String>,
}

/// Orchestration of one custom prediction job.
pub struct CustomPredictionPipeline {
    job_id: JobId,
    owner: String,
    execution_id: i64,
    request: CustomPredictionRequest,
}

impl CustomPredictionPipeline {
    pub fn new(
        job_id: JobId,
        owner: String,
        execution_id: i64,
        request: CustomPredictionRequest,
    ) -> Self {
        Self {
            job_id,
            owner,
            execution_id,
            request,
        }
    }
}

#[async_trait]
impl<C: Clock> JobPipeline<C> for CustomPredictionPipeline {
    fn job_id(&self) -> &JobId {
        &self.job_id
    }

    fn kind_label(&self) -> &'static str {
        "custom_prediction"
    }

    fn workload_kind(&self) -> WorkloadKind {
        WorkloadKind::Prediction
    }

    async fn begin(&self, _components: &Components<C>) -> Result<(), Error> {
        // Model executions are created RUNNING at submission time.
        Ok(())
    }

    async fn stage(
        &self,
        components: &Components<C>,
        input_dir: &Path,
    ) -> Result<StagedWorkload, Error> {
        let (execution, _) = stage_prediction_inputs(components, self.execution_id, input_dir).await?;
        stage_params(
            components,
            empty_params(),
            self.request.params_key.as_deref(),
            input_dir,
        )
        .await?;
        debug_assert_eq!(execution.model_id(), self.request.model_id);

        let image =
            prepare_algorithm_image(components, &self.owner, &self.request.image, input_dir)
                .await?;
        match self.request.mode {
            ExecutionMode::PythonTemplate => {
                tokio::fs::write(input_dir.join(PREDICT_SCRIPT), PREDICT_TEMPLATE).await?;
                components
                    .runner()
                    .copy_file_from_image(
                        &image,
                        Path::new(IMAGE_ALGORITHM_PATH),
                        &input_dir.join("algorithm.py"),
                    )
                    .await?;
                Ok(StagedWorkload {
                    image,
                    entrypoint: Entrypoint::Script {
                        file_name: PREDICT_SCRIPT.to_string(),
                    },
                })
            }
            ExecutionMode::Byoc => Ok(StagedWorkload {
                image,
                entrypoint: Entrypoint::Image,
            }),
        }
    }

    async fn publish(
        &self,
        components: &Components<C>,
        output_dir: &Path,
        artifacts: &mut PublishedArtifacts,
    ) -> Result<(), Error> {
        publish_prediction_results(
            components,
            &self.job_id,
            &self.owner,
            self.execution_id,
            output_dir,
            artifacts,
        )
        .await
    }

    async fn record_failure(&self, components: &Components<C>) -> Result<(), Error> {
        mark_execution_failed(components, self.execution_id).await
    }
}

/// Orchestration of one builtin prediction job.
pub struct BuiltinPredictionPipeline {
    job_id: JobId,
    owner: String,
    execution_id: i64,
    request: BuiltinPredictionRequest,
}

impl BuiltinPredictionPipeline {
    pub fn new(
        job_id: JobId,
        owner: String,
        execution_id: i64,
        request: BuiltinPredictionRequest,
    ) -> Self {
        Self {
            job_id,
            owner,
            execution_id,
            request,
        }
    }
}

#[async_trait]
impl<C: Clock> JobPipeline<C> for BuiltinPredictionPipeline {
    fn job_id(&self) -> &JobId {
        &self.job_id
    }

    fn kind_label(&self) -> &'static str {
        "builtin_prediction"
    }

    fn workload_kind(&self) -> WorkloadKind {
        WorkloadKind::Prediction
    }

    async fn begin(&self, _components: &Components<C>) -> Result<(), Error> {
        Ok(())
    }

    async fn stage(
        &self,
        components: &Components<C>,
        input_dir: &Path,
    ) -> Result<StagedWorkload, Error> {
        let (_, model) = stage_prediction_inputs(components, self.execution_id, input_dir).await?;

        let defaults = json!({
            "task": "predict",
            "engine": model.engine(),
        });
        stage_params(
            components,
            defaults,
            self.request.params_key.as_deref(),
            input_dir,
        )
        .await?;

        let image = components.builtin_runner_image().to_string();
        components
            .runner()
            .prepare_image(&ImageSpec::Registry {
                image: image.clone(),
            })
            .await?;
        Ok(StagedWorkload {
            image,
            entrypoint: Entrypoint::Image,
        })
    }

    async fn publish(
        &self,
        components: &Components<C>,
        output_dir: &Path,
        artifacts: &mut PublishedArtifacts,
    ) -> Result<(), Error> {
        publish_prediction_results(
            components,
            &self.job_id,
            &self.owner,
            self.execution_id,
            output_dir,
            artifacts,
        )
        .await
    }

    async fn record_failure(&self, components: &Components<C>) -> Result<(), Error> {
        mark_execution_failed(components, self.execution_id).await
    }
}

/// Stages the execution's dataset and model artifact, returning the execution and model rows.
/// The dataset must be a CSV file; the model artifact is staged under a fixed name so workloads
/// need not know its published key.
async fn stage_prediction_inputs<C: Clock>(
    components: &Components<C>,
    execution_id: i64,
    input_dir: &Path,
) -> Result<(ModelExecution, Model), Error> {
    let execution = get_model_execution(components, execution_id).await?;
    if !execution.dataset_key().ends_with(".csv") {
        return Err(Error::DatasetFormat(format!(
            "dataset {} is not a CSV file",
            execution.dataset_key()
        )));
    }
    components
        .blobstore()
        .download_to_file(
            components.bucket(BucketKind::PredictDataset),
            execution.dataset_key(),
            &input_dir.join(TEST_DATASET_FILE),
        )
        .await?;

    let model_id = execution.model_id();
    let model = components
        .datastore()
        .run_tx("get model", move |tx| {
            Box::pin(async move { tx.get_model(model_id).await })
        })
        .await?
        .ok_or(Error::UnknownModel(model_id))?;
    components
        .blobstore()
        .download_to_file(
            components.bucket(BucketKind::Model),
            model.artifact_key(),
            &input_dir.join(STAGED_MODEL_FILE),
        )
        .await?;
    Ok((execution, model))
}

async fn get_model_execution<C: Clock>(
    components: &Components<C>,
    execution_id: i64,
) -> Result<ModelExecution, Error> {
    components
        .datastore()
        .run_tx("get model execution", move |tx| {
            Box::pin(async move { tx.get_model_execution(execution_id).await })
        })
        .await?
        .ok_or_else(|| Error::Internal(format!("model execution {execution_id} does not exist")))
}

async fn mark_execution_failed<C: Clock>(
    components: &Components<C>,
    execution_id: i64,
) -> Result<(), Error> {
    Ok(components
        .datastore()
        .run_tx("mark model execution failed", move |tx| {
            Box::pin(async move { tx.mark_model_execution_failed(execution_id).await })
        })
        .await?)
}

/// Publishes a finished prediction workload's single result file. The upload is tracked for
/// compensating deletion until the execution row's completion has committed.
async fn publish_prediction_results<C: Clock>(
    components: &Components<C>,
    job_id: &JobId,
    owner: &str,
    execution_id: i64,
    output_dir: &Path,
    artifacts: &mut PublishedArtifacts,
) -> Result<(), Error> {
    let mut result_file = None;
    let mut entries = tokio::fs::read_dir(output_dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        if result_file.is_some() {
            return Err(Error::MissingOutput(
                "workload left more than one result file in its output directory".to_string(),
            ));
        }
        result_file = Some((
            entry.file_name().to_string_lossy().into_owned(),
            entry.path(),
        ));
    }
    let (result_file_name, result_path) = result_file.ok_or_else(|| {
        Error::MissingOutput("workload left no result file in its output directory".to_string())
    })?;

    let results_bucket = components.bucket(BucketKind::PredictionResults).to_string();
    let result_key = components.artifact_key(owner, &result_file_name);
    components
        .blobstore()
        .upload_file(&results_bucket, &result_key, "text/csv", &result_path)
        .await?;
    artifacts.track(&results_bucket, &result_key);

    components.stop_checkpoint(job_id).await?;

    let job_id = *job_id;
    components
        .datastore()
        .run_tx("publish model execution", move |tx| {
            let result_key = result_key.clone();
            Box::pin(async move {
                tx.mark_model_execution_completed(execution_id, &result_key)
                    .await
            })
        })
        .await?;
    artifacts.mark_complete();
    info!(%job_id, execution_id, "model execution published");
    Ok(())
}
