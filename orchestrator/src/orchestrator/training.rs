//! Training orchestrations.
//!
//! A training job stages a dataset (and, for custom algorithms, the algorithm's image and a
//! Python entrypoint) into the workload's input directory, runs the training workload, and
//! publishes the resulting model artifact and metrics. The two flavors share everything except
//! staging: custom trainings run the caller's algorithm image, builtin trainings run the
//! configured builtin runner image against a parameter document.

use crate::{
    orchestrator::{
        Components, Error, JobPipeline, PublishedArtifacts, StagedWorkload,
        algorithm::{
            AlgorithmImage, ExecutionMode, IMAGE_ALGORITHM_PATH, prepare_algorithm_image,
        },
        params::{empty_params, merge_params},
    },
    runner::{Entrypoint, ImageSpec, WorkloadKind},
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::path::Path;
use tracing::info;
use trainyard_core::time::Clock;
use trainyard_orchestrator_core::{
    blobstore::BucketKind,
    datastore::models::{JobId, Model, TrainingRun},
};

/// File name the training dataset is staged under.
pub const DATASET_FILE: &str = "dataset.csv";
/// File name the merged parameter document is staged under.
pub const PARAMS_FILE: &str = "params.json";
/// File name the training entrypoint template is staged under.
pub const TRAIN_SCRIPT: &str = "train.py";
/// File name of the metrics document a training workload leaves in its output directory.
pub const METRICS_FILE: &str = "metrics.json";

static TRAIN_TEMPLATE: &str = include_str!("templates/train.py");

/// Which dataset a training runs against: a freshly uploaded one, or the dataset of an earlier
/// training identified directly or through the model it produced. Exactly one field must be set.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainingDataset {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dataset_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retrain_from_training: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retrain_from_model: Option<i64>,
}

/// A submission to train a caller-supplied algorithm.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomTrainingRequest {
    /// Label for the algorithm, used in the published model's name.
    pub algorithm: String,
    pub image: AlgorithmImage,
    pub mode: ExecutionMode,
    pub dataset: TrainingDataset,
    /// Key of a parameter override document in the parameter bucket, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params_key: Option<String>,
}

/// A submission to train one of the builtin engines.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuiltinTrainingRequest {
    pub algorithm: String,
    /// The builtin engine to train with (an opaque label the builtin runner image understands).
    pub engine: String,
    /// Engine-specific options, merged key-wise with any parameter override document.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub options: Value,
    /// Name of the dataset column holding the training target.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_column: Option<String>,
    pub dataset: TrainingDataset,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params_key: Option<String>,
}

impl Default for BuiltinTrainingRequest {
    fn default() -> Self {
        Self {
            algorithm: String::new(),
            engine: String::new(),
            options: Value::Null,
            target_column: None,
            dataset: TrainingDataset::default(),
            params_key: None,
        }
    }
}

/// Orchestration of one custom training job.
pub struct CustomTrainingPipeline {
    job_id: JobId,
    owner: String,
    training_id: i64,
    request: CustomTrainingRequest,
}

impl CustomTrainingPipeline {
    pub fn new(
        job_id: JobId,
        owner: String,
        training_id: i64,
        request: CustomTrainingRequest,
    ) -> Self {
        Self {
            job_id,
            owner,
            training_id,
            request,
        }
    }
}

#[async_trait]
impl<C: Clock> JobPipeline<C> for CustomTrainingPipeline {
    fn job_id(&self) -> &JobId {
        &self.job_id
    }

    fn kind_label(&self) -> &'static str {
        "custom_training"
    }

    fn workload_kind(&self) -> WorkloadKind {
        WorkloadKind::Training
    }

    async fn begin(&self, components: &Components<C>) -> Result<(), Error> {
        mark_training_running(components, self.training_id).await
    }

    async fn stage(
        &self,
        components: &Components<C>,
        input_dir: &Path,
    ) -> Result<StagedWorkload, Error> {
        let run = get_training_run(components, self.training_id).await?;
        stage_dataset(components, &run, input_dir).await?;
        stage_params(components, empty_params(), run.params_key(), input_dir).await?;

        let image =
            prepare_algorithm_image(components, &self.owner, &self.request.image, input_dir)
                .await?;
        match self.request.mode {
            ExecutionMode::PythonTemplate => {
                tokio::fs::write(input_dir.join(TRAIN_SCRIPT), TRAIN_TEMPLATE).await?;
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
                        file_name: TRAIN_SCRIPT.to_string(),
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
        publish_training_outputs(
            components,
            &self.job_id,
            &self.owner,
            self.training_id,
            &self.request.algorithm,
            "custom",
            output_dir,
            artifacts,
        )
        .await
    }

    async fn record_failure(&self, components: &Components<C>) -> Result<(), Error> {
        mark_training_failed(components, self.training_id).await
    }
}

/// Orchestration of one builtin training job.
pub struct BuiltinTrainingPipeline {
    job_id: JobId,
    owner: String,
    training_id: i64,
    request: BuiltinTrainingRequest,
}

impl BuiltinTrainingPipeline {
    pub fn new(
        job_id: JobId,
        owner: String,
        training_id: i64,
        request: BuiltinTrainingRequest,
    ) -> Self {
        Self {
            job_id,
            owner,
            training_id,
            request,
        }
    }
}

#[async_trait]
impl<C: Clock> JobPipeline<C> for BuiltinTrainingPipeline {
    fn job_id(&self) -> &JobId {
        &self.job_id
    }

    fn kind_label(&self) -> &'static str {
        "builtin_training"
    }

    fn workload_kind(&self) -> WorkloadKind {
        WorkloadKind::Training
    }

    async fn begin(&self, components: &Components<C>) -> Result<(), Error> {
        mark_training_running(components, self.training_id).await
    }

    async fn stage(
        &self,
        components: &Components<C>,
        input_dir: &Path,
    ) -> Result<StagedWorkload, Error> {
        let run = get_training_run(components, self.training_id).await?;
        stage_dataset(components, &run, input_dir).await?;

        let defaults = json!({
            "task": "train",
            "algorithm": self.request.algorithm,
            "engine": self.request.engine,
            "target_column": self.request.target_column,
            "options": if self.request.options.is_null() {
                json!({})
            } else {
                self.request.options.clone()
            },
        });
        stage_params(components, defaults, run.params_key(), input_dir).await?;

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
        publish_training_outputs(
            components,
            &self.job_id,
            &self.owner,
            self.training_id,
            &self.request.algorithm,
            &self.request.engine,
            output_dir,
            artifacts,
        )
        .await
    }

    async fn record_failure(&self, components: &Components<C>) -> Result<(), Error> {
        mark_training_failed(components, self.training_id).await
    }
}

async fn get_training_run<C: Clock>(
    components: &Components<C>,
    training_id: i64,
) -> Result<TrainingRun, Error> {
    components
        .datastore()
        .run_tx("get training run", move |tx| {
            Box::pin(async move { tx.get_training_run(training_id).await })
        })
        .await?
        .ok_or(Error::UnknownTraining(training_id))
}

async fn mark_training_running<C: Clock>(
    components: &Components<C>,
    training_id: i64,
) -> Result<(), Error> {
    Ok(components
        .datastore()
        .run_tx("mark training run running", move |tx| {
            Box::pin(async move { tx.mark_training_run_running(training_id).await })
        })
        .await?)
}

async fn mark_training_failed<C: Clock>(
    components: &Components<C>,
    training_id: i64,
) -> Result<(), Error> {
    Ok(components
        .datastore()
        .run_tx("mark training run failed", move |tx| {
            Box::pin(async move { tx.mark_training_run_failed(training_id).await })
        })
        .await?)
}

/// Downloads the training run's dataset into the input directory. Only CSV datasets are
/// accepted; anything else is rejected before a workload is started.
async fn stage_dataset<C: Clock>(
    components: &Components<C>,
    run: &TrainingRun,
    input_dir: &Path,
) -> Result<(), Error> {
    if !run.dataset_key().ends_with(".csv") {
        return Err(Error::DatasetFormat(format!(
            "dataset {} is not a CSV file",
            run.dataset_key()
        )));
    }
    components
        .blobstore()
        .download_to_file(
            components.bucket(BucketKind::TrainDataset),
            run.dataset_key(),
            &input_dir.join(DATASET_FILE),
        )
        .await?;
    Ok(())
}

/// Merges any caller-supplied parameter override document into `defaults` and stages the result
/// as `params.json`.
pub(super) async fn stage_params<C: Clock>(
    components: &Components<C>,
    defaults: Value,
    params_key: Option<&str>,
    input_dir: &Path,
) -> Result<(), Error> {
    let params = match params_key {
        Some(params_key) => {
            let body = components
                .blobstore()
                .download(components.bucket(BucketKind::Parameters), params_key)
                .await?;
            let overrides: Value = serde_json::from_slice(&body)?;
            merge_params(&defaults, &overrides)
        }
        None => defaults,
    };
    tokio::fs::write(input_dir.join(PARAMS_FILE), serde_json::to_vec(&params)?).await?;
    Ok(())
}

/// Publishes a finished training workload's outputs. The output directory must hold exactly one
/// model file next to `metrics.json`. The artifact uploads are tracked for compensating
/// deletion; once the model row, training run, and job linkage have committed, the artifact set
/// is marked complete and the artifacts are kept on every subsequent path.
#[allow(clippy::too_many_arguments)]
async fn publish_training_outputs<C: Clock>(
    components: &Components<C>,
    job_id: &JobId,
    owner: &str,
    training_id: i64,
    algorithm: &str,
    engine: &str,
    output_dir: &Path,
    artifacts: &mut PublishedArtifacts,
) -> Result<(), Error> {
    let mut model_file = None;
    let mut metrics_path = None;
    let mut entries = tokio::fs::read_dir(output_dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name == METRICS_FILE {
            metrics_path = Some(entry.path());
        } else if model_file.is_some() {
            return Err(Error::MissingOutput(
                "workload left more than one model file in its output directory".to_string(),
            ));
        } else {
            model_file = Some((name, entry.path()));
        }
    }
    let (model_file_name, model_path) = model_file.ok_or_else(|| {
        Error::MissingOutput("workload left no model file in its output directory".to_string())
    })?;
    let metrics_path = metrics_path.ok_or_else(|| {
        Error::MissingOutput(format!("workload left no {METRICS_FILE} in its output directory"))
    })?;
    let metrics = tokio::fs::read_to_string(&metrics_path).await?;

    let model_bucket = components.bucket(BucketKind::Model).to_string();
    let model_key = components.artifact_key(owner, &model_file_name);
    components
        .blobstore()
        .upload_file(
            &model_bucket,
            &model_key,
            "application/octet-stream",
            &model_path,
        )
        .await?;
    artifacts.track(&model_bucket, &model_key);

    let metrics_bucket = components.bucket(BucketKind::Metrics).to_string();
    let metrics_key = components.artifact_key(owner, METRICS_FILE);
    components
        .blobstore()
        .upload_file(&metrics_bucket, &metrics_key, "application/json", &metrics_path)
        .await?;
    artifacts.track(&metrics_bucket, &metrics_key);

    // A stop raised during the uploads is still honored: the artifacts are unwound and no domain
    // rows are committed.
    components.stop_checkpoint(job_id).await?;

    let model_name = match model_file_name.rsplit_once('.') {
        Some((stem, _)) => format!("{algorithm}-{stem}"),
        None => format!("{algorithm}-{model_file_name}"),
    };
    let model = Model::new(
        model_name,
        owner.to_string(),
        engine.to_string(),
        model_key.clone(),
        components.clock().now(),
    );
    let job_id = *job_id;
    let model_id = components
        .datastore()
        .run_tx("publish training run", move |tx| {
            let model = model.clone();
            let metrics = metrics.clone();
            Box::pin(async move {
                let model_id = tx.put_model(&model).await?;
                tx.mark_training_run_completed(training_id, Some(&metrics), model_id)
                    .await?;
                tx.update_job_model_id(&job_id, model_id).await?;
                Ok(model_id)
            })
        })
        .await?;
    artifacts.mark_complete();
    info!(%job_id, training_id, model_id, model_key, "training run published");
    Ok(())
}
