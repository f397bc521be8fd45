use crate::{
    orchestrator::{
        Components, Error, NoDelay,
        algorithm::{AlgorithmImage, ExecutionMode},
        run_job,
        driver::PendingJobDriver,
        prediction::BuiltinPredictionRequest,
        status::{JobStatusService, Requester},
        submitter::{JobRequest, JobSubmitter, build_pipeline},
        training::{BuiltinTrainingRequest, CustomTrainingRequest, TrainingDataset},
    },
    runner::{
        ContainerRunner, Entrypoint, ImageSpec,
        test_util::{StubRunner, WaitOutcome},
    },
    workdir::WorkdirFactory,
};
use assert_matches::assert_matches;
use async_trait::async_trait;
use bytes::Bytes;
use serde_json::json;
use std::{
    sync::{Arc, Mutex},
    time::Duration,
};
use stopper::Stopper;
use trainyard_core::{
    TokioRuntime,
    test_util::install_test_trace_subscriber,
    time::{Clock, MockClock},
};
use trainyard_orchestrator_core::{
    blobstore::{BlobStore, BucketConfig, Error as BlobStoreError, test_util::MemoryBlobStore},
    datastore::{
        Datastore,
        models::{
            Job, JobId, JobState, Model, ModelExecutionState, TrainingRun, TrainingRunState,
        },
        test_util::{EphemeralDatastore, ephemeral_datastore},
    },
    test_util::noop_meter,
};

struct TestHarness {
    _ephemeral_datastore: EphemeralDatastore,
    datastore: Arc<Datastore<MockClock>>,
    runner: Arc<StubRunner>,
    blobstore: MemoryBlobStore,
    components: Arc<Components<MockClock>>,
    clock: MockClock,
    workdir_root: tempfile::TempDir,
}

async fn harness(runner: StubRunner) -> TestHarness {
    harness_with_blobstore(runner, |blobstore, _| {
        Arc::new(blobstore) as Arc<dyn BlobStore>
    })
    .await
}

/// Builds a harness whose components see the blobstore through a caller-supplied wrapper. The
/// harness keeps the underlying [`MemoryBlobStore`] for assertions; clones share storage.
async fn harness_with_blobstore<F>(runner: StubRunner, wrap: F) -> TestHarness
where
    F: FnOnce(MemoryBlobStore, Arc<Datastore<MockClock>>) -> Arc<dyn BlobStore>,
{
    install_test_trace_subscriber();
    let clock = MockClock::default();
    let ephemeral_datastore = ephemeral_datastore().await;
    let datastore = Arc::new(ephemeral_datastore.datastore(clock.clone()).await);
    let runner = Arc::new(runner);
    let blobstore = MemoryBlobStore::new();
    let workdir_root = tempfile::tempdir().unwrap();
    let components = Arc::new(Components::new(
        Arc::clone(&datastore),
        Arc::clone(&runner) as Arc<dyn ContainerRunner>,
        wrap(blobstore.clone(), Arc::clone(&datastore)),
        BucketConfig::default(),
        WorkdirFactory::new(Some(workdir_root.path().to_path_buf()), false),
        Arc::new(NoDelay),
        Duration::from_secs(60),
        "trainyard/builtin-runner:latest".to_string(),
        clock.clone(),
        &noop_meter(),
    ));
    TestHarness {
        _ephemeral_datastore: ephemeral_datastore,
        datastore,
        runner,
        blobstore,
        components,
        clock,
        workdir_root,
    }
}

impl TestHarness {
    fn submitter(&self) -> JobSubmitter<MockClock, TokioRuntime> {
        JobSubmitter::new(Arc::clone(&self.components), TokioRuntime, 4, Stopper::new())
    }

    async fn get_job(&self, job_id: &JobId) -> Job {
        let job_id = *job_id;
        self.datastore
            .run_unnamed_tx(|tx| Box::pin(async move { tx.get_job(&job_id).await }))
            .await
            .unwrap()
            .unwrap()
    }

    async fn get_training_run(&self, training_id: i64) -> TrainingRun {
        self.datastore
            .run_unnamed_tx(|tx| Box::pin(async move { tx.get_training_run(training_id).await }))
            .await
            .unwrap()
            .unwrap()
    }

    async fn put_model(&self, owner: &str, artifact_key: &str) -> i64 {
        self.blobstore
            .upload("models", artifact_key, "application/octet-stream", Bytes::from_static(b"weights"))
            .await
            .unwrap();
        let model = Model::new(
            "svm-digits".to_string(),
            owner.to_string(),
            "builtin-engine".to_string(),
            artifact_key.to_string(),
            self.clock.now(),
        );
        self.datastore
            .run_unnamed_tx(|tx| {
                let model = model.clone();
                Box::pin(async move { tx.put_model(&model).await })
            })
            .await
            .unwrap()
    }

    /// Runs the orchestration for an already-enqueued job to its terminal state.
    async fn run_to_completion(&self, job_id: &JobId) {
        let job = self.get_job(job_id).await;
        let pipeline = build_pipeline::<MockClock>(&job).unwrap();
        run_job(self.components.as_ref(), pipeline.as_ref()).await;
    }

    fn workdir_count(&self) -> usize {
        std::fs::read_dir(self.workdir_root.path()).unwrap().count()
    }
}

fn custom_training_request() -> JobRequest {
    JobRequest::CustomTraining(CustomTrainingRequest {
        algorithm: "gradient-boost".to_string(),
        image: AlgorithmImage::Registry {
            reference: "registry.example.com/ada/gradient-boost:1".to_string(),
        },
        mode: ExecutionMode::PythonTemplate,
        dataset: TrainingDataset {
            dataset_key: Some("iris.csv".to_string()),
            ..Default::default()
        },
        params_key: None,
    })
}

async fn upload_training_dataset(harness: &TestHarness) {
    harness
        .blobstore
        .upload("datasets", "iris.csv", "text/csv", Bytes::from_static(b"a,b\n1,2\n"))
        .await
        .unwrap();
}

#[tokio::test]
async fn custom_training_success() {
    let harness = harness(
        StubRunner::new()
            .with_output("model.bin", b"weights")
            .with_output("metrics.json", br#"{"accuracy":0.97}"#)
            .with_image_file("/app/algorithm.py", b"def train(**kwargs): pass"),
    )
    .await;
    upload_training_dataset(&harness).await;

    let job_id = harness
        .submitter()
        .enqueue("ada", &custom_training_request())
        .await
        .unwrap();
    harness.run_to_completion(&job_id).await;

    let job = harness.get_job(&job_id).await;
    assert_eq!(job.state(), &JobState::Completed);
    assert!(job.external_handle().is_some());

    let run = harness.get_training_run(job.training_id().unwrap()).await;
    assert_eq!(run.state(), &TrainingRunState::Completed);
    assert_eq!(run.metrics(), Some(r#"{"accuracy":0.97}"#));
    assert_eq!(run.model_id(), job.model_id());

    let model_id = job.model_id().unwrap();
    let model = harness
        .datastore
        .run_unnamed_tx(|tx| Box::pin(async move { tx.get_model(model_id).await }))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(model.owner(), "ada");
    assert_eq!(model.engine(), "custom");
    assert_eq!(model.name(), "gradient-boost-model");
    assert_eq!(model.artifact_key(), "ada_20200913122640_model.bin");
    assert!(harness.blobstore.contains("models", model.artifact_key()));
    assert!(
        harness
            .blobstore
            .contains("metrics", "ada_20200913122640_metrics.json")
    );

    // The workload ran the staged training script.
    let submitted = harness.runner.submitted_requests();
    assert_eq!(submitted.len(), 1);
    assert_eq!(
        submitted[0].entrypoint,
        Entrypoint::Script {
            file_name: "train.py".to_string()
        }
    );
    assert_eq!(
        submitted[0].image,
        "registry.example.com/ada/gradient-boost:1"
    );

    // Exchange directories were removed.
    assert_eq!(harness.workdir_count(), 0);
}

#[tokio::test]
async fn custom_training_with_archive_image() {
    let harness = harness(
        StubRunner::new()
            .with_output("model.pkl", b"weights")
            .with_output("metrics.json", b"{}"),
    )
    .await;
    upload_training_dataset(&harness).await;
    harness
        .blobstore
        .upload(
            "algorithms",
            "gradient-boost.tar",
            "application/x-tar",
            Bytes::from_static(b"tar bytes"),
        )
        .await
        .unwrap();

    let request = JobRequest::CustomTraining(CustomTrainingRequest {
        algorithm: "gradient-boost".to_string(),
        image: AlgorithmImage::Archive {
            key: "gradient-boost.tar".to_string(),
        },
        mode: ExecutionMode::Byoc,
        dataset: TrainingDataset {
            dataset_key: Some("iris.csv".to_string()),
            ..Default::default()
        },
        params_key: None,
    });
    let job_id = harness.submitter().enqueue("ada", &request).await.unwrap();
    harness.run_to_completion(&job_id).await;

    assert_eq!(harness.get_job(&job_id).await.state(), &JobState::Completed);

    // The archive was loaded under the deterministic tag, and the workload ran from it with the
    // image's own entrypoint.
    let prepared = harness.runner.prepared_images();
    assert_eq!(prepared.len(), 1);
    assert_matches!(&prepared[0], ImageSpec::Archive { tar_path, tag } => {
        assert_eq!(tag, "trainyard/custom-ada-gradient-boost:latest");
        // The archive is staged under the exchange directory root, where backends reading
        // through the shared volume can see it, and is gone once the image is loaded.
        assert!(tar_path.starts_with(harness.workdir_root.path()), "{tar_path:?}");
        assert!(!tar_path.exists());
    });
    let submitted = harness.runner.submitted_requests();
    assert_eq!(submitted[0].image, "trainyard/custom-ada-gradient-boost:latest");
    assert_eq!(submitted[0].entrypoint, Entrypoint::Image);
}

#[tokio::test]
async fn builtin_training_workload_failure() {
    let harness = harness(
        StubRunner::new().with_wait_outcome(WaitOutcome::Failure { exit_code: 3 }),
    )
    .await;
    upload_training_dataset(&harness).await;

    let request = JobRequest::BuiltinTraining(BuiltinTrainingRequest {
        algorithm: "random-forest".to_string(),
        engine: "builtin-engine".to_string(),
        options: json!({"trees": 100}),
        target_column: Some("species".to_string()),
        dataset: TrainingDataset {
            dataset_key: Some("iris.csv".to_string()),
            ..Default::default()
        },
        params_key: None,
    });
    let job_id = harness.submitter().enqueue("ada", &request).await.unwrap();
    harness.run_to_completion(&job_id).await;

    let job = harness.get_job(&job_id).await;
    assert_eq!(job.state(), &JobState::Failed);
    assert!(
        job.error_message().unwrap().contains("exited with code 3"),
        "{:?}",
        job.error_message()
    );
    assert_eq!(job.model_id(), None);

    let run = harness.get_training_run(job.training_id().unwrap()).await;
    assert_eq!(run.state(), &TrainingRunState::Failed);

    // Nothing was published.
    assert!(harness.blobstore.keys_in("models").is_empty());
    assert!(harness.blobstore.keys_in("metrics").is_empty());
    assert_eq!(harness.workdir_count(), 0);
}

#[tokio::test]
async fn workload_timeout_fails_the_job() {
    let harness = harness(StubRunner::new().with_wait_outcome(WaitOutcome::Timeout)).await;
    upload_training_dataset(&harness).await;

    let request = JobRequest::BuiltinTraining(BuiltinTrainingRequest {
        algorithm: "random-forest".to_string(),
        engine: "builtin-engine".to_string(),
        options: json!({}),
        target_column: None,
        dataset: TrainingDataset {
            dataset_key: Some("iris.csv".to_string()),
            ..Default::default()
        },
        params_key: None,
    });
    let job_id = harness.submitter().enqueue("ada", &request).await.unwrap();
    harness.run_to_completion(&job_id).await;

    // A workload that never finishes is a failure, not a stop.
    let job = harness.get_job(&job_id).await;
    assert_eq!(job.state(), &JobState::Failed);
    assert!(
        job.error_message()
            .unwrap()
            .contains("did not finish within"),
        "{:?}",
        job.error_message()
    );
    assert_eq!(
        harness
            .get_training_run(job.training_id().unwrap())
            .await
            .state(),
        &TrainingRunState::Failed
    );
    assert_eq!(harness.workdir_count(), 0);
}

#[tokio::test]
async fn training_without_outputs_fails() {
    let harness = harness(
        StubRunner::new().with_image_file("/app/algorithm.py", b"def train(**kwargs): pass"),
    )
    .await;
    upload_training_dataset(&harness).await;

    let job_id = harness
        .submitter()
        .enqueue("ada", &custom_training_request())
        .await
        .unwrap();
    harness.run_to_completion(&job_id).await;

    let job = harness.get_job(&job_id).await;
    assert_eq!(job.state(), &JobState::Failed);
    assert!(
        job.error_message().unwrap().contains("no model file"),
        "{:?}",
        job.error_message()
    );
    assert_eq!(
        harness
            .get_training_run(job.training_id().unwrap())
            .await
            .state(),
        &TrainingRunState::Failed
    );
}

#[tokio::test]
async fn stop_before_workload_submission() {
    let harness = harness(StubRunner::new()).await;
    upload_training_dataset(&harness).await;

    let job_id = harness
        .submitter()
        .enqueue("ada", &custom_training_request())
        .await
        .unwrap();
    harness
        .datastore
        .run_unnamed_tx(|tx| Box::pin(async move { tx.request_job_stop(&job_id).await }))
        .await
        .unwrap();
    harness.run_to_completion(&job_id).await;

    let job = harness.get_job(&job_id).await;
    assert_eq!(job.state(), &JobState::Stopped);
    // The stop was observed before anything ran.
    assert!(harness.runner.submitted_requests().is_empty());
    assert_eq!(
        harness
            .get_training_run(job.training_id().unwrap())
            .await
            .state(),
        &TrainingRunState::Failed
    );
}

#[tokio::test]
async fn stop_during_workload_run() {
    let harness = harness(
        StubRunner::new()
            .with_wait_outcome(WaitOutcome::BlockUntilCancelled)
            .with_image_file("/app/algorithm.py", b"def train(**kwargs): pass"),
    )
    .await;
    upload_training_dataset(&harness).await;

    let job_id = harness
        .submitter()
        .enqueue("ada", &custom_training_request())
        .await
        .unwrap();

    let components = Arc::clone(&harness.components);
    let job = harness.get_job(&job_id).await;
    let orchestration = tokio::task::spawn(async move {
        let pipeline = build_pipeline::<MockClock>(&job).unwrap();
        run_job(components.as_ref(), pipeline.as_ref()).await;
    });

    // Wait for the workload to be submitted, then stop the job the way a caller would.
    while harness.get_job(&job_id).await.external_handle().is_none() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let status_service = JobStatusService::new(
        Arc::clone(&harness.datastore),
        Arc::clone(&harness.runner) as Arc<dyn ContainerRunner>,
    );
    status_service
        .request_stop(&Requester::new("ada".to_string(), false), &job_id)
        .await
        .unwrap();
    orchestration.await.unwrap();

    let job = harness.get_job(&job_id).await;
    assert_eq!(job.state(), &JobState::Stopped);
    assert_eq!(job.error_message(), Some("stopped at user request"));
    // The workload itself was torn down.
    assert_eq!(harness.runner.cancelled_handles().len(), 1);
    assert_eq!(
        harness
            .get_training_run(job.training_id().unwrap())
            .await
            .state(),
        &TrainingRunState::Failed
    );
    assert!(harness.blobstore.keys_in("models").is_empty());
    assert_eq!(harness.workdir_count(), 0);
}

/// A blobstore that raises the configured job's stop flag as soon as an object lands in the
/// model bucket, so the stop is observed between artifact upload and domain-row publication.
#[derive(Clone, Debug)]
struct StopOnModelUpload {
    inner: MemoryBlobStore,
    datastore: Arc<Datastore<MockClock>>,
    job_id: Arc<Mutex<Option<JobId>>>,
}

#[async_trait]
impl BlobStore for StopOnModelUpload {
    async fn upload(
        &self,
        bucket: &str,
        key: &str,
        content_type: &str,
        body: Bytes,
    ) -> Result<(), BlobStoreError> {
        self.inner.upload(bucket, key, content_type, body).await?;
        if bucket == "models" {
            let job_id = self.job_id.lock().unwrap().unwrap();
            self.datastore
                .run_unnamed_tx(move |tx| {
                    Box::pin(async move { tx.request_job_stop(&job_id).await })
                })
                .await
                .unwrap();
        }
        Ok(())
    }

    async fn download(&self, bucket: &str, key: &str) -> Result<Bytes, BlobStoreError> {
        self.inner.download(bucket, key).await
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<(), BlobStoreError> {
        self.inner.delete(bucket, key).await
    }
}

#[tokio::test]
async fn stop_between_artifact_upload_and_publication() {
    let stop_job = Arc::new(Mutex::new(None));
    let harness = harness_with_blobstore(
        StubRunner::new()
            .with_output("model.bin", b"weights")
            .with_output("metrics.json", b"{}")
            .with_image_file("/app/algorithm.py", b"def train(**kwargs): pass"),
        {
            let stop_job = Arc::clone(&stop_job);
            |blobstore, datastore| {
                Arc::new(StopOnModelUpload {
                    inner: blobstore,
                    datastore,
                    job_id: stop_job,
                }) as Arc<dyn BlobStore>
            }
        },
    )
    .await;
    upload_training_dataset(&harness).await;

    let job_id = harness
        .submitter()
        .enqueue("ada", &custom_training_request())
        .await
        .unwrap();
    *stop_job.lock().unwrap() = Some(job_id);
    harness.run_to_completion(&job_id).await;

    // The stop landed after the model artifact was uploaded but before the publication commit:
    // the job is STOPPED, the uploads were deleted, and no model row was linked.
    let job = harness.get_job(&job_id).await;
    assert_eq!(job.state(), &JobState::Stopped);
    assert_eq!(job.model_id(), None);
    assert!(harness.blobstore.keys_in("models").is_empty());
    assert!(harness.blobstore.keys_in("metrics").is_empty());
    assert_eq!(
        harness
            .get_training_run(job.training_id().unwrap())
            .await
            .state(),
        &TrainingRunState::Failed
    );
    assert_eq!(harness.workdir_count(), 0);
}

#[tokio::test]
async fn builtin_prediction_success() {
    let harness = harness(StubRunner::new().with_output("results.csv", b"prediction\n1\n")).await;
    let model_id = harness.put_model("ada", "ada_20200913000000_model.bin").await;
    harness
        .blobstore
        .upload(
            "predictions",
            "digits_test.csv",
            "text/csv",
            Bytes::from_static(b"a,b\n3,4\n"),
        )
        .await
        .unwrap();

    let request = JobRequest::BuiltinPrediction(BuiltinPredictionRequest {
        model_id,
        dataset_key: "digits_test.csv".to_string(),
        params_key: None,
    });
    let job_id = harness.submitter().enqueue("ada", &request).await.unwrap();
    harness.run_to_completion(&job_id).await;

    let job = harness.get_job(&job_id).await;
    assert_eq!(job.state(), &JobState::Completed);

    let execution_id = job.execution_id().unwrap();
    let execution = harness
        .datastore
        .run_unnamed_tx(|tx| Box::pin(async move { tx.get_model_execution(execution_id).await }))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(execution.state(), &ModelExecutionState::Completed);
    let result_key = execution.result_key().unwrap();
    assert_eq!(result_key, "ada_20200913122640_results.csv");
    assert!(harness.blobstore.contains("results", result_key));

    // The builtin runner image was used with its own entrypoint.
    let submitted = harness.runner.submitted_requests();
    assert_eq!(submitted[0].image, "trainyard/builtin-runner:latest");
    assert_eq!(submitted[0].entrypoint, Entrypoint::Image);
}

#[tokio::test]
async fn prediction_of_unknown_model_is_rejected() {
    let harness = harness(StubRunner::new()).await;
    let request = JobRequest::BuiltinPrediction(BuiltinPredictionRequest {
        model_id: 12345,
        dataset_key: "digits_test.csv".to_string(),
        params_key: None,
    });
    let rslt = harness.submitter().enqueue("ada", &request).await;
    assert_matches!(rslt, Err(Error::UnknownModel(12345)));
}

#[tokio::test]
async fn training_dataset_selection_must_be_unambiguous() {
    let harness = harness(StubRunner::new()).await;
    let request = JobRequest::CustomTraining(CustomTrainingRequest {
        algorithm: "gradient-boost".to_string(),
        image: AlgorithmImage::Registry {
            reference: "ada/gb:1".to_string(),
        },
        mode: ExecutionMode::Byoc,
        dataset: TrainingDataset {
            dataset_key: Some("iris.csv".to_string()),
            retrain_from_model: Some(1),
            ..Default::default()
        },
        params_key: None,
    });
    let rslt = harness.submitter().enqueue("ada", &request).await;
    assert_matches!(rslt, Err(Error::InvalidRequest(_)));

    let request = JobRequest::CustomTraining(CustomTrainingRequest {
        algorithm: "gradient-boost".to_string(),
        image: AlgorithmImage::Registry {
            reference: "ada/gb:1".to_string(),
        },
        mode: ExecutionMode::Byoc,
        dataset: TrainingDataset::default(),
        params_key: None,
    });
    let rslt = harness.submitter().enqueue("ada", &request).await;
    assert_matches!(rslt, Err(Error::InvalidRequest(_)));
}

#[tokio::test]
async fn non_csv_dataset_is_rejected() {
    let harness = harness(StubRunner::new()).await;
    let request = JobRequest::CustomTraining(CustomTrainingRequest {
        algorithm: "gradient-boost".to_string(),
        image: AlgorithmImage::Registry {
            reference: "ada/gb:1".to_string(),
        },
        mode: ExecutionMode::Byoc,
        dataset: TrainingDataset {
            dataset_key: Some("iris.xlsx".to_string()),
            ..Default::default()
        },
        params_key: None,
    });
    let rslt = harness.submitter().enqueue("ada", &request).await;
    assert_matches!(rslt, Err(Error::DatasetFormat(_)));
}

#[tokio::test]
async fn retraining_reuses_the_original_dataset() {
    let harness = harness(StubRunner::new()).await;
    let model_id = harness.put_model("ada", "ada_20200913000000_model.bin").await;

    // Record a completed training run that produced the model.
    let seed_job_id: JobId = rand::random();
    let seed_job = Job::new(
        seed_job_id,
        trainyard_orchestrator_core::datastore::models::JobKind::CustomTraining,
        "ada".to_string(),
        harness.clock.now(),
    );
    harness
        .datastore
        .run_unnamed_tx(|tx| {
            let seed_job = seed_job.clone();
            Box::pin(async move {
                tx.put_job(&seed_job).await?;
                let training_id = tx
                    .put_training_run(&TrainingRun::new(
                        seed_job_id,
                        "gradient-boost".to_string(),
                        "iris.csv".to_string(),
                        None,
                    ))
                    .await?;
                tx.mark_training_run_running(training_id).await?;
                tx.mark_training_run_completed(training_id, None, model_id).await
            })
        })
        .await
        .unwrap();

    let request = JobRequest::CustomTraining(CustomTrainingRequest {
        algorithm: "gradient-boost".to_string(),
        image: AlgorithmImage::Registry {
            reference: "ada/gb:2".to_string(),
        },
        mode: ExecutionMode::Byoc,
        dataset: TrainingDataset {
            retrain_from_model: Some(model_id),
            ..Default::default()
        },
        params_key: None,
    });
    let job_id = harness.submitter().enqueue("ada", &request).await.unwrap();

    let job = harness.get_job(&job_id).await;
    let run = harness.get_training_run(job.training_id().unwrap()).await;
    assert_eq!(run.dataset_key(), "iris.csv");
}

#[tokio::test]
async fn status_service_authorization() {
    let harness = harness(StubRunner::new()).await;
    upload_training_dataset(&harness).await;
    let job_id = harness
        .submitter()
        .enqueue("ada", &custom_training_request())
        .await
        .unwrap();

    let status_service = JobStatusService::new(
        Arc::clone(&harness.datastore),
        Arc::clone(&harness.runner) as Arc<dyn ContainerRunner>,
    );

    let status = status_service
        .status(&Requester::new("ada".to_string(), false), &job_id)
        .await
        .unwrap();
    assert_eq!(status.state, JobState::Pending);
    assert_eq!(status.owner, "ada");

    // Another user can't see the job, an administrator can.
    let rslt = status_service
        .status(&Requester::new("grace".to_string(), false), &job_id)
        .await;
    assert_matches!(rslt, Err(Error::NotAuthorized));
    status_service
        .status(&Requester::new("grace".to_string(), true), &job_id)
        .await
        .unwrap();

    let rslt = status_service
        .status(&Requester::new("ada".to_string(), false), &rand::random())
        .await;
    assert_matches!(rslt, Err(Error::UnknownJob(_)));

    let rslt = status_service
        .request_stop(&Requester::new("grace".to_string(), false), &job_id)
        .await;
    assert_matches!(rslt, Err(Error::NotAuthorized));
}

#[tokio::test]
async fn stop_request_on_finished_job_leaves_workload_alone() {
    let harness = harness(
        StubRunner::new()
            .with_output("model.bin", b"weights")
            .with_output("metrics.json", b"{}")
            .with_image_file("/app/algorithm.py", b"def train(**kwargs): pass"),
    )
    .await;
    upload_training_dataset(&harness).await;
    let job_id = harness
        .submitter()
        .enqueue("ada", &custom_training_request())
        .await
        .unwrap();
    harness.run_to_completion(&job_id).await;
    assert_eq!(harness.get_job(&job_id).await.state(), &JobState::Completed);

    let status_service = JobStatusService::new(
        Arc::clone(&harness.datastore),
        Arc::clone(&harness.runner) as Arc<dyn ContainerRunner>,
    );
    status_service
        .request_stop(&Requester::new("ada".to_string(), false), &job_id)
        .await
        .unwrap();

    // The job keeps its terminal state and nothing is torn down.
    let job = harness.get_job(&job_id).await;
    assert_eq!(job.state(), &JobState::Completed);
    assert!(job.stop_requested());
    assert!(harness.runner.cancelled_handles().is_empty());
}

#[tokio::test]
async fn in_process_submission_runs_to_completion() {
    let harness = harness(
        StubRunner::new()
            .with_output("model.bin", b"weights")
            .with_output("metrics.json", b"{}")
            .with_image_file("/app/algorithm.py", b"def train(**kwargs): pass"),
    )
    .await;
    upload_training_dataset(&harness).await;

    let job_id = harness
        .submitter()
        .submit("ada", &custom_training_request())
        .await
        .unwrap();

    let mut state = *harness.get_job(&job_id).await.state();
    while !state.is_terminal() {
        tokio::time::sleep(Duration::from_millis(10)).await;
        state = *harness.get_job(&job_id).await.state();
    }
    assert_eq!(state, JobState::Completed);
}

#[tokio::test]
async fn driver_picks_up_pending_jobs() {
    let harness = harness(
        StubRunner::new()
            .with_output("model.bin", b"weights")
            .with_output("metrics.json", b"{}")
            .with_image_file("/app/algorithm.py", b"def train(**kwargs): pass"),
    )
    .await;
    upload_training_dataset(&harness).await;

    let submitter = harness.submitter();
    let first = submitter.enqueue("ada", &custom_training_request()).await.unwrap();
    let second = submitter.enqueue("grace", &custom_training_request()).await.unwrap();

    let stopper = Stopper::new();
    let driver = PendingJobDriver::new(
        Arc::clone(&harness.components),
        TokioRuntime,
        Duration::from_millis(10),
        2,
        stopper.clone(),
    );
    let driver_task = tokio::task::spawn(driver.run());

    for job_id in [first, second] {
        while !harness.get_job(&job_id).await.state().is_terminal() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(harness.get_job(&job_id).await.state(), &JobState::Completed);
    }
    stopper.stop();
    driver_task.await.unwrap();
}

#[tokio::test]
async fn driver_fails_jobs_with_unusable_requests() {
    let harness = harness(StubRunner::new()).await;

    // A job whose recorded request is not parseable must still reach a terminal state.
    let job_id: JobId = rand::random();
    let job = Job::new(
        job_id,
        trainyard_orchestrator_core::datastore::models::JobKind::CustomTraining,
        "ada".to_string(),
        harness.clock.now(),
    )
    .with_request(Some("not json".to_string()));
    harness
        .datastore
        .run_unnamed_tx(|tx| {
            let job = job.clone();
            Box::pin(async move { tx.put_job(&job).await })
        })
        .await
        .unwrap();

    let stopper = Stopper::new();
    let driver = PendingJobDriver::new(
        Arc::clone(&harness.components),
        TokioRuntime,
        Duration::from_millis(10),
        2,
        stopper.clone(),
    );
    let driver_task = tokio::task::spawn(driver.run());

    while !harness.get_job(&job_id).await.state().is_terminal() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(harness.get_job(&job_id).await.state(), &JobState::Failed);
    stopper.stop();
    driver_task.await.unwrap();
}
