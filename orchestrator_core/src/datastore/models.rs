//! This module contains models used by the datastore.

use crate::datastore::Error;
use chrono::NaiveDateTime;
use rand::{
    Rng,
    distr::{Distribution, StandardUniform},
};
use std::{
    fmt::{self, Debug, Display, Formatter},
    str::FromStr,
};
use uuid::Uuid;

/// Unique identifier for a job, exposed to callers at submission time.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobId(Uuid);

impl JobId {
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl From<Uuid> for JobId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

impl Debug for JobId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Distribution<JobId> for StandardUniform {
    fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> JobId {
        JobId(uuid::Builder::from_random_bytes(rng.random()).into_uuid())
    }
}

/// The flavor of work a job performs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobKind {
    CustomTraining,
    BuiltinTraining,
    CustomPrediction,
    BuiltinPrediction,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CustomTraining => "custom_training",
            Self::BuiltinTraining => "builtin_training",
            Self::CustomPrediction => "custom_prediction",
            Self::BuiltinPrediction => "builtin_prediction",
        }
    }

    pub fn is_training(&self) -> bool {
        matches!(self, Self::CustomTraining | Self::BuiltinTraining)
    }
}

impl TryFrom<&str> for JobKind {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "custom_training" => Ok(Self::CustomTraining),
            "builtin_training" => Ok(Self::BuiltinTraining),
            "custom_prediction" => Ok(Self::CustomPrediction),
            "builtin_prediction" => Ok(Self::BuiltinPrediction),
            _ => Err(Error::DbState(format!("unexpected job kind {value}"))),
        }
    }
}

impl Display for JobKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The lifecycle state of a job. Transitions only move forward: PENDING to RUNNING, then RUNNING
/// to exactly one of the terminal states, which are never overwritten.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobState {
    Pending,
    Running,
    Completed,
    Failed,
    Stopped,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Stopped => "STOPPED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Stopped)
    }
}

impl TryFrom<&str> for JobState {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "PENDING" => Ok(Self::Pending),
            "RUNNING" => Ok(Self::Running),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            "STOPPED" => Ok(Self::Stopped),
            _ => Err(Error::DbState(format!("unexpected job state {value}"))),
        }
    }
}

impl Display for JobState {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An orchestration-level job record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Job {
    /// Unique identifier for the job.
    job_id: JobId,
    /// The flavor of work this job performs.
    kind: JobKind,
    /// Current lifecycle state.
    state: JobState,
    /// Username of the submitter; all status reads are checked against it.
    owner: String,
    /// Serialized submission payload. Carries everything an orchestration needs to rebuild the
    /// job's pipeline, so a PENDING job can be picked up by a different process than the one
    /// that enqueued it.
    request: Option<String>,
    /// Set when a caller asks for the job to stop; polled by the running orchestration.
    stop_requested: bool,
    /// Identity of the submitted workload (container id or Kubernetes Job name), recorded as
    /// soon as the workload is submitted.
    external_handle: Option<String>,
    /// Human-readable failure description, populated on the FAILED and STOPPED paths.
    error_message: Option<String>,
    /// Identifier of the training run this job produced, if any.
    training_id: Option<i64>,
    /// Identifier of the model this job produced, if any.
    model_id: Option<i64>,
    /// Identifier of the model execution this job produced, if any.
    execution_id: Option<i64>,
    created_at: NaiveDateTime,
    started_at: Option<NaiveDateTime>,
    finished_at: Option<NaiveDateTime>,
}

impl Job {
    /// Creates a new PENDING job record.
    pub fn new(job_id: JobId, kind: JobKind, owner: String, created_at: NaiveDateTime) -> Self {
        Self {
            job_id,
            kind,
            state: JobState::Pending,
            owner,
            request: None,
            stop_requested: false,
            external_handle: None,
            error_message: None,
            training_id: None,
            model_id: None,
            execution_id: None,
            created_at,
            started_at: None,
            finished_at: None,
        }
    }

    /// Returns the job ID associated with this job.
    pub fn id(&self) -> &JobId {
        &self.job_id
    }

    /// Returns the flavor of work this job performs.
    pub fn kind(&self) -> &JobKind {
        &self.kind
    }

    /// Returns the state of this job.
    pub fn state(&self) -> &JobState {
        &self.state
    }

    /// Returns a new job identical to this one, with the given state.
    pub fn with_state(self, state: JobState) -> Self {
        Self { state, ..self }
    }

    /// Returns the username of the submitter.
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Returns the serialized submission payload, if one was recorded.
    pub fn request(&self) -> Option<&str> {
        self.request.as_deref()
    }

    pub fn with_request(self, request: Option<String>) -> Self {
        Self { request, ..self }
    }

    /// Returns true if a stop has been requested for this job.
    pub fn stop_requested(&self) -> bool {
        self.stop_requested
    }

    pub fn with_stop_requested(self, stop_requested: bool) -> Self {
        Self {
            stop_requested,
            ..self
        }
    }

    /// Returns the recorded workload identity, if the workload has been submitted.
    pub fn external_handle(&self) -> Option<&str> {
        self.external_handle.as_deref()
    }

    pub fn with_external_handle(self, external_handle: Option<String>) -> Self {
        Self {
            external_handle,
            ..self
        }
    }

    /// Returns the failure description, if the job failed or was stopped.
    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    pub fn with_error_message(self, error_message: Option<String>) -> Self {
        Self {
            error_message,
            ..self
        }
    }

    pub fn training_id(&self) -> Option<i64> {
        self.training_id
    }

    pub fn with_training_id(self, training_id: Option<i64>) -> Self {
        Self {
            training_id,
            ..self
        }
    }

    pub fn model_id(&self) -> Option<i64> {
        self.model_id
    }

    pub fn with_model_id(self, model_id: Option<i64>) -> Self {
        Self { model_id, ..self }
    }

    pub fn execution_id(&self) -> Option<i64> {
        self.execution_id
    }

    pub fn with_execution_id(self, execution_id: Option<i64>) -> Self {
        Self {
            execution_id,
            ..self
        }
    }

    pub fn created_at(&self) -> &NaiveDateTime {
        &self.created_at
    }

    pub fn started_at(&self) -> Option<&NaiveDateTime> {
        self.started_at.as_ref()
    }

    pub fn with_started_at(self, started_at: Option<NaiveDateTime>) -> Self {
        Self { started_at, ..self }
    }

    pub fn finished_at(&self) -> Option<&NaiveDateTime> {
        self.finished_at.as_ref()
    }

    pub fn with_finished_at(self, finished_at: Option<NaiveDateTime>) -> Self {
        Self {
            finished_at,
            ..self
        }
    }
}

/// The lifecycle state of a training run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrainingRunState {
    Requested,
    Running,
    Completed,
    Failed,
}

impl TrainingRunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Requested => "REQUESTED",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }
}

impl TryFrom<&str> for TrainingRunState {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "REQUESTED" => Ok(Self::Requested),
            "RUNNING" => Ok(Self::Running),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            _ => Err(Error::DbState(format!(
                "unexpected training run state {value}"
            ))),
        }
    }
}

impl Display for TrainingRunState {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A training run: the domain-level record of one training workload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TrainingRun {
    /// The job driving this training run.
    job_id: JobId,
    /// Opaque label of the algorithm being trained.
    algorithm: String,
    /// Object-storage key of the training dataset.
    dataset_key: String,
    /// Object-storage key of the caller-supplied parameter overrides, if any.
    params_key: Option<String>,
    state: TrainingRunState,
    /// Evaluation metrics text captured from the workload's metrics output.
    metrics: Option<String>,
    /// The model this run produced, linked on successful publication.
    model_id: Option<i64>,
    started_at: Option<NaiveDateTime>,
    finished_at: Option<NaiveDateTime>,
}

impl TrainingRun {
    /// Creates a new REQUESTED training run.
    pub fn new(
        job_id: JobId,
        algorithm: String,
        dataset_key: String,
        params_key: Option<String>,
    ) -> Self {
        Self {
            job_id,
            algorithm,
            dataset_key,
            params_key,
            state: TrainingRunState::Requested,
            metrics: None,
            model_id: None,
            started_at: None,
            finished_at: None,
        }
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    pub fn algorithm(&self) -> &str {
        &self.algorithm
    }

    pub fn dataset_key(&self) -> &str {
        &self.dataset_key
    }

    pub fn params_key(&self) -> Option<&str> {
        self.params_key.as_deref()
    }

    pub fn state(&self) -> &TrainingRunState {
        &self.state
    }

    pub fn with_state(self, state: TrainingRunState) -> Self {
        Self { state, ..self }
    }

    pub fn metrics(&self) -> Option<&str> {
        self.metrics.as_deref()
    }

    pub fn with_metrics(self, metrics: Option<String>) -> Self {
        Self { metrics, ..self }
    }

    pub fn model_id(&self) -> Option<i64> {
        self.model_id
    }

    pub fn with_model_id(self, model_id: Option<i64>) -> Self {
        Self { model_id, ..self }
    }

    pub fn started_at(&self) -> Option<&NaiveDateTime> {
        self.started_at.as_ref()
    }

    pub fn with_started_at(self, started_at: Option<NaiveDateTime>) -> Self {
        Self { started_at, ..self }
    }

    pub fn finished_at(&self) -> Option<&NaiveDateTime> {
        self.finished_at.as_ref()
    }

    pub fn with_finished_at(self, finished_at: Option<NaiveDateTime>) -> Self {
        Self {
            finished_at,
            ..self
        }
    }
}

/// A published model artifact.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Model {
    /// Human-readable model name, derived from the algorithm and the artifact filename.
    name: String,
    /// Username of the model's owner.
    owner: String,
    /// The engine that produced the model (an opaque label, e.g. a framework name).
    engine: String,
    /// Object-storage key of the serialized model artifact.
    artifact_key: String,
    created_at: NaiveDateTime,
}

impl Model {
    pub fn new(
        name: String,
        owner: String,
        engine: String,
        artifact_key: String,
        created_at: NaiveDateTime,
    ) -> Self {
        Self {
            name,
            owner,
            engine,
            artifact_key,
            created_at,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn engine(&self) -> &str {
        &self.engine
    }

    pub fn artifact_key(&self) -> &str {
        &self.artifact_key
    }

    pub fn created_at(&self) -> &NaiveDateTime {
        &self.created_at
    }
}

/// The lifecycle state of a model execution.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModelExecutionState {
    Running,
    Completed,
    Failed,
}

impl ModelExecutionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }
}

impl TryFrom<&str> for ModelExecutionState {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "RUNNING" => Ok(Self::Running),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            _ => Err(Error::DbState(format!(
                "unexpected model execution state {value}"
            ))),
        }
    }
}

impl Display for ModelExecutionState {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A model execution: the domain-level record of one prediction workload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModelExecution {
    /// The job driving this execution.
    job_id: JobId,
    /// The model being executed.
    model_id: i64,
    /// Object-storage key of the prediction input dataset.
    dataset_key: String,
    state: ModelExecutionState,
    /// Object-storage key of the uploaded prediction results, linked on successful publication.
    result_key: Option<String>,
    started_at: Option<NaiveDateTime>,
    finished_at: Option<NaiveDateTime>,
}

impl ModelExecution {
    /// Creates a new RUNNING model execution.
    pub fn new(job_id: JobId, model_id: i64, dataset_key: String) -> Self {
        Self {
            job_id,
            model_id,
            dataset_key,
            state: ModelExecutionState::Running,
            result_key: None,
            started_at: None,
            finished_at: None,
        }
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    pub fn model_id(&self) -> i64 {
        self.model_id
    }

    pub fn dataset_key(&self) -> &str {
        &self.dataset_key
    }

    pub fn state(&self) -> &ModelExecutionState {
        &self.state
    }

    pub fn with_state(self, state: ModelExecutionState) -> Self {
        Self { state, ..self }
    }

    pub fn result_key(&self) -> Option<&str> {
        self.result_key.as_deref()
    }

    pub fn with_result_key(self, result_key: Option<String>) -> Self {
        Self { result_key, ..self }
    }

    pub fn started_at(&self) -> Option<&NaiveDateTime> {
        self.started_at.as_ref()
    }

    pub fn with_started_at(self, started_at: Option<NaiveDateTime>) -> Self {
        Self { started_at, ..self }
    }

    pub fn finished_at(&self) -> Option<&NaiveDateTime> {
        self.finished_at.as_ref()
    }

    pub fn with_finished_at(self, finished_at: Option<NaiveDateTime>) -> Self {
        Self {
            finished_at,
            ..self
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{JobId, JobKind, JobState, ModelExecutionState, TrainingRunState};
    use rand::random;
    use std::str::FromStr;

    #[test]
    fn job_id_string_roundtrip() {
        let job_id: JobId = random();
        assert_eq!(job_id, JobId::from_str(&job_id.to_string()).unwrap());
    }

    #[test]
    fn job_id_rejects_garbage() {
        assert!(JobId::from_str("not-a-uuid").is_err());
    }

    #[test]
    fn random_job_ids_are_version_4_uuids() {
        let first: JobId = random();
        let second: JobId = random();
        assert_ne!(first, second);
        // Hyphenated form: the version digit follows the second hyphen.
        assert_eq!(first.to_string().as_bytes()[14], b'4');
    }

    #[test]
    fn state_string_roundtrips() {
        for state in [
            JobState::Pending,
            JobState::Running,
            JobState::Completed,
            JobState::Failed,
            JobState::Stopped,
        ] {
            assert_eq!(state, JobState::try_from(state.as_str()).unwrap());
        }
        for state in [
            TrainingRunState::Requested,
            TrainingRunState::Running,
            TrainingRunState::Completed,
            TrainingRunState::Failed,
        ] {
            assert_eq!(state, TrainingRunState::try_from(state.as_str()).unwrap());
        }
        for state in [
            ModelExecutionState::Running,
            ModelExecutionState::Completed,
            ModelExecutionState::Failed,
        ] {
            assert_eq!(state, ModelExecutionState::try_from(state.as_str()).unwrap());
        }
    }

    #[test]
    fn terminal_states() {
        assert!(!JobState::Pending.is_terminal());
        assert!(!JobState::Running.is_terminal());
        assert!(JobState::Completed.is_terminal());
        assert!(JobState::Failed.is_terminal());
        assert!(JobState::Stopped.is_terminal());
    }

    #[test]
    fn job_kind_classification() {
        assert!(JobKind::CustomTraining.is_training());
        assert!(JobKind::BuiltinTraining.is_training());
        assert!(!JobKind::CustomPrediction.is_training());
        assert!(!JobKind::BuiltinPrediction.is_training());
    }
}
