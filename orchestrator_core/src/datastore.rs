//! Trainyard datastore.

use self::models::{
    Job, JobId, JobKind, JobState, Model, ModelExecution, ModelExecutionState, TrainingRun,
    TrainingRunState,
};
use opentelemetry::{
    KeyValue,
    metrics::{Counter, Histogram, Meter},
};
use sqlx::{
    Row, Sqlite,
    migrate::Migrator,
    query,
    query::Query,
    sqlite::{SqliteArguments, SqlitePool, SqliteQueryResult, SqliteRow},
};
use std::{
    future::Future,
    pin::Pin,
    str::FromStr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Instant,
};
use tokio::sync::Mutex;
use tracing::{Level, error};
use trainyard_core::time::Clock;

pub mod models;
#[cfg(feature = "test-util")]
#[cfg_attr(docsrs, doc(cfg(feature = "test-util")))]
pub mod test_util;

/// The migrations used to bring a database up to the current schema version.
pub static MIGRATOR: Migrator = sqlx::migrate!("../db/migrations");

/// The schema versions this version of Trainyard can use. A datastore whose current migration
/// version is not in this list is refused at startup.
pub const SUPPORTED_SCHEMA_VERSIONS: &[i64] = &[20250701000000];

pub const TRANSACTION_METER_NAME: &str = "trainyard_database_transactions";
pub const TRANSACTION_RETRIES_METER_NAME: &str = "trainyard_database_transaction_retries";
pub const TRANSACTION_ROLLBACK_METER_NAME: &str = "trainyard_database_rollback_errors";
pub const TRANSACTION_DURATION_METER_NAME: &str = "trainyard_database_transaction_duration";
pub const TRANSACTION_POOL_WAIT_METER_NAME: &str = "trainyard_database_pool_wait_duration";

/// Datastore represents a datastore for the Trainyard orchestrator, with support for transactional
/// reads and writes. In practice, Datastore instances are currently backed by a SQLite database.
#[derive(Debug)]
pub struct Datastore<C: Clock> {
    pool: SqlitePool,
    clock: C,
    transaction_status_counter: Counter<u64>,
    transaction_retry_histogram: Histogram<u64>,
    rollback_error_counter: Counter<u64>,
    transaction_duration_histogram: Histogram<f64>,
    transaction_pool_wait_histogram: Histogram<f64>,
    max_transaction_retries: u64,
}

impl<C: Clock> Datastore<C> {
    /// `new` creates a datastore using the provided connection pool. An error is returned if the
    /// current database migration version is not supported by this version of Trainyard.
    pub async fn new(
        pool: SqlitePool,
        clock: C,
        meter: &Meter,
        max_transaction_retries: u64,
    ) -> Result<Datastore<C>, Error> {
        Self::new_with_supported_versions(
            pool,
            clock,
            meter,
            max_transaction_retries,
            SUPPORTED_SCHEMA_VERSIONS,
        )
        .await
    }

    async fn new_with_supported_versions(
        pool: SqlitePool,
        clock: C,
        meter: &Meter,
        max_transaction_retries: u64,
        supported_schema_versions: &[i64],
    ) -> Result<Datastore<C>, Error> {
        let datastore =
            Self::new_without_supported_versions(pool, clock, meter, max_transaction_retries).await;

        let (current_version, migration_description) = datastore
            .run_tx("check schema version", |tx| {
                Box::pin(async move { tx.get_current_schema_migration_version().await })
            })
            .await?;

        if !supported_schema_versions.contains(&current_version) {
            return Err(Error::DbState(format!(
                "unsupported schema version {current_version} / {migration_description}"
            )));
        }

        Ok(datastore)
    }

    /// Creates a new datastore using the provided connection pool, without checking the database
    /// schema version.
    pub async fn new_without_supported_versions(
        pool: SqlitePool,
        clock: C,
        meter: &Meter,
        max_transaction_retries: u64,
    ) -> Datastore<C> {
        let transaction_status_counter = meter
            .u64_counter(TRANSACTION_METER_NAME)
            .with_description("Count of database transactions run, with their status.")
            .with_unit("{transaction}")
            .build();
        let transaction_retry_histogram = meter
            .u64_histogram(TRANSACTION_RETRIES_METER_NAME)
            .with_description("The number of retries before a transaction is committed or aborted.")
            .with_unit("{retry}")
            .build();
        let rollback_error_counter = meter
            .u64_counter(TRANSACTION_ROLLBACK_METER_NAME)
            .with_description(
                "Count of errors received when rolling back a database transaction, with their \
                 SQLite error code.",
            )
            .with_unit("{error}")
            .build();
        let transaction_duration_histogram = meter
            .f64_histogram(TRANSACTION_DURATION_METER_NAME)
            .with_description("Duration of database transactions.")
            .with_unit("s")
            .with_boundaries(Vec::from(crate::TIME_HISTOGRAM_BOUNDARIES))
            .build();
        let transaction_pool_wait_histogram = meter
            .f64_histogram(TRANSACTION_POOL_WAIT_METER_NAME)
            .with_description("Time spent waiting to acquire a database connection.")
            .with_unit("s")
            .with_boundaries(Vec::from(crate::TIME_HISTOGRAM_BOUNDARIES))
            .build();

        Self {
            pool,
            clock,
            transaction_status_counter,
            transaction_retry_histogram,
            rollback_error_counter,
            transaction_duration_histogram,
            transaction_pool_wait_histogram,
            max_transaction_retries,
        }
    }

    /// run_tx runs a transaction, whose body is determined by the given function. The transaction
    /// is committed if the body returns a successful value, and rolled back if the body returns an
    /// error value.
    ///
    /// The datastore will automatically retry some failures (e.g. lock contention with another
    /// writer) by rolling back & retrying with a new transaction, so the given function should
    /// support being called multiple times. Values read from the transaction should not be
    /// considered as "finalized" until the transaction is committed, i.e. after `run_tx` is run to
    /// completion.
    pub async fn run_tx<F, T>(&self, name: &'static str, f: F) -> Result<T, Error>
    where
        F: for<'a> Fn(&'a Transaction<C>) -> Pin<Box<dyn Future<Output = Result<T, Error>> + Send + 'a>>,
    {
        let mut retry_count = 0;
        loop {
            let (rslt, retry) = self.run_tx_once(name, &f).await;
            let status = match (rslt.as_ref(), retry) {
                (_, true) => "retry",
                (Ok(_), _) | (Err(Error::User(_)), _) => "success",
                (Err(Error::Db(_)), _) => "error_db",
                (Err(_), _) => "error_other",
            };
            self.transaction_status_counter.add(
                1,
                &[KeyValue::new("status", status), KeyValue::new("tx", name)],
            );

            if !retry {
                self.transaction_retry_histogram
                    .record(retry_count, &[KeyValue::new("tx", name)]);
                return rslt;
            }

            retry_count += 1;
            if retry_count > self.max_transaction_retries {
                self.transaction_status_counter.add(
                    1,
                    &[
                        KeyValue::new("status", "error_too_many_retries"),
                        KeyValue::new("tx", name),
                    ],
                );
                self.transaction_retry_histogram
                    .record(retry_count, &[KeyValue::new("tx", name)]);
                return Err(Error::TooManyRetries {
                    source: rslt.err().map(Box::new),
                });
            }
        }
    }

    async fn run_tx_once<F, T>(&self, name: &'static str, f: &F) -> (Result<T, Error>, bool)
    where
        F: for<'a> Fn(&'a Transaction<C>) -> Pin<Box<dyn Future<Output = Result<T, Error>> + Send + 'a>>,
    {
        // Acquire a connection from the pool & open a transaction on it.
        let before = Instant::now();
        let rslt = self.pool.begin().await;
        let elapsed = before.elapsed();
        self.transaction_pool_wait_histogram.record(
            elapsed.as_secs_f64(),
            &[KeyValue::new(
                "status",
                if rslt.is_err() { "error" } else { "success" },
            )],
        );
        let raw_tx = match rslt {
            Ok(raw_tx) => raw_tx,
            Err(err) => return (Err(err.into()), false),
        };

        let before = Instant::now();
        let tx = Transaction {
            raw_tx: Mutex::new(raw_tx),
            clock: &self.clock,
            retry: AtomicBool::new(false),
        };

        // Run the user-provided function with the transaction, then commit or roll back based on
        // its result.
        let rslt = f(&tx).await;
        let (raw_tx, retry) = (tx.raw_tx.into_inner(), tx.retry);
        let rslt = match (rslt, retry.load(Ordering::Relaxed)) {
            // Commit.
            (Ok(val), false) => match check_error(&retry, raw_tx.commit().await) {
                Ok(()) => Ok(val),
                Err(err) => Err(err.into()),
            },

            // Roll back.
            (rslt, _) => {
                if let Err(rollback_err) = check_error(&retry, raw_tx.rollback().await) {
                    error!("Couldn't roll back transaction: {rollback_err}");
                    self.rollback_error_counter.add(
                        1,
                        &[KeyValue::new(
                            "code",
                            sqlite_error_code(&rollback_err)
                                .unwrap_or_else(|| String::from("N/A")),
                        )],
                    );
                };
                rslt
            }
        };

        let elapsed = before.elapsed();
        self.transaction_duration_histogram
            .record(elapsed.as_secs_f64(), &[KeyValue::new("tx", name)]);
        (rslt, retry.load(Ordering::Relaxed))
    }

    /// See [`Datastore::run_tx`]. This method provides a placeholder transaction name. It is useful
    /// for tests where the transaction name is not important.
    #[cfg(feature = "test-util")]
    pub async fn run_unnamed_tx<F, T>(&self, f: F) -> Result<T, Error>
    where
        F: for<'a> Fn(&'a Transaction<C>) -> Pin<Box<dyn Future<Output = Result<T, Error>> + Send + 'a>>,
    {
        self.run_tx("default", f).await
    }

    /// Write a job into the datastore.
    #[cfg(feature = "test-util")]
    pub async fn put_job(&self, job: &Job) -> Result<(), Error> {
        self.run_tx("test-put-job", |tx| {
            let job = job.clone();
            Box::pin(async move { tx.put_job(&job).await })
        })
        .await
    }
}

fn check_error<T>(retry: &AtomicBool, rslt: Result<T, sqlx::Error>) -> Result<T, sqlx::Error> {
    if let Err(err) = &rslt {
        if is_retryable_error(err) {
            retry.store(true, Ordering::Relaxed);
        }
    }
    rslt
}

/// Returns true if the error signals a transient SQLite conflict which can be resolved by retrying
/// the transaction.
fn is_retryable_error(err: &sqlx::Error) -> bool {
    if let Some(code) = sqlite_error_code(err) {
        if let Ok(code) = code.parse::<i64>() {
            // Primary result codes SQLITE_BUSY and SQLITE_LOCKED, including their extended
            // variants.
            return matches!(code & 0xff, 5 | 6);
        }
    }
    false
}

fn sqlite_error_code(err: &sqlx::Error) -> Option<String> {
    if let sqlx::Error::Database(db_err) = err {
        db_err.code().map(|code| code.into_owned())
    } else {
        None
    }
}

/// Transaction represents an ongoing datastore transaction.
pub struct Transaction<'a, C: Clock> {
    raw_tx: Mutex<sqlx::Transaction<'static, Sqlite>>,
    clock: &'a C,
    retry: AtomicBool,
}

impl<C: Clock> Transaction<'_, C> {
    async fn execute<'q>(
        &self,
        query: Query<'q, Sqlite, SqliteArguments<'q>>,
    ) -> Result<SqliteQueryResult, sqlx::Error> {
        let mut raw_tx = self.raw_tx.lock().await;
        check_error(&self.retry, query.execute(&mut **raw_tx).await)
    }

    async fn fetch_one<'q>(
        &self,
        query: Query<'q, Sqlite, SqliteArguments<'q>>,
    ) -> Result<SqliteRow, sqlx::Error> {
        let mut raw_tx = self.raw_tx.lock().await;
        check_error(&self.retry, query.fetch_one(&mut **raw_tx).await)
    }

    async fn fetch_optional<'q>(
        &self,
        query: Query<'q, Sqlite, SqliteArguments<'q>>,
    ) -> Result<Option<SqliteRow>, sqlx::Error> {
        let mut raw_tx = self.raw_tx.lock().await;
        check_error(&self.retry, query.fetch_optional(&mut **raw_tx).await)
    }

    /// Returns the latest database schema migration that has been applied, as its version number
    /// and description.
    pub async fn get_current_schema_migration_version(&self) -> Result<(i64, String), Error> {
        let row = self
            .fetch_one(query(
                "-- get_current_schema_migration_version()
SELECT version, description FROM _sqlx_migrations ORDER BY version DESC LIMIT 1",
            ))
            .await?;
        Ok((row.try_get("version")?, row.try_get("description")?))
    }

    /// Writes a job into the datastore. The job must not already exist.
    #[tracing::instrument(skip(self), err(level = Level::DEBUG))]
    pub async fn put_job(&self, job: &Job) -> Result<(), Error> {
        let rslt = self
            .execute(
                query(
                    "-- put_job()
INSERT INTO jobs (job_id, kind, state, owner, request, stop_requested, external_handle,
                  error_message, training_id, model_id, execution_id, created_at, started_at,
                  finished_at)
VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
ON CONFLICT DO NOTHING",
                )
                .bind(/* job_id */ job.id().to_string())
                .bind(/* kind */ job.kind().as_str())
                .bind(/* state */ job.state().as_str())
                .bind(/* owner */ job.owner())
                .bind(/* request */ job.request())
                .bind(/* stop_requested */ job.stop_requested())
                .bind(/* external_handle */ job.external_handle())
                .bind(/* error_message */ job.error_message())
                .bind(/* training_id */ job.training_id())
                .bind(/* model_id */ job.model_id())
                .bind(/* execution_id */ job.execution_id())
                .bind(/* created_at */ *job.created_at())
                .bind(/* started_at */ job.started_at().copied())
                .bind(/* finished_at */ job.finished_at().copied()),
            )
            .await?;
        check_insert(rslt.rows_affected())
    }

    /// Fetch a job by ID.
    #[tracing::instrument(skip(self), err(level = Level::DEBUG))]
    pub async fn get_job(&self, job_id: &JobId) -> Result<Option<Job>, Error> {
        self.fetch_optional(
            query(
                "-- get_job()
SELECT kind, state, owner, request, stop_requested, external_handle, error_message, training_id,
       model_id, execution_id, created_at, started_at, finished_at
FROM jobs WHERE job_id = $1",
            )
            .bind(/* job_id */ job_id.to_string()),
        )
        .await?
        .map(|row| job_from_row(job_id, &row))
        .transpose()
    }

    /// Fetch jobs awaiting execution, oldest first. Used by the orchestrator's discovery loop;
    /// a job returned here is only owned by the caller once [`Self::try_acquire_job`] succeeds.
    #[tracing::instrument(skip(self), err(level = Level::DEBUG))]
    pub async fn get_pending_jobs(&self, limit: i64) -> Result<Vec<Job>, Error> {
        let rows = {
            let mut raw_tx = self.raw_tx.lock().await;
            check_error(
                &self.retry,
                query(
                    "-- get_pending_jobs()
SELECT job_id, kind, state, owner, request, stop_requested, external_handle, error_message,
       training_id, model_id, execution_id, created_at, started_at, finished_at
FROM jobs WHERE state = 'PENDING' ORDER BY created_at ASC LIMIT $1",
                )
                .bind(/* limit */ limit)
                .fetch_all(&mut **raw_tx)
                .await,
            )?
        };
        rows.iter()
            .map(|row| {
                let job_id = job_id_from_text(&row.try_get::<String, _>("job_id")?)?;
                job_from_row(&job_id, row)
            })
            .collect()
    }

    /// Attempts to move a PENDING job into the RUNNING state, returning whether the transition
    /// happened. Exactly one concurrent caller observes `true` for a given job, so this doubles
    /// as the acquisition step of the discovery loop.
    #[tracing::instrument(skip(self), err(level = Level::DEBUG))]
    pub async fn try_acquire_job(&self, job_id: &JobId) -> Result<bool, Error> {
        let rslt = self
            .execute(
                query(
                    "-- try_acquire_job()
UPDATE jobs SET state = 'RUNNING', started_at = $1
WHERE job_id = $2 AND state = 'PENDING'",
                )
                .bind(/* started_at */ self.clock.now())
                .bind(/* job_id */ job_id.to_string()),
            )
            .await?;
        Ok(rslt.rows_affected() > 0)
    }

    async fn get_job_state(&self, job_id: &JobId) -> Result<Option<JobState>, Error> {
        self.fetch_optional(
            query(
                "-- get_job_state()
SELECT state FROM jobs WHERE job_id = $1",
            )
            .bind(/* job_id */ job_id.to_string()),
        )
        .await?
        .map(|row| JobState::try_from(row.try_get::<String, _>("state")?.as_str()))
        .transpose()
    }

    /// Moves a job into the RUNNING state, recording the start time. Marking an already-RUNNING
    /// job is a no-op which preserves the original start time. Marking a job in a terminal state
    /// is refused.
    #[tracing::instrument(skip(self), err(level = Level::DEBUG))]
    pub async fn mark_job_running(&self, job_id: &JobId) -> Result<(), Error> {
        let now = self.clock.now();
        let rslt = self
            .execute(
                query(
                    "-- mark_job_running()
UPDATE jobs SET state = 'RUNNING', started_at = COALESCE(started_at, $1)
WHERE job_id = $2 AND state IN ('PENDING', 'RUNNING')",
                )
                .bind(/* started_at */ now)
                .bind(/* job_id */ job_id.to_string()),
            )
            .await?;
        if rslt.rows_affected() == 0 {
            return match self.get_job_state(job_id).await? {
                Some(state) => Err(Error::InvalidJobState {
                    job_id: *job_id,
                    state,
                }),
                None => Err(Error::MutationTargetNotFound),
            };
        }
        Ok(())
    }

    /// Moves a job into the COMPLETED state. A no-op if the job is already in a terminal state.
    #[tracing::instrument(skip(self), err(level = Level::DEBUG))]
    pub async fn mark_job_completed(&self, job_id: &JobId) -> Result<(), Error> {
        self.mark_job_terminal(job_id, JobState::Completed, None)
            .await
    }

    /// Moves a job into the FAILED state, recording a failure description. A no-op if the job is
    /// already in a terminal state.
    #[tracing::instrument(skip(self), err(level = Level::DEBUG))]
    pub async fn mark_job_failed(&self, job_id: &JobId, error_message: &str) -> Result<(), Error> {
        self.mark_job_terminal(job_id, JobState::Failed, Some(error_message))
            .await
    }

    /// Moves a job into the STOPPED state. A no-op if the job is already in a terminal state.
    #[tracing::instrument(skip(self), err(level = Level::DEBUG))]
    pub async fn mark_job_stopped(
        &self,
        job_id: &JobId,
        error_message: Option<&str>,
    ) -> Result<(), Error> {
        self.mark_job_terminal(job_id, JobState::Stopped, error_message)
            .await
    }

    async fn mark_job_terminal(
        &self,
        job_id: &JobId,
        state: JobState,
        error_message: Option<&str>,
    ) -> Result<(), Error> {
        let rslt = self
            .execute(
                query(
                    "-- mark_job_terminal()
UPDATE jobs SET state = $1, error_message = $2, finished_at = $3
WHERE job_id = $4 AND state NOT IN ('COMPLETED', 'FAILED', 'STOPPED')",
                )
                .bind(/* state */ state.as_str())
                .bind(/* error_message */ error_message)
                .bind(/* finished_at */ self.clock.now())
                .bind(/* job_id */ job_id.to_string()),
            )
            .await?;
        if rslt.rows_affected() == 0 {
            // Terminal states are never overwritten, so a second terminal mark is dropped without
            // error. Only a missing record is reported.
            if self.get_job_state(job_id).await?.is_none() {
                return Err(Error::MutationTargetNotFound);
            }
        }
        Ok(())
    }

    /// Raises the stop-requested flag on a job. The flag is observed by the running orchestration
    /// at its next cancellation checkpoint.
    #[tracing::instrument(skip(self), err(level = Level::DEBUG))]
    pub async fn request_job_stop(&self, job_id: &JobId) -> Result<(), Error> {
        let rslt = self
            .execute(
                query(
                    "-- request_job_stop()
UPDATE jobs SET stop_requested = 1 WHERE job_id = $1",
                )
                .bind(/* job_id */ job_id.to_string()),
            )
            .await?;
        check_single_row_mutation(rslt.rows_affected())
    }

    /// Reads the stop-requested flag of a job.
    #[tracing::instrument(skip(self), err(level = Level::DEBUG))]
    pub async fn get_job_stop_requested(&self, job_id: &JobId) -> Result<Option<bool>, Error> {
        Ok(self
            .fetch_optional(
                query(
                    "-- get_job_stop_requested()
SELECT stop_requested FROM jobs WHERE job_id = $1",
                )
                .bind(/* job_id */ job_id.to_string()),
            )
            .await?
            .map(|row| row.try_get("stop_requested"))
            .transpose()?)
    }

    /// Records the identity of the submitted workload (container ID or Kubernetes Job name) on a
    /// job.
    #[tracing::instrument(skip(self), err(level = Level::DEBUG))]
    pub async fn update_job_external_handle(
        &self,
        job_id: &JobId,
        external_handle: &str,
    ) -> Result<(), Error> {
        let rslt = self
            .execute(
                query(
                    "-- update_job_external_handle()
UPDATE jobs SET external_handle = $1 WHERE job_id = $2",
                )
                .bind(/* external_handle */ external_handle)
                .bind(/* job_id */ job_id.to_string()),
            )
            .await?;
        check_single_row_mutation(rslt.rows_affected())
    }

    /// Links a job to the training run it drives.
    #[tracing::instrument(skip(self), err(level = Level::DEBUG))]
    pub async fn update_job_training_id(
        &self,
        job_id: &JobId,
        training_id: i64,
    ) -> Result<(), Error> {
        let rslt = self
            .execute(
                query(
                    "-- update_job_training_id()
UPDATE jobs SET training_id = $1 WHERE job_id = $2",
                )
                .bind(/* training_id */ training_id)
                .bind(/* job_id */ job_id.to_string()),
            )
            .await?;
        check_single_row_mutation(rslt.rows_affected())
    }

    /// Links a job to the model it published.
    #[tracing::instrument(skip(self), err(level = Level::DEBUG))]
    pub async fn update_job_model_id(&self, job_id: &JobId, model_id: i64) -> Result<(), Error> {
        let rslt = self
            .execute(
                query(
                    "-- update_job_model_id()
UPDATE jobs SET model_id = $1 WHERE job_id = $2",
                )
                .bind(/* model_id */ model_id)
                .bind(/* job_id */ job_id.to_string()),
            )
            .await?;
        check_single_row_mutation(rslt.rows_affected())
    }

    /// Links a job to the model execution it drives.
    #[tracing::instrument(skip(self), err(level = Level::DEBUG))]
    pub async fn update_job_execution_id(
        &self,
        job_id: &JobId,
        execution_id: i64,
    ) -> Result<(), Error> {
        let rslt = self
            .execute(
                query(
                    "-- update_job_execution_id()
UPDATE jobs SET execution_id = $1 WHERE job_id = $2",
                )
                .bind(/* execution_id */ execution_id)
                .bind(/* job_id */ job_id.to_string()),
            )
            .await?;
        check_single_row_mutation(rslt.rows_affected())
    }

    /// Writes a training run into the datastore, returning its generated identifier.
    #[tracing::instrument(skip(self), err(level = Level::DEBUG))]
    pub async fn put_training_run(&self, training_run: &TrainingRun) -> Result<i64, Error> {
        let rslt = self
            .execute(
                query(
                    "-- put_training_run()
INSERT INTO training_runs (job_id, algorithm, dataset_key, params_key, state, metrics, model_id,
                           started_at, finished_at)
VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
                )
                .bind(/* job_id */ training_run.job_id().to_string())
                .bind(/* algorithm */ training_run.algorithm())
                .bind(/* dataset_key */ training_run.dataset_key())
                .bind(/* params_key */ training_run.params_key())
                .bind(/* state */ training_run.state().as_str())
                .bind(/* metrics */ training_run.metrics())
                .bind(/* model_id */ training_run.model_id())
                .bind(/* started_at */ training_run.started_at().copied())
                .bind(/* finished_at */ training_run.finished_at().copied()),
            )
            .await?;
        Ok(rslt.last_insert_rowid())
    }

    /// Fetch a training run by ID.
    #[tracing::instrument(skip(self), err(level = Level::DEBUG))]
    pub async fn get_training_run(&self, training_id: i64) -> Result<Option<TrainingRun>, Error> {
        self.fetch_optional(
            query(
                "-- get_training_run()
SELECT job_id, algorithm, dataset_key, params_key, state, metrics, model_id, started_at,
       finished_at
FROM training_runs WHERE id = $1",
            )
            .bind(/* id */ training_id),
        )
        .await?
        .map(|row| training_run_from_row(&row))
        .transpose()
    }

    /// Fetch the training run which produced the given model, if any. This is used to recover the
    /// training lineage of a model when retraining it.
    #[tracing::instrument(skip(self), err(level = Level::DEBUG))]
    pub async fn get_training_run_by_model(
        &self,
        model_id: i64,
    ) -> Result<Option<TrainingRun>, Error> {
        self.fetch_optional(
            query(
                "-- get_training_run_by_model()
SELECT job_id, algorithm, dataset_key, params_key, state, metrics, model_id, started_at,
       finished_at
FROM training_runs WHERE model_id = $1",
            )
            .bind(/* model_id */ model_id),
        )
        .await?
        .map(|row| training_run_from_row(&row))
        .transpose()
    }

    /// Moves a training run into the RUNNING state, recording the start time.
    #[tracing::instrument(skip(self), err(level = Level::DEBUG))]
    pub async fn mark_training_run_running(&self, training_id: i64) -> Result<(), Error> {
        let rslt = self
            .execute(
                query(
                    "-- mark_training_run_running()
UPDATE training_runs SET state = 'RUNNING', started_at = $1 WHERE id = $2",
                )
                .bind(/* started_at */ self.clock.now())
                .bind(/* id */ training_id),
            )
            .await?;
        check_single_row_mutation(rslt.rows_affected())
    }

    /// Moves a training run into the COMPLETED state, recording captured metrics and the
    /// published model.
    #[tracing::instrument(skip(self), err(level = Level::DEBUG))]
    pub async fn mark_training_run_completed(
        &self,
        training_id: i64,
        metrics: Option<&str>,
        model_id: i64,
    ) -> Result<(), Error> {
        let rslt = self
            .execute(
                query(
                    "-- mark_training_run_completed()
UPDATE training_runs SET state = 'COMPLETED', metrics = $1, model_id = $2, finished_at = $3
WHERE id = $4",
                )
                .bind(/* metrics */ metrics)
                .bind(/* model_id */ model_id)
                .bind(/* finished_at */ self.clock.now())
                .bind(/* id */ training_id),
            )
            .await?;
        check_single_row_mutation(rslt.rows_affected())
    }

    /// Moves a training run into the FAILED state.
    #[tracing::instrument(skip(self), err(level = Level::DEBUG))]
    pub async fn mark_training_run_failed(&self, training_id: i64) -> Result<(), Error> {
        let rslt = self
            .execute(
                query(
                    "-- mark_training_run_failed()
UPDATE training_runs SET state = 'FAILED', finished_at = $1 WHERE id = $2",
                )
                .bind(/* finished_at */ self.clock.now())
                .bind(/* id */ training_id),
            )
            .await?;
        check_single_row_mutation(rslt.rows_affected())
    }

    /// Writes a model into the datastore, returning its generated identifier.
    #[tracing::instrument(skip(self), err(level = Level::DEBUG))]
    pub async fn put_model(&self, model: &Model) -> Result<i64, Error> {
        let rslt = self
            .execute(
                query(
                    "-- put_model()
INSERT INTO models (name, owner, engine, artifact_key, created_at)
VALUES ($1, $2, $3, $4, $5)",
                )
                .bind(/* name */ model.name())
                .bind(/* owner */ model.owner())
                .bind(/* engine */ model.engine())
                .bind(/* artifact_key */ model.artifact_key())
                .bind(/* created_at */ *model.created_at()),
            )
            .await?;
        Ok(rslt.last_insert_rowid())
    }

    /// Fetch a model by ID.
    #[tracing::instrument(skip(self), err(level = Level::DEBUG))]
    pub async fn get_model(&self, model_id: i64) -> Result<Option<Model>, Error> {
        self.fetch_optional(
            query(
                "-- get_model()
SELECT name, owner, engine, artifact_key, created_at FROM models WHERE id = $1",
            )
            .bind(/* id */ model_id),
        )
        .await?
        .map(|row| model_from_row(&row))
        .transpose()
    }

    /// Writes a model execution into the datastore, returning its generated identifier.
    #[tracing::instrument(skip(self), err(level = Level::DEBUG))]
    pub async fn put_model_execution(
        &self,
        model_execution: &ModelExecution,
    ) -> Result<i64, Error> {
        let rslt = self
            .execute(
                query(
                    "-- put_model_execution()
INSERT INTO model_executions (job_id, model_id, dataset_key, state, result_key, started_at,
                              finished_at)
VALUES ($1, $2, $3, $4, $5, $6, $7)",
                )
                .bind(/* job_id */ model_execution.job_id().to_string())
                .bind(/* model_id */ model_execution.model_id())
                .bind(/* dataset_key */ model_execution.dataset_key())
                .bind(/* state */ model_execution.state().as_str())
                .bind(/* result_key */ model_execution.result_key())
                .bind(/* started_at */ model_execution.started_at().copied())
                .bind(/* finished_at */ model_execution.finished_at().copied()),
            )
            .await?;
        Ok(rslt.last_insert_rowid())
    }

    /// Fetch a model execution by ID.
    #[tracing::instrument(skip(self), err(level = Level::DEBUG))]
    pub async fn get_model_execution(
        &self,
        execution_id: i64,
    ) -> Result<Option<ModelExecution>, Error> {
        self.fetch_optional(
            query(
                "-- get_model_execution()
SELECT job_id, model_id, dataset_key, state, result_key, started_at, finished_at
FROM model_executions WHERE id = $1",
            )
            .bind(/* id */ execution_id),
        )
        .await?
        .map(|row| model_execution_from_row(&row))
        .transpose()
    }

    /// Moves a model execution into the COMPLETED state, recording the uploaded result.
    #[tracing::instrument(skip(self), err(level = Level::DEBUG))]
    pub async fn mark_model_execution_completed(
        &self,
        execution_id: i64,
        result_key: &str,
    ) -> Result<(), Error> {
        let rslt = self
            .execute(
                query(
                    "-- mark_model_execution_completed()
UPDATE model_executions SET state = 'COMPLETED', result_key = $1, finished_at = $2 WHERE id = $3",
                )
                .bind(/* result_key */ result_key)
                .bind(/* finished_at */ self.clock.now())
                .bind(/* id */ execution_id),
            )
            .await?;
        check_single_row_mutation(rslt.rows_affected())
    }

    /// Moves a model execution into the FAILED state.
    #[tracing::instrument(skip(self), err(level = Level::DEBUG))]
    pub async fn mark_model_execution_failed(&self, execution_id: i64) -> Result<(), Error> {
        let rslt = self
            .execute(
                query(
                    "-- mark_model_execution_failed()
UPDATE model_executions SET state = 'FAILED', finished_at = $1 WHERE id = $2",
                )
                .bind(/* finished_at */ self.clock.now())
                .bind(/* id */ execution_id),
            )
            .await?;
        check_single_row_mutation(rslt.rows_affected())
    }
}

fn job_from_row(job_id: &JobId, row: &SqliteRow) -> Result<Job, Error> {
    let kind = JobKind::try_from(row.try_get::<String, _>("kind")?.as_str())?;
    let state = JobState::try_from(row.try_get::<String, _>("state")?.as_str())?;
    Ok(Job::new(
        *job_id,
        kind,
        row.try_get("owner")?,
        row.try_get("created_at")?,
    )
    .with_state(state)
    .with_request(row.try_get("request")?)
    .with_stop_requested(row.try_get("stop_requested")?)
    .with_external_handle(row.try_get("external_handle")?)
    .with_error_message(row.try_get("error_message")?)
    .with_training_id(row.try_get("training_id")?)
    .with_model_id(row.try_get("model_id")?)
    .with_execution_id(row.try_get("execution_id")?)
    .with_started_at(row.try_get("started_at")?)
    .with_finished_at(row.try_get("finished_at")?))
}

fn training_run_from_row(row: &SqliteRow) -> Result<TrainingRun, Error> {
    let job_id = job_id_from_text(&row.try_get::<String, _>("job_id")?)?;
    let state = TrainingRunState::try_from(row.try_get::<String, _>("state")?.as_str())?;
    Ok(TrainingRun::new(
        job_id,
        row.try_get("algorithm")?,
        row.try_get("dataset_key")?,
        row.try_get("params_key")?,
    )
    .with_state(state)
    .with_metrics(row.try_get("metrics")?)
    .with_model_id(row.try_get("model_id")?)
    .with_started_at(row.try_get("started_at")?)
    .with_finished_at(row.try_get("finished_at")?))
}

fn model_from_row(row: &SqliteRow) -> Result<Model, Error> {
    Ok(Model::new(
        row.try_get("name")?,
        row.try_get("owner")?,
        row.try_get("engine")?,
        row.try_get("artifact_key")?,
        row.try_get("created_at")?,
    ))
}

fn model_execution_from_row(row: &SqliteRow) -> Result<ModelExecution, Error> {
    let job_id = job_id_from_text(&row.try_get::<String, _>("job_id")?)?;
    let state = ModelExecutionState::try_from(row.try_get::<String, _>("state")?.as_str())?;
    Ok(ModelExecution::new(
        job_id,
        row.try_get("model_id")?,
        row.try_get("dataset_key")?,
    )
    .with_state(state)
    .with_result_key(row.try_get("result_key")?)
    .with_started_at(row.try_get("started_at")?)
    .with_finished_at(row.try_get("finished_at")?))
}

fn job_id_from_text(text: &str) -> Result<JobId, Error> {
    JobId::from_str(text)
        .map_err(|err| Error::DbState(format!("invalid job ID in database: {err}")))
}

fn check_insert(row_count: u64) -> Result<(), Error> {
    match row_count {
        0 => Err(Error::MutationTargetAlreadyExists),
        1 => Ok(()),
        _ => panic!(
            "insert which should have affected at most one row instead affected {row_count} rows"
        ),
    }
}

fn check_single_row_mutation(row_count: u64) -> Result<(), Error> {
    match row_count {
        0 => Err(Error::MutationTargetNotFound),
        1 => Ok(()),
        _ => panic!(
            "update which should have affected at most one row instead affected {row_count} rows"
        ),
    }
}

/// Error represents a datastore error.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("database migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    /// An entity requested from the datastore was not found.
    #[error("not found in datastore")]
    MutationTargetNotFound,
    /// A datastore mutation was targeted at a record that already exists.
    #[error("mutation target already exists")]
    MutationTargetAlreadyExists,
    /// The database was in an unexpected state.
    #[error("inconsistent database state: {0}")]
    DbState(String),
    /// A job was asked to start from a state it cannot start from.
    #[error("job {job_id} cannot run from state {state}")]
    InvalidJobState { job_id: JobId, state: JobState },
    /// An error from the caller's transaction logic, opaque to the datastore.
    #[error("user error: {0}")]
    User(#[source] Arc<dyn std::error::Error + Send + Sync>),
    #[error("too many retries: {source:?}")]
    TooManyRetries {
        #[source]
        source: Option<Box<Error>>,
    },
}
