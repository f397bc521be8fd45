//! Discovery and execution of enqueued jobs.
//!
//! [`PendingJobDriver`] is the resident half of the orchestrator: it periodically scans for
//! PENDING jobs, claims them with a guarded state transition so that concurrent drivers never
//! run the same job twice, rebuilds each job's pipeline from its recorded request, and runs the
//! orchestrations under a concurrency limit. On shutdown it stops claiming new jobs and waits
//! for the running orchestrations to finish.

use crate::orchestrator::{Components, Error, run_job, submitter::build_pipeline};
use std::{sync::Arc, time::Duration};
use stopper::Stopper;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};
use trainyard_core::{Runtime, time::Clock};

pub struct PendingJobDriver<C: Clock, R: Runtime> {
    components: Arc<Components<C>>,
    runtime: R,
    discovery_interval: Duration,
    max_concurrent_jobs: usize,
    stopper: Stopper,
}

impl<C: Clock + 'static, R: Runtime> PendingJobDriver<C, R> {
    pub fn new(
        components: Arc<Components<C>>,
        runtime: R,
        discovery_interval: Duration,
        max_concurrent_jobs: usize,
        stopper: Stopper,
    ) -> Self {
        Self {
            components,
            runtime,
            discovery_interval,
            max_concurrent_jobs,
            stopper,
        }
    }

    /// Runs the discovery loop until the stopper fires, then drains running orchestrations.
    pub async fn run(self) {
        info!(
            max_concurrent_jobs = self.max_concurrent_jobs,
            "starting job discovery loop"
        );
        let semaphore = Arc::new(Semaphore::new(self.max_concurrent_jobs));
        loop {
            let available = semaphore.available_permits();
            if available > 0 {
                match self.scan(&semaphore, available).await {
                    // Something was started; scan again right away, there may be more.
                    Ok(started) if started > 0 => continue,
                    Ok(_) => {}
                    Err(err) => error!(%err, "job discovery failed"),
                }
            }
            if self
                .stopper
                .stop_future(tokio::time::sleep(self.discovery_interval))
                .await
                .is_none()
            {
                break;
            }
        }

        info!("waiting for running orchestrations to finish");
        let _ = semaphore
            .acquire_many(self.max_concurrent_jobs as u32)
            .await;
    }

    /// Scans for PENDING jobs and starts up to `limit` of them. Returns the number started.
    async fn scan(&self, semaphore: &Arc<Semaphore>, limit: usize) -> Result<usize, Error> {
        let batch = limit as i64;
        let pending = self
            .components
            .datastore()
            .run_tx("discover pending jobs", move |tx| {
                Box::pin(async move { tx.get_pending_jobs(batch).await })
            })
            .await?;

        let mut started = 0;
        for job in pending {
            let Ok(permit) = Arc::clone(semaphore).try_acquire_owned() else {
                break;
            };
            let job_id = *job.id();
            let acquired = self
                .components
                .datastore()
                .run_tx("acquire pending job", move |tx| {
                    Box::pin(async move { tx.try_acquire_job(&job_id).await })
                })
                .await?;
            if !acquired {
                // Another process claimed the job between the scan and the acquisition.
                continue;
            }

            let pipeline = match build_pipeline(&job) {
                Ok(pipeline) => pipeline,
                Err(err) => {
                    // The job is already claimed, so it must reach a terminal state here.
                    warn!(%job_id, %err, "couldn't rebuild pipeline for acquired job");
                    if let Err(err) = self
                        .components
                        .mark_job_failed(&job_id, &err.message_for_job())
                        .await
                    {
                        error!(%job_id, %err, "couldn't mark unrunnable job failed");
                    }
                    continue;
                }
            };

            info!(%job_id, "starting orchestration for acquired job");
            let components = Arc::clone(&self.components);
            self.runtime.spawn(async move {
                let _permit = permit;
                run_job(components.as_ref(), pipeline.as_ref()).await;
            });
            started += 1;
        }
        Ok(started)
    }
}
