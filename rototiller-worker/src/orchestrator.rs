//! Job orchestrator
//!
//! Consumes `job.created` events and runs one job per event under the
//! worker pool's bound. The per-job procedure has three steps:
//!
//! - `claim` checks the input precondition and moves the job to
//!   `InProgress` with a compare-and-set, so concurrent deliveries of one
//!   job run it at most once
//! - `execute` walks the claimed job from staging to the upload of its
//!   output, stopping at the first failure
//! - `finalize` always runs afterwards: it persists the final job and
//!   storage state, releases the working directory, emits `job.completed`
//!   and decides how the delivery is settled
//!
//! Every catalog write happens after the task program exits, and the job
//! row is written last. A crash before that leaves the job `InProgress`,
//! which the reaper later requeues.

use chrono::Utc;
use rototiller_bus::{BusError, EventBus};
use rototiller_core::domain::event::{Event, event_type};
use rototiller_core::domain::id::JobId;
use rototiller_core::domain::job::{Job, JobStatus};
use rototiller_core::domain::storage::{Storage, StorageStatus};
use rototiller_store::{BlobStore, Catalog};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::error::JobFailure;
use crate::pool::WorkerPool;
use crate::runner::{RunOutcome, TaskRunner};
use crate::volume::WorkDir;

/// How a delivery is settled once its job is done
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    /// Nack and redeliver
    Requeue,
    /// Nack without redelivery
    Drop,
}

/// Collaborators shared by every job
struct Shared {
    bus: Arc<dyn EventBus>,
    catalog: Arc<dyn Catalog>,
    blobs: Arc<dyn BlobStore>,
    workdir: WorkDir,
    runner: TaskRunner,
}

#[derive(Clone)]
pub struct Orchestrator {
    shared: Arc<Shared>,
    pool: WorkerPool,
}

/// What one job attempt got through, handed from `execute` to `finalize`
struct Attempt {
    job: Job,
    /// Input storage that passed the precondition check
    input: Option<Storage>,
    /// The working directory may exist
    staged: bool,
    outcome: Option<RunOutcome>,
    /// Output storage created for this attempt
    output: Option<Storage>,
}

impl Orchestrator {
    pub fn new(
        bus: Arc<dyn EventBus>,
        catalog: Arc<dyn Catalog>,
        blobs: Arc<dyn BlobStore>,
        workdir: WorkDir,
        runner: TaskRunner,
        pool: WorkerPool,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                bus,
                catalog,
                blobs,
                workdir,
                runner,
            }),
            pool,
        }
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Consumes `job.created` until `shutdown` resolves or the bus fails
    ///
    /// On return no job is running. Deliveries received but not dispatched
    /// are left unsettled for the bus to redeliver.
    pub async fn run<S>(&self, consumer_id: &str, shutdown: S) -> Result<(), BusError>
    where
        S: Future<Output = ()>,
    {
        let bus = &self.shared.bus;
        let consumer = bus
            .new_consumer(consumer_id, &[event_type::JOB_CREATED])
            .await?;
        let mut subscription = bus.listen(&consumer);

        info!(
            queue = %consumer.queue,
            capacity = self.pool.capacity(),
            "Consuming job events"
        );

        tokio::pin!(shutdown);

        let result = loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested, no longer taking events");
                    break Ok(());
                }
                Some(err) = subscription.errors.recv() => {
                    error!("Event bus failed: {}", err);
                    break Err(err);
                }
                received = subscription.events.recv() => {
                    let Some(event) = received else {
                        break Err(BusError::Unavailable("event listener stopped".to_string()));
                    };

                    let Some(job_id) = self.accept(&event).await else {
                        continue;
                    };

                    let slot = tokio::select! {
                        _ = &mut shutdown => {
                            info!("Shutdown requested, no longer taking events");
                            break Ok(());
                        }
                        slot = self.pool.acquire() => slot,
                    };

                    let this = self.clone();
                    self.pool.spawn(slot, async move {
                        this.handle(job_id, event).await;
                    });
                }
            }
        };

        drop(subscription);

        info!(in_flight = self.pool.in_flight(), "Waiting for running jobs");
        self.pool.wait_idle().await;
        info!("All jobs finished");

        result
    }

    /// Extracts the job id, dropping events that do not carry a valid one
    async fn accept(&self, event: &Event) -> Option<JobId> {
        match event.job_id() {
            Ok(job_id) => Some(job_id),
            Err(e) => {
                warn!(event = %event.event_type, "Dropping malformed event: {}", e);
                self.settle(event, Disposition::Drop).await;
                None
            }
        }
    }

    /// Processes one delivery end to end and settles it
    pub async fn handle(&self, job_id: JobId, event: Event) -> Disposition {
        let disposition = self.process(&job_id, &event).await;
        self.settle(&event, disposition).await;
        disposition
    }

    async fn settle(&self, event: &Event, disposition: Disposition) {
        let bus = &self.shared.bus;
        let settled = match disposition {
            Disposition::Ack => bus.ack(event).await,
            Disposition::Requeue => bus.nack(event, true).await,
            Disposition::Drop => bus.nack(event, false).await,
        };

        if let Err(e) = settled {
            error!(?disposition, "Failed to settle delivery: {}", e);
        }
    }

    async fn process(&self, job_id: &JobId, event: &Event) -> Disposition {
        let catalog = &self.shared.catalog;

        let job = match catalog.get_job(job_id).await {
            Ok(job) => job,
            Err(e) if e.is_not_found() => {
                warn!(job_id = %job_id, "Job does not exist, dropping event");
                return Disposition::Drop;
            }
            Err(e) => {
                error!(job_id = %job_id, "Failed to fetch job: {}", e);
                return Disposition::Requeue;
            }
        };

        if job.status.is_claimed() {
            info!(job_id = %job_id, status = %job.status, "Job already claimed, skipping");
            return Disposition::Ack;
        }

        let mut attempt = Attempt {
            job,
            input: None,
            staged: false,
            outcome: None,
            output: None,
        };

        let result = match self.claim(&mut attempt).await {
            Ok(true) => self.execute(&mut attempt).await,
            Ok(false) => {
                info!(job_id = %job_id, "Job claimed by another delivery, skipping");
                return Disposition::Ack;
            }
            Err(failure) => Err(failure),
        };
        self.finalize(attempt, result, event).await
    }

    /// Checks the input and moves the job to `InProgress`
    ///
    /// `Ok(false)` means the job changed since it was read, so another
    /// delivery owns it.
    async fn claim(&self, attempt: &mut Attempt) -> Result<bool, JobFailure> {
        let catalog = &self.shared.catalog;

        let input = catalog.get_storage(&attempt.job.input_id).await?;
        if !input.status.accepts_input() {
            return Err(JobFailure::InputNotUsable(input.status));
        }
        attempt.input = Some(input);

        let job = &mut attempt.job;
        let start_time = Utc::now();
        if !catalog.claim_job(&job.id, job.status, start_time).await? {
            return Ok(false);
        }

        transition(job, JobStatus::InProgress);
        job.start_time = Some(start_time);
        job.end_time = None;
        job.error = None;
        Ok(true)
    }

    async fn execute(&self, attempt: &mut Attempt) -> Result<(), JobFailure> {
        let Shared {
            catalog,
            blobs,
            workdir,
            runner,
            ..
        } = &*self.shared;
        let job_id = attempt.job.id.clone();

        attempt.staged = true;
        debug!(job_id = %job_id, "Staging input");
        let volume = blobs.get_object(&attempt.job.input_id).await?;
        let input_file = workdir.materialize_input(&job_id, volume).await?;
        let output_dir = workdir.prepare_output(&job_id).await?;
        let task = catalog.get_task_by_job_id(&job_id).await?;

        let outcome = runner
            .run(&attempt.job, &task, &input_file, &output_dir)
            .await?;
        attempt.outcome = Some(outcome.clone());

        if !outcome.succeeded() {
            let message = outcome
                .error()
                .unwrap_or_else(|| "unknown error".to_string());
            return Err(JobFailure::Task(message));
        }

        let output = Storage::new(attempt.job.customer_id.clone(), task.output_status());
        catalog.create_storage(&output).await?;
        let output_id = output.id.clone();
        attempt.output = Some(output);

        let volume = workdir.collect_output(&job_id).await?;
        debug!(
            job_id = %job_id,
            files = volume.len(),
            bytes = volume.total_size(),
            "Uploading output"
        );
        blobs.put_object(&output_id, volume).await?;
        attempt.job.output_id = Some(output_id);

        Ok(())
    }

    async fn finalize(
        &self,
        attempt: Attempt,
        result: Result<(), JobFailure>,
        event: &Event,
    ) -> Disposition {
        let Shared {
            bus,
            catalog,
            workdir,
            ..
        } = &*self.shared;
        let Attempt {
            mut job,
            input,
            staged,
            outcome,
            output,
        } = attempt;

        let mut transient = match &result {
            Ok(()) => false,
            Err(failure) => failure.is_transient(),
        };

        // Output storage whose upload never completed
        if let Some(mut orphan) = output.filter(|_| job.output_id.is_none()) {
            orphan.status = StorageStatus::Unusable;
            if let Err(e) = catalog.update_storage(&orphan).await {
                warn!(job_id = %job.id, storage = %orphan.id, "Failed to retire output storage: {}", e);
            }
        }

        if let (Some(mut input), Some(status)) =
            (input, outcome.as_ref().and_then(RunOutcome::input_status))
        {
            input.status = status;
            input.last_used = Some(Utc::now());
            if let Err(e) = catalog.update_storage(&input).await {
                error!(job_id = %job.id, storage = %input.id, "Failed to update input storage: {}", e);
                transient = true;
            }
        }

        match &result {
            Ok(()) => {
                transition(&mut job, JobStatus::Complete);
                job.error = None;
            }
            Err(failure) => {
                transition(&mut job, JobStatus::Error);
                job.error = Some(failure.to_string());
            }
        }
        job.end_time = Some(Utc::now());

        if let Err(e) = catalog.update_job(&job).await {
            error!(job_id = %job.id, "Failed to record job result: {}", e);
            transient |= !e.is_not_found();
        }

        match &result {
            Ok(()) => info!(job_id = %job.id, "Job complete"),
            Err(failure) if transient => {
                error!(job_id = %job.id, "Job failed, will retry: {}", failure)
            }
            Err(failure) => warn!(job_id = %job.id, "Job failed: {}", failure),
        }

        if staged {
            if let Err(e) = workdir.release(&job.id).await {
                warn!(job_id = %job.id, "Failed to release working directory: {}", e);
            }
        }

        if let Err(e) = bus.emit(&event.relabel(event_type::JOB_COMPLETED)).await {
            error!(job_id = %job.id, "Failed to emit completion: {}", e);
        }

        if transient {
            Disposition::Requeue
        } else {
            Disposition::Ack
        }
    }
}

fn transition(job: &mut Job, next: JobStatus) {
    if !job.status.can_transition_to(next) {
        warn!(job_id = %job.id, from = %job.status, to = %next, "Unexpected job transition");
    }
    job.status = next;
}
