//! In-memory catalog
//!
//! Records every job write so tests can assert on the sequence of states a
//! job moved through. Latency and write failures can be injected to stand in
//! for a remote database.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rototiller_core::domain::id::{JobId, StorageId};
use rototiller_core::domain::job::{Job, JobStatus};
use rototiller_core::domain::storage::Storage;
use rototiller_core::domain::task::Task;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use super::{Catalog, known_tasks};
use crate::error::CatalogError;

#[derive(Clone, Default)]
pub struct InMemoryCatalog {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Default)]
struct Inner {
    jobs: HashMap<JobId, Job>,
    storage: HashMap<StorageId, Storage>,
    tasks: HashMap<String, Task>,
    job_writes: Vec<Job>,
    fail_writes: bool,
    fail_job_status: Option<JobStatus>,
    latency: Duration,
}

impl InMemoryCatalog {
    /// Catalog holding the known task definitions and nothing else
    pub fn new() -> Self {
        let catalog = Self::default();
        for task in known_tasks() {
            catalog.insert_task(task);
        }
        catalog
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn insert_job(&self, job: Job) {
        self.lock().jobs.insert(job.id.clone(), job);
    }

    pub fn insert_storage(&self, storage: Storage) {
        self.lock().storage.insert(storage.id.clone(), storage);
    }

    pub fn insert_task(&self, task: Task) {
        self.lock().tasks.insert(task.task_type.clone(), task);
    }

    pub fn job(&self, id: &JobId) -> Option<Job> {
        self.lock().jobs.get(id).cloned()
    }

    pub fn storage(&self, id: &StorageId) -> Option<Storage> {
        self.lock().storage.get(id).cloned()
    }

    pub fn storage_entries(&self) -> Vec<Storage> {
        self.lock().storage.values().cloned().collect()
    }

    /// Statuses written for a job, in write order
    pub fn job_history(&self, id: &JobId) -> Vec<JobStatus> {
        self.lock()
            .job_writes
            .iter()
            .filter(|job| &job.id == id)
            .map(|job| job.status)
            .collect()
    }

    /// Makes every write fail with a database error until reset
    pub fn fail_writes(&self, fail: bool) {
        self.lock().fail_writes = fail;
    }

    /// Makes job writes that set `status` fail with a database error until
    /// reset with `None`
    pub fn fail_job_writes_to(&self, status: Option<JobStatus>) {
        self.lock().fail_job_status = status;
    }

    /// Delays every catalog call by `latency`
    pub fn set_latency(&self, latency: Duration) {
        self.lock().latency = latency;
    }

    async fn round_trip(&self) {
        let latency = self.lock().latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }
}

impl Inner {
    fn check_writable(&self) -> Result<(), CatalogError> {
        if self.fail_writes {
            Err(CatalogError::Database(sqlx::Error::PoolTimedOut))
        } else {
            Ok(())
        }
    }

    fn check_job_writable(&self, status: JobStatus) -> Result<(), CatalogError> {
        self.check_writable()?;
        if self.fail_job_status == Some(status) {
            Err(CatalogError::Database(sqlx::Error::PoolTimedOut))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Catalog for InMemoryCatalog {
    async fn get_job(&self, id: &JobId) -> Result<Job, CatalogError> {
        self.round_trip().await;
        self.job(id)
            .ok_or_else(|| CatalogError::not_found("job", id))
    }

    async fn update_job(&self, job: &Job) -> Result<(), CatalogError> {
        self.round_trip().await;
        let mut inner = self.lock();
        inner.check_job_writable(job.status)?;
        match inner.jobs.get_mut(&job.id) {
            Some(stored) => *stored = job.clone(),
            None => return Err(CatalogError::not_found("job", &job.id)),
        }
        inner.job_writes.push(job.clone());
        Ok(())
    }

    async fn claim_job(
        &self,
        id: &JobId,
        from: JobStatus,
        start_time: DateTime<Utc>,
    ) -> Result<bool, CatalogError> {
        self.round_trip().await;
        let mut inner = self.lock();
        inner.check_job_writable(JobStatus::InProgress)?;

        let Some(stored) = inner.jobs.get_mut(id).filter(|job| job.status == from) else {
            return Ok(false);
        };
        stored.status = JobStatus::InProgress;
        stored.start_time = Some(start_time);
        stored.error = None;
        stored.end_time = None;

        let claimed = stored.clone();
        inner.job_writes.push(claimed);
        Ok(true)
    }

    async fn requeue_job(
        &self,
        id: &JobId,
        start_time: DateTime<Utc>,
    ) -> Result<bool, CatalogError> {
        self.round_trip().await;
        let mut inner = self.lock();
        inner.check_job_writable(JobStatus::Waiting)?;

        let Some(stored) = inner.jobs.get_mut(id).filter(|job| {
            job.status == JobStatus::InProgress && job.start_time == Some(start_time)
        }) else {
            return Ok(false);
        };
        stored.status = JobStatus::Waiting;
        stored.error = None;
        stored.end_time = None;

        let requeued = stored.clone();
        inner.job_writes.push(requeued);
        Ok(true)
    }

    async fn get_storage(&self, id: &StorageId) -> Result<Storage, CatalogError> {
        self.round_trip().await;
        self.storage(id)
            .ok_or_else(|| CatalogError::not_found("storage", id))
    }

    async fn update_storage(&self, storage: &Storage) -> Result<(), CatalogError> {
        self.round_trip().await;
        let mut inner = self.lock();
        inner.check_writable()?;
        match inner.storage.get_mut(&storage.id) {
            Some(stored) => {
                *stored = storage.clone();
                Ok(())
            }
            None => Err(CatalogError::not_found("storage", &storage.id)),
        }
    }

    async fn create_storage(&self, storage: &Storage) -> Result<(), CatalogError> {
        self.round_trip().await;
        let mut inner = self.lock();
        inner.check_writable()?;
        inner.storage.insert(storage.id.clone(), storage.clone());
        Ok(())
    }

    async fn get_task_by_job_id(&self, id: &JobId) -> Result<Task, CatalogError> {
        self.round_trip().await;
        let inner = self.lock();
        let job = inner
            .jobs
            .get(id)
            .ok_or_else(|| CatalogError::not_found("job", id))?;
        inner
            .tasks
            .get(&job.task_type)
            .cloned()
            .ok_or_else(|| CatalogError::not_found("task", &job.task_type))
    }

    async fn get_jobs_in_progress_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Job>, CatalogError> {
        self.round_trip().await;
        let mut jobs: Vec<Job> = self
            .lock()
            .jobs
            .values()
            .filter(|job| job.status == JobStatus::InProgress)
            .filter(|job| job.start_time.is_some_and(|t| t < cutoff))
            .cloned()
            .collect();
        jobs.sort_by_key(|job| job.start_time);
        Ok(jobs)
    }
}
