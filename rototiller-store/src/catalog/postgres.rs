use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rototiller_core::domain::id::{JobId, StorageId};
use rototiller_core::domain::job::{Job, JobStatus};
use rototiller_core::domain::storage::Storage;
use rototiller_core::domain::task::Task;
use sqlx::PgPool;

use super::Catalog;
use crate::error::CatalogError;
use crate::repository::{job, storage, task};

/// Catalog backed by the Postgres tables created in [`crate::db::run_migrations`]
#[derive(Clone)]
pub struct PgCatalog {
    pool: PgPool,
}

impl PgCatalog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Catalog for PgCatalog {
    async fn get_job(&self, id: &JobId) -> Result<Job, CatalogError> {
        job::find_by_id(&self.pool, id)
            .await?
            .ok_or_else(|| CatalogError::not_found("job", id))
    }

    async fn update_job(&self, job: &Job) -> Result<(), CatalogError> {
        if job::update(&self.pool, job).await? {
            Ok(())
        } else {
            Err(CatalogError::not_found("job", &job.id))
        }
    }

    async fn claim_job(
        &self,
        id: &JobId,
        from: JobStatus,
        start_time: DateTime<Utc>,
    ) -> Result<bool, CatalogError> {
        job::claim(&self.pool, id, from, start_time).await
    }

    async fn requeue_job(
        &self,
        id: &JobId,
        start_time: DateTime<Utc>,
    ) -> Result<bool, CatalogError> {
        job::requeue(&self.pool, id, start_time).await
    }

    async fn get_storage(&self, id: &StorageId) -> Result<Storage, CatalogError> {
        storage::find_by_id(&self.pool, id)
            .await?
            .ok_or_else(|| CatalogError::not_found("storage", id))
    }

    async fn update_storage(&self, entry: &Storage) -> Result<(), CatalogError> {
        if storage::update(&self.pool, entry).await? {
            Ok(())
        } else {
            Err(CatalogError::not_found("storage", &entry.id))
        }
    }

    async fn create_storage(&self, entry: &Storage) -> Result<(), CatalogError> {
        storage::create(&self.pool, entry).await
    }

    async fn get_task_by_job_id(&self, id: &JobId) -> Result<Task, CatalogError> {
        task::find_by_job_id(&self.pool, id)
            .await?
            .ok_or_else(|| CatalogError::not_found("task for job", id))
    }

    async fn get_jobs_in_progress_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Job>, CatalogError> {
        job::find_started_before(&self.pool, JobStatus::InProgress, cutoff).await
    }
}
