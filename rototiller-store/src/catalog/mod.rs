//! Catalog Gateway
//!
//! Job, storage and task records, looked up and updated by id.

mod memory;
mod postgres;

pub use memory::InMemoryCatalog;
pub use postgres::PgCatalog;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rototiller_core::domain::event::event_type;
use rototiller_core::domain::id::{JobId, StorageId};
use rototiller_core::domain::job::{Job, JobStatus};
use rototiller_core::domain::storage::Storage;
use rototiller_core::domain::task::{Task, TaskKind};

use crate::error::CatalogError;

#[async_trait]
pub trait Catalog: Send + Sync {
    async fn get_job(&self, id: &JobId) -> Result<Job, CatalogError>;

    async fn update_job(&self, job: &Job) -> Result<(), CatalogError>;

    /// Moves a job to `InProgress` if its status is still `from`
    ///
    /// Clears the error and end time and sets the start time. Returns false
    /// when the job is gone or another attempt changed it first.
    async fn claim_job(
        &self,
        id: &JobId,
        from: JobStatus,
        start_time: DateTime<Utc>,
    ) -> Result<bool, CatalogError>;

    /// Puts a job back to `Waiting` if it is still the `InProgress` run that
    /// started at `start_time`
    async fn requeue_job(
        &self,
        id: &JobId,
        start_time: DateTime<Utc>,
    ) -> Result<bool, CatalogError>;

    async fn get_storage(&self, id: &StorageId) -> Result<Storage, CatalogError>;

    async fn update_storage(&self, storage: &Storage) -> Result<(), CatalogError>;

    async fn create_storage(&self, storage: &Storage) -> Result<(), CatalogError>;

    /// Task definition named by the job's task type
    async fn get_task_by_job_id(&self, id: &JobId) -> Result<Task, CatalogError>;

    /// Jobs still `InProgress` that started before `cutoff`
    async fn get_jobs_in_progress_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Job>, CatalogError>;
}

/// Task types every catalog starts with
pub fn known_tasks() -> Vec<Task> {
    let task = |task_type: &str, params: &[&str], kind| Task {
        task_type: task_type.to_string(),
        params: params.iter().map(|p| p.to_string()).collect(),
        kind,
        routing_key: event_type::JOB_CREATED.to_string(),
    };

    vec![
        task(
            "buffer",
            &["buffer-distance", "quadrant-segment-count"],
            TaskKind::Transformation,
        ),
        task(
            "filter",
            &["filter-column", "filter-value"],
            TaskKind::Transformation,
        ),
        task("removebadgeometry", &[], TaskKind::Transformation),
        task("reproject", &["target-projection"], TaskKind::Transformation),
        task(
            "vectorlookup",
            &["attributes", "longitude", "latitude"],
            TaskKind::Lookup,
        ),
        task(
            "rasterlookup",
            &["bands", "longitude", "latitude"],
            TaskKind::Lookup,
        ),
        task(
            "polygonVectorLookup",
            &["attributes", "polygon"],
            TaskKind::Lookup,
        ),
    ]
}
