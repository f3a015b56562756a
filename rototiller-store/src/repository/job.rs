//! Job Repository

use chrono::{DateTime, Utc};
use rototiller_core::ParseError;
use rototiller_core::domain::id::{JobId, StorageId};
use rototiller_core::domain::job::{Job, JobStatus};
use sqlx::PgPool;

use crate::error::CatalogError;

const JOB_COLUMNS: &str = r#"
    id, customer_id, task_type, args, input_id, output_id,
    status, error, start_time, end_time
"#;

/// Find a job by ID
pub async fn find_by_id(pool: &PgPool, id: &JobId) -> Result<Option<Job>, CatalogError> {
    let row = sqlx::query_as::<_, JobRow>(&format!(
        "SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"
    ))
    .bind(id.as_str())
    .fetch_optional(pool)
    .await?;

    row.map(Job::try_from).transpose().map_err(Into::into)
}

/// Find jobs in a status that started before a cutoff, oldest first
pub async fn find_started_before(
    pool: &PgPool,
    status: JobStatus,
    cutoff: DateTime<Utc>,
) -> Result<Vec<Job>, CatalogError> {
    let rows = sqlx::query_as::<_, JobRow>(&format!(
        r#"
        SELECT {JOB_COLUMNS} FROM jobs
        WHERE status = $1 AND start_time < $2
        ORDER BY start_time ASC
        "#
    ))
    .bind(status.as_str())
    .bind(cutoff)
    .fetch_all(pool)
    .await?;

    rows.into_iter()
        .map(|r| Job::try_from(r).map_err(Into::into))
        .collect()
}

/// Overwrite the mutable columns of a job
///
/// Returns false if no such job exists.
pub async fn update(pool: &PgPool, job: &Job) -> Result<bool, CatalogError> {
    let result = sqlx::query(
        r#"
        UPDATE jobs
        SET output_id = $1, status = $2, error = $3, start_time = $4, end_time = $5
        WHERE id = $6
        "#,
    )
    .bind(job.output_id.as_ref().map(StorageId::as_str))
    .bind(job.status.as_str())
    .bind(&job.error)
    .bind(job.start_time)
    .bind(job.end_time)
    .bind(job.id.as_str())
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Move a job to `inprogress` if its status is still `from`
///
/// Returns false if the job is missing or was changed by someone else.
pub async fn claim(
    pool: &PgPool,
    id: &JobId,
    from: JobStatus,
    start_time: DateTime<Utc>,
) -> Result<bool, CatalogError> {
    let result = sqlx::query(
        r#"
        UPDATE jobs
        SET status = $1, start_time = $2, error = NULL, end_time = NULL
        WHERE id = $3 AND status = $4
        "#,
    )
    .bind(JobStatus::InProgress.as_str())
    .bind(start_time)
    .bind(id.as_str())
    .bind(from.as_str())
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Put an `inprogress` job back to `waiting`, provided it is still the run
/// that started at `start_time`
pub async fn requeue(
    pool: &PgPool,
    id: &JobId,
    start_time: DateTime<Utc>,
) -> Result<bool, CatalogError> {
    let result = sqlx::query(
        r#"
        UPDATE jobs
        SET status = $1, error = NULL, end_time = NULL
        WHERE id = $2 AND status = $3 AND start_time = $4
        "#,
    )
    .bind(JobStatus::Waiting.as_str())
    .bind(id.as_str())
    .bind(JobStatus::InProgress.as_str())
    .bind(start_time)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct JobRow {
    id: String,
    customer_id: String,
    task_type: String,
    args: Vec<String>,
    input_id: String,
    output_id: Option<String>,
    status: String,
    error: Option<String>,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
}

impl TryFrom<JobRow> for Job {
    type Error = ParseError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        Ok(Job {
            id: JobId::parse(row.id)?,
            customer_id: row.customer_id,
            task_type: row.task_type,
            args: row.args,
            input_id: StorageId::parse(row.input_id)?,
            output_id: row.output_id.map(StorageId::parse).transpose()?,
            status: row.status.parse()?,
            error: row.error,
            start_time: row.start_time,
            end_time: row.end_time,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(status: &str) -> JobRow {
        JobRow {
            id: "job-1".to_string(),
            customer_id: "customer".to_string(),
            task_type: "buffer".to_string(),
            args: vec!["10".to_string(), "8".to_string()],
            input_id: "in-1".to_string(),
            output_id: None,
            status: status.to_string(),
            error: None,
            start_time: None,
            end_time: None,
        }
    }

    #[test]
    fn test_row_to_job() {
        let job = Job::try_from(row("inprogress")).unwrap();
        assert_eq!(job.id.as_str(), "job-1");
        assert_eq!(job.status, JobStatus::InProgress);
        assert_eq!(job.args, vec!["10", "8"]);
        assert!(job.output_id.is_none());
    }

    #[test]
    fn test_row_with_unknown_status() {
        assert_eq!(
            Job::try_from(row("paused")),
            Err(ParseError::JobStatus("paused".to_string()))
        );
    }
}
