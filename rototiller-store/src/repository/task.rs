//! Task Repository

use rototiller_core::ParseError;
use rototiller_core::domain::id::JobId;
use rototiller_core::domain::task::Task;
use sqlx::PgPool;

use crate::error::CatalogError;

/// Find the task definition a job refers to
pub async fn find_by_job_id(pool: &PgPool, job_id: &JobId) -> Result<Option<Task>, CatalogError> {
    let row = sqlx::query_as::<_, TaskRow>(
        r#"
        SELECT t.task_type, t.params, t.kind, t.routing_key
        FROM tasks t
        JOIN jobs j ON j.task_type = t.task_type
        WHERE j.id = $1
        "#,
    )
    .bind(job_id.as_str())
    .fetch_optional(pool)
    .await?;

    row.map(Task::try_from).transpose().map_err(Into::into)
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct TaskRow {
    task_type: String,
    params: Vec<String>,
    kind: String,
    routing_key: String,
}

impl TryFrom<TaskRow> for Task {
    type Error = ParseError;

    fn try_from(row: TaskRow) -> Result<Self, Self::Error> {
        Ok(Task {
            task_type: row.task_type,
            params: row.params,
            kind: row.kind.parse()?,
            routing_key: row.routing_key,
        })
    }
}
