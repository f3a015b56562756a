pub use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use std::time::Duration;

use crate::catalog::known_tasks;

pub async fn create_pool(database_url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await
}

pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS storage (
            id VARCHAR(255) PRIMARY KEY,
            customer_id VARCHAR(255) NOT NULL,
            name TEXT NOT NULL DEFAULT '',
            status VARCHAR(50) NOT NULL,
            last_used TIMESTAMPTZ,
            create_time TIMESTAMPTZ NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS tasks (
            task_type VARCHAR(255) PRIMARY KEY,
            params TEXT[] NOT NULL DEFAULT '{}',
            kind VARCHAR(50) NOT NULL,
            routing_key VARCHAR(255) NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS jobs (
            id VARCHAR(255) PRIMARY KEY,
            customer_id VARCHAR(255) NOT NULL,
            task_type VARCHAR(255) NOT NULL REFERENCES tasks(task_type),
            args TEXT[] NOT NULL DEFAULT '{}',
            input_id VARCHAR(255) NOT NULL REFERENCES storage(id),
            output_id VARCHAR(255) REFERENCES storage(id),
            status VARCHAR(50) NOT NULL,
            error TEXT,
            start_time TIMESTAMPTZ,
            end_time TIMESTAMPTZ
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status, start_time)")
        .execute(pool)
        .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_storage_customer_id ON storage(customer_id)")
        .execute(pool)
        .await?;

    for task in known_tasks() {
        sqlx::query(
            r#"
            INSERT INTO tasks (task_type, params, kind, routing_key)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (task_type) DO NOTHING
            "#,
        )
        .bind(&task.task_type)
        .bind(&task.params)
        .bind(task.kind.as_str())
        .bind(&task.routing_key)
        .execute(pool)
        .await?;
    }

    tracing::info!("Catalog migrations completed successfully");
    Ok(())
}
