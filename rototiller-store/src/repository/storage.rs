//! Storage Repository

use chrono::{DateTime, Utc};
use rototiller_core::ParseError;
use rototiller_core::domain::id::StorageId;
use rototiller_core::domain::storage::Storage;
use sqlx::PgPool;

use crate::error::CatalogError;

/// Find a storage entry by ID
pub async fn find_by_id(pool: &PgPool, id: &StorageId) -> Result<Option<Storage>, CatalogError> {
    let row = sqlx::query_as::<_, StorageRow>(
        r#"
        SELECT id, customer_id, name, status, last_used, create_time
        FROM storage
        WHERE id = $1
        "#,
    )
    .bind(id.as_str())
    .fetch_optional(pool)
    .await?;

    row.map(Storage::try_from).transpose().map_err(Into::into)
}

/// Insert a new storage entry
pub async fn create(pool: &PgPool, storage: &Storage) -> Result<(), CatalogError> {
    sqlx::query(
        r#"
        INSERT INTO storage (id, customer_id, name, status, last_used, create_time)
        VALUES ($1, $2, $3, $4, $5, $6)
        "#,
    )
    .bind(storage.id.as_str())
    .bind(&storage.customer_id)
    .bind(&storage.name)
    .bind(storage.status.as_str())
    .bind(storage.last_used)
    .bind(storage.create_time)
    .execute(pool)
    .await?;

    Ok(())
}

/// Update name, status and last use of a storage entry
///
/// Returns false if no such entry exists.
pub async fn update(pool: &PgPool, storage: &Storage) -> Result<bool, CatalogError> {
    let result = sqlx::query(
        r#"
        UPDATE storage
        SET name = $1, status = $2, last_used = $3
        WHERE id = $4
        "#,
    )
    .bind(&storage.name)
    .bind(storage.status.as_str())
    .bind(storage.last_used)
    .bind(storage.id.as_str())
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct StorageRow {
    id: String,
    customer_id: String,
    name: String,
    status: String,
    last_used: Option<DateTime<Utc>>,
    create_time: DateTime<Utc>,
}

impl TryFrom<StorageRow> for Storage {
    type Error = ParseError;

    fn try_from(row: StorageRow) -> Result<Self, Self::Error> {
        Ok(Storage {
            id: StorageId::parse(row.id)?,
            customer_id: row.customer_id,
            name: row.name,
            status: row.status.parse()?,
            last_used: row.last_used,
            create_time: row.create_time,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rototiller_core::domain::storage::StorageStatus;

    #[test]
    fn test_row_to_storage() {
        let row = StorageRow {
            id: "in-1".to_string(),
            customer_id: "customer".to_string(),
            name: "parcels.geojson".to_string(),
            status: "Final".to_string(),
            last_used: None,
            create_time: Utc::now(),
        };

        let storage = Storage::try_from(row).unwrap();
        assert_eq!(storage.status, StorageStatus::Final);
        assert_eq!(storage.name, "parcels.geojson");
    }
}
