//! Postgres-backed event bus
//!
//! Exchange bindings and queued messages are rows. A delivery is a message
//! row locked until `locked_until`; its id is the delivery tag. While a
//! delivery is unsettled its lock is renewed in the background, so a job
//! running longer than the visibility timeout is not redelivered. Once the
//! process dies renewal stops and the lock runs out.

use async_trait::async_trait;
use rototiller_core::domain::event::{DeliveryTag, Event};
use serde_json::Value as JsonValue;
use sqlx::PgPool;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::config::BusConfig;
use crate::error::{BusError, Result};
use crate::{Consumer, EventBus, Subscription, delivery_tag, routing};

#[derive(Clone)]
pub struct PgEventBus {
    pool: PgPool,
    config: BusConfig,
    leases: Leases,
}

/// Deliveries handed out by this process and not yet settled
#[derive(Clone, Default)]
struct Leases {
    held: Arc<Mutex<BTreeSet<DeliveryTag>>>,
}

impl Leases {
    fn lock(held: &Mutex<BTreeSet<DeliveryTag>>) -> MutexGuard<'_, BTreeSet<DeliveryTag>> {
        held.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn hold(&self, tag: DeliveryTag) {
        Self::lock(&self.held).insert(tag);
    }

    fn release(&self, tag: DeliveryTag) {
        Self::lock(&self.held).remove(&tag);
    }

    fn tags(held: &Mutex<BTreeSet<DeliveryTag>>) -> Vec<i64> {
        Self::lock(held).iter().map(|tag| *tag as i64).collect()
    }
}

/// How often held locks are extended; several times per visibility timeout
fn renewal_interval(visibility_timeout: Duration) -> Duration {
    (visibility_timeout / 3).max(Duration::from_millis(100))
}

impl PgEventBus {
    /// Creates the bus and ensures its tables exist
    ///
    /// Spawns the lease renewal task, which stops once every clone of the
    /// bus is dropped.
    pub async fn connect(pool: PgPool, config: BusConfig) -> Result<Self> {
        config.validate()?;
        ensure_schema(&pool).await.map_err(|source| BusError::Declare {
            queue: config.exchange.clone(),
            source,
        })?;

        let leases = Leases::default();
        tokio::spawn(renew_leases(
            pool.clone(),
            Arc::downgrade(&leases.held),
            config.visibility_timeout,
        ));

        Ok(Self {
            pool,
            config,
            leases,
        })
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }
}

pub async fn ensure_schema(pool: &PgPool) -> std::result::Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS bus_bindings (
            exchange TEXT NOT NULL,
            queue TEXT NOT NULL,
            pattern TEXT NOT NULL,
            PRIMARY KEY (exchange, queue, pattern)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS bus_messages (
            id BIGSERIAL PRIMARY KEY,
            queue TEXT NOT NULL,
            event_type TEXT NOT NULL,
            metadata JSONB NOT NULL DEFAULT '{}',
            published_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            locked_until TIMESTAMPTZ,
            delivery_count INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_bus_messages_queue ON bus_messages(queue, id)")
        .execute(pool)
        .await?;

    Ok(())
}

#[async_trait]
impl EventBus for PgEventBus {
    async fn emit(&self, event: &Event) -> Result<()> {
        let metadata = serde_json::to_value(&event.metadata)?;
        let publish = |source| BusError::Publish {
            event_type: event.event_type.clone(),
            source,
        };

        let mut tx = self.pool.begin().await.map_err(publish)?;

        let bindings: Vec<(String, String)> =
            sqlx::query_as("SELECT queue, pattern FROM bus_bindings WHERE exchange = $1")
                .bind(&self.config.exchange)
                .fetch_all(&mut *tx)
                .await
                .map_err(publish)?;

        let queues: BTreeSet<String> = bindings
            .into_iter()
            .filter(|(_, pattern)| routing::matches(pattern, &event.event_type))
            .map(|(queue, _)| queue)
            .collect();

        if queues.is_empty() {
            debug!(
                event_type = %event.event_type,
                exchange = %self.config.exchange,
                "No queue bound for event, dropping"
            );
        }

        for queue in &queues {
            sqlx::query(
                r#"
                INSERT INTO bus_messages (queue, event_type, metadata)
                VALUES ($1, $2, $3)
                "#,
            )
            .bind(queue)
            .bind(&event.event_type)
            .bind(&metadata)
            .execute(&mut *tx)
            .await
            .map_err(publish)?;
        }

        tx.commit().await.map_err(publish)?;

        debug!(
            event_type = %event.event_type,
            queues = queues.len(),
            "Published event"
        );
        Ok(())
    }

    async fn new_consumer(&self, consumer_id: &str, patterns: &[&str]) -> Result<Consumer> {
        for pattern in patterns {
            routing::validate_pattern(pattern)?;
        }

        let queue = self.config.queue_name(consumer_id);

        for pattern in patterns {
            sqlx::query(
                r#"
                INSERT INTO bus_bindings (exchange, queue, pattern)
                VALUES ($1, $2, $3)
                ON CONFLICT DO NOTHING
                "#,
            )
            .bind(&self.config.exchange)
            .bind(&queue)
            .bind(pattern)
            .execute(&self.pool)
            .await
            .map_err(|source| BusError::Declare {
                queue: queue.clone(),
                source,
            })?;
        }

        debug!(queue = %queue, ?patterns, "Declared consumer queue");

        Ok(Consumer {
            id: consumer_id.to_string(),
            queue,
            patterns: patterns.iter().map(|p| p.to_string()).collect(),
        })
    }

    fn listen(&self, consumer: &Consumer) -> Subscription {
        let (event_tx, events) = mpsc::channel(1);
        let (error_tx, errors) = mpsc::channel(1);
        let pool = self.pool.clone();
        let config = self.config.clone();
        let leases = self.leases.clone();
        let queue = consumer.queue.clone();

        tokio::spawn(async move {
            loop {
                if event_tx.is_closed() {
                    break;
                }

                match claim_next(&pool, &queue, config.visibility_timeout).await {
                    Ok(Some(event)) => {
                        if let Some(tag) = event.delivery_tag {
                            leases.hold(tag);
                        }
                        if let Err(unsent) = event_tx.send(event).await {
                            // Listener gone; make the claimed message visible again
                            if let Some(tag) = unsent.0.delivery_tag {
                                leases.release(tag);
                                if let Err(e) = unlock(&pool, tag).await {
                                    warn!(tag, "Failed to release undelivered message: {}", e);
                                }
                            }
                            break;
                        }
                    }
                    Ok(None) => {
                        tokio::select! {
                            _ = tokio::time::sleep(config.poll_interval) => {}
                            _ = event_tx.closed() => break,
                        }
                    }
                    Err(source) => {
                        error!(queue = %queue, "Consuming failed: {}", source);
                        let _ = error_tx
                            .send(BusError::Consume {
                                queue: queue.clone(),
                                source,
                            })
                            .await;
                        break;
                    }
                }
            }

            debug!(queue = %queue, "Listener stopped");
        });

        Subscription { events, errors }
    }

    async fn ack(&self, event: &Event) -> Result<()> {
        let tag = delivery_tag(event)?;
        self.leases.release(tag);
        delete(&self.pool, tag).await
    }

    async fn nack(&self, event: &Event, requeue: bool) -> Result<()> {
        let tag = delivery_tag(event)?;
        self.leases.release(tag);
        if !requeue {
            return delete(&self.pool, tag).await;
        }

        let unlocked = unlock(&self.pool, tag)
            .await
            .map_err(|source| BusError::Settle { tag, source })?;
        if !unlocked {
            warn!(
                tag,
                event = %event.event_type,
                "Requeue lost, delivery was already settled elsewhere"
            );
        }
        Ok(())
    }
}

/// Claims the oldest visible message of a queue
async fn claim_next(
    pool: &PgPool,
    queue: &str,
    visibility_timeout: Duration,
) -> std::result::Result<Option<Event>, sqlx::Error> {
    let row = sqlx::query_as::<_, MessageRow>(
        r#"
        UPDATE bus_messages
        SET locked_until = now() + make_interval(secs => $2),
            delivery_count = delivery_count + 1
        WHERE id = (
            SELECT id FROM bus_messages
            WHERE queue = $1 AND (locked_until IS NULL OR locked_until < now())
            ORDER BY id
            LIMIT 1
            FOR UPDATE SKIP LOCKED
        )
        RETURNING id, event_type, metadata, delivery_count
        "#,
    )
    .bind(queue)
    .bind(visibility_timeout.as_secs_f64())
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|r| {
        if r.delivery_count > 1 {
            debug!(tag = r.id, count = r.delivery_count, "Redelivering message");
        }
        r.into()
    }))
}

/// Makes a message visible again; false if it no longer exists
async fn unlock(pool: &PgPool, tag: u64) -> std::result::Result<bool, sqlx::Error> {
    let result = sqlx::query("UPDATE bus_messages SET locked_until = NULL WHERE id = $1")
        .bind(tag as i64)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// Extends the lock of every held delivery until the bus is dropped
async fn renew_leases(
    pool: PgPool,
    held: Weak<Mutex<BTreeSet<DeliveryTag>>>,
    visibility_timeout: Duration,
) {
    let every = renewal_interval(visibility_timeout);

    loop {
        tokio::time::sleep(every).await;

        let Some(strong) = held.upgrade() else {
            break;
        };
        let tags = Leases::tags(&strong);
        drop(strong);
        if tags.is_empty() {
            continue;
        }

        let renewed = sqlx::query(
            r#"
            UPDATE bus_messages
            SET locked_until = now() + make_interval(secs => $1)
            WHERE id = ANY($2)
            "#,
        )
        .bind(visibility_timeout.as_secs_f64())
        .bind(&tags)
        .execute(&pool)
        .await;

        match renewed {
            Ok(result) => debug!(
                held = tags.len(),
                renewed = result.rows_affected(),
                "Renewed delivery leases"
            ),
            Err(e) => warn!("Failed to renew delivery leases: {}", e),
        }
    }

    debug!("Lease renewal stopped");
}

async fn delete(pool: &PgPool, tag: u64) -> Result<()> {
    let result = sqlx::query("DELETE FROM bus_messages WHERE id = $1")
        .bind(tag as i64)
        .execute(pool)
        .await
        .map_err(|source| BusError::Settle { tag, source })?;

    if result.rows_affected() == 0 {
        debug!(tag, "Delivery already settled");
    }
    Ok(())
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct MessageRow {
    id: i64,
    event_type: String,
    metadata: JsonValue,
    delivery_count: i32,
}

impl From<MessageRow> for Event {
    fn from(row: MessageRow) -> Self {
        Event {
            event_type: row.event_type,
            metadata: metadata_from_json(row.metadata),
            delivery_tag: Some(row.id as u64),
        }
    }
}

/// Keeps the string-valued entries of a stored metadata object
fn metadata_from_json(value: JsonValue) -> HashMap<String, String> {
    match value {
        JsonValue::Object(map) => map
            .into_iter()
            .filter_map(|(key, value)| match value {
                JsonValue::String(s) => Some((key, s)),
                _ => None,
            })
            .collect(),
        _ => HashMap::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_to_event() {
        let row = MessageRow {
            id: 17,
            event_type: "job.created".to_string(),
            metadata: serde_json::json!({"id": "job-1"}),
            delivery_count: 1,
        };

        let event: Event = row.into();
        assert_eq!(event.event_type, "job.created");
        assert_eq!(event.delivery_tag, Some(17));
        assert_eq!(event.metadata.get("id").map(String::as_str), Some("job-1"));
    }

    #[test]
    fn test_metadata_drops_non_string_values() {
        let metadata = metadata_from_json(serde_json::json!({"id": "job-1", "n": 3}));
        assert_eq!(metadata.len(), 1);

        assert!(metadata_from_json(serde_json::json!(["id"])).is_empty());
    }

    #[test]
    fn test_leases_track_unsettled_deliveries() {
        let leases = Leases::default();
        leases.hold(3);
        leases.hold(7);
        leases.hold(3);
        assert_eq!(Leases::tags(&leases.held), vec![3, 7]);

        leases.release(3);
        leases.release(42);
        assert_eq!(Leases::tags(&leases.held), vec![7]);
    }

    #[test]
    fn test_leases_outlived_by_renewal_handle() {
        let leases = Leases::default();
        let handle = Arc::downgrade(&leases.held);
        assert!(handle.upgrade().is_some());

        let clone = leases.clone();
        drop(leases);
        assert!(handle.upgrade().is_some());
        drop(clone);
        assert!(handle.upgrade().is_none());
    }

    #[test]
    fn test_renewal_interval() {
        assert_eq!(
            renewal_interval(Duration::from_secs(30 * 60)),
            Duration::from_secs(10 * 60)
        );
        // Renewal always runs well inside the timeout
        assert!(renewal_interval(Duration::from_secs(3)) < Duration::from_secs(3));
        assert_eq!(
            renewal_interval(Duration::from_millis(1)),
            Duration::from_millis(100)
        );
    }
}
