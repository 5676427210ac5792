use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use common::EntityId;
use domain::{Entity, EntityEvent};
use event_bus::{
    Event, EventConsumer, EventId, EventSource, EventType, Shutdown, broker::CHANNEL_CAPACITY,
};
use sqlx::{PgPool, Postgres, Row, Transaction, postgres::PgRow};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::store::{ReadStore, WriteStore};
use crate::{Result, StoreError};

/// How often an idle consumer polls the outbox for new events.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

const POLL_BATCH: i64 = 100;

/// Advisory lock held by every outbox append until its transaction ends.
///
/// Appends are serialized so sequence numbers become visible in commit
/// order, which lets consumers resume strictly after the last sequence seen.
pub const OUTBOX_LOCK_KEY: i64 = 0x656e_7469_7479;

/// Runs the database migrations against `pool`.
pub async fn run_migrations(pool: &PgPool) -> std::result::Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("../../migrations").run(pool).await
}

fn row_to_entity(row: &PgRow) -> Result<Entity> {
    Ok(Entity {
        id: EntityId::new(row.try_get::<String, _>("id")?),
        user_id: row.try_get("user_id")?,
        title: row.try_get("title")?,
        body: row.try_get("body")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

/// PostgreSQL-backed write store.
///
/// Each mutation and its outbox row commit in one transaction, and the
/// outbox is served to consumers by polling in sequence order.
#[derive(Clone)]
pub struct PostgresWriteStore {
    pool: PgPool,
    poll_interval: Duration,
}

impl PostgresWriteStore {
    /// Creates a new PostgreSQL write store.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Overrides how often idle consumers poll for new events.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> Result<()> {
        run_migrations(&self.pool).await?;
        Ok(())
    }

    async fn record(tx: &mut Transaction<'_, Postgres>, event: EntityEvent) -> Result<()> {
        let event = event.to_event()?;
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(OUTBOX_LOCK_KEY)
            .execute(&mut **tx)
            .await?;

        sqlx::query(
            r#"
            INSERT INTO entity_events (event_id, event_type, body, timestamp, metadata)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(event.event_id.as_uuid())
        .bind(event.event_type.as_str())
        .bind(&event.body)
        .bind(event.timestamp)
        .bind(serde_json::to_value(&event.metadata)?)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    fn row_to_event(row: &PgRow) -> Result<Event> {
        let stored: String = row.try_get("event_type")?;
        let event_type =
            EventType::parse(&stored).ok_or(StoreError::UnknownEventType(stored))?;
        let metadata: serde_json::Value = row.try_get("metadata")?;
        let metadata: HashMap<String, String> = serde_json::from_value(metadata)?;

        Ok(Event {
            event_id: EventId::from_uuid(row.try_get::<Uuid, _>("event_id")?),
            aggregate_type: event_type.aggregate(),
            event_type,
            body: row.try_get("body")?,
            timestamp: row.try_get("timestamp")?,
            metadata,
        })
    }

    async fn fetch_after(
        pool: &PgPool,
        event_type: EventType,
        after: i64,
    ) -> Result<Vec<(i64, Result<Event>)>> {
        let rows = sqlx::query(
            r#"
            SELECT sequence, event_id, event_type, body, timestamp, metadata
            FROM entity_events
            WHERE event_type = $1 AND sequence > $2
            ORDER BY sequence ASC
            LIMIT $3
            "#,
        )
        .bind(event_type.as_str())
        .bind(after)
        .bind(POLL_BATCH)
        .fetch_all(pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<(i64, Result<Event>)> {
                Ok((row.try_get("sequence")?, Self::row_to_event(row)))
            })
            .collect()
    }
}

#[async_trait]
impl WriteStore for PostgresWriteStore {
    async fn create(&self, entity: &Entity) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO entities (id, user_id, title, body, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(entity.id.as_str())
        .bind(&entity.user_id)
        .bind(&entity.title)
        .bind(&entity.body)
        .bind(entity.created_at)
        .bind(entity.updated_at)
        .execute(&mut *tx)
        .await?;

        if inserted.rows_affected() == 0 {
            return Err(StoreError::AlreadyExists(entity.id.clone()));
        }

        Self::record(&mut tx, EntityEvent::Created(entity.clone())).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn update(&self, entity: &Entity) -> Result<Entity> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            r#"
            UPDATE entities
            SET title = $2, body = $3, updated_at = $4
            WHERE id = $1
            RETURNING id, user_id, title, body, created_at, updated_at
            "#,
        )
        .bind(entity.id.as_str())
        .bind(&entity.title)
        .bind(&entity.body)
        .bind(entity.updated_at)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| StoreError::NotFound(entity.id.clone()))?;

        let stored = row_to_entity(&row)?;
        Self::record(&mut tx, EntityEvent::Updated(stored.clone())).await?;
        tx.commit().await?;
        Ok(stored)
    }

    async fn delete(&self, id: &EntityId) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let deleted = sqlx::query("DELETE FROM entities WHERE id = $1")
            .bind(id.as_str())
            .execute(&mut *tx)
            .await?;

        if deleted.rows_affected() == 0 {
            return Err(StoreError::NotFound(id.clone()));
        }

        Self::record(&mut tx, EntityEvent::Deleted(id.clone())).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.pool.close().await;
        Ok(())
    }
}

#[async_trait]
impl EventConsumer for PostgresWriteStore {
    async fn consume(
        &self,
        group: &str,
        event_type: EventType,
        shutdown: Shutdown,
    ) -> event_bus::Result<EventSource> {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let pool = self.pool.clone();
        let poll_interval = self.poll_interval;
        let group = group.to_string();

        tokio::spawn(async move {
            let mut position = 0;
            'poll: while !shutdown.is_cancelled() {
                let batch = match Self::fetch_after(&pool, event_type, position).await {
                    Ok(batch) => batch,
                    Err(e) => {
                        tracing::warn!(%group, %event_type, error = %e, "outbox poll failed");
                        Vec::new()
                    }
                };

                let idle = batch.is_empty();
                for (sequence, event) in batch {
                    let event = match event {
                        Ok(event) => event,
                        Err(e) => {
                            tracing::warn!(
                                %group, %event_type, sequence, error = %e,
                                "skipping undecodable outbox row"
                            );
                            position = sequence;
                            continue;
                        }
                    };
                    tokio::select! {
                        biased;
                        () = shutdown.cancelled() => break 'poll,
                        sent = tx.send(event) => if sent.is_err() { break 'poll },
                    }
                    position = sequence;
                }

                if idle {
                    tokio::select! {
                        biased;
                        () = shutdown.cancelled() => break,
                        () = tokio::time::sleep(poll_interval) => {}
                    }
                }
            }
            tracing::debug!(%group, %event_type, "outbox subscription closed");
        });

        Ok(rx)
    }
}

/// PostgreSQL-backed read store.
///
/// Deleted rows are kept with `deleted = TRUE` so that replayed creates and
/// updates cannot bring them back.
#[derive(Clone)]
pub struct PostgresReadStore {
    pool: PgPool,
}

impl PostgresReadStore {
    /// Creates a new PostgreSQL read store.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> Result<()> {
        run_migrations(&self.pool).await?;
        Ok(())
    }

    async fn upsert(&self, entity: &Entity, keep_owner: bool) -> Result<()> {
        // Updates never move ownership or creation time of a known row.
        let sql = if keep_owner {
            r#"
            INSERT INTO entity_read_model (id, user_id, title, body, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (id) DO UPDATE
            SET title = EXCLUDED.title, body = EXCLUDED.body, updated_at = EXCLUDED.updated_at
            WHERE NOT entity_read_model.deleted
              AND EXCLUDED.updated_at >= entity_read_model.updated_at
            "#
        } else {
            r#"
            INSERT INTO entity_read_model (id, user_id, title, body, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (id) DO UPDATE
            SET user_id = EXCLUDED.user_id, title = EXCLUDED.title, body = EXCLUDED.body,
                created_at = EXCLUDED.created_at, updated_at = EXCLUDED.updated_at
            WHERE NOT entity_read_model.deleted
              AND EXCLUDED.updated_at >= entity_read_model.updated_at
            "#
        };

        sqlx::query(sql)
            .bind(entity.id.as_str())
            .bind(&entity.user_id)
            .bind(&entity.title)
            .bind(&entity.body)
            .bind(entity.created_at)
            .bind(entity.updated_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ReadStore for PostgresReadStore {
    async fn create(&self, entity: &Entity) -> Result<()> {
        self.upsert(entity, false).await
    }

    async fn update(&self, entity: &Entity) -> Result<()> {
        self.upsert(entity, true).await
    }

    async fn delete(&self, id: &EntityId) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO entity_read_model (id, user_id, title, body, created_at, updated_at, deleted)
            VALUES ($1, '', '', '', NOW(), NOW(), TRUE)
            ON CONFLICT (id) DO UPDATE SET deleted = TRUE
            "#,
        )
        .bind(id.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: &EntityId) -> Result<Entity> {
        let row = sqlx::query(
            r#"
            SELECT id, user_id, title, body, created_at, updated_at
            FROM entity_read_model
            WHERE id = $1 AND NOT deleted
            "#,
        )
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::NotFound(id.clone()))?;

        row_to_entity(&row)
    }

    async fn get_multiple(&self, offset: usize, limit: usize) -> Result<Vec<Entity>> {
        let rows = sqlx::query(
            r#"
            SELECT id, user_id, title, body, created_at, updated_at
            FROM entity_read_model
            WHERE NOT deleted
            ORDER BY created_at ASC, id ASC
            OFFSET $1
            LIMIT $2
            "#,
        )
        .bind(i64::try_from(offset).unwrap_or(i64::MAX))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_entity).collect()
    }

    async fn close(&self) -> Result<()> {
        self.pool.close().await;
        Ok(())
    }
}
