//! Build event repository.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gantry_core::{BuildEvent, BuildId, EventPayload};
use sqlx::PgPool;
use sqlx::types::Json;

use crate::{DbError, DbResult};

/// An event record from the database.
#[derive(Debug, Clone, sqlx::FromRow)]
struct EventRecord {
    build_id: i64,
    event_id: i64,
    payload: Json<EventPayload>,
    created_at: DateTime<Utc>,
}

impl From<EventRecord> for BuildEvent {
    fn from(record: EventRecord) -> Self {
        BuildEvent {
            build_id: BuildId::new(record.build_id),
            event_id: record.event_id as u64,
            time: record.created_at,
            payload: record.payload.0,
        }
    }
}

#[async_trait]
pub trait EventRepo: Send + Sync {
    /// Append an event, allocating the build's next event id.
    async fn append_event(&self, build_id: BuildId, payload: EventPayload)
    -> DbResult<BuildEvent>;

    /// Events with an id greater than `after` (all events for `None`), in order.
    async fn events_since(&self, build_id: BuildId, after: Option<u64>)
    -> DbResult<Vec<BuildEvent>>;
}

/// PostgreSQL implementation of EventRepo.
pub struct PgEventRepo {
    pool: PgPool,
}

impl PgEventRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EventRepo for PgEventRepo {
    async fn append_event(
        &self,
        build_id: BuildId,
        payload: EventPayload,
    ) -> DbResult<BuildEvent> {
        // The row lock taken on builds serializes appenders, keeping ids gap-free.
        let record = sqlx::query_as::<_, EventRecord>(
            r#"
            WITH seq AS (
                UPDATE builds SET next_event_id = next_event_id + 1
                WHERE id = $1
                RETURNING next_event_id - 1 AS event_id
            )
            INSERT INTO build_events (build_id, event_id, payload, created_at)
            SELECT $1, seq.event_id, $2, NOW() FROM seq
            RETURNING build_id, event_id, payload, created_at
            "#,
        )
        .bind(build_id.get())
        .bind(Json(&payload))
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| DbError::NotFound(format!("build {}", build_id)))?;
        Ok(record.into())
    }

    async fn events_since(
        &self,
        build_id: BuildId,
        after: Option<u64>,
    ) -> DbResult<Vec<BuildEvent>> {
        let after = after.map(|id| id as i64).unwrap_or(-1);
        let records = sqlx::query_as::<_, EventRecord>(
            r#"
            SELECT build_id, event_id, payload, created_at
            FROM build_events
            WHERE build_id = $1 AND event_id > $2
            ORDER BY event_id ASC
            "#,
        )
        .bind(build_id.get())
        .bind(after)
        .fetch_all(&self.pool)
        .await?;
        Ok(records.into_iter().map(BuildEvent::from).collect())
    }
}
