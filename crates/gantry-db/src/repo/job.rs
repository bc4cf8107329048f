//! Job repository.

use async_trait::async_trait;
use gantry_core::{InFlightPolicy, Job, ResourceId};
use sqlx::PgPool;

use crate::{DbError, DbResult};

/// A row of `jobs_view`.
#[derive(Debug, Clone, sqlx::FromRow)]
struct JobRecord {
    id: uuid::Uuid,
    pipeline_id: uuid::Uuid,
    team_id: uuid::Uuid,
    name: String,
    pipeline_name: String,
    team_name: String,
    paused: bool,
    pipeline_paused: bool,
    serial_groups: Vec<String>,
    in_flight: String,
}

impl TryFrom<JobRecord> for Job {
    type Error = DbError;

    fn try_from(record: JobRecord) -> DbResult<Self> {
        let in_flight: InFlightPolicy = record.in_flight.parse()?;
        Ok(Job {
            id: ResourceId::from_uuid(record.id),
            pipeline_id: ResourceId::from_uuid(record.pipeline_id),
            team_id: ResourceId::from_uuid(record.team_id),
            name: record.name,
            pipeline_name: record.pipeline_name,
            team_name: record.team_name,
            paused: record.paused,
            pipeline_paused: record.pipeline_paused,
            serial_groups: record.serial_groups,
            in_flight,
        })
    }
}

#[async_trait]
pub trait JobRepo: Send + Sync {
    /// Jobs whose own pause flag and pipeline pause flag are both clear.
    async fn schedulable_jobs(&self) -> DbResult<Vec<Job>>;
    async fn get_job(&self, team: &str, pipeline: &str, job: &str) -> DbResult<Job>;
    async fn set_job_paused(&self, job_id: ResourceId, paused: bool) -> DbResult<()>;
}

/// PostgreSQL implementation of JobRepo.
pub struct PgJobRepo {
    pool: PgPool,
}

impl PgJobRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobRepo for PgJobRepo {
    async fn schedulable_jobs(&self) -> DbResult<Vec<Job>> {
        let records = sqlx::query_as::<_, JobRecord>(
            r#"
            SELECT * FROM jobs_view
            WHERE NOT paused AND NOT pipeline_paused
            ORDER BY pipeline_id, name
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        records.into_iter().map(Job::try_from).collect()
    }

    async fn get_job(&self, team: &str, pipeline: &str, job: &str) -> DbResult<Job> {
        let record = sqlx::query_as::<_, JobRecord>(
            r#"
            SELECT * FROM jobs_view
            WHERE team_name = $1 AND pipeline_name = $2 AND name = $3
            "#,
        )
        .bind(team)
        .bind(pipeline)
        .bind(job)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| DbError::NotFound(format!("job {}/{}/{}", team, pipeline, job)))?;
        Job::try_from(record)
    }

    async fn set_job_paused(&self, job_id: ResourceId, paused: bool) -> DbResult<()> {
        let result = sqlx::query("UPDATE jobs SET paused = $2 WHERE id = $1")
            .bind(job_id.as_uuid())
            .bind(paused)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(DbError::NotFound(format!("job {}", job_id)));
        }
        Ok(())
    }
}
