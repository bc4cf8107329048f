//! Build repository.
//!
//! Every status change is a single conditional `UPDATE` guarded by the
//! statuses the build may legally be in. Nodes race on the same rows, so
//! a transition is never computed from a previously read status.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gantry_core::{Build, BuildId, BuildStatus, ResourceId};
use sqlx::PgPool;

use crate::{DbError, DbResult};

/// A row of `builds_view`.
#[derive(Debug, Clone, sqlx::FromRow)]
struct BuildRecord {
    id: i64,
    name: String,
    job_id: uuid::Uuid,
    job_name: String,
    pipeline_id: uuid::Uuid,
    pipeline_name: String,
    team_id: uuid::Uuid,
    team_name: String,
    status: String,
    public: bool,
    owner_url: Option<String>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

impl TryFrom<BuildRecord> for Build {
    type Error = DbError;

    fn try_from(record: BuildRecord) -> DbResult<Self> {
        let status: BuildStatus = record.status.parse()?;
        Ok(Build {
            id: BuildId::new(record.id),
            name: record.name,
            job_id: ResourceId::from_uuid(record.job_id),
            job_name: record.job_name,
            pipeline_id: ResourceId::from_uuid(record.pipeline_id),
            pipeline_name: record.pipeline_name,
            team_id: ResourceId::from_uuid(record.team_id),
            team_name: record.team_name,
            status,
            public: record.public,
            owner_url: record.owner_url,
            created_at: record.created_at,
            started_at: record.started_at,
            finished_at: record.finished_at,
        })
    }
}

#[async_trait]
pub trait BuildRepo: Send + Sync {
    /// Create a pending build for a job.
    async fn create_build(&self, job_id: ResourceId) -> DbResult<Build>;

    async fn get_build(&self, id: BuildId) -> DbResult<Build>;

    /// Builds of a job, newest first.
    async fn list_builds(&self, job_id: ResourceId, limit: i64) -> DbResult<Vec<Build>>;

    /// Started or running builds of any job in the given serial groups.
    async fn running_builds_in_serial_groups(
        &self,
        pipeline_id: ResourceId,
        groups: &[String],
    ) -> DbResult<Vec<Build>>;

    /// The oldest pending build of any unpaused job in the given serial
    /// groups, regardless of which of those jobs it belongs to.
    async fn next_pending_build_in_serial_groups(
        &self,
        pipeline_id: ResourceId,
        groups: &[String],
    ) -> DbResult<Option<Build>>;

    /// Pending builds of a single job, oldest first.
    async fn pending_builds(&self, job_id: ResourceId) -> DbResult<Vec<Build>>;

    /// Move a build from pending to started and record its owner.
    ///
    /// Returns `None` when the build was no longer pending.
    async fn start_build(&self, id: BuildId, owner_url: &str) -> DbResult<Option<Build>>;

    /// Move a build to `to` if its current status is a legal predecessor.
    ///
    /// Returns `None` when the transition did not apply.
    async fn transition_build(&self, id: BuildId, to: BuildStatus) -> DbResult<Option<Build>>;
}

/// Jobs in any of `$2`; a job without configured groups is its own
/// `job:<name>` group.
const IN_SERIAL_GROUPS: &str = r#"
    (j.serial_groups && $2::text[]
        OR (cardinality(j.serial_groups) = 0 AND ('job:' || j.name) = ANY($2::text[])))
"#;

/// PostgreSQL implementation of BuildRepo.
pub struct PgBuildRepo {
    pool: PgPool,
}

impl PgBuildRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl BuildRepo for PgBuildRepo {
    async fn create_build(&self, job_id: ResourceId) -> DbResult<Build> {
        let id: Option<i64> = sqlx::query_scalar(
            r#"
            WITH next AS (
                UPDATE jobs SET build_number_seq = build_number_seq + 1
                WHERE id = $1
                RETURNING id, pipeline_id, build_number_seq
            )
            INSERT INTO builds (name, job_id, pipeline_id, team_id, status, created_at)
            SELECT next.build_number_seq::text, next.id, next.pipeline_id, p.team_id, 'pending', NOW()
            FROM next
            JOIN pipelines p ON p.id = next.pipeline_id
            RETURNING id
            "#,
        )
        .bind(job_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        let id = id.ok_or_else(|| DbError::NotFound(format!("job {}", job_id)))?;
        self.get_build(BuildId::new(id)).await
    }

    async fn get_build(&self, id: BuildId) -> DbResult<Build> {
        let record = sqlx::query_as::<_, BuildRecord>("SELECT * FROM builds_view WHERE id = $1")
            .bind(id.get())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("build {}", id)))?;
        Build::try_from(record)
    }

    async fn list_builds(&self, job_id: ResourceId, limit: i64) -> DbResult<Vec<Build>> {
        let records = sqlx::query_as::<_, BuildRecord>(
            "SELECT * FROM builds_view WHERE job_id = $1 ORDER BY id DESC LIMIT $2",
        )
        .bind(job_id.as_uuid())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        records.into_iter().map(Build::try_from).collect()
    }

    async fn running_builds_in_serial_groups(
        &self,
        pipeline_id: ResourceId,
        groups: &[String],
    ) -> DbResult<Vec<Build>> {
        let query = format!(
            r#"
            SELECT b.* FROM builds_view b
            JOIN jobs j ON j.id = b.job_id
            WHERE b.pipeline_id = $1
              AND b.status IN ('started', 'running')
              AND {IN_SERIAL_GROUPS}
            ORDER BY b.id
            "#
        );
        let records = sqlx::query_as::<_, BuildRecord>(&query)
            .bind(pipeline_id.as_uuid())
            .bind(groups)
            .fetch_all(&self.pool)
            .await?;
        records.into_iter().map(Build::try_from).collect()
    }

    async fn next_pending_build_in_serial_groups(
        &self,
        pipeline_id: ResourceId,
        groups: &[String],
    ) -> DbResult<Option<Build>> {
        let query = format!(
            r#"
            SELECT b.* FROM builds_view b
            JOIN jobs j ON j.id = b.job_id
            JOIN pipelines p ON p.id = b.pipeline_id
            WHERE b.pipeline_id = $1
              AND b.status = 'pending'
              AND NOT j.paused
              AND NOT p.paused
              AND {IN_SERIAL_GROUPS}
            ORDER BY b.id
            LIMIT 1
            "#
        );
        let record = sqlx::query_as::<_, BuildRecord>(&query)
            .bind(pipeline_id.as_uuid())
            .bind(groups)
            .fetch_optional(&self.pool)
            .await?;
        record.map(Build::try_from).transpose()
    }

    async fn pending_builds(&self, job_id: ResourceId) -> DbResult<Vec<Build>> {
        let records = sqlx::query_as::<_, BuildRecord>(
            "SELECT * FROM builds_view WHERE job_id = $1 AND status = 'pending' ORDER BY id",
        )
        .bind(job_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;
        records.into_iter().map(Build::try_from).collect()
    }

    async fn start_build(&self, id: BuildId, owner_url: &str) -> DbResult<Option<Build>> {
        let updated: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE builds SET status = 'started', owner_url = $2, started_at = NOW()
            WHERE id = $1 AND status = 'pending'
            RETURNING id
            "#,
        )
        .bind(id.get())
        .bind(owner_url)
        .fetch_optional(&self.pool)
        .await?;

        match updated {
            Some(_) => self.get_build(id).await.map(Some),
            None => Ok(None),
        }
    }

    async fn transition_build(&self, id: BuildId, to: BuildStatus) -> DbResult<Option<Build>> {
        let from: Vec<String> = BuildStatus::predecessors(to)
            .iter()
            .map(|s| s.as_str().to_string())
            .collect();

        let updated: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE builds SET
                status = $2,
                started_at = CASE WHEN $2 = 'started' THEN NOW() ELSE started_at END,
                finished_at = CASE WHEN $3 THEN NOW() ELSE finished_at END
            WHERE id = $1 AND status = ANY($4::text[])
            RETURNING id
            "#,
        )
        .bind(id.get())
        .bind(to.as_str())
        .bind(to.is_terminal())
        .bind(&from)
        .fetch_optional(&self.pool)
        .await?;

        match updated {
            Some(_) => self.get_build(id).await.map(Some),
            None => Ok(None),
        }
    }
}
