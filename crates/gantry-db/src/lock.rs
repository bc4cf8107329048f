//! Advisory locks held in shared storage.
//!
//! Acquisition never blocks: a held key is reported as
//! [`LockError::NotAvailable`] and the caller decides what to do. Each node
//! owns a lock session; when a session is reaped for missing heartbeats,
//! every lock it held becomes free.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gantry_core::LockKey;
use sqlx::PgPool;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::DbError;

#[derive(Debug, Error)]
pub enum LockError {
    /// Another session holds the key. Expected under contention.
    #[error("lock is currently held and cannot be immediately acquired")]
    NotAvailable,

    /// The lock or session record does not exist or was already cleaned up.
    /// The key should be treated as free.
    #[error("lock record not present or already deleted")]
    RowGone,

    #[error(transparent)]
    Db(#[from] DbError),
}

impl From<sqlx::Error> for LockError {
    fn from(err: sqlx::Error) -> Self {
        LockError::Db(DbError::Database(err))
    }
}

pub type LockResult<T> = std::result::Result<T, LockError>;

/// Proof of a held lock; give it back through [`LockManager::release`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHandle {
    pub key: LockKey,
    pub session_id: Uuid,
    pub acquired_at: DateTime<Utc>,
}

/// The current holder of a key, as every node sees it.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct LockHolder {
    pub node: String,
    pub session_id: Uuid,
    pub acquired_at: DateTime<Utc>,
}

#[async_trait]
pub trait LockManager: Send + Sync {
    /// Take `key` if nobody holds it.
    async fn try_acquire(&self, key: &LockKey) -> LockResult<LockHandle>;

    async fn release(&self, handle: LockHandle) -> LockResult<()>;

    async fn holder(&self, key: &LockKey) -> LockResult<Option<LockHolder>>;

    /// Keep this node's session alive.
    async fn heartbeat(&self) -> LockResult<()>;

    /// Delete sessions whose heartbeat is older than `ttl`, freeing their
    /// locks. Returns the number of sessions removed.
    async fn reap_stale_sessions(&self, ttl: Duration) -> LockResult<u64>;
}

/// Locks taken together by one logical operation.
#[derive(Debug, Default)]
pub struct LockSet {
    handles: Vec<LockHandle>,
}

impl LockSet {
    pub fn keys(&self) -> impl Iterator<Item = &LockKey> {
        self.handles.iter().map(|h| &h.key)
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Release every lock, in reverse acquisition order.
    ///
    /// A lock that is already gone counts as released; other failures are
    /// logged and left to session reaping.
    pub async fn release(mut self, manager: &dyn LockManager) {
        while let Some(handle) = self.handles.pop() {
            let key = handle.key.clone();
            match manager.release(handle).await {
                Ok(()) | Err(LockError::RowGone) => {}
                Err(e) => warn!(lock = %key, error = %e, "Failed to release lock"),
            }
        }
    }
}

/// Acquire all `keys` in lexicographic order.
///
/// Returns `Ok(None)` if any key is held elsewhere, after releasing the
/// locks already taken. A key whose record vanished mid-acquisition is
/// retried once.
pub async fn try_acquire_all(
    manager: &dyn LockManager,
    keys: &[LockKey],
) -> LockResult<Option<LockSet>> {
    let mut sorted = keys.to_vec();
    sorted.sort();
    sorted.dedup();

    let mut set = LockSet::default();
    for key in &sorted {
        match acquire_with_retry(manager, key).await {
            Ok(handle) => set.handles.push(handle),
            Err(LockError::NotAvailable) | Err(LockError::RowGone) => {
                debug!(lock = %key, "Lock not available");
                set.release(manager).await;
                return Ok(None);
            }
            Err(e) => {
                set.release(manager).await;
                return Err(e);
            }
        }
    }
    Ok(Some(set))
}

async fn acquire_with_retry(manager: &dyn LockManager, key: &LockKey) -> LockResult<LockHandle> {
    match manager.try_acquire(key).await {
        Err(LockError::RowGone) => {
            debug!(lock = %key, "Lock record gone, retrying acquisition");
            manager.try_acquire(key).await
        }
        other => other,
    }
}

/// PostgreSQL implementation of LockManager.
///
/// Locks are rows in `locks` referencing this node's row in
/// `lock_sessions`; deleting the session cascades to its locks.
pub struct PgLockManager {
    pool: PgPool,
    node: String,
    session_id: Uuid,
}

impl PgLockManager {
    /// Register a new lock session for `node`.
    pub async fn start(pool: PgPool, node: impl Into<String>) -> LockResult<Self> {
        let manager = Self {
            pool,
            node: node.into(),
            session_id: Uuid::now_v7(),
        };
        manager.register_session().await?;
        Ok(manager)
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    async fn register_session(&self) -> LockResult<()> {
        sqlx::query(
            r#"
            INSERT INTO lock_sessions (id, node, heartbeat_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (id) DO UPDATE SET heartbeat_at = NOW()
            "#,
        )
        .bind(self.session_id)
        .bind(&self.node)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Remove this node's session, freeing all of its locks.
    pub async fn close(&self) -> LockResult<()> {
        sqlx::query("DELETE FROM lock_sessions WHERE id = $1")
            .bind(self.session_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl LockManager for PgLockManager {
    async fn try_acquire(&self, key: &LockKey) -> LockResult<LockHandle> {
        let result: Result<Option<DateTime<Utc>>, sqlx::Error> = sqlx::query_scalar(
            r#"
            INSERT INTO locks (key, session_id, acquired_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (key) DO NOTHING
            RETURNING acquired_at
            "#,
        )
        .bind(key.as_str())
        .bind(self.session_id)
        .fetch_optional(&self.pool)
        .await;

        match result {
            Ok(Some(acquired_at)) => Ok(LockHandle {
                key: key.clone(),
                session_id: self.session_id,
                acquired_at,
            }),
            Ok(None) => Err(LockError::NotAvailable),
            Err(sqlx::Error::Database(e)) if e.is_foreign_key_violation() => {
                // Our session was reaped; come back under the same id.
                self.register_session().await?;
                Err(LockError::RowGone)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn release(&self, handle: LockHandle) -> LockResult<()> {
        let result = sqlx::query("DELETE FROM locks WHERE key = $1 AND session_id = $2")
            .bind(handle.key.as_str())
            .bind(handle.session_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(LockError::RowGone);
        }
        Ok(())
    }

    async fn holder(&self, key: &LockKey) -> LockResult<Option<LockHolder>> {
        let holder = sqlx::query_as::<_, LockHolder>(
            r#"
            SELECT s.node, l.session_id, l.acquired_at
            FROM locks l
            JOIN lock_sessions s ON s.id = l.session_id
            WHERE l.key = $1
            "#,
        )
        .bind(key.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(holder)
    }

    async fn heartbeat(&self) -> LockResult<()> {
        self.register_session().await
    }

    async fn reap_stale_sessions(&self, ttl: Duration) -> LockResult<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM lock_sessions
            WHERE id <> $1 AND heartbeat_at < NOW() - make_interval(secs => $2)
            "#,
        )
        .bind(self.session_id)
        .bind(ttl.as_secs_f64())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
