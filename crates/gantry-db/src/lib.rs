//! Shared storage for Gantry.
//!
//! Provides repository traits with PostgreSQL implementations, the
//! storage-backed advisory [`LockManager`], and an in-process
//! [`MemoryStore`] for tests and single-node development.

pub mod error;
pub mod lock;
pub mod memory;
pub mod repo;

pub use error::{DbError, DbResult};
pub use lock::{
    LockError, LockHandle, LockHolder, LockManager, LockResult, LockSet, PgLockManager,
    try_acquire_all,
};
pub use memory::{MemoryLockManager, MemoryStore};
pub use repo::*;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

/// Create a new database connection pool.
pub async fn create_pool(database_url: &str, max_connections: u32) -> DbResult<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await?;
    Ok(pool)
}

/// Run database migrations.
pub async fn run_migrations(pool: &PgPool) -> DbResult<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}
