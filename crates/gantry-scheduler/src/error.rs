//! Scheduler errors.

use gantry_db::{DbError, LockError};
use thiserror::Error;

/// Failures that abort scheduling of one job (or listing jobs for a pass).
///
/// Lock contention is not an error; it is reported as an outcome.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("storage error: {0}")]
    Storage(#[from] DbError),

    #[error("lock error: {0}")]
    Lock(#[from] LockError),
}

pub type SchedulerResult<T> = std::result::Result<T, SchedulerError>;
