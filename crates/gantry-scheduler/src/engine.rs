//! Hand-off to the execution engine.

use async_trait::async_trait;
use gantry_core::Build;

/// Receives builds the scheduler has just started.
///
/// Hand-off is fire-and-forget: execution failures are reported later by
/// the engine writing build status, never returned to the scheduler.
#[async_trait]
pub trait BuildEngine: Send + Sync {
    async fn start(&self, build: Build);
}
