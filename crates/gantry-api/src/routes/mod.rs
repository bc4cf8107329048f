//! API routes.

pub mod builds;
pub mod health;
pub mod jobs;

use crate::AppState;
use axum::Router;

/// Build the main API router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .nest("/api/v1", api_router())
        .merge(health::router())
        .with_state(state)
}

fn api_router() -> Router<AppState> {
    Router::new()
        .nest(
            "/teams/{team}/pipelines/{pipeline}/jobs",
            jobs::router(),
        )
        .nest("/builds", builds::router())
}
