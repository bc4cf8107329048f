//! Job endpoints scoped by team and pipeline.

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, put};
use axum::{Json, Router};
use serde::Deserialize;
use tracing::info;

use crate::AppState;
use crate::error::ApiError;
use gantry_core::{Build, Job};

const DEFAULT_LIMIT: i64 = 50;
const MAX_LIMIT: i64 = 500;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/{job}/builds", get(list_builds).post(trigger_build))
        .route("/{job}/pause", put(pause_job))
        .route("/{job}/unpause", put(unpause_job))
}

#[derive(Debug, Deserialize)]
struct JobPath {
    team: String,
    pipeline: String,
    job: String,
}

impl JobPath {
    async fn resolve(&self, state: &AppState) -> Result<Job, ApiError> {
        Ok(state
            .jobs
            .get_job(&self.team, &self.pipeline, &self.job)
            .await?)
    }
}

#[derive(Debug, Deserialize)]
struct ListBuildsQuery {
    limit: Option<i64>,
}

async fn list_builds(
    State(state): State<AppState>,
    Path(path): Path<JobPath>,
    Query(query): Query<ListBuildsQuery>,
    headers: HeaderMap,
) -> Result<Json<Vec<Build>>, ApiError> {
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT);
    if !(1..=MAX_LIMIT).contains(&limit) {
        return Err(ApiError::BadRequest(format!(
            "limit must be between 1 and {}",
            MAX_LIMIT
        )));
    }

    let job = path
        .resolve(&state)
        .await
        .map_err(|e| state.policy.conceal_missing(&headers, e))?;
    let builds = state.builds.list_builds(job.id, limit).await?;

    // Every build of a job shares its pipeline's visibility.
    let public = builds.first().is_some_and(|b| b.public);
    state.policy.authorize(&headers, public)?;

    Ok(Json(builds))
}

async fn trigger_build(
    State(state): State<AppState>,
    Path(path): Path<JobPath>,
    headers: HeaderMap,
) -> Result<(StatusCode, Json<Build>), ApiError> {
    state.policy.authorize(&headers, false)?;

    let job = path.resolve(&state).await?;
    let build = state.builds.create_build(job.id).await?;
    info!(
        build_id = %build.id,
        team = %job.team_name,
        pipeline = %job.pipeline_name,
        job = %job.name,
        "Build triggered"
    );

    state.scheduler_trigger.notify_one();
    Ok((StatusCode::CREATED, Json(build)))
}

async fn pause_job(
    State(state): State<AppState>,
    Path(path): Path<JobPath>,
    headers: HeaderMap,
) -> Result<Json<Job>, ApiError> {
    set_paused(&state, &path, &headers, true).await
}

async fn unpause_job(
    State(state): State<AppState>,
    Path(path): Path<JobPath>,
    headers: HeaderMap,
) -> Result<Json<Job>, ApiError> {
    let job = set_paused(&state, &path, &headers, false).await?;
    state.scheduler_trigger.notify_one();
    Ok(job)
}

async fn set_paused(
    state: &AppState,
    path: &JobPath,
    headers: &HeaderMap,
    paused: bool,
) -> Result<Json<Job>, ApiError> {
    state.policy.authorize(headers, false)?;

    let job = path.resolve(state).await?;
    state.jobs.set_job_paused(job.id, paused).await?;
    info!(job = %job.name, paused, "Job pause state changed");

    Ok(Json(path.resolve(state).await?))
}
