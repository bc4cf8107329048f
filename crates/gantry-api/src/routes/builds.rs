//! Build endpoints.

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;
use axum::routing::{get, put};
use axum::{Json, Router};
use serde::Deserialize;
use tracing::info;

use crate::AppState;
use crate::error::ApiError;
use gantry_core::{Build, BuildEvent, BuildId, EventPayload};

pub const LAST_EVENT_ID: &str = "last-event-id";

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/{id}", get(get_build))
        .route("/{id}/events", get(watch_events).post(record_event))
        .route("/{id}/abort", put(abort_build))
}

async fn get_build(
    State(state): State<AppState>,
    Path(id): Path<BuildId>,
    headers: HeaderMap,
) -> Result<Json<Build>, ApiError> {
    let build = state
        .builds
        .get_build(id)
        .await
        .map_err(|e| state.policy.conceal_missing(&headers, e.into()))?;
    state.policy.authorize(&headers, build.public)?;
    Ok(Json(build))
}

#[derive(Debug, Deserialize)]
struct EventsQuery {
    since: Option<u64>,
}

async fn watch_events(
    State(state): State<AppState>,
    Path(id): Path<BuildId>,
    Query(query): Query<EventsQuery>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let since = resume_point(&headers, query.since)?;
    state.event_server.serve(id, &headers, since).await
}

/// Last event id the client saw, from `Last-Event-ID` or `?since=`.
fn resume_point(headers: &HeaderMap, since: Option<u64>) -> Result<Option<u64>, ApiError> {
    let Some(value) = headers.get(LAST_EVENT_ID) else {
        return Ok(since);
    };
    value
        .to_str()
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .map(Some)
        .ok_or_else(|| ApiError::BadRequest("invalid Last-Event-ID".to_string()))
}

async fn record_event(
    State(state): State<AppState>,
    Path(id): Path<BuildId>,
    headers: HeaderMap,
    Json(payload): Json<EventPayload>,
) -> Result<(StatusCode, Json<BuildEvent>), ApiError> {
    state.policy.authorize(&headers, false)?;
    let event = state.tracker.record(id, payload).await?;
    Ok((StatusCode::CREATED, Json(event)))
}

async fn abort_build(
    State(state): State<AppState>,
    Path(id): Path<BuildId>,
    headers: HeaderMap,
) -> Result<Json<Build>, ApiError> {
    state.policy.authorize(&headers, false)?;
    let build = state.tracker.abort(id).await?;
    info!(build_id = %id, "Build aborted");

    // Aborting a running build frees its serial groups.
    state.scheduler_trigger.notify_one();
    Ok(Json(build))
}
