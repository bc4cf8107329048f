//! Recording build events and status changes.

use crate::error::ApiError;
use crate::events::EventHub;
use async_trait::async_trait;
use gantry_core::{Build, BuildEvent, BuildId, BuildStatus, EventPayload};
use gantry_db::{BuildRepo, DbError, EventRepo};
use gantry_scheduler::BuildEngine;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum TrackError {
    #[error("build {build_id} cannot move from {from} to {to}")]
    InvalidTransition {
        build_id: BuildId,
        from: BuildStatus,
        to: BuildStatus,
    },

    #[error(transparent)]
    Storage(#[from] DbError),
}

impl From<TrackError> for ApiError {
    fn from(err: TrackError) -> Self {
        match err {
            TrackError::InvalidTransition { .. } => ApiError::Conflict(err.to_string()),
            TrackError::Storage(e) => e.into(),
        }
    }
}

/// Appends events to storage and fans them out to local watchers.
///
/// Status events move the build first; the event is only written when the
/// conditional transition succeeds.
pub struct BuildTracker {
    builds: Arc<dyn BuildRepo>,
    events: Arc<dyn EventRepo>,
    hub: Arc<EventHub>,
}

impl BuildTracker {
    pub fn new(builds: Arc<dyn BuildRepo>, events: Arc<dyn EventRepo>, hub: Arc<EventHub>) -> Self {
        Self { builds, events, hub }
    }

    pub fn hub(&self) -> &Arc<EventHub> {
        &self.hub
    }

    pub async fn record(
        &self,
        build_id: BuildId,
        payload: EventPayload,
    ) -> Result<BuildEvent, TrackError> {
        if let EventPayload::Status { status } = payload {
            self.transition(build_id, status).await?;
        }
        self.append(build_id, payload).await
    }

    pub async fn abort(&self, build_id: BuildId) -> Result<Build, TrackError> {
        let build = self.transition(build_id, BuildStatus::Aborted).await?;
        self.append(
            build_id,
            EventPayload::Status {
                status: BuildStatus::Aborted,
            },
        )
        .await?;
        Ok(build)
    }

    /// Record the status of a build whose transition already happened.
    pub async fn record_started(&self, build: &Build) -> Result<BuildEvent, TrackError> {
        self.append(
            build.id,
            EventPayload::Status {
                status: build.status,
            },
        )
        .await
    }

    async fn transition(&self, build_id: BuildId, to: BuildStatus) -> Result<Build, TrackError> {
        if let Some(build) = self.builds.transition_build(build_id, to).await? {
            return Ok(build);
        }
        let current = self.builds.get_build(build_id).await?;
        Err(TrackError::InvalidTransition {
            build_id,
            from: current.status,
            to,
        })
    }

    async fn append(
        &self,
        build_id: BuildId,
        payload: EventPayload,
    ) -> Result<BuildEvent, TrackError> {
        let event = self.events.append_event(build_id, payload).await?;
        let terminal = event.is_terminal();

        self.hub.publish(event.clone());
        if terminal {
            debug!(build_id = %build_id, event_id = event.event_id, "Build finished");
            self.hub.close(build_id);
        }
        Ok(event)
    }
}

/// Engine hand-off that records the start and passes the build on to an
/// executor queue, if one is attached.
pub struct TrackingEngine {
    tracker: Arc<BuildTracker>,
    queue: Option<mpsc::Sender<Build>>,
}

impl TrackingEngine {
    pub fn new(tracker: Arc<BuildTracker>) -> Self {
        Self {
            tracker,
            queue: None,
        }
    }

    pub fn with_queue(mut self, queue: mpsc::Sender<Build>) -> Self {
        self.queue = Some(queue);
        self
    }
}

#[async_trait]
impl BuildEngine for TrackingEngine {
    async fn start(&self, build: Build) {
        if let Err(e) = self.tracker.record_started(&build).await {
            warn!(build_id = %build.id, error = %e, "Failed to record build start");
        }

        if let Some(queue) = &self.queue {
            let build_id = build.id;
            if let Err(e) = queue.try_send(build) {
                warn!(build_id = %build_id, error = %e, "Executor queue rejected build");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_core::InFlightPolicy;
    use gantry_db::MemoryStore;
    use tokio::sync::broadcast::error::RecvError;

    struct Fixture {
        store: MemoryStore,
        hub: Arc<EventHub>,
        tracker: Arc<BuildTracker>,
        build: Build,
    }

    async fn fixture() -> Fixture {
        let store = MemoryStore::new();
        let team = store.add_team("main");
        let pipeline = store.add_pipeline(team.id, "release").unwrap();
        let job = store
            .add_job(pipeline.id, "unit", &[], InFlightPolicy::Serial)
            .unwrap();
        let build = store.create_build(job.id).await.unwrap();

        let hub = Arc::new(EventHub::new(16));
        let tracker = Arc::new(BuildTracker::new(
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            hub.clone(),
        ));
        Fixture {
            store,
            hub,
            tracker,
            build,
        }
    }

    fn status(status: BuildStatus) -> EventPayload {
        EventPayload::Status { status }
    }

    #[tokio::test]
    async fn test_status_event_moves_build() {
        let f = fixture().await;
        f.store.start_build(f.build.id, "http://a").await.unwrap();

        let event = f
            .tracker
            .record(f.build.id, status(BuildStatus::Running))
            .await
            .unwrap();
        assert_eq!(event.event_id, 0);
        assert_eq!(
            f.store.get_build(f.build.id).await.unwrap().status,
            BuildStatus::Running
        );
    }

    #[tokio::test]
    async fn test_invalid_transition_writes_nothing() {
        let f = fixture().await;

        let err = f
            .tracker
            .record(f.build.id, status(BuildStatus::Succeeded))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TrackError::InvalidTransition {
                from: BuildStatus::Pending,
                to: BuildStatus::Succeeded,
                ..
            }
        ));
        assert!(f.store.events_since(f.build.id, None).await.unwrap().is_empty());
        assert!(matches!(ApiError::from(err), ApiError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_terminal_event_closes_channel() {
        let f = fixture().await;
        f.store.start_build(f.build.id, "http://a").await.unwrap();
        let mut rx = f.hub.subscribe(f.build.id);

        f.tracker
            .record(
                f.build.id,
                EventPayload::Log {
                    origin: "test".to_string(),
                    payload: "ok\n".to_string(),
                },
            )
            .await
            .unwrap();
        f.tracker
            .record(f.build.id, status(BuildStatus::Failed))
            .await
            .unwrap();

        assert_eq!(rx.recv().await.unwrap().event_id, 0);
        assert!(rx.recv().await.unwrap().is_terminal());
        assert!(matches!(rx.recv().await, Err(RecvError::Closed)));
    }

    #[tokio::test]
    async fn test_abort_pending_build() {
        let f = fixture().await;
        let aborted = f.tracker.abort(f.build.id).await.unwrap();
        assert_eq!(aborted.status, BuildStatus::Aborted);

        let events = f.store.events_since(f.build.id, None).await.unwrap();
        assert_eq!(events.len(), 1);
        assert!(events[0].is_terminal());

        assert!(matches!(
            f.tracker.abort(f.build.id).await,
            Err(TrackError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_unknown_build_is_not_found() {
        let f = fixture().await;
        let err = f.tracker.abort(BuildId::new(999)).await.unwrap_err();
        assert!(matches!(ApiError::from(err), ApiError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_engine_records_start_and_forwards() {
        let f = fixture().await;
        let started = f
            .store
            .start_build(f.build.id, "http://a")
            .await
            .unwrap()
            .unwrap();

        let (tx, mut rx) = mpsc::channel(1);
        let engine = TrackingEngine::new(f.tracker.clone()).with_queue(tx);
        engine.start(started.clone()).await;

        assert_eq!(rx.recv().await.unwrap().id, started.id);
        let events = f.store.events_since(f.build.id, None).await.unwrap();
        assert_eq!(events[0].payload, status(BuildStatus::Started));
    }
}
