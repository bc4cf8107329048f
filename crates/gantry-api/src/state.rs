//! Application state.

use crate::auth::{RejectionPolicy, policy_from_config};
use crate::buildserver::BuildEventServer;
use crate::events::{BuildTracker, EventHub, SseEventHandlerFactory};
use gantry_config::NodeConfig;
use gantry_db::{BuildRepo, EventRepo, JobRepo, MemoryStore, PgBuildRepo, PgEventRepo, PgJobRepo};
use sqlx::PgPool;
use std::sync::Arc;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Repositories over the shared storage.
#[derive(Clone)]
pub struct Storage {
    pub jobs: Arc<dyn JobRepo>,
    pub builds: Arc<dyn BuildRepo>,
    pub events: Arc<dyn EventRepo>,
}

impl Storage {
    pub fn postgres(pool: PgPool) -> Self {
        Self {
            jobs: Arc::new(PgJobRepo::new(pool.clone())),
            builds: Arc::new(PgBuildRepo::new(pool.clone())),
            events: Arc::new(PgEventRepo::new(pool)),
        }
    }

    pub fn memory(store: MemoryStore) -> Self {
        Self {
            jobs: Arc::new(store.clone()),
            builds: Arc::new(store.clone()),
            events: Arc::new(store),
        }
    }
}

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub jobs: Arc<dyn JobRepo>,
    pub builds: Arc<dyn BuildRepo>,
    pub tracker: Arc<BuildTracker>,
    pub event_server: Arc<BuildEventServer>,
    pub policy: Arc<dyn RejectionPolicy>,
    /// Wakes the scheduler ahead of its next tick.
    pub scheduler_trigger: Arc<Notify>,
    pub drain: CancellationToken,
}

impl AppState {
    pub fn new(config: &NodeConfig, storage: Storage, drain: CancellationToken) -> Self {
        let hub = Arc::new(EventHub::new(config.streams.subscriber_buffer));
        let tracker = Arc::new(BuildTracker::new(
            storage.builds.clone(),
            storage.events.clone(),
            hub.clone(),
        ));
        let handlers = Arc::new(SseEventHandlerFactory::new(
            storage.builds.clone(),
            storage.events.clone(),
            hub,
            config.streams.clone(),
        ));
        let policy = policy_from_config(&config.auth);
        let event_server = Arc::new(BuildEventServer::new(
            storage.builds.clone(),
            handlers,
            policy.clone(),
            &config.peer_url,
            drain.clone(),
        ));

        Self {
            jobs: storage.jobs,
            builds: storage.builds,
            tracker,
            event_server,
            policy,
            scheduler_trigger: Arc::new(Notify::new()),
            drain,
        }
    }
}
