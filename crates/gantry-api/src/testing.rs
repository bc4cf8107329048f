//! Shared fixtures for router and streaming tests.

use crate::routes;
use crate::state::{AppState, Storage};
use axum::Router;
use axum::body::to_bytes;
use axum::response::Response;
use gantry_config::{AuthConfig, NodeConfig, StreamConfig};
use gantry_core::{Build, BuildEvent, BuildId, EventPayload, InFlightPolicy, Job, ResourceId};
use gantry_db::{BuildRepo, MemoryStore};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use url::Url;

/// One node of a test cluster: seeded team `main`, pipeline `release`
/// and job `deploy` in serial group `prod`.
pub(crate) struct Node {
    pub store: MemoryStore,
    pub state: AppState,
    pub drain: CancellationToken,
    pub job: Job,
    pub pipeline_id: ResourceId,
    pub peer_url: String,
}

impl Node {
    pub fn new(peer_url: &str) -> Self {
        Self::with_streams(peer_url, test_streams())
    }

    pub fn with_streams(peer_url: &str, streams: StreamConfig) -> Self {
        let store = MemoryStore::new();
        let team = store.add_team("main");
        let pipeline = store.add_pipeline(team.id, "release").unwrap();
        let job = store
            .add_job(pipeline.id, "deploy", &["prod"], InFlightPolicy::Serial)
            .unwrap();
        Self::on(store, job, peer_url, streams)
    }

    /// Another node sharing this node's storage.
    pub fn peer(&self, peer_url: &str) -> Self {
        Self::on(self.store.clone(), self.job.clone(), peer_url, test_streams())
    }

    fn on(store: MemoryStore, job: Job, peer_url: &str, streams: StreamConfig) -> Self {
        let url = Url::parse(peer_url).unwrap();
        let config = NodeConfig {
            external_url: url.clone(),
            peer_url: url,
            streams,
            auth: AuthConfig {
                tokens: vec!["s3cret".to_string()],
            },
            ..NodeConfig::default()
        };
        let drain = CancellationToken::new();
        let state = AppState::new(&config, Storage::memory(store.clone()), drain.clone());
        Self {
            store,
            state,
            drain,
            pipeline_id: job.pipeline_id,
            job,
            peer_url: peer_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn router(&self) -> Router {
        routes::router(self.state.clone())
    }

    pub async fn create_build(&self) -> Build {
        self.store.create_build(self.job.id).await.unwrap()
    }

    /// A build anyone may watch.
    pub async fn create_public_build(&self) -> Build {
        self.store.set_pipeline_public(self.pipeline_id, true).unwrap();
        self.create_build().await
    }

    /// A build started by this node.
    pub async fn start_build(&self) -> Build {
        let build = self.create_build().await;
        self.store
            .start_build(build.id, &self.peer_url)
            .await
            .unwrap()
            .unwrap()
    }

    pub async fn record(&self, build_id: BuildId, payload: EventPayload) -> BuildEvent {
        self.state.tracker.record(build_id, payload).await.unwrap()
    }
}

pub(crate) fn test_streams() -> StreamConfig {
    StreamConfig {
        subscriber_buffer: 64,
        connection_buffer: 16,
        poll_interval: Duration::from_millis(50),
        stall_timeout: Duration::from_millis(200),
    }
}

pub(crate) fn log(line: &str) -> EventPayload {
    EventPayload::Log {
        origin: "make".to_string(),
        payload: format!("{}\n", line),
    }
}

pub(crate) async fn body_json(response: Response) -> serde_json::Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

/// Read a finite SSE body, failing the test if it does not end.
pub(crate) async fn body_frames(response: Response) -> Vec<Frame> {
    let bytes = tokio::time::timeout(
        Duration::from_secs(5),
        to_bytes(response.into_body(), usize::MAX),
    )
    .await
    .expect("event stream should end")
    .unwrap();
    parse_sse(&String::from_utf8_lossy(&bytes))
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct Frame {
    pub event: String,
    pub id: Option<String>,
    pub data: String,
}

impl Frame {
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_str(&self.data).unwrap()
    }
}

pub(crate) fn parse_sse(text: &str) -> Vec<Frame> {
    text.split("\n\n")
        .filter_map(|block| {
            let mut frame = Frame::default();
            let mut seen = false;
            for line in block.lines() {
                // Comment lines carry keep-alives.
                if line.is_empty() || line.starts_with(':') {
                    continue;
                }
                let (field, value) = line.split_once(':').unwrap_or((line, ""));
                let value = value.strip_prefix(' ').unwrap_or(value);
                seen = true;
                match field {
                    "event" => frame.event = value.to_string(),
                    "id" => frame.id = Some(value.to_string()),
                    "data" => {
                        if !frame.data.is_empty() {
                            frame.data.push('\n');
                        }
                        frame.data.push_str(value);
                    }
                    _ => {}
                }
            }
            seen.then_some(frame)
        })
        .collect()
}
