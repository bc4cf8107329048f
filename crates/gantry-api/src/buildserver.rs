//! Build event streams served from whichever node a client reached.

use crate::auth::RejectionPolicy;
use crate::error::ApiError;
use crate::events::EventHandlerFactory;
use axum::body::Body;
use axum::http::header::{ACCEPT, AUTHORIZATION, CACHE_CONTROL, CONTENT_TYPE};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures::{StreamExt, future, stream};
use gantry_core::{Build, BuildId};
use gantry_db::BuildRepo;
use std::convert::Infallible;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

/// Marks a request one node forwarded to another, so it is never
/// forwarded twice.
pub const FORWARDED_HEADER: &str = "x-gantry-forwarded-by";

const DRAINING_FRAME: &[u8] = b"event: draining\ndata: node draining\n\n";

pub struct BuildEventServer {
    builds: Arc<dyn BuildRepo>,
    handlers: Arc<dyn EventHandlerFactory>,
    policy: Arc<dyn RejectionPolicy>,
    /// This node's address as recorded in `Build::owner_url`.
    peer_url: String,
    client: reqwest::Client,
    drain: CancellationToken,
}

impl BuildEventServer {
    pub fn new(
        builds: Arc<dyn BuildRepo>,
        handlers: Arc<dyn EventHandlerFactory>,
        policy: Arc<dyn RejectionPolicy>,
        peer_url: &Url,
        drain: CancellationToken,
    ) -> Self {
        Self {
            builds,
            handlers,
            policy,
            peer_url: owner_address(peer_url),
            client: reqwest::Client::new(),
            drain,
        }
    }

    /// Serve the events of `build_id` after `since`.
    ///
    /// Ownership is looked up on every request since builds may move
    /// between nodes.
    pub async fn serve(
        &self,
        build_id: BuildId,
        headers: &HeaderMap,
        since: Option<u64>,
    ) -> Result<Response, ApiError> {
        let build = self
            .builds
            .get_build(build_id)
            .await
            .map_err(|e| self.policy.conceal_missing(headers, e.into()))?;
        self.policy.authorize(headers, build.public)?;

        if build.is_terminal() {
            return self.handlers.handler(build).history(since).await;
        }

        if self.drain.is_cancelled() {
            return Err(ApiError::Unavailable("node is draining".to_string()));
        }

        if let Some(owner) = self.remote_owner(&build, headers) {
            return self.proxy(&owner, build_id, headers, since).await;
        }

        self.handlers
            .handler(build)
            .stream(since, self.drain.clone())
            .await
    }

    fn remote_owner(&self, build: &Build, headers: &HeaderMap) -> Option<String> {
        let owner = build.owner_url.as_deref()?.trim_end_matches('/');
        if owner == self.peer_url {
            return None;
        }
        if let Some(from) = self.forwarded_by(headers) {
            debug!(build_id = %build.id, owner, from, "Already forwarded, serving locally");
            return None;
        }
        Some(owner.to_string())
    }

    /// The node that forwarded this request, if the claim is credible.
    ///
    /// Only authenticated requests may claim to be forwarded, and the
    /// claim must name another node's http(s) address.
    fn forwarded_by<'h>(&self, headers: &'h HeaderMap) -> Option<&'h str> {
        let value = headers.get(FORWARDED_HEADER)?.to_str().ok()?;
        if !self.policy.is_authenticated(headers) {
            debug!(from = value, "Ignoring forwarding claim without credentials");
            return None;
        }
        let from = Url::parse(value).ok()?;
        let peer = matches!(from.scheme(), "http" | "https")
            && from.host().is_some()
            && owner_address(&from) != self.peer_url;
        peer.then_some(value)
    }

    async fn proxy(
        &self,
        owner: &str,
        build_id: BuildId,
        headers: &HeaderMap,
        since: Option<u64>,
    ) -> Result<Response, ApiError> {
        let url = format!("{}/api/v1/builds/{}/events", owner, build_id);
        info!(build_id = %build_id, owner, "Proxying build events to owner");

        let mut request = self
            .client
            .get(&url)
            .header(FORWARDED_HEADER, self.peer_url.as_str())
            .header(ACCEPT, "text/event-stream");
        if let Some(auth) = headers.get(AUTHORIZATION) {
            request = request.header(AUTHORIZATION, auth.clone());
        }
        if let Some(since) = since {
            request = request.query(&[("since", since)]);
        }

        let response = request.send().await.map_err(|e| {
            warn!(build_id = %build_id, owner, error = %e, "Owner unreachable");
            ApiError::BadGateway(format!("owner {} unreachable: {}", owner, e))
        })?;

        let status = response.status();
        if !status.is_success() {
            warn!(build_id = %build_id, owner, %status, "Owner refused event stream");
            let body = response.bytes().await.unwrap_or_default();
            return Ok((status, body).into_response());
        }

        let body = relay(response.bytes_stream(), self.drain.clone());
        Response::builder()
            .status(StatusCode::OK)
            .header(CONTENT_TYPE, "text/event-stream")
            .header(CACHE_CONTROL, "no-cache")
            .body(Body::from_stream(body))
            .map_err(|e| ApiError::Internal(e.to_string()))
    }
}

/// Relay the owner's bytes until it ends, fails, or this node drains.
///
/// A failing peer ends the stream with an `error` frame.
fn relay<S>(
    upstream: S,
    drain: CancellationToken,
) -> impl futures::Stream<Item = Result<Bytes, Infallible>> + Send + 'static
where
    S: futures::Stream<Item = reqwest::Result<Bytes>> + Send + 'static,
{
    let relayed = upstream
        .scan(false, |failed, chunk| {
            if *failed {
                return future::ready(None);
            }
            let frame = match chunk {
                Ok(bytes) => bytes,
                Err(e) => {
                    *failed = true;
                    Bytes::from(format!("event: error\ndata: owner stream failed: {}\n\n", e))
                }
            };
            future::ready(Some(Ok::<_, Infallible>(frame)))
        })
        .take_until(drain.clone().cancelled_owned());

    let trailer = stream::once(async move { drain.is_cancelled() }).filter_map(|draining| {
        future::ready(draining.then(|| Ok::<_, Infallible>(Bytes::from_static(DRAINING_FRAME))))
    });

    relayed.chain(trailer)
}

/// The form of a node URL stored as a build's owner.
pub fn owner_address(url: &Url) -> String {
    url.as_str().trim_end_matches('/').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routes::builds::LAST_EVENT_ID;
    use crate::testing::{Frame, Node, body_frames, log};
    use axum::body::Body;
    use axum::http::Request;
    use gantry_core::{BuildStatus, EventPayload};
    use gantry_config::StreamConfig;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tower::ServiceExt;

    fn watch(build_id: BuildId) -> axum::http::request::Builder {
        Request::builder()
            .uri(format!("/api/v1/builds/{}/events", build_id))
            .header(AUTHORIZATION, "Bearer s3cret")
    }

    async fn open(node: &Node, request: axum::http::request::Builder) -> Response {
        node.router()
            .oneshot(request.body(Body::empty()).unwrap())
            .await
            .unwrap()
    }

    fn status(status: BuildStatus) -> EventPayload {
        EventPayload::Status { status }
    }

    fn ids(frames: &[Frame]) -> Vec<String> {
        frames
            .iter()
            .filter(|f| f.event == "event")
            .filter_map(|f| f.id.clone())
            .collect()
    }

    fn expected(ids: std::ops::Range<u64>) -> Vec<String> {
        ids.map(|id| id.to_string()).collect()
    }

    #[tokio::test]
    async fn test_finished_build_served_as_history() {
        let node = Node::new("http://node-a:8080");
        let build = node.start_build().await;
        node.record(build.id, log("compiling")).await;
        node.record(build.id, status(BuildStatus::Succeeded)).await;

        let response = open(&node, watch(build.id)).await;
        assert_eq!(response.status(), StatusCode::OK);
        let frames = body_frames(response).await;

        assert_eq!(ids(&frames), expected(0..2));
        assert_eq!(frames[0].json()["payload"]["data"]["payload"], "compiling\n");
        let end = frames.last().unwrap();
        assert_eq!(end.event, "end");
        assert_eq!(end.json()["status"], "succeeded");
    }

    #[tokio::test]
    async fn test_live_stream_is_ordered_and_ends_on_terminal_status() {
        let node = Node::new("http://node-a:8080");
        let build = node.start_build().await;
        node.record(build.id, log("before watch")).await;

        let response = open(&node, watch(build.id)).await;
        assert_eq!(response.status(), StatusCode::OK);

        let tracker = node.state.tracker.clone();
        tokio::spawn(async move {
            tracker.record(build.id, status(BuildStatus::Running)).await.unwrap();
            for line in ["a", "b", "c"] {
                tokio::time::sleep(Duration::from_millis(5)).await;
                tracker.record(build.id, log(line)).await.unwrap();
            }
            tracker.record(build.id, status(BuildStatus::Failed)).await.unwrap();
        });

        let frames = body_frames(response).await;
        assert_eq!(ids(&frames), expected(0..6));
        assert_eq!(frames.last().unwrap().event, "end");
        assert_eq!(frames.last().unwrap().json()["status"], "failed");
    }

    #[tokio::test]
    async fn test_resume_skips_events_already_seen() {
        let node = Node::new("http://node-a:8080");
        let build = node.start_build().await;
        for line in ["a", "b", "c"] {
            node.record(build.id, log(line)).await;
        }
        node.record(build.id, status(BuildStatus::Succeeded)).await;

        let response = open(&node, watch(build.id).header(LAST_EVENT_ID, "1")).await;
        let frames = body_frames(response).await;
        assert_eq!(ids(&frames), expected(2..4));

        let response = open(
            &node,
            Request::builder()
                .uri(format!("/api/v1/builds/{}/events?since=2", build.id))
                .header(AUTHORIZATION, "Bearer s3cret"),
        )
        .await;
        assert_eq!(ids(&body_frames(response).await), expected(3..4));
    }

    #[tokio::test]
    async fn test_live_resume_continues_after_last_seen() {
        let node = Node::new("http://node-a:8080");
        let build = node.start_build().await;
        node.record(build.id, log("a")).await;
        node.record(build.id, log("b")).await;

        let response = open(&node, watch(build.id).header(LAST_EVENT_ID, "0")).await;
        node.record(build.id, status(BuildStatus::Errored)).await;

        let frames = body_frames(response).await;
        assert_eq!(ids(&frames), expected(1..3));
    }

    #[tokio::test]
    async fn test_private_stream_rejected_before_lookup_of_events() {
        let node = Node::new("http://node-a:8080");
        let build = node.start_build().await;
        node.record(build.id, log("secret")).await;

        let response = open(
            &node,
            Request::builder().uri(format!("/api/v1/builds/{}/events", build.id)),
        )
        .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_unknown_build_is_not_found() {
        let node = Node::new("http://node-a:8080");
        let response = open(&node, watch(BuildId::new(404))).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_unknown_build_looks_private_without_credentials() {
        let node = Node::new("http://node-a:8080");
        let private = node.start_build().await;

        for id in [BuildId::new(404), private.id] {
            let response = open(
                &node,
                Request::builder().uri(format!("/api/v1/builds/{}/events", id)),
            )
            .await;
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        }
    }

    #[tokio::test]
    async fn test_drain_ends_open_streams_and_refuses_new_ones() {
        let node = Node::new("http://node-a:8080");
        let build = node.start_build().await;
        node.record(build.id, log("a")).await;

        let open_stream = open(&node, watch(build.id)).await;
        assert_eq!(open_stream.status(), StatusCode::OK);

        node.drain.cancel();
        let frames = body_frames(open_stream).await;
        assert_eq!(frames.last().unwrap().event, "draining");
        assert!(frames.iter().all(|f| f.event != "end"));

        let refused = open(&node, watch(build.id)).await;
        assert_eq!(refused.status(), StatusCode::SERVICE_UNAVAILABLE);

        // History needs no long-lived stream and is still served.
        let finished = node.start_build().await;
        node.record(finished.id, status(BuildStatus::Succeeded)).await;
        let response = open(&node, watch(finished.id)).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_frames(response).await.last().unwrap().event, "end");
    }

    #[tokio::test]
    async fn test_lagging_watcher_is_dropped() {
        let node = Node::with_streams(
            "http://node-a:8080",
            StreamConfig {
                subscriber_buffer: 2,
                connection_buffer: 16,
                poll_interval: Duration::from_secs(60),
                stall_timeout: Duration::from_secs(1),
            },
        );
        let build = node.start_build().await;
        let response = open(&node, watch(build.id)).await;

        // Let the stream catch up and wait for live events.
        tokio::time::sleep(Duration::from_millis(50)).await;
        for i in 0..10 {
            node.record(build.id, log(&i.to_string())).await;
        }

        let frames = body_frames(response).await;
        assert_eq!(frames.last().unwrap().event, "error");
        assert!(frames.iter().all(|f| f.event != "end"));
    }

    #[tokio::test]
    async fn test_events_written_by_another_node_are_picked_up() {
        let node_a = Node::new("http://node-a:8080");
        let node_b = node_a.peer("http://node-b:8080");
        let build = node_a.start_build().await;

        let response = open(&node_a, watch(build.id)).await;
        node_b.record(build.id, log("from b")).await;
        node_b.record(build.id, status(BuildStatus::Succeeded)).await;

        let frames = body_frames(response).await;
        assert_eq!(ids(&frames), expected(0..2));
        assert_eq!(frames.last().unwrap().event, "end");
        assert_eq!(node_a.state.tracker.hub().channel_count(), 0);
    }

    #[tokio::test]
    async fn test_disconnected_watcher_releases_channel() {
        let node = Node::new("http://node-a:8080");
        let build = node.start_build().await;
        let response = open(&node, watch(build.id)).await;
        assert_eq!(node.state.tracker.hub().channel_count(), 1);

        drop(response);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(node.state.tracker.hub().channel_count(), 0);
    }

    fn stalling_streams(stall_timeout: Duration) -> StreamConfig {
        StreamConfig {
            subscriber_buffer: 4,
            connection_buffer: 1,
            poll_interval: Duration::from_secs(60),
            stall_timeout,
        }
    }

    /// Open a stream nobody reads and write past its buffers.
    async fn stall(node: &Node) -> (BuildId, Response) {
        let build = node.start_build().await;
        let response = open(node, watch(build.id)).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        for i in 0..20 {
            node.record(build.id, log(&i.to_string())).await;
            tokio::task::yield_now().await;
        }
        (build.id, response)
    }

    #[tokio::test]
    async fn test_stalled_watcher_is_dropped() {
        let node = Node::with_streams(
            "http://node-a:8080",
            stalling_streams(Duration::from_millis(100)),
        );
        let (_, response) = stall(&node).await;

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(node.state.tracker.hub().channel_count(), 0);

        // At most what fit in the connection buffer was queued.
        let frames = body_frames(response).await;
        assert!(ids(&frames).len() <= 1);
        assert!(frames.iter().all(|f| f.event != "end"));
    }

    #[tokio::test]
    async fn test_drain_ends_stalled_stream() {
        let node = Node::with_streams(
            "http://node-a:8080",
            stalling_streams(Duration::from_secs(60)),
        );
        let (_, response) = stall(&node).await;
        assert_eq!(node.state.tracker.hub().channel_count(), 1);

        node.drain.cancel();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(node.state.tracker.hub().channel_count(), 0);

        let frames = body_frames(response).await;
        assert!(ids(&frames).len() <= 1);
        assert!(frames.iter().all(|f| f.event != "end"));
    }

    #[tokio::test]
    async fn test_stream_proxied_to_owning_node() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let owner_url = format!("http://{}", listener.local_addr().unwrap());

        let node_a = Node::new("http://node-a:8080");
        let node_b = node_a.peer(&owner_url);
        tokio::spawn(axum::serve(listener, node_b.router()).into_future());

        let build = node_b.start_build().await;
        node_b.record(build.id, log("on b")).await;

        let response = open(&node_a, watch(build.id)).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(CONTENT_TYPE).unwrap(),
            "text/event-stream"
        );

        let tracker = node_b.state.tracker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            tracker.record(build.id, log("more")).await.unwrap();
            tracker
                .record(build.id, status(BuildStatus::Succeeded))
                .await
                .unwrap();
        });

        let frames = body_frames(response).await;
        assert_eq!(ids(&frames), expected(0..3));
        assert_eq!(frames.last().unwrap().event, "end");
    }

    #[tokio::test]
    async fn test_proxy_forwards_resume_point() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let owner_url = format!("http://{}", listener.local_addr().unwrap());

        let node_a = Node::new("http://node-a:8080");
        let node_b = node_a.peer(&owner_url);
        tokio::spawn(axum::serve(listener, node_b.router()).into_future());

        let build = node_b.start_build().await;
        node_b.record(build.id, log("a")).await;
        node_b.record(build.id, log("b")).await;

        let response = open(&node_a, watch(build.id).header(LAST_EVENT_ID, "0")).await;
        node_b.record(build.id, status(BuildStatus::Succeeded)).await;

        assert_eq!(ids(&body_frames(response).await), expected(1..3));
    }

    #[tokio::test]
    async fn test_unreachable_owner_is_bad_gateway() {
        let node = Node::new("http://node-a:8080");
        let build = node.create_build().await;
        node.store
            .start_build(build.id, "http://127.0.0.1:1")
            .await
            .unwrap();

        let response = open(&node, watch(build.id)).await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn test_forwarded_request_is_served_locally() {
        let node = Node::new("http://node-a:8080");
        let build = node.create_build().await;
        node.store
            .start_build(build.id, "http://127.0.0.1:1")
            .await
            .unwrap();

        let response = open(
            &node,
            watch(build.id).header(FORWARDED_HEADER, "http://node-c:8080"),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);

        node.record(build.id, status(BuildStatus::Aborted)).await;
        let frames = body_frames(response).await;
        assert_eq!(frames.last().unwrap().json()["status"], "aborted");
    }

    #[tokio::test]
    async fn test_forwarding_claim_needs_credentials() {
        let node = Node::new("http://node-a:8080");
        let build = node.create_public_build().await;
        node.store
            .start_build(build.id, "http://127.0.0.1:1")
            .await
            .unwrap();

        let request = Request::builder()
            .uri(format!("/api/v1/builds/{}/events", build.id))
            .header(FORWARDED_HEADER, "http://node-c:8080");
        let response = open(&node, request).await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn test_forwarding_claim_must_name_another_node() {
        let node = Node::new("http://node-a:8080");
        let build = node.create_build().await;
        node.store
            .start_build(build.id, "http://127.0.0.1:1")
            .await
            .unwrap();

        for claim in ["yes", "http://node-a:8080", "ftp://node-c"] {
            let response = open(&node, watch(build.id).header(FORWARDED_HEADER, claim)).await;
            assert_eq!(response.status(), StatusCode::BAD_GATEWAY, "claim {claim}");
        }
    }

    #[test]
    fn test_owner_address_has_no_trailing_slash() {
        let url = Url::parse("http://10.0.0.1:8080").unwrap();
        assert_eq!(owner_address(&url), "http://10.0.0.1:8080");
    }
}
