//! Server-sent event delivery of a build's event log.
//!
//! Frames:
//!
//! - `event: event` with `id:` set to the event id and the event as JSON data
//! - `event: end` once the build is finished, with its final status
//! - `event: draining` when this node shuts down mid-stream
//! - `event: error` when the stream fails or the watcher fell too far behind

use crate::error::ApiError;
use crate::events::EventHub;
use async_trait::async_trait;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use gantry_config::StreamConfig;
use gantry_core::{Build, BuildEvent, BuildId, BuildStatus};
use gantry_db::{BuildRepo, DbResult, EventRepo};
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::MissedTickBehavior;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Produces a handler for one request on one build.
pub trait EventHandlerFactory: Send + Sync {
    fn handler(&self, build: Build) -> Box<dyn EventHandler>;
}

/// Serves a single build's events to a single client.
///
/// `since` is the last event id the client has already seen.
#[async_trait]
pub trait EventHandler: Send {
    /// Everything stored after `since`, followed by the end marker.
    async fn history(self: Box<Self>, since: Option<u64>) -> Result<Response, ApiError>;

    /// Stored events after `since`, then new events as they are appended,
    /// until the build finishes, the client leaves or `drain` fires.
    async fn stream(
        self: Box<Self>,
        since: Option<u64>,
        drain: CancellationToken,
    ) -> Result<Response, ApiError>;
}

pub struct SseEventHandlerFactory {
    builds: Arc<dyn BuildRepo>,
    events: Arc<dyn EventRepo>,
    hub: Arc<EventHub>,
    config: StreamConfig,
}

impl SseEventHandlerFactory {
    pub fn new(
        builds: Arc<dyn BuildRepo>,
        events: Arc<dyn EventRepo>,
        hub: Arc<EventHub>,
        config: StreamConfig,
    ) -> Self {
        Self {
            builds,
            events,
            hub,
            config,
        }
    }
}

impl EventHandlerFactory for SseEventHandlerFactory {
    fn handler(&self, build: Build) -> Box<dyn EventHandler> {
        Box::new(SseEventHandler {
            build,
            builds: self.builds.clone(),
            events: self.events.clone(),
            hub: self.hub.clone(),
            connection_buffer: self.config.connection_buffer.max(1),
            poll_interval: self.config.poll_interval,
            stall_timeout: self.config.stall_timeout,
        })
    }
}

struct SseEventHandler {
    build: Build,
    builds: Arc<dyn BuildRepo>,
    events: Arc<dyn EventRepo>,
    hub: Arc<EventHub>,
    connection_buffer: usize,
    poll_interval: Duration,
    stall_timeout: Duration,
}

#[async_trait]
impl EventHandler for SseEventHandler {
    async fn history(self: Box<Self>, since: Option<u64>) -> Result<Response, ApiError> {
        let stored = self.events.events_since(self.build.id, since).await?;
        let frames: Vec<Result<Event, Infallible>> = stored
            .iter()
            .map(event_frame)
            .chain(std::iter::once(end_frame(self.build.status)))
            .map(Ok)
            .collect();
        Ok(Sse::new(futures::stream::iter(frames)).into_response())
    }

    async fn stream(
        self: Box<Self>,
        since: Option<u64>,
        drain: CancellationToken,
    ) -> Result<Response, ApiError> {
        // Subscribe before the first storage read so nothing appended in
        // between is missed.
        let live = self.hub.subscribe(self.build.id);
        let (tx, rx) = mpsc::channel(self.connection_buffer);

        let pump = Pump {
            build_id: self.build.id,
            builds: self.builds,
            events: self.events,
            hub: self.hub,
            live: Some(live),
            tx,
            drain,
            poll_interval: self.poll_interval,
            stall_timeout: self.stall_timeout,
            last: since,
        };
        tokio::spawn(pump.run());

        Ok(Sse::new(ReceiverStream::new(rx))
            .keep_alive(KeepAlive::default())
            .into_response())
    }
}

fn event_frame(event: &BuildEvent) -> Event {
    Event::default()
        .id(event.event_id.to_string())
        .event("event")
        .json_data(event)
        .unwrap_or_else(|e| error_frame(&format!("failed to encode event: {}", e)))
}

fn end_frame(status: BuildStatus) -> Event {
    Event::default()
        .event("end")
        .data(json!({ "status": status }).to_string())
}

fn draining_frame() -> Event {
    Event::default().event("draining").data("node draining")
}

fn error_frame(message: &str) -> Event {
    Event::default().event("error").data(message)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    /// The build ended or the client left.
    Finished,
    Drained,
    /// The watcher cannot keep up and is dropped.
    Behind,
}

enum Step {
    Drain,
    ClientGone,
    Live(Result<BuildEvent, broadcast::error::RecvError>),
    Poll,
}

/// Per-connection task moving events from the log to one client.
///
/// Nothing here waits on the client without also watching `drain`, and a
/// live event waits at most `stall_timeout` for room in the connection
/// buffer.
struct Pump {
    build_id: BuildId,
    builds: Arc<dyn BuildRepo>,
    events: Arc<dyn EventRepo>,
    hub: Arc<EventHub>,
    /// `None` once the hub closed the channel; storage polling continues.
    live: Option<broadcast::Receiver<BuildEvent>>,
    tx: mpsc::Sender<Result<Event, Infallible>>,
    drain: CancellationToken,
    poll_interval: Duration,
    stall_timeout: Duration,
    /// Last event id delivered to the client.
    last: Option<u64>,
}

impl Pump {
    async fn run(mut self) {
        match self.pump().await {
            Ok(Flow::Drained) => {
                debug!(build_id = %self.build_id, "Ending stream, node is draining");
                // A client that stopped reading misses the notice and
                // reconnects anyway once the connection closes.
                let _ = self.tx.try_send(Ok(draining_frame()));
            }
            Ok(Flow::Behind) => {
                warn!(build_id = %self.build_id, "Watcher fell behind, dropping stream");
                self.notify(error_frame("watcher fell too far behind")).await;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(build_id = %self.build_id, error = %e, "Build event stream failed");
                self.notify(error_frame(&e.to_string())).await;
            }
        }

        if let Some(live) = self.live.take() {
            self.hub.unsubscribe(self.build_id, live);
        }
    }

    async fn pump(&mut self) -> DbResult<Flow> {
        let flow = self.catch_up().await?;
        if flow != Flow::Continue {
            return Ok(flow);
        }

        let mut poll = tokio::time::interval(self.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        poll.reset();

        loop {
            let step = tokio::select! {
                biased;
                _ = self.drain.cancelled() => Step::Drain,
                _ = self.tx.closed() => Step::ClientGone,
                received = recv(&mut self.live) => Step::Live(received),
                _ = poll.tick() => Step::Poll,
            };

            let flow = match step {
                Step::Drain => Flow::Drained,
                Step::ClientGone => {
                    debug!(build_id = %self.build_id, "Watcher disconnected");
                    Flow::Finished
                }
                Step::Live(Ok(event)) => self.deliver_live(event).await?,
                Step::Live(Err(broadcast::error::RecvError::Lagged(skipped))) => {
                    debug!(build_id = %self.build_id, skipped, "Watcher lagged the writer");
                    Flow::Behind
                }
                Step::Live(Err(broadcast::error::RecvError::Closed)) => {
                    self.live = None;
                    self.poll().await?
                }
                Step::Poll => self.poll().await?,
            };

            if flow != Flow::Continue {
                return Ok(flow);
            }
        }
    }

    fn next_id(&self) -> u64 {
        self.last.map_or(0, |last| last + 1)
    }

    async fn deliver_live(&mut self, event: BuildEvent) -> DbResult<Flow> {
        let next = self.next_id();
        if event.event_id < next {
            return Ok(Flow::Continue);
        }
        if event.event_id > next {
            // Something was appended elsewhere or published out of order.
            return self.catch_up().await;
        }
        let flow = self.offer(event_frame(&event)).await;
        Ok(self.delivered(&event, flow).await)
    }

    /// Deliver everything in storage after the last delivered id.
    async fn catch_up(&mut self) -> DbResult<Flow> {
        let stored = self.events.events_since(self.build_id, self.last).await?;
        for event in &stored {
            let flow = self.send(event_frame(event)).await;
            let flow = self.delivered(event, flow).await;
            if flow != Flow::Continue {
                return Ok(flow);
            }
        }
        Ok(Flow::Continue)
    }

    /// Catch up, then end the stream if the build finished without a
    /// terminal event reaching us.
    async fn poll(&mut self) -> DbResult<Flow> {
        let flow = self.catch_up().await?;
        if flow != Flow::Continue {
            return Ok(flow);
        }
        let build = self.builds.get_build(self.build_id).await?;
        if !build.is_terminal() {
            return Ok(Flow::Continue);
        }
        match self.catch_up().await? {
            Flow::Continue => Ok(finish(self.send(end_frame(build.status)).await)),
            other => Ok(other),
        }
    }

    /// Account for an event whose frame was just handed to the client.
    async fn delivered(&mut self, event: &BuildEvent, flow: Flow) -> Flow {
        if flow != Flow::Continue {
            return flow;
        }
        self.last = Some(event.event_id);
        match event.payload.terminal_status() {
            Some(status) => finish(self.send(end_frame(status)).await),
            None => Flow::Continue,
        }
    }

    /// Queue a frame, waiting for room as long as the node is not draining.
    async fn send(&self, frame: Event) -> Flow {
        tokio::select! {
            biased;
            _ = self.drain.cancelled() => Flow::Drained,
            sent = self.tx.send(Ok(frame)) => match sent {
                Ok(()) => Flow::Continue,
                Err(_) => Flow::Finished,
            },
        }
    }

    /// Queue a live frame. A buffer that stays full for `stall_timeout`
    /// means the client stopped keeping up.
    async fn offer(&self, frame: Event) -> Flow {
        let frame = match self.tx.try_send(Ok(frame)) {
            Ok(()) => return Flow::Continue,
            Err(mpsc::error::TrySendError::Closed(_)) => return Flow::Finished,
            Err(mpsc::error::TrySendError::Full(frame)) => frame,
        };
        tokio::select! {
            biased;
            _ = self.drain.cancelled() => Flow::Drained,
            sent = tokio::time::timeout(self.stall_timeout, self.tx.send(frame)) => match sent {
                Ok(Ok(())) => Flow::Continue,
                Ok(Err(_)) => Flow::Finished,
                Err(_) => Flow::Behind,
            },
        }
    }

    /// Best-effort last frame before the stream closes.
    async fn notify(&self, frame: Event) {
        let _ = tokio::time::timeout(self.stall_timeout, self.tx.send(Ok(frame))).await;
    }
}

/// The end marker completes the stream unless sending it was cut short.
fn finish(flow: Flow) -> Flow {
    match flow {
        Flow::Continue => Flow::Finished,
        other => other,
    }
}

async fn recv(
    live: &mut Option<broadcast::Receiver<BuildEvent>>,
) -> Result<BuildEvent, broadcast::error::RecvError> {
    match live {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
