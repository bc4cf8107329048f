//! Build commands.

use crate::client::{ApiClient, JobRef, SseParser};
use anyhow::{Result, bail};
use futures::StreamExt;
use gantry_core::{Build, BuildEvent, BuildStatus, EventPayload};
use reqwest::header::ACCEPT;
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

const MAX_RECONNECTS: u32 = 5;
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

pub async fn trigger(client: &ApiClient, job: &JobRef, watch_build: bool) -> Result<()> {
    let request = client.request(Method::POST, &format!("{}/builds", job.path()))?;
    let build: Build = client.json(request).await?;
    println!("Triggered {} #{} (build {})", job, build.name, build.id);

    if watch_build {
        watch(client, build.id.get(), None).await?;
    }
    Ok(())
}

pub async fn list(client: &ApiClient, job: &JobRef, limit: u32) -> Result<()> {
    let request = client
        .request(Method::GET, &format!("{}/builds", job.path()))?
        .query(&[("limit", limit)]);
    let builds: Vec<Build> = client.json(request).await?;

    if builds.is_empty() {
        println!("No builds for {}", job);
        return Ok(());
    }

    println!("{:<8} {:<6} {:<10} {:<25}", "ID", "NAME", "STATUS", "CREATED");
    for build in builds {
        println!(
            "{:<8} {:<6} {:<10} {:<25}",
            build.id,
            build.name,
            build.status,
            build.created_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    Ok(())
}

pub async fn show(client: &ApiClient, id: i64) -> Result<()> {
    let request = client.request(Method::GET, &format!("api/v1/builds/{}", id))?;
    let build: Build = client.json(request).await?;

    println!(
        "Build {} ({}/{}/{} #{})",
        build.id, build.team_name, build.pipeline_name, build.job_name, build.name
    );
    println!("  status:   {}", build.status);
    println!("  created:  {}", build.created_at);
    if let Some(started) = build.started_at {
        println!("  started:  {}", started);
    }
    if let Some(finished) = build.finished_at {
        println!("  finished: {}", finished);
    }
    if let Some(owner) = &build.owner_url {
        println!("  owner:    {}", owner);
    }
    Ok(())
}

pub async fn abort(client: &ApiClient, id: i64) -> Result<()> {
    let request = client.request(Method::PUT, &format!("api/v1/builds/{}/abort", id))?;
    let build: Build = client.json(request).await?;
    println!("Build {} {}", build.id, build.status);
    Ok(())
}

/// How one connection to the event stream ended.
enum StreamEnd {
    Finished(BuildStatus),
    /// The stream stopped early; reconnecting resumes after the last event.
    Interrupted(String),
}

#[derive(Deserialize)]
struct EndMarker {
    status: BuildStatus,
}

/// Follow a build's events, reconnecting when the serving node drains.
pub async fn watch(client: &ApiClient, id: i64, since: Option<u64>) -> Result<()> {
    let mut last = since;
    let mut attempts = 0;

    loop {
        let mut request = client
            .request(Method::GET, &format!("api/v1/builds/{}/events", id))?
            .header(ACCEPT, "text/event-stream");
        if let Some(last) = last {
            request = request.header("Last-Event-ID", last.to_string());
        }

        let before = last;
        let end = match request.send().await {
            Ok(response) if response.status() == StatusCode::SERVICE_UNAVAILABLE => {
                StreamEnd::Interrupted("node is draining".to_string())
            }
            Ok(response) => follow(ApiClient::check(response).await?, &mut last).await?,
            Err(e) => StreamEnd::Interrupted(e.to_string()),
        };

        match end {
            StreamEnd::Finished(BuildStatus::Succeeded) => {
                println!("Build {} succeeded", id);
                return Ok(());
            }
            StreamEnd::Finished(status) => bail!("Build {} {}", id, status),
            StreamEnd::Interrupted(reason) => {
                if last != before {
                    attempts = 0;
                }
                attempts += 1;
                if attempts > MAX_RECONNECTS {
                    bail!("Gave up watching build {}: {}", id, reason);
                }
                warn!(build_id = id, reason = %reason, attempt = attempts, "Stream interrupted, reconnecting");
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
    }
}

async fn follow(response: reqwest::Response, last: &mut Option<u64>) -> Result<StreamEnd> {
    let mut parser = SseParser::default();
    let mut body = response.bytes_stream();

    while let Some(chunk) = body.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => return Ok(StreamEnd::Interrupted(e.to_string())),
        };

        for frame in parser.push(&chunk) {
            match frame.event.as_str() {
                "event" => {
                    let event: BuildEvent = serde_json::from_str(&frame.data)?;
                    *last = Some(event.event_id);
                    print_event(&event);
                }
                "end" => {
                    let end: EndMarker = serde_json::from_str(&frame.data)?;
                    return Ok(StreamEnd::Finished(end.status));
                }
                "draining" => return Ok(StreamEnd::Interrupted(frame.data)),
                "error" => return Ok(StreamEnd::Interrupted(frame.data)),
                other => debug!(event = other, "Ignoring unknown stream event"),
            }
        }
    }

    Ok(StreamEnd::Interrupted("stream closed".to_string()))
}

fn print_event(event: &BuildEvent) {
    match &event.payload {
        EventPayload::Log { payload, .. } => print!("{}", payload),
        EventPayload::Status { status } => println!("--- {} ---", status),
        EventPayload::Error { message } => eprintln!("error: {}", message),
    }
}
