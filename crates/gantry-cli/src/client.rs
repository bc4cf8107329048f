//! HTTP client for the Gantry API.

use anyhow::{Context, Result, bail};
use reqwest::{Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use std::str::FromStr;
use url::Url;

/// A job addressed as `team/pipeline/job`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRef {
    pub team: String,
    pub pipeline: String,
    pub job: String,
}

impl JobRef {
    pub fn path(&self) -> String {
        format!(
            "api/v1/teams/{}/pipelines/{}/jobs/{}",
            self.team, self.pipeline, self.job
        )
    }
}

impl FromStr for JobRef {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('/').collect();
        match parts.as_slice() {
            [team, pipeline, job] if parts.iter().all(|p| !p.is_empty()) => Ok(Self {
                team: team.to_string(),
                pipeline: pipeline.to_string(),
                job: job.to_string(),
            }),
            _ => Err(format!("expected team/pipeline/job, got '{}'", s)),
        }
    }
}

impl std::fmt::Display for JobRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.team, self.pipeline, self.job)
    }
}

pub struct ApiClient {
    base: Url,
    token: Option<String>,
    http: reqwest::Client,
}

impl ApiClient {
    pub fn new(api_url: &str, token: Option<String>) -> Result<Self> {
        let mut base =
            Url::parse(api_url).with_context(|| format!("Invalid API URL: {}", api_url))?;
        if !base.path().ends_with('/') {
            base.set_path(&format!("{}/", base.path()));
        }
        Ok(Self {
            base,
            token,
            http: reqwest::Client::new(),
        })
    }

    pub fn request(&self, method: Method, path: &str) -> Result<RequestBuilder> {
        let url = self.base.join(path)?;
        let request = self.http.request(method, url);
        Ok(match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        })
    }

    /// Send and decode a JSON response, turning API errors into messages.
    pub async fn json<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T> {
        let response = Self::check(request.send().await?).await?;
        Ok(response.json().await?)
    }

    /// Fail with the API's error message on non-success statuses.
    pub async fn check(response: Response) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<serde_json::Value>(&body)
            .ok()
            .and_then(|v| v["error"].as_str().map(String::from))
            .unwrap_or(body);
        bail!("{}: {}", status, message)
    }
}

/// One server-sent event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseFrame {
    pub event: String,
    pub id: Option<String>,
    pub data: String,
}

/// Incremental parser for a server-sent event byte stream.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: Vec<u8>,
}

impl SseParser {
    /// Feed a chunk, returning every frame it completed.
    ///
    /// Bytes are buffered until a blank line, so multi-byte characters
    /// split across chunks decode intact.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buffer.extend_from_slice(chunk);

        let mut frames = Vec::new();
        while let Some(end) = self.buffer.windows(2).position(|w| w == b"\n\n") {
            let block: Vec<u8> = self.buffer.drain(..end + 2).collect();
            if let Some(frame) = parse_block(&String::from_utf8_lossy(&block)) {
                frames.push(frame);
            }
        }
        frames
    }
}

fn parse_block(block: &str) -> Option<SseFrame> {
    let mut frame = SseFrame {
        event: "message".to_string(),
        ..SseFrame::default()
    };
    let mut seen = false;
    for line in block.lines() {
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
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_ref() {
        let job: JobRef = "main/release/deploy".parse().unwrap();
        assert_eq!(job.path(), "api/v1/teams/main/pipelines/release/jobs/deploy");
        assert_eq!(job.to_string(), "main/release/deploy");
        assert!("main/release".parse::<JobRef>().is_err());
        assert!("main//deploy".parse::<JobRef>().is_err());
    }

    #[test]
    fn test_base_url_keeps_prefix() {
        let client = ApiClient::new("https://ci.example.com/gantry", None).unwrap();
        let request = client
            .request(Method::GET, "api/v1/builds/1")
            .unwrap()
            .build()
            .unwrap();
        assert_eq!(
            request.url().as_str(),
            "https://ci.example.com/gantry/api/v1/builds/1"
        );
    }

    #[test]
    fn test_parser_handles_split_chunks() {
        let mut parser = SseParser::default();
        assert!(parser.push(b"id: 0\nevent: ev").is_empty());

        let frames = parser.push(b"ent\ndata: {\"a\":1}\n\n:\n\nevent: end\ndata: x\n\n");
        assert_eq!(
            frames,
            vec![
                SseFrame {
                    event: "event".to_string(),
                    id: Some("0".to_string()),
                    data: "{\"a\":1}".to_string(),
                },
                SseFrame {
                    event: "end".to_string(),
                    id: None,
                    data: "x".to_string(),
                },
            ]
        );
    }
}
