//! Node configuration parsing.
//!
//! ```kdl
//! node {
//!     listen "0.0.0.0:8080"
//!     external-url "https://ci.example.com"
//!     peer-url "http://10.0.4.12:8080"
//! }
//!
//! database "postgres://gantry@db/gantry" max-connections=10
//!
//! scheduler interval-ms=10000 session-ttl-secs=60
//!
//! streams subscriber-buffer=256 connection-buffer=64 poll-interval-ms=1000 stall-timeout-ms=5000
//!
//! auth {
//!     token "s3cret"
//! }
//! ```
//!
//! Every section is optional; settings may be given either as properties
//! (`interval-ms=500`) or as child nodes (`interval-ms 500`).

use crate::{ConfigError, ConfigResult};
use kdl::{KdlDocument, KdlNode};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use url::Url;

/// Configuration of a single cluster node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Address the HTTP server binds to.
    pub listen: SocketAddr,
    /// URL clients use to reach the cluster.
    pub external_url: Url,
    /// URL peers use to reach this node directly.
    pub peer_url: Url,
    /// Shared storage. Without it the node runs on an in-process store.
    pub database: Option<DatabaseConfig>,
    pub scheduler: SchedulerConfig,
    pub streams: StreamConfig,
    pub auth: AuthConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Time between periodic scheduling passes.
    pub interval: Duration,
    /// Lock sessions without a heartbeat for this long are reaped.
    pub session_ttl: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            session_ttl: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Events a watcher may fall behind the writer before it is dropped.
    pub subscriber_buffer: usize,
    /// Encoded events buffered per connection.
    pub connection_buffer: usize,
    /// How often a stream re-reads storage for events written elsewhere.
    pub poll_interval: Duration,
    /// How long a full connection buffer may stay full before the
    /// watcher is dropped.
    pub stall_timeout: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            subscriber_buffer: 256,
            connection_buffer: 64,
            poll_interval: Duration::from_secs(1),
            stall_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Accepted bearer tokens. Empty disables authentication.
    pub tokens: Vec<String>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        let listen = SocketAddr::from(([0, 0, 0, 0], 8080));
        let url = Url::parse("http://127.0.0.1:8080").expect("static URL is valid");
        Self {
            listen,
            external_url: url.clone(),
            peer_url: url,
            database: None,
            scheduler: SchedulerConfig::default(),
            streams: StreamConfig::default(),
            auth: AuthConfig::default(),
        }
    }
}

/// Read and parse a node configuration file.
pub fn load_node_config(path: impl AsRef<Path>) -> ConfigResult<NodeConfig> {
    let content = std::fs::read_to_string(path)?;
    parse_node_config(&content)
}

/// Parse a node configuration from KDL text.
pub fn parse_node_config(kdl: &str) -> ConfigResult<NodeConfig> {
    let doc: KdlDocument = kdl.parse()?;
    let mut config = NodeConfig::default();
    let mut seen = Vec::new();

    for node in doc.nodes() {
        let section = node.name().value();
        if seen.contains(&section) {
            return Err(ConfigError::Duplicate(section.to_string()));
        }
        seen.push(section);

        match section {
            "node" => parse_node_section(node, &mut config)?,
            "database" => config.database = Some(parse_database(node)?),
            "scheduler" => config.scheduler = parse_scheduler(node)?,
            "streams" => config.streams = parse_streams(node)?,
            "auth" => config.auth = parse_auth(node),
            _ => {} // Ignore unknown nodes
        }
    }

    Ok(config)
}

fn parse_node_section(node: &KdlNode, config: &mut NodeConfig) -> ConfigResult<()> {
    let mut peer_url = None;

    if let Some(listen) = get_string(node, "listen") {
        config.listen = listen
            .parse()
            .map_err(|e| ConfigError::invalid("listen", format!("{}", e)))?;
    }
    if let Some(url) = get_string(node, "external-url") {
        config.external_url = parse_http_url("external-url", &url)?;
    }
    if let Some(url) = get_string(node, "peer-url") {
        peer_url = Some(parse_http_url("peer-url", &url)?);
    }

    // Without an explicit peer URL peers reach us the way clients do.
    config.peer_url = peer_url.unwrap_or_else(|| config.external_url.clone());
    Ok(())
}

fn parse_database(node: &KdlNode) -> ConfigResult<DatabaseConfig> {
    let url = get_first_string_arg(node)
        .or_else(|| get_string(node, "url"))
        .ok_or_else(|| ConfigError::MissingField("database url".to_string()))?;
    let max_connections = match get_integer(node, "max-connections") {
        Some(n) => positive("max-connections", n)? as u32,
        None => 10,
    };
    Ok(DatabaseConfig {
        url,
        max_connections,
    })
}

fn parse_scheduler(node: &KdlNode) -> ConfigResult<SchedulerConfig> {
    let mut scheduler = SchedulerConfig::default();
    if let Some(ms) = get_integer(node, "interval-ms") {
        scheduler.interval = Duration::from_millis(positive("interval-ms", ms)?);
    }
    if let Some(secs) = get_integer(node, "session-ttl-secs") {
        scheduler.session_ttl = Duration::from_secs(positive("session-ttl-secs", secs)?);
    }
    if scheduler.session_ttl <= scheduler.interval {
        return Err(ConfigError::invalid(
            "session-ttl-secs",
            "must be longer than the scheduling interval",
        ));
    }
    Ok(scheduler)
}

fn parse_streams(node: &KdlNode) -> ConfigResult<StreamConfig> {
    let mut streams = StreamConfig::default();
    if let Some(n) = get_integer(node, "subscriber-buffer") {
        streams.subscriber_buffer = positive("subscriber-buffer", n)? as usize;
    }
    if let Some(n) = get_integer(node, "connection-buffer") {
        streams.connection_buffer = positive("connection-buffer", n)? as usize;
    }
    if let Some(ms) = get_integer(node, "poll-interval-ms") {
        streams.poll_interval = Duration::from_millis(positive("poll-interval-ms", ms)?);
    }
    if let Some(ms) = get_integer(node, "stall-timeout-ms") {
        streams.stall_timeout = Duration::from_millis(positive("stall-timeout-ms", ms)?);
    }
    Ok(streams)
}

fn parse_auth(node: &KdlNode) -> AuthConfig {
    let mut tokens = Vec::new();
    if let Some(children) = node.children() {
        for child in children.nodes() {
            if child.name().value() == "token" {
                tokens.extend(get_all_string_args(child));
            }
        }
    }
    AuthConfig { tokens }
}

fn parse_http_url(field: &str, raw: &str) -> ConfigResult<Url> {
    let url = Url::parse(raw).map_err(|e| ConfigError::invalid(field, e.to_string()))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(ConfigError::invalid(
            field,
            format!("unsupported scheme: {}", other),
        )),
    }
}

fn positive(field: &str, value: i128) -> ConfigResult<u64> {
    if value <= 0 {
        return Err(ConfigError::invalid(field, "must be greater than zero"));
    }
    u64::try_from(value).map_err(|_| ConfigError::invalid(field, "value too large"))
}

// Helper functions for extracting values from KDL nodes

fn get_first_string_arg(node: &KdlNode) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}

fn get_all_string_args(node: &KdlNode) -> Vec<String> {
    node.entries()
        .iter()
        .filter(|e| e.name().is_none())
        .filter_map(|e| e.value().as_string())
        .map(|s| s.to_string())
        .collect()
}

fn find_child<'a>(node: &'a KdlNode, name: &str) -> Option<&'a KdlNode> {
    node.children()?
        .nodes()
        .iter()
        .find(|child| child.name().value() == name)
}

fn get_string(node: &KdlNode, name: &str) -> Option<String> {
    node.get(name)
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
        .or_else(|| find_child(node, name).and_then(get_first_string_arg))
}

fn get_integer(node: &KdlNode, name: &str) -> Option<i128> {
    node.get(name).and_then(|v| v.as_integer()).or_else(|| {
        find_child(node, name)?
            .entries()
            .iter()
            .find(|e| e.name().is_none())
            .and_then(|e| e.value().as_integer())
    })
}
