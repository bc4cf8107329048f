//! KDL configuration parsing for Gantry nodes.
//!
//! A node reads a single `gantry.kdl` describing how it is addressed by
//! clients and peers, where shared storage lives, and how its scheduler
//! and event streams are tuned.

pub mod error;
pub mod node;

pub use error::{ConfigError, ConfigResult};
pub use node::{
    AuthConfig, DatabaseConfig, NodeConfig, SchedulerConfig, StreamConfig, load_node_config,
    parse_node_config,
};
