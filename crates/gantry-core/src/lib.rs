//! Core domain types for the Gantry build scheduler.
//!
//! This crate contains:
//! - Resource and build identifiers
//! - Teams, pipelines, jobs and their serial-group membership
//! - Builds and the monotonic build status machine
//! - Build events
//! - Advisory lock keys

pub mod build;
pub mod error;
pub mod event;
pub mod id;
pub mod job;
pub mod lock;

pub use build::{Build, BuildStatus};
pub use error::{Error, Result};
pub use event::{BuildEvent, EventPayload};
pub use id::{BuildId, ResourceId};
pub use job::{InFlightPolicy, Job, Pipeline, SINGLETON_GROUP_PREFIX, Team, validate_serial_group};
pub use lock::LockKey;
