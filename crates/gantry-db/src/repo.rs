//! Repository traits and implementations.

pub mod build;
pub mod event;
pub mod job;

pub use build::{BuildRepo, PgBuildRepo};
pub use event::{EventRepo, PgEventRepo};
pub use job::{JobRepo, PgJobRepo};
