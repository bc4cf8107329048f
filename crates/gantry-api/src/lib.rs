//! API server for Gantry.
//!
//! Serves the build and job REST API and streams build events to watchers
//! over server-sent events, proxying to the node that owns a running build.

pub mod auth;
pub mod buildserver;
pub mod drain;
pub mod error;
pub mod events;
pub mod routes;
pub mod state;

#[cfg(test)]
pub(crate) mod testing;

pub use buildserver::BuildEventServer;
pub use state::{AppState, Storage};
