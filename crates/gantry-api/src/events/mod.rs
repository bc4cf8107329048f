//! Build event recording and delivery.

pub mod hub;
pub mod sse;
pub mod tracker;

pub use hub::EventHub;
pub use sse::{EventHandler, EventHandlerFactory, SseEventHandlerFactory};
pub use tracker::{BuildTracker, TrackError, TrackingEngine};
