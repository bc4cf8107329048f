//! Build admission for Gantry.
//!
//! Every node runs the same scheduling pass. There is no leader: serial
//! groups are protected by advisory locks in shared storage, and the
//! pending to started transition is a conditional write.

pub mod engine;
pub mod error;
pub mod job_service;
pub mod scheduler;

pub use engine::BuildEngine;
pub use error::{SchedulerError, SchedulerResult};
pub use job_service::{Admission, JobService};
pub use scheduler::{JobOutcome, PassReport, Scheduler};
