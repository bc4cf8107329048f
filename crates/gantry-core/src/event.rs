//! Build events.

use crate::build::BuildStatus;
use crate::id::BuildId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What happened in a build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum EventPayload {
    /// A chunk of output from a step.
    Log { origin: String, payload: String },
    /// The build moved to a new status.
    Status { status: BuildStatus },
    /// An error that is not attributable to a step.
    Error { message: String },
}

impl EventPayload {
    /// The terminal status carried by this payload, if any.
    pub fn terminal_status(&self) -> Option<BuildStatus> {
        match self {
            EventPayload::Status { status } if status.is_terminal() => Some(*status),
            _ => None,
        }
    }
}

/// An entry in a build's append-only event log.
///
/// `event_id` starts at 0 and increases by one per event with no gaps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildEvent {
    pub build_id: BuildId,
    pub event_id: u64,
    pub time: DateTime<Utc>,
    pub payload: EventPayload,
}

impl BuildEvent {
    pub fn is_terminal(&self) -> bool {
        self.payload.terminal_status().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_json_shape() {
        let payload = EventPayload::Status {
            status: BuildStatus::Succeeded,
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"type": "status", "data": {"status": "succeeded"}})
        );
    }

    #[test]
    fn test_terminal_status() {
        let done = EventPayload::Status {
            status: BuildStatus::Failed,
        };
        let running = EventPayload::Status {
            status: BuildStatus::Running,
        };
        let log = EventPayload::Log {
            origin: "test".to_string(),
            payload: "ok\n".to_string(),
        };
        assert_eq!(done.terminal_status(), Some(BuildStatus::Failed));
        assert_eq!(running.terminal_status(), None);
        assert_eq!(log.terminal_status(), None);
    }
}
