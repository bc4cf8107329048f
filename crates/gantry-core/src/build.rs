//! Builds and their status machine.

use crate::id::{BuildId, ResourceId};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle state of a build.
///
/// Transitions only move forward:
/// `pending -> started -> running -> {succeeded, failed, errored, aborted}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    Pending,
    Started,
    Running,
    Succeeded,
    Failed,
    Errored,
    Aborted,
}

impl BuildStatus {
    pub const ALL: [BuildStatus; 7] = [
        BuildStatus::Pending,
        BuildStatus::Started,
        BuildStatus::Running,
        BuildStatus::Succeeded,
        BuildStatus::Failed,
        BuildStatus::Errored,
        BuildStatus::Aborted,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BuildStatus::Pending => "pending",
            BuildStatus::Started => "started",
            BuildStatus::Running => "running",
            BuildStatus::Succeeded => "succeeded",
            BuildStatus::Failed => "failed",
            BuildStatus::Errored => "errored",
            BuildStatus::Aborted => "aborted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BuildStatus::Succeeded
                | BuildStatus::Failed
                | BuildStatus::Errored
                | BuildStatus::Aborted
        )
    }

    /// Started or running: the build occupies its serial groups.
    pub fn is_active(&self) -> bool {
        matches!(self, BuildStatus::Started | BuildStatus::Running)
    }

    /// The states a build may be in for a move to `to` to be legal.
    pub fn predecessors(to: BuildStatus) -> &'static [BuildStatus] {
        match to {
            BuildStatus::Pending => &[],
            BuildStatus::Started => &[BuildStatus::Pending],
            BuildStatus::Running => &[BuildStatus::Started],
            BuildStatus::Succeeded | BuildStatus::Failed | BuildStatus::Errored => {
                &[BuildStatus::Started, BuildStatus::Running]
            }
            BuildStatus::Aborted => &[
                BuildStatus::Pending,
                BuildStatus::Started,
                BuildStatus::Running,
            ],
        }
    }

    pub fn can_transition_to(&self, to: BuildStatus) -> bool {
        Self::predecessors(to).contains(self)
    }
}

impl fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BuildStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        BuildStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| Error::UnknownValue {
                kind: "build status",
                value: s.to_string(),
            })
    }
}

/// A single execution of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Build {
    pub id: BuildId,
    /// Build number within the job.
    pub name: String,
    pub job_id: ResourceId,
    pub job_name: String,
    pub pipeline_id: ResourceId,
    pub pipeline_name: String,
    pub team_id: ResourceId,
    pub team_name: String,
    pub status: BuildStatus,
    /// Whether the owning pipeline is publicly visible.
    pub public: bool,
    /// Peer URL of the node that started the build and emits its events.
    pub owner_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Build {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        for status in BuildStatus::ALL {
            assert_eq!(status.as_str().parse::<BuildStatus>().unwrap(), status);
        }
        assert_eq!(
            "queued".parse::<BuildStatus>(),
            Err(Error::UnknownValue {
                kind: "build status",
                value: "queued".to_string(),
            })
        );
    }

    #[test]
    fn test_transitions_are_monotonic() {
        use BuildStatus::*;

        assert!(Pending.can_transition_to(Started));
        assert!(Started.can_transition_to(Running));
        assert!(Running.can_transition_to(Succeeded));
        assert!(Started.can_transition_to(Errored));
        assert!(Pending.can_transition_to(Aborted));

        assert!(!Started.can_transition_to(Pending));
        assert!(!Running.can_transition_to(Started));
        assert!(!Succeeded.can_transition_to(Running));
        assert!(!Aborted.can_transition_to(Failed));
        assert!(!Pending.can_transition_to(Running));
    }

    #[test]
    fn test_active_and_terminal() {
        assert!(BuildStatus::Started.is_active());
        assert!(BuildStatus::Running.is_active());
        assert!(!BuildStatus::Pending.is_active());
        assert!(BuildStatus::Errored.is_terminal());
        assert!(!BuildStatus::Running.is_terminal());
    }
}
