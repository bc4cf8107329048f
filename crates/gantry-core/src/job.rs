//! Teams, pipelines and jobs.

use crate::id::ResourceId;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Team {
    pub id: ResourceId,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pipeline {
    pub id: ResourceId,
    pub team_id: ResourceId,
    pub name: String,
    pub paused: bool,
    /// Public pipelines expose their builds to unauthenticated clients.
    pub public: bool,
}

/// Prefix of the singleton group of a job without configured groups.
///
/// Configured group names may not contain `:`, so the two never collide.
pub const SINGLETON_GROUP_PREFIX: &str = "job:";

/// How many builds of a job may be in flight at once.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InFlightPolicy {
    /// At most one active build across all of the job's serial groups.
    #[default]
    Serial,
    /// No limit on the job's own builds. Ignored once the job joins a
    /// configured serial group, which is always exclusive.
    Unconstrained,
}

impl InFlightPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            InFlightPolicy::Serial => "serial",
            InFlightPolicy::Unconstrained => "unconstrained",
        }
    }
}

impl fmt::Display for InFlightPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Check a configured serial group name.
pub fn validate_serial_group(name: &str) -> Result<()> {
    if name.is_empty() || name.contains(':') {
        return Err(Error::InvalidSerialGroup(name.to_string()));
    }
    Ok(())
}

impl FromStr for InFlightPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "serial" => Ok(InFlightPolicy::Serial),
            "unconstrained" => Ok(InFlightPolicy::Unconstrained),
            other => Err(Error::UnknownValue {
                kind: "in-flight policy",
                value: other.to_string(),
            }),
        }
    }
}

/// A job as seen by the scheduler, joined with its pipeline and team.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: ResourceId,
    pub pipeline_id: ResourceId,
    pub team_id: ResourceId,
    pub name: String,
    pub pipeline_name: String,
    pub team_name: String,
    pub paused: bool,
    pub pipeline_paused: bool,
    /// Serial groups this job belongs to, scoped to its pipeline.
    pub serial_groups: Vec<String>,
    pub in_flight: InFlightPolicy,
}

impl Job {
    /// The groups this job is serialized against.
    ///
    /// A job without configured groups is its own singleton group,
    /// `job:<name>`. The result is sorted and free of duplicates.
    pub fn effective_serial_groups(&self) -> Vec<String> {
        let mut groups = if self.serial_groups.is_empty() {
            vec![format!("{}{}", SINGLETON_GROUP_PREFIX, self.name)]
        } else {
            self.serial_groups.clone()
        };
        groups.sort();
        groups.dedup();
        groups
    }

    /// Whether builds start without taking serial-group locks.
    ///
    /// Only an unconstrained job outside every configured group qualifies;
    /// sharing a group with siblings makes it exclusive.
    pub fn is_unconstrained(&self) -> bool {
        self.in_flight == InFlightPolicy::Unconstrained && self.serial_groups.is_empty()
    }

    pub fn is_schedulable(&self) -> bool {
        !self.paused && !self.pipeline_paused
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(name: &str, groups: &[&str]) -> Job {
        Job {
            id: ResourceId::new(),
            pipeline_id: ResourceId::new(),
            team_id: ResourceId::new(),
            name: name.to_string(),
            pipeline_name: "main".to_string(),
            team_name: "core".to_string(),
            paused: false,
            pipeline_paused: false,
            serial_groups: groups.iter().map(|g| g.to_string()).collect(),
            in_flight: InFlightPolicy::Serial,
        }
    }

    #[test]
    fn test_job_without_groups_is_its_own_group() {
        assert_eq!(job("unit", &[]).effective_serial_groups(), vec!["job:unit"]);
    }

    #[test]
    fn test_singleton_group_differs_from_configured_group_of_same_name() {
        let lone = job("prod", &[]);
        let member = job("deploy", &["prod"]);
        assert_ne!(
            lone.effective_serial_groups(),
            member.effective_serial_groups()
        );
    }

    #[test]
    fn test_unconstrained_job_in_a_group_is_exclusive() {
        let mut lint = job("lint", &[]);
        lint.in_flight = InFlightPolicy::Unconstrained;
        assert!(lint.is_unconstrained());

        lint.serial_groups = vec!["prod".to_string()];
        assert!(!lint.is_unconstrained());
    }

    #[test]
    fn test_group_names_reject_separator() {
        assert!(validate_serial_group("prod").is_ok());
        assert!(validate_serial_group("job:prod").is_err());
        assert!(validate_serial_group("").is_err());
    }

    #[test]
    fn test_effective_groups_are_sorted_and_unique() {
        let job = job("deploy", &["staging", "prod", "staging"]);
        assert_eq!(job.effective_serial_groups(), vec!["prod", "staging"]);
    }

    #[test]
    fn test_paused_pipeline_is_not_schedulable() {
        let mut job = job("unit", &[]);
        assert!(job.is_schedulable());
        job.pipeline_paused = true;
        assert!(!job.is_schedulable());
    }

    #[test]
    fn test_in_flight_policy_parse() {
        assert_eq!(
            "unconstrained".parse::<InFlightPolicy>().unwrap(),
            InFlightPolicy::Unconstrained
        );
        assert!("parallel".parse::<InFlightPolicy>().is_err());
    }
}
