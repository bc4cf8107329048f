//! Per-job admission decisions.

use gantry_core::{Build, BuildId, Job};
use gantry_db::{BuildRepo, DbResult};

/// What a job may do right now with respect to its serial groups.
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    /// Builds in the job's groups are already started or running.
    Blocked { running: Vec<BuildId> },
    /// No pending build anywhere in the job's groups.
    Idle,
    /// The oldest pending build in the groups belongs to another job.
    Waiting { next: BuildId },
    /// This job's build is next and nothing in its groups is running.
    Ready(Build),
}

/// Serial-group queries scoped to one job.
pub struct JobService<'a> {
    job: &'a Job,
    builds: &'a dyn BuildRepo,
    groups: Vec<String>,
}

impl<'a> JobService<'a> {
    pub fn new(job: &'a Job, builds: &'a dyn BuildRepo) -> Self {
        Self {
            job,
            builds,
            groups: job.effective_serial_groups(),
        }
    }

    pub fn serial_groups(&self) -> &[String] {
        &self.groups
    }

    /// Started or running builds of any job sharing a group with this one.
    pub async fn running_builds_in_serial_groups(&self) -> DbResult<Vec<Build>> {
        self.builds
            .running_builds_in_serial_groups(self.job.pipeline_id, &self.groups)
            .await
    }

    /// The oldest pending build across every job in this job's groups.
    pub async fn next_pending_build_in_serial_groups(&self) -> DbResult<Option<Build>> {
        self.builds
            .next_pending_build_in_serial_groups(self.job.pipeline_id, &self.groups)
            .await
    }

    /// Decide admission. Callers hold the locks for [`Self::serial_groups`].
    pub async fn admission(&self) -> DbResult<Admission> {
        let running = self.running_builds_in_serial_groups().await?;
        if !running.is_empty() {
            return Ok(Admission::Blocked {
                running: running.iter().map(|b| b.id).collect(),
            });
        }

        let Some(next) = self.next_pending_build_in_serial_groups().await? else {
            return Ok(Admission::Idle);
        };

        // A sibling's build may belong to groups we do not hold locks for;
        // its own job starts it.
        if next.job_id != self.job.id {
            return Ok(Admission::Waiting { next: next.id });
        }

        Ok(Admission::Ready(next))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_core::{BuildStatus, InFlightPolicy};
    use gantry_db::MemoryStore;

    struct Fixture {
        store: MemoryStore,
        deploy_a: Job,
        deploy_b: Job,
    }

    fn fixture() -> Fixture {
        let store = MemoryStore::new();
        let team = store.add_team("main");
        let pipeline = store.add_pipeline(team.id, "release").unwrap();
        let deploy_a = store
            .add_job(pipeline.id, "deploy-a", &["prod"], InFlightPolicy::Serial)
            .unwrap();
        let deploy_b = store
            .add_job(pipeline.id, "deploy-b", &["prod"], InFlightPolicy::Serial)
            .unwrap();
        Fixture {
            store,
            deploy_a,
            deploy_b,
        }
    }

    #[tokio::test]
    async fn test_idle_without_pending_builds() {
        let f = fixture();
        let service = JobService::new(&f.deploy_a, &f.store);
        assert_eq!(service.admission().await.unwrap(), Admission::Idle);
        assert!(service.next_pending_build_in_serial_groups().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_ready_when_own_build_is_oldest() {
        let f = fixture();
        let build = f.store.create_build(f.deploy_a.id).await.unwrap();
        f.store.create_build(f.deploy_b.id).await.unwrap();

        let service = JobService::new(&f.deploy_a, &f.store);
        match service.admission().await.unwrap() {
            Admission::Ready(ready) => assert_eq!(ready.id, build.id),
            other => panic!("Expected Ready, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_waits_for_older_sibling_build() {
        let f = fixture();
        let older = f.store.create_build(f.deploy_a.id).await.unwrap();
        f.store.create_build(f.deploy_b.id).await.unwrap();

        let service = JobService::new(&f.deploy_b, &f.store);
        assert_eq!(
            service.admission().await.unwrap(),
            Admission::Waiting { next: older.id }
        );
    }

    #[tokio::test]
    async fn test_blocked_by_running_sibling() {
        let f = fixture();
        let running = f.store.create_build(f.deploy_a.id).await.unwrap();
        f.store.start_build(running.id, "http://a").await.unwrap();
        f.store
            .transition_build(running.id, BuildStatus::Running)
            .await
            .unwrap();
        f.store.create_build(f.deploy_b.id).await.unwrap();

        let service = JobService::new(&f.deploy_b, &f.store);
        assert_eq!(
            service.admission().await.unwrap(),
            Admission::Blocked {
                running: vec![running.id]
            }
        );
    }
}
