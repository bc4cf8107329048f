//! Cluster-wide build admission loop.

use crate::engine::BuildEngine;
use crate::error::SchedulerResult;
use crate::job_service::{Admission, JobService};
use gantry_config::SchedulerConfig;
use gantry_core::{Build, BuildId, Job, LockKey};
use gantry_db::{BuildRepo, JobRepo, LockManager, try_acquire_all};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Result of scheduling a single job.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    /// Builds moved from pending to started and handed to the engine.
    Started(Vec<Build>),
    /// A serial-group lock is held elsewhere; retry next pass.
    Contended,
    /// Something in the job's serial groups is already running.
    Blocked,
    /// Nothing pending.
    Idle,
    /// An older build of a sibling job goes first.
    Waiting,
    /// The build stopped being pending before we could start it.
    LostRace,
}

/// Summary of one scheduling pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
    pub started: Vec<BuildId>,
    pub contended: usize,
    pub blocked: usize,
    pub idle: usize,
    pub waiting: usize,
    pub lost_races: usize,
    pub failed: usize,
}

impl PassReport {
    fn record(&mut self, outcome: &JobOutcome) {
        match outcome {
            JobOutcome::Started(builds) => self.started.extend(builds.iter().map(|b| b.id)),
            JobOutcome::Contended => self.contended += 1,
            JobOutcome::Blocked => self.blocked += 1,
            JobOutcome::Idle => self.idle += 1,
            JobOutcome::Waiting => self.waiting += 1,
            JobOutcome::LostRace => self.lost_races += 1,
        }
    }
}

/// Starts pending builds while honoring serial groups.
pub struct Scheduler {
    jobs: Arc<dyn JobRepo>,
    builds: Arc<dyn BuildRepo>,
    locks: Arc<dyn LockManager>,
    engine: Arc<dyn BuildEngine>,
    /// Peer URL recorded as the owner of builds this node starts.
    owner_url: String,
    /// Serializes passes within this process.
    pass_guard: Mutex<()>,
}

impl Scheduler {
    pub fn new(
        jobs: Arc<dyn JobRepo>,
        builds: Arc<dyn BuildRepo>,
        locks: Arc<dyn LockManager>,
        engine: Arc<dyn BuildEngine>,
        owner_url: impl Into<String>,
    ) -> Self {
        Self {
            jobs,
            builds,
            locks,
            engine,
            owner_url: owner_url.into(),
            pass_guard: Mutex::new(()),
        }
    }

    /// Run one scheduling pass over every unpaused job.
    ///
    /// A failure while scheduling one job is logged and counted; the pass
    /// moves on to the next job.
    pub async fn run_pass(&self) -> SchedulerResult<PassReport> {
        let _guard = self.pass_guard.lock().await;
        let jobs = self.jobs.schedulable_jobs().await?;

        let mut report = PassReport::default();
        for job in jobs.iter().filter(|j| j.is_schedulable()) {
            match self.schedule_job(job).await {
                Ok(outcome) => report.record(&outcome),
                Err(e) => {
                    warn!(
                        team = %job.team_name,
                        pipeline = %job.pipeline_name,
                        job = %job.name,
                        error = %e,
                        "Failed to schedule job"
                    );
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }

    /// Admit at most what the job's in-flight policy allows.
    ///
    /// A job in a configured serial group is exclusive whatever its policy.
    pub async fn schedule_job(&self, job: &Job) -> SchedulerResult<JobOutcome> {
        let outcome = if job.is_unconstrained() {
            self.schedule_unconstrained(job).await?
        } else {
            self.schedule_serial(job).await?
        };

        // Locks are released by now; hand-off happens outside them.
        if let JobOutcome::Started(builds) = &outcome {
            for build in builds {
                info!(
                    build_id = %build.id,
                    job = %job.name,
                    build = %build.name,
                    "Started build"
                );
                self.engine.start(build.clone()).await;
            }
        }
        Ok(outcome)
    }

    async fn schedule_serial(&self, job: &Job) -> SchedulerResult<JobOutcome> {
        let keys: Vec<LockKey> = job
            .effective_serial_groups()
            .iter()
            .map(|group| LockKey::serial_group(job.pipeline_id, group))
            .collect();

        let Some(locks) = try_acquire_all(self.locks.as_ref(), &keys).await? else {
            debug!(job = %job.name, "Serial group locks held elsewhere, skipping");
            return Ok(JobOutcome::Contended);
        };

        let decision = self.decide(job).await;
        locks.release(self.locks.as_ref()).await;
        decision
    }

    async fn decide(&self, job: &Job) -> SchedulerResult<JobOutcome> {
        let service = JobService::new(job, self.builds.as_ref());
        match service.admission().await? {
            Admission::Blocked { running } => {
                debug!(job = %job.name, ?running, "Serial group busy");
                Ok(JobOutcome::Blocked)
            }
            Admission::Idle => Ok(JobOutcome::Idle),
            Admission::Waiting { next } => {
                debug!(job = %job.name, next = %next, "Waiting for sibling build");
                Ok(JobOutcome::Waiting)
            }
            Admission::Ready(build) => self.start(job, build).await.map(|started| match started {
                Some(build) => JobOutcome::Started(vec![build]),
                None => JobOutcome::LostRace,
            }),
        }
    }

    async fn schedule_unconstrained(&self, job: &Job) -> SchedulerResult<JobOutcome> {
        let pending = self.builds.pending_builds(job.id).await?;
        if pending.is_empty() {
            return Ok(JobOutcome::Idle);
        }

        let mut started = Vec::new();
        for build in pending {
            if let Some(build) = self.start(job, build).await? {
                started.push(build);
            }
        }

        if started.is_empty() {
            Ok(JobOutcome::LostRace)
        } else {
            Ok(JobOutcome::Started(started))
        }
    }

    async fn start(&self, job: &Job, build: Build) -> SchedulerResult<Option<Build>> {
        let started = self.builds.start_build(build.id, &self.owner_url).await?;
        if started.is_none() {
            debug!(job = %job.name, build_id = %build.id, "Build no longer pending");
        }
        Ok(started)
    }

    /// Keep this node's lock session alive and reap dead ones.
    async fn maintain_sessions(&self, ttl: Duration) {
        if let Err(e) = self.locks.heartbeat().await {
            warn!(error = %e, "Failed to heartbeat lock session");
        }
        match self.locks.reap_stale_sessions(ttl).await {
            Ok(0) => {}
            Ok(reaped) => info!(reaped, "Reaped stale lock sessions"),
            Err(e) => warn!(error = %e, "Failed to reap stale lock sessions"),
        }
    }

    /// Run passes on every tick and trigger until `drain` fires.
    pub async fn run(
        &self,
        config: SchedulerConfig,
        trigger: Arc<Notify>,
        drain: CancellationToken,
    ) {
        info!(owner = %self.owner_url, interval = ?config.interval, "Starting scheduler");

        let mut ticker = tokio::time::interval(config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = drain.cancelled() => {
                    info!("Scheduler stopping, node is draining");
                    break;
                }
                _ = ticker.tick() => {
                    self.maintain_sessions(config.session_ttl).await;
                }
                _ = trigger.notified() => {}
            }

            match self.run_pass().await {
                Ok(report) if !report.started.is_empty() || report.failed > 0 => {
                    info!(
                        started = ?report.started,
                        failed = report.failed,
                        contended = report.contended,
                        "Scheduling pass finished"
                    );
                }
                Ok(report) => debug!(?report, "Scheduling pass finished"),
                Err(e) => warn!(error = %e, "Scheduling pass failed"),
            }
        }
    }
}
