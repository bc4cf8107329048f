//! In-process storage.
//!
//! Implements every repository and the lock manager on a shared
//! mutex-guarded state. Used by tests and by nodes started without a
//! database, where the "cluster" is a single process.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gantry_core::{
    Build, BuildEvent, BuildId, BuildStatus, EventPayload, InFlightPolicy, Job, LockKey, Pipeline,
    ResourceId, Team, validate_serial_group,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use uuid::Uuid;

use crate::lock::{LockError, LockHandle, LockHolder, LockManager, LockResult};
use crate::{BuildRepo, DbError, DbResult, EventRepo, JobRepo};

#[derive(Debug, Clone)]
struct StoredJob {
    id: ResourceId,
    pipeline_id: ResourceId,
    name: String,
    paused: bool,
    serial_groups: Vec<String>,
    in_flight: InFlightPolicy,
    build_number_seq: u64,
}

#[derive(Debug, Clone)]
struct StoredBuild {
    id: BuildId,
    name: String,
    job_id: ResourceId,
    status: BuildStatus,
    owner_url: Option<String>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
struct Session {
    node: String,
    heartbeat_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct HeldLock {
    session_id: Uuid,
    acquired_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct State {
    teams: HashMap<ResourceId, Team>,
    pipelines: HashMap<ResourceId, Pipeline>,
    jobs: HashMap<ResourceId, StoredJob>,
    builds: BTreeMap<BuildId, StoredBuild>,
    events: HashMap<BuildId, Vec<BuildEvent>>,
    last_build_id: i64,
    sessions: HashMap<Uuid, Session>,
    locks: HashMap<LockKey, HeldLock>,
}

impl State {
    fn job_view(&self, job: &StoredJob) -> DbResult<Job> {
        let pipeline = self
            .pipelines
            .get(&job.pipeline_id)
            .ok_or_else(|| DbError::InvalidData(format!("job {} has no pipeline", job.id)))?;
        let team = self
            .teams
            .get(&pipeline.team_id)
            .ok_or_else(|| DbError::InvalidData(format!("pipeline {} has no team", pipeline.id)))?;
        Ok(Job {
            id: job.id,
            pipeline_id: pipeline.id,
            team_id: team.id,
            name: job.name.clone(),
            pipeline_name: pipeline.name.clone(),
            team_name: team.name.clone(),
            paused: job.paused,
            pipeline_paused: pipeline.paused,
            serial_groups: job.serial_groups.clone(),
            in_flight: job.in_flight,
        })
    }

    fn job(&self, id: ResourceId) -> DbResult<Job> {
        let job = self
            .jobs
            .get(&id)
            .ok_or_else(|| DbError::NotFound(format!("job {}", id)))?;
        self.job_view(job)
    }

    fn build_view(&self, build: &StoredBuild) -> DbResult<Build> {
        let job = self.job(build.job_id)?;
        let public = self
            .pipelines
            .get(&job.pipeline_id)
            .map(|p| p.public)
            .unwrap_or(false);
        Ok(Build {
            id: build.id,
            name: build.name.clone(),
            job_id: job.id,
            job_name: job.name,
            pipeline_id: job.pipeline_id,
            pipeline_name: job.pipeline_name,
            team_id: job.team_id,
            team_name: job.team_name,
            status: build.status,
            public,
            owner_url: build.owner_url.clone(),
            created_at: build.created_at,
            started_at: build.started_at,
            finished_at: build.finished_at,
        })
    }

    fn build(&self, id: BuildId) -> DbResult<Build> {
        let build = self
            .builds
            .get(&id)
            .ok_or_else(|| DbError::NotFound(format!("build {}", id)))?;
        self.build_view(build)
    }

    /// Builds of jobs in `groups`, oldest first, joined with their job.
    fn builds_in_groups(
        &self,
        pipeline_id: ResourceId,
        groups: &[String],
    ) -> DbResult<Vec<(Job, Build)>> {
        let mut found = Vec::new();
        for build in self.builds.values() {
            let job = self.job(build.job_id)?;
            if job.pipeline_id != pipeline_id {
                continue;
            }
            let in_group = job
                .effective_serial_groups()
                .iter()
                .any(|g| groups.contains(g));
            if in_group {
                found.push((job, self.build_view(build)?));
            }
        }
        Ok(found)
    }

    fn drop_session(&mut self, session_id: Uuid) {
        self.sessions.remove(&session_id);
        self.locks.retain(|_, held| held.session_id != session_id);
    }
}

/// In-process store shared by clones.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<State>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add_team(&self, name: &str) -> Team {
        let team = Team {
            id: ResourceId::new(),
            name: name.to_string(),
        };
        self.state().teams.insert(team.id, team.clone());
        team
    }

    pub fn add_pipeline(&self, team_id: ResourceId, name: &str) -> DbResult<Pipeline> {
        let mut state = self.state();
        if !state.teams.contains_key(&team_id) {
            return Err(DbError::NotFound(format!("team {}", team_id)));
        }
        let pipeline = Pipeline {
            id: ResourceId::new(),
            team_id,
            name: name.to_string(),
            paused: false,
            public: false,
        };
        state.pipelines.insert(pipeline.id, pipeline.clone());
        Ok(pipeline)
    }

    pub fn set_pipeline_paused(&self, pipeline_id: ResourceId, paused: bool) -> DbResult<()> {
        let mut state = self.state();
        let pipeline = state
            .pipelines
            .get_mut(&pipeline_id)
            .ok_or_else(|| DbError::NotFound(format!("pipeline {}", pipeline_id)))?;
        pipeline.paused = paused;
        Ok(())
    }

    pub fn set_pipeline_public(&self, pipeline_id: ResourceId, public: bool) -> DbResult<()> {
        let mut state = self.state();
        let pipeline = state
            .pipelines
            .get_mut(&pipeline_id)
            .ok_or_else(|| DbError::NotFound(format!("pipeline {}", pipeline_id)))?;
        pipeline.public = public;
        Ok(())
    }

    pub fn add_job(
        &self,
        pipeline_id: ResourceId,
        name: &str,
        serial_groups: &[&str],
        in_flight: InFlightPolicy,
    ) -> DbResult<Job> {
        for group in serial_groups {
            validate_serial_group(group)?;
        }
        let mut state = self.state();
        if !state.pipelines.contains_key(&pipeline_id) {
            return Err(DbError::NotFound(format!("pipeline {}", pipeline_id)));
        }
        let job = StoredJob {
            id: ResourceId::new(),
            pipeline_id,
            name: name.to_string(),
            paused: false,
            serial_groups: serial_groups.iter().map(|g| g.to_string()).collect(),
            in_flight,
            build_number_seq: 0,
        };
        let id = job.id;
        state.jobs.insert(id, job);
        state.job(id)
    }

    /// Register a lock session for `node` and return its manager.
    pub fn lock_manager(&self, node: &str) -> MemoryLockManager {
        let session_id = Uuid::now_v7();
        self.state().sessions.insert(
            session_id,
            Session {
                node: node.to_string(),
                heartbeat_at: Utc::now(),
            },
        );
        MemoryLockManager {
            store: self.clone(),
            node: node.to_string(),
            session_id,
        }
    }

    /// Delete a lock session as a reaper on another node would.
    pub fn expire_session(&self, session_id: Uuid) {
        self.state().drop_session(session_id);
    }

    /// Number of locks currently held by any session.
    pub fn held_lock_count(&self) -> usize {
        self.state().locks.len()
    }
}

#[async_trait]
impl JobRepo for MemoryStore {
    async fn schedulable_jobs(&self) -> DbResult<Vec<Job>> {
        let state = self.state();
        let mut jobs = state
            .jobs
            .values()
            .map(|job| state.job_view(job))
            .collect::<DbResult<Vec<_>>>()?;
        jobs.retain(Job::is_schedulable);
        jobs.sort_by(|a, b| (a.pipeline_id, &a.name).cmp(&(b.pipeline_id, &b.name)));
        Ok(jobs)
    }

    async fn get_job(&self, team: &str, pipeline: &str, job: &str) -> DbResult<Job> {
        let state = self.state();
        for stored in state.jobs.values() {
            let view = state.job_view(stored)?;
            if view.team_name == team && view.pipeline_name == pipeline && view.name == job {
                return Ok(view);
            }
        }
        Err(DbError::NotFound(format!("job {}/{}/{}", team, pipeline, job)))
    }

    async fn set_job_paused(&self, job_id: ResourceId, paused: bool) -> DbResult<()> {
        let mut state = self.state();
        let job = state
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| DbError::NotFound(format!("job {}", job_id)))?;
        job.paused = paused;
        Ok(())
    }
}

#[async_trait]
impl BuildRepo for MemoryStore {
    async fn create_build(&self, job_id: ResourceId) -> DbResult<Build> {
        let mut state = self.state();
        let job = state
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| DbError::NotFound(format!("job {}", job_id)))?;
        job.build_number_seq += 1;
        let name = job.build_number_seq.to_string();

        state.last_build_id += 1;
        let id = BuildId::new(state.last_build_id);
        state.builds.insert(
            id,
            StoredBuild {
                id,
                name,
                job_id,
                status: BuildStatus::Pending,
                owner_url: None,
                created_at: Utc::now(),
                started_at: None,
                finished_at: None,
            },
        );
        state.build(id)
    }

    async fn get_build(&self, id: BuildId) -> DbResult<Build> {
        self.state().build(id)
    }

    async fn list_builds(&self, job_id: ResourceId, limit: i64) -> DbResult<Vec<Build>> {
        let state = self.state();
        state
            .builds
            .values()
            .rev()
            .filter(|b| b.job_id == job_id)
            .take(limit.max(0) as usize)
            .map(|b| state.build_view(b))
            .collect()
    }

    async fn running_builds_in_serial_groups(
        &self,
        pipeline_id: ResourceId,
        groups: &[String],
    ) -> DbResult<Vec<Build>> {
        let state = self.state();
        Ok(state
            .builds_in_groups(pipeline_id, groups)?
            .into_iter()
            .filter(|(_, build)| build.status.is_active())
            .map(|(_, build)| build)
            .collect())
    }

    async fn next_pending_build_in_serial_groups(
        &self,
        pipeline_id: ResourceId,
        groups: &[String],
    ) -> DbResult<Option<Build>> {
        let state = self.state();
        Ok(state
            .builds_in_groups(pipeline_id, groups)?
            .into_iter()
            .find(|(job, build)| build.status == BuildStatus::Pending && job.is_schedulable())
            .map(|(_, build)| build))
    }

    async fn pending_builds(&self, job_id: ResourceId) -> DbResult<Vec<Build>> {
        let state = self.state();
        state
            .builds
            .values()
            .filter(|b| b.job_id == job_id && b.status == BuildStatus::Pending)
            .map(|b| state.build_view(b))
            .collect()
    }

    async fn start_build(&self, id: BuildId, owner_url: &str) -> DbResult<Option<Build>> {
        let mut state = self.state();
        let Some(build) = state.builds.get_mut(&id) else {
            return Ok(None);
        };
        if build.status != BuildStatus::Pending {
            return Ok(None);
        }
        build.status = BuildStatus::Started;
        build.owner_url = Some(owner_url.to_string());
        build.started_at = Some(Utc::now());
        state.build(id).map(Some)
    }

    async fn transition_build(&self, id: BuildId, to: BuildStatus) -> DbResult<Option<Build>> {
        let mut state = self.state();
        let Some(build) = state.builds.get_mut(&id) else {
            return Ok(None);
        };
        if !build.status.can_transition_to(to) {
            return Ok(None);
        }
        build.status = to;
        if to == BuildStatus::Started {
            build.started_at = Some(Utc::now());
        }
        if to.is_terminal() {
            build.finished_at = Some(Utc::now());
        }
        state.build(id).map(Some)
    }
}

#[async_trait]
impl EventRepo for MemoryStore {
    async fn append_event(
        &self,
        build_id: BuildId,
        payload: EventPayload,
    ) -> DbResult<BuildEvent> {
        let mut state = self.state();
        if !state.builds.contains_key(&build_id) {
            return Err(DbError::NotFound(format!("build {}", build_id)));
        }
        let events = state.events.entry(build_id).or_default();
        let event = BuildEvent {
            build_id,
            event_id: events.len() as u64,
            time: Utc::now(),
            payload,
        };
        events.push(event.clone());
        Ok(event)
    }

    async fn events_since(
        &self,
        build_id: BuildId,
        after: Option<u64>,
    ) -> DbResult<Vec<BuildEvent>> {
        let state = self.state();
        let start = after.map(|id| id as usize + 1).unwrap_or(0);
        Ok(state
            .events
            .get(&build_id)
            .map(|events| events.iter().skip(start).cloned().collect())
            .unwrap_or_default())
    }
}

/// A node's lock session on a [`MemoryStore`].
#[derive(Debug, Clone)]
pub struct MemoryLockManager {
    store: MemoryStore,
    node: String,
    session_id: Uuid,
}

impl MemoryLockManager {
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    fn register(&self, state: &mut State) {
        state.sessions.insert(
            self.session_id,
            Session {
                node: self.node.clone(),
                heartbeat_at: Utc::now(),
            },
        );
    }
}

#[async_trait]
impl LockManager for MemoryLockManager {
    async fn try_acquire(&self, key: &LockKey) -> LockResult<LockHandle> {
        let mut state = self.store.state();
        if !state.sessions.contains_key(&self.session_id) {
            self.register(&mut state);
            return Err(LockError::RowGone);
        }
        if state.locks.contains_key(key) {
            return Err(LockError::NotAvailable);
        }
        let acquired_at = Utc::now();
        state.locks.insert(
            key.clone(),
            HeldLock {
                session_id: self.session_id,
                acquired_at,
            },
        );
        Ok(LockHandle {
            key: key.clone(),
            session_id: self.session_id,
            acquired_at,
        })
    }

    async fn release(&self, handle: LockHandle) -> LockResult<()> {
        let mut state = self.store.state();
        match state.locks.get(&handle.key) {
            Some(held) if held.session_id == handle.session_id => {
                state.locks.remove(&handle.key);
                Ok(())
            }
            _ => Err(LockError::RowGone),
        }
    }

    async fn holder(&self, key: &LockKey) -> LockResult<Option<LockHolder>> {
        let state = self.store.state();
        Ok(state.locks.get(key).and_then(|held| {
            state.sessions.get(&held.session_id).map(|session| LockHolder {
                node: session.node.clone(),
                session_id: held.session_id,
                acquired_at: held.acquired_at,
            })
        }))
    }

    async fn heartbeat(&self) -> LockResult<()> {
        let mut state = self.store.state();
        self.register(&mut state);
        Ok(())
    }

    async fn reap_stale_sessions(&self, ttl: Duration) -> LockResult<u64> {
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| DbError::InvalidData(format!("session ttl: {}", e)))?;
        let cutoff = Utc::now() - ttl;
        let mut state = self.store.state();
        let stale: Vec<Uuid> = state
            .sessions
            .iter()
            .filter(|(id, s)| **id != self.session_id && s.heartbeat_at < cutoff)
            .map(|(id, _)| *id)
            .collect();
        for id in &stale {
            state.drop_session(*id);
        }
        Ok(stale.len() as u64)
    }
}
