//! Job ledger: job records and their state transitions.
//!
//! Like the registry, the ledger is plain owned state mutated only inside a
//! store transaction. Each operation validates before it mutates, so a failed
//! call leaves the ledger untouched.

pub mod case;
pub mod job;

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ControllerError, Result};
use crate::registry::capability::validate_tag;
use crate::registry::Agent;

pub use case::{Case, CaseStatus, CaseUpdate, JobConditions};
pub use job::{Job, JobOutcome, JobState};

pub const DEFAULT_MAX_JOBS: usize = 10_000;

/// The job an idempotency key was first used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub job_id: Uuid,
    pub submitted_at: DateTime<Utc>,
}

/// What a case operation left behind.
#[derive(Debug, Clone, PartialEq)]
pub struct CaseProgress {
    /// The case as it stands. `None` when the job stopped before a new case could open.
    pub case: Option<Case>,
    pub job_state: JobState,
    /// Set when the operation reached one of the job's conditions and stopped it.
    pub stopped: Option<String>,
}

/// A running job stopped by a sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoppedJob {
    pub job_id: Uuid,
    pub agent_id: Option<Uuid>,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct JobLedger {
    jobs: HashMap<Uuid, Job>,
    /// Idempotency key -> original job. Outlives archiving until pruned
    /// by [`prune_idempotency`](Self::prune_idempotency).
    idempotency: HashMap<String, IdempotencyRecord>,
    max_jobs: usize,
}

impl Default for JobLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl JobLedger {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_JOBS)
    }

    pub fn with_capacity(max_jobs: usize) -> Self {
        Self {
            jobs: HashMap::new(),
            idempotency: HashMap::new(),
            max_jobs,
        }
    }

    /// Rebuild a ledger from persisted records.
    pub fn restore(
        jobs: Vec<Job>,
        idempotency: HashMap<String, IdempotencyRecord>,
        max_jobs: usize,
    ) -> Self {
        Self {
            jobs: jobs.into_iter().map(|j| (j.id, j)).collect(),
            idempotency,
            max_jobs,
        }
    }

    /// Create a job in `queued`. A repeated idempotency key yields
    /// `DuplicateSubmission` carrying the original job id.
    pub fn submit(
        &mut self,
        capability: &str,
        payload: serde_json::Value,
        idempotency_key: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Uuid> {
        self.submit_with(
            capability,
            payload,
            idempotency_key,
            JobConditions::default(),
            now,
        )
    }

    /// [`submit`](Self::submit) with limits on how far the job may run.
    pub fn submit_with(
        &mut self,
        capability: &str,
        payload: serde_json::Value,
        idempotency_key: Option<String>,
        conditions: JobConditions,
        now: DateTime<Utc>,
    ) -> Result<Uuid> {
        if let Some(existing) = idempotency_key
            .as_ref()
            .and_then(|key| self.idempotency.get(key))
        {
            return Err(ControllerError::DuplicateSubmission(existing.job_id));
        }
        validate_tag(capability).map_err(ControllerError::InvalidRequest)?;
        conditions.validate().map_err(ControllerError::InvalidRequest)?;
        if self.is_full() {
            return Err(ControllerError::AtCapacity);
        }

        let mut id = Uuid::new_v4();
        while self.jobs.contains_key(&id) {
            id = Uuid::new_v4();
        }

        if let Some(key) = &idempotency_key {
            self.idempotency.insert(
                key.clone(),
                IdempotencyRecord {
                    job_id: id,
                    submitted_at: now,
                },
            );
        }
        self.jobs.insert(
            id,
            Job::new(id, capability.to_string(), payload, idempotency_key, now)
                .with_conditions(conditions),
        );
        tracing::info!(job_id = %id, capability, "Job submitted");
        Ok(id)
    }

    /// `queued` -> `assigned`. The agent must be `active`.
    pub fn assign(&mut self, job_id: Uuid, agent: &Agent, now: DateTime<Utc>) -> Result<()> {
        let job = self
            .jobs
            .get_mut(&job_id)
            .ok_or(ControllerError::UnknownJob(job_id))?;

        job.check_transition(JobState::Assigned)?;
        if !agent.is_active() {
            return Err(ControllerError::agent_transition(
                agent.id,
                agent.status,
                "assigned",
            ));
        }

        job.transition(JobState::Assigned, now)?;
        job.assigned_agent = Some(agent.id);
        tracing::info!(job_id = %job_id, agent_id = %agent.id, "Job assigned");
        Ok(())
    }

    /// `assigned` -> `running`. Caller identity is checked by the dispatcher.
    pub fn start(&mut self, job_id: Uuid, now: DateTime<Utc>) -> Result<()> {
        let job = self.get_mut(job_id)?;
        job.transition(JobState::Running, now)?;
        tracing::info!(job_id = %job_id, "Job started");
        Ok(())
    }

    /// `running` -> `succeeded`. Returns the agent that held the job.
    pub fn complete(
        &mut self,
        job_id: Uuid,
        result: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<Option<Uuid>> {
        let job = self.get_mut(job_id)?;
        job.transition(JobState::Succeeded, now)?;
        job.result = Some(result);
        tracing::info!(job_id = %job_id, "Job succeeded");
        Ok(job.assigned_agent)
    }

    /// `running` -> `failed`. Returns the agent that held the job.
    pub fn fail(&mut self, job_id: Uuid, error: String, now: DateTime<Utc>) -> Result<Option<Uuid>> {
        let job = self.get_mut(job_id)?;
        job.transition(JobState::Failed, now)?;
        tracing::warn!(job_id = %job_id, error = %error, "Job failed");
        job.error = Some(error);
        Ok(job.assigned_agent)
    }

    /// `assigned`/`running` -> `queued` with one more attempt on the clock.
    /// Once attempts exceed `max_attempts` the job goes to `expired` instead.
    /// Returns the state the job ended up in.
    pub fn requeue(&mut self, job_id: Uuid, max_attempts: u32, now: DateTime<Utc>) -> Result<JobState> {
        let job = self.get_mut(job_id)?;
        // only assigned and running jobs have an edge back to queued
        job.check_transition(JobState::Queued)?;

        let attempts = job.attempts + 1;
        let next = if attempts > max_attempts {
            JobState::Expired
        } else {
            JobState::Queued
        };
        job.transition(next, now)?;
        job.attempts = attempts;
        job.assigned_agent = None;

        if next == JobState::Queued {
            job.queued_at = now;
            tracing::info!(job_id = %job_id, attempts, "Job requeued");
        } else {
            job.error = Some(format!("gave up after {} attempts", attempts));
            tracing::warn!(job_id = %job_id, attempts, "Job expired after max attempts");
        }
        Ok(next)
    }

    /// `assigned`/`running` -> `queued` without charging an attempt, for jobs
    /// whose holder is gone for reasons that are not the job's fault.
    pub fn reclaim(&mut self, job_id: Uuid, now: DateTime<Utc>) -> Result<()> {
        let job = self.get_mut(job_id)?;
        job.transition(JobState::Queued, now)?;
        job.assigned_agent = None;
        job.queued_at = now;
        tracing::warn!(job_id = %job_id, "Job reclaimed from missing holder");
        Ok(())
    }

    /// Open a case on a running job. When the job already holds its
    /// maximum number of cases, or has reached another limit, the job is
    /// stopped instead and no case is opened.
    pub fn start_case(
        &mut self,
        job_id: Uuid,
        name: &str,
        description: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<CaseProgress> {
        let job = self.get_mut(job_id)?;
        check_running(job, "case started")?;
        let name = name.trim();
        if name.is_empty() {
            return Err(ControllerError::InvalidRequest(
                "case name must not be empty".to_string(),
            ));
        }

        if let Some(reason) =
            job.conditions
                .breach(job.cases.len(), job.elapsed_secs(now), job.total_cost())
        {
            job.stop(reason.clone(), now)?;
            return Ok(CaseProgress {
                case: None,
                job_state: job.state,
                stopped: Some(reason),
            });
        }

        let case = Case::new(Uuid::new_v4(), name.to_string(), description, now);
        tracing::info!(job_id = %job_id, case_id = %case.id, "Case started");
        job.cases.push(case.clone());
        job.updated_at = now;
        Ok(CaseProgress {
            case: Some(case),
            job_state: job.state,
            stopped: None,
        })
    }

    /// Append an update to an open case, then check the job's limits.
    pub fn update_case(
        &mut self,
        job_id: Uuid,
        case_id: Uuid,
        update: CaseUpdate,
        now: DateTime<Utc>,
    ) -> Result<CaseProgress> {
        let job = self.get_mut(job_id)?;
        check_running(job, "case updated")?;
        case_mut(job, case_id)?.record(update)?;
        job.updated_at = now;
        after_case_change(job, case_id, now)
    }

    /// Deliver a case, then check the job's limits.
    pub fn close_case(
        &mut self,
        job_id: Uuid,
        case_id: Uuid,
        delivery: serde_json::Value,
        final_cost: Option<f64>,
        now: DateTime<Utc>,
    ) -> Result<CaseProgress> {
        let job = self.get_mut(job_id)?;
        check_running(job, "case closed")?;
        case_mut(job, case_id)?.close(delivery, final_cost, now)?;
        job.updated_at = now;
        tracing::info!(job_id = %job_id, case_id = %case_id, "Case closed");
        after_case_change(job, case_id, now)
    }

    /// Stop running jobs that have outlived their maximum duration.
    pub fn stop_overruns(&mut self, now: DateTime<Utc>) -> Vec<StoppedJob> {
        let mut stopped = Vec::new();
        for job in self.jobs.values_mut() {
            if job.state != JobState::Running {
                continue;
            }
            let Some(reason) = job
                .conditions
                .limit_reached(job.elapsed_secs(now), job.total_cost())
            else {
                continue;
            };
            match job.stop(reason.clone(), now) {
                Ok(()) => stopped.push(StoppedJob {
                    job_id: job.id,
                    agent_id: job.assigned_agent,
                    reason,
                }),
                Err(e) => tracing::warn!(job_id = %job.id, error = %e, "Could not stop job"),
            }
        }
        stopped.sort_by_key(|s| s.job_id);
        stopped
    }

    /// Forget idempotency keys older than `retention` whose job is finished
    /// or archived. Keys of live jobs are always kept. Returns how many went.
    pub fn prune_idempotency(&mut self, retention: chrono::Duration, now: DateTime<Utc>) -> usize {
        let jobs = &self.jobs;
        let before = self.idempotency.len();
        self.idempotency.retain(|_, record| {
            let live = jobs
                .get(&record.job_id)
                .is_some_and(|j| !j.state.is_terminal());
            live || now.signed_duration_since(record.submitted_at) <= retention
        });
        let pruned = before - self.idempotency.len();
        if pruned > 0 {
            tracing::debug!(pruned, "Idempotency keys pruned");
        }
        pruned
    }

    /// Expire jobs that have sat in `queued` for longer than `ttl`.
    pub fn expire_stale(&mut self, ttl: chrono::Duration, now: DateTime<Utc>) -> Vec<Uuid> {
        let stale: Vec<Uuid> = self
            .jobs
            .values()
            .filter(|j| j.state == JobState::Queued && now.signed_duration_since(j.queued_at) > ttl)
            .map(|j| j.id)
            .collect();

        let mut expired = Vec::with_capacity(stale.len());
        for id in stale {
            let Some(job) = self.jobs.get_mut(&id) else {
                continue;
            };
            match job.transition(JobState::Expired, now) {
                Ok(()) => {
                    job.error = Some("expired while queued".to_string());
                    tracing::info!(job_id = %id, "Queued job expired");
                    expired.push(id);
                }
                Err(e) => tracing::warn!(job_id = %id, error = %e, "Skipping job during expiry"),
            }
        }
        expired.sort();
        expired
    }

    /// Remove a terminal job from the ledger.
    pub fn archive(&mut self, job_id: Uuid) -> Result<Job> {
        let job = self.get(job_id)?;
        if !job.state.is_terminal() {
            return Err(ControllerError::InvalidTransition {
                entity: format!("job {}", job_id),
                from: job.state.to_string(),
                to: "archived".to_string(),
            });
        }
        let job = self
            .jobs
            .remove(&job_id)
            .ok_or(ControllerError::UnknownJob(job_id))?;
        tracing::debug!(job_id = %job_id, "Job archived");
        Ok(job)
    }

    pub fn get(&self, job_id: Uuid) -> Result<&Job> {
        self.jobs.get(&job_id).ok_or(ControllerError::UnknownJob(job_id))
    }

    fn get_mut(&mut self, job_id: Uuid) -> Result<&mut Job> {
        self.jobs
            .get_mut(&job_id)
            .ok_or(ControllerError::UnknownJob(job_id))
    }

    /// Queued jobs, oldest first, with the version each was read at.
    pub fn queued_fifo(&self) -> Vec<(Uuid, u64)> {
        let mut queued: Vec<&Job> = self
            .jobs
            .values()
            .filter(|j| j.state == JobState::Queued)
            .collect();
        queued.sort_by_key(|j| j.fifo_key());
        queued.into_iter().map(|j| (j.id, j.version)).collect()
    }

    /// Jobs in FIFO order, optionally filtered by state, paginated.
    pub fn list(&self, state: Option<JobState>, skip: usize, limit: usize) -> Vec<&Job> {
        self.filtered(state).into_iter().skip(skip).take(limit).collect()
    }

    pub fn count(&self, state: Option<JobState>) -> usize {
        self.jobs
            .values()
            .filter(|j| state.map_or(true, |s| j.state == s))
            .count()
    }

    fn filtered(&self, state: Option<JobState>) -> Vec<&Job> {
        let mut jobs: Vec<&Job> = self
            .jobs
            .values()
            .filter(|j| state.map_or(true, |s| j.state == s))
            .collect();
        jobs.sort_by_key(|j| j.fifo_key());
        jobs
    }

    /// Jobs currently held by `agent_id`, in FIFO order.
    pub fn jobs_for_agent(&self, agent_id: Uuid) -> Vec<&Job> {
        let mut jobs: Vec<&Job> = self
            .jobs
            .values()
            .filter(|j| j.assigned_agent == Some(agent_id) && !j.state.is_terminal())
            .collect();
        jobs.sort_by_key(|j| j.fifo_key());
        jobs
    }

    pub fn jobs(&self) -> impl Iterator<Item = &Job> {
        self.jobs.values()
    }

    pub fn idempotency_keys(&self) -> &HashMap<String, IdempotencyRecord> {
        &self.idempotency
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.jobs.len() >= self.max_jobs
    }

    pub fn max_jobs(&self) -> usize {
        self.max_jobs
    }
}

fn check_running(job: &Job, action: &str) -> Result<()> {
    match job.state {
        JobState::Running => Ok(()),
        JobState::Expired => Err(ControllerError::Expired(job.id)),
        state => Err(ControllerError::InvalidTransition {
            entity: format!("job {}", job.id),
            from: state.to_string(),
            to: action.to_string(),
        }),
    }
}

fn case_mut(job: &mut Job, case_id: Uuid) -> Result<&mut Case> {
    let job_id = job.id;
    job.cases
        .iter_mut()
        .find(|c| c.id == case_id)
        .ok_or(ControllerError::UnknownCase { job_id, case_id })
}

/// Stop the job if the change took it over a limit, and report the case.
fn after_case_change(job: &mut Job, case_id: Uuid, now: DateTime<Utc>) -> Result<CaseProgress> {
    let stopped = job
        .conditions
        .limit_reached(job.elapsed_secs(now), job.total_cost());
    if let Some(reason) = &stopped {
        job.stop(reason.clone(), now)?;
    }
    Ok(CaseProgress {
        case: job.case(case_id).cloned(),
        job_state: job.state,
        stopped,
    })
}
