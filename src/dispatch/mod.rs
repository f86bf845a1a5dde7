//! Job dispatch: the operations that move agents and jobs through their
//! lifecycles, and the policy that matches queued jobs to agents.
//!
//! Every operation runs as a single [`Store`] transaction and publishes
//! [`ControllerEvent`]s only after that transaction has committed.
//!
//! ## Assignment policy
//! Queued jobs are visited oldest first. Each job goes to the active agent
//! that declares its capability, has spare capacity, and was assigned least
//! recently (never-assigned agents first, ties on identifier). A job with no
//! such agent stays queued for the next pass.
//!
//! ## Superseded passes
//! Every pass takes a generation number. An assignment only commits if the
//! pass is still the newest one and the job still carries the version it was
//! read at, so a slow pass can never overwrite the work of a newer one.

pub mod events;
pub mod sweeper;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, Notify};
use uuid::Uuid;

use crate::config::DispatchConfig;
use crate::error::{ControllerError, Result};
use crate::identity::PublicKey;
use crate::ledger::{
    CaseProgress, CaseUpdate, Job, JobConditions, JobLedger, JobOutcome, JobState, StoppedJob,
};
use crate::registry::{Agent, AgentStatus, CapabilitySet};
use crate::store::{ControllerState, Store};

pub use events::{ControllerEvent, EventBus};
pub use sweeper::Sweeper;

/// Result of trying to place one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssignOutcome {
    Assigned { job_id: Uuid, agent_id: Uuid },
    /// The job was no longer queued; nothing changed.
    NotQueued { job_id: Uuid, state: JobState },
    /// No active agent can take the job right now; it stays queued.
    NoEligibleAgent { job_id: Uuid },
    /// A newer pass or another transition got to the job first.
    Superseded { job_id: Uuid },
}

/// Summary of one dispatch pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub generation: u64,
    pub assigned: Vec<(Uuid, Uuid)>,
    pub waiting: Vec<Uuid>,
    pub superseded: Vec<Uuid>,
    /// The pass stopped early because a newer one started.
    pub aborted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub agent_id: Uuid,
    pub status: AgentStatus,
    /// The key was already registered; `agent_id` is the existing record.
    pub existing: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub job_id: Uuid,
    /// `None` when a duplicate refers to a job that has since been archived.
    pub state: Option<JobState>,
    pub duplicate: bool,
}

/// Jobs released by an agent leaving service, and where each one went.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Release {
    pub requeued: Vec<Uuid>,
    pub expired: Vec<Uuid>,
}

impl Release {
    pub fn job_ids(&self) -> Vec<Uuid> {
        let mut ids: Vec<Uuid> = self.requeued.iter().chain(&self.expired).copied().collect();
        ids.sort();
        ids
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExpiryReport {
    pub expired_jobs: Vec<Uuid>,
    pub purged_agents: Vec<Uuid>,
}

/// Shared handle to the dispatch operations. Cheap to clone.
#[derive(Clone)]
pub struct Dispatcher {
    store: Store,
    config: DispatchConfig,
    events: EventBus,
    generation: Arc<AtomicU64>,
    wake: Arc<Notify>,
}

impl Dispatcher {
    pub fn new(store: Store, config: DispatchConfig) -> Self {
        Self::with_events(store, config, EventBus::default())
    }

    pub fn with_events(store: Store, config: DispatchConfig, events: EventBus) -> Self {
        Self {
            store,
            config,
            events,
            generation: Arc::new(AtomicU64::new(0)),
            wake: Arc::new(Notify::new()),
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ControllerEvent> {
        self.events.subscribe()
    }

    /// Ask the dispatch loop to run a pass soon.
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    /// Resolves once [`wake`](Self::wake) has been called since the last wait.
    pub async fn woken(&self) {
        self.wake.notified().await;
    }

    // ---- agents ----------------------------------------------------------

    /// Register an agent under `public_key`. Registering a key that is
    /// already known returns the existing record instead of a new one.
    pub async fn register_agent(
        &self,
        public_key: PublicKey,
        capabilities: CapabilitySet,
    ) -> Result<Registration> {
        let now = Utc::now();
        let result = self
            .store
            .transact(|s| s.registry.register(public_key, capabilities, now))
            .await;

        match result {
            Ok(agent_id) => {
                self.events
                    .publish(ControllerEvent::AgentRegistered { agent_id });
                Ok(Registration {
                    agent_id,
                    status: AgentStatus::Pending,
                    existing: false,
                })
            }
            Err(ControllerError::AlreadyRegistered(agent_id)) => {
                let agent = self.store.get_agent(agent_id).await?;
                tracing::debug!(agent_id = %agent_id, "Key already registered, returning existing agent");
                Ok(Registration {
                    agent_id,
                    status: agent.status,
                    existing: true,
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Record a heartbeat, activating the agent if needed. Returns the agent
    /// and the jobs currently assigned to it but not yet started.
    pub async fn heartbeat(&self, agent_id: Uuid) -> Result<(Agent, Vec<Job>)> {
        let now = Utc::now();
        let (previous, agent, assigned) = self
            .store
            .transact(|s| {
                let previous = s.registry.heartbeat(agent_id, now)?;
                let agent = s.registry.get(agent_id)?.clone();
                let assigned: Vec<Job> = s
                    .ledger
                    .jobs_for_agent(agent_id)
                    .into_iter()
                    .filter(|j| j.state == JobState::Assigned)
                    .cloned()
                    .collect();
                Ok((previous, agent, assigned))
            })
            .await?;

        if previous != AgentStatus::Active {
            self.events
                .publish(ControllerEvent::AgentActivated { agent_id });
            self.wake();
        }
        Ok((agent, assigned))
    }

    /// Bring an agent into service without waiting for its heartbeat loop.
    pub async fn activate_agent(&self, agent_id: Uuid) -> Result<Agent> {
        self.heartbeat(agent_id).await.map(|(agent, _)| agent)
    }

    /// `active` -> `unreachable`, requeueing whatever the agent held.
    pub async fn mark_unreachable(&self, agent_id: Uuid) -> Result<Release> {
        let now = Utc::now();
        let max_attempts = self.config.max_attempts;
        let release = self
            .store
            .transact(|s| {
                let released = s.registry.mark_unreachable(agent_id, now)?;
                Ok(requeue_released(s, &released, max_attempts, now))
            })
            .await?;

        self.publish_release(agent_id, &release, false);
        Ok(release)
    }

    /// Revoke an agent permanently, requeueing whatever it held.
    pub async fn revoke_agent(&self, agent_id: Uuid) -> Result<Release> {
        let now = Utc::now();
        let max_attempts = self.config.max_attempts;
        let (was_revoked, release) = self
            .store
            .transact(|s| {
                let was_revoked = s.registry.get(agent_id)?.status == AgentStatus::Revoked;
                let released = s.registry.revoke(agent_id, now)?;
                Ok((
                    was_revoked,
                    requeue_released(s, &released, max_attempts, now),
                ))
            })
            .await?;

        if !was_revoked {
            self.publish_release(agent_id, &release, true);
        }
        Ok(release)
    }

    fn publish_release(&self, agent_id: Uuid, release: &Release, revoked: bool) {
        let released_jobs = release.job_ids();
        self.events.publish(if revoked {
            ControllerEvent::AgentRevoked {
                agent_id,
                released_jobs,
            }
        } else {
            ControllerEvent::AgentUnreachable {
                agent_id,
                released_jobs,
            }
        });
        for &job_id in &release.requeued {
            self.events.publish(ControllerEvent::JobRequeued {
                job_id,
                released_by: agent_id,
            });
        }
        for &job_id in &release.expired {
            self.events.publish(ControllerEvent::JobExpired { job_id });
        }
        if !release.requeued.is_empty() {
            self.wake();
        }
    }

    pub async fn agent(&self, agent_id: Uuid) -> Result<Agent> {
        self.store.get_agent(agent_id).await
    }

    /// Agents ordered by registration, with the total count.
    pub async fn list_agents(&self, skip: usize, limit: usize) -> Result<(Vec<Agent>, usize)> {
        let state = self.store.read().await?;
        let agents = state
            .registry
            .list(skip, limit)
            .into_iter()
            .cloned()
            .collect();
        Ok((agents, state.registry.len()))
    }

    // ---- jobs ------------------------------------------------------------

    /// Create a queued job. A repeated idempotency key returns the original
    /// job with `duplicate` set instead of creating a second one.
    pub async fn submit_job(
        &self,
        capability: &str,
        payload: serde_json::Value,
        idempotency_key: Option<String>,
    ) -> Result<Submission> {
        self.submit_job_with(capability, payload, idempotency_key, JobConditions::default())
            .await
    }

    /// [`submit_job`](Self::submit_job) with limits on cases, duration and cost.
    pub async fn submit_job_with(
        &self,
        capability: &str,
        payload: serde_json::Value,
        idempotency_key: Option<String>,
        conditions: JobConditions,
    ) -> Result<Submission> {
        let now = Utc::now();
        let submission = self
            .store
            .transact(|s| {
                match s
                    .ledger
                    .submit_with(capability, payload, idempotency_key, conditions, now)
                {
                    Ok(job_id) => Ok(Submission {
                        job_id,
                        state: Some(JobState::Queued),
                        duplicate: false,
                    }),
                    Err(ControllerError::DuplicateSubmission(job_id)) => Ok(Submission {
                        job_id,
                        state: s.ledger.get(job_id).ok().map(|j| j.state),
                        duplicate: true,
                    }),
                    Err(e) => Err(e),
                }
            })
            .await?;

        if !submission.duplicate {
            self.events.publish(ControllerEvent::JobSubmitted {
                job_id: submission.job_id,
                capability: capability.to_string(),
            });
            self.wake();
        }
        Ok(submission)
    }

    /// Try to place a single queued job right now.
    pub async fn assign_job(&self, job_id: Uuid) -> Result<AssignOutcome> {
        let now = Utc::now();
        let limit = self.config.max_concurrent_jobs_per_agent;
        let outcome = self
            .store
            .transact(|s| assign_within(s, job_id, limit, now))
            .await?;
        self.publish_assignment(&outcome);
        Ok(outcome)
    }

    /// Visit every queued job in FIFO order and place those that can be placed.
    ///
    /// Failures on individual jobs are logged and the pass moves on.
    /// Starting a new pass supersedes any pass still in progress.
    pub async fn dispatch_pass(&self) -> Result<DispatchReport> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let mut report = DispatchReport {
            generation,
            ..Default::default()
        };
        let queued = self.store.read().await?.ledger.queued_fifo();
        let limit = self.config.max_concurrent_jobs_per_agent;

        for (job_id, version) in queued {
            if self.generation.load(Ordering::SeqCst) != generation {
                tracing::debug!(generation, "Dispatch pass superseded, stopping");
                report.aborted = true;
                break;
            }

            let current = &self.generation;
            let now = Utc::now();
            let result = self
                .store
                .update_job_if_version(job_id, version, |s| {
                    // re-checked under the write lock
                    if current.load(Ordering::SeqCst) != generation {
                        return Ok(AssignOutcome::Superseded { job_id });
                    }
                    assign_within(s, job_id, limit, now)
                })
                .await;

            let outcome = match result {
                Ok(Some(outcome)) => outcome,
                Ok(None) | Err(ControllerError::UnknownJob(_)) => {
                    AssignOutcome::Superseded { job_id }
                }
                Err(e) => {
                    tracing::warn!(job_id = %job_id, error = %e, "Dispatch attempt failed");
                    continue;
                }
            };

            self.publish_assignment(&outcome);
            match outcome {
                AssignOutcome::Assigned { job_id, agent_id } => {
                    report.assigned.push((job_id, agent_id))
                }
                AssignOutcome::NoEligibleAgent { job_id } => report.waiting.push(job_id),
                AssignOutcome::NotQueued { job_id, .. } | AssignOutcome::Superseded { job_id } => {
                    report.superseded.push(job_id)
                }
            }
        }

        if !report.assigned.is_empty() || report.aborted {
            tracing::info!(
                generation,
                assigned = report.assigned.len(),
                waiting = report.waiting.len(),
                aborted = report.aborted,
                "Dispatch pass finished"
            );
        }
        Ok(report)
    }

    fn publish_assignment(&self, outcome: &AssignOutcome) {
        if let AssignOutcome::Assigned { job_id, agent_id } = *outcome {
            self.events
                .publish(ControllerEvent::JobAssigned { job_id, agent_id });
        }
    }

    /// `assigned` -> `running`, reported by the agent holding the job.
    /// Repeating the call once the job is running is a no-op.
    pub async fn start_job(&self, job_id: Uuid, agent_id: Uuid) -> Result<Job> {
        let now = Utc::now();
        let (job, changed) = self
            .store
            .transact(|s| {
                let job = s.ledger.get(job_id)?;
                check_holder(job, agent_id)?;
                if job.state == JobState::Running {
                    return Ok((job.clone(), false));
                }
                s.ledger.start(job_id, now)?;
                Ok((s.ledger.get(job_id)?.clone(), true))
            })
            .await?;

        if changed {
            self.events
                .publish(ControllerEvent::JobStarted { job_id, agent_id });
        }
        Ok(job)
    }

    /// `running` -> `succeeded`.
    pub async fn complete_job(
        &self,
        job_id: Uuid,
        agent_id: Uuid,
        result: serde_json::Value,
    ) -> Result<Job> {
        self.finish_job(job_id, agent_id, JobOutcome::Succeeded { result })
            .await
    }

    /// `running` -> `failed`.
    pub async fn fail_job(&self, job_id: Uuid, agent_id: Uuid, error: String) -> Result<Job> {
        self.finish_job(job_id, agent_id, JobOutcome::Failed { error })
            .await
    }

    /// Record the outcome reported by the agent holding the job. A repeated
    /// report for a job that already finished returns it unchanged.
    pub async fn finish_job(
        &self,
        job_id: Uuid,
        agent_id: Uuid,
        outcome: JobOutcome,
    ) -> Result<Job> {
        let now = Utc::now();
        let (job, changed) = self
            .store
            .transact(|s| {
                let job = s.ledger.get(job_id)?;
                check_holder(job, agent_id)?;
                if matches!(job.state, JobState::Succeeded | JobState::Failed) {
                    return Ok((job.clone(), false));
                }
                match outcome {
                    JobOutcome::Succeeded { result } => s.ledger.complete(job_id, result, now)?,
                    JobOutcome::Failed { error } => s.ledger.fail(job_id, error, now)?,
                };
                s.registry.release_job(agent_id, job_id);
                Ok((s.ledger.get(job_id)?.clone(), true))
            })
            .await?;

        if changed {
            self.events.publish(match job.state {
                JobState::Failed => ControllerEvent::JobFailed {
                    job_id,
                    agent_id,
                    error: job.error.clone().unwrap_or_default(),
                },
                _ => ControllerEvent::JobSucceeded { job_id, agent_id },
            });
            // the agent has a free slot again
            self.wake();
        }
        Ok(job)
    }

    // ---- cases -----------------------------------------------------------

    /// Open a case on a running job held by `agent_id`. If the job has
    /// reached one of its conditions it is stopped instead.
    pub async fn start_case(
        &self,
        job_id: Uuid,
        agent_id: Uuid,
        name: &str,
        description: Option<String>,
    ) -> Result<CaseProgress> {
        let progress = self
            .case_op(job_id, agent_id, |ledger, now| {
                ledger.start_case(job_id, name, description, now)
            })
            .await?;
        if let Some(case) = &progress.case {
            self.events.publish(ControllerEvent::CaseStarted {
                job_id,
                case_id: case.id,
            });
        }
        self.publish_stop(job_id, agent_id, &progress);
        Ok(progress)
    }

    /// Record progress on a case. An update carrying a question parks the
    /// case until the next update.
    pub async fn update_case(
        &self,
        job_id: Uuid,
        agent_id: Uuid,
        case_id: Uuid,
        mut update: CaseUpdate,
    ) -> Result<CaseProgress> {
        let progress = self
            .case_op(job_id, agent_id, |ledger, now| {
                update.at = now;
                ledger.update_case(job_id, case_id, update, now)
            })
            .await?;
        if let Some(case) = &progress.case {
            self.events.publish(ControllerEvent::CaseUpdated {
                job_id,
                case_id,
                status: case.status,
            });
        }
        self.publish_stop(job_id, agent_id, &progress);
        Ok(progress)
    }

    /// Deliver a case, optionally replacing its running cost with `final_cost`.
    pub async fn close_case(
        &self,
        job_id: Uuid,
        agent_id: Uuid,
        case_id: Uuid,
        delivery: serde_json::Value,
        final_cost: Option<f64>,
    ) -> Result<CaseProgress> {
        let progress = self
            .case_op(job_id, agent_id, |ledger, now| {
                ledger.close_case(job_id, case_id, delivery, final_cost, now)
            })
            .await?;
        self.events
            .publish(ControllerEvent::CaseClosed { job_id, case_id });
        self.publish_stop(job_id, agent_id, &progress);
        Ok(progress)
    }

    /// Run a case operation for the job's holder. A job stopped by its
    /// conditions leaves the agent in the same transaction.
    async fn case_op(
        &self,
        job_id: Uuid,
        agent_id: Uuid,
        op: impl FnOnce(&mut JobLedger, DateTime<Utc>) -> Result<CaseProgress>,
    ) -> Result<CaseProgress> {
        let now = Utc::now();
        self.store
            .transact(|s| {
                check_holder(s.ledger.get(job_id)?, agent_id)?;
                let progress = op(&mut s.ledger, now)?;
                if progress.stopped.is_some() {
                    s.registry.release_job(agent_id, job_id);
                }
                Ok(progress)
            })
            .await
    }

    fn publish_stop(&self, job_id: Uuid, agent_id: Uuid, progress: &CaseProgress) {
        if let Some(reason) = &progress.stopped {
            self.events.publish(ControllerEvent::JobFailed {
                job_id,
                agent_id,
                error: reason.clone(),
            });
            self.wake();
        }
    }

    /// Remove a finished job from the ledger, returning its final record.
    pub async fn archive_job(&self, job_id: Uuid) -> Result<Job> {
        let job = self.store.transact(|s| s.ledger.archive(job_id)).await?;
        self.events.publish(ControllerEvent::JobArchived { job_id });
        Ok(job)
    }

    pub async fn job(&self, job_id: Uuid) -> Result<Job> {
        self.store.get_job(job_id).await
    }

    /// Jobs in FIFO order, optionally filtered by state, with the matching total.
    pub async fn list_jobs(
        &self,
        state: Option<JobState>,
        skip: usize,
        limit: usize,
    ) -> Result<(Vec<Job>, usize)> {
        let guard = self.store.read().await?;
        let jobs = guard
            .ledger
            .list(state, skip, limit)
            .into_iter()
            .cloned()
            .collect();
        Ok((jobs, guard.ledger.count(state)))
    }

    // ---- sweeps ----------------------------------------------------------

    /// Mark every active agent whose heartbeat is older than `timeout` as
    /// unreachable. Returns the agents that were marked.
    pub async fn sweep_liveness(
        &self,
        timeout: chrono::Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<Uuid>> {
        let stale = self.store.read().await?.registry.stale_agents(timeout, now);
        let max_attempts = self.config.max_attempts;
        let mut marked = Vec::new();

        for agent_id in stale {
            let result = self
                .store
                .transact(|s| {
                    // a heartbeat may have landed since the read
                    let agent = s.registry.get(agent_id)?;
                    if !(agent.is_active() && agent.heartbeat_expired(timeout, now)) {
                        return Ok(None);
                    }
                    let released = s.registry.mark_unreachable(agent_id, now)?;
                    Ok(Some(requeue_released(s, &released, max_attempts, now)))
                })
                .await;

            match result {
                Ok(Some(release)) => {
                    self.publish_release(agent_id, &release, false);
                    marked.push(agent_id);
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(agent_id = %agent_id, error = %e, "Liveness check failed")
                }
            }
        }
        Ok(marked)
    }

    /// Expire jobs queued for longer than `job_ttl` and purge agents that
    /// have been unreachable for longer than `agent_expiry`.
    pub async fn sweep_expired(
        &self,
        job_ttl: Option<chrono::Duration>,
        agent_expiry: Option<chrono::Duration>,
        now: DateTime<Utc>,
    ) -> Result<ExpiryReport> {
        let mut report = ExpiryReport::default();

        if let Some(ttl) = job_ttl {
            match self
                .store
                .transact(|s| Ok(s.ledger.expire_stale(ttl, now)))
                .await
            {
                Ok(expired) => report.expired_jobs = expired,
                Err(e) => tracing::warn!(error = %e, "Job expiry sweep failed"),
            }
        }
        if let Some(expiry) = agent_expiry {
            match self
                .store
                .transact(|s| Ok(s.registry.purge_expired(expiry, now)))
                .await
            {
                Ok(purged) => report.purged_agents = purged,
                Err(e) => tracing::warn!(error = %e, "Agent expiry sweep failed"),
            }
        }

        for &job_id in &report.expired_jobs {
            self.events.publish(ControllerEvent::JobExpired { job_id });
        }
        for &agent_id in &report.purged_agents {
            self.events.publish(ControllerEvent::AgentPurged { agent_id });
        }
        Ok(report)
    }

    /// Stop running jobs that are past their maximum duration.
    pub async fn sweep_overruns(&self, now: DateTime<Utc>) -> Result<Vec<StoppedJob>> {
        let stopped = self
            .store
            .transact(|s| {
                let stopped = s.ledger.stop_overruns(now);
                for job in &stopped {
                    if let Some(agent_id) = job.agent_id {
                        s.registry.release_job(agent_id, job.job_id);
                    }
                }
                Ok(stopped)
            })
            .await?;

        for job in &stopped {
            if let Some(agent_id) = job.agent_id {
                self.events.publish(ControllerEvent::JobFailed {
                    job_id: job.job_id,
                    agent_id,
                    error: job.reason.clone(),
                });
            }
        }
        if !stopped.is_empty() {
            self.wake();
        }
        Ok(stopped)
    }

    /// Forget idempotency keys of finished or archived jobs older than `retention`.
    pub async fn prune_idempotency(
        &self,
        retention: chrono::Duration,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        self.store
            .transact(|s| Ok(s.ledger.prune_idempotency(retention, now)))
            .await
    }
}

/// Only the agent a job was assigned to may report on it.
fn check_holder(job: &Job, agent_id: Uuid) -> Result<()> {
    if job.state == JobState::Expired {
        return Err(ControllerError::Expired(job.id));
    }
    if job.assigned_agent != Some(agent_id) {
        return Err(ControllerError::Unauthorized(format!(
            "job {} is not assigned to agent {}",
            job.id, agent_id
        )));
    }
    Ok(())
}

/// Place `job_id` on the best eligible agent. Runs inside a transaction.
fn assign_within(
    state: &mut ControllerState,
    job_id: Uuid,
    max_per_agent: usize,
    now: DateTime<Utc>,
) -> Result<AssignOutcome> {
    let job = state.ledger.get(job_id)?;
    if job.state != JobState::Queued {
        return Ok(AssignOutcome::NotQueued {
            job_id,
            state: job.state,
        });
    }

    let Some(agent) = state
        .registry
        .find_eligible(&job.capability)
        .into_iter()
        .find(|a| a.pending_count() < max_per_agent)
    else {
        tracing::debug!(job_id = %job_id, capability = %job.capability, "No eligible agent");
        return Ok(AssignOutcome::NoEligibleAgent { job_id });
    };

    let agent_id = agent.id;
    state.ledger.assign(job_id, agent, now)?;
    state.registry.record_assignment(agent_id, job_id, now)?;
    Ok(AssignOutcome::Assigned { job_id, agent_id })
}

/// Put jobs released by an agent back in the queue, or expire them once
/// they are out of attempts. Runs inside the same transaction as the
/// agent's transition.
fn requeue_released(
    state: &mut ControllerState,
    released: &[Uuid],
    max_attempts: u32,
    now: DateTime<Utc>,
) -> Release {
    let mut release = Release::default();
    for &job_id in released {
        match state.ledger.requeue(job_id, max_attempts, now) {
            Ok(JobState::Queued) => release.requeued.push(job_id),
            Ok(_) => release.expired.push(job_id),
            Err(e) => tracing::warn!(job_id = %job_id, error = %e, "Could not requeue released job"),
        }
    }
    release
}
