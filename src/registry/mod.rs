//! Agent registry: known agent workers, their capabilities and liveness.
//!
//! The registry is plain owned state. It is only ever mutated inside a
//! [`Store`](crate::store::Store) transaction, so every method here can
//! validate first and mutate second without worrying about concurrent readers.
//!
//! Operations that take an agent out of service ([`AgentRegistry::mark_unreachable`],
//! [`AgentRegistry::revoke`]) hand back the agent's outstanding jobs; the
//! dispatcher requeues them in the same transaction.

pub mod agent;
pub mod capability;

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::{ControllerError, Result};
use crate::identity::PublicKey;

pub use agent::{Agent, AgentStatus};
pub use capability::{Capability, CapabilitySet};

#[derive(Debug, Default, Clone)]
pub struct AgentRegistry {
    agents: HashMap<Uuid, Agent>,
    by_key: HashMap<PublicKey, Uuid>,
    assignment_seq: u64,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a registry from persisted agents.
    pub fn restore(agents: Vec<Agent>, assignment_seq: u64) -> Self {
        let mut registry = Self {
            assignment_seq,
            ..Self::default()
        };
        for agent in agents {
            registry.by_key.insert(agent.public_key, agent.id);
            registry.agents.insert(agent.id, agent);
        }
        registry
    }

    /// Register a new agent. The agent starts out `pending` until its first heartbeat.
    pub fn register(
        &mut self,
        public_key: PublicKey,
        capabilities: CapabilitySet,
        now: DateTime<Utc>,
    ) -> Result<Uuid> {
        if let Some(existing) = self.by_key.get(&public_key).copied() {
            let revoked = self
                .agents
                .get(&existing)
                .map(|a| a.status == AgentStatus::Revoked)
                .unwrap_or(false);
            return Err(if revoked {
                ControllerError::AgentRevoked(existing)
            } else {
                ControllerError::AlreadyRegistered(existing)
            });
        }
        if capabilities.is_empty() {
            return Err(ControllerError::InvalidRequest(
                "agent must declare at least one capability".to_string(),
            ));
        }

        let mut id = Uuid::new_v4();
        while self.agents.contains_key(&id) {
            id = Uuid::new_v4();
        }

        self.agents
            .insert(id, Agent::new(id, public_key, capabilities, now));
        self.by_key.insert(public_key, id);
        tracing::info!(agent_id = %id, public_key = %public_key, "Agent registered");
        Ok(id)
    }

    /// Bring an agent into service: `pending`/`unreachable` -> `active`.
    /// Returns the status the agent had before.
    pub fn activate(&mut self, agent_id: Uuid, now: DateTime<Utc>) -> Result<AgentStatus> {
        let agent = self
            .agents
            .get_mut(&agent_id)
            .ok_or(ControllerError::UnknownAgent(agent_id))?;

        let previous = agent.status;
        if previous == AgentStatus::Revoked {
            return Err(ControllerError::agent_transition(
                agent_id,
                previous,
                AgentStatus::Active,
            ));
        }

        agent.last_heartbeat = now;
        agent.set_status(AgentStatus::Active, now);
        if previous != AgentStatus::Active {
            tracing::info!(agent_id = %agent_id, from = %previous, "Agent active");
        }
        Ok(previous)
    }

    /// Record a heartbeat. Same transition as [`activate`](Self::activate).
    pub fn heartbeat(&mut self, agent_id: Uuid, now: DateTime<Utc>) -> Result<AgentStatus> {
        self.activate(agent_id, now)
    }

    /// `active` -> `unreachable`. Returns the jobs the agent was holding.
    pub fn mark_unreachable(&mut self, agent_id: Uuid, now: DateTime<Utc>) -> Result<Vec<Uuid>> {
        let agent = self
            .agents
            .get_mut(&agent_id)
            .ok_or(ControllerError::UnknownAgent(agent_id))?;

        if agent.status != AgentStatus::Active {
            return Err(ControllerError::agent_transition(
                agent_id,
                agent.status,
                AgentStatus::Unreachable,
            ));
        }

        agent.set_status(AgentStatus::Unreachable, now);
        let released: Vec<Uuid> = std::mem::take(&mut agent.outstanding_jobs)
            .into_iter()
            .collect();
        tracing::warn!(agent_id = %agent_id, released = released.len(), "Agent unreachable");
        Ok(released)
    }

    /// Revoke an agent for good. The record stays behind as a tombstone so
    /// neither its identifier nor its key can come back. Revoking twice is a no-op.
    pub fn revoke(&mut self, agent_id: Uuid, now: DateTime<Utc>) -> Result<Vec<Uuid>> {
        let agent = self
            .agents
            .get_mut(&agent_id)
            .ok_or(ControllerError::UnknownAgent(agent_id))?;

        if agent.status == AgentStatus::Revoked {
            return Ok(Vec::new());
        }

        agent.set_status(AgentStatus::Revoked, now);
        let released: Vec<Uuid> = std::mem::take(&mut agent.outstanding_jobs)
            .into_iter()
            .collect();
        tracing::warn!(agent_id = %agent_id, released = released.len(), "Agent revoked");
        Ok(released)
    }

    /// Active agents declaring `tag`, least-recently-assigned first.
    /// Agents never assigned come before all others; ties break on identifier.
    pub fn find_eligible(&self, tag: &str) -> Vec<&Agent> {
        let mut eligible: Vec<&Agent> = self.agents.values().filter(|a| a.can_serve(tag)).collect();
        // None sorts before Some, which puts never-assigned agents first
        eligible.sort_by_key(|a| (a.last_assigned_seq, a.id));
        eligible
    }

    /// Note that `job_id` was handed to `agent_id`.
    pub fn record_assignment(
        &mut self,
        agent_id: Uuid,
        job_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let agent = self
            .agents
            .get_mut(&agent_id)
            .ok_or(ControllerError::UnknownAgent(agent_id))?;
        if !agent.is_active() {
            return Err(ControllerError::agent_transition(
                agent_id,
                agent.status,
                "assigned",
            ));
        }

        self.assignment_seq += 1;
        agent.outstanding_jobs.insert(job_id);
        agent.last_assigned_seq = Some(self.assignment_seq);
        agent.last_assigned_at = Some(now);
        Ok(())
    }

    /// Drop `job_id` from the agent's outstanding set once the job left it.
    pub fn release_job(&mut self, agent_id: Uuid, job_id: Uuid) {
        if let Some(agent) = self.agents.get_mut(&agent_id) {
            agent.outstanding_jobs.remove(&job_id);
        }
    }

    /// Replace every agent's outstanding set with the one given in `holding`
    /// (empty when absent). Returns how many agents changed.
    pub fn reset_outstanding(&mut self, mut holding: HashMap<Uuid, BTreeSet<Uuid>>) -> usize {
        let mut changed = 0;
        for agent in self.agents.values_mut() {
            let jobs = holding.remove(&agent.id).unwrap_or_default();
            if agent.outstanding_jobs != jobs {
                tracing::warn!(
                    agent_id = %agent.id,
                    recorded = agent.outstanding_jobs.len(),
                    actual = jobs.len(),
                    "Outstanding jobs did not match the ledger"
                );
                agent.outstanding_jobs = jobs;
                changed += 1;
            }
        }
        changed
    }

    /// Active agents whose last heartbeat is older than `timeout`.
    pub fn stale_agents(&self, timeout: chrono::Duration, now: DateTime<Utc>) -> Vec<Uuid> {
        let mut stale: Vec<Uuid> = self
            .agents
            .values()
            .filter(|a| a.is_active() && a.heartbeat_expired(timeout, now))
            .map(|a| a.id)
            .collect();
        stale.sort();
        stale
    }

    /// Remove agents that have been unreachable for longer than `expiry`.
    /// Their keys are free to register again under a new identifier.
    pub fn purge_expired(&mut self, expiry: chrono::Duration, now: DateTime<Utc>) -> Vec<Uuid> {
        let expired: Vec<Uuid> = self
            .agents
            .values()
            .filter(|a| {
                a.status == AgentStatus::Unreachable
                    && now.signed_duration_since(a.status_changed_at) > expiry
            })
            .map(|a| a.id)
            .collect();

        for id in &expired {
            if let Some(agent) = self.agents.remove(id) {
                self.by_key.remove(&agent.public_key);
                tracing::info!(agent_id = %id, "Expired agent removed");
            }
        }
        expired
    }

    pub fn get(&self, agent_id: Uuid) -> Result<&Agent> {
        self.agents
            .get(&agent_id)
            .ok_or(ControllerError::UnknownAgent(agent_id))
    }

    pub fn by_public_key(&self, key: &PublicKey) -> Option<&Agent> {
        self.by_key.get(key).and_then(|id| self.agents.get(id))
    }

    /// Agents ordered by registration time, then identifier.
    pub fn list(&self, skip: usize, limit: usize) -> Vec<&Agent> {
        let mut agents: Vec<&Agent> = self.agents.values().collect();
        agents.sort_by_key(|a| (a.registered_at, a.id));
        agents.into_iter().skip(skip).take(limit).collect()
    }

    pub fn with_status(&self, status: AgentStatus) -> Vec<&Agent> {
        let mut agents: Vec<&Agent> = self.agents.values().filter(|a| a.status == status).collect();
        agents.sort_by_key(|a| (a.registered_at, a.id));
        agents
    }

    pub fn agents(&self) -> impl Iterator<Item = &Agent> {
        self.agents.values()
    }

    pub fn assignment_seq(&self) -> u64 {
        self.assignment_seq
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}
