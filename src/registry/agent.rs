use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::identity::PublicKey;
use crate::registry::capability::CapabilitySet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Pending,
    Active,
    Unreachable,
    Revoked,
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentStatus::Pending => write!(f, "pending"),
            AgentStatus::Active => write!(f, "active"),
            AgentStatus::Unreachable => write!(f, "unreachable"),
            AgentStatus::Revoked => write!(f, "revoked"),
        }
    }
}

/// A registered agent worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: Uuid,
    pub public_key: PublicKey,
    pub capabilities: CapabilitySet,
    pub status: AgentStatus,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub status_changed_at: DateTime<Utc>,
    /// Jobs currently `assigned` or `running` on this agent.
    pub outstanding_jobs: BTreeSet<Uuid>,
    /// Registry-wide assignment sequence number of the latest assignment.
    pub last_assigned_seq: Option<u64>,
    pub last_assigned_at: Option<DateTime<Utc>>,
}

impl Agent {
    pub fn new(
        id: Uuid,
        public_key: PublicKey,
        capabilities: CapabilitySet,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            public_key,
            capabilities,
            status: AgentStatus::Pending,
            registered_at: now,
            last_heartbeat: now,
            status_changed_at: now,
            outstanding_jobs: BTreeSet::new(),
            last_assigned_seq: None,
            last_assigned_at: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == AgentStatus::Active
    }

    pub fn can_serve(&self, tag: &str) -> bool {
        self.is_active() && self.capabilities.matches(tag)
    }

    pub fn pending_count(&self) -> usize {
        self.outstanding_jobs.len()
    }

    /// Whether the last heartbeat is older than `timeout` at `now`.
    pub fn heartbeat_expired(&self, timeout: chrono::Duration, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(self.last_heartbeat) > timeout
    }

    pub(crate) fn set_status(&mut self, status: AgentStatus, now: DateTime<Utc>) {
        if self.status != status {
            self.status = status;
            self.status_changed_at = now;
        }
    }
}
