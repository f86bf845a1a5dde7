use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ControllerError, Result};
use crate::ledger::case::{Case, JobConditions};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Assigned,
    Running,
    Succeeded,
    Failed,
    Expired,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Failed | JobState::Expired
        )
    }

    /// The complete job transition graph. No edge outside this table exists.
    pub fn can_transition_to(self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Queued, Assigned)
                | (Queued, Expired)
                | (Assigned, Running)
                | (Assigned, Queued)
                | (Assigned, Expired)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, Queued)
                | (Running, Expired)
        )
    }

    pub const ALL: [JobState; 6] = [
        JobState::Queued,
        JobState::Assigned,
        JobState::Running,
        JobState::Succeeded,
        JobState::Failed,
        JobState::Expired,
    ];
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Queued => write!(f, "queued"),
            JobState::Assigned => write!(f, "assigned"),
            JobState::Running => write!(f, "running"),
            JobState::Succeeded => write!(f, "succeeded"),
            JobState::Failed => write!(f, "failed"),
            JobState::Expired => write!(f, "expired"),
        }
    }
}

impl std::str::FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        JobState::ALL
            .into_iter()
            .find(|state| state.to_string().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown job state: {}", s))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub capability: String,
    /// Opaque to the controller; handed to the agent untouched.
    pub payload: serde_json::Value,
    pub state: JobState,
    pub assigned_agent: Option<Uuid>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub attempts: u32,
    pub idempotency_key: Option<String>,
    #[serde(default, skip_serializing_if = "JobConditions::is_unbounded")]
    pub conditions: JobConditions,
    /// Cases reported by the current or previous holders, oldest first.
    #[serde(default)]
    pub cases: Vec<Case>,
    /// Generation stamp, bumped on every transition.
    pub version: u64,
    pub created_at: DateTime<Utc>,
    /// When the job last entered `queued`.
    pub queued_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// When the current run entered `running`. Cleared on requeue.
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(
        id: Uuid,
        capability: String,
        payload: serde_json::Value,
        idempotency_key: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            capability,
            payload,
            state: JobState::Queued,
            assigned_agent: None,
            result: None,
            error: None,
            attempts: 0,
            idempotency_key,
            conditions: JobConditions::default(),
            cases: Vec::new(),
            version: 0,
            created_at: now,
            queued_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
        }
    }

    pub fn with_conditions(mut self, conditions: JobConditions) -> Self {
        self.conditions = conditions;
        self
    }

    /// Check a transition without applying it.
    pub fn check_transition(&self, next: JobState) -> Result<()> {
        if self.state == JobState::Expired {
            return Err(ControllerError::Expired(self.id));
        }
        if !self.state.can_transition_to(next) {
            return Err(ControllerError::job_transition(self.id, self.state, next));
        }
        Ok(())
    }

    /// Move along one edge of the graph, bumping the version.
    pub(crate) fn transition(&mut self, next: JobState, now: DateTime<Utc>) -> Result<()> {
        self.check_transition(next)?;
        self.state = next;
        self.version += 1;
        self.updated_at = now;
        match next {
            JobState::Running => self.started_at = Some(now),
            JobState::Queued => self.started_at = None,
            _ => {}
        }
        if next != JobState::Running {
            // whoever was working the cases has let go of the job
            for case in &mut self.cases {
                case.abandon(now);
            }
        }
        if next.is_terminal() {
            self.finished_at = Some(now);
        }
        Ok(())
    }

    /// Stop a running job because one of its conditions was reached.
    pub(crate) fn stop(&mut self, reason: String, now: DateTime<Utc>) -> Result<()> {
        self.transition(JobState::Failed, now)?;
        tracing::warn!(job_id = %self.id, reason = %reason, "Job stopped by its conditions");
        self.error = Some(reason);
        Ok(())
    }

    /// Cost of all cases so far.
    pub fn total_cost(&self) -> f64 {
        self.cases.iter().map(|c| c.total_cost).sum()
    }

    /// Seconds the current run has been going, zero when not running.
    pub fn elapsed_secs(&self, now: DateTime<Utc>) -> i64 {
        self.started_at
            .map_or(0, |started| now.signed_duration_since(started).num_seconds())
    }

    pub fn case(&self, case_id: Uuid) -> Option<&Case> {
        self.cases.iter().find(|c| c.id == case_id)
    }

    /// FIFO ordering key: creation time, then identifier.
    pub fn fifo_key(&self) -> (DateTime<Utc>, Uuid) {
        (self.created_at, self.id)
    }
}

/// How an agent reports a finished job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobOutcome {
    Succeeded { result: serde_json::Value },
    Failed { error: String },
}
