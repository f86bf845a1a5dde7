//! Cases: the units of work an agent reports while a job runs, and the
//! limits a submitter can put on them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ControllerError, Result};

/// Limits checked while a job runs. A missing or zero limit is no limit.
/// Reaching any limit stops the job as `failed` with the limit as its error.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct JobConditions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_cases: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_duration_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_cost: Option<f64>,
}

impl JobConditions {
    pub fn validate(&self) -> std::result::Result<(), String> {
        if let Some(cost) = self.max_cost {
            if !cost.is_finite() || cost < 0.0 {
                return Err(format!("max_cost must be a non-negative number, got {}", cost));
            }
        }
        Ok(())
    }

    pub fn is_unbounded(&self) -> bool {
        self.max_cases.unwrap_or(0) == 0
            && self.max_duration_secs.unwrap_or(0) == 0
            && self.max_cost.map_or(true, |c| c == 0.0)
    }

    /// The first limit reached by a job holding `cases` cases, running for
    /// `elapsed_secs`, that has spent `cost`. Checked before a case opens.
    pub fn breach(&self, cases: usize, elapsed_secs: i64, cost: f64) -> Option<String> {
        if let Some(max) = self.max_cases.filter(|&m| m > 0) {
            if cases >= max as usize {
                return Some(format!("max cases {} reached", max));
            }
        }
        self.limit_reached(elapsed_secs, cost)
    }

    /// Duration and cost limits only. Checked after every case change.
    pub fn limit_reached(&self, elapsed_secs: i64, cost: f64) -> Option<String> {
        if let Some(max) = self.max_duration_secs.filter(|&m| m > 0) {
            if elapsed_secs >= 0 && elapsed_secs as u64 >= max {
                return Some(format!("max duration {} seconds reached", max));
            }
        }
        if let Some(max) = self.max_cost.filter(|&m| m > 0.0) {
            if cost >= max {
                return Some(format!("max cost {} reached", max));
            }
        }
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseStatus {
    InProgress,
    /// The last update asked a question and the agent is waiting on an answer.
    AwaitingInput,
    Completed,
    Failed,
}

impl CaseStatus {
    pub fn is_open(self) -> bool {
        matches!(self, CaseStatus::InProgress | CaseStatus::AwaitingInput)
    }
}

impl std::fmt::Display for CaseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CaseStatus::InProgress => write!(f, "in_progress"),
            CaseStatus::AwaitingInput => write!(f, "awaiting_input"),
            CaseStatus::Completed => write!(f, "completed"),
            CaseStatus::Failed => write!(f, "failed"),
        }
    }
}

/// One progress step reported for a case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseUpdate {
    #[serde(default)]
    pub cost: f64,
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Set when the agent needs human input before going on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub question: Option<serde_json::Value>,
    #[serde(default)]
    pub is_final: bool,
    pub at: DateTime<Utc>,
}

impl CaseUpdate {
    pub fn new(cost: f64, payload: serde_json::Value, now: DateTime<Utc>) -> Self {
        Self {
            cost,
            payload,
            question: None,
            is_final: false,
            at: now,
        }
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        check_cost(self.cost)
    }
}

pub(crate) fn check_cost(cost: f64) -> std::result::Result<(), String> {
    if !cost.is_finite() || cost < 0.0 {
        return Err(format!("cost must be a non-negative number, got {}", cost));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Case {
    pub id: Uuid,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub status: CaseStatus,
    #[serde(default)]
    pub updates: Vec<CaseUpdate>,
    /// Sum of update costs, or the final cost given at close.
    #[serde(default)]
    pub total_cost: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_delivery: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Case {
    pub fn new(id: Uuid, name: String, description: Option<String>, now: DateTime<Utc>) -> Self {
        Self {
            id,
            name,
            description,
            status: CaseStatus::InProgress,
            updates: Vec::new(),
            total_cost: 0.0,
            final_delivery: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn check_open(&self) -> Result<()> {
        if !self.status.is_open() {
            return Err(ControllerError::InvalidTransition {
                entity: format!("case {}", self.id),
                from: self.status.to_string(),
                to: "updated".to_string(),
            });
        }
        Ok(())
    }

    /// Append an update. A question parks the case in `awaiting_input`
    /// until the next update without one.
    pub(crate) fn record(&mut self, update: CaseUpdate) -> Result<()> {
        self.check_open()?;
        update.validate().map_err(ControllerError::InvalidRequest)?;

        self.status = if update.question.is_some() {
            CaseStatus::AwaitingInput
        } else {
            CaseStatus::InProgress
        };
        self.total_cost += update.cost;
        self.updated_at = update.at;
        self.updates.push(update);
        Ok(())
    }

    /// Deliver the case. `final_cost` replaces the running total when given.
    pub(crate) fn close(
        &mut self,
        delivery: serde_json::Value,
        final_cost: Option<f64>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.check_open()?;
        if let Some(cost) = final_cost {
            check_cost(cost).map_err(ControllerError::InvalidRequest)?;
            self.total_cost = cost;
        }
        self.status = CaseStatus::Completed;
        self.final_delivery = Some(delivery);
        self.updated_at = now;
        Ok(())
    }

    /// Mark an open case failed when its job stops underneath it.
    pub(crate) fn abandon(&mut self, now: DateTime<Utc>) {
        if self.status.is_open() {
            self.status = CaseStatus::Failed;
            self.updated_at = now;
        }
    }
}
