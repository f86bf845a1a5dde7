use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::ledger::CaseStatus;

const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Lifecycle events published after each committed transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControllerEvent {
    AgentRegistered { agent_id: Uuid },
    AgentActivated { agent_id: Uuid },
    AgentUnreachable { agent_id: Uuid, released_jobs: Vec<Uuid> },
    AgentRevoked { agent_id: Uuid, released_jobs: Vec<Uuid> },
    AgentPurged { agent_id: Uuid },
    JobSubmitted { job_id: Uuid, capability: String },
    JobAssigned { job_id: Uuid, agent_id: Uuid },
    JobStarted { job_id: Uuid, agent_id: Uuid },
    JobSucceeded { job_id: Uuid, agent_id: Uuid },
    JobFailed { job_id: Uuid, agent_id: Uuid, error: String },
    JobRequeued { job_id: Uuid, released_by: Uuid },
    JobExpired { job_id: Uuid },
    JobArchived { job_id: Uuid },
    CaseStarted { job_id: Uuid, case_id: Uuid },
    CaseUpdated { job_id: Uuid, case_id: Uuid, status: CaseStatus },
    CaseClosed { job_id: Uuid, case_id: Uuid },
}

/// Fan-out of [`ControllerEvent`]s. Publishing never blocks; slow
/// subscribers lag and miss events rather than holding up transitions.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ControllerEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: ControllerEvent) {
        tracing::debug!(?event, "Controller event");
        // No subscribers is fine
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ControllerEvent> {
        self.tx.subscribe()
    }
}
