use thiserror::Error;
use uuid::Uuid;

use crate::identity::KeyError;
use crate::ledger::JobState;

#[derive(Error, Debug)]
pub enum ControllerError {
    #[error("Invalid signature")]
    InvalidSignature,

    #[error("Envelope was already accepted once")]
    Replayed,

    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(String),

    #[error("Signer not authorized: {0}")]
    Unauthorized(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Agent not found: {0}")]
    UnknownAgent(Uuid),

    #[error("Job not found: {0}")]
    UnknownJob(Uuid),

    #[error("Case {case_id} not found on job {job_id}")]
    UnknownCase { job_id: Uuid, case_id: Uuid },

    #[error("Invalid transition for {entity}: {from} -> {to}")]
    InvalidTransition {
        entity: String,
        from: String,
        to: String,
    },

    #[error("Public key already registered as agent {0}")]
    AlreadyRegistered(Uuid),

    #[error("Duplicate submission, original job is {0}")]
    DuplicateSubmission(Uuid),

    #[error("Agent {0} has been revoked")]
    AgentRevoked(Uuid),

    #[error("No eligible agent for capability {0}")]
    NoEligibleAgent(String),

    #[error("Job {0} has expired")]
    Expired(Uuid),

    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("Job ledger is at capacity")]
    AtCapacity,

    #[error("Key error: {0}")]
    Key(#[from] KeyError),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Controller returned {status} {code}: {message}")]
    Remote {
        status: u16,
        code: String,
        message: String,
    },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ControllerError {
    pub fn job_transition(job_id: Uuid, from: JobState, to: JobState) -> Self {
        Self::InvalidTransition {
            entity: format!("job {}", job_id),
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    pub fn agent_transition(agent_id: Uuid, from: impl ToString, to: impl ToString) -> Self {
        Self::InvalidTransition {
            entity: format!("agent {}", agent_id),
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    /// Errors a caller may retry unchanged after a short delay.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout(_) | Self::NoEligibleAgent(_) | Self::AtCapacity => true,
            Self::Remote { status, .. } => *status == 503,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, ControllerError>;
