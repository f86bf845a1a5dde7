//! Messages carried inside request and response envelopes.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::identity::PublicKey;
use crate::ledger::{Case, Job, JobConditions, JobOutcome, JobState};
use crate::registry::{Agent, AgentStatus};

pub const DEFAULT_PAGE_SIZE: usize = 100;
pub const MAX_PAGE_SIZE: usize = 1_000;

fn default_limit() -> usize {
    DEFAULT_PAGE_SIZE
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityResponse {
    pub public_key: PublicKey,
}

/// Signed by the key being registered, proving possession of it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub public_key: PublicKey,
    pub capabilities: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub agent_id: Uuid,
    pub status: AgentStatus,
    /// The key was already registered under `agent_id`.
    pub existing: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeartbeatRequest {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub agent_id: Uuid,
    pub status: AgentStatus,
    /// Jobs assigned to the agent and waiting to be started.
    pub assignments: Vec<Job>,
}

/// `idempotency_key` is required; an empty key is refused by the handler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitJobRequest {
    pub capability: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub idempotency_key: String,
    #[serde(default)]
    pub conditions: JobConditions,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitJobResponse {
    pub job_id: Uuid,
    pub state: Option<JobState>,
    pub duplicate: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRef {
    pub job_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResultRequest {
    pub job_id: Uuid,
    #[serde(flatten)]
    pub outcome: JobOutcome,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListJobsRequest {
    #[serde(default)]
    pub state: Option<JobState>,
    #[serde(default)]
    pub skip: usize,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListJobsResponse {
    pub jobs: Vec<Job>,
    pub total: usize,
    pub skip: usize,
    pub limit: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListAgentsRequest {
    #[serde(default)]
    pub skip: usize,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListAgentsResponse {
    pub agents: Vec<Agent>,
    pub total: usize,
    pub skip: usize,
    pub limit: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRef {
    pub agent_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RevokeResponse {
    pub agent_id: Uuid,
    pub status: AgentStatus,
    /// Jobs taken back from the agent (requeued or expired).
    pub released_jobs: Vec<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartCaseRequest {
    pub job_id: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateCaseRequest {
    pub job_id: Uuid,
    pub case_id: Uuid,
    #[serde(default)]
    pub cost: f64,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub question: Option<serde_json::Value>,
    #[serde(default)]
    pub is_final: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloseCaseRequest {
    pub job_id: Uuid,
    pub case_id: Uuid,
    #[serde(default)]
    pub result: serde_json::Value,
    #[serde(default)]
    pub final_cost: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaseResponse {
    pub job_id: Uuid,
    pub case: Option<Case>,
    pub job_state: JobState,
    /// The limit that stopped the job, when this call reached one.
    pub stopped: Option<String>,
}

/// Body of every error response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub code: String,
    pub retryable: bool,
}

/// Clamp a requested page size to `1..=MAX_PAGE_SIZE`.
pub fn page_limit(requested: usize) -> usize {
    requested.clamp(1, MAX_PAGE_SIZE)
}
