//! Signed HTTP client for the controller API, used by the CLI and by agents.

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::OnceCell;
use uuid::Uuid;

use crate::error::{ControllerError, Result};
use crate::gateway::wire::*;
use crate::identity::{KeyPair, PublicKey, SignedEnvelope};
use crate::ledger::{Job, JobConditions, JobOutcome, JobState};

/// Responses older or newer than this are refused when verifying.
const RESPONSE_SKEW_SECS: u64 = 300;

pub struct ControllerClient {
    http: reqwest::Client,
    base_url: String,
    keys: KeyPair,
    /// Agent identifier once registered; requests are otherwise signed as the bare key.
    agent_id: Option<Uuid>,
    /// Key every response must be signed by. Pinned up front, or taken from
    /// the controller's self-signed identity on first use.
    controller_key: OnceCell<PublicKey>,
}

impl ControllerClient {
    pub fn new(base_url: impl Into<String>, keys: KeyPair) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            keys,
            agent_id: None,
            controller_key: OnceCell::new(),
        }
    }

    /// Sign requests as the given registered agent.
    pub fn with_agent_id(mut self, agent_id: Uuid) -> Self {
        self.agent_id = Some(agent_id);
        self
    }

    pub fn with_controller_key(mut self, key: PublicKey) -> Self {
        self.controller_key = OnceCell::new_with(Some(key));
        self
    }

    pub fn public_key(&self) -> PublicKey {
        self.keys.public()
    }

    pub fn agent_id(&self) -> Option<Uuid> {
        self.agent_id
    }

    fn signer(&self) -> String {
        match self.agent_id {
            Some(id) => id.to_string(),
            None => self.keys.public().to_hex(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/v1{}", self.base_url, path)
    }

    async fn call<Req, Resp>(&self, path: &str, message: &Req) -> Result<Resp>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let envelope = SignedEnvelope::seal(self.signer(), message, &self.keys)?;
        let response = self
            .http
            .post(self.url(path))
            .json(&envelope)
            .send()
            .await?;
        self.read_response(response).await
    }

    async fn read_response<Resp: DeserializeOwned>(&self, response: reqwest::Response) -> Result<Resp> {
        let status = response.status();
        let body = response.bytes().await?;
        let envelope = SignedEnvelope::from_slice(&body)?;
        // error bodies are verified too, a forged error must not pass
        let key = self.controller_key().await?;
        envelope.open::<serde_json::Value>(&key, RESPONSE_SKEW_SECS)?;

        if !status.is_success() {
            let error: ErrorBody = envelope.decode()?;
            return Err(ControllerError::Remote {
                status: status.as_u16(),
                code: error.code,
                message: error.error,
            });
        }
        envelope.decode()
    }

    /// The key responses are checked against, fetched once when not pinned.
    async fn controller_key(&self) -> Result<PublicKey> {
        self.controller_key
            .get_or_try_init(|| self.fetch_identity())
            .await
            .copied()
    }

    /// The controller's self-signed identity, checked only for consistency.
    async fn fetch_identity(&self) -> Result<PublicKey> {
        let response = self.http.get(self.url("/identity")).send().await?;
        let body = response.bytes().await?;
        let envelope = SignedEnvelope::from_slice(&body)?;
        let identity: IdentityResponse = envelope.decode()?;
        envelope.open::<IdentityResponse>(&identity.public_key, RESPONSE_SKEW_SECS)?;
        if envelope.signer != identity.public_key.to_hex() {
            return Err(ControllerError::InvalidSignature);
        }
        tracing::debug!(controller_key = %identity.public_key, "Fetched controller identity");
        Ok(identity.public_key)
    }

    /// Fetch the controller's public key. It must match the key this client
    /// trusts: the pinned one, or the one seen on first contact.
    pub async fn identity(&self) -> Result<PublicKey> {
        let presented = self.fetch_identity().await?;
        let trusted = self.controller_key().await?;
        if presented != trusted {
            return Err(ControllerError::Unauthorized(format!(
                "controller presented key {}, expected {}",
                presented, trusted
            )));
        }
        Ok(presented)
    }

    /// Register this client's key as an agent and sign as that agent from now on.
    pub async fn register(&mut self, capabilities: Vec<String>) -> Result<RegisterResponse> {
        let request = RegisterRequest {
            public_key: self.keys.public(),
            capabilities,
        };
        self.agent_id = None;
        let response: RegisterResponse = self.call("/agents/register", &request).await?;
        self.agent_id = Some(response.agent_id);
        Ok(response)
    }

    pub async fn heartbeat(&self) -> Result<HeartbeatResponse> {
        self.call("/agents/heartbeat", &HeartbeatRequest::default())
            .await
    }

    pub async fn list_agents(&self, skip: usize, limit: usize) -> Result<ListAgentsResponse> {
        self.call("/agents/list", &ListAgentsRequest { skip, limit })
            .await
    }

    pub async fn revoke_agent(&self, agent_id: Uuid) -> Result<RevokeResponse> {
        self.call("/agents/revoke", &AgentRef { agent_id }).await
    }

    /// Submit a job. Resubmitting with the same `idempotency_key` returns
    /// the original job instead of a second one.
    pub async fn submit_job(
        &self,
        capability: impl Into<String>,
        payload: serde_json::Value,
        idempotency_key: impl Into<String>,
    ) -> Result<SubmitJobResponse> {
        self.submit_job_with(capability, payload, idempotency_key, JobConditions::default())
            .await
    }

    pub async fn submit_job_with(
        &self,
        capability: impl Into<String>,
        payload: serde_json::Value,
        idempotency_key: impl Into<String>,
        conditions: JobConditions,
    ) -> Result<SubmitJobResponse> {
        let request = SubmitJobRequest {
            capability: capability.into(),
            payload,
            idempotency_key: idempotency_key.into(),
            conditions,
        };
        self.call("/jobs/submit", &request).await
    }

    pub async fn job_status(&self, job_id: Uuid) -> Result<Job> {
        self.call("/jobs/status", &JobRef { job_id }).await
    }

    pub async fn list_jobs(
        &self,
        state: Option<JobState>,
        skip: usize,
        limit: usize,
    ) -> Result<ListJobsResponse> {
        self.call("/jobs/list", &ListJobsRequest { state, skip, limit })
            .await
    }

    pub async fn start_job(&self, job_id: Uuid) -> Result<Job> {
        self.call("/jobs/start", &JobRef { job_id }).await
    }

    pub async fn report_result(&self, job_id: Uuid, outcome: JobOutcome) -> Result<Job> {
        self.call("/jobs/result", &JobResultRequest { job_id, outcome })
            .await
    }

    pub async fn archive_job(&self, job_id: Uuid) -> Result<Job> {
        self.call("/jobs/archive", &JobRef { job_id }).await
    }

    pub async fn start_case(
        &self,
        job_id: Uuid,
        name: impl Into<String>,
        description: Option<String>,
    ) -> Result<CaseResponse> {
        let request = StartCaseRequest {
            job_id,
            name: name.into(),
            description,
        };
        self.call("/cases/start", &request).await
    }

    pub async fn update_case(&self, request: &UpdateCaseRequest) -> Result<CaseResponse> {
        self.call("/cases/update", request).await
    }

    pub async fn close_case(
        &self,
        job_id: Uuid,
        case_id: Uuid,
        result: serde_json::Value,
        final_cost: Option<f64>,
    ) -> Result<CaseResponse> {
        let request = CloseCaseRequest {
            job_id,
            case_id,
            result,
            final_cost,
        };
        self.call("/cases/close", &request).await
    }

    pub async fn health(&self) -> Result<bool> {
        let response = self
            .http
            .get(format!("{}/health", self.base_url))
            .send()
            .await?;
        Ok(response.status().is_success())
    }
}
