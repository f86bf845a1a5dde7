use axum::extract::State;
use axum::Json;
use chrono::Utc;
use uuid::Uuid;

use crate::error::{ControllerError, Result};
use crate::gateway::auth::{Authenticated, Caller};
use crate::gateway::wire::*;
use crate::gateway::GatewayState;
use crate::ledger::{CaseProgress, CaseUpdate, Job};
use crate::registry::CapabilitySet;

pub async fn health() -> &'static str {
    "ok"
}

pub async fn identity(State(state): State<GatewayState>) -> Json<IdentityResponse> {
    Json(IdentityResponse {
        public_key: state.keys.public(),
    })
}

pub async fn register_agent(
    State(state): State<GatewayState>,
    req: Authenticated<RegisterRequest>,
) -> Result<Json<RegisterResponse>> {
    let Caller::Key(signer) = req.caller else {
        return Err(ControllerError::Unauthorized(
            "registration must be signed with the key being registered".to_string(),
        ));
    };
    if signer != req.message.public_key {
        return Err(ControllerError::Unauthorized(
            "registration signer does not match the declared public key".to_string(),
        ));
    }
    let capabilities =
        CapabilitySet::parse(&req.message.capabilities).map_err(ControllerError::InvalidRequest)?;

    let registration = state
        .dispatcher
        .register_agent(req.message.public_key, capabilities)
        .await?;
    Ok(Json(RegisterResponse {
        agent_id: registration.agent_id,
        status: registration.status,
        existing: registration.existing,
    }))
}

pub async fn heartbeat(
    State(state): State<GatewayState>,
    req: Authenticated<HeartbeatRequest>,
) -> Result<Json<HeartbeatResponse>> {
    let agent_id = req.caller.require_agent()?.id;
    let (agent, assignments) = state.dispatcher.heartbeat(agent_id).await?;
    Ok(Json(HeartbeatResponse {
        agent_id,
        status: agent.status,
        assignments,
    }))
}

pub async fn list_agents(
    State(state): State<GatewayState>,
    req: Authenticated<ListAgentsRequest>,
) -> Result<Json<ListAgentsResponse>> {
    req.caller.require_client(&state)?;
    let limit = page_limit(req.message.limit);
    let (agents, total) = state
        .dispatcher
        .list_agents(req.message.skip, limit)
        .await?;
    Ok(Json(ListAgentsResponse {
        agents,
        total,
        skip: req.message.skip,
        limit,
    }))
}

/// Clients may revoke any agent; an agent may revoke only itself.
pub async fn revoke_agent(
    State(state): State<GatewayState>,
    req: Authenticated<AgentRef>,
) -> Result<Json<RevokeResponse>> {
    let agent_id = req.message.agent_id;
    if req.caller.agent_id() != Some(agent_id) {
        req.caller.require_client(&state)?;
    }

    let release = state.dispatcher.revoke_agent(agent_id).await?;
    let agent = state.dispatcher.agent(agent_id).await?;
    Ok(Json(RevokeResponse {
        agent_id,
        status: agent.status,
        released_jobs: release.job_ids(),
    }))
}

pub async fn submit_job(
    State(state): State<GatewayState>,
    req: Authenticated<SubmitJobRequest>,
) -> Result<Json<SubmitJobResponse>> {
    let client = req.caller.require_client(&state)?;
    let SubmitJobRequest {
        capability,
        payload,
        idempotency_key,
        conditions,
    } = req.message;
    let key = idempotency_key.trim();
    if key.is_empty() {
        return Err(ControllerError::InvalidRequest(
            "idempotency_key is required".to_string(),
        ));
    }
    // keys are per client so two submitters cannot collide
    let idempotency_key = format!("{}:{}", client.to_hex(), key);

    let submission = state
        .dispatcher
        .submit_job_with(&capability, payload, Some(idempotency_key), conditions)
        .await?;
    Ok(Json(SubmitJobResponse {
        job_id: submission.job_id,
        state: submission.state,
        duplicate: submission.duplicate,
    }))
}

/// Visible to clients and to the agent the job is assigned to.
pub async fn job_status(
    State(state): State<GatewayState>,
    req: Authenticated<JobRef>,
) -> Result<Json<Job>> {
    let job = state.dispatcher.job(req.message.job_id).await?;
    match req.caller.agent_id() {
        Some(agent_id) if job.assigned_agent == Some(agent_id) => {}
        _ => {
            req.caller.require_client(&state)?;
        }
    }
    Ok(Json(job))
}

pub async fn list_jobs(
    State(state): State<GatewayState>,
    req: Authenticated<ListJobsRequest>,
) -> Result<Json<ListJobsResponse>> {
    req.caller.require_client(&state)?;
    let limit = page_limit(req.message.limit);
    let (jobs, total) = state
        .dispatcher
        .list_jobs(req.message.state, req.message.skip, limit)
        .await?;
    Ok(Json(ListJobsResponse {
        jobs,
        total,
        skip: req.message.skip,
        limit,
    }))
}

pub async fn start_job(
    State(state): State<GatewayState>,
    req: Authenticated<JobRef>,
) -> Result<Json<Job>> {
    let agent_id = req.caller.require_agent()?.id;
    let job = state
        .dispatcher
        .start_job(req.message.job_id, agent_id)
        .await?;
    Ok(Json(job))
}

pub async fn job_result(
    State(state): State<GatewayState>,
    req: Authenticated<JobResultRequest>,
) -> Result<Json<Job>> {
    let agent_id = req.caller.require_agent()?.id;
    let job = state
        .dispatcher
        .finish_job(req.message.job_id, agent_id, req.message.outcome)
        .await?;
    Ok(Json(job))
}

pub async fn archive_job(
    State(state): State<GatewayState>,
    req: Authenticated<JobRef>,
) -> Result<Json<Job>> {
    req.caller.require_client(&state)?;
    let job = state.dispatcher.archive_job(req.message.job_id).await?;
    Ok(Json(job))
}

fn case_response(job_id: Uuid, progress: CaseProgress) -> Json<CaseResponse> {
    Json(CaseResponse {
        job_id,
        case: progress.case,
        job_state: progress.job_state,
        stopped: progress.stopped,
    })
}

pub async fn start_case(
    State(state): State<GatewayState>,
    req: Authenticated<StartCaseRequest>,
) -> Result<Json<CaseResponse>> {
    let agent_id = req.caller.require_agent()?.id;
    let StartCaseRequest {
        job_id,
        name,
        description,
    } = req.message;
    let progress = state
        .dispatcher
        .start_case(job_id, agent_id, &name, description)
        .await?;
    Ok(case_response(job_id, progress))
}

pub async fn update_case(
    State(state): State<GatewayState>,
    req: Authenticated<UpdateCaseRequest>,
) -> Result<Json<CaseResponse>> {
    let agent_id = req.caller.require_agent()?.id;
    let msg = req.message;
    let mut update = CaseUpdate::new(msg.cost, msg.payload, Utc::now());
    update.question = msg.question;
    update.is_final = msg.is_final;

    let progress = state
        .dispatcher
        .update_case(msg.job_id, agent_id, msg.case_id, update)
        .await?;
    Ok(case_response(msg.job_id, progress))
}

pub async fn close_case(
    State(state): State<GatewayState>,
    req: Authenticated<CloseCaseRequest>,
) -> Result<Json<CaseResponse>> {
    let agent_id = req.caller.require_agent()?.id;
    let msg = req.message;
    let progress = state
        .dispatcher
        .close_case(msg.job_id, agent_id, msg.case_id, msg.result, msg.final_cost)
        .await?;
    Ok(case_response(msg.job_id, progress))
}
