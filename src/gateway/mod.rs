//! HTTP API gateway.
//!
//! Every `/api/v1` request body is a [`SignedEnvelope`] checked by
//! [`auth::Authenticated`] before a handler runs. Every JSON response,
//! errors included, is wrapped in an envelope signed with the controller
//! key by the [`sign_response`] layer.

pub mod auth;
pub mod routes;
pub mod wire;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::config::AuthConfig;
use crate::dispatch::Dispatcher;
use crate::error::{ControllerError, Result};
use crate::identity::{KeyPair, SignedEnvelope};

pub use auth::{Authenticated, Caller, ReplayGuard};
use wire::ErrorBody;

/// Largest response body the signing layer will buffer.
const MAX_RESPONSE_BYTES: usize = 16 * 1024 * 1024;

#[derive(Clone)]
pub struct GatewayState {
    pub dispatcher: Dispatcher,
    pub keys: Arc<KeyPair>,
    pub auth: Arc<AuthConfig>,
    pub replay: Arc<ReplayGuard>,
}

impl GatewayState {
    pub fn new(dispatcher: Dispatcher, keys: KeyPair, auth: AuthConfig) -> Self {
        let replay = ReplayGuard::new(auth.replay_cache_capacity, auth.max_clock_skew_secs);
        Self {
            dispatcher,
            keys: Arc::new(keys),
            auth: Arc::new(auth),
            replay: Arc::new(replay),
        }
    }
}

pub fn router(state: GatewayState) -> Router {
    let api = Router::new()
        .route("/identity", get(routes::identity))
        .route("/agents/register", post(routes::register_agent))
        .route("/agents/heartbeat", post(routes::heartbeat))
        .route("/agents/list", post(routes::list_agents))
        .route("/agents/revoke", post(routes::revoke_agent))
        .route("/jobs/submit", post(routes::submit_job))
        .route("/jobs/status", post(routes::job_status))
        .route("/jobs/list", post(routes::list_jobs))
        .route("/jobs/start", post(routes::start_job))
        .route("/jobs/result", post(routes::job_result))
        .route("/jobs/archive", post(routes::archive_job))
        .route("/cases/start", post(routes::start_case))
        .route("/cases/update", post(routes::update_case))
        .route("/cases/close", post(routes::close_case))
        .layer(middleware::from_fn_with_state(state.clone(), sign_response));

    Router::new()
        .route("/health", get(routes::health))
        .nest("/api/v1", api)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the API on `listener` until `shutdown` is cancelled.
pub async fn serve(
    listener: TcpListener,
    state: GatewayState,
    shutdown: CancellationToken,
) -> Result<()> {
    let addr: Option<SocketAddr> = listener.local_addr().ok();
    tracing::info!(addr = ?addr, "API gateway listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    tracing::info!("API gateway stopped");
    Ok(())
}

/// Wrap JSON response bodies in an envelope signed by the controller.
async fn sign_response(State(state): State<GatewayState>, req: Request, next: Next) -> Response {
    let response = next.run(req).await;
    let is_json = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("application/json"));
    if !is_json {
        return response;
    }

    let (mut parts, body) = response.into_parts();
    let signed = async {
        let bytes = axum::body::to_bytes(body, MAX_RESPONSE_BYTES)
            .await
            .map_err(|e| ControllerError::Internal(format!("reading response body: {}", e)))?;
        let payload = String::from_utf8(bytes.to_vec())
            .map_err(|e| ControllerError::Internal(format!("response body is not UTF-8: {}", e)))?;
        SignedEnvelope::seal_text(
            state.keys.public().to_hex(),
            payload,
            &state.keys,
            Utc::now().timestamp(),
        )
    }
    .await;

    match signed.and_then(|envelope| Ok(serde_json::to_vec(&envelope)?)) {
        Ok(bytes) => {
            parts.headers.remove(header::CONTENT_LENGTH);
            Response::from_parts(parts, Body::from(bytes))
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to sign response");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

impl ControllerError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidSignature | Self::Replayed => StatusCode::UNAUTHORIZED,
            Self::MalformedEnvelope(_) | Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) | Self::AgentRevoked(_) => StatusCode::FORBIDDEN,
            Self::UnknownAgent(_) | Self::UnknownJob(_) | Self::UnknownCase { .. } => {
                StatusCode::NOT_FOUND
            }
            Self::InvalidTransition { .. }
            | Self::AlreadyRegistered(_)
            | Self::DuplicateSubmission(_) => StatusCode::CONFLICT,
            Self::Expired(_) => StatusCode::GONE,
            Self::Timeout(_) | Self::AtCapacity | Self::NoEligibleAgent(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Self::Remote { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            Self::Key(_)
            | Self::Persistence(_)
            | Self::Serialization(_)
            | Self::Io(_)
            | Self::Transport(_)
            | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidSignature => "invalid_signature",
            Self::Replayed => "replayed_envelope",
            Self::MalformedEnvelope(_) => "malformed_envelope",
            Self::Unauthorized(_) => "unauthorized",
            Self::InvalidRequest(_) => "invalid_request",
            Self::UnknownAgent(_) => "unknown_agent",
            Self::UnknownJob(_) => "unknown_job",
            Self::UnknownCase { .. } => "unknown_case",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::AlreadyRegistered(_) => "already_registered",
            Self::DuplicateSubmission(_) => "duplicate_submission",
            Self::AgentRevoked(_) => "agent_revoked",
            Self::NoEligibleAgent(_) => "no_eligible_agent",
            Self::Expired(_) => "expired",
            Self::Timeout(_) => "timeout",
            Self::AtCapacity => "at_capacity",
            Self::Remote { .. } => "remote",
            Self::Key(_) | Self::Persistence(_) | Self::Serialization(_) | Self::Io(_) => "internal",
            Self::Transport(_) | Self::Internal(_) => "internal",
        }
    }
}

impl IntoResponse for ControllerError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        } else {
            tracing::debug!(error = %self, status = %status, "Request rejected");
        }

        // internal details stay in the log
        let error = if status == StatusCode::INTERNAL_SERVER_ERROR {
            "internal error".to_string()
        } else {
            self.to_string()
        };
        let body = ErrorBody {
            error,
            code: self.code().to_string(),
            retryable: self.is_retryable(),
        };
        (status, Json(body)).into_response()
    }
}
