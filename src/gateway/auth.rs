//! Envelope authentication for incoming requests.
//!
//! The `signer` field says who claims to have signed: an agent identifier
//! (verified against the key the agent registered) or a hex public key
//! (verified against itself, then authorized as a client or registrant).
//! A verified signature is accepted once; replays inside the freshness
//! window are refused by [`ReplayGuard`].

use std::collections::HashMap;

use axum::body::Bytes;
use axum::extract::{FromRequest, Request};
use chrono::Utc;
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{ControllerError, Result};
use crate::gateway::GatewayState;
use crate::identity::{PublicKey, Signature, SignedEnvelope};
use crate::registry::{Agent, AgentStatus};

/// The verified origin of a request.
#[derive(Debug, Clone)]
pub enum Caller {
    /// A registered agent, signing with its agent identifier.
    Agent(Agent),
    /// Anyone signing with a bare public key.
    Key(PublicKey),
}

impl Caller {
    pub fn require_agent(&self) -> Result<&Agent> {
        match self {
            Caller::Agent(agent) => Ok(agent),
            Caller::Key(key) => Err(ControllerError::Unauthorized(format!(
                "{} is not a registered agent identity",
                key
            ))),
        }
    }

    /// The caller's key, if it is on the authorized client list.
    pub fn require_client(&self, state: &GatewayState) -> Result<PublicKey> {
        match self {
            Caller::Key(key) if state.auth.is_client_authorized(key) => Ok(*key),
            Caller::Key(key) => Err(ControllerError::Unauthorized(format!(
                "client {} is not authorized",
                key
            ))),
            Caller::Agent(agent) => Err(ControllerError::Unauthorized(format!(
                "agent {} cannot act as a client",
                agent.id
            ))),
        }
    }

    pub fn agent_id(&self) -> Option<Uuid> {
        match self {
            Caller::Agent(agent) => Some(agent.id),
            Caller::Key(_) => None,
        }
    }

    pub fn public_key(&self) -> PublicKey {
        match self {
            Caller::Agent(agent) => agent.public_key,
            Caller::Key(key) => *key,
        }
    }
}

/// Request body extractor: a verified envelope and its decoded message.
#[derive(Debug)]
pub struct Authenticated<T> {
    pub caller: Caller,
    pub message: T,
}

impl<T> FromRequest<GatewayState> for Authenticated<T>
where
    T: DeserializeOwned + Send,
{
    type Rejection = ControllerError;

    async fn from_request(req: Request, state: &GatewayState) -> Result<Self> {
        let body = Bytes::from_request(req, state)
            .await
            .map_err(|e| ControllerError::MalformedEnvelope(e.body_text()))?;
        authenticate(state, &body).await
    }
}

/// Parse, resolve, verify and decode one request body.
pub async fn authenticate<T: DeserializeOwned>(
    state: &GatewayState,
    body: &[u8],
) -> Result<Authenticated<T>> {
    let envelope = SignedEnvelope::from_slice(body)?;
    let now = Utc::now().timestamp();
    envelope.check_freshness(now, state.auth.max_clock_skew_secs)?;

    let caller = resolve_signer(state, &envelope.signer).await?;
    let key = caller.public_key();
    let timeout = state.auth.verify_timeout();

    // verification is CPU-bound, keep it off the async workers
    let verified = tokio::time::timeout(
        timeout,
        tokio::task::spawn_blocking(move || envelope.verify(&key).map(|()| envelope)),
    )
    .await
    .map_err(|_| ControllerError::Timeout("signature verification"))?
    .map_err(|e| ControllerError::Internal(format!("verification task failed: {}", e)))?;

    let envelope = match verified {
        Ok(envelope) => envelope,
        Err(e) => {
            tracing::warn!(signer = %key, "Rejected request with invalid signature");
            return Err(e);
        }
    };

    // only verified signatures are remembered, forgeries cannot fill the cache
    if let Err(e) = state
        .replay
        .admit(envelope.signature, envelope.issued_at, now)
        .await
    {
        tracing::warn!(signer = %key, error = %e, "Rejected replayed request");
        return Err(e);
    }

    Ok(Authenticated {
        caller,
        message: envelope.decode()?,
    })
}

async fn resolve_signer(state: &GatewayState, signer: &str) -> Result<Caller> {
    if let Ok(agent_id) = signer.parse::<Uuid>() {
        let agent = match state.dispatcher.agent(agent_id).await {
            Ok(agent) => agent,
            Err(ControllerError::UnknownAgent(_)) => {
                return Err(ControllerError::Unauthorized(format!(
                    "unknown agent {}",
                    agent_id
                )))
            }
            Err(e) => return Err(e),
        };
        if agent.status == AgentStatus::Revoked {
            return Err(ControllerError::AgentRevoked(agent_id));
        }
        return Ok(Caller::Agent(agent));
    }

    signer
        .parse::<PublicKey>()
        .map(Caller::Key)
        .map_err(|_| ControllerError::MalformedEnvelope(format!("unrecognized signer {:?}", signer)))
}

/// Signatures accepted within the freshness window.
///
/// An entry can be dropped once its envelope is too old to pass
/// [`SignedEnvelope::check_freshness`], so the set only ever covers the
/// window. It is bounded: when full of live entries, new requests are
/// refused with a retryable error rather than letting replays through.
#[derive(Debug)]
pub struct ReplayGuard {
    seen: Mutex<HashMap<Signature, i64>>,
    capacity: usize,
    window_secs: i64,
}

impl ReplayGuard {
    pub fn new(capacity: usize, window_secs: u64) -> Self {
        Self {
            seen: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
            window_secs: i64::try_from(window_secs).unwrap_or(i64::MAX),
        }
    }

    /// Record `signature`, failing if it was already accepted.
    pub async fn admit(&self, signature: Signature, issued_at: i64, now: i64) -> Result<()> {
        let mut seen = self.seen.lock().await;
        if seen.contains_key(&signature) {
            return Err(ControllerError::Replayed);
        }
        if seen.len() >= self.capacity {
            seen.retain(|_, fresh_until| *fresh_until >= now);
        }
        if seen.len() >= self.capacity {
            return Err(ControllerError::Timeout("replay cache space"));
        }
        seen.insert(signature, issued_at.saturating_add(self.window_secs));
        Ok(())
    }

    pub async fn len(&self) -> usize {
        self.seen.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::generate_keypair;

    fn signature(n: u8) -> Signature {
        let keys = generate_keypair();
        SignedEnvelope::seal_at("c", &n, &keys, 0).unwrap().signature
    }

    #[tokio::test]
    async fn test_replay_guard_rejects_second_use() {
        let guard = ReplayGuard::new(10, 300);
        let sig = signature(1);
        guard.admit(sig, 1_000, 1_000).await.unwrap();
        assert!(matches!(
            guard.admit(sig, 1_000, 1_001).await,
            Err(ControllerError::Replayed)
        ));
    }

    #[tokio::test]
    async fn test_replay_guard_prunes_entries_outside_window() {
        let guard = ReplayGuard::new(2, 300);
        guard.admit(signature(1), 1_000, 1_000).await.unwrap();
        guard.admit(signature(2), 1_000, 1_000).await.unwrap();

        // full of live entries
        let err = guard.admit(signature(3), 1_100, 1_100).await.unwrap_err();
        assert!(err.is_retryable());

        // both earlier entries are now too old to pass freshness
        guard.admit(signature(4), 1_400, 1_400).await.unwrap();
        assert_eq!(guard.len().await, 1);
    }
}
