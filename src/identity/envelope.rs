use chrono::Utc;
use rand::RngCore;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{ControllerError, Result};
use crate::identity::keys::{self, KeyPair, PublicKey, Signature};

/// Version tag prefixed to the signed message.
const ENVELOPE_VERSION: u8 = 1;

/// Random bytes per envelope. Signatures are deterministic, so the nonce is
/// what keeps two identical messages sealed in the same second distinct.
const NONCE_BYTES: usize = 16;

/// Wire wrapper pairing a JSON payload with its signer and signature.
///
/// `payload` is kept as the raw JSON text that was signed, so verification
/// is bit-exact and never depends on re-serialization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedEnvelope {
    pub signer: String,
    pub issued_at: i64,
    pub nonce: String,
    pub payload: String,
    pub signature: Signature,
}

impl SignedEnvelope {
    /// Serialize `message` and sign it as `signer`, stamped with the current time.
    pub fn seal<T: Serialize>(signer: impl Into<String>, message: &T, keys: &KeyPair) -> Result<Self> {
        Self::seal_at(signer, message, keys, Utc::now().timestamp())
    }

    pub fn seal_at<T: Serialize>(
        signer: impl Into<String>,
        message: &T,
        keys: &KeyPair,
        issued_at: i64,
    ) -> Result<Self> {
        let payload = serde_json::to_string(message)?;
        Self::seal_text(signer, payload, keys, issued_at)
    }

    /// Sign JSON text that is already serialized, keeping it byte for byte.
    pub fn seal_text(
        signer: impl Into<String>,
        payload: String,
        keys: &KeyPair,
        issued_at: i64,
    ) -> Result<Self> {
        let signer = signer.into();
        let nonce = fresh_nonce();
        let bytes = Self::signing_bytes(&signer, issued_at, &nonce, &payload)?;
        let signature = keys::sign(&bytes, keys.private());

        Ok(Self {
            signer,
            issued_at,
            nonce,
            payload,
            signature,
        })
    }

    /// Canonical signed form: `[version, signer, issued_at, nonce, payload]`.
    pub fn signing_bytes(
        signer: &str,
        issued_at: i64,
        nonce: &str,
        payload: &str,
    ) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&(
            ENVELOPE_VERSION,
            signer,
            issued_at,
            nonce,
            payload,
        ))?)
    }

    /// Check the signature against `key`.
    pub fn verify(&self, key: &PublicKey) -> Result<()> {
        let bytes =
            Self::signing_bytes(&self.signer, self.issued_at, &self.nonce, &self.payload)?;
        keys::verify(&bytes, &self.signature, key)
    }

    /// Reject envelopes issued further than `max_skew_secs` from `now`.
    pub fn check_freshness(&self, now: i64, max_skew_secs: u64) -> Result<()> {
        if self.issued_at.abs_diff(now) > max_skew_secs {
            tracing::warn!(
                signer = %self.signer,
                issued_at = self.issued_at,
                now,
                "Envelope outside replay window"
            );
            return Err(ControllerError::InvalidSignature);
        }
        Ok(())
    }

    /// Parse the payload. Only call this after [`verify`](Self::verify) succeeded.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_str(&self.payload)
            .map_err(|e| ControllerError::MalformedEnvelope(format!("payload: {}", e)))
    }

    /// Verify freshness and signature, then parse the payload.
    pub fn open<T: DeserializeOwned>(&self, key: &PublicKey, max_skew_secs: u64) -> Result<T> {
        self.check_freshness(Utc::now().timestamp(), max_skew_secs)?;
        self.verify(key)?;
        self.decode()
    }

    /// Parse an envelope from a request or response body.
    pub fn from_slice(body: &[u8]) -> Result<Self> {
        serde_json::from_slice(body).map_err(|e| ControllerError::MalformedEnvelope(e.to_string()))
    }
}

fn fresh_nonce() -> String {
    let mut bytes = [0u8; NONCE_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}
