//! Key generation, signing and verification.
//!
//! Keys are secp256k1 with x-only public keys; signatures are BIP-340
//! Schnorr over the SHA-256 digest of the payload bytes.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use secp256k1::{schnorr, All, Keypair, Message, Secp256k1, SecretKey, XOnlyPublicKey, SECP256K1};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;

use crate::error::{ControllerError, Result};

/// Error type for key material issues.
#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("Invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("Invalid private key: {0}")]
    InvalidPrivateKey(String),

    #[error("Invalid signature encoding: {0}")]
    InvalidSignatureEncoding(String),

    #[error("Key file not found: {0}")]
    KeyFileNotFound(PathBuf),

    #[error("Failed to access key file: {0}")]
    IoError(#[from] std::io::Error),
}

/// 32-byte x-only public key, hex encoded on the wire.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PublicKey([u8; 32]);

impl PublicKey {
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    fn to_xonly(self) -> Result<XOnlyPublicKey> {
        XOnlyPublicKey::from_slice(&self.0)
            .map_err(|e| KeyError::InvalidPublicKey(e.to_string()).into())
    }
}

impl FromStr for PublicKey {
    type Err = KeyError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let bytes = hex::decode(s.trim()).map_err(|e| KeyError::InvalidPublicKey(e.to_string()))?;
        // Reject anything that is not a point on the curve up front
        let xonly = XOnlyPublicKey::from_slice(&bytes)
            .map_err(|e| KeyError::InvalidPublicKey(e.to_string()))?;
        Ok(Self(xonly.serialize()))
    }
}

impl TryFrom<String> for PublicKey {
    type Error = KeyError;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PublicKey> for String {
    fn from(key: PublicKey) -> Self {
        key.to_hex()
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.to_hex())
    }
}

/// Secret half of a key pair. Never printed.
#[derive(Clone)]
pub struct PrivateKey(SecretKey);

impl PrivateKey {
    pub fn to_hex(&self) -> String {
        hex::encode(self.0.secret_bytes())
    }
}

impl FromStr for PrivateKey {
    type Err = KeyError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let bytes =
            hex::decode(s.trim()).map_err(|e| KeyError::InvalidPrivateKey(e.to_string()))?;
        SecretKey::from_slice(&bytes)
            .map(Self)
            .map_err(|e| KeyError::InvalidPrivateKey(e.to_string()))
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PrivateKey(<redacted>)")
    }
}

/// 64-byte Schnorr signature, hex encoded on the wire.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Signature([u8; 64]);

impl Signature {
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; 64] {
        &self.0
    }
}

impl FromStr for Signature {
    type Err = KeyError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let bytes = hex::decode(s.trim())
            .map_err(|e| KeyError::InvalidSignatureEncoding(e.to_string()))?;
        let bytes: [u8; 64] = bytes.try_into().map_err(|v: Vec<u8>| {
            KeyError::InvalidSignatureEncoding(format!("expected 64 bytes, got {}", v.len()))
        })?;
        Ok(Self(bytes))
    }
}

impl TryFrom<String> for Signature {
    type Error = KeyError;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Signature> for String {
    fn from(sig: Signature) -> Self {
        sig.to_hex()
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({})", self.to_hex())
    }
}

/// A matching public/private key pair.
#[derive(Clone, Debug)]
pub struct KeyPair {
    public: PublicKey,
    private: PrivateKey,
}

impl KeyPair {
    pub fn from_private(private: PrivateKey) -> Self {
        let (xonly, _parity) = private.0.x_only_public_key(context());
        Self {
            public: PublicKey(xonly.serialize()),
            private,
        }
    }

    pub fn public(&self) -> PublicKey {
        self.public
    }

    pub fn private(&self) -> &PrivateKey {
        &self.private
    }

    /// Load a hex-encoded secret key from `path`.
    pub async fn load(path: &Path) -> std::result::Result<Self, KeyError> {
        if !path.exists() {
            return Err(KeyError::KeyFileNotFound(path.to_path_buf()));
        }
        let contents = fs::read_to_string(path).await?;
        Ok(Self::from_private(contents.parse()?))
    }

    /// Write the secret key to `path` as hex, readable by the owner only.
    pub async fn save(&self, path: &Path) -> std::result::Result<(), KeyError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }
        fs::write(path, format!("{}\n", self.private.to_hex())).await?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await?;
        }
        Ok(())
    }

    /// Load the key at `path`, generating and saving a fresh one if it is missing.
    pub async fn load_or_generate(path: &Path) -> std::result::Result<Self, KeyError> {
        match Self::load(path).await {
            Ok(keys) => Ok(keys),
            Err(KeyError::KeyFileNotFound(_)) => {
                let keys = generate_keypair();
                keys.save(path).await?;
                tracing::info!(path = %path.display(), public_key = %keys.public, "Generated new key pair");
                Ok(keys)
            }
            Err(e) => Err(e),
        }
    }
}

/// The process-wide signing and verification context.
fn context() -> &'static Secp256k1<All> {
    SECP256K1
}

/// Generate a fresh random key pair.
pub fn generate_keypair() -> KeyPair {
    let keypair = Keypair::new(context(), &mut rand::thread_rng());
    KeyPair::from_private(PrivateKey(keypair.secret_key()))
}

fn digest(payload: &[u8]) -> Message {
    let hash: [u8; 32] = Sha256::digest(payload).into();
    Message::from_digest(hash)
}

/// Sign `payload` with `private`.
pub fn sign(payload: &[u8], private: &PrivateKey) -> Signature {
    let keypair = Keypair::from_secret_key(context(), &private.0);
    let sig = context().sign_schnorr_no_aux_rand(&digest(payload), &keypair);
    Signature(sig.serialize())
}

/// Verify that `signature` was produced over exactly `payload` by the owner of `public`.
pub fn verify(payload: &[u8], signature: &Signature, public: &PublicKey) -> Result<()> {
    let sig = schnorr::Signature::from_slice(&signature.0)
        .map_err(|_| ControllerError::InvalidSignature)?;
    let xonly = public.to_xonly()?;

    context()
        .verify_schnorr(&sig, &digest(payload), &xonly)
        .map_err(|_| ControllerError::InvalidSignature)
}
