use chrono::Utc;
use serde_json::json;
use tempfile::TempDir;

use supervaize_controller::identity::{
    generate_keypair, sign, verify, KeyError, KeyPair, PublicKey, SignedEnvelope,
};
use supervaize_controller::ControllerError;

#[test]
fn test_sign_and_verify() {
    let keys = generate_keypair();
    let sig = sign(b"hello", keys.private());
    assert!(verify(b"hello", &sig, &keys.public()).is_ok());
}

#[test]
fn test_signing_is_deterministic() {
    let keys = generate_keypair();
    assert_eq!(sign(b"payload", keys.private()), sign(b"payload", keys.private()));
}

#[test]
fn test_mutated_payload_fails() {
    let keys = generate_keypair();
    let sig = sign(b"transfer 10", keys.private());
    let err = verify(b"transfer 11", &sig, &keys.public()).unwrap_err();
    assert!(matches!(err, ControllerError::InvalidSignature));
}

#[test]
fn test_signature_from_other_key_fails() {
    let alice = generate_keypair();
    let mallory = generate_keypair();
    let sig = sign(b"hello", mallory.private());
    assert!(matches!(
        verify(b"hello", &sig, &alice.public()),
        Err(ControllerError::InvalidSignature)
    ));
}

#[test]
fn test_public_key_hex_roundtrip_and_validation() {
    let keys = generate_keypair();
    let hex = keys.public().to_hex();
    assert_eq!(hex.len(), 64);
    assert_eq!(hex.parse::<PublicKey>().unwrap(), keys.public());

    assert!("not hex".parse::<PublicKey>().is_err());
    assert!("abcd".parse::<PublicKey>().is_err());
}

#[test]
fn test_private_key_debug_is_redacted() {
    let keys = generate_keypair();
    let debug = format!("{:?}", keys);
    assert!(!debug.contains(&keys.private().to_hex()));
}

#[test]
fn test_envelope_seal_and_open() {
    let keys = generate_keypair();
    let envelope = SignedEnvelope::seal(keys.public().to_hex(), &json!({"n": 1}), &keys).unwrap();

    let value: serde_json::Value = envelope.open(&keys.public(), 60).unwrap();
    assert_eq!(value, json!({"n": 1}));
}

#[test]
fn test_envelope_tampered_payload_rejected() {
    let keys = generate_keypair();
    let mut envelope =
        SignedEnvelope::seal(keys.public().to_hex(), &json!({"amount": 1}), &keys).unwrap();
    envelope.payload = r#"{"amount":1000}"#.to_string();

    let err = envelope.open::<serde_json::Value>(&keys.public(), 60).unwrap_err();
    assert!(matches!(err, ControllerError::InvalidSignature));
}

#[test]
fn test_envelope_signer_and_timestamp_are_signed() {
    let keys = generate_keypair();
    let envelope = SignedEnvelope::seal("agent-a", &json!({}), &keys).unwrap();

    let mut other_signer = envelope.clone();
    other_signer.signer = "agent-b".to_string();
    assert!(other_signer.verify(&keys.public()).is_err());

    let mut other_time = envelope.clone();
    other_time.issued_at += 1;
    assert!(other_time.verify(&keys.public()).is_err());

    let mut other_nonce = envelope.clone();
    other_nonce.nonce = "00".repeat(16);
    assert!(other_nonce.verify(&keys.public()).is_err());
}

#[test]
fn test_identical_messages_seal_to_distinct_signatures() {
    let keys = generate_keypair();
    let a = SignedEnvelope::seal_at("c", &json!({"n": 1}), &keys, 1_700_000_000).unwrap();
    let b = SignedEnvelope::seal_at("c", &json!({"n": 1}), &keys, 1_700_000_000).unwrap();

    assert_ne!(a.nonce, b.nonce);
    assert_ne!(a.signature, b.signature);
    assert!(a.verify(&keys.public()).is_ok());
    assert!(b.verify(&keys.public()).is_ok());
}

#[test]
fn test_envelope_outside_replay_window_rejected() {
    let keys = generate_keypair();
    let stale = Utc::now().timestamp() - 3_600;
    let envelope = SignedEnvelope::seal_at("c", &json!({}), &keys, stale).unwrap();

    assert!(envelope.verify(&keys.public()).is_ok());
    assert!(matches!(
        envelope.open::<serde_json::Value>(&keys.public(), 300),
        Err(ControllerError::InvalidSignature)
    ));
}

#[test]
fn test_envelope_from_garbage_is_malformed() {
    assert!(matches!(
        SignedEnvelope::from_slice(b"{not json"),
        Err(ControllerError::MalformedEnvelope(_))
    ));
}

#[test]
fn test_envelope_wire_format() {
    let keys = generate_keypair();
    let envelope = SignedEnvelope::seal_at("c", &json!({"a": 1}), &keys, 1_700_000_000).unwrap();
    let wire = serde_json::to_value(&envelope).unwrap();

    assert_eq!(wire["signer"], "c");
    assert_eq!(wire["issued_at"], 1_700_000_000);
    assert_eq!(wire["nonce"].as_str().unwrap().len(), 32);
    assert_eq!(wire["payload"], r#"{"a":1}"#);
    assert_eq!(wire["signature"].as_str().unwrap().len(), 128);

    let parsed = SignedEnvelope::from_slice(wire.to_string().as_bytes()).unwrap();
    assert_eq!(parsed, envelope);
}

#[tokio::test]
async fn test_key_file_created_then_reloaded() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("keys").join("controller.key");

    let first = KeyPair::load_or_generate(&path).await.unwrap();
    assert!(path.exists());
    let second = KeyPair::load_or_generate(&path).await.unwrap();
    assert_eq!(first.public(), second.public());

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}

#[tokio::test]
async fn test_missing_key_file() {
    let dir = TempDir::new().unwrap();
    let err = KeyPair::load(&dir.path().join("absent.key")).await.unwrap_err();
    assert!(matches!(err, KeyError::KeyFileNotFound(_)));
}

#[tokio::test]
async fn test_corrupt_key_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("bad.key");
    std::fs::write(&path, "zz").unwrap();
    let err = KeyPair::load(&path).await.unwrap_err();
    assert!(matches!(err, KeyError::InvalidPrivateKey(_)));
}
