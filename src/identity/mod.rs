//! Identity and signing.
//!
//! - [`keys`]: key pairs, `sign` and `verify`
//! - [`envelope`]: [`SignedEnvelope`], the signed wrapper around every wire payload
//!
//! Nothing here holds shared mutable state; every function is a pure
//! cryptographic computation.

pub mod envelope;
pub mod keys;

pub use envelope::SignedEnvelope;
pub use keys::{generate_keypair, sign, verify, KeyError, KeyPair, PrivateKey, PublicKey, Signature};
