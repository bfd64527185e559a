//! Detached signature verification seam.
//!
//! Key management stays outside the store: the verifier receives the raw
//! public key bytes alongside the message, nothing more.

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use ed25519_dalek::{Signature, VerifyingKey};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{PolicyError, PolicyResult};

/// The signed envelope as carried in the policy submodel element.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SignedPolicy {
    /// The policy document as raw JSON; signed in canonical form.
    pub payload: Value,
    /// Detached 64-byte Ed25519 signature, base64-encoded.
    pub signature_b64: String,
    /// Identifier of the signing key, for rotation bookkeeping.
    pub key_id: String,
}

impl SignedPolicy {
    /// Decodes the signature into its raw 64 bytes.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::Unverified`] when the field is not valid
    /// base64 or has the wrong length.
    pub fn signature_bytes(&self) -> PolicyResult<[u8; 64]> {
        let decoded = BASE64
            .decode(&self.signature_b64)
            .map_err(|err| PolicyError::Unverified {
                reason: format!("signature is not valid base64: {err}"),
            })?;
        decoded
            .try_into()
            .map_err(|_| PolicyError::Unverified {
                reason: "signature must be exactly 64 bytes".into(),
            })
    }
}

/// Minimal verification interface injected into the store.
pub trait SignatureVerifier: Send + Sync {
    /// Returns `true` when `signature` is a valid signature of `message`
    /// under `public_key`.
    fn verify(&self, message: &[u8], signature: &[u8; 64], public_key: &[u8; 32]) -> bool;
}

/// Ed25519 implementation backed by `ed25519-dalek` strict verification.
#[derive(Clone, Copy, Debug, Default)]
pub struct Ed25519Verifier;

impl SignatureVerifier for Ed25519Verifier {
    fn verify(&self, message: &[u8], signature: &[u8; 64], public_key: &[u8; 32]) -> bool {
        let Ok(key) = VerifyingKey::from_bytes(public_key) else {
            return false;
        };
        let signature = Signature::from_bytes(signature);
        key.verify_strict(message, &signature).is_ok()
    }
}
