//! Service-to-service HMAC request signing for the Operation Service.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the base64 HMAC-SHA256 signature.
pub const SIGNATURE_HEADER: &str = "X-TwinOps-Signature";
/// Header carrying the signing timestamp (epoch seconds).
pub const TIMESTAMP_HEADER: &str = "X-TwinOps-Timestamp";

/// Signature material for one request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignatureHeaders {
    /// Base64-encoded signature value.
    pub signature: String,
    /// Epoch-seconds timestamp that was signed.
    pub timestamp: String,
}

/// Signs requests as HMAC-SHA256 over the newline-joined timestamp, method,
/// path, and body.
#[derive(Clone)]
pub struct RequestSigner {
    secret: Vec<u8>,
    ttl: Duration,
}

impl RequestSigner {
    /// Creates a signer with the shared secret and acceptance window.
    #[must_use]
    pub fn new(secret: impl Into<Vec<u8>>, ttl: Duration) -> Self {
        Self {
            secret: secret.into(),
            ttl,
        }
    }

    /// Produces headers for the supplied request, stamped with the current
    /// time.
    #[must_use]
    pub fn sign(&self, method: &str, path: &str, body: &[u8]) -> SignatureHeaders {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
            .to_string();
        let signature = self.sign_at(&timestamp, method, path, body);
        SignatureHeaders {
            signature,
            timestamp,
        }
    }

    fn sign_at(&self, timestamp: &str, method: &str, path: &str, body: &[u8]) -> String {
        let mut mac =
            HmacSha256::new_from_slice(&self.secret).expect("hmac accepts any key length");
        mac.update(timestamp.as_bytes());
        mac.update(b"\n");
        mac.update(method.as_bytes());
        mac.update(b"\n");
        mac.update(path.as_bytes());
        mac.update(b"\n");
        mac.update(body);
        BASE64.encode(mac.finalize().into_bytes())
    }

    /// Verifies a received signature, rejecting timestamps outside the
    /// acceptance window. Exposed for the receiving side and for tests.
    #[must_use]
    pub fn verify(
        &self,
        timestamp: &str,
        method: &str,
        path: &str,
        body: &[u8],
        signature_b64: &str,
    ) -> bool {
        let Ok(signed_at) = timestamp.parse::<u64>() else {
            return false;
        };
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        if now.saturating_sub(signed_at) > self.ttl.as_secs() {
            return false;
        }

        let Ok(provided) = BASE64.decode(signature_b64) else {
            return false;
        };
        let mut mac =
            HmacSha256::new_from_slice(&self.secret).expect("hmac accepts any key length");
        mac.update(timestamp.as_bytes());
        mac.update(b"\n");
        mac.update(method.as_bytes());
        mac.update(b"\n");
        mac.update(path.as_bytes());
        mac.update(b"\n");
        mac.update(body);
        mac.verify_slice(&provided).is_ok()
    }
}

impl std::fmt::Debug for RequestSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestSigner")
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}
