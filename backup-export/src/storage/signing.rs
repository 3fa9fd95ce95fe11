//! HMAC-SHA256 signatures for time-limited retrieval URLs.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::utils::errors::{ExportError, Result};

type HmacSha256 = Hmac<Sha256>;

#[derive(Clone)]
pub struct UrlSigner {
    secret: Vec<u8>,
}

impl UrlSigner {
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        Self {
            secret: secret.as_ref().to_vec(),
        }
    }

    fn mac(&self, bucket: &str, key: &str, expires: i64) -> Result<HmacSha256> {
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|e| ExportError::Config(format!("invalid signing secret: {}", e)))?;
        mac.update(bucket.as_bytes());
        mac.update(b"/");
        mac.update(key.as_bytes());
        mac.update(b"\n");
        mac.update(expires.to_string().as_bytes());
        Ok(mac)
    }

    /// Hex signature over `bucket/key\nexpires`.
    pub fn sign(&self, bucket: &str, key: &str, expires: i64) -> Result<String> {
        let mac = self.mac(bucket, key, expires)?;
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Constant-time check of a signature, rejecting anything expired at `now`.
    pub fn verify(&self, bucket: &str, key: &str, expires: i64, signature: &str, now: i64) -> bool {
        if expires < now {
            return false;
        }
        let Ok(raw) = hex::decode(signature) else {
            return false;
        };
        match self.mac(bucket, key, expires) {
            Ok(mac) => mac.verify_slice(&raw).is_ok(),
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signature_verifies_until_expiry() {
        let signer = UrlSigner::new("s3cret");
        let sig = signer.sign("exports", "a/DOCUMENT.xlsx", 1_000).unwrap();
        assert!(signer.verify("exports", "a/DOCUMENT.xlsx", 1_000, &sig, 999));
        assert!(signer.verify("exports", "a/DOCUMENT.xlsx", 1_000, &sig, 1_000));
        assert!(!signer.verify("exports", "a/DOCUMENT.xlsx", 1_000, &sig, 1_001));
    }

    #[test]
    fn test_tampered_inputs_rejected() {
        let signer = UrlSigner::new("s3cret");
        let sig = signer.sign("exports", "a/DOCUMENT.xlsx", 1_000).unwrap();
        assert!(!signer.verify("exports", "a/ASSETS.zip", 1_000, &sig, 0));
        assert!(!signer.verify("other", "a/DOCUMENT.xlsx", 1_000, &sig, 0));
        assert!(!signer.verify("exports", "a/DOCUMENT.xlsx", 2_000, &sig, 0));
        assert!(!signer.verify("exports", "a/DOCUMENT.xlsx", 1_000, "zz", 0));
        assert!(!UrlSigner::new("other").verify("exports", "a/DOCUMENT.xlsx", 1_000, &sig, 0));
    }
}
