//! Self-authenticating nonces for deployments without shared state.
//!
//! Token layout before base64url: `random(16) || expiry_ms(8, BE) || tag(16)`
//! where `tag` is HMAC-SHA256 over the first 24 bytes, truncated. Validation
//! needs only the secret, so a token stays acceptable until it expires; use a
//! [`NonceStore`](crate::nonce::NonceStore) when single use matters.

use base64::Engine;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::error::NonceStoreError;

type HmacSha256 = Hmac<Sha256>;

pub const MIN_NONCE_SECRET_LEN: usize = 32;

const RANDOM_LEN: usize = 16;
const EXPIRY_LEN: usize = 8;
const TAG_LEN: usize = 16;
const TOKEN_LEN: usize = RANDOM_LEN + EXPIRY_LEN + TAG_LEN;
const DOMAIN_TAG: &[u8] = b"siwa-nonce-v1";

pub struct HmacNonce {
    mac: HmacSha256,
}

impl HmacNonce {
    pub fn new(secret: impl Into<String>) -> Result<Self, NonceStoreError> {
        let secret: String = secret.into();
        if secret.len() < MIN_NONCE_SECRET_LEN {
            return Err(NonceStoreError::Config(format!(
                "nonce secret must be at least {MIN_NONCE_SECRET_LEN} bytes"
            )));
        }
        let mac = <HmacSha256 as Mac>::new_from_slice(secret.as_bytes())
            .map_err(|e| NonceStoreError::Config(format!("invalid nonce secret: {e}")))?;
        Ok(Self { mac })
    }

    fn tag(&self, body: &[u8]) -> [u8; TAG_LEN] {
        let mut mac = self.mac.clone();
        mac.update(DOMAIN_TAG);
        mac.update(body);
        let full = mac.finalize().into_bytes();
        let mut tag = [0u8; TAG_LEN];
        tag.copy_from_slice(&full[..TAG_LEN]);
        tag
    }

    /// Mint a token valid until `expires_at`.
    pub fn mint(&self, expires_at: DateTime<Utc>) -> String {
        let mut token = [0u8; TOKEN_LEN];
        rand::thread_rng().fill_bytes(&mut token[..RANDOM_LEN]);
        let expiry = u64::try_from(expires_at.timestamp_millis()).unwrap_or(0);
        token[RANDOM_LEN..RANDOM_LEN + EXPIRY_LEN].copy_from_slice(&expiry.to_be_bytes());
        let tag = self.tag(&token[..RANDOM_LEN + EXPIRY_LEN]);
        token[RANDOM_LEN + EXPIRY_LEN..].copy_from_slice(&tag);
        base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(token)
    }

    pub fn verify(&self, token: &str) -> bool {
        self.verify_at(token, Utc::now())
    }

    /// `true` when the token carries a valid tag and `now` is before its expiry.
    pub fn verify_at(&self, token: &str, now: DateTime<Utc>) -> bool {
        let Ok(bytes) = base64::engine::general_purpose::URL_SAFE_NO_PAD.decode(token) else {
            return false;
        };
        if bytes.len() != TOKEN_LEN {
            return false;
        }
        let (body, tag) = bytes.split_at(RANDOM_LEN + EXPIRY_LEN);
        let expected = self.tag(body);
        if !bool::from(expected.as_slice().ct_eq(tag)) {
            return false;
        }
        let mut expiry = [0u8; EXPIRY_LEN];
        expiry.copy_from_slice(&body[RANDOM_LEN..]);
        let expiry_ms = u64::from_be_bytes(expiry);
        let now_ms = u64::try_from(now.timestamp_millis()).unwrap_or(u64::MAX);
        now_ms < expiry_ms
    }
}

impl std::fmt::Debug for HmacNonce {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HmacNonce").finish_non_exhaustive()
    }
}
