//! Nonce replay protection.
//!
//! Every backend implements the two-method [`NonceStore`] contract:
//! `issue` records a nonce as outstanding, `consume` flips it to spent at
//! most once. [`NonceCheck`] is what the verifier actually holds: either a
//! store-backed consume or a stateless HMAC-nonce check.

pub mod edge_kv;
pub mod memory;
pub mod shared_kv;
pub mod stateless;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::NonceStoreError;
use crate::message::generate_nonce;

pub use self::edge_kv::{CloudflareKv, EdgeKv, EdgeKvNonceStore};
pub use self::memory::InMemoryNonceStore;
pub use self::shared_kv::{SharedKv, SharedKvNonceStore, UpstashRedisKv};
pub use self::stateless::HmacNonce;

/// Key prefix used by the key-value backends.
pub const NONCE_KEY_PREFIX: &str = "siwa:nonce:";

const ISSUE_ATTEMPTS: u32 = 3;

/// Replay-protection ledger.
///
/// Logical outcomes are booleans; `Err` is reserved for backend failures.
#[async_trait]
pub trait NonceStore: Send + Sync {
    /// Record `nonce` as outstanding for `ttl`. Returns `false`, with no side
    /// effect, when the nonce is already known and unexpired.
    async fn issue(&self, nonce: &str, ttl: Duration) -> Result<bool, NonceStoreError>;

    /// Atomically spend an outstanding, unexpired nonce. Returns `false` when
    /// it is unknown, already consumed, or expired.
    async fn consume(&self, nonce: &str) -> Result<bool, NonceStoreError>;
}

/// Nonce minted for a sign-in attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedNonce {
    pub nonce: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Nonce validation strategy handed to the verifier.
#[derive(Clone)]
pub enum NonceCheck {
    /// Single-use nonces tracked by a store.
    Store(Arc<dyn NonceStore>),
    /// Self-authenticating nonces; replayable until expiry.
    Stateless(Arc<HmacNonce>),
}

impl NonceCheck {
    pub fn store(store: impl NonceStore + 'static) -> Self {
        Self::Store(Arc::new(store))
    }

    pub fn stateless(nonces: HmacNonce) -> Self {
        Self::Stateless(Arc::new(nonces))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Store(_) => "store",
            Self::Stateless(_) => "stateless",
        }
    }

    /// Mint and record a fresh nonce.
    pub async fn issue(&self, ttl: Duration) -> Result<IssuedNonce, NonceStoreError> {
        if ttl.is_zero() {
            return Err(NonceStoreError::Config(
                "nonce TTL must be greater than zero".to_string(),
            ));
        }
        let issued_at = Utc::now();
        let expires_at = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| issued_at.checked_add_signed(ttl))
            .ok_or_else(|| NonceStoreError::Config(format!("nonce TTL {ttl:?} is out of range")))?;

        match self {
            Self::Store(store) => {
                for _ in 0..ISSUE_ATTEMPTS {
                    let nonce = generate_nonce();
                    if store.issue(&nonce, ttl).await? {
                        return Ok(IssuedNonce {
                            nonce,
                            issued_at,
                            expires_at,
                        });
                    }
                    tracing::warn!("Nonce collision on issue, retrying");
                }
                Err(NonceStoreError::Exhausted(ISSUE_ATTEMPTS))
            }
            Self::Stateless(hmac) => Ok(IssuedNonce {
                nonce: hmac.mint(expires_at),
                issued_at,
                expires_at,
            }),
        }
    }

    /// Validate (and, for stores, spend) a nonce taken from a signed message.
    ///
    /// `now` decides stateless expiry. Stores expire entries on their own
    /// clock.
    pub async fn check(&self, nonce: &str, now: DateTime<Utc>) -> Result<bool, NonceStoreError> {
        match self {
            Self::Store(store) => store.consume(nonce).await,
            Self::Stateless(hmac) => Ok(hmac.verify_at(nonce, now)),
        }
    }
}

impl std::fmt::Debug for NonceCheck {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("NonceCheck").field(&self.kind()).finish()
    }
}

pub(crate) fn nonce_key(nonce: &str) -> String {
    format!("{NONCE_KEY_PREFIX}{nonce}")
}

#[cfg(test)]
mod tests {
    use super::*;

    struct AlwaysTaken;

    #[async_trait]
    impl NonceStore for AlwaysTaken {
        async fn issue(&self, _nonce: &str, _ttl: Duration) -> Result<bool, NonceStoreError> {
            Ok(false)
        }

        async fn consume(&self, _nonce: &str) -> Result<bool, NonceStoreError> {
            Ok(false)
        }
    }

    #[tokio::test]
    async fn store_check_issues_then_consumes_once() {
        let check = NonceCheck::store(InMemoryNonceStore::new());
        let issued = check.issue(Duration::from_secs(60)).await.expect("issue");
        assert_eq!(issued.expires_at - issued.issued_at, chrono::Duration::seconds(60));

        assert!(check.check(&issued.nonce, Utc::now()).await.expect("first"));
        assert!(!check.check(&issued.nonce, Utc::now()).await.expect("second"));
    }

    #[tokio::test]
    async fn issue_gives_up_after_repeated_collisions() {
        let check = NonceCheck::store(AlwaysTaken);
        let err = check.issue(Duration::from_secs(60)).await.expect_err("exhausted");
        assert!(matches!(err, NonceStoreError::Exhausted(3)));
    }

    #[tokio::test]
    async fn zero_ttl_is_rejected() {
        let check = NonceCheck::store(InMemoryNonceStore::new());
        assert!(matches!(
            check.issue(Duration::ZERO).await,
            Err(NonceStoreError::Config(_))
        ));
    }

    #[tokio::test]
    async fn oversized_ttl_is_a_config_error() {
        let store = Arc::new(InMemoryNonceStore::new());
        let check = NonceCheck::Store(store.clone());
        assert!(matches!(
            check.issue(Duration::from_secs(10_000_000_000_000)).await,
            Err(NonceStoreError::Config(_))
        ));
        assert!(store.is_empty().await);

        let hmac = HmacNonce::new("0123456789abcdef0123456789abcdef").expect("secret");
        assert!(matches!(
            NonceCheck::stateless(hmac).issue(Duration::MAX).await,
            Err(NonceStoreError::Config(_))
        ));
    }

    #[tokio::test]
    async fn stateless_check_accepts_minted_nonces() {
        let hmac = HmacNonce::new("0123456789abcdef0123456789abcdef").expect("secret");
        let check = NonceCheck::stateless(hmac);
        assert_eq!(check.kind(), "stateless");
        let issued = check.issue(Duration::from_secs(60)).await.expect("issue");
        assert!(check.check(&issued.nonce, issued.issued_at).await.expect("check"));
        assert!(!check.check(&issued.nonce, issued.expires_at).await.expect("check"));
        assert!(!check.check("not-a-minted-nonce", issued.issued_at).await.expect("check"));
    }
}
