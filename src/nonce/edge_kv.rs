//! Nonce store over an eventually-consistent edge key-value service.
//!
//! Edge KV offers no compare-and-set, so `issue` and `consume` are
//! get-then-put. Two concurrent consumers of the same nonce can both read
//! `outstanding` before either write lands. The window is accepted: nonces
//! carry 128 bits and are bound to a signature, so a race requires replaying
//! the exact signed message within the propagation delay.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::error::NonceStoreError;
use crate::nonce::shared_kv::classify_transport_error;
use crate::nonce::{NonceStore, nonce_key};

pub const DEFAULT_CLOUDFLARE_API_BASE_URL: &str = "https://api.cloudflare.com/client/v4";

/// Cloudflare rejects expirations closer than this.
const MIN_EDGE_EXPIRATION_SECS: i64 = 60;

/// Plain get/put edge storage.
#[async_trait]
pub trait EdgeKv: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, NonceStoreError>;

    /// Write `value`, letting the backend drop it at or after `expires_at`.
    async fn put(
        &self,
        key: &str,
        value: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<(), NonceStoreError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum RecordState {
    Outstanding,
    Consumed,
}

/// Stored value. `expires_at` is authoritative; backend expiry is only cleanup.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NonceRecord {
    state: RecordState,
    /// Unix milliseconds.
    expires_at: i64,
}

pub struct EdgeKvNonceStore<K> {
    kv: K,
}

impl<K: EdgeKv> EdgeKvNonceStore<K> {
    pub fn new(kv: K) -> Self {
        Self { kv }
    }

    async fn load(&self, key: &str) -> Result<Option<NonceRecord>, NonceStoreError> {
        let Some(raw) = self.kv.get(key).await? else {
            return Ok(None);
        };
        match serde_json::from_str::<NonceRecord>(&raw) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                tracing::warn!(key, "Ignoring undecodable nonce record: {}", e);
                Ok(None)
            }
        }
    }

    async fn store(&self, key: &str, record: &NonceRecord) -> Result<(), NonceStoreError> {
        let raw = serde_json::to_string(record)
            .map_err(|e| NonceStoreError::InvalidResponse(e.to_string()))?;
        let expires_at = DateTime::<Utc>::from_timestamp_millis(record.expires_at)
            .ok_or_else(|| NonceStoreError::Config("nonce expiry out of range".to_string()))?;
        self.kv.put(key, &raw, expires_at).await
    }
}

#[async_trait]
impl<K: EdgeKv> NonceStore for EdgeKvNonceStore<K> {
    async fn issue(&self, nonce: &str, ttl: Duration) -> Result<bool, NonceStoreError> {
        let key = nonce_key(nonce);
        let now = Utc::now().timestamp_millis();
        if let Some(existing) = self.load(&key).await? {
            if existing.expires_at > now {
                return Ok(false);
            }
        }
        let ttl_ms = i64::try_from(ttl.as_millis())
            .map_err(|_| NonceStoreError::Config("nonce TTL out of range".to_string()))?;
        let record = NonceRecord {
            state: RecordState::Outstanding,
            expires_at: now.saturating_add(ttl_ms),
        };
        self.store(&key, &record).await?;
        Ok(true)
    }

    async fn consume(&self, nonce: &str) -> Result<bool, NonceStoreError> {
        let key = nonce_key(nonce);
        let now = Utc::now().timestamp_millis();
        let Some(record) = self.load(&key).await? else {
            return Ok(false);
        };
        if record.state != RecordState::Outstanding || record.expires_at <= now {
            return Ok(false);
        }
        let spent = NonceRecord {
            state: RecordState::Consumed,
            expires_at: record.expires_at,
        };
        self.store(&key, &spent).await?;
        Ok(true)
    }
}

/// Cloudflare Workers KV through the account REST API.
pub struct CloudflareKv {
    client: reqwest::Client,
    base_url: String,
    account_id: String,
    namespace_id: String,
    api_token: SecretString,
    timeout: Duration,
}

impl CloudflareKv {
    pub fn new(
        base_url: Option<String>,
        account_id: impl Into<String>,
        namespace_id: impl Into<String>,
        api_token: SecretString,
        timeout: Duration,
    ) -> Result<Self, NonceStoreError> {
        let base_url = base_url
            .unwrap_or_else(|| DEFAULT_CLOUDFLARE_API_BASE_URL.to_string())
            .trim_end_matches('/')
            .to_string();
        url::Url::parse(&base_url)
            .map_err(|e| NonceStoreError::Config(format!("invalid Cloudflare API URL: {e}")))?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| NonceStoreError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url,
            account_id: account_id.into(),
            namespace_id: namespace_id.into(),
            api_token,
            timeout,
        })
    }

    fn value_url(&self, key: &str) -> String {
        format!(
            "{}/accounts/{}/storage/kv/namespaces/{}/values/{}",
            self.base_url,
            urlencoding::encode(&self.account_id),
            urlencoding::encode(&self.namespace_id),
            urlencoding::encode(key)
        )
    }
}

/// Absolute expiration in Unix seconds, pushed out to the backend minimum.
fn edge_expiration(expires_at: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    let wanted = expires_at.timestamp() + i64::from(expires_at.timestamp_subsec_millis() > 0);
    wanted.max(now.timestamp() + MIN_EDGE_EXPIRATION_SECS)
}

#[async_trait]
impl EdgeKv for CloudflareKv {
    async fn get(&self, key: &str) -> Result<Option<String>, NonceStoreError> {
        let response = self
            .client
            .get(self.value_url(key))
            .bearer_auth(self.api_token.expose_secret())
            .send()
            .await
            .map_err(|e| classify_transport_error(&e, self.timeout))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(NonceStoreError::Backend {
                status: status.as_u16(),
                body,
            });
        }
        response
            .text()
            .await
            .map(Some)
            .map_err(|e| NonceStoreError::InvalidResponse(e.to_string()))
    }

    async fn put(
        &self,
        key: &str,
        value: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<(), NonceStoreError> {
        let expiration = edge_expiration(expires_at, Utc::now());
        let response = self
            .client
            .put(self.value_url(key))
            .bearer_auth(self.api_token.expose_secret())
            .query(&[("expiration", expiration)])
            .body(value.to_string())
            .send()
            .await
            .map_err(|e| classify_transport_error(&e, self.timeout))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(NonceStoreError::Backend {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}
