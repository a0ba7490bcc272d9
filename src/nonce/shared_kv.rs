//! Nonce store over a shared Redis-like key-value service.
//!
//! `issue` is `SET key outstanding NX PX <ttl>`; `consume` is
//! `SET key consumed XX KEEPTTL GET`, which succeeds only when the prior
//! value was `outstanding`. Both are single atomic commands on the server,
//! and the consumed marker keeps the original TTL so the nonce cannot be
//! reissued before it would have expired anyway.

use std::error::Error as _;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use crate::error::NonceStoreError;
use crate::nonce::{NonceStore, nonce_key};

const OUTSTANDING: &str = "outstanding";
const CONSUMED: &str = "consumed";

/// Minimal atomic primitives the shared store needs.
#[async_trait]
pub trait SharedKv: Send + Sync {
    /// `SET key value NX PX ttl`. `true` when the key was written.
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, NonceStoreError>;

    /// `SET key value XX KEEPTTL GET`. Returns the previous value, or `None`
    /// when the key did not exist (in which case nothing was written).
    async fn replace_existing(
        &self,
        key: &str,
        value: &str,
    ) -> Result<Option<String>, NonceStoreError>;
}

pub struct SharedKvNonceStore<K> {
    kv: K,
}

impl<K: SharedKv> SharedKvNonceStore<K> {
    pub fn new(kv: K) -> Self {
        Self { kv }
    }
}

#[async_trait]
impl<K: SharedKv> NonceStore for SharedKvNonceStore<K> {
    async fn issue(&self, nonce: &str, ttl: Duration) -> Result<bool, NonceStoreError> {
        self.kv.set_if_absent(&nonce_key(nonce), OUTSTANDING, ttl).await
    }

    async fn consume(&self, nonce: &str) -> Result<bool, NonceStoreError> {
        let previous = self.kv.replace_existing(&nonce_key(nonce), CONSUMED).await?;
        Ok(previous.as_deref() == Some(OUTSTANDING))
    }
}

/// Upstash Redis over its REST interface.
pub struct UpstashRedisKv {
    client: reqwest::Client,
    url: String,
    token: SecretString,
    timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct UpstashReply {
    #[serde(default)]
    result: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<String>,
}

impl UpstashRedisKv {
    pub fn new(
        url: impl Into<String>,
        token: SecretString,
        timeout: Duration,
    ) -> Result<Self, NonceStoreError> {
        let url = url.into().trim_end_matches('/').to_string();
        url::Url::parse(&url)
            .map_err(|e| NonceStoreError::Config(format!("invalid Upstash URL: {e}")))?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| NonceStoreError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            url,
            token,
            timeout,
        })
    }

    async fn command(&self, args: &[&str]) -> Result<Option<serde_json::Value>, NonceStoreError> {
        let response = self
            .client
            .post(&self.url)
            .bearer_auth(self.token.expose_secret())
            .json(&args)
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

        let reply: UpstashReply = response
            .json()
            .await
            .map_err(|e| NonceStoreError::InvalidResponse(e.to_string()))?;
        if let Some(error) = reply.error {
            return Err(NonceStoreError::Backend {
                status: status.as_u16(),
                body: error,
            });
        }
        Ok(reply.result.filter(|v| !v.is_null()))
    }
}

#[async_trait]
impl SharedKv for UpstashRedisKv {
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, NonceStoreError> {
        let px = ttl.as_millis().max(1).to_string();
        let result = self.command(&["SET", key, value, "NX", "PX", &px]).await?;
        match result {
            Some(serde_json::Value::String(s)) if s == "OK" => Ok(true),
            None => Ok(false),
            Some(other) => Err(NonceStoreError::InvalidResponse(format!(
                "unexpected SET NX reply: {other}"
            ))),
        }
    }

    async fn replace_existing(
        &self,
        key: &str,
        value: &str,
    ) -> Result<Option<String>, NonceStoreError> {
        let result = self
            .command(&["SET", key, value, "XX", "KEEPTTL", "GET"])
            .await?;
        match result {
            Some(serde_json::Value::String(previous)) => Ok(Some(previous)),
            None => Ok(None),
            Some(other) => Err(NonceStoreError::InvalidResponse(format!(
                "unexpected SET XX GET reply: {other}"
            ))),
        }
    }
}

pub(crate) fn classify_transport_error(error: &reqwest::Error, timeout: Duration) -> NonceStoreError {
    if error.is_timeout() {
        return NonceStoreError::Timeout(timeout);
    }
    let mut detail = error.to_string();
    let mut source = error.source();
    while let Some(err) = source {
        detail = format!("{detail}: {err}");
        source = err.source();
    }
    NonceStoreError::Unavailable(detail)
}
