//! Server-side facade: nonce issuance, verification with receipts, and
//! receipt checks, wired from [`SiwaConfig`].

use std::sync::Arc;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::chain::{ClientResolver, ResolverConfig};
use crate::config::{
    MAX_NONCE_TTL_SECS, MAX_RECEIPT_TTL_SECS, NonceBackendConfig, SiwaConfig,
    VerificationModeKind,
};
use crate::crypto::normalize_address;
use crate::error::{ConfigError, Error, MessageError, ReceiptError, ServiceError};
use crate::message::{AgentId, AgentRegistry, format_timestamp};
use crate::nonce::{
    CloudflareKv, EdgeKvNonceStore, HmacNonce, InMemoryNonceStore, NonceCheck, NonceStore,
    SharedKvNonceStore, UpstashRedisKv,
};
use crate::receipt::{MIN_RECEIPT_SECRET_LEN, ReceiptPayload, issue_receipt, validate_receipt};
use crate::response::SiwaResponse;
use crate::verify::{
    DEFAULT_CALL_TIMEOUT, VerificationKind, VerificationMode, Verifier, VerifierConfig,
};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NonceRequest {
    pub address: String,
    #[serde(default)]
    pub agent_id: Option<AgentId>,
    #[serde(default)]
    pub agent_registry: Option<String>,
}

/// Everything an agent needs to build its message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NonceResponse {
    pub nonce: String,
    pub issued_at: String,
    pub expiration_time: String,
    pub domain: String,
    pub uri: String,
    pub chain_id: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VerifyRequest {
    pub message: String,
    pub signature: String,
}

/// Non-backend service settings.
#[derive(Debug, Clone)]
pub struct ServiceOptions {
    pub domain: String,
    pub uri: String,
    pub default_chain_id: u64,
    pub nonce_ttl: Duration,
    pub receipt_ttl: Duration,
    pub receipt_secret: SecretString,
    pub call_timeout: Duration,
    pub allowed_registries: Option<Vec<AgentRegistry>>,
}

impl ServiceOptions {
    pub fn new(domain: impl Into<String>, receipt_secret: SecretString) -> Self {
        let domain = domain.into();
        Self {
            uri: format!("https://{domain}/verify"),
            domain,
            default_chain_id: crate::settings::DEFAULT_CHAIN_ID,
            nonce_ttl: Duration::from_secs(crate::settings::DEFAULT_NONCE_TTL_SECS),
            receipt_ttl: Duration::from_secs(crate::settings::DEFAULT_RECEIPT_TTL_SECS),
            receipt_secret,
            call_timeout: DEFAULT_CALL_TIMEOUT,
            allowed_registries: None,
        }
    }
}

pub struct SiwaService {
    options: ServiceOptions,
    nonces: NonceCheck,
    verifier: Verifier,
}

impl SiwaService {
    pub fn new(
        options: ServiceOptions,
        nonces: NonceCheck,
        mode: VerificationMode,
    ) -> Result<Self, ConfigError> {
        if options.receipt_secret.expose_secret().len() < MIN_RECEIPT_SECRET_LEN {
            return Err(ConfigError::InvalidValue {
                key: "SIWA_RECEIPT_SECRET".to_string(),
                message: format!("must be at least {MIN_RECEIPT_SECRET_LEN} bytes"),
            });
        }
        if options.nonce_ttl.is_zero() || options.receipt_ttl.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "ttl".to_string(),
                message: "nonce and receipt TTLs must be > 0".to_string(),
            });
        }
        if options.nonce_ttl > Duration::from_secs(MAX_NONCE_TTL_SECS) {
            return Err(ConfigError::InvalidValue {
                key: "SIWA_NONCE_TTL_SECS".to_string(),
                message: format!("must be at most {MAX_NONCE_TTL_SECS} seconds"),
            });
        }
        if options.receipt_ttl > Duration::from_secs(MAX_RECEIPT_TTL_SECS) {
            return Err(ConfigError::InvalidValue {
                key: "SIWA_RECEIPT_TTL_SECS".to_string(),
                message: format!("must be at most {MAX_RECEIPT_TTL_SECS} seconds"),
            });
        }

        let verifier = Verifier::new(
            VerifierConfig {
                expected_domain: options.domain.clone(),
                call_timeout: options.call_timeout,
                allowed_registries: options.allowed_registries.clone(),
            },
            nonces.clone(),
            mode,
        );
        Ok(Self {
            options,
            nonces,
            verifier,
        })
    }

    /// Build the configured nonce backend and verification mode.
    ///
    /// Must run inside a tokio runtime when the in-memory backend is used,
    /// since it starts a background sweeper.
    pub fn from_config(config: &SiwaConfig) -> Result<Self, Error> {
        let nonces = build_nonce_check(config)?;
        let mode = match config.verification_mode {
            VerificationModeKind::Offline => VerificationMode::Offline,
            VerificationModeKind::Onchain => {
                VerificationMode::Onchain(Arc::new(ClientResolver::new(ResolverConfig {
                    overrides: config.rpc_urls.clone(),
                    allowed_chains: config.allowed_chains.clone(),
                    timeout: config.rpc_timeout,
                })))
            }
        };

        let options = ServiceOptions {
            domain: config.domain.clone(),
            uri: config.uri.clone(),
            default_chain_id: config.default_chain_id,
            nonce_ttl: config.nonce_ttl,
            receipt_ttl: config.receipt_ttl,
            receipt_secret: config.receipt_secret.clone(),
            call_timeout: config.rpc_timeout,
            allowed_registries: config.allowed_registries.clone(),
        };
        tracing::info!(
            domain = %config.domain,
            mode = mode.kind().as_str(),
            nonces = nonces.kind(),
            "SIWA service configured"
        );
        Ok(Self::new(options, nonces, mode)?)
    }

    pub fn domain(&self) -> &str {
        &self.options.domain
    }

    pub fn mode(&self) -> VerificationKind {
        self.verifier.mode()
    }

    pub fn nonce_kind(&self) -> &'static str {
        self.nonces.kind()
    }

    /// Issue a nonce for `request.address`.
    ///
    /// When the request names a registry, its chain id is returned; otherwise
    /// the configured default.
    pub async fn request_nonce(&self, request: NonceRequest) -> Result<NonceResponse, ServiceError> {
        if normalize_address(&request.address).is_none() {
            return Err(MessageError::InvalidAddress(request.address).into());
        }
        let chain_id = match request.agent_registry.as_deref() {
            Some(raw) => AgentRegistry::parse(raw)?.chain_id,
            None => self.options.default_chain_id,
        };

        let issued = self.nonces.issue(self.options.nonce_ttl).await?;
        tracing::debug!(
            address = %request.address,
            agent_id = ?request.agent_id,
            chain_id,
            "Issued nonce"
        );

        Ok(NonceResponse {
            nonce: issued.nonce,
            issued_at: format_timestamp(&issued.issued_at),
            expiration_time: format_timestamp(&issued.expires_at),
            domain: self.options.domain.clone(),
            uri: self.options.uri.clone(),
            chain_id,
        })
    }

    /// Verify a signed message; a successful result carries a receipt.
    pub async fn verify(&self, request: VerifyRequest) -> Result<SiwaResponse, ServiceError> {
        let result = self
            .verifier
            .verify(&request.message, &request.signature)
            .await;
        let response = SiwaResponse::from_result(&result);
        if !result.valid {
            return Ok(response);
        }

        let issued = issue_receipt(
            &result,
            self.options.receipt_secret.expose_secret().as_bytes(),
            self.options.receipt_ttl,
        )?;
        Ok(response.with_receipt(issued))
    }

    pub fn validate_receipt(&self, receipt: &str) -> Result<ReceiptPayload, ReceiptError> {
        validate_receipt(receipt, self.options.receipt_secret.expose_secret().as_bytes())
    }
}

fn build_nonce_check(config: &SiwaConfig) -> Result<NonceCheck, Error> {
    let check = match &config.nonce_backend {
        NonceBackendConfig::Memory => {
            let store = Arc::new(InMemoryNonceStore::new());
            if tokio::runtime::Handle::try_current().is_ok() {
                let _ = store.spawn_sweeper(config.nonce_ttl);
            }
            let store: Arc<dyn NonceStore> = store;
            NonceCheck::Store(store)
        }
        NonceBackendConfig::Stateless { secret } => {
            NonceCheck::stateless(HmacNonce::new(secret.expose_secret())?)
        }
        NonceBackendConfig::Upstash { url, token } => NonceCheck::store(SharedKvNonceStore::new(
            UpstashRedisKv::new(url.clone(), token.clone(), config.rpc_timeout)?,
        )),
        NonceBackendConfig::Cloudflare {
            api_base_url,
            account_id,
            namespace_id,
            api_token,
        } => NonceCheck::store(EdgeKvNonceStore::new(CloudflareKv::new(
            api_base_url.clone(),
            account_id.clone(),
            namespace_id.clone(),
            api_token.clone(),
            config.rpc_timeout,
        )?)),
    };
    Ok(check)
}
