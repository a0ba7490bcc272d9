//! SIWA verification pipeline.
//!
//! Steps run strictly in order and stop at the first failure:
//!
//! 1. decode the message
//! 2. recover the EIP-191 signer and match it to the message address
//! 3. bind the message to the expected domain
//! 4. spend the nonce (only after the signature checks out, so forged
//!    submissions cannot burn a victim's nonce)
//! 5. enforce `Expiration Time` / `Not Before`
//! 6. in on-chain mode, check registry ownership with an ERC-1271 fallback
//!
//! Every step returns `Result<_, Failure>`; [`Verifier::verify_at`] is the
//! only place a failure turns into a [`VerificationResult`].

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::chain::{ChainClients, ERC1271_MAGIC_VALUE};
use crate::crypto::{addresses_equal, eip191_hash, normalize_address, recover_address, signature_bytes};
use crate::error::{ChainError, SiwaErrorCode};
use crate::message::{AgentId, AgentRegistry, SiwaMessage};
use crate::nonce::NonceCheck;

pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(5);

/// Whether registry ownership was checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerificationKind {
    Offline,
    Onchain,
}

impl VerificationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Offline => "offline",
            Self::Onchain => "onchain",
        }
    }
}

/// How the registry owner accepted the signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignerType {
    /// Signer is the registry owner.
    Eoa,
    /// Registry owner is a contract that accepted the signature via ERC-1271.
    Sca,
}

impl SignerType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Eoa => "eoa",
            Self::Sca => "sca",
        }
    }
}

/// Offline trusts the signature alone; on-chain also checks registry ownership.
#[derive(Clone)]
pub enum VerificationMode {
    Offline,
    Onchain(Arc<dyn ChainClients>),
}

impl VerificationMode {
    pub fn kind(&self) -> VerificationKind {
        match self {
            Self::Offline => VerificationKind::Offline,
            Self::Onchain(_) => VerificationKind::Onchain,
        }
    }
}

impl std::fmt::Debug for VerificationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.kind().as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationResult {
    pub valid: bool,
    pub address: String,
    pub agent_id: AgentId,
    pub agent_registry: String,
    pub chain_id: u64,
    pub verified: VerificationKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signer_type: Option<SignerType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<SiwaErrorCode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl VerificationResult {
    fn rejected(message: Option<&SiwaMessage>, kind: VerificationKind, failure: Failure) -> Self {
        Self {
            valid: false,
            address: message
                .and_then(|m| normalize_address(&m.address))
                .unwrap_or_default(),
            agent_id: message.map(|m| m.agent_id).unwrap_or_default(),
            agent_registry: message
                .map(|m| m.agent_registry.to_string())
                .unwrap_or_default(),
            chain_id: message.map(|m| m.chain_id).unwrap_or_default(),
            verified: kind,
            signer_type: None,
            code: Some(failure.code),
            error: Some(failure.detail),
        }
    }
}

#[derive(Debug, Clone)]
pub struct VerifierConfig {
    /// Exact, case-sensitive `domain` every message must carry.
    pub expected_domain: String,
    /// Bound on every nonce-store and RPC round trip.
    pub call_timeout: Duration,
    /// When set, messages naming any other registry are rejected.
    pub allowed_registries: Option<Vec<AgentRegistry>>,
}

impl VerifierConfig {
    pub fn new(expected_domain: impl Into<String>) -> Self {
        Self {
            expected_domain: expected_domain.into(),
            call_timeout: DEFAULT_CALL_TIMEOUT,
            allowed_registries: None,
        }
    }
}

/// First failing step.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Failure {
    code: SiwaErrorCode,
    detail: String,
}

impl Failure {
    fn new(code: SiwaErrorCode, detail: impl Into<String>) -> Self {
        Self {
            code,
            detail: detail.into(),
        }
    }
}

struct Accepted {
    address: String,
    signer_type: Option<SignerType>,
}

pub struct Verifier {
    config: VerifierConfig,
    nonces: NonceCheck,
    mode: VerificationMode,
}

impl Verifier {
    pub fn new(config: VerifierConfig, nonces: NonceCheck, mode: VerificationMode) -> Self {
        Self {
            config,
            nonces,
            mode,
        }
    }

    pub fn mode(&self) -> VerificationKind {
        self.mode.kind()
    }

    pub fn expected_domain(&self) -> &str {
        &self.config.expected_domain
    }

    pub async fn verify(&self, message: &str, signature: &str) -> VerificationResult {
        self.verify_at(message, signature, Utc::now()).await
    }

    /// Run the pipeline with `now` as the clock for the time-window and
    /// stateless nonce checks.
    pub async fn verify_at(
        &self,
        message: &str,
        signature: &str,
        now: DateTime<Utc>,
    ) -> VerificationResult {
        let kind = self.mode.kind();
        let parsed = match SiwaMessage::parse(message) {
            Ok(parsed) => parsed,
            Err(e) => {
                let failure = Failure::new(e.code(), e.to_string());
                tracing::debug!(code = %failure.code, "SIWA message rejected: {}", failure.detail);
                return VerificationResult::rejected(None, kind, failure);
            }
        };

        match self.run(&parsed, message, signature, now).await {
            Ok(accepted) => {
                tracing::info!(
                    address = %accepted.address,
                    agent_id = %parsed.agent_id,
                    chain_id = parsed.chain_id,
                    verified = kind.as_str(),
                    "SIWA sign-in verified"
                );
                VerificationResult {
                    valid: true,
                    address: accepted.address,
                    agent_id: parsed.agent_id,
                    agent_registry: parsed.agent_registry.to_string(),
                    chain_id: parsed.chain_id,
                    verified: kind,
                    signer_type: accepted.signer_type,
                    code: None,
                    error: None,
                }
            }
            Err(failure) => {
                tracing::debug!(
                    code = %failure.code,
                    agent_id = %parsed.agent_id,
                    "SIWA sign-in rejected: {}",
                    failure.detail
                );
                VerificationResult::rejected(Some(&parsed), kind, failure)
            }
        }
    }

    async fn run(
        &self,
        parsed: &SiwaMessage,
        raw: &str,
        signature: &str,
        now: DateTime<Utc>,
    ) -> Result<Accepted, Failure> {
        let recovered = self.check_signature(parsed, raw, signature)?;
        self.check_domain(parsed)?;
        self.check_nonce(&parsed.nonce, now).await?;
        check_time_window(parsed, now)?;
        self.check_registry_allowed(&parsed.agent_registry)?;

        let signer_type = match &self.mode {
            VerificationMode::Offline => None,
            VerificationMode::Onchain(clients) => Some(
                self.check_ownership(clients.as_ref(), parsed, raw, signature, &recovered)
                    .await?,
            ),
        };

        Ok(Accepted {
            address: recovered,
            signer_type,
        })
    }

    fn check_signature(
        &self,
        parsed: &SiwaMessage,
        raw: &str,
        signature: &str,
    ) -> Result<String, Failure> {
        let recovered = recover_address(raw, signature).map_err(|e| {
            Failure::new(SiwaErrorCode::VerificationFailed, format!("invalid signature: {e}"))
        })?;
        if !addresses_equal(&recovered, &parsed.address) {
            return Err(Failure::new(
                SiwaErrorCode::VerificationFailed,
                format!(
                    "signature recovered {recovered}, expected {}",
                    parsed.address.to_ascii_lowercase()
                ),
            ));
        }
        Ok(recovered)
    }

    fn check_domain(&self, parsed: &SiwaMessage) -> Result<(), Failure> {
        if parsed.domain != self.config.expected_domain {
            return Err(Failure::new(
                SiwaErrorCode::DomainMismatch,
                format!(
                    "domain mismatch: expected {}, got {}",
                    self.config.expected_domain, parsed.domain
                ),
            ));
        }
        Ok(())
    }

    async fn check_nonce(&self, nonce: &str, now: DateTime<Utc>) -> Result<(), Failure> {
        match self.bounded("nonce check", self.nonces.check(nonce, now)).await? {
            Ok(true) => Ok(()),
            Ok(false) => Err(Failure::new(
                SiwaErrorCode::InvalidNonce,
                "nonce is unknown, expired, or already used",
            )),
            Err(e) => {
                tracing::warn!("Nonce store failure during verification: {}", e);
                Err(Failure::new(
                    SiwaErrorCode::VerificationFailed,
                    format!("nonce store unavailable: {e}"),
                ))
            }
        }
    }

    fn check_registry_allowed(&self, registry: &AgentRegistry) -> Result<(), Failure> {
        match &self.config.allowed_registries {
            Some(allowed) if !allowed.iter().any(|r| r.same_as(registry)) => Err(Failure::new(
                SiwaErrorCode::InvalidRegistryFormat,
                format!("agent registry {registry} is not accepted by this server"),
            )),
            _ => Ok(()),
        }
    }

    async fn check_ownership(
        &self,
        clients: &dyn ChainClients,
        parsed: &SiwaMessage,
        raw: &str,
        signature: &str,
        recovered: &str,
    ) -> Result<SignerType, Failure> {
        let registry = &parsed.agent_registry;
        let reader = clients
            .reader(registry.chain_id)
            .await
            .map_err(|e| Failure::new(e.code(), e.to_string()))?;

        let owner = match self
            .bounded("ownerOf", reader.owner_of(&registry.normalized_address(), parsed.agent_id))
            .await?
        {
            Ok(owner) => owner,
            Err(ChainError::Reverted(_) | ChainError::EmptyReturnData) => {
                return Err(Failure::new(
                    SiwaErrorCode::NotRegistered,
                    format!("agent {} is not registered in {registry}", parsed.agent_id),
                ));
            }
            Err(e) => return Err(chain_failure("ownerOf", e)),
        };

        if addresses_equal(&owner, recovered) {
            return Ok(SignerType::Eoa);
        }

        // Owner may be a smart-contract account that vouches for this signer.
        let digest = eip191_hash(raw.as_bytes());
        let signature = signature_bytes(signature).map_err(|e| {
            Failure::new(SiwaErrorCode::VerificationFailed, format!("invalid signature: {e}"))
        })?;
        match self
            .bounded("isValidSignature", reader.is_valid_signature(&owner, digest, &signature))
            .await?
        {
            Ok(magic) if magic == ERC1271_MAGIC_VALUE => Ok(SignerType::Sca),
            Ok(_) | Err(ChainError::Reverted(_) | ChainError::EmptyReturnData) => {
                Err(Failure::new(
                    SiwaErrorCode::NotRegistered,
                    format!(
                        "signer {recovered} is not the owner of agent {} (owner {owner})",
                        parsed.agent_id
                    ),
                ))
            }
            Err(e) => Err(chain_failure("isValidSignature", e)),
        }
    }

    /// Race `fut` against the call deadline; the loser is dropped.
    async fn bounded<T>(&self, what: &str, fut: impl Future<Output = T>) -> Result<T, Failure> {
        tokio::time::timeout(self.config.call_timeout, fut)
            .await
            .map_err(|_| {
                tracing::warn!(call = what, timeout = ?self.config.call_timeout, "Verification call timed out");
                Failure::new(
                    SiwaErrorCode::VerificationFailed,
                    format!("{what} timed out after {:?}", self.config.call_timeout),
                )
            })
    }
}

fn check_time_window(parsed: &SiwaMessage, now: DateTime<Utc>) -> Result<(), Failure> {
    if let Some(expires) = parsed.expiration_time {
        if now >= expires {
            return Err(Failure::new(SiwaErrorCode::Expired, "message expired"));
        }
    }
    if let Some(not_before) = parsed.not_before {
        if now < not_before {
            return Err(Failure::new(
                SiwaErrorCode::NotYetValid,
                "message is not yet valid (not before)",
            ));
        }
    }
    Ok(())
}

fn chain_failure(call: &str, error: ChainError) -> Failure {
    tracing::warn!(call, "On-chain verification call failed: {}", error);
    let detail = match error {
        ChainError::Timeout => format!("{call} timed out"),
        other => format!("{call} call failed: {other}"),
    };
    Failure::new(SiwaErrorCode::VerificationFailed, detail)
}
