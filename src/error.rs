//! Error types for the SIWA verification core.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level error type for the crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Message error: {0}")]
    Message(#[from] MessageError),

    #[error("Signature error: {0}")]
    Signature(#[from] SignatureError),

    #[error("Nonce store error: {0}")]
    NonceStore(#[from] NonceStoreError),

    #[error("Chain error: {0}")]
    Chain(#[from] ChainError),

    #[error("Resolver error: {0}")]
    Resolver(#[from] ResolverError),

    #[error("Receipt error: {0}")]
    Receipt(#[from] ReceiptError),

    #[error("Signer error: {0}")]
    Signer(#[from] SignerError),

    #[error("Service error: {0}")]
    Service(#[from] ServiceError),

    #[error("Server error: {0}")]
    Server(String),
}

/// Wire-level error taxonomy surfaced in verification results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SiwaErrorCode {
    ParseError,
    VerificationFailed,
    DomainMismatch,
    InvalidNonce,
    Expired,
    NotYetValid,
    InvalidRegistryFormat,
    NotRegistered,
    UnsupportedChain,
}

impl SiwaErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ParseError => "PARSE_ERROR",
            Self::VerificationFailed => "VERIFICATION_FAILED",
            Self::DomainMismatch => "DOMAIN_MISMATCH",
            Self::InvalidNonce => "INVALID_NONCE",
            Self::Expired => "EXPIRED",
            Self::NotYetValid => "NOT_YET_VALID",
            Self::InvalidRegistryFormat => "INVALID_REGISTRY_FORMAT",
            Self::NotRegistered => "NOT_REGISTERED",
            Self::UnsupportedChain => "UNSUPPORTED_CHAIN",
        }
    }

    /// HTTP status the transport layer should answer with.
    ///
    /// `NOT_REGISTERED` is the only 403: the caller holds a valid key but must
    /// register the agent. Malformed input is 400, bad credentials 401.
    pub fn http_status(self) -> u16 {
        match self {
            Self::NotRegistered => 403,
            Self::ParseError | Self::InvalidRegistryFormat | Self::UnsupportedChain => 400,
            Self::VerificationFailed
            | Self::DomainMismatch
            | Self::InvalidNonce
            | Self::Expired
            | Self::NotYetValid => 401,
        }
    }
}

impl std::fmt::Display for SiwaErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Message decoding and validation errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MessageError {
    #[error("SIWA message is empty")]
    Empty,

    #[error("invalid SIWA header: expected '<domain> wants you to sign in with your Agent account:'")]
    InvalidHeader,

    #[error("invalid SIWA address: {0}")]
    InvalidAddress(String),

    #[error("malformed SIWA message: {0}")]
    Malformed(String),

    #[error("missing required SIWA field: {0}")]
    MissingField(&'static str),

    #[error("duplicate SIWA field: {0}")]
    DuplicateField(String),

    #[error("unknown SIWA field: {0}")]
    UnknownField(String),

    #[error("invalid SIWA field {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("unsupported SIWA version: expected 1, got {0}")]
    UnsupportedVersion(String),

    #[error("invalid agent registry '{value}': {reason}")]
    InvalidRegistry { value: String, reason: String },

    #[error("chain id {chain_id} does not match agent registry chain {registry_chain_id}")]
    ChainIdMismatch {
        chain_id: u64,
        registry_chain_id: u64,
    },
}

impl MessageError {
    /// Registry problems carry their own code; everything else is a parse error.
    pub fn code(&self) -> SiwaErrorCode {
        match self {
            Self::InvalidRegistry { .. } | Self::ChainIdMismatch { .. } => {
                SiwaErrorCode::InvalidRegistryFormat
            }
            _ => SiwaErrorCode::ParseError,
        }
    }
}

/// Signature decoding and recovery errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SignatureError {
    #[error("invalid hex: {0}")]
    InvalidHex(String),

    #[error("signature must decode to 65 bytes, got {0}")]
    InvalidLength(usize),

    #[error("signature recovery id must be 0/1 or 27/28, got {0}")]
    InvalidRecoveryId(u8),

    #[error("invalid ECDSA signature bytes: {0}")]
    InvalidSignature(String),

    #[error("failed recovering signer from signature: {0}")]
    RecoveryFailed(String),

    #[error("invalid private key: {0}")]
    InvalidKey(String),
}

/// Nonce backend failures. Logical outcomes (collision, replay) are `Ok(false)`.
#[derive(Debug, thiserror::Error)]
pub enum NonceStoreError {
    #[error("nonce backend unreachable: {0}")]
    Unavailable(String),

    #[error("nonce backend returned HTTP {status}: {body}")]
    Backend { status: u16, body: String },

    #[error("nonce backend response could not be decoded: {0}")]
    InvalidResponse(String),

    #[error("nonce backend call timed out after {0:?}")]
    Timeout(Duration),

    #[error("invalid nonce store configuration: {0}")]
    Config(String),

    #[error("failed to allocate a unique nonce after {0} attempts")]
    Exhausted(u32),
}

/// Failures of read-only contract calls.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChainError {
    #[error("RPC transport failed: {0}")]
    Transport(String),

    #[error("RPC call timed out")]
    Timeout,

    #[error("contract call reverted: {0}")]
    Reverted(String),

    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("contract call returned no data")]
    EmptyReturnData,

    #[error("invalid RPC response: {0}")]
    InvalidResponse(String),
}

/// Client resolver failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolverError {
    #[error("unsupported chain {chain_id}; known chains: {known:?}")]
    UnsupportedChain { chain_id: u64, known: Vec<u64> },

    #[error("chain {chain_id} is not in the allow-list {allowed:?}")]
    ChainNotAllowed { chain_id: u64, allowed: Vec<u64> },

    #[error("invalid RPC endpoint for chain {chain_id}: {reason}")]
    InvalidEndpoint { chain_id: u64, reason: String },
}

impl ResolverError {
    pub fn code(&self) -> SiwaErrorCode {
        SiwaErrorCode::UnsupportedChain
    }
}

/// Receipt issue/validation errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReceiptError {
    #[error("cannot issue a receipt for a failed verification")]
    NotVerified,

    #[error("receipt secret must be at least {min} bytes")]
    WeakSecret { min: usize },

    #[error("receipt TTL is zero or out of range")]
    InvalidTtl,

    #[error("malformed receipt: {0}")]
    Malformed(String),

    #[error("receipt signature mismatch")]
    BadSignature,

    #[error("receipt expired")]
    Expired,
}

/// Agent-side signing errors.
#[derive(Debug, thiserror::Error)]
pub enum SignerError {
    #[error("signer address {signer} does not match message address {message}")]
    AddressMismatch { signer: String, message: String },

    #[error("signer does not support raw message signing")]
    RawSigningUnsupported,

    #[error("signing failed: {0}")]
    SigningFailed(String),

    #[error("invalid message: {0}")]
    InvalidMessage(#[from] MessageError),

    #[error("invalid signing input: {0}")]
    Signature(#[from] SignatureError),
}

/// Failures of the service facade that are not verification outcomes.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("invalid request: {0}")]
    InvalidRequest(#[from] MessageError),

    #[error(transparent)]
    NonceStore(#[from] NonceStoreError),

    #[error(transparent)]
    Receipt(#[from] ReceiptError),
}

impl ServiceError {
    /// Status code for the transport layer.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::InvalidRequest(_) => 400,
            Self::NonceStore(NonceStoreError::Config(_)) => 500,
            Self::NonceStore(_) => 503,
            Self::Receipt(
                ReceiptError::Malformed(_) | ReceiptError::BadSignature | ReceiptError::Expired,
            ) => 401,
            Self::Receipt(_) => 500,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
