//! SIWA message schema and its canonical text encoding.
//!
//! ```text
//! rp.example wants you to sign in with your Agent account:
//! 0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266
//!
//! Optional statement
//!
//! URI: https://rp.example/verify
//! Version: 1
//! Agent ID: 42
//! Agent Registry: eip155:8453:0x8004a169fb4a3325136eb29fa0ceb6d2e539a432
//! Chain ID: 8453
//! Nonce: kR1x9Yc2Vh0mQe7uTn3sZw
//! Issued At: 2026-01-01T00:00:00Z
//! ```
//!
//! Decoding fails closed: nothing is defaulted, unknown and repeated keys
//! are rejected, and [`SiwaMessage::encode`] is the exact inverse.

use std::fmt;
use std::str::FromStr;

use alloy_primitives::U256;
use base64::Engine;
use chrono::{DateTime, SecondsFormat, Utc};
use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::crypto::normalize_address;
use crate::error::MessageError;

const HEADER_SUFFIX: &str = " wants you to sign in with your Agent account:";
const REGISTRY_NAMESPACE: &str = "eip155";
const MIN_NONCE_LEN: usize = 8;
pub const SIWA_VERSION: &str = "1";

const KEY_URI: &str = "URI";
const KEY_VERSION: &str = "Version";
const KEY_AGENT_ID: &str = "Agent ID";
const KEY_AGENT_REGISTRY: &str = "Agent Registry";
const KEY_CHAIN_ID: &str = "Chain ID";
const KEY_NONCE: &str = "Nonce";
const KEY_ISSUED_AT: &str = "Issued At";
const KEY_EXPIRATION_TIME: &str = "Expiration Time";
const KEY_NOT_BEFORE: &str = "Not Before";
const KEY_REQUEST_ID: &str = "Request ID";

/// `eip155:<chainId>:<contractAddress>` identifying an identity registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AgentRegistry {
    pub chain_id: u64,
    /// Registry contract address as written (comparisons are case-insensitive).
    pub address: String,
}

impl AgentRegistry {
    pub fn new(chain_id: u64, address: impl Into<String>) -> Self {
        Self {
            chain_id,
            address: address.into(),
        }
    }

    pub fn parse(value: &str) -> Result<Self, MessageError> {
        let invalid = |reason: &str| MessageError::InvalidRegistry {
            value: value.to_string(),
            reason: reason.to_string(),
        };

        let segments: Vec<&str> = value.split(':').collect();
        if segments.len() != 3 {
            return Err(invalid("expected exactly three ':'-separated segments"));
        }
        if segments[0] != REGISTRY_NAMESPACE {
            return Err(invalid("namespace must be 'eip155'"));
        }
        let chain = segments[1];
        if chain.is_empty() || !chain.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid("chain id must be a decimal integer"));
        }
        let chain_id = chain
            .parse::<u64>()
            .map_err(|_| invalid("chain id is out of range"))?;
        if normalize_address(segments[2]).is_none() || segments[2] != segments[2].trim() {
            return Err(invalid("contract address must be 0x followed by 40 hex digits"));
        }

        Ok(Self {
            chain_id,
            address: segments[2].to_string(),
        })
    }

    /// Lowercase contract address.
    pub fn normalized_address(&self) -> String {
        self.address.to_ascii_lowercase()
    }

    /// Case-insensitive equality on the contract address.
    pub fn same_as(&self, other: &AgentRegistry) -> bool {
        self.chain_id == other.chain_id
            && self.address.eq_ignore_ascii_case(&other.address)
    }
}

impl fmt::Display for AgentRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{REGISTRY_NAMESPACE}:{}:{}", self.chain_id, self.address)
    }
}

impl FromStr for AgentRegistry {
    type Err = MessageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// ERC-721 token id of an agent in its registry (`uint256`).
///
/// Serializes as a JSON number while it fits in `u64` and as a decimal
/// string beyond that.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AgentId(U256);

impl AgentId {
    pub const fn new(value: U256) -> Self {
        Self(value)
    }

    pub fn as_u256(&self) -> U256 {
        self.0
    }

    pub fn to_u64(&self) -> Option<u64> {
        let limbs = self.0.as_limbs();
        limbs[1..].iter().all(|limb| *limb == 0).then_some(limbs[0])
    }

    /// Decimal digits only; no sign, no `0x`.
    pub fn parse(value: &str) -> Result<Self, MessageError> {
        if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
            return Err(MessageError::InvalidField {
                field: KEY_AGENT_ID,
                reason: format!("expected a non-negative integer, got '{value}'"),
            });
        }
        U256::from_str_radix(value, 10)
            .map(Self)
            .map_err(|e| MessageError::InvalidField {
                field: KEY_AGENT_ID,
                reason: format!("does not fit in uint256: {e}"),
            })
    }
}

impl From<u64> for AgentId {
    fn from(value: u64) -> Self {
        Self(U256::from(value))
    }
}

impl From<U256> for AgentId {
    fn from(value: U256) -> Self {
        Self(value)
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl FromStr for AgentId {
    type Err = MessageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for AgentId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self.to_u64() {
            Some(id) => serializer.serialize_u64(id),
            None => serializer.collect_str(self),
        }
    }
}

impl<'de> Deserialize<'de> for AgentId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Number(u64),
            Text(String),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Number(id) => Ok(Self::from(id)),
            Repr::Text(text) => Self::parse(&text).map_err(serde::de::Error::custom),
        }
    }
}

/// Structured SIWA message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiwaMessage {
    pub domain: String,
    pub address: String,
    pub statement: Option<String>,
    pub uri: String,
    pub version: String,
    pub agent_id: AgentId,
    pub agent_registry: AgentRegistry,
    pub chain_id: u64,
    pub nonce: String,
    pub issued_at: DateTime<Utc>,
    pub expiration_time: Option<DateTime<Utc>>,
    pub not_before: Option<DateTime<Utc>>,
    pub request_id: Option<String>,
}

impl SiwaMessage {
    /// Message with the required fields; `chain_id` is taken from the registry.
    pub fn new(
        domain: impl Into<String>,
        address: impl Into<String>,
        uri: impl Into<String>,
        agent_id: impl Into<AgentId>,
        agent_registry: AgentRegistry,
        nonce: impl Into<String>,
        issued_at: DateTime<Utc>,
    ) -> Self {
        Self {
            domain: domain.into(),
            address: address.into(),
            statement: None,
            uri: uri.into(),
            version: SIWA_VERSION.to_string(),
            agent_id: agent_id.into(),
            chain_id: agent_registry.chain_id,
            agent_registry,
            nonce: nonce.into(),
            issued_at,
            expiration_time: None,
            not_before: None,
            request_id: None,
        }
    }

    pub fn with_statement(mut self, statement: impl Into<String>) -> Self {
        self.statement = Some(statement.into());
        self
    }

    pub fn with_expiration_time(mut self, at: DateTime<Utc>) -> Self {
        self.expiration_time = Some(at);
        self
    }

    pub fn with_not_before(mut self, at: DateTime<Utc>) -> Self {
        self.not_before = Some(at);
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    /// Decode the canonical text form.
    pub fn parse(text: &str) -> Result<Self, MessageError> {
        if text.is_empty() {
            return Err(MessageError::Empty);
        }
        let lines: Vec<&str> = text.split('\n').collect();

        let domain = lines[0]
            .strip_suffix(HEADER_SUFFIX)
            .ok_or(MessageError::InvalidHeader)?;
        validate_domain(domain)?;

        let address = *lines.get(1).ok_or(MessageError::MissingField("address"))?;
        validate_address(address)?;

        if lines.get(2) != Some(&"") {
            return Err(MessageError::Malformed(
                "expected a blank line after the address".to_string(),
            ));
        }

        let mut idx = 3;
        let mut statement_lines = Vec::new();
        loop {
            match lines.get(idx) {
                None => {
                    return Err(MessageError::Malformed(
                        "message ends before the field block".to_string(),
                    ));
                }
                Some(&"") => {
                    idx += 1;
                    break;
                }
                Some(line) => {
                    statement_lines.push(*line);
                    idx += 1;
                }
            }
        }
        let statement = (!statement_lines.is_empty()).then(|| statement_lines.join("\n"));

        let mut fields = FieldBlock::default();
        for line in &lines[idx..] {
            fields.insert(line)?;
        }

        let version = fields.required_non_empty(KEY_VERSION)?;
        if version != SIWA_VERSION {
            return Err(MessageError::UnsupportedVersion(version));
        }
        let uri = fields.required_non_empty(KEY_URI)?;
        validate_uri(&uri)?;

        let agent_id = AgentId::parse(&fields.required(KEY_AGENT_ID)?)?;
        let agent_registry = AgentRegistry::parse(&fields.required(KEY_AGENT_REGISTRY)?)?;
        let chain_id = parse_decimal(KEY_CHAIN_ID, &fields.required(KEY_CHAIN_ID)?)?;
        let nonce = fields.required(KEY_NONCE)?;
        validate_nonce(&nonce)?;
        let issued_at = parse_timestamp(KEY_ISSUED_AT, &fields.required(KEY_ISSUED_AT)?)?;
        let expiration_time = fields
            .optional(KEY_EXPIRATION_TIME)
            .map(|v| parse_timestamp(KEY_EXPIRATION_TIME, &v))
            .transpose()?;
        let not_before = fields
            .optional(KEY_NOT_BEFORE)
            .map(|v| parse_timestamp(KEY_NOT_BEFORE, &v))
            .transpose()?;
        let request_id = fields.optional(KEY_REQUEST_ID);

        let message = Self {
            domain: domain.to_string(),
            address: address.to_string(),
            statement,
            uri,
            version,
            agent_id,
            agent_registry,
            chain_id,
            nonce,
            issued_at,
            expiration_time,
            not_before,
            request_id,
        };
        message.validate()?;
        Ok(message)
    }

    /// Check every invariant `parse` enforces, so `parse(encode(m)) == m`
    /// holds for any message that passes.
    pub fn validate(&self) -> Result<(), MessageError> {
        validate_domain(&self.domain)?;
        validate_address(&self.address)?;
        if let Some(statement) = &self.statement {
            if statement.is_empty() || statement.split('\n').any(str::is_empty) {
                return Err(MessageError::InvalidField {
                    field: "statement",
                    reason: "statement must not be empty or contain blank lines".to_string(),
                });
            }
        }
        validate_uri(&self.uri)?;
        if self.version != SIWA_VERSION {
            return Err(MessageError::UnsupportedVersion(self.version.clone()));
        }
        AgentRegistry::parse(&self.agent_registry.to_string())?;
        if self.chain_id != self.agent_registry.chain_id {
            return Err(MessageError::ChainIdMismatch {
                chain_id: self.chain_id,
                registry_chain_id: self.agent_registry.chain_id,
            });
        }
        validate_nonce(&self.nonce)?;
        if let Some(request_id) = &self.request_id {
            validate_single_line(KEY_REQUEST_ID, request_id)?;
        }
        Ok(())
    }

    /// Canonical text form (lines joined by `\n`, no trailing newline).
    pub fn encode(&self) -> String {
        let mut lines = vec![
            format!("{}{HEADER_SUFFIX}", self.domain),
            self.address.clone(),
            String::new(),
        ];
        if let Some(statement) = &self.statement {
            lines.push(statement.clone());
        }
        lines.push(String::new());
        lines.push(format!("{KEY_URI}: {}", self.uri));
        lines.push(format!("{KEY_VERSION}: {}", self.version));
        lines.push(format!("{KEY_AGENT_ID}: {}", self.agent_id));
        lines.push(format!("{KEY_AGENT_REGISTRY}: {}", self.agent_registry));
        lines.push(format!("{KEY_CHAIN_ID}: {}", self.chain_id));
        lines.push(format!("{KEY_NONCE}: {}", self.nonce));
        lines.push(format!("{KEY_ISSUED_AT}: {}", format_timestamp(&self.issued_at)));
        if let Some(at) = &self.expiration_time {
            lines.push(format!("{KEY_EXPIRATION_TIME}: {}", format_timestamp(at)));
        }
        if let Some(at) = &self.not_before {
            lines.push(format!("{KEY_NOT_BEFORE}: {}", format_timestamp(at)));
        }
        if let Some(request_id) = &self.request_id {
            lines.push(format!("{KEY_REQUEST_ID}: {request_id}"));
        }
        lines.join("\n")
    }
}

impl fmt::Display for SiwaMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

impl FromStr for SiwaMessage {
    type Err = MessageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// 128 random bits, base64url without padding (22 characters).
pub fn generate_nonce() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

pub fn format_timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

#[derive(Default)]
struct FieldBlock {
    entries: Vec<(&'static str, String)>,
}

impl FieldBlock {
    fn insert(&mut self, line: &str) -> Result<(), MessageError> {
        if line.is_empty() {
            return Err(MessageError::Malformed(
                "unexpected blank line in the field block".to_string(),
            ));
        }
        let (key, value) = line
            .split_once(": ")
            .ok_or_else(|| MessageError::Malformed(format!("expected 'Key: value', got '{line}'")))?;
        let key = known_key(key).ok_or_else(|| MessageError::UnknownField(key.to_string()))?;
        if self.entries.iter().any(|(k, _)| *k == key) {
            return Err(MessageError::DuplicateField(key.to_string()));
        }
        self.entries.push((key, value.to_string()));
        Ok(())
    }

    fn optional(&mut self, key: &'static str) -> Option<String> {
        let pos = self.entries.iter().position(|(k, _)| *k == key)?;
        Some(self.entries.swap_remove(pos).1)
    }

    fn required(&mut self, key: &'static str) -> Result<String, MessageError> {
        self.optional(key).ok_or(MessageError::MissingField(key))
    }

    fn required_non_empty(&mut self, key: &'static str) -> Result<String, MessageError> {
        let value = self.required(key)?;
        if value.is_empty() {
            return Err(MessageError::MissingField(key));
        }
        Ok(value)
    }
}

fn known_key(key: &str) -> Option<&'static str> {
    [
        KEY_URI,
        KEY_VERSION,
        KEY_AGENT_ID,
        KEY_AGENT_REGISTRY,
        KEY_CHAIN_ID,
        KEY_NONCE,
        KEY_ISSUED_AT,
        KEY_EXPIRATION_TIME,
        KEY_NOT_BEFORE,
        KEY_REQUEST_ID,
    ]
    .into_iter()
    .find(|k| *k == key)
}

fn validate_domain(domain: &str) -> Result<(), MessageError> {
    if domain.is_empty() || domain.chars().any(char::is_whitespace) {
        return Err(MessageError::InvalidField {
            field: "domain",
            reason: "domain must be non-empty and contain no whitespace".to_string(),
        });
    }
    Ok(())
}

fn validate_address(address: &str) -> Result<(), MessageError> {
    if address != address.trim() || normalize_address(address).is_none() {
        return Err(MessageError::InvalidAddress(address.to_string()));
    }
    Ok(())
}

fn validate_uri(uri: &str) -> Result<(), MessageError> {
    validate_single_line(KEY_URI, uri)?;
    url::Url::parse(uri).map_err(|e| MessageError::InvalidField {
        field: KEY_URI,
        reason: e.to_string(),
    })?;
    Ok(())
}

fn validate_nonce(nonce: &str) -> Result<(), MessageError> {
    if nonce.len() < MIN_NONCE_LEN {
        return Err(MessageError::InvalidField {
            field: KEY_NONCE,
            reason: format!("nonce must be at least {MIN_NONCE_LEN} characters"),
        });
    }
    if !nonce
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
    {
        return Err(MessageError::InvalidField {
            field: KEY_NONCE,
            reason: "nonce may only contain [A-Za-z0-9_-]".to_string(),
        });
    }
    Ok(())
}

fn validate_single_line(field: &'static str, value: &str) -> Result<(), MessageError> {
    if value.is_empty() || value.contains('\n') || value != value.trim() {
        return Err(MessageError::InvalidField {
            field,
            reason: "value must be a non-empty single line without surrounding whitespace"
                .to_string(),
        });
    }
    Ok(())
}

fn parse_decimal(field: &'static str, value: &str) -> Result<u64, MessageError> {
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        return Err(MessageError::InvalidField {
            field,
            reason: format!("expected a non-negative integer, got '{value}'"),
        });
    }
    value.parse::<u64>().map_err(|e| MessageError::InvalidField {
        field,
        reason: e.to_string(),
    })
}

fn parse_timestamp(field: &'static str, value: &str) -> Result<DateTime<Utc>, MessageError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| MessageError::InvalidField {
            field,
            reason: format!("'{value}' is not an RFC 3339 timestamp: {e}"),
        })
}
