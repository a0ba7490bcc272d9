//! Stateless session receipts.
//!
//! `base64url(payload JSON) "." base64url(HMAC-SHA256(secret, first segment))`.
//! Nothing is stored server-side: validity is the tag plus `expiresAt`, and
//! there is no revocation short of rotating the secret.

use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::ReceiptError;
use crate::message::AgentId;
use crate::verify::{SignerType, VerificationKind, VerificationResult};

type HmacSha256 = Hmac<Sha256>;

pub const MIN_RECEIPT_SECRET_LEN: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiptPayload {
    pub address: String,
    pub agent_id: AgentId,
    pub agent_registry: String,
    pub chain_id: u64,
    pub verified: VerificationKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signer_type: Option<SignerType>,
    /// Unix milliseconds.
    pub issued_at: i64,
    /// Unix milliseconds; the receipt is invalid from this instant on.
    pub expires_at: i64,
}

impl ReceiptPayload {
    pub fn expires_at_utc(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.expires_at)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedReceipt {
    pub receipt: String,
    pub expires_at: DateTime<Utc>,
}

fn mac_for(secret: &[u8]) -> Result<HmacSha256, ReceiptError> {
    if secret.len() < MIN_RECEIPT_SECRET_LEN {
        return Err(ReceiptError::WeakSecret {
            min: MIN_RECEIPT_SECRET_LEN,
        });
    }
    <HmacSha256 as Mac>::new_from_slice(secret).map_err(|_| ReceiptError::WeakSecret {
        min: MIN_RECEIPT_SECRET_LEN,
    })
}

pub fn issue_receipt(
    result: &VerificationResult,
    secret: &[u8],
    ttl: Duration,
) -> Result<IssuedReceipt, ReceiptError> {
    issue_receipt_at(result, secret, ttl, Utc::now())
}

/// Mint a receipt for a successful verification, expiring at `now + ttl`.
pub fn issue_receipt_at(
    result: &VerificationResult,
    secret: &[u8],
    ttl: Duration,
    now: DateTime<Utc>,
) -> Result<IssuedReceipt, ReceiptError> {
    if !result.valid {
        return Err(ReceiptError::NotVerified);
    }
    if ttl.is_zero() {
        return Err(ReceiptError::InvalidTtl);
    }
    let mut mac = mac_for(secret)?;
    let expires_at = chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| now.checked_add_signed(ttl))
        .ok_or(ReceiptError::InvalidTtl)?;

    let payload = ReceiptPayload {
        address: result.address.clone(),
        agent_id: result.agent_id,
        agent_registry: result.agent_registry.clone(),
        chain_id: result.chain_id,
        verified: result.verified,
        signer_type: result.signer_type,
        issued_at: now.timestamp_millis(),
        expires_at: expires_at.timestamp_millis(),
    };
    let json = serde_json::to_vec(&payload).map_err(|e| ReceiptError::Malformed(e.to_string()))?;
    let body = URL_SAFE_NO_PAD.encode(json);
    mac.update(body.as_bytes());
    let tag = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());

    Ok(IssuedReceipt {
        receipt: format!("{body}.{tag}"),
        expires_at,
    })
}

pub fn validate_receipt(receipt: &str, secret: &[u8]) -> Result<ReceiptPayload, ReceiptError> {
    validate_receipt_at(receipt, secret, Utc::now())
}

/// Check the tag in constant time, then the expiry.
pub fn validate_receipt_at(
    receipt: &str,
    secret: &[u8],
    now: DateTime<Utc>,
) -> Result<ReceiptPayload, ReceiptError> {
    let mut mac = mac_for(secret)?;
    let (body, tag) = receipt
        .trim()
        .split_once('.')
        .ok_or_else(|| ReceiptError::Malformed("expected '<payload>.<tag>'".to_string()))?;
    let tag = URL_SAFE_NO_PAD
        .decode(tag)
        .map_err(|e| ReceiptError::Malformed(format!("tag: {e}")))?;

    mac.update(body.as_bytes());
    mac.verify_slice(&tag)
        .map_err(|_| ReceiptError::BadSignature)?;

    let json = URL_SAFE_NO_PAD
        .decode(body)
        .map_err(|e| ReceiptError::Malformed(format!("payload: {e}")))?;
    let payload: ReceiptPayload =
        serde_json::from_slice(&json).map_err(|e| ReceiptError::Malformed(e.to_string()))?;

    if now.timestamp_millis() >= payload.expires_at {
        return Err(ReceiptError::Expired);
    }
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::error::SiwaErrorCode;

    const SECRET: &[u8] = b"receipt-secret-0123456789abcdef0123";

    fn verified() -> VerificationResult {
        VerificationResult {
            valid: true,
            address: "0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266".to_string(),
            agent_id: AgentId::from(7u64),
            agent_registry: "eip155:84532:0x8004AA63c570c570eBF15376c0dB199918BFe9Fb".to_string(),
            chain_id: 84532,
            verified: VerificationKind::Onchain,
            signer_type: Some(SignerType::Eoa),
            code: None,
            error: None,
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).single().expect("time")
    }

    #[test]
    fn receipt_validates_until_expiry() {
        let ttl = Duration::from_secs(3600);
        let issued = issue_receipt_at(&verified(), SECRET, ttl, now()).expect("issue");
        assert_eq!(issued.expires_at, now() + chrono::Duration::hours(1));

        let payload = validate_receipt_at(&issued.receipt, SECRET, now()).expect("valid");
        assert_eq!(
            payload,
            ReceiptPayload {
                address: "0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266".to_string(),
                agent_id: AgentId::from(7u64),
                agent_registry: "eip155:84532:0x8004AA63c570c570eBF15376c0dB199918BFe9Fb"
                    .to_string(),
                chain_id: 84532,
                verified: VerificationKind::Onchain,
                signer_type: Some(SignerType::Eoa),
                issued_at: now().timestamp_millis(),
                expires_at: issued.expires_at.timestamp_millis(),
            }
        );

        let just_before = issued.expires_at - chrono::Duration::milliseconds(1);
        assert!(validate_receipt_at(&issued.receipt, SECRET, just_before).is_ok());
        assert_eq!(
            validate_receipt_at(&issued.receipt, SECRET, issued.expires_at),
            Err(ReceiptError::Expired)
        );
    }

    #[test]
    fn receipt_is_header_safe() {
        let issued =
            issue_receipt_at(&verified(), SECRET, Duration::from_secs(60), now()).expect("issue");
        assert!(
            issued
                .receipt
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        );
        assert_eq!(issued.receipt.matches('.').count(), 1);
    }

    #[test]
    fn wrong_secret_and_tampering_are_rejected() {
        let issued =
            issue_receipt_at(&verified(), SECRET, Duration::from_secs(60), now()).expect("issue");
        assert_eq!(
            validate_receipt_at(&issued.receipt, b"another-secret-0123456789abcdef01", now()),
            Err(ReceiptError::BadSignature)
        );

        let (body, tag) = issued.receipt.split_once('.').expect("dot");
        let mut payload: serde_json::Value =
            serde_json::from_slice(&URL_SAFE_NO_PAD.decode(body).expect("b64")).expect("json");
        payload["agentId"] = serde_json::json!(8);
        let forged_body = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&payload).expect("json"));
        assert_eq!(
            validate_receipt_at(&format!("{forged_body}.{tag}"), SECRET, now()),
            Err(ReceiptError::BadSignature)
        );

        assert!(matches!(
            validate_receipt_at("no-dot-here", SECRET, now()),
            Err(ReceiptError::Malformed(_))
        ));
    }

    #[test]
    fn refuses_to_issue_for_failures_or_weak_config() {
        let mut failed = verified();
        failed.valid = false;
        failed.code = Some(SiwaErrorCode::InvalidNonce);
        assert_eq!(
            issue_receipt_at(&failed, SECRET, Duration::from_secs(60), now()),
            Err(ReceiptError::NotVerified)
        );
        assert_eq!(
            issue_receipt_at(&verified(), b"short", Duration::from_secs(60), now()),
            Err(ReceiptError::WeakSecret { min: 32 })
        );
        assert_eq!(
            issue_receipt_at(&verified(), SECRET, Duration::ZERO, now()),
            Err(ReceiptError::InvalidTtl)
        );
    }

    #[test]
    fn unrepresentable_expiry_is_invalid_ttl() {
        assert_eq!(
            issue_receipt_at(
                &verified(),
                SECRET,
                Duration::from_secs(10_000_000_000_000),
                now()
            ),
            Err(ReceiptError::InvalidTtl)
        );
        assert_eq!(
            issue_receipt(&verified(), SECRET, Duration::from_secs(u64::MAX)),
            Err(ReceiptError::InvalidTtl)
        );
    }
}
